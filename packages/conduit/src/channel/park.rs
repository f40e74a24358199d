// suspension and wakeup of blocked channel operations.
//
// a blocked operation is represented by a Waiter, shared (via Arc) between the blocked task and
// every wait record it has linked into a channel. the waiter is resumed either as a parked thread
// (mutex + condvar signal) or as an async task (stored Waker), whichever way the task blocked.

use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering::{AcqRel, Acquire},
        },
        Arc,
    },
    task::Waker,
};


// synchronization signal state
enum State {
    Empty,
    Waiting,
    Notified,
}

// lockable part of a waiter.
struct Signal {
    state: State,
    // waker to wake instead of (or in addition to) the condvar, if blocked asynchronously.
    waker: Option<Waker>,
}

// one blocked task, for the duration of one blocking attempt.
pub(crate) struct Waiter {
    // whether some party has claimed the right to resume this waiter. only relevant when the
    // waiter has records in several queues at once.
    claimed: AtomicBool,
    signal: Mutex<Signal>,
    cond: Condvar,
}

impl Waiter {
    // construct unclaimed and un-notified.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Waiter {
            claimed: AtomicBool::new(false),
            signal: Mutex::new(Signal { state: State::Empty, waker: None }),
            cond: Condvar::new(),
        })
    }

    // try to become the single party allowed to resume this waiter.
    pub(crate) fn try_claim(&self) -> bool {
        self.claimed.compare_exchange(false, true, AcqRel, Acquire).is_ok()
    }

    // whether the waiter has been claimed.
    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Acquire)
    }

    // park the current thread until woken.
    //
    // `commit` runs exactly once, after the waiter is marked as waiting but before the thread
    // blocks. it is used to release channel locks. a wake which happens at any point after
    // `commit` begins is not lost.
    pub(crate) fn park<F: FnOnce()>(&self, commit: F) {
        let mut signal = self.signal.lock();
        if let State::Empty = signal.state {
            signal.state = State::Waiting;
        }
        commit();
        while let State::Waiting = signal.state {
            self.cond.wait(&mut signal);
        }
        signal.state = State::Empty;
    }

    // install the waker of an async task to be woken instead of a parked thread.
    //
    // must be called while the caller still holds the lock of the channel its record is queued
    // on, so that a concurrent waker either sees the new waker or has not claimed yet.
    pub(crate) fn register(&self, waker: &Waker) {
        let mut signal = self.signal.lock();
        match &signal.waker {
            Some(prev) if prev.will_wake(waker) => (),
            _ => signal.waker = Some(waker.clone()),
        }
    }

    // resume the waiter.
    pub(crate) fn wake(&self) {
        let waker = {
            let mut signal = self.signal.lock();
            match signal.state {
                State::Notified => (),
                State::Empty => signal.state = State::Notified,
                State::Waiting => {
                    signal.state = State::Notified;
                    self.cond.notify_one();
                }
            }
            signal.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

// wake, if there is someone to wake. for use after all channel locks are released.
pub(crate) fn wake(waiter: Option<Arc<Waiter>>) {
    if let Some(waiter) = waiter {
        trace!("waking blocked channel operation");
        waiter.wake();
    }
}

// block the current thread forever.
pub(crate) fn park_forever() -> ! {
    trace!("blocking forever on nil channel operation");
    let waiter = Waiter::new();
    loop {
        // nothing holds a reference to this waiter, so this never returns
        waiter.park(|| ());
    }
}

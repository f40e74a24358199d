//! Waiting on several channel operations at once.
//!
//! A [`Select`] lists send and receive cases over any number of channels, possibly of different
//! message types, and completes exactly one of them.
//!
//! ```
//! use conduit::{channel, Select, Selected};
//!
//! let numbers = channel::<u32>(1);
//! let words = channel::<&str>(1);
//! words.send("hello").unwrap();
//!
//! let mut number = None;
//! let mut word = None;
//! let mut sel = Select::new();
//! let number_case = sel.recv(&numbers, &mut number);
//! let word_case = sel.recv(&words, &mut word);
//! match sel.wait().unwrap() {
//!     Selected::Case { index, ok: true } if index == word_case => (),
//!     other => panic!("unexpected {:?} (number case is {})", other, number_case),
//! }
//! assert_eq!(word, Some("hello"));
//! ```
//!
//! The engine locks every involved channel in order of channel address, so selects over
//! overlapping channel sets cannot deadlock each other. If no case can complete immediately and
//! there is no default case, one wait record per case is linked into the channels' wait queues,
//! all sharing one waiter. Whichever counterpart claims the waiter first completes its case; the
//! other records are unlinked when the select wakes up.

use crate::{
    channel::{
        api::Chan,
        core::{Channel, RecvNow, SendNow},
        internal_bug,
        park::{self, Waiter},
        wait_queue::{RecordKey, RecordState, Side},
    },
    error::{ErrorKind, SelectError},
};
use rand::Rng;
use smallvec::SmallVec;
use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};


// outcome of trying to complete a case without blocking, with its channel locked.
enum Polled {
    NotReady,
    // completed. ok is false only for a receive from a closed and drained channel.
    Ready { ok: bool, wake: Option<Arc<Waiter>> },
    // send case on a closed channel.
    SendOnClosed,
}

// outcome of cleaning up a case's record after waking up.
enum Dequeued {
    // record was unlinked without completing.
    Lost,
    // a counterpart completed this case.
    Won { ok: bool },
    // the channel was closed, which says nothing definitive about which case should win.
    Closed,
}

// one channel operation in a select, with the channel's message type erased.
//
// all methods other than chan_id require that the caller holds the lock of the case's channel,
// and that no other reference to the channel's lockable state is live.
trait Case {
    // lock order key. none if the channel is absent.
    fn chan_id(&self) -> Option<usize>;

    unsafe fn lock(&self);

    unsafe fn unlock(&self);

    // pass 1: try to complete without blocking.
    unsafe fn poll(&mut self) -> Polled;

    // pass 2: link a wait record for this case belonging to the waiter.
    unsafe fn enqueue(&mut self, waiter: &Arc<Waiter>);

    // after waking: unlink this case's record if still linked, and release it.
    unsafe fn dequeue(&mut self) -> Dequeued;
}

// send case.
struct SendCase<'a, T> {
    chan: Option<&'a Channel<T>>,
    // holds the message while it is not in a wait record. empty once sent.
    msg: &'a mut Option<T>,
    key: Option<RecordKey>,
}

// receive case.
struct RecvCase<'a, T> {
    chan: Option<&'a Channel<T>>,
    // filled in with the message if this case wins, or cleared if it wins on a closed channel.
    dest: &'a mut Option<T>,
    key: Option<RecordKey>,
}

impl<'a, T> Case for SendCase<'a, T> {
    fn chan_id(&self) -> Option<usize> {
        self.chan.map(Channel::id)
    }

    unsafe fn lock(&self) {
        if let Some(chan) = self.chan {
            chan.raw_lock();
        }
    }

    unsafe fn unlock(&self) {
        if let Some(chan) = self.chan {
            chan.raw_unlock();
        }
    }

    unsafe fn poll(&mut self) -> Polled {
        let Some(chan) = self.chan else { return Polled::NotReady };
        let Some(msg) = self.msg.take() else {
            internal_bug("select send case has no message")
        };
        match chan.locked().send_now(msg) {
            SendNow::Sent(wake) => Polled::Ready { ok: true, wake },
            SendNow::Closed(msg) => {
                *self.msg = Some(msg);
                Polled::SendOnClosed
            }
            SendNow::Full(msg) => {
                *self.msg = Some(msg);
                Polled::NotReady
            }
        }
    }

    unsafe fn enqueue(&mut self, waiter: &Arc<Waiter>) {
        let Some(chan) = self.chan else { return };
        let msg = self.msg.take();
        debug_assert!(msg.is_some());
        self.key = Some(chan.locked().queues.push(Side::Send, Arc::clone(waiter), msg, true));
    }

    unsafe fn dequeue(&mut self) -> Dequeued {
        let (Some(chan), Some(key)) = (self.chan, self.key.take()) else {
            return Dequeued::Lost;
        };
        let queues = &mut chan.locked().queues;
        let state = queues.cancel(key);
        let record = queues.release(key);
        match state {
            RecordState::Claimed => Dequeued::Won { ok: true },
            RecordState::Unlinked | RecordState::ClaimedByClose => {
                // take the message back
                if record.slot.is_none() {
                    internal_bug("unsent select message lost");
                }
                *self.msg = record.slot;
                if state == RecordState::Unlinked {
                    Dequeued::Lost
                } else {
                    Dequeued::Closed
                }
            }
            RecordState::Queued => internal_bug("select record still queued after cancel"),
        }
    }
}

impl<'a, T> Case for RecvCase<'a, T> {
    fn chan_id(&self) -> Option<usize> {
        self.chan.map(Channel::id)
    }

    unsafe fn lock(&self) {
        if let Some(chan) = self.chan {
            chan.raw_lock();
        }
    }

    unsafe fn unlock(&self) {
        if let Some(chan) = self.chan {
            chan.raw_unlock();
        }
    }

    unsafe fn poll(&mut self) -> Polled {
        let Some(chan) = self.chan else { return Polled::NotReady };
        match chan.locked().recv_now() {
            RecvNow::Received(msg, wake) => {
                *self.dest = Some(msg);
                Polled::Ready { ok: true, wake }
            }
            RecvNow::Closed => {
                *self.dest = None;
                Polled::Ready { ok: false, wake: None }
            }
            RecvNow::Empty => Polled::NotReady,
        }
    }

    unsafe fn enqueue(&mut self, waiter: &Arc<Waiter>) {
        let Some(chan) = self.chan else { return };
        self.key = Some(chan.locked().queues.push(Side::Recv, Arc::clone(waiter), None, true));
    }

    unsafe fn dequeue(&mut self) -> Dequeued {
        let (Some(chan), Some(key)) = (self.chan, self.key.take()) else {
            return Dequeued::Lost;
        };
        let queues = &mut chan.locked().queues;
        let state = queues.cancel(key);
        let record = queues.release(key);
        match state {
            RecordState::Claimed => match record.slot {
                Some(msg) => {
                    *self.dest = Some(msg);
                    Dequeued::Won { ok: true }
                }
                None => internal_bug("select receive claimed without a message"),
            },
            RecordState::ClaimedByClose => Dequeued::Closed,
            RecordState::Unlinked => Dequeued::Lost,
            RecordState::Queued => internal_bug("select record still queued after cancel"),
        }
    }
}


/// Outcome of a [`Select`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Selected {
    /// The case with this index completed
    Case {
        /// Index returned when the case was registered
        index: usize,
        /// False only if this is a receive case whose channel was closed and drained
        ok: bool,
    },
    /// No case could complete immediately, so the default case was taken
    Default,
}

/// Builder for a multi-way select over channel operations
///
/// Register cases with [`send`](Self::send) and [`recv`](Self::recv), optionally a
/// [`default`](Self::default), then call [`wait`](Self::wait). Among cases that are ready at the
/// same time, each is equally likely to be chosen.
pub struct Select<'a> {
    cases: SmallVec<[Box<dyn Case + 'a>; 4]>,
    default: bool,
}

impl<'a> Select<'a> {
    /// Construct with no cases
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Select {
            cases: SmallVec::new(),
            default: false,
        }
    }

    /// Add a case sending the message in `msg`, returning the case's index
    ///
    /// `msg` is emptied if and only if this case wins. An absent channel is never ready. Panics if
    /// `msg` is empty.
    pub fn send<T>(&mut self, chan: impl Into<Option<&'a Chan<T>>>, msg: &'a mut Option<T>) -> usize {
        assert!(msg.is_some(), "select send case registered without a message");
        self.cases.push(Box::new(SendCase {
            chan: chan.into().map(|chan| &chan.0),
            msg,
            key: None,
        }));
        self.cases.len() - 1
    }

    /// Add a case receiving into `dest`, returning the case's index
    ///
    /// If this case wins, `dest` is set to the received message, or to `None` if the channel is
    /// closed and drained. An absent channel is never ready.
    pub fn recv<T>(&mut self, chan: impl Into<Option<&'a Chan<T>>>, dest: &'a mut Option<T>) -> usize {
        self.cases.push(Box::new(RecvCase {
            chan: chan.into().map(|chan| &chan.0),
            dest,
            key: None,
        }));
        self.cases.len() - 1
    }

    /// Add a default case, which wins if no other case can complete immediately
    pub fn default(&mut self) -> &mut Self {
        self.default = true;
        self
    }

    /// Number of cases registered, not counting the default case
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Block until exactly one case completes, and return which
    ///
    /// Fails if the chosen case is a send on a closed channel. A select with no default case and
    /// no present channels blocks forever.
    pub fn wait(mut self) -> Result<Selected, SelectError> {
        let n = self.cases.len();

        // uniformly random poll order
        let mut rng = rand::thread_rng();
        let mut poll_order = SmallVec::<[usize; 8]>::with_capacity(n);
        for i in 0..n {
            let j = rng.gen_range(0..=i);
            poll_order.push(i);
            poll_order.swap(i, j);
        }

        // lock order by channel identity, skipping absent channels
        let mut lock_order = (0..n)
            .filter(|&i| self.cases[i].chan_id().is_some())
            .collect::<SmallVec<[usize; 8]>>();
        lock_order.sort_by_key(|&i| self.cases[i].chan_id());

        self.lock_all(&lock_order);
        loop {
            // pass 1: look for a case which can complete immediately
            for &i in &poll_order {
                match unsafe { self.cases[i].poll() } {
                    Polled::NotReady => (),
                    Polled::Ready { ok, wake } => {
                        self.unlock_all(&lock_order);
                        park::wake(wake);
                        trace!(index = i, ok, "select completed without blocking");
                        return Ok(Selected::Case { index: i, ok });
                    }
                    Polled::SendOnClosed => {
                        self.unlock_all(&lock_order);
                        return Err(SelectError { index: i, cause: ErrorKind::SendOnClosed });
                    }
                }
            }
            if self.default {
                self.unlock_all(&lock_order);
                return Ok(Selected::Default);
            }

            // pass 2: enqueue on all channels and park
            let waiter = Waiter::new();
            for &i in &lock_order {
                unsafe { self.cases[i].enqueue(&waiter) };
            }
            trace!(cases = n, "select blocking");
            waiter.park(|| self.unlock_all(&lock_order));

            // clean up every record, finding the one which was claimed
            self.lock_all(&lock_order);
            let mut winner = None;
            let mut closed = false;
            for &i in &lock_order {
                match unsafe { self.cases[i].dequeue() } {
                    Dequeued::Lost => (),
                    Dequeued::Won { ok } => {
                        if winner.is_some() || closed {
                            internal_bug("select claimed more than once");
                        }
                        winner = Some((i, ok));
                    }
                    Dequeued::Closed => {
                        if winner.is_some() || closed {
                            internal_bug("select claimed more than once");
                        }
                        closed = true;
                    }
                }
            }
            if let Some((index, ok)) = winner {
                self.unlock_all(&lock_order);
                trace!(index, ok, "select completed after blocking");
                return Ok(Selected::Case { index, ok });
            }
            if !closed {
                internal_bug("select woken without being claimed");
            }
            // woken by a close. closing is permanent, so polling again with the locks still held
            // is guaranteed to find a ready case.
            trace!("select woken by close, polling again");
        }
    }

    // lock every distinct channel in lock order.
    fn lock_all(&self, lock_order: &[usize]) {
        let mut prev = None;
        for &i in lock_order {
            let id = self.cases[i].chan_id();
            if id != prev {
                // safety: unlocked in unlock_all, and lock order prevents deadlock
                unsafe { self.cases[i].lock() };
                prev = id;
            }
        }
    }

    // unlock every distinct channel in reverse lock order.
    fn unlock_all(&self, lock_order: &[usize]) {
        let mut prev = None;
        for &i in lock_order.iter().rev() {
            let id = self.cases[i].chan_id();
            if id != prev {
                // safety: locked in lock_all
                unsafe { self.cases[i].unlock() };
                prev = id;
            }
        }
    }
}

impl<'a> Debug for Select<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Select")
            .field("cases", &self.cases.len())
            .field("default", &self.default)
            .finish()
    }
}

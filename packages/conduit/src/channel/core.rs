// channel object and the send, recv, and close protocols. the exposed API is a convenience
// wrapper around this.

use super::{
    error::*,
    internal_bug,
    park::{self, Waiter},
    ring::Ring,
    wait_queue::{RecordKey, RecordState, Side, WaitQueues, WaitRecord},
};
use parking_lot::{
    lock_api::RawMutex as _,
    RawMutex,
};
use smallvec::SmallVec;
use std::{
    cell::UnsafeCell,
    mem,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering::{Acquire, Release},
        },
        Arc,
    },
    task::{Context, Poll},
};


// handle to a channel.
pub(crate) struct Channel<T>(Arc<Shared<T>>);

// channel shared state.
struct Shared<T> {
    // guards lockable.
    raw: RawMutex,
    lockable: UnsafeCell<Lockable<T>>,
    // buffer capacity, never changes.
    cap: usize,

    // mirrors of lockable state, stored before every unlock. only ever used as hints.
    closed: AtomicBool,
    len: AtomicUsize,
    send_waiting: AtomicUsize,
    recv_waiting: AtomicUsize,
}

// channel lockable state.
pub(crate) struct Lockable<T> {
    // buffered elements.
    pub(crate) ring: Ring<T>,
    // send and recv queues of blocked operations.
    pub(crate) queues: WaitQueues<T>,
    // once set, never unset.
    pub(crate) closed: bool,
}

// outcome of trying to send without blocking, with the lock held.
pub(crate) enum SendNow<T> {
    // sent. if a blocked receiver was handed the message, it must be woken after unlocking.
    Sent(Option<Arc<Waiter>>),
    // channel is closed.
    Closed(T),
    // sending would block.
    Full(T),
}

// outcome of trying to recv without blocking, with the lock held.
pub(crate) enum RecvNow<T> {
    // received. if a blocked sender was taken from, it must be woken after unlocking.
    Received(T, Option<Arc<Waiter>>),
    // channel is closed and drained.
    Closed,
    // receiving would block.
    Empty,
}

impl<T> Lockable<T> {
    // try to send without blocking.
    pub(crate) fn send_now(&mut self, msg: T) -> SendNow<T> {
        if self.closed {
            return SendNow::Closed(msg);
        }
        if let Some(key) = self.queues.dequeue(Side::Recv, RecordState::Claimed) {
            // hand directly to blocked receiver, bypassing the buffer
            let record = self.queues.get_mut(key);
            debug_assert!(record.slot.is_none());
            record.slot = Some(msg);
            return SendNow::Sent(Some(Arc::clone(&record.waiter)));
        }
        if !self.ring.is_full() {
            self.ring.push(msg);
            return SendNow::Sent(None);
        }
        SendNow::Full(msg)
    }

    // try to recv without blocking.
    pub(crate) fn recv_now(&mut self) -> RecvNow<T> {
        if self.closed {
            if self.ring.len() == 0 {
                return RecvNow::Closed;
            }
        } else if let Some(key) = self.queues.dequeue(Side::Send, RecordState::Claimed) {
            let record = self.queues.get_mut(key);
            let Some(theirs) = record.slot.take() else {
                internal_bug("queued sender has no message")
            };
            let waiter = Arc::clone(&record.waiter);
            let msg = if self.ring.cap() == 0 {
                // unbuffered: take directly from the sender
                theirs
            } else {
                // buffered: a sender only waits when the buffer is full. take the front of the
                // buffer and put the sender's message at the back, which is the same slot.
                self.ring.rotate(theirs)
            };
            return RecvNow::Received(msg, Some(waiter));
        }
        match self.ring.pop() {
            Some(msg) => RecvNow::Received(msg, None),
            None => RecvNow::Empty,
        }
    }

    // try to hand back a message which a cancelled receive was given but never returned, so that
    // it is still received exactly once. it goes to the next blocked receiver if any, otherwise to
    // the front of the buffer, since it was sent before anything buffered now. gives the message
    // back if neither is possible.
    pub(crate) fn redeliver(&mut self, msg: T) -> Result<Option<Arc<Waiter>>, T> {
        if let Some(key) = self.queues.dequeue(Side::Recv, RecordState::Claimed) {
            let record = self.queues.get_mut(key);
            debug_assert!(record.slot.is_none());
            record.slot = Some(msg);
            return Ok(Some(Arc::clone(&record.waiter)));
        }
        if !self.ring.is_full() {
            self.ring.push_front(msg);
            return Ok(None);
        }
        Err(msg)
    }

    // check the structural invariants which hold between operations. aborts if broken.
    pub(crate) fn check_invariants(&self) {
        let len = self.ring.len();
        let cap = self.ring.cap();
        if len > cap {
            internal_bug("channel len exceeds capacity");
        }
        if cap > 0 {
            if len > 0 && !self.queues.is_empty(Side::Recv) {
                internal_bug("receivers waiting on non-empty buffer");
            }
            if len < cap && !self.queues.is_empty(Side::Send) {
                internal_bug("senders waiting on non-full buffer");
            }
        }
        if self.closed && !(self.queues.is_empty(Side::Send) && self.queues.is_empty(Side::Recv)) {
            internal_bug("tasks waiting on closed channel");
        }
    }
}

// lock on a channel.
pub(crate) struct Lock<'a, T> {
    shared: &'a Shared<T>,
}

impl<'a, T> Deref for Lock<'a, T> {
    type Target = Lockable<T>;

    fn deref(&self) -> &Lockable<T> {
        // safety: we hold the lock
        unsafe { &*self.shared.lockable.get() }
    }
}

impl<'a, T> DerefMut for Lock<'a, T> {
    fn deref_mut(&mut self) -> &mut Lockable<T> {
        // safety: we hold the lock, and have the only Lock
        unsafe { &mut *self.shared.lockable.get() }
    }
}

impl<'a, T> Drop for Lock<'a, T> {
    fn drop(&mut self) {
        // safety: we hold the lock
        unsafe { self.shared.unlock(); }
    }
}

impl<T> Shared<T> {
    // publish mirrors and release the lock.
    //
    // UB if the lock is not held.
    unsafe fn unlock(&self) {
        let lockable = &*self.lockable.get();
        if cfg!(debug_assertions) {
            lockable.check_invariants();
        }
        self.closed.store(lockable.closed, Release);
        self.len.store(lockable.ring.len(), Release);
        self.send_waiting.store(lockable.queues.len(Side::Send), Release);
        self.recv_waiting.store(lockable.queues.len(Side::Recv), Release);
        self.raw.unlock();
    }
}

impl<T> Channel<T> {
    // construct empty channel.
    pub(crate) fn new(cap: usize) -> Self {
        Channel(Arc::new(Shared {
            raw: RawMutex::INIT,
            lockable: UnsafeCell::new(Lockable {
                ring: Ring::new(cap),
                queues: WaitQueues::new(),
                closed: false,
            }),
            cap,
            closed: AtomicBool::new(false),
            len: AtomicUsize::new(0),
            send_waiting: AtomicUsize::new(0),
            recv_waiting: AtomicUsize::new(0),
        }))
    }

    // identity of the channel. consistent for the lifetime of any handle, and used as the global
    // lock order.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // lock the channel.
    pub(crate) fn lock(&self) -> Lock<'_, T> {
        self.0.raw.lock();
        Lock { shared: &self.0 }
    }

    // acquire the lock without a guard.
    //
    // the caller must eventually call raw_unlock exactly once.
    pub(crate) unsafe fn raw_lock(&self) {
        self.0.raw.lock();
    }

    // release a lock acquired with raw_lock.
    //
    // UB if the lock is not held by the caller.
    pub(crate) unsafe fn raw_unlock(&self) {
        self.0.unlock();
    }

    // access lockable state while holding a lock acquired with raw_lock.
    //
    // UB if the lock is not held by the caller, or if the returned reference overlaps with
    // another reference to the lockable state.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn locked(&self) -> &mut Lockable<T> {
        &mut *self.0.lockable.get()
    }

    // buffer capacity.
    pub(crate) fn cap(&self) -> usize {
        self.0.cap
    }

    // number of buffered elements, as of the last unlock.
    pub(crate) fn len(&self) -> usize {
        self.0.len.load(Acquire)
    }

    // whether closed, as of the last unlock.
    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Acquire)
    }

    // number of blocked operations on a side, as of the last unlock.
    pub(crate) fn waiting(&self, side: Side) -> usize {
        match side {
            Side::Send => self.0.send_waiting.load(Acquire),
            Side::Recv => self.0.recv_waiting.load(Acquire),
        }
    }

    // whether a send appears unable to proceed without blocking.
    fn looks_full(&self) -> bool {
        if self.cap() == 0 {
            self.waiting(Side::Recv) == 0
        } else {
            self.len() == self.cap()
        }
    }

    // whether a recv appears unable to proceed without blocking.
    fn looks_empty(&self) -> bool {
        if self.cap() == 0 {
            self.waiting(Side::Send) == 0
        } else {
            self.len() == 0
        }
    }

    // send a message, blocking if `block` is true.
    pub(crate) fn send(&self, msg: T, block: bool) -> Result<(), TrySendError<T>> {
        // fast path: fail without locking
        if !block && !self.is_closed() && self.looks_full() {
            return Err(SendError { msg, cause: WouldBlockError.into() });
        }

        let mut lock = self.lock();
        let msg = match lock.send_now(msg) {
            SendNow::Sent(waiter) => {
                drop(lock);
                park::wake(waiter);
                return Ok(());
            }
            SendNow::Closed(msg) => {
                return Err(SendError { msg, cause: ErrorKind::SendOnClosed.into() });
            }
            SendNow::Full(msg) => msg,
        };
        if !block {
            return Err(SendError { msg, cause: WouldBlockError.into() });
        }

        // block
        let waiter = Waiter::new();
        let key = lock.queues.push(Side::Send, Arc::clone(&waiter), Some(msg), false);
        trace!(channel = self.id(), "send blocking");
        waiter.park(move || drop(lock));

        let record = self.lock().queues.release(key);
        finish_send(record).map_err(TrySendError::from)
    }

    // receive a message, blocking if `block` is true. resolves to none if closed and drained.
    pub(crate) fn recv(&self, block: bool) -> Result<Option<T>, WouldBlockError> {
        // fast path: fail without locking. emptiness is read before closedness, since a channel
        // seen empty and then open was still empty when seen open. closing never adds elements.
        if !block && self.looks_empty() && !self.is_closed() {
            return Err(WouldBlockError);
        }

        let mut lock = self.lock();
        match lock.recv_now() {
            RecvNow::Received(msg, waiter) => {
                drop(lock);
                park::wake(waiter);
                return Ok(Some(msg));
            }
            RecvNow::Closed => return Ok(None),
            RecvNow::Empty => (),
        }
        if !block {
            return Err(WouldBlockError);
        }

        // block
        let waiter = Waiter::new();
        let key = lock.queues.push(Side::Recv, Arc::clone(&waiter), None, false);
        trace!(channel = self.id(), "recv blocking");
        waiter.park(move || drop(lock));

        let record = self.lock().queues.release(key);
        Ok(finish_recv(record))
    }

    // close the channel, waking all blocked operations.
    pub(crate) fn close(&self) -> Result<(), ErrorKind> {
        let mut lock = self.lock();
        if lock.closed {
            return Err(ErrorKind::DoubleClose);
        }
        lock.closed = true;

        let mut ready = SmallVec::<[Arc<Waiter>; 8]>::new();
        while let Some(key) = lock.queues.dequeue(Side::Recv, RecordState::ClaimedByClose) {
            let record = lock.queues.get_mut(key);
            record.slot = None;
            ready.push(Arc::clone(&record.waiter));
        }
        while let Some(key) = lock.queues.dequeue(Side::Send, RecordState::ClaimedByClose) {
            // leave the message in the record, for the sender to take back
            ready.push(Arc::clone(&lock.queues.get(key).waiter));
        }
        drop(lock);

        trace!(channel = self.id(), woken = ready.len(), "channel closed");
        for waiter in ready {
            waiter.wake();
        }
        Ok(())
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }
}

// resolve a released send record belonging to a single-channel send.
fn finish_send<T>(mut record: WaitRecord<T>) -> Result<(), SendError<T>> {
    match record.state {
        RecordState::Claimed => Ok(()),
        RecordState::ClaimedByClose => match record.slot.take() {
            Some(msg) => Err(SendError { msg, cause: ErrorKind::SendOnClosed }),
            None => internal_bug("sender woken by close lost its message"),
        },
        RecordState::Queued | RecordState::Unlinked => {
            internal_bug("sender woken without completing")
        }
    }
}

// resolve a released recv record belonging to a single-channel recv.
fn finish_recv<T>(mut record: WaitRecord<T>) -> Option<T> {
    match record.state {
        RecordState::Claimed => match record.slot.take() {
            Some(msg) => Some(msg),
            None => internal_bug("receiver claimed without a message"),
        },
        RecordState::ClaimedByClose => None,
        RecordState::Queued | RecordState::Unlinked => {
            internal_bug("receiver woken without completing")
        }
    }
}

// safety: all access to lockable is guarded by raw, and Waiter is Send + Sync. elements are only
//         ever moved between threads, never shared.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}


// ==== operations for async tasks ====


// state of an async send or recv operation.
enum OpState<M> {
    // not yet attempted. holds the message, for a send.
    Idle(M),
    // record is linked into the channel.
    Parked(RecordKey, Arc<Waiter>),
    // resolved or cancelled.
    Done,
}

// send operation driven by polling. internally locks the channel when dropped.
pub(crate) struct SendOp<T> {
    channel: Channel<T>,
    state: OpState<T>,
}

impl<T> SendOp<T> {
    pub(crate) fn new(channel: Channel<T>, msg: T) -> Self {
        SendOp { channel, state: OpState::Idle(msg) }
    }

    // poll the operation. panics if already resolved or cancelled.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Poll<Result<(), SendError<T>>> {
        match mem::replace(&mut self.state, OpState::Done) {
            OpState::Idle(msg) => {
                let mut lock = self.channel.lock();
                match lock.send_now(msg) {
                    SendNow::Sent(waiter) => {
                        drop(lock);
                        park::wake(waiter);
                        Poll::Ready(Ok(()))
                    }
                    SendNow::Closed(msg) => {
                        Poll::Ready(Err(SendError { msg, cause: ErrorKind::SendOnClosed }))
                    }
                    SendNow::Full(msg) => {
                        let waiter = Waiter::new();
                        waiter.register(cx.waker());
                        let key = lock.queues.push(Side::Send, Arc::clone(&waiter), Some(msg), false);
                        drop(lock);
                        self.state = OpState::Parked(key, waiter);
                        Poll::Pending
                    }
                }
            }
            OpState::Parked(key, waiter) => {
                let mut lock = self.channel.lock();
                if lock.queues.get(key).state == RecordState::Queued {
                    waiter.register(cx.waker());
                    drop(lock);
                    self.state = OpState::Parked(key, waiter);
                    return Poll::Pending;
                }
                let record = lock.queues.release(key);
                drop(lock);
                Poll::Ready(finish_send(record))
            }
            OpState::Done => panic!("send future polled after already resolved or cancelled"),
        }
    }

    // if not already resolved or cancelled, cancel the operation and return the message unless
    // it was already sent.
    pub(crate) fn cancel(&mut self) -> Option<T> {
        match mem::replace(&mut self.state, OpState::Done) {
            OpState::Idle(msg) => Some(msg),
            OpState::Parked(key, _) => {
                let mut lock = self.channel.lock();
                let state = lock.queues.cancel(key);
                let mut record = lock.queues.release(key);
                match state {
                    RecordState::Claimed => None,
                    _ => record.slot.take(),
                }
            }
            OpState::Done => None,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.state, OpState::Done)
    }
}

impl<T> Drop for SendOp<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

// recv operation driven by polling. internally locks the channel when dropped.
pub(crate) struct RecvOp<T> {
    channel: Channel<T>,
    state: OpState<()>,
}

impl<T> RecvOp<T> {
    pub(crate) fn new(channel: Channel<T>) -> Self {
        RecvOp { channel, state: OpState::Idle(()) }
    }

    // poll the operation. resolves to none if closed and drained. panics if already resolved or
    // cancelled.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Poll<Option<T>> {
        match mem::replace(&mut self.state, OpState::Done) {
            OpState::Idle(()) => {
                let mut lock = self.channel.lock();
                match lock.recv_now() {
                    RecvNow::Received(msg, waiter) => {
                        drop(lock);
                        park::wake(waiter);
                        Poll::Ready(Some(msg))
                    }
                    RecvNow::Closed => Poll::Ready(None),
                    RecvNow::Empty => {
                        let waiter = Waiter::new();
                        waiter.register(cx.waker());
                        let key = lock.queues.push(Side::Recv, Arc::clone(&waiter), None, false);
                        drop(lock);
                        self.state = OpState::Parked(key, waiter);
                        Poll::Pending
                    }
                }
            }
            OpState::Parked(key, waiter) => {
                let mut lock = self.channel.lock();
                if lock.queues.get(key).state == RecordState::Queued {
                    waiter.register(cx.waker());
                    drop(lock);
                    self.state = OpState::Parked(key, waiter);
                    return Poll::Pending;
                }
                let record = lock.queues.release(key);
                drop(lock);
                Poll::Ready(finish_recv(record))
            }
            OpState::Done => panic!("recv future polled after already resolved or cancelled"),
        }
    }

    // if not already resolved or cancelled, cancel the operation.
    //
    // if a sender already handed this operation a message, the message is redelivered to another
    // receiver or the buffer if possible, and dropped otherwise.
    pub(crate) fn cancel(&mut self) {
        if let OpState::Parked(key, _) = mem::replace(&mut self.state, OpState::Done) {
            let mut lock = self.channel.lock();
            let state = lock.queues.cancel(key);
            let mut record = lock.queues.release(key);
            let msg = match (state, record.slot.take()) {
                (RecordState::Claimed, Some(msg)) => msg,
                (RecordState::Claimed, None) => internal_bug("receiver claimed without a message"),
                _ => return,
            };
            match lock.redeliver(msg) {
                Ok(waiter) => {
                    drop(lock);
                    trace!(channel = self.channel.id(), "redelivered message of cancelled recv");
                    park::wake(waiter);
                }
                Err(msg) => {
                    drop(lock);
                    debug!(channel = self.channel.id(), "dropping message received by cancelled recv");
                    drop(msg);
                }
            }
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.state, OpState::Done)
    }
}

impl<T> Drop for RecvOp<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{thread, time::Duration};

    // spin until the channel has n blocked operations on a side.
    pub(crate) fn wait_for_waiting<T>(channel: &Channel<T>, side: Side, n: usize) {
        for _ in 0..10_000 {
            if channel.waiting(side) == n {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for {} blocked {:?} operations", n, side);
    }

    #[test]
    fn buffered_send_recv_and_mirrors() {
        let channel = Channel::new(2);
        assert_eq!(channel.cap(), 2);
        channel.send(1, false).unwrap();
        channel.send(2, false).unwrap();
        assert_eq!(channel.len(), 2);
        let e = channel.send(3, false).unwrap_err();
        assert!(e.is_would_block());
        assert_eq!(e.msg, 3);
        assert_eq!(channel.recv(false), Ok(Some(1)));
        assert_eq!(channel.recv(false), Ok(Some(2)));
        assert_eq!(channel.recv(false), Err(WouldBlockError));
        assert_eq!(channel.len(), 0);
    }

    #[test]
    fn unbuffered_without_counterpart_would_block() {
        let channel = Channel::<u8>::new(0);
        assert!(channel.send(1, false).unwrap_err().is_would_block());
        assert_eq!(channel.recv(false), Err(WouldBlockError));
        // no records were created
        assert_eq!(channel.lock().queues.allocated(), 0);
    }

    #[test]
    fn full_buffer_rotates_in_waiting_sender() {
        let channel = Channel::new(1);
        channel.send(1, true).unwrap();
        let channel_2 = channel.clone();
        let join = thread::spawn(move || channel_2.send(2, true));
        wait_for_waiting(&channel, Side::Send, 1);
        assert_eq!(channel.recv(true), Ok(Some(1)));
        join.join().unwrap().unwrap();
        // the sender's message went into the buffer
        assert_eq!(channel.len(), 1);
        assert_eq!(channel.recv(false), Ok(Some(2)));
    }

    #[test]
    fn close_wakes_sender_with_message() {
        let channel = Channel::new(0);
        let channel_2 = channel.clone();
        let join = thread::spawn(move || channel_2.send(String::from("hi"), true));
        wait_for_waiting(&channel, Side::Send, 1);
        channel.close().unwrap();
        let e = join.join().unwrap().unwrap_err();
        assert_eq!(e.msg, "hi");
        assert_eq!(e.cause, TrySendErrorCause::Terminal(ErrorKind::SendOnClosed));
        channel.lock().check_invariants();
    }

    #[test]
    fn close_wakes_receivers() {
        let channel = Channel::<u32>::new(0);
        let joins = (0..3)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || channel.recv(true))
            })
            .collect::<Vec<_>>();
        wait_for_waiting(&channel, Side::Recv, 3);
        channel.close().unwrap();
        for join in joins {
            assert_eq!(join.join().unwrap(), Ok(None));
        }
        assert_eq!(channel.close(), Err(ErrorKind::DoubleClose));
    }

    #[test]
    fn try_recv_across_close_never_would_block() {
        // the channel goes from open with one element, to closed with one element, to closed and
        // drained, so it is never open and empty
        for _ in 0..20_000 {
            let channel = Channel::new(1);
            channel.send(1, false).unwrap();
            let channel_2 = channel.clone();
            let join = thread::spawn(move || {
                channel_2.close().unwrap();
                channel_2.recv(false)
            });
            let mine = channel.recv(false);
            let theirs = join.join().unwrap();
            let mut results = [mine, theirs];
            results.sort();
            assert_eq!(results, [Ok(None), Ok(Some(1))]);
        }
    }

    #[test]
    fn redeliver_prefers_blocked_receiver_then_buffer_front() {
        let channel = Channel::new(2);
        let mut lock = channel.lock();
        let key = lock.queues.push(Side::Recv, Waiter::new(), None, false);
        assert!(matches!(lock.redeliver(1), Ok(Some(_))));
        assert_eq!(lock.queues.get(key).state, RecordState::Claimed);
        assert_eq!(lock.queues.release(key).slot, Some(1));

        lock.ring.push(3);
        assert!(matches!(lock.redeliver(2), Ok(None)));
        assert_eq!(lock.ring.pop(), Some(2));
        lock.ring.push(4);
        assert!(matches!(lock.redeliver(6), Err(6)));
        drop(lock);
        assert_eq!(channel.recv(false), Ok(Some(3)));
    }

    #[test]
    fn identity() {
        let a = Channel::<()>::new(0);
        let b = Channel::<()>::new(0);
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert_eq!(a.id(), a.clone().id());
        assert_ne!(a.id(), b.id());
    }
}

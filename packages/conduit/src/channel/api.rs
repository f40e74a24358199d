// exposed API of channels

use self::future::*;
use super::{
    error::*,
    core,
    park,
    wait_queue::Side,
};
use std::fmt::{self, Debug, Formatter};


// ==== the exposed API ====


/// Create a channel with room for `capacity` buffered messages
///
/// A capacity of 0 creates an unbuffered channel, on which every send waits for a receiver to take
/// the message directly.
pub fn channel<T>(capacity: usize) -> Chan<T> {
    Chan::new(capacity)
}

/// Handle to a channel
///
/// A channel is shared by all clones of its handle. It is freed when the last handle, and the last
/// pending operation on it, is dropped. Any handle may send, receive, or close.
pub struct Chan<T>(pub(crate) core::Channel<T>);

impl<T> Chan<T> {
    /// Create a channel with room for `capacity` buffered messages
    ///
    /// A capacity of 0 creates an unbuffered channel.
    pub fn new(capacity: usize) -> Self {
        Chan(core::Channel::new(capacity))
    }

    /// Send a message, blocking the current thread until it is buffered or received
    ///
    /// Fails with [`ErrorKind::SendOnClosed`] if the channel is closed, including if it is closed
    /// while this call is blocked. The message is returned in the error.
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.0.send(msg, true).map_err(|e| match e.cause {
            TrySendErrorCause::Terminal(cause) => SendError { msg: e.msg, cause },
            TrySendErrorCause::WouldBlock(_) => unreachable!("blocking send would block"),
        })
    }

    /// Try to send a message without blocking
    ///
    /// Fails with [`WouldBlockError`] if no receiver is waiting and the buffer is full. Sending
    /// on a closed channel still fails with [`ErrorKind::SendOnClosed`].
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.0.send(msg, false)
    }

    /// Receive a message, blocking the current thread until one is available
    ///
    /// Returns `None` once the channel is closed and all buffered messages have been received.
    pub fn recv(&self) -> Option<T> {
        self.0.recv(true).unwrap_or_else(|_| unreachable!("blocking recv would block"))
    }

    /// Try to receive a message without blocking
    ///
    /// Returns `Ok(None)` if the channel is closed and drained, and [`WouldBlockError`] if it is
    /// open but has no message available.
    pub fn try_recv(&self) -> Result<Option<T>, WouldBlockError> {
        self.0.recv(false)
    }

    /// Close the channel
    ///
    /// Blocked receivers resolve to `None`, and blocked senders fail with
    /// [`ErrorKind::SendOnClosed`]. Messages already buffered can still be received. Fails with
    /// [`ErrorKind::DoubleClose`] if already closed.
    pub fn close(&self) -> Result<(), ErrorKind> {
        self.0.close()
    }

    /// Create a future to send a message on this channel
    ///
    /// See [`SendFut`].
    pub fn send_async(&self, msg: T) -> SendFut<T> {
        SendFut(core::SendOp::new(self.0.clone(), msg))
    }

    /// Create a future to receive a message from this channel
    ///
    /// See [`RecvFut`].
    pub fn recv_async(&self) -> RecvFut<T> {
        RecvFut(core::RecvOp::new(self.0.clone()))
    }

    /// Iterate over received messages, blocking for each, until the channel is closed and
    /// drained
    pub fn iter(&self) -> Iter<'_, T> {
        Iter(self)
    }

    /// Number of messages currently buffered
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no messages are currently buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.0.cap()
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    // number of blocked operations on a side.
    pub(crate) fn waiting(&self, side: Side) -> usize {
        self.0.waiting(side)
    }
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Chan(self.0.clone())
    }
}

/// Handles are equal if they refer to the same channel
impl<T> PartialEq for Chan<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.same(&other.0)
    }
}

impl<T> Eq for Chan<T> {}

impl<T> Debug for Chan<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Chan")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}


// ==== operations on possibly absent channels ====


/// Send on a possibly absent channel
///
/// Sending on an absent channel blocks forever.
pub fn send<T>(chan: Option<&Chan<T>>, msg: T) -> Result<(), SendError<T>> {
    match chan {
        Some(chan) => chan.send(msg),
        None => park::park_forever(),
    }
}

/// Try to send on a possibly absent channel without blocking
///
/// Sending on an absent channel would block.
pub fn try_send<T>(chan: Option<&Chan<T>>, msg: T) -> Result<(), TrySendError<T>> {
    match chan {
        Some(chan) => chan.try_send(msg),
        None => Err(SendError { msg, cause: WouldBlockError.into() }),
    }
}

/// Receive from a possibly absent channel
///
/// Receiving from an absent channel blocks forever.
pub fn recv<T>(chan: Option<&Chan<T>>) -> Option<T> {
    match chan {
        Some(chan) => chan.recv(),
        None => park::park_forever(),
    }
}

/// Try to receive from a possibly absent channel without blocking
///
/// Receiving from an absent channel would block.
pub fn try_recv<T>(chan: Option<&Chan<T>>) -> Result<Option<T>, WouldBlockError> {
    match chan {
        Some(chan) => chan.try_recv(),
        None => Err(WouldBlockError),
    }
}

/// Close a possibly absent channel
///
/// Closing an absent channel fails with [`ErrorKind::CloseOnNil`].
pub fn close<T>(chan: Option<&Chan<T>>) -> Result<(), ErrorKind> {
    match chan {
        Some(chan) => chan.close(),
        None => Err(ErrorKind::CloseOnNil),
    }
}


// ==== iteration ====


/// Blocking iterator over messages received from a [`Chan`]
///
/// Ends once the channel is closed and drained.
pub struct Iter<'a, T>(&'a Chan<T>);

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.recv()
    }
}

impl<'a, T> IntoIterator for &'a Chan<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}


// future types for channels.
pub(crate) mod future {
    use super::*;
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
    };

    /// Future for sending into a [`Chan`]
    ///
    /// The message is sent when this future resolves. Dropping it before then withdraws the
    /// message from the channel.
    pub struct SendFut<T>(pub(super) core::SendOp<T>);

    // the message is never pinned.
    impl<T> Unpin for SendFut<T> {}

    impl<T> Future for SendFut<T> {
        type Output = Result<(), SendError<T>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            this.0.poll(cx)
        }
    }

    impl<T> SendFut<T> {
        /// If the message has not yet been sent, abort the send operation and take the message
        /// back
        pub fn rescind(&mut self) -> Option<T> {
            self.0.cancel()
        }

        /// Whether this future has already resolved or rescinded
        pub fn is_terminated(&self) -> bool {
            self.0.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for SendFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }


    /// Future for receiving from a [`Chan`]
    ///
    /// Resolves to `None` once the channel is closed and drained. Dropping this future while it
    /// is waiting withdraws it from the channel. If a sender handed it a message after its last
    /// poll, that message passes on to the next waiting receiver or back to the front of the
    /// buffer, and is only dropped if the channel has room for neither.
    pub struct RecvFut<T>(pub(super) core::RecvOp<T>);

    impl<T> Unpin for RecvFut<T> {}

    impl<T> Future for RecvFut<T> {
        type Output = Option<T>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            this.0.poll(cx)
        }
    }

    impl<T> RecvFut<T> {
        /// Abort this receive operation, unless it has already resolved or aborted
        pub fn abort(&mut self) {
            self.0.cancel();
        }

        /// Whether this future has already resolved or aborted
        pub fn is_terminated(&self) -> bool {
            self.0.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for RecvFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{
        sync::mpsc,
        thread,
        time::Duration,
    };

    fn wait_for_waiting<T>(chan: &Chan<T>, side: Side, n: usize) {
        core::tests::wait_for_waiting(&chan.0, side, n);
    }

    #[test]
    fn rendezvous_preserves_order() {
        let chan = channel(0);
        let chan_2 = chan.clone();
        let join = thread::spawn(move || {
            for i in 1..=1000 {
                chan_2.send(i).unwrap();
            }
            chan_2.close().unwrap();
        });
        let received = chan.iter().collect::<Vec<_>>();
        join.join().unwrap();
        assert_eq!(received, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn closed_drain() {
        let chan = channel(2);
        chan.send('a').unwrap();
        chan.send('b').unwrap();
        chan.close().unwrap();
        assert!(chan.is_closed());
        assert_eq!(chan.recv(), Some('a'));
        assert_eq!(chan.recv(), Some('b'));
        assert_eq!(chan.recv(), None);
        assert_eq!(chan.recv(), None);
        assert_eq!(chan.try_recv(), Ok(None));
    }

    #[test]
    fn double_close_and_close_on_nil() {
        let chan = channel::<u8>(1);
        assert_eq!(chan.close(), Ok(()));
        assert_eq!(chan.close(), Err(ErrorKind::DoubleClose));
        assert_eq!(close::<u8>(None), Err(ErrorKind::CloseOnNil));
        assert_eq!(close(Some(&chan)), Err(ErrorKind::DoubleClose));
    }

    #[test]
    fn send_on_closed() {
        let chan = channel(4);
        chan.close().unwrap();
        let e = chan.send(5).unwrap_err();
        assert_eq!((e.msg, e.cause), (5, ErrorKind::SendOnClosed));
        let e = chan.try_send(6).unwrap_err();
        assert_eq!(e.cause, TrySendErrorCause::Terminal(ErrorKind::SendOnClosed));
    }

    #[test]
    fn blocked_sender_woken_by_close_fails() {
        let chan = channel(1);
        chan.send(1).unwrap();
        let chan_2 = chan.clone();
        let join = thread::spawn(move || chan_2.send(2));
        wait_for_waiting(&chan, Side::Send, 1);
        chan.close().unwrap();
        let e = join.join().unwrap().unwrap_err();
        assert_eq!((e.msg, e.cause), (2, ErrorKind::SendOnClosed));
        // the buffered message survives the close
        assert_eq!(chan.recv(), Some(1));
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn nil_channel_never_ready() {
        let e = try_send::<u8>(None, 1).unwrap_err();
        assert!(e.is_would_block());
        assert_eq!(try_recv::<u8>(None), Err(WouldBlockError));

        // a blocking op on a nil channel never returns
        let (done_send, done_recv) = mpsc::channel();
        thread::spawn(move || {
            recv::<u8>(None);
            done_send.send(()).unwrap();
        });
        assert!(done_recv.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn try_ops_on_unbuffered() {
        let chan = channel(0);
        assert!(chan.try_send(1).unwrap_err().is_would_block());
        assert_eq!(chan.try_recv(), Err(WouldBlockError));

        let chan_2 = chan.clone();
        let join = thread::spawn(move || chan_2.recv());
        wait_for_waiting(&chan, Side::Recv, 1);
        chan.try_send(7).unwrap();
        assert_eq!(join.join().unwrap(), Some(7));
    }

    #[test]
    fn accessors() {
        let chan = channel::<u8>(3);
        assert_eq!(chan.capacity(), 3);
        assert!(chan.is_empty());
        chan.send(1).unwrap();
        assert_eq!(chan.len(), 1);
        assert!(!chan.is_closed());
        assert_eq!(chan, chan.clone());
        assert_ne!(chan, channel(3));
        assert_eq!(
            format!("{:?}", chan),
            "Chan { len: 1, capacity: 3, closed: false }",
        );
    }

    // many producers and consumers with random capacities. every message is received exactly
    // once, and each producer's messages arrive in order.
    #[test]
    fn stochastic_many_producers_consumers() {
        let mut rng = Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes());
        for _ in 0..20 {
            let cap = rng.gen_range(0..4);
            let producers = rng.gen_range(1..4);
            let consumers = rng.gen_range(1..4);
            let per_producer = 200;
            let chan = channel::<(usize, usize)>(cap);

            let producer_joins = (0..producers)
                .map(|p| {
                    let chan = chan.clone();
                    thread::spawn(move || {
                        for i in 0..per_producer {
                            chan.send((p, i)).unwrap();
                        }
                    })
                })
                .collect::<Vec<_>>();
            let consumer_joins = (0..consumers)
                .map(|_| {
                    let chan = chan.clone();
                    thread::spawn(move || {
                        let mut last = vec![None; producers];
                        let mut got = Vec::new();
                        for (p, i) in &chan {
                            assert!(last[p].is_none_or(|l| l < i));
                            last[p] = Some(i);
                            got.push((p, i));
                        }
                        got
                    })
                })
                .collect::<Vec<_>>();

            for join in producer_joins {
                join.join().unwrap();
            }
            chan.close().unwrap();
            let mut all = consumer_joins
                .into_iter()
                .flat_map(|join| join.join().unwrap())
                .collect::<Vec<_>>();
            all.sort();
            let expect = (0..producers)
                .flat_map(|p| (0..per_producer).map(move |i| (p, i)))
                .collect::<Vec<_>>();
            assert_eq!(all, expect);
            chan.0.lock().check_invariants();
        }
    }

    #[tokio::test]
    async fn async_send_recv() {
        let chan = channel(0);
        let chan_2 = chan.clone();
        let task = tokio::spawn(async move {
            for i in 0..100 {
                chan_2.send_async(i).await.unwrap();
            }
            chan_2.close().unwrap();
        });
        let mut got = Vec::new();
        while let Some(i) = chan.recv_async().await {
            got.push(i);
        }
        task.await.unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn async_and_blocking_interoperate() {
        let chan = channel(1);
        let chan_2 = chan.clone();
        let join = thread::spawn(move || {
            for i in 0..50 {
                chan_2.send(i).unwrap();
            }
        });
        for i in 0..50 {
            assert_eq!(chan.recv_async().await, Some(i));
        }
        join.join().unwrap();
    }

    #[tokio::test]
    async fn dropped_futures_unlink() {
        let chan = channel::<u32>(0);
        let mut recv = chan.recv_async();
        let timed_out = tokio::time::timeout(Duration::from_millis(20), &mut recv).await;
        assert!(timed_out.is_err());
        assert_eq!(chan.waiting(Side::Recv), 1);
        drop(recv);
        assert_eq!(chan.waiting(Side::Recv), 0);

        let mut send = chan.send_async(9);
        let timed_out = tokio::time::timeout(Duration::from_millis(20), &mut send).await;
        assert!(timed_out.is_err());
        assert_eq!(chan.waiting(Side::Send), 1);
        assert_eq!(send.rescind(), Some(9));
        assert!(send.is_terminated());
        assert_eq!(chan.waiting(Side::Send), 0);
    }

    #[tokio::test]
    async fn dropped_recv_future_redelivers_message() {
        // to the next blocked receiver
        let chan = channel::<u32>(0);
        let mut recv_1 = chan.recv_async();
        let mut recv_2 = chan.recv_async();
        assert!(tokio::time::timeout(Duration::ZERO, &mut recv_1).await.is_err());
        assert!(tokio::time::timeout(Duration::ZERO, &mut recv_2).await.is_err());
        chan.try_send(5).unwrap();
        drop(recv_1);
        assert_eq!(recv_2.await, Some(5));

        // to the front of the buffer
        let chan = channel::<u32>(2);
        let mut recv = chan.recv_async();
        assert!(tokio::time::timeout(Duration::ZERO, &mut recv).await.is_err());
        chan.try_send(5).unwrap();
        chan.try_send(6).unwrap();
        drop(recv);
        assert_eq!(chan.try_recv(), Ok(Some(5)));
        assert_eq!(chan.try_recv(), Ok(Some(6)));
        assert_eq!(chan.try_recv(), Err(WouldBlockError));
    }

    #[tokio::test]
    async fn sends_racing_recv_future_drops_are_received_once() {
        const N: u32 = 1_000;
        let chan = channel::<u32>(N as usize);
        let chan_2 = chan.clone();
        let producer = thread::spawn(move || {
            for i in 0..N {
                chan_2.send(i).unwrap();
            }
            chan_2.close().unwrap();
        });
        let mut received = Vec::new();
        loop {
            let mut recv = chan.recv_async();
            match tokio::time::timeout(Duration::ZERO, &mut recv).await {
                Ok(Some(i)) => received.push(i),
                Ok(None) => break,
                Err(_) => {
                    drop(recv);
                    tokio::task::yield_now().await;
                }
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..N).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn async_close_wakes() {
        let chan = channel::<u32>(0);
        let chan_2 = chan.clone();
        let recv = tokio::spawn(async move { chan_2.recv_async().await });
        while chan.waiting(Side::Recv) == 0 {
            tokio::task::yield_now().await;
        }
        chan.close().unwrap();
        assert_eq!(recv.await.unwrap(), None);

        let chan = channel::<u32>(0);
        let chan_2 = chan.clone();
        let send = tokio::spawn(async move { chan_2.send_async(3).await });
        while chan.waiting(Side::Send) == 0 {
            tokio::task::yield_now().await;
        }
        chan.close().unwrap();
        let e = send.await.unwrap().unwrap_err();
        assert_eq!((e.msg, e.cause), (3, ErrorKind::SendOnClosed));
    }
}

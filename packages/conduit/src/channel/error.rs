// channel error types.

use std::fmt::{self, Debug, Display, Formatter};


// ==== base error types ====


/// Misuse of a channel which the caller must treat as fatal
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// Sending on a channel which has been closed
    ///
    /// This includes a blocked sender which was still waiting when the channel was closed.
    #[error("send on closed channel")]
    SendOnClosed,
    /// Closing a channel which was already closed
    #[error("close of closed channel")]
    DoubleClose,
    /// Closing an absent channel
    #[error("close of nil channel")]
    CloseOnNil,
}

/// Error for attempting a non-blocking operation that could not complete immediately
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("operation would block")]
pub struct WouldBlockError;


// ==== compound error types ====


/// Error for trying to send into a channel
///
/// Gives the message back to the caller.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SendError<T, E = ErrorKind> {
    /// The message that could not be sent
    pub msg: T,
    /// The reason the message could not be sent
    pub cause: E,
}

impl<T, E: Debug> Debug for SendError<T, E> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        // the message itself is not required to be Debug
        f.debug_struct("SendError")
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

impl<T, E: Display> Display for SendError<T, E> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.cause, f)
    }
}

impl<T, E: Debug + Display> std::error::Error for SendError<T, E> {}

macro_rules! compound_from {
    ($compound:ident {$(
        $variant:ident($inner:ty),
    )*})=>{$(
        impl From<$inner> for $compound {
            fn from(inner: $inner) -> Self {
                Self::$variant(inner)
            }
        }
    )*};
}

/// Reason a non-blocking send did not complete
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
pub enum TrySendErrorCause {
    /// The send failed in a way that a blocking send would also have failed
    #[error("{0}")]
    Terminal(ErrorKind),
    /// The send could not complete without blocking
    #[error("{0}")]
    WouldBlock(WouldBlockError),
}

compound_from!(TrySendErrorCause {
    Terminal(ErrorKind),
    WouldBlock(WouldBlockError),
});

/// Error for trying to send into a channel without blocking
pub type TrySendError<T> = SendError<T, TrySendErrorCause>;

impl<T> TrySendError<T> {
    /// Whether the send only failed because it would have blocked
    pub fn is_would_block(&self) -> bool {
        matches!(self.cause, TrySendErrorCause::WouldBlock(_))
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        SendError { msg: e.msg, cause: e.cause.into() }
    }
}

/// Error from a select, identifying the case which failed
///
/// The only cause a select can produce is [`ErrorKind::SendOnClosed`]. The message of the failed
/// send case is left in the slot it was registered with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, thiserror::Error)]
#[error("select case {index}: {cause}")]
pub struct SelectError {
    /// Index of the failed case, as returned when the case was registered
    pub index: usize,
    /// Why the case failed
    pub cause: ErrorKind,
}

//! Bounded channels with Go-style semantics, usable from both threads and async tasks.
//!
//! - [`channel`] creates a channel with a fixed capacity. Capacity 0 makes an unbuffered
//!   channel, where each send waits for a receiver to take the message directly.
//! - Any number of [`Chan`] handles can send, receive, and close. Closing lets receivers drain
//!   what was already sent, after which receives yield `None`.
//! - [`Select`] waits on several sends and receives over different channels at once, and
//!   completes exactly one of them.
//! - Free functions such as [`send`] and [`recv`] accept an absent channel, on which blocking
//!   operations never complete.

#[macro_use]
extern crate tracing;

mod channel;
mod select;

pub use crate::{
    channel::api::*,
    select::{Select, Selected},
};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
}

/// Future types
pub mod future {
    pub use crate::channel::api::future::*;
}

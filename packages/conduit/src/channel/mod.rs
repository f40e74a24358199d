// implementation of the conduit channel.
//
// the basic architecture is as such:
//
// channel handles wrap around Arc<shared state>
//                                  |
//          /-----------------------/
//          v
//       shared state
//          |
//          |------ a raw mutex, and the lockable state it guards:
//          |
//          |       |------ a ring::Ring<T>, the fixed-capacity buffer of elements. it has capacity
//          |       |       0 for an unbuffered channel, in which case every transfer is a direct
//          |       |       handoff between a sender and a receiver.
//          |       |
//          |       |------ a wait_queue::WaitQueues<T>, an arena of wait records which form the
//          |       |       send queue and recv queue. each record is one blocked task on one
//          |       |       operation, and holds the message being sent or the slot a sender
//          |       |       fills in for a receiver.
//          |       |
//          |       \------ the closed flag.
//          |
//          \------ atomic mirrors of some lockable state, republished on every unlock, which
//                  non-blocking operations read to fail fast without locking.
//
// the mutex is raw (lock and unlock are separate calls rather than a guard) so that the select
// engine can hold the locks of many channels of different element types at once, always
// acquiring them in order of channel address.
//
// a blocked task is represented by a park::Waiter. blocking links a record into a queue, then
// parks on the waiter with releasing the channel lock as the park's commit step, so that no
// wakeup can be lost in between. the counterpart which dequeues the record does the transfer
// under the lock, releases the lock, and only then wakes the waiter.
//
// the organization of these modules is as such:
//
//      ring<-------------core: This is the sin-eater of the unsafety. It implements the send,
//                   |    ^ ^   recv and close protocols, and exposes locking to the select engine.
//      wait_queue<--/    | |
//                        | \---select (at crate root): The multi-way select engine.
//      park<-------------/
//                        api: This is a wrapper around core that adapts it into an API that
//                             is convenient and defensive. The crate re-exports this API
//                             publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod park;
pub(crate) mod wait_queue;

mod ring;


// report a broken internal invariant and abort the process.
//
// channel state may be inconsistent at this point, and other tasks may be blocked on locks held
// by the caller, so unwinding is not an option.
#[cold]
pub(crate) fn internal_bug(what: &str) -> ! {
    error!(what, "channel internal invariant violated, aborting");
    std::process::abort()
}

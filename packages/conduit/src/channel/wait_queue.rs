// wait records and the wait queues they are linked into.
//
// records live in a per-channel arena of stable-index slots, and link to each other by index
// rather than by pointer. this gives O(1) removal of a record from the middle of its queue, which
// a select needs when it cleans up the records it lost with, without handing out pointers into
// the arena. freed slots form a free list which is the pool later blocking operations reuse.
//
// the arena is owned by the channel's lockable state, so every method here requires the channel
// lock by virtue of requiring a reference.
//
// the arena grows to the peak number of concurrently blocked operations. once every record is
// released, an arena larger than POOL_RETAIN slots is cleared and its memory shrunk back down.

use super::{
    internal_bug,
    park::Waiter,
};
use std::{
    mem,
    sync::Arc,
};


// number of slots an idle arena keeps allocated.
const POOL_RETAIN: usize = 16;


// which of a channel's two wait queues.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Side {
    Send,
    Recv,
}

// state of a wait record.
//
// legal transitions are only Queued -> {Claimed, ClaimedByClose, Unlinked}, followed by the
// record being released back into the pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RecordState {
    // linked into its queue, waiting for a counterpart.
    Queued,
    // dequeued by a counterpart which completed the transfer.
    Claimed,
    // dequeued because the channel was closed.
    ClaimedByClose,
    // removed from its queue without completing, either by the waiter's own cleanup or by a
    // counterpart which lost the race to claim the waiter.
    Unlinked,
}

// handle to a record in the arena. only the operation which pushed the record holds its key.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct RecordKey(usize);

// one task blocked on one operation on this channel.
pub(crate) struct WaitRecord<T> {
    // the blocked task.
    pub(crate) waiter: Arc<Waiter>,
    // for a send, the message being sent. for a receive, the destination a sender fills in.
    pub(crate) slot: Option<T>,
    pub(crate) state: RecordState,
    // whether the waiter may have records in other queues, so must be claimed before use.
    multi: bool,
    side: Side,
    // next record towards front.
    to_front: Option<usize>,
    // next record towards back.
    to_back: Option<usize>,
}

enum Slot<T> {
    Occupied(WaitRecord<T>),
    // next free slot.
    Vacant(Option<usize>),
}

// front, back, and length of one queue.
#[derive(Default)]
struct Links {
    front_back: Option<(usize, usize)>,
    len: usize,
}

// both wait queues of a channel, and the arena their records live in.
pub(crate) struct WaitQueues<T> {
    slots: Vec<Slot<T>>,
    // head of free list.
    free: Option<usize>,
    // number of occupied slots.
    occupied: usize,
    send: Links,
    recv: Links,
}

impl<T> WaitQueues<T> {
    // construct with both queues empty.
    pub(crate) fn new() -> Self {
        WaitQueues {
            slots: Vec::new(),
            free: None,
            occupied: 0,
            send: Links::default(),
            recv: Links::default(),
        }
    }

    // number of records queued on a side.
    pub(crate) fn len(&self, side: Side) -> usize {
        self.links(side).len
    }

    pub(crate) fn is_empty(&self, side: Side) -> bool {
        self.len(side) == 0
    }

    // number of slots allocated, whether in use or pooled.
    #[cfg(test)]
    pub(crate) fn allocated(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    fn reserved(&self) -> usize {
        self.slots.capacity()
    }

    // borrow a record.
    pub(crate) fn get(&self, key: RecordKey) -> &WaitRecord<T> {
        self.record(key.0)
    }

    // mutably borrow a record.
    pub(crate) fn get_mut(&mut self, key: RecordKey) -> &mut WaitRecord<T> {
        self.record_mut(key.0)
    }

    // allocate a record and link it to the back of a queue.
    pub(crate) fn push(
        &mut self,
        side: Side,
        waiter: Arc<Waiter>,
        slot: Option<T>,
        multi: bool,
    ) -> RecordKey {
        let record = WaitRecord {
            waiter,
            slot,
            state: RecordState::Queued,
            multi,
            side,
            to_front: None,
            to_back: None,
        };
        let idx = match self.free {
            Some(idx) => {
                let Slot::Vacant(next_free) = self.slots[idx] else {
                    internal_bug("occupied slot on wait record free list")
                };
                self.free = next_free;
                self.slots[idx] = Slot::Occupied(record);
                idx
            }
            None => {
                self.slots.push(Slot::Occupied(record));
                self.slots.len() - 1
            }
        };
        self.occupied += 1;
        self.link_back(side, idx);
        RecordKey(idx)
    }

    // pop the front record of a queue which may be resumed, setting its state to `claim`.
    //
    // multi-wait records whose waiter has already been claimed by some other party are unlinked
    // and skipped. their owner will find them in the Unlinked state when it cleans up.
    pub(crate) fn dequeue(&mut self, side: Side, claim: RecordState) -> Option<RecordKey> {
        debug_assert!(matches!(claim, RecordState::Claimed | RecordState::ClaimedByClose));
        loop {
            let (front, _) = self.links(side).front_back?;
            self.unlink(front);
            let record = self.record_mut(front);
            if record.multi && !record.waiter.try_claim() {
                record.state = RecordState::Unlinked;
                continue;
            }
            record.state = claim;
            return Some(RecordKey(front));
        }
    }

    // unlink the record from its queue if it is still queued. returns its resulting state.
    pub(crate) fn cancel(&mut self, key: RecordKey) -> RecordState {
        if self.record(key.0).state == RecordState::Queued {
            self.unlink(key.0);
            self.record_mut(key.0).state = RecordState::Unlinked;
        }
        self.record(key.0).state
    }

    // return a record's slot to the pool and take ownership of the record's contents.
    //
    // aborts if the record is still queued.
    pub(crate) fn release(&mut self, key: RecordKey) -> WaitRecord<T> {
        if self.record(key.0).state == RecordState::Queued {
            internal_bug("release of wait record which is still queued");
        }
        let record = match mem::replace(&mut self.slots[key.0], Slot::Vacant(self.free)) {
            Slot::Occupied(record) => record,
            Slot::Vacant(_) => internal_bug("release of vacant wait record slot"),
        };
        self.free = Some(key.0);
        self.occupied -= 1;
        if self.occupied == 0 && self.slots.len() > POOL_RETAIN {
            self.slots.clear();
            self.slots.shrink_to(POOL_RETAIN);
            self.free = None;
        }
        record
    }

    // ==== internal ====

    fn links(&self, side: Side) -> &Links {
        match side {
            Side::Send => &self.send,
            Side::Recv => &self.recv,
        }
    }

    fn links_mut(&mut self, side: Side) -> &mut Links {
        match side {
            Side::Send => &mut self.send,
            Side::Recv => &mut self.recv,
        }
    }

    fn record(&self, idx: usize) -> &WaitRecord<T> {
        match self.slots.get(idx) {
            Some(Slot::Occupied(record)) => record,
            _ => internal_bug("wait record key refers to no record"),
        }
    }

    fn record_mut(&mut self, idx: usize) -> &mut WaitRecord<T> {
        match self.slots.get_mut(idx) {
            Some(Slot::Occupied(record)) => record,
            _ => internal_bug("wait record key refers to no record"),
        }
    }

    // link the record at idx to the back of a queue.
    fn link_back(&mut self, side: Side, idx: usize) {
        let front_back = self.links(side).front_back;
        self.record_mut(idx).to_front = front_back.map(|(_, back)| back);
        let new_front_back = match front_back {
            Some((front, back)) => {
                // record becomes new back, and new to_back of previous back
                self.record_mut(back).to_back = Some(idx);
                (front, idx)
            }
            // edge case: record becomes only record in queue
            None => (idx, idx),
        };
        let links = self.links_mut(side);
        links.front_back = Some(new_front_back);
        links.len += 1;
    }

    // unlink the record at idx from whichever queue it is linked into.
    fn unlink(&mut self, idx: usize) {
        let record = self.record_mut(idx);
        let side = record.side;
        let to_front = record.to_front.take();
        let to_back = record.to_back.take();

        let Some((front, back)) = self.links(side).front_back else {
            internal_bug("unlink from empty wait queue")
        };
        // record's to_back becomes new to_back of record's to_front, or new front
        let new_front = match to_front {
            Some(to_front) => {
                self.record_mut(to_front).to_back = to_back;
                Some(front)
            }
            None => to_back,
        };
        // record's to_front becomes new to_front of record's to_back, or new back
        let new_back = match to_back {
            Some(to_back) => {
                self.record_mut(to_back).to_front = to_front;
                Some(back)
            }
            None => to_front,
        };
        let links = self.links_mut(side);
        links.len -= 1;
        links.front_back = match (new_front, new_back) {
            (Some(front), Some(back)) => Some((front, back)),
            (None, None) => None,
            _ => internal_bug("wait queue links corrupted"),
        };
    }
}

// fixed-capacity ring buffer part of a channel.

use std::{
    mem::MaybeUninit,
    ptr::drop_in_place,
};


// ring buffer of at most `cap` elements.
//
// memory layout:
//
// - slots[recv_idx] is the front if len > 0
// - slots[send_idx] is where the next pushed element goes
// - a slot is initialized iff it is among the len slots starting at recv_idx, wrapping around
//
// for zero-sized elements (or cap 0) the boxed slice does not allocate.
pub(crate) struct Ring<T> {
    slots: Box<[MaybeUninit<T>]>,
    send_idx: usize,
    recv_idx: usize,
    len: usize,
}

impl<T> Ring<T> {
    // construct empty with the given capacity.
    pub(crate) fn new(cap: usize) -> Self {
        Ring {
            slots: Box::new_uninit_slice(cap),
            send_idx: 0,
            recv_idx: 0,
            len: 0,
        }
    }

    // maximum number of elements.
    pub(crate) fn cap(&self) -> usize {
        self.slots.len()
    }

    // current number of elements.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == self.cap()
    }

    // advance a ring index by one slot.
    fn bump(&self, idx: usize) -> usize {
        if idx + 1 == self.cap() { 0 } else { idx + 1 }
    }

    // push to the back. panics if full.
    pub(crate) fn push(&mut self, elem: T) {
        assert!(!self.is_full(), "Ring push when full (internal bug)");
        self.slots[self.send_idx].write(elem);
        self.send_idx = self.bump(self.send_idx);
        self.len += 1;
    }

    // push to the front, so it is the next element popped. panics if full.
    pub(crate) fn push_front(&mut self, elem: T) {
        assert!(!self.is_full(), "Ring push_front when full (internal bug)");
        self.recv_idx = if self.recv_idx == 0 { self.cap() - 1 } else { self.recv_idx - 1 };
        self.slots[self.recv_idx].write(elem);
        self.len += 1;
    }

    // pop from the front.
    pub(crate) fn pop(&mut self) -> Option<T> {
        if self.len == 0 { return None; }
        // safety: the front slot is initialized because len > 0, and we mark it uninitialized
        //         by advancing recv_idx and decrementing len
        let elem = unsafe { self.slots[self.recv_idx].assume_init_read() };
        self.recv_idx = self.bump(self.recv_idx);
        self.len -= 1;
        Some(elem)
    }

    // on a full ring, pop the front and push `elem` to the back in one step.
    //
    // because the ring is full, the front slot and the next back slot are the same slot, so this
    // reads the old element out and writes the new one in place. panics if not full or cap is 0.
    pub(crate) fn rotate(&mut self, elem: T) -> T {
        assert!(self.cap() > 0 && self.is_full(), "Ring rotate when not full (internal bug)");
        debug_assert_eq!(self.recv_idx, self.send_idx);
        // safety: the ring is full, so the front slot is initialized. it is immediately
        //         re-initialized with the new element.
        let slot = &mut self.slots[self.recv_idx];
        let old = unsafe { slot.assume_init_read() };
        slot.write(elem);
        self.recv_idx = self.bump(self.recv_idx);
        self.send_idx = self.recv_idx;
        old
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // drop initialized elements
        let mut idx = self.recv_idx;
        for _ in 0..self.len {
            // safety: idx walks exactly the initialized slots
            unsafe { drop_in_place(self.slots[idx].as_mut_ptr()); }
            idx = self.bump(idx);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{
        collections::VecDeque,
        rc::Rc,
    };

    fn new_rng() -> impl Rng {
        Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes())
    }

    fn equivalence_test(cap: usize) {
        let mut rng = new_rng();
        let mut queue_1 = VecDeque::<u32>::new();
        let mut queue_2 = Ring::<u32>::new(cap);
        for i in 0u32..10_000 {
            match rng.gen_range(0..4) {
                0 if queue_1.len() < cap => {
                    queue_1.push_back(i);
                    queue_2.push(i);
                }
                3 if queue_1.len() < cap => {
                    queue_1.push_front(i);
                    queue_2.push_front(i);
                }
                1 if queue_1.len() == cap && cap > 0 => {
                    let expect = queue_1.pop_front();
                    queue_1.push_back(i);
                    assert_eq!(Some(queue_2.rotate(i)), expect);
                }
                _ => assert_eq!(queue_2.pop(), queue_1.pop_front()),
            }
            assert_eq!(queue_1.len(), queue_2.len());
            assert!(queue_2.len() <= queue_2.cap());
        }
    }

    #[test]
    fn equivalence_small_caps() {
        for cap in 0..=8 {
            equivalence_test(cap);
        }
    }

    #[test]
    fn equivalence_large_cap() {
        equivalence_test(100);
    }

    #[test]
    fn rotate_preserves_order() {
        let mut ring = Ring::new(3);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.rotate(4), 1);
        assert_eq!(ring.rotate(5), 2);
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), Some(5));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn zero_sized_elems() {
        let mut ring = Ring::<()>::new(2);
        ring.push(());
        ring.push(());
        assert!(ring.is_full());
        assert_eq!(ring.rotate(()), ());
        assert_eq!(ring.pop(), Some(()));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn drops_remaining_elems() {
        let tracker = Rc::new(());
        let mut ring = Ring::new(4);
        for _ in 0..4 {
            ring.push(Rc::clone(&tracker));
        }
        drop(ring.rotate(Rc::clone(&tracker)));
        assert_eq!(Rc::strong_count(&tracker), 5);
        drop(ring.pop());
        assert_eq!(Rc::strong_count(&tracker), 4);
        drop(ring);
        assert_eq!(Rc::strong_count(&tracker), 1);
    }
}

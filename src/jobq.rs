//! Lock-free bounded MPMC queue feeding the scheduler's workers.
//!
//! A ring of stamp cells carries the synchronization state; a parallel slot
//! array carries the payloads. Each stamp packs a slot index and a lap
//! counter into one `u64`: positions grow monotonically, the cell index is
//! `position & mask`, and the lap is `position / capacity`. A cell whose
//! counter equals the current lap is ready for a push (index = EMPTY) or a
//! pop (index = a real slot), so producers and consumers agree on ownership
//! without locks.
//!
//! Every stage enqueues its full job list before any worker starts, so the
//! queue's capacity is rounded up to the next power of two and a push in
//! this crate can only fail on a capacity bug.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU64, Ordering},
};

/// Packed (slot index, lap counter) pair.
#[repr(transparent)]
struct Stamp(AtomicU64);

impl Stamp {
    /// Index value for a cell with no payload.
    const EMPTY: u32 = u32::MAX;

    fn pack(index: u32, lap: u32) -> u64 {
        (lap as u64) << 32 | index as u64
    }

    fn unpack(packed: u64) -> (u32, u32) {
        (packed as u32, (packed >> 32) as u32)
    }

    /// A cell ready for its first push.
    fn ready() -> Self {
        Self(AtomicU64::new(Self::pack(Self::EMPTY, 0)))
    }

    fn load(&self, ordering: Ordering) -> u64 {
        self.0.load(ordering)
    }

    fn store(&self, value: u64, ordering: Ordering) {
        self.0.store(value, ordering)
    }
}

pub struct JobQueue<T> {
    stamps: Box<[Stamp]>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next position to push.
    head: AtomicU64,
    /// Next position to pop.
    tail: AtomicU64,
    capacity: usize,
    mask: usize,
}

// SAFETY: slot access is serialized by the stamp protocol; a slot is only
// read or written by the thread that claimed its position via CAS.
unsafe impl<T> Send for JobQueue<T> {}
unsafe impl<T> Sync for JobQueue<T> {}

impl<T> JobQueue<T> {
    /// Queue holding at least `min_capacity` items; the actual capacity is
    /// the next power of two (at most `u32::MAX`).
    pub fn with_capacity(min_capacity: usize) -> Self {
        let capacity = min_capacity.next_power_of_two().max(2);
        assert!(capacity <= u32::MAX as usize);

        let stamps: Box<[Stamp]> = (0..capacity).map(|_| Stamp::ready()).collect();
        let slots: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            stamps,
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            capacity,
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push a value; hands it back in `Err` when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        loop {
            let pos = self.head.load(Ordering::Relaxed);
            let cell_index = pos as usize & self.mask;
            let stamp = &self.stamps[cell_index];

            // Acquire pairs with the Release store of the pop that last
            // freed this cell.
            let (index, lap) = Stamp::unpack(stamp.load(Ordering::Acquire));
            let pos_lap = (pos as u32) / (self.capacity as u32);

            if lap == pos_lap && index == Stamp::EMPTY {
                // Claiming the position itself needs no ordering; the stamp
                // store below publishes the slot write.
                if self
                    .head
                    .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe {
                        (*self.slots[cell_index].get()).write(value);
                    }
                    stamp.store(Stamp::pack(cell_index as u32, lap), Ordering::Release);
                    return Ok(());
                }
            } else if lap < pos_lap {
                // The consumer side has not freed this cell for the current
                // lap: the ring is full.
                return Err(value);
            }
        }
    }

    /// Pop the oldest value, `None` when the queue is empty.
    pub fn pop(&self) -> Option<T> {
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let cell_index = pos as usize & self.mask;
            let stamp = &self.stamps[cell_index];

            // Acquire pairs with the push's Release store so the slot
            // payload is visible.
            let (index, lap) = Stamp::unpack(stamp.load(Ordering::Acquire));
            let pos_lap = pos as u32 / self.capacity as u32;

            if lap == pos_lap && index != Stamp::EMPTY {
                if self
                    .tail
                    .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*self.slots[cell_index].get()).assume_init_read() };
                    // Publish lap + 1 so the next-lap push sees a free cell.
                    stamp.store(Stamp::pack(Stamp::EMPTY, lap + 1), Ordering::Release);
                    return Some(value);
                }
            } else if lap < pos_lap || (lap == pos_lap && index == Stamp::EMPTY) {
                return None;
            }
        }
    }
}

impl<T> Drop for JobQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shuttle::thread;

    use super::*;

    #[test]
    fn stamp_roundtrip() {
        let cases = [
            (0, 0),
            (1, 0),
            (0, 1),
            (Stamp::EMPTY, 0),
            (77, 123_456),
            (u32::MAX - 1, u32::MAX),
        ];
        for (index, lap) in cases {
            assert_eq!((index, lap), Stamp::unpack(Stamp::pack(index, lap)));
        }
    }

    #[test]
    fn stamp_layout_lap_high_index_low() {
        assert_eq!(Stamp::pack(0x1234_5678, 0xABCD_EF00), 0xABCD_EF00_1234_5678);
    }

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(JobQueue::<u32>::with_capacity(0).capacity(), 2);
        assert_eq!(JobQueue::<u32>::with_capacity(3).capacity(), 4);
        assert_eq!(JobQueue::<u32>::with_capacity(8).capacity(), 8);
        assert_eq!(JobQueue::<u32>::with_capacity(9).capacity(), 16);
    }

    #[test]
    fn fifo_single_thread() {
        let q = JobQueue::with_capacity(8);
        for i in 0..8 {
            q.push(i).unwrap();
        }
        assert!(q.push(99).is_err(), "ring is full");
        for i in 0..8 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn reuse_across_laps() {
        let q = JobQueue::with_capacity(2);
        for lap in 0..5 {
            q.push(lap * 2).unwrap();
            q.push(lap * 2 + 1).unwrap();
            assert_eq!(q.pop(), Some(lap * 2));
            assert_eq!(q.pop(), Some(lap * 2 + 1));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn drop_releases_pending_items() {
        let q = JobQueue::with_capacity(4);
        q.push(Box::new(1_u64)).unwrap();
        q.push(Box::new(2_u64)).unwrap();
        drop(q); // boxed payloads must not leak
    }

    #[test]
    fn shuttle_workers_drain_all_jobs() {
        shuttle::check_random(
            || {
                let queue = Arc::new(JobQueue::with_capacity(32));
                for job_id in 0..24_u32 {
                    queue.push(job_id).unwrap();
                }

                let done = Arc::new(shuttle::sync::Mutex::new(vec![]));
                let mut handles = vec![];
                for _ in 0..4 {
                    let q = queue.clone();
                    let d = done.clone();
                    handles.push(thread::spawn(move || {
                        while let Some(job_id) = q.pop() {
                            d.lock().unwrap().push(job_id);
                        }
                    }));
                }
                for h in handles {
                    h.join().unwrap();
                }

                let mut done = done.lock().unwrap();
                done.sort();
                assert_eq!(*done, (0..24).collect::<Vec<_>>());
            },
            100,
        );
    }

    #[test]
    fn shuttle_concurrent_push_pop() {
        shuttle::check_random(
            || {
                let queue = Arc::new(JobQueue::with_capacity(64));
                let mut handles = vec![];

                for producer in 0..4_u32 {
                    let q = queue.clone();
                    handles.push(thread::spawn(move || {
                        for j in 0..4 {
                            let _ = q.push(producer * 10 + j);
                        }
                    }));
                }

                let drained = Arc::new(shuttle::sync::Mutex::new(vec![]));
                for _ in 0..2 {
                    let q = queue.clone();
                    let d = drained.clone();
                    handles.push(thread::spawn(move || {
                        for _ in 0..8 {
                            loop {
                                if let Some(v) = q.pop() {
                                    d.lock().unwrap().push(v);
                                    break;
                                }
                                thread::yield_now();
                            }
                        }
                    }));
                }

                for h in handles {
                    h.join().unwrap();
                }
                assert_eq!(drained.lock().unwrap().len(), 16);
            },
            100,
        );
    }
}

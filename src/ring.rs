use super::{
    qstd::{
        cell::UnsafeCell,
        sync::{
            atomic::{AtomicPtr, AtomicUsize, Ordering},
            Mutex,
        },
    },
    QueueError, UnsafeCellHelper, Value, EMPTY,
};
use crossbeam_utils::CachePadded;
use std::{array, mem, ptr::NonNull, sync::PoisonError};

/// Default number of slots in one ring segment.
pub const RING_SIZE: usize = 1024;

struct RingSegment<const N: usize> {
    next: AtomicPtr<RingSegment<N>>,
    slots: [UnsafeCell<u64>; N],
    /// Written only under the producer lock.
    push_idx: AtomicUsize,
    /// Written only under the consumer lock.
    pop_idx: AtomicUsize,
}

impl<const N: usize> RingSegment<N> {
    fn with_first(value: Option<Value>) -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            slots: array::from_fn(|i| {
                UnsafeCell::new(if i == 0 { Value::into_raw(value) } else { EMPTY })
            }),
            push_idx: AtomicUsize::new(value.is_some() as usize),
            pop_idx: AtomicUsize::new(0),
        }
    }
}

/// Unbounded MPMC queue of ring segments behind two locks.
///
/// ## Principle
/// All producers serialize on the lock that owns `tail`, all consumers on the
/// lock that owns `head`, so the two sides never contend with each other.
/// Inside a segment the cursors grow monotonically and map to a slot modulo
/// `N`, so one segment is reused for as long as consumers keep up. Only when
/// the tail ring is full does a producer link a new segment; consumers free a
/// drained head segment once it has a successor.
///
/// The cursors stay atomic: each side reads the other side's cursor without
/// holding its lock, and the release increment publishes the slot access.
pub struct RingQueue<const N: usize = RING_SIZE> {
    head: CachePadded<Mutex<NonNull<RingSegment<N>>>>,
    tail: CachePadded<Mutex<NonNull<RingSegment<N>>>>,
}

unsafe impl<const N: usize> Send for RingQueue<N> {}
unsafe impl<const N: usize> Sync for RingQueue<N> {}

impl<const N: usize> RingQueue<N> {
    const NON_EMPTY: () = assert!(N > 0, "ring segments need at least one slot");

    #[cfg(test)]
    fn segment_count(&self) -> usize {
        let head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        let mut cursor = head.as_ptr();
        while let Some(segment) = unsafe { cursor.as_ref() } {
            count += 1;
            cursor = segment.next.load(super::LOAD_ORDER);
        }
        count
    }
}

impl<const N: usize> super::SegQueue for RingQueue<N> {
    const SEGMENT_CAPACITY: usize = N;

    fn new() -> Result<Self, QueueError> {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_EMPTY;
        let first = super::try_box(RingSegment::<N>::with_first(None))?;
        Ok(Self {
            head: CachePadded::new(Mutex::new(first)),
            tail: CachePadded::new(Mutex::new(first)),
        })
    }

    #[profiling::function]
    fn push(&self, value: Value) -> Result<(), QueueError> {
        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let segment = unsafe { (*tail).as_ref() };
        let pushed = segment.push_idx.load(Ordering::Relaxed);
        let popped = segment.pop_idx.load(super::LOAD_ORDER);

        if pushed - popped < N {
            let slot: *const UnsafeCell<u64> = &segment.slots[pushed % N];
            unsafe { UnsafeCellHelper::write(slot, value.get()) };
            segment.push_idx.store(pushed + 1, Ordering::Release);
            log::trace!("Push at {:p}[{}]", segment, pushed % N);
        } else {
            // the queue is left untouched if this fails
            let fresh = super::try_box(RingSegment::<N>::with_first(Some(value)))?;
            // consumers may free `segment` as soon as the link is visible
            log::debug!("Ring segment appended: {:p} -> {:p}", segment, fresh);
            segment.next.store(fresh.as_ptr(), Ordering::Release);
            *tail = fresh;
        }
        Ok(())
    }

    #[profiling::function]
    fn pop(&self) -> Option<Value> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let segment = unsafe { (*head).as_ref() };
            // `next` first: once it is set, `push_idx` of this segment is final
            let next = segment.next.load(super::LOAD_ORDER);
            let popped = segment.pop_idx.load(Ordering::Relaxed);

            if popped != segment.push_idx.load(super::LOAD_ORDER) {
                let slot: *const UnsafeCell<u64> = &segment.slots[popped % N];
                let raw = unsafe { UnsafeCellHelper::read(slot) };
                segment.pop_idx.store(popped + 1, Ordering::Release);
                log::trace!("Pop at {:p}[{}]", segment, popped % N);
                return Value::new(raw);
            }

            let next = NonNull::new(next)?;
            let drained = mem::replace(&mut *head, next);
            log::debug!("Ring segment freed: {:p}, head -> {:p}", drained, next);
            drop(unsafe { Box::from_raw(drained.as_ptr()) });
        }
    }

    fn is_empty(&self) -> bool {
        let head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cursor = head.as_ptr();
        while let Some(segment) = unsafe { cursor.as_ref() } {
            let next = segment.next.load(super::LOAD_ORDER);
            let popped = segment.pop_idx.load(Ordering::Relaxed);
            if segment.push_idx.load(super::LOAD_ORDER) != popped {
                return false;
            }
            cursor = next;
        }
        true
    }
}

impl<const N: usize> Drop for RingQueue<N> {
    fn drop(&mut self) {
        let head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cursor = head.as_ptr();
        let mut count = 0;
        while !cursor.is_null() {
            let segment = unsafe { Box::from_raw(cursor) };
            cursor = segment.next.load(super::LOAD_ORDER);
            count += 1;
        }
        log::trace!("Drop: freed {} ring segments", count);
    }
}

#[cfg(test)]
use super::{val, SegQueue};

#[test]
fn smoke() {
    super::test_smoke::<RingQueue<4>>();
}

#[test]
fn fifo_small_segments() {
    super::test_fifo::<RingQueue<4>>(13);
}

#[cfg(not(feature = "loom"))]
#[test]
fn fifo_one_past_segment() {
    super::test_fifo::<RingQueue>(RING_SIZE as u64 + 1);
}

#[test]
fn interleaved_retire() {
    super::test_interleaved_retire::<RingQueue<8>>();
}

#[cfg(not(feature = "loom"))]
#[test]
fn interleaved_retire_default() {
    super::test_interleaved_retire::<RingQueue>();
}

#[test]
fn model_check() {
    super::test_model::<RingQueue<4>>(0x5e9);
    super::test_model::<RingQueue<64>>(7);
}

#[cfg(not(feature = "loom"))]
#[test]
fn barrage() {
    super::test_barrage::<RingQueue>();
}

#[test]
fn barrage_tiny_segments() {
    super::test_barrage::<RingQueue<2>>();
}

#[test]
fn full_ring_allocation_failure() {
    super::test_alloc_failure::<RingQueue<8>>(mem::size_of::<RingSegment<8>>());
}

#[test]
fn wraparound_stays_in_one_segment() {
    super::model(|| {
        let sq = RingQueue::<4>::new().unwrap();
        let mut next_push = 1;
        let mut next_pop = 1;
        for _ in 0..3 {
            sq.push(val(next_push)).unwrap();
            next_push += 1;
        }
        for _ in 0..10 {
            sq.push(val(next_push)).unwrap();
            next_push += 1;
            assert_eq!(sq.pop(), Some(val(next_pop)));
            next_pop += 1;
        }
        // the ring index went past 4 several times without growing the chain
        assert!(next_push > 8);
        assert_eq!(sq.segment_count(), 1);
        while next_pop < next_push {
            assert_eq!(sq.pop(), Some(val(next_pop)));
            next_pop += 1;
        }
        assert!(sq.is_empty());
    })
}

#[test]
fn full_ring_links_and_frees() {
    super::model(|| {
        let sq = RingQueue::<4>::new().unwrap();
        for raw in 1..=5 {
            sq.push(val(raw)).unwrap();
        }
        assert_eq!(sq.segment_count(), 2);
        for raw in 1..=4 {
            assert_eq!(sq.pop(), Some(val(raw)));
        }
        assert_eq!(sq.segment_count(), 2);
        assert!(!sq.is_empty());
        assert_eq!(sq.pop(), Some(val(5)));
        assert_eq!(sq.segment_count(), 1);
        assert_eq!(sq.pop(), None);
        assert!(sq.is_empty());
    })
}

#[test]
fn single_slot_segments_chain() {
    super::model(|| {
        let sq = RingQueue::<1>::new().unwrap();
        for raw in 1..=4 {
            sq.push(val(raw)).unwrap();
        }
        assert_eq!(sq.segment_count(), 4);
        for raw in 1..=4 {
            assert_eq!(sq.pop(), Some(val(raw)));
        }
        assert_eq!(sq.segment_count(), 1);
        assert_eq!(sq.pop(), None);
    })
}

use super::{
    qstd::{
        hint,
        sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    QueueError, Value, EMPTY, TAKEN,
};
use crossbeam_utils::CachePadded;
use haphazard::{Domain, HazardPointer};
use std::{array, mem, ptr, sync::atomic::AtomicPtr};

/// Default number of slots in one segment.
pub const BUFFER_SIZE: usize = 1024;

/// Family of the per-queue reclamation domain.
struct Segments;

struct Segment<const N: usize> {
    /// Set once, by the producer that appended the successor.
    next: AtomicPtr<Segment<N>>,
    slots: [AtomicU64; N],
    /// Never wraps; values past `N` mean producers moved on.
    push_idx: AtomicUsize,
    /// Never wraps; values past `N` mean consumers moved on.
    pop_idx: AtomicUsize,
}

impl<const N: usize> Segment<N> {
    fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            slots: array::from_fn(|_| AtomicU64::new(EMPTY)),
            push_idx: AtomicUsize::new(0),
            pop_idx: AtomicUsize::new(0),
        }
    }

    fn with_first(value: Value) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            slots: array::from_fn(|i| AtomicU64::new(if i == 0 { value.get() } else { EMPTY })),
            push_idx: AtomicUsize::new(1),
            pop_idx: AtomicUsize::new(0),
        }
    }

    /// Every index a producer claimed here has also been claimed by a consumer.
    fn is_drained(&self) -> bool {
        let claimed = self.push_idx.load(super::LOAD_ORDER).min(N);
        self.pop_idx.load(super::LOAD_ORDER).min(N) >= claimed
    }
}

/// Unbounded lock-free MPMC queue of array segments.
///
/// ## Principle
/// Each segment is written at most once per slot. Producers and consumers
/// claim slot indices with a fetch-and-add on the segment cursors, so two
/// calls never own the same index from the same side. A producer commits
/// with a CAS `EMPTY -> value`; a consumer takes with a swap to `TAKEN`.
/// A consumer whose index a producer already claimed waits for the commit.
/// A consumer that gets ahead of every producer spends its slot instead, and
/// the late producer retries with a new index.
///
/// Once a cursor passes `N`, producers append a new segment through a CAS on
/// `tail`, consumers advance `head` through a CAS and retire the old segment
/// into the queue's own hazard-pointer domain. Every segment is dereferenced
/// only while a `HazardPointer` of that domain protects it.
pub struct SegmentQueue<const N: usize = BUFFER_SIZE> {
    head: CachePadded<AtomicPtr<Segment<N>>>,
    tail: CachePadded<AtomicPtr<Segment<N>>>,
    domain: Domain<Segments>,
}

impl<const N: usize> SegmentQueue<N> {
    const NON_EMPTY: () = assert!(N > 0, "segments need at least one slot");

    /// Publishes the current value of `source` in `hazard`. The result stays
    /// allocated until the hazard is reset or dropped; null means no segment.
    fn protect(
        hazard: &mut HazardPointer<'_, Segments>,
        source: &AtomicPtr<Segment<N>>,
    ) -> *mut Segment<N> {
        // SAFETY: segments reachable from `source` are only freed through
        // `Domain::retire_ptr` on the domain `hazard` belongs to.
        match unsafe { hazard.protect_ptr(source) } {
            Some((segment, _)) => segment.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    #[cfg(test)]
    fn segment_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head.load(super::LOAD_ORDER);
        while let Some(segment) = unsafe { cursor.as_ref() } {
            count += 1;
            cursor = segment.next.load(super::LOAD_ORDER);
        }
        count
    }
}

impl<const N: usize> super::SegQueue for SegmentQueue<N> {
    const SEGMENT_CAPACITY: usize = N;

    fn new() -> Result<Self, QueueError> {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_EMPTY;
        let first = super::try_box(Segment::<N>::new())?.as_ptr();
        log::trace!("New queue, first segment {:p}", first);
        Ok(Self {
            head: CachePadded::new(AtomicPtr::new(first)),
            tail: CachePadded::new(AtomicPtr::new(first)),
            domain: Domain::new(&Segments),
        })
    }

    #[profiling::function]
    fn push(&self, value: Value) -> Result<(), QueueError> {
        let mut hazard = HazardPointer::new_in_domain(&self.domain);
        loop {
            let tail = Self::protect(&mut hazard, &self.tail);
            let segment = unsafe { &*tail };
            let index = segment.push_idx.fetch_add(1, super::CAS_ORDER);

            if index < N {
                match segment.slots[index].compare_exchange(
                    EMPTY,
                    value.get(),
                    super::CAS_ORDER,
                    super::LOAD_ORDER,
                ) {
                    Ok(_) => {
                        log::trace!("Push committed at {:p}[{}]", tail, index);
                        return Ok(());
                    }
                    Err(other) => {
                        debug_assert_eq!(other, TAKEN);
                        log::trace!("Push found {:p}[{}] spent", tail, index);
                    }
                }
            } else if self.tail.load(super::LOAD_ORDER) == tail {
                let fresh = super::try_box(Segment::<N>::with_first(value))?.as_ptr();
                match self.tail.compare_exchange(
                    tail,
                    fresh,
                    super::PROTECT_ORDER,
                    super::LOAD_ORDER,
                ) {
                    Ok(_) => {
                        segment.next.store(fresh, Ordering::Release);
                        log::debug!("Segment appended: {:p} -> {:p}", tail, fresh);
                        return Ok(());
                    }
                    Err(other) => {
                        log::trace!("Append lost to {:p}", other);
                        // never published
                        drop(unsafe { Box::from_raw(fresh) });
                    }
                }
            }
            hint::spin_loop();
        }
    }

    #[profiling::function]
    fn pop(&self) -> Option<Value> {
        let mut hazard = HazardPointer::new_in_domain(&self.domain);
        loop {
            let head = Self::protect(&mut hazard, &self.head);
            let segment = unsafe { &*head };

            let taken = segment.pop_idx.load(super::LOAD_ORDER);
            if taken < N && taken >= segment.push_idx.load(super::LOAD_ORDER) {
                // nothing claimed by producers beyond the consumers
                return None;
            }

            let index = segment.pop_idx.fetch_add(1, super::CAS_ORDER);
            if index < N {
                let slot = &segment.slots[index];
                if segment.push_idx.load(super::LOAD_ORDER) > index {
                    // the producer owning `index` is between claim and commit
                    while slot.load(super::LOAD_ORDER) == EMPTY {
                        hint::spin_loop();
                    }
                }
                let raw = slot.swap(TAKEN, super::CAS_ORDER);
                debug_assert_ne!(raw, TAKEN);
                match Value::new(raw) {
                    Some(value) => return Some(value),
                    None => log::trace!("Pop spent empty {:p}[{}]", head, index),
                }
            } else {
                let next = segment.next.load(super::LOAD_ORDER);
                if next.is_null() {
                    return None;
                }
                // `head` stays protected, so its address cannot be recycled under the CAS
                if self
                    .head
                    .compare_exchange(head, next, super::PROTECT_ORDER, super::LOAD_ORDER)
                    .is_ok()
                {
                    log::debug!("Segment retired: {:p}, head -> {:p}", head, next);
                    hazard.reset_protection();
                    // SAFETY: `head` came from `try_box`, is unlinked now, and
                    // only the CAS winner retires it.
                    unsafe { self.domain.retire_ptr::<_, Box<_>>(head) };
                }
            }
            hint::spin_loop();
        }
    }

    fn is_empty(&self) -> bool {
        let mut anchor_hazard = HazardPointer::new_in_domain(&self.domain);
        let mut current_hazard = HazardPointer::new_in_domain(&self.domain);
        let mut next_hazard = HazardPointer::new_in_domain(&self.domain);
        'restart: loop {
            let anchor = Self::protect(&mut anchor_hazard, &self.head);
            let mut current = anchor;
            loop {
                let segment = unsafe { &*current };
                if !segment.is_drained() {
                    return false;
                }
                let next = Self::protect(&mut next_hazard, &segment.next);
                if next.is_null() {
                    return true;
                }
                // segments behind an unmoved head are never retired
                if self.head.load(super::PROTECT_ORDER) != anchor {
                    continue 'restart;
                }
                current = next;
                mem::swap(&mut current_hazard, &mut next_hazard);
            }
        }
    }
}

impl<const N: usize> Drop for SegmentQueue<N> {
    fn drop(&mut self) {
        let mut cursor = self.head.load(super::LOAD_ORDER);
        let mut count = 0;
        while !cursor.is_null() {
            let segment = unsafe { Box::from_raw(cursor) };
            cursor = segment.next.load(super::LOAD_ORDER);
            count += 1;
        }
        log::trace!("Drop: freed {} segments", count);
    }
}

#[cfg(test)]
use super::{val, SegQueue};

#[test]
fn smoke() {
    super::test_smoke::<SegmentQueue<4>>();
}

#[test]
fn fifo_small_segments() {
    super::test_fifo::<SegmentQueue<4>>(13);
}

#[cfg(not(feature = "loom"))]
#[test]
fn fifo_one_past_segment() {
    super::test_fifo::<SegmentQueue>(BUFFER_SIZE as u64 + 1);
}

#[test]
fn interleaved_retire() {
    super::test_interleaved_retire::<SegmentQueue<8>>();
}

#[cfg(not(feature = "loom"))]
#[test]
fn interleaved_retire_default() {
    super::test_interleaved_retire::<SegmentQueue>();
}

#[test]
fn model_check() {
    super::test_model::<SegmentQueue<4>>(0x5e9);
    super::test_model::<SegmentQueue<64>>(7);
}

#[cfg(not(feature = "loom"))]
#[test]
fn barrage() {
    super::test_barrage::<SegmentQueue>();
}

#[test]
fn barrage_tiny_segments() {
    super::test_barrage::<SegmentQueue<2>>();
}

#[test]
fn append_failure_keeps_queue() {
    super::test_alloc_failure::<SegmentQueue<8>>(mem::size_of::<Segment<8>>());
}

#[test]
fn append_links_one_segment_per_boundary() {
    super::model(|| {
        let sq = SegmentQueue::<4>::new().unwrap();
        assert_eq!(sq.segment_count(), 1);
        for raw in 1..=9 {
            sq.push(val(raw)).unwrap();
        }
        assert_eq!(sq.segment_count(), 3);
    })
}

#[test]
fn drained_segments_are_retired() {
    super::model(|| {
        let sq = SegmentQueue::<2>::new().unwrap();
        for raw in 1..=6 {
            sq.push(val(raw)).unwrap();
        }
        for raw in 1..=6 {
            assert_eq!(sq.pop(), Some(val(raw)));
        }
        assert_eq!(sq.pop(), None);
        assert_eq!(sq.segment_count(), 1);
        // both unlinked heads are unprotected, so one pass frees whatever
        // the retiring pops left behind
        assert!(sq.domain.eager_reclaim() <= 2);
        assert_eq!(sq.domain.eager_reclaim(), 0);
    })
}

#[test]
fn protected_segment_outlives_retire() {
    super::model(|| {
        let sq = SegmentQueue::<2>::new().unwrap();
        for raw in 1..=3 {
            sq.push(val(raw)).unwrap();
        }

        let mut reader = HazardPointer::new_in_domain(&sq.domain);
        let stale = SegmentQueue::<2>::protect(&mut reader, &*sq.head);
        assert_eq!(sq.pop(), Some(val(1)));
        assert_eq!(sq.pop(), Some(val(2)));
        // crosses into the second segment, retiring the first one
        assert_eq!(sq.pop(), Some(val(3)));
        assert_ne!(sq.head.load(super::LOAD_ORDER), stale);
        assert_eq!(sq.domain.eager_reclaim(), 0);

        // still readable through the stale pointer
        let segment = unsafe { &*stale };
        assert!(segment.is_drained());
        assert!(!segment.next.load(super::LOAD_ORDER).is_null());

        reader.reset_protection();
        assert_eq!(sq.domain.eager_reclaim(), 1);
        drop(reader);
    })
}

#[test]
fn spent_slot_redirects_producer() {
    super::model(|| {
        let sq = SegmentQueue::<4>::new().unwrap();
        // a consumer claims index 0 before any producer and spends it
        let head = unsafe { &*sq.head.load(super::LOAD_ORDER) };
        head.pop_idx.fetch_add(1, super::CAS_ORDER);
        head.slots[0].swap(TAKEN, super::CAS_ORDER);

        sq.push(val(11)).unwrap();
        assert_eq!(head.slots[1].load(super::LOAD_ORDER), 11);
        assert_eq!(head.push_idx.load(super::LOAD_ORDER), 2);
        assert_eq!(sq.pop(), Some(val(11)));
        assert!(sq.is_empty());
    })
}

#[test]
fn pop_waits_for_claimed_slot() {
    use super::qstd::{sync::Arc, thread};

    super::model(|| {
        let sq = Arc::new(SegmentQueue::<4>::new().unwrap());
        // a producer that claimed index 0 and has not committed yet
        let head = sq.head.load(super::LOAD_ORDER);
        let claimed = unsafe { &*head }.push_idx.fetch_add(1, super::CAS_ORDER);
        assert_eq!(claimed, 0);

        let sq2 = Arc::clone(&sq);
        let consumer = thread::spawn(move || sq2.pop());
        // commit only once the consumer has claimed index 0
        while unsafe { &*head }.pop_idx.load(super::LOAD_ORDER) == 0 {
            thread::yield_now();
        }
        let commit = unsafe { &*head }.slots[0].compare_exchange(
            EMPTY,
            val(7).get(),
            super::CAS_ORDER,
            super::LOAD_ORDER,
        );
        assert_eq!(commit, Ok(EMPTY));

        assert_eq!(consumer.join().unwrap(), Some(val(7)));
        assert!(sq.is_empty());
        sq.push(val(8)).unwrap();
        assert_eq!(sq.pop(), Some(val(8)));
    })
}

#[test]
fn queues_reclaim_independently() {
    super::model(|| {
        let first = SegmentQueue::<2>::new().unwrap();
        let second = SegmentQueue::<2>::new().unwrap();
        for raw in 1..=5 {
            first.push(val(raw)).unwrap();
            second.push(val(raw + 100)).unwrap();
        }

        let mut reader = HazardPointer::new_in_domain(&first.domain);
        let stale = SegmentQueue::<2>::protect(&mut reader, &*first.head);
        for raw in 1..=3 {
            assert_eq!(first.pop(), Some(val(raw)));
        }
        assert_ne!(first.head.load(super::LOAD_ORDER), stale);
        assert_eq!(second.domain.eager_reclaim(), 0);
        assert_eq!(first.domain.eager_reclaim(), 0);
        drop(reader);
        assert_eq!(first.domain.eager_reclaim(), 1);

        for raw in 1..=5 {
            assert_eq!(second.pop(), Some(val(raw + 100)));
        }
        drop(first);
        assert!(second.is_empty());
        assert_eq!(second.domain.eager_reclaim(), 0);
    })
}

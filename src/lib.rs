mod error;
mod ring;
mod segment;
mod value;

pub use error::QueueError;
pub use ring::{RingQueue, RING_SIZE};
pub use segment::{SegmentQueue, BUFFER_SIZE};
pub use value::{Value, EMPTY, TAKEN};

#[cfg(feature = "loom")]
use loom as qstd;
#[cfg(not(feature = "loom"))]
use std as qstd;

use qstd::sync::atomic::Ordering;
use std::{alloc::Layout, ptr::NonNull};

const CAS_ORDER: Ordering = Ordering::AcqRel;
const LOAD_ORDER: Ordering = Ordering::Acquire;
/// Ordering for the CASes that move `head`/`tail` and the loads that
/// re-check them after a hazard pointer is published.
const PROTECT_ORDER: Ordering = Ordering::SeqCst;

/// Unbounded MPMC FIFO built out of fixed-capacity segments.
///
/// `pop` never blocks: `None` stands for the `EMPTY` sentinel and only means
/// nothing was available at the instant of the call.
pub trait SegQueue: Send + Sync + Sized {
    /// Number of slots in one segment.
    const SEGMENT_CAPACITY: usize;

    fn new() -> Result<Self, QueueError>;
    fn push(&self, value: Value) -> Result<(), QueueError>;
    fn pop(&self) -> Option<Value>;
    /// Best-effort snapshot, only meaningful as a momentary observation.
    fn is_empty(&self) -> bool;
}

trait UnsafeCellHelper<T> {
    unsafe fn write(this: *const Self, value: T);
    unsafe fn read(this: *const Self) -> T
    where
        T: Copy;
}

impl<T> UnsafeCellHelper<T> for std::cell::UnsafeCell<T> {
    unsafe fn write(this: *const Self, value: T) {
        std::cell::UnsafeCell::raw_get(this).write(value);
    }
    unsafe fn read(this: *const Self) -> T
    where
        T: Copy,
    {
        *std::cell::UnsafeCell::raw_get(this)
    }
}

#[cfg(feature = "loom")]
impl<T> UnsafeCellHelper<T> for loom::cell::UnsafeCell<T> {
    unsafe fn write(this: *const Self, value: T) {
        (*this).with_mut(|pointer| std::ptr::write(pointer, value));
    }
    unsafe fn read(this: *const Self) -> T
    where
        T: Copy,
    {
        (*this).with(|pointer| *pointer)
    }
}

/// Moves `value` into a fresh heap allocation, reporting exhaustion instead
/// of aborting. The result can be released with `Box::from_raw`.
fn try_box<T>(value: T) -> Result<NonNull<T>, QueueError> {
    let layout = Layout::new::<T>();
    debug_assert_ne!(layout.size(), 0);
    let raw = unsafe { std::alloc::alloc(layout) }.cast::<T>();
    match NonNull::new(raw) {
        Some(pointer) => {
            unsafe { pointer.as_ptr().write(value) };
            Ok(pointer)
        }
        None => {
            log::error!("Segment allocation of {} bytes failed", layout.size());
            Err(QueueError::Alloc {
                bytes: layout.size(),
            })
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod loom {
    pub fn model(mut fun: impl FnMut()) {
        fun();
    }
}

/// System allocator that refuses allocations of one exact size, on the
/// current thread only.
#[cfg(test)]
mod refuse {
    use std::{
        alloc::{GlobalAlloc, Layout, System},
        cell::Cell,
        ptr,
    };

    thread_local! {
        static SIZE: Cell<usize> = const { Cell::new(0) };
    }

    struct Refusing;

    unsafe impl GlobalAlloc for Refusing {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            match SIZE.try_with(Cell::get) {
                Ok(size) if size != 0 && size == layout.size() => ptr::null_mut(),
                _ => System.alloc(layout),
            }
        }
        unsafe fn dealloc(&self, pointer: *mut u8, layout: Layout) {
            System.dealloc(pointer, layout)
        }
    }

    #[global_allocator]
    static GLOBAL: Refusing = Refusing;

    pub fn sized<R>(size: usize, fun: impl FnOnce() -> R) -> R {
        SIZE.with(|cell| cell.set(size));
        let result = fun();
        SIZE.with(|cell| cell.set(0));
        result
    }
}

#[cfg(test)]
fn model<F: Fn() + Sync + Send + 'static>(fun: F) {
    loom::model(fun);
}

#[cfg(test)]
fn val(raw: u64) -> Value {
    Value::new(raw).unwrap()
}

#[cfg(test)]
fn test_smoke<Q: SegQueue + 'static>() {
    loom::model(|| {
        let sq = Q::new().unwrap();
        assert!(sq.is_empty());
        assert_eq!(sq.pop(), None);
        for raw in [10, 20, 30] {
            sq.push(val(raw)).unwrap();
        }
        assert!(!sq.is_empty());
        assert_eq!(sq.pop(), Some(val(10)));
        assert_eq!(sq.pop(), Some(val(20)));
        assert_eq!(sq.pop(), Some(val(30)));
        assert_eq!(sq.pop(), None);
        assert!(sq.is_empty());
    })
}

/// Fill `count` values, then drain them; crosses segment boundaries whenever
/// `count` exceeds the segment capacity.
#[cfg(test)]
fn test_fifo<Q: SegQueue + 'static>(count: u64) {
    loom::model(move || {
        let sq = Q::new().unwrap();
        for raw in 1..=count {
            sq.push(val(raw)).unwrap();
        }
        for raw in 1..=count {
            assert_eq!(sq.pop(), Some(val(raw)));
        }
        assert_eq!(sq.pop(), None);
        assert!(sq.is_empty());
    })
}

/// `capacity + 3` pushes interleaved with `capacity` pops, so the head segment
/// is retired while values are still queued behind it.
#[cfg(test)]
fn test_interleaved_retire<Q: SegQueue + 'static>() {
    loom::model(|| {
        let capacity = Q::SEGMENT_CAPACITY as u64;
        let sq = Q::new().unwrap();
        let mut next_push = 1;
        let mut next_pop = 1;
        while next_push <= capacity + 3 {
            sq.push(val(next_push)).unwrap();
            next_push += 1;
            if next_push % 2 == 0 && next_pop <= capacity {
                assert_eq!(sq.pop(), Some(val(next_pop)));
                next_pop += 1;
            }
        }
        while next_pop <= capacity {
            assert_eq!(sq.pop(), Some(val(next_pop)));
            next_pop += 1;
        }
        assert!(!sq.is_empty());
        for raw in capacity + 1..=capacity + 3 {
            assert_eq!(sq.pop(), Some(val(raw)));
        }
        assert_eq!(sq.pop(), None);
        assert!(sq.is_empty());
    })
}

/// Random push/pop mix checked against `VecDeque`.
#[cfg(test)]
fn test_model<Q: SegQueue + 'static>(seed: u64) {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::VecDeque;

    loom::model(move || {
        const NUM_OPS: usize = if cfg!(any(miri, feature = "loom")) { 64 } else { 1 << 14 };
        let mut rng = StdRng::seed_from_u64(seed);
        let sq = Q::new().unwrap();
        let mut model = VecDeque::new();
        let mut counter = 0;
        for _ in 0..NUM_OPS {
            if rng.gen_bool(0.55) {
                counter += 1;
                sq.push(val(counter)).unwrap();
                model.push_back(val(counter));
            } else {
                assert_eq!(sq.pop(), model.pop_front());
            }
            assert_eq!(sq.is_empty(), model.is_empty());
        }
        while let Some(expected) = model.pop_front() {
            assert_eq!(sq.pop(), Some(expected));
        }
        assert_eq!(sq.pop(), None);
    })
}

/// Fills one segment, then makes the next segment allocation fail: `push`
/// reports it and every earlier value still comes out in order.
#[cfg(test)]
fn test_alloc_failure<Q: SegQueue + 'static>(segment_bytes: usize) {
    loom::model(move || {
        let capacity = Q::SEGMENT_CAPACITY as u64;
        let sq = Q::new().unwrap();
        for raw in 1..=capacity {
            sq.push(val(raw)).unwrap();
        }
        let refused = refuse::sized(segment_bytes, || sq.push(val(capacity + 1)));
        assert_eq!(
            refused,
            Err(QueueError::Alloc {
                bytes: segment_bytes
            })
        );
        assert!(!sq.is_empty());
        for raw in 1..=capacity {
            assert_eq!(sq.pop(), Some(val(raw)));
        }
        assert_eq!(sq.pop(), None);
        assert!(sq.is_empty());

        sq.push(val(capacity + 1)).unwrap();
        assert_eq!(sq.pop(), Some(val(capacity + 1)));
        assert!(sq.is_empty());
    })
}

/// Concurrent producers and consumers; every pushed value comes out exactly once.
#[cfg(test)]
fn test_barrage<Q: SegQueue + 'static>() {
    use qstd::{
        sync::{atomic::AtomicUsize, Arc},
        thread,
    };

    loom::model(|| {
        const NUM_THREADS: usize = if cfg!(feature = "loom") {
            1
        } else if cfg!(miri) {
            2
        } else {
            4
        };
        const NUM_ELEMENTS: usize = if cfg!(feature = "loom") {
            2
        } else if cfg!(miri) {
            1 << 7
        } else {
            1 << 14
        };
        const TOTAL: usize = NUM_THREADS * NUM_ELEMENTS;

        let sq = Arc::new(Q::new().unwrap());
        let popped = Arc::new(AtomicUsize::new(0));
        let mut producers = Vec::new();
        let mut consumers = Vec::new();

        for t in 0..NUM_THREADS {
            let sq2 = Arc::clone(&sq);
            producers.push(thread::spawn(move || {
                for i in 0..NUM_ELEMENTS {
                    sq2.push(val((t * NUM_ELEMENTS + i + 1) as u64)).unwrap();
                }
            }));
        }
        for _ in 0..NUM_THREADS {
            let sq3 = Arc::clone(&sq);
            let popped3 = Arc::clone(&popped);
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while popped3.load(LOAD_ORDER) < TOTAL {
                    match sq3.pop() {
                        Some(value) => {
                            popped3.fetch_add(1, CAS_ORDER);
                            seen.push(value.get());
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            }));
        }

        for jt in producers {
            jt.join().unwrap();
        }
        let mut all = Vec::with_capacity(TOTAL);
        for jt in consumers {
            let seen = jt.join().unwrap();
            // per-producer order survives
            let mut last = vec![0u64; NUM_THREADS];
            for &raw in &seen {
                let producer = (raw as usize - 1) / NUM_ELEMENTS;
                assert!(raw > last[producer]);
                last[producer] = raw;
            }
            all.extend(seen);
        }
        all.sort_unstable();
        assert_eq!(all, (1..=TOTAL as u64).collect::<Vec<_>>());
        assert!(sq.is_empty());
        assert_eq!(sq.pop(), None);
    })
}

use super::QueueError;
use std::fmt;

/// Raw slot content of a slot that was never written, or was already drained.
pub const EMPTY: u64 = 0;
/// Raw slot content of a slot whose index a consumer has already spent.
pub const TAKEN: u64 = u64::MAX;

/// Opaque fixed-width payload stored in queue slots.
///
/// A `Value` is never equal to one of the sentinels, so anything that
/// reaches `push` is a legal payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// Returns `None` for `EMPTY` and `TAKEN`.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match raw {
            EMPTY | TAKEN => None,
            _ => Some(Self(raw)),
        }
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Sentinel encoding of a `pop` result: `None` becomes `EMPTY`.
    #[inline]
    pub const fn into_raw(popped: Option<Self>) -> u64 {
        match popped {
            Some(value) => value.0,
            None => EMPTY,
        }
    }
}

impl TryFrom<u64> for Value {
    type Error = QueueError;

    fn try_from(raw: u64) -> Result<Self, QueueError> {
        Self::new(raw).ok_or(QueueError::Reserved(raw))
    }
}

impl From<Value> for u64 {
    fn from(value: Value) -> u64 {
        value.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:#x})", self.0)
    }
}

#[test]
fn sentinels_rejected() {
    assert_eq!(Value::new(EMPTY), None);
    assert_eq!(Value::new(TAKEN), None);
    assert_eq!(Value::try_from(TAKEN), Err(QueueError::Reserved(TAKEN)));
    assert_eq!(Value::try_from(7).map(u64::from), Ok(7));
}

#[test]
fn raw_encoding() {
    assert_eq!(Value::into_raw(None), EMPTY);
    assert_eq!(Value::into_raw(Value::new(42)), 42);
    assert_eq!(Value::new(Value::into_raw(None)), None);
}

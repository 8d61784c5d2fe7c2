use thiserror::Error;

/// Failures reported by queue construction and `push`.
///
/// An empty queue is not an error: `pop` reports it as `None`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Segment allocation of {bytes} bytes failed")]
    Alloc { bytes: usize },

    #[error("Value {0:#x} is reserved as a slot sentinel")]
    Reserved(u64),
}

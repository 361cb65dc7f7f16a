use crate::queue::QueuedAction;
use crate::sync::FlushReport;

/// Per-action outcomes published while a flush runs
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// Handler accepted the action and it left the queue
  Succeeded { id: String },
  /// Handler failed; the action stays queued with the new retry count
  Retrying { id: String, retries: u32 },
  /// Retry budget exhausted; the action was removed without being delivered
  Dropped(QueuedAction),
  /// A flush finished
  Flushed(FlushReport),
}

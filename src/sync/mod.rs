//! Replays the durable action queue when connectivity allows.

mod connectivity;
mod orchestrator;

pub use connectivity::{spawn_probe, Connectivity, Reachability};
pub use orchestrator::{
  ActionHandler, FlushReport, Registration, SyncOrchestrator, DEFAULT_MAX_RETRIES,
};

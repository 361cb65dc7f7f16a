//! HTTP side of the offline layer: the network behind the cache, the backend
//! that queued actions are replayed against, and the reachability probe.

mod client;
mod handler;
#[cfg(test)]
mod test_server;

pub use client::{HttpNetwork, HttpProbe};
pub use handler::BackendHandler;

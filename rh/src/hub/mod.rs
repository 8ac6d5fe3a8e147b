//! Broadcast hub
//!
//! The hub is a single actor task that owns the subscriber registry. Every
//! registry mutation (connect, disconnect) and every fan-out iteration is a
//! request on one channel, so they are serialized without shared maps.
//!
//! Per session: `Connecting -> Active -> Disconnected`. When the hub has a
//! journal, a connecting session first receives its catch-up (events after
//! its resume offset) and only then live events; live events that arrive
//! during catch-up are buffered and de-duplicated against it by offset.

mod config;
mod core;
mod handle;
mod messages;

pub use config::HubConfig;
pub use core::Hub;
pub use handle::{HubHandle, Subscription};
pub use messages::{CatchUpProgress, HubError, HubMetrics, HubRequest, Outbound};

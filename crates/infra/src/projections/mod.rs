//! Projections: read models built from published session events.
//!
//! Projections are rebuildable from the event stream, tenant-isolated and
//! idempotent under at-least-once delivery.

pub mod counting_sessions;

pub use counting_sessions::{
    CountingSessionsProjection, SessionListEntry, SessionsProjectionError,
};

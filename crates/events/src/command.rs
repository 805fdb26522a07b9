use stocktake_core::AggregateId;

/// A command targets exactly one aggregate stream.
///
/// Commands are transient intent ("submit 48 units for item X"); the
/// aggregate turns accepted commands into events, which are the only thing
/// persisted. Routing and per-stream serialization key off
/// `target_aggregate_id()`.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}

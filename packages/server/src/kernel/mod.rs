//! Kernel module - server infrastructure and dependencies.

pub mod bus;
pub mod deps;
pub mod event_sink;
pub mod test_dependencies;

pub use bus::{BusError, BusEvent, MemoryBackend, NatsBackend, ReplicationBus};
pub use deps::ServerDeps;
pub use event_sink::{EventSink, GameLogEvent, GameLogKind, RecordingEventSink, TracingEventSink};
pub use test_dependencies::TestDependencies;

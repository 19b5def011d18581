// crates/streamkeeper-core/src/lib.rs
//
// Shared data model for the failover compositor: configuration, the error
// taxonomy, the status-event wire format, and the plain frame/sample types
// that flow between streamkeeper-media and streamkeeper-engine.
//
// No ffmpeg, no threads here — just types and pure functions, so engine and
// media can both depend on this without pulling in each other.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::Config;
pub use error::Error;
pub use events::{
    DropReason, EventKind, EventSink, RecordingEventSink, SharedEventSink, StatusEvent,
    WriterEventSink,
};
pub use types::{AudioMode, AudioSamples, VideoFrame};

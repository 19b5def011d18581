// crates/streamkeeper-media/src/lib.rs
//
// ffmpeg-the-third lives behind this crate only. streamkeeper-engine talks
// to `Source` and `Muxer`, never to ffmpeg directly.

pub mod mux;
pub mod source;
mod helpers; // internal — not re-exported

pub use mux::{MediaSink, Muxer};
pub use source::{
    Decoded, FallbackDecoder, FallbackEvent, OutputFormat, Readout, Source, SourceMode,
};

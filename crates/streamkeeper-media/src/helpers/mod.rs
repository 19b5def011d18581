// crates/streamkeeper-media/src/helpers/mod.rs
//
// Internal helper modules for streamkeeper-media. Not re-exported from
// lib.rs — these are Source/Muxer implementation details.

pub mod yuv;
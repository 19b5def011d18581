// crates/streamkeeper-core/src/error.rs
//
// The error taxonomy from spec §7, as a single typed enum. Which kinds are
// fatal vs. locally-recovered is a property of *who catches them*, not of
// the type itself — see streamkeeper-engine's ingestion/compositor modules
// for the propagation policy.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing required configuration. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// Cannot open the fallback source at startup. Fatal.
    #[error("cannot open fallback source '{path}': {reason}")]
    FallbackOpen { path: PathBuf, reason: String },

    /// Encoder construction failed at startup. Fatal.
    #[error("encoder setup failed: {0}")]
    EncoderSetup(String),

    /// Output sink could not be opened at startup. Fatal.
    #[error("could not open output sink: {0}")]
    SinkOpen(String),

    /// Transient: failed to connect to the primary source. Recovered by C3.
    #[error("primary connect failed: {0}")]
    PrimaryConnect(String),

    /// Transient: a read/decode error on the primary source. Recovered by C3.
    #[error("primary read error: {0}")]
    PrimaryRead(String),

    /// Transient: the primary source stopped producing activity within the
    /// configured stall timeout. Recovered by C3.
    #[error("primary source stalled")]
    PrimaryStall,

    /// A read/decode error on the fallback source. Recovered via loop_reset;
    /// persistent failure degrades output but is not fatal.
    #[error("fallback read error: {0}")]
    FallbackRead(String),

    /// An encode or mux call failed at steady state. Fatal — the downstream
    /// mux state is unrecoverable mid-stream.
    #[error("encode error: {0}")]
    Encode(String),

    /// Writing encoded bytes to the output sink failed at steady state. Fatal.
    #[error("sink write error: {0}")]
    SinkWrite(String),
}

impl Error {
    /// Whether this error kind terminates the process per spec §4.5 /
    /// §7's propagation policy, as opposed to being recovered locally by
    /// the component that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::FallbackOpen { .. }
                | Error::EncoderSetup(_)
                | Error::SinkOpen(_)
                | Error::Encode(_)
                | Error::SinkWrite(_)
        )
    }
}

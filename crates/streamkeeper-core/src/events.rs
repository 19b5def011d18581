// crates/streamkeeper-core/src/events.rs
//
// The structured event wire format (spec §6 "Event channel"): one JSON
// object per line, `event` names one of a fixed set of kinds, `ts` and
// `stream_id` are always present.
//
// This is a protocol, not a logging facility — see SPEC_FULL.md §4.5 for
// why it's kept separate from `tracing`'s diagnostic output.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// One line on the event channel: common envelope fields plus the
/// event-specific payload flattened in via `EventKind`.
#[derive(Debug, Serialize)]
pub struct StatusEvent {
    pub ts: i64,
    pub stream_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    BgOpened,
    PrimaryConnected,
    PrimaryConnectFailed { message: String },
    PrimaryDropped { reason: DropReason },
    PrimaryActive,
    GraceEntered,
    FallbackAudioOn,
    VideoPrimary,
    VideoFallback,
    OutputReady { resolution: String, fps: u32, vbr: u64, abr: u64 },
    Running,
    Stats { fps: u32, primary_connected: bool, audio_mode: &'static str },
    Stopped,
    Done,
    Error { message: String },
    Warn { message: String },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    ReadError,
    Timeout,
}

/// Anything that can receive status events — abstracts over "stderr" so
/// tests can assert on emitted events instead of parsing captured output.
pub trait EventSink: Send {
    fn emit(&mut self, kind: EventKind);
}

/// The production sink: one JSON line per event, flushed immediately so the
/// downstream supervisor sees them promptly even if the output sink (a
/// separate stream) is backpressured.
pub struct WriterEventSink<W: Write + Send> {
    stream_id: String,
    writer: W,
}

impl<W: Write + Send> WriterEventSink<W> {
    pub fn new(stream_id: String, writer: W) -> Self {
        Self { stream_id, writer }
    }
}

impl<W: Write + Send> EventSink for WriterEventSink<W> {
    fn emit(&mut self, kind: EventKind) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let event = StatusEvent { ts, stream_id: self.stream_id.clone(), kind };
        match serde_json::to_string(&event) {
            Ok(line) => {
                let _ = writeln!(self.writer, "{line}");
                let _ = self.writer.flush();
            }
            Err(e) => {
                // Serialization of our own fixed enum should never fail;
                // if it somehow does, don't let that crash the compositor.
                eprintln!("[events] failed to serialize status event: {e}");
            }
        }
    }
}

/// Wraps any `EventSink` behind a mutex so the ingestion thread and the
/// compositor loop can both hold a handle to the same underlying sink
/// (spec §6: "a single event sink") without interleaving partial writes.
/// Cheap to clone; every clone emits to the same sink.
#[derive(Clone)]
pub struct SharedEventSink(Arc<Mutex<Box<dyn EventSink>>>);

impl SharedEventSink {
    pub fn new(inner: Box<dyn EventSink>) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }
}

impl EventSink for SharedEventSink {
    fn emit(&mut self, kind: EventKind) {
        self.0.lock().unwrap().emit(kind);
    }
}

/// In-memory sink for tests — collects every emitted kind in order.
#[derive(Default)]
pub struct RecordingEventSink {
    pub events: Vec<EventKind>,
}

impl EventSink for RecordingEventSink {
    fn emit(&mut self, kind: EventKind) {
        self.events.push(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag_and_envelope() {
        let event = StatusEvent {
            ts: 1234,
            stream_id: "s1".into(),
            kind: EventKind::PrimaryDropped { reason: DropReason::Timeout },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"primary_dropped""#));
        assert!(json.contains(r#""reason":"timeout""#));
        assert!(json.contains(r#""ts":1234"#));
        assert!(json.contains(r#""stream_id":"s1""#));
    }

    #[test]
    fn recording_sink_preserves_order() {
        let mut sink = RecordingEventSink::default();
        sink.emit(EventKind::Started);
        sink.emit(EventKind::BgOpened);
        assert_eq!(sink.events.len(), 2);
        assert!(matches!(sink.events[0], EventKind::Started));
        assert!(matches!(sink.events[1], EventKind::BgOpened));
    }

    #[test]
    fn writer_sink_emits_one_json_line() {
        let mut buf = Vec::new();
        {
            let mut sink = WriterEventSink::new("abc".into(), &mut buf);
            sink.emit(EventKind::Running);
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains(r#""event":"running""#));
    }
}

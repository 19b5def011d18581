// crates/streamkeeper-engine/src/ingestion.rs
//
// C3: the dedicated worker that owns the primary source's lifecycle end to
// end — connect, read, decode, publish, stall-detect, retry — and never
// touches the encoder or fallback path (spec §4.3). Grounded on the
// teacher's dedicated playback decode thread (crates/velocut-media/src/
// worker.rs, the `thread::spawn` block reading `pb_tx`/decoding/publishing
// in a loop) for the "spawn once, loop until cancelled, sleep in slices"
// shape; the retry/backoff structure is new (the teacher's playback thread
// has nothing to reconnect to).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use streamkeeper_core::{Config, DropReason, EventKind, EventSink};
use streamkeeper_media::{OutputFormat, Source, SourceMode};

use crate::handoff::HandoffBuffer;

/// Sleep in slices no longer than this so cancellation during a reconnect
/// wait is always prompt (spec §5: "terminate... within one retry slice
/// (≤ reconnect_delay / 10)").
fn sleep_cancellably(total: Duration, cancel: &Arc<AtomicBool>) {
    let slice = (total / 10).max(Duration::from_millis(1));
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Why the inner read/decode loop stopped, so the source can be closed and
/// the drop reason reported once in a single place rather than at each of
/// the loop's several exit points.
enum Disconnect {
    Cancelled,
    ReadError,
    EndOfStream,
    DecodeError,
    Stalled,
}

/// Runs C3's connect/read/decode/stall loop on the calling thread until
/// `cancel` is set. Intended to be spawned via `thread::spawn` by C5.
pub fn run(
    cfg: Arc<Config>,
    buffer: Arc<HandoffBuffer>,
    cancel: Arc<AtomicBool>,
    mut events: Box<dyn EventSink>,
) {
    let fmt = OutputFormat {
        width: cfg.out_width,
        height: cfg.out_height,
        sample_rate: cfg.sample_rate,
    };

    'reconnect: while !cancel.load(Ordering::Relaxed) {
        // Step 1: ensure connected.
        let mut source = match Source::open(
            &cfg.primary_url,
            SourceMode::Network,
            fmt,
            cfg.primary_timeout,
            &cancel,
        ) {
            Ok(s) => s,
            Err(e) => {
                events.emit(EventKind::PrimaryConnectFailed { message: e.to_string() });
                sleep_cancellably(cfg.primary_retry, &cancel);
                continue 'reconnect;
            }
        };

        buffer.mark_connected(true);
        events.emit(EventKind::PrimaryConnected);

        let outcome = loop {
            if cancel.load(Ordering::Relaxed) {
                break Disconnect::Cancelled;
            }

            // Step 2: read one packet.
            let readout = match source.read_one() {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "primary read error");
                    break Disconnect::ReadError;
                }
            };

            let packet = match readout {
                streamkeeper_media::Readout::Packet(p) => p,
                streamkeeper_media::Readout::EndOfStream => break Disconnect::EndOfStream,
            };

            // Step 3: decode and publish.
            match source.decode(packet) {
                Ok(streamkeeper_media::Decoded::Video(frame)) => buffer.publish_video(frame),
                Ok(streamkeeper_media::Decoded::Audio(samples)) => buffer.publish_audio(samples),
                Ok(streamkeeper_media::Decoded::None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "primary decode error");
                    break Disconnect::DecodeError;
                }
            }

            // Step 4: stall check.
            if buffer.last_activity_age() > cfg.primary_timeout {
                break Disconnect::Stalled;
            }
        };

        source.close();
        buffer.mark_connected(false);

        match outcome {
            Disconnect::Cancelled => break 'reconnect,
            Disconnect::Stalled => events.emit(EventKind::PrimaryDropped { reason: DropReason::Timeout }),
            Disconnect::ReadError | Disconnect::EndOfStream | Disconnect::DecodeError => {
                events.emit(EventKind::PrimaryDropped { reason: DropReason::ReadError });
            }
        }
    }

    buffer.mark_connected(false);
}

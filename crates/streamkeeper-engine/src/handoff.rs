// crates/streamkeeper-engine/src/handoff.rs
//
// C2: the single-slot video / bounded-FIFO audio buffer shared between the
// ingestion thread and the compositor loop. One mutex, no condvar — the
// compositor paces itself on a clock, never on buffer fullness (spec §5,
// §9 "Concurrency primitives"). Grounded on the teacher's latest-wins
// scrub slot (crates/velocut-media/src/worker.rs, `frame_req`), minus the
// condvar: that slot blocks a consumer until a frame arrives, ours never
// blocks — `try_take_video` returns immediately either way.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use streamkeeper_core::{AudioSamples, VideoFrame};

/// At least 2 seconds of audio at 48 kHz stereo (spec §3: "Capacity ≥ 2
/// seconds at output rate"). Sized for the worst-case sample rate this
/// crate defaults to; callers running at a lower rate just get more
/// headroom.
const AUDIO_CAPACITY_SAMPLES: usize = 48_000 * 2;

struct Inner {
    latest_video: Option<VideoFrame>,
    has_video: bool,
    audio: AudioSamples,
    connected: bool,
    last_activity: Instant,
}

/// C2. Construct once, share an `Arc` between the ingestion worker (writer)
/// and the compositor (reader).
pub struct HandoffBuffer {
    inner: Mutex<Inner>,
}

impl HandoffBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                latest_video: None,
                has_video: false,
                audio: AudioSamples::default(),
                connected: false,
                last_activity: Instant::now(),
            }),
        }
    }

    /// Overwrite the video slot (tail-drop) and mark activity.
    pub fn publish_video(&self, frame: VideoFrame) {
        let mut inner = self.inner.lock().unwrap();
        inner.latest_video = Some(frame);
        inner.has_video = true;
        inner.last_activity = Instant::now();
    }

    /// Append to the audio FIFO, dropping the oldest samples on overflow.
    pub fn publish_audio(&self, samples: AudioSamples) {
        let mut inner = self.inner.lock().unwrap();
        inner.audio.append(samples);
        let excess = inner.audio.len().saturating_sub(AUDIO_CAPACITY_SAMPLES);
        if excess > 0 {
            inner.audio.trim_front(excess);
        }
        inner.last_activity = Instant::now();
    }

    /// If connected and a frame is available, clone it out without
    /// clearing `has_video` — the compositor is allowed to repeat the same
    /// frame (spec §3: "the compositor can copy the same frame repeatedly
    /// if needed").
    pub fn try_take_video(&self) -> Option<VideoFrame> {
        let inner = self.inner.lock().unwrap();
        if inner.connected && inner.has_video {
            inner.latest_video.clone()
        } else {
            None
        }
    }

    /// Atomically move all queued audio out; empty after the call.
    pub fn drain_audio(&self) -> AudioSamples {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.audio)
    }

    /// Set the connection flag. Connecting resets `last_activity` (spec
    /// §4.3 step 1: "reset last_activity" on a successful reconnect), so a
    /// stall timeout measured against activity from before the outage can't
    /// immediately tear the new connection back down. Clearing it also
    /// clears `has_video` and empties the audio queue (spec §4.2), so
    /// nothing stale survives past a disconnect.
    pub fn mark_connected(&self, connected: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = connected;
        if connected {
            inner.last_activity = Instant::now();
        } else {
            inner.has_video = false;
            inner.audio.clear();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    pub fn last_activity_age(&self) -> Duration {
        self.inner.lock().unwrap().last_activity.elapsed()
    }
}

impl Default for HandoffBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_take_video_requires_connected_and_has_video() {
        let buf = HandoffBuffer::new();
        buf.publish_video(VideoFrame::blank(4, 2));
        assert!(buf.try_take_video().is_none(), "not connected yet");

        buf.mark_connected(true);
        assert!(buf.try_take_video().is_some());
    }

    #[test]
    fn try_take_video_does_not_clear_has_video() {
        let buf = HandoffBuffer::new();
        buf.mark_connected(true);
        buf.publish_video(VideoFrame::blank(2, 2));
        assert!(buf.try_take_video().is_some());
        assert!(buf.try_take_video().is_some(), "frame repetition must be allowed");
    }

    #[test]
    fn disconnect_clears_video_and_audio_atomically() {
        let buf = HandoffBuffer::new();
        buf.mark_connected(true);
        buf.publish_video(VideoFrame::blank(2, 2));
        buf.publish_audio(AudioSamples::silence(100));

        buf.mark_connected(false);
        assert!(buf.try_take_video().is_none());
        assert_eq!(buf.drain_audio().len(), 0);
    }

    #[test]
    fn publish_audio_drops_oldest_on_overflow() {
        let buf = HandoffBuffer::new();
        buf.publish_audio(AudioSamples::silence(AUDIO_CAPACITY_SAMPLES));
        buf.publish_audio(AudioSamples::silence(10));
        let drained = buf.drain_audio();
        assert_eq!(drained.len(), AUDIO_CAPACITY_SAMPLES);
    }

    #[test]
    fn mark_connected_resets_last_activity() {
        let buf = HandoffBuffer::new();
        buf.mark_connected(true);
        std::thread::sleep(Duration::from_millis(20));
        buf.mark_connected(false);
        buf.mark_connected(true);
        assert!(buf.last_activity_age() < Duration::from_millis(20), "reconnect must reset the activity clock");
    }

    #[test]
    fn drain_audio_empties_the_queue() {
        let buf = HandoffBuffer::new();
        buf.publish_audio(AudioSamples::silence(50));
        assert_eq!(buf.drain_audio().len(), 50);
        assert_eq!(buf.drain_audio().len(), 0);
    }
}

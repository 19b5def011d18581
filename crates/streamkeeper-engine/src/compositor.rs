// crates/streamkeeper-engine/src/compositor.rs
//
// C4: the paced main loop. Runs entirely on the calling thread — source
// selection, the audio-mode state machine, A/V PTS alignment, encode/mux,
// and pacing all happen here, one tick at a time (spec §4.4). Nothing in
// this module spawns a thread; the pacing "sleep if ahead, don't if
// behind" shape is the compositor's own analogue of the teacher's fixed-
// rate playback thread (crates/velocut-media/src/worker.rs's playback
// loop), generalized from "decode ahead into a channel" to "select a
// source and encode exactly one frame per tick."

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use streamkeeper_core::{AudioMode, AudioSamples, Config, Error, EventKind, EventSink, VideoFrame};
use streamkeeper_media::{FallbackDecoder, FallbackEvent, MediaSink};

use crate::handoff::HandoffBuffer;

/// Bounded per-tick retry count for the fallback decode pump (spec §4.4(a):
/// "bounded retry count per tick to avoid a hot loop on corrupt input").
const MAX_FALLBACK_RETRIES_PER_TICK: u32 = 8;

#[derive(Clone, Copy, PartialEq, Eq)]
enum VideoSource {
    Primary,
    Fallback,
}

pub struct Compositor<F: FallbackDecoder, M: MediaSink> {
    cfg: Arc<Config>,
    buffer: Arc<HandoffBuffer>,
    fallback: F,
    muxer: M,
    events: Box<dyn EventSink>,
    cancel: Arc<AtomicBool>,

    audio_mode: AudioMode,
    dropped_at: Option<Instant>,

    video_pts: i64,
    audio_pts: i64,

    primary_local_audio: AudioSamples,
    fallback_audio: AudioSamples,

    fallback_scratch: Option<VideoFrame>,
    last_emitted_video: Option<VideoFrame>,
    last_selected: Option<VideoSource>,
}

impl<F: FallbackDecoder, M: MediaSink> Compositor<F, M> {
    pub fn new(
        cfg: Arc<Config>,
        buffer: Arc<HandoffBuffer>,
        fallback: F,
        muxer: M,
        events: Box<dyn EventSink>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            buffer,
            fallback,
            muxer,
            events,
            cancel,
            audio_mode: AudioMode::default(),
            dropped_at: None,
            video_pts: 0,
            audio_pts: 0,
            primary_local_audio: AudioSamples::default(),
            fallback_audio: AudioSamples::default(),
            fallback_scratch: None,
            last_emitted_video: None,
            last_selected: None,
        }
    }

    /// Run ticks until `cancel` is observed. Returns `Ok(())` on a graceful
    /// stop, `Err` if a fatal encode/sink error terminated the loop early
    /// (spec §4.5: encoder/sink errors during a tick are fatal). Either way
    /// the encoder is flushed and the trailer written before returning.
    pub fn run(mut self) -> Result<(), Error> {
        self.events.emit(EventKind::Running);

        let frame_period = Duration::from_secs_f64(1.0 / self.cfg.out_fps as f64);
        let result = loop {
            if self.cancel.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.tick(frame_period) {
                break Err(e);
            }
        };

        self.events.emit(EventKind::Stopped);
        self.muxer.flush();
        self.events.emit(EventKind::Done);
        result
    }

    pub fn video_pts(&self) -> i64 {
        self.video_pts
    }

    pub fn audio_pts(&self) -> i64 {
        self.audio_pts
    }

    pub fn audio_mode(&self) -> AudioMode {
        self.audio_mode
    }

    /// Run a single tick. Exposed so callers that want a different pacing
    /// strategy (or a test harness driving ticks without real sleeps, via
    /// `frame_period: Duration::ZERO`) can step the compositor directly
    /// instead of going through `run`'s loop.
    pub fn tick(&mut self, frame_period: Duration) -> Result<(), Error> {
        let tick_start = Instant::now();

        self.pump_fallback();

        let primary_frame = self.buffer.try_take_video();
        let primary_available = primary_frame.is_some();

        self.select_and_emit_video(primary_frame)?;
        self.advance_audio_mode(primary_available);
        if self.audio_mode == AudioMode::Primary {
            self.drain_and_trim_primary_audio();
        }
        self.emit_audio_until_caught_up()?;

        let elapsed = tick_start.elapsed();
        if elapsed < frame_period {
            thread::sleep(frame_period - elapsed);
        }

        if self.cfg.out_fps > 0 && self.video_pts % self.cfg.out_fps as i64 == 0 {
            self.events.emit(EventKind::Stats {
                fps: self.cfg.out_fps,
                primary_connected: self.buffer.is_connected(),
                audio_mode: match self.audio_mode {
                    AudioMode::Primary => "primary",
                    AudioMode::Grace => "grace",
                    AudioMode::Fallback => "fallback",
                },
            });
        }

        Ok(())
    }

    /// (a) Fallback decode pump: advance the fallback source until a fresh
    /// video frame lands in `fallback_scratch`, looping on EndOfStream.
    fn pump_fallback(&mut self) {
        for _ in 0..MAX_FALLBACK_RETRIES_PER_TICK {
            match self.fallback.next_event() {
                Ok(FallbackEvent::Video(frame)) => {
                    self.fallback_scratch = Some(frame);
                    return;
                }
                Ok(FallbackEvent::Audio(samples)) => self.fallback_audio.append(samples),
                Ok(FallbackEvent::None) => {}
                Ok(FallbackEvent::EndOfStream) => {
                    if let Err(e) = self.fallback.loop_reset() {
                        tracing::warn!(error = %e, "fallback loop_reset failed");
                        self.events.emit(EventKind::Warn { message: e.to_string() });
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "fallback read error");
                    self.events.emit(EventKind::Warn { message: e.to_string() });
                    return;
                }
            }
        }
    }

    /// (c) Choose primary, cached fallback, or a repeated frame, and
    /// encode it at `video_pts`. Emits `video_primary` / `video_fallback`
    /// only on a selection change, not every tick.
    fn select_and_emit_video(&mut self, primary_frame: Option<VideoFrame>) -> Result<(), Error> {
        let (frame, selected) = if let Some(frame) = primary_frame {
            (frame, VideoSource::Primary)
        } else if let Some(frame) = self.fallback_scratch.clone() {
            (frame, VideoSource::Fallback)
        } else if let Some(frame) = self.last_emitted_video.clone() {
            (frame, self.last_selected.unwrap_or(VideoSource::Fallback))
        } else {
            (VideoFrame::blank(self.cfg.out_width, self.cfg.out_height), VideoSource::Fallback)
        };

        if self.last_selected != Some(selected) {
            self.events.emit(match selected {
                VideoSource::Primary => EventKind::VideoPrimary,
                VideoSource::Fallback => EventKind::VideoFallback,
            });
            self.last_selected = Some(selected);
        }

        self.muxer.write_video_frame(&frame, self.video_pts)?;
        self.video_pts += 1;
        self.last_emitted_video = Some(frame);
        Ok(())
    }

    /// (d) The AudioMode transition table.
    fn advance_audio_mode(&mut self, primary_available: bool) {
        let now = Instant::now();
        match self.audio_mode {
            AudioMode::Fallback if primary_available => {
                self.fallback_audio.clear();
                self.audio_mode = AudioMode::Primary;
                self.events.emit(EventKind::PrimaryActive);
            }
            AudioMode::Primary if !primary_available => {
                self.fallback_audio.clear();
                self.dropped_at = Some(now);
                self.audio_mode = AudioMode::Grace;
                self.events.emit(EventKind::GraceEntered);
            }
            AudioMode::Grace if primary_available => {
                self.fallback_audio.clear();
                self.audio_mode = AudioMode::Primary;
                self.events.emit(EventKind::PrimaryActive);
            }
            AudioMode::Grace => {
                let elapsed = self.dropped_at.map(|at| now.duration_since(at)).unwrap_or_default();
                if elapsed > self.cfg.bg_unmute_delay {
                    self.audio_mode = AudioMode::Fallback;
                    self.events.emit(EventKind::FallbackAudioOn);
                }
            }
            _ => {}
        }
    }

    /// (e) Drain the shared audio queue into the private jitter reservoir,
    /// then trim to the jitter budget — two stages to minimize lock-hold
    /// time (spec §9 "Audio jitter policy").
    fn drain_and_trim_primary_audio(&mut self) {
        let drained = self.buffer.drain_audio();
        self.primary_local_audio.append(drained);

        let budget_samples =
            (self.cfg.primary_audio_jitter.as_secs_f64() * self.cfg.sample_rate as f64) as usize;
        let excess = self.primary_local_audio.len().saturating_sub(budget_samples);
        if excess > 0 {
            self.primary_local_audio.trim_front(excess);
        }
    }

    /// (f) Emit encoder-frame-sized audio chunks until `audio_pts` catches
    /// up to `video_pts × sample_rate / fps`, per the current audio mode.
    fn emit_audio_until_caught_up(&mut self) -> Result<(), Error> {
        let frame_size = self.muxer.audio_frame_size();
        let target = self.video_pts * self.cfg.sample_rate as i64 / self.cfg.out_fps as i64;

        while self.audio_pts < target {
            let chunk = match self.audio_mode {
                // Zero-pad rather than stall: a primary with no audio
                // stream (or one whose audio hasn't arrived yet this tick)
                // must still advance audio_pts in lockstep with video_pts,
                // or the deficit compounds tick over tick with no bound.
                AudioMode::Primary => self.primary_local_audio.pop_front_padded(frame_size),
                AudioMode::Grace => {
                    self.primary_local_audio.clear();
                    self.fallback_audio.clear();
                    AudioSamples::silence(frame_size)
                }
                AudioMode::Fallback => self.fallback_audio.pop_front_padded(frame_size),
            };

            self.muxer.write_audio_frame(&chunk, self.audio_pts)?;
            self.audio_pts += frame_size as i64;
        }

        Ok(())
    }
}

// crates/streamkeeper-media/src/source.rs
//
// The C1 media I/O adapter: a uniform façade over both the primary
// (network) and fallback (file) sources. Scaling to output geometry and
// resampling to output rate/layout happen inside `decode()` so nothing
// downstream of this module ever sees a raw input format (spec §4.1).
//
// Grounded on the teacher's decode/scale/resample pipeline:
//   - LiveDecoder::open (crates/velocut-media/src/decode.rs) for the
//     keyframe-aligned seek + lazy SwsContext construction.
//   - encode_clip (crates/velocut-media/src/encode.rs) for the lazily
//     built video scaler / audio resampler, and for discarding pre-roll
//     packets using PTS-in-seconds comparisons.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{input as open_input, Pixel};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{Context as ScaleCtx, Flags as ScaleFlags};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as FfAudioFrame;
use ffmpeg::util::frame::video::Video as FfVideoFrame;
use ffmpeg::Packet;

use streamkeeper_core::{AudioSamples, Error, VideoFrame};

use crate::helpers::yuv::extract_yuv;

/// Distinguishes the two source contracts named in spec §4.1: `NETWORK`
/// applies low-delay hints, a read timeout, and a cancellation hook;
/// `FILE` uses ordinary defaults and supports `loop_reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    File,
    Network,
}

/// What `decode()` produced from one packet.
pub enum Decoded {
    Video(VideoFrame),
    Audio(AudioSamples),
    /// The packet belonged to a stream we don't care about, or produced no
    /// output frame yet (decoder needs more packets).
    None,
}

/// What `read_one()` produced: either a packet to feed to `decode()`, or
/// end of stream.
pub enum Readout {
    Packet(RawPacket),
    EndOfStream,
}

/// A demuxed packet tagged with which stream it came from, so `decode()`
/// can dispatch without re-inspecting the container.
pub struct RawPacket {
    packet: Packet,
    is_video: bool,
    is_audio: bool,
}

/// What one step of the fallback decode pump produced — `read_one` +
/// `decode` collapsed into a single call so the compositor's pump doesn't
/// need to touch `RawPacket` (an ffmpeg-backed type) directly.
pub enum FallbackEvent {
    Video(VideoFrame),
    Audio(AudioSamples),
    /// A packet was read but produced no output frame yet, or belonged to
    /// a stream the fallback path ignores.
    None,
    EndOfStream,
}

/// The fallback-source capability set the compositor's decode pump needs
/// (spec §4.1's `read_one`/`decode`/`loop_reset`, minus `open`/`close`
/// which happen once at startup/shutdown outside the tick loop).
/// Implemented by `Source`; test doubles implement it too so the
/// compositor's tick logic can be exercised without linking ffmpeg.
pub trait FallbackDecoder {
    fn next_event(&mut self) -> Result<FallbackEvent, Error>;
    fn loop_reset(&mut self) -> Result<(), Error>;
}

impl FallbackDecoder for Source {
    fn next_event(&mut self) -> Result<FallbackEvent, Error> {
        match Source::read_one(self)? {
            Readout::EndOfStream => Ok(FallbackEvent::EndOfStream),
            Readout::Packet(packet) => match Source::decode(self, packet)? {
                Decoded::Video(frame) => Ok(FallbackEvent::Video(frame)),
                Decoded::Audio(samples) => Ok(FallbackEvent::Audio(samples)),
                Decoded::None => Ok(FallbackEvent::None),
            },
        }
    }

    fn loop_reset(&mut self) -> Result<(), Error> {
        Source::loop_reset(self)
    }
}

/// Target geometry/rate `decode()` scales and resamples everything to.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
}

/// One open source — primary or fallback, network or file. Used on exactly
/// one thread for its lifetime (spec §4.1 contract).
pub struct Source {
    mode: SourceMode,
    fmt: OutputFormat,
    ictx: ffmpeg::format::context::Input,
    video_idx: Option<usize>,
    audio_idx: Option<usize>,
    video_decoder: Option<ffmpeg::decoder::video::Video>,
    audio_decoder: Option<ffmpeg::decoder::audio::Audio>,
    scaler: Option<ScaleCtx>,
    resampler: Option<resampling::Context>,
}

impl Source {
    /// Open `descriptor` (a URL for `Network`, a path for `File`).
    ///
    /// `Network` mode races the blocking ffmpeg open against `open_timeout`
    /// and `cancel`, returning `Error::PrimaryConnect` if neither the open
    /// completes nor cancellation fires first — spec §4.1: "Opening a
    /// NETWORK source must fail with a distinguishable error kind within
    /// the configured open timeout even if the remote never responds."
    pub fn open(
        descriptor: &str,
        mode: SourceMode,
        fmt: OutputFormat,
        open_timeout: Duration,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let ictx = match mode {
            SourceMode::File => open_input(descriptor)
                .map_err(|e| Error::FallbackOpen { path: PathBuf::from(descriptor), reason: e.to_string() })?,
            SourceMode::Network => Self::open_network(descriptor, open_timeout, cancel)?,
        };

        Self::from_input(ictx, mode, fmt)
    }

    fn open_network(
        url: &str,
        open_timeout: Duration,
        cancel: &Arc<AtomicBool>,
    ) -> Result<ffmpeg::format::context::Input, Error> {
        // ffmpeg's own blocking open can't be interrupted mid-call, so it
        // runs on a dedicated thread; the caller polls for completion,
        // timeout, or cancellation in short slices (spec §5: "The open/read
        // callback polls the flag").
        let url = url.to_string();
        let mut opts = ffmpeg::Dictionary::new();
        // ffmpeg's own network read timeout, kept in step with open_timeout
        // rather than a fixed value, so primary_timeout_us actually governs
        // ffmpeg's blocking reads and not just our outer polling deadline.
        opts.set("rw_timeout", &open_timeout.as_micros().to_string());
        opts.set("analyzeduration", "500000");
        opts.set("probesize", "65536");
        opts.set("fflags", "nobuffer");
        opts.set("flags", "low_delay");

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let result = ffmpeg::format::input_with_dictionary(&url, opts);
            let _ = tx.send(());
            result
        });

        let deadline = Instant::now() + open_timeout;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::PrimaryConnect("cancelled".into()));
            }
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(()) => {
                    return handle
                        .join()
                        .map_err(|_| Error::PrimaryConnect("open thread panicked".into()))?
                        .map_err(|e| Error::PrimaryConnect(e.to_string()));
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        // The open thread is left detached; it will finish
                        // (or fail) on its own and its result is discarded.
                        return Err(Error::PrimaryConnect(format!(
                            "open timed out after {:?}",
                            open_timeout
                        )));
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::PrimaryConnect("open thread vanished".into()));
                }
            }
        }
    }

    fn from_input(
        ictx: ffmpeg::format::context::Input,
        mode: SourceMode,
        fmt: OutputFormat,
    ) -> Result<Self, Error> {
        let video_idx = ictx.streams().best(MediaType::Video).map(|s| s.index());
        let audio_idx = ictx.streams().best(MediaType::Audio).map(|s| s.index());

        let mut video_decoder = None;
        if let Some(idx) = video_idx {
            let stream = ictx.stream(idx).expect("video_idx came from this ictx");
            let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .map_err(|e| open_err(mode, e))?;
            video_decoder = Some(ctx.decoder().video().map_err(|e| open_err(mode, e))?);
        }

        let mut audio_decoder = None;
        if let Some(idx) = audio_idx {
            let stream = ictx.stream(idx).expect("audio_idx came from this ictx");
            match ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().audio())
            {
                Ok(dec) => audio_decoder = Some(dec),
                // An unsupported/corrupt audio stream shouldn't block video —
                // same soft-fail policy as the teacher's encode_clip.
                Err(e) => tracing::warn!(error = %e, "audio decoder open failed, continuing video-only"),
            }
        }

        Ok(Self {
            mode,
            fmt,
            ictx,
            video_idx,
            audio_idx,
            video_decoder,
            audio_decoder,
            scaler: None,
            resampler: None,
        })
    }

    pub fn has_audio(&self) -> bool {
        self.audio_decoder.is_some()
    }

    /// Read the next demuxed packet, blocking (spec §4.1: "Blocking (but
    /// see cancellation)" — cancellation for `Network` sources is handled
    /// by the rw_timeout/open_timeout options set at open time plus the
    /// ingestion worker's own polling loop between reads).
    pub fn read_one(&mut self) -> Result<Readout, Error> {
        match self.ictx.packets().next() {
            Some(Ok((stream, packet))) => {
                let idx = stream.index();
                Ok(Readout::Packet(RawPacket {
                    packet,
                    is_video: self.video_idx == Some(idx),
                    is_audio: self.audio_idx == Some(idx),
                }))
            }
            Some(Err(e)) => Err(read_err(self.mode, e)),
            None => Ok(Readout::EndOfStream),
        }
    }

    /// Decode `packet`, scaling video to output geometry / resampling
    /// audio to output rate+stereo inline, per spec §4.1.
    pub fn decode(&mut self, packet: RawPacket) -> Result<Decoded, Error> {
        if packet.is_video {
            return self.decode_video(packet.packet);
        }
        if packet.is_audio {
            return self.decode_audio(packet.packet);
        }
        Ok(Decoded::None)
    }

    fn decode_video(&mut self, packet: Packet) -> Result<Decoded, Error> {
        let decoder = self.video_decoder.as_mut().expect("is_video implies a video decoder");
        decoder.send_packet(&packet).map_err(|e| read_err(self.mode, e))?;

        let mut decoded = FfVideoFrame::empty();
        if decoder.receive_frame(&mut decoded).is_err() {
            return Ok(Decoded::None);
        }

        let (src_w, src_h, src_fmt) = (decoded.width(), decoded.height(), decoded.format());
        let scaler = match &mut self.scaler {
            Some(s) => s,
            None => {
                let s = ScaleCtx::get(
                    src_fmt,
                    src_w,
                    src_h,
                    Pixel::YUV420P,
                    self.fmt.width,
                    self.fmt.height,
                    ScaleFlags::BILINEAR,
                )
                .map_err(|e| read_err(self.mode, e))?;
                self.scaler.insert(s)
            }
        };

        let mut yuv = FfVideoFrame::empty();
        scaler.run(&decoded, &mut yuv).map_err(|e| read_err(self.mode, e))?;

        let (w, h) = (self.fmt.width as usize, self.fmt.height as usize);
        let (uv_w, uv_h) = (w / 2, h / 2);
        let packed = extract_yuv(&yuv, w, h, uv_w, uv_h);

        Ok(Decoded::Video(VideoFrame { width: self.fmt.width, height: self.fmt.height, yuv: packed }))
    }

    fn decode_audio(&mut self, packet: Packet) -> Result<Decoded, Error> {
        let decoder = self.audio_decoder.as_mut().expect("is_audio implies an audio decoder");
        decoder.send_packet(&packet).map_err(|e| read_err(self.mode, e))?;

        let mut raw = FfAudioFrame::empty();
        if decoder.receive_frame(&mut raw).is_err() {
            return Ok(Decoded::None);
        }

        let target_fmt = ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar);
        let needs_resample =
            raw.format() != target_fmt || raw.rate() != self.fmt.sample_rate || raw.ch_layout().channels() != 2;

        let resampled = if needs_resample {
            let resampler = match &mut self.resampler {
                Some(r) => r,
                None => {
                    let src_layout =
                        if raw.ch_layout().channels() >= 2 { raw.ch_layout() } else { ChannelLayout::MONO };
                    let r = resampling::Context::get2(
                        raw.format(),
                        src_layout,
                        raw.rate(),
                        target_fmt,
                        ChannelLayout::STEREO,
                        self.fmt.sample_rate,
                    )
                    .map_err(|e| read_err(self.mode, e))?;
                    self.resampler.insert(r)
                }
            };
            let mut out = FfAudioFrame::empty();
            resampler.run(&raw, &mut out).map_err(|e| read_err(self.mode, e))?;
            out
        } else {
            raw
        };

        if resampled.samples() == 0 {
            return Ok(Decoded::None);
        }

        Ok(Decoded::Audio(ff_audio_to_samples(&resampled)))
    }

    /// Fallback-only: seek to start and flush decoder state (spec §4.1
    /// `loop_reset`). Calling this on a `Network` source is a logic error
    /// in the caller, not something this function needs to guard against —
    /// only C4's fallback pump ever calls it.
    pub fn loop_reset(&mut self) -> Result<(), Error> {
        self.ictx
            .seek(0, ..0)
            .map_err(|e| Error::FallbackRead(format!("loop_reset seek: {e}")))?;
        if let Some(dec) = &mut self.video_decoder {
            dec.flush();
        }
        if let Some(dec) = &mut self.audio_decoder {
            dec.flush();
        }
        Ok(())
    }

    pub fn close(self) {
        // ffmpeg's Input context is closed on Drop; this exists so call
        // sites read symmetrically with open()/read_one()/decode() (spec
        // §4.1's named operation set) rather than relying on an implicit
        // destructor.
        drop(self);
    }
}

fn ff_audio_to_samples(frame: &FfAudioFrame) -> AudioSamples {
    let n = frame.samples();
    unsafe {
        let l_bytes = frame.data(0);
        let left = std::slice::from_raw_parts(l_bytes.as_ptr() as *const f32, n).to_vec();
        let r_bytes = if frame.ch_layout().channels() >= 2 { frame.data(1) } else { frame.data(0) };
        let right = std::slice::from_raw_parts(r_bytes.as_ptr() as *const f32, n).to_vec();
        AudioSamples { left, right }
    }
}

fn open_err(mode: SourceMode, e: ffmpeg::Error) -> Error {
    match mode {
        SourceMode::Network => Error::PrimaryConnect(e.to_string()),
        SourceMode::File => Error::FallbackOpen { path: PathBuf::new(), reason: e.to_string() },
    }
}

fn read_err(mode: SourceMode, e: ffmpeg::Error) -> Error {
    match mode {
        SourceMode::Network => Error::PrimaryRead(e.to_string()),
        SourceMode::File => Error::FallbackRead(e.to_string()),
    }
}

/// Convenience used by the fallback path at startup, where the path is
/// known up front and there's no cancellation race to win.
pub fn open_fallback(path: &Path, fmt: OutputFormat) -> Result<Source, Error> {
    let ictx = open_input(path).map_err(|e| Error::FallbackOpen {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Source::from_input(ictx, SourceMode::File, fmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn open_fallback_rejects_unreadable_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"not a media container").unwrap();
        let fmt = OutputFormat { width: 16, height: 16, sample_rate: 48_000 };

        let result = open_fallback(f.path(), fmt);
        assert!(matches!(result, Err(Error::FallbackOpen { .. })));
    }

    #[test]
    fn open_fallback_reports_missing_path() {
        let fmt = OutputFormat { width: 16, height: 16, sample_rate: 48_000 };
        let result = open_fallback(Path::new("/no/such/background.mp4"), fmt);
        assert!(matches!(result, Err(Error::FallbackOpen { .. })));
    }
}

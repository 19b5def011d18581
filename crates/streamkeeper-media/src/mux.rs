// crates/streamkeeper-media/src/mux.rs
//
// The output half of C1: an H.264 + AAC muxer driven one unit at a time by
// the compositor's tick loop (spec §4.4), rather than the teacher's
// one-shot whole-timeline `run_encode`. The per-frame mechanics — lazy
// codec-context construction, `avcodec_parameters_from_context` via raw
// FFI because `Stream` has no `.codec()` accessor, `rescale_ts` before
// `write_interleaved` — are carried over directly from
// crates/velocut-media/src/encode.rs.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{output_as, Pixel, Sample};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as FfAudioFrame;
use ffmpeg::util::frame::video::Video as FfVideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use streamkeeper_core::{AudioSamples, Config, Error, VideoFrame};

use crate::helpers::yuv::write_yuv;

pub struct Muxer {
    octx: ffmpeg::format::context::Output,
    video_encoder: ffmpeg::encoder::video::Video,
    audio_encoder: ffmpeg::encoder::audio::Audio,
    video_tb: Rational,
    audio_tb: Rational,
    ost_video_tb: Rational,
    ost_audio_tb: Rational,
    audio_frame_size: usize,
}

impl Muxer {
    /// Open `sink` (typically `pipe:1`, the process's stdout) and write the
    /// container header, ready to receive frames via `write_video_frame` /
    /// `write_audio_frame`.
    pub fn open(sink: &str, cfg: &Config) -> Result<Self, Error> {
        let mut octx =
            output_as(sink, &cfg.output_container).map_err(|e| Error::SinkOpen(e.to_string()))?;

        let video_tb = Rational::new(1, cfg.out_fps as i32);
        let video_codec_id = codec_id_for(&cfg.video_codec).ok_or_else(|| {
            Error::EncoderSetup(format!("unknown video codec '{}'", cfg.video_codec))
        })?;
        let h264 = encoder::find(video_codec_id)
            .ok_or_else(|| Error::EncoderSetup(format!("encoder not found for {}", cfg.video_codec)))?;

        let mut ost_video = octx
            .add_stream(h264)
            .map_err(|e| Error::EncoderSetup(format!("add video stream: {e}")))?;
        ost_video.set_time_base(video_tb);

        let video_enc_ctx = codec::context::Context::new_with_codec(h264);
        let mut video_enc = video_enc_ctx
            .encoder()
            .video()
            .map_err(|e| Error::EncoderSetup(format!("video encoder context: {e}")))?;

        video_enc.set_width(cfg.out_width);
        video_enc.set_height(cfg.out_height);
        video_enc.set_format(Pixel::YUV420P);
        video_enc.set_time_base(video_tb);
        video_enc.set_frame_rate(Some(Rational::new(cfg.out_fps as i32, 1)));
        video_enc.set_bit_rate(cfg.video_bitrate as usize);
        video_enc.set_gop(cfg.out_fps); // one keyframe per second keeps mid-stream joins cheap

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");

        let mut video_encoder = video_enc
            .open_as_with(h264, opts)
            .map_err(|e| Error::EncoderSetup(format!("open video encoder: {e}")))?;
        video_encoder.set_aspect_ratio(Rational::new(1, 1));

        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (**(*octx.as_mut_ptr()).streams.add(0)).codecpar,
                video_encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                return Err(Error::EncoderSetup(format!(
                    "avcodec_parameters_from_context (video): {ret}"
                )));
            }
        }

        let audio_tb = Rational::new(1, cfg.sample_rate as i32);
        let audio_codec_id = codec_id_for(&cfg.audio_codec).ok_or_else(|| {
            Error::EncoderSetup(format!("unknown audio codec '{}'", cfg.audio_codec))
        })?;
        let aac = encoder::find(audio_codec_id)
            .ok_or_else(|| Error::EncoderSetup(format!("encoder not found for {}", cfg.audio_codec)))?;

        let mut ost_audio = octx
            .add_stream(aac)
            .map_err(|e| Error::EncoderSetup(format!("add audio stream: {e}")))?;
        ost_audio.set_time_base(audio_tb);

        let audio_enc_ctx = codec::context::Context::new_with_codec(aac);
        let mut audio_enc = audio_enc_ctx
            .encoder()
            .audio()
            .map_err(|e| Error::EncoderSetup(format!("audio encoder context: {e}")))?;

        audio_enc.set_rate(cfg.sample_rate as i32);
        audio_enc.set_ch_layout(ChannelLayout::STEREO);
        audio_enc.set_format(Sample::F32(SampleType::Planar));
        audio_enc.set_bit_rate(cfg.audio_bitrate as usize);

        let audio_encoder = audio_enc
            .open_as_with(aac, ffmpeg::Dictionary::new())
            .map_err(|e| Error::EncoderSetup(format!("open audio encoder: {e}")))?;

        let audio_frame_size = (audio_encoder.frame_size() as usize).max(cfg.encoder_frame_size());
        let ost_audio_tb = octx
            .stream(1)
            .expect("audio stream was just added")
            .time_base();
        let ost_video_tb = octx
            .stream(0)
            .expect("video stream was just added")
            .time_base();

        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (**(*octx.as_mut_ptr()).streams.add(1)).codecpar,
                audio_encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                return Err(Error::EncoderSetup(format!(
                    "avcodec_parameters_from_context (audio): {ret}"
                )));
            }
        }

        octx.write_header().map_err(|e| Error::SinkOpen(e.to_string()))?;

        Ok(Self {
            octx,
            video_encoder,
            audio_encoder,
            video_tb,
            audio_tb,
            ost_video_tb,
            ost_audio_tb,
            audio_frame_size,
        })
    }

    /// AAC's fixed per-frame sample count (spec's `encoder_frame_size`).
    pub fn audio_frame_size(&self) -> usize {
        self.audio_frame_size
    }

    /// Encode and write one video frame at `pts` (frame units, spec
    /// §3/§4.4(c) "video_pts"). Exactly one call per compositor tick.
    pub fn write_video_frame(&mut self, frame: &VideoFrame, pts: i64) -> Result<(), Error> {
        let (w, h) = (frame.width as usize, frame.height as usize);
        let (uv_w, uv_h) = (w / 2, h / 2);

        let mut yuv = FfVideoFrame::new(Pixel::YUV420P, frame.width, frame.height);
        write_yuv(&frame.yuv, &mut yuv, w, h, uv_w, uv_h);
        yuv.set_pts(Some(pts));
        unsafe {
            (*yuv.as_mut_ptr()).sample_aspect_ratio = ffmpeg::ffi::AVRational { num: 1, den: 1 };
        }

        self.video_encoder
            .send_frame(&yuv)
            .map_err(|e| Error::Encode(format!("send video frame: {e}")))?;
        self.drain_video_packets()
    }

    /// Encode and write one audio frame at `pts` (sample units). `samples`
    /// must contain exactly `audio_frame_size()` samples per channel — the
    /// compositor's audio-mode branches (spec §4.4(f)) are responsible for
    /// assembling that, including zero-padding where the spec allows it.
    pub fn write_audio_frame(&mut self, samples: &AudioSamples, pts: i64) -> Result<(), Error> {
        debug_assert_eq!(samples.len(), self.audio_frame_size);

        let n = self.audio_frame_size;
        let mut frame = FfAudioFrame::new(
            Sample::F32(SampleType::Planar),
            n,
            ffmpeg::util::channel_layout::ChannelLayoutMask::STEREO,
        );
        frame.set_rate(self.audio_tb.denominator() as u32);
        frame.set_pts(Some(pts));
        unsafe {
            let ldst =
                std::slice::from_raw_parts_mut(frame.data_mut(0).as_mut_ptr() as *mut f32, n);
            ldst.copy_from_slice(&samples.left[..n]);
            let rdst =
                std::slice::from_raw_parts_mut(frame.data_mut(1).as_mut_ptr() as *mut f32, n);
            rdst.copy_from_slice(&samples.right[..n]);
        }

        self.audio_encoder
            .send_frame(&frame)
            .map_err(|e| Error::Encode(format!("send audio frame: {e}")))?;
        self.drain_audio_packets()
    }

    fn drain_video_packets(&mut self) -> Result<(), Error> {
        let mut pkt = Packet::empty();
        while self.video_encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(0);
            pkt.rescale_ts(self.video_tb, self.ost_video_tb);
            pkt.write_interleaved(&mut self.octx)
                .map_err(|e| Error::SinkWrite(format!("write video packet: {e}")))?;
        }
        Ok(())
    }

    fn drain_audio_packets(&mut self) -> Result<(), Error> {
        let mut pkt = Packet::empty();
        while self.audio_encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(1);
            pkt.rescale_ts(self.audio_tb, self.ost_audio_tb);
            pkt.write_interleaved(&mut self.octx)
                .map_err(|e| Error::SinkWrite(format!("write audio packet: {e}")))?;
        }
        Ok(())
    }

    /// Flush both encoders and write the container trailer (spec §4.5:
    /// "the compositor flushes the encoder... and writes the container
    /// trailer to the sink"). Best-effort: called on both graceful and
    /// fatal shutdown paths, so individual failures are logged, not
    /// propagated — by the time we're flushing there's nowhere left to
    /// report a failure except the event sink, which the caller already
    /// owns.
    pub fn flush(&mut self) {
        if let Err(e) = self.video_encoder.send_eof() {
            tracing::warn!(error = %e, "video encoder EOF failed during flush");
        }
        let _ = self.drain_video_packets();

        if let Err(e) = self.audio_encoder.send_eof() {
            tracing::warn!(error = %e, "audio encoder EOF failed during flush");
        }
        let _ = self.drain_audio_packets();

        if let Err(e) = self.octx.write_trailer() {
            tracing::warn!(error = %e, "writing container trailer failed");
        }
    }
}

/// The output-side capability set the compositor's tick loop needs (spec
/// §4.4(c)/(f): one video frame and zero-or-more audio frames per tick).
/// Implemented by `Muxer`; test doubles implement it too.
pub trait MediaSink {
    fn audio_frame_size(&self) -> usize;
    fn write_video_frame(&mut self, frame: &VideoFrame, pts: i64) -> Result<(), Error>;
    fn write_audio_frame(&mut self, samples: &AudioSamples, pts: i64) -> Result<(), Error>;
    fn flush(&mut self);
}

impl MediaSink for Muxer {
    fn audio_frame_size(&self) -> usize {
        Muxer::audio_frame_size(self)
    }

    fn write_video_frame(&mut self, frame: &VideoFrame, pts: i64) -> Result<(), Error> {
        Muxer::write_video_frame(self, frame, pts)
    }

    fn write_audio_frame(&mut self, samples: &AudioSamples, pts: i64) -> Result<(), Error> {
        Muxer::write_audio_frame(self, samples, pts)
    }

    fn flush(&mut self) {
        Muxer::flush(self)
    }
}

fn codec_id_for(name: &str) -> Option<CodecId> {
    match name {
        "libx264" | "h264" => Some(CodecId::H264),
        "libx265" | "hevc" | "h265" => Some(CodecId::HEVC),
        "aac" => Some(CodecId::AAC),
        "mp2" | "mp2a" => Some(CodecId::MP2),
        _ => None,
    }
}

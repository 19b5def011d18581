// crates/streamkeeper-core/src/config.rs
//
// Immutable compositor configuration. Loaded once at startup from either a
// JSON document or the legacy positional-argument form, then frozen for the
// lifetime of the process (see spec §3 "Config (immutable after load)").

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Output resolution, bitrates, timing knobs — everything a compositor
/// instance needs and nothing it can change once running.
#[derive(Debug, Clone)]
pub struct Config {
    pub primary_url: String,
    pub fallback_path: PathBuf,
    pub stream_id: String,

    pub out_width: u32,
    pub out_height: u32,
    pub out_fps: u32,

    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    pub sample_rate: u32,
    /// Fixed at 2 per spec §3; not independently configurable.
    pub audio_channels: u16,

    pub video_codec: String,
    pub audio_codec: String,
    pub output_container: String,

    /// Grace period during which a primary drop still yields silence rather
    /// than fallback audio (spec §4.4 "GRACE").
    pub bg_unmute_delay: Duration,
    /// How long the ingestion worker tolerates a silent handoff buffer
    /// before treating the primary as stalled (spec §4.3 step 4).
    pub primary_timeout: Duration,
    /// Sleep between reconnect attempts, sliced for prompt cancellation.
    pub primary_retry: Duration,
    /// Cap on PrimaryLocalAudioQueue (spec §3, §4.4(e)).
    pub primary_audio_jitter: Duration,
}

impl Config {
    pub const DEFAULT_FALLBACK_PATH: &'static str = "background.mp4";
    pub const DEFAULT_OUT_WIDTH: u32 = 1280;
    pub const DEFAULT_OUT_HEIGHT: u32 = 720;
    pub const DEFAULT_OUT_FPS: u32 = 30;
    pub const DEFAULT_VIDEO_BITRATE: u64 = 4_000_000;
    pub const DEFAULT_AUDIO_BITRATE: u64 = 128_000;
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
    pub const DEFAULT_AUDIO_CHANNELS: u16 = 2;
    pub const DEFAULT_VIDEO_CODEC: &'static str = "libx264";
    pub const DEFAULT_AUDIO_CODEC: &'static str = "aac";
    pub const DEFAULT_OUTPUT_CONTAINER: &'static str = "mpegts";
    pub const DEFAULT_BG_UNMUTE_DELAY_SECS: f64 = 5.0;
    pub const DEFAULT_PRIMARY_TIMEOUT_US: u64 = 2_000_000;
    pub const DEFAULT_PRIMARY_RETRY_US: u64 = 500_000;
    pub const DEFAULT_PRIMARY_AUDIO_JITTER_MS: u64 = 300;

    /// Build a `Config` from a JSON document already read into a string.
    pub fn from_json_str(raw_json: &str) -> Result<Self, Error> {
        let raw: RawConfig = serde_json::from_str(raw_json)
            .map_err(|e| Error::Config(format!("invalid config JSON: {e}")))?;
        raw.into_config()
    }

    /// Build a `Config` from the legacy positional form: `primary_url` and an
    /// optional `fallback_path`, everything else defaulted.
    pub fn from_legacy_args(primary_url: String, fallback_path: Option<PathBuf>) -> Result<Self, Error> {
        RawConfig {
            primary_url: Some(primary_url),
            fallback_path,
            ..RawConfig::default()
        }
        .into_config()
    }

    /// Frame size in samples per encoder-emitted audio frame (spec calls
    /// this `encoder_frame_size`). AAC's is fixed at 1024 regardless of
    /// sample rate; resampling keeps `audio_pts` cadence correct (spec §8
    /// boundary: "±1 sample per hour").
    pub fn encoder_frame_size(&self) -> usize {
        1024
    }
}

/// All-optional mirror of `Config`, the direct target of `serde_json`
/// deserialization. Every field absent from the document (or from the
/// legacy positional form) falls back to the default in spec §6's table.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    #[serde(alias = "srt_url")]
    primary_url: Option<String>,
    #[serde(alias = "bg_file")]
    fallback_path: Option<PathBuf>,
    stream_id: Option<String>,

    out_width: Option<u32>,
    out_height: Option<u32>,
    out_fps: Option<u32>,

    video_bitrate: Option<u64>,
    audio_bitrate: Option<u64>,
    sample_rate: Option<u32>,

    video_codec: Option<String>,
    audio_codec: Option<String>,
    output_container: Option<String>,

    bg_unmute_delay: Option<f64>,
    primary_timeout_us: Option<u64>,
    primary_retry_us: Option<u64>,
    primary_audio_jitter_ms: Option<u64>,
}

impl RawConfig {
    fn into_config(self) -> Result<Config, Error> {
        let primary_url = self
            .primary_url
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("primary_url is required".into()))?;

        let out_width = self.out_width.unwrap_or(Config::DEFAULT_OUT_WIDTH);
        let out_height = self.out_height.unwrap_or(Config::DEFAULT_OUT_HEIGHT);
        let out_fps = self.out_fps.unwrap_or(Config::DEFAULT_OUT_FPS);
        if out_width == 0 || out_height == 0 || out_fps == 0 {
            return Err(Error::Config(
                "out_width, out_height and out_fps must all be nonzero".into(),
            ));
        }

        Ok(Config {
            primary_url,
            fallback_path: self
                .fallback_path
                .unwrap_or_else(|| PathBuf::from(Config::DEFAULT_FALLBACK_PATH)),
            stream_id: self.stream_id.unwrap_or_default(),

            out_width,
            out_height,
            out_fps,

            video_bitrate: self.video_bitrate.unwrap_or(Config::DEFAULT_VIDEO_BITRATE),
            audio_bitrate: self.audio_bitrate.unwrap_or(Config::DEFAULT_AUDIO_BITRATE),
            sample_rate: self.sample_rate.unwrap_or(Config::DEFAULT_SAMPLE_RATE),
            audio_channels: Config::DEFAULT_AUDIO_CHANNELS,

            video_codec: self.video_codec.unwrap_or_else(|| Config::DEFAULT_VIDEO_CODEC.into()),
            audio_codec: self.audio_codec.unwrap_or_else(|| Config::DEFAULT_AUDIO_CODEC.into()),
            output_container: self
                .output_container
                .unwrap_or_else(|| Config::DEFAULT_OUTPUT_CONTAINER.into()),

            bg_unmute_delay: Duration::from_secs_f64(
                self.bg_unmute_delay.unwrap_or(Config::DEFAULT_BG_UNMUTE_DELAY_SECS),
            ),
            primary_timeout: Duration::from_micros(
                self.primary_timeout_us.unwrap_or(Config::DEFAULT_PRIMARY_TIMEOUT_US),
            ),
            primary_retry: Duration::from_micros(
                self.primary_retry_us.unwrap_or(Config::DEFAULT_PRIMARY_RETRY_US),
            ),
            primary_audio_jitter: Duration::from_millis(
                self.primary_audio_jitter_ms.unwrap_or(Config::DEFAULT_PRIMARY_AUDIO_JITTER_MS),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_args_apply_defaults() {
        let cfg = Config::from_legacy_args("udp://127.0.0.1:5000".into(), None).unwrap();
        assert_eq!(cfg.fallback_path, PathBuf::from("background.mp4"));
        assert_eq!(cfg.out_width, 1280);
        assert_eq!(cfg.out_height, 720);
        assert_eq!(cfg.out_fps, 30);
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.audio_channels, 2);
        assert_eq!(cfg.bg_unmute_delay, Duration::from_secs_f64(5.0));
    }

    #[test]
    fn legacy_args_honor_explicit_fallback() {
        let cfg = Config::from_legacy_args(
            "rtmp://example/live".into(),
            Some(PathBuf::from("loop.mp4")),
        )
        .unwrap();
        assert_eq!(cfg.fallback_path, PathBuf::from("loop.mp4"));
    }

    #[test]
    fn json_config_with_srt_url_alias() {
        let json = r#"{"srt_url": "srt://host:9000", "bg_file": "fallback.mov", "out_fps": 25}"#;
        let cfg = Config::from_json_str(json).unwrap();
        assert_eq!(cfg.primary_url, "srt://host:9000");
        assert_eq!(cfg.fallback_path, PathBuf::from("fallback.mov"));
        assert_eq!(cfg.out_fps, 25);
        // Unset fields still default.
        assert_eq!(cfg.out_width, 1280);
    }

    #[test]
    fn missing_primary_url_is_a_config_error() {
        let err = Config::from_json_str("{}").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_fps_is_rejected() {
        let json = r#"{"primary_url": "x", "out_fps": 0}"#;
        let err = Config::from_json_str(json).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn jitter_ms_converts_to_duration() {
        let json = r#"{"primary_url": "x", "primary_audio_jitter_ms": 300}"#;
        let cfg = Config::from_json_str(json).unwrap();
        assert_eq!(cfg.primary_audio_jitter, Duration::from_millis(300));
    }
}

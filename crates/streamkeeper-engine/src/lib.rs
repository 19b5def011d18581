// crates/streamkeeper-engine/src/lib.rs
//
// Pure orchestration: no ffmpeg dependency here, only streamkeeper-media's
// Source/Muxer facades. C2 (handoff), C3 (ingestion worker), C4
// (compositor), and the C5 start/stop wiring that ties them together.

pub mod compositor;
pub mod handoff;
pub mod ingestion;

pub use compositor::Compositor;
pub use handoff::HandoffBuffer;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use streamkeeper_core::{Config, Error, EventKind, SharedEventSink};
use streamkeeper_media::{Muxer, Source, SourceMode};

/// C5: open the fallback source and output sink, spawn the ingestion
/// thread, run the compositor on the calling thread, and join ingestion at
/// shutdown (spec §2 "Control flow"). `cancel` is expected to already be
/// wired to a signal handler by the caller.
pub fn run_session(
    cfg: Config,
    sink_url: &str,
    mut events: SharedEventSink,
    cancel: Arc<AtomicBool>,
) -> Result<(), Error> {
    use streamkeeper_core::EventSink;

    let cfg = Arc::new(cfg);
    events.emit(EventKind::Started);

    let fmt = streamkeeper_media::OutputFormat {
        width: cfg.out_width,
        height: cfg.out_height,
        sample_rate: cfg.sample_rate,
    };
    let fallback = Source::open(
        cfg.fallback_path.to_string_lossy().as_ref(),
        SourceMode::File,
        fmt,
        std::time::Duration::from_secs(0), // unused for File mode
        &cancel,
    )?;
    events.emit(EventKind::BgOpened);

    let muxer = Muxer::open(sink_url, &cfg)?;
    events.emit(EventKind::OutputReady {
        resolution: format!("{}x{}", cfg.out_width, cfg.out_height),
        fps: cfg.out_fps,
        vbr: cfg.video_bitrate,
        abr: cfg.audio_bitrate,
    });

    let buffer = Arc::new(HandoffBuffer::new());

    let ingestion_handle = {
        let cfg = Arc::clone(&cfg);
        let buffer = Arc::clone(&buffer);
        let cancel = Arc::clone(&cancel);
        let events = Box::new(events.clone());
        thread::spawn(move || ingestion::run(cfg, buffer, cancel, events))
    };

    let compositor = Compositor::new(
        Arc::clone(&cfg),
        Arc::clone(&buffer),
        fallback,
        muxer,
        Box::new(events.clone()),
        Arc::clone(&cancel),
    );
    let result = compositor.run();

    cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = ingestion_handle.join();

    result
}

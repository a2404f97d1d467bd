mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{CountingLoader, EchoModel};
use image::{Rgb, RgbImage};
use pretty_assertions::assert_eq;
use truvlm::{
    DecoderKind, ErrorKind, GenerationOptions, Settings, Stage, VideoOptions, VideoRequest,
    VideoSource,
};
use truvlm_inference::{ModelLoader, ModelSession, Orchestrator, ReleaseHook};
use truvlm_vidprep::backends::FrameDirectoryBackend;
use truvlm_vidprep::{
    AssemblerConfig, CancelFlag, DecodeBackend, DecodeHandle, DecodedFrame, PatchGeometry,
    Preprocessor, SourceResolver, VideoError, VideoMetadata,
};

/// Frame directory backend that counts how often it was asked to open.
struct CountingFrames {
    inner: FrameDirectoryBackend,
    opens: AtomicUsize,
}

impl DecodeBackend for CountingFrames {
    fn name(&self) -> &'static str {
        "counting-frames"
    }

    fn open(
        &self,
        source: &VideoSource,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn DecodeHandle>, VideoError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(source, cancel)
    }
}

/// Blocks until its attempt is cancelled.
struct StallingBackend {
    abandoned: Arc<AtomicUsize>,
}

impl DecodeBackend for StallingBackend {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn open(
        &self,
        _source: &VideoSource,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn DecodeHandle>, VideoError> {
        while !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        Err(VideoError::Cancelled(Stage::Resolve))
    }
}

/// Opens at once, then hangs in `read_frames` until the request is cancelled.
struct StalledReads {
    abandoned: Arc<AtomicUsize>,
}

struct StalledHandle {
    metadata: VideoMetadata,
    abandoned: Arc<AtomicUsize>,
}

impl DecodeBackend for StalledReads {
    fn name(&self) -> &'static str {
        "stalled-reads"
    }

    fn open(
        &self,
        _source: &VideoSource,
        _cancel: &CancelFlag,
    ) -> Result<Box<dyn DecodeHandle>, VideoError> {
        Ok(Box::new(StalledHandle {
            metadata: VideoMetadata {
                width: 160,
                height: 90,
                fps: 2.0,
                frame_count: 20,
            },
            abandoned: self.abandoned.clone(),
        }))
    }
}

impl DecodeHandle for StalledHandle {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn read_frames(
        &mut self,
        _indices: &[usize],
        cancel: &CancelFlag,
        _sink: &mut dyn FnMut(DecodedFrame) -> Result<(), VideoError>,
    ) -> Result<(), VideoError> {
        while !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        Err(VideoError::Cancelled(Stage::Assemble))
    }
}

fn write_clip(dir: &Path, frames: usize) {
    for i in 0..frames {
        RgbImage::from_pixel(160, 90, Rgb([(i * 8) as u8, 32, 200]))
            .save(dir.join(format!("{:05}.png", i)))
            .unwrap();
    }
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.decode.backends = vec![DecoderKind::Frames];
    settings.decode.frames_fps = 2.0;
    settings.model.load_wait_secs = 5;
    settings
}

/// Small frames keep the batches cheap.
fn small_frames() -> VideoOptions {
    VideoOptions {
        min_pixels: Some(1024),
        max_pixels: Some(4096),
        ..Default::default()
    }
}

fn release_counter() -> (Arc<AtomicUsize>, Option<ReleaseHook>) {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let hook: ReleaseHook = Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (released, Some(hook))
}

fn counting_orchestrator(
    settings: Settings,
    loader: Arc<dyn ModelLoader>,
) -> (Orchestrator, Arc<CountingFrames>) {
    let frames = Arc::new(CountingFrames {
        inner: FrameDirectoryBackend::new(2.0),
        opens: AtomicUsize::new(0),
    });
    let preprocessor = Preprocessor::new(
        SourceResolver::new(vec![frames.clone()], Duration::from_secs(5)),
        PatchGeometry::new(32, 2),
        AssemblerConfig::default(),
        2,
    );
    let session = ModelSession::from_settings(&settings, loader);
    (Orchestrator::new(settings, session, preprocessor), frames)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_directory_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 20);

    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let orchestrator = Orchestrator::from_settings(settings(), loader.clone()).unwrap();
    let (released, hook) = release_counter();

    let source = VideoSource::Path(dir.path().to_path_buf());
    let request = VideoRequest::new(source.clone(), "Describe the clip.")
        .with_video_params(small_frames());
    let result = orchestrator.infer(request, hook).await.unwrap();

    assert!(result.text.starts_with("Describe the clip. [20x"), "{}", result.text);
    assert_eq!(result.backend, "direct");
    assert_eq!(result.source_echo, source.to_string());
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn test_invalid_generation_params_fail_before_any_decode() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 4);

    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let (orchestrator, frames) = counting_orchestrator(settings(), loader.clone());
    let (released, hook) = release_counter();

    let request = VideoRequest::new(VideoSource::Path(dir.path().to_path_buf()), "What happens?")
        .with_generation_params(GenerationOptions {
            temperature: Some(3.0),
            ..Default::default()
        });
    let err = orchestrator.infer(request, hook).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(err.status_code(), 400);
    assert_eq!(frames.opens.load(Ordering::SeqCst), 0);
    assert_eq!(loader.loads(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_validation_cases() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 4);
    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let (orchestrator, frames) = counting_orchestrator(settings(), loader);
    let clip = VideoSource::Path(dir.path().to_path_buf());

    let cases = [
        (VideoRequest::new(clip.clone(), "   "), "prompt"),
        (
            VideoRequest::new(VideoSource::Path(dir.path().join("missing.mp4")), "hi"),
            "source",
        ),
        (
            VideoRequest::new(clip.clone(), "hi").with_video_params(VideoOptions {
                fps: Some(1.0),
                nframes: Some(8),
                ..Default::default()
            }),
            "video_params",
        ),
        (
            VideoRequest::new(clip.clone(), "hi").with_video_params(VideoOptions {
                min_pixels: Some(8192),
                max_pixels: Some(4096),
                ..Default::default()
            }),
            "max_pixels",
        ),
    ];
    for (request, field) in cases {
        let (released, hook) = release_counter();
        match orchestrator.infer(request, hook).await {
            Err(truvlm::Error::Validation { field: got, .. }) => assert_eq!(got, field),
            other => panic!("expected validation error on {}, got {:?}", field, other),
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
    assert_eq!(frames.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_frame_mid_stream_is_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 20);
    std::fs::write(dir.path().join("00010.png"), b"not a png").unwrap();

    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let orchestrator = Orchestrator::from_settings(settings(), loader).unwrap();
    let (released, hook) = release_counter();

    let request = VideoRequest::new(VideoSource::Path(dir.path().to_path_buf()), "hi")
        .with_video_params(small_frames());
    let err = orchestrator.infer(request, hook).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::VideoUnreadable);
    assert_eq!(err.stage(), Stage::Assemble);
    assert_eq!(err.backend().as_deref(), Some("frames"));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsupported_source_names_attempted_backends() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("clip.bin");
    std::fs::write(&file, b"\x00\x01\x02").unwrap();

    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let orchestrator = Orchestrator::from_settings(settings(), loader).unwrap();
    let (released, hook) = release_counter();

    let err = orchestrator
        .infer(VideoRequest::new(VideoSource::Path(file), "hi"), hook)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    assert_eq!(err.backend().as_deref(), Some("frames"));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generation_failure_releases_and_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 6);

    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::failing(
        "device out of memory",
    ))));
    let orchestrator = Orchestrator::from_settings(settings(), loader).unwrap();
    let source = VideoSource::Path(dir.path().to_path_buf());

    for _ in 0..2 {
        let (released, hook) = release_counter();
        let request = VideoRequest::new(source.clone(), "hi").with_video_params(small_frames());
        let err = orchestrator.infer(request, hook).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GenerationFailure);
        assert!(!err.is_fatal());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
    assert!(orchestrator.session().state().is_ready());
}

#[tokio::test]
async fn test_failed_model_is_fatal_and_skips_decode() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 4);

    let loader = Arc::new(CountingLoader::broken());
    let (orchestrator, frames) = counting_orchestrator(settings(), loader.clone());

    for _ in 0..2 {
        let (released, hook) = release_counter();
        let request = VideoRequest::new(VideoSource::Path(dir.path().to_path_buf()), "hi");
        let err = orchestrator.infer(request, hook).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelNotReady);
        assert!(err.is_fatal());
        assert_eq!(err.status_code(), 503);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
    assert_eq!(loader.loads(), 1);
    assert_eq!(frames.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_request_cancels_decode_and_releases() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 4);

    let abandoned = Arc::new(AtomicUsize::new(0));
    let preprocessor = Preprocessor::new(
        SourceResolver::new(
            vec![Arc::new(StallingBackend {
                abandoned: abandoned.clone(),
            })],
            Duration::from_secs(60),
        ),
        PatchGeometry::new(32, 2),
        AssemblerConfig::default(),
        2,
    );
    let settings = settings();
    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let session = ModelSession::from_settings(&settings, loader);
    let orchestrator = Orchestrator::new(settings, session, preprocessor);
    let (released, hook) = release_counter();

    let request = VideoRequest::new(VideoSource::Path(dir.path().to_path_buf()), "hi");
    let outcome =
        tokio::time::timeout(Duration::from_millis(200), orchestrator.infer(request, hook)).await;
    assert!(outcome.is_err(), "request should still be decoding");
    assert_eq!(released.load(Ordering::SeqCst), 1);

    // The blocking attempt notices the cancelled request and winds down
    for _ in 0..100 {
        if abandoned.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(abandoned.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_deadline_stops_frame_decode() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 4);

    let abandoned = Arc::new(AtomicUsize::new(0));
    let preprocessor = Preprocessor::new(
        SourceResolver::new(
            vec![Arc::new(StalledReads {
                abandoned: abandoned.clone(),
            })],
            Duration::from_secs(5),
        ),
        PatchGeometry::new(32, 2),
        AssemblerConfig::default(),
        2,
    );
    let mut settings = settings();
    settings.runtime.request_timeout_secs = 1;
    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let session = ModelSession::from_settings(&settings, loader);
    let orchestrator = Orchestrator::new(settings, session, preprocessor);
    let (released, hook) = release_counter();

    let started = std::time::Instant::now();
    let request = VideoRequest::new(VideoSource::Path(dir.path().to_path_buf()), "hi");
    let err = orchestrator.infer(request, hook).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    assert_eq!(err.kind(), ErrorKind::VideoUnreadable);
    assert_eq!(err.stage(), Stage::Assemble);
    assert_eq!(err.backend().as_deref(), Some("stalled-reads"));
    assert_eq!(released.load(Ordering::SeqCst), 1);

    for _ in 0..100 {
        if abandoned.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(abandoned.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_odd_max_frames_never_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(dir.path(), 40);

    let loader = Arc::new(CountingLoader::new(Arc::new(EchoModel::default())));
    let orchestrator = Orchestrator::from_settings(settings(), loader).unwrap();
    let request = VideoRequest::new(VideoSource::Path(dir.path().to_path_buf()), "Count.")
        .with_video_params(VideoOptions {
            max_frames: Some(3),
            ..small_frames()
        });
    let result = orchestrator.infer(request, None).await.unwrap();

    assert!(result.text.starts_with("Count. [2x"), "{}", result.text);
}

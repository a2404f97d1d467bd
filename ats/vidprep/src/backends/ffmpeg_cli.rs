//! `ffprobe` / `ffmpeg` subprocess backend.
//!
//! Metadata comes from `ffprobe -of json`; selected frames are extracted in
//! one `ffmpeg` pass with a `select` filter and streamed back as raw rgb24.
//! Remote sources are read with `-seekable 1` so the demuxer can use range
//! requests instead of downloading the whole file.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::RgbImage;
use parking_lot::Mutex;
use serde::Deserialize;
use truvlm::{Stage, VideoSource};

use crate::cancel::CancelFlag;
use crate::error::{Result, VideoError};
use crate::source::{DecodeBackend, DecodeHandle};
use crate::types::{DecodedFrame, VideoMetadata};

const NAME: &str = "ffmpeg-cli";
const WATCHDOG_POLL: Duration = Duration::from_millis(20);

pub struct FfmpegCliBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    /// Socket read timeout passed to ffmpeg for remote sources
    rw_timeout: Duration,
}

impl FfmpegCliBackend {
    pub fn new(rw_timeout: Duration) -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            rw_timeout,
        }
    }

    /// Use explicit binaries instead of looking them up on `PATH`.
    pub fn with_binaries(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001`.
fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

fn parse_metadata(json: &[u8]) -> Result<VideoMetadata> {
    let probe: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| VideoError::unreadable(NAME, format!("unparseable ffprobe output: {}", e)))?;
    let stream = probe
        .streams
        .first()
        .ok_or_else(|| VideoError::unsupported(NAME, "no video stream"))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(VideoError::unreadable(NAME, "video stream has no dimensions")),
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .ok_or_else(|| VideoError::unreadable(NAME, "video stream has no frame rate"))?;

    let counted = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.trim().parse::<usize>().ok())
        .filter(|n| *n > 0);
    let frame_count = match counted {
        Some(n) => n,
        None => {
            let duration = stream
                .duration
                .as_deref()
                .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
                .and_then(|d| d.trim().parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d > 0.0)
                .ok_or_else(|| VideoError::unreadable(NAME, "unknown duration and frame count"))?;
            (duration * fps).round() as usize
        }
    };

    Ok(VideoMetadata {
        width,
        height,
        fps,
        frame_count,
    })
}

/// `select` expression matching exactly `indices`.
fn select_filter(indices: &[usize]) -> String {
    let terms: Vec<String> = indices.iter().map(|i| format!("eq(n\\,{})", i)).collect();
    format!("select='{}'", terms.join("+"))
}

/// Input options up to and including `-i`.
///
/// Frames come out in coded orientation: ffprobe reports the coded size,
/// and autorotation would transpose rotated streams against it.
fn input_args(source: &VideoSource, rw_timeout: Duration) -> Vec<String> {
    let mut args = vec!["-noautorotate".to_string()];
    match source {
        VideoSource::Url(url) => args.extend([
            "-rw_timeout".to_string(),
            rw_timeout.as_micros().to_string(),
            "-seekable".to_string(),
            "1".to_string(),
            "-i".to_string(),
            url.clone(),
        ]),
        VideoSource::Path(path) => {
            args.extend(["-i".to_string(), path.to_string_lossy().into_owned()])
        }
    }
    args
}

/// Messages that mean "this is not something ffmpeg can demux".
fn looks_unsupported(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "Invalid data found when processing input",
        "Protocol not found",
        "Unknown format",
        "does not contain any stream",
        "Decoder not found",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

fn last_line(stderr: &str) -> &str {
    stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// A running subprocess that is killed when `cancel` fires.
struct Supervised {
    child: Arc<Mutex<Child>>,
    done: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    watchdog: Option<thread::JoinHandle<()>>,
    stderr: Option<thread::JoinHandle<String>>,
}

impl Supervised {
    fn spawn(mut command: Command, cancel: &CancelFlag) -> std::io::Result<(Self, std::process::ChildStdout)> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let child = Arc::new(Mutex::new(child));
        let done = Arc::new(AtomicBool::new(false));
        let killed = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let child = Arc::clone(&child);
            let done = Arc::clone(&done);
            let killed = Arc::clone(&killed);
            let cancel = cancel.clone();
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        let _ = child.lock().kill();
                        killed.store(true, Ordering::SeqCst);
                        return;
                    }
                    thread::sleep(WATCHDOG_POLL);
                }
            })
        };

        Ok((
            Self {
                child,
                done,
                killed,
                watchdog: Some(watchdog),
                stderr,
            },
            stdout,
        ))
    }

    /// Wait for exit. Returns `None` when the process was killed by cancellation.
    fn finish(mut self) -> std::io::Result<Option<(ExitStatus, String)>> {
        self.done.store(true, Ordering::SeqCst);
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
        let status = self.child.lock().wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if self.killed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some((status, stderr)))
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        if self.watchdog.is_some() {
            self.done.store(true, Ordering::SeqCst);
            let mut child = self.child.lock();
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn spawn_error(binary: &std::path::Path, err: std::io::Error) -> VideoError {
    if err.kind() == std::io::ErrorKind::NotFound {
        VideoError::unsupported(NAME, format!("{} not found", binary.display()))
    } else {
        VideoError::unreadable(NAME, format!("failed to start {}: {}", binary.display(), err))
    }
}

impl DecodeBackend for FfmpegCliBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, source: &VideoSource, cancel: &CancelFlag) -> Result<Box<dyn DecodeHandle>> {
        if let Some(path) = source.local_path() {
            if path.is_dir() {
                return Err(VideoError::unsupported(NAME, "source is a directory"));
            }
            if !path.exists() {
                return Err(VideoError::unreadable(
                    NAME,
                    format!("{} does not exist", path.display()),
                ));
            }
        }

        let mut command = Command::new(&self.ffprobe);
        command.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames,duration:format=duration",
            "-of",
            "json",
        ]);
        if let VideoSource::Url(_) = source {
            command.args(["-rw_timeout", &self.rw_timeout.as_micros().to_string()]);
        }
        command.arg(source.location());

        let (process, mut stdout) =
            Supervised::spawn(command, cancel).map_err(|e| spawn_error(&self.ffprobe, e))?;
        let mut json = Vec::new();
        let read = stdout.read_to_end(&mut json);
        let finished = process
            .finish()
            .map_err(|e| VideoError::unreadable(NAME, e.to_string()))?;
        let Some((status, stderr)) = finished else {
            return Err(VideoError::Cancelled(Stage::Resolve));
        };
        read.map_err(|e| VideoError::unreadable(NAME, format!("reading ffprobe output: {}", e)))?;

        if !status.success() {
            let message = format!("ffprobe failed: {}", last_line(&stderr));
            return Err(if looks_unsupported(&stderr) {
                VideoError::unsupported(NAME, message)
            } else {
                VideoError::unreadable(NAME, message)
            });
        }

        let metadata = parse_metadata(&json)?;
        Ok(Box::new(FfmpegCliHandle {
            ffmpeg: self.ffmpeg.clone(),
            source: source.clone(),
            rw_timeout: self.rw_timeout,
            metadata,
        }))
    }
}

struct FfmpegCliHandle {
    ffmpeg: PathBuf,
    source: VideoSource,
    rw_timeout: Duration,
    metadata: VideoMetadata,
}

impl DecodeHandle for FfmpegCliHandle {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn read_frames(
        &mut self,
        indices: &[usize],
        cancel: &CancelFlag,
        sink: &mut dyn FnMut(DecodedFrame) -> Result<()>,
    ) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        cancel.check(Stage::Assemble)?;

        let mut command = Command::new(&self.ffmpeg);
        command.args(["-nostdin", "-v", "error"]);
        command.args(input_args(&self.source, self.rw_timeout));
        command.args(["-map", "0:v:0", "-vf"]);
        command.arg(select_filter(indices));
        command.args(["-vsync", "0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]);

        let (process, mut stdout) =
            Supervised::spawn(command, cancel).map_err(|e| spawn_error(&self.ffmpeg, e))?;

        let (width, height) = (self.metadata.width, self.metadata.height);
        let frame_len = width as usize * height as usize * 3;
        let mut delivered = 0;
        let mut sink_result = Ok(());
        for &index in indices {
            let mut buf = vec![0u8; frame_len];
            // Short read: the stream holds fewer frames than the container claimed
            if stdout.read_exact(&mut buf).is_err() {
                break;
            }
            let Some(image) = RgbImage::from_raw(width, height, buf) else {
                break;
            };
            let frame = DecodedFrame {
                index,
                timestamp: index as f64 / self.metadata.fps,
                image,
            };
            if let Err(e) = sink(frame) {
                sink_result = Err(e);
                break;
            }
            delivered += 1;
        }
        drop(stdout);

        let finished = process
            .finish()
            .map_err(|e| VideoError::decode(NAME, e.to_string()))?;
        sink_result?;
        let Some((status, stderr)) = finished else {
            return Err(VideoError::Cancelled(Stage::Assemble));
        };
        if !status.success() && delivered < indices.len() {
            return Err(VideoError::decode(NAME, format!("ffmpeg failed: {}", last_line(&stderr))));
        }

        tracing::debug!(requested = indices.len(), delivered, "ffmpeg frames extracted");
        Ok(())
    }
}

//! In-process decoding through libav (`ffmpeg-next`).
//!
//! Frames are decoded sequentially from the start of the stream and
//! counted; only selected frames are converted to rgb24.

use std::sync::Once;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{input, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg::util::frame::video::Video as VideoFrame;
use image::RgbImage;
use truvlm::{Stage, VideoSource};

use crate::cancel::CancelFlag;
use crate::error::{Result, VideoError};
use crate::source::{DecodeBackend, DecodeHandle};
use crate::types::{DecodedFrame, VideoMetadata};

const NAME: &str = "ffmpeg";

static INIT: Once = Once::new();

pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        INIT.call_once(|| {
            if let Err(e) = ffmpeg::init() {
                tracing::warn!("ffmpeg init failed: {}", e);
            }
            ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        });
        Self
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: ffmpeg::Error) -> VideoError {
    match err {
        ffmpeg::Error::InvalidData
        | ffmpeg::Error::ProtocolNotFound
        | ffmpeg::Error::DemuxerNotFound
        | ffmpeg::Error::DecoderNotFound
        | ffmpeg::Error::StreamNotFound => VideoError::unsupported(NAME, err.to_string()),
        other => VideoError::unreadable(NAME, other.to_string()),
    }
}

fn rational(r: ffmpeg::Rational) -> Option<f64> {
    if r.denominator() == 0 || r.numerator() <= 0 {
        None
    } else {
        Some(r.numerator() as f64 / r.denominator() as f64)
    }
}

/// Copy an rgb24 frame into a tightly packed image, honoring line stride.
fn to_image(frame: &VideoFrame) -> Option<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let stride = frame.stride(0);
    let row = width as usize * 3;
    let data = frame.data(0);
    let mut buf = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        buf.extend_from_slice(data.get(y * stride..y * stride + row)?);
    }
    RgbImage::from_raw(width, height, buf)
}

impl DecodeBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, source: &VideoSource, cancel: &CancelFlag) -> Result<Box<dyn DecodeHandle>> {
        if source.local_path().is_some_and(|p| p.is_dir()) {
            return Err(VideoError::unsupported(NAME, "source is a directory"));
        }
        let location = source.location();
        let ictx = input(&location).map_err(classify)?;
        cancel.check(Stage::Resolve)?;

        let stream = ictx
            .streams()
            .best(Type::Video)
            .ok_or_else(|| VideoError::unsupported(NAME, "no video stream"))?;
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(classify)?;
        let decoder = context.decoder().video().map_err(classify)?;

        let fps = rational(stream.avg_frame_rate())
            .or_else(|| rational(stream.rate()))
            .ok_or_else(|| VideoError::unreadable(NAME, "video stream has no frame rate"))?;
        let frame_count = if stream.frames() > 0 {
            stream.frames() as usize
        } else {
            let seconds = if stream.duration() > 0 {
                stream.duration() as f64 * rational(stream.time_base()).unwrap_or(0.0)
            } else {
                ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
            };
            (seconds.max(0.0) * fps).round() as usize
        };

        Ok(Box::new(FfmpegHandle {
            location,
            metadata: VideoMetadata {
                width: decoder.width(),
                height: decoder.height(),
                fps,
                frame_count,
            },
        }))
    }
}

struct FfmpegHandle {
    location: String,
    metadata: VideoMetadata,
}

struct FrameCursor<'a> {
    wanted: &'a [usize],
    next: usize,
    counter: usize,
    fps: f64,
}

impl FrameCursor<'_> {
    fn finished(&self) -> bool {
        self.next >= self.wanted.len()
    }
}

fn drain(
    decoder: &mut ffmpeg::decoder::Video,
    scaler: &mut Option<ScalingContext>,
    cursor: &mut FrameCursor<'_>,
    sink: &mut dyn FnMut(DecodedFrame) -> Result<()>,
) -> Result<()> {
    let mut decoded = VideoFrame::empty();
    while !cursor.finished() && decoder.receive_frame(&mut decoded).is_ok() {
        let index = cursor.counter;
        cursor.counter += 1;
        if cursor.wanted[cursor.next] != index {
            continue;
        }
        cursor.next += 1;

        if scaler.is_none() {
            *scaler = Some(
                ScalingContext::get(
                    decoded.format(),
                    decoded.width(),
                    decoded.height(),
                    Pixel::RGB24,
                    decoded.width(),
                    decoded.height(),
                    ScalingFlags::BILINEAR,
                )
                .map_err(|e| VideoError::decode(NAME, e.to_string()))?,
            );
        }
        let mut rgb = VideoFrame::empty();
        if let Some(scaler) = scaler.as_mut() {
            scaler
                .run(&decoded, &mut rgb)
                .map_err(|e| VideoError::decode(NAME, e.to_string()))?;
        }
        let image = to_image(&rgb)
            .ok_or_else(|| VideoError::decode(NAME, format!("frame {} has a short buffer", index)))?;
        sink(DecodedFrame {
            index,
            timestamp: index as f64 / cursor.fps,
            image,
        })?;
    }
    Ok(())
}

impl DecodeHandle for FfmpegHandle {
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
        let mut ictx = input(&self.location).map_err(|e| VideoError::decode(NAME, e.to_string()))?;
        let stream = ictx
            .streams()
            .best(Type::Video)
            .ok_or_else(|| VideoError::decode(NAME, "video stream disappeared"))?;
        let stream_index = stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| VideoError::decode(NAME, e.to_string()))?;
        let mut decoder = context
            .decoder()
            .video()
            .map_err(|e| VideoError::decode(NAME, e.to_string()))?;

        let mut scaler = None;
        let mut cursor = FrameCursor {
            wanted: indices,
            next: 0,
            counter: 0,
            fps: self.metadata.fps,
        };

        for (stream, packet) in ictx.packets() {
            cancel.check(Stage::Assemble)?;
            if stream.index() != stream_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .map_err(|e| VideoError::decode(NAME, format!("packet rejected: {}", e)))?;
            drain(&mut decoder, &mut scaler, &mut cursor, sink)?;
            if cursor.finished() {
                return Ok(());
            }
        }

        decoder
            .send_eof()
            .map_err(|e| VideoError::decode(NAME, e.to_string()))?;
        drain(&mut decoder, &mut scaler, &mut cursor, sink)
    }
}

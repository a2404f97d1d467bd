//! Request and response types exchanged with the transport layer.
//!
//! Requests carry optional overrides (`VideoOptions`, `GenerationOptions`);
//! they are resolved against the configured defaults into the concrete,
//! validated `VideoConstraints` and `GenerationParams` the pipeline runs on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MAX_TOKENS_RANGE: (u32, u32) = (1, 4096);
pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);
pub const TOP_P_RANGE: (f32, f32) = (0.0, 1.0);
pub const TOP_K_RANGE: (u32, u32) = (0, 100);

/// Where the video comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VideoSource {
    /// Remote `http://` or `https://` resource
    Url(String),
    /// Local file, or directory of pre-extracted frames
    Path(PathBuf),
}

impl VideoSource {
    /// Parse a source reference.
    ///
    /// `file://` URLs are mapped to local paths; any other scheme besides
    /// http(s) is rejected.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::validation("source", "must not be empty"));
        }

        if let Some(path) = reference.strip_prefix("file://") {
            if path.is_empty() {
                return Err(Error::validation("source", "file:// URL has no path"));
            }
            return Ok(VideoSource::Path(PathBuf::from(path)));
        }

        let lower = reference.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let host = reference
                .split_once("://")
                .map(|(_, rest)| rest.split('/').next().unwrap_or(""))
                .unwrap_or("");
            if host.is_empty() {
                return Err(Error::validation("source", "URL has no host"));
            }
            return Ok(VideoSource::Url(reference.to_string()));
        }

        if let Some((scheme, _)) = reference.split_once("://") {
            return Err(Error::validation(
                "source",
                format!("unsupported URL scheme '{}', expected http:// or https://", scheme),
            ));
        }

        Ok(VideoSource::Path(PathBuf::from(reference)))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, VideoSource::Url(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            VideoSource::Path(path) => Some(path),
            VideoSource::Url(_) => None,
        }
    }

    /// Location string suitable for handing to a decoder.
    pub fn location(&self) -> String {
        match self {
            VideoSource::Url(url) => url.clone(),
            VideoSource::Path(path) => path.to_string_lossy().into_owned(),
        }
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location())
    }
}

impl TryFrom<String> for VideoSource {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        VideoSource::parse(&value)
    }
}

impl From<VideoSource> for String {
    fn from(source: VideoSource) -> Self {
        source.location()
    }
}

/// Per-request overrides of the video sampling defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoOptions {
    /// Frames per second to sample
    pub fps: Option<f64>,
    /// Exact number of frames to sample (mutually exclusive with `fps`)
    pub nframes: Option<usize>,
    pub max_frames: Option<usize>,
    pub min_pixels: Option<u64>,
    pub max_pixels: Option<u64>,
    /// Pixel budget for the whole clip
    pub total_pixels: Option<u64>,
}

/// Concrete video sampling constraints for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConstraints {
    pub fps: f64,
    pub nframes: Option<usize>,
    pub max_frames: usize,
    pub min_pixels: u64,
    pub max_pixels: u64,
    pub total_pixels: u64,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            fps: 2.0,
            nframes: None,
            max_frames: 768,
            min_pixels: 4 * 32 * 32,
            max_pixels: 256 * 32 * 32,
            total_pixels: 20480 * 32 * 32,
        }
    }
}

impl VideoOptions {
    /// Merge the overrides onto `defaults` and validate the result.
    pub fn resolve(&self, defaults: &VideoConstraints, min_frames: usize) -> Result<VideoConstraints> {
        if self.fps.is_some() && self.nframes.is_some() {
            return Err(Error::validation(
                "video_params",
                "fps and nframes cannot be specified at the same time",
            ));
        }

        let constraints = VideoConstraints {
            fps: self.fps.unwrap_or(defaults.fps),
            nframes: self.nframes.or(defaults.nframes),
            max_frames: self.max_frames.unwrap_or(defaults.max_frames),
            min_pixels: self.min_pixels.unwrap_or(defaults.min_pixels),
            max_pixels: self.max_pixels.unwrap_or(defaults.max_pixels),
            total_pixels: self.total_pixels.unwrap_or(defaults.total_pixels),
        };
        constraints.validate(min_frames)?;
        Ok(constraints)
    }
}

impl VideoConstraints {
    pub fn validate(&self, min_frames: usize) -> Result<()> {
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(Error::validation(
                "fps",
                format!("must be a positive number, got {}", self.fps),
            ));
        }
        if self.nframes == Some(0) {
            return Err(Error::validation("nframes", "must be at least 1"));
        }
        if self.max_frames < min_frames {
            return Err(Error::validation(
                "max_frames",
                format!("must be at least {}, got {}", min_frames, self.max_frames),
            ));
        }
        if self.min_pixels == 0 {
            return Err(Error::validation("min_pixels", "must be greater than 0"));
        }
        if self.min_pixels > self.max_pixels {
            return Err(Error::validation(
                "max_pixels",
                format!(
                    "must be >= min_pixels ({}), got {}",
                    self.min_pixels, self.max_pixels
                ),
            ));
        }
        if self.total_pixels == 0 {
            return Err(Error::validation("total_pixels", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Per-request overrides of the generation defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

/// Validated text generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    /// Seed for the sampling RNG
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            top_p: 0.8,
            top_k: 20,
            seed: 42,
        }
    }
}

impl GenerationOptions {
    pub fn resolve(&self, defaults: &GenerationParams) -> Result<GenerationParams> {
        let params = GenerationParams {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            seed: defaults.seed,
        };
        params.validate()?;
        Ok(params)
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = MAX_TOKENS_RANGE;
        if !(lo..=hi).contains(&self.max_tokens) {
            return Err(Error::validation(
                "max_tokens",
                format!("must be between {} and {}, got {}", lo, hi, self.max_tokens),
            ));
        }
        let (lo, hi) = TEMPERATURE_RANGE;
        if !self.temperature.is_finite() || !(lo..=hi).contains(&self.temperature) {
            return Err(Error::validation(
                "temperature",
                format!("must be between {:.1} and {:.1}, got {}", lo, hi, self.temperature),
            ));
        }
        let (lo, hi) = TOP_P_RANGE;
        if !self.top_p.is_finite() || !(lo..=hi).contains(&self.top_p) {
            return Err(Error::validation(
                "top_p",
                format!("must be between {:.1} and {:.1}, got {}", lo, hi, self.top_p),
            ));
        }
        let (lo, hi) = TOP_K_RANGE;
        if !(lo..=hi).contains(&self.top_k) {
            return Err(Error::validation(
                "top_k",
                format!("must be between {} and {}, got {}", lo, hi, self.top_k),
            ));
        }
        Ok(())
    }

    /// Temperature 0 means greedy decoding.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }
}

/// Video + prompt inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub source: VideoSource,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_params: Option<VideoOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_params: Option<GenerationOptions>,
}

impl VideoRequest {
    pub fn new(source: VideoSource, prompt: impl Into<String>) -> Self {
        Self {
            source,
            prompt: prompt.into(),
            video_params: None,
            generation_params: None,
        }
    }

    pub fn with_video_params(mut self, options: VideoOptions) -> Self {
        self.video_params = Some(options);
        self
    }

    pub fn with_generation_params(mut self, options: GenerationOptions) -> Self {
        self.generation_params = Some(options);
        self
    }
}

/// Generated description for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub text: String,
    /// Runtime backend that served the request
    pub backend: String,
    pub source_echo: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parsing() {
        assert_eq!(
            VideoSource::parse("https://example.com/clip.mp4").unwrap(),
            VideoSource::Url("https://example.com/clip.mp4".to_string())
        );
        assert_eq!(
            VideoSource::parse("file:///tmp/upload.mp4").unwrap(),
            VideoSource::Path(PathBuf::from("/tmp/upload.mp4"))
        );
        assert_eq!(
            VideoSource::parse("clips/a.mkv").unwrap(),
            VideoSource::Path(PathBuf::from("clips/a.mkv"))
        );
        assert!(VideoSource::parse("").is_err());
        assert!(VideoSource::parse("rtsp://camera/stream").is_err());
        assert!(VideoSource::parse("http:///nohost").is_err());
    }

    #[test]
    fn test_generation_defaults_are_valid() {
        let params = GenerationOptions::default()
            .resolve(&GenerationParams::default())
            .unwrap();
        assert_eq!(params.max_tokens, 2048);
        assert_eq!(params.top_k, 20);
        assert!(!params.is_greedy());
    }

    #[test]
    fn test_generation_range_violations() {
        let defaults = GenerationParams::default();
        let cases = [
            (GenerationOptions { max_tokens: Some(0), ..Default::default() }, "max_tokens"),
            (GenerationOptions { max_tokens: Some(4097), ..Default::default() }, "max_tokens"),
            (GenerationOptions { temperature: Some(2.5), ..Default::default() }, "temperature"),
            (GenerationOptions { temperature: Some(f32::NAN), ..Default::default() }, "temperature"),
            (GenerationOptions { top_p: Some(1.01), ..Default::default() }, "top_p"),
            (GenerationOptions { top_k: Some(101), ..Default::default() }, "top_k"),
        ];
        for (options, expected) in cases {
            match options.resolve(&defaults) {
                Err(Error::Validation { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected validation error on {}, got {:?}", expected, other),
            }
        }

        let edges = GenerationOptions {
            max_tokens: Some(4096),
            temperature: Some(0.0),
            top_p: Some(1.0),
            top_k: Some(0),
        };
        assert!(edges.resolve(&defaults).unwrap().is_greedy());
    }

    #[test]
    fn test_video_options_resolve() {
        let defaults = VideoConstraints::default();
        let resolved = VideoOptions {
            fps: Some(1.0),
            ..Default::default()
        }
        .resolve(&defaults, 2)
        .unwrap();
        assert_eq!(resolved.fps, 1.0);
        assert_eq!(resolved.max_frames, 768);

        let both = VideoOptions {
            fps: Some(1.0),
            nframes: Some(8),
            ..Default::default()
        };
        assert!(both.resolve(&defaults, 2).is_err());

        let too_few = VideoOptions {
            max_frames: Some(1),
            ..Default::default()
        };
        assert!(too_few.resolve(&defaults, 2).is_err());

        let inverted = VideoOptions {
            min_pixels: Some(10_000),
            max_pixels: Some(5_000),
            ..Default::default()
        };
        assert!(inverted.resolve(&defaults, 2).is_err());
    }

    #[test]
    fn test_request_json_shape() {
        let json = r#"{
            "source": "https://example.com/v.mp4",
            "prompt": "Describe the video",
            "video_params": {"fps": 1.0, "max_frames": 64},
            "generation_params": {"max_tokens": 128}
        }"#;
        let request: VideoRequest = serde_json::from_str(json).unwrap();
        assert!(request.source.is_remote());
        assert_eq!(request.video_params.unwrap().max_frames, Some(64));

        let bad = r#"{"source": "ftp://x/y.mp4", "prompt": "p"}"#;
        assert!(serde_json::from_str::<VideoRequest>(bad).is_err());
    }
}

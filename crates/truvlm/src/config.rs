//! Service configuration.
//!
//! Settings come from three layers, later layers winning: built-in
//! defaults, an optional JSON file, and environment variables. The binary
//! applies its command line flags on top.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::request::{GenerationParams, VideoConstraints};
use crate::types::{BackendKind, DecoderKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service_name: String,
    pub model: ModelSettings,
    pub video: VideoSettings,
    pub vision: VisionSettings,
    pub generation: GenerationParams,
    pub decode: DecodeSettings,
    pub runtime: RuntimeSettings,
    pub preprocess: PreprocessSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "tru-v2-vlm-inference".to_string(),
            model: ModelSettings::default(),
            video: VideoSettings::default(),
            vision: VisionSettings::default(),
            generation: GenerationParams::default(),
            decode: DecodeSettings::default(),
            runtime: RuntimeSettings::default(),
            preprocess: PreprocessSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model directory (or hub id, resolved by the loader)
    pub path: String,
    pub backend: BackendKind,
    /// Load the model before accepting requests instead of on first use
    pub load_on_startup: bool,
    /// How long a request waits for a session that is still loading
    pub load_wait_secs: u64,
    /// Intra-op threads for the model runtime (0 = auto)
    pub num_threads: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: "Qwen/Qwen3-VL-8B-Instruct".to_string(),
            backend: BackendKind::Direct,
            load_on_startup: true,
            load_wait_secs: 600,
            num_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    #[serde(flatten)]
    pub defaults: VideoConstraints,
    /// Smallest valid temporal block of frames
    pub min_frames: usize,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            defaults: VideoConstraints::default(),
            min_frames: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionSettings {
    /// Vision transformer patch edge in pixels (16 for Qwen3-VL, 14 for Qwen2.5-VL)
    pub image_patch_size: u32,
    /// Patches merged per side before reaching the language model
    pub spatial_merge_size: u32,
    /// Frames folded into one temporal patch
    pub temporal_patch_size: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            image_patch_size: 16,
            spatial_merge_size: 2,
            temporal_patch_size: 2,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
        }
    }
}

impl VisionSettings {
    /// Alignment unit for planned frame dimensions.
    pub fn patch_unit(&self) -> u32 {
        self.image_patch_size * self.spatial_merge_size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeSettings {
    /// Decode backends in priority order
    pub backends: Vec<DecoderKind>,
    pub attempt_timeout_ms: u64,
    /// Fail instead of padding when some selected frames cannot be decoded
    pub strict: bool,
    /// Frame rate assumed for directories of pre-extracted frames
    pub frames_fps: f64,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            backends: vec![DecoderKind::Ffmpeg, DecoderKind::FfmpegCli, DecoderKind::Frames],
            attempt_timeout_ms: 30_000,
            strict: false,
            frames_fps: 2.0,
        }
    }
}

impl DecodeSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub generation_timeout_secs: u64,
    /// End-to-end deadline for one request
    pub request_timeout_secs: u64,
    /// Largest batch the fast-batch backend hands to the model at once
    pub max_batch_size: usize,
    /// How long the fast-batch backend waits to fill a batch
    pub batch_window_ms: u64,
    /// Pending generations allowed before submitters are back-pressured
    pub queue_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            generation_timeout_secs: 300,
            request_timeout_secs: 900,
            max_batch_size: 8,
            batch_window_ms: 10,
            queue_capacity: 64,
        }
    }
}

impl RuntimeSettings {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Requests allowed to decode and resize at the same time
    pub max_concurrent: usize,
    /// Host memory shared by in-flight frame batches, in MiB
    pub memory_budget_mb: u64,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            memory_budget_mb: 8192,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Defaults (or `path`), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply recognized environment variables from `vars`.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "SERVICE_NAME" => self.service_name = value,
                "MODEL_PATH" => self.model.path = value,
                "MODEL_BACKEND" => self.model.backend = value.parse()?,
                "LOAD_ON_STARTUP" => self.model.load_on_startup = parse_env(&key, &value)?,
                "IMAGE_PATCH_SIZE" => self.vision.image_patch_size = parse_env(&key, &value)?,
                "DEFAULT_VIDEO_FPS" => self.video.defaults.fps = parse_env(&key, &value)?,
                "DEFAULT_MAX_FRAMES" => self.video.defaults.max_frames = parse_env(&key, &value)?,
                "DEFAULT_MIN_PIXELS" => self.video.defaults.min_pixels = parse_env(&key, &value)?,
                "DEFAULT_MAX_PIXELS" => self.video.defaults.max_pixels = parse_env(&key, &value)?,
                "DEFAULT_TOTAL_PIXELS" => {
                    self.video.defaults.total_pixels = parse_env(&key, &value)?
                }
                "MAX_NEW_TOKENS" => self.generation.max_tokens = parse_env(&key, &value)?,
                "TEMPERATURE" => self.generation.temperature = parse_env(&key, &value)?,
                "TOP_P" => self.generation.top_p = parse_env(&key, &value)?,
                "TOP_K" => self.generation.top_k = parse_env(&key, &value)?,
                "DECODE_BACKENDS" => {
                    self.decode.backends = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(DecoderKind::from_str)
                        .collect::<Result<Vec<_>>>()?;
                }
                "DECODE_TIMEOUT_MS" => self.decode.attempt_timeout_ms = parse_env(&key, &value)?,
                "GENERATION_TIMEOUT_SECS" => {
                    self.runtime.generation_timeout_secs = parse_env(&key, &value)?
                }
                "MAX_CONCURRENT_PREPROCESS" => {
                    self.preprocess.max_concurrent = parse_env(&key, &value)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.path.trim().is_empty() {
            return Err(Error::Config("model.path must not be empty".to_string()));
        }
        if self.vision.image_patch_size == 0 || self.vision.spatial_merge_size == 0 {
            return Err(Error::Config(
                "vision.image_patch_size and vision.spatial_merge_size must be positive".to_string(),
            ));
        }
        if self.vision.temporal_patch_size == 0 {
            return Err(Error::Config(
                "vision.temporal_patch_size must be positive".to_string(),
            ));
        }
        if self.vision.image_std.iter().any(|s| *s <= 0.0) {
            return Err(Error::Config("vision.image_std must be positive".to_string()));
        }
        if self.video.min_frames == 0 || self.video.min_frames % self.vision.temporal_patch_size != 0 {
            return Err(Error::Config(format!(
                "video.min_frames must be a positive multiple of vision.temporal_patch_size ({}), got {}",
                self.vision.temporal_patch_size, self.video.min_frames
            )));
        }
        self.video
            .defaults
            .validate(self.video.min_frames)
            .map_err(|e| Error::Config(format!("video defaults: {}", e)))?;
        self.generation
            .validate()
            .map_err(|e| Error::Config(format!("generation defaults: {}", e)))?;

        if self.decode.backends.is_empty() {
            return Err(Error::Config("decode.backends must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for backend in &self.decode.backends {
            if !seen.insert(backend) {
                return Err(Error::Config(format!(
                    "decode backend '{}' listed twice",
                    backend
                )));
            }
        }
        if self.decode.attempt_timeout_ms == 0 {
            return Err(Error::Config("decode.attempt_timeout_ms must be positive".to_string()));
        }
        if !self.decode.frames_fps.is_finite() || self.decode.frames_fps <= 0.0 {
            return Err(Error::Config("decode.frames_fps must be positive".to_string()));
        }

        if self.runtime.generation_timeout_secs == 0 || self.runtime.request_timeout_secs == 0 {
            return Err(Error::Config("runtime timeouts must be positive".to_string()));
        }
        if self.runtime.max_batch_size == 0 || self.runtime.queue_capacity == 0 {
            return Err(Error::Config(
                "runtime.max_batch_size and runtime.queue_capacity must be positive".to_string(),
            ));
        }
        if self.preprocess.max_concurrent == 0 || self.preprocess.memory_budget_mb == 0 {
            return Err(Error::Config(
                "preprocess.max_concurrent and preprocess.memory_budget_mb must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid value for {}: '{}' ({})", key, value, e)))
}

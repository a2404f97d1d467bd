//! truvlm - one-shot video + prompt inference
//!
//! Usage:
//!     truvlm --source clip.mp4 --prompt "Describe the video"
//!     truvlm --config truvlm.json --source https://example.com/a.mp4 --prompt "..." --fps 1

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use truvlm::tracing::prefix;
use truvlm::{
    BackendKind, GenerationOptions, Settings, VideoOptions, VideoRequest, VideoSource,
};
use truvlm_inference::{default_loader, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "truvlm")]
#[command(about = "Describe a video with a vision-language model")]
#[command(version)]
struct Args {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Video URL, file, or directory of frames
    #[arg(short, long)]
    source: String,

    #[arg(short, long)]
    prompt: String,

    /// Model directory (overrides MODEL_PATH)
    #[arg(long)]
    model_path: Option<String>,

    /// Runtime backend: fast-batch (vllm) or direct (hf)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Frames per second to sample
    #[arg(long, conflicts_with = "nframes")]
    fps: Option<f64>,

    /// Exact number of frames to sample
    #[arg(long)]
    nframes: Option<usize>,

    #[arg(long)]
    max_frames: Option<usize>,

    #[arg(long)]
    min_pixels: Option<u64>,

    #[arg(long)]
    max_pixels: Option<u64>,

    #[arg(long)]
    total_pixels: Option<u64>,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    top_k: Option<u32>,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn request(&self) -> truvlm::Result<VideoRequest> {
        Ok(VideoRequest::new(VideoSource::parse(&self.source)?, self.prompt.clone())
            .with_video_params(VideoOptions {
                fps: self.fps,
                nframes: self.nframes,
                max_frames: self.max_frames,
                min_pixels: self.min_pixels,
                max_pixels: self.max_pixels,
                total_pixels: self.total_pixels,
            })
            .with_generation_params(GenerationOptions {
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
            }))
    }

    fn settings(&self) -> truvlm::Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(path) = &self.model_path {
            settings.model.path = path.clone();
        }
        if let Some(backend) = self.backend {
            settings.model.backend = backend;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    truvlm::tracing::init_with_filter(&args.log_level);

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            print_json(&e.to_response());
            if e.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: &Args) -> truvlm::Result<()> {
    let settings = args.settings()?;
    let request = args.request()?;

    info!(
        "{} Starting {} v{} ({} backend)",
        prefix::OPEN,
        settings.service_name,
        env!("CARGO_PKG_VERSION"),
        settings.model.backend
    );

    let load_on_startup = settings.model.load_on_startup;
    let loader = default_loader(&settings);
    let orchestrator = Orchestrator::from_settings(settings, loader)?;
    if load_on_startup {
        orchestrator.session().load().await?;
    }

    let result = orchestrator.infer(request, None).await;
    orchestrator.session().shutdown();

    print_json(&result?);
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("failed to serialize output: {}", e),
    }
}

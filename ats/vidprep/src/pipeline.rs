//! Preprocessing pipeline: resolve → sample → plan → assemble.

use tokio::time::Instant;
use truvlm::{Settings, Stage, VideoConstraints, VideoSource};

use crate::assembler::{self, AssemblerConfig};
use crate::cancel::CancelFlag;
use crate::error::{Result, VideoError};
use crate::planner::{self, PatchGeometry};
use crate::sampler;
use crate::source::{OpenedVideo, SourceResolver};
use crate::types::{FrameBatch, FrameSelection, ResolutionPlan, VideoMetadata};

/// Stateless per-request preprocessing; safe to share across requests.
pub struct Preprocessor {
    resolver: SourceResolver,
    geometry: PatchGeometry,
    assembler: AssemblerConfig,
    min_frames: usize,
}

impl Preprocessor {
    pub fn new(
        resolver: SourceResolver,
        geometry: PatchGeometry,
        assembler: AssemblerConfig,
        min_frames: usize,
    ) -> Self {
        Self {
            resolver,
            geometry,
            assembler,
            min_frames,
        }
    }

    pub fn from_settings(settings: &Settings) -> truvlm::Result<Self> {
        Ok(Self::new(
            SourceResolver::from_settings(&settings.decode)?,
            PatchGeometry::new(
                settings.vision.patch_unit(),
                settings.vision.temporal_patch_size,
            ),
            AssemblerConfig::from_settings(&settings.vision, settings.decode.strict),
            settings.video.min_frames,
        ))
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    pub async fn open(
        &self,
        source: &VideoSource,
        cancel: &CancelFlag,
        deadline: Option<Instant>,
    ) -> Result<OpenedVideo> {
        self.resolver.open(source, cancel, deadline).await
    }

    /// Frame selection and target resolution for an opened video.
    pub fn plan(
        &self,
        metadata: &VideoMetadata,
        constraints: &VideoConstraints,
    ) -> Result<(FrameSelection, ResolutionPlan)> {
        let selection = sampler::sample(
            metadata,
            constraints,
            self.min_frames,
            self.geometry.temporal_patch_size,
        )?;
        let plan = planner::plan(
            metadata.width,
            metadata.height,
            selection.len(),
            constraints,
            self.geometry,
        )?;
        Ok((selection, plan))
    }

    /// Decode and assemble on the blocking pool. The decode handle is
    /// released when this returns, whatever the outcome.
    ///
    /// Passing `deadline` cancels the decode and fails with
    /// [`VideoError::DecodeDeadline`].
    pub async fn assemble(
        &self,
        mut video: OpenedVideo,
        selection: FrameSelection,
        plan: ResolutionPlan,
        cancel: &CancelFlag,
        deadline: Option<Instant>,
    ) -> Result<FrameBatch> {
        let config = self.assembler.clone();
        let backend = video.backend;
        let task = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                assembler::assemble(&mut video, &selection, &plan, &config, &cancel)
            })
        };

        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.cancel();
                    tracing::warn!(backend, "request deadline passed during frame decode");
                    return Err(VideoError::DecodeDeadline { backend });
                }
            },
            None => task.await,
        };
        joined.map_err(|e| VideoError::decode(backend, format!("assembly task failed: {}", e)))?
    }

    /// Run every stage for `source`.
    pub async fn run(
        &self,
        source: &VideoSource,
        constraints: &VideoConstraints,
        cancel: &CancelFlag,
        deadline: Option<Instant>,
    ) -> Result<FrameBatch> {
        let video = self.open(source, cancel, deadline).await?;
        let (selection, plan) = self.plan(&video.metadata, constraints)?;
        cancel.check(Stage::Assemble)?;
        self.assemble(video, selection, plan, cancel, deadline).await
    }
}

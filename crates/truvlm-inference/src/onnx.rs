//! ONNX vision-language model.
//!
//! Expects a Qwen-VL style export in the model directory:
//!
//! - `vision_encoder.onnx`: `pixel_values [patches, C·tps·p·p]`, `grid_thw [1, 3]`
//!   → `image_embeds [tokens, hidden]`
//! - `embed_tokens.onnx`: `input_ids [1, seq]` → `inputs_embeds [1, seq, hidden]`
//! - `decoder_model.onnx`: `inputs_embeds`, `attention_mask [1, seq]`,
//!   `position_ids [3, 1, seq]` → `logits [1, seq, vocab]`
//! - `tokenizer.json`

use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{Array2, Array3};
use ort::{GraphOptimizationLevel, Session};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, info};
use truvlm::{GenerationParams, Settings};
use truvlm_vidprep::FrameBatch;

use crate::error::{Result, RuntimeError};
use crate::model::{GenerationInput, ModelLoader, VisionLanguageModel};

const VISION_ENCODER: &str = "vision_encoder.onnx";
const EMBED_TOKENS: &str = "embed_tokens.onnx";
const DECODER: &str = "decoder_model.onnx";
const TOKENIZER: &str = "tokenizer.json";

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Layout of the vision patches the encoder was exported with.
#[derive(Debug, Clone, Copy)]
pub struct PatchLayout {
    pub patch: usize,
    pub merge: usize,
    pub temporal: usize,
}

pub struct OnnxLoader {
    model_dir: PathBuf,
    model_path: String,
    num_threads: usize,
    layout: PatchLayout,
}

impl OnnxLoader {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            model_dir: PathBuf::from(&settings.model.path),
            model_path: settings.model.path.clone(),
            num_threads: settings.model.num_threads,
            layout: PatchLayout {
                patch: settings.vision.image_patch_size as usize,
                merge: settings.vision.spatial_merge_size as usize,
                temporal: settings.vision.temporal_patch_size,
            },
        }
    }

    fn session(&self, file: &str) -> Result<Session> {
        let path = self.model_dir.join(file);
        if !path.exists() {
            return Err(RuntimeError::ModelLoad(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let mut builder = Session::builder()
            .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;

        if self.num_threads > 0 {
            builder = builder
                .with_intra_threads(self.num_threads)
                .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;
        }

        builder
            .commit_from_file(&path)
            .map_err(|e| RuntimeError::ModelLoad(format!("{}: {}", path.display(), e)))
    }
}

impl ModelLoader for OnnxLoader {
    fn model_path(&self) -> &str {
        &self.model_path
    }

    fn load(&self) -> Result<Arc<dyn VisionLanguageModel>> {
        info!("Loading ONNX model from {}", self.model_dir.display());

        let tokenizer_path = self.model_dir.join(TOKENIZER);
        if !tokenizer_path.exists() {
            return Err(RuntimeError::TokenizerLoad(format!(
                "tokenizer file not found: {}",
                tokenizer_path.display()
            )));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| RuntimeError::TokenizerLoad(e.to_string()))?;
        let tokens = SpecialTokens::lookup(&tokenizer)?;

        let model = OnnxModel {
            vision: self.session(VISION_ENCODER)?,
            embed: self.session(EMBED_TOKENS)?,
            decoder: self.session(DECODER)?,
            tokenizer,
            tokens,
            layout: self.layout,
        };
        info!("ONNX model loaded successfully");
        Ok(Arc::new(model))
    }
}

#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    video_pad: u32,
    vision_start: u32,
    im_end: u32,
    end_of_text: Option<u32>,
}

impl SpecialTokens {
    fn lookup(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                RuntimeError::TokenizerLoad(format!("tokenizer has no {} token", token))
            })
        };
        Ok(Self {
            video_pad: id("<|video_pad|>")?,
            vision_start: id("<|vision_start|>")?,
            im_end: id("<|im_end|>")?,
            end_of_text: tokenizer.token_to_id("<|endoftext|>"),
        })
    }

    fn is_eos(&self, token: u32) -> bool {
        token == self.im_end || Some(token) == self.end_of_text
    }
}

struct OnnxModel {
    vision: Session,
    embed: Session,
    decoder: Session,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    layout: PatchLayout,
}

impl VisionLanguageModel for OnnxModel {
    fn generate(&self, batch: Vec<GenerationInput>) -> Vec<Result<String>> {
        batch
            .into_iter()
            .map(|input| self.generate_one(input))
            .collect()
    }
}

impl OnnxModel {
    fn generate_one(&self, input: GenerationInput) -> Result<String> {
        let GenerationInput {
            prompt,
            frames,
            params,
        } = input;
        let grid = frames.grid_thw;
        let merged = [grid[0], grid[1] / self.layout.merge, grid[2] / self.layout.merge];
        let video_tokens = merged.iter().product::<usize>();

        let vision = self.encode_video(&frames)?;
        drop(frames);
        if vision.nrows() != video_tokens {
            return Err(RuntimeError::Generation(format!(
                "vision encoder returned {} tokens, expected {}",
                vision.nrows(),
                video_tokens
            )));
        }

        let text = chat_prompt(&prompt, video_tokens);
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))?;
        let mut ids: Vec<u32> = encoding.get_ids().to_vec();

        let hidden = vision.ncols();
        let mut embeds = self.embed_tokens(&ids)?;
        if embeds.len() != ids.len() * hidden {
            return Err(RuntimeError::Generation(format!(
                "embedding width {} does not match vision width {}",
                embeds.len() / ids.len().max(1),
                hidden
            )));
        }
        let mut rows = vision.rows().into_iter();
        for (i, id) in ids.iter().enumerate() {
            if *id == self.tokens.video_pad {
                let row = rows.next().ok_or_else(|| {
                    RuntimeError::Generation("more video placeholders than vision tokens".into())
                })?;
                embeds[i * hidden..(i + 1) * hidden]
                    .iter_mut()
                    .zip(row.iter())
                    .for_each(|(dst, src)| *dst = *src);
            }
        }

        let mut positions = rope_positions(&ids, self.tokens.vision_start, merged);
        let prompt_len = ids.len();
        let mut rng = StdRng::seed_from_u64(params.seed);
        debug!(
            prompt_tokens = prompt_len,
            video_tokens, "starting generation"
        );

        // TODO: feed past_key_values back into the decoder instead of
        // recomputing the full sequence each step
        for _ in 0..params.max_tokens {
            let logits = self.next_logits(&embeds, hidden, &positions)?;
            let next = sample_token(&logits, &params, &mut rng);
            if self.tokens.is_eos(next) {
                break;
            }
            ids.push(next);
            embeds.extend(self.embed_tokens(&[next])?);
            let step = positions.iter().flatten().copied().max().unwrap_or(-1) + 1;
            for axis in positions.iter_mut() {
                axis.push(step);
            }
        }

        self.tokenizer
            .decode(&ids[prompt_len..], true)
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))
    }

    fn encode_video(&self, frames: &FrameBatch) -> Result<Array2<f32>> {
        let (patches, width) = patchify(frames, self.layout)?;
        let rows = patches.len() / width;
        let pixel_values = Array2::from_shape_vec((rows, width), patches)
            .map_err(|e| RuntimeError::Generation(format!("failed to create pixel tensor: {}", e)))?;
        let grid = frames.grid_thw;
        let grid_thw = Array2::from_shape_vec((1, 3), grid.iter().map(|v| *v as i64).collect())
            .map_err(|e| RuntimeError::Generation(format!("failed to create grid tensor: {}", e)))?;

        let outputs = self
            .vision
            .run(
                ort::inputs! {
                    "pixel_values" => pixel_values,
                    "grid_thw" => grid_thw,
                }
                .map_err(|e| RuntimeError::Generation(e.to_string()))?,
            )
            .map_err(|e| RuntimeError::Generation(e.to_string()))?;
        let embeds = outputs
            .get("image_embeds")
            .ok_or_else(|| RuntimeError::Generation("no image_embeds output found".to_string()))?;
        let embeds: ndarray::ArrayViewD<f32> = embeds
            .try_extract_tensor()
            .map_err(|e| RuntimeError::Generation(e.to_string()))?;
        embeds
            .to_owned()
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| RuntimeError::Generation(format!("unexpected image_embeds shape: {}", e)))
    }

    /// Flat `[seq, hidden]` embeddings for `ids`.
    fn embed_tokens(&self, ids: &[u32]) -> Result<Vec<f32>> {
        let input_ids = Array2::from_shape_vec((1, ids.len()), ids.iter().map(|id| *id as i64).collect())
            .map_err(|e| RuntimeError::Generation(format!("failed to create input_ids tensor: {}", e)))?;
        let outputs = self
            .embed
            .run(ort::inputs! { "input_ids" => input_ids }.map_err(|e| RuntimeError::Generation(e.to_string()))?)
            .map_err(|e| RuntimeError::Generation(e.to_string()))?;
        let embeds = outputs
            .get("inputs_embeds")
            .ok_or_else(|| RuntimeError::Generation("no inputs_embeds output found".to_string()))?;
        let embeds: ndarray::ArrayViewD<f32> = embeds
            .try_extract_tensor()
            .map_err(|e| RuntimeError::Generation(e.to_string()))?;
        Ok(embeds.iter().copied().collect())
    }

    /// Logits for the token following the sequence.
    fn next_logits(&self, embeds: &[f32], hidden: usize, positions: &[Vec<i64>; 3]) -> Result<Vec<f32>> {
        let seq = positions[0].len();
        let inputs_embeds = Array3::from_shape_vec((1, seq, hidden), embeds.to_vec())
            .map_err(|e| RuntimeError::Generation(format!("failed to create embeds tensor: {}", e)))?;
        let attention_mask = Array2::<i64>::ones((1, seq));
        let position_ids = Array3::from_shape_vec(
            (3, 1, seq),
            positions.iter().flatten().copied().collect(),
        )
        .map_err(|e| RuntimeError::Generation(format!("failed to create position tensor: {}", e)))?;

        let outputs = self
            .decoder
            .run(
                ort::inputs! {
                    "inputs_embeds" => inputs_embeds,
                    "attention_mask" => attention_mask,
                    "position_ids" => position_ids,
                }
                .map_err(|e| RuntimeError::Generation(e.to_string()))?,
            )
            .map_err(|e| RuntimeError::Generation(e.to_string()))?;
        let logits = outputs
            .get("logits")
            .ok_or_else(|| RuntimeError::Generation("no logits output found".to_string()))?;
        let logits: ndarray::ArrayViewD<f32> = logits
            .try_extract_tensor()
            .map_err(|e| RuntimeError::Generation(e.to_string()))?;

        let shape = logits.shape();
        if shape.len() != 3 || shape[1] == 0 {
            return Err(RuntimeError::Generation(format!(
                "unexpected logits shape: {:?}",
                shape
            )));
        }
        Ok(logits
            .slice(ndarray::s![0, shape[1] - 1, ..])
            .iter()
            .copied()
            .collect())
    }
}

fn chat_prompt(prompt: &str, video_tokens: usize) -> String {
    format!(
        "<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n<|vision_start|>{}<|vision_end|>{}<|im_end|>\n<|im_start|>assistant\n",
        SYSTEM_PROMPT,
        "<|video_pad|>".repeat(video_tokens),
        prompt
    )
}

/// Rearrange a `[T, C, H, W]` batch into encoder patches.
///
/// Rows are ordered `(t, h/m, w/m, m, m)` so that each group of `m·m`
/// consecutive rows is one merged token; each row holds `(C, tps, p, p)`.
/// Returns the flat patches and the row width.
pub fn patchify(frames: &FrameBatch, layout: PatchLayout) -> Result<(Vec<f32>, usize)> {
    let PatchLayout {
        patch,
        merge,
        temporal,
    } = layout;
    let [grid_t, grid_h, grid_w] = frames.grid_thw;
    let (channels, height, width) = (
        frames.channels,
        frames.height as usize,
        frames.width as usize,
    );
    if grid_t * temporal != frames.frames
        || grid_h * patch != height
        || grid_w * patch != width
        || grid_h % merge != 0
        || grid_w % merge != 0
    {
        return Err(RuntimeError::InvalidInput(format!(
            "frame batch {:?} does not match grid {:?}",
            frames.shape(),
            frames.grid_thw
        )));
    }

    let row = channels * temporal * patch * patch;
    let mut out = Vec::with_capacity(frames.data.len());
    for gt in 0..grid_t {
        for bh in 0..grid_h / merge {
            for bw in 0..grid_w / merge {
                for mh in 0..merge {
                    for mw in 0..merge {
                        let y0 = (bh * merge + mh) * patch;
                        let x0 = (bw * merge + mw) * patch;
                        for c in 0..channels {
                            for tt in 0..temporal {
                                let frame = gt * temporal + tt;
                                for py in 0..patch {
                                    let start = ((frame * channels + c) * height + y0 + py) * width + x0;
                                    out.extend_from_slice(&frames.data[start..start + patch]);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok((out, row))
}

/// Multimodal rotary positions `[temporal, height, width]` per token.
///
/// Text tokens advance all three axes together. The video block starting
/// after `vision_start` gets its merged grid coordinates, offset by the
/// position the block starts at.
pub fn rope_positions(ids: &[u32], vision_start: u32, grid: [usize; 3]) -> [Vec<i64>; 3] {
    let mut axes: [Vec<i64>; 3] = [
        Vec::with_capacity(ids.len()),
        Vec::with_capacity(ids.len()),
        Vec::with_capacity(ids.len()),
    ];
    let video_len = grid.iter().product::<usize>();
    let mut next: i64 = 0;
    let mut i = 0;
    while i < ids.len() {
        for axis in axes.iter_mut() {
            axis.push(next);
        }
        next += 1;

        if ids[i] == vision_start && i + video_len < ids.len() {
            let base = next;
            let [t, h, w] = grid;
            for ti in 0..t {
                for hi in 0..h {
                    for wi in 0..w {
                        axes[0].push(base + ti as i64);
                        axes[1].push(base + hi as i64);
                        axes[2].push(base + wi as i64);
                    }
                }
            }
            next = base + t.max(h).max(w) as i64;
            i += video_len;
        }
        i += 1;
    }
    axes
}

/// Pick the next token with temperature, top-k and top-p filtering.
pub fn sample_token(logits: &[f32], params: &GenerationParams, rng: &mut StdRng) -> u32 {
    if params.is_greedy() || logits.len() < 2 {
        return argmax(logits);
    }

    let mut candidates: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, l)| (i as u32, *l / params.temperature))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    if params.top_k > 0 {
        candidates.truncate(params.top_k as usize);
    }

    let max = candidates[0].1;
    let mut probs: Vec<f32> = candidates.iter().map(|(_, l)| (l - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= sum);

    let mut cumulative = 0.0;
    let mut keep = probs.len();
    for (i, p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= params.top_p {
            keep = i + 1;
            break;
        }
    }
    let kept: f32 = probs[..keep].iter().sum();

    let mut draw = rng.gen::<f32>() * kept;
    for (i, p) in probs[..keep].iter().enumerate() {
        draw -= p;
        if draw <= 0.0 {
            return candidates[i].0;
        }
    }
    candidates[keep - 1].0
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

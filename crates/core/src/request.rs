//! Generation requests and the request-derived values used to build a
//! worker invocation (size parsing, seed selection, step resolution).

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound (inclusive) of a randomly drawn seed.
pub const MAX_RANDOM_SEED: i64 = u32::MAX as i64;

/// Step counts for the named quality tiers.
///
/// An explicit `sample_steps` on the request always wins over these.
pub const QUALITY_STEPS: &[(&str, u32)] = &[
    ("draft", 8),
    ("low", 12),
    ("standard", 20),
    ("medium", 20),
    ("high", 30),
    ("ultra", 50),
];

// ---------------------------------------------------------------------------
// Job type
// ---------------------------------------------------------------------------

/// The kind of artifact a job asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[default]
    Generate,
    Edit,
    Variation,
    Upscale,
    Video,
}

impl JobType {
    /// File extension of the artifact this job produces.
    pub fn artifact_extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            _ => "png",
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Video-specific generation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub frames: Option<u32>,
    pub fps: Option<u32>,
    pub flow_shift: Option<f64>,
    /// Optional last frame the video should converge to.
    pub end_image: Option<String>,
}

/// A single generation job as handed to the dispatcher.
///
/// Treated as immutable once submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Output dimensions as `"WxH"`, e.g. `"1024x768"`.
    pub size: Option<String>,
    pub seed: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub sampler: Option<String>,
    pub sample_steps: Option<u32>,
    /// Named quality tier, see [`QUALITY_STEPS`].
    pub quality: Option<String>,
    pub clip_skip: Option<u32>,
    pub source_image: Option<String>,
    /// Inpainting mask, used by variation and edit jobs.
    pub mask_image: Option<String>,
    /// Denoising strength for variations.
    pub strength: Option<f64>,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default)]
    pub video: VideoParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Step count to pass to the worker, if any.
    ///
    /// Explicit steps take precedence over the quality tier; an unknown
    /// tier leaves the flag unset.
    pub fn resolved_steps(&self) -> Option<u32> {
        self.sample_steps
            .or_else(|| self.quality.as_deref().and_then(steps_for_quality))
    }

    /// The caller's seed, or a fresh one drawn uniformly from
    /// `0..=MAX_RANDOM_SEED`.
    pub fn resolved_seed(&self) -> i64 {
        self.seed
            .unwrap_or_else(|| rand::rng().random_range(0..=MAX_RANDOM_SEED))
    }

    /// Parsed output dimensions, if a size was given.
    pub fn dimensions(&self) -> Result<Option<(u32, u32)>, CoreError> {
        self.size.as_deref().map(parse_size).transpose()
    }
}

/// Look up the step count of a quality tier (case-insensitive).
pub fn steps_for_quality(tier: &str) -> Option<u32> {
    let tier = tier.trim().to_ascii_lowercase();
    QUALITY_STEPS
        .iter()
        .find(|(name, _)| *name == tier)
        .map(|(_, steps)| *steps)
}

/// Parse a `"WxH"` size string into `(width, height)`.
pub fn parse_size(size: &str) -> Result<(u32, u32), CoreError> {
    let invalid = || CoreError::Validation(format!("Invalid size '{size}'. Expected WxH"));

    let (w, h) = size
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(invalid)?;
    let width: u32 = w.trim().parse().map_err(|_| invalid())?;
    let height: u32 = h.trim().parse().map_err(|_| invalid())?;

    if width == 0 || height == 0 {
        return Err(CoreError::Validation(format!(
            "Size '{size}' must have non-zero width and height"
        )));
    }
    Ok((width, height))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

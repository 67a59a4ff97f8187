//! Command-line assembly for one-shot invocations.
//!
//! Flag order is fixed: base arguments, prompt text, dimensions, seed,
//! guidance, sampler, steps, CLIP skip, job-type flags, and finally
//! `--output`. Given the same configuration, request, seed and output path
//! the result is identical.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_core::request::{GenerationRequest, JobType};
use kiln_core::worker::WorkerConfig;

use crate::error::ExecError;

/// A resolved one-shot command, discarded after its output is parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Where the worker is asked to write its artifact.
    pub output_path: PathBuf,
    /// Images the request hands to the worker. Never taken as the artifact.
    pub input_paths: Vec<PathBuf>,
}

/// The request's input images, resolved against `working_dir`.
pub fn input_paths(request: &GenerationRequest, working_dir: &Path) -> Vec<PathBuf> {
    [
        request.source_image.as_deref(),
        request.mask_image.as_deref(),
        request.video.end_image.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|p| !p.is_empty())
    .map(|p| working_dir.join(p))
    .collect()
}

/// Resolve the program path. Relative paths with a directory component are
/// taken relative to `project_root`; bare names are left for `PATH` lookup.
pub fn resolve_program(command: &str, project_root: &Path) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && path.components().count() > 1 {
        project_root.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Build the full argument vector for `request` against `config`.
pub fn build_args(
    config: &WorkerConfig,
    request: &GenerationRequest,
    seed: i64,
    output_path: &Path,
) -> Result<Vec<String>, ExecError> {
    if request.prompt.trim().is_empty() {
        return Err(ExecError::InvalidRequest("prompt must not be empty".into()));
    }

    let mut args = config.args.clone();

    push_flag(&mut args, "--prompt", &request.prompt);
    if let Some(negative) = request.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
        push_flag(&mut args, "--negative-prompt", negative);
    }

    if let Some((width, height)) = request.dimensions()? {
        push_flag(&mut args, "--width", width);
        push_flag(&mut args, "--height", height);
    }

    push_flag(&mut args, "--seed", seed);

    if let Some(cfg_scale) = request.cfg_scale {
        push_flag(&mut args, "--cfg-scale", cfg_scale);
    }
    if let Some(sampler) = request.sampler.as_deref() {
        push_flag(&mut args, "--sampling-method", sampler);
    }
    if let Some(steps) = request.resolved_steps() {
        push_flag(&mut args, "--steps", steps);
    }
    if let Some(clip_skip) = request.clip_skip {
        push_flag(&mut args, "--clip-skip", clip_skip);
    }

    push_job_type_flags(&mut args, request)?;

    push_flag(&mut args, "--output", output_path.display());
    Ok(args)
}

fn push_job_type_flags(args: &mut Vec<String>, request: &GenerationRequest) -> Result<(), ExecError> {
    match request.job_type {
        JobType::Generate => {}
        JobType::Variation => {
            push_flag(args, "--init-img", require_source(request)?);
            if let Some(strength) = request.strength {
                push_flag(args, "--strength", strength);
            }
            if let Some(mask) = request.mask_image.as_deref() {
                push_flag(args, "--mask", mask);
            }
        }
        JobType::Edit => {
            push_flag(args, "--ref-image", require_source(request)?);
            if let Some(mask) = request.mask_image.as_deref() {
                push_flag(args, "--mask", mask);
            }
        }
        JobType::Upscale => {
            push_flag(args, "--init-img", require_source(request)?);
        }
        JobType::Video => {
            let video = &request.video;
            if let Some(frames) = video.frames {
                push_flag(args, "--video-frames", frames);
            }
            if let Some(fps) = video.fps {
                push_flag(args, "--fps", fps);
            }
            if let Some(flow_shift) = video.flow_shift {
                push_flag(args, "--flow-shift", flow_shift);
            }
            if let Some(end_image) = video.end_image.as_deref() {
                push_flag(args, "--end-img", end_image);
            }
        }
    }
    Ok(())
}

fn require_source(request: &GenerationRequest) -> Result<&str, ExecError> {
    request
        .source_image
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ExecError::InvalidRequest(format!(
                "{:?} jobs require a source image",
                request.job_type
            ))
        })
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: impl std::fmt::Display) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

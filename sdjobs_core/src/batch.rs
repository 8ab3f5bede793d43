//! Repeated generation of a single prompt to numbered files.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use image::DynamicImage;
use tracing::info;

use crate::{DiffusionGenerationParams, Pipeline};

/// Number of images generated per batch when none is given.
pub const DEFAULT_IMAGE_COUNT: usize = 96;
/// File name prefix used when none is given.
pub const DEFAULT_FILE_PREFIX: &str = "out";

/// Anything that turns a prompt into one image.
pub trait ImageGenerator {
    fn generate(&self, prompt: &str, params: &DiffusionGenerationParams) -> Result<DynamicImage>;
}

impl ImageGenerator for Pipeline {
    fn generate(&self, prompt: &str, params: &DiffusionGenerationParams) -> Result<DynamicImage> {
        self.forward(vec![prompt.to_string()], params.clone())?
            .into_iter()
            .next()
            .context("pipeline returned no image")
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub prompt: String,
    pub count: usize,
    pub params: DiffusionGenerationParams,
    pub output_dir: PathBuf,
    pub file_prefix: String,
}

impl BatchRequest {
    /// A request for [`DEFAULT_IMAGE_COUNT`] images named `out{i}.png` in `output_dir`.
    pub fn new<S: ToString, P: Into<PathBuf>>(
        prompt: S,
        params: DiffusionGenerationParams,
        output_dir: P,
    ) -> Self {
        Self {
            prompt: prompt.to_string(),
            count: DEFAULT_IMAGE_COUNT,
            params,
            output_dir: output_dir.into(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
        }
    }
}

pub fn output_path(dir: &Path, prefix: &str, index: usize) -> PathBuf {
    dir.join(format!("{prefix}{index}.png"))
}

/// Generation parameters for image `index` of a batch. A seeded batch uses `seed + index` so
/// every image gets its own initial noise while the whole batch stays reproducible.
pub fn image_params(
    params: &DiffusionGenerationParams,
    index: usize,
) -> DiffusionGenerationParams {
    DiffusionGenerationParams {
        seed: params.seed.map(|seed| seed.wrapping_add(index as u64)),
        ..params.clone()
    }
}

/// Generate `request.count` images one after another, saving each before starting the next.
///
/// Stops at the first failure. Returns the written paths in order.
pub fn run_batch<G: ImageGenerator + ?Sized>(
    generator: &G,
    request: &BatchRequest,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(&request.output_dir).with_context(|| {
        format!(
            "could not create output directory {}",
            request.output_dir.display()
        )
    })?;

    let mut written = Vec::with_capacity(request.count);
    for i in 0..request.count {
        info!("Generating {i}");
        let start = Instant::now();

        let image = request
            .params
            .validate()
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                generator.generate(&request.prompt, &image_params(&request.params, i))
            })
            .with_context(|| format!("generating image {i}"))?;

        let path = output_path(&request.output_dir, &request.file_prefix, i);
        image
            .save(&path)
            .with_context(|| format!("saving image {i} to {}", path.display()))?;

        info!(
            "saved {} in {:.2}s",
            path.display(),
            start.elapsed().as_secs_f32()
        );
        written.push(path);
    }
    Ok(written)
}

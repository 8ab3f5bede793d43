use cliclack::input;
use std::{path::PathBuf, time::Instant};

use clap::Parser;
use sdjobs_core::{
    run_batch, BatchRequest, DiffusionGenerationParams, ModelDType, ModelSource, Pipeline,
    TokenSource, DEFAULT_FILE_PREFIX, DEFAULT_GUIDANCE_SCALE, DEFAULT_IMAGE_COUNT,
    DEFAULT_NUM_STEPS,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Generate a numbered series of images from one prompt")]
struct Args {
    /// Model ID: a Hugging Face model ID or a local path in diffusers layout.
    model_id: String,

    /// Prompt to use. Asked for interactively if not given.
    prompt: Option<String>,

    /// Number of images to generate.
    #[arg(short, long, default_value_t = DEFAULT_IMAGE_COUNT)]
    count: usize,

    /// Number of denoising steps. A higher number of steps often means higher quality.
    #[arg(short, long, default_value_t = DEFAULT_NUM_STEPS)]
    num_steps: usize,

    /// Guidance scale to use. Values <= 1.0 disable classifier-free guidance.
    #[arg(short, long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    scale: f64,

    /// Image height. Defaults to the native resolution of the model.
    #[arg(long)]
    height: Option<usize>,

    /// Image width. Defaults to the native resolution of the model.
    #[arg(long)]
    width: Option<usize>,

    /// Seed for the initial noise. Image `i` of the batch uses `seed + i`.
    #[arg(long)]
    seed: Option<u64>,

    /// Directory to write images to.
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// File name prefix, images are written as `{prefix}{i}.png`.
    #[arg(long, default_value = DEFAULT_FILE_PREFIX)]
    prefix: String,

    /// Model dtype.
    #[arg(long, default_value_t = ModelDType::Auto)]
    dtype: ModelDType,

    /// Hugging Face token source: `literal:<token>`, `env[:<var>]`, `path:<file>`, `cache` or `none`.
    /// By default, the Hugging Face token at ~/.cache/huggingface/token is used.
    #[arg(long, default_value_t = TokenSource::CacheToken)]
    token: TokenSource,

    /// Model revision on the Hugging Face hub.
    #[arg(long)]
    revision: Option<String>,

    /// Do not show loading progress.
    #[arg(long)]
    silent: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let prompt = match args.prompt {
        Some(prompt) if !prompt.is_empty() => prompt,
        _ => input("Prompt:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Prompt is required!")
                } else {
                    Ok(())
                }
            })
            .interact()?,
    };

    let pipeline = Pipeline::load(
        ModelSource::from_model_id(&args.model_id),
        args.silent,
        args.token,
        args.revision,
        &args.dtype,
    )?;

    let (native_height, native_width) = pipeline.default_resolution();
    let params = DiffusionGenerationParams {
        height: args.height.unwrap_or(native_height),
        width: args.width.unwrap_or(native_width),
        num_steps: args.num_steps,
        guidance_scale: args.scale,
        seed: args.seed,
    };
    params.validate()?;

    let request = BatchRequest {
        prompt,
        count: args.count,
        params,
        output_dir: args.output_dir,
        file_prefix: args.prefix,
    };

    let start = Instant::now();
    let written = run_batch(&pipeline, &request)?;
    let elapsed = start.elapsed().as_secs_f32();

    #[allow(clippy::cast_precision_loss)]
    let per_image = if written.is_empty() {
        0.
    } else {
        elapsed / written.len() as f32
    };
    info!(
        "Generated {} images in {elapsed:.2}s ({per_image:.2}s per image).",
        written.len()
    );

    Ok(())
}

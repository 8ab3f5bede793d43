use std::time::Instant;

use sdjobs_core::{DiffusionGenerationParams, ModelDType, ModelSource, Pipeline, TokenSource};

use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
enum Which {
    #[value(name = "v1-5")]
    V1_5,
    #[value(name = "v2-1")]
    V2_1,
}

#[derive(Parser)]
struct Args {
    /// Which model to use
    #[arg(long, default_value = "v1-5")]
    which: Which,

    /// Prompt to use
    #[arg(short, long)]
    prompt: String,

    /// Number of images to generate together
    #[arg(short, long, default_value_t = 1)]
    batch: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let model_id = match args.which {
        Which::V1_5 => "runwayml/stable-diffusion-v1-5",
        Which::V2_1 => "stabilityai/stable-diffusion-2-1",
    };

    let pipeline = Pipeline::load(
        ModelSource::from_model_id(model_id),
        false,
        TokenSource::CacheToken,
        None,
        &ModelDType::Auto,
    )?;
    let (height, width) = pipeline.default_resolution();

    let start = Instant::now();

    let images = pipeline.forward(
        vec![args.prompt; args.batch],
        DiffusionGenerationParams::with_size(height, width),
    )?;

    let end = Instant::now();
    println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());

    for (i, image) in images.iter().enumerate() {
        image.save(format!("image{i}.png"))?;
    }

    Ok(())
}

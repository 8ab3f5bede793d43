//! Core crate for generating images with Stable Diffusion.
//!
//! The API is intentionally straightforward: load a [`Pipeline`], then either call it directly or
//! hand it to [`run_batch`] to write a numbered series of images.
//!
//! ```rust,no_run
//! use sdjobs_core::{
//!     run_batch, BatchRequest, DiffusionGenerationParams, ModelDType, ModelSource, Pipeline,
//!     TokenSource,
//! };
//!
//! let pipeline = Pipeline::load(
//!     ModelSource::from_model_id("runwayml/stable-diffusion-v1-5"),
//!     false,
//!     TokenSource::CacheToken,
//!     None,
//!     &ModelDType::Auto,
//! )?;
//!
//! let (height, width) = pipeline.default_resolution();
//! let mut request = BatchRequest::new(
//!     "A watercolor painting of a lighthouse at dawn.",
//!     DiffusionGenerationParams::with_size(height, width),
//!     "images",
//! );
//! request.count = 4;
//!
//! for path in run_batch(&pipeline, &request)? {
//!     println!("wrote {}", path.display());
//! }
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod batch;
mod pipelines;
mod util;

pub use batch::{
    image_params, output_path, run_batch, BatchRequest, ImageGenerator, DEFAULT_FILE_PREFIX,
    DEFAULT_IMAGE_COUNT,
};
pub use pipelines::{
    DiffusionGenerationParams, InvalidParams, Pipeline, DEFAULT_GUIDANCE_SCALE, DEFAULT_NUM_STEPS,
};
pub use sdjobs_common::{ModelSource, TokenSource};
pub use util::{ModelDType, TryIntoDType};

mod stable_diffusion;

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};
use serde::Deserialize;
use stable_diffusion::StableDiffusionLoader;
use thiserror::Error;

use sdjobs_common::{FileData, FileLoader, ModelSource, NiceProgressBar, TokenSource};
use tracing::info;

use crate::TryIntoDType;

/// Number of denoising steps used when none is given.
pub const DEFAULT_NUM_STEPS: usize = 25;
/// Guidance scale used when none is given.
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// Generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionGenerationParams {
    pub height: usize,
    pub width: usize,
    /// The number of denoising steps. More denoising steps usually lead to a higher quality image at the
    /// expense of slower inference but depends on the model being used.
    pub num_steps: usize,
    /// Higher guidance scale encourages to generate images that are closely linked to the text `prompt`,
    /// usually at the expense of lower image quality. Guidance is disabled for values <= 1.0.
    pub guidance_scale: f64,
    /// Seed for the initial latents. Not every device supports seeding.
    pub seed: Option<u64>,
}

impl DiffusionGenerationParams {
    /// Parameters for a given resolution with the default step count and guidance scale.
    pub fn with_size(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            num_steps: DEFAULT_NUM_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidParams> {
        if self.num_steps == 0 {
            return Err(InvalidParams::ZeroSteps);
        }
        for (name, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % 8 != 0 {
                return Err(InvalidParams::Size { name, value });
            }
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0. {
            return Err(InvalidParams::GuidanceScale(self.guidance_scale));
        }
        Ok(())
    }

    pub(crate) fn use_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidParams {
    #[error("the number of denoising steps must be nonzero")]
    ZeroSteps,
    #[error("{name} must be a nonzero multiple of 8, got {value}")]
    Size { name: &'static str, value: usize },
    #[error("guidance scale must be finite and non-negative, got {0}")]
    GuidanceScale(f64),
}

#[derive(Debug)]
pub(crate) enum ComponentElem {
    Model {
        safetensors: HashMap<String, FileData>,
        config: FileData,
    },
    Config {
        files: HashMap<String, FileData>,
    },
    Other {
        files: HashMap<String, FileData>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentName {
    Scheduler,
    TextEncoder,
    Tokenizer,
    Unet,
    Vae,
}

impl Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler => write!(f, "scheduler"),
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Tokenizer => write!(f, "tokenizer"),
            Self::Unet => write!(f, "unet"),
            Self::Vae => write!(f, "vae"),
        }
    }
}

pub(crate) trait Loader {
    fn name(&self) -> &'static str;
    fn required_component_names(&self) -> Vec<ComponentName>;
    fn load_from_components(
        &self,
        components: HashMap<ComponentName, ComponentElem>,
        device: &Device,
        dtype: DType,
        silent: bool,
        token: TokenSource,
    ) -> Result<Arc<Mutex<dyn ModelPipeline>>>;
}

pub trait ModelPipeline: Send + Sync {
    fn forward(
        &mut self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
    ) -> candle_core::Result<Tensor>;

    /// Native (height, width) of the model.
    fn default_resolution(&self) -> (usize, usize);
}

#[derive(Clone, Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    name: String,
}

/// Keep only the preferred weights of a component: full precision files first, then fp16 ones.
fn preferred_weight_files(files: &[String]) -> Vec<String> {
    let candidates = files
        .iter()
        .filter(|f| f.ends_with(".safetensors"))
        .collect::<Vec<_>>();
    let stem = |f: &str| {
        let file_name = f.rsplit('/').next().unwrap_or(f);
        file_name
            .strip_suffix(".safetensors")
            .unwrap_or(file_name)
            .to_string()
    };
    let plain = candidates
        .iter()
        .filter(|f| !stem(f.as_str()).contains('.'))
        .map(|f| f.to_string())
        .collect::<Vec<_>>();
    if !plain.is_empty() {
        return plain;
    }
    let fp16 = candidates
        .iter()
        .filter(|f| stem(f.as_str()).ends_with(".fp16"))
        .map(|f| f.to_string())
        .collect::<Vec<_>>();
    if !fp16.is_empty() {
        return fp16;
    }
    candidates.into_iter().cloned().collect()
}

/// Classify the files of one component.
///
/// 1) Model: models contain .safetensors and potentially a config.json
/// 2) Config: general config, all files end with .json
/// 3) Other: doesn't have safetensors and is not all json
fn classify_component(
    loader: &FileLoader,
    dir: &str,
    files_for_component: &[String],
) -> Result<ComponentElem> {
    if files_for_component
        .iter()
        .any(|file| file.ends_with(".safetensors"))
    {
        let mut safetensors = HashMap::new();
        for file in preferred_weight_files(files_for_component) {
            let data = loader.read_file(&file)?;
            safetensors.insert(file, data);
        }
        Ok(ComponentElem::Model {
            safetensors,
            config: loader.read_file(&format!("{dir}config.json"))?,
        })
    } else if files_for_component
        .iter()
        .all(|file| file.ends_with(".json"))
    {
        let mut files = HashMap::new();
        for file in files_for_component {
            files.insert(file.clone(), loader.read_file(file)?);
        }
        Ok(ComponentElem::Config { files })
    } else {
        let mut files = HashMap::new();
        for file in files_for_component {
            files.insert(file.clone(), loader.read_file(file)?);
        }
        Ok(ComponentElem::Other { files })
    }
}

/// Represents the model and provides methods to load and interact with it.
pub struct Pipeline {
    model: Arc<Mutex<dyn ModelPipeline>>,
}

impl Pipeline {
    /// Load the model.
    ///
    /// Note:
    /// - `token` and `revision` are only applicable for Hugging Face models.
    pub fn load(
        source: ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
        dtype: &dyn TryIntoDType,
    ) -> Result<Self> {
        info!("loading from source: {source}.");

        let mut components = HashMap::new();
        let model_loader = {
            let loader = FileLoader::from_model_source(&source, silent, token.clone(), revision)?;
            let files = loader.list_files()?;

            if !files.contains(&"model_index.json".to_string()) {
                anyhow::bail!("Expected `model_index.json` file present.");
            }

            let ModelIndex { name } =
                serde_json::from_str(&loader.read_file("model_index.json")?.read_to_string()?)?;

            let model_loader: Box<dyn Loader> = match name.as_str() {
                "StableDiffusionPipeline" => Box::new(StableDiffusionLoader),
                other => anyhow::bail!("Unexpected loader type `{other:?}`."),
            };

            info!("model architecture is: {}", model_loader.name());

            for component in NiceProgressBar::<_, 'g'>(
                model_loader.required_component_names().into_iter(),
                "Loading components",
            )
            .with_silent(silent)
            {
                let dir = format!("{component}/");
                let files_for_component = files
                    .iter()
                    .filter(|file| file.starts_with(&dir))
                    .filter(|file| !file.ends_with('/'))
                    .cloned()
                    .collect::<Vec<_>>();
                if files_for_component.is_empty() {
                    anyhow::bail!("Component `{component}` has no files.");
                }

                let component_elem = classify_component(&loader, &dir, &files_for_component)?;
                components.insert(component, component_elem);
            }

            model_loader
        };

        #[cfg(not(feature = "metal"))]
        let device = Device::cuda_if_available(0)?;
        #[cfg(feature = "metal")]
        let device = Device::new_metal(0)?;

        let dtype = dtype.try_into_dtype(&[&device], silent)?;

        let model =
            model_loader.load_from_components(components, &device, dtype, silent, token)?;

        Ok(Self { model })
    }

    /// Native (height, width) of the loaded model.
    pub fn default_resolution(&self) -> (usize, usize) {
        match self.model.lock() {
            Ok(model) => model.default_resolution(),
            Err(poisoned) => poisoned.into_inner().default_resolution(),
        }
    }

    /// Generate images based on prompts and generation parameters.
    ///
    /// If multiple prompts are specified, they are run together as a batch.
    pub fn forward(
        &self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
    ) -> anyhow::Result<Vec<DynamicImage>> {
        params.validate()?;
        if prompts.is_empty() {
            anyhow::bail!("At least one prompt is required.");
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::Error::msg("Could not lock model!"))?;
        #[cfg(feature = "metal")]
        let img = objc::rc::autoreleasepool(|| model.forward(prompts, params))?;
        #[cfg(not(feature = "metal"))]
        let img = model.forward(prompts, params)?;

        tensor_to_images(&img)
    }
}

/// Convert a `(b, 3, h, w)` u8 tensor into RGB images.
pub(crate) fn tensor_to_images(img: &Tensor) -> Result<Vec<DynamicImage>> {
    let (_b, c, h, w) = img.dims4()?;
    if c != 3 {
        anyhow::bail!("Expected 3 channels in image output");
    }
    let mut images = Vec::new();
    for b_img in img.chunk(img.dim(0)?, 0)? {
        let flattened = b_img.squeeze(0)?.permute((1, 2, 0))?.flatten_all()?;
        #[allow(clippy::cast_possible_truncation)]
        images.push(DynamicImage::ImageRgb8(
            RgbImage::from_raw(w as u32, h as u32, flattened.to_vec1::<u8>()?)
                .ok_or(anyhow::Error::msg("RgbImage has invalid capacity."))?,
        ));
    }
    Ok(images)
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    build_clip_transformer, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use sdjobs_common::{FileData, FileLoader, IterWithProgress, ModelSource, TokenSource};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use super::{ComponentElem, ComponentName, DiffusionGenerationParams, Loader, ModelPipeline};

mod version;

use version::{
    pad_tokens, SchedulerConfigShim, StableDiffusionVersion, UnetConfigShim, VAE_SCALE,
};

pub struct StableDiffusionLoader;

fn single_weights(
    component: &ComponentName,
    safetensors: HashMap<String, FileData>,
) -> Result<FileData> {
    let mut weights = safetensors.into_values().collect::<Vec<_>>();
    match weights.len() {
        1 => Ok(weights.remove(0)),
        0 => anyhow::bail!("no weights found for {component}"),
        n => anyhow::bail!("expected a single weights file for {component}, found {n}"),
    }
}

impl StableDiffusionLoader {
    fn load_tokenizer(
        component: ComponentElem,
        version: StableDiffusionVersion,
        silent: bool,
        token: TokenSource,
    ) -> Result<Tokenizer> {
        let local = match component {
            ComponentElem::Other { mut files } | ComponentElem::Config { mut files } => {
                files.remove("tokenizer/tokenizer.json")
            }
            ComponentElem::Model { .. } => anyhow::bail!("incorrect storage of clip tokenizer"),
        };
        let file = match local {
            Some(file) => file,
            None => {
                let repo = version.reference_tokenizer_repo();
                if !silent {
                    info!("no `tokenizer.json` in the model, using the tokenizer from {repo}");
                }
                FileLoader::from_model_source(
                    &ModelSource::ModelId(repo.to_string()),
                    silent,
                    token,
                    None,
                )?
                .read_file("tokenizer.json")?
            }
        };
        Tokenizer::from_file(file.path()).map_err(anyhow::Error::msg)
    }
}

impl Loader for StableDiffusionLoader {
    fn name(&self) -> &'static str {
        "stable-diffusion"
    }

    fn required_component_names(&self) -> Vec<ComponentName> {
        vec![
            ComponentName::Scheduler,
            ComponentName::TextEncoder,
            ComponentName::Tokenizer,
            ComponentName::Unet,
            ComponentName::Vae,
        ]
    }

    fn load_from_components(
        &self,
        mut components: HashMap<ComponentName, ComponentElem>,
        device: &Device,
        dtype: DType,
        silent: bool,
        token: TokenSource,
    ) -> Result<Arc<Mutex<dyn ModelPipeline>>> {
        let mut take = |name: ComponentName| {
            components
                .remove(&name)
                .ok_or_else(|| anyhow::Error::msg(format!("missing component {name}")))
        };
        let scheduler = take(ComponentName::Scheduler)?;
        let clip_component = take(ComponentName::TextEncoder)?;
        let tok_component = take(ComponentName::Tokenizer)?;
        let unet_component = take(ComponentName::Unet)?;
        let vae_component = take(ComponentName::Vae)?;

        let scheduler_config = if let ComponentElem::Config { files } = scheduler {
            let file = files
                .get("scheduler/scheduler_config.json")
                .ok_or_else(|| anyhow::Error::msg("missing scheduler/scheduler_config.json"))?;
            serde_json::from_str::<SchedulerConfigShim>(&file.read_to_string()?)?
        } else {
            anyhow::bail!("expected scheduler config")
        };

        let ComponentElem::Model {
            safetensors: unet_weights,
            config: unet_config,
        } = unet_component
        else {
            anyhow::bail!("incorrect storage of unet model")
        };
        let unet_config: UnetConfigShim = serde_json::from_str(&unet_config.read_to_string()?)?;

        let version = StableDiffusionVersion::detect(&unet_config, &scheduler_config)?;
        let sd_config = version.config(None, None);
        let native_resolution = match unet_config.sample_size {
            Some(size) => (size * 8, size * 8),
            None => (sd_config.height, sd_config.width),
        };
        if !silent {
            info!(
                "detected {version:?} (scheduler config {}), native resolution {}x{}",
                scheduler_config.name, native_resolution.1, native_resolution.0
            );
        }

        let tokenizer = Self::load_tokenizer(tok_component, version, silent, token)?;
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or("<|endoftext|>".to_string());
        let pad_id = tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .copied()
            .ok_or_else(|| anyhow::Error::msg(format!("pad token `{pad_token}` not in vocab")))?;

        if !silent {
            info!("loading CLIP model");
        }
        let text_model = if let ComponentElem::Model {
            safetensors,
            config: _,
        } = clip_component
        {
            let weights = single_weights(&ComponentName::TextEncoder, safetensors)?;
            build_clip_transformer(&sd_config.clip, weights.path(), device, DType::F32)?
        } else {
            anyhow::bail!("incorrect storage of clip model")
        };

        if !silent {
            info!("loading VAE model");
        }
        let vae = if let ComponentElem::Model {
            safetensors,
            config: _,
        } = vae_component
        {
            let weights = single_weights(&ComponentName::Vae, safetensors)?;
            sd_config.build_vae(weights.path(), device, dtype)?
        } else {
            anyhow::bail!("incorrect storage of vae model")
        };

        if !silent {
            info!("loading UNet model");
        }
        let unet = {
            let weights = single_weights(&ComponentName::Unet, unet_weights)?;
            sd_config.build_unet(
                weights.path(),
                device,
                unet_config.in_channels,
                false,
                dtype,
            )?
        };

        let pipeline = StableDiffusionPipeline {
            version,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            text_model,
            unet,
            vae,
            native_resolution,
            device: device.clone(),
            dtype,
            silent,
        };

        Ok(Arc::new(Mutex::new(pipeline)))
    }
}

pub struct StableDiffusionPipeline {
    version: StableDiffusionVersion,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    native_resolution: (usize, usize),
    device: Device,
    dtype: DType,
    silent: bool,
}

impl StableDiffusionPipeline {
    /// Encode prompts into `(b, max_tokens, hidden)` text embeddings.
    fn encode_prompts(&self, prompts: &[String]) -> candle_core::Result<Tensor> {
        let mut rows = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let tokens = self
                .tokenizer
                .encode(prompt.as_str(), true)
                .map_err(|e| candle_core::Error::Msg(e.to_string()))?
                .get_ids()
                .to_vec();
            let tokens = pad_tokens(tokens, self.max_tokens, self.pad_id)?;
            rows.push(Tensor::new(tokens.as_slice(), &self.device)?);
        }
        let tokens = Tensor::stack(&rows, 0)?;
        self.text_model.forward(&tokens)
    }
}

impl ModelPipeline for StableDiffusionPipeline {
    fn forward(
        &mut self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
    ) -> candle_core::Result<Tensor> {
        let bs = prompts.len();
        let use_guidance = params.use_guidance();

        let cond = self.encode_prompts(&prompts)?;
        let text_embeddings = if use_guidance {
            let uncond = self.encode_prompts(&vec![String::new(); bs])?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;

        let sd_config = self
            .version
            .config(Some(params.height), Some(params.width));
        let mut scheduler = sd_config.build_scheduler(params.num_steps)?;

        if let Some(seed) = params.seed {
            if let Err(e) = self.device.set_seed(seed) {
                warn!("could not seed the device, continuing unseeded: {e}");
            }
        }

        let latents = Tensor::randn(
            0f32,
            1f32,
            (bs, 4, params.height / 8, params.width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for timestep in timesteps.into_iter().with_progress(self.silent) {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            #[allow(clippy::cast_precision_loss)]
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let img = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let img = ((img / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        (img.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)
    }

    fn default_resolution(&self) -> (usize, usize) {
        self.native_resolution
    }
}

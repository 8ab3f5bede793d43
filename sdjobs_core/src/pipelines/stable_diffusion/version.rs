use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use serde::Deserialize;

/// Scaling applied to latents before the VAE decoder.
pub(crate) const VAE_SCALE: f64 = 0.18215;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct UnetConfigShim {
    pub(crate) cross_attention_dim: usize,
    pub(crate) in_channels: usize,
    pub(crate) sample_size: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct SchedulerConfigShim {
    #[serde(rename = "_class_name")]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) prediction_type: Option<String>,
}

impl StableDiffusionVersion {
    pub(crate) fn detect(
        unet: &UnetConfigShim,
        scheduler: &SchedulerConfigShim,
    ) -> anyhow::Result<Self> {
        let prediction = scheduler.prediction_type.as_deref().unwrap_or("epsilon");
        match (unet.cross_attention_dim, prediction) {
            (768, "epsilon") => Ok(Self::V1_5),
            (1024, "v_prediction") => Ok(Self::V2_1),
            (dim, prediction) => anyhow::bail!(
                "Unsupported Stable Diffusion variant (cross attention dim {dim}, prediction type `{prediction}`)."
            ),
        }
    }

    pub(crate) fn config(
        &self,
        height: Option<usize>,
        width: Option<usize>,
    ) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, height, width),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, height, width),
        }
    }

    /// Repository holding a `tokenizer.json` compatible with this version's text encoder.
    pub(crate) fn reference_tokenizer_repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "openai/clip-vit-base-patch32",
            Self::V2_1 => "laion/CLIP-ViT-H-14-laion2B-s32B-b79K",
        }
    }
}

/// Pad token ids to `max_len` with `pad_id`.
pub(crate) fn pad_tokens(
    mut tokens: Vec<u32>,
    max_len: usize,
    pad_id: u32,
) -> candle_core::Result<Vec<u32>> {
    if tokens.len() > max_len {
        return Err(candle_core::Error::Msg(format!(
            "prompt is too long: {} tokens, the text encoder accepts at most {max_len}",
            tokens.len()
        )));
    }
    tokens.resize(max_len, pad_id);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unet(dim: usize) -> UnetConfigShim {
        UnetConfigShim {
            cross_attention_dim: dim,
            in_channels: 4,
            sample_size: Some(64),
        }
    }

    fn scheduler(prediction: Option<&str>) -> SchedulerConfigShim {
        SchedulerConfigShim {
            name: "PNDMScheduler".to_string(),
            prediction_type: prediction.map(str::to_string),
        }
    }

    #[test]
    fn detects_versions() -> anyhow::Result<()> {
        assert_eq!(
            StableDiffusionVersion::detect(&unet(768), &scheduler(None))?,
            StableDiffusionVersion::V1_5
        );
        assert_eq!(
            StableDiffusionVersion::detect(&unet(768), &scheduler(Some("epsilon")))?,
            StableDiffusionVersion::V1_5
        );
        assert_eq!(
            StableDiffusionVersion::detect(&unet(1024), &scheduler(Some("v_prediction")))?,
            StableDiffusionVersion::V2_1
        );
        assert!(StableDiffusionVersion::detect(&unet(1024), &scheduler(None)).is_err());
        assert!(StableDiffusionVersion::detect(&unet(2048), &scheduler(None)).is_err());
        Ok(())
    }

    #[test]
    fn parses_diffusers_configs() -> anyhow::Result<()> {
        let unet: UnetConfigShim = serde_json::from_str(
            r#"{"_class_name": "UNet2DConditionModel", "cross_attention_dim": 768, "in_channels": 4, "sample_size": 64, "out_channels": 4}"#,
        )?;
        assert_eq!(unet.sample_size, Some(64));
        let scheduler: SchedulerConfigShim = serde_json::from_str(
            r#"{"_class_name": "PNDMScheduler", "beta_end": 0.012, "num_train_timesteps": 1000}"#,
        )?;
        assert_eq!(scheduler.name, "PNDMScheduler");
        assert_eq!(scheduler.prediction_type, None);
        Ok(())
    }

    #[test]
    fn native_resolutions() {
        let cfg = StableDiffusionVersion::V1_5.config(None, None);
        assert_eq!((cfg.height, cfg.width), (512, 512));
        let cfg = StableDiffusionVersion::V2_1.config(None, None);
        assert_eq!((cfg.height, cfg.width), (768, 768));
        assert_eq!(cfg.clip.max_position_embeddings, 77);
    }

    #[test]
    fn pads_and_rejects_long_prompts() -> anyhow::Result<()> {
        assert_eq!(pad_tokens(vec![1, 2], 4, 9)?, vec![1, 2, 9, 9]);
        assert_eq!(pad_tokens(vec![1, 2, 3, 4], 4, 9)?, vec![1, 2, 3, 4]);
        assert!(pad_tokens(vec![0; 5], 4, 9).is_err());
        Ok(())
    }
}

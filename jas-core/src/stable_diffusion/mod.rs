use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::{
    tensor_to_image, Capability, DeviceMap, GenerationRequest, Loader, ModelLike, ModelVariant,
    DEFAULT_GUIDANCE_SCALE, DEFAULT_STEPS,
};

pub const DEFAULT_REPO: &str = "runwayml/stable-diffusion-v1-5";
pub const DEFAULT_SIZE: usize = 512;

// Latent scaling factor shared by the SD 1.x and 2.x autoencoders.
const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    V2_1,
}

impl SdVersion {
    fn config(self, height: usize, width: usize) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, Some(height), Some(width)),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, Some(height), Some(width)),
        }
    }

    fn tokenizer_repo(self) -> &'static str {
        match self {
            Self::V1_5 => "openai/clip-vit-base-patch32",
            Self::V2_1 => "laion/CLIP-ViT-H-14-laion2B-s32B-b79K",
        }
    }

    fn default_size(self) -> usize {
        match self {
            Self::V1_5 => DEFAULT_SIZE,
            Self::V2_1 => 768,
        }
    }
}

pub struct StableDiffusionModel {
    version: SdVersion,
    capability: Capability,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    clip_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    fn encode_prompt(&self, text: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            tracing::warn!(
                tokens = tokens.len(),
                max = self.max_tokens,
                "prompt is longer than the text encoder window, truncating"
            );
            tokens.truncate(self.max_tokens);
        }
        tokens.resize(self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.capability.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&tokens)?)
    }

    /// Conditional embeddings, preceded by the unconditional (negative prompt)
    /// embeddings when classifier-free guidance is active.
    fn text_embeddings(&self, prompt: &str, negative: &str, guided: bool) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?;
        let embeddings = if guided {
            let uncond = self.encode_prompt(negative)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.capability.dtype)?)
    }
}

impl ModelLike for StableDiffusionModel {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        let height = request.height.unwrap_or(self.version.default_size());
        let width = request.width.unwrap_or(self.version.default_size());
        if height % 8 != 0 || width % 8 != 0 {
            anyhow::bail!("image size must be a multiple of 8, got {width}x{height}");
        }
        let steps = request.steps.unwrap_or(DEFAULT_STEPS);
        let guidance = request.guidance.unwrap_or(DEFAULT_GUIDANCE_SCALE);
        let guided = guidance > 1.0;
        let device = &self.capability.device;
        let dtype = self.capability.dtype;

        if let Some(seed) = request.seed {
            device.set_seed(seed)?;
        }

        let sd_config = self.version.config(height, width);
        let mut scheduler = sd_config.build_scheduler(steps)?;

        let text_embeddings = self.text_embeddings(
            &request.prompt,
            request.negative_prompt.as_deref().unwrap_or_default(),
            guided,
        )?;

        let mut latents = (Tensor::randn(
            0f32,
            1f32,
            (1, LATENT_CHANNELS, height / 8, width / 8),
            device,
        )? * scheduler.init_noise_sigma())?
        .to_dtype(dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * guidance)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!(step = index + 1, total = timesteps.len(), "denoising");
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let img = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tracing::info!(width, height, steps, "decoded image");

        tensor_to_image(&img.i(0)?)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(variant: ModelVariant, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion { version, repo } = variant;
        let capability = Capability::resolve(device_map)?;
        let device = &capability.device;
        let dtype = capability.dtype;
        let half = dtype == DType::F16;
        let weights = |component: &str, stem: &str| {
            if half {
                format!("{component}/{stem}.fp16.safetensors")
            } else {
                format!("{component}/{stem}.safetensors")
            }
        };
        let sd_config = version.config(version.default_size(), version.default_size());
        let sd_repo = api.model(repo.clone());

        // --- Tokenizer ---
        let tokenizer_file = api
            .model(version.tokenizer_repo().to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;

        // --- Text encoder ---
        let clip_file = sd_repo
            .get(&weights("text_encoder", "model"))
            .await
            .context("failed to get text encoder weights")?;
        // The text encoder runs in f32 even on accelerators, embeddings are
        // converted afterwards.
        let clip_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_file, device, DType::F32)
                .context("failed to load text encoder")?;

        // --- UNet ---
        let unet_file = sd_repo
            .get(&weights("unet", "diffusion_pytorch_model"))
            .await
            .context("failed to get unet weights")?;
        let unet = sd_config
            .build_unet(
                unet_file,
                device,
                LATENT_CHANNELS,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .context("failed to load unet")?;

        // --- Autoencoder ---
        let vae_file = sd_repo
            .get(&weights("vae", "diffusion_pytorch_model"))
            .await
            .context("failed to get autoencoder weights")?;
        let vae = sd_config
            .build_vae(vae_file, device, dtype)
            .context("failed to load autoencoder")?;

        tracing::info!(%repo, ?version, "loaded stable diffusion pipeline");

        Ok(StableDiffusionModel {
            version,
            capability,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            clip_model,
            unet,
            vae,
        })
    }
}

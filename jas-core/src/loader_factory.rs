use anyhow::{anyhow, Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};

use crate::{DeviceMap, Loader, ModelLike, SdVersion, StableDiffusionLoader};
use std::sync::Arc;

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    StableDiffusion,
    StableDiffusionXl,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION-XL") || name_upper.contains("SDXL") {
            Some(ModelType::StableDiffusionXl)
        } else if name_upper.contains("STABLE-DIFFUSION") {
            Some(ModelType::StableDiffusion)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelVariant {
    StableDiffusion { version: SdVersion, repo: String },
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if !name_upper.contains("STABLE-DIFFUSION") {
            return None;
        }
        let version = if name_upper.contains("2-1") || name_upper.contains("2.1") {
            SdVersion::V2_1
        } else {
            SdVersion::V1_5 // Default to 1.5 if no specific version is found
        };
        Some(ModelVariant::StableDiffusion {
            version,
            repo: model_name.to_string(),
        })
    }
}

/// Hub client for weight downloads. Without a token the cached login, if any,
/// is used.
pub fn hub_api(token: Option<&str>) -> Result<Api> {
    let builder = match token {
        Some(token) => ApiBuilder::new().with_token(Some(token.to_string())),
        None => ApiBuilder::new(),
    };
    builder.build().context("failed to create hf hub API")
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    // Get model type and variant or return error if unsupported
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    tracing::info!(
        "Loading model: {} (detected type: {:?}/variant: {:?})",
        model_name,
        model_type,
        model_variant
    );

    match model_type {
        ModelType::StableDiffusion => {
            let model = StableDiffusionLoader::load(model_variant, api, device_map).await?;
            Ok(Arc::new(model))
        }
        _ => Err(anyhow!(
            "Model type {:?}/variant {:?} is recognized but not yet implemented",
            model_type,
            model_variant
        )),
    }
}

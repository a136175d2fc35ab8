//! Core of the JAS image generator: prompt validation, the hosted-inference
//! client, the in-process Stable Diffusion pipeline and the session that
//! holds the current image.

pub mod device_map;
pub mod imaging;
pub mod loader;
mod loader_factory;
pub mod params;
pub mod remote;
pub mod session;
mod util;

mod stable_diffusion;

pub use device_map::*;
pub use imaging::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use params::*;
pub use remote::{ApiToken, InferenceError, RemoteClient, RemoteConfig};
use serde::{Deserialize, Serialize};
pub use session::{GenerationError, Generator, SaveError, Session, Status};
pub use stable_diffusion::{SdVersion, StableDiffusionLoader, StableDiffusionModel, DEFAULT_REPO};
pub(crate) use util::*;
pub use util::tensor_to_image;

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}

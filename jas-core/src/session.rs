//! Per-user generation session.
//!
//! A [`Session`] holds at most one current image. Only a successful
//! generation replaces it; validation failures and generation failures leave
//! it exactly as it was and only change the status line.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use thiserror::Error;

use crate::{
    decode_image, encode_png, save_png, GenerationRequest, InferenceError, ModelLike, Prompt,
    RemoteClient, SamplingParams, ValidationError,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Remote(#[from] InferenceError),

    #[error("Could not render image: {0}")]
    Decode(String),

    /// The in-process model exposes no error structure, so any failure it
    /// reports collapses into this one reason string.
    #[error("An error occurred: {0}")]
    Local(String),
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("No image to save")]
    NoImage,

    #[error("{0:#}")]
    Write(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Status {
    #[default]
    Idle,
    Generated,
    Saved(PathBuf),
    Invalid(String),
    Failed(String),
}

impl Status {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::Failed(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => Ok(()),
            Self::Generated => f.write_str("Image Generated"),
            Self::Saved(path) => write!(f, "Image Saved to {}", path.display()),
            Self::Invalid(message) | Self::Failed(message) => f.write_str(message),
        }
    }
}

/// Where images come from: an in-process pipeline or a hosted endpoint.
#[derive(Clone)]
pub enum Generator {
    Local(Arc<dyn ModelLike>),
    Remote(RemoteClient),
}

impl Generator {
    pub fn describe(&self) -> String {
        match self {
            Self::Local(_) => "local pipeline".to_string(),
            Self::Remote(client) => format!("remote endpoint {}", client.endpoint()),
        }
    }

    pub async fn generate(
        &self,
        prompt: &Prompt,
        negative_prompt: Option<&str>,
        params: SamplingParams,
    ) -> Result<DynamicImage, GenerationError> {
        let request = GenerationRequest {
            prompt: prompt.as_str().to_string(),
            negative_prompt: negative_prompt.map(str::to_string),
            steps: Some(params.steps),
            guidance: Some(params.guidance_scale),
            ..GenerationRequest::default()
        };
        self.run(request).await
    }

    /// Validates and runs a full request. Size and seed only apply to the
    /// local pipeline; the hosted endpoint picks its own.
    pub async fn run(&self, request: GenerationRequest) -> Result<DynamicImage, GenerationError> {
        let prompt = Prompt::new(request.prompt.as_str())?;
        let params = SamplingParams::from_optional(request.steps, request.guidance)?;
        match self {
            Self::Local(model) => {
                let model = Arc::clone(model);
                let request = GenerationRequest {
                    steps: Some(params.steps),
                    guidance: Some(params.guidance_scale),
                    ..request
                };
                // Inference is CPU/GPU bound and cannot be interrupted once started.
                tokio::task::spawn_blocking(move || model.run(request))
                    .await
                    .map_err(|e| GenerationError::Local(e.to_string()))?
                    .map_err(|e| GenerationError::Local(format!("{e:#}")))
            }
            Self::Remote(client) => {
                let bytes = client
                    .synthesize(
                        &prompt,
                        request.negative_prompt.as_deref(),
                        params.steps,
                        params.guidance_scale,
                    )
                    .await?;
                decode_image(&bytes).map_err(|e| GenerationError::Decode(e.to_string()))
            }
        }
    }
}

#[derive(Default)]
pub struct Session {
    current: Option<DynamicImage>,
    last_prompt: Option<String>,
    status: Status,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn current_image(&self) -> Option<&DynamicImage> {
        self.current.as_ref()
    }

    /// Prompt that produced the current image.
    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    /// Validates `prompt` and, only if it is non-empty, asks `generator` for
    /// an image.
    pub async fn submit(
        &mut self,
        generator: &Generator,
        prompt: &str,
        negative_prompt: Option<&str>,
        params: SamplingParams,
    ) -> Result<&DynamicImage, GenerationError> {
        let prompt = match Prompt::new(prompt) {
            Ok(prompt) => prompt,
            Err(err) => {
                self.status = Status::Invalid(err.to_string());
                return Err(err.into());
            }
        };

        tracing::info!(
            generator = %generator.describe(),
            steps = params.steps,
            guidance_scale = params.guidance_scale,
            "generating image"
        );
        let outcome = generator.generate(&prompt, negative_prompt, params).await;
        self.record(prompt, outcome)
    }

    fn record(
        &mut self,
        prompt: Prompt,
        outcome: Result<DynamicImage, GenerationError>,
    ) -> Result<&DynamicImage, GenerationError> {
        match outcome {
            Ok(image) => {
                tracing::info!(
                    width = image.width(),
                    height = image.height(),
                    "image generated"
                );
                self.status = Status::Generated;
                self.last_prompt = Some(prompt.into_inner());
                Ok(&*self.current.insert(image))
            }
            Err(err) => {
                tracing::warn!("generation failed: {err}");
                self.status = Status::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// PNG encoding of the current image, for download.
    pub fn png_bytes(&self) -> Result<Vec<u8>, SaveError> {
        let image = self.current.as_ref().ok_or(SaveError::NoImage)?;
        Ok(encode_png(image)?)
    }

    pub fn save_png(&mut self, path: impl AsRef<Path>) -> Result<(), SaveError> {
        let path = path.as_ref();
        let result = match self.current.as_ref() {
            Some(image) => save_png(image, path).map_err(SaveError::from),
            None => Err(SaveError::NoImage),
        };
        match &result {
            Ok(()) => {
                tracing::info!(path = %path.display(), "image saved");
                self.status = Status::Saved(path.to_path_buf());
            }
            Err(err) => self.status = Status::Failed(err.to_string()),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Paints a solid colour, or fails, and remembers what it was asked for.
    struct FakeModel {
        color: [u8; 3],
        fail: bool,
        calls: AtomicUsize,
        last_request: Mutex<Option<GenerationRequest>>,
    }

    impl FakeModel {
        fn painting(color: [u8; 3]) -> Arc<Self> {
            Arc::new(Self {
                color,
                fail: false,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                color: [0; 3],
                fail: true,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }
    }

    impl ModelLike for FakeModel {
        fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request);
            if self.fail {
                anyhow::bail!("CUDA out of memory");
            }
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                4,
                4,
                Rgb(self.color),
            )))
        }
    }

    fn temp_png(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("jas-session-{}-{name}.png", std::process::id()))
    }

    #[tokio::test]
    async fn empty_prompt_never_reaches_the_model() {
        let model = FakeModel::painting([1, 2, 3]);
        let generator = Generator::Local(model.clone());
        let mut session = Session::new();

        let err = session
            .submit(&generator, "   ", None, SamplingParams::default())
            .await
            .unwrap_err();

        assert_eq!(err, GenerationError::Validation(ValidationError::EmptyPrompt));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.status().to_string(), "Please enter a prompt");
        assert!(session.current_image().is_none());
    }

    #[tokio::test]
    async fn parameters_are_forwarded_to_the_local_model() {
        let model = FakeModel::painting([9, 9, 9]);
        let generator = Generator::Local(model.clone());
        let mut session = Session::new();
        let params = SamplingParams::new(42, 3.5).unwrap();

        session
            .submit(&generator, "a red barn", Some("fog"), params)
            .await
            .unwrap();

        let request = model.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.prompt, "a red barn");
        assert_eq!(request.negative_prompt.as_deref(), Some("fog"));
        assert_eq!(request.steps, Some(42));
        assert_eq!(request.guidance, Some(3.5));
        assert_eq!(session.status(), &Status::Generated);
        assert_eq!(session.last_prompt(), Some("a red barn"));
    }

    #[tokio::test]
    async fn failure_keeps_previous_image() {
        let mut session = Session::new();
        let good = Generator::Local(FakeModel::painting([200, 100, 50]));
        let bad = Generator::Local(FakeModel::failing());

        session
            .submit(&good, "sunrise", None, SamplingParams::default())
            .await
            .unwrap();
        let before = session.current_image().unwrap().to_rgb8();

        let err = session
            .submit(&bad, "sunset", None, SamplingParams::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            GenerationError::Local("CUDA out of memory".to_string())
        );
        assert!(session.status().is_error());
        assert_eq!(session.status().to_string(), "An error occurred: CUDA out of memory");
        assert_eq!(session.current_image().unwrap().to_rgb8(), before);
        assert_eq!(session.last_prompt(), Some("sunrise"));
    }

    #[tokio::test]
    async fn success_replaces_previous_image() {
        let mut session = Session::new();
        let first = Generator::Local(FakeModel::painting([10, 10, 10]));
        let second = Generator::Local(FakeModel::painting([20, 20, 20]));

        session
            .submit(&first, "one", None, SamplingParams::default())
            .await
            .unwrap();
        let image = session
            .submit(&second, "two", None, SamplingParams::default())
            .await
            .unwrap();

        assert_eq!(image.to_rgb8().get_pixel(0, 0).0, [20, 20, 20]);
    }

    #[test]
    fn saving_without_an_image_is_reported() {
        let mut session = Session::new();
        let err = session.save_png(temp_png("empty")).unwrap_err();
        assert!(matches!(err, SaveError::NoImage));
        assert_eq!(session.status().to_string(), "No image to save");
        assert!(matches!(session.png_bytes(), Err(SaveError::NoImage)));
    }

    #[tokio::test]
    async fn saved_png_round_trips() {
        let mut session = Session::new();
        let generator = Generator::Local(FakeModel::painting([17, 34, 51]));
        session
            .submit(&generator, "teal square", None, SamplingParams::default())
            .await
            .unwrap();

        let path = temp_png("roundtrip");
        session.save_png(&path).unwrap();
        assert_eq!(session.status(), &Status::Saved(path.clone()));

        let reloaded = image::open(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(
            reloaded.to_rgb8(),
            session.current_image().unwrap().to_rgb8()
        );

        let download = decode_image(&session.png_bytes().unwrap()).unwrap();
        assert_eq!(download.to_rgb8(), reloaded.to_rgb8());
    }
}

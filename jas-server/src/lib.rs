//! Browser UI and JSON API for the JAS image generator.

mod page;

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use jas_core::{
    image_to_base64_png, GenerationError, GenerationRequest, Generator, SamplingParams, SaveError,
    Session,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const DOWNLOAD_FILE_NAME: &str = "generated_image.png";

// Application state: the generator chosen at startup and the single session
// whose current image the page displays.
pub struct AppState {
    generator: Generator,
    session: Mutex<Session>,
    default_negative_prompt: Option<String>,
}

impl AppState {
    pub fn new(generator: Generator, default_negative_prompt: Option<String>) -> Self {
        Self {
            generator,
            session: Mutex::new(Session::new()),
            default_negative_prompt,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/status", get(status_handler))
        .route("/api/image.png", get(download_handler))
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct GenerateForm {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub ok: bool,
    pub status: String,
    pub has_image: bool,
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub image: String,
}

fn error_status(err: &GenerationError) -> StatusCode {
    match err {
        GenerationError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GenerationError::Remote(_) | GenerationError::Decode(_) => StatusCode::BAD_GATEWAY,
        GenerationError::Local(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn non_blank(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

fn status_response(session: &Session, ok: bool) -> StatusResponse {
    StatusResponse {
        ok,
        status: session.status().to_string(),
        has_image: session.current_image().is_some(),
        prompt: session.last_prompt().map(str::to_string),
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(page::render(
        &state.generator,
        state.default_negative_prompt.as_deref().unwrap_or_default(),
    ))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let session = state.session.lock().await;
    Json(status_response(&session, !session.status().is_error()))
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(form): Json<GenerateForm>,
) -> Response {
    let params = match SamplingParams::from_optional(form.steps, form.guidance) {
        Ok(params) => params,
        Err(err) => {
            let session = state.session.lock().await;
            let mut body = status_response(&session, false);
            body.status = err.to_string();
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
        }
    };
    let negative_prompt = non_blank(form.negative_prompt);

    // Held across generation: one request renders at a time.
    let mut session = state.session.lock().await;
    let outcome = session
        .submit(
            &state.generator,
            &form.prompt,
            negative_prompt.as_deref(),
            params,
        )
        .await
        .map(|_| ());
    match outcome {
        Ok(()) => Json(status_response(&session, true)).into_response(),
        Err(err) => (error_status(&err), Json(status_response(&session, false))).into_response(),
    }
}

async fn download_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.session.lock().await;
    match session.png_bytes() {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{DOWNLOAD_FILE_NAME}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(SaveError::NoImage) => {
            (StatusCode::NOT_FOUND, SaveError::NoImage.to_string()).into_response()
        }
        Err(err) => {
            tracing::error!("Error encoding image: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> Response {
    match generate_image(req, &state).await {
        Ok(img_base64) => Json(GenerationResponse { image: img_base64 }).into_response(),
        Err(e) => {
            tracing::error!("Error generating image: {e}");
            (error_status(&e), format!("Error: {e}")).into_response()
        }
    }
}

/// Stateless generation for API clients: the session image is left alone.
async fn generate_image(
    mut req: GenerationRequest,
    state: &AppState,
) -> Result<String, GenerationError> {
    req.negative_prompt = non_blank(req.negative_prompt.take());
    let image = state.generator.run(req).await?;
    image_to_base64_png(&image).map_err(|e| GenerationError::Local(format!("{e:#}")))
}

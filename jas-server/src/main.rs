use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use jas_core::{
    hub_api, load_model, remote, ApiToken, DeviceMap, Generator, RemoteClient, RemoteConfig,
    DEFAULT_NEGATIVE_PROMPT, DEFAULT_REPO,
};
use jas_server::{router, AppState};
use tokio::{self, net::TcpListener};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Run the diffusion pipeline in this process
    Local,
    /// Call a hosted inference endpoint
    Remote,
}

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "JAS image generation web UI")]
struct Args {
    /// Where images are generated
    #[arg(long, value_enum, default_value_t = Backend::Remote)]
    backend: Backend,

    /// Use CPU instead of GPU (local backend)
    #[arg(long)]
    cpu: bool,

    /// Model repository to load (local backend)
    #[arg(long, default_value = DEFAULT_REPO)]
    model: String,

    /// Inference endpoint URL (remote backend)
    #[arg(long, env = remote::ENDPOINT_ENV, default_value = remote::DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Hugging Face access token. Required for the remote backend
    #[arg(long, env = remote::TOKEN_ENV, hide_env_values = true)]
    token: Option<String>,

    /// Request timeout in seconds (remote backend)
    #[arg(long, env = remote::TIMEOUT_ENV, default_value_t = 120)]
    timeout_secs: u64,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

async fn build_generator(args: &Args) -> Result<Generator> {
    match args.backend {
        Backend::Local => {
            let api = hub_api(args.token.as_deref())?;
            let model = load_model(&args.model, api, DeviceMap::from_cpu_flag(args.cpu)).await?;
            Ok(Generator::Local(model))
        }
        Backend::Remote => {
            let token = args
                .token
                .as_deref()
                .filter(|token| !token.trim().is_empty())
                .context("the remote backend needs an access token, set HF_TOKEN or pass --token")?;
            let config = RemoteConfig::new(&args.endpoint, ApiToken::new(token))
                .with_timeout(Duration::from_secs(args.timeout_secs));
            Ok(Generator::Remote(RemoteClient::new(config)?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // --- Load the model or connect the client once at startup ---
    let generator = build_generator(&args).await?;
    let default_negative_prompt = match args.backend {
        Backend::Remote => Some(DEFAULT_NEGATIVE_PROMPT.to_string()),
        Backend::Local => None,
    };

    // Build application state and wrap in Arc.
    let shared_state = Arc::new(AppState::new(generator, default_negative_prompt));

    // --- Build axum router with shared state ---
    let app = router(shared_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("Started server on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

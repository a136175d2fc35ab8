use std::{io, path::PathBuf, time::Duration, time::Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cliclack::{confirm, input, intro, log, outro, spinner};
use jas_core::{
    hub_api, load_model, remote, ApiToken, DeviceMap, GenerationError, Generator, RemoteClient,
    RemoteConfig, SamplingParams, Session, DEFAULT_GUIDANCE_SCALE, DEFAULT_NEGATIVE_PROMPT, DEFAULT_REPO,
    DEFAULT_STEPS,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const DEFAULT_SAVE_PATH: &str = "generated_image.png";

#[derive(Debug, Subcommand)]
enum BackendCommand {
    /// Load the diffusion pipeline into this process.
    Local {
        /// Model repository on the Hugging Face Hub
        #[arg(short, long, default_value = DEFAULT_REPO)]
        model: String,

        /// Use CPU instead of GPU
        #[arg(long)]
        cpu: bool,

        /// Hugging Face token. Useful for accessing gated repositories.
        /// By default, the Hugging Face token at ~/.cache/huggingface/token is used.
        #[arg(long, env = remote::TOKEN_ENV, hide_env_values = true)]
        token: Option<String>,
    },

    /// Send prompts to a hosted inference endpoint.
    Remote {
        /// Inference endpoint URL
        #[arg(long, env = remote::ENDPOINT_ENV, default_value = remote::DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Hugging Face access token
        #[arg(long, env = remote::TOKEN_ENV, hide_env_values = true, value_parser = non_blank_token)]
        token: String,

        /// Request timeout in seconds
        #[arg(long, env = remote::TIMEOUT_ENV, default_value_t = 120)]
        timeout_secs: u64,
    },
}

#[derive(Parser)]
#[command(author, version, about = "Interactive JAS image generator")]
struct Args {
    #[clap(subcommand)]
    backend: BackendCommand,

    /// Number of denoising steps (10-100).
    #[arg(short, long, default_value_t = DEFAULT_STEPS)]
    num_steps: usize,

    /// Guidance scale (1.0-20.0).
    #[arg(short, long, default_value_t = DEFAULT_GUIDANCE_SCALE)]
    scale: f64,
}

fn non_blank_token(token: &str) -> Result<String, String> {
    if token.trim().is_empty() {
        return Err(format!("the access token is empty, set {} or pass --token", remote::TOKEN_ENV));
    }
    Ok(token.to_string())
}

async fn build_generator(backend: BackendCommand) -> Result<Generator> {
    match backend {
        BackendCommand::Local { model, cpu, token } => {
            tracing::info!(%model, cpu, "loading local pipeline");
            let api = hub_api(token.as_deref())?;
            let model = load_model(&model, api, DeviceMap::from_cpu_flag(cpu)).await?;
            Ok(Generator::Local(model))
        }
        BackendCommand::Remote {
            endpoint,
            token,
            timeout_secs,
        } => {
            let config = RemoteConfig::new(endpoint, ApiToken::new(token))
                .with_timeout(Duration::from_secs(timeout_secs));
            Ok(Generator::Remote(RemoteClient::new(config)?))
        }
    }
}

#[allow(clippy::ptr_arg)]
fn validate_png_path(input: &String) -> Result<(), &'static str> {
    if input.trim().is_empty() {
        return Err("Image path is required!");
    }
    let path = PathBuf::from(input);
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("png") => Ok(()),
        _ => Err(".png extension is required!"),
    }
}

/// Extra hint for failures that may clear up on their own.
fn retry_hint(err: &GenerationError) -> Option<&'static str> {
    match err {
        GenerationError::Remote(err) if err.is_transient() => {
            Some("This is usually temporary, try the same prompt again shortly.")
        }
        _ => None,
    }
}

fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

async fn run(generator: Generator, params: SamplingParams) -> io::Result<()> {
    let negative_default = match generator {
        Generator::Remote(_) => DEFAULT_NEGATIVE_PROMPT,
        Generator::Local(_) => "",
    };
    let mut session = Session::new();

    loop {
        let prompt: String = input("Prompt:")
            .placeholder("A futuristic city in the clouds")
            .required(false)
            .interact()?;
        let negative: String = input("Negative prompt (optional):")
            .default_input(negative_default)
            .required(false)
            .interact()?;
        let negative = Some(negative).filter(|n| !n.trim().is_empty());

        let start = Instant::now();
        let progress = spinner();
        progress.start("Generating image...");
        let outcome = session
            .submit(&generator, &prompt, negative.as_deref(), params)
            .await
            .map(|image| (image.width(), image.height()));
        match outcome {
            Ok((width, height)) => progress.stop(format!(
                "{} ({width}x{height}, {:.2}s)",
                session.status(),
                start.elapsed().as_secs_f32()
            )),
            Err(err) => {
                progress.error(session.status());
                if let Some(hint) = retry_hint(&err) {
                    log::remark(hint)?;
                }
            }
        }

        if session.current_image().is_some() && confirm("Save image?").interact()? {
            let out_file: String = input("Save image to:")
                .default_input(DEFAULT_SAVE_PATH)
                .validate(validate_png_path)
                .interact()?;
            match session.save_png(&out_file) {
                Ok(()) => log::success(session.status())?,
                Err(err) => log::error(err)?,
            }
        }

        if !confirm("Generate another image?").initial_value(true).interact()? {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let params = SamplingParams::new(args.num_steps, args.scale)?;

    intro("JAS Image Generator").context("failed to start terminal UI")?;
    let generator = build_generator(args.backend).await?;
    log::info(format!("Using {}", generator.describe()))?;

    match run(generator, params).await {
        Ok(()) => outro("Bye!")?,
        Err(err) if interrupted(&err) => cliclack::outro_cancel("Cancelled")?,
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_path_must_be_png() {
        assert!(validate_png_path(&"out.png".to_string()).is_ok());
        assert!(validate_png_path(&"dir/out.PNG".to_string()).is_ok());
        assert_eq!(
            validate_png_path(&"out.jpg".to_string()),
            Err(".png extension is required!")
        );
        assert_eq!(
            validate_png_path(&"out".to_string()),
            Err(".png extension is required!")
        );
        assert_eq!(
            validate_png_path(&"  ".to_string()),
            Err("Image path is required!")
        );
    }

    #[test]
    fn sampling_flags_parse() {
        let args = Args::try_parse_from([
            "jas", "--num-steps", "50", "--scale", "9", "remote", "--token", "t",
        ])
        .unwrap();
        assert_eq!(args.num_steps, 50);
        assert_eq!(args.scale, 9.0);
        assert!(matches!(args.backend, BackendCommand::Remote { .. }));
    }

    #[test]
    fn remote_rejects_blank_token() {
        for token in ["", "   "] {
            let err = Args::try_parse_from(["jas", "remote", "--token", token])
                .err()
                .unwrap();
            assert!(err.to_string().contains("access token is empty"), "{err}");
        }
    }

    #[test]
    fn transient_failures_get_a_retry_hint() {
        let warming = GenerationError::Remote(remote::InferenceError::ServiceWarming);
        let denied = GenerationError::Remote(remote::InferenceError::Unauthorized);
        assert!(retry_hint(&warming).is_some());
        assert!(retry_hint(&GenerationError::Remote(remote::InferenceError::Timeout)).is_some());
        assert_eq!(retry_hint(&denied), None);
        assert_eq!(retry_hint(&GenerationError::Local("oom".into())), None);
    }
}

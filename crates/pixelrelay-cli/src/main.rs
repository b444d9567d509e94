use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pixelrelay_contracts::config::{non_empty_env, NormalizeConfig};
use pixelrelay_contracts::events::{EventWriter, RunEvent};
use pixelrelay_contracts::providers::ProviderKind;
use pixelrelay_contracts::request::{GenerationRequest, ImageAsset, ReferenceImage, SizeHints};
use pixelrelay_engine::{GenerationOutput, Normalizer, RelayEngine, RelayError};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pixelrelay", version, about = "Normalize images and relay them to image-generation providers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Re-encode one image to fit the upload budget.
    Normalize(NormalizeArgs),
    /// Generate images with a provider.
    Generate(GenerateArgs),
    /// List providers and whether their credentials are set.
    Providers,
}

#[derive(Debug, Parser)]
struct NormalizeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    max_bytes: Option<usize>,
    #[arg(long)]
    max_dimension: Option<u32>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long, default_value = "replicate")]
    provider: ProviderKind,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    negative: Option<String>,
    /// Reference image; repeat for several.
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    /// Guidance for the reference image at the same position.
    #[arg(long)]
    guidance: Vec<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pixelrelay error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    match cli.command {
        Command::Normalize(args) => runtime.block_on(run_normalize(args)),
        Command::Generate(args) => runtime.block_on(run_generate(args)),
        Command::Providers => run_providers(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_normalize(args: NormalizeArgs) -> Result<i32> {
    let mut config = NormalizeConfig::from_env();
    if let Some(max_bytes) = args.max_bytes {
        config.max_bytes = max_bytes;
    }
    if let Some(max_dimension) = args.max_dimension {
        config.max_dimension = max_dimension;
    }
    let asset = read_asset(&args.input)?;
    let source_bytes = asset.byte_len();
    let engine = RelayEngine::new(Normalizer::new(config), Default::default());
    let result = match engine.normalize(asset).await {
        Ok(result) => result,
        Err(err) => {
            eprintln!("pixelrelay error: {err}");
            return Ok(exit_code(&err));
        }
    };

    if let Some(parent) = args.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, &result.bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!(
        "{}",
        json!({
            "out": args.out.display().to_string(),
            "source_bytes": source_bytes,
            "bytes": result.size,
            "width": result.width,
            "height": result.height,
            "content_type": result.content_type,
        })
    );
    Ok(0)
}

async fn run_generate(args: GenerateArgs) -> Result<i32> {
    let kind = args.provider;
    let request = build_request(&args)?;
    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, uuid::Uuid::new_v4().to_string()));
    if let Some(events) = &events {
        events.emit(RunEvent::RunStarted, run_started_payload(kind, &request))?;
    }

    let engine = RelayEngine::from_env();
    let started = Instant::now();
    let outcome = prepare_and_dispatch(&engine, kind, request, events.as_ref()).await;

    match outcome {
        Ok(output) => {
            if let Some(events) = &events {
                events.generation_finished(kind, &output.urls, started.elapsed().as_millis())?;
            }
            println!(
                "{}",
                json!({ "provider": output.provider.name(), "urls": output.urls })
            );
            Ok(0)
        }
        Err(err) => {
            if let Some(events) = &events {
                events.generation_failed(kind, &err.to_string(), err.http_status())?;
            }
            eprintln!("pixelrelay error: {err}");
            Ok(exit_code(&err))
        }
    }
}

async fn prepare_and_dispatch(
    engine: &RelayEngine,
    kind: ProviderKind,
    request: GenerationRequest,
    events: Option<&EventWriter>,
) -> Result<GenerationOutput, RelayError> {
    let prepared = engine
        .prepare_observed(request, |index, source_bytes, result| {
            let Some(events) = events else {
                return;
            };
            if let Err(err) = events.image_normalized(index, source_bytes, result) {
                tracing::warn!(error = %err, "failed to record image_normalized");
            }
        })
        .await?;
    engine.dispatch(kind, &prepared).await
}

/// 2 for problems with the caller's input, 1 for upstream or internal failures.
fn exit_code(err: &RelayError) -> i32 {
    if err.is_client_error() {
        2
    } else {
        1
    }
}

fn run_providers() -> Result<i32> {
    let rows: Vec<Value> = ProviderKind::ALL
        .iter()
        .map(|kind| {
            json!({
                "name": kind.name(),
                "async_job": kind.is_async_job(),
                "configured": credential_envs(*kind)
                    .iter()
                    .any(|key| non_empty_env(key).is_some()),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(0)
}

fn credential_envs(kind: ProviderKind) -> &'static [&'static str] {
    match kind {
        ProviderKind::Replicate => &["REPLICATE_API_TOKEN", "REPLICATE_API_KEY"],
        ProviderKind::Fal => &["FAL_KEY", "FAL_API_KEY"],
        ProviderKind::NanoBanana => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
    }
}

fn build_request(args: &GenerateArgs) -> Result<GenerationRequest> {
    if args.prompt.trim().is_empty() {
        bail!("--prompt must not be empty");
    }
    if args.guidance.len() > args.images.len() {
        bail!(
            "got {} --guidance values for {} --image values",
            args.guidance.len(),
            args.images.len()
        );
    }
    let mut request = GenerationRequest::new(args.prompt.trim());
    request.negative_prompt = args.negative.clone();
    request.size = SizeHints {
        size: args.size.clone(),
        aspect_ratio: args.aspect_ratio.clone(),
    };
    for (idx, path) in args.images.iter().enumerate() {
        let mut image = ReferenceImage::new(read_asset(path)?);
        if let Some(guidance) = args.guidance.get(idx) {
            image = image.with_guidance(guidance.as_str());
        }
        request.images.push(image);
    }
    Ok(request)
}

fn read_asset(path: &Path) -> Result<ImageAsset> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ImageAsset::unprobed(bytes, content_type_for_path(path)))
}

/// Declared type from the file extension. Only advisory; the normalizer
/// sniffs the real format.
fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

fn run_started_payload(kind: ProviderKind, request: &GenerationRequest) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("provider".to_string(), json!(kind.name()));
    payload.insert("prompt".to_string(), json!(request.prompt));
    payload.insert("image_count".to_string(), json!(request.images.len()));
    if !request.size.is_empty() {
        payload.insert("size".to_string(), json!(request.size));
    }
    payload
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use clap::Parser;
    use pixelrelay_contracts::providers::ProviderKind;
    use pixelrelay_engine::RelayError;

    use super::{
        build_request, content_type_for_path, exit_code, run_normalize, run_started_payload, Cli,
        Command, NormalizeArgs,
    };

    fn generate_args(argv: &[&str]) -> super::GenerateArgs {
        let mut full = vec!["pixelrelay", "generate"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).expect("parse").command {
            Command::Generate(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn generate_parses_provider_aliases_and_repeated_images() {
        let args = generate_args(&[
            "--provider",
            "gemini",
            "--prompt",
            "a kite",
            "--image",
            "a.png",
            "--image",
            "b.jpg",
            "--guidance",
            "the tail",
        ]);
        assert_eq!(args.provider, ProviderKind::NanoBanana);
        assert_eq!(args.images.len(), 2);
        assert_eq!(args.guidance, vec!["the tail"]);
    }

    #[test]
    fn unknown_provider_is_rejected_by_the_parser() {
        let err = Cli::try_parse_from(["pixelrelay", "generate", "--provider", "dalle", "--prompt", "x"])
            .expect_err("unknown provider");
        assert!(err.to_string().contains("Unknown provider 'dalle'"));
    }

    #[test]
    fn build_request_pairs_guidance_by_position() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = dir.path().join("first.png");
        let second = dir.path().join("second.JPG");
        fs::write(&first, [1u8, 2, 3])?;
        fs::write(&second, [4u8])?;
        let first_arg = first.display().to_string();
        let second_arg = second.display().to_string();
        let args = generate_args(&[
            "--prompt",
            " a kite ",
            "--image",
            &first_arg,
            "--image",
            &second_arg,
            "--guidance",
            "keep colors",
            "--size",
            "1024x1024",
        ]);

        let request = build_request(&args)?;
        assert_eq!(request.prompt, "a kite");
        assert_eq!(request.images.len(), 2);
        assert_eq!(request.images[0].asset.bytes, vec![1, 2, 3]);
        assert_eq!(request.images[0].asset.content_type, "image/png");
        assert_eq!(request.images[0].guidance.as_deref(), Some("keep colors"));
        assert_eq!(request.images[1].asset.content_type, "image/jpeg");
        assert_eq!(request.images[1].guidance, None);

        let payload = run_started_payload(ProviderKind::Replicate, &request);
        assert_eq!(payload["provider"], "replicate");
        assert_eq!(payload["image_count"], 2);
        assert_eq!(payload["size"]["size"], "1024x1024");
        Ok(())
    }

    #[test]
    fn extra_guidance_is_an_error() {
        let args = generate_args(&["--prompt", "kite", "--guidance", "orphan"]);
        let err = build_request(&args).expect_err("guidance without image");
        assert!(err.to_string().contains("1 --guidance values for 0 --image"));
    }

    #[test]
    fn missing_image_file_names_the_path() {
        let args = generate_args(&["--prompt", "kite", "--image", "/nonexistent/pixelrelay.png"]);
        let err = build_request(&args).expect_err("missing file");
        assert!(format!("{err:#}").contains("/nonexistent/pixelrelay.png"));
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for_path(Path::new("x.WEBP")), "image/webp");
        assert_eq!(content_type_for_path(Path::new("x.jpeg")), "image/jpeg");
        assert_eq!(content_type_for_path(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn normalize_reports_undecodable_input_as_client_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("notes.png");
        let out = dir.path().join("out.jpg");
        fs::write(&input, b"not really a png")?;
        let code = run_normalize(NormalizeArgs {
            input,
            out: out.clone(),
            max_bytes: None,
            max_dimension: None,
        })
        .await?;
        assert_eq!(code, 2);
        assert!(!out.exists());
        Ok(())
    }

    #[test]
    fn exit_codes_split_client_and_upstream_failures() {
        let unsupported = RelayError::UnsupportedImage {
            declared_type: "image/png".to_string(),
            byte_len: 4,
            reason: "bad magic".to_string(),
        };
        assert_eq!(exit_code(&unsupported), 2);
        let budget = RelayError::SizeBudgetExceeded {
            original_width: 10,
            original_height: 10,
            max_bytes: 1,
            attempts: Vec::new(),
        };
        assert_eq!(exit_code(&budget), 2);
        let failed = RelayError::JobFailed {
            id: "p1".to_string(),
            status: "failed".to_string(),
            detail: "NSFW content detected".to_string(),
        };
        assert_eq!(exit_code(&failed), 1);
    }
}

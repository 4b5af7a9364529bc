//! Command-line entry point.
//!
//! Usage:
//!   stack-provision run --event event.json
//!   stack-provision run --bucket uploads --key hosts.csv
//!   stack-provision run --bucket uploads --key hosts.csv --dry-run --file ./hosts.csv
//!   stack-provision output --stack ec2-web01 --key InstanceId
//!
//! Configuration comes from the environment (and `.env`); see
//! [`ProvisionConfig::from_env`].

use clap::{Parser, Subcommand};
use serde_json::json;
use stack_provision::aws::{
    load_sdk_config, AwsCommandBackend, AwsObjectSource, AwsStackBackend, AwsWorkflowLauncher,
};
use stack_provision::{
    lookup_output, InMemoryBackend, Invocation, InvocationResponse, ProvisionConfig,
    RecordingSleeper, TokioSleeper,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stack-provision", version, about = "Provision one stack per uploaded record")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one uploaded file.
    Run {
        /// Storage event document (JSON).
        #[arg(long, conflicts_with_all = ["bucket", "key"])]
        event: Option<PathBuf>,
        #[arg(long, requires = "key")]
        bucket: Option<String>,
        #[arg(long, requires = "bucket")]
        key: Option<String>,
        /// Simulate every backend in memory; nothing is created.
        #[arg(long)]
        dry_run: bool,
        /// Local copy of the uploaded object, for dry runs.
        #[arg(long, requires = "dry_run")]
        file: Option<PathBuf>,
    },
    /// Print one output of an existing stack.
    Output {
        #[arg(long)]
        stack: String,
        #[arg(long, env = "OUTPUT_KEY", default_value = "InstanceId")]
        key: String,
    },
}

fn event_document(
    event: Option<PathBuf>,
    bucket: Option<String>,
    key: Option<String>,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    if let Some(path) = event {
        let raw = std::fs::read_to_string(&path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    match (bucket, key) {
        (Some(bucket), Some(key)) => Ok(json!({
            "Records": [{ "s3": { "bucket": { "name": bucket }, "object": { "key": key } } }]
        })),
        _ => Err("either --event or --bucket and --key is required".into()),
    }
}

async fn run(
    config: &ProvisionConfig,
    event: &serde_json::Value,
    dry_run: bool,
    file: Option<PathBuf>,
) -> Result<InvocationResponse, Box<dyn std::error::Error>> {
    if dry_run {
        let backend = InMemoryBackend::new();
        if let Some(path) = file {
            let object = stack_provision::StorageEvent::from_json(event)?.uploaded_object()?;
            backend.put_object(&object.bucket, &object.key, std::fs::read(&path)?);
        }
        let sleeper = RecordingSleeper::new();
        let response = Invocation::new(config, &backend, &backend, &sleeper, &backend)
            .with_launcher(&backend)
            .handle_json(event)
            .await;
        tracing::info!(calls = ?backend.calls(), "dry run finished");
        return Ok(response);
    }

    let sdk_config = load_sdk_config().await;
    let stacks = AwsStackBackend::new(&sdk_config);
    let commands = AwsCommandBackend::new(&sdk_config, config.command.clone());
    let objects = AwsObjectSource::new(&sdk_config);
    let launcher = config
        .state_machine_arn
        .as_ref()
        .map(|arn| AwsWorkflowLauncher::new(&sdk_config, arn));

    let mut invocation = Invocation::new(config, &stacks, &commands, &TokioSleeper, &objects);
    if let Some(launcher) = &launcher {
        invocation = invocation.with_launcher(launcher);
    }
    Ok(invocation.handle_json(event).await)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env
    dotenvy::dotenv().ok();

    // Control verbosity with RUST_LOG (default: info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            event,
            bucket,
            key,
            dry_run,
            file,
        } => {
            let document = event_document(event, bucket, key)?;
            let response = match ProvisionConfig::from_env() {
                Ok(config) => run(&config, &document, dry_run, file).await?,
                Err(e) => InvocationResponse::from_error(&e),
            };
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.status_code != 200 {
                std::process::exit(1);
            }
        }
        Command::Output { stack, key } => {
            let sdk_config = load_sdk_config().await;
            let backend = AwsStackBackend::new(&sdk_config);
            let value = lookup_output(&backend, &stack, &key).await?;
            println!("{}", value);
        }
    }

    Ok(())
}

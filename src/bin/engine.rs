//! `check-engine` — loads a workflow config and an event, runs it, and
//! prints the resulting [`check_engine::RunReport`] as JSON. A thin
//! ambient-stack shell around the library's orchestrator entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use check_engine::model::{CheckId, EngineConfig, MemoryFormat};
use check_engine::provider::{EchoProvider, EventEnvelope, ProviderRegistry};
use check_engine::runner::{run_checks, RunOptions};
use check_engine::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "check-engine", version, about = "Dependency-driven check orchestration engine")]
struct Cli {
    /// Path to the workflow YAML config
    #[arg(long)]
    config: PathBuf,

    /// Restrict this run to the transitive closure of these check ids
    #[arg(long, value_delimiter = ',')]
    target: Vec<String>,

    /// Only run checks carrying at least one of these tags
    #[arg(long, value_delimiter = ',')]
    tag: Vec<String>,

    /// Event name driving this run
    #[arg(long, default_value = "manual")]
    event: String,

    /// Path to a JSON file with the event payload
    #[arg(long)]
    event_payload: Option<PathBuf>,

    /// Run-level timeout budget in milliseconds; bounds every check's
    /// effective deadline alongside its own `timeout`
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_text = std::fs::read_to_string(&cli.config)?;
    let config = Arc::new(EngineConfig::from_yaml(&config_text)?);

    let payload = match &cli.event_payload {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => serde_json::Value::Null,
    };

    let memory = Arc::new(match &config.memory {
        Some(mem_config) if mem_config.persist => {
            let file = mem_config
                .file
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("memory.persist is true but memory.file is unset"))?;
            MemoryStore::with_persistence(file, mem_config.format)?
        }
        _ => MemoryStore::in_memory(),
    });

    let providers = Arc::new(ProviderRegistry::new().register("echo", Arc::new(EchoProvider)));

    let options = RunOptions {
        targets: cli.target.into_iter().map(CheckId::from).collect(),
        tag_filter: if cli.tag.is_empty() { None } else { Some(cli.tag) },
        event: EventEnvelope {
            name: cli.event,
            payload: payload.into(),
        },
        timeout_ms: cli.timeout_ms,
    };

    let report = run_checks(config, providers, memory, options).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}

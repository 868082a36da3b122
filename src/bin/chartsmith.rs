//! Chartsmith CLI
//!
//! Thin wiring over the library: load configuration, build the service
//! clients, run one document job against the in-memory store, and print
//! what came out. Persistence backends plug in by embedding the library.

use anyhow::{bail, Context, Result};
use chartsmith::config::EngineConfig;
use chartsmith::generate::Generator;
use chartsmith::job::{NewJob, Scheduler};
use chartsmith::logging;
use chartsmith::pipeline::PipelineEnv;
use chartsmith::pool::CallPool;
use chartsmith::provider::HttpGenerativeClient;
use chartsmith::store::{DocumentStore, JobType, MemoryStore};
use chartsmith::terminology::HttpTerminologyClient;
use chartsmith::validator::HttpValidatorClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chartsmith", about = "Clinical document generation and repair")]
struct Cli {
    /// Path to a configuration file (defaults to ./chartsmith.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create one job, run it to completion, and print the results
    Run {
        /// Job title
        #[arg(long)]
        title: String,

        /// Document kind: narrative, fhir, trajectory
        #[arg(long = "type")]
        job_type: String,

        /// Path to a JSON file with the type-specific inputs
        #[arg(long)]
        inputs: PathBuf,

        /// Directory to write artifacts into (printed to stdout otherwise)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init_logging(Some(&config.logging)).context("initializing logging")?;

    match cli.command {
        Command::Run {
            title,
            job_type,
            inputs,
            out,
        } => run(config, title, job_type, inputs, out).await,
    }
}

async fn run(
    config: EngineConfig,
    title: String,
    job_type: String,
    inputs: PathBuf,
    out: Option<PathBuf>,
) -> Result<()> {
    let job_type: JobType = match job_type.parse() {
        Ok(job_type) => job_type,
        Err(err) => bail!("{}", err),
    };
    let inputs: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&inputs)
            .with_context(|| format!("reading {}", inputs.display()))?,
    )
    .context("parsing inputs as JSON")?;

    let provider = HttpGenerativeClient::new(
        config.provider.endpoint.clone(),
        config.provider.api_key.clone(),
        config.provider.model.clone(),
        config.provider.temperature,
    )?;
    let pool = CallPool::new(config.provider.pool_limit);
    let generator = Generator::new(Arc::new(provider), pool, config.retry.to_policy());
    let env = Arc::new(PipelineEnv {
        generator,
        terminology: Arc::new(HttpTerminologyClient::new(
            config.services.terminology_endpoint.clone(),
        )?),
        validator: Arc::new(HttpValidatorClient::new(
            config.services.validator_endpoint.clone(),
        )?),
        refine: config.refine.to_settings(),
    });

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(Arc::clone(&store), env);

    let job = scheduler
        .create(NewJob {
            title,
            job_type,
            inputs,
            depends_on: Vec::new(),
        })
        .await?;
    let run_result = scheduler.start(&job.id).await;

    let summary = scheduler.status(&job.id).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let artifacts = store.list_artifacts(&job.id).await?;
    for artifact in &artifacts {
        match &out {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}-v{}.json", artifact.kind, artifact.version));
                std::fs::write(&path, serde_json::to_string_pretty(&artifact.content)?)?;
                println!("wrote {}", path.display());
            }
            None => {
                println!(
                    "--- {} v{} {:?}",
                    artifact.kind, artifact.version, artifact.tags
                );
                println!("{}", serde_json::to_string_pretty(&artifact.content)?);
            }
        }
    }

    run_result?;
    Ok(())
}

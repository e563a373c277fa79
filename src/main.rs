use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;

use porter::configure::{self, AppConfig};
use porter::logger::setup_logger;
use porter::transfer::executor::{ExecutorBackend, InMemoryBackend};
use porter::transfer::{
    AuthData, AuthorizationState, CredentialCipher, DataType, InMemoryJobStore, JobCoordinator,
    JobId, JobStore, JobWorker, PassthroughCipher, ProviderRegistry, SledExecutorBackend,
    SledJobStore,
};

#[derive(Parser)]
#[command(name = "porter")]
#[command(about = "Move a user's data between services")]
struct Cli {
    /// Path of the configuration file
    #[arg(long, default_value = configure::DEFAULT_CONFIG_FILE)]
    config: String,

    /// Override the number of workers
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run transfer workers until Ctrl-C
    Worker,
    /// Create a job and queue it for a worker
    CreateJob {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        data_type: String,
    },
    /// Store the export and import credentials of a claimed job
    Authorize {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        export_token: String,
        #[arg(long)]
        import_token: String,
    },
    /// Show the state of a job
    Status {
        #[arg(long)]
        job_id: String,
    },
    /// Cancel a job
    Cancel {
        #[arg(long)]
        job_id: String,
    },
    /// Run one job end to end in this process
    Demo {
        #[arg(long, default_value = porter::transfer::registry::MOCK_SOURCE)]
        from: String,
        #[arg(long, default_value = porter::transfer::registry::MOCK_DESTINATION)]
        to: String,
        #[arg(long, default_value = "calendar")]
        data_type: String,
    },
}

struct Runtime {
    coordinator: Arc<JobCoordinator>,
    registry: Arc<ProviderRegistry>,
    cipher: Arc<dyn CredentialCipher>,
    executor_backend: Arc<dyn ExecutorBackend>,
}

fn open_runtime(config: &AppConfig) -> anyhow::Result<Runtime> {
    let (store, executor_backend): (Arc<dyn JobStore>, Arc<dyn ExecutorBackend>) =
        if config.store_path.is_empty() {
            log::info!("Using in-memory job store");
            (Arc::new(InMemoryJobStore::new()), Arc::new(InMemoryBackend))
        } else {
            log::info!("Opening job store at {}", config.store_path);
            let db = sled::open(&config.store_path)
                .with_context(|| format!("failed to open store at {}", config.store_path))?;
            (
                Arc::new(SledJobStore::open(&db)?),
                Arc::new(SledExecutorBackend::open(&db)?),
            )
        };

    let registry = Arc::new(ProviderRegistry::with_mock_providers());
    let cipher: Arc<dyn CredentialCipher> = Arc::new(PassthroughCipher);
    let coordinator = Arc::new(JobCoordinator::new(store, registry.clone(), cipher.clone()));

    Ok(Runtime {
        coordinator,
        registry,
        cipher,
        executor_backend,
    })
}

fn parse_job_id(s: &str) -> anyhow::Result<JobId> {
    JobId::from_str(s).map_err(|e| anyhow!(e))
}

fn parse_data_type(s: &str) -> anyhow::Result<DataType> {
    DataType::from_str(s).ok_or_else(|| anyhow!("unknown data type '{}'", s))
}

fn start_workers(
    runtime: &Runtime,
    config: &AppConfig,
    count: usize,
    shutdown: &CancellationToken,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let retry = config.retry.to_strategy()?;
    let handles = (0..count.max(1))
        .map(|_| {
            let worker = JobWorker::new(
                runtime.coordinator.clone(),
                runtime.registry.clone(),
                runtime.cipher.clone(),
                config.worker.to_worker_config(),
            )
            .with_executor_backend(runtime.executor_backend.clone())
            .with_retry(retry.clone());
            Arc::new(worker).spawn(shutdown.clone())
        })
        .collect();
    Ok(handles)
}

async fn print_status(coordinator: &JobCoordinator, job_id: JobId) -> anyhow::Result<()> {
    let job = coordinator.get(job_id).await?;
    println!("Job:           {}", job.id);
    println!(
        "Route:         {} -> {} ({})",
        job.export_service, job.import_service, job.transfer_data_type
    );
    println!("State:         {}", job.state);
    println!("Authorization: {}", job.authorization_state());
    if let Some(reason) = &job.failure_reason {
        println!("Failure:       {}", reason);
    }

    let counts = coordinator.counts(job_id).await?;
    for (kind, count) in &counts.items {
        println!("Imported {}: {}", kind, count);
    }
    println!("Bytes:         {}", counts.bytes);

    for error in coordinator.errors(job_id).await? {
        println!("Error {} ({}): {}", error.id, error.title, error.exception);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let cli = Cli::parse();

    let config = configure::load_config_from(&cli.config).context("failed to load configuration")?;

    setup_logger(&config).map_err(|e| anyhow!("failed to initialize logger: {}", e))?;

    let runtime = open_runtime(&config)?;
    let coordinator = runtime.coordinator.clone();

    match cli.command {
        Commands::Worker => {
            let shutdown = CancellationToken::new();
            let count = cli.workers.unwrap_or(config.workers);
            let handles = start_workers(&runtime, &config, count, &shutdown)?;
            log::info!("Started {} worker(s)", handles.len());

            tokio::signal::ctrl_c().await?;
            log::info!("Shutdown requested");
            shutdown.cancel();
            for handle in handles {
                handle.await?;
            }
        }
        Commands::CreateJob { from, to, data_type } => {
            let data_type = parse_data_type(&data_type)?;
            let job_id = coordinator.create_job(&from, &to, data_type).await?;
            coordinator.request_worker(job_id).await?;
            println!("Created job {}", job_id);
        }
        Commands::Authorize {
            job_id,
            export_token,
            import_token,
        } => {
            let job_id = parse_job_id(&job_id)?;
            coordinator
                .store_auth_data(
                    job_id,
                    &AuthData::Token { token: export_token },
                    &AuthData::Token { token: import_token },
                )
                .await?;
            println!("Stored credentials for job {}", job_id);
        }
        Commands::Status { job_id } => {
            print_status(&coordinator, parse_job_id(&job_id)?).await?;
        }
        Commands::Cancel { job_id } => {
            let job_id = parse_job_id(&job_id)?;
            let state = coordinator.cancel_job(job_id).await?;
            println!("Job {} is {}", job_id, state);
        }
        Commands::Demo { from, to, data_type } => {
            let data_type = parse_data_type(&data_type)?;
            let shutdown = CancellationToken::new();
            let handles = start_workers(&runtime, &config, 1, &shutdown)?;

            let job_id = coordinator.create_job(&from, &to, data_type).await?;
            coordinator.request_worker(job_id).await?;
            println!("Created job {}", job_id);

            // wait for a worker to claim it
            loop {
                let job = coordinator.get(job_id).await?;
                if job.authorization_state() == AuthorizationState::AssignedWithoutAuthData {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            coordinator
                .store_auth_data(
                    job_id,
                    &AuthData::Token { token: "demo-export".to_string() },
                    &AuthData::Token { token: "demo-import".to_string() },
                )
                .await?;

            loop {
                let job = coordinator.get(job_id).await?;
                if job.state.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            shutdown.cancel();
            for handle in handles {
                handle.await?;
            }
            print_status(&coordinator, job_id).await?;
        }
    }

    Ok(())
}

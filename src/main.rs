//! shardeval binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use tokio::task::JoinSet;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shardeval::artifact::ArtifactStore;
use shardeval::comm::{Communicator, LocalGroup, TcpCommunicator};
use shardeval::config::{AppConfig, LogFormat, TransportKind};
use shardeval::dataset::{Dataset, ManifestDataset};
use shardeval::model::{model_name, wait_for_model};
use shardeval::orchestrator::{EvalOutcome, Evaluator};
use shardeval::partition::WorkerConfig;
use shardeval::pipeline::DetectorOptions;
use shardeval::replay::ReplayDetector;
use shardeval::storage::LocalStorage;

#[derive(Parser, Debug)]
#[command(name = "shardeval")]
#[command(version)]
#[command(about = "Evaluate a detector over a dataset split across workers", long_about = None)]
struct Args {
    /// Comma separated device ids, one per rank
    #[arg(long)]
    gpus: Option<String>,

    /// Dataset to evaluate; must match the manifest's name
    #[arg(long = "imdb")]
    dataset: Option<String>,

    /// JSON manifest listing the dataset's items
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Model definition file
    #[arg(long = "def")]
    prototxt: Option<PathBuf>,

    /// Model weights to evaluate
    #[arg(long = "net")]
    model: Option<PathBuf>,

    /// Comma separated names of the feature streams to extract
    #[arg(long)]
    blob_names: Option<String>,

    /// Detection score threshold to be evaluated
    #[arg(long)]
    det_thresh: Option<f32>,

    /// Wait until the model file exists
    #[arg(long, action = ArgAction::Set)]
    wait: Option<bool>,

    /// Visualize detections
    #[arg(long)]
    vis: bool,

    /// Optional config file
    #[arg(long = "cfg")]
    cfg_file: Option<PathBuf>,

    /// Set config keys, e.g. --set eval.progress_every=10 distributed.world_size=4
    #[arg(long = "set", num_args = 1.., value_parser = parse_override)]
    set_cfgs: Vec<(String, String)>,

    #[arg(long)]
    rank: Option<usize>,

    #[arg(long)]
    world_size: Option<usize>,

    /// Communicator: "local" runs every rank in this process, "tcp" one rank per process
    #[arg(long)]
    transport: Option<String>,

    #[arg(long)]
    coordinator_address: Option<String>,

    /// Directory of recorded inference output
    #[arg(long)]
    replay_dir: Option<PathBuf>,
}

fn parse_override(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.cfg_file.as_deref(), &args.set_cfgs)
        .context("failed to load configuration")?;
    apply_args(&mut config, &args)?;

    init_tracing(&config)?;
    tracing::debug!(args = ?args, "Called with args");
    config.validate().context("invalid configuration")?;
    tracing::info!(config = ?config, "Using config");

    let model_path = config.eval.model.clone();
    wait_for_model(&model_path, &config.model_wait()).await?;
    if let Some(prototxt) = &config.eval.prototxt {
        tracing::info!(prototxt = %prototxt.display(), model = %model_path.display(), "Model located");
    }

    let dataset = Arc::new(
        ManifestDataset::load(&config.eval.manifest)
            .with_context(|| format!("failed to load {}", config.eval.manifest.display()))?,
    );
    if let Some(expected) = &config.eval.dataset {
        if expected != dataset.name() {
            bail!(
                "manifest describes dataset '{}', expected '{}'",
                dataset.name(),
                expected
            );
        }
    }
    tracing::info!(dataset = %dataset.name(), items = dataset.len(), "Dataset loaded");

    let storage = Arc::new(LocalStorage::new(&config.output.root_path)?);
    let store = ArtifactStore::new(storage);
    let evaluator = Arc::new(Evaluator::new(
        config.eval_settings()?,
        model_name(&model_path),
    )?);

    let outcome = match config.distributed.transport {
        TransportKind::Local => run_in_process(&config, evaluator, dataset, store).await?,
        TransportKind::Tcp => run_as_rank(&config, &evaluator, dataset.as_ref(), &store).await?,
    };

    if let Some(outcome) = outcome {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }

    Ok(())
}

fn apply_args(config: &mut AppConfig, args: &Args) -> anyhow::Result<()> {
    if let Some(gpus) = &args.gpus {
        config.distributed.devices = split_list(gpus)
            .iter()
            .map(|id| id.parse::<u32>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("invalid --gpus '{}'", gpus))?;
    }
    if let Some(dataset) = &args.dataset {
        config.eval.dataset = Some(dataset.clone());
    }
    if let Some(manifest) = &args.manifest {
        config.eval.manifest = manifest.clone();
    }
    if let Some(prototxt) = &args.prototxt {
        config.eval.prototxt = Some(prototxt.clone());
    }
    if let Some(model) = &args.model {
        config.eval.model = model.clone();
    }
    if let Some(blob_names) = &args.blob_names {
        config.eval.blob_names = split_list(blob_names);
    }
    if let Some(det_thresh) = args.det_thresh {
        config.eval.det_thresh = det_thresh;
    }
    if let Some(wait) = args.wait {
        config.eval.wait = wait;
    }
    if args.vis {
        config.eval.vis = true;
    }
    if let Some(rank) = args.rank {
        config.distributed.rank = rank;
    }
    if let Some(world_size) = args.world_size {
        config.distributed.world_size = world_size;
    }
    if let Some(transport) = &args.transport {
        config.distributed.transport = transport.parse()?;
    }
    if let Some(address) = &args.coordinator_address {
        config.distributed.address = address.clone();
    }
    if let Some(replay_dir) = &args.replay_dir {
        config.eval.replay_dir = replay_dir.clone();
    }
    Ok(())
}

fn detector_for(config: &AppConfig, worker: &WorkerConfig) -> anyhow::Result<ReplayDetector> {
    let options = DetectorOptions {
        device: worker.device,
        visualize: config.eval.vis,
        threshold: config.eval.det_thresh,
    };
    Ok(ReplayDetector::new(&config.eval.replay_dir, options)?)
}

/// Run every rank as a task of this process
async fn run_in_process(
    config: &AppConfig,
    evaluator: Arc<Evaluator>,
    dataset: Arc<ManifestDataset>,
    store: ArtifactStore,
) -> anyhow::Result<Option<EvalOutcome>> {
    let world_size = config.distributed.world_size;
    let comms = LocalGroup::create(world_size, config.gather_timeout())?;

    let mut tasks = JoinSet::new();
    for comm in comms {
        let worker = WorkerConfig::new(comm.rank(), world_size, &config.distributed.devices)?;
        let mut detector = detector_for(config, &worker)?;
        let evaluator = evaluator.clone();
        let dataset = dataset.clone();
        let store = store.clone();

        let span = tracing::info_span!("worker", rank = worker.rank, device = worker.device);
        tasks.spawn(
            async move {
                evaluator
                    .run(&comm, dataset.as_ref(), &mut detector, &store)
                    .await
            }
            .instrument(span),
        );
    }

    let mut outcome = None;
    while let Some(joined) = tasks.join_next().await {
        // Returning early drops the set and aborts the remaining workers
        if let Some(result) = joined.context("worker task panicked")?? {
            outcome = Some(result);
        }
    }
    Ok(outcome)
}

/// Run this process's single rank, joining the others over TCP
async fn run_as_rank(
    config: &AppConfig,
    evaluator: &Evaluator,
    dataset: &dyn Dataset,
    store: &ArtifactStore,
) -> anyhow::Result<Option<EvalOutcome>> {
    let worker = config.worker()?;
    let mut detector = detector_for(config, &worker)?;

    let range = worker.range(dataset.len())?;
    tracing::info!(
        rank = worker.rank,
        device = worker.device,
        coordinator = worker.is_coordinator(config.distributed.coordinator_rank),
        start = range.start,
        end = range.end,
        address = %config.distributed.address,
        "Joining process group"
    );
    let comm = TcpCommunicator::establish(
        &config.distributed.address,
        worker.rank,
        config.tcp_options(),
    )
    .await?;

    Ok(evaluator.run(&comm, dataset, &mut detector, store).await?)
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    // Only the coordinator's diagnostics are of interest in multi-process runs
    let quiet = config.distributed.transport == TransportKind::Tcp && !config.is_coordinator();

    let env_filter = if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
            .unwrap_or_else(|_| EnvFilter::new("shardeval=info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}

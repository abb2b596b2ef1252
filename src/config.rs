use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::comm::TcpOptions;
use crate::model::ModelWait;
use crate::orchestrator::EvalSettings;
use crate::partition::WorkerConfig;
use crate::reduce::{ReductionPolicy, ReductionRule, DEFAULT_RANK_CAP};

const DEFAULT_CONFIG_FILE: &str = "shardeval.toml";
const DEFAULT_GATHER_TIMEOUT_SECS: u64 = 3600;

/// Keys whose values are comma separated lists in env vars and `--set` overrides
const LIST_KEYS: &[&str] = &["eval.blob_names", "distributed.devices"];

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub eval: EvalSection,
    pub distributed: DistributedSection,
    pub reduction: ReductionSection,
    pub output: OutputSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment, then apply `overrides`
    ///
    /// The file is `path` if given, else `$SHARDEVAL_CONFIG`, else
    /// `shardeval.toml` when present.
    pub fn load(path: Option<&Path>, overrides: &[(String, String)]) -> Result<Self> {
        let config_path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => env::var("SHARDEVAL_CONFIG")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                    default.exists().then_some(default)
                }),
        };

        let mut builder = config::Config::builder();

        if let Some(config_path) = &config_path {
            if !config_path.exists() {
                bail!("config file {} does not exist", config_path.display());
            }
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        let environment = LIST_KEYS.iter().fold(
            config::Environment::with_prefix("SHARDEVAL")
                .separator("__")
                .list_separator(",")
                .try_parsing(true),
            |env, key| env.with_list_parse_key(key),
        );
        builder = builder.add_source(environment);

        for (key, value) in overrides {
            let overridden = if LIST_KEYS.contains(&key.as_str()) {
                builder.set_override(key.as_str(), parse_list(value))
            } else {
                builder.set_override(key.as_str(), value.as_str())
            };
            builder = overridden.with_context(|| format!("invalid override {}={}", key, value))?;
        }

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        Ok(config)
    }

    /// Startup checks; any failure here is fatal before work is distributed
    pub fn validate(&self) -> Result<()> {
        self.worker().context("invalid distributed configuration")?;

        if self.distributed.coordinator_rank >= self.distributed.world_size {
            bail!(
                "distributed.coordinator_rank ({}) must be < world_size ({})",
                self.distributed.coordinator_rank,
                self.distributed.world_size
            );
        }
        if self.eval.blob_names.is_empty() {
            bail!("eval.blob_names must name at least one stream");
        }
        if self.eval.model.as_os_str().is_empty() {
            bail!("eval.model must point at the model weights");
        }
        if self.eval.wait_interval_secs == 0 {
            bail!("eval.wait_interval_secs must be positive");
        }

        self.eval_settings()
            .context("invalid evaluation configuration")?;
        Ok(())
    }

    /// This process's identity within the group
    pub fn worker(&self) -> crate::Result<WorkerConfig> {
        WorkerConfig::new(
            self.distributed.rank,
            self.distributed.world_size,
            &self.distributed.devices,
        )
    }

    pub fn reduction_policy(&self) -> crate::Result<ReductionPolicy> {
        ReductionPolicy::new(
            self.reduction
                .rules
                .iter()
                .map(|r| ReductionRule::new(r.source.clone(), r.target.clone(), r.cap))
                .collect(),
        )
    }

    pub fn eval_settings(&self) -> crate::Result<EvalSettings> {
        let settings = EvalSettings {
            coordinator_rank: self.distributed.coordinator_rank,
            streams: self.eval.blob_names.clone(),
            reduction: self.reduction_policy()?,
            rank_stream: self.eval.rank_stream.clone(),
            label_stream: self.eval.label_stream.clone(),
            det_thresh: self.eval.det_thresh,
            progress_every: self.eval.progress_every,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn model_wait(&self) -> ModelWait {
        ModelWait {
            enabled: self.eval.wait,
            interval: Duration::from_secs(self.eval.wait_interval_secs),
            max_wait: self.eval.max_wait_secs.map(Duration::from_secs),
        }
    }

    /// `None` when gathers may block forever
    pub fn gather_timeout(&self) -> Option<Duration> {
        match self.distributed.gather_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn tcp_options(&self) -> TcpOptions {
        TcpOptions {
            world_size: self.distributed.world_size,
            coordinator_rank: self.distributed.coordinator_rank,
            gather_timeout: self.gather_timeout(),
            connect_timeout: Duration::from_secs(self.distributed.connect_timeout_secs),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.distributed.rank == self.distributed.coordinator_rank
    }
}

/// `a,b` or `[a, b]` into its trimmed, non-empty elements
fn parse_list(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .unwrap_or(raw);
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvalSection {
    /// Expected dataset name; must match the manifest when set
    pub dataset: Option<String>,
    /// JSON manifest listing the dataset's items
    pub manifest: PathBuf,
    /// Model definition, recorded alongside the weights
    pub prototxt: Option<PathBuf>,
    /// Model weights; waited for when `wait` is set
    pub model: PathBuf,
    /// Feature streams to request from the detector
    pub blob_names: Vec<String>,
    pub det_thresh: f32,
    pub wait: bool,
    pub wait_interval_secs: u64,
    pub max_wait_secs: Option<u64>,
    pub vis: bool,
    /// Directory of recorded inference output
    pub replay_dir: PathBuf,
    pub rank_stream: String,
    pub label_stream: String,
    pub progress_every: usize,
}

impl Default for EvalSection {
    fn default() -> Self {
        Self {
            dataset: None,
            manifest: PathBuf::from("manifest.json"),
            prototxt: None,
            model: PathBuf::new(),
            blob_names: vec![
                "feat".to_string(),
                "pid_label".to_string(),
                "pid_prob".to_string(),
            ],
            det_thresh: 0.5,
            wait: true,
            wait_interval_secs: 10,
            max_wait_secs: None,
            vis: false,
            replay_dir: PathBuf::from("replay"),
            rank_stream: "pid_rank".to_string(),
            label_stream: "pid_label".to_string(),
            progress_every: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributedSection {
    pub world_size: usize,
    pub rank: usize,
    pub coordinator_rank: usize,
    /// Device ids, indexed by rank
    pub devices: Vec<u32>,
    pub transport: TransportKind,
    /// Coordinator address for the TCP transport
    pub address: String,
    /// 0 waits forever
    pub gather_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for DistributedSection {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            coordinator_rank: 0,
            devices: vec![0],
            transport: TransportKind::Local,
            address: "127.0.0.1:29500".to_string(),
            gather_timeout_secs: DEFAULT_GATHER_TIMEOUT_SECS,
            connect_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// All ranks run as tasks of this process
    #[default]
    Local,
    /// One process per rank, joined over TCP
    Tcp,
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(TransportKind::Local),
            "tcp" => Ok(TransportKind::Tcp),
            other => anyhow::bail!("unsupported transport: {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReductionSection {
    pub rules: Vec<ReductionRuleSection>,
}

impl Default for ReductionSection {
    fn default() -> Self {
        Self {
            rules: vec![ReductionRuleSection::default()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReductionRuleSection {
    pub source: String,
    pub target: String,
    pub cap: usize,
}

impl Default for ReductionRuleSection {
    fn default() -> Self {
        Self {
            source: "pid_prob".to_string(),
            target: "pid_rank".to_string(),
            cap: DEFAULT_RANK_CAP,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub root_path: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            root_path: "./output".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use eos_engine::DEFAULT_STAGE_NAME;

use crate::error::BridgeAppError;

pub const DEFAULT_BROKERS: &str = "localhost:9092";
pub const DEFAULT_TOPIC_IN: &str = "GoRuleEngineServiceIn";
pub const DEFAULT_TOPIC_OUT: &str = "GoRuleEngineServiceOutTransformationServiceIn";
pub const DEFAULT_GROUP: &str = "eos-task-force-group";
pub const DEFAULT_TRANSACTIONAL_ID: &str = "eos-eos-consumer-12445543";
pub const DEFAULT_DEBUG_HOST: &str = "127.0.0.1:9999";
pub const DEFAULT_METRICS_NAMESPACE: &str = "kgo";

#[derive(Parser)]
#[command(name = "eos-bridge", about = "Exactly-once мост: consume → transform → produce")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить bridge до SIGINT/SIGTERM
    Run(RunArgs),
}

/// Реализация брокерской сессии.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-process брокер (dry run, демо)
    Memory,
    /// Kafka через librdkafka (feature `kafka`)
    Kafka,
}

fn default_broker_kind() -> BrokerKind {
    if cfg!(feature = "kafka") {
        BrokerKind::Kafka
    } else {
        BrokerKind::Memory
    }
}

// ═══════════════════════════════════════════════════════════════
//  CLI args
// ═══════════════════════════════════════════════════════════════

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Путь к config.toml
    #[arg(long, default_value = "config.toml", env = "EOS_BRIDGE_CONFIG")]
    pub config: String,

    /// Seed brokers через запятую
    #[arg(long, env = "EOS_BRIDGE_BROKERS")]
    pub brokers: Option<String>,

    /// Входной topic
    #[arg(long, env = "EOS_BRIDGE_TOPIC_IN")]
    pub topic_in: Option<String>,

    /// Выходной topic
    #[arg(long = "eos-topic-out", env = "EOS_BRIDGE_TOPIC_OUT")]
    pub topic_out: Option<String>,

    /// Consumer group
    #[arg(long, env = "EOS_BRIDGE_GROUP")]
    pub group: Option<String>,

    /// Transactional id producer'а
    #[arg(long = "consume-txn-id", env = "EOS_BRIDGE_TXN_ID")]
    pub transactional_id: Option<String>,

    /// Адрес metrics endpoint'а
    #[arg(long, env = "EOS_BRIDGE_DEBUG_HOST")]
    pub debug_host: Option<String>,

    #[arg(long, value_enum, env = "EOS_BRIDGE_BROKER_KIND")]
    pub broker_kind: Option<BrokerKind>,

    /// Имя stage в trace envelope
    #[arg(long, env = "EOS_BRIDGE_STAGE_NAME")]
    pub stage_name: Option<String>,

    #[arg(long, env = "EOS_BRIDGE_MAX_POLL_RECORDS")]
    pub max_poll_records: Option<usize>,

    #[arg(long, env = "EOS_BRIDGE_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: Option<u64>,

    #[arg(long, env = "EOS_BRIDGE_METRICS_NAMESPACE")]
    pub metrics_namespace: Option<String>,

    /// Только для memory: payload'ы построчно, дописываются во входной topic
    #[arg(long, env = "EOS_BRIDGE_SEED_FILE")]
    pub seed_file: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub brokers: Option<Vec<String>>,
    pub topic_in: Option<String>,
    pub topic_out: Option<String>,
    pub group: Option<String>,
    pub transactional_id: Option<String>,
    pub debug_host: Option<String>,
    pub broker_kind: Option<BrokerKind>,
    pub stage_name: Option<String>,
    pub max_poll_records: Option<usize>,
    pub shutdown_timeout_ms: Option<u64>,
    pub metrics_namespace: Option<String>,
    pub seed_file: Option<String>,
}

impl Config {
    pub fn parse(content: &str, path: &str) -> Result<Self, BridgeAppError> {
        toml::from_str(content).map_err(|e| BridgeAppError::config("parse", format!("'{path}': {e}")))
    }

    pub fn load(path: &str) -> Result<Self, BridgeAppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeAppError::config("read", format!("'{path}': {e}")))?;
        Self::parse(&content, path)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Effective — merged config
// ═══════════════════════════════════════════════════════════════

/// Итоговая конфигурация после мержа: config.toml < env `EOS_BRIDGE_*` < CLI.
///
/// Не меняется после старта; задачи получают нужные поля при создании.
#[derive(Debug, Clone)]
pub struct Effective {
    pub brokers: Vec<String>,
    pub topic_in: String,
    pub topic_out: String,
    pub group: String,
    pub transactional_id: String,
    pub debug_host: String,
    pub broker_kind: BrokerKind,
    pub stage_name: String,
    pub max_poll_records: usize,
    pub shutdown_timeout: Duration,
    pub metrics_namespace: String,
    pub seed_file: Option<String>,
}

impl Effective {
    pub fn new(args: &RunArgs) -> Result<Self, BridgeAppError> {
        let cfg = match Config::load(&args.config) {
            Ok(c) => c,
            Err(e) => {
                if std::path::Path::new(&args.config).exists() {
                    return Err(e);
                }
                Config::default()
            }
        };
        Self::merge(args, cfg)
    }

    pub fn merge(args: &RunArgs, cfg: Config) -> Result<Self, BridgeAppError> {
        let brokers = match &args.brokers {
            Some(list) => split_brokers(list),
            None => cfg.brokers.unwrap_or_else(|| split_brokers(DEFAULT_BROKERS)),
        };

        let eff = Self {
            brokers,
            topic_in: args.topic_in.clone().or(cfg.topic_in).unwrap_or_else(|| DEFAULT_TOPIC_IN.into()),
            topic_out: args.topic_out.clone().or(cfg.topic_out).unwrap_or_else(|| DEFAULT_TOPIC_OUT.into()),
            group: args.group.clone().or(cfg.group).unwrap_or_else(|| DEFAULT_GROUP.into()),
            transactional_id: args
                .transactional_id
                .clone()
                .or(cfg.transactional_id)
                .unwrap_or_else(|| DEFAULT_TRANSACTIONAL_ID.into()),
            debug_host: args.debug_host.clone().or(cfg.debug_host).unwrap_or_else(|| DEFAULT_DEBUG_HOST.into()),
            broker_kind: args.broker_kind.or(cfg.broker_kind).unwrap_or_else(default_broker_kind),
            stage_name: args.stage_name.clone().or(cfg.stage_name).unwrap_or_else(|| DEFAULT_STAGE_NAME.into()),
            max_poll_records: args.max_poll_records.or(cfg.max_poll_records).unwrap_or(500),
            shutdown_timeout: Duration::from_millis(
                args.shutdown_timeout_ms.or(cfg.shutdown_timeout_ms).unwrap_or(5000),
            ),
            metrics_namespace: args
                .metrics_namespace
                .clone()
                .or(cfg.metrics_namespace)
                .unwrap_or_else(|| DEFAULT_METRICS_NAMESPACE.into()),
            seed_file: args.seed_file.clone().or(cfg.seed_file),
        };
        eff.validate()?;
        Ok(eff)
    }

    fn validate(&self) -> Result<(), BridgeAppError> {
        if self.topic_in.is_empty() || self.topic_out.is_empty() {
            return Err(BridgeAppError::config(
                "validate",
                format!(
                    "missing either --topic-in ({}) or --eos-topic-out ({})",
                    self.topic_in, self.topic_out
                ),
            ));
        }
        if self.brokers.is_empty() {
            return Err(BridgeAppError::config("validate", "no seed brokers"));
        }
        if self.group.is_empty() || self.transactional_id.is_empty() {
            return Err(BridgeAppError::config("validate", "group and transactional id must be set"));
        }
        if self.max_poll_records == 0 {
            return Err(BridgeAppError::config("validate", "max_poll_records must be > 0"));
        }
        if self.seed_file.is_some() && self.broker_kind != BrokerKind::Memory {
            return Err(BridgeAppError::config("validate", "seed_file is only supported by the memory broker"));
        }
        Ok(())
    }
}

fn split_brokers(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

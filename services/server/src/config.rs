// Server configuration sourced from environment variables, with an optional
// YAML override file for ops-friendly deployments.
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use millrace_log::LogConfig;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    // TCP listener bind address.
    pub bind: SocketAddr,
    // Prometheus metrics listener bind address.
    pub metrics_bind: SocketAddr,
    // Directory holding every channel's log files.
    pub logs_dir: PathBuf,
    // Bytes per log chunk file.
    pub max_log_chunk_size: u64,
    // fsync after every append.
    pub fsync_on_append: bool,
    // Max frame size accepted from clients.
    pub max_frame_bytes: usize,
    // Byte credit a fresh subscription starts with.
    pub sub_initial_credit: i64,
    // Byte credit a fresh query execution starts with.
    pub query_initial_credit: i64,
    // Per-connection outbound and mailbox queue depth.
    pub outbound_queue_depth: usize,
    // Max time to wait for a closing connection's writer to drain.
    pub writer_drain_timeout_ms: u64,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/millrace/config.yml";
const DEFAULT_MAX_LOG_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_INITIAL_CREDIT: i64 = 64 * 1024;
const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 256;
const DEFAULT_WRITER_DRAIN_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize)]
struct ServerConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    logs_dir: Option<PathBuf>,
    max_log_chunk_size: Option<u64>,
    fsync_on_append: Option<bool>,
    max_frame_bytes: Option<usize>,
    sub_initial_credit: Option<i64>,
    query_initial_credit: Option<i64>,
    outbound_queue_depth: Option<usize>,
    writer_drain_timeout_ms: Option<u64>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("MILLRACE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7451".to_string())
            .parse()
            .with_context(|| "parse MILLRACE_BIND")?;
        let metrics_bind = std::env::var("MILLRACE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9600".to_string())
            .parse()
            .with_context(|| "parse MILLRACE_METRICS_BIND")?;
        let logs_dir = std::env::var("MILLRACE_LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./millrace-logs"));
        let max_log_chunk_size = std::env::var("MILLRACE_MAX_LOG_CHUNK_SIZE")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_LOG_CHUNK_SIZE);
        let fsync_on_append = std::env::var("MILLRACE_FSYNC_ON_APPEND")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);
        let max_frame_bytes = std::env::var("MILLRACE_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let sub_initial_credit = std::env::var("MILLRACE_SUB_INITIAL_CREDIT")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_INITIAL_CREDIT);
        let query_initial_credit = std::env::var("MILLRACE_QUERY_INITIAL_CREDIT")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_INITIAL_CREDIT);
        let outbound_queue_depth = std::env::var("MILLRACE_OUTBOUND_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_DEPTH);
        let writer_drain_timeout_ms = std::env::var("MILLRACE_WRITER_DRAIN_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WRITER_DRAIN_TIMEOUT_MS);
        Ok(Self {
            bind,
            metrics_bind,
            logs_dir,
            max_log_chunk_size,
            fsync_on_append,
            max_frame_bytes,
            sub_initial_credit,
            query_initial_credit,
            outbound_queue_depth,
            writer_drain_timeout_ms,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("MILLRACE_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound && override_path.is_none() => None,
            Err(err) => {
                return Err(err).with_context(|| format!("read server config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            let override_cfg: ServerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse server config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.logs_dir {
                config.logs_dir = value;
            }
            if let Some(value) = override_cfg.max_log_chunk_size
                && value > 0
            {
                config.max_log_chunk_size = value;
            }
            if let Some(value) = override_cfg.fsync_on_append {
                config.fsync_on_append = value;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
            if let Some(value) = override_cfg.sub_initial_credit
                && value > 0
            {
                config.sub_initial_credit = value;
            }
            if let Some(value) = override_cfg.query_initial_credit
                && value > 0
            {
                config.query_initial_credit = value;
            }
            if let Some(value) = override_cfg.outbound_queue_depth
                && value > 0
            {
                config.outbound_queue_depth = value;
            }
            if let Some(value) = override_cfg.writer_drain_timeout_ms
                && value > 0
            {
                config.writer_drain_timeout_ms = value;
            }
        }
        Ok(config)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            logs_dir: self.logs_dir.clone(),
            max_log_chunk_size: self.max_log_chunk_size,
            fsync_on_append: self.fsync_on_append,
        }
    }
}

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gc: GcConfig,
    // YAML manifest loaded into the in-memory store at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    // number of attempt-to-delete workers
    pub workers: usize,
    // capacity of the absent owner LRU cache
    pub absent_owner_cache_capacity: usize,
    // finalizer removal retry on optimistic-concurrency conflicts
    pub finalizer_retry: RetryConfig,
    // backoff applied when a node is requeued after a failed attempt
    pub requeue: RequeueConfig,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            absent_owner_cache_capacity: 500,
            finalizer_retry: RetryConfig::default(),
            requeue: RequeueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_steps: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            base_delay_ms: 10,
            factor: 1.0,
            jitter: 0.1,
            max_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeueConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 1_000_000,
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    if cfg.gc.workers == 0 {
        anyhow::bail!("gc.workers must be at least 1");
    }
    if cfg.gc.absent_owner_cache_capacity == 0 {
        anyhow::bail!("gc.absent_owner_cache_capacity must be at least 1");
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("{}").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.gc.workers, 1);
        assert_eq!(cfg.gc.finalizer_retry.max_steps, 5);
    }

    #[test]
    fn test_partial_config() {
        let cfg = parse_config(
            r#"
gc:
  workers: 4
  finalizer_retry:
    max_steps: 8
seed: ./objects.yaml
"#,
        )
        .unwrap();
        assert_eq!(cfg.gc.workers, 4);
        assert_eq!(cfg.gc.absent_owner_cache_capacity, 500);
        assert_eq!(cfg.gc.finalizer_retry.max_steps, 8);
        assert_eq!(cfg.gc.finalizer_retry.base_delay_ms, 10);
        assert_eq!(cfg.seed, Some(PathBuf::from("./objects.yaml")));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(parse_config("gc:\n  workers: 0\n").is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        assert_eq!(parse_config(&yaml).unwrap(), Config::default());
    }
}

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::assembly::DemuxSettings;
use crate::protocol::redis::RespLimits;

/// Top-level configuration for the memsniff agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Server ports. Traffic from these ports is treated as replies.
    /// Default: [11211].
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Connection demultiplexer configuration.
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Protocol parsing limits.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Key aggregation configuration.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Periodic hot-key report configuration.
    #[serde(default)]
    pub report: ReportConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Connection demultiplexer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AssemblyConfig {
    /// Number of demultiplexer workers. Default: 8.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delivery batches queued per worker (dropped if full). Default: 128.
    #[serde(default = "default_assembly_queue_size")]
    pub queue_size: usize,

    /// Chunks buffered per direction before it is torn down. Default: 64.
    #[serde(default = "default_stream_buffer_chunks")]
    pub stream_buffer_chunks: usize,

    /// How long a connection may wait for its second direction. Default: 30s.
    #[serde(default = "default_half_open_timeout", with = "humantime_serde")]
    pub half_open_timeout: Duration,

    /// Capture-time idleness after which a direction is closed. Default: 60s.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How often idle and half-open connections are swept. Default: 1s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Released stream readers kept for reuse per worker. Default: 1024.
    #[serde(default = "default_max_idle_readers")]
    pub max_idle_readers: usize,
}

/// Protocol parsing limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Longest accepted protocol line in bytes. Default: 64KiB.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Events buffered per conversation before a flush. Default: 128.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Largest Redis bulk string accepted. Default: 512MiB.
    #[serde(default = "default_max_bulk_len")]
    pub max_bulk_len: usize,

    /// Largest Redis array accepted. Default: 1048576.
    #[serde(default = "default_max_array_len")]
    pub max_array_len: usize,

    /// Deepest Redis reply nesting accepted. Default: 64.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Redis command arguments are truncated past this length. Default: 64KiB.
    #[serde(default = "default_max_arg_len")]
    pub max_arg_len: usize,
}

/// Key aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Number of aggregation shards. Default: 32.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Event batches queued per shard (dropped if full). Default: 1024.
    #[serde(default = "default_analysis_queue_size")]
    pub queue_size: usize,

    /// Only keys matching this regex are aggregated. Empty matches all.
    #[serde(default)]
    pub filter: String,
}

/// Periodic hot-key report configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Report interval. Default: 1s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Number of keys logged per report. Default: 100.
    #[serde(default = "default_report_size")]
    pub size: usize,

    /// Keep counting across reports instead of resetting. Default: false.
    #[serde(default)]
    pub cumulative: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Empty disables the server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ports() -> Vec<u16> {
    vec![11211]
}

fn default_workers() -> usize {
    8
}

fn default_assembly_queue_size() -> usize {
    128
}

fn default_stream_buffer_chunks() -> usize {
    64
}

fn default_half_open_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_idle_readers() -> usize {
    1024
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_event_buffer_size() -> usize {
    crate::protocol::conversation::DEFAULT_EVENT_BUFFER
}

fn default_max_bulk_len() -> usize {
    RespLimits::default().max_bulk_len
}

fn default_max_array_len() -> usize {
    RespLimits::default().max_array_len
}

fn default_max_depth() -> usize {
    RespLimits::default().max_depth
}

fn default_max_arg_len() -> usize {
    RespLimits::default().max_arg_len
}

fn default_shards() -> usize {
    32
}

fn default_analysis_queue_size() -> usize {
    1024
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_report_size() -> usize {
    100
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ports: default_ports(),
            assembly: AssemblyConfig::default(),
            protocol: ProtocolConfig::default(),
            analysis: AnalysisConfig::default(),
            report: ReportConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_assembly_queue_size(),
            stream_buffer_chunks: default_stream_buffer_chunks(),
            half_open_timeout: default_half_open_timeout(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            max_idle_readers: default_max_idle_readers(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            event_buffer_size: default_event_buffer_size(),
            max_bulk_len: default_max_bulk_len(),
            max_array_len: default_max_array_len(),
            max_depth: default_max_depth(),
            max_arg_len: default_max_arg_len(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            queue_size: default_analysis_queue_size(),
            filter: String::new(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: default_report_interval(),
            size: default_report_size(),
            cumulative: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            bail!("at least one server port is required");
        }
        if self.ports.contains(&0) {
            bail!("ports must not contain 0");
        }

        let assembly = &self.assembly;
        if assembly.workers == 0 {
            bail!("assembly.workers must be positive");
        }
        if assembly.queue_size == 0 {
            bail!("assembly.queue_size must be positive");
        }
        if assembly.stream_buffer_chunks == 0 {
            bail!("assembly.stream_buffer_chunks must be positive");
        }
        if assembly.half_open_timeout.is_zero() {
            bail!("assembly.half_open_timeout must be positive");
        }
        if assembly.idle_timeout.is_zero() {
            bail!("assembly.idle_timeout must be positive");
        }
        if assembly.sweep_interval.is_zero() {
            bail!("assembly.sweep_interval must be positive");
        }

        let protocol = &self.protocol;
        if protocol.max_line_length == 0 {
            bail!("protocol.max_line_length must be positive");
        }
        if protocol.event_buffer_size == 0 {
            bail!("protocol.event_buffer_size must be positive");
        }
        if protocol.max_depth == 0 {
            bail!("protocol.max_depth must be positive");
        }
        if protocol.max_arg_len == 0 {
            bail!("protocol.max_arg_len must be positive");
        }

        if self.analysis.shards == 0 {
            bail!("analysis.shards must be positive");
        }
        if self.analysis.queue_size == 0 {
            bail!("analysis.queue_size must be positive");
        }
        if !self.analysis.filter.is_empty() {
            Regex::new(&self.analysis.filter)
                .with_context(|| format!("analysis.filter {:?} is invalid", self.analysis.filter))?;
        }

        if self.report.interval.is_zero() {
            bail!("report.interval must be positive");
        }
        if self.report.size == 0 {
            bail!("report.size must be positive");
        }

        Ok(())
    }

    /// Demultiplexer settings derived from this configuration.
    pub fn demux_settings(&self) -> DemuxSettings {
        DemuxSettings {
            ports: self.ports.iter().copied().collect::<HashSet<u16>>(),
            workers: self.assembly.workers,
            queue_size: self.assembly.queue_size,
            stream_buffer_chunks: self.assembly.stream_buffer_chunks,
            half_open_timeout: self.assembly.half_open_timeout,
            idle_timeout: self.assembly.idle_timeout,
            sweep_interval: self.assembly.sweep_interval,
            max_idle_readers: self.assembly.max_idle_readers,
            max_line_length: self.protocol.max_line_length,
            event_buffer_size: self.protocol.event_buffer_size,
            resp_limits: self.protocol.resp_limits(),
        }
    }
}

impl ProtocolConfig {
    pub fn resp_limits(&self) -> RespLimits {
        RespLimits {
            max_bulk_len: self.max_bulk_len,
            max_array_len: self.max_array_len,
            max_depth: self.max_depth,
            max_arg_len: self.max_arg_len,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            ports: vec![11211, 6379],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.ports, vec![11211]);
        assert_eq!(cfg.assembly.workers, 8);
        assert_eq!(cfg.assembly.half_open_timeout, Duration::from_secs(30));
        assert_eq!(cfg.protocol.max_line_length, 64 * 1024);
        assert_eq!(cfg.protocol.event_buffer_size, 128);
        assert_eq!(cfg.analysis.shards, 32);
        assert_eq!(cfg.analysis.queue_size, 1024);
        assert!(cfg.analysis.filter.is_empty());
        assert_eq!(cfg.report.interval, Duration::from_secs(1));
        assert_eq!(cfg.report.size, 100);
        assert!(!cfg.report.cumulative);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
ports: [6379]
assembly:
  workers: 2
  idle_timeout: 5m
analysis:
  shards: 4
  filter: "^user:"
report:
  interval: 10s
  size: 20
  cumulative: true
protocol:
  max_arg_len: 128
health:
  addr: "127.0.0.1:9191"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.ports, vec![6379]);
        assert_eq!(cfg.assembly.workers, 2);
        assert_eq!(cfg.assembly.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.assembly.queue_size, 128);
        assert_eq!(cfg.analysis.shards, 4);
        assert_eq!(cfg.analysis.filter, "^user:");
        assert_eq!(cfg.report.interval, Duration::from_secs(10));
        assert_eq!(cfg.report.size, 20);
        assert!(cfg.report.cumulative);
        assert_eq!(cfg.protocol.max_arg_len, 128);
        assert_eq!(cfg.protocol.max_depth, 64);
        assert_eq!(cfg.health.addr, "127.0.0.1:9191");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_demux_settings() {
        let mut cfg = valid_config();
        cfg.assembly.workers = 3;
        cfg.protocol.max_arg_len = 99;

        let settings = cfg.demux_settings();
        assert_eq!(settings.ports, HashSet::from([11211, 6379]));
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.resp_limits.max_arg_len, 99);
        assert_eq!(settings.max_line_length, 64 * 1024);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/memsniff.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    // -- Error cases --

    #[test]
    fn test_validation_empty_ports() {
        let cfg = Config {
            ports: Vec::new(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("server port"));
    }

    #[test]
    fn test_validation_zero_port() {
        let cfg = Config {
            ports: vec![0],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_zero_workers() {
        let mut cfg = valid_config();
        cfg.assembly.workers = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("assembly.workers"));

        cfg.assembly.workers = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_shards() {
        let mut cfg = valid_config();
        cfg.analysis.shards = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("analysis.shards"));
    }

    #[test]
    fn test_validation_invalid_filter() {
        let mut cfg = valid_config();
        cfg.analysis.filter = "(unclosed".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("analysis.filter"));
    }

    #[test]
    fn test_validation_zero_line_length() {
        let mut cfg = valid_config();
        cfg.protocol.max_line_length = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_line_length"));
    }

    #[test]
    fn test_validation_zero_report_interval() {
        let mut cfg = valid_config();
        cfg.report.interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("report.interval"));
    }
}

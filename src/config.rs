use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the sensorbridge agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Time-series sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Live streaming pipeline configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Node-to-host clock offset estimation configuration.
    #[serde(default)]
    pub offset: OffsetConfig,

    /// Historical backfill configuration.
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Connected-operation retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Base station link management configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Datalog export flow configuration.
    #[serde(default)]
    pub export: ExportConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// In-process log retention configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Hardware transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Which sink implementation receives points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Influx,
    Memory,
}

/// Time-series sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinkConfig {
    /// Sink implementation. Default: influx.
    #[serde(default)]
    pub kind: SinkKind,

    /// InfluxDB v2 connection settings.
    #[serde(default)]
    pub influx: InfluxConfig,
}

/// InfluxDB v2 connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    /// Server URL. Default: "http://influxdb:8086".
    #[serde(default = "default_influx_url")]
    pub url: String,

    /// API token.
    #[serde(default)]
    pub token: String,

    /// Organisation name.
    #[serde(default)]
    pub org: String,

    /// Bucket receiving all measurements.
    #[serde(default)]
    pub bucket: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_influx_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Gzip-compress write bodies. Default: true.
    #[serde(default = "default_true")]
    pub gzip: bool,
}

/// Live streaming pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Run the reader/writer pair. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Measurement for raw streamed points. Default: "mscl_sensors".
    #[serde(default = "default_measurement")]
    pub measurement: String,

    /// Value of the `source` tag on streamed points. Default: "mscl_config_stream".
    #[serde(default = "default_source_radio")]
    pub source_tag: String,

    /// Transport poll timeout. Default: 20ms.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Sleep after an empty poll. Default: 5ms.
    #[serde(default = "default_idle_sleep", with = "humantime_serde")]
    pub idle_sleep: Duration,

    /// Maximum points per sink write. Default: 5000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum age of buffered points before a write. Default: 500ms.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Bounded queue capacity in packets. Default: 5000.
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,

    /// Writer wait for queued data. Default: 200ms.
    #[serde(default = "default_queue_wait", with = "humantime_serde")]
    pub queue_wait: Duration,

    /// Cap on points kept for retry after failed writes. Default: 50000.
    #[serde(default = "default_max_pending_points")]
    pub max_pending_points: usize,

    /// Channel-1 silence that triggers a stall warning. Default: 30s.
    #[serde(default = "default_drop_warn", with = "humantime_serde")]
    pub drop_warn: Duration,

    /// Minimum spacing between stall warnings. Default: 30s.
    #[serde(default = "default_drop_log_throttle", with = "humantime_serde")]
    pub drop_log_throttle: Duration,

    /// Minimum spacing between batch summary logs. Default: 5s.
    #[serde(default = "default_log_interval", with = "humantime_serde")]
    pub log_interval: Duration,

    /// Keep only channel 1 readings. Default: false.
    #[serde(default)]
    pub only_channel_1: bool,

    /// Re-check bumped timestamps until unique. Default: false.
    #[serde(default)]
    pub strict_tie_break: bool,

    /// Reader reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Per-second resampled stream.
    #[serde(default)]
    pub resampled: ResampledConfig,
}

/// Reader reconnect backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// First backoff delay. Default: 1s.
    #[serde(default = "default_reconnect_initial", with = "humantime_serde")]
    pub initial: Duration,

    /// Growth factor per failure. Default: 1.7.
    #[serde(default = "default_reconnect_multiplier")]
    pub multiplier: f64,

    /// Backoff ceiling. Default: 10s.
    #[serde(default = "default_reconnect_max", with = "humantime_serde")]
    pub max: Duration,
}

/// Resampled stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResampledConfig {
    /// Write the resampled stream. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Measurement for resampled points. Default: "mscl_sensors_resampled".
    #[serde(default = "default_resampled_measurement")]
    pub measurement: String,

    /// Attach the original timestamp as `raw_ts_ns`. Default: true.
    #[serde(default = "default_true")]
    pub include_raw_ts: bool,
}

/// Clock offset estimation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OffsetConfig {
    /// Skew tolerated without correction. Default: 2s.
    #[serde(default = "default_min_skew", with = "humantime_serde")]
    pub min_skew: Duration,

    /// Drift from the stored offset that forces recalculation. Default: 3s.
    #[serde(default = "default_recalc_threshold", with = "humantime_serde")]
    pub recalc_threshold: Duration,

    /// Skews larger than this never replace a stored offset. Default: 30s.
    #[serde(default = "default_recalc_max_skew", with = "humantime_serde")]
    pub recalc_max_skew: Duration,

    /// Measurement holding persisted offsets. Default: "mscl_meta".
    #[serde(default = "default_meta_measurement")]
    pub meta_measurement: String,

    /// `metric` tag value of the persisted series. Default: "node_export_clock_offset_ns".
    #[serde(default = "default_offset_metric")]
    pub metric: String,
}

/// Historical backfill configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    /// Points per sink write. Default: 5000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Default `source` tag for backfilled points. Default: "mscl_node_export".
    #[serde(default = "default_source_node_export")]
    pub source_tag: String,
}

/// Connected-operation retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts before giving up. Default: 3.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    /// Base of the transient-failure backoff. Default: 500ms.
    #[serde(default = "default_retry_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Transient-failure backoff ceiling. Default: 4s.
    #[serde(default = "default_retry_backoff_cap", with = "humantime_serde")]
    pub backoff_cap: Duration,

    /// Pause after any failed attempt. Default: 500ms.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Error substrings treated as transient. Default: ["EEPROM"].
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,
}

/// Base station link management configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// A successful ping is trusted this long. Default: 10s.
    #[serde(default = "default_ping_ttl", with = "humantime_serde")]
    pub ping_ttl: Duration,

    /// Minimum spacing between fresh connection attempts. Default: 2s.
    #[serde(default = "default_connect_min_interval", with = "humantime_serde")]
    pub connect_min_interval: Duration,

    /// Background liveness ping period. Default: 5s.
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
}

/// Datalog export flow configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Reader pause armed before each download attempt. Default: 6s.
    #[serde(default = "default_export_pause", with = "humantime_serde")]
    pub pause: Duration,

    /// Download attempts. Default: 5.
    #[serde(default = "default_export_attempts")]
    pub max_attempts: u32,

    /// Error substrings treated as transient during download.
    #[serde(default = "default_export_transient_patterns")]
    pub transient_patterns: Vec<String>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address; ":port" binds all interfaces. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// In-process log retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Entries kept in the log ring. Default: 200.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

/// Which transport binding drives the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Simulated,
}

/// Hardware transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Transport binding. Default: simulated.
    #[serde(default)]
    pub kind: TransportKind,

    /// Settings for the simulated base station.
    #[serde(default)]
    pub simulated: SimulatedConfig,
}

/// Simulated base station settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedConfig {
    /// Node addresses that report data. Default: [1].
    #[serde(default = "default_sim_nodes")]
    pub nodes: Vec<u32>,

    /// Channel names per node. Default: ["ch1", "ch2"].
    #[serde(default = "default_sim_channels")]
    pub channels: Vec<String>,

    /// Rate label attached to packets. Default: "8 Hz".
    #[serde(default = "default_sim_rate_label")]
    pub rate_label: String,

    /// Packets produced per node per poll. Default: 1.
    #[serde(default = "default_one")]
    pub packets_per_poll: usize,

    /// Every Nth poll fails with a link error (0 disables). Default: 0.
    #[serde(default)]
    pub fail_every_n_polls: u64,

    /// Every Nth device operation fails with an EEPROM error (0 disables). Default: 0.
    #[serde(default)]
    pub eeprom_every_n_ops: u64,

    /// Sweeps held in each node's datalog. Default: 64.
    #[serde(default = "default_sim_datalog_sweeps")]
    pub datalog_sweeps: usize,

    /// Node clock lead over the host. Default: 0s.
    #[serde(default = "default_zero_duration", with = "humantime_serde")]
    pub node_clock_lead: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_zero_duration() -> Duration {
    Duration::ZERO
}

fn default_influx_url() -> String {
    "http://influxdb:8086".to_string()
}

fn default_influx_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_measurement() -> String {
    "mscl_sensors".to_string()
}

fn default_source_radio() -> String {
    "mscl_config_stream".to_string()
}

fn default_source_node_export() -> String {
    "mscl_node_export".to_string()
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(20)
}

fn default_idle_sleep() -> Duration {
    Duration::from_millis(5)
}

fn default_batch_size() -> usize {
    5000
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_max() -> usize {
    5000
}

fn default_queue_wait() -> Duration {
    Duration::from_millis(200)
}

fn default_max_pending_points() -> usize {
    50_000
}

fn default_drop_warn() -> Duration {
    Duration::from_secs(30)
}

fn default_drop_log_throttle() -> Duration {
    Duration::from_secs(30)
}

fn default_log_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_multiplier() -> f64 {
    1.7
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(10)
}

fn default_resampled_measurement() -> String {
    "mscl_sensors_resampled".to_string()
}

fn default_min_skew() -> Duration {
    Duration::from_secs(2)
}

fn default_recalc_threshold() -> Duration {
    Duration::from_secs(3)
}

fn default_recalc_max_skew() -> Duration {
    Duration::from_secs(30)
}

fn default_meta_measurement() -> String {
    "mscl_meta".to_string()
}

fn default_offset_metric() -> String {
    "node_export_clock_offset_ns".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_backoff_cap() -> Duration {
    Duration::from_secs(4)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_transient_patterns() -> Vec<String> {
    vec!["EEPROM".to_string()]
}

fn default_ping_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_min_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_export_pause() -> Duration {
    Duration::from_secs(6)
}

fn default_export_attempts() -> u32 {
    5
}

fn default_export_transient_patterns() -> Vec<String> {
    vec![
        "EEPROM".to_string(),
        "Failed to download data from the Node".to_string(),
        "Failed to get the Datalog Session Info".to_string(),
        "Failed to get the Datalogging Session Info".to_string(),
    ]
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_log_capacity() -> usize {
    200
}

fn default_sim_nodes() -> Vec<u32> {
    vec![1]
}

fn default_sim_channels() -> Vec<String> {
    vec!["ch1".to_string(), "ch2".to_string()]
}

fn default_sim_rate_label() -> String {
    "8 Hz".to_string()
}

fn default_sim_datalog_sweeps() -> usize {
    64
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sink: SinkConfig::default(),
            stream: StreamConfig::default(),
            offset: OffsetConfig::default(),
            backfill: BackfillConfig::default(),
            retry: RetryConfig::default(),
            connection: ConnectionConfig::default(),
            export: ExportConfig::default(),
            health: HealthConfig::default(),
            observability: ObservabilityConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            timeout: default_influx_timeout(),
            gzip: true,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            measurement: default_measurement(),
            source_tag: default_source_radio(),
            read_timeout: default_read_timeout(),
            idle_sleep: default_idle_sleep(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            queue_max: default_queue_max(),
            queue_wait: default_queue_wait(),
            max_pending_points: default_max_pending_points(),
            drop_warn: default_drop_warn(),
            drop_log_throttle: default_drop_log_throttle(),
            log_interval: default_log_interval(),
            only_channel_1: false,
            strict_tie_break: false,
            reconnect: ReconnectConfig::default(),
            resampled: ResampledConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial: default_reconnect_initial(),
            multiplier: default_reconnect_multiplier(),
            max: default_reconnect_max(),
        }
    }
}

impl Default for ResampledConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            measurement: default_resampled_measurement(),
            include_raw_ts: true,
        }
    }
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            min_skew: default_min_skew(),
            recalc_threshold: default_recalc_threshold(),
            recalc_max_skew: default_recalc_max_skew(),
            meta_measurement: default_meta_measurement(),
            metric: default_offset_metric(),
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            source_tag: default_source_node_export(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            backoff_base: default_retry_backoff_base(),
            backoff_cap: default_retry_backoff_cap(),
            settle_delay: default_settle_delay(),
            transient_patterns: default_transient_patterns(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_ttl: default_ping_ttl(),
            connect_min_interval: default_connect_min_interval(),
            ping_interval: default_ping_interval(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            pause: default_export_pause(),
            max_attempts: default_export_attempts(),
            transient_patterns: default_export_transient_patterns(),
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

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            simulated: SimulatedConfig::default(),
        }
    }
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            nodes: default_sim_nodes(),
            channels: default_sim_channels(),
            rate_label: default_sim_rate_label(),
            packets_per_poll: default_one(),
            fail_every_n_polls: 0,
            eeprom_every_n_ops: 0,
            datalog_sweeps: default_sim_datalog_sweeps(),
            node_clock_lead: Duration::ZERO,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sink.kind == SinkKind::Influx {
            let influx = &self.sink.influx;
            if influx.url.is_empty() {
                bail!("sink.influx.url is required");
            }
            if influx.token.is_empty() {
                bail!("sink.influx.token is required");
            }
            if influx.org.is_empty() {
                bail!("sink.influx.org is required");
            }
            if influx.bucket.is_empty() {
                bail!("sink.influx.bucket is required");
            }
        }

        let stream = &self.stream;
        if stream.measurement.is_empty() {
            bail!("stream.measurement must not be empty");
        }
        if stream.batch_size == 0 {
            bail!("stream.batch_size must be positive");
        }
        if stream.queue_max == 0 {
            bail!("stream.queue_max must be positive");
        }
        if stream.max_pending_points < stream.batch_size {
            bail!("stream.max_pending_points must be at least stream.batch_size");
        }
        if stream.read_timeout.is_zero() {
            bail!("stream.read_timeout must be positive");
        }
        if stream.queue_wait.is_zero() {
            bail!("stream.queue_wait must be positive");
        }
        if stream.reconnect.initial.is_zero() {
            bail!("stream.reconnect.initial must be positive");
        }
        if !(stream.reconnect.multiplier >= 1.0) {
            bail!("stream.reconnect.multiplier must be >= 1.0");
        }
        if stream.reconnect.max < stream.reconnect.initial {
            bail!("stream.reconnect.max must be >= stream.reconnect.initial");
        }
        if stream.resampled.enabled && stream.resampled.measurement.is_empty() {
            bail!("stream.resampled.measurement must not be empty when enabled");
        }
        if stream.resampled.enabled && stream.resampled.measurement == stream.measurement {
            bail!("stream.resampled.measurement must differ from stream.measurement");
        }

        if self.offset.recalc_max_skew < self.offset.recalc_threshold {
            bail!("offset.recalc_max_skew must be >= offset.recalc_threshold");
        }
        if self.offset.meta_measurement.is_empty() {
            bail!("offset.meta_measurement must not be empty");
        }

        if self.backfill.batch_size == 0 {
            bail!("backfill.batch_size must be positive");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be positive");
        }
        if self.retry.backoff_cap < self.retry.backoff_base {
            bail!("retry.backoff_cap must be >= retry.backoff_base");
        }
        if self.export.max_attempts == 0 {
            bail!("export.max_attempts must be positive");
        }

        if self.connection.ping_ttl.is_zero() {
            bail!("connection.ping_ttl must be positive");
        }
        if self.connection.ping_interval.is_zero() {
            bail!("connection.ping_interval must be positive");
        }

        if self.observability.log_capacity == 0 {
            bail!("observability.log_capacity must be positive");
        }

        let sim = &self.transport.simulated;
        if self.transport.kind == TransportKind::Simulated {
            if sim.nodes.is_empty() {
                bail!("transport.simulated.nodes must not be empty");
            }
            if sim.channels.is_empty() {
                bail!("transport.simulated.channels must not be empty");
            }
        }

        Ok(())
    }
}

//! Process configuration: environment variables and tunable defaults.
//!
//! Every rate-limiter and network-adapter constant is a field here with a
//! `Default` impl matching its documented value, overridable via
//! environment variables so operators can retune without a rebuild.

use std::time::Duration;

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

/// Parameters for one token-bucket family (see [`crate::rate_limit`]).
#[derive(Debug, Clone, Copy)]
pub struct BucketLimits {
    pub points: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

/// Tuning constants for the network adapter.
#[derive(Debug, Clone, Copy)]
pub struct NetworkDefaults {
    pub flush_threshold: usize,
    pub max_delay: Duration,
    pub min_delay: Duration,
    pub rtt_samples_max: usize,
    pub rtt_measurement_interval: Duration,
    pub rtt_outlier_factor: f64,
    pub bandwidth_samples_max: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub target_transmit_time: Duration,
    pub measurement_timeout: Duration,
    pub unstable_threshold: f64,
    pub fail_threshold: u32,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            flush_threshold: 8 * 1024,
            max_delay: Duration::from_millis(50),
            min_delay: Duration::from_millis(12),
            rtt_samples_max: 20,
            rtt_measurement_interval: Duration::from_secs(5),
            rtt_outlier_factor: 3.0,
            bandwidth_samples_max: 10,
            min_batch_size: 2 * 1024,
            max_batch_size: 32 * 1024,
            target_transmit_time: Duration::from_millis(50),
            measurement_timeout: Duration::from_secs(10),
            unstable_threshold: 1.0,
            fail_threshold: 5,
        }
    }
}

/// Top-level process configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub pod_name: Option<String>,
    pub container_name: Option<String>,
    pub port: u16,
    pub debug_perf: bool,

    pub general_limits: BucketLimits,
    pub terminal_create_limits: BucketLimits,
    pub input_limits: BucketLimits,

    pub network: NetworkDefaults,

    /// Idle sessions with no subscribers older than this are reaped.
    pub max_idle: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,

    /// Replay window for newly-attached subscribers.
    pub replay_window: Duration,

    /// Capacity of a session's output ring buffer.
    pub output_buffer_capacity: usize,

    /// When true, input containing control bytes outside a small allow-list
    /// is logged at WARN but never altered before being written to the PTY.
    pub sanitize_input: bool,

    /// Interval on which the performance telemetry record is logged.
    pub telemetry_interval: Duration,

    /// How often pending RTT measurements are checked for timeout, per
    /// session. Independent of `rtt_measurement_interval` (how often a new
    /// measurement is stamped) and `measurement_timeout` (how old a pending
    /// one has to be before it counts as a failure).
    pub measurement_sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pod_name: std::env::var("POD_NAME").ok(),
            container_name: std::env::var("CONTAINER_NAME").ok(),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3001),
            debug_perf: env_bool("DEBUG_PERF", false),

            general_limits: BucketLimits {
                points: env_u32("RLIMIT_GENERAL_POINTS", 250),
                window: env_duration_secs("RLIMIT_GENERAL_WINDOW_SECS", Duration::from_secs(60)),
                block_duration: env_duration_secs(
                    "RLIMIT_GENERAL_BLOCK_SECS",
                    Duration::from_secs(60),
                ),
            },
            terminal_create_limits: BucketLimits {
                points: env_u32("RLIMIT_CREATE_POINTS", 15),
                window: env_duration_secs("RLIMIT_CREATE_WINDOW_SECS", Duration::from_secs(60)),
                block_duration: env_duration_secs(
                    "RLIMIT_CREATE_BLOCK_SECS",
                    Duration::from_secs(120),
                ),
            },
            input_limits: BucketLimits {
                points: env_u32("RLIMIT_INPUT_POINTS", 300),
                window: env_duration_secs("RLIMIT_INPUT_WINDOW_SECS", Duration::from_secs(60)),
                block_duration: env_duration_secs(
                    "RLIMIT_INPUT_BLOCK_SECS",
                    Duration::from_secs(30),
                ),
            },

            network: NetworkDefaults {
                flush_threshold: env_usize("NET_FLUSH_THRESHOLD", 8 * 1024),
                max_delay: env_duration_ms("NET_MAX_DELAY_MS", Duration::from_millis(50)),
                min_delay: env_duration_ms("NET_MIN_DELAY_MS", Duration::from_millis(12)),
                ..NetworkDefaults::default()
            },

            max_idle: env_duration_secs("MAX_IDLE_SECS", Duration::from_secs(3600)),
            sweep_interval: env_duration_secs("SWEEP_INTERVAL_SECS", Duration::from_secs(300)),
            replay_window: Duration::from_secs(5),
            output_buffer_capacity: 1000,
            sanitize_input: env_bool("SANITIZE_INPUT", false),
            telemetry_interval: env_duration_secs(
                "TELEMETRY_INTERVAL_SECS",
                Duration::from_secs(60),
            ),
            measurement_sweep_interval: env_duration_secs(
                "MEASUREMENT_SWEEP_INTERVAL_SECS",
                Duration::from_secs(1),
            ),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.general_limits.points, 250);
        assert_eq!(cfg.terminal_create_limits.points, 15);
        assert_eq!(
            cfg.terminal_create_limits.block_duration,
            Duration::from_secs(120)
        );
        assert_eq!(cfg.input_limits.points, 300);
        assert_eq!(cfg.network.flush_threshold, 8 * 1024);
        assert_eq!(cfg.network.min_delay, Duration::from_millis(12));
        assert_eq!(cfg.network.max_delay, Duration::from_millis(50));
        assert_eq!(cfg.network.fail_threshold, 5);
        assert_eq!(cfg.max_idle, Duration::from_secs(3600));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
    }
}

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use dump_core::{
    config::{ConfigError, SectionConfig},
    event::EventType,
};

/// Name of the configuration section read by [`ManagerConfig`].
pub const SECTION: &str = "activity_dump";

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub cleanup_period: Duration,
    pub tags_resolution_period: Duration,
    /// Event types enabled in the kernel, written once at startup.
    pub traced_event_types: Vec<EventType>,
    /// Number of dump timeouts a container waits before it may be traced again.
    pub cgroups_wait_list_size: u32,
    pub default_timeout: Duration,
    pub snapshot_queue_size: usize,
    /// Where finished dumps are persisted. Nothing is written when missing.
    pub output_dir: Option<PathBuf>,
    pub profile_dir: PathBuf,
    pub statsd_address: Option<SocketAddr>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cleanup_period: Duration::from_secs(30),
            tags_resolution_period: Duration::from_secs(60),
            traced_event_types: EventType::ALL.to_vec(),
            cgroups_wait_list_size: 10,
            default_timeout: Duration::from_secs(30 * 60),
            snapshot_queue_size: 100,
            output_dir: None,
            profile_dir: PathBuf::from("/tmp"),
            statsd_address: None,
        }
    }
}

impl TryFrom<&SectionConfig> for ManagerConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let default = Self::default();

        let snapshot_queue_size =
            config.with_default::<usize>("snapshot_queue_size", default.snapshot_queue_size)?;
        if snapshot_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "snapshot_queue_size".to_string(),
                value: "0".to_string(),
                err: "the snapshot queue needs room for at least one dump".to_string(),
            });
        }

        let default_timeout_minutes = config.with_default::<u64>(
            "default_timeout",
            default.default_timeout.as_secs() / 60,
        )?;

        let cleanup_period = non_zero_period(
            "cleanup_period",
            config.seconds_with_default("cleanup_period", default.cleanup_period)?,
        )?;
        let tags_resolution_period = non_zero_period(
            "tags_resolution_period",
            config.seconds_with_default("tags_resolution_period", default.tags_resolution_period)?,
        )?;

        Ok(Self {
            cleanup_period,
            tags_resolution_period,
            traced_event_types: config
                .get_list_with_default("traced_event_types", default.traced_event_types)?,
            cgroups_wait_list_size: config
                .with_default("cgroups_wait_list_size", default.cgroups_wait_list_size)?,
            default_timeout: Duration::from_secs(default_timeout_minutes * 60),
            snapshot_queue_size,
            output_dir: config.optional("output_dir")?,
            profile_dir: config.with_default("profile_dir", default.profile_dir)?,
            statsd_address: config.optional("statsd_address")?,
        })
    }
}

/// Periods drive tickers, which can't tick every 0 seconds.
fn non_zero_period(field: &str, period: Duration) -> Result<Duration, ConfigError> {
    if period.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: "0".to_string(),
            err: "the period must be at least one second".to_string(),
        });
    }
    Ok(period)
}

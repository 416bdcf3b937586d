//! Metrics emitted by the activity dumps and their manager.

use std::net::{SocketAddr, UdpSocket};

use cadence::{MetricError, StatsdClient, UdpMetricSink, prelude::*};
use thiserror::Error;

/// Number of dumps currently active.
pub const ACTIVE_DUMPS: &str = "activity_dump.active_dumps";
/// Events recorded by a dump, tagged with their type.
pub const EVENTS_PROCESSED: &str = "activity_dump.events.processed";

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("sending metric {metric}")]
    Send {
        metric: String,
        #[source]
        source: MetricError,
    },
}

pub trait StatsSink: Send + Sync {
    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), StatsError>;
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), StatsError>;
}

/// Writes metrics to the log, used when no statsd server is configured.
#[derive(Debug, Default)]
pub struct LogSink;

impl StatsSink for LogSink {
    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), StatsError> {
        log::debug!("{name}={value} {tags:?}");
        Ok(())
    }

    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), StatsError> {
        log::debug!("{name}+={value} {tags:?}");
        Ok(())
    }
}

/// DogStatsD client over UDP. Tags are sent as given, `key:value`.
pub struct StatsdSink {
    client: StatsdClient,
}

impl StatsdSink {
    pub fn connect(address: SocketAddr) -> Result<Self, MetricError> {
        let bind: SocketAddr = if address.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let sink = UdpMetricSink::from(address, socket)?;
        Ok(Self {
            client: StatsdClient::builder("", sink).build(),
        })
    }
}

fn send_error(name: &str) -> impl FnOnce(MetricError) -> StatsError + '_ {
    move |source| StatsError::Send {
        metric: name.to_string(),
        source,
    }
}

impl StatsSink for StatsdSink {
    fn gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<(), StatsError> {
        tags.iter()
            .fold(self.client.gauge_with_tags(name, value), |metric, tag| {
                metric.with_tag_value(tag)
            })
            .try_send()
            .map(|_| ())
            .map_err(send_error(name))
    }

    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), StatsError> {
        tags.iter()
            .fold(self.client.count_with_tags(name, value), |metric, tag| {
                metric.with_tag_value(tag)
            })
            .try_send()
            .map(|_| ())
            .map_err(send_error(name))
    }
}

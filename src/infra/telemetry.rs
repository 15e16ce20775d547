use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "kasirpro_cache_hit_total",
            Unit::Count,
            "Reads answered by a live cache entry."
        );
        describe_counter!(
            "kasirpro_cache_miss_total",
            Unit::Count,
            "Reads that found no cache entry."
        );
        describe_counter!(
            "kasirpro_cache_expired_total",
            Unit::Count,
            "Entries dropped on read because their TTL had passed."
        );
        describe_counter!(
            "kasirpro_cache_evict_total",
            Unit::Count,
            "Entries evicted to stay within capacity."
        );
        describe_counter!(
            "kasirpro_cache_invalidated_total",
            Unit::Count,
            "Entries removed by explicit invalidation."
        );
        describe_counter!(
            "kasirpro_fetch_started_total",
            Unit::Count,
            "Backend fetches started by the coordinator."
        );
        describe_counter!(
            "kasirpro_fetch_joined_total",
            Unit::Count,
            "Loads that joined a fetch already in flight."
        );
        describe_counter!(
            "kasirpro_fetch_failed_total",
            Unit::Count,
            "Backend fetches that returned an error."
        );
        describe_counter!(
            "kasirpro_fetch_discarded_total",
            Unit::Count,
            "Fetch results not stored because the key was invalidated meanwhile."
        );
        describe_histogram!(
            "kasirpro_fetch_latency_seconds",
            Unit::Seconds,
            "Backend fetch latency in seconds."
        );
        describe_counter!(
            "kasirpro_realtime_events_total",
            Unit::Count,
            "Change events that triggered an invalidation."
        );
        describe_counter!(
            "kasirpro_realtime_ignored_total",
            Unit::Count,
            "Change events outside the subscribed owner or partition."
        );
        describe_counter!(
            "kasirpro_realtime_reconnects_total",
            Unit::Count,
            "Change feed re-subscriptions after a dropped stream."
        );
    });
}

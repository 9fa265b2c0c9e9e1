//! Process-wide wiring handed to every handler.

use crate::analytics::AnalyticsAggregator;
use crate::battery::BatteryPolicy;
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::error::ErrorLogger;
use crate::ingest::LocationIngest;
use crate::metrics::Metrics;
use crate::realtime::LiveBroadcaster;
use crate::retry::RetryQueue;
use crate::shift::ShiftEngine;
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub cache: Arc<CacheLayer>,
    pub ingest: Arc<LocationIngest>,
    pub shift_engine: Arc<ShiftEngine>,
    pub broadcaster: Arc<LiveBroadcaster>,
    pub battery: Arc<BatteryPolicy>,
    pub retry: Arc<RetryQueue>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub error_log: Arc<ErrorLogger>,
    pub metrics: Arc<Metrics>,
}

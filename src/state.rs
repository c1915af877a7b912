//! Shared application state
//!
//! One cloneable handle wiring every component together for the HTTP
//! surface and the supervisor.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::agent::AgentRunner;
use crate::alerts::AlertEngine;
use crate::config::AppConfig;
use crate::hub::Hub;
use crate::mapper::MapperEngine;
use crate::mqtt::BrokerPool;
use crate::sandbox::Sandbox;
use crate::store::Store;

/// Handle passed to every HTTP handler via axum state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub pool: Arc<BrokerPool>,
    pub hub: Arc<Hub>,
    pub mapper: Arc<MapperEngine>,
    pub alerts: Arc<AlertEngine>,
    pub sandbox: Sandbox,
    pub agent: Arc<AgentRunner>,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

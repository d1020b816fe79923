//! Liveness reporting for the long running loops of the scanner.
//!
//! Every loop registers a component and must report in more often than its deadline.
//! The process is live while every component reported recently. A component that
//! missed its deadline is stalled, and fails the check.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise. The body lists each component for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let status = match self.healthy {
            true => StatusCode::OK,
            false => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, never reported yet
    Starting,
    /// Must report again before this date
    HealthyUntil(OffsetDateTime),
    /// Missed its deadline
    Stalled,
}

struct StatusReport {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<StatusReport>,
}

impl HealthHandle {
    /// Returns once the report is queued.
    pub async fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc() + self.deadline;
        self.report(ComponentStatus::HealthyUntil(until)).await
    }

    async fn report(&self, status: ComponentStatus) {
        let report = StatusReport {
            component: self.component.clone(),
            status,
        };
        if let Err(e) = self.sender.send(report).await {
            warn!(component = %self.component, "failed to report health status: {}", e)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<StatusReport>,
}

impl HealthRegistry {
    /// Spawns the task applying status reports, so a runtime must be running.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<StatusReport>(16);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let applied = components.clone();
        tokio::spawn(async move {
            while let Some(report) = receiver.recv().await {
                match applied.write() {
                    Ok(mut map) => drop(map.insert(report.component, report.status)),
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    /// The returned handle goes to the registered loop, which reports through it.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report(ComponentStatus::Starting).await;
        handle
    }

    /// Unhealthy until at least one component registered. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("poisoned HealthRegistry lock");
                return HealthStatus::default();
            }
        };

        let now = OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
                _ => status.clone(),
            };
            result.healthy &= matches!(status, ComponentStatus::HealthyUntil(_));
            drop(result.components.insert(name.clone(), status));
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

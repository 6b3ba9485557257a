use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Health reporting for the long-running loops of a service.
///
/// Every loop registers a component and must keep reporting healthy more
/// often than its deadline. The registry is healthy only while every
/// registered component is: a component that reported unhealthy, stopped,
/// or missed its deadline fails the check. An empty registry is unhealthy,
/// so a process is not ready before its loops have started.
///
/// Use one registry per health endpoint; liveness and readiness answer different
/// questions.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::SERVICE_UNAVAILABLE, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Reported healthy, must report again before the instant
    HealthyUntil(Instant),
    Unhealthy,
    /// The loop exited
    Stopped,
    /// Missed its HealthyUntil deadline
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > Instant::now())
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Handed to a component so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more often than the registered deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component in `Starting` and return its reporting handle.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Combined status of all registered components. Usable as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned registry lock", self.name);
            return HealthStatus::default();
        };

        let now = Instant::now();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let effective = match component {
                ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
                other => *other,
            };
            if !matches!(effective, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), effective);
        }

        match status.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, status.components),
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("readiness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_component_lifecycle() {
        let registry = HealthRegistry::new("readiness");
        let handle = registry.register("apply_consumer", DEADLINE);

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("apply_consumer"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Stopped);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("apply_consumer"),
            Some(&ComponentStatus::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("readiness");
        let handle = registry.register("aggregation_consumer", Duration::from_secs(5));
        handle.report_healthy();
        assert!(registry.get_status().healthy);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("aggregation_consumer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn test_every_component_must_be_healthy() {
        let registry = HealthRegistry::new("readiness");
        let one = registry.register("one", DEADLINE);
        let two = registry.register("two", DEADLINE);

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);

        one.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);

        one.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn test_into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::SERVICE_UNAVAILABLE);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}

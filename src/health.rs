// =============================================================================
// Health model — per-component status with worst-of composition
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const COMPONENT_EXCHANGE_WS: &str = "exchange-ws";
pub const COMPONENT_EXCHANGE_REST: &str = "exchange-rest";

/// Health of a single component. Ordering matters: the composite is the
/// worst (maximum) across all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for ComponentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Registry of component healths, shared across tasks.
pub struct HealthRegistry {
    components: RwLock<HashMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, component: &str, health: ComponentHealth) {
        // Cheap no-op for hot-path callers re-reporting the same status.
        if self.components.read().get(component) == Some(&health) {
            return;
        }
        let mut map = self.components.write();
        let prev = map.insert(component.to_string(), health);
        if prev != Some(health) && health != ComponentHealth::Healthy {
            warn!(component, status = %health, "component health changed");
        }
    }

    pub fn get(&self, component: &str) -> Option<ComponentHealth> {
        self.components.read().get(component).copied()
    }

    /// Composite health: the worst of all components, with one carve-out —
    /// a dead REST path while the WebSocket path is up is only Degraded,
    /// because market data and order events keep flowing.
    pub fn composite(&self) -> ComponentHealth {
        let map = self.components.read();

        let ws_up = map
            .get(COMPONENT_EXCHANGE_WS)
            .map(|h| *h == ComponentHealth::Healthy)
            .unwrap_or(false);

        map.iter()
            .map(|(name, health)| {
                if name == COMPONENT_EXCHANGE_REST
                    && *health == ComponentHealth::Unhealthy
                    && ws_up
                {
                    ComponentHealth::Degraded
                } else {
                    *health
                }
            })
            .max()
            .unwrap_or(ComponentHealth::Healthy)
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_is_worst_of_components() {
        let reg = HealthRegistry::new();
        reg.set("bus", ComponentHealth::Healthy);
        reg.set("cache", ComponentHealth::Degraded);
        assert_eq!(reg.composite(), ComponentHealth::Degraded);

        reg.set("config-store", ComponentHealth::Unhealthy);
        assert_eq!(reg.composite(), ComponentHealth::Unhealthy);
    }

    #[test]
    fn empty_registry_is_healthy() {
        let reg = HealthRegistry::new();
        assert_eq!(reg.composite(), ComponentHealth::Healthy);
    }

    #[test]
    fn rest_down_with_ws_up_degrades_instead_of_failing() {
        let reg = HealthRegistry::new();
        reg.set(COMPONENT_EXCHANGE_WS, ComponentHealth::Healthy);
        reg.set(COMPONENT_EXCHANGE_REST, ComponentHealth::Unhealthy);
        assert_eq!(reg.composite(), ComponentHealth::Degraded);
    }

    #[test]
    fn rest_down_with_ws_down_is_unhealthy() {
        let reg = HealthRegistry::new();
        reg.set(COMPONENT_EXCHANGE_WS, ComponentHealth::Unhealthy);
        reg.set(COMPONENT_EXCHANGE_REST, ComponentHealth::Unhealthy);
        assert_eq!(reg.composite(), ComponentHealth::Unhealthy);
    }
}

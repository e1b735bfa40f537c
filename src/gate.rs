//! Service activity gate.
//!
//! Collectors may declare services (systemd units) they depend on. The gate
//! keeps every distinct service name in registration order and uses its
//! position as a bit index, so "which services does this collector need" and
//! "which services are running right now" are both a `u64`.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::GateError;

/// Hard limit on distinct services, one per bit of the mask.
pub const MAX_SERVICES: usize = u64::BITS as usize;

/// Source of service states, queried once per scrape for all names.
#[async_trait]
pub trait ServiceStatus: Send + Sync {
    /// Returns the `ActiveState` of each requested service.
    ///
    /// Missing entries are treated as inactive. An `Err` means the query as a
    /// whole could not be performed.
    async fn get_states(&self, names: &[String]) -> Result<HashMap<String, String>, GateError>;
}

/// Whether a reported state counts as running.
pub fn is_active_state(state: &str) -> bool {
    matches!(state, "active" | "reloading")
}

/// Outcome of one resolution: the mask plus per-service activity for export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveServices {
    pub mask: u64,
    pub services: Vec<(String, bool)>,
}

/// Ordered, append-only registry of service names.
#[derive(Debug, Default)]
pub struct ServiceGate {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ServiceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `names` and returns the OR of their bits.
    ///
    /// Names already known keep their bit. If the new names would not fit, the
    /// registry is left untouched.
    pub fn register<S: AsRef<str>>(&mut self, names: &[S]) -> Result<u64, GateError> {
        let mut new_names: Vec<&str> = Vec::new();
        for name in names {
            let name = name.as_ref();
            if !self.index.contains_key(name) && !new_names.contains(&name) {
                new_names.push(name);
            }
        }
        if self.names.len() + new_names.len() > MAX_SERVICES {
            return Err(GateError::CapacityExceeded { max: MAX_SERVICES });
        }

        for name in new_names {
            debug!("Registering service '{}' at bit {}", name, self.names.len());
            self.index.insert(name.to_string(), self.names.len());
            self.names.push(name.to_string());
        }

        Ok(names
            .iter()
            .filter_map(|name| self.bit(name.as_ref()))
            .fold(0u64, |mask, bit| mask | bit))
    }

    /// Bit assigned to `name`, if registered.
    pub fn bit(&self, name: &str) -> Option<u64> {
        self.index.get(name).map(|&i| 1u64 << i)
    }

    /// Registered names in bit order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Queries the status source once and builds the active mask.
    pub async fn resolve(&self, status: &dyn ServiceStatus) -> Result<ActiveServices, GateError> {
        if self.names.is_empty() {
            return Ok(ActiveServices::default());
        }

        let states = status.get_states(&self.names).await?;

        let mut active = ActiveServices {
            mask: 0,
            services: Vec::with_capacity(self.names.len()),
        };
        for (i, name) in self.names.iter().enumerate() {
            let running = match states.get(name) {
                Some(state) => is_active_state(state),
                None => {
                    warn!("No state reported for service '{}', treating as inactive", name);
                    false
                }
            };
            if running {
                active.mask |= 1u64 << i;
            }
            active.services.push((name.clone(), running));
        }
        Ok(active)
    }
}

/// Whether a collector requiring `required` may run given `active`.
pub fn is_eligible(required: u64, active: u64) -> bool {
    required & active == required
}

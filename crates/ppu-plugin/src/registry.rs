//! Device registry: the authoritative id → health map.
//!
//! The set of ids is fixed when the registry is built; only health can
//! change afterwards. Ids live outside the lock, health states inside a
//! mutex that is held just long enough to copy or flip a value, so a
//! snapshot never observes a half-applied write.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::config::ResourceNaming;
use crate::error::{PluginError, PluginResult};
use crate::proto;

/// Health of a single device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire representation used by the kubelet API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of the advertised resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub health: Health,
}

impl From<Instance> for proto::Device {
    fn from(instance: Instance) -> Self {
        proto::Device {
            id: instance.id,
            health: instance.health.as_str().to_string(),
        }
    }
}

/// Fixed-size registry of device instances.
#[derive(Debug)]
pub struct DeviceRegistry {
    /// Instance ids in index order.
    ids: Vec<String>,
    /// id → position in `ids` / `health`.
    positions: HashMap<String, usize>,
    health: Mutex<Vec<Health>>,
}

impl DeviceRegistry {
    /// Build a registry with `count` healthy instances named
    /// `<short>-0 .. <short>-(count-1)`.
    pub fn initialize(naming: &ResourceNaming, count: i64) -> PluginResult<Self> {
        let count = usize::try_from(count).map_err(|_| PluginError::InvalidDeviceCount(count))?;

        let ids: Vec<String> = (0..count).map(|i| naming.device_id(i)).collect();
        let positions = ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.clone(), pos))
            .collect();

        for id in &ids {
            debug!(%id, "initialized device");
        }
        info!(count, resource = %naming.resource_name(), "device registry initialized");

        Ok(Self {
            ids,
            positions,
            health: Mutex::new(vec![Health::Healthy; count]),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        let pos = *self.positions.get(id)?;
        let health = self.lock()[pos];
        Some(Instance {
            id: self.ids[pos].clone(),
            health,
        })
    }

    /// Set the health of `id`. Unknown ids are ignored; returns whether the
    /// stored value actually changed.
    pub fn set_health(&self, id: &str, health: Health) -> bool {
        let Some(&pos) = self.positions.get(id) else {
            debug!(%id, "ignoring health update for unknown device");
            return false;
        };
        let mut states = self.lock();
        let changed = states[pos] != health;
        states[pos] = health;
        changed
    }

    /// Consistent copy of every instance, in index order.
    pub fn snapshot(&self) -> Vec<Instance> {
        let states = self.lock().clone();
        self.ids
            .iter()
            .zip(states)
            .map(|(id, health)| Instance {
                id: id.clone(),
                health,
            })
            .collect()
    }

    /// Snapshot in the shape sent over ListAndWatch.
    pub fn to_proto(&self) -> Vec<proto::Device> {
        self.snapshot().into_iter().map(Into::into).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Health>> {
        // A panic while holding the guard cannot leave a Vec<Health> torn.
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

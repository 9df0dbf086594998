//! Allocation negotiation.
//!
//! Both operations are pure decisions over the current registry state.
//! Unsatisfiable parts of a request are never errors: `allocate` drops
//! ids that are unknown or unhealthy, and `preferred_allocation` returns
//! a best-effort list that may be shorter than asked for. Kubelet owns
//! the decision to retry or fail the pod.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::config::{PLACEHOLDER_HOST_PATH, ResourceNaming};
use crate::registry::{DeviceRegistry, Health};

/// A device file exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

/// Result of allocating devices to one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Allocation {
    /// Allocated ids in request order.
    pub device_ids: Vec<String>,
    pub envs: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub devices: Vec<DeviceBinding>,
}

/// Allocate the requested ids that exist and are healthy right now.
///
/// Duplicate ids in the request are bound once.
pub fn allocate(
    registry: &DeviceRegistry,
    naming: &ResourceNaming,
    requested: &[String],
) -> Allocation {
    let mut seen = HashSet::new();
    let mut device_ids = Vec::with_capacity(requested.len());

    for id in requested {
        if !seen.insert(id.as_str()) {
            debug!(%id, "duplicate device in request, already allocated");
            continue;
        }
        match registry.get(id) {
            Some(instance) if instance.health == Health::Healthy => {
                debug!(%id, "device allocated");
                device_ids.push(id.clone());
            }
            Some(instance) => {
                warn!(%id, health = %instance.health, "requested device is not healthy, skipping");
            }
            None => {
                warn!(%id, "requested device not found, skipping");
            }
        }
    }

    let joined = device_ids.join(",");

    let envs = HashMap::from([
        (naming.count_env(), device_ids.len().to_string()),
        (naming.devices_env(), joined.clone()),
    ]);
    let annotations = HashMap::from([(naming.annotation_key(), joined)]);

    let devices = device_ids
        .iter()
        .map(|id| DeviceBinding {
            container_path: naming.container_path(id),
            host_path: PLACEHOLDER_HOST_PATH.to_string(),
            permissions: "rw".to_string(),
        })
        .collect();

    Allocation {
        device_ids,
        envs,
        annotations,
        devices,
    }
}

/// Pick up to `size` ids: every must-include id first (each once, in the
/// order given), then the first ids from `available` not already picked.
///
/// When `must_include` alone exceeds `size` it is returned whole; kubelet
/// never sends such a request.
pub fn preferred_allocation(available: &[String], must_include: &[String], size: i64) -> Vec<String> {
    let mut selected: Vec<String> = Vec::with_capacity(must_include.len() + available.len());
    let mut picked = HashSet::new();

    for id in must_include {
        if picked.insert(id.as_str()) {
            selected.push(id.clone());
        }
    }

    let mut remaining = size - selected.len() as i64;
    for id in available {
        if remaining <= 0 {
            break;
        }
        if picked.insert(id.as_str()) {
            selected.push(id.clone());
            remaining -= 1;
        }
    }

    selected
}

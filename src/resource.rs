//! Resource bundles in the three shapes the platform trades in: cluster
//! quantities (`Resource`), whole purchasable units (`BuyResource`) and a
//! billing period (`UnitQuantity`).

use crate::quantity::{self, GI};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-level resource amounts. CPU in millicores, memory and storage in
/// bytes, bandwidth in megabits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ResourceWire", into = "ResourceWire")]
pub struct Resource {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    pub storage_bytes: i64,
    pub bandwidth: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ResourceWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bandwidth: Option<String>,
}

impl TryFrom<ResourceWire> for Resource {
    type Error = quantity::QuantityError;

    fn try_from(w: ResourceWire) -> Result<Self, Self::Error> {
        let or_zero = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).unwrap_or("0").to_string();
        Ok(Resource {
            cpu_millis: quantity::parse_cpu_millis(&or_zero(&w.cpu))?,
            memory_bytes: quantity::parse_value(&or_zero(&w.memory))?,
            storage_bytes: quantity::parse_value(&or_zero(&w.storage))?,
            bandwidth: quantity::parse_bandwidth(&or_zero(&w.bandwidth))?,
        })
    }
}

impl From<Resource> for ResourceWire {
    fn from(r: Resource) -> Self {
        ResourceWire {
            cpu: Some(quantity::format_cpu(r.cpu_millis)),
            memory: Some(quantity::format_bytes(r.memory_bytes)),
            storage: Some(quantity::format_bytes(r.storage_bytes)),
            bandwidth: Some(quantity::format_bandwidth(r.bandwidth)),
        }
    }
}

impl Resource {
    /// Reads a stored grant; anything unparseable is the empty resource.
    pub fn from_json_lenient(s: &str) -> Resource {
        serde_json::from_str(s).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn add(&self, other: &Resource) -> Resource {
        Resource {
            cpu_millis: self.cpu_millis + other.cpu_millis,
            memory_bytes: self.memory_bytes + other.memory_bytes,
            storage_bytes: self.storage_bytes + other.storage_bytes,
            bandwidth: self.bandwidth + other.bandwidth,
        }
    }

    pub fn sub(&self, other: &Resource) -> Resource {
        Resource {
            cpu_millis: self.cpu_millis - other.cpu_millis,
            memory_bytes: self.memory_bytes - other.memory_bytes,
            storage_bytes: self.storage_bytes - other.storage_bytes,
            bandwidth: self.bandwidth - other.bandwidth,
        }
    }

    /// Strictly greater on cpu, memory and storage. Bandwidth is not part of
    /// admission.
    pub fn exceeds(&self, other: &Resource) -> bool {
        self.cpu_millis > other.cpu_millis
            && self.memory_bytes > other.memory_bytes
            && self.storage_bytes > other.storage_bytes
    }

    pub fn is_zero(&self) -> bool {
        *self == Resource::default()
    }

    pub fn to_buy(&self) -> BuyResource {
        BuyResource {
            cpu: (self.cpu_millis + 999).div_euclid(1000),
            memory: self.memory_bytes / GI,
            storage: self.storage_bytes / GI,
            bandwidth: self.bandwidth,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} memory={} storage={} bandwidth={}",
            quantity::format_cpu(self.cpu_millis),
            quantity::format_bytes(self.memory_bytes),
            quantity::format_bytes(self.storage_bytes),
            quantity::format_bandwidth(self.bandwidth)
        )
    }
}

/// A purchasable bundle: cores, GiB of memory, GiB of storage, megabits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyResource {
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub storage: i64,
    #[serde(default)]
    pub bandwidth: i64,
}

impl BuyResource {
    pub fn new(cpu: i64, memory: i64, storage: i64, bandwidth: i64) -> Self {
        BuyResource { cpu, memory, storage, bandwidth }
    }

    /// True when any dimension is below `other`.
    pub fn less(&self, other: &BuyResource) -> bool {
        self.cpu < other.cpu
            || self.memory < other.memory
            || self.storage < other.storage
            || self.bandwidth < other.bandwidth
    }

    pub fn sub(&self, other: &BuyResource) -> BuyResource {
        BuyResource {
            cpu: self.cpu - other.cpu,
            memory: self.memory - other.memory,
            storage: self.storage - other.storage,
            bandwidth: self.bandwidth - other.bandwidth,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cpu >= 0 && self.memory >= 0 && self.storage >= 0 && self.bandwidth >= 0
    }

    pub fn is_empty(&self) -> bool {
        *self == BuyResource::default()
    }

    pub fn to_resource(&self) -> Resource {
        Resource {
            cpu_millis: self.cpu.saturating_mul(1000),
            memory_bytes: quantity::gib(self.memory),
            storage_bytes: quantity::gib(self.storage),
            bandwidth: self.bandwidth,
        }
    }

    /// Form fields sent to the billing API.
    pub fn to_params(&self) -> Vec<(String, String)> {
        vec![
            ("cpu".to_string(), self.cpu.to_string()),
            ("memory".to_string(), self.memory.to_string()),
            ("storage".to_string(), self.storage.to_string()),
            ("bandwidth".to_string(), self.bandwidth.to_string()),
        ]
    }
}

pub const HOURS_PER_MONTH: i64 = 30 * 24;

/// A billing period such as "3 month".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitQuantity {
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub unit: String,
}

impl UnitQuantity {
    pub fn new(quantity: i64, unit: &str) -> Self {
        UnitQuantity { quantity, unit: unit.to_string() }
    }

    pub fn is_empty(&self) -> bool {
        self.quantity <= 0
    }

    pub fn months(&self) -> f64 {
        let q = self.quantity as f64;
        match self.unit.as_str() {
            "hour" => q / HOURS_PER_MONTH as f64,
            "day" => q / 30.0,
            "month" => q,
            "year" => q * 12.0,
            _ => 0.0,
        }
    }

    pub fn hours(&self) -> f64 {
        let q = self.quantity as f64;
        match self.unit.as_str() {
            "hour" => q,
            "day" => q * 24.0,
            "month" => q * HOURS_PER_MONTH as f64,
            "year" => q * 12.0 * HOURS_PER_MONTH as f64,
            _ => 0.0,
        }
    }
}

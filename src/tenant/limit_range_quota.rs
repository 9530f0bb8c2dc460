use crate::quantity::{self, QuantityError};
use crate::resource::{BuyResource, Resource, UnitQuantity};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const HARD_CPU: &str = "cpu";
pub const HARD_MEMORY: &str = "memory";
pub const HARD_STORAGE: &str = "requests.storage";
pub const HARD_BANDWIDTH: &str = "bandwidth";
pub const HARD_SYS_STORAGE: &str = "sys.storage";
pub const HARD_DATA_STORAGE: &str = "data.storage";

const KNOWN_HARD: [&str; 6] = [HARD_CPU, HARD_MEMORY, HARD_STORAGE, HARD_BANDWIDTH, HARD_SYS_STORAGE, HARD_DATA_STORAGE];

#[derive(Debug, Error)]
pub enum QuotaParseError {
    #[error("quota is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("quota field {0} is invalid: {1}")]
    Field(&'static str, #[source] QuantityError),
}

/// Unit a bare number is read in.
#[derive(Clone, Copy)]
enum BareUnit {
    Cores,
    Gibibytes,
    Megabits,
}

fn read_dimension(v: Option<&Value>, field: &'static str, bare: BareUnit) -> Result<Option<i64>, QuotaParseError> {
    let raw = match v {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => return Err(QuotaParseError::Field(field, QuantityError::Invalid(other.to_string()))),
    };
    let is_bare = raw.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b'-');
    let value = match bare {
        BareUnit::Cores => quantity::parse_cpu_millis(&raw),
        BareUnit::Gibibytes if is_bare => quantity::parse_value(&format!("{}Gi", raw)),
        BareUnit::Gibibytes => quantity::parse_value(raw.strip_suffix('G').map(|s| format!("{}Gi", s)).as_deref().unwrap_or(&raw)),
        BareUnit::Megabits => quantity::parse_bandwidth(&raw),
    };
    value.map(Some).map_err(|e| QuotaParseError::Field(field, e))
}

/// Hard keys the quota has no dimension for (`pods`, `count/*`, explicit
/// `requests.cpu`, ...), kept verbatim as quantity strings.
fn read_extra_hard(hard: &Map<String, Value>) -> Result<BTreeMap<String, String>, QuotaParseError> {
    let mut extra = BTreeMap::new();
    for (k, v) in hard.iter().filter(|(k, _)| !KNOWN_HARD.contains(&k.as_str())) {
        let raw = match v {
            Value::Null => continue,
            Value::Number(n) => n.to_string(),
            Value::String(s) if s.trim().is_empty() => continue,
            Value::String(s) => s.trim().to_string(),
            other => return Err(QuotaParseError::Field("hard", QuantityError::Invalid(other.to_string()))),
        };
        quantity::parse_milli(&raw).map_err(|e| QuotaParseError::Field("hard", e))?;
        extra.insert(k.clone(), raw);
    }
    Ok(extra)
}

/// Hard ceiling plus container defaults for one tenant, with the billing
/// period the ceiling was sold for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LimitRangeQuota {
    pub storage_class: String,
    pub hard: Resource,
    pub sys_storage_bytes: Option<i64>,
    pub data_storage_bytes: Option<i64>,
    pub extra_hard: BTreeMap<String, String>,
    pub limit_cpu_millis: Option<i64>,
    pub limit_memory_bytes: Option<i64>,
    pub unit: String,
    pub quantity: i64,
}

impl LimitRangeQuota {
    /// Reads the quota annotation. Bare numbers are cores, GiB and megabits;
    /// suffixed values are read as quantities, so both the legacy unitless
    /// form and what `to_json` writes are accepted.
    pub fn parse(s: &str) -> Result<Self, QuotaParseError> {
        let root: Value = serde_json::from_str(s)?;
        let empty = Map::new();
        let hard = root.get("hard").and_then(Value::as_object).unwrap_or(&empty);
        let limit = root.get("limit").and_then(Value::as_object).unwrap_or(&empty);

        let hard_resource = Resource {
            cpu_millis: read_dimension(hard.get(HARD_CPU), "hard.cpu", BareUnit::Cores)?.unwrap_or(0),
            memory_bytes: read_dimension(hard.get(HARD_MEMORY), "hard.memory", BareUnit::Gibibytes)?.unwrap_or(0),
            storage_bytes: read_dimension(hard.get(HARD_STORAGE), "hard.requests.storage", BareUnit::Gibibytes)?
                .unwrap_or(0),
            bandwidth: read_dimension(hard.get(HARD_BANDWIDTH), "hard.bandwidth", BareUnit::Megabits)?.unwrap_or(0),
        };

        let quantity = match root.get("quantity") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };

        Ok(LimitRangeQuota {
            storage_class: root.get("storageclass").and_then(Value::as_str).unwrap_or_default().to_string(),
            hard: hard_resource,
            sys_storage_bytes: read_dimension(hard.get(HARD_SYS_STORAGE), "hard.sys.storage", BareUnit::Gibibytes)?,
            data_storage_bytes: read_dimension(hard.get(HARD_DATA_STORAGE), "hard.data.storage", BareUnit::Gibibytes)?,
            extra_hard: read_extra_hard(hard)?,
            limit_cpu_millis: read_dimension(limit.get(HARD_CPU), "limit.cpu", BareUnit::Cores)?,
            limit_memory_bytes: read_dimension(limit.get(HARD_MEMORY), "limit.memory", BareUnit::Gibibytes)?,
            unit: root.get("unit").and_then(Value::as_str).unwrap_or_default().to_string(),
            quantity,
        })
    }

    /// Hard map as quantity strings, keyed the way the annotation stores it.
    pub fn hard_map(&self) -> BTreeMap<String, String> {
        let mut hard = self.extra_hard.clone();
        hard.extend([
            (HARD_CPU.to_string(), quantity::format_cpu(self.hard.cpu_millis)),
            (HARD_MEMORY.to_string(), quantity::format_bytes(self.hard.memory_bytes)),
            (HARD_STORAGE.to_string(), quantity::format_bytes(self.hard.storage_bytes)),
            (HARD_BANDWIDTH.to_string(), quantity::format_bandwidth(self.hard.bandwidth)),
        ]);
        if let Some(sys) = self.sys_storage_bytes {
            hard.insert(HARD_SYS_STORAGE.to_string(), quantity::format_bytes(sys));
        }
        if let Some(data) = self.data_storage_bytes {
            hard.insert(HARD_DATA_STORAGE.to_string(), quantity::format_bytes(data));
        }
        hard
    }

    pub fn limit_map(&self) -> BTreeMap<String, String> {
        let mut limit = BTreeMap::new();
        if let Some(cpu) = self.limit_cpu_millis {
            limit.insert(HARD_CPU.to_string(), quantity::format_cpu(cpu));
        }
        if let Some(memory) = self.limit_memory_bytes {
            limit.insert(HARD_MEMORY.to_string(), quantity::format_bytes(memory));
        }
        limit
    }

    pub fn to_json(&self) -> String {
        let mut root = Map::new();
        if !self.storage_class.is_empty() {
            root.insert("storageclass".into(), Value::from(self.storage_class.clone()));
        }
        root.insert("hard".into(), serde_json::to_value(self.hard_map()).unwrap_or_default());
        let limit = self.limit_map();
        if !limit.is_empty() {
            root.insert("limit".into(), serde_json::to_value(limit).unwrap_or_default());
        }
        if !self.unit.is_empty() {
            root.insert("unit".into(), Value::from(self.unit.clone()));
        }
        if self.quantity != 0 {
            root.insert("quantity".into(), Value::from(self.quantity));
        }
        Value::Object(root).to_string()
    }

    pub fn expand(&mut self, delta: &Resource) {
        self.hard = self.hard.add(delta);
    }

    pub fn reset_hard(&mut self, hard: &Resource) {
        self.hard = *hard;
    }

    /// The ceiling in purchasable units: whole cores, GiB and megabits.
    pub fn hard_buy_resource(&self) -> BuyResource {
        self.hard.to_buy()
    }

    pub fn default_unit_quantity(&self) -> UnitQuantity {
        UnitQuantity::new(self.quantity, &self.unit)
    }

    pub fn has_container_limit(&self) -> bool {
        self.limit_cpu_millis.unwrap_or(0) != 0 || self.limit_memory_bytes.unwrap_or(0) != 0
    }
}

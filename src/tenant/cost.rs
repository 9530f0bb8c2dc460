use crate::resource::{BuyResource, UnitQuantity};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn int_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| de::Error::custom(format!("invalid integer {}", n))),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s.trim().parse().map_err(|_| de::Error::custom(format!("invalid integer {:?}", s))),
        other => Err(de::Error::custom(format!("invalid integer {}", other))),
    }
}

fn float_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(0.0),
        Value::Number(n) => n.as_f64().ok_or_else(|| de::Error::custom(format!("invalid number {}", n))),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s.trim().parse().map_err(|_| de::Error::custom(format!("invalid number {:?}", s))),
        other => Err(de::Error::custom(format!("invalid number {}", other))),
    }
}

/// One priced bundle inside a package.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageItem {
    #[serde(rename = "c", default, deserialize_with = "int_or_string")]
    pub cpu: i64,
    #[serde(rename = "s", default, deserialize_with = "int_or_string")]
    pub storage: i64,
    #[serde(rename = "m", default, deserialize_with = "int_or_string")]
    pub memory: i64,
    #[serde(rename = "bw", default, deserialize_with = "int_or_string")]
    pub bandwidth: i64,
    #[serde(rename = "dc_new", default, deserialize_with = "int_or_string")]
    pub discount_new: i64,
    #[serde(rename = "dc_renew", default, deserialize_with = "int_or_string")]
    pub discount_renew: i64,
    #[serde(default)]
    pub online: bool,
    #[serde(rename = "give", default)]
    pub is_give: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: Vec<String>,
}

impl PackageItem {
    pub fn to_buy_resource(&self) -> BuyResource {
        BuyResource::new(self.cpu, self.memory, self.storage, self.bandwidth)
    }

    pub fn matches(&self, rs: &BuyResource) -> bool {
        self.to_buy_resource() == *rs
    }
}

/// Bundles sold for one billing period.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(rename = "time", default, deserialize_with = "int_or_string")]
    pub quantity: i64,
    #[serde(rename = "timeUnit", default)]
    pub unit: String,
    #[serde(rename = "discount_new", default, deserialize_with = "int_or_string")]
    pub discount_new: i64,
    #[serde(rename = "discount_renew", default, deserialize_with = "int_or_string")]
    pub discount_renew: i64,
    #[serde(rename = "config", default)]
    pub items: Vec<PackageItem>,
}

impl Package {
    pub fn unit_quantity(&self) -> UnitQuantity {
        UnitQuantity::new(self.quantity, &self.unit)
    }

    pub fn matches(&self, uq: &UnitQuantity) -> bool {
        self.quantity == uq.quantity && self.unit == uq.unit
    }

    pub fn online_items(&self) -> impl Iterator<Item = &PackageItem> {
        self.items.iter().filter(|i| i.online)
    }
}

/// Per-unit prices and the package table for a tenant or policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    #[serde(default, deserialize_with = "float_or_string")]
    pub cpu: f64,
    #[serde(default, deserialize_with = "float_or_string")]
    pub memory: f64,
    #[serde(default, deserialize_with = "float_or_string")]
    pub storage: f64,
    #[serde(default, deserialize_with = "float_or_string")]
    pub bandwidth: f64,
    #[serde(rename = "packageConfig", default)]
    pub packages: Vec<Package>,
}

impl Cost {
    pub fn parse(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Builds a cost from a cost ConfigMap's data, where `packageConfig`
    /// holds the package list as a JSON string.
    pub fn from_config_data(data: &std::collections::BTreeMap<String, String>) -> Result<Self, serde_json::Error> {
        let price = |k: &str| data.get(k).and_then(|v| v.trim().parse::<f64>().ok()).unwrap_or(0.0);
        let packages = match data.get("packageConfig") {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => Vec::new(),
        };
        Ok(Cost {
            cpu: price("cpu"),
            memory: price("memory"),
            storage: price("storage"),
            bandwidth: price("bandwidth"),
            packages,
        })
    }
}

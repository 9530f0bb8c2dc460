//! Refund saga. Locking snapshots the state the tenant rolls back to;
//! applying it later is idempotent because the lock is removed only in the
//! same write that applies it.

use crate::order::billing::{BillingOrder, BuyMode};
use crate::resource::{BuyResource, Resource};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnOrderLock {
    /// Expiry to restore as unix seconds, 0 for none.
    #[serde(rename = "currentTime", alias = "CurrentTime", default)]
    pub current_time: i64,
    #[serde(alias = "Cpu", default)]
    pub cpu: i64,
    #[serde(alias = "Memory", default)]
    pub memory: i64,
    #[serde(alias = "Storage", default)]
    pub storage: i64,
    #[serde(alias = "Bandwidth", default)]
    pub bandwidth: i64,
    #[serde(rename = "orderSn", alias = "OrderSn", default)]
    pub order_sn: String,
    #[serde(rename = "buyMode", alias = "BuyMode", default)]
    pub buy_mode: String,
}

fn floor_zero(r: BuyResource) -> BuyResource {
    BuyResource::new(r.cpu.max(0), r.memory.max(0), r.storage.max(0), r.bandwidth.max(0))
}

impl ReturnOrderLock {
    /// Computes the rollback target for refunding `order` from the current
    /// ceiling `hard` and expiry.
    pub fn for_order(
        order: &BillingOrder,
        hard: BuyResource,
        expire_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ReturnOrderLock {
        let (resource, time) = match order.buy_mode() {
            Some(BuyMode::Base) => (floor_zero(hard.sub(&order.buy_resource())), expire_time.map(|_| now)),
            Some(BuyMode::Expand) => (floor_zero(hard.sub(&order.buy_resource())), expire_time),
            Some(BuyMode::Renew) => (hard, expire_time.map(|t| t - Duration::hours(order.hours()))),
            None => (hard, expire_time),
        };
        ReturnOrderLock {
            current_time: time.map(|t| t.timestamp()).unwrap_or(0),
            cpu: resource.cpu,
            memory: resource.memory,
            storage: resource.storage,
            bandwidth: resource.bandwidth,
            order_sn: order.order_sn.clone(),
            buy_mode: order.buy_mode.clone(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn buy_resource(&self) -> BuyResource {
        BuyResource::new(self.cpu, self.memory, self.storage, self.bandwidth)
    }

    pub fn resource(&self) -> Resource {
        self.buy_resource().to_resource()
    }

    pub fn expire_time(&self) -> Option<DateTime<Utc>> {
        if self.current_time <= 0 {
            return None;
        }
        Utc.timestamp_opt(self.current_time, 0).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(mode: &str, hour: &str) -> BillingOrder {
        BillingOrder {
            order_sn: "SN".into(),
            buy_mode: mode.into(),
            hour: hour.into(),
            cpu: 1,
            memory: 2,
            storage: 10,
            bandwidth: 0,
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn base_refund_drops_the_bundle_and_expires_now() {
        let expiry = now() + Duration::hours(100);
        let lock = ReturnOrderLock::for_order(&order("base", "720"), BuyResource::new(2, 4, 10, 5), Some(expiry), now());
        assert_eq!(lock.buy_resource(), BuyResource::new(1, 2, 0, 5));
        assert_eq!(lock.expire_time(), Some(now()));
    }

    #[test]
    fn expand_refund_keeps_expiry() {
        let expiry = now() + Duration::hours(100);
        let lock = ReturnOrderLock::for_order(&order("expand", "0"), BuyResource::new(2, 4, 20, 5), Some(expiry), now());
        assert_eq!(lock.buy_resource(), BuyResource::new(1, 2, 10, 5));
        assert_eq!(lock.expire_time(), Some(expiry));
    }

    #[test]
    fn renew_refund_rewinds_expiry() {
        let expiry = now() + Duration::hours(800);
        let lock = ReturnOrderLock::for_order(&order("renew", "720.00"), BuyResource::new(2, 4, 20, 5), Some(expiry), now());
        assert_eq!(lock.buy_resource(), BuyResource::new(2, 4, 20, 5));
        assert_eq!(lock.expire_time(), Some(now() + Duration::hours(80)));
    }

    #[test]
    fn no_expiry_locks_zero_time() {
        let lock = ReturnOrderLock::for_order(&order("base", "720"), BuyResource::new(2, 4, 10, 0), None, now());
        assert_eq!(lock.current_time, 0);
        assert_eq!(lock.expire_time(), None);
    }

    #[test]
    fn reads_pascal_case_locks() {
        let lock = ReturnOrderLock::parse(r#"{"CurrentTime":1717200000,"Cpu":2,"Memory":4,"Storage":10,"Bandwidth":1,"OrderSn":"X","BuyMode":"base"}"#).unwrap();
        assert_eq!(lock.buy_resource(), BuyResource::new(2, 4, 10, 1));
        assert_eq!(lock.order_sn, "X");
        let json = lock.to_json().unwrap();
        assert!(json.contains(r#""currentTime":1717200000"#));
    }
}

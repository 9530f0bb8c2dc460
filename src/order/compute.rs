//! Pricing of base, renew and expand purchases against a cost table.

use super::billing::Coupon;
use crate::error::PreconditionError;
use crate::resource::{BuyResource, UnitQuantity, HOURS_PER_MONTH};
use crate::tenant::cost::Cost;
use crate::tenant::order_state::BuyMode;
use bigdecimal::{BigDecimal, RoundingMode};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Full price, the discount used when nothing else applies.
pub const NO_DISCOUNT: i64 = 100;

fn decimal(v: f64) -> BigDecimal {
    BigDecimal::from_str(&v.to_string()).unwrap_or_default()
}

/// Prices are quoted to the cent, without trailing zeros.
pub fn format_price(price: &BigDecimal) -> String {
    let s = price.with_scale_round(2, RoundingMode::HalfUp).to_string();
    match s.find('.') {
        Some(_) => s.trim_end_matches('0').trim_end_matches('.').to_string(),
        None => s,
    }
}

#[derive(Clone, Debug)]
pub struct OrderCompute<'a> {
    resource: BuyResource,
    quantity: UnitQuantity,
    cost: &'a Cost,
    coupon: Option<Coupon>,
}

impl<'a> OrderCompute<'a> {
    pub fn new(resource: BuyResource, quantity: UnitQuantity, cost: &'a Cost) -> Self {
        OrderCompute { resource, quantity, cost, coupon: None }
    }

    pub fn resource(&self) -> &BuyResource {
        &self.resource
    }

    pub fn quantity(&self) -> &UnitQuantity {
        &self.quantity
    }

    pub fn with_resource(self, resource: BuyResource) -> Self {
        OrderCompute { resource, ..self }
    }

    pub fn with_quantity(self, quantity: UnitQuantity) -> Self {
        OrderCompute { quantity, ..self }
    }

    pub fn with_coupon(self, coupon: Option<Coupon>) -> Self {
        OrderCompute { coupon, ..self }
    }

    /// Monthly price of the bundle.
    pub fn unit_price(&self) -> BigDecimal {
        let rs = &self.resource;
        decimal(self.cost.cpu) * BigDecimal::from(rs.cpu)
            + decimal(self.cost.memory) * BigDecimal::from(rs.memory)
            + decimal(self.cost.storage) * BigDecimal::from(rs.storage)
            + decimal(self.cost.bandwidth) * BigDecimal::from(rs.bandwidth)
    }

    pub fn origin_price(&self) -> BigDecimal {
        self.unit_price() * decimal(self.quantity.months())
    }

    /// A coupon applies only to exactly the bundle and period it was issued for.
    pub fn is_coupon_match(&self) -> bool {
        match &self.coupon {
            Some(c) => c.buy_resource() == self.resource && c.unit_quantity() == self.quantity,
            None => false,
        }
    }

    fn matching_packages(&self) -> impl Iterator<Item = &crate::tenant::cost::Package> {
        self.cost.packages.iter().filter(move |p| p.matches(&self.quantity))
    }

    /// The bundle is given away for this period on first purchase.
    pub fn is_give_in_base(&self) -> bool {
        self.matching_packages()
            .flat_map(|p| p.items.iter())
            .any(|item| item.matches(&self.resource) && item.is_give)
    }

    /// Discount percentage for the purchase. An exact bundle match wins over
    /// the package-wide discount; 0 and 100 mean no discount and never stop
    /// the search. Expansions are never discounted.
    pub fn discount(&self, mode: BuyMode) -> i64 {
        let pick = |new: i64, renew: i64| match mode {
            BuyMode::Base => Some(new),
            BuyMode::Renew => Some(renew),
            BuyMode::Expand => None,
        };
        let is_discount = |d: &i64| *d != 0 && *d != NO_DISCOUNT;
        for package in self.matching_packages() {
            let item_discount = package
                .items
                .iter()
                .filter(|item| item.matches(&self.resource))
                .filter_map(|item| pick(item.discount_new, item.discount_renew))
                .find(is_discount);
            if let Some(d) = item_discount {
                return d;
            }
            if let Some(d) = pick(package.discount_new, package.discount_renew).filter(is_discount) {
                return d;
            }
        }
        NO_DISCOUNT
    }

    /// Final price: free for a gifted base purchase, else the coupon if it
    /// matches, else the package discount.
    pub fn discount_price(&self, mode: BuyMode) -> BigDecimal {
        if mode == BuyMode::Base && self.is_give_in_base() {
            return BigDecimal::from(0);
        }
        if let Some(coupon) = self.coupon.as_ref().filter(|_| self.is_coupon_match()) {
            return self.origin_price() * BigDecimal::from(coupon.clamped_discount()) / BigDecimal::from(100);
        }
        self.discount_price_not_give(mode)
    }

    pub fn discount_price_not_give(&self, mode: BuyMode) -> BigDecimal {
        self.origin_price() * BigDecimal::from(self.discount(mode)) / BigDecimal::from(100)
    }

    /// Price of adding the bundle for the rest of the current period,
    /// prorated by the months left until `expire_time`.
    pub fn expand_price(
        &self,
        expire_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<BigDecimal, PreconditionError> {
        let expire_time = expire_time.ok_or(PreconditionError::ExpandWithoutPurchase)?;
        if expire_time < now {
            return Err(PreconditionError::Expired);
        }
        let hours = (expire_time - now).num_seconds() as f64 / 3600.0;
        let months = decimal(hours) / BigDecimal::from(HOURS_PER_MONTH);
        Ok(self.unit_price() * months)
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        self.resource.to_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn cost() -> Cost {
        Cost::parse(
            r#"{"cpu":10,"memory":5,"storage":"1","bandwidth":0,"packageConfig":[
                {"time":1,"timeUnit":"month","discount_new":90,"discount_renew":100,"config":[
                    {"c":2,"m":4,"s":0,"bw":0,"dc_new":80,"dc_renew":0,"online":true},
                    {"c":1,"m":1,"s":0,"bw":0,"dc_new":0,"dc_renew":0,"online":true,"give":true}
                ]},
                {"time":12,"timeUnit":"month","discount_new":"70","discount_renew":"75","config":[]}
            ]}"#,
        )
        .unwrap()
    }

    fn coupon(cpu: i64, memory: i64, quantity: i64, discount: i64) -> Coupon {
        Coupon {
            code: "C".into(),
            discount,
            can_use: true,
            cpu,
            memory,
            time_unit: "month".into(),
            time_quantity: quantity,
            ..Default::default()
        }
    }

    #[test]
    fn package_item_discount_prices_base_purchase() {
        let cost = cost();
        let c = OrderCompute::new(BuyResource::new(2, 4, 0, 0), UnitQuantity::new(1, "month"), &cost);
        assert_eq!(c.unit_price(), BigDecimal::from(40));
        assert_eq!(c.discount(BuyMode::Base), 80);
        assert_eq!(format_price(&c.discount_price(BuyMode::Base)), "32");
    }

    #[test]
    fn zero_item_discount_falls_back_to_package() {
        let cost = cost();
        let c = OrderCompute::new(BuyResource::new(2, 4, 0, 0), UnitQuantity::new(1, "month"), &cost);
        // item renew discount 0, package renew 100: both mean full price
        assert_eq!(c.discount(BuyMode::Renew), NO_DISCOUNT);
        let c = c.with_resource(BuyResource::new(3, 3, 0, 0));
        assert_eq!(c.discount(BuyMode::Base), 90);
        let c = c.with_quantity(UnitQuantity::new(12, "month"));
        assert_eq!(c.discount(BuyMode::Renew), 75);
        assert_eq!(c.discount(BuyMode::Expand), NO_DISCOUNT);
        let c = c.with_quantity(UnitQuantity::new(2, "month"));
        assert_eq!(c.discount(BuyMode::Base), NO_DISCOUNT);
    }

    #[test]
    fn gifts_are_free_only_on_base() {
        let cost = cost();
        let c = OrderCompute::new(BuyResource::new(1, 1, 0, 0), UnitQuantity::new(1, "month"), &cost);
        assert!(c.is_give_in_base());
        assert_eq!(c.discount_price(BuyMode::Base), BigDecimal::from(0));
        assert_eq!(format_price(&c.discount_price(BuyMode::Renew)), "15");
    }

    #[test]
    fn coupon_needs_exact_match() {
        let cost = cost();
        let base = OrderCompute::new(BuyResource::new(2, 4, 0, 0), UnitQuantity::new(1, "month"), &cost);
        let c = base.clone().with_coupon(Some(coupon(2, 4, 1, 50)));
        assert!(c.is_coupon_match());
        assert_eq!(format_price(&c.discount_price(BuyMode::Base)), "20");

        let c = base.with_coupon(Some(coupon(2, 4, 3, 50)));
        assert!(!c.is_coupon_match());
        assert_eq!(format_price(&c.discount_price(BuyMode::Base)), "32");
    }

    #[test]
    fn day_quantities_are_fractions_of_a_month() {
        let cost = cost();
        let c = OrderCompute::new(BuyResource::new(3, 0, 0, 0), UnitQuantity::new(15, "day"), &cost);
        assert_eq!(format_price(&c.origin_price()), "15");
    }

    #[test]
    fn expansion_is_prorated_to_expiry() {
        let cost = cost();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let c = OrderCompute::new(BuyResource::new(1, 0, 0, 0), UnitQuantity::default(), &cost);
        let price = c.expand_price(Some(now + Duration::hours(360)), now).unwrap();
        assert_eq!(format_price(&price), "5");
        assert_eq!(c.expand_price(None, now).unwrap_err(), PreconditionError::ExpandWithoutPurchase);
        assert_eq!(
            c.expand_price(Some(now - Duration::hours(1)), now).unwrap_err(),
            PreconditionError::Expired
        );
    }
}

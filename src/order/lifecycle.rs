//! Order API: purchase, payment notification and the two-phase refund.

use super::billing::{BillingApi, CouponStatus, PayResult};
use super::compute::{format_price, OrderCompute};
use crate::error::{Error, PreconditionError, Result};
use crate::labels::*;
use crate::resource::{BuyResource, UnitQuantity};
use crate::store::{load_tenant, update_tenant, TenantStore};
use crate::tenant::order_state::{BuyMode, Orderable};
use crate::tenant::time::TimeBound;
use crate::tenant::TenantRecord;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

/// Delay before a free order notifies itself, so the tenant write that
/// recorded it has landed.
const SELF_NOTIFY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default)]
pub struct BaseOrderRequest {
    pub resource: BuyResource,
    pub quantity: UnitQuantity,
    pub coupon_code: String,
}

#[derive(Clone, Debug, Default)]
pub struct RenewOrderRequest {
    pub quantity: UnitQuantity,
    pub coupon_code: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExpandOrderRequest {
    /// The total bundle wanted after expansion.
    pub resource: BuyResource,
}

fn order_compute(tenant: &TenantRecord) -> std::result::Result<OrderCompute<'_>, PreconditionError> {
    let cost = tenant.cost().ok_or(PreconditionError::NoCost)?;
    let quota = tenant.quota().ok_or(PreconditionError::NoQuota)?;
    Ok(OrderCompute::new(quota.hard_buy_resource(), quota.default_unit_quantity(), cost))
}

#[derive(Clone)]
pub struct OrderLifecycle {
    billing: Arc<dyn BillingApi>,
    store: Arc<dyn TenantStore>,
}

impl OrderLifecycle {
    pub fn new(billing: Arc<dyn BillingApi>, store: Arc<dyn TenantStore>) -> Self {
        OrderLifecycle { billing, store }
    }

    async fn tenant(&self, name: &str) -> Result<TenantRecord> {
        load_tenant(self.store.as_ref(), name).await
    }

    /// Buying is refused while the billing console still has an unsettled
    /// order for the tenant.
    pub async fn check_can_buy(&self, name: &str) -> Result<()> {
        let last = self.billing.last_paid_order(name).await?;
        if !last.can_buy {
            return Err(PreconditionError::Billing(last.error).into());
        }
        Ok(())
    }

    /// Fetches a coupon when it exists, is usable and belongs to the tenant's
    /// policy. Lookup failures only drop the coupon.
    async fn usable_coupon(&self, code: &str, tenant: &TenantRecord) -> Option<super::billing::Coupon> {
        if code.is_empty() {
            return None;
        }
        match self.billing.coupon(code).await {
            Ok(c) if c.can_use && c.groupname == tenant.policy() => Some(c),
            Ok(_) => None,
            Err(e) => {
                error!(code, "Failed to get coupon: {}", e);
                None
            }
        }
    }

    pub async fn create_base_order(&self, name: &str, req: &BaseOrderRequest) -> Result<PayResult> {
        self.check_can_buy(name).await?;
        let tenant = self.tenant(name).await?;
        tenant.can_create_base_order_error()?;
        if req.quantity.is_empty() {
            return Err(PreconditionError::EmptyDuration.into());
        }
        let compute = order_compute(&tenant)?;
        if req.resource.less(compute.resource()) {
            return Err(PreconditionError::BelowMinimum.into());
        }
        let mut compute = compute.with_resource(req.resource).with_quantity(req.quantity.clone());
        if !compute.is_give_in_base() {
            compute = compute.with_coupon(self.usable_coupon(&req.coupon_code, &tenant).await);
        }
        let coupon_used = compute.is_coupon_match();
        let mut params = compute.to_params();
        params.push(("buymode".into(), BuyMode::Base.to_string()));
        params.push(("price".into(), format_price(&compute.discount_price(BuyMode::Base))));
        params.push(("hour".into(), format!("{:.2}", req.quantity.hours())));
        self.submit_with_coupon(name, BuyMode::Base, params, &req.coupon_code, coupon_used).await
    }

    pub async fn create_renew_order(&self, name: &str, req: &RenewOrderRequest) -> Result<PayResult> {
        self.check_can_buy(name).await?;
        let tenant = self.tenant(name).await?;
        tenant.can_renew_error()?;
        if req.quantity.is_empty() {
            return Err(PreconditionError::EmptyDuration.into());
        }
        let compute = order_compute(&tenant)?
            .with_quantity(req.quantity.clone())
            .with_coupon(self.usable_coupon(&req.coupon_code, &tenant).await);
        let coupon_used = compute.is_coupon_match();
        let mut params = compute.to_params();
        params.push(("buymode".into(), BuyMode::Renew.to_string()));
        params.push(("price".into(), format_price(&compute.discount_price(BuyMode::Renew))));
        params.push(("hour".into(), format!("{:.2}", req.quantity.hours())));
        self.submit_with_coupon(name, BuyMode::Renew, params, &req.coupon_code, coupon_used).await
    }

    /// Expansion buys the difference to the requested total for the time
    /// left on the current period.
    pub async fn create_expand_order(&self, name: &str, req: &ExpandOrderRequest) -> Result<PayResult> {
        self.check_can_buy(name).await?;
        let now = Utc::now();
        let tenant = self.tenant(name).await?;
        tenant.can_expand_error(now)?;
        if req.resource.is_empty() {
            return Err(PreconditionError::NothingToBuy.into());
        }
        let compute = order_compute(&tenant)?;
        if req.resource.less(compute.resource()) {
            return Err(PreconditionError::BelowCurrent.into());
        }
        let diff = req.resource.sub(compute.resource());
        if !diff.is_valid() {
            return Err(PreconditionError::InvalidResource.into());
        }
        let compute = compute.with_resource(diff);
        let expire_time = tenant.expire_time();
        let price = compute.expand_price(expire_time, now)?;
        let hours = expire_time.map(|t| (t - now).num_hours()).unwrap_or(0);
        let mut params = compute.to_params();
        params.push(("buymode".into(), BuyMode::Expand.to_string()));
        params.push(("price".into(), format_price(&price)));
        params.push(("hour".into(), hours.to_string()));
        self.submit(name, BuyMode::Expand, params).await
    }

    /// Locks the coupon before the order exists and consumes it against the
    /// new serial afterwards; either failure fails the purchase.
    async fn submit_with_coupon(
        &self,
        name: &str,
        mode: BuyMode,
        params: Vec<(String, String)>,
        coupon_code: &str,
        coupon_used: bool,
    ) -> Result<PayResult> {
        if coupon_used {
            if let Err(e) = self.billing.update_coupon(coupon_code, CouponStatus::Lock, "").await {
                error!(code = coupon_code, "Failed to lock coupon: {}", e);
                return Err(PreconditionError::CouponLock.into());
            }
        }
        let result = self.submit(name, mode, params).await?;
        if coupon_used {
            if let Err(e) = self.billing.update_coupon(coupon_code, CouponStatus::Used, &result.order_sn).await {
                error!(code = coupon_code, "Failed to consume coupon: {}", e);
                return Err(PreconditionError::CouponConsume.into());
            }
        }
        Ok(result)
    }

    async fn submit(&self, name: &str, mode: BuyMode, params: Vec<(String, String)>) -> Result<PayResult> {
        let product_id = self.billing.prepare_product().await?;
        let result = self.billing.create_order(name, product_id, params).await?;
        info!(tenant = %name, order_sn = %result.order_sn, mode = %mode, need_pay = result.need_pay, "order created");
        update_tenant(self.store.as_ref(), name, |t| {
            t.set_order(mode, &result.order_sn);
            Ok(())
        })
        .await?;
        if !result.need_pay {
            let this = self.clone();
            let name = name.to_string();
            let sn = result.order_sn.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SELF_NOTIFY_DELAY).await;
                if let Err(e) = this.notify_order(&name, &sn).await {
                    warn!(tenant = %name, order_sn = %sn, "Failed to notify free order: {}", e);
                }
            });
        }
        Ok(result)
    }

    /// Applies the billing console's view of order `sn` to the tenant. Safe
    /// to repeat: an order already applied is left alone.
    pub async fn notify_order(&self, name: &str, sn: &str) -> Result<TenantRecord> {
        info!(tenant = %name, order_sn = %sn, "order notification");
        let order = self.billing.order_info(sn).await.map_err(|e| {
            warn!(tenant = %name, order_sn = %sn, "Failed to get order info: {}", e);
            Error::from(e)
        })?;
        let now = Utc::now();
        update_tenant(self.store.as_ref(), name, |t| {
            if t.set_order_status(&order, now) {
                info!(tenant = %t.name, order_sn = %order.order_sn, mode = %order.buy_mode, "payment applied");
            }
            Ok(())
        })
        .await
    }

    /// Re-notifies every order recorded on the tenant.
    pub async fn refresh(&self, name: &str) -> Result<()> {
        let tenant = self.tenant(name).await?;
        for sn in tenant.orders.serials() {
            self.notify_order(name, &sn).await?;
        }
        Ok(())
    }

    /// Second phase of a refund. Confirms the refund with the billing
    /// console if it has not been confirmed yet, then applies the lock.
    /// The lock stays in place on any failure so the call can be repeated.
    pub async fn process_return_order(&self, name: &str) -> Result<bool> {
        let tenant = self.tenant(name).await?;
        if !tenant.is_cluster_user() {
            return Ok(false);
        }
        let lock = match tenant.return_lock()? {
            Some(lock) => lock,
            None => return Ok(false),
        };
        let order = self.billing.find_order(name, &lock.order_sn).await?;
        if order.return_at.is_empty() {
            self.billing.return_order_finish(name, &lock.order_sn).await?;
        }
        update_tenant(self.store.as_ref(), name, |t| t.apply_return_order().map(|_| ())).await?;
        info!(tenant = %name, order_sn = %lock.order_sn, "return order applied");
        Ok(true)
    }

    /// First phase of a refund: locks the last refunded order the billing
    /// console reports, then applies it when `process` is set.
    pub async fn process_return_last_order(&self, name: &str, process: bool) -> Result<()> {
        let tenant = self.tenant(name).await?;
        if !tenant.is_cluster_user() {
            return Ok(());
        }
        let last = self.billing.last_return_order(name).await?;
        if let (true, Some(order)) = (last.has_order, last.order) {
            info!(tenant = %name, order_sn = %order.order_sn, "locking return order");
            let now = Utc::now();
            update_tenant(self.store.as_ref(), name, |t| t.lock_return_order(&order, now)).await?;
        }
        if process {
            self.process_return_order(name).await?;
        }
        Ok(())
    }

    /// Finishes every refund left half done, e.g. by a restart between
    /// locking and applying.
    pub async fn recover_return_orders(&self) -> Result<usize> {
        let selector = format!("{}={}", USER_MODE, USER_MODE_CLUSTER);
        let mut recovered = 0;
        for sa in self.store.list(&selector).await? {
            let tenant = TenantRecord::from_service_account(&sa);
            if !tenant.has_return_lock() {
                continue;
            }
            match self.process_return_order(&tenant.name).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => warn!(tenant = %tenant.name, "Failed to recover return order: {}", e),
            }
        }
        Ok(recovered)
    }
}

use super::over_mode::{OverMode, Overselling};
use super::time::TimeBound;
use crate::error::PreconditionError;
use crate::order::billing::BillingOrder;
use crate::resource::Resource;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuyMode {
    Base,
    Renew,
    Expand,
}

impl BuyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuyMode::Base => "base",
            BuyMode::Renew => "renew",
            BuyMode::Expand => "expand",
        }
    }

    pub fn parse(s: &str) -> Option<BuyMode> {
        match s {
            "base" => Some(BuyMode::Base),
            "renew" => Some(BuyMode::Renew),
            "expand" => Some(BuyMode::Expand),
            _ => None,
        }
    }
}

impl fmt::Display for BuyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderStatus {
    Wait,
    Paid,
    Return,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Wait => "wait",
            OrderStatus::Paid => "paid",
            OrderStatus::Return => "return",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "wait" => Some(OrderStatus::Wait),
            "paid" => Some(OrderStatus::Paid),
            "return" => Some(OrderStatus::Return),
            _ => None,
        }
    }
}

/// Serial and payment status of the latest order of one buy mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderSlot {
    pub sn: String,
    pub status: Option<OrderStatus>,
}

impl OrderSlot {
    pub fn is_paid(&self) -> bool {
        self.status == Some(OrderStatus::Paid)
    }

    pub fn clear(&mut self) {
        self.sn.clear();
        self.status = None;
    }

    /// True when `sn` is this slot's order and it has not been applied yet.
    fn accepts_payment(&self, sn: &str) -> bool {
        self.sn == sn && !self.is_paid()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderState {
    pub base: OrderSlot,
    pub renew: OrderSlot,
    pub expand: OrderSlot,
    /// Raw `base-order-pass` override. Owned by operators, never written.
    pub base_pass: Option<String>,
}

impl OrderState {
    pub fn slot(&self, mode: BuyMode) -> &OrderSlot {
        match mode {
            BuyMode::Base => &self.base,
            BuyMode::Renew => &self.renew,
            BuyMode::Expand => &self.expand,
        }
    }

    pub fn slot_mut(&mut self, mode: BuyMode) -> &mut OrderSlot {
        match mode {
            BuyMode::Base => &mut self.base,
            BuyMode::Renew => &mut self.renew,
            BuyMode::Expand => &mut self.expand,
        }
    }

    /// Non-empty serials in base, renew, expand order.
    pub fn serials(&self) -> Vec<String> {
        [&self.base, &self.renew, &self.expand]
            .iter()
            .filter(|s| !s.sn.is_empty())
            .map(|s| s.sn.clone())
            .collect()
    }
}

/// Purchase preconditions and payment application.
pub trait Orderable: TimeBound + Overselling {
    fn order_state(&self) -> &OrderState;
    fn order_state_mut(&mut self) -> &mut OrderState;
    fn has_cost(&self) -> bool;
    /// Pins the quota so later policy changes no longer overwrite it.
    fn lock_quota(&mut self);

    fn need_create_order(&self) -> bool {
        let orders = self.order_state();
        if let Some(pass) = &orders.base_pass {
            return pass == "false";
        }
        self.has_cost() && !orders.base.is_paid()
    }

    fn can_create_base_order_error(&self) -> Result<(), PreconditionError> {
        let orders = self.order_state();
        if orders.base_pass.as_deref() == Some("false") {
            return Ok(());
        }
        if !self.has_cost() {
            return Err(PreconditionError::NoCost);
        }
        if orders.base.is_paid() {
            return Err(PreconditionError::AlreadyPaid);
        }
        Ok(())
    }

    fn can_renew_error(&self) -> Result<(), PreconditionError> {
        if !self.has_cost() {
            return Err(PreconditionError::NoCost);
        }
        if !self.has_expire_time() {
            return Err(PreconditionError::NotPurchased);
        }
        Ok(())
    }

    /// Renewal is mandatory once a renewable tenant has lapsed.
    fn need_renew(&self, now: DateTime<Utc>) -> bool {
        if self.can_renew_error().is_ok() {
            return false;
        }
        matches!(self.expire_time(), Some(t) if t < now)
    }

    fn can_expand_error(&self, now: DateTime<Utc>) -> Result<(), PreconditionError> {
        if !self.is_over_selling_success() {
            return Err(PreconditionError::OversellingPending);
        }
        if !self.has_cost() {
            return Err(PreconditionError::NoCost);
        }
        match self.expire_time() {
            None => Err(PreconditionError::ExpandWithoutPurchase),
            Some(t) if t > now => Ok(()),
            Some(_) => Err(PreconditionError::Expired),
        }
    }

    /// Records a freshly created order as awaiting payment.
    fn set_order(&mut self, mode: BuyMode, sn: &str) {
        let slot = self.order_state_mut().slot_mut(mode);
        slot.sn = sn.to_string();
        slot.status = Some(OrderStatus::Wait);
    }

    /// Applies a paid order. Returns false when nothing changed: the order
    /// is unpaid, belongs to another serial or was already applied.
    fn set_order_status(&mut self, order: &BillingOrder, now: DateTime<Utc>) -> bool {
        if !order.is_paid() {
            return false;
        }
        let mode = match order.buy_mode() {
            Some(mode) => mode,
            None => return false,
        };
        if !self.order_state().slot(mode).accepts_payment(&order.order_sn) {
            return false;
        }
        self.order_state_mut().slot_mut(mode).status = Some(OrderStatus::Paid);
        let granted: Resource = order.buy_resource().to_resource();
        match mode {
            BuyMode::Base => {
                self.change_expire_time(order.hours(), now);
                let state = self.overselling_state_mut();
                state.over_base_resource = Some(granted);
                state.mode = Some(OverMode::Wait);
                self.lock_quota();
            }
            BuyMode::Renew => self.change_expire_time(order.hours(), now),
            BuyMode::Expand => {
                let state = self.overselling_state_mut();
                state.over_resource = Some(granted);
                state.mode = Some(OverMode::Wait);
            }
        }
        true
    }
}

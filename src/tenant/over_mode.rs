use super::limit_range_quota::LimitRangeQuota;
use crate::resource::Resource;

/// Admission state of the tenant's pending grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverMode {
    /// A paid grant waits for a capacity check.
    Wait,
    /// The last check failed.
    NoResource,
    /// The grant is part of the hard quota.
    Success,
}

impl OverMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverMode::Wait => "wait",
            OverMode::NoResource => "no-resource",
            OverMode::Success => "success",
        }
    }

    pub fn parse(s: &str) -> Option<OverMode> {
        match s {
            "wait" => Some(OverMode::Wait),
            "no-resource" => Some(OverMode::NoResource),
            "success" => Some(OverMode::Success),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OversellingState {
    pub mode: Option<OverMode>,
    /// Pending expansion delta.
    pub over_resource: Option<Resource>,
    /// Ceiling bought with the base order.
    pub over_base_resource: Option<Resource>,
}

pub trait Overselling {
    fn overselling_state(&self) -> &OversellingState;
    fn overselling_state_mut(&mut self) -> &mut OversellingState;
    /// The latest expand order is paid.
    fn is_expand(&self) -> bool;
    /// Hard quota the grant folds into; marks it as changed.
    fn hard_quota_mut(&mut self) -> &mut LimitRangeQuota;

    fn is_over_selling_wait(&self) -> bool {
        self.overselling_state().mode == Some(OverMode::Wait)
    }

    fn is_over_selling_success(&self) -> bool {
        self.overselling_state().mode == Some(OverMode::Success)
    }

    fn is_over_selling_no_resource(&self) -> bool {
        self.overselling_state().mode == Some(OverMode::NoResource)
    }

    fn can_over_selling_check(&self) -> bool {
        self.is_over_selling_wait() || self.is_over_selling_no_resource()
    }

    /// Provisioning is blocked until a base grant passes admission.
    /// Expansions are admitted lazily and never block.
    fn need_over_selling_check(&self) -> bool {
        self.can_over_selling_check() && !self.is_expand()
    }

    /// The grant admission has to weigh: the expansion delta once an expand
    /// order is paid, else the base ceiling.
    fn over_resource(&self) -> Resource {
        let state = self.overselling_state();
        let pending = if self.is_expand() {
            state.over_resource
        } else {
            state.over_base_resource
        };
        pending.unwrap_or_default()
    }

    /// Records an admission outcome. A success folds the pending grant into
    /// the hard quota exactly once; repeating it is a no-op.
    fn set_over_mode(&mut self, ok: bool) {
        if !ok {
            self.overselling_state_mut().mode = Some(OverMode::NoResource);
            return;
        }
        if self.is_over_selling_success() {
            return;
        }
        let expand = self.is_expand();
        let state = self.overselling_state_mut();
        state.mode = Some(OverMode::Success);
        if expand {
            let delta = state.over_resource.take().unwrap_or_default();
            self.hard_quota_mut().expand(&delta);
        } else if let Some(base) = state.over_base_resource {
            self.hard_quota_mut().reset_hard(&base);
        }
    }
}

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::str::FromStr;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const PENDING_RECYCLE_WINDOW_HOURS: i64 = 72;

pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), TIME_FORMAT).ok().map(|t| t.and_utc())
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Expiry and recycle deadlines of a tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeState {
    pub expire_time: Option<DateTime<Utc>>,
    pub pending_recycle_time: Option<DateTime<Utc>>,
}

/// Time-based rules shared by everything that carries a `TimeState`.
pub trait TimeBound {
    fn time_state(&self) -> &TimeState;
    fn time_state_mut(&mut self) -> &mut TimeState;

    fn expire_time(&self) -> Option<DateTime<Utc>> {
        self.time_state().expire_time
    }

    fn has_expire_time(&self) -> bool {
        self.time_state().expire_time.is_some()
    }

    /// A tenant without an expiry never expires.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.time_state().expire_time, Some(t) if now > t)
    }

    /// Extends the expiry by `hours`. A lapsed expiry restarts from `now`,
    /// so no time is credited for the gap.
    fn change_expire_time(&mut self, hours: i64, now: DateTime<Utc>) {
        let state = self.time_state_mut();
        let base = match state.expire_time {
            Some(t) if t > now => t,
            _ => now,
        };
        state.expire_time = Some(base + Duration::hours(hours));
    }

    /// Stored deadline, else expiry plus the recycle window.
    fn pending_recycle_time(&self) -> Option<DateTime<Utc>> {
        let state = self.time_state();
        state
            .pending_recycle_time
            .or_else(|| state.expire_time.map(|t| t + Duration::hours(PENDING_RECYCLE_WINDOW_HOURS)))
    }

    /// Stamps the recycle deadline once; later calls keep the first value.
    fn set_pending_recycle_time(&mut self, now: DateTime<Utc>) {
        let state = self.time_state_mut();
        if state.pending_recycle_time.is_some() {
            return;
        }
        let base = state.expire_time.unwrap_or(now);
        state.pending_recycle_time = Some(base + Duration::hours(PENDING_RECYCLE_WINDOW_HOURS));
    }

    fn clear_pending_recycle_time(&mut self) {
        self.time_state_mut().pending_recycle_time = None;
    }

    fn is_pending_recycle_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.pending_recycle_time(), Some(t) if now > t)
    }

    /// Months left until expiry, zero when unset or lapsed.
    fn remaining_months(&self, now: DateTime<Utc>) -> BigDecimal {
        match self.time_state().expire_time {
            Some(t) if t > now => {
                let hours = (t - now).num_seconds() as f64 / 3600.0;
                let hours = BigDecimal::from_str(&hours.to_string()).unwrap_or_default();
                hours / BigDecimal::from(30 * 24)
            }
            _ => BigDecimal::from(0),
        }
    }
}

impl TimeBound for TimeState {
    fn time_state(&self) -> &TimeState {
        self
    }

    fn time_state_mut(&mut self) -> &mut TimeState {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn time_format_round_trips() {
        let t = at(13);
        assert_eq!(format_time(&t), "2024-05-01 13:00:00");
        assert_eq!(parse_time("2024-05-01 13:00:00"), Some(t));
        assert_eq!(parse_time("yesterday"), None);
    }

    #[test]
    fn change_expire_time_from_nothing_starts_now() {
        let mut s = TimeState::default();
        s.change_expire_time(24, at(0));
        assert_eq!(s.expire_time, Some(at(0) + Duration::hours(24)));
    }

    #[test]
    fn change_expire_time_extends_future_expiry() {
        let mut s = TimeState { expire_time: Some(at(10)), ..Default::default() };
        s.change_expire_time(5, at(0));
        assert_eq!(s.expire_time, Some(at(15)));
    }

    #[test]
    fn change_expire_time_clamps_lapsed_expiry_to_now() {
        let mut s = TimeState { expire_time: Some(at(1)), ..Default::default() };
        s.change_expire_time(5, at(10));
        assert_eq!(s.expire_time, Some(at(15)));
    }

    #[test]
    fn pending_recycle_is_stamped_once() {
        let mut s = TimeState { expire_time: Some(at(0)), ..Default::default() };
        assert_eq!(s.pending_recycle_time(), Some(at(0) + Duration::hours(72)));
        s.set_pending_recycle_time(at(5));
        let first = s.pending_recycle_time;
        s.expire_time = Some(at(8));
        s.set_pending_recycle_time(at(9));
        assert_eq!(s.pending_recycle_time, first);
        assert!(!s.is_pending_recycle_expired(at(9)));
        assert!(s.is_pending_recycle_expired(at(0) + Duration::hours(73)));
    }

    #[test]
    fn no_expiry_means_never_expired() {
        let s = TimeState::default();
        assert!(!s.is_expired(at(23)));
        assert!(!s.is_pending_recycle_expired(at(23)));
        assert_eq!(s.remaining_months(at(0)), BigDecimal::from(0));
    }

    #[test]
    fn remaining_months_prorates_hours() {
        let s = TimeState { expire_time: Some(at(0) + Duration::hours(720)), ..Default::default() };
        assert_eq!(s.remaining_months(at(0)), BigDecimal::from(1));
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::metrics_consts::{ALERTS_SUPPRESSED, ALERT_RECOVERIES};
use crate::variant::WarningEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertPolicy {
    /// A device alerts once for the lifetime of the process.
    #[default]
    OneShot,
    /// A recovery record re-arms the device for its next episode.
    ResetOnRecovery,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAlertPolicyError(String);

impl fmt::Display for ParseAlertPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is not an alert policy, use one_shot or reset_on_recovery",
            self.0
        )
    }
}

impl FromStr for AlertPolicy {
    type Err = ParseAlertPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "one_shot" => Ok(AlertPolicy::OneShot),
            "reset_on_recovery" => Ok(AlertPolicy::ResetOnRecovery),
            _ => Err(ParseAlertPolicyError(s.to_owned())),
        }
    }
}

/// Per-device suppression of repeated alerts.
///
/// The analytics engine emits a warning for every window in which a device is
/// above the threshold, so one shaking episode produces a stream of warnings.
/// Only the first one per device goes out.
#[derive(Debug, Default)]
pub struct AlertGate {
    policy: AlertPolicy,
    notified: HashMap<String, DateTime<Utc>>,
}

impl AlertGate {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            notified: HashMap::new(),
        }
    }

    pub fn policy(&self) -> AlertPolicy {
        self.policy
    }

    /// True the first time `device_id` is seen, false afterwards.
    pub fn should_notify(&mut self, device_id: &str) -> bool {
        self.should_notify_at(device_id, Utc::now())
    }

    pub fn should_notify_at(&mut self, device_id: &str, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.notified.get(device_id) {
            metrics::counter!(ALERTS_SUPPRESSED).increment(1);
            debug!(device_id, last_notified = %last, "alert suppressed");
            return false;
        }

        self.notified.insert(device_id.to_owned(), now);
        true
    }

    /// Re-arms `device_id` under `reset_on_recovery`. Returns whether the device
    /// had an open episode that was cleared.
    pub fn record_recovery(&mut self, device_id: &str) -> bool {
        if self.policy != AlertPolicy::ResetOnRecovery {
            return false;
        }

        let cleared = self.notified.remove(device_id).is_some();
        if cleared {
            metrics::counter!(ALERT_RECOVERIES).increment(1);
            info!(device_id, "device recovered, alert re-armed");
        }
        cleared
    }

    /// Gate decision for one warning record: recoveries never notify.
    pub fn observe(&mut self, warning: &WarningEvent) -> bool {
        if warning.recovered {
            self.record_recovery(&warning.device_id);
            return false;
        }
        self.should_notify(&warning.device_id)
    }

    pub fn last_notified(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.notified.get(device_id).copied()
    }

    /// Devices with an open episode.
    pub fn tracked(&self) -> usize {
        self.notified.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;

    use super::*;

    fn warning(device_id: &str, recovered: bool) -> WarningEvent {
        WarningEvent {
            device_id: device_id.to_owned(),
            warning_acceleration: Decimal::new(15, 1),
            warning_time: NaiveDate::from_ymd_opt(2021, 3, 24)
                .unwrap()
                .and_hms_opt(10, 15, 2)
                .unwrap(),
            recovered,
        }
    }

    #[test]
    fn test_notifies_once_per_device() {
        let mut gate = AlertGate::new(AlertPolicy::OneShot);

        assert!(gate.should_notify("005"));
        for _ in 0..100 {
            assert!(!gate.should_notify("005"));
        }
        assert!(gate.should_notify("007"));
        assert_eq!(gate.tracked(), 2);
    }

    #[test]
    fn test_last_notified_is_first_notification() {
        let mut gate = AlertGate::default();
        let first = Utc.with_ymd_and_hms(2021, 3, 24, 10, 15, 2).unwrap();
        let later = Utc.with_ymd_and_hms(2021, 3, 24, 10, 20, 0).unwrap();

        assert!(gate.should_notify_at("005", first));
        assert!(!gate.should_notify_at("005", later));
        assert_eq!(gate.last_notified("005"), Some(first));
        assert_eq!(gate.last_notified("007"), None);
    }

    #[test]
    fn test_one_shot_ignores_recovery() {
        let mut gate = AlertGate::new(AlertPolicy::OneShot);

        assert!(gate.observe(&warning("005", false)));
        assert!(!gate.observe(&warning("005", true)));
        assert!(!gate.observe(&warning("005", false)));
    }

    #[test]
    fn test_recovery_rearms_device() {
        let mut gate = AlertGate::new(AlertPolicy::ResetOnRecovery);

        assert!(gate.observe(&warning("005", false)));
        assert!(!gate.observe(&warning("005", false)));
        assert!(!gate.observe(&warning("005", true)));
        assert_eq!(gate.tracked(), 0);
        assert!(gate.observe(&warning("005", false)));

        // Recovery of a device that never alerted is a no-op.
        assert!(!gate.record_recovery("007"));
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("one_shot".parse(), Ok(AlertPolicy::OneShot));
        assert_eq!("RESET_ON_RECOVERY".parse(), Ok(AlertPolicy::ResetOnRecovery));
        assert!("forever".parse::<AlertPolicy>().is_err());
    }
}

//! Global fail-safe lock.
//!
//! Once tripped by a telemetry breach the lock refuses every measurement until
//! a support operator clears it. Nothing else writes it: the orchestrator's
//! telemetry step trips it, `clear_fail_safe_lock` resets it.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SafetyCfg;
use crate::status::RawSample;
use crate::util::{read, write};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailSafeLock {
    pub locked: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
}

/// Peak values observed across one raw burst.
///
/// Non-finite readings are tracked separately; `f32::max` would drop them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Telemetry {
    /// Largest absolute voltage on either channel.
    pub max_channel_voltage: f32,
    pub peak_temperature_c: f32,
    pub non_finite_channel: bool,
    pub non_finite_temperature: bool,
}

impl Telemetry {
    pub fn from_burst(burst: &[RawSample]) -> Self {
        burst.iter().fold(
            Telemetry {
                max_channel_voltage: 0.0,
                peak_temperature_c: f32::NEG_INFINITY,
                non_finite_channel: false,
                non_finite_temperature: false,
            },
            |t, s| Telemetry {
                max_channel_voltage: t.max_channel_voltage.max(s.a_v.abs()).max(s.b_v.abs()),
                peak_temperature_c: t.peak_temperature_c.max(s.temperature_c),
                non_finite_channel: t.non_finite_channel
                    || !s.a_v.is_finite()
                    || !s.b_v.is_finite(),
                non_finite_temperature: t.non_finite_temperature || !s.temperature_c.is_finite(),
            },
        )
    }
}

/// Capability proving the caller holds support privileges.
#[derive(Debug)]
pub struct SupportAccess {
    operator: String,
}

impl SupportAccess {
    /// Issued by whatever authenticates support staff; the core only records who.
    pub fn grant(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
        }
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }
}

#[derive(Debug)]
pub struct FailSafeManager {
    lock: RwLock<FailSafeLock>,
    cfg: SafetyCfg,
    evaluations: AtomicU64,
}

impl FailSafeManager {
    pub fn new(cfg: SafetyCfg) -> Self {
        Self {
            lock: RwLock::new(FailSafeLock::default()),
            cfg,
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn is_locked(&self) -> bool {
        read(&self.lock).locked
    }

    pub fn snapshot(&self) -> FailSafeLock {
        read(&self.lock).clone()
    }

    /// Pre-measurement guard: the stored reason when locked.
    pub fn guard(&self) -> Option<String> {
        let l = read(&self.lock);
        l.locked
            .then(|| l.reason.clone().unwrap_or_else(|| "fail-safe locked".into()))
    }

    /// Number of telemetry evaluations performed so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Check burst telemetry; trips the lock on a breach and returns the reason.
    pub(crate) fn evaluate(&self, t: &Telemetry) -> Option<String> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let mut breaches = Vec::new();
        // An unreadable sensor counts as a breach.
        if t.non_finite_temperature {
            breaches.push("temperature reading not finite".to_string());
        } else if t.peak_temperature_c > self.cfg.max_temperature_c {
            breaches.push(format!(
                "temperature {:.1}°C > {}°C",
                t.peak_temperature_c, self.cfg.max_temperature_c
            ));
        }
        if t.non_finite_channel {
            breaches.push("channel voltage not finite".to_string());
        } else if t.max_channel_voltage > self.cfg.max_channel_voltage {
            breaches.push(format!(
                "channel voltage {:.2}V > {}V",
                t.max_channel_voltage, self.cfg.max_channel_voltage
            ));
        }
        if breaches.is_empty() {
            return None;
        }
        let reason = breaches.join("; ");
        let mut l = write(&self.lock);
        if !l.locked {
            l.locked = true;
            l.reason = Some(reason.clone());
            l.tripped_at = Some(Utc::now());
        }
        tracing::error!(reason = %reason, "fail-safe lock tripped");
        Some(reason)
    }

    /// Privileged reset. Returns whether the lock was held.
    pub fn clear_fail_safe_lock(&self, access: &SupportAccess) -> bool {
        let mut l = write(&self.lock);
        let was = l.locked;
        if was {
            tracing::warn!(
                operator = access.operator(),
                reason = l.reason.as_deref().unwrap_or(""),
                "fail-safe lock cleared"
            );
        }
        *l = FailSafeLock::default();
        was
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(a: f32, b: f32, t: f32) -> RawSample {
        RawSample {
            a_v: a,
            b_v: b,
            temperature_c: t,
            at_ms: 0,
        }
    }

    fn peaks(max_channel_voltage: f32, peak_temperature_c: f32) -> Telemetry {
        Telemetry {
            max_channel_voltage,
            peak_temperature_c,
            non_finite_channel: false,
            non_finite_temperature: false,
        }
    }

    #[test]
    fn telemetry_takes_peaks() {
        let t = Telemetry::from_burst(&[sample(0.4, -5.5, 30.0), sample(1.0, 0.0, 61.0)]);
        assert_eq!(t.max_channel_voltage, 5.5);
        assert_eq!(t.peak_temperature_c, 61.0);
        assert!(!t.non_finite_channel && !t.non_finite_temperature);
    }

    #[test]
    fn telemetry_flags_non_finite_readings() {
        let t = Telemetry::from_burst(&[sample(0.4, 0.1, 25.0), sample(f32::NAN, 0.1, f32::NAN)]);
        assert!(t.non_finite_channel);
        assert!(t.non_finite_temperature);
        // The finite peaks survive alongside the flags.
        assert_eq!(t.max_channel_voltage, 0.4);
        assert_eq!(t.peak_temperature_c, 25.0);
    }

    #[test]
    fn voltage_breach_trips_with_reason() {
        let m = FailSafeManager::new(SafetyCfg::default());
        let reason = m.evaluate(&peaks(5.2, 30.0)).unwrap();
        assert_eq!(reason, "channel voltage 5.20V > 5V");
        assert!(m.is_locked());
        assert_eq!(m.guard().as_deref(), Some("channel voltage 5.20V > 5V"));
    }

    #[test]
    fn unreadable_sensors_trip_with_reason() {
        let m = FailSafeManager::new(SafetyCfg::default());
        let reason = m
            .evaluate(&Telemetry {
                non_finite_channel: true,
                non_finite_temperature: true,
                ..peaks(0.3, 25.0)
            })
            .unwrap();
        assert_eq!(reason, "temperature reading not finite; channel voltage not finite");
        assert!(m.is_locked());
    }

    #[test]
    fn within_limits_does_not_trip() {
        let m = FailSafeManager::new(SafetyCfg::default());
        assert!(m.evaluate(&peaks(5.0, 60.0)).is_none());
        assert!(!m.is_locked());
        assert_eq!(m.evaluations(), 1);
    }

    #[test]
    fn only_clear_resets() {
        let m = FailSafeManager::new(SafetyCfg::default());
        m.evaluate(&peaks(0.1, 62.0));
        // A clean evaluation does not unlock.
        m.evaluate(&peaks(0.1, 25.0));
        assert!(m.is_locked());
        assert!(m.clear_fail_safe_lock(&SupportAccess::grant("tech-7")));
        assert_eq!(m.snapshot(), FailSafeLock::default());
        assert!(!m.clear_fail_safe_lock(&SupportAccess::grant("tech-7")));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checks::CheckCategory;
use super::probe::{BiometricStatus, DeviceProbe, OsVersion};
use super::violation::{SecurityViolation, Severity};

const WARNING_WEIGHT: f64 = 0.02;

/// Verdict of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub violations: Vec<SecurityViolation>,
    pub warnings: Vec<String>,
    pub validated_at: DateTime<Utc>,
    /// In `[0, 1]`; 0 only for a clean pass with no warnings.
    pub risk_score: f64,
}

impl ValidationResult {
    pub fn new(violations: Vec<SecurityViolation>, warnings: Vec<String>, validated_at: DateTime<Utc>) -> Self {
        let weighted: f64 = violations.iter().map(SecurityViolation::weight).sum();
        let risk_score = (weighted + WARNING_WEIGHT * warnings.len() as f64).min(1.0);
        Self {
            is_valid: violations.is_empty(),
            violations,
            warnings,
            validated_at,
            risk_score,
        }
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.violations.iter().map(SecurityViolation::severity).max()
    }

    /// Violations present here but absent from `previous`.
    pub fn new_violations<'a>(&'a self, previous: &ValidationResult) -> Vec<&'a SecurityViolation> {
        self.violations
            .iter()
            .filter(|v| !previous.violations.contains(v))
            .collect()
    }
}

/// Which slice of the check battery a validation covers; also the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationScope {
    Comprehensive,
    Category(CheckCategory),
    /// The subset cheap enough for periodic monitoring.
    Lightweight,
}

/// Device posture snapshot compared between monitor ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSecurityState {
    pub passcode_set: Option<bool>,
    pub biometrics: BiometricStatus,
    pub encryption_enabled: Option<bool>,
    pub os_version: Option<OsVersion>,
    pub captured_at: DateTime<Utc>,
}

impl DeviceSecurityState {
    pub fn capture(probe: &dyn DeviceProbe, captured_at: DateTime<Utc>) -> Self {
        Self {
            passcode_set: probe.passcode_set(),
            biometrics: probe.biometric_status(),
            encryption_enabled: probe.storage_encrypted(),
            os_version: probe.os_version(),
            captured_at,
        }
    }

    /// Posture comparison ignoring the capture time.
    pub fn differs_from(&self, other: &DeviceSecurityState) -> bool {
        self.passcode_set != other.passcode_set
            || self.biometrics != other.biometrics
            || self.encryption_enabled != other.encryption_enabled
            || self.os_version != other.os_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::probe::StaticProbe;
    use proptest::prelude::*;

    #[test]
    fn test_clean_result() {
        let result = ValidationResult::new(Vec::new(), Vec::new(), Utc::now());
        assert!(result.is_valid);
        assert_eq!(result.risk_score, 0.0);
        assert_eq!(result.highest_severity(), None);
    }

    #[test]
    fn test_critical_violation_raises_score() {
        let warnings = vec!["biometric status is unknown".to_string()];
        let baseline = ValidationResult::new(Vec::new(), warnings.clone(), Utc::now());
        assert!(baseline.is_valid);
        assert!((baseline.risk_score - 0.02).abs() < f64::EPSILON);

        let flagged = ValidationResult::new(
            vec![SecurityViolation::Jailbreak("found /var/jb".into())],
            warnings,
            Utc::now(),
        );
        assert!(!flagged.is_valid);
        assert!(flagged.risk_score > baseline.risk_score);
        assert_eq!(flagged.highest_severity(), Some(Severity::Critical));
    }

    #[test]
    fn test_score_is_capped() {
        let violations = vec![SecurityViolation::Tampering("x".into()); 10];
        let result = ValidationResult::new(violations, vec!["w".into(); 10], Utc::now());
        assert_eq!(result.risk_score, 1.0);
    }

    #[test]
    fn test_new_violations() {
        let now = Utc::now();
        let before = ValidationResult::new(vec![SecurityViolation::PasscodeNotSet], Vec::new(), now);
        let after = ValidationResult::new(
            vec![SecurityViolation::PasscodeNotSet, SecurityViolation::EncryptionDisabled],
            Vec::new(),
            now,
        );
        assert_eq!(after.new_violations(&before), vec![&SecurityViolation::EncryptionDisabled]);
        assert!(before.new_violations(&after).is_empty());
    }

    #[test]
    fn test_state_drift_ignores_capture_time() {
        let probe = StaticProbe::default();
        let first = DeviceSecurityState::capture(&probe, Utc::now());
        let second = DeviceSecurityState::capture(&probe, first.captured_at + chrono::Duration::seconds(60));
        assert!(!first.differs_from(&second));

        probe.update(|facts| facts.biometrics = BiometricStatus::LockedOut);
        let third = DeviceSecurityState::capture(&probe, Utc::now());
        assert!(first.differs_from(&third));
    }

    proptest! {
        #[test]
        fn prop_score_monotonic_in_violations(extra in 0usize..8, warnings in 0usize..8) {
            let now = Utc::now();
            let base: Vec<SecurityViolation> = vec![SecurityViolation::PasscodeNotSet; extra];
            let mut more = base.clone();
            more.push(SecurityViolation::CodeInjection("LD_PRELOAD".into()));
            let w = vec!["warning".to_string(); warnings];
            let low = ValidationResult::new(base, w.clone(), now);
            let high = ValidationResult::new(more, w, now);
            prop_assert!(high.risk_score >= low.risk_score);
            prop_assert!((0.0..=1.0).contains(&high.risk_score));
            prop_assert!(!high.is_valid);
        }
    }
}

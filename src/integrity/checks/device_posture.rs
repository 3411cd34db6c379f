use anyhow::Result;

use super::{CheckCategory, CheckOutcome, IntegrityCheck};
use crate::config::IntegrityConfig;
use crate::error::ConfigError;
use crate::integrity::probe::{BiometricStatus, DeviceProbe, OsVersion, Platform};
use crate::integrity::violation::SecurityViolation;

/// OS floor applied when none is configured. Desktop floors are kernel
/// releases as reported by `uname`.
fn platform_floor(platform: Platform) -> Option<OsVersion> {
    match platform {
        Platform::Ios => Some(OsVersion::new(15, 0, 0)),
        Platform::Android => Some(OsVersion::new(10, 0, 0)),
        Platform::MacOs => Some(OsVersion::new(21, 0, 0)),
        Platform::Linux => Some(OsVersion::new(4, 19, 0)),
        Platform::Windows | Platform::Unknown => None,
    }
}

pub struct DevicePostureCheck {
    minimum_os: Option<OsVersion>,
    allow_simulator: bool,
}

impl DevicePostureCheck {
    pub fn from_config(config: &IntegrityConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            minimum_os: config.minimum_os()?,
            allow_simulator: config.allow_simulator,
        })
    }
}

impl IntegrityCheck for DevicePostureCheck {
    fn name(&self) -> &'static str {
        "device_posture"
    }

    fn category(&self) -> CheckCategory {
        CheckCategory::DevicePosture
    }

    fn is_lightweight(&self) -> bool {
        true
    }

    fn execute(&self, probe: &dyn DeviceProbe) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();

        match probe.passcode_set() {
            Some(true) => {}
            Some(false) => outcome.violation(SecurityViolation::PasscodeNotSet),
            None => outcome.warn("device passcode status is unknown"),
        }

        match probe.biometric_status() {
            BiometricStatus::Available => {}
            BiometricStatus::NotEnrolled => outcome.violation(SecurityViolation::BiometricsDisabled(
                "no biometrics are enrolled".to_string(),
            )),
            BiometricStatus::Unavailable => outcome.violation(SecurityViolation::BiometricsDisabled(
                "biometric hardware is unavailable".to_string(),
            )),
            BiometricStatus::LockedOut => outcome.violation(SecurityViolation::BiometricsLockedOut),
            BiometricStatus::Unknown => outcome.warn("biometric status is unknown"),
        }

        match probe.storage_encrypted() {
            Some(true) => {}
            Some(false) => outcome.violation(SecurityViolation::EncryptionDisabled),
            None => outcome.warn("storage encryption status is unknown"),
        }

        let floor = self.minimum_os.or_else(|| platform_floor(probe.platform()));
        match (probe.os_version(), floor) {
            (Some(current), Some(minimum)) if current < minimum => {
                outcome.violation(SecurityViolation::OutdatedOs {
                    current: current.to_string(),
                    minimum: minimum.to_string(),
                });
            }
            (None, _) => outcome.warn("OS version is unknown"),
            _ => {}
        }

        if probe.is_simulator() && !self.allow_simulator {
            outcome.violation(SecurityViolation::Simulator(format!(
                "running on a {:?} simulator",
                probe.platform()
            )));
        }

        Ok(outcome)
    }
}

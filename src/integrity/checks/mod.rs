//! The integrity check battery. Each check inspects one area through a
//! [`DeviceProbe`] and reports violations and warnings; an `Err` means the
//! check itself could not run.

mod app_integrity;
mod debugging;
mod device_posture;
mod jailbreak;
mod runtime;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::probe::DeviceProbe;
use super::violation::SecurityViolation;
use crate::config::IntegrityConfig;
use crate::error::ConfigError;

pub use app_integrity::AppIntegrityCheck;
pub use debugging::DebuggingCheck;
pub use device_posture::DevicePostureCheck;
pub use jailbreak::JailbreakCheck;
pub use runtime::RuntimeEnvironmentCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckCategory {
    AppIntegrity,
    RuntimeEnvironment,
    Jailbreak,
    Debugging,
    DevicePosture,
}

impl fmt::Display for CheckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckCategory::AppIntegrity => write!(f, "App Integrity"),
            CheckCategory::RuntimeEnvironment => write!(f, "Runtime Environment"),
            CheckCategory::Jailbreak => write!(f, "Jailbreak"),
            CheckCategory::Debugging => write!(f, "Debugging"),
            CheckCategory::DevicePosture => write!(f, "Device Posture"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckOutcome {
    pub violations: Vec<SecurityViolation>,
    pub warnings: Vec<String>,
}

impl CheckOutcome {
    pub fn violation(&mut self, violation: SecurityViolation) {
        self.violations.push(violation);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Records a probe call that could not complete. Findings already
    /// collected stay in the outcome.
    pub fn failure(&mut self, check: &str, error: anyhow::Error) {
        self.violations.push(SecurityViolation::CheckFailure {
            check: check.to_string(),
            detail: format!("{:#}", error),
        });
    }

    /// The probe answer, or an empty one after recording the failure.
    pub fn record<T: Default>(&mut self, check: &str, result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                self.failure(check, e);
                T::default()
            }
        }
    }
}

pub trait IntegrityCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn category(&self) -> CheckCategory;

    /// Cheap enough for the background monitor.
    fn is_lightweight(&self) -> bool {
        false
    }

    fn execute(&self, probe: &dyn DeviceProbe) -> Result<CheckOutcome>;
}

/// The full battery, configured from `config`.
pub fn default_checks(config: &IntegrityConfig) -> Result<Vec<Arc<dyn IntegrityCheck>>, ConfigError> {
    Ok(vec![
        Arc::new(AppIntegrityCheck::from_config(config)?),
        Arc::new(RuntimeEnvironmentCheck::from_config(config)),
        Arc::new(JailbreakCheck::from_config(config)),
        Arc::new(DebuggingCheck::from_config(config)),
        Arc::new(DevicePostureCheck::from_config(config)?),
    ])
}

/// First needle contained in `haystack`, ignoring ASCII case.
pub(crate) fn find_match<'a>(haystack: &str, needles: &'a [String]) -> Option<&'a str> {
    let haystack = haystack.to_ascii_lowercase();
    needles
        .iter()
        .find(|needle| haystack.contains(&needle.to_ascii_lowercase()))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_match_ignores_case() {
        let needles = vec!["Frida".to_string(), "substrate".to_string()];
        assert_eq!(find_match("/usr/lib/FRIDA-agent.so", &needles), Some("Frida"));
        assert_eq!(find_match("/usr/lib/libSubstrate.dylib", &needles), Some("substrate"));
        assert_eq!(find_match("/usr/lib/libc.so.6", &needles), None);
    }

    #[test]
    fn test_default_battery_covers_every_category() {
        let checks = default_checks(&IntegrityConfig::default()).unwrap();
        let categories: Vec<CheckCategory> = checks.iter().map(|c| c.category()).collect();
        assert_eq!(
            categories,
            vec![
                CheckCategory::AppIntegrity,
                CheckCategory::RuntimeEnvironment,
                CheckCategory::Jailbreak,
                CheckCategory::Debugging,
                CheckCategory::DevicePosture,
            ]
        );
        let lightweight: Vec<&str> = checks
            .iter()
            .filter(|c| c.is_lightweight())
            .map(|c| c.name())
            .collect();
        assert_eq!(lightweight, vec!["runtime_environment", "debugging", "device_posture"]);
    }
}

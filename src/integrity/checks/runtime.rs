use anyhow::Result;

use super::{find_match, CheckCategory, CheckOutcome, IntegrityCheck};
use crate::config::IntegrityConfig;
use crate::integrity::probe::DeviceProbe;
use crate::integrity::violation::SecurityViolation;

pub struct RuntimeEnvironmentCheck {
    injection_env_vars: Vec<String>,
    suspicious_env_vars: Vec<String>,
    suspicious_processes: Vec<String>,
}

impl RuntimeEnvironmentCheck {
    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self {
            injection_env_vars: config.injection_env_vars.clone(),
            suspicious_env_vars: config.suspicious_env_vars.clone(),
            suspicious_processes: config.suspicious_processes.clone(),
        }
    }
}

impl IntegrityCheck for RuntimeEnvironmentCheck {
    fn name(&self) -> &'static str {
        "runtime_environment"
    }

    fn category(&self) -> CheckCategory {
        CheckCategory::RuntimeEnvironment
    }

    fn is_lightweight(&self) -> bool {
        true
    }

    fn execute(&self, probe: &dyn DeviceProbe) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();

        for var in &self.injection_env_vars {
            if let Some(value) = probe.env_var(var).filter(|v| !v.trim().is_empty()) {
                outcome.violation(SecurityViolation::CodeInjection(format!("{}={}", var, value)));
            }
        }

        for var in &self.suspicious_env_vars {
            if probe.env_var(var).is_some() {
                outcome.violation(SecurityViolation::SuspiciousEnvironment(format!(
                    "environment variable {} is set",
                    var
                )));
            }
        }

        let processes = outcome.record(self.name(), probe.running_processes());
        for process in processes {
            if let Some(pattern) = find_match(&process, &self.suspicious_processes) {
                outcome.violation(SecurityViolation::SuspiciousEnvironment(format!(
                    "process {} is running (matches '{}')",
                    process, pattern
                )));
            }
        }

        if probe.is_privileged() == Some(true) {
            if probe.platform().is_mobile() {
                outcome.violation(SecurityViolation::Jailbreak(
                    "application is running with root privileges".to_string(),
                ));
            } else {
                outcome.warn("process is running with elevated privileges");
            }
        }

        Ok(outcome)
    }
}

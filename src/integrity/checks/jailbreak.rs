use anyhow::Result;

use super::{find_match, CheckCategory, CheckOutcome, IntegrityCheck};
use crate::config::IntegrityConfig;
use crate::integrity::probe::DeviceProbe;
use crate::integrity::violation::SecurityViolation;

/// Filesystem, URL scheme, sandbox and hooking-framework indicators of a
/// jailbroken or rooted device.
pub struct JailbreakCheck {
    paths: Vec<String>,
    url_schemes: Vec<String>,
    protected_directories: Vec<String>,
    out_of_sandbox_paths: Vec<String>,
    hook_libraries: Vec<String>,
}

impl JailbreakCheck {
    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self {
            paths: config.jailbreak_paths.clone(),
            url_schemes: config.jailbreak_url_schemes.clone(),
            protected_directories: config.protected_directories.clone(),
            out_of_sandbox_paths: config.out_of_sandbox_paths.clone(),
            hook_libraries: config.hook_libraries.clone(),
        }
    }
}

impl IntegrityCheck for JailbreakCheck {
    fn name(&self) -> &'static str {
        "jailbreak"
    }

    fn category(&self) -> CheckCategory {
        CheckCategory::Jailbreak
    }

    fn execute(&self, probe: &dyn DeviceProbe) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();

        for path in self.paths.iter().filter(|p| probe.path_exists(p)) {
            outcome.violation(SecurityViolation::Jailbreak(format!("found {}", path)));
        }

        for scheme in self.url_schemes.iter().filter(|s| probe.can_open_url(s)) {
            outcome.violation(SecurityViolation::Jailbreak(format!("URL scheme {}:// is handled", scheme)));
        }

        for dir in self.protected_directories.iter().filter(|d| probe.is_writable(d)) {
            outcome.violation(SecurityViolation::Jailbreak(format!("protected directory {} is writable", dir)));
        }

        for path in self.out_of_sandbox_paths.iter().filter(|p| probe.can_read(p)) {
            outcome.violation(SecurityViolation::SandboxEscape(format!("read access to {}", path)));
        }

        let libraries = outcome.record(self.name(), probe.loaded_libraries());
        for library in libraries {
            if let Some(pattern) = find_match(&library, &self.hook_libraries) {
                outcome.violation(SecurityViolation::Jailbreak(format!(
                    "hooking library {} is loaded (matches '{}')",
                    library, pattern
                )));
            }
        }

        Ok(outcome)
    }
}

use anyhow::Result;

use super::{find_match, CheckCategory, CheckOutcome, IntegrityCheck};
use crate::config::IntegrityConfig;
use crate::integrity::probe::DeviceProbe;
use crate::integrity::violation::SecurityViolation;

/// Attached debuggers, instrumentation toolkits and code running from
/// places it should not.
pub struct DebuggingCheck {
    instrumentation_libraries: Vec<String>,
    temp_locations: Vec<String>,
}

impl DebuggingCheck {
    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self {
            instrumentation_libraries: config.instrumentation_libraries.clone(),
            temp_locations: config.temp_locations.clone(),
        }
    }

    fn in_temp_location(&self, path: &str) -> bool {
        self.temp_locations.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

impl IntegrityCheck for DebuggingCheck {
    fn name(&self) -> &'static str {
        "debugging"
    }

    fn category(&self) -> CheckCategory {
        CheckCategory::Debugging
    }

    fn is_lightweight(&self) -> bool {
        true
    }

    fn execute(&self, probe: &dyn DeviceProbe) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();

        match probe.debugger_attached() {
            Some(true) => outcome.violation(SecurityViolation::Debugging("a debugger is attached".to_string())),
            Some(false) => {}
            None => outcome.warn("debugger attachment could not be determined"),
        }

        let libraries = outcome.record(self.name(), probe.loaded_libraries());
        for library in libraries {
            if let Some(pattern) = find_match(&library, &self.instrumentation_libraries) {
                outcome.violation(SecurityViolation::InstrumentationDetected(format!(
                    "{} (matches '{}')",
                    library, pattern
                )));
            } else if self.in_temp_location(&library) {
                outcome.violation(SecurityViolation::CodeInjection(format!(
                    "library loaded from temporary location: {}",
                    library
                )));
            }
        }

        let regions = outcome.record(self.name(), probe.executable_regions());
        for region in regions {
            match &region.path {
                Some(path) if self.in_temp_location(path) => {
                    outcome.violation(SecurityViolation::CodeInjection(format!(
                        "executable mapping {:#x}-{:#x} backed by {}",
                        region.start, region.end, path
                    )));
                }
                _ if region.writable && region.is_anonymous() => {
                    outcome.warn(format!(
                        "anonymous writable and executable mapping at {:#x}-{:#x}",
                        region.start, region.end
                    ));
                }
                _ => {}
            }
        }

        if probe.stack_protection_intact() == Some(false) {
            outcome.violation(SecurityViolation::Tampering("stack protection is disabled".to_string()));
        }
        if probe.control_flow_integrity_intact() == Some(false) {
            outcome.violation(SecurityViolation::Tampering(
                "control flow integrity is disabled".to_string(),
            ));
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::probe::{MemoryRegion, StaticProbe};

    fn check() -> DebuggingCheck {
        DebuggingCheck::from_config(&IntegrityConfig::default())
    }

    #[test]
    fn test_clean_device() {
        let outcome = check().execute(&StaticProbe::default()).unwrap();
        assert_eq!(outcome, CheckOutcome::default());
    }

    #[test]
    fn test_debugger_states() {
        let probe = StaticProbe::default();
        probe.update(|facts| facts.debugger_attached = Some(true));
        let outcome = check().execute(&probe).unwrap();
        assert!(matches!(outcome.violations[..], [SecurityViolation::Debugging(_)]));

        probe.update(|facts| facts.debugger_attached = None);
        let outcome = check().execute(&probe).unwrap();
        assert!(outcome.violations.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_libraries() {
        let probe = StaticProbe::default();
        probe.update(|facts| {
            facts.libraries.push("/usr/lib/frida/frida-agent.dylib".to_string());
            facts.libraries.push("/tmp/payload.so".to_string());
        });
        let outcome = check().execute(&probe).unwrap();
        let kinds: Vec<&str> = outcome.violations.iter().map(|v| v.kind()).collect();
        assert_eq!(kinds, vec!["instrumentation_detected", "code_injection"]);
    }

    #[test]
    fn test_memory_regions() {
        let probe = StaticProbe::default();
        probe.update(|facts| {
            facts.regions = vec![
                MemoryRegion::parse_maps_line("1000-2000 rwxp 00000000 00:00 0").unwrap(),
                MemoryRegion::parse_maps_line("3000-4000 r-xp 00000000 08:01 42 /dev/shm/stage2").unwrap(),
                MemoryRegion::parse_maps_line("5000-6000 r-xp 00000000 08:01 43 /usr/lib/libc.so.6").unwrap(),
            ];
        });
        let outcome = check().execute(&probe).unwrap();
        assert_eq!(outcome.violations.len(), 1);
        assert!(matches!(outcome.violations[0], SecurityViolation::CodeInjection(_)));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_hardening_flags() {
        let probe = StaticProbe::default();
        probe.update(|facts| {
            facts.stack_protection = Some(false);
            facts.control_flow_integrity = Some(true);
        });
        let outcome = check().execute(&probe).unwrap();
        assert_eq!(
            outcome.violations,
            vec![SecurityViolation::Tampering("stack protection is disabled".to_string())]
        );
    }
}

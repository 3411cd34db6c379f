use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// An adversarial or non-compliant condition found on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum SecurityViolation {
    Jailbreak(String),
    CodeInjection(String),
    Tampering(String),
    InvalidCodeSignature(String),
    UnexpectedBundleFile(String),
    SuspiciousEnvironment(String),
    InstrumentationDetected(String),
    Debugging(String),
    SandboxEscape(String),
    OutdatedOs { current: String, minimum: String },
    PasscodeNotSet,
    BiometricsDisabled(String),
    BiometricsLockedOut,
    EncryptionDisabled,
    Simulator(String),
    /// A check could not run to completion.
    CheckFailure { check: String, detail: String },
}

impl SecurityViolation {
    pub fn severity(&self) -> Severity {
        use SecurityViolation::*;
        match self {
            Jailbreak(_) | CodeInjection(_) | Tampering(_) | InvalidCodeSignature(_) | SandboxEscape(_)
            | InstrumentationDetected(_) => Severity::Critical,
            Debugging(_) | Simulator(_) | EncryptionDisabled | UnexpectedBundleFile(_) => Severity::High,
            SuspiciousEnvironment(_) | PasscodeNotSet | OutdatedOs { .. } | CheckFailure { .. } => {
                Severity::Medium
            }
            BiometricsDisabled(_) | BiometricsLockedOut => Severity::Low,
        }
    }

    /// Contribution to the risk score.
    pub fn weight(&self) -> f64 {
        use SecurityViolation::*;
        match self {
            Jailbreak(_) | CodeInjection(_) | Tampering(_) | InvalidCodeSignature(_) => 0.3,
            SandboxEscape(_) | InstrumentationDetected(_) => 0.25,
            Debugging(_) | Simulator(_) | EncryptionDisabled | UnexpectedBundleFile(_) => 0.2,
            SuspiciousEnvironment(_) | PasscodeNotSet => 0.15,
            OutdatedOs { .. } | CheckFailure { .. } | BiometricsDisabled(_) | BiometricsLockedOut => 0.1,
        }
    }

    pub fn kind(&self) -> &'static str {
        use SecurityViolation::*;
        match self {
            Jailbreak(_) => "jailbreak",
            CodeInjection(_) => "code_injection",
            Tampering(_) => "tampering",
            InvalidCodeSignature(_) => "invalid_code_signature",
            UnexpectedBundleFile(_) => "unexpected_bundle_file",
            SuspiciousEnvironment(_) => "suspicious_environment",
            InstrumentationDetected(_) => "instrumentation_detected",
            Debugging(_) => "debugging",
            SandboxEscape(_) => "sandbox_escape",
            OutdatedOs { .. } => "outdated_os",
            PasscodeNotSet => "passcode_not_set",
            BiometricsDisabled(_) => "biometrics_disabled",
            BiometricsLockedOut => "biometrics_locked_out",
            EncryptionDisabled => "encryption_disabled",
            Simulator(_) => "simulator",
            CheckFailure { .. } => "check_failure",
        }
    }

    pub fn detail(&self) -> String {
        use SecurityViolation::*;
        match self {
            Jailbreak(d) | CodeInjection(d) | Tampering(d) | InvalidCodeSignature(d) | UnexpectedBundleFile(d)
            | SuspiciousEnvironment(d) | InstrumentationDetected(d) | Debugging(d) | SandboxEscape(d)
            | BiometricsDisabled(d) | Simulator(d) => d.clone(),
            OutdatedOs { current, minimum } => format!("OS {} is older than required {}", current, minimum),
            PasscodeNotSet => "device passcode is not set".to_string(),
            BiometricsLockedOut => "biometric authentication is locked out".to_string(),
            EncryptionDisabled => "storage encryption is disabled".to_string(),
            CheckFailure { check, detail } => format!("check '{}' failed: {}", check, detail),
        }
    }
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.kind(), self.detail())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_weights_follow_severity() {
        let samples = vec![
            SecurityViolation::Jailbreak("cydia".into()),
            SecurityViolation::SandboxEscape("wrote /private".into()),
            SecurityViolation::Debugging("tracer".into()),
            SecurityViolation::PasscodeNotSet,
            SecurityViolation::BiometricsLockedOut,
        ];
        for pair in samples.windows(2) {
            assert!(pair[0].severity() >= pair[1].severity());
            assert!(pair[0].weight() >= pair[1].weight());
        }
        for v in &samples {
            assert!(v.weight() > 0.0 && v.weight() <= 0.3);
        }
    }

    #[test]
    fn test_display_names_kind() {
        let v = SecurityViolation::OutdatedOs {
            current: "4.19.0".into(),
            minimum: "5.4.0".into(),
        };
        assert_eq!(v.to_string(), "[MEDIUM] outdated_os: OS 4.19.0 is older than required 5.4.0");
    }
}

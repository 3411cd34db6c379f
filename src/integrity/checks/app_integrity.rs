use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use subtle::ConstantTimeEq;

use super::{find_match, CheckCategory, CheckOutcome, IntegrityCheck};
use crate::config::IntegrityConfig;
use crate::error::ConfigError;
use crate::integrity::probe::DeviceProbe;
use crate::integrity::violation::SecurityViolation;

/// Executable digest pinning, Ed25519 signature over that digest, and a
/// scan of the executable's directory for injected payloads.
pub struct AppIntegrityCheck {
    expected_digest: Option<[u8; 32]>,
    signer: Option<VerifyingKey>,
    signature: Option<Signature>,
    bundle_patterns: Vec<String>,
}

impl AppIntegrityCheck {
    pub fn from_config(config: &IntegrityConfig) -> Result<Self, ConfigError> {
        let expected_digest = config
            .expected_executable_digest
            .as_deref()
            .map(|raw| decode_array::<32>("expected_executable_digest", raw))
            .transpose()?;
        let signer = config
            .code_signing_public_key
            .as_deref()
            .map(|raw| {
                let bytes = decode_array::<32>("code_signing_public_key", raw)?;
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| ConfigError::Invalid(format!("code_signing_public_key: {}", e)))
            })
            .transpose()?;
        let signature = config
            .code_signature
            .as_deref()
            .map(|raw| decode_array::<64>("code_signature", raw).map(|bytes| Signature::from_bytes(&bytes)))
            .transpose()?;

        Ok(Self {
            expected_digest,
            signer,
            signature,
            bundle_patterns: config.unexpected_bundle_patterns.clone(),
        })
    }
}

impl IntegrityCheck for AppIntegrityCheck {
    fn name(&self) -> &'static str {
        "app_integrity"
    }

    fn category(&self) -> CheckCategory {
        CheckCategory::AppIntegrity
    }

    fn execute(&self, probe: &dyn DeviceProbe) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();
        let executable = match probe.executable_path() {
            Ok(path) => path,
            Err(e) => {
                outcome.failure(self.name(), e);
                return Ok(outcome);
            }
        };

        if self.expected_digest.is_some() || self.signer.is_some() {
            match probe.read_file(&executable).context("Failed to read executable image") {
                Ok(image) => self.verify_image(&image, &mut outcome),
                Err(e) => outcome.failure(self.name(), e),
            }
        } else {
            outcome.warn("executable digest is not pinned");
        }

        if let Some(bundle_dir) = executable.parent() {
            for name in outcome.record(self.name(), probe.list_dir(bundle_dir)) {
                if let Some(pattern) = find_match(&name, &self.bundle_patterns) {
                    outcome.violation(SecurityViolation::UnexpectedBundleFile(format!(
                        "{} (matches '{}')",
                        name, pattern
                    )));
                }
            }
        }

        Ok(outcome)
    }
}

impl AppIntegrityCheck {
    fn verify_image(&self, image: &[u8], outcome: &mut CheckOutcome) {
        let digest = blake3::hash(image);

        if let Some(expected) = &self.expected_digest {
            if !bool::from(digest.as_bytes().ct_eq(expected)) {
                outcome.violation(SecurityViolation::Tampering(format!(
                    "executable digest {} does not match the pinned digest",
                    digest.to_hex()
                )));
            }
        }

        if let Some(signer) = &self.signer {
            match &self.signature {
                None => outcome.violation(SecurityViolation::InvalidCodeSignature(
                    "no code signature configured for the signing key".to_string(),
                )),
                Some(signature) => {
                    if signer.verify_strict(digest.as_bytes(), signature).is_err() {
                        outcome.violation(SecurityViolation::InvalidCodeSignature(
                            "code signature does not verify over the executable digest".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

fn decode_array<const N: usize>(field: &str, raw: &str) -> Result<[u8; N], ConfigError> {
    let bytes = hex::decode(raw).map_err(|e| ConfigError::Invalid(format!("{} is not hex: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::Invalid(format!("{} must be {} bytes", field, N)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::probe::{ProbeFacts, StaticProbe};
    use ed25519_dalek::{Signer, SigningKey};
    use std::path::PathBuf;

    fn image_digest() -> [u8; 32] {
        *blake3::hash(b"wealthwise executable image").as_bytes()
    }

    fn check_with(config: IntegrityConfig) -> AppIntegrityCheck {
        AppIntegrityCheck::from_config(&config).unwrap()
    }

    #[test]
    fn test_unpinned_is_warning_only() {
        let outcome = check_with(IntegrityConfig::default())
            .execute(&StaticProbe::default())
            .unwrap();
        assert!(outcome.violations.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_digest_pin() {
        let mut config = IntegrityConfig::default();
        config.expected_executable_digest = Some(hex::encode(image_digest()));
        let check = check_with(config);
        let probe = StaticProbe::default();
        assert!(check.execute(&probe).unwrap().violations.is_empty());

        probe.update(|facts| {
            facts
                .files
                .insert(PathBuf::from("/app/WealthWise.app/WealthWise"), b"patched".to_vec());
        });
        let outcome = check.execute(&probe).unwrap();
        assert!(matches!(outcome.violations[0], SecurityViolation::Tampering(_)));
    }

    #[test]
    fn test_code_signature() {
        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let mut config = IntegrityConfig::default();
        config.code_signing_public_key = Some(hex::encode(signing.verifying_key().to_bytes()));
        config.code_signature = Some(hex::encode(signing.sign(&image_digest()).to_bytes()));
        let probe = StaticProbe::default();
        assert!(check_with(config.clone()).execute(&probe).unwrap().violations.is_empty());

        config.code_signature = Some(hex::encode(signing.sign(b"something else").to_bytes()));
        let outcome = check_with(config.clone()).execute(&probe).unwrap();
        assert!(matches!(outcome.violations[0], SecurityViolation::InvalidCodeSignature(_)));

        config.code_signature = None;
        let outcome = check_with(config).execute(&probe).unwrap();
        assert!(matches!(outcome.violations[0], SecurityViolation::InvalidCodeSignature(_)));
    }

    #[test]
    fn test_unexpected_bundle_file() {
        let probe = StaticProbe::new(ProbeFacts::default());
        probe.update(|facts| {
            facts
                .files
                .insert(PathBuf::from("/app/WealthWise.app/FridaGadget.dylib"), Vec::new());
        });
        let outcome = check_with(IntegrityConfig::default()).execute(&probe).unwrap();
        assert_eq!(outcome.violations.len(), 1);
        assert!(matches!(outcome.violations[0], SecurityViolation::UnexpectedBundleFile(_)));
    }

    #[test]
    fn test_unreadable_executable_keeps_bundle_findings() {
        let mut config = IntegrityConfig::default();
        config.expected_executable_digest = Some(hex::encode(image_digest()));
        let probe = StaticProbe::default();
        probe.update(|facts| {
            facts.files.clear();
            facts
                .files
                .insert(PathBuf::from("/app/WealthWise.app/libsubstrate.dylib"), Vec::new());
        });
        let outcome = check_with(config).execute(&probe).unwrap();
        let kinds: Vec<&str> = outcome.violations.iter().map(|v| v.kind()).collect();
        assert_eq!(kinds, vec!["check_failure", "unexpected_bundle_file"]);
    }
}

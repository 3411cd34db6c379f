//! Secret-store backends. A backend persists opaque byte blobs under string
//! identifiers and enforces the accessibility policy attached at `put` time.

mod file;
#[cfg(feature = "platform-keyring")]
mod os_keyring;
mod memory;

use secrecy::SecretVec;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SecretStoreError;
use crate::keystore::key::KeyAccessibility;

pub use file::EncryptedFileStore;
#[cfg(feature = "platform-keyring")]
pub use os_keyring::KeyringSecretStore;
pub use memory::MemorySecretStore;

/// Storage primitive every key backend implements. Single-entry operations
/// are atomic: a `put` over an existing identifier replaces it in one step.
pub trait SecretStore: Send + Sync {
    fn put(
        &self,
        identifier: &str,
        secret: &[u8],
        accessibility: KeyAccessibility,
    ) -> Result<(), SecretStoreError>;

    fn get(&self, identifier: &str) -> Result<Option<SecretVec<u8>>, SecretStoreError>;

    /// Removing an absent identifier is not an error.
    fn delete(&self, identifier: &str) -> Result<(), SecretStoreError>;

    fn list(&self) -> Result<Vec<String>, SecretStoreError>;

    /// Presence probe that does not release the secret.
    fn contains(&self, identifier: &str) -> Result<bool, SecretStoreError> {
        Ok(self.list()?.iter().any(|id| id == identifier))
    }

    /// Whether the backend can honour this policy at all.
    fn supports(&self, accessibility: KeyAccessibility) -> bool {
        accessibility != KeyAccessibility::SecureEnclave
    }

    fn name(&self) -> &'static str;
}

/// Decides whether an entry guarded by `accessibility` may be released now.
pub trait AccessGate: Send + Sync {
    fn permits(&self, accessibility: KeyAccessibility) -> bool;
}

/// Gate that releases every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl AccessGate for OpenGate {
    fn permits(&self, _accessibility: KeyAccessibility) -> bool {
        true
    }
}

/// Gate driven by the host's lock state. While locked, only the
/// after-first-unlock policies are satisfied; biometric policies also need a
/// recent user-presence confirmation.
#[derive(Debug, Default)]
pub struct DeviceLockGate {
    locked: AtomicBool,
    user_present: AtomicBool,
}

impl DeviceLockGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
        self.user_present.store(false, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn confirm_user_presence(&self) {
        self.user_present.store(true, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

impl AccessGate for DeviceLockGate {
    fn permits(&self, accessibility: KeyAccessibility) -> bool {
        if self.is_locked() && accessibility.requires_unlocked_device() {
            return false;
        }
        if accessibility.requires_user_presence() {
            return self.user_present.load(Ordering::SeqCst);
        }
        true
    }
}

pub(crate) fn access_denied(identifier: &str, accessibility: KeyAccessibility) -> SecretStoreError {
    SecretStoreError::AccessDenied {
        identifier: identifier.to_string(),
        policy: accessibility.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(KeyAccessibility::WhenUnlocked, false)]
    #[case(KeyAccessibility::WhenUnlockedThisDeviceOnly, false)]
    #[case(KeyAccessibility::WhenPasscodeSetThisDeviceOnly, false)]
    #[case(KeyAccessibility::AfterFirstUnlock, true)]
    #[case(KeyAccessibility::AfterFirstUnlockThisDeviceOnly, true)]
    fn test_locked_gate(#[case] accessibility: KeyAccessibility, #[case] permitted: bool) {
        let gate = DeviceLockGate::new();
        gate.lock();
        assert_eq!(gate.permits(accessibility), permitted);
        gate.unlock();
        assert!(gate.permits(accessibility));
    }

    #[test]
    fn test_biometric_policy_needs_presence() {
        let gate = DeviceLockGate::new();
        assert!(!gate.permits(KeyAccessibility::BiometryCurrentSet));
        gate.confirm_user_presence();
        assert!(gate.permits(KeyAccessibility::BiometryCurrentSet));
        gate.lock();
        assert!(!gate.permits(KeyAccessibility::BiometryCurrentSet));
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::CipherService;
use crate::error::ConfigError;
use crate::integrity::probe::OsVersion;

const ENV_PREFIX: &str = "WEALTHWISE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub keystore: KeyStoreConfig,
    pub cipher: CipherConfig,
    pub integrity: IntegrityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Memory,
    EncryptedFile,
    Keyring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    pub backend: BackendKind,
    /// Store file for the encrypted-file backend.
    pub path: Option<PathBuf>,
    /// Name of the environment variable holding the store passphrase.
    pub passphrase_env: String,
    pub kdf_iterations: u32,
    pub keyring_service: String,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::EncryptedFile,
            path: None,
            passphrase_env: "WEALTHWISE_KEYSTORE_PASSPHRASE".to_string(),
            kdf_iterations: 210_000,
            keyring_service: "com.wealthwise.security".to_string(),
        }
    }
}

impl KeyStoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("wealthwise")
                .join("keystore.bin")
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub chunk_size: usize,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self { chunk_size: 1 << 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub cache_ttl_secs: u64,
    pub monitor_interval_ms: u64,
    pub state_history_limit: usize,
    pub allow_simulator: bool,
    /// Overrides the per-platform OS floor, e.g. "16.0".
    pub minimum_os_version: Option<String>,
    /// Hex BLAKE3 digest the executable must match.
    pub expected_executable_digest: Option<String>,
    /// Hex Ed25519 public key and signature over the executable digest.
    pub code_signing_public_key: Option<String>,
    pub code_signature: Option<String>,
    pub unexpected_bundle_patterns: Vec<String>,
    pub jailbreak_paths: Vec<String>,
    pub jailbreak_url_schemes: Vec<String>,
    pub protected_directories: Vec<String>,
    pub out_of_sandbox_paths: Vec<String>,
    pub hook_libraries: Vec<String>,
    pub instrumentation_libraries: Vec<String>,
    pub injection_env_vars: Vec<String>,
    pub suspicious_env_vars: Vec<String>,
    pub suspicious_processes: Vec<String>,
    pub temp_locations: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            monitor_interval_ms: 60_000,
            state_history_limit: 32,
            allow_simulator: false,
            minimum_os_version: None,
            expected_executable_digest: None,
            code_signing_public_key: None,
            code_signature: None,
            unexpected_bundle_patterns: strings(&[
                "frida", "substrate", "cynject", "libhooker", "sslkillswitch", "flexloader",
            ]),
            jailbreak_paths: strings(&[
                "/Applications/Cydia.app",
                "/Applications/Sileo.app",
                "/Library/MobileSubstrate/MobileSubstrate.dylib",
                "/var/jb",
                "/private/var/lib/apt",
                "/etc/apt/sources.list.d/electra.list",
                "/usr/libexec/cydia",
                "/system/xbin/su",
                "/system/bin/su",
                "/sbin/su",
                "/system/app/Superuser.apk",
                "/data/adb/magisk",
                "/data/local/xbin/su",
            ]),
            jailbreak_url_schemes: strings(&["cydia", "sileo", "zbra", "filza", "undecimus"]),
            protected_directories: strings(&["/private", "/system", "/Applications"]),
            out_of_sandbox_paths: strings(&[
                "/private/var/mobile/Library/SMS/sms.db",
                "/private/var/mobile/Library/Preferences/com.apple.springboard.plist",
                "/data/system/packages.xml",
            ]),
            hook_libraries: strings(&[
                "MobileSubstrate", "libsubstrate", "SubstrateLoader", "libhooker", "substitute",
                "TweakInject", "libxposed", "XposedBridge", "riru",
            ]),
            instrumentation_libraries: strings(&["frida-agent", "frida-gadget", "libcycript", "libgadget"]),
            injection_env_vars: strings(&["LD_PRELOAD", "LD_AUDIT", "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH"]),
            suspicious_env_vars: strings(&["_MSSafeMode", "_SafeMode", "FRIDA_TRANSPORT", "SUBSTRATE_ENABLED"]),
            suspicious_processes: strings(&["frida-server", "frida-helper", "cycript", "gdbserver", "lldb-server"]),
            temp_locations: strings(&["/tmp/", "/var/tmp/", "/private/var/tmp/", "/data/local/tmp/", "/dev/shm/"]),
        }
    }
}

impl IntegrityConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn minimum_os(&self) -> Result<Option<OsVersion>, ConfigError> {
        self.minimum_os_version
            .as_deref()
            .map(|raw| {
                OsVersion::parse(raw)
                    .ok_or_else(|| ConfigError::Invalid(format!("minimum_os_version '{}' is not a version", raw)))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter; `RUST_LOG` overrides it.
    pub level: String,
    /// Enables a daily rolling log file in this directory.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "wealthwise-secd".to_string(),
            ansi: true,
        }
    }
}

impl SecurityConfig {
    /// Defaults, overlaid by the optional TOML file, overlaid by
    /// `WEALTHWISE__<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: SecurityConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: SecurityConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cipher.chunk_size == 0 {
            return Err(ConfigError::Invalid("cipher.chunk_size must be non-zero".to_string()));
        }
        if self.cipher.chunk_size > CipherService::MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "cipher.chunk_size must not exceed {}",
                CipherService::MAX_CHUNK_SIZE
            )));
        }
        if self.integrity.cache_ttl_secs == 0 {
            return Err(ConfigError::Invalid("integrity.cache_ttl_secs must be non-zero".to_string()));
        }
        if self.integrity.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid("integrity.monitor_interval_ms must be non-zero".to_string()));
        }
        if self.integrity.state_history_limit == 0 {
            return Err(ConfigError::Invalid("integrity.state_history_limit must be non-zero".to_string()));
        }
        if self.keystore.kdf_iterations < 10_000 {
            return Err(ConfigError::Invalid("keystore.kdf_iterations must be at least 10000".to_string()));
        }
        self.integrity.minimum_os()?;
        check_hex("integrity.expected_executable_digest", &self.integrity.expected_executable_digest, 32)?;
        check_hex("integrity.code_signing_public_key", &self.integrity.code_signing_public_key, 32)?;
        check_hex("integrity.code_signature", &self.integrity.code_signature, 64)?;
        Ok(())
    }
}

fn check_hex(field: &str, value: &Option<String>, len: usize) -> Result<(), ConfigError> {
    if let Some(raw) = value {
        let bytes = hex::decode(raw).map_err(|e| ConfigError::Invalid(format!("{} is not hex: {}", field, e)))?;
        if bytes.len() != len {
            return Err(ConfigError::Invalid(format!(
                "{} must be {} bytes, got {}",
                field,
                len,
                bytes.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SecurityConfig::default();
        config.validate().unwrap();
        assert_eq!(config.integrity.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.integrity.monitor_interval(), Duration::from_secs(60));
        assert_eq!(config.cipher.chunk_size, 1 << 20);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SecurityConfig::default();
        config.keystore.backend = BackendKind::Memory;
        config.integrity.allow_simulator = true;
        config.integrity.minimum_os_version = Some("16.0".to_string());
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("backend = \"memory\""));
        assert_eq!(SecurityConfig::from_toml(&rendered).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = SecurityConfig::from_toml("[integrity]\nallow_simulator = true\n").unwrap();
        assert!(config.integrity.allow_simulator);
        assert_eq!(config.integrity.cache_ttl_secs, 300);
        assert_eq!(config.keystore, KeyStoreConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\n[keystore]\nbackend = \"memory\"").unwrap();
        let config = SecurityConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.keystore.backend, BackendKind::Memory);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = SecurityConfig::load(Some(Path::new("/nonexistent/wealthwise.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(SecurityConfig::from_toml("[cipher]\nchunk_size = 0\n").is_err());
        assert!(SecurityConfig::from_toml("[integrity]\ncache_ttl_secs = 0\n").is_err());
        assert!(SecurityConfig::from_toml("[integrity]\nmonitor_interval_ms = 0\n").is_err());
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut config = SecurityConfig::default();
        config.cipher.chunk_size = CipherService::MAX_CHUNK_SIZE + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.cipher.chunk_size = CipherService::MAX_CHUNK_SIZE;
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_pins_rejected() {
        let mut config = SecurityConfig::default();
        config.integrity.expected_executable_digest = Some("abcd".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.integrity.expected_executable_digest = Some(hex::encode([7u8; 32]));
        config.integrity.minimum_os_version = Some("latest".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

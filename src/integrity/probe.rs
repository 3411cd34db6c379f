//! Platform facts consumed by the integrity checks.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Android,
    Ios,
    MacOs,
    Windows,
    Linux,
    Unknown,
}

impl Platform {
    pub fn current() -> Self {
        #[cfg(target_os = "android")]
        return Platform::Android;

        #[cfg(target_os = "ios")]
        return Platform::Ios;

        #[cfg(target_os = "macos")]
        return Platform::MacOs;

        #[cfg(target_os = "windows")]
        return Platform::Windows;

        #[cfg(target_os = "linux")]
        return Platform::Linux;

        #[cfg(not(any(
            target_os = "android",
            target_os = "ios",
            target_os = "macos",
            target_os = "windows",
            target_os = "linux"
        )))]
        return Platform::Unknown;
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self, Platform::Android | Platform::Ios)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BiometricStatus {
    Available,
    NotEnrolled,
    LockedOut,
    Unavailable,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Reads the leading dotted numbers, so `5.15.0-91-generic` is 5.15.0.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .take_while(|part| !part.is_empty())
            .map(|part| part.parse::<u32>().ok());
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One mapping from the process address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub writable: bool,
    pub executable: bool,
    pub path: Option<String>,
}

impl MemoryRegion {
    /// Parses one `/proc/<pid>/maps` line.
    pub fn parse_maps_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?;
        // offset, device, inode
        let mut fields = fields.skip(3);
        let path = fields.next().map(str::to_string);
        Some(Self {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            writable: perms.as_bytes().get(1) == Some(&b'w'),
            executable: perms.as_bytes().get(2) == Some(&b'x'),
            path,
        })
    }

    pub fn is_anonymous(&self) -> bool {
        match &self.path {
            None => true,
            Some(path) => path.starts_with('[') && path != "[vdso]" && path != "[vsyscall]",
        }
    }
}

/// Everything the checks need to know about the host. Methods returning
/// `Option` answer `None` when the platform cannot tell.
pub trait DeviceProbe: Send + Sync {
    fn platform(&self) -> Platform;
    fn path_exists(&self, path: &str) -> bool;
    fn can_read(&self, path: &str) -> bool;
    fn is_writable(&self, dir: &str) -> bool;
    fn can_open_url(&self, _scheme: &str) -> bool {
        false
    }
    fn env_var(&self, name: &str) -> Option<String>;
    fn running_processes(&self) -> Result<Vec<String>>;
    fn loaded_libraries(&self) -> Result<Vec<String>>;
    fn executable_regions(&self) -> Result<Vec<MemoryRegion>>;
    fn debugger_attached(&self) -> Option<bool>;
    fn is_privileged(&self) -> Option<bool>;
    fn executable_path(&self) -> Result<PathBuf>;
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;
    fn passcode_set(&self) -> Option<bool>;
    fn biometric_status(&self) -> BiometricStatus;
    fn storage_encrypted(&self) -> Option<bool>;
    fn os_version(&self) -> Option<OsVersion>;
    fn is_simulator(&self) -> bool;

    fn stack_protection_intact(&self) -> Option<bool> {
        None
    }

    fn control_flow_integrity_intact(&self) -> Option<bool> {
        None
    }
}

/// Probe backed by the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl HostProbe {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceProbe for HostProbe {
    fn platform(&self) -> Platform {
        Platform::current()
    }

    fn path_exists(&self, path: &str) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn can_read(&self, path: &str) -> bool {
        std::fs::File::open(path).is_ok()
    }

    fn is_writable(&self, dir: &str) -> bool {
        tempfile::Builder::new()
            .prefix(".wwprobe")
            .tempfile_in(dir)
            .is_ok()
    }

    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn running_processes(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir("/proc").context("Failed to list /proc")? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(pid) = file_name.to_str() else { continue };
            if !pid.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            // Processes exit between listing and reading.
            if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
                names.push(comm.trim().to_string());
            }
        }
        Ok(names)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn running_processes(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn loaded_libraries(&self) -> Result<Vec<String>> {
        let maps = std::fs::read_to_string("/proc/self/maps").context("Failed to read /proc/self/maps")?;
        let mut seen = HashSet::new();
        let mut libraries = Vec::new();
        for region in maps.lines().filter_map(MemoryRegion::parse_maps_line) {
            if let Some(path) = region.path {
                if (path.ends_with(".so") || path.contains(".so.")) && seen.insert(path.clone()) {
                    libraries.push(path);
                }
            }
        }
        Ok(libraries)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn loaded_libraries(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn executable_regions(&self) -> Result<Vec<MemoryRegion>> {
        let maps = std::fs::read_to_string("/proc/self/maps").context("Failed to read /proc/self/maps")?;
        Ok(maps
            .lines()
            .filter_map(MemoryRegion::parse_maps_line)
            .filter(|region| region.executable)
            .collect())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn executable_regions(&self) -> Result<Vec<MemoryRegion>> {
        Ok(Vec::new())
    }

    fn debugger_attached(&self) -> Option<bool> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let status = std::fs::read_to_string("/proc/self/status").ok()?;
            let tracer = status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))?
                .trim()
                .parse::<u32>()
                .ok()?;
            Some(tracer != 0)
        }

        #[cfg(windows)]
        {
            // SAFETY: IsDebuggerPresent takes no arguments and only reads the PEB.
            let present = unsafe { winapi::um::debugapi::IsDebuggerPresent() };
            Some(present != 0)
        }

        #[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
        {
            None
        }
    }

    fn is_privileged(&self) -> Option<bool> {
        #[cfg(unix)]
        {
            Some(nix::unistd::geteuid().is_root())
        }

        #[cfg(not(unix))]
        {
            None
        }
    }

    fn executable_path(&self) -> Result<PathBuf> {
        std::env::current_exe().context("Failed to resolve executable path")
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path).with_context(|| format!("Failed to list {}", path.display()))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn passcode_set(&self) -> Option<bool> {
        None
    }

    fn biometric_status(&self) -> BiometricStatus {
        BiometricStatus::Unknown
    }

    fn storage_encrypted(&self) -> Option<bool> {
        #[cfg(target_os = "linux")]
        {
            // dm-crypt volumes carry a CRYPT- prefixed device-mapper uuid.
            let blocks = std::fs::read_dir("/sys/block").ok()?;
            for block in blocks.flatten() {
                if let Ok(uuid) = std::fs::read_to_string(block.path().join("dm/uuid")) {
                    if uuid.starts_with("CRYPT-") {
                        return Some(true);
                    }
                }
            }
            None
        }

        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    fn os_version(&self) -> Option<OsVersion> {
        #[cfg(unix)]
        {
            let uts = nix::sys::utsname::uname().ok()?;
            OsVersion::parse(uts.release().to_str()?)
        }

        #[cfg(not(unix))]
        {
            None
        }
    }

    fn is_simulator(&self) -> bool {
        std::env::var_os("SIMULATOR_DEVICE_NAME").is_some()
            || std::env::var_os("ANDROID_EMULATOR").is_some()
    }
}

/// Facts reported to a [`StaticProbe`]. A native shell can collect these
/// through platform APIs and hand them over; tests build them directly.
#[derive(Debug, Clone)]
pub struct ProbeFacts {
    pub platform: Platform,
    pub existing_paths: HashSet<String>,
    pub readable_paths: HashSet<String>,
    pub writable_dirs: HashSet<String>,
    pub openable_schemes: HashSet<String>,
    pub env: HashMap<String, String>,
    pub processes: Vec<String>,
    pub libraries: Vec<String>,
    pub regions: Vec<MemoryRegion>,
    pub debugger_attached: Option<bool>,
    pub privileged: Option<bool>,
    pub executable: PathBuf,
    pub files: HashMap<PathBuf, Vec<u8>>,
    pub passcode_set: Option<bool>,
    pub biometrics: BiometricStatus,
    pub storage_encrypted: Option<bool>,
    pub os_version: Option<OsVersion>,
    pub simulator: bool,
    pub stack_protection: Option<bool>,
    pub control_flow_integrity: Option<bool>,
    /// Makes process enumeration fail, for exercising error paths.
    pub process_listing_error: Option<String>,
}

impl Default for ProbeFacts {
    /// A healthy, fully known device.
    fn default() -> Self {
        let executable = PathBuf::from("/app/WealthWise.app/WealthWise");
        let mut files = HashMap::new();
        files.insert(executable.clone(), b"wealthwise executable image".to_vec());
        Self {
            platform: Platform::Ios,
            existing_paths: HashSet::new(),
            readable_paths: HashSet::new(),
            writable_dirs: HashSet::new(),
            openable_schemes: HashSet::new(),
            env: HashMap::new(),
            processes: vec!["launchd".to_string(), "WealthWise".to_string()],
            libraries: vec!["/usr/lib/libSystem.B.dylib".to_string()],
            regions: Vec::new(),
            debugger_attached: Some(false),
            privileged: Some(false),
            executable,
            files,
            passcode_set: Some(true),
            biometrics: BiometricStatus::Available,
            storage_encrypted: Some(true),
            os_version: Some(OsVersion::new(17, 4, 0)),
            simulator: false,
            stack_protection: None,
            control_flow_integrity: None,
            process_listing_error: None,
        }
    }
}

/// Probe answering from a mutable fact sheet.
#[derive(Debug, Default)]
pub struct StaticProbe {
    facts: RwLock<ProbeFacts>,
}

impl StaticProbe {
    pub fn new(facts: ProbeFacts) -> Self {
        Self {
            facts: RwLock::new(facts),
        }
    }

    pub fn update(&self, apply: impl FnOnce(&mut ProbeFacts)) {
        if let Ok(mut facts) = self.facts.write() {
            apply(&mut facts);
        }
    }

    fn read<T>(&self, f: impl FnOnce(&ProbeFacts) -> T) -> T {
        match self.facts.read() {
            Ok(facts) => f(&facts),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl DeviceProbe for StaticProbe {
    fn platform(&self) -> Platform {
        self.read(|f| f.platform)
    }

    fn path_exists(&self, path: &str) -> bool {
        self.read(|f| f.existing_paths.contains(path))
    }

    fn can_read(&self, path: &str) -> bool {
        self.read(|f| f.readable_paths.contains(path))
    }

    fn is_writable(&self, dir: &str) -> bool {
        self.read(|f| f.writable_dirs.contains(dir))
    }

    fn can_open_url(&self, scheme: &str) -> bool {
        self.read(|f| f.openable_schemes.contains(scheme))
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.read(|f| f.env.get(name).cloned())
    }

    fn running_processes(&self) -> Result<Vec<String>> {
        self.read(|f| match &f.process_listing_error {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(f.processes.clone()),
        })
    }

    fn loaded_libraries(&self) -> Result<Vec<String>> {
        Ok(self.read(|f| f.libraries.clone()))
    }

    fn executable_regions(&self) -> Result<Vec<MemoryRegion>> {
        Ok(self.read(|f| f.regions.clone()))
    }

    fn debugger_attached(&self) -> Option<bool> {
        self.read(|f| f.debugger_attached)
    }

    fn is_privileged(&self) -> Option<bool> {
        self.read(|f| f.privileged)
    }

    fn executable_path(&self) -> Result<PathBuf> {
        Ok(self.read(|f| f.executable.clone()))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.read(|f| f.files.get(path).cloned())
            .with_context(|| format!("No such file: {}", path.display()))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.read(|f| {
            f.files
                .keys()
                .filter(|file| file.parent() == Some(path))
                .filter_map(|file| file.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect()
        });
        names.sort();
        Ok(names)
    }

    fn passcode_set(&self) -> Option<bool> {
        self.read(|f| f.passcode_set)
    }

    fn biometric_status(&self) -> BiometricStatus {
        self.read(|f| f.biometrics)
    }

    fn storage_encrypted(&self) -> Option<bool> {
        self.read(|f| f.storage_encrypted)
    }

    fn os_version(&self) -> Option<OsVersion> {
        self.read(|f| f.os_version)
    }

    fn is_simulator(&self) -> bool {
        self.read(|f| f.simulator)
    }

    fn stack_protection_intact(&self) -> Option<bool> {
        self.read(|f| f.stack_protection)
    }

    fn control_flow_integrity_intact(&self) -> Option<bool> {
        self.read(|f| f.control_flow_integrity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("5.15.0-91-generic", Some(OsVersion::new(5, 15, 0)))]
    #[case("17.4", Some(OsVersion::new(17, 4, 0)))]
    #[case("6", Some(OsVersion::new(6, 0, 0)))]
    #[case("23.1.0", Some(OsVersion::new(23, 1, 0)))]
    #[case("", None)]
    #[case("beta", None)]
    fn test_os_version_parse(#[case] raw: &str, #[case] expected: Option<OsVersion>) {
        assert_eq!(OsVersion::parse(raw), expected);
    }

    #[test]
    fn test_os_version_ordering() {
        assert!(OsVersion::new(5, 4, 0) < OsVersion::new(5, 15, 0));
        assert!(OsVersion::new(16, 9, 9) < OsVersion::new(17, 0, 0));
    }

    #[test]
    fn test_parse_maps_line() {
        let region = MemoryRegion::parse_maps_line(
            "7f2c1a000000-7f2c1a021000 r-xp 00000000 08:01 1835 /usr/lib/x86_64-linux-gnu/libc.so.6",
        )
        .unwrap();
        assert_eq!(region.start, 0x7f2c1a000000);
        assert!(region.executable);
        assert!(!region.writable);
        assert_eq!(region.path.as_deref(), Some("/usr/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(!region.is_anonymous());

        let anon = MemoryRegion::parse_maps_line("7f00-8f00 rwxp 00000000 00:00 0").unwrap();
        assert!(anon.writable && anon.executable);
        assert!(anon.is_anonymous());

        assert!(MemoryRegion::parse_maps_line("garbage").is_none());
    }

    #[test]
    fn test_static_probe_updates() {
        let probe = StaticProbe::default();
        assert_eq!(probe.passcode_set(), Some(true));
        probe.update(|facts| facts.passcode_set = Some(false));
        assert_eq!(probe.passcode_set(), Some(false));
        assert_eq!(probe.stack_protection_intact(), None);
    }

    #[test]
    fn test_static_probe_lists_bundle_dir() {
        let probe = StaticProbe::default();
        probe.update(|facts| {
            facts
                .files
                .insert(PathBuf::from("/app/WealthWise.app/inject.dylib"), Vec::new());
        });
        let names = probe.list_dir(Path::new("/app/WealthWise.app")).unwrap();
        assert_eq!(names, vec!["WealthWise".to_string(), "inject.dylib".to_string()]);
    }

    #[test]
    fn test_host_probe_basics() {
        let probe = HostProbe::new();
        assert!(probe.executable_path().is_ok());
        assert!(!probe.path_exists("/definitely/not/a/real/path"));
        let temp = tempfile::TempDir::new().unwrap();
        assert!(probe.is_writable(temp.path().to_str().unwrap()));
    }
}

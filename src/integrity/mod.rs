//! Device and application integrity: check battery, verdict caching and
//! background posture monitoring.

pub mod cache;
pub mod checks;
pub mod monitor;
pub mod probe;
pub mod result;
pub mod validator;
pub mod violation;

pub use cache::{Clock, ManualClock, SystemClock, TtlCache};
pub use checks::{CheckCategory, CheckOutcome, IntegrityCheck};
pub use monitor::{SecurityEvent, StateChangeEvent};
pub use probe::{BiometricStatus, DeviceProbe, HostProbe, OsVersion, Platform, ProbeFacts, StaticProbe};
pub use result::{DeviceSecurityState, ValidationResult, ValidationScope};
pub use validator::{IntegrityValidator, IntegrityValidatorBuilder};
pub use violation::{SecurityViolation, Severity};

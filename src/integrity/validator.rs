use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::cache::{Clock, SystemClock, TtlCache};
use super::checks::{default_checks, CheckCategory, CheckOutcome, IntegrityCheck};
use super::monitor::{MonitorHandle, SecurityEvent, StateChangeEvent};
use super::probe::{DeviceProbe, HostProbe};
use super::result::{DeviceSecurityState, ValidationResult, ValidationScope};
use super::violation::SecurityViolation;
use crate::config::IntegrityConfig;
use crate::error::ConfigError;

const EVENT_CAPACITY: usize = 64;

/// Runs the integrity check battery, caches verdicts per scope and owns the
/// background monitor. Clones share all state.
#[derive(Clone)]
pub struct IntegrityValidator {
    inner: Arc<ValidatorInner>,
}

struct ValidatorInner {
    probe: Arc<dyn DeviceProbe>,
    checks: Vec<Arc<dyn IntegrityCheck>>,
    clock: Arc<dyn Clock>,
    cache: TtlCache<ValidationScope, ValidationResult>,
    /// Serializes cache refreshes so concurrent misses compute once.
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<SecurityEvent>,
    history: Mutex<VecDeque<StateChangeEvent>>,
    history_limit: usize,
    last_state: Mutex<Option<DeviceSecurityState>>,
    last_lightweight: Mutex<Option<ValidationResult>>,
    monitor_interval: Duration,
    monitor: Mutex<Option<MonitorHandle>>,
}

pub struct IntegrityValidatorBuilder {
    config: IntegrityConfig,
    probe: Option<Arc<dyn DeviceProbe>>,
    clock: Option<Arc<dyn Clock>>,
    checks: Option<Vec<Arc<dyn IntegrityCheck>>>,
}

impl IntegrityValidatorBuilder {
    pub fn probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the configured battery.
    pub fn checks(mut self, checks: Vec<Arc<dyn IntegrityCheck>>) -> Self {
        self.checks = Some(checks);
        self
    }

    pub fn build(self) -> Result<IntegrityValidator, ConfigError> {
        let checks = match self.checks {
            Some(checks) => checks,
            None => default_checks(&self.config)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(IntegrityValidator {
            inner: Arc::new(ValidatorInner {
                probe: self.probe.unwrap_or_else(|| Arc::new(HostProbe::new())),
                checks,
                cache: TtlCache::new(self.config.cache_ttl(), clock.clone()),
                clock,
                refresh_lock: Mutex::new(()),
                events,
                history: Mutex::new(VecDeque::new()),
                history_limit: self.config.state_history_limit.max(1),
                last_state: Mutex::new(None),
                last_lightweight: Mutex::new(None),
                monitor_interval: self.config.monitor_interval(),
                monitor: Mutex::new(None),
            }),
        })
    }
}

impl IntegrityValidator {
    pub fn builder(config: &IntegrityConfig) -> IntegrityValidatorBuilder {
        IntegrityValidatorBuilder {
            config: config.clone(),
            probe: None,
            clock: None,
            checks: None,
        }
    }

    /// Validator over the running host with the configured battery.
    pub fn new(config: &IntegrityConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub async fn validate_now(&self) -> ValidationResult {
        self.validate(ValidationScope::Comprehensive).await
    }

    pub async fn validate_category(&self, category: CheckCategory) -> ValidationResult {
        self.validate(ValidationScope::Category(category)).await
    }

    /// Cached verdict for `scope` if still fresh, otherwise a new pass.
    pub async fn validate(&self, scope: ValidationScope) -> ValidationResult {
        let inner = &self.inner;
        if let Some(cached) = inner.cache.get(&scope).await {
            debug!(?scope, "Integrity verdict served from cache");
            return cached;
        }

        let _refresh = inner.refresh_lock.lock().await;
        if let Some(cached) = inner.cache.get(&scope).await {
            return cached;
        }

        let result = inner.run_checks(scope).await;
        inner.cache.insert(scope, result.clone()).await;
        result
    }

    pub async fn invalidate_cache(&self) {
        self.inner.cache.clear().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.inner.events.subscribe()
    }

    /// Recorded posture changes, oldest first.
    pub async fn state_history(&self) -> Vec<StateChangeEvent> {
        self.inner.history.lock().await.iter().cloned().collect()
    }

    /// Starts the background monitor; a no-op while one is running.
    pub async fn start_monitoring(&self) {
        let mut monitor = self.inner.monitor.lock().await;
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak: Weak<ValidatorInner> = Arc::downgrade(&self.inner);
        *monitor = Some(MonitorHandle::spawn(self.inner.monitor_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.monitor_tick().await;
                        true
                    }
                    None => false,
                }
            }
        }));
        info!(
            interval_ms = self.inner.monitor_interval.as_millis() as u64,
            "Integrity monitoring started"
        );
    }

    pub async fn stop_monitoring(&self) {
        let handle = self.inner.monitor.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
            info!("Integrity monitoring stopped");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl ValidatorInner {
    fn checks_for(&self, scope: ValidationScope) -> Vec<Arc<dyn IntegrityCheck>> {
        self.checks
            .iter()
            .filter(|check| match scope {
                ValidationScope::Comprehensive => true,
                ValidationScope::Category(category) => check.category() == category,
                ValidationScope::Lightweight => check.is_lightweight(),
            })
            .cloned()
            .collect()
    }

    /// Runs every check in `scope` on the blocking pool and folds the
    /// outcomes in battery order.
    async fn run_checks(&self, scope: ValidationScope) -> ValidationResult {
        let checks = self.checks_for(scope);
        let runs = checks.iter().map(|check| {
            let check = check.clone();
            let probe = self.probe.clone();
            tokio::task::spawn_blocking(move || check.execute(probe.as_ref()))
        });
        let outcomes = join_all(runs).await;

        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        for (check, joined) in checks.iter().zip(outcomes) {
            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => failure(check.name(), format!("{:#}", e)),
                Err(e) => failure(check.name(), e.to_string()),
            };
            for violation in &outcome.violations {
                warn!(check = check.name(), "{}", violation);
            }
            violations.extend(outcome.violations);
            warnings.extend(outcome.warnings);
        }

        let result = ValidationResult::new(violations, warnings, self.clock.now());
        info!(
            ?scope,
            valid = result.is_valid,
            risk_score = result.risk_score,
            violations = result.violations.len(),
            warnings = result.warnings.len(),
            "Integrity validation completed"
        );
        result
    }

    /// One monitor pass: lightweight checks, posture drift, verdict drift.
    async fn monitor_tick(&self) {
        let result = self.run_checks(ValidationScope::Lightweight).await;
        let now = self.clock.now();
        let state = DeviceSecurityState::capture(self.probe.as_ref(), now);
        let mut stale = false;

        {
            let mut last_state = self.last_state.lock().await;
            if let Some(previous) = last_state.as_ref() {
                if previous.differs_from(&state) {
                    let event = StateChangeEvent {
                        previous: previous.clone(),
                        current: state.clone(),
                        detected_at: now,
                    };
                    warn!("Device security state changed");
                    {
                        let mut history = self.history.lock().await;
                        history.push_back(event.clone());
                        while history.len() > self.history_limit {
                            history.pop_front();
                        }
                    }
                    let _ = self.events.send(SecurityEvent::StateChanged(event));
                    stale = true;
                }
            }
            *last_state = Some(state);
        }

        {
            let mut last = self.last_lightweight.lock().await;
            let degraded = match last.as_ref() {
                Some(previous) => !result.new_violations(previous).is_empty(),
                None => !result.is_valid,
            };
            if degraded {
                warn!(risk_score = result.risk_score, "Integrity verdict degraded");
                let _ = self.events.send(SecurityEvent::VerdictDegraded(result.clone()));
                stale = true;
            }
            *last = Some(result.clone());
        }

        if stale {
            self.cache.clear().await;
        }
        self.cache.insert(ValidationScope::Lightweight, result).await;
    }
}

fn failure(check: &str, detail: String) -> CheckOutcome {
    warn!(check, "Integrity check could not complete: {}", detail);
    let mut outcome = CheckOutcome::default();
    outcome.violation(SecurityViolation::CheckFailure {
        check: check.to_string(),
        detail,
    });
    outcome
}

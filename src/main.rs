use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use wealthwise_security::integrity::SecurityEvent;
use wealthwise_security::logging::init_logging;
use wealthwise_security::{SecurityConfig, SecurityServices};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SecurityConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let _log_guard = init_logging(&config.logging)?;

    info!("Starting WealthWise security daemon");
    let services = SecurityServices::from_config(&config).context("Failed to initialise security services")?;
    let integrity = services.integrity().clone();

    let verdict = integrity.validate_now().await;
    if verdict.is_valid {
        info!(risk_score = verdict.risk_score, warnings = verdict.warnings.len(), "Device passed integrity validation");
    } else {
        warn!(
            risk_score = verdict.risk_score,
            violations = verdict.violations.len(),
            "Device failed integrity validation"
        );
    }

    let mut events = integrity.subscribe();
    integrity.start_monitoring().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(SecurityEvent::StateChanged(change)) => {
                    warn!(
                        previous = ?change.previous,
                        current = ?change.current,
                        "Device security state changed"
                    );
                }
                Ok(SecurityEvent::VerdictDegraded(result)) => {
                    for violation in &result.violations {
                        warn!("{}", violation);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped security events"),
                Err(RecvError::Closed) => {
                    error!("Security event channel closed");
                    break;
                }
            },
        }
    }

    integrity.stop_monitoring().await;
    info!("WealthWise security daemon stopped");
    Ok(())
}

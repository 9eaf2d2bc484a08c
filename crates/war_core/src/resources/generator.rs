//! Timed resource production.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::manager::{ResourceManager, Submitter};
use super::{ResourceAmounts, ResourceEvent, ResourceEventKind, Severity};
use crate::error::{Result, WarError};
use crate::lifecycle::CancelToken;

#[derive(Debug)]
struct GeneratorState {
    resource: String,
    burst: i64,
    rate: watch::Sender<f64>,
    running: Mutex<Option<CancelToken>>,
}

/// Adds `burst` units of one resource every `burst / rate` seconds.
///
/// Production goes through the ledger like any other transaction, so it is
/// clamped at capacity; the excess is dropped, never queued.
#[derive(Debug, Clone)]
pub struct ResourceGenerator {
    state: Arc<GeneratorState>,
}

/// Shortest accepted production period.
const MIN_PERIOD: Duration = Duration::from_millis(1);
/// Longest accepted production period.
const MAX_PERIOD: Duration = Duration::from_secs(86_400 * 365);

fn interval_for(rate: f64, burst: i64) -> Duration {
    Duration::try_from_secs_f64(burst as f64 / rate)
        .unwrap_or(MAX_PERIOD)
        .clamp(MIN_PERIOD, MAX_PERIOD)
}

fn validate(rate: f64, burst: i64) -> Result<()> {
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(WarError::InvalidArgument(format!(
            "generation rate must be positive, got {rate}"
        )));
    }
    if burst <= 0 {
        return Err(WarError::InvalidArgument(format!(
            "generation burst must be positive, got {burst}"
        )));
    }
    match Duration::try_from_secs_f64(burst as f64 / rate) {
        Ok(period) if (MIN_PERIOD..=MAX_PERIOD).contains(&period) => Ok(()),
        _ => Err(WarError::InvalidArgument(format!(
            "generation period for rate {rate} and burst {burst} must be between \
             {MIN_PERIOD:?} and {MAX_PERIOD:?}"
        ))),
    }
}

impl ResourceGenerator {
    /// `rate` is units per second, `burst` the amount added per tick.
    pub fn new(resource: impl Into<String>, rate: f64, burst: i64) -> Result<Self> {
        validate(rate, burst)?;
        let (rate, _) = watch::channel(rate);
        Ok(Self {
            state: Arc::new(GeneratorState {
                resource: resource.into(),
                burst,
                rate,
                running: Mutex::new(None),
            }),
        })
    }

    /// Resource this generator feeds.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.state.resource
    }

    /// Units per second.
    #[must_use]
    pub fn rate(&self) -> f64 {
        *self.state.rate.borrow()
    }

    /// Time between ticks.
    #[must_use]
    pub fn interval(&self) -> Duration {
        interval_for(self.rate(), self.state.burst)
    }

    /// Whether the production loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state
            .running
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Change the rate. Takes effect from the next tick.
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        validate(rate, self.state.burst)?;
        self.state.rate.send_replace(rate);
        Ok(())
    }

    /// Start producing into `manager`. No-op if already running.
    pub fn start(&self, manager: &ResourceManager) -> Result<()> {
        let token = {
            let mut running = self.state.running.lock();
            if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return Ok(());
            }
            if manager.cancel_token().is_cancelled() {
                return Err(WarError::ShuttingDown("resource manager".into()));
            }
            let token = manager.cancel_token().child();
            *running = Some(token.clone());
            token
        };
        manager.tasks().spawn(produce(
            Arc::clone(&self.state),
            manager.submitter().clone(),
            token,
        ));
        manager.publish(ResourceEvent::new(
            ResourceEventKind::GeneratorStarted,
            Severity::Info,
            ResourceAmounts::from([(self.state.resource.clone(), self.state.burst)]),
            format!("generator for {} started", self.state.resource),
        ));
        tracing::info!(resource = %self.state.resource, rate = self.rate(), "generator started");
        Ok(())
    }

    /// Stop producing. Idempotent.
    pub fn stop(&self) {
        if let Some(token) = self.state.running.lock().take() {
            if token.cancel() {
                tracing::info!(resource = %self.state.resource, "generator stopped");
            }
        }
    }
}

async fn produce(state: Arc<GeneratorState>, submitter: Submitter, cancel: CancelToken) {
    let mut rate = state.rate.subscribe();
    let mut period = interval_for(*rate.borrow_and_update(), state.burst);
    let mut next = tokio::time::Instant::now() + period;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = rate.changed() => {
                if changed.is_err() {
                    break;
                }
                period = interval_for(*rate.borrow_and_update(), state.burst);
                next = tokio::time::Instant::now() + period;
            }
            () = tokio::time::sleep_until(next) => {
                if submitter.is_cancelled() {
                    break;
                }
                submitter.generate(&state.resource, state.burst);
                next += period;
            }
        }
    }
    tracing::debug!(resource = %state.resource, "generator loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;

    #[test]
    fn test_interval_from_rate_and_burst() {
        let generator = ResourceGenerator::new("minerals", 10.0, 5).unwrap();
        assert_eq!(generator.interval(), Duration::from_millis(500));
        generator.set_rate(20.0).unwrap();
        assert_eq!(generator.interval(), Duration::from_millis(250));
        assert!(generator.set_rate(0.0).is_err());
        assert!(ResourceGenerator::new("minerals", 1.0, 0).is_err());
    }

    #[test]
    fn test_period_bounds() {
        for (rate, burst) in [(1e-300, 1), (f64::MIN_POSITIVE, i64::MAX), (1e9, 1), (f64::MAX, 5)] {
            assert!(
                matches!(
                    ResourceGenerator::new("minerals", rate, burst),
                    Err(WarError::InvalidArgument(_))
                ),
                "rate {rate} burst {burst} accepted"
            );
        }
        let generator = ResourceGenerator::new("minerals", 1000.0, 1).unwrap();
        assert_eq!(generator.interval(), MIN_PERIOD);
        assert!(generator.set_rate(1e-300).is_err());
        assert_eq!(generator.rate(), 1000.0);
        assert_eq!(interval_for(1e-300, 1), MAX_PERIOD);
        assert_eq!(interval_for(f64::MAX, 1), MIN_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_clamps_at_max() {
        let rm = ResourceManager::new(ResourceConfig::default(), &CancelToken::new(), []).unwrap();
        rm.add_resource("gas", 90, 100).await.unwrap();
        rm.add_generator(ResourceGenerator::new("gas", 8.0, 4).unwrap())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(rm.resource_levels()["gas"], 100);
        assert!(rm.generator("gas").unwrap().is_running());

        rm.remove_generator("gas").unwrap();
        assert!(matches!(
            rm.remove_generator("gas"),
            Err(WarError::NotFound { .. })
        ));
        rm.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_produces_on_schedule() {
        let rm = ResourceManager::new(ResourceConfig::default(), &CancelToken::new(), []).unwrap();
        rm.add_resource("minerals", 0, 1000).await.unwrap();
        let generator = ResourceGenerator::new("minerals", 10.0, 5).unwrap();
        rm.add_generator(generator.clone()).unwrap();
        assert!(matches!(
            rm.add_generator(generator.clone()),
            Err(WarError::AlreadyExists { .. })
        ));

        tokio::time::sleep(Duration::from_millis(1250)).await;
        assert_eq!(rm.resource_levels()["minerals"], 10);

        generator.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rm.resource_levels()["minerals"], 10);
    }
}

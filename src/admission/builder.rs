//! Fluent builder for the admission controller
//!
//! Wires the pool, queue, monitor, health reporter and shutdown coordinator
//! together from one [`AdmissionConfig`].

use super::controller::{AdmissionController, ControllerInner};
use super::gate::PoolGate;
use super::probe::FactoryProbe;
use super::shutdown::ShutdownCoordinator;
use crate::Result;
use dbgate_config::AdmissionConfig;
use dbgate_core::{SharedClock, system_clock};
use dbgate_monitor::{HealthProbe, HealthReporter, PerformanceMonitor};
use dbgate_pool::{ConnectionFactory, ConnectionPool};
use dbgate_queue::RequestQueue;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Admission controller builder
///
/// # Example
///
/// ```rust,no_run,ignore
/// use dbgate::AdmissionBuilder;
///
/// #[tokio::main]
/// async fn main() -> dbgate::Result<()> {
///     let controller = AdmissionBuilder::new()
///         .config(config)
///         .build(MyFactory::new())?;
///     controller.start().await;
///     Ok(())
/// }
/// ```
#[derive(Default)]
pub struct AdmissionBuilder {
    /// Admission configuration
    config: AdmissionConfig,
    /// Time source for windows, cooldowns and queue deadlines
    clock: Option<SharedClock>,
    /// Reachability probe used by health checks
    probe: Option<Arc<dyn HealthProbe>>,
}

impl AdmissionBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file, then apply `DBGATE_*` environment overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML file
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new().config(AdmissionConfig::from_file_with_env(path)?))
    }

    /// Set custom configuration
    ///
    /// # Arguments
    ///
    /// * `config` - Custom [`AdmissionConfig`]
    pub fn config(mut self, config: AdmissionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time source
    ///
    /// Defaults to the system clock. Tests use a manual clock to drive
    /// metric windows and alert cooldowns.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the reachability probe
    ///
    /// Defaults to calling [`ConnectionFactory::ping`].
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate the configuration and build the controller
    ///
    /// No connection is opened here; call
    /// [`AdmissionController::start`] to warm the pool.
    pub fn build<F: ConnectionFactory>(self, factory: F) -> Result<AdmissionController<F>> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let pool = ConnectionPool::new(config.pool.clone(), factory);
        let draining = CancellationToken::new();
        let queue = RequestQueue::new(
            &config.queue,
            Arc::clone(&clock),
            PoolGate::new(pool.clone(), draining.clone()),
        );
        let monitor = Arc::new(PerformanceMonitor::new(&config.monitor, Arc::clone(&clock)));

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(FactoryProbe::new(pool.clone())) as Arc<dyn HealthProbe>);
        let health = HealthReporter::new(
            config.health.clone(),
            config.queue.max_queue_size,
            probe,
            clock,
        );

        let background = CancellationToken::new();
        let shutdown = ShutdownCoordinator::new(
            config.shutdown.clone(),
            pool.clone(),
            queue.clone(),
            background.clone(),
            draining,
        );

        info!("{}", config.summary());

        Ok(AdmissionController::from_inner(ControllerInner {
            config,
            pool,
            queue,
            monitor,
            health,
            shutdown,
            background,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use async_trait::async_trait;
    use dbgate_core::BoxError;

    struct NullFactory;

    #[async_trait]
    impl ConnectionFactory for NullFactory {
        type Connection = ();

        async fn create(&self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = AdmissionConfig::default();
        config.pool.max = 0;

        let result = AdmissionBuilder::new().config(config).build(NullFactory);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_build_defaults() {
        let controller = AdmissionBuilder::new().build(NullFactory).unwrap();
        assert_eq!(controller.queue_len(), 0);
        assert_eq!(controller.pool_stats().total, 0);
        assert_eq!(
            controller.config().queue.max_queue_size,
            AdmissionConfig::default().queue.max_queue_size
        );
    }
}

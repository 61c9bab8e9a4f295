//! Application entry point and builder pattern implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast::error::RecvError,
};

use crate::{
    config::{Config, ConfigManager},
    config_watcher,
    drivers::{self, PlatformInfo},
    error::ControlError,
    event::{Event, EventBus},
    supervisor::{StatusSnapshot, Supervisor, SupervisorOptions},
    task_manager::TaskManager,
    temperature_sensors::sysfs::SysfsTemperatureSensor,
};

/// Main application structure that owns the supervisor and background tasks.
///
/// Runs until SIGINT or SIGTERM. SIGHUP and edits to the configuration file
/// reload the fan configuration.
///
/// # Example
///
/// ```no_run
/// use ecfand::application::Application;
/// use ecfand::config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = config::ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()
///     .await?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    supervisor: Arc<Supervisor>,
    config_manager: ConfigManager,
    overrides: Overrides,
    events: EventBus,
    tasks: TaskManager,
}

/// Command line settings that win over the configuration file.
#[derive(Debug, Clone, Default)]
struct Overrides {
    read_only: bool,
    driver: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        config.read_only |= self.read_only;
        if let Some(driver) = &self.driver {
            config.ec_driver = Some(driver.clone());
        }
    }
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.supervisor.status().await
    }

    /// Handles signals and events until asked to stop, then restores the EC.
    pub async fn run(&mut self) -> Result<()> {
        let mut receiver = self.events.subscribe();
        let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("SIGHUP handler")?;

        info!("ecfand running");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    self.reload().await;
                }
                received = receiver.recv() => match received {
                    Ok(Event::ConfigChangeDetected) => self.reload().await,
                    Ok(Event::ProtocolDegraded { driver }) => {
                        warn!("EC driver {driver} no longer waits for data before reads");
                    }
                    Ok(Event::SystemShutdown) => break,
                    Err(RecvError::Lagged(missed)) => warn!("Missed {missed} events"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.shutdown().await
    }

    /// Reloads the file and restarts fan control with it. The running
    /// configuration is kept if the file does not load.
    async fn reload(&self) {
        if let Err(e) = self.config_manager.reload().await {
            error!("Configuration reload failed, keeping current settings: {e:#}");
            return;
        }

        let mut config = self.config_manager.clone_config().await;
        self.overrides.apply(&mut config);
        if SupervisorOptions::from(&config) != *self.supervisor.options() {
            warn!("Driver, timing and filter settings apply after a restart");
        }

        match self.supervisor.reload(config.fan_control).await {
            Ok(()) => info!("Fan configuration reloaded"),
            Err(e @ ControlError::BusBusy { .. }) => {
                warn!("Fan configuration not swapped, still running the previous one: {e}");
            }
            Err(e) => error!("Failed to apply reloaded configuration: {e}"),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down");
        if let Err(e) = self.events.publish(Event::SystemShutdown) {
            log::debug!("No subscribers for shutdown event: {e}");
        }

        if let Err(e) = self.supervisor.stop().await {
            warn!("Stopping fan control: {e}");
        }
        self.tasks.shutdown_all().await
    }
}

/// Builder pattern for creating Application instances.
pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    overrides: Overrides,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
            overrides: Overrides::default(),
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Forces read-only mode regardless of the configuration file.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.overrides.read_only = read_only;
        self
    }

    pub fn with_driver(mut self, driver: Option<String>) -> Self {
        self.overrides.driver = driver;
        self
    }

    /// Detects the platform, opens the sensor and starts fan control.
    ///
    /// Fails if no EC driver can be used.
    pub async fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow::anyhow!("Configuration manager is required"))?;

        let mut config = config_manager.clone_config().await;
        self.overrides.apply(&mut config);

        let platform = PlatformInfo::detect().context("Failed to detect platform")?;
        info!("Platform: {:?} {}", platform.id, platform.version);

        let sensor = SysfsTemperatureSensor::from_config(&config.sensor)?;
        info!("Temperature sensor: {}", sensor.path().display());

        let events = EventBus::new();
        let supervisor = Arc::new(
            Supervisor::new(
                drivers::registry(),
                platform,
                Arc::new(sensor),
                SupervisorOptions::from(&config),
            )
            .with_events(events.clone()),
        );
        supervisor
            .start(config.fan_control)
            .await
            .context("Failed to start fan control")?;

        let mut tasks = TaskManager::new();
        if config.watch_config {
            config_watcher::spawn(
                &mut tasks,
                config_manager.path().to_path_buf(),
                events.clone(),
                config_watcher::DEBOUNCE,
            );
        }

        Ok(Application {
            supervisor,
            config_manager,
            overrides: self.overrides,
            events,
            tasks,
        })
    }
}

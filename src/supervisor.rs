//! Fan control supervision.
//!
//! The [`Supervisor`] owns the EC channel, the temperature filter and one
//! [`FanSpeedManager`] per fan. While running, a single poll task wakes up
//! every `poll_interval_ms`, takes the EC bus, reads and filters the
//! temperature and writes every fan. Manual requests go through the same bus
//! lock, so nothing ever talks to the EC concurrently.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ecfand::{
//!     config::ConfigManager,
//!     drivers::{self, PlatformInfo},
//!     supervisor::{Supervisor, SupervisorOptions},
//!     temperature_sensors::sysfs::SysfsTemperatureSensor,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConfigManager::load(None).await?.clone_config().await;
//! let sensor = Arc::new(SysfsTemperatureSensor::from_config(&config.sensor)?);
//! let supervisor = Supervisor::new(
//!     drivers::registry(),
//!     PlatformInfo::detect()?,
//!     sensor,
//!     SupervisorOptions::from(&config),
//! );
//!
//! supervisor.start(config.fan_control).await?;
//! supervisor.set_target(0, 40).await?;
//! println!("{:?}", supervisor.status().await);
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

#[cfg(debug_assertions)]
use log::trace;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
    sync::Mutex,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, FanControlSet, RegisterWrite, WriteMode, WriteOccasion},
    drivers::{self, DriverEntry, PlatformInfo},
    ec::{BusGuard, EcChannel, EcTimings},
    error::{ControlError, Result},
    event::{Event, EventBus},
    fan_controller::{FanSpeedManager, FanStatus, TargetSpeed},
    filter::TemperatureFilter,
    sensors::TemperatureSensor,
    task_manager::TaskManager,
};

const POLL_TASK: &str = "fan-control-poll";

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorOptions {
    pub filter_window: Duration,
    /// Bus wait for poll ticks and manual requests.
    pub lock_timeout: Duration,
    /// Bus wait for initialization and shutdown writes.
    pub startup_lock_timeout: Duration,
    pub timings: EcTimings,
    /// Registered driver to use instead of the best match.
    pub driver: Option<String>,
    pub read_only: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            filter_window: Duration::from_millis(6000),
            lock_timeout: Duration::from_millis(200),
            startup_lock_timeout: Duration::from_millis(2000),
            timings: EcTimings::default(),
            driver: None,
            read_only: false,
        }
    }
}

impl From<&Config> for SupervisorOptions {
    fn from(config: &Config) -> Self {
        Self {
            filter_window: config.temperature_filter_window(),
            lock_timeout: config.lock_timeout(),
            startup_lock_timeout: config.startup_lock_timeout(),
            timings: config.ec,
            driver: config.ec_driver.clone(),
            read_only: config.read_only,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub paused: bool,
    pub driver: Option<String>,
    /// Filtered temperature of the last tick.
    pub temperature: Option<f32>,
    pub degraded_read_mode: bool,
    pub skipped_ticks: u64,
    pub fans: Vec<FanStatus>,
}

struct ControlState {
    filter: TemperatureFilter,
    managers: Vec<FanSpeedManager>,
    temperature: Option<f32>,
}

/// State shared between the supervisor, its poll task and blocking workers.
struct Shared {
    channel: Arc<dyn EcChannel>,
    driver: &'static str,
    config: FanControlSet,
    options: SupervisorOptions,
    sensor: Arc<dyn TemperatureSensor>,
    events: Option<EventBus>,
    paused: AtomicBool,
    stopped: AtomicBool,
    degraded_reported: AtomicBool,
    skipped_ticks: AtomicU64,
    control: Mutex<ControlState>,
}

struct Running {
    shared: Arc<Shared>,
    tasks: TaskManager,
}

impl Running {
    fn spawn(shared: Arc<Shared>) -> Self {
        let mut tasks = TaskManager::new();
        let poll_shared = shared.clone();
        tasks.spawn_task(POLL_TASK, move |token| poll_loop(poll_shared, token));
        Self { shared, tasks }
    }
}

pub struct Supervisor {
    registry: Vec<DriverEntry>,
    platform: PlatformInfo,
    sensor: Arc<dyn TemperatureSensor>,
    options: SupervisorOptions,
    events: Option<EventBus>,
    running: Mutex<Option<Running>>,
}

impl Supervisor {
    pub fn new(
        registry: Vec<DriverEntry>,
        platform: PlatformInfo,
        sensor: Arc<dyn TemperatureSensor>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            registry,
            platform,
            sensor,
            options,
            events: None,
            running: Mutex::new(None),
        }
    }

    /// Publishes [`Event::ProtocolDegraded`] on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Selects the EC driver, applies initialization writes and starts polling.
    pub async fn start(&self, config: FanControlSet) -> Result<()> {
        let mut running = self.running.lock().await;
        self.start_locked(&mut running, config).await
    }

    /// Stops polling, restores the EC and releases the driver.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await
    }

    /// Replaces the running configuration, rebuilding every fan manager.
    ///
    /// Shutdown writes of the old configuration and initialization writes of
    /// the new one happen under a single bus acquisition on the same channel.
    /// If the bus stays busy, the old configuration keeps running and
    /// `BusBusy` is returned.
    pub async fn reload(&self, config: FanControlSet) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return self.start_locked(&mut running, config).await;
        };
        if config.poll_interval_ms == 0 {
            *running = Some(current);
            return Err(ControlError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        let Running { shared, mut tasks } = current;
        shared.stopped.store(true, Ordering::Release);
        if let Err(e) = tasks.shutdown_all().await {
            warn!("Poll loop did not stop cleanly: {e:#}");
        }

        let timeout = self.options.startup_lock_timeout;
        let previous = shared.clone();
        let writes = config.register_writes.clone();
        let swapped = tokio::task::spawn_blocking(move || {
            let bus = BusGuard::acquire(previous.channel.clone(), timeout)?;
            if !previous.options.read_only {
                previous.restore(&*bus);
                apply_register_writes(&*bus, &writes, WriteOccasion::OnInitialization);
            }
            Some(())
        })
        .await?;

        if swapped.is_none() {
            warn!("EC bus busy for {timeout:?}, keeping the running fan configuration");
            shared.stopped.store(false, Ordering::Release);
            *running = Some(Running::spawn(shared));
            return Err(ControlError::BusBusy {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let next = self.shared_for(shared.channel.clone(), shared.driver, config);
        next.degraded_reported
            .store(shared.degraded_reported.load(Ordering::Acquire), Ordering::Release);
        *running = Some(Running::spawn(next));
        Ok(())
    }

    async fn start_locked(&self, running: &mut Option<Running>, config: FanControlSet) -> Result<()> {
        if running.is_some() {
            return Err(ControlError::AlreadyRunning);
        }
        if config.poll_interval_ms == 0 {
            return Err(ControlError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        let entry = self.select_driver()?;
        let driver = entry.name();
        let channel = entry
            .create(self.options.timings)
            .map_err(|source| ControlError::DriverInit {
                name: driver,
                source,
            })?;
        info!("Using EC driver {driver}");

        let init_channel = channel.clone();
        let writes = config.register_writes.clone();
        let timeout = self.options.startup_lock_timeout;
        let read_only = self.options.read_only;
        let initialized = tokio::task::spawn_blocking(move || {
            let bus = BusGuard::acquire(init_channel, timeout)?;
            if !read_only {
                apply_register_writes(&*bus, &writes, WriteOccasion::OnInitialization);
            }
            Some(())
        })
        .await?;

        if initialized.is_none() {
            channel.dispose();
            return Err(ControlError::BusBusy {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        *running = Some(Running::spawn(self.shared_for(channel, driver, config)));
        Ok(())
    }

    fn shared_for(
        &self,
        channel: Arc<dyn EcChannel>,
        driver: &'static str,
        config: FanControlSet,
    ) -> Arc<Shared> {
        let managers = config
            .fans
            .iter()
            .enumerate()
            .map(|(index, fan)| FanSpeedManager::new(index, fan, &config))
            .collect();
        let filter = TemperatureFilter::new(self.options.filter_window, config.poll_interval());
        info!(
            "Fan control starting: {} fans, poll every {} ms, filter over {} samples{}",
            config.fans.len(),
            config.poll_interval_ms,
            filter.capacity(),
            if self.options.read_only { ", read-only" } else { "" }
        );

        Arc::new(Shared {
            channel,
            driver,
            config,
            options: self.options.clone(),
            sensor: self.sensor.clone(),
            events: self.events.clone(),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            degraded_reported: AtomicBool::new(false),
            skipped_ticks: AtomicU64::new(0),
            control: Mutex::new(ControlState {
                filter,
                managers,
                temperature: None,
            }),
        })
    }

    async fn stop_locked(&self, running: &mut Option<Running>) -> Result<()> {
        let Running { shared, mut tasks } = running.take().ok_or(ControlError::NotRunning)?;

        shared.stopped.store(true, Ordering::Release);
        if let Err(e) = tasks.shutdown_all().await {
            warn!("Poll loop did not stop cleanly: {e:#}");
        }

        let timeout = self.options.startup_lock_timeout;
        tokio::task::spawn_blocking(move || shared.shutdown(timeout)).await?;
        info!("Fan control stopped");
        Ok(())
    }

    fn select_driver(&self) -> Result<&DriverEntry> {
        match &self.options.driver {
            Some(name) => drivers::select_named(&self.registry, &self.platform, name)
                .ok_or_else(|| ControlError::UnknownDriver { name: name.clone() }),
            None => drivers::select(&self.registry, &self.platform).ok_or_else(|| {
                ControlError::DriverUnavailable {
                    platform: self.platform.id,
                    version: self.platform.version.to_string(),
                }
            }),
        }
    }

    async fn shared(&self) -> Result<Arc<Shared>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.shared.clone())
            .ok_or(ControlError::NotRunning)
    }

    /// Skips poll ticks until [`Supervisor::resume`]. Manual requests still
    /// go through.
    pub async fn pause(&self) -> Result<()> {
        let shared = self.shared().await?;
        if !shared.paused.swap(true, Ordering::AcqRel) {
            info!("Fan control paused");
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let shared = self.shared().await?;
        if shared.paused.swap(false, Ordering::AcqRel) {
            info!("Fan control resumed");
        }
        Ok(())
    }

    /// Sets fan `fan_index` to `percent` (0-100), or back to automatic
    /// control for any larger value. Applied immediately once a temperature
    /// is known.
    pub async fn set_target(&self, fan_index: usize, percent: u8) -> Result<()> {
        let shared = self.shared().await?;
        let count = shared.config.fans.len();
        if fan_index >= count {
            return Err(ControlError::UnknownFan {
                index: fan_index,
                count,
            });
        }

        let target = TargetSpeed::from(percent);
        tokio::task::spawn_blocking(move || shared.apply_target(fan_index, target)).await?
    }

    pub async fn status(&self) -> StatusSnapshot {
        let Ok(shared) = self.shared().await else {
            return StatusSnapshot::default();
        };
        let state = shared.control.lock().await;

        StatusSnapshot {
            running: true,
            paused: shared.paused.load(Ordering::Acquire),
            driver: Some(shared.driver.to_string()),
            temperature: state.temperature,
            degraded_read_mode: shared.channel.wait_read_disabled(),
            skipped_ticks: shared.skipped_ticks.load(Ordering::Acquire),
            fans: state.managers.iter().map(FanSpeedManager::status).collect(),
        }
    }

    #[cfg(test)]
    async fn poll_once(&self) -> Result<()> {
        self.shared().await?.tick().await
    }
}

async fn poll_loop(shared: Arc<Shared>, token: CancellationToken) -> anyhow::Result<()> {
    let period = shared.config.poll_interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => shared.tick().await?,
        }
    }
    Ok(())
}

impl Shared {
    async fn tick(self: &Arc<Self>) -> Result<()> {
        if self.paused.load(Ordering::Acquire) {
            return Ok(());
        }

        let channel = self.channel.clone();
        let timeout = self.options.lock_timeout;
        let Some(bus) =
            tokio::task::spawn_blocking(move || BusGuard::acquire(channel, timeout)).await?
        else {
            let skipped = self.skipped_ticks.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("EC bus busy, tick skipped ({skipped} so far)");
            return Ok(());
        };

        let raw = match self.sensor.read_temperature().await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Failed to read temperature: {e:#}");
                return Ok(());
            }
        };

        let shared = self.clone();
        tokio::task::spawn_blocking(move || shared.apply(bus, raw)).await?;
        self.report_degraded();
        Ok(())
    }

    /// Runs on a blocking thread with the bus held.
    fn apply(&self, bus: BusGuard, raw: f32) {
        let read_only = self.options.read_only;
        let mut state = self.control.blocking_lock();
        let temperature = state.filter.filter(raw);
        state.temperature = Some(temperature);
        #[cfg(debug_assertions)]
        {
            trace!("Tick: {raw:.1}°C raw, {temperature:.1}°C filtered");
        }

        if !read_only {
            apply_register_writes(&*bus, &self.config.register_writes, WriteOccasion::OnWriteFanSpeed);
        }
        for manager in &mut state.managers {
            manager.refresh_current(&*bus);
            manager.update(temperature, &*bus, read_only);
        }
    }

    fn apply_target(&self, fan_index: usize, target: TargetSpeed) -> Result<()> {
        let bus = BusGuard::acquire(self.channel.clone(), self.options.lock_timeout).ok_or(
            ControlError::BusBusy {
                timeout_ms: self.options.lock_timeout.as_millis() as u64,
            },
        )?;
        if self.stopped.load(Ordering::Acquire) {
            return Err(ControlError::NotRunning);
        }

        let mut state = self.control.blocking_lock();
        let temperature = state.temperature;
        let count = state.managers.len();
        let manager = state
            .managers
            .get_mut(fan_index)
            .ok_or(ControlError::UnknownFan {
                index: fan_index,
                count,
            })?;

        manager.set_target(target);
        if let Some(temperature) = temperature {
            manager.update(temperature, &*bus, self.options.read_only);
        }
        Ok(())
    }

    fn report_degraded(&self) {
        if !self.channel.wait_read_disabled() || self.degraded_reported.swap(true, Ordering::AcqRel)
        {
            return;
        }
        warn!("EC driver {} switched to degraded read mode", self.driver);
        if let Some(events) = &self.events
            && let Err(e) = events.publish(Event::ProtocolDegraded {
                driver: self.driver.to_string(),
            })
        {
            debug!("No subscriber for degraded mode event: {e}");
        }
    }

    /// Runs on a blocking thread after the poll task has finished.
    fn shutdown(&self, timeout: Duration) {
        match BusGuard::acquire(self.channel.clone(), timeout) {
            Some(bus) if !self.options.read_only => self.restore(&*bus),
            Some(_) => debug!("Read-only mode, no shutdown writes"),
            None => warn!("EC bus busy for {timeout:?}, skipping shutdown writes"),
        }
        self.channel.dispose();
    }

    /// Shutdown writes, register resets and fan resets. Caller holds the bus.
    fn restore(&self, bus: &dyn EcChannel) {
        let writes = &self.config.register_writes;
        apply_register_writes(bus, writes, WriteOccasion::OnShutdown);
        for write in writes.iter().filter(|w| w.reset_required) {
            write_register(bus, write.register, write.reset_value, write.reset_mode);
        }

        let mut state = self.control.blocking_lock();
        for manager in &mut state.managers {
            manager.reset(bus);
        }
    }
}

fn apply_register_writes(channel: &dyn EcChannel, writes: &[RegisterWrite], occasion: WriteOccasion) {
    for write in writes.iter().filter(|w| w.occasion == occasion) {
        if let Some(description) = &write.description {
            debug!("{occasion:?}: {description}");
        }
        write_register(channel, write.register, write.value, write.mode);
    }
}

/// Writes `value` to `register`, combined with its current contents for
/// `And`/`Or`.
fn write_register(channel: &dyn EcChannel, register: u8, value: u8, mode: WriteMode) -> bool {
    let value = match mode {
        WriteMode::Set => value,
        WriteMode::And | WriteMode::Or => {
            let current = channel.read_byte(register);
            if !current.completed {
                warn!("Reading {register:#04x} failed, skipping {mode:?} write");
                return false;
            }
            if mode == WriteMode::And {
                current.value & value
            } else {
                current.value | value
            }
        }
    };

    let transfer = channel.write_byte(register, value);
    if !transfer.completed {
        warn!(
            "Writing {value:#04x} to {register:#04x} failed after {} attempts",
            transfer.attempts
        );
    }
    transfer.completed
}

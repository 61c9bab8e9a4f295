//! Per-fan speed management.
//!
//! A [`FanSpeedManager`] owns one fan's runtime state and turns a filtered
//! temperature into a raw register value: threshold bands with hysteresis in
//! automatic mode, a fixed percentage in manual mode, and a forced value while
//! the temperature is critical.

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{FanConfig, FanControlSet},
    ec::{EcChannel, Transfer},
    fan_curve::ThresholdTable,
};

/// Requested percentage that switches a fan back to automatic control.
pub const AUTO_TARGET: u8 = 101;

/// What the user asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetSpeed {
    #[default]
    Auto,
    Manual(u8),
}

impl From<u8> for TargetSpeed {
    /// 0-100 is a manual percentage; anything above is automatic.
    fn from(percent: u8) -> Self {
        if percent > 100 {
            Self::Auto
        } else {
            Self::Manual(percent)
        }
    }
}

impl TargetSpeed {
    /// Percentage as reported in status, [`AUTO_TARGET`] for automatic.
    pub fn percent(self) -> u8 {
        match self {
            Self::Auto => AUTO_TARGET,
            Self::Manual(percent) => percent,
        }
    }
}

/// What the fan is actually doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Auto,
    Manual(u8),
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanRuntimeState {
    pub current_band_index: Option<usize>,
    pub last_written_raw_value: Option<u16>,
    pub target: TargetSpeed,
    pub critical_mode_active: bool,
    pub current_raw_value: Option<u16>,
    pub last_percent: Option<u8>,
}

/// Point-in-time view of one fan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanStatus {
    pub index: usize,
    pub name: Option<String>,
    pub auto_enabled: bool,
    pub critical_mode_active: bool,
    pub current_raw_value: Option<u16>,
    pub current_percent: Option<u8>,
    pub target_percent: u8,
    pub last_written_raw_value: Option<u16>,
    pub band_count: usize,
}

#[derive(Debug, Clone)]
pub struct FanSpeedManager {
    index: usize,
    fan: FanConfig,
    table: ThresholdTable,
    critical_temperature: f32,
    critical_exit_temperature: f32,
    use_word_registers: bool,
    state: FanRuntimeState,
}

impl FanSpeedManager {
    pub fn new(index: usize, fan: &FanConfig, set: &FanControlSet) -> Self {
        Self {
            index,
            fan: fan.clone(),
            table: ThresholdTable::or_default(&fan.thresholds, set.critical_temperature),
            critical_temperature: set.critical_temperature,
            critical_exit_temperature: set.critical_temperature
                - set.critical_temperature_offset.max(0.0),
            use_word_registers: set.use_word_registers,
            state: FanRuntimeState::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> &FanRuntimeState {
        &self.state
    }

    pub fn table(&self) -> &ThresholdTable {
        &self.table
    }

    pub fn mode(&self) -> FanMode {
        match self.state.target {
            _ if self.state.critical_mode_active => FanMode::Critical,
            TargetSpeed::Auto => FanMode::Auto,
            TargetSpeed::Manual(percent) => FanMode::Manual(percent),
        }
    }

    pub fn set_target(&mut self, target: TargetSpeed) {
        if target == self.state.target {
            return;
        }
        if target == TargetSpeed::Auto {
            self.state.current_band_index = None;
        }
        info!("Fan {}: target {:?} -> {target:?}", self.label(), self.state.target);
        self.state.target = target;
    }

    /// Raw value the fan should be at for filtered temperature `temperature`.
    pub fn resolve(&mut self, temperature: f32) -> u16 {
        self.track_critical(temperature);

        if self.state.critical_mode_active {
            return if self.fan.reset_required {
                self.fan.reset_value
            } else {
                self.fan.max_speed_value
            };
        }

        let percent = match self.state.target {
            TargetSpeed::Manual(percent) => percent,
            TargetSpeed::Auto => {
                let band = self.table.select(self.state.current_band_index, temperature);
                self.state.current_band_index = Some(band);
                self.table.band(band).fan_speed_percent
            }
        };
        self.state.last_percent = Some(percent);
        self.percent_to_raw(percent)
    }

    fn track_critical(&mut self, temperature: f32) {
        let active = self.state.critical_mode_active;
        if !active && temperature >= self.critical_temperature {
            warn!(
                "Fan {}: {temperature:.1}°C reached critical {:.1}°C, forcing full speed",
                self.label(),
                self.critical_temperature
            );
            self.state.critical_mode_active = true;
        } else if active && temperature < self.critical_exit_temperature {
            info!("Fan {}: left critical mode at {temperature:.1}°C", self.label());
            self.state.critical_mode_active = false;
        }
    }

    /// Resolves and writes the fan's value unless it is unchanged.
    ///
    /// Returns the transfer when a write was issued.
    pub fn update(
        &mut self,
        temperature: f32,
        channel: &dyn EcChannel,
        read_only: bool,
    ) -> Option<Transfer<()>> {
        let raw = self.resolve(temperature);
        if read_only || self.state.last_written_raw_value == Some(raw) {
            return None;
        }

        let transfer = self.write_raw(channel, raw);
        self.state.last_written_raw_value = Some(raw);
        if transfer.completed {
            debug!("Fan {}: wrote {raw} at {temperature:.1}°C", self.label());
        } else {
            warn!(
                "Fan {}: writing {raw} to {:#04x} failed after {} attempts",
                self.label(),
                self.fan.write_register,
                transfer.attempts
            );
        }
        Some(transfer)
    }

    /// Reads the fan's current register value.
    pub fn refresh_current(&mut self, channel: &dyn EcChannel) -> Option<u16> {
        let register = self.fan.read_register;
        let (value, completed) = if self.use_word_registers {
            let t = channel.read_word(register);
            (t.value, t.completed)
        } else {
            let t = channel.read_byte(register);
            (u16::from(t.value), t.completed)
        };

        if completed {
            self.state.current_raw_value = Some(value);
        } else {
            debug!("Fan {}: reading {register:#04x} failed", self.label());
        }
        self.state.current_raw_value
    }

    /// Hands the fan back to the firmware if it needs it.
    pub fn reset(&mut self, channel: &dyn EcChannel) -> Option<Transfer<()>> {
        if !self.fan.reset_required {
            return None;
        }
        let transfer = self.write_raw(channel, self.fan.reset_value);
        self.state.last_written_raw_value = Some(self.fan.reset_value);
        if !transfer.completed {
            warn!("Fan {}: reset write failed", self.label());
        }
        Some(transfer)
    }

    fn write_raw(&self, channel: &dyn EcChannel, raw: u16) -> Transfer<()> {
        let register = self.fan.write_register;
        if self.use_word_registers {
            channel.write_word(register, raw)
        } else {
            let value = u8::try_from(raw).unwrap_or_else(|_| {
                warn!("Fan {}: {raw} does not fit a byte register, writing 255", self.label());
                u8::MAX
            });
            channel.write_byte(register, value)
        }
    }

    /// Exact write override if configured, else linear interpolation
    /// between the write min and max values.
    pub fn percent_to_raw(&self, percent: u8) -> u16 {
        let percent = percent.min(100);
        if let Some(o) = self
            .fan
            .percent_overrides
            .iter()
            .find(|o| o.percent == percent && o.target.applies_to_write())
        {
            return o.value;
        }
        interpolate(self.fan.min_speed_value, self.fan.max_speed_value, percent)
    }

    /// Inverse of [`FanSpeedManager::percent_to_raw`] for read values.
    pub fn raw_to_percent(&self, raw: u16) -> u8 {
        if let Some(o) = self
            .fan
            .percent_overrides
            .iter()
            .find(|o| o.value == raw && o.target.applies_to_read())
        {
            return o.percent;
        }

        let (min, max) = if self.fan.independent_read_min_max {
            (self.fan.min_speed_value_read, self.fan.max_speed_value_read)
        } else {
            (self.fan.min_speed_value, self.fan.max_speed_value)
        };
        if min == max {
            return 0;
        }

        let ratio = (f64::from(raw) - f64::from(min)) / (f64::from(max) - f64::from(min));
        (ratio * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn status(&self) -> FanStatus {
        FanStatus {
            index: self.index,
            name: self.fan.name.clone(),
            auto_enabled: self.state.target == TargetSpeed::Auto,
            critical_mode_active: self.state.critical_mode_active,
            current_raw_value: self.state.current_raw_value,
            current_percent: self.state.current_raw_value.map(|raw| self.raw_to_percent(raw)),
            target_percent: self.state.target.percent(),
            last_written_raw_value: self.state.last_written_raw_value,
            band_count: self.table.len(),
        }
    }

    fn label(&self) -> String {
        self.fan
            .name
            .clone()
            .unwrap_or_else(|| format!("#{}", self.index))
    }
}

/// `round(min + (max - min) * percent / 100)`, in either numeric direction.
fn interpolate(min: u16, max: u16, percent: u8) -> u16 {
    let (min, max) = (f64::from(min), f64::from(max));
    (min + (max - min) * f64::from(percent) / 100.0).round() as u16
}

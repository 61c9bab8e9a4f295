//! Threshold tables with hysteresis for temperature-based speed control.
//!
//! A fan steps up into a band once the temperature reaches the band's
//! `up_threshold` and only steps back down once it falls below the band's
//! `down_threshold`, which keeps the fan from oscillating around a boundary.

use serde::{Deserialize, Serialize};

/// One step of a fan's threshold table.
///
/// # Example
///
/// ```
/// use ecfand::fan_curve::ThresholdBand;
///
/// // At 60°C go to 50%, stay there until the temperature drops below 52°C.
/// let band = ThresholdBand::new(60, 52, 50);
/// assert_eq!(band.fan_speed_percent, 50);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub up_threshold: i32,
    pub down_threshold: i32,
    pub fan_speed_percent: u8,
}

impl ThresholdBand {
    pub const fn new(up_threshold: i32, down_threshold: i32, fan_speed_percent: u8) -> Self {
        Self {
            up_threshold,
            down_threshold,
            fan_speed_percent,
        }
    }
}

/// Bands ordered ascending by `up_threshold`.
///
/// # Example
///
/// ```
/// use ecfand::fan_curve::{ThresholdBand, ThresholdTable};
///
/// let table = ThresholdTable::new(vec![
///     ThresholdBand::new(0, 0, 0),
///     ThresholdBand::new(10, 8, 50),
/// ]);
///
/// let band = table.select(None, 12.0);
/// assert_eq!(table.band(band).fan_speed_percent, 50);
///
/// // Still above the down threshold, so the fan stays at 50%.
/// assert_eq!(table.select(Some(band), 9.0), band);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdTable {
    bands: Vec<ThresholdBand>,
}

impl ThresholdTable {
    /// Builds a table from `bands`, sorting them by `up_threshold`.
    ///
    /// An empty input yields the default table for a critical temperature
    /// of 76°C; use [`ThresholdTable::or_default`] to pick the real one.
    pub fn new(mut bands: Vec<ThresholdBand>) -> Self {
        if bands.is_empty() {
            return Self::default_for(76.0);
        }
        bands.sort_by_key(|b| b.up_threshold);
        Self { bands }
    }

    /// `bands`, or the default table when none are configured.
    pub fn or_default(bands: &[ThresholdBand], critical_temperature: f32) -> Self {
        if bands.is_empty() {
            Self::default_for(critical_temperature)
        } else {
            Self::new(bands.to_vec())
        }
    }

    /// Off at idle, full speed from 75°C (or just below critical).
    pub fn default_for(critical_temperature: f32) -> Self {
        let up = (critical_temperature.floor() as i32 - 1).clamp(1, 75);
        Self {
            bands: vec![
                ThresholdBand::new(0, 0, 0),
                ThresholdBand::new(up, up.min(67), 100),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn bands(&self) -> &[ThresholdBand] {
        &self.bands
    }

    /// Band at `index`, clamped to the last band.
    pub fn band(&self, index: usize) -> ThresholdBand {
        self.bands[index.min(self.bands.len() - 1)]
    }

    /// Index of the band to apply at `temperature`, given the band in effect.
    ///
    /// The candidate is the highest band whose `up_threshold` is reached. If
    /// the fan currently sits above that, it stays in the highest band at or
    /// below its current one whose `down_threshold` is still reached.
    pub fn select(&self, current: Option<usize>, temperature: f32) -> usize {
        let by_up = self
            .bands
            .iter()
            .rposition(|b| b.up_threshold as f32 <= temperature)
            .unwrap_or(0);

        let Some(current) = current.filter(|c| *c > by_up && *c < self.bands.len()) else {
            return by_up;
        };

        (by_up + 1..=current)
            .rev()
            .find(|j| self.bands[*j].down_threshold as f32 <= temperature)
            .unwrap_or(by_up)
    }
}

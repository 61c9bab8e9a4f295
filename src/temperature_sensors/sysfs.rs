use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
#[cfg(debug_assertions)]
use log::debug;
use log::info;

use crate::{config::SensorCfg, sensors::TemperatureSensor};

pub const THERMAL_ROOT: &str = "/sys/class/thermal";
pub const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Thermal zone types that track the CPU package, best first.
const PREFERRED_ZONES: &[&str] = &["x86_pkg_temp", "acpitz"];

/// hwmon drivers that report the CPU package on `temp1_input`.
const CPU_HWMON: &[&str] = &["coretemp", "k10temp", "zenpower"];

/// Reads a kernel temperature file holding millidegrees Celsius.
#[derive(Debug, Clone)]
pub struct SysfsTemperatureSensor {
    name: String,
    path: PathBuf,
}

impl SysfsTemperatureSensor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn from_config(cfg: &SensorCfg) -> Result<Self> {
        match cfg {
            SensorCfg::Sysfs { path: Some(path) } => {
                let name = path.display().to_string();
                Ok(Self::new(name, path))
            }
            SensorCfg::Sysfs { path: None } => {
                Self::discover(Path::new(THERMAL_ROOT), Path::new(HWMON_ROOT))
            }
        }
    }

    /// Picks the CPU package thermal zone, then any thermal zone, then a
    /// CPU hwmon input.
    pub fn discover(thermal_root: &Path, hwmon_root: &Path) -> Result<Self> {
        let zones = sorted_entries(thermal_root, "thermal_zone");
        let typed: Vec<(String, PathBuf)> = zones
            .iter()
            .filter_map(|zone| {
                let kind = fs::read_to_string(zone.join("type")).ok()?;
                Some((kind.trim().to_string(), zone.join("temp")))
            })
            .filter(|(_, temp)| temp.exists())
            .collect();

        let preferred = PREFERRED_ZONES
            .iter()
            .find_map(|want| typed.iter().find(|(kind, _)| kind == want));
        if let Some((kind, path)) = preferred.or(typed.first()) {
            info!("Using thermal zone {kind} at {}", path.display());
            return Ok(Self::new(kind.clone(), path.clone()));
        }

        for hwmon in sorted_entries(hwmon_root, "hwmon") {
            let Ok(name) = fs::read_to_string(hwmon.join("name")) else {
                continue;
            };
            let name = name.trim();
            let input = hwmon.join("temp1_input");
            if CPU_HWMON.contains(&name) && input.exists() {
                info!("Using hwmon {name} at {}", input.display());
                return Ok(Self::new(name, input));
            }
        }

        Err(anyhow!(
            "no temperature source found under {} or {}",
            thermal_root.display(),
            hwmon_root.display()
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sorted_entries(root: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut paths: Vec<(u32, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let index = file_name.to_str()?.strip_prefix(prefix)?.parse().ok()?;
            Some((index, entry.path()))
        })
        .collect();
    paths.sort_by_key(|(index, _)| *index);
    paths.into_iter().map(|(_, path)| path).collect()
}

#[async_trait]
impl TemperatureSensor for SysfsTemperatureSensor {
    async fn sensor_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    async fn read_temperature(&self) -> Result<f32> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let millidegrees: i64 = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid temperature {:?} in {}", raw.trim(), self.path.display()))?;

        let celsius = millidegrees as f32 / 1000.0;
        #[cfg(debug_assertions)]
        {
            debug!("{}: {celsius:.1}°C", self.name);
        }
        Ok(celsius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn zone(root: &Path, index: u32, kind: &str, millidegrees: &str) {
        let dir = root.join(format!("thermal_zone{index}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("type"), format!("{kind}\n")).unwrap();
        fs::write(dir.join("temp"), millidegrees).unwrap();
    }

    #[tokio::test]
    async fn reads_millidegrees() {
        let root = TempDir::new().unwrap();
        zone(root.path(), 0, "acpitz", "47500\n");

        let sensor = SysfsTemperatureSensor::new(
            "zone0",
            root.path().join("thermal_zone0/temp"),
        );
        assert_eq!(sensor.read_temperature().await.unwrap(), 47.5);
        assert_eq!(sensor.sensor_name().await.as_deref(), Some("zone0"));
    }

    #[tokio::test]
    async fn garbage_is_an_error() {
        let root = TempDir::new().unwrap();
        zone(root.path(), 0, "acpitz", "n/a");

        let sensor = SysfsTemperatureSensor::new("zone0", root.path().join("thermal_zone0/temp"));
        assert!(sensor.read_temperature().await.is_err());
    }

    #[test]
    fn discovery_prefers_package_zone() {
        let thermal = TempDir::new().unwrap();
        let hwmon = TempDir::new().unwrap();
        zone(thermal.path(), 0, "acpitz", "40000");
        zone(thermal.path(), 2, "INT3400 Thermal", "20000");
        zone(thermal.path(), 10, "x86_pkg_temp", "55000");

        let sensor = SysfsTemperatureSensor::discover(thermal.path(), hwmon.path()).unwrap();
        assert_eq!(sensor.path(), thermal.path().join("thermal_zone10/temp"));
    }

    #[test]
    fn discovery_falls_back_to_first_zone_then_hwmon() {
        let thermal = TempDir::new().unwrap();
        let hwmon = TempDir::new().unwrap();
        zone(thermal.path(), 3, "pch_skylake", "41000");
        zone(thermal.path(), 1, "iwlwifi_1", "39000");

        let sensor = SysfsTemperatureSensor::discover(thermal.path(), hwmon.path()).unwrap();
        assert_eq!(sensor.path(), thermal.path().join("thermal_zone1/temp"));

        let empty = TempDir::new().unwrap();
        let chip = hwmon.path().join("hwmon4");
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("name"), "k10temp\n").unwrap();
        fs::write(chip.join("temp1_input"), "61000").unwrap();

        let sensor = SysfsTemperatureSensor::discover(empty.path(), hwmon.path()).unwrap();
        assert_eq!(sensor.path(), chip.join("temp1_input"));
    }

    #[test]
    fn discovery_without_sources_fails() {
        let empty = TempDir::new().unwrap();
        assert!(SysfsTemperatureSensor::discover(empty.path(), empty.path()).is_err());
    }

    #[test]
    fn configured_path_is_used_verbatim() {
        let cfg = SensorCfg::Sysfs {
            path: Some(PathBuf::from("/sys/class/hwmon/hwmon2/temp1_input")),
        };
        let sensor = SysfsTemperatureSensor::from_config(&cfg).unwrap();
        assert_eq!(sensor.path(), Path::new("/sys/class/hwmon/hwmon2/temp1_input"));
    }
}

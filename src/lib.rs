//! # ecfand
//!
//! A Linux daemon that controls notebook fans by writing the embedded
//! controller (EC) registers directly.
//!
//! ## Features
//!
//! - **EC access**: ACPI EC handshake over `/dev/port`, or register files
//!   exposed by the `ec_sys` and `acpi_ec` kernel modules
//! - **Driver selection**: best registered driver for the running kernel
//! - **Threshold bands**: per-fan speed tables with hysteresis
//! - **Critical mode**: every fan at full speed above a temperature limit
//! - **Temperature filtering**: moving average over a configurable window
//! - **Hot Reload**: configuration changes without restart
//!
//! ## Architecture
//!
//! - [`Supervisor`](supervisor::Supervisor) - fan control lifecycle and poll loop
//! - [`EcChannel`](ec::EcChannel) - byte and word access to EC registers
//! - [`FanSpeedManager`](fan_controller::FanSpeedManager) - per-fan speed decisions
//! - [`EventBus`](event::EventBus) - inter-service communication
//!
//! ## Example
//!
//! ```no_run
//! use ecfand::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod application;
pub mod cli;
pub mod config;
pub mod config_watcher;
pub mod drivers;
pub mod ec;
pub mod error;
pub mod event;
pub mod fan_controller;
pub mod fan_curve;
pub mod filter;
pub mod sensors;
pub mod supervisor;
pub mod task_manager;
pub mod temperature_sensors;

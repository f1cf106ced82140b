//! # mbpfand
//!
//! A Linux daemon that drives Apple SMC fans from CPU temperature, through
//! the sysfs files exposed by the `applesmc` driver.
//!
//! ## Features
//!
//! - **Hysteresis Control**: Fans hold speed inside the comfort band and
//!   ramp along a triangular curve outside it
//! - **Hot Reload**: SIGHUP re-reads the YAML configuration without
//!   touching discovered devices
//! - **Clean Exit**: SIGTERM, SIGINT and SIGQUIT hand the fans back to
//!   automatic control and remove the lock record
//! - **Single Instance**: A PID lock record refuses a second live daemon
//!
//! ## Architecture
//!
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - Lifecycle manager
//! - [`EventBus`](event::EventBus) - Signal listener to coordinator channel
//! - [`AppState`](app_context::AppState) - Shared settings and devices
//! - [`run_fan_control_service`](fan_control::run_fan_control_service) - The
//!   polling loop
//!
//! ## Example
//!
//! ```no_run
//! use mbpfand::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod cli;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod devices;
pub mod event;
pub mod fan_control;
pub mod logging;
pub mod pid_file;
pub mod signals;
pub mod task_manager;

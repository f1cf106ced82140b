//! Application entry point and builder pattern implementation.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use log::error;

use crate::{
    config::ConfigManager,
    coordinator::SystemCoordinator,
    devices::DevicePaths,
    event::EventBus,
    pid_file::DEFAULT_PID_FILE,
    signals::SignalListener,
};

/// Main application structure that orchestrates all daemon components.
///
/// Owns the coordinator and the sending half of its event bus. The signal
/// listener is attached when [`run`](Self::run) starts and detached when it
/// returns.
///
/// # Example
///
/// ```no_run
/// use mbpfand::{application::Application, config::ConfigManager};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    pub coordinator: SystemCoordinator,
    event_bus: EventBus,
}

impl Application {
    /// Creates a new ApplicationBuilder for constructing Application instances.
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Sender for injecting events without going through OS signals.
    pub fn event_bus(&self) -> EventBus {
        self.event_bus.clone()
    }

    /// Runs the complete daemon lifecycle: initialize, start services, and
    /// handle events until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let listener = SignalListener::spawn(self.event_bus.clone())?;

        let result = self.start_and_serve().await;
        if result.is_err() {
            if let Err(e) = self.coordinator.shutdown().await {
                error!("Cleanup after failure did not complete: {e:#}");
            }
        }

        listener.close();
        result
    }

    async fn start_and_serve(&mut self) -> Result<()> {
        self.coordinator.initialize().await?;
        self.coordinator.start_all_services()?;
        self.coordinator.run_main_loop().await
    }
}

/// Builder pattern for creating Application instances.
pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    device_paths: DevicePaths,
    pid_file: PathBuf,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
            device_paths: DevicePaths::default(),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
        }
    }

    /// Sets the configuration manager for the application.
    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Overrides where sensors and fans are discovered.
    pub fn with_device_paths(mut self, device_paths: DevicePaths) -> Self {
        self.device_paths = device_paths;
        self
    }

    /// Overrides the lock record location.
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = path.into();
        self
    }

    /// Builds the Application instance with the provided configuration.
    pub fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;

        let (event_bus, events) = EventBus::channel();
        let coordinator =
            SystemCoordinator::new(config_manager, self.device_paths, self.pid_file, events);

        Ok(Application {
            coordinator,
            event_bus,
        })
    }
}

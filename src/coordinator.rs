//! Lifecycle management: single-instance lock, service startup, reload and
//! graceful shutdown.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};

use crate::{
    app_context::AppState,
    config::ConfigManager,
    devices::DevicePaths,
    event::{Event, EventReceiver},
    fan_control::{self, run_fan_control_service},
    pid_file::PidFile,
    signals::describe,
    task_manager::TaskManager,
};

/// Drives the daemon from startup to exit.
///
/// Startup takes the lock record, discovers devices and spawns the control
/// loop. From then on the coordinator waits for events: a reload re-reads
/// the configuration into the live parameters, a shutdown request stops the
/// loop, hands the fans back to automatic control, releases every device
/// and removes the lock record.
///
/// [`shutdown`](Self::shutdown) is safe from any state and runs its cleanup
/// at most once.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    events: EventReceiver,
    config_manager: ConfigManager,
    device_paths: DevicePaths,
    pid_path: PathBuf,
    pid_file: Option<PidFile>,
    shared_state: Option<Arc<AppState>>,
    shut_down: bool,
}

impl SystemCoordinator {
    /// Creates a coordinator that has not touched the system yet.
    pub fn new(
        config_manager: ConfigManager,
        device_paths: DevicePaths,
        pid_path: impl Into<PathBuf>,
        events: EventReceiver,
    ) -> Self {
        Self {
            task_manager: TaskManager::new(),
            events,
            config_manager,
            device_paths,
            pid_path: pid_path.into(),
            pid_file: None,
            shared_state: None,
            shut_down: false,
        }
    }

    /// Takes the lock record and discovers devices.
    ///
    /// Fails if another live instance holds the lock, or if no sensor or no
    /// fan is found.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        self.pid_file = Some(
            PidFile::acquire(&self.pid_path).context("Failed to take the single-instance lock")?,
        );

        let state = AppState::new(self.config_manager.clone(), &self.device_paths)
            .context("Failed to initialize application state")?;
        self.shared_state = Some(Arc::new(state));

        info!("SystemCoordinator initialization completed");
        Ok(())
    }

    /// Spawns the fan control loop.
    pub fn start_all_services(&mut self) -> Result<()> {
        let state = self
            .shared_state
            .clone()
            .ok_or_else(|| anyhow!("System not properly initialized"))?;

        self.task_manager
            .spawn_task(fan_control::SERVICE_NAME, move |cancel_token| {
                run_fan_control_service(state, cancel_token)
            });
        Ok(())
    }

    /// Handles events until a shutdown is requested, then shuts down.
    ///
    /// A service exiting on its own is treated as fatal: the coordinator
    /// still shuts down cleanly, then returns the error.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        info!("Starting main event loop");

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Event::Reload) => self.handle_reload().await,
                    Some(Event::Shutdown { signal }) => {
                        info!("Received {signal}, initiating graceful shutdown...");
                        break;
                    }
                    Some(Event::Unhandled(signal)) => {
                        warn!("Unhandled signal ({signal}) {}, ignoring", describe(signal));
                    }
                    None => {
                        warn!("Event source closed, initiating graceful shutdown...");
                        break;
                    }
                },

                Some((name, result)) = self.task_manager.next_exit() => {
                    self.shutdown().await?;
                    return Err(match result {
                        Ok(()) => anyhow!("Service '{name}' exited unexpectedly"),
                        Err(e) => e.context(format!("Service '{name}' failed")),
                    });
                }
            }
        }

        info!("Main event loop terminated");
        self.shutdown().await
    }

    /// Re-reads the configuration into the live parameters.
    ///
    /// Discovery, fan speed and ramp coefficients are left alone.
    async fn handle_reload(&self) {
        info!("Reloading configuration...");
        match self.config_manager.reload().await {
            Ok(settings) => info!("Configuration reloaded: {settings:?}"),
            Err(e) => warn!("Reload failed, keeping current parameters: {e:#}"),
        }
    }

    /// Stops the control loop, restores automatic fan control, releases
    /// every device and removes the lock record.
    ///
    /// Every step is best-effort. Calling it again is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            info!("Shutdown already completed");
            return Ok(());
        }
        self.shut_down = true;
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.task_manager.shutdown_all().await {
            error!("Error during task shutdown: {e:#}");
        }

        if let Some(state) = &self.shared_state {
            if let Some(devices) = state.take_devices().await {
                devices.set_mode(false);
                devices.close_all();
            }
        }

        if let Some(pid_file) = self.pid_file.take() {
            if let Err(e) = pid_file.release() {
                warn!("{e:#}");
            }
        }

        info!("Shutdown complete");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        devices::tests::fake_applesmc,
        event::EventBus,
    };
    use pretty_assertions::assert_eq;
    use std::{fs, path::Path, time::Duration};
    use tempfile::TempDir;
    use tokio::time::sleep;

    struct Fixture {
        sysfs: TempDir,
        run_dir: TempDir,
        bus: EventBus,
        coordinator: SystemCoordinator,
    }

    fn fixture(reading: Option<&str>, fans: &[u32]) -> Fixture {
        let sysfs = fake_applesmc(reading, fans);
        let run_dir = tempfile::tempdir().unwrap();
        let config_path = run_dir.path().join("config.yml");
        fs::write(&config_path, "general:\n  polling_interval: 1\n").unwrap();

        let (bus, events) = EventBus::channel();
        let coordinator = SystemCoordinator::new(
            ConfigManager::new(Settings::default(), Some(config_path)),
            DevicePaths::single(sysfs.path()),
            run_dir.path().join("mbpfan.pid"),
            events,
        );

        Fixture {
            sysfs,
            run_dir,
            bus,
            coordinator,
        }
    }

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_restores_hardware_and_lock() {
        let mut f = fixture(Some("40000"), &[1, 2]);
        let pid_path = f.run_dir.path().join("mbpfan.pid");

        f.coordinator.initialize().await.unwrap();
        assert_eq!(read(f.run_dir.path(), "mbpfan.pid"), std::process::id().to_string());
        f.coordinator.start_all_services().unwrap();

        let (bus, sysfs, run_dir) = (&f.bus, f.sysfs.path(), f.run_dir.path());
        let driver = async move {
            sleep(Duration::from_millis(500)).await;
            assert_eq!(read(sysfs, "fan1_manual"), "1");
            assert_eq!(read(sysfs, "fan2_manual"), "1");

            fs::write(run_dir.join("config.yml"), "general:\n  high_temp: 50\n").unwrap();
            bus.publish(Event::Reload).unwrap();
            sleep(Duration::from_secs(3)).await;

            bus
                .publish(Event::Shutdown {
                    signal: "SIGTERM".into(),
                })
                .unwrap();
        };

        let (result, ()) = tokio::join!(f.coordinator.run_main_loop(), driver);
        result.unwrap();

        assert_eq!(f.coordinator.config_manager.snapshot().await.high_temp, 50);
        assert_eq!(read(f.sysfs.path(), "fan1_manual"), "0");
        assert_eq!(read(f.sysfs.path(), "fan2_manual"), "0");
        assert!(!pid_path.exists());
        assert!(f.coordinator.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_shutdown_is_harmless() {
        let mut f = fixture(Some("40000"), &[1]);

        f.coordinator.initialize().await.unwrap();
        f.coordinator.start_all_services().unwrap();
        sleep(Duration::from_millis(100)).await;

        f.coordinator.shutdown().await.unwrap();
        f.coordinator.shutdown().await.unwrap();

        assert_eq!(read(f.sysfs.path(), "fan1_manual"), "0");
        assert!(!f.run_dir.path().join("mbpfan.pid").exists());
    }

    #[tokio::test]
    async fn shutdown_before_initialization_is_a_no_op() {
        let mut f = fixture(Some("40000"), &[1]);

        f.coordinator.shutdown().await.unwrap();
        f.coordinator.shutdown().await.unwrap();

        assert!(!f.run_dir.path().join("mbpfan.pid").exists());
        assert_eq!(read(f.sysfs.path(), "fan1_manual"), "0");
    }

    #[tokio::test]
    async fn live_lock_aborts_startup_untouched() {
        let mut f = fixture(Some("40000"), &[1]);
        let owner = std::process::id().to_string();
        fs::write(f.run_dir.path().join("mbpfan.pid"), &owner).unwrap();

        assert!(f.coordinator.initialize().await.is_err());

        assert_eq!(read(f.run_dir.path(), "mbpfan.pid"), owner);
        assert_eq!(read(f.sysfs.path(), "fan1_manual"), "0");
        assert!(f.coordinator.start_all_services().is_err());
    }

    #[tokio::test]
    async fn failed_discovery_releases_the_lock() {
        let Fixture {
            sysfs: _sysfs,
            run_dir,
            mut coordinator,
            ..
        } = fixture(Some("40000"), &[]);

        let err = coordinator.initialize().await.unwrap_err();
        assert!(format!("{err:#}").contains("No fans found"));

        drop(coordinator);
        assert!(!run_dir.path().join("mbpfan.pid").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_events_are_ignored() {
        let mut f = fixture(Some("40000"), &[1]);

        f.coordinator.initialize().await.unwrap();
        f.coordinator.start_all_services().unwrap();

        f.bus.publish(Event::Unhandled(10)).unwrap();
        f.bus.publish(Event::Reload).unwrap();
        f.bus
            .publish(Event::Shutdown {
                signal: "SIGQUIT".into(),
            })
            .unwrap();

        f.coordinator.run_main_loop().await.unwrap();
        assert_eq!(f.coordinator.config_manager.snapshot().await.polling_interval, 1);
        assert_eq!(read(f.sysfs.path(), "fan1_manual"), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_event_source_shuts_down() {
        let Fixture {
            sysfs: _sysfs,
            run_dir,
            bus,
            mut coordinator,
        } = fixture(Some("40000"), &[1]);

        coordinator.initialize().await.unwrap();
        coordinator.start_all_services().unwrap();
        drop(bus);

        coordinator.run_main_loop().await.unwrap();
        assert!(!run_dir.path().join("mbpfan.pid").exists());
    }
}

//! Shared state handed to the control loop and the lifecycle handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::{
    config::{ConfigManager, Settings},
    devices::{DevicePaths, DeviceRegistry},
};

/// Everything the control loop and the coordinator share.
///
/// The device registry sits behind a mutex held for one whole control tick,
/// so shutdown can never release handles while a tick is using them. It is
/// wrapped in an `Option` so release happens exactly once: whoever takes it
/// out owns the cleanup.
pub struct AppState {
    /// Live tunable parameters
    pub config_manager: ConfigManager,
    /// Discovered sensors and fans, `None` once released
    pub devices: Arc<Mutex<Option<DeviceRegistry>>>,
}

impl AppState {
    /// Discovers devices under `paths`.
    ///
    /// Fails when no sensor or no fan is found.
    pub fn new(config_manager: ConfigManager, paths: &DevicePaths) -> Result<Self> {
        let registry = DeviceRegistry::discover(paths).context("Device discovery failed")?;
        Ok(Self::with_devices(config_manager, registry))
    }

    /// Wraps an already discovered registry.
    pub fn with_devices(config_manager: ConfigManager, registry: DeviceRegistry) -> Self {
        Self {
            config_manager,
            devices: Arc::new(Mutex::new(Some(registry))),
        }
    }

    /// Copies the current parameters.
    pub async fn settings(&self) -> Settings {
        self.config_manager.snapshot().await
    }

    /// Takes ownership of the registry, leaving `None` behind.
    pub async fn take_devices(&self) -> Option<DeviceRegistry> {
        self.devices.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::tests::fake_applesmc;

    #[tokio::test]
    async fn devices_can_be_taken_only_once() {
        let dir = fake_applesmc(Some("40000"), &[1]);
        let state = AppState::new(
            ConfigManager::new(Settings::default(), None),
            &DevicePaths::single(dir.path()),
        )
        .unwrap();

        assert!(state.take_devices().await.is_some());
        assert!(state.take_devices().await.is_none());
    }

    #[test]
    fn discovery_failure_is_reported() {
        let dir = fake_applesmc(None, &[]);
        let result = AppState::new(
            ConfigManager::new(Settings::default(), None),
            &DevicePaths::single(dir.path()),
        );

        assert!(format!("{:#}", result.err().unwrap()).contains("No temperature sensors"));
    }
}

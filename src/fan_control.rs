//! The fan control loop.
//!
//! Each tick reads every sensor, runs the control algorithm and writes the
//! result to every fan while holding the device lock, so a tick is never
//! interleaved with a shutdown. The only await points are the sleeps between
//! ticks, and those end early when the loop is cancelled.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    control::{ControlState, RampCoefficients},
};

/// Task name the loop is registered under.
pub const SERVICE_NAME: &str = "FanControlService";

/// Runs the control loop until `cancel_token` is cancelled or the devices
/// are released.
///
/// Ramp coefficients are derived once, after the first sleep, from the
/// parameters in effect at that moment. Later reloads change thresholds and
/// bounds but not the coefficients.
pub async fn run_fan_control_service(
    state: Arc<AppState>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let settings = state.settings().await;

    let mut control = {
        let mut devices = state.devices.lock().await;
        let Some(devices) = devices.as_mut() else {
            bail!("devices released before the control loop started");
        };

        devices.set_mode(true);
        let temp = devices.aggregate_temperature();
        let control = ControlState::new(temp, &settings);
        devices.write_speed(control.fan_speed);
        info!(
            "Initial temperature {temp}°C, fan speed {}",
            control.fan_speed
        );
        control
    };

    info!(
        "Polling interval set to {} seconds, sleeping once to get a first temperature delta",
        settings.polling_interval
    );
    if !pause(settings.polling_interval(), &cancel_token).await {
        info!("Fan control cancelled before the first tick");
        return Ok(());
    }

    let ramp = RampCoefficients::from_settings(&state.settings().await);
    info!(
        "Ramp coefficients: step up {}, step down {}",
        ramp.step_up, ramp.step_down
    );

    loop {
        let settings = state.settings().await;

        {
            let mut devices = state.devices.lock().await;
            let Some(devices) = devices.as_mut() else {
                info!("Devices released, stopping fan control");
                return Ok(());
            };

            let temp = devices.aggregate_temperature();
            let speed = control.advance(temp, &settings, &ramp);
            debug!(
                "Old {}: new: {}, change: {}, speed: {}",
                control.old_temp,
                control.new_temp,
                control.delta(),
                speed
            );
            devices.write_speed(speed);
        }

        if !pause(settings.polling_interval(), &cancel_token).await {
            break;
        }
    }

    info!("Fan control stopped");
    Ok(())
}

/// Sleeps for `interval`. Returns `false` if cancelled first.
async fn pause(interval: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel_token.cancelled() => false,
        () = tokio::time::sleep(interval) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConfigManager, Settings, YamlSettings},
        devices::{DevicePaths, tests::fake_applesmc},
    };
    use pretty_assertions::assert_eq;
    use std::{fs, path::Path};
    use tokio::time::sleep;

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).unwrap()
    }

    fn state_for(dir: &Path) -> Arc<AppState> {
        Arc::new(
            AppState::new(
                ConfigManager::new(Settings::default(), None),
                &DevicePaths::single(dir),
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ramps_with_temperature_until_cancelled() {
        let dir = fake_applesmc(Some("40000"), &[1]);
        let state = state_for(dir.path());
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_fan_control_service(state, token.clone()));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(read(dir.path(), "fan1_manual"), "1");
        assert_eq!(read(dir.path(), "fan1_output"), "0");

        fs::write(dir.path().join("temp3_input"), "48000").unwrap();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(read(dir.path(), "fan1_output"), "606");

        fs::write(dir.path().join("temp3_input"), "56000").unwrap();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(read(dir.path(), "fan1_output"), "5600");

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reload_keeps_ramp_coefficients_frozen() {
        let dir = fake_applesmc(Some("40000"), &[1]);
        let state = state_for(dir.path());
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_fan_control_service(state.clone(), token.clone()));

        sleep(Duration::from_millis(500)).await;
        fs::write(dir.path().join("temp3_input"), "48000").unwrap();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(read(dir.path(), "fan1_output"), "606");

        let update = YamlSettings::parse("general:\n  high_temp: 40\n").unwrap();
        state.config_manager.apply(&update).await;

        // 45 steps at the step_up derived from high_temp 45 (101), not 40 (46).
        fs::write(dir.path().join("temp3_input"), "49000").unwrap();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(read(dir.path(), "fan1_output"), "4545");

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_first_sleep() {
        let dir = fake_applesmc(Some("40000"), &[1]);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_fan_control_service(state_for(dir.path()), token.clone()));

        sleep(Duration::from_millis(100)).await;
        token.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(read(dir.path(), "fan1_output"), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_once_devices_are_released() {
        let dir = fake_applesmc(Some("40000"), &[1]);
        let state = state_for(dir.path());
        let handle = tokio::spawn(run_fan_control_service(
            state.clone(),
            CancellationToken::new(),
        ));

        sleep(Duration::from_millis(100)).await;
        state.take_devices().await.unwrap().close_all();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refuses_to_start_without_devices() {
        let dir = fake_applesmc(Some("40000"), &[1]);
        let state = state_for(dir.path());
        drop(state.take_devices().await);

        assert!(
            run_fan_control_service(state, CancellationToken::new())
                .await
                .is_err()
        );
    }
}

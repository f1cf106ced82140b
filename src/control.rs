//! Temperature to fan speed control algorithm.
//!
//! Speed is pinned at the extremes (`low_temp` and below, `max_temp` and
//! above) and ramps in between. Each degree past a threshold weighs more than
//! the previous one: the ramp is scaled by the triangular number of degrees
//! travelled, so fans react gently near the threshold and hard near the top.
//! Upward ramps never lower the speed and downward ramps never raise it,
//! which gives the loop its hysteresis.

use crate::config::Settings;

/// Sum of `1..=n`, saturating at `i64::MAX`.
fn triangular(n: i64) -> i64 {
    n.saturating_mul(n.saturating_add(1)) / 2
}

/// Mean of milli-degree readings, rounded up to whole degrees.
///
/// An empty slice yields 0.
pub fn aggregate_temperature(millidegrees: &[i64]) -> i64 {
    let sum = millidegrees.iter().fold(0i64, |acc, v| acc.saturating_add(*v));
    let divisor = (millidegrees.len() as i64).max(1) * 1000;
    sum.div_euclid(divisor) + i64::from(sum.rem_euclid(divisor) != 0)
}

/// Speed added or removed per triangular step of the ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampCoefficients {
    pub step_up: i64,
    pub step_down: i64,
}

impl RampCoefficients {
    /// Derives the coefficients so that a full ramp spans the whole speed range.
    ///
    /// `settings` must be valid; see [`Settings::validate`].
    pub fn from_settings(settings: &Settings) -> Self {
        let span = settings.max_fan_speed.saturating_sub(settings.min_fan_speed);
        let up_steps = triangular(settings.max_temp.saturating_sub(settings.high_temp)).max(1);
        let down_steps = triangular(settings.max_temp.saturating_sub(settings.low_temp)).max(1);

        Self {
            step_up: span / up_steps,
            step_down: span / down_steps,
        }
    }
}

/// Computes the next fan speed from the previous and current aggregate
/// temperatures.
///
/// The result is always inside `[min_fan_speed, max_fan_speed]`.
pub fn next_speed(
    old_temp: i64,
    new_temp: i64,
    current_speed: i64,
    settings: &Settings,
    ramp: &RampCoefficients,
) -> i64 {
    let mut speed = current_speed;

    if new_temp >= settings.max_temp {
        speed = settings.max_fan_speed;
    }
    if new_temp <= settings.low_temp {
        speed = settings.min_fan_speed;
    }

    let delta = new_temp.saturating_sub(old_temp);

    if delta > 0 && settings.high_temp < new_temp && new_temp < settings.max_temp {
        let steps = triangular(new_temp.saturating_sub(settings.high_temp));
        let ramped = settings
            .min_fan_speed
            .saturating_add(steps.saturating_mul(ramp.step_up));
        speed = speed.max(ramped);
    }

    if delta < 0 && settings.low_temp < new_temp && new_temp < settings.max_temp {
        let steps = triangular(settings.max_temp.saturating_sub(new_temp));
        let ramped = settings
            .max_fan_speed
            .saturating_sub(steps.saturating_mul(ramp.step_down));
        speed = speed.min(ramped);
    }

    speed.clamp(settings.min_fan_speed, settings.max_fan_speed)
}

/// Loop-local control state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    pub old_temp: i64,
    pub new_temp: i64,
    pub fan_speed: i64,
}

impl ControlState {
    /// Starts at `min_fan_speed` with `temp` as the only known temperature.
    pub fn new(temp: i64, settings: &Settings) -> Self {
        Self {
            old_temp: temp,
            new_temp: temp,
            fan_speed: settings.min_fan_speed,
        }
    }

    /// Records `temp` as the newest reading and returns the speed to apply.
    pub fn advance(&mut self, temp: i64, settings: &Settings, ramp: &RampCoefficients) -> i64 {
        self.old_temp = self.new_temp;
        self.new_temp = temp;
        self.fan_speed = next_speed(self.old_temp, self.new_temp, self.fan_speed, settings, ramp);
        self.fan_speed
    }

    pub fn delta(&self) -> i64 {
        self.new_temp - self.old_temp
    }
}

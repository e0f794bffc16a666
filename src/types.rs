use serde::{Deserialize, Serialize};

/// Period of the control tick driving the profile executor, ms.
pub const TICK_PERIOD_MS: u64 = 100;

/// Depth of the sensor event channel.
pub const SENSOR_CHANNEL_DEPTH: usize = 16;

/// Depth of the command channel.
pub const COMMAND_CHANNEL_DEPTH: usize = 5;

/// In-memory log ring size.
pub const LOG_CAPACITY: usize = 100;

/// One completed sensor reading, timestamped by the driver in seconds
/// since boot.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    Pressure { bar: f64, t: f64 },
    /// Flow rate in ml/s, derived by the driver from the pulse period.
    Flow { rate: f64, t: f64 },
    /// The flow sensor stopped producing edges: no flow, or too little
    /// to measure.
    FlowStagnated { t: f64 },
    Mass { grams: f64, t: f64 },
    Temperature { celsius: f64, t: f64 },
}

/// Which measurement a command or observer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorSource {
    Pressure,
    Flow,
    Mass,
    Temperature,
}

/// The event delivered to sensor observers after each filter update.
#[derive(Debug, Clone, Copy)]
pub struct SensorSample {
    pub y: f64,
    pub dy: f64,
    pub t: f64,
    pub dt: f64,
    pub raw: f64,
}

/// Which PID loop a tuning command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidLoop {
    Temperature,
    Pressure,
    Flow,
}

/// Operator/console commands consumed by the controller. Panel and
/// encoder events arrive as commands too; their debouncing happens in
/// the input driver, outside this crate.
#[derive(Debug, Clone)]
pub enum Command {
    /// Brew switch edge: true = pressed (shot starts), false = released.
    BrewSwitch(bool),
    /// Encoder click edge; mode cycles on release.
    ModeSwitch(bool),
    /// Encoder rotation, in detents.
    Adjust(i32),

    EnableProfile(bool),
    ReadProfile(String),
    PrintProfile,

    TareFlow,
    TareMass,

    SetPumpFlow(f64),
    SetPumpPower(f64),
    SetHeatPower(f64),

    /// Retune a PID loop; absent fields keep their value. Always zeroes
    /// the integral and echoes the result to the log.
    Tune {
        target: PidLoop,
        set: Option<f64>,
        k_p: Option<f64>,
        t_i: Option<f64>,
        t_d: Option<f64>,
    },

    /// Tap a sensor's observer slot for a bounded number of log lines.
    LogSensor { source: SensorSource, lines: u32 },
    /// Log a per-tick shot summary line; negative runs until turned off.
    LogShot { lines: i32 },
}

/// Operating mode, cycled by the encoder click. In AUTO the profile
/// executor owns the setpoints; manual modes pin one of them to the
/// encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    Auto,
    ManualTemperature,
    ManualFlow,
    ManualPressure,
    ManualHeat,
    ManualPump,
}

impl ControlMode {
    const ORDER: [ControlMode; 6] = [
        ControlMode::Auto,
        ControlMode::ManualTemperature,
        ControlMode::ManualFlow,
        ControlMode::ManualPressure,
        ControlMode::ManualHeat,
        ControlMode::ManualPump,
    ];

    /// The next mode in the cycle. Mid-shot, heater-related modes are
    /// skipped; only flow, pressure and pump authority may change hands
    /// while pulling.
    pub fn next(self, mid_shot: bool) -> ControlMode {
        let mut i = Self::ORDER.iter().position(|&m| m == self).unwrap_or(0);

        loop {
            i = (i + 1) % Self::ORDER.len();
            let mode = Self::ORDER[i];

            if !mid_shot
                || matches!(
                    mode,
                    ControlMode::Auto
                        | ControlMode::ManualFlow
                        | ControlMode::ManualPressure
                        | ControlMode::ManualPump
                )
            {
                return mode;
            }
        }
    }
}

/// Published snapshot of the whole system, for UI and logging.
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub mode: ControlMode,
    pub profile_enabled: bool,
    /// 1-based active stage, 0 when profile execution is disabled.
    pub stage: usize,
    pub stages: usize,
    pub shot_time: f64,

    pub pressure: f64,
    pub flow: f64,
    pub volume: f64,
    pub mass: f64,
    pub temperature: f64,

    pub pressure_set: f64,
    pub flow_set: f64,
    pub temperature_set: f64,

    pub pump_flow: f64,
    pub heat_power: f64,

    pub last_error: Option<String>,
    pub log_messages: heapless::Vec<String, LOG_CAPACITY>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            mode: ControlMode::Auto,
            profile_enabled: true,
            stage: 0,
            stages: 0,
            shot_time: f64::NAN,
            pressure: f64::NAN,
            flow: f64::NAN,
            volume: f64::NAN,
            mass: f64::NAN,
            temperature: f64::NAN,
            pressure_set: f64::NAN,
            flow_set: f64::NAN,
            temperature_set: f64::NAN,
            pump_flow: f64::NAN,
            heat_power: f64::NAN,
            last_error: None,
            log_messages: heapless::Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_cycle_wraps() {
        let mut mode = ControlMode::Auto;

        for _ in 0..ControlMode::ORDER.len() {
            mode = mode.next(false);
        }
        assert_eq!(mode, ControlMode::Auto);
    }

    #[test]
    fn test_mode_cycle_skips_heater_modes_mid_shot() {
        let mut mode = ControlMode::Auto;
        let mut seen = Vec::new();

        for _ in 0..4 {
            mode = mode.next(true);
            seen.push(mode);
        }

        assert!(!seen.contains(&ControlMode::ManualTemperature));
        assert!(!seen.contains(&ControlMode::ManualHeat));
        assert_eq!(mode, ControlMode::Auto);
    }
}

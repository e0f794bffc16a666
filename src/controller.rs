use crate::{
    callbacks::Outcome,
    config::ControlConfig,
    machine::Machine,
    profile::{codec, Profile, ProfileExecutor},
    state::StateManager,
    types::{
        Command, ControlMode, PidLoop, SensorEvent, SystemState, COMMAND_CHANNEL_DEPTH,
        SENSOR_CHANNEL_DEPTH,
    },
};
use embassy_futures::select::{select3, Either3};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::{Duration, Instant, Ticker};
use log::{debug, info, warn};
use std::sync::Arc;

pub type SensorChannel = Channel<CriticalSectionRawMutex, SensorEvent, SENSOR_CHANNEL_DEPTH>;
pub type CommandChannel = Channel<CriticalSectionRawMutex, Command, COMMAND_CHANNEL_DEPTH>;

/// The single owner of the machine context and profile executor.
///
/// Sensor drivers and command frontends talk to it over channels; the
/// event loop interleaves sensor samples, commands and the periodic
/// control tick, so no lock ever guards the control state itself.
pub struct EspressoController {
    machine: Machine,
    executor: ProfileExecutor,
    state_manager: StateManager,
    mode: ControlMode,
    /// Set while the profile executor wants ticks.
    ticking: bool,
    /// Remaining per-tick shot summary lines; negative = unlimited.
    shot_log_lines: i32,
    tick_period: Duration,

    sensor_channel: Arc<SensorChannel>,
    command_channel: Arc<CommandChannel>,
}

impl EspressoController {
    pub fn new(config: &ControlConfig) -> Self {
        let profile = codec::parse(&config.profile).unwrap_or_else(|err| {
            warn!("Configured profile rejected ({}), using stock profile", err);
            Profile::default()
        });

        let mut executor = ProfileExecutor::new(profile);
        executor.enable(true);

        Self {
            machine: Machine::new(config),
            executor,
            state_manager: StateManager::new(),
            mode: ControlMode::Auto,
            ticking: false,
            shot_log_lines: 0,
            tick_period: Duration::from_millis(config.tick_period_ms),

            sensor_channel: Arc::new(Channel::new()),
            command_channel: Arc::new(Channel::new()),
        }
    }

    pub fn sensor_channel(&self) -> Arc<SensorChannel> {
        Arc::clone(&self.sensor_channel)
    }

    pub fn command_channel(&self) -> Arc<CommandChannel> {
        Arc::clone(&self.command_channel)
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    pub async fn run(&mut self) -> ! {
        info!(
            "Starting control loop, tick period {} ms",
            self.tick_period.as_millis()
        );

        let mut ticker = Ticker::every(self.tick_period);

        loop {
            let sensor_fut = self.sensor_channel.receive();
            let command_fut = self.command_channel.receive();
            let tick_fut = ticker.next();

            match select3(sensor_fut, command_fut, tick_fut).await {
                Either3::First(event) => self.handle_sensor(event),
                Either3::Second(command) => self.handle_command(command).await,
                Either3::Third(()) => self.tick().await,
            }
        }
    }

    fn handle_sensor(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Pressure { bar, t } => self.machine.sample_pressure(bar, t),
            SensorEvent::Flow { rate, t } => self.machine.sample_flow(rate, t),
            SensorEvent::FlowStagnated { t } => self.machine.flow_stagnated(t),
            SensorEvent::Mass { grams, t } => self.machine.sample_mass(grams, t),
            SensorEvent::Temperature { celsius, t } => self.machine.sample_temperature(celsius, t),
        }
    }

    async fn tick(&mut self) {
        let now = seconds(Instant::now());

        if self.ticking && self.executor.tick(&mut self.machine, now).is_done() {
            info!("Profile finished");
            self.state_manager
                .add_log("Profile finished".to_string())
                .await;
            self.ticking = false;
        }

        if self.shot_log_lines != 0 {
            if self.shot_log_lines > 0 {
                self.shot_log_lines -= 1;
            }
            info!(
                "shot {:.3}s: T={:.1} P={:.2} Q={:.2} V={:.1} m={:.1} heat={:.2} pump={:.2}",
                self.executor.shot_time(now),
                self.machine.temperature.y,
                self.machine.pressure.y,
                self.machine.flow(),
                self.machine.volume(),
                self.machine.mass.y,
                self.machine.heat_power(),
                self.machine.pump_flow(),
            );
        }

        self.publish(now).await;
    }

    async fn publish(&self, now: f64) {
        let snapshot = SystemState {
            mode: self.mode,
            profile_enabled: self.executor.is_enabled(),
            stage: self.executor.stage(),
            stages: self.executor.stages(),
            shot_time: self.executor.shot_time(now),

            pressure: self.machine.pressure.y,
            flow: self.machine.flow(),
            volume: self.machine.volume(),
            mass: self.machine.mass.y,
            temperature: self.machine.temperature.y,

            pressure_set: self.machine.pressure_pid.set,
            flow_set: self.machine.flow_pid.set,
            temperature_set: self.machine.temperature_pid.set,

            pump_flow: self.machine.pump_flow(),
            heat_power: self.machine.heat_power(),

            last_error: None,
            log_messages: heapless::Vec::new(),
        };

        self.state_manager.publish(snapshot).await;
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);

        match command {
            Command::BrewSwitch(true) => {
                let now = seconds(Instant::now());

                info!("Shot started");
                self.ticking = self.executor.start_shot(&mut self.machine, now);
                self.state_manager.add_log("Shot started".to_string()).await;
            }

            Command::BrewSwitch(false) => {
                info!("Shot stopped");
                self.executor.stop_shot();
                self.ticking = false;
                self.machine.pressure_pid.set = f64::NAN;
                self.machine.flow_pid.set = f64::NAN;
                self.machine.set_pump_flow(0.0);
                self.state_manager.add_log("Shot stopped".to_string()).await;
            }

            // Mode cycles on release.
            Command::ModeSwitch(true) => {}

            Command::ModeSwitch(false) => {
                let mid_shot = !self.executor.shot_time(seconds(Instant::now())).is_nan();

                self.mode = self.mode.next(mid_shot);
                if self.executor.enable(self.mode == ControlMode::Auto) {
                    self.ticking = true;
                }
                self.state_manager.set_mode(self.mode).await;
            }

            Command::Adjust(delta) => self.adjust(delta),

            Command::EnableProfile(enable) => {
                if self.executor.enable(enable) {
                    self.ticking = true;
                }
            }

            Command::ReadProfile(text) => {
                if self.executor.read_profile(&text) {
                    self.state_manager
                        .add_log(format!("Profile loaded: {} stages", self.executor.stages()))
                        .await;
                } else {
                    self.state_manager
                        .set_error(Some("Profile rejected".to_string()))
                        .await;
                }
            }

            Command::PrintProfile => {
                let text = self.executor.print_profile();
                info!("Profile: {}", text);
                self.state_manager.add_log(text).await;
            }

            Command::TareFlow => self.machine.tare_flow(),
            Command::TareMass => self.machine.tare_mass(),

            Command::SetPumpFlow(q) => self.machine.set_pump_flow(q),
            Command::SetPumpPower(p) => self.machine.set_pump_power(p),
            Command::SetHeatPower(p) => self.machine.set_heat_power(p),

            Command::Tune {
                target,
                set,
                k_p,
                t_i,
                t_d,
            } => {
                let pid = match target {
                    PidLoop::Temperature => &mut self.machine.temperature_pid,
                    PidLoop::Pressure => &mut self.machine.pressure_pid,
                    PidLoop::Flow => &mut self.machine.flow_pid,
                };

                if let Some(set) = set {
                    pid.set = set;
                }
                if let Some(k_p) = k_p {
                    pid.k_p = k_p;
                }
                if let Some(t_i) = t_i {
                    pid.t_i = t_i;
                }
                if let Some(t_d) = t_d {
                    pid.t_d = t_d;
                }
                pid.integral = 0.0;

                info!(
                    "{:?} loop: set={} k_p={} t_i={} t_d={}",
                    target, pid.set, pid.k_p, pid.t_i, pid.t_d
                );
            }

            Command::LogSensor { source, lines } => {
                if lines == 0 {
                    return;
                }

                let mut remaining = lines;
                let result = self.machine.add_observer(source, move |sample| {
                    info!(
                        "{:?} {:.3}s: {:.3} ({:.3}/s, raw {:.3})",
                        source,
                        sample.t,
                        sample.y,
                        sample.dy / sample.dt,
                        sample.raw
                    );

                    remaining -= 1;
                    if remaining == 0 {
                        Outcome::Remove
                    } else {
                        Outcome::Continue
                    }
                });

                if let Err(err) = result {
                    warn!("Cannot log {:?}: {}", source, err);
                }
            }

            Command::LogShot { lines } => {
                self.shot_log_lines = lines;
            }
        }
    }

    /// Encoder rotation. In a manual mode the first detent latches the
    /// setpoint onto the current measurement; further detents step it
    /// within its range, claiming pump or heater authority from the
    /// other loops as needed.
    fn adjust(&mut self, delta: i32) {
        let step =
            |x: f64, dx: f64, min: f64, max: f64| (x + f64::from(delta) * dx).clamp(min, max);

        match self.mode {
            ControlMode::Auto => {}

            ControlMode::ManualTemperature => {
                let pid = &mut self.machine.temperature_pid;
                pid.set = if pid.set.is_nan() {
                    100.0
                } else {
                    step(pid.set, 1.0, 20.0, 120.0)
                };
            }

            ControlMode::ManualPressure => {
                self.machine.flow_pid.set = f64::NAN;
                let current = self.machine.pressure.y.max(0.0);
                let pid = &mut self.machine.pressure_pid;
                pid.set = if pid.set.is_nan() {
                    current
                } else {
                    step(pid.set, 0.1, 0.0, 10.0)
                };
            }

            ControlMode::ManualFlow => {
                self.machine.pressure_pid.set = f64::NAN;
                let current = self.machine.flow.y;
                let pid = &mut self.machine.flow_pid;
                pid.set = if pid.set.is_nan() {
                    current
                } else {
                    step(pid.set, 0.1, 0.0, 10.0)
                };
            }

            ControlMode::ManualHeat => {
                self.machine.temperature_pid.set = f64::NAN;
                let power = step(self.machine.heat_power(), 0.05, 0.0, 1.0);
                self.machine.set_heat_power(power);
            }

            ControlMode::ManualPump => {
                self.machine.flow_pid.set = f64::NAN;
                self.machine.pressure_pid.set = f64::NAN;
                let flow = step(self.machine.pump_flow(), 0.05, 0.0, 1.0);
                self.machine.set_pump_flow(flow);
            }
        }
    }
}

fn seconds(instant: Instant) -> f64 {
    instant.as_micros() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorSource;
    use embassy_futures::block_on;

    fn controller() -> EspressoController {
        EspressoController::new(&ControlConfig::default())
    }

    #[test]
    fn test_mode_cycle_disables_profile_outside_auto() {
        block_on(async {
            let mut c = controller();
            assert!(c.executor.is_enabled());

            c.handle_command(Command::ModeSwitch(false)).await;
            assert_eq!(c.mode, ControlMode::ManualTemperature);
            assert!(!c.executor.is_enabled());

            for _ in 0..5 {
                c.handle_command(Command::ModeSwitch(false)).await;
            }
            assert_eq!(c.mode, ControlMode::Auto);
            assert!(c.executor.is_enabled());
        });
    }

    #[test]
    fn test_adjust_latches_then_steps() {
        block_on(async {
            let mut c = controller();

            c.handle_command(Command::ModeSwitch(false)).await;
            assert_eq!(c.mode, ControlMode::ManualTemperature);

            // First detent latches the default setpoint.
            c.handle_command(Command::Adjust(1)).await;
            assert_eq!(c.machine.temperature_pid.set, 100.0);

            c.handle_command(Command::Adjust(3)).await;
            assert_eq!(c.machine.temperature_pid.set, 103.0);

            // Clamped to range.
            c.handle_command(Command::Adjust(100)).await;
            assert_eq!(c.machine.temperature_pid.set, 120.0);
        });
    }

    #[test]
    fn test_manual_pressure_claims_pump_authority() {
        block_on(async {
            let mut c = controller();

            c.machine.flow_pid.set = 2.0;
            c.mode = ControlMode::ManualPressure;
            c.machine.sample_pressure(3.0, 0.0);
            c.machine.sample_pressure(3.0, 0.1);

            c.handle_command(Command::Adjust(1)).await;
            assert!(c.machine.flow_pid.set.is_nan());
            assert_eq!(c.machine.pressure_pid.set, 3.0);
        });
    }

    #[test]
    fn test_brew_switch_starts_and_stops_the_shot() {
        block_on(async {
            let mut c = controller();

            c.handle_command(Command::BrewSwitch(true)).await;
            assert!(c.ticking);
            assert_eq!(c.machine.volume(), 0.0);

            c.handle_command(Command::BrewSwitch(false)).await;
            assert!(!c.ticking);
            assert_eq!(c.machine.pump_flow(), 0.0);
            assert!(c.machine.pressure_pid.set.is_nan());
        });
    }

    #[test]
    fn test_tune_updates_gains_and_clears_integral() {
        block_on(async {
            let mut c = controller();
            c.machine.flow_pid.integral = 3.0;

            c.handle_command(Command::Tune {
                target: PidLoop::Flow,
                set: Some(2.5),
                k_p: None,
                t_i: Some(0.5),
                t_d: None,
            })
            .await;

            let pid = &c.machine.flow_pid;
            assert_eq!(pid.set, 2.5);
            assert_eq!(pid.t_i, 0.5);
            assert_eq!(pid.k_p, 0.08);
            assert_eq!(pid.integral, 0.0);
        });
    }

    #[test]
    fn test_shot_log_budget_counts_down_unless_unlimited() {
        block_on(async {
            let mut c = controller();

            c.handle_command(Command::LogShot { lines: 2 }).await;
            c.tick().await;
            c.tick().await;
            c.tick().await;
            assert_eq!(c.shot_log_lines, 0);

            c.handle_command(Command::LogShot { lines: -1 }).await;
            c.tick().await;
            assert_eq!(c.shot_log_lines, -1);
        });
    }

    #[test]
    fn test_bounded_sensor_logging_expires() {
        block_on(async {
            let mut c = controller();

            c.handle_command(Command::LogSensor {
                source: SensorSource::Pressure,
                lines: 2,
            })
            .await;

            for k in 0..5 {
                c.machine.sample_pressure(1.0, 0.1 * k as f64);
            }
            // The observer removed itself after two lines; the slot is
            // free again for a fresh tap.
            let free = c.machine.add_observer(SensorSource::Pressure, |_| Outcome::Remove);
            assert!(free.is_ok());
        });
    }
}

//! Drives a profile against the machine, one control tick at a time.
//!
//! The executor owns a cursor into the profile's stages. Every tick it
//! reads the active stage's input from the machine, locates the cubic
//! segment, and writes exactly one setpoint: the pressure loop's, the
//! flow loop's, or the pump command directly; the other two are cleared
//! to NaN so only one authority drives the pump.
//!
//! Completed stages run their actions and hand over within the same
//! tick, so a stage that is already complete on entry (or a `Back` loop
//! whose target is complete) cascades without emitting a stale setpoint.

use super::{codec, evaluate_at, Action, Profile, StageInput, StageOutput};
use crate::machine::Machine;
use log::{error, info};

/// Whether the executor still wants control ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Busy,
    Done,
}

impl TickOutcome {
    pub fn is_done(self) -> bool {
        self == TickOutcome::Done
    }
}

pub struct ProfileExecutor {
    profile: Profile,
    enabled: bool,
    /// Shot start time, seconds since boot; NaN when no shot is running.
    start: f64,
    /// Index of the active stage; == stages() once the profile is spent.
    cursor: usize,
    /// Set whenever the cursor moves; the next tick captures references,
    /// reseeds the output loop and resolves eased points before
    /// evaluating.
    initialize_stage: bool,
    input_reference: f64,
    output_reference: f64,
}

impl ProfileExecutor {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            enabled: false,
            start: f64::NAN,
            cursor: 0,
            initialize_stage: true,
            input_reference: f64::NAN,
            output_reference: f64::NAN,
        }
    }

    /// Begin a shot: zero the volume tare and both pump loop integrals,
    /// and rewind to the first stage. Returns whether the executor wants
    /// ticks (it does not when profile execution is disabled; the shot
    /// clock still runs for manual pulls).
    pub fn start_shot(&mut self, machine: &mut Machine, now: f64) -> bool {
        self.start = now;
        machine.tare_flow();
        machine.pressure_pid.integral = 0.0;
        machine.flow_pid.integral = 0.0;

        if self.enabled {
            self.cursor = 0;
            self.initialize_stage = true;
        }
        self.enabled
    }

    /// End the shot. Setpoints are left as they are; the controller
    /// decides what the pump does next.
    pub fn stop_shot(&mut self) {
        self.start = f64::NAN;
    }

    /// Enable or disable profile execution. Returns true when this
    /// (re-)arms execution mid-shot, in which case the caller should
    /// resume ticking. The cursor is left alone, so a mid-shot
    /// re-enable resumes at the stage where execution was paused; only
    /// `start_shot` rewinds.
    pub fn enable(&mut self, enable: bool) -> bool {
        let rearm = enable && !self.enabled && !self.start.is_nan();
        self.enabled = enable;
        rearm
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 1-based active stage for display, 0 when disabled.
    pub fn stage(&self) -> usize {
        if self.enabled {
            self.cursor + 1
        } else {
            0
        }
    }

    pub fn stages(&self) -> usize {
        self.profile.stages.len()
    }

    /// Seconds since the shot started, NaN when idle.
    pub fn shot_time(&self, now: f64) -> f64 {
        now - self.start
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn print_profile(&self) -> String {
        codec::print(&self.profile)
    }

    /// Replace the profile from text. On a syntax error the current
    /// profile is kept untouched and false is returned.
    pub fn read_profile(&mut self, text: &str) -> bool {
        match codec::parse(text) {
            Ok(profile) => {
                info!("Profile loaded: {} stages", profile.stages.len());
                self.profile = profile;
                true
            }
            Err(err) => {
                error!("Profile rejected: {}", err);
                false
            }
        }
    }

    /// One control tick. `now` is seconds since boot.
    pub fn tick(&mut self, machine: &mut Machine, now: f64) -> TickOutcome {
        if self.start.is_nan() || !self.enabled {
            return TickOutcome::Done;
        }

        while self.cursor < self.profile.stages.len() {
            let x_raw = match self.profile.stages[self.cursor].input {
                StageInput::Pressure => machine.pressure.y,
                StageInput::Time => now - self.start,
                StageInput::Volume => machine.volume(),
                StageInput::Mass => machine.mass.y,
                // Stagnation counts as no flow here, not as missing data.
                StageInput::Flow => nan_to_zero(machine.flow()),
            };

            if self.initialize_stage {
                self.initialize(machine, x_raw);
            }

            let stage = &self.profile.stages[self.cursor];
            let x = stage.input_mode.unapply(x_raw, self.input_reference);

            let Some(segment) = stage.locate(x) else {
                let mut went_back = false;

                for action in &stage.actions {
                    match action {
                        Action::ResetVolume => machine.tare_flow(),
                        Action::ResetTime => self.start = now,
                        Action::ResetMass => machine.tare_mass(),
                        Action::Back => {
                            self.cursor = self.cursor.saturating_sub(1);
                            went_back = true;
                        }
                    }
                }

                if !went_back {
                    self.cursor += 1;
                }
                self.initialize_stage = true;
                continue;
            };

            let y = stage
                .output_mode
                .apply(evaluate_at(&stage.points[segment], x), self.output_reference);

            match stage.output {
                StageOutput::Pressure => {
                    machine.pressure_pid.set = y;
                    machine.flow_pid.set = f64::NAN;
                }
                StageOutput::Flow => {
                    machine.pressure_pid.set = f64::NAN;
                    machine.flow_pid.set = y;
                }
                StageOutput::Power => {
                    machine.pressure_pid.set = f64::NAN;
                    machine.flow_pid.set = f64::NAN;
                    machine.set_pump_power(y);
                }
            }
            return TickOutcome::Busy;
        }

        // Profile spent: release the loops and stop the pump.
        machine.pressure_pid.set = f64::NAN;
        machine.flow_pid.set = f64::NAN;
        machine.set_pump_flow(0.0);
        TickOutcome::Done
    }

    /// Stage (re-)entry: capture the references, reseed whichever loop
    /// the stage drives for a bumpless handover, and resolve eased first
    /// points from the machine's current state.
    fn initialize(&mut self, machine: &mut Machine, x_raw: f64) {
        self.input_reference = x_raw;

        let stage = &mut self.profile.stages[self.cursor];
        let actual = match stage.output {
            StageOutput::Power => machine.pump_flow(),
            StageOutput::Pressure => {
                machine.pressure_pid.integral = 0.0;
                machine
                    .pressure_pid
                    .back_calculate(machine.pressure.rate(), machine.pump_flow());
                machine.pressure.y
            }
            StageOutput::Flow => {
                machine.flow_pid.integral = 0.0;
                machine
                    .flow_pid
                    .back_calculate(machine.flow_derivative(), machine.pump_flow());
                // Unlike the input read, the reference keeps NaN: with no
                // measured flow there is nothing to scale against.
                machine.flow()
            }
        };
        self.output_reference = actual;

        if stage.ease_input {
            stage.points[0].x = stage.input_mode.unapply(x_raw, self.input_reference);
            stage.interpolate_segment(0);
        }
        if stage.ease_output {
            stage.points[0].y = stage.output_mode.unapply(actual, self.output_reference);
            stage.interpolate_segment(0);
        }

        self.initialize_stage = false;
    }
}

fn nan_to_zero(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}

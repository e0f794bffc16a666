//! The machine context: filters, PID loops, actuator command state and
//! derived measurements, gathered into one explicitly-owned struct.
//!
//! A single owner (the controller's event loop) holds the context and
//! every sample or tick mutates it through `&mut`, so the single-writer
//! discipline is enforced by the borrow checker rather than by locks or
//! interrupt priorities.
//!
//! Sensor samples enter through the `sample_*` methods, which update the
//! corresponding filter, run the attached PID actuator step and then
//! deliver the filtered sample to any registered observers.

use crate::callbacks::{Registry, RegistryFull};
use crate::config::ControlConfig;
use crate::filter::Filter;
use crate::pid::Pid;
use crate::types::{SensorSample, SensorSource};

pub struct Machine {
    pub pressure: Filter,
    pub flow: Filter,
    pub mass: Filter,
    pub temperature: Filter,

    pub pressure_pid: Pid,
    pub flow_pid: Pid,
    pub temperature_pid: Pid,

    /// Integrated volume, ml. NaN until the first tare.
    volume: f64,
    mass_tare: f64,
    /// Set while the flow sensor reports stagnation; `flow()` and
    /// `flow_derivative()` read NaN until the next real sample.
    stagnated: bool,

    /// Commanded pump flow fraction in [0, 1]; NaN = not driving.
    pump_flow: f64,
    /// Commanded heater power fraction in [0, 1]; NaN = not driving.
    heat_power: f64,

    pressure_observers: Registry<SensorSample>,
    flow_observers: Registry<SensorSample>,
    mass_observers: Registry<SensorSample>,
    temperature_observers: Registry<SensorSample>,
}

impl Machine {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            pressure: config.pressure_filter.build(),
            flow: config.flow_filter.build(),
            mass: config.mass_filter.build(),
            temperature: config.temperature_filter.build(),

            pressure_pid: config.pressure_pid.build(),
            flow_pid: config.flow_pid.build(),
            temperature_pid: config.temperature_pid.build(),

            volume: f64::NAN,
            mass_tare: 0.0,
            stagnated: false,

            pump_flow: 0.0,
            heat_power: 0.0,

            pressure_observers: Registry::new(),
            flow_observers: Registry::new(),
            mass_observers: Registry::new(),
            temperature_observers: Registry::new(),
        }
    }

    /* Sensor entry points. */

    pub fn sample_pressure(&mut self, bar: f64, t: f64) {
        self.pressure.sample(bar, t);

        let (y, dy, dt) = (self.pressure.y, self.pressure.dy, self.pressure.dt);

        if !self.pressure_pid.set.is_nan() && !dt.is_nan() {
            assert!(dt > 0.0);

            let u = if y.is_nan() || dy.is_nan() {
                0.0
            } else {
                // Keep the pump turning; a fully stopped pump takes a
                // moment to restart and upsets the loop.
                self.pressure_pid.calculate_output(y, dy, dt).max(0.01)
            };

            self.set_pump_flow(u);
        }

        let sample = SensorSample {
            y,
            dy,
            t: self.pressure.t,
            dt,
            raw: bar,
        };
        self.pressure_observers.run(&sample);
    }

    pub fn sample_flow(&mut self, rate: f64, t: f64) {
        self.stagnated = false;
        self.flow.sample(rate, t);

        let (y, dy, dt) = (self.flow.y, self.flow.dy, self.flow.dt);

        if !y.is_nan() && !dt.is_nan() {
            self.volume += y * dt;
        }

        self.flow_pid_step(y, dy, dt);

        let sample = SensorSample {
            y,
            dy,
            t: self.flow.t,
            dt,
            raw: rate,
        };
        self.flow_observers.run(&sample);
    }

    /// The flow sensor stopped producing edges. The filter is fed a zero
    /// sample and the flow loop drives against zero measured flow, while
    /// `flow()` reports NaN so trajectory logic can tell stagnation from
    /// a true zero.
    pub fn flow_stagnated(&mut self, t: f64) {
        self.flow.sample(0.0, t);
        self.stagnated = true;

        let dt = self.flow.dt;
        self.flow_pid_step(0.0, 0.0, dt);

        let sample = SensorSample {
            y: 0.0,
            dy: 0.0,
            t: self.flow.t,
            dt,
            raw: 0.0,
        };
        self.flow_observers.run(&sample);
    }

    fn flow_pid_step(&mut self, y: f64, dy: f64, dt: f64) {
        if !self.flow_pid.set.is_nan() && !dt.is_nan() {
            assert!(dt > 0.0);

            let u = if y.is_nan() || dy.is_nan() {
                0.0
            } else {
                self.flow_pid.calculate_output(y, dy, dt).max(0.01)
            };

            self.set_pump_flow(u);
        }
    }

    pub fn sample_mass(&mut self, grams: f64, t: f64) {
        self.mass.sample(grams - self.mass_tare, t);

        let sample = SensorSample {
            y: self.mass.y,
            dy: self.mass.dy,
            t: self.mass.t,
            dt: self.mass.dt,
            raw: grams,
        };
        self.mass_observers.run(&sample);
    }

    pub fn sample_temperature(&mut self, celsius: f64, t: f64) {
        self.temperature.sample(celsius, t);

        let (y, dy, dt) = (
            self.temperature.y,
            self.temperature.dy,
            self.temperature.dt,
        );

        if !self.temperature_pid.set.is_nan() && !dt.is_nan() {
            assert!(dt > 0.0);

            let u = if y.is_nan() || dy.is_nan() {
                0.0
            } else {
                self.temperature_pid.calculate_output(y, dy, dt)
            };

            self.set_heat_power(u);
        }

        let sample = SensorSample {
            y,
            dy,
            t: self.temperature.t,
            dt,
            raw: celsius,
        };
        self.temperature_observers.run(&sample);
    }

    /* Derived measurements. */

    /// Filtered flow in ml/s, NaN while the sensor is stagnated.
    pub fn flow(&self) -> f64 {
        if self.stagnated {
            f64::NAN
        } else {
            self.flow.y
        }
    }

    /// Flow rate of change per second, NaN while stagnated.
    pub fn flow_derivative(&self) -> f64 {
        if self.stagnated {
            f64::NAN
        } else {
            self.flow.rate()
        }
    }

    /// Integrated volume since the last tare, ml.
    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn tare_flow(&mut self) {
        self.volume = 0.0;
    }

    /// Zero the mass reading at its current value.
    pub fn tare_mass(&mut self) {
        if !self.mass.y.is_nan() {
            self.mass_tare += self.mass.y;
            self.mass.y = 0.0;
        }
    }

    /* Actuators. */

    pub fn set_pump_flow(&mut self, q: f64) {
        self.pump_flow = q;
    }

    /// Command the pump by power fraction, through the inverse of the
    /// power-to-flow linearization (no useful flow below 25% power,
    /// close to linear above it).
    pub fn set_pump_power(&mut self, p: f64) {
        self.pump_flow = ((p - 0.25) / 0.75).max(0.0);
    }

    pub fn set_heat_power(&mut self, p: f64) {
        self.heat_power = p;
    }

    pub fn pump_flow(&self) -> f64 {
        self.pump_flow
    }

    /// Pump power fraction corresponding to the commanded flow.
    pub fn pump_power(&self) -> f64 {
        if self.pump_flow == 0.0 {
            0.0
        } else {
            0.75 * self.pump_flow + 0.25
        }
    }

    pub fn heat_power(&self) -> f64 {
        self.heat_power
    }

    /* Observers. */

    pub fn add_observer<F>(
        &mut self,
        source: SensorSource,
        observer: F,
    ) -> Result<(), RegistryFull>
    where
        F: FnMut(&SensorSample) -> crate::callbacks::Outcome + Send + 'static,
    {
        match source {
            SensorSource::Pressure => self.pressure_observers.add(observer),
            SensorSource::Flow => self.flow_observers.add(observer),
            SensorSource::Mass => self.mass_observers.add(observer),
            SensorSource::Temperature => self.temperature_observers.add(observer),
        }
    }
}

//! Anti-windup PID control law.
//!
//! Conditional integration after Åström, K.J. and Rundqwist, L. (1989),
//! "Integrator windup and how to avoid it", Proc. 1989 Am. Control
//! Conf.: 1693-1698. The `back-calculation` cargo feature swaps in the
//! alternative policy from the same paper; the two are alternatives, not
//! complements.

/// One control loop. A NaN setpoint means the controller is inactive;
/// controllers sharing an actuator are mutually exclusive through their
/// setpoints.
#[derive(Debug, Clone)]
pub struct Pid {
    pub k_p: f64,
    pub t_i: f64,
    pub t_d: f64,

    /// Target in measurement units, NaN when inactive.
    pub set: f64,
    pub integral: f64,
}

impl Pid {
    pub fn new(k_p: f64, t_i: f64, t_d: f64) -> Self {
        Self {
            k_p,
            t_i,
            t_d,
            set: f64::NAN,
            integral: 0.0,
        }
    }

    /// Seat a new setpoint context: the accumulated integral belongs to
    /// the previous one.
    pub fn reset(&mut self, set: f64) {
        self.set = set;
        self.integral = 0.0;
    }

    /// Evaluate the control law against a filtered measurement and rate.
    /// Returns a command in [0, 1]. `dt` must be positive; anything else
    /// is a caller bug, not a runtime condition.
    pub fn calculate_output(&mut self, y: f64, dy: f64, dt: f64) -> f64 {
        assert!(dt > 0.0, "PID evaluated with dt = {}", dt);

        let e = self.set - y;

        #[cfg(not(feature = "back-calculation"))]
        {
            // Integrate only while the measurement sits inside the band
            // that keeps the unclamped output in range, or while the
            // error opposes the accumulated integral (integrating then
            // relieves saturation rather than deepening it).

            let a = self.set + self.integral / self.t_i;

            if (y >= a - 1.0 / self.k_p && y <= a) || e * self.integral < 0.0 {
                self.integral += e * dt;
            }
        }

        #[cfg(feature = "back-calculation")]
        {
            self.integral += e * dt;
        }

        let u = self.k_p * (e + self.integral / self.t_i - self.t_d * dy / dt);

        if u < 0.0 || u > 1.0 {
            let v = if u > 1.0 { 1.0 } else { 0.0 };

            #[cfg(feature = "back-calculation")]
            {
                self.integral +=
                    (1.0 - (-dt / 0.1).exp()) * (v - u) * self.t_i / self.k_p;
            }

            return v;
        }

        u
    }

    /// Pre-load the integral so the next evaluation reproduces the
    /// actuator's current command `u` exactly, given the measured rate of
    /// change `dy_dt`. Called when a stage hands control authority to
    /// this loop, for bumpless transfer.
    pub fn back_calculate(&mut self, dy_dt: f64, u: f64) {
        self.integral = self.t_i * (u + self.k_p * self.t_d * dy_dt) / self.k_p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_clamped() {
        let mut pid = Pid::new(10.0, f64::INFINITY, 0.0);

        pid.set = 1.0;
        assert_eq!(pid.calculate_output(0.0, 0.0, 0.1), 1.0);
        assert_eq!(pid.calculate_output(2.0, 0.0, 0.1), 0.0);
    }

    #[cfg(not(feature = "back-calculation"))]
    #[test]
    fn test_conditional_integration_stops_windup() {
        let mut pid = Pid::new(1.0, 1.0, 0.0);
        pid.set = 1.0;

        // Half-scale error: the integral grows monotonically until the
        // measurement falls out of the integration band, then freezes.
        let mut last_integral = 0.0;

        for _ in 0..10 {
            pid.calculate_output(0.5, 0.0, 1.0);
            assert!(pid.integral >= last_integral);
            last_integral = pid.integral;
        }

        // Once saturated, same-signed error no longer accumulates.
        let frozen = pid.integral;
        assert_eq!(frozen, 1.0);
        assert_eq!(pid.calculate_output(0.5, 0.0, 1.0), 1.0);
        assert_eq!(pid.integral, frozen);

        // An error opposing the integral accumulates even while clamped.
        pid.set = -1.0;
        pid.calculate_output(0.5, 0.0, 1.0);
        assert!(pid.integral < frozen);
    }

    #[test]
    fn test_back_calculate_gives_bumpless_transfer() {
        let mut pid = Pid::new(0.3, 2.0, 0.5);
        pid.set = 9.0;

        // Pre-load the integral against the current command; the next
        // evaluation at zero error and unchanged rate reproduces it.
        let u = 0.4;
        let dy_dt = 0.2;
        pid.back_calculate(dy_dt, u);

        let dt = 0.1;
        let out = pid.calculate_output(9.0, dy_dt * dt, dt);
        assert!((out - u).abs() < 1e-12);
    }

    #[test]
    #[should_panic]
    fn test_zero_dt_is_fatal() {
        let mut pid = Pid::new(1.0, 1.0, 0.0);
        pid.set = 1.0;
        pid.calculate_output(0.0, 0.0, 0.0);
    }

    #[test]
    fn test_reset_clears_integral() {
        let mut pid = Pid::new(1.0, 1.0, 0.0);
        pid.set = 1.0;
        pid.calculate_output(0.5, 0.0, 1.0);
        assert!(pid.integral != 0.0);

        pid.reset(2.0);
        assert_eq!(pid.set, 2.0);
        assert_eq!(pid.integral, 0.0);
    }
}

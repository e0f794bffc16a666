//! Brew profiles: declarative, piecewise-cubic trajectories steering the
//! machine through a shot.
//!
//! A profile is an ordered list of stages. Each stage maps one observed
//! quantity (its input) through a curve onto one controlled quantity
//! (its output), with per-stage unit modes and exit actions. The curve
//! is authored as control points; the cubic coefficients `c2`/`c3` are
//! derived, never authored, and give every segment zero slope at both
//! endpoints, so the emitted setpoint trajectory has no kinks for the
//! derivative term to trip over.

pub mod codec;
pub mod executor;

pub use codec::ParseError;
pub use executor::{ProfileExecutor, TickOutcome};

/// The stock profile: a soaked preinfusion ramp, pressure hold with
/// eased entry, flow-limited decline, ratiometric taper and a looping
/// finish.
pub const DEFAULT_PROFILE: &str = ",rt;ap;(0,);(1,0);(30,0);(33,9);,ap;ap;(,9);(9,9);,af;ap;(0,9);(1.8,9);,ap;qf;(0,1);(9.5,1);,rt;ap;(0,);(1,9);bbbb";

/// Quantity a stage observes to find its position on the curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    Pressure,
    Time,
    Volume,
    Mass,
    Flow,
}

/// Quantity a stage drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutput {
    Flow,
    Power,
    Pressure,
}

/// Unit transform applied to a stage's input or output, against a
/// reference captured at stage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Absolute,
    Ratiometric,
    Relative,
}

impl Mode {
    /// Transform a curve value into machine units (output direction).
    pub fn apply(self, x: f64, reference: f64) -> f64 {
        match self {
            Mode::Absolute => x,
            Mode::Relative => x + reference,
            Mode::Ratiometric => x * reference,
        }
    }

    /// Transform a machine value into curve units (input direction);
    /// exact inverse of `apply`.
    pub fn unapply(self, x: f64, reference: f64) -> f64 {
        match self {
            Mode::Absolute => x,
            Mode::Relative => x - reference,
            Mode::Ratiometric => x / reference,
        }
    }
}

/// Executed in order when a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Back,
    ResetVolume,
    ResetTime,
    ResetMass,
}

#[derive(Debug, Clone, Copy)]
pub struct ControlPoint {
    pub x: f64,
    pub y: f64,
    /// Derived cubic coefficients for the segment starting here.
    pub c2: f64,
    pub c3: f64,
}

impl ControlPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            c2: f64::NAN,
            c3: f64::NAN,
        }
    }
}

/// Evaluate the cubic of the segment starting at `p` at position `x`.
pub fn evaluate_at(p: &ControlPoint, x: f64) -> f64 {
    let s = x - p.x;
    p.y + s * s * (p.c2 + s * p.c3)
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub input: StageInput,
    pub output: StageOutput,
    pub input_mode: Mode,
    pub output_mode: Mode,
    /// The first point's x/y are filled in from the live machine state
    /// at stage entry, for continuity with whatever came before.
    pub ease_input: bool,
    pub ease_output: bool,
    /// At least two, monotonic in x (ascending or strictly descending).
    pub points: Vec<ControlPoint>,
    pub actions: Vec<Action>,
}

impl Stage {
    /// Re-derive the cubic coefficients of segment `i` from its
    /// endpoints. The resulting cubic passes through both points with
    /// zero first derivative at each.
    pub fn interpolate_segment(&mut self, i: usize) {
        let h = self.points[i + 1].x - self.points[i].x;
        let d = (self.points[i + 1].y - self.points[i].y) / h / h;

        self.points[i].c2 = 3.0 * d;
        self.points[i].c3 = -2.0 * d / h;
    }

    pub fn interpolate(&mut self) {
        for i in 0..self.points.len() - 1 {
            self.interpolate_segment(i);
        }
    }

    fn descending(&self) -> bool {
        self.points[self.points.len() - 1].x < self.points[0].x
    }

    /// The segment index `x` falls into, or None once `x` has passed the
    /// final point and the stage is complete. Direction-aware: point
    /// abscissas may ascend or strictly descend. Positions before the
    /// first point extrapolate the first segment.
    pub fn locate(&self, x: f64) -> Option<usize> {
        let n = self.points.len();
        let descending = self.descending();
        let last = self.points[n - 1].x;

        if (!descending && x >= last) || (descending && x <= last) {
            return None;
        }

        for i in 0..n - 1 {
            let next = self.points[i + 1].x;

            if (!descending && next > x) || (descending && next < x) {
                return Some(i);
            }
        }

        Some(n - 2)
    }
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub stages: Vec<Stage>,
}

impl Profile {
    pub fn interpolate(&mut self) {
        for stage in &mut self.stages {
            stage.interpolate();
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        codec::parse(DEFAULT_PROFILE).expect("stock profile parses")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(p0: (f64, f64), p1: (f64, f64)) -> Stage {
        let mut stage = Stage {
            input: StageInput::Time,
            output: StageOutput::Pressure,
            input_mode: Mode::Absolute,
            output_mode: Mode::Absolute,
            ease_input: false,
            ease_output: false,
            points: vec![
                ControlPoint::new(p0.0, p0.1),
                ControlPoint::new(p1.0, p1.1),
            ],
            actions: vec![],
        };
        stage.interpolate();
        stage
    }

    #[test]
    fn test_flat_segment_is_constant() {
        let stage = segment((0.0, 3.0), (4.0, 3.0));

        for k in 0..=8 {
            let x = 0.5 * k as f64;
            assert_eq!(evaluate_at(&stage.points[0], x), 3.0);
        }
    }

    #[test]
    fn test_segment_interpolates_endpoints_with_zero_slope() {
        let stage = segment((0.0, 0.0), (4.0, 8.0));
        let p = &stage.points[0];

        assert_eq!(evaluate_at(p, 0.0), 0.0);
        assert!((evaluate_at(p, 4.0) - 8.0).abs() < 1e-12);
        // S-curve: halfway in x is halfway in y.
        assert!((evaluate_at(p, 2.0) - 4.0).abs() < 1e-12);

        // Zero first derivative at both endpoints: p'(x) = s (2 c2 + 3 c3 s).
        let h = 1e-6;
        assert!(((evaluate_at(p, h) - evaluate_at(p, 0.0)) / h).abs() < 1e-4);
        assert!(((evaluate_at(p, 4.0) - evaluate_at(p, 4.0 - h)) / h).abs() < 1e-4);
    }

    #[test]
    fn test_locate_ascending() {
        let mut stage = segment((0.0, 0.0), (4.0, 8.0));
        stage.points.push(ControlPoint::new(10.0, 8.0));
        stage.interpolate();

        assert_eq!(stage.locate(-1.0), Some(0));
        assert_eq!(stage.locate(0.0), Some(0));
        assert_eq!(stage.locate(3.9), Some(0));
        assert_eq!(stage.locate(4.0), Some(1));
        assert_eq!(stage.locate(9.9), Some(1));
        assert_eq!(stage.locate(10.0), None);
        assert_eq!(stage.locate(11.0), None);
    }

    #[test]
    fn test_locate_descending() {
        let mut stage = segment((9.0, 1.0), (4.0, 2.0));
        stage.points.push(ControlPoint::new(0.0, 3.0));
        stage.interpolate();

        assert_eq!(stage.locate(9.5), Some(0));
        assert_eq!(stage.locate(9.0), Some(0));
        assert_eq!(stage.locate(4.0), Some(1));
        assert_eq!(stage.locate(0.5), Some(1));
        assert_eq!(stage.locate(0.0), None);
        assert_eq!(stage.locate(-1.0), None);
    }

    #[test]
    fn test_unbounded_segment_stays_finite() {
        // A point at infinity pins the output to the previous level.
        let stage = segment((0.0, 5.0), (f64::INFINITY, 1.0));
        let p = &stage.points[0];

        assert_eq!(p.c2, 0.0);
        assert_eq!(evaluate_at(p, 123.0), 5.0);
    }

    #[test]
    fn test_mode_transforms_invert() {
        for mode in [Mode::Absolute, Mode::Relative, Mode::Ratiometric] {
            let x = mode.apply(mode.unapply(7.5, 3.0), 3.0);
            assert!((x - 7.5).abs() < 1e-12);
        }
    }
}

//! Textual profile format.
//!
//! ```text
//! ,rt;ap;(0,);(1,0);(30,0);(33,9);,ap;ap;(,9);(9,9);...
//! ```
//!
//! Each stage starts with `,`, then input mode and quantity, `;`, output
//! mode and quantity, `;`, the control points as `(x,y);`, and finally
//! zero or more action letters. A blank `x` or `y` in the first point
//! marks that axis as eased: the value is taken from the machine at
//! stage entry. Numbers take an optional sign and exponent; `inf` and
//! `nan` are accepted wherever a number is.
//!
//! Modes are `a`bsolute, `r`elative, ratiometri`q`; inputs `p`ressure,
//! `t`ime, `v`olume, `m`ass, `f`low; outputs `f`low, po`w`er,
//! `p`ressure; actions `b`ack, reset `v`olume, reset `t`ime, reset
//! `m`ass.
//!
//! `parse` is all-or-nothing: it either yields a fully interpolated
//! profile or an error locating the first offending byte, so a live
//! profile is never half-replaced.

use super::{Action, ControlPoint, Mode, Profile, Stage, StageInput, StageOutput};
use core::fmt;
use std::fmt::Write as _;

/// How much trailing input an error message echoes back.
const ERROR_CONTEXT: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Byte offset of the first unacceptable input.
    pub position: usize,
    pub expected: &'static str,
    /// The input from the error onward, truncated.
    pub rest: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "syntax error at byte {}: expected {} near \"{}\"",
            self.position, self.expected, self.rest
        )
    }
}

impl std::error::Error for ParseError {}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    /// Consume `b` if it is next.
    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8, expected: &'static str) -> Result<(), ParseError> {
        if self.eat(b) {
            Ok(())
        } else {
            Err(self.error(expected))
        }
    }

    fn error(&self, expected: &'static str) -> ParseError {
        self.error_at(self.pos, expected)
    }

    fn error_at(&self, position: usize, expected: &'static str) -> ParseError {
        let rest = self.input[position..]
            .chars()
            .take(ERROR_CONTEXT)
            .collect();
        ParseError {
            position,
            expected,
            rest,
        }
    }

    /// A number, `inf`/`nan` (optionally signed), or nothing at all: a
    /// blank field reads as NaN, which on a first point marks easing.
    fn number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;

        if matches!(self.peek(), Some(b'+') | Some(b'-')) {
            self.pos += 1;
        }
        if self.rest().starts_with("inf") || self.rest().starts_with("nan") {
            self.pos += 3;
        } else {
            let mantissa = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9') | Some(b'.')) {
                self.pos += 1;
            }

            // Optional exponent, only when digits actually follow the
            // marker; a bare `e` is left for the caller to trip over.
            if self.pos > mantissa && matches!(self.peek(), Some(b'e') | Some(b'E')) {
                let mark = self.pos;
                self.pos += 1;
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.pos += 1;
                }
                if matches!(self.peek(), Some(b'0'..=b'9')) {
                    while matches!(self.peek(), Some(b'0'..=b'9')) {
                        self.pos += 1;
                    }
                } else {
                    self.pos = mark;
                }
            }
        }

        if self.pos == start {
            return Ok(f64::NAN);
        }

        self.input[start..self.pos]
            .parse()
            .map_err(|_| self.error_at(start, "a number"))
    }
}

fn stage(sc: &mut Scanner) -> Result<Stage, ParseError> {
    let input_mode = mode(sc)?;
    let input = match sc.peek() {
        Some(b'p') => StageInput::Pressure,
        Some(b't') => StageInput::Time,
        Some(b'v') => StageInput::Volume,
        Some(b'm') => StageInput::Mass,
        Some(b'f') => StageInput::Flow,
        _ => return Err(sc.error("an input quantity (p, t, v, m or f)")),
    };
    sc.pos += 1;
    sc.expect(b';', "';'")?;

    let output_mode = mode(sc)?;
    let output = match sc.peek() {
        Some(b'f') => StageOutput::Flow,
        Some(b'w') => StageOutput::Power,
        Some(b'p') => StageOutput::Pressure,
        _ => return Err(sc.error("an output quantity (f, w or p)")),
    };
    sc.pos += 1;
    sc.expect(b';', "';'")?;

    let mut points = Vec::new();
    while sc.eat(b'(') {
        let x = sc.number()?;
        sc.expect(b',', "','")?;
        let y = sc.number()?;
        sc.expect(b')', "')'")?;
        sc.expect(b';', "';'")?;
        points.push(ControlPoint::new(x, y));
    }
    if points.len() < 2 {
        return Err(sc.error("at least two control points"));
    }

    let mut actions = Vec::new();
    while let Some(c) = sc.peek() {
        if !c.is_ascii_alphabetic() {
            break;
        }
        actions.push(match c {
            b'b' => Action::Back,
            b'v' => Action::ResetVolume,
            b't' => Action::ResetTime,
            b'm' => Action::ResetMass,
            _ => return Err(sc.error("an action (b, v, t or m)")),
        });
        sc.pos += 1;
    }

    Ok(Stage {
        input,
        output,
        input_mode,
        output_mode,
        ease_input: points[0].x.is_nan(),
        ease_output: points[0].y.is_nan(),
        points,
        actions,
    })
}

fn mode(sc: &mut Scanner) -> Result<Mode, ParseError> {
    let mode = match sc.peek() {
        Some(b'a') => Mode::Absolute,
        Some(b'r') => Mode::Relative,
        Some(b'q') => Mode::Ratiometric,
        _ => return Err(sc.error("a mode (a, r or q)")),
    };
    sc.pos += 1;
    Ok(mode)
}

pub fn parse(input: &str) -> Result<Profile, ParseError> {
    let mut sc = Scanner::new(input);
    let mut stages = Vec::new();

    while sc.eat(b',') {
        stages.push(stage(&mut sc)?);
    }
    if sc.pos < input.len() {
        return Err(sc.error("',' opening a stage"));
    }
    if stages.is_empty() {
        return Err(sc.error("at least one stage"));
    }

    let mut profile = Profile { stages };
    profile.interpolate();
    Ok(profile)
}

fn push_number(out: &mut String, v: f64) {
    if v.is_nan() {
        out.push_str("nan");
    } else {
        // `{}` prints the shortest digits that read back exactly, and
        // infinities as "inf", both of which reparse.
        let _ = write!(out, "{}", v);
    }
}

/// Render a profile back to its text form. Eased first-point fields are
/// printed blank, so printing a parsed profile reproduces the source
/// even after the executor has filled the eased values in.
pub fn print(profile: &Profile) -> String {
    let mut out = String::new();

    for stage in &profile.stages {
        out.push(',');
        out.push(mode_char(stage.input_mode));
        out.push(match stage.input {
            StageInput::Pressure => 'p',
            StageInput::Time => 't',
            StageInput::Volume => 'v',
            StageInput::Mass => 'm',
            StageInput::Flow => 'f',
        });
        out.push(';');
        out.push(mode_char(stage.output_mode));
        out.push(match stage.output {
            StageOutput::Flow => 'f',
            StageOutput::Power => 'w',
            StageOutput::Pressure => 'p',
        });
        out.push(';');

        for (i, p) in stage.points.iter().enumerate() {
            out.push('(');
            if !(i == 0 && stage.ease_input) {
                push_number(&mut out, p.x);
            }
            out.push(',');
            if !(i == 0 && stage.ease_output) {
                push_number(&mut out, p.y);
            }
            out.push_str(");");
        }

        for action in &stage.actions {
            out.push(match action {
                Action::Back => 'b',
                Action::ResetVolume => 'v',
                Action::ResetTime => 't',
                Action::ResetMass => 'm',
            });
        }
    }

    out
}

fn mode_char(mode: Mode) -> char {
    match mode {
        Mode::Absolute => 'a',
        Mode::Relative => 'r',
        Mode::Ratiometric => 'q',
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DEFAULT_PROFILE;

    #[test]
    fn test_default_profile_round_trips() {
        let profile = parse(DEFAULT_PROFILE).unwrap();
        assert_eq!(print(&profile), DEFAULT_PROFILE);
    }

    #[test]
    fn test_default_profile_shape() {
        let profile = parse(DEFAULT_PROFILE).unwrap();
        assert_eq!(profile.stages.len(), 5);

        let preinfusion = &profile.stages[0];
        assert_eq!(preinfusion.input, StageInput::Time);
        assert_eq!(preinfusion.input_mode, Mode::Relative);
        assert_eq!(preinfusion.output, StageOutput::Pressure);
        assert!(preinfusion.ease_output);
        assert!(!preinfusion.ease_input);
        assert_eq!(preinfusion.points.len(), 4);

        let hold = &profile.stages[1];
        assert!(hold.ease_input);
        assert!(!hold.ease_output);

        let taper = &profile.stages[3];
        assert_eq!(taper.output_mode, Mode::Ratiometric);
        assert_eq!(taper.output, StageOutput::Flow);

        let finish = &profile.stages[4];
        assert_eq!(finish.actions, vec![Action::Back; 4]);
    }

    #[test]
    fn test_parse_derives_cubics() {
        let profile = parse(",at;af;(0,0);(4,8);").unwrap();
        let p = &profile.stages[0].points[0];

        assert!((p.c2 - 1.5).abs() < 1e-12);
        assert!((p.c3 + 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_exponent_notation() {
        let profile = parse(",at;ap;(1e2,2.5e-1);(2E2,1e+1);").unwrap();
        let points = &profile.stages[0].points;

        assert_eq!(points[0].x, 100.0);
        assert_eq!(points[0].y, 0.25);
        assert_eq!(points[1].x, 200.0);
        assert_eq!(points[1].y, 10.0);

        // An exponent marker without digits is not part of the number.
        assert!(parse(",at;ap;(1e,2);(3,4);").is_err());
    }

    #[test]
    fn test_special_numbers() {
        let profile = parse(",at;ap;(0,2);(inf,2);(nan,-1);").unwrap();
        let points = &profile.stages[0].points;

        assert_eq!(points[1].x, f64::INFINITY);
        assert!(points[2].x.is_nan());
        assert_eq!(points[2].y, -1.0);
    }

    #[test]
    fn test_error_locates_offending_byte() {
        let err = parse(",at;ap;(0,2);(x,3);").unwrap_err();
        assert_eq!(err.position, 14);
        assert!(err.rest.starts_with("x,3"));

        let err = parse(",zt;ap;(0,2);(1,3);").unwrap_err();
        assert_eq!(err.position, 1);
        assert_eq!(err.expected, "a mode (a, r or q)");
    }

    #[test]
    fn test_rejects_underfilled_stages() {
        assert!(parse("").is_err());
        assert!(parse(",at;ap;(0,2);").is_err());
        assert!(parse(",at;ap;").is_err());
        assert!(parse("at;ap;(0,2);(1,3);").is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let err = parse(",at;ap;(0,2);(1,3);!").unwrap_err();
        assert_eq!(err.position, 19);
    }
}

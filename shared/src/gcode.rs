//! Motion primitives and the command assembler.
//!
//! The stage speaks a tiny G-code vocabulary:
//!
//! | primitive                 | text            |
//! |---------------------------|-----------------|
//! | absolute positioning      | `G90`           |
//! | relative positioning      | `G91`           |
//! | home all axes             | `G28`           |
//! | move along an axis        | `G1 X-1.5`      |
//! | set approach height       | `G1 Z175`       |
//!
//! The assembler only builds text; delivering it to the stage is the job of a
//! command channel in the `hardware` crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::feedback::Command;
use crate::stage::{CalibrationStage, StageHeights};

/// Magnitudes below this are emitted as exactly zero
const ZERO_EPSILON: f64 = 1e-12;

/// Stage axis letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// One atomic instruction to the stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MotionPrimitive {
    SetAbsolute,
    SetRelative,
    Home,
    Move { axis: Axis, distance: f64 },
    SetHeight(f64),
}

impl fmt::Display for MotionPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MotionPrimitive::SetAbsolute => write!(f, "G90"),
            MotionPrimitive::SetRelative => write!(f, "G91"),
            MotionPrimitive::Home => write!(f, "G28"),
            MotionPrimitive::Move { axis, distance } => {
                write!(f, "G1 {axis}{}", format_number(*distance))
            }
            MotionPrimitive::SetHeight(z) => write!(f, "G1 Z{}", format_number(*z)),
        }
    }
}

/// Errors parsing a primitive line.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcodeParseError {
    #[error("empty G-code line")]
    Empty,

    #[error("unsupported G-code: {0}")]
    Unsupported(String),

    #[error("invalid move word: {0}")]
    InvalidMove(String),
}

impl FromStr for MotionPrimitive {
    type Err = GcodeParseError;

    /// Parse one line of the vocabulary emitted by [`CommandAssembler`].
    ///
    /// `G1 Z<v>` parses as [`MotionPrimitive::SetHeight`].
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let code = words.next().ok_or(GcodeParseError::Empty)?;

        match code.to_ascii_uppercase().as_str() {
            "G90" => Ok(MotionPrimitive::SetAbsolute),
            "G91" => Ok(MotionPrimitive::SetRelative),
            "G28" => Ok(MotionPrimitive::Home),
            "G1" | "G0" => {
                let word = words
                    .next()
                    .ok_or_else(|| GcodeParseError::InvalidMove(line.to_string()))?;
                if words.next().is_some() {
                    return Err(GcodeParseError::Unsupported(line.to_string()));
                }
                let mut chars = word.chars();
                let axis: Axis = chars
                    .next()
                    .map(|c| c.to_ascii_uppercase().to_string())
                    .and_then(|letter| letter.parse().ok())
                    .ok_or_else(|| GcodeParseError::InvalidMove(word.to_string()))?;
                let value: f64 = chars
                    .as_str()
                    .parse()
                    .map_err(|_| GcodeParseError::InvalidMove(word.to_string()))?;
                Ok(match axis {
                    Axis::Z => MotionPrimitive::SetHeight(value),
                    _ => MotionPrimitive::Move {
                        axis,
                        distance: value,
                    },
                })
            }
            _ => Err(GcodeParseError::Unsupported(line.to_string())),
        }
    }
}

/// Ordered sequence of primitives delivered to the stage as one script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionProgram {
    primitives: Vec<MotionPrimitive>,
}

impl MotionProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, primitive: MotionPrimitive) {
        self.primitives.push(primitive);
    }

    pub fn primitives(&self) -> &[MotionPrimitive] {
        &self.primitives
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// One rendered line per primitive
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.primitives.iter().map(|p| p.to_string())
    }

    /// Newline-joined script text
    pub fn to_script(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

impl From<Vec<MotionPrimitive>> for MotionProgram {
    fn from(primitives: Vec<MotionPrimitive>) -> Self {
        Self { primitives }
    }
}

impl From<MotionPrimitive> for MotionProgram {
    fn from(primitive: MotionPrimitive) -> Self {
        Self {
            primitives: vec![primitive],
        }
    }
}

impl fmt::Display for MotionProgram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_script())
    }
}

/// Target of a height primitive: a calibration stage's approach height or a raw value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeightTarget {
    Stage(CalibrationStage),
    Absolute(f64),
}

impl From<CalibrationStage> for HeightTarget {
    fn from(stage: CalibrationStage) -> Self {
        HeightTarget::Stage(stage)
    }
}

impl From<f64> for HeightTarget {
    fn from(height: f64) -> Self {
        HeightTarget::Absolute(height)
    }
}

/// Builds primitives and keeps an append-only history of everything emitted.
#[derive(Debug, Clone)]
pub struct CommandAssembler {
    history: MotionProgram,
    base_distance: f64,
    stage_heights: StageHeights,
}

impl Default for CommandAssembler {
    fn default() -> Self {
        Self::new(1.0, StageHeights::default())
    }
}

impl CommandAssembler {
    /// # Arguments
    /// * `base_distance` - Axis travel for a command with multiplier 1.0
    /// * `stage_heights` - Approach heights keyed by calibration stage
    pub fn new(base_distance: f64, stage_heights: StageHeights) -> Self {
        Self {
            history: MotionProgram::new(),
            base_distance,
            stage_heights,
        }
    }

    pub fn set_absolute(&mut self) -> MotionPrimitive {
        self.append(MotionPrimitive::SetAbsolute)
    }

    pub fn set_relative(&mut self) -> MotionPrimitive {
        self.append(MotionPrimitive::SetRelative)
    }

    pub fn home(&mut self) -> MotionPrimitive {
        self.append(MotionPrimitive::Home)
    }

    /// Axis move for a feedback command, scaled by `multiplier`.
    ///
    /// [`Command::Centered`] emits nothing and leaves the history untouched.
    pub fn move_command(&mut self, command: Command, multiplier: f64) -> Option<MotionPrimitive> {
        let (axis, sign) = command.axis_sign()?;
        let mut distance = sign * self.base_distance * multiplier;
        if distance.abs() < ZERO_EPSILON {
            distance = 0.0;
        }
        Some(self.append(MotionPrimitive::Move { axis, distance }))
    }

    /// Height primitive for a stage's approach height or an explicit value.
    pub fn set_height(&mut self, target: impl Into<HeightTarget>) -> MotionPrimitive {
        let z = match target.into() {
            HeightTarget::Stage(stage) => self.stage_heights.height(stage),
            HeightTarget::Absolute(z) => z,
        };
        self.append(MotionPrimitive::SetHeight(z))
    }

    /// Everything emitted since the last [`clear`](Self::clear)
    pub fn program(&self) -> &MotionProgram {
        &self.history
    }

    pub fn last(&self) -> Option<&MotionPrimitive> {
        self.history.primitives().last()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history = MotionProgram::new();
    }

    pub fn base_distance(&self) -> f64 {
        self.base_distance
    }

    fn append(&mut self, primitive: MotionPrimitive) -> MotionPrimitive {
        self.history.push(primitive);
        primitive
    }
}

/// Render a G-code number.
///
/// Integral values print without a decimal point (`175`, `-3`); everything
/// else prints like C's `%.12g`: 12 significant digits, trailing zeros
/// removed, exponent form below `1e-4` or from `1e12` up.
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    if value.fract() == 0.0 {
        return format!("{value:.0}");
    }

    // Round to 12 significant digits first; the exponent of the rounded
    // value decides between fixed and exponent notation.
    let scientific = format!("{value:.11e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if !(-4..12).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{sign}{:02}",
            trim_fraction(mantissa),
            exponent.unsigned_abs()
        )
    } else {
        let decimals = (11 - exponent) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

//! Colosseum line protocol
//!
//! Every command and response is one ASCII line:
//!
//! ```text
//! <NAME,MOTORS,ARG1,ARG2,ARG3>
//! ```
//!
//! - `NAME`: one of `RUN`, `STOP`, `RESUME`, `PAUSE`, `SET_SPEED`, `SET_ACCEL`
//! - `MOTORS`: three-digit binary indicator of the addressed steppers; the
//!   fraction collector always drives all three (`111`)
//! - `ARG1..3`: per-motor floating point argument
//!
//! The firmware echoes each command once it has been applied. A response is
//! accepted when its first token (the command name) matches the command that
//! was sent; arguments are not compared.
//!
//! Right after the port opens the firmware prints [`HANDSHAKE_BANNER`].

use crate::error::{SessionError, SessionResult};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Banner the firmware prints once it is ready to accept commands.
pub const HANDSHAKE_BANNER: &str = "<Arduino is ready>";

/// Default stepper acceleration sent during setup.
pub const DEFAULT_ACCELERATION: f64 = 1000.0;

/// Default stepper speed sent during setup.
pub const DEFAULT_SPEED: f64 = 1000.0;

/// Incremental rotation (degrees) from tube `i` to tube `i + 1`.
const BUILTIN_ANGLES: [f64; 87] = [
    84.0, 78.0, 75.0, 70.0, 64.0, 61.0, 58.0, 56.0, 54.0, 52.0, 50.0, 48.0, 47.0, 46.0, 45.0, 44.0,
    43.0, 42.0, 41.0, 40.0, 39.0, 39.0, 38.0, 37.0, 36.0, 36.0, 35.0, 34.0, 34.0, 34.0, 33.0, 33.0,
    32.0, 32.0, 31.0, 31.0, 31.0, 30.0, 30.0, 30.0, 29.0, 29.0, 29.0, 28.0, 28.0, 28.0, 27.0, 27.0,
    27.0, 26.0, 26.0, 26.0, 26.0, 26.0, 25.0, 25.0, 25.0, 25.0, 24.0, 24.0, 24.0, 24.0, 24.0, 24.0,
    23.0, 23.0, 23.0, 23.0, 23.0, 23.0, 22.0, 22.0, 22.0, 22.0, 22.0, 22.0, 22.0, 22.0, 21.0, 21.0,
    21.0, 21.0, 21.0, 21.0, 21.0, 20.0, 20.0,
];

/// Command names understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    /// Rotate by the given angles.
    Run,
    /// Halt all motion.
    Stop,
    /// Resume after a firmware-side pause.
    Resume,
    /// Firmware-side pause.
    Pause,
    /// Configure stepper speed.
    SetSpeed,
    /// Configure stepper acceleration.
    SetAccel,
}

impl CommandName {
    /// Wire token for this command.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Run => "RUN",
            CommandName::Stop => "STOP",
            CommandName::Resume => "RESUME",
            CommandName::Pause => "PAUSE",
            CommandName::SetSpeed => "SET_SPEED",
            CommandName::SetAccel => "SET_ACCEL",
        }
    }
}

impl FromStr for CommandName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUN" => Ok(CommandName::Run),
            "STOP" => Ok(CommandName::Stop),
            "RESUME" => Ok(CommandName::Resume),
            "PAUSE" => Ok(CommandName::Pause),
            "SET_SPEED" => Ok(CommandName::SetSpeed),
            "SET_ACCEL" => Ok(CommandName::SetAccel),
            other => Err(format!("unknown command name '{}'", other)),
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the three steppers a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MotorMask([bool; 3]);

impl MotorMask {
    /// All three motors, the id used by every fraction collector command.
    pub const ALL: MotorMask = MotorMask([true, true, true]);
}

impl Default for MotorMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromStr for MotorMask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits: Vec<bool> = s
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(format!("invalid motor indicator '{}' in '{}'", other, s)),
            })
            .collect::<Result<_, _>>()?;
        match bits.as_slice() {
            [a, b, c] => Ok(MotorMask([*a, *b, *c])),
            _ => Err(format!("motor indicator '{}' must have three digits", s)),
        }
    }
}

impl fmt::Display for MotorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in self.0 {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// A single protocol command.
///
/// Arguments are kept as their wire text so a parsed command re-renders
/// exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: CommandName,
    motors: MotorMask,
    args: [String; 3],
}

impl Command {
    fn uniform(name: CommandName, arg: String) -> Self {
        Self {
            name,
            motors: MotorMask::ALL,
            args: [arg.clone(), arg.clone(), arg],
        }
    }

    /// Rotate the tube bed by `angle` degrees, e.g. `<RUN,111,45,45,45>`.
    pub fn run(angle: f64) -> Self {
        Self::uniform(CommandName::Run, format!("{}", angle))
    }

    /// Halt all motors: `<STOP,111,0.0,0.0,0.0>`.
    pub fn stop() -> Self {
        Self::uniform(CommandName::Stop, format!("{:.1}", 0.0))
    }

    /// Stepper acceleration, e.g. `<SET_ACCEL,111,1000.0,1000.0,1000.0>`.
    pub fn set_acceleration(value: f64) -> Self {
        Self::uniform(CommandName::SetAccel, format!("{:.1}", value))
    }

    /// Stepper speed, e.g. `<SET_SPEED,111,1000.0,1000.0,1000.0>`.
    pub fn set_speed(value: f64) -> Self {
        Self::uniform(CommandName::SetSpeed, format!("{:.1}", value))
    }

    /// Address a different set of motors.
    pub fn with_motors(mut self, motors: MotorMask) -> Self {
        self.motors = motors;
        self
    }

    /// Command name.
    pub fn name(&self) -> CommandName {
        self.name
    }

    /// Addressed motors.
    pub fn motors(&self) -> MotorMask {
        self.motors
    }

    /// Parse and validate a command line.
    ///
    /// # Errors
    /// `InvalidCommand` unless the line is exactly `<NAME,MOTORS,F1,F2,F3>`
    /// with a known name, a three-digit binary motor mask and numeric
    /// arguments.
    pub fn parse(line: &str) -> SessionResult<Self> {
        let invalid = |reason: String| SessionError::InvalidCommand {
            command: line.to_string(),
            reason,
        };

        let inner = line
            .trim()
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| invalid("command must be wrapped in '<' and '>'".to_string()))?;

        let fields: Vec<&str> = inner.split(',').collect();
        let [name, motors, a, b, c] = fields.as_slice() else {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        };

        let name: CommandName = name.parse().map_err(invalid)?;
        let motors: MotorMask = motors.parse().map_err(invalid)?;
        for arg in [a, b, c] {
            arg.parse::<f64>()
                .map_err(|_| invalid(format!("argument '{}' is not a number", arg)))?;
        }

        Ok(Self {
            name,
            motors,
            args: [a.to_string(), b.to_string(), c.to_string()],
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{},{},{},{},{}>",
            self.name, self.motors, self.args[0], self.args[1], self.args[2]
        )
    }
}

/// The commands sent once after connecting, before any run.
pub fn setup_commands(acceleration: f64, speed: f64) -> Vec<Command> {
    vec![Command::set_acceleration(acceleration), Command::set_speed(speed)]
}

/// First token of a line, splitting on `<`, `>` and `,`.
pub fn command_name(line: &str) -> Option<&str> {
    line.split(|c| c == '<' || c == '>' || c == ',')
        .find(|token| !token.is_empty())
}

/// Check that `response` echoes the command name of `command`.
///
/// # Errors
/// `UnexpectedResponse` if the names differ or either line has no token.
pub fn verify_response(command: &str, response: &str) -> SessionResult<()> {
    match (command_name(command), command_name(response)) {
        (Some(sent), Some(received)) if sent == received => Ok(()),
        _ => Err(SessionError::UnexpectedResponse {
            expected: command.to_string(),
            received: response.to_string(),
        }),
    }
}

/// Per-position rotation angles for the tube bed.
///
/// Entry `i` is the rotation needed to advance from tube `i` to tube `i + 1`.
/// There is no wraparound: a run may use at most [`len`](Self::len) fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleTable(Vec<f64>);

impl AngleTable {
    /// Build a table from explicit angles.
    ///
    /// # Errors
    /// `Configuration` if any angle is negative or not finite.
    pub fn new(angles: Vec<f64>) -> SessionResult<Self> {
        if let Some((i, bad)) = angles
            .iter()
            .enumerate()
            .find(|(_, a)| !a.is_finite() || **a < 0.0)
        {
            return Err(SessionError::Configuration(format!(
                "angle {} at position {} must be a finite, non-negative number",
                bad, i
            )));
        }
        Ok(Self(angles))
    }

    /// The reference table for the standard tube bed.
    pub fn builtin() -> Self {
        Self(BUILTIN_ANGLES.to_vec())
    }

    /// Parse one angle per line. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> SessionResult<Self> {
        let mut angles = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let angle = line.parse::<f64>().map_err(|_| {
                SessionError::Configuration(format!(
                    "angle table line {}: '{}' is not a number",
                    lineno + 1,
                    line
                ))
            })?;
            angles.push(angle);
        }
        Self::new(angles)
    }

    /// Load a table file in the [`parse`](Self::parse) format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SessionResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Configuration(format!(
                "failed to read angle table '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    /// Angle for the move away from `position`.
    pub fn get(&self, position: usize) -> Option<f64> {
        self.0.get(position).copied()
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw angles.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl Default for AngleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_formatting() {
        assert_eq!(Command::run(45.0).to_string(), "<RUN,111,45,45,45>");
        assert_eq!(Command::run(22.5).to_string(), "<RUN,111,22.5,22.5,22.5>");
        assert_eq!(Command::stop().to_string(), "<STOP,111,0.0,0.0,0.0>");
        assert_eq!(
            Command::set_acceleration(1000.0).to_string(),
            "<SET_ACCEL,111,1000.0,1000.0,1000.0>"
        );
        assert_eq!(
            Command::set_speed(1000.0).to_string(),
            "<SET_SPEED,111,1000.0,1000.0,1000.0>"
        );
    }

    #[test]
    fn test_parse_round_trips_wire_text() {
        let line = "<RUN,110,200,200,0>";
        let cmd = Command::parse(line).unwrap();
        assert_eq!(cmd.name(), CommandName::Run);
        assert_eq!(cmd.motors(), "110".parse().unwrap());
        assert_eq!(cmd.to_string(), line);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for line in [
            "RUN,111,1,1,1",
            "<JUMP,111,1,1,1>",
            "<RUN,121,1,1,1>",
            "<RUN,11,1,1,1>",
            "<RUN,111,1,1>",
            "<RUN,111,a,1,1>",
        ] {
            assert!(
                matches!(Command::parse(line), Err(SessionError::InvalidCommand { .. })),
                "{} should be rejected",
                line
            );
        }
    }

    #[test]
    fn test_command_name_token() {
        assert_eq!(command_name("<RUN,111,45,45,45>"), Some("RUN"));
        assert_eq!(command_name("SET_SPEED,111"), Some("SET_SPEED"));
        assert_eq!(command_name("<<>>"), None);
        assert_eq!(command_name(""), None);
    }

    #[test]
    fn test_verify_response() {
        assert!(verify_response("<RUN,111,45,45,45>", "<RUN,111,45,45,45>").is_ok());
        // Arguments are not compared
        assert!(verify_response("<RUN,111,45,45,45>", "<RUN,111,0,0,0>").is_ok());

        let err = verify_response("<RUN,111,45,45,45>", "<STOP,111,0,0,0>").unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedResponse { .. }));

        assert!(verify_response("<RUN,111,45,45,45>", "").is_err());
    }

    #[test]
    fn test_builtin_angles() {
        let table = AngleTable::builtin();
        assert_eq!(table.len(), 87);
        assert_eq!(table.get(0), Some(84.0));
        assert_eq!(table.get(86), Some(20.0));
        assert_eq!(table.get(87), None);
    }

    #[test]
    fn test_parse_angle_table() {
        let text = "# tube bed rev B\n84\n\n  78.5 \n# trailing comment\n70\n";
        let table = AngleTable::parse(text).unwrap();
        assert_eq!(table.as_slice(), &[84.0, 78.5, 70.0]);

        assert!(matches!(
            AngleTable::parse("84\nforty\n"),
            Err(SessionError::Configuration(_))
        ));
        assert!(matches!(
            AngleTable::parse("84\n-3\n"),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_angle_table_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "10\n20\n30\n").unwrap();
        let table = AngleTable::from_file(file.path()).unwrap();
        assert_eq!(table.len(), 3);

        assert!(AngleTable::from_file("/nonexistent/angles.txt").is_err());
    }
}

//! Typed vocabulary of the pump: status codes, faults, valve positions and modes.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::EnumIter;

use crate::error::InvalidInput;
use crate::protocol::DecodeError;

/// Status character for an idle pump with no error.
pub const STATUS_IDLE_ERROR_FREE: char = '`';
/// Status character for a busy pump with no error.
pub const STATUS_BUSY_ERROR_FREE: char = '@';

/// Hardware faults reported in the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `a`
    InitializationFailure,
    /// `b`
    InvalidCommand,
    /// `c`
    InvalidOperand,
    /// `f`
    EepromFailure,
    /// `g`
    NotInitialized,
    /// `i`
    PlungerOverload,
    /// `j`
    ValveOverload,
    /// `k`
    PlungerStuck,
    /// Any other fault letter.
    Unknown(char),
}

impl Fault {
    /// Every fault the firmware documents.
    pub const KNOWN: [Fault; 8] = [
        Fault::InitializationFailure,
        Fault::InvalidCommand,
        Fault::InvalidOperand,
        Fault::EepromFailure,
        Fault::NotInitialized,
        Fault::PlungerOverload,
        Fault::ValveOverload,
        Fault::PlungerStuck,
    ];

    /// Case is ignored: busy and idle variants of a fault share a letter.
    pub fn from_letter(letter: char) -> Self {
        match letter.to_ascii_lowercase() {
            'a' => Self::InitializationFailure,
            'b' => Self::InvalidCommand,
            'c' => Self::InvalidOperand,
            'f' => Self::EepromFailure,
            'g' => Self::NotInitialized,
            'i' => Self::PlungerOverload,
            'j' => Self::ValveOverload,
            'k' => Self::PlungerStuck,
            other => Self::Unknown(other),
        }
    }

    /// Lowercase fault letter.
    pub fn letter(self) -> char {
        match self {
            Self::InitializationFailure => 'a',
            Self::InvalidCommand => 'b',
            Self::InvalidOperand => 'c',
            Self::EepromFailure => 'f',
            Self::NotInitialized => 'g',
            Self::PlungerOverload => 'i',
            Self::ValveOverload => 'j',
            Self::PlungerStuck => 'k',
            Self::Unknown(c) => c,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailure => write!(f, "initialization failure"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::InvalidOperand => write!(f, "invalid operand"),
            Self::EepromFailure => write!(f, "EEPROM failure"),
            Self::NotInitialized => write!(f, "pump not initialized"),
            Self::PlungerOverload => write!(f, "plunger overload"),
            Self::ValveOverload => write!(f, "valve overload"),
            Self::PlungerStuck => write!(f, "plunger stuck"),
            Self::Unknown(c) => write!(f, "unknown fault {c:?}"),
        }
    }
}

/// Decoded status byte.
///
/// The idle flag is bit 5: idle faults arrive as lowercase letters and busy
/// faults as the uppercase form of the same letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    IdleErrorFree,
    BusyErrorFree,
    IdleWithError(Fault),
    BusyWithError(Fault),
}

impl StatusCode {
    pub fn fault(self) -> Option<Fault> {
        match self {
            Self::IdleWithError(fault) | Self::BusyWithError(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_idle(self) -> bool {
        matches!(self, Self::IdleErrorFree | Self::IdleWithError(_))
    }
}

impl TryFrom<char> for StatusCode {
    type Error = DecodeError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            STATUS_IDLE_ERROR_FREE => Ok(Self::IdleErrorFree),
            STATUS_BUSY_ERROR_FREE => Ok(Self::BusyErrorFree),
            c if c.is_ascii_lowercase() => Ok(Self::IdleWithError(Fault::from_letter(c))),
            c if c.is_ascii_uppercase() => Ok(Self::BusyWithError(Fault::from_letter(c))),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// Where the valve connects the syringe to.
///
/// Configuration files name positions with `I`, `O`, `B`, `E` or a six-way
/// port number. The pump reports them lowercase (`i`, `o`, `b`, `e`) or as a
/// digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValvePosition {
    #[default]
    Input,
    Output,
    Bypass,
    Extra,
    /// Port `1..=6` of a six-way distribution valve.
    SixWay(u8),
}

impl ValvePosition {
    /// Decode the payload of a valve position report.
    pub fn from_raw(raw: char) -> Result<Self, DecodeError> {
        match raw {
            'i' => Ok(Self::Input),
            'o' => Ok(Self::Output),
            'b' => Ok(Self::Bypass),
            'e' => Ok(Self::Extra),
            '1'..='6' => Ok(Self::SixWay(raw as u8 - b'0')),
            other => Err(DecodeError::UnknownValvePosition(other.to_string())),
        }
    }

    /// Character the pump uses for this position in reports.
    pub fn raw(self) -> char {
        match self {
            Self::Input => 'i',
            Self::Output => 'o',
            Self::Bypass => 'b',
            Self::Extra => 'e',
            Self::SixWay(port) => char::from_digit(u32::from(port), 10).unwrap_or('?'),
        }
    }

    /// Rejects six-way ports outside `1..=6`.
    pub fn validate(self) -> Result<Self, InvalidInput> {
        match self {
            Self::SixWay(port) if !(1..=6).contains(&port) => {
                Err(InvalidInput::UnknownValvePosition(port.to_string()))
            }
            valid => Ok(valid),
        }
    }
}

impl fmt::Display for ValvePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "I"),
            Self::Output => write!(f, "O"),
            Self::Bypass => write!(f, "B"),
            Self::Extra => write!(f, "E"),
            Self::SixWay(port) => write!(f, "{port}"),
        }
    }
}

impl FromStr for ValvePosition {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "I" => Ok(Self::Input),
            "O" => Ok(Self::Output),
            "B" => Ok(Self::Bypass),
            "E" => Ok(Self::Extra),
            "1" | "2" | "3" | "4" | "5" | "6" => Ok(Self::SixWay(s.as_bytes()[0] - b'0')),
            other => Err(InvalidInput::UnknownValvePosition(other.to_owned())),
        }
    }
}

impl TryFrom<String> for ValvePosition {
    type Error = InvalidInput;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ValvePosition> for String {
    fn from(value: ValvePosition) -> Self {
        value.to_string()
    }
}

/// Firmware resolution setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MicrostepMode {
    /// Full step: 3000 steps per stroke.
    Mode0 = 0,
    /// Fine positioning: 24000 steps per stroke.
    #[default]
    Mode2 = 2,
}

impl MicrostepMode {
    /// Steps in one full stroke.
    pub const fn total_steps(self) -> u32 {
        match self {
            Self::Mode0 => 3000,
            Self::Mode2 => 24000,
        }
    }

    /// Highest top velocity the firmware accepts in this mode.
    pub const fn max_top_velocity(self) -> u32 {
        match self {
            Self::Mode0 => 6000,
            Self::Mode2 => 48000,
        }
    }
}

impl TryFrom<u8> for MicrostepMode {
    type Error = InvalidInput;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Mode0),
            2 => Ok(Self::Mode2),
            other => Err(InvalidInput::UnsupportedMicrostepMode(other)),
        }
    }
}

impl From<MicrostepMode> for u8 {
    fn from(value: MicrostepMode) -> Self {
        value as u8
    }
}

/// Valve wiring inferred from the EEPROM valve configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveTopology {
    /// 3-way T or Y valve. The two differ only by a jumper.
    ThreeWay,
    FourWayDistribution,
    /// __Note:__ in this configuration it is not possible to pump to `E`.
    FourWayNonDistribution,
    Unknown,
}

impl ValveTopology {
    /// Index of the valve configuration field in the `?27` report.
    pub const EEPROM_FIELD: usize = 10;

    /// Classify a full `?27` payload.
    pub fn from_eeprom(config: &str) -> Self {
        match config.split(',').nth(Self::EEPROM_FIELD) {
            Some("2013100") => Self::ThreeWay,
            Some("2033110") => Self::FourWayDistribution,
            Some("2130001") => Self::FourWayNonDistribution,
            _ => Self::Unknown,
        }
    }
}

/// EEPROM valve configuration operands for the `U` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EepromValveConfig {
    /// Also needs the jumper moved to pin 5 below the address switch.
    ThreeWayY = 1,
    FourWayNonDistribution = 2,
    FourWayDistribution = 4,
    ThreeWayT = 5,
}

/// Sampled controller state.
///
/// Faults are not latched: a later error-free status query moves the pump
/// out of [`PumpState::Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Uninitialized,
    Initializing,
    Idle,
    Busy,
    Fault(Fault),
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn known_fault_letters_decode_in_both_cases() {
        for fault in Fault::KNOWN {
            let letter = fault.letter();
            assert_eq!(
                StatusCode::try_from(letter).unwrap(),
                StatusCode::IdleWithError(fault)
            );
            assert_eq!(
                StatusCode::try_from(letter.to_ascii_uppercase()).unwrap(),
                StatusCode::BusyWithError(fault)
            );
        }
    }

    #[test]
    fn other_letters_are_unknown_faults() {
        for letter in "delmnopqrstuvwxyz".chars() {
            assert_eq!(
                StatusCode::try_from(letter).unwrap().fault(),
                Some(Fault::Unknown(letter))
            );
        }
        assert_eq!(
            StatusCode::try_from('H').unwrap(),
            StatusCode::BusyWithError(Fault::Unknown('h'))
        );
    }

    #[test]
    fn error_free_statuses() {
        assert_eq!(StatusCode::try_from('`').unwrap(), StatusCode::IdleErrorFree);
        assert_eq!(StatusCode::try_from('@').unwrap(), StatusCode::BusyErrorFree);
        assert!(StatusCode::IdleErrorFree.is_idle());
        assert!(!StatusCode::BusyErrorFree.is_idle());
        assert_eq!(
            StatusCode::try_from('#'),
            Err(DecodeError::UnknownStatus('#'))
        );
    }

    #[test]
    fn fault_display_names_the_meaning() {
        assert_eq!(Fault::PlungerOverload.to_string(), "plunger overload");
        assert_eq!(Fault::Unknown('z').to_string(), "unknown fault 'z'");
    }

    #[test]
    fn valve_raw_encoding_is_bidirectional() {
        let positions = [
            ValvePosition::Input,
            ValvePosition::Output,
            ValvePosition::Bypass,
            ValvePosition::Extra,
            ValvePosition::SixWay(1),
            ValvePosition::SixWay(6),
        ];
        for position in positions {
            assert_eq!(ValvePosition::from_raw(position.raw()).unwrap(), position);
        }
        assert!(ValvePosition::from_raw('x').is_err());
        assert!(ValvePosition::from_raw('7').is_err());
    }

    #[test]
    fn valve_tokens_parse() {
        assert_eq!("O".parse::<ValvePosition>().unwrap(), ValvePosition::Output);
        assert_eq!("4".parse::<ValvePosition>().unwrap(), ValvePosition::SixWay(4));
        assert_eq!(
            "X".parse::<ValvePosition>(),
            Err(InvalidInput::UnknownValvePosition("X".into()))
        );
        assert!(ValvePosition::SixWay(0).validate().is_err());
        assert!(ValvePosition::SixWay(7).validate().is_err());
    }

    #[test]
    fn microstep_modes() {
        for mode in MicrostepMode::iter() {
            assert_eq!(MicrostepMode::try_from(u8::from(mode)).unwrap(), mode);
            assert_eq!(mode.max_top_velocity(), mode.total_steps() * 2);
        }
        assert_eq!(
            MicrostepMode::try_from(1),
            Err(InvalidInput::UnsupportedMicrostepMode(1))
        );
    }

    #[test]
    fn valve_topology_from_eeprom() {
        let report = |field: &str| format!("10,75,14,62,1,1,20,10,48,210,{field},0,0,0,0,0,25,20,15,0000000");
        assert_eq!(ValveTopology::from_eeprom(&report("2013100")), ValveTopology::ThreeWay);
        assert_eq!(
            ValveTopology::from_eeprom(&report("2033110")),
            ValveTopology::FourWayDistribution
        );
        assert_eq!(
            ValveTopology::from_eeprom(&report("2130001")),
            ValveTopology::FourWayNonDistribution
        );
        assert_eq!(ValveTopology::from_eeprom(&report("2013010")), ValveTopology::Unknown);
        assert_eq!(ValveTopology::from_eeprom("10,75"), ValveTopology::Unknown);
    }
}

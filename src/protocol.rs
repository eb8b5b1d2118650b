//! Wire codec for the C3000 "DT" ASCII protocol.
//!
//! Requests look like `/<addr><cmd><operand>...R\r` and replies like
//! `/<addr><status><data>\x03\r`. Everything in here is pure: no I/O and no
//! pump state.

use core::fmt;

use strum_macros::{EnumCount, EnumIter};
use thiserror::Error;

use crate::error::InvalidInput;
use crate::types::ValvePosition;

/// First character of every request and reply.
pub const START: char = '/';
/// Last character of every request and reply.
pub const TERMINATOR: char = '\r';
/// End-of-text marker the pump sends before the reply terminator.
pub const ETX: char = '\x03';

/// Execute the commands buffered before it.
pub const CMD_EXECUTE: char = 'R';
/// Initialize the plunger, valve homed to the right.
pub const CMD_INITIALIZE_VALVE_RIGHT: char = 'Z';
/// Initialize the plunger, valve homed to the left.
pub const CMD_INITIALIZE_VALVE_LEFT: char = 'Y';
/// Initialize the plunger without touching the valve.
pub const CMD_INITIALIZE_NO_VALVE: char = 'W';
/// Initialize the valve only.
pub const CMD_INITIALIZE_VALVE_ONLY: char = 'w';
pub const CMD_MICROSTEP_MODE: char = 'N';
/// Absolute plunger move.
pub const CMD_MOVE_TO: char = 'A';
/// Relative aspirate.
pub const CMD_PUMP: char = 'P';
/// Relative dispense.
pub const CMD_DELIVER: char = 'D';
pub const CMD_TOP_VELOCITY: char = 'V';
/// __Note:__ only applied after a power cycle.
pub const CMD_EEPROM_CONFIG: char = 'U';
/// Valve to input. With an operand (`I3`) it addresses a six-way port.
pub const CMD_VALVE_INPUT: char = 'I';
pub const CMD_VALVE_OUTPUT: char = 'O';
pub const CMD_VALVE_BYPASS: char = 'B';
pub const CMD_VALVE_EXTRA: char = 'E';
/// Abort the current move.
pub const CMD_TERMINATE: char = 'T';
pub const CMD_REPORT_STATUS: char = 'Q';
/// Report command. Without an operand it reports the plunger position.
pub const CMD_REPORT: char = '?';

/// Operands of the [`CMD_REPORT`] family.
pub const REPORT_START_VELOCITY: u8 = 1;
pub const REPORT_PEAK_VELOCITY: u8 = 2;
pub const REPORT_CUTOFF_VELOCITY: u8 = 3;
pub const REPORT_VALVE_POSITION: u8 = 6;
pub const REPORT_INITIALIZED: u8 = 19;
pub const REPORT_EEPROM: u8 = 27;

/// Errors raised while turning raw bytes into protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Reply too short")]
    Truncated,
    #[error("Reply is not valid ASCII")]
    Undecodable,
    #[error("Unknown status character {0:?}")]
    UnknownStatus(char),
    #[error("Unknown address character {0:?}")]
    UnknownAddress(char),
    #[error("Unknown valve position {0:?}")]
    UnknownValvePosition(String),
    #[error("Unexpected reply payload {0:?}")]
    InvalidPayload(String),
    #[error("Malformed request frame")]
    MalformedRequest,
}

/// Position of the address rotary switch at the back of the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCount)]
pub enum DialPosition {
    D0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    D8,
    D9,
    A,
    B,
    C,
    D,
    E,
}

impl DialPosition {
    /// The wire address a pump with its dial on this position answers to.
    pub const fn address(self) -> Address {
        let c = match self {
            Self::D0 => '1',
            Self::D1 => '2',
            Self::D2 => '3',
            Self::D3 => '4',
            Self::D4 => '5',
            Self::D5 => '6',
            Self::D6 => '7',
            Self::D7 => '8',
            Self::D8 => '9',
            Self::D9 => ':',
            Self::A => ';',
            Self::B => '<',
            Self::C => '=',
            Self::D => '>',
            Self::E => '?',
        };
        Address(c)
    }

    /// Label printed next to the switch.
    pub const fn label(self) -> char {
        match self {
            Self::D0 => '0',
            Self::D1 => '1',
            Self::D2 => '2',
            Self::D3 => '3',
            Self::D4 => '4',
            Self::D5 => '5',
            Self::D6 => '6',
            Self::D7 => '7',
            Self::D8 => '8',
            Self::D9 => '9',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
            Self::E => 'E',
        }
    }
}

/// A wire address. Only the 15 characters reachable from a [`DialPosition`] are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(char);

impl Address {
    pub const fn as_char(self) -> char {
        self.0
    }
}

impl TryFrom<char> for Address {
    type Error = DecodeError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            '1'..='9' | ':' | ';' | '<' | '=' | '>' | '?' => Ok(Address(value)),
            other => Err(DecodeError::UnknownAddress(other)),
        }
    }
}

impl From<DialPosition> for Address {
    fn from(value: DialPosition) -> Self {
        value.address()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One command code plus its optional operand.
///
/// Operands are decimal integers or comma separated lists of them (`0,0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    code: char,
    operand: Option<String>,
}

impl Command {
    pub fn new(code: char) -> Self {
        Self {
            code,
            operand: None,
        }
    }

    pub fn with_operand(code: char, operand: impl fmt::Display) -> Self {
        Self {
            code,
            operand: Some(operand.to_string()),
        }
    }

    pub fn code(&self) -> char {
        self.code
    }

    pub fn operand(&self) -> Option<&str> {
        self.operand.as_deref()
    }

    /// Operand parsed as an integer, if it is one.
    pub fn numeric_operand(&self) -> Option<u32> {
        self.operand.as_deref().and_then(|o| o.parse().ok())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.code, self.operand.as_deref().unwrap_or(""))
    }
}

/// An addressed sequence of commands, ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPacket {
    address: Address,
    commands: Vec<Command>,
    /// Append [`CMD_EXECUTE`]. Cleared only for EEPROM configuration.
    execute: bool,
}

impl InstructionPacket {
    pub fn new(address: Address, commands: Vec<Command>, execute: bool) -> Self {
        Self {
            address,
            commands,
            execute,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn execute(&self) -> bool {
        self.execute
    }

    /// Frame the packet for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = String::with_capacity(4 + self.commands.len() * 4);
        frame.push(START);
        frame.push(self.address.as_char());
        for command in &self.commands {
            frame.push_str(&command.to_string());
        }
        if self.execute {
            frame.push(CMD_EXECUTE);
        }
        frame.push(TERMINATOR);
        frame.into_bytes()
    }

    /// Parse a request frame produced by [`Self::encode`].
    ///
    /// A trailing bare `R` is read back as the execute flag.
    pub fn parse(raw: &[u8]) -> Result<Self, DecodeError> {
        let text = core::str::from_utf8(raw).map_err(|_| DecodeError::Undecodable)?;
        let body = text
            .trim_end_matches(TERMINATOR)
            .strip_prefix(START)
            .ok_or(DecodeError::MalformedRequest)?;

        let mut chars = body.chars().peekable();
        let address = Address::try_from(chars.next().ok_or(DecodeError::Truncated)?)?;

        let mut commands = Vec::new();
        while let Some(code) = chars.next() {
            if code.is_ascii_digit() || code == ',' {
                return Err(DecodeError::MalformedRequest);
            }
            let mut operand = String::new();
            while let Some(&c) = chars.peek() {
                if !(c.is_ascii_digit() || c == ',') {
                    break;
                }
                operand.push(c);
                chars.next();
            }
            commands.push(Command {
                code,
                operand: (!operand.is_empty()).then_some(operand),
            });
        }

        let execute = commands
            .last()
            .is_some_and(|c| c.code == CMD_EXECUTE && c.operand.is_none());
        if execute {
            commands.pop();
        }

        Ok(Self {
            address,
            commands,
            execute,
        })
    }
}

/// A decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub address: char,
    pub status: char,
    pub data: String,
}

/// Decode a raw reply.
///
/// The terminator, any trailing control characters and the start marker are
/// stripped; the first remaining character is the address and the second the
/// status. Everything after that is the data payload.
pub fn decode(raw: &[u8]) -> Result<StatusReply, DecodeError> {
    let text = core::str::from_utf8(raw).map_err(|_| DecodeError::Undecodable)?;
    if !text.is_ascii() {
        return Err(DecodeError::Undecodable);
    }
    let info = text
        .trim_end()
        .trim_end_matches(|c: char| c.is_ascii_control())
        .trim_start_matches(START);

    let mut chars = info.chars();
    match (chars.next(), chars.next()) {
        (Some(address), Some(status)) => {
            let reply = StatusReply {
                address,
                status,
                data: chars.as_str().to_owned(),
            };
            log::trace!("Decoded {:?} into {:?}", text, reply);
            Ok(reply)
        }
        _ => Err(DecodeError::Truncated),
    }
}

/// Packet factory bound to one pump address.
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    address: Address,
}

impl Protocol {
    pub const fn new(address: Address) -> Self {
        Self { address }
    }

    pub const fn address(&self) -> Address {
        self.address
    }

    /// Build an executing packet from `commands`.
    pub fn forge_packet(&self, commands: impl IntoIterator<Item = Command>) -> InstructionPacket {
        let packet = InstructionPacket::new(self.address, commands.into_iter().collect(), true);
        log::trace!("Forged {:?}", packet);
        packet
    }

    fn single(&self, command: Command) -> InstructionPacket {
        self.forge_packet([command])
    }

    pub fn initialize_valve_right(&self, operand: u32) -> InstructionPacket {
        self.single(Command::with_operand(CMD_INITIALIZE_VALVE_RIGHT, operand))
    }

    pub fn initialize_valve_left(&self, operand: u32) -> InstructionPacket {
        self.single(Command::with_operand(CMD_INITIALIZE_VALVE_LEFT, operand))
    }

    pub fn initialize_no_valve(&self, operand: u32) -> InstructionPacket {
        self.single(Command::with_operand(CMD_INITIALIZE_NO_VALVE, operand))
    }

    pub fn initialize_valve_only(&self, operand: Option<&str>) -> InstructionPacket {
        match operand {
            Some(operand) => self.single(Command::with_operand(CMD_INITIALIZE_VALVE_ONLY, operand)),
            None => self.single(Command::new(CMD_INITIALIZE_VALVE_ONLY)),
        }
    }

    /// The firmware accepts microstep operands `0..=2`.
    pub fn microstep_mode(&self, operand: u8) -> Result<InstructionPacket, InvalidInput> {
        if operand > 2 {
            return Err(InvalidInput::MicrostepOperand(operand));
        }
        Ok(self.single(Command::with_operand(CMD_MICROSTEP_MODE, operand)))
    }

    pub fn move_to(&self, steps: u32) -> InstructionPacket {
        self.single(Command::with_operand(CMD_MOVE_TO, steps))
    }

    pub fn pump(&self, steps: u32) -> InstructionPacket {
        self.single(Command::with_operand(CMD_PUMP, steps))
    }

    pub fn deliver(&self, steps: u32) -> InstructionPacket {
        self.single(Command::with_operand(CMD_DELIVER, steps))
    }

    pub fn top_velocity(&self, velocity: u32) -> InstructionPacket {
        self.single(Command::with_operand(CMD_TOP_VELOCITY, velocity))
    }

    /// EEPROM writes must not be followed by an execute.
    pub fn eeprom_config(&self, operand: u8) -> InstructionPacket {
        InstructionPacket::new(
            self.address,
            vec![Command::with_operand(CMD_EEPROM_CONFIG, operand)],
            false,
        )
    }

    pub fn valve(&self, position: ValvePosition) -> InstructionPacket {
        let command = match position {
            ValvePosition::Input => Command::new(CMD_VALVE_INPUT),
            ValvePosition::Output => Command::new(CMD_VALVE_OUTPUT),
            ValvePosition::Bypass => Command::new(CMD_VALVE_BYPASS),
            ValvePosition::Extra => Command::new(CMD_VALVE_EXTRA),
            ValvePosition::SixWay(port) => Command::with_operand(CMD_VALVE_INPUT, port),
        };
        self.single(command)
    }

    pub fn terminate(&self) -> InstructionPacket {
        self.single(Command::new(CMD_TERMINATE))
    }

    pub fn report_status(&self) -> InstructionPacket {
        self.single(Command::new(CMD_REPORT_STATUS))
    }

    pub fn report_plunger_position(&self) -> InstructionPacket {
        self.single(Command::new(CMD_REPORT))
    }

    fn report(&self, which: u8) -> InstructionPacket {
        self.single(Command::with_operand(CMD_REPORT, which))
    }

    pub fn report_start_velocity(&self) -> InstructionPacket {
        self.report(REPORT_START_VELOCITY)
    }

    pub fn report_peak_velocity(&self) -> InstructionPacket {
        self.report(REPORT_PEAK_VELOCITY)
    }

    pub fn report_cutoff_velocity(&self) -> InstructionPacket {
        self.report(REPORT_CUTOFF_VELOCITY)
    }

    pub fn report_valve_position(&self) -> InstructionPacket {
        self.report(REPORT_VALVE_POSITION)
    }

    pub fn report_initialized(&self) -> InstructionPacket {
        self.report(REPORT_INITIALIZED)
    }

    pub fn report_eeprom(&self) -> InstructionPacket {
        self.report(REPORT_EEPROM)
    }
}

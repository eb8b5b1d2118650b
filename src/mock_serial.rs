//! We use this mocking module in unit tests to emulate a pump on a serial port.
//!
//! [`MockSerial`] parses every request frame written to it, answers only when
//! the frame is addressed to its dial position, and keeps enough plunger and
//! valve state to behave like a C3000 during a test.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::protocol::{self, Address, DialPosition, InstructionPacket};

/// Frames addressed to any of the mocks sharing it, in arrival order.
pub type EventLog = Rc<RefCell<Vec<String>>>;

/// Replies always carry the master address.
const REPLY_ADDRESS: char = '0';

/// Our mock type used to emulate a pump behind a serial port.
pub struct MockSerial {
    address: Address,
    /// Request bytes not yet terminated.
    pending: Vec<u8>,
    /// Reply bytes waiting to be read.
    read_buffer: heapless::Vec<u8, 256>,
    read_position: usize,
    /// Every frame written, whether addressed to us or not.
    received: Vec<InstructionPacket>,
    should_error_on_write: bool,

    initialized: bool,
    plunger: u32,
    valve: char,
    stuck_valve: bool,
    stuck_plunger: bool,
    event_log: Option<EventLog>,
    top_velocity: u32,
    micro_step_mode: u32,
    eeprom: String,
    fault: Option<char>,
    /// Status queries answered busy after each move.
    busy_polls: u32,
    busy_remaining: u32,
}

#[derive(Error, Debug)]
pub enum MockSerialError {
    /// Nothing left to read.
    #[error("Read timed out")]
    Timeout,
    /// Simulated buffer overflow
    #[error("Reply buffer overflow")]
    BufferOverflow,
    /// Generic simulated error for testing
    #[error("Simulated serial error")]
    SimulatedError,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::BufferOverflow => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }

        self.pending.extend_from_slice(buf);
        while let Some(end) = self.pending.iter().position(|&b| b == b'\r') {
            let frame: Vec<u8> = self.pending.drain(..=end).collect();
            self.handle_frame(&frame)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.read_position >= self.read_buffer.len() {
            return Err(MockSerialError::Timeout);
        }

        let available_bytes = self.read_buffer.len() - self.read_position;
        let bytes_to_read = core::cmp::min(buf.len(), available_bytes);

        buf[..bytes_to_read]
            .copy_from_slice(&self.read_buffer[self.read_position..self.read_position + bytes_to_read]);

        self.read_position += bytes_to_read;
        Ok(bytes_to_read)
    }
}

impl MockSerial {
    /// A pump with its dial on `dial`, uninitialized, plunger at 0, valve on input.
    pub fn new(dial: DialPosition) -> Self {
        Self {
            address: dial.address(),
            pending: Vec::new(),
            read_buffer: heapless::Vec::new(),
            read_position: 0,
            received: Vec::new(),
            should_error_on_write: false,
            initialized: false,
            plunger: 0,
            valve: 'i',
            stuck_valve: false,
            stuck_plunger: false,
            event_log: None,
            top_velocity: 1400,
            micro_step_mode: 0,
            eeprom: "10,75,14,62,1,1,20,10,48,210,2013100,0,0,0,0,0,25,20,15,0000000".into(),
            fault: None,
            busy_polls: 0,
            busy_remaining: 0,
        }
    }

    pub fn initialized(mut self) -> Self {
        self.initialized = true;
        self
    }

    pub fn with_plunger(mut self, steps: u32) -> Self {
        self.plunger = steps;
        self
    }

    pub fn with_valve(mut self, raw: char) -> Self {
        self.valve = raw;
        self
    }

    pub fn with_top_velocity(mut self, velocity: u32) -> Self {
        self.top_velocity = velocity;
        self
    }

    /// Valve move commands are acknowledged but never move the valve.
    pub fn with_stuck_valve(mut self) -> Self {
        self.stuck_valve = true;
        self
    }

    /// Plunger moves are acknowledged but the plunger stays put.
    pub fn with_stuck_plunger(mut self) -> Self {
        self.stuck_plunger = true;
        self
    }

    /// Append every frame addressed to this pump to `log`.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    pub fn with_eeprom(mut self, eeprom: &str) -> Self {
        self.eeprom = eeprom.into();
        self
    }

    pub fn set_fault(&mut self, fault: Option<char>) {
        self.fault = fault;
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    pub fn received(&self) -> &[InstructionPacket] {
        &self.received
    }

    pub fn clear_received(&mut self) {
        self.received.clear();
    }

    /// Number of commands received with `code`, across every frame.
    pub fn count(&self, code: char) -> usize {
        self.received
            .iter()
            .flat_map(|p| p.commands())
            .filter(|c| c.code() == code)
            .count()
    }

    /// Operands of every command received with `code`, in order.
    pub fn operands(&self, code: char) -> Vec<u32> {
        self.received
            .iter()
            .flat_map(|p| p.commands())
            .filter(|c| c.code() == code)
            .filter_map(|c| c.numeric_operand())
            .collect()
    }

    pub fn plunger(&self) -> u32 {
        self.plunger
    }

    pub fn valve(&self) -> char {
        self.valve
    }

    pub fn top_velocity(&self) -> u32 {
        self.top_velocity
    }

    pub fn micro_step_mode(&self) -> u32 {
        self.micro_step_mode
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Result<(), MockSerialError> {
        let Ok(packet) = InstructionPacket::parse(frame) else {
            return Ok(());
        };
        let addressed = packet.address() == self.address;
        self.received.push(packet.clone());
        if !addressed {
            return Ok(());
        }
        if let Some(log) = &self.event_log {
            log.borrow_mut()
                .push(String::from_utf8_lossy(frame).trim_end().to_owned());
        }

        let mut data = String::new();
        let mut status_query = false;
        for command in packet.commands() {
            let operand = command.numeric_operand();
            match command.code() {
                protocol::CMD_REPORT_STATUS => status_query = true,
                protocol::CMD_REPORT => {
                    data = match command.operand() {
                        None => self.plunger.to_string(),
                        Some("1") | Some("3") => "900".into(),
                        Some("2") => self.top_velocity.to_string(),
                        Some("6") => self.valve.to_string(),
                        Some("19") => u8::from(self.initialized).to_string(),
                        Some("27") => self.eeprom.clone(),
                        Some(_) => String::new(),
                    }
                }
                protocol::CMD_INITIALIZE_VALVE_ONLY => self.start_move(),
                protocol::CMD_INITIALIZE_NO_VALVE
                | protocol::CMD_INITIALIZE_VALVE_LEFT
                | protocol::CMD_INITIALIZE_VALVE_RIGHT => {
                    self.initialized = true;
                    self.plunger = 0;
                    self.start_move();
                }
                protocol::CMD_VALVE_INPUT => self.move_valve(match command.operand() {
                    Some(port) => port.chars().next().unwrap_or('i'),
                    None => 'i',
                }),
                protocol::CMD_VALVE_OUTPUT => self.move_valve('o'),
                protocol::CMD_VALVE_BYPASS => self.move_valve('b'),
                protocol::CMD_VALVE_EXTRA => self.move_valve('e'),
                protocol::CMD_PUMP => self.move_plunger(self.plunger + operand.unwrap_or(0)),
                protocol::CMD_DELIVER => {
                    self.move_plunger(self.plunger.saturating_sub(operand.unwrap_or(0)))
                }
                protocol::CMD_MOVE_TO => self.move_plunger(operand.unwrap_or(0)),
                protocol::CMD_TOP_VELOCITY => self.top_velocity = operand.unwrap_or(0),
                protocol::CMD_MICROSTEP_MODE => self.micro_step_mode = operand.unwrap_or(0),
                protocol::CMD_TERMINATE => self.busy_remaining = 0,
                _ => {}
            }
        }

        let busy = self.busy_remaining > 0;
        if status_query && busy {
            self.busy_remaining -= 1;
        }
        let status = match (self.fault, busy) {
            (Some(letter), false) => letter.to_ascii_lowercase(),
            (Some(letter), true) => letter.to_ascii_uppercase(),
            (None, false) => '`',
            (None, true) => '@',
        };

        let reply = format!("/{REPLY_ADDRESS}{status}{data}\x03\r");
        if self.read_position >= self.read_buffer.len() {
            self.read_buffer.clear();
            self.read_position = 0;
        }
        self.read_buffer
            .extend_from_slice(reply.as_bytes())
            .map_err(|_| MockSerialError::BufferOverflow)
    }

    fn start_move(&mut self) {
        self.busy_remaining = self.busy_polls;
    }

    fn move_plunger(&mut self, steps: u32) {
        if !self.stuck_plunger {
            self.plunger = steps;
        }
        self.start_move();
    }

    fn move_valve(&mut self, raw: char) {
        if !self.stuck_valve {
            self.valve = raw;
        }
        self.start_move();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    fn read_reply(mock: &mut MockSerial) -> String {
        let mut buffer = [0u8; 128];
        let n = mock.read(&mut buffer).unwrap();
        String::from_utf8(buffer[..n].to_vec()).unwrap()
    }

    #[test]
    fn answers_only_its_own_address() {
        let mut mock = MockSerial::new(DialPosition::D1);
        mock.write_all(b"/1QR\r").unwrap();
        assert!(matches!(mock.read(&mut [0u8; 8]), Err(MockSerialError::Timeout)));

        mock.write_all(b"/2QR\r").unwrap();
        assert_eq!(read_reply(&mut mock), "/0`\x03\r");
        assert_eq!(mock.received().len(), 2);
    }

    #[test]
    fn frames_may_arrive_in_pieces() {
        let mut mock = MockSerial::new(DialPosition::D0).with_plunger(1234);
        mock.write_all(b"/1").unwrap();
        mock.write_all(b"?R\r").unwrap();
        assert_eq!(read_reply(&mut mock), "/0`1234\x03\r");
    }

    #[test]
    fn tracks_plunger_moves() {
        let mut mock = MockSerial::new(DialPosition::D0);
        mock.write_all(b"/1P3000R\r/1D1000R\r").unwrap();
        assert_eq!(mock.plunger(), 2000);
        mock.write_all(b"/1A0R\r").unwrap();
        assert_eq!(mock.plunger(), 0);
        assert_eq!(mock.operands('P'), [3000]);
    }

    #[test]
    fn reports_busy_for_configured_polls() {
        let mut mock = MockSerial::new(DialPosition::D0).with_busy_polls(2);
        mock.write_all(b"/1OR\r").unwrap();
        read_reply(&mut mock);
        for expected in ["/0@\x03\r", "/0@\x03\r", "/0`\x03\r"] {
            mock.write_all(b"/1QR\r").unwrap();
            assert_eq!(read_reply(&mut mock), expected);
        }
    }

    #[test]
    fn faults_follow_the_busy_flag() {
        let mut mock = MockSerial::new(DialPosition::D0).with_busy_polls(1);
        mock.set_fault(Some('i'));
        mock.write_all(b"/1P10R\r").unwrap();
        assert_eq!(read_reply(&mut mock), "/0I\x03\r");
        mock.write_all(b"/1QR\r").unwrap();
        assert_eq!(read_reply(&mut mock), "/0I\x03\r");
        mock.write_all(b"/1QR\r").unwrap();
        assert_eq!(read_reply(&mut mock), "/0i\x03\r");
    }

    #[test]
    fn stuck_valve_never_moves() {
        let mut mock = MockSerial::new(DialPosition::D0).with_stuck_valve();
        mock.write_all(b"/1OR\r").unwrap();
        assert_eq!(mock.valve(), 'i');
    }

    #[test]
    fn stuck_plunger_acknowledges_moves() {
        let mut mock = MockSerial::new(DialPosition::D0).with_stuck_plunger();
        mock.write_all(b"/1P3000R\r").unwrap();
        assert_eq!(read_reply(&mut mock), "/0`\x03\r");
        assert_eq!(mock.plunger(), 0);
    }

    #[test]
    fn shared_log_keeps_arrival_order() {
        let log = EventLog::default();
        let mut first = MockSerial::new(DialPosition::D0).with_event_log(log.clone());
        let mut second = MockSerial::new(DialPosition::D1).with_event_log(log.clone());
        first.write_all(b"/1QR\r").unwrap();
        second.write_all(b"/2QR\r/1QR\r").unwrap();
        first.write_all(b"/1OR\r").unwrap();
        assert_eq!(*log.borrow(), ["/1QR", "/2QR", "/1OR"]);
    }

    #[test]
    fn write_error_simulation() {
        let mut mock = MockSerial::new(DialPosition::D0);
        mock.set_write_error(true);
        let result = mock.write(b"/1QR\r");
        assert!(matches!(result, Err(MockSerialError::SimulatedError)));
        assert!(mock.received().is_empty());
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(MockSerialError::Timeout.kind(), embedded_io::ErrorKind::TimedOut));
        assert!(matches!(MockSerialError::BufferOverflow.kind(), embedded_io::ErrorKind::OutOfMemory));
        assert!(matches!(MockSerialError::SimulatedError.kind(), embedded_io::ErrorKind::Other));
    }
}

use fugit::MillisDurationU32;
use strum::IntoEnumIterator;

use crate::{
    config::PumpSettings,
    error::{Error, Result},
    protocol::{self, Address, DecodeError, DialPosition, InstructionPacket, Protocol, StatusReply},
    syringe::PumpConfig,
    types::{EepromValveConfig, Fault, PumpState, StatusCode, ValvePosition, ValveTopology},
};
use embedded_io::Error as _;

/// Attempts [`PumpController::set_valve_position`] makes before giving up.
pub const MAX_REPEAT_OPERATION: u32 = 10;
/// Top velocity used when the configured one is out of range.
pub const FALLBACK_TOP_VELOCITY: u32 = 1000;
/// Pause between status queries while waiting for a pump.
pub const DEFAULT_POLL_INTERVAL: MillisDurationU32 = MillisDurationU32::millis(100);
/// Operand of the valve-only initialization.
pub const DEFAULT_VALVE_INIT_OPERAND: &str = "0,0";

/// You can create a PumpController using any interface which implements [embedded_io::Read] & [embedded_io::Write].
///
/// One controller drives exactly one pump; the pump must be alone on its
/// connection. Plunger and valve positions are always read back from the
/// pump rather than remembered, since they can change behind our back.
///
/// A read failing with [`embedded_io::ErrorKind::TimedOut`] marks the end of
/// a reply. `L` bounds the size of a reply in bytes.
pub struct PumpController<S: embedded_io::Read + embedded_io::Write, const L: usize = 128> {
    interface: S,
    name: String,
    protocol: Protocol,
    syringe: PumpConfig,
    default_top_velocity: u32,
    initialize_valve_position: ValvePosition,
    poll_interval: MillisDurationU32,
}

impl<S: embedded_io::Read + embedded_io::Write, const L: usize> PumpController<S, L> {
    /// Create a controller, discovering the pump address on `interface`.
    ///
    /// Fails with [`Error::DeviceNotFound`] if no dial position answers.
    pub fn new(name: impl Into<String>, mut interface: S, syringe: PumpConfig) -> Result<Self, S::Error> {
        let name = name.into();
        let address = Self::discover_address(&mut interface, &name)?;
        let pump = Self {
            interface,
            name,
            protocol: Protocol::new(address),
            syringe,
            default_top_velocity: FALLBACK_TOP_VELOCITY,
            initialize_valve_position: ValvePosition::Input,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        Ok(pump.with_default_top_velocity(crate::config::DEFAULT_TOP_VELOCITY))
    }

    /// Create a controller from merged setup settings.
    pub fn from_settings(name: impl Into<String>, interface: S, settings: &PumpSettings) -> Result<Self, S::Error> {
        let syringe = PumpConfig::new(settings.micro_step_mode, settings.volume)?;
        Ok(Self::new(name, interface, syringe)?
            .with_default_top_velocity(settings.top_velocity)
            .with_initialize_valve_position(settings.initialize_valve_position))
    }

    /// Set the default top velocity at construction.
    ///
    /// An out of range value falls back to [`FALLBACK_TOP_VELOCITY`].
    pub fn with_default_top_velocity(mut self, velocity: u32) -> Self {
        if !self.set_default_top_velocity(velocity) {
            log::warn!(
                "Pump {}: default top velocity {} is invalid, using {}",
                self.name,
                velocity,
                FALLBACK_TOP_VELOCITY
            );
            self.default_top_velocity = FALLBACK_TOP_VELOCITY;
        }
        self
    }

    pub fn with_initialize_valve_position(mut self, position: ValvePosition) -> Self {
        self.initialize_valve_position = position;
        self
    }

    pub fn with_poll_interval(mut self, interval: MillisDurationU32) -> Self {
        self.set_poll_interval(interval);
        self
    }

    pub fn set_poll_interval(&mut self, interval: MillisDurationU32) {
        self.poll_interval = interval;
    }

    /// Try each dial position in order and return the first that answers.
    ///
    /// A pump reporting a fault still counts as found.
    pub fn discover_address(interface: &mut S, name: &str) -> Result<Address, S::Error> {
        for dial in DialPosition::iter() {
            let packet = Protocol::new(dial.address()).report_status();
            let reply = match Self::transact(interface, &packet) {
                Ok(reply) => reply,
                Err(Error::Communication(_)) => continue,
                Err(e) => return Err(e),
            };
            match StatusCode::try_from(reply.status) {
                Ok(status) if status.fault().is_none() => {
                    log::debug!("Pump {}: found a pump with dial on position {}", name, dial.label());
                    return Ok(dial.address());
                }
                Ok(status) => {
                    log::warn!(
                        "Pump {}: found a pump with dial on position {} with an error status {:?}",
                        name,
                        dial.label(),
                        status
                    );
                    return Ok(dial.address());
                }
                Err(e) => log::debug!("Pump {}: ignoring reply on dial {}: {}", name, dial.label(), e),
            }
        }
        Err(Error::DeviceNotFound { pump: name.to_owned() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.protocol.address()
    }

    pub fn syringe(&self) -> &PumpConfig {
        &self.syringe
    }

    pub fn initialize_valve_position(&self) -> ValvePosition {
        self.initialize_valve_position
    }

    pub fn interface(&self) -> &S {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut S {
        &mut self.interface
    }

    /// Release the underlying interface.
    pub fn into_interface(self) -> S {
        self.interface
    }

    /// Volume in ml for a step count.
    pub fn step_to_volume(&self, step: u32) -> f64 {
        self.syringe.step_to_volume(step)
    }

    /// Step count for a volume in ml.
    pub fn volume_to_step(&self, volume_ml: f64) -> u32 {
        self.syringe.volume_to_step(volume_ml)
    }

    /// Flow rate in ml/min to a linear pump speed.
    pub fn flowrate_to_speed(&self, flowrate: f64) -> Result<f64, S::Error> {
        Ok(self.syringe.flowrate_to_speed(flowrate)?)
    }

    /// Linear pump speed to a flow rate in ml/min.
    pub fn speed_to_flowrate(&self, speed: f64) -> f64 {
        self.syringe.speed_to_flowrate(speed)
    }

    /// Query the status byte.
    pub fn status(&mut self) -> Result<StatusCode, S::Error> {
        let (status, _) = self.write_and_read(&self.protocol.report_status())?;
        Ok(status)
    }

    /// `true` when idle, `false` when busy. A reported fault is an error.
    pub fn is_idle(&mut self) -> Result<bool, S::Error> {
        match self.status()? {
            StatusCode::IdleErrorFree => Ok(true),
            StatusCode::BusyErrorFree => Ok(false),
            StatusCode::IdleWithError(fault) | StatusCode::BusyWithError(fault) => Err(self.fault(fault)),
        }
    }

    pub fn is_busy(&mut self) -> Result<bool, S::Error> {
        Ok(!self.is_idle()?)
    }

    pub fn is_initialized(&mut self) -> Result<bool, S::Error> {
        let (_, data) = self.write_and_read(&self.protocol.report_initialized())?;
        Ok(Self::parse_number::<i64>(&data)? != 0)
    }

    /// Sample the pump state.
    pub fn state(&mut self) -> Result<PumpState, S::Error> {
        let status = self.status()?;
        if let Some(fault) = status.fault() {
            return Ok(PumpState::Fault(fault));
        }
        let initialized = self.is_initialized()?;
        Ok(match (initialized, status.is_idle()) {
            (false, true) => PumpState::Uninitialized,
            (false, false) => PumpState::Initializing,
            (true, true) => PumpState::Idle,
            (true, false) => PumpState::Busy,
        })
    }

    /// Block until the pump reports idle.
    ///
    /// There is no timeout: a pump that stays busy keeps us here.
    pub fn wait_till_ready(&mut self) -> Result<(), S::Error> {
        while !self.is_idle()? {
            std::thread::sleep(std::time::Duration::from_millis(u64::from(self.poll_interval.to_millis())));
        }
        Ok(())
    }

    /// Initialize if needed, then push microstep mode and top velocity.
    pub fn smart_initialize(&mut self, valve_position: Option<ValvePosition>, secure: bool) -> Result<(), S::Error> {
        if !self.is_initialized()? {
            self.initialize(valve_position, secure)?;
        }
        self.init_all_pump_parameters()
    }

    /// Home the valve, move it to `valve_position`, then home the plunger.
    ///
    /// Safe on an initialized pump, but the plunger is homed again.
    pub fn initialize(&mut self, valve_position: Option<ValvePosition>, secure: bool) -> Result<(), S::Error> {
        let valve_position = valve_position.unwrap_or(self.initialize_valve_position);
        self.initialize_valve_only(None, true)?;
        self.set_valve_position(valve_position, secure)?;
        self.initialize_no_valve(None, true)
    }

    /// Home the plunger without moving the valve.
    ///
    /// Without an operand, syringes under 1 ml use half plunger force.
    pub fn initialize_no_valve(&mut self, operand: Option<u32>, wait: bool) -> Result<(), S::Error> {
        let operand = operand.unwrap_or_else(|| self.syringe.initialization_force());
        self.send_and_maybe_wait(self.protocol.initialize_no_valve(operand), wait)
    }

    pub fn initialize_valve_only(&mut self, operand: Option<&str>, wait: bool) -> Result<(), S::Error> {
        let packet = self
            .protocol
            .initialize_valve_only(Some(operand.unwrap_or(DEFAULT_VALVE_INIT_OPERAND)));
        self.send_and_maybe_wait(packet, wait)
    }

    pub fn initialize_valve_right(&mut self, operand: u32, wait: bool) -> Result<(), S::Error> {
        self.send_and_maybe_wait(self.protocol.initialize_valve_right(operand), wait)
    }

    pub fn initialize_valve_left(&mut self, operand: u32, wait: bool) -> Result<(), S::Error> {
        self.send_and_maybe_wait(self.protocol.initialize_valve_left(operand), wait)
    }

    /// Write the configured microstep mode and default top velocity.
    pub fn init_all_pump_parameters(&mut self) -> Result<(), S::Error> {
        let packet = self
            .protocol
            .microstep_mode(self.syringe.micro_step_mode().into())?;
        self.write_and_read(&packet)?;
        self.set_top_velocity(self.default_top_velocity)?;
        Ok(())
    }

    pub fn default_top_velocity(&self) -> u32 {
        self.default_top_velocity
    }

    /// Change the default top velocity. Out of range values are ignored.
    pub fn set_default_top_velocity(&mut self, velocity: u32) -> bool {
        if self.syringe.validate_top_velocity(velocity) {
            self.default_top_velocity = velocity;
            true
        } else {
            log::warn!(
                "Pump {}: default top velocity was NOT set to {} as such value is not valid",
                self.name,
                velocity
            );
            false
        }
    }

    pub fn validate_top_velocity(&self, velocity: u32) -> bool {
        self.syringe.validate_top_velocity(velocity)
    }

    /// Current top velocity as reported by the pump.
    pub fn top_velocity(&mut self) -> Result<u32, S::Error> {
        self.read_number(&self.protocol.report_peak_velocity())
    }

    /// Set the top velocity on the pump.
    ///
    /// Returns `false` without sending anything when `velocity` is out of range.
    pub fn set_top_velocity(&mut self, velocity: u32) -> Result<bool, S::Error> {
        if !self.syringe.validate_top_velocity(velocity) {
            log::warn!(
                "Pump {}: top velocity was NOT set to {} as such value is not valid",
                self.name,
                velocity
            );
            return Ok(false);
        }
        log::debug!("Pump {}: setting top velocity to {}", self.name, velocity);
        self.write_and_read(&self.protocol.top_velocity(velocity))?;
        Ok(true)
    }

    pub fn ensure_default_top_velocity(&mut self) -> Result<(), S::Error> {
        if self.top_velocity()? != self.default_top_velocity {
            self.set_top_velocity(self.default_top_velocity)?;
        }
        Ok(())
    }

    pub fn start_velocity(&mut self) -> Result<u32, S::Error> {
        self.read_number(&self.protocol.report_start_velocity())
    }

    pub fn cutoff_velocity(&mut self) -> Result<u32, S::Error> {
        self.read_number(&self.protocol.report_cutoff_velocity())
    }

    /// Plunger position in steps.
    pub fn current_steps(&mut self) -> Result<u32, S::Error> {
        self.read_number(&self.protocol.report_plunger_position())
    }

    /// Steps left before the syringe is full.
    pub fn remaining_steps(&mut self) -> Result<i64, S::Error> {
        Ok(i64::from(self.syringe.total_steps()) - i64::from(self.current_steps()?))
    }

    /// Volume in the syringe in ml.
    pub fn current_volume(&mut self) -> Result<f64, S::Error> {
        let steps = self.current_steps()?;
        Ok(self.syringe.step_to_volume(steps))
    }

    /// Volume that can still be drawn in ml.
    pub fn remaining_volume(&mut self) -> Result<f64, S::Error> {
        Ok(self.syringe.total_volume() - self.current_volume()?)
    }

    /// Negative and non-finite volumes are never pumpable.
    pub fn is_volume_pumpable(&mut self, volume_ml: f64) -> Result<bool, S::Error> {
        if !self.is_volume_valid(volume_ml) {
            return Ok(false);
        }
        let steps = i64::from(self.syringe.volume_to_step(volume_ml));
        Ok(steps <= self.remaining_steps()?)
    }

    pub fn is_volume_deliverable(&mut self, volume_ml: f64) -> Result<bool, S::Error> {
        if !self.is_volume_valid(volume_ml) {
            return Ok(false);
        }
        let steps = self.syringe.volume_to_step(volume_ml);
        Ok(steps <= self.current_steps()?)
    }

    pub fn is_volume_valid(&self, volume_ml: f64) -> bool {
        self.syringe.is_volume_valid(volume_ml)
    }

    fn apply_speed(&mut self, speed: Option<u32>) -> Result<(), S::Error> {
        match speed {
            Some(speed) => {
                self.set_top_velocity(speed)?;
            }
            None => self.ensure_default_top_velocity()?,
        }
        Ok(())
    }

    /// Draw `volume_ml` into the syringe.
    ///
    /// Returns `false`, sending nothing, if the syringe cannot take that much.
    /// A `speed` persists after the call; `None` restores the default.
    pub fn pump(
        &mut self,
        volume_ml: f64,
        from_valve: Option<ValvePosition>,
        speed: Option<u32>,
        wait: bool,
        secure: bool,
    ) -> Result<bool, S::Error> {
        if !self.is_volume_pumpable(volume_ml)? {
            return Ok(false);
        }

        self.apply_speed(speed)?;
        if let Some(valve) = from_valve {
            self.set_valve_position(valve, secure)?;
        }

        let steps = self.syringe.volume_to_step(volume_ml);
        self.send_and_maybe_wait(self.protocol.pump(steps), wait)?;
        Ok(true)
    }

    /// Push `volume_ml` out of the syringe.
    ///
    /// Returns `false`, sending nothing, if the syringe holds less than that.
    pub fn deliver(
        &mut self,
        volume_ml: f64,
        to_valve: Option<ValvePosition>,
        speed: Option<u32>,
        wait: bool,
        secure: bool,
    ) -> Result<bool, S::Error> {
        if !self.is_volume_deliverable(volume_ml)? {
            return Ok(false);
        }
        if volume_ml == 0.0 {
            return Ok(true);
        }

        self.apply_speed(speed)?;
        if let Some(valve) = to_valve {
            self.set_valve_position(valve, secure)?;
        }

        let steps = self.syringe.volume_to_step(volume_ml);
        self.send_and_maybe_wait(self.protocol.deliver(steps), wait)?;
        Ok(true)
    }

    /// Move `volume_ml` from one valve port to another, refilling as often as
    /// the syringe requires.
    pub fn transfer(
        &mut self,
        volume_ml: f64,
        from_valve: ValvePosition,
        to_valve: ValvePosition,
        speed_in: Option<u32>,
        speed_out: Option<u32>,
    ) -> Result<(), S::Error> {
        let mut left = volume_ml;
        while left > 0.0 {
            let chunk = left.min(self.remaining_volume()?);
            if chunk <= 0.0 || !self.pump(chunk, Some(from_valve), speed_in, true, true)? {
                return Err(Error::TransferStalled { remaining_ml: left });
            }
            if !self.deliver(chunk, Some(to_valve), speed_out, true, true)? {
                return Err(Error::TransferStalled { remaining_ml: left });
            }
            left -= chunk;
        }
        Ok(())
    }

    /// Move the plunger to the absolute position holding `volume_ml`.
    pub fn go_to_volume(&mut self, volume_ml: f64, speed: Option<u32>, wait: bool) -> Result<bool, S::Error> {
        if !self.is_volume_valid(volume_ml) {
            return Ok(false);
        }
        self.apply_speed(speed)?;
        let steps = self.syringe.volume_to_step(volume_ml);
        self.send_and_maybe_wait(self.protocol.move_to(steps), wait)?;
        Ok(true)
    }

    pub fn go_to_max_volume(&mut self, speed: Option<u32>, wait: bool) -> Result<bool, S::Error> {
        self.go_to_volume(self.syringe.total_volume(), speed, wait)
    }

    /// Raw valve report character(s).
    pub fn raw_valve_position(&mut self) -> Result<String, S::Error> {
        let (_, data) = self.write_and_read(&self.protocol.report_valve_position())?;
        Ok(data)
    }

    pub fn valve_position(&mut self) -> Result<ValvePosition, S::Error> {
        let raw = self.raw_valve_position()?;
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => ValvePosition::from_raw(c).map_err(Error::InvalidResponse),
            _ => Err(Error::InvalidResponse(DecodeError::UnknownValvePosition(raw))),
        }
    }

    /// Move the valve to `target`, checking and retrying up to [`MAX_REPEAT_OPERATION`] times.
    ///
    /// With `secure` unset the move is sent once and assumed to succeed.
    pub fn set_valve_position(&mut self, target: ValvePosition, secure: bool) -> Result<bool, S::Error> {
        let target = target.validate()?;
        for attempt in 1..=MAX_REPEAT_OPERATION {
            if self.valve_position()? == target {
                return Ok(true);
            }
            log::debug!(
                "Pump {}: valve not in position, change attempt {}/{}",
                self.name,
                attempt,
                MAX_REPEAT_OPERATION
            );

            self.write_and_read(&self.protocol.valve(target))?;
            if !secure {
                return Ok(true);
            }
            self.wait_till_ready()?;
        }

        log::debug!("Pump {}: too many failed attempts in set_valve_position", self.name);
        Err(Error::RepeatedOperation {
            pump: self.name.clone(),
            attempts: MAX_REPEAT_OPERATION,
        })
    }

    /// Write the valve configuration to EEPROM.
    ///
    /// __Note:__ only applied after the pump is power cycled.
    pub fn set_eeprom_config(&mut self, config: EepromValveConfig) -> Result<(), S::Error> {
        self.write_and_read(&self.protocol.eeprom_config(config as u8))?;
        match config {
            EepromValveConfig::ThreeWayY => log::warn!(
                "Pump {}: 3-way Y-valve, connect jumper to pin 5 (bottom pin) below address switch, then power cycle the pump",
                self.name
            ),
            _ => log::warn!("Pump {}: power cycle the pump to make changes active", self.name),
        }
        Ok(())
    }

    /// Requires the jumper at the back of the pump to be moved to the bottom pins.
    pub fn flash_eeprom_3_way_y_valve(&mut self) -> Result<(), S::Error> {
        self.set_eeprom_config(EepromValveConfig::ThreeWayY)
    }

    pub fn flash_eeprom_3_way_t_valve(&mut self) -> Result<(), S::Error> {
        self.set_eeprom_config(EepromValveConfig::ThreeWayT)
    }

    pub fn flash_eeprom_4_way_nondist_valve(&mut self) -> Result<(), S::Error> {
        self.set_eeprom_config(EepromValveConfig::FourWayNonDistribution)
    }

    pub fn flash_eeprom_4_way_dist_valve(&mut self) -> Result<(), S::Error> {
        self.set_eeprom_config(EepromValveConfig::FourWayDistribution)
    }

    /// The raw `?27` EEPROM report.
    pub fn eeprom_config(&mut self) -> Result<String, S::Error> {
        let (_, data) = self.write_and_read(&self.protocol.report_eeprom())?;
        Ok(data)
    }

    pub fn valve_topology(&mut self) -> Result<ValveTopology, S::Error> {
        let eeprom = self.eeprom_config()?;
        let topology = ValveTopology::from_eeprom(&eeprom);
        if topology == ValveTopology::Unknown {
            log::debug!("Pump {}: unrecognised valve configuration in {:?}", self.name, eeprom);
        }
        Ok(topology)
    }

    /// Abort the current move.
    pub fn terminate(&mut self) -> Result<(), S::Error> {
        self.write_and_read(&self.protocol.terminate())?;
        Ok(())
    }

    fn send_and_maybe_wait(&mut self, packet: InstructionPacket, wait: bool) -> Result<(), S::Error> {
        self.write_and_read(&packet)?;
        if wait {
            self.wait_till_ready()?;
        }
        Ok(())
    }

    fn fault(&self, fault: Fault) -> Error<S::Error> {
        log::error!("Pump {}: hardware error: {}", self.name, fault);
        Error::HardwareFault {
            pump: self.name.clone(),
            fault,
        }
    }

    fn read_number(&mut self, packet: &InstructionPacket) -> Result<u32, S::Error> {
        let (_, data) = self.write_and_read(packet)?;
        Self::parse_number(&data)
    }

    fn parse_number<T: core::str::FromStr>(data: &str) -> Result<T, S::Error> {
        data.trim()
            .parse()
            .map_err(|_| Error::InvalidResponse(DecodeError::InvalidPayload(data.to_owned())))
    }

    /// Send one packet and decode its reply into a status and data payload.
    ///
    /// The status is returned as-is; faults are only raised by [`Self::is_idle`].
    pub fn write_and_read(&mut self, packet: &InstructionPacket) -> Result<(StatusCode, String), S::Error> {
        let reply = Self::transact(&mut self.interface, packet)?;
        let status = StatusCode::try_from(reply.status).map_err(Error::Communication)?;
        log::debug!(
            "Pump {}: reply decoded to address {} status {:?} data {:?}",
            self.name,
            reply.address,
            status,
            reply.data
        );
        Ok((status, reply.data))
    }

    fn transact(interface: &mut S, packet: &InstructionPacket) -> Result<StatusReply, S::Error> {
        interface
            .write_all(&packet.encode())
            .map_err(Error::SerialError)?;

        let mut buff: heapless::Vec<u8, L> = heapless::Vec::new();

        // Read the response - keep reading until the terminator or a timeout
        let mut temp_buf = [0u8; 16];
        loop {
            match interface.read(&mut temp_buf) {
                Ok(0) => break,
                Ok(bytes_read) => {
                    if buff.extend_from_slice(&temp_buf[0..bytes_read]).is_err() {
                        return Err(Error::BufferError);
                    }
                    if buff.contains(&(protocol::TERMINATOR as u8)) {
                        break;
                    }
                }
                Err(e) if e.kind() == embedded_io::ErrorKind::TimedOut => break,
                Err(e) => return Err(Error::SerialError(e)),
            }
        }

        protocol::decode(&buff).map_err(Error::Communication)
    }
}

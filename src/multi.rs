//! Driving several pumps as one setup.
//!
//! Each pump keeps its own connection. Group operations issue a command to
//! every pump first and only then wait on all of them, so the hardware moves
//! concurrently while we talk to one connection at a time.

use std::collections::BTreeMap;

use crate::{
    config::{PumpSettings, SetupConfig},
    error::{Error, InvalidInput, Result},
    pump::PumpController,
    types::ValvePosition,
};

/// A named set of [`PumpController`]s, all on the same kind of interface.
pub struct MultiPumpController<S: embedded_io::Read + embedded_io::Write, const L: usize = 128> {
    pumps: BTreeMap<String, PumpController<S, L>>,
    groups: BTreeMap<String, Vec<String>>,
}

impl<S: embedded_io::Read + embedded_io::Write, const L: usize> MultiPumpController<S, L> {
    /// Connect and discover every pump of `setup`.
    ///
    /// `connect` opens the interface of one pump from its merged settings.
    pub fn new<F>(setup: SetupConfig, mut connect: F) -> Result<Self, S::Error>
    where
        F: FnMut(&str, &PumpSettings) -> core::result::Result<S, S::Error>,
    {
        for (group, members) in &setup.groups {
            if let Some(missing) = members.iter().find(|m| !setup.pumps.contains_key(*m)) {
                log::error!("Group {} references unknown pump {}", group, missing);
                return Err(InvalidInput::UnknownPump(missing.clone()).into());
            }
        }

        let mut pumps = BTreeMap::new();
        for (name, settings) in setup.merged_pump_settings()? {
            let interface = connect(&name, &settings).map_err(Error::SerialError)?;
            let pump = PumpController::from_settings(name.clone(), interface, &settings)?;
            log::info!("Pump {} ready on {} at address {}", name, settings.port, pump.address());
            pumps.insert(name, pump);
        }

        Ok(Self::from_pumps(pumps, setup.groups))
    }

    /// Assemble already connected pumps.
    pub fn from_pumps(pumps: BTreeMap<String, PumpController<S, L>>, groups: BTreeMap<String, Vec<String>>) -> Self {
        Self { pumps, groups }
    }

    pub fn pump(&self, name: &str) -> Option<&PumpController<S, L>> {
        self.pumps.get(name)
    }

    pub fn pump_mut(&mut self, name: &str) -> Option<&mut PumpController<S, L>> {
        self.pumps.get_mut(name)
    }

    pub fn pump_names(&self) -> impl Iterator<Item = &str> {
        self.pumps.keys().map(String::as_str)
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    pub fn pumps_in_group(&self, group: &str) -> Result<&[String], S::Error> {
        self.groups
            .get(group)
            .map(Vec::as_slice)
            .ok_or_else(|| InvalidInput::UnknownGroup(group.to_owned()).into())
    }

    /// Run `op` on each named pump in order, collecting results by name.
    ///
    /// Names that are not part of the setup are skipped. The first failure
    /// aborts the call; pumps after it are left untouched.
    pub fn apply_to<N, T, F>(&mut self, names: &[N], mut op: F) -> Result<BTreeMap<String, T>, S::Error>
    where
        N: AsRef<str>,
        F: FnMut(&mut PumpController<S, L>) -> Result<T, S::Error>,
    {
        let mut results = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            match self.pumps.get_mut(name) {
                Some(pump) => {
                    results.insert(name.to_owned(), op(pump)?);
                }
                None => log::debug!("Skipping unknown pump {}", name),
            }
        }
        Ok(results)
    }

    pub fn apply_to_all<T, F>(&mut self, op: F) -> Result<BTreeMap<String, T>, S::Error>
    where
        F: FnMut(&mut PumpController<S, L>) -> Result<T, S::Error>,
    {
        let names: Vec<String> = self.pumps.keys().cloned().collect();
        self.apply_to(&names, op)
    }

    pub fn apply_to_group<T, F>(&mut self, group: &str, op: F) -> Result<BTreeMap<String, T>, S::Error>
    where
        F: FnMut(&mut PumpController<S, L>) -> Result<T, S::Error>,
    {
        let names = self.pumps_in_group(group)?.to_vec();
        self.apply_to(&names, op)
    }

    pub fn are_pumps_initialized(&mut self) -> Result<bool, S::Error> {
        for pump in self.pumps.values_mut() {
            if !pump.is_initialized()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Barrier over the whole setup.
    pub fn wait_until_all_idle(&mut self) -> Result<(), S::Error> {
        self.apply_to_all(|pump| pump.wait_till_ready())?;
        Ok(())
    }

    pub fn wait_until_group_idle(&mut self, group: &str) -> Result<(), S::Error> {
        self.apply_to_group(group, |pump| pump.wait_till_ready())?;
        Ok(())
    }

    pub fn terminate_all(&mut self) -> Result<(), S::Error> {
        self.apply_to_all(|pump| pump.terminate())?;
        Ok(())
    }

    /// Bring every pump up, homing the uninitialized ones side by side.
    ///
    /// Pumps needing a homing are picked once, before anything moves. All of
    /// them get their valve homed, then their start valve position, then their
    /// plunger homed, with a barrier on the whole setup after each stage.
    /// Microstep mode and top velocity are then written to every pump.
    pub fn smart_initialize_all(&mut self, secure: bool) -> Result<(), S::Error> {
        let mut pending = Vec::new();
        for (name, pump) in self.pumps.iter_mut() {
            if !pump.is_initialized()? {
                pending.push(name.clone());
            }
        }
        log::info!("Initializing pumps {:?}", pending);

        self.apply_to(&pending, |pump| pump.initialize_valve_only(None, false))?;
        self.wait_until_all_idle()?;

        self.apply_to(&pending, |pump| {
            let position = pump.initialize_valve_position();
            pump.set_valve_position(position, secure)
        })?;
        self.wait_until_all_idle()?;

        self.apply_to(&pending, |pump| pump.initialize_no_valve(None, false))?;
        self.wait_until_all_idle()?;

        log::info!("Setting parameters on every pump");
        self.apply_to_all(|pump| pump.init_all_pump_parameters())?;
        self.wait_until_all_idle()
    }

    /// Draw `volume_ml` into every named pump, then wait for all of them.
    ///
    /// Returns `false` without moving anything when one of the pumps cannot
    /// take that much, and `false` if a pump refuses its stroke.
    pub fn pump_group<N: AsRef<str>>(
        &mut self,
        names: &[N],
        volume_ml: f64,
        from_valve: Option<ValvePosition>,
        speed: Option<u32>,
        wait: bool,
        secure: bool,
    ) -> Result<bool, S::Error> {
        let pumpable = self.apply_to(names, |pump| pump.is_volume_pumpable(volume_ml))?;
        if pumpable.values().any(|ok| !ok) {
            return Ok(false);
        }

        let moved = self.apply_to(names, |pump| pump.pump(volume_ml, from_valve, speed, false, secure))?;
        if wait {
            self.apply_to(names, |pump| pump.wait_till_ready())?;
        }
        Ok(moved.values().all(|ok| *ok))
    }

    /// Push `volume_ml` out of every named pump, then wait for all of them.
    pub fn deliver_group<N: AsRef<str>>(
        &mut self,
        names: &[N],
        volume_ml: f64,
        to_valve: Option<ValvePosition>,
        speed: Option<u32>,
        wait: bool,
        secure: bool,
    ) -> Result<bool, S::Error> {
        let deliverable = self.apply_to(names, |pump| pump.is_volume_deliverable(volume_ml))?;
        if deliverable.values().any(|ok| !ok) {
            return Ok(false);
        }

        let moved = self.apply_to(names, |pump| pump.deliver(volume_ml, to_valve, speed, false, secure))?;
        if wait {
            self.apply_to(names, |pump| pump.wait_till_ready())?;
        }
        Ok(moved.values().all(|ok| *ok))
    }

    /// Transfer `volume_ml` through every named pump in lock step.
    ///
    /// Each chunk is bounded by the smallest remaining capacity in the group.
    /// Returns the volume of each chunk moved. Fails with
    /// [`Error::TransferStalled`] when none of `names` is a known pump or a
    /// pump refuses a stroke.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_group<N: AsRef<str>>(
        &mut self,
        names: &[N],
        volume_ml: f64,
        from_valve: ValvePosition,
        to_valve: ValvePosition,
        speed_in: Option<u32>,
        speed_out: Option<u32>,
        secure: bool,
    ) -> Result<Vec<f64>, S::Error> {
        let mut chunks = Vec::new();
        let mut left = volume_ml;
        while left > 0.0 {
            let remaining = self.apply_to(names, |pump| pump.remaining_volume())?;
            if remaining.is_empty() {
                return Err(Error::TransferStalled { remaining_ml: left });
            }
            let chunk = remaining.values().fold(left, |chunk, r| chunk.min(*r));
            if chunk <= 0.0 {
                return Err(Error::TransferStalled { remaining_ml: left });
            }
            log::debug!("Group transfer of {} ml, {} ml left", chunk, left);

            if !self.pump_group(names, chunk, Some(from_valve), speed_in, true, secure)? {
                return Err(Error::TransferStalled { remaining_ml: left });
            }
            if !self.deliver_group(names, chunk, Some(to_valve), speed_out, true, secure)? {
                return Err(Error::TransferStalled { remaining_ml: left });
            }

            chunks.push(chunk);
            left -= chunk;
        }
        Ok(chunks)
    }
}

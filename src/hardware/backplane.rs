//! Relay and sensor backplane of one spectrograph unit.
//!
//! All operations on the shared fieldbus endpoint run inside one critical
//! section, so no other read can slip between a relay write and its
//! confirming re-read.

use crate::error::{AppResult, IebError};
use crate::hardware::register_bus::RegisterBus;
use crate::hardware::register_map::{
    RelayRegisterMap, SensorLayout, SensorReading, DIGITAL_OUTPUT_ADDRESS, RHT_ADDRESS,
    RTD_ADDRESS,
};
use crate::protocol::DeviceClass;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Named sensor values of one backplane read.
pub type SensorReadings = BTreeMap<String, SensorReading>;
/// Logical relay states (`true` = closed = powered).
pub type RelayStates = BTreeMap<String, bool>;

/// Digital outputs and analog inputs of a unit's fieldbus controller.
pub struct RelayBackplane {
    unit: String,
    bus: Arc<dyn RegisterBus>,
    map: RelayRegisterMap,
    layout: SensorLayout,
    settle: Duration,
    lock: Mutex<()>,
}

impl RelayBackplane {
    /// Creates a backplane over `bus` with the standard register layout.
    ///
    /// `settle` is the pause between a coil write and its confirming read.
    pub fn new(unit: &str, bus: Arc<dyn RegisterBus>, settle: Duration) -> Self {
        Self {
            unit: unit.to_string(),
            bus,
            map: RelayRegisterMap::default(),
            layout: SensorLayout::default(),
            settle,
            lock: Mutex::new(()),
        }
    }

    /// Reads every RTD and RH/T channel.
    ///
    /// Both blocks are read before anything is converted. A failure on either
    /// read fails the whole call and returns no partial readings.
    pub async fn read_sensors(&self) -> AppResult<SensorReadings> {
        let _guard = self.lock.lock().await;

        let rtd = self
            .bus
            .read_registers(RTD_ADDRESS, register_count(self.layout.rtd.len()))
            .await?;
        let rht = self
            .bus
            .read_registers(RHT_ADDRESS, register_count(self.layout.rht.len()))
            .await?;

        let mut readings = SensorReadings::new();
        SensorLayout::convert_block(&self.layout.rtd, &rtd, &mut readings)?;
        SensorLayout::convert_block(&self.layout.rht, &rht, &mut readings)?;
        debug!(unit = %self.unit, channels = readings.len(), "sensors read");
        Ok(readings)
    }

    /// Reads the digital-output register and derives every relay's state.
    pub async fn read_relays(&self) -> AppResult<RelayStates> {
        let _guard = self.lock.lock().await;
        let register = self.read_outputs().await?;
        Ok(self.map.decode(register))
    }

    /// Drives relay `name` to `closed`.
    ///
    /// Returns `None` if the relay already was in the requested state (no
    /// write issued) and `Some(true)` once a write has been confirmed by a
    /// fresh read of the register.
    pub async fn set_relay(&self, name: &str, closed: bool) -> AppResult<Option<bool>> {
        let slot = self.map.resolve(name)?.clone();
        let _guard = self.lock.lock().await;

        let before = self.read_outputs().await?;
        if RelayRegisterMap::closed_in(&slot, before) == closed {
            debug!(unit = %self.unit, relay = name, closed, "relay already in requested state");
            return Ok(None);
        }

        let coil = slot.class.bit_for_closed(closed);
        info!(unit = %self.unit, relay = name, closed, coil, index = slot.index, "writing relay");
        self.bus.write_coil(slot.index, coil).await?;
        tokio::time::sleep(self.settle).await;

        let after = self.read_outputs().await?;
        let observed = RelayRegisterMap::closed_in(&slot, after);
        if observed != closed {
            warn!(
                unit = %self.unit,
                relay = name,
                requested = closed,
                observed,
                "relay write not confirmed"
            );
            return Err(IebError::WriteNotConfirmed {
                relay: name.to_string(),
                requested: closed,
                observed,
            });
        }
        debug!(unit = %self.unit, relay = name, closed, "relay write confirmed");
        Ok(Some(true))
    }

    /// Whether the controller of `class` is powered.
    pub async fn power_state(&self, class: DeviceClass) -> AppResult<bool> {
        let slot = self.map.resolve(RelayRegisterMap::power_relay(class))?.clone();
        let _guard = self.lock.lock().await;
        let register = self.read_outputs().await?;
        Ok(RelayRegisterMap::closed_in(&slot, register))
    }

    async fn read_outputs(&self) -> AppResult<u16> {
        let words = self.bus.read_registers(DIGITAL_OUTPUT_ADDRESS, 1).await?;
        words.first().copied().ok_or_else(|| IebError::Fieldbus {
            endpoint: self.bus.endpoint().to_string(),
            detail: "empty reply reading digital outputs".to_string(),
        })
    }
}

fn register_count(channels: usize) -> u16 {
    u16::try_from(channels).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockRegisterBus;

    fn backplane() -> (Arc<MockRegisterBus>, RelayBackplane) {
        let bus = Arc::new(MockRegisterBus::new());
        let backplane = RelayBackplane::new("sp1", bus.clone(), Duration::from_millis(1));
        (bus, backplane)
    }

    #[tokio::test]
    async fn test_power_state_follows_polarity() {
        let (bus, backplane) = backplane();

        bus.set_register(DIGITAL_OUTPUT_ADDRESS, 0);
        assert!(backplane.power_state(DeviceClass::Shutter).await.unwrap());
        assert!(!backplane.power_state(DeviceClass::HartmannLeft).await.unwrap());

        bus.set_register(DIGITAL_OUTPUT_ADDRESS, 0b0000_1001);
        assert!(!backplane.power_state(DeviceClass::Shutter).await.unwrap());
        assert!(backplane.power_state(DeviceClass::HartmannRight).await.unwrap());
    }

    #[tokio::test]
    async fn test_noop_write_issues_no_coil() {
        let (bus, backplane) = backplane();
        assert_eq!(backplane.set_relay("shutter_power", true).await.unwrap(), None);
        assert!(bus.coil_writes().is_empty());
    }
}

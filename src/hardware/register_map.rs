//! Register layout of the relay/sensor backplane.
//!
//! The digital-output byte holds one bit per relay. What a set bit means
//! depends on how the relay is wired:
//!
//! | class   | bit = 1                  | bit = 0                 |
//! |---------|--------------------------|-------------------------|
//! | shutter | contact open, power OFF  | contact closed, power ON|
//! | door    | power ON                 | power OFF               |
//!
//! Callers only ever see the logical state, `closed == powered on`. Raw
//! register polarity never leaves this module.

use crate::error::{AppResult, IebError};
use crate::protocol::DeviceClass;
use serde::Serialize;
use std::collections::BTreeMap;

/// Address of the 8-port digital-output register.
pub const DIGITAL_OUTPUT_ADDRESS: u16 = 512;
/// Number of relay outputs in the digital-output register.
pub const DIGITAL_OUTPUT_PORTS: usize = 8;
/// Address of the first RH/T register (RH1, T1, RH2, T2, ...).
pub const RHT_ADDRESS: u16 = 0;
/// Address of the first RTD register.
pub const RTD_ADDRESS: u16 = 8;

/// Resolution of the RTD input module, °C per count.
const RTD_RESOLUTION: f64 = 0.1;
/// Maximum physical temperature of a Pt RTD in °C.
const RTD_MAX_CELSIUS: f64 = 850.0;
/// Full scale of the RH/T transmitter inputs.
const RHT_SLOPE: f64 = 100.0 / 32767.0;

/// Wiring polarity of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayClass {
    /// Bit set opens the contact and removes power.
    Shutter,
    /// Bit set powers the device.
    Door,
}

impl RelayClass {
    /// Logical contact state (`true` = closed = powered) for a register bit.
    pub fn closed_from_bit(self, bit: bool) -> bool {
        match self {
            RelayClass::Shutter => !bit,
            RelayClass::Door => bit,
        }
    }

    /// Coil value to write for a requested contact state.
    pub fn bit_for_closed(self, closed: bool) -> bool {
        match self {
            RelayClass::Shutter => !closed,
            RelayClass::Door => closed,
        }
    }
}

/// One slot of the digital-output register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySlot {
    /// Logical relay name; `None` for reserved slots.
    pub name: Option<&'static str>,
    /// Wiring polarity.
    pub class: RelayClass,
    /// Bit index in the register, also the coil address.
    pub index: u16,
}

/// Fixed mapping between logical relays and register bits.
#[derive(Debug, Clone)]
pub struct RelayRegisterMap {
    slots: Vec<RelaySlot>,
}

impl Default for RelayRegisterMap {
    fn default() -> Self {
        let named = |index, name, class| RelaySlot {
            name: Some(name),
            class,
            index,
        };
        let reserved = |index, class| RelaySlot {
            name: None,
            class,
            index,
        };

        Self {
            slots: vec![
                named(0, "shutter_power", RelayClass::Shutter),
                reserved(1, RelayClass::Shutter),
                named(2, "hartmann_left_power", RelayClass::Door),
                named(3, "hartmann_right_power", RelayClass::Door),
                reserved(4, RelayClass::Door),
                reserved(5, RelayClass::Door),
                reserved(6, RelayClass::Door),
                reserved(7, RelayClass::Door),
            ],
        }
    }
}

impl RelayRegisterMap {
    /// Named relays, in register order.
    pub fn relays(&self) -> impl Iterator<Item = &RelaySlot> {
        self.slots.iter().filter(|slot| slot.name.is_some())
    }

    /// Looks up a relay by name.
    pub fn resolve(&self, name: &str) -> AppResult<&RelaySlot> {
        self.relays()
            .find(|slot| slot.name == Some(name))
            .ok_or_else(|| IebError::UnknownDevice(name.to_string()))
    }

    /// Name of the relay that powers the motor controller of `class`.
    pub fn power_relay(class: DeviceClass) -> &'static str {
        match class {
            DeviceClass::Shutter => "shutter_power",
            DeviceClass::HartmannLeft => "hartmann_left_power",
            DeviceClass::HartmannRight => "hartmann_right_power",
        }
    }

    /// Logical state of one relay in a raw register value.
    pub fn closed_in(slot: &RelaySlot, register: u16) -> bool {
        let bit = register & (1 << slot.index) != 0;
        slot.class.closed_from_bit(bit)
    }

    /// Derives every named relay's state from a raw register value.
    pub fn decode(&self, register: u16) -> BTreeMap<String, bool> {
        self.relays()
            .filter_map(|slot| {
                slot.name
                    .map(|name| (name.to_string(), Self::closed_in(slot, register)))
            })
            .collect()
    }
}

/// Kind of analog channel, which selects the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Pt RTD temperature with wraparound fold-back.
    Rtd,
    /// Relative humidity from an RH/T transmitter.
    Humidity,
    /// Temperature from an RH/T transmitter.
    Temperature,
}

/// Linear conversion constants of one analog channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorChannel {
    /// Reading name.
    pub name: &'static str,
    /// Conversion kind.
    pub kind: ChannelKind,
    /// Value at raw = 0.
    pub offset: f64,
    /// Physical units per count.
    pub slope: f64,
    /// Physical unit label.
    pub unit: &'static str,
}

impl SensorChannel {
    fn rtd(name: &'static str) -> Self {
        Self {
            name,
            kind: ChannelKind::Rtd,
            offset: 0.0,
            slope: RTD_RESOLUTION,
            unit: "degC",
        }
    }

    fn humidity(name: &'static str) -> Self {
        Self {
            name,
            kind: ChannelKind::Humidity,
            offset: 0.0,
            slope: RHT_SLOPE,
            unit: "%",
        }
    }

    fn temperature(name: &'static str) -> Self {
        Self {
            name,
            kind: ChannelKind::Temperature,
            offset: -30.0,
            slope: RHT_SLOPE,
            unit: "degC",
        }
    }

    /// Converts a raw register count to a physical value.
    ///
    /// RTD inputs report sub-zero temperatures as a wrapped 16-bit count, so
    /// anything above the RTD maximum is folded back by the full register span.
    pub fn convert(&self, raw: u16) -> f64 {
        let value = self.offset + self.slope * f64::from(raw);
        match self.kind {
            ChannelKind::Rtd if value > RTD_MAX_CELSIUS => {
                value - RTD_RESOLUTION * f64::from(u16::MAX)
            }
            _ => value,
        }
    }
}

/// A converted analog reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    /// Physical value.
    pub value: f64,
    /// Unit label.
    pub unit: &'static str,
}

/// Layout of the analog register blocks.
#[derive(Debug, Clone)]
pub struct SensorLayout {
    /// RTD channels, consecutive from [`RTD_ADDRESS`].
    pub rtd: Vec<SensorChannel>,
    /// RH/T channels, interleaved from [`RHT_ADDRESS`].
    pub rht: Vec<SensorChannel>,
}

impl Default for SensorLayout {
    fn default() -> Self {
        Self {
            rtd: vec![
                SensorChannel::rtd("rtd1"),
                SensorChannel::rtd("rtd2"),
                SensorChannel::rtd("rtd3"),
                SensorChannel::rtd("rtd4"),
            ],
            rht: vec![
                SensorChannel::humidity("rh1"),
                SensorChannel::temperature("t1"),
                SensorChannel::humidity("rh2"),
                SensorChannel::temperature("t2"),
                SensorChannel::humidity("rh3"),
                SensorChannel::temperature("t3"),
            ],
        }
    }
}

impl SensorLayout {
    /// Converts a block of raw registers against its channel list.
    ///
    /// Fails with a protocol error if the block is shorter than the layout.
    pub fn convert_block(
        channels: &[SensorChannel],
        raw: &[u16],
        out: &mut BTreeMap<String, SensorReading>,
    ) -> AppResult<()> {
        if raw.len() < channels.len() {
            return Err(IebError::Protocol {
                device: "backplane".to_string(),
                detail: format!(
                    "expected {} sensor registers, got {}",
                    channels.len(),
                    raw.len()
                ),
            });
        }
        for (channel, &count) in channels.iter().zip(raw) {
            out.insert(
                channel.name.to_string(),
                SensorReading {
                    value: channel.convert(count),
                    unit: channel.unit,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polarity_is_inverse_in_both_directions() {
        for class in [RelayClass::Shutter, RelayClass::Door] {
            for closed in [true, false] {
                let bit = class.bit_for_closed(closed);
                assert_eq!(class.closed_from_bit(bit), closed);
            }
        }
        assert!(!RelayClass::Shutter.bit_for_closed(true));
        assert!(RelayClass::Door.bit_for_closed(true));
    }

    #[test]
    fn decodes_register_per_class() {
        let map = RelayRegisterMap::default();

        // All outputs low: shutter powered, doors unpowered.
        let relays = map.decode(0x00);
        assert_eq!(relays["shutter_power"], true);
        assert_eq!(relays["hartmann_left_power"], false);
        assert_eq!(relays["hartmann_right_power"], false);

        // Bits 0, 2, 3 high: shutter unpowered, doors powered.
        let relays = map.decode(0b0000_1101);
        assert_eq!(relays["shutter_power"], false);
        assert_eq!(relays["hartmann_left_power"], true);
        assert_eq!(relays["hartmann_right_power"], true);
        assert_eq!(relays.len(), 3);
    }

    #[test]
    fn reserved_slots_are_not_resolvable() {
        let map = RelayRegisterMap::default();
        assert_eq!(map.resolve("hartmann_right_power").unwrap().index, 3);
        assert!(matches!(
            map.resolve("unused"),
            Err(IebError::UnknownDevice(_))
        ));
    }

    #[test]
    fn rtd_folds_back_above_maximum() {
        let channel = SensorChannel::rtd("rtd1");
        assert!((channel.convert(215) - 21.5).abs() < 1e-9);

        let raw: u16 = 65_436;
        let expected = 0.1 * f64::from(raw) - 0.1 * (65_536.0 - 1.0);
        assert!((channel.convert(raw) - expected).abs() < 1e-9);
        assert!((channel.convert(raw) - (-9.9)).abs() < 1e-6);
    }

    #[test]
    fn rht_conversion_uses_offset_and_slope() {
        let layout = SensorLayout::default();
        let mut out = BTreeMap::new();
        SensorLayout::convert_block(&layout.rht, &[16_384, 16_384, 0, 0, 32_767, 32_767], &mut out)
            .unwrap();

        assert!((out["rh1"].value - 50.0015).abs() < 1e-3);
        assert!((out["t1"].value - 20.0015).abs() < 1e-3);
        assert_eq!(out["rh2"].value, 0.0);
        assert_eq!(out["t2"].value, -30.0);
        assert!((out["t3"].value - 70.0).abs() < 1e-9);
        assert_eq!(out["t3"].unit, "degC");
    }

    #[test]
    fn short_block_is_rejected() {
        let layout = SensorLayout::default();
        let mut out = BTreeMap::new();
        assert!(SensorLayout::convert_block(&layout.rtd, &[1, 2], &mut out).is_err());
        assert!(out.is_empty());
    }
}

//! Unit-level aggregate: one backplane, the motor links, the transducers and
//! the depth gauge of a spectrograph unit.
//!
//! Operations on several devices run concurrently (one task per device) and
//! return one outcome per device, so a failing device never hides the result
//! of its siblings.

use crate::config::{Settings, UnitConfig};
use crate::error::{AppResult, IebError};
use crate::error_recovery::{retry_sequential, RetryPolicy};
use crate::hardware::{
    DepthLink, DeviceIdentity, ModbusTcpBus, MotorLink, RelayBackplane, RelayStates,
    SensorReadings, TransducerLink,
};
use crate::protocol::{DeviceClass, MotorCommand, StatusReport};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-device results of a multi-device operation.
pub type Outcomes<K, T> = BTreeMap<K, AppResult<T>>;

/// Which Hartmann door(s) an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HartmannSide {
    /// Both doors.
    #[default]
    All,
    /// Left door only.
    Left,
    /// Right door only.
    Right,
}

impl HartmannSide {
    /// Door classes addressed by this side.
    pub fn classes(self) -> &'static [DeviceClass] {
        match self {
            HartmannSide::All => &[DeviceClass::HartmannLeft, DeviceClass::HartmannRight],
            HartmannSide::Left => &[DeviceClass::HartmannLeft],
            HartmannSide::Right => &[DeviceClass::HartmannRight],
        }
    }
}

impl fmt::Display for HartmannSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HartmannSide::All => "all",
            HartmannSide::Left => "left",
            HartmannSide::Right => "right",
        })
    }
}

impl FromStr for HartmannSide {
    type Err = IebError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(HartmannSide::All),
            "left" => Ok(HartmannSide::Left),
            "right" => Ok(HartmannSide::Right),
            other => Err(IebError::UnknownDevice(format!("hartmann side '{other}'"))),
        }
    }
}

/// Pressure and temperature of one camera's transducer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransducerReading {
    /// Pressure.
    pub pressure: f64,
    /// Temperature in °C.
    pub temperature: f64,
}

/// Depth gauge readings with the camera the gauge is mounted on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthReport {
    /// Camera label, if set.
    pub camera: Option<String>,
    /// Millimetres per channel.
    pub values: BTreeMap<String, f64>,
}

/// Devices of one spectrograph unit.
pub struct DeviceGroup {
    unit: String,
    motors: BTreeMap<DeviceClass, MotorLink>,
    backplane: Option<Arc<RelayBackplane>>,
    transducers: BTreeMap<String, TransducerLink>,
    depth: Option<DepthLink>,
    retry: RetryPolicy,
}

impl DeviceGroup {
    /// Creates an empty group.
    pub fn new(unit: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            unit: unit.into(),
            motors: BTreeMap::new(),
            backplane: None,
            transducers: BTreeMap::new(),
            depth: None,
            retry,
        }
    }

    /// Builds the group for unit `id` from configuration.
    ///
    /// Motor links are power-gated on the unit's backplane when one is
    /// configured.
    pub fn from_config(id: &str, unit: &UnitConfig, settings: &Settings) -> Self {
        let timeouts = &settings.timeouts;
        let mut group = Self::new(id, settings.retry.policy());

        if let Some(fieldbus) = &unit.fieldbus {
            let bus = ModbusTcpBus::new(
                &fieldbus.host,
                fieldbus.port,
                fieldbus.slave,
                timeouts.connect(),
                Duration::from_millis(timeouts.fieldbus_ms),
            );
            group = group.with_backplane(Arc::new(RelayBackplane::new(
                id,
                Arc::new(bus),
                Duration::from_millis(timeouts.relay_settle_ms),
            )));
        }

        let motors = [
            (DeviceClass::Shutter, &unit.motors.shutter),
            (DeviceClass::HartmannLeft, &unit.motors.hartmann_left),
            (DeviceClass::HartmannRight, &unit.motors.hartmann_right),
        ];
        for (class, endpoint) in motors {
            if let Some(endpoint) = endpoint {
                let identity = DeviceIdentity::new(id, class, endpoint.address());
                group = group.with_motor(MotorLink::new(identity, timeouts.motor()));
            }
        }

        for (camera, transducer) in &unit.transducers {
            group = group.with_transducer(
                camera,
                TransducerLink::new(
                    format!("{id}.{camera}"),
                    format!("{}:{}", transducer.host, transducer.port),
                    transducer.id,
                    timeouts.connect(),
                    Duration::from_millis(timeouts.transducer_ms),
                ),
            );
        }

        if let Some(depth) = &unit.depth {
            let link = DepthLink::new(
                format!("{id}.depth"),
                format!("{}:{}", depth.host, depth.port),
                depth.channels.clone(),
                timeouts.connect(),
                Duration::from_millis(timeouts.depth_ms),
            );
            if let Some(camera) = &depth.camera {
                link.set_camera(camera.clone());
            }
            group = group.with_depth(link);
        }

        group
    }

    /// Attaches the backplane. Motor links added afterwards are power-gated.
    pub fn with_backplane(mut self, backplane: Arc<RelayBackplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Adds a motor link, gating it on the attached backplane if any.
    pub fn with_motor(mut self, link: MotorLink) -> Self {
        let link = match &self.backplane {
            Some(backplane) => link.with_backplane(backplane.clone()),
            None => link,
        };
        self.motors.insert(link.class(), link);
        self
    }

    /// Adds the transducer of `camera`.
    pub fn with_transducer(mut self, camera: &str, link: TransducerLink) -> Self {
        self.transducers.insert(camera.to_string(), link);
        self
    }

    /// Attaches the depth gauge.
    pub fn with_depth(mut self, link: DepthLink) -> Self {
        self.depth = Some(link);
        self
    }

    /// Unit id.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Configured motor classes.
    pub fn motor_classes(&self) -> Vec<DeviceClass> {
        self.motors.keys().copied().collect()
    }

    /// Configured transducer cameras.
    pub fn cameras(&self) -> Vec<String> {
        self.transducers.keys().cloned().collect()
    }

    /// The motor link for `class`.
    pub fn motor(&self, class: DeviceClass) -> AppResult<&MotorLink> {
        self.motors
            .get(&class)
            .ok_or_else(|| IebError::UnknownDevice(format!("{}.{class}", self.unit)))
    }

    /// The backplane.
    pub fn backplane(&self) -> AppResult<&RelayBackplane> {
        self.backplane
            .as_deref()
            .ok_or_else(|| IebError::UnknownDevice(format!("{}.fieldbus", self.unit)))
    }

    /// The depth gauge.
    pub fn depth(&self) -> AppResult<&DepthLink> {
        self.depth
            .as_ref()
            .ok_or_else(|| IebError::UnknownDevice(format!("{}.depth", self.unit)))
    }

    fn transducer(&self, camera: &str) -> AppResult<&TransducerLink> {
        self.transducers
            .get(camera)
            .ok_or_else(|| IebError::UnknownDevice(format!("{}.{camera}", self.unit)))
    }

    // ------------------------------------------------------------------
    // Motors
    // ------------------------------------------------------------------

    /// Sends `command` to the controller of `class`.
    pub async fn send(
        &self,
        class: DeviceClass,
        command: MotorCommand,
        force: bool,
    ) -> AppResult<StatusReport> {
        self.motor(class)?.send(command, force).await
    }

    /// Status of the controller of `class`.
    pub async fn get_status(&self, class: DeviceClass) -> AppResult<StatusReport> {
        self.motor(class)?.get_status().await
    }

    /// Moves the mechanism of `class`; see `MotorLink::move`.
    pub async fn r#move(
        &self,
        class: DeviceClass,
        open: Option<bool>,
        force: bool,
    ) -> AppResult<bool> {
        self.motor(class)?.r#move(open, force).await
    }

    /// Status of every configured motor, queried concurrently.
    pub async fn status_all(&self) -> Outcomes<DeviceClass, StatusReport> {
        let futures = self
            .motors
            .iter()
            .map(|(class, link)| async move { (*class, link.get_status().await) });
        join_all(futures).await.into_iter().collect()
    }

    /// Moves several mechanisms concurrently.
    ///
    /// Every class gets an outcome. Unconfigured classes report
    /// [`IebError::UnknownDevice`].
    pub async fn move_devices(
        &self,
        classes: &[DeviceClass],
        open: Option<bool>,
        force: bool,
    ) -> Outcomes<DeviceClass, bool> {
        let futures = classes.iter().map(|&class| async move {
            let outcome = self.r#move(class, open, force).await;
            if let Err(e) = &outcome {
                warn!(unit = %self.unit, device = %class, error = %e, "move failed");
            }
            (class, outcome)
        });
        let outcomes: Outcomes<DeviceClass, bool> = join_all(futures).await.into_iter().collect();

        let moved = outcomes.values().filter(|o| matches!(o, Ok(true))).count();
        info!(unit = %self.unit, requested = classes.len(), moved, "move complete");
        outcomes
    }

    /// Moves the Hartmann door(s) on `side`.
    pub async fn move_hartmann(
        &self,
        side: HartmannSide,
        open: Option<bool>,
        force: bool,
    ) -> Outcomes<DeviceClass, bool> {
        self.move_devices(side.classes(), open, force).await
    }

    // ------------------------------------------------------------------
    // Backplane
    // ------------------------------------------------------------------

    /// Relay states.
    pub async fn read_relays(&self) -> AppResult<RelayStates> {
        self.backplane()?.read_relays().await
    }

    /// Drives one relay; see [`RelayBackplane::set_relay`].
    pub async fn set_relay(&self, name: &str, closed: bool) -> AppResult<Option<bool>> {
        self.backplane()?.set_relay(name, closed).await
    }

    /// Environmental sensor readings.
    pub async fn read_sensors(&self) -> AppResult<SensorReadings> {
        self.backplane()?.read_sensors().await
    }

    // ------------------------------------------------------------------
    // Scalar readers (with caller-side retry)
    // ------------------------------------------------------------------

    /// Pressure of `camera`'s transducer.
    pub async fn read_pressure(&self, camera: &str) -> AppResult<f64> {
        let link = self.transducer(camera)?;
        retry_sequential(&self.retry, link.label(), move || link.read_pressure()).await
    }

    /// Temperature of `camera`'s transducer.
    pub async fn read_temperature(&self, camera: &str) -> AppResult<f64> {
        let link = self.transducer(camera)?;
        retry_sequential(&self.retry, link.label(), move || link.read_temperature()).await
    }

    /// Pressure and temperature of every camera.
    ///
    /// Cameras are read concurrently; the two queries to one transducer run
    /// one after the other.
    pub async fn read_transducers(&self) -> Outcomes<String, TransducerReading> {
        let futures = self
            .transducers
            .keys()
            .map(|camera| async move { (camera.clone(), self.read_transducer(camera).await) });
        join_all(futures).await.into_iter().collect()
    }

    /// Pressure then temperature of `camera`'s transducer.
    pub async fn read_transducer(&self, camera: &str) -> AppResult<TransducerReading> {
        Ok(TransducerReading {
            pressure: self.read_pressure(camera).await?,
            temperature: self.read_temperature(camera).await?,
        })
    }

    /// Every depth channel, each read with retry.
    pub async fn read_depth(&self) -> AppResult<DepthReport> {
        let link = self.depth()?;
        let mut values = BTreeMap::new();
        for channel in link.channels() {
            let label = format!("{}.depth.{channel}", self.unit);
            let value =
                retry_sequential(&self.retry, &label, move || link.read_channel(channel)).await?;
            values.insert(channel.clone(), value);
        }
        Ok(DepthReport {
            camera: link.camera(),
            values,
        })
    }
}

/// Every configured unit, keyed by id.
pub struct Enclosure {
    units: BTreeMap<String, DeviceGroup>,
}

impl Enclosure {
    /// Validates `settings` and builds one [`DeviceGroup`] per configured unit.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        settings.validate()?;
        let units = settings
            .units
            .iter()
            .map(|(id, unit)| (id.clone(), DeviceGroup::from_config(id, unit, settings)))
            .collect();
        Ok(Self { units })
    }

    /// Wraps already-built groups.
    pub fn from_groups(groups: impl IntoIterator<Item = DeviceGroup>) -> Self {
        let units = groups
            .into_iter()
            .map(|group| (group.unit().to_string(), group))
            .collect();
        Self { units }
    }

    /// The group of unit `id`.
    pub fn unit(&self, id: &str) -> AppResult<&DeviceGroup> {
        self.units
            .get(id)
            .ok_or_else(|| IebError::UnknownDevice(format!("unit '{id}'")))
    }

    /// Unit ids in order.
    pub fn unit_ids(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sides_map_to_door_classes() {
        assert_eq!(HartmannSide::All.classes().len(), 2);
        assert_eq!(HartmannSide::Left.classes(), &[DeviceClass::HartmannLeft]);
        assert_eq!("right".parse::<HartmannSide>().unwrap(), HartmannSide::Right);
        assert!("middle".parse::<HartmannSide>().is_err());
    }

    #[test]
    fn enclosure_builds_configured_units() {
        let settings = Settings::from_toml_str(
            r#"
            [units.sp1.motors.shutter]
            host = "127.0.0.1"
            port = 7776

            [units.sp1.motors.hartmann_left]
            host = "127.0.0.1"
            port = 7777

            [units.sp2.transducers.r2]
            host = "127.0.0.1"
            port = 1112
            "#,
        )
        .unwrap();

        let enclosure = Enclosure::from_settings(&settings).unwrap();
        assert_eq!(enclosure.unit_ids().collect::<Vec<_>>(), vec!["sp1", "sp2"]);

        let sp1 = enclosure.unit("sp1").unwrap();
        assert_eq!(
            sp1.motor_classes(),
            vec![DeviceClass::Shutter, DeviceClass::HartmannLeft]
        );
        assert!(matches!(sp1.backplane(), Err(IebError::UnknownDevice(_))));
        assert_eq!(enclosure.unit("sp2").unwrap().cameras(), vec!["r2"]);
        assert!(enclosure.unit("sp3").is_err());
    }

    #[test]
    fn invalid_settings_are_a_configuration_error() {
        let mut settings = Settings::from_toml_str(
            r#"
            [units.sp1.motors.shutter]
            host = "127.0.0.1"
            port = 7776
            "#,
        )
        .unwrap();
        settings.units.clear();

        let err = Enclosure::from_settings(&settings).err().unwrap();
        assert!(matches!(err, IebError::Configuration(ref msg) if msg.contains("unit")));
    }

    #[tokio::test]
    async fn unconfigured_door_reports_its_own_outcome() {
        let group = DeviceGroup::new("sp1", RetryPolicy::no_retry());
        let outcomes = group.move_hartmann(HartmannSide::All, Some(true), false).await;

        assert_eq!(outcomes.len(), 2);
        for outcome in outcomes.values() {
            assert!(matches!(outcome, Err(IebError::UnknownDevice(_))));
        }
    }
}

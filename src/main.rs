//! # ieb
//!
//! Command-line access to one spectrograph unit's enclosure electronics.
//!
//! ```bash
//! ieb --config config/ieb.example.toml sp1 status
//! ieb --config config/ieb.example.toml sp1 shutter open
//! ieb --config config/ieb.example.toml sp1 hartmann close --side left
//! ieb --config config/ieb.example.toml sp1 set-relay shutter_power on
//! ```
//!
//! Every command prints one JSON document on stdout. Per-device failures are
//! reported inline and make the process exit non-zero.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_ieb::config::Settings;
use rust_ieb::group::Outcomes;
use rust_ieb::protocol::{DeviceClass, MotorCommand};
use rust_ieb::{AppResult, Enclosure, HartmannSide};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Enclosure electronics control
#[derive(Parser, Debug)]
#[command(name = "ieb")]
#[command(about = "Shutter, Hartmann door, relay and sensor control", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/ieb.toml")]
    config: PathBuf,

    /// Unit id (e.g. sp1)
    unit: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Status of every motor controller
    Status,

    /// Drive the exposure shutter
    Shutter {
        /// Action
        action: ShutterAction,
        /// Move even if already at the target
        #[arg(long)]
        force: bool,
    },

    /// Drive the Hartmann doors
    Hartmann {
        /// Action
        action: DoorAction,
        /// Which door(s)
        #[arg(short, long, value_enum, default_value_t = Side::All)]
        side: Side,
        /// Move even if already at the target
        #[arg(long)]
        force: bool,
    },

    /// Relay states
    Relays,

    /// Switch one relay
    SetRelay {
        /// Relay name (e.g. shutter_power)
        name: String,
        /// Requested state
        state: RelaySwitch,
    },

    /// Environmental sensors
    Sensors,

    /// Pressure and temperature of every camera
    Transducers,

    /// Depth gauge channels
    Depth,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ShutterAction {
    Open,
    Close,
    Toggle,
    Init,
    Home,
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DoorAction {
    Open,
    Close,
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Side {
    All,
    Left,
    Right,
}

impl From<Side> for HartmannSide {
    fn from(side: Side) -> Self {
        match side {
            Side::All => HartmannSide::All,
            Side::Left => HartmannSide::Left,
            Side::Right => HartmannSide::Right,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RelaySwitch {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let enclosure = Enclosure::from_settings(&settings)?;
    let (output, ok) = run(&enclosure, &cli.unit, cli.command).await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(enclosure: &Enclosure, unit: &str, command: Commands) -> Result<(Value, bool)> {
    let group = enclosure.unit(unit)?;

    let result = match command {
        Commands::Status => outcomes(group.status_all().await),

        Commands::Shutter { action, force } => {
            let shutter = DeviceClass::Shutter;
            match action {
                ShutterAction::Open => single(group.r#move(shutter, Some(true), force).await),
                ShutterAction::Close => single(group.r#move(shutter, Some(false), force).await),
                ShutterAction::Toggle => single(group.r#move(shutter, None, force).await),
                ShutterAction::Init => single(group.send(shutter, MotorCommand::Init, force).await),
                ShutterAction::Home => single(group.send(shutter, MotorCommand::Home, force).await),
                ShutterAction::Status => single(group.get_status(shutter).await),
            }
        }

        Commands::Hartmann {
            action,
            side,
            force,
        } => {
            let side = HartmannSide::from(side);
            match action {
                DoorAction::Open => outcomes(group.move_hartmann(side, Some(true), force).await),
                DoorAction::Close => outcomes(group.move_hartmann(side, Some(false), force).await),
                DoorAction::Status => {
                    let mut statuses = Outcomes::new();
                    for &class in side.classes() {
                        statuses.insert(class, group.get_status(class).await);
                    }
                    outcomes(statuses)
                }
            }
        }

        Commands::Relays => single(group.read_relays().await),

        Commands::SetRelay { name, state } => {
            let closed = matches!(state, RelaySwitch::On);
            single(group.set_relay(&name, closed).await.map(|changed| {
                json!({ "relay": name, "closed": closed, "changed": changed.is_some() })
            }))
        }

        Commands::Sensors => single(group.read_sensors().await),

        Commands::Transducers => outcomes(group.read_transducers().await),

        Commands::Depth => single(group.read_depth().await),
    };

    Ok(result)
}

/// JSON for one result: the value, or `{"error": ...}`.
fn single<T: Serialize>(result: AppResult<T>) -> (Value, bool) {
    match result.map(serde_json::to_value) {
        Ok(Ok(value)) => (value, true),
        Ok(Err(e)) => (json!({ "error": format!("cannot encode result: {e}") }), false),
        Err(e) => (json!({ "error": e.to_string() }), false),
    }
}

/// JSON object with one entry per device.
fn outcomes<K: ToString, T: Serialize>(results: Outcomes<K, T>) -> (Value, bool) {
    let mut all_ok = true;
    let mut map = serde_json::Map::new();
    for (key, result) in results {
        let (value, ok) = single(result);
        all_ok &= ok;
        map.insert(key.to_string(), value);
    }
    (Value::Object(map), all_ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_ieb::IebError;
    use std::collections::BTreeMap;

    #[test]
    fn unencodable_result_is_reported_as_error() {
        let mut value = BTreeMap::new();
        value.insert((1u8, 2u8), 3u8);

        let (json, ok) = single(Ok(value));

        assert!(!ok);
        assert!(json["error"].as_str().unwrap().starts_with("cannot encode result"));
    }

    #[test]
    fn outcomes_fail_if_any_device_fails() {
        let mut results: Outcomes<&str, u8> = Outcomes::new();
        results.insert("a", Ok(1));
        results.insert("b", Err(IebError::UnknownDevice("sp1.b".into())));

        let (json, ok) = outcomes(results);

        assert!(!ok);
        assert_eq!(json["a"], 1);
        assert!(json["b"]["error"].is_string());
    }
}

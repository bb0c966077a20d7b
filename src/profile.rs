//! Device families: which setpoints a device has and how to talk to it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize as _;

use crate::catalog::{self, AccessCode, Catalog, Kind, SetpointSpec};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the device profile at {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not parse the device profile")]
    Parse(#[source] serde_json::Error),
    #[error("the setpoint catalog of `{1}` is inconsistent")]
    Catalog(#[source] catalog::Error, String),
}

#[derive(clap::Parser, Clone)]
#[group(id = "profile::Args")]
pub struct Args {
    /// Load the device profile from this JSON file instead of using the built-in HPW 300 one.
    #[arg(long)]
    profile: Option<PathBuf>,
}

impl Args {
    pub fn load(&self) -> Result<Profile, Error> {
        match &self.profile {
            None => Profile::hpw300(),
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).map_err(|e| Error::Read(e, path.clone()))?;
                Profile::from_json(&text)
            }
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Serial line parameters. These are fixed per device family.
#[derive(Clone, Copy, Debug, PartialEq, serde::Deserialize)]
pub struct LinkSettings {
    pub baud_rate: u32,
    #[serde(deserialize_with = "data_bits")]
    pub data_bits: tokio_serial::DataBits,
    pub parity: Parity,
    #[serde(deserialize_with = "stop_bits")]
    pub stop_bits: tokio_serial::StopBits,
    /// How long the device may take before it starts responding.
    #[serde(deserialize_with = "humantime_duration")]
    pub response_timeout: Duration,
}

fn data_bits<'de, D: serde::Deserializer<'de>>(d: D) -> Result<tokio_serial::DataBits, D::Error> {
    Ok(match u8::deserialize(d)? {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(serde::de::Error::custom(format!("{other} data bits are not supported")));
        }
    })
}

fn stop_bits<'de, D: serde::Deserializer<'de>>(d: D) -> Result<tokio_serial::StopBits, D::Error> {
    Ok(match u8::deserialize(d)? {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(serde::de::Error::custom(format!("{other} stop bits are not supported")));
        }
    })
}

fn humantime_duration<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(d)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

/// Location of the 7-register clock block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct ClockBlock {
    pub address: u16,
    #[serde(default = "holding")]
    pub access: AccessCode,
}

fn holding() -> AccessCode {
    AccessCode::Holding
}

#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    pub device_id: u8,
    pub link: LinkSettings,
    pub clock: Option<ClockBlock>,
    pub catalog: Catalog,
}

#[derive(serde::Deserialize)]
struct ProfileFile {
    name: String,
    device_id: u8,
    link: LinkSettings,
    #[serde(default)]
    clock: Option<ClockBlock>,
    setpoints: BTreeMap<String, SetpointSpec>,
}

impl Profile {
    /// The HPW 300 heat pump water heater.
    pub fn hpw300() -> Result<Self, Error> {
        use AccessCode::Holding as H;
        let name = "HPW 300";
        let setpoints = [
            ("D01", SetpointSpec::new(3, H, Kind::float(Kind::TENTHS)).unit("C")),
            ("D07", SetpointSpec::new(11, H, Kind::int_with_offset(-100)).unit("C")),
            (
                "F03",
                SetpointSpec::new(26, H, Kind::float_with_offset(Kind::TENTHS, -100)).unit("C"),
            ),
            ("F04", SetpointSpec::new(27, H, Kind::Bool)),
            ("F05", SetpointSpec::new(28, H, Kind::float(Kind::TENTHS)).unit("C")),
            ("F06", SetpointSpec::new(29, H, Kind::float(Kind::TENTHS)).unit("C")),
            ("F07", SetpointSpec::new(30, H, Kind::float(Kind::TENTHS))),
            ("F08", SetpointSpec::new(31, H, Kind::float(Kind::TENTHS)).unit("C")),
            ("F09", SetpointSpec::new(33, H, Kind::int()).unit("Pa")),
            ("F14", SetpointSpec::new(36, H, Kind::int()).description("ModBus Unit ID")),
            (
                "F15",
                SetpointSpec::new(37, H, Kind::labels([(0, 9600i64), (1, 19200)]))
                    .description("ModBus Baud Rate"),
            ),
            (
                "F16",
                SetpointSpec::new(38, H, Kind::labels([(0, "None"), (1, "Even"), (2, "Odd")]))
                    .description("ModBus Parity"),
            ),
            ("F27", SetpointSpec::new(4, H, Kind::int()).unit("%")),
            ("F28", SetpointSpec::new(5, H, Kind::int()).unit("%")),
        ];
        let catalog = Catalog::new(setpoints).map_err(|e| Error::Catalog(e, name.into()))?;
        Ok(Self {
            name: name.into(),
            device_id: 20,
            link: LinkSettings {
                baud_rate: 19200,
                data_bits: tokio_serial::DataBits::Eight,
                parity: Parity::Even,
                stop_bits: tokio_serial::StopBits::One,
                response_timeout: Duration::from_millis(50),
            },
            clock: Some(ClockBlock { address: 200, access: H }),
            catalog,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        let file: ProfileFile = serde_json::from_str(text).map_err(Error::Parse)?;
        let catalog =
            Catalog::new(file.setpoints).map_err(|e| Error::Catalog(e, file.name.clone()))?;
        Ok(Self {
            name: file.name,
            device_id: file.device_id,
            link: file.link,
            clock: file.clock,
            catalog,
        })
    }
}

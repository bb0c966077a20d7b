use std::collections::BTreeMap;
use std::num::NonZeroU16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("setpoint `{0}` is defined more than once")]
    DuplicateName(String),
    #[error("setpoints `{first}` and `{second}` both map to register {address} ({access})")]
    DuplicateAddress { first: String, second: String, address: u16, access: AccessCode },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("setpoint `{0}` is not in the catalog")]
    NotFound(String),
}

/// The modbus function used to read a setpoint.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum AccessCode {
    Holding = 3,
    Input = 4,
}

impl AccessCode {
    pub const fn function_code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for AccessCode {
    type Error = String;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Holding),
            4 => Ok(Self::Input),
            other => Err(format!("unsupported access code {other} (expected 3 or 4)")),
        }
    }
}

impl From<AccessCode> for u8 {
    fn from(value: AccessCode) -> u8 {
        value.function_code()
    }
}

impl std::fmt::Display for AccessCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.function_code())
    }
}

/// A label from an enumeration table.
///
/// Some devices enumerate plain numbers (e.g. baud rates), others short strings.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Label {
    Number(i64),
    Text(String),
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for Label {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Number(n) => write!(f, "{n}"),
            Label::Text(s) => f.write_str(s),
        }
    }
}

/// How the raw register word is turned into a value.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// `raw / (scale * 10)`, then `offset` is added.
    Float {
        scale: NonZeroU16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<i32>,
    },
    Int {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<i32>,
    },
    Bool,
    Enum { labels: BTreeMap<u16, Label> },
}

impl Kind {
    /// Scale of a value reported in tenths.
    pub const TENTHS: NonZeroU16 = NonZeroU16::MIN;

    pub const fn float(scale: NonZeroU16) -> Self {
        Self::Float { scale, offset: None }
    }

    pub const fn float_with_offset(scale: NonZeroU16, offset: i32) -> Self {
        Self::Float { scale, offset: Some(offset) }
    }

    pub const fn int() -> Self {
        Self::Int { offset: None }
    }

    pub const fn int_with_offset(offset: i32) -> Self {
        Self::Int { offset: Some(offset) }
    }

    pub fn labels<L: Into<Label>>(labels: impl IntoIterator<Item = (u16, L)>) -> Self {
        Self::Enum { labels: labels.into_iter().map(|(k, v)| (k, v.into())).collect() }
    }
}

impl std::fmt::Display for Kind {
    /// Renders the kind-specific parameters, e.g. `scale=1 offset=-100`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::Float { scale, offset } => {
                write!(f, "scale={scale}")?;
                if let Some(offset) = offset {
                    write!(f, " offset={offset}")?;
                }
                Ok(())
            }
            Kind::Int { offset: Some(offset) } => write!(f, "offset={offset}"),
            Kind::Int { offset: None } | Kind::Bool => Ok(()),
            Kind::Enum { labels } => {
                let mut first = true;
                for (raw, label) in labels {
                    if !first {
                        f.write_str(" ")?;
                    }
                    first = false;
                    write!(f, "{raw}={label}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SetpointSpec {
    pub address: u16,
    pub access: AccessCode,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl SetpointSpec {
    pub fn new(address: u16, access: AccessCode, kind: Kind) -> Self {
        Self { address, access, kind, description: None, unit: None }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            Kind::Float { .. } => "FLOAT",
            Kind::Int { .. } => "INT",
            Kind::Bool => "BOOL",
            Kind::Enum { .. } => "ENUM",
        }
    }
}

/// Setpoints known for a device, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    entries: BTreeMap<String, SetpointSpec>,
}

impl Catalog {
    pub fn new<N: Into<String>>(
        entries: impl IntoIterator<Item = (N, SetpointSpec)>,
    ) -> Result<Self, Error> {
        let mut by_name = BTreeMap::new();
        let mut by_address: BTreeMap<(u16, AccessCode), String> = BTreeMap::new();
        for (name, spec) in entries {
            let name = name.into();
            if by_name.contains_key(&name) {
                return Err(Error::DuplicateName(name));
            }
            let key = (spec.address, spec.access);
            if let Some(first) = by_address.insert(key, name.clone()) {
                return Err(Error::DuplicateAddress {
                    first,
                    second: name,
                    address: spec.address,
                    access: spec.access,
                });
            }
            by_name.insert(name, spec);
        }
        Ok(Self { entries: by_name })
    }

    pub fn get(&self, name: &str) -> Result<&SetpointSpec, LookupError> {
        self.entries.get(name).ok_or_else(|| LookupError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Iterates in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SetpointSpec)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use crate::catalog::{Kind, Label};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("raw value {raw} has no label in the enumeration table")]
    UnknownLabel { raw: u16 },
    #[error("clock field `{field}` has an unexpected raw value {raw}")]
    ClockField { field: &'static str, raw: u16 },
    #[error("clock block returned {0} registers, expected 7")]
    ClockLength(usize),
}

/// A typed setpoint value.
///
/// Serialized as a bare JSON value, so a numeric label is indistinguishable from an `Int`.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Label(Label),
}

impl std::fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodedValue::Float(v) => write!(f, "{v}"),
            DecodedValue::Int(v) => write!(f, "{v}"),
            DecodedValue::Bool(true) => f.write_str("On"),
            DecodedValue::Bool(false) => f.write_str("Off"),
            DecodedValue::Label(l) => write!(f, "{l}"),
        }
    }
}

/// Decode a raw register word according to its setpoint kind.
///
/// `Bool` is lenient (anything but `1` is `false`, devices do report other states), while `Enum`
/// requires the raw value to be present in its table.
pub fn decode(kind: &Kind, raw: u16) -> Result<DecodedValue, Error> {
    Ok(match kind {
        Kind::Float { scale, offset } => {
            let value = f64::from(raw) / (f64::from(scale.get()) * 10.0);
            DecodedValue::Float(value + offset.map(f64::from).unwrap_or(0.0))
        }
        Kind::Int { offset } => {
            DecodedValue::Int(i64::from(raw) + offset.map(i64::from).unwrap_or(0))
        }
        Kind::Bool => DecodedValue::Bool(raw == 1),
        Kind::Enum { labels } => {
            let label = labels.get(&raw).ok_or(Error::UnknownLabel { raw })?;
            DecodedValue::Label(label.clone())
        }
    })
}

pub const CLOCK_REGISTERS: u16 = 7;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::IntoStaticStr, strum::Display,
)]
#[repr(u16)]
pub enum Weekday {
    Monday = 1,
    Tuesday = 2,
    Wednesday = 3,
    Thursday = 4,
    Friday = 5,
    Saturday = 6,
    Sunday = 7,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::IntoStaticStr, strum::Display,
)]
#[repr(u16)]
pub enum TimeFormat {
    #[strum(serialize = "12 Hour")]
    TwelveHour = 0,
    #[strum(serialize = "24 Hour")]
    TwentyFourHour = 1,
}

macro_rules! serialize_as_str {
    ($($ty:ty),*) => {$(
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(<&'static str>::from(self))
            }
        }
    )*};
}
serialize_as_str!(Weekday, TimeFormat);

/// The device clock, read from its own block of holding registers.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ClockReading {
    pub hour: u16,
    pub minute: u16,
    pub weekday: Weekday,
    pub day: u16,
    pub month: u16,
    pub year: u16,
    pub format: TimeFormat,
}

impl ClockReading {
    /// Registers are, in order: hour, minute, weekday, day, month, year since 2000, 12/24h.
    pub fn decode(words: &[u16]) -> Result<Self, Error> {
        let &[hour, minute, weekday, day, month, year, format] = words else {
            return Err(Error::ClockLength(words.len()));
        };
        Ok(Self {
            hour,
            minute,
            weekday: Weekday::from_repr(weekday)
                .ok_or(Error::ClockField { field: "weekday", raw: weekday })?,
            day,
            month,
            year: 2000u16.saturating_add(year),
            format: TimeFormat::from_repr(format)
                .ok_or(Error::ClockField { field: "format", raw: format })?,
        })
    }
}

impl std::fmt::Display for ClockReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{}/{} @ {}:{:0>2}",
            self.weekday, self.day, self.month, self.year, self.hour, self.minute
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU16;

    #[test]
    fn float() {
        let tenths = Kind::float(Kind::TENTHS);
        assert_eq!(decode(&tenths, 1000), Ok(DecodedValue::Float(100.0)));
        assert_eq!(decode(&tenths, 1234), Ok(DecodedValue::Float(123.4)));
        let offset = Kind::float_with_offset(Kind::TENTHS, -100);
        assert_eq!(decode(&offset, 1000), Ok(DecodedValue::Float(0.0)));
        let halves = Kind::float(NonZeroU16::new(2).unwrap());
        assert_eq!(decode(&halves, 1000), Ok(DecodedValue::Float(50.0)));
    }

    #[test]
    fn int() {
        assert_eq!(decode(&Kind::int_with_offset(-100), 50), Ok(DecodedValue::Int(-50)));
        assert_eq!(decode(&Kind::int(), 50), Ok(DecodedValue::Int(50)));
        assert_eq!(decode(&Kind::int(), u16::MAX), Ok(DecodedValue::Int(65535)));
    }

    #[test]
    fn bool_is_lenient() {
        assert_eq!(decode(&Kind::Bool, 1), Ok(DecodedValue::Bool(true)));
        assert_eq!(decode(&Kind::Bool, 0), Ok(DecodedValue::Bool(false)));
        assert_eq!(decode(&Kind::Bool, 7), Ok(DecodedValue::Bool(false)));
    }

    #[test]
    fn enum_is_strict() {
        let parity = Kind::labels([(0, "None"), (1, "Even"), (2, "Odd")]);
        assert_eq!(decode(&parity, 1), Ok(DecodedValue::Label(Label::from("Even"))));
        assert_eq!(decode(&parity, 5), Err(Error::UnknownLabel { raw: 5 }));
        let baud = Kind::labels([(0, 9600i64), (1, 19200i64)]);
        assert_eq!(decode(&baud, 1), Ok(DecodedValue::Label(Label::Number(19200))));
    }

    #[test]
    fn display() {
        assert_eq!(DecodedValue::Bool(true).to_string(), "On");
        assert_eq!(DecodedValue::Bool(false).to_string(), "Off");
        assert_eq!(DecodedValue::Float(45.5).to_string(), "45.5");
        assert_eq!(DecodedValue::Label(Label::from("Odd")).to_string(), "Odd");
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_string(&[
            DecodedValue::Float(123.4),
            DecodedValue::Int(-50),
            DecodedValue::Bool(true),
            DecodedValue::Label(Label::from("Even")),
            DecodedValue::Label(Label::Number(9600)),
        ])
        .unwrap();
        assert_eq!(json, r#"[123.4,-50,true,"Even",9600]"#);
    }

    #[test]
    fn clock() {
        let clock = ClockReading::decode(&[14, 5, 3, 15, 10, 26, 1]).unwrap();
        assert_eq!(clock.weekday, Weekday::Wednesday);
        assert_eq!(clock.year, 2026);
        assert_eq!(clock.format, TimeFormat::TwentyFourHour);
        assert_eq!(clock.to_string(), "Wednesday 15/10/2026 @ 14:05");
        let json = serde_json::to_value(&clock).unwrap();
        assert_eq!(json["weekday"], "Wednesday");
        assert_eq!(json["format"], "24 Hour");
    }

    #[test]
    fn clock_rejects_unknown_fields() {
        assert_eq!(
            ClockReading::decode(&[14, 5, 0, 15, 10, 26, 1]),
            Err(Error::ClockField { field: "weekday", raw: 0 })
        );
        assert_eq!(
            ClockReading::decode(&[14, 5, 1, 15, 10, 26, 2]),
            Err(Error::ClockField { field: "format", raw: 2 })
        );
        assert_eq!(ClockReading::decode(&[14, 5]), Err(Error::ClockLength(2)));
    }
}

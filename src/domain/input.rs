//! Raw caller input and its canonical, hash-ready form.
//!
//! Normalization never fills gaps: a missing birth time is an error, not noon.

use std::{fmt, str::FromStr};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use time::{Date, Month};

use super::error::DomainError;

const MICRO_DEGREES: f64 = 1_000_000.0;

/// Geometry family a book belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryKind {
    /// Birth chart: date, time, place and zone.
    #[default]
    Natal,
    /// Name and birth date numerology.
    Numerology,
}

impl LibraryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryKind::Natal => "natal",
            LibraryKind::Numerology => "numerology",
        }
    }
}

impl fmt::Display for LibraryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibraryKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "natal" => Ok(LibraryKind::Natal),
            "numerology" => Ok(LibraryKind::Numerology),
            other => Err(DomainError::format("library", other)),
        }
    }
}

/// Input exactly as a caller supplied it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawInput {
    pub library: LibraryKind,
    pub date: Option<String>,
    pub time: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub name: Option<String>,
}

/// A coordinate held as integral micro-degrees (6 decimal places).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub struct Coordinate(i64);

impl Coordinate {
    pub fn from_degrees(degrees: f64) -> Option<Self> {
        if !degrees.is_finite() {
            return None;
        }
        Some(Self((degrees * MICRO_DEGREES).round() as i64))
    }

    pub fn micro_degrees(&self) -> i64 {
        self.0
    }

    pub fn degrees(&self) -> f64 {
        self.0 as f64 / MICRO_DEGREES
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:06}", abs / 1_000_000, abs % 1_000_000)
    }
}

impl From<Coordinate> for f64 {
    fn from(value: Coordinate) -> Self {
        value.degrees()
    }
}

impl TryFrom<f64> for Coordinate {
    type Error = DomainError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Coordinate::from_degrees(value).ok_or_else(|| DomainError::range("coordinate", value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatalInput {
    pub date: String,
    pub time: String,
    pub latitude: Coordinate,
    pub longitude: Coordinate,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumerologyInput {
    pub name: String,
    pub date: String,
}

/// Canonical input; equal values always hash to the same book key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "library", rename_all = "snake_case")]
pub enum NormalizedInput {
    Natal(NatalInput),
    Numerology(NumerologyInput),
}

impl NormalizedInput {
    pub fn library(&self) -> LibraryKind {
        match self {
            NormalizedInput::Natal(_) => LibraryKind::Natal,
            NormalizedInput::Numerology(_) => LibraryKind::Numerology,
        }
    }

    /// Field values in hashing order. Never reorder without a schema bump.
    pub fn key_fields(&self) -> Vec<String> {
        match self {
            NormalizedInput::Natal(natal) => vec![
                natal.date.clone(),
                natal.time.clone(),
                natal.latitude.to_string(),
                natal.longitude.to_string(),
                natal.timezone.clone(),
            ],
            NormalizedInput::Numerology(numerology) => {
                vec![numerology.name.clone(), numerology.date.clone()]
            }
        }
    }
}

/// Validate and canonicalize a raw input.
pub fn normalize(raw: &RawInput) -> Result<NormalizedInput, DomainError> {
    match raw.library {
        LibraryKind::Natal => normalize_natal(raw).map(NormalizedInput::Natal),
        LibraryKind::Numerology => normalize_numerology(raw).map(NormalizedInput::Numerology),
    }
}

fn normalize_natal(raw: &RawInput) -> Result<NatalInput, DomainError> {
    let date = present(raw.date.as_deref());
    let time = present(raw.time.as_deref());
    let timezone = present(raw.timezone.as_deref());

    let mut missing = Vec::new();
    if date.is_none() {
        missing.push("date");
    }
    if time.is_none() {
        missing.push("time");
    }
    if raw.latitude.is_none() {
        missing.push("latitude");
    }
    if raw.longitude.is_none() {
        missing.push("longitude");
    }
    if timezone.is_none() {
        missing.push("timezone");
    }

    let (Some(date), Some(time), Some(latitude), Some(longitude), Some(timezone)) =
        (date, time, raw.latitude, raw.longitude, timezone)
    else {
        return Err(DomainError::incomplete(missing));
    };

    Ok(NatalInput {
        date: canonical_date(date)?,
        time: canonical_time(time)?,
        latitude: bounded_coordinate("latitude", latitude, 90.0)?,
        longitude: bounded_coordinate("longitude", longitude, 180.0)?,
        timezone: canonical_timezone(timezone)?,
    })
}

fn normalize_numerology(raw: &RawInput) -> Result<NumerologyInput, DomainError> {
    let name = present(raw.name.as_deref());
    let date = present(raw.date.as_deref());

    let mut missing = Vec::new();
    if name.is_none() {
        missing.push("name");
    }
    if date.is_none() {
        missing.push("date");
    }

    let (Some(name), Some(date)) = (name, date) else {
        return Err(DomainError::incomplete(missing));
    };

    Ok(NumerologyInput {
        name: canonical_name(name)?,
        date: canonical_date(date)?,
    })
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn canonical_date(value: &str) -> Result<String, DomainError> {
    let malformed = || DomainError::format("date", value);

    let parts: Vec<&str> = value.split(['-', '/']).collect();
    let [year, month, day] = parts.as_slice() else {
        return Err(malformed());
    };
    if year.len() != 4 || !(1..=2).contains(&month.len()) || !(1..=2).contains(&day.len()) {
        return Err(malformed());
    }

    let year: i32 = digits(year).ok_or_else(malformed)?;
    let month: u8 = digits(month).ok_or_else(malformed)?;
    let day: u8 = digits(day).ok_or_else(malformed)?;

    let month = Month::try_from(month).map_err(|_| DomainError::range("date", value))?;
    let date =
        Date::from_calendar_date(year, month, day).map_err(|_| DomainError::range("date", value))?;

    Ok(format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    ))
}

fn canonical_time(value: &str) -> Result<String, DomainError> {
    let malformed = || DomainError::format("time", value);

    let parts: Vec<&str> = value.split(':').collect();
    let (hour, minute, second) = match parts.as_slice() {
        [hour, minute] => (*hour, *minute, None),
        [hour, minute, second] => (*hour, *minute, Some(*second)),
        _ => return Err(malformed()),
    };
    if !(1..=2).contains(&hour.len()) || minute.len() != 2 {
        return Err(malformed());
    }

    let hour: u8 = digits(hour).ok_or_else(malformed)?;
    let minute: u8 = digits(minute).ok_or_else(malformed)?;
    if let Some(second) = second {
        let second: u8 = digits(second)
            .filter(|_| second.len() == 2)
            .ok_or_else(malformed)?;
        if second > 59 {
            return Err(DomainError::range("time", value));
        }
    }
    if hour > 23 || minute > 59 {
        return Err(DomainError::range("time", value));
    }

    Ok(format!("{hour:02}:{minute:02}"))
}

fn canonical_timezone(value: &str) -> Result<String, DomainError> {
    Tz::from_str(value).map_err(|_| DomainError::format("timezone", value))?;
    Ok(value.to_string())
}

fn canonical_name(value: &str) -> Result<String, DomainError> {
    // `|` is the key delimiter; allowing it would make key material ambiguous.
    if value.contains('|') || value.chars().any(char::is_control) {
        return Err(DomainError::format("name", value));
    }
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(collapsed.to_uppercase())
}

fn bounded_coordinate(
    field: &'static str,
    degrees: f64,
    limit: f64,
) -> Result<Coordinate, DomainError> {
    if !degrees.is_finite() || degrees < -limit || degrees > limit {
        return Err(DomainError::range(field, degrees));
    }
    Coordinate::from_degrees(degrees).ok_or_else(|| DomainError::range(field, degrees))
}

fn digits<T: FromStr>(value: &str) -> Option<T> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

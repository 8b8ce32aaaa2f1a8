use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// The four fields a screening announcement must carry to be complete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    ScreeningDatetime,
    Location,
    BookingUrl,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::Title,
        Field::ScreeningDatetime,
        Field::Location,
        Field::BookingUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::ScreeningDatetime => "screening_datetime",
            Field::Location => "location",
            Field::BookingUrl => "booking_url",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages, used for logging and for tagging run failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    Render,
    Consent,
    Extract,
    Detect,
    Done,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Render => "render",
            Stage::Consent => "consent",
            Stage::Extract => "extract",
            Stage::Detect => "detect",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted screening announcement. Empty strings mean "not found".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub screening_datetime: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub location: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub booking_url: String,
    #[serde(
        default,
        alias = "movie_url",
        deserialize_with = "null_as_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub source_url: String,
    #[serde(skip, default = "now_fixed")]
    pub extracted_at: DateTime<FixedOffset>,
}

pub(crate) fn now_fixed() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Older state files write missing fields as `null`.
fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

/// RFC 3339, or a naive ISO timestamp taken as local time. Anything else is
/// dropped rather than failing the whole state.
fn lenient_timestamp<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<DateTime<FixedOffset>>, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(d)?;
    Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(parse_timestamp))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt);
    }
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.fixed_offset())
}

impl ScreeningRecord {
    pub fn empty(source_url: impl Into<String>, extracted_at: DateTime<FixedOffset>) -> Self {
        Self {
            title: String::new(),
            screening_datetime: String::new(),
            location: String::new(),
            booking_url: String::new(),
            source_url: source_url.into(),
            extracted_at,
        }
    }

    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::Title => &self.title,
            Field::ScreeningDatetime => &self.screening_datetime,
            Field::Location => &self.location,
            Field::BookingUrl => &self.booking_url,
        }
    }

    pub fn set(&mut self, field: Field, value: String) {
        match field {
            Field::Title => self.title = value,
            Field::ScreeningDatetime => self.screening_datetime = value,
            Field::Location => self.location = value,
            Field::BookingUrl => self.booking_url = value,
        }
    }

    pub fn missing_fields(&self) -> BTreeSet<Field> {
        Field::ALL
            .into_iter()
            .filter(|f| self.get(*f).trim().is_empty())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Two records describe the same screening when all four required fields
    /// match exactly. Missing fields compare as empty strings.
    pub fn same_screening(&self, other: &ScreeningRecord) -> bool {
        Field::ALL
            .into_iter()
            .all(|f| self.get(f).trim() == other.get(f).trim())
    }
}

/// Durable record of the last observed screening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(
        default,
        alias = "last_changed_date",
        deserialize_with = "lenient_timestamp"
    )]
    pub last_changed_at: Option<DateTime<FixedOffset>>,
    #[serde(default, alias = "latest_movie_data")]
    pub latest_record: Option<ScreeningRecord>,
}

/// Named consent detection strategies, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStrategy {
    PlatformMarkers,
    GenericLocalizedText,
    GenericAttribute,
}

impl ConsentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStrategy::PlatformMarkers => "platform_markers",
            ConsentStrategy::GenericLocalizedText => "generic_localized_text",
            ConsentStrategy::GenericAttribute => "generic_attribute",
        }
    }
}

impl fmt::Display for ConsentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsentOutcome {
    pub dialog_present: bool,
    pub dismissed: bool,
    pub strategy_used: Option<ConsentStrategy>,
    pub error: Option<String>,
    pub screenshot_ref: Option<PathBuf>,
}

impl ConsentOutcome {
    pub fn no_dialog() -> Self {
        Self {
            dialog_present: false,
            dismissed: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionDiagnostics {
    pub missing_fields: BTreeSet<Field>,
    pub strategy_used_per_field: BTreeMap<Field, &'static str>,
    pub screenshot_ref: Option<PathBuf>,
}

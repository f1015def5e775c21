use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use regex::Regex;
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// Column holding the container barcode in reference inventory files.
pub const IDENTIFIER_COLUMN: &str = "Barcode ID - Container";

/// Column holding the container status in reference inventory files.
pub const STATUS_COLUMN: &str = "Status - Container";

const ARCHIVED_STATUS: &str = "archived";

const CAMPAIGN_ID_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year repr:last_two][month][day]-[hour][minute][second]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("invalid barcode pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("failed to format timestamp: {0}")]
    TimestampFormat(String),
}

/// Soft scan outcomes: recognized rejections, not failures. The campaign is
/// left untouched when any of these is returned.
#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("no barcode provided")]
    EmptyBarcode,
    #[error("barcode does not match the configured pattern")]
    InvalidFormat,
    #[error("barcode already scanned in this campaign")]
    Duplicate,
}

/// Second-precision scan timestamps rendered as `YYYY-MM-DD HH:MM:SS`.
pub mod scan_time {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::FormatItem;
    use time::macros::format_description;
    use time::{OffsetDateTime, PrimitiveDateTime};

    const FORMAT: &[FormatItem<'static>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

    /// # Errors
    /// Returns an error when the timestamp cannot be rendered with the
    /// campaign file format.
    pub fn render(timestamp: OffsetDateTime) -> Result<String, time::error::Format> {
        timestamp.format(&FORMAT)
    }

    /// # Errors
    /// Returns an error when the value is not a `YYYY-MM-DD HH:MM:SS`
    /// timestamp.
    pub fn parse(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
        PrimitiveDateTime::parse(value, &FORMAT).map(PrimitiveDateTime::assume_utc)
    }

    /// # Errors
    /// Returns a serializer error when rendering fails.
    pub fn serialize<S>(timestamp: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let rendered = render(*timestamp).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&rendered)
    }

    /// # Errors
    /// Returns a deserializer error when the value does not parse.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Active,
    Archived,
    NotFound,
}

impl Category {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::NotFound => "not_found",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "not_found" => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable campaign key, `<building>_<room>_<YYMMDD-HHMMSS>`. Building and
/// room must not themselves contain `_` for `building_room` to parse them
/// back out; this is a documented constraint, not enforced here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CampaignId(String);

impl CampaignId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mint a fresh id for a campaign starting now.
    ///
    /// # Errors
    /// Returns [`CoreError::TimestampFormat`] when the timestamp cannot be
    /// rendered.
    pub fn mint(building: &str, room: &str, now: OffsetDateTime) -> Result<Self, CoreError> {
        let stamp = now
            .format(&CAMPAIGN_ID_TIME_FORMAT)
            .map_err(|err| CoreError::TimestampFormat(err.to_string()))?;
        Ok(Self(format!("{building}_{room}_{stamp}")))
    }

    /// Building and room recovered from the first two `_`-delimited
    /// segments, or `"Unknown"`/`"Unknown"` when the id has fewer than two.
    #[must_use]
    pub fn building_room(&self) -> (String, String) {
        let mut segments = self.0.splitn(3, '_');
        match (segments.next(), segments.next()) {
            (Some(building), Some(room)) => (building.to_string(), room.to_string()),
            _ => ("Unknown".to_string(), "Unknown".to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CampaignId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the reference inventory. `attributes` carries every column
/// except the identifier, keyed by column title; blank cells are absent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReferenceRecord {
    pub identifier: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ReferenceRecord {
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.attributes.get(STATUS_COLUMN).map(String::as_str)
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.status().is_some_and(|status| status.eq_ignore_ascii_case(ARCHIVED_STATUS))
    }
}

/// Read-only union of all reference inventory rows, in load order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceStore {
    records: Vec<ReferenceRecord>,
    by_identifier: BTreeMap<String, Vec<usize>>,
}

impl ReferenceStore {
    #[must_use]
    pub fn new(records: Vec<ReferenceRecord>) -> Self {
        let mut by_identifier: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            by_identifier.entry(record.identifier.clone()).or_default().push(index);
        }
        Self { records, by_identifier }
    }

    /// All rows whose identifier equals `identifier` exactly, in load order.
    /// The first row is authoritative for classification; the full set is
    /// returned for audit display.
    #[must_use]
    pub fn lookup(&self, identifier: &str) -> Vec<&ReferenceRecord> {
        self.by_identifier
            .get(identifier)
            .map(|indices| indices.iter().map(|index| &self.records[*index]).collect())
            .unwrap_or_default()
    }

    /// Distinct non-blank identifiers, for summary display.
    #[must_use]
    pub fn unique_count(&self) -> usize {
        self.by_identifier.keys().filter(|identifier| !identifier.is_empty()).count()
    }

    #[must_use]
    pub fn records(&self) -> &[ReferenceRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Barcode acceptance policy. A missing or empty pattern disables format
/// validation; any non-empty normalized barcode is then accepted.
#[derive(Debug, Clone, Default)]
pub struct BarcodePolicy {
    pattern: Option<Regex>,
}

impl BarcodePolicy {
    /// # Errors
    /// Returns [`CoreError::InvalidPattern`] when the pattern does not
    /// compile.
    pub fn new(pattern: Option<&str>) -> Result<Self, CoreError> {
        let pattern = match pattern {
            Some(raw) if !raw.trim().is_empty() => {
                Some(Regex::new(raw).map_err(|err| CoreError::InvalidPattern {
                    pattern: raw.to_string(),
                    message: err.to_string(),
                })?)
            }
            _ => None,
        };
        Ok(Self { pattern })
    }

    /// The single normalization point for scanned input: trim surrounding
    /// whitespace, then ASCII-uppercase. Applied before storage and before
    /// duplicate comparison, never at call sites.
    #[must_use]
    pub fn normalize(raw: &str) -> String {
        raw.trim().to_ascii_uppercase()
    }

    #[must_use]
    pub fn is_match(&self, normalized: &str) -> bool {
        self.pattern.as_ref().map_or(true, |pattern| pattern.is_match(normalized))
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(Regex::as_str)
    }
}

/// One accepted scan. `attributes` is the snapshot of the first matching
/// reference row taken at insertion time; it is never recomputed when the
/// reference inventory changes later.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CampaignRecord {
    pub barcode: String,
    #[serde(with = "scan_time")]
    pub timestamp: OffsetDateTime,
    pub scan_building: String,
    pub scan_room: String,
    pub scan_location: String,
    pub category: Category,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// The active campaign: identifying metadata plus the ordered scan log.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CampaignState {
    id: CampaignId,
    building: String,
    room: String,
    location: String,
    records: Vec<CampaignRecord>,
}

impl CampaignState {
    /// Create an empty campaign with a freshly minted id.
    ///
    /// # Errors
    /// Returns [`CoreError::TimestampFormat`] when the id timestamp cannot
    /// be rendered.
    pub fn start(
        building: &str,
        room: &str,
        location: &str,
        now: OffsetDateTime,
    ) -> Result<Self, CoreError> {
        let id = CampaignId::mint(building, room, now)?;
        Ok(Self {
            id,
            building: building.to_string(),
            room: room.to_string(),
            location: location.to_string(),
            records: Vec::new(),
        })
    }

    /// Rebuild a campaign around previously persisted records, keeping the
    /// given id and recovering building/room from it.
    #[must_use]
    pub fn resume(id: CampaignId, records: Vec<CampaignRecord>) -> Self {
        let (building, room) = id.building_room();
        Self { id, building, room, location: String::new(), records }
    }

    #[must_use]
    pub fn id(&self) -> &CampaignId {
        &self.id
    }

    #[must_use]
    pub fn building(&self) -> &str {
        &self.building
    }

    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn records(&self) -> &[CampaignRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Linear scan over the log; campaigns are bounded by manual scanning
    /// throughput, so no index is kept.
    #[must_use]
    pub fn contains_barcode(&self, normalized: &str) -> bool {
        self.records.iter().any(|record| record.barcode == normalized)
    }

    /// The only mutation point for campaign data. Records are append-only;
    /// nothing else rewrites the log short of restart/copy/load replacing
    /// the whole state.
    pub fn append(&mut self, record: CampaignRecord) {
        self.records.push(record);
    }
}

/// A classified scan ready to append, plus every matching reference row for
/// audit display.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Classification {
    pub record: CampaignRecord,
    pub matches: Vec<ReferenceRecord>,
}

/// Classify one raw barcode against the campaign log and the reference
/// inventory. Pure: the caller appends the returned record.
///
/// Categories: no reference match is `not_found` with blank attributes; any
/// matching row with status `archived` (case-insensitive) makes the scan
/// `archived`; otherwise it is `active`, carrying the first matching row's
/// attributes.
///
/// # Errors
/// Returns a [`RejectReason`] for empty input, a pattern mismatch, or a
/// barcode already present in the campaign. None of these touch the state.
pub fn classify(
    raw_barcode: &str,
    state: &CampaignState,
    reference: &ReferenceStore,
    policy: &BarcodePolicy,
    timestamp: OffsetDateTime,
) -> Result<Classification, RejectReason> {
    let barcode = BarcodePolicy::normalize(raw_barcode);
    if barcode.is_empty() {
        return Err(RejectReason::EmptyBarcode);
    }
    if !policy.is_match(&barcode) {
        return Err(RejectReason::InvalidFormat);
    }
    if state.contains_barcode(&barcode) {
        return Err(RejectReason::Duplicate);
    }

    let matches = reference.lookup(&barcode);
    let category = if matches.is_empty() {
        Category::NotFound
    } else if matches.iter().any(|row| row.is_archived()) {
        Category::Archived
    } else {
        Category::Active
    };
    let attributes =
        matches.first().map(|row| row.attributes.clone()).unwrap_or_default();

    let record = CampaignRecord {
        barcode,
        timestamp: timestamp.replace_nanosecond(0).unwrap_or(timestamp),
        scan_building: state.building().to_string(),
        scan_room: state.room().to_string(),
        scan_location: state.location().to_string(),
        category,
        attributes,
    };

    Ok(Classification { record, matches: matches.into_iter().cloned().collect() })
}

/// Aggregate counts over one campaign, recomputed by full recount after
/// every accepted scan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CampaignStatistics {
    pub total: usize,
    pub active: usize,
    pub archived: usize,
    pub not_found: usize,
}

impl CampaignStatistics {
    #[must_use]
    pub fn recompute(records: &[CampaignRecord]) -> Self {
        let mut statistics = Self::default();
        for record in records {
            statistics.total += 1;
            match record.category {
                Category::Active => statistics.active += 1,
                Category::Archived => statistics.archived += 1,
                Category::NotFound => statistics.not_found += 1,
            }
        }
        statistics
    }

    #[must_use]
    pub fn count(self, category: Category) -> usize {
        match category {
            Category::Active => self.active,
            Category::Archived => self.archived,
            Category::NotFound => self.not_found,
        }
    }
}

/// Distinct attribute columns carrying a value in at least one record, in
/// sorted order. Used by the campaign file writer to decide the column set.
#[must_use]
pub fn attribute_columns(records: &[CampaignRecord]) -> Vec<String> {
    let mut columns = BTreeSet::new();
    for record in records {
        for (column, value) in &record.attributes {
            if !value.is_empty() {
                columns.insert(column.clone());
            }
        }
    }
    columns.into_iter().collect()
}

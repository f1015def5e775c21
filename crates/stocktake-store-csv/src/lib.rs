use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use stocktake_core::{
    attribute_columns, scan_time, CampaignId, CampaignRecord, CampaignState, CampaignStatistics,
    Category, ReferenceRecord, ReferenceStore, IDENTIFIER_COLUMN,
};
use time::OffsetDateTime;
use tracing::{info, warn};

const BASE_COLUMNS: [&str; 6] =
    ["barcode", "timestamp", "scan_building", "scan_room", "scan_location", "category"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("campaign not found: {0}")]
    CampaignNotFound(CampaignId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a reference inventory load. Malformed source files are
/// skipped, never fatal; the counts let callers report partial loads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReferenceLoadReport {
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub rows: usize,
}

/// Union every `*.csv` file in `dir` into one reference store, in file-name
/// order. A missing directory yields an empty store.
///
/// # Errors
/// Returns an error when the directory itself cannot be listed; individual
/// unreadable files are skipped and counted in the report.
pub fn load_reference_inventory(
    dir: &Path,
) -> Result<(ReferenceStore, ReferenceLoadReport), StoreError> {
    let mut records = Vec::new();
    let mut report = ReferenceLoadReport::default();

    if dir.exists() {
        for path in csv_files_in(dir)? {
            match read_reference_file(&path) {
                Ok(mut rows) => {
                    report.files_loaded += 1;
                    report.rows += rows.len();
                    records.append(&mut rows);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable reference file");
                    report.files_skipped += 1;
                }
            }
        }
    }

    info!(
        rows = report.rows,
        files = report.files_loaded,
        skipped = report.files_skipped,
        "reference inventory loaded"
    );
    Ok((ReferenceStore::new(records), report))
}

fn read_reference_file(path: &Path) -> Result<Vec<ReferenceRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open reference file {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let identifier_index = headers.iter().position(|header| header == IDENTIFIER_COLUMN);

    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("malformed row in {}", path.display()))?;
        let mut identifier = String::new();
        let mut attributes = BTreeMap::new();
        for (index, value) in row.iter().enumerate() {
            if Some(index) == identifier_index {
                identifier = value.to_string();
                continue;
            }
            if value.is_empty() {
                continue;
            }
            let Some(column) = headers.get(index) else {
                continue;
            };
            attributes.insert(column.to_string(), value.to_string());
        }
        rows.push(ReferenceRecord { identifier, attributes });
    }
    Ok(rows)
}

/// Summary row for campaign history browsing.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CampaignSummary {
    pub campaign_id: CampaignId,
    pub statistics: CampaignStatistics,
}

/// Per-campaign CSV persistence: one `<campaign_id>.csv` per campaign under
/// one directory, whole-file overwrite on every save.
#[derive(Debug, Clone)]
pub struct CampaignStore {
    dir: PathBuf,
}

impl CampaignStore {
    /// # Errors
    /// Returns an error when the campaigns directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create campaigns directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn campaign_file_path(&self, id: &CampaignId) -> PathBuf {
        self.dir.join(format!("{id}.csv"))
    }

    /// Serialize the full record sequence, replacing any prior file. The
    /// column set is the base columns plus every attribute column carrying a
    /// value in at least one record. Written to a sibling temp file and
    /// renamed into place so readers never observe a partial file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written; the in-memory state
    /// is untouched either way.
    pub fn save(&self, state: &CampaignState) -> Result<(), StoreError> {
        let columns = attribute_columns(state.records());
        let final_path = self.campaign_file_path(state.id());
        let tmp_path = self.dir.join(format!("{}.csv.tmp", state.id()));

        let mut writer = csv::Writer::from_path(&tmp_path)
            .with_context(|| format!("failed to create campaign file {}", tmp_path.display()))?;

        let mut header: Vec<&str> = BASE_COLUMNS.to_vec();
        header.extend(columns.iter().map(String::as_str));
        writer
            .write_record(&header)
            .with_context(|| format!("failed to write header of {}", tmp_path.display()))?;

        for record in state.records() {
            let timestamp = scan_time::render(record.timestamp)
                .with_context(|| format!("unrenderable timestamp for scan {}", record.barcode))?;
            let mut row = vec![
                record.barcode.clone(),
                timestamp,
                record.scan_building.clone(),
                record.scan_room.clone(),
                record.scan_location.clone(),
                record.category.as_str().to_string(),
            ];
            for column in &columns {
                row.push(record.attributes.get(column).cloned().unwrap_or_default());
            }
            writer
                .write_record(&row)
                .with_context(|| format!("failed to write row to {}", tmp_path.display()))?;
        }

        writer
            .flush()
            .with_context(|| format!("failed to flush campaign file {}", tmp_path.display()))?;
        drop(writer);
        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!("failed to move campaign file into place at {}", final_path.display())
        })?;

        info!(campaign = %state.id(), records = state.len(), "campaign saved");
        Ok(())
    }

    /// # Errors
    /// Returns [`StoreError::CampaignNotFound`] when no file exists for the
    /// id, or an error describing the unreadable file.
    pub fn load(&self, id: &CampaignId) -> Result<Vec<CampaignRecord>, StoreError> {
        let path = self.campaign_file_path(id);
        if !path.exists() {
            return Err(StoreError::CampaignNotFound(id.clone()));
        }
        read_campaign_file(&path).map_err(StoreError::from)
    }

    /// Every readable campaign file summarized, newest id first. Unreadable
    /// files are skipped with a warning.
    ///
    /// # Errors
    /// Returns an error when the campaigns directory cannot be listed.
    pub fn list(&self) -> Result<Vec<CampaignSummary>, StoreError> {
        let mut summaries = Vec::new();
        if !self.dir.exists() {
            return Ok(summaries);
        }

        for path in csv_files_in(&self.dir)? {
            let Some(stem) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            match read_campaign_file(&path) {
                Ok(records) => summaries.push(CampaignSummary {
                    campaign_id: CampaignId::new(stem),
                    statistics: CampaignStatistics::recompute(&records),
                }),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable campaign file");
                }
            }
        }

        summaries.sort_by(|lhs, rhs| rhs.campaign_id.cmp(&lhs.campaign_id));
        Ok(summaries)
    }

    /// Resume a persisted campaign in place: same id, full record sequence,
    /// building/room recovered from the id.
    ///
    /// # Errors
    /// Returns [`StoreError::CampaignNotFound`] when no file exists for the
    /// id.
    pub fn restart(&self, id: &CampaignId) -> Result<CampaignState, StoreError> {
        let records = self.load(id)?;
        Ok(CampaignState::resume(id.clone(), records))
    }

    /// Clone a persisted campaign into a fresh one: new id minted from the
    /// parsed building/room and `now`, records preserved, new file written.
    ///
    /// # Errors
    /// Returns [`StoreError::CampaignNotFound`] for an unknown source id, or
    /// an error when the clone cannot be persisted.
    pub fn copy(&self, id: &CampaignId, now: OffsetDateTime) -> Result<CampaignState, StoreError> {
        let records = self.load(id)?;
        let (building, room) = id.building_room();
        let new_id = CampaignId::mint(&building, &room, now)
            .map_err(|err| anyhow!("failed to mint campaign id: {err}"))?;
        let state = CampaignState::resume(new_id, records);
        self.save(&state)?;
        Ok(state)
    }
}

fn read_campaign_file(path: &Path) -> Result<Vec<CampaignRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open campaign file {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();

    let position = |name: &str| {
        headers.iter().position(|header| header == name).ok_or_else(|| {
            anyhow!("campaign file {} is missing the `{name}` column", path.display())
        })
    };
    let barcode_index = position("barcode")?;
    let timestamp_index = position("timestamp")?;
    let building_index = position("scan_building")?;
    let room_index = position("scan_room")?;
    let location_index = position("scan_location")?;
    let category_index = position("category")?;
    let base_indices =
        [barcode_index, timestamp_index, building_index, room_index, location_index, category_index];

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("malformed row in {}", path.display()))?;
        let field = |index: usize| row.get(index).unwrap_or_default();

        let raw_timestamp = field(timestamp_index);
        let timestamp = scan_time::parse(raw_timestamp).with_context(|| {
            format!("invalid timestamp `{raw_timestamp}` in {}", path.display())
        })?;
        let raw_category = field(category_index);
        let category = Category::parse(raw_category).ok_or_else(|| {
            anyhow!("unknown category `{raw_category}` in {}", path.display())
        })?;

        let mut attributes = BTreeMap::new();
        for (index, value) in row.iter().enumerate() {
            if base_indices.contains(&index) || value.is_empty() {
                continue;
            }
            let Some(column) = headers.get(index) else {
                continue;
            };
            attributes.insert(column.to_string(), value.to_string());
        }

        records.push(CampaignRecord {
            barcode: field(barcode_index).to_string(),
            timestamp,
            scan_building: field(building_index).to_string(),
            scan_room: field(room_index).to_string(),
            scan_location: field(location_index).to_string(),
            category,
            attributes,
        });
    }
    Ok(records)
}

fn csv_files_in(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry of {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(OsStr::to_str) == Some("csv") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

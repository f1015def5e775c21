use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stocktake_core::{
    classify, BarcodePolicy, CampaignId, CampaignRecord, CampaignState, CampaignStatistics,
    Classification, CoreError, ReferenceRecord, ReferenceStore, RejectReason,
};
use stocktake_store_csv::{
    load_reference_inventory, CampaignStore, CampaignSummary, ReferenceLoadReport, StoreError,
};
use time::OffsetDateTime;
use tracing::{error, info};

/// Pattern written into a freshly created config file.
pub const DEFAULT_BARCODE_PATTERN: &str = r"^[A-Za-z]?\d{4,6}$";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no active campaign; start or load a campaign first")]
    NoActiveCampaign,
    #[error("building and room are required to start a campaign")]
    MissingMetadata,
    #[error(transparent)]
    Domain(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The configuration surface consumed by the engine: a single barcode
/// validation pattern. An empty pattern disables format validation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineConfig {
    pub barcode_regex: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { barcode_regex: DEFAULT_BARCODE_PATTERN.to_string() }
    }
}

impl EngineConfig {
    /// Read the JSON config file, writing the default first when none
    /// exists.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or created.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!(file = %path.display(), "created default config file");
            return Ok(config);
        }

        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(file = %path.display(), "loaded config file");
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create config directory {}", parent.display())
                })?;
            }
        }
        let body = serde_json::to_vec_pretty(self).context("failed to serialize config")?;
        fs::write(path, body)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    /// # Errors
    /// Returns [`CoreError::InvalidPattern`] when the configured pattern
    /// does not compile.
    pub fn barcode_policy(&self) -> Result<BarcodePolicy, CoreError> {
        BarcodePolicy::new(Some(self.barcode_regex.as_str()))
    }
}

/// Reference inventory figures for the summary display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReferenceSummary {
    pub unique_identifiers: usize,
    pub rows: usize,
    pub files_loaded: usize,
    pub files_skipped: usize,
}

/// An accepted scan: the stored record, every matching reference row for
/// display, and the statistics snapshot taken after the append. When the
/// campaign file could not be written the append still stands and the
/// failure is carried in `persist_error`.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ScanAccepted {
    pub record: CampaignRecord,
    pub matches: Vec<ReferenceRecord>,
    pub statistics: CampaignStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ScanRejected {
    pub reason: RejectReason,
    pub statistics: CampaignStatistics,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    Accepted(ScanAccepted),
    Rejected(ScanRejected),
}

/// The engine: reference store, campaign store, barcode policy, and the one
/// active campaign of this session. All operations are synchronous; each
/// scan runs classify, append, persist, and recompute to completion before
/// the next is accepted.
#[derive(Debug)]
pub struct ScanEngine {
    reference: ReferenceStore,
    reference_report: ReferenceLoadReport,
    campaigns: CampaignStore,
    policy: BarcodePolicy,
    active: Option<CampaignState>,
}

impl ScanEngine {
    /// Load the reference inventory from `data_dir` and open the campaign
    /// store at `campaigns_dir`.
    ///
    /// # Errors
    /// Returns an error when either directory cannot be used; malformed
    /// individual reference files only reduce the loaded set.
    pub fn open(
        data_dir: &Path,
        campaigns_dir: &Path,
        policy: BarcodePolicy,
    ) -> Result<Self, EngineError> {
        let (reference, reference_report) = load_reference_inventory(data_dir)?;
        let campaigns = CampaignStore::open(campaigns_dir)?;
        Ok(Self { reference, reference_report, campaigns, policy, active: None })
    }

    /// Begin a fresh, empty campaign and persist its (empty) file. A failed
    /// initial write is logged and does not abort the campaign; the next
    /// accepted scan retries the write.
    ///
    /// # Errors
    /// Returns [`EngineError::MissingMetadata`] when building or room is
    /// blank.
    pub fn start_campaign(
        &mut self,
        building: &str,
        room: &str,
        location: &str,
    ) -> Result<&CampaignState, EngineError> {
        let building = building.trim();
        let room = room.trim();
        if building.is_empty() || room.is_empty() {
            return Err(EngineError::MissingMetadata);
        }

        let state =
            CampaignState::start(building, room, location.trim(), OffsetDateTime::now_utc())?;
        if let Err(err) = self.campaigns.save(&state) {
            error!(campaign = %state.id(), error = %err, "failed to persist new campaign");
        }
        Ok(self.active.insert(state))
    }

    /// Classify one raw barcode against the active campaign, append on
    /// acceptance, persist, and recompute statistics. Rejections leave the
    /// campaign and its file untouched. A failed persist never rolls back
    /// the in-memory append; the scan is only missing from durable storage
    /// until the next successful save.
    ///
    /// # Errors
    /// Returns [`EngineError::NoActiveCampaign`] when no campaign is
    /// active. Rejections are part of the `Ok` outcome, not errors.
    pub fn scan(&mut self, raw_barcode: &str) -> Result<ScanOutcome, EngineError> {
        let Some(state) = self.active.as_mut() else {
            return Err(EngineError::NoActiveCampaign);
        };

        match classify(raw_barcode, state, &self.reference, &self.policy, OffsetDateTime::now_utc())
        {
            Err(reason) => Ok(ScanOutcome::Rejected(ScanRejected {
                reason,
                statistics: CampaignStatistics::recompute(state.records()),
            })),
            Ok(Classification { record, matches }) => {
                state.append(record.clone());
                let statistics = CampaignStatistics::recompute(state.records());
                let persist_error = match self.campaigns.save(state) {
                    Ok(()) => None,
                    Err(err) => {
                        error!(
                            campaign = %state.id(),
                            error = %err,
                            "failed to persist scan; keeping in-memory record"
                        );
                        Some(err.to_string())
                    }
                };
                Ok(ScanOutcome::Accepted(ScanAccepted { record, matches, statistics, persist_error }))
            }
        }
    }

    /// Resume a persisted campaign as the active one, keeping its id.
    ///
    /// # Errors
    /// Returns [`StoreError::CampaignNotFound`] for an unknown id.
    pub fn resume_campaign(&mut self, id: &CampaignId) -> Result<&CampaignState, EngineError> {
        let state = self.campaigns.restart(id)?;
        Ok(self.active.insert(state))
    }

    /// Clone a persisted campaign into a fresh id and make the clone
    /// active.
    ///
    /// # Errors
    /// Returns [`StoreError::CampaignNotFound`] for an unknown id, or the
    /// failure that kept the clone from being persisted.
    pub fn copy_campaign(&mut self, id: &CampaignId) -> Result<&CampaignState, EngineError> {
        let state = self.campaigns.copy(id, OffsetDateTime::now_utc())?;
        Ok(self.active.insert(state))
    }

    /// # Errors
    /// Returns [`EngineError::NoActiveCampaign`] when no campaign is
    /// active.
    pub fn statistics(&self) -> Result<CampaignStatistics, EngineError> {
        let state = self.active.as_ref().ok_or(EngineError::NoActiveCampaign)?;
        Ok(CampaignStatistics::recompute(state.records()))
    }

    #[must_use]
    pub fn active(&self) -> Option<&CampaignState> {
        self.active.as_ref()
    }

    /// Scanned records of the active campaign, for display.
    ///
    /// # Errors
    /// Returns [`EngineError::NoActiveCampaign`] when no campaign is
    /// active.
    pub fn records(&self) -> Result<&[CampaignRecord], EngineError> {
        let state = self.active.as_ref().ok_or(EngineError::NoActiveCampaign)?;
        Ok(state.records())
    }

    /// # Errors
    /// Returns an error when the campaigns directory cannot be listed.
    pub fn list_campaigns(&self) -> Result<Vec<CampaignSummary>, EngineError> {
        self.campaigns.list().map_err(EngineError::from)
    }

    /// Records of any persisted campaign, without touching the active one.
    ///
    /// # Errors
    /// Returns [`StoreError::CampaignNotFound`] for an unknown id.
    pub fn campaign_records(&self, id: &CampaignId) -> Result<Vec<CampaignRecord>, EngineError> {
        self.campaigns.load(id).map_err(EngineError::from)
    }

    #[must_use]
    pub fn campaign_file_path(&self, id: &CampaignId) -> PathBuf {
        self.campaigns.campaign_file_path(id)
    }

    #[must_use]
    pub fn reference(&self) -> &ReferenceStore {
        &self.reference
    }

    #[must_use]
    pub fn reference_summary(&self) -> ReferenceSummary {
        ReferenceSummary {
            unique_identifiers: self.reference.unique_count(),
            rows: self.reference.len(),
            files_loaded: self.reference_report.files_loaded,
            files_skipped: self.reference_report.files_skipped,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &BarcodePolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use stocktake_core::Category;

    use super::*;

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
        dir
    }

    fn write_reference_fixture(data_dir: &Path) {
        let body = "Barcode ID - Container,Status - Container,Owner Name - Container\n\
                    A1234,Active,Lin\n\
                    C7777,Archived,Osei\n";
        fs::write(data_dir.join("inventory.csv"), body)
            .unwrap_or_else(|err| panic!("failed to write reference fixture: {err}"));
    }

    fn open_engine(root: &Path, policy: BarcodePolicy) -> ScanEngine {
        match ScanEngine::open(&root.join("data"), &root.join("campaigns"), policy) {
            Ok(engine) => engine,
            Err(err) => panic!("engine should open under {}: {err}", root.display()),
        }
    }

    fn engine_with_reference(root: &Path) -> ScanEngine {
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir)
            .unwrap_or_else(|err| panic!("failed to create data dir: {err}"));
        write_reference_fixture(&data_dir);
        open_engine(root, BarcodePolicy::default())
    }

    fn start(engine: &mut ScanEngine) -> CampaignId {
        match engine.start_campaign("B12", "214", "Shelf 3") {
            Ok(state) => state.id().clone(),
            Err(err) => panic!("campaign should start: {err}"),
        }
    }

    fn scan(engine: &mut ScanEngine, raw: &str) -> ScanOutcome {
        match engine.scan(raw) {
            Ok(outcome) => outcome,
            Err(err) => panic!("scan of `{raw}` should run: {err}"),
        }
    }

    #[test]
    fn scan_flow_classifies_appends_and_persists() {
        let root = unique_temp_dir("stocktake-engine-flow");
        let mut engine = engine_with_reference(&root);
        let id = start(&mut engine);

        let outcome = scan(&mut engine, "  a1234 ");
        let ScanOutcome::Accepted(accepted) = outcome else {
            panic!("first scan should be accepted: {outcome:?}");
        };
        assert_eq!(accepted.record.barcode, "A1234");
        assert_eq!(accepted.record.category, Category::Active);
        assert_eq!(accepted.matches.len(), 1);
        assert_eq!(accepted.statistics.total, 1);
        assert!(accepted.persist_error.is_none());

        let outcome = scan(&mut engine, "A1234");
        let ScanOutcome::Rejected(rejected) = outcome else {
            panic!("duplicate scan should be rejected: {outcome:?}");
        };
        assert_eq!(rejected.reason, RejectReason::Duplicate);
        assert_eq!(rejected.statistics.total, 1);

        let outcome = scan(&mut engine, "C7777");
        let ScanOutcome::Accepted(accepted) = outcome else {
            panic!("archived scan should be accepted: {outcome:?}");
        };
        assert_eq!(accepted.record.category, Category::Archived);

        let records = match engine.records() {
            Ok(records) => records,
            Err(err) => panic!("active campaign records should list: {err}"),
        };
        assert_eq!(records.len(), 2);

        // The file tracks the in-memory sequence after every accepted scan.
        let persisted = match engine.campaign_records(&id) {
            Ok(records) => records,
            Err(err) => panic!("persisted campaign should load: {err}"),
        };
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].barcode, "A1234");
        assert_eq!(persisted[1].barcode, "C7777");
    }

    #[test]
    fn scan_without_campaign_is_an_error() {
        let root = unique_temp_dir("stocktake-engine-noactive");
        let mut engine = open_engine(&root, BarcodePolicy::default());

        assert!(matches!(engine.scan("A1234"), Err(EngineError::NoActiveCampaign)));
        assert!(matches!(engine.statistics(), Err(EngineError::NoActiveCampaign)));
    }

    #[test]
    fn blank_building_or_room_is_rejected() {
        let root = unique_temp_dir("stocktake-engine-metadata");
        let mut engine = open_engine(&root, BarcodePolicy::default());

        assert!(matches!(
            engine.start_campaign("  ", "214", ""),
            Err(EngineError::MissingMetadata)
        ));
        assert!(matches!(
            engine.start_campaign("B12", "", ""),
            Err(EngineError::MissingMetadata)
        ));
    }

    #[test]
    fn failed_persist_keeps_the_in_memory_append() {
        let root = unique_temp_dir("stocktake-engine-persistfail");
        let mut engine = open_engine(&root, BarcodePolicy::default());
        let id = start(&mut engine);

        // Occupy the writer's temp path with a directory so the save fails.
        let tmp_path = root.join("campaigns").join(format!("{id}.csv.tmp"));
        fs::create_dir_all(&tmp_path)
            .unwrap_or_else(|err| panic!("failed to block temp path: {err}"));

        let outcome = scan(&mut engine, "A1234");
        let ScanOutcome::Accepted(accepted) = outcome else {
            panic!("scan should still be accepted: {outcome:?}");
        };
        assert!(accepted.persist_error.is_some());
        assert_eq!(accepted.statistics.total, 1);

        // Scanning continues; the next save would retry the whole file.
        let statistics = match engine.statistics() {
            Ok(statistics) => statistics,
            Err(err) => panic!("statistics should be available: {err}"),
        };
        assert_eq!(statistics.total, 1);
    }

    #[test]
    fn resume_and_copy_switch_the_active_campaign() {
        let root = unique_temp_dir("stocktake-engine-resume");
        let mut engine = engine_with_reference(&root);
        let id = start(&mut engine);
        let ScanOutcome::Accepted(_) = scan(&mut engine, "A1234") else {
            panic!("seed scan should be accepted");
        };

        let resumed_id = match engine.resume_campaign(&id) {
            Ok(state) => {
                assert_eq!(state.records().len(), 1);
                state.id().clone()
            }
            Err(err) => panic!("campaign should resume: {err}"),
        };
        assert_eq!(resumed_id, id);

        // A resumed campaign still rejects barcodes it already holds.
        let outcome = scan(&mut engine, "a1234");
        assert!(matches!(
            outcome,
            ScanOutcome::Rejected(ScanRejected { reason: RejectReason::Duplicate, .. })
        ));

        match engine.copy_campaign(&id) {
            Ok(state) => {
                assert_eq!(state.records().len(), 1);
                assert!(state.id().as_str().starts_with("B12_214_"));
            }
            Err(err) => panic!("campaign should copy: {err}"),
        }

        let unknown = CampaignId::new("B9_R9_000101-000000");
        assert!(matches!(
            engine.resume_campaign(&unknown),
            Err(EngineError::Store(StoreError::CampaignNotFound(_)))
        ));
    }

    #[test]
    fn config_is_created_with_the_default_pattern() {
        let root = unique_temp_dir("stocktake-engine-config");
        let path = root.join("config.json");

        let created = match EngineConfig::load_or_create(&path) {
            Ok(config) => config,
            Err(err) => panic!("config should be created: {err}"),
        };
        assert_eq!(created.barcode_regex, DEFAULT_BARCODE_PATTERN);
        assert!(path.exists());

        let reloaded = match EngineConfig::load_or_create(&path) {
            Ok(config) => config,
            Err(err) => panic!("config should reload: {err}"),
        };
        assert_eq!(reloaded, created);
    }

    #[test]
    fn empty_configured_pattern_disables_validation() {
        let root = unique_temp_dir("stocktake-engine-nopattern");
        let config = EngineConfig { barcode_regex: String::new() };
        let policy = match config.barcode_policy() {
            Ok(policy) => policy,
            Err(err) => panic!("empty pattern should build a policy: {err}"),
        };
        let mut engine = open_engine(&root, policy);
        start(&mut engine);

        let outcome = scan(&mut engine, "weird-99!!");
        let ScanOutcome::Accepted(accepted) = outcome else {
            panic!("unvalidated scan should be accepted: {outcome:?}");
        };
        assert_eq!(accepted.record.barcode, "WEIRD-99!!");
        assert_eq!(accepted.record.category, Category::NotFound);
    }

    #[test]
    fn configured_pattern_gates_scans() {
        let root = unique_temp_dir("stocktake-engine-pattern");
        let config = EngineConfig::default();
        let policy = match config.barcode_policy() {
            Ok(policy) => policy,
            Err(err) => panic!("default pattern should compile: {err}"),
        };
        let mut engine = open_engine(&root, policy);
        start(&mut engine);

        let outcome = scan(&mut engine, "12");
        assert!(matches!(
            outcome,
            ScanOutcome::Rejected(ScanRejected { reason: RejectReason::InvalidFormat, .. })
        ));

        let outcome = scan(&mut engine, "A12345");
        assert!(matches!(outcome, ScanOutcome::Accepted(_)));
    }
}

//! Batch reconciliation pipeline: extract every source over a closed input
//! snapshot, unify intermediate records into canonical listings, dedupe the
//! event histories, and publish snapshots plus a run report.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use lotline_core::{
    BuildingKey, Counterparties, EventType, IntermediateRecord, ListingStatus, ListingType,
    MatchMethod, Rejection,
};
use lotline_extract::{extractor_for_source, RecordExtractor, SourceKind};
use lotline_refindex::{MatcherConfig, ReferenceIndex};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotline-pipeline";

// ── Source registry + merge policy ──────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub policy: MergePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub dataset: PathBuf,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Tolerance for treating two event dates as the same occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateTolerance {
    SameMonth,
    WithinDays(u16),
}

/// Merge-decision knobs. Observed against the source feeds rather than
/// derived, so they live in `sources.yaml` where they can be re-tuned
/// against ground-truth pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    pub date_tolerance: DateTolerance,
    pub price_tolerance: f64,
    pub fuzzy_threshold: f64,
    pub ambiguity_margin: f64,
    /// Fixed total order used for final tie-breaks; never arrival order.
    pub source_priority: Vec<String>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            date_tolerance: DateTolerance::SameMonth,
            price_tolerance: 0.10,
            fuzzy_threshold: 0.82,
            ambiguity_margin: 0.04,
            source_priority: vec![
                "registry".to_string(),
                "mls".to_string(),
                "archive".to_string(),
            ],
        }
    }
}

impl MergePolicy {
    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            fuzzy_threshold: self.fuzzy_threshold,
            ambiguity_margin: self.ambiguity_margin,
        }
    }

    fn dates_within(&self, a: NaiveDate, b: NaiveDate) -> bool {
        match self.date_tolerance {
            DateTolerance::SameMonth => a.year() == b.year() && a.month() == b.month(),
            DateTolerance::WithinDays(days) => {
                a.signed_duration_since(b).num_days().abs() <= i64::from(days)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub registry_snapshot: PathBuf,
    pub bin_bridge: PathBuf,
    pub reports_dir: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("LOTLINE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            registry_snapshot: std::env::var("LOTLINE_REGISTRY_SNAPSHOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/registry_snapshot.jsonl")),
            bin_bridge: std::env::var("LOTLINE_BIN_BRIDGE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/bin_bridge.jsonl")),
            reports_dir: std::env::var("LOTLINE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

// ── Unified output model ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEvent {
    pub event_type: EventType,
    pub event_date: NaiveDate,
    pub price: Option<i64>,
    /// Winning source under the tie-break policy.
    pub source: String,
    pub source_record_id: String,
    pub corroborating_sources: BTreeSet<String>,
    pub match_confidence: f64,
    pub conflicting_price: bool,
    pub counterparties: Option<Counterparties>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedListing {
    /// Deterministic v5 id over the grouping key; identical across re-runs.
    pub listing_id: Uuid,
    pub building_key: BuildingKey,
    pub unit_label: Option<String>,
    pub listing_type: ListingType,
    pub contributing_sources: BTreeSet<String>,
    pub status: ListingStatus,
    pub best_price: Option<i64>,
    pub first_event_date: NaiveDate,
    pub last_event_date: NaiveDate,
    pub confidence: f64,
    pub events: Vec<PriceEvent>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct UnifiedSet {
    pub listings: Vec<UnifiedListing>,
    /// Records with no resolved key, retained for audit; never grouped.
    pub unmatched: Vec<IntermediateRecord>,
    pub merged_event_count: usize,
    pub conflict_count: usize,
}

// ── Unifier ─────────────────────────────────────────────────────────────

/// Pure cross-source merge: a function from the complete intermediate
/// record set to the unified set. Records are sorted into a canonical
/// order before grouping, so the output never depends on arrival order,
/// thread scheduling, or wall-clock time.
pub struct Unifier {
    policy: MergePolicy,
    kinds: BTreeMap<String, SourceKind>,
}

impl Unifier {
    pub fn new(policy: MergePolicy, kinds: BTreeMap<String, SourceKind>) -> Self {
        Self { policy, kinds }
    }

    pub fn unify(&self, mut records: Vec<IntermediateRecord>) -> UnifiedSet {
        records.sort_by(|a, b| {
            self.priority_rank(&a.source)
                .cmp(&self.priority_rank(&b.source))
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.source_record_id.cmp(&b.source_record_id))
                .then_with(|| a.event_date.cmp(&b.event_date))
                .then_with(|| a.event_type.cmp(&b.event_type))
                .then_with(|| a.price.cmp(&b.price))
        });

        let mut unmatched = Vec::new();
        let mut groups: BTreeMap<(BuildingKey, Option<String>, ListingType), Vec<IntermediateRecord>> =
            BTreeMap::new();
        for record in records {
            match record.resolved_key {
                Some(key) => groups
                    .entry((key, record.unit_label.clone(), record.listing_type))
                    .or_default()
                    .push(record),
                None => unmatched.push(record),
            }
        }

        let mut set = UnifiedSet::default();
        for ((key, unit_label, listing_type), group) in groups {
            let listing = self.build_listing(key, unit_label, listing_type, &group, &mut set);
            set.listings.push(listing);
        }
        set.unmatched = unmatched;
        set
    }

    fn build_listing(
        &self,
        building_key: BuildingKey,
        unit_label: Option<String>,
        listing_type: ListingType,
        group: &[IntermediateRecord],
        set: &mut UnifiedSet,
    ) -> UnifiedListing {
        let mut events: Vec<PriceEvent> = Vec::new();
        for record in group {
            let mut merged = false;
            let mut conflicted = false;
            for event in events.iter_mut() {
                if event.event_type != record.event_type {
                    continue;
                }
                if !self.policy.dates_within(event.event_date, record.event_date) {
                    continue;
                }
                if price_compatible(event.price, record.price, self.policy.price_tolerance) {
                    event.corroborating_sources.insert(record.source.clone());
                    if self.record_beats_event(record, event) {
                        event.event_date = record.event_date;
                        event.price = record.price.or(event.price);
                        event.source = record.source.clone();
                        event.source_record_id = record.source_record_id.clone();
                        event.match_confidence = record.match_confidence;
                        if record.counterparties.is_some() {
                            event.counterparties = record.counterparties.clone();
                        }
                    } else if event.price.is_none() {
                        event.price = record.price;
                    }
                    set.merged_event_count += 1;
                    merged = true;
                    break;
                }
                // Same occurrence shape but prices far apart: a genuine
                // second transaction or a matching error. Keep both,
                // flag both.
                event.conflicting_price = true;
                conflicted = true;
            }
            if !merged {
                if conflicted {
                    set.conflict_count += 1;
                }
                events.push(PriceEvent {
                    event_type: record.event_type,
                    event_date: record.event_date,
                    price: record.price,
                    source: record.source.clone(),
                    source_record_id: record.source_record_id.clone(),
                    corroborating_sources: BTreeSet::from([record.source.clone()]),
                    match_confidence: record.match_confidence,
                    conflicting_price: conflicted,
                    counterparties: record.counterparties.clone(),
                });
            }
        }

        events.sort_by(|a, b| {
            a.event_date
                .cmp(&b.event_date)
                .then_with(|| a.event_type.cmp(&b.event_type))
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.price.cmp(&b.price))
        });

        let contributing_sources: BTreeSet<String> =
            group.iter().map(|r| r.source.clone()).collect();
        let confidence = group
            .iter()
            .map(|r| r.match_confidence)
            .fold(0.0_f64, f64::max);
        let status = group
            .iter()
            .map(|r| r.status)
            .max_by_key(|s| status_progression(*s))
            .unwrap_or(ListingStatus::Active);

        let first_event_date = events.iter().map(|e| e.event_date).min().unwrap_or_default();
        let last_event_date = events.iter().map(|e| e.event_date).max().unwrap_or_default();

        let mut last_closed = None;
        let mut last_asked = None;
        for event in &events {
            let Some(price) = event.price else { continue };
            match event.event_type {
                EventType::Closed => last_closed = Some(price),
                EventType::Listed | EventType::PriceChanged | EventType::Relisted => {
                    last_asked = Some(price)
                }
                EventType::Delisted => {}
            }
        }
        let best_price = last_closed.or(last_asked);

        let id_material = format!(
            "{}|{}|{}",
            building_key,
            unit_label.as_deref().unwrap_or(""),
            listing_type
        );
        UnifiedListing {
            listing_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, id_material.as_bytes()),
            building_key,
            unit_label,
            listing_type,
            contributing_sources,
            status,
            best_price,
            first_event_date,
            last_event_date,
            confidence,
            events,
        }
    }

    /// Tie-break when two sources describe one occurrence: higher match
    /// confidence first; then source authority (the recording registry
    /// outranks brokerage feeds on transaction facts, brokerage feeds
    /// outrank the registry on listing facts); then the fixed source
    /// order from the policy.
    fn record_beats_event(&self, record: &IntermediateRecord, event: &PriceEvent) -> bool {
        match record.match_confidence.total_cmp(&event.match_confidence) {
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => {}
        }
        let record_authority = self.authority_score(record.event_type, &record.source);
        let event_authority = self.authority_score(event.event_type, &event.source);
        if record_authority != event_authority {
            return record_authority < event_authority;
        }
        let record_rank = self.priority_rank(&record.source);
        let event_rank = self.priority_rank(&event.source);
        if record_rank != event_rank {
            return record_rank < event_rank;
        }
        (record.source.as_str(), record.source_record_id.as_str())
            < (event.source.as_str(), event.source_record_id.as_str())
    }

    fn authority_score(&self, event_type: EventType, source: &str) -> u8 {
        let is_registry = matches!(self.kinds.get(source), Some(SourceKind::Registry));
        match event_type {
            EventType::Closed => u8::from(!is_registry),
            _ => u8::from(is_registry),
        }
    }

    fn priority_rank(&self, source: &str) -> usize {
        self.policy
            .source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.policy.source_priority.len())
    }
}

fn status_progression(status: ListingStatus) -> u8 {
    match status {
        ListingStatus::Active => 0,
        ListingStatus::Withdrawn => 1,
        ListingStatus::Expired => 2,
        ListingStatus::Pending => 3,
        ListingStatus::Closed => 4,
    }
}

fn price_compatible(a: Option<i64>, b: Option<i64>, tolerance: f64) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            let denominator = a.max(b).max(1) as f64;
            ((a - b).abs() as f64) / denominator <= tolerance
        }
        _ => true,
    }
}

/// Drop exact re-scrape duplicates from one listing's history: identical
/// (event_type, day, price, source). Returns the number removed.
pub fn dedup_events(listing: &mut UnifiedListing) -> usize {
    let before = listing.events.len();
    let mut seen = BTreeSet::new();
    listing.events.retain(|event| {
        seen.insert((
            event.event_type,
            event.event_date,
            event.price,
            event.source.clone(),
        ))
    });
    before - listing.events.len()
}

// ── Run summary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub rows: usize,
    pub records: usize,
    pub filtered_rows: usize,
    pub rejected: usize,
    pub resolved: BTreeMap<String, usize>,
    pub ambiguous: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceCounts>,
    pub listings: usize,
    pub unmatched: usize,
    pub merged_events: usize,
    pub conflicting_events: usize,
    pub deduped_events: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

struct SourceBatch {
    source_id: String,
    counts: SourceCounts,
    records: Vec<IntermediateRecord>,
    rejections: Vec<Rejection>,
}

// ── Pipeline ────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let registry = self.load_source_registry().await?;
        let policy = registry.policy.clone();
        let matcher_config = policy.matcher_config();
        let kinds: BTreeMap<String, SourceKind> = registry
            .sources
            .iter()
            .map(|s| (s.source_id.clone(), s.kind))
            .collect();
        let enabled: Vec<SourceConfig> =
            registry.sources.into_iter().filter(|s| s.enabled).collect();

        // The matcher cannot function without the reference snapshot, so
        // this failure surfaces before any extraction starts.
        let snapshot_path = self.config.resolve(&self.config.registry_snapshot);
        let mut index = ReferenceIndex::from_snapshot_path(&snapshot_path)
            .context("reference index unavailable")?;
        index.load_bin_bridge(self.config.resolve(&self.config.bin_bridge))?;
        let index = Arc::new(index);

        // Extraction is embarrassingly parallel: no extractor reads another
        // source's output, and the index is read-shared.
        let mut handles = Vec::with_capacity(enabled.len());
        for source in &enabled {
            let extractor = extractor_for_source(&source.source_id)
                .with_context(|| format!("no extractor registered for {}", source.source_id))?;
            let dataset = self.config.resolve(&source.dataset);
            let index = Arc::clone(&index);
            let source_id = source.source_id.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                extract_source(source_id, extractor, dataset, index, matcher_config)
            }));
        }

        let mut sources = BTreeMap::new();
        let mut records = Vec::new();
        let mut rejections = Vec::new();
        for handle in handles {
            let batch = handle.await.context("extraction worker panicked")??;
            info!(
                source = %batch.source_id,
                rows = batch.counts.rows,
                records = batch.counts.records,
                rejected = batch.counts.rejected,
                "source extracted"
            );
            sources.insert(batch.source_id.clone(), batch.counts);
            records.extend(batch.records);
            rejections.extend(batch.rejections);
        }

        // Synchronization point: grouping decisions need the complete set.
        let unifier = Unifier::new(policy, kinds);
        let mut unified = unifier.unify(records);
        let mut deduped_events = 0;
        for listing in &mut unified.listings {
            deduped_events += dedup_events(listing);
        }
        info!(
            listings = unified.listings.len(),
            unmatched = unified.unmatched.len(),
            merged = unified.merged_event_count,
            conflicts = unified.conflict_count,
            deduped = deduped_events,
            "unification complete"
        );

        let reports_dir = self
            .config
            .resolve(&self.config.reports_dir)
            .join(run_id.to_string());
        let manifest_path = write_outputs(&reports_dir, &unified, &rejections).await?;

        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            sources,
            listings: unified.listings.len(),
            unmatched: unified.unmatched.len(),
            merged_events: unified.merged_event_count,
            conflicting_events: unified.conflict_count,
            deduped_events,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        write_summary(&reports_dir, &summary).await?;
        Ok(summary)
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    Pipeline::new(PipelineConfig::from_env()).run_once().await
}

fn extract_source(
    source_id: String,
    extractor: Box<dyn RecordExtractor>,
    dataset: PathBuf,
    index: Arc<ReferenceIndex>,
    matcher_config: MatcherConfig,
) -> Result<SourceBatch> {
    let text = std::fs::read_to_string(&dataset)
        .with_context(|| format!("reading dataset {}", dataset.display()))?;
    let mut counts = SourceCounts::default();
    let mut records = Vec::new();
    let mut rejections = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        counts.rows += 1;
        let row: serde_json::Value = match serde_json::from_str(line) {
            Ok(row) => row,
            Err(err) => {
                counts.rejected += 1;
                rejections.push(Rejection {
                    source: source_id.clone(),
                    source_record_id: format!("line-{}", line_no + 1),
                    reason: format!("invalid JSON: {err}"),
                });
                continue;
            }
        };
        let record_id = row_record_id(&row, line_no);
        match extractor.extract(&row, &index, &matcher_config) {
            Ok(extracted) if extracted.is_empty() => counts.filtered_rows += 1,
            Ok(extracted) => {
                for record in &extracted {
                    counts.records += 1;
                    match record.match_method {
                        MatchMethod::None => counts.unresolved += 1,
                        MatchMethod::Ambiguous => counts.ambiguous += 1,
                        method => {
                            *counts.resolved.entry(method.as_str().to_string()).or_default() += 1
                        }
                    }
                }
                records.extend(extracted);
            }
            Err(err) => {
                warn!(source = %source_id, record = %record_id, %err, "row rejected");
                counts.rejected += 1;
                rejections.push(Rejection {
                    source: source_id.clone(),
                    source_record_id: record_id,
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(SourceBatch {
        source_id,
        counts,
        records,
        rejections,
    })
}

fn row_record_id(row: &serde_json::Value, line_no: usize) -> String {
    ["document_id", "listing_id", "snapshot_id"]
        .iter()
        .find_map(|key| row.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("line-{}", line_no + 1))
}

// ── Reports + parquet snapshots ─────────────────────────────────────────

async fn write_outputs(
    reports_dir: &Path,
    unified: &UnifiedSet,
    rejections: &[Rejection],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let rejections_json =
        serde_json::to_vec_pretty(rejections).context("serializing rejections")?;
    fs::write(reports_dir.join("rejections.json"), rejections_json)
        .await
        .context("writing rejections.json")?;

    let unmatched_json =
        serde_json::to_vec_pretty(&unified.unmatched).context("serializing unmatched records")?;
    fs::write(reports_dir.join("unmatched.json"), unmatched_json)
        .await
        .context("writing unmatched.json")?;

    let listings_path = snapshot_dir.join("unified_listings.parquet");
    let events_path = snapshot_dir.join("price_events.parquet");
    let unmatched_path = snapshot_dir.join("unmatched.parquet");
    write_listings_parquet(&listings_path, &unified.listings)?;
    write_events_parquet(&events_path, &unified.listings)?;
    write_unmatched_parquet(&unmatched_path, &unified.unmatched)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("unified_listings", reports_dir, &listings_path)?,
            manifest_entry("price_events", reports_dir, &events_path)?,
            manifest_entry("unmatched", reports_dir, &unmatched_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

async fn write_summary(reports_dir: &Path, summary: &RunSummary) -> Result<()> {
    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let mut source_lines = Vec::new();
    for (source_id, counts) in &summary.sources {
        let resolved: usize = counts.resolved.values().sum();
        source_lines.push(format!(
            "- {}: {} rows, {} records ({} resolved, {} unresolved, {} ambiguous, {} rejected)",
            source_id,
            counts.rows,
            counts.records,
            resolved,
            counts.unresolved,
            counts.ambiguous,
            counts.rejected
        ));
    }
    let brief = format!(
        "# Lotline Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Unified listings: {}\n- Unmatched records: {}\n- Merged events: {}\n- Conflicting events: {}\n- Re-scrape duplicates removed: {}\n\n## Source Counts\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.listings,
        summary.unmatched,
        summary.merged_events,
        summary.conflicting_events,
        summary.deduped_events,
        source_lines.join("\n")
    );
    fs::write(reports_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;
    Ok(())
}

/// Summarize the most recent run directories as markdown.
pub fn report_runs_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Lotline Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let summary: RunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- listings: {}", summary.listings));
        lines.push(format!("- unmatched: {}", summary.unmatched));
        lines.push(format!(
            "- merged/conflicting events: {}/{}",
            summary.merged_events, summary.conflicting_events
        ));
        lines.push(format!("- manifest: `{}`", summary.parquet_manifest));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, listings: &[UnifiedListing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("building_key", DataType::Utf8, false),
        ArrowField::new("unit_label", DataType::Utf8, true),
        ArrowField::new("listing_type", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("best_price", DataType::Int64, true),
        ArrowField::new("confidence", DataType::Float64, false),
        ArrowField::new("contributing_sources", DataType::Utf8, false),
        ArrowField::new("first_event_date", DataType::Utf8, false),
        ArrowField::new("last_event_date", DataType::Utf8, false),
        ArrowField::new("event_count", DataType::UInt32, false),
    ]));

    let keys = StringArray::from_iter_values(listings.iter().map(|l| l.building_key.to_string()));
    let units = StringArray::from_iter(listings.iter().map(|l| l.unit_label.clone()));
    let types = StringArray::from_iter_values(listings.iter().map(|l| l.listing_type.to_string()));
    let statuses =
        StringArray::from_iter_values(listings.iter().map(|l| format!("{:?}", l.status).to_lowercase()));
    let prices = Int64Array::from(listings.iter().map(|l| l.best_price).collect::<Vec<_>>());
    let confidences = Float64Array::from(listings.iter().map(|l| l.confidence).collect::<Vec<_>>());
    let sources = StringArray::from_iter_values(
        listings
            .iter()
            .map(|l| l.contributing_sources.iter().cloned().collect::<Vec<_>>().join("+")),
    );
    let first_dates =
        StringArray::from_iter_values(listings.iter().map(|l| l.first_event_date.to_string()));
    let last_dates =
        StringArray::from_iter_values(listings.iter().map(|l| l.last_event_date.to_string()));
    let event_counts =
        UInt32Array::from(listings.iter().map(|l| l.events.len() as u32).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(units),
            Arc::new(types),
            Arc::new(statuses),
            Arc::new(prices),
            Arc::new(confidences),
            Arc::new(sources),
            Arc::new(first_dates),
            Arc::new(last_dates),
            Arc::new(event_counts),
        ],
    )
    .context("building unified_listings record batch")?;
    write_parquet(path, batch)
}

fn write_events_parquet(path: &Path, listings: &[UnifiedListing]) -> Result<()> {
    let rows: Vec<(&UnifiedListing, &PriceEvent)> = listings
        .iter()
        .flat_map(|l| l.events.iter().map(move |e| (l, e)))
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("building_key", DataType::Utf8, false),
        ArrowField::new("unit_label", DataType::Utf8, true),
        ArrowField::new("listing_type", DataType::Utf8, false),
        ArrowField::new("event_type", DataType::Utf8, false),
        ArrowField::new("event_date", DataType::Utf8, false),
        ArrowField::new("price", DataType::Int64, true),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("corroborating_sources", DataType::Utf8, false),
        ArrowField::new("conflicting_price", DataType::Boolean, false),
        ArrowField::new("match_confidence", DataType::Float64, false),
    ]));

    let keys = StringArray::from_iter_values(rows.iter().map(|(l, _)| l.building_key.to_string()));
    let units = StringArray::from_iter(rows.iter().map(|(l, _)| l.unit_label.clone()));
    let types = StringArray::from_iter_values(rows.iter().map(|(l, _)| l.listing_type.to_string()));
    let event_types =
        StringArray::from_iter_values(rows.iter().map(|(_, e)| e.event_type.as_str().to_string()));
    let dates = StringArray::from_iter_values(rows.iter().map(|(_, e)| e.event_date.to_string()));
    let prices = Int64Array::from(rows.iter().map(|(_, e)| e.price).collect::<Vec<_>>());
    let sources = StringArray::from_iter_values(rows.iter().map(|(_, e)| e.source.clone()));
    let corroborating = StringArray::from_iter_values(
        rows.iter()
            .map(|(_, e)| e.corroborating_sources.iter().cloned().collect::<Vec<_>>().join("+")),
    );
    let conflicting =
        BooleanArray::from(rows.iter().map(|(_, e)| e.conflicting_price).collect::<Vec<_>>());
    let confidences =
        Float64Array::from(rows.iter().map(|(_, e)| e.match_confidence).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(keys),
            Arc::new(units),
            Arc::new(types),
            Arc::new(event_types),
            Arc::new(dates),
            Arc::new(prices),
            Arc::new(sources),
            Arc::new(corroborating),
            Arc::new(conflicting),
            Arc::new(confidences),
        ],
    )
    .context("building price_events record batch")?;
    write_parquet(path, batch)
}

fn write_unmatched_parquet(path: &Path, unmatched: &[IntermediateRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("source_record_id", DataType::Utf8, false),
        ArrowField::new("raw_address", DataType::Utf8, true),
        ArrowField::new("unit_label", DataType::Utf8, true),
        ArrowField::new("listing_type", DataType::Utf8, false),
        ArrowField::new("event_type", DataType::Utf8, false),
        ArrowField::new("event_date", DataType::Utf8, false),
        ArrowField::new("price", DataType::Int64, true),
        ArrowField::new("match_method", DataType::Utf8, false),
    ]));

    let sources = StringArray::from_iter_values(unmatched.iter().map(|r| r.source.clone()));
    let record_ids =
        StringArray::from_iter_values(unmatched.iter().map(|r| r.source_record_id.clone()));
    let addresses = StringArray::from_iter(unmatched.iter().map(|r| r.raw_address.clone()));
    let units = StringArray::from_iter(unmatched.iter().map(|r| r.unit_label.clone()));
    let types = StringArray::from_iter_values(unmatched.iter().map(|r| r.listing_type.to_string()));
    let event_types =
        StringArray::from_iter_values(unmatched.iter().map(|r| r.event_type.as_str().to_string()));
    let dates = StringArray::from_iter_values(unmatched.iter().map(|r| r.event_date.to_string()));
    let prices = Int64Array::from(unmatched.iter().map(|r| r.price).collect::<Vec<_>>());
    let methods =
        StringArray::from_iter_values(unmatched.iter().map(|r| r.match_method.as_str().to_string()));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(sources),
            Arc::new(record_ids),
            Arc::new(addresses),
            Arc::new(units),
            Arc::new(types),
            Arc::new(event_types),
            Arc::new(dates),
            Arc::new(prices),
            Arc::new(methods),
        ],
    )
    .context("building unmatched record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotline_core::Borough;

    fn key(borough: Borough, block: u32, lot: u32) -> BuildingKey {
        BuildingKey::from_bbl(borough, block, lot).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(
        source: &str,
        id: &str,
        resolved: Option<BuildingKey>,
        unit: Option<&str>,
        listing_type: ListingType,
        event_type: EventType,
        event_date: NaiveDate,
        price: Option<i64>,
        confidence: f64,
    ) -> IntermediateRecord {
        IntermediateRecord {
            source: source.to_string(),
            source_record_id: id.to_string(),
            resolved_key: resolved,
            match_confidence: confidence,
            match_method: if resolved.is_some() {
                MatchMethod::Exact
            } else {
                MatchMethod::None
            },
            raw_address: None,
            unit_label: unit.map(str::to_string),
            listing_type,
            status: match event_type {
                EventType::Closed => ListingStatus::Closed,
                _ => ListingStatus::Active,
            },
            event_type,
            event_date,
            price,
            counterparties: None,
        }
    }

    fn unifier() -> Unifier {
        let kinds = BTreeMap::from([
            ("registry".to_string(), SourceKind::Registry),
            ("mls".to_string(), SourceKind::Mls),
            ("archive".to_string(), SourceKind::Archive),
        ]);
        Unifier::new(MergePolicy::default(), kinds)
    }

    #[test]
    fn same_occurrence_across_sources_merges_into_one_event() {
        let building = key(Borough::Manhattan, 880, 23);
        let records = vec![
            record(
                "mls",
                "MLS-1",
                Some(building),
                Some("3A"),
                ListingType::Rental,
                EventType::Closed,
                date(2023, 6, 2),
                Some(3_200),
                0.85,
            ),
            record(
                "registry",
                "FT-1",
                Some(building),
                Some("3A"),
                ListingType::Rental,
                EventType::Closed,
                date(2023, 6, 3),
                Some(3_200),
                0.85,
            ),
        ];
        let set = unifier().unify(records);
        assert_eq!(set.listings.len(), 1);
        let listing = &set.listings[0];
        assert_eq!(listing.events.len(), 1);
        assert_eq!(set.merged_event_count, 1);
        assert_eq!(set.conflict_count, 0);
        let event = &listing.events[0];
        // Equal confidence: the recording registry wins transaction facts.
        assert_eq!(event.source, "registry");
        assert_eq!(
            event.corroborating_sources,
            BTreeSet::from(["mls".to_string(), "registry".to_string()])
        );
        assert_eq!(listing.best_price, Some(3_200));
        assert_eq!(
            listing.contributing_sources,
            BTreeSet::from(["mls".to_string(), "registry".to_string()])
        );
    }

    #[test]
    fn listing_facts_prefer_the_brokerage_feed() {
        let building = key(Borough::Manhattan, 880, 23);
        let records = vec![
            record(
                "registry",
                "FT-2",
                Some(building),
                None,
                ListingType::Sale,
                EventType::Listed,
                date(2023, 5, 1),
                Some(1_000_000),
                1.0,
            ),
            record(
                "mls",
                "MLS-2",
                Some(building),
                None,
                ListingType::Sale,
                EventType::Listed,
                date(2023, 5, 3),
                Some(1_000_000),
                1.0,
            ),
        ];
        let set = unifier().unify(records);
        assert_eq!(set.listings[0].events.len(), 1);
        assert_eq!(set.listings[0].events[0].source, "mls");
    }

    #[test]
    fn higher_confidence_beats_source_authority() {
        let building = key(Borough::Manhattan, 880, 23);
        let records = vec![
            record(
                "registry",
                "FT-3",
                Some(building),
                None,
                ListingType::Sale,
                EventType::Closed,
                date(2023, 6, 3),
                Some(990_000),
                0.6,
            ),
            record(
                "mls",
                "MLS-3",
                Some(building),
                None,
                ListingType::Sale,
                EventType::Closed,
                date(2023, 6, 1),
                Some(1_000_000),
                1.0,
            ),
        ];
        let set = unifier().unify(records);
        let event = &set.listings[0].events[0];
        assert_eq!(event.source, "mls");
        assert_eq!(event.price, Some(1_000_000));
    }

    #[test]
    fn price_at_exact_tolerance_merges_and_beyond_conflicts() {
        let building = key(Borough::Brooklyn, 4521, 37);
        let at_boundary = vec![
            record(
                "mls",
                "MLS-4",
                Some(building),
                Some("5G"),
                ListingType::Sale,
                EventType::Closed,
                date(2021, 3, 15),
                Some(100_000),
                1.0,
            ),
            record(
                "archive",
                "wb-4",
                Some(building),
                Some("5G"),
                ListingType::Sale,
                EventType::Closed,
                date(2021, 3, 16),
                Some(90_000),
                1.0,
            ),
        ];
        let set = unifier().unify(at_boundary);
        assert_eq!(set.listings[0].events.len(), 1);
        assert_eq!(set.conflict_count, 0);

        let beyond = vec![
            record(
                "mls",
                "MLS-5",
                Some(building),
                Some("5G"),
                ListingType::Sale,
                EventType::Closed,
                date(2021, 3, 15),
                Some(100_000),
                1.0,
            ),
            record(
                "archive",
                "wb-5",
                Some(building),
                Some("5G"),
                ListingType::Sale,
                EventType::Closed,
                date(2021, 3, 16),
                Some(89_000),
                1.0,
            ),
        ];
        let set = unifier().unify(beyond);
        let events = &set.listings[0].events;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.conflicting_price));
        assert_eq!(set.conflict_count, 1);
        assert_eq!(set.merged_event_count, 0);
    }

    #[test]
    fn order_of_magnitude_discrepancy_is_never_merged() {
        let building = key(Borough::Manhattan, 880, 23);
        let records = vec![
            record(
                "mls",
                "MLS-6",
                Some(building),
                Some("3A"),
                ListingType::Rental,
                EventType::Closed,
                date(2023, 6, 2),
                Some(3_200),
                1.0,
            ),
            record(
                "archive",
                "wb-6",
                Some(building),
                Some("3A"),
                ListingType::Rental,
                EventType::Closed,
                date(2023, 6, 3),
                Some(32_000),
                1.0,
            ),
        ];
        let set = unifier().unify(records);
        let events = &set.listings[0].events;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.conflicting_price));
    }

    #[test]
    fn same_month_is_the_default_window_and_day_windows_are_configurable() {
        let building = key(Borough::Manhattan, 880, 23);
        let cross_month = || {
            vec![
                record(
                    "mls",
                    "MLS-7",
                    Some(building),
                    None,
                    ListingType::Sale,
                    EventType::Closed,
                    date(2023, 6, 30),
                    Some(500_000),
                    1.0,
                ),
                record(
                    "archive",
                    "wb-7",
                    Some(building),
                    None,
                    ListingType::Sale,
                    EventType::Closed,
                    date(2023, 7, 1),
                    Some(500_000),
                    1.0,
                ),
            ]
        };

        let set = unifier().unify(cross_month());
        assert_eq!(set.listings[0].events.len(), 2);
        assert_eq!(set.conflict_count, 0);

        let mut policy = MergePolicy::default();
        policy.date_tolerance = DateTolerance::WithinDays(7);
        let kinds = BTreeMap::from([("mls".to_string(), SourceKind::Mls)]);
        let set = Unifier::new(policy, kinds).unify(cross_month());
        assert_eq!(set.listings[0].events.len(), 1);
    }

    #[test]
    fn unify_is_idempotent_and_order_independent() {
        let building_a = key(Borough::Manhattan, 880, 23);
        let building_b = key(Borough::Brooklyn, 4521, 37);
        let mut records = vec![
            record(
                "registry",
                "FT-8",
                Some(building_a),
                Some("3A"),
                ListingType::Rental,
                EventType::Closed,
                date(2023, 6, 3),
                Some(3_200),
                1.0,
            ),
            record(
                "mls",
                "MLS-8",
                Some(building_a),
                Some("3A"),
                ListingType::Rental,
                EventType::Closed,
                date(2023, 6, 2),
                Some(3_200),
                0.85,
            ),
            record(
                "mls",
                "MLS-9",
                Some(building_a),
                Some("3A"),
                ListingType::Rental,
                EventType::Listed,
                date(2023, 5, 1),
                Some(3_300),
                0.85,
            ),
            record(
                "archive",
                "wb-9",
                Some(building_b),
                Some("5G"),
                ListingType::Sale,
                EventType::Closed,
                date(2021, 3, 15),
                Some(815_000),
                0.62,
            ),
            record(
                "archive",
                "wb-10",
                None,
                None,
                ListingType::Rental,
                EventType::Listed,
                date(2022, 1, 10),
                Some(2_100),
                0.0,
            ),
        ];

        let first = unifier().unify(records.clone());
        let second = unifier().unify(records.clone());
        assert_eq!(first, second);

        records.reverse();
        let reversed = unifier().unify(records);
        assert_eq!(first, reversed);
    }

    #[test]
    fn unresolved_records_are_retained_not_grouped() {
        let records = vec![record(
            "archive",
            "wb-11",
            None,
            None,
            ListingType::Rental,
            EventType::Listed,
            date(2022, 1, 10),
            Some(2_100),
            0.0,
        )];
        let set = unifier().unify(records);
        assert!(set.listings.is_empty());
        assert_eq!(set.unmatched.len(), 1);
        assert_eq!(set.unmatched[0].source_record_id, "wb-11");
    }

    #[test]
    fn listing_ids_are_deterministic_per_group_key() {
        let building = key(Borough::Manhattan, 880, 23);
        let mk = || {
            vec![record(
                "mls",
                "MLS-12",
                Some(building),
                Some("3A"),
                ListingType::Rental,
                EventType::Listed,
                date(2023, 5, 1),
                Some(3_300),
                0.85,
            )]
        };
        let a = unifier().unify(mk());
        let b = unifier().unify(mk());
        assert_eq!(a.listings[0].listing_id, b.listings[0].listing_id);
    }

    #[test]
    fn rescrape_duplicates_are_removed_from_history() {
        let building = key(Borough::Manhattan, 880, 23);
        let event = PriceEvent {
            event_type: EventType::PriceChanged,
            event_date: date(2022, 4, 2),
            price: Some(2_950),
            source: "archive".to_string(),
            source_record_id: "wb-13".to_string(),
            corroborating_sources: BTreeSet::from(["archive".to_string()]),
            match_confidence: 0.7,
            conflicting_price: false,
            counterparties: None,
        };
        let mut duplicate = event.clone();
        duplicate.source_record_id = "wb-13-rescrape".to_string();
        let mut listing = UnifiedListing {
            listing_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"test"),
            building_key: building,
            unit_label: None,
            listing_type: ListingType::Rental,
            contributing_sources: BTreeSet::from(["archive".to_string()]),
            status: ListingStatus::Active,
            best_price: Some(2_950),
            first_event_date: date(2022, 4, 2),
            last_event_date: date(2022, 4, 2),
            confidence: 0.7,
            events: vec![event, duplicate],
        };
        assert_eq!(dedup_events(&mut listing), 1);
        assert_eq!(listing.events.len(), 1);
    }

    #[test]
    fn closed_price_wins_best_price_over_asking() {
        let building = key(Borough::Manhattan, 880, 23);
        let records = vec![
            record(
                "mls",
                "MLS-14",
                Some(building),
                Some("3A"),
                ListingType::Sale,
                EventType::Listed,
                date(2023, 4, 1),
                Some(1_100_000),
                0.85,
            ),
            record(
                "mls",
                "MLS-14",
                Some(building),
                Some("3A"),
                ListingType::Sale,
                EventType::Closed,
                date(2023, 7, 10),
                Some(1_050_000),
                0.85,
            ),
        ];
        let set = unifier().unify(records);
        let listing = &set.listings[0];
        assert_eq!(listing.best_price, Some(1_050_000));
        assert_eq!(listing.status, ListingStatus::Closed);
        assert_eq!(listing.first_event_date, date(2023, 4, 1));
        assert_eq!(listing.last_event_date, date(2023, 7, 10));
    }

    mod end_to_end {
        use super::*;
        use std::io::Write;

        fn write_lines(path: &Path, lines: &[&str]) {
            let mut file = File::create(path).unwrap();
            for line in lines {
                writeln!(file, "{line}").unwrap();
            }
        }

        #[tokio::test]
        async fn run_once_publishes_snapshots_and_contains_bad_rows() {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            std::fs::create_dir_all(root.join("data")).unwrap();

            write_lines(
                &root.join("data/registry_snapshot.jsonl"),
                &[
                    r#"{"borough":"1","block":"880","lot":"23","address":"200 EAST 23 STREET","zip":"10010","residential_units":120}"#,
                    r#"{"borough":"3","block":"4521","lot":"37","address":"9115 COLONIAL ROAD","zip":"11209","residential_units":80}"#,
                ],
            );
            write_lines(
                &root.join("data/registry.jsonl"),
                &[
                    r#"{"document_id":"FT-1","borough":"1","block":"880","lot":"1101","unit":"7C","doc_type":"DEED","document_amount":2100000,"document_date":"2023-06-05","sellers":["OWNER LLC"],"buyers":["BUYER"]}"#,
                ],
            );
            write_lines(
                &root.join("data/mls.jsonl"),
                &[
                    r#"{"listing_id":"MLS-1","address":"200 E 23RD ST 7C, New York, NY 10010","listing_status":"Closed","listing_type":"Residential","list_price":2200000,"close_price":2100000,"list_date":"2023-03-01","close_date":"2023-06-02"}"#,
                    r#"{"listing_id":"MLS-2","address":"200 E 23RD ST 9A, New York, NY 10010","listing_status":"Active","listing_type":"Rental","list_price":"N/A","list_date":"2023-05-01"}"#,
                ],
            );
            write_lines(
                &root.join("data/archive.jsonl"),
                &[
                    r#"{"snapshot_id":"wb-1","url":"https://example.org/building/9115-colonial-road-brooklyn/5g","event_label":"Listing sold","event_date":"2021-03-15","price":815000}"#,
                    r#"{"snapshot_id":"wb-2","url":"https://example.org/building/9115-colonial-road-brooklyn/5g","event_label":"Amenities","event_date":"2021-03-15"}"#,
                ],
            );
            std::fs::write(
                root.join("sources.yaml"),
                r#"sources:
  - source_id: registry
    kind: registry
    enabled: true
    dataset: data/registry.jsonl
  - source_id: mls
    kind: mls
    enabled: true
    dataset: data/mls.jsonl
  - source_id: archive
    kind: archive
    enabled: true
    dataset: data/archive.jsonl
policy:
  date_tolerance: same_month
  price_tolerance: 0.10
"#,
            )
            .unwrap();

            let config = PipelineConfig {
                workspace_root: root.to_path_buf(),
                registry_snapshot: PathBuf::from("data/registry_snapshot.jsonl"),
                bin_bridge: PathBuf::from("data/bin_bridge.jsonl"),
                reports_dir: PathBuf::from("reports"),
            };
            let summary = Pipeline::new(config).run_once().await.unwrap();

            // The condo deed and the MLS closing describe one occurrence.
            assert_eq!(summary.listings, 2);
            assert_eq!(summary.merged_events, 1);
            assert_eq!(summary.conflicting_events, 0);

            // One malformed MLS row is rejected without touching the rest.
            let mls = &summary.sources["mls"];
            assert_eq!(mls.rejected, 1);
            assert_eq!(mls.records, 2);
            let archive = &summary.sources["archive"];
            assert_eq!(archive.filtered_rows, 1);
            assert_eq!(archive.records, 1);

            let reports_dir = PathBuf::from(&summary.reports_dir);
            for file in ["run_summary.json", "brief.md", "rejections.json", "unmatched.json"] {
                assert!(reports_dir.join(file).exists(), "{file} missing");
            }
            for file in [
                "snapshots/manifest.json",
                "snapshots/unified_listings.parquet",
                "snapshots/price_events.parquet",
                "snapshots/unmatched.parquet",
            ] {
                assert!(reports_dir.join(file).exists(), "{file} missing");
            }

            let rejections: Vec<Rejection> = serde_json::from_str(
                &std::fs::read_to_string(reports_dir.join("rejections.json")).unwrap(),
            )
            .unwrap();
            assert_eq!(rejections.len(), 1);
            assert_eq!(rejections[0].source_record_id, "MLS-2");
        }

        #[tokio::test]
        async fn empty_reference_snapshot_fails_before_extraction() {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            std::fs::create_dir_all(root.join("data")).unwrap();
            std::fs::write(root.join("data/registry_snapshot.jsonl"), "").unwrap();
            std::fs::write(root.join("sources.yaml"), "sources: []\n").unwrap();

            let config = PipelineConfig {
                workspace_root: root.to_path_buf(),
                registry_snapshot: PathBuf::from("data/registry_snapshot.jsonl"),
                bin_bridge: PathBuf::from("data/bin_bridge.jsonl"),
                reports_dir: PathBuf::from("reports"),
            };
            let err = Pipeline::new(config).run_once().await.unwrap_err();
            assert!(err.to_string().contains("reference index unavailable"));
        }
    }
}

//! One run's reconciliation state: the existing-row index, tag mapping and
//! counters, plus every write the run makes to the workbook.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use roster_core::{
    ChangeKind, ChangeRecord, ColumnSchema, FieldSnapshot, Identity, ProfileRecord, RowSnapshot,
    RunMetrics, Target, TargetStatus, DASHBOARD_HEADERS, LOG_HEADERS, TAGS_COLUMN, TARGET_HEADERS,
};
use roster_store::{
    CellFormat, CellRef, GridRange, PermanentWriteError, RetryExecutor, SetupError, TabularStore,
    ValueInput, WritePolicy,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::index::ExistingIndex;
use crate::tags::TagMapping;
use crate::targets::{select_targets, update_target_status};

const SHEET_FONT: &str = "Bona Nova SC";
const LOG_TIMESTAMP_FORMAT: &str = "%d-%b-%y %I:%M %p";
const LOG_SNAPSHOT_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetNames {
    pub profiles: String,
    pub target: String,
    pub tags: String,
    pub log: String,
    pub dashboard: String,
}

impl Default for SheetNames {
    fn default() -> Self {
        Self {
            profiles: "Profiles".to_string(),
            target: "Target".to_string(),
            tags: "Tags".to_string(),
            log: "Log".to_string(),
            dashboard: "Dashboard".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub schema: ColumnSchema,
    pub sheets: SheetNames,
    pub policy: WritePolicy,
    pub utc_offset: FixedOffset,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            schema: ColumnSchema::default(),
            sheets: SheetNames::default(),
            policy: WritePolicy::default(),
            utc_offset: fixed_offset(300),
        }
    }
}

/// Offset east of UTC in minutes; out-of-range values fall back to UTC.
pub fn fixed_offset(minutes: i32) -> FixedOffset {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("record has no nickname")]
    MissingIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    New,
    Updated,
    Unchanged,
    Error,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Error => "error",
        }
    }
}

impl From<ChangeKind> for WriteStatus {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::New => Self::New,
            ChangeKind::Updated => Self::Updated,
            ChangeKind::Unchanged => Self::Unchanged,
        }
    }
}

/// Result of reconciling one record. `row` is the identity's current
/// Profiles row; `None` only when the write failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub status: WriteStatus,
    pub changed_fields: Vec<String>,
    pub row: Option<u32>,
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: WriteStatus::Error,
            changed_fields: Vec::new(),
            row: None,
            error: Some(error.into()),
        }
    }

    /// Text for the Target table's Remarks column.
    pub fn remarks(&self) -> String {
        match self.status {
            WriteStatus::New => "New profile".to_string(),
            WriteStatus::Updated => format!("Updated: {}", self.changed_fields.join(", ")),
            WriteStatus::Unchanged => "No changes".to_string(),
            WriteStatus::Error => self.error.clone().unwrap_or_default(),
        }
    }
}

pub struct ReconciliationSession {
    store: Arc<dyn TabularStore>,
    executor: RetryExecutor,
    schema: ColumnSchema,
    sheets: SheetNames,
    tags: TagMapping,
    index: ExistingIndex,
    metrics: RunMetrics,
    utc_offset: FixedOffset,
}

impl ReconciliationSession {
    /// Prepares the workbook (missing tables, headers, formatting) and loads
    /// the tag mapping and existing-row index.
    pub async fn setup(
        store: Arc<dyn TabularStore>,
        options: SessionOptions,
    ) -> Result<Self, SetupError> {
        let SessionOptions {
            schema,
            sheets,
            policy,
            utc_offset,
        } = options;
        let executor = RetryExecutor::new(policy);
        let width = u32::try_from(schema.len()).unwrap_or(u32::MAX);

        let layout = [
            (&sheets.profiles, 1000, width),
            (&sheets.target, 1000, TARGET_HEADERS.len() as u32),
            (&sheets.log, 2000, LOG_HEADERS.len() as u32),
            (&sheets.dashboard, 50, DASHBOARD_HEADERS.len() as u32),
        ];
        for (sheet, rows, cols) in layout {
            let created = executor
                .execute(&format!("create {sheet}"), || {
                    store.create_sheet_if_absent(sheet, rows, cols)
                })
                .await?;
            if created {
                info!(sheet = %sheet, "created sheet");
            }
        }

        let profile_rows =
            ensure_header(&executor, store.as_ref(), &sheets.profiles, schema.columns()).await?;
        let target_header = to_strings(&TARGET_HEADERS);
        ensure_header(&executor, store.as_ref(), &sheets.target, &target_header).await?;
        let log_header = to_strings(&LOG_HEADERS);
        ensure_header(&executor, store.as_ref(), &sheets.log, &log_header).await?;

        let tags = load_tags(&executor, store.as_ref(), &sheets.tags).await;
        let index = ExistingIndex::from_rows(&profile_rows, &schema);
        info!(profiles = index.len(), tagged = tags.len(), "loaded existing state");

        let session = Self {
            store,
            executor,
            schema,
            sheets,
            tags,
            index,
            metrics: RunMetrics::default(),
            utc_offset,
        };
        session.format_profiles().await;
        Ok(session)
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    pub fn index(&self) -> &ExistingIndex {
        &self.index
    }

    pub fn tags(&self) -> &TagMapping {
        &self.tags
    }

    pub fn metrics(&self) -> RunMetrics {
        self.metrics
    }

    /// Counts a record that failed before reaching the engine, e.g. a scrape
    /// error.
    pub fn record_failure(&mut self) {
        self.metrics.record_failure();
    }

    pub async fn load_targets(&self, max: usize) -> Result<Vec<Target>, PermanentWriteError> {
        let store = self.store.as_ref();
        let sheet = self.sheets.target.as_str();
        let rows = self
            .executor
            .execute(&format!("read {sheet}"), || store.get_all_rows(sheet))
            .await?;
        Ok(select_targets(&rows, max))
    }

    /// Writes status and remarks back to the target's queue row. Targets
    /// without a row (online mode) are skipped.
    pub async fn mark_target(&self, target: &Target, status: TargetStatus, remarks: &str) {
        let Some(row) = target.row else {
            return;
        };
        if let Err(err) = update_target_status(
            &self.executor,
            self.store.as_ref(),
            &self.sheets.target,
            row,
            status,
            remarks,
        )
        .await
        {
            warn!(nickname = %target.nickname, row, error = %err, "target status update failed");
        }
    }

    /// Reconciles one record against the index. Store failures come back as
    /// an `Error` outcome; only a missing identity is an `Err`.
    pub async fn write_profile(
        &mut self,
        record: &ProfileRecord,
    ) -> Result<WriteOutcome, ReconcileError> {
        let nickname = record.get(self.schema.identity_field()).trim().to_string();
        let identity = Identity::parse(&nickname).ok_or(ReconcileError::MissingIdentity)?;

        let record = record
            .clone()
            .with_field(TAGS_COLUMN, self.tags.tags_for(&identity));
        let projected = self.project(&record);
        let after = self.raw_snapshot(&record);

        let existing = self.index.get(&identity).cloned();
        let (kind, changed_fields) = match &existing {
            None => (ChangeKind::New, self.schema.columns().to_vec()),
            Some(snapshot) => {
                let changed: Vec<String> = self
                    .schema
                    .columns()
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| snapshot.cell(*idx) != projected[*idx])
                    .map(|(_, col)| col.clone())
                    .collect();
                let kind = if changed.is_empty() {
                    ChangeKind::Unchanged
                } else {
                    ChangeKind::Updated
                };
                (kind, changed)
            }
        };
        let before = existing.as_ref().map(|s| s.to_fields(&self.schema));

        let row = match (kind, &existing) {
            (ChangeKind::Unchanged, Some(snapshot)) => snapshot.row,
            _ => {
                let store = self.store.as_ref();
                let sheet = self.sheets.profiles.as_str();
                let appended = self
                    .executor
                    .execute(&format!("append {sheet}"), || store.append_row(sheet, &projected))
                    .await;
                match appended {
                    Ok(row) => row,
                    Err(err) => {
                        warn!(%nickname, error = %err, "profile write failed");
                        self.metrics.record_failure();
                        return Ok(WriteOutcome::failed(err.to_string()));
                    }
                }
            }
        };

        if kind != ChangeKind::Unchanged {
            self.apply_link_formulas(row, &record).await;
            self.index.insert(
                identity,
                RowSnapshot {
                    row,
                    cells: projected,
                },
            );
        }
        self.metrics.record(kind);

        let change = ChangeRecord {
            nickname: nickname.clone(),
            kind,
            changed_fields: changed_fields.clone(),
            before,
            after,
            timestamp: self.now(),
        };
        self.log_change(&change).await;
        info!(%nickname, change = %kind, row, changed = changed_fields.len(), "profile reconciled");

        Ok(WriteOutcome {
            status: kind.into(),
            changed_fields,
            row: Some(row),
            error: None,
        })
    }

    /// Flushes the run counters as one Dashboard row, rewriting the header
    /// first when it does not match. Failures are logged.
    pub async fn finish(&self) -> RunMetrics {
        if let Err(err) = self.flush_dashboard().await {
            warn!(error = %err, "dashboard update failed");
        }
        self.metrics
    }

    async fn flush_dashboard(&self) -> Result<(), PermanentWriteError> {
        let store = self.store.as_ref();
        let sheet = self.sheets.dashboard.as_str();
        let header = to_strings(&DASHBOARD_HEADERS);

        let rows = self
            .executor
            .execute(&format!("read {sheet}"), || store.get_all_rows(sheet))
            .await?;
        let mut data_rows = rows.len().saturating_sub(1);

        if rows.first() != Some(&header) {
            info!(sheet, "resetting dashboard header");
            self.executor
                .execute(&format!("clear {sheet}"), || store.clear_sheet(sheet))
                .await?;
            self.executor
                .execute(&format!("append {sheet}"), || store.append_row(sheet, &header))
                .await?;
            let format = header_format();
            self.executor
                .execute(&format!("format {sheet}"), || {
                    store.format_range(sheet, GridRange::header(header.len()), &format)
                })
                .await?;
            data_rows = 0;
        }

        let run_number = u32::try_from(data_rows + 1).unwrap_or(u32::MAX);
        let timestamp = self.now().format(LOG_TIMESTAMP_FORMAT).to_string();
        let row = self.metrics.dashboard_row(run_number, &timestamp);
        self.executor
            .execute(&format!("append {sheet}"), || store.append_row(sheet, &row))
            .await?;
        info!(run_number, processed = self.metrics.processed, "dashboard updated");
        Ok(())
    }

    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.utc_offset)
    }

    fn project(&self, record: &ProfileRecord) -> Vec<String> {
        self.schema
            .columns()
            .iter()
            .map(|col| match self.schema.link_for(col) {
                Some(link) => link.placeholder(record.get(col)),
                None => clean_cell(record.get(col)),
            })
            .collect()
    }

    fn raw_snapshot(&self, record: &ProfileRecord) -> FieldSnapshot {
        self.schema
            .columns()
            .iter()
            .map(|col| (col.clone(), record.get(col).to_string()))
            .collect()
    }

    /// Each link cell is written on its own; a failure leaves the placeholder
    /// in place and does not affect the other cells.
    async fn apply_link_formulas(&self, row: u32, record: &ProfileRecord) {
        let store = self.store.as_ref();
        let sheet = self.sheets.profiles.as_str();

        for link in self.schema.links() {
            let url = record.get(&link.field).trim();
            if url.is_empty() {
                continue;
            }
            let Some(col) = self.schema.index_of(&link.field) else {
                continue;
            };
            let cell = CellRef::new(row, col);
            let values = vec![vec![link.formula(url)]];
            let written = self
                .executor
                .execute(&format!("formula {sheet}!{}", cell.a1()), || {
                    store.update_cells(sheet, cell, &values, ValueInput::UserEntered)
                })
                .await;
            if let Err(err) = written {
                warn!(cell = %cell.a1(), error = %err, "link formula failed");
            }
        }
    }

    async fn log_change(&self, change: &ChangeRecord) {
        let store = self.store.as_ref();
        let sheet = self.sheets.log.as_str();
        let row = log_row(change);
        let logged = self
            .executor
            .execute(&format!("append {sheet}"), || store.append_row(sheet, &row))
            .await;
        if let Err(err) = logged {
            warn!(nickname = %change.nickname, error = %err, "change log write failed");
        }
    }

    async fn format_profiles(&self) {
        let store = self.store.as_ref();
        let sheet = self.sheets.profiles.as_str();
        let width = self.schema.len();

        let body = CellFormat {
            font_family: Some(SHEET_FONT.to_string()),
            font_size: Some(8),
            background: Some([1.0, 1.0, 1.0]),
            ..CellFormat::default()
        };
        let header = header_format();
        let steps = [(GridRange::columns(width), &body), (GridRange::header(width), &header)];

        for (range, format) in steps {
            let formatted = self
                .executor
                .execute(&format!("format {sheet}"), || store.format_range(sheet, range, format))
                .await;
            if let Err(err) = formatted {
                warn!(sheet, error = %err, "formatting failed");
            }
        }
    }
}

async fn ensure_header(
    executor: &RetryExecutor,
    store: &dyn TabularStore,
    sheet: &str,
    header: &[String],
) -> Result<Vec<Vec<String>>, PermanentWriteError> {
    let rows = executor
        .execute(&format!("read {sheet}"), || store.get_all_rows(sheet))
        .await?;
    if let Some(found) = rows.first() {
        if !header_matches(found, header) {
            warn!(sheet, found = ?found, expected = ?header, "existing header differs from the configured columns");
        }
        return Ok(rows);
    }
    executor
        .execute(&format!("append {sheet}"), || store.append_row(sheet, header))
        .await?;
    debug!(sheet, "wrote header row");
    Ok(vec![header.to_vec()])
}

/// Trailing blanks are ignored; a sheet's reads drop empty trailing cells.
fn header_matches(found: &[String], expected: &[String]) -> bool {
    let found: Vec<&str> = found.iter().map(|c| c.trim()).collect();
    let mut found = found.as_slice();
    while let Some((last, rest)) = found.split_last() {
        if !last.is_empty() {
            break;
        }
        found = rest;
    }
    found.len() == expected.len() && found.iter().zip(expected).all(|(f, e)| *f == e.trim())
}

async fn read_optional_sheet(
    executor: &RetryExecutor,
    store: &dyn TabularStore,
    sheet: &str,
) -> Result<Vec<Vec<String>>, PermanentWriteError> {
    let exists = executor
        .execute(&format!("lookup {sheet}"), || store.sheet_exists(sheet))
        .await?;
    if !exists {
        return Ok(Vec::new());
    }
    executor
        .execute(&format!("read {sheet}"), || store.get_all_rows(sheet))
        .await
}

/// Tags are optional: a missing or unreadable table means no tags.
async fn load_tags(executor: &RetryExecutor, store: &dyn TabularStore, sheet: &str) -> TagMapping {
    match read_optional_sheet(executor, store, sheet).await {
        Ok(rows) => TagMapping::from_table(&rows),
        Err(err) => {
            warn!(sheet, error = %err, "tags loading failed");
            TagMapping::default()
        }
    }
}

fn header_format() -> CellFormat {
    CellFormat {
        bold: true,
        font_family: Some(SHEET_FONT.to_string()),
        font_size: Some(9),
        centered: true,
        background: None,
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Collapses whitespace runs to a single space and trims.
pub fn clean_cell(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn snapshot_json(fields: Option<&FieldSnapshot>) -> String {
    let map: serde_json::Map<String, serde_json::Value> = fields
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    let text = serde_json::Value::Object(map).to_string();
    text.chars().take(LOG_SNAPSHOT_LIMIT).collect()
}

/// Log table row: timestamp, nickname, change kind, changed fields, and the
/// before/after snapshots as JSON.
pub fn log_row(change: &ChangeRecord) -> Vec<String> {
    let fields = if change.changed_fields.is_empty() {
        "-".to_string()
    } else {
        change.changed_fields.join(", ")
    };
    vec![
        change.timestamp.format(LOG_TIMESTAMP_FORMAT).to_string(),
        change.nickname.clone(),
        change.kind.as_str().to_string(),
        fields,
        snapshot_json(change.before.as_ref()),
        snapshot_json(Some(&change.after)),
    ]
}

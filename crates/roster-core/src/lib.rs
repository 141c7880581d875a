//! Core domain model for roster sync: column schema, profile records, row
//! snapshots, change records and per-run counters.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "roster-core";

pub const IDENTITY_COLUMN: &str = "NICK NAME";
pub const TAGS_COLUMN: &str = "TAGS";
pub const SOURCE_COLUMN: &str = "SOURCE";
pub const PROFILE_LINK_COLUMN: &str = "PROFILE LINK";

/// Canonical column order of the Profiles table (A:R).
pub const DEFAULT_COLUMNS: [&str; 18] = [
    "IMAGE",
    "NICK NAME",
    "TAGS",
    "LAST POST",
    "LAST POST TIME",
    "FRIEND",
    "CITY",
    "GENDER",
    "MARRIED",
    "AGE",
    "JOINED",
    "FOLLOWERS",
    "STATUS",
    "POSTS",
    "PROFILE LINK",
    "INTRO",
    "SOURCE",
    "VERIFIED",
];

pub const TARGET_HEADERS: [&str; 4] = ["Nickname", "Status", "Remarks", "Source"];
pub const LOG_HEADERS: [&str; 6] = [
    "Timestamp",
    "Nickname",
    "ChangeType",
    "ChangedFields",
    "Before",
    "After",
];
pub const DASHBOARD_HEADERS: [&str; 8] = [
    "Run#",
    "Timestamp",
    "Profiles",
    "Success",
    "Failed",
    "New",
    "Updated",
    "Unchanged",
];

/// How a link-bearing column is rendered once its row exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkKind {
    Image,
    Hyperlink { label: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkColumn {
    pub field: String,
    #[serde(flatten)]
    pub kind: LinkKind,
}

impl LinkColumn {
    pub fn image(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: LinkKind::Image,
        }
    }

    pub fn hyperlink(field: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: LinkKind::Hyperlink {
                label: label.into(),
            },
        }
    }

    /// Literal written by the append, matching what the formula later displays.
    pub fn placeholder(&self, raw: &str) -> String {
        match &self.kind {
            LinkKind::Image => String::new(),
            LinkKind::Hyperlink { label } if !raw.trim().is_empty() => label.clone(),
            LinkKind::Hyperlink { .. } => String::new(),
        }
    }

    pub fn formula(&self, url: &str) -> String {
        let url = url.trim().replace('"', "\"\"");
        match &self.kind {
            LinkKind::Image => format!("=IMAGE(\"{url}\", 4, 50, 50)"),
            LinkKind::Hyperlink { label } => {
                format!("=HYPERLINK(\"{url}\", \"{}\")", label.replace('"', "\"\""))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("column schema has no columns")]
    Empty,
    #[error("column at position {0} has a blank name")]
    BlankColumn(usize),
    #[error("column {0:?} appears more than once")]
    DuplicateColumn(String),
    #[error("identity column {0:?} is not part of the schema")]
    MissingIdentity(String),
    #[error("link column {0:?} is not part of the schema")]
    UnknownLinkColumn(String),
}

/// Ordered column layout of the Profiles table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    columns: Vec<String>,
    identity_index: usize,
    links: Vec<LinkColumn>,
}

impl ColumnSchema {
    pub fn new(
        columns: Vec<String>,
        identity: &str,
        links: Vec<LinkColumn>,
    ) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (idx, column) in columns.iter().enumerate() {
            if column.trim().is_empty() {
                return Err(SchemaError::BlankColumn(idx));
            }
            if columns[..idx].contains(column) {
                return Err(SchemaError::DuplicateColumn(column.clone()));
            }
        }
        let identity_index = columns
            .iter()
            .position(|c| c == identity)
            .ok_or_else(|| SchemaError::MissingIdentity(identity.to_string()))?;
        if let Some(link) = links.iter().find(|l| !columns.contains(&l.field)) {
            return Err(SchemaError::UnknownLinkColumn(link.field.clone()));
        }
        Ok(Self {
            columns,
            identity_index,
            links,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn identity_field(&self) -> &str {
        &self.columns[self.identity_index]
    }

    pub fn identity_index(&self) -> usize {
        self.identity_index
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == field)
    }

    pub fn links(&self) -> &[LinkColumn] {
        &self.links
    }

    pub fn link_for(&self, field: &str) -> Option<&LinkColumn> {
        self.links.iter().find(|l| l.field == field)
    }
}

impl Default for ColumnSchema {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            identity_index: 1,
            links: vec![
                LinkColumn::image("IMAGE"),
                LinkColumn::hyperlink("LAST POST", "Post"),
                LinkColumn::hyperlink(PROFILE_LINK_COLUMN, "Profile"),
            ],
        }
    }
}

/// On-disk schema override, validated into a [`ColumnSchema`].
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDefinition {
    pub columns: Vec<String>,
    #[serde(default = "default_identity_column")]
    pub identity: String,
    #[serde(default)]
    pub links: Vec<LinkColumn>,
}

fn default_identity_column() -> String {
    IDENTITY_COLUMN.to_string()
}

impl TryFrom<SchemaDefinition> for ColumnSchema {
    type Error = SchemaError;

    fn try_from(def: SchemaDefinition) -> Result<Self, Self::Error> {
        ColumnSchema::new(def.columns, &def.identity, def.links)
    }
}

/// Case-insensitive profile identity (trimmed, lower-cased nickname).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_lowercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw scraped values keyed by column name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    fields: BTreeMap<String, String>,
}

impl ProfileRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Absent fields read as empty.
    pub fn get(&self, field: &str) -> &str {
        self.fields.get(field).map(String::as_str).unwrap_or_default()
    }
}

/// Ordered `(column, value)` pairs.
pub type FieldSnapshot = Vec<(String, String)>;

/// Stored cells of one Profiles row. `row` is 1-based and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSnapshot {
    pub row: u32,
    pub cells: Vec<String>,
}

impl RowSnapshot {
    pub fn cell(&self, idx: usize) -> &str {
        self.cells.get(idx).map(String::as_str).unwrap_or_default()
    }

    pub fn to_fields(&self, schema: &ColumnSchema) -> FieldSnapshot {
        schema
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.clone(), self.cell(idx).to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    New,
    Updated,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Updated => "UPDATED",
            Self::Unchanged => "UNCHANGED",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry produced once per reconciled record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub nickname: String,
    pub kind: ChangeKind,
    pub changed_fields: Vec<String>,
    pub before: Option<FieldSnapshot>,
    pub after: FieldSnapshot,
    pub timestamp: DateTime<FixedOffset>,
}

/// Counters for a single run, flushed once to the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunMetrics {
    pub processed: u32,
    pub success: u32,
    pub failed: u32,
    pub new: u32,
    pub updated: u32,
    pub unchanged: u32,
}

impl RunMetrics {
    pub fn record(&mut self, kind: ChangeKind) {
        self.processed += 1;
        self.success += 1;
        match kind {
            ChangeKind::New => self.new += 1,
            ChangeKind::Updated => self.updated += 1,
            ChangeKind::Unchanged => self.unchanged += 1,
        }
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    pub fn dashboard_row(&self, run_number: u32, timestamp: &str) -> Vec<String> {
        vec![
            run_number.to_string(),
            timestamp.to_string(),
            self.processed.to_string(),
            self.success.to_string(),
            self.failed.to_string(),
            self.new.to_string(),
            self.updated.to_string(),
            self.unchanged.to_string(),
        ]
    }
}

/// Work-queue status markers that make a target row eligible.
pub const PENDING_MARKERS: [&str; 2] = ["pending", "pending 🚨"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Done,
    Error,
}

impl TargetStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done => "Done",
            Self::Error => "Error",
        }
    }

    pub fn is_pending_marker(status: &str) -> bool {
        let status = status.trim().to_lowercase();
        PENDING_MARKERS.iter().any(|m| *m == status)
    }
}

/// One identity queued for scraping; `row` is its Target-table position, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub nickname: String,
    pub row: Option<u32>,
    pub source: String,
}

impl Target {
    pub fn online(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            row: None,
            source: "Online".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_places_identity_in_second_column() {
        let schema = ColumnSchema::default();
        assert_eq!(schema.identity_field(), IDENTITY_COLUMN);
        assert_eq!(schema.identity_index(), 1);
        assert_eq!(schema.len(), 18);
        assert!(schema.link_for("IMAGE").is_some());
        assert!(schema.link_for("CITY").is_none());
    }

    #[test]
    fn schema_rejects_inconsistent_layouts() {
        let cols = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            ColumnSchema::new(vec![], "NICK NAME", vec![]),
            Err(SchemaError::Empty)
        );
        assert_eq!(
            ColumnSchema::new(cols(&["A", "A"]), "A", vec![]),
            Err(SchemaError::DuplicateColumn("A".into()))
        );
        assert_eq!(
            ColumnSchema::new(cols(&["A", " "]), "A", vec![]),
            Err(SchemaError::BlankColumn(1))
        );
        assert_eq!(
            ColumnSchema::new(cols(&["A", "B"]), "C", vec![]),
            Err(SchemaError::MissingIdentity("C".into()))
        );
        assert_eq!(
            ColumnSchema::new(cols(&["A", "B"]), "A", vec![LinkColumn::image("Z")]),
            Err(SchemaError::UnknownLinkColumn("Z".into()))
        );
    }

    #[test]
    fn link_placeholders_match_displayed_formula_values() {
        let image = LinkColumn::image("IMAGE");
        let post = LinkColumn::hyperlink("LAST POST", "Post");
        assert_eq!(image.placeholder("https://x/img.png"), "");
        assert_eq!(post.placeholder("https://x/p/1"), "Post");
        assert_eq!(post.placeholder("  "), "");
        assert_eq!(
            image.formula("https://x/img.png"),
            "=IMAGE(\"https://x/img.png\", 4, 50, 50)"
        );
        assert_eq!(
            post.formula("https://x/p/\"1\""),
            "=HYPERLINK(\"https://x/p/\"\"1\"\"\", \"Post\")"
        );
    }

    #[test]
    fn identity_is_trimmed_and_case_folded() {
        assert_eq!(Identity::parse("  Alice "), Identity::parse("alice"));
        assert_eq!(Identity::parse("   "), None);
    }

    #[test]
    fn metrics_count_success_and_failure_separately() {
        let mut metrics = RunMetrics::default();
        metrics.record(ChangeKind::New);
        metrics.record(ChangeKind::Unchanged);
        metrics.record_failure();
        assert_eq!(metrics.processed, 3);
        assert_eq!(metrics.success, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(
            metrics.dashboard_row(4, "t"),
            vec!["4", "t", "3", "2", "1", "1", "0", "1"]
        );
    }

    #[test]
    fn pending_markers_are_case_insensitive() {
        assert!(TargetStatus::is_pending_marker(" PENDING "));
        assert!(TargetStatus::is_pending_marker("Pending 🚨"));
        assert!(!TargetStatus::is_pending_marker("Done"));
    }

    #[test]
    fn schema_definition_converts_into_schema() {
        let def = SchemaDefinition {
            columns: vec!["NICK NAME".into(), "LINK".into()],
            identity: IDENTITY_COLUMN.into(),
            links: vec![LinkColumn::hyperlink("LINK", "Open")],
        };
        let schema = ColumnSchema::try_from(def).unwrap();
        assert_eq!(schema.identity_index(), 0);
        assert_eq!(
            schema.link_for("LINK").unwrap().kind,
            LinkKind::Hyperlink {
                label: "Open".into()
            }
        );
    }
}

//! In-process workbook, optionally mirrored to a local JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::{CellFormat, CellRef, GridRange, StoreError, TabularStore, ValueInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetAllRows,
    AppendRow,
    UpdateCells,
    FormatRange,
    ClearSheet,
    CreateSheet,
}

impl StoreOp {
    fn is_write(&self) -> bool {
        !matches!(self, Self::GetAllRows)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredCell {
    value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    formula: bool,
}

impl StoredCell {
    fn literal(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            formula: false,
        }
    }

    fn displayed(&self) -> String {
        if self.formula {
            render_formula(&self.value)
        } else {
            self.value.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkbookData {
    sheets: BTreeMap<String, Vec<Vec<StoredCell>>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: WorkbookData,
    faults: Vec<(StoreOp, StoreError)>,
    calls: Vec<StoreOp>,
}

/// Workbook kept in memory. Formulas entered with [`ValueInput::UserEntered`]
/// read back as their displayed value, like a spreadsheet would show them.
#[derive(Debug, Default)]
pub struct MemoryWorkbook {
    state: Mutex<MemoryState>,
    persist_path: Option<PathBuf>,
    /// Serializes persisted writes so a staged copy is never built from
    /// data another write is about to replace.
    persist_gate: tokio::sync::Mutex<()>,
}

impl MemoryWorkbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(self, name: &str, rows: Vec<Vec<String>>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.data.sheets.insert(
                name.to_string(),
                rows.into_iter()
                    .map(|r| r.into_iter().map(StoredCell::literal).collect())
                    .collect(),
            );
        }
        self
    }

    /// Loads `path` if it exists; every later mutation rewrites it atomically.
    pub async fn open_file(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if fs::try_exists(&path).await? {
            let text = fs::read_to_string(&path).await?;
            serde_json::from_str(&text).map_err(|e| {
                StoreError::Decode(format!("parsing local workbook {}: {e}", path.display()))
            })?
        } else {
            WorkbookData::default()
        };
        Ok(Self {
            state: Mutex::new(MemoryState {
                data,
                ..Default::default()
            }),
            persist_path: Some(path),
            persist_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Queues `error` to be returned by the next call of kind `op`.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push((op, error));
        }
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.iter().filter(|c| **c == op).count())
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.iter().filter(|c| c.is_write()).count())
            .unwrap_or_default()
    }

    /// Displayed values, same shape `get_all_rows` returns.
    pub fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.data.sheets.get(sheet).map(|rows| displayed_rows(rows)))
            .unwrap_or_default()
    }

    /// Entered values, with formulas left as written.
    pub fn raw_rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.data.sheets.get(sheet).map(|rows| {
                    rows.iter()
                        .map(|r| r.iter().map(|c| c.value.clone()).collect())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Decode("memory workbook lock poisoned".into()))
    }

    /// Applies `f` in place, or to a staged copy when the write still has to
    /// reach disk.
    fn with_state<T>(
        &self,
        op: StoreOp,
        f: impl FnOnce(&mut WorkbookData) -> Result<T, StoreError>,
    ) -> Result<(T, Option<WorkbookData>), StoreError> {
        let mut state = self.lock_state()?;
        state.calls.push(op);
        if let Some(pos) = state.faults.iter().position(|(o, _)| *o == op) {
            let (_, err) = state.faults.remove(pos);
            return Err(err);
        }
        if self.persist_path.is_some() && op.is_write() {
            let mut staged = state.data.clone();
            let value = f(&mut staged)?;
            return Ok((value, Some(staged)));
        }
        let value = f(&mut state.data)?;
        Ok((value, None))
    }

    /// A persisted write only becomes visible once the file is saved, so a
    /// failed save leaves the workbook as it was.
    async fn run<T>(
        &self,
        op: StoreOp,
        f: impl FnOnce(&mut WorkbookData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _gate = self.persist_gate.lock().await;
        let (value, staged) = self.with_state(op, f)?;
        if let (Some(path), Some(staged)) = (&self.persist_path, staged) {
            let bytes =
                serde_json::to_vec_pretty(&staged).map_err(|e| StoreError::Decode(e.to_string()))?;
            persist_atomically(path, &bytes).await?;
            self.lock_state()?.data = staged;
        }
        Ok(value)
    }
}

fn sheet_mut<'a>(
    data: &'a mut WorkbookData,
    sheet: &str,
) -> Result<&'a mut Vec<Vec<StoredCell>>, StoreError> {
    data.sheets
        .get_mut(sheet)
        .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))
}

fn displayed_rows(rows: &[Vec<StoredCell>]) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            let mut cells: Vec<String> = row.iter().map(StoredCell::displayed).collect();
            while cells.last().is_some_and(|c| c.is_empty()) {
                cells.pop();
            }
            cells
        })
        .collect();
    while out.last().is_some_and(|r| r.is_empty()) {
        out.pop();
    }
    out
}

/// Displayed value of the formulas the sync writes: `HYPERLINK` shows its
/// label (or URL), `IMAGE` shows nothing.
fn render_formula(formula: &str) -> String {
    let upper = formula.trim_start().to_ascii_uppercase();
    let args = quoted_strings(formula);
    if upper.starts_with("=HYPERLINK(") {
        args.get(1).or_else(|| args.first()).cloned().unwrap_or_default()
    } else if upper.starts_with("=IMAGE(") {
        String::new()
    } else {
        formula.to_string()
    }
}

fn quoted_strings(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '"' {
            continue;
        }
        let mut current = String::new();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                    continue;
                }
                break;
            }
            current.push(c);
        }
        out.push(current);
    }
    out
}

async fn persist_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    debug!(path = %path.display(), bytes = bytes.len(), "local workbook saved");
    Ok(())
}

#[async_trait]
impl TabularStore for MemoryWorkbook {
    async fn get_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        self.run(StoreOp::GetAllRows, |data| {
            data.sheets
                .get(sheet)
                .map(|rows| displayed_rows(rows))
                .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))
        })
        .await
    }

    async fn append_row(&self, sheet: &str, row: &[String]) -> Result<u32, StoreError> {
        self.run(StoreOp::AppendRow, |data| {
            let rows = sheet_mut(data, sheet)?;
            let occupied = displayed_rows(rows).len();
            rows.truncate(occupied);
            rows.push(row.iter().cloned().map(StoredCell::literal).collect());
            u32::try_from(rows.len()).map_err(|_| StoreError::InvalidRange(sheet.to_string()))
        })
        .await
    }

    async fn update_cells(
        &self,
        sheet: &str,
        start: CellRef,
        values: &[Vec<String>],
        input: ValueInput,
    ) -> Result<(), StoreError> {
        if start.row == 0 {
            return Err(StoreError::InvalidRange(start.a1()));
        }
        self.run(StoreOp::UpdateCells, |data| {
            let rows = sheet_mut(data, sheet)?;
            for (dr, line) in values.iter().enumerate() {
                let row_idx = start.row as usize - 1 + dr;
                if rows.len() <= row_idx {
                    rows.resize_with(row_idx + 1, Vec::new);
                }
                let row = &mut rows[row_idx];
                for (dc, value) in line.iter().enumerate() {
                    let col_idx = start.col + dc;
                    if row.len() <= col_idx {
                        row.resize_with(col_idx + 1, StoredCell::default);
                    }
                    row[col_idx] = StoredCell {
                        value: value.clone(),
                        formula: input == ValueInput::UserEntered && value.starts_with('='),
                    };
                }
            }
            Ok(())
        })
        .await
    }

    async fn format_range(
        &self,
        sheet: &str,
        _range: GridRange,
        _format: &CellFormat,
    ) -> Result<(), StoreError> {
        self.run(StoreOp::FormatRange, |data| sheet_mut(data, sheet).map(|_| ()))
            .await
    }

    async fn clear_sheet(&self, sheet: &str) -> Result<(), StoreError> {
        self.run(StoreOp::ClearSheet, |data| {
            sheet_mut(data, sheet)?.clear();
            Ok(())
        })
        .await
    }

    async fn sheet_exists(&self, sheet: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .map(|s| s.data.sheets.contains_key(sheet))
            .unwrap_or_default())
    }

    async fn create_sheet_if_absent(
        &self,
        sheet: &str,
        _rows: u32,
        _cols: u32,
    ) -> Result<bool, StoreError> {
        self.run(StoreOp::CreateSheet, |data| {
            if data.sheets.contains_key(sheet) {
                return Ok(false);
            }
            data.sheets.insert(sheet.to_string(), Vec::new());
            Ok(true)
        })
        .await
    }
}

//! Workbook access for roster sync: the tabular store contract, its error
//! taxonomy, the retrying write executor and the two workbook backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roster_core::SchemaError;
use thiserror::Error;

mod memory;
mod retry;
mod sheets;

pub use memory::{MemoryWorkbook, StoreOp};
pub use retry::{FailureClass, PermanentWriteError, RetryExecutor, WritePolicy};
pub use sheets::{SheetsCredentials, SheetsWorkbook};

pub const CRATE_NAME: &str = "roster-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sheet {0:?} does not exist")]
    SheetNotFound(String),
    #[error("invalid cell range {0:?}")]
    InvalidRange(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("local workbook io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Quota and HTTP 429 failures are rate limits; everything else is not.
    pub fn classify(&self) -> FailureClass {
        if let Self::Api { status: 429, .. } = self {
            return FailureClass::RateLimited;
        }
        let message = self.to_string().to_lowercase();
        if message.contains("429") || message.contains("quota") {
            FailureClass::RateLimited
        } else {
            FailureClass::Other
        }
    }
}

/// Spreadsheet column letter for a 0-based column index (`0 -> A`, `26 -> AA`).
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Single cell address: 1-based row, 0-based column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: u32,
    pub col: usize,
}

impl CellRef {
    pub fn new(row: u32, col: usize) -> Self {
        Self { row, col }
    }

    pub fn a1(&self) -> String {
        format!("{}{}", column_letter(self.col), self.row)
    }
}

/// Rectangular area with 0-based, end-exclusive bounds. `end_row: None` spans
/// every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRange {
    pub start_row: u32,
    pub end_row: Option<u32>,
    pub start_col: usize,
    pub end_col: usize,
}

impl GridRange {
    pub fn header(columns: usize) -> Self {
        Self {
            start_row: 0,
            end_row: Some(1),
            start_col: 0,
            end_col: columns,
        }
    }

    pub fn columns(columns: usize) -> Self {
        Self {
            start_row: 0,
            end_row: None,
            start_col: 0,
            end_col: columns,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellFormat {
    pub bold: bool,
    pub font_family: Option<String>,
    pub font_size: Option<u32>,
    pub centered: bool,
    /// RGB components in `0.0..=1.0`.
    pub background: Option<[f32; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueInput {
    Raw,
    UserEntered,
}

impl ValueInput {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::UserEntered => "USER_ENTERED",
        }
    }
}

/// Named tables inside one workbook. Rows come back as displayed values;
/// trailing empty cells may be omitted.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn get_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError>;

    /// Appends after the last non-empty row; returns the 1-based row written.
    async fn append_row(&self, sheet: &str, row: &[String]) -> Result<u32, StoreError>;

    async fn update_cells(
        &self,
        sheet: &str,
        start: CellRef,
        values: &[Vec<String>],
        input: ValueInput,
    ) -> Result<(), StoreError>;

    async fn format_range(
        &self,
        sheet: &str,
        range: GridRange,
        format: &CellFormat,
    ) -> Result<(), StoreError>;

    async fn clear_sheet(&self, sheet: &str) -> Result<(), StoreError>;

    async fn sheet_exists(&self, sheet: &str) -> Result<bool, StoreError>;

    /// Returns `true` when the sheet was created by this call.
    async fn create_sheet_if_absent(
        &self,
        sheet: &str,
        rows: u32,
        cols: u32,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(
        "workbook locator {locator:?} is not a spreadsheet URL, a spreadsheet id, or a file: path"
    )]
    MalformedLocator { locator: String },
    #[error(
        "permission denied for spreadsheet {sheet_id}; {}",
        share_hint(.service_account)
    )]
    PermissionDenied {
        sheet_id: String,
        service_account: Option<String>,
    },
    #[error(
        "spreadsheet {sheet_id} was not found; verify GOOGLE_SHEET_URL and that the sheet exists"
    )]
    NotFound { sheet_id: String },
    #[error("no Sheets access token configured; set GOOGLE_ACCESS_TOKEN")]
    MissingCredentials,
    #[error("invalid column schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("workbook setup failed: {0}")]
    Store(#[from] StoreError),
    #[error("workbook setup failed: {0}")]
    Write(#[from] PermanentWriteError),
}

fn share_hint(service_account: &Option<String>) -> String {
    match service_account {
        Some(email) => format!(
            "share the spreadsheet with {email} and ensure the Sheets and Drive APIs are enabled"
        ),
        None => "share the spreadsheet with the service account and ensure the Sheets and Drive APIs are enabled".to_string(),
    }
}

/// Where the workbook lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkbookLocator {
    Sheets { sheet_id: String },
    Local { path: PathBuf },
}

impl WorkbookLocator {
    /// Accepts `https://docs.google.com/spreadsheets/d/<ID>/...`, a bare
    /// spreadsheet id, or `file:<path>` for a local JSON workbook.
    pub fn parse(raw: &str) -> Result<Self, SetupError> {
        let raw = raw.trim();
        let malformed = || SetupError::MalformedLocator {
            locator: raw.to_string(),
        };

        if let Some(path) = raw.strip_prefix("file:") {
            if path.trim().is_empty() {
                return Err(malformed());
            }
            return Ok(Self::Local {
                path: PathBuf::from(path.trim()),
            });
        }

        if let Some((_, tail)) = raw.split_once("/d/") {
            let key = tail
                .split(|c: char| c == '/' || c == '?' || c == '#')
                .next()
                .unwrap_or_default();
            if key.is_empty() {
                return Err(malformed());
            }
            return Ok(Self::Sheets {
                sheet_id: key.to_string(),
            });
        }

        let looks_like_id = raw.len() >= 40
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if looks_like_id {
            return Ok(Self::Sheets {
                sheet_id: raw.to_string(),
            });
        }

        Err(malformed())
    }
}

#[derive(Debug, Clone)]
pub struct WorkbookOptions {
    pub access_token: Option<String>,
    pub service_account_email: Option<String>,
    pub timeout: Duration,
}

impl Default for WorkbookOptions {
    fn default() -> Self {
        Self {
            access_token: None,
            service_account_email: None,
            timeout: Duration::from_secs(30),
        }
    }
}

pub async fn open_workbook(
    locator: &WorkbookLocator,
    options: &WorkbookOptions,
) -> Result<Arc<dyn TabularStore>, SetupError> {
    match locator {
        WorkbookLocator::Local { path } => {
            let workbook = MemoryWorkbook::open_file(path.clone()).await?;
            Ok(Arc::new(workbook))
        }
        WorkbookLocator::Sheets { sheet_id } => {
            let access_token = options
                .access_token
                .clone()
                .filter(|t| !t.trim().is_empty())
                .ok_or(SetupError::MissingCredentials)?;
            let credentials = SheetsCredentials {
                access_token,
                service_account_email: options.service_account_email.clone(),
            };
            let workbook = SheetsWorkbook::connect(sheet_id, &credentials, options.timeout).await?;
            Ok(Arc::new(workbook))
        }
    }
}

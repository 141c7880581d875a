//! Google Sheets v4 REST backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    column_letter, CellFormat, CellRef, GridRange, SetupError, StoreError, TabularStore,
    ValueInput,
};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Clone)]
pub struct SheetsCredentials {
    pub access_token: String,
    pub service_account_email: Option<String>,
}

#[derive(Debug)]
pub struct SheetsWorkbook {
    client: reqwest::Client,
    spreadsheet_id: String,
    access_token: String,
    sheet_ids: Mutex<HashMap<String, i64>>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    updates: AppendUpdates,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

impl SheetsWorkbook {
    /// Opens the spreadsheet and maps access failures to setup diagnostics.
    pub async fn connect(
        spreadsheet_id: &str,
        credentials: &SheetsCredentials,
        timeout: Duration,
    ) -> Result<Self, SetupError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .map_err(StoreError::from)?;

        let workbook = Self {
            client,
            spreadsheet_id: spreadsheet_id.to_string(),
            access_token: credentials.access_token.clone(),
            sheet_ids: Mutex::new(HashMap::new()),
        };

        match workbook.refresh_sheet_ids().await {
            Ok(count) => {
                info!(spreadsheet_id, sheets = count, "connected to spreadsheet");
                Ok(workbook)
            }
            Err(StoreError::Api { status, .. }) if status == StatusCode::FORBIDDEN.as_u16() => {
                Err(SetupError::PermissionDenied {
                    sheet_id: spreadsheet_id.to_string(),
                    service_account: credentials.service_account_email.clone(),
                })
            }
            Err(StoreError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(SetupError::NotFound {
                    sheet_id: spreadsheet_id.to_string(),
                })
            }
            Err(err) => Err(SetupError::Store(err)),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(SHEETS_API).map_err(|e| StoreError::Decode(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Decode("sheets api url cannot be a base".into()))?
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, StoreError> {
        let last = format!("{range}{suffix}");
        self.url(&[self.spreadsheet_id.as_str(), "values", last.as_str()])
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<JsonValue>,
    ) -> Result<JsonValue, StoreError> {
        debug!(%method, %url, "sheets request");
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.access_token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(JsonValue::Null);
            }
            return serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Api {
            status: status.as_u16(),
            message: api_error_message(&body),
        })
    }

    async fn batch_update(&self, requests: Vec<JsonValue>) -> Result<JsonValue, StoreError> {
        let last = format!("{}:batchUpdate", self.spreadsheet_id);
        let url = self.url(&[last.as_str()])?;
        self.send(Method::POST, url, &[], Some(json!({ "requests": requests })))
            .await
    }

    async fn refresh_sheet_ids(&self) -> Result<usize, StoreError> {
        let url = self.url(&[self.spreadsheet_id.as_str()])?;
        let value = self
            .send(
                Method::GET,
                url,
                &[("fields", "sheets.properties(sheetId,title)")],
                None,
            )
            .await?;
        let meta: SpreadsheetMeta =
            serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut ids = self.sheet_ids.lock().await;
        ids.clear();
        for entry in meta.sheets {
            ids.insert(entry.properties.title, entry.properties.sheet_id);
        }
        Ok(ids.len())
    }

    async fn sheet_id(&self, sheet: &str) -> Result<i64, StoreError> {
        if let Some(id) = self.sheet_ids.lock().await.get(sheet).copied() {
            return Ok(id);
        }
        self.refresh_sheet_ids().await?;
        self.sheet_ids
            .lock()
            .await
            .get(sheet)
            .copied()
            .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))
    }
}

/// `'Sheet Name'!A1` style range, quoting the sheet title.
fn a1_range(sheet: &str, cells: Option<&str>) -> String {
    let quoted = format!("'{}'", sheet.replace('\'', "''"));
    match cells {
        Some(cells) => format!("{quoted}!{cells}"),
        None => quoted,
    }
}

/// First row number in an A1 range such as `'Profiles'!A5:R5`.
fn row_of_a1_range(range: &str) -> Option<u32> {
    let cells = range.rsplit_once('!').map(|(_, c)| c).unwrap_or(range);
    let first = cells.split(':').next()?;
    let digits: String = first
        .chars()
        .skip_while(|c| c.is_ascii_alphabetic() || *c == '$')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.chars().take(300).collect())
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn repeat_cell_request(sheet_id: i64, range: GridRange, format: &CellFormat) -> JsonValue {
    let mut grid = json!({
        "sheetId": sheet_id,
        "startRowIndex": range.start_row,
        "startColumnIndex": range.start_col,
        "endColumnIndex": range.end_col,
    });
    if let Some(end_row) = range.end_row {
        grid["endRowIndex"] = json!(end_row);
    }

    let mut text_format = json!({ "bold": format.bold });
    if let Some(family) = &format.font_family {
        text_format["fontFamily"] = json!(family);
    }
    if let Some(size) = format.font_size {
        text_format["fontSize"] = json!(size);
    }

    let mut cell_format = json!({ "textFormat": text_format });
    let mut fields = vec!["userEnteredFormat.textFormat"];
    if format.centered {
        cell_format["horizontalAlignment"] = json!("CENTER");
        fields.push("userEnteredFormat.horizontalAlignment");
    }
    if let Some([red, green, blue]) = format.background {
        cell_format["backgroundColor"] = json!({ "red": red, "green": green, "blue": blue });
        fields.push("userEnteredFormat.backgroundColor");
    }

    json!({
        "repeatCell": {
            "range": grid,
            "cell": { "userEnteredFormat": cell_format },
            "fields": fields.join(","),
        }
    })
}

#[async_trait]
impl TabularStore for SheetsWorkbook {
    async fn get_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let url = self.values_url(&a1_range(sheet, None), "")?;
        let value = self
            .send(Method::GET, url, &[("majorDimension", "ROWS")], None)
            .await?;
        let range: ValueRange =
            serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(range
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect())
    }

    async fn append_row(&self, sheet: &str, row: &[String]) -> Result<u32, StoreError> {
        let range = a1_range(sheet, Some("A1"));
        let url = self.values_url(&range, ":append")?;
        let value = self
            .send(
                Method::POST,
                url,
                &[
                    ("valueInputOption", ValueInput::Raw.as_api_str()),
                    ("insertDataOption", "INSERT_ROWS"),
                ],
                Some(json!({ "majorDimension": "ROWS", "values": [row] })),
            )
            .await?;
        let response: AppendResponse =
            serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))?;
        row_of_a1_range(&response.updates.updated_range)
            .ok_or(StoreError::InvalidRange(response.updates.updated_range))
    }

    async fn update_cells(
        &self,
        sheet: &str,
        start: CellRef,
        values: &[Vec<String>],
        input: ValueInput,
    ) -> Result<(), StoreError> {
        let height = values.len().max(1) as u32;
        let width = values.iter().map(Vec::len).max().unwrap_or(1).max(1);
        let end = CellRef::new(start.row + height - 1, start.col + width - 1);
        let cells = if end == start {
            start.a1()
        } else {
            format!("{}:{}", start.a1(), end.a1())
        };
        let range = a1_range(sheet, Some(&cells));
        let url = self.values_url(&range, "")?;
        self.send(
            Method::PUT,
            url,
            &[("valueInputOption", input.as_api_str())],
            Some(json!({ "range": range, "majorDimension": "ROWS", "values": values })),
        )
        .await?;
        Ok(())
    }

    async fn format_range(
        &self,
        sheet: &str,
        range: GridRange,
        format: &CellFormat,
    ) -> Result<(), StoreError> {
        let sheet_id = self.sheet_id(sheet).await?;
        self.batch_update(vec![repeat_cell_request(sheet_id, range, format)])
            .await?;
        Ok(())
    }

    async fn clear_sheet(&self, sheet: &str) -> Result<(), StoreError> {
        let url = self.values_url(&a1_range(sheet, None), ":clear")?;
        self.send(Method::POST, url, &[], Some(json!({}))).await?;
        Ok(())
    }

    async fn sheet_exists(&self, sheet: &str) -> Result<bool, StoreError> {
        match self.sheet_id(sheet).await {
            Ok(_) => Ok(true),
            Err(StoreError::SheetNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create_sheet_if_absent(
        &self,
        sheet: &str,
        rows: u32,
        cols: u32,
    ) -> Result<bool, StoreError> {
        if self.sheet_exists(sheet).await? {
            return Ok(false);
        }
        let reply = self
            .batch_update(vec![json!({
                "addSheet": {
                    "properties": {
                        "title": sheet,
                        "gridProperties": { "rowCount": rows, "columnCount": cols },
                    }
                }
            })])
            .await?;
        let sheet_id = reply
            .pointer("/replies/0/addSheet/properties/sheetId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| StoreError::Decode("addSheet reply missing sheetId".into()))?;
        self.sheet_ids.lock().await.insert(sheet.to_string(), sheet_id);
        info!(sheet, sheet_id, last_column = %column_letter(cols.saturating_sub(1) as usize), "created sheet");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_titles_are_quoted_in_ranges() {
        assert_eq!(a1_range("Profiles", None), "'Profiles'");
        assert_eq!(a1_range("Bob's Log", Some("B5")), "'Bob''s Log'!B5");
    }

    #[test]
    fn appended_row_is_read_from_updated_range() {
        assert_eq!(row_of_a1_range("'Profiles'!A5:R5"), Some(5));
        assert_eq!(row_of_a1_range("Log!$A$12:$F$12"), Some(12));
        assert_eq!(row_of_a1_range("Profiles!A:R"), None);
    }

    #[test]
    fn api_errors_prefer_the_google_message() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded for quota metric","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(api_error_message(body), "Quota exceeded for quota metric");
        assert_eq!(api_error_message("plain failure"), "plain failure");
    }

    #[test]
    fn repeat_cell_request_only_masks_requested_fields() {
        let req = repeat_cell_request(
            7,
            GridRange::header(18),
            &CellFormat {
                bold: true,
                centered: true,
                font_size: Some(9),
                ..Default::default()
            },
        );
        let inner = &req["repeatCell"];
        assert_eq!(inner["range"]["sheetId"], 7);
        assert_eq!(inner["range"]["endRowIndex"], 1);
        assert_eq!(inner["range"]["endColumnIndex"], 18);
        assert_eq!(
            inner["fields"],
            "userEnteredFormat.textFormat,userEnteredFormat.horizontalAlignment"
        );
        assert_eq!(inner["cell"]["userEnteredFormat"]["textFormat"]["fontSize"], 9);
    }

    #[test]
    fn formatted_cells_become_strings() {
        assert_eq!(cell_text(&json!("abc")), "abc");
        assert_eq!(cell_text(&json!(12)), "12");
        assert_eq!(cell_text(&JsonValue::Null), "");
    }
}

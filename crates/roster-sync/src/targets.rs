use roster_core::{Target, TargetStatus};
use roster_store::{CellRef, PermanentWriteError, RetryExecutor, TabularStore, ValueInput};

const STATUS_COL: usize = 1;
const REMARKS_COL: usize = 2;

/// Pending rows of the Target table in table order, capped at `max` when
/// `max > 0`.
pub fn select_targets(rows: &[Vec<String>], max: usize) -> Vec<Target> {
    let cell = |cells: &[String], idx: usize| cells.get(idx).map(|c| c.trim().to_string());

    let eligible = rows.iter().enumerate().skip(1).filter_map(|(offset, cells)| {
        let nickname = cell(cells, 0).unwrap_or_default();
        let status = cell(cells, STATUS_COL).unwrap_or_default();
        if nickname.is_empty() || !TargetStatus::is_pending_marker(&status) {
            return None;
        }
        Some(Target {
            nickname,
            row: u32::try_from(offset + 1).ok(),
            source: cell(cells, 3).unwrap_or_else(|| "Manual".to_string()),
        })
    });

    if max > 0 {
        eligible.take(max).collect()
    } else {
        eligible.collect()
    }
}

/// Writes status into column B and remarks into column C of `row`.
pub async fn update_target_status(
    executor: &RetryExecutor,
    store: &dyn TabularStore,
    sheet: &str,
    row: u32,
    status: TargetStatus,
    remarks: &str,
) -> Result<(), PermanentWriteError> {
    let status_value = vec![vec![status.label().to_string()]];
    executor
        .execute(&format!("update {sheet} status"), || {
            store.update_cells(sheet, CellRef::new(row, STATUS_COL), &status_value, ValueInput::Raw)
        })
        .await?;

    let remarks_value = vec![vec![remarks.to_string()]];
    executor
        .execute(&format!("update {sheet} remarks"), || {
            store.update_cells(sheet, CellRef::new(row, REMARKS_COL), &remarks_value, ValueInput::Raw)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_store::{MemoryWorkbook, WritePolicy};
    use std::time::Duration;

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn queue() -> Vec<Vec<String>> {
        rows(&[
            &["Nickname", "Status", "Remarks", "Source"],
            &["alice", "Pending", "", "Import"],
            &["bob", "Done", "", ""],
            &["", "pending", "", ""],
            &["carol", " PENDING 🚨 ", ""],
            &["dave", "pending"],
            &["erin", "Error", "timeout", "Manual"],
        ])
    }

    #[test]
    fn pending_rows_are_returned_in_table_order() {
        let targets = select_targets(&queue(), 0);
        let picked: Vec<_> = targets
            .iter()
            .map(|t| (t.nickname.as_str(), t.row, t.source.as_str()))
            .collect();
        assert_eq!(
            picked,
            vec![
                ("alice", Some(2), "Import"),
                ("carol", Some(5), "Manual"),
                ("dave", Some(6), "Manual"),
            ]
        );
    }

    #[test]
    fn cap_truncates_without_reordering() {
        let targets = select_targets(&queue(), 2);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].nickname, "alice");
        assert_eq!(targets[1].nickname, "carol");
        assert_eq!(select_targets(&queue(), 10).len(), 3);
    }

    #[tokio::test]
    async fn status_and_remarks_land_in_columns_b_and_c() {
        let store = MemoryWorkbook::new().with_sheet("Target", queue());
        let executor = RetryExecutor::new(WritePolicy {
            write_delay: Duration::ZERO,
            ..WritePolicy::default()
        });

        update_target_status(&executor, &store, "Target", 2, TargetStatus::Done, "New profile")
            .await
            .unwrap();

        let table = store.rows("Target");
        assert_eq!(table[1], vec!["alice", "Done", "New profile", "Import"]);
    }
}

use std::collections::HashMap;

use roster_core::{ColumnSchema, Identity, RowSnapshot};

/// Latest stored row per identity in the Profiles table.
///
/// When an identity has several rows (one per past update) the last one
/// scanned wins; the newest append is the authoritative state.
#[derive(Debug, Clone, Default)]
pub struct ExistingIndex {
    rows: HashMap<Identity, RowSnapshot>,
}

impl ExistingIndex {
    /// `rows` is the whole table including its header.
    pub fn from_rows(rows: &[Vec<String>], schema: &ColumnSchema) -> Self {
        let identity_col = schema.identity_index();
        let mut index = Self::default();

        for (offset, cells) in rows.iter().enumerate().skip(1) {
            let Some(identity) = cells.get(identity_col).and_then(|c| Identity::parse(c)) else {
                continue;
            };
            let row = u32::try_from(offset + 1).unwrap_or(u32::MAX);
            index.rows.insert(
                identity,
                RowSnapshot {
                    row,
                    cells: cells.clone(),
                },
            );
        }
        index
    }

    pub fn get(&self, identity: &Identity) -> Option<&RowSnapshot> {
        self.rows.get(identity)
    }

    pub(crate) fn insert(&mut self, identity: Identity, snapshot: RowSnapshot) {
        self.rows.insert(identity, snapshot);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

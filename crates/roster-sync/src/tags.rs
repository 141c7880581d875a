use std::collections::HashMap;

use roster_core::Identity;

/// Identity to comma-joined tag list, built from the wide Tags table.
#[derive(Debug, Clone, Default)]
pub struct TagMapping {
    tags: HashMap<Identity, String>,
}

impl TagMapping {
    /// Row 0 names the tags; each later row lists nicknames under the tag
    /// columns they belong to.
    pub fn from_table(rows: &[Vec<String>]) -> Self {
        let mut mapping = Self::default();
        let Some((headers, body)) = rows.split_first() else {
            return mapping;
        };

        for (col, tag) in headers.iter().enumerate() {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            for row in body {
                let Some(identity) = row.get(col).and_then(|cell| Identity::parse(cell)) else {
                    continue;
                };
                mapping
                    .tags
                    .entry(identity)
                    .and_modify(|existing| {
                        existing.push_str(", ");
                        existing.push_str(tag);
                    })
                    .or_insert_with(|| tag.to_string());
            }
        }
        mapping
    }

    pub fn tags_for(&self, identity: &Identity) -> &str {
        self.tags.get(identity).map(String::as_str).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn id(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    #[test]
    fn identity_under_two_tags_accumulates_in_column_order() {
        let mapping = TagMapping::from_table(&table(&[
            &["VIP", "Flagged", "  "],
            &["Alice", "bob", "carol"],
            &["", "ALICE"],
        ]));
        assert_eq!(mapping.tags_for(&id("alice")), "VIP, Flagged");
        assert_eq!(mapping.tags_for(&id("Bob")), "Flagged");
        // Blank tag header columns are ignored entirely.
        assert_eq!(mapping.tags_for(&id("carol")), "");
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn header_only_or_missing_table_yields_empty_mapping() {
        assert!(TagMapping::from_table(&[]).is_empty());
        assert!(TagMapping::from_table(&table(&[&["VIP", "Flagged"]])).is_empty());
    }
}

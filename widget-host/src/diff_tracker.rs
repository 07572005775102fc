//! Diff Tracker
//!
//! Line ranges that differ between two versions of widget code, and the
//! list of audit changes a user has queued for the next apply request.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

/// Closed, 1-based range of changed lines. Serialized as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[usize; 2]", into = "[usize; 2]")]
pub struct ChangeRange {
    pub start_line: usize,
    pub end_line: usize,
}

impl From<[usize; 2]> for ChangeRange {
    fn from([start_line, end_line]: [usize; 2]) -> Self {
        Self { start_line, end_line }
    }
}

impl From<ChangeRange> for [usize; 2] {
    fn from(range: ChangeRange) -> Self {
        [range.start_line, range.end_line]
    }
}

/// Lines of `next` that differ from `prev`, compared index by index
pub fn compute_changed_ranges(next: &str, prev: &str) -> Vec<ChangeRange> {
    let next_lines: Vec<&str> = next.split('\n').collect();
    let prev_lines: Vec<&str> = prev.split('\n').collect();
    let max_len = next_lines.len().max(prev_lines.len());

    let mut ranges: Vec<ChangeRange> = Vec::new();
    for i in 0..max_len {
        if next_lines.get(i) == prev_lines.get(i) {
            continue;
        }
        let line = i + 1;
        match ranges.last_mut() {
            Some(range) if range.end_line + 1 == line => range.end_line = line,
            _ => ranges.push(ChangeRange {
                start_line: line,
                end_line: line,
            }),
        }
    }
    ranges
}

/// Line counts of a code replacement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub inserted: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ChangeSummary {
    pub fn is_unchanged(&self) -> bool {
        self.inserted == 0 && self.deleted == 0
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{} -{} lines", self.inserted, self.deleted)
    }
}

pub fn summarize_change(prev: &str, next: &str) -> ChangeSummary {
    let diff = TextDiff::from_lines(prev, next);
    let mut summary = ChangeSummary::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => summary.inserted += 1,
            ChangeTag::Delete => summary.deleted += 1,
            ChangeTag::Equal => summary.unchanged += 1,
        }
    }
    summary
}

/// An audit concern the user queued for the next apply request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub item_id: String,
    pub card_id: String,
    pub label: String,
    /// Which audit produced it, or "manual"
    #[serde(default)]
    pub source_description: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub user_note: String,
}

/// Queued changes, unique by `item_id`, in the order they were added
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChanges {
    items: Vec<PendingChange>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// False when an item with the same id is already queued
    pub fn add(&mut self, change: PendingChange) -> bool {
        if self.items.iter().any(|item| item.item_id == change.item_id) {
            return false;
        }
        self.items.push(change);
        true
    }

    pub fn remove(&mut self, item_id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.item_id != item_id);
        self.items.len() != before
    }

    pub fn set_note(&mut self, item_id: &str, note: &str) -> bool {
        match self.items.iter_mut().find(|item| item.item_id == item_id) {
            Some(item) => {
                item.user_note = note.trim().to_string();
                true
            }
            None => false,
        }
    }

    pub fn items(&self) -> &[PendingChange] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Everything queued plus an optional free-form note, emptying the queue
    pub fn take_for_apply(&mut self, note: &str) -> Vec<PendingChange> {
        let mut changes = std::mem::take(&mut self.items);
        let note = note.trim();
        if !note.is_empty() {
            changes.push(PendingChange {
                item_id: format!("manual-{}", chrono::Utc::now().timestamp_millis()),
                card_id: "manual".to_string(),
                label: note.to_string(),
                source_description: "manual".to_string(),
                summary: note.to_string(),
                location: Some("global".to_string()),
                user_note: note.to_string(),
            });
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(next: &str, prev: &str) -> Vec<[usize; 2]> {
        compute_changed_ranges(next, prev)
            .into_iter()
            .map(Into::into)
            .collect()
    }

    #[test]
    fn test_changed_ranges() {
        assert_eq!(ranges("a\nx\nc", "a\nb\nc"), vec![[2, 2]]);
        assert_eq!(ranges("a\nb\nc", "a\nb"), vec![[3, 3]]);
        assert_eq!(ranges("a", "a"), Vec::<[usize; 2]>::new());
    }

    #[test]
    fn test_consecutive_lines_fold() {
        assert_eq!(
            ranges("1\nx\ny\n4\nz", "1\n2\n3\n4\n5"),
            vec![[2, 3], [5, 5]]
        );
        assert_eq!(ranges("", "a\nb"), vec![[1, 2]]);
    }

    #[test]
    fn test_ranges_serialize_as_pairs() {
        let json = serde_json::to_value(compute_changed_ranges("a\nx", "a\nb")).unwrap();
        assert_eq!(json, serde_json::json!([[2, 2]]));
    }

    #[test]
    fn test_summarize_change() {
        let summary = summarize_change("a\nb\nc\n", "a\nx\nc\nd\n");
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.to_string(), "+2 -1 lines");
        assert!(summarize_change("same\n", "same\n").is_unchanged());
    }

    #[test]
    fn test_pending_changes_dedupe_and_note() {
        let change = |id: &str| PendingChange {
            item_id: id.to_string(),
            card_id: "card".to_string(),
            label: format!("fix {}", id),
            source_description: "fast audit".to_string(),
            summary: String::new(),
            location: None,
            user_note: String::new(),
        };

        let mut pending = PendingChanges::new();
        assert!(pending.add(change("a")));
        assert!(!pending.add(change("a")));
        assert!(pending.add(change("b")));
        assert!(pending.set_note("b", "  keep colors  "));
        assert!(pending.remove("a"));

        let taken = pending.take_for_apply("also add a legend");
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].user_note, "keep colors");
        assert_eq!(taken[1].card_id, "manual");
        assert!(pending.is_empty());
    }
}

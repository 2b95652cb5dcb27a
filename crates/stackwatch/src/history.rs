use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One observation of a variable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRecord {
    /// Source line of the frame when the value was observed; `None` when the
    /// method carries no line information.
    pub line: Option<u32>,
    pub value: String,
}

impl ValueRecord {
    pub fn new(line: Option<u32>, value: impl Into<String>) -> Self {
        Self {
            line,
            value: value.into(),
        }
    }
}

impl fmt::Display for ValueRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.value),
            None => write!(f, "line ?: {}", self.value),
        }
    }
}

/// Append-only sequence of distinct consecutive values; the last record is
/// the most recent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableHistory {
    records: Vec<ValueRecord>,
}

impl VariableHistory {
    pub fn records(&self) -> &[ValueRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&ValueRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append unless the value equals the most recent one. Lines are not
    /// compared.
    fn push_if_changed(&mut self, line: Option<u32>, value: &str) -> bool {
        if self.last().is_some_and(|last| last.value == value) {
            return false;
        }
        self.records.push(ValueRecord::new(line, value));
        true
    }
}

/// Session-wide store of variable histories, keyed by variable name.
///
/// Shared behind an `Arc` between the extractor, which writes once per
/// suspension, and any number of readers.
#[derive(Debug, Default)]
pub struct HistoryCache {
    histories: RwLock<HashMap<String, VariableHistory>>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_history(&self, name: &str) -> Option<Vec<ValueRecord>> {
        self.histories
            .read()
            .get(name)
            .map(|history| history.records().to_vec())
    }

    /// Names of every tracked variable, sorted.
    pub fn get_all_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.histories.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_most_recent_update(&self, name: &str) -> Option<ValueRecord> {
        self.histories
            .read()
            .get(name)
            .and_then(|history| history.last().cloned())
    }

    /// Record `value` for `name`; returns whether a record was appended.
    pub fn put(&self, name: &str, line: Option<u32>, value: &str) -> bool {
        let mut histories = self.histories.write();
        Self::put_locked(&mut histories, name, line, value)
    }

    /// Record one extraction cycle under a single write lock, so readers see
    /// either none or all of it. Returns the number of records appended.
    pub fn put_all<'a, I>(&self, line: Option<u32>, values: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut histories = self.histories.write();
        let mut appended = 0;
        for (name, value) in values {
            if Self::put_locked(&mut histories, name, line, value) {
                appended += 1;
            }
        }
        appended
    }

    fn put_locked(
        histories: &mut HashMap<String, VariableHistory>,
        name: &str,
        line: Option<u32>,
        value: &str,
    ) -> bool {
        let appended = match histories.get_mut(name) {
            Some(history) => history.push_if_changed(line, value),
            None => histories
                .entry(name.to_owned())
                .or_default()
                .push_if_changed(line, value),
        };
        if appended {
            tracing::trace!(target: "stackwatch", name, ?line, value, "variable changed");
        }
        appended
    }

    /// Forget every variable.
    pub fn clear(&self) {
        *self.histories.write() = HashMap::new();
    }

    /// Copy of every history, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, VariableHistory> {
        self.histories
            .read()
            .iter()
            .map(|(name, history)| (name.clone(), history.clone()))
            .collect()
    }

    /// The snapshot as JSON: `{"name": [{"line": 3, "value": "1"}, ...]}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for HistoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CACHE:\n\n")?;
        for (name, history) in self.snapshot() {
            writeln!(f, "{name}")?;
            for record in history.records() {
                writeln!(f, "  {record}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn history_follows_put_order_without_consecutive_duplicates() {
        let cache = HistoryCache::new();
        assert!(cache.put("x", Some(1), "1"));
        assert!(!cache.put("x", Some(2), "1"));
        assert!(cache.put("x", Some(3), "2"));
        assert!(cache.put("x", Some(4), "1"));

        assert_eq!(
            cache.get_history("x").unwrap(),
            vec![
                ValueRecord::new(Some(1), "1"),
                ValueRecord::new(Some(3), "2"),
                ValueRecord::new(Some(4), "1"),
            ]
        );
    }

    #[test]
    fn duplicate_keeps_first_line() {
        let cache = HistoryCache::new();
        cache.put("x", Some(5), "V");
        cache.put("x", Some(6), "V");
        assert_eq!(
            cache.get_history("x").unwrap(),
            vec![ValueRecord::new(Some(5), "V")]
        );
    }

    #[test]
    fn most_recent_is_last_record() {
        let cache = HistoryCache::new();
        assert_eq!(cache.get_most_recent_update("x"), None);
        assert_eq!(cache.get_history("x"), None);

        cache.put("x", Some(1), "a");
        cache.put("x", None, "b");
        assert_eq!(
            cache.get_most_recent_update("x"),
            Some(ValueRecord::new(None, "b"))
        );
        assert_eq!(
            cache.get_history("x").unwrap().last().cloned(),
            cache.get_most_recent_update("x")
        );
    }

    #[test]
    fn clear_forgets_everything() {
        let cache = HistoryCache::new();
        cache.put("a", Some(1), "1");
        cache.put("b", Some(1), "2");
        assert_eq!(cache.get_all_variables(), vec!["a", "b"]);

        cache.clear();
        assert!(cache.get_all_variables().is_empty());
        assert_eq!(cache.get_history("a"), None);
        assert_eq!(cache.get_most_recent_update("b"), None);
    }

    #[test]
    fn put_all_counts_appended_records() {
        let cache = HistoryCache::new();
        cache.put("a", Some(1), "3");
        let appended = cache.put_all(Some(2), [("a", "3"), ("b", "[4, 5]")]);
        assert_eq!(appended, 1);
        assert_eq!(
            cache.get_most_recent_update("b"),
            Some(ValueRecord::new(Some(2), "[4, 5]"))
        );
    }

    #[test]
    fn display_and_json_dump() {
        let cache = HistoryCache::new();
        cache.put("b", Some(7), "2");
        cache.put("a", None, "1");
        cache.put("a", Some(9), "\"s\"");

        assert_eq!(
            cache.to_string(),
            "CACHE:\n\na\n  line ?: 1\n  line 9: \"s\"\n\nb\n  line 7: 2\n\n"
        );
        assert_eq!(
            cache.to_json(),
            serde_json::json!({
                "a": [{"line": null, "value": "1"}, {"line": 9, "value": "\"s\""}],
                "b": [{"line": 7, "value": "2"}],
            })
        );
    }

    #[test]
    fn concurrent_writers_append_in_call_order_per_thread() {
        let cache = Arc::new(HistoryCache::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let name = format!("v{t}");
                    for i in 0..50 {
                        cache.put(&name, Some(i), &i.to_string());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4 {
            let history = cache.get_history(&format!("v{t}")).unwrap();
            let values: Vec<u32> = history.iter().map(|r| r.value.parse().unwrap()).collect();
            assert_eq!(values, (0..50).collect::<Vec<_>>());
        }
    }
}

//! Cross-script function deduplication.
//!
//! Functions are keyed by a SHA-256 of their stateless rendering (names and
//! global indices replaced with placeholders). The registry is shared by
//! every worker in a batch run, so mutation happens under one lock for the
//! whole lookup-then-merge step.

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn count_lines(s: &str) -> usize {
    if s.is_empty() { 0 } else { s.lines().count() }
}

/// Globals stay script-specific, so a literal referencing one disqualifies
/// placeholder substitution.
pub fn can_aggregate_literal(lit: &str) -> bool {
    !lit.starts_with("Global")
}

#[derive(Debug, Clone)]
pub struct AggregateEntry {
    pub aggregate_name: String,
    pub aggregate_text: String,
    /// `script.function` of the canonical representative.
    pub function_name: String,
    pub function_text: String,
    pub hits: Vec<String>,
}

impl AggregateEntry {
    /// Merge a duplicate; the lexicographically-earliest qualifying name
    /// stays canonical, everything else becomes a hit line.
    fn add(&mut self, function_name: &str, function_text: &str) {
        if self
            .function_name
            .to_lowercase()
            .cmp(&function_name.to_lowercase())
            == std::cmp::Ordering::Greater
        {
            self.hits.push(format!("// Hit: {}", self.function_name));
            self.function_name = function_name.to_string();
            self.function_text = function_text.to_string();
        } else {
            self.hits.push(format!("// Hit: {function_name}"));
        }
    }
}

#[derive(Default)]
pub struct AggregateRegistry {
    entries: Mutex<HashMap<String, AggregateEntry>>,
    pub min_lines: usize,
    pub min_hits: usize,
}

impl AggregateRegistry {
    pub fn new(min_lines: usize, min_hits: usize) -> Self {
        AggregateRegistry {
            entries: Mutex::new(HashMap::new()),
            min_lines,
            min_hits,
        }
    }

    /// Register one decompiled function. Only functions that call at least
    /// one native and meet the line threshold participate.
    pub fn push(
        &self,
        native_count: usize,
        function_name: &str,
        function_text: &str,
        stateless_text: &str,
    ) {
        if native_count == 0 || count_lines(stateless_text) < self.min_lines {
            return;
        }
        let hash = sha256_hex(stateless_text);
        let mut entries = self.entries.lock();
        let next_index = entries.len();
        match entries.get_mut(&hash) {
            Some(entry) => entry.add(function_name, function_text),
            None => {
                entries.insert(
                    hash,
                    AggregateEntry {
                        aggregate_name: format!("Aggregate_{next_index}"),
                        aggregate_text: stateless_text.to_string(),
                        function_name: function_name.to_string(),
                        function_text: function_text.to_string(),
                        hits: Vec::new(),
                    },
                );
            }
        }
    }

    pub fn lookup(&self, stateless_text: &str) -> Option<AggregateEntry> {
        self.entries.lock().get(&sha256_hex(stateless_text)).cloned()
    }

    fn ranked(&self) -> Vec<(String, AggregateEntry)> {
        let entries = self.entries.lock();
        let mut list: Vec<(String, AggregateEntry)> =
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        list.sort_by(|a, b| {
            b.1.hits
                .len()
                .cmp(&a.1.hits.len())
                .then_with(|| a.1.aggregate_name.cmp(&b.1.aggregate_name))
        });
        list
    }

    /// The batch `_aggregate.c` report: duplicate groups ranked by hit
    /// count, each with its canonical body and sorted hit lines.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (hash, entry) in self.ranked() {
            if entry.hits.len() < self.min_hits {
                continue;
            }
            out.push_str(&format!("// {hash}\n"));
            out.push_str(&format!("// Base: {}\n", entry.function_name));
            let mut hits = entry.hits.clone();
            hits.sort();
            for hit in hits {
                out.push_str(&hit);
                out.push('\n');
            }
            out.push_str(&entry.function_text);
            out.push('\n');
        }
        out
    }

    /// The placeholder-form bodies of every qualifying group.
    pub fn definitions(&self) -> String {
        let mut out = String::new();
        for (hash, entry) in self.ranked() {
            if entry.hits.len() < self.min_hits {
                continue;
            }
            out.push_str(&format!("// {hash}\n"));
            out.push_str(&format!("// Base: {}\n", entry.function_name));
            out.push_str(&entry.aggregate_text);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "void func_1()\n{\n\tWAIT(0);\n\tWAIT(1);\n}";

    #[test]
    fn identical_bodies_merge_into_one_entry() {
        let reg = AggregateRegistry::new(3, 1);
        reg.push(1, "scripta.func_1", BODY, BODY);
        reg.push(1, "scriptb.func_9", BODY, BODY);
        let entry = reg.lookup(BODY).unwrap();
        assert_eq!(entry.function_name, "scripta.func_1");
        assert_eq!(entry.hits, vec!["// Hit: scriptb.func_9".to_string()]);
    }

    #[test]
    fn canonical_name_is_lexicographically_earliest() {
        let reg = AggregateRegistry::new(1, 1);
        reg.push(1, "zeta.func_1", BODY, BODY);
        reg.push(1, "alpha.func_2", BODY, BODY);
        let entry = reg.lookup(BODY).unwrap();
        assert_eq!(entry.function_name, "alpha.func_2");
        assert_eq!(entry.hits, vec!["// Hit: zeta.func_1".to_string()]);
    }

    #[test]
    fn thresholds_filter_candidates() {
        let reg = AggregateRegistry::new(100, 1);
        reg.push(1, "a.f", BODY, BODY);
        assert!(reg.lookup(BODY).is_none());

        let reg = AggregateRegistry::new(1, 1);
        reg.push(0, "a.f", BODY, BODY);
        assert!(reg.lookup(BODY).is_none());
    }

    #[test]
    fn report_honors_min_hits() {
        let reg = AggregateRegistry::new(1, 2);
        reg.push(1, "a.f", BODY, BODY);
        reg.push(1, "b.f", BODY, BODY);
        assert_eq!(reg.report(), "");
        reg.push(1, "c.f", BODY, BODY);
        let report = reg.report();
        assert!(report.contains("// Base: a.f"));
        assert!(report.contains("// Hit: b.f"));
        assert!(report.contains("// Hit: c.f"));
    }

    #[test]
    fn global_literals_are_excluded() {
        assert!(!can_aggregate_literal("Global_100"));
        assert!(can_aggregate_literal("Local_2"));
    }
}

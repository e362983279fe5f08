//! Executer counters.
//!
//! Counters are declared once in [`COUNTER_TABLE`]; serialization,
//! aggregation and loading all iterate that table instead of naming fields
//! one by one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    ReportStatusOk,
    ReportStatusNotOk,
    TasksStarted,
    StartRetries,
    ChannelUpdatesSent,
    ComputeActorsAborted,
    ResultBatches,
    RequestUnits,
}

pub struct CounterDef {
    pub counter: Counter,
    pub name: &'static str,
}

pub const COUNTER_TABLE: [CounterDef; 8] = [
    CounterDef { counter: Counter::ReportStatusOk, name: "executer.report_status_ok" },
    CounterDef { counter: Counter::ReportStatusNotOk, name: "executer.report_status_not_ok" },
    CounterDef { counter: Counter::TasksStarted, name: "executer.tasks_started" },
    CounterDef { counter: Counter::StartRetries, name: "executer.start_retries" },
    CounterDef { counter: Counter::ChannelUpdatesSent, name: "executer.channel_updates_sent" },
    CounterDef { counter: Counter::ComputeActorsAborted, name: "executer.compute_actors_aborted" },
    CounterDef { counter: Counter::ResultBatches, name: "executer.result_batches" },
    CounterDef { counter: Counter::RequestUnits, name: "executer.request_units" },
];

/// Lock-free counter block shared by every executer of one database.
#[derive(Debug, Default)]
pub struct ExecuterCounters {
    values: [AtomicU64; COUNTER_TABLE.len()],
}

impl ExecuterCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        &self.values[counter as usize]
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: u64) {
        if value != 0 {
            self.slot(counter).fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Serializes every counter under its table name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        COUNTER_TABLE
            .iter()
            .map(|def| (def.name, self.get(def.counter)))
            .collect()
    }

    /// Adds every counter of `other` into `self`.
    pub fn aggregate_from(&self, other: &ExecuterCounters) {
        for def in COUNTER_TABLE.iter() {
            self.add(def.counter, other.get(def.counter));
        }
    }

    /// Overwrites counters from a serialized snapshot, ignoring unknown names.
    pub fn load(&self, values: &BTreeMap<String, u64>) {
        for (name, value) in values {
            match COUNTER_TABLE.iter().find(|def| def.name == name) {
                Some(def) => self.slot(def.counter).store(*value, Ordering::Relaxed),
                None => warn!(counter = %name, "ignoring unknown counter"),
            }
        }
    }
}

/// Per-database counters, created at server start and shared by every
/// executer running against that database.
#[derive(Debug, Default)]
pub struct DbCountersRegistry {
    databases: RwLock<HashMap<String, Arc<ExecuterCounters>>>,
}

impl DbCountersRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_database(&self, database: &str) -> Arc<ExecuterCounters> {
        {
            let guard = self.databases.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counters) = guard.get(database) {
                return counters.clone();
            }
        }
        let mut guard = self.databases.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(database.to_string())
            .or_insert_with(|| Arc::new(ExecuterCounters::new()))
            .clone()
    }

    /// Sums the counters of every database.
    pub fn aggregate(&self) -> ExecuterCounters {
        let total = ExecuterCounters::new();
        let guard = self.databases.read().unwrap_or_else(|e| e.into_inner());
        for counters in guard.values() {
            total.aggregate_from(counters);
        }
        total
    }

    pub fn databases(&self) -> Vec<String> {
        let guard = self.databases.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_order_matches_enum_discriminants() {
        for (i, def) in COUNTER_TABLE.iter().enumerate() {
            assert_eq!(def.counter as usize, i, "{} is out of place", def.name);
        }
    }

    #[test]
    fn snapshot_and_load_use_table_names() {
        let counters = ExecuterCounters::new();
        counters.inc(Counter::TasksStarted);
        counters.add(Counter::RequestUnits, 250);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot["executer.tasks_started"], 1);
        assert_eq!(snapshot["executer.request_units"], 250);

        let restored = ExecuterCounters::new();
        let owned: BTreeMap<String, u64> =
            snapshot.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        restored.load(&owned);
        assert_eq!(restored.get(Counter::RequestUnits), 250);
    }

    #[test]
    fn registry_aggregates_across_databases() {
        let registry = DbCountersRegistry::new();
        registry.for_database("/Root/a").inc(Counter::ReportStatusOk);
        registry.for_database("/Root/b").inc(Counter::ReportStatusOk);
        registry.for_database("/Root/a").inc(Counter::ReportStatusNotOk);

        let total = registry.aggregate();
        assert_eq!(total.get(Counter::ReportStatusOk), 2);
        assert_eq!(total.get(Counter::ReportStatusNotOk), 1);
        assert_eq!(registry.databases(), vec!["/Root/a".to_string(), "/Root/b".to_string()]);
    }
}

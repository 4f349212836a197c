use crate::calendar::{CalendarWindow, MonthKey, PeriodKey};
use crate::error::AppError;
use crate::models::PeriodBilling;
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::hash::Hash;
use tracing::debug;

/// Stores `value` only if `key` is vacant. Returns whether it was stored.
pub fn insert_if_absent<K: Hash + Eq, V>(map: &DashMap<K, V>, key: K, value: V) -> bool {
    match map.entry(key) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(value);
            true
        }
    }
}

/// Inserts `value`, or folds it into the existing entry with `merge` while
/// the entry's shard is locked.
pub fn upsert_with<K: Hash + Eq, V, E>(
    map: &DashMap<K, V>,
    key: K,
    value: V,
    merge: impl FnOnce(&mut V, V) -> Result<(), E>,
) -> Result<(), E> {
    match map.entry(key) {
        Entry::Occupied(mut existing) => merge(existing.get_mut(), value),
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
    }
}

/// Cloned values, so no shard guard outlives the call.
pub fn values<K: Hash + Eq, V: Clone>(map: &DashMap<K, V>) -> Vec<V> {
    map.iter().map(|entry| entry.value().clone()).collect()
}

/// Canonical day and month billing records. A record is created once per
/// key and afterwards only changes through merge.
#[derive(Debug, Default)]
pub struct RollupStore {
    days: DashMap<NaiveDate, PeriodBilling>,
    months: DashMap<MonthKey, PeriodBilling>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollupSnapshot {
    pub days: BTreeMap<String, PeriodBilling>,
    pub months: BTreeMap<String, PeriodBilling>,
}

impl RollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: PeriodKey) -> Option<PeriodBilling> {
        match key {
            PeriodKey::Day(day) => self.day(day),
            PeriodKey::Month(month) => self.month(month),
        }
    }

    pub fn day(&self, day: NaiveDate) -> Option<PeriodBilling> {
        self.days.get(&day).map(|r| r.value().clone())
    }

    pub fn month(&self, month: MonthKey) -> Option<PeriodBilling> {
        self.months.get(&month).map(|r| r.value().clone())
    }

    pub fn contains(&self, key: PeriodKey) -> bool {
        match key {
            PeriodKey::Day(day) => self.days.contains_key(&day),
            PeriodKey::Month(month) => self.months.contains_key(&month),
        }
    }

    /// Keys of `window` without a record yet, months first.
    pub fn missing(&self, window: &CalendarWindow) -> Vec<PeriodKey> {
        window.periods().filter(|key| !self.contains(*key)).collect()
    }

    /// Stores `record` unless its period already has one.
    pub fn load_if_absent(&self, record: PeriodBilling) -> bool {
        match record.period {
            PeriodKey::Day(day) => insert_if_absent(&self.days, day, record),
            PeriodKey::Month(month) => insert_if_absent(&self.months, month, record),
        }
    }

    /// Inserts `record` or merges it into the existing one for its period.
    pub fn merge(&self, record: PeriodBilling) -> Result<(), AppError> {
        let merge = |existing: &mut PeriodBilling, incoming: PeriodBilling| {
            existing.merge_from(incoming)
        };
        match record.period {
            PeriodKey::Day(day) => upsert_with(&self.days, day, record, merge),
            PeriodKey::Month(month) => upsert_with(&self.months, month, record, merge),
        }
    }

    /// Merges every record of `other` (another account's store) into this
    /// one. Stops at the first mismatch.
    pub fn absorb(&self, other: &RollupStore) -> Result<(), AppError> {
        let mut merged = 0usize;
        let records = values(&other.days)
            .into_iter()
            .chain(values(&other.months));
        for record in records {
            self.merge(record)?;
            merged += 1;
        }
        debug!(merged, "rollup store absorbed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.days.len() + self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> RollupSnapshot {
        RollupSnapshot {
            days: values(&self.days)
                .into_iter()
                .map(|r| (r.period.to_string(), r))
                .collect(),
            months: values(&self.months)
                .into_iter()
                .map(|r| (r.period.to_string(), r))
                .collect(),
        }
    }
}

//! Working memory pool: the bounded set of "hot" tasks.
//!
//! Bounded by an entry count and a total resident weight. Eviction removes
//! entries from the pool only; task records are never touched here.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PoolSettings;
use crate::registry::TaskRegistry;
use crate::scorer::half_life_decay;
use crate::task::{Task, TaskId};

/// A resident pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub task_id: TaskId,
    pub access_count: u32,
    pub last_admitted_at: DateTime<Utc>,
    /// `context_size` of the task when it was admitted.
    pub resident_weight: u64,
}

/// Result of an admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Already resident; access recorded.
    Refreshed,
    /// Newly resident, possibly after evicting others.
    Admitted { evicted: Vec<TaskId> },
    /// Cannot fit next to the resident ACTIVE entry; nothing was evicted.
    Rejected,
}

impl Admission {
    pub fn evicted(&self) -> &[TaskId] {
        match self {
            Admission::Admitted { evicted } => evicted,
            _ => &[],
        }
    }
}

/// Bounded working-memory cache.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingMemoryPool {
    settings: PoolSettings,
    entries: Vec<PoolEntry>,
}

impl WorkingMemoryPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            entries: Vec::new(),
        }
    }

    /// Rebuild from persisted entries, dropping those whose task is gone or finished.
    pub fn restore(settings: PoolSettings, entries: Vec<PoolEntry>, registry: &TaskRegistry) -> Self {
        let mut seen = std::collections::BTreeSet::new();
        let entries = entries
            .into_iter()
            .filter(|e| {
                registry.get(&e.task_id).is_some_and(|t| !t.status.is_terminal()) && seen.insert(e.task_id.clone())
            })
            .collect();
        Self { settings, entries }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.iter().any(|e| &e.task_id == id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&PoolEntry> {
        self.entries.iter().find(|e| &e.task_id == id)
    }

    /// Total resident weight.
    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|e| e.resident_weight).sum()
    }

    /// Whether both limits hold.
    pub fn within_limits(&self) -> bool {
        self.entries.len() <= self.settings.max_entries && self.total_weight() <= self.settings.max_weight
    }

    /// Eviction score of an entry; lower is evicted first.
    pub fn eviction_score(&self, entry: &PoolEntry, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - entry.last_admitted_at).num_milliseconds() as f64 / 1000.0;
        let recency = half_life_decay(elapsed, self.settings.half_life_secs);
        let weight_factor = if self.settings.max_weight == 0 {
            1.0
        } else {
            1.0 / (1.0 + entry.resident_weight as f64 / self.settings.max_weight as f64)
        };
        entry.access_count.max(1) as f64 * recency * weight_factor
    }

    fn eviction_order(&self, a: &PoolEntry, b: &PoolEntry, now: DateTime<Utc>) -> Ordering {
        self.eviction_score(a, now)
            .partial_cmp(&self.eviction_score(b, now))
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.resident_weight.cmp(&a.resident_weight))
            .then_with(|| a.last_admitted_at.cmp(&b.last_admitted_at))
            .then_with(|| a.task_id.cmp(&b.task_id))
    }

    /// Admit or refresh `task`. `active` is never evicted.
    pub fn admit(&mut self, task: &Task, active: Option<&TaskId>, now: DateTime<Utc>) -> Admission {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.task_id == task.id) {
            entry.access_count = entry.access_count.saturating_add(1);
            if now > entry.last_admitted_at {
                entry.last_admitted_at = now;
            }
            return Admission::Refreshed;
        }

        let incoming_is_active = active == Some(&task.id);
        let weight = task.context_size;

        // The ACTIVE entry stays no matter what; refuse a candidate that
        // cannot sit next to it instead of evicting for nothing.
        if !incoming_is_active {
            let pinned: Vec<&PoolEntry> = self.entries.iter().filter(|e| Some(&e.task_id) == active).collect();
            let pinned_weight: u64 = pinned.iter().map(|e| e.resident_weight).sum();
            if pinned.len() + 1 > self.settings.max_entries
                || pinned_weight.saturating_add(weight) > self.settings.max_weight
            {
                log::debug!("pool rejected {}: does not fit beside the active task", task.id);
                return Admission::Rejected;
            }
        }

        let mut evicted = Vec::new();
        while self.entries.len() + 1 > self.settings.max_entries
            || self.total_weight().saturating_add(weight) > self.settings.max_weight
        {
            let victim = self
                .entries
                .iter()
                .filter(|e| Some(&e.task_id) != active)
                .min_by(|a, b| self.eviction_order(a, b, now))
                .map(|e| e.task_id.clone());
            match victim {
                Some(id) => {
                    self.entries.retain(|e| e.task_id != id);
                    log::debug!("pool evicted {id}");
                    evicted.push(id);
                }
                // Only the incoming ACTIVE task is left to hold: it stays alone
                None => break,
            }
        }

        self.entries.push(PoolEntry {
            task_id: task.id.clone(),
            access_count: 1,
            last_admitted_at: now,
            resident_weight: weight,
        });
        Admission::Admitted { evicted }
    }

    /// Remove an entry (terminal task). Returns whether it was resident.
    pub fn remove(&mut self, id: &TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.task_id != id);
        before != self.entries.len()
    }

    /// Entries ordered from most to least sticky.
    pub fn ranked(&self, now: DateTime<Utc>) -> Vec<(PoolEntry, f64)> {
        let mut ranked: Vec<_> = self.entries.iter().map(|e| (e.clone(), self.eviction_score(e, now))).collect();
        ranked.sort_by(|a, b| self.eviction_order(&b.0, &a.0, now));
        ranked
    }
}

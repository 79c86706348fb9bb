//! # Schedule Manager — Cron Triggers for Schedule-Mode Workloads
//!
//! Pure bookkeeping: entries with a parsed cron schedule and a `next_run`
//! instant. The 1 Hz tick itself lives in the orchestrator loop, which asks
//! for [`ScheduleManager::due`] names, runs each workload, then calls
//! [`ScheduleManager::advance`].
//!
//! `next_run` advances from its previous value rather than from the wall
//! clock, which preserves cadence across slow callbacks, and coalesces
//! missed triggers after a clock jump: the entry fires once, then skips
//! ahead until the next occurrence is in the future.
//!
//! Expressions use standard 5-field crontab syntax; a seconds field of `0`
//! is prepended before handing them to the `cron` crate, so `* * * * *`
//! fires at second zero of every minute.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::info;

/// Check an expression without keeping the parsed schedule.
pub fn validate_expression(expr: &str) -> Result<(), String> {
    parse_schedule(expr).map(|_| ())
}

fn parse_schedule(expr: &str) -> Result<Schedule, String> {
    Schedule::from_str(&normalize(expr)).map_err(|e| e.to_string())
}

/// Prepend a seconds field to 5-field crontab expressions; 6/7-field
/// expressions pass through untouched.
fn normalize(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

pub struct ScheduleEntry {
    pub name: String,
    pub cron_expr: String,
    schedule: Schedule,
    pub next_run: DateTime<Utc>,
}

#[derive(Default)]
pub struct ScheduleManager {
    entries: BTreeMap<String, ScheduleEntry>,
}

impl ScheduleManager {
    pub fn new() -> Self {
        ScheduleManager::default()
    }

    /// Register an entry; `next_run` is the first occurrence after now.
    pub fn add(&mut self, name: &str, cron_expr: &str) -> Result<(), String> {
        let schedule = parse_schedule(cron_expr)?;
        let next_run = schedule
            .after(&Utc::now())
            .next()
            .ok_or_else(|| format!("cron expression '{}' has no upcoming occurrence", cron_expr))?;
        info!(workload = name, cron = cron_expr, next_run = %next_run, "schedule registered");
        self.entries.insert(
            name.to_string(),
            ScheduleEntry {
                name: name.to_string(),
                cron_expr: cron_expr.to_string(),
                schedule,
                next_run,
            },
        );
        Ok(())
    }

    /// Tolerant delete.
    pub fn remove(&mut self, name: &str) {
        if self.entries.remove(name).is_some() {
            info!(workload = name, "schedule removed");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries.get(name).map(|e| e.next_run)
    }

    /// Names whose `next_run` is due at `now`, in name order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.next_run <= now)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Advance an entry past `now`, starting from its previous `next_run`.
    /// Multiple missed occurrences collapse into the single firing that
    /// already happened this tick.
    pub fn advance(&mut self, name: &str, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        let mut next = entry.next_run;
        while let Some(n) = entry.schedule.after(&next).next() {
            next = n;
            if next > now {
                break;
            }
        }
        entry.next_run = next;
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::session::SessionEvent;
use crate::storage::EventLog;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStat {
    pub mean: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppUsageStats {
    pub total_sessions: usize,
    pub completed_sessions: usize,
    pub presets_used: BTreeSet<String>,
    pub avg_outcomes: BTreeMap<String, OutcomeStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub generated_at: DateTime<Utc>,
    pub total_sessions: usize,
    pub anthropomorphism_distribution: BTreeMap<String, usize>,
    pub app_usage: BTreeMap<String, AppUsageStats>,
    pub all_sessions: Vec<SessionEvent>,
}

/// Parsed snapshot of the event log, in file order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionLog {
    records: Vec<SessionEvent>,
}

impl SessionLog {
    /// Parses one record per line; blank and malformed lines are skipped.
    pub fn parse(doc: &str) -> Self {
        let mut skipped = 0usize;
        let records = doc
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<SessionEvent>(l) {
                Ok(ev) => Some(ev),
                Err(_) => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        if skipped > 0 {
            tracing::warn!(skipped, "skipped malformed event log lines");
        }
        Self { records }
    }

    pub fn records(&self) -> &[SessionEvent] {
        &self.records
    }

    pub fn into_records(self) -> Vec<SessionEvent> {
        self.records
    }

    pub fn by_app(&self, app_name: &str) -> Vec<&SessionEvent> {
        self.records.iter().filter(|e| e.app_name() == Some(app_name)).collect()
    }

    pub fn by_preset(&self, preset_name: &str) -> Vec<&SessionEvent> {
        self.records.iter().filter(|e| e.preset_name() == Some(preset_name)).collect()
    }

    pub fn by_user(&self, user_id: &str) -> Vec<&SessionEvent> {
        self.records.iter().filter(|e| e.user_id() == Some(user_id)).collect()
    }

    fn starts(&self) -> impl Iterator<Item = &SessionEvent> {
        self.records.iter().filter(|e| matches!(e, SessionEvent::SessionStart(_)))
    }

    /// Session starts per preset name; starts without a preset count as "unknown".
    pub fn preset_distribution(&self) -> BTreeMap<String, usize> {
        let mut dist = BTreeMap::new();
        for ev in self.starts() {
            *dist.entry(ev.preset_name().unwrap_or("unknown").to_string()).or_insert(0) += 1;
        }
        dist
    }

    pub fn app_usage_stats(&self) -> BTreeMap<String, AppUsageStats> {
        let mut stats: BTreeMap<String, AppUsageStats> = BTreeMap::new();
        let mut outcome_sums: BTreeMap<(String, String), (f64, usize)> = BTreeMap::new();

        for ev in &self.records {
            let app = ev.app_name().unwrap_or("unknown").to_string();
            match ev {
                SessionEvent::SessionStart(start) => {
                    let entry = stats.entry(app).or_default();
                    entry.total_sessions += 1;
                    if let Some(preset) = &start.preset_name {
                        entry.presets_used.insert(preset.clone());
                    }
                }
                SessionEvent::SessionEnd(end) => {
                    stats.entry(app.clone()).or_default().completed_sessions += 1;
                    for (metric, value) in &end.outcomes {
                        let sum = outcome_sums.entry((app.clone(), metric.clone())).or_insert((0.0, 0));
                        sum.0 += value;
                        sum.1 += 1;
                    }
                }
                SessionEvent::Interaction(_) => {}
            }
        }

        for ((app, metric), (total, count)) in outcome_sums {
            if let Some(entry) = stats.get_mut(&app) {
                entry.avg_outcomes.insert(metric, OutcomeStat { mean: total / count as f64, count });
            }
        }
        stats
    }

    pub fn report(&self) -> AnalyticsReport {
        AnalyticsReport {
            generated_at: Utc::now(),
            total_sessions: self.starts().count(),
            anthropomorphism_distribution: self.preset_distribution(),
            app_usage: self.app_usage_stats(),
            all_sessions: self.records.clone(),
        }
    }
}

pub async fn load_all_sessions(log: &EventLog) -> Result<SessionLog, SinkError> {
    Ok(SessionLog::parse(&log.read_all().await?))
}

/// Builds a report over the whole log, writing it as pretty JSON when `output` is given.
pub async fn export_analytics(log: &EventLog, output: Option<&Path>) -> anyhow::Result<AnalyticsReport> {
    let report = load_all_sessions(log).await?.report();
    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(path, json).await?;
    }
    Ok(report)
}

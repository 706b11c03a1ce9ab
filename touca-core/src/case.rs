//! Per-test-case accumulator of results, assertions and metrics.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::json;
use std::path::Path;
use tracing::*;

use crate::{container, value::TypedValue, Error, Result};

/// Whether a captured value is compared against the baseline or only used to
/// validate the test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCategory {
    Check,
    Assert,
}

/// Comparison rule attached to a numeric check. Rules are only consumed by the
/// server when comparing versions; they never change the stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonRule {
    Absolute { min: Option<f64>, max: Option<f64> },
    Relative { max: f64, percent: bool },
}

impl ComparisonRule {
    pub fn absolute(min: Option<f64>, max: Option<f64>) -> ComparisonRule {
        ComparisonRule::Absolute { min, max }
    }

    pub fn relative(max: f64, percent: bool) -> ComparisonRule {
        ComparisonRule::Relative { max, percent }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ComparisonRule::Absolute { min, max } => {
                let mut rule = json!({ "type": "number", "mode": "absolute" });
                if let Some(min) = min {
                    rule["min"] = json!(min);
                }
                if let Some(max) = max {
                    rule["max"] = json!(max);
                }
                rule
            }
            ComparisonRule::Relative { max, percent } => json!({
                "type": "number",
                "mode": "relative",
                "max": max,
                "percent": percent,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultEntry {
    pub category: ResultCategory,
    pub value: TypedValue,
    pub rule: Option<ComparisonRule>,
}

/// Identity of a test case. Every field reads "unknown" until set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub team: String,
    pub suite: String,
    pub version: String,
    pub testcase: String,
}

impl Default for Metadata {
    fn default() -> Metadata {
        Metadata {
            team: "unknown".into(),
            suite: "unknown".into(),
            version: "unknown".into(),
            testcase: "unknown".into(),
        }
    }
}

impl Metadata {
    pub fn to_json(&self, built_at: &str) -> serde_json::Value {
        json!({
            "teamslug": self.team,
            "testsuite": self.suite,
            "version": self.version,
            "testcase": self.testcase,
            "builtAt": built_at,
        })
    }
}

/// State of a named metric. Metrics given directly carry no start time.
#[derive(Debug, Clone, Copy)]
enum Timer {
    Running(DateTime<Utc>),
    Stopped {
        tic: Option<DateTime<Utc>>,
        milliseconds: i64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Case {
    metadata: Metadata,
    results: IndexMap<String, ResultEntry>,
    timers: IndexMap<String, Timer>,
}

impl Case {
    pub fn new(metadata: Metadata) -> Case {
        Case {
            metadata,
            ..Default::default()
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn results(&self) -> &IndexMap<String, ResultEntry> {
        &self.results
    }

    pub fn get(&self, key: &str) -> Option<&ResultEntry> {
        self.results.get(key)
    }

    /// Capture a value for regression comparison, replacing any previous entry.
    pub fn check(&mut self, key: impl Into<String>, value: TypedValue, rule: Option<ComparisonRule>) {
        self.results.insert(
            key.into(),
            ResultEntry {
                category: ResultCategory::Check,
                value,
                rule,
            },
        );
    }

    /// Capture a value that gates the validity of the test case.
    pub fn assume(&mut self, key: impl Into<String>, value: TypedValue) {
        self.results.insert(
            key.into(),
            ResultEntry {
                category: ResultCategory::Assert,
                value,
                rule: None,
            },
        );
    }

    pub fn check_file(&mut self, key: impl Into<String>, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| {
            std::io::Error::new(e.kind(), format!("failed to read {path:?}: {e}"))
        })?;
        self.check(key, TypedValue::Blob(content), None);
        Ok(())
    }

    /// Append `value` to the array stored under `key`.
    pub fn add_array_element(&mut self, key: impl Into<String>, value: TypedValue) -> Result<()> {
        let key = key.into();
        match self.results.get_mut(&key) {
            Some(ResultEntry {
                value: TypedValue::Array(items),
                ..
            }) => items.push(value),
            Some(_) => {
                return Err(Error::TypeMismatch {
                    key,
                    expected: "an array",
                })
            }
            None => self.check(key, TypedValue::Array(vec![value]), None),
        }
        Ok(())
    }

    /// Increment the counter stored under `key`, starting from 1.
    pub fn add_hit_count(&mut self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        match self.results.get_mut(&key) {
            Some(ResultEntry {
                value: TypedValue::Int(count),
                ..
            }) => *count += 1,
            Some(_) => {
                return Err(Error::TypeMismatch {
                    key,
                    expected: "an integer",
                })
            }
            None => self.check(key, TypedValue::Int(1), None),
        }
        Ok(())
    }

    pub fn add_metric(&mut self, key: impl Into<String>, milliseconds: i64) {
        self.timers.insert(
            key.into(),
            Timer::Stopped {
                tic: None,
                milliseconds,
            },
        );
    }

    pub fn start_timer(&mut self, key: impl Into<String>) {
        self.timers.insert(key.into(), Timer::Running(Utc::now()));
    }

    /// Stopping a timer again measures from the same start.
    pub fn stop_timer(&mut self, key: &str) {
        let tic = match self.timers.get(key) {
            Some(Timer::Running(tic)) | Some(Timer::Stopped { tic: Some(tic), .. }) => *tic,
            _ => {
                debug!("ignoring timer \"{key}\" that was never started");
                return;
            }
        };
        let milliseconds = (Utc::now() - tic).num_milliseconds();
        self.timers.insert(
            key.to_string(),
            Timer::Stopped {
                tic: Some(tic),
                milliseconds,
            },
        );
    }

    /// Durations of all completed timers in milliseconds, in the order the
    /// timers were started.
    pub fn metrics(&self) -> Vec<(String, i64)> {
        self.timers
            .iter()
            .filter_map(|(key, timer)| match timer {
                Timer::Running(_) => None,
                Timer::Stopped { milliseconds, .. } => Some((key.clone(), *milliseconds)),
            })
            .collect()
    }

    /// True when the case holds neither results nor metrics.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.metrics().is_empty()
    }

    pub fn json(&self) -> serde_json::Value {
        let built_at = Utc::now().to_rfc3339();
        let results: Vec<_> = self
            .results
            .iter()
            .filter(|(_, entry)| entry.category == ResultCategory::Check)
            .map(|(key, entry)| {
                let mut item = json!({ "key": key, "value": entry.value.to_json() });
                if let Some(rule) = &entry.rule {
                    item["rule"] = rule.to_json();
                }
                item
            })
            .collect();
        let assertions: Vec<_> = self
            .results
            .iter()
            .filter(|(_, entry)| entry.category == ResultCategory::Assert)
            .map(|(key, entry)| json!({ "key": key, "value": entry.value.to_json() }))
            .collect();
        let metrics: Vec<_> = self
            .metrics()
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        json!({
            "metadata": self.metadata.to_json(&built_at),
            "results": results,
            "assertions": assertions,
            "metrics": metrics,
        })
    }

    /// Encode the case as one message of the binary container.
    pub fn serialize(&self) -> Vec<u8> {
        let built_at = Utc::now().to_rfc3339();
        container::encode_case(&self.metadata, &built_at, &self.results, &self.metrics())
    }
}

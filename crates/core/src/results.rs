use std::{
    collections::BTreeMap,
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{catalog::Category, error::RunError, params::ParameterSet};

/// Metadata keys the generated programs use for bookkeeping. These never act
/// as latency predictors.
pub const RESERVED_METADATA_KEYS: &[&str] = &[
    "total_poll_cycles",
    "submitted",
    "completed",
    "total_packets_sent",
    "total_packets_received",
];

/// Cycle count reported by a measurement program, in whichever of the two
/// output forms it chose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleMeasure {
    /// `Total cycles: <n>` over the whole measured loop.
    TotalCycles(u64),
    /// `Cycles per call: <x>`, already normalized by the program.
    CyclesPerCall(f64),
}

impl CycleMeasure {
    pub fn cycles_per_iteration(&self, iterations: u64) -> f64 {
        match *self {
            CycleMeasure::TotalCycles(total) => total as f64 / iterations.max(1) as f64,
            CycleMeasure::CyclesPerCall(per_call) => per_call,
        }
    }
}

/// Outcome of one trial. Failures are first-class records so a sweep never
/// silently drops a data point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        measure: CycleMeasure,
        #[serde(default)]
        metadata: BTreeMap<String, serde_json::Value>,
    },
    Failed {
        reason: String,
    },
}

/// One benchmark trial: operation, parameter tuple, trial index and outcome.
/// Serialized as one JSON object per line in the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub operation: String,
    pub category: Category,
    pub params: ParameterSet,
    pub trial: u32,
    pub iterations: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// One usable data point for model fitting.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Cycles per packet when the program reports packet counters, cycles
    /// per loop iteration otherwise.
    pub cycles_per_unit: f64,
    pub predictors: BTreeMap<String, f64>,
    /// Non-numeric parameter values (algorithm names and the like). These
    /// cannot enter a linear fit but are reported as categorical.
    pub labels: BTreeMap<String, String>,
}

impl RunRecord {
    /// Extracts the fitting sample from a completed trial. Predictors start
    /// from the requested parameter tuple; numeric metadata overrides them
    /// with the values the program actually ran with. Reserved bookkeeping
    /// keys never become predictors; non-numeric values become labels.
    pub fn sample(&self) -> Option<Sample> {
        let RunOutcome::Completed { measure, metadata } = &self.outcome else {
            return None;
        };
        let mut predictors = BTreeMap::new();
        let mut labels = BTreeMap::new();
        for (key, value) in self.params.iter() {
            match value.parse::<f64>() {
                Ok(v) => {
                    predictors.insert(key.to_owned(), v);
                }
                Err(_) => {
                    labels.insert(key.to_owned(), value.to_owned());
                }
            }
        }
        for (key, value) in metadata {
            if RESERVED_METADATA_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = value.as_f64() {
                predictors.insert(key.clone(), value);
            } else if let Some(value) = value.as_str() {
                labels.insert(key.clone(), value.to_owned());
            }
        }

        // Throughput operations report how many packets the measured loop
        // actually moved; their cost is per packet, not per iteration.
        let packets = metadata
            .get("total_packets_received")
            .or_else(|| metadata.get("total_packets_sent"))
            .and_then(|v| v.as_f64())
            .filter(|p| *p > 0.0);
        let cycles_per_unit = match (*measure, packets) {
            (CycleMeasure::TotalCycles(total), Some(packets)) => total as f64 / packets,
            _ => measure.cycles_per_iteration(self.iterations),
        };
        Some(Sample {
            cycles_per_unit,
            predictors,
            labels,
        })
    }

    /// Poll-loop cycle total, when the program reports one.
    pub fn poll_cycles(&self) -> Option<f64> {
        match &self.outcome {
            RunOutcome::Completed { metadata, .. } => {
                metadata.get("total_poll_cycles").and_then(|v| v.as_f64())
            }
            RunOutcome::Failed { .. } => None,
        }
    }
}

/// Append-only run log, one JSON record per line. Existing records are never
/// rewritten; repeated campaigns accumulate.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ResultLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, records: &[RunRecord]) -> Result<(), RunError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for record in records {
            let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<RunRecord>, RunError> {
        let file = fs::File::open(&self.path)?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| {
                RunError::MalformedRecord {
                    line: idx + 1,
                    source,
                }
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Groups records by operation name, keeping insertion order within each
/// group.
pub fn group_by_operation(records: &[RunRecord]) -> BTreeMap<&str, Vec<&RunRecord>> {
    let mut groups: BTreeMap<&str, Vec<&RunRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.operation.as_str()).or_default().push(record);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    fn record(operation: &str, trial: u32, cycles: u64) -> RunRecord {
        let mut params = ParameterSet::new();
        params.insert("burst_size", "32");
        RunRecord {
            operation: operation.to_owned(),
            category: Category::Cryptodev,
            params,
            trial,
            iterations: 1000,
            timestamp: Utc::now(),
            outcome: RunOutcome::Completed {
                measure: CycleMeasure::TotalCycles(cycles),
                metadata: BTreeMap::from([
                    ("burst_size".to_owned(), serde_json::json!(32)),
                    ("total_poll_cycles".to_owned(), serde_json::json!(120000)),
                    ("submitted".to_owned(), serde_json::json!(32000)),
                    ("completed".to_owned(), serde_json::json!(32000)),
                ]),
            },
        }
    }

    #[test]
    fn append_accumulates_and_load_round_trips() -> TestResult {
        let tmp = tempfile::tempdir()?;
        let log = ResultLog::new(tmp.path().join("runs.jsonl"));
        log.append(&[record("enqueue_burst", 0, 500_000)])?;
        log.append(&[
            record("enqueue_burst", 1, 510_000),
            record("dequeue_burst", 0, 90_000),
        ])?;

        let records = log.load()?;
        assert_eq!(records.len(), 3);
        let groups = group_by_operation(&records);
        assert_eq!(groups["enqueue_burst"].len(), 2);
        assert_eq!(groups["dequeue_burst"].len(), 1);
        Ok(())
    }

    #[test]
    fn sample_extraction_filters_reserved_keys() {
        let record = record("enqueue_burst", 0, 500_000);
        let sample = record.sample().unwrap();
        assert_eq!(sample.cycles_per_unit, 500.0);
        assert_eq!(sample.predictors.get("burst_size"), Some(&32.0));
        assert!(!sample.predictors.contains_key("total_poll_cycles"));
        assert_eq!(record.poll_cycles(), Some(120_000.0));
    }

    #[test]
    fn packet_counters_normalize_cycles_and_stay_reserved() {
        let mut trial = record("tx_burst", 0, 500_000);
        let RunOutcome::Completed { metadata, .. } = &mut trial.outcome else {
            unreachable!()
        };
        metadata.insert("total_packets_sent".to_owned(), serde_json::json!(4000));
        metadata.insert("total_packets_received".to_owned(), serde_json::json!(2000));

        let sample = trial.sample().unwrap();
        // Received packets win over sent: 500_000 cycles / 2000 packets.
        assert_eq!(sample.cycles_per_unit, 250.0);
        assert!(!sample.predictors.contains_key("total_packets_sent"));
        assert!(!sample.predictors.contains_key("total_packets_received"));
    }

    #[test]
    fn non_numeric_values_become_labels() {
        let mut trial = record("enqueue_burst", 0, 500_000);
        trial.params.insert("algorithm", "aes-cbc");
        let RunOutcome::Completed { metadata, .. } = &mut trial.outcome else {
            unreachable!()
        };
        metadata.insert("driver".to_owned(), serde_json::json!("crypto_openssl"));

        let sample = trial.sample().unwrap();
        assert_eq!(sample.labels.get("algorithm").map(String::as_str), Some("aes-cbc"));
        assert_eq!(sample.labels.get("driver").map(String::as_str), Some("crypto_openssl"));
        assert!(!sample.predictors.contains_key("algorithm"));
        assert!(!sample.predictors.contains_key("driver"));
        // Numeric predictors are unaffected.
        assert_eq!(sample.predictors.get("burst_size"), Some(&32.0));
    }

    #[test]
    fn failed_records_yield_no_sample() {
        let mut record = record("enqueue_burst", 0, 1);
        record.outcome = RunOutcome::Failed {
            reason: "timed out".to_owned(),
        };
        assert!(record.sample().is_none());
        assert!(record.poll_cycles().is_none());
    }

    #[test]
    fn per_call_measure_skips_normalization() {
        let measure = CycleMeasure::CyclesPerCall(17.5);
        assert_eq!(measure.cycles_per_iteration(1000), 17.5);
        let measure = CycleMeasure::TotalCycles(40);
        assert_eq!(measure.cycles_per_iteration(8), 5.0);
    }
}

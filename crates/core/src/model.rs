use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    catalog::Category,
    error::ModelError,
    results::{group_by_operation, RunRecord, Sample},
    stats::{least_squares, linear_regression},
};

/// Two-sided significance threshold for a parameter to enter the
/// multivariate model.
pub const SIGNIFICANCE_LEVEL: f64 = 0.05;
/// A parameter must take at least this many distinct values before a
/// correlation against it means anything.
pub const MIN_DISTINCT_VALUES: usize = 2;
/// Per-category no-op operation whose cost is pure harness overhead. Its
/// mean is subtracted from every other operation in the same category.
pub const BASELINE_OPERATION: &str = "empty";

/// Univariate screening result for one parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterStats {
    pub slope: f64,
    pub intercept: f64,
    pub r: f64,
    pub p_value: f64,
    pub samples: usize,
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterOutcome {
    Tested(ParameterStats),
    InsufficientVariation { distinct_values: usize },
    /// Non-numeric parameter (an algorithm name, a driver name). It cannot
    /// carry a linear coefficient, so it is surfaced here instead of being
    /// dropped.
    Categorical { distinct_values: usize },
}

/// Compact per-operation latency model: fixed cost plus one linear term per
/// significant parameter.
#[derive(Debug, Clone, Serialize)]
pub struct OperationModel {
    pub base_latency_cycles: f64,
    pub parameters: BTreeMap<String, f64>,
}

impl OperationModel {
    /// Predicted cycles per call for a concrete parameter assignment.
    pub fn predict(&self, params: &BTreeMap<String, f64>) -> f64 {
        self.base_latency_cycles
            + self
                .parameters
                .iter()
                .map(|(key, slope)| slope * params.get(key).copied().unwrap_or(0.0))
                .sum::<f64>()
    }
}

#[derive(Debug, Serialize)]
pub struct LatencyReport {
    pub generated_at: DateTime<Utc>,
    pub significance_level: f64,
    pub operations: BTreeMap<String, OperationModel>,
    /// Operations that could not be modeled, with the reason.
    pub failures: BTreeMap<String, String>,
}

/// Full screening detail behind the compact model.
#[derive(Debug, Clone, Serialize)]
pub struct OperationCorrelation {
    pub category: Category,
    pub samples: usize,
    /// Harness overhead subtracted before fitting.
    pub baseline_cycles: f64,
    pub parameters: BTreeMap<String, ParameterOutcome>,
}

#[derive(Debug, Serialize)]
pub struct CorrelationReport {
    pub operations: BTreeMap<String, OperationCorrelation>,
}

/// Poll-loop cost model for operations that report `total_poll_cycles`.
#[derive(Debug, Clone, Serialize)]
pub struct PollingModel {
    pub base_poll_cycles_per_iteration: f64,
    pub parameters: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct PollingReport {
    pub operations: BTreeMap<String, PollingModel>,
}

/// The three analysis documents built from one run log.
#[derive(Debug, Serialize)]
pub struct Analysis {
    pub latency: LatencyReport,
    pub correlations: CorrelationReport,
    pub polling: PollingReport,
}

impl Analysis {
    /// Writes `latency_model.json`, `correlations.json` and
    /// `polling_model.json` under `dir`.
    pub fn write(&self, dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        for (name, value) in [
            ("latency_model.json", serde_json::to_value(&self.latency)),
            ("correlations.json", serde_json::to_value(&self.correlations)),
            ("polling_model.json", serde_json::to_value(&self.polling)),
        ] {
            let value = value.map_err(std::io::Error::other)?;
            fs::write(dir.join(name), format!("{:#}\n", value))?;
        }
        Ok(())
    }
}

/// Builds all three reports from the run log. Per-operation problems land in
/// the failures map; one unmodelable operation never blocks the rest.
pub fn analyze(records: &[RunRecord]) -> Analysis {
    let groups = group_by_operation(records);
    let baselines = category_baselines(&groups);
    let poll_baselines = category_poll_baselines(&groups);

    let mut operations = BTreeMap::new();
    let mut failures = BTreeMap::new();
    let mut correlations = BTreeMap::new();
    let mut polling = BTreeMap::new();

    for (operation, group) in &groups {
        if *operation == BASELINE_OPERATION {
            continue;
        }
        match fit_operation(operation, group, &baselines) {
            Ok((model, correlation)) => {
                operations.insert((*operation).to_owned(), model);
                correlations.insert((*operation).to_owned(), correlation);
            }
            Err(err) => {
                tracing::warn!(operation, %err, "operation not modeled");
                failures.insert((*operation).to_owned(), err.to_string());
            }
        }
        if let Some(model) = fit_polling(group, &poll_baselines) {
            polling.insert((*operation).to_owned(), model);
        }
    }

    Analysis {
        latency: LatencyReport {
            generated_at: Utc::now(),
            significance_level: SIGNIFICANCE_LEVEL,
            operations,
            failures,
        },
        correlations: CorrelationReport {
            operations: correlations,
        },
        polling: PollingReport { operations: polling },
    }
}

/// Mean per-iteration cost of each category's no-op operation.
fn category_baselines(groups: &BTreeMap<&str, Vec<&RunRecord>>) -> BTreeMap<Category, f64> {
    let mut baselines = BTreeMap::new();
    let Some(group) = groups.get(BASELINE_OPERATION) else {
        return baselines;
    };
    let mut per_category: BTreeMap<Category, Vec<f64>> = BTreeMap::new();
    for record in group {
        if let Some(sample) = record.sample() {
            per_category
                .entry(record.category)
                .or_default()
                .push(sample.cycles_per_unit);
        }
    }
    for (category, values) in per_category {
        baselines.insert(category, mean(&values));
    }
    baselines
}

/// Mean per-iteration poll cost of each category's no-op operation.
fn category_poll_baselines(groups: &BTreeMap<&str, Vec<&RunRecord>>) -> BTreeMap<Category, f64> {
    let mut baselines = BTreeMap::new();
    let Some(group) = groups.get(BASELINE_OPERATION) else {
        return baselines;
    };
    let mut per_category: BTreeMap<Category, Vec<f64>> = BTreeMap::new();
    for record in group {
        if let Some(poll) = record.poll_cycles() {
            per_category
                .entry(record.category)
                .or_default()
                .push(poll / record.iterations.max(1) as f64);
        }
    }
    for (category, values) in per_category {
        baselines.insert(category, mean(&values));
    }
    baselines
}

fn fit_operation(
    operation: &str,
    group: &[&RunRecord],
    baselines: &BTreeMap<Category, f64>,
) -> Result<(OperationModel, OperationCorrelation), ModelError> {
    let category = group
        .first()
        .map(|r| r.category)
        .ok_or_else(|| ModelError::NoValidSamples(operation.to_owned()))?;
    let samples: Vec<Sample> = group.iter().filter_map(|r| r.sample()).collect();
    if samples.is_empty() {
        return Err(ModelError::NoValidSamples(operation.to_owned()));
    }
    let baseline = baselines.get(&category).copied().unwrap_or(0.0);
    let adjusted: Vec<f64> = samples
        .iter()
        .map(|s| (s.cycles_per_unit - baseline).max(0.0))
        .collect();

    // Univariate screening per parameter.
    let mut screened = BTreeMap::new();
    for name in predictor_names(&samples) {
        screened.insert(name.clone(), screen_parameter(&name, &samples, &adjusted));
    }
    for (name, distinct_values) in label_counts(&samples) {
        screened.insert(name, ParameterOutcome::Categorical { distinct_values });
    }
    let significant: Vec<&str> = screened
        .iter()
        .filter_map(|(name, outcome)| match outcome {
            ParameterOutcome::Tested(stats) if stats.significant => Some(name.as_str()),
            _ => None,
        })
        .collect();

    let model = if significant.is_empty() {
        OperationModel {
            base_latency_cycles: mean(&adjusted),
            parameters: BTreeMap::new(),
        }
    } else {
        match multivariate_fit(operation, &significant, &samples, &adjusted) {
            Ok(model) => model,
            Err(err) => {
                tracing::warn!(operation, %err, "falling back to univariate coefficients");
                univariate_fallback(&significant, &screened, &samples, &adjusted)
            }
        }
    };

    let correlation = OperationCorrelation {
        category,
        samples: samples.len(),
        baseline_cycles: baseline,
        parameters: screened,
    };
    Ok((model, correlation))
}

fn predictor_names(samples: &[Sample]) -> BTreeSet<String> {
    samples
        .iter()
        .flat_map(|s| s.predictors.keys().cloned())
        .collect()
}

/// Distinct value count per categorical (non-numeric) parameter.
fn label_counts(samples: &[Sample]) -> BTreeMap<String, usize> {
    let mut values: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for sample in samples {
        for (name, value) in &sample.labels {
            values.entry(name.clone()).or_default().insert(value);
        }
    }
    values
        .into_iter()
        .map(|(name, values)| (name, values.len()))
        .collect()
}

fn screen_parameter(name: &str, samples: &[Sample], adjusted: &[f64]) -> ParameterOutcome {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for (sample, &y) in samples.iter().zip(adjusted) {
        if let Some(&x) = sample.predictors.get(name) {
            xs.push(x);
            ys.push(y);
        }
    }
    let mut distinct = xs.clone();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();
    if distinct.len() < MIN_DISTINCT_VALUES {
        return ParameterOutcome::InsufficientVariation {
            distinct_values: distinct.len(),
        };
    }
    match linear_regression(&xs, &ys) {
        Some(fit) => ParameterOutcome::Tested(ParameterStats {
            slope: fit.slope,
            intercept: fit.intercept,
            r: fit.r,
            p_value: fit.p_value,
            samples: fit.n,
            significant: fit.p_value < SIGNIFICANCE_LEVEL,
        }),
        None => ParameterOutcome::InsufficientVariation {
            distinct_values: distinct.len(),
        },
    }
}

/// Joint fit over the significant parameters only. Samples missing any of
/// them are left out of the design.
fn multivariate_fit(
    operation: &str,
    significant: &[&str],
    samples: &[Sample],
    adjusted: &[f64],
) -> Result<OperationModel, ModelError> {
    let mut rows = Vec::new();
    let mut ys = Vec::new();
    for (sample, &y) in samples.iter().zip(adjusted) {
        let values: Option<Vec<f64>> = significant
            .iter()
            .map(|name| sample.predictors.get(*name).copied())
            .collect();
        if let Some(values) = values {
            let mut row = Vec::with_capacity(significant.len() + 1);
            row.push(1.0);
            row.extend(values);
            rows.push(row);
            ys.push(y);
        }
    }
    let coefficients = least_squares(&rows, &ys)
        .ok_or_else(|| ModelError::SingularSystem(operation.to_owned()))?;
    let parameters = significant
        .iter()
        .zip(&coefficients[1..])
        .map(|(name, &slope)| ((*name).to_owned(), slope))
        .collect();
    Ok(OperationModel {
        base_latency_cycles: coefficients[0].max(0.0),
        parameters,
    })
}

/// When the joint system is singular the univariate slopes still stand on
/// their own; the base is chosen so the model is exact at the sample means.
fn univariate_fallback(
    significant: &[&str],
    screened: &BTreeMap<String, ParameterOutcome>,
    samples: &[Sample],
    adjusted: &[f64],
) -> OperationModel {
    let mut parameters = BTreeMap::new();
    for name in significant {
        if let Some(ParameterOutcome::Tested(stats)) = screened.get(*name) {
            parameters.insert((*name).to_owned(), stats.slope);
        }
    }
    let mut base = mean(adjusted);
    for (name, slope) in &parameters {
        let xs: Vec<f64> = samples
            .iter()
            .filter_map(|s| s.predictors.get(name).copied())
            .collect();
        if !xs.is_empty() {
            base -= slope * mean(&xs);
        }
    }
    OperationModel {
        base_latency_cycles: base.max(0.0),
        parameters,
    }
}

fn fit_polling(
    group: &[&RunRecord],
    poll_baselines: &BTreeMap<Category, f64>,
) -> Option<PollingModel> {
    let mut per_iteration = Vec::new();
    let mut samples = Vec::new();
    for record in group {
        let (Some(poll), Some(sample)) = (record.poll_cycles(), record.sample()) else {
            continue;
        };
        let baseline = poll_baselines.get(&record.category).copied().unwrap_or(0.0);
        per_iteration.push((poll / record.iterations.max(1) as f64 - baseline).max(0.0));
        samples.push(sample);
    }
    if per_iteration.is_empty() {
        return None;
    }

    let mut parameters = BTreeMap::new();
    for name in predictor_names(&samples) {
        if let ParameterOutcome::Tested(stats) = screen_parameter(&name, &samples, &per_iteration)
        {
            if stats.significant {
                parameters.insert(name, stats.slope);
            }
        }
    }
    Some(PollingModel {
        base_poll_cycles_per_iteration: mean(&per_iteration),
        parameters,
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        params::ParameterSet,
        results::{CycleMeasure, RunOutcome},
    };
    use testresult::TestResult;

    const ITERATIONS: u64 = 1000;

    fn record(
        operation: &str,
        cycles_per_iter: f64,
        params: &[(&str, f64)],
        poll_per_iter: Option<f64>,
    ) -> RunRecord {
        let mut metadata = BTreeMap::new();
        let mut param_set = ParameterSet::new();
        for (key, value) in params {
            metadata.insert((*key).to_owned(), serde_json::json!(value));
            param_set.insert(*key, value.to_string());
        }
        if let Some(poll) = poll_per_iter {
            metadata.insert(
                "total_poll_cycles".to_owned(),
                serde_json::json!(poll * ITERATIONS as f64),
            );
        }
        RunRecord {
            operation: operation.to_owned(),
            category: Category::Cryptodev,
            params: param_set,
            trial: 0,
            iterations: ITERATIONS,
            timestamp: Utc::now(),
            outcome: RunOutcome::Completed {
                measure: CycleMeasure::TotalCycles(
                    (cycles_per_iter * ITERATIONS as f64).round() as u64,
                ),
                metadata,
            },
        }
    }

    /// Exact linear workload: baseline 50, base cost 100, 2.5 cycles per
    /// burst element, data_size present but constant.
    fn linear_records() -> Vec<RunRecord> {
        let mut records = Vec::new();
        for _ in 0..3 {
            records.push(record("empty", 50.0, &[], None));
        }
        for &burst in &[8.0, 16.0, 32.0, 64.0] {
            for _ in 0..2 {
                records.push(record(
                    "enqueue_burst",
                    50.0 + 100.0 + 2.5 * burst,
                    &[("burst_size", burst), ("data_size", 1024.0)],
                    Some(12.0),
                ));
            }
        }
        records
    }

    #[test]
    fn recovers_linear_model_after_baseline_subtraction() {
        let analysis = analyze(&linear_records());
        let model = &analysis.latency.operations["enqueue_burst"];
        assert!((model.base_latency_cycles - 100.0).abs() < 1e-6);
        assert!((model.parameters["burst_size"] - 2.5).abs() < 1e-6);
        assert!(!model.parameters.contains_key("data_size"));

        let prediction = model.predict(&BTreeMap::from([("burst_size".to_owned(), 20.0)]));
        assert!((prediction - 150.0).abs() < 1e-6);

        // The baseline operation is input, not output.
        assert!(!analysis.latency.operations.contains_key("empty"));
    }

    #[test]
    fn correlation_report_details_every_screened_parameter() {
        let analysis = analyze(&linear_records());
        let correlation = &analysis.correlations.operations["enqueue_burst"];
        assert_eq!(correlation.samples, 8);
        assert!((correlation.baseline_cycles - 50.0).abs() < 1e-9);
        match &correlation.parameters["burst_size"] {
            ParameterOutcome::Tested(stats) => {
                assert!(stats.significant);
                assert!(stats.p_value < SIGNIFICANCE_LEVEL);
            }
            other => panic!("expected tested outcome, got {other:?}"),
        }
        assert!(matches!(
            correlation.parameters["data_size"],
            ParameterOutcome::InsufficientVariation { distinct_values: 1 }
        ));
    }

    #[test]
    fn uncorrelated_parameter_stays_out_of_the_model() {
        let mut records = Vec::new();
        // Constant latency regardless of the swept parameter.
        for &size in &[64.0, 128.0, 256.0, 512.0] {
            records.push(record("dequeue_burst", 80.0, &[("data_size", size)], None));
        }
        let analysis = analyze(&records);
        let model = &analysis.latency.operations["dequeue_burst"];
        assert!(model.parameters.is_empty());
        assert!((model.base_latency_cycles - 80.0).abs() < 1e-9);
    }

    #[test]
    fn failed_only_operations_land_in_failures() {
        let mut bad = record("broken_op", 1.0, &[], None);
        bad.outcome = RunOutcome::Failed {
            reason: "timed out".to_owned(),
        };
        let analysis = analyze(&[bad]);
        assert!(analysis.latency.operations.is_empty());
        assert!(analysis.latency.failures["broken_op"].contains("no valid samples"));
    }

    #[test]
    fn categorical_parameters_are_surfaced_not_fitted() {
        let mut records = Vec::new();
        for algorithm in ["aes-cbc", "sha2-256"] {
            for &burst in &[8.0, 16.0, 32.0, 64.0] {
                let mut trial = record(
                    "enqueue_burst",
                    100.0 + 2.0 * burst,
                    &[("burst_size", burst)],
                    None,
                );
                trial.params.insert("algorithm", algorithm);
                records.push(trial);
            }
        }
        let analysis = analyze(&records);

        let correlation = &analysis.correlations.operations["enqueue_burst"];
        assert!(matches!(
            correlation.parameters["algorithm"],
            ParameterOutcome::Categorical { distinct_values: 2 }
        ));
        // The compact model carries the numeric slope only.
        let model = &analysis.latency.operations["enqueue_burst"];
        assert!(!model.parameters.contains_key("algorithm"));
        assert!((model.parameters["burst_size"] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn polling_report_normalizes_per_iteration() {
        let analysis = analyze(&linear_records());
        let polling = &analysis.polling.operations["enqueue_burst"];
        assert!((polling.base_poll_cycles_per_iteration - 12.0).abs() < 1e-9);
        // Poll cost is flat across burst sizes here.
        assert!(polling.parameters.is_empty());
    }

    #[test]
    fn poll_baseline_is_subtracted_and_clamped() {
        let mut records = vec![
            record("empty", 50.0, &[], Some(5.0)),
            record("empty", 50.0, &[], Some(5.0)),
        ];
        for &burst in &[8.0, 16.0] {
            records.push(record("enqueue_burst", 150.0, &[("burst_size", burst)], Some(12.0)));
            records.push(record("dequeue_burst", 150.0, &[("burst_size", burst)], Some(3.0)));
        }
        let analysis = analyze(&records);
        let enqueue = &analysis.polling.operations["enqueue_burst"];
        assert!((enqueue.base_poll_cycles_per_iteration - 7.0).abs() < 1e-9);
        // Never below the no-op's own poll cost.
        let dequeue = &analysis.polling.operations["dequeue_burst"];
        assert_eq!(dequeue.base_poll_cycles_per_iteration, 0.0);
    }

    #[test]
    fn writes_all_three_documents() -> TestResult {
        let tmp = tempfile::tempdir()?;
        analyze(&linear_records()).write(tmp.path())?;
        for name in ["latency_model.json", "correlations.json", "polling_model.json"] {
            let text = fs::read_to_string(tmp.path().join(name))?;
            let value: serde_json::Value = serde_json::from_str(&text)?;
            assert!(value.is_object(), "{name} should hold a JSON object");
        }
        Ok(())
    }
}

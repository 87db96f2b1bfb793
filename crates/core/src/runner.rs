use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    catalog::{Catalog, CategoryEntry},
    compile::CompiledTarget,
    error::RunError,
    params::{expand_sweep, ParameterSet, SweepSpec},
    results::{CycleMeasure, RunOutcome, RunRecord},
};

/// Default iteration count, high enough to amortize timer and loop overhead
/// on a pinned core.
pub const DEFAULT_ITERATIONS: u64 = 100_000_000;
/// Default measurement core. Core 0 handles interrupts on most setups.
pub const DEFAULT_CORE: u32 = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settings for one measurement campaign.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub iterations: u64,
    pub trials: u32,
    /// Core to pin to via `taskset -c`. `None` leaves scheduling to the OS.
    pub core: Option<u32>,
    pub timeout: Duration,
    /// Run each parameter tuple once before the measured trials, discarding
    /// the result. Warms caches and runtime state.
    pub warmup: bool,
    /// Additional attempts per trial after a failure.
    pub retries: u32,
    /// Runtime initialization arguments, passed to API-category programs
    /// after a `--` delimiter.
    pub runtime_args: Vec<String>,
    /// Pin the CPU frequency governor to `performance` for the campaign.
    pub pin_frequency: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            iterations: DEFAULT_ITERATIONS,
            trials: 5,
            core: Some(DEFAULT_CORE),
            timeout: Duration::from_secs(300),
            warmup: true,
            retries: 0,
            runtime_args: Vec::new(),
            pin_frequency: false,
        }
    }
}

/// What to execute for a single trial.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub core: Option<u32>,
    pub timeout: Duration,
}

/// Raw result of a launch, before contract parsing.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the controller and the machine. The process implementation
/// runs real executables; the stub simulates them for dry runs and tests.
pub trait Launcher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, RunError>;
}

/// Runs the measurement executable as a child process, wrapped in
/// `taskset -c <core>` when pinning is requested.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, RunError> {
        let mut cmd = match spec.core {
            Some(core) => {
                let mut cmd = Command::new("taskset");
                cmd.arg("-c").arg(core.to_string()).arg(&spec.exe);
                cmd
            }
            None => Command::new(&spec.exe),
        };
        cmd.args(&spec.args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            exe: spec.exe.clone(),
            source,
        })?;
        // Both pipes drain while the child runs; a program that writes more
        // than a pipe buffer must never block against a full pipe.
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());
        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= spec.timeout {
                child.kill()?;
                child.wait()?;
                return Err(RunError::Timeout(spec.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };
        Ok(LaunchOutcome {
            success: status.success(),
            status: status.to_string(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

/// Reads a child pipe to the end on its own thread, so the child can keep
/// writing while the launcher polls for exit.
fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Simulated launcher with a known linear cost model. Latency per call is
/// `base + sum(cost[k] * value(k))` over the numeric benchmark arguments, so
/// model fitting against it has an exact ground truth.
#[derive(Debug, Clone)]
pub struct StubLauncher {
    pub base_cycles_per_call: f64,
    pub param_cost: BTreeMap<String, f64>,
    /// Poll cycles charged per iteration, reported as `total_poll_cycles`.
    pub poll_cycles_per_call: f64,
}

impl StubLauncher {
    pub fn new(base_cycles_per_call: f64) -> Self {
        StubLauncher {
            base_cycles_per_call,
            param_cost: BTreeMap::new(),
            poll_cycles_per_call: 0.0,
        }
    }

    pub fn cost(mut self, param: &str, cycles_per_unit: f64) -> Self {
        self.param_cost.insert(param.to_owned(), cycles_per_unit);
        self
    }
}

impl Launcher for StubLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchOutcome, RunError> {
        let mut iterations: u64 = 1;
        let mut params: BTreeMap<String, f64> = BTreeMap::new();
        let mut args = spec.args.iter();
        while let Some(arg) = args.next() {
            if arg == "--" {
                break;
            }
            if arg == "-i" {
                if let Some(value) = args.next() {
                    iterations = value.parse().unwrap_or(1);
                }
            } else if let Some(key) = arg.strip_prefix("--") {
                if let Some(value) = args.next() {
                    if let Ok(value) = value.parse::<f64>() {
                        params.insert(key.to_owned(), value);
                    }
                }
            }
        }

        let per_call = self.base_cycles_per_call
            + params
                .iter()
                .map(|(key, value)| self.param_cost.get(key).copied().unwrap_or(0.0) * value)
                .sum::<f64>();
        let total = (per_call * iterations as f64).round() as u64;

        let mut metadata: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("'{key}': {value}"))
            .collect();
        metadata.push(format!("'submitted': {iterations}"));
        metadata.push(format!("'completed': {iterations}"));
        if self.poll_cycles_per_call > 0.0 {
            let poll = (self.poll_cycles_per_call * iterations as f64).round() as u64;
            metadata.push(format!("'total_poll_cycles': {poll}"));
        }
        let stdout = format!(
            "Total cycles: {total}\nmetadata: {{{}}}\n",
            metadata.join(", ")
        );
        Ok(LaunchOutcome {
            success: true,
            status: "exit status: 0".to_owned(),
            stdout,
            stderr: String::new(),
        })
    }
}

/// Parses the measurement output contract: one cycle line in either form,
/// plus an optional metadata line.
pub fn parse_output(
    stdout: &str,
) -> Result<(CycleMeasure, BTreeMap<String, serde_json::Value>), RunError> {
    let mut measure = None;
    let mut metadata = BTreeMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Total cycles:") {
            let total = rest.trim().parse::<u64>().map_err(|_| {
                RunError::MalformedLine {
                    line: "Total cycles",
                    content: line.to_owned(),
                }
            })?;
            measure = Some(CycleMeasure::TotalCycles(total));
        } else if let Some(rest) = line.strip_prefix("Cycles per call:") {
            let per_call = rest.trim().parse::<f64>().map_err(|_| {
                RunError::MalformedLine {
                    line: "Cycles per call",
                    content: line.to_owned(),
                }
            })?;
            measure = Some(CycleMeasure::CyclesPerCall(per_call));
        } else if let Some(rest) = line.strip_prefix("metadata:") {
            metadata = parse_metadata(rest.trim())?;
        }
    }
    let measure = measure.ok_or(RunError::MissingCycleLine)?;
    Ok((measure, metadata))
}

/// The metadata line uses single-quoted keys in a fixed braces form. Values
/// never contain quote characters, so swapping the quote style yields valid
/// JSON.
fn parse_metadata(text: &str) -> Result<BTreeMap<String, serde_json::Value>, RunError> {
    let json = text.replace('\'', "\"");
    serde_json::from_str(&json).map_err(|_| RunError::MalformedLine {
        line: "metadata",
        content: text.to_owned(),
    })
}

/// Submitted and completed counters must balance once teardown drained the
/// in-flight operations.
fn check_completion(metadata: &BTreeMap<String, serde_json::Value>) -> Result<(), RunError> {
    let (Some(submitted), Some(completed)) = (
        metadata.get("submitted").and_then(|v| v.as_i64()),
        metadata.get("completed").and_then(|v| v.as_i64()),
    ) else {
        return Ok(());
    };
    if submitted != completed {
        return Err(RunError::CompletionMismatch {
            submitted,
            completed,
        });
    }
    Ok(())
}

/// Best-effort frequency governor pin for the measurement core. Restores the
/// previous governor when dropped. Failures only warn; measurements proceed
/// with whatever governor the machine has.
pub struct FrequencyPin {
    core: u32,
    prior: Option<String>,
}

impl FrequencyPin {
    pub fn engage(core: u32) -> Self {
        let governor_path =
            format!("/sys/devices/system/cpu/cpu{core}/cpufreq/scaling_governor");
        let prior = fs::read_to_string(&governor_path)
            .ok()
            .map(|s| s.trim().to_owned());
        match set_governor(core, "performance") {
            Ok(()) => tracing::info!(core, "pinned frequency governor to performance"),
            Err(err) => {
                tracing::warn!(core, %err, "could not pin frequency governor, continuing unpinned")
            }
        }
        FrequencyPin { core, prior }
    }
}

impl Drop for FrequencyPin {
    fn drop(&mut self) {
        let Some(prior) = self.prior.take() else {
            return;
        };
        if prior == "performance" {
            return;
        }
        if let Err(err) = set_governor(self.core, &prior) {
            tracing::warn!(core = self.core, %err, "could not restore frequency governor");
        }
    }
}

fn set_governor(core: u32, governor: &str) -> std::io::Result<()> {
    let output = Command::new("cpupower")
        .args(["-c", &core.to_string(), "frequency-set", "-g", governor])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;
    if !output.status.success() {
        return Err(std::io::Error::other(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

/// Sequential measurement controller. Runs one trial at a time so trials
/// never contend with each other for the pinned core.
pub struct Controller<L> {
    launcher: L,
    config: RunConfig,
}

impl<L: Launcher> Controller<L> {
    pub fn new(launcher: L, config: RunConfig) -> Self {
        Controller { launcher, config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs every target across the sweep. Frequency pinning, when requested,
    /// spans the whole campaign.
    pub fn run_campaign(
        &self,
        targets: &[CompiledTarget],
        catalog: &Catalog,
        sweeps: &[SweepSpec],
    ) -> Vec<RunRecord> {
        let _pin = match (self.config.pin_frequency, self.config.core) {
            (true, Some(core)) => Some(FrequencyPin::engage(core)),
            _ => None,
        };
        let mut records = Vec::new();
        for target in targets {
            let Some(entry) = catalog.category(target.category) else {
                tracing::warn!(operation = %target.operation, "target has no catalog entry, skipping");
                continue;
            };
            records.extend(self.run_operation(target, entry, sweeps));
        }
        records
    }

    /// Runs one operation across the parameter sweep: per tuple, an optional
    /// warm-up then `trials` measured runs. Every trial produces a record,
    /// completed or failed.
    pub fn run_operation(
        &self,
        target: &CompiledTarget,
        entry: &CategoryEntry,
        sweeps: &[SweepSpec],
    ) -> Vec<RunRecord> {
        let mut records = Vec::new();
        for mut params in expand_sweep(sweeps) {
            params.merge_defaults(&entry.defaults_for(&target.operation));
            let spec = self.launch_spec(target, entry, &params);
            tracing::info!(
                operation = %target.operation,
                params = %params.tuple_key(),
                "running"
            );

            if self.config.warmup {
                if let Err(err) = self.run_once(&spec) {
                    let err = RunError::WarmUpFailed(err.to_string());
                    tracing::warn!(operation = %target.operation, %err, "skipping parameter tuple");
                    records.push(self.record(target, &params, 0, Err(err)));
                    continue;
                }
            }

            for trial in 0..self.config.trials {
                let outcome = self.run_with_retries(&spec);
                if let Err(err) = &outcome {
                    tracing::warn!(operation = %target.operation, trial, %err, "trial failed");
                }
                records.push(self.record(target, &params, trial, outcome));
            }
        }
        records
    }

    fn launch_spec(
        &self,
        target: &CompiledTarget,
        entry: &CategoryEntry,
        params: &ParameterSet,
    ) -> LaunchSpec {
        let mut args = params.to_args();
        args.push("-i".to_owned());
        args.push(self.config.iterations.to_string());
        if entry.category.is_api() && !self.config.runtime_args.is_empty() {
            args.push("--".to_owned());
            args.extend(self.config.runtime_args.iter().cloned());
        }
        LaunchSpec {
            exe: target.exe.clone(),
            args,
            core: self.config.core,
            timeout: self.config.timeout,
        }
    }

    fn run_with_retries(
        &self,
        spec: &LaunchSpec,
    ) -> Result<(CycleMeasure, BTreeMap<String, serde_json::Value>), RunError> {
        let mut attempt = 0;
        loop {
            match self.run_once(spec) {
                Ok(result) => return Ok(result),
                Err(err) if attempt < self.config.retries => {
                    attempt += 1;
                    tracing::debug!(%err, attempt, "retrying trial");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_once(
        &self,
        spec: &LaunchSpec,
    ) -> Result<(CycleMeasure, BTreeMap<String, serde_json::Value>), RunError> {
        let outcome = self.launcher.launch(spec)?;
        if !outcome.success {
            return Err(RunError::NonZeroExit {
                status: outcome.status,
                detail: tail(&outcome.stderr, 10),
            });
        }
        let (measure, metadata) = parse_output(&outcome.stdout)?;
        check_completion(&metadata)?;
        Ok((measure, metadata))
    }

    fn record(
        &self,
        target: &CompiledTarget,
        params: &ParameterSet,
        trial: u32,
        outcome: Result<(CycleMeasure, BTreeMap<String, serde_json::Value>), RunError>,
    ) -> RunRecord {
        RunRecord {
            operation: target.operation.clone(),
            category: target.category,
            params: params.clone(),
            trial,
            iterations: self.config.iterations,
            timestamp: Utc::now(),
            outcome: match outcome {
                Ok((measure, metadata)) => RunOutcome::Completed { measure, metadata },
                Err(err) => RunOutcome::Failed {
                    reason: err.to_string(),
                },
            },
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

use std::time::Duration;

use anyhow::{bail, Context};
use latbench::{
    analyze,
    catalog::executable_name,
    compile::{self, CompiledTarget, CompileReport, CompilerConfig},
    results::RunOutcome,
    runner::{Controller, Launcher, ProcessLauncher, RunConfig, StubLauncher},
    Catalog, ResultLog,
};

use crate::config::{
    AnalyzeCliConfig, BaseConfig, BuildCliConfig, GenerateCliConfig, RunCliConfig,
};

/// Loads the catalog, printing per-category failures. Only a catalog with no
/// usable category at all is fatal.
fn load_catalog(base: &BaseConfig) -> anyhow::Result<Catalog> {
    let catalog = Catalog::load(&base.catalog_dir)
        .with_context(|| format!("loading catalog from {}", base.catalog_dir.display()))?;
    for (category, err) in catalog.failures() {
        println!("skipping category {category}: {err}");
    }
    if catalog.categories().is_empty() && !catalog.failures().is_empty() {
        bail!("every category in {} failed to load", base.catalog_dir.display());
    }
    Ok(catalog)
}

pub fn generate(_config: GenerateCliConfig, base: &BaseConfig) -> anyhow::Result<()> {
    let catalog = load_catalog(base)?;
    let compiler = CompilerConfig::new(&base.build_dir);
    let report = compile::generate_all(&catalog, &compiler)?;
    summarize("generated", &report)
}

pub fn build(config: BuildCliConfig, base: &BaseConfig) -> anyhow::Result<()> {
    let catalog = load_catalog(base)?;
    let mut compiler = CompilerConfig::new(&base.build_dir);
    compiler.cc = config.cc;
    if !config.cflags.is_empty() {
        compiler.cflags = config.cflags;
    }
    compiler.include_dirs = config.include_dirs;
    compiler.libs = config.libs;
    compiler.harness_sources = config.harness_sources;

    let report = compile::build_all(&catalog, &compiler)?;
    summarize("built", &report)
}

pub fn run(config: RunCliConfig, base: &BaseConfig) -> anyhow::Result<()> {
    let catalog = load_catalog(base)?;
    let targets = select_targets(&catalog, &config, base)?;
    let run_config = RunConfig {
        iterations: config.iterations,
        trials: config.trials,
        core: Some(config.core),
        timeout: Duration::from_secs(config.timeout_secs),
        warmup: !config.no_warmup,
        retries: config.retries,
        runtime_args: config.runtime_args.clone(),
        pin_frequency: config.pin_frequency,
    };

    tracing::info!(
        targets = targets.len(),
        trials = config.trials,
        iterations = config.iterations,
        "starting measurement campaign"
    );
    let records = if config.stub {
        run_campaign(StubLauncher::new(100.0), run_config, &targets, &catalog, &config)
    } else {
        run_campaign(ProcessLauncher, run_config, &targets, &catalog, &config)
    };

    let log = ResultLog::new(&config.results);
    log.append(&records)
        .with_context(|| format!("appending to {}", config.results.display()))?;
    let completed = records
        .iter()
        .filter(|r| matches!(r.outcome, RunOutcome::Completed { .. }))
        .count();
    println!(
        "{} trials recorded ({} completed, {} failed) -> {}",
        records.len(),
        completed,
        records.len() - completed,
        config.results.display()
    );
    Ok(())
}

fn run_campaign<L: Launcher>(
    launcher: L,
    run_config: RunConfig,
    targets: &[CompiledTarget],
    catalog: &Catalog,
    config: &RunCliConfig,
) -> Vec<latbench::RunRecord> {
    Controller::new(launcher, run_config).run_campaign(targets, catalog, &config.params)
}

/// Resolves the requested operations against the catalog and the build
/// directory. Executables must already exist unless running with the stub.
fn select_targets(
    catalog: &Catalog,
    config: &RunCliConfig,
    base: &BaseConfig,
) -> anyhow::Result<Vec<CompiledTarget>> {
    let bin_dir = base.build_dir.join("bin");
    let mut targets = Vec::new();
    if config.operations.is_empty() {
        for (entry, snippet) in catalog.iter_snippets() {
            targets.push(CompiledTarget {
                operation: snippet.name.clone(),
                category: entry.category,
                exe: bin_dir.join(executable_name(entry.category, &snippet.name)),
            });
        }
    } else {
        for name in &config.operations {
            let Some((entry, snippet)) = catalog.find_operation(name) else {
                bail!("operation `{name}` is not in the catalog");
            };
            targets.push(CompiledTarget {
                operation: snippet.name.clone(),
                category: entry.category,
                exe: bin_dir.join(executable_name(entry.category, &snippet.name)),
            });
        }
    }
    if targets.is_empty() {
        bail!("catalog has no operations to run");
    }
    if !config.stub {
        for target in &targets {
            if !target.exe.exists() {
                bail!(
                    "missing executable {}; run `lbdev build` first",
                    target.exe.display()
                );
            }
        }
    }
    Ok(targets)
}

pub fn analyze_log(config: AnalyzeCliConfig, _base: &BaseConfig) -> anyhow::Result<()> {
    let log = ResultLog::new(&config.results);
    let records = log
        .load()
        .with_context(|| format!("reading run log {}", config.results.display()))?;
    if records.is_empty() {
        bail!("run log {} holds no records", config.results.display());
    }

    let analysis = analyze(&records);
    analysis
        .write(&config.output_dir)
        .with_context(|| format!("writing analysis to {}", config.output_dir.display()))?;
    println!(
        "{} operations modeled, {} failed -> {}",
        analysis.latency.operations.len(),
        analysis.latency.failures.len(),
        config.output_dir.display()
    );
    for (operation, reason) in &analysis.latency.failures {
        println!("  {operation}: {reason}");
    }
    Ok(())
}

fn summarize(verb: &str, report: &CompileReport) -> anyhow::Result<()> {
    println!("{} targets {verb}, {} failed", report.built.len(), report.failed.len());
    for (operation, err) in &report.failed {
        println!("  {operation}: {err}");
    }
    if report.built.is_empty() && !report.failed.is_empty() {
        bail!("every target failed");
    }
    Ok(())
}

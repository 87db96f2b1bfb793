use std::path::PathBuf;

use latbench::{
    runner::{DEFAULT_CORE, DEFAULT_ITERATIONS},
    SweepSpec,
};

#[derive(clap::Parser, Clone)]
#[clap(name = "Latency Benchmark Tool")]
#[clap(version = "0.1.0")]
pub struct Config {
    #[clap(subcommand)]
    pub sub_command: SubCommand,
    #[clap(flatten)]
    pub additional: BaseConfig,
}

#[derive(clap::Parser, Clone)]
pub struct BaseConfig {
    /// Snippet catalog directory.
    #[arg(long, default_value = "benchmarks", env = "LATBENCH_CATALOG_DIR")]
    pub(crate) catalog_dir: PathBuf,
    /// Output directory for generated sources and compiled executables.
    #[arg(long, default_value = "build", env = "LATBENCH_BUILD_DIR")]
    pub(crate) build_dir: PathBuf,
}

#[derive(clap::Subcommand, Clone)]
pub enum SubCommand {
    Generate(GenerateCliConfig),
    Build(BuildCliConfig),
    Run(RunCliConfig),
    Analyze(AnalyzeCliConfig),
}

/// Merges every snippet into its category template and writes the generated
/// sources, without invoking the compiler.
#[derive(clap::Parser, Clone)]
pub struct GenerateCliConfig {}

/// Generates and compiles every snippet into a measurement executable.
#[derive(clap::Parser, Clone)]
pub struct BuildCliConfig {
    /// C compiler to invoke.
    #[arg(long, default_value = "cc", env = "CC")]
    pub(crate) cc: String,
    /// Extra compiler flag; repeatable. Replaces the default `-O2 -g`.
    #[arg(long = "cflag")]
    pub(crate) cflags: Vec<String>,
    /// Header search directory; repeatable.
    #[arg(long = "include")]
    pub(crate) include_dirs: Vec<PathBuf>,
    /// Linker input passed through verbatim, e.g. `-lrte_eal`; repeatable.
    #[arg(long = "lib")]
    pub(crate) libs: Vec<String>,
    /// Harness source compiled into every target; repeatable.
    #[arg(long = "harness")]
    pub(crate) harness_sources: Vec<PathBuf>,
}

/// Runs compiled benchmarks across a parameter sweep and appends the results
/// to the run log.
#[derive(clap::Parser, Clone)]
pub struct RunCliConfig {
    /// Operations to run. With none given, every operation in the catalog
    /// runs.
    pub(crate) operations: Vec<String>,
    /// Swept parameter as `key=v1,v2,...`; repeatable. Parameters not swept
    /// fall back to the catalog defaults.
    #[arg(long = "param", value_parser = parse_sweep)]
    pub(crate) params: Vec<SweepSpec>,
    /// Loop iterations per trial.
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    pub(crate) iterations: u64,
    /// Measured trials per parameter tuple.
    #[arg(long, default_value_t = 5)]
    pub(crate) trials: u32,
    /// Core to pin the benchmark to.
    #[arg(long, default_value_t = DEFAULT_CORE)]
    pub(crate) core: u32,
    /// Per-trial timeout in seconds.
    #[arg(long, default_value_t = 300)]
    pub(crate) timeout_secs: u64,
    /// Skip the discarded warm-up run before each parameter tuple.
    #[arg(long)]
    pub(crate) no_warmup: bool,
    /// Additional attempts per trial after a failure.
    #[arg(long, default_value_t = 0)]
    pub(crate) retries: u32,
    /// Pin the CPU frequency governor to `performance` for the campaign.
    #[arg(long)]
    pub(crate) pin_frequency: bool,
    /// Simulate execution instead of launching real binaries.
    #[arg(long)]
    pub(crate) stub: bool,
    /// Run log to append to.
    #[arg(long, default_value = "results/runs.jsonl")]
    pub(crate) results: PathBuf,
    /// Runtime initialization arguments, passed to API-category benchmarks
    /// after `--`.
    #[arg(last = true)]
    pub(crate) runtime_args: Vec<String>,
}

/// Fits latency models from the run log and writes the analysis documents.
#[derive(clap::Parser, Clone)]
pub struct AnalyzeCliConfig {
    /// Run log to analyze.
    #[arg(long, default_value = "results/runs.jsonl")]
    pub(crate) results: PathBuf,
    /// Directory the JSON documents are written to.
    #[arg(long, default_value = "analysis-results")]
    pub(crate) output_dir: PathBuf,
}

fn parse_sweep(src: &str) -> Result<SweepSpec, String> {
    src.parse()
}

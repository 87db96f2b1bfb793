use std::{path::PathBuf, time::Duration};

/// Build-time errors: catalog inconsistencies, contract violations and
/// compiler failures. All of these are fatal for the affected target only;
/// callers report them per target and keep going.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("category `{0}` has no manifest (category.toml)")]
    MissingManifest(String),
    #[error("invalid manifest for category `{category}`: {reason}")]
    InvalidManifest { category: String, reason: String },
    #[error("missing template `{template}` for category `{category}`")]
    MissingTemplate { category: String, template: String },
    #[error("template for category `{category}` has no `{marker}` marker")]
    MissingMarker { category: String, marker: String },
    #[error("template for category `{category}` has more than one `{marker}` marker")]
    AmbiguousMarker { category: String, marker: String },
    #[error("duplicate snippet name `{name}` in category `{category}`")]
    DuplicateSnippet { category: String, name: String },
    #[error("snippet `{name}` has no call section")]
    MissingCall { name: String },
    #[error(
        "snippet `{name}` references `{identifier}`, which the `{category}` template contract does not provide"
    )]
    UnresolvedIdentifier {
        name: String,
        category: String,
        identifier: String,
    },
    #[error("snippet `{name}` declares `{identifier}`, a loop control identifier owned by the template")]
    LoopControlCapture { name: String, identifier: String },
    #[error("compiling `{target}` failed:\n{stderr}")]
    CompileFailed { target: String, stderr: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors local to one benchmark run. The sweep over other parameter tuples
/// and operations continues; the failed run is recorded, never dropped.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn `{exe}`: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("benchmark exited with status {status}: {detail}")]
    NonZeroExit { status: String, detail: String },
    #[error("benchmark timed out after {0:?}")]
    Timeout(Duration),
    #[error("no `Total cycles:` or `Cycles per call:` line in benchmark output")]
    MissingCycleLine,
    #[error("malformed `{line}` line: `{content}`")]
    MalformedLine { line: &'static str, content: String },
    #[error("completion mismatch at teardown: submitted {submitted}, completed {completed}")]
    CompletionMismatch { submitted: i64, completed: i64 },
    #[error("warm-up run failed: {0}")]
    WarmUpFailed(String),
    #[error("malformed result record at line {line}: {source}")]
    MalformedRecord {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Statistical modeling failures. Insufficient data never fabricates a
/// coefficient; it is surfaced as an explicit marker or failure entry instead.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("operation `{0}` has no valid samples")]
    NoValidSamples(String),
    #[error("singular design matrix for operation `{0}`")]
    SingularSystem(String),
}

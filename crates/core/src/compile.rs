use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::{
    catalog::Catalog,
    error::BuildError,
    template::{self, GeneratedProgram},
};

/// External compiler invocation settings. One configuration covers a whole
/// build; per-target state lives in [`CompiledTarget`].
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Compiler executable, `cc` unless overridden.
    pub cc: String,
    pub cflags: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    /// Linker inputs, passed through verbatim (`-lrte_eal`, `-lm`, ...).
    pub libs: Vec<String>,
    /// Extra sources compiled into every target, e.g. the shared driver with
    /// `main`, cycle counting and parameter lookup.
    pub harness_sources: Vec<PathBuf>,
    pub build_dir: PathBuf,
}

impl CompilerConfig {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        CompilerConfig {
            cc: "cc".to_owned(),
            cflags: vec!["-O2".to_owned(), "-g".to_owned()],
            include_dirs: Vec::new(),
            libs: Vec::new(),
            harness_sources: Vec::new(),
            build_dir: build_dir.into(),
        }
    }

    fn source_dir(&self) -> PathBuf {
        self.build_dir.join("src")
    }

    fn bin_dir(&self) -> PathBuf {
        self.build_dir.join("bin")
    }
}

/// A successfully compiled measurement executable.
#[derive(Debug, Clone)]
pub struct CompiledTarget {
    pub operation: String,
    pub category: crate::catalog::Category,
    pub exe: PathBuf,
}

/// Outcome of one build pass. A failed target never aborts the pass; the
/// remaining targets still build and the failure is reported alongside.
#[derive(Debug, Default)]
pub struct CompileReport {
    pub built: Vec<CompiledTarget>,
    pub failed: Vec<(String, BuildError)>,
}

impl CompileReport {
    pub fn target(&self, operation: &str) -> Option<&CompiledTarget> {
        self.built.iter().find(|t| t.operation == operation)
    }
}

/// Generates every catalog operation into `<build_dir>/src` without invoking
/// the compiler. Contract violations surface here, per target.
pub fn generate_all(catalog: &Catalog, config: &CompilerConfig) -> Result<CompileReport, BuildError> {
    let src_dir = config.source_dir();
    fs::create_dir_all(&src_dir)?;
    let mut report = CompileReport::default();
    for (entry, snippet) in catalog.iter_snippets() {
        match template::generate(entry, snippet) {
            Ok(program) => {
                write_source(&src_dir, &program)?;
                report.built.push(CompiledTarget {
                    operation: program.operation,
                    category: program.category,
                    exe: PathBuf::new(),
                });
            }
            Err(err) => {
                tracing::warn!(operation = %snippet.name, %err, "generation failed");
                report.failed.push((snippet.name.clone(), err));
            }
        }
    }
    Ok(report)
}

/// Generates and compiles every catalog operation. Returns the executables
/// that built plus per-target failures.
pub fn build_all(catalog: &Catalog, config: &CompilerConfig) -> Result<CompileReport, BuildError> {
    let src_dir = config.source_dir();
    let bin_dir = config.bin_dir();
    fs::create_dir_all(&src_dir)?;
    fs::create_dir_all(&bin_dir)?;

    let mut report = CompileReport::default();
    for (entry, snippet) in catalog.iter_snippets() {
        let program = match template::generate(entry, snippet) {
            Ok(program) => program,
            Err(err) => {
                tracing::warn!(operation = %snippet.name, %err, "generation failed");
                report.failed.push((snippet.name.clone(), err));
                continue;
            }
        };
        let source = write_source(&src_dir, &program)?;
        match compile_target(config, entry, &program, &source, &bin_dir) {
            Ok(target) => {
                tracing::info!(target = %target.operation, exe = %target.exe.display(), "built");
                report.built.push(target);
            }
            Err(err) => {
                tracing::warn!(target = %program.target, %err, "compilation failed");
                report.failed.push((program.operation, err));
            }
        }
    }
    Ok(report)
}

fn write_source(src_dir: &Path, program: &GeneratedProgram) -> Result<PathBuf, BuildError> {
    let path = src_dir.join(format!("{}.c", program.target));
    fs::write(&path, &program.source)?;
    Ok(path)
}

fn compile_target(
    config: &CompilerConfig,
    entry: &crate::catalog::CategoryEntry,
    program: &GeneratedProgram,
    source: &Path,
    bin_dir: &Path,
) -> Result<CompiledTarget, BuildError> {
    let exe = bin_dir.join(&program.target);
    let mut cmd = Command::new(&config.cc);
    cmd.args(&config.cflags);
    for dir in &config.include_dirs {
        cmd.arg("-I").arg(dir);
    }
    cmd.arg(source);
    cmd.args(&config.harness_sources);
    cmd.args(entry.harness_sources());
    cmd.arg("-o").arg(&exe);
    cmd.args(&config.libs);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    tracing::debug!(target = %program.target, compiler = %config.cc, "compiling");
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(BuildError::CompileFailed {
            target: program.target.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(CompiledTarget {
        operation: program.operation.clone(),
        category: program.category,
        exe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use testresult::TestResult;

    fn stub_catalog(base: &Path) -> TestResult {
        let dir = base.join("arithmetic");
        fs::create_dir_all(&dir)?;
        fs::write(
            dir.join("category.toml"),
            "template = \"template.c\"\nprovides = [\"acc\"]\n",
        )?;
        fs::write(dir.join("template.c"), "// {{BENCHMARK_LOOP}}\n")?;
        fs::write(dir.join("add-imm.c"), "acc += 1;\n")?;
        fs::write(dir.join("bogus.c"), "undeclared_thing += 1;\n")?;
        Ok(())
    }

    #[test]
    fn generation_isolates_per_target_failures() -> TestResult {
        let tmp = tempfile::tempdir()?;
        stub_catalog(tmp.path())?;
        let catalog = Catalog::load(tmp.path())?;
        let config = CompilerConfig::new(tmp.path().join("build"));

        let report = generate_all(&catalog, &config)?;
        assert_eq!(report.built.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bogus");
        assert!(matches!(
            report.failed[0].1,
            BuildError::UnresolvedIdentifier { .. }
        ));

        let generated =
            fs::read_to_string(tmp.path().join("build/src/arithmetic_add-imm.c"))?;
        assert_eq!(generated, "acc += 1;\n");
        Ok(())
    }

    #[test]
    fn failed_compiler_invocation_reports_stderr() -> TestResult {
        let tmp = tempfile::tempdir()?;
        stub_catalog(tmp.path())?;
        fs::remove_file(tmp.path().join("arithmetic/bogus.c"))?;
        let catalog = Catalog::load(tmp.path())?;
        let mut config = CompilerConfig::new(tmp.path().join("build"));
        // `false` accepts any arguments and exits non-zero.
        config.cc = "false".to_owned();

        let report = build_all(&catalog, &config)?;
        assert!(report.built.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].1,
            BuildError::CompileFailed { .. }
        ));
        Ok(())
    }
}

use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::BuildError;

/// Fixed set of benchmark categories. Instruction categories measure single
/// IR-level operations; API categories measure single calls into the
/// packet-processing runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Arithmetic,
    Memory,
    Pointer,
    FpArithmetic,
    Conversion,
    Control,
    Call,
    Alloc,
    Ethdev,
    Cryptodev,
    Compressdev,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Arithmetic,
        Category::Memory,
        Category::Pointer,
        Category::FpArithmetic,
        Category::Conversion,
        Category::Control,
        Category::Call,
        Category::Alloc,
        Category::Ethdev,
        Category::Cryptodev,
        Category::Compressdev,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Arithmetic => "arithmetic",
            Category::Memory => "memory",
            Category::Pointer => "pointer",
            Category::FpArithmetic => "fp-arithmetic",
            Category::Conversion => "conversion",
            Category::Control => "control",
            Category::Call => "call",
            Category::Alloc => "alloc",
            Category::Ethdev => "ethdev",
            Category::Cryptodev => "cryptodev",
            Category::Compressdev => "compressdev",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// API categories need the runtime's init sequence and accept runtime
    /// parameters; instruction categories take only the iteration count.
    pub fn is_api(&self) -> bool {
        matches!(
            self,
            Category::Ethdev | Category::Cryptodev | Category::Compressdev
        )
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic executable name for one measurable operation.
pub fn executable_name(category: Category, snippet: &str) -> String {
    format!("{}_{}", category.as_str(), snippet)
}

/// Per-category manifest (`category.toml`): the template file, the identifier
/// contract snippets are validated against, and documented parameter defaults
/// per operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryManifest {
    /// Template file name, relative to the category directory.
    pub template: String,
    /// File extension of snippet sections (`c` for API categories, `ll` for
    /// instruction categories).
    #[serde(default = "default_extension")]
    pub snippet_extension: String,
    /// Comment prefix the template's insertion markers use.
    #[serde(default = "default_comment_prefix")]
    pub comment_prefix: String,
    /// Whether snippets are validated against the identifier contract before
    /// compilation. Instruction categories may opt out.
    #[serde(default = "default_true")]
    pub check_identifiers: bool,
    /// Identifiers the template pre-declares for snippets (accumulators,
    /// helper buffers, parameter lookup).
    #[serde(default)]
    pub provides: Vec<String>,
    /// Runtime API surface a snippet may reference.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Loop control identifiers owned exclusively by the template. Snippets
    /// may read them but must never declare them.
    #[serde(default = "default_loop_control")]
    pub loop_control: Vec<String>,
    /// Harness sources compiled into every target of this category, relative
    /// to the category directory (runtime init, cycle counting, `main`).
    #[serde(default)]
    pub harness: Vec<String>,
    /// Documented runtime parameter defaults, keyed by operation name.
    #[serde(default)]
    pub defaults: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_extension() -> String {
    "c".to_owned()
}

fn default_comment_prefix() -> String {
    "//".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_loop_control() -> Vec<String> {
    vec!["i".to_owned(), "acc".to_owned()]
}

/// One measurable operation: the measured call plus optional setup, teardown,
/// header and in-flight cleanup sections merged into the category template.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub name: String,
    pub category: Category,
    pub call: String,
    pub setup: Option<String>,
    pub teardown: Option<String>,
    pub headers: Option<String>,
    pub cleanup: Option<String>,
}

impl Snippet {
    /// All text sections, for identifier scanning.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.call.as_str())
            .chain(self.setup.as_deref())
            .chain(self.teardown.as_deref())
            .chain(self.headers.as_deref())
            .chain(self.cleanup.as_deref())
    }
}

/// A category with its template text, manifest and snippets.
#[derive(Debug, Clone)]
pub struct CategoryEntry {
    pub category: Category,
    pub dir: PathBuf,
    pub manifest: CategoryManifest,
    pub template: String,
    pub snippets: Vec<Snippet>,
}

impl CategoryEntry {
    pub fn defaults_for(&self, operation: &str) -> BTreeMap<String, String> {
        self.manifest
            .defaults
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    /// Absolute paths of this category's harness sources.
    pub fn harness_sources(&self) -> Vec<PathBuf> {
        self.manifest.harness.iter().map(|h| self.dir.join(h)).collect()
    }
}

/// The snippet repository: every category found under the catalog base
/// directory, loaded and checked for name collisions.
#[derive(Debug, Default)]
pub struct Catalog {
    categories: Vec<CategoryEntry>,
    failures: Vec<(Category, BuildError)>,
}

impl Catalog {
    /// Loads every category under the base directory. A broken category is
    /// recorded as a failure and skipped; the rest of the catalog still
    /// loads.
    pub fn load(base: &Path) -> Result<Self, BuildError> {
        let mut categories = Vec::new();
        let mut failures = Vec::new();
        let mut dirs: Vec<PathBuf> = fs::read_dir(base)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            let dir_name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_owned();
            let Some(category) = Category::from_dir_name(&dir_name) else {
                tracing::warn!(directory = %dir.display(), "skipping unknown category directory");
                continue;
            };
            match load_category(category, &dir) {
                Ok(entry) => categories.push(entry),
                Err(err) => {
                    tracing::warn!(%category, %err, "category failed to load");
                    failures.push((category, err));
                }
            }
        }
        Ok(Catalog {
            categories,
            failures,
        })
    }

    pub fn categories(&self) -> &[CategoryEntry] {
        &self.categories
    }

    /// Categories that could not be loaded, with the reason.
    pub fn failures(&self) -> &[(Category, BuildError)] {
        &self.failures
    }

    pub fn category(&self, category: Category) -> Option<&CategoryEntry> {
        self.categories.iter().find(|e| e.category == category)
    }

    pub fn iter_snippets(&self) -> impl Iterator<Item = (&CategoryEntry, &Snippet)> {
        self.categories
            .iter()
            .flat_map(|entry| entry.snippets.iter().map(move |s| (entry, s)))
    }

    pub fn find_operation(&self, name: &str) -> Option<(&CategoryEntry, &Snippet)> {
        self.iter_snippets().find(|(_, s)| s.name == name)
    }
}

fn load_category(category: Category, dir: &Path) -> Result<CategoryEntry, BuildError> {
    let manifest_path = dir.join("category.toml");
    if !manifest_path.exists() {
        return Err(BuildError::MissingManifest(category.to_string()));
    }
    let manifest: CategoryManifest =
        toml::from_str(&fs::read_to_string(&manifest_path)?).map_err(|e| {
            BuildError::InvalidManifest {
                category: category.to_string(),
                reason: e.to_string(),
            }
        })?;

    let template_path = dir.join(&manifest.template);
    if !template_path.exists() {
        return Err(BuildError::MissingTemplate {
            category: category.to_string(),
            template: manifest.template.clone(),
        });
    }
    let template = fs::read_to_string(&template_path)?;

    let mut snippets = Vec::new();
    let mut seen = HashSet::new();
    let mut record = |snippet: Snippet| {
        if !seen.insert(snippet.name.clone()) {
            return Err(BuildError::DuplicateSnippet {
                category: category.to_string(),
                name: snippet.name,
            });
        }
        tracing::debug!(category = %category, snippet = %snippet.name, "loaded snippet");
        snippets.push(snippet);
        Ok(())
    };

    let mut subdirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();
    for path in subdirs {
        record(load_snippet_dir(category, &path, &manifest)?)?;
    }

    // The template and harness sources share the category directory; they
    // are never snippets.
    let mut excluded: Vec<PathBuf> = manifest.harness.iter().map(|h| dir.join(h)).collect();
    excluded.push(template_path);

    let pattern = dir.join(format!("*.{}", manifest.snippet_extension));
    let paths = glob::glob(&pattern.to_string_lossy()).map_err(|e| {
        BuildError::InvalidManifest {
            category: category.to_string(),
            reason: e.to_string(),
        }
    })?;
    for path in paths {
        let path = path.map_err(|e| BuildError::Io(e.into_error()))?;
        if let Some(snippet) = load_snippet_file(category, &path, &excluded)? {
            record(snippet)?;
        }
    }
    Ok(CategoryEntry {
        category,
        dir: dir.to_path_buf(),
        manifest,
        template,
        snippets,
    })
}

/// Directory-style snippet: `<name>/call.c` plus optional sections.
fn load_snippet_dir(
    category: Category,
    dir: &Path,
    manifest: &CategoryManifest,
) -> Result<Snippet, BuildError> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_owned();
    let ext = &manifest.snippet_extension;
    let section = |stem: &str| -> Result<Option<String>, std::io::Error> {
        let path = dir.join(format!("{stem}.{ext}"));
        if path.exists() {
            Ok(Some(fs::read_to_string(path)?.trim().to_owned()))
        } else {
            Ok(None)
        }
    };
    let Some(call) = section("call")? else {
        return Err(BuildError::MissingCall { name });
    };
    Ok(Snippet {
        name,
        category,
        call,
        setup: section("setup")?,
        teardown: section("teardown")?,
        headers: section("headers")?,
        cleanup: section("cleanup")?,
    })
}

/// File-style snippet: a single `<name>.<ext>` holding just the measured
/// fragment. Used by the instruction categories.
fn load_snippet_file(
    category: Category,
    path: &Path,
    excluded: &[PathBuf],
) -> Result<Option<Snippet>, BuildError> {
    if excluded.iter().any(|e| e == path) || path.file_name().is_some_and(|n| n == "category.toml")
    {
        return Ok(None);
    }
    let name = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_owned();
    let call = fs::read_to_string(path)?.trim().to_owned();
    Ok(Some(Snippet {
        name,
        category,
        call,
        setup: None,
        teardown: None,
        headers: None,
        cleanup: None,
    }))
}

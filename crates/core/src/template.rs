use std::collections::HashSet;

use crate::{
    catalog::{executable_name, CategoryEntry, Snippet},
    error::BuildError,
};

/// Marker stems recognized in category templates. The full marker is the
/// category's comment prefix followed by the braced stem, e.g.
/// `// {{BENCHMARK_LOOP}}`.
pub const LOOP_MARKER: &str = "{{BENCHMARK_LOOP}}";
pub const SETUP_MARKER: &str = "{{BENCHMARK_SETUP}}";
pub const HEADERS_MARKER: &str = "{{BENCH_HEADERS}}";
pub const TEARDOWN_MARKER: &str = "{{BENCHMARK_TEARDOWN}}";
pub const CLEANUP_MARKER: &str = "{{CLEANUP_INFLIGHT}}";

/// A complete, compilable measurement program produced by merging one snippet
/// into its category template. Pure function of its inputs: the same
/// (template, snippet) pair always yields byte-identical source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedProgram {
    pub operation: String,
    pub category: crate::catalog::Category,
    pub target: String,
    pub source: String,
}

/// Validates the snippet against the category's identifier contract and merges
/// it into the template.
pub fn generate(entry: &CategoryEntry, snippet: &Snippet) -> Result<GeneratedProgram, BuildError> {
    if entry.manifest.check_identifiers {
        validate_contract(entry, snippet)?;
    }
    let source = merge(entry, snippet)?;
    Ok(GeneratedProgram {
        operation: snippet.name.clone(),
        category: entry.category,
        target: executable_name(entry.category, &snippet.name),
        source,
    })
}

/// Replaces each insertion marker with the corresponding snippet section.
/// The loop marker must appear exactly once; loop control stays with the
/// template. Optional sections merge as empty when the snippet omits them.
pub fn merge(entry: &CategoryEntry, snippet: &Snippet) -> Result<String, BuildError> {
    let prefix = &entry.manifest.comment_prefix;
    let marker = |stem: &str| format!("{prefix} {stem}");

    let loop_marker = marker(LOOP_MARKER);
    match entry.template.matches(&loop_marker).count() {
        1 => {}
        0 => {
            return Err(BuildError::MissingMarker {
                category: entry.category.to_string(),
                marker: loop_marker,
            })
        }
        _ => {
            return Err(BuildError::AmbiguousMarker {
                category: entry.category.to_string(),
                marker: loop_marker,
            })
        }
    }

    let mut source = entry.template.replace(&loop_marker, &snippet.call);
    for (stem, section) in [
        (SETUP_MARKER, snippet.setup.as_deref()),
        (HEADERS_MARKER, snippet.headers.as_deref()),
        (TEARDOWN_MARKER, snippet.teardown.as_deref()),
        (CLEANUP_MARKER, snippet.cleanup.as_deref()),
    ] {
        source = source.replace(&marker(stem), section.unwrap_or_default());
    }
    Ok(source)
}

/// Identifiers that are always legal to reference, independent of any
/// category contract.
const BUILTINS: &[&str] = &["NULL", "sizeof", "true", "false", "__func__"];

/// Statement and storage keywords that are neither declarations nor
/// identifier uses.
const STATEMENT_KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "do", "switch", "case", "default", "break", "continue",
    "return", "goto", "typedef", "extern", "inline",
];

/// Type and qualifier keywords that introduce a declaration.
const TYPE_KEYWORDS: &[&str] = &[
    "void", "char", "short", "int", "long", "float", "double", "signed", "unsigned", "bool",
    "const", "static", "volatile", "register", "struct", "enum", "union", "int8_t", "int16_t",
    "int32_t", "int64_t", "uint8_t", "uint16_t", "uint32_t", "uint64_t", "size_t", "ssize_t",
    "uintptr_t",
];

/// Checks every identifier the snippet references against the template
/// contract: it must be provided by the template, declared by the snippet
/// itself, part of the category's API surface, or a builtin. Loop control
/// identifiers may be read but never declared by the snippet.
fn validate_contract(entry: &CategoryEntry, snippet: &Snippet) -> Result<(), BuildError> {
    let manifest = &entry.manifest;
    let provided: HashSet<&str> = manifest
        .provides
        .iter()
        .chain(manifest.symbols.iter())
        .chain(manifest.loop_control.iter())
        .map(String::as_str)
        .chain(BUILTINS.iter().copied())
        .collect();
    let loop_control: HashSet<&str> = manifest.loop_control.iter().map(String::as_str).collect();

    let mut declared: HashSet<String> = HashSet::new();
    let mut used: Vec<String> = Vec::new();
    for section in snippet.sections() {
        scan_identifiers(section, &mut declared, &mut used);
    }

    for identifier in &declared {
        if loop_control.contains(identifier.as_str()) {
            return Err(BuildError::LoopControlCapture {
                name: snippet.name.clone(),
                identifier: identifier.clone(),
            });
        }
    }
    for identifier in used {
        if !declared.contains(&identifier) && !provided.contains(identifier.as_str()) {
            return Err(BuildError::UnresolvedIdentifier {
                name: snippet.name.clone(),
                category: entry.category.to_string(),
                identifier,
            });
        }
    }
    Ok(())
}

/// Single-pass identifier scanner for the C-like snippet representation.
/// Comments, string and character literals are skipped. An identifier that
/// directly follows a type keyword chain is recorded as a declaration;
/// everything else is a use.
fn scan_identifiers(text: &str, declared: &mut HashSet<String>, used: &mut Vec<String>) {
    let mut chars = text.char_indices().peekable();
    let mut pending_type = false;
    // Set right after `struct`/`enum`/`union`: the next identifier names a
    // type, not a variable.
    let mut expect_tag = false;
    // Inside a declaration statement, a top-level comma starts another
    // declarator of the same type.
    let mut in_declaration = false;
    let mut paren_depth: u32 = 0;
    // Set after `.` or `->`: the next identifier is a member name, outside
    // the contract.
    let mut member_access = false;

    while let Some((idx, c)) = chars.next() {
        match c {
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                while let Some((_, c)) = chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = ' ';
                for (_, c) in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut escaped = false;
                for (_, c) in chars.by_ref() {
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == quote {
                        break;
                    }
                }
            }
            '#' => {
                // Preprocessor lines are outside the contract.
                while let Some((_, c)) = chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = idx + c.len_utf8();
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end = j + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &text[idx..end];
                if member_access {
                    member_access = false;
                } else if TYPE_KEYWORDS.contains(&word) {
                    pending_type = true;
                    expect_tag = matches!(word, "struct" | "enum" | "union");
                } else if STATEMENT_KEYWORDS.contains(&word) {
                    pending_type = false;
                    expect_tag = false;
                } else if expect_tag {
                    // A struct/enum/union tag names a type; treat it as
                    // declared so later uses of the tag resolve.
                    declared.insert(word.to_owned());
                    expect_tag = false;
                } else if pending_type {
                    declared.insert(word.to_owned());
                    pending_type = false;
                    in_declaration = true;
                } else {
                    used.push(word.to_owned());
                }
            }
            c if c.is_whitespace() => {} // layout never changes scanner state
            '*' | '&' => {}              // pointer declarators keep the pending type
            '.' => member_access = true,
            '-' if matches!(chars.peek(), Some((_, '>'))) => {
                chars.next();
                member_access = true;
            }
            '(' => {
                paren_depth += 1;
                pending_type = false;
            }
            ')' => {
                paren_depth = paren_depth.saturating_sub(1);
                pending_type = false;
            }
            ';' => {
                in_declaration = false;
                pending_type = false;
            }
            ',' if in_declaration && paren_depth == 0 => pending_type = true,
            ',' => {}
            c if c.is_ascii_digit() => {
                member_access = false;
                // Skip numeric literals (including suffixes like 0xffUL).
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            _ => {
                pending_type = false;
                expect_tag = false;
                member_access = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Category, CategoryManifest, Snippet};

    fn manifest(provides: &[&str], symbols: &[&str]) -> CategoryManifest {
        toml::from_str::<CategoryManifest>(&format!(
            "template = \"template.c\"\nprovides = {provides:?}\nsymbols = {symbols:?}\n"
        ))
        .unwrap()
    }

    fn entry(template: &str, provides: &[&str], symbols: &[&str]) -> CategoryEntry {
        CategoryEntry {
            category: Category::Cryptodev,
            dir: std::path::PathBuf::from("cryptodev"),
            manifest: manifest(provides, symbols),
            template: template.to_owned(),
            snippets: vec![],
        }
    }

    fn snippet(call: &str) -> Snippet {
        Snippet {
            name: "enqueue_dequeue_burst_encrypt".to_owned(),
            category: Category::Cryptodev,
            call: call.to_owned(),
            setup: None,
            teardown: None,
            headers: None,
            cleanup: None,
        }
    }

    const TEMPLATE: &str = "\
// {{BENCH_HEADERS}}
void setup_benchmark(void) {
    // {{BENCHMARK_SETUP}}
}
void run_benchmark(void) {
    for (unsigned long long i = 0; i < g_iterations; ++i) {
        // {{BENCHMARK_LOOP}}
    }
    // {{CLEANUP_INFLIGHT}}
}
void teardown_benchmark(void) {
    // {{BENCHMARK_TEARDOWN}}
}
";

    #[test]
    fn merge_is_idempotent() {
        let entry = entry(TEMPLATE, &["ops", "cdev_id"], &["rte_cryptodev_enqueue_burst"]);
        let snip = snippet("rte_cryptodev_enqueue_burst(cdev_id, 0, ops, 32);");
        let first = generate(&entry, &snip).unwrap();
        let second = generate(&entry, &snip).unwrap();
        assert_eq!(first.source, second.source);
        assert!(first.source.contains("rte_cryptodev_enqueue_burst(cdev_id, 0, ops, 32);"));
        assert!(!first.source.contains(LOOP_MARKER));
        assert_eq!(first.target, "cryptodev_enqueue_dequeue_burst_encrypt");
    }

    #[test]
    fn absent_optional_sections_merge_as_empty() {
        let entry = entry(TEMPLATE, &["acc"], &[]);
        let merged = merge(&entry, &snippet("acc += 1;")).unwrap();
        assert!(!merged.contains("{{BENCHMARK_SETUP}}"));
        assert!(!merged.contains("{{BENCHMARK_TEARDOWN}}"));
    }

    #[test]
    fn missing_and_duplicate_loop_markers_are_rejected() {
        let bare = entry("no markers here\n", &[], &[]);
        assert!(matches!(
            merge(&bare, &snippet("acc += 1;")),
            Err(BuildError::MissingMarker { .. })
        ));

        let doubled = format!("{TEMPLATE}\n// {{{{BENCHMARK_LOOP}}}}\n");
        let doubled_entry = entry(&doubled, &[], &[]);
        assert!(matches!(
            merge(&doubled_entry, &snippet("acc += 1;")),
            Err(BuildError::AmbiguousMarker { .. })
        ));
    }

    #[test]
    fn unresolved_identifier_fails_before_compilation() {
        let entry = entry(TEMPLATE, &["ops"], &[]);
        let err = generate(&entry, &snippet("mystery_buffer[0] = 1;")).unwrap_err();
        assert!(matches!(
            err,
            BuildError::UnresolvedIdentifier { identifier, .. } if identifier == "mystery_buffer"
        ));
    }

    #[test]
    fn snippet_declarations_and_contract_symbols_resolve() {
        let entry = entry(
            TEMPLATE,
            &["cdev_id", "ops", "get_benchmark_param"],
            &["rte_cryptodev_dequeue_burst", "strtoul", "rte_crypto_op"],
        );
        let snip = snippet(
            "const char* burst_size_str = get_benchmark_param(\"burst_size\");\n\
             unsigned int burst_size = burst_size_str ? (unsigned int)strtoul(burst_size_str, NULL, 10) : 32;\n\
             struct rte_crypto_op *dequeued_ops[burst_size];\n\
             unsigned int dequeued = rte_cryptodev_dequeue_burst(cdev_id, 0, dequeued_ops, burst_size);",
        );
        generate(&entry, &snip).unwrap();
    }

    #[test]
    fn loop_control_ownership_belongs_to_the_template() {
        let entry = entry(TEMPLATE, &["acc"], &[]);
        let err = generate(&entry, &snippet("unsigned long long i = 0;")).unwrap_err();
        assert!(matches!(
            err,
            BuildError::LoopControlCapture { identifier, .. } if identifier == "i"
        ));
        // Reading the loop counter is fine.
        generate(&entry, &snippet("acc += i;")).unwrap();
    }

    #[test]
    fn member_access_names_are_outside_the_contract() {
        let entry = entry(
            TEMPLATE,
            &["ops", "cdev_id", "in_flight"],
            &["rte_cryptodev_dequeue_burst", "rte_comp_op", "RTE_COMP_OP_SUCCESS"],
        );
        // `status` and `consumed` are member names, not contract identifiers.
        let snip = snippet(
            "struct rte_comp_op *done[32];\n\
             unsigned int n = rte_cryptodev_dequeue_burst(cdev_id, 0, done, 32);\n\
             for (unsigned int k = 0; k < n; k++) {\n\
                 if (done[k]->status == RTE_COMP_OP_SUCCESS) {\n\
                     in_flight -= done[k] . consumed;\n\
                 }\n\
             }\n",
        );
        generate(&entry, &snip).unwrap();
    }

    #[test]
    fn statement_keywords_are_not_identifier_uses() {
        let entry = entry(TEMPLATE, &["acc"], &[]);
        let snip = snippet(
            "if (acc > 100) {\n\
                 acc = 0;\n\
             } else {\n\
                 acc += 1;\n\
             }\n\
             while (acc < 0) { break; }\n",
        );
        generate(&entry, &snip).unwrap();
    }

    #[test]
    fn comments_strings_and_preprocessor_lines_are_outside_the_contract() {
        let entry = entry(TEMPLATE, &["acc"], &[]);
        let snip = snippet(
            "// free_running_counter is only mentioned here\n\
             /* and in_flight_ops here */\n\
             #include <rte_mbuf.h>\n\
             acc += 1; // trailing note\n",
        );
        generate(&entry, &snip).unwrap();
    }

    #[test]
    fn ir_categories_can_opt_out_of_identifier_checks() {
        let mut entry = entry("; {{BENCHMARK_LOOP}}\n", &[], &[]);
        entry.manifest.comment_prefix = ";".to_owned();
        entry.manifest.check_identifiers = false;
        let snip = snippet("%sum = add i64 %acc, 1");
        let merged = generate(&entry, &snip).unwrap();
        assert!(merged.source.contains("%sum = add i64 %acc, 1"));
    }
}

//! Load rule files from disk into a [`RuleSet`].
//!
//! Each file is parsed on its own; a broken file costs exactly that rule.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{DestinationCatalog, RawRule, RuleDefinition, RuleSet};
use crate::error::RuleValidationError;

/// Result of loading one generation of rules.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub rules: RuleSet,
    pub errors: Vec<RuleValidationError>,
    /// Rules that parsed but have `enabled = false`.
    pub disabled: Vec<String>,
}

/// Load every rule reachable from `paths` (files, or directories of `*.toml`).
pub fn load(paths: &[PathBuf], catalog: &DestinationCatalog) -> LoadOutcome {
    let mut outcome = LoadOutcome::default();

    for file in collect_rule_files(paths, &mut outcome.errors) {
        let content = match std::fs::read_to_string(&file) {
            Ok(c) => c,
            Err(e) => {
                outcome.errors.push(RuleValidationError::Read {
                    path: file.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        match parse_rule(&content, &file, catalog) {
            Ok(Some(rule)) => {
                let name = rule.name.clone();
                if !outcome.rules.insert(rule) {
                    outcome.errors.push(RuleValidationError::DuplicateName {
                        rule: name,
                        path: file.clone(),
                    });
                }
            }
            Ok(None) => {}
            Err(ParsedRule::Disabled(name)) => outcome.disabled.push(name),
            Err(ParsedRule::Invalid(e)) => outcome.errors.push(e),
        }
    }

    for err in &outcome.errors {
        warn!(error = %err, "rule excluded from scheduling");
    }
    info!(
        loaded = outcome.rules.len(),
        invalid = outcome.errors.len(),
        disabled = outcome.disabled.len(),
        "rules loaded"
    );
    outcome
}

/// Non-success results of [`parse_rule`].
#[derive(Debug)]
pub enum ParsedRule {
    Disabled(String),
    Invalid(RuleValidationError),
}

/// Parse and validate a single rule document.
///
/// Returns `Ok(None)` for an empty document.
pub fn parse_rule(
    content: &str,
    path: &Path,
    catalog: &DestinationCatalog,
) -> Result<Option<RuleDefinition>, ParsedRule> {
    if content.trim().is_empty() {
        debug!(path = %path.display(), "skipping empty rule file");
        return Ok(None);
    }

    let raw: RawRule = toml::from_str(content).map_err(|e| {
        ParsedRule::Invalid(RuleValidationError::Parse {
            path: path.to_path_buf(),
            reason: e.message().to_string(),
        })
    })?;

    if !raw.is_enabled() {
        let name = raw.name.clone().unwrap_or_else(|| path.display().to_string());
        return Err(ParsedRule::Disabled(name));
    }

    raw.validate(path, catalog)
        .map(Some)
        .map_err(ParsedRule::Invalid)
}

fn collect_rule_files(paths: &[PathBuf], errors: &mut Vec<RuleValidationError>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let entries = match std::fs::read_dir(path) {
                Ok(e) => e,
                Err(e) => {
                    errors.push(RuleValidationError::Read {
                        path: path.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let mut found: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            errors.push(RuleValidationError::Read {
                path: path.clone(),
                reason: "no such file or directory".to_string(),
            });
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DestinationCatalog {
        DestinationCatalog {
            known: ["log".to_string()].into_iter().collect(),
            defaults: vec!["log".to_string()],
        }
    }

    fn flatline(name: &str) -> String {
        format!(
            "name = \"{name}\"\nindex = \"logs-*\"\nrun_every = {{ minutes = 5 }}\n\
             [kind]\ntype = \"flatline\"\ntimeframe = {{ minutes = 10 }}\n"
        )
    }

    #[test]
    fn test_one_invalid_rule_does_not_affect_others() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(format!("{name}.toml")), flatline(name)).unwrap();
        }
        // Frequency rule without its threshold.
        std::fs::write(
            dir.path().join("broken.toml"),
            "name = \"broken\"\nindex = \"x\"\nrun_every = { minutes = 1 }\n\
             [kind]\ntype = \"frequency\"\ntimeframe = { minutes = 1 }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a rule").unwrap();

        let outcome = load(&[dir.path().to_path_buf()], &catalog());
        assert_eq!(outcome.rules.len(), 3);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].rule_name(), Some("broken"));
        assert!(outcome.rules.contains("a"));
    }

    #[test]
    fn test_duplicate_names_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.toml"), flatline("same")).unwrap();
        std::fs::write(dir.path().join("2.toml"), flatline("same")).unwrap();

        let outcome = load(&[dir.path().to_path_buf()], &catalog());
        assert_eq!(outcome.rules.len(), 1);
        assert!(matches!(
            outcome.errors.as_slice(),
            [RuleValidationError::DuplicateName { .. }]
        ));
        // The first file in name order wins.
        assert!(outcome.rules.get("same").unwrap().source.ends_with("1.toml"));
    }

    #[test]
    fn test_syntax_error_and_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "name = ").unwrap();

        let outcome = load(&[bad, dir.path().join("missing.toml")], &catalog());
        assert!(outcome.rules.is_empty());
        assert_eq!(outcome.errors.len(), 2);
        assert!(matches!(outcome.errors[0], RuleValidationError::Parse { .. }));
        assert!(matches!(outcome.errors[1], RuleValidationError::Read { .. }));
    }

    #[test]
    fn test_disabled_rule_is_skipped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let src = format!("enabled = false\n{}", flatline("off"));
        std::fs::write(dir.path().join("off.toml"), src).unwrap();

        let outcome = load(&[dir.path().to_path_buf()], &catalog());
        assert!(outcome.rules.is_empty());
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.disabled, vec!["off".to_string()]);
    }

    #[test]
    fn test_sample_rules_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/rules");
        let catalog = DestinationCatalog {
            known: ["log".to_string(), "ops".to_string()].into_iter().collect(),
            defaults: vec!["ops".to_string()],
        };
        let outcome = load(&[dir], &catalog);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.rules.len(), 4);
        assert!(outcome.rules.get("ingest-stopped").unwrap().use_count_query);
    }
}

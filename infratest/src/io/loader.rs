//! Loads the root module, test files and modules under test from disk.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::module::{ModuleConfig, SuiteConfig};
use crate::core::suite::TestFile;
use crate::core::testfile::FileConfig;

pub const MODULE_FILE: &str = "module.toml";
pub const TEST_FILE_SUFFIX: &str = ".test.toml";

const TEST_FILE_SCHEMA: &str = include_str!("../../schemas/test_file.schema.json");

/// Everything needed to run a suite, plus setup diagnostics (warnings about
/// filters, modules that failed to load).
#[derive(Debug, Clone)]
pub struct LoadedSuite {
    pub config: SuiteConfig,
    pub files: Vec<TestFile>,
    pub diagnostics: Diagnostics,
}

/// Parse `<dir>/module.toml`.
pub fn load_module(dir: &Path) -> Result<ModuleConfig> {
    let path = dir.join(MODULE_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read module {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse module {}", path.display()))
}

/// Parse and schema-check a test file.
pub fn load_test_file(path: &Path) -> Result<FileConfig> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read test file {}", path.display()))?;
    let table: toml::Table =
        toml::from_str(&contents).with_context(|| format!("parse test file {}", path.display()))?;
    let value = serde_json::to_value(table)
        .with_context(|| format!("convert test file {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("invalid test file {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("decode test file {}", path.display()))
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(TEST_FILE_SCHEMA).context("parse test file schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

/// Test files in the working directory and the test directory, as sorted
/// slash-separated paths relative to the working directory.
pub fn discover_test_files(working_dir: &Path, test_dir: &Path) -> Result<Vec<String>> {
    let mut names = BTreeSet::new();
    for dir in [PathBuf::new(), test_dir.to_path_buf()] {
        let abs = working_dir.join(&dir);
        if !abs.is_dir() {
            continue;
        }
        let entries = fs::read_dir(&abs).with_context(|| format!("read dir {}", abs.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir entry in {}", abs.display()))?;
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if !file_name.ends_with(TEST_FILE_SUFFIX) || !entry.path().is_file() {
                continue;
            }
            names.insert(relative_name(&dir.join(&file_name)));
        }
    }
    Ok(names.into_iter().collect())
}

fn relative_name(path: &Path) -> String {
    path.components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Apply `--filter` entries to the discovered files.
pub fn select_files(discovered: &[String], filters: &[String]) -> (Vec<String>, Diagnostics) {
    let mut diags = Diagnostics::new();
    if filters.is_empty() {
        return (discovered.to_vec(), diags);
    }
    let mut selected = BTreeSet::new();
    for filter in filters {
        let normalized = filter.trim_start_matches("./").replace('\\', "/");
        if discovered.contains(&normalized) {
            selected.insert(normalized);
        } else {
            diags.push(Diagnostic::warning(
                "Unknown test file",
                format!("The specified test file, {filter}, could not be found."),
            ));
        }
    }
    if selected.is_empty() {
        diags.push(Diagnostic::warning(
            "No tests were found",
            "--filter is being used but no tests were found. Make sure you're using a relative \
             path to the current working directory.",
        ));
    }
    (selected.into_iter().collect(), diags)
}

/// Load the root module, the selected test files and every module they use.
///
/// A missing root `module.toml` yields an empty root module, so suites that
/// only exercise modules under test still work. Modules under test that fail
/// to load are reported as diagnostics; runs targeting them error at run time.
pub fn load_suite(working_dir: &Path, test_dir: &Path, filters: &[String]) -> Result<LoadedSuite> {
    let root = if working_dir.join(MODULE_FILE).is_file() {
        load_module(working_dir)?
    } else {
        debug!(dir = %working_dir.display(), "no root module; using an empty one");
        ModuleConfig::default()
    };

    let discovered = discover_test_files(working_dir, test_dir)?;
    let (selected, mut diagnostics) = select_files(&discovered, filters);

    let mut config = SuiteConfig {
        root,
        modules: Default::default(),
    };
    let mut files = Vec::new();
    for name in selected {
        let file_config = load_test_file(&working_dir.join(&name))?;
        for source in file_config.runs.iter().filter_map(|run| run.module_source()) {
            if config.modules.contains_key(source) {
                continue;
            }
            match load_module(&working_dir.join(source)) {
                Ok(module) => {
                    config.modules.insert(source.to_string(), module);
                }
                Err(err) => {
                    warn!(source, error = %err, "module under test failed to load");
                    diagnostics.push(Diagnostic::error(
                        "Failed to load module",
                        format!("Module {source} could not be loaded: {err:#}."),
                    ));
                }
            }
        }
        files.push(TestFile::new(name, file_config));
    }
    debug!(files = files.len(), modules = config.modules.len(), "loaded suite");
    Ok(LoadedSuite {
        config,
        files,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn discovers_files_in_root_and_test_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp.path().join("b.test.toml"), "");
        write(&temp.path().join("tests/a.test.toml"), "");
        write(&temp.path().join("tests/notes.toml"), "");
        let names = discover_test_files(temp.path(), Path::new("tests")).expect("discover");
        assert_eq!(names, vec!["b.test.toml", "tests/a.test.toml"]);
    }

    #[test]
    fn filters_warn_on_unknown_and_empty_selection() {
        let discovered = vec!["tests/a.test.toml".to_string()];
        let (selected, diags) = select_files(&discovered, &["./tests/a.test.toml".to_string()]);
        assert_eq!(selected, discovered);
        assert!(diags.is_empty());

        let (selected, diags) = select_files(&discovered, &["missing.test.toml".to_string()]);
        assert!(selected.is_empty());
        assert_eq!(
            diags.summaries(),
            vec!["Unknown test file", "No tests were found"]
        );
    }

    #[test]
    fn schema_rejects_unknown_run_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.test.toml");
        write(&path, "[[run]]\nname = \"x\"\ncomand = \"plan\"\n");
        let err = load_test_file(&path).expect_err("schema");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn load_suite_collects_modules_and_reports_missing_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(
            &root.join(MODULE_FILE),
            "[variables.name]\ndefault = \"x\"\n",
        );
        write(&root.join("modules/child/module.toml"), "");
        write(
            &root.join("tests/main.test.toml"),
            r#"
            [[run]]
            name = "root"

            [[run]]
            name = "child"
            module = { source = "modules/child" }

            [[run]]
            name = "missing"
            module = { source = "modules/missing" }
            "#,
        );
        let loaded = load_suite(root, Path::new("tests"), &[]).expect("load");
        assert!(loaded.config.root.variables.contains_key("name"));
        assert!(loaded.config.modules.contains_key("modules/child"));
        assert!(!loaded.config.modules.contains_key("modules/missing"));
        assert_eq!(loaded.diagnostics.summaries(), vec!["Failed to load module"]);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].runs.len(), 3);
    }
}

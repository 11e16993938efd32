//! Global variable values gathered from the environment, auto-loaded variable
//! files and the command line.
//!
//! Later sources override earlier ones: environment, auto files in the working
//! directory, auto files in the test directory, then `--var`/`--var-file`
//! arguments in the order they were given.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::variables::UnparsedValue;

/// Default variable file loaded from each searched directory.
pub const DEFAULT_VARS_FILE: &str = "infratest.vars.toml";
pub const DEFAULT_VARS_FILE_JSON: &str = "infratest.vars.json";

/// A `--var` or `--var-file` argument, kept in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarArg {
    Literal(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct VariableSources {
    pub working_dir: PathBuf,
    pub test_dir: PathBuf,
    pub env_prefix: String,
    pub args: Vec<VarArg>,
}

pub type GlobalVariables = BTreeMap<String, UnparsedValue>;

#[derive(Debug, Clone, Copy)]
enum FileKind {
    Auto,
    Named,
}

/// Collect global values. `env` is passed in so callers and tests control it.
pub fn collect_global_variables(
    sources: &VariableSources,
    env: impl IntoIterator<Item = (String, String)>,
) -> (GlobalVariables, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut vars = GlobalVariables::new();

    let mut from_env: Vec<(String, String)> = env
        .into_iter()
        .filter_map(|(key, raw)| {
            key.strip_prefix(&sources.env_prefix)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), raw))
        })
        .collect();
    from_env.sort();
    for (name, raw) in from_env {
        vars.insert(
            name.clone(),
            UnparsedValue::Environment {
                name: format!("{}{name}", sources.env_prefix),
                raw,
            },
        );
    }

    diags.extend(add_vars_from_dir(&sources.working_dir, &mut vars));
    let test_dir = sources.working_dir.join(&sources.test_dir);
    if test_dir != sources.working_dir {
        diags.extend(add_vars_from_dir(&test_dir, &mut vars));
    }

    for arg in &sources.args {
        match arg {
            VarArg::Literal(raw) => match parse_var_literal(raw) {
                Ok((name, value)) => {
                    vars.insert(name, UnparsedValue::CliLiteral { raw: value });
                }
                Err(diag) => diags.push(diag),
            },
            VarArg::File(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    sources.working_dir.join(path)
                };
                diags.extend(add_vars_from_file(&path, FileKind::Named, &mut vars));
            }
        }
    }

    debug!(count = vars.len(), "collected global variables");
    (vars, diags)
}

/// Split `name=value`. The value may itself contain `=`.
pub fn parse_var_literal(raw: &str) -> Result<(String, String), Diagnostic> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(Diagnostic::error(
            "Invalid --var option",
            format!(
                "The given --var option {raw:?} is not correctly specified. Must be a variable \
                 name and value separated by an equals sign, like --var=\"key=value\"."
            ),
        ));
    };
    if name.ends_with(' ') {
        return Err(Diagnostic::error(
            "Invalid --var option",
            format!(
                "Variable name {name:?} is invalid due to trailing space. Did you mean \
                 --var=\"{}={}\"?",
                name.trim_end_matches(' '),
                value.trim_start_matches(' ')
            ),
        ));
    }
    Ok((name.to_string(), value.to_string()))
}

fn is_auto_var_file(name: &str) -> bool {
    name.ends_with(".auto.vars.toml") || name.ends_with(".auto.vars.json")
}

fn add_vars_from_dir(dir: &Path, vars: &mut GlobalVariables) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for default in [DEFAULT_VARS_FILE, DEFAULT_VARS_FILE_JSON] {
        let path = dir.join(default);
        if path.is_file() {
            diags.extend(add_vars_from_file(&path, FileKind::Auto, vars));
        }
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return diags;
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_auto_var_file(name))
        .collect();
    names.sort();
    for name in names {
        diags.extend(add_vars_from_file(&dir.join(name), FileKind::Auto, vars));
    }
    diags
}

fn add_vars_from_file(path: &Path, kind: FileKind, vars: &mut GlobalVariables) -> Diagnostics {
    let mut diags = Diagnostics::new();
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            diags.push(Diagnostic::error(
                "Failed to read variables file",
                format!("Given variables file {} does not exist.", path.display()),
            ));
            return diags;
        }
        Err(err) => {
            diags.push(Diagnostic::error(
                "Failed to read variables file",
                format!("Error while reading {}: {err}.", path.display()),
            ));
            return diags;
        }
    };

    let parsed: Result<Value, String> = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&contents).map_err(|err| err.to_string())
    } else {
        toml::from_str::<toml::Table>(&contents)
            .map_err(|err| err.to_string())
            .and_then(|table| serde_json::to_value(table).map_err(|err| err.to_string()))
    };
    let table = match parsed {
        Ok(Value::Object(table)) => table,
        Ok(_) => {
            diags.push(Diagnostic::error(
                "Invalid variables file",
                format!("{} must contain a table of variable values.", path.display()),
            ));
            return diags;
        }
        Err(err) => {
            diags.push(Diagnostic::error(
                "Invalid variables file",
                format!("Could not parse {}: {err}", path.display()),
            ));
            return diags;
        }
    };

    if let Some(Value::Object(declared)) = table.get("variable") {
        for name in declared.keys() {
            diags.push(Diagnostic::error(
                "Variable declaration in variables file",
                format!(
                    "A variables file is used to assign values to variables that have already \
                     been declared in module.toml, not to declare new variables. To declare \
                     variable {name:?}, add it to the module's variables table.\n\nTo set a \
                     value for this variable in {}, use the definition syntax instead:\n    \
                     {name} = <value>",
                    path.display()
                ),
            ));
        }
        if diags.has_errors() {
            return diags;
        }
    }

    for (name, value) in table {
        let path = path.to_path_buf();
        let unparsed = match kind {
            FileKind::Auto => UnparsedValue::AutoFile { path, value },
            FileKind::Named => UnparsedValue::NamedFile { path, value },
        };
        vars.insert(name, unparsed);
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sources(dir: &Path, args: Vec<VarArg>) -> VariableSources {
        VariableSources {
            working_dir: dir.to_path_buf(),
            test_dir: PathBuf::from("tests"),
            env_prefix: "INFRATEST_VAR_".to_string(),
            args,
        }
    }

    fn file_value(vars: &GlobalVariables, name: &str) -> Value {
        match &vars[name] {
            UnparsedValue::AutoFile { value, .. } | UnparsedValue::NamedFile { value, .. } => {
                value.clone()
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("tests")).expect("mkdir");
        fs::write(root.join(DEFAULT_VARS_FILE), "a = \"root\"\nb = \"root\"\nc = \"root\"\n")
            .expect("write");
        fs::write(root.join("tests").join("x.auto.vars.json"), r#"{"b": "tests"}"#)
            .expect("write");
        fs::write(root.join("named.vars.toml"), "c = \"named\"\n").expect("write");

        let env = vec![
            ("INFRATEST_VAR_a".to_string(), "env".to_string()),
            ("INFRATEST_VAR_env_only".to_string(), "env".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let (vars, diags) = collect_global_variables(
            &sources(
                root,
                vec![
                    VarArg::File(PathBuf::from("named.vars.toml")),
                    VarArg::Literal("d=cli".to_string()),
                ],
            ),
            env,
        );
        assert!(diags.is_empty(), "{diags:?}");
        assert_eq!(file_value(&vars, "a"), json!("root"));
        assert_eq!(file_value(&vars, "b"), json!("tests"));
        assert_eq!(file_value(&vars, "c"), json!("named"));
        assert_eq!(
            vars["d"],
            UnparsedValue::CliLiteral {
                raw: "cli".to_string()
            }
        );
        assert!(matches!(vars["env_only"], UnparsedValue::Environment { .. }));
        assert!(!vars.contains_key("UNRELATED"));
    }

    #[test]
    fn command_line_order_decides_between_var_and_var_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("v.vars.toml"), "name = \"file\"\n").expect("write");
        let (vars, _) = collect_global_variables(
            &sources(
                temp.path(),
                vec![
                    VarArg::Literal("name=literal".to_string()),
                    VarArg::File(PathBuf::from("v.vars.toml")),
                ],
            ),
            Vec::new(),
        );
        assert_eq!(file_value(&vars, "name"), json!("file"));
    }

    #[test]
    fn malformed_var_arguments_are_errors() {
        let err = parse_var_literal("novalue").expect_err("missing equals");
        assert_eq!(err.summary, "Invalid --var option");
        let err = parse_var_literal("name =value").expect_err("trailing space");
        assert!(err.detail.contains("trailing space"));
        assert_eq!(
            parse_var_literal("query=a=b").expect("split once"),
            ("query".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn missing_named_file_and_declarations_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("decl.vars.toml"),
            "[variable.region]\ndefault = \"x\"\n",
        )
        .expect("write");
        let (_, diags) = collect_global_variables(
            &sources(
                temp.path(),
                vec![
                    VarArg::File(PathBuf::from("absent.vars.toml")),
                    VarArg::File(PathBuf::from("decl.vars.toml")),
                ],
            ),
            Vec::new(),
        );
        assert_eq!(
            diags.summaries(),
            vec![
                "Failed to read variables file",
                "Variable declaration in variables file"
            ]
        );
    }
}

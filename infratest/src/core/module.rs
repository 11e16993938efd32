//! Module configuration: the infrastructure definition a run block plans and applies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::expr::Expr;

/// Provider arguments by attribute name.
pub type ProviderConfig = BTreeMap<String, Expr>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleConfig {
    pub variables: BTreeMap<String, VariableDecl>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub resources: Vec<ResourceConfig>,
    pub data: Vec<ResourceConfig>,
    pub outputs: BTreeMap<String, OutputConfig>,
    pub checks: Vec<CheckBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    Any,
    String,
    Number,
    Bool,
    List,
    Map,
}

/// How a raw string from the environment or the command line is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsingMode {
    /// Take the raw text verbatim as a string.
    Literal,
    /// Parse the raw text as a JSON value.
    Expression,
}

impl VariableType {
    pub fn parsing_mode(self) -> ParsingMode {
        match self {
            VariableType::String | VariableType::Any => ParsingMode::Literal,
            _ => ParsingMode::Expression,
        }
    }

    /// Convert `value` to this type, returning a description on mismatch.
    pub fn convert(self, value: Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (VariableType::Any, value) => Ok(value),
            (VariableType::String, Value::String(s)) => Ok(Value::String(s)),
            (VariableType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (VariableType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (VariableType::Number, Value::Number(n)) => Ok(Value::Number(n)),
            (VariableType::Number, Value::String(s)) => match serde_json::from_str(s.trim()) {
                Ok(Value::Number(n)) => Ok(Value::Number(n)),
                _ => Err(format!("a number is required, got string {s:?}")),
            },
            (VariableType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (VariableType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("a bool is required, got string {s:?}")),
            },
            (VariableType::List, Value::Array(items)) => Ok(Value::Array(items)),
            (VariableType::Map, Value::Object(map)) => Ok(Value::Object(map)),
            (ty, other) => Err(format!(
                "a {} is required, got {}",
                ty.as_str(),
                kind_of(&other)
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VariableType::Any => "any",
            VariableType::String => "string",
            VariableType::Number => "number",
            VariableType::Bool => "bool",
            VariableType::List => "list",
            VariableType::Map => "map",
        }
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// A boolean condition with the message reported when it does not hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub condition: Expr,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VariableDecl {
    #[serde(rename = "type")]
    pub ty: VariableType,
    pub default: Option<Value>,
    pub validation: Vec<Rule>,
    /// Declarations injected for assertion evaluation only.
    #[serde(skip)]
    pub synthetic: bool,
}

impl VariableDecl {
    pub fn required(&self) -> bool {
        self.default.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub ty: String,
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Expr>,
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Simulated provider failure while creating or updating the instance.
    #[serde(default)]
    pub fail_on_apply: bool,
}

impl ResourceConfig {
    pub fn address(&self) -> String {
        format!("{}.{}", self.ty, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckBlock {
    pub name: String,
    pub condition: Expr,
    pub error_message: String,
}

/// The root module plus every module-under-test referenced by the suite,
/// keyed by source path.
#[derive(Debug, Clone, Default)]
pub struct SuiteConfig {
    pub root: ModuleConfig,
    pub modules: BTreeMap<String, ModuleConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_module_toml() {
        let module: ModuleConfig = toml::from_str(
            r#"
            [variables.name]
            type = "string"
            default = "alpha"

            [variables.count]
            type = "number"

            [[variables.count.validation]]
            condition = { call = "gt", args = [{ ref = "var.count" }, 0] }
            error_message = "count must be positive"

            [providers.sim]
            region = "eu-west-1"

            [[resources]]
            type = "sim_bucket"
            name = "main"
            attributes = { name = { ref = "var.name" } }

            [outputs.bucket_name]
            value = { ref = "resource.sim_bucket.main.name" }
            "#,
        )
        .expect("parse module");

        assert_eq!(module.variables["name"].ty, VariableType::String);
        assert!(!module.variables["name"].required());
        assert!(module.variables["count"].required());
        assert_eq!(module.variables["count"].validation.len(), 1);
        assert_eq!(module.resources[0].address(), "sim_bucket.main");
        assert!(module.providers.contains_key("sim"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = toml::from_str::<ModuleConfig>("[[resources]]\ntype = \"a\"\nname = \"b\"\ncolor = 1\n")
            .expect_err("unknown field");
        assert!(err.to_string().contains("color"));
    }

    #[test]
    fn converts_values_to_declared_types() {
        assert_eq!(
            VariableType::Number.convert(json!("3")).expect("number"),
            json!(3)
        );
        assert_eq!(
            VariableType::String.convert(json!(3)).expect("string"),
            json!("3")
        );
        assert_eq!(
            VariableType::Bool.convert(json!("true")).expect("bool"),
            json!(true)
        );
        assert!(VariableType::List.convert(json!("x")).is_err());
        assert_eq!(VariableType::Map.convert(Value::Null).expect("null"), Value::Null);
    }

    #[test]
    fn string_types_parse_literally() {
        assert_eq!(VariableType::String.parsing_mode(), ParsingMode::Literal);
        assert_eq!(VariableType::Any.parsing_mode(), ParsingMode::Literal);
        assert_eq!(VariableType::List.parsing_mode(), ParsingMode::Expression);
    }
}

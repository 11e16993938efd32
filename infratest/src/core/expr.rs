//! Structured expressions and their evaluation context.
//!
//! Expressions are never parsed from text. A TOML or JSON value is either a
//! reference (`{ ref = "run.setup.bucket_name" }`), a function call
//! (`{ call = "upper", args = [..] }`) or a literal value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::functions;

pub const NS_RUN: &str = "run";
pub const NS_VAR: &str = "var";
pub const NS_PROVIDER: &str = "provider";
pub const NS_RESOURCE: &str = "resource";
pub const NS_DATA: &str = "data";
pub const NS_OUTPUT: &str = "output";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    #[serde(rename = "ref")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Call {
    #[serde(rename = "call")]
    pub function: String,
    #[serde(default)]
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expr {
    Ref(Reference),
    Call(Call),
    Literal(Value),
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn reference(path: impl Into<String>) -> Self {
        Expr::Ref(Reference { path: path.into() })
    }

    pub fn call(function: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(Call {
            function: function.into(),
            args,
        })
    }

    /// Reference paths used anywhere inside this expression.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Ref(reference) => out.push(reference.path.as_str()),
            Expr::Call(call) => {
                for arg in &call.args {
                    arg.collect_references(out);
                }
            }
            Expr::Literal(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("reference to undeclared namespace `{0}`")]
    UnknownNamespace(String),
    #[error("`{path}` has no attribute `{attribute}`")]
    UnsupportedAttribute { path: String, attribute: String },
    #[error("`{path}` cannot be indexed with `{index}`")]
    InvalidIndex { path: String, index: String },
    #[error("attempt to read `{attribute}` from null value `{path}`")]
    NullAccess { path: String, attribute: String },
    #[error("call to unknown function `{0}`")]
    UnknownFunction(String),
    #[error("invalid arguments for `{function}`: {message}")]
    InvalidArguments { function: String, message: String },
    #[error("reference `{0}` is not a valid path")]
    InvalidReference(String),
}

/// Values visible to expressions, grouped by top-level namespace.
#[derive(Debug, Clone)]
pub struct EvalContext {
    namespaces: BTreeMap<String, Value>,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalContext {
    pub fn new() -> Self {
        Self {
            namespaces: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, name: &str, value: Value) -> Self {
        self.set_namespace(name, value);
        self
    }

    pub fn set_namespace(&mut self, name: &str, value: Value) {
        self.namespaces.insert(name.to_string(), value);
    }

    pub fn namespace(&self, name: &str) -> Option<&Value> {
        self.namespaces.get(name)
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ref(reference) => self.resolve(&reference.path),
            Expr::Call(call) => {
                let args = call
                    .args
                    .iter()
                    .map(|arg| self.evaluate(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                functions::call(&call.function, &args)
            }
        }
    }

    /// Resolve a dotted reference path.
    ///
    /// `run.<name>` for a run that has not produced outputs yet resolves to
    /// null: runs are ordered by declaration only.
    pub fn resolve(&self, path: &str) -> Result<Value, ExprError> {
        let mut segments = path.split('.');
        let namespace = match segments.next() {
            Some(ns) if !ns.is_empty() => ns,
            _ => return Err(ExprError::InvalidReference(path.to_string())),
        };
        let mut current = self
            .namespaces
            .get(namespace)
            .ok_or_else(|| ExprError::UnknownNamespace(namespace.to_string()))?;
        let mut walked = namespace.to_string();

        for (depth, segment) in segments.enumerate() {
            if segment.is_empty() {
                return Err(ExprError::InvalidReference(path.to_string()));
            }
            current = match current {
                Value::Object(map) => match map.get(segment) {
                    Some(next) => next,
                    None if namespace == NS_RUN && depth == 0 => return Ok(Value::Null),
                    None => {
                        return Err(ExprError::UnsupportedAttribute {
                            path: walked,
                            attribute: segment.to_string(),
                        });
                    }
                },
                Value::Array(items) => {
                    let item = segment.parse::<usize>().ok().and_then(|idx| items.get(idx));
                    match item {
                        Some(next) => next,
                        None => {
                            return Err(ExprError::InvalidIndex {
                                path: walked,
                                index: segment.to_string(),
                            });
                        }
                    }
                }
                Value::Null => {
                    return Err(ExprError::NullAccess {
                        path: walked,
                        attribute: segment.to_string(),
                    });
                }
                _ => {
                    return Err(ExprError::UnsupportedAttribute {
                        path: walked,
                        attribute: segment.to_string(),
                    });
                }
            };
            walked.push('.');
            walked.push_str(segment);
        }
        Ok(current.clone())
    }
}

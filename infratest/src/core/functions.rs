//! The standard function set available to test and module expressions.

use serde_json::{Number, Value};

use crate::core::expr::ExprError;

pub const FUNCTION_NAMES: &[&str] = &[
    "add", "and", "coalesce", "concat", "contains", "eq", "format", "gt", "gte", "join", "keys",
    "length", "lookup", "lower", "lt", "lte", "ne", "not", "or", "sub", "tonumber", "tostring",
    "upper",
];

pub fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    let invalid = |message: &str| ExprError::InvalidArguments {
        function: name.to_string(),
        message: message.to_string(),
    };

    match name {
        "upper" => Ok(Value::String(single_string(name, args)?.to_uppercase())),
        "lower" => Ok(Value::String(single_string(name, args)?.to_lowercase())),
        "concat" => {
            let mut out = Vec::new();
            for arg in args {
                match arg {
                    Value::Array(items) => out.extend(items.iter().cloned()),
                    _ => return Err(invalid("every argument must be a list")),
                }
            }
            Ok(Value::Array(out))
        }
        "join" => {
            let [separator, list] = args else {
                return Err(invalid("expected a separator and a list"));
            };
            let (Value::String(separator), Value::Array(items)) = (separator, list) else {
                return Err(invalid("expected a separator and a list"));
            };
            let parts = items
                .iter()
                .map(|item| to_display(item).ok_or_else(|| invalid("list elements must be primitive")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::String(parts.join(separator)))
        }
        "length" => {
            let [value] = args else {
                return Err(invalid("expected exactly one argument"));
            };
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => return Err(invalid("argument must be a string, list or map")),
            };
            Ok(Value::from(len))
        }
        "tostring" => {
            let [value] = args else {
                return Err(invalid("expected exactly one argument"));
            };
            if value.is_null() {
                return Ok(Value::Null);
            }
            to_display(value)
                .map(Value::String)
                .ok_or_else(|| invalid("argument must be a primitive value"))
        }
        "tonumber" => {
            let [value] = args else {
                return Err(invalid("expected exactly one argument"));
            };
            match value {
                Value::Null => Ok(Value::Null),
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(number)
                    .ok_or_else(|| invalid("string is not a number")),
                _ => Err(invalid("argument must be a number or string")),
            }
        }
        "coalesce" => Ok(args
            .iter()
            .find(|value| !value.is_null() && value.as_str() != Some(""))
            .cloned()
            .unwrap_or(Value::Null)),
        "contains" => {
            let [Value::Array(items), needle] = args else {
                return Err(invalid("expected a list and a value"));
            };
            Ok(Value::Bool(items.contains(needle)))
        }
        "keys" => {
            let [Value::Object(map)] = args else {
                return Err(invalid("expected a single map"));
            };
            Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }
        "lookup" => {
            let (map, key, default) = match args {
                [Value::Object(map), Value::String(key)] => (map, key, None),
                [Value::Object(map), Value::String(key), default] => (map, key, Some(default)),
                _ => return Err(invalid("expected a map, a key and an optional default")),
            };
            match (map.get(key), default) {
                (Some(value), _) => Ok(value.clone()),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(invalid(&format!("key `{key}` not found and no default given"))),
            }
        }
        "format" => {
            let Some((Value::String(template), rest)) = args.split_first() else {
                return Err(invalid("first argument must be a format string"));
            };
            format_template(template, rest).map(Value::String).map_err(|msg| invalid(&msg))
        }
        "not" => {
            let [Value::Bool(value)] = args else {
                return Err(invalid("expected a single bool"));
            };
            Ok(Value::Bool(!value))
        }
        "and" | "or" => {
            let bools = args
                .iter()
                .map(|arg| arg.as_bool().ok_or_else(|| invalid("arguments must be bools")))
                .collect::<Result<Vec<_>, _>>()?;
            if bools.is_empty() {
                return Err(invalid("expected at least one argument"));
            }
            let result = if name == "and" {
                bools.iter().all(|b| *b)
            } else {
                bools.iter().any(|b| *b)
            };
            Ok(Value::Bool(result))
        }
        "eq" | "ne" => {
            let [left, right] = args else {
                return Err(invalid("expected exactly two arguments"));
            };
            let equal = values_equal(left, right);
            Ok(Value::Bool(if name == "eq" { equal } else { !equal }))
        }
        "lt" | "lte" | "gt" | "gte" => {
            let (left, right) = two_numbers(name, args)?;
            let result = match name {
                "lt" => left < right,
                "lte" => left <= right,
                "gt" => left > right,
                _ => left >= right,
            };
            Ok(Value::Bool(result))
        }
        "add" | "sub" => {
            let (left, right) = two_numbers(name, args)?;
            let result = if name == "add" { left + right } else { left - right };
            number(result).ok_or_else(|| invalid("result is not a finite number"))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// Numbers with an integral value are kept as integers so `1 + 1` renders as `2`.
fn number(value: f64) -> Option<Value> {
    if !value.is_finite() {
        return None;
    }
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        return Some(Value::from(value as i64));
    }
    Number::from_f64(value).map(Value::Number)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn two_numbers(name: &str, args: &[Value]) -> Result<(f64, f64), ExprError> {
    match args {
        [left, right] => match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => Ok((l, r)),
            _ => Err(ExprError::InvalidArguments {
                function: name.to_string(),
                message: "arguments must be numbers".to_string(),
            }),
        },
        _ => Err(ExprError::InvalidArguments {
            function: name.to_string(),
            message: "expected exactly two arguments".to_string(),
        }),
    }
}

fn single_string<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, ExprError> {
    match args {
        [Value::String(value)] => Ok(value),
        _ => Err(ExprError::InvalidArguments {
            function: name.to_string(),
            message: "expected a single string".to_string(),
        }),
    }
}

fn to_display(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Substitute `%s`/`%d`/`%v` verbs in order; `%%` is a literal percent sign.
fn format_template(template: &str, args: &[Value]) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('s' | 'd' | 'v') => {
                let arg = args
                    .next()
                    .ok_or_else(|| "not enough arguments for format string".to_string())?;
                match to_display(arg) {
                    Some(text) => out.push_str(&text),
                    None => out.push_str(&arg.to_string()),
                }
            }
            Some(other) => return Err(format!("unsupported format verb `%{other}`")),
            None => return Err("format string ends with `%`".to_string()),
        }
    }
    if args.next().is_some() {
        return Err("too many arguments for format string".to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(name: &str, args: Vec<Value>) -> Value {
        call(name, &args).unwrap_or_else(|err| panic!("{name} failed: {err}"))
    }

    #[test]
    fn string_functions() {
        assert_eq!(eval("upper", vec![json!("abc")]), json!("ABC"));
        assert_eq!(eval("lower", vec![json!("AbC")]), json!("abc"));
        assert_eq!(eval("length", vec![json!("héllo")]), json!(5));
        assert_eq!(eval("tostring", vec![json!(42)]), json!("42"));
        assert_eq!(
            eval("format", vec![json!("%s-%d (100%%)"), json!("web"), json!(3)]),
            json!("web-3 (100%)")
        );
    }

    #[test]
    fn collection_functions() {
        assert_eq!(
            eval("concat", vec![json!([1]), json!([2, 3])]),
            json!([1, 2, 3])
        );
        assert_eq!(eval("keys", vec![json!({"b": 1, "a": 2})]), json!(["a", "b"]));
        assert_eq!(eval("contains", vec![json!(["x", "y"]), json!("y")]), json!(true));
        assert_eq!(
            eval("lookup", vec![json!({"a": 1}), json!("b"), json!(0)]),
            json!(0)
        );
        assert_eq!(eval("coalesce", vec![json!(null), json!(""), json!("z")]), json!("z"));
    }

    #[test]
    fn numeric_and_logic_functions() {
        assert_eq!(eval("add", vec![json!(1), json!(2)]), json!(3));
        assert_eq!(eval("sub", vec![json!(1.5), json!(1)]), json!(0.5));
        assert_eq!(eval("tonumber", vec![json!("12")]), json!(12));
        assert_eq!(eval("gte", vec![json!(3), json!(3)]), json!(true));
        assert_eq!(eval("eq", vec![json!(1), json!(1.0)]), json!(true));
        assert_eq!(eval("ne", vec![json!("a"), json!("b")]), json!(true));
        assert_eq!(eval("and", vec![json!(true), json!(false)]), json!(false));
        assert_eq!(eval("or", vec![json!(false), json!(true)]), json!(true));
        assert_eq!(eval("not", vec![json!(false)]), json!(true));
    }

    #[test]
    fn rejects_bad_arguments_and_unknown_functions() {
        assert!(matches!(
            call("upper", &[json!(1)]),
            Err(ExprError::InvalidArguments { .. })
        ));
        assert!(matches!(
            call("lookup", &[json!({}), json!("missing")]),
            Err(ExprError::InvalidArguments { .. })
        ));
        assert!(matches!(
            call("format", &[json!("%s %s"), json!("one")]),
            Err(ExprError::InvalidArguments { .. })
        ));
        assert_eq!(
            call("nope", &[]),
            Err(ExprError::UnknownFunction("nope".to_string()))
        );
    }

    #[test]
    fn every_listed_function_is_dispatched() {
        for name in FUNCTION_NAMES {
            let result = call(name, &[]);
            assert!(
                !matches!(result, Err(ExprError::UnknownFunction(_))),
                "{name} is listed but not implemented"
            );
        }
    }
}

// Expression evaluation against a host's execution context

use std::cmp::Ordering;

use crate::executor::ExecutionContext;
use crate::output::errors::ConvergeError;
use crate::parser::ast::{BinaryOperator, Expression, StringPart, UnaryOperator, Value};

/// Evaluate an expression in a given context
///
/// Plain variables resolve against locals, host facts and phase variables.
/// Fact references resolve against the sealed run fact store; a miss is an
/// `UnresolvedReference` error, never an empty value.
pub fn evaluate_expression(expr: &Expression, ctx: &ExecutionContext) -> Result<Value, ConvergeError> {
    match expr {
        Expression::String(s) => Ok(Value::String(s.clone())),
        Expression::Integer(i) => Ok(Value::Int(*i)),
        Expression::Float(f) => Ok(Value::Float(*f)),
        Expression::Boolean(b) => Ok(Value::Bool(*b)),
        Expression::Null => Ok(Value::Null),

        Expression::Variable(path) => ctx.get_nested_var(path).ok_or_else(|| undefined(path)),

        Expression::FactRef(reference) => Ok(ctx.run_facts().resolve(reference)?),

        Expression::InterpolatedString(parts) => {
            let mut result = String::new();
            for part in parts {
                match part {
                    StringPart::Literal(s) => result.push_str(s),
                    StringPart::Expression(e) => {
                        let val = evaluate_expression(e, ctx)?;
                        result.push_str(&val.to_string());
                    }
                }
            }
            Ok(Value::String(result))
        }

        // Short-circuit so `x != null and x.y` never evaluates the right side
        Expression::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            if !evaluate_expression(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate_expression(right, ctx)?.is_truthy()))
        }
        Expression::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            if evaluate_expression(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate_expression(right, ctx)?.is_truthy()))
        }
        Expression::BinaryOp { left, op, right } => {
            let left_val = evaluate_expression(left, ctx)?;
            let right_val = evaluate_expression(right, ctx)?;
            evaluate_binary_op(&left_val, *op, &right_val)
        }

        Expression::UnaryOp { op, operand } => {
            let val = evaluate_expression(operand, ctx)?;
            evaluate_unary_op(*op, &val)
        }

        Expression::Index { object, index } => {
            let obj_val = evaluate_expression(object, ctx)?;
            let idx_val = evaluate_expression(index, ctx)?;
            index_value(&obj_val, &idx_val)
        }

        Expression::List(items) => {
            let values: Result<Vec<_>, _> =
                items.iter().map(|i| evaluate_expression(i, ctx)).collect();
            Ok(Value::List(values?))
        }
    }
}

/// Evaluate a guard or predicate to a boolean
pub fn evaluate_condition(expr: &Expression, ctx: &ExecutionContext) -> Result<bool, ConvergeError> {
    Ok(evaluate_expression(expr, ctx)?.is_truthy())
}

/// Evaluate an expression and render it as a string parameter
pub fn evaluate_string(expr: &Expression, ctx: &ExecutionContext) -> Result<String, ConvergeError> {
    match evaluate_expression(expr, ctx)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

pub fn evaluate_optional_string(
    expr: Option<&Expression>,
    ctx: &ExecutionContext,
) -> Result<Option<String>, ConvergeError> {
    expr.map(|e| evaluate_string(e, ctx)).transpose()
}

fn undefined(path: &[String]) -> ConvergeError {
    ConvergeError::Runtime {
        message: format!("Undefined variable '{}'", path.join(".")),
        suggestion: Some(
            "Define it in vars, register it in an earlier task, or use facts.<key> for values published by an earlier phase"
                .to_string(),
        ),
    }
}

fn index_value(obj: &Value, idx: &Value) -> Result<Value, ConvergeError> {
    let out_of_bounds = |i: i64, len: usize| ConvergeError::Runtime {
        message: format!("Index {} out of bounds for length {}", i, len),
        suggestion: None,
    };

    match (obj, idx) {
        (Value::List(list), Value::Int(i)) => {
            let pos = if *i < 0 { list.len() as i64 + i } else { *i };
            usize::try_from(pos)
                .ok()
                .and_then(|p| list.get(p))
                .cloned()
                .ok_or_else(|| out_of_bounds(*i, list.len()))
        }
        (Value::Dict(map), Value::String(key)) => {
            map.get(key).cloned().ok_or_else(|| ConvergeError::Runtime {
                message: format!("Key '{}' not found", key),
                suggestion: {
                    let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
                    keys.sort();
                    Some(format!("Available keys: {}", keys.join(", ")))
                },
            })
        }
        (Value::String(s), Value::Int(i)) => {
            let count = s.chars().count();
            let pos = if *i < 0 { count as i64 + i } else { *i };
            usize::try_from(pos)
                .ok()
                .and_then(|p| s.chars().nth(p))
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| out_of_bounds(*i, count))
        }
        _ => Err(ConvergeError::Runtime {
            message: format!("Cannot index {} with {}", type_name(obj), type_name(idx)),
            suggestion: None,
        }),
    }
}

fn evaluate_binary_op(left: &Value, op: BinaryOperator, right: &Value) -> Result<Value, ConvergeError> {
    match op {
        BinaryOperator::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| overflow("+", left, right)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut result = a.clone();
                result.extend(b.iter().cloned());
                Ok(Value::List(result))
            }
            _ => Err(type_error("add", left, right)),
        },
        BinaryOperator::Sub => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_sub(*b)
                .map(Value::Int)
                .ok_or_else(|| overflow("-", left, right)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 - b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - *b as f64)),
            _ => Err(type_error("subtract", left, right)),
        },

        BinaryOperator::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOperator::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOperator::Lt => compare_values(left, right, |ord| ord == Ordering::Less),
        BinaryOperator::Le => compare_values(left, right, |ord| ord != Ordering::Greater),
        BinaryOperator::Gt => compare_values(left, right, |ord| ord == Ordering::Greater),
        BinaryOperator::Ge => compare_values(left, right, |ord| ord != Ordering::Less),

        BinaryOperator::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOperator::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),

        BinaryOperator::In => Ok(Value::Bool(contains(right, left))),
        BinaryOperator::NotIn => Ok(Value::Bool(!contains(right, left))),
    }
}

fn overflow(op: &str, left: &Value, right: &Value) -> ConvergeError {
    ConvergeError::Runtime {
        message: format!("Integer overflow in {} {} {}", left, op, right),
        suggestion: None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::List(list), _) => list.iter().any(|v| values_equal(needle, v)),
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Dict(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn evaluate_unary_op(op: UnaryOperator, val: &Value) -> Result<Value, ConvergeError> {
    match op {
        UnaryOperator::Not => Ok(Value::Bool(!val.is_truthy())),
        UnaryOperator::Neg => match val {
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| ConvergeError::Runtime {
                    message: format!("Integer overflow negating {}", i),
                    suggestion: None,
                }),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(ConvergeError::Runtime {
                message: format!("Cannot negate {}", type_name(val)),
                suggestion: None,
            }),
        },
    }
}

/// Equality with int/float coercion and numeric strings compared as numbers
/// against numbers, since command output arrives as text
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => (a - b).abs() < f64::EPSILON,
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
            (*a as f64 - b).abs() < f64::EPSILON
        }
        (Value::String(s), Value::Int(n)) | (Value::Int(n), Value::String(s)) => {
            s.trim().parse::<i64>().map(|v| v == *n).unwrap_or(false)
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, av)| b.get(k).map(|bv| values_equal(av, bv)).unwrap_or(false))
        }
        _ => false,
    }
}

fn compare_values<F>(left: &Value, right: &Value, f: F) -> Result<Value, ConvergeError>
where
    F: Fn(Ordering) -> bool,
{
    let as_number = |v: &Value| match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    let ord = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => return Err(type_error("compare", left, right)),
        },
    };

    Ok(Value::Bool(f(ord)))
}

fn type_error(op: &str, left: &Value, right: &Value) -> ConvergeError {
    ConvergeError::Runtime {
        message: format!("Cannot {} {} and {}", op, type_name(left), type_name(right)),
        suggestion: None,
    }
}

pub fn type_name(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::List(_) => "list",
        Value::Dict(_) => "dict",
    }
}

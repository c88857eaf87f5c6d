use std::collections::BTreeMap;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};
use super::value::Value;

/// Runtime variable bindings for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Scope {
        Scope::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// Evaluates an expression against a scope.
///
/// Pure tree walk: no I/O, no allocation beyond the produced values, no
/// state carried between invocations. Errors are strings and get wrapped
/// with the expression source by [`super::Program::eval`].
pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value, String> {
    match expr {
        Expr::Literal(literal) => Ok(match literal {
            Literal::Int(value) => Value::Int(*value),
            Literal::Float(value) => Value::Float(*value),
            Literal::Str(value) => Value::Str(value.clone()),
            Literal::Bool(value) => Value::Bool(*value),
            Literal::Null => Value::Null,
        }),

        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| format!("variable `{name}` is not bound")),

        Expr::Field(base, field) => match eval(base, scope)? {
            Value::Map(fields) => Ok(fields.get(field).cloned().unwrap_or(Value::Null)),
            Value::Json(serde_json::Value::Object(object)) => Ok(match object.get(field) {
                None | Some(serde_json::Value::Null) => Value::Null,
                Some(value) => Value::Json(value.clone()),
            }),
            Value::Null => Err(format!("cannot access field `{field}` on null")),
            other => Err(format!(
                "cannot access field `{field}` on {}",
                other.type_name()
            )),
        },

        Expr::Unary(op, operand) => {
            let operand = eval(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!as_bool(&operand)?)),
                UnaryOp::Neg => match as_number(&operand)? {
                    Number::Int(value) => value
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| "integer overflow in negation".to_string()),
                    Number::Float(value) => Ok(Value::Float(-value)),
                },
            }
        }

        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !as_bool(&eval(lhs, scope)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, scope)?)?))
        }

        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if as_bool(&eval(lhs, scope)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, scope)?)?))
        }

        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            eval_binary(*op, lhs, rhs)
        }

        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if as_bool(&eval(cond, scope)?)? {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
    }
}

enum Number {
    Int(i64),
    Float(f64),
}

fn as_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(value) => Ok(*value),
        Value::Json(serde_json::Value::Bool(value)) => Ok(*value),
        other => Err(format!("expected a bool, got {}", other.type_name())),
    }
}

fn as_number(value: &Value) -> Result<Number, String> {
    match value {
        Value::Int(value) => Ok(Number::Int(*value)),
        Value::Float(value) => Ok(Number::Float(*value)),
        Value::Json(serde_json::Value::Number(number)) => {
            if let Some(value) = number.as_i64() {
                Ok(Number::Int(value))
            } else if let Some(value) = number.as_f64() {
                Ok(Number::Float(value))
            } else {
                Err("unrepresentable number".to_string())
            }
        }
        other => Err(format!("expected a number, got {}", other.type_name())),
    }
}

fn as_str(value: &Value) -> Option<&str> {
    match value {
        Value::Str(value) => Some(value),
        Value::Json(serde_json::Value::String(value)) => Some(value),
        _ => None,
    }
}

fn eval_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),

        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }

        BinaryOp::Add => {
            if let (Some(a), Some(b)) = (as_str(&lhs), as_str(&rhs)) {
                return Ok(Value::Str(format!("{a}{b}")));
            }
            arithmetic(op, &lhs, &rhs)
        }

        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, &lhs, &rhs)
        }

        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit ops handled in eval"),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if lhs.is_null() || rhs.is_null() {
        return lhs.is_null() && rhs.is_null();
    }

    match (lhs, rhs) {
        (Value::Json(a), Value::Json(b)) => a == b,
        (Value::Json(_), _) | (_, Value::Json(_)) => {
            match (as_number(lhs), as_number(rhs)) {
                (Ok(a), Ok(b)) => number_to_f64(&a) == number_to_f64(&b),
                _ => match (as_str(lhs), as_str(rhs)) {
                    (Some(a), Some(b)) => a == b,
                    _ => match (as_bool(lhs), as_bool(rhs)) {
                        (Ok(a), Ok(b)) => a == b,
                        _ => false,
                    },
                },
            }
        }
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
            (*a as f64) == *b
        }
        _ => lhs == rhs,
    }
}

fn number_to_f64(number: &Number) -> f64 {
    match number {
        Number::Int(value) => *value as f64,
        Number::Float(value) => *value,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, String> {
    if let (Some(a), Some(b)) = (as_str(lhs), as_str(rhs)) {
        return Ok(a.cmp(b));
    }

    match (as_number(lhs), as_number(rhs)) {
        (Ok(Number::Int(a)), Ok(Number::Int(b))) => Ok(a.cmp(&b)),
        (Ok(a), Ok(b)) => number_to_f64(&a)
            .partial_cmp(&number_to_f64(&b))
            .ok_or_else(|| "cannot order NaN".to_string()),
        _ => Err(format!(
            "cannot order {} and {}",
            lhs.type_name(),
            rhs.type_name()
        )),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, String> {
    let lhs = as_number(lhs)?;
    let rhs = as_number(rhs)?;

    if let (Number::Int(a), Number::Int(b)) = (&lhs, &rhs) {
        let (a, b) = (*a, *b);
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return Err("division by zero".to_string());
                }
                a.checked_div(b)
            }
            BinaryOp::Rem => {
                if b == 0 {
                    return Err("division by zero".to_string());
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| format!("integer overflow in `{op}`"));
    }

    let a = number_to_f64(&lhs);
    let b = number_to_f64(&rhs);
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => unreachable!(),
    }))
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rowcast_postgres::types::{FieldType, TableDescriptor};

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};

/// The static type of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprType {
    Int,
    Float,
    Bool,
    Str,
    Bytes,
    /// Opaque structured value; operations on it defer checking to runtime.
    Dynamic,
    Null,
    /// A reference to one of the declared events of a conditional rule.
    EventRef,
    /// A typed row, shaped by a table descriptor.
    Record(Arc<TableDescriptor>),
    /// The `events` binding of a conditional rule: one member per declared
    /// event name, each of type [`ExprType::EventRef`].
    Events(Arc<BTreeSet<String>>),
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprType::Int => f.write_str("int"),
            ExprType::Float => f.write_str("float"),
            ExprType::Bool => f.write_str("bool"),
            ExprType::Str => f.write_str("string"),
            ExprType::Bytes => f.write_str("bytes"),
            ExprType::Dynamic => f.write_str("dyn"),
            ExprType::Null => f.write_str("null"),
            ExprType::EventRef => f.write_str("event"),
            ExprType::Record(table) => write!(f, "record<{}>", table.name),
            ExprType::Events(_) => f.write_str("events"),
        }
    }
}

impl ExprType {
    fn is_bool_like(&self) -> bool {
        matches!(self, ExprType::Bool | ExprType::Dynamic)
    }

    fn is_numeric(&self) -> bool {
        matches!(self, ExprType::Int | ExprType::Float | ExprType::Dynamic)
    }
}

/// Compile-time variable bindings for one rule.
#[derive(Debug, Clone, Default)]
pub struct TypeScope {
    vars: BTreeMap<String, ExprType>,
}

impl TypeScope {
    pub fn new() -> TypeScope {
        TypeScope::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, ty: ExprType) {
        self.vars.insert(name.into(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&ExprType> {
        self.vars.get(name)
    }
}

/// Infers the type of an expression, rejecting unknown variables, unknown
/// fields and ill-typed operator applications.
pub fn check(expr: &Expr, scope: &TypeScope) -> Result<ExprType, String> {
    match expr {
        Expr::Literal(literal) => Ok(match literal {
            Literal::Int(_) => ExprType::Int,
            Literal::Float(_) => ExprType::Float,
            Literal::Str(_) => ExprType::Str,
            Literal::Bool(_) => ExprType::Bool,
            Literal::Null => ExprType::Null,
        }),

        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| format!("unknown variable `{name}`")),

        Expr::Field(base, field) => match check(base, scope)? {
            ExprType::Record(table) => match table.field_type(field) {
                Some(FieldType::I64) => Ok(ExprType::Int),
                Some(FieldType::F64) => Ok(ExprType::Float),
                Some(FieldType::Bool) => Ok(ExprType::Bool),
                Some(FieldType::String) => Ok(ExprType::Str),
                Some(FieldType::Bytes) => Ok(ExprType::Bytes),
                Some(FieldType::Dynamic) => Ok(ExprType::Dynamic),
                None => Err(format!(
                    "unknown field `{field}` on table `{}`",
                    table.name
                )),
            },
            ExprType::Events(names) => {
                if names.contains(field) {
                    Ok(ExprType::EventRef)
                } else {
                    Err(format!("unknown event `{field}`"))
                }
            }
            ExprType::Dynamic => Ok(ExprType::Dynamic),
            other => Err(format!("cannot access field `{field}` on {other}")),
        },

        Expr::Unary(op, operand) => {
            let operand = check(operand, scope)?;
            match op {
                UnaryOp::Not if operand.is_bool_like() => Ok(ExprType::Bool),
                UnaryOp::Not => Err(format!("`!` expects a bool, got {operand}")),
                UnaryOp::Neg if operand.is_numeric() => Ok(operand),
                UnaryOp::Neg => Err(format!("`-` expects a number, got {operand}")),
            }
        }

        Expr::Binary(op, lhs, rhs) => {
            let lhs = check(lhs, scope)?;
            let rhs = check(rhs, scope)?;
            check_binary(*op, lhs, rhs)
        }

        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            let cond = check(cond, scope)?;
            if !cond.is_bool_like() {
                return Err(format!("ternary condition must be a bool, got {cond}"));
            }
            let then = check(then, scope)?;
            let otherwise = check(otherwise, scope)?;
            unify(then.clone(), otherwise.clone()).ok_or_else(|| {
                format!("ternary branches have incompatible types {then} and {otherwise}")
            })
        }
    }
}

fn check_binary(op: BinaryOp, lhs: ExprType, rhs: ExprType) -> Result<ExprType, String> {
    match op {
        BinaryOp::And | BinaryOp::Or => {
            if lhs.is_bool_like() && rhs.is_bool_like() {
                Ok(ExprType::Bool)
            } else {
                Err(format!("`{op}` expects bools, got {lhs} and {rhs}"))
            }
        }

        BinaryOp::Eq | BinaryOp::Ne => {
            if unify(lhs.clone(), rhs.clone()).is_some() {
                Ok(ExprType::Bool)
            } else {
                Err(format!("cannot compare {lhs} and {rhs} for equality"))
            }
        }

        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordered = (lhs.is_numeric() && rhs.is_numeric())
                || matches!(
                    (&lhs, &rhs),
                    (ExprType::Str, ExprType::Str)
                        | (ExprType::Str, ExprType::Dynamic)
                        | (ExprType::Dynamic, ExprType::Str)
                );
            if ordered {
                Ok(ExprType::Bool)
            } else {
                Err(format!("cannot order {lhs} and {rhs}"))
            }
        }

        BinaryOp::Add => match (&lhs, &rhs) {
            (ExprType::Str, ExprType::Str) => Ok(ExprType::Str),
            (ExprType::Str, ExprType::Dynamic) | (ExprType::Dynamic, ExprType::Str) => {
                Ok(ExprType::Dynamic)
            }
            _ => arithmetic_result(op, lhs, rhs),
        },

        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic_result(op, lhs, rhs)
        }
    }
}

fn arithmetic_result(op: BinaryOp, lhs: ExprType, rhs: ExprType) -> Result<ExprType, String> {
    match (&lhs, &rhs) {
        (ExprType::Int, ExprType::Int) => Ok(ExprType::Int),
        (ExprType::Dynamic, other) | (other, ExprType::Dynamic) if other.is_numeric() => {
            Ok(ExprType::Dynamic)
        }
        _ if lhs.is_numeric() && rhs.is_numeric() => Ok(ExprType::Float),
        _ => Err(format!("`{op}` expects numbers, got {lhs} and {rhs}")),
    }
}

/// Finds the common type of two branches, treating null as compatible with
/// anything and dynamic as absorbing.
fn unify(a: ExprType, b: ExprType) -> Option<ExprType> {
    match (a, b) {
        (a, b) if a == b => Some(a),
        (ExprType::Null, other) | (other, ExprType::Null) => Some(other),
        (ExprType::Dynamic, _) | (_, ExprType::Dynamic) => Some(ExprType::Dynamic),
        (ExprType::Int, ExprType::Float) | (ExprType::Float, ExprType::Int) => {
            Some(ExprType::Float)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse_expression;
    use rowcast_postgres::types::ColumnDescriptor;

    fn users_table() -> Arc<TableDescriptor> {
        Arc::new(TableDescriptor {
            name: "users".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    field_type: FieldType::I64,
                },
                ColumnDescriptor {
                    name: "email".to_string(),
                    field_type: FieldType::String,
                },
                ColumnDescriptor {
                    name: "balance".to_string(),
                    field_type: FieldType::F64,
                },
                ColumnDescriptor {
                    name: "active".to_string(),
                    field_type: FieldType::Bool,
                },
                ColumnDescriptor {
                    name: "metadata".to_string(),
                    field_type: FieldType::Dynamic,
                },
            ],
        })
    }

    fn scope() -> TypeScope {
        let mut scope = TypeScope::new();
        scope.bind("new", ExprType::Record(users_table()));
        scope.bind("old", ExprType::Record(users_table()));
        scope.bind(
            "events",
            ExprType::Events(Arc::new(BTreeSet::from([
                "upgraded".to_string(),
                "downgraded".to_string(),
            ]))),
        );
        scope
    }

    fn check_source(source: &str) -> Result<ExprType, String> {
        let expr = parse_expression(source).unwrap();
        check(&expr, &scope())
    }

    #[test]
    fn field_access_takes_the_descriptor_type() {
        assert_eq!(check_source("new.id").unwrap(), ExprType::Int);
        assert_eq!(check_source("new.email").unwrap(), ExprType::Str);
        assert_eq!(check_source("new.balance").unwrap(), ExprType::Float);
        assert_eq!(check_source("new.metadata").unwrap(), ExprType::Dynamic);
        assert_eq!(check_source("new.metadata.plan").unwrap(), ExprType::Dynamic);
    }

    #[test]
    fn unknown_fields_and_variables_are_rejected() {
        assert!(check_source("new.does_not_exist").unwrap_err().contains("unknown field"));
        assert!(check_source("missing").unwrap_err().contains("unknown variable"));
        assert!(check_source("events.never_declared").unwrap_err().contains("unknown event"));
    }

    #[test]
    fn event_references_type_as_event_ref() {
        assert_eq!(check_source("events.upgraded").unwrap(), ExprType::EventRef);
        assert_eq!(
            check_source("new.active ? events.upgraded : null").unwrap(),
            ExprType::EventRef
        );
        assert_eq!(
            check_source("new.active ? events.upgraded : events.downgraded").unwrap(),
            ExprType::EventRef
        );
    }

    #[test]
    fn operator_typing() {
        assert_eq!(check_source("new.id + 1").unwrap(), ExprType::Int);
        assert_eq!(check_source("new.balance * 2").unwrap(), ExprType::Float);
        assert_eq!(check_source("new.email + '!'").unwrap(), ExprType::Str);
        assert_eq!(check_source("new.id >= 10").unwrap(), ExprType::Bool);
        assert_eq!(
            check_source("new.active && old.active").unwrap(),
            ExprType::Bool
        );
        assert_eq!(check_source("new.email == null").unwrap(), ExprType::Bool);
    }

    #[test]
    fn ill_typed_operators_are_rejected() {
        assert!(check_source("new.email - 1").is_err());
        assert!(check_source("new.id && true").is_err());
        assert!(check_source("new.email < 3").is_err());
        assert!(check_source("new.id == new.email").is_err());
        assert!(check_source("!new.id").is_err());
        assert!(check_source("new.id ? 1 : 2").is_err());
        assert!(check_source("new.active ? events.upgraded : 7").is_err());
    }
}

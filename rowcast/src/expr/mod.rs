//! The expression language used by tracking rules.
//!
//! Conditions and property projections are small sandboxed expressions over
//! typed row records: literals, field access, arithmetic, comparisons,
//! short-circuit boolean logic and a ternary operator. Compilation lexes and
//! parses the source, then type-checks it against the compile-time scope
//! derived from the schema descriptor, so unknown fields and ill-typed
//! operators are rejected at startup rather than per row.
//!
//! Evaluation is hermetic: a pure tree walk over the compiled AST and an
//! input scope, with no I/O and no state retained between invocations.

mod ast;
mod check;
mod eval;
mod lexer;
mod parser;
mod value;

pub use ast::{BinaryOp, Expr, Literal, UnaryOp};
pub use check::{ExprType, TypeScope, check};
pub use eval::{Scope, eval};
pub use value::{Value, decode_row, decode_row_lax};

use crate::error::{ErrorKind, RowcastResult};
use crate::rowcast_error;

/// A compiled expression: parsed, type-checked and ready to evaluate.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    expr: Expr,
    output: ExprType,
}

impl Program {
    /// Compiles an expression against the given compile-time scope.
    pub fn compile(source: &str, scope: &TypeScope) -> RowcastResult<Program> {
        let expr = parse(source)?;
        let output = check(&expr, scope).map_err(|reason| {
            rowcast_error!(
                ErrorKind::ExpressionCompileError,
                "expression failed to type-check",
                format!("`{source}`: {reason}")
            )
        })?;

        Ok(Program {
            source: source.to_string(),
            expr,
            output,
        })
    }

    /// The static output type inferred at compile time.
    pub fn output(&self) -> &ExprType {
        &self.output
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the program against a concrete input scope.
    pub fn eval(&self, scope: &Scope) -> RowcastResult<Value> {
        eval(&self.expr, scope).map_err(|reason| {
            rowcast_error!(
                ErrorKind::EvaluationError,
                "expression evaluation failed",
                format!("`{}`: {}", self.source, reason)
            )
        })
    }
}

fn parse(source: &str) -> RowcastResult<Expr> {
    parser::parse_expression(source).map_err(|errors| {
        rowcast_error!(
            ErrorKind::ExpressionCompileError,
            "expression failed to parse",
            format!("`{}`: {}", source, errors.join("; "))
        )
    })
}

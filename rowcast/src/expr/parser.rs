use chumsky::Stream;
use chumsky::prelude::*;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};
use super::lexer::{FloatLit, Token, lexer};

/// Lexes and parses an expression source string.
pub(crate) fn parse_expression(source: &str) -> Result<Expr, Vec<String>> {
    let (tokens, lex_errors) = lexer().parse_recovery(source);
    if !lex_errors.is_empty() {
        return Err(lex_errors.into_iter().map(|e| e.to_string()).collect());
    }

    let tokens = tokens.unwrap_or_default();
    let end_span = source.len()..source.len() + 1;
    let stream = Stream::from_iter(end_span, tokens.into_iter());

    expr_parser()
        .parse(stream)
        .map_err(|errors| errors.into_iter().map(|e| e.to_string()).collect())
}

fn expr_parser() -> impl Parser<Token, Expr, Error = Simple<Token>> {
    recursive(|expr| {
        let literal = select! {
            Token::Int(value) => Expr::Literal(Literal::Int(value)),
            Token::Float(FloatLit(value)) => Expr::Literal(Literal::Float(value)),
            Token::Str(value) => Expr::Literal(Literal::Str(value)),
            Token::True => Expr::Literal(Literal::Bool(true)),
            Token::False => Expr::Literal(Literal::Bool(false)),
            Token::Null => Expr::Literal(Literal::Null),
        };
        let variable = select! { Token::Ident(name) => Expr::Var(name) };
        let member = select! { Token::Ident(name) => name };

        let primary = literal.or(variable).or(expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen)));

        let postfix = primary
            .then(just(Token::Dot).ignore_then(member).repeated())
            .foldl(|base, field| Expr::Field(Box::new(base), field));

        let unary_op = just(Token::Bang)
            .to(UnaryOp::Not)
            .or(just(Token::Minus).to(UnaryOp::Neg));
        let unary = unary_op
            .repeated()
            .then(postfix)
            .foldr(|op, operand| Expr::Unary(op, Box::new(operand)));

        let product_op = just(Token::Star)
            .to(BinaryOp::Mul)
            .or(just(Token::Slash).to(BinaryOp::Div))
            .or(just(Token::Percent).to(BinaryOp::Rem));
        let product = unary
            .clone()
            .then(product_op.then(unary).repeated())
            .foldl(|lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)));

        let sum_op = just(Token::Plus)
            .to(BinaryOp::Add)
            .or(just(Token::Minus).to(BinaryOp::Sub));
        let sum = product
            .clone()
            .then(sum_op.then(product).repeated())
            .foldl(|lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)));

        let relational_op = just(Token::Lte)
            .to(BinaryOp::Le)
            .or(just(Token::Gte).to(BinaryOp::Ge))
            .or(just(Token::Lt).to(BinaryOp::Lt))
            .or(just(Token::Gt).to(BinaryOp::Gt));
        let relational = sum
            .clone()
            .then(relational_op.then(sum).repeated())
            .foldl(|lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)));

        let equality_op = just(Token::EqEq)
            .to(BinaryOp::Eq)
            .or(just(Token::NotEq).to(BinaryOp::Ne));
        let equality = relational
            .clone()
            .then(equality_op.then(relational).repeated())
            .foldl(|lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)));

        let conjunction = equality
            .clone()
            .then(just(Token::AndAnd).ignore_then(equality).repeated())
            .foldl(|lhs, rhs| Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs)));

        let disjunction = conjunction
            .clone()
            .then(just(Token::OrOr).ignore_then(conjunction).repeated())
            .foldl(|lhs, rhs| Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs)));

        disjunction
            .then(
                just(Token::Question)
                    .ignore_then(expr.clone())
                    .then_ignore(just(Token::Colon))
                    .then(expr)
                    .or_not(),
            )
            .map(|(cond, branches)| match branches {
                Some((then, otherwise)) => Expr::Ternary {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                },
                None => cond,
            })
    })
    .then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Expr {
        parse_expression(source).unwrap()
    }

    #[test]
    fn parses_field_access_chains() {
        assert_eq!(
            parse("new.email"),
            Expr::Field(Box::new(Expr::Var("new".into())), "email".into())
        );
        assert_eq!(
            parse("events.order_completed"),
            Expr::Field(Box::new(Expr::Var("events".into())), "order_completed".into())
        );
    }

    #[test]
    fn parses_literals() {
        assert_eq!(parse("42"), Expr::Literal(Literal::Int(42)));
        assert_eq!(parse("1.5"), Expr::Literal(Literal::Float(1.5)));
        assert_eq!(parse("'pro'"), Expr::Literal(Literal::Str("pro".into())));
        assert_eq!(parse("\"pro\""), Expr::Literal(Literal::Str("pro".into())));
        assert_eq!(parse("null"), Expr::Literal(Literal::Null));
        assert_eq!(parse("true"), Expr::Literal(Literal::Bool(true)));
    }

    #[test]
    fn binary_precedence_is_conventional() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        assert_eq!(
            parse("1 + 2 * 3"),
            Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::Literal(Literal::Int(1))),
                Box::new(Expr::Binary(
                    BinaryOp::Mul,
                    Box::new(Expr::Literal(Literal::Int(2))),
                    Box::new(Expr::Literal(Literal::Int(3))),
                )),
            )
        );

        // a == b && c == d groups the comparisons first
        let parsed = parse("a == b && c == d");
        match parsed {
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Binary(BinaryOp::Eq, _, _)));
                assert!(matches!(*rhs, Expr::Binary(BinaryOp::Eq, _, _)));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn ternary_nests_to_the_right() {
        let parsed = parse("a ? 1 : b ? 2 : 3");
        match parsed {
            Expr::Ternary { otherwise, .. } => {
                assert!(matches!(*otherwise, Expr::Ternary { .. }));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unary_minus_and_not() {
        assert_eq!(
            parse("-x"),
            Expr::Unary(UnaryOp::Neg, Box::new(Expr::Var("x".into())))
        );
        assert_eq!(
            parse("!!a"),
            Expr::Unary(
                UnaryOp::Not,
                Box::new(Expr::Unary(UnaryOp::Not, Box::new(Expr::Var("a".into()))))
            )
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_expression("a ==").is_err());
        assert!(parse_expression("(a").is_err());
        assert!(parse_expression("a ? b").is_err());
        assert!(parse_expression("").is_err());
    }
}

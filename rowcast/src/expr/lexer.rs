use std::fmt;
use std::hash::{Hash, Hasher};

use chumsky::prelude::*;

/// Float literal with bit-pattern equality so tokens can be hashed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FloatLit(pub f64);

impl PartialEq for FloatLit {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatLit {}

impl Hash for FloatLit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.to_bits());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Token {
    Ident(String),
    Int(i64),
    Float(FloatLit),
    Str(String),
    True,
    False,
    Null,
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Lte,
    Gte,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Question,
    Colon,
    Dot,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier `{s}`"),
            Token::Int(v) => write!(f, "integer `{v}`"),
            Token::Float(v) => write!(f, "float `{}`", v.0),
            Token::Str(s) => write!(f, "string `{s}`"),
            Token::True => write!(f, "'true'"),
            Token::False => write!(f, "'false'"),
            Token::Null => write!(f, "'null'"),
            Token::OrOr => write!(f, "'||'"),
            Token::AndAnd => write!(f, "'&&'"),
            Token::EqEq => write!(f, "'=='"),
            Token::NotEq => write!(f, "'!='"),
            Token::Lte => write!(f, "'<='"),
            Token::Gte => write!(f, "'>='"),
            Token::Lt => write!(f, "'<'"),
            Token::Gt => write!(f, "'>'"),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Percent => write!(f, "'%'"),
            Token::Bang => write!(f, "'!'"),
            Token::Question => write!(f, "'?'"),
            Token::Colon => write!(f, "':'"),
            Token::Dot => write!(f, "'.'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
        }
    }
}

pub(crate) fn lexer()
-> impl Parser<char, Vec<(Token, std::ops::Range<usize>)>, Error = Simple<char>> {
    let number = text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .try_map(|(int_part, frac): (String, Option<(char, String)>), span| match frac {
            None => int_part
                .parse::<i64>()
                .map(Token::Int)
                .map_err(|_| Simple::custom(span, "integer literal out of range")),
            Some((_, frac_digits)) => format!("{int_part}.{frac_digits}")
                .parse::<f64>()
                .map(|value| Token::Float(FloatLit(value)))
                .map_err(|_| Simple::custom(span, "invalid float literal")),
        });

    let double_quoted = just('"')
        .ignore_then(filter(|c| *c != '"').repeated().collect::<String>())
        .then_ignore(just('"'))
        .map(Token::Str);
    let single_quoted = just('\'')
        .ignore_then(filter(|c| *c != '\'').repeated().collect::<String>())
        .then_ignore(just('\''))
        .map(Token::Str);

    let word = text::ident().map(|s: String| match s.as_str() {
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        _ => Token::Ident(s),
    });

    let op = choice::<_, Simple<char>>(vec![
        just("||").to(Token::OrOr).boxed(),
        just("&&").to(Token::AndAnd).boxed(),
        just("==").to(Token::EqEq).boxed(),
        just("!=").to(Token::NotEq).boxed(),
        just("<=").to(Token::Lte).boxed(),
        just(">=").to(Token::Gte).boxed(),
        just('<').to(Token::Lt).boxed(),
        just('>').to(Token::Gt).boxed(),
        just('+').to(Token::Plus).boxed(),
        just('-').to(Token::Minus).boxed(),
        just('*').to(Token::Star).boxed(),
        just('/').to(Token::Slash).boxed(),
        just('%').to(Token::Percent).boxed(),
        just('!').to(Token::Bang).boxed(),
        just('?').to(Token::Question).boxed(),
        just(':').to(Token::Colon).boxed(),
        just('.').to(Token::Dot).boxed(),
        just('(').to(Token::LParen).boxed(),
        just(')').to(Token::RParen).boxed(),
    ]);

    choice((number, double_quoted, single_quoted, word, op))
        .map_with_span(|token, span| (token, span))
        .padded()
        .repeated()
        .then_ignore(end())
}

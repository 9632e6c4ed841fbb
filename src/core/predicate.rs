//! Failover predicate expressions.
//!
//! A location may declare when a failed attempt is retried on another
//! endpoint, e.g. `IsNetworkError && AttemptsLe(2)` or
//! `(ResponseCodeEq(502) || IsNetworkError) && RequestMethodEq("GET")`.
//! Expressions are parsed once when the location is written so malformed
//! input is rejected before any proxy reloads it.
use std::{fmt, str::FromStr};

use thiserror::Error;

/// Deepest grouping or negation nesting, and longest `&&`/`||` chain, accepted.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PredicateError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string literal starting at position {pos}")]
    UnterminatedString { pos: usize },

    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("bad argument to {function}: {message}")]
    BadArgument { function: String, message: String },

    #[error("expression is nested deeper than {max} levels")]
    TooDeep { max: usize },
}

/// Outcome of a proxied attempt a predicate is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct FailoverContext<'a> {
    pub method: &'a str,
    pub attempts: u32,
    pub response_code: Option<u16>,
    pub network_error: bool,
}

/// Parsed failover predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    IsNetworkError,
    AttemptsLe(u32),
    ResponseCodeEq(u16),
    RequestMethodEq(String),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn parse(expr: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err(PredicateError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let predicate = parser.parse_or()?;
        match parser.peek() {
            None => Ok(predicate),
            Some(tok) => Err(PredicateError::UnexpectedToken {
                expected: "end of expression".to_string(),
                found: tok.to_string(),
            }),
        }
    }

    pub fn evaluate(&self, ctx: &FailoverContext<'_>) -> bool {
        match self {
            Predicate::IsNetworkError => ctx.network_error,
            Predicate::AttemptsLe(n) => ctx.attempts <= *n,
            Predicate::ResponseCodeEq(code) => ctx.response_code == Some(*code),
            Predicate::RequestMethodEq(method) => ctx.method.eq_ignore_ascii_case(method),
            Predicate::Not(inner) => !inner.evaluate(ctx),
            Predicate::And(a, b) => a.evaluate(ctx) && b.evaluate(ctx),
            Predicate::Or(a, b) => a.evaluate(ctx) || b.evaluate(ctx),
        }
    }
}

impl FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Predicate::parse(s)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::IsNetworkError => f.write_str("IsNetworkError"),
            Predicate::AttemptsLe(n) => write!(f, "AttemptsLe({n})"),
            Predicate::ResponseCodeEq(code) => write!(f, "ResponseCodeEq({code})"),
            Predicate::RequestMethodEq(method) => write!(f, "RequestMethodEq({method:?})"),
            Predicate::Not(inner) => write!(f, "!{inner}"),
            Predicate::And(a, b) => write!(f, "({a} && {b})"),
            Predicate::Or(a, b) => write!(f, "({a} || {b})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{s}'"),
            Token::Int(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Not => f.write_str("'!'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, PredicateError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&ch) {
                    return Err(PredicateError::UnexpectedChar { ch, pos: i });
                }
                tokens.push(if ch == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(PredicateError::UnterminatedString { pos: start }),
                        Some('"') => break,
                        Some(c) => value.push(*c),
                    }
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| PredicateError::UnexpectedChar { ch, pos: start })?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(PredicateError::UnexpectedChar { ch, pos: i }),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<(), PredicateError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(unexpected(&expected.to_string(), other)),
        }
    }

    fn parse_or(&mut self) -> Result<Predicate, PredicateError> {
        let mut left = self.parse_and()?;
        let mut operands = 1;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            operands = chained(operands)?;
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, PredicateError> {
        let mut left = self.parse_unary()?;
        let mut operands = 1;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            operands = chained(operands)?;
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate, PredicateError> {
        match self.next() {
            Some(Token::Not) => {
                self.descend()?;
                let inner = self.parse_unary();
                self.depth -= 1;
                Ok(Predicate::Not(Box::new(inner?)))
            }
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or();
                self.depth -= 1;
                let inner = inner?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.parse_call(name),
            other => Err(unexpected("a predicate", other)),
        }
    }

    fn descend(&mut self) -> Result<(), PredicateError> {
        if self.depth >= MAX_DEPTH {
            return Err(PredicateError::TooDeep { max: MAX_DEPTH });
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_call(&mut self, name: String) -> Result<Predicate, PredicateError> {
        match name.as_str() {
            "IsNetworkError" => {
                // Tolerate an empty argument list.
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.expect(Token::RParen)?;
                }
                Ok(Predicate::IsNetworkError)
            }
            "AttemptsLe" => {
                let n = self.int_argument(&name)?;
                let n = u32::try_from(n).map_err(|_| bad_argument(&name, "attempts must be >= 0"))?;
                Ok(Predicate::AttemptsLe(n))
            }
            "ResponseCodeEq" => {
                let code = self.int_argument(&name)?;
                let code = u16::try_from(code)
                    .ok()
                    .filter(|c| (100..=599).contains(c))
                    .ok_or_else(|| bad_argument(&name, "expected an HTTP status code"))?;
                Ok(Predicate::ResponseCodeEq(code))
            }
            "RequestMethodEq" => {
                self.expect(Token::LParen)?;
                let method = match self.next() {
                    Some(Token::Str(s)) if !s.is_empty() => s,
                    other => return Err(unexpected("a quoted method name", other)),
                };
                self.expect(Token::RParen)?;
                Ok(Predicate::RequestMethodEq(method))
            }
            _ => Err(PredicateError::UnknownFunction(name)),
        }
    }

    fn int_argument(&mut self, function: &str) -> Result<i64, PredicateError> {
        self.expect(Token::LParen)?;
        let value = match self.next() {
            Some(Token::Int(n)) => n,
            Some(other) => {
                return Err(bad_argument(function, &format!("expected an integer, found {other}")));
            }
            None => return Err(unexpected("an integer", None)),
        };
        self.expect(Token::RParen)?;
        Ok(value)
    }
}

fn unexpected(expected: &str, found: Option<Token>) -> PredicateError {
    PredicateError::UnexpectedToken {
        expected: expected.to_string(),
        found: found.map_or_else(|| "end of expression".to_string(), |t| t.to_string()),
    }
}

/// Count one more operand of a `&&`/`||` chain.
fn chained(operands: usize) -> Result<usize, PredicateError> {
    if operands >= MAX_DEPTH {
        return Err(PredicateError::TooDeep { max: MAX_DEPTH });
    }
    Ok(operands + 1)
}

fn bad_argument(function: &str, message: &str) -> PredicateError {
    PredicateError::BadArgument {
        function: function.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conjunction() {
        let p = Predicate::parse("IsNetworkError && AttemptsLe(1)").unwrap();
        assert_eq!(
            p,
            Predicate::And(
                Box::new(Predicate::IsNetworkError),
                Box::new(Predicate::AttemptsLe(1))
            )
        );
    }

    #[test]
    fn test_precedence_and_grouping() {
        let p = Predicate::parse("IsNetworkError || ResponseCodeEq(502) && AttemptsLe(2)").unwrap();
        assert!(matches!(p, Predicate::Or(_, _)));

        let p = Predicate::parse("(IsNetworkError || ResponseCodeEq(502)) && AttemptsLe(2)").unwrap();
        assert!(matches!(p, Predicate::And(_, _)));
        assert_eq!(
            p.to_string(),
            "((IsNetworkError || ResponseCodeEq(502)) && AttemptsLe(2))"
        );
    }

    #[test]
    fn test_evaluate() {
        let p: Predicate = r#"(IsNetworkError || ResponseCodeEq(502)) && AttemptsLe(2) && !RequestMethodEq("POST")"#
            .parse()
            .unwrap();

        let mut ctx = FailoverContext {
            method: "GET",
            attempts: 1,
            response_code: Some(502),
            network_error: false,
        };
        assert!(p.evaluate(&ctx));

        ctx.attempts = 3;
        assert!(!p.evaluate(&ctx));

        ctx.attempts = 1;
        ctx.method = "post";
        assert!(!p.evaluate(&ctx));

        ctx.method = "GET";
        ctx.response_code = Some(200);
        assert!(!p.evaluate(&ctx));
        ctx.network_error = true;
        assert!(p.evaluate(&ctx));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Predicate::parse("   "), Err(PredicateError::Empty));
        assert!(matches!(
            Predicate::parse("bad predicate"),
            Err(PredicateError::UnknownFunction(_))
        ));
        assert!(matches!(
            Predicate::parse("IsNetworkError IsNetworkError"),
            Err(PredicateError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            Predicate::parse("IsNetworkError & AttemptsLe(1)"),
            Err(PredicateError::UnexpectedChar { ch: '&', .. })
        ));
        assert!(matches!(
            Predicate::parse("AttemptsLe(-1)"),
            Err(PredicateError::BadArgument { .. })
        ));
        assert!(matches!(
            Predicate::parse("ResponseCodeEq(42)"),
            Err(PredicateError::BadArgument { .. })
        ));
        assert!(matches!(
            Predicate::parse(r#"RequestMethodEq("GET"#),
            Err(PredicateError::UnterminatedString { .. })
        ));
        assert!(matches!(
            Predicate::parse("(IsNetworkError"),
            Err(PredicateError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |levels: usize| {
            format!("{}IsNetworkError{}", "(".repeat(levels), ")".repeat(levels))
        };
        assert!(Predicate::parse(&nested(MAX_DEPTH)).is_ok());
        assert_eq!(
            Predicate::parse(&nested(MAX_DEPTH + 1)),
            Err(PredicateError::TooDeep { max: MAX_DEPTH })
        );
        // Far past the limit is rejected without exhausting the stack.
        assert_eq!(
            Predicate::parse(&nested(200_000)),
            Err(PredicateError::TooDeep { max: MAX_DEPTH })
        );

        let negated = format!("{}IsNetworkError", "!".repeat(100_000));
        assert_eq!(
            Predicate::parse(&negated),
            Err(PredicateError::TooDeep { max: MAX_DEPTH })
        );
    }

    #[test]
    fn test_chain_limit() {
        let chain = |operands: usize| vec!["IsNetworkError"; operands].join(" && ");
        assert!(Predicate::parse(&chain(MAX_DEPTH)).is_ok());
        assert_eq!(
            Predicate::parse(&chain(100_000)),
            Err(PredicateError::TooDeep { max: MAX_DEPTH })
        );
    }
}

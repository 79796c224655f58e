//! Bounded expression evaluator for derived numeric sensors.
//!
//! Descriptors carry user formulas over the decoded value `X` and the
//! per-device config symbols, e.g. `X * nominal_power / 100`. The grammar is
//! arithmetic, parentheses and numeric literals only; anything else is a
//! configuration error at load time, never code execution.

use crate::error::ConfigError;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn formula_error(formula: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Formula {
        formula: formula.to_string(),
        message: message.into(),
    }
}

fn tokenize(formula: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = formula.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut number = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        number.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = number
                    .parse()
                    .map_err(|_| formula_error(formula, format!("bad number {number:?}")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(formula_error(
                    formula,
                    format!("unsupported character {other:?}"),
                ))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    formula: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    bindings: &'a HashMap<String, f64>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<f64, ConfigError> {
        let mut value = self.term()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => {
                    self.next();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.next();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, ConfigError> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => {
                    self.next();
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.next();
                    value /= self.factor()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, ConfigError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Ident(name)) => self
                .bindings
                .get(&name)
                .copied()
                .ok_or_else(|| formula_error(self.formula, format!("unknown symbol {name:?}"))),
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(formula_error(self.formula, "missing closing parenthesis")),
                }
            }
            other => Err(formula_error(
                self.formula,
                format!("unexpected token {other:?}"),
            )),
        }
    }
}

/// Evaluate `formula` against the symbol bindings.
pub fn evaluate(formula: &str, bindings: &HashMap<String, f64>) -> Result<f64, ConfigError> {
    let tokens = tokenize(formula)?;
    if tokens.is_empty() {
        return Err(formula_error(formula, "empty formula"));
    }
    let mut parser = Parser {
        formula,
        tokens,
        pos: 0,
        bindings,
    };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(formula_error(formula, "trailing tokens"));
    }
    Ok(value)
}

/// Load-time validation with placeholder bindings.
pub fn validate(formula: &str, symbols: &[String]) -> Result<(), ConfigError> {
    let mut bindings: HashMap<String, f64> =
        symbols.iter().map(|s| (s.clone(), 1.0)).collect();
    bindings.insert("X".to_string(), 1.0);
    evaluate(formula, &bindings).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn arithmetic_with_precedence() {
        let b = bindings(&[("X", 10.0)]);
        assert_eq!(evaluate("X * 2 + 1", &b).unwrap(), 21.0);
        assert_eq!(evaluate("X * (2 + 1)", &b).unwrap(), 30.0);
        assert_eq!(evaluate("-X / 4", &b).unwrap(), -2.5);
        assert_eq!(evaluate("0.5 * X", &b).unwrap(), 5.0);
    }

    #[test]
    fn config_symbols_resolve() {
        let b = bindings(&[("X", 50.0), ("nominal_power", 2000.0)]);
        assert_eq!(evaluate("X * nominal_power / 100", &b).unwrap(), 1000.0);
    }

    #[test]
    fn unsupported_constructs_are_errors() {
        let b = bindings(&[("X", 1.0)]);
        assert!(evaluate("X ** 2", &b).is_err());
        assert!(evaluate("__import__", &b).is_err());
        assert!(evaluate("X + y", &b).is_err());
        assert!(evaluate("", &b).is_err());
        assert!(evaluate("(X", &b).is_err());
    }
}

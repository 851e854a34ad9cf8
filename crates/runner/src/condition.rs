//! Local condition sublanguage
//!
//! Test files embed boolean conditions (preconditions, postconditions) and
//! side-effecting cleanup expressions. These are interpreted by a small
//! recursive evaluator over a closed grammar; test files can never run
//! arbitrary host code:
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | cmp
//! cmp     := atom (("==" | "!=") atom)?
//! atom    := "(" expr ")" | "true" | "false" | "string"
//!          | env(NAME) | exists("path") | remove("path") | chdir("path")
//! ```
//!
//! A string is truthy iff non-empty. `remove` and `chdir` are side effects
//! intended for cleanup directives; they evaluate to whether they took effect.
//! Anything outside the grammar fails with `UnsupportedCondition`.

use std::fmt;
use std::path::Path;

use tracing::warn;
use vmharness_common::{Error, Result};

/// Value a condition expression evaluates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
            Value::Str(s) => s,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Evaluate a condition expression against the current host state.
pub fn eval(expression: &str) -> Result<Value> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        expression,
        tokens,
        pos: 0,
    };
    let ast = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.unsupported("trailing input after expression"));
    }
    eval_ast(&ast)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    EqEq,
    NotEq,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let unsupported =
        |msg: &str| Error::UnsupportedCondition(format!("{msg} in {expression:?}"));
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(unsupported("single `=`"));
                }
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(unsupported("bare `!`"));
                }
                tokens.push(Token::NotEq);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => return Err(unsupported("unterminated string")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
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
            _ => return Err(unsupported(&format!("unexpected character {c:?}"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Bool(bool),
    Str(String),
    Env(String),
    Exists(String),
    Remove(String),
    Chdir(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn unsupported(&self, msg: &str) -> Error {
        Error::UnsupportedCondition(format!("{msg} in {:?}", self.expression))
    }

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

    fn expect_token(&mut self, token: Token, what: &str) -> Result<()> {
        if self.next().as_ref() == Some(&token) {
            Ok(())
        } else {
            Err(self.unsupported(&format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Ident("or".to_string())) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::Ident("and".to_string())) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Ident("not".to_string())) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_atom()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.next();
                let rhs = self.parse_atom()?;
                Ok(Expr::Eq(Box::new(lhs), Box::new(rhs)))
            }
            Some(Token::NotEq) => {
                self.next();
                let rhs = self.parse_atom()?;
                Ok(Expr::Ne(Box::new(lhs), Box::new(rhs)))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect_token(Token::RParen, "closing parenthesis")?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "env" => {
                    self.expect_token(Token::LParen, "`(` after env")?;
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        _ => return Err(self.unsupported("expected variable name in env()")),
                    };
                    self.expect_token(Token::RParen, "closing parenthesis")?;
                    Ok(Expr::Env(name))
                }
                "exists" | "remove" | "chdir" => {
                    self.expect_token(Token::LParen, &format!("`(` after {ident}"))?;
                    let path = match self.next() {
                        Some(Token::Str(path)) => path,
                        _ => {
                            return Err(
                                self.unsupported(&format!("expected quoted path in {ident}()"))
                            )
                        }
                    };
                    self.expect_token(Token::RParen, "closing parenthesis")?;
                    Ok(match ident.as_str() {
                        "exists" => Expr::Exists(path),
                        "remove" => Expr::Remove(path),
                        _ => Expr::Chdir(path),
                    })
                }
                _ => Err(self.unsupported(&format!("unknown identifier {ident:?}"))),
            },
            _ => Err(self.unsupported("expected expression")),
        }
    }
}

fn eval_ast(expr: &Expr) -> Result<Value> {
    Ok(match expr {
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Env(name) => Value::Str(std::env::var(name).unwrap_or_default()),
        Expr::Exists(path) => Value::Bool(Path::new(path).exists()),
        Expr::Remove(path) => Value::Bool(remove_path(Path::new(path))),
        Expr::Chdir(path) => match std::env::set_current_dir(path) {
            Ok(()) => Value::Bool(true),
            Err(err) => {
                warn!("chdir({path:?}) failed: {err}");
                Value::Bool(false)
            }
        },
        Expr::Not(inner) => Value::Bool(!eval_ast(inner)?.truthy()),
        Expr::And(lhs, rhs) => {
            Value::Bool(eval_ast(lhs)?.truthy() && eval_ast(rhs)?.truthy())
        }
        Expr::Or(lhs, rhs) => {
            Value::Bool(eval_ast(lhs)?.truthy() || eval_ast(rhs)?.truthy())
        }
        Expr::Eq(lhs, rhs) => Value::Bool(eval_ast(lhs)?.as_str() == eval_ast(rhs)?.as_str()),
        Expr::Ne(lhs, rhs) => Value::Bool(eval_ast(lhs)?.as_str() != eval_ast(rhs)?.as_str()),
    })
}

fn remove_path(path: &Path) -> bool {
    let removed = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match removed {
        Ok(()) => true,
        Err(err) => {
            if path.exists() {
                warn!("remove({path:?}) failed: {err}");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_and_combinators() {
        assert_eq!(eval("true").unwrap(), Value::Bool(true));
        assert_eq!(eval("not false").unwrap(), Value::Bool(true));
        assert_eq!(eval("true and not (false or false)").unwrap(), Value::Bool(true));
        assert_eq!(eval("false or false").unwrap(), Value::Bool(false));
    }

    #[test]
    fn strings_are_truthy_when_non_empty() {
        assert!(eval("\"something\"").unwrap().truthy());
        assert!(!eval("\"\"").unwrap().truthy());
    }

    #[test]
    fn env_lookup_and_comparison() {
        std::env::set_var("VMHARNESS_COND_TEST", "yes");
        assert!(eval("env(VMHARNESS_COND_TEST)").unwrap().truthy());
        assert!(eval("env(VMHARNESS_COND_TEST) == \"yes\"").unwrap().truthy());
        assert!(eval("env(VMHARNESS_COND_TEST) != \"no\"").unwrap().truthy());
        assert!(!eval("env(VMHARNESS_COND_TEST_UNSET_12345)").unwrap().truthy());
    }

    #[test]
    fn exists_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("marker");
        std::fs::write(&file, b"x").unwrap();
        let expr = |name: &str| format!("{name}({:?})", file.display().to_string());

        assert!(eval(&expr("exists")).unwrap().truthy());
        assert!(eval(&expr("remove")).unwrap().truthy());
        assert!(!eval(&expr("exists")).unwrap().truthy());
        // Removing a path that is already gone reports false.
        assert!(!eval(&expr("remove")).unwrap().truthy());
    }

    #[test]
    fn out_of_grammar_expressions_are_unsupported() {
        for expr in [
            "__import__(\"os\")",
            "1 + 1",
            "env(PATH",
            "exists(/tmp/raw)",
            "true extra",
            "system(\"rm -rf /\")",
        ] {
            assert!(
                matches!(eval(expr), Err(Error::UnsupportedCondition(_))),
                "expected {expr:?} to be unsupported"
            );
        }
    }
}

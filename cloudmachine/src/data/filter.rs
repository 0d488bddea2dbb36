//! Evaluation of rendered OData filters against in-memory rows.
//!
//! Supports the comparison operators `eq ne gt ge lt le`, the logical
//! operators `and or not`, parentheses, and string, number (optionally
//! `L`-suffixed) and boolean literals. A comparison against a property the
//! row does not have is false, as in the table service.

use super::entity::Entity;
use crate::common::{CloudMachineError, CloudMachineResult};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Compare(CompareOp),
    Ident(String),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Property(String),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
}

/// A parsed filter, reusable across rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    expr: Expr,
}

impl Filter {
    pub fn parse(source: &str) -> CloudMachineResult<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self { expr })
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        evaluate(&self.expr, entity)
    }
}

fn invalid(message: impl Into<String>) -> CloudMachineError {
    CloudMachineError::InvalidQuery(message.into())
}

fn tokenize(source: &str) -> CloudMachineResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string literal")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            text.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if matches!(chars.get(i), Some('L') | Some('l')) {
                    i += 1;
                }
                tokens.push(Token::Literal(parse_number(&text)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(keyword(&word).unwrap_or(Token::Ident(word)));
            }
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> CloudMachineResult<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::from(i));
    }
    text.parse::<f64>()
        .map(Value::from)
        .map_err(|_| invalid(format!("invalid number '{text}'")))
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word.to_ascii_lowercase().as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "eq" => Token::Compare(CompareOp::Eq),
        "ne" => Token::Compare(CompareOp::Ne),
        "gt" => Token::Compare(CompareOp::Gt),
        "ge" => Token::Compare(CompareOp::Ge),
        "lt" => Token::Compare(CompareOp::Lt),
        "le" => Token::Compare(CompareOp::Le),
        "true" => Token::Literal(Value::Bool(true)),
        "false" => Token::Literal(Value::Bool(false)),
        _ => return None,
    };
    Some(token)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> CloudMachineResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CloudMachineResult<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> CloudMachineResult<Expr> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(invalid("missing ')'")),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> CloudMachineResult<Expr> {
        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Compare(op)) => op,
            other => return Err(invalid(format!("expected comparison, found {other:?}"))),
        };
        let right = self.parse_operand()?;
        Ok(Expr::Compare(left, op, right))
    }

    fn parse_operand(&mut self) -> CloudMachineResult<Operand> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Operand::Property(name)),
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            other => Err(invalid(format!("expected operand, found {other:?}"))),
        }
    }
}

fn evaluate(expr: &Expr, entity: &Entity) -> bool {
    match expr {
        Expr::And(left, right) => evaluate(left, entity) && evaluate(right, entity),
        Expr::Or(left, right) => evaluate(left, entity) || evaluate(right, entity),
        Expr::Not(inner) => !evaluate(inner, entity),
        Expr::Compare(left, op, right) => {
            let (Some(left), Some(right)) = (resolve(left, entity), resolve(right, entity)) else {
                return false;
            };
            match compare(left, right) {
                Some(ordering) => match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Ne => ordering != Ordering::Equal,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Ge => ordering != Ordering::Less,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                },
                None => false,
            }
        }
    }
}

fn resolve<'a>(operand: &'a Operand, entity: &'a Entity) -> Option<&'a Value> {
    match operand {
        Operand::Property(name) => entity.get(name),
        Operand::Literal(value) => Some(value),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Some(a.cmp(&b));
            }
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        _ => None,
    }
}

//! Lexer and recursive-descent parser for rule programs.
//!
//! ```text
//! #define BEACON_PERIOD 5
//! materialize(link, TIMEOUT, infinity, keys(1,2)).
//! r1 beacon(@*, X) :- periodic(@X, E, BEACON_PERIOD, 0, INITIAL_DELAY, SPACEOUT).
//! ```
//!
//! Identifiers that name a constant are replaced by its value as they are
//! read, so constants must be defined (or supplied by the caller) before use.

use crate::engine::ast::{
    Assignment, Atom, BinOp, Expr, Limit, Materialize, Rule, SourceProgram, Statement, Term,
};
use crate::transport::Value;
use crate::utils::ParseError;
use std::collections::BTreeMap;

type ParseResult<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Str(String),
    Define,
    At,
    Star,
    LParen,
    RParen,
    Comma,
    Dot,
    If,
    Assign,
    Plus,
    Minus,
    Eof,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Self::Ident(name) => format!("identifier '{name}'"),
            Self::Int(n) => format!("integer {n}"),
            Self::Str(s) => format!("string {s:?}"),
            Self::Define => "'#define'".to_string(),
            Self::At => "'@'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Dot => "'.'".to_string(),
            Self::If => "':-'".to_string(),
            Self::Assign => "':='".to_string(),
            Self::Plus => "'+'".to_string(),
            Self::Minus => "'-'".to_string(),
            Self::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            line,
            column,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) -> ParseResult<()> {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let (line, column) = (self.line, self.column);
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    match lookahead.peek() {
                        Some('/') => {
                            while let Some(c) = self.bump() {
                                if c == '\n' {
                                    break;
                                }
                            }
                        }
                        Some('*') => {
                            self.bump();
                            self.bump();
                            let mut prev = '\0';
                            loop {
                                match self.bump() {
                                    Some('/') if prev == '*' => break,
                                    Some(c) => prev = c,
                                    None => {
                                        return Err(self.error(
                                            line,
                                            column,
                                            "unterminated block comment",
                                        ))
                                    }
                                }
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn tokenize(mut self) -> ParseResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(c) = self.bump() else {
                tokens.push(Token {
                    tok: Tok::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };

            let tok = match c {
                '@' => Tok::At,
                '*' => Tok::Star,
                '(' => Tok::LParen,
                ')' => Tok::RParen,
                ',' => Tok::Comma,
                '.' => Tok::Dot,
                '+' => Tok::Plus,
                '-' => Tok::Minus,
                ':' => match self.bump() {
                    Some('-') => Tok::If,
                    Some('=') => Tok::Assign,
                    _ => return Err(self.error(line, column, "expected ':-' or ':='")),
                },
                '#' => {
                    let word = self.take_word(String::new());
                    if word != "define" {
                        return Err(self.error(
                            line,
                            column,
                            format!("unknown directive '#{word}'"),
                        ));
                    }
                    Tok::Define
                }
                '"' => Tok::Str(self.take_string(line, column)?),
                c if c.is_ascii_digit() => {
                    let digits = self.take_word(c.to_string());
                    let value = digits.parse().map_err(|_| {
                        self.error(line, column, format!("invalid integer '{digits}'"))
                    })?;
                    Tok::Int(value)
                }
                c if c.is_alphabetic() || c == '_' => Tok::Ident(self.take_word(c.to_string())),
                other => {
                    return Err(self.error(line, column, format!("unexpected character '{other}'")))
                }
            };
            tokens.push(Token { tok, line, column });
        }
    }

    fn take_word(&mut self, mut word: String) -> String {
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn take_string(&mut self, line: usize, column: usize) -> ParseResult<String> {
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(text),
                Some('\\') => match self.bump() {
                    Some(c @ ('"' | '\\')) => text.push(c),
                    Some('n') => text.push('\n'),
                    _ => return Err(self.error(line, column, "invalid escape in string")),
                },
                Some('\n') | None => {
                    return Err(self.error(line, column, "unterminated string literal"))
                }
                Some(c) => text.push(c),
            }
        }
    }
}

/// Parse `source`; `constants` take precedence over the program's `#define`s
pub fn parse_program(
    source: &str,
    constants: &BTreeMap<String, i64>,
) -> ParseResult<SourceProgram> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        constants: constants
            .iter()
            .map(|(name, value)| (name.clone(), Value::Int(*value)))
            .collect(),
        overridden: constants.keys().cloned().collect(),
        rule_count: 0,
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    constants: BTreeMap<String, Value>,
    overridden: Vec<String>,
    rule_count: usize,
}

fn is_variable(name: &str) -> bool {
    name.starts_with(|c: char| c.is_uppercase() || c == '_')
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].tok
    }

    fn next(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let token = &self.tokens[self.pos];
        ParseError {
            line: token.line,
            column: token.column,
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Tok, context: &str) -> ParseResult<()> {
        if *self.peek() == expected {
            self.next();
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected {} {}, found {}",
                expected.describe(),
                context,
                self.peek().describe()
            )))
        }
    }

    fn ident(&mut self, context: &str) -> ParseResult<String> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.next();
                Ok(name)
            }
            other => Err(self.error_here(format!(
                "expected identifier {}, found {}",
                context,
                other.describe()
            ))),
        }
    }

    fn program(&mut self) -> ParseResult<SourceProgram> {
        let mut program = SourceProgram::default();
        while *self.peek() != Tok::Eof {
            if *self.peek() == Tok::Define {
                self.define()?;
            } else {
                program.statements.push(self.statement()?);
            }
        }
        Ok(program)
    }

    fn define(&mut self) -> ParseResult<()> {
        self.next();
        let name = self.ident("after '#define'")?;
        let value = match self.next().tok {
            Tok::Int(n) => Value::Int(n),
            Tok::Str(s) => Value::Str(s),
            Tok::Minus => match self.next().tok {
                Tok::Int(n) => Value::Int(-n),
                _ => return Err(self.error_here("expected integer after '-'")),
            },
            other => {
                return Err(self.error_here(format!(
                    "expected value for constant {name}, found {}",
                    other.describe()
                )))
            }
        };
        if !self.overridden.contains(&name) {
            self.constants.insert(name, value);
        }
        Ok(())
    }

    fn statement(&mut self) -> ParseResult<Statement> {
        let line = self.tokens[self.pos].line;
        let is_materialize = matches!(
            (self.peek(), self.peek_at(1)),
            (Tok::Ident(word), Tok::LParen) if word == "materialize"
        );
        if is_materialize {
            return self.materialize(line).map(Statement::Materialize);
        }

        let has_label = matches!((self.peek(), self.peek_at(1)), (Tok::Ident(_), Tok::Ident(_)));
        let label = if has_label {
            Some(self.ident("for rule label")?)
        } else {
            None
        };

        let head = self.atom()?;
        if head.predicate == "periodic" && label.is_none() && *self.peek() == Tok::Dot {
            self.next();
            return Ok(Statement::Periodic(head));
        }

        self.expect(Tok::If, &format!("after rule head {head}"))?;
        let mut body = Vec::new();
        let mut assignments = Vec::new();
        loop {
            let is_assignment = matches!(
                (self.peek(), self.peek_at(1)),
                (Tok::Ident(name), Tok::Assign) if is_variable(name)
            );
            if is_assignment {
                let var = self.ident("in assignment")?;
                self.next();
                let expr = self.expr()?;
                assignments.push(Assignment { var, expr });
            } else {
                body.push(self.atom()?);
            }

            match self.peek() {
                Tok::Comma => {
                    self.next();
                }
                Tok::Dot => {
                    self.next();
                    break;
                }
                other => {
                    return Err(self.error_here(format!(
                        "expected ',' or '.' in rule body, found {}",
                        other.describe()
                    )))
                }
            }
        }

        self.rule_count += 1;
        Ok(Statement::Rule(Rule {
            name: label.unwrap_or_else(|| format!("rule{}", self.rule_count)),
            head,
            body,
            assignments,
            line,
        }))
    }

    fn materialize(&mut self, line: usize) -> ParseResult<Materialize> {
        self.next();
        self.expect(Tok::LParen, "after 'materialize'")?;
        let name = self.ident("for relation name")?;
        self.expect(Tok::Comma, "after relation name")?;
        let ttl = self.limit("ttl")?;
        self.expect(Tok::Comma, "after ttl")?;
        let size = self.limit("size")?;
        self.expect(Tok::Comma, "after size")?;

        match self.ident("'keys'")?.as_str() {
            "keys" => {}
            other => return Err(self.error_here(format!("expected 'keys', found '{other}'"))),
        }
        self.expect(Tok::LParen, "after 'keys'")?;
        let mut keys = Vec::new();
        if *self.peek() != Tok::RParen {
            loop {
                match self.limit("key position")? {
                    Limit::Finite(n) => keys.push(n as usize),
                    Limit::Infinity => {
                        return Err(self.error_here("key position cannot be infinity"))
                    }
                }
                match self.peek() {
                    Tok::Comma => {
                        self.next();
                    }
                    Tok::RParen => break,
                    other => {
                        return Err(self.error_here(format!(
                            "expected ',' or ')' in 'keys', found {}",
                            other.describe()
                        )))
                    }
                }
            }
        }
        self.next();
        self.expect(Tok::RParen, "to close 'materialize'")?;
        self.expect(Tok::Dot, "after 'materialize(...)'")?;

        Ok(Materialize {
            name,
            ttl,
            size,
            keys,
            line,
        })
    }

    fn limit(&mut self, what: &str) -> ParseResult<Limit> {
        match self.peek().clone() {
            Tok::Int(n) if n >= 0 => {
                self.next();
                Ok(Limit::Finite(n as u64))
            }
            Tok::Ident(word) if word == "infinity" => {
                self.next();
                Ok(Limit::Infinity)
            }
            Tok::Ident(word) => match self.constants.get(&word) {
                Some(Value::Int(n)) if *n >= 0 => {
                    let n = *n as u64;
                    self.next();
                    Ok(Limit::Finite(n))
                }
                _ => Err(self.error_here(format!("expected {what}, found identifier '{word}'"))),
            },
            other => Err(self.error_here(format!(
                "expected {what}, found {}",
                other.describe()
            ))),
        }
    }

    fn atom(&mut self) -> ParseResult<Atom> {
        let predicate = self.ident("for predicate")?;
        if is_variable(&predicate) {
            return Err(self.error_here(format!(
                "predicate names start with a lowercase letter, found '{predicate}'"
            )));
        }
        self.expect(Tok::LParen, &format!("after predicate {predicate}"))?;
        self.expect(Tok::At, &format!("before the location of {predicate}"))?;
        let location = self.term()?;

        let mut args = Vec::new();
        while *self.peek() == Tok::Comma {
            self.next();
            args.push(self.term()?);
        }
        self.expect(Tok::RParen, &format!("to close {predicate}"))?;

        Ok(Atom {
            predicate,
            location,
            args,
        })
    }

    fn term(&mut self) -> ParseResult<Term> {
        let token = self.next();
        match token.tok {
            Tok::Star => Ok(Term::Broadcast),
            Tok::Int(n) => Ok(Term::Const(Value::Int(n))),
            Tok::Str(s) => Ok(Term::Const(Value::Str(s))),
            Tok::Minus => match self.next().tok {
                Tok::Int(n) => Ok(Term::Const(Value::Int(-n))),
                _ => Err(self.error_here("expected integer after '-'")),
            },
            Tok::Ident(name) if name == "_" => Ok(Term::Wildcard),
            Tok::Ident(name) => {
                if let Some(value) = self.constants.get(&name) {
                    Ok(Term::Const(value.clone()))
                } else if is_variable(&name) {
                    Ok(Term::Var(name))
                } else {
                    Err(ParseError {
                        line: token.line,
                        column: token.column,
                        message: format!("unknown constant '{name}'"),
                    })
                }
            }
            other => Err(ParseError {
                line: token.line,
                column: token.column,
                message: format!("expected term, found {}", other.describe()),
            }),
        }
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.product()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.next();
            let rhs = self.product()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
    }

    fn product(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        while *self.peek() == Tok::Star {
            self.next();
            let rhs = self.unary()?;
            lhs = Expr::Binary(Box::new(lhs), BinOp::Mul, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if *self.peek() == Tok::Minus {
            self.next();
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if *self.peek() == Tok::LParen {
            self.next();
            let inner = self.expr()?;
            self.expect(Tok::RParen, "to close expression")?;
            return Ok(inner);
        }
        match self.term()? {
            Term::Var(name) => Ok(Expr::Var(name)),
            Term::Const(value) => Ok(Expr::Const(value)),
            Term::Wildcard | Term::Broadcast => {
                Err(self.error_here("expressions cannot use '_' or '*'"))
            }
        }
    }
}

//! Tokenizer for expression source.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    /// `'raw string'`
    RawString(String),
    /// Body of a `` `json literal` ``
    JsonLiteral(String),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Number(n) => format!("number {n}"),
            Token::RawString(_) => "string literal".to_string(),
            Token::JsonLiteral(_) => "json literal".to_string(),
            Token::Eof => "end of expression".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Bang => "!",
            _ => "",
        }
    }
}

/// Token plus the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let mut lexer = Lexer {
        src,
        chars: src.char_indices().peekable(),
    };
    let mut tokens = Vec::new();
    loop {
        let spanned = lexer.next_token()?;
        let done = spanned.token == Token::Eof;
        tokens.push(spanned);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl Lexer<'_> {
    fn next_token(&mut self) -> Result<Spanned, ExprError> {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }

        let Some((pos, c)) = self.chars.next() else {
            return Ok(Spanned {
                token: Token::Eof,
                pos: self.src.len(),
            });
        };

        let token = match c {
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '.' => Token::Dot,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '=' => self.expect_second('=', Token::EqEq, pos)?,
            '&' => self.expect_second('&', Token::AndAnd, pos)?,
            '|' => self.expect_second('|', Token::OrOr, pos)?,
            '!' => self.either('=', Token::NotEq, Token::Bang),
            '<' => self.either('=', Token::Le, Token::Lt),
            '>' => self.either('=', Token::Ge, Token::Gt),
            '\'' => Token::RawString(self.raw_string(pos)?),
            '`' => Token::JsonLiteral(self.json_literal(pos)?),
            c if c.is_ascii_digit() => Token::Number(self.number(pos)?),
            c if c.is_alphabetic() || c == '_' => Token::Ident(self.ident(pos)),
            other => {
                return Err(ExprError::Syntax {
                    pos,
                    message: format!("unexpected character '{other}'"),
                })
            }
        };
        Ok(Spanned { token, pos })
    }

    fn either(&mut self, next: char, matched: Token, otherwise: Token) -> Token {
        if matches!(self.chars.peek(), Some((_, c)) if *c == next) {
            self.chars.next();
            matched
        } else {
            otherwise
        }
    }

    fn expect_second(&mut self, next: char, token: Token, pos: usize) -> Result<Token, ExprError> {
        match self.chars.next() {
            Some((_, c)) if c == next => Ok(token),
            _ => Err(ExprError::Syntax {
                pos,
                message: format!("expected '{next}{next}'"),
            }),
        }
    }

    fn raw_string(&mut self, start: usize) -> Result<String, ExprError> {
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '\'' => return Ok(out),
                '\\' => match self.chars.next() {
                    Some((_, '\'')) => out.push('\''),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, other)) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => break,
                },
                other => out.push(other),
            }
        }
        Err(ExprError::Syntax {
            pos: start,
            message: "unterminated string literal".to_string(),
        })
    }

    fn json_literal(&mut self, start: usize) -> Result<String, ExprError> {
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '`' => return Ok(out),
                '\\' if matches!(self.chars.peek(), Some((_, '`'))) => {
                    self.chars.next();
                    out.push('`');
                }
                other => out.push(other),
            }
        }
        Err(ExprError::Syntax {
            pos: start,
            message: "unterminated json literal".to_string(),
        })
    }

    fn number(&mut self, start: usize) -> Result<f64, ExprError> {
        let mut end = start + 1;
        let mut seen_dot = false;
        while let Some(&(idx, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                end = idx + 1;
                self.chars.next();
            } else if c == '.' && !seen_dot && self.digit_follows(idx) {
                seen_dot = true;
                end = idx + 1;
                self.chars.next();
            } else {
                break;
            }
        }
        let text = &self.src[start..end];
        text.parse().map_err(|_| ExprError::Syntax {
            pos: start,
            message: format!("invalid number '{text}'"),
        })
    }

    fn digit_follows(&self, dot_idx: usize) -> bool {
        self.src[dot_idx + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    }

    fn ident(&mut self, start: usize) -> String {
        let mut end = start + self.src[start..].chars().next().map_or(1, char::len_utf8);
        while let Some(&(idx, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                end = idx + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        self.src[start..end].to_string()
    }
}

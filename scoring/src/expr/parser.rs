//! Recursive-descent parser producing [`Expr`] trees.
//!
//! Precedence, loosest first: `||`, `&&`, comparisons, `+ -`, `* /`,
//! unary `- !`, postfix `.field` / `[index]`.

use serde_json::Value;

use super::ast::{BinaryOp, Expr, Function, Root, UnaryOp};
use super::lexer::{tokenize, Spanned, Token};
use super::ExprError;

/// Nesting limit; keeps evaluation depth bounded for hostile input.
const MAX_DEPTH: usize = 64;

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    let trailing = parser.peek();
    if trailing.token != Token::Eof {
        return Err(ExprError::Syntax {
            pos: trailing.pos,
            message: format!("unexpected {}", trailing.token.describe()),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Spanned {
        // tokenize always ends with Eof, and the cursor never moves past it
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Spanned {
        let spanned = self.peek().clone();
        if spanned.token != Token::Eof {
            self.cursor += 1;
        }
        spanned
    }

    fn eat(&mut self, token: &Token) -> bool {
        if &self.peek().token == token {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExprError> {
        let next = self.advance();
        if next.token == token {
            Ok(())
        } else {
            Err(ExprError::Syntax {
                pos: next.pos,
                message: format!("expected {what}, found {}", next.token.describe()),
            })
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::Syntax {
                pos: self.peek().pos,
                message: format!("expression nested deeper than {MAX_DEPTH} levels"),
            });
        }
        let expr = self.or();
        self.depth -= 1;
        expr
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.additive()?;
        let op = match self.peek().token {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek().token {
            Token::Minus => UnaryOp::Neg,
            Token::Bang => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::Syntax {
                pos: self.peek().pos,
                message: format!("expression nested deeper than {MAX_DEPTH} levels"),
            });
        }
        let operand = self.unary();
        self.depth -= 1;
        // fold negative number literals so `-1` stays a literal
        match (op, operand?) {
            (UnaryOp::Neg, Expr::Literal(Value::Number(n))) if n.as_f64().is_some() => {
                let negated = -n.as_f64().unwrap_or_default();
                Ok(Expr::Literal(number_literal(negated)))
            }
            (op, operand) => Ok(Expr::Unary(op, Box::new(operand))),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let next = self.advance();
                match next.token {
                    Token::Ident(name) => expr = Expr::Field(Box::new(expr), name),
                    other => {
                        return Err(ExprError::Syntax {
                            pos: next.pos,
                            message: format!("expected field name, found {}", other.describe()),
                        })
                    }
                }
            } else if self.peek().token == Token::LBracket {
                let open = self.advance();
                let index = self.index_literal(open.pos)?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), index);
            } else {
                return Ok(expr);
            }
        }
    }

    fn index_literal(&mut self, open_pos: usize) -> Result<usize, ExprError> {
        let next = self.advance();
        match next.token {
            Token::Number(n) if n.fract() == 0.0 && n >= 0.0 && n <= u32::MAX as f64 => {
                Ok(n as usize)
            }
            other => Err(ExprError::Syntax {
                pos: open_pos,
                message: format!(
                    "index must be a non-negative integer literal, found {}",
                    other.describe()
                ),
            }),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let next = self.advance();
        match next.token {
            Token::Number(n) => Ok(Expr::Literal(number_literal(n))),
            Token::RawString(s) => Ok(Expr::Literal(Value::String(s))),
            Token::JsonLiteral(body) => serde_json::from_str(body.trim())
                .map(Expr::Literal)
                .map_err(|e| ExprError::Syntax {
                    pos: next.pos,
                    message: format!("invalid json literal: {e}"),
                }),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let items = self.delimited(Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Token::Ident(name) => self.identifier(name, next.pos),
            other => Err(ExprError::Syntax {
                pos: next.pos,
                message: format!("unexpected {}", other.describe()),
            }),
        }
    }

    fn identifier(&mut self, name: String, pos: usize) -> Result<Expr, ExprError> {
        if self.eat(&Token::LParen) {
            let function = Function::from_name(&name).ok_or(ExprError::UnknownFunction(name))?;
            let args = self.delimited(Token::RParen, "')'")?;
            if !function.arity().accepts(args.len()) {
                return Err(ExprError::Arity {
                    function: function.name(),
                    expected: function.arity(),
                    found: args.len(),
                });
            }
            return Ok(Expr::Call(function, args));
        }
        match name.as_str() {
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            _ => Root::from_name(&name)
                .map(Expr::Var)
                .ok_or(ExprError::UnknownVariable { name, pos }),
        }
    }

    /// Comma-separated expressions up to `close`; the opener is already consumed.
    fn delimited(&mut self, close: Token, what: &str) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        if self.eat(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(close.clone(), what)?;
            return Ok(items);
        }
    }
}

fn number_literal(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

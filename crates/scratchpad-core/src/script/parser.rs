//! Recursive-descent parser producing the pad script AST.

use super::lexer::{Pos, Tok, Token};

/// Static types of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    Unit,
    /// Produced after an error so one mistake does not cascade.
    Unknown,
}

impl Type {
    /// Type named by a declaration keyword (`int x = ...`).
    pub fn from_name(name: &str) -> Option<Type> {
        match name {
            "int" => Some(Type::Int),
            "float" => Some(Type::Float),
            "bool" => Some(Type::Bool),
            "string" => Some(Type::Str),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Type::Int => "int",
            Type::Float => "float",
            Type::Bool => "bool",
            Type::Str => "string",
            Type::Unit => "unit",
            Type::Unknown => "{unknown}",
        }
    }
}

/// A parsed source file. `tail` is a trailing expression without `;`.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub stmts: Vec<Stmt>,
    pub tail: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let {
        name: String,
        ty: Option<Type>,
        value: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Throw(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Var(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call {
        module: Option<String>,
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// A syntax error with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub pos: Pos,
}

type PResult<T> = Result<T, ParseError>;

/// Deepest nesting of blocks and subexpressions accepted. The checker and
/// interpreter recurse over the tree, so this bounds their stack use too.
pub const MAX_NESTING: usize = 256;

/// Parse a token stream ending in [`Tok::Eof`].
pub fn parse(tokens: Vec<Token>) -> PResult<Program> {
    let mut parser = Parser {
        tokens,
        at: 0,
        depth: 0,
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.at + offset).min(self.tokens.len().saturating_sub(1));
        self.tokens.get(idx).map_or(&Tok::Eof, |t| &t.tok)
    }

    fn pos(&self) -> Pos {
        let idx = self.at.min(self.tokens.len().saturating_sub(1));
        self.tokens
            .get(idx)
            .map_or(Pos { line: 1, column: 1 }, |t| t.pos)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.at < self.tokens.len() {
            self.at += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> PResult<T> {
        Err(ParseError {
            message: message.into(),
            pos: self.pos(),
        })
    }

    fn expect(&mut self, tok: Tok) -> PResult<()> {
        if self.eat(&tok) {
            Ok(())
        } else {
            self.error(format!("expected {}, found {}", tok, self.peek()))
        }
    }

    /// Run `f` one nesting level deeper, failing at [`MAX_NESTING`].
    fn nested<T>(&mut self, what: &str, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return self.error(format!("{} nested too deeply", what));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn ident(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => self.error(format!("expected identifier, found {}", other)),
        }
    }

    fn program(&mut self) -> PResult<Program> {
        let mut stmts = Vec::new();
        loop {
            if *self.peek() == Tok::Eof {
                return Ok(Program { stmts, tail: None });
            }
            if let Some(tail) = self.statement(&mut stmts, true)? {
                return Ok(Program {
                    stmts,
                    tail: Some(tail),
                });
            }
        }
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.nested("block", Self::block_body)
    }

    fn block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(Tok::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(&Tok::RBrace) {
            if *self.peek() == Tok::Eof {
                return self.error("expected `}`, found end of input");
            }
            self.statement(&mut stmts, false)?;
        }
        Ok(stmts)
    }

    /// Parse one statement into `out`. At top level an expression followed
    /// by end of input is returned as the program's tail instead.
    fn statement(&mut self, out: &mut Vec<Stmt>, top_level: bool) -> PResult<Option<Expr>> {
        let pos = self.pos();
        let kind = match self.peek().clone() {
            Tok::Let => {
                self.advance();
                let name = self.ident()?;
                let ty = if self.eat(&Tok::Colon) {
                    let ty_name = self.ident()?;
                    match Type::from_name(&ty_name) {
                        Some(ty) => Some(ty),
                        None => return self.error(format!("unknown type `{}`", ty_name)),
                    }
                } else {
                    None
                };
                self.expect(Tok::Assign)?;
                let value = self.expr()?;
                self.expect(Tok::Semi)?;
                StmtKind::Let { name, ty, value }
            }
            Tok::Ident(ty_name)
                if Type::from_name(&ty_name).is_some()
                    && matches!(self.peek_at(1), Tok::Ident(_)) =>
            {
                self.advance();
                let name = self.ident()?;
                self.expect(Tok::Assign)?;
                let value = self.expr()?;
                self.expect(Tok::Semi)?;
                StmtKind::Let {
                    name,
                    ty: Type::from_name(&ty_name),
                    value,
                }
            }
            Tok::Ident(name) if *self.peek_at(1) == Tok::Assign => {
                self.advance();
                self.advance();
                let value = self.expr()?;
                self.expect(Tok::Semi)?;
                StmtKind::Assign { name, value }
            }
            Tok::If => self.if_stmt()?,
            Tok::For => {
                self.advance();
                let var = self.ident()?;
                self.expect(Tok::In)?;
                let start = self.expr()?;
                self.expect(Tok::DotDot)?;
                let end = self.expr()?;
                let body = self.block()?;
                StmtKind::For {
                    var,
                    start,
                    end,
                    body,
                }
            }
            Tok::While => {
                self.advance();
                let cond = self.expr()?;
                let body = self.block()?;
                StmtKind::While { cond, body }
            }
            Tok::Throw => {
                self.advance();
                let value = self.expr()?;
                self.expect(Tok::Semi)?;
                StmtKind::Throw(value)
            }
            _ => {
                let expr = self.expr()?;
                if self.eat(&Tok::Semi) {
                    StmtKind::Expr(expr)
                } else if top_level && *self.peek() == Tok::Eof {
                    return Ok(Some(expr));
                } else if !top_level && *self.peek() == Tok::RBrace {
                    StmtKind::Expr(expr)
                } else {
                    return self.error(format!("expected `;`, found {}", self.peek()));
                }
            }
        };

        out.push(Stmt { kind, pos });
        Ok(None)
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.expect(Tok::If)?;
        let cond = self.expr()?;
        let then = self.block()?;
        let otherwise = if self.eat(&Tok::Else) {
            if *self.peek() == Tok::If {
                let pos = self.pos();
                vec![Stmt {
                    kind: self.nested("block", Self::if_stmt)?,
                    pos,
                }]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(StmtKind::If {
            cond,
            then,
            otherwise,
        })
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.nested("expression", |p| p.binary(0))
    }

    /// Precedence climbing over the binary operator table.
    fn binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        // Each operator in a chain adds a level to the left operand.
        let entered = self.depth;
        while let Some((op, prec)) = binary_op(self.peek()) {
            if prec < min_prec {
                break;
            }
            if self.depth >= MAX_NESTING {
                return self.error("expression nested too deeply");
            }
            self.depth += 1;
            let pos = self.pos();
            self.advance();
            let rhs = self.binary(prec + 1)?;
            lhs = Expr {
                kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
                pos,
            };
        }
        self.depth = entered;
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let op = match self.peek() {
            Tok::Minus => UnOp::Neg,
            Tok::Bang => UnOp::Not,
            _ => return self.primary(),
        };
        self.advance();
        let operand = self.nested("expression", Self::unary)?;
        Ok(Expr {
            kind: ExprKind::Unary(op, Box::new(operand)),
            pos,
        })
    }

    fn primary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let kind = match self.advance() {
            Tok::Int(n) => ExprKind::Int(n),
            Tok::Float(n) => ExprKind::Float(n),
            Tok::Str(s) => ExprKind::Str(s),
            Tok::True => ExprKind::Bool(true),
            Tok::False => ExprKind::Bool(false),
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                return Ok(inner);
            }
            Tok::Ident(name) => {
                if self.eat(&Tok::Dot) {
                    let func = self.ident()?;
                    if *self.peek() != Tok::LParen {
                        return self.error(format!("expected `(` after `{}.{}`", name, func));
                    }
                    ExprKind::Call {
                        module: Some(name),
                        name: func,
                        args: self.args()?,
                    }
                } else if *self.peek() == Tok::LParen {
                    ExprKind::Call {
                        module: None,
                        name,
                        args: self.args()?,
                    }
                } else {
                    ExprKind::Var(name)
                }
            }
            other => {
                return Err(ParseError {
                    message: format!("expected expression, found {}", other),
                    pos,
                });
            }
        };
        Ok(Expr { kind, pos })
    }

    fn args(&mut self) -> PResult<Vec<Expr>> {
        self.expect(Tok::LParen)?;
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Tok::RParen) {
                return Ok(args);
            }
            self.expect(Tok::Comma)?;
        }
    }
}

fn binary_op(tok: &Tok) -> Option<(BinOp, u8)> {
    let op = match tok {
        Tok::OrOr => (BinOp::Or, 1),
        Tok::AndAnd => (BinOp::And, 2),
        Tok::EqEq => (BinOp::Eq, 3),
        Tok::NotEq => (BinOp::Ne, 3),
        Tok::Lt => (BinOp::Lt, 4),
        Tok::Le => (BinOp::Le, 4),
        Tok::Gt => (BinOp::Gt, 4),
        Tok::Ge => (BinOp::Ge, 4),
        Tok::Plus => (BinOp::Add, 5),
        Tok::Minus => (BinOp::Sub, 5),
        Tok::Star => (BinOp::Mul, 6),
        Tok::Slash => (BinOp::Div, 6),
        Tok::Percent => (BinOp::Rem, 6),
        _ => return None,
    };
    Some(op)
}

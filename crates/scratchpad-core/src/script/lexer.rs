//! Tokenizer for pad scripts.

use std::fmt;

/// A position in source text (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Let,
    If,
    Else,
    For,
    In,
    While,
    Throw,
    True,
    False,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Colon,
    Dot,
    DotDot,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub pos: Pos,
}

/// A lexical error with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub pos: Pos,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Tok::Int(n) => return write!(f, "`{}`", n),
            Tok::Float(n) => return write!(f, "`{}`", n),
            Tok::Str(_) => "string literal",
            Tok::Ident(name) => return write!(f, "`{}`", name),
            Tok::Let => "`let`",
            Tok::If => "`if`",
            Tok::Else => "`else`",
            Tok::For => "`for`",
            Tok::In => "`in`",
            Tok::While => "`while`",
            Tok::Throw => "`throw`",
            Tok::True => "`true`",
            Tok::False => "`false`",
            Tok::Plus => "`+`",
            Tok::Minus => "`-`",
            Tok::Star => "`*`",
            Tok::Slash => "`/`",
            Tok::Percent => "`%`",
            Tok::EqEq => "`==`",
            Tok::NotEq => "`!=`",
            Tok::Lt => "`<`",
            Tok::Le => "`<=`",
            Tok::Gt => "`>`",
            Tok::Ge => "`>=`",
            Tok::AndAnd => "`&&`",
            Tok::OrOr => "`||`",
            Tok::Bang => "`!`",
            Tok::Assign => "`=`",
            Tok::LParen => "`(`",
            Tok::RParen => "`)`",
            Tok::LBrace => "`{`",
            Tok::RBrace => "`}`",
            Tok::Comma => "`,`",
            Tok::Semi => "`;`",
            Tok::Colon => "`:`",
            Tok::Dot => "`.`",
            Tok::DotDot => "`..`",
            Tok::Eof => "end of input",
        };
        f.write_str(text)
    }
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
}

impl Cursor<'_> {
    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
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

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }
}

/// Split source text into tokens, ending with [`Tok::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut cursor = Cursor {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();

    loop {
        while cursor.peek().is_some_and(char::is_whitespace) {
            cursor.bump();
        }

        let pos = cursor.pos();
        let Some(c) = cursor.bump() else {
            tokens.push(Token { tok: Tok::Eof, pos });
            return Ok(tokens);
        };

        let tok = match c {
            '/' if cursor.peek() == Some('/') => {
                while cursor.peek().is_some_and(|c| c != '\n') {
                    cursor.bump();
                }
                continue;
            }
            '0'..='9' => number(&mut cursor, c, pos)?,
            '"' => string(&mut cursor, pos)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(next) = cursor.peek() {
                    if !(next.is_alphanumeric() || next == '_') {
                        break;
                    }
                    ident.push(next);
                    cursor.bump();
                }
                keyword(ident)
            }
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            ',' => Tok::Comma,
            ';' => Tok::Semi,
            ':' => Tok::Colon,
            '.' if cursor.eat('.') => Tok::DotDot,
            '.' => Tok::Dot,
            '=' if cursor.eat('=') => Tok::EqEq,
            '=' => Tok::Assign,
            '!' if cursor.eat('=') => Tok::NotEq,
            '!' => Tok::Bang,
            '<' if cursor.eat('=') => Tok::Le,
            '<' => Tok::Lt,
            '>' if cursor.eat('=') => Tok::Ge,
            '>' => Tok::Gt,
            '&' if cursor.eat('&') => Tok::AndAnd,
            '|' if cursor.eat('|') => Tok::OrOr,
            other => {
                return Err(LexError {
                    message: format!("unexpected character `{}`", other),
                    pos,
                });
            }
        };

        tokens.push(Token { tok, pos });
    }
}

fn keyword(ident: String) -> Tok {
    match ident.as_str() {
        "let" => Tok::Let,
        "if" => Tok::If,
        "else" => Tok::Else,
        "for" => Tok::For,
        "in" => Tok::In,
        "while" => Tok::While,
        "throw" => Tok::Throw,
        "true" => Tok::True,
        "false" => Tok::False,
        _ => Tok::Ident(ident),
    }
}

fn number(cursor: &mut Cursor<'_>, first: char, pos: Pos) -> Result<Tok, LexError> {
    let mut text = String::from(first);
    while let Some(c) = cursor.peek().filter(char::is_ascii_digit) {
        text.push(c);
        cursor.bump();
    }

    // `1..5` is a range, `1.5` is a float.
    let mut lookahead = cursor.chars.clone();
    let is_float =
        lookahead.next() == Some('.') && lookahead.next().is_some_and(|c| c.is_ascii_digit());

    if is_float {
        text.push('.');
        cursor.bump();
        while let Some(c) = cursor.peek().filter(char::is_ascii_digit) {
            text.push(c);
            cursor.bump();
        }
        return text.parse().map(Tok::Float).map_err(|_| LexError {
            message: format!("invalid float literal `{}`", text),
            pos,
        });
    }

    text.parse().map(Tok::Int).map_err(|_| LexError {
        message: format!("integer literal `{}` is out of range", text),
        pos,
    })
}

fn string(cursor: &mut Cursor<'_>, pos: Pos) -> Result<Tok, LexError> {
    let mut text = String::new();
    loop {
        match cursor.bump() {
            Some('"') => return Ok(Tok::Str(text)),
            Some('\\') => match cursor.bump() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('"') => text.push('"'),
                Some('\\') => text.push('\\'),
                Some(other) => {
                    return Err(LexError {
                        message: format!("unknown escape `\\{}`", other),
                        pos: cursor.pos(),
                    });
                }
                None => break,
            },
            Some(c) => text.push(c),
            None => break,
        }
    }

    Err(LexError {
        message: "unterminated string literal".to_string(),
        pos,
    })
}

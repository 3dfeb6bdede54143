//! Tree-walking interpreter for checked programs.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::check::op_symbol;
use super::lexer::Pos;
use super::parser::{BinOp, Expr, ExprKind, Program, Stmt, StmtKind, Type, UnOp};
use crate::batch::DumpContext;
use crate::dump::{DumpEvent, ErrorRecord, Location, RenderedValue};

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Unit,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Unit => "unit",
        }
    }

    pub fn render(&self) -> RenderedValue {
        RenderedValue {
            type_name: self.type_name().to_string(),
            text: self.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => f.write_str(s),
            Value::Unit => f.write_str("()"),
        }
    }
}

/// An exception raised while running a script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub kind: &'static str,
    pub message: String,
    pub location: Option<Location>,
}

impl ScriptError {
    pub fn into_record(self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind.to_string(),
            message: self.message,
            location: self.location,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ScriptError {}

type EvalResult<T> = Result<T, ScriptError>;

pub struct Interpreter<'a> {
    scopes: Vec<HashMap<String, Value>>,
    ctx: &'a DumpContext,
    source: Option<String>,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: &'a DumpContext) -> Self {
        Self {
            scopes: vec![HashMap::new()],
            ctx,
            source: None,
        }
    }

    /// Run a program in the shared global scope and return its tail value.
    pub fn run(&mut self, program: &Program, source: Option<&str>) -> EvalResult<Value> {
        self.source = source.map(str::to_string);
        self.stmts(&program.stmts)?;
        match &program.tail {
            Some(tail) => self.expr(tail),
            None => Ok(Value::Unit),
        }
    }

    fn fail<T>(&self, kind: &'static str, message: impl Into<String>, pos: Pos) -> EvalResult<T> {
        Err(ScriptError {
            kind,
            message: message.into(),
            location: Some(Location {
                source: self.source.clone(),
                line: pos.line,
                column: pos.column,
            }),
        })
    }

    fn lookup(&self, name: &str, pos: Pos) -> EvalResult<Value> {
        match self.scopes.iter().rev().find_map(|scope| scope.get(name)) {
            Some(value) => Ok(value.clone()),
            None => self.fail("UnknownVariable", format!("`{}` is not defined", name), pos),
        }
    }

    fn assign(&mut self, name: &str, value: Value, pos: Pos) -> EvalResult<()> {
        match self
            .scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
        {
            Some(slot) => {
                *slot = coerce(slot, value);
                Ok(())
            }
            None => self.fail("UnknownVariable", format!("`{}` is not defined", name), pos),
        }
    }

    fn declare(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn scoped(&mut self, binding: Option<(&str, Value)>, stmts: &[Stmt]) -> EvalResult<()> {
        self.scopes.push(HashMap::new());
        if let Some((name, value)) = binding {
            self.declare(name, value);
        }
        let result = self.stmts(stmts);
        self.scopes.pop();
        result
    }

    fn stmts(&mut self, stmts: &[Stmt]) -> EvalResult<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn condition(&mut self, cond: &Expr) -> EvalResult<bool> {
        match self.expr(cond)? {
            Value::Bool(b) => Ok(b),
            other => self.fail(
                "TypeError",
                format!("condition must be `bool`, found `{}`", other.type_name()),
                cond.pos,
            ),
        }
    }

    fn int(&mut self, expr: &Expr) -> EvalResult<i64> {
        match self.expr(expr)? {
            Value::Int(n) => Ok(n),
            other => self.fail(
                "TypeError",
                format!("expected `int`, found `{}`", other.type_name()),
                expr.pos,
            ),
        }
    }

    fn stmt(&mut self, stmt: &Stmt) -> EvalResult<()> {
        match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                let mut value = self.expr(value)?;
                if let (Some(Type::Float), Value::Int(n)) = (ty, &value) {
                    value = Value::Float(*n as f64);
                }
                self.declare(name, value);
            }
            StmtKind::Assign { name, value } => {
                let value = self.expr(value)?;
                self.assign(name, value, stmt.pos)?;
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                if self.condition(cond)? {
                    self.scoped(None, then)?;
                } else {
                    self.scoped(None, otherwise)?;
                }
            }
            StmtKind::For {
                var,
                start,
                end,
                body,
            } => {
                let start = self.int(start)?;
                let end = self.int(end)?;
                for i in start..end {
                    self.scoped(Some((var.as_str(), Value::Int(i))), body)?;
                }
            }
            StmtKind::While { cond, body } => {
                while self.condition(cond)? {
                    self.scoped(None, body)?;
                }
            }
            StmtKind::Throw(value) => {
                let value = self.expr(value)?;
                return self.fail("Thrown", value.to_string(), stmt.pos);
            }
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> EvalResult<Value> {
        match &expr.kind {
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(n) => Ok(Value::Float(*n)),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Var(name) => self.lookup(name, expr.pos),
            ExprKind::Unary(op, operand) => {
                let value = self.expr(operand)?;
                match (op, value) {
                    (UnOp::Neg, Value::Int(n)) => match n.checked_neg() {
                        Some(n) => Ok(Value::Int(n)),
                        None => self.fail("Overflow", "attempt to negate with overflow", expr.pos),
                    },
                    (UnOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
                    (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (_, other) => self.fail(
                        "TypeError",
                        format!("invalid operand of type `{}`", other.type_name()),
                        expr.pos,
                    ),
                }
            }
            ExprKind::Binary(BinOp::And, lhs, rhs) => {
                Ok(Value::Bool(self.condition(lhs)? && self.condition(rhs)?))
            }
            ExprKind::Binary(BinOp::Or, lhs, rhs) => {
                Ok(Value::Bool(self.condition(lhs)? || self.condition(rhs)?))
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.expr(lhs)?;
                let r = self.expr(rhs)?;
                self.binary(*op, l, r, expr.pos)
            }
            ExprKind::Call { module, name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expr(arg)?);
                }
                match module {
                    None => self.builtin(name, values, expr.pos),
                    Some(module) => self.module_call(module, name, values, expr.pos),
                }
            }
        }
    }

    fn binary(&self, op: BinOp, l: Value, r: Value, pos: Pos) -> EvalResult<Value> {
        use Value::*;

        let overflow = |this: &Self| {
            this.fail::<Value>(
                "Overflow",
                format!("attempt to apply `{}` with overflow", op_symbol(op)),
                pos,
            )
        };

        match (op, &l, &r) {
            (BinOp::Add, Str(_), _) | (BinOp::Add, _, Str(_)) => Ok(Str(format!("{}{}", l, r))),
            (BinOp::Div | BinOp::Rem, Int(_), Int(0)) => {
                self.fail("DivideByZero", "attempt to divide by zero", pos)
            }
            (BinOp::Add, Int(a), Int(b)) => {
                a.checked_add(*b).map(Int).map_or_else(|| overflow(self), Ok)
            }
            (BinOp::Sub, Int(a), Int(b)) => {
                a.checked_sub(*b).map(Int).map_or_else(|| overflow(self), Ok)
            }
            (BinOp::Mul, Int(a), Int(b)) => {
                a.checked_mul(*b).map(Int).map_or_else(|| overflow(self), Ok)
            }
            (BinOp::Div, Int(a), Int(b)) => {
                a.checked_div(*b).map(Int).map_or_else(|| overflow(self), Ok)
            }
            (BinOp::Rem, Int(a), Int(b)) => {
                a.checked_rem(*b).map(Int).map_or_else(|| overflow(self), Ok)
            }
            (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Int(a), Int(b)) => {
                Ok(Bool(compare(op, a.cmp(b))))
            }
            (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Str(a), Str(b)) => {
                Ok(Bool(compare(op, a.cmp(b))))
            }
            (BinOp::Eq, Int(a), Int(b)) => Ok(Bool(a == b)),
            (BinOp::Ne, Int(a), Int(b)) => Ok(Bool(a != b)),
            (BinOp::Eq | BinOp::Ne, Float(_) | Int(_), Float(_) | Int(_)) => {
                let equal = l.as_f64() == r.as_f64();
                Ok(Bool(if op == BinOp::Eq { equal } else { !equal }))
            }
            (BinOp::Eq, _, _) if l.type_name() == r.type_name() => Ok(Bool(l == r)),
            (BinOp::Ne, _, _) if l.type_name() == r.type_name() => Ok(Bool(l != r)),
            _ => match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => match op {
                    BinOp::Add => Ok(Float(a + b)),
                    BinOp::Sub => Ok(Float(a - b)),
                    BinOp::Mul => Ok(Float(a * b)),
                    BinOp::Div => Ok(Float(a / b)),
                    BinOp::Rem => Ok(Float(a % b)),
                    BinOp::Lt => Ok(Bool(a < b)),
                    BinOp::Le => Ok(Bool(a <= b)),
                    BinOp::Gt => Ok(Bool(a > b)),
                    BinOp::Ge => Ok(Bool(a >= b)),
                    _ => self.mismatch(op, &l, &r, pos),
                },
                _ => self.mismatch(op, &l, &r, pos),
            },
        }
    }

    fn mismatch(&self, op: BinOp, l: &Value, r: &Value, pos: Pos) -> EvalResult<Value> {
        self.fail(
            "TypeError",
            format!(
                "cannot apply `{}` to `{}` and `{}`",
                op_symbol(op),
                l.type_name(),
                r.type_name()
            ),
            pos,
        )
    }

    fn builtin(&mut self, name: &str, args: Vec<Value>, pos: Pos) -> EvalResult<Value> {
        let mut args = args.into_iter();
        match (name, args.next(), args.next()) {
            ("dump", Some(value), header) => {
                let rendered = value.render();
                let mut event = DumpEvent::value(rendered.type_name, rendered.text);
                if let Some(header) = header {
                    event = event.with_header(header.to_string());
                }
                self.ctx.emit(event);
                Ok(Value::Unit)
            }
            ("sleep", Some(Value::Int(ms)), None) => {
                std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
                Ok(Value::Unit)
            }
            ("abort", None, None) => {
                tracing::error!("Script requested abort");
                std::process::abort()
            }
            ("str", Some(value), None) => Ok(Value::Str(value.to_string())),
            _ => self.fail("TypeError", format!("invalid call to `{}`", name), pos),
        }
    }

    fn module_call(
        &mut self,
        module: &str,
        name: &str,
        args: Vec<Value>,
        pos: Pos,
    ) -> EvalResult<Value> {
        match (module, name, args.as_slice()) {
            ("math", "abs", [Value::Int(n)]) => match n.checked_abs() {
                Some(n) => Ok(Value::Int(n)),
                None => self.fail("Overflow", "attempt to take abs with overflow", pos),
            },
            ("math", "abs", [Value::Float(n)]) => Ok(Value::Float(n.abs())),
            ("math", "min", [Value::Int(a), Value::Int(b)]) => Ok(Value::Int(*a.min(b))),
            ("math", "max", [Value::Int(a), Value::Int(b)]) => Ok(Value::Int(*a.max(b))),
            ("math", "min" | "max" | "pow", [a, b]) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(match name {
                    "min" => a.min(b),
                    "max" => a.max(b),
                    _ => a.powf(b),
                })),
                _ => self.fail("TypeError", format!("invalid call to `math.{}`", name), pos),
            },
            ("math", "sqrt", [n]) => match n.as_f64() {
                Some(n) => Ok(Value::Float(n.sqrt())),
                None => self.fail("TypeError", "invalid call to `math.sqrt`", pos),
            },
            ("text", "len", [Value::Str(s)]) => Ok(Value::Int(s.chars().count() as i64)),
            ("text", "upper", [Value::Str(s)]) => Ok(Value::Str(s.to_uppercase())),
            ("text", "lower", [Value::Str(s)]) => Ok(Value::Str(s.to_lowercase())),
            _ => self.fail(
                "TypeError",
                format!("invalid call to `{}.{}`", module, name),
                pos,
            ),
        }
    }
}

/// Keep a float binding a float when an int is assigned into it.
fn coerce(current: &Value, value: Value) -> Value {
    match (current, value) {
        (Value::Float(_), Value::Int(n)) => Value::Float(n as f64),
        (_, value) => value,
    }
}

fn compare(op: BinOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinOp::Lt => ordering == Less,
        BinOp::Le => ordering != Greater,
        BinOp::Gt => ordering == Greater,
        BinOp::Ge => ordering != Less,
        _ => false,
    }
}

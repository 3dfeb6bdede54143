//! Static checking: name resolution, types, and import gating.

use std::collections::HashMap;

use super::lexer::Pos;
use super::parser::{BinOp, Expr, ExprKind, Program, Stmt, StmtKind, Type, UnOp};
use super::MODULES;
use crate::dump::{DiagnosticRecord, Location};

pub struct Checker<'a> {
    imports: &'a [String],
    scopes: Vec<HashMap<String, Type>>,
    source: Option<String>,
    diagnostics: Vec<DiagnosticRecord>,
}

impl<'a> Checker<'a> {
    pub fn new(imports: &'a [String]) -> Self {
        Self {
            imports,
            scopes: vec![HashMap::new()],
            source: None,
            diagnostics: Vec::new(),
        }
    }

    /// Check one program. Top-level bindings stay visible to later programs.
    pub fn check_program(&mut self, program: &Program, source: Option<&str>) {
        self.source = source.map(str::to_string);
        for stmt in &program.stmts {
            self.stmt(stmt);
        }
        if let Some(tail) = &program.tail {
            self.expr(tail);
        }
    }

    pub fn finish(self) -> Vec<DiagnosticRecord> {
        self.diagnostics
    }

    fn error(&mut self, message: impl Into<String>, pos: Pos) {
        let location = Location {
            source: self.source.clone(),
            line: pos.line,
            column: pos.column,
        };
        self.diagnostics
            .push(DiagnosticRecord::error(message, Some(location)));
    }

    fn lookup(&self, name: &str) -> Option<Type> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn declare(&mut self, name: &str, ty: Type) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    fn scoped(&mut self, bindings: &[(&str, Type)], stmts: &[Stmt]) {
        self.scopes.push(HashMap::new());
        for (name, ty) in bindings {
            self.declare(name, *ty);
        }
        for stmt in stmts {
            self.stmt(stmt);
        }
        self.scopes.pop();
    }

    fn expect(&mut self, actual: Type, expected: Type, what: &str, pos: Pos) {
        if !assignable(expected, actual) {
            self.error(
                format!(
                    "{} must be of type `{}`, found `{}`",
                    what,
                    expected.name(),
                    actual.name()
                ),
                pos,
            );
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                let actual = self.expr(value);
                if actual == Type::Unit {
                    self.error(
                        format!("`{}` cannot be bound to a value of type `unit`", name),
                        value.pos,
                    );
                }
                let bound = match ty {
                    Some(declared) => {
                        if !assignable(*declared, actual) {
                            self.error(mismatch(actual, name, *declared), value.pos);
                        }
                        *declared
                    }
                    None => actual,
                };
                self.declare(name, bound);
            }
            StmtKind::Assign { name, value } => {
                let actual = self.expr(value);
                match self.lookup(name) {
                    Some(declared) if !assignable(declared, actual) => {
                        self.error(mismatch(actual, name, declared), value.pos)
                    }
                    Some(_) => {}
                    None => self.error(
                        format!("cannot assign to undeclared variable `{}`", name),
                        stmt.pos,
                    ),
                }
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                let ty = self.expr(cond);
                self.expect(ty, Type::Bool, "`if` condition", cond.pos);
                self.scoped(&[], then);
                self.scoped(&[], otherwise);
            }
            StmtKind::For {
                var,
                start,
                end,
                body,
            } => {
                let start_ty = self.expr(start);
                self.expect(start_ty, Type::Int, "range start", start.pos);
                let end_ty = self.expr(end);
                self.expect(end_ty, Type::Int, "range end", end.pos);
                self.scoped(&[(var.as_str(), Type::Int)], body);
            }
            StmtKind::While { cond, body } => {
                let ty = self.expr(cond);
                self.expect(ty, Type::Bool, "`while` condition", cond.pos);
                self.scoped(&[], body);
            }
            StmtKind::Throw(value) => {
                self.expr(value);
            }
            StmtKind::Expr(expr) => {
                self.expr(expr);
            }
        }
    }

    fn expr(&mut self, expr: &Expr) -> Type {
        match &expr.kind {
            ExprKind::Int(_) => Type::Int,
            ExprKind::Float(_) => Type::Float,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Str(_) => Type::Str,
            ExprKind::Var(name) => match self.lookup(name) {
                Some(ty) => ty,
                None => {
                    self.error(format!("cannot find value `{}` in this scope", name), expr.pos);
                    Type::Unknown
                }
            },
            ExprKind::Unary(op, operand) => {
                let ty = self.expr(operand);
                match (op, ty) {
                    (_, Type::Unknown) => Type::Unknown,
                    (UnOp::Neg, Type::Int | Type::Float) => ty,
                    (UnOp::Not, Type::Bool) => Type::Bool,
                    (UnOp::Neg, _) => {
                        let message = format!("cannot negate a value of type `{}`", ty.name());
                        self.error(message, expr.pos);
                        Type::Unknown
                    }
                    (UnOp::Not, _) => {
                        let message =
                            format!("cannot apply `!` to a value of type `{}`", ty.name());
                        self.error(message, expr.pos);
                        Type::Unknown
                    }
                }
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.expr(lhs);
                let r = self.expr(rhs);
                match binary_type(*op, l, r) {
                    Some(ty) => ty,
                    None => {
                        self.error(
                            format!(
                                "cannot apply `{}` to `{}` and `{}`",
                                op_symbol(*op),
                                l.name(),
                                r.name()
                            ),
                            expr.pos,
                        );
                        Type::Unknown
                    }
                }
            }
            ExprKind::Call { module, name, args } => {
                let arg_types: Vec<Type> = args.iter().map(|arg| self.expr(arg)).collect();
                match module {
                    None => self.builtin(name, &arg_types, expr.pos),
                    Some(module) => self.module_call(module, name, &arg_types, expr.pos),
                }
            }
        }
    }

    fn arity(
        &mut self,
        name: &str,
        args: &[Type],
        range: std::ops::RangeInclusive<usize>,
        pos: Pos,
    ) -> bool {
        if range.contains(&args.len()) {
            return true;
        }
        let expected = if range.start() == range.end() {
            range.start().to_string()
        } else {
            format!("{} to {}", range.start(), range.end())
        };
        self.error(
            format!("`{}` takes {} argument(s) but {} were supplied", name, expected, args.len()),
            pos,
        );
        false
    }

    fn numeric(&mut self, name: &str, ty: Type, pos: Pos) {
        if !matches!(ty, Type::Int | Type::Float | Type::Unknown) {
            self.error(format!("`{}` expects a number, found `{}`", name, ty.name()), pos);
        }
    }

    fn builtin(&mut self, name: &str, args: &[Type], pos: Pos) -> Type {
        match name {
            "dump" => {
                if self.arity(name, args, 1..=2, pos) {
                    if args[0] == Type::Unit {
                        self.error("cannot dump a value of type `unit`", pos);
                    }
                    if let Some(header) = args.get(1) {
                        self.expect(*header, Type::Str, "dump header", pos);
                    }
                }
                Type::Unit
            }
            "sleep" => {
                if self.arity(name, args, 1..=1, pos) {
                    self.expect(args[0], Type::Int, "sleep duration", pos);
                }
                Type::Unit
            }
            "abort" => {
                self.arity(name, args, 0..=0, pos);
                Type::Unit
            }
            "str" => {
                self.arity(name, args, 1..=1, pos);
                Type::Str
            }
            _ => {
                self.error(format!("cannot find function `{}` in this scope", name), pos);
                Type::Unknown
            }
        }
    }

    fn module_call(&mut self, module: &str, name: &str, args: &[Type], pos: Pos) -> Type {
        if !MODULES.contains(&module) {
            self.error(format!("unknown module `{}`", module), pos);
            return Type::Unknown;
        }
        if !self.imports.iter().any(|import| import == module) {
            self.error(
                format!("module `{}` is not imported; add it to the imports", module),
                pos,
            );
            return Type::Unknown;
        }

        let qualified = format!("{}.{}", module, name);
        match (module, name) {
            ("math", "abs") => {
                if !self.arity(&qualified, args, 1..=1, pos) {
                    return Type::Unknown;
                }
                self.numeric(&qualified, args[0], pos);
                args[0]
            }
            ("math", "min" | "max") => {
                if !self.arity(&qualified, args, 2..=2, pos) {
                    return Type::Unknown;
                }
                self.numeric(&qualified, args[0], pos);
                self.numeric(&qualified, args[1], pos);
                binary_type(BinOp::Sub, args[0], args[1]).unwrap_or(Type::Unknown)
            }
            ("math", "pow") => {
                if self.arity(&qualified, args, 2..=2, pos) {
                    self.numeric(&qualified, args[0], pos);
                    self.numeric(&qualified, args[1], pos);
                }
                Type::Float
            }
            ("math", "sqrt") => {
                if self.arity(&qualified, args, 1..=1, pos) {
                    self.numeric(&qualified, args[0], pos);
                }
                Type::Float
            }
            ("text", "len") => {
                if self.arity(&qualified, args, 1..=1, pos) {
                    self.expect(args[0], Type::Str, "`text.len` argument", pos);
                }
                Type::Int
            }
            ("text", "upper" | "lower") => {
                if self.arity(&qualified, args, 1..=1, pos) {
                    self.expect(args[0], Type::Str, "`text` argument", pos);
                }
                Type::Str
            }
            _ => {
                self.error(format!("module `{}` has no function `{}`", module, name), pos);
                Type::Unknown
            }
        }
    }
}

/// Whether a value of type `from` can be stored where `to` is expected.
fn assignable(to: Type, from: Type) -> bool {
    to == from
        || to == Type::Unknown
        || from == Type::Unknown
        || (to == Type::Float && from == Type::Int)
}

fn mismatch(actual: Type, name: &str, declared: Type) -> String {
    format!(
        "mismatched types: cannot assign a value of type `{}` to `{}` of type `{}`",
        actual.name(),
        name,
        declared.name()
    )
}

fn binary_type(op: BinOp, l: Type, r: Type) -> Option<Type> {
    use Type::*;

    if l == Unknown || r == Unknown {
        return Some(match op {
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => Bool,
            BinOp::And | BinOp::Or => Bool,
            _ => Unknown,
        });
    }
    if l == Unit || r == Unit {
        return None;
    }

    let numeric = |l: Type, r: Type| match (l, r) {
        (Int, Int) => Some(Int),
        (Int | Float, Int | Float) => Some(Float),
        _ => None,
    };

    match op {
        BinOp::Add if l == Str || r == Str => Some(Str),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => numeric(l, r),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            (numeric(l, r).is_some() || (l == Str && r == Str)).then_some(Bool)
        }
        BinOp::Eq | BinOp::Ne => (l == r || numeric(l, r).is_some()).then_some(Bool),
        BinOp::And | BinOp::Or => (l == Bool && r == Bool).then_some(Bool),
    }
}

pub(crate) fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

//! Recursive-descent parser from tokens to the syntax tree.

use std::sync::Arc;

use crate::ast::{
    Arg, BinOp, BoolOp, CmpOp, Comprehension, Expr, ExprKind, FStringPart, FunctionDef, Handler,
    Literal, Param, Stmt, StmtKind, Target, UnaryOp,
};
use crate::error::{ParseResult, SyntaxError};
use crate::lexer::{Token, TokenKind, tokenize};
use crate::stack::guarded;

/// Deepest bracket, operator or block nesting a snippet may use.
pub(crate) const MAX_NESTING: usize = 200;

const NESTED_BRACKETS: &str = "too many nested parentheses";
const NESTED_OPERATORS: &str = "expression is too deeply nested";
const NESTED_BLOCKS: &str = "too many levels of indentation";

const KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Parses a whole snippet into statements.
pub(crate) fn parse_program(source: &str) -> ParseResult<Vec<Stmt>> {
    let mut parser = Parser::new(tokenize(source)?, 0);
    parser.async_depth.push(true);
    let mut body = Vec::new();
    while !parser.at(&TokenKind::Eof) {
        body.extend(parser.statement()?);
    }
    Ok(body)
}

fn parse_embedded_expression(source: &str, line: usize) -> ParseResult<Expr> {
    let mut parser = Parser::new(tokenize(source)?, line.saturating_sub(1));
    parser.async_depth.push(true);
    let expr = parser.testlist()?;
    parser.eat_newlines();
    if !parser.at(&TokenKind::Eof) {
        return Err(parser.error("f-string: invalid expression"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    line_offset: usize,
    loop_depth: usize,
    async_depth: Vec<bool>,
    nesting: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, line_offset: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            line_offset,
            loop_depth: 0,
            async_depth: Vec::new(),
            nesting: 0,
        }
    }

    /// Runs `parse` one nesting level deeper, failing with `message` past
    /// [`MAX_NESTING`].
    fn nested<T>(
        &mut self,
        message: &str,
        parse: impl FnOnce(&mut Self) -> ParseResult<T>,
    ) -> ParseResult<T> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error(message));
        }
        self.nesting += 1;
        let result = guarded(|| parse(self));
        self.nesting -= 1;
        result
    }

    fn peek(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn peek_next(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + 1).min(last)]
    }

    fn line(&self) -> usize {
        self.peek().line + self.line_offset
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError::new(message, token.line + self.line_offset, token.column)
    }

    fn unexpected(&self) -> SyntaxError {
        match &self.peek().kind {
            TokenKind::Eof => self.error("unexpected end of input"),
            TokenKind::Indent => self.error("unexpected indent"),
            TokenKind::Newline | TokenKind::Dedent => self.error("invalid syntax"),
            _ => self.error("invalid syntax"),
        }
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> ParseResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}'")))
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match &self.peek().kind {
            TokenKind::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn eat_newlines(&mut self) {
        while self.at(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Eof | TokenKind::Dedent
        ) || self.check_op(";")
    }

    fn end_simple_statement(&mut self) -> ParseResult<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof | TokenKind::Dedent => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn in_async(&self) -> bool {
        self.async_depth.last().copied().unwrap_or(false)
    }

    // ---- statements -------------------------------------------------------

    fn statement(&mut self) -> ParseResult<Vec<Stmt>> {
        let line = self.line();
        let keyword = match &self.peek().kind {
            TokenKind::Name(name) => Some(name.clone()),
            TokenKind::Indent => return Err(self.unexpected()),
            _ => None,
        };

        match keyword.as_deref() {
            Some("if") => self.if_statement(line).map(|s| vec![s]),
            Some("while") => self.while_statement(line).map(|s| vec![s]),
            Some("for") => self.for_statement(line).map(|s| vec![s]),
            Some("try") => self.try_statement(line).map(|s| vec![s]),
            Some("def") => self.function_def(line, false).map(|s| vec![s]),
            Some("async") => {
                self.advance();
                if self.check_kw("def") {
                    self.function_def(line, true).map(|s| vec![s])
                } else {
                    Err(self.error("only 'async def' is supported"))
                }
            }
            Some("class") => Err(self.error("class definitions are not supported")),
            Some("with") => Err(self.error("'with' statements are not supported")),
            _ => self.simple_statements(),
        }
    }

    fn simple_statements(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if self.at_statement_end() {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        self.end_simple_statement()?;
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        let kind = match &self.peek().kind {
            TokenKind::Name(name) => match name.as_str() {
                "pass" => {
                    self.advance();
                    StmtKind::Pass
                }
                "break" | "continue" => {
                    let is_break = name == "break";
                    if self.loop_depth == 0 {
                        return Err(self.error(format!("'{name}' outside loop")));
                    }
                    self.advance();
                    if is_break { StmtKind::Break } else { StmtKind::Continue }
                }
                "return" => {
                    self.advance();
                    if self.at_statement_end() {
                        StmtKind::Return(None)
                    } else {
                        StmtKind::Return(Some(self.testlist()?))
                    }
                }
                "raise" => {
                    self.advance();
                    if self.at_statement_end() {
                        StmtKind::Raise(None)
                    } else {
                        let exc = self.expr()?;
                        if self.eat_kw("from") {
                            self.expr()?;
                        }
                        StmtKind::Raise(Some(exc))
                    }
                }
                "import" => {
                    self.advance();
                    let mut modules = Vec::new();
                    loop {
                        let module = self.dotted_name()?;
                        let alias = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                        modules.push((module, alias));
                        if !self.eat_op(",") {
                            break;
                        }
                    }
                    StmtKind::Import(modules)
                }
                "from" => {
                    self.advance();
                    let module = self.dotted_name()?;
                    self.expect_kw("import")?;
                    let parenthesized = self.eat_op("(");
                    let mut names = Vec::new();
                    loop {
                        let name = self.expect_name()?;
                        let alias = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                        names.push((name, alias));
                        if !self.eat_op(",") || (parenthesized && self.check_op(")")) {
                            break;
                        }
                    }
                    if parenthesized {
                        self.expect_op(")")?;
                    }
                    StmtKind::ImportFrom { module, names }
                }
                "del" => {
                    self.advance();
                    let mut targets = Vec::new();
                    loop {
                        let expr = self.expr()?;
                        targets.push(self.to_target(expr)?);
                        if !self.eat_op(",") || self.at_statement_end() {
                            break;
                        }
                    }
                    StmtKind::Delete(targets)
                }
                "assert" => {
                    self.advance();
                    let test = self.expr()?;
                    let msg = if self.eat_op(",") { Some(self.expr()?) } else { None };
                    StmtKind::Assert { test, msg }
                }
                "global" | "nonlocal" => {
                    return Err(self.error(format!("'{name}' statements are not supported")));
                }
                "yield" => return Err(self.error("'yield' is not supported")),
                _ => self.expression_statement()?,
            },
            _ => self.expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn dotted_name(&mut self) -> ParseResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn expression_statement(&mut self) -> ParseResult<StmtKind> {
        let first = self.testlist()?;

        if let TokenKind::Op(op) = self.peek().kind {
            let aug = match op {
                "+=" => Some(BinOp::Add),
                "-=" => Some(BinOp::Sub),
                "*=" => Some(BinOp::Mul),
                "/=" => Some(BinOp::Div),
                "//=" => Some(BinOp::FloorDiv),
                "%=" => Some(BinOp::Mod),
                "**=" => Some(BinOp::Pow),
                _ => None,
            };
            if let Some(op) = aug {
                self.advance();
                let target = self.to_target(first)?;
                if matches!(target, Target::Tuple(_)) {
                    return Err(self.error("illegal expression for augmented assignment"));
                }
                let value = self.testlist()?;
                return Ok(StmtKind::AugAssign { target, op, value });
            }
        }

        if !self.check_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.testlist()?);
        }
        let value = exprs.pop().ok_or_else(|| self.unexpected())?;
        let targets = exprs
            .into_iter()
            .map(|expr| self.to_target(expr))
            .collect::<ParseResult<Vec<_>>>()?;
        Ok(StmtKind::Assign { targets, value })
    }

    fn to_target(&self, mut expr: Expr) -> ParseResult<Target> {
        let line = expr.line;
        let kind = std::mem::replace(&mut expr.kind, ExprKind::Literal(Literal::None));
        match kind {
            ExprKind::Name(name) => Ok(Target::Name(name)),
            ExprKind::Subscript { value, index } => Ok(Target::Subscript { value, index }),
            ExprKind::Tuple(items) | ExprKind::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<ParseResult<Vec<_>>>()?,
            )),
            ExprKind::Attribute { .. } => {
                Err(SyntaxError::new("cannot assign to attribute", line, 1))
            }
            _ => Err(SyntaxError::new("cannot assign to expression", line, 1)),
        }
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !self.at(&TokenKind::Newline) {
            return self.simple_statements();
        }
        self.advance();
        if !self.at(&TokenKind::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();
        let body = self.nested(NESTED_BLOCKS, |parser| {
            let mut body = Vec::new();
            while !parser.at(&TokenKind::Dedent) && !parser.at(&TokenKind::Eof) {
                body.extend(parser.statement()?);
            }
            Ok(body)
        })?;
        if self.at(&TokenKind::Dedent) {
            self.advance();
        }
        Ok(body)
    }

    fn loop_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn if_statement(&mut self, line: usize) -> ParseResult<Stmt> {
        self.expect_kw("if")?;
        let mut branches = vec![(self.expr()?, self.block()?)];
        let mut orelse = Vec::new();
        loop {
            if self.eat_kw("elif") {
                branches.push((self.expr()?, self.block()?));
            } else if self.eat_kw("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            line,
        })
    }

    fn while_statement(&mut self, line: usize) -> ParseResult<Stmt> {
        self.expect_kw("while")?;
        let test = self.expr()?;
        let body = self.loop_block()?;
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            line,
        })
    }

    fn for_statement(&mut self, line: usize) -> ParseResult<Stmt> {
        self.expect_kw("for")?;
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        let body = self.loop_block()?;
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            line,
        })
    }

    fn target_list(&mut self) -> ParseResult<Target> {
        let line = self.line();
        let mut items = vec![self.arith()?];
        let mut trailing = false;
        while self.eat_op(",") {
            trailing = true;
            if self.check_kw("in") || self.check_op("=") {
                break;
            }
            items.push(self.arith()?);
            trailing = false;
        }
        let expr = if items.len() == 1 && !trailing {
            items.remove(0)
        } else {
            Expr {
                kind: ExprKind::Tuple(items),
                line,
            }
        };
        self.to_target(expr)
    }

    fn try_statement(&mut self, line: usize) -> ParseResult<Stmt> {
        self.expect_kw("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.eat_kw("except") {
            let (types, name) = if self.check_op(":") {
                (None, None)
            } else {
                let types = self.expr()?;
                let name = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                (Some(types), name)
            };
            let body = self.block()?;
            handlers.push(Handler { types, name, body });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            line,
        })
    }

    fn function_def(&mut self, line: usize, is_async: bool) -> ParseResult<Stmt> {
        self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let (params, vararg, kwarg) = self.parameters(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.expr()?;
        }

        let saved_loops = std::mem::take(&mut self.loop_depth);
        self.async_depth.push(is_async);
        let body = self.block();
        self.async_depth.pop();
        self.loop_depth = saved_loops;

        Ok(Stmt {
            kind: StmtKind::FunctionDef(Arc::new(FunctionDef {
                name,
                params,
                vararg,
                kwarg,
                body: body?,
                is_async,
            })),
            line,
        })
    }

    fn parameters(
        &mut self,
        closing: &str,
    ) -> ParseResult<(Vec<Param>, Option<String>, Option<String>)> {
        let mut params: Vec<Param> = Vec::new();
        let mut vararg = None;
        let mut kwarg = None;
        while !self.check_op(closing) {
            if kwarg.is_some() {
                return Err(self.error("parameters cannot follow '**kwargs'"));
            }
            if self.eat_op("**") {
                kwarg = Some(self.expect_name()?);
            } else if self.eat_op("*") {
                vararg = Some(self.expect_name()?);
            } else {
                let name = self.expect_name()?;
                if closing == ")" && self.eat_op(":") {
                    self.expr()?;
                }
                let default = if self.eat_op("=") { Some(self.expr()?) } else { None };
                if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error("non-default argument follows default argument"));
                }
                if params.iter().any(|p| p.name == name) {
                    return Err(self.error(format!("duplicate argument '{name}'")));
                }
                params.push(Param { name, default });
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok((params, vararg, kwarg))
    }

    // ---- expressions ------------------------------------------------------

    fn testlist(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        let first = self.expr()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_statement_end() || self.check_op("=") || self.check_op(")") {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        if self.check_kw("lambda") {
            return self.lambda();
        }
        let line = self.line();
        let body = self.or_test()?;
        if !self.eat_kw("if") {
            return Ok(body);
        }
        let test = self.or_test()?;
        self.expect_kw("else")?;
        let orelse = self.nested(NESTED_OPERATORS, Self::expr)?;
        Ok(Expr {
            kind: ExprKind::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            },
            line,
        })
    }

    fn lambda(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        self.expect_kw("lambda")?;
        let (params, vararg, kwarg) = self.parameters(":")?;
        self.expect_op(":")?;
        self.async_depth.push(false);
        let body = self.nested(NESTED_OPERATORS, Self::expr);
        self.async_depth.pop();
        let body = body?;
        let body_line = body.line;
        Ok(Expr {
            kind: ExprKind::Lambda(Arc::new(FunctionDef {
                name: "<lambda>".into(),
                params,
                vararg,
                kwarg,
                body: vec![Stmt {
                    kind: StmtKind::Return(Some(body)),
                    line: body_line,
                }],
                is_async: false,
            })),
            line,
        })
    }

    fn or_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.and_test()?;
        while self.check_kw("or") {
            let line = self.line();
            self.advance();
            let right = self.and_test()?;
            left = Expr {
                kind: ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            };
        }
        Ok(left)
    }

    fn and_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.not_test()?;
        while self.check_kw("and") {
            let line = self.line();
            self.advance();
            let right = self.not_test()?;
            left = Expr {
                kind: ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            };
        }
        Ok(left)
    }

    fn not_test(&mut self) -> ParseResult<Expr> {
        if self.check_kw("not") {
            let line = self.line();
            self.advance();
            let operand = self.nested(NESTED_OPERATORS, Self::not_test)?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            });
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match &self.peek().kind {
            TokenKind::Op("==") => CmpOp::Eq,
            TokenKind::Op("!=") => CmpOp::NotEq,
            TokenKind::Op("<") => CmpOp::Lt,
            TokenKind::Op("<=") => CmpOp::LtE,
            TokenKind::Op(">") => CmpOp::Gt,
            TokenKind::Op(">=") => CmpOp::GtE,
            TokenKind::Name(n) if n == "in" => CmpOp::In,
            TokenKind::Name(n) if n == "not" => {
                if matches!(&self.peek_next().kind, TokenKind::Name(n) if n == "in") {
                    self.advance();
                    CmpOp::NotIn
                } else {
                    return None;
                }
            }
            TokenKind::Name(n) if n == "is" => {
                self.advance();
                if self.check_kw("not") {
                    self.advance();
                    return Some(CmpOp::IsNot);
                }
                return Some(CmpOp::Is);
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        let left = self.arith()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.arith()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr {
            kind: ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            line,
        })
    }

    fn arith(&mut self) -> ParseResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Op("+") => BinOp::Add,
                TokenKind::Op("-") => BinOp::Sub,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.term()?;
            left = binary(op, left, right, line);
        }
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Op("*") => BinOp::Mul,
                TokenKind::Op("/") => BinOp::Div,
                TokenKind::Op("//") => BinOp::FloorDiv,
                TokenKind::Op("%") => BinOp::Mod,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.factor()?;
            left = binary(op, left, right, line);
        }
    }

    fn factor(&mut self) -> ParseResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Op("-") => Some(UnaryOp::Neg),
            TokenKind::Op("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        let Some(op) = op else {
            return self.power();
        };
        let line = self.line();
        self.advance();
        if op == UnaryOp::Neg && self.at_min_int_magnitude() {
            self.advance();
            return Ok(Expr {
                kind: ExprKind::Literal(Literal::Int(i64::MIN)),
                line,
            });
        }
        let operand = self.nested(NESTED_OPERATORS, Self::factor)?;
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            line,
        })
    }

    /// `-9223372036854775808` is the one negative literal whose magnitude
    /// does not fit in an `i64`. A trailing `**` or postfix operator binds
    /// to the magnitude first, so those forms stay out of range.
    fn at_min_int_magnitude(&self) -> bool {
        self.peek().kind == TokenKind::Int(i64::MIN.unsigned_abs())
            && !matches!(self.peek_next().kind, TokenKind::Op("**" | "." | "(" | "["))
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.await_primary()?;
        if !self.check_op("**") {
            return Ok(base);
        }
        let line = self.line();
        self.advance();
        let exponent = self.nested(NESTED_OPERATORS, Self::factor)?;
        Ok(binary(BinOp::Pow, base, exponent, line))
    }

    fn await_primary(&mut self) -> ParseResult<Expr> {
        if !self.check_kw("await") {
            return self.primary();
        }
        if !self.in_async() {
            return Err(self.error("'await' outside async function"));
        }
        let line = self.line();
        self.advance();
        let operand = self.primary()?;
        Ok(Expr {
            kind: ExprKind::Await(Box::new(operand)),
            line,
        })
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            if self.eat_op("(") {
                let args = self.nested(NESTED_BRACKETS, Self::call_args)?;
                self.expect_op(")")?;
                expr = Expr {
                    kind: ExprKind::Call {
                        func: Box::new(expr),
                        args,
                    },
                    line,
                };
            } else if self.eat_op("[") {
                let index = self.nested(NESTED_BRACKETS, Self::subscript)?;
                self.expect_op("]")?;
                expr = Expr {
                    kind: ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                };
            } else if self.eat_op(".") {
                let attr = match &self.peek().kind {
                    TokenKind::Name(name) => name.clone(),
                    _ => return Err(self.error("expected attribute name")),
                };
                self.advance();
                expr = Expr {
                    kind: ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> ParseResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.check_op(")") {
            if self.eat_op("**") {
                args.push(Arg::DoubleStar(self.expr()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.expr()?));
            } else if matches!(self.peek().kind, TokenKind::Name(_))
                && matches!(self.peek_next().kind, TokenKind::Op("="))
            {
                let name = self.expect_name()?;
                self.advance();
                args.push(Arg::Keyword(name, self.expr()?));
            } else {
                let line = self.line();
                let value = self.expr()?;
                if self.check_kw("for") {
                    let generators = self.comprehension_clauses()?;
                    args.push(Arg::Positional(Expr {
                        kind: ExprKind::ListComp {
                            elt: Box::new(value),
                            generators,
                        },
                        line,
                    }));
                } else {
                    if matches!(args.last(), Some(Arg::Keyword(..) | Arg::DoubleStar(_))) {
                        return Err(self.error("positional argument follows keyword argument"));
                    }
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(args)
    }

    fn subscript(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        let lower = if self.check_op(":") { None } else { Some(self.expr()?) };
        if !self.check_op(":") {
            let first = lower.ok_or_else(|| self.unexpected())?;
            if !self.check_op(",") {
                return Ok(first);
            }
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.check_op("]") {
                    break;
                }
                items.push(self.expr()?);
            }
            return Ok(Expr {
                kind: ExprKind::Tuple(items),
                line,
            });
        }

        self.advance();
        let bound = |parser: &mut Self| -> ParseResult<Option<Box<Expr>>> {
            if parser.check_op(":") || parser.check_op("]") {
                Ok(None)
            } else {
                Ok(Some(Box::new(parser.expr()?)))
            }
        };
        let upper = bound(self)?;
        let step = if self.eat_op(":") { bound(self)? } else { None };
        Ok(Expr {
            kind: ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            },
            line,
        })
    }

    fn comprehension_clauses(&mut self) -> ParseResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_kw("if") {
                conditions.push(self.or_test()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                conditions,
            });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        let token = self.peek().clone();
        let kind = match token.kind {
            TokenKind::Name(name) => {
                self.advance();
                match name.as_str() {
                    "None" => ExprKind::Literal(Literal::None),
                    "True" => ExprKind::Literal(Literal::Bool(true)),
                    "False" => ExprKind::Literal(Literal::Bool(false)),
                    "await" => return Err(self.error("'await' outside async function")),
                    kw if KEYWORDS.contains(&kw) => {
                        self.pos -= 1;
                        return Err(self.error("invalid syntax"));
                    }
                    _ => ExprKind::Name(name),
                }
            }
            TokenKind::Int(value) => {
                let value =
                    i64::try_from(value).map_err(|_| self.error("integer literal is too large"))?;
                self.advance();
                ExprKind::Literal(Literal::Int(value))
            }
            TokenKind::Float(value) => {
                self.advance();
                ExprKind::Literal(Literal::Float(value))
            }
            TokenKind::Str(_) | TokenKind::FStr(_) => self.strings()?,
            TokenKind::Op("(") => {
                self.advance();
                return self.nested(NESTED_BRACKETS, |parser| parser.parenthesized(line));
            }
            TokenKind::Op("[") => {
                self.advance();
                self.nested(NESTED_BRACKETS, Self::list_display)?
            }
            TokenKind::Op("{") => {
                self.advance();
                self.nested(NESTED_BRACKETS, Self::dict_display)?
            }
            _ => return Err(self.unexpected()),
        };
        Ok(Expr { kind, line })
    }

    fn strings(&mut self) -> ParseResult<ExprKind> {
        let line = self.line();
        let mut text = String::new();
        let mut formatted = false;
        let mut pieces = Vec::new();
        loop {
            match &self.peek().kind {
                TokenKind::Str(value) => pieces.push((value.clone(), false)),
                TokenKind::FStr(value) => {
                    formatted = true;
                    pieces.push((value.clone(), true));
                }
                _ => break,
            }
            self.advance();
        }

        if !formatted {
            for (piece, _) in pieces {
                text.push_str(&piece);
            }
            return Ok(ExprKind::Literal(Literal::Str(text)));
        }

        for (piece, is_format) in pieces {
            if is_format {
                text.push_str(&piece);
            } else {
                text.push_str(&piece.replace('{', "{{").replace('}', "}}"));
            }
        }
        Ok(ExprKind::FString(parse_fstring(&text, line)?))
    }

    fn parenthesized(&mut self, line: usize) -> ParseResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr {
                kind: ExprKind::Tuple(Vec::new()),
                line,
            });
        }
        let first = self.expr()?;
        if self.check_kw("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr {
                kind: ExprKind::ListComp {
                    elt: Box::new(first),
                    generators,
                },
                line,
            });
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op(")") {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect_op(")")?;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn list_display(&mut self) -> ParseResult<ExprKind> {
        if self.eat_op("]") {
            return Ok(ExprKind::List(Vec::new()));
        }
        let first = self.expr()?;
        if self.check_kw("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(ExprKind::ListComp {
                elt: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect_op("]")?;
        Ok(ExprKind::List(items))
    }

    fn dict_display(&mut self) -> ParseResult<ExprKind> {
        if self.eat_op("}") {
            return Ok(ExprKind::Dict(Vec::new()));
        }
        let key = self.expr()?;
        if !self.eat_op(":") {
            return Err(self.error("set literals are not supported"));
        }
        let value = self.expr()?;
        if self.check_kw("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(ExprKind::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                generators,
            });
        }
        let mut entries = vec![(key, value)];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            let key = self.expr()?;
            self.expect_op(":")?;
            entries.push((key, self.expr()?));
        }
        self.expect_op("}")?;
        Ok(ExprKind::Dict(entries))
    }
}

fn binary(op: BinOp, left: Expr, right: Expr, line: usize) -> Expr {
    Expr {
        kind: ExprKind::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        line,
    }
}

fn parse_fstring(content: &str, line: usize) -> ParseResult<Vec<FStringPart>> {
    let chars: Vec<char> = content.chars().collect();
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            text.push('{');
            i += 2;
            continue;
        }
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                text.push('}');
                i += 2;
                continue;
            }
            return Err(SyntaxError::new("f-string: single '}' is not allowed", line, 1));
        }
        if c != '{' {
            text.push(c);
            i += 1;
            continue;
        }

        if !text.is_empty() {
            parts.push(FStringPart::Text(std::mem::take(&mut text)));
        }
        i += 1;
        let start = i;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        while i < chars.len() {
            let ch = chars[i];
            if let Some(q) = quote {
                if ch == q {
                    quote = None;
                }
                i += 1;
                continue;
            }
            match ch {
                '\'' | '"' => quote = Some(ch),
                '(' | '[' | '{' => depth += 1,
                '}' if depth == 0 => break,
                ')' | ']' | '}' => depth = depth.saturating_sub(1),
                '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => break,
                ':' if depth == 0 => break,
                _ => {}
            }
            i += 1;
        }

        let source: String = chars[start..i].iter().collect();
        if source.trim().is_empty() {
            return Err(SyntaxError::new("f-string: empty expression not allowed", line, 1));
        }
        let expr = parse_embedded_expression(source.trim(), line)?;

        let mut conversion = None;
        if chars.get(i) == Some(&'!') {
            match chars.get(i + 1) {
                Some(&conv @ ('r' | 's' | 'a')) => conversion = Some(conv),
                _ => return Err(SyntaxError::new("f-string: invalid conversion character", line, 1)),
            }
            i += 2;
        }
        let mut spec = String::new();
        if chars.get(i) == Some(&':') {
            i += 1;
            while i < chars.len() && chars[i] != '}' {
                spec.push(chars[i]);
                i += 1;
            }
        }
        if chars.get(i) != Some(&'}') {
            return Err(SyntaxError::new("f-string: expecting '}'", line, 1));
        }
        i += 1;
        parts.push(FStringPart::Field {
            expr,
            conversion,
            spec,
        });
    }

    if !text.is_empty() {
        parts.push(FStringPart::Text(text));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> StmtKind {
        let mut body = parse_program(source).expect("parse");
        assert_eq!(body.len(), 1, "expected one statement in {source:?}");
        body.remove(0).kind
    }

    #[test]
    fn parses_assignment_chain_and_unpacking() {
        let StmtKind::Assign { targets, .. } = parse_one("a = b, c = 1, 2") else {
            panic!("expected assignment");
        };
        assert_eq!(targets.len(), 2);
        assert!(matches!(&targets[1], Target::Tuple(items) if items.len() == 2));
    }

    #[test]
    fn parses_keyword_call_with_await() {
        let StmtKind::Assign { value, .. } = parse_one("r = await ns.add(a=1, b=2)") else {
            panic!("expected assignment");
        };
        let ExprKind::Await(inner) = &value.kind else {
            panic!("expected await");
        };
        let ExprKind::Call { args, .. } = &inner.kind else {
            panic!("expected call");
        };
        assert!(matches!(&args[0], Arg::Keyword(name, _) if name == "a"));
    }

    #[test]
    fn parses_compound_statements() {
        let source = "\
for i, x in enumerate(xs):
    if x > 1:
        continue
    elif x:
        pass
    else:
        break
try:
    raise ValueError('bad')
except (ValueError, TypeError) as e:
    y = e
finally:
    z = 1
";
        let body = parse_program(source).unwrap();
        assert_eq!(body.len(), 2);
        assert!(matches!(body[0].kind, StmtKind::For { .. }));
        let StmtKind::Try { handlers, finalbody, .. } = &body[1].kind else {
            panic!("expected try");
        };
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        assert_eq!(finalbody.len(), 1);
        assert_eq!(body[1].line, 8);
    }

    #[test]
    fn parses_comprehensions_and_slices() {
        assert!(matches!(
            parse_one("[n * 2 for n in xs if n]"),
            StmtKind::Expr(Expr { kind: ExprKind::ListComp { .. }, .. })
        ));
        assert!(matches!(
            parse_one("{k: v for k, v in pairs}"),
            StmtKind::Expr(Expr { kind: ExprKind::DictComp { .. }, .. })
        ));
        let StmtKind::Expr(expr) = parse_one("xs[1:-1]") else {
            panic!("expected expression");
        };
        let ExprKind::Subscript { index, .. } = &expr.kind else {
            panic!("expected subscript");
        };
        assert!(matches!(index.kind, ExprKind::Slice { step: None, .. }));
    }

    #[test]
    fn parses_fstring_fields() {
        let StmtKind::Expr(expr) = parse_one("f\"{a['k']!r} = {b:>5.2f} {{x}}\"") else {
            panic!("expected expression");
        };
        let ExprKind::FString(parts) = &expr.kind else {
            panic!("expected f-string");
        };
        assert!(matches!(&parts[0], FStringPart::Field { conversion: Some('r'), .. }));
        assert!(matches!(&parts[2], FStringPart::Field { spec, .. } if spec == ">5.2f"));
        assert_eq!(parts[3], FStringPart::Text(" {x}".into()));
    }

    #[test]
    fn reports_syntax_errors_with_position() {
        let err = parse_program("x = 1\ninvalid syntax here\n").unwrap_err();
        assert_eq!(err.line(), 2);

        let err = parse_program("break\n").unwrap_err();
        assert_eq!(err.message(), "'break' outside loop");

        let err = parse_program("def f():\n    await g()\n").unwrap_err();
        assert_eq!(err.message(), "'await' outside async function");

        assert!(parse_program("    x = 1\n").is_err());
        assert!(parse_program("if x:\n").is_err());
        assert!(parse_program("x.y = 1\n").is_err());
    }

    #[test]
    fn top_level_return_and_await_are_allowed() {
        let body = parse_program("await asyncio.sleep(0)\nreturn 1\n").unwrap();
        assert!(matches!(body[1].kind, StmtKind::Return(Some(_))));
    }

    fn nested_parens(depth: usize) -> String {
        format!("return {}1{}", "(".repeat(depth), ")".repeat(depth))
    }

    #[test]
    fn bracket_nesting_is_bounded() {
        assert!(parse_program(&nested_parens(MAX_NESTING)).is_ok());

        let err = parse_program(&nested_parens(MAX_NESTING + 1)).unwrap_err();
        assert_eq!(err.message(), "too many nested parentheses");
        let err = parse_program(&nested_parens(1000)).unwrap_err();
        assert_eq!(err.message(), "too many nested parentheses");

        let calls = format!("f{}{}", "(f".repeat(500), ")".repeat(500));
        let err = parse_program(&calls).unwrap_err();
        assert_eq!(err.message(), "too many nested parentheses");
        let lists = format!("{}{}", "[".repeat(500), "]".repeat(500));
        assert!(parse_program(&lists).is_err());
    }

    #[test]
    fn operator_nesting_is_bounded() {
        let err = parse_program(&format!("return {}1", "-".repeat(1000))).unwrap_err();
        assert_eq!(err.message(), "expression is too deeply nested");
        let err = parse_program(&format!("return {}x", "not ".repeat(1000))).unwrap_err();
        assert_eq!(err.message(), "expression is too deeply nested");
        assert!(parse_program(&format!("return {}1", "-".repeat(50))).is_ok());
    }

    #[test]
    fn block_nesting_is_bounded() {
        let mut source = String::new();
        for level in 0..=MAX_NESTING {
            source.push_str(&" ".repeat(level));
            source.push_str("if True:\n");
        }
        source.push_str(&" ".repeat(MAX_NESTING + 1));
        source.push_str("pass\n");
        let err = parse_program(&source).unwrap_err();
        assert_eq!(err.message(), "too many levels of indentation");
    }

    #[test]
    fn long_operator_chains_parse_and_drop() {
        let source = format!("return 1{}", " + 1".repeat(100_000));
        let body = parse_program(&source).unwrap();
        assert_eq!(body.len(), 1);
        drop(body);

        let source = format!("x{}", ".y".repeat(100_000));
        assert!(parse_program(&source).is_ok());
    }

    #[test]
    fn most_negative_integer_literal() {
        let StmtKind::Return(Some(expr)) = parse_one("return -9223372036854775808") else {
            panic!("expected return");
        };
        assert_eq!(expr.kind, ExprKind::Literal(Literal::Int(i64::MIN)));

        let err = parse_program("return 9223372036854775808").unwrap_err();
        assert_eq!(err.message(), "integer literal is too large");
        assert!(parse_program("return -9223372036854775808 ** 2").is_err());
        assert!(parse_program("return -9223372036854775807 - 1").is_ok());
    }
}

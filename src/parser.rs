use std::rc::Rc;

use crate::{
    ast::{
        Argument, BinaryOp, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr, ExprKind,
        FStringPart, ImportName, Literal, Param, Parameters, Program, Stmt, StmtKind, UnaryOp,
    },
    diagnostics::{Diagnostic, SourceSpan},
    lexer::{self, Keyword, Lexer, Token, TokenKind},
    runtime::{STACK_GROW_SIZE, STACK_RED_ZONE},
};

pub fn parse_program(source: &str) -> Result<Program, Diagnostic> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(source, tokens).parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    current: usize,
    line_starts: Vec<usize>,
    loop_depth: usize,
    function_depth: usize,
}

impl Parser {
    fn new(source: &str, tokens: Vec<Token>) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(idx, _)| idx + 1))
            .collect();
        Self {
            tokens,
            current: 0,
            line_starts,
            loop_depth: 0,
            function_depth: 0,
        }
    }

    fn parse_program(&mut self) -> Result<Program, Diagnostic> {
        let mut body = Vec::new();
        while !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Newline) {
                continue;
            }
            body.extend(self.parse_statement()?);
        }
        Ok(Program { body })
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        let token = self.peek().clone();
        let stmt = match &token.kind {
            TokenKind::Indent => {
                return Err(Diagnostic::indentation("unexpected indent").with_span(token.span));
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if()?,
            TokenKind::Keyword(Keyword::While) => self.parse_while()?,
            TokenKind::Keyword(Keyword::For) => self.parse_for()?,
            TokenKind::Keyword(Keyword::Def) => self.parse_function()?,
            TokenKind::Keyword(Keyword::Class) => self.parse_class()?,
            TokenKind::Keyword(Keyword::Try) => self.parse_try()?,
            TokenKind::Keyword(keyword @ (Keyword::With | Keyword::Async)) => {
                return Err(self.error(
                    &token,
                    &format!("'{}' statements are not supported", keyword.as_str()),
                ));
            }
            _ => return self.parse_simple_line(),
        };
        Ok(vec![stmt])
    }

    /// One or more `;`-separated simple statements ending the line.
    fn parse_simple_line(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        let mut stmts = vec![self.parse_simple_statement()?];
        while self.matches(TokenKind::Semicolon) {
            if self.check(TokenKind::Newline) || self.check(TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_simple_statement()?);
        }
        if !self.matches(TokenKind::Newline) && !self.check(TokenKind::Eof) {
            let token = self.peek().clone();
            return Err(self.error(&token, "invalid syntax"));
        }
        Ok(stmts)
    }

    fn parse_simple_statement(&mut self) -> Result<Stmt, Diagnostic> {
        let token = self.peek().clone();
        let start = token.span;
        let kind = match &token.kind {
            TokenKind::Keyword(Keyword::Pass) => {
                self.advance();
                StmtKind::Pass
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                if self.loop_depth == 0 {
                    return Err(self.error(&token, "'break' outside loop"));
                }
                StmtKind::Break
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                if self.loop_depth == 0 {
                    return Err(self.error(&token, "'continue' not properly in loop"));
                }
                StmtKind::Continue
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                if self.function_depth == 0 {
                    return Err(self.error(&token, "'return' outside function"));
                }
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expression_list()?)
                };
                StmtKind::Return(value)
            }
            TokenKind::Keyword(Keyword::Raise) => {
                self.advance();
                let exception = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                let cause = if exception.is_some() && self.matches_keyword(Keyword::From) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                StmtKind::Raise { exception, cause }
            }
            TokenKind::Keyword(Keyword::Global) => {
                self.advance();
                StmtKind::Global(self.parse_name_list()?)
            }
            TokenKind::Keyword(Keyword::Nonlocal) => {
                self.advance();
                if self.function_depth == 0 {
                    return Err(self.error(&token, "nonlocal declaration not allowed at module level"));
                }
                StmtKind::Nonlocal(self.parse_name_list()?)
            }
            TokenKind::Keyword(Keyword::Del) => {
                self.advance();
                let mut targets = Vec::new();
                loop {
                    let target = self.parse_bitor()?;
                    self.validate_target(&target, "delete")?;
                    targets.push(target);
                    if !self.matches(TokenKind::Comma) || self.at_statement_end() {
                        break;
                    }
                }
                StmtKind::Delete(targets)
            }
            TokenKind::Keyword(Keyword::Assert) => {
                self.advance();
                let test = self.parse_expression()?;
                let message = if self.matches(TokenKind::Comma) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                StmtKind::Assert { test, message }
            }
            TokenKind::Keyword(Keyword::Import) => {
                self.advance();
                let mut names = Vec::new();
                loop {
                    let path = self.parse_dotted_name()?;
                    let alias = self.parse_alias()?;
                    names.push(ImportName { path, alias });
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                StmtKind::Import(names)
            }
            TokenKind::Keyword(Keyword::From) => {
                self.advance();
                let module = self.parse_dotted_name()?;
                self.consume_keyword(Keyword::Import)?;
                let names = if self.matches(TokenKind::Star) {
                    None
                } else {
                    let parenthesized = self.matches(TokenKind::LParen);
                    let mut names = Vec::new();
                    loop {
                        let name = self.consume_name("invalid syntax")?;
                        let alias = self.parse_alias()?;
                        names.push(ImportName {
                            path: vec![name.lexeme],
                            alias,
                        });
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                        if parenthesized && self.check(TokenKind::RParen) {
                            break;
                        }
                    }
                    if parenthesized {
                        self.consume(TokenKind::RParen, "invalid syntax")?;
                    }
                    Some(names)
                };
                StmtKind::ImportFrom { module, names }
            }
            TokenKind::Keyword(keyword @ (Keyword::Yield | Keyword::Await)) => {
                return Err(self.error(
                    &token,
                    &format!("'{}' is not supported", keyword.as_str()),
                ));
            }
            _ => return self.parse_expression_statement(),
        };
        let end = self.previous().span;
        Ok(Stmt {
            kind,
            span: start.to(end),
        })
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, Diagnostic> {
        let first = self.parse_expression_list()?;
        let start = first.span;

        if self.matches(TokenKind::Colon) {
            match first.kind {
                ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => {}
                ExprKind::Tuple(_) => {
                    return Err(Diagnostic::syntax("only single target (not tuple) can be annotated")
                        .with_span(first.span));
                }
                _ => {
                    return Err(Diagnostic::syntax("illegal target for annotation").with_span(first.span));
                }
            }
            let annotation = self.parse_expression()?;
            let value = if self.matches(TokenKind::Assign) {
                Some(self.parse_expression_list()?)
            } else {
                None
            };
            let end = self.previous().span;
            return Ok(Stmt {
                kind: StmtKind::AnnAssign {
                    target: first,
                    annotation,
                    value,
                },
                span: start.to(end),
            });
        }

        if let TokenKind::AugAssign(op) = self.peek().kind {
            match first.kind {
                ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => {}
                _ => {
                    return Err(Diagnostic::syntax(format!(
                        "'{}' is an illegal expression for augmented assignment",
                        describe(&first)
                    ))
                    .with_span(first.span));
                }
            }
            self.advance();
            let value = self.parse_expression_list()?;
            let end = value.span;
            return Ok(Stmt {
                kind: StmtKind::AugAssign {
                    target: first,
                    op,
                    value,
                },
                span: start.to(end),
            });
        }

        if self.check(TokenKind::Assign) {
            let mut exprs = vec![first];
            while self.matches(TokenKind::Assign) {
                exprs.push(self.parse_expression_list()?);
            }
            let value = match exprs.pop() {
                Some(value) => value,
                None => return Err(self.error_here("invalid syntax")),
            };
            for target in &exprs {
                self.validate_target(target, "assign to")?;
            }
            let end = value.span;
            return Ok(Stmt {
                kind: StmtKind::Assign {
                    targets: exprs,
                    value,
                },
                span: start.to(end),
            });
        }

        Ok(Stmt {
            span: first.span,
            kind: StmtKind::Expr(first),
        })
    }

    fn validate_target(&self, target: &Expr, action: &str) -> Result<(), Diagnostic> {
        match &target.kind {
            ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
            ExprKind::Tuple(items) | ExprKind::List(items) => items
                .iter()
                .try_for_each(|item| self.validate_target(item, action)),
            _ => Err(Diagnostic::syntax(format!("cannot {action} {}", describe(target)))
                .with_span(target.span)),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, Diagnostic> {
        let keyword = self.advance();
        let label = if keyword.kind == TokenKind::Keyword(Keyword::Elif) {
            "'elif' statement"
        } else {
            "'if' statement"
        };
        let test = self.parse_expression()?;
        let body = self.parse_suite(label, keyword.span)?;
        let orelse = if self.check(TokenKind::Keyword(Keyword::Elif)) {
            vec![self.parse_if()?]
        } else if self.check(TokenKind::Keyword(Keyword::Else)) {
            let else_token = self.advance();
            self.parse_suite("'else' statement", else_token.span)?
        } else {
            Vec::new()
        };
        let end = self.previous().span;
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            span: keyword.span.to(end),
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, Diagnostic> {
        let keyword = self.advance();
        let test = self.parse_expression()?;
        let body = self.parse_loop_body("'while' statement", keyword.span)?;
        let orelse = self.parse_loop_else()?;
        let end = self.previous().span;
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            span: keyword.span.to(end),
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, Diagnostic> {
        let keyword = self.advance();
        let target = self.parse_target_list()?;
        self.consume_keyword(Keyword::In)?;
        let iter = self.parse_expression_list()?;
        let body = self.parse_loop_body("'for' statement", keyword.span)?;
        let orelse = self.parse_loop_else()?;
        let end = self.previous().span;
        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            span: keyword.span.to(end),
        })
    }

    fn parse_loop_body(&mut self, label: &str, header: SourceSpan) -> Result<Vec<Stmt>, Diagnostic> {
        self.loop_depth += 1;
        let body = self.parse_suite(label, header);
        self.loop_depth -= 1;
        body
    }

    fn parse_loop_else(&mut self) -> Result<Vec<Stmt>, Diagnostic> {
        if self.check(TokenKind::Keyword(Keyword::Else)) {
            let else_token = self.advance();
            self.parse_suite("'else' statement", else_token.span)
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_function(&mut self) -> Result<Stmt, Diagnostic> {
        let keyword = self.advance();
        let name = self.consume_name("invalid syntax")?;
        self.consume(TokenKind::LParen, "expected '('")?;
        let params = self.parse_parameters(TokenKind::RParen, true)?;
        self.consume(TokenKind::RParen, "invalid syntax")?;
        if self.matches(TokenKind::Arrow) {
            self.parse_expression()?;
        }

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.function_depth += 1;
        let body = self.parse_suite("function definition", keyword.span);
        self.function_depth -= 1;
        self.loop_depth = saved_loops;
        let body = body?;

        let end = self.previous().span;
        Ok(Stmt {
            kind: StmtKind::FunctionDef {
                name: name.lexeme,
                params: Rc::new(params),
                body: Rc::new(body),
            },
            span: keyword.span.to(end),
        })
    }

    fn parse_parameters(&mut self, closing: TokenKind, annotations: bool) -> Result<Parameters, Diagnostic> {
        let mut parameters = Parameters::default();
        let mut seen: Vec<String> = Vec::new();
        let mut saw_default = false;
        while !self.check(closing.clone()) {
            let star = if self.matches(TokenKind::DoubleStar) {
                Some(2)
            } else if self.matches(TokenKind::Star) {
                Some(1)
            } else {
                None
            };
            if star.is_some() && (self.check(TokenKind::Comma) || self.check(closing.clone())) {
                return Err(self.error_here("keyword-only parameters are not supported"));
            }
            if parameters.kwarg.is_some() {
                return Err(self.error_here("arguments cannot follow var-keyword argument"));
            }
            let name = self.consume_name("invalid syntax")?;
            if seen.contains(&name.lexeme) {
                return Err(self.error(
                    &name,
                    &format!("duplicate argument '{}' in function definition", name.lexeme),
                ));
            }
            seen.push(name.lexeme.clone());
            let annotation = if annotations && self.matches(TokenKind::Colon) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            match star {
                Some(1) => parameters.vararg = Some(name.lexeme),
                Some(_) => parameters.kwarg = Some(name.lexeme),
                None => {
                    if parameters.vararg.is_some() {
                        return Err(self.error(&name, "keyword-only parameters are not supported"));
                    }
                    let default = if self.matches(TokenKind::Assign) {
                        saw_default = true;
                        Some(self.parse_expression()?)
                    } else {
                        if saw_default {
                            return Err(self.error(
                                &name,
                                "parameter without a default follows parameter with a default",
                            ));
                        }
                        None
                    };
                    parameters.params.push(Param {
                        name: name.lexeme,
                        annotation,
                        default,
                        span: name.span,
                    });
                }
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        Ok(parameters)
    }

    fn parse_class(&mut self) -> Result<Stmt, Diagnostic> {
        let keyword = self.advance();
        let name = self.consume_name("invalid syntax")?;
        let mut bases = Vec::new();
        if self.matches(TokenKind::LParen) {
            while !self.check(TokenKind::RParen) {
                bases.push(self.parse_expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RParen, "invalid syntax")?;
        }

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        let saved_functions = std::mem::replace(&mut self.function_depth, 0);
        let body = self.parse_suite("class definition", keyword.span);
        self.loop_depth = saved_loops;
        self.function_depth = saved_functions;
        let body = body?;

        let end = self.previous().span;
        Ok(Stmt {
            kind: StmtKind::ClassDef {
                name: name.lexeme,
                bases,
                body,
            },
            span: keyword.span.to(end),
        })
    }

    fn parse_try(&mut self) -> Result<Stmt, Diagnostic> {
        let keyword = self.advance();
        let body = self.parse_suite("'try' statement", keyword.span)?;

        let mut handlers: Vec<ExceptHandler> = Vec::new();
        while self.check(TokenKind::Keyword(Keyword::Except)) {
            let except = self.advance();
            if handlers.last().is_some_and(|handler| handler.class.is_none()) {
                return Err(self.error(&except, "default 'except:' must be last"));
            }
            let class = if self.check(TokenKind::Colon) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            let name = if class.is_some() && self.matches_keyword(Keyword::As) {
                Some(self.consume_name("invalid syntax")?.lexeme)
            } else {
                None
            };
            let body = self.parse_suite("'except' statement", except.span)?;
            let end = self.previous().span;
            handlers.push(ExceptHandler {
                class,
                name,
                body,
                span: except.span.to(end),
            });
        }

        let orelse = if !handlers.is_empty() && self.check(TokenKind::Keyword(Keyword::Else)) {
            let else_token = self.advance();
            self.parse_suite("'else' statement", else_token.span)?
        } else {
            Vec::new()
        };
        let finalbody = if self.check(TokenKind::Keyword(Keyword::Finally)) {
            let finally = self.advance();
            self.parse_suite("'finally' statement", finally.span)?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error_here("expected 'except' or 'finally' block"));
        }

        let end = self.previous().span;
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            span: keyword.span.to(end),
        })
    }

    /// `: NEWLINE INDENT stmts DEDENT`, or simple statements on the header line.
    fn parse_suite(&mut self, label: &str, header: SourceSpan) -> Result<Vec<Stmt>, Diagnostic> {
        self.consume(TokenKind::Colon, "expected ':'")?;
        if !self.matches(TokenKind::Newline) {
            return self.parse_simple_line();
        }
        if !self.matches(TokenKind::Indent) {
            let line = self.line_of(header.start);
            let span = self.peek().span;
            return Err(Diagnostic::indentation(format!(
                "expected an indented block after {label} on line {line}"
            ))
            .with_span(span));
        }
        let mut body = Vec::new();
        while !self.check(TokenKind::Dedent) && !self.check(TokenKind::Eof) {
            body.extend(self.parse_statement()?);
        }
        self.matches(TokenKind::Dedent);
        Ok(body)
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>, Diagnostic> {
        let mut names = vec![self.consume_name("invalid syntax")?.lexeme];
        while self.matches(TokenKind::Comma) {
            names.push(self.consume_name("invalid syntax")?.lexeme);
        }
        Ok(names)
    }

    fn parse_dotted_name(&mut self) -> Result<Vec<String>, Diagnostic> {
        let mut path = vec![self.consume_name("invalid syntax")?.lexeme];
        while self.matches(TokenKind::Dot) {
            path.push(self.consume_name("invalid syntax")?.lexeme);
        }
        Ok(path)
    }

    fn parse_alias(&mut self) -> Result<Option<String>, Diagnostic> {
        if self.matches_keyword(Keyword::As) {
            Ok(Some(self.consume_name("invalid syntax")?.lexeme))
        } else {
            Ok(None)
        }
    }

    /// Comma-separated expressions; more than one, or a trailing comma,
    /// builds a tuple.
    fn parse_expression_list(&mut self) -> Result<Expr, Diagnostic> {
        let first = self.parse_expression()?;
        if !self.check(TokenKind::Comma) {
            return Ok(first);
        }
        let start = first.span;
        let mut items = vec![first];
        while self.matches(TokenKind::Comma) {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_expression()?);
        }
        let end = self.previous().span;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span: start.to(end),
        })
    }

    /// Targets of `for` loops and comprehensions, which stop before `in`.
    fn parse_target_list(&mut self) -> Result<Expr, Diagnostic> {
        let first = self.parse_bitor()?;
        let target = if self.check(TokenKind::Comma) {
            let start = first.span;
            let mut items = vec![first];
            while self.matches(TokenKind::Comma) {
                if self.check(TokenKind::Keyword(Keyword::In)) {
                    break;
                }
                items.push(self.parse_bitor()?);
            }
            let end = self.previous().span;
            Expr {
                kind: ExprKind::Tuple(items),
                span: start.to(end),
            }
        } else {
            first
        };
        self.validate_target(&target, "assign to")?;
        Ok(target)
    }

    fn parse_expression(&mut self) -> Result<Expr, Diagnostic> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.parse_conditional())
    }

    fn parse_conditional(&mut self) -> Result<Expr, Diagnostic> {
        if self.check(TokenKind::Keyword(Keyword::Lambda)) {
            return self.parse_lambda();
        }
        let expr = self.parse_or()?;
        if !self.matches_keyword(Keyword::If) {
            return Ok(expr);
        }
        let test = self.parse_or()?;
        if !self.matches_keyword(Keyword::Else) {
            return Err(self.error_here("expected 'else' after 'if' expression"));
        }
        let orelse = self.parse_expression()?;
        let span = expr.span.to(orelse.span);
        Ok(Expr {
            kind: ExprKind::IfExp {
                test: Box::new(test),
                body: Box::new(expr),
                orelse: Box::new(orelse),
            },
            span,
        })
    }

    fn parse_lambda(&mut self) -> Result<Expr, Diagnostic> {
        let keyword = self.advance();
        let params = self.parse_parameters(TokenKind::Colon, false)?;
        self.consume(TokenKind::Colon, "expected ':'")?;
        let body = self.parse_expression()?;
        let span = keyword.span.to(body.span);
        let body = Stmt {
            span: body.span,
            kind: StmtKind::Return(Some(body)),
        };
        Ok(Expr {
            kind: ExprKind::Lambda {
                params: Rc::new(params),
                body: Rc::new(vec![body]),
            },
            span,
        })
    }

    fn parse_or(&mut self) -> Result<Expr, Diagnostic> {
        let first = self.parse_and()?;
        self.parse_bool_chain(first, Keyword::Or, BoolOp::Or, Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, Diagnostic> {
        let first = self.parse_not()?;
        self.parse_bool_chain(first, Keyword::And, BoolOp::And, Self::parse_not)
    }

    fn parse_bool_chain(
        &mut self,
        first: Expr,
        keyword: Keyword,
        op: BoolOp,
        operand: fn(&mut Self) -> Result<Expr, Diagnostic>,
    ) -> Result<Expr, Diagnostic> {
        if !self.check(TokenKind::Keyword(keyword)) {
            return Ok(first);
        }
        let start = first.span;
        let mut values = vec![first];
        while self.matches_keyword(keyword) {
            values.push(operand(self)?);
        }
        let end = self.previous().span;
        Ok(Expr {
            kind: ExprKind::BoolOp { op, values },
            span: start.to(end),
        })
    }

    fn parse_not(&mut self) -> Result<Expr, Diagnostic> {
        if self.check(TokenKind::Keyword(Keyword::Not)) {
            let keyword = self.advance();
            let operand = self.parse_not()?;
            let span = keyword.span.to(operand.span);
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, Diagnostic> {
        let left = self.parse_bitor()?;
        let mut comparisons = Vec::new();
        loop {
            let op = match self.peek().kind {
                TokenKind::EqualEqual => CmpOp::Eq,
                TokenKind::NotEqual => CmpOp::NotEq,
                TokenKind::Less => CmpOp::Lt,
                TokenKind::LessEqual => CmpOp::LtE,
                TokenKind::Greater => CmpOp::Gt,
                TokenKind::GreaterEqual => CmpOp::GtE,
                TokenKind::Keyword(Keyword::In) => CmpOp::In,
                TokenKind::Keyword(Keyword::Is) => {
                    if self.peek_next_kind() == Some(&TokenKind::Keyword(Keyword::Not)) {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                TokenKind::Keyword(Keyword::Not)
                    if self.peek_next_kind() == Some(&TokenKind::Keyword(Keyword::In)) =>
                {
                    self.advance();
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.advance();
            comparisons.push((op, self.parse_bitor()?));
        }
        if comparisons.is_empty() {
            return Ok(left);
        }
        let end = self.previous().span;
        let span = left.span.to(end);
        Ok(Expr {
            kind: ExprKind::Compare {
                left: Box::new(left),
                comparisons,
            },
            span,
        })
    }

    fn parse_binary_level(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr, Diagnostic>,
        operator: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> Result<Expr, Diagnostic> {
        let mut expr = operand(self)?;
        while let Some(op) = operator(&self.peek().kind) {
            self.advance();
            let right = operand(self)?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_bitor(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary_level(Self::parse_bitxor, |kind| match kind {
            TokenKind::Pipe => Some(BinaryOp::BitOr),
            _ => None,
        })
    }

    fn parse_bitxor(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary_level(Self::parse_bitand, |kind| match kind {
            TokenKind::Caret => Some(BinaryOp::BitXor),
            _ => None,
        })
    }

    fn parse_bitand(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary_level(Self::parse_shift, |kind| match kind {
            TokenKind::Ampersand => Some(BinaryOp::BitAnd),
            _ => None,
        })
    }

    fn parse_shift(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary_level(Self::parse_arith, |kind| match kind {
            TokenKind::LShift => Some(BinaryOp::LShift),
            TokenKind::RShift => Some(BinaryOp::RShift),
            _ => None,
        })
    }

    fn parse_arith(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary_level(Self::parse_term, |kind| match kind {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn parse_term(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_binary_level(Self::parse_factor, |kind| match kind {
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            TokenKind::DoubleSlash => Some(BinaryOp::FloorDiv),
            TokenKind::Percent => Some(BinaryOp::Mod),
            _ => None,
        })
    }

    fn parse_factor(&mut self) -> Result<Expr, Diagnostic> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            TokenKind::Tilde => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        let token = self.advance();
        let operand = self.parse_factor()?;
        let span = token.span.to(operand.span);
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn parse_power(&mut self) -> Result<Expr, Diagnostic> {
        let base = self.parse_primary()?;
        if self.matches(TokenKind::DoubleStar) {
            let exponent = self.parse_factor()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, Diagnostic> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.matches(TokenKind::LParen) {
                let args = self.parse_call_args()?;
                let close = self.consume(TokenKind::RParen, "invalid syntax")?;
                let span = expr.span.to(close.span);
                expr = Expr {
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    span,
                };
            } else if self.matches(TokenKind::LBracket) {
                let index = self.parse_subscript()?;
                let close = self.consume(TokenKind::RBracket, "invalid syntax")?;
                let span = expr.span.to(close.span);
                expr = Expr {
                    kind: ExprKind::Subscript {
                        target: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                };
            } else if self.matches(TokenKind::Dot) {
                let name = self.consume_name("invalid syntax")?;
                let span = expr.span.to(name.span);
                expr = Expr {
                    kind: ExprKind::Attribute {
                        target: Box::new(expr),
                        name: name.lexeme,
                    },
                    span,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Argument>, Diagnostic> {
        let mut args = Vec::new();
        let mut saw_keyword = false;
        while !self.check(TokenKind::RParen) {
            if self.matches(TokenKind::Star) {
                args.push(Argument::Unpack(self.parse_expression()?));
            } else if self.matches(TokenKind::DoubleStar) {
                saw_keyword = true;
                args.push(Argument::UnpackMapping(self.parse_expression()?));
            } else if self.check(TokenKind::Name)
                && self.peek_next_kind() == Some(&TokenKind::Assign)
            {
                let name = self.advance();
                self.advance();
                saw_keyword = true;
                args.push(Argument::Keyword(name.lexeme, self.parse_expression()?));
            } else {
                let value = self.parse_expression()?;
                if saw_keyword {
                    return Err(Diagnostic::syntax("positional argument follows keyword argument")
                        .with_span(value.span));
                }
                let value = if self.check(TokenKind::Keyword(Keyword::For)) {
                    self.parse_list_comprehension(value)?
                } else {
                    value
                };
                args.push(Argument::Positional(value));
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        Ok(args)
    }

    fn parse_subscript(&mut self) -> Result<Expr, Diagnostic> {
        let first = self.parse_slice_item()?;
        if !self.check(TokenKind::Comma) {
            return Ok(first);
        }
        let start = first.span;
        let mut items = vec![first];
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_slice_item()?);
        }
        let end = self.previous().span;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span: start.to(end),
        })
    }

    fn parse_slice_item(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.peek().span;
        let lower = if self.check(TokenKind::Colon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        if !self.check(TokenKind::Colon) {
            return lower.ok_or_else(|| self.error_here("invalid syntax"));
        }
        self.advance();
        let bound_ends = |parser: &Self| {
            parser.check(TokenKind::Colon)
                || parser.check(TokenKind::RBracket)
                || parser.check(TokenKind::Comma)
        };
        let upper = if bound_ends(self) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        let step = if self.matches(TokenKind::Colon) {
            if bound_ends(self) {
                None
            } else {
                Some(Box::new(self.parse_expression()?))
            }
        } else {
            None
        };
        let end = self.previous().span;
        Ok(Expr {
            kind: ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            },
            span: start.to(end),
        })
    }

    fn parse_atom(&mut self) -> Result<Expr, Diagnostic> {
        let token = self.peek().clone();
        let literal = match &token.kind {
            TokenKind::Name => {
                self.advance();
                return Ok(Expr {
                    kind: ExprKind::Name(token.lexeme),
                    span: token.span,
                });
            }
            TokenKind::Int => match lexer::int_value(&token.lexeme) {
                Some(value) => match i64::try_from(&value) {
                    Ok(small) => Literal::Int(small),
                    Err(_) => Literal::BigInt(value),
                },
                None => return Err(self.error(&token, "invalid decimal literal")),
            },
            TokenKind::Float => match lexer::float_value(&token.lexeme) {
                Some(value) => Literal::Float(value),
                None => return Err(self.error(&token, "invalid decimal literal")),
            },
            TokenKind::Str | TokenKind::FString { .. } => return self.parse_strings(),
            TokenKind::Keyword(Keyword::None) => Literal::None,
            TokenKind::Keyword(Keyword::True) => Literal::Bool(true),
            TokenKind::Keyword(Keyword::False) => Literal::Bool(false),
            TokenKind::Keyword(Keyword::Lambda) => return self.parse_lambda(),
            TokenKind::LParen => return self.parse_parenthesized(),
            TokenKind::LBracket => return self.parse_list_display(),
            TokenKind::LBrace => return self.parse_dict_display(),
            TokenKind::Indent => {
                return Err(Diagnostic::indentation("unexpected indent").with_span(token.span));
            }
            _ => return Err(self.error(&token, "invalid syntax")),
        };
        self.advance();
        Ok(Expr {
            kind: ExprKind::Literal(literal),
            span: token.span,
        })
    }

    fn parse_parenthesized(&mut self) -> Result<Expr, Diagnostic> {
        let open = self.advance();
        if self.check(TokenKind::RParen) {
            let close = self.advance();
            return Ok(Expr {
                kind: ExprKind::Tuple(Vec::new()),
                span: open.span.to(close.span),
            });
        }
        if self.check(TokenKind::Keyword(Keyword::Yield)) {
            return Err(self.error_here("'yield' is not supported"));
        }
        let first = self.parse_expression()?;
        if self.check(TokenKind::Keyword(Keyword::For)) {
            let comprehension = self.parse_list_comprehension(first)?;
            self.consume(TokenKind::RParen, "invalid syntax")?;
            return Ok(comprehension);
        }
        if !self.check(TokenKind::Comma) {
            let close = self.consume(TokenKind::RParen, "invalid syntax")?;
            return Ok(Expr {
                kind: first.kind,
                span: open.span.to(close.span),
            });
        }
        let mut items = vec![first];
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::RParen) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        let close = self.consume(TokenKind::RParen, "invalid syntax")?;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span: open.span.to(close.span),
        })
    }

    fn parse_list_display(&mut self) -> Result<Expr, Diagnostic> {
        let open = self.advance();
        let mut items = Vec::new();
        if !self.check(TokenKind::RBracket) {
            let first = self.parse_expression()?;
            if self.check(TokenKind::Keyword(Keyword::For)) {
                let comprehension = self.parse_list_comprehension(first)?;
                let close = self.consume(TokenKind::RBracket, "invalid syntax")?;
                return Ok(Expr {
                    kind: comprehension.kind,
                    span: open.span.to(close.span),
                });
            }
            items.push(first);
            while self.matches(TokenKind::Comma) {
                if self.check(TokenKind::RBracket) {
                    break;
                }
                items.push(self.parse_expression()?);
            }
        }
        let close = self.consume(TokenKind::RBracket, "invalid syntax")?;
        Ok(Expr {
            kind: ExprKind::List(items),
            span: open.span.to(close.span),
        })
    }

    fn parse_dict_display(&mut self) -> Result<Expr, Diagnostic> {
        let open = self.advance();
        let mut entries = Vec::new();
        if !self.check(TokenKind::RBrace) {
            let key = self.parse_expression()?;
            if !self.matches(TokenKind::Colon) {
                return self.parse_set_display(open, key);
            }
            let value = self.parse_expression()?;
            if self.check(TokenKind::Keyword(Keyword::For)) {
                let generators = self.parse_comprehension_clauses()?;
                let close = self.consume(TokenKind::RBrace, "invalid syntax")?;
                return Ok(Expr {
                    kind: ExprKind::DictComp {
                        key: Box::new(key),
                        value: Box::new(value),
                        generators,
                    },
                    span: open.span.to(close.span),
                });
            }
            entries.push((key, value));
            while self.matches(TokenKind::Comma) {
                if self.check(TokenKind::RBrace) {
                    break;
                }
                let key = self.parse_expression()?;
                self.consume(TokenKind::Colon, "':' expected after dictionary key")?;
                entries.push((key, self.parse_expression()?));
            }
        }
        let close = self.consume(TokenKind::RBrace, "invalid syntax")?;
        Ok(Expr {
            kind: ExprKind::Dict(entries),
            span: open.span.to(close.span),
        })
    }

    /// Rest of a `{...}` display whose first item had no `:`.
    fn parse_set_display(&mut self, open: Token, first: Expr) -> Result<Expr, Diagnostic> {
        if self.check(TokenKind::Keyword(Keyword::For)) {
            let generators = self.parse_comprehension_clauses()?;
            let close = self.consume(TokenKind::RBrace, "invalid syntax")?;
            return Ok(Expr {
                kind: ExprKind::SetComp {
                    element: Box::new(first),
                    generators,
                },
                span: open.span.to(close.span),
            });
        }
        let mut items = vec![first];
        while self.matches(TokenKind::Comma) {
            if self.check(TokenKind::RBrace) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        let close = self.consume(TokenKind::RBrace, "invalid syntax")?;
        Ok(Expr {
            kind: ExprKind::Set(items),
            span: open.span.to(close.span),
        })
    }

    fn parse_list_comprehension(&mut self, element: Expr) -> Result<Expr, Diagnostic> {
        let generators = self.parse_comprehension_clauses()?;
        let end = self.previous().span;
        let span = element.span.to(end);
        Ok(Expr {
            kind: ExprKind::ListComp {
                element: Box::new(element),
                generators,
            },
            span,
        })
    }

    fn parse_comprehension_clauses(&mut self) -> Result<Vec<Comprehension>, Diagnostic> {
        let mut generators = Vec::new();
        while self.matches_keyword(Keyword::For) {
            let target = self.parse_target_list()?;
            self.consume_keyword(Keyword::In)?;
            let iter = self.parse_or()?;
            let mut conditions = Vec::new();
            while self.matches_keyword(Keyword::If) {
                conditions.push(self.parse_or()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                conditions,
            });
        }
        Ok(generators)
    }

    /// Adjacent string literals concatenate; any f-string among them makes
    /// the whole run an f-string.
    fn parse_strings(&mut self) -> Result<Expr, Diagnostic> {
        let start = self.peek().span;
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut formatted = false;
        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::Str => {
                    self.advance();
                    match parts.last_mut() {
                        Some(FStringPart::Literal(text)) => text.push_str(&token.lexeme),
                        _ => parts.push(FStringPart::Literal(token.lexeme)),
                    }
                }
                TokenKind::FString { raw } => {
                    self.advance();
                    formatted = true;
                    for part in parse_fstring(&token.lexeme, raw, token.span)? {
                        match (parts.last_mut(), part) {
                            (Some(FStringPart::Literal(text)), FStringPart::Literal(more)) => {
                                text.push_str(&more)
                            }
                            (_, part) => parts.push(part),
                        }
                    }
                }
                _ => break,
            }
        }
        let span = start.to(self.previous().span);
        if formatted {
            return Ok(Expr {
                kind: ExprKind::FString(parts),
                span,
            });
        }
        let text = match parts.pop() {
            Some(FStringPart::Literal(text)) => text,
            _ => String::new(),
        };
        Ok(Expr {
            kind: ExprKind::Literal(Literal::Str(text)),
            span,
        })
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Name
                | TokenKind::Int
                | TokenKind::Float
                | TokenKind::Str
                | TokenKind::FString { .. }
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::Minus
                | TokenKind::Plus
                | TokenKind::Tilde
                | TokenKind::Keyword(
                    Keyword::None
                        | Keyword::True
                        | Keyword::False
                        | Keyword::Not
                        | Keyword::Lambda
                )
        )
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof
        )
    }

    fn line_of(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|&start| start <= offset)
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn matches_keyword(&mut self, keyword: Keyword) -> bool {
        self.matches(TokenKind::Keyword(keyword))
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token, Diagnostic> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(message))
        }
    }

    fn consume_keyword(&mut self, keyword: Keyword) -> Result<Token, Diagnostic> {
        self.consume(TokenKind::Keyword(keyword), "invalid syntax")
    }

    fn consume_name(&mut self, message: &str) -> Result<Token, Diagnostic> {
        self.consume(TokenKind::Name, message)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous().clone()
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    /// The token stream always ends with `Eof`, so this never runs past it.
    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.current.min(last)]
    }

    fn peek_next_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.current + 1).map(|token| &token.kind)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn error(&self, token: &Token, message: &str) -> Diagnostic {
        Diagnostic::syntax(message).with_span(token.span)
    }

    fn error_here(&self, message: &str) -> Diagnostic {
        self.error(self.peek(), message)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.to(right.span);
    Expr {
        kind: ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    }
}

/// How an invalid target is named in "cannot assign to ..." messages.
fn describe(expr: &Expr) -> &'static str {
    match &expr.kind {
        ExprKind::Literal(_) | ExprKind::FString(_) => "literal",
        ExprKind::Call { .. } => "function call",
        ExprKind::Tuple(_) => "tuple",
        ExprKind::List(_) => "list",
        ExprKind::Dict(_) => "dict literal",
        ExprKind::Set(_) => "set display",
        ExprKind::SetComp { .. } => "set comprehension",
        ExprKind::ListComp { .. } => "list comprehension",
        ExprKind::DictComp { .. } => "dict comprehension",
        ExprKind::Lambda { .. } => "lambda",
        ExprKind::IfExp { .. } => "conditional expression",
        ExprKind::Compare { .. } => "comparison",
        _ => "expression",
    }
}

/// Splits an f-string body into literal text and replacement fields.
fn parse_fstring(body: &str, raw: bool, span: SourceSpan) -> Result<Vec<FStringPart>, Diagnostic> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut idx = 0;
    let flush = |literal: &mut String, parts: &mut Vec<FStringPart>| -> Result<(), Diagnostic> {
        if !literal.is_empty() {
            let text = if raw {
                std::mem::take(literal)
            } else {
                lexer::unescape(&std::mem::take(literal))
                    .map_err(|message| Diagnostic::syntax(message).with_span(span))?
            };
            parts.push(FStringPart::Literal(text));
        }
        Ok(())
    };

    while idx < chars.len() {
        match chars[idx] {
            '{' if chars.get(idx + 1) == Some(&'{') => {
                literal.push('{');
                idx += 2;
            }
            '}' if chars.get(idx + 1) == Some(&'}') => {
                literal.push('}');
                idx += 2;
            }
            '}' => {
                return Err(Diagnostic::syntax("f-string: single '}' is not allowed").with_span(span));
            }
            '{' => {
                flush(&mut literal, &mut parts)?;
                let (part, next) = parse_fstring_field(&chars, idx + 1, span)?;
                parts.push(part);
                idx = next;
            }
            ch => {
                literal.push(ch);
                idx += 1;
            }
        }
    }
    flush(&mut literal, &mut parts)?;
    Ok(parts)
}

fn parse_fstring_field(
    chars: &[char],
    start: usize,
    span: SourceSpan,
) -> Result<(FStringPart, usize), Diagnostic> {
    let unterminated = || Diagnostic::syntax("f-string: expecting '}'").with_span(span);
    let mut depth = 0usize;
    let mut idx = start;
    let mut quote: Option<char> = None;
    while idx < chars.len() {
        let ch = chars[idx];
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            idx += 1;
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth -= 1,
            '}' | ':' if depth == 0 => break,
            '!' if depth == 0 && chars.get(idx + 1) != Some(&'=') => break,
            _ => {}
        }
        idx += 1;
    }
    if idx >= chars.len() {
        return Err(unterminated());
    }

    let source: String = chars[start..idx].iter().collect();
    if source.trim().is_empty() {
        return Err(Diagnostic::syntax("f-string: empty expression not allowed").with_span(span));
    }

    let mut conversion = None;
    if chars[idx] == '!' {
        match chars.get(idx + 1) {
            Some(&conv @ ('r' | 's' | 'a')) => conversion = Some(conv),
            _ => {
                return Err(Diagnostic::syntax("f-string: invalid conversion character")
                    .with_span(span));
            }
        }
        idx += 2;
    }

    let mut spec = None;
    if chars.get(idx) == Some(&':') {
        let spec_start = idx + 1;
        idx = spec_start;
        while idx < chars.len() && chars[idx] != '}' {
            if chars[idx] == '{' {
                return Err(Diagnostic::syntax("f-string: nested format specs are not supported")
                    .with_span(span));
            }
            idx += 1;
        }
        spec = Some(chars[spec_start..idx.min(chars.len())].iter().collect());
    }
    if chars.get(idx) != Some(&'}') {
        return Err(unterminated());
    }

    let wrapped = format!("({source})");
    let expr = parse_embedded_expression(&wrapped).map_err(|diagnostic| {
        Diagnostic::syntax(format!("f-string: {}", diagnostic.message)).with_span(span)
    })?;
    let expr = Expr { span, ..expr };
    Ok((FStringPart::Field { expr, conversion, spec }, idx + 1))
}

fn parse_embedded_expression(source: &str) -> Result<Expr, Diagnostic> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(source, tokens);
    let expr = parser.parse_expression()?;
    if !matches!(parser.peek().kind, TokenKind::Newline | TokenKind::Eof) {
        return Err(parser.error_here("invalid syntax"));
    }
    Ok(expr)
}

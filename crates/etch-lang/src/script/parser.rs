use std::sync::Arc;

use smol_str::SmolStr;

use super::{
    ast::{
        AssignOp, BinaryOp, DeclKind, Expr, ForTarget, FunctionBody, FunctionDef, LogicalOp,
        Param, Property, PropertyKey, Stmt, TemplateSegment, UnaryOp,
    },
    error::ParseError,
    token::{Keyword, Punct, TemplatePart, Token, TokenKind},
};

/// Deepest nesting of statements and expressions the parser accepts.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Reserved statement keywords the script language does not implement.
const UNSUPPORTED_STATEMENTS: &[&str] = &["switch", "try", "catch", "finally", "class", "do"];

/// Recursive descent parser over a template's token stream.
///
/// Statements end at `;`, at a line break, before `}` and at template
/// boundaries (literal text, output tags, line markers).
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binary {
    Arithmetic(BinaryOp),
    Logical(LogicalOp),
}

impl Parser {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().is_none_or(|token| token.kind != TokenKind::Eof) {
            let line = tokens.last().map(|token| token.line).unwrap_or(1);
            tokens.push(Token::new(TokenKind::Eof, line, true));
        }

        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    pub fn parse_program(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut program = Vec::new();

        while !self.at_eof() {
            program.push(self.parse_statement()?);
        }

        Ok(program)
    }

    #[inline(always)]
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn eat_punct(&mut self, punct: Punct) -> bool {
        if self.peek().is_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: Punct) -> Result<(), ParseError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> ParseError {
        let token = self.peek();
        match token.kind {
            TokenKind::Eof => ParseError::UnexpectedEof { line: token.line },
            _ => ParseError::UnexpectedToken {
                token: token.kind.to_string(),
                line: token.line,
            },
        }
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ParseError::NestingTooDeep {
                line: self.peek().line,
            });
        }

        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn end_statement(&mut self) -> Result<(), ParseError> {
        if self.eat_punct(Punct::SemiColon) {
            return Ok(());
        }

        let token = self.peek();
        if token.newline_before || token.is_boundary() || token.is_punct(Punct::RBrace) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        self.nested(Self::statement)
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let token = self.peek().clone();

        match token.kind {
            TokenKind::Literal(text) => {
                self.next();
                Ok(Stmt::Literal(text))
            }
            TokenKind::Line(line) => {
                self.next();
                Ok(Stmt::Line(line))
            }
            TokenKind::EmitOpen { escape } => self.parse_emit(escape),
            TokenKind::Punct(Punct::LBrace) => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::Punct(Punct::SemiColon) => {
                self.next();
                Ok(Stmt::Empty)
            }
            TokenKind::Keyword(Keyword::Var) => self.parse_declaration_statement(DeclKind::Var),
            TokenKind::Keyword(Keyword::Let) => self.parse_declaration_statement(DeclKind::Let),
            TokenKind::Keyword(Keyword::Const) => self.parse_declaration_statement(DeclKind::Const),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Break) => {
                self.next();
                self.end_statement()?;
                Ok(Stmt::Break)
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.next();
                self.end_statement()?;
                Ok(Stmt::Continue)
            }
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Throw) => {
                self.next();
                let expr = self.parse_expression()?;
                self.end_statement()?;
                Ok(Stmt::Throw(expr))
            }
            TokenKind::Keyword(Keyword::Function)
                if matches!(self.peek_at(1).kind, TokenKind::Ident(_)) =>
            {
                self.next();
                let function = self.parse_function(false)?;
                Ok(Stmt::Function(Arc::new(function)))
            }
            TokenKind::Punct(Punct::RBrace) | TokenKind::EmitClose | TokenKind::Eof => {
                Err(self.unexpected())
            }
            TokenKind::Ident(keyword) if UNSUPPORTED_STATEMENTS.contains(&keyword.as_str()) => {
                Err(ParseError::UnsupportedStatement {
                    keyword,
                    line: token.line,
                })
            }
            _ => {
                let expr = self.parse_expression()?;
                self.end_statement()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_emit(&mut self, escape: bool) -> Result<Stmt, ParseError> {
        self.next();
        let expr = if self.peek().kind == TokenKind::EmitClose {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.eat_punct(Punct::SemiColon);

        if self.peek().kind != TokenKind::EmitClose {
            return Err(self.unexpected());
        }
        self.next();

        Ok(Stmt::Emit { expr, escape })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_punct(Punct::LBrace)?;
        let mut body = Vec::new();

        while !self.eat_punct(Punct::RBrace) {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            body.push(self.parse_statement()?);
        }

        Ok(body)
    }

    fn parse_declaration_statement(&mut self, kind: DeclKind) -> Result<Stmt, ParseError> {
        let stmt = self.parse_declaration(kind)?;
        self.end_statement()?;
        Ok(stmt)
    }

    fn parse_declaration(&mut self, kind: DeclKind) -> Result<Stmt, ParseError> {
        self.next();
        let mut declarations = Vec::new();

        loop {
            let name = self.parse_ident()?;
            let init = if self.eat_punct(Punct::Assign) {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            declarations.push((name, init));

            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }

        Ok(Stmt::Declare(kind, declarations))
    }

    fn parse_ident(&mut self) -> Result<SmolStr, ParseError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.next();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Identifier or keyword, as accepted after `.` and as an object key.
    fn parse_property_name(&mut self) -> Result<SmolStr, ParseError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.next();
                Ok(name)
            }
            TokenKind::Keyword(keyword) => {
                let name = SmolStr::new_static(keyword.as_str());
                self.next();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.next();
        self.expect_punct(Punct::LParen)?;
        let test = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        let consequent = self.parse_statement()?;

        let alternate = if self.peek().is_keyword(Keyword::Else) {
            self.next();
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };

        Ok(Stmt::If(test, Box::new(consequent), alternate))
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        self.next();
        self.expect_punct(Punct::LParen)?;

        let decl = match self.peek().kind {
            TokenKind::Keyword(Keyword::Var) => Some(DeclKind::Var),
            TokenKind::Keyword(Keyword::Let) => Some(DeclKind::Let),
            TokenKind::Keyword(Keyword::Const) => Some(DeclKind::Const),
            _ => None,
        };
        let offset = usize::from(decl.is_some());

        if let TokenKind::Ident(name) = &self.peek_at(offset).kind {
            let name = name.clone();
            let follower = &self.peek_at(offset + 1).kind;
            let is_of = *follower == TokenKind::Ident(SmolStr::new_static("of"));
            let is_in = *follower == TokenKind::Keyword(Keyword::In);

            if is_of || is_in {
                self.pos += offset + 2;
                let target = match decl {
                    Some(kind) => ForTarget::Declare(kind, name),
                    None => ForTarget::Assign(name),
                };
                let subject = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                let body = Box::new(self.parse_statement()?);

                return Ok(if is_of {
                    Stmt::ForOf {
                        target,
                        iterable: subject,
                        body,
                    }
                } else {
                    Stmt::ForIn {
                        target,
                        object: subject,
                        body,
                    }
                });
            }
        }

        let init = match decl {
            Some(kind) => Some(Box::new(self.parse_declaration(kind)?)),
            None if self.peek().is_punct(Punct::SemiColon) => None,
            None => Some(Box::new(Stmt::Expr(self.parse_expression()?))),
        };
        self.expect_punct(Punct::SemiColon)?;

        let test = if self.peek().is_punct(Punct::SemiColon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::SemiColon)?;

        let update = if self.peek().is_punct(Punct::RParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::RParen)?;

        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        self.next();
        self.expect_punct(Punct::LParen)?;
        let test = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        let body = self.parse_statement()?;
        Ok(Stmt::While(test, Box::new(body)))
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        self.next();
        let token = self.peek();

        let value = if token.newline_before
            || token.is_boundary()
            || token.is_punct(Punct::SemiColon)
            || token.is_punct(Punct::RBrace)
        {
            None
        } else {
            Some(self.parse_expression()?)
        };

        self.end_statement()?;
        Ok(Stmt::Return(value))
    }

    /// Parses `name? (params) { body }` after the `function` keyword.
    fn parse_function(&mut self, anonymous_allowed: bool) -> Result<FunctionDef, ParseError> {
        let name = match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.next();
                Some(name)
            }
            _ if anonymous_allowed => None,
            _ => return Err(self.unexpected()),
        };

        let params = self.parse_params()?;
        let body = self.parse_block()?;

        Ok(FunctionDef {
            name,
            params,
            body: FunctionBody::Block(body),
            arrow: false,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, ParseError> {
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();

        while !self.eat_punct(Punct::RParen) {
            let rest = self.eat_punct(Punct::Ellipsis);
            let name = self.parse_ident()?;
            let default = if self.eat_punct(Punct::Assign) {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            params.push(Param {
                name,
                default,
                rest,
            });

            if !self.eat_punct(Punct::Comma) {
                self.expect_punct(Punct::RParen)?;
                break;
            }
        }

        Ok(params)
    }

    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::assignment)
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        if self.is_arrow_ahead() {
            return self.parse_arrow();
        }

        let line = self.peek().line;
        let target = self.parse_conditional()?;

        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Assign) => AssignOp::Assign,
            TokenKind::Punct(Punct::PlusAssign) => AssignOp::Compound(BinaryOp::Add),
            TokenKind::Punct(Punct::MinusAssign) => AssignOp::Compound(BinaryOp::Sub),
            TokenKind::Punct(Punct::StarAssign) => AssignOp::Compound(BinaryOp::Mul),
            TokenKind::Punct(Punct::SlashAssign) => AssignOp::Compound(BinaryOp::Div),
            TokenKind::Punct(Punct::PercentAssign) => AssignOp::Compound(BinaryOp::Rem),
            TokenKind::Punct(Punct::AndAssign) => AssignOp::Logical(LogicalOp::And),
            TokenKind::Punct(Punct::OrAssign) => AssignOp::Logical(LogicalOp::Or),
            TokenKind::Punct(Punct::NullishAssign) => AssignOp::Logical(LogicalOp::Nullish),
            _ => return Ok(target),
        };

        if !target.is_assignable() {
            return Err(ParseError::InvalidAssignmentTarget { line });
        }
        self.next();
        let value = self.parse_assignment()?;

        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn is_arrow_ahead(&self) -> bool {
        match self.peek().kind {
            TokenKind::Ident(_) => self.peek_at(1).is_punct(Punct::Arrow),
            TokenKind::Punct(Punct::LParen) => {
                let mut depth = 0usize;
                let mut offset = 0;
                loop {
                    let token = self.peek_at(offset);
                    match token.kind {
                        TokenKind::Punct(Punct::LParen) => depth += 1,
                        TokenKind::Punct(Punct::RParen) => {
                            depth -= 1;
                            if depth == 0 {
                                return self.peek_at(offset + 1).is_punct(Punct::Arrow);
                            }
                        }
                        TokenKind::Eof => return false,
                        _ => {}
                    }
                    offset += 1;
                }
            }
            _ => false,
        }
    }

    fn parse_arrow(&mut self) -> Result<Expr, ParseError> {
        let params = if self.peek().is_punct(Punct::LParen) {
            self.parse_params()?
        } else {
            vec![Param {
                name: self.parse_ident()?,
                default: None,
                rest: false,
            }]
        };
        self.expect_punct(Punct::Arrow)?;

        let body = if self.peek().is_punct(Punct::LBrace) {
            FunctionBody::Block(self.parse_block()?)
        } else {
            FunctionBody::Expr(Box::new(self.parse_assignment()?))
        };

        Ok(Expr::Function(Arc::new(FunctionDef {
            name: None,
            params,
            body,
            arrow: true,
        })))
    }

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let test = self.parse_binary(1)?;

        if !self.eat_punct(Punct::Question) {
            return Ok(test);
        }

        let consequent = self.parse_assignment()?;
        self.expect_punct(Punct::Colon)?;
        let alternate = self.parse_assignment()?;

        Ok(Expr::Conditional(
            Box::new(test),
            Box::new(consequent),
            Box::new(alternate),
        ))
    }

    #[inline(always)]
    fn binary_op(kind: &TokenKind) -> Option<(Binary, u8)> {
        let op = match kind {
            TokenKind::Punct(Punct::Nullish) => (Binary::Logical(LogicalOp::Nullish), 1),
            TokenKind::Punct(Punct::Or) => (Binary::Logical(LogicalOp::Or), 2),
            TokenKind::Punct(Punct::And) => (Binary::Logical(LogicalOp::And), 3),
            TokenKind::Punct(Punct::EqEq) => (Binary::Arithmetic(BinaryOp::Eq), 4),
            TokenKind::Punct(Punct::NotEq) => (Binary::Arithmetic(BinaryOp::NotEq), 4),
            TokenKind::Punct(Punct::EqEqEq) => (Binary::Arithmetic(BinaryOp::StrictEq), 4),
            TokenKind::Punct(Punct::NotEqEq) => (Binary::Arithmetic(BinaryOp::StrictNotEq), 4),
            TokenKind::Punct(Punct::Lt) => (Binary::Arithmetic(BinaryOp::Lt), 5),
            TokenKind::Punct(Punct::Lte) => (Binary::Arithmetic(BinaryOp::Lte), 5),
            TokenKind::Punct(Punct::Gt) => (Binary::Arithmetic(BinaryOp::Gt), 5),
            TokenKind::Punct(Punct::Gte) => (Binary::Arithmetic(BinaryOp::Gte), 5),
            TokenKind::Keyword(Keyword::In) => (Binary::Arithmetic(BinaryOp::In), 5),
            TokenKind::Keyword(Keyword::Instanceof) => {
                (Binary::Arithmetic(BinaryOp::Instanceof), 5)
            }
            TokenKind::Punct(Punct::Plus) => (Binary::Arithmetic(BinaryOp::Add), 6),
            TokenKind::Punct(Punct::Minus) => (Binary::Arithmetic(BinaryOp::Sub), 6),
            TokenKind::Punct(Punct::Star) => (Binary::Arithmetic(BinaryOp::Mul), 7),
            TokenKind::Punct(Punct::Slash) => (Binary::Arithmetic(BinaryOp::Div), 7),
            TokenKind::Punct(Punct::Percent) => (Binary::Arithmetic(BinaryOp::Rem), 7),
            TokenKind::Punct(Punct::StarStar) => (Binary::Arithmetic(BinaryOp::Pow), 8),
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;

        while let Some((op, prec)) = Self::binary_op(&self.peek().kind) {
            if prec < min_prec {
                break;
            }
            self.next();

            // `**` is right associative.
            let next_prec = if op == Binary::Arithmetic(BinaryOp::Pow) {
                prec
            } else {
                prec + 1
            };
            let rhs = self.nested(|parser| parser.parse_binary(next_prec))?;

            lhs = match op {
                Binary::Arithmetic(op) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
                Binary::Logical(op) => Expr::Logical(op, Box::new(lhs), Box::new(rhs)),
            };
        }

        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::unary)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Bang) => Some(UnaryOp::Not),
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Neg),
            TokenKind::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            TokenKind::Keyword(Keyword::Typeof) => Some(UnaryOp::Typeof),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            return Ok(Expr::Unary(op, Box::new(self.parse_unary()?)));
        }

        match self.peek().kind {
            TokenKind::Keyword(Keyword::Await) => {
                self.next();
                Ok(Expr::Await(Box::new(self.parse_unary()?)))
            }
            TokenKind::Punct(Punct::PlusPlus) | TokenKind::Punct(Punct::MinusMinus) => {
                let increment = self.next().is_punct(Punct::PlusPlus);
                let line = self.peek().line;
                let target = self.parse_unary()?;
                if !target.is_assignable() {
                    return Err(ParseError::InvalidAssignmentTarget { line });
                }
                Ok(Expr::Update {
                    increment,
                    prefix: true,
                    target: Box::new(target),
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let line = self.peek().line;
        let expr = self.parse_call_member()?;
        let token = self.peek();

        if token.newline_before
            || !(token.is_punct(Punct::PlusPlus) || token.is_punct(Punct::MinusMinus))
        {
            return Ok(expr);
        }
        if !expr.is_assignable() {
            return Err(ParseError::InvalidAssignmentTarget { line });
        }

        let increment = self.next().is_punct(Punct::PlusPlus);
        Ok(Expr::Update {
            increment,
            prefix: false,
            target: Box::new(expr),
        })
    }

    fn parse_call_member(&mut self) -> Result<Expr, ParseError> {
        let mut expr = if self.peek().is_keyword(Keyword::New) {
            self.next();
            let callee = self.parse_member_only()?;
            let args = if self.peek().is_punct(Punct::LParen) {
                self.parse_args()?
            } else {
                Vec::new()
            };
            Expr::New {
                callee: Box::new(callee),
                args,
            }
        } else {
            self.parse_primary()?
        };

        loop {
            match self.peek().kind {
                TokenKind::Punct(Punct::Dot) => {
                    self.next();
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: self.parse_property_name()?,
                        optional: false,
                    };
                }
                TokenKind::Punct(Punct::QuestionDot) => {
                    self.next();
                    expr = match self.peek().kind {
                        TokenKind::Punct(Punct::LParen) => Expr::Call {
                            callee: Box::new(expr),
                            args: self.parse_args()?,
                            optional: true,
                        },
                        TokenKind::Punct(Punct::LBracket) => {
                            self.next();
                            let index = self.parse_expression()?;
                            self.expect_punct(Punct::RBracket)?;
                            Expr::Index {
                                object: Box::new(expr),
                                index: Box::new(index),
                                optional: true,
                            }
                        }
                        _ => Expr::Member {
                            object: Box::new(expr),
                            property: self.parse_property_name()?,
                            optional: true,
                        },
                    };
                }
                TokenKind::Punct(Punct::LBracket) => {
                    self.next();
                    let index = self.parse_expression()?;
                    self.expect_punct(Punct::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: false,
                    };
                }
                TokenKind::Punct(Punct::LParen) => {
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args: self.parse_args()?,
                        optional: false,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// The callee of `new`: a primary with member accesses but no call.
    fn parse_member_only(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        while self.eat_punct(Punct::Dot) {
            expr = Expr::Member {
                object: Box::new(expr),
                property: self.parse_property_name()?,
                optional: false,
            };
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect_punct(Punct::LParen)?;
        let mut args = Vec::new();

        while !self.eat_punct(Punct::RParen) {
            if self.eat_punct(Punct::Ellipsis) {
                args.push(Expr::Spread(Box::new(self.parse_assignment()?)));
            } else {
                args.push(self.parse_assignment()?);
            }

            if !self.eat_punct(Punct::Comma) {
                self.expect_punct(Punct::RParen)?;
                break;
            }
        }

        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();

        let expr = match token.kind {
            TokenKind::Number(n) => {
                self.next();
                Expr::Number(n)
            }
            TokenKind::String(s) => {
                self.next();
                Expr::String(s.into())
            }
            TokenKind::Template(parts) => {
                self.next();
                Expr::Template(
                    parts
                        .into_iter()
                        .map(|part| match part {
                            TemplatePart::Text(text) => Ok(TemplateSegment::Text(text)),
                            TemplatePart::Code(tokens) => {
                                let mut parser = Parser::new(tokens);
                                parser.depth = self.depth;
                                let expr = parser.parse_expression()?;
                                if !parser.at_eof() {
                                    return Err(parser.unexpected());
                                }
                                Ok(TemplateSegment::Expr(expr))
                            }
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
            TokenKind::Keyword(Keyword::True) => {
                self.next();
                Expr::Bool(true)
            }
            TokenKind::Keyword(Keyword::False) => {
                self.next();
                Expr::Bool(false)
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.next();
                Expr::Null
            }
            TokenKind::Keyword(Keyword::Function) => {
                self.next();
                Expr::Function(Arc::new(self.parse_function(true)?))
            }
            TokenKind::Ident(name) => {
                self.next();
                Expr::Ident(name)
            }
            TokenKind::Punct(Punct::LParen) => {
                self.next();
                let expr = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                expr
            }
            TokenKind::Punct(Punct::LBracket) => self.parse_array()?,
            TokenKind::Punct(Punct::LBrace) => self.parse_object()?,
            _ => return Err(self.unexpected()),
        };

        Ok(expr)
    }

    fn parse_array(&mut self) -> Result<Expr, ParseError> {
        self.expect_punct(Punct::LBracket)?;
        let mut elements = Vec::new();

        while !self.eat_punct(Punct::RBracket) {
            if self.eat_punct(Punct::Ellipsis) {
                elements.push(Expr::Spread(Box::new(self.parse_assignment()?)));
            } else {
                elements.push(self.parse_assignment()?);
            }

            if !self.eat_punct(Punct::Comma) {
                self.expect_punct(Punct::RBracket)?;
                break;
            }
        }

        Ok(Expr::Array(elements))
    }

    fn parse_object(&mut self) -> Result<Expr, ParseError> {
        self.expect_punct(Punct::LBrace)?;
        let mut properties = Vec::new();

        while !self.eat_punct(Punct::RBrace) {
            if self.eat_punct(Punct::Ellipsis) {
                properties.push(Property::Spread(self.parse_assignment()?));
            } else {
                properties.push(self.parse_property()?);
            }

            if !self.eat_punct(Punct::Comma) {
                self.expect_punct(Punct::RBrace)?;
                break;
            }
        }

        Ok(Expr::Object(properties))
    }

    fn parse_property(&mut self) -> Result<Property, ParseError> {
        let token = self.peek().clone();

        let (key, shorthand) = match token.kind {
            TokenKind::Punct(Punct::LBracket) => {
                self.next();
                let key = self.parse_assignment()?;
                self.expect_punct(Punct::RBracket)?;
                (PropertyKey::Computed(key), None)
            }
            TokenKind::String(s) => {
                self.next();
                (PropertyKey::Static(s.into()), None)
            }
            TokenKind::Number(n) => {
                self.next();
                (PropertyKey::Static(super::value::number_to_string(n).into()), None)
            }
            TokenKind::Ident(ref name) => {
                self.next();
                (PropertyKey::Static(name.clone()), Some(name.clone()))
            }
            _ => (PropertyKey::Static(self.parse_property_name()?), None),
        };

        if self.eat_punct(Punct::Colon) {
            return Ok(Property::KeyValue(key, self.parse_assignment()?));
        }

        if self.peek().is_punct(Punct::LParen) {
            let name = match &key {
                PropertyKey::Static(name) => Some(name.clone()),
                PropertyKey::Computed(_) => None,
            };
            let params = self.parse_params()?;
            let body = self.parse_block()?;
            let method = FunctionDef {
                name,
                params,
                body: FunctionBody::Block(body),
                arrow: false,
            };
            return Ok(Property::KeyValue(key, Expr::Function(Arc::new(method))));
        }

        match shorthand {
            Some(name) => Ok(Property::KeyValue(key, Expr::Ident(name))),
            None => Err(self.unexpected()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::tokenize;
    use rstest::rstest;

    fn parse(code: &str) -> Result<Vec<Stmt>, ParseError> {
        Parser::new(tokenize(code, 1)?).parse_program()
    }

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.into()))
    }

    #[rstest]
    #[case::precedence(
        "a + b * c",
        Stmt::Expr(Expr::Binary(
            BinaryOp::Add,
            ident("a"),
            Box::new(Expr::Binary(BinaryOp::Mul, ident("b"), ident("c")))
        ))
    )]
    #[case::pow_right_assoc(
        "a ** b ** c",
        Stmt::Expr(Expr::Binary(
            BinaryOp::Pow,
            ident("a"),
            Box::new(Expr::Binary(BinaryOp::Pow, ident("b"), ident("c")))
        ))
    )]
    #[case::logical(
        "a || b && c",
        Stmt::Expr(Expr::Logical(
            LogicalOp::Or,
            ident("a"),
            Box::new(Expr::Logical(LogicalOp::And, ident("b"), ident("c")))
        ))
    )]
    #[case::conditional(
        "a ? b : c",
        Stmt::Expr(Expr::Conditional(ident("a"), ident("b"), ident("c")))
    )]
    #[case::member_call(
        "user.name.toUpperCase()",
        Stmt::Expr(Expr::Call {
            callee: Box::new(Expr::Member {
                object: Box::new(Expr::Member {
                    object: ident("user"),
                    property: "name".into(),
                    optional: false,
                }),
                property: "toUpperCase".into(),
                optional: false,
            }),
            args: vec![],
            optional: false,
        })
    )]
    #[case::declaration(
        "var a = 1, b",
        Stmt::Declare(
            DeclKind::Var,
            vec![("a".into(), Some(Expr::Number(1.0))), ("b".into(), None)]
        )
    )]
    #[case::compound_assignment(
        "total += 2",
        Stmt::Expr(Expr::Assign {
            op: AssignOp::Compound(BinaryOp::Add),
            target: ident("total"),
            value: Box::new(Expr::Number(2.0)),
        })
    )]
    #[case::postfix(
        "i++",
        Stmt::Expr(Expr::Update { increment: true, prefix: false, target: ident("i") })
    )]
    fn test_parse_statement(#[case] code: &str, #[case] expected: Stmt) {
        assert_eq!(parse(code), Ok(vec![expected]));
    }

    #[test]
    fn test_parse_arrow_functions() {
        let program = parse("items.map(x => x * 2)\nitems.map((a, b) => { return a })").unwrap();
        assert_eq!(program.len(), 2);

        let Stmt::Expr(Expr::Call { args, .. }) = &program[0] else {
            panic!("expected call");
        };
        let Expr::Function(function) = &args[0] else {
            panic!("expected function");
        };
        assert!(function.arrow);
        assert_eq!(function.params[0].name, "x");
        assert!(matches!(function.body, FunctionBody::Expr(_)));
    }

    #[test]
    fn test_parse_object_literal() {
        let program =
            parse("var o = { a: 1, b, 'c d': 2, [k]: 3, ...rest, m() { return 1 } }").unwrap();
        let Stmt::Declare(_, declarations) = &program[0] else {
            panic!("expected declaration");
        };
        let Some(Expr::Object(properties)) = &declarations[0].1 else {
            panic!("expected object");
        };
        assert_eq!(properties.len(), 6);
        assert_eq!(
            properties[1],
            Property::KeyValue(PropertyKey::Static("b".into()), Expr::Ident("b".into()))
        );
        assert!(matches!(properties[4], Property::Spread(_)));
    }

    #[rstest]
    #[case("for (var i = 0; i < 3; i++) x", "for")]
    #[case("for (const item of items) x", "of")]
    #[case("for (key in obj) x", "in")]
    fn test_parse_for(#[case] code: &str, #[case] kind: &str) {
        let program = parse(code).unwrap();
        let matched = match (&program[0], kind) {
            (Stmt::For { .. }, "for") => true,
            (Stmt::ForOf { target: ForTarget::Declare(DeclKind::Const, name), .. }, "of") => {
                name == "item"
            }
            (Stmt::ForIn { target: ForTarget::Assign(name), .. }, "in") => name == "key",
            _ => false,
        };
        assert!(matched, "{program:?}");
    }

    #[test]
    fn test_parse_if_else_across_newlines() {
        let program = parse("if (x) {\n a\n} else {\n b\n}").unwrap();
        assert!(matches!(&program[0], Stmt::If(_, _, Some(_))));
    }

    #[test]
    fn test_parse_return_newline_terminates() {
        let program = parse("function f() { return\n 1 }").unwrap();
        let Stmt::Function(function) = &program[0] else {
            panic!("expected function");
        };
        let FunctionBody::Block(body) = &function.body else {
            panic!("expected block");
        };
        assert_eq!(body[0], Stmt::Return(None));
    }

    #[test]
    fn test_parse_template_tokens() {
        let tokens = vec![
            Token::new(TokenKind::Keyword(Keyword::If), 1, true),
            Token::new(TokenKind::Punct(Punct::LParen), 1, false),
            Token::new(TokenKind::Ident("x".into()), 1, false),
            Token::new(TokenKind::Punct(Punct::RParen), 1, false),
            Token::new(TokenKind::Punct(Punct::LBrace), 1, false),
            Token::new(TokenKind::Literal("Yes".to_string()), 1, true),
            Token::new(TokenKind::EmitOpen { escape: true }, 1, true),
            Token::new(TokenKind::Ident("name".into()), 1, false),
            Token::new(TokenKind::EmitClose, 1, true),
            Token::new(TokenKind::Line(2), 2, true),
            Token::new(TokenKind::Punct(Punct::RBrace), 2, true),
        ];

        assert_eq!(
            Parser::new(tokens).parse_program(),
            Ok(vec![Stmt::If(
                Expr::Ident("x".into()),
                Box::new(Stmt::Block(vec![
                    Stmt::Literal("Yes".to_string()),
                    Stmt::Emit {
                        expr: Some(Expr::Ident("name".into())),
                        escape: true
                    },
                    Stmt::Line(2),
                ])),
                None
            )])
        );
    }

    #[rstest]
    #[case("a b", ParseError::UnexpectedToken { token: "b".to_string(), line: 1 })]
    #[case("if (x", ParseError::UnexpectedEof { line: 1 })]
    #[case("1 = 2", ParseError::InvalidAssignmentTarget { line: 1 })]
    #[case("{ a", ParseError::UnexpectedEof { line: 1 })]
    fn test_parse_errors(#[case] code: &str, #[case] expected: ParseError) {
        assert_eq!(parse(code), Err(expected));
    }

    #[rstest]
    #[case::switch("switch (x) { case 1: y() }", "switch", 1)]
    #[case::try_catch("try\n{ a() }\ncatch (e)\n{ b() }", "try", 1)]
    #[case::catch_on_later_line("x = 1\ncatch (e) {}", "catch", 2)]
    #[case::class("class A {}", "class", 1)]
    #[case::do_while("do { i++ } while (i < 3)", "do", 1)]
    fn test_unsupported_statements(#[case] code: &str, #[case] keyword: &str, #[case] line: u32) {
        assert_eq!(
            parse(code),
            Err(ParseError::UnsupportedStatement {
                keyword: keyword.into(),
                line,
            })
        );
    }

    #[test]
    fn test_regex_literal_is_rejected() {
        assert_eq!(
            parse("x = /a+/.test(s)"),
            Err(ParseError::UnexpectedToken {
                token: "/".to_string(),
                line: 1
            })
        );
    }

    #[rstest]
    #[case(format!("{}1{}", "(".repeat(5000), ")".repeat(5000)))]
    #[case(format!("x = {}1{}", "[".repeat(5000), "]".repeat(5000)))]
    #[case(format!("x = {}1", "!".repeat(5000)))]
    #[case(format!("x = 2{}", " ** 2".repeat(5000)))]
    #[case("if (x) { ".repeat(5000))]
    #[case(format!("x = {}1{}", "`${".repeat(5000), "}`".repeat(5000)))]
    fn test_deep_nesting_is_rejected(#[case] code: String) {
        assert_eq!(parse(&code), Err(ParseError::NestingTooDeep { line: 1 }));
    }

    #[test]
    fn test_nesting_within_limit() {
        let depth = MAX_NESTING_DEPTH / 4;
        let code = format!("x = {}1{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(
            parse(&code),
            Ok(vec![Stmt::Expr(Expr::Assign {
                op: AssignOp::Assign,
                target: Box::new(Expr::Ident("x".into())),
                value: Box::new(Expr::Number(1.0)),
            })])
        );
    }
}

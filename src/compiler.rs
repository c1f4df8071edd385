//! The curly-brace front-end.
//!
//! A logos lexer and a Pratt parser that emit Core pair trees: the compiler
//! is just another producer of the AST shape the evaluator already accepts,
//! so `let x = 1;` comes out as the pair `(let x 1)`. Parse errors use
//! panic-mode recovery, synchronizing at `;` or the next statement keyword.
//!
//! Everything the parser builds is kept reachable through the root stack:
//! sub-expressions stay rooted until the enclosing statement is linked into
//! the program list, and statement boundaries restore to a base mark.

use logos::Logos;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Diagnostic, Error, SyntaxError};
use crate::reader::unescape_string;
use crate::span::Span;
use crate::value::{fits_fixnum, Obj, Type, FIXNUM_MAX, FIXNUM_MIN};

//===----------------------------------------------------------------------===//
// Lexer
//===----------------------------------------------------------------------===//

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tok {
    #[regex(r"[ \t\r\n]+", logos::skip)]
    #[regex(r"//[^\n]*", logos::skip)]
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("-")]
    Minus,
    #[token("+")]
    Plus,
    #[token(";")]
    Semicolon,
    #[token("/")]
    Slash,
    #[token("*")]
    Star,

    #[token("!")]
    Bang,
    #[token("!=")]
    BangEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Identifier,
    #[regex(r#""([^"\\]|\\.)*""#)]
    Str,
    #[regex(r#""([^"\\]|\\.)*"#, priority = 1)]
    UnterminatedStr,
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?")]
    Number,
    #[regex(r"0[xX][0-9a-fA-F]+")]
    HexNumber,

    #[token("and")]
    And,
    #[token("else")]
    Else,
    #[token("export")]
    Export,
    #[token("false")]
    False,
    #[token("fn")]
    Fn,
    #[token("if")]
    If,
    #[token("import")]
    Import,
    #[token("let")]
    Let,
    #[token("module")]
    Module,
    #[token("nil")]
    Nil,
    #[token("or")]
    Or,
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("while")]
    While,

    // A NUL terminates the input, matching the C-string convention.
    #[token("\u{0}")]
    Eof,
    // Lowest priority: catches any character no other rule wants.
    #[regex(r".", priority = 0)]
    Unexpected,
}

#[derive(Debug, Clone)]
struct TokenAt {
    tok: Tok,
    span: Span,
}

fn tokenize(source: &str) -> Vec<TokenAt> {
    let mut lexer = Tok::lexer(source);
    let mut tokens = Vec::new();
    while let Some(item) = lexer.next() {
        let tok = item.unwrap_or(Tok::Unexpected);
        if tok == Tok::Eof {
            break;
        }
        tokens.push(TokenAt { tok, span: lexer.span() });
    }
    tokens.push(TokenAt { tok: Tok::Eof, span: source.len()..source.len() });
    tokens
}

//===----------------------------------------------------------------------===//
// Precedence
//===----------------------------------------------------------------------===//

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call | Prec::Primary => Prec::Primary,
        }
    }
}

/// Infix binding power; `Prec::None` marks tokens with no infix role.
fn infix_prec(tok: Tok) -> Prec {
    match tok {
        Tok::Equal => Prec::Assignment,
        Tok::Or => Prec::Or,
        Tok::And => Prec::And,
        Tok::BangEqual | Tok::EqualEqual => Prec::Equality,
        Tok::Greater | Tok::GreaterEqual | Tok::Less | Tok::LessEqual => Prec::Comparison,
        Tok::Minus | Tok::Plus => Prec::Term,
        Tok::Slash | Tok::Star => Prec::Factor,
        Tok::LParen | Tok::Dot => Prec::Call,
        _ => Prec::None,
    }
}

//===----------------------------------------------------------------------===//
// Parser
//===----------------------------------------------------------------------===//

struct Compiler<'s> {
    source: &'s str,
    shared: Arc<str>,
    tokens: Vec<TokenAt>,
    pos: usize,
    current: TokenAt,
    previous: TokenAt,
    errors: Vec<SyntaxError>,
    panic_mode: bool,
}

/// Compiles curly-brace source into a Core AST living in the context's
/// heap. The returned program is left protected on the root stack; the
/// caller owns the save/restore bracket around compile-and-eval.
pub fn compile(ctx: &mut Context, source: &str) -> Result<Obj, Diagnostic> {
    let shared: Arc<str> = Arc::from(source);
    let mut compiler = Compiler::new(source, Arc::clone(&shared));
    let base = ctx.save_gc();
    match compiler.program(ctx) {
        Ok(program) if compiler.errors.is_empty() => Ok(program),
        Ok(_) => {
            ctx.restore_gc(base);
            let first = compiler.errors.remove(0);
            let span = first.span.clone();
            Err(Diagnostic::with_location(Error::Syntax(first), shared, span))
        }
        Err(e) => {
            ctx.restore_gc(base);
            Err(ctx.diagnose(e))
        }
    }
}

/// Compiles and evaluates `source`, restoring the root stack afterwards.
pub fn do_string(ctx: &mut Context, source: &str) -> Result<Obj, Diagnostic> {
    let save = ctx.save_gc();
    let compiled = compile(ctx, source);
    let out = match compiled {
        Ok(program) => crate::eval::eval(ctx, program).map_err(|e| ctx.diagnose(e)),
        Err(diag) => Err(diag),
    };
    ctx.restore_gc(save);
    out
}

impl<'s> Compiler<'s> {
    fn new(source: &'s str, shared: Arc<str>) -> Self {
        let tokens = tokenize(source);
        let eof = TokenAt { tok: Tok::Eof, span: source.len()..source.len() };
        Compiler {
            source,
            shared,
            tokens,
            pos: 0,
            current: eof.clone(),
            previous: eof,
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    //===------------------------------------------------------------------===//
    // Token plumbing and errors
    //===------------------------------------------------------------------===//

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            let t = if self.pos < self.tokens.len() {
                let t = self.tokens[self.pos].clone();
                self.pos += 1;
                t
            } else {
                TokenAt { tok: Tok::Eof, span: self.source.len()..self.source.len() }
            };
            match t.tok {
                Tok::Unexpected => self.error_at(t.span, "Unexpected character."),
                Tok::UnterminatedStr => self.error_at(t.span, "Unterminated string."),
                _ => {
                    self.current = t;
                    break;
                }
            }
        }
    }

    fn check(&self, tok: Tok) -> bool {
        self.current.tok == tok
    }

    fn match_tok(&mut self, tok: Tok) -> bool {
        if !self.check(tok) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, tok: Tok, message: &str) {
        if self.check(tok) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at(&mut self, span: Span, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(SyntaxError { message: message.to_string(), span });
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous.span.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.span.clone(), message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.tok != Tok::Eof {
            if self.previous.tok == Tok::Semicolon {
                return;
            }
            match self.current.tok {
                Tok::Fn | Tok::Let | Tok::If | Tok::While | Tok::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    //===------------------------------------------------------------------===//
    // AST builders
    //===------------------------------------------------------------------===//

    /// Cons with the previous token's span attached when recording is on.
    fn cons_spanned(&mut self, ctx: &mut Context, car: Obj, cdr: Obj) -> Result<Obj, Error> {
        let obj = ctx.cons(car, cdr)?;
        if ctx.span_recording() {
            if let Obj::Cell(id) = obj {
                ctx.spans.record(id, &self.shared, self.previous.span.clone());
            }
        }
        Ok(obj)
    }

    fn make_unary(&mut self, ctx: &mut Context, op: &str, right: Obj) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        let op_sym = ctx.symbol(op)?;
        let list = ctx.cons(right, Obj::Nil)?;
        let res = self.cons_spanned(ctx, op_sym, list)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn make_binary(
        &mut self,
        ctx: &mut Context,
        op: &str,
        left: Obj,
        right: Obj,
    ) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        let op_sym = ctx.symbol(op)?;
        let tmp = ctx.cons(right, Obj::Nil)?;
        let tmp = ctx.cons(left, tmp)?;
        let res = self.cons_spanned(ctx, op_sym, tmp)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn symbol_from_previous(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        if self.previous.tok != Tok::Identifier {
            return Ok(Obj::Nil);
        }
        let span = self.previous.span.clone();
        if span.len() >= 256 {
            self.error("Identifier too long.");
            return Ok(Obj::Nil);
        }
        let name = &self.source[span];
        ctx.symbol(name)
    }

    fn string_from_previous(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        if self.previous.tok != Tok::Str {
            return Ok(Obj::Nil);
        }
        let span = self.previous.span.clone();
        let raw = &self.source[span.start + 1..span.end - 1];
        let unescaped = unescape_string(raw);
        ctx.string(&unescaped)
    }

    fn number_literal(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let span = self.previous.span.clone();
        let text = &self.source[span];
        if self.previous.tok == Tok::HexNumber {
            return match i128::from_str_radix(&text[2..], 16) {
                Ok(v) if v >= FIXNUM_MIN as i128 && v <= FIXNUM_MAX as i128 => {
                    Ok(Obj::Fix(v as i64))
                }
                Ok(v) => ctx.number(v as f64),
                Err(_) => {
                    self.error("Invalid number.");
                    Ok(Obj::Nil)
                }
            };
        }
        let plain_int =
            !text.contains('.') && !text.contains('e') && !text.contains('E');
        if plain_int {
            if let Ok(i) = text.parse::<i64>() {
                if fits_fixnum(i) {
                    return Ok(Obj::Fix(i));
                }
            }
        }
        ctx.number(text.parse::<f64>().unwrap_or(0.0))
    }

    //===------------------------------------------------------------------===//
    // Expressions
    //===------------------------------------------------------------------===//

    fn expression(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        self.parse_precedence(ctx, Prec::Assignment)
    }

    fn parse_precedence(&mut self, ctx: &mut Context, prec: Prec) -> Result<Obj, Error> {
        self.advance();
        let mut left = self.parse_prefix(ctx)?;

        while infix_prec(self.current.tok) != Prec::None
            && prec <= infix_prec(self.current.tok)
        {
            self.advance();
            let op = self.previous.tok;
            left = match op {
                Tok::Equal => {
                    if ctx.type_of(left) != Type::Symbol {
                        self.error("Invalid assignment target.");
                        return Ok(Obj::Nil);
                    }
                    let right = self.parse_precedence(ctx, Prec::Assignment)?;
                    self.make_binary(ctx, "=", left, right)?
                }
                Tok::LParen => self.call(ctx, left)?,
                Tok::Dot => {
                    self.consume(Tok::Identifier, "Expect property name after '.'.");
                    let property = self.symbol_from_previous(ctx)?;
                    self.make_binary(ctx, "get", left, property)?
                }
                _ => self.binary(ctx, op, left)?,
            };
        }
        Ok(left)
    }

    fn parse_prefix(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        match self.previous.tok {
            Tok::LParen => self.grouping(ctx),
            Tok::Minus | Tok::Bang => self.unary(ctx),
            Tok::LBracket => self.list_literal(ctx),
            Tok::Number | Tok::HexNumber => self.number_literal(ctx),
            Tok::Str => self.string_from_previous(ctx),
            Tok::True => Ok(Obj::Bool(true)),
            Tok::False => Ok(Obj::Bool(false)),
            Tok::Nil => Ok(Obj::Nil),
            Tok::Identifier => self.symbol_from_previous(ctx),
            Tok::Fn => self.fn_declaration(ctx),
            _ => {
                self.error("Expect expression.");
                Ok(Obj::Nil)
            }
        }
    }

    fn grouping(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let expr = self.expression(ctx)?;
        self.consume(Tok::RParen, "Expect ')' after expression.");
        Ok(expr)
    }

    fn unary(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let op = self.previous.tok;
        let right = self.parse_precedence(ctx, Prec::Unary)?;
        match op {
            Tok::Minus => self.make_unary(ctx, "-", right),
            Tok::Bang => self.make_unary(ctx, "not", right),
            _ => Ok(Obj::Nil),
        }
    }

    fn binary(&mut self, ctx: &mut Context, op: Tok, left: Obj) -> Result<Obj, Error> {
        let op_str = match op {
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Less => "<",
            Tok::LessEqual => "<=",
            Tok::And => "and",
            Tok::Or => "or",
            Tok::EqualEqual | Tok::BangEqual => "is",
            Tok::Greater | Tok::GreaterEqual => "",
            _ => {
                self.error("Unhandled infix operator.");
                return Ok(Obj::Nil);
            }
        };
        let right = self.parse_precedence(ctx, infix_prec(op).next())?;
        match op {
            // `a != b` becomes (not (is a b)).
            Tok::BangEqual => {
                let eq = self.make_binary(ctx, "is", left, right)?;
                self.make_unary(ctx, "not", eq)
            }
            // `>` and `>=` swap operands onto `<` and `<=`.
            Tok::Greater => self.make_binary(ctx, "<", right, left),
            Tok::GreaterEqual => self.make_binary(ctx, "<=", right, left),
            _ => self.make_binary(ctx, op_str, left, right),
        }
    }

    fn call(&mut self, ctx: &mut Context, callee: Obj) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        let mut head = Obj::Nil;
        let mut tail: Option<Obj> = None;
        if !self.check(Tok::RParen) {
            loop {
                let arg = self.expression(ctx)?;
                let pair = ctx.cons(arg, Obj::Nil)?;
                match tail {
                    Some(t) => ctx.set_cdr(t, pair)?,
                    None => head = pair,
                }
                tail = Some(pair);
                if !self.match_tok(Tok::Comma) {
                    break;
                }
            }
        }
        self.consume(Tok::RParen, "Expect ')' after arguments.");
        let res = self.cons_spanned(ctx, callee, head)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn list_literal(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        let mut head = Obj::Nil;
        let mut tail: Option<Obj> = None;
        if !self.check(Tok::RBracket) {
            loop {
                let elem = self.expression(ctx)?;
                let pair = ctx.cons(elem, Obj::Nil)?;
                match tail {
                    Some(t) => ctx.set_cdr(t, pair)?,
                    None => head = pair,
                }
                tail = Some(pair);
                ctx.restore_gc(save);
                ctx.push_gc(head)?;
                if !self.match_tok(Tok::Comma) {
                    break;
                }
            }
        }
        self.consume(Tok::RBracket, "Expect ']' after list elements.");
        let list_sym = ctx.symbol("list")?;
        let res = self.cons_spanned(ctx, list_sym, head)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    //===------------------------------------------------------------------===//
    // Statements and declarations
    //===------------------------------------------------------------------===//

    fn block(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        let mut head = Obj::Nil;
        let mut tail: Option<Obj> = None;
        let mut count = 0usize;

        while !self.check(Tok::RBrace) && !self.check(Tok::Eof) {
            let decl = self.declaration(ctx)?;
            let pair = ctx.cons(decl, Obj::Nil)?;
            match tail {
                Some(t) => ctx.set_cdr(t, pair)?,
                None => head = pair,
            }
            tail = Some(pair);
            count += 1;
            ctx.restore_gc(save);
            ctx.push_gc(head)?;
        }
        self.consume(Tok::RBrace, "Expect '}' after block.");

        if count == 0 {
            ctx.restore_gc(save);
            return Ok(Obj::Nil);
        }
        if count == 1 {
            let only = ctx.car(head)?;
            ctx.restore_gc(save);
            ctx.push_gc(only)?;
            return Ok(only);
        }
        let do_sym = ctx.symbol("do")?;
        let res = self.cons_spanned(ctx, do_sym, head)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    /// Parses `(p, ...) { body }`; used for both named declarations and
    /// anonymous function expressions.
    fn fn_declaration(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        self.consume(Tok::LParen, "Expect '(' after 'fn'.");
        let mut params = Obj::Nil;
        let mut count = 0usize;
        if !self.check(Tok::RParen) {
            loop {
                self.consume(Tok::Identifier, "Expect parameter name.");
                let param = self.symbol_from_previous(ctx)?;
                params = ctx.cons(param, params)?;
                count += 1;
                if !self.match_tok(Tok::Comma) {
                    break;
                }
            }
        }
        self.consume(Tok::RParen, "Expect ')' after parameters.");

        // The list above is built back-to-front; reverse into source order.
        let mut reversed = Obj::Nil;
        let mut rest = params;
        for _ in 0..count {
            let p = ctx.car(rest)?;
            reversed = ctx.cons(p, reversed)?;
            rest = ctx.cdr(rest)?;
        }

        self.consume(Tok::LBrace, "Expect '{' before function body.");
        let body = self.block(ctx)?;

        let list = ctx.cons(body, Obj::Nil)?;
        let list = ctx.cons(reversed, list)?;
        let fn_sym = ctx.symbol("fn")?;
        let res = self.cons_spanned(ctx, fn_sym, list)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn var_declaration(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        self.consume(Tok::Identifier, "Expect variable name.");
        let name = self.symbol_from_previous(ctx)?;
        let value = if self.match_tok(Tok::Equal) {
            self.expression(ctx)?
        } else {
            Obj::Nil
        };
        self.consume(Tok::Semicolon, "Expect ';' after variable declaration.");

        if name == Obj::Nil {
            self.error("Variable name cannot be nil.");
            return Ok(Obj::Nil);
        }
        self.make_binary(ctx, "let", name, value)
    }

    fn module_declaration(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        self.consume(Tok::LParen, "Expect '(' after 'module'.");
        self.consume(Tok::Str, "Expect module name string.");
        let name = self.string_from_previous(ctx)?;
        self.consume(Tok::RParen, "Expect ')' after module name.");

        self.consume(Tok::LBrace, "Expect '{' before module body.");
        let body = self.block(ctx)?;

        let list = ctx.cons(body, Obj::Nil)?;
        let list = ctx.cons(name, list)?;
        let module_sym = ctx.symbol("module")?;
        let res = self.cons_spanned(ctx, module_sym, list)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn import_declaration(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        self.consume(Tok::Identifier, "Expect module name to import.");
        let name = self.symbol_from_previous(ctx)?;
        self.consume(Tok::Semicolon, "Expect ';' after import statement.");

        let save = ctx.save_gc();
        let list = ctx.cons(name, Obj::Nil)?;
        let import_sym = ctx.symbol("import")?;
        let res = self.cons_spanned(ctx, import_sym, list)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn return_statement(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let value = if self.check(Tok::Semicolon) {
            Obj::Nil
        } else {
            self.expression(ctx)?
        };
        self.consume(Tok::Semicolon, "Expect ';' after return value.");

        let save = ctx.save_gc();
        let list = ctx.cons(value, Obj::Nil)?;
        let return_sym = ctx.symbol("return")?;
        let res = self.cons_spanned(ctx, return_sym, list)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn if_statement(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        self.consume(Tok::LParen, "Expect '(' after 'if'.");
        let condition = self.expression(ctx)?;
        self.consume(Tok::RParen, "Expect ')' after if condition.");

        let then_branch = self.statement(ctx)?;
        let else_branch = if self.match_tok(Tok::Else) {
            self.statement(ctx)?
        } else {
            Obj::Nil
        };

        let list = ctx.cons(else_branch, Obj::Nil)?;
        let list = ctx.cons(then_branch, list)?;
        let list = ctx.cons(condition, list)?;
        let if_sym = ctx.symbol("if")?;
        let res = self.cons_spanned(ctx, if_sym, list)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn while_statement(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let save = ctx.save_gc();
        self.consume(Tok::LParen, "Expect '(' after 'while'.");
        let condition = self.expression(ctx)?;
        self.consume(Tok::RParen, "Expect ')' after condition.");
        let body = self.statement(ctx)?;

        let list = ctx.cons(body, Obj::Nil)?;
        let list = ctx.cons(condition, list)?;
        let while_sym = ctx.symbol("while")?;
        let res = self.cons_spanned(ctx, while_sym, list)?;
        ctx.restore_gc(save);
        ctx.push_gc(res)?;
        Ok(res)
    }

    fn expr_statement(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        let expr = self.expression(ctx)?;
        // The semicolon is optional when the statement is the last thing in
        // its block or an `if` branch: `fn(n){ if(n<=1) 1 else n*f(n-1) }`.
        if !self.match_tok(Tok::Semicolon)
            && !self.check(Tok::RBrace)
            && !self.check(Tok::Else)
            && !self.check(Tok::Eof)
        {
            self.error_at_current("Expect ';' after expression.");
        }
        Ok(expr)
    }

    fn statement(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        if self.match_tok(Tok::Return) {
            self.return_statement(ctx)
        } else if self.match_tok(Tok::If) {
            self.if_statement(ctx)
        } else if self.match_tok(Tok::While) {
            self.while_statement(ctx)
        } else if self.match_tok(Tok::LBrace) {
            self.block(ctx)
        } else {
            self.expr_statement(ctx)
        }
    }

    fn declaration(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        if self.match_tok(Tok::Module) {
            return self.module_declaration(ctx);
        }
        if self.match_tok(Tok::Import) {
            return self.import_declaration(ctx);
        }

        let is_export = self.match_tok(Tok::Export);

        let decl = if self.match_tok(Tok::Let) {
            Some(self.var_declaration(ctx)?)
        } else if self.match_tok(Tok::Fn) {
            // `fn name(...) { ... }` desugars to `(let name (fn ...))`.
            self.consume(Tok::Identifier, "Expect function name.");
            let name = self.symbol_from_previous(ctx)?;
            let func = self.fn_declaration(ctx)?;
            Some(self.make_binary(ctx, "let", name, func)?)
        } else {
            None
        };

        if let Some(decl) = decl {
            if is_export {
                return self.make_unary(ctx, "export", decl);
            }
            return Ok(decl);
        }

        if is_export {
            self.error("Only 'let' and 'fn' declarations can be exported.");
        }

        let stmt = self.statement(ctx)?;
        if self.panic_mode {
            self.synchronize();
        }
        Ok(stmt)
    }

    fn program(&mut self, ctx: &mut Context) -> Result<Obj, Error> {
        self.advance();

        let base = ctx.save_gc();
        let mut head = Obj::Nil;
        let mut tail: Option<Obj> = None;
        let mut count = 0usize;

        while !self.match_tok(Tok::Eof) {
            ctx.restore_gc(base);
            ctx.push_gc(head)?;

            let node = self.declaration(ctx)?;
            let pair = ctx.cons(node, Obj::Nil)?;
            match tail {
                Some(t) => ctx.set_cdr(t, pair)?,
                None => head = pair,
            }
            tail = Some(pair);
            count += 1;
            if !self.errors.is_empty() {
                break;
            }
        }

        let program = if count == 0 {
            Obj::Nil
        } else if count == 1 {
            ctx.car(head)?
        } else {
            let do_sym = ctx.symbol("do")?;
            self.cons_spanned(ctx, do_sym, head)?
        };
        ctx.restore_gc(base);
        ctx.push_gc(program)?;
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::open(512 * 1024).expect("arena")
    }

    fn ast(ctx: &mut Context, src: &str) -> String {
        let save = ctx.save_gc();
        let program = compile(ctx, src).expect("compile");
        let out = ctx.to_display_string(program);
        ctx.restore_gc(save);
        out
    }

    fn compile_err(ctx: &mut Context, src: &str) -> Diagnostic {
        let save = ctx.save_gc();
        let err = compile(ctx, src).expect_err("expected syntax error");
        ctx.restore_gc(save);
        err
    }

    #[test]
    fn literals_and_identifiers() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "42;"), "42");
        assert_eq!(ast(&mut ctx, "3.5;"), "3.5");
        assert_eq!(ast(&mut ctx, "0x10;"), "16");
        assert_eq!(ast(&mut ctx, "1e3;"), "1000");
        assert_eq!(ast(&mut ctx, "true;"), "true");
        assert_eq!(ast(&mut ctx, "false;"), "false");
        assert_eq!(ast(&mut ctx, "nil;"), "nil");
        assert_eq!(ast(&mut ctx, "x;"), "x");
        assert_eq!(ast(&mut ctx, "\"hi\\n\";"), "hi\n");
    }

    #[test]
    fn arithmetic_precedence() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "1 + 2 * 3;"), "(+ 1 (* 2 3))");
        assert_eq!(ast(&mut ctx, "(1 + 2) * 3;"), "(* (+ 1 2) 3)");
        assert_eq!(ast(&mut ctx, "1 - 2 - 3;"), "(- (- 1 2) 3)");
        assert_eq!(ast(&mut ctx, "8 / 2 / 2;"), "(/ (/ 8 2) 2)");
    }

    #[test]
    fn unary_operators() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "-x;"), "(- x)");
        assert_eq!(ast(&mut ctx, "!x;"), "(not x)");
        assert_eq!(ast(&mut ctx, "--x;"), "(- (- x))");
    }

    #[test]
    fn comparisons_normalize_to_lt_lte() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "a < b;"), "(< a b)");
        assert_eq!(ast(&mut ctx, "a <= b;"), "(<= a b)");
        assert_eq!(ast(&mut ctx, "a > b;"), "(< b a)");
        assert_eq!(ast(&mut ctx, "a >= b;"), "(<= b a)");
    }

    #[test]
    fn equality_forms() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "a == b;"), "(is a b)");
        assert_eq!(ast(&mut ctx, "a != b;"), "(not (is a b))");
    }

    #[test]
    fn logical_operators_and_precedence() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "a and b;"), "(and a b)");
        assert_eq!(ast(&mut ctx, "a or b;"), "(or a b)");
        assert_eq!(
            ast(&mut ctx, "1 + 2 == 3 and true;"),
            "(and (is (+ 1 2) 3) true)"
        );
    }

    #[test]
    fn assignment_requires_a_symbol() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "x = 1;"), "(= x 1)");
        assert_eq!(ast(&mut ctx, "x = y = 2;"), "(= x (= y 2))");
        let err = compile_err(&mut ctx, "1 = 2;");
        assert!(matches!(err.error, Error::Syntax(ref e) if e.message == "Invalid assignment target."));
    }

    #[test]
    fn calls_and_member_access() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "f();"), "(f)");
        assert_eq!(ast(&mut ctx, "f(1, 2);"), "(f 1 2)");
        assert_eq!(ast(&mut ctx, "a.b;"), "(get a b)");
        assert_eq!(ast(&mut ctx, "m.sq(9);"), "((get m sq) 9)");
        assert_eq!(ast(&mut ctx, "f(1)(2);"), "((f 1) 2)");
    }

    #[test]
    fn list_literals() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "[];"), "(list)");
        assert_eq!(ast(&mut ctx, "[1, 2, 3];"), "(list 1 2 3)");
        assert_eq!(ast(&mut ctx, "[a + 1, [2]];"), "(list (+ a 1) (list 2))");
    }

    #[test]
    fn let_declarations() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "let x = 1;"), "(let x 1)");
        assert_eq!(ast(&mut ctx, "let x;"), "(let x nil)");
    }

    #[test]
    fn fn_declaration_desugars_to_let() {
        let mut ctx = ctx();
        assert_eq!(
            ast(&mut ctx, "fn add(a, b) { a + b; }"),
            "(let add (fn (a b) (+ a b)))"
        );
        assert_eq!(ast(&mut ctx, "let f = fn(x) { x; };"), "(let f (fn (x) x))");
        assert_eq!(ast(&mut ctx, "fn f() {}"), "(let f (fn nil nil))");
    }

    #[test]
    fn parameters_read_in_source_order() {
        let mut ctx = ctx();
        assert_eq!(
            ast(&mut ctx, "fn f(a, b, c) { a; }"),
            "(let f (fn (a b c) a))"
        );
    }

    #[test]
    fn if_and_while_statements() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "if (c) a; else b;"), "(if c a b)");
        assert_eq!(ast(&mut ctx, "if (c) a;"), "(if c a nil)");
        assert_eq!(ast(&mut ctx, "while (c) { a; b; }"), "(while c (do a b))");
        assert_eq!(ast(&mut ctx, "while (c) a;"), "(while c a)");
    }

    #[test]
    fn trailing_semicolon_is_optional_before_block_end_and_else() {
        let mut ctx = ctx();
        assert_eq!(
            ast(&mut ctx, "fn f(n) { if (n <= 1) 1 else n * f(n - 1) }"),
            "(let f (fn (n) (if (<= n 1) 1 (* n (f (- n 1))))))"
        );
        assert_eq!(ast(&mut ctx, "{ 1; 2 }"), "(do 1 2)");
        let err = compile_err(&mut ctx, "1 2;");
        assert!(matches!(err.error, Error::Syntax(ref e) if e.message == "Expect ';' after expression."));
    }

    #[test]
    fn return_statements() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "fn f() { return 1; }"), "(let f (fn nil (return 1)))");
        assert_eq!(ast(&mut ctx, "fn f() { return; }"), "(let f (fn nil (return nil)))");
    }

    #[test]
    fn blocks_collapse_single_statements() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "{ 1; }"), "1");
        assert_eq!(ast(&mut ctx, "{ 1; 2; }"), "(do 1 2)");
        assert_eq!(ast(&mut ctx, "{}"), "nil");
    }

    #[test]
    fn programs_wrap_in_do() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "1; 2;"), "(do 1 2)");
        assert_eq!(ast(&mut ctx, ""), "nil");
    }

    #[test]
    fn modules_imports_exports() {
        let mut ctx = ctx();
        assert_eq!(
            ast(&mut ctx, "module(\"m\") { export let pi = 3; }"),
            "(module \"m\" (export (let pi 3)))"
        );
        assert_eq!(ast(&mut ctx, "import m;"), "(import m)");
        assert_eq!(
            ast(&mut ctx, "export fn sq(x) { x * x; }"),
            "(export (let sq (fn (x) (* x x))))"
        );
    }

    #[test]
    fn comments_are_skipped() {
        let mut ctx = ctx();
        assert_eq!(ast(&mut ctx, "// leading\n1; // trailing\n"), "1");
    }

    #[test]
    fn syntax_errors_are_located() {
        let mut ctx = ctx();
        let err = compile_err(&mut ctx, "let x = ;");
        assert!(matches!(err.error, Error::Syntax(ref e) if e.message == "Expect expression."));
        assert!(err.location.is_some());

        let err = compile_err(&mut ctx, "f(1;");
        assert!(matches!(err.error, Error::Syntax(_)));

        let err = compile_err(&mut ctx, "\"unterminated");
        assert!(matches!(err.error, Error::Syntax(ref e) if e.message == "Unterminated string."));

        let err = compile_err(&mut ctx, "let x = 1 # 2;");
        assert!(matches!(err.error, Error::Syntax(ref e) if e.message == "Unexpected character."));
    }

    #[test]
    fn overlong_identifiers_are_rejected() {
        let mut ctx = ctx();
        let src = format!("let {} = 1;", "x".repeat(256));
        let err = compile_err(&mut ctx, &src);
        assert!(matches!(err.error, Error::Syntax(ref e) if e.message == "Identifier too long."));

        // One byte under the limit is still a valid name.
        let ok = format!("let {} = 1;", "x".repeat(255));
        let save = ctx.save_gc();
        assert!(compile(&mut ctx, &ok).is_ok());
        ctx.restore_gc(save);
    }

    #[test]
    fn export_requires_a_declaration() {
        let mut ctx = ctx();
        let err = compile_err(&mut ctx, "export 1;");
        assert!(matches!(
            err.error,
            Error::Syntax(ref e) if e.message == "Only 'let' and 'fn' declarations can be exported."
        ));
    }

    #[test]
    fn span_recording_annotates_ast_cells() {
        let mut ctx = ctx();
        ctx.set_span_recording(true);
        let save = ctx.save_gc();
        let program = compile(&mut ctx, "let answer = 42;").expect("compile");
        let id = match program {
            Obj::Cell(id) => id,
            other => panic!("expected cell, got {:?}", other),
        };
        assert!(ctx.spans.lookup(id).is_some());
        ctx.restore_gc(save);
    }
}

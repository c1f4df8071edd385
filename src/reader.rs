use logos::Logos;

use crate::context::Context;
use crate::error::{Error, ReaderError};
use crate::value::Obj;

/// Longest accepted symbol, matching the classic reader buffer.
const MAX_SYMBOL_LEN: usize = 63;

//===----------------------------------------------------------------------===//
// Token
//
// The tokenizer is a logos-derived state machine: whitespace and `;` line
// comments are skip patterns, strings decode their escapes in a callback,
// and everything that is not a delimiter collapses into a single `Atom`
// token resolved to a number, literal or symbol afterwards.
//===----------------------------------------------------------------------===//

/// Unescapes the body of a string literal. `\n`, `\r` and `\t` become
/// control characters; any other escaped character stands for itself.
pub(crate) fn unescape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[derive(Logos, Debug, PartialEq, Clone)]
pub enum Token {
    #[regex(r"[ \t\r\n]+", logos::skip)]
    #[regex(r";[^\n]*", logos::skip)]
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("'")]
    Quote,

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    Str(String),

    // A `"` that runs to end of input without a closing quote. Lower
    // priority so the terminated rule wins whenever it can.
    #[regex(r#""([^"\\]|\\.)*"#, priority = 0)]
    UnterminatedStr,

    #[regex(r#"[^ \t\r\n();"']+"#, |lex| lex.slice().to_owned())]
    Atom(String),
}

//===----------------------------------------------------------------------===//
// Reader
//===----------------------------------------------------------------------===//

enum Item {
    Form(Obj),
    Rparen,
    Eof,
}

/// Pulls S-expressions out of a source string one at a time. The token
/// stream is produced up front; `next_form` returns `Ok(None)` at end of
/// input, so a host can drain a buffer expression by expression.
pub struct Reader {
    tokens: Vec<Token>,
    pos: usize,
}

impl Reader {
    pub fn new(source: &str) -> Self {
        let mut lexer = Token::lexer(source);
        let mut tokens = Vec::new();
        while let Some(token) = lexer.next() {
            if let Ok(token) = token {
                tokens.push(token);
            }
        }
        Reader { tokens, pos: 0 }
    }

    /// Reads the next expression, leaving it protected on the root stack.
    pub fn next_form(&mut self, ctx: &mut Context) -> Result<Option<Obj>, Error> {
        match self.read(ctx)? {
            Item::Form(obj) => Ok(Some(obj)),
            Item::Eof => Ok(None),
            Item::Rparen => Err(Error::Reader(ReaderError::StrayRparen)),
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn read(&mut self, ctx: &mut Context) -> Result<Item, Error> {
        let token = match self.next_token() {
            Some(t) => t,
            None => return Ok(Item::Eof),
        };
        match token {
            Token::RParen => Ok(Item::Rparen),
            Token::LParen => self.read_list(ctx),
            Token::Quote => {
                let v = match self.read(ctx)? {
                    Item::Form(v) => v,
                    Item::Eof => return Err(Error::Reader(ReaderError::StrayQuote)),
                    Item::Rparen => {
                        return Err(Error::Reader(ReaderError::StrayRparen))
                    }
                };
                let save = ctx.save_gc();
                let quote = ctx.symbol("quote")?;
                let tail = ctx.cons(v, Obj::Nil)?;
                let form = ctx.cons(quote, tail)?;
                ctx.restore_gc(save);
                ctx.push_gc(form)?;
                Ok(Item::Form(form))
            }
            Token::Str(s) => Ok(Item::Form(ctx.string(&s)?)),
            Token::UnterminatedStr => {
                Err(Error::Reader(ReaderError::UnclosedString))
            }
            Token::Atom(text) => Ok(Item::Form(read_atom(ctx, &text)?)),
        }
    }

    fn read_list(&mut self, ctx: &mut Context) -> Result<Item, Error> {
        let save = ctx.save_gc();
        let mut head = Obj::Nil;
        let mut tail: Option<Obj> = None;
        loop {
            let item = self.read(ctx)?;
            let v = match item {
                Item::Rparen => break,
                Item::Eof => return Err(Error::Reader(ReaderError::UnclosedList)),
                Item::Form(v) => v,
            };
            if ctx.sym_name(v) == Some(".") {
                // Dotted pair: the next form becomes the tail.
                let rest = match self.read(ctx)? {
                    Item::Form(v) => v,
                    _ => return Err(Error::Reader(ReaderError::UnclosedList)),
                };
                match tail {
                    Some(t) => ctx.set_cdr(t, rest)?,
                    None => head = rest,
                }
            } else {
                let pair = ctx.cons(v, Obj::Nil)?;
                match tail {
                    Some(t) => ctx.set_cdr(t, pair)?,
                    None => head = pair,
                }
                tail = Some(pair);
            }
            ctx.restore_gc(save);
            ctx.push_gc(head)?;
        }
        ctx.restore_gc(save);
        ctx.push_gc(head)?;
        Ok(Item::Form(head))
    }
}

/// Atom resolution: number first (the whole token must parse), then the
/// literals, then a symbol.
fn read_atom(ctx: &mut Context, text: &str) -> Result<Obj, Error> {
    if let Ok(n) = text.parse::<f64>() {
        return ctx.make_number(n);
    }
    match text {
        "nil" => Ok(Obj::Nil),
        "true" => Ok(Obj::Bool(true)),
        "false" => Ok(Obj::Bool(false)),
        _ => {
            if text.len() > MAX_SYMBOL_LEN {
                return Err(Error::Reader(ReaderError::SymbolTooLong));
            }
            ctx.symbol(text)
        }
    }
}

/// Reads the first expression from `source`.
pub fn read_str(ctx: &mut Context, source: &str) -> Result<Option<Obj>, Error> {
    Reader::new(source).next_form(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Type;

    fn ctx() -> Context {
        Context::open(256 * 1024).expect("arena")
    }

    fn read1(ctx: &mut Context, src: &str) -> Obj {
        read_str(ctx, src).expect("read").expect("form")
    }

    #[test]
    fn atoms() {
        let mut ctx = ctx();
        assert_eq!(read1(&mut ctx, "42"), Obj::Fix(42));
        assert_eq!(read1(&mut ctx, "-7"), Obj::Fix(-7));
        assert_eq!(read1(&mut ctx, "nil"), Obj::Nil);
        assert_eq!(read1(&mut ctx, "true"), Obj::Bool(true));
        assert_eq!(read1(&mut ctx, "false"), Obj::Bool(false));

        let pi = read1(&mut ctx, "3.25");
        assert_eq!(ctx.to_number(pi).unwrap(), 3.25);

        let sym = read1(&mut ctx, "foo");
        assert_eq!(ctx.type_of(sym), Type::Symbol);
        assert_eq!(sym, ctx.symbol("foo").unwrap());
    }

    #[test]
    fn lists_and_nesting() {
        let mut ctx = ctx();
        let form = read1(&mut ctx, "(+ 1 (about 2) 3) trailing");
        assert_eq!(ctx.to_display_string(form), "(+ 1 (about 2) 3)");
    }

    #[test]
    fn dotted_pairs() {
        let mut ctx = ctx();
        let form = read1(&mut ctx, "(a . b)");
        assert_eq!(ctx.to_display_string(form), "(a . b)");
    }

    #[test]
    fn quote_expands_to_quote_form() {
        let mut ctx = ctx();
        let form = read1(&mut ctx, "'(1 2)");
        assert_eq!(ctx.to_display_string(form), "(quote (1 2))");
    }

    #[test]
    fn strings_with_escapes() {
        let mut ctx = ctx();
        let s = read1(&mut ctx, r#""a\tb\n\"c\"""#);
        assert_eq!(ctx.str_value(s).unwrap(), "a\tb\n\"c\"");
    }

    #[test]
    fn comments_are_skipped() {
        let mut ctx = ctx();
        let form = read1(&mut ctx, "; heading\n(1 ; inline\n 2)");
        assert_eq!(ctx.to_display_string(form), "(1 2)");
    }

    #[test]
    fn write_read_roundtrip() {
        let mut ctx = ctx();
        let form = read1(&mut ctx, r#"(1 2.5 "two words" sym (nested true) nil)"#);
        let written = ctx.to_write_string(form);
        let back = read1(&mut ctx, &written);
        assert_eq!(ctx.to_write_string(back), written);
    }

    #[test]
    fn reader_errors() {
        let mut ctx = ctx();
        assert_eq!(
            read_str(&mut ctx, "(1 2"),
            Err(Error::Reader(ReaderError::UnclosedList))
        );
        assert_eq!(
            read_str(&mut ctx, ")"),
            Err(Error::Reader(ReaderError::StrayRparen))
        );
        assert_eq!(
            read_str(&mut ctx, "\"abc"),
            Err(Error::Reader(ReaderError::UnclosedString))
        );
        let long = "x".repeat(80);
        assert_eq!(
            read_str(&mut ctx, &long),
            Err(Error::Reader(ReaderError::SymbolTooLong))
        );
    }

    #[test]
    fn multiple_forms_one_at_a_time() {
        let mut ctx = ctx();
        let mut reader = Reader::new("1 2 3");
        assert_eq!(reader.next_form(&mut ctx).unwrap(), Some(Obj::Fix(1)));
        assert_eq!(reader.next_form(&mut ctx).unwrap(), Some(Obj::Fix(2)));
        assert_eq!(reader.next_form(&mut ctx).unwrap(), Some(Obj::Fix(3)));
        assert_eq!(reader.next_form(&mut ctx).unwrap(), None);
    }
}

use std::fmt;
use std::sync::Arc;

use crate::span::{line_col, line_text, Span};

//===----------------------------------------------------------------------===//
// Error
//===----------------------------------------------------------------------===//

/// Runtime and compile-time failures. The evaluator never recovers locally;
/// errors propagate out to the host, which decides what happens next.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Front-end parse error.
    Syntax(SyntaxError),
    /// S-expression reader error.
    Reader(ReaderError),
    /// Operand does not satisfy the operator's expected type.
    Type(String),
    /// Too few arguments, or a dotted pair where a proper list is required.
    Arity(String),
    /// Primitive-specific failure reported by the extended library.
    Domain(String),
    /// Allocation after a collection still found no free cell.
    OutOfMemory,
    /// The root stack capacity is exhausted.
    GcStackOverflow,
    /// Attempt to call a non-callable value.
    Call,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Syntax(e) => write!(f, "{}", e.message),
            Error::Reader(e) => write!(f, "{}", e),
            Error::Type(msg) => write!(f, "{}", msg),
            Error::Arity(msg) => write!(f, "{}", msg),
            Error::Domain(msg) => write!(f, "{}", msg),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::GcStackOverflow => write!(f, "gc stack overflow"),
            Error::Call => write!(f, "tried to call non-callable value"),
        }
    }
}

//===----------------------------------------------------------------------===//
// ReaderError
//===----------------------------------------------------------------------===//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderError {
    UnclosedList,
    UnclosedString,
    StrayRparen,
    StrayQuote,
    SymbolTooLong,
}

impl fmt::Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReaderError::UnclosedList => write!(f, "unclosed list"),
            ReaderError::UnclosedString => write!(f, "unclosed string"),
            ReaderError::StrayRparen => write!(f, "stray ')'"),
            ReaderError::StrayQuote => write!(f, "stray '''"),
            ReaderError::SymbolTooLong => write!(f, "symbol too long"),
        }
    }
}

//===----------------------------------------------------------------------===//
// SyntaxError
//===----------------------------------------------------------------------===//

/// A front-end parse error, carrying the byte span of the offending token.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub message: String,
    pub span: Span,
}

//===----------------------------------------------------------------------===//
// Diagnostic
//===----------------------------------------------------------------------===//

/// Where an error happened in a source buffer. Line and column are resolved
/// lazily from the byte span when the diagnostic is rendered.
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub source: Arc<str>,
    pub span: Span,
}

/// One frame of the evaluator's call list, rendered for a back-trace. The
/// location is present when span recording was enabled at compile time and
/// the frame's cell is in the span table.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub text: String,
    pub location: Option<SourceLocation>,
}

/// An error together with everything needed to report it: the call-list
/// back-trace for runtime errors, or the source location for parse errors.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub error: Error,
    pub location: Option<SourceLocation>,
    pub trace: Vec<TraceFrame>,
}

impl Diagnostic {
    pub fn new(error: Error) -> Self {
        Self { error, location: None, trace: Vec::new() }
    }

    pub fn with_location(error: Error, source: Arc<str>, span: Span) -> Self {
        Self {
            error,
            location: Some(SourceLocation { source, span }),
            trace: Vec::new(),
        }
    }

    /// Renders the diagnostic:
    ///
    /// - first line: `error: <message>`;
    /// - for located errors, the file excerpt with a caret under the span;
    /// - for runtime errors, one `=> <expr>` line per call frame, annotated
    ///   with `<string>:<line>:<col>` and the source line when available.
    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("error: {}\n", self.error));

        if let Some(loc) = &self.location {
            out.push_str(&render_excerpt(loc));
        }

        for (depth, frame) in self.trace.iter().enumerate() {
            match &frame.location {
                Some(loc) => {
                    let (line, col) = line_col(&loc.source, loc.span.start);
                    out.push_str(&format!(
                        "[{}] <string>:{}:{}  =>  {}\n",
                        depth,
                        line,
                        col,
                        line_text(&loc.source, loc.span.start)
                    ));
                }
                None => out.push_str(&format!("=> {}\n", frame.text)),
            }
        }
        out
    }
}

fn render_excerpt(loc: &SourceLocation) -> String {
    let (line, col) = line_col(&loc.source, loc.span.start);
    let text = line_text(&loc.source, loc.span.start);
    let caret_len = loc.span.len().max(1).min(text.len().saturating_sub(col - 1).max(1));
    let mut out = String::new();
    out.push_str(&format!("  --> <string>:{}:{}\n", line, col));
    out.push_str("   |\n");
    out.push_str(&format!("{:4} | {}\n", line, text));
    out.push_str(&format!("     | {}{}\n", " ".repeat(col - 1), "^".repeat(caret_len)));
    out
}

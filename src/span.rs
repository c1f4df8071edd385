//! Source-span side table.
//!
//! The front-end can record, for every AST cell it builds, the byte range of
//! the tokens it came from together with the source buffer. Keeping spans in
//! a side table keyed by cell id keeps position data out of the value
//! representation; the keys are stable because cells never move.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::value::CellId;

/// Byte range into a source buffer, as produced by the tokenizers.
pub type Span = logos::Span;

#[derive(Debug, Clone)]
pub struct SpanEntry {
    /// The buffer handed to the compiler; shared so entries stay cheap.
    pub source: Arc<str>,
    pub span: Span,
}

#[derive(Debug, Default)]
pub struct SpanTable {
    enabled: bool,
    map: FxHashMap<CellId, SpanEntry>,
}

impl SpanTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, cell: CellId, source: &Arc<str>, span: Span) {
        if self.enabled {
            self.map.insert(cell, SpanEntry { source: Arc::clone(source), span });
        }
    }

    pub fn lookup(&self, cell: CellId) -> Option<&SpanEntry> {
        self.map.get(&cell)
    }

    /// Called by the sweep when a cell is reclaimed, so a recycled cell can
    /// never report a stale location.
    pub fn remove(&mut self, cell: CellId) {
        if !self.map.is_empty() {
            self.map.remove(&cell);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Resolve a byte offset to a 1-based (line, column) pair.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let line_start = source[..offset].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let line = source[..offset].matches('\n').count() + 1;
    (line, offset - line_start + 1)
}

/// The full text of the line containing `offset`, without its newline.
pub fn line_text(source: &str, offset: usize) -> &str {
    let offset = offset.min(source.len());
    let start = source[..offset].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let end = source[start..].find('\n').map(|p| start + p).unwrap_or(source.len());
    &source[start..end]
}

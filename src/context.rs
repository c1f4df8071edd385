use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;

use crate::builtins::Sfc32;
use crate::error::{Diagnostic, Error, SourceLocation, TraceFrame};
use crate::eval::Primitive;
use crate::span::SpanTable;
use crate::value::{fits_fixnum, CellId, Obj, Type};

/// Fixed capacity of the GC root stack.
pub const GC_STACK_SIZE: usize = 1024;

/// A host value stored behind a `Ptr` cell. The collector calls `trace` so
/// the value can keep arena handles alive, and `finalize` when the owning
/// cell is reclaimed (including the final collection at context close).
/// Finalizers must not allocate cells.
pub trait Foreign: Any {
    fn trace(&self, _trace: &mut dyn FnMut(Obj)) {}
    fn finalize(&mut self) {}
}

/// A host function callable from the language. Receives the evaluated
/// argument list as a proper list.
pub type NativeFn = fn(&mut Context, Obj) -> Result<Obj, Error>;

/// Invoked with every diagnostic produced at the host boundary, before it is
/// returned to the caller.
pub type ErrorHook = fn(&Diagnostic);

/// The closure payload shared by functions and macros: the environment
/// captured at definition time, the free-variable list computed by static
/// analysis, the parameter list, and the body as a statement list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Closure {
    pub env: Obj,
    pub free_vars: Obj,
    pub params: Obj,
    pub body: Obj,
}

pub(crate) enum CellData {
    Free { next: Option<CellId> },
    Pair { car: Obj, cdr: Obj },
    Number(f64),
    Str(Box<str>),
    /// `binding` is a pair cell `(name-string . global-value)`. Lookup hands
    /// out this pair as the binding handle when no local or upvalue matches,
    /// which is what makes assignment through captured globals work.
    Symbol { binding: CellId },
    Func(Closure),
    Macro(Closure),
    Prim(Primitive),
    Native(u32),
    Ptr(Option<Box<dyn Foreign>>),
}

pub(crate) struct Cell {
    pub marked: bool,
    pub data: CellData,
}

//===----------------------------------------------------------------------===//
// Context
//===----------------------------------------------------------------------===//

/// An interpreter instance: the cell arena plus every piece of mutable
/// state the evaluator touches. One context is single-threaded; a host may
/// open several independent contexts.
pub struct Context {
    pub(crate) cells: Vec<Cell>,
    pub(crate) freelist: Option<CellId>,
    pub(crate) gcstack: Vec<Obj>,
    /// Forms currently being evaluated, innermost last; used for traces.
    pub(crate) calllist: Vec<Obj>,
    /// Export tables of the `module` bodies currently being evaluated.
    pub(crate) modulestack: Vec<Obj>,
    /// The intern table; doubles as the symbol-list GC root.
    pub(crate) symbols: FxHashMap<String, CellId>,
    pub(crate) natives: Vec<NativeFn>,
    pub(crate) spans: SpanTable,
    pub(crate) rng: Sfc32,
    pub(crate) error_hook: Option<ErrorHook>,
    pub(crate) live_count: usize,
    pub(crate) allocs_since_gc: usize,
    pub(crate) gc_threshold: usize,
    closed: bool,

    pub(crate) sym_return: CellId,
    pub(crate) sym_frame: CellId,
    pub(crate) sym_do: CellId,
    pub(crate) sym_let: CellId,
    pub(crate) sym_quote: CellId,
    pub(crate) sym_fn: CellId,
    pub(crate) sym_mac: CellId,
}

impl Context {
    /// Formats an arena of `size` bytes worth of cells and installs the
    /// primitives. All allocation for the lifetime of the context comes out
    /// of this arena; it is sized once and never grows.
    pub fn open(size: usize) -> Result<Context, Error> {
        let count = size / std::mem::size_of::<Cell>();
        let mut cells = Vec::with_capacity(count);
        for i in 0..count {
            let next = if i == 0 { None } else { Some(i as CellId - 1) };
            cells.push(Cell { marked: false, data: CellData::Free { next } });
        }
        let freelist = count.checked_sub(1).map(|i| i as CellId);

        let mut ctx = Context {
            cells,
            freelist,
            gcstack: Vec::with_capacity(GC_STACK_SIZE),
            calllist: Vec::new(),
            modulestack: Vec::new(),
            symbols: FxHashMap::default(),
            natives: Vec::new(),
            spans: SpanTable::new(),
            rng: Sfc32::new(),
            error_hook: None,
            live_count: 0,
            allocs_since_gc: 0,
            gc_threshold: (count / crate::gc::GC_INITIAL_DIVISOR)
                .max(crate::gc::GC_MIN_THRESHOLD),
            closed: false,
            sym_return: 0,
            sym_frame: 0,
            sym_do: 0,
            sym_let: 0,
            sym_quote: 0,
            sym_fn: 0,
            sym_mac: 0,
        };

        // Register the primitives under their global names.
        for prim in Primitive::ALL {
            let save = ctx.save_gc();
            let sym = ctx.symbol(prim.name())?;
            let cell = ctx.alloc(CellData::Prim(prim))?;
            ctx.set_global(sym, Obj::Cell(cell))?;
            ctx.restore_gc(save);
        }

        // Symbols the evaluator and the analyzer compare against.
        ctx.sym_return = ctx.intern("return")?;
        ctx.sym_frame = ctx.intern("[frame]")?;
        ctx.sym_do = ctx.intern("do")?;
        ctx.sym_let = ctx.intern("let")?;
        ctx.sym_quote = ctx.intern("quote")?;
        ctx.sym_fn = ctx.intern("fn")?;
        ctx.sym_mac = ctx.intern("mac")?;

        Ok(ctx)
    }

    /// Clears every root and runs a final collection so `Ptr` finalizers
    /// fire. Called automatically on drop; calling it twice is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.gcstack.clear();
        self.calllist.clear();
        self.modulestack.clear();
        self.symbols.clear();
        self.spans.clear();
        self.collect_garbage();
    }

    //===------------------------------------------------------------------===//
    // Allocation and the root stack
    //===------------------------------------------------------------------===//

    /// Draws one cell from the freelist, collecting first when the adaptive
    /// threshold is crossed or the freelist is empty. The new cell is pushed
    /// onto the root stack so it survives until the caller's `restore_gc`.
    pub(crate) fn alloc(&mut self, data: CellData) -> Result<CellId, Error> {
        if self.allocs_since_gc >= self.gc_threshold || self.freelist.is_none() {
            self.collect_garbage();
        }
        let id = self.freelist.ok_or(Error::OutOfMemory)?;
        if let CellData::Free { next } = self.cells[id as usize].data {
            self.freelist = next;
        }
        self.allocs_since_gc += 1;
        self.cells[id as usize] = Cell { marked: false, data };
        self.push_gc(Obj::Cell(id))?;
        Ok(id)
    }

    pub fn save_gc(&self) -> usize {
        self.gcstack.len()
    }

    pub fn restore_gc(&mut self, idx: usize) {
        self.gcstack.truncate(idx);
    }

    /// Protects a value from collection until the matching `restore_gc`.
    /// Immediates are silently ignored.
    pub fn push_gc(&mut self, obj: Obj) -> Result<(), Error> {
        if !matches!(obj, Obj::Cell(_)) {
            return Ok(());
        }
        if self.gcstack.len() == GC_STACK_SIZE {
            return Err(Error::GcStackOverflow);
        }
        self.gcstack.push(obj);
        Ok(())
    }

    //===------------------------------------------------------------------===//
    // Constructors
    //===------------------------------------------------------------------===//

    pub fn cons(&mut self, car: Obj, cdr: Obj) -> Result<Obj, Error> {
        Ok(Obj::Cell(self.alloc(CellData::Pair { car, cdr })?))
    }

    /// A boxed double, regardless of value.
    pub fn number(&mut self, n: f64) -> Result<Obj, Error> {
        Ok(Obj::Cell(self.alloc(CellData::Number(n))?))
    }

    /// A fixnum when the value is integral and in range, else a boxed double.
    pub fn make_number(&mut self, n: f64) -> Result<Obj, Error> {
        let i = n as i64;
        if n == i as f64 && fits_fixnum(i) {
            return Ok(Obj::Fix(i));
        }
        self.number(n)
    }

    /// A fixnum when the integer is in range, else a boxed double.
    pub fn make_integer(&mut self, i: i64) -> Result<Obj, Error> {
        if fits_fixnum(i) {
            return Ok(Obj::Fix(i));
        }
        self.number(i as f64)
    }

    pub fn string(&mut self, s: &str) -> Result<Obj, Error> {
        Ok(Obj::Cell(self.alloc(CellData::Str(s.into()))?))
    }

    /// Interns a symbol: equal names always yield the identical cell.
    pub fn symbol(&mut self, name: &str) -> Result<Obj, Error> {
        Ok(Obj::Cell(self.intern(name)?))
    }

    pub(crate) fn intern(&mut self, name: &str) -> Result<CellId, Error> {
        if let Some(&id) = self.symbols.get(name) {
            return Ok(id);
        }
        let save = self.save_gc();
        let name_cell = self.alloc(CellData::Str(name.into()))?;
        let binding = self.alloc(CellData::Pair {
            car: Obj::Cell(name_cell),
            cdr: Obj::Nil,
        })?;
        let sym = self.alloc(CellData::Symbol { binding })?;
        self.symbols.insert(name.to_owned(), sym);
        self.restore_gc(save);
        Ok(sym)
    }

    pub fn native(&mut self, f: NativeFn) -> Result<Obj, Error> {
        let idx = self.natives.len() as u32;
        self.natives.push(f);
        Ok(Obj::Cell(self.alloc(CellData::Native(idx))?))
    }

    pub fn ptr(&mut self, value: Box<dyn Foreign>) -> Result<Obj, Error> {
        Ok(Obj::Cell(self.alloc(CellData::Ptr(Some(value)))?))
    }

    /// Builds a proper list from a slice.
    pub fn list(&mut self, items: &[Obj]) -> Result<Obj, Error> {
        let mut res = Obj::Nil;
        for &item in items.iter().rev() {
            res = self.cons(item, res)?;
        }
        Ok(res)
    }

    //===------------------------------------------------------------------===//
    // Inspection
    //===------------------------------------------------------------------===//

    pub fn type_of(&self, obj: Obj) -> Type {
        match obj {
            Obj::Nil => Type::Nil,
            Obj::Bool(_) => Type::Boolean,
            Obj::Fix(_) => Type::Number,
            Obj::Cell(id) => match &self.cells[id as usize].data {
                CellData::Free { .. } => Type::Free,
                CellData::Pair { .. } => Type::Pair,
                CellData::Number(_) => Type::Number,
                CellData::Str(_) => Type::String,
                CellData::Symbol { .. } => Type::Symbol,
                CellData::Func(_) => Type::Func,
                CellData::Macro(_) => Type::Macro,
                CellData::Prim(_) => Type::Prim,
                CellData::Native(_) => Type::Native,
                CellData::Ptr(_) => Type::Ptr,
            },
        }
    }

    pub(crate) fn type_error(&self, expected: &str, got: Obj) -> Error {
        Error::Type(format!("expected {}, got {}", expected, self.type_of(got).name()))
    }

    /// `car` of `nil` is `nil`; anything else must be a pair.
    pub fn car(&self, obj: Obj) -> Result<Obj, Error> {
        if obj == Obj::Nil {
            return Ok(Obj::Nil);
        }
        match self.as_pair(obj) {
            Some((car, _)) => Ok(car),
            None => Err(self.type_error("pair", obj)),
        }
    }

    /// `cdr` of `nil` is `nil`; anything else must be a pair.
    pub fn cdr(&self, obj: Obj) -> Result<Obj, Error> {
        if obj == Obj::Nil {
            return Ok(Obj::Nil);
        }
        match self.as_pair(obj) {
            Some((_, cdr)) => Ok(cdr),
            None => Err(self.type_error("pair", obj)),
        }
    }

    pub fn set_car(&mut self, obj: Obj, v: Obj) -> Result<(), Error> {
        match self.as_pair_id(obj) {
            Some(id) => {
                if let CellData::Pair { car, .. } = &mut self.cells[id as usize].data {
                    *car = v;
                }
                Ok(())
            }
            None => Err(self.type_error("pair", obj)),
        }
    }

    pub fn set_cdr(&mut self, obj: Obj, v: Obj) -> Result<(), Error> {
        match self.as_pair_id(obj) {
            Some(id) => {
                self.set_pair_cdr(id, v);
                Ok(())
            }
            None => Err(self.type_error("pair", obj)),
        }
    }

    pub fn to_number(&self, obj: Obj) -> Result<f64, Error> {
        match obj {
            Obj::Fix(i) => Ok(i as f64),
            Obj::Cell(id) => match self.cells[id as usize].data {
                CellData::Number(n) => Ok(n),
                _ => Err(self.type_error("number", obj)),
            },
            _ => Err(self.type_error("number", obj)),
        }
    }

    pub fn str_value(&self, obj: Obj) -> Result<&str, Error> {
        if let Obj::Cell(id) = obj {
            if let CellData::Str(s) = &self.cells[id as usize].data {
                return Ok(s);
            }
        }
        Err(self.type_error("string", obj))
    }

    pub fn foreign(&self, obj: Obj) -> Result<&dyn Foreign, Error> {
        if let Obj::Cell(id) = obj {
            if let CellData::Ptr(Some(value)) = &self.cells[id as usize].data {
                return Ok(value.as_ref());
            }
        }
        Err(self.type_error("ptr", obj))
    }

    //===------------------------------------------------------------------===//
    // Globals
    //===------------------------------------------------------------------===//

    pub fn set_global(&mut self, sym: Obj, v: Obj) -> Result<(), Error> {
        match self.as_symbol(sym) {
            Some(id) => {
                let binding = self.sym_binding(id);
                self.set_pair_cdr(binding, v);
                Ok(())
            }
            None => Err(self.type_error("symbol", sym)),
        }
    }

    pub fn global(&self, sym: Obj) -> Result<Obj, Error> {
        match self.as_symbol(sym) {
            Some(id) => Ok(self.pair_cdr(self.sym_binding(id))),
            None => Err(self.type_error("symbol", sym)),
        }
    }

    //===------------------------------------------------------------------===//
    // Internal accessors
    //===------------------------------------------------------------------===//

    pub(crate) fn as_pair(&self, obj: Obj) -> Option<(Obj, Obj)> {
        if let Obj::Cell(id) = obj {
            if let CellData::Pair { car, cdr } = self.cells[id as usize].data {
                return Some((car, cdr));
            }
        }
        None
    }

    pub(crate) fn as_pair_id(&self, obj: Obj) -> Option<CellId> {
        if let Obj::Cell(id) = obj {
            if matches!(self.cells[id as usize].data, CellData::Pair { .. }) {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn as_symbol(&self, obj: Obj) -> Option<CellId> {
        if let Obj::Cell(id) = obj {
            if matches!(self.cells[id as usize].data, CellData::Symbol { .. }) {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn pair_car(&self, id: CellId) -> Obj {
        if let CellData::Pair { car, .. } = self.cells[id as usize].data {
            car
        } else {
            Obj::Nil
        }
    }

    pub(crate) fn pair_cdr(&self, id: CellId) -> Obj {
        if let CellData::Pair { cdr, .. } = self.cells[id as usize].data {
            cdr
        } else {
            Obj::Nil
        }
    }

    pub(crate) fn set_pair_cdr(&mut self, id: CellId, v: Obj) {
        if let CellData::Pair { cdr, .. } = &mut self.cells[id as usize].data {
            *cdr = v;
        }
    }

    pub(crate) fn set_pair(&mut self, id: CellId, car: Obj, cdr: Obj) {
        self.cells[id as usize].data = CellData::Pair { car, cdr };
    }

    pub(crate) fn sym_binding(&self, sym: CellId) -> CellId {
        if let CellData::Symbol { binding } = self.cells[sym as usize].data {
            binding
        } else {
            sym
        }
    }

    pub fn sym_name(&self, obj: Obj) -> Option<&str> {
        let id = self.as_symbol(obj)?;
        let binding = self.sym_binding(id);
        if let Obj::Cell(name_id) = self.pair_car(binding) {
            if let CellData::Str(s) = &self.cells[name_id as usize].data {
                return Some(s);
            }
        }
        None
    }

    pub(crate) fn closure_of(&self, obj: Obj) -> Option<Closure> {
        if let Obj::Cell(id) = obj {
            match self.cells[id as usize].data {
                CellData::Func(c) | CellData::Macro(c) => return Some(c),
                _ => {}
            }
        }
        None
    }

    pub(crate) fn prim_of(&self, obj: Obj) -> Option<Primitive> {
        if let Obj::Cell(id) = obj {
            if let CellData::Prim(p) = self.cells[id as usize].data {
                return Some(p);
            }
        }
        None
    }

    pub(crate) fn native_of(&self, obj: Obj) -> Option<NativeFn> {
        if let Obj::Cell(id) = obj {
            if let CellData::Native(idx) = self.cells[id as usize].data {
                return Some(self.natives[idx as usize]);
            }
        }
        None
    }

    /// Structural equality for numbers and strings, identity for the rest.
    pub(crate) fn equal(&self, a: Obj, b: Obj) -> bool {
        if a == b {
            return true;
        }
        let ta = self.type_of(a);
        if ta != self.type_of(b) {
            return false;
        }
        match ta {
            Type::Number => self.num_value(a) == self.num_value(b),
            Type::String => self.str_value(a).ok() == self.str_value(b).ok(),
            _ => false,
        }
    }

    /// Numeric value of a checked number (fixnum or boxed).
    pub(crate) fn num_value(&self, obj: Obj) -> f64 {
        match obj {
            Obj::Fix(i) => i as f64,
            Obj::Cell(id) => {
                if let CellData::Number(n) = self.cells[id as usize].data {
                    n
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    //===------------------------------------------------------------------===//
    // Diagnostics
    //===------------------------------------------------------------------===//

    pub fn set_error_hook(&mut self, hook: Option<ErrorHook>) {
        self.error_hook = hook;
    }

    pub fn set_span_recording(&mut self, enabled: bool) {
        self.spans.set_enabled(enabled);
    }

    pub fn span_recording(&self) -> bool {
        self.spans.enabled()
    }

    /// Converts a propagated error into a reportable diagnostic: snapshots
    /// the call list into trace frames (innermost first) and resets it so
    /// the context is usable again, then invokes the error hook.
    pub fn diagnose(&mut self, error: Error) -> Diagnostic {
        let calls = std::mem::take(&mut self.calllist);
        let mut diag = Diagnostic::new(error);
        for &form in calls.iter().rev() {
            let location = match form {
                Obj::Cell(id) => self.spans.lookup(id).map(|entry| SourceLocation {
                    source: Arc::clone(&entry.source),
                    span: entry.span.clone(),
                }),
                _ => None,
            };
            let mut text = self.to_display_string(form);
            truncate_chars(&mut text, 64);
            diag.trace.push(TraceFrame { text, location });
        }
        if let Some(hook) = self.error_hook {
            hook(&diag);
        }
        diag
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn cell_capacity(&self) -> usize {
        self.cells.len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

fn truncate_chars(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn ctx() -> Context {
        Context::open(256 * 1024).expect("arena")
    }

    #[test]
    fn interning_returns_identical_cells() {
        let mut ctx = ctx();
        let a = ctx.symbol("foo").unwrap();
        let b = ctx.symbol("foo").unwrap();
        let c = ctx.symbol("bar").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.sym_name(a), Some("foo"));
    }

    #[test]
    fn cons_car_cdr_roundtrip() {
        let mut ctx = ctx();
        let p = ctx.cons(Obj::Fix(1), Obj::Fix(2)).unwrap();
        assert_eq!(ctx.car(p).unwrap(), Obj::Fix(1));
        assert_eq!(ctx.cdr(p).unwrap(), Obj::Fix(2));
        assert_eq!(ctx.car(Obj::Nil).unwrap(), Obj::Nil);
        assert_eq!(ctx.cdr(Obj::Nil).unwrap(), Obj::Nil);
    }

    #[test]
    fn make_number_fixnum_boundary() {
        let mut ctx = ctx();
        assert_eq!(ctx.make_number(41.0).unwrap(), Obj::Fix(41));
        assert_eq!(ctx.make_number(-3.0).unwrap(), Obj::Fix(-3));
        let boxed = ctx.make_number(0.5).unwrap();
        assert_eq!(ctx.type_of(boxed), Type::Number);
        assert!(matches!(boxed, Obj::Cell(_)));
        let big = ctx.make_number(1e300).unwrap();
        assert!(matches!(big, Obj::Cell(_)));
    }

    #[test]
    fn globals_default_to_nil() {
        let mut ctx = ctx();
        let s = ctx.symbol("unbound-name").unwrap();
        assert_eq!(ctx.global(s).unwrap(), Obj::Nil);
        ctx.set_global(s, Obj::Fix(7)).unwrap();
        assert_eq!(ctx.global(s).unwrap(), Obj::Fix(7));
    }

    struct Flagged(StdArc<AtomicUsize>);
    impl Foreign for Flagged {
        fn finalize(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn close_fires_ptr_finalizers() {
        let flag = StdArc::new(AtomicUsize::new(0));
        let mut ctx = ctx();
        let save = ctx.save_gc();
        ctx.ptr(Box::new(Flagged(StdArc::clone(&flag)))).unwrap();
        ctx.restore_gc(save);
        ctx.close();
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tiny_arena_reports_out_of_memory() {
        let mut ctx = Context::open(64 * 1024).expect("arena");
        let save = ctx.save_gc();
        let mut res = Ok(());
        for i in 0..100_000 {
            // Keep everything rooted through the symbol table so the
            // collector cannot reclaim anything.
            if let Err(e) = ctx.symbol(&format!("s{}", i)).map(|_| ()) {
                res = Err(e);
                break;
            }
        }
        ctx.restore_gc(save);
        assert_eq!(res, Err(Error::OutOfMemory));
    }
}

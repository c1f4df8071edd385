//! Mark-and-sweep collection over the cell arena.
//!
//! The root set is the union of the explicit root stack, the call list, the
//! module stack and the symbol table. Marking runs over an explicit
//! worklist, so arbitrarily deep structures cannot overflow the native
//! stack. Cells never move; sweeping relinks dead cells into the freelist
//! and fires `Ptr` finalizers.

use crate::context::{CellData, Context};
use crate::value::{CellId, Obj};

pub(crate) const GC_GROWTH_FACTOR: usize = 2;
pub(crate) const GC_INITIAL_DIVISOR: usize = 4;
pub(crate) const GC_MIN_THRESHOLD: usize = 1024;

impl Context {
    /// Runs a full collection. Normally triggered by the allocator; exposed
    /// so hosts and tests can force one.
    pub fn collect_garbage(&mut self) {
        self.mark_roots();
        self.sweep();
    }

    fn mark_roots(&mut self) {
        let mut work: Vec<Obj> = Vec::with_capacity(256);
        work.extend_from_slice(&self.gcstack);
        work.extend_from_slice(&self.calllist);
        work.extend_from_slice(&self.modulestack);
        work.extend(self.symbols.values().map(|&id| Obj::Cell(id)));

        while let Some(obj) = work.pop() {
            let id = match obj {
                Obj::Cell(id) => id as usize,
                _ => continue,
            };
            if self.cells[id].marked {
                continue;
            }
            self.cells[id].marked = true;
            match &self.cells[id].data {
                CellData::Pair { car, cdr } => {
                    work.push(*car);
                    work.push(*cdr);
                }
                CellData::Symbol { binding } => work.push(Obj::Cell(*binding)),
                CellData::Func(c) | CellData::Macro(c) => {
                    work.push(c.env);
                    work.push(c.free_vars);
                    work.push(c.params);
                    work.push(c.body);
                }
                CellData::Ptr(Some(value)) => value.trace(&mut |o| work.push(o)),
                _ => {}
            }
        }
    }

    fn sweep(&mut self) {
        let mut live = 0usize;
        for i in 0..self.cells.len() {
            if matches!(self.cells[i].data, CellData::Free { .. }) {
                continue;
            }
            if self.cells[i].marked {
                self.cells[i].marked = false;
                live += 1;
                continue;
            }
            if let CellData::Ptr(slot) = &mut self.cells[i].data {
                if let Some(mut value) = slot.take() {
                    value.finalize();
                }
            }
            self.cells[i].data = CellData::Free { next: self.freelist };
            self.freelist = Some(i as CellId);
            self.spans.remove(i as CellId);
        }

        self.live_count = live;
        self.allocs_since_gc = 0;
        self.gc_threshold = (live * GC_GROWTH_FACTOR).max(GC_MIN_THRESHOLD);
    }
}

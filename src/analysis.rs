//! Static free-variable analysis.
//!
//! Runs once when a closure is constructed. The result is the list of
//! symbols the body references but does not bind itself; at call time the
//! evaluator resolves each one in the definition environment to build the
//! closure's upvalues.
//!
//! The scratch sets hold symbol cells only. Interned symbols are pinned by
//! the symbol table, so the vectors need no root-stack protection; the
//! result is converted into an arena list at the very end.

use crate::context::Context;
use crate::error::Error;
use crate::value::{CellId, Obj};

/// Computes the free variables of `body` given the parameter list `params`.
/// Returns an arena list of symbols, protected on the root stack.
pub fn free_vars(ctx: &mut Context, body: Obj, params: Obj) -> Result<Obj, Error> {
    let mut bound = Vec::new();
    collect_params(ctx, params, &mut bound);

    let mut free = Vec::new();
    analyze(ctx, body, &mut bound, &mut free);

    let mut list = Obj::Nil;
    for &sym in free.iter().rev() {
        list = ctx.cons(Obj::Cell(sym), list)?;
    }
    Ok(list)
}

/// Parameter lists may end in a dotted rest parameter, which is a bound
/// name like any other.
fn collect_params(ctx: &Context, mut params: Obj, bound: &mut Vec<CellId>) {
    loop {
        match ctx.as_pair(params) {
            Some((car, cdr)) => {
                if let Some(sym) = ctx.as_symbol(car) {
                    bound.push(sym);
                }
                params = cdr;
            }
            None => {
                if let Some(sym) = ctx.as_symbol(params) {
                    bound.push(sym);
                }
                return;
            }
        }
    }
}

fn analyze(ctx: &Context, node: Obj, bound: &mut Vec<CellId>, free: &mut Vec<CellId>) {
    // Atom: a symbol outside the bound set is free.
    if let Some(sym) = ctx.as_symbol(node) {
        if !bound.contains(&sym) && !free.contains(&sym) {
            free.push(sym);
        }
        return;
    }
    let (op, args) = match ctx.as_pair(node) {
        Some(p) => p,
        None => return,
    };

    if op == Obj::Cell(ctx.sym_quote) {
        return;
    }

    if op == Obj::Cell(ctx.sym_do) {
        // A (let name expr) statement binds `name` for the statements that
        // follow it, but not for its own initializer.
        let scope = bound.len();
        let mut stmts = args;
        while let Some((stmt, rest)) = ctx.as_pair(stmts) {
            match local_let(ctx, stmt) {
                Some((name, expr)) => {
                    analyze(ctx, expr, bound, free);
                    if let Some(sym) = ctx.as_symbol(name) {
                        bound.push(sym);
                    }
                }
                None => analyze(ctx, stmt, bound, free),
            }
            stmts = rest;
        }
        bound.truncate(scope);
        return;
    }

    if op == Obj::Cell(ctx.sym_fn) || op == Obj::Cell(ctx.sym_mac) {
        // The nested body is analyzed against its own parameters; whatever
        // is free there is then resolved in this scope.
        let params = ctx.as_pair(args).map(|(p, _)| p).unwrap_or(Obj::Nil);
        let body = ctx
            .as_pair(args)
            .and_then(|(_, rest)| ctx.as_pair(rest))
            .map(|(b, _)| b)
            .unwrap_or(Obj::Nil);

        let mut inner_bound = Vec::new();
        collect_params(ctx, params, &mut inner_bound);
        let mut inner_free = Vec::new();
        analyze(ctx, body, &mut inner_bound, &mut inner_free);

        for sym in inner_free {
            analyze(ctx, Obj::Cell(sym), bound, free);
        }
        return;
    }

    // Anything else is an ordinary form: the operator and every argument
    // are analyzed, with a dotted tail treated as a value.
    analyze(ctx, op, bound, free);
    let mut rest = args;
    loop {
        match ctx.as_pair(rest) {
            Some((arg, next)) => {
                analyze(ctx, arg, bound, free);
                rest = next;
            }
            None => {
                if rest != Obj::Nil {
                    analyze(ctx, rest, bound, free);
                }
                return;
            }
        }
    }
}

/// Matches `(let name expr)` and returns `(name, expr)`.
fn local_let(ctx: &Context, stmt: Obj) -> Option<(Obj, Obj)> {
    let (op, rest) = ctx.as_pair(stmt)?;
    if op != Obj::Cell(ctx.sym_let) {
        return None;
    }
    let (name, rest) = ctx.as_pair(rest)?;
    let expr = ctx.as_pair(rest).map(|(e, _)| e).unwrap_or(Obj::Nil);
    Some((name, expr))
}

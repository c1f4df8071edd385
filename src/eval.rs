//! The tree-walking evaluator.
//!
//! Dispatch is classical: symbols resolve through the environment, other
//! atoms self-evaluate, and pairs evaluate their head and apply it. The
//! `newenv` out-parameter is how `do` sequences observe the bindings a
//! local `let` introduces. `return` is an ordinary tagged pair that flows
//! up through sequences until a closure boundary unwraps it.

use crate::analysis::free_vars;
use crate::context::{CellData, Closure, Context};
use crate::error::Error;
use crate::value::{truthy, CellId, Obj, Type};

//===----------------------------------------------------------------------===//
// Primitives
//===----------------------------------------------------------------------===//

/// Built-in operators implemented by the evaluator itself, as opposed to
/// host-registered native functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Let,
    Assign,
    If,
    Fn,
    Mac,
    While,
    Return,
    Module,
    Export,
    Import,
    Get,
    Quote,
    And,
    Or,
    Do,
    Cons,
    Car,
    Cdr,
    SetCar,
    SetCdr,
    List,
    Not,
    Is,
    Atom,
    Print,
    Lt,
    Lte,
    Add,
    Sub,
    Mul,
    Div,
}

impl Primitive {
    pub const ALL: [Primitive; 31] = [
        Primitive::Let,
        Primitive::Assign,
        Primitive::If,
        Primitive::Fn,
        Primitive::Mac,
        Primitive::While,
        Primitive::Return,
        Primitive::Module,
        Primitive::Export,
        Primitive::Import,
        Primitive::Get,
        Primitive::Quote,
        Primitive::And,
        Primitive::Or,
        Primitive::Do,
        Primitive::Cons,
        Primitive::Car,
        Primitive::Cdr,
        Primitive::SetCar,
        Primitive::SetCdr,
        Primitive::List,
        Primitive::Not,
        Primitive::Is,
        Primitive::Atom,
        Primitive::Print,
        Primitive::Lt,
        Primitive::Lte,
        Primitive::Add,
        Primitive::Sub,
        Primitive::Mul,
        Primitive::Div,
    ];

    /// The global name the primitive is registered under.
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Let => "let",
            Primitive::Assign => "=",
            Primitive::If => "if",
            Primitive::Fn => "fn",
            Primitive::Mac => "mac",
            Primitive::While => "while",
            Primitive::Return => "return",
            Primitive::Module => "module",
            Primitive::Export => "export",
            Primitive::Import => "import",
            Primitive::Get => "get",
            Primitive::Quote => "quote",
            Primitive::And => "and",
            Primitive::Or => "or",
            Primitive::Do => "do",
            Primitive::Cons => "cons",
            Primitive::Car => "car",
            Primitive::Cdr => "cdr",
            Primitive::SetCar => "setcar",
            Primitive::SetCdr => "setcdr",
            Primitive::List => "list",
            Primitive::Not => "not",
            Primitive::Is => "is",
            Primitive::Atom => "atom",
            Primitive::Print => "print",
            Primitive::Lt => "<",
            Primitive::Lte => "<=",
            Primitive::Add => "+",
            Primitive::Sub => "-",
            Primitive::Mul => "*",
            Primitive::Div => "/",
        }
    }
}

//===----------------------------------------------------------------------===//
// Argument plumbing
//===----------------------------------------------------------------------===//

/// Pops the next element off an argument list.
pub fn nextarg(ctx: &Context, arg: &mut Obj) -> Result<Obj, Error> {
    match ctx.as_pair(*arg) {
        Some((car, cdr)) => {
            *arg = cdr;
            Ok(car)
        }
        None => {
            if *arg == Obj::Nil {
                Err(Error::Arity("too few arguments".to_string()))
            } else {
                Err(Error::Arity("dotted pair in argument list".to_string()))
            }
        }
    }
}

fn evalarg(ctx: &mut Context, arg: &mut Obj, env: Obj) -> Result<Obj, Error> {
    let expr = nextarg(ctx, arg)?;
    eval_in(ctx, expr, env, None)
}

/// Evaluates every element of `lst` left-to-right into a fresh proper list.
fn evallist(ctx: &mut Context, mut lst: Obj, env: Obj) -> Result<Obj, Error> {
    let mut head = Obj::Nil;
    let mut tail: Option<Obj> = None;
    while lst != Obj::Nil {
        let v = evalarg(ctx, &mut lst, env)?;
        let pair = ctx.cons(v, Obj::Nil)?;
        match tail {
            Some(t) => ctx.set_cdr(t, pair)?,
            None => head = pair,
        }
        tail = Some(pair);
    }
    Ok(head)
}

/// Evaluates a statement sequence, threading new bindings into the
/// environment seen by later statements. A `return`-tagged result
/// short-circuits the rest of the sequence.
fn dolist(ctx: &mut Context, mut lst: Obj, mut env: Obj) -> Result<Obj, Error> {
    let mut res = Obj::Nil;
    let save = ctx.save_gc();
    while lst != Obj::Nil {
        ctx.restore_gc(save);
        ctx.push_gc(lst)?;
        ctx.push_gc(env)?;
        let stmt = nextarg(ctx, &mut lst)?;
        res = eval_in(ctx, stmt, env, Some(&mut env))?;
        if is_return(ctx, res) {
            break;
        }
    }
    Ok(res)
}

pub(crate) fn is_return(ctx: &Context, obj: Obj) -> bool {
    matches!(ctx.as_pair(obj), Some((car, _)) if car == Obj::Cell(ctx.sym_return))
}

fn return_value(ctx: &Context, obj: Obj) -> Option<Obj> {
    match ctx.as_pair(obj) {
        Some((car, cdr)) if car == Obj::Cell(ctx.sym_return) => Some(cdr),
        _ => None,
    }
}

//===----------------------------------------------------------------------===//
// Name lookup
//===----------------------------------------------------------------------===//

/// Finds the binding pair for `sym`. Environments come in two shapes: the
/// closure frame `([frame] . (locals . upvalues))`, and a plain association
/// list (used for module tables and argument environments). When neither
/// holds the name, the symbol's own `(name . value)` pair acts as the
/// global slot, so assignment through the returned handle always works.
fn getbound(ctx: &Context, sym: CellId, env: Obj) -> CellId {
    if let Some((tag, rest)) = ctx.as_pair(env) {
        if tag == Obj::Cell(ctx.sym_frame) {
            if let Some((locals, upvals)) = ctx.as_pair(rest) {
                if let Some(b) = assoc(ctx, sym, locals) {
                    return b;
                }
                if let Some(b) = assoc(ctx, sym, upvals) {
                    return b;
                }
            }
        } else if let Some(b) = assoc(ctx, sym, env) {
            return b;
        }
    }
    ctx.sym_binding(sym)
}

fn assoc(ctx: &Context, sym: CellId, mut list: Obj) -> Option<CellId> {
    while let Some((entry, rest)) = ctx.as_pair(list) {
        if let Some(id) = ctx.as_pair_id(entry) {
            if ctx.pair_car(id) == Obj::Cell(sym) {
                return Some(id);
            }
        }
        list = rest;
    }
    None
}

fn frame_parts(ctx: &Context, env: Obj) -> Option<(Obj, Obj)> {
    let (tag, rest) = ctx.as_pair(env)?;
    if tag != Obj::Cell(ctx.sym_frame) {
        return None;
    }
    ctx.as_pair(rest)
}

//===----------------------------------------------------------------------===//
// Evaluation
//===----------------------------------------------------------------------===//

/// Evaluates a form in the global environment.
pub fn eval(ctx: &mut Context, obj: Obj) -> Result<Obj, Error> {
    eval_in(ctx, obj, Obj::Nil, None)
}

pub(crate) fn eval_in(
    ctx: &mut Context,
    obj: Obj,
    env: Obj,
    newenv: Option<&mut Obj>,
) -> Result<Obj, Error> {
    if let Some(sym) = ctx.as_symbol(obj) {
        return Ok(ctx.pair_cdr(getbound(ctx, sym, env)));
    }
    if ctx.as_pair(obj).is_none() {
        return Ok(obj);
    }

    // The call list feeds error back-traces; popped only on the success
    // path, since `diagnose` snapshots and resets it on the error path.
    ctx.calllist.push(obj);
    let save = ctx.save_gc();
    let res = eval_form(ctx, obj, env, newenv)?;
    ctx.restore_gc(save);
    ctx.push_gc(res)?;
    ctx.calllist.pop();
    Ok(res)
}

fn eval_form(
    ctx: &mut Context,
    obj: Obj,
    env: Obj,
    newenv: Option<&mut Obj>,
) -> Result<Obj, Error> {
    let (head, args) = match ctx.as_pair(obj) {
        Some(p) => p,
        None => return Ok(obj),
    };
    let func = eval_in(ctx, head, env, None)?;
    match ctx.type_of(func) {
        Type::Prim => match ctx.prim_of(func) {
            Some(prim) => apply_prim(ctx, prim, args, env, newenv),
            None => Err(Error::Call),
        },
        Type::Native => match ctx.native_of(func) {
            Some(f) => {
                let evaluated = evallist(ctx, args, env)?;
                f(ctx, evaluated)
            }
            None => Err(Error::Call),
        },
        Type::Func => apply_func(ctx, func, args, env),
        Type::Macro => apply_macro(ctx, func, obj, env),
        _ => Err(Error::Call),
    }
}

fn apply_prim(
    ctx: &mut Context,
    prim: Primitive,
    mut arg: Obj,
    env: Obj,
    newenv: Option<&mut Obj>,
) -> Result<Obj, Error> {
    match prim {
        Primitive::Let => {
            let sym_obj = nextarg(ctx, &mut arg)?;
            if ctx.as_symbol(sym_obj).is_none() {
                return Err(ctx.type_error("symbol", sym_obj));
            }
            let val_expr = nextarg(ctx, &mut arg)?;
            match newenv {
                Some(slot) => {
                    // letrec: bind a nil placeholder first so the
                    // initializer can refer to the name, then patch it.
                    let binding = ctx.cons(sym_obj, Obj::Nil)?;
                    let new_env = match frame_parts(ctx, *slot) {
                        Some((locals, upvals)) => {
                            let new_locals = ctx.cons(binding, locals)?;
                            let inner = ctx.cons(new_locals, upvals)?;
                            ctx.cons(Obj::Cell(ctx.sym_frame), inner)?
                        }
                        None => ctx.cons(binding, *slot)?,
                    };
                    *slot = new_env;
                    let val = eval_in(ctx, val_expr, new_env, None)?;
                    ctx.set_cdr(binding, val)?;
                    Ok(val)
                }
                None => {
                    // No surrounding sequence: install as a global.
                    let val = eval_in(ctx, val_expr, env, None)?;
                    ctx.set_global(sym_obj, val)?;
                    Ok(val)
                }
            }
        }

        Primitive::Assign => {
            let sym_obj = nextarg(ctx, &mut arg)?;
            let sym = match ctx.as_symbol(sym_obj) {
                Some(s) => s,
                None => return Err(ctx.type_error("symbol", sym_obj)),
            };
            let v = evalarg(ctx, &mut arg, env)?;
            let binding = getbound(ctx, sym, env);
            ctx.set_pair_cdr(binding, v);
            Ok(Obj::Nil)
        }

        Primitive::If => {
            // n-ary: (if c1 b1 c2 b2 ... else). A trailing unpaired
            // expression is the else branch.
            let mut res = Obj::Nil;
            while arg != Obj::Nil {
                let cond = evalarg(ctx, &mut arg, env)?;
                if truthy(cond) {
                    res = if arg == Obj::Nil {
                        cond
                    } else {
                        evalarg(ctx, &mut arg, env)?
                    };
                    break;
                }
                if arg == Obj::Nil {
                    break;
                }
                nextarg(ctx, &mut arg)?;
            }
            Ok(res)
        }

        Primitive::While => {
            let cond = nextarg(ctx, &mut arg)?;
            let save = ctx.save_gc();
            let mut res = Obj::Nil;
            loop {
                let c = eval_in(ctx, cond, env, None)?;
                if !truthy(c) {
                    break;
                }
                let body_res = dolist(ctx, arg, env)?;
                if is_return(ctx, body_res) {
                    res = body_res;
                    break;
                }
                ctx.restore_gc(save);
            }
            Ok(res)
        }

        Primitive::And => {
            let mut res = Obj::Nil;
            while arg != Obj::Nil {
                res = evalarg(ctx, &mut arg, env)?;
                if !truthy(res) {
                    break;
                }
            }
            Ok(res)
        }

        Primitive::Or => {
            let mut res = Obj::Nil;
            while arg != Obj::Nil {
                res = evalarg(ctx, &mut arg, env)?;
                if truthy(res) {
                    break;
                }
            }
            Ok(res)
        }

        Primitive::Do => dolist(ctx, arg, env),

        Primitive::Quote => nextarg(ctx, &mut arg),

        Primitive::Fn | Primitive::Mac => {
            let params = nextarg(ctx, &mut arg)?;
            let body = ctx.car(arg)?;
            let free = free_vars(ctx, body, params)?;
            let body_list = ctx.cons(body, Obj::Nil)?;
            let closure = Closure { env, free_vars: free, params, body: body_list };
            let data = if prim == Primitive::Fn {
                CellData::Func(closure)
            } else {
                CellData::Macro(closure)
            };
            Ok(Obj::Cell(ctx.alloc(data)?))
        }

        Primitive::Return => {
            let v = if arg == Obj::Nil {
                Obj::Nil
            } else {
                evalarg(ctx, &mut arg, env)?
            };
            ctx.cons(Obj::Cell(ctx.sym_return), v)
        }

        Primitive::Module => {
            let name_obj = evalarg(ctx, &mut arg, env)?;
            let body = nextarg(ctx, &mut arg)?;
            ctx.modulestack.push(Obj::Nil);
            let mut menv = env;
            let body_res = eval_in(ctx, body, menv, Some(&mut menv));
            let exports = ctx.modulestack.pop().unwrap_or(Obj::Nil);
            ctx.push_gc(exports)?;
            body_res?;
            let name = ctx.str_value(name_obj)?.to_owned();
            let sym = ctx.symbol(&name)?;
            ctx.set_global(sym, exports)?;
            Ok(exports)
        }

        Primitive::Export => {
            if ctx.modulestack.is_empty() {
                return Err(Error::Type("export outside of module".to_string()));
            }
            let decl = nextarg(ctx, &mut arg)?;
            let name_sym = {
                let rest = ctx.cdr(decl)?;
                ctx.car(rest)?
            };
            if ctx.as_symbol(name_sym).is_none() {
                return Err(ctx.type_error("symbol", name_sym));
            }
            let res = eval_in(ctx, decl, env, newenv)?;
            let binding = ctx.cons(name_sym, res)?;
            let exports = ctx.modulestack.last().copied().unwrap_or(Obj::Nil);
            let new_exports = ctx.cons(binding, exports)?;
            if let Some(top) = ctx.modulestack.last_mut() {
                *top = new_exports;
            }
            Ok(res)
        }

        Primitive::Import => Ok(Obj::Nil),

        Primitive::Get => {
            let object = evalarg(ctx, &mut arg, env)?;
            let name = nextarg(ctx, &mut arg)?;
            let sym = match ctx.as_symbol(name) {
                Some(s) => s,
                None => return Err(ctx.type_error("symbol", name)),
            };
            Ok(ctx.pair_cdr(getbound(ctx, sym, object)))
        }

        Primitive::Cons => {
            let a = evalarg(ctx, &mut arg, env)?;
            let b = evalarg(ctx, &mut arg, env)?;
            ctx.cons(a, b)
        }

        Primitive::Car => {
            let v = evalarg(ctx, &mut arg, env)?;
            ctx.car(v)
        }

        Primitive::Cdr => {
            let v = evalarg(ctx, &mut arg, env)?;
            ctx.cdr(v)
        }

        Primitive::SetCar => {
            let pair = evalarg(ctx, &mut arg, env)?;
            if ctx.as_pair_id(pair).is_none() {
                return Err(ctx.type_error("pair", pair));
            }
            let v = evalarg(ctx, &mut arg, env)?;
            ctx.set_car(pair, v)?;
            Ok(Obj::Nil)
        }

        Primitive::SetCdr => {
            let pair = evalarg(ctx, &mut arg, env)?;
            if ctx.as_pair_id(pair).is_none() {
                return Err(ctx.type_error("pair", pair));
            }
            let v = evalarg(ctx, &mut arg, env)?;
            ctx.set_cdr(pair, v)?;
            Ok(Obj::Nil)
        }

        Primitive::List => evallist(ctx, arg, env),

        Primitive::Not => {
            let v = evalarg(ctx, &mut arg, env)?;
            Ok(Obj::Bool(!truthy(v)))
        }

        Primitive::Is => {
            let a = evalarg(ctx, &mut arg, env)?;
            let b = evalarg(ctx, &mut arg, env)?;
            Ok(Obj::Bool(ctx.equal(a, b)))
        }

        Primitive::Atom => {
            let v = evalarg(ctx, &mut arg, env)?;
            Ok(Obj::Bool(ctx.type_of(v) != Type::Pair))
        }

        Primitive::Print => {
            let mut out = String::new();
            let mut first = true;
            while arg != Obj::Nil {
                let v = evalarg(ctx, &mut arg, env)?;
                if !first {
                    out.push(' ');
                }
                ctx.write_obj(v, &mut out, false);
                first = false;
            }
            println!("{}", out);
            Ok(Obj::Nil)
        }

        Primitive::Lt => {
            let a = evalarg(ctx, &mut arg, env)?;
            let a = ctx.to_number(a)?;
            let b = evalarg(ctx, &mut arg, env)?;
            let b = ctx.to_number(b)?;
            Ok(Obj::Bool(a < b))
        }

        Primitive::Lte => {
            let a = evalarg(ctx, &mut arg, env)?;
            let a = ctx.to_number(a)?;
            let b = evalarg(ctx, &mut arg, env)?;
            let b = ctx.to_number(b)?;
            Ok(Obj::Bool(a <= b))
        }

        Primitive::Add => arith(ctx, arg, env, |a, b| a + b),
        Primitive::Mul => arith(ctx, arg, env, |a, b| a * b),
        Primitive::Div => arith(ctx, arg, env, |a, b| a / b),

        Primitive::Sub => {
            if arg == Obj::Nil {
                return ctx.make_number(0.0);
            }
            let first = evalarg(ctx, &mut arg, env)?;
            let mut x = ctx.to_number(first)?;
            if arg == Obj::Nil {
                return ctx.make_number(-x);
            }
            while arg != Obj::Nil {
                let v = evalarg(ctx, &mut arg, env)?;
                x -= ctx.to_number(v)?;
            }
            ctx.make_number(x)
        }
    }
}

fn arith(
    ctx: &mut Context,
    mut arg: Obj,
    env: Obj,
    op: fn(f64, f64) -> f64,
) -> Result<Obj, Error> {
    let first = evalarg(ctx, &mut arg, env)?;
    let mut x = ctx.to_number(first)?;
    while arg != Obj::Nil {
        let v = evalarg(ctx, &mut arg, env)?;
        x = op(x, ctx.to_number(v)?);
    }
    ctx.make_number(x)
}

//===----------------------------------------------------------------------===//
// Application
//===----------------------------------------------------------------------===//

/// Resolves each free variable of the closure in its definition
/// environment, collecting the binding pairs themselves so captures have
/// reference semantics.
fn build_upvalues(ctx: &mut Context, closure: &Closure) -> Result<Obj, Error> {
    let mut upvals = Obj::Nil;
    let mut fv = closure.free_vars;
    while let Some((sym_obj, rest)) = ctx.as_pair(fv) {
        if let Some(sym) = ctx.as_symbol(sym_obj) {
            let binding = getbound(ctx, sym, closure.env);
            upvals = ctx.cons(Obj::Cell(binding), upvals)?;
        }
        fv = rest;
    }
    Ok(upvals)
}

/// Zips formals against actuals: excess actuals are dropped, excess
/// formals bind to nil, and a dotted tail parameter takes the remaining
/// actuals as a list.
fn argstoenv(ctx: &mut Context, mut prm: Obj, mut arg: Obj) -> Result<Obj, Error> {
    let mut env = Obj::Nil;
    loop {
        match ctx.as_pair(prm) {
            None => {
                if prm != Obj::Nil {
                    let binding = ctx.cons(prm, arg)?;
                    env = ctx.cons(binding, env)?;
                }
                break;
            }
            Some((p, rest)) => {
                let a = ctx.car(arg)?;
                let binding = ctx.cons(p, a)?;
                env = ctx.cons(binding, env)?;
                prm = rest;
                arg = ctx.cdr(arg)?;
            }
        }
    }
    Ok(env)
}

fn make_frame(ctx: &mut Context, locals: Obj, upvals: Obj) -> Result<Obj, Error> {
    let inner = ctx.cons(locals, upvals)?;
    ctx.cons(Obj::Cell(ctx.sym_frame), inner)
}

fn apply_func(ctx: &mut Context, func: Obj, arg_exprs: Obj, env: Obj) -> Result<Obj, Error> {
    let closure = match ctx.closure_of(func) {
        Some(c) => c,
        None => return Err(Error::Call),
    };
    let args = evallist(ctx, arg_exprs, env)?;

    let save = ctx.save_gc();
    let upvals = build_upvalues(ctx, &closure)?;
    ctx.restore_gc(save);
    ctx.push_gc(upvals)?;

    let locals = argstoenv(ctx, closure.params, args)?;
    let frame = make_frame(ctx, locals, upvals)?;
    let res = dolist(ctx, closure.body, frame)?;
    Ok(match return_value(ctx, res) {
        Some(v) => v,
        None => res,
    })
}

/// Macros receive their arguments unevaluated. The expansion replaces the
/// call expression in place, so the next evaluation of this form skips the
/// expansion step, and is then evaluated in the caller's environment.
fn apply_macro(ctx: &mut Context, func: Obj, call: Obj, env: Obj) -> Result<Obj, Error> {
    let closure = match ctx.closure_of(func) {
        Some(c) => c,
        None => return Err(Error::Call),
    };
    let args = ctx.cdr(call)?;

    let save = ctx.save_gc();
    let upvals = build_upvalues(ctx, &closure)?;
    ctx.restore_gc(save);
    ctx.push_gc(upvals)?;

    let locals = argstoenv(ctx, closure.params, args)?;
    let frame = make_frame(ctx, locals, upvals)?;
    let expansion = dolist(ctx, closure.body, frame)?;

    let call_id = match ctx.as_pair_id(call) {
        Some(id) => id,
        None => return Err(Error::Call),
    };
    match ctx.as_pair(expansion) {
        Some((car, cdr)) => ctx.set_pair(call_id, car, cdr),
        None => {
            // A non-pair expansion still has to live in the call cell;
            // quoting it preserves its value under re-evaluation.
            let tail = ctx.cons(expansion, Obj::Nil)?;
            ctx.set_pair(call_id, Obj::Cell(ctx.sym_quote), tail);
        }
    }
    eval_in(ctx, call, env, None)
}

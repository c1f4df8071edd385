//! Module definition, export tables, and dotted access.

use cinder::compiler;
use cinder::{builtins, Context};

fn ctx() -> Context {
    let mut ctx = Context::open(1024 * 1024).expect("arena");
    builtins::install(&mut ctx).expect("builtins");
    ctx
}

fn eval_display(ctx: &mut Context, src: &str) -> String {
    let save = ctx.save_gc();
    let value = compiler::do_string(ctx, src).unwrap_or_else(|d| {
        panic!("failed to eval `{}`:\n{}", src, d.format());
    });
    let out = ctx.to_display_string(value);
    ctx.restore_gc(save);
    out
}

#[test]
fn module_exports_are_reachable_through_dotted_access() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "module(\"m\") { export let pi = 3.14159; export fn sq(x){ x*x } }\n\
             import m;\n\
             [m.pi, m.sq(9)];"
        ),
        "(3.14159 81)"
    );
}

#[test]
fn later_exports_see_earlier_ones() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "module(\"geo\") {\n\
               export let tau = 6.0;\n\
               export fn half_tau(){ tau / 2 }\n\
             }\n\
             geo.half_tau();"
        ),
        "3"
    );
}

#[test]
fn unexported_bindings_stay_private() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "module(\"m\") { let hidden = 1; export let shown = 2; }\n\
             m.hidden;"
        ),
        // `hidden` is not in the export table; lookup falls back to the
        // (unbound) global slot.
        "nil"
    );
    assert_eq!(eval_display(&mut ctx, "m.shown;"), "2");
}

#[test]
fn module_value_is_its_export_table() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(&mut ctx, "module(\"empty\") {}\nempty;"),
        "nil"
    );
    assert_eq!(
        eval_display(&mut ctx, "module(\"one\") { export let x = 1; }\none;"),
        "((x . 1))"
    );
}

#[test]
fn import_of_a_defined_module_is_a_no_op() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "module(\"m\") { export let x = 5; }\nimport m;\nm.x;"
        ),
        "5"
    );
    // importing something never defined is also quietly accepted
    assert_eq!(eval_display(&mut ctx, "import missing;"), "nil");
}

#[test]
fn modules_can_nest_at_the_statement_level() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "module(\"outer\") {\n\
               module(\"inner\") { export let x = 1; }\n\
               export let y = 2;\n\
             }\n\
             [inner.x, outer.y];"
        ),
        "(1 2)"
    );
}

#[test]
fn export_outside_a_module_is_rejected_at_runtime() {
    let mut ctx = ctx();
    let save = ctx.save_gc();
    let err = compiler::do_string(&mut ctx, "export let x = 1;")
        .expect_err("export outside module must fail");
    assert!(err.format().starts_with("error: export outside of module"));
    ctx.restore_gc(save);
}

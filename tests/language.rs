//! End-to-end language behavior through the curly-brace front-end.

use cinder::compiler;
use cinder::reader::read_str;
use cinder::value::Obj;
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
fn factorial_through_recursive_calls() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "let f = fn(n){ if(n<=1) 1 else n*f(n-1) }; f(10);"
        ),
        "3628800"
    );
}

#[test]
fn counter_closure_with_mutable_captured_state() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "fn make_counter(){ let c = 0; fn inc(){ c = c + 1; return c; } return inc; }\n\
             let g = make_counter();\n\
             [g(), g(), g()];"
        ),
        "(1 2 3)"
    );
}

#[test]
fn independent_counters_do_not_share_state() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "fn make_counter(){ let c = 0; fn inc(){ c = c + 1; return c; } return inc; }\n\
             let a = make_counter();\n\
             let b = make_counter();\n\
             [a(), a(), b()];"
        ),
        "(1 2 1)"
    );
}

#[test]
fn list_literal_with_car_cdr_access() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "let xs = [1,2,3];\n\
             [car(xs), car(cdr(xs)), car(cdr(cdr(xs)))];"
        ),
        "(1 2 3)"
    );
}

#[test]
fn while_loop_accumulates() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "let i = 0; let sum = 0;\n\
             while (i < 10) { sum = sum + i; i = i + 1; }\n\
             sum;"
        ),
        "45"
    );
}

#[test]
fn return_exits_the_enclosing_function_from_a_loop() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "fn first_over(limit, xs) {\n\
               while (!isnil(xs)) {\n\
                 if (limit < car(xs)) return car(xs);\n\
                 xs = cdr(xs);\n\
               }\n\
               return nil;\n\
             }\n\
             first_over(2, [1, 2, 3, 4]);"
        ),
        "3"
    );
}

#[test]
fn higher_order_builtins_compose() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(
            &mut ctx,
            "fold(fn(x, acc){ acc + x }, 0, map(fn(x){ x * x }, [1, 2, 3]));"
        ),
        "14"
    );
    assert_eq!(
        eval_display(&mut ctx, "filter(fn(x){ x > 1 }, [1, 2, 3]);"),
        "(2 3)"
    );
}

#[test]
fn string_values_flow_through() {
    let mut ctx = ctx();
    assert_eq!(
        eval_display(&mut ctx, "concat(upper(\"abc\"), \"-\", strlen(\"abc\"));"),
        "ABC-3"
    );
}

#[test]
fn truthiness_follows_nil_and_false_only() {
    let mut ctx = ctx();
    assert_eq!(eval_display(&mut ctx, "if (0) \"t\" else \"f\";"), "t");
    assert_eq!(eval_display(&mut ctx, "if (\"\") \"t\" else \"f\";"), "t");
    assert_eq!(eval_display(&mut ctx, "if (nil) \"t\" else \"f\";"), "f");
    assert_eq!(eval_display(&mut ctx, "if (false) \"t\" else \"f\";"), "f");
}

#[test]
fn logical_operators_produce_operand_values() {
    let mut ctx = ctx();
    assert_eq!(eval_display(&mut ctx, "1 and 2;"), "2");
    assert_eq!(eval_display(&mut ctx, "nil or 3;"), "3");
    assert_eq!(eval_display(&mut ctx, "false and 2;"), "false");
}

#[test]
fn anonymous_fn_in_expression_position() {
    let mut ctx = ctx();
    assert_eq!(eval_display(&mut ctx, "let apply = fn(f, x){ f(x) }; apply(fn(x){ x + 1 }, 41);"), "42");
}

#[test]
fn comparison_desugaring_evaluates_correctly() {
    let mut ctx = ctx();
    assert_eq!(eval_display(&mut ctx, "3 > 2;"), "true");
    assert_eq!(eval_display(&mut ctx, "2 >= 3;"), "false");
    assert_eq!(eval_display(&mut ctx, "2 != 3;"), "true");
    assert_eq!(eval_display(&mut ctx, "2 == 2.0;"), "true");
}

#[test]
fn macro_expansion_memoizes_into_the_call_site() {
    let mut ctx = ctx();
    // Macros are a Core-level feature; drive them through the reader.
    let save = ctx.save_gc();
    let def = read_str(&mut ctx, "(let inc (mac (x) (list '+ 1 x)))")
        .expect("read")
        .expect("form");
    cinder::eval::eval(&mut ctx, def).expect("defmac");

    let call = read_str(&mut ctx, "(inc 41)").expect("read").expect("form");
    ctx.push_gc(call).expect("root");
    let result = cinder::eval::eval(&mut ctx, call).expect("call");
    assert_eq!(result, Obj::Fix(42));
    assert_eq!(ctx.to_display_string(call), "(+ 1 41)");
    ctx.restore_gc(save);
}

#[test]
fn fixnum_boundary_falls_back_to_boxed_numbers() {
    let mut ctx = ctx();
    // 2^62 - 1 is the largest fixnum literal; one past it boxes a double.
    assert_eq!(
        eval_display(&mut ctx, "4611686018427387903;"),
        "4611686018427387903"
    );
    assert_eq!(eval_display(&mut ctx, "4611686018427387904;"), "4.611686e18");
}

#[test]
fn division_produces_doubles_when_inexact() {
    let mut ctx = ctx();
    assert_eq!(eval_display(&mut ctx, "7 / 2;"), "3.5");
    assert_eq!(eval_display(&mut ctx, "8 / 2;"), "4");
}

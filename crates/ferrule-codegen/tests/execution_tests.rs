//! Execution tests: compiled modules run under `wasmi`.
//!
//! Tests validate:
//! - Primitive arithmetic, comparisons and short-circuit logic
//! - Control flow (if/else chains, early return, while loops)
//! - Recursion and compile-on-demand call graphs
//! - Host imports
//! - The structure ABI: frame slots, out-pointer results, pointer params
//! - The shadow stack pointer is restored after every call

mod common;

use common::*;
use ferrule_types::ast::{BinOp, ElseBranch, Expr, ExprKind, IfExpr, Program};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

const STACK_TOP: i32 = 65536;

fn run(prog: &Program) -> Instance {
    Instance::new(&compile_ok(prog))
}

/// `if c { a } else if c2 { b } else { d }`
fn if_chain(cond: Expr, then: Expr, cond2: Expr, then2: Expr, otherwise: Expr) -> Expr {
    let inner = IfExpr {
        condition: cond2,
        then_block: value(then2),
        else_branch: Some(ElseBranch::Block(value(otherwise))),
        span: line(0),
    };
    Expr::new(
        ExprKind::If(Box::new(IfExpr {
            condition: cond,
            then_block: value(then),
            else_branch: Some(ElseBranch::ElseIf(Box::new(inner))),
            span: line(0),
        })),
        line(0),
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// Primitives
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn fibonacci_with_a_while_loop() {
    // a, b = b, a + b   n times
    let prog = program(
        vec![],
        vec![],
        vec![export(
            "fibonacci",
            &[("n", "i32")],
            Some("i32"),
            block(
                vec![
                    let_("a", None, Some(num(0.0))),
                    let_("b", None, Some(num(1.0))),
                    let_("i", None, Some(num(0.0))),
                    while_(
                        bin(var("i"), BinOp::Less, var("n")),
                        block(
                            vec![
                                let_("t", None, Some(bin(var("a"), BinOp::Add, var("b")))),
                                set(&["a"], var("b")),
                                set(&["b"], var("t")),
                                set(&["i"], bin(var("i"), BinOp::Add, num(1.0))),
                            ],
                            None,
                        ),
                    ),
                ],
                Some(var("a")),
            ),
        )],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("fibonacci", 0), 0);
    assert_eq!(inst.call::<i32, i32>("fibonacci", 1), 1);
    assert_eq!(inst.call::<i32, i32>("fibonacci", 10), 55);
    assert_eq!(inst.call::<i32, i32>("fibonacci", 24), 46368);
}

#[test]
fn fibonacci_through_accumulator_helper() {
    let prog = program(
        vec![],
        vec![],
        vec![
            func(
                "fib_acc",
                &[("n", "i32"), ("a", "i32"), ("b", "i32")],
                Some("i32"),
                value(if_else(
                    bin(var("n"), BinOp::Eq, num(0.0)),
                    value(var("a")),
                    Some(value(call(
                        "fib_acc",
                        vec![
                            bin(var("n"), BinOp::Sub, num(1.0)),
                            var("b"),
                            bin(var("a"), BinOp::Add, var("b")),
                        ],
                    ))),
                )),
            ),
            export(
                "fibonacci",
                &[("n", "i32")],
                Some("i32"),
                value(call("fib_acc", vec![var("n"), num(0.0), num(1.0)])),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("fibonacci", 24), 46368);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
}

#[test]
fn recursive_fibonacci() {
    let prog = program(
        vec![],
        vec![],
        vec![
            func(
                "fib",
                &[("n", "i32")],
                Some("i32"),
                value(if_else(
                    bin(var("n"), BinOp::Less, num(2.0)),
                    value(var("n")),
                    Some(value(bin(
                        call("fib", vec![bin(var("n"), BinOp::Sub, num(1.0))]),
                        BinOp::Add,
                        call("fib", vec![bin(var("n"), BinOp::Sub, num(2.0))]),
                    ))),
                )),
            ),
            export("fib_rec", &[("n", "i32")], Some("i32"), value(call("fib", vec![var("n")]))),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("fib_rec", 24), 46368);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
}

#[test]
fn integer_arithmetic() {
    // ((a + b) * (a - b)) / 2 % 7
    let expr = bin(
        bin(
            paren(bin(
                paren(bin(var("a"), BinOp::Add, var("b"))),
                BinOp::Mul,
                paren(bin(var("a"), BinOp::Sub, var("b"))),
            )),
            BinOp::Div,
            num(2.0),
        ),
        BinOp::Mod,
        num(7.0),
    );
    let prog = program(
        vec![],
        vec![],
        vec![
            export("calc", &[("a", "i32"), ("b", "i32")], Some("i32"), value(expr)),
            export("negate", &[("a", "i32")], Some("i32"), value(neg(var("a")))),
            export("min_int", &[], Some("i32"), value(neg(num(2147483648.0)))),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<(i32, i32), i32>("calc", (9, 2)), 3);
    assert_eq!(inst.call::<(i32, i32), i32>("calc", (2, 9)), -3);
    assert_eq!(inst.call::<i32, i32>("negate", 5), -5);
    assert_eq!(inst.call::<(), i32>("min_int", ()), i32::MIN);
}

#[test]
fn wide_and_float_arithmetic() {
    let prog = program(
        vec![],
        vec![],
        vec![
            export(
                "scale",
                &[("n", "i64")],
                Some("i64"),
                value(bin(var("n"), BinOp::Mul, num(1_000_000.0))),
            ),
            export(
                "area",
                &[("r", "f64")],
                Some("f64"),
                value(bin(bin(var("r"), BinOp::Mul, var("r")), BinOp::Mul, num(3.0))),
            ),
            export(
                "half",
                &[("x", "f32")],
                Some("f32"),
                value(neg(bin(var("x"), BinOp::Div, num(2.0)))),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i64, i64>("scale", 5_000_000), 5_000_000_000_000);
    assert_eq!(inst.call::<f64, f64>("area", 2.0), 12.0);
    assert_eq!(inst.call::<f32, f32>("half", 3.0), -1.5);
}

#[test]
fn comparisons_and_short_circuit_logic() {
    let prog = program(
        vec![],
        vec![],
        vec![
            export(
                "in_range",
                &[("x", "i32")],
                Some("bool"),
                value(bin(
                    bin(var("x"), BinOp::GreaterEq, num(0.0)),
                    BinOp::And,
                    bin(var("x"), BinOp::Less, num(10.0)),
                )),
            ),
            export(
                "outside",
                &[("x", "i32")],
                Some("bool"),
                value(not(call("in_range", vec![var("x")]))),
            ),
            export(
                "either",
                &[("a", "bool"), ("b", "bool")],
                Some("bool"),
                value(bin(var("a"), BinOp::Or, var("b"))),
            ),
            export(
                "same",
                &[("a", "bool"), ("b", "bool")],
                Some("bool"),
                value(bin(var("a"), BinOp::Eq, var("b"))),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("in_range", 5), 1);
    assert_eq!(inst.call::<i32, i32>("in_range", 10), 0);
    assert_eq!(inst.call::<i32, i32>("in_range", -1), 0);
    assert_eq!(inst.call::<i32, i32>("outside", 12), 1);
    assert_eq!(inst.call::<(i32, i32), i32>("either", (0, 1)), 1);
    assert_eq!(inst.call::<(i32, i32), i32>("either", (0, 0)), 0);
    assert_eq!(inst.call::<(i32, i32), i32>("same", (1, 1)), 1);
    assert_eq!(inst.call::<(i32, i32), i32>("same", (1, 0)), 0);
}

#[test]
fn right_operand_of_and_is_skipped() {
    // `false and (print(1) == ...)` would print if evaluated.
    let prog = program(
        vec![],
        vec![import("env", "print", "print", &["i32"], None)],
        vec![
            func(
                "noisy",
                &[],
                Some("bool"),
                block(vec![stmt(call("print", vec![num(1.0)]))], Some(boolean(true))),
            ),
            export(
                "check",
                &[("a", "bool")],
                Some("bool"),
                value(bin(var("a"), BinOp::And, call("noisy", vec![]))),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("check", 0), 0);
    assert!(inst.printed().is_empty());
    assert_eq!(inst.call::<i32, i32>("check", 1), 1);
    assert_eq!(inst.printed(), &[1]);
}

// ══════════════════════════════════════════════════════════════════════════════
// Control flow
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn else_if_chain() {
    let prog = program(
        vec![],
        vec![],
        vec![export(
            "sign",
            &[("x", "i32")],
            Some("i32"),
            value(if_chain(
                bin(var("x"), BinOp::Less, num(0.0)),
                neg(num(1.0)),
                bin(var("x"), BinOp::Eq, num(0.0)),
                num(0.0),
                num(1.0),
            )),
        )],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("sign", -7), -1);
    assert_eq!(inst.call::<i32, i32>("sign", 0), 0);
    assert_eq!(inst.call::<i32, i32>("sign", 42), 1);
}

#[test]
fn early_return_restores_the_stack_pointer() {
    let prog = program(
        vec![point()],
        vec![],
        vec![export(
            "clamp",
            &[("x", "i32")],
            Some("i32"),
            block(
                vec![
                    // Forces a non-empty frame.
                    let_("p", None, Some(lit("Point", vec![("x", var("x")), ("y", num(100.0))]))),
                    stmt(if_else(
                        bin(field(var("p"), "x"), BinOp::Greater, field(var("p"), "y")),
                        block(vec![ret(Some(num(100.0)))], None),
                        None,
                    )),
                ],
                Some(var("x")),
            ),
        )],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("clamp", 500), 100);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
    assert_eq!(inst.call::<i32, i32>("clamp", 7), 7);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
}

#[test]
fn while_loop_calls_host_import() {
    let prog = program(
        vec![],
        vec![import("env", "print", "print", &["i32"], None)],
        vec![export(
            "count",
            &[("n", "i32")],
            None,
            block(
                vec![
                    let_("i", Some("i32"), Some(num(0.0))),
                    while_(
                        bin(var("i"), BinOp::Less, var("n")),
                        block(
                            vec![
                                stmt(call("print", vec![bin(var("i"), BinOp::Mul, var("i"))])),
                                set(&["i"], bin(var("i"), BinOp::Add, num(1.0))),
                            ],
                            None,
                        ),
                    ),
                ],
                None,
            ),
        )],
    );
    let mut inst = run(&prog);
    inst.call::<i32, ()>("count", 4);
    assert_eq!(inst.printed(), &[0, 1, 4, 9]);
}

// ══════════════════════════════════════════════════════════════════════════════
// Structures
// ══════════════════════════════════════════════════════════════════════════════

/// `struct Line { start: Point, end: Point }`
fn line_struct() -> ferrule_types::ast::StructDecl {
    structure("Line", &[("start", "Point"), ("end", "Point")])
}

fn make_point() -> ferrule_types::ast::FunctionDecl {
    func(
        "make_point",
        &[("x", "i32"), ("y", "i32")],
        Some("Point"),
        value(lit("Point", vec![("x", var("x")), ("y", var("y"))])),
    )
}

#[test]
fn nested_structure_built_field_by_field() {
    // dx² + dy² of a line assembled from a call and two primitive stores.
    let d = |axis: &str| {
        bin(
            field(field(var("l"), "end"), axis),
            BinOp::Sub,
            field(field(var("l"), "start"), axis),
        )
    };
    let prog = program(
        vec![point(), line_struct()],
        vec![],
        vec![
            make_point(),
            func(
                "length2",
                &[("l", "Line")],
                Some("i32"),
                block(
                    vec![let_("dx", None, Some(d("x"))), let_("dy", None, Some(d("y")))],
                    Some(bin(
                        bin(var("dx"), BinOp::Mul, var("dx")),
                        BinOp::Add,
                        bin(var("dy"), BinOp::Mul, var("dy")),
                    )),
                ),
            ),
            export(
                "run",
                &[("a", "i32")],
                Some("i32"),
                block(
                    vec![
                        let_("line", Some("Line"), None),
                        set(&["line", "start"], call("make_point", vec![var("a"), num(0.0)])),
                        set(&["line", "end", "x"], bin(num(3.0), BinOp::Add, var("a"))),
                        set(&["line", "end", "y"], num(4.0)),
                    ],
                    Some(call("length2", vec![var("line")])),
                ),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("run", 1), 25);
    assert_eq!(inst.call::<i32, i32>("run", -10), 25);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
}

#[test]
fn structure_passed_and_returned() {
    let prog = program(
        vec![point()],
        vec![],
        vec![
            func(
                "translate",
                &[("p", "Point"), ("dx", "i32")],
                Some("Point"),
                value(lit(
                    "Point",
                    vec![
                        ("x", bin(field(var("p"), "x"), BinOp::Add, var("dx"))),
                        ("y", field(var("p"), "y")),
                    ],
                )),
            ),
            export(
                "moved",
                &[("a", "i32")],
                Some("i32"),
                block(
                    vec![
                        let_("p", None, Some(lit("Point", vec![("x", var("a")), ("y", num(3.0))]))),
                        let_("q", None, Some(call("translate", vec![var("p"), num(10.0)]))),
                    ],
                    Some(bin(field(var("q"), "x"), BinOp::Add, field(var("q"), "y"))),
                ),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("moved", 1), 14);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
}

#[test]
fn structure_valued_if() {
    let prog = program(
        vec![point()],
        vec![],
        vec![
            make_point(),
            func(
                "pick",
                &[("flag", "bool"), ("a", "i32")],
                Some("Point"),
                value(if_else(
                    var("flag"),
                    value(lit("Point", vec![("x", var("a")), ("y", num(1.0))])),
                    Some(value(call("make_point", vec![num(2.0), var("a")]))),
                )),
            ),
            export(
                "pick_sum",
                &[("flag", "bool"), ("a", "i32")],
                Some("i32"),
                block(
                    vec![let_("p", None, Some(call("pick", vec![var("flag"), var("a")])))],
                    Some(bin(
                        bin(field(var("p"), "x"), BinOp::Mul, num(10.0)),
                        BinOp::Add,
                        field(var("p"), "y"),
                    )),
                ),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<(i32, i32), i32>("pick_sum", (1, 5)), 51);
    assert_eq!(inst.call::<(i32, i32), i32>("pick_sum", (0, 5)), 25);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
}

#[test]
fn structure_if_without_annotation_uses_first_arm_slot() {
    // `let p = if c { a } else { b };` with no declared type.
    let prog = program(
        vec![point()],
        vec![],
        vec![export(
            "choose",
            &[("c", "bool")],
            Some("i32"),
            block(
                vec![
                    let_("a", None, Some(lit("Point", vec![("x", num(1.0)), ("y", num(2.0))]))),
                    let_("b", None, Some(lit("Point", vec![("x", num(30.0)), ("y", num(40.0))]))),
                    let_("p", None, Some(if_else(var("c"), value(var("a")), Some(value(var("b")))))),
                ],
                Some(bin(field(var("p"), "x"), BinOp::Add, field(var("p"), "y"))),
            ),
        )],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("choose", 1), 3);
    assert_eq!(inst.call::<i32, i32>("choose", 0), 70);
}

#[test]
fn moved_structure_can_be_redefined() {
    let prog = program(
        vec![point()],
        vec![],
        vec![export(
            "redefine",
            &[],
            Some("i32"),
            block(
                vec![
                    let_("p", None, Some(lit("Point", vec![("x", num(1.0)), ("y", num(2.0))]))),
                    let_("q", None, Some(var("p"))),
                    set(&["p", "x"], num(5.0)),
                    set(&["p", "y"], num(6.0)),
                ],
                Some(bin(field(var("p"), "x"), BinOp::Add, field(var("q"), "y"))),
            ),
        )],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<(), i32>("redefine", ()), 7);
}

#[test]
fn structure_updated_inside_a_loop() {
    let prog = program(
        vec![point()],
        vec![],
        vec![export(
            "sum_to",
            &[("n", "i32")],
            Some("i32"),
            block(
                vec![
                    let_("acc", None, Some(lit("Point", vec![("x", num(0.0)), ("y", num(0.0))]))),
                    let_("i", None, Some(num(0.0))),
                    while_(
                        bin(var("i"), BinOp::Less, var("n")),
                        block(
                            vec![
                                set(&["acc", "x"], bin(field(var("acc"), "x"), BinOp::Add, var("i"))),
                                set(&["acc", "y"], bin(field(var("acc"), "y"), BinOp::Add, num(1.0))),
                                set(&["i"], bin(var("i"), BinOp::Add, num(1.0))),
                            ],
                            None,
                        ),
                    ),
                ],
                Some(bin(field(var("acc"), "x"), BinOp::Mul, field(var("acc"), "y"))),
            ),
        )],
    );
    let mut inst = run(&prog);
    // (0+1+2+3+4) * 5
    assert_eq!(inst.call::<i32, i32>("sum_to", 5), 50);
}

#[test]
fn whole_structure_assignment() {
    let prog = program(
        vec![point()],
        vec![],
        vec![
            make_point(),
            export(
                "reassign",
                &[("a", "i32")],
                Some("i32"),
                block(
                    vec![
                        let_("p", None, Some(call("make_point", vec![num(1.0), num(1.0)]))),
                        set(&["p"], call("make_point", vec![var("a"), bin(var("a"), BinOp::Mul, num(2.0))])),
                    ],
                    Some(bin(field(var("p"), "x"), BinOp::Add, field(var("p"), "y"))),
                ),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("reassign", 4), 12);
}

#[test]
fn empty_structure_returned_and_passed() {
    let prog = program(
        vec![structure("Unit", &[])],
        vec![],
        vec![
            func("make", &[], Some("Unit"), value(lit("Unit", vec![]))),
            func("consume", &[("u", "Unit"), ("a", "i32")], Some("i32"), value(var("a"))),
            export(
                "returned",
                &[("a", "i32")],
                Some("i32"),
                block(
                    vec![let_("u", None, Some(call("make", vec![])))],
                    Some(bin(var("a"), BinOp::Add, num(7.0))),
                ),
            ),
            export(
                "passed",
                &[("a", "i32")],
                Some("i32"),
                block(
                    vec![let_("u", Some("Unit"), Some(call("make", vec![])))],
                    Some(bin(
                        call("consume", vec![var("u"), var("a")]),
                        BinOp::Add,
                        call("consume", vec![lit("Unit", vec![]), num(1.0)]),
                    )),
                ),
            ),
        ],
    );
    let mut inst = run(&prog);
    assert_eq!(inst.call::<i32, i32>("returned", 0), 7);
    assert_eq!(inst.call::<i32, i32>("passed", 41), 42);
    assert_eq!(inst.stack_pointer(), STACK_TOP);
}

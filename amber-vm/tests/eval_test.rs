// amber-vm - Module evaluation tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use std::cell::RefCell;
use std::rc::Rc;

use amber_ast::{AstBuilder, BinaryOp, Program, Stmt, UpdateOp};
use amber_il::{HostFunctionId, Value};
use amber_vm::Vm;

fn build(f: impl FnOnce(&mut AstBuilder) -> Vec<Stmt>) -> Program {
    let mut builder = AstBuilder::new();
    let body = f(&mut builder);
    builder.program("test.js", body)
}

/// A VM with a capturing `print` host function, as the test harness of the
/// engine wires one up.
fn vm_with_print() -> (Vm, Rc<RefCell<Vec<String>>>) {
    let mut vm = Vm::new();
    let printed = Rc::new(RefCell::new(Vec::new()));
    let sink = printed.clone();
    vm.register_host_function(
        "print",
        HostFunctionId(1),
        Rc::new(move |vm, args| {
            let line = args
                .iter()
                .map(|a| vm.to_display_string(a))
                .collect::<Vec<_>>()
                .join(" ");
            sink.borrow_mut().push(line);
            Ok(Value::Undefined)
        }),
    );
    (vm, printed)
}

fn run(f: impl FnOnce(&mut AstBuilder) -> Vec<Stmt>) -> (Vm, Value, Vec<String>) {
    let program = build(f);
    let (mut vm, printed) = vm_with_print();
    let namespace = vm.evaluate_module(&program).expect("evaluate");
    let out = printed.borrow().clone();
    (vm, namespace, out)
}

#[test]
fn arithmetic_prints() {
    let (_, _, out) = run(|b| {
        let one = b.number(1.0);
        let two = b.number(2.0);
        let sum = b.binary(BinaryOp::Add, one, two);
        let call = b.call_name("print", vec![sum]);
        vec![b.expr_stmt(call)]
    });
    assert_eq!(out, vec!["3"]);
}

#[test]
fn integer_truncation_idiom_evaluates_to_three() {
    let (_, _, out) = run(|b| {
        let seven = b.number(7.0);
        let two = b.number(2.0);
        let div = b.binary(BinaryOp::Div, seven, two);
        let zero = b.number(0.0);
        let or = b.binary(BinaryOp::BitOr, div, zero);
        let call = b.call_name("print", vec![or]);
        vec![b.expr_stmt(call)]
    });
    assert_eq!(out, vec!["3"]);
}

#[test]
fn switch_with_default_prints_a_b_d() {
    // function p(n) { switch (n) { case 1: print("a"); break;
    //                              case 2: print("b"); break;
    //                              default: print("d"); } }
    // p(1); p(2); p("x");
    let (_, _, out) = run(|b| {
        let discriminant = b.id_expr("n");
        let one = b.number(1.0);
        let a = b.string("a");
        let pa = b.call_name("print", vec![a]);
        let pa_stmt = b.expr_stmt(pa);
        let brk1 = b.break_();
        let case1 = b.case(Some(one), vec![pa_stmt, brk1]);
        let two = b.number(2.0);
        let bee = b.string("b");
        let pb = b.call_name("print", vec![bee]);
        let pb_stmt = b.expr_stmt(pb);
        let brk2 = b.break_();
        let case2 = b.case(Some(two), vec![pb_stmt, brk2]);
        let dee = b.string("d");
        let pd = b.call_name("print", vec![dee]);
        let pd_stmt = b.expr_stmt(pd);
        let default = b.case(None, vec![pd_stmt]);
        let switch = b.switch(discriminant, vec![case1, case2, default]);
        let p = b.function_decl("p", &["n"], vec![switch]);

        let one_arg = b.number(1.0);
        let c1 = b.call_name("p", vec![one_arg]);
        let s1 = b.expr_stmt(c1);
        let two_arg = b.number(2.0);
        let c2 = b.call_name("p", vec![two_arg]);
        let s2 = b.expr_stmt(c2);
        let x_arg = b.string("x");
        let c3 = b.call_name("p", vec![x_arg]);
        let s3 = b.expr_stmt(c3);
        vec![p, s1, s2, s3]
    });
    assert_eq!(out, vec!["a", "b", "d"]);
}

#[test]
fn closure_counter_counts() {
    // function mk() { let x = 1; return () => ++x; }
    // vmExport(0, mk());
    let (mut vm, _, _) = run(|b| {
        let one = b.number(1.0);
        let decl = b.let_("x", Some(one));
        let x_ref = b.id_expr("x");
        let inc = b.update(UpdateOp::Increment, true, x_ref);
        let arrow = b.arrow(&[], inc);
        let ret = b.ret(Some(arrow));
        let mk = b.function_decl("mk", &[], vec![decl, ret]);
        let zero = b.number(0.0);
        let mk_call = b.call_name("mk", vec![]);
        let export = b.call_name("vmExport", vec![zero, mk_call]);
        let stmt = b.expr_stmt(export);
        vec![mk, stmt]
    });
    let counter = vm.resolve_export(0).expect("export 0");
    assert_eq!(vm.call(counter.clone(), &[]).expect("call"), Value::Number(2.0));
    assert_eq!(vm.call(counter, &[]).expect("call"), Value::Number(3.0));
}

#[test]
fn function_declarations_hoist() {
    // print(f()); function f() { return 1; }
    let (_, _, out) = run(|b| {
        let f_call = b.call_name("f", vec![]);
        let print_call = b.call_name("print", vec![f_call]);
        let stmt = b.expr_stmt(print_call);
        let one = b.number(1.0);
        let ret = b.ret(Some(one));
        let f = b.function_decl("f", &[], vec![ret]);
        vec![stmt, f]
    });
    assert_eq!(out, vec!["1"]);
}

#[test]
fn var_defaults_to_undefined_before_its_statement() {
    // print(v === undefined); var v = 3; print(v);
    let (_, _, out) = run(|b| {
        let v1 = b.id_expr("v");
        let undef = b.undefined();
        let eq = b.binary(BinaryOp::StrictEq, v1, undef);
        let p1 = b.call_name("print", vec![eq]);
        let s1 = b.expr_stmt(p1);
        let three = b.number(3.0);
        let decl = b.var("v", Some(three));
        let v2 = b.id_expr("v");
        let p2 = b.call_name("print", vec![v2]);
        let s2 = b.expr_stmt(p2);
        vec![s1, decl, s2]
    });
    assert_eq!(out, vec!["true", "3"]);
}

#[test]
fn objects_and_arrays() {
    // const a = [1, 2, 3]; a[1] = 5; print(a.length); print(a[1]);
    // const o = { x: 41, get: function() { return this.x + 1; } };
    // print(o.get());
    let (_, _, out) = run(|b| {
        let one = b.number(1.0);
        let two = b.number(2.0);
        let three = b.number(3.0);
        let arr = b.array(vec![one, two, three]);
        let a_decl = b.const_("a", arr);

        let a1 = b.id_expr("a");
        let idx = b.number(1.0);
        let target = b.member_computed(a1, idx);
        let five = b.number(5.0);
        let assign = b.assign(amber_ast::AssignOp::Assign, target, five);
        let assign_stmt = b.expr_stmt(assign);

        let a2 = b.id_expr("a");
        let len = b.member(a2, "length");
        let p1 = b.call_name("print", vec![len]);
        let s1 = b.expr_stmt(p1);
        let a3 = b.id_expr("a");
        let idx2 = b.number(1.0);
        let elem = b.member_computed(a3, idx2);
        let p2 = b.call_name("print", vec![elem]);
        let s2 = b.expr_stmt(p2);

        let forty_one = b.number(41.0);
        let this_expr = b.this();
        let x_prop = b.member(this_expr, "x");
        let one2 = b.number(1.0);
        let body = b.binary(BinaryOp::Add, x_prop, one2);
        let ret = b.ret(Some(body));
        let getter = b.function_expr(None, &[], vec![ret]);
        let obj = b.object(vec![("x", forty_one), ("get", getter)]);
        let o_decl = b.const_("o", obj);
        let o_ref = b.id_expr("o");
        let method = b.member(o_ref, "get");
        let call = b.call(method, vec![]);
        let p3 = b.call_name("print", vec![call]);
        let s3 = b.expr_stmt(p3);

        vec![a_decl, assign_stmt, s1, s2, o_decl, s3]
    });
    assert_eq!(out, vec!["3", "5", "42"]);
}

#[test]
fn template_literals_interpolate() {
    // const name = "world"; print(`hello ${name}!`);
    let (_, _, out) = run(|b| {
        let world = b.string("world");
        let decl = b.const_("name", world);
        let name_ref = b.id_expr("name");
        let template = b.template(vec!["hello ", "!"], vec![name_ref]);
        let call = b.call_name("print", vec![template]);
        let stmt = b.expr_stmt(call);
        vec![decl, stmt]
    });
    assert_eq!(out, vec!["hello world!"]);
}

#[test]
fn imports_resolve_through_registered_namespaces() {
    // import { a } from "m"; print(a);
    let program = build(|b| {
        let import = b.import(&["a"], "m");
        let a_ref = b.id_expr("a");
        let call = b.call_name("print", vec![a_ref]);
        let stmt = b.expr_stmt(call);
        vec![import, stmt]
    });
    let (mut vm, printed) = vm_with_print();
    let namespace = vm.new_object();
    vm.set_property(&namespace, "a", Value::Number(7.0))
        .expect("set");
    vm.register_module("m", namespace);
    vm.evaluate_module(&program).expect("evaluate");
    assert_eq!(*printed.borrow(), vec!["7"]);
}

#[test]
fn unresolved_imports_are_invalid_operations() {
    let program = build(|b| {
        let import = b.import(&["a"], "missing");
        vec![import]
    });
    let mut vm = Vm::new();
    match vm.evaluate_module(&program) {
        Err(amber_vm::RuntimeError::InvalidOperation(message)) => {
            assert!(message.contains("missing"));
        }
        other => panic!("expected invalid operation, got {:?}", other.err()),
    }
}

#[test]
fn exports_land_on_the_namespace_object() {
    // export const x = 5;
    let (vm, namespace, _) = run(|b| {
        let five = b.number(5.0);
        let decl = b.const_("x", five);
        let export = b.export(decl);
        vec![export]
    });
    let x = vm.get_property(&namespace, "x").expect("x");
    assert_eq!(x, Value::Number(5.0));
}

#[test]
fn garbage_collection_keeps_the_reachable_graph() {
    // vmExport(0, [1, 2]); plus an unreachable temporary object.
    let (mut vm, _, _) = run(|b| {
        let zero = b.number(0.0);
        let one = b.number(1.0);
        let two = b.number(2.0);
        let arr = b.array(vec![one, two]);
        let export = b.call_name("vmExport", vec![zero, arr]);
        let s1 = b.expr_stmt(export);
        let tmp = b.number(9.0);
        let garbage = b.object(vec![("t", tmp)]);
        let s2 = b.expr_stmt(garbage);
        vec![s1, s2]
    });
    let before = vm.heap_len();
    vm.garbage_collect();
    let after = vm.heap_len();
    assert!(after < before, "expected {} < {}", after, before);

    let exported = vm.resolve_export(0).expect("export");
    let length = vm.get_property(&exported, "length").expect("length");
    assert_eq!(length, Value::Number(2.0));
}

#[test]
fn call_depth_is_limited() {
    // function loop() { return loop(); } vmExport(0, loop);
    let (mut vm, _, _) = run(|b| {
        let call = b.call_name("looper", vec![]);
        let ret = b.ret(Some(call));
        let f = b.function_decl("looper", &[], vec![ret]);
        let zero = b.number(0.0);
        let f_ref = b.id_expr("looper");
        let export = b.call_name("vmExport", vec![zero, f_ref]);
        let stmt = b.expr_stmt(export);
        vec![f, stmt]
    });
    vm.set_max_call_depth(64);
    let looper = vm.resolve_export(0).expect("export");
    match vm.call(looper, &[]) {
        Err(amber_vm::RuntimeError::CallDepthExceeded) => {}
        other => panic!("expected depth error, got {:?}", other.err()),
    }
}

// amber-snapshot - Snapshot restore-and-continue tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use std::cell::RefCell;
use std::rc::Rc;

use amber_ast::{AstBuilder, Program, Stmt, UpdateOp};
use amber_il::{HostFunctionId, Value};
use amber_snapshot::{decode_snapshot, encode_snapshot};
use amber_vm::Vm;

fn build(f: impl FnOnce(&mut AstBuilder) -> Vec<Stmt>) -> Program {
    let mut builder = AstBuilder::new();
    let body = f(&mut builder);
    builder.program("test.js", body)
}

/// Evaluate a module, snapshot the VM, and restore a fresh VM from the
/// decoded image.
fn snapshot_and_restore(program: &Program) -> Vm {
    let mut vm = Vm::new();
    vm.evaluate_module(program).expect("evaluate");
    vm.garbage_collect();
    let info = vm.create_snapshot_info().expect("info");
    let bytes = encode_snapshot(&info).expect("encode");
    let (decoded, _) = decode_snapshot(&bytes).expect("decode");
    Vm::restore(decoded).expect("restore")
}

#[test]
fn trivial_export_returns_42_after_restore() {
    // vmExport(0, () => 42);
    let program = build(|b| {
        let zero = b.number(0.0);
        let forty_two = b.number(42.0);
        let arrow = b.arrow(&[], forty_two);
        let export = b.call_name("vmExport", vec![zero, arrow]);
        vec![b.expr_stmt(export)]
    });
    let mut restored = snapshot_and_restore(&program);
    let f = restored.resolve_export(0).expect("export 0");
    let result = restored.call(f, &[]).expect("call");
    assert_eq!(result, Value::Number(42.0));
}

#[test]
fn closure_counter_resumes_at_2_then_3() {
    // function mk() { let x = 1; return () => ++x; } vmExport(0, mk());
    let program = build(|b| {
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
    let mut restored = snapshot_and_restore(&program);
    let counter = restored.resolve_export(0).expect("export 0");
    assert_eq!(
        restored.call(counter.clone(), &[]).expect("first call"),
        Value::Number(2.0)
    );
    assert_eq!(
        restored.call(counter, &[]).expect("second call"),
        Value::Number(3.0)
    );
}

#[test]
fn exported_objects_survive_with_their_properties() {
    // vmExport(0, { label: "boot", limits: [10, 20] });
    let program = build(|b| {
        let zero = b.number(0.0);
        let label = b.string("boot");
        let ten = b.number(10.0);
        let twenty = b.number(20.0);
        let limits = b.array(vec![ten, twenty]);
        let obj = b.object(vec![("label", label), ("limits", limits)]);
        let export = b.call_name("vmExport", vec![zero, obj]);
        vec![b.expr_stmt(export)]
    });
    let restored = snapshot_and_restore(&program);
    let config = restored.resolve_export(0).expect("export 0");
    assert_eq!(
        restored.get_property(&config, "label").expect("label"),
        Value::string("boot")
    );
    let limits = restored.get_property(&config, "limits").expect("limits");
    assert_eq!(
        restored.get_property(&limits, "length").expect("length"),
        Value::Number(2.0)
    );
}

#[test]
fn exported_functions_keep_calling_host_functions() {
    // vmExport(0, () => print("hi"));
    let program = build(|b| {
        let zero = b.number(0.0);
        let hi = b.string("hi");
        let call = b.call_name("print", vec![hi]);
        let arrow = b.arrow(&[], call);
        let export = b.call_name("vmExport", vec![zero, arrow]);
        vec![b.expr_stmt(export)]
    });

    let mut vm = Vm::new();
    // A no-op print is enough during initialization; nothing calls it yet.
    vm.register_host_function(
        "print",
        HostFunctionId(1),
        Rc::new(|_, _| Ok(Value::Undefined)),
    );
    vm.evaluate_module(&program).expect("evaluate");
    let info = vm.create_snapshot_info().expect("info");
    let bytes = encode_snapshot(&info).expect("encode");
    let (decoded, _) = decode_snapshot(&bytes).expect("decode");

    // The restored VM re-registers its imports by id, as the device would.
    let mut restored = Vm::restore(decoded).expect("restore");
    let printed = Rc::new(RefCell::new(Vec::new()));
    let sink = printed.clone();
    restored.register_host_function_by_id(
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

    let f = restored.resolve_export(0).expect("export 0");
    restored.call(f, &[]).expect("call");
    assert_eq!(*printed.borrow(), vec!["hi"]);
}

#[test]
fn module_globals_remain_shared_between_exports() {
    // let n = 10;
    // vmExport(0, () => ++n);
    // vmExport(1, () => n);
    let program = build(|b| {
        let ten = b.number(10.0);
        let decl = b.let_("n", Some(ten));
        let zero = b.number(0.0);
        let n1 = b.id_expr("n");
        let inc = b.update(UpdateOp::Increment, true, n1);
        let bump = b.arrow(&[], inc);
        let e1 = b.call_name("vmExport", vec![zero, bump]);
        let s1 = b.expr_stmt(e1);
        let one = b.number(1.0);
        let n2 = b.id_expr("n");
        let read = b.arrow(&[], n2);
        let e2 = b.call_name("vmExport", vec![one, read]);
        let s2 = b.expr_stmt(e2);
        vec![decl, s1, s2]
    });
    let mut restored = snapshot_and_restore(&program);
    let bump = restored.resolve_export(0).expect("export 0");
    let read = restored.resolve_export(1).expect("export 1");
    assert_eq!(restored.call(bump, &[]).expect("bump"), Value::Number(11.0));
    assert_eq!(restored.call(read, &[]).expect("read"), Value::Number(11.0));
}

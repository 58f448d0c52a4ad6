// amber-compiler - Scope analysis tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use amber_ast::{AstBuilder, StmtKind, UpdateOp};
use amber_compiler::{BindingKind, CompileError, PrologueStep, Slot, analyse};

#[test]
fn captured_let_gets_a_closure_slot() {
    // function mk() { let x = 1; return () => ++x; }
    let mut b = AstBuilder::new();
    let one = b.number(1.0);
    let decl = b.let_("x", Some(one));
    let x_ref = b.id_expr("x");
    let inc = b.update(UpdateOp::Increment, true, x_ref);
    let arrow = b.arrow(&[], inc);
    let ret = b.ret(Some(arrow));
    let mk = b.function_decl("mk", &[], vec![decl, ret]);
    let mk_node = match &mk.kind {
        StmtKind::FunctionDeclaration(node) => node.id,
        _ => unreachable!(),
    };
    let program = b.program("mk.js", vec![mk]);

    let model = analyse(&program).expect("analysis");
    let mk_scope = model.function_scopes[&mk_node];
    let scope = model.scope(mk_scope);

    let x = model.binding(scope.bindings["x"]);
    assert!(x.is_accessed_by_nested_function);
    assert!(x.is_written_to);
    assert_eq!(*x.slot(), Slot::Closure { index: 0 });

    assert_eq!(scope.closure_slot_count, 1);
    assert!(matches!(
        scope.prologue.first(),
        Some(PrologueStep::ScopePush { slot_count: 1 })
    ));
    // mk itself captures nothing from outside, but the arrow must bind mk's
    // scope when instantiated.
    assert!(!scope.function_is_closure);
    let arrow_scope = model
        .function_scopes
        .values()
        .find(|s| **s != mk_scope)
        .copied()
        .expect("arrow scope");
    assert!(model.scope(arrow_scope).function_is_closure);
}

#[test]
fn parameter_slots_follow_write_and_capture_flags() {
    // function f(a, b, c) { b = 1; return () => c; }
    let mut builder = AstBuilder::new();
    let one = builder.number(1.0);
    let assign = builder.assign_name("b", one);
    let assign_stmt = builder.expr_stmt(assign);
    let c_ref = builder.id_expr("c");
    let arrow = builder.arrow(&[], c_ref);
    let ret = builder.ret(Some(arrow));
    let f = builder.function_decl("f", &["a", "b", "c"], vec![assign_stmt, ret]);
    let f_node = match &f.kind {
        StmtKind::FunctionDeclaration(node) => node.id,
        _ => unreachable!(),
    };
    let program = builder.program("params.js", vec![f]);

    let model = analyse(&program).expect("analysis");
    let scope = model.scope(model.function_scopes[&f_node]);

    // Untouched parameter: stays an immutable argument (1-based, 0 is this).
    let a = model.binding(scope.bindings["a"]);
    assert_eq!(*a.slot(), Slot::Argument { arg_index: 1 });
    // Written parameter: copied to a fresh local.
    let b = model.binding(scope.bindings["b"]);
    assert!(b.is_written_to);
    assert_eq!(*b.slot(), Slot::Local { index: 0 });
    // Captured parameter: copied to a closure slot.
    let c = model.binding(scope.bindings["c"]);
    assert!(c.is_accessed_by_nested_function);
    assert_eq!(*c.slot(), Slot::Closure { index: 0 });
}

#[test]
fn this_is_an_argument_slot_unless_an_arrow_captures_it() {
    // function g() { return this; }
    // function h() { return () => this; }
    let mut b = AstBuilder::new();
    let this1 = b.this();
    let ret1 = b.ret(Some(this1));
    let g = b.function_decl("g", &[], vec![ret1]);
    let g_node = match &g.kind {
        StmtKind::FunctionDeclaration(node) => node.id,
        _ => unreachable!(),
    };
    let this2 = b.this();
    let arrow = b.arrow(&[], this2);
    let ret2 = b.ret(Some(arrow));
    let h = b.function_decl("h", &[], vec![ret2]);
    let h_node = match &h.kind {
        StmtKind::FunctionDeclaration(node) => node.id,
        _ => unreachable!(),
    };
    let program = b.program("this.js", vec![g, h]);

    let model = analyse(&program).expect("analysis");
    let g_scope = model.scope(model.function_scopes[&g_node]);
    let g_this = model.binding(g_scope.this_binding.expect("this binding"));
    assert_eq!(*g_this.slot(), Slot::Argument { arg_index: 0 });

    let h_scope = model.scope(model.function_scopes[&h_node]);
    let h_this = model.binding(h_scope.this_binding.expect("this binding"));
    assert!(h_this.is_accessed_by_nested_function);
    assert!(matches!(h_this.slot(), Slot::Closure { .. }));
}

#[test]
fn module_level_slots() {
    // export const e = 1; let captured = 2; let plain = 3;
    // function user() { return captured; }
    let mut b = AstBuilder::new();
    let one = b.number(1.0);
    let e_decl = b.const_("e", one);
    let exported = b.export(e_decl);
    let two = b.number(2.0);
    let captured_decl = b.let_("captured", Some(two));
    let three = b.number(3.0);
    let plain_decl = b.let_("plain", Some(three));
    let captured_ref = b.id_expr("captured");
    let ret = b.ret(Some(captured_ref));
    let user = b.function_decl("user", &[], vec![ret]);
    let program = b.program("module.js", vec![exported, captured_decl, plain_decl, user]);

    let model = analyse(&program).expect("analysis");
    let module = model.scope(model.module_scope);

    let e = model.binding(module.bindings["e"]);
    assert!(e.is_exported);
    assert_eq!(
        *e.slot(),
        Slot::ModuleImportExport {
            namespace_slot: "thisModule".to_string(),
            property: "e".to_string(),
        }
    );

    let captured = model.binding(module.bindings["captured"]);
    assert_eq!(
        *captured.slot(),
        Slot::Global {
            name: "captured".to_string()
        }
    );
    assert!(model.module_variables.contains(&"captured".to_string()));

    // Not exported, not captured: plain entry-function local.
    let plain = model.binding(module.bindings["plain"]);
    assert!(matches!(plain.slot(), Slot::Local { .. }));
}

#[test]
fn global_names_disambiguate_against_reserved_ones() {
    // A module binding that collides with the thisModule slot gets a suffix.
    let mut b = AstBuilder::new();
    let zero = b.number(0.0);
    let decl = b.let_("thisModule", Some(zero));
    let use_ref = b.id_expr("thisModule");
    let ret = b.ret(Some(use_ref));
    let f = b.function_decl("f", &[], vec![ret]);
    let program = b.program("clash.js", vec![decl, f]);

    let model = analyse(&program).expect("analysis");
    let module = model.scope(model.module_scope);
    let binding = model.binding(module.bindings["thisModule"]);
    assert_eq!(
        *binding.slot(),
        Slot::Global {
            name: "thisModule_1".to_string()
        }
    );
}

#[test]
fn imports_bind_through_a_namespace_slot() {
    // import { a, b } from "./dep"; print(a);
    let mut builder = AstBuilder::new();
    let import = builder.import(&["a", "b"], "./dep");
    let a_ref = builder.id_expr("a");
    let call = builder.call_name("print", vec![a_ref]);
    let stmt = builder.expr_stmt(call);
    let program = builder.program("imports.js", vec![import, stmt]);

    let model = analyse(&program).expect("analysis");
    assert_eq!(model.module_imports.len(), 1);
    let (slot, specifier) = &model.module_imports[0];
    assert_eq!(specifier, "./dep");

    let module = model.scope(model.module_scope);
    let a = model.binding(module.bindings["a"]);
    assert_eq!(a.kind, BindingKind::Import);
    assert_eq!(
        *a.slot(),
        Slot::ModuleImportExport {
            namespace_slot: slot.clone(),
            property: "a".to_string(),
        }
    );
}

#[test]
fn function_declarations_initialize_in_the_prologue() {
    // print(f()); function f() { return 1; }  - the call site precedes the
    // declaration textually, so initialization must happen up front.
    let mut b = AstBuilder::new();
    let f_call = b.call_name("f", vec![]);
    let print_call = b.call_name("print", vec![f_call]);
    let stmt = b.expr_stmt(print_call);
    let one = b.number(1.0);
    let ret = b.ret(Some(one));
    let f = b.function_decl("f", &[], vec![ret]);
    let program = b.program("hoist.js", vec![stmt, f]);

    let model = analyse(&program).expect("analysis");
    let module = model.scope(model.module_scope);
    let var_create = module
        .prologue
        .iter()
        .position(|s| matches!(s, PrologueStep::InitVarDeclaration { .. }));
    let fn_init = module
        .prologue
        .iter()
        .position(|s| matches!(s, PrologueStep::InitFunctionDeclaration { .. }));
    let fn_init = fn_init.expect("function init step");
    // Slot creation precedes the store into it.
    assert!(var_create.expect("var slot step") < fn_init);
}

#[test]
fn duplicate_declarations_are_rejected() {
    let mut b = AstBuilder::new();
    let one = b.number(1.0);
    let first = b.let_("x", Some(one));
    let two = b.number(2.0);
    let second = b.let_("x", Some(two));
    let program = b.program("dup.js", vec![first, second]);
    match analyse(&program) {
        Err(CompileError::DuplicateBinding { name, .. }) => assert_eq!(name, "x"),
        other => panic!("expected duplicate binding error, got {:?}", other.err()),
    }
}

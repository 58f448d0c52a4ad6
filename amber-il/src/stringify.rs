// amber-il - Value model and stack-machine intermediate language for Amber
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Human-readable IL listing, for debugging and compiler tests.

use std::fmt::Write;

use crate::opcode::Operand;
use crate::unit::{Function, Unit};

/// Render a unit as a stable text listing.
pub fn stringify_unit(unit: &Unit) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "unit {:?};", unit.source_filename);
    if !unit.module_imports.is_empty() {
        for import in &unit.module_imports {
            let _ = writeln!(out, "import {} from {:?};", import.slot, import.specifier);
        }
    }
    if !unit.free_variables.is_empty() {
        let _ = writeln!(out, "free {};", unit.free_variables.join(", "));
    }
    if !unit.module_variables.is_empty() {
        let _ = writeln!(out, "globals {};", unit.module_variables.join(", "));
    }
    for function in unit.functions.values() {
        let _ = writeln!(out);
        stringify_function(&mut out, function);
    }
    out
}

fn stringify_function(out: &mut String, function: &Function) {
    let name = function.name.as_deref().unwrap_or("<anonymous>");
    let _ = writeln!(
        out,
        "function {} [{}] maxStack={} entry={}",
        name, function.id, function.max_stack_depth, function.entry_block_id
    );
    for block in function.blocks.values() {
        let _ = writeln!(
            out,
            "  {}: // depth {}",
            block.id, block.expected_stack_depth_at_entry
        );
        for op in &block.operations {
            let operands: Vec<String> = op.operands.iter().map(stringify_operand).collect();
            let _ = writeln!(out, "    {}({})", op.opcode, operands.join(", "));
        }
    }
}

fn stringify_operand(operand: &Operand) -> String {
    match operand {
        Operand::Label(id) => id.to_string(),
        Operand::Count(n) => n.to_string(),
        Operand::Index(i) => i.to_string(),
        Operand::Name(name) => format!("'{}'", name),
        Operand::Literal(value) => format!("lit {}", value),
        Operand::Bin(op) => format!("{:?}", op),
        Operand::Un(op) => format!("{:?}", op),
    }
}

// amber-il - Opcode metadata and value semantics tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use amber_il::{BinOp, BlockId, Opcode, Operand, Value};

const ALL_OPCODES: [Opcode; 23] = [
    Opcode::ArrayNew,
    Opcode::BinOp,
    Opcode::Branch,
    Opcode::Call,
    Opcode::ClosureNew,
    Opcode::Dup,
    Opcode::Jump,
    Opcode::Literal,
    Opcode::LoadArg,
    Opcode::LoadGlobal,
    Opcode::LoadScoped,
    Opcode::LoadVar,
    Opcode::Nop,
    Opcode::ObjectGet,
    Opcode::ObjectNew,
    Opcode::ObjectSet,
    Opcode::Pop,
    Opcode::Return,
    Opcode::ScopePush,
    Opcode::StoreGlobal,
    Opcode::StoreScoped,
    Opcode::StoreVar,
    Opcode::UnOp,
];

/// Build a well-shaped operand list for an opcode, straight from its schema.
fn operands_for(opcode: Opcode) -> Vec<Operand> {
    use amber_il::OperandSchema;
    opcode
        .meta()
        .operands
        .iter()
        .map(|schema| match schema {
            OperandSchema::Label => Operand::Label(BlockId(1)),
            OperandSchema::Count => Operand::Count(2),
            OperandSchema::Index => Operand::Index(0),
            OperandSchema::NameOrIndex => Operand::Name("g".to_string()),
            OperandSchema::Literal => Operand::Literal(Value::Number(1.0)),
            OperandSchema::Bin => Operand::Bin(BinOp::Add),
            OperandSchema::Un => Operand::Un(amber_il::UnOp::Neg),
        })
        .collect()
}

#[test]
fn verify_accepts_schema_shaped_operands() {
    for opcode in ALL_OPCODES {
        let operands = operands_for(opcode);
        assert!(
            opcode.verify(&operands).is_ok(),
            "{} rejected its own schema",
            opcode
        );
    }
}

#[test]
fn verify_rejects_wrong_arity_and_kind() {
    // Too many operands.
    assert!(Opcode::Dup.verify(&[Operand::Count(1)]).is_err());
    // Too few.
    assert!(Opcode::Branch.verify(&[Operand::Label(BlockId(0))]).is_err());
    // Wrong kind in position.
    assert!(
        Opcode::LoadVar
            .verify(&[Operand::Name("x".to_string())])
            .is_err()
    );
    // Global slots accept both names and indexes.
    assert!(Opcode::LoadGlobal.verify(&[Operand::Index(3)]).is_ok());
    assert!(
        Opcode::LoadGlobal
            .verify(&[Operand::Name("x".to_string())])
            .is_ok()
    );
}

#[test]
fn stack_deltas_match_the_documented_table() {
    assert_eq!(Opcode::Literal.stack_delta(&operands_for(Opcode::Literal)), 1);
    assert_eq!(Opcode::StoreVar.stack_delta(&operands_for(Opcode::StoreVar)), 0);
    assert_eq!(Opcode::ObjectSet.stack_delta(&[]), -3);
    assert_eq!(Opcode::ObjectGet.stack_delta(&[]), -1);
    assert_eq!(Opcode::Pop.stack_delta(&[Operand::Count(3)]), -3);
    // Call pops the callee plus `count` values and pushes the result.
    assert_eq!(Opcode::Call.stack_delta(&[Operand::Count(3)]), -3);
    // ClosureNew consumes the captures and pushes one closure.
    assert_eq!(Opcode::ClosureNew.stack_delta(&[Operand::Count(1)]), 0);
    assert_eq!(Opcode::ClosureNew.stack_delta(&[Operand::Count(3)]), -2);
    assert_eq!(Opcode::Branch.stack_delta(&operands_for(Opcode::Branch)), -1);
}

#[test]
fn exactly_the_three_terminators_terminate() {
    for opcode in ALL_OPCODES {
        let expected = matches!(opcode, Opcode::Branch | Opcode::Jump | Opcode::Return);
        assert_eq!(opcode.is_terminator(), expected, "{}", opcode);
    }
}

#[test]
fn value_equality_is_bit_pattern_equality() {
    // Literal interning treats NaN as equal to itself and the zeroes as
    // distinct - the opposite of runtime semantics, and exactly what the
    // encoder needs.
    assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
    assert_ne!(Value::Number(0.0), Value::Number(-0.0));
    assert_eq!(Value::Number(3.0), Value::Number(3.0));
    assert_ne!(Value::Undefined, Value::Null);
    assert_eq!(Value::string("a"), Value::string("a"));
}

#[test]
fn inline_int_range_is_14_bits() {
    assert_eq!(Value::Number(0.0).as_inline_int(), Some(0));
    assert_eq!(Value::Number(8191.0).as_inline_int(), Some(8191));
    assert_eq!(Value::Number(-8192.0).as_inline_int(), Some(-8192));
    assert_eq!(Value::Number(8192.0).as_inline_int(), None);
    assert_eq!(Value::Number(-8193.0).as_inline_int(), None);
    assert_eq!(Value::Number(1.5).as_inline_int(), None);
    // Negative zero has its own well-known encoding.
    assert_eq!(Value::Number(-0.0).as_inline_int(), None);
    assert_eq!(Value::Number(f64::NAN).as_inline_int(), None);
}

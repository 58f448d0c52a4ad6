// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Value semantics: coercions, truthiness, and the binary/unary operators.
//!
//! Numbers are `f64` with the usual 32-bit wrapping for bitwise operators.
//! Only the strict equality forms exist; the compiler rejects the loose ones.

use amber_il::{BinOp, UnOp, Value};

use crate::error::{Result, RuntimeError};

/// Falsy: undefined, null, false, 0, -0, NaN, "".
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Null => false,
        Value::Boolean(b) => *b,
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// ToNumber, restricted to the subset's coercions.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Undefined => f64::NAN,
        Value::Null => 0.0,
        Value::Boolean(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => *n,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        _ => f64::NAN,
    }
}

/// ToInt32: modular 32-bit wrap with NaN and infinities going to zero.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let m = n.trunc() % 4_294_967_296.0;
    let m = if m < 0.0 { m + 4_294_967_296.0 } else { m };
    m as u32 as i32
}

/// ToUint32, same wrap as [`to_int32`].
pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

/// Strict equality. Unlike the IL's literal interning, this is runtime
/// semantics: `NaN !== NaN` and `+0 === -0`.
pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Reference(x), Value::Reference(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::HostFunction(x), Value::HostFunction(y)) => x == y,
        (Value::Ephemeral(x), Value::Ephemeral(y)) => x == y,
        _ => false,
    }
}

/// ToString for concatenation and printing of immediates.
pub fn to_string_value(value: &Value) -> String {
    match value {
        Value::Reference(_) => "[object Object]".to_string(),
        other => other.to_string(),
    }
}

/// Apply a binary operator to two popped operands.
pub fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
    let value = match op {
        BinOp::Add => {
            if matches!(a, Value::String(_)) || matches!(b, Value::String(_)) {
                Value::string(format!("{}{}", to_string_value(a), to_string_value(b)))
            } else {
                Value::Number(to_number(a) + to_number(b))
            }
        }
        BinOp::Sub => Value::Number(to_number(a) - to_number(b)),
        BinOp::Mul => Value::Number(to_number(a) * to_number(b)),
        BinOp::Div => Value::Number(to_number(a) / to_number(b)),
        BinOp::DivTrunc => {
            let quotient = to_number(a) / to_number(b);
            Value::Number(to_int32(quotient.trunc()) as f64)
        }
        BinOp::Rem => Value::Number(to_number(a) % to_number(b)),
        BinOp::Eq => Value::Boolean(strict_equals(a, b)),
        BinOp::Neq => Value::Boolean(!strict_equals(a, b)),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => compare(op, a, b),
        BinOp::BitAnd => Value::Number((to_int32(to_number(a)) & to_int32(to_number(b))) as f64),
        BinOp::BitOr => Value::Number((to_int32(to_number(a)) | to_int32(to_number(b))) as f64),
        BinOp::BitXor => Value::Number((to_int32(to_number(a)) ^ to_int32(to_number(b))) as f64),
        BinOp::Shl => {
            let shift = to_uint32(to_number(b)) & 31;
            Value::Number(((to_int32(to_number(a))) << shift) as f64)
        }
        BinOp::Shr => {
            let shift = to_uint32(to_number(b)) & 31;
            Value::Number((to_int32(to_number(a)) >> shift) as f64)
        }
        BinOp::UShr => {
            let shift = to_uint32(to_number(b)) & 31;
            Value::Number((to_uint32(to_number(a)) >> shift) as f64)
        }
    };
    Ok(value)
}

fn compare(op: BinOp, a: &Value, b: &Value) -> Value {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        let result = match op {
            BinOp::Lt => x < y,
            BinOp::Gt => x > y,
            BinOp::Le => x <= y,
            BinOp::Ge => x >= y,
            _ => unreachable!(),
        };
        return Value::Boolean(result);
    }
    let (x, y) = (to_number(a), to_number(b));
    let result = match op {
        BinOp::Lt => x < y,
        BinOp::Gt => x > y,
        BinOp::Le => x <= y,
        BinOp::Ge => x >= y,
        _ => unreachable!(),
    };
    Value::Boolean(result)
}

/// Apply a unary operator to one popped operand.
pub fn unary(op: UnOp, a: &Value) -> Result<Value> {
    let value = match op {
        UnOp::Neg => Value::Number(-to_number(a)),
        UnOp::Plus => Value::Number(to_number(a)),
        UnOp::Not => Value::Boolean(!is_truthy(a)),
        UnOp::BitNot => Value::Number(!to_int32(to_number(a)) as f64),
    };
    Ok(value)
}

/// Canonical property key for an object access.
pub fn property_key(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.to_string()),
        Value::Number(n) => Ok(to_string_value(&Value::Number(*n))),
        Value::Boolean(b) => Ok(b.to_string()),
        other => Err(RuntimeError::type_error(
            "string or number key",
            other.type_name(),
        )),
    }
}

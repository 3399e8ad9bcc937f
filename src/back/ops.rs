//! Operator and conversion semantics shared by `OPER`, `UNARY`, `EQUAL`,
//! `CASTNUM`, `CASTTYPE` and `MAKE`.

use std::cmp::Ordering;

use crate::front::ast::UnaryOp;
use crate::middle::code::BinOp;

use super::value::{Chan, Type, Value};
use super::vm::VmError;

fn unsupported(op: &str, l: &Value, r: &Value) -> VmError {
    VmError::UnsupportedOperand {
        op: op.to_string(),
        lhs: l.type_of().to_string(),
        rhs: r.type_of().to_string(),
    }
}

/// Applies a strict binary operator; both operands are already evaluated.
pub fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, VmError> {
    use BinOp::*;
    match op {
        Add => match (l, r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            (Value::Str(a), Value::Str(b)) => {
                Ok(Value::str(format!("{a}{b}")))
            }
            (Value::Slice(a), Value::Slice(b)) => {
                let mut out = a.read().clone();
                if std::sync::Arc::ptr_eq(a, b) {
                    out.extend_from_within(..);
                } else {
                    out.extend(b.read().iter().cloned());
                }
                Ok(Value::slice(out))
            }
            _ => numeric(op, l, r),
        },
        Sub | Mul => numeric(op, l, r),
        Div => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(VmError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a / b)),
            _ => numeric(op, l, r),
        },
        Mod => match (l, r) {
            (Value::Int(_), Value::Int(0)) => Err(VmError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a % b)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a % b)),
            _ => Err(unsupported("%", l, r)),
        },
        Eq => Ok(Value::Bool(l.equal(r))),
        Ne => Ok(Value::Bool(!l.equal(r))),
        Lt | Le | Gt | Ge => {
            let ord = compare(l, r).ok_or_else(|| unsupported(&op.to_string(), l, r))?;
            Ok(Value::Bool(match op {
                Lt => ord == Ordering::Less,
                Le => ord != Ordering::Greater,
                Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BitAnd | BitOr | BitXor | Shl | Shr => match (l, r) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
                BitAnd => a & b,
                BitOr => a | b,
                BitXor => a ^ b,
                Shl => a.wrapping_shl(*b as u32),
                _ => a.wrapping_shr(*b as u32),
            })),
            (Value::Bool(a), Value::Bool(b)) => match op {
                BitAnd => Ok(Value::Bool(*a && *b)),
                BitOr => Ok(Value::Bool(*a || *b)),
                BitXor => Ok(Value::Bool(a != b)),
                _ => Err(unsupported(&op.to_string(), l, r)),
            },
            _ => Err(unsupported(&op.to_string(), l, r)),
        },
    }
}

/// Int-preserving arithmetic with promotion to float on mixed operands.
fn numeric(op: BinOp, l: &Value, r: &Value) -> Result<Value, VmError> {
    use BinOp::*;
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
            Add => a.wrapping_add(*b),
            Sub => a.wrapping_sub(*b),
            Mul => a.wrapping_mul(*b),
            _ => unreachable!("int division handled by the caller"),
        })),
        (Value::Int(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::Float(_), Value::Float(_)) => {
            let (a, b) = (as_float(l), as_float(r));
            Ok(Value::Float(match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => a / b,
                _ => return Err(unsupported(&op.to_string(), l, r)),
            }))
        }
        _ => Err(unsupported(&op.to_string(), l, r)),
    }
}

fn as_float(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

/// Ordering for the relational operators.
pub fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Int(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::Float(_), Value::Float(_)) => as_float(l).partial_cmp(&as_float(r)),
        _ => None,
    }
}

/// Applies a unary operator in place.
pub fn unary(op: UnaryOp, v: &Value) -> Result<Value, VmError> {
    match (op, v) {
        (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::BitNot, Value::Int(i)) => Ok(Value::Int(!i)),
        _ => Err(VmError::UnsupportedOperand {
            op: op.to_string(),
            lhs: v.type_of().to_string(),
            rhs: String::new(),
        }),
    }
}

/// `CASTNUM`: textual numeric literals become numbers the way the host
/// parses them; numbers pass through.
pub fn cast_num(v: &Value) -> Result<Value, VmError> {
    match v {
        Value::Int(_) | Value::Float(_) => Ok(v.clone()),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Str(s) => {
            let t = s.trim();
            if let Ok(i) = t.parse::<i64>() {
                return Ok(Value::Int(i));
            }
            if let Ok(f) = t.parse::<f64>() {
                return Ok(Value::Float(f));
            }
            Err(conversion(v, "число"))
        }
        _ => Err(conversion(v, "число")),
    }
}

fn conversion(v: &Value, to: &str) -> VmError {
    VmError::Conversion { from: v.type_of().to_string(), to: to.to_string() }
}

/// `CASTTYPE`: converts a value to a registered type.
pub fn cast_type(v: &Value, t: Type) -> Result<Value, VmError> {
    match t {
        Type::Int => match v {
            Value::Int(_) => Ok(v.clone()),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Str(_) => match cast_num(v)? {
                Value::Float(f) => Ok(Value::Int(f as i64)),
                n => Ok(n),
            },
            _ => Err(conversion(v, "int64")),
        },
        Type::Float => match v {
            Value::Float(_) => Ok(v.clone()),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
            Value::Str(_) => match cast_num(v)? {
                Value::Int(i) => Ok(Value::Float(i as f64)),
                n => Ok(n),
            },
            _ => Err(conversion(v, "float64")),
        },
        Type::Bool => Ok(Value::Bool(v.truthy())),
        Type::Str => Ok(Value::str(v.to_string())),
        Type::Slice => match v {
            Value::Slice(_) => Ok(v.clone()),
            _ => Err(conversion(v, "массив")),
        },
        Type::Map => match v {
            Value::Map(_) => Ok(v.clone()),
            _ => Err(conversion(v, "соответствие")),
        },
        Type::Chan => match v {
            Value::Chan(_) => Ok(v.clone()),
            _ => Err(conversion(v, "канал")),
        },
        Type::Func => match v {
            Value::Func(_) | Value::Native(_) => Ok(v.clone()),
            _ => Err(conversion(v, "функция")),
        },
    }
}

/// `MAKE`: the zero value of a type.
pub fn make_zero(t: Type) -> Result<Value, VmError> {
    Ok(match t {
        Type::Int => Value::Int(0),
        Type::Float => Value::Float(0.0),
        Type::Bool => Value::Bool(false),
        Type::Str => Value::str(""),
        Type::Slice => Value::slice(Vec::new()),
        Type::Map => Value::map(Default::default()),
        Type::Chan => Value::Chan(Chan::new(0)),
        Type::Func => {
            return Err(VmError::Conversion {
                from: "функция".to_string(),
                to: "значение по умолчанию".to_string(),
            })
        }
    })
}

/// Integer view of a value, for counters, capacities and indexes.
pub fn to_int(v: &Value) -> Result<i64, VmError> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Float(f) => Ok(*f as i64),
        Value::Bool(b) => Ok(*b as i64),
        _ => Err(conversion(v, "int64")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_arithmetic_stays_int() {
        let v = binary(BinOp::Add, &Value::Int(1), &Value::Int(2)).unwrap();
        assert_eq!(v, Value::Int(3));
        let v = binary(BinOp::Div, &Value::Int(7), &Value::Int(2)).unwrap();
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn mixed_arithmetic_promotes() {
        let v = binary(BinOp::Mul, &Value::Int(2), &Value::Float(1.5)).unwrap();
        assert_eq!(v, Value::Float(3.0));
    }

    #[test]
    fn division_by_zero_is_a_trap() {
        assert!(matches!(
            binary(BinOp::Div, &Value::Int(1), &Value::Int(0)),
            Err(VmError::DivisionByZero)
        ));
    }

    #[test]
    fn string_concat_and_compare() {
        let v = binary(BinOp::Add, &Value::str("аб"), &Value::str("вг")).unwrap();
        assert_eq!(v, Value::str("абвг"));
        let v = binary(BinOp::Lt, &Value::str("а"), &Value::str("б")).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn cast_num_matches_host_parsing() {
        for lit in ["0", "42", "-7", "9223372036854775807"] {
            let v = cast_num(&Value::str(lit)).unwrap();
            assert_eq!(v, Value::Int(lit.parse::<i64>().unwrap()));
        }
        for lit in ["3.5", "-0.25", "1e3"] {
            let v = cast_num(&Value::str(lit)).unwrap();
            assert_eq!(v, Value::Float(lit.parse::<f64>().unwrap()));
        }
        assert!(cast_num(&Value::str("не число")).is_err());
    }

    #[test]
    fn casts_between_base_types() {
        assert_eq!(cast_type(&Value::str("5"), Type::Int).unwrap(), Value::Int(5));
        assert_eq!(cast_type(&Value::Int(1), Type::Bool).unwrap(), Value::Bool(true));
        assert_eq!(cast_type(&Value::Int(9), Type::Str).unwrap(), Value::str("9"));
        assert!(cast_type(&Value::Int(1), Type::Chan).is_err());
    }

    #[test]
    fn zero_values() {
        assert_eq!(make_zero(Type::Int).unwrap(), Value::Int(0));
        assert_eq!(make_zero(Type::Str).unwrap(), Value::str(""));
        assert!(matches!(make_zero(Type::Chan).unwrap(), Value::Chan(_)));
    }
}

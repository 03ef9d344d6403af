// This module invokes entry points of a loaded image. Arguments arrive as native Values
// (integers, pointers, doubles) and are split into the integer and floating register classes
// the System V x86-64 convention assigns independently, so any mix of up to six integer and
// eight floating arguments can be passed through one fixed call shape that fills every
// argument register. When the compile backend recorded a signature, argument count and
// class are checked against it and the raw return register is narrowed to the declared
// return kind. The call runs native code with the full privileges of the host; a fault
// inside it is not contained.

//! Entry point invocation.

use std::fmt;

use super::error::ExecuteError;
use super::linker::{LoadedImage, LoadedSymbol};
use super::object::ValueKind;
use super::registry::SymbolKind;

/// Integer/pointer argument registers available to an entry call.
pub const MAX_INT_ARGS: usize = 6;

/// Floating-point argument registers available to an entry call.
pub const MAX_FLOAT_ARGS: usize = 8;

/// A native value passed to or returned from compiled code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Ptr(usize),
    Float(f64),
    Void,
}

impl Value {
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(v),
            Value::Ptr(p) => Some(p as i64),
            _ => None,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ptr(self) -> Option<usize> {
        match self {
            Value::Ptr(p) => Some(p),
            Value::Int(v) => Some(v as usize),
            _ => None,
        }
    }

    pub fn is_void(self) -> bool {
        matches!(self, Value::Void)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Ptr(p) => write!(f, "{p:#x}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Void => f.write_str("void"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T> From<*const T> for Value {
    fn from(p: *const T) -> Self {
        Value::Ptr(p as usize)
    }
}

impl<T> From<*mut T> for Value {
    fn from(p: *mut T) -> Self {
        Value::Ptr(p as usize)
    }
}

/// Register contents for one call.
#[derive(Debug, Default)]
struct ArgFrame {
    ints: [i64; MAX_INT_ARGS],
    floats: [f64; MAX_FLOAT_ARGS],
    int_count: usize,
    float_count: usize,
}

impl ArgFrame {
    fn marshal(entry: &LoadedSymbol, args: &[Value]) -> Result<Self, ExecuteError> {
        let mismatch = |reason: String| ExecuteError::TypeMismatch {
            name: entry.name.clone(),
            reason,
        };

        if let Some(signature) = &entry.signature {
            let expected = signature.params.len();
            let count_ok = if signature.variadic {
                args.len() >= expected
            } else {
                args.len() == expected
            };
            if !count_ok {
                return Err(mismatch(format!(
                    "expects {}{} argument(s), got {}",
                    if signature.variadic { "at least " } else { "" },
                    expected,
                    args.len()
                )));
            }
            for (index, (param, arg)) in signature.params.iter().zip(args).enumerate() {
                let compatible = match arg {
                    Value::Float(_) => param.is_float(),
                    Value::Int(_) | Value::Ptr(_) => !param.is_float(),
                    Value::Void => false,
                };
                if !compatible {
                    return Err(mismatch(format!(
                        "argument {} is {:?} but the parameter is {}",
                        index + 1,
                        arg,
                        param
                    )));
                }
            }
        }

        let mut frame = ArgFrame::default();
        for (index, arg) in args.iter().enumerate() {
            match *arg {
                Value::Float(v) => {
                    if frame.float_count == MAX_FLOAT_ARGS {
                        return Err(mismatch(format!(
                            "more than {MAX_FLOAT_ARGS} floating-point arguments"
                        )));
                    }
                    frame.floats[frame.float_count] = v;
                    frame.float_count += 1;
                }
                Value::Int(_) | Value::Ptr(_) => {
                    if frame.int_count == MAX_INT_ARGS {
                        return Err(mismatch(format!(
                            "more than {MAX_INT_ARGS} integer or pointer arguments"
                        )));
                    }
                    frame.ints[frame.int_count] = arg.as_i64().unwrap_or_default();
                    frame.int_count += 1;
                }
                Value::Void => {
                    return Err(mismatch(format!("argument {} is void", index + 1)));
                }
            }
        }
        Ok(frame)
    }
}

/// Call `entry` in `image` with `args`.
pub(crate) fn execute(image: &LoadedImage, entry: &str, args: &[Value]) -> Result<Value, ExecuteError> {
    let symbol = image
        .symbol(entry)
        .filter(|s| s.kind == SymbolKind::Function)
        .ok_or_else(|| ExecuteError::EntryNotFound {
            name: entry.to_string(),
        })?;

    let executable = image
        .region_containing(symbol.address)
        .map_or(false, |r| r.permission().is_executable());
    if !executable {
        return Err(ExecuteError::RuntimeFault {
            name: entry.to_string(),
            reason: format!("entry address {:#x} is not in executable memory", symbol.address),
        });
    }

    let frame = ArgFrame::marshal(symbol, args)?;
    let ret = symbol.signature.as_ref().map(|s| s.ret);
    log::trace!(
        "calling {} at {:#x} with {} int / {} float args",
        entry,
        symbol.address,
        frame.int_count,
        frame.float_count
    );

    // SAFETY: the address is the start of a sealed executable function produced by the
    // linker; argument registers follow the System V convention the backend targets.
    unsafe { invoke(symbol.address, &frame, ret) }
}

#[cfg(all(target_arch = "x86_64", not(windows)))]
unsafe fn invoke(
    address: usize,
    frame: &ArgFrame,
    ret: Option<Option<ValueKind>>,
) -> Result<Value, ExecuteError> {
    type IntEntry = unsafe extern "C" fn(
        i64, i64, i64, i64, i64, i64,
        f64, f64, f64, f64, f64, f64, f64, f64,
    ) -> i64;
    type FloatEntry = unsafe extern "C" fn(
        i64, i64, i64, i64, i64, i64,
        f64, f64, f64, f64, f64, f64, f64, f64,
    ) -> f64;

    let i = &frame.ints;
    let f = &frame.floats;

    if ret == Some(Some(ValueKind::F64)) {
        let entry = std::mem::transmute::<usize, FloatEntry>(address);
        let value = entry(
            i[0], i[1], i[2], i[3], i[4], i[5],
            f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7],
        );
        return Ok(Value::Float(value));
    }

    let entry = std::mem::transmute::<usize, IntEntry>(address);
    let raw = entry(
        i[0], i[1], i[2], i[3], i[4], i[5],
        f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7],
    );
    Ok(narrow_return(raw, ret))
}

#[cfg(not(all(target_arch = "x86_64", not(windows))))]
unsafe fn invoke(
    _address: usize,
    _frame: &ArgFrame,
    _ret: Option<Option<ValueKind>>,
) -> Result<Value, ExecuteError> {
    Err(ExecuteError::UnsupportedHost)
}

/// Narrow the raw `rax` contents to the declared return kind.
///
/// `None` means no signature is known and the full register is returned.
fn narrow_return(raw: i64, ret: Option<Option<ValueKind>>) -> Value {
    match ret {
        None => Value::Int(raw),
        Some(None) => Value::Void,
        Some(Some(kind)) => match kind {
            ValueKind::I8 => Value::Int(raw as i8 as i64),
            ValueKind::I16 => Value::Int(raw as i16 as i64),
            ValueKind::I32 => Value::Int(raw as i32 as i64),
            ValueKind::I64 => Value::Int(raw),
            ValueKind::U8 => Value::Int(raw as u8 as i64),
            ValueKind::U16 => Value::Int(raw as u16 as i64),
            ValueKind::U32 => Value::Int(raw as u32 as i64),
            ValueKind::U64 => Value::Int(raw),
            ValueKind::Ptr => Value::Ptr(raw as usize),
            ValueKind::F64 => Value::Float(f64::from_bits(raw as u64)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::Signature;

    fn entry(signature: Option<Signature>) -> LoadedSymbol {
        LoadedSymbol {
            name: "f".into(),
            kind: SymbolKind::Function,
            address: 0,
            size: 1,
            signature,
        }
    }

    #[test]
    fn test_marshal_splits_register_classes() {
        let frame = ArgFrame::marshal(
            &entry(None),
            &[Value::Int(1), Value::Float(2.5), Value::Ptr(3), Value::Float(4.0)],
        )
        .unwrap();
        assert_eq!(frame.int_count, 2);
        assert_eq!(frame.float_count, 2);
        assert_eq!(&frame.ints[..2], &[1, 3]);
        assert_eq!(&frame.floats[..2], &[2.5, 4.0]);
    }

    #[test]
    fn test_marshal_rejects_too_many_ints() {
        let args = vec![Value::Int(0); MAX_INT_ARGS + 1];
        let err = ArgFrame::marshal(&entry(None), &args).unwrap_err();
        assert!(matches!(err, ExecuteError::TypeMismatch { .. }));
    }

    #[test]
    fn test_marshal_checks_signature() {
        let signature = Signature {
            params: vec![ValueKind::I32, ValueKind::F64],
            ret: Some(ValueKind::I32),
            variadic: false,
        };
        let symbol = entry(Some(signature));

        assert!(ArgFrame::marshal(&symbol, &[Value::Int(1), Value::Float(1.0)]).is_ok());
        assert!(ArgFrame::marshal(&symbol, &[Value::Int(1)]).is_err());
        assert!(ArgFrame::marshal(&symbol, &[Value::Float(1.0), Value::Int(1)]).is_err());
    }

    #[test]
    fn test_marshal_variadic_accepts_extra() {
        let signature = Signature {
            params: vec![ValueKind::Ptr],
            ret: None,
            variadic: true,
        };
        let symbol = entry(Some(signature));
        assert!(ArgFrame::marshal(&symbol, &[Value::Ptr(1), Value::Int(2)]).is_ok());
        assert!(ArgFrame::marshal(&symbol, &[]).is_err());
    }

    #[test]
    fn test_void_argument_rejected() {
        assert!(ArgFrame::marshal(&entry(None), &[Value::Void]).is_err());
    }

    #[test]
    fn test_narrow_return() {
        let raw = 0x1_0000_00FF_i64;
        assert_eq!(narrow_return(raw, None), Value::Int(raw));
        assert_eq!(narrow_return(raw, Some(None)), Value::Void);
        assert_eq!(narrow_return(raw, Some(Some(ValueKind::I8))), Value::Int(-1));
        assert_eq!(narrow_return(raw, Some(Some(ValueKind::U8))), Value::Int(255));
        assert_eq!(narrow_return(-1, Some(Some(ValueKind::U32))), Value::Int(0xFFFF_FFFF));
        assert_eq!(narrow_return(raw, Some(Some(ValueKind::I32))), Value::Int(0xFF));
    }
}

// C types for the front end. Types are small Copy values whose composite parts (pointee,
// element, function signature) live in the compilation arena, so the parser can build and
// compare them freely while the AST borrows from the same arena. Sizes and alignments follow
// the LP64 data model used by x86-64 System V. The conversion helpers implement integer
// promotion and the usual arithmetic conversions, and `value_kind` maps a type onto the
// machine-level ValueKind recorded in exported signatures.

//! C type representation.

use std::fmt;

use bumpalo::Bump;

use crate::core::object::ValueKind;

/// Largest object the compiler lays out; sizes past this cannot be
/// addressed with a 32-bit displacement.
pub const MAX_OBJECT_SIZE: usize = i32::MAX as usize;

/// An integer type: byte size and signedness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntType {
    pub size: u8,
    pub signed: bool,
}

impl IntType {
    pub const CHAR: IntType = IntType::new(1, true);
    pub const UCHAR: IntType = IntType::new(1, false);
    pub const SHORT: IntType = IntType::new(2, true);
    pub const USHORT: IntType = IntType::new(2, false);
    pub const INT: IntType = IntType::new(4, true);
    pub const UINT: IntType = IntType::new(4, false);
    pub const LONG: IntType = IntType::new(8, true);
    pub const ULONG: IntType = IntType::new(8, false);

    pub const fn new(size: u8, signed: bool) -> Self {
        Self { size, signed }
    }

    /// Wrap `value` to this type's range, sign- or zero-extended to 64 bits.
    pub fn wrap(self, value: i64) -> i64 {
        let bits = u32::from(self.size) * 8;
        if bits >= 64 {
            return value;
        }
        let shift = 64 - bits;
        if self.signed {
            (value << shift) >> shift
        } else {
            ((value as u64) << shift >> shift) as i64
        }
    }

    pub fn fits(self, value: u64) -> bool {
        let bits = u32::from(self.size) * 8;
        let max = if self.signed {
            (1u64 << (bits - 1)) - 1
        } else if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        value <= max
    }
}

/// Signature of a function type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunctionType<'a> {
    pub ret: Type<'a>,
    pub params: &'a [Type<'a>],
    pub variadic: bool,
    /// Declared with `()`: arguments are not checked.
    pub unspecified: bool,
}

/// A C type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Type<'a> {
    Void,
    Int(IntType),
    Double,
    Pointer(&'a Type<'a>),
    /// Element type and length; `None` for `T[]`.
    Array(&'a Type<'a>, Option<usize>),
    Function(&'a FunctionType<'a>),
}

impl<'a> Type<'a> {
    pub const INT: Type<'static> = Type::Int(IntType::INT);
    pub const LONG: Type<'static> = Type::Int(IntType::LONG);
    pub const ULONG: Type<'static> = Type::Int(IntType::ULONG);
    pub const CHAR: Type<'static> = Type::Int(IntType::CHAR);

    pub fn pointer_to(arena: &'a Bump, pointee: Type<'a>) -> Type<'a> {
        Type::Pointer(arena.alloc(pointee))
    }

    pub fn array_of(arena: &'a Bump, element: Type<'a>, len: Option<usize>) -> Type<'a> {
        Type::Array(arena.alloc(element), len)
    }

    pub fn function(arena: &'a Bump, function: FunctionType<'a>) -> Type<'a> {
        Type::Function(arena.alloc(function))
    }

    /// Size in bytes; `void` and functions count as 1 for pointer arithmetic.
    ///
    /// Saturates for arrays too large to represent; the parser rejects any
    /// type whose [`checked_size`](Self::checked_size) exceeds
    /// [`MAX_OBJECT_SIZE`].
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    /// Size in bytes, or `None` if it overflows `usize`.
    pub fn checked_size(&self) -> Option<usize> {
        match self {
            Type::Void | Type::Function(_) => Some(1),
            Type::Int(int) => Some(usize::from(int.size)),
            Type::Double | Type::Pointer(_) => Some(8),
            Type::Array(element, len) => element.checked_size()?.checked_mul(len.unwrap_or(0)),
        }
    }

    pub fn align(&self) -> usize {
        match self {
            Type::Array(element, _) => element.align(),
            other => other.size().clamp(1, 8),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(self, Type::Int(_) | Type::Double)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Int(_) | Type::Double | Type::Pointer(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, Type::Double)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(..))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function(_))
    }

    pub fn pointee(&self) -> Option<Type<'a>> {
        match self {
            Type::Pointer(pointee) => Some(**pointee),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<Type<'a>> {
        match self {
            Type::Array(element, _) => Some(**element),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&'a FunctionType<'a>> {
        match self {
            Type::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Integer description of a scalar; pointers behave as `unsigned long`.
    pub fn int_type(&self) -> Option<IntType> {
        match self {
            Type::Int(int) => Some(*int),
            Type::Pointer(_) => Some(IntType::ULONG),
            _ => None,
        }
    }

    /// Whether an object of this type has a known size.
    pub fn is_complete(&self) -> bool {
        match self {
            Type::Void | Type::Function(_) => false,
            Type::Array(element, len) => len.is_some() && element.is_complete(),
            _ => true,
        }
    }

    /// Machine class for signatures; `None` for `void`.
    pub fn value_kind(&self) -> Option<ValueKind> {
        match self {
            Type::Void | Type::Array(..) | Type::Function(_) => None,
            Type::Double => Some(ValueKind::F64),
            Type::Pointer(_) => Some(ValueKind::Ptr),
            Type::Int(int) => Some(match (int.size, int.signed) {
                (1, true) => ValueKind::I8,
                (1, false) => ValueKind::U8,
                (2, true) => ValueKind::I16,
                (2, false) => ValueKind::U16,
                (4, true) => ValueKind::I32,
                (4, false) => ValueKind::U32,
                (_, true) => ValueKind::I64,
                (_, false) => ValueKind::U64,
            }),
        }
    }
}

/// Integer promotion: anything narrower than `int` becomes `int`.
pub fn promote(ty: Type<'_>) -> Type<'_> {
    match ty {
        Type::Int(int) if int.size < 4 => Type::INT,
        other => other,
    }
}

/// Common type of two arithmetic operands.
pub fn usual_arithmetic<'a>(left: Type<'a>, right: Type<'a>) -> Type<'a> {
    if left.is_double() || right.is_double() {
        return Type::Double;
    }
    match (promote(left), promote(right)) {
        (Type::Int(l), Type::Int(r)) => {
            if l == r {
                Type::Int(l)
            } else if l.size != r.size {
                Type::Int(if l.size > r.size { l } else { r })
            } else {
                Type::Int(IntType::new(l.size, false))
            }
        }
        (other, _) => other,
    }
}

impl fmt::Display for Type<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Double => f.write_str("double"),
            Type::Int(int) => {
                let name = match int.size {
                    1 => "char",
                    2 => "short",
                    4 => "int",
                    _ => "long",
                };
                match (int.signed, int.size) {
                    (true, _) => f.write_str(name),
                    (false, _) => write!(f, "unsigned {name}"),
                }
            }
            Type::Pointer(pointee) => write!(f, "{pointee} *"),
            Type::Array(element, Some(len)) => write!(f, "{element}[{len}]"),
            Type::Array(element, None) => write!(f, "{element}[]"),
            Type::Function(function) => {
                write!(f, "{} (", function.ret)?;
                for (i, param) in function.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{param}")?;
                }
                if function.variadic {
                    f.write_str(if function.params.is_empty() { "..." } else { ", ..." })?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_lp64() {
        let arena = Bump::new();
        assert_eq!(Type::CHAR.size(), 1);
        assert_eq!(Type::INT.size(), 4);
        assert_eq!(Type::LONG.size(), 8);
        let ptr = Type::pointer_to(&arena, Type::CHAR);
        assert_eq!(ptr.size(), 8);
        let arr = Type::array_of(&arena, Type::INT, Some(5));
        assert_eq!(arr.size(), 20);
        assert_eq!(arr.align(), 4);
        assert!(!Type::array_of(&arena, Type::INT, None).is_complete());
    }

    #[test]
    fn test_oversized_array_saturates() {
        let arena = Bump::new();
        let huge = Type::array_of(&arena, Type::INT, Some(1 << 62));
        assert_eq!(huge.checked_size(), None);
        assert_eq!(huge.size(), usize::MAX);
        let nested = Type::array_of(&arena, huge, Some(2));
        assert_eq!(nested.checked_size(), None);
    }

    #[test]
    fn test_usual_arithmetic_conversions() {
        let uint = Type::Int(IntType::UINT);
        assert_eq!(usual_arithmetic(Type::CHAR, Type::CHAR), Type::INT);
        assert_eq!(usual_arithmetic(Type::INT, uint), uint);
        assert_eq!(usual_arithmetic(uint, Type::LONG), Type::LONG);
        assert_eq!(usual_arithmetic(Type::LONG, Type::ULONG), Type::ULONG);
        assert_eq!(usual_arithmetic(Type::INT, Type::Double), Type::Double);
    }

    #[test]
    fn test_wrap() {
        assert_eq!(IntType::CHAR.wrap(200), -56);
        assert_eq!(IntType::UCHAR.wrap(-1), 255);
        assert_eq!(IntType::UINT.wrap(-1), 0xFFFF_FFFF);
        assert_eq!(IntType::INT.wrap(0x1_0000_0005), 5);
        assert_eq!(IntType::LONG.wrap(-7), -7);
        assert!(IntType::INT.fits(0x7FFF_FFFF));
        assert!(!IntType::INT.fits(0x8000_0000));
        assert!(IntType::UINT.fits(0xFFFF_FFFF));
    }

    #[test]
    fn test_value_kind_and_display() {
        let arena = Bump::new();
        assert_eq!(Type::CHAR.value_kind(), Some(ValueKind::I8));
        assert_eq!(Type::ULONG.value_kind(), Some(ValueKind::U64));
        assert_eq!(Type::Void.value_kind(), None);
        let ptr = Type::pointer_to(&arena, Type::Int(IntType::UCHAR));
        assert_eq!(ptr.to_string(), "unsigned char *");
        let params = arena.alloc_slice_copy(&[ptr]);
        let func = Type::function(
            &arena,
            FunctionType {
                ret: Type::INT,
                params,
                variadic: true,
                unspecified: false,
            },
        );
        assert_eq!(func.to_string(), "int (unsigned char *, ...)");
    }
}

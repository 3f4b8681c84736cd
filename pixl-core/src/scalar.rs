use bytemuck::Pod;
use derive_more::Display;
use dry::macro_for;
use half::{bf16, f16};
use num_traits::{FromPrimitive, NumAssign, NumCast};
use paste::paste;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

mod sealed {
    use half::{bf16, f16};

    #[doc(hidden)]
    pub trait Sealed {}

    macro_rules! impl_sealed {
        ($($t:ty),+) => {
            $(
                impl Sealed for $t {}
            )+
        };
    }

    impl_sealed!(u8, i8, u16, i16, f16, bf16, u32, i32, f32, u64, i64, f64);
}
use sealed::Sealed;

/// Numerical types that typed buffers can hold.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Display)]
pub enum ScalarType {
    U8 = 1,
    I8 = 2,
    U16 = 3,
    I16 = 4,
    F16 = 5,
    BF16 = 6,
    U32 = 7,
    I32 = 8,
    F32 = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl ScalarType {
    pub fn iter() -> impl Iterator<Item = Self> {
        use ScalarType::*;
        [U8, I8, U16, I16, F16, BF16, U32, I32, F32, U64, I64, F64].into_iter()
    }
    /// Size of the type in bytes.
    pub fn size(&self) -> usize {
        use ScalarType::*;
        match self {
            U8 | I8 => 1,
            U16 | I16 | F16 | BF16 => 2,
            U32 | I32 | F32 => 4,
            U64 | I64 | F64 => 8,
        }
    }
    /// Name of the type.
    ///
    /// Lowercase, ie "f16", "i32", etc.
    pub fn name(&self) -> &'static str {
        use ScalarType::*;
        match self {
            U8 => "u8",
            I8 => "i8",
            U16 => "u16",
            I16 => "i16",
            F16 => "f16",
            BF16 => "bf16",
            U32 => "u32",
            I32 => "i32",
            F32 => "f32",
            U64 => "u64",
            I64 => "i64",
            F64 => "f64",
        }
    }
    /// Name of the variant.
    ///
    /// Uppercase, ie "F16", "I32", etc.
    pub fn as_str(&self) -> &'static str {
        use ScalarType::*;
        match self {
            U8 => "U8",
            I8 => "I8",
            U16 => "U16",
            I16 => "I16",
            F16 => "F16",
            BF16 => "BF16",
            U32 => "U32",
            I32 => "I32",
            F32 => "F32",
            U64 => "U64",
            I64 => "I64",
            F64 => "F64",
        }
    }
    /// The runtime element descriptor of the type, with one lane.
    pub fn element_type(&self) -> ElementType {
        use ScalarType::*;
        let code = match self {
            U8 | U16 | U32 | U64 => TypeCode::UInt,
            I8 | I16 | I32 | I64 => TypeCode::Int,
            F16 | F32 | F64 => TypeCode::Float,
            BF16 => TypeCode::BFloat,
        };
        ElementType::new(code, (self.size() * 8) as u8, 1)
    }
}

impl FromStr for ScalarType {
    type Err = ();
    fn from_str(input: &str) -> Result<Self, ()> {
        Self::iter()
            .find(|x| x.as_str() == input || x.name() == input)
            .ok_or(())
    }
}

/// Category of an [`ElementType`].
///
/// The discriminants are the codes used by the flat descriptor.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeCode {
    Int = 0,
    UInt = 1,
    Float = 2,
    /// Opaque pointer sized values.
    Handle = 3,
    BFloat = 4,
}

impl TypeCode {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Handle => "handle",
            Self::BFloat => "bfloat",
        }
    }
}

impl TryFrom<u8> for TypeCode {
    type Error = ();
    fn try_from(input: u8) -> Result<Self, ()> {
        use TypeCode::*;
        let output = match input {
            0 => Int,
            1 => UInt,
            2 => Float,
            3 => Handle,
            4 => BFloat,
            _ => {
                return Err(());
            }
        };
        Ok(output)
    }
}

/// Runtime element type of a buffer.
///
/// Type erased buffers carry one of these instead of a type parameter. Vector
/// types are expressed with `lanes > 1`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct ElementType {
    code: TypeCode,
    bits: u8,
    lanes: u16,
}

impl ElementType {
    pub const fn new(code: TypeCode, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }
    /// The element type of `T`.
    pub fn of<T: Scalar>() -> Self {
        T::scalar_type().element_type()
    }
    pub fn code(&self) -> TypeCode {
        self.code
    }
    pub fn bits(&self) -> u8 {
        self.bits
    }
    pub fn lanes(&self) -> u16 {
        self.lanes
    }
    /// Size of one element in bytes, all lanes included.
    pub fn bytes(&self) -> usize {
        (self.bits as usize + 7) / 8 * self.lanes as usize
    }
    pub fn with_lanes(self, lanes: u16) -> Self {
        Self { lanes, ..self }
    }
    pub fn is_int(&self) -> bool {
        self.code == TypeCode::Int
    }
    pub fn is_uint(&self) -> bool {
        self.code == TypeCode::UInt
    }
    pub fn is_float(&self) -> bool {
        matches!(self.code, TypeCode::Float | TypeCode::BFloat)
    }
    pub fn is_handle(&self) -> bool {
        self.code == TypeCode::Handle
    }
    /// The matching [`ScalarType`], if this is a single lane numeric type.
    pub fn scalar_type(&self) -> Option<ScalarType> {
        if self.lanes != 1 {
            return None;
        }
        ScalarType::iter().find(|x| x.element_type() == *self)
    }
}

impl From<ScalarType> for ElementType {
    fn from(scalar_type: ScalarType) -> Self {
        scalar_type.element_type()
    }
}

impl Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.code.prefix(), self.bits)?;
        if self.lanes != 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

impl FromStr for ElementType {
    type Err = ();
    fn from_str(input: &str) -> Result<Self, ()> {
        let (scalar, lanes) = match input.split_once('x') {
            Some((scalar, lanes)) => (scalar, lanes.parse().map_err(|_| ())?),
            None => (input, 1),
        };
        let digits = scalar
            .find(|c: char| c.is_ascii_digit())
            .ok_or(())?;
        let (prefix, bits) = scalar.split_at(digits);
        let code = [
            TypeCode::Int,
            TypeCode::UInt,
            TypeCode::Float,
            TypeCode::Handle,
            TypeCode::BFloat,
        ]
        .into_iter()
        .find(|code| code.prefix() == prefix)
        .ok_or(())?;
        let bits = bits.parse().map_err(|_| ())?;
        if bits == 0 || lanes == 0 {
            return Err(());
        }
        Ok(Self::new(code, bits, lanes))
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ScalarElem {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    F16(f16),
    BF16(bf16),
    U32(u32),
    I32(i32),
    F32(f32),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl ScalarElem {
    pub fn scalar_type(&self) -> ScalarType {
        use ScalarElem::*;
        use ScalarType as T;
        match self {
            U8(_) => T::U8,
            I8(_) => T::I8,
            U16(_) => T::U16,
            I16(_) => T::I16,
            F16(_) => T::F16,
            BF16(_) => T::BF16,
            U32(_) => T::U32,
            I32(_) => T::I32,
            F32(_) => T::F32,
            U64(_) => T::U64,
            I64(_) => T::I64,
            F64(_) => T::F64,
        }
    }
    /// The raw bits, widened to 8 bytes.
    ///
    /// Only the low `scalar_type().size()` bytes are meaningful.
    pub fn to_bits_u64(&self) -> u64 {
        use ScalarElem::*;
        match *self {
            U8(x) => x.into(),
            I8(x) => (x as u8).into(),
            U16(x) => x.into(),
            I16(x) => (x as u16).into(),
            F16(x) => x.to_bits().into(),
            BF16(x) => x.to_bits().into(),
            U32(x) => x.into(),
            I32(x) => (x as u32).into(),
            F32(x) => x.to_bits().into(),
            U64(x) => x,
            I64(x) => x as u64,
            F64(x) => x.to_bits(),
        }
    }
    /// Inverse of [`.to_bits_u64()`](Self::to_bits_u64).
    pub fn from_bits_u64(scalar_type: ScalarType, bits: u64) -> Self {
        use ScalarElem as E;
        use ScalarType as S;
        match scalar_type {
            S::U8 => E::U8(bits as u8),
            S::I8 => E::I8(bits as u8 as i8),
            S::U16 => E::U16(bits as u16),
            S::I16 => E::I16(bits as u16 as i16),
            S::F16 => E::F16(f16::from_bits(bits as u16)),
            S::BF16 => E::BF16(bf16::from_bits(bits as u16)),
            S::U32 => E::U32(bits as u32),
            S::I32 => E::I32(bits as u32 as i32),
            S::F32 => E::F32(f32::from_bits(bits as u32)),
            S::U64 => E::U64(bits),
            S::I64 => E::I64(bits as i64),
            S::F64 => E::F64(f64::from_bits(bits)),
        }
    }
}

impl<T: Scalar> From<T> for ScalarElem {
    fn from(x: T) -> Self {
        x.scalar_elem()
    }
}

/// Base trait for element types of typed buffers.
///
/// # Safety
/// Implemented only for plain numeric types whose size matches
/// [`ScalarType::size`].
pub unsafe trait Scalar:
    Default
    + Copy
    + 'static
    + Send
    + Sync
    + NumCast
    + FromPrimitive
    + NumAssign
    + PartialEq
    + Pod
    + Debug
    + Display
    + Serialize
    + for<'de> Deserialize<'de>
    + Sealed
{
    /// The [`ScalarType`] of the scalar.
    fn scalar_type() -> ScalarType;
    fn scalar_elem(self) -> ScalarElem;
    fn element_type() -> ElementType {
        Self::scalar_type().element_type()
    }
}

macro_for!($X in [u8, i8, u16, i16, f16, bf16, u32, i32, f32, u64, i64, f64] {
    paste! {
        unsafe impl Scalar for $X {
            fn scalar_type() -> ScalarType {
                ScalarType::[<$X:upper>]
            }
            fn scalar_elem(self) -> ScalarElem {
                ScalarElem::[<$X:upper>](self)
            }
        }
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_type_bytes() {
        assert_eq!(ElementType::of::<u8>().bytes(), 1);
        assert_eq!(ElementType::of::<bf16>().bytes(), 2);
        assert_eq!(ElementType::of::<f64>().bytes(), 8);
        let rgba = ElementType::of::<u8>().with_lanes(4);
        assert_eq!(rgba.bytes(), 4);
        assert_eq!(ElementType::new(TypeCode::UInt, 1, 1).bytes(), 1);
    }

    #[test]
    fn element_type_scalar_type() {
        for scalar_type in ScalarType::iter() {
            assert_eq!(scalar_type.element_type().scalar_type(), Some(scalar_type));
        }
        assert_eq!(ElementType::of::<f32>().with_lanes(2).scalar_type(), None);
        assert_eq!(ElementType::new(TypeCode::Handle, 64, 1).scalar_type(), None);
    }

    #[test]
    fn element_type_display_from_str() {
        for input in ["float32", "uint8x4", "int16", "bfloat16", "handle64"] {
            let element_type = ElementType::from_str(input).unwrap();
            assert_eq!(element_type.to_string(), input);
        }
        assert_eq!(ElementType::from_str("float32"), Ok(ElementType::of::<f32>()));
        assert!(ElementType::from_str("complex64").is_err());
        assert!(ElementType::from_str("uint0").is_err());
    }

    #[test]
    fn scalar_type_str() {
        for scalar_type in ScalarType::iter() {
            assert_eq!(ScalarType::from_str(scalar_type.name()), Ok(scalar_type));
            assert_eq!(ScalarType::from_str(scalar_type.as_str()), Ok(scalar_type));
        }
    }

    #[test]
    fn scalar_elem_bits() {
        let elems = [
            ScalarElem::from(200u8),
            ScalarElem::from(-3i8),
            ScalarElem::from(f16::from_f32(1.5)),
            ScalarElem::from(bf16::from_f32(-2.)),
            ScalarElem::from(-70_000i32),
            ScalarElem::from(0.25f32),
            ScalarElem::from(u64::MAX),
            ScalarElem::from(-1.5f64),
        ];
        for elem in elems {
            let bits = elem.to_bits_u64();
            assert_eq!(ScalarElem::from_bits_u64(elem.scalar_type(), bits), elem);
        }
        assert_eq!(ScalarElem::from(-3i8).to_bits_u64(), 0xfd);
    }
}

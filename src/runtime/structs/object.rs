use std::fmt::{self, Debug, Formatter};

/// Heap handle. 0 is null.
pub type ObjRef = u32;

pub const NULL: ObjRef = 0;

/// One 32-bit operand-stack or local-variable slot. Longs and doubles take two slots,
/// upper half first.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Variable(u32);

impl Variable {
    pub const ZERO: Variable = Variable(0);

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_int(i: i32) -> Variable {
        Variable(i as u32)
    }

    #[inline]
    pub const fn int(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub fn from_float(f: f32) -> Variable {
        Variable(f.to_bits())
    }

    #[inline]
    pub fn float(self) -> f32 {
        f32::from_bits(self.0)
    }

    #[inline]
    pub const fn from_ref(reference: ObjRef) -> Variable {
        Variable(reference)
    }

    #[inline]
    pub const fn reference(self) -> ObjRef {
        self.0
    }

    #[inline]
    pub const fn put_long(l: i64) -> (Variable, Variable) {
        let bits = l as u64;
        (Variable((bits >> 32) as u32), Variable(bits as u32))
    }

    #[inline]
    pub const fn get_long(upper: Variable, lower: Variable) -> i64 {
        (((upper.0 as u64) << 32) | lower.0 as u64) as i64
    }

    #[inline]
    pub fn put_double(d: f64) -> (Variable, Variable) {
        Self::put_long(d.to_bits() as i64)
    }

    #[inline]
    pub fn get_double(upper: Variable, lower: Variable) -> f64 {
        f64::from_bits(Self::get_long(upper, lower) as u64)
    }
}

impl Debug for Variable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Variable({:#010x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_split() {
        let (upper, lower) = Variable::put_long(-2);
        assert_eq!(upper.raw(), 0xffff_ffff);
        assert_eq!(lower.raw(), 0xffff_fffe);
        assert_eq!(Variable::get_long(upper, lower), -2);
    }

    #[test]
    fn test_nan_bits_survive() {
        let nan = f32::from_bits(0x7fc0_0001);
        assert_eq!(Variable::from_float(nan).raw(), 0x7fc0_0001);
        let (upper, lower) = Variable::put_double(f64::NEG_INFINITY);
        assert_eq!(Variable::get_double(upper, lower), f64::NEG_INFINITY);
    }
}

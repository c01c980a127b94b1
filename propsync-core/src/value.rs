//! Property value types.
//!
//! A value has a fixed wire size and a native-endian byte representation,
//! shared by the request payload and the shared segment slot.

use std::fmt::Debug;

/// Size of one shared segment slot. Values that do not fit are kept as local
/// copies and travel in `Set` requests.
pub const SLOT_SIZE: usize = 8;

/// A type that can be stored in a property.
///
/// The arithmetic hooks default to "not applicable" and are overridden only
/// where the operation means something for the type.
pub trait PropertyValue: Clone + PartialEq + Debug + Send + Sync + 'static {
    /// Encoded size in bytes.
    const WIRE_SIZE: usize;

    /// Writes the value into `out`, which is exactly `WIRE_SIZE` bytes.
    fn encode(&self, out: &mut [u8]);

    /// Reads a value; `None` unless `bytes` is exactly `WIRE_SIZE` long.
    fn decode(bytes: &[u8]) -> Option<Self>;

    fn op_add(&self, _rhs: &Self) -> Option<Self> {
        None
    }

    fn op_mul(&self, _rhs: &Self) -> Option<Self> {
        None
    }

    fn op_div(&self, _rhs: &Self) -> Option<Self> {
        None
    }

    fn op_and(&self, _rhs: &Self) -> Option<Self> {
        None
    }

    fn op_or(&self, _rhs: &Self) -> Option<Self> {
        None
    }

    fn op_xor(&self, _rhs: &Self) -> Option<Self> {
        None
    }

    fn op_invert(&self) -> Option<Self> {
        None
    }

    /// Whether the value fits a shared segment slot.
    fn fits_slot() -> bool {
        Self::WIRE_SIZE <= SLOT_SIZE
    }

    fn to_slot(&self) -> Option<u64> {
        if !Self::fits_slot() {
            return None;
        }
        let mut bytes = [0u8; SLOT_SIZE];
        self.encode(&mut bytes[..Self::WIRE_SIZE]);
        Some(u64::from_ne_bytes(bytes))
    }

    fn from_slot(slot: u64) -> Option<Self> {
        if !Self::fits_slot() {
            return None;
        }
        Self::decode(&slot.to_ne_bytes()[..Self::WIRE_SIZE])
    }
}

/// Encodes a value into a fresh buffer.
pub fn encode_value<V: PropertyValue>(value: &V) -> bytes::Bytes {
    let mut buf = vec![0u8; V::WIRE_SIZE];
    value.encode(&mut buf);
    bytes::Bytes::from(buf)
}

impl PropertyValue for bool {
    const WIRE_SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [b] => Some(*b != 0),
            _ => None,
        }
    }

    fn op_and(&self, rhs: &Self) -> Option<Self> {
        Some(*self && *rhs)
    }

    fn op_or(&self, rhs: &Self) -> Option<Self> {
        Some(*self || *rhs)
    }

    fn op_xor(&self, rhs: &Self) -> Option<Self> {
        Some(*self != *rhs)
    }

    fn op_invert(&self) -> Option<Self> {
        Some(!*self)
    }
}

macro_rules! impl_integer_value {
    ($($t:ty => $invert:expr),* $(,)?) => {
        $(
            impl PropertyValue for $t {
                const WIRE_SIZE: usize = std::mem::size_of::<$t>();

                fn encode(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                fn decode(bytes: &[u8]) -> Option<Self> {
                    Some(<$t>::from_ne_bytes(bytes.try_into().ok()?))
                }

                fn op_add(&self, rhs: &Self) -> Option<Self> {
                    Some(self.wrapping_add(*rhs))
                }

                fn op_mul(&self, rhs: &Self) -> Option<Self> {
                    Some(self.wrapping_mul(*rhs))
                }

                fn op_div(&self, rhs: &Self) -> Option<Self> {
                    <$t>::checked_div(*self, *rhs)
                }

                fn op_and(&self, rhs: &Self) -> Option<Self> {
                    Some(*self & *rhs)
                }

                fn op_or(&self, rhs: &Self) -> Option<Self> {
                    Some(*self | *rhs)
                }

                fn op_xor(&self, rhs: &Self) -> Option<Self> {
                    Some(*self ^ *rhs)
                }

                fn op_invert(&self) -> Option<Self> {
                    let invert: fn($t) -> $t = $invert;
                    Some(invert(*self))
                }
            }
        )*
    };
}

// Signed integers invert by negation, unsigned ones bitwise.
impl_integer_value! {
    i8 => |v| v.wrapping_neg(),
    i16 => |v| v.wrapping_neg(),
    i32 => |v| v.wrapping_neg(),
    i64 => |v| v.wrapping_neg(),
    u8 => |v| !v,
    u16 => |v| !v,
    u32 => |v| !v,
    u64 => |v| !v,
}

macro_rules! impl_float_value {
    ($($t:ty),*) => {
        $(
            impl PropertyValue for $t {
                const WIRE_SIZE: usize = std::mem::size_of::<$t>();

                fn encode(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                fn decode(bytes: &[u8]) -> Option<Self> {
                    Some(<$t>::from_ne_bytes(bytes.try_into().ok()?))
                }

                fn op_add(&self, rhs: &Self) -> Option<Self> {
                    Some(*self + *rhs)
                }

                fn op_mul(&self, rhs: &Self) -> Option<Self> {
                    Some(*self * *rhs)
                }

                fn op_div(&self, rhs: &Self) -> Option<Self> {
                    Some(*self / *rhs)
                }

                fn op_invert(&self) -> Option<Self> {
                    Some(-*self)
                }
            }
        )*
    };
}

impl_float_value!(f32, f64);

/// Fixed-size byte blocks, typically larger than a slot.
impl<const N: usize> PropertyValue for [u8; N] {
    const WIRE_SIZE: usize = N;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok()
    }
}

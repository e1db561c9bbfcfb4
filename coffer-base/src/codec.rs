//! Big-endian fixed-width packing.
//!
//! Every cryptographic binding in coffer (sequence prefixes on ciphertexts,
//! counter state arrays, MAC messages) is packed with this codec so that the
//! byte layout is explicit and stable.

use crate::{Error, Result};

/// A single slot in a packing pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atom {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer, big-endian.
    U16,
    /// Unsigned 32-bit integer, big-endian.
    U32,
    /// Unsigned 64-bit integer, big-endian.
    U64,
    /// Raw bytes with no length prefix; must be the last atom.
    Bytes,
}

impl Atom {
    /// Fixed width in bytes, or `None` for [`Atom::Bytes`].
    pub fn width(self) -> Option<usize> {
        match self {
            Atom::U8 => Some(1),
            Atom::U16 => Some(2),
            Atom::U32 => Some(4),
            Atom::U64 => Some(8),
            Atom::Bytes => None,
        }
    }

    fn max(self) -> u64 {
        match self {
            Atom::U8 => u8::MAX as u64,
            Atom::U16 => u16::MAX as u64,
            Atom::U32 => u32::MAX as u64,
            Atom::U64 => u64::MAX,
            Atom::Bytes => 0,
        }
    }
}

/// A value packed or unpacked by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Any of the fixed-width integer atoms.
    Int(u64),
    /// The raw trailing bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// The integer, or `Corrupt` if this is a bytes value.
    pub fn as_int(&self) -> Result<u64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Bytes(_) => Err(Error::Corrupt("expected integer value".into())),
        }
    }

    /// The bytes, or `Corrupt` if this is an integer value.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Value::Bytes(b) => Ok(b),
            Value::Int(_) => Err(Error::Corrupt("expected bytes value".into())),
        }
    }
}

fn check_pattern(pattern: &[Atom]) -> Result<()> {
    for (i, atom) in pattern.iter().enumerate() {
        if *atom == Atom::Bytes && i + 1 != pattern.len() {
            return Err(Error::Corrupt("bytes atom must be last".into()));
        }
    }
    Ok(())
}

/// Pack `values` per `pattern`.
///
/// Integers are written big-endian at their atom's width; a value that does
/// not fit the width fails `Corrupt`. The optional trailing [`Atom::Bytes`]
/// is written raw, its length inferred on decode from the remainder.
pub fn encode(pattern: &[Atom], values: &[Value]) -> Result<Vec<u8>> {
    check_pattern(pattern)?;
    if pattern.len() != values.len() {
        return Err(Error::Corrupt(format!(
            "pattern of {} atoms given {} values",
            pattern.len(),
            values.len()
        )));
    }
    let mut out = Vec::new();
    for (atom, value) in pattern.iter().zip(values) {
        match atom {
            Atom::Bytes => out.extend_from_slice(&value.clone().into_bytes()?),
            _ => {
                let v = value.as_int()?;
                if v > atom.max() {
                    return Err(Error::Corrupt(format!("{v} exceeds {atom:?} range")));
                }
                let width = atom.width().expect("fixed atom");
                out.extend_from_slice(&v.to_be_bytes()[8 - width..]);
            }
        }
    }
    Ok(out)
}

/// Unpack `bytes` per `pattern`, the inverse of [`encode`].
///
/// Fails `Corrupt` if the buffer is shorter than the fixed widths or if any
/// bytes remain unconsumed. A trailing [`Atom::Bytes`] absorbs the whole
/// remainder, which may be empty.
pub fn decode(pattern: &[Atom], bytes: &[u8]) -> Result<Vec<Value>> {
    check_pattern(pattern)?;
    let mut values = Vec::with_capacity(pattern.len());
    let mut rest = bytes;
    for atom in pattern {
        match atom.width() {
            None => {
                values.push(Value::Bytes(rest.to_vec()));
                rest = &[];
            }
            Some(width) => {
                if rest.len() < width {
                    return Err(Error::Corrupt(format!(
                        "buffer too short for {atom:?}: {} bytes left",
                        rest.len()
                    )));
                }
                let (head, tail) = rest.split_at(width);
                let mut buf = [0u8; 8];
                buf[8 - width..].copy_from_slice(head);
                values.push(Value::Int(u64::from_be_bytes(buf)));
                rest = tail;
            }
        }
    }
    if !rest.is_empty() {
        return Err(Error::Corrupt(format!("{} trailing bytes", rest.len())));
    }
    Ok(values)
}

/// A fixed-width big-endian integer usable in homogeneous arrays.
pub trait FixedInt: Copy {
    /// Width in bytes.
    const WIDTH: usize;
    /// Append the big-endian encoding to `out`.
    fn put(self, out: &mut Vec<u8>);
    /// Read from exactly [`Self::WIDTH`] bytes.
    fn take(buf: &[u8]) -> Self;
}

macro_rules! fixed_int {
    ($t:ty) => {
        impl FixedInt for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();
            fn put(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }
            fn take(buf: &[u8]) -> Self {
                let mut bytes = [0u8; Self::WIDTH];
                bytes.copy_from_slice(buf);
                <$t>::from_be_bytes(bytes)
            }
        }
    };
}

fixed_int!(u8);
fixed_int!(u16);
fixed_int!(u32);
fixed_int!(u64);

/// Pack a homogeneous array of fixed-width integers.
pub fn encode_array<T: FixedInt>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::WIDTH);
    for v in values {
        v.put(&mut out);
    }
    out
}

/// Unpack a homogeneous array of fixed-width integers.
///
/// Fails `Corrupt` when the buffer length is not a multiple of the width.
pub fn decode_array<T: FixedInt>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() % T::WIDTH != 0 {
        return Err(Error::Corrupt(format!(
            "array of width {} from {} bytes",
            T::WIDTH,
            bytes.len()
        )));
    }
    Ok(bytes.chunks_exact(T::WIDTH).map(T::take).collect())
}

use crate::error::BinaryError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Cursor over an immutable byte buffer. All multi-byte integers are
/// big-endian on this wire unless the accessor name says otherwise.
#[derive(Debug, Clone)]
pub struct BinaryReader {
    buffer: Bytes,
}

/// Growable output buffer with symmetric accessors to [`BinaryReader`].
#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buffer: BytesMut,
}

macro_rules! impl_read_primitive {
    ($($name:ident => $ty:ty, $get:ident, $size:expr),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&mut self) -> Result<$ty, BinaryError> {
                self.ensure($size)?;
                Ok(self.buffer.$get())
            }
        )*
    };
}

macro_rules! impl_write_primitive {
    ($($name:ident => $ty:ty, $put:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&mut self, value: $ty) -> Result<(), BinaryError> {
                self.buffer.$put(value);
                Ok(())
            }
        )*
    };
}

impl BinaryReader {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buffer: Bytes::copy_from_slice(data),
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    pub fn has_remaining(&self) -> bool {
        self.buffer.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), BinaryError> {
        if self.buffer.remaining() < needed {
            return Err(BinaryError::UnexpectedEof {
                needed,
                remaining: self.buffer.remaining(),
            });
        }
        Ok(())
    }

    impl_read_primitive! {
        read_u8 => u8, get_u8, 1,
        read_i8 => i8, get_i8, 1,
        read_u16 => u16, get_u16, 2,
        read_i16 => i16, get_i16, 2,
        read_u32 => u32, get_u32, 4,
        read_i32 => i32, get_i32, 4,
        read_u64 => u64, get_u64, 8,
        read_i64 => i64, get_i64, 8,
        read_f32 => f32, get_f32, 4,
        read_f64 => f64, get_f64, 8,
        read_u16_le => u16, get_u16_le, 2,
        read_u32_le => u32, get_u32_le, 4,
    }

    pub fn read_bool(&mut self) -> Result<bool, BinaryError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, BinaryError> {
        self.ensure(16)?;
        let mut raw = [0u8; 16];
        self.buffer.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, BinaryError> {
        self.ensure(len)?;
        Ok(self.buffer.copy_to_bytes(len))
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), BinaryError> {
        self.ensure(out.len())?;
        self.buffer.copy_to_slice(out);
        Ok(())
    }

    /// Reads a u16-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, BinaryError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| BinaryError::InvalidData(format!("Invalid UTF-8 string: {}", e)))
    }

    /// Consumes the rest of the buffer.
    pub fn read_remaining(&mut self) -> Bytes {
        let len = self.buffer.remaining();
        self.buffer.copy_to_bytes(len)
    }
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn into_inner(self) -> BytesMut {
        self.buffer
    }

    impl_write_primitive! {
        write_u8 => u8, put_u8,
        write_i8 => i8, put_i8,
        write_u16 => u16, put_u16,
        write_i16 => i16, put_i16,
        write_u32 => u32, put_u32,
        write_i32 => i32, put_i32,
        write_u64 => u64, put_u64,
        write_i64 => i64, put_i64,
        write_f32 => f32, put_f32,
        write_f64 => f64, put_f64,
        write_u16_le => u16, put_u16_le,
        write_u32_le => u32, put_u32_le,
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BinaryError> {
        self.write_u8(u8::from(value))
    }

    pub fn write_uuid(&mut self, value: &Uuid) -> Result<(), BinaryError> {
        self.buffer.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), BinaryError> {
        self.buffer.put_slice(data);
        Ok(())
    }

    /// Writes a u16-length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<(), BinaryError> {
        let raw = value.as_bytes();
        if raw.len() > u16::MAX as usize {
            return Err(BinaryError::LengthOverflow {
                what: "string",
                len: raw.len(),
                max: u16::MAX as usize,
            });
        }
        self.write_u16(raw.len() as u16)?;
        self.write_bytes(raw)
    }
}

/// Three-component float vector as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

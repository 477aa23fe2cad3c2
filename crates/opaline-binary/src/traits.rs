use crate::error::BinaryError;
use crate::io::{BinaryReader, BinaryWriter, Vector3};
use uuid::Uuid;

/// Trait for types that can be read from a `BinaryReader`.
pub trait Readable: Sized {
    /// Reads an instance of `Self` from the reader.
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError>;
}

/// Trait for types that can be written to a `BinaryWriter`.
pub trait Writable {
    /// Writes this instance to the writer.
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError>;
}

macro_rules! impl_primitive_readable {
    ($($ty:ty => $method:ident),*) => {
        $(
            impl Readable for $ty {
                #[inline]
                fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
                    reader.$method()
                }
            }
        )*
    };
}

macro_rules! impl_primitive_writable {
    ($($ty:ty => $method:ident),*) => {
        $(
            impl Writable for $ty {
                #[inline]
                fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
                    writer.$method(*self)
                }
            }
        )*
    };
}

impl_primitive_readable! {
    u8 => read_u8, i8 => read_i8,
    u16 => read_u16, i16 => read_i16,
    u32 => read_u32, i32 => read_i32,
    u64 => read_u64, i64 => read_i64,
    f32 => read_f32, f64 => read_f64,
    bool => read_bool
}

impl_primitive_writable! {
    u8 => write_u8, i8 => write_i8,
    u16 => write_u16, i16 => write_i16,
    u32 => write_u32, i32 => write_i32,
    u64 => write_u64, i64 => write_i64,
    f32 => write_f32, f64 => write_f64,
    bool => write_bool
}

impl Readable for Uuid {
    #[inline]
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        reader.read_uuid()
    }
}

impl Writable for Uuid {
    #[inline]
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(self)
    }
}

impl Readable for String {
    #[inline]
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        reader.read_string()
    }
}

impl Writable for String {
    #[inline]
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_string(self)
    }
}

// &str (only Writable)
impl Writable for &str {
    #[inline]
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_string(self)
    }
}

impl Readable for Vector3 {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Vector3 {
            x: reader.read_f32()?,
            y: reader.read_f32()?,
            z: reader.read_f32()?,
        })
    }
}

impl Writable for Vector3 {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_f32(self.x)?;
        writer.write_f32(self.y)?;
        writer.write_f32(self.z)?;
        Ok(())
    }
}

// Vec<T>: variable blocks carry a u8 count on this wire.
impl<T: Readable> Readable for Vec<T> {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        let len = reader.read_u8()? as usize;
        let mut vec = Vec::with_capacity(len);
        for _ in 0..len {
            vec.push(T::read(reader)?);
        }
        Ok(vec)
    }
}

impl<T: Writable> Writable for Vec<T> {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        if self.len() > u8::MAX as usize {
            return Err(BinaryError::LengthOverflow {
                what: "variable block",
                len: self.len(),
                max: u8::MAX as usize,
            });
        }
        writer.write_u8(self.len() as u8)?;
        for item in self {
            item.write(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BinaryReader, BinaryWriter};

    #[test]
    fn vec_block_carries_u8_count() {
        let ids: Vec<u32> = vec![7, 8, 9];
        let mut writer = BinaryWriter::new();
        ids.write(&mut writer).unwrap();
        let frozen = writer.freeze();
        assert_eq!(frozen[0], 3);
        let mut reader = BinaryReader::new(frozen);
        assert_eq!(Vec::<u32>::read(&mut reader).unwrap(), ids);
    }

    #[test]
    fn oversized_vec_block_is_rejected() {
        let ids: Vec<u8> = vec![0; 300];
        let mut writer = BinaryWriter::new();
        assert!(matches!(
            ids.write(&mut writer),
            Err(BinaryError::LengthOverflow { .. })
        ));
    }
}

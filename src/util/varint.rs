use bytes_varint::{VarIntError, VarIntSupport};

/// Outcome of reading a varint from a buffer that may not yet hold all of the data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarIntRead<T> {
    Value(T),
    /// the buffer ends in the middle of the varint
    Incomplete,
    /// the encoded value does not fit into the target type
    Overflow,
}

pub trait VarIntReadExt: VarIntSupport {
    fn read_u32_varint(&mut self) -> VarIntRead<u32> {
        match self.try_get_u32_varint() {
            Ok(v) => VarIntRead::Value(v),
            Err(VarIntError::BufferUnderflow) => VarIntRead::Incomplete,
            Err(_) => VarIntRead::Overflow,
        }
    }
}

impl <T: VarIntSupport> VarIntReadExt for T {}

/// number of bytes in a u32's LEB128 representation
pub fn u32_varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

pub mod safe_converter;
pub mod varint;

//! Cursor over raw instruction bytes with LEB128 decoding

use byteorder::{ByteOrder, LittleEndian};

use super::ValidationError;

pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn read_byte(&mut self) -> Result<u8, ValidationError> {
        let byte = *self.bytes.get(self.pos).ok_or(ValidationError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ValidationError> {
        let end = self.pos.checked_add(len).ok_or(ValidationError::UnexpectedEof)?;
        let slice = self.bytes.get(self.pos..end).ok_or(ValidationError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_vu32(&mut self) -> Result<u32, ValidationError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 35 {
                return Err(ValidationError::MalformedLeb);
            }
        }
        u32::try_from(result).map_err(|_| ValidationError::MalformedLeb)
    }

    pub fn read_vs32(&mut self) -> Result<i32, ValidationError> {
        let value = self.read_vs(32)?;
        i32::try_from(value).map_err(|_| ValidationError::MalformedLeb)
    }

    pub fn read_vs64(&mut self) -> Result<i64, ValidationError> {
        self.read_vs(64)
    }

    fn read_vs(&mut self, bits: u32) -> Result<i64, ValidationError> {
        let max_bytes = (bits + 6) / 7;
        let mut result: i64 = 0;
        let mut shift = 0u32;
        let mut count = 0;
        loop {
            let byte = self.read_byte()?;
            count += 1;
            if count == max_bytes && bits == 64 && byte != 0x00 && byte != 0x7f {
                // only the sign bit of the tenth byte is significant
                return Err(ValidationError::MalformedLeb);
            }
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
            if count == max_bytes {
                return Err(ValidationError::MalformedLeb);
            }
        }
    }

    pub fn read_f32(&mut self) -> Result<f32, ValidationError> {
        Ok(LittleEndian::read_f32(self.read_slice(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64, ValidationError> {
        Ok(LittleEndian::read_f64(self.read_slice(8)?))
    }
}

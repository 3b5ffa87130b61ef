use crate::error::CodecError;

/// Fixed-point scale used by the short float encoding. Range is about +-327.67.
pub const SHORT_FLOAT_SCALE: f32 = 100.0;

pub fn encode_short_float(value: f32, scale: f32) -> i16 {
    (value * scale)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn decode_short_float(value: i16, scale: f32) -> f32 {
    value as f32 / scale
}

/// Sequential little-endian writer over an owned buffer.
#[derive(Debug, Default, Clone)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_short_float(&mut self, value: f32, scale: f32) {
        self.write_i16(encode_short_float(value, scale));
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let len = u16::try_from(bytes.len()).map_err(|_| CodecError::LengthOverflow(bytes.len()))?;
        self.write_u16(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), CodecError> {
        self.write_bytes(value.as_bytes())
    }
}

/// Cursor over a borrowed buffer. Every read is bounds checked.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(CodecError::UnexpectedEof { needed, remaining });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_short_float(&mut self, scale: f32) -> Result<f32, CodecError> {
        Ok(decode_short_float(self.read_i16()?, scale))
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_fields_are_little_endian() {
        let mut w = BinaryWriter::new();
        w.write_u16(0x0102);
        w.write_i32(-2);
        assert_eq!(w.as_slice(), &[0x02, 0x01, 0xfe, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut w = BinaryWriter::new();
        w.write_string("abc").unwrap();
        assert_eq!(w.as_slice(), &[3, 0, b'a', b'b', b'c']);

        let bytes = w.into_bytes();
        let mut r = BinaryReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "abc");
        assert!(r.is_finished());
    }

    #[test]
    fn reading_past_end_fails() {
        let mut r = BinaryReader::new(&[1, 2]);
        assert_eq!(
            r.read_u32(),
            Err(CodecError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn short_float_quantization() {
        assert_eq!(encode_short_float(1.234, SHORT_FLOAT_SCALE), 123);
        assert_eq!(encode_short_float(1000.0, SHORT_FLOAT_SCALE), i16::MAX);
        assert!((decode_short_float(-250, SHORT_FLOAT_SCALE) + 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn invalid_bool_rejected() {
        let mut r = BinaryReader::new(&[7]);
        assert_eq!(r.read_bool(), Err(CodecError::InvalidBool(7)));
    }
}

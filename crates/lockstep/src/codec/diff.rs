use super::bits::DirtyBits;
use super::buffer::{BinaryReader, BinaryWriter};
use crate::error::CodecError;

/// Tolerance used when comparing floating point fields.
pub const FLOAT_EPSILON: f32 = 1e-5;

#[inline]
pub fn float_changed(new: f32, old: f32) -> bool {
    (new - old).abs() > FLOAT_EPSILON
}

/// Wire precision for floating point fields, chosen per use site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Full,
    /// Quantized 16-bit encoding.
    Short,
}

/// Writes values of `T` in full or as a delta against a previous value.
///
/// `serialize_diff` with `None` bits writes every field, so the same call site
/// can send both a baseline and a delta.
pub trait DiffSerializer<T> {
    fn dirty_bits_size(&self) -> usize;

    fn compare(&self, new: &T, old: &T, dirty: &mut DirtyBits);

    fn serialize(&self, value: &T, w: &mut BinaryWriter) {
        self.serialize_diff(value, w, None);
    }

    fn serialize_diff(&self, value: &T, w: &mut BinaryWriter, dirty: Option<&DirtyBits>);
}

/// Mirror of [`DiffSerializer`]. Bit order and count must match the writer.
pub trait DiffParser<T> {
    fn dirty_bits_size(&self) -> usize;

    fn parse(&self, r: &mut BinaryReader<'_>) -> Result<T, CodecError>;

    fn parse_diff(
        &self,
        current: T,
        r: &mut BinaryReader<'_>,
        dirty: Option<&DirtyBits>,
    ) -> Result<T, CodecError>;
}

/// True when the field at `index` must be written or read.
#[inline]
pub fn is_dirty(dirty: Option<&DirtyBits>, index: usize) -> bool {
    dirty.is_none_or(|bits| bits.get(index))
}

/// Writes the dirty bits followed by the changed fields of `new`.
pub fn write_delta<T, S>(serializer: &S, new: &T, old: &T, w: &mut BinaryWriter) -> DirtyBits
where
    S: DiffSerializer<T> + ?Sized,
{
    let mut bits = DirtyBits::new(serializer.dirty_bits_size());
    serializer.compare(new, old, &mut bits);
    bits.write(w);
    serializer.serialize_diff(new, w, Some(&bits));
    bits
}

/// Reads a delta written by [`write_delta`] and applies it to `current`.
pub fn read_delta<T, P>(parser: &P, current: T, r: &mut BinaryReader<'_>) -> Result<T, CodecError>
where
    P: DiffParser<T> + ?Sized,
{
    let bits = DirtyBits::read(r, parser.dirty_bits_size())?;
    parser.parse_diff(current, r, Some(&bits))
}

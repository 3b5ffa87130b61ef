use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use super::bits::DirtyBits;
use super::buffer::{BinaryReader, BinaryWriter, SHORT_FLOAT_SCALE};
use super::diff::{float_changed, is_dirty, DiffParser, DiffSerializer, Precision};
use crate::error::CodecError;

const QUAT_SHORT_SCALE: f32 = 32767.0;

const VEC3_BITS: usize = 3;
const QUAT_BITS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

fn write_component(w: &mut BinaryWriter, value: f32, precision: Precision, short_scale: f32) {
    match precision {
        Precision::Full => w.write_f32(value),
        Precision::Short => w.write_short_float(value, short_scale),
    }
}

fn read_component(
    r: &mut BinaryReader<'_>,
    precision: Precision,
    short_scale: f32,
) -> Result<f32, CodecError> {
    match precision {
        Precision::Full => r.read_f32(),
        Precision::Short => r.read_short_float(short_scale),
    }
}

fn compare_components(new: &[f32], old: &[f32], dirty: &mut DirtyBits, offset: usize) {
    for (i, (n, o)) in new.iter().zip(old).enumerate() {
        dirty.set(offset + i, float_changed(*n, *o));
    }
}

fn write_components(
    w: &mut BinaryWriter,
    values: &[f32],
    dirty: Option<&DirtyBits>,
    offset: usize,
    precision: Precision,
    short_scale: f32,
) {
    for (i, value) in values.iter().enumerate() {
        if is_dirty(dirty, offset + i) {
            write_component(w, *value, precision, short_scale);
        }
    }
}

fn read_components(
    r: &mut BinaryReader<'_>,
    values: &mut [f32],
    dirty: Option<&DirtyBits>,
    offset: usize,
    precision: Precision,
    short_scale: f32,
) -> Result<(), CodecError> {
    for (i, value) in values.iter_mut().enumerate() {
        if is_dirty(dirty, offset + i) {
            *value = read_component(r, precision, short_scale)?;
        }
    }
    Ok(())
}

/// X/Y/Z, one bit each.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vec3Codec {
    pub precision: Precision,
}

impl Vec3Codec {
    pub const FULL: Self = Self {
        precision: Precision::Full,
    };
    pub const SHORT: Self = Self {
        precision: Precision::Short,
    };
}

impl DiffSerializer<Vec3> for Vec3Codec {
    fn dirty_bits_size(&self) -> usize {
        VEC3_BITS
    }

    fn compare(&self, new: &Vec3, old: &Vec3, dirty: &mut DirtyBits) {
        compare_components(&new.to_array(), &old.to_array(), dirty, 0);
    }

    fn serialize_diff(&self, value: &Vec3, w: &mut BinaryWriter, dirty: Option<&DirtyBits>) {
        write_components(w, &value.to_array(), dirty, 0, self.precision, SHORT_FLOAT_SCALE);
    }
}

impl DiffParser<Vec3> for Vec3Codec {
    fn dirty_bits_size(&self) -> usize {
        VEC3_BITS
    }

    fn parse(&self, r: &mut BinaryReader<'_>) -> Result<Vec3, CodecError> {
        self.parse_diff(Vec3::ZERO, r, None)
    }

    fn parse_diff(
        &self,
        current: Vec3,
        r: &mut BinaryReader<'_>,
        dirty: Option<&DirtyBits>,
    ) -> Result<Vec3, CodecError> {
        let mut values = current.to_array();
        read_components(r, &mut values, dirty, 0, self.precision, SHORT_FLOAT_SCALE)?;
        Ok(Vec3::from_array(values))
    }
}

/// X/Y/Z/W, one bit each. Short precision stores each component as i16 over [-1, 1].
#[derive(Debug, Clone, Copy, Default)]
pub struct QuatCodec {
    pub precision: Precision,
}

impl QuatCodec {
    pub const FULL: Self = Self {
        precision: Precision::Full,
    };
    pub const SHORT: Self = Self {
        precision: Precision::Short,
    };
}

impl DiffSerializer<Quat> for QuatCodec {
    fn dirty_bits_size(&self) -> usize {
        QUAT_BITS
    }

    fn compare(&self, new: &Quat, old: &Quat, dirty: &mut DirtyBits) {
        compare_components(&new.to_array(), &old.to_array(), dirty, 0);
    }

    fn serialize_diff(&self, value: &Quat, w: &mut BinaryWriter, dirty: Option<&DirtyBits>) {
        write_components(w, &value.to_array(), dirty, 0, self.precision, QUAT_SHORT_SCALE);
    }
}

impl DiffParser<Quat> for QuatCodec {
    fn dirty_bits_size(&self) -> usize {
        QUAT_BITS
    }

    fn parse(&self, r: &mut BinaryReader<'_>) -> Result<Quat, CodecError> {
        self.parse_diff(Quat::IDENTITY, r, None)
    }

    fn parse_diff(
        &self,
        current: Quat,
        r: &mut BinaryReader<'_>,
        dirty: Option<&DirtyBits>,
    ) -> Result<Quat, CodecError> {
        let mut values = current.to_array();
        read_components(r, &mut values, dirty, 0, self.precision, QUAT_SHORT_SCALE)?;
        Ok(Quat::from_array(values))
    }
}

/// Position (bits 0..3), rotation (3..7), scale (7..10).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformCodec {
    pub precision: Precision,
}

impl TransformCodec {
    const ROTATION_OFFSET: usize = VEC3_BITS;
    const SCALE_OFFSET: usize = VEC3_BITS + QUAT_BITS;

    pub const FULL: Self = Self {
        precision: Precision::Full,
    };
    pub const SHORT: Self = Self {
        precision: Precision::Short,
    };
}

impl DiffSerializer<Transform> for TransformCodec {
    fn dirty_bits_size(&self) -> usize {
        VEC3_BITS + QUAT_BITS + VEC3_BITS
    }

    fn compare(&self, new: &Transform, old: &Transform, dirty: &mut DirtyBits) {
        compare_components(&new.position.to_array(), &old.position.to_array(), dirty, 0);
        compare_components(
            &new.rotation.to_array(),
            &old.rotation.to_array(),
            dirty,
            Self::ROTATION_OFFSET,
        );
        compare_components(
            &new.scale.to_array(),
            &old.scale.to_array(),
            dirty,
            Self::SCALE_OFFSET,
        );
    }

    fn serialize_diff(&self, value: &Transform, w: &mut BinaryWriter, dirty: Option<&DirtyBits>) {
        write_components(
            w,
            &value.position.to_array(),
            dirty,
            0,
            self.precision,
            SHORT_FLOAT_SCALE,
        );
        write_components(
            w,
            &value.rotation.to_array(),
            dirty,
            Self::ROTATION_OFFSET,
            self.precision,
            QUAT_SHORT_SCALE,
        );
        write_components(
            w,
            &value.scale.to_array(),
            dirty,
            Self::SCALE_OFFSET,
            self.precision,
            SHORT_FLOAT_SCALE,
        );
    }
}

impl DiffParser<Transform> for TransformCodec {
    fn dirty_bits_size(&self) -> usize {
        VEC3_BITS + QUAT_BITS + VEC3_BITS
    }

    fn parse(&self, r: &mut BinaryReader<'_>) -> Result<Transform, CodecError> {
        self.parse_diff(Transform::default(), r, None)
    }

    fn parse_diff(
        &self,
        current: Transform,
        r: &mut BinaryReader<'_>,
        dirty: Option<&DirtyBits>,
    ) -> Result<Transform, CodecError> {
        let mut position = current.position.to_array();
        let mut rotation = current.rotation.to_array();
        let mut scale = current.scale.to_array();
        read_components(r, &mut position, dirty, 0, self.precision, SHORT_FLOAT_SCALE)?;
        read_components(
            r,
            &mut rotation,
            dirty,
            Self::ROTATION_OFFSET,
            self.precision,
            QUAT_SHORT_SCALE,
        )?;
        read_components(
            r,
            &mut scale,
            dirty,
            Self::SCALE_OFFSET,
            self.precision,
            SHORT_FLOAT_SCALE,
        )?;
        Ok(Transform {
            position: Vec3::from_array(position),
            rotation: Quat::from_array(rotation),
            scale: Vec3::from_array(scale),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::diff::{read_delta, write_delta};

    fn sample() -> Transform {
        Transform {
            position: Vec3::new(1.5, -2.25, 10.0),
            rotation: Quat::from_rotation_y(0.5),
            scale: Vec3::new(1.0, 2.0, 1.0),
        }
    }

    #[test]
    fn compare_identical_clears_all_bits() {
        let t = sample();
        let codec = TransformCodec::FULL;
        let mut bits = DirtyBits::all_set(DiffSerializer::dirty_bits_size(&codec));
        codec.compare(&t, &t, &mut bits);
        assert!(!bits.any());

        let mut w = BinaryWriter::new();
        codec.serialize_diff(&t, &mut w, Some(&bits));
        assert!(w.is_empty());

        let parsed = codec
            .parse_diff(t, &mut BinaryReader::new(w.as_slice()), Some(&bits))
            .unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn compare_ignores_changes_below_epsilon() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(1.0 + 1e-6, 2.5, 3.0);
        let mut bits = DirtyBits::new(3);
        Vec3Codec::FULL.compare(&b, &a, &mut bits);
        assert!(!bits.get(0));
        assert!(bits.get(1));
        assert!(!bits.get(2));
    }

    #[test]
    fn quat_uses_four_bits() {
        let old = Quat::IDENTITY;
        let new = Quat::from_xyzw(0.0, 0.0, 0.6, 0.8);
        let mut bits = DirtyBits::new(DiffSerializer::dirty_bits_size(&QuatCodec::FULL));
        QuatCodec::FULL.compare(&new, &old, &mut bits);
        assert_eq!(bits.len(), 4);
        assert_eq!(bits.count(), 2);
        assert!(bits.get(2) && bits.get(3));
    }

    #[test]
    fn missing_bits_write_every_field() {
        let t = sample();
        let mut full = BinaryWriter::new();
        TransformCodec::FULL.serialize(&t, &mut full);
        assert_eq!(full.len(), 10 * 4);

        let mut short = BinaryWriter::new();
        TransformCodec::SHORT.serialize_diff(&t, &mut short, None);
        assert_eq!(short.len(), 10 * 2);

        let parsed = TransformCodec::FULL
            .parse(&mut BinaryReader::new(full.as_slice()))
            .unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn delta_only_carries_changed_fields() {
        let old = sample();
        let mut new = old;
        new.position.x += 3.0;
        new.scale.z = 4.0;

        let mut w = BinaryWriter::new();
        let bits = write_delta(&TransformCodec::FULL, &new, &old, &mut w);
        assert_eq!(bits.count(), 2);
        // two bitset bytes plus two f32 fields
        assert_eq!(w.len(), 2 + 2 * 4);

        let applied = read_delta(&TransformCodec::FULL, old, &mut BinaryReader::new(w.as_slice()))
            .unwrap();
        assert_eq!(applied, new);
    }

    #[test]
    fn short_precision_is_lossy_within_quantum() {
        let t = sample();
        let mut w = BinaryWriter::new();
        TransformCodec::SHORT.serialize(&t, &mut w);
        let parsed = TransformCodec::SHORT
            .parse(&mut BinaryReader::new(w.as_slice()))
            .unwrap();
        assert!(parsed.position.abs_diff_eq(t.position, 0.01));
        assert!(parsed.scale.abs_diff_eq(t.scale, 0.01));
        assert!(parsed.rotation.abs_diff_eq(t.rotation, 1e-4));
    }
}

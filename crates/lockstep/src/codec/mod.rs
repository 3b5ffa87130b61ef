mod bits;
mod buffer;
mod diff;
mod math;

pub use bits::DirtyBits;
pub use buffer::{
    decode_short_float, encode_short_float, BinaryReader, BinaryWriter, SHORT_FLOAT_SCALE,
};
pub use diff::{
    float_changed, is_dirty, read_delta, write_delta, DiffParser, DiffSerializer, Precision,
    FLOAT_EPSILON,
};
pub use math::{QuatCodec, Transform, TransformCodec, Vec3Codec};

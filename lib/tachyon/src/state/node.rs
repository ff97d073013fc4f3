use byteorder::{ByteOrder, LittleEndian};
use glam::{Vec3, Vec4};

/// Fixed byte size of `String` / `WideString` node values, expanded and on
/// the wire. Content is nul-terminated inside the buffer.
pub const STRING_SIZE: usize = 64;

/// Closed set of replicable value types. The numeric tags are part of the
/// wire format (`NodeCreate*` packets carry them in one byte).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NodeType {
    Complex = 0,
    Integer = 1,
    Integer4 = 2,
    Float = 3,
    Float2 = 4,
    Float3 = 5,
    Float4 = 6,
    Float4AsByteN4 = 7,
    Float2AsHalf2 = 8,
    Float4AsHalf4 = 9,
    Matrix43 = 10,
    Matrix44 = 11,
    String = 12,
    WideString = 13,
    Float3Delta = 14,
    Float3AsHalf4Delta = 15,
    Float4AsHalf4Delta = 16,
    Float3AsQwordDelta = 17,
    PredictFloat3 = 18,
    PredictQuaternion = 19,
    Blob = 20,
}

impl NodeType {
    pub fn from_u8(tag: u8) -> Option<NodeType> {
        use self::NodeType::*;
        Some(match tag {
            0 => Complex,
            1 => Integer,
            2 => Integer4,
            3 => Float,
            4 => Float2,
            5 => Float3,
            6 => Float4,
            7 => Float4AsByteN4,
            8 => Float2AsHalf2,
            9 => Float4AsHalf4,
            10 => Matrix43,
            11 => Matrix44,
            12 => String,
            13 => WideString,
            14 => Float3Delta,
            15 => Float3AsHalf4Delta,
            16 => Float4AsHalf4Delta,
            17 => Float3AsQwordDelta,
            18 => PredictFloat3,
            19 => PredictQuaternion,
            20 => Blob,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_complex(self) -> bool {
        self == NodeType::Complex
    }

    /// Delta types decode as filter events and participate in the
    /// sticky-change re-broadcast.
    #[inline]
    pub fn is_delta(self) -> bool {
        matches!(
            self,
            NodeType::Float3Delta
                | NodeType::Float3AsHalf4Delta
                | NodeType::Float4AsHalf4Delta
                | NodeType::Float3AsQwordDelta
        )
    }

    #[inline]
    pub fn is_predict(self) -> bool {
        matches!(self, NodeType::PredictFloat3 | NodeType::PredictQuaternion)
    }

    /// Types whose decode drives a temporal filter instead of a plain store.
    #[inline]
    pub fn is_filtered(self) -> bool {
        self.is_delta() || self.is_predict()
    }

    /// Local (expanded) value size in bytes. Filter bookkeeping lives in the
    /// tree node, so the expanded form of delta/predict types is the raw
    /// sample itself.
    pub fn expanded_size(self) -> usize {
        use self::NodeType::*;
        match self {
            Complex | Blob => 0,
            Integer | Float => 4,
            Float2 | Float2AsHalf2 => 8,
            Float3 | Float3Delta | Float3AsHalf4Delta | Float3AsQwordDelta | PredictFloat3 => 12,
            Integer4 | Float4 | Float4AsByteN4 | Float4AsHalf4 | Float4AsHalf4Delta
            | PredictQuaternion => 16,
            Matrix43 => 48,
            Matrix44 => 64,
            String | WideString => STRING_SIZE,
        }
    }

    /// Wire (storage) value size in bytes. Zero means dynamic (`Blob`) or
    /// absent (`Complex`).
    pub fn storage_size(self) -> usize {
        use self::NodeType::*;
        match self {
            Float4AsByteN4 | Float2AsHalf2 => 4,
            Float4AsHalf4 | Float4AsHalf4Delta | Float3AsHalf4Delta | Float3AsQwordDelta
            | PredictQuaternion => 8,
            _ => self.expanded_size(),
        }
    }
}

// --- scalar packings -------------------------------------------------------

/// IEEE 754 binary16 conversion, round-to-nearest-even.
pub fn f32_to_half(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = (bits >> 16) & 0x8000;
    let exp_bits = (bits >> 23) & 0xFF;
    let mantissa = bits & 0x007F_FFFF;

    if exp_bits == 0xFF {
        let payload = if mantissa != 0 { 0x0200 } else { 0 };
        return (sign | 0x7C00 | payload) as u16;
    }

    let exp = exp_bits as i32 - 127 + 15;

    if exp >= 0x1F {
        return (sign | 0x7C00) as u16;
    }

    if exp <= 0 {
        if exp < -10 {
            return sign as u16;
        }
        let m = mantissa | 0x0080_0000;
        let shift = (14 - exp) as u32;
        let half_man = m >> shift;
        let round_bit = 1u32 << (shift - 1);
        if (m & round_bit) != 0 && ((m & (round_bit - 1)) != 0 || (half_man & 1) == 1) {
            return (sign | (half_man + 1)) as u16;
        }
        return (sign | half_man) as u16;
    }

    let half_man = mantissa >> 13;
    let mut result = sign | ((exp as u32) << 10) | half_man;
    let round = mantissa & 0x1FFF;
    if round > 0x1000 || (round == 0x1000 && (half_man & 1) == 1) {
        result += 1;
    }
    result as u16
}

pub fn half_to_f32(value: u16) -> f32 {
    let exp = (value >> 10) & 0x1F;
    let mantissa = value & 0x03FF;
    let negative = value & 0x8000 != 0;

    match exp {
        0 => {
            // Subnormal: mantissa * 2^-24.
            let magnitude = f32::from(mantissa) * (1.0 / 16_777_216.0);
            if negative {
                -magnitude
            } else {
                magnitude
            }
        }
        0x1F => {
            if mantissa != 0 {
                std::f32::NAN
            } else if negative {
                std::f32::NEG_INFINITY
            } else {
                std::f32::INFINITY
            }
        }
        _ => {
            let bits = (u32::from(value & 0x8000) << 16)
                | ((u32::from(exp) + 112) << 23)
                | (u32::from(mantissa) << 13);
            f32::from_bits(bits)
        }
    }
}

#[inline]
fn f32_to_snorm8(value: f32) -> i8 {
    (value.max(-1.0).min(1.0) * 127.0).round() as i8
}

#[inline]
fn snorm8_to_f32(value: i8) -> f32 {
    (f32::from(value) / 127.0).max(-1.0)
}

/// Three fixed-point signed integers packed into one 64-bit word:
/// X in bits 0..22, Z in bits 22..44, Y in bits 44..64; one unit = 0.001.
pub fn pack_qword(v: Vec3) -> u64 {
    let x = (v.x * 1000.0) as i64;
    let y = (v.y * 1000.0) as i64;
    let z = (v.z * 1000.0) as i64;

    ((x as u64) & 0x003F_FFFF) | (((z as u64) & 0x003F_FFFF) << 22) | (((y as u64) & 0x000F_FFFF) << 44)
}

pub fn unpack_qword(word: u64) -> Vec3 {
    #[inline]
    fn sign_extend(value: u64, bits: u32) -> i64 {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }

    let x = sign_extend(word & 0x003F_FFFF, 22);
    let z = sign_extend((word >> 22) & 0x003F_FFFF, 22);
    let y = sign_extend((word >> 44) & 0x000F_FFFF, 20);

    Vec3::new(x as f32, y as f32, z as f32) * 0.001
}

// --- expanded-layout helpers ----------------------------------------------

#[inline]
pub fn read_vec3(buf: &[u8]) -> Vec3 {
    Vec3::new(
        LittleEndian::read_f32(&buf[0..]),
        LittleEndian::read_f32(&buf[4..]),
        LittleEndian::read_f32(&buf[8..]),
    )
}

#[inline]
pub fn write_vec3(buf: &mut [u8], v: Vec3) {
    LittleEndian::write_f32(&mut buf[0..], v.x);
    LittleEndian::write_f32(&mut buf[4..], v.y);
    LittleEndian::write_f32(&mut buf[8..], v.z);
}

#[inline]
pub fn read_vec4(buf: &[u8]) -> Vec4 {
    Vec4::new(
        LittleEndian::read_f32(&buf[0..]),
        LittleEndian::read_f32(&buf[4..]),
        LittleEndian::read_f32(&buf[8..]),
        LittleEndian::read_f32(&buf[12..]),
    )
}

#[inline]
pub fn write_vec4(buf: &mut [u8], v: Vec4) {
    LittleEndian::write_f32(&mut buf[0..], v.x);
    LittleEndian::write_f32(&mut buf[4..], v.y);
    LittleEndian::write_f32(&mut buf[8..], v.z);
    LittleEndian::write_f32(&mut buf[12..], v.w);
}

// --- storage codec ---------------------------------------------------------

fn write_half4(buf: &mut [u8], v: Vec4) {
    LittleEndian::write_u16(&mut buf[0..], f32_to_half(v.x));
    LittleEndian::write_u16(&mut buf[2..], f32_to_half(v.y));
    LittleEndian::write_u16(&mut buf[4..], f32_to_half(v.z));
    LittleEndian::write_u16(&mut buf[6..], f32_to_half(v.w));
}

fn read_half4(buf: &[u8]) -> Vec4 {
    Vec4::new(
        half_to_f32(LittleEndian::read_u16(&buf[0..])),
        half_to_f32(LittleEndian::read_u16(&buf[2..])),
        half_to_f32(LittleEndian::read_u16(&buf[4..])),
        half_to_f32(LittleEndian::read_u16(&buf[6..])),
    )
}

/// Converts an expanded value into its storage (wire) form. `expanded` must
/// hold `node_type.expanded_size()` bytes and `storage` must hold
/// `node_type.storage_size()` bytes.
pub fn encode(node_type: NodeType, expanded: &[u8], storage: &mut [u8]) {
    use self::NodeType::*;
    match node_type {
        Float4AsByteN4 => {
            let v = read_vec4(expanded);
            storage[0] = f32_to_snorm8(v.x) as u8;
            storage[1] = f32_to_snorm8(v.y) as u8;
            storage[2] = f32_to_snorm8(v.z) as u8;
            storage[3] = f32_to_snorm8(v.w) as u8;
        }
        Float2AsHalf2 => {
            LittleEndian::write_u16(&mut storage[0..], f32_to_half(LittleEndian::read_f32(&expanded[0..])));
            LittleEndian::write_u16(&mut storage[2..], f32_to_half(LittleEndian::read_f32(&expanded[4..])));
        }
        Float4AsHalf4 | Float4AsHalf4Delta | PredictQuaternion => {
            write_half4(storage, read_vec4(expanded));
        }
        Float3AsHalf4Delta => {
            write_half4(storage, read_vec3(expanded).extend(0.0));
        }
        Float3AsQwordDelta => {
            LittleEndian::write_u64(storage, pack_qword(read_vec3(expanded)));
        }
        Complex => {}
        _ => {
            debug_assert_eq!(node_type.storage_size(), node_type.expanded_size());
            let size = node_type.storage_size().min(expanded.len()).min(storage.len());
            storage[..size].copy_from_slice(&expanded[..size]);
        }
    }
}

/// Converts storage bytes back into the expanded layout. Filtered types are
/// decoded by the tree through [`storage_to_vec3`] / [`storage_to_vec4`]
/// instead, because their decode is a filter event rather than a store.
pub fn decode(node_type: NodeType, storage: &[u8], expanded: &mut [u8]) {
    use self::NodeType::*;
    match node_type {
        Float4AsByteN4 => {
            let v = Vec4::new(
                snorm8_to_f32(storage[0] as i8),
                snorm8_to_f32(storage[1] as i8),
                snorm8_to_f32(storage[2] as i8),
                snorm8_to_f32(storage[3] as i8),
            );
            write_vec4(expanded, v);
        }
        Float2AsHalf2 => {
            LittleEndian::write_f32(&mut expanded[0..], half_to_f32(LittleEndian::read_u16(&storage[0..])));
            LittleEndian::write_f32(&mut expanded[4..], half_to_f32(LittleEndian::read_u16(&storage[2..])));
        }
        Float4AsHalf4 | Float4AsHalf4Delta | PredictQuaternion => {
            write_vec4(expanded, read_half4(storage));
        }
        Float3AsHalf4Delta => {
            write_vec3(expanded, read_half4(storage).truncate());
        }
        Float3AsQwordDelta => {
            write_vec3(expanded, unpack_qword(LittleEndian::read_u64(storage)));
        }
        Complex => {}
        _ => {
            debug_assert_eq!(node_type.storage_size(), node_type.expanded_size());
            let size = node_type.expanded_size().min(expanded.len()).min(storage.len());
            expanded[..size].copy_from_slice(&storage[..size]);
        }
    }
}

/// Parses the storage form of a three-component filtered type.
pub fn storage_to_vec3(node_type: NodeType, storage: &[u8]) -> Vec3 {
    use self::NodeType::*;
    match node_type {
        Float3AsHalf4Delta => read_half4(storage).truncate(),
        Float3AsQwordDelta => unpack_qword(LittleEndian::read_u64(storage)),
        _ => read_vec3(storage),
    }
}

/// Parses the storage form of a four-component filtered type.
pub fn storage_to_vec4(node_type: NodeType, storage: &[u8]) -> Vec4 {
    use self::NodeType::*;
    match node_type {
        Float4AsHalf4 | Float4AsHalf4Delta | PredictQuaternion => read_half4(storage),
        Float4AsByteN4 => Vec4::new(
            snorm8_to_f32(storage[0] as i8),
            snorm8_to_f32(storage[1] as i8),
            snorm8_to_f32(storage[2] as i8),
            snorm8_to_f32(storage[3] as i8),
        ),
        _ => read_vec4(storage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_roundtrip() {
        for tag in 0..=20u8 {
            let node_type = NodeType::from_u8(tag).unwrap();
            assert_eq!(node_type as u8, tag);
        }
        assert!(NodeType::from_u8(21).is_none());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(NodeType::Float3.expanded_size(), 12);
        assert_eq!(NodeType::Float3.storage_size(), 12);
        assert_eq!(NodeType::Float4AsByteN4.storage_size(), 4);
        assert_eq!(NodeType::Float2AsHalf2.storage_size(), 4);
        assert_eq!(NodeType::Float4AsHalf4Delta.storage_size(), 8);
        assert_eq!(NodeType::Float3AsQwordDelta.storage_size(), 8);
        assert_eq!(NodeType::Matrix44.expanded_size(), 64);
        assert_eq!(NodeType::String.storage_size(), STRING_SIZE);
        assert_eq!(NodeType::PredictQuaternion.expanded_size(), 16);
        assert_eq!(NodeType::PredictQuaternion.storage_size(), 8);
    }

    #[test]
    fn test_half_roundtrip() {
        for &value in &[0.0f32, 1.0, -1.0, 0.5, -2.75, 1024.0, 65504.0, -65504.0] {
            assert_eq!(half_to_f32(f32_to_half(value)), value);
        }
    }

    #[test]
    fn test_half_overflow_is_infinite() {
        assert_eq!(half_to_f32(f32_to_half(100_000.0)), std::f32::INFINITY);
        assert_eq!(half_to_f32(f32_to_half(-100_000.0)), std::f32::NEG_INFINITY);
    }

    #[test]
    fn test_half_subnormal() {
        let tiny = 3.0e-5f32;
        let back = half_to_f32(f32_to_half(tiny));
        assert!((back - tiny).abs() < 1.0e-6);
    }

    #[test]
    fn test_half_precision() {
        let value = 3.141_592_7f32;
        let back = half_to_f32(f32_to_half(value));
        assert!((back - value).abs() < 2.0e-3);
    }

    #[test]
    fn test_snorm_roundtrip() {
        assert_eq!(snorm8_to_f32(f32_to_snorm8(1.0)), 1.0);
        assert_eq!(snorm8_to_f32(f32_to_snorm8(-1.0)), -1.0);
        assert_eq!(snorm8_to_f32(f32_to_snorm8(0.0)), 0.0);
        // Out of range input clamps.
        assert_eq!(snorm8_to_f32(f32_to_snorm8(2.0)), 1.0);
    }

    #[test]
    fn test_qword_roundtrip() {
        let v = Vec3::new(123.456, -78.9, 2000.001);
        let back = unpack_qword(pack_qword(v));

        assert!((back.x - v.x).abs() < 0.001);
        assert!((back.y - v.y).abs() < 0.001);
        assert!((back.z - v.z).abs() < 0.0015);
    }

    #[test]
    fn test_qword_negative_extremes() {
        // 22-bit field: +/- 2^21 units of 0.001 => about +/- 2097 world units.
        let v = Vec3::new(-2000.0, -500.0, 2000.0);
        let back = unpack_qword(pack_qword(v));

        assert!((back.x - v.x).abs() < 0.001);
        assert!((back.y - v.y).abs() < 0.001);
        assert!((back.z - v.z).abs() < 0.001);
    }

    #[test]
    fn test_encode_decode_byten4() {
        let mut expanded = [0u8; 16];
        write_vec4(&mut expanded, Vec4::new(0.0, 1.0, -1.0, 0.5));

        let mut storage = [0u8; 4];
        encode(NodeType::Float4AsByteN4, &expanded, &mut storage);

        let mut decoded = [0u8; 16];
        decode(NodeType::Float4AsByteN4, &storage, &mut decoded);

        let v = read_vec4(&decoded);
        assert!((v.x - 0.0).abs() < 0.01);
        assert!((v.y - 1.0).abs() < 0.01);
        assert!((v.z + 1.0).abs() < 0.01);
        assert!((v.w - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_encode_decode_half4_delta() {
        let mut expanded = [0u8; 16];
        write_vec4(&mut expanded, Vec4::new(1.5, -2.25, 100.0, 0.125));

        let mut storage = [0u8; 8];
        encode(NodeType::Float4AsHalf4Delta, &expanded, &mut storage);

        assert_eq!(storage_to_vec4(NodeType::Float4AsHalf4Delta, &storage), Vec4::new(1.5, -2.25, 100.0, 0.125));
    }

    #[test]
    fn test_encode_decode_qword_delta() {
        let mut expanded = [0u8; 12];
        write_vec3(&mut expanded, Vec3::new(10.0, 0.0, -3.5));

        let mut storage = [0u8; 8];
        encode(NodeType::Float3AsQwordDelta, &expanded, &mut storage);

        let v = storage_to_vec3(NodeType::Float3AsQwordDelta, &storage);
        assert!((v.x - 10.0).abs() < 0.001);
        assert!(v.y.abs() < 0.001);
        assert!((v.z + 3.5).abs() < 0.001);
    }

    #[test]
    fn test_encode_identity_types() {
        let mut expanded = [0u8; 12];
        write_vec3(&mut expanded, Vec3::new(1.0, 2.0, 3.0));

        let mut storage = [0u8; 12];
        encode(NodeType::Float3, &expanded, &mut storage);
        assert_eq!(&storage[..], &expanded[..]);

        let mut back = [0u8; 12];
        decode(NodeType::Float3, &storage, &mut back);
        assert_eq!(&back[..], &expanded[..]);
    }
}

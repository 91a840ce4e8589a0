// shared.rs - vector math, byte order access and text tokenization
// shared between the loaders and the renderer front-end.

pub type Vec2 = [f32; 2];
pub type Vec3 = [f32; 3];
pub type Vec4 = [f32; 4];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

pub const MAX_QPATH: usize = 64;

pub const MAX_TOKEN_CHARS: usize = 128;

// ============================================================
// MATHLIB - Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vector_negate(v: &Vec3) -> Vec3 {
    [-v[0], -v[1], -v[2]]
}

/// veca + scale * vecb
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

pub fn add_point_to_bounds(v: &Vec3, mins: &mut Vec3, maxs: &mut Vec3) {
    for i in 0..3 {
        if v[i] < mins[i] {
            mins[i] = v[i];
        }
        if v[i] > maxs[i] {
            maxs[i] = v[i];
        }
    }
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn vector_length(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

/// Radius of the sphere centered at the origin guaranteed to contain the box.
pub fn radius_from_bounds(mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut corner = [0.0f32; 3];
    for i in 0..3 {
        corner[i] = mins[i].abs().max(maxs[i].abs());
    }
    vector_length(&corner)
}

/// Derive the tangent and bitangent for a surface basis. The texture
/// directional vector is projected onto the plane of `normal`; sidedness is
/// encoded in the tangent's w component.
pub fn tangent_vectors(normal: &Vec3, sdir: &Vec4, tdir: &Vec4) -> (Vec4, Vec3) {
    let mut s = [sdir[0], sdir[1], sdir[2]];
    vector_normalize(&mut s);

    let mut t = [tdir[0], tdir[1], tdir[2]];
    vector_normalize(&mut t);

    let mut tan3 = vector_ma(&s, -dot_product(&s, normal), normal);
    vector_normalize(&mut tan3);

    let mut bitangent = cross_product(normal, &tan3);

    let w = if dot_product(&t, &bitangent) < 0.0 {
        -1.0
    } else {
        1.0
    };
    bitangent = vector_scale(&bitangent, w);

    ([tan3[0], tan3[1], tan3[2], w], bitangent)
}

// ============================================================
// Collision plane
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8, // for fast side tests
    pub signbits: u8,   // signx + (signy << 1) + (signz << 2)
    pub pad: [u8; 2],
}

impl Default for CPlane {
    fn default() -> Self {
        Self {
            normal: [0.0; 3],
            dist: 0.0,
            plane_type: 0,
            signbits: 0,
            pad: [0; 2],
        }
    }
}

// ============================================================
// Byte order functions
// ============================================================

// On modern hardware we target little-endian. These are identity on LE,
// byte-swap on BE. Rust's native endian conversion handles this.

#[inline]
pub fn little_short(l: i16) -> i16 {
    i16::from_le(l)
}

#[inline]
pub fn little_long(l: i32) -> i32 {
    i32::from_le(l)
}

#[inline]
pub fn little_float(l: f32) -> f32 {
    f32::from_bits(u32::from_le(l.to_bits()))
}

// Little-endian readers over raw lump bytes. Callers index within a record
// slice of known stride, so the fixed offsets are always in bounds.

#[inline]
pub fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn read_vec3_le(data: &[u8], offset: usize) -> Vec3 {
    [
        read_f32_le(data, offset),
        read_f32_le(data, offset + 4),
        read_f32_le(data, offset + 8),
    ]
}

// ============================================================
// Token parser (COM_Parse equivalent)
// ============================================================

/// Parse one whitespace-delimited token from `data`, handling // comments
/// and "quoted strings". Returns `(token, remaining)` or `(token, None)`
/// if end of data.
pub fn com_parse(data: &str) -> (String, Option<&str>) {
    let mut chars = data.as_bytes();
    let mut token = String::new();

    // skip whitespace
    loop {
        while !chars.is_empty() && chars[0] <= b' ' {
            if chars[0] == 0 {
                return (String::new(), None);
            }
            chars = &chars[1..];
        }
        if chars.is_empty() {
            return (String::new(), None);
        }

        // skip // comments
        if chars.len() >= 2 && chars[0] == b'/' && chars[1] == b'/' {
            while !chars.is_empty() && chars[0] != b'\n' {
                chars = &chars[1..];
            }
            continue;
        }
        break;
    }

    // handle quoted strings
    if chars[0] == b'"' {
        chars = &chars[1..];
        while !chars.is_empty() && chars[0] != b'"' {
            if token.len() < MAX_TOKEN_CHARS {
                token.push(chars[0] as char);
            }
            chars = &chars[1..];
        }
        if !chars.is_empty() {
            chars = &chars[1..]; // skip closing quote
        }
        let offset = data.len() - chars.len();
        let remaining = if chars.is_empty() {
            None
        } else {
            Some(&data[offset..])
        };
        return (token, remaining);
    }

    // parse regular word
    while !chars.is_empty() && chars[0] > b' ' {
        if token.len() < MAX_TOKEN_CHARS {
            token.push(chars[0] as char);
        }
        chars = &chars[1..];
    }
    if token.len() >= MAX_TOKEN_CHARS {
        token.clear();
    }

    let offset = data.len() - chars.len();
    let remaining = if chars.is_empty() {
        None
    } else {
        Some(&data[offset..])
    };
    (token, remaining)
}

/// Scan free-form entity text for the first occurrence of `key` and return
/// the token following it. Entity text is designer-authored, so a miss or a
/// malformed value is an expected outcome, not an error.
pub fn entity_value(ents: &str, key: &str) -> Option<String> {
    let mut data = Some(ents);
    while let Some(rest) = data {
        let (token, next) = com_parse(rest);
        if token.is_empty() && next.is_none() {
            break;
        }
        if token == key {
            let (value, _) = com_parse(next?);
            if value.is_empty() {
                return None;
            }
            return Some(value);
        }
        data = next;
    }
    None
}

/// Parse "x y z" from designer text. Trailing tokens are ignored, like the
/// sscanf the original format grew up with.
pub fn parse_vec3(s: &str) -> Option<Vec3> {
    let mut it = s.split_whitespace();
    let x = it.next()?.parse().ok()?;
    let y = it.next()?.parse().ok()?;
    let z = it.next()?.parse().ok()?;
    Some([x, y, z])
}

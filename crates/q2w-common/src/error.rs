// error.rs - fatal map-load conditions.
// Every failure aborts the whole load; there is no partial-success mode.

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BspError {
    /// File smaller than the fixed header.
    ShortFile { len: usize },
    /// Magic bytes are not "IBSP".
    BadIdent { ident: i32 },
    /// Version tag matches neither supported format.
    BadVersion { version: i32 },
    /// Lump descriptor points outside the file.
    LumpOutOfRange {
        lump: &'static str,
        ofs: i32,
        len: i32,
    },
    /// Lump byte length is not a multiple of its record stride.
    FunnyLumpSize {
        lump: &'static str,
        len: usize,
        stride: usize,
    },
    /// A required lump has no records.
    EmptyLump { lump: &'static str },
    /// A lump exceeds its fixed maximum record count.
    TooManyRecords {
        lump: &'static str,
        count: usize,
        max: usize,
    },
    /// A cross-table index falls outside its table.
    BadIndex {
        what: &'static str,
        index: i64,
        max: usize,
    },
    /// Enhanced-format normals must pair one-to-one with vertexes.
    NormalCountMismatch { normals: usize, vertexes: usize },
    /// A surface's texture-space extents came out non-positive.
    BadSurfaceExtents { smax: i32, tmax: i32 },
    /// A surface's lightmap exceeds the atlas block.
    LightmapOversize { width: u32, height: u32, block: u32 },
    /// A world model is already active.
    WorldLoaded { name: String },
    /// Inline model lookup with a malformed or out-of-range "*N" name.
    BadInlineModel { name: String },
}

impl fmt::Display for BspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BspError::ShortFile { len } => {
                write!(f, "file too short for bsp header ({} bytes)", len)
            }
            BspError::BadIdent { ident } => {
                write!(f, "bad bsp ident: 0x{:08x}", ident)
            }
            BspError::BadVersion { version } => {
                write!(f, "unsupported bsp version: {}", version)
            }
            BspError::LumpOutOfRange { lump, ofs, len } => {
                write!(f, "{} lump out of range ({} + {})", lump, ofs, len)
            }
            BspError::FunnyLumpSize { lump, len, stride } => {
                write!(f, "funny lump size in {} ({} % {})", lump, len, stride)
            }
            BspError::EmptyLump { lump } => {
                write!(f, "map with no {}", lump)
            }
            BspError::TooManyRecords { lump, count, max } => {
                write!(f, "map has too many {} ({} > {})", lump, count, max)
            }
            BspError::BadIndex { what, index, max } => {
                write!(f, "bad {} number: {} (of {})", what, index, max)
            }
            BspError::NormalCountMismatch { normals, vertexes } => {
                write!(
                    f,
                    "normal count {} does not match vertex count {}",
                    normals, vertexes
                )
            }
            BspError::BadSurfaceExtents { smax, tmax } => {
                write!(f, "bad surface extents: {}x{}", smax, tmax)
            }
            BspError::LightmapOversize {
                width,
                height,
                block,
            } => {
                write!(
                    f,
                    "surface lightmap {}x{} exceeds {}x{} block",
                    width, height, block, block
                )
            }
            BspError::WorldLoaded { name } => {
                write!(f, "loaded bsp model {} after world", name)
            }
            BspError::BadInlineModel { name } => {
                write!(f, "bad inline model name: {}", name)
            }
        }
    }
}

impl Error for BspError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_funny_lump_size() {
        let e = BspError::FunnyLumpSize {
            lump: "vertexes",
            len: 13,
            stride: 12,
        };
        assert_eq!(e.to_string(), "funny lump size in vertexes (13 % 12)");
    }

    #[test]
    fn test_display_bad_index() {
        let e = BspError::BadIndex {
            what: "texinfo",
            index: 9,
            max: 4,
        };
        assert_eq!(e.to_string(), "bad texinfo number: 9 (of 4)");
    }

    #[test]
    fn test_error_trait_object() {
        let e: Box<dyn Error> = Box::new(BspError::BadVersion { version: 40 });
        assert!(e.to_string().contains("40"));
    }
}

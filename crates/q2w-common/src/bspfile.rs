// bspfile.rs - on-disk BSP format.
// d* structures mirror the little-endian file layout byte for byte; they are
// parsed field-by-field from lump slices, never transmuted.

use bitflags::bitflags;

use crate::error::BspError;
use crate::shared::read_i32_le;

pub const IDBSPHEADER: i32 =
    (b'P' as i32) << 24 | (b'S' as i32) << 16 | (b'B' as i32) << 8 | b'I' as i32;

/// Legacy format.
pub const BSP_VERSION: i32 = 38;
/// Enhanced format; adds the per-vertex normals lump.
pub const BSP_VERSION_ENHANCED: i32 = 69;

// Upper bounds for structural validation.
pub const MAX_BSP_MODELS: usize = 1024;
pub const MAX_BSP_ENTSTRING: usize = 0x40000;
pub const MAX_BSP_TEXINFO: usize = 8192;
pub const MAX_BSP_PLANES: usize = 65536;
pub const MAX_BSP_NODES: usize = 65536;
pub const MAX_BSP_LEAFS: usize = 65536;
pub const MAX_BSP_VERTS: usize = 65536;
pub const MAX_BSP_FACES: usize = 65536;
pub const MAX_BSP_LEAFFACES: usize = 65536;
pub const MAX_BSP_EDGES: usize = 128000;
pub const MAX_BSP_SURFEDGES: usize = 256000;
pub const MAX_BSP_LIGHTING: usize = 0x2000000;
pub const MAX_BSP_VISIBILITY: usize = 0x280000;

pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_PLANES: usize = 1;
pub const LUMP_VERTEXES: usize = 2;
pub const LUMP_VISIBILITY: usize = 3;
pub const LUMP_NODES: usize = 4;
pub const LUMP_TEXINFO: usize = 5;
pub const LUMP_FACES: usize = 6;
pub const LUMP_LIGHTING: usize = 7;
pub const LUMP_LEAFS: usize = 8;
pub const LUMP_LEAFFACES: usize = 9;
pub const LUMP_LEAFBRUSHES: usize = 10;
pub const LUMP_EDGES: usize = 11;
pub const LUMP_SURFEDGES: usize = 12;
pub const LUMP_MODELS: usize = 13;
pub const LUMP_BRUSHES: usize = 14;
pub const LUMP_BRUSHSIDES: usize = 15;
pub const LUMP_POP: usize = 16;
pub const LUMP_AREAS: usize = 17;
pub const LUMP_AREAPORTALS: usize = 18;
/// Enhanced format only.
pub const LUMP_NORMALS: usize = 19;

pub const HEADER_LUMPS: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct DBspLump {
    pub fileofs: i32,
    pub filelen: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct DBspHeader {
    pub ident: i32,
    pub version: i32,
    pub lumps: [DBspLump; HEADER_LUMPS],
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspModel {
    pub mins: [f32; 3],
    pub maxs: [f32; 3],
    pub origin: [f32; 3],
    pub headnode: i32,
    pub firstface: i32,
    pub numfaces: i32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspVertex {
    pub point: [f32; 3],
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspNormal {
    pub normal: [f32; 3],
}

// Plane types
pub const PLANE_X: i32 = 0;
pub const PLANE_Y: i32 = 1;
pub const PLANE_Z: i32 = 2;
pub const PLANE_ANYX: i32 = 3;
pub const PLANE_ANYY: i32 = 4;
pub const PLANE_ANYZ: i32 = 5;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspPlane {
    pub normal: [f32; 3],
    pub dist: f32,
    pub plane_type: i32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspNode {
    pub planenum: i32,
    pub children: [i32; 2], // negative numbers are -(leafs+1), not nodes
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstface: u16,
    pub numfaces: u16,
}

#[derive(Debug, Clone)]
#[repr(C)]
pub struct DBspTexinfo {
    pub vecs: [[f32; 4]; 2], // [s/t][xyz offset]
    pub flags: i32,
    pub value: i32,
    pub texture: [u8; 32],
    pub nexttexinfo: i32, // animation chains, unused here
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspEdge {
    pub v: [u16; 2], // vertex numbers
}

pub const MAXLIGHTMAPS: usize = 4;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspFace {
    pub planenum: u16,
    pub side: i16,
    pub firstedge: i32, // must support > 64k edges
    pub numedges: i16,
    pub texinfo: i16,
    pub styles: [u8; MAXLIGHTMAPS],
    pub lightofs: i32, // start of samples, or -1
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspLeaf {
    pub contents: i32,
    pub cluster: i16,
    pub area: i16,
    pub mins: [i16; 3],
    pub maxs: [i16; 3],
    pub firstleafface: u16,
    pub numleaffaces: u16,
    pub firstleafbrush: u16,
    pub numleafbrushes: u16,
}

pub const DVIS_PVS: usize = 0;
pub const DVIS_PHS: usize = 1;

/// Visibility lump header (variable length).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DBspVis {
    pub numclusters: i32,
    pub bitofs: [[i32; 2]; 1], // variable sized: [numclusters][2]
}

bitflags! {
    /// Texinfo surface bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SurfaceFlags: i32 {
        const LIGHT = 0x1; // value will hold the light strength
        const SLICK = 0x2;
        const SKY = 0x4;
        const WARP = 0x8;
        const BLEND33 = 0x10;
        const BLEND66 = 0x20;
        const FLOWING = 0x40;
        const NODRAW = 0x80;
        const HINT = 0x100;
        const SKIP = 0x200;
        const ALPHATEST = 0x400;
        const PHONG = 0x800;
    }
}

bitflags! {
    /// Leaf content bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContentsFlags: i32 {
        const SOLID = 0x1;
        const WINDOW = 0x2;
        const AUX = 0x4;
        const LAVA = 0x8;
        const SLIME = 0x10;
        const WATER = 0x20;
        const MIST = 0x40;
    }
}

impl DBspHeader {
    /// Read the fixed header off the front of a map file.
    pub fn parse(file: &[u8]) -> Result<DBspHeader, BspError> {
        if file.len() < std::mem::size_of::<DBspHeader>() {
            return Err(BspError::ShortFile { len: file.len() });
        }

        let ident = read_i32_le(file, 0);
        let version = read_i32_le(file, 4);

        let mut lumps = [DBspLump::default(); HEADER_LUMPS];
        for (i, lump) in lumps.iter_mut().enumerate() {
            let ofs = 8 + i * std::mem::size_of::<DBspLump>();
            lump.fileofs = read_i32_le(file, ofs);
            lump.filelen = read_i32_le(file, ofs + 4);
        }

        Ok(DBspHeader {
            ident,
            version,
            lumps,
        })
    }
}

impl DBspLump {
    /// Slice the lump's bytes out of the file.
    pub fn data<'a>(&self, file: &'a [u8], lump: &'static str) -> Result<&'a [u8], BspError> {
        let ofs = self.fileofs;
        let len = self.filelen;
        if ofs < 0 || len < 0 {
            return Err(BspError::LumpOutOfRange { lump, ofs, len });
        }
        let (ofs, len) = (ofs as usize, len as usize);
        match ofs.checked_add(len) {
            Some(end) if end <= file.len() => Ok(&file[ofs..end]),
            _ => Err(BspError::LumpOutOfRange {
                lump,
                ofs: self.fileofs,
                len: self.filelen,
            }),
        }
    }

    /// Iterate the lump as fixed-stride records, rejecting lengths that are
    /// not an exact multiple of the stride.
    pub fn records<'a>(
        &self,
        file: &'a [u8],
        stride: usize,
        lump: &'static str,
    ) -> Result<std::slice::ChunksExact<'a, u8>, BspError> {
        let data = self.data(file, lump)?;
        if data.len() % stride != 0 {
            return Err(BspError::FunnyLumpSize {
                lump,
                len: data.len(),
                stride,
            });
        }
        Ok(data.chunks_exact(stride))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_ident_magic() {
        assert_eq!(IDBSPHEADER.to_le_bytes(), *b"IBSP");
    }

    #[test]
    fn test_disk_struct_sizes() {
        assert_eq!(size_of::<DBspLump>(), 8);
        assert_eq!(size_of::<DBspHeader>(), 168);
        assert_eq!(size_of::<DBspModel>(), 48);
        assert_eq!(size_of::<DBspVertex>(), 12);
        assert_eq!(size_of::<DBspNormal>(), 12);
        assert_eq!(size_of::<DBspPlane>(), 20);
        assert_eq!(size_of::<DBspNode>(), 28);
        assert_eq!(size_of::<DBspTexinfo>(), 76);
        assert_eq!(size_of::<DBspEdge>(), 4);
        assert_eq!(size_of::<DBspFace>(), 20);
        assert_eq!(size_of::<DBspLeaf>(), 28);
        assert_eq!(size_of::<DBspVis>(), 12);
    }

    #[test]
    fn test_lump_indices() {
        assert_eq!(LUMP_ENTITIES, 0);
        assert_eq!(LUMP_SURFEDGES, 12);
        assert_eq!(LUMP_MODELS, 13);
        assert_eq!(LUMP_NORMALS, 19);
        assert_eq!(HEADER_LUMPS, 20);
    }

    #[test]
    fn test_surface_flags_are_distinct_bits() {
        let all = SurfaceFlags::all().bits();
        let mut seen = 0;
        for flag in SurfaceFlags::all().iter() {
            assert_eq!(seen & flag.bits(), 0);
            seen |= flag.bits();
        }
        assert_eq!(seen, all);
    }

    fn make_header_bytes(ident: i32, version: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ident.to_le_bytes());
        buf.extend_from_slice(&version.to_le_bytes());
        for i in 0..HEADER_LUMPS as i32 {
            buf.extend_from_slice(&(i * 100).to_le_bytes()); // fileofs
            buf.extend_from_slice(&(i * 2).to_le_bytes()); // filelen
        }
        buf
    }

    #[test]
    fn test_header_parse() {
        let buf = make_header_bytes(IDBSPHEADER, BSP_VERSION);
        let header = DBspHeader::parse(&buf).unwrap();
        assert_eq!(header.ident, IDBSPHEADER);
        assert_eq!(header.version, BSP_VERSION);
        assert_eq!(header.lumps[3].fileofs, 300);
        assert_eq!(header.lumps[3].filelen, 6);
    }

    #[test]
    fn test_header_parse_short_file() {
        let buf = vec![0u8; 20];
        assert_eq!(
            DBspHeader::parse(&buf),
            Err(BspError::ShortFile { len: 20 })
        );
    }

    #[test]
    fn test_lump_records_funny_size() {
        let file = vec![0u8; 32];
        let lump = DBspLump {
            fileofs: 0,
            filelen: 13,
        };
        assert_eq!(
            lump.records(&file, 12, "vertexes").unwrap_err(),
            BspError::FunnyLumpSize {
                lump: "vertexes",
                len: 13,
                stride: 12,
            }
        );
    }

    #[test]
    fn test_lump_records_count() {
        let file = vec![0u8; 48];
        let lump = DBspLump {
            fileofs: 12,
            filelen: 36,
        };
        let records = lump.records(&file, 12, "vertexes").unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_lump_out_of_range() {
        let file = vec![0u8; 16];
        let lump = DBspLump {
            fileofs: 8,
            filelen: 12,
        };
        assert!(matches!(
            lump.data(&file, "edges"),
            Err(BspError::LumpOutOfRange { lump: "edges", .. })
        ));
        let negative = DBspLump {
            fileofs: -4,
            filelen: 8,
        };
        assert!(negative.data(&file, "edges").is_err());
    }
}

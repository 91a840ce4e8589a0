// r_model.rs - runtime world model structures, the model registry and
// spatial queries over the loaded tree.
//
// d* structures (bspfile.rs) are on-disk representations; the RBsp*
// structures here are the in-memory form, cross-referenced by index.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use q2w_common::bspfile::ContentsFlags;
use q2w_common::bspfile::SurfaceFlags;
use q2w_common::error::BspError;
use q2w_common::shared::{dot_product, CPlane, Vec2, Vec3, Vec4};

use crate::r_model_bsp::BspLoadContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModType {
    Bsp,
    BspSubmodel,
}

/// A node's child, decoded once at tree build. The raw signed disk index
/// never leaves the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChild {
    Node(usize),
    Leaf(usize),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RBspVertex {
    pub position: Vec3,
    pub normal: Vec3,
    /// Running-average color over all referencing surfaces.
    pub color: Vec4,
    /// Contribution count for the running average.
    pub surfaces: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RBspEdge {
    pub v: [u16; 2],
}

#[derive(Debug, Clone)]
pub struct RBspTexinfo {
    pub vecs: [[f32; 4]; 2],
    pub flags: SurfaceFlags,
    pub value: i32,
    pub name: String,
    /// Handle into the image source.
    pub image: usize,
}

bitflags! {
    /// Runtime surface state, separate from the on-disk texinfo bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MSurfaceFlags: i32 {
        const PLANEBACK = 0x1;
        const LIGHTMAP = 0x2;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RBspSurface {
    pub flags: MSurfaceFlags,

    /// Look up in surfedges; negative entries are backwards edges.
    pub first_edge: i32,
    pub num_edges: i32,

    pub plane: usize,
    /// Shading normal; the plane's, negated when PLANEBACK.
    pub normal: Vec3,

    pub texinfo: usize,

    pub mins: Vec3,
    pub maxs: Vec3,
    pub center: Vec3,

    // texture-space bounds, snapped to the lightmap texel grid
    pub st_mins: Vec2,
    pub st_maxs: Vec2,
    pub st_center: Vec2,
    pub st_extents: Vec2,

    // lightmap atlas placement
    pub light_s: i32,
    pub light_t: i32,
    pub lightmap_page: usize,

    /// Byte offset into the raw lighting data, if the surface is lit.
    pub samples_ofs: Option<usize>,
    /// Mean sample color, fed into vertex color accumulation.
    pub color: Vec4,

    /// First vertex-occurrence in the interleaved world array.
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RBspNode {
    pub plane: usize,
    pub children: [NodeChild; 2],

    pub mins: Vec3,
    pub maxs: Vec3,

    pub first_surface: usize,
    pub num_surfaces: usize,

    pub parent: Option<usize>,
    /// Owning inline model, assigned during submodel setup.
    pub model: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RBspLeaf {
    pub contents: ContentsFlags,
    pub cluster: i32,
    pub area: i32,

    pub mins: Vec3,
    pub maxs: Vec3,

    pub first_leaf_surface: usize,
    pub num_leaf_surfaces: usize,

    pub parent: Option<usize>,
    pub model: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RBspSubmodel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub radius: f32,

    pub head_node: usize,

    pub first_face: usize,
    pub num_faces: usize,
}

/// A merged static light source.
#[derive(Debug, Clone, Copy)]
pub struct RBspLight {
    pub org: Vec3,
    pub radius: f32,
    pub leaf: usize,
}

/// Parsed visibility lump. The compressed bit data stays opaque; offsets
/// are relative to the start of the lump.
#[derive(Debug, Clone, Default)]
pub struct RBspVis {
    pub num_clusters: i32,
    pub bit_ofs: Vec<[i32; 2]>,
    pub data: Vec<u8>,
}

/// Interleaved GPU-facing vertex, uploadable as raw bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct WorldVertex {
    pub position: [f32; 3],
    pub tex_coord: [f32; 2],
    pub lm_coord: [f32; 2],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub color: [f32; 4],
}

impl WorldVertex {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

pub const NUM_SURFACES_ARRAYS: usize = 9;

/// Per-model surface buckets, each sorted by texture id after load. A
/// surface may sit in several buckets at once.
#[derive(Debug, Clone, Default)]
pub struct RSortedSurfaces {
    pub sky: Vec<usize>,
    pub opaque: Vec<usize>,
    pub opaque_warp: Vec<usize>,
    pub alpha_test: Vec<usize>,
    pub blend: Vec<usize>,
    pub blend_warp: Vec<usize>,
    pub material: Vec<usize>,
    pub flare: Vec<usize>,
    pub back: Vec<usize>,
}

impl RSortedSurfaces {
    pub fn buckets(&self) -> [&Vec<usize>; NUM_SURFACES_ARRAYS] {
        [
            &self.sky,
            &self.opaque,
            &self.opaque_warp,
            &self.alpha_test,
            &self.blend,
            &self.blend_warp,
            &self.material,
            &self.flare,
            &self.back,
        ]
    }

    pub fn buckets_mut(&mut self) -> [&mut Vec<usize>; NUM_SURFACES_ARRAYS] {
        [
            &mut self.sky,
            &mut self.opaque,
            &mut self.opaque_warp,
            &mut self.alpha_test,
            &mut self.blend,
            &mut self.blend_warp,
            &mut self.material,
            &mut self.flare,
            &mut self.back,
        ]
    }
}

/// A drawable model. The world and its inline submodels all share the
/// world's storage; each view owns only its bounds and surface range.
#[derive(Debug, Clone)]
pub struct RModel {
    pub name: String,
    pub mod_type: ModType,

    pub mins: Vec3,
    pub maxs: Vec3,
    pub radius: f32,

    pub head_node: usize,

    pub first_model_surface: usize,
    pub num_model_surfaces: usize,

    pub sorted_surfaces: RSortedSurfaces,
}

/// The loaded world. One handle owns every table for the lifetime of the
/// map; everything is read-only after the load completes.
#[derive(Debug)]
pub struct RBspModel {
    pub name: String,
    pub version: i32,
    pub checksum: u32,

    pub lightmap_scale: i32,
    pub ambient_light: Vec3,

    pub entity_string: String,

    pub vertexes: Vec<RBspVertex>,
    pub edges: Vec<RBspEdge>,
    pub surfedges: Vec<i32>,
    pub planes: Vec<CPlane>,
    pub texinfo: Vec<RBspTexinfo>,
    pub surfaces: Vec<RBspSurface>,
    pub leaf_surfaces: Vec<usize>,
    pub leafs: Vec<RBspLeaf>,
    pub nodes: Vec<RBspNode>,
    pub submodels: Vec<RBspSubmodel>,

    pub lightmap_data: Option<Vec<u8>>,
    pub vis: Option<RBspVis>,

    pub bsp_lights: Vec<RBspLight>,

    /// Interleaved vertex-occurrence array, three per surface triangle fan
    /// vertex, in surface order.
    pub verts: Vec<WorldVertex>,

    pub world: RModel,
    pub inline_models: Vec<RModel>,
}

impl RBspModel {
    /// Classify a point into the leaf containing it, walking down from the
    /// given head node. A malformed cyclic tree classifies to leaf 0.
    pub fn leaf_for_point(&self, p: &Vec3, head_node: usize) -> usize {
        let mut child = NodeChild::Node(head_node);

        // a descent passes each node at most once
        for _ in 0..self.nodes.len() + 1 {
            match child {
                NodeChild::Leaf(leaf) => return leaf,
                NodeChild::Node(n) => {
                    let node = &self.nodes[n];
                    let plane = &self.planes[node.plane];

                    let d = if (plane.plane_type as usize) < 3 {
                        p[plane.plane_type as usize] - plane.dist
                    } else {
                        dot_product(&plane.normal, p) - plane.dist
                    };

                    child = if d < 0.0 {
                        node.children[1]
                    } else {
                        node.children[0]
                    };
                }
            }
        }

        0 // malformed cycle, bail
    }

    /// Decompress the visibility row for a cluster. Everything is visible
    /// when the map carries no vis data or the cluster is unknown.
    pub fn cluster_pvs(&self, cluster: i32) -> Vec<u8> {
        if let Some(vis) = &self.vis {
            if cluster >= 0 && (cluster as usize) < vis.bit_ofs.len() {
                let row = ((vis.num_clusters + 7) >> 3) as usize;
                let ofs = vis.bit_ofs[cluster as usize][q2w_common::bspfile::DVIS_PVS];
                if ofs >= 0 && (ofs as usize) < vis.data.len() {
                    return decompress_vis(&vis.data[ofs as usize..], row);
                }
                return vec![0; row];
            }
            let row = ((vis.num_clusters + 7) >> 3) as usize;
            return vec![0xFF; row];
        }

        vec![0xFF; (self.leafs.len() + 7) >> 3]
    }
}

/// Expand a run-length-encoded visibility row: literal bytes copy through,
/// a zero byte is followed by its run length.
pub fn decompress_vis(input: &[u8], row: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(row);
    let mut i = 0;

    while out.len() < row {
        match input.get(i) {
            None => break, // truncated vis data
            Some(&b) if b != 0 => {
                out.push(b);
                i += 1;
            }
            Some(_) => {
                let c = input.get(i + 1).copied().unwrap_or(0) as usize;
                i += 2;
                for _ in 0..c {
                    if out.len() >= row {
                        break;
                    }
                    out.push(0);
                }
            }
        }
    }

    out.resize(row, 0);
    out
}

/// Owns at most one world at a time. Loading a world while one is live is
/// a fatal misuse; begin_registration frees the old world first.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    world: Option<RBspModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { world: None }
    }

    /// Free any previous world, then load the named map.
    pub fn begin_registration(
        &mut self,
        name: &str,
        file: &[u8],
        ctx: &mut BspLoadContext,
    ) -> Result<&RBspModel, BspError> {
        self.world = None;
        self.load_world(name, file, ctx)
    }

    pub fn load_world(
        &mut self,
        name: &str,
        file: &[u8],
        ctx: &mut BspLoadContext,
    ) -> Result<&RBspModel, BspError> {
        if let Some(world) = &self.world {
            return Err(BspError::WorldLoaded {
                name: world.name.clone(),
            });
        }

        let model = crate::r_model_bsp::load_bsp_model(name, file, ctx)?;
        Ok(&*self.world.insert(model))
    }

    pub fn world(&self) -> Option<&RBspModel> {
        self.world.as_ref()
    }

    pub fn free_world(&mut self) {
        self.world = None;
    }

    /// Resolve an inline model by its conventional "*N" name. "*0" is the
    /// world itself and is rejected, like any out-of-range index.
    pub fn inline_model(&self, name: &str) -> Result<&RModel, BspError> {
        let bad = || BspError::BadInlineModel {
            name: name.to_string(),
        };

        let world = self.world.as_ref().ok_or_else(bad)?;

        let index: usize = name
            .strip_prefix('*')
            .and_then(|n| n.parse().ok())
            .ok_or_else(bad)?;

        if index < 1 || index >= world.inline_models.len() {
            return Err(bad());
        }

        Ok(&world.inline_models[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_vertex_layout() {
        assert_eq!(WorldVertex::SIZE, 72);
        // interleaved layout is position, st, lm st, normal, tangent, color
        let v = WorldVertex {
            position: [1.0, 2.0, 3.0],
            tex_coord: [4.0, 5.0],
            lm_coord: [6.0, 7.0],
            normal: [8.0, 9.0, 10.0],
            tangent: [11.0, 12.0, 13.0, 14.0],
            color: [15.0, 16.0, 17.0, 18.0],
        };
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&v));
        let expected: Vec<f32> = (1..=18).map(|i| i as f32).collect();
        assert_eq!(floats, &expected[..]);
    }

    #[test]
    fn test_decompress_vis_literal_bytes() {
        let out = decompress_vis(&[0xAB, 0xCD], 2);
        assert_eq!(out, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_decompress_vis_zero_run() {
        // 0x01, then a run of three zeros, then 0x02
        let out = decompress_vis(&[0x01, 0x00, 0x03, 0x02], 5);
        assert_eq!(out, vec![0x01, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_decompress_vis_truncated_pads_zero() {
        let out = decompress_vis(&[0x01], 4);
        assert_eq!(out, vec![0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_sorted_surfaces_bucket_count() {
        let mut sorted = RSortedSurfaces::default();
        assert_eq!(sorted.buckets().len(), NUM_SURFACES_ARRAYS);
        assert_eq!(sorted.buckets_mut().len(), NUM_SURFACES_ARRAYS);
    }

    #[test]
    fn test_inline_model_without_world() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.inline_model("*1"),
            Err(BspError::BadInlineModel { .. })
        ));
    }
}

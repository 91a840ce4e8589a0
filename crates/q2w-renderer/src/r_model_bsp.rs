// r_model_bsp.rs - the world-geometry load pipeline.
// Parses every lump into the runtime tables, rebuilds the spatial tree,
// extracts static lights, assembles the interleaved vertex array and sorts
// the per-model surface buckets. Strictly sequential; any failure aborts
// the whole load.

use std::mem::size_of;

use log::{debug, warn};

use q2w_common::bspfile::{
    ContentsFlags, DBspEdge, DBspFace, DBspHeader, DBspLeaf, DBspModel, DBspNode, DBspNormal,
    DBspPlane, DBspTexinfo, DBspVertex, SurfaceFlags, BSP_VERSION, BSP_VERSION_ENHANCED,
    IDBSPHEADER, LUMP_EDGES, LUMP_ENTITIES, LUMP_FACES, LUMP_LEAFFACES, LUMP_LEAFS,
    LUMP_LIGHTING, LUMP_MODELS, LUMP_NODES, LUMP_NORMALS, LUMP_PLANES, LUMP_SURFEDGES,
    LUMP_TEXINFO, LUMP_VERTEXES, LUMP_VISIBILITY, MAX_BSP_EDGES, MAX_BSP_ENTSTRING,
    MAX_BSP_FACES, MAX_BSP_LEAFFACES, MAX_BSP_LEAFS, MAX_BSP_LIGHTING, MAX_BSP_MODELS,
    MAX_BSP_NODES, MAX_BSP_PLANES, MAX_BSP_SURFEDGES, MAX_BSP_TEXINFO, MAX_BSP_VERTS,
    MAX_BSP_VISIBILITY,
};
use q2w_common::crc::crc_block;
use q2w_common::error::BspError;
use q2w_common::shared::{
    add_point_to_bounds, com_parse, dot_product, entity_value, parse_vec3, radius_from_bounds,
    read_f32_le, read_i16_le, read_i32_le, read_u16_le, read_vec3_le, tangent_vectors,
    vector_compare, vector_length, vector_ma, vector_negate, vector_subtract, CPlane, Vec3,
    Vec4, VEC3_ORIGIN,
};

use crate::r_image::{ImageSource, MaterialFlags};
use crate::r_lightmap::LightmapPacker;
use crate::r_model::{
    MSurfaceFlags, ModType, NodeChild, RBspEdge, RBspLeaf, RBspLight, RBspModel, RBspNode,
    RBspSubmodel, RBspSurface, RBspTexinfo, RBspVertex, RBspVis, RModel, RSortedSurfaces,
    WorldVertex,
};

pub const DEFAULT_LIGHTMAP_SCALE: i32 = 16;

const MIN_AMBIENT_COMPONENT: f32 = 0.05;

/// Tunable constants for static light extraction. The stock values match
/// the original authoring conventions; they encode a visual preference,
/// not a correctness rule.
#[derive(Debug, Clone, Copy)]
pub struct BspLightParams {
    /// Sources closer than this merge into one.
    pub merge_distance: f32,
    /// Cap on a merged source's radius.
    pub max_radius: f32,
    /// Radius for entity lights that specify none.
    pub default_radius: f32,
    /// Floor for emissive surface light radii.
    pub min_surface_radius: f32,
}

impl Default for BspLightParams {
    fn default() -> Self {
        Self {
            merge_distance: 32.0,
            max_radius: 250.0,
            default_radius: 100.0,
            min_surface_radius: 100.0,
        }
    }
}

/// Collaborators and knobs for one load.
pub struct BspLoadContext<'a> {
    pub images: &'a mut dyn ImageSource,
    pub lightmaps: &'a mut dyn LightmapPacker,
    pub lights: BspLightParams,
    /// Informational percentage milestones between stages.
    pub progress: Option<&'a mut dyn FnMut(i32)>,
}

impl<'a> BspLoadContext<'a> {
    pub fn new(images: &'a mut dyn ImageSource, lightmaps: &'a mut dyn LightmapPacker) -> Self {
        Self {
            images,
            lightmaps,
            lights: BspLightParams::default(),
            progress: None,
        }
    }
}

/// Load a world model from a complete map file.
pub fn load_bsp_model(
    name: &str,
    file: &[u8],
    ctx: &mut BspLoadContext,
) -> Result<RBspModel, BspError> {
    let header = DBspHeader::parse(file)?;

    if header.ident != IDBSPHEADER {
        return Err(BspError::BadIdent {
            ident: header.ident,
        });
    }

    let version = header.version;
    if version != BSP_VERSION && version != BSP_VERSION_ENHANCED {
        return Err(BspError::BadVersion { version });
    }

    let mut loader = BspLoader {
        file,
        header,
        ctx,
        model: RBspModel {
            name: name.to_string(),
            version,
            checksum: crc_block(file),
            lightmap_scale: DEFAULT_LIGHTMAP_SCALE,
            ambient_light: [MIN_AMBIENT_COMPONENT; 3],
            entity_string: String::new(),
            vertexes: Vec::new(),
            edges: Vec::new(),
            surfedges: Vec::new(),
            planes: Vec::new(),
            texinfo: Vec::new(),
            surfaces: Vec::new(),
            leaf_surfaces: Vec::new(),
            leafs: Vec::new(),
            nodes: Vec::new(),
            submodels: Vec::new(),
            lightmap_data: None,
            vis: None,
            bsp_lights: Vec::new(),
            verts: Vec::new(),
            world: RModel {
                name: name.to_string(),
                mod_type: ModType::Bsp,
                mins: VEC3_ORIGIN,
                maxs: VEC3_ORIGIN,
                radius: 0.0,
                head_node: 0,
                first_model_surface: 0,
                num_model_surfaces: 0,
                sorted_surfaces: RSortedSurfaces::default(),
            },
            inline_models: Vec::new(),
        },
    };

    loader.load_entities()?;

    loader.load_vertexes()?;
    loader.progress(4);

    if version == BSP_VERSION_ENHANCED {
        loader.load_normals()?;
    }

    loader.load_edges()?;
    loader.progress(8);

    loader.load_surfedges()?;
    loader.progress(12);

    loader.load_lighting()?;
    loader.progress(16);

    loader.load_planes()?;
    loader.progress(20);

    loader.load_texinfo()?;
    loader.progress(24);

    loader.load_surfaces()?;
    loader.progress(28);

    loader.load_leaf_surfaces()?;
    loader.progress(32);

    loader.load_visibility()?;
    loader.progress(36);

    loader.load_leafs()?;
    loader.progress(40);

    loader.load_nodes()?;
    loader.progress(44);

    loader.load_submodels()?;
    loader.progress(48);

    loader.log_stats();

    loader.load_lights();

    loader.setup_submodels();

    loader.load_vertex_arrays();

    loader.load_surfaces_arrays();

    Ok(loader.model)
}

struct BspLoader<'a, 'c> {
    file: &'a [u8],
    header: DBspHeader,
    ctx: &'a mut BspLoadContext<'c>,
    model: RBspModel,
}

impl BspLoader<'_, '_> {
    fn progress(&mut self, percent: i32) {
        if let Some(cb) = self.ctx.progress.as_mut() {
            cb(percent);
        }
    }

    fn load_entities(&mut self) -> Result<(), BspError> {
        let data = self.header.lumps[LUMP_ENTITIES].data(self.file, "entities")?;
        if data.len() > MAX_BSP_ENTSTRING {
            return Err(BspError::TooManyRecords {
                lump: "entity characters",
                count: data.len(),
                max: MAX_BSP_ENTSTRING,
            });
        }

        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        self.model.entity_string = String::from_utf8_lossy(&data[..len]).to_string();
        Ok(())
    }

    fn load_vertexes(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_VERTEXES].records(self.file, size_of::<DBspVertex>(), "vertexes")?;
        if records.len() > MAX_BSP_VERTS {
            return Err(BspError::TooManyRecords {
                lump: "vertexes",
                count: records.len(),
                max: MAX_BSP_VERTS,
            });
        }

        self.model.vertexes = records
            .map(|rec| RBspVertex {
                position: read_vec3_le(rec, 0),
                ..Default::default()
            })
            .collect();
        Ok(())
    }

    fn load_normals(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_NORMALS].records(self.file, size_of::<DBspNormal>(), "normals")?;
        if records.len() != self.model.vertexes.len() {
            return Err(BspError::NormalCountMismatch {
                normals: records.len(),
                vertexes: self.model.vertexes.len(),
            });
        }

        for (vert, rec) in self.model.vertexes.iter_mut().zip(records) {
            vert.normal = read_vec3_le(rec, 0);
        }
        Ok(())
    }

    fn load_edges(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_EDGES].records(self.file, size_of::<DBspEdge>(), "edges")?;
        if records.len() > MAX_BSP_EDGES {
            return Err(BspError::TooManyRecords {
                lump: "edges",
                count: records.len(),
                max: MAX_BSP_EDGES,
            });
        }

        let num_vertexes = self.model.vertexes.len();
        self.model.edges = Vec::with_capacity(records.len());

        for rec in records {
            let v = [read_u16_le(rec, 0), read_u16_le(rec, 2)];
            for &vi in &v {
                if vi as usize >= num_vertexes {
                    return Err(BspError::BadIndex {
                        what: "edge vertex",
                        index: vi as i64,
                        max: num_vertexes,
                    });
                }
            }
            self.model.edges.push(RBspEdge { v });
        }
        Ok(())
    }

    fn load_surfedges(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_SURFEDGES].records(self.file, size_of::<i32>(), "surfedges")?;
        let count = records.len();
        if count < 1 {
            return Err(BspError::EmptyLump { lump: "surfedges" });
        }
        if count >= MAX_BSP_SURFEDGES {
            return Err(BspError::TooManyRecords {
                lump: "surfedges",
                count,
                max: MAX_BSP_SURFEDGES,
            });
        }

        let num_edges = self.model.edges.len();
        self.model.surfedges = Vec::with_capacity(count);

        for rec in records {
            let e = read_i32_le(rec, 0);
            if e.unsigned_abs() as usize >= num_edges {
                return Err(BspError::BadIndex {
                    what: "edge",
                    index: e as i64,
                    max: num_edges,
                });
            }
            self.model.surfedges.push(e);
        }
        Ok(())
    }

    fn load_lighting(&mut self) -> Result<(), BspError> {
        let data = self.header.lumps[LUMP_LIGHTING].data(self.file, "lighting")?;
        if data.len() > MAX_BSP_LIGHTING {
            return Err(BspError::TooManyRecords {
                lump: "lighting bytes",
                count: data.len(),
                max: MAX_BSP_LIGHTING,
            });
        }

        self.model.lightmap_data = if data.is_empty() {
            None
        } else {
            Some(data.to_vec())
        };

        // resolve lightmap scale
        self.model.lightmap_scale = DEFAULT_LIGHTMAP_SCALE;
        if let Some(value) = entity_value(&self.model.entity_string, "lightmap_scale") {
            match value.parse::<i32>() {
                Ok(scale) if scale > 0 => {
                    self.model.lightmap_scale = scale;
                    debug!("Resolved lightmap_scale: {}", scale);
                }
                _ => warn!("Ignoring malformed lightmap_scale: {:?}", value),
            }
        }

        // resolve ambient light, clamped so a map can never go fully black
        self.model.ambient_light = [MIN_AMBIENT_COMPONENT; 3];
        if let Some(value) = entity_value(&self.model.entity_string, "ambient_light") {
            match parse_vec3(&value) {
                Some(ambient) => {
                    for i in 0..3 {
                        self.model.ambient_light[i] = ambient[i].max(MIN_AMBIENT_COMPONENT);
                    }
                    debug!(
                        "Resolved ambient_light: {:1.2} {:1.2} {:1.2}",
                        self.model.ambient_light[0],
                        self.model.ambient_light[1],
                        self.model.ambient_light[2]
                    );
                }
                None => warn!("Ignoring malformed ambient_light: {:?}", value),
            }
        }
        Ok(())
    }

    fn load_planes(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_PLANES].records(self.file, size_of::<DBspPlane>(), "planes")?;
        let count = records.len();
        if count == 0 {
            return Err(BspError::EmptyLump { lump: "planes" });
        }
        if count > MAX_BSP_PLANES {
            return Err(BspError::TooManyRecords {
                lump: "planes",
                count,
                max: MAX_BSP_PLANES,
            });
        }

        // room for negated planes derived after load
        self.model.planes = Vec::with_capacity(count * 2);

        for rec in records {
            let normal = read_vec3_le(rec, 0);
            let mut bits = 0u8;
            for j in 0..3 {
                if normal[j] < 0.0 {
                    bits |= 1 << j;
                }
            }

            self.model.planes.push(CPlane {
                normal,
                dist: read_f32_le(rec, 12),
                plane_type: read_i32_le(rec, 16) as u8,
                signbits: bits,
                pad: [0; 2],
            });
        }
        Ok(())
    }

    fn load_texinfo(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_TEXINFO].records(self.file, size_of::<DBspTexinfo>(), "texinfo")?;
        if records.len() > MAX_BSP_TEXINFO {
            return Err(BspError::TooManyRecords {
                lump: "texinfo",
                count: records.len(),
                max: MAX_BSP_TEXINFO,
            });
        }

        self.model.texinfo = Vec::with_capacity(records.len());

        for rec in records {
            let mut vecs = [[0.0f32; 4]; 2];
            for j in 0..2 {
                for k in 0..4 {
                    vecs[j][k] = read_f32_le(rec, (j * 4 + k) * 4);
                }
            }

            let flags = SurfaceFlags::from_bits_retain(read_i32_le(rec, 32));
            let value = read_i32_le(rec, 36);

            let raw_name = &rec[40..72];
            let len = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
            let name = String::from_utf8_lossy(&raw_name[..len]).to_string();

            let image = self.ctx.images.load_image(&format!("textures/{}", name));

            self.model.texinfo.push(RBspTexinfo {
                vecs,
                flags,
                value,
                name,
                image,
            });
        }
        Ok(())
    }

    /// Resolve the start vertex of a surfedge; the sign selects which end
    /// of the edge leads.
    fn surfedge_vertex_index(&self, index: i32) -> usize {
        let e = self.model.surfedges[index as usize];
        if e >= 0 {
            self.model.edges[e as usize].v[0] as usize
        } else {
            self.model.edges[(-e) as usize].v[1] as usize
        }
    }

    /// Fill in a surface's bounds, center and texture-space extents, the
    /// latter snapped outward to the lightmap texel grid.
    fn setup_surface(&self, surf: &mut RBspSurface) {
        let mut mins = [999999.0f32; 3];
        let mut maxs = [-999999.0f32; 3];
        let mut st_mins = [999999.0f32; 2];
        let mut st_maxs = [-999999.0f32; 2];

        let tex = &self.model.texinfo[surf.texinfo];

        for i in 0..surf.num_edges {
            let vi = self.surfedge_vertex_index(surf.first_edge + i);
            let position = self.model.vertexes[vi].position;

            add_point_to_bounds(&position, &mut mins, &mut maxs);

            for j in 0..2 {
                let dir = [tex.vecs[j][0], tex.vecs[j][1], tex.vecs[j][2]];
                let val = dot_product(&position, &dir) + tex.vecs[j][3];
                if val < st_mins[j] {
                    st_mins[j] = val;
                }
                if val > st_maxs[j] {
                    st_maxs[j] = val;
                }
            }
        }

        surf.mins = mins;
        surf.maxs = maxs;
        for i in 0..3 {
            surf.center[i] = (surf.mins[i] + surf.maxs[i]) / 2.0;
        }

        let scale = self.model.lightmap_scale as f32;
        for i in 0..2 {
            let bmins = (st_mins[i] / scale).floor();
            let bmaxs = (st_maxs[i] / scale).ceil();

            surf.st_mins[i] = bmins * scale;
            surf.st_maxs[i] = bmaxs * scale;

            surf.st_center[i] = (surf.st_maxs[i] + surf.st_mins[i]) / 2.0;
            surf.st_extents[i] = surf.st_maxs[i] - surf.st_mins[i];
        }
    }

    /// Mean of the surface's raw light samples, white when it has none.
    /// Blend surfaces carry their translucency in alpha.
    fn surface_color(&self, surf: &RBspSurface, smax: i32, tmax: i32) -> Vec4 {
        let mut color = [1.0f32, 1.0, 1.0, 1.0];

        if let (Some(data), Some(ofs)) = (&self.model.lightmap_data, surf.samples_ofs) {
            let samples = &data[ofs..];
            let texels = (smax as usize).saturating_mul(tmax as usize).min(samples.len() / 3);
            if texels > 0 {
                let mut sum = [0.0f32; 3];
                for i in 0..texels {
                    for j in 0..3 {
                        sum[j] += samples[i * 3 + j] as f32;
                    }
                }
                for j in 0..3 {
                    color[j] = sum[j] / (texels as f32 * 255.0);
                }
            }
        }

        let flags = self.model.texinfo[surf.texinfo].flags;
        if flags.contains(SurfaceFlags::BLEND33) {
            color[3] = 0.33;
        } else if flags.contains(SurfaceFlags::BLEND66) {
            color[3] = 0.66;
        }
        color
    }

    fn load_surfaces(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_FACES].records(self.file, size_of::<DBspFace>(), "faces")?;
        if records.len() > MAX_BSP_FACES {
            return Err(BspError::TooManyRecords {
                lump: "faces",
                count: records.len(),
                max: MAX_BSP_FACES,
            });
        }

        self.model.surfaces = Vec::with_capacity(records.len());

        self.ctx.lightmaps.begin_batch();

        for rec in records {
            let mut surf = RBspSurface {
                first_edge: read_i32_le(rec, 4),
                num_edges: read_i16_le(rec, 8) as i32,
                ..Default::default()
            };

            if surf.num_edges < 1
                || surf.first_edge < 0
                || surf.first_edge as i64 + surf.num_edges as i64
                    > self.model.surfedges.len() as i64
            {
                return Err(BspError::BadIndex {
                    what: "surfedge",
                    index: surf.first_edge as i64 + surf.num_edges as i64,
                    max: self.model.surfedges.len(),
                });
            }

            // resolve plane
            let plane_num = read_u16_le(rec, 0) as usize;
            if plane_num >= self.model.planes.len() {
                return Err(BspError::BadIndex {
                    what: "plane",
                    index: plane_num as i64,
                    max: self.model.planes.len(),
                });
            }
            surf.plane = plane_num;

            // and sidedness; back surfaces shade with the negated normal
            let side = read_i16_le(rec, 2);
            if side != 0 {
                surf.flags |= MSurfaceFlags::PLANEBACK;
                surf.normal = vector_negate(&self.model.planes[plane_num].normal);
            } else {
                surf.normal = self.model.planes[plane_num].normal;
            }

            // then texinfo
            let ti = read_i16_le(rec, 10);
            if ti < 0 || ti as usize >= self.model.texinfo.len() {
                return Err(BspError::BadIndex {
                    what: "texinfo",
                    index: ti as i64,
                    max: self.model.texinfo.len(),
                });
            }
            surf.texinfo = ti as usize;

            let tex_flags = self.model.texinfo[surf.texinfo].flags;
            if !tex_flags.intersects(SurfaceFlags::WARP | SurfaceFlags::SKY) {
                surf.flags |= MSurfaceFlags::LIGHTMAP;
            }

            // size, texcoords, etc
            self.setup_surface(&mut surf);

            // lastly lighting info
            let light_ofs = read_i32_le(rec, 16);
            surf.samples_ofs = match (&self.model.lightmap_data, light_ofs) {
                (Some(data), ofs) if ofs >= 0 && (ofs as usize) < data.len() => Some(ofs as usize),
                (_, -1) => None,
                _ => {
                    warn!("Ignoring bad light offset: {}", light_ofs);
                    None
                }
            };

            let scale = self.model.lightmap_scale;
            let smax = (surf.st_extents[0] as i32 / scale).saturating_add(1);
            let tmax = (surf.st_extents[1] as i32 / scale).saturating_add(1);

            // nan or garbage positions leave the extent seeds inverted
            if smax < 1 || tmax < 1 {
                return Err(BspError::BadSurfaceExtents { smax, tmax });
            }

            if surf.flags.contains(MSurfaceFlags::LIGHTMAP) {
                let samples = match (&self.model.lightmap_data, surf.samples_ofs) {
                    (Some(data), Some(ofs)) => Some(&data[ofs..]),
                    _ => None,
                };
                let alloc = self.ctx.lightmaps.alloc_block(smax, tmax, samples)?;
                surf.light_s = alloc.s;
                surf.light_t = alloc.t;
                surf.lightmap_page = alloc.page;
            }

            surf.color = self.surface_color(&surf, smax, tmax);

            self.model.surfaces.push(surf);
        }

        self.ctx.lightmaps.end_batch();
        Ok(())
    }

    fn load_leaf_surfaces(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_LEAFFACES].records(self.file, size_of::<u16>(), "leaf faces")?;
        if records.len() > MAX_BSP_LEAFFACES {
            return Err(BspError::TooManyRecords {
                lump: "leaf faces",
                count: records.len(),
                max: MAX_BSP_LEAFFACES,
            });
        }

        self.model.leaf_surfaces = Vec::with_capacity(records.len());

        for rec in records {
            let j = read_u16_le(rec, 0) as usize;
            if j >= self.model.surfaces.len() {
                return Err(BspError::BadIndex {
                    what: "surface",
                    index: j as i64,
                    max: self.model.surfaces.len(),
                });
            }
            self.model.leaf_surfaces.push(j);
        }
        Ok(())
    }

    fn load_visibility(&mut self) -> Result<(), BspError> {
        let data = self.header.lumps[LUMP_VISIBILITY].data(self.file, "visibility")?;
        if data.len() > MAX_BSP_VISIBILITY {
            return Err(BspError::TooManyRecords {
                lump: "visibility bytes",
                count: data.len(),
                max: MAX_BSP_VISIBILITY,
            });
        }

        if data.is_empty() {
            self.model.vis = None;
            return Ok(());
        }
        if data.len() < 4 {
            return Err(BspError::FunnyLumpSize {
                lump: "visibility",
                len: data.len(),
                stride: 4,
            });
        }

        let num_clusters = read_i32_le(data, 0);
        let table = (data.len() - 4) / 8;
        if num_clusters < 0 || num_clusters as usize > table {
            return Err(BspError::BadIndex {
                what: "cluster",
                index: num_clusters as i64,
                max: table,
            });
        }

        let mut bit_ofs = Vec::with_capacity(num_clusters as usize);
        for i in 0..num_clusters as usize {
            bit_ofs.push([read_i32_le(data, 4 + i * 8), read_i32_le(data, 8 + i * 8)]);
        }

        self.model.vis = Some(RBspVis {
            num_clusters,
            bit_ofs,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn load_leafs(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_LEAFS].records(self.file, size_of::<DBspLeaf>(), "leafs")?;
        let count = records.len();
        if count == 0 {
            return Err(BspError::EmptyLump { lump: "leafs" });
        }
        if count > MAX_BSP_LEAFS {
            return Err(BspError::TooManyRecords {
                lump: "leafs",
                count,
                max: MAX_BSP_LEAFS,
            });
        }

        self.model.leafs = Vec::with_capacity(count);

        for rec in records {
            let first = read_u16_le(rec, 20) as usize;
            let num = read_u16_le(rec, 22) as usize;
            if first + num > self.model.leaf_surfaces.len() {
                return Err(BspError::BadIndex {
                    what: "leaf surface",
                    index: (first + num) as i64,
                    max: self.model.leaf_surfaces.len(),
                });
            }

            self.model.leafs.push(RBspLeaf {
                contents: ContentsFlags::from_bits_retain(read_i32_le(rec, 0)),
                cluster: read_i16_le(rec, 4) as i32,
                area: read_i16_le(rec, 6) as i32,
                mins: [
                    read_i16_le(rec, 8) as f32,
                    read_i16_le(rec, 10) as f32,
                    read_i16_le(rec, 12) as f32,
                ],
                maxs: [
                    read_i16_le(rec, 14) as f32,
                    read_i16_le(rec, 16) as f32,
                    read_i16_le(rec, 18) as f32,
                ],
                first_leaf_surface: first,
                num_leaf_surfaces: num,
                parent: None,
                model: 0,
            });
        }
        Ok(())
    }

    fn load_nodes(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_NODES].records(self.file, size_of::<DBspNode>(), "nodes")?;
        let count = records.len();
        if count == 0 {
            return Err(BspError::EmptyLump { lump: "nodes" });
        }
        if count > MAX_BSP_NODES {
            return Err(BspError::TooManyRecords {
                lump: "nodes",
                count,
                max: MAX_BSP_NODES,
            });
        }

        self.model.nodes = Vec::with_capacity(count);

        for rec in records {
            let plane = read_i32_le(rec, 0);
            if plane < 0 || plane as usize >= self.model.planes.len() {
                return Err(BspError::BadIndex {
                    what: "plane",
                    index: plane as i64,
                    max: self.model.planes.len(),
                });
            }

            // decode the signed child indices exactly once
            let mut children = [NodeChild::Leaf(0); 2];
            for j in 0..2 {
                let p = read_i32_le(rec, 4 + j * 4);
                children[j] = if p >= 0 {
                    if p as usize >= count {
                        return Err(BspError::BadIndex {
                            what: "node",
                            index: p as i64,
                            max: count,
                        });
                    }
                    NodeChild::Node(p as usize)
                } else {
                    let leaf = (-1 - p) as usize;
                    if leaf >= self.model.leafs.len() {
                        return Err(BspError::BadIndex {
                            what: "leaf",
                            index: leaf as i64,
                            max: self.model.leafs.len(),
                        });
                    }
                    NodeChild::Leaf(leaf)
                };
            }

            let first_surface = read_u16_le(rec, 24) as usize;
            let num_surfaces = read_u16_le(rec, 26) as usize;
            if first_surface + num_surfaces > self.model.surfaces.len() {
                return Err(BspError::BadIndex {
                    what: "surface",
                    index: (first_surface + num_surfaces) as i64,
                    max: self.model.surfaces.len(),
                });
            }

            self.model.nodes.push(RBspNode {
                plane: plane as usize,
                children,
                mins: [
                    read_i16_le(rec, 12) as f32,
                    read_i16_le(rec, 14) as f32,
                    read_i16_le(rec, 16) as f32,
                ],
                maxs: [
                    read_i16_le(rec, 18) as f32,
                    read_i16_le(rec, 20) as f32,
                    read_i16_le(rec, 22) as f32,
                ],
                first_surface,
                num_surfaces,
                parent: None,
                model: 0,
            });
        }

        self.setup_nodes();
        Ok(())
    }

    /// Assign parent back-references, walking down from the root with an
    /// explicit stack.
    fn setup_nodes(&mut self) {
        let limit = 1 + 2 * self.model.nodes.len();
        let mut visited = 0;

        let mut stack = vec![(NodeChild::Node(0), None)];
        while let Some((child, parent)) = stack.pop() {
            visited += 1;
            if visited > limit {
                break; // malformed cycle, bail
            }

            match child {
                NodeChild::Leaf(leaf) => self.model.leafs[leaf].parent = parent,
                NodeChild::Node(n) => {
                    self.model.nodes[n].parent = parent;
                    let children = self.model.nodes[n].children;
                    stack.push((children[0], Some(n)));
                    stack.push((children[1], Some(n)));
                }
            }
        }
    }

    fn load_submodels(&mut self) -> Result<(), BspError> {
        let records =
            self.header.lumps[LUMP_MODELS].records(self.file, size_of::<DBspModel>(), "models")?;
        let count = records.len();
        if count == 0 {
            return Err(BspError::EmptyLump { lump: "models" });
        }
        if count > MAX_BSP_MODELS {
            return Err(BspError::TooManyRecords {
                lump: "models",
                count,
                max: MAX_BSP_MODELS,
            });
        }

        self.model.submodels = Vec::with_capacity(count);

        for rec in records {
            let mut sub = RBspSubmodel::default();

            for j in 0..3 {
                // widen by a unit on each axis for culling slack
                sub.mins[j] = read_f32_le(rec, j * 4) - 1.0;
                sub.maxs[j] = read_f32_le(rec, 12 + j * 4) + 1.0;
                sub.origin[j] = read_f32_le(rec, 24 + j * 4);
            }
            sub.radius = radius_from_bounds(&sub.mins, &sub.maxs);

            let head_node = read_i32_le(rec, 36);
            if head_node < 0 || head_node as usize >= self.model.nodes.len() {
                return Err(BspError::BadIndex {
                    what: "node",
                    index: head_node as i64,
                    max: self.model.nodes.len(),
                });
            }
            sub.head_node = head_node as usize;

            let first_face = read_i32_le(rec, 40);
            let num_faces = read_i32_le(rec, 44);
            if first_face < 0
                || num_faces < 0
                || first_face as i64 + num_faces as i64 > self.model.surfaces.len() as i64
            {
                return Err(BspError::BadIndex {
                    what: "surface",
                    index: first_face as i64 + num_faces as i64,
                    max: self.model.surfaces.len(),
                });
            }
            sub.first_face = first_face as usize;
            sub.num_faces = num_faces as usize;

            self.model.submodels.push(sub);
        }
        Ok(())
    }

    fn log_stats(&self) {
        let model = &self.model;
        debug!("================================");
        debug!("load_bsp_model: {}", model.name);
        debug!("  Verts:      {}", model.vertexes.len());
        debug!("  Edges:      {}", model.edges.len());
        debug!("  Surfedges:  {}", model.surfedges.len());
        debug!("  Planes:     {}", model.planes.len());
        debug!("  Texinfo:    {}", model.texinfo.len());
        debug!("  Faces:      {}", model.surfaces.len());
        debug!("  Nodes:      {}", model.nodes.len());
        debug!("  Leafs:      {}", model.leafs.len());
        debug!("  Leaf faces: {}", model.leaf_surfaces.len());
        debug!("  Models:     {}", model.submodels.len());
        debug!(
            "  Lightdata:  {}",
            model.lightmap_data.as_ref().map_or(0, |d| d.len())
        );
        debug!("  Vis:        {}", model.vis.as_ref().map_or(0, |v| v.data.len()));
        if let Some(vis) = &model.vis {
            debug!("  Clusters:   {}", vis.num_clusters);
        }
        debug!("================================");
    }

    /// Register a static light, merging it into a nearby known source
    /// when one sits within the merge distance.
    fn add_bsp_light(&mut self, org: Vec3, radius: f32) {
        let params = self.ctx.lights;

        let mut found = None;
        for (i, l) in self.model.bsp_lights.iter().enumerate() {
            let delta = vector_subtract(&org, &l.org);
            if vector_length(&delta) <= params.merge_distance {
                found = Some(i); // merge them
                break;
            }
        }

        let i = match found {
            Some(i) => i,
            None => {
                let leaf = self.model.leaf_for_point(&org, 0);
                self.model.bsp_lights.push(RBspLight {
                    org,
                    radius: 0.0,
                    leaf,
                });
                self.model.bsp_lights.len() - 1
            }
        };

        let l = &mut self.model.bsp_lights[i];
        l.radius += radius;
        if l.radius > params.max_radius {
            l.radius = params.max_radius;
        }
    }

    /// Resolve all static light sources: emissive world surfaces first,
    /// then point lights from the entity text.
    fn load_lights(&mut self) {
        let params = self.ctx.lights;

        let mut pending: Vec<(Vec3, f32)> = Vec::new();
        for surf in &self.model.surfaces {
            let tex = &self.model.texinfo[surf.texinfo];
            if tex.flags.contains(SurfaceFlags::LIGHT) && tex.value != 0 {
                let org = vector_ma(&surf.center, 1.0, &surf.normal);

                let span = vector_subtract(&surf.maxs, &surf.mins);
                let radius = vector_length(&span);

                pending.push((org, radius.max(params.min_surface_radius)));
            }
        }
        for (org, radius) in pending {
            self.add_bsp_light(org, radius);
        }

        let entity_lights =
            parse_entity_lights(&self.model.entity_string, params.default_radius);
        for (org, radius) in entity_lights {
            self.add_bsp_light(org, radius);
        }

        debug!("Loaded {} bsp lights", self.model.bsp_lights.len());
    }

    /// Tag every node and leaf reachable from the head with its owning
    /// inline model, for quick resolution during traces and lighting.
    fn tag_submodel(&mut self, head_node: usize, model: usize) {
        let limit = 1 + 2 * self.model.nodes.len();
        let mut visited = 0;

        let mut stack = vec![NodeChild::Node(head_node)];
        while let Some(child) = stack.pop() {
            visited += 1;
            if visited > limit {
                break;
            }

            match child {
                NodeChild::Leaf(leaf) => self.model.leafs[leaf].model = model,
                NodeChild::Node(n) => {
                    self.model.nodes[n].model = model;
                    let children = self.model.nodes[n].children;
                    stack.push(children[0]);
                    stack.push(children[1]);
                }
            }
        }
    }

    /// Convert the submodel records into drawable model views. They share
    /// the world's storage; each owns only its bounds and surface range.
    fn setup_submodels(&mut self) {
        let subs = self.model.submodels.clone();

        // the world spans every surface; its bounds come from submodel 0
        self.model.world.mins = subs[0].mins;
        self.model.world.maxs = subs[0].maxs;
        self.model.world.radius = subs[0].radius;
        self.model.world.head_node = subs[0].head_node;
        self.model.world.first_model_surface = 0;
        self.model.world.num_model_surfaces = self.model.surfaces.len();

        self.model.inline_models = Vec::with_capacity(subs.len());
        for (i, sub) in subs.iter().enumerate() {
            self.tag_submodel(sub.head_node, i);

            self.model.inline_models.push(RModel {
                name: format!("*{}", i),
                mod_type: ModType::BspSubmodel,
                mins: sub.mins,
                maxs: sub.maxs,
                radius: sub.radius,
                head_node: sub.head_node,
                first_model_surface: sub.first_face,
                num_model_surfaces: sub.num_faces,
                sorted_surfaces: RSortedSurfaces::default(),
            });
        }
    }

    /// Assemble the interleaved vertex array. Two passes over every
    /// surface's edge list: the first emits attributes and accumulates
    /// per-vertex color, the second emits the completed averages, which a
    /// vertex shared between surfaces only has once all of them have
    /// contributed.
    fn load_vertex_arrays(&mut self) {
        let total: usize = self
            .model
            .surfaces
            .iter()
            .map(|s| s.num_edges as usize)
            .sum();
        let mut verts: Vec<WorldVertex> = Vec::with_capacity(total);

        let lm_size = self.ctx.lightmaps.block_size() as f32;
        let scale = self.model.lightmap_scale as f32;

        for i in 0..self.model.surfaces.len() {
            self.model.surfaces[i].index = verts.len();

            let surf = &self.model.surfaces[i];
            let (first_edge, num_edges) = (surf.first_edge, surf.num_edges);
            let surf_flags = surf.flags;
            let surf_normal = surf.normal;
            let st_mins = surf.st_mins;
            let (light_s, light_t) = (surf.light_s as f32, surf.light_t as f32);
            let ti = surf.texinfo;

            let vecs = self.model.texinfo[ti].vecs;
            let tex_flags = self.model.texinfo[ti].flags;
            let (image_width, image_height) = {
                let image = self.ctx.images.image(self.model.texinfo[ti].image);
                (image.width as f32, image.height as f32)
            };

            let sdir = vecs[0];
            let tdir = vecs[1];
            let sdir3 = [sdir[0], sdir[1], sdir[2]];
            let tdir3 = [tdir[0], tdir[1], tdir[2]];

            for j in 0..num_edges {
                let vi = self.surfedge_vertex_index(first_edge + j);
                let point = self.model.vertexes[vi].position;

                // texture coordinates
                let mut s = dot_product(&point, &sdir3) + sdir[3];
                s /= image_width;

                let mut t = dot_product(&point, &tdir3) + tdir[3];
                t /= image_height;

                let tex_coord = [s, t];

                if surf_flags.contains(MSurfaceFlags::LIGHTMAP) {
                    // lightmap coordinates
                    s = dot_product(&point, &sdir3) + sdir[3];
                    s -= st_mins[0];
                    s += light_s * scale;
                    s += scale / 2.0;
                    s /= lm_size * scale;

                    t = dot_product(&point, &tdir3) + tdir[3];
                    t -= st_mins[1];
                    t += light_t * scale;
                    t += scale / 2.0;
                    t /= lm_size * scale;
                }
                // unlit surfaces keep the diffuse coordinates here
                let lm_coord = [s, t];

                // normal vector; phong shading wants the per-vertex one
                let vert_normal = self.model.vertexes[vi].normal;
                let normal = if tex_flags.contains(SurfaceFlags::PHONG)
                    && !vector_compare(&vert_normal, &VEC3_ORIGIN)
                {
                    vert_normal
                } else {
                    surf_normal
                };

                let (tangent, _bitangent) = tangent_vectors(&normal, &sdir, &tdir);

                // accumulate colors
                add_vertex_color(&mut self.model.vertexes[vi], &self.model.surfaces[i].color);

                verts.push(WorldVertex {
                    position: point,
                    tex_coord,
                    lm_coord,
                    normal,
                    tangent,
                    color: [0.0; 4],
                });
            }
        }

        // iterate over the verts again, emitting the accumulated colors
        let mut vertind = 0;
        for i in 0..self.model.surfaces.len() {
            let (first_edge, num_edges) =
                (self.model.surfaces[i].first_edge, self.model.surfaces[i].num_edges);

            for j in 0..num_edges {
                let vi = self.surfedge_vertex_index(first_edge + j);
                verts[vertind].color = self.model.vertexes[vi].color;
                vertind += 1;
            }
        }

        self.model.verts = verts;
    }

    /// Partition one model's surface range into the nine buckets.
    fn classify_surfaces(&self, first: usize, num: usize) -> RSortedSurfaces {
        let mut sorted = RSortedSurfaces::default();

        for i in first..first + num {
            let surf = &self.model.surfaces[i];
            let tex = &self.model.texinfo[surf.texinfo];
            let material = self.ctx.images.image(tex.image).material;

            if tex.flags.contains(SurfaceFlags::SKY) {
                sorted.sky.push(i);
                continue;
            }

            if tex.flags.intersects(SurfaceFlags::BLEND33 | SurfaceFlags::BLEND66) {
                if tex.flags.contains(SurfaceFlags::WARP) {
                    sorted.blend_warp.push(i);
                } else {
                    sorted.blend.push(i);
                }
            } else if tex.flags.contains(SurfaceFlags::WARP) {
                sorted.opaque_warp.push(i);
            } else if tex.flags.contains(SurfaceFlags::ALPHATEST) {
                sorted.alpha_test.push(i);
            } else {
                sorted.opaque.push(i);
            }

            if material.contains(MaterialFlags::STAGE_RENDER) {
                sorted.material.push(i);
            }
            if material.contains(MaterialFlags::STAGE_FLARE) {
                sorted.flare.push(i);
            }
            if !tex.flags.contains(SurfaceFlags::WARP) {
                sorted.back.push(i);
            }
        }

        sorted
    }

    /// Bucket and sort the world's surfaces, then every inline model's.
    /// Grouping each bucket by texture id keeps texture binds down.
    fn load_surfaces_arrays(&mut self) {
        let texnums: Vec<usize> = self
            .model
            .surfaces
            .iter()
            .map(|s| {
                self.ctx
                    .images
                    .image(self.model.texinfo[s.texinfo].image)
                    .texnum as usize
            })
            .collect();

        let mut sorter = SurfaceSorter::new(self.ctx.images.num_images().max(1));

        let mut sorted = self.classify_surfaces(0, self.model.surfaces.len());
        sorter.sort_all(&texnums, &mut sorted);
        self.model.world.sorted_surfaces = sorted;

        for m in 0..self.model.inline_models.len() {
            let (first, num) = (
                self.model.inline_models[m].first_model_surface,
                self.model.inline_models[m].num_model_surfaces,
            );
            let mut sorted = self.classify_surfaces(first, num);
            sorter.sort_all(&texnums, &mut sorted);
            self.model.inline_models[m].sorted_surfaces = sorted;
        }
    }
}

/// Fold one more surface color into a vertex's running average.
fn add_vertex_color(vert: &mut RBspVertex, color: &Vec4) {
    vert.surfaces += 1;

    for i in 0..4 {
        let vc = vert.color[i] * (vert.surfaces - 1) as f32 / vert.surfaces as f32;
        let sc = color[i] / vert.surfaces as f32;

        vert.color[i] = vc + sc;
    }
}

/// Scan entity text for point lights. Records whose classname begins with
/// "light" yield an (origin, radius) pair. Designer content parses
/// leniently: missing or non-positive radii fall back to the default, and
/// an origin, once seen, carries forward until replaced.
pub fn parse_entity_lights(ents: &str, default_radius: f32) -> Vec<(Vec3, f32)> {
    let mut lights = Vec::new();

    let mut org = VEC3_ORIGIN;
    let mut radius = 0.0f32;
    let mut entity = false;
    let mut light = false;

    let mut data = Some(ents);
    while let Some(rest) = data {
        let (c, next) = com_parse(rest);
        data = next;

        if c.is_empty() {
            break;
        }

        if c.starts_with('{') {
            entity = true;
        }

        if !entity {
            // skip stray tokens between entities
            continue;
        }

        if c.starts_with('}') {
            entity = false;

            if light {
                // add it
                if radius <= 0.0 {
                    radius = default_radius;
                }

                lights.push((org, radius));

                light = false;
                radius = 0.0;
            }
        }

        if c == "classname" {
            let Some(rest) = data else { break };
            let (value, next) = com_parse(rest);
            data = next;

            if value.starts_with("light") {
                // light, light_spot, etc
                light = true;
            }
            continue;
        }

        if c == "origin" {
            let Some(rest) = data else { break };
            let (value, next) = com_parse(rest);
            data = next;

            if let Some(parsed) = parse_vec3(&value) {
                org = parsed;
            }
            continue;
        }

        if c == "light" {
            let Some(rest) = data else { break };
            let (value, next) = com_parse(rest);
            data = next;

            radius = value.parse().unwrap_or(0.0);
            continue;
        }
    }

    lights
}

/// Scratch for the by-texture counting sort. Lanes are indexed by dense
/// texture id and fully drained between models; a stale count would leak
/// surfaces across models.
struct SurfaceSorter {
    by_texnum: Vec<Vec<usize>>,
}

impl SurfaceSorter {
    fn new(num_images: usize) -> Self {
        Self {
            by_texnum: vec![Vec::new(); num_images],
        }
    }

    /// Stable-redistribute one bucket by its surfaces' texture ids.
    fn sort(&mut self, texnums: &[usize], bucket: &mut Vec<usize>) {
        for &surf in bucket.iter() {
            self.by_texnum[texnums[surf]].push(surf);
        }

        bucket.clear();
        for lane in self.by_texnum.iter_mut() {
            bucket.append(lane);
        }
    }

    fn sort_all(&mut self, texnums: &[usize], sorted: &mut RSortedSurfaces) {
        for bucket in sorted.buckets_mut() {
            self.sort(texnums, bucket);
        }
    }
}

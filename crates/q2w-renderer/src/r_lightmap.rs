// r_lightmap.rs - lightmap atlas packing.
// Column-skyline block allocator over square RGB pages. The loader talks to
// it through the LightmapPacker trait, framed by begin/end batch calls.

use q2w_common::error::BspError;

pub const DEFAULT_LIGHTMAP_BLOCK_SIZE: i32 = 512;

const LIGHTMAP_BYTES: i32 = 3;

/// Atlas placement for one surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightmapAlloc {
    pub page: usize,
    pub s: i32,
    pub t: i32,
}

/// Lightmap atlas collaborator. Invoked once per surface in allocation
/// order, between begin_batch and end_batch.
pub trait LightmapPacker {
    fn begin_batch(&mut self);
    fn alloc_block(
        &mut self,
        smax: i32,
        tmax: i32,
        samples: Option<&[u8]>,
    ) -> Result<LightmapAlloc, BspError>;
    fn end_batch(&mut self);
    fn block_size(&self) -> i32;
}

/// Default packer. Assembles RGB byte pages from the surface samples,
/// white where a surface has none.
#[derive(Debug)]
pub struct RLightmaps {
    size: i32,
    allocated: Vec<i32>,
    buffer: Vec<u8>,
    pages: Vec<Vec<u8>>,
}

impl RLightmaps {
    pub fn new(size: i32) -> Self {
        Self {
            size,
            allocated: vec![0; size as usize],
            buffer: vec![255; (size * size * LIGHTMAP_BYTES) as usize],
            pages: Vec::new(),
        }
    }

    pub fn pages(&self) -> &[Vec<u8>] {
        &self.pages
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Find a spot in the current block, tracking per-column heights.
    fn try_alloc(&mut self, w: i32, h: i32) -> Option<(i32, i32)> {
        let mut best = self.size;
        let mut x = 0;
        let mut y = 0;

        for i in 0..(self.size - w) {
            let mut best2 = 0;
            let mut j = 0;
            while j < w {
                let col = self.allocated[(i + j) as usize];
                if col >= best {
                    break;
                }
                if col > best2 {
                    best2 = col;
                }
                j += 1;
            }
            if j == w {
                // this is a valid spot
                x = i;
                y = best2;
                best = best2;
            }
        }

        if best + h > self.size {
            return None;
        }

        for i in 0..w {
            self.allocated[(x + i) as usize] = best + h;
        }

        Some((x, y))
    }

    /// Seal the filled block and start a fresh one.
    fn upload_block(&mut self) {
        let empty = vec![255; (self.size * self.size * LIGHTMAP_BYTES) as usize];
        self.pages.push(std::mem::replace(&mut self.buffer, empty));
        self.allocated.iter_mut().for_each(|c| *c = 0);
    }

    fn write_samples(&mut self, s: i32, t: i32, smax: i32, tmax: i32, samples: &[u8]) {
        let row_bytes = (smax * LIGHTMAP_BYTES) as usize;
        let stride = (self.size * LIGHTMAP_BYTES) as usize;
        let base = ((t * self.size + s) * LIGHTMAP_BYTES) as usize;

        for row in 0..tmax as usize {
            let src = row * row_bytes;
            if src >= samples.len() {
                break; // truncated sample data stays white
            }
            let n = row_bytes.min(samples.len() - src);
            let dst = base + row * stride;
            self.buffer[dst..dst + n].copy_from_slice(&samples[src..src + n]);
        }
    }
}

impl Default for RLightmaps {
    fn default() -> Self {
        Self::new(DEFAULT_LIGHTMAP_BLOCK_SIZE)
    }
}

impl LightmapPacker for RLightmaps {
    fn begin_batch(&mut self) {
        self.pages.clear();
        self.allocated.iter_mut().for_each(|c| *c = 0);
        self.buffer.iter_mut().for_each(|b| *b = 255);
    }

    fn alloc_block(
        &mut self,
        smax: i32,
        tmax: i32,
        samples: Option<&[u8]>,
    ) -> Result<LightmapAlloc, BspError> {
        // the skyline scan assumes positive dimensions
        if smax < 1 || tmax < 1 {
            return Err(BspError::BadSurfaceExtents { smax, tmax });
        }

        let (s, t) = match self.try_alloc(smax, tmax) {
            Some(spot) => spot,
            None => {
                self.upload_block();
                match self.try_alloc(smax, tmax) {
                    Some(spot) => spot,
                    None => {
                        return Err(BspError::LightmapOversize {
                            width: smax as u32,
                            height: tmax as u32,
                            block: self.size as u32,
                        })
                    }
                }
            }
        };

        if let Some(samples) = samples {
            self.write_samples(s, t, smax, tmax, samples);
        }

        Ok(LightmapAlloc {
            page: self.pages.len(),
            s,
            t,
        })
    }

    fn end_batch(&mut self) {
        self.upload_block();
    }

    fn block_size(&self) -> i32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_alloc_at_origin() {
        let mut lm = RLightmaps::new(64);
        lm.begin_batch();
        let a = lm.alloc_block(8, 8, None).unwrap();
        assert_eq!(a, LightmapAlloc { page: 0, s: 0, t: 0 });
    }

    #[test]
    fn test_blocks_pack_left_to_right() {
        let mut lm = RLightmaps::new(64);
        lm.begin_batch();
        let a = lm.alloc_block(8, 8, None).unwrap();
        let b = lm.alloc_block(8, 4, None).unwrap();
        assert_eq!((a.s, a.t), (0, 0));
        // shorter block fits beside the first, not on top of it
        assert_eq!((b.s, b.t), (8, 0));
    }

    #[test]
    fn test_full_block_seals_page() {
        let mut lm = RLightmaps::new(32);
        lm.begin_batch();
        let a = lm.alloc_block(8, 32, None).unwrap();
        let b = lm.alloc_block(8, 32, None).unwrap();
        let c = lm.alloc_block(8, 32, None).unwrap();
        assert_eq!((a.page, a.s), (0, 0));
        assert_eq!((b.page, b.s), (0, 8));
        assert_eq!((c.page, c.s), (0, 16));
        // block is full; the next allocation seals it and begins a page
        let d = lm.alloc_block(8, 32, None).unwrap();
        assert_eq!((d.page, d.s, d.t), (1, 0, 0));
        assert_eq!(lm.num_pages(), 1);
        lm.end_batch();
        assert_eq!(lm.num_pages(), 2);
    }

    #[test]
    fn test_oversize_surface_fails() {
        let mut lm = RLightmaps::new(16);
        lm.begin_batch();
        let err = lm.alloc_block(64, 64, None).unwrap_err();
        assert_eq!(
            err,
            BspError::LightmapOversize {
                width: 64,
                height: 64,
                block: 16,
            }
        );
    }

    #[test]
    fn test_degenerate_block_fails() {
        let mut lm = RLightmaps::new(16);
        lm.begin_batch();
        assert_eq!(
            lm.alloc_block(0, 4, None).unwrap_err(),
            BspError::BadSurfaceExtents { smax: 0, tmax: 4 }
        );
        assert_eq!(
            lm.alloc_block(4, -124997, None).unwrap_err(),
            BspError::BadSurfaceExtents { smax: 4, tmax: -124997 }
        );
        // the block stays usable after a rejection
        let a = lm.alloc_block(4, 4, None).unwrap();
        assert_eq!((a.s, a.t), (0, 0));
    }

    #[test]
    fn test_samples_copied_into_page() {
        let mut lm = RLightmaps::new(16);
        lm.begin_batch();
        // 2x2 texels, distinct RGB per texel
        let samples: Vec<u8> = (0..12).collect();
        let a = lm.alloc_block(2, 2, Some(&samples)).unwrap();
        lm.end_batch();

        let page = &lm.pages()[a.page];
        let stride = 16 * 3;
        let base = (a.t * 16 + a.s) as usize * 3;
        assert_eq!(&page[base..base + 6], &samples[0..6]);
        assert_eq!(&page[base + stride..base + stride + 6], &samples[6..12]);
    }

    #[test]
    fn test_unlit_surface_stays_white() {
        let mut lm = RLightmaps::new(16);
        lm.begin_batch();
        let a = lm.alloc_block(4, 4, None).unwrap();
        lm.end_batch();

        let page = &lm.pages()[a.page];
        assert!(page.iter().all(|&b| b == 255));
    }

    #[test]
    fn test_begin_batch_resets_state() {
        let mut lm = RLightmaps::new(32);
        lm.begin_batch();
        lm.alloc_block(16, 16, None).unwrap();
        lm.end_batch();
        assert_eq!(lm.num_pages(), 1);

        lm.begin_batch();
        assert_eq!(lm.num_pages(), 0);
        let a = lm.alloc_block(16, 16, None).unwrap();
        assert_eq!(a, LightmapAlloc { page: 0, s: 0, t: 0 });
    }

    #[test]
    fn test_truncated_samples_clamped() {
        let mut lm = RLightmaps::new(16);
        lm.begin_batch();
        // 2x2 surface but only one row of samples present
        let samples = vec![7u8; 6];
        let a = lm.alloc_block(2, 2, Some(&samples)).unwrap();
        lm.end_batch();

        let page = &lm.pages()[a.page];
        let stride = 16 * 3;
        let base = (a.t * 16 + a.s) as usize * 3;
        assert_eq!(&page[base..base + 6], &samples[..]);
        assert!(page[base + stride..base + stride + 6].iter().all(|&b| b == 255));
    }
}

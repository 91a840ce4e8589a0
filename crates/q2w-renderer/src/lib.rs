#![allow(clippy::needless_range_loop, clippy::too_many_arguments)]
// World-geometry loader: parses the on-disk format into runtime tables,
// builds the lightmap atlas and the interleaved vertex array, and serves
// spatial queries over the result.

pub mod r_image;
pub mod r_lightmap;
pub mod r_model;
pub mod r_model_bsp;

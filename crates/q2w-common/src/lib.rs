#![allow(clippy::needless_range_loop, clippy::too_many_arguments)]

pub mod shared;
pub mod bspfile;
pub mod crc;
pub mod error;

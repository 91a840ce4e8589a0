//! bspinfo: load a map and print its structure.
//!
//! Usage:
//!   cargo run --bin bspinfo -- maps/edge.bsp
//!
//! Set RUST_LOG=debug for the loader's own stage milestones and stats.

use std::error::Error;
use std::process::ExitCode;

use q2w_renderer::r_image::{ImageSource, RImageRegistry};
use q2w_renderer::r_lightmap::RLightmaps;
use q2w_renderer::r_model::{ModelRegistry, RBspModel};
use q2w_renderer::r_model_bsp::BspLoadContext;

fn main() -> ExitCode {
    env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: bspinfo <map.bsp>");
        return ExitCode::FAILURE;
    };

    match run(&path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bspinfo: {}: {}", path, e);
            ExitCode::FAILURE
        }
    }
}

fn run(path: &str) -> Result<(), Box<dyn Error>> {
    let file = std::fs::read(path)?;

    let mut images = RImageRegistry::new();
    let mut lightmaps = RLightmaps::default();
    let mut progress = |percent: i32| log::info!("loading {}: {:2}%", path, percent);

    let mut ctx = BspLoadContext::new(&mut images, &mut lightmaps);
    ctx.progress = Some(&mut progress);

    let mut registry = ModelRegistry::new();
    let world = registry.load_world(path, &file, &mut ctx)?;

    print_info(world);

    let pages = lightmaps.num_pages();
    let images = images.num_images();
    println!("{:>12} lightmap pages", pages);
    println!("{:>12} textures", images);
    Ok(())
}

fn print_info(world: &RBspModel) {
    println!("{} (version {})", world.name, world.version);
    println!("checksum 0x{:08x}", world.checksum);
    println!(
        "lightmap scale {}, ambient {:1.2} {:1.2} {:1.2}",
        world.lightmap_scale,
        world.ambient_light[0],
        world.ambient_light[1],
        world.ambient_light[2]
    );
    println!();

    println!("{:>12} vertexes", world.vertexes.len());
    println!("{:>12} edges", world.edges.len());
    println!("{:>12} surfedges", world.surfedges.len());
    println!("{:>12} planes", world.planes.len());
    println!("{:>12} texinfo", world.texinfo.len());
    println!("{:>12} faces", world.surfaces.len());
    println!("{:>12} leaf faces", world.leaf_surfaces.len());
    println!("{:>12} leafs", world.leafs.len());
    println!("{:>12} nodes", world.nodes.len());
    println!("{:>12} inline models", world.inline_models.len());
    println!("{:>12} static lights", world.bsp_lights.len());
    println!("{:>12} array vertexes", world.verts.len());
    match &world.vis {
        Some(vis) => println!("{:>12} clusters", vis.num_clusters),
        None => println!("{:>12} clusters", 0),
    }
    println!();

    let sorted = &world.world.sorted_surfaces;
    println!("sorted surfaces:");
    println!("{:>12} sky", sorted.sky.len());
    println!("{:>12} opaque", sorted.opaque.len());
    println!("{:>12} opaque warp", sorted.opaque_warp.len());
    println!("{:>12} alpha test", sorted.alpha_test.len());
    println!("{:>12} blend", sorted.blend.len());
    println!("{:>12} blend warp", sorted.blend_warp.len());
    println!("{:>12} material", sorted.material.len());
    println!("{:>12} flare", sorted.flare.len());
    println!("{:>12} back", sorted.back.len());
}

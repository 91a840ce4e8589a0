// r_image.rs - image handles and the find-or-load registry.
// The world loader consumes images through the ImageSource trait; the
// in-memory registry here is the default implementation.

use bitflags::bitflags;
use log::warn;

pub const MAX_IMAGES: usize = 1024;

const DEFAULT_IMAGE_SIZE: i32 = 64;

bitflags! {
    /// Material stage bits resolved per image. These drive the extra,
    /// non-exclusive surface buckets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MaterialFlags: i32 {
        const STAGE_RENDER = 0x1;
        const STAGE_FLARE = 0x2;
    }
}

/// A loaded (or synthesized) texture handle.
#[derive(Debug, Clone)]
pub struct RImage {
    pub name: String,
    pub width: i32,
    pub height: i32,
    /// Dense texture binding id, always below MAX_IMAGES.
    pub texnum: i32,
    pub material: MaterialFlags,
}

/// Image loading collaborator. `load_image` finds or loads the named
/// texture and must be idempotent; repeated requests for one name return
/// the same handle. Texture ids are dense and bounded by MAX_IMAGES so
/// they can index the per-texture sort scratch directly.
pub trait ImageSource {
    fn load_image(&mut self, name: &str) -> usize;
    fn image(&self, handle: usize) -> &RImage;
    fn num_images(&self) -> usize;
}

/// Default in-memory image registry. Textures registered up front are
/// found by name; anything else gets a placeholder handle, so a load
/// never fails on a missing texture.
#[derive(Debug, Default)]
pub struct RImageRegistry {
    images: Vec<RImage>,
}

impl RImageRegistry {
    pub fn new() -> Self {
        Self { images: Vec::new() }
    }

    /// Pre-register a texture with explicit dimensions and material bits.
    pub fn with_image(
        mut self,
        name: &str,
        width: i32,
        height: i32,
        material: MaterialFlags,
    ) -> Self {
        self.insert(name, width, height, material);
        self
    }

    fn insert(&mut self, name: &str, width: i32, height: i32, material: MaterialFlags) -> usize {
        let texnum = self.images.len() as i32;
        self.images.push(RImage {
            name: name.to_string(),
            width,
            height,
            texnum,
            material,
        });
        self.images.len() - 1
    }
}

impl ImageSource for RImageRegistry {
    fn load_image(&mut self, name: &str) -> usize {
        for (i, image) in self.images.iter().enumerate() {
            if image.name == name {
                return i;
            }
        }

        if self.images.len() >= MAX_IMAGES {
            warn!("load_image: out of image slots for {}", name);
            return self.images.len() - 1;
        }

        warn!("load_image: can't find {}", name);
        self.insert(
            name,
            DEFAULT_IMAGE_SIZE,
            DEFAULT_IMAGE_SIZE,
            MaterialFlags::empty(),
        )
    }

    fn image(&self, handle: usize) -> &RImage {
        &self.images[handle]
    }

    fn num_images(&self) -> usize {
        self.images.len()
    }
}

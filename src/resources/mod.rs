//! Resource management
//!
//! Textures, samplers, 2D meshes and the descriptor sets that bind them.

mod descriptor;
mod mesh;
mod sampler;
mod texture;

pub use descriptor::*;
pub use mesh::*;
pub use sampler::*;
pub use texture::*;

//! D3D11 shared textures (Windows).

pub mod device;
pub mod texture;

pub use device::Dx11Device;
pub use texture::is_keyed_texture;

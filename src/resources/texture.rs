//! Texture loading and management

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use parking_lot::Mutex;

use crate::backend::*;
use crate::render_target::{RenderTargetId, RenderTargetRef};
use crate::resources::DescriptorCache;

/// Decoded texture data
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Load texture from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let img = image::open(path).map_err(|e| e.to_string())?;
        Ok(Self::from_image(img, &name))
    }

    /// Load texture from encoded bytes
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, String> {
        let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    /// Create a 1x1 texture of one color
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    /// The texture draws fall back to when none or an unready one is given.
    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a checkerboard texture with 8x8 pixel cells
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                let color = if is_even { color1 } else { color2 };
                data.extend_from_slice(&color);
            }
        }

        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8Unorm,
            data,
            name: "checkerboard".to_string(),
        }
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.width, self.height)
    }
}

/// Flag a texture loader flips once pixel data is on the GPU.
///
/// Draws sampling a texture whose flag is not yet set use the default white
/// texture instead.
#[derive(Debug, Clone, Default)]
pub struct TextureReadiness(Arc<AtomicBool>);

impl TextureReadiness {
    pub fn new(ready: bool) -> Self {
        Self(Arc::new(AtomicBool::new(ready)))
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// GPU image owned by a [`Texture::Image`].
pub struct ImageTexture {
    device: Arc<dyn GpuDevice>,
    descriptors: Arc<Mutex<DescriptorCache>>,
    image: ImageHandle,
    view: ImageViewHandle,
    extent: Extent2d,
    format: TextureFormat,
    readiness: TextureReadiness,
    name: String,
}

impl ImageTexture {
    pub(crate) fn new(
        device: Arc<dyn GpuDevice>,
        descriptors: Arc<Mutex<DescriptorCache>>,
        name: &str,
        extent: Extent2d,
        format: TextureFormat,
    ) -> BackendResult<Self> {
        let image = device.create_image(&ImageDescriptor {
            label: Some(name.to_string()),
            extent,
            format,
            ..Default::default()
        })?;
        let view = match device.create_image_view(image) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_image(image);
                return Err(e);
            }
        };

        Ok(Self {
            device,
            descriptors,
            image,
            view,
            extent,
            format,
            readiness: TextureReadiness::new(false),
            name: name.to_string(),
        })
    }

    /// Upload tightly packed pixels and mark the texture ready.
    pub(crate) fn upload(&self, data: &[u8]) -> BackendResult<()> {
        let expected =
            (self.extent.width * self.extent.height * self.format.bytes_per_pixel()) as usize;
        if data.len() != expected {
            return Err(BackendError::creation(
                "texture",
                format!("expected {} bytes of pixel data, got {}", expected, data.len()),
            ));
        }
        self.device.write_image(self.image, data)?;
        self.readiness.mark_ready();
        Ok(())
    }

    pub fn view(&self) -> ImageViewHandle {
        self.view
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn readiness(&self) -> &TextureReadiness {
        &self.readiness
    }
}

impl Drop for ImageTexture {
    fn drop(&mut self) {
        self.descriptors
            .lock()
            .forget(DescriptorBinding::Texture(self.view), self.device.as_ref());
        self.device.destroy_image_view(self.view);
        self.device.destroy_image(self.image);
    }
}

impl fmt::Debug for ImageTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTexture")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("extent", &self.extent)
            .field("ready", &self.readiness.is_ready())
            .finish()
    }
}

/// Anything a draw can sample.
///
/// Cloning is cheap; image textures are reference counted and render targets
/// are referred to by id.
#[derive(Debug, Clone)]
pub enum Texture {
    Image(Arc<ImageTexture>),
    RenderTarget(RenderTargetRef),
}

impl Texture {
    pub fn as_render_target(&self) -> Option<RenderTargetId> {
        match self {
            Texture::Image(_) => None,
            Texture::RenderTarget(target) => Some(target.id()),
        }
    }

    /// Whether sampling this texture would read meaningful data.
    pub fn is_data_ready(&self) -> bool {
        match self {
            Texture::Image(image) => image.readiness.is_ready(),
            Texture::RenderTarget(target) => target.is_data_ready(),
        }
    }

    /// Readiness flag for loader-managed image textures.
    pub fn readiness(&self) -> Option<&TextureReadiness> {
        match self {
            Texture::Image(image) => Some(&image.readiness),
            Texture::RenderTarget(_) => None,
        }
    }

    pub fn extent(&self) -> Extent2d {
        match self {
            Texture::Image(image) => image.extent,
            Texture::RenderTarget(target) => target.extent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_size() {
        let data = TextureData::checkerboard(16, [255; 4], [0, 0, 0, 255]);
        assert_eq!(data.data.len(), 16 * 16 * 4);
        assert_eq!(&data.data[0..4], &[255; 4]);
        assert_eq!(&data.data[8 * 4..8 * 4 + 4], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_readiness_is_shared() {
        let readiness = TextureReadiness::new(false);
        let loader = readiness.clone();
        assert!(!readiness.is_ready());
        loader.mark_ready();
        assert!(readiness.is_ready());
    }

    #[test]
    fn test_upload_checks_size_and_marks_ready() {
        let device: Arc<dyn GpuDevice> = Arc::new(DummyDevice::new());
        let descriptors = Arc::new(Mutex::new(DescriptorCache::new()));
        let texture = ImageTexture::new(
            device,
            descriptors,
            "test",
            Extent2d::new(2, 2),
            TextureFormat::Rgba8Unorm,
        )
        .unwrap();

        assert!(texture.upload(&[0; 4]).is_err());
        assert!(!texture.readiness().is_ready());
        texture.upload(&[0; 16]).unwrap();
        assert!(texture.readiness().is_ready());

        let texture = Texture::Image(Arc::new(texture));
        assert!(texture.is_data_ready());
        assert_eq!(texture.as_render_target(), None);
    }
}

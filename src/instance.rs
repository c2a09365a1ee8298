//! Renderer instance.
//!
//! The [`Instance`] owns what windows and render targets share: the device,
//! the render-target arena, the descriptor cache, the default texture and
//! sampler, and the problem reporter. It is passed around as `Arc<Instance>`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::backend::*;
use crate::config::InstanceConfig;
use crate::draw::DrawBindings;
use crate::error::{RenderError, RenderResult};
use crate::render_target::{DependencyInfo, RenderTargetArena};
use crate::report::Reporter;
use crate::resources::{DescriptorCache, ImageTexture, Sampler, Texture, TextureData};
use crate::task::{TaskRunner, ThreadTaskRunner};

pub struct Instance {
    device: Arc<dyn GpuDevice>,
    reporter: Reporter,
    task_runner: Arc<dyn TaskRunner>,
    max_dependency_depth: usize,
    descriptor_eviction_age: Duration,
    shutdown_timeout: Duration,
    render_targets: Mutex<RenderTargetArena>,
    descriptors: Arc<Mutex<DescriptorCache>>,
    default_texture: Arc<ImageTexture>,
    default_sampler: Sampler,
}

impl Instance {
    pub fn new(device: Arc<dyn GpuDevice>, config: InstanceConfig) -> RenderResult<Arc<Self>> {
        let reporter = Reporter::new(config.report_callback.clone());
        let result = Self::create(device, config, reporter.clone());
        reporter.check(result)
    }

    fn create(
        device: Arc<dyn GpuDevice>,
        config: InstanceConfig,
        reporter: Reporter,
    ) -> RenderResult<Arc<Self>> {
        let descriptors = Arc::new(Mutex::new(DescriptorCache::new()));

        let white = TextureData::white();
        let default_texture = ImageTexture::new(
            Arc::clone(&device),
            Arc::clone(&descriptors),
            &white.name,
            white.extent(),
            white.format,
        )?;
        default_texture.upload(&white.data)?;

        let default_sampler = Sampler::new(
            Arc::clone(&device),
            Arc::clone(&descriptors),
            &SamplerDescriptor {
                label: Some("default".into()),
                ..Default::default()
            },
        )?;

        log::info!("Created instance on {}", device.name());
        Ok(Arc::new(Self {
            device,
            reporter,
            task_runner: config
                .task_runner
                .unwrap_or_else(|| Arc::new(ThreadTaskRunner)),
            max_dependency_depth: config.max_dependency_depth,
            descriptor_eviction_age: config.descriptor_eviction_age,
            shutdown_timeout: config.shutdown_timeout,
            render_targets: Mutex::new(RenderTargetArena::new()),
            descriptors,
            default_texture: Arc::new(default_texture),
            default_sampler,
        }))
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn task_runner(&self) -> &Arc<dyn TaskRunner> {
        &self.task_runner
    }

    pub fn max_dependency_depth(&self) -> usize {
        self.max_dependency_depth
    }

    /// Bound on draining a render target at drop.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Lock the render-target arena.
    pub fn render_targets(&self) -> MutexGuard<'_, RenderTargetArena> {
        self.render_targets.lock()
    }

    /// Texture drawn when none, or one without data, is given.
    pub fn default_texture(&self) -> Texture {
        Texture::Image(Arc::clone(&self.default_texture))
    }

    pub fn default_sampler(&self) -> &Sampler {
        &self.default_sampler
    }

    /// Create a texture and upload `data` into it.
    pub fn create_texture(&self, data: &TextureData) -> RenderResult<Texture> {
        let result = self.create_texture_inner(data);
        self.reporter.check(result)
    }

    fn create_texture_inner(&self, data: &TextureData) -> RenderResult<Texture> {
        let texture = ImageTexture::new(
            Arc::clone(&self.device),
            Arc::clone(&self.descriptors),
            &data.name,
            data.extent(),
            data.format,
        )?;
        texture.upload(&data.data)?;
        Ok(Texture::Image(Arc::new(texture)))
    }

    /// Decode an image file and upload it.
    pub fn create_texture_from_file(&self, path: impl AsRef<Path>) -> RenderResult<Texture> {
        let path = path.as_ref();
        let result = TextureData::from_file(path)
            .map_err(|e| RenderError::invalid(format!("{}: {}", path.display(), e)))
            .and_then(|data| self.create_texture_inner(&data));
        self.reporter.check(result)
    }

    /// Create a texture whose data a loader uploads later.
    ///
    /// Draws sample the default texture until
    /// [`upload_texture`](Self::upload_texture) completes.
    pub fn create_pending_texture(
        &self,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> RenderResult<Texture> {
        let extent = Extent2d::new(width, height);
        let result = if extent.is_empty() {
            Err(RenderError::invalid(format!("texture size {width}x{height}")))
        } else {
            ImageTexture::new(
                Arc::clone(&self.device),
                Arc::clone(&self.descriptors),
                name,
                extent,
                format,
            )
            .map(|texture| Texture::Image(Arc::new(texture)))
            .map_err(RenderError::from)
        };
        self.reporter.check(result)
    }

    /// Upload pixel data into a texture from
    /// [`create_pending_texture`](Self::create_pending_texture) and mark it
    /// ready.
    pub fn upload_texture(&self, texture: &Texture, data: &[u8]) -> RenderResult<()> {
        let result = match texture {
            Texture::Image(image) => image.upload(data).map_err(RenderError::from),
            Texture::RenderTarget(_) => Err(RenderError::invalid(
                "render targets are written by rendering into them",
            )),
        };
        self.reporter.check(result)
    }

    pub fn create_sampler(&self, desc: &SamplerDescriptor) -> RenderResult<Sampler> {
        let result = Sampler::new(Arc::clone(&self.device), Arc::clone(&self.descriptors), desc)
            .map_err(RenderError::from);
        self.reporter.check(result)
    }

    /// View a draw samples for `texture`, falling back to the default
    /// texture when it has no data yet.
    fn sampled_view(&self, texture: Option<&Texture>) -> (ImageViewHandle, Option<DependencyInfo>) {
        let fallback = (self.default_texture.view(), None);
        let Some(texture) = texture else {
            return fallback;
        };
        if !texture.is_data_ready() {
            log::trace!("{}; drawing with the default texture", RenderError::NotReady);
            return fallback;
        }

        match texture {
            Texture::Image(image) => (image.view(), None),
            Texture::RenderTarget(target) => {
                match self.render_targets.lock().sampling_view(target.id()) {
                    Some((view, swap_index)) => {
                        (view, Some(DependencyInfo::new(target.id(), swap_index)))
                    }
                    None => {
                        log::trace!(
                            "Render target {:?} has nothing to sample; drawing with the default texture",
                            target.id()
                        );
                        fallback
                    }
                }
            }
        }
    }

    /// Descriptor sets and dependency for a draw.
    ///
    /// Locks the render-target arena when `texture` is a render target, so
    /// callers must not hold it.
    pub(crate) fn resolve_bindings(
        &self,
        texture: Option<&Texture>,
        sampler: Option<&Sampler>,
    ) -> RenderResult<DrawBindings> {
        let sampler = sampler.unwrap_or(&self.default_sampler);
        let (view, dependency) = self.sampled_view(texture);

        let mut descriptors = self.descriptors.lock();
        let sampler_set =
            descriptors.get_or_create(DescriptorBinding::Sampler(sampler.handle()), self.device.as_ref())?;
        let texture_set =
            descriptors.get_or_create(DescriptorBinding::Texture(view), self.device.as_ref())?;

        Ok(DrawBindings {
            sampler_set,
            texture_set,
            border_color: sampler.uses_border_color(),
            dependency,
        })
    }

    /// Free descriptor sets that have not been used for a while.
    pub fn evict_descriptors(&self) -> usize {
        self.descriptors.lock().evict_older_than(
            self.descriptor_eviction_age,
            Instant::now(),
            self.device.as_ref(),
        )
    }

    /// Drop the descriptor sets of views about to be destroyed.
    pub(crate) fn forget_texture_views(&self, views: &[ImageViewHandle]) {
        let mut descriptors = self.descriptors.lock();
        for view in views {
            descriptors.forget(DescriptorBinding::Texture(*view), self.device.as_ref());
        }
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.lock().len()
    }

    /// Block until the device has no work left.
    pub fn wait_idle(&self) -> RenderResult<()> {
        let result = self.device.wait_idle().map_err(RenderError::from);
        self.reporter.check(result)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.descriptors.lock().clear(self.device.as_ref());
        log::debug!("Destroyed instance on {}", self.device.name());
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("device", &self.device.name())
            .field("max_dependency_depth", &self.max_dependency_depth)
            .field("descriptor_eviction_age", &self.descriptor_eviction_age)
            .finish()
    }
}

static_assertions::assert_impl_all!(Instance: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderTargetTextureCreateInfo;
    use crate::render_target::RenderTargetTexture;
    use crate::report::{ReportCallback, ReportSeverity};
    use glam::Vec2;

    fn instance() -> (Arc<DummyDevice>, Arc<Instance>) {
        let device = Arc::new(DummyDevice::new());
        let instance = Instance::new(device.clone(), InstanceConfig::default()).unwrap();
        (device, instance)
    }

    #[test]
    fn test_none_texture_binds_default() {
        let (_device, instance) = instance();
        let bindings = instance.resolve_bindings(None, None).unwrap();
        let again = instance
            .resolve_bindings(Some(&instance.default_texture()), None)
            .unwrap();
        assert_eq!(bindings.texture_set, again.texture_set);
        assert!(bindings.dependency.is_none());
    }

    #[test]
    fn test_pending_texture_falls_back_until_uploaded() {
        let (_device, instance) = instance();
        let default = instance.resolve_bindings(None, None).unwrap();

        let texture = instance
            .create_pending_texture("pending", 2, 2, TextureFormat::Rgba8Unorm)
            .unwrap();
        let before = instance.resolve_bindings(Some(&texture), None).unwrap();
        assert_eq!(before.texture_set, default.texture_set);

        instance.upload_texture(&texture, &[255; 16]).unwrap();
        let after = instance.resolve_bindings(Some(&texture), None).unwrap();
        assert_ne!(after.texture_set, default.texture_set);
    }

    #[test]
    fn test_render_target_binding_carries_dependency() {
        let (_device, instance) = instance();
        let mut target =
            RenderTargetTexture::new(&instance, &RenderTargetTextureCreateInfo::new(8, 8)).unwrap();

        let unrendered = instance
            .resolve_bindings(Some(&target.texture()), None)
            .unwrap();
        assert!(unrendered.dependency.is_none());

        target.begin_render().unwrap();
        target.end_render(BlurType::None, Vec2::ZERO).unwrap();
        let rendered = instance
            .resolve_bindings(Some(&target.texture()), None)
            .unwrap();
        let dependency = rendered.dependency.unwrap();
        assert_eq!(dependency.target(), target.id());
        assert_eq!(dependency.swap_index(), 0);
    }

    #[test]
    fn test_dropped_texture_forgets_descriptor() {
        let (_device, instance) = instance();
        let texture = instance.create_texture(&TextureData::white()).unwrap();
        instance.resolve_bindings(Some(&texture), None).unwrap();
        let with_texture = instance.descriptor_count();
        drop(texture);
        assert_eq!(instance.descriptor_count(), with_texture - 1);
    }

    #[test]
    fn test_errors_reach_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ReportCallback = Arc::new(move |severity: ReportSeverity, message: &str| {
            sink.lock().push((severity, message.to_string()));
        });
        let device = Arc::new(DummyDevice::new());
        let instance = Instance::new(
            device,
            InstanceConfig::default().with_report_callback(callback),
        )
        .unwrap();

        assert!(instance
            .create_pending_texture("empty", 0, 4, TextureFormat::Rgba8Unorm)
            .is_err());
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, ReportSeverity::CriticalError);
    }
}

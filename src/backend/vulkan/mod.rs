//! Vulkan device implementation using ash
//!
//! [`VulkanDevice`] owns one instance, one logical device with a single
//! graphics queue, and the surface of the window it was created for. Memory
//! is sub-allocated with gpu-allocator. Every native object lives in a handle
//! map behind a single lock; command recording holds that lock so image
//! layouts can be tracked while commands are translated.
//!
//! Binary semaphores back the acquire/present handshake and the per-frame
//! transfer handoff; timeline semaphores back render-target scheduling, so
//! the device requires Vulkan 1.2.
//!
//! Draws and blurs need the application's SPIR-V (see [`ShaderSet`]).
//! Without it the device still clears, copies, resolves, mip-maps and reads
//! back, and skips draw and blur commands with a single warning.

mod conversion;
mod pipeline;
mod recording;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::traits::*;
use crate::backend::types::*;

use conversion::*;
pub use pipeline::{BlurConstants, ShaderSet};
use pipeline::{ShaderModules, SharedLayouts};

const MAX_DESCRIPTOR_SETS: u32 = 4096;

fn vk_error(context: &'static str) -> impl Fn(vk::Result) -> BackendError {
    move |result| match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            BackendError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
        other => BackendError::creation(context, format!("{:?}", other)),
    }
}

fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout
        .map(|t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(u64::MAX)
}

struct VkSwapchain {
    handle: vk::SwapchainKHR,
    images: Vec<ImageHandle>,
}

struct VkImage {
    image: vk::Image,
    /// `None` for images owned by a swapchain.
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: Extent2d,
    mip_levels: u32,
    usage: ImageUsage,
    /// Layout after the most recently recorded command touching the image.
    layout: vk::ImageLayout,
}

impl VkImage {
    fn is_presentable(&self) -> bool {
        self.allocation.is_none()
    }

    /// Layout the image is left in at the end of every command buffer.
    fn resting_layout(&self) -> Option<vk::ImageLayout> {
        if self.is_presentable() {
            Some(vk::ImageLayout::PRESENT_SRC_KHR)
        } else if self.usage.contains(ImageUsage::SAMPLED) {
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        } else {
            None
        }
    }
}

struct VkImageView {
    view: vk::ImageView,
    image: ImageHandle,
}

struct VkRenderPass {
    render_pass: vk::RenderPass,
    desc: RenderPassDescriptor,
}

impl VkRenderPass {
    /// Multisampled presentable passes resolve into a second attachment;
    /// off-screen passes are resolved with explicit commands.
    fn resolves(&self) -> bool {
        self.desc.samples.is_multisampled() && self.desc.final_layout == FinalLayout::Present
    }
}

struct VkFramebuffer {
    framebuffer: vk::Framebuffer,
    render_pass: RenderPassHandle,
    images: Vec<ImageHandle>,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkSemaphore {
    semaphore: vk::Semaphore,
    kind: SemaphoreKind,
}

#[derive(Default)]
struct Resources {
    swapchains: HashMap<u64, VkSwapchain>,
    images: HashMap<u64, VkImage>,
    views: HashMap<u64, VkImageView>,
    render_passes: HashMap<u64, VkRenderPass>,
    framebuffers: HashMap<u64, VkFramebuffer>,
    buffers: HashMap<u64, VkBuffer>,
    samplers: HashMap<u64, vk::Sampler>,
    descriptor_sets: HashMap<u64, vk::DescriptorSet>,
    /// Blur input sets keyed by (view, sampler).
    blur_sets: HashMap<(u64, u64), vk::DescriptorSet>,
    semaphores: HashMap<u64, VkSemaphore>,
    fences: HashMap<u64, vk::Fence>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    draw_pipelines: HashMap<PipelineSettings, vk::Pipeline>,
    blur_pipelines: HashMap<u64, vk::Pipeline>,
}

#[derive(Debug, Clone, Copy)]
struct EnabledFeatures {
    wide_lines: bool,
    non_solid_fill: bool,
}

/// [`GpuDevice`] backed by Vulkan 1.2.
pub struct VulkanDevice {
    _window: Arc<winit::window::Window>,
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    surface: vk::SurfaceKHR,
    swapchain_fn: swapchain::Device,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    queue_family: u32,
    features: EnabledFeatures,
    allocator: Mutex<Option<Allocator>>,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    layouts: SharedLayouts,
    shaders: Option<ShaderModules>,
    resources: Mutex<Resources>,
    next_id: AtomicU64,
    warned_missing_shaders: AtomicBool,
}

impl VulkanDevice {
    /// Create a device presenting to `window`.
    ///
    /// `shaders` supplies the SPIR-V for draws and blurs; see [`ShaderSet`]
    /// for the interface they must implement.
    pub fn new(
        window: Arc<winit::window::Window>,
        shaders: Option<ShaderSet>,
    ) -> BackendResult<Self> {
        let init = |e: vk::Result| BackendError::InitializationFailed(format!("{:?}", e));

        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"vk2d")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"vk2d")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_2);

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions =
                ash_window::enumerate_required_extensions(display_handle.as_raw()).map_err(init)?;
            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(extensions);
            let instance = entry.create_instance(&instance_info, None).map_err(init)?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(format!("{:?}", e)))?;

            let (physical_device, queue_family) =
                select_physical_device(&instance, &surface_fn, surface)?;

            let supported = instance.get_physical_device_features(physical_device);
            let features = EnabledFeatures {
                wide_lines: supported.wide_lines == vk::TRUE,
                non_solid_fill: supported.fill_mode_non_solid == vk::TRUE,
            };

            let queue_priorities = [1.0f32];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family)
                .queue_priorities(&queue_priorities)];
            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default()
                .wide_lines(features.wide_lines)
                .fill_mode_non_solid(features.non_solid_fill);
            let mut vulkan_12_features =
                vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&device_extensions)
                .enabled_features(&device_features)
                .push_next(&mut vulkan_12_features);
            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(init)?;
            let queue = device.get_device_queue(queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device.create_command_pool(&pool_info, None).map_err(init)?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: MAX_DESCRIPTOR_SETS,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: MAX_DESCRIPTOR_SETS,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: MAX_DESCRIPTOR_SETS,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .pool_sizes(&pool_sizes)
                .max_sets(MAX_DESCRIPTOR_SETS)
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(init)?;

            let layouts = SharedLayouts::new(&device).map_err(init)?;
            let shaders = match shaders {
                Some(set) => Some(ShaderModules::new(&device, &set).map_err(init)?),
                None => None,
            };

            log::info!(
                "VulkanDevice ready (queue family {}, wide lines: {}, non-solid fill: {}, shaders: {})",
                queue_family,
                features.wide_lines,
                features.non_solid_fill,
                shaders.is_some()
            );

            Ok(Self {
                _window: window,
                _entry: entry,
                instance,
                surface_fn,
                surface,
                swapchain_fn,
                physical_device,
                device,
                queue: Mutex::new(queue),
                queue_family,
                features,
                allocator: Mutex::new(Some(allocator)),
                command_pool,
                descriptor_pool,
                layouts,
                shaders,
                resources: Mutex::new(Resources::default()),
                next_id: AtomicU64::new(1),
                warned_missing_shaders: AtomicBool::new(false),
            })
        }
    }

    /// Get the Vulkan instance
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the logical device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        kind: &'static str,
    ) -> BackendResult<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| BackendError::creation(kind, "allocator not available"))?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| BackendError::creation(kind, e))
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free allocation: {}", e);
            }
        }
    }

    /// Record `commands` into a transient command buffer and wait for it.
    fn one_time_submit(
        &self,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> BackendResult<()> {
        let err = vk_error("one-time command buffer");
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = {
                // The pool is shared with recording, which holds the resource lock.
                let _resources = self.resources.lock();
                self.device.allocate_command_buffers(&alloc_info).map_err(&err)?[0]
            };

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let result = (|| {
                self.device.begin_command_buffer(cmd, &begin_info)?;
                record(cmd);
                self.device.end_command_buffer(cmd)?;
                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                let queue = self.queue.lock();
                self.device
                    .queue_submit(*queue, &[submit_info], vk::Fence::null())?;
                self.device.queue_wait_idle(*queue)
            })();

            let _resources = self.resources.lock();
            self.device.free_command_buffers(self.command_pool, &[cmd]);
            result.map_err(err)
        }
    }

    fn warn_missing_shaders(&self) {
        if !self.warned_missing_shaders.swap(true, Ordering::Relaxed) {
            log::warn!("VulkanDevice: no shaders supplied, draw and blur commands are skipped");
        }
    }
}

unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    for (index, family) in queue_families.iter().enumerate() {
        let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let supports_surface = surface_fn
            .get_physical_device_surface_support(physical_device, index as u32, surface)
            .unwrap_or(false);

        if supports_graphics && supports_surface {
            return Some(index as u32);
        }
    }
    None
}

/// Pick the highest scoring GPU that can render to `surface` and supports
/// timeline semaphores. Discrete GPUs win over integrated ones.
unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> BackendResult<(vk::PhysicalDevice, u32)> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(|e| BackendError::InitializationFailed(format!("{:?}", e)))?;

    let mut best: Option<(u32, vk::PhysicalDevice, u32)> = None;
    for physical_device in devices {
        let Some(queue_family) = find_queue_family(instance, physical_device, surface_fn, surface)
        else {
            continue;
        };

        let mut timeline = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut timeline);
        instance.get_physical_device_features2(physical_device, &mut features);
        if timeline.timeline_semaphore == vk::FALSE {
            continue;
        }

        let properties = instance.get_physical_device_properties(physical_device);
        let mut score = properties.limits.max_image_dimension2_d / 1024;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }

        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        log::info!(
            "Found GPU: {} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.map_or(true, |(best_score, _, _)| score > best_score) {
            best = Some((score, physical_device, queue_family));
        }
    }

    best.map(|(_, device, family)| (device, family)).ok_or_else(|| {
        BackendError::InitializationFailed("no GPU with presentation and timeline semaphores".into())
    })
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        let err = |e: vk::Result| BackendError::SwapchainCreationFailed(format!("{:?}", e));
        unsafe {
            let caps = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(err)?;
            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(err)?;
            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(err)?;

            let current_extent = if caps.current_extent.width == u32::MAX {
                None
            } else {
                Some(Extent2d::new(
                    caps.current_extent.width,
                    caps.current_extent.height,
                ))
            };

            let mut supported_formats = Vec::new();
            for format in formats.iter().filter_map(|f| format_from_vk(f.format)) {
                if !supported_formats.contains(&format) {
                    supported_formats.push(format);
                }
            }

            Ok(SurfaceCapabilities {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                current_extent,
                min_extent: Extent2d::new(caps.min_image_extent.width, caps.min_image_extent.height),
                max_extent: Extent2d::new(caps.max_image_extent.width, caps.max_image_extent.height),
                formats: supported_formats,
                present_modes: present_modes
                    .into_iter()
                    .filter_map(present_mode_from_vk)
                    .collect(),
            })
        }
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        old: Option<SwapchainHandle>,
    ) -> BackendResult<SwapchainHandle> {
        let err = |e: vk::Result| match e {
            vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
            other => BackendError::SwapchainCreationFailed(format!("{:?}", other)),
        };
        let format = convert_format(desc.format);

        unsafe {
            let caps = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(err)?;
            let color_space = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(err)?
                .iter()
                .find(|f| f.format == format)
                .map(|f| f.color_space)
                .unwrap_or(vk::ColorSpaceKHR::SRGB_NONLINEAR);

            let mut resources = self.resources.lock();
            let old_handle = old
                .and_then(|h| resources.swapchains.get(&h.0))
                .map(|chain| chain.handle)
                .unwrap_or(vk::SwapchainKHR::null());

            let info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(desc.image_count)
                .image_format(format)
                .image_color_space(color_space)
                .image_extent(convert_extent(desc.extent))
                .image_array_layers(1)
                .image_usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                )
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(caps.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(convert_present_mode(desc.present_mode))
                .clipped(true)
                .old_swapchain(old_handle);

            let handle = self
                .swapchain_fn
                .create_swapchain(&info, None)
                .map_err(err)?;
            let native_images = match self.swapchain_fn.get_swapchain_images(handle) {
                Ok(images) => images,
                Err(e) => {
                    self.swapchain_fn.destroy_swapchain(handle, None);
                    return Err(err(e));
                }
            };

            let mut images = Vec::with_capacity(native_images.len());
            for image in native_images {
                let id = self.alloc_id();
                resources.images.insert(
                    id,
                    VkImage {
                        image,
                        allocation: None,
                        format,
                        extent: desc.extent,
                        mip_levels: 1,
                        usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC,
                        layout: vk::ImageLayout::UNDEFINED,
                    },
                );
                images.push(ImageHandle(id));
            }

            let id = self.alloc_id();
            log::debug!(
                "VulkanDevice: swapchain {} created ({}x{}, {} images)",
                id,
                desc.extent.width,
                desc.extent.height,
                images.len()
            );
            resources
                .swapchains
                .insert(id, VkSwapchain { handle, images });
            Ok(SwapchainHandle(id))
        }
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        self.resources
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|chain| chain.images.clone())
            .ok_or(BackendError::InvalidHandle("swapchain"))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut resources = self.resources.lock();
        if let Some(chain) = resources.swapchains.remove(&swapchain.0) {
            for image in &chain.images {
                resources.images.remove(&image.0);
            }
            unsafe { self.swapchain_fn.destroy_swapchain(chain.handle, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        fence: FenceHandle,
    ) -> BackendResult<AcquireOutcome> {
        let (handle, fence) = {
            let resources = self.resources.lock();
            let chain = resources
                .swapchains
                .get(&swapchain.0)
                .ok_or(BackendError::InvalidHandle("swapchain"))?;
            let fence = *resources
                .fences
                .get(&fence.0)
                .ok_or(BackendError::InvalidHandle("fence"))?;
            (chain.handle, fence)
        };

        let result = unsafe {
            self.swapchain_fn
                .acquire_next_image(handle, u64::MAX, vk::Semaphore::null(), fence)
        };
        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Ready(index)),
            Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(BackendError::SurfaceLost),
            Err(e) => Err(BackendError::AcquireImageFailed(format!("{:?}", e))),
        }
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome> {
        let (handle, semaphore) = {
            let resources = self.resources.lock();
            let chain = resources
                .swapchains
                .get(&swapchain.0)
                .ok_or(BackendError::InvalidHandle("swapchain"))?;
            let semaphore = resources
                .semaphores
                .get(&wait.0)
                .ok_or(BackendError::InvalidHandle("semaphore"))?;
            (chain.handle, semaphore.semaphore)
        };

        let wait_semaphores = [semaphore];
        let swapchains = [handle];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let queue = self.queue.lock();
        match unsafe { self.swapchain_fn.queue_present(*queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(BackendError::SurfaceLost),
            Err(e) => Err(BackendError::PresentFailed(format!("{:?}", e))),
        }
    }

    fn create_image(&self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let err = vk_error("image");
        let format = convert_format(desc.format);
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(convert_image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(convert_samples(desc.samples));

        unsafe {
            let image = self.device.create_image(&info, None).map_err(&err)?;
            let requirements = self.device.get_image_memory_requirements(image);
            let allocation = match self.allocate(
                desc.label.as_deref().unwrap_or("image"),
                requirements,
                MemoryLocation::GpuOnly,
                false,
                "image",
            ) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };
            if let Err(e) =
                self.device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                self.device.destroy_image(image, None);
                self.free(allocation);
                return Err(err(e));
            }

            let id = self.alloc_id();
            self.resources.lock().images.insert(
                id,
                VkImage {
                    image,
                    allocation: Some(allocation),
                    format,
                    extent: desc.extent,
                    mip_levels: desc.mip_levels.max(1),
                    usage: desc.usage,
                    layout: vk::ImageLayout::UNDEFINED,
                },
            );
            Ok(ImageHandle(id))
        }
    }

    fn destroy_image(&self, image: ImageHandle) {
        let removed = {
            let mut resources = self.resources.lock();
            match resources.images.get(&image.0) {
                Some(entry) if entry.is_presentable() => None,
                Some(_) => resources.images.remove(&image.0),
                None => None,
            }
        };
        if let Some(entry) = removed {
            unsafe { self.device.destroy_image(entry.image, None) };
            if let Some(allocation) = entry.allocation {
                self.free(allocation);
            }
        }
    }

    fn write_image(&self, image: ImageHandle, data: &[u8]) -> BackendResult<()> {
        let (native, extent) = {
            let resources = self.resources.lock();
            let entry = resources
                .images
                .get(&image.0)
                .ok_or(BackendError::InvalidHandle("image"))?;
            (entry.image, entry.extent)
        };

        let staging = self.create_buffer(&BufferDescriptor {
            label: Some("image upload".into()),
            size: data.len() as u64,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::HOST_VISIBLE,
        })?;
        let result = self.write_buffer(staging, 0, data).and_then(|()| {
            let src = self
                .resources
                .lock()
                .buffers
                .get(&staging.0)
                .map(|b| b.buffer)
                .ok_or(BackendError::InvalidHandle("buffer"))?;
            self.one_time_submit(|cmd| unsafe {
                recording::upload_image(&self.device, cmd, src, native, extent);
            })
        });
        self.destroy_buffer(staging);
        result?;

        if let Some(entry) = self.resources.lock().images.get_mut(&image.0) {
            entry.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        }
        Ok(())
    }

    fn create_image_view(&self, image: ImageHandle) -> BackendResult<ImageViewHandle> {
        let mut resources = self.resources.lock();
        let entry = resources
            .images
            .get(&image.0)
            .ok_or(BackendError::InvalidHandle("image"))?;

        let info = vk::ImageViewCreateInfo::default()
            .image(entry.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(entry.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: entry.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device.create_image_view(&info, None) }
            .map_err(vk_error("image view"))?;

        let id = self.alloc_id();
        resources.views.insert(id, VkImageView { view, image });
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        let mut resources = self.resources.lock();
        if let Some(entry) = resources.views.remove(&view.0) {
            let stale: Vec<_> = resources
                .blur_sets
                .keys()
                .filter(|(v, _)| *v == view.0)
                .copied()
                .collect();
            for key in stale {
                if let Some(set) = resources.blur_sets.remove(&key) {
                    unsafe {
                        let _ = self.device.free_descriptor_sets(self.descriptor_pool, &[set]);
                    }
                }
            }
            unsafe { self.device.destroy_image_view(entry.view, None) };
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle> {
        let format = convert_format(desc.format);
        let final_layout = match desc.final_layout {
            FinalLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            FinalLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            FinalLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let resolves = desc.samples.is_multisampled() && desc.final_layout == FinalLayout::Present;

        let mut attachments = vec![vk::AttachmentDescription::default()
            .format(format)
            .samples(convert_samples(desc.samples))
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(if resolves {
                vk::AttachmentStoreOp::DONT_CARE
            } else {
                vk::AttachmentStoreOp::STORE
            })
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(if resolves {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                final_layout
            })];
        if resolves {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(final_layout),
            );
        }

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let resolve_refs = [vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if resolves {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass];

        let dependencies = [
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                        | vk::PipelineStageFlags::TRANSFER,
                )
                .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(
                    vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                )
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::SHADER_READ),
        ];

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = unsafe { self.device.create_render_pass(&info, None) }
            .map_err(vk_error("render pass"))?;

        let id = self.alloc_id();
        self.resources.lock().render_passes.insert(
            id,
            VkRenderPass {
                render_pass,
                desc: desc.clone(),
            },
        );
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        let mut resources = self.resources.lock();
        if let Some(entry) = resources.render_passes.remove(&render_pass.0) {
            let pipelines: Vec<_> = resources
                .draw_pipelines
                .keys()
                .filter(|settings| settings.render_pass == render_pass)
                .copied()
                .collect();
            unsafe {
                for settings in pipelines {
                    if let Some(pipeline) = resources.draw_pipelines.remove(&settings) {
                        self.device.destroy_pipeline(pipeline, None);
                    }
                }
                if let Some(pipeline) = resources.blur_pipelines.remove(&render_pass.0) {
                    self.device.destroy_pipeline(pipeline, None);
                }
                self.device.destroy_render_pass(entry.render_pass, None);
            }
        }
    }

    fn create_framebuffer(
        &self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let mut resources = self.resources.lock();
        let pass = resources
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or(BackendError::InvalidHandle("render pass"))?;
        let expected = if pass.resolves() { 2 } else { 1 };
        if desc.attachments.len() != expected {
            return Err(BackendError::creation(
                "framebuffer",
                format!(
                    "render pass takes {} attachments, got {}",
                    expected,
                    desc.attachments.len()
                ),
            ));
        }

        let mut views = Vec::with_capacity(desc.attachments.len());
        let mut images = Vec::with_capacity(desc.attachments.len());
        for attachment in &desc.attachments {
            let view = resources
                .views
                .get(&attachment.0)
                .ok_or(BackendError::InvalidHandle("image view"))?;
            views.push(view.view);
            images.push(view.image);
        }

        let info = vk::FramebufferCreateInfo::default()
            .render_pass(pass.render_pass)
            .attachments(&views)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&info, None) }
            .map_err(vk_error("framebuffer"))?;

        let id = self.alloc_id();
        resources.framebuffers.insert(
            id,
            VkFramebuffer {
                framebuffer,
                render_pass: desc.render_pass,
                images,
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        if let Some(entry) = self.resources.lock().framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(entry.framebuffer, None) };
        }
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let err = vk_error("buffer");
        let info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(convert_buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let location = if !desc.usage.contains(BufferUsage::HOST_VISIBLE) {
            MemoryLocation::GpuOnly
        } else if desc.usage.contains(BufferUsage::TRANSFER_DST)
            && !desc.usage.contains(BufferUsage::TRANSFER_SRC)
        {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        };

        unsafe {
            let buffer = self.device.create_buffer(&info, None).map_err(&err)?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let allocation = match self.allocate(
                desc.label.as_deref().unwrap_or("buffer"),
                requirements,
                location,
                true,
                "buffer",
            ) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                self.free(allocation);
                return Err(err(e));
            }

            let id = self.alloc_id();
            self.resources.lock().buffers.insert(
                id,
                VkBuffer {
                    buffer,
                    allocation,
                    size: desc.size,
                },
            );
            Ok(BufferHandle(id))
        }
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let removed = self.resources.lock().buffers.remove(&buffer.0);
        if let Some(entry) = removed {
            unsafe { self.device.destroy_buffer(entry.buffer, None) };
            self.free(entry.allocation);
        }
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut resources = self.resources.lock();
        let entry = resources
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let size = entry.size;
        let mapped = entry
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::creation("buffer write", "buffer is not host visible"))?;

        let start = offset as usize;
        let end = start + data.len();
        if end as u64 > size || end > mapped.len() {
            return Err(BackendError::creation("buffer write", "write out of bounds"));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let resources = self.resources.lock();
        let entry = resources
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let mapped = entry
            .allocation
            .mapped_slice()
            .ok_or_else(|| BackendError::creation("buffer read", "buffer is not host visible"))?;

        let start = offset as usize;
        let end = start + size as usize;
        if offset + size > entry.size || end > mapped.len() {
            return Err(BackendError::creation("buffer read", "read out of bounds"));
        }
        Ok(mapped[start..end].to_vec())
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        // Border colors are applied in the shader; the fixed-function one is unused.
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter(desc.mag_filter))
            .min_filter(convert_filter(desc.min_filter))
            .mipmap_mode(convert_mipmap_filter(desc.mipmap_filter))
            .address_mode_u(convert_address_mode(desc.address_mode_u))
            .address_mode_v(convert_address_mode(desc.address_mode_v))
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);

        let sampler =
            unsafe { self.device.create_sampler(&info, None) }.map_err(vk_error("sampler"))?;
        let id = self.alloc_id();
        self.resources.lock().samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        let mut resources = self.resources.lock();
        if let Some(native) = resources.samplers.remove(&sampler.0) {
            let stale: Vec<_> = resources
                .blur_sets
                .keys()
                .filter(|(_, s)| *s == sampler.0)
                .copied()
                .collect();
            for key in stale {
                if let Some(set) = resources.blur_sets.remove(&key) {
                    unsafe {
                        let _ = self.device.free_descriptor_sets(self.descriptor_pool, &[set]);
                    }
                }
            }
            unsafe { self.device.destroy_sampler(native, None) };
        }
    }

    fn create_descriptor_set(
        &self,
        binding: &DescriptorBinding,
    ) -> BackendResult<DescriptorSetHandle> {
        let mut resources = self.resources.lock();
        let layout = match binding {
            DescriptorBinding::Sampler(_) => self.layouts.sampler_set,
            DescriptorBinding::Texture(_) => self.layouts.texture_set,
            DescriptorBinding::UniformBuffer(_) => self.layouts.uniform_set,
        };
        let set_layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(vk_error("descriptor set"))?[0];

        let write_result = match binding {
            DescriptorBinding::Sampler(sampler) => resources
                .samplers
                .get(&sampler.0)
                .map(|native| {
                    let infos = [vk::DescriptorImageInfo::default().sampler(*native)];
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::SAMPLER)
                        .image_info(&infos);
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                })
                .ok_or(BackendError::InvalidHandle("sampler")),
            DescriptorBinding::Texture(view) => resources
                .views
                .get(&view.0)
                .map(|entry| {
                    let infos = [vk::DescriptorImageInfo::default()
                        .image_view(entry.view)
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                        .image_info(&infos);
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                })
                .ok_or(BackendError::InvalidHandle("image view")),
            DescriptorBinding::UniformBuffer(buffer) => resources
                .buffers
                .get(&buffer.0)
                .map(|entry| {
                    let infos = [vk::DescriptorBufferInfo::default()
                        .buffer(entry.buffer)
                        .offset(0)
                        .range(vk::WHOLE_SIZE)];
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(0)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&infos);
                    unsafe { self.device.update_descriptor_sets(&[write], &[]) };
                })
                .ok_or(BackendError::InvalidHandle("buffer")),
        };
        if let Err(e) = write_result {
            unsafe {
                let _ = self.device.free_descriptor_sets(self.descriptor_pool, &[set]);
            }
            return Err(e);
        }

        let id = self.alloc_id();
        resources.descriptor_sets.insert(id, set);
        Ok(DescriptorSetHandle(id))
    }

    fn destroy_descriptor_set(&self, set: DescriptorSetHandle) {
        if let Some(native) = self.resources.lock().descriptor_sets.remove(&set.0) {
            unsafe {
                let _ = self
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[native]);
            }
        }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> BackendResult<SemaphoreHandle> {
        let semaphore = unsafe {
            match kind {
                SemaphoreKind::Binary => self
                    .device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None),
                SemaphoreKind::Timeline { initial_value } => {
                    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                        .semaphore_type(vk::SemaphoreType::TIMELINE)
                        .initial_value(initial_value);
                    let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
                    self.device.create_semaphore(&info, None)
                }
            }
        }
        .map_err(vk_error("semaphore"))?;

        let id = self.alloc_id();
        self.resources
            .lock()
            .semaphores
            .insert(id, VkSemaphore { semaphore, kind });
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(entry) = self.resources.lock().semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(entry.semaphore, None) };
        }
    }

    fn wait_semaphore(
        &self,
        semaphore: SemaphoreHandle,
        value: u64,
        timeout: Option<Duration>,
    ) -> BackendResult<bool> {
        let native = {
            let resources = self.resources.lock();
            let entry = resources
                .semaphores
                .get(&semaphore.0)
                .ok_or(BackendError::InvalidHandle("semaphore"))?;
            if entry.kind == SemaphoreKind::Binary {
                return Err(BackendError::WaitFailed(
                    "binary semaphores cannot be waited on the host".into(),
                ));
            }
            entry.semaphore
        };

        let semaphores = [native];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device.wait_semaphores(&info, timeout_ns(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(BackendError::DeviceLost),
            Err(e) => Err(BackendError::WaitFailed(format!("{:?}", e))),
        }
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(vk_error("fence"))?;

        let id = self.alloc_id();
        self.resources.lock().fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if let Some(native) = self.resources.lock().fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(native, None) };
        }
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> BackendResult<bool> {
        let native = *self
            .resources
            .lock()
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence"))?;
        match unsafe {
            self.device
                .wait_for_fences(&[native], true, timeout_ns(timeout))
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(BackendError::DeviceLost),
            Err(e) => Err(BackendError::WaitFailed(format!("{:?}", e))),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let native = *self
            .resources
            .lock()
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence"))?;
        unsafe { self.device.reset_fences(&[native]) }
            .map_err(|e| BackendError::WaitFailed(format!("{:?}", e)))
    }

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle> {
        let mut resources = self.resources.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(vk_error("command buffer"))?[0];

        let id = self.alloc_id();
        resources.command_buffers.insert(id, cmd);
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let mut resources = self.resources.lock();
        if let Some(cmd) = resources.command_buffers.remove(&command_buffer.0) {
            unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        }
    }

    fn record_commands(
        &self,
        command_buffer: CommandBufferHandle,
        commands: &CommandList,
    ) -> BackendResult<()> {
        let mut resources = self.resources.lock();
        let cmd = *resources
            .command_buffers
            .get(&command_buffer.0)
            .ok_or(BackendError::InvalidHandle("command buffer"))?;

        let recording_err = |e: vk::Result| BackendError::RecordingFailed(format!("{:?}", e));
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(recording_err)?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(recording_err)?;

            let mut recorder = recording::Recorder::new(self, &mut resources, cmd);
            let result = recorder.record(commands);
            recorder.finish();

            self.device.end_command_buffer(cmd).map_err(recording_err)?;
            result
        }
    }

    fn submit(&self, submissions: &[SubmitInfo], fence: Option<FenceHandle>) -> BackendResult<()> {
        struct Batch {
            wait_semaphores: Vec<vk::Semaphore>,
            wait_values: Vec<u64>,
            wait_stages: Vec<vk::PipelineStageFlags>,
            command_buffers: Vec<vk::CommandBuffer>,
            signal_semaphores: Vec<vk::Semaphore>,
            signal_values: Vec<u64>,
        }

        let (batches, fence) = {
            let resources = self.resources.lock();
            let semaphore = |handle: SemaphoreHandle| {
                resources
                    .semaphores
                    .get(&handle.0)
                    .map(|s| s.semaphore)
                    .ok_or(BackendError::InvalidHandle("semaphore"))
            };

            let mut batches = Vec::with_capacity(submissions.len());
            for submission in submissions {
                let mut batch = Batch {
                    wait_semaphores: Vec::with_capacity(submission.waits.len()),
                    wait_values: Vec::with_capacity(submission.waits.len()),
                    wait_stages: Vec::with_capacity(submission.waits.len()),
                    command_buffers: Vec::with_capacity(submission.command_buffers.len()),
                    signal_semaphores: Vec::with_capacity(submission.signals.len()),
                    signal_values: Vec::with_capacity(submission.signals.len()),
                };
                for wait in &submission.waits {
                    batch.wait_semaphores.push(semaphore(wait.semaphore)?);
                    batch.wait_values.push(wait.value);
                    batch.wait_stages.push(convert_stages(wait.stages));
                }
                for cb in &submission.command_buffers {
                    batch.command_buffers.push(
                        *resources
                            .command_buffers
                            .get(&cb.0)
                            .ok_or(BackendError::InvalidHandle("command buffer"))?,
                    );
                }
                for signal in &submission.signals {
                    batch.signal_semaphores.push(semaphore(signal.semaphore)?);
                    batch.signal_values.push(signal.value);
                }
                batches.push(batch);
            }

            let fence = match fence {
                Some(f) => *resources
                    .fences
                    .get(&f.0)
                    .ok_or(BackendError::InvalidHandle("fence"))?,
                None => vk::Fence::null(),
            };
            (batches, fence)
        };

        // Values of binary semaphores are ignored by the driver.
        let mut timeline_infos: Vec<_> = batches
            .iter()
            .map(|b| {
                vk::TimelineSemaphoreSubmitInfo::default()
                    .wait_semaphore_values(&b.wait_values)
                    .signal_semaphore_values(&b.signal_values)
            })
            .collect();
        let infos: Vec<_> = batches
            .iter()
            .zip(timeline_infos.iter_mut())
            .map(|(b, timeline)| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&b.wait_semaphores)
                    .wait_dst_stage_mask(&b.wait_stages)
                    .command_buffers(&b.command_buffers)
                    .signal_semaphores(&b.signal_semaphores)
                    .push_next(timeline)
            })
            .collect();

        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &infos, fence) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::SubmitFailed(format!("{:?}", other)),
        })
    }

    fn wait_idle(&self) -> BackendResult<()> {
        let _queue = self.queue.lock();
        unsafe { self.device.device_wait_idle() }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::WaitFailed(format!("{:?}", other)),
        })
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("queue_family", &self.queue_family)
            .field("features", &self.features)
            .field("shaders", &self.shaders.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let resources = std::mem::take(self.resources.get_mut());
            let mut allocator = self.allocator.lock().take();

            for (_, pipeline) in resources.draw_pipelines {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, pipeline) in resources.blur_pipelines {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, framebuffer) in resources.framebuffers {
                self.device.destroy_framebuffer(framebuffer.framebuffer, None);
            }
            for (_, pass) in resources.render_passes {
                self.device.destroy_render_pass(pass.render_pass, None);
            }
            for (_, view) in resources.views {
                self.device.destroy_image_view(view.view, None);
            }
            for (_, image) in resources.images {
                if let Some(allocation) = image.allocation {
                    self.device.destroy_image(image.image, None);
                    if let Some(allocator) = allocator.as_mut() {
                        let _ = allocator.free(allocation);
                    }
                }
            }
            for (_, chain) in resources.swapchains {
                self.swapchain_fn.destroy_swapchain(chain.handle, None);
            }
            for (_, buffer) in resources.buffers {
                self.device.destroy_buffer(buffer.buffer, None);
                if let Some(allocator) = allocator.as_mut() {
                    let _ = allocator.free(buffer.allocation);
                }
            }
            for (_, sampler) in resources.samplers {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, semaphore) in resources.semaphores {
                self.device.destroy_semaphore(semaphore.semaphore, None);
            }
            for (_, fence) in resources.fences {
                self.device.destroy_fence(fence, None);
            }

            // Drop the allocator before destroying the device
            drop(allocator);

            if let Some(shaders) = self.shaders.take() {
                shaders.destroy(&self.device);
            }
            self.layouts.destroy(&self.device);

            // Descriptor sets and command buffers go with their pools
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

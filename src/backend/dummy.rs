//! Dummy GPU device for testing and development.
//!
//! This device doesn't touch any GPU but behaves like a single in-order
//! queue: it validates semaphore wait/signal ordering at submit time,
//! executes the handful of commands that move data (clears, copies,
//! resolves) so read-backs return something meaningful, and logs every
//! submission for inspection.
//!
//! # Completion modes
//!
//! | Mode | Behaviour |
//! |------|-----------|
//! | [`Immediate`](CompletionMode::Immediate) | Work completes as soon as it is submitted |
//! | [`Deferred`](CompletionMode::Deferred) | Work completes only when something waits on it |
//! | [`Stalled`](CompletionMode::Stalled) | Work never completes; bounded waits time out |
//!
//! `Deferred` keeps submitted command buffers in flight for as long as the
//! renderer does not wait on them, which makes re-recording an in-flight
//! command buffer observable as [`BackendError::CommandBufferInFlight`].
//!
//! # Fault injection
//!
//! Acquire and present results can be scripted, and the next N submits,
//! recordings or presents can be made to fail.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use super::traits::*;
use super::types::*;

/// When submitted work is considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    #[default]
    Immediate,
    Deferred,
    Stalled,
}

/// One call to [`GpuDevice::submit`], as seen by the device.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub submissions: Vec<SubmitInfo>,
    pub fence: Option<FenceHandle>,
}

#[derive(Debug)]
struct DummySwapchain {
    desc: SwapchainDescriptor,
    images: Vec<ImageHandle>,
    next_image: u32,
}

#[derive(Debug)]
struct DummyImage {
    desc: ImageDescriptor,
    data: Vec<u8>,
}

#[derive(Debug)]
struct DummySemaphore {
    kind: SemaphoreKind,
    /// Value reached by completed work.
    value: u64,
    /// Highest value promised by submitted work.
    promised: u64,
    /// Binary: signals submitted and not yet consumed by a wait.
    pending_signals: u32,
}

#[derive(Debug, Default)]
struct DummyCommandBuffer {
    commands: CommandList,
    in_flight: bool,
}

#[derive(Debug)]
struct PendingBatch {
    submissions: Vec<SubmitInfo>,
    fence: Option<FenceHandle>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    acquire: VecDeque<AcquireOutcome>,
    present: VecDeque<PresentOutcome>,
    failing_submits: u32,
    failing_records: u32,
    failing_presents: u32,
    failing_creations: u32,
}

#[derive(Debug)]
struct DummyState {
    next_id: u64,
    mode: CompletionMode,
    capabilities: SurfaceCapabilities,
    swapchains: HashMap<u64, DummySwapchain>,
    images: HashMap<u64, DummyImage>,
    views: HashMap<u64, ImageHandle>,
    render_passes: HashSet<u64>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    buffers: HashMap<u64, Vec<u8>>,
    samplers: HashSet<u64>,
    descriptor_sets: HashSet<u64>,
    semaphores: HashMap<u64, DummySemaphore>,
    fences: HashMap<u64, bool>,
    command_buffers: HashMap<u64, DummyCommandBuffer>,
    pending: VecDeque<PendingBatch>,
    log: Vec<SubmitRecord>,
    presented: Vec<u32>,
    swapchains_created: usize,
    faults: FaultPlan,
}

/// Headless [`GpuDevice`].
#[derive(Debug)]
pub struct DummyDevice {
    state: Mutex<DummyState>,
}

impl DummyDevice {
    /// Create a device with a 2..=3 image surface and immediate completion.
    pub fn new() -> Self {
        Self::with_mode(CompletionMode::Immediate)
    }

    /// Create a device with the given completion mode.
    pub fn with_mode(mode: CompletionMode) -> Self {
        let capabilities = SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: None,
            min_extent: Extent2d::new(1, 1),
            max_extent: Extent2d::new(16384, 16384),
            formats: vec![TextureFormat::Bgra8Unorm, TextureFormat::Rgba8Unorm],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate],
        };

        Self {
            state: Mutex::new(DummyState {
                next_id: 1,
                mode,
                capabilities,
                swapchains: HashMap::new(),
                images: HashMap::new(),
                views: HashMap::new(),
                render_passes: HashSet::new(),
                framebuffers: HashMap::new(),
                buffers: HashMap::new(),
                samplers: HashSet::new(),
                descriptor_sets: HashSet::new(),
                semaphores: HashMap::new(),
                fences: HashMap::new(),
                command_buffers: HashMap::new(),
                pending: VecDeque::new(),
                log: Vec::new(),
                presented: Vec::new(),
                swapchains_created: 0,
                faults: FaultPlan::default(),
            }),
        }
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state.lock().mode = mode;
    }

    /// Simulate the OS resizing the surface.
    ///
    /// The next acquire on a chain of a different size reports
    /// [`AcquireOutcome::OutOfDate`].
    pub fn resize_surface(&self, width: u32, height: u32) {
        self.state.lock().capabilities.current_extent = Some(Extent2d::new(width, height));
    }

    /// Change how many images the surface allows.
    pub fn set_image_count_range(&self, min: u32, max: u32) {
        let mut state = self.state.lock();
        state.capabilities.min_image_count = min;
        state.capabilities.max_image_count = max;
    }

    /// Results returned by the next acquires, before normal behaviour resumes.
    pub fn script_acquire(&self, outcomes: impl IntoIterator<Item = AcquireOutcome>) {
        self.state.lock().faults.acquire.extend(outcomes);
    }

    /// Results returned by the next presents, before normal behaviour resumes.
    pub fn script_present(&self, outcomes: impl IntoIterator<Item = PresentOutcome>) {
        self.state.lock().faults.present.extend(outcomes);
    }

    /// Make the next `count` submits fail with [`BackendError::SubmitFailed`].
    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().faults.failing_submits = count;
    }

    /// Make the next `count` recordings fail with [`BackendError::RecordingFailed`].
    pub fn fail_next_records(&self, count: u32) {
        self.state.lock().faults.failing_records = count;
    }

    /// Make the next `count` presents fail with [`BackendError::PresentFailed`].
    ///
    /// The wait semaphore is still consumed, as a real queue does.
    pub fn fail_next_presents(&self, count: u32) {
        self.state.lock().faults.failing_presents = count;
    }

    /// Make the next `count` object creations fail with [`BackendError::OutOfMemory`].
    pub fn fail_next_creations(&self, count: u32) {
        self.state.lock().faults.failing_creations = count;
    }

    /// Every submit call so far, oldest first.
    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().log.clone()
    }

    /// Number of submit calls so far.
    pub fn submit_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Image indices presented so far, oldest first.
    pub fn presented(&self) -> Vec<u32> {
        self.state.lock().presented.clone()
    }

    pub fn swapchains_created(&self) -> usize {
        self.state.lock().swapchains_created
    }

    /// Commands last recorded into `command_buffer`.
    pub fn recorded_commands(&self, command_buffer: CommandBufferHandle) -> Option<CommandList> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer.0)
            .map(|cb| cb.commands.clone())
    }

    /// Value reached by completed work on a timeline semaphore.
    pub fn semaphore_value(&self, semaphore: SemaphoreHandle) -> Option<u64> {
        self.state.lock().semaphores.get(&semaphore.0).map(|s| s.value)
    }

    /// Number of submit batches not yet completed.
    pub fn pending_batches(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Complete all pending work, regardless of completion mode.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while state.complete_next() {}
    }

    /// Number of live semaphores, fences and command buffers.
    pub fn live_sync_objects(&self) -> usize {
        let state = self.state.lock();
        state.semaphores.len() + state.fences.len() + state.command_buffers.len()
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyState {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_creation(&mut self, kind: &'static str) -> BackendResult<()> {
        if self.faults.failing_creations > 0 {
            self.faults.failing_creations -= 1;
            log::trace!("DummyDevice: injected {} creation failure", kind);
            return Err(BackendError::OutOfMemory);
        }
        Ok(())
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> ImageHandle {
        let id = self.alloc_id();
        self.images.insert(
            id,
            DummyImage {
                desc: desc.clone(),
                data: Vec::new(),
            },
        );
        ImageHandle(id)
    }

    /// Complete the oldest pending batch. Returns `false` if none is pending.
    fn complete_next(&mut self) -> bool {
        let Some(batch) = self.pending.pop_front() else {
            return false;
        };

        for submission in &batch.submissions {
            for cb in &submission.command_buffers {
                let commands = match self.command_buffers.get_mut(&cb.0) {
                    Some(buffer) => {
                        buffer.in_flight = false;
                        buffer.commands.clone()
                    }
                    None => continue,
                };
                for command in commands.iter() {
                    self.execute(command);
                }
            }
            for signal in &submission.signals {
                if let Some(semaphore) = self.semaphores.get_mut(&signal.semaphore.0) {
                    if let SemaphoreKind::Timeline { .. } = semaphore.kind {
                        semaphore.value = semaphore.value.max(signal.value);
                    }
                }
            }
        }

        if let Some(fence) = batch.fence {
            self.fences.insert(fence.0, true);
        }
        log::trace!(
            "DummyDevice: completed batch of {} submissions",
            batch.submissions.len()
        );
        true
    }

    fn image_for_view(&self, view: ImageViewHandle) -> Option<ImageHandle> {
        self.views.get(&view.0).copied()
    }

    fn execute(&mut self, command: &Command) {
        match command {
            Command::BeginRenderPass {
                framebuffer,
                clear_color,
                ..
            } => {
                let target = self
                    .framebuffers
                    .get(&framebuffer.0)
                    .and_then(|fb| fb.attachments.last().copied())
                    .and_then(|view| self.image_for_view(view));
                if let Some(image) = target.and_then(|image| self.images.get_mut(&image.0)) {
                    let texel = encode_color(*clear_color, image.desc.format);
                    let texels = (image.desc.extent.width * image.desc.extent.height) as usize;
                    image.data = texel.iter().copied().cycle().take(texels * 4).collect();
                }
            }
            Command::CopyBuffer { src, dst, size } => {
                if let Some(data) = self.buffers.get(&src.0).cloned() {
                    if let Some(target) = self.buffers.get_mut(&dst.0) {
                        let len = (*size as usize).min(data.len()).min(target.len());
                        target[..len].copy_from_slice(&data[..len]);
                    }
                }
            }
            Command::ResolveImage { src, dst, .. } | Command::GenerateMipmaps { src, dst, .. } => {
                if let Some(data) = self.images.get(&src.0).map(|i| i.data.clone()) {
                    if let Some(target) = self.images.get_mut(&dst.0) {
                        target.data = data;
                    }
                }
            }
            Command::CopyImageToBuffer { image, buffer, extent } => {
                let size = (extent.width * extent.height * 4) as usize;
                let data = self
                    .images
                    .get(&image.0)
                    .map(|i| i.data.clone())
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| vec![0; size]);
                if let Some(target) = self.buffers.get_mut(&buffer.0) {
                    let len = size.min(data.len()).min(target.len());
                    target[..len].copy_from_slice(&data[..len]);
                }
            }
            _ => {}
        }
    }

    /// Complete batches in order until `done` holds or nothing is left.
    fn complete_until(&mut self, done: impl Fn(&DummyState) -> bool) -> bool {
        if self.mode == CompletionMode::Stalled {
            return done(self);
        }
        while !done(self) {
            if !self.complete_next() {
                break;
            }
        }
        done(self)
    }
}

fn encode_color(color: [f32; 4], format: TextureFormat) -> [u8; 4] {
    let to_byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    let [r, g, b, a] = color.map(to_byte);
    if format.is_bgra() {
        [b, g, r, a]
    } else {
        [r, g, b, a]
    }
}

impl GpuDevice for DummyDevice {
    fn name(&self) -> &'static str {
        "Dummy Device"
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        Ok(self.state.lock().capabilities.clone())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        old: Option<SwapchainHandle>,
    ) -> BackendResult<SwapchainHandle> {
        let mut state = self.state.lock();
        state.check_creation("swapchain")?;
        if desc.extent.is_empty() {
            return Err(BackendError::SwapchainCreationFailed(
                "zero sized surface".into(),
            ));
        }

        if let Some(old) = old {
            state.swapchains.remove(&old.0);
        }

        let images = (0..desc.image_count)
            .map(|i| {
                state.create_image(&ImageDescriptor {
                    label: Some(format!("swapchain image {i}")),
                    extent: desc.extent,
                    format: desc.format,
                    usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC,
                    ..Default::default()
                })
            })
            .collect();

        let id = state.alloc_id();
        state.swapchains.insert(
            id,
            DummySwapchain {
                desc: desc.clone(),
                images,
                next_image: 0,
            },
        );
        state.swapchains_created += 1;

        log::trace!(
            "DummyDevice: created swapchain {}x{} with {} images",
            desc.extent.width,
            desc.extent.height,
            desc.image_count
        );
        Ok(SwapchainHandle(id))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|s| s.images.clone())
            .ok_or(BackendError::InvalidHandle("swapchain"))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut state = self.state.lock();
        if let Some(chain) = state.swapchains.remove(&swapchain.0) {
            for image in chain.images {
                state.images.remove(&image.0);
            }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        fence: FenceHandle,
    ) -> BackendResult<AcquireOutcome> {
        let mut state = self.state.lock();
        let surface_extent = state.capabilities.current_extent;
        let scripted = state.faults.acquire.pop_front();

        let chain = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or(BackendError::InvalidHandle("swapchain"))?;
        let count = chain.images.len() as u32;

        let outcome = match scripted {
            Some(AcquireOutcome::OutOfDate) => AcquireOutcome::OutOfDate,
            Some(AcquireOutcome::Ready(index)) => AcquireOutcome::Ready(index % count),
            Some(AcquireOutcome::Suboptimal(index)) => AcquireOutcome::Suboptimal(index % count),
            None => match surface_extent {
                Some(extent) if extent != chain.desc.extent => AcquireOutcome::OutOfDate,
                _ => {
                    let index = chain.next_image;
                    chain.next_image = (index + 1) % count;
                    AcquireOutcome::Ready(index)
                }
            },
        };

        if outcome != AcquireOutcome::OutOfDate {
            state.fences.insert(fence.0, true);
        }
        log::trace!("DummyDevice: acquire -> {:?}", outcome);
        Ok(outcome)
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome> {
        let mut state = self.state.lock();
        if !state.swapchains.contains_key(&swapchain.0) {
            return Err(BackendError::InvalidHandle("swapchain"));
        }

        let semaphore = state
            .semaphores
            .get_mut(&wait.0)
            .ok_or(BackendError::InvalidHandle("semaphore"))?;
        if semaphore.pending_signals == 0 {
            return Err(BackendError::PresentFailed(
                "present waits on a semaphore nothing signals".into(),
            ));
        }
        semaphore.pending_signals -= 1;

        if state.faults.failing_presents > 0 {
            state.faults.failing_presents -= 1;
            return Err(BackendError::PresentFailed("injected present failure".into()));
        }
        state.presented.push(image_index);
        Ok(state
            .faults
            .present
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn create_image(&self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let mut state = self.state.lock();
        state.check_creation("image")?;
        log::trace!(
            "DummyDevice: creating image {:?} ({}x{}, {} mips)",
            desc.label,
            desc.extent.width,
            desc.extent.height,
            desc.mip_levels
        );
        Ok(state.create_image(desc))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.lock().images.remove(&image.0);
    }

    fn write_image(&self, image: ImageHandle, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        let image = state
            .images
            .get_mut(&image.0)
            .ok_or(BackendError::InvalidHandle("image"))?;
        image.data = data.to_vec();
        Ok(())
    }

    fn create_image_view(&self, image: ImageHandle) -> BackendResult<ImageViewHandle> {
        let mut state = self.state.lock();
        state.check_creation("image view")?;
        if !state.images.contains_key(&image.0) {
            return Err(BackendError::InvalidHandle("image"));
        }
        let id = state.alloc_id();
        state.views.insert(id, image);
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.state.lock().views.remove(&view.0);
    }

    fn create_render_pass(&self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle> {
        let mut state = self.state.lock();
        state.check_creation("render pass")?;
        log::trace!("DummyDevice: creating render pass {:?}", desc.label);
        let id = state.alloc_id();
        state.render_passes.insert(id);
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        self.state.lock().render_passes.remove(&render_pass.0);
    }

    fn create_framebuffer(
        &self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let mut state = self.state.lock();
        state.check_creation("framebuffer")?;
        if !state.render_passes.contains(&desc.render_pass.0) {
            return Err(BackendError::InvalidHandle("render pass"));
        }
        let id = state.alloc_id();
        state.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        self.state.lock().framebuffers.remove(&framebuffer.0);
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let mut state = self.state.lock();
        state.check_creation("buffer")?;
        log::trace!(
            "DummyDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = state.alloc_id();
        state.buffers.insert(id, vec![0; desc.size as usize]);
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        let target = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > target.len() {
            return Err(BackendError::OutOfMemory);
        }
        target[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let state = self.state.lock();
        let source = state
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let start = offset as usize;
        let end = start + size as usize;
        source
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(BackendError::InvalidHandle("buffer range"))
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let mut state = self.state.lock();
        state.check_creation("sampler")?;
        log::trace!("DummyDevice: creating sampler {:?}", desc.label);
        let id = state.alloc_id();
        state.samplers.insert(id);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.state.lock().samplers.remove(&sampler.0);
    }

    fn create_descriptor_set(
        &self,
        binding: &DescriptorBinding,
    ) -> BackendResult<DescriptorSetHandle> {
        let mut state = self.state.lock();
        state.check_creation("descriptor set")?;
        log::trace!("DummyDevice: creating descriptor set for {:?}", binding);
        let id = state.alloc_id();
        state.descriptor_sets.insert(id);
        Ok(DescriptorSetHandle(id))
    }

    fn destroy_descriptor_set(&self, set: DescriptorSetHandle) {
        self.state.lock().descriptor_sets.remove(&set.0);
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> BackendResult<SemaphoreHandle> {
        let mut state = self.state.lock();
        state.check_creation("semaphore")?;
        let initial = match kind {
            SemaphoreKind::Binary => 0,
            SemaphoreKind::Timeline { initial_value } => initial_value,
        };
        let id = state.alloc_id();
        state.semaphores.insert(
            id,
            DummySemaphore {
                kind,
                value: initial,
                promised: initial,
                pending_signals: 0,
            },
        );
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().semaphores.remove(&semaphore.0);
    }

    fn wait_semaphore(
        &self,
        semaphore: SemaphoreHandle,
        value: u64,
        timeout: Option<Duration>,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock();
        if !state.semaphores.contains_key(&semaphore.0) {
            return Err(BackendError::InvalidHandle("semaphore"));
        }
        let reached = state.complete_until(|s| {
            s.semaphores
                .get(&semaphore.0)
                .map_or(true, |sem| sem.value >= value)
        });
        match (reached, timeout) {
            (true, _) => Ok(true),
            (false, Some(_)) => Ok(false),
            (false, None) => Err(BackendError::WaitFailed(format!(
                "semaphore {:?} can never reach {}",
                semaphore, value
            ))),
        }
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle> {
        let mut state = self.state.lock();
        state.check_creation("fence")?;
        let id = state.alloc_id();
        state.fences.insert(id, signaled);
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> BackendResult<bool> {
        let mut state = self.state.lock();
        if !state.fences.contains_key(&fence.0) {
            return Err(BackendError::InvalidHandle("fence"));
        }
        let signaled = state.complete_until(|s| s.fences.get(&fence.0).copied().unwrap_or(true));
        match (signaled, timeout) {
            (true, _) => Ok(true),
            (false, Some(_)) => Ok(false),
            (false, None) => Err(BackendError::WaitFailed(format!(
                "fence {:?} is never signaled",
                fence
            ))),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        match state.fences.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(BackendError::InvalidHandle("fence")),
        }
    }

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        state.check_creation("command buffer")?;
        let id = state.alloc_id();
        state
            .command_buffers
            .insert(id, DummyCommandBuffer::default());
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        self.state.lock().command_buffers.remove(&command_buffer.0);
    }

    fn record_commands(
        &self,
        command_buffer: CommandBufferHandle,
        commands: &CommandList,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.faults.failing_records > 0 {
            state.faults.failing_records -= 1;
            return Err(BackendError::RecordingFailed("injected failure".into()));
        }
        let buffer = state
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or(BackendError::InvalidHandle("command buffer"))?;
        if buffer.in_flight {
            return Err(BackendError::CommandBufferInFlight(command_buffer));
        }
        buffer.commands = commands.clone();
        log::trace!(
            "DummyDevice: recorded {} commands into {:?}",
            commands.len(),
            command_buffer
        );
        Ok(())
    }

    fn submit(&self, submissions: &[SubmitInfo], fence: Option<FenceHandle>) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.faults.failing_submits > 0 {
            state.faults.failing_submits -= 1;
            return Err(BackendError::SubmitFailed("injected failure".into()));
        }

        // Validate against a scratch copy so a rejected batch has no effect.
        let mut promised: HashMap<u64, (SemaphoreKind, u64, u32)> = state
            .semaphores
            .iter()
            .map(|(id, s)| (*id, (s.kind, s.promised, s.pending_signals)))
            .collect();

        for (index, submission) in submissions.iter().enumerate() {
            for wait in &submission.waits {
                let entry = promised
                    .get_mut(&wait.semaphore.0)
                    .ok_or(BackendError::InvalidHandle("semaphore"))?;
                match entry.0 {
                    SemaphoreKind::Binary if entry.2 == 0 => {
                        return Err(BackendError::SubmitFailed(format!(
                            "submission {index} waits on binary semaphore {:?} that nothing signals",
                            wait.semaphore
                        )));
                    }
                    SemaphoreKind::Binary => entry.2 -= 1,
                    SemaphoreKind::Timeline { .. } if entry.1 < wait.value => {
                        return Err(BackendError::SubmitFailed(format!(
                            "submission {index} waits on {:?} for {} but only {} is ever signaled",
                            wait.semaphore, wait.value, entry.1
                        )));
                    }
                    SemaphoreKind::Timeline { .. } => {}
                }
            }
            for cb in &submission.command_buffers {
                match state.command_buffers.get(&cb.0) {
                    Some(buffer) if buffer.in_flight => {
                        return Err(BackendError::CommandBufferInFlight(*cb));
                    }
                    Some(_) => {}
                    None => return Err(BackendError::InvalidHandle("command buffer")),
                }
            }
            for signal in &submission.signals {
                let entry = promised
                    .get_mut(&signal.semaphore.0)
                    .ok_or(BackendError::InvalidHandle("semaphore"))?;
                match entry.0 {
                    SemaphoreKind::Binary => entry.2 += 1,
                    SemaphoreKind::Timeline { .. } if signal.value <= entry.1 => {
                        return Err(BackendError::SubmitFailed(format!(
                            "timeline {:?} signaled with {} after {}",
                            signal.semaphore, signal.value, entry.1
                        )));
                    }
                    SemaphoreKind::Timeline { .. } => entry.1 = signal.value,
                }
            }
        }

        for (id, (_, value, pending)) in promised {
            if let Some(semaphore) = state.semaphores.get_mut(&id) {
                semaphore.promised = value;
                semaphore.pending_signals = pending;
            }
        }
        for submission in submissions {
            for cb in &submission.command_buffers {
                if let Some(buffer) = state.command_buffers.get_mut(&cb.0) {
                    buffer.in_flight = true;
                }
            }
        }
        if let Some(fence) = fence {
            state.fences.insert(fence.0, false);
        }

        state.log.push(SubmitRecord {
            submissions: submissions.to_vec(),
            fence,
        });
        state.pending.push_back(PendingBatch {
            submissions: submissions.to_vec(),
            fence,
        });
        log::trace!("DummyDevice: submitted {} entries", submissions.len());

        if state.mode == CompletionMode::Immediate {
            while state.complete_next() {}
        }
        Ok(())
    }

    fn wait_idle(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.mode == CompletionMode::Stalled && !state.pending.is_empty() {
            return Err(BackendError::WaitFailed("device is stalled".into()));
        }
        while state.complete_next() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_signal(device: &DummyDevice, semaphore: SemaphoreHandle, value: u64) {
        let cb = device.allocate_command_buffer().unwrap();
        device.record_commands(cb, &CommandList::new()).unwrap();
        device
            .submit(
                &[SubmitInfo {
                    command_buffers: vec![cb],
                    signals: vec![SemaphoreSignal { semaphore, value }],
                    ..Default::default()
                }],
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_immediate_completion_signals_timeline() {
        let device = DummyDevice::new();
        let sem = device
            .create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })
            .unwrap();
        submit_signal(&device, sem, 1);
        assert_eq!(device.semaphore_value(sem), Some(1));
        assert_eq!(device.pending_batches(), 0);
    }

    #[test]
    fn test_deferred_completion_on_wait() {
        let device = DummyDevice::with_mode(CompletionMode::Deferred);
        let sem = device
            .create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })
            .unwrap();
        submit_signal(&device, sem, 1);
        assert_eq!(device.semaphore_value(sem), Some(0));
        assert!(device.wait_semaphore(sem, 1, None).unwrap());
        assert_eq!(device.semaphore_value(sem), Some(1));
    }

    #[test]
    fn test_timeline_must_increase() {
        let device = DummyDevice::new();
        let sem = device
            .create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })
            .unwrap();
        submit_signal(&device, sem, 2);

        let cb = device.allocate_command_buffer().unwrap();
        device.record_commands(cb, &CommandList::new()).unwrap();
        let result = device.submit(
            &[SubmitInfo {
                command_buffers: vec![cb],
                signals: vec![SemaphoreSignal { semaphore: sem, value: 2 }],
                ..Default::default()
            }],
            None,
        );
        assert!(matches!(result, Err(BackendError::SubmitFailed(_))));
    }

    #[test]
    fn test_wait_on_unsignaled_binary_rejected() {
        let device = DummyDevice::new();
        let sem = device.create_semaphore(SemaphoreKind::Binary).unwrap();
        let cb = device.allocate_command_buffer().unwrap();
        device.record_commands(cb, &CommandList::new()).unwrap();
        let result = device.submit(
            &[SubmitInfo {
                waits: vec![SemaphoreWait {
                    semaphore: sem,
                    value: 1,
                    stages: PipelineStages::ALL_COMMANDS,
                }],
                command_buffers: vec![cb],
                ..Default::default()
            }],
            None,
        );
        assert!(result.is_err());
        assert_eq!(device.submit_count(), 0);
    }

    #[test]
    fn test_record_in_flight_rejected() {
        let device = DummyDevice::with_mode(CompletionMode::Deferred);
        let cb = device.allocate_command_buffer().unwrap();
        let fence = device.create_fence(false).unwrap();
        device.record_commands(cb, &CommandList::new()).unwrap();
        device
            .submit(
                &[SubmitInfo {
                    command_buffers: vec![cb],
                    ..Default::default()
                }],
                Some(fence),
            )
            .unwrap();

        assert_eq!(
            device.record_commands(cb, &CommandList::new()),
            Err(BackendError::CommandBufferInFlight(cb))
        );
        assert!(device.wait_fence(fence, None).unwrap());
        assert!(device.record_commands(cb, &CommandList::new()).is_ok());
    }

    #[test]
    fn test_stalled_wait_times_out() {
        let device = DummyDevice::with_mode(CompletionMode::Stalled);
        let cb = device.allocate_command_buffer().unwrap();
        let fence = device.create_fence(false).unwrap();
        device.record_commands(cb, &CommandList::new()).unwrap();
        device
            .submit(
                &[SubmitInfo {
                    command_buffers: vec![cb],
                    ..Default::default()
                }],
                Some(fence),
            )
            .unwrap();
        assert!(!device
            .wait_fence(fence, Some(Duration::from_millis(1)))
            .unwrap());
        assert!(device.wait_idle().is_err());
    }

    #[test]
    fn test_scripted_acquire() {
        let device = DummyDevice::new();
        let chain = device
            .create_swapchain(
                &SwapchainDescriptor {
                    extent: Extent2d::new(4, 4),
                    format: TextureFormat::Bgra8Unorm,
                    present_mode: PresentMode::Fifo,
                    image_count: 2,
                },
                None,
            )
            .unwrap();
        let fence = device.create_fence(false).unwrap();
        device.script_acquire([AcquireOutcome::OutOfDate]);
        assert_eq!(
            device.acquire_next_image(chain, fence).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert_eq!(
            device.acquire_next_image(chain, fence).unwrap(),
            AcquireOutcome::Ready(0)
        );
        assert_eq!(
            device.acquire_next_image(chain, fence).unwrap(),
            AcquireOutcome::Ready(1)
        );
    }

    #[test]
    fn test_clear_and_readback() {
        let device = DummyDevice::new();
        let image = device
            .create_image(&ImageDescriptor {
                extent: Extent2d::new(2, 2),
                format: TextureFormat::Bgra8Unorm,
                ..Default::default()
            })
            .unwrap();
        let view = device.create_image_view(image).unwrap();
        let pass = device
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                format: TextureFormat::Bgra8Unorm,
                samples: Multisamples::X1,
                final_layout: FinalLayout::TransferSrc,
            })
            .unwrap();
        let framebuffer = device
            .create_framebuffer(&FramebufferDescriptor {
                render_pass: pass,
                attachments: vec![view],
                extent: Extent2d::new(2, 2),
            })
            .unwrap();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: BufferUsage::TRANSFER_DST | BufferUsage::HOST_VISIBLE,
            })
            .unwrap();

        let mut commands = CommandList::new();
        commands.push(Command::BeginRenderPass {
            render_pass: pass,
            framebuffer,
            extent: Extent2d::new(2, 2),
            clear_color: [1.0, 0.0, 0.0, 1.0],
        });
        commands.push(Command::EndRenderPass);
        commands.push(Command::CopyImageToBuffer {
            image,
            buffer,
            extent: Extent2d::new(2, 2),
        });
        let cb = device.allocate_command_buffer().unwrap();
        device.record_commands(cb, &commands).unwrap();
        device
            .submit(
                &[SubmitInfo {
                    command_buffers: vec![cb],
                    ..Default::default()
                }],
                None,
            )
            .unwrap();

        let data = device.read_buffer(buffer, 0, 4).unwrap();
        assert_eq!(data, vec![0, 0, 255, 255]);
    }
}

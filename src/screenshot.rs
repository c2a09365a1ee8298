//! Window screenshots.
//!
//! A request is served by the next frame that is recorded: its swapchain
//! image is copied into a read-back buffer after the render pass. Once that
//! frame is known to have finished, the pixels are read back and either
//! handed to the application or encoded to a file on a worker thread.
//!
//! ```text
//! Idle ─► Requested ─► WaitingRender(slot) ─┬─────────────────────┬─► WaitingEventReport ─► Idle
//!                                           └─► WaitingFileWrite ─┘
//! ```
//!
//! Every request produces exactly one [`ScreenshotEvent`].

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{ColorType, ImageFormat};
use parking_lot::Mutex;

use crate::backend::*;
use crate::error::RenderResult;
use crate::report::{ReportSeverity, Reporter};
use crate::sync::Fence;
use crate::task::TaskRunner;

const JPEG_QUALITY: u8 = 90;

/// Outcome of a screenshot request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScreenshotEvent {
    /// The image was written to this path.
    SavedToFile(PathBuf),
    /// Tightly packed RGBA8, or RGB8 without alpha, top row first.
    Data {
        width: u32,
        height: u32,
        include_alpha: bool,
        pixels: Vec<u8>,
    },
    Failed(String),
}

/// Receives screenshot results on the render thread.
pub type ScreenshotHandler = Box<dyn FnMut(ScreenshotEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Png,
    Bmp,
    Tga,
    Jpeg,
}

impl FileFormat {
    fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "png" => Some(FileFormat::Png),
            "bmp" => Some(FileFormat::Bmp),
            "tga" => Some(FileFormat::Tga),
            "jpg" | "jpeg" => Some(FileFormat::Jpeg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    File(PathBuf, FileFormat),
    Data,
}

/// Result slot shared with the encoding task.
#[derive(Debug, Default)]
struct FileJob {
    done: Fence,
    result: Mutex<Option<ScreenshotEvent>>,
}

#[derive(Debug)]
enum State {
    Idle,
    Requested {
        target: Target,
        include_alpha: bool,
    },
    WaitingRender {
        slot: usize,
        target: Target,
        include_alpha: bool,
        extent: Extent2d,
        format: TextureFormat,
    },
    WaitingFileWrite(Arc<FileJob>),
    WaitingEventReport(ScreenshotEvent),
}

/// Screenshot state of one window.
pub(crate) struct ScreenshotManager {
    device: Arc<dyn GpuDevice>,
    reporter: Reporter,
    runner: Arc<dyn TaskRunner>,
    state: State,
    readback: Option<(BufferHandle, u64)>,
    handler: Option<ScreenshotHandler>,
}

impl ScreenshotManager {
    pub fn new(device: Arc<dyn GpuDevice>, reporter: Reporter, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            device,
            reporter,
            runner,
            state: State::Idle,
            readback: None,
            handler: None,
        }
    }

    pub fn set_handler(&mut self, handler: Option<ScreenshotHandler>) {
        self.handler = handler;
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Whether a request is waiting for a frame to be recorded.
    #[cfg(test)]
    pub fn is_requested(&self) -> bool {
        matches!(self.state, State::Requested { .. })
    }

    pub fn request_file(&mut self, path: &Path, include_alpha: bool) -> bool {
        let (path, format) = match FileFormat::from_path(path) {
            Some(format) => (path.to_path_buf(), format),
            None => {
                let mut appended = path.as_os_str().to_owned();
                appended.push(".png");
                let appended = PathBuf::from(appended);
                self.reporter.report(
                    ReportSeverity::Info,
                    format!(
                        "Screenshot extension not known, saving as '{}'",
                        appended.display()
                    ),
                );
                (appended, FileFormat::Png)
            }
        };
        self.request(Target::File(path, format), include_alpha)
    }

    pub fn request_data(&mut self, include_alpha: bool) -> bool {
        self.request(Target::Data, include_alpha)
    }

    fn request(&mut self, target: Target, include_alpha: bool) -> bool {
        if !self.is_idle() {
            self.reporter.report(
                ReportSeverity::Info,
                "Screenshot request ignored: previous screenshot has not been processed yet",
            );
            return false;
        }
        log::debug!("Screenshot requested ({:?})", target);
        self.state = State::Requested {
            target,
            include_alpha,
        };
        true
    }

    /// Copy command for the frame being recorded in `slot`, if a screenshot
    /// is requested.
    pub fn pending_copy(
        &mut self,
        slot: usize,
        image: ImageHandle,
        extent: Extent2d,
        format: TextureFormat,
    ) -> RenderResult<Option<Command>> {
        let (target, include_alpha) = match &self.state {
            State::Requested {
                target,
                include_alpha,
            } => (target.clone(), *include_alpha),
            _ => return Ok(None),
        };

        let buffer = self.ensure_readback(extent)?;
        self.state = State::WaitingRender {
            slot,
            target,
            include_alpha,
            extent,
            format,
        };
        Ok(Some(Command::CopyImageToBuffer {
            image,
            buffer,
            extent,
        }))
    }

    fn ensure_readback(&mut self, extent: Extent2d) -> RenderResult<BufferHandle> {
        let size = u64::from(extent.width) * u64::from(extent.height) * 4;
        if let Some((buffer, capacity)) = self.readback {
            if capacity >= size {
                return Ok(buffer);
            }
            self.device.destroy_buffer(buffer);
            self.readback = None;
        }
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some("screenshot readback".into()),
            size,
            usage: BufferUsage::HOST_VISIBLE | BufferUsage::TRANSFER_DST,
        })?;
        self.readback = Some((buffer, size));
        Ok(buffer)
    }

    /// The frame recorded in `slot` was never submitted; retry with the next.
    pub fn frame_aborted(&mut self, slot: usize) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        self.state = match state {
            State::WaitingRender {
                slot: waiting,
                target,
                include_alpha,
                ..
            } if waiting == slot => State::Requested {
                target,
                include_alpha,
            },
            other => other,
        };
    }

    /// The frame in `slot` finished on the GPU.
    pub fn on_frame_finished(&mut self, slot: usize) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        let (target, include_alpha, extent, format) = match state {
            State::WaitingRender {
                slot: waiting,
                target,
                include_alpha,
                extent,
                format,
            } if waiting == slot => (target, include_alpha, extent, format),
            other => {
                self.state = other;
                return;
            }
        };

        let pixels = match self.read_pixels(extent, format, include_alpha) {
            Ok(pixels) => pixels,
            Err(e) => {
                self.reporter.report(
                    ReportSeverity::NonCriticalError,
                    format!("Cannot read back screenshot: {}", e),
                );
                self.state = State::WaitingEventReport(ScreenshotEvent::Failed(e.to_string()));
                return;
            }
        };

        self.state = match target {
            Target::Data => State::WaitingEventReport(ScreenshotEvent::Data {
                width: extent.width,
                height: extent.height,
                include_alpha,
                pixels,
            }),
            Target::File(path, file_format) => {
                let job = Arc::new(FileJob::default());
                let worker = Arc::clone(&job);
                self.runner.spawn(
                    "vk2d screenshot",
                    Box::new(move || {
                        let event = match save(&path, file_format, extent, include_alpha, &pixels) {
                            Ok(()) => ScreenshotEvent::SavedToFile(path),
                            Err(e) => ScreenshotEvent::Failed(format!(
                                "Cannot save screenshot '{}': {}",
                                path.display(),
                                e
                            )),
                        };
                        *worker.result.lock() = Some(event);
                        worker.done.set();
                    }),
                );
                State::WaitingFileWrite(job)
            }
        };
    }

    fn read_pixels(
        &self,
        extent: Extent2d,
        format: TextureFormat,
        include_alpha: bool,
    ) -> BackendResult<Vec<u8>> {
        let (buffer, _) = self
            .readback
            .ok_or(BackendError::InvalidHandle("screenshot buffer"))?;
        let size = u64::from(extent.width) * u64::from(extent.height) * 4;
        let data = self.device.read_buffer(buffer, 0, size)?;
        Ok(convert_pixels(&data, format.is_bgra(), include_alpha))
    }

    /// Move a finished file write on and deliver a ready event.
    pub fn poll(&mut self) {
        if let State::WaitingFileWrite(job) = &self.state {
            if !job.done.is_set() {
                return;
            }
            let event = job
                .result
                .lock()
                .take()
                .unwrap_or_else(|| ScreenshotEvent::Failed("screenshot task lost".into()));
            self.state = State::WaitingEventReport(event);
        }

        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::WaitingEventReport(event) => self.deliver(event),
            other => self.state = other,
        }
    }

    fn deliver(&mut self, event: ScreenshotEvent) {
        match &event {
            ScreenshotEvent::SavedToFile(path) => {
                log::info!("Screenshot saved to {}", path.display())
            }
            ScreenshotEvent::Data { width, height, .. } => {
                log::debug!("Screenshot data ready ({}x{})", width, height)
            }
            ScreenshotEvent::Failed(message) => {
                self.reporter.report(ReportSeverity::Warning, message);
            }
        }
        match self.handler.as_mut() {
            Some(handler) => handler(event),
            None => log::debug!("No screenshot handler installed; result dropped"),
        }
    }

    /// Wait for a pending file write, bounded, and deliver what is ready.
    pub fn teardown(&mut self, timeout: Duration) {
        if let State::WaitingFileWrite(job) = &self.state {
            if !job.done.wait_timeout(timeout) {
                log::warn!("Screenshot still being written after {:?}", timeout);
                return;
            }
        }
        self.poll();
    }
}

impl Drop for ScreenshotManager {
    fn drop(&mut self) {
        if let Some((buffer, _)) = self.readback.take() {
            self.device.destroy_buffer(buffer);
        }
    }
}

/// Swizzle BGRA to RGBA and optionally drop alpha.
fn convert_pixels(data: &[u8], bgra: bool, include_alpha: bool) -> Vec<u8> {
    let channels = if include_alpha { 4 } else { 3 };
    let mut pixels = Vec::with_capacity(data.len() / 4 * channels);
    for texel in data.chunks_exact(4) {
        let (r, b) = if bgra {
            (texel[2], texel[0])
        } else {
            (texel[0], texel[2])
        };
        pixels.extend_from_slice(&[r, texel[1], b]);
        if include_alpha {
            pixels.push(texel[3]);
        }
    }
    pixels
}

fn save(
    path: &Path,
    format: FileFormat,
    extent: Extent2d,
    include_alpha: bool,
    pixels: &[u8],
) -> image::ImageResult<()> {
    let color = if include_alpha {
        ColorType::Rgba8
    } else {
        ColorType::Rgb8
    };
    match format {
        FileFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb;
            let data = if include_alpha {
                rgb = convert_pixels(pixels, false, false);
                &rgb[..]
            } else {
                pixels
            };
            let mut writer = BufWriter::new(File::create(path)?);
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
            encoder.encode(data, extent.width, extent.height, ColorType::Rgb8)
        }
        FileFormat::Png | FileFormat::Bmp | FileFormat::Tga => {
            let image_format = match format {
                FileFormat::Bmp => ImageFormat::Bmp,
                FileFormat::Tga => ImageFormat::Tga,
                _ => ImageFormat::Png,
            };
            image::save_buffer_with_format(
                path,
                pixels,
                extent.width,
                extent.height,
                color,
                image_format,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::InlineTaskRunner;

    fn manager(device: &Arc<DummyDevice>) -> (ScreenshotManager, Arc<Mutex<Vec<ScreenshotEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut manager = ScreenshotManager::new(
            device.clone(),
            Reporter::default(),
            Arc::new(InlineTaskRunner),
        );
        manager.set_handler(Some(Box::new(move |event| sink.lock().push(event))));
        (manager, events)
    }

    #[test]
    fn test_convert_pixels() {
        let bgra = [10, 20, 30, 40, 50, 60, 70, 80];
        assert_eq!(convert_pixels(&bgra, true, true), vec![30, 20, 10, 40, 70, 60, 50, 80]);
        assert_eq!(convert_pixels(&bgra, true, false), vec![30, 20, 10, 70, 60, 50]);
        assert_eq!(convert_pixels(&bgra, false, false), vec![10, 20, 30, 50, 60, 70]);
    }

    #[test]
    fn test_file_format_from_extension() {
        assert_eq!(FileFormat::from_path(Path::new("a.PNG")), Some(FileFormat::Png));
        assert_eq!(FileFormat::from_path(Path::new("a.jpeg")), Some(FileFormat::Jpeg));
        assert_eq!(FileFormat::from_path(Path::new("a.tga")), Some(FileFormat::Tga));
        assert_eq!(FileFormat::from_path(Path::new("a.gif")), None);
        assert_eq!(FileFormat::from_path(Path::new("a")), None);
    }

    #[test]
    fn test_second_request_is_ignored() {
        let device = Arc::new(DummyDevice::new());
        let (mut manager, _) = manager(&device);
        assert!(manager.request_data(true));
        assert!(!manager.request_data(false));
    }

    #[test]
    fn test_data_is_delivered_once() {
        let device = Arc::new(DummyDevice::new());
        let (mut manager, events) = manager(&device);
        let image = device
            .create_image(&ImageDescriptor {
                extent: Extent2d::new(2, 1),
                format: TextureFormat::Bgra8Unorm,
                ..Default::default()
            })
            .unwrap();

        manager.request_data(false);
        let copy = manager
            .pending_copy(0, image, Extent2d::new(2, 1), TextureFormat::Bgra8Unorm)
            .unwrap();
        assert!(matches!(copy, Some(Command::CopyImageToBuffer { .. })));
        assert!(manager
            .pending_copy(0, image, Extent2d::new(2, 1), TextureFormat::Bgra8Unorm)
            .unwrap()
            .is_none());

        // Another slot finishing does not complete it.
        manager.on_frame_finished(1);
        manager.poll();
        assert!(events.lock().is_empty());

        manager.on_frame_finished(0);
        manager.poll();
        manager.poll();
        let events = events.lock();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScreenshotEvent::Data { width, height, pixels, include_alpha } => {
                assert_eq!((*width, *height), (2, 1));
                assert!(!include_alpha);
                assert_eq!(pixels.len(), 6);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(manager.is_idle());
    }

    #[test]
    fn test_aborted_frame_keeps_request() {
        let device = Arc::new(DummyDevice::new());
        let (mut manager, _) = manager(&device);
        let image = device.create_image(&ImageDescriptor::default()).unwrap();

        manager.request_data(true);
        manager
            .pending_copy(2, image, Extent2d::new(1, 1), TextureFormat::Rgba8Unorm)
            .unwrap();
        manager.frame_aborted(2);
        assert!(manager.is_requested());
    }

    #[test]
    fn test_unknown_extension_saves_png() {
        let device = Arc::new(DummyDevice::new());
        let (mut manager, events) = manager(&device);
        let image = device.create_image(&ImageDescriptor::default()).unwrap();
        let path = std::env::temp_dir()
            .join(format!("vk2d_screenshot_{}.xyz", std::process::id()));

        manager.request_file(&path, false);
        manager
            .pending_copy(0, image, Extent2d::new(1, 1), TextureFormat::Rgba8Unorm)
            .unwrap();
        manager.on_frame_finished(0);
        manager.teardown(Duration::from_secs(5));

        let mut expected = path.into_os_string();
        expected.push(".png");
        let expected = PathBuf::from(expected);
        assert_eq!(*events.lock(), vec![ScreenshotEvent::SavedToFile(expected.clone())]);
        assert!(expected.exists());
        let _ = std::fs::remove_file(expected);
    }
}

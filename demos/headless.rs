//! Headless rendering demo.
//!
//! Renders a few frames on the dummy device: a checkerboard drawn into a
//! blurred off-screen target, which the window then samples, followed by a
//! screenshot of the last frame.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --example headless
//! ```

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};

use vk2d::{
    BlurType, DrawGeometry, DummyDevice, Instance, InstanceConfig, Mesh,
    RenderResult, RenderTargetTexture, RenderTargetTextureCreateInfo, ReportSeverity,
    ScreenshotEvent, TextureData, Vertex, Window, WindowConfig,
};

/// Number of frames to render before exiting.
const FRAMES_TO_RENDER: u32 = 8;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> RenderResult<()> {
    let device = Arc::new(DummyDevice::new());
    let config = InstanceConfig::new().with_report_callback(Arc::new(
        |severity: ReportSeverity, message: &str| {
            if severity >= ReportSeverity::Warning {
                eprintln!("[{:?}] {}", severity, message);
            }
        },
    ));
    let instance = Instance::new(device.clone(), config)?;

    let mut window = Window::new(
        &instance,
        WindowConfig::new(640, 480).with_clear_color([0.1, 0.1, 0.15, 1.0]),
    )?;
    window.set_screenshot_handler(Some(Box::new(|event| match event {
        ScreenshotEvent::Data { width, height, pixels, .. } => {
            log::info!("Screenshot: {}x{}, {} bytes", width, height, pixels.len());
        }
        ScreenshotEvent::SavedToFile(path) => log::info!("Screenshot saved to {}", path.display()),
        ScreenshotEvent::Failed(message) => log::warn!("Screenshot failed: {}", message),
    })));

    let checker = instance.create_texture(&TextureData::checkerboard(
        64,
        [255, 255, 255, 255],
        [40, 40, 40, 255],
    ))?;
    let mut target = RenderTargetTexture::new(
        &instance,
        &RenderTargetTextureCreateInfo::new(256, 256).with_blur(true),
    )?;

    let quad_indices = [0u32, 1, 2, 2, 3, 0];
    let quad = |min: Vec2, max: Vec2| {
        let white = [1.0; 4];
        [
            Vertex::new(min, Vec2::new(0.0, 0.0), white),
            Vertex::new(Vec2::new(max.x, min.y), Vec2::new(1.0, 0.0), white),
            Vertex::new(max, Vec2::new(1.0, 1.0), white),
            Vertex::new(Vec2::new(min.x, max.y), Vec2::new(0.0, 1.0), white),
        ]
    };
    let outline = Mesh::ellipse(Vec2::new(-0.5, -0.5), Vec2::new(0.5, 0.5), false, 48)
        .with_color([1.0, 0.8, 0.2, 1.0]);

    for frame in 0..FRAMES_TO_RENDER {
        target.begin_render()?;
        let background = quad(Vec2::new(-1.0, -1.0), Vec2::new(1.0, 1.0));
        target.draw_triangle_list(
            DrawGeometry::new(&quad_indices, &background),
            true,
            Some(&checker),
            None,
        )?;
        target.end_render(BlurType::Gaussian, Vec2::splat(1.0 + frame as f32))?;

        if frame == FRAMES_TO_RENDER - 1 {
            window.take_screenshot_to_data(false);
        }

        window.begin_frame()?;
        let panel = quad(Vec2::new(-0.8, -0.8), Vec2::new(0.8, 0.8));
        window.draw_triangle_list(
            DrawGeometry::new(&quad_indices, &panel),
            true,
            Some(&target.texture()),
            None,
        )?;
        let angle = frame as f32 * 0.2;
        window.draw_mesh(&outline, &[Mat4::from_axis_angle(Vec3::Z, angle)])?;
        window.end_frame()?;
    }

    window.wait_idle()?;
    log::info!(
        "Rendered {} frames, {} submits, {} presents",
        window.frame_count(),
        device.submit_count(),
        device.presented().len()
    );
    Ok(())
}

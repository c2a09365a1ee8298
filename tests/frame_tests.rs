//! Window frame integration tests.
//!
//! These tests drive complete frames through a [`Window`] on the dummy
//! device and check what reaches the device: submission order, slot reuse,
//! recovery from stale presentation chains and failed submits, resizing,
//! minimisation and screenshots.
//!
//! ```bash
//! cargo test --test frame_tests
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rstest::rstest;

use common::{labels, TestContext, QUAD_INDICES};
use vk2d::backend::AcquireOutcome;
use vk2d::{
    CompletionMode, DrawGeometry, ErrorClass, Extent2d, RenderError, ReportSeverity,
    ScreenshotEvent, Window, WindowConfig,
};

fn draw_quad(window: &mut Window) {
    let vertices = common::quad_vertices([1.0, 1.0, 1.0, 1.0]);
    window
        .draw_triangle_list(DrawGeometry::new(&QUAD_INDICES, &vertices), true, None, None)
        .expect("Failed to draw quad");
}

fn run_frame(window: &mut Window) -> Result<(), RenderError> {
    window.begin_frame()?;
    draw_quad(window);
    window.end_frame()
}

// ============================================================================
// Submission Tests
// ============================================================================

/// Each frame is one submit call carrying the window transfer and render,
/// and every frame is presented.
#[rstest]
#[case::immediate(CompletionMode::Immediate)]
#[case::deferred(CompletionMode::Deferred)]
fn test_frames_are_submitted_and_presented(#[case] mode: CompletionMode) {
    let ctx = TestContext::new(mode);
    let mut window = ctx.window(320, 240);

    for _ in 0..6 {
        run_frame(&mut window).expect("Frame failed");
    }

    let records = ctx.device.submissions();
    assert_eq!(records.len(), 6);
    for record in &records {
        assert_eq!(labels(record), vec!["window transfer", "window render"]);
        assert!(record.fence.is_some());
    }
    assert_eq!(ctx.device.presented().len(), 6);
    assert_eq!(window.frame_count(), 6);
}

/// A slot's command buffers are never re-recorded while its previous frame
/// is in flight, and at most one frame is on the GPU after each end_frame.
///
/// With deferred completion, re-recording an in-flight command buffer fails
/// with `CommandBufferInFlight`, so every frame succeeding is the check.
#[rstest]
#[case::two_slots(2)]
#[case::three_slots(3)]
fn test_slot_not_reused_before_completion(#[case] image_count: u32) {
    let ctx = TestContext::new(CompletionMode::Deferred);
    let mut window =
        ctx.window_with(WindowConfig::new(320, 240).with_preferred_image_count(image_count));
    assert_eq!(window.slot_count(), image_count as usize);

    for frame in 0..(image_count as usize * 4) {
        run_frame(&mut window).unwrap_or_else(|e| panic!("Frame {} failed: {}", frame, e));
        assert!(ctx.device.pending_batches() <= 1);
    }

    window.wait_idle().expect("Failed to wait for the window");
    assert_eq!(ctx.device.pending_batches(), 0);
}

/// Presented images cycle through every slot.
#[test]
fn test_presented_images_cycle_through_slots() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window_with(WindowConfig::new(320, 240).with_preferred_image_count(3));

    for _ in 0..6 {
        run_frame(&mut window).expect("Frame failed");
    }
    assert_eq!(ctx.device.presented(), vec![0, 1, 2, 0, 1, 2]);
}

// ============================================================================
// Call Order Tests
// ============================================================================

/// A second begin_frame is a protocol error with no effect; the frame in
/// progress can still be ended normally.
#[test]
fn test_begin_frame_twice_is_protocol_error() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);

    window.begin_frame().expect("Failed to begin frame");
    let error = window.begin_frame().expect_err("Second begin_frame succeeded");
    assert!(matches!(error, RenderError::Protocol(_)));
    assert_eq!(error.class(), ErrorClass::Protocol);
    assert_eq!(ctx.device.submit_count(), 0);
    assert_eq!(ctx.reports_of(ReportSeverity::NonCriticalError).len(), 1);

    draw_quad(&mut window);
    window.end_frame().expect("Failed to end frame");
    assert_eq!(ctx.device.submit_count(), 1);
}

#[rstest]
#[case::end_frame(true)]
#[case::draw(false)]
fn test_calls_outside_frame_are_protocol_errors(#[case] end_frame: bool) {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);

    let result = if end_frame {
        window.end_frame()
    } else {
        let vertices = common::quad_vertices([1.0; 4]);
        window.draw_triangle_list(DrawGeometry::new(&QUAD_INDICES, &vertices), true, None, None)
    };

    assert!(matches!(result, Err(RenderError::Protocol(_))));
    assert_eq!(ctx.device.submit_count(), 0);
}

#[test]
fn test_zero_sized_window_is_rejected() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let result = Window::new(&ctx.instance, WindowConfig::new(0, 240));
    assert!(matches!(result, Err(RenderError::InvalidParameter(_))));
}

// ============================================================================
// Stale Presentation Chain Tests
// ============================================================================

/// One stale acquire is recovered by a rebuild; a chain still stale after
/// the rebuild fails the frame once, and the next frame recovers.
#[rstest]
#[case::stale_once(1, true)]
#[case::stale_after_rebuild(2, false)]
fn test_stale_acquire_rebuilds_once(#[case] stale_acquires: usize, #[case] recovers: bool) {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let created = ctx.device.swapchains_created();
    let generation = window.swapchain_generation();

    ctx.device
        .script_acquire(std::iter::repeat(AcquireOutcome::OutOfDate).take(stale_acquires));
    let result = window.begin_frame();

    assert_eq!(ctx.device.swapchains_created(), created + 1);
    assert_eq!(window.swapchain_generation(), generation + 1);
    if recovers {
        result.expect("Stale chain was not recovered");
        window.end_frame().expect("Failed to end frame");
    } else {
        let error = result.expect_err("Frame succeeded on a stale chain");
        assert_eq!(error, RenderError::StaleAfterRebuild);
        assert!(error.is_fatal());
        assert_eq!(ctx.device.submit_count(), 0);

        // The chain is rebuilt again by the next frame
        run_frame(&mut window).expect("Next frame did not recover");
        assert_eq!(ctx.device.swapchains_created(), created + 2);
    }
    assert_eq!(ctx.device.submit_count(), 1);
}

/// A surface that changed size without a resize event is picked up through
/// the out-of-date acquire.
#[test]
fn test_surface_resize_without_event_is_recovered() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    run_frame(&mut window).expect("Frame failed");

    ctx.device.resize_surface(400, 300);
    run_frame(&mut window).expect("Frame after surface resize failed");
    assert_eq!(window.size(), Extent2d::new(400, 300));
}

// ============================================================================
// Failure Recovery Tests
// ============================================================================

/// How a frame is made to fail.
#[derive(Debug, Clone, Copy)]
enum Fault {
    Submit,
    Record,
}

/// A frame whose recording or submit fails is abandoned; the next frame
/// commits and presents normally.
#[rstest]
#[case::submit(Fault::Submit)]
#[case::record(Fault::Record)]
fn test_failed_frame_is_abandoned(#[case] fault: Fault) {
    let ctx = TestContext::new(CompletionMode::Deferred);
    let mut window = ctx.window(320, 240);
    run_frame(&mut window).expect("Frame failed");

    match fault {
        Fault::Submit => ctx.device.fail_next_submits(1),
        Fault::Record => ctx.device.fail_next_records(1),
    }
    let error = run_frame(&mut window).expect_err("Faulty frame succeeded");
    assert!(matches!(error, RenderError::Device(_)));
    assert_eq!(ctx.device.submit_count(), 1);
    assert_eq!(ctx.device.presented().len(), 1);

    run_frame(&mut window).expect("Frame after failure failed");
    assert_eq!(ctx.device.submit_count(), 2);
    assert_eq!(ctx.device.presented().len(), 2);
}

/// Waiting on a frame that never completes times out instead of hanging.
#[test]
fn test_stalled_frame_times_out() {
    let ctx = TestContext::new(CompletionMode::Stalled);
    let mut window = ctx.window_with(
        WindowConfig::new(320, 240)
            .with_frame_timeout(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_millis(10)),
    );

    run_frame(&mut window).expect("First frame failed");
    let error = run_frame(&mut window).expect_err("Second frame did not time out");
    assert!(matches!(error, RenderError::FrameTimeout(_)));
    assert!(error.is_fatal());
    assert_eq!(ctx.reports_of(ReportSeverity::CriticalError).len(), 1);
}

// ============================================================================
// Resize Tests
// ============================================================================

/// A resize is applied by the next begin_frame, and a new surface image
/// count reallocates the slots.
#[rstest]
#[case::immediate(CompletionMode::Immediate)]
#[case::deferred(CompletionMode::Deferred)]
fn test_resize_reallocates_slots(#[case] mode: CompletionMode) {
    let ctx = TestContext::new(mode);
    let mut window = ctx.window(320, 240);
    assert_eq!(window.slot_count(), 3);

    for _ in 0..2 {
        run_frame(&mut window).expect("Frame failed");
    }

    ctx.device.set_image_count_range(4, 6);
    ctx.device.resize_surface(640, 480);
    window.notify_resize(640, 480);

    for _ in 0..6 {
        run_frame(&mut window).expect("Frame after resize failed");
    }
    assert_eq!(window.size(), Extent2d::new(640, 480));
    assert_eq!(window.slot_count(), 5);
    assert_eq!(ctx.device.presented().len(), 8);
}

/// While minimised, frames are accepted and dropped without touching the
/// device.
#[rstest]
#[case::set_minimized(true)]
#[case::zero_size_resize(false)]
fn test_minimized_frames_are_dropped(#[case] explicit: bool) {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    run_frame(&mut window).expect("Frame failed");

    if explicit {
        window.set_minimized(true);
    } else {
        window.notify_resize(0, 0);
    }
    assert!(window.is_minimized());
    for _ in 0..3 {
        run_frame(&mut window).expect("Minimized frame failed");
    }
    assert_eq!(ctx.device.submit_count(), 1);
    assert_eq!(ctx.device.presented().len(), 1);

    if explicit {
        window.set_minimized(false);
    } else {
        window.notify_resize(320, 240);
    }
    run_frame(&mut window).expect("Frame after restore failed");
    assert_eq!(ctx.device.submit_count(), 2);
}

// ============================================================================
// Screenshot Tests
// ============================================================================

/// A data screenshot is captured from the next frame and delivered exactly
/// once, converted to RGBA.
#[test]
fn test_screenshot_data_is_delivered_once() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window =
        ctx.window_with(WindowConfig::new(64, 48).with_clear_color([1.0, 0.0, 0.0, 1.0]));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    window.set_screenshot_handler(Some(Box::new(move |event| sink.lock().push(event))));

    assert!(window.take_screenshot_to_data(true));
    assert!(!window.take_screenshot_to_data(true));

    window.begin_frame().expect("Failed to begin frame");
    window.end_frame().expect("Failed to end frame");
    window.wait_idle().expect("Failed to wait for the window");

    for _ in 0..3 {
        run_frame(&mut window).expect("Frame failed");
    }
    window.wait_idle().expect("Failed to wait for the window");

    let events = events.lock();
    assert_eq!(events.len(), 1);
    match &events[0] {
        ScreenshotEvent::Data {
            width,
            height,
            include_alpha,
            pixels,
        } => {
            assert_eq!((*width, *height), (64, 48));
            assert!(*include_alpha);
            assert_eq!(pixels.len(), 64 * 48 * 4);
            assert_eq!(&pixels[..4], &[255, 0, 0, 255]);
        }
        other => panic!("Unexpected screenshot event {:?}", other),
    }
}

/// A screenshot requested for a frame that fails is taken from the next
/// frame instead.
#[test]
fn test_screenshot_survives_failed_frame() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(64, 48);

    let delivered = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&delivered);
    window.set_screenshot_handler(Some(Box::new(move |event| {
        if let ScreenshotEvent::Data { .. } = event {
            *counter.lock() += 1;
        }
    })));
    assert!(window.take_screenshot_to_data(false));

    ctx.device.fail_next_submits(1);
    assert!(run_frame(&mut window).is_err());
    window.wait_idle().expect("Failed to wait for the window");
    assert_eq!(*delivered.lock(), 0);

    run_frame(&mut window).expect("Frame failed");
    window.wait_idle().expect("Failed to wait for the window");
    assert_eq!(*delivered.lock(), 1);
}

/// A frame that reached the device but failed to present still delivers
/// its screenshot, exactly once.
#[test]
fn test_screenshot_from_unpresented_frame_is_delivered() {
    let ctx = TestContext::new(CompletionMode::Deferred);
    let mut window = ctx.window(64, 48);

    let delivered = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&delivered);
    window.set_screenshot_handler(Some(Box::new(move |event| {
        if let ScreenshotEvent::Data { .. } = event {
            *counter.lock() += 1;
        }
    })));
    assert!(window.take_screenshot_to_data(false));

    ctx.device.fail_next_presents(1);
    let error = run_frame(&mut window).expect_err("Frame with a failing present succeeded");
    assert!(matches!(error, RenderError::Device(_)));
    assert_eq!(ctx.device.submit_count(), 1);
    assert!(ctx.device.presented().is_empty());

    window.wait_idle().expect("Failed to wait for the window");
    assert_eq!(*delivered.lock(), 1);

    run_frame(&mut window).expect("Frame after failed present failed");
    window.wait_idle().expect("Failed to wait for the window");
    assert_eq!(*delivered.lock(), 1);
    assert_eq!(ctx.device.presented().len(), 1);
}

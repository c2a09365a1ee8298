//! Render-target integration tests.
//!
//! These tests check how off-screen render targets are scheduled: they are
//! committed lazily by whatever samples them, upstream first, once per
//! render, and the consumer waits on the exact timeline value their render
//! signals.
//!
//! ```bash
//! cargo test --test render_target_tests
//! ```

mod common;

use glam::Vec2;
use rstest::rstest;

use common::{count_labelled, find, labels, TestContext, QUAD_INDICES};
use vk2d::backend::{Command, PipelineStages, SemaphoreWait};
use vk2d::render_target::CommitState;
use vk2d::{
    BlurType, CompletionMode, DrawGeometry, Multisamples, RenderError,
    RenderTargetTexture, RenderTargetTextureCreateInfo, ReportSeverity, Texture, Window,
};

const RT_RENDER: &str = "render target 64x64 render";
const RT_TRANSFER: &str = "render target 64x64 transfer";

fn render_target(ctx: &TestContext, info: RenderTargetTextureCreateInfo) -> RenderTargetTexture {
    RenderTargetTexture::new(&ctx.instance, &info).expect("Failed to create render target")
}

/// Record one quad into `target`, optionally sampling `texture`.
fn render_quad(target: &mut RenderTargetTexture, texture: Option<&Texture>) {
    let vertices = common::quad_vertices([1.0, 0.5, 0.25, 1.0]);
    target.begin_render().expect("Failed to begin render");
    target
        .draw_triangle_list(DrawGeometry::new(&QUAD_INDICES, &vertices), true, texture, None)
        .expect("Failed to draw into render target");
    target
        .end_render(BlurType::None, Vec2::ZERO)
        .expect("Failed to end render");
}

/// Draw `count` quads sampling `texture` in one window frame.
fn window_frame(window: &mut Window, texture: Option<&Texture>, count: usize) -> Result<(), RenderError> {
    let vertices = common::quad_vertices([1.0; 4]);
    window.begin_frame()?;
    for _ in 0..count {
        window.draw_triangle_list(DrawGeometry::new(&QUAD_INDICES, &vertices), true, texture, None)?;
    }
    window.end_frame()
}

/// The wait a consumer needs to sample what `record`'s submission labelled
/// `label` renders.
fn wait_for_render(record: &vk2d::backend::SubmitRecord, label: &str) -> SemaphoreWait {
    let render = find(record, label).unwrap_or_else(|| panic!("No '{}' submission", label));
    let signal = render.signals[0];
    SemaphoreWait {
        semaphore: signal.semaphore,
        value: signal.value,
        stages: PipelineStages::ALL_COMMANDS,
    }
}

// ============================================================================
// Commit Scheduling Tests
// ============================================================================

/// A render target sampled by the window is submitted in the same batch,
/// ahead of the window, and the window render waits on the exact value the
/// target's render signals.
#[rstest]
#[case::immediate(CompletionMode::Immediate)]
#[case::deferred(CompletionMode::Deferred)]
fn test_window_waits_on_render_counter(#[case] mode: CompletionMode) {
    let ctx = TestContext::new(mode);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    for frame in 0..6u64 {
        render_quad(&mut target, None);
        window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");

        let records = ctx.device.submissions();
        let record = records.last().expect("Nothing was submitted");
        assert_eq!(
            labels(record),
            vec![RT_TRANSFER, RT_RENDER, "window transfer", "window render"]
        );

        let wait = wait_for_render(record, RT_RENDER);
        let window_render = find(record, "window render").expect("No window render");
        assert!(window_render.waits.contains(&wait));

        // Swap buffers alternate, so each one's counter advances every
        // other frame.
        let swap = (frame % 2) as usize;
        let status = target.swap_status(swap).expect("No swap status");
        assert_eq!(status.render_complete, wait.semaphore);
        assert_eq!(status.render_counter, wait.value);
        assert_eq!(status.render_counter, frame / 2 + 1);
        assert!(status.has_been_submitted);
        assert!(!status.has_pending_render);
    }
}

/// Sampling one render target several times in a frame commits it once.
#[rstest]
#[case::one_draw(1)]
#[case::three_draws(3)]
fn test_sampled_target_committed_once_per_frame(#[case] draws: usize) {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    for _ in 0..3 {
        render_quad(&mut target, None);
        window_frame(&mut window, Some(&target.texture()), draws).expect("Frame failed");
    }

    let records = ctx.device.submissions();
    for record in &records {
        assert_eq!(count_labelled(std::slice::from_ref(record), RT_RENDER), 1);
    }
    assert_eq!(count_labelled(&records, RT_RENDER), 3);
}

/// A render target nobody samples is never submitted; the first consumer
/// commits it.
#[test]
fn test_unsampled_target_is_not_submitted() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    render_quad(&mut target, None);
    window_frame(&mut window, None, 1).expect("Frame failed");
    assert_eq!(count_labelled(&ctx.device.submissions(), RT_RENDER), 0);
    assert!(target.is_data_ready());

    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");
    assert_eq!(count_labelled(&ctx.device.submissions(), RT_RENDER), 1);
}

/// Sampling a render target again without a new render waits on the render
/// that was already submitted instead of submitting it again.
#[test]
fn test_resampling_waits_on_previous_render() {
    let ctx = TestContext::new(CompletionMode::Deferred);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    render_quad(&mut target, None);
    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");
    let first = ctx.device.submissions();
    let wait = wait_for_render(&first[0], RT_RENDER);

    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");
    let records = ctx.device.submissions();
    let second = &records[1];
    assert_eq!(labels(second), vec!["window transfer", "window render"]);
    let window_render = find(second, "window render").expect("No window render");
    assert!(window_render.waits.contains(&wait));
}

/// A target that samples another target commits its upstream first, and
/// its own render waits on the upstream render.
#[test]
fn test_chained_targets_commit_upstream_first() {
    let ctx = TestContext::new(CompletionMode::Deferred);
    let mut window = ctx.window(320, 240);
    let mut upstream = render_target(&ctx, RenderTargetTextureCreateInfo::new(32, 32));
    let mut downstream = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    for _ in 0..4 {
        render_quad(&mut upstream, None);
        render_quad(&mut downstream, Some(&upstream.texture()));
        window_frame(&mut window, Some(&downstream.texture()), 1).expect("Frame failed");

        let records = ctx.device.submissions();
        let record = records.last().expect("Nothing was submitted");
        assert_eq!(
            labels(record),
            vec![
                "render target 32x32 transfer",
                "render target 32x32 render",
                RT_TRANSFER,
                RT_RENDER,
                "window transfer",
                "window render",
            ]
        );

        let upstream_wait = wait_for_render(record, "render target 32x32 render");
        let downstream_render = find(record, RT_RENDER).expect("No downstream render");
        assert!(downstream_render.waits.contains(&upstream_wait));

        let downstream_wait = wait_for_render(record, RT_RENDER);
        let window_render = find(record, "window render").expect("No window render");
        assert!(window_render.waits.contains(&downstream_wait));
        assert!(!window_render.waits.contains(&upstream_wait));
    }
}

/// Before its first render a target is not data ready and draws sampling it
/// use the default texture without creating a dependency.
#[test]
fn test_unrendered_target_samples_default_texture() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));
    assert!(!target.is_data_ready());

    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");
    let records = ctx.device.submissions();
    assert_eq!(labels(&records[0]), vec!["window transfer", "window render"]);
}

// ============================================================================
// Failure Tests
// ============================================================================

/// A frame whose submit fails rolls back the commit of what it sampled; the
/// next frame commits the same render again with the same counter.
#[test]
fn test_failed_submit_rolls_back_commit() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    render_quad(&mut target, None);
    ctx.device.fail_next_submits(1);
    let error = window_frame(&mut window, Some(&target.texture()), 1)
        .expect_err("Frame with a failing submit succeeded");
    assert!(matches!(error, RenderError::Device(_)));

    let status = target.swap_status(0).expect("No swap status");
    assert_eq!(status.state, CommitState::Uncommitted);
    assert_eq!(status.render_counter, 0);
    assert!(status.has_pending_render);
    assert!(!status.has_been_submitted);

    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame after failure failed");
    let records = ctx.device.submissions();
    assert_eq!(records.len(), 1);
    assert_eq!(wait_for_render(&records[0], RT_RENDER).value, 1);
    assert_eq!(target.swap_status(0).map(|s| s.render_counter), Some(1));
}

/// A target released after being sampled fails the frame that sampled it;
/// later frames no longer depend on it.
#[test]
fn test_released_target_fails_sampling_frame() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));
    render_quad(&mut target, None);
    let texture = target.texture();

    let vertices = common::quad_vertices([1.0; 4]);
    window.begin_frame().expect("Failed to begin frame");
    window
        .draw_triangle_list(DrawGeometry::new(&QUAD_INDICES, &vertices), true, Some(&texture), None)
        .expect("Failed to draw");
    drop(target);

    let error = window.end_frame().expect_err("Frame sampling a released target succeeded");
    assert_eq!(error, RenderError::Released);
    assert!(error.is_fatal());
    assert_eq!(ctx.device.submit_count(), 0);

    // The texture now reads as not ready and falls back to the default
    assert!(!texture.is_data_ready());
    window_frame(&mut window, Some(&texture), 1).expect("Frame after release failed");
    assert_eq!(ctx.device.submit_count(), 1);
}

/// Draw one quad per texture in a single window frame.
fn window_frame_sampling(window: &mut Window, textures: &[Texture]) -> Result<(), RenderError> {
    let vertices = common::quad_vertices([1.0; 4]);
    window.begin_frame()?;
    for texture in textures {
        let geometry = DrawGeometry::new(&QUAD_INDICES, &vertices);
        window.draw_triangle_list(geometry, true, Some(texture), None)?;
    }
    window.end_frame()
}

/// A frame that fails part way through committing leaves every target it
/// sampled ready to be committed again: the one already committed, the one
/// that failed and the one never reached.
#[test]
fn test_partial_commit_is_rolled_back() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let mut first = render_target(&ctx, RenderTargetTextureCreateInfo::new(16, 16));
    let mut middle = render_target(&ctx, RenderTargetTextureCreateInfo::new(32, 32));
    let mut last = render_target(&ctx, RenderTargetTextureCreateInfo::new(48, 48));
    for target in [&mut first, &mut middle, &mut last] {
        render_quad(target, None);
    }

    let vertices = common::quad_vertices([1.0; 4]);
    window.begin_frame().expect("Failed to begin frame");
    for texture in [first.texture(), middle.texture(), last.texture()] {
        let geometry = DrawGeometry::new(&QUAD_INDICES, &vertices);
        window
            .draw_triangle_list(geometry, true, Some(&texture), None)
            .expect("Failed to draw");
    }
    drop(middle);
    let error = window.end_frame().expect_err("Frame sampling a released target succeeded");
    assert_eq!(error, RenderError::Released);
    assert_eq!(ctx.device.submit_count(), 0);

    for target in [&first, &last] {
        let status = target.swap_status(0).expect("No swap status");
        assert_eq!(status.state, CommitState::Uncommitted);
        assert_eq!(status.render_counter, 0);
        assert!(status.has_pending_render);
    }

    window_frame_sampling(&mut window, &[first.texture(), last.texture()])
        .expect("Frame after rollback failed");
    let records = ctx.device.submissions();
    assert_eq!(records.len(), 1);
    assert_eq!(
        labels(&records[0]),
        vec![
            "render target 16x16 transfer",
            "render target 16x16 render",
            "render target 48x48 transfer",
            "render target 48x48 render",
            "window transfer",
            "window render",
        ]
    );
    assert_eq!(first.swap_status(0).map(|s| s.render_counter), Some(1));
    assert_eq!(last.swap_status(0).map(|s| s.render_counter), Some(1));
}

/// A failed present happens after the frame reached the device, so the
/// targets it sampled still finish once the GPU does.
#[test]
fn test_failed_present_still_finishes_render() {
    let ctx = TestContext::new(CompletionMode::Deferred);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));
    render_quad(&mut target, None);

    ctx.device.fail_next_presents(1);
    let error = window_frame(&mut window, Some(&target.texture()), 1)
        .expect_err("Frame with a failing present succeeded");
    assert!(matches!(error, RenderError::Device(_)));
    assert_eq!(ctx.device.submit_count(), 1);

    let status = target.swap_status(0).expect("No swap status");
    assert_eq!(status.state, CommitState::Submitted);
    assert_eq!(status.render_counter, 1);

    window.wait_idle().expect("Failed to wait for the window");
    let status = target.swap_status(0).expect("No swap status");
    assert_eq!(status.state, CommitState::Finished);
    assert!(!status.has_pending_render);
}

/// Dropping a target whose render never completes gives up after the
/// instance's shutdown timeout and reports it instead of hanging.
#[test]
fn test_drop_with_stalled_render_is_bounded() {
    let ctx = TestContext::new(CompletionMode::Stalled);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));
    render_quad(&mut target, None);
    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");
    assert!(target.swap_status(0).map_or(false, |s| s.has_been_submitted));

    drop(target);
    let warnings = ctx.reports_of(ReportSeverity::Warning);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("still running"));
}

#[test]
fn test_render_calls_out_of_order_are_protocol_errors() {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    assert!(matches!(
        target.end_render(BlurType::None, Vec2::ZERO),
        Err(RenderError::Protocol(_))
    ));
    let vertices = common::quad_vertices([1.0; 4]);
    assert!(matches!(
        target.draw_triangle_list(DrawGeometry::new(&QUAD_INDICES, &vertices), true, None, None),
        Err(RenderError::Protocol(_))
    ));

    target.begin_render().expect("Failed to begin render");
    assert!(matches!(target.begin_render(), Err(RenderError::Protocol(_))));
    assert!(matches!(target.set_size(32, 32), Err(RenderError::Protocol(_))));
    target
        .end_render(BlurType::None, Vec2::ZERO)
        .expect("Failed to end render");
}

#[rstest]
#[case::zero_width(0, 64)]
#[case::zero_height(64, 0)]
fn test_zero_sized_target_is_rejected(#[case] width: u32, #[case] height: u32) {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let result = RenderTargetTexture::new(
        &ctx.instance,
        &RenderTargetTextureCreateInfo::new(width, height),
    );
    assert!(matches!(result, Err(RenderError::InvalidParameter(_))));
}

// ============================================================================
// Finalization Tests
// ============================================================================

/// Commands recorded into the render submission of `label`.
fn render_commands(ctx: &TestContext, label: &str) -> Vec<Command> {
    let records = ctx.device.submissions();
    let record = records.last().expect("Nothing was submitted");
    let render = find(record, label).unwrap_or_else(|| panic!("No '{}' submission", label));
    let commands = ctx
        .device
        .recorded_commands(render.command_buffers[0])
        .expect("Render command buffer was never recorded");
    commands.iter().cloned().collect()
}

/// Multisampled targets resolve, blur targets run two blur passes, and
/// every target finishes by generating the sampled mip chain.
#[rstest]
#[case::plain(Multisamples::X1, false, 0, 0)]
#[case::multisampled(Multisamples::X4, false, 1, 0)]
#[case::blur(Multisamples::X1, true, 0, 2)]
#[case::multisampled_blur(Multisamples::X4, true, 1, 2)]
fn test_render_finalization(
    #[case] samples: Multisamples,
    #[case] blur: bool,
    #[case] resolves: usize,
    #[case] blurs: usize,
) {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(
        &ctx,
        RenderTargetTextureCreateInfo::new(64, 64)
            .with_samples(samples)
            .with_blur(blur),
    );

    let vertices = common::quad_vertices([1.0; 4]);
    target.begin_render().expect("Failed to begin render");
    target
        .draw_triangle_list(DrawGeometry::new(&QUAD_INDICES, &vertices), true, None, None)
        .expect("Failed to draw");
    target
        .end_render(BlurType::Gaussian, Vec2::new(2.0, 2.0))
        .expect("Failed to end render");
    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");

    let commands = render_commands(&ctx, RT_RENDER);
    let count = |f: fn(&Command) -> bool| commands.iter().filter(|c| f(c)).count();
    assert_eq!(count(|c| matches!(c, Command::ResolveImage { .. })), resolves);
    assert_eq!(count(|c| matches!(c, Command::Blur { .. })), blurs);
    assert_eq!(count(|c| matches!(c, Command::GenerateMipmaps { .. })), 1);
    assert!(matches!(commands.last(), Some(Command::GenerateMipmaps { .. })));
}

/// Asking a target created without blur support for a blur warns once and
/// renders without it.
#[rstest]
#[case::without_blur_support(false, 1)]
#[case::with_blur_support(true, 0)]
fn test_blur_without_support_warns(#[case] enable_blur: bool, #[case] warnings: usize) {
    let ctx = TestContext::new(CompletionMode::Immediate);
    let mut target = render_target(
        &ctx,
        RenderTargetTextureCreateInfo::new(64, 64).with_blur(enable_blur),
    );

    target.begin_render().expect("Failed to begin render");
    target
        .end_render(BlurType::Box, Vec2::new(3.0, 0.0))
        .expect("Blur request failed");
    assert_eq!(ctx.reports_of(ReportSeverity::Warning).len(), warnings);
    assert!(target.is_data_ready());
}

// ============================================================================
// Resize Tests
// ============================================================================

/// Resizing drops the contents; the target is sampled again only after the
/// next render.
#[test]
fn test_set_size_clears_data_ready() {
    let ctx = TestContext::new(CompletionMode::Deferred);
    let mut window = ctx.window(320, 240);
    let mut target = render_target(&ctx, RenderTargetTextureCreateInfo::new(64, 64));

    render_quad(&mut target, None);
    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");

    target.set_size(128, 96).expect("Failed to resize render target");
    assert!(!target.is_data_ready());
    assert_eq!(target.size(), vk2d::Extent2d::new(128, 96));

    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");
    assert_eq!(
        count_labelled(&ctx.device.submissions(), "render target 64x64 render"),
        1
    );

    render_quad(&mut target, None);
    window_frame(&mut window, Some(&target.texture()), 1).expect("Frame failed");
    let records = ctx.device.submissions();
    let record = records.last().expect("Nothing was submitted");
    assert_eq!(labels(record)[1], "render target 64x64 render");
}

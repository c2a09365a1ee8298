//! Frame submission ordering.
//!
//! One device submit per frame carries, in order:
//!
//! 1. every render-target transfer and render committed for the frame,
//!    upstream targets first;
//! 2. the window transfer, signaling the slot's transfer semaphore;
//! 3. the window render, waiting on that semaphore and on each sampled
//!    render target at its exact timeline value, and signaling the slot's
//!    present semaphore.
//!
//! The slot fence is attached to the batch, so it signals once all of it has
//! completed.

use crate::backend::*;
use crate::error::RenderResult;
use crate::frame::FrameSlot;
use crate::render_target::{DependencySet, DependencyTracker, RenderTargetArena, SubmissionCollector};

/// Build the submit list of one window frame.
pub(crate) fn assemble(
    collector: SubmissionCollector,
    slot: &FrameSlot,
    dependencies: Option<&DependencySet>,
) -> Vec<SubmitInfo> {
    let mut submissions = collector.into_submissions();

    submissions.push(SubmitInfo {
        label: Some("window transfer".into()),
        waits: Vec::new(),
        command_buffers: vec![slot.transfer_cb],
        signals: vec![SemaphoreSignal {
            semaphore: slot.transfer_complete,
            value: 1,
        }],
    });

    let mut waits = vec![SemaphoreWait {
        semaphore: slot.transfer_complete,
        value: 1,
        stages: PipelineStages::VERTEX_INPUT | PipelineStages::VERTEX_SHADER,
    }];
    if let Some(dependencies) = dependencies {
        waits.extend(dependencies.waits());
    }
    submissions.push(SubmitInfo {
        label: Some("window render".into()),
        waits,
        command_buffers: vec![slot.render_cb],
        signals: vec![SemaphoreSignal {
            semaphore: slot.submit_to_present,
            value: 1,
        }],
    });

    submissions
}

/// Submit a frame and update the commit state of what it sampled.
///
/// On failure every render target committed for `slot_index` is aborted, so
/// the next frame can commit them again.
pub(crate) fn submit_frame(
    device: &dyn GpuDevice,
    arena: &mut RenderTargetArena,
    tracker: &mut DependencyTracker,
    slot_index: usize,
    slot: &FrameSlot,
    collector: SubmissionCollector,
) -> RenderResult<()> {
    let submissions = assemble(collector, slot, tracker.dependencies(slot_index));
    log::trace!(
        "Submitting frame in slot {} ({} submissions)",
        slot_index,
        submissions.len()
    );

    if let Err(e) = device.submit(&submissions, Some(slot.fence)) {
        log::warn!("Frame submission failed: {}", e);
        tracker.abort_all(slot_index, arena);
        return Err(e.into());
    }
    tracker.confirm_submission(slot_index, arena);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameSet;
    use std::sync::Arc;

    fn record_empty(device: &DummyDevice, slot: &FrameSlot) {
        device
            .record_commands(slot.transfer_cb, &CommandList::new())
            .unwrap();
        device
            .record_commands(slot.render_cb, &CommandList::new())
            .unwrap();
    }

    #[test]
    fn test_window_submissions_come_last() {
        let device = Arc::new(DummyDevice::new());
        let frames = FrameSet::new(device.clone(), 1, None).unwrap();
        let slot = frames.slot(0).unwrap();

        let mut collector = SubmissionCollector::new();
        collector.push(SubmitInfo {
            label: Some("upstream".into()),
            ..Default::default()
        });
        let submissions = assemble(collector, slot, None);

        let labels: Vec<_> = submissions.iter().map(|s| s.label.as_deref()).collect();
        assert_eq!(
            labels,
            vec![Some("upstream"), Some("window transfer"), Some("window render")]
        );
        let render = &submissions[2];
        assert_eq!(render.waits.len(), 1);
        assert_eq!(render.waits[0].semaphore, slot.transfer_complete);
        assert_eq!(render.signals[0].semaphore, slot.submit_to_present);
    }

    #[test]
    fn test_submit_attaches_slot_fence() {
        let device = Arc::new(DummyDevice::new());
        let frames = FrameSet::new(device.clone(), 1, None).unwrap();
        let slot = frames.slot(0).unwrap();
        record_empty(&device, slot);

        let mut arena = RenderTargetArena::new();
        let mut tracker = DependencyTracker::new(1);
        submit_frame(
            device.as_ref(),
            &mut arena,
            &mut tracker,
            0,
            slot,
            SubmissionCollector::new(),
        )
        .unwrap();

        let records = device.submissions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fence, Some(slot.fence));
        assert_eq!(records[0].submissions.len(), 2);
    }

    #[test]
    fn test_failed_submit_is_reported() {
        let device = Arc::new(DummyDevice::new());
        let frames = FrameSet::new(device.clone(), 1, None).unwrap();
        let slot = frames.slot(0).unwrap();
        record_empty(&device, slot);
        device.fail_next_submits(1);

        let mut arena = RenderTargetArena::new();
        let mut tracker = DependencyTracker::new(1);
        let result = submit_frame(
            device.as_ref(),
            &mut arena,
            &mut tracker,
            0,
            slot,
            SubmissionCollector::new(),
        );
        assert!(matches!(result, Err(crate::error::RenderError::Device(_))));
        assert_eq!(device.submit_count(), 0);
    }
}

//! Common utilities for renderer integration tests.
//!
//! Every test runs against the headless [`DummyDevice`], which records
//! submissions and can be told to complete work late or never.

#![allow(dead_code)]

use std::sync::Arc;

use glam::Vec2;
use parking_lot::Mutex;

use vk2d::backend::{SubmitInfo, SubmitRecord};
use vk2d::task::InlineTaskRunner;
use vk2d::{
    CompletionMode, DummyDevice, Instance, InstanceConfig, ReportSeverity, Vertex, Window,
    WindowConfig,
};

/// Indices of [`quad_vertices`] as two triangles.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Unit quad with texture coordinates covering the whole texture.
pub fn quad_vertices(color: [f32; 4]) -> [Vertex; 4] {
    [
        Vertex::new(Vec2::new(0.0, 0.0), Vec2::new(0.0, 0.0), color),
        Vertex::new(Vec2::new(1.0, 0.0), Vec2::new(1.0, 0.0), color),
        Vertex::new(Vec2::new(1.0, 1.0), Vec2::new(1.0, 1.0), color),
        Vertex::new(Vec2::new(0.0, 1.0), Vec2::new(0.0, 1.0), color),
    ]
}

// ============================================================================
// Test Context
// ============================================================================

/// Reports captured from the instance callback.
pub type ReportLog = Arc<Mutex<Vec<(ReportSeverity, String)>>>;

/// A dummy device, an instance on top of it and everything it reported.
pub struct TestContext {
    pub device: Arc<DummyDevice>,
    pub instance: Arc<Instance>,
    pub reports: ReportLog,
}

impl TestContext {
    pub fn new(mode: CompletionMode) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let device = Arc::new(DummyDevice::with_mode(mode));
        let reports: ReportLog = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let config = InstanceConfig::new()
            .with_task_runner(Arc::new(InlineTaskRunner))
            .with_report_callback(Arc::new(move |severity: ReportSeverity, message: &str| {
                sink.lock().push((severity, message.to_string()));
            }));

        let instance = Instance::new(device.clone(), config).expect("Failed to create instance");
        Self {
            device,
            instance,
            reports,
        }
    }

    pub fn window(&self, width: u32, height: u32) -> Window {
        self.window_with(WindowConfig::new(width, height))
    }

    pub fn window_with(&self, config: WindowConfig) -> Window {
        Window::new(&self.instance, config).expect("Failed to create window")
    }

    /// Reports of exactly `severity`, oldest first.
    pub fn reports_of(&self, severity: ReportSeverity) -> Vec<String> {
        self.reports
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Submit calls made after the first `skip`.
    pub fn submissions_since(&self, skip: usize) -> Vec<SubmitRecord> {
        self.device.submissions().into_iter().skip(skip).collect()
    }
}

// ============================================================================
// Submission Inspection
// ============================================================================

/// Labels of every submission in one submit call, in order.
pub fn labels(record: &SubmitRecord) -> Vec<String> {
    record
        .submissions
        .iter()
        .map(|s| s.label.clone().unwrap_or_default())
        .collect()
}

/// The submission labelled `label` in one submit call.
pub fn find<'a>(record: &'a SubmitRecord, label: &str) -> Option<&'a SubmitInfo> {
    record
        .submissions
        .iter()
        .find(|s| s.label.as_deref() == Some(label))
}

/// Number of submissions labelled `label` across `records`.
pub fn count_labelled(records: &[SubmitRecord], label: &str) -> usize {
    records
        .iter()
        .flat_map(|r| r.submissions.iter())
        .filter(|s| s.label.as_deref() == Some(label))
        .count()
}

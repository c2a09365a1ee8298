//! Render-target dependency tracking.
//!
//! Anything that samples a render target (a window frame or another render
//! target) records a [`DependencyInfo`] for it. When the consumer is
//! submitted, every recorded dependency is committed first, depth first, and
//! the consumer waits on the `(semaphore, value)` pair each commit resolves.
//!
//! ```text
//! Window slot 0 ──► A (swap 1) ──► B (swap 0)
//!                └─► C (swap 0)
//!
//! submit order: B, A, C, window
//! ```

use crate::backend::*;
use crate::error::RenderResult;
use crate::render_target::arena::RenderTargetArena;
use crate::render_target::RenderTargetId;

/// One consumer's reference to one swap buffer of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyInfo {
    target: RenderTargetId,
    swap_index: usize,
    resolved: Option<(SemaphoreHandle, u64)>,
}

impl DependencyInfo {
    pub(crate) fn new(target: RenderTargetId, swap_index: usize) -> Self {
        Self {
            target,
            swap_index,
            resolved: None,
        }
    }

    pub fn target(&self) -> RenderTargetId {
        self.target
    }

    pub fn swap_index(&self) -> usize {
        self.swap_index
    }

    /// Semaphore and value to wait on, once committed.
    pub fn resolved(&self) -> Option<(SemaphoreHandle, u64)> {
        self.resolved
    }

    pub(crate) fn resolve(&mut self, semaphore: SemaphoreHandle, value: u64) {
        self.resolved = Some((semaphore, value));
    }

    /// Refers to the same swap buffer, regardless of resolution.
    pub fn same_source(&self, other: &DependencyInfo) -> bool {
        self.target == other.target && self.swap_index == other.swap_index
    }

    /// Wait entry for a submission that samples this dependency.
    pub(crate) fn wait(&self) -> Option<SemaphoreWait> {
        self.resolved.map(|(semaphore, value)| SemaphoreWait {
            semaphore,
            value,
            stages: PipelineStages::ALL_COMMANDS,
        })
    }
}

/// Deduplicated dependency list.
///
/// Consumers rarely reference more than a handful of render targets, so
/// lookup is a linear scan.
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    entries: Vec<DependencyInfo>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `info` unless the same swap buffer is already present.
    pub fn insert(&mut self, info: DependencyInfo) -> bool {
        if self.entries.iter().any(|e| e.same_source(&info)) {
            return false;
        }
        self.entries.push(info);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyInfo> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn as_slice(&self) -> &[DependencyInfo] {
        &self.entries
    }

    pub(crate) fn replace(&mut self, entries: Vec<DependencyInfo>) {
        self.entries = entries;
    }

    /// Waits on every resolved entry.
    pub(crate) fn waits(&self) -> Vec<SemaphoreWait> {
        self.entries.iter().filter_map(DependencyInfo::wait).collect()
    }
}

/// Submissions produced while committing render targets, in submit order.
#[derive(Debug, Default)]
pub struct SubmissionCollector {
    submissions: Vec<SubmitInfo>,
}

impl SubmissionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, submission: SubmitInfo) {
        self.submissions.push(submission);
    }

    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }

    pub fn into_submissions(self) -> Vec<SubmitInfo> {
        self.submissions
    }
}

/// Per-slot dependency sets of a window.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    slots: Vec<DependencySet>,
}

impl DependencyTracker {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![DependencySet::new(); slot_count],
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn dependencies(&self, slot: usize) -> Option<&DependencySet> {
        self.slots.get(slot)
    }

    /// Record that `slot`'s frame samples `info`.
    pub fn note_usage(&mut self, slot: usize, info: DependencyInfo) {
        if let Some(set) = self.slots.get_mut(slot) {
            if set.insert(info) {
                log::trace!(
                    "Slot {} depends on render target {:?} swap {}",
                    slot,
                    info.target(),
                    info.swap_index()
                );
            }
        }
    }

    /// Commit every render target `slot` samples.
    ///
    /// On the first failure everything committed so far is aborted and the
    /// error is returned.
    pub fn commit_all(
        &mut self,
        slot: usize,
        arena: &mut RenderTargetArena,
        collector: &mut SubmissionCollector,
        device: &dyn GpuDevice,
        max_depth: usize,
    ) -> RenderResult<()> {
        let Some(set) = self.slots.get_mut(slot) else {
            return Ok(());
        };

        let mut entries = set.as_slice().to_vec();
        let mut failure = None;
        for info in &mut entries {
            if let Err(e) = arena.commit(info, collector, device, 0, max_depth) {
                failure = Some(e);
                break;
            }
        }
        set.replace(entries);

        match failure {
            Some(e) => {
                self.abort_all(slot, arena);
                Err(e)
            }
            None => Ok(()),
        }
    }

    pub fn confirm_submission(&self, slot: usize, arena: &mut RenderTargetArena) {
        if let Some(set) = self.slots.get(slot) {
            for info in set.iter() {
                arena.confirm_submission(info);
            }
        }
    }

    /// Mark `slot`'s dependencies finished and forget them.
    pub fn confirm_finished(&mut self, slot: usize, arena: &mut RenderTargetArena) {
        if let Some(set) = self.slots.get_mut(slot) {
            for info in set.iter() {
                arena.confirm_finished(info);
            }
            set.clear();
        }
    }

    /// Undo every commit made for `slot` and forget its dependencies.
    ///
    /// Safe to call repeatedly; targets that are already aborted or were
    /// never committed are left alone. Aborted targets return to
    /// uncommitted with their render pending again.
    pub fn abort_all(&mut self, slot: usize, arena: &mut RenderTargetArena) {
        if let Some(set) = self.slots.get_mut(slot) {
            for info in set.iter() {
                arena.abort(info);
            }
            for info in set.iter() {
                arena.clear_aborted(info);
            }
            set.clear();
        }
    }

    /// Abort everything and resize to `slot_count` empty sets.
    pub fn reset(&mut self, slot_count: usize, arena: &mut RenderTargetArena) {
        for slot in 0..self.slots.len() {
            self.abort_all(slot, arena);
        }
        self.slots = vec![DependencySet::new(); slot_count];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u32) -> RenderTargetId {
        RenderTargetId::new(index, 0)
    }

    #[test]
    fn test_set_dedups_by_swap_buffer() {
        let mut set = DependencySet::new();
        assert!(set.insert(DependencyInfo::new(id(0), 0)));
        assert!(!set.insert(DependencyInfo::new(id(0), 0)));
        assert!(set.insert(DependencyInfo::new(id(0), 1)));
        assert!(set.insert(DependencyInfo::new(id(1), 0)));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_unresolved_entries_have_no_wait() {
        let mut set = DependencySet::new();
        set.insert(DependencyInfo::new(id(0), 0));
        assert!(set.waits().is_empty());
    }

    #[test]
    fn test_note_usage_out_of_range_slot_is_ignored() {
        let mut tracker = DependencyTracker::new(2);
        tracker.note_usage(5, DependencyInfo::new(id(0), 0));
        tracker.note_usage(1, DependencyInfo::new(id(0), 0));
        tracker.note_usage(1, DependencyInfo::new(id(0), 0));
        assert_eq!(tracker.dependencies(1).map(DependencySet::len), Some(1));
        assert!(tracker.dependencies(5).is_none());
    }
}

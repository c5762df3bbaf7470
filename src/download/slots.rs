//! Completion slots that restore manifest order.

use std::path::PathBuf;

/// Terminal result of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Image staged on disk.
    Staged { path: PathBuf, bytes: u64 },
    /// Placeholder with the failure reason.
    Failed { reason: String },
}

impl PageOutcome {
    /// Bytes the page contributes to its part; placeholders count zero.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Staged { bytes, .. } => *bytes,
            Self::Failed { .. } => 0,
        }
    }
}

/// One slot per selected page. Pages complete in any order; [`Self::drain_ready`]
/// hands them out strictly in index order as the completed prefix grows.
#[derive(Debug)]
pub struct PageSlots {
    first: u32,
    slots: Vec<Option<PageOutcome>>,
    cursor: usize,
}

impl PageSlots {
    /// Slots for pages `first..=last`.
    #[must_use]
    pub fn new(first: u32, last: u32) -> Self {
        let len = last.saturating_sub(first) as usize + 1;
        Self {
            first,
            slots: vec![None; len],
            cursor: 0,
        }
    }

    fn position(&self, index: u32) -> Option<usize> {
        let pos = index.checked_sub(self.first)? as usize;
        (pos < self.slots.len()).then_some(pos)
    }

    /// Marks pages before `index` as already handed out.
    pub fn skip_to(&mut self, index: u32) {
        self.cursor = self
            .position(index)
            .unwrap_or(if index < self.first { 0 } else { self.slots.len() });
    }

    /// Records an outcome; out-of-range or repeated fills are ignored.
    pub fn fill(&mut self, index: u32, outcome: PageOutcome) -> bool {
        match self.position(index) {
            Some(pos) if pos >= self.cursor && self.slots[pos].is_none() => {
                self.slots[pos] = Some(outcome);
                true
            }
            _ => false,
        }
    }

    /// Takes the newly contiguous run of filled slots.
    pub fn drain_ready(&mut self) -> Vec<(u32, PageOutcome)> {
        let mut ready = Vec::new();
        while let Some(slot) = self.slots.get_mut(self.cursor) {
            let Some(outcome) = slot.take() else { break };
            ready.push((self.first + self.cursor as u32, outcome));
            self.cursor += 1;
        }
        ready
    }

    /// True once every slot has been handed out.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.cursor == self.slots.len()
    }
}

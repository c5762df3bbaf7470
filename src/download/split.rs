//! Online bin-packing of pages into size-bounded parts.

/// A closed page range ready for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedPart {
    pub number: u32,
    pub first_page: u32,
    pub last_page: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct OpenPart {
    first_page: u32,
    last_page: u32,
    bytes: u64,
}

/// Groups pages, fed in manifest order, into contiguous parts.
///
/// A part is sealed before a page that would push it over the threshold and
/// as soon as it reaches the threshold, so every part stays within the bound
/// unless it holds a single oversized page.
#[derive(Debug)]
pub struct PartPlanner {
    threshold: u64,
    next_number: u32,
    open: Option<OpenPart>,
}

impl PartPlanner {
    /// `threshold` of `None` disables splitting. Numbering starts at `next_number`.
    #[must_use]
    pub fn new(threshold: Option<u64>, next_number: u32) -> Self {
        Self {
            threshold: threshold.unwrap_or(u64::MAX).max(1),
            next_number: next_number.max(1),
            open: None,
        }
    }

    /// Adds the next page; returns the parts this sealed (at most two).
    pub fn push(&mut self, index: u32, bytes: u64) -> Vec<SealedPart> {
        let mut sealed = Vec::new();
        if let Some(open) = self.open
            && open.bytes.saturating_add(bytes) > self.threshold
        {
            sealed.extend(self.seal());
        }

        let open = self.open.get_or_insert(OpenPart {
            first_page: index,
            last_page: index,
            bytes: 0,
        });
        open.last_page = index;
        open.bytes = open.bytes.saturating_add(bytes);

        if open.bytes >= self.threshold {
            sealed.extend(self.seal());
        }
        sealed
    }

    /// Seals whatever remains open.
    pub fn finish(&mut self) -> Option<SealedPart> {
        self.seal()
    }

    fn seal(&mut self) -> Option<SealedPart> {
        let open = self.open.take()?;
        let part = SealedPart {
            number: self.next_number,
            first_page: open.first_page,
            last_page: open.last_page,
            bytes: open.bytes,
        };
        self.next_number += 1;
        Some(part)
    }
}

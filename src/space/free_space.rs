use std::collections::BTreeMap;

/// Free byte ranges of one block group, kept coalesced.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FreeSpace {
    extents: BTreeMap<u64, u64>,
}

impl FreeSpace {
    /// Creates a map covering `[start, start + len)`.
    pub fn with_range(start: u64, len: u64) -> Self {
        let mut free = Self::default();
        free.add(start, len);
        free
    }

    /// Returns a range to the map, merging it with adjacent free ranges.
    pub fn add(&mut self, mut start: u64, mut len: u64) {
        if len == 0 {
            return;
        }
        if let Some((&prev_start, &prev_len)) = self.extents.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.extents.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.extents.remove(&(start + len)) {
            len += next_len;
        }
        self.extents.insert(start, len);
    }

    /// Removes `[start, start + len)` wherever it overlaps free space.
    pub fn remove(&mut self, start: u64, len: u64) {
        let end = start + len;
        let overlapping: Vec<(u64, u64)> = self
            .extents
            .range(..end)
            .filter(|(s, l)| **s + **l > start)
            .map(|(s, l)| (*s, *l))
            .collect();
        for (s, l) in overlapping {
            self.extents.remove(&s);
            if s < start {
                self.extents.insert(s, start - s);
            }
            if s + l > end {
                self.extents.insert(end, s + l - end);
            }
        }
    }

    /// Carves the first `len` bytes starting on an `align` boundary.
    pub fn take_first_fit(&mut self, len: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let found = self.extents.iter().find_map(|(&start, &ext_len)| {
            let aligned = start.div_ceil(align) * align;
            (aligned + len <= start + ext_len).then_some(aligned)
        })?;
        self.remove(found, len);
        Some(found)
    }

    /// Total free bytes.
    pub fn total(&self) -> u64 {
        self.extents.values().sum()
    }

    /// Returns true when `[start, start + len)` is entirely free.
    pub fn contains(&self, start: u64, len: u64) -> bool {
        self.extents
            .range(..=start)
            .next_back()
            .is_some_and(|(s, l)| s + l >= start + len)
    }

    /// Free ranges in offset order.
    pub fn extents(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.extents.iter().map(|(s, l)| (*s, *l))
    }
}

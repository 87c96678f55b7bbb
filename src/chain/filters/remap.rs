//! Offset-remap layer (§4.6): resolve overlapping, priority-ordered
//! mapping rules into a sorted, non-overlapping region table, then
//! decompose every op against it.
//!
//! Ported from nbdkit's `filters/map/map.c`: `parse_range` +
//! `add_implicit_range` + `convert_to_regions` build the region table
//! once at config time; `do_mapping` is the runtime op decomposer. The
//! region table here plays the same role as `region_list` there, just
//! without the separate `regions`/`vector` helper types — a plain sorted
//! `Vec<Region>` is enough since lookups are a binary search.

use crate::chain::{Extent, Handle, Layer, Next};
use crate::error::{ChainError, Result};

/// One mapping rule as supplied by configuration: `[start, end]` maps to
/// `dest`, with later-declared rules taking priority over earlier ones
/// on overlap.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub start: u64,
    pub end: u64,
    pub dest: u64,
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: u64,
    end: u64,
    dest: u64,
    prio: i64,
}

/// A single tile of the non-overlapping region table: `[start, end]`
/// (inclusive) maps byte `o` to `dest + (o - start)`.
#[derive(Debug, Clone, Copy)]
struct Region {
    start: u64,
    end: u64,
    dest: u64,
}

/// The offset-remap filter. Builds its region table once, at
/// construction, from the caller's rule list (lowest priority first);
/// an implicit identity rule covering the whole address space is always
/// appended below all of them.
pub struct RemapFilter {
    regions: Vec<Region>,
}

impl RemapFilter {
    /// `rules` are given lowest-priority-first; the last one in the
    /// slice wins on overlap, matching "later-declared rules have
    /// strictly higher priority" (§4.6).
    pub fn new(rules: &[Rule]) -> Self {
        let mut ranges: Vec<Range> = rules
            .iter()
            .enumerate()
            .map(|(i, r)| Range {
                start: r.start,
                end: r.end,
                dest: r.dest,
                prio: i as i64,
            })
            .collect();
        ranges.push(Range {
            start: 0,
            end: u64::MAX,
            dest: 0,
            prio: i64::MIN,
        });
        RemapFilter {
            regions: convert_to_regions(ranges),
        }
    }

    fn find_region(&self, offset: u64) -> &Region {
        // regions tile [0, u64::MAX] with no gaps, sorted by start.
        let idx = match self.regions.binary_search_by(|r| r.start.cmp(&offset)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        &self.regions[idx]
    }

    /// Split `[offset, offset+count)` into (translated_offset, len)
    /// pieces, each wholly inside one region.
    fn decompose(&self, offset: u64, count: u64) -> Vec<(u64, u64)> {
        let mut pieces = Vec::new();
        let mut offset = offset;
        let mut remaining = count;
        while remaining > 0 {
            let region = self.find_region(offset);
            let ofs_in_region = offset - region.start;
            let available = region.end - region.start + 1 - ofs_in_region;
            let len = remaining.min(available);
            pieces.push((region.dest + ofs_in_region, len));
            offset += len;
            remaining -= len;
        }
        pieces
    }

    /// Undo the mapping for an extent reported by the layer below,
    /// rewriting its offset back into this layer's address space. Only
    /// correct when the extent lies wholly inside one region, which
    /// holds here because every extents() call is itself decomposed
    /// region-by-region before being forwarded.
    fn invert(&self, region: &Region, dest_offset: u64) -> u64 {
        region.start + (dest_offset - region.dest)
    }
}

/// Port of `convert_to_regions` in map.c: split every range at every
/// boundary introduced by any other range, then drop lower-priority
/// duplicates at identical `[start, end]` spans.
fn convert_to_regions(mut ranges: Vec<Range>) -> Vec<Region> {
    let mut bounds: Vec<u64> = Vec::with_capacity(ranges.len() * 2);
    for r in &ranges {
        bounds.push(r.start);
        // end+1 as a boundary; saturate so the top-of-space rule doesn't wrap.
        bounds.push(r.end.saturating_add(1));
    }
    bounds.sort_unstable();
    bounds.dedup();

    let orig_len = ranges.len();
    for i in 0..orig_len {
        let (i_start, i_end, i_dest, i_prio) =
            (ranges[i].start, ranges[i].end, ranges[i].dest, ranges[i].prio);
        let mut new_ranges: Vec<Range> = bounds
            .iter()
            .copied()
            .filter(|&b| i_start < b && b <= i_end)
            .map(|b| Range {
                start: b,
                end: i_end,
                dest: i_dest + (b - i_start),
                prio: i_prio,
            })
            .collect();
        if !new_ranges.is_empty() {
            ranges[i].end = new_ranges[0].start - 1;
            for j in 0..new_ranges.len() {
                if j + 1 < new_ranges.len() {
                    new_ranges[j].end = new_ranges[j + 1].start - 1;
                }
            }
            ranges.extend(new_ranges);
        }
    }

    ranges.sort_by_key(|r| r.start);

    // Keep the highest-priority range at each distinct [start, end] span.
    let mut deduped: Vec<Range> = Vec::with_capacity(ranges.len());
    let mut i = 0;
    while i < ranges.len() {
        let mut best = ranges[i];
        let mut j = i + 1;
        while j < ranges.len() && ranges[j].start == best.start {
            if ranges[j].prio > best.prio {
                best = ranges[j];
            }
            j += 1;
        }
        deduped.push(best);
        i = j;
    }

    debug_assert_eq!(deduped[0].start, 0);
    for w in deduped.windows(2) {
        debug_assert_eq!(w[0].end + 1, w[1].start);
    }

    deduped
        .into_iter()
        .map(|r| Region {
            start: r.start,
            end: r.end,
            dest: r.dest,
        })
        .collect()
}

impl Layer for RemapFilter {
    fn name(&self) -> &str {
        "map"
    }

    fn pread(&self, next: &Next, _handle: &Handle, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut pos = 0usize;
        for (dest, len) in self.decompose(offset, buf.len() as u64) {
            let len = len as usize;
            next.pread(&mut buf[pos..pos + len], dest)?;
            pos += len;
        }
        Ok(())
    }

    fn pwrite(
        &self,
        next: &Next,
        _handle: &Handle,
        buf: &[u8],
        offset: u64,
        fua: bool,
    ) -> Result<()> {
        let mut pos = 0usize;
        for (dest, len) in self.decompose(offset, buf.len() as u64) {
            let len = len as usize;
            next.pwrite(&buf[pos..pos + len], dest, fua)?;
            pos += len;
        }
        Ok(())
    }

    fn trim(&self, next: &Next, _handle: &Handle, offset: u64, len: u64, fua: bool) -> Result<()> {
        for (dest, len) in self.decompose(offset, len) {
            next.trim(dest, len, fua)?;
        }
        Ok(())
    }

    fn zero(
        &self,
        next: &Next,
        _handle: &Handle,
        offset: u64,
        len: u64,
        fua: bool,
        no_hole: bool,
    ) -> Result<()> {
        for (dest, len) in self.decompose(offset, len) {
            next.zero(dest, len, fua, no_hole)?;
        }
        Ok(())
    }

    fn cache(&self, next: &Next, _handle: &Handle, offset: u64, len: u64) -> Result<()> {
        for (dest, len) in self.decompose(offset, len) {
            next.cache(dest, len)?;
        }
        Ok(())
    }

    fn extents(
        &self,
        next: &Next,
        _handle: &Handle,
        offset: u64,
        len: u64,
        req_one: bool,
    ) -> Result<Vec<Extent>> {
        let mut out = Vec::new();
        let mut src_offset = offset;
        let mut remaining = len;
        while remaining > 0 {
            let region = *self.find_region(src_offset);
            let ofs_in_region = src_offset - region.start;
            let available = region.end - region.start + 1 - ofs_in_region;
            let piece_len = remaining.min(available);
            let dest = region.dest + ofs_in_region;

            for e in next.extents(dest, piece_len, req_one)? {
                out.push(Extent {
                    offset: self.invert(&region, e.offset),
                    length: e.length,
                    flags: e.flags,
                });
            }

            src_offset += piece_len;
            remaining -= piece_len;
        }
        if out.is_empty() {
            return Err(ChainError::out_of_range("empty extents request"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::plugin::MemoryPlugin;
    use crate::chain::ChainBuilder;
    use std::sync::Arc;

    fn table() -> RemapFilter {
        RemapFilter::new(&[
            Rule { start: 10, end: 19, dest: 100 },
            Rule { start: 15, end: 24, dest: 200 },
        ])
    }

    #[test]
    fn tiles_the_whole_address_space_without_gaps() {
        let filter = table();
        for w in filter.regions.windows(2) {
            assert_eq!(w[0].end + 1, w[1].start);
        }
        assert_eq!(filter.regions[0].start, 0);
    }

    #[test]
    fn resolves_overlap_in_priority_order() {
        let filter = table();
        assert_eq!(filter.decompose(9, 1), vec![(9, 1)]);
        assert_eq!(filter.decompose(10, 1), vec![(100, 1)]);
        assert_eq!(filter.decompose(20, 1), vec![(205, 1)]);
        assert_eq!(filter.decompose(25, 1), vec![(25, 1)]);
    }

    #[test]
    fn splits_a_read_spanning_two_regions() {
        let filter = RemapFilter::new(&[
            Rule { start: 0, end: 999, dest: 0 },
            Rule { start: 500, end: 1499, dest: 10_000 },
        ]);
        let pieces = filter.decompose(0, 1500);
        assert_eq!(pieces, vec![(0, 500), (10_000, 500), (10_500, 500)]);
    }

    #[test]
    fn tiles_without_gaps_for_random_overlapping_rules() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut rules = Vec::new();
            for _ in 0..rng.gen_range(1..8) {
                let start = rng.gen_range(0..1000);
                let end = start + rng.gen_range(0..200);
                let dest = rng.gen_range(0..100_000);
                rules.push(Rule { start, end, dest });
            }
            let filter = RemapFilter::new(&rules);
            assert_eq!(filter.regions[0].start, 0);
            assert_eq!(filter.regions.last().unwrap().end, u64::MAX);
            for w in filter.regions.windows(2) {
                assert_eq!(w[0].end + 1, w[1].start, "gap or overlap in {:?}", filter.regions);
            }
        }
    }

    #[test]
    fn reads_through_the_chain_end_to_end() {
        let mut backing = vec![0u8; 20_000];
        backing[0..500].copy_from_slice(&vec![1u8; 500]);
        backing[10_000..11_000].copy_from_slice(&vec![2u8; 1000]);
        let chain = ChainBuilder::new()
            .push(Arc::new(RemapFilter::new(&[
                Rule { start: 0, end: 999, dest: 0 },
                Rule { start: 500, end: 1499, dest: 10_000 },
            ])))
            .push(Arc::new(MemoryPlugin::new(backing, false)))
            .build()
            .unwrap();
        let handles = chain.open(true).unwrap();
        let top = chain.top(&handles);
        let mut buf = vec![0u8; 1500];
        top.pread(&mut buf, 0).unwrap();
        assert!(buf[0..500].iter().all(|&b| b == 1));
        assert!(buf[500..1500].iter().all(|&b| b == 2));
        chain.close(handles);
    }
}

use std::fmt;

use log::{debug, error, trace};

use crate::node::{BLOCK_SIZE_BYTES, BlockKind, BlockNode, END_OF_CHAIN};

/// Audit cadence used when `HeapCreateInfo` leaves the period unset.
pub const DEFAULT_AUDIT_PERIOD_MS: u32 = 100;

/// Fire-and-forget notification invoked once when the block directory fails
/// verification. It carries no payload; details live in the stats snapshot.
pub type CorruptionHook = Box<dyn FnMut() + Send>;

#[derive(Default)]
pub struct HeapCreateInfo {
    /// Backing storage. Ownership moves into the heap; the length floors to
    /// whole allocation units and a trailing partial unit stays unused.
    pub arena: Box<[u8]>,
    /// Milliseconds between integrity audits.
    pub audit_period_ms: Option<u32>,
    pub on_corruption: Option<CorruptionHook>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeapState {
    Ready,
    /// Terminal: entered on the first verification failure, never left.
    Corrupt,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeapError {
    ArenaTooSmall,
    ArenaTooLarge,
    ZeroSize,
    Exhausted,
    Misaligned,
    OutOfRange,
    UnknownBlock,
    Corrupted,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            HeapError::ArenaTooSmall => "arena smaller than one allocation unit",
            HeapError::ArenaTooLarge => "arena exceeds the 16-bit unit index space",
            HeapError::ZeroSize => "zero-size allocation request",
            HeapError::Exhausted => "no free region large enough",
            HeapError::Misaligned => "pointer not aligned to an allocation unit",
            HeapError::OutOfRange => "pointer outside the arena",
            HeapError::UnknownBlock => "no allocated region starts at this pointer",
            HeapError::Corrupted => "block directory failed verification",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for HeapError {}

/// Handle to a payload region: the byte offset of its first payload byte
/// within the arena. Stands in for the raw pointer a firmware heap would
/// hand out; `free` re-validates it, so a forged value is rejected, not UB.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapPtr(u32);

impl HeapPtr {
    pub fn from_offset(offset: u32) -> Self {
        HeapPtr(offset)
    }

    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

/// Per-kind figures from the last clean audit, in bytes. `min_bytes` and
/// `max_bytes` are zero while the kind has no regions.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RegionStats {
    pub count: u16,
    pub min_bytes: u32,
    pub max_bytes: u32,
    pub total_bytes: u32,
}

/// Diagnostics snapshot. Refreshed wholesale by each clean audit; a walk
/// that hits corruption leaves the previous figures in place.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct HeapStats {
    pub free: RegionStats,
    pub allocated: RegionStats,
    pub capacity_bytes: u32,
    pub free_pct: f32,
    pub allocated_pct: f32,
    /// Unit index of the first header that failed verification, if any.
    pub corrupt_index: Option<u16>,
}

// verification fault raised mid-walk: the first header that failed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct CorruptBlock {
    index: u16,
}

/// Verified traversal of the block directory, shared by every operation
/// that walks the chain. Yields each header once its checksum and bounds
/// check out, and fuses after the first fault. A fault is a checksum
/// mismatch, a header whose region reaches past the arena, a `next` index
/// outside it, or a chain longer than the arena has units (cycle guard).
struct ChainWalk<'a> {
    arena: &'a [u8],
    capacity: u16,
    next: Option<u16>,
    steps: u16,
}

impl<'a> ChainWalk<'a> {
    fn new(arena: &'a [u8], capacity: u16) -> Self {
        Self {
            arena,
            capacity,
            next: Some(0),
            steps: 0,
        }
    }
}

impl Iterator for ChainWalk<'_> {
    type Item = Result<(u16, BlockNode), CorruptBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.take()?;
        if index >= self.capacity || self.steps >= self.capacity {
            return Some(Err(CorruptBlock { index }));
        }
        let at = index as usize * BLOCK_SIZE_BYTES;
        match BlockNode::decode(&self.arena[at..at + BLOCK_SIZE_BYTES]) {
            Some(node) if index as u32 + node.size as u32 <= self.capacity as u32 => {
                self.steps += 1;
                if node.next != END_OF_CHAIN {
                    self.next = Some(node.next);
                }
                Some(Ok((index, node)))
            }
            _ => Some(Err(CorruptBlock { index })),
        }
    }
}

/// Fixed-arena heap: regions carved out of one byte array, described by an
/// in-place chain of checksummed headers.
///
/// No internal locking. Drive it from a single task, or wrap every call in
/// the caller's own mutual exclusion; unsynchronized concurrent calls are
/// ruled out by `&mut self` receivers.
pub struct Heap {
    arena: Box<[u8]>,
    capacity: u16,
    state: HeapState,
    audit_period_ms: u32,
    last_audit_ms: u32,
    on_corruption: Option<CorruptionHook>,
    stats: HeapStats,
}

impl Heap {
    /// Installs the arena as a single free region and readies the heap.
    pub fn new(info: HeapCreateInfo) -> Result<Self, HeapError> {
        let units = info.arena.len() / BLOCK_SIZE_BYTES;
        if units == 0 {
            return Err(HeapError::ArenaTooSmall);
        }
        if units >= END_OF_CHAIN as usize {
            return Err(HeapError::ArenaTooLarge);
        }
        let capacity = units as u16;

        let mut heap = Heap {
            arena: info.arena,
            capacity,
            state: HeapState::Ready,
            audit_period_ms: info.audit_period_ms.unwrap_or(DEFAULT_AUDIT_PERIOD_MS),
            last_audit_ms: 0,
            on_corruption: info.on_corruption,
            stats: HeapStats {
                capacity_bytes: capacity as u32 * BLOCK_SIZE_BYTES as u32,
                ..HeapStats::default()
            },
        };
        heap.write_node(
            0,
            BlockNode {
                kind: BlockKind::Free,
                next: END_OF_CHAIN,
                size: capacity,
            },
        );
        debug!("heap ready: {capacity} units of {BLOCK_SIZE_BYTES} bytes");
        Ok(heap)
    }

    pub fn state(&self) -> HeapState {
        self.state
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn capacity_units(&self) -> u16 {
        self.capacity
    }

    /// Best-fit allocation of `size_bytes`, returning a handle to the first
    /// payload byte. Payload bytes are handed out as-is, never cleared.
    pub fn allocate(&mut self, size_bytes: usize) -> Result<HeapPtr, HeapError> {
        if self.state == HeapState::Corrupt {
            return Err(HeapError::Corrupted);
        }
        if size_bytes == 0 {
            return Err(HeapError::ZeroSize);
        }
        // one extra unit carries the region's own header
        let units = size_bytes.div_ceil(BLOCK_SIZE_BYTES) + 1;
        if units > self.capacity as usize {
            return Err(HeapError::Exhausted);
        }
        let units = units as u16;

        let mut best: Option<(u16, BlockNode)> = None;
        let mut fault = None;
        for step in ChainWalk::new(&self.arena, self.capacity) {
            match step {
                Err(bad) => {
                    fault = Some(bad);
                    break;
                }
                Ok((index, node)) => {
                    if node.kind != BlockKind::Free || node.size < units {
                        continue;
                    }
                    // a tie keeps the earlier region in address order
                    if best.is_none_or(|(_, held)| node.size < held.size) {
                        best = Some((index, node));
                    }
                }
            }
        }
        if let Some(bad) = fault {
            return Err(self.fail(bad));
        }

        let (index, node) = best.ok_or(HeapError::Exhausted)?;
        let node = self.split(index, node, units);
        self.write_node(
            index,
            BlockNode {
                kind: BlockKind::Allocated,
                ..node
            },
        );
        trace!("allocated {units} units at unit {index}");
        Ok(HeapPtr::from_offset(
            (index as u32 + 1) * BLOCK_SIZE_BYTES as u32,
        ))
    }

    /// Releases an allocated region, then merges what the release exposed.
    /// Freeing an already-free region is a successful no-op.
    pub fn free(&mut self, ptr: HeapPtr) -> Result<(), HeapError> {
        let (index, node) = self.locate(ptr)?;
        if node.kind == BlockKind::Free {
            return Ok(());
        }
        self.write_node(
            index,
            BlockNode {
                kind: BlockKind::Free,
                ..node
            },
        );
        trace!("freed unit {index}");

        // one release exposes at most a run of three free neighbours, which
        // two merge passes at the first adjacent pair fold into one region
        if let Some(first) = self.find_adjacent_free()? {
            self.merge_at(first);
            self.merge_at(first);
        }
        Ok(())
    }

    /// Mutable view of the payload bytes behind a handle. The header unit is
    /// never part of the slice.
    pub fn payload_mut(&mut self, ptr: HeapPtr) -> Result<&mut [u8], HeapError> {
        let (index, node) = self.locate(ptr)?;
        if node.kind != BlockKind::Allocated {
            return Err(HeapError::UnknownBlock);
        }
        let at = (index as usize + 1) * BLOCK_SIZE_BYTES;
        let len = (node.size as usize - 1) * BLOCK_SIZE_BYTES;
        Ok(&mut self.arena[at..at + len])
    }

    /// Rate-limited integrity audit, meant to be driven from the main loop
    /// with a monotonic millisecond tick. Wrapping of the tick is fine.
    pub fn tick(&mut self, now_ms: u32) {
        if self.state == HeapState::Corrupt {
            return;
        }
        if now_ms.wrapping_sub(self.last_audit_ms) < self.audit_period_ms {
            return;
        }
        self.last_audit_ms = now_ms;
        self.audit();
    }

    /// Full-chain audit refreshing the diagnostics snapshot.
    fn audit(&mut self) {
        let mut free = Tally::default();
        let mut allocated = Tally::default();
        let mut fault = None;
        for step in ChainWalk::new(&self.arena, self.capacity) {
            match step {
                Err(bad) => {
                    fault = Some(bad);
                    break;
                }
                Ok((_, node)) => {
                    let bytes = node.size as u32 * BLOCK_SIZE_BYTES as u32;
                    match node.kind {
                        BlockKind::Free => free.add(bytes),
                        BlockKind::Allocated => allocated.add(bytes),
                    }
                }
            }
        }
        if let Some(bad) = fault {
            // figures from a partial walk are worthless, keep the previous
            // snapshot
            self.fail(bad);
            return;
        }

        let free = free.into_stats();
        let allocated = allocated.into_stats();
        let capacity_bytes = self.stats.capacity_bytes;
        self.stats = HeapStats {
            free,
            allocated,
            capacity_bytes,
            free_pct: 100.0 * free.total_bytes as f32 / capacity_bytes as f32,
            allocated_pct: 100.0 * allocated.total_bytes as f32 / capacity_bytes as f32,
            corrupt_index: None,
        };
        trace!(
            "audit: {} free / {} allocated regions, {:.1}% in use",
            free.count, allocated.count, self.stats.allocated_pct
        );
    }

    /// Maps a payload handle back to its header index, then walks the chain
    /// until that header is visited. Usage errors leave the heap untouched.
    fn locate(&mut self, ptr: HeapPtr) -> Result<(u16, BlockNode), HeapError> {
        if self.state == HeapState::Corrupt {
            return Err(HeapError::Corrupted);
        }
        let offset = ptr.offset();
        if offset % BLOCK_SIZE_BYTES != 0 {
            return Err(HeapError::Misaligned);
        }
        let unit = offset / BLOCK_SIZE_BYTES;
        if unit == 0 || unit > self.capacity as usize {
            return Err(HeapError::OutOfRange);
        }
        let target = (unit - 1) as u16;

        let mut found = None;
        let mut fault = None;
        for step in ChainWalk::new(&self.arena, self.capacity) {
            match step {
                Err(bad) => {
                    fault = Some(bad);
                    break;
                }
                Ok((index, node)) => {
                    if index == target {
                        found = Some(node);
                        break;
                    }
                }
            }
        }
        if let Some(bad) = fault {
            return Err(self.fail(bad));
        }
        found.map(|node| (target, node)).ok_or(HeapError::UnknownBlock)
    }

    /// Splits `node` so its first `units` stay in place and the remainder
    /// becomes a free region chained right behind. Exact fits pass through.
    /// Returns the header the caller still has to write at `index`.
    fn split(&mut self, index: u16, node: BlockNode, units: u16) -> BlockNode {
        if node.size <= units {
            return node;
        }
        let tail = index + units;
        self.write_node(
            tail,
            BlockNode {
                kind: BlockKind::Free,
                next: node.next,
                size: node.size - units,
            },
        );
        BlockNode {
            kind: node.kind,
            next: tail,
            size: units,
        }
    }

    /// First header of the first chain-adjacent pair of free regions.
    fn find_adjacent_free(&mut self) -> Result<Option<u16>, HeapError> {
        let mut prev: Option<(u16, BlockNode)> = None;
        let mut pair = None;
        let mut fault = None;
        for step in ChainWalk::new(&self.arena, self.capacity) {
            match step {
                Err(bad) => {
                    fault = Some(bad);
                    break;
                }
                Ok((index, node)) => {
                    if let Some((first, held)) = prev {
                        if held.kind == BlockKind::Free && node.kind == BlockKind::Free {
                            pair = Some(first);
                            break;
                        }
                    }
                    prev = Some((index, node));
                }
            }
        }
        if let Some(bad) = fault {
            return Err(self.fail(bad));
        }
        Ok(pair)
    }

    /// Absorbs the region after `index` into it when both are free. The
    /// absorbed header drops out of the chain; its bytes stay stale until a
    /// later split overwrites them.
    fn merge_at(&mut self, index: u16) {
        let Some(node) = self.node_at(index) else {
            return;
        };
        if node.kind != BlockKind::Free || node.next == END_OF_CHAIN {
            return;
        }
        let Some(tail) = self.node_at(node.next) else {
            return;
        };
        if tail.kind != BlockKind::Free {
            return;
        }
        self.write_node(
            index,
            BlockNode {
                kind: BlockKind::Free,
                next: tail.next,
                size: node.size + tail.size,
            },
        );
    }

    // plain header read for the merge passes, which run right after a
    // verified walk; None when the unit no longer holds a fitting header
    fn node_at(&self, index: u16) -> Option<BlockNode> {
        if index >= self.capacity {
            return None;
        }
        let at = index as usize * BLOCK_SIZE_BYTES;
        let node = BlockNode::decode(&self.arena[at..at + BLOCK_SIZE_BYTES])?;
        (index as u32 + node.size as u32 <= self.capacity as u32).then_some(node)
    }

    fn write_node(&mut self, index: u16, node: BlockNode) {
        let at = index as usize * BLOCK_SIZE_BYTES;
        self.arena[at..at + BLOCK_SIZE_BYTES].copy_from_slice(&node.encode());
    }

    /// Terminal corruption handling: records the failing unit, flips the
    /// state and fires the notification hook. Later calls are rejected up
    /// front, so the hook fires at most once per heap.
    fn fail(&mut self, bad: CorruptBlock) -> HeapError {
        error!("block directory verification failed at unit {}", bad.index);
        self.state = HeapState::Corrupt;
        self.stats.corrupt_index = Some(bad.index);
        if let Some(hook) = self.on_corruption.as_mut() {
            hook();
        }
        HeapError::Corrupted
    }
}

#[derive(Default)]
struct Tally {
    count: u16,
    min: u32,
    max: u32,
    total: u32,
}

impl Tally {
    fn add(&mut self, bytes: u32) {
        if self.count == 0 || bytes < self.min {
            self.min = bytes;
        }
        if bytes > self.max {
            self.max = bytes;
        }
        self.count += 1;
        self.total += bytes;
    }

    fn into_stats(self) -> RegionStats {
        RegionStats {
            count: self.count,
            min_bytes: self.min,
            max_bytes: self.max,
            total_bytes: self.total,
        }
    }
}

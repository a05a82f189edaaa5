//! Deferred-resolution stack-frame allocator.
//!
//! Frame layout cannot be decided while instructions are emitted in order:
//! the arms of a conditional allocate independently, and a value produced in
//! one arm may have to land in the very slot a sibling arm fills. Emission
//! therefore only records events into a tree of [`CheckpointId`]s (one per
//! branch scope); [`StackAllocator::resolve`] later replays the tree with a
//! best-fit, coalescing free list and writes every offset at once.
//!
//! ```text
//! root:  Alloc(a) Branch(c1) Free(a) ...
//!                    │
//! c1:    Alloc(t) Free(t) Alloc(r)   ← `r` survives rewind, is bound to root
//! ```
//!
//! Allocations are stored in an arena and addressed by [`AllocId`]; aliasing
//! is a parent-pointer union-find over that arena.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{CodegenConfig, FreePolicy};
use crate::latent::Latent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId(u32);

impl fmt::Display for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checkpoint#{}", self.0)
    }
}

/// Allocator invariant violations. These are always backend defects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("{0} freed twice")]
    DoubleFree(AllocId),

    #[error("{alloc} freed under strict policy but it {reason}")]
    StrictFree { alloc: AllocId, reason: &'static str },

    #[error("{0} restored without a prior successful rewind")]
    RestoreWithoutRewind(CheckpointId),

    #[error("branching allocations not resolved by prior aliasing: {alloc} in {checkpoint}")]
    UnresolvedBranchAllocation {
        checkpoint: CheckpointId,
        alloc: AllocId,
    },

    #[error("{0} is not the active checkpoint")]
    NotActive(CheckpointId),

    #[error("the root checkpoint cannot be rewound, restored or discarded")]
    RootCheckpoint,

    #[error("cannot alias {alloc} ({size} bytes) onto {of} ({of_size} bytes)")]
    AliasSizeMismatch {
        alloc: AllocId,
        size: u32,
        of: AllocId,
        of_size: u32,
    },

    #[error("aliasing {0} would create a cycle")]
    AliasCycle(AllocId),

    #[error("{0} is already an alias")]
    AlreadyAliased(AllocId),

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u32),

    #[error("stack frame exceeds the addressable range")]
    FrameTooLarge,

    #[error("stack frame is already resolved")]
    AlreadyResolved,

    #[error("offset of {0} was written twice")]
    OffsetConflict(AllocId),
}

pub type StackResult<T> = Result<T, StackError>;

/// Handle to one stack-resident value.
///
/// The offset is relative to the frame base and becomes readable once the
/// owning allocator has been resolved. Allocations that are never placed
/// (zero-sized, or abandoned in a discarded branch) keep an unresolved offset.
#[derive(Debug, Clone)]
pub struct StackAllocation {
    id: AllocId,
    size: u32,
    align: u32,
    offset: Latent<u32>,
}

impl StackAllocation {
    pub fn id(&self) -> AllocId {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn align(&self) -> u32 {
        self.align
    }

    pub fn offset(&self) -> &Latent<u32> {
        &self.offset
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Allocate(AllocId),
    Free(AllocId),
    Branch(CheckpointId),
}

struct AllocState {
    size: u32,
    align: u32,
    offset: Latent<u32>,
    in_use: bool,
    alias: Option<AllocId>,
    owner: CheckpointId,
}

struct CheckpointState {
    timeline: Vec<Event>,
    local: BTreeSet<AllocId>,
    previous: Option<CheckpointId>,
    /// Allocations bound into `previous` by the first rewind.
    promoted: Vec<AllocId>,
    rewinds: u32,
}

impl CheckpointState {
    fn new(previous: Option<CheckpointId>) -> Self {
        Self {
            timeline: Vec::new(),
            local: BTreeSet::new(),
            previous,
            promoted: Vec::new(),
            rewinds: 0,
        }
    }
}

/// A reusable byte range `[head, tail)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    head: u32,
    tail: u32,
}

impl Region {
    fn len(&self) -> u32 {
        self.tail - self.head
    }
}

/// Free list and high-water mark used while replaying the event tree.
#[derive(Default)]
struct FrameLayout {
    /// Sorted by `head`, never overlapping, never adjacent.
    regions: Vec<Region>,
    top: u32,
}

impl FrameLayout {
    fn place(&mut self, size: u32, align: u32) -> StackResult<u32> {
        let mut best: Option<(usize, u32)> = None;
        for (i, region) in self.regions.iter().enumerate() {
            let start = align_up(region.head, align)?;
            let fits = start
                .checked_add(size)
                .is_some_and(|end| end <= region.tail);
            let tighter = best.map_or(true, |(j, _)| region.len() < self.regions[j].len());
            if fits && tighter {
                best = Some((i, start));
            }
        }

        if let Some((i, start)) = best {
            let region = self.regions.remove(i);
            let end = start + size;
            if end < region.tail {
                self.regions.insert(i, Region { head: end, tail: region.tail });
            }
            if region.head < start {
                self.regions.insert(i, Region { head: region.head, tail: start });
            }
            return Ok(start);
        }

        // Grow the frame, starting inside a trailing free region if there is one.
        let base = match self.regions.last() {
            Some(last) if last.tail == self.top => {
                let last = *last;
                self.regions.pop();
                last.head
            }
            _ => self.top,
        };
        let start = align_up(base, align)?;
        if base < start {
            self.regions.push(Region { head: base, tail: start });
        }
        self.top = start.checked_add(size).ok_or(StackError::FrameTooLarge)?;
        Ok(start)
    }

    fn release(&mut self, head: u32, size: u32) {
        let tail = head + size;
        let at = self.regions.partition_point(|r| r.head < head);
        self.regions.insert(at, Region { head, tail });

        if at + 1 < self.regions.len() && self.regions[at + 1].head == tail {
            self.regions[at].tail = self.regions[at + 1].tail;
            self.regions.remove(at + 1);
        }
        if at > 0 && self.regions[at - 1].tail == head {
            self.regions[at - 1].tail = self.regions[at].tail;
            self.regions.remove(at);
        }
    }
}

fn align_up(value: u32, align: u32) -> StackResult<u32> {
    let mask = align - 1;
    value
        .checked_add(mask)
        .map(|v| v & !mask)
        .ok_or(StackError::FrameTooLarge)
}

/// Stack-frame allocator for one function.
pub struct StackAllocator {
    allocs: Vec<AllocState>,
    checkpoints: Vec<CheckpointState>,
    active: CheckpointId,
    free_policy: FreePolicy,
    frame_alignment: u32,
    size: Latent<u32>,
    resolved: bool,
}

impl StackAllocator {
    pub fn new(free_policy: FreePolicy, frame_alignment: u32) -> Self {
        Self {
            allocs: Vec::new(),
            checkpoints: vec![CheckpointState::new(None)],
            active: CheckpointId(0),
            free_policy,
            frame_alignment: frame_alignment.max(1),
            size: Latent::new("frame size"),
            resolved: false,
        }
    }

    pub fn from_config(config: &CodegenConfig) -> Self {
        Self::new(config.free_policy, config.stack_alignment)
    }

    pub fn root(&self) -> CheckpointId {
        CheckpointId(0)
    }

    pub fn active(&self) -> CheckpointId {
        self.active
    }

    // ── Recording ────────────────────────────────────────────────────────

    pub fn allocate(&mut self, size: u32, align: u32) -> StackResult<StackAllocation> {
        self.ensure_open()?;
        if !align.is_power_of_two() {
            return Err(StackError::InvalidAlignment(align));
        }
        let id = AllocId(self.allocs.len() as u32);
        let offset = Latent::new("stack offset");
        self.allocs.push(AllocState {
            size,
            align,
            offset: offset.clone(),
            in_use: true,
            alias: None,
            owner: self.active,
        });
        let cp = self.checkpoint_mut(self.active);
        cp.timeline.push(Event::Allocate(id));
        cp.local.insert(id);
        trace!(%id, size, align, checkpoint = %self.active, "stack allocate");
        Ok(StackAllocation {
            id,
            size,
            align,
            offset,
        })
    }

    pub fn free(&mut self, alloc: &StackAllocation) -> StackResult<()> {
        self.ensure_open()?;
        let id = alloc.id;
        let (size, alias, in_use, owner) = {
            let state = self.state(id);
            (state.size, state.alias, state.in_use, state.owner)
        };

        let no_bytes_reason = if alias.is_some() {
            Some("is aliased")
        } else if size == 0 {
            Some("is zero-sized")
        } else {
            None
        };

        if let Some(reason) = no_bytes_reason {
            if self.free_policy == FreePolicy::Strict {
                return Err(StackError::StrictFree { alloc: id, reason });
            }
            // Lenient: bookkeeping only, nothing to return to the free list.
            self.state_mut(id).in_use = false;
            self.checkpoint_mut(owner).local.remove(&id);
            return Ok(());
        }

        if !in_use {
            return Err(StackError::DoubleFree(id));
        }
        self.state_mut(id).in_use = false;
        self.checkpoint_mut(owner).local.remove(&id);
        let active = self.active;
        self.checkpoint_mut(active).timeline.push(Event::Free(id));
        trace!(%id, checkpoint = %active, "stack free");
        Ok(())
    }

    /// Enter a branch scope.
    pub fn checkpoint(&mut self) -> StackResult<CheckpointId> {
        self.ensure_open()?;
        let id = CheckpointId(self.checkpoints.len() as u32);
        let parent = self.active;
        self.checkpoints.push(CheckpointState::new(Some(parent)));
        self.checkpoint_mut(parent).timeline.push(Event::Branch(id));
        self.active = id;
        Ok(id)
    }

    /// Leave a branch arm.
    ///
    /// The first rewind binds every live, non-aliased local allocation into
    /// the parent so the value outlives the branch. Any later rewind of the
    /// same checkpoint (a sibling arm) requires every remaining local to be
    /// an alias of something bound earlier.
    pub fn rewind(&mut self, cp: CheckpointId) -> StackResult<()> {
        self.ensure_open()?;
        self.ensure_active(cp)?;
        let parent = self.parent(cp)?;
        let local = std::mem::take(&mut self.checkpoint_mut(cp).local);
        let first = self.checkpoint_state(cp).rewinds == 0;

        if first {
            let mut promoted = Vec::new();
            for id in local {
                let state = self.state_mut(id);
                if state.alias.is_none() && state.in_use {
                    state.owner = parent;
                    promoted.push(id);
                }
            }
            let parent_state = self.checkpoint_mut(parent);
            parent_state.local.extend(promoted.iter().copied());
            debug!(checkpoint = %cp, promoted = promoted.len(), "first rewind");
            self.checkpoint_mut(cp).promoted = promoted;
        } else if let Some(&id) = local
            .iter()
            .find(|&&id| self.state(id).alias.is_none() && self.state(id).in_use)
        {
            self.checkpoint_mut(cp).local = local;
            return Err(StackError::UnresolvedBranchAllocation {
                checkpoint: cp,
                alloc: id,
            });
        }

        self.checkpoint_mut(cp).rewinds += 1;
        Ok(())
    }

    /// Return to the parent checkpoint. The branch must have been rewound.
    pub fn restore(&mut self, cp: CheckpointId) -> StackResult<()> {
        self.ensure_open()?;
        self.ensure_active(cp)?;
        let parent = self.parent(cp)?;
        let state = self.checkpoint_state(cp);
        if state.rewinds == 0 || !state.local.is_empty() {
            return Err(StackError::RestoreWithoutRewind(cp));
        }
        self.active = parent;
        Ok(())
    }

    /// Abandon the active branch: its code was thrown away, so nothing it
    /// allocated (other than allocations an earlier rewind bound into the
    /// parent) will ever be placed.
    pub fn discard(&mut self, cp: CheckpointId) -> StackResult<()> {
        self.ensure_open()?;
        self.ensure_active(cp)?;
        let parent = self.parent(cp)?;

        for id in std::mem::take(&mut self.checkpoint_mut(cp).local) {
            self.state_mut(id).in_use = false;
        }
        // Promoted allocations still need a slot; they take the branch's place
        // in the parent timeline.
        let replacement: Vec<Event> = self
            .checkpoint_state(cp)
            .promoted
            .iter()
            .map(|&id| Event::Allocate(id))
            .collect();
        let timeline = &mut self.checkpoint_mut(parent).timeline;
        if let Some(at) = timeline
            .iter()
            .position(|e| matches!(e, Event::Branch(b) if *b == cp))
        {
            timeline.splice(at..=at, replacement);
        }
        debug!(checkpoint = %cp, "branch discarded");
        self.active = parent;
        Ok(())
    }

    /// Make `alloc` share the slot of `of` (its union-find root).
    pub fn make_alias(&mut self, alloc: &StackAllocation, of: &StackAllocation) -> StackResult<()> {
        self.ensure_open()?;
        if self.state(alloc.id).alias.is_some() {
            return Err(StackError::AlreadyAliased(alloc.id));
        }
        let root = self.find(of.id);
        if root == alloc.id {
            return Err(StackError::AliasCycle(alloc.id));
        }
        let (size, root_size) = (self.state(alloc.id).size, self.state(root).size);
        if size != root_size {
            return Err(StackError::AliasSizeMismatch {
                alloc: alloc.id,
                size,
                of: root,
                of_size: root_size,
            });
        }
        let align = self.state(alloc.id).align;
        let root_state = self.state_mut(root);
        root_state.align = root_state.align.max(align);
        self.state_mut(alloc.id).alias = Some(root);
        trace!(alloc = %alloc.id, root = %root, "stack alias");
        Ok(())
    }

    pub fn is_aliased(&self, alloc: &StackAllocation) -> bool {
        self.state(alloc.id).alias.is_some()
    }

    /// Union-find root, compressing the path on the way.
    fn find(&mut self, id: AllocId) -> AllocId {
        let mut root = id;
        while let Some(next) = self.state(root).alias {
            root = next;
        }
        let mut cursor = id;
        while let Some(next) = self.state(cursor).alias {
            if next != root {
                self.state_mut(cursor).alias = Some(root);
            }
            cursor = next;
        }
        root
    }

    // ── Resolution ───────────────────────────────────────────────────────

    /// Lay out the whole frame. Runs at most once; later calls are no-ops.
    pub fn resolve(&mut self) -> StackResult<()> {
        if self.resolved {
            return Ok(());
        }
        self.resolved = true;

        let mut layout = FrameLayout::default();
        self.walk(self.root(), &mut layout)?;

        for i in 0..self.allocs.len() {
            let id = AllocId(i as u32);
            if self.state(id).alias.is_none() {
                continue;
            }
            let root = self.find(id);
            if let Some(offset) = self.state(root).offset.try_get() {
                self.state(id)
                    .offset
                    .resolve(offset)
                    .map_err(|_| StackError::OffsetConflict(id))?;
            }
        }

        let size = align_up(layout.top, self.frame_alignment)?;
        self.size
            .resolve(size)
            .map_err(|_| StackError::AlreadyResolved)?;
        debug!(
            frame_size = size,
            allocations = self.allocs.len(),
            checkpoints = self.checkpoints.len(),
            "stack frame resolved"
        );
        Ok(())
    }

    fn walk(&self, cp: CheckpointId, layout: &mut FrameLayout) -> StackResult<()> {
        for event in &self.checkpoint_state(cp).timeline {
            match *event {
                Event::Allocate(id) => {
                    let state = self.state(id);
                    if state.size == 0 || state.alias.is_some() || state.offset.is_resolved() {
                        continue;
                    }
                    let offset = layout.place(state.size, state.align)?;
                    state
                        .offset
                        .resolve(offset)
                        .map_err(|_| StackError::OffsetConflict(id))?;
                }
                Event::Free(id) => {
                    let state = self.state(id);
                    if state.alias.is_some() || state.size == 0 {
                        continue;
                    }
                    if let Some(offset) = state.offset.try_get() {
                        layout.release(offset, state.size);
                    }
                }
                Event::Branch(child) => self.walk(child, layout)?,
            }
        }
        Ok(())
    }

    /// Final frame size in bytes, resolving the frame if needed.
    pub fn size(&mut self) -> StackResult<u32> {
        self.resolve()?;
        self.size.get().map_err(|_| StackError::FrameTooLarge)
    }

    /// The frame size as a deferred cell, for code emitted before resolution.
    pub fn latent_size(&self) -> Latent<u32> {
        self.size.clone()
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn ensure_open(&self) -> StackResult<()> {
        if self.resolved {
            Err(StackError::AlreadyResolved)
        } else {
            Ok(())
        }
    }

    fn ensure_active(&self, cp: CheckpointId) -> StackResult<()> {
        if self.active == cp {
            Ok(())
        } else {
            Err(StackError::NotActive(cp))
        }
    }

    fn parent(&self, cp: CheckpointId) -> StackResult<CheckpointId> {
        self.checkpoint_state(cp).previous.ok_or(StackError::RootCheckpoint)
    }

    fn state(&self, id: AllocId) -> &AllocState {
        &self.allocs[id.0 as usize]
    }

    fn state_mut(&mut self, id: AllocId) -> &mut AllocState {
        &mut self.allocs[id.0 as usize]
    }

    fn checkpoint_state(&self, id: CheckpointId) -> &CheckpointState {
        &self.checkpoints[id.0 as usize]
    }

    fn checkpoint_mut(&mut self, id: CheckpointId) -> &mut CheckpointState {
        &mut self.checkpoints[id.0 as usize]
    }
}

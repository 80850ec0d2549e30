// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-producer single-consumer work queue embedded in the shared region.
// Write and read indices are packed into one 64-bit word (writer low 32,
// reader high 32); a slot becomes visible to the consumer only when the
// producer's commit advances the writer index.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::filter::FilterParameters;
use crate::lock::LockId;

pub const WORK_QUEUE_CAPACITY: usize = 64;
const INDEX_MASK: u64 = (WORK_QUEUE_CAPACITY - 1) as u64;

/// Set in the queue word by a push that found no free slot; cleared by the
/// next successful push. Pop does not clear it.
pub const QUEUE_FULL_BIT: u64 = 0x8000_0000;

const _: () = assert!(WORK_QUEUE_CAPACITY.is_power_of_two());
const _: () = assert!((WORK_QUEUE_CAPACITY as u64) < QUEUE_FULL_BIT);

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Compute = 0,
    ComputeIndirect = 1,
    CreateFilter = 2,
    ReloadShader = 3,
    ExportBuffer = 4,
    UploadBuffer = 5,
}

impl WorkKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Compute,
            1 => Self::ComputeIndirect,
            2 => Self::CreateFilter,
            3 => Self::ReloadShader,
            4 => Self::ExportBuffer,
            5 => Self::UploadBuffer,
            _ => return None,
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    BeamformedData = 0,
    Stats = 1,
}

impl ExportKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::BeamformedData,
            1 => Self::Stats,
            _ => return None,
        })
    }
}

/// `frame` is a server-local frame handle, never a pointer: pointers do not
/// survive the address-space boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ComputeContext {
    pub frame: u32,
    pub parameter_block: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ComputeIndirectContext {
    pub view_plane: u32,
    pub parameter_block: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CreateFilterContext {
    pub kind: u32,
    pub parameters: FilterParameters,
    pub filter_slot: u8,
    pub parameter_block: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExportContext {
    pub kind: u32,
    pub size: u32,
}

/// Scratch-relative byte range of an RF upload; region-relative offsets
/// cross address spaces where raw pointers cannot.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UploadContext {
    pub scratch_offset: u64,
    pub size: u32,
}

/// All variants padded to one fixed stride so the ring-index arithmetic can
/// treat slots as uniform records.
#[repr(C)]
#[derive(Clone, Copy)]
pub union WorkPayload {
    pub compute: ComputeContext,
    pub compute_indirect: ComputeIndirectContext,
    pub create_filter: CreateFilterContext,
    pub export: ExportContext,
    pub upload: UploadContext,
    /// Index into the server-side shader-reload table.
    pub reload_shader: u32,
    pub raw: [u8; 32],
}

/// One tagged record in the in-region ring queue.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WorkItem {
    pub kind: u32,
    lock: u32, // 0 = none, k + 1 = lock index k
    pub payload: WorkPayload,
}

impl WorkItem {
    pub fn zeroed() -> Self {
        // Safety: all payload variants are plain-old-data; all-zero decodes
        // as Compute with no sync lock.
        unsafe { std::mem::zeroed() }
    }

    pub fn work_kind(&self) -> Option<WorkKind> {
        WorkKind::from_u32(self.kind)
    }

    /// Name the lock the server must release after completing this item.
    pub fn set_sync_lock(&mut self, lock: LockId) {
        self.lock = lock.index() as u32 + 1;
    }

    pub fn sync_lock(&self) -> Option<LockId> {
        match self.lock {
            0 => None,
            n => LockId::from_index(n as usize - 1),
        }
    }
}

const _: () = assert!(std::mem::size_of::<WorkPayload>() == 32);
const _: () = assert!(std::mem::size_of::<WorkItem>() == 40);

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Bounded SPSC ring of work items. At most one producer is active at any
/// instant; clients serialize producer access through the lock table.
#[repr(C)]
pub struct WorkQueue {
    queue: AtomicU64,
    _reserved: [u8; 8],
    work_items: [UnsafeCell<WorkItem>; WORK_QUEUE_CAPACITY],
}

// Safety: cross-process SPSC protocol; slot ownership is handed over by the
// queue-word increments.
unsafe impl Sync for WorkQueue {}

const _: () = assert!(
    std::mem::size_of::<WorkQueue>() == 16 + WORK_QUEUE_CAPACITY * std::mem::size_of::<WorkItem>()
);

impl WorkQueue {
    /// Claim the next slot for writing, or `None` (setting the full
    /// sentinel) when no slot is free. The slot is zeroed; nothing is
    /// published until [`push_commit`](Self::push_commit).
    pub fn push(&self) -> Option<*mut WorkItem> {
        let val = self.queue.load(Ordering::Acquire);
        let widx = val & INDEX_MASK;
        let ridx = (val >> 32) & INDEX_MASK;
        let next = (widx + 1) & INDEX_MASK;

        if next == ridx {
            self.queue.fetch_or(QUEUE_FULL_BIT, Ordering::AcqRel);
            return None;
        }
        if val & QUEUE_FULL_BIT != 0 {
            self.queue.fetch_and(!QUEUE_FULL_BIT, Ordering::AcqRel);
        }

        let slot = self.work_items[widx as usize].get();
        unsafe { ptr::write(slot, WorkItem::zeroed()) };
        Some(slot)
    }

    /// Publish the slot returned by the last [`push`](Self::push). The
    /// release increment is the point after which the consumer may read it.
    pub fn push_commit(&self) {
        self.queue.fetch_add(1, Ordering::Release);
    }

    /// Peek the oldest committed slot, or `None` when the queue is empty.
    /// The slot stays owned by the consumer until
    /// [`pop_commit`](Self::pop_commit).
    pub fn pop(&self) -> Option<*mut WorkItem> {
        let val = self.queue.load(Ordering::Acquire);
        let widx = val & INDEX_MASK;
        let ridx = (val >> 32) & INDEX_MASK;

        if ridx == widx {
            return None;
        }
        Some(self.work_items[ridx as usize].get())
    }

    /// Return the slot consumed by the last [`pop`](Self::pop) to the
    /// producer.
    pub fn pop_commit(&self) {
        self.queue.fetch_add(1 << 32, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        let val = self.queue.load(Ordering::Acquire);
        (val & INDEX_MASK) == ((val >> 32) & INDEX_MASK)
    }

    /// Whether the most recent push attempt found the queue full.
    pub fn full_sentinel_set(&self) -> bool {
        self.queue.load(Ordering::Relaxed) & QUEUE_FULL_BIT != 0
    }
}

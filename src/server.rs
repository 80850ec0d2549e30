// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server side of the control plane: mints the region, drains the work
// queue, and hands typed work to the compute pipeline behind the
// ComputeBackend trait. Internal errors are logged, never reported back
// through the queue; clients rely on timeouts for liveness.

use log::{debug, warn};

use crate::error::Result;
use crate::filter::{self, FilterKind};
use crate::layout::{ParameterBlock, ParameterBlockRegion, ViewPlaneTag, FILTER_SLOTS};
use crate::lock::INFINITE_TIMEOUT;
use crate::pipe::ExportPipe;
use crate::queue::{ExportKind, WorkItem, WorkKind};
use crate::region::SharedMemoryRegion;

/// The boundary to the GPU compute pipeline. The control plane hands it
/// typed work items and scratch slices; everything behind it is out of
/// scope here.
pub trait ComputeBackend {
    /// A dirty subregion of `block` changed; sync it to its backing
    /// resource. Called with the block lock held.
    fn parameter_block_updated(
        &mut self,
        block: u32,
        region: ParameterBlockRegion,
        data: &ParameterBlock,
    );

    /// Raw RF bytes arrived in the scratch arena.
    fn upload_rf(&mut self, rf: &[u8]);

    fn compute(&mut self, frame: u32, block: u32);

    fn compute_indirect(&mut self, view_plane: ViewPlaneTag, block: u32);

    /// Upload a regenerated impulse response; returns the pipeline-side
    /// handle stored in the filter slot table.
    fn create_filter(&mut self, slot: u8, block: u8, response: &[f32], complex: bool) -> u32;

    fn reload_shader(&mut self, context: u32);

    /// Produce exactly `size` bytes for `kind`. Returning false drops the
    /// export.
    fn export(&mut self, kind: ExportKind, size: u32, out: &mut Vec<u8>) -> bool;
}

/// One entry of the server-owned filter slot table.
#[derive(Debug, Clone, Copy)]
pub struct FilterSlot {
    pub handle: u32,
    pub kind: FilterKind,
    pub complex: bool,
    pub parameter_block: u8,
}

pub struct Server {
    region: SharedMemoryRegion,
    filters: [Option<FilterSlot>; FILTER_SLOTS],
}

impl Server {
    /// Mint the region. Exactly one server owns a region at a time.
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self {
            region: SharedMemoryRegion::create(name)?,
            filters: [None; FILTER_SLOTS],
        })
    }

    pub fn region(&self) -> &SharedMemoryRegion {
        &self.region
    }

    pub fn filter_slot(&self, slot: u8) -> Option<&FilterSlot> {
        self.filters.get(slot as usize).and_then(|s| s.as_ref())
    }

    /// Drain the work queue, dispatching each item to `backend`.
    /// Returns the number of items processed.
    pub fn process_pending(&mut self, backend: &mut dyn ComputeBackend) -> usize {
        let mut processed = 0;
        while let Some(slot) = self.region.work_queue().pop() {
            // Copy the item out and return the slot to the producer before
            // potentially slow dispatch work.
            let item = unsafe { *slot };
            self.region.work_queue().pop_commit();
            self.process_item(&item, backend);
            processed += 1;
        }
        processed
    }

    fn process_item(&mut self, item: &WorkItem, backend: &mut dyn ComputeBackend) {
        match item.work_kind() {
            Some(WorkKind::Compute) => {
                let ctx = unsafe { item.payload.compute };
                self.sync_parameter_block(ctx.parameter_block, backend);
                backend.compute(ctx.frame, ctx.parameter_block);
            }
            Some(WorkKind::ComputeIndirect) => {
                let ctx = unsafe { item.payload.compute_indirect };
                match ViewPlaneTag::from_u32(ctx.view_plane) {
                    Some(plane) => {
                        self.sync_parameter_block(ctx.parameter_block, backend);
                        backend.compute_indirect(plane, ctx.parameter_block);
                    }
                    None => warn!("dropping compute with unknown view plane {}", ctx.view_plane),
                }
            }
            Some(WorkKind::CreateFilter) => {
                let ctx = unsafe { item.payload.create_filter };
                match FilterKind::from_u32(ctx.kind) {
                    Some(kind) if (ctx.filter_slot as usize) < FILTER_SLOTS => {
                        let response = filter::impulse_response(kind, &ctx.parameters);
                        let complex = ctx.parameters.is_complex();
                        let handle = backend.create_filter(
                            ctx.filter_slot,
                            ctx.parameter_block,
                            &response,
                            complex,
                        );
                        self.filters[ctx.filter_slot as usize] = Some(FilterSlot {
                            handle,
                            kind,
                            complex,
                            parameter_block: ctx.parameter_block,
                        });
                    }
                    Some(_) => warn!("dropping filter for out-of-range slot {}", ctx.filter_slot),
                    None => warn!("dropping filter with unknown kind {}", ctx.kind),
                }
            }
            Some(WorkKind::ReloadShader) => {
                backend.reload_shader(unsafe { item.payload.reload_shader });
            }
            Some(WorkKind::ExportBuffer) => {
                let ctx = unsafe { item.payload.export };
                self.process_export(ctx.kind, ctx.size, backend);
            }
            Some(WorkKind::UploadBuffer) => {
                let ctx = unsafe { item.payload.upload };
                let capacity = self.region.scratch_capacity() as u64;
                if ctx.scratch_offset + ctx.size as u64 > capacity {
                    warn!(
                        "dropping upload outside scratch arena: offset {} size {}",
                        ctx.scratch_offset, ctx.size
                    );
                } else {
                    let rf = unsafe {
                        std::slice::from_raw_parts(
                            self.region.scratch_ptr().add(ctx.scratch_offset as usize),
                            ctx.size as usize,
                        )
                    };
                    backend.upload_rf(rf);
                }
            }
            None => warn!("dropping work item with unknown kind {}", item.kind),
        }

        // Completing the item releases the lock the producer named, waking
        // any client using it as a completion barrier.
        if let Some(lock) = item.sync_lock() {
            self.region.unlock_sync_barrier(lock);
        }
    }

    /// Take the block lock, sync every dirty subregion to the backend, and
    /// clear exactly the bits handled. A bit set between the read and the
    /// clear survives for the next compute item.
    fn sync_parameter_block(&self, block: u32, backend: &mut dyn ComputeBackend) {
        let Some(pb) = self.region.lock_parameter_block(block, INFINITE_TIMEOUT) else {
            return;
        };
        let dirty = self.region.dirty_regions(block);
        if dirty != 0 {
            // Safety: the block lock serializes every writer of the
            // non-atomic fields.
            let data = unsafe { &*pb };
            for region in ParameterBlockRegion::ALL {
                if dirty & region.bit() != 0 {
                    backend.parameter_block_updated(block, region, data);
                }
            }
            self.region.clear_dirty_regions(block, dirty);
        }
        self.region.unlock_parameter_block(block);
    }

    fn process_export(&self, kind: u32, size: u32, backend: &mut dyn ComputeBackend) {
        let Some(kind) = ExportKind::from_u32(kind) else {
            warn!("dropping export with unknown kind {kind}");
            return;
        };
        let mut payload = Vec::new();
        if !backend.export(kind, size, &mut payload) {
            warn!("backend refused {kind:?} export of {size} bytes");
            return;
        }

        let pipe_name = self.region.export_pipe_name();
        if pipe_name.is_empty() {
            warn!("dropping {kind:?} export: no pipe name in region");
            return;
        }
        // A client that timed out may have closed its end already; the
        // payload is simply dropped then.
        match ExportPipe::writer(&pipe_name) {
            Ok(pipe) => {
                if let Err(err) = pipe.write_all(&payload) {
                    debug!("dropping {kind:?} export payload: {err}");
                }
            }
            Err(err) => debug!("export pipe {pipe_name} unavailable: {err}"),
        }
    }

    /// Tear the region down: invalidate so every future client call fails,
    /// then unlink the name. Existing mappings stay readable until their
    /// owners unmap.
    pub fn close(self) {
        self.region.invalidate();
        self.region.unlink();
    }
}

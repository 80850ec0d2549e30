// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client veneer over the shared region: validates argument shapes against
// the compile-time limits, takes the narrowest sufficient lock, copies
// payloads, marks dirty bits, and posts work items. Stateless beyond the
// mapping and a global timeout.

use std::ptr;

use crate::error::{fail, Error, Result};
use crate::filter::{FilterKind, FilterParameters, FILTER_PARAMETER_COUNT};
use crate::layout::{
    DataKind, LiveImagingDirtyFlags, LiveImagingParameters, ParameterBlock, ParameterBlockRegion,
    Parameters, ShaderKind, ShaderParameters, ViewPlaneTag, DEFAULT_SHARED_MEMORY_NAME,
    EXPORT_PIPE_NAME, FILTER_SLOTS, MAX_CHANNEL_COUNT, MAX_COMPUTE_SHADER_STAGES,
    MAX_PARAMETER_BLOCK_SLOTS,
};
use crate::lock::LockId;
use crate::pipe::ExportPipe;
use crate::queue::{
    ComputeContext, ComputeIndirectContext, CreateFilterContext, ExportContext, ExportKind,
    UploadContext, WorkKind,
};
use crate::region::SharedMemoryRegion;

/// Lock-acquisition timeout a fresh client starts with.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

pub struct Client {
    region: SharedMemoryRegion,
    timeout_ms: u32,
}

/// Unlocks on drop unless ownership was handed to the server.
struct LockGuard<'a> {
    region: &'a SharedMemoryRegion,
    id: Option<LockId>,
}

impl LockGuard<'_> {
    /// Leave the lock held; the server releases it after completing the
    /// work item that names it.
    fn release_by_server(mut self) {
        self.id = None;
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.region.unlock(id);
        }
    }
}

impl Client {
    /// Attach to the region named `name`. Fails without side effects on a
    /// version mismatch or an invalidated region.
    pub fn attach(name: &str) -> Result<Self> {
        match SharedMemoryRegion::attach(name) {
            Ok(region) => Ok(Self {
                region,
                timeout_ms: DEFAULT_TIMEOUT_MS,
            }),
            Err(err) => fail(err),
        }
    }

    /// Convenience for single-region processes: attach under the default
    /// platform name.
    pub fn attach_default() -> Result<Self> {
        Self::attach(DEFAULT_SHARED_MEMORY_NAME)
    }

    pub fn region(&self) -> &SharedMemoryRegion {
        &self.region
    }

    /// Lock-acquisition timeout used by every subsequent call.
    pub fn set_global_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.region.invalid() {
            return fail(Error::Invalidated);
        }
        Ok(())
    }

    fn acquire(&self, id: LockId) -> Result<LockGuard<'_>> {
        self.acquire_for(id, self.timeout_ms)
    }

    fn acquire_for(&self, id: LockId, timeout_ms: u32) -> Result<LockGuard<'_>> {
        if !self.region.lock(id, timeout_ms) {
            return fail(Error::LockTimeout(id));
        }
        Ok(LockGuard {
            region: &self.region,
            id: Some(id),
        })
    }

    fn validate_block(&self, block: u32) -> Result<()> {
        if block >= self.region.reserved_parameter_blocks() {
            return fail(Error::InvalidArgument(format!(
                "parameter block {block} is not reserved"
            )));
        }
        Ok(())
    }

    fn validate_count(&self, count: usize, limit: usize) -> Result<()> {
        if count > limit {
            return fail(Error::PayloadTooLarge {
                size: count,
                limit,
            });
        }
        Ok(())
    }

    /// Run `f` with the block lock held. Dirty bits set inside `f` are
    /// observed by the server no later than its next compute on the block.
    fn with_block<R>(
        &self,
        block: u32,
        f: impl FnOnce(*mut ParameterBlock) -> R,
    ) -> Result<R> {
        self.validate_block(block)?;
        let Some(pb) = self.region.lock_parameter_block(block, self.timeout_ms) else {
            return fail(Error::LockTimeout(LockId::ParameterBlock(block)));
        };
        let result = f(pb);
        self.region.unlock_parameter_block(block);
        Ok(result)
    }

    // -- region shape -------------------------------------------------------

    /// Grow the number of reserved parameter blocks. Shrinking requires the
    /// server to invalidate and re-mint the region.
    pub fn reserve_parameter_blocks(&self, count: u32) -> Result<()> {
        self.ensure_valid()?;
        if count as usize > MAX_PARAMETER_BLOCK_SLOTS || count == 0 {
            return fail(Error::InvalidArgument(format!(
                "cannot reserve {count} parameter blocks (limit {MAX_PARAMETER_BLOCK_SLOTS})"
            )));
        }
        // Reserving moves the scratch arena start, so it owns ScratchSpace.
        let _guard = self.acquire(LockId::ScratchSpace)?;
        let current = self.region.reserved_parameter_blocks();
        if count < current {
            return fail(Error::InvalidArgument(format!(
                "reserved parameter blocks can only grow ({current} already reserved)"
            )));
        }
        self.region.set_reserved_parameter_blocks(count);
        Ok(())
    }

    // -- parameter block writes ---------------------------------------------

    pub fn push_channel_mapping_at(&self, mapping: &[i16], block: u32) -> Result<()> {
        self.ensure_valid()?;
        self.validate_count(mapping.len(), MAX_CHANNEL_COUNT)?;
        self.with_block(block, |pb| unsafe {
            let dst = ptr::addr_of_mut!((*pb).channel_mapping.0) as *mut i16;
            ptr::copy_nonoverlapping(mapping.as_ptr(), dst, mapping.len());
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::ChannelMapping);
        })
    }

    pub fn push_sparse_elements_at(&self, elements: &[i16], block: u32) -> Result<()> {
        self.ensure_valid()?;
        self.validate_count(elements.len(), MAX_CHANNEL_COUNT)?;
        self.with_block(block, |pb| unsafe {
            let dst = ptr::addr_of_mut!((*pb).sparse_elements.0) as *mut i16;
            ptr::copy_nonoverlapping(elements.as_ptr(), dst, elements.len());
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::SparseElements);
        })
    }

    pub fn push_focal_vectors_at(&self, vectors: &[[f32; 2]], block: u32) -> Result<()> {
        self.ensure_valid()?;
        self.validate_count(vectors.len(), MAX_CHANNEL_COUNT)?;
        self.with_block(block, |pb| unsafe {
            let dst = ptr::addr_of_mut!((*pb).focal_vectors.0) as *mut [f32; 2];
            ptr::copy_nonoverlapping(vectors.as_ptr(), dst, vectors.len());
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::FocalVectors);
        })
    }

    /// Per-event packed tx/rx orientations; these live inside the scalar
    /// parameter region.
    pub fn push_transmit_receive_orientations_at(
        &self,
        orientations: &[u8],
        block: u32,
    ) -> Result<()> {
        self.ensure_valid()?;
        self.validate_count(orientations.len(), MAX_CHANNEL_COUNT)?;
        self.with_block(block, |pb| unsafe {
            let dst =
                ptr::addr_of_mut!((*pb).parameters.transmit_receive_orientations) as *mut u8;
            ptr::copy_nonoverlapping(orientations.as_ptr(), dst, orientations.len());
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::Parameters);
        })
    }

    pub fn push_parameters_at(&self, parameters: &Parameters, block: u32) -> Result<()> {
        self.ensure_valid()?;
        self.with_block(block, |pb| unsafe {
            ptr::addr_of_mut!((*pb).parameters).write(*parameters);
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::Parameters);
        })
    }

    pub fn push_pipeline_at(
        &self,
        stages: &[ShaderKind],
        data_kind: DataKind,
        block: u32,
    ) -> Result<()> {
        self.ensure_valid()?;
        self.validate_count(stages.len(), MAX_COMPUTE_SHADER_STAGES)?;
        self.with_block(block, |pb| unsafe {
            let pipeline = ptr::addr_of_mut!((*pb).pipeline);
            ptr::write_bytes(pipeline, 0, 1);
            let shaders = ptr::addr_of_mut!((*pipeline).shaders) as *mut u32;
            for (i, stage) in stages.iter().enumerate() {
                shaders.add(i).write(*stage as u32);
            }
            ptr::addr_of_mut!((*pipeline).shader_count).write(stages.len() as u32);
            ptr::addr_of_mut!((*pipeline).data_kind).write(data_kind as u32);
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::ComputePipeline);
        })
    }

    pub fn set_pipeline_stage_parameters_at(
        &self,
        stage: usize,
        parameters: ShaderParameters,
        block: u32,
    ) -> Result<()> {
        self.ensure_valid()?;
        if stage >= MAX_COMPUTE_SHADER_STAGES {
            return fail(Error::InvalidArgument(format!(
                "pipeline stage {stage} out of range"
            )));
        }
        self.with_block(block, |pb| unsafe {
            let slot = ptr::addr_of_mut!((*pb).pipeline.parameters) as *mut ShaderParameters;
            slot.add(stage).write(parameters);
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::ComputePipeline);
        })
    }

    // -- filters ------------------------------------------------------------

    /// Request a filter in `slot` regenerated from `parameters` (the wire
    /// block of [`FILTER_PARAMETER_COUNT`] f32 values for `kind`).
    pub fn create_filter_at(
        &self,
        kind: FilterKind,
        parameters: &[f32],
        sampling_frequency: f32,
        slot: u8,
        complex: bool,
        block: u32,
    ) -> Result<()> {
        self.ensure_valid()?;
        if slot as usize >= FILTER_SLOTS {
            return fail(Error::InvalidArgument(format!(
                "filter slot {slot} out of range"
            )));
        }
        self.validate_block(block)?;
        let Some(wire) = FilterParameters::from_raw(parameters, sampling_frequency, complex)
        else {
            return fail(Error::InvalidArgument(format!(
                "filter parameters must hold {FILTER_PARAMETER_COUNT} values"
            )));
        };

        let _dispatch = self.acquire(LockId::DispatchCompute)?;
        let queue = self.region.work_queue();
        let Some(item) = queue.push() else {
            return fail(Error::QueueFull);
        };
        unsafe {
            (*item).kind = WorkKind::CreateFilter as u32;
            (*item).payload.create_filter = CreateFilterContext {
                kind: kind as u32,
                parameters: wire,
                filter_slot: slot,
                parameter_block: block as u8,
            };
        }
        queue.push_commit();
        Ok(())
    }

    // -- uploads and compute ------------------------------------------------

    /// The standard "upload and run" sequence: copy RF into scratch under
    /// UploadRF and post an UploadBuffer + ComputeIndirect pair. The server
    /// releases UploadRF once the compute stages have consumed the scratch.
    pub fn push_data_with_compute(
        &self,
        data: &[u8],
        view_plane: ViewPlaneTag,
        block: u32,
    ) -> Result<()> {
        self.ensure_valid()?;
        self.validate_block(block)?;

        let upload = self.upload_rf(data)?;
        let dispatch = self.acquire(LockId::DispatchCompute)?;

        let queue = self.region.work_queue();
        let Some(item) = queue.push() else {
            return fail(Error::QueueFull);
        };
        unsafe {
            (*item).kind = WorkKind::UploadBuffer as u32;
            (*item).payload.upload = UploadContext {
                scratch_offset: 0,
                size: data.len() as u32,
            };
        }
        queue.push_commit();

        let Some(item) = queue.push() else {
            return fail(Error::QueueFull);
        };
        unsafe {
            (*item).kind = WorkKind::ComputeIndirect as u32;
            (*item).payload.compute_indirect = ComputeIndirectContext {
                view_plane: view_plane as u32,
                parameter_block: block,
            };
            (*item).set_sync_lock(LockId::UploadRf);
        }
        queue.push_commit();

        drop(dispatch);
        upload.release_by_server();
        Ok(())
    }

    /// Copy RF bytes into the scratch prefix. Returns the held UploadRF
    /// guard.
    fn upload_rf(&self, data: &[u8]) -> Result<LockGuard<'_>> {
        let capacity = self.region.scratch_capacity().min(u32::MAX as usize);
        if data.len() > capacity {
            return fail(Error::PayloadTooLarge {
                size: data.len(),
                limit: capacity,
            });
        }
        let guard = self.acquire(LockId::UploadRf)?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.region.scratch_ptr(), data.len());
        }
        self.region.set_scratch_rf_size(data.len() as u32);
        Ok(guard)
    }

    /// Block until the server has released the most recent upload-and-run
    /// sequence.
    pub fn wait_for_compute_dispatch(&self, timeout_ms: u32) -> Result<()> {
        self.ensure_valid()?;
        let barrier = self.acquire_for(LockId::UploadRf, timeout_ms)?;
        drop(barrier);
        Ok(())
    }

    // -- live imaging -------------------------------------------------------

    pub fn set_live_imaging_parameters(
        &self,
        parameters: &LiveImagingParameters,
        dirty: LiveImagingDirtyFlags,
    ) -> Result<()> {
        self.ensure_valid()?;
        self.region.set_live_imaging_parameters(parameters);
        self.region.mark_live_imaging_dirty(dirty);
        Ok(())
    }

    // -- synchronous export -------------------------------------------------

    /// Submit RF data and block until the beamformed volume arrives on the
    /// export pipe. Returns `x·y·z` complex voxels as interleaved f32 pairs.
    pub fn beamform_data_synchronized(
        &self,
        data: &[u8],
        output_points: [u32; 3],
        timeout_ms: u32,
    ) -> Result<Vec<f32>> {
        self.ensure_valid()?;
        let block = 0u32;
        self.validate_block(block)?;

        let points = output_points.map(|p| p.max(1));
        let voxels = points.iter().map(|&p| p as usize).product::<usize>();
        let byte_size = voxels * 2 * std::mem::size_of::<f32>();
        if byte_size > u32::MAX as usize {
            return fail(Error::PayloadTooLarge {
                size: byte_size,
                limit: u32::MAX as usize,
            });
        }

        self.with_block(block, |pb| unsafe {
            ptr::addr_of_mut!((*pb).parameters.output_points)
                .write([points[0], points[1], points[2], 1]);
            self.region
                .mark_region_dirty(block, ParameterBlockRegion::Parameters);
        })?;

        // Upload and run, bound to the target block.
        let upload = self.upload_rf(data)?;
        {
            let dispatch = self.acquire(LockId::DispatchCompute)?;
            let queue = self.region.work_queue();
            let Some(item) = queue.push() else {
                return fail(Error::QueueFull);
            };
            unsafe {
                (*item).kind = WorkKind::UploadBuffer as u32;
                (*item).payload.upload = UploadContext {
                    scratch_offset: 0,
                    size: data.len() as u32,
                };
            }
            queue.push_commit();

            let Some(item) = queue.push() else {
                return fail(Error::QueueFull);
            };
            unsafe {
                (*item).kind = WorkKind::Compute as u32;
                (*item).payload.compute = ComputeContext {
                    frame: 0,
                    parameter_block: block,
                };
                (*item).set_sync_lock(LockId::UploadRf);
            }
            queue.push_commit();
            drop(dispatch);
        }
        upload.release_by_server();

        // Barrier: the server releases UploadRF after the compute consumed
        // the scratch.
        self.wait_for_compute_dispatch(timeout_ms)?;

        let bytes = self.synchronous_export(ExportKind::BeamformedData, byte_size, timeout_ms)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// The ExportKind::Stats flavour of the synchronous round trip.
    pub fn export_compute_stats(&self, size: usize, timeout_ms: u32) -> Result<Vec<u8>> {
        self.ensure_valid()?;
        self.synchronous_export(ExportKind::Stats, size, timeout_ms)
    }

    /// Open the export pipe, post an ExportBuffer item carrying ExportSync,
    /// and read exactly `byte_size` bytes. On timeout the pipe closes and
    /// the server's write fails harmlessly.
    fn synchronous_export(
        &self,
        kind: ExportKind,
        byte_size: usize,
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        let pipe = match ExportPipe::reader(EXPORT_PIPE_NAME) {
            Ok(pipe) => pipe,
            Err(err) => return fail(Error::PipeError(format!("open {EXPORT_PIPE_NAME}: {err}"))),
        };
        self.region.set_export_pipe_name(EXPORT_PIPE_NAME)?;

        let export = self.acquire(LockId::ExportSync)?;
        {
            let dispatch = self.acquire(LockId::DispatchCompute)?;
            let queue = self.region.work_queue();
            let Some(item) = queue.push() else {
                return fail(Error::QueueFull);
            };
            unsafe {
                (*item).kind = WorkKind::ExportBuffer as u32;
                (*item).payload.export = ExportContext {
                    kind: kind as u32,
                    size: byte_size as u32,
                };
                (*item).set_sync_lock(LockId::ExportSync);
            }
            queue.push_commit();
            drop(dispatch);
        }
        export.release_by_server();

        let mut bytes = vec![0u8; byte_size];
        if !pipe.read_exact_timeout(&mut bytes, timeout_ms) {
            return fail(Error::PipeError(format!(
                "timed out reading {byte_size} byte {kind:?} frame"
            )));
        }
        Ok(bytes)
    }
}

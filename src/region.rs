// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The mapped shared memory region. The server mints it exactly once;
// clients attach by name. Apart from the atomics in the header, everything
// in the region is reached through raw pointers: plain references must not
// alias memory another process is writing.

use std::ptr;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::layout::{
    self, LiveImagingDirtyFlags, LiveImagingParameters, ParameterBlock, ParameterBlockRegion,
    SharedMemoryHeader, EXPORT_PIPE_NAME_MAX, MAX_PARAMETER_BLOCK_SLOTS, SHARED_MEMORY_SIZE,
    SHARED_MEMORY_VERSION,
};
use crate::lock::{LockId, LockTable};
use crate::queue::WorkQueue;
use crate::shm::{ShmHandle, ShmOpenMode};

pub struct SharedMemoryRegion {
    shm: ShmHandle,
    locks: LockTable,
}

impl SharedMemoryRegion {
    /// Mint a fresh region. Fails if one already exists under `name`.
    /// The version field is published only after the rest of the header
    /// holds its defaults, so a concurrent attach never sees a half-built
    /// region as valid.
    pub fn create(name: &str) -> Result<Self> {
        let shm = ShmHandle::acquire(name, SHARED_MEMORY_SIZE, ShmOpenMode::Create)
            .map_err(Error::AttachFailed)?;
        let header = shm.as_mut_ptr() as *mut SharedMemoryHeader;
        unsafe {
            // The fresh mapping is zero-filled; only non-zero defaults need
            // explicit stores.
            ptr::addr_of_mut!((*header).reserved_parameter_blocks).write(AtomicU32::new(1));
            fence(Ordering::Release);
            ptr::addr_of_mut!((*header).version).write_volatile(SHARED_MEMORY_VERSION);
        }
        Ok(Self {
            locks: LockTable::new(shm.name()),
            shm,
        })
    }

    /// Attach to an existing region. Refuses, without writing a byte, when
    /// the region's version differs from the compiled one or the region has
    /// been invalidated.
    pub fn attach(name: &str) -> Result<Self> {
        let shm = ShmHandle::acquire(name, SHARED_MEMORY_SIZE, ShmOpenMode::Open)
            .map_err(Error::AttachFailed)?;
        let header = shm.as_mut_ptr() as *const SharedMemoryHeader;
        let version = unsafe { ptr::addr_of!((*header).version).read_volatile() };
        if version != SHARED_MEMORY_VERSION {
            return Err(Error::VersionMismatch {
                expected: SHARED_MEMORY_VERSION,
                found: version,
            });
        }
        fence(Ordering::Acquire);
        let region = Self {
            locks: LockTable::new(shm.name()),
            shm,
        };
        if region.invalid() {
            return Err(Error::Invalidated);
        }
        Ok(region)
    }

    fn base(&self) -> *mut u8 {
        self.shm.as_mut_ptr()
    }

    fn header(&self) -> &SharedMemoryHeader {
        // Safety: the mapping outlives `self` and the header's mutable
        // fields are only touched through atomics or raw pointers.
        unsafe { &*(self.base() as *const SharedMemoryHeader) }
    }

    fn header_ptr(&self) -> *mut SharedMemoryHeader {
        self.base() as *mut SharedMemoryHeader
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn version(&self) -> u32 {
        unsafe { ptr::addr_of!((*self.header_ptr()).version).read() }
    }

    // -- invalidation -------------------------------------------------------

    pub fn invalid(&self) -> bool {
        self.header().invalid.load(Ordering::Acquire) != 0
    }

    /// Hard cancellation: every future entry point fails, in-flight work
    /// completes or is dropped. The region may be unmapped afterwards but
    /// never reshaped.
    pub fn invalidate(&self) {
        self.header().invalid.store(1, Ordering::Release);
    }

    /// Remove the backing object so the name can be reused once all
    /// attached processes unmap.
    pub fn unlink(&self) {
        self.shm.unlink();
    }

    // -- work queue ---------------------------------------------------------

    pub fn work_queue(&self) -> &WorkQueue {
        &self.header().work_queue
    }

    // -- lock table ---------------------------------------------------------

    fn lock_words(&self) -> &[AtomicI32] {
        &self.header().locks
    }

    pub fn lock(&self, id: LockId, timeout_ms: u32) -> bool {
        self.locks.try_acquire(self.lock_words(), id, timeout_ms)
    }

    pub fn unlock(&self, id: LockId) {
        self.locks.release(self.lock_words(), id);
    }

    /// Release a completion-barrier lock on the server side.
    pub fn unlock_sync_barrier(&self, id: LockId) {
        self.locks.release_sync_barrier(self.lock_words(), id);
    }

    pub fn peek_lock(&self, id: LockId) -> i32 {
        self.locks.peek(self.lock_words(), id)
    }

    // -- parameter blocks ---------------------------------------------------

    pub fn reserved_parameter_blocks(&self) -> u32 {
        self.header().reserved_parameter_blocks.load(Ordering::Acquire)
    }

    pub(crate) fn set_reserved_parameter_blocks(&self, count: u32) {
        self.header()
            .reserved_parameter_blocks
            .store(count, Ordering::Release);
    }

    /// Raw pointer to block `block`. The caller holds the block lock for
    /// any access to the non-atomic fields.
    pub fn parameter_block(&self, block: u32) -> *mut ParameterBlock {
        assert!((block as usize) < MAX_PARAMETER_BLOCK_SLOTS);
        unsafe {
            self.base()
                .add(layout::parameter_block_offset(block as usize))
                .cast::<ParameterBlock>()
        }
    }

    fn dirty_word(&self, block: u32) -> &AtomicU32 {
        unsafe { &*ptr::addr_of!((*self.parameter_block(block)).dirty_regions) }
    }

    /// Take the per-block lock and hand back the block on success.
    pub fn lock_parameter_block(
        &self,
        block: u32,
        timeout_ms: u32,
    ) -> Option<*mut ParameterBlock> {
        assert!((block as usize) < MAX_PARAMETER_BLOCK_SLOTS);
        self.lock(LockId::ParameterBlock(block), timeout_ms)
            .then(|| self.parameter_block(block))
    }

    pub fn unlock_parameter_block(&self, block: u32) {
        self.unlock(LockId::ParameterBlock(block));
    }

    pub fn mark_region_dirty(&self, block: u32, region: ParameterBlockRegion) {
        self.dirty_word(block).fetch_or(region.bit(), Ordering::AcqRel);
    }

    /// Server side: clear exactly the handled bits. AND-NOT preserves bits
    /// set by a writer between the server's read and this clear.
    pub fn clear_dirty_regions(&self, block: u32, handled: u32) {
        self.dirty_word(block).fetch_and(!handled, Ordering::AcqRel);
    }

    pub fn dirty_regions(&self, block: u32) -> u32 {
        self.dirty_word(block).load(Ordering::Acquire)
    }

    pub fn parameter_block_dirty(&self, block: u32) -> bool {
        self.dirty_regions(block) != 0
    }

    // -- scratch arena ------------------------------------------------------

    /// Byte offset of the scratch arena from the region base. Always 4 KiB
    /// aligned; moves when blocks are reserved.
    pub fn scratch_offset(&self) -> usize {
        layout::scratch_offset(self.reserved_parameter_blocks() as usize)
    }

    /// Bytes of scratch between the last reserved block and the region end.
    pub fn scratch_capacity(&self) -> usize {
        SHARED_MEMORY_SIZE - self.scratch_offset()
    }

    /// Base of the scratch arena. Writes require the UploadRF (RF prefix)
    /// or ScratchSpace lock.
    pub fn scratch_ptr(&self) -> *mut u8 {
        unsafe { self.base().add(self.scratch_offset()) }
    }

    pub fn scratch_rf_size(&self) -> u32 {
        self.header().scratch_rf_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_scratch_rf_size(&self, size: u32) {
        self.header().scratch_rf_size.store(size, Ordering::Release);
    }

    // -- live imaging -------------------------------------------------------

    pub fn live_imaging_parameters(&self) -> LiveImagingParameters {
        unsafe { ptr::addr_of!((*self.header_ptr()).live_imaging_parameters).read() }
    }

    pub(crate) fn set_live_imaging_parameters(&self, parameters: &LiveImagingParameters) {
        unsafe {
            ptr::addr_of_mut!((*self.header_ptr()).live_imaging_parameters).write(*parameters);
        }
    }

    pub fn live_imaging_dirty_flags(&self) -> LiveImagingDirtyFlags {
        LiveImagingDirtyFlags::from_bits_retain(
            self.header().live_imaging_dirty_flags.load(Ordering::Acquire),
        )
    }

    pub fn mark_live_imaging_dirty(&self, flags: LiveImagingDirtyFlags) {
        self.header()
            .live_imaging_dirty_flags
            .fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_live_imaging_dirty(&self, flags: LiveImagingDirtyFlags) {
        self.header()
            .live_imaging_dirty_flags
            .fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    // -- export pipe name ---------------------------------------------------

    pub fn set_export_pipe_name(&self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() >= EXPORT_PIPE_NAME_MAX {
            return Err(Error::PayloadTooLarge {
                size: bytes.len(),
                limit: EXPORT_PIPE_NAME_MAX - 1,
            });
        }
        unsafe {
            let field = ptr::addr_of_mut!((*self.header_ptr()).export_pipe_name) as *mut u8;
            ptr::copy_nonoverlapping(bytes.as_ptr(), field, bytes.len());
            field.add(bytes.len()).write(0);
        }
        Ok(())
    }

    pub fn export_pipe_name(&self) -> String {
        let mut bytes = [0u8; EXPORT_PIPE_NAME_MAX];
        unsafe {
            let field = ptr::addr_of!((*self.header_ptr()).export_pipe_name) as *const u8;
            ptr::copy_nonoverlapping(field, bytes.as_mut_ptr(), EXPORT_PIPE_NAME_MAX);
        }
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }
}

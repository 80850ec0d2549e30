// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process control plane for the ultrasound beamforming compute
// server: a fixed-layout 2 GiB shared memory region holding a lock table,
// a SPSC work queue, dirty-tracked parameter blocks, and a scratch arena,
// plus the client veneer and the server work loop around them.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod error;
pub use error::{last_error_string, Error, Result};

pub mod layout;

pub mod filter;
pub use filter::{FilterKind, FilterParameters, KaiserParameters, MatchedChirpParameters};

mod lock;
pub use lock::{LockId, INFINITE_TIMEOUT};

mod queue;
pub use queue::{
    ComputeContext, ComputeIndirectContext, CreateFilterContext, ExportContext, ExportKind,
    UploadContext, WorkItem, WorkKind, WorkPayload, WorkQueue, QUEUE_FULL_BIT,
    WORK_QUEUE_CAPACITY,
};

mod pipe;
pub use pipe::ExportPipe;

mod region;
pub use region::SharedMemoryRegion;

mod client;
pub use client::{Client, DEFAULT_TIMEOUT_MS};

mod server;
pub use server::{ComputeBackend, FilterSlot, Server};

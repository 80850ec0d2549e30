// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed layout of the shared memory region. Every struct here is repr(C)
// and consumed from multiple address spaces without serialization, so the
// layout is part of the wire contract: bump SHARED_MEMORY_VERSION whenever
// anything in this file moves.

use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU32};

use crate::queue::WorkQueue;

/// Compiled-in schema version. A region whose header carries a different
/// value refuses all attaches.
pub const SHARED_MEMORY_VERSION: u32 = 14;

/// Total mapped size of the region: exactly 2 GiB.
pub const SHARED_MEMORY_SIZE: usize = 2 << 30;

pub const MAX_CHANNEL_COUNT: usize = 256;
pub const MAX_COMPUTE_SHADER_STAGES: usize = 16;
pub const MAX_PARAMETER_BLOCK_SLOTS: usize = 16;
pub const FILTER_SLOTS: usize = 8;

/// Named locks preceding the per-parameter-block locks in the lock table.
pub const NAMED_LOCK_COUNT: usize = 4;
pub const LOCK_COUNT: usize = NAMED_LOCK_COUNT + MAX_PARAMETER_BLOCK_SLOTS;

/// The scratch arena always starts on a 4 KiB boundary.
pub const SCRATCH_ALIGNMENT: usize = 4096;

pub const EXPORT_PIPE_NAME_MAX: usize = 256;

/// Default platform name for the region.
#[cfg(unix)]
pub const DEFAULT_SHARED_MEMORY_NAME: &str = "/beamformer_shared_memory";
#[cfg(windows)]
pub const DEFAULT_SHARED_MEMORY_NAME: &str = "Local\\beamformer_shared_memory";

/// Well-known path of the synchronous export pipe.
#[cfg(unix)]
pub const EXPORT_PIPE_NAME: &str = "/tmp/beamformer_output_pipe";
#[cfg(windows)]
pub const EXPORT_PIPE_NAME: &str = "\\\\.\\pipe\\beamformer_output_fifo";

// ---------------------------------------------------------------------------
// Closed enums referenced by parameter blocks and work items
// ---------------------------------------------------------------------------

/// Compute shader stages a pipeline may reference.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Decode = 0,
    DecodeFloat = 1,
    DecodeFloatComplex = 2,
    Demodulate = 3,
    Das = 4,
    Sum = 5,
    MinMax = 6,
    CudaDecode = 7,
    CudaHilbert = 8,
    Hadamard = 9,
}

impl ShaderKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Decode,
            1 => Self::DecodeFloat,
            2 => Self::DecodeFloatComplex,
            3 => Self::Demodulate,
            4 => Self::Das,
            5 => Self::Sum,
            6 => Self::MinMax,
            7 => Self::CudaDecode,
            8 => Self::CudaHilbert,
            9 => Self::Hadamard,
            _ => return None,
        })
    }
}

/// Element type of the raw data handed to the first pipeline stage.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Int16 = 0,
    Int16Complex = 1,
    Float32 = 2,
    Float32Complex = 3,
}

impl DataKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Int16,
            1 => Self::Int16Complex,
            2 => Self::Float32,
            3 => Self::Float32Complex,
            _ => return None,
        })
    }
}

/// Output view plane selected by indirect compute dispatches.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPlaneTag {
    Xz = 0,
    Yz = 1,
    Xy = 2,
}

impl ViewPlaneTag {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Xz,
            1 => Self::Yz,
            2 => Self::Xy,
            _ => return None,
        })
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionKind {
    Forces = 0,
    Uforces = 1,
    Hercules = 2,
    Uhercules = 3,
    Vls = 4,
    Tpw = 5,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMode {
    None = 0,
    Nearest = 1,
    Linear = 2,
    Cubic = 3,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    X2 = 0,
    X4 = 1,
}

/// Row/column orientation of an RCA transmit or receive event.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcaOrientation {
    Rows = 0,
    Columns = 1,
}

/// Pack a transmit/receive orientation pair the way the parameter struct
/// carries it: transmit in the high nibble, receive in the low nibble.
pub const fn pack_transmit_receive(tx: RcaOrientation, rx: RcaOrientation) -> u8 {
    ((tx as u8) << 4) | (rx as u8)
}

// ---------------------------------------------------------------------------
// Live imaging block
// ---------------------------------------------------------------------------

/// Interactive imaging controls shared with UI clients. The server treats
/// the dirty flags as opaque bits naming which of these fields moved.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LiveImagingParameters {
    pub active: u32,
    pub transmit_power: f32,
    pub tgc_control_points: [f32; 8],
    pub save_enabled: u32,
    pub stop_imaging: u32,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LiveImagingDirtyFlags: u32 {
        const ACTIVE             = 1 << 0;
        const TRANSMIT_POWER     = 1 << 1;
        const TGC_CONTROL_POINTS = 1 << 2;
        const SAVE_DATA          = 1 << 3;
        const STOP_IMAGING       = 1 << 4;
    }
}

// ---------------------------------------------------------------------------
// Parameter block
// ---------------------------------------------------------------------------

/// Scalar beamforming parameters. 16-byte aligned so GPU uploads can take
/// the struct wholesale.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct Parameters {
    /// Transducer transform, column-major 4x4.
    pub xdc_transform: [f32; 16],
    pub xdc_element_pitch: [f32; 2],
    pub raw_data_dimensions: [u32; 4],
    pub output_points: [u32; 4],
    pub output_min_coordinate: [f32; 4],
    pub output_max_coordinate: [f32; 4],
    pub sample_count: u32,
    pub channel_count: u32,
    pub acquisition_count: u32,
    pub acquisition_kind: u32,
    pub decode_mode: u32,
    pub interpolation_mode: u32,
    pub sampling_mode: u32,
    pub decimation_rate: u32,
    pub sampling_frequency: f32,
    pub demodulation_frequency: f32,
    pub speed_of_sound: f32,
    pub time_offset: f32,
    pub f_number: f32,
    pub beamform_plane: u32,
    pub single_focus: u32,
    pub single_orientation: u32,
    /// {steering angle, focal depth} used when `single_focus` is set.
    pub focal_vector: [f32; 2],
    /// Packed tx/rx orientation used when `single_orientation` is set.
    pub transmit_receive_orientation: u8,
    pub _pad: [u8; 7],
    /// Per-event packed tx/rx orientations, one per acquisition.
    pub transmit_receive_orientations: [u8; MAX_CHANNEL_COUNT],
}

impl Parameters {
    pub fn zeroed() -> Self {
        // Safety: Parameters is plain-old-data; all-zero is a valid value.
        unsafe { mem::zeroed() }
    }

    /// Output voxel count with zero axes clamped to one, the shape the
    /// synchronous export path uses.
    pub fn output_voxels(&self) -> usize {
        self.output_points[..3]
            .iter()
            .map(|&p| p.max(1) as usize)
            .product()
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Per-stage parameters; today only the filter slot a Demodulate or
/// convolution stage reads from.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderParameters {
    pub filter_slot: u8,
}

/// Ordered list of shader stages with per-stage parameters and the program
/// indices the server resolves at dispatch time.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ComputePipeline {
    pub shaders: [u32; MAX_COMPUTE_SHADER_STAGES],
    pub parameters: [ShaderParameters; MAX_COMPUTE_SHADER_STAGES],
    pub program_indices: [u32; MAX_COMPUTE_SHADER_STAGES],
    pub shader_count: u32,
    pub data_kind: u32,
}

/// 16-byte aligned i16 table (channel mapping, sparse elements).
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct ChannelArray(pub [i16; MAX_CHANNEL_COUNT]);

/// Interleaved {steering angle, focal depth} pairs, 16-byte aligned.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct FocalVectorArray(pub [[f32; 2]; MAX_CHANNEL_COUNT]);

/// Subregions of a parameter block tracked by the dirty bitmap.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterBlockRegion {
    ComputePipeline = 0,
    ChannelMapping = 1,
    FocalVectors = 2,
    Parameters = 3,
    SparseElements = 4,
}

impl ParameterBlockRegion {
    pub const COUNT: usize = 5;

    pub const ALL: [Self; Self::COUNT] = [
        Self::ComputePipeline,
        Self::ChannelMapping,
        Self::FocalVectors,
        Self::Parameters,
        Self::SparseElements,
    ];

    pub const fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::ComputePipeline,
            1 => Self::ChannelMapping,
            2 => Self::FocalVectors,
            3 => Self::Parameters,
            4 => Self::SparseElements,
            _ => return None,
        })
    }
}

/// One reserved slot of beamforming state plus its dirty-region bitmap.
#[repr(C, align(16))]
pub struct ParameterBlock {
    pub parameters: Parameters,
    /// One bit per `ParameterBlockRegion`, set by clients after a write and
    /// cleared by the server once the region reached its backing resource.
    pub dirty_regions: AtomicU32,
    pub pipeline: ComputePipeline,
    pub channel_mapping: ChannelArray,
    pub sparse_elements: ChannelArray,
    pub focal_vectors: FocalVectorArray,
}

/// Byte offset of each dirty-tracked subregion inside a `ParameterBlock`,
/// indexed by `ParameterBlockRegion`, for bulk copy-in.
pub const PARAMETER_BLOCK_REGION_OFFSETS: [usize; ParameterBlockRegion::COUNT] = [
    mem::offset_of!(ParameterBlock, pipeline),
    mem::offset_of!(ParameterBlock, channel_mapping),
    mem::offset_of!(ParameterBlock, focal_vectors),
    mem::offset_of!(ParameterBlock, parameters),
    mem::offset_of!(ParameterBlock, sparse_elements),
];

/// Byte size of each dirty-tracked subregion, same indexing.
pub const PARAMETER_BLOCK_REGION_SIZES: [usize; ParameterBlockRegion::COUNT] = [
    mem::size_of::<ComputePipeline>(),
    mem::size_of::<ChannelArray>(),
    mem::size_of::<FocalVectorArray>(),
    mem::size_of::<Parameters>(),
    mem::size_of::<ChannelArray>(),
];

// ---------------------------------------------------------------------------
// Region header
// ---------------------------------------------------------------------------

/// The versioned header at offset zero of the region. Parameter blocks
/// follow immediately, then the scratch arena out to the 2 GiB mark.
#[repr(C, align(16))]
pub struct SharedMemoryHeader {
    /// Written last during creation; a mismatch refuses the attach.
    pub version: u32,
    /// Once nonzero, every entry point fails without side effects.
    pub invalid: AtomicU32,
    /// Named locks first, one lock per parameter-block slot after.
    pub locks: [AtomicI32; LOCK_COUNT],
    /// Number of parameter blocks currently reserved. Grows only; shrinking
    /// requires invalidating and re-minting the region.
    pub reserved_parameter_blocks: AtomicU32,
    /// Byte length of the most recent raw RF upload in the scratch arena.
    pub scratch_rf_size: AtomicU32,
    pub live_imaging_parameters: LiveImagingParameters,
    pub live_imaging_dirty_flags: AtomicU32,
    /// NUL-terminated platform path of the client's export pipe.
    pub export_pipe_name: [u8; EXPORT_PIPE_NAME_MAX],
    pub work_queue: WorkQueue,
}

/// Byte offset of parameter block `block` from the region base.
pub const fn parameter_block_offset(block: usize) -> usize {
    mem::size_of::<SharedMemoryHeader>() + block * mem::size_of::<ParameterBlock>()
}

/// Byte offset of the scratch arena for a given reservation count.
pub const fn scratch_offset(reserved_blocks: usize) -> usize {
    let end = parameter_block_offset(reserved_blocks);
    (end + SCRATCH_ALIGNMENT - 1) & !(SCRATCH_ALIGNMENT - 1)
}

/// Bytes of scratch available for a given reservation count.
pub const fn scratch_capacity(reserved_blocks: usize) -> usize {
    SHARED_MEMORY_SIZE - scratch_offset(reserved_blocks)
}

/// Upper bound on a single RF upload (one reserved block, the default).
pub const MAX_SCRATCH_SIZE: usize = scratch_capacity(1);

// ---------------------------------------------------------------------------
// Layout checks
// ---------------------------------------------------------------------------

const _: () = assert!(mem::size_of::<LiveImagingParameters>() == 48);
const _: () = assert!(mem::size_of::<Parameters>() == 480);
const _: () = assert!(mem::size_of::<ComputePipeline>() == 152);
const _: () = assert!(mem::size_of::<ChannelArray>() == 512);
const _: () = assert!(mem::size_of::<FocalVectorArray>() == 2048);
const _: () = assert!(mem::size_of::<ParameterBlock>() == 3712);
const _: () = assert!(mem::size_of::<ParameterBlock>() % mem::align_of::<ParameterBlock>() == 0);
const _: () = assert!(mem::size_of::<SharedMemoryHeader>() % 16 == 0);
const _: () = assert!(ParameterBlockRegion::COUNT <= 32);
const _: () = assert!(FILTER_SLOTS <= 255);
const _: () = assert!(MAX_PARAMETER_BLOCK_SLOTS <= 255);
const _: () =
    assert!(parameter_block_offset(MAX_PARAMETER_BLOCK_SLOTS) < SHARED_MEMORY_SIZE);

// Every dirty-tracked table keeps its 16-byte alignment inside the block.
const _: () = assert!(mem::offset_of!(ParameterBlock, parameters) % 16 == 0);
const _: () = assert!(mem::offset_of!(ParameterBlock, channel_mapping) % 16 == 0);
const _: () = assert!(mem::offset_of!(ParameterBlock, sparse_elements) % 16 == 0);
const _: () = assert!(mem::offset_of!(ParameterBlock, focal_vectors) % 16 == 0);

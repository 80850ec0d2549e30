// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Region lifecycle tests: creation, the version gate, invalidation
// monotonicity, and scratch arena geometry.

use std::sync::atomic::{AtomicUsize, Ordering};

use beamformer_ipc::layout::{
    SCRATCH_ALIGNMENT, SHARED_MEMORY_SIZE, SHARED_MEMORY_VERSION,
};
use beamformer_ipc::{
    last_error_string, Client, Error, SharedMemoryRegion, ShmHandle, ShmOpenMode,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/bfipc_{prefix}_{}_{n}", std::process::id())
}

#[test]
fn create_then_attach() {
    let name = unique_name("region_create");
    ShmHandle::unlink_by_name(&name);

    let region = SharedMemoryRegion::create(&name).expect("create");
    assert_eq!(region.version(), SHARED_MEMORY_VERSION);
    assert!(!region.invalid());
    assert_eq!(region.reserved_parameter_blocks(), 1);
    assert!(region.work_queue().is_empty());
    assert_eq!(region.scratch_rf_size(), 0);

    let attached = SharedMemoryRegion::attach(&name).expect("attach");
    assert_eq!(attached.version(), SHARED_MEMORY_VERSION);

    region.unlink();
}

#[test]
fn create_is_exclusive() {
    let name = unique_name("region_exclusive");
    ShmHandle::unlink_by_name(&name);

    let region = SharedMemoryRegion::create(&name).expect("create");
    match SharedMemoryRegion::create(&name) {
        Err(Error::AttachFailed(_)) => {}
        Err(other) => panic!("expected AttachFailed, got {other}"),
        Ok(_) => panic!("exclusive create succeeded twice"),
    }

    region.unlink();
}

#[test]
fn attach_missing_region_fails() {
    let name = unique_name("region_missing");
    ShmHandle::unlink_by_name(&name);

    match SharedMemoryRegion::attach(&name) {
        Err(Error::AttachFailed(_)) => {}
        Err(other) => panic!("expected AttachFailed, got {other}"),
        Ok(_) => panic!("attached a region that does not exist"),
    }
}

// A client compiled against a different version refuses to touch the
// region.
#[test]
fn version_gate_refuses_mismatched_region() {
    let name = unique_name("region_version");
    ShmHandle::unlink_by_name(&name);

    let region = SharedMemoryRegion::create(&name).expect("create");

    // Masquerade as a region minted by a newer build: the version word sits
    // at the start of the header.
    let raw = ShmHandle::acquire(&name, SHARED_MEMORY_SIZE, ShmOpenMode::Open).expect("raw map");
    unsafe { (raw.as_mut_ptr() as *mut u32).write_volatile(SHARED_MEMORY_VERSION + 1) };

    match Client::attach(&name) {
        Err(Error::VersionMismatch { expected, found }) => {
            assert_eq!(expected, SHARED_MEMORY_VERSION);
            assert_eq!(found, SHARED_MEMORY_VERSION + 1);
        }
        Err(other) => panic!("expected VersionMismatch, got {other}"),
        Ok(_) => panic!("attach succeeded against a mismatched version"),
    }
    assert!(last_error_string().contains("version mismatch"));

    // The refused attach wrote nothing.
    assert!(!region.invalid());
    assert_eq!(region.reserved_parameter_blocks(), 1);
    assert!(region.work_queue().is_empty());

    region.unlink();
}

// Once invalid, every public call fails and the region is never written
// again.
#[test]
fn invalidation_is_monotonic() {
    let name = unique_name("region_invalid");
    ShmHandle::unlink_by_name(&name);

    let region = SharedMemoryRegion::create(&name).expect("create");
    let client = Client::attach(&name).expect("attach before invalidation");

    region.invalidate();
    assert!(region.invalid());

    match Client::attach(&name) {
        Err(Error::Invalidated) => {}
        Err(other) => panic!("expected Invalidated, got {other}"),
        Ok(_) => panic!("attach succeeded against an invalidated region"),
    }

    // Calls on an already-attached client short-circuit too.
    match client.push_channel_mapping_at(&[1, 2, 3], 0) {
        Err(Error::Invalidated) => {}
        other => panic!("expected Invalidated, got {other:?}"),
    }
    match client.reserve_parameter_blocks(2) {
        Err(Error::Invalidated) => {}
        other => panic!("expected Invalidated, got {other:?}"),
    }
    assert!(last_error_string().contains("invalidated"));

    assert!(region.work_queue().is_empty());
    assert_eq!(region.reserved_parameter_blocks(), 1);
    assert_eq!(region.dirty_regions(0), 0);

    region.unlink();
}

#[test]
fn scratch_arena_geometry() {
    let name = unique_name("region_scratch");
    ShmHandle::unlink_by_name(&name);

    let region = SharedMemoryRegion::create(&name).expect("create");
    assert_eq!(region.scratch_offset() % SCRATCH_ALIGNMENT, 0);
    assert_eq!(
        region.scratch_capacity(),
        SHARED_MEMORY_SIZE - region.scratch_offset()
    );
    assert!(region.scratch_capacity() < SHARED_MEMORY_SIZE);

    region.unlink();
}

#[test]
fn export_pipe_name_round_trips() {
    let name = unique_name("region_pipe_name");
    ShmHandle::unlink_by_name(&name);

    let region = SharedMemoryRegion::create(&name).expect("create");
    assert_eq!(region.export_pipe_name(), "");

    region
        .set_export_pipe_name("/tmp/some_output_pipe")
        .expect("set name");
    assert_eq!(region.export_pipe_name(), "/tmp/some_output_pipe");

    let long = "x".repeat(1024);
    match region.set_export_pipe_name(&long) {
        Err(Error::PayloadTooLarge { .. }) => {}
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }

    region.unlink();
}

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Work queue unit tests: FIFO order, capacity, the full sentinel, and
// publication of slots only at commit time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use beamformer_ipc::{
    ComputeContext, SharedMemoryRegion, ShmHandle, WorkKind, WORK_QUEUE_CAPACITY,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/bfipc_{prefix}_{}_{n}", std::process::id())
}

fn fresh_region(prefix: &str) -> (SharedMemoryRegion, String) {
    let name = unique_name(prefix);
    ShmHandle::unlink_by_name(&name);
    let region = SharedMemoryRegion::create(&name).expect("create region");
    (region, name)
}

fn push_compute(region: &SharedMemoryRegion, frame: u32) -> bool {
    let queue = region.work_queue();
    match queue.push() {
        None => false,
        Some(item) => {
            unsafe {
                (*item).kind = WorkKind::Compute as u32;
                (*item).payload.compute = ComputeContext {
                    frame,
                    parameter_block: 0,
                };
            }
            queue.push_commit();
            true
        }
    }
}

fn pop_compute(region: &SharedMemoryRegion) -> Option<u32> {
    let queue = region.work_queue();
    let item = queue.pop()?;
    let frame = unsafe {
        assert_eq!((*item).work_kind(), Some(WorkKind::Compute));
        (*item).payload.compute.frame
    };
    queue.pop_commit();
    Some(frame)
}

#[test]
fn fifo_round_trip() {
    let (region, _name) = fresh_region("queue_fifo");

    assert!(region.work_queue().is_empty());
    for frame in 0..5 {
        assert!(push_compute(&region, frame));
    }
    for frame in 0..5 {
        assert_eq!(pop_compute(&region), Some(frame));
    }
    assert_eq!(pop_compute(&region), None);
    assert!(region.work_queue().is_empty());

    region.unlink();
}

#[test]
fn uncommitted_push_is_invisible() {
    let (region, _name) = fresh_region("queue_uncommitted");
    let queue = region.work_queue();

    let item = queue.push().expect("slot");
    unsafe { (*item).kind = WorkKind::ReloadShader as u32 };
    // No commit yet: the consumer must not observe the slot.
    assert!(queue.pop().is_none());

    queue.push_commit();
    assert!(queue.pop().is_some());
    queue.pop_commit();

    region.unlink();
}

#[test]
fn capacity_and_full_sentinel() {
    let (region, _name) = fresh_region("queue_capacity");
    let queue = region.work_queue();

    // N-1 items fit.
    for frame in 0..(WORK_QUEUE_CAPACITY as u32 - 1) {
        assert!(push_compute(&region, frame), "push {frame} should succeed");
    }
    assert!(!queue.full_sentinel_set());

    // The 64th push fails and raises the sentinel without corrupting the
    // indices.
    assert!(!push_compute(&region, 999));
    assert!(queue.full_sentinel_set());

    // Pop does not clear the sentinel; the next successful push does.
    assert_eq!(pop_compute(&region), Some(0));
    assert!(queue.full_sentinel_set());
    assert!(push_compute(&region, 1000));
    assert!(!queue.full_sentinel_set());

    // Everything drains in order.
    for frame in 1..(WORK_QUEUE_CAPACITY as u32 - 1) {
        assert_eq!(pop_compute(&region), Some(frame));
    }
    assert_eq!(pop_compute(&region), Some(1000));
    assert_eq!(pop_compute(&region), None);

    region.unlink();
}

// Single producer in one attach, single consumer in another: the committed
// sequence arrives intact and in order.
#[test]
fn spsc_order_across_attaches() {
    let (region, name) = fresh_region("queue_spsc");
    const ITEMS: u32 = 500;

    let producer_name = name.clone();
    let producer = thread::spawn(move || {
        let region = SharedMemoryRegion::attach(&producer_name).expect("attach producer");
        for frame in 0..ITEMS {
            while !push_compute(&region, frame) {
                thread::yield_now();
            }
        }
    });

    let mut received = Vec::with_capacity(ITEMS as usize);
    while received.len() < ITEMS as usize {
        match pop_compute(&region) {
            Some(frame) => received.push(frame),
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();

    let expected: Vec<u32> = (0..ITEMS).collect();
    assert_eq!(received, expected);

    region.unlink();
}

#[test]
fn pushed_slot_is_zeroed() {
    let (region, _name) = fresh_region("queue_zeroed");
    let queue = region.work_queue();

    let item = queue.push().expect("slot");
    unsafe {
        assert_eq!((*item).kind, WorkKind::Compute as u32);
        assert!((*item).sync_lock().is_none());
        assert_eq!((*item).payload.compute.frame, 0);
    }

    region.unlink();
}

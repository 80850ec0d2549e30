// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Throughput of the in-region work queue: one full push/commit/pop/commit
// cycle, and a burst of 32 items.

use criterion::{criterion_group, criterion_main, Criterion};

use beamformer_ipc::{ComputeContext, SharedMemoryRegion, ShmHandle, WorkKind};

fn bench_work_queue(c: &mut Criterion) {
    let name = format!("/bfipc_bench_queue_{}", std::process::id());
    ShmHandle::unlink_by_name(&name);
    let region = SharedMemoryRegion::create(&name).expect("create region");

    c.bench_function("queue/push_pop_cycle", |b| {
        let queue = region.work_queue();
        b.iter(|| {
            let item = queue.push().expect("slot");
            unsafe {
                (*item).kind = WorkKind::Compute as u32;
                (*item).payload.compute = ComputeContext {
                    frame: 1,
                    parameter_block: 0,
                };
            }
            queue.push_commit();
            let popped = queue.pop().expect("item");
            let frame = unsafe { (*popped).payload.compute.frame };
            queue.pop_commit();
            frame
        })
    });

    c.bench_function("queue/burst_32", |b| {
        let queue = region.work_queue();
        b.iter(|| {
            for frame in 0..32u32 {
                let item = queue.push().expect("slot");
                unsafe {
                    (*item).kind = WorkKind::Compute as u32;
                    (*item).payload.compute = ComputeContext {
                        frame,
                        parameter_block: 0,
                    };
                }
                queue.push_commit();
            }
            for _ in 0..32 {
                queue.pop().expect("item");
                queue.pop_commit();
            }
        })
    });

    region.unlink();
}

criterion_group!(benches, bench_work_queue);
criterion_main!(benches);

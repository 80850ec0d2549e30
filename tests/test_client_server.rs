// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end flows: a client stages state and posts work, the server
// drains the queue into a recording backend, and the synchronous export
// path round-trips a frame through the real pipe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use beamformer_ipc::layout::{
    DataKind, ParameterBlock, ParameterBlockRegion, Parameters, ShaderKind, ViewPlaneTag,
};
use beamformer_ipc::{
    Client, ComputeBackend, Error, ExportKind, FilterKind, LockId, Server, ShmHandle,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/bfipc_{prefix}_{}_{n}", std::process::id())
}

#[derive(Default)]
struct RecordingBackend {
    events: Vec<String>,
    rf: Vec<u8>,
}

impl ComputeBackend for RecordingBackend {
    fn parameter_block_updated(
        &mut self,
        block: u32,
        region: ParameterBlockRegion,
        _data: &ParameterBlock,
    ) {
        self.events.push(format!("sync {block} {region:?}"));
    }

    fn upload_rf(&mut self, rf: &[u8]) {
        self.rf = rf.to_vec();
        self.events.push(format!("upload_rf {}", rf.len()));
    }

    fn compute(&mut self, frame: u32, block: u32) {
        self.events.push(format!("compute {frame} {block}"));
    }

    fn compute_indirect(&mut self, view_plane: ViewPlaneTag, block: u32) {
        self.events.push(format!("compute_indirect {view_plane:?} {block}"));
    }

    fn create_filter(&mut self, slot: u8, block: u8, response: &[f32], complex: bool) -> u32 {
        self.events
            .push(format!("create_filter {slot} {block} {} {complex}", response.len()));
        42
    }

    fn reload_shader(&mut self, context: u32) {
        self.events.push(format!("reload_shader {context}"));
    }

    fn export(&mut self, kind: ExportKind, size: u32, out: &mut Vec<u8>) -> bool {
        self.events.push(format!("export {kind:?} {size}"));
        for i in 0..size / 4 {
            out.extend_from_slice(&(i as f32).to_le_bytes());
        }
        out.resize(size as usize, 0);
        true
    }
}

#[test]
fn upload_and_compute_flow() {
    let _ = env_logger::builder().is_test(true).try_init();
    let name = unique_name("e2e_compute");
    ShmHandle::unlink_by_name(&name);

    let mut server = Server::create(&name).expect("create server");
    let client = Client::attach(&name).expect("attach client");
    let mut backend = RecordingBackend::default();

    client
        .push_pipeline_at(
            &[ShaderKind::Demodulate, ShaderKind::Decode, ShaderKind::Das],
            DataKind::Int16,
            0,
        )
        .expect("push pipeline");
    let mapping: Vec<i16> = (0..256).collect();
    client
        .push_channel_mapping_at(&mapping, 0)
        .expect("push mapping");
    let mut parameters = Parameters::zeroed();
    parameters.sampling_frequency = 20.0e6;
    parameters.speed_of_sound = 1540.0;
    client
        .push_parameters_at(&parameters, 0)
        .expect("push parameters");
    client
        .create_filter_at(FilterKind::Kaiser, &[5.65, 2.0e6, 16.0], 20.0e6, 0, false, 0)
        .expect("create filter");

    let rf: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
    client
        .push_data_with_compute(&rf, ViewPlaneTag::Yz, 0)
        .expect("push data");

    // Items land in FIFO order: filter, upload, compute.
    let processed = server.process_pending(&mut backend);
    assert_eq!(processed, 3);

    assert_eq!(backend.rf, rf);
    assert_eq!(client.region().scratch_rf_size(), rf.len() as u32);

    let filter_index = backend
        .events
        .iter()
        .position(|e| e.starts_with("create_filter 0 0 16 false"))
        .expect("filter event");
    let upload_index = backend
        .events
        .iter()
        .position(|e| e == &format!("upload_rf {}", rf.len()))
        .expect("upload event");
    let compute_index = backend
        .events
        .iter()
        .position(|e| e == "compute_indirect Yz 0")
        .expect("compute event");
    assert!(filter_index < upload_index);
    assert!(upload_index < compute_index);

    // The compute synced every dirty subregion and cleared the bitmap.
    for region in ["ComputePipeline", "ChannelMapping", "Parameters"] {
        assert!(
            backend.events.contains(&format!("sync 0 {region}")),
            "missing sync of {region}: {:?}",
            backend.events
        );
    }
    assert_eq!(client.region().dirty_regions(0), 0);

    // The server released the upload lock after the compute consumed the
    // scratch.
    assert_eq!(client.region().peek_lock(LockId::UploadRf), 0);
    assert_eq!(client.region().peek_lock(LockId::DispatchCompute), 0);

    assert_eq!(server.filter_slot(0).expect("slot filled").handle, 42);
    assert_eq!(server.filter_slot(0).unwrap().kind, FilterKind::Kaiser);
    assert!(server.filter_slot(1).is_none());

    // A completion barrier succeeds immediately now.
    client.wait_for_compute_dispatch(100).expect("barrier");

    server.region().unlink();
}

#[test]
fn synchronous_export_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let name = unique_name("e2e_export");
    ShmHandle::unlink_by_name(&name);

    let server = Server::create(&name).expect("create server");
    let client = Client::attach(&name).expect("attach client");

    let done = Arc::new(AtomicBool::new(false));
    let server_done = Arc::clone(&done);
    let server_thread = thread::spawn(move || {
        let mut server = server;
        let mut backend = RecordingBackend::default();
        while !server_done.load(Ordering::Acquire) {
            server.process_pending(&mut backend);
            thread::sleep(Duration::from_millis(1));
        }
        (server, backend)
    });

    // 4x1x8 voxels, two f32 per voxel.
    let rf: Vec<u8> = vec![7; 2048];
    let frame = client
        .beamform_data_synchronized(&rf, [4, 1, 8], 100_000)
        .expect("synchronous beamform");
    assert_eq!(frame.len(), 4 * 8 * 2);
    for (i, value) in frame.iter().enumerate() {
        assert_eq!(*value, i as f32, "voxel word {i}");
    }

    done.store(true, Ordering::Release);
    let (mut server, backend) = server_thread.join().unwrap();

    assert_eq!(backend.rf, rf);
    assert!(backend.events.iter().any(|e| e == "compute 0 0"));
    assert!(backend
        .events
        .iter()
        .any(|e| e == &format!("export BeamformedData {}", 4 * 8 * 2 * 4)));
    assert_eq!(client.region().peek_lock(LockId::UploadRf), 0);
    assert_eq!(client.region().peek_lock(LockId::ExportSync), 0);

    // A timed-out export leaves a queued item the server still executes;
    // its pipe write fails silently and the sync lock is released.
    let mut backend = RecordingBackend::default();
    match client.export_compute_stats(64, 1) {
        Err(Error::PipeError(_)) => {}
        other => panic!("expected PipeError, got {other:?}"),
    }
    assert_eq!(client.region().peek_lock(LockId::ExportSync), 1);
    let processed = server.process_pending(&mut backend);
    assert_eq!(processed, 1);
    assert!(backend.events.iter().any(|e| e == "export Stats 64"));
    assert_eq!(client.region().peek_lock(LockId::ExportSync), 0);

    server.region().unlink();
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use dynamo_ucx::device::{DeviceRuntime, HostOnly};
use dynamo_ucx::transport::loopback::{LoopbackFabric, LoopbackTransport};
use dynamo_ucx::{
    BackendConfig, BackendEngine, BackendMetadata, BackendReqHandle, BlobDesc, MemType, MetaDesc,
    UcxEngine, XferStatus,
};

pub type Engine = UcxEngine<LoopbackTransport>;

const DEADLINE: Duration = Duration::from_secs(10);

pub fn config(num_workers: usize, progress_thread: bool) -> BackendConfig {
    BackendConfig::builder()
        .num_workers(num_workers)
        .progress_thread(progress_thread)
        .progress_delay(Duration::from_millis(1))
        .cuda_address_workaround(false)
        .build()
        .unwrap()
}

pub fn engine(fabric: &LoopbackFabric, agent: &str, config: BackendConfig) -> Engine {
    engine_on(fabric, agent, config, Arc::new(HostOnly))
}

pub fn engine_on(
    fabric: &LoopbackFabric,
    agent: &str,
    config: BackendConfig,
    device: Arc<dyn DeviceRuntime>,
) -> Engine {
    dynamo_ucx::logging::init();
    UcxEngine::with_config(agent, config, device, |params| fabric.transport(params)).unwrap()
}

/// Exchange connection info both ways and connect both sides.
pub fn connect_pair(a: &Engine, b: &Engine) {
    a.load_remote_conn_info(b.local_agent(), &b.conn_info().unwrap())
        .unwrap();
    b.load_remote_conn_info(a.local_agent(), &a.conn_info().unwrap())
        .unwrap();
    a.connect(b.local_agent()).unwrap();
    b.connect(a.local_agent()).unwrap();
}

/// Host memory that a peer may read or write through the backend.
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub fn pattern(len: usize, seed: u8) -> Self {
        Self {
            data: (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect(),
        }
    }

    pub fn addr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn desc(&self) -> BlobDesc {
        BlobDesc {
            addr: self.addr(),
            len: self.len(),
            dev_id: 0,
            meta_info: Vec::new(),
        }
    }

    pub fn register(&self, engine: &Engine) -> BackendMetadata {
        engine.register_mem(&self.desc(), MemType::Dram).unwrap()
    }

    /// Descriptors for consecutive slices of `sizes` bytes.
    pub fn slices<'a>(&self, sizes: &[usize], metadata: &'a BackendMetadata) -> Vec<MetaDesc<'a>> {
        let mut offset = 0;
        sizes
            .iter()
            .map(|&len| {
                let desc = MetaDesc {
                    addr: self.addr() + offset,
                    len,
                    dev_id: 0,
                    metadata,
                };
                offset += len;
                desc
            })
            .collect()
    }
}

/// Load `owner`'s registration on `peer` as a remote target.
pub fn share(owner: &Engine, buffer: &Buffer, md: &BackendMetadata, peer: &Engine) -> BackendMetadata {
    let blob = BlobDesc {
        meta_info: owner.public_data(md).unwrap(),
        ..buffer.desc()
    };
    peer.load_remote_md(&blob, MemType::Dram, owner.local_agent())
        .unwrap()
}

/// Poll a transfer until it leaves the in-progress state.
pub fn wait_complete(engine: &Engine, handle: &mut BackendReqHandle) {
    let deadline = Instant::now() + DEADLINE;
    loop {
        match engine.check_xfer(handle).unwrap() {
            XferStatus::Complete => return,
            XferStatus::InProgress => {
                assert!(Instant::now() < deadline, "transfer did not complete");
                engine.progress();
                std::thread::yield_now();
            }
        }
    }
}

/// Retry `f` until it yields a value.
pub fn eventually<T>(what: &str, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! All workers created from one [`LoopbackFabric`] can reach each other.
//! Data operations copy bytes between registered regions of the current
//! process. Small operations complete while being posted; larger ones are
//! queued and complete on the issuing worker's next `progress()`. Active
//! messages are handed to the receiving worker and dispatched on its progress.
//!
//! The fabric can inject failures ([`FaultSite`]) and exposes counters so tests
//! can check that resources are rolled back.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::{
    AmHandler, AmRecvAttrs, AmSendFlags, ArmStatus, CostEstimate, CostMethod, Endpoint, Posted,
    RequestOps, Transport, TransportError, TransportParams, Worker,
};
use crate::backend::MemType;
use crate::error::XferStatus;
use crate::wake::WakeFd;

const ADDRESS_TAG: &[u8; 2] = b"lb";
const RKEY_TAG: &[u8; 2] = b"rk";

/// Where an injected failure strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSite {
    /// `Worker::connect`
    Connect,
    /// `Endpoint::import_remote_key`
    KeyImport,
    /// Any data or active-message post
    Post,
    /// Completion of a posted operation
    Completion,
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Operations up to this many bytes complete during the post.
    pub immediate_threshold: usize,

    /// Active messages larger than this, sent without the eager flag, arrive
    /// through rendezvous.
    pub rndv_threshold: usize,

    pub multi_threading: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            immediate_threshold: 64,
            rndv_threshold: 8192,
            multi_threading: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    addr: usize,
    len: usize,
}

impl Region {
    fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.addr + self.len)
    }
}

#[derive(Default)]
struct FabricInner {
    config: LoopbackConfig,
    next_id: AtomicU64,
    workers: DashMap<u64, Weak<WorkerInner>>,
    regions: DashMap<u64, Region>,
    faults: Mutex<HashMap<FaultSite, usize>>,
    live_remote_keys: AtomicUsize,
    rejected_messages: AtomicUsize,
}

impl FabricInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn hit(&self, site: FaultSite) -> bool {
        let mut faults = self.faults.lock();
        let Some(remaining) = faults.get_mut(&site) else {
            return false;
        };
        *remaining -= 1;
        if *remaining == 0 {
            faults.remove(&site);
            tracing::debug!(?site, "injecting loopback fault");
            true
        } else {
            false
        }
    }
}

/// A set of mutually reachable in-process workers.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LoopbackConfig) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                config,
                ..Default::default()
            }),
        }
    }

    /// Open a transport context on this fabric.
    pub fn transport(&self, params: &TransportParams) -> Result<LoopbackTransport, TransportError> {
        tracing::debug!(
            devices = ?params.devices,
            num_workers = params.num_workers,
            multi_threaded = params.multi_threaded,
            "opening loopback transport"
        );
        Ok(LoopbackTransport {
            fabric: self.inner.clone(),
        })
    }

    /// Make the `n`th next operation at `site` fail (1 = the very next one).
    pub fn fail_nth(&self, site: FaultSite, n: usize) {
        if n > 0 {
            self.inner.faults.lock().insert(site, n);
        }
    }

    pub fn live_remote_keys(&self) -> usize {
        self.inner.live_remote_keys.load(Ordering::SeqCst)
    }

    pub fn registered_regions(&self) -> usize {
        self.inner.regions.len()
    }

    /// Active messages dropped because no handler accepted them.
    pub fn rejected_messages(&self) -> usize {
        self.inner.rejected_messages.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.inner
            .workers
            .iter()
            .filter(|w| w.value().strong_count() > 0)
            .count()
    }
}

pub struct LoopbackTransport {
    fabric: Arc<FabricInner>,
}

impl Transport for LoopbackTransport {
    type Worker = LoopbackWorker;

    fn create_worker(&self) -> Result<LoopbackWorker, TransportError> {
        let id = self.fabric.next_id();
        let inner = Arc::new(WorkerInner {
            id,
            fabric: self.fabric.clone(),
            wake: WakeFd::new()?,
            ops: Mutex::new(VecDeque::new()),
            inbox: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(HashMap::new()),
        });
        self.fabric.workers.insert(id, Arc::downgrade(&inner));
        Ok(LoopbackWorker { inner })
    }

    fn register_memory(
        &self,
        addr: usize,
        len: usize,
        mem_type: MemType,
    ) -> Result<LoopbackMemory, TransportError> {
        if addr.checked_add(len).is_none() {
            return Err(TransportError::InvalidParam(format!(
                "region {addr:#x}+{len} wraps around"
            )));
        }
        let id = self.fabric.next_id();
        self.fabric.regions.insert(id, Region { addr, len });
        tracing::trace!(id, addr, len, ?mem_type, "registered loopback region");
        Ok(LoopbackMemory {
            fabric: self.fabric.clone(),
            id,
            region: Region { addr, len },
        })
    }

    fn pack_remote_key(&self, memory: &LoopbackMemory) -> Result<Vec<u8>, TransportError> {
        let mut blob = RKEY_TAG.to_vec();
        blob.extend_from_slice(&memory.id.to_le_bytes());
        Ok(blob)
    }

    fn supports_multithreading(&self) -> bool {
        self.fabric.config.multi_threading
    }
}

/// A registered region. Dropping it deregisters the region.
pub struct LoopbackMemory {
    fabric: Arc<FabricInner>,
    id: u64,
    region: Region,
}

impl fmt::Debug for LoopbackMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackMemory")
            .field("id", &self.id)
            .field("region", &self.region)
            .finish()
    }
}

impl Drop for LoopbackMemory {
    fn drop(&mut self) {
        self.fabric.regions.remove(&self.id);
    }
}

/// An imported remote key. Dropping it destroys the key.
pub struct LoopbackRemoteKey {
    fabric: Arc<FabricInner>,
    region: u64,
}

impl fmt::Debug for LoopbackRemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackRemoteKey")
            .field("region", &self.region)
            .finish()
    }
}

impl Drop for LoopbackRemoteKey {
    fn drop(&mut self) {
        self.fabric.live_remote_keys.fetch_sub(1, Ordering::SeqCst);
    }
}

const PENDING: u8 = 0;
const DONE: u8 = 1;
const FAILED: u8 = 2;
const CANCELED: u8 = 3;

#[derive(Debug)]
struct RequestState(AtomicU8);

impl RequestState {
    fn finish(&self, to: u8) -> bool {
        self.0
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Handle of an in-flight loopback operation.
#[derive(Debug, Clone)]
pub struct LoopbackRequest(Arc<RequestState>);

impl LoopbackRequest {
    fn new() -> Self {
        Self(Arc::new(RequestState(AtomicU8::new(PENDING))))
    }
}

struct InboundAm {
    opcode: u16,
    header: Vec<u8>,
    payload: Bytes,
    attrs: AmRecvAttrs,
}

enum OpKind {
    Copy {
        src: usize,
        dst: usize,
        len: usize,
        local_region: u64,
        remote_region: u64,
    },
    Flush,
    Am {
        target: Weak<WorkerInner>,
        message: InboundAm,
    },
}

struct PendingOp {
    request: LoopbackRequest,
    kind: OpKind,
}

struct WorkerInner {
    id: u64,
    fabric: Arc<FabricInner>,
    wake: WakeFd,
    ops: Mutex<VecDeque<PendingOp>>,
    inbox: Mutex<VecDeque<InboundAm>>,
    handlers: RwLock<HashMap<u16, AmHandler>>,
}

impl WorkerInner {
    fn enqueue(&self, op: PendingOp) {
        self.ops.lock().push_back(op);
        self.wake.signal();
    }

    fn deliver(&self, message: InboundAm) {
        self.inbox.lock().push_back(message);
        self.wake.signal();
    }

    /// Run an operation's effect. Returns false if it failed.
    fn execute(&self, kind: OpKind) -> bool {
        match kind {
            OpKind::Copy {
                src,
                dst,
                len,
                local_region,
                remote_region,
            } => {
                if !self.fabric.regions.contains_key(&local_region) {
                    tracing::debug!(worker = self.id, local_region, "local region vanished");
                    return false;
                }
                if !self.fabric.regions.contains_key(&remote_region) {
                    tracing::debug!(worker = self.id, remote_region, "remote region vanished");
                    return false;
                }
                // SAFETY: both ranges were checked against live registrations when
                // the operation was posted; registering memory promises it stays
                // valid until deregistered.
                unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) };
                true
            }
            OpKind::Flush => true,
            OpKind::Am { target, message } => match target.upgrade() {
                Some(target) => {
                    target.deliver(message);
                    true
                }
                None => false,
            },
        }
    }

    fn complete(&self, op: PendingOp) {
        if op.request.0.0.load(Ordering::Acquire) != PENDING {
            return;
        }
        if self.fabric.hit(FaultSite::Completion) {
            op.request.0.finish(FAILED);
            return;
        }
        let to = if self.execute(op.kind) { DONE } else { FAILED };
        op.request.0.finish(to);
    }

    fn dispatch(&self, message: InboundAm) {
        let handler = self.handlers.read().get(&message.opcode).cloned();
        let result = match handler {
            Some(handler) => handler(&message.header, &message.payload, message.attrs),
            None => Err(TransportError::InvalidParam(format!(
                "no handler for opcode {}",
                message.opcode
            ))),
        };
        if let Err(e) = result {
            self.fabric.rejected_messages.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                worker = self.id,
                opcode = message.opcode,
                "rejected active message: {e}"
            );
        }
    }
}

pub struct LoopbackWorker {
    inner: Arc<WorkerInner>,
}

impl Drop for LoopbackWorker {
    fn drop(&mut self) {
        self.inner.fabric.workers.remove(&self.inner.id);
    }
}

impl RequestOps for LoopbackWorker {
    type Request = LoopbackRequest;

    fn test(&self, request: &LoopbackRequest) -> Result<XferStatus, TransportError> {
        match request.0.0.load(Ordering::Acquire) {
            PENDING => Ok(XferStatus::InProgress),
            DONE => Ok(XferStatus::Complete),
            CANCELED => Err(TransportError::Canceled),
            _ => Err(TransportError::Failed("operation did not complete".to_string())),
        }
    }

    fn cancel(&self, request: &LoopbackRequest) {
        request.0.finish(CANCELED);
    }

    fn release(&self, request: LoopbackRequest) {
        drop(request);
    }
}

impl Worker for LoopbackWorker {
    type Endpoint = LoopbackEndpoint;

    fn address(&self) -> Result<Vec<u8>, TransportError> {
        let mut address = ADDRESS_TAG.to_vec();
        address.extend_from_slice(&self.inner.id.to_le_bytes());
        Ok(address)
    }

    fn connect(&self, address: &[u8]) -> Result<LoopbackEndpoint, TransportError> {
        if self.inner.fabric.hit(FaultSite::Connect) {
            return Err(TransportError::Unreachable("injected connect failure".to_string()));
        }
        let id = parse_tagged(ADDRESS_TAG, address).ok_or(TransportError::InvalidAddress)?;
        let target = self
            .inner
            .fabric
            .workers
            .get(&id)
            .map(|w| w.value().clone())
            .filter(|w| w.strong_count() > 0)
            .ok_or_else(|| TransportError::Unreachable(format!("no loopback worker {id}")))?;
        Ok(LoopbackEndpoint {
            local: self.inner.clone(),
            target,
        })
    }

    fn progress(&self) -> usize {
        let ops: Vec<PendingOp> = self.inner.ops.lock().drain(..).collect();
        let inbox: Vec<InboundAm> = self.inner.inbox.lock().drain(..).collect();
        let count = ops.len() + inbox.len();

        for op in ops {
            self.inner.complete(op);
        }
        for message in inbox {
            self.inner.dispatch(message);
        }
        count
    }

    fn arm(&self) -> Result<ArmStatus, TransportError> {
        self.inner.wake.drain();
        if !self.inner.ops.lock().is_empty() || !self.inner.inbox.lock().is_empty() {
            return Ok(ArmStatus::Busy);
        }
        Ok(ArmStatus::Armed)
    }

    fn event_fd(&self) -> Result<RawFd, TransportError> {
        Ok(self.inner.wake.fd())
    }

    fn set_am_handler(&self, opcode: u16, handler: AmHandler) {
        self.inner.handlers.write().insert(opcode, handler);
    }
}

pub struct LoopbackEndpoint {
    local: Arc<WorkerInner>,
    target: Weak<WorkerInner>,
}

impl fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("local", &self.local.id)
            .field("target", &self.target.upgrade().map(|t| t.id))
            .finish()
    }
}

impl LoopbackEndpoint {
    fn fabric(&self) -> &FabricInner {
        &self.local.fabric
    }

    /// Complete small operations now, queue the rest on the local worker.
    fn submit(&self, len: usize, kind: OpKind) -> Result<Posted<LoopbackRequest>, TransportError> {
        if self.fabric().hit(FaultSite::Post) {
            return Err(TransportError::Failed("injected post failure".to_string()));
        }
        let op = PendingOp {
            request: LoopbackRequest::new(),
            kind,
        };
        if len <= self.fabric().config.immediate_threshold {
            let request = op.request.clone();
            self.local.complete(op);
            return match self.local_test(&request) {
                XferStatus::Complete => Ok(Posted::Complete),
                XferStatus::InProgress => Ok(Posted::Pending(request)),
            };
        }
        let request = op.request.clone();
        self.local.enqueue(op);
        Ok(Posted::Pending(request))
    }

    fn local_test(&self, request: &LoopbackRequest) -> XferStatus {
        match request.0.0.load(Ordering::Acquire) {
            DONE => XferStatus::Complete,
            // failures are reported through `test`
            _ => XferStatus::InProgress,
        }
    }

    fn remote_region(&self, rkey: &LoopbackRemoteKey) -> Result<Region, TransportError> {
        self.fabric()
            .regions
            .get(&rkey.region)
            .map(|r| *r.value())
            .ok_or(TransportError::InvalidKey)
    }

    fn check_ranges(
        &self,
        local_addr: usize,
        local_mem: &LoopbackMemory,
        remote_addr: u64,
        rkey: &LoopbackRemoteKey,
        len: usize,
    ) -> Result<usize, TransportError> {
        if !local_mem.region.contains(local_addr, len) {
            return Err(TransportError::InvalidParam(format!(
                "local range {local_addr:#x}+{len} outside registration"
            )));
        }
        let remote_addr = usize::try_from(remote_addr)
            .map_err(|_| TransportError::InvalidParam(format!("remote address {remote_addr:#x}")))?;
        if !self.remote_region(rkey)?.contains(remote_addr, len) {
            return Err(TransportError::InvalidParam(format!(
                "remote range {remote_addr:#x}+{len} outside registration"
            )));
        }
        Ok(remote_addr)
    }
}

impl Endpoint for LoopbackEndpoint {
    type Request = LoopbackRequest;
    type Memory = LoopbackMemory;
    type RemoteKey = LoopbackRemoteKey;

    fn read(
        &self,
        remote_addr: u64,
        rkey: &LoopbackRemoteKey,
        local_addr: usize,
        local_mem: &LoopbackMemory,
        len: usize,
    ) -> Result<Posted<LoopbackRequest>, TransportError> {
        let remote_addr = self.check_ranges(local_addr, local_mem, remote_addr, rkey, len)?;
        self.submit(
            len,
            OpKind::Copy {
                src: remote_addr,
                dst: local_addr,
                len,
                local_region: local_mem.id,
                remote_region: rkey.region,
            },
        )
    }

    fn write(
        &self,
        local_addr: usize,
        local_mem: &LoopbackMemory,
        remote_addr: u64,
        rkey: &LoopbackRemoteKey,
        len: usize,
    ) -> Result<Posted<LoopbackRequest>, TransportError> {
        let remote_addr = self.check_ranges(local_addr, local_mem, remote_addr, rkey, len)?;
        self.submit(
            len,
            OpKind::Copy {
                src: local_addr,
                dst: remote_addr,
                len,
                local_region: local_mem.id,
                remote_region: rkey.region,
            },
        )
    }

    fn send_am(
        &self,
        opcode: u16,
        header: &[u8],
        payload: Bytes,
        flags: AmSendFlags,
    ) -> Result<Posted<LoopbackRequest>, TransportError> {
        if self.target.strong_count() == 0 {
            return Err(TransportError::Unreachable("loopback peer is gone".to_string()));
        }
        let rendezvous = !flags.eager && payload.len() > self.fabric().config.rndv_threshold;
        let len = payload.len();
        let message = InboundAm {
            opcode,
            header: header.to_vec(),
            payload,
            attrs: AmRecvAttrs { rendezvous },
        };
        self.submit(
            len,
            OpKind::Am {
                target: self.target.clone(),
                message,
            },
        )
    }

    fn flush(&self) -> Result<Posted<LoopbackRequest>, TransportError> {
        if self.local.ops.lock().is_empty() {
            return Ok(Posted::Complete);
        }
        let request = LoopbackRequest::new();
        self.local.enqueue(PendingOp {
            request: request.clone(),
            kind: OpKind::Flush,
        });
        Ok(Posted::Pending(request))
    }

    fn import_remote_key(&self, blob: &[u8]) -> Result<LoopbackRemoteKey, TransportError> {
        if self.fabric().hit(FaultSite::KeyImport) {
            return Err(TransportError::Failed("injected key import failure".to_string()));
        }
        let region = parse_tagged(RKEY_TAG, blob).ok_or(TransportError::InvalidKey)?;
        if !self.fabric().regions.contains_key(&region) {
            return Err(TransportError::InvalidKey);
        }
        self.fabric().live_remote_keys.fetch_add(1, Ordering::SeqCst);
        Ok(LoopbackRemoteKey {
            fabric: self.local.fabric.clone(),
            region,
        })
    }

    fn tx_healthy(&self) -> bool {
        self.target.strong_count() > 0
    }

    fn estimate_cost(&self, len: usize) -> Result<CostEstimate, TransportError> {
        // 1us setup plus ~10 bytes/ns
        let duration = Duration::from_nanos(1_000 + (len / 10) as u64);
        Ok(CostEstimate {
            duration,
            err_margin: duration / 10,
            method: CostMethod::AnalyticalBackend,
        })
    }
}

fn parse_tagged(tag: &[u8; 2], bytes: &[u8]) -> Option<u64> {
    let rest = bytes.strip_prefix(tag.as_slice())?;
    let raw: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Capability interface onto the RDMA transport.
//!
//! The engine never talks to a native library directly. It drives a
//! [`Transport`] (the transport context), which hands out [`Worker`]s, which in
//! turn connect [`Endpoint`]s to remote worker addresses. Every operation that
//! may complete asynchronously returns [`Posted`]; a pending request is polled
//! through [`RequestOps`] on the worker that issued it.
//!
//! [`loopback`] provides an in-process implementation used by the test suite.

pub mod loopback;

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backend::MemType;
use crate::config::ErrorHandlingMode;
use crate::error::XferStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("malformed worker address")]
    InvalidAddress,

    #[error("invalid or stale remote key")]
    InvalidKey,

    #[error("request canceled")]
    Canceled,

    #[error("operation failed: {0}")]
    Failed(String),

    #[error("multi-threaded workers are not supported by this transport")]
    MultiThreadingUnsupported,

    #[error("i/o error: {0}")]
    Io(#[from] nix::Error),
}

/// Outcome of posting an operation.
#[derive(Debug)]
#[must_use]
pub enum Posted<R> {
    /// Finished during the post; there is nothing to track.
    Complete,

    /// Still in flight; the request must be tested and eventually released.
    Pending(R),
}

/// Result of arming a worker's event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmStatus {
    /// The event fd will become readable on the next event.
    Armed,

    /// Events are already queued; progress the worker and try again.
    Busy,
}

/// Flags for [`Endpoint::send_am`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmSendFlags {
    /// Force eager delivery regardless of payload size.
    pub eager: bool,
}

impl AmSendFlags {
    pub fn eager() -> Self {
        Self { eager: true }
    }
}

/// Receive-side attributes of an active message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmRecvAttrs {
    /// The payload arrived through the rendezvous protocol.
    pub rendezvous: bool,
}

/// Active-message receive callback: `(header, payload, attrs)`.
pub type AmHandler =
    Arc<dyn Fn(&[u8], &[u8], AmRecvAttrs) -> Result<(), TransportError> + Send + Sync>;

/// Parameters used to open a transport context.
#[derive(Debug, Clone, Default)]
pub struct TransportParams {
    /// Devices to open; empty means all.
    pub devices: Vec<String>,
    pub error_handling: ErrorHandlingMode,

    /// Workers will be driven from more than one thread.
    pub multi_threaded: bool,
    pub num_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostMethod {
    /// Derived from the transport's own performance model.
    AnalyticalBackend,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostEstimate {
    pub duration: Duration,
    pub err_margin: Duration,
    pub method: CostMethod,
}

/// Polling, cancellation and release of in-flight requests.
pub trait RequestOps {
    type Request: Send + 'static;

    /// Poll a request. A terminal failure is returned as an error.
    fn test(&self, request: &Self::Request) -> Result<XferStatus, TransportError>;

    /// Ask the transport to abandon a request. Does not wait.
    fn cancel(&self, request: &Self::Request);

    /// Return a request to the transport. The request may still be in flight.
    fn release(&self, request: Self::Request);
}

/// One logical transport context: owns a progress queue and an event source.
pub trait Worker: RequestOps + Send + Sync + 'static {
    type Endpoint: Endpoint<Request = Self::Request>;

    /// Opaque address a remote worker connects to.
    fn address(&self) -> Result<Vec<u8>, TransportError>;

    fn connect(&self, address: &[u8]) -> Result<Self::Endpoint, TransportError>;

    /// Drive pending work once. Returns the number of events processed.
    fn progress(&self) -> usize;

    /// Arm the event fd for the next wakeup.
    fn arm(&self) -> Result<ArmStatus, TransportError>;

    fn event_fd(&self) -> Result<RawFd, TransportError>;

    fn set_am_handler(&self, opcode: u16, handler: AmHandler);
}

/// A worker's connection to one remote worker.
pub trait Endpoint: Send + Sync + 'static {
    type Request: Send + 'static;
    type Memory: Send + Sync + 'static;
    type RemoteKey: Send + Sync + 'static;

    fn read(
        &self,
        remote_addr: u64,
        rkey: &Self::RemoteKey,
        local_addr: usize,
        local_mem: &Self::Memory,
        len: usize,
    ) -> Result<Posted<Self::Request>, TransportError>;

    fn write(
        &self,
        local_addr: usize,
        local_mem: &Self::Memory,
        remote_addr: u64,
        rkey: &Self::RemoteKey,
        len: usize,
    ) -> Result<Posted<Self::Request>, TransportError>;

    /// Send an active message. The payload is owned by the request until it completes.
    fn send_am(
        &self,
        opcode: u16,
        header: &[u8],
        payload: bytes::Bytes,
        flags: AmSendFlags,
    ) -> Result<Posted<Self::Request>, TransportError>;

    /// Completes once every operation previously posted on this endpoint has.
    fn flush(&self) -> Result<Posted<Self::Request>, TransportError>;

    /// Import a packed remote key. Dropping the key destroys it.
    fn import_remote_key(&self, blob: &[u8]) -> Result<Self::RemoteKey, TransportError>;

    /// The send path towards the peer is still usable.
    fn tx_healthy(&self) -> bool;

    fn estimate_cost(&self, len: usize) -> Result<CostEstimate, TransportError>;
}

/// Transport context: creates workers and owns memory registrations.
pub trait Transport: Sized + Send + Sync + 'static {
    type Worker: Worker;

    fn create_worker(&self) -> Result<Self::Worker, TransportError>;

    /// Register a memory region. Dropping the handle deregisters it.
    fn register_memory(
        &self,
        addr: usize,
        len: usize,
        mem_type: MemType,
    ) -> Result<MemoryOf<Self>, TransportError>;

    /// Packed remote key for a registered region, for transmission to peers.
    fn pack_remote_key(&self, memory: &MemoryOf<Self>) -> Result<Vec<u8>, TransportError>;

    fn deregister_memory(&self, memory: MemoryOf<Self>) {
        drop(memory);
    }

    fn supports_multithreading(&self) -> bool;
}

pub type WorkerOf<T> = <T as Transport>::Worker;
pub type RequestOf<T> = <WorkerOf<T> as RequestOps>::Request;
pub type EndpointOf<T> = <WorkerOf<T> as Worker>::Endpoint;
pub type MemoryOf<T> = <EndpointOf<T> as Endpoint>::Memory;
pub type RemoteKeyOf<T> = <EndpointOf<T> as Endpoint>::RemoteKey;

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The interface a transfer agent uses to drive a transport backend.
//!
//! Metadata and request handles cross this boundary as opaque values. A backend
//! recovers its own representation with a checked downcast, so a handle minted
//! by one backend cannot be misinterpreted by another.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_PROGRESS_DELAY;
use crate::error::{BackendError, Result, XferStatus};
use crate::notify::Notification;
use crate::sync::ThreadSync;
use crate::transport::CostEstimate;

/// Memory segment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemType {
    /// Host memory.
    Dram,

    /// Accelerator device memory.
    Vram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XferOp {
    Read,
    Write,
}

/// A memory region together with an opaque metadata blob.
///
/// Used for registration (where `meta_info` is unused) and for loading remote
/// metadata (where `meta_info` carries the peer's packed remote key).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobDesc {
    pub addr: usize,
    pub len: usize,
    pub dev_id: u64,
    pub meta_info: Vec<u8>,
}

/// One entry of a transfer descriptor list.
#[derive(Debug, Clone, Copy)]
pub struct MetaDesc<'a> {
    pub addr: usize,
    pub len: usize,
    pub dev_id: u64,
    pub metadata: &'a BackendMetadata,
}

/// Backend specific metadata: a local registration or loaded remote keys.
pub struct BackendMetadata(Box<dyn Any + Send + Sync>);

impl BackendMetadata {
    pub fn new<M: Any + Send + Sync>(metadata: M) -> Self {
        Self(Box::new(metadata))
    }

    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.0.downcast_ref::<M>()
    }

    /// Recover the owned value, or hand `self` back if the type does not match.
    pub fn downcast<M: Any>(self) -> std::result::Result<Box<M>, Self> {
        self.0.downcast::<M>().map_err(Self)
    }
}

impl fmt::Debug for BackendMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendMetadata").finish_non_exhaustive()
    }
}

/// Opaque per-transfer request handle.
pub struct BackendReqHandle(Box<dyn Any + Send>);

impl BackendReqHandle {
    pub fn new<H: Any + Send>(handle: H) -> Self {
        Self(Box::new(handle))
    }

    pub fn downcast_mut<H: Any>(&mut self) -> Option<&mut H> {
        self.0.downcast_mut::<H>()
    }

    pub fn downcast_ref<H: Any>(&self) -> Option<&H> {
        self.0.downcast_ref::<H>()
    }

    pub fn downcast<H: Any>(self) -> std::result::Result<Box<H>, Self> {
        self.0.downcast::<H>().map_err(Self)
    }
}

impl fmt::Debug for BackendReqHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendReqHandle").finish_non_exhaustive()
    }
}

/// Optional arguments for a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XferOptArgs {
    /// Message delivered to the peer once the transfer has completed locally.
    pub notification: Option<String>,
}

impl XferOptArgs {
    pub fn with_notification(msg: impl Into<String>) -> Self {
        Self {
            notification: Some(msg.into()),
        }
    }
}

/// Parameters handed to a backend by the owning agent.
#[derive(Debug, Clone)]
pub struct BackendInitParams {
    pub local_agent: String,
    pub custom_params: HashMap<String, String>,
    pub enable_progress_thread: bool,
    pub progress_delay: Duration,
    pub thread_sync: ThreadSync,
}

impl Default for BackendInitParams {
    fn default() -> Self {
        Self {
            local_agent: String::new(),
            custom_params: HashMap::new(),
            enable_progress_thread: false,
            progress_delay: DEFAULT_PROGRESS_DELAY,
            thread_sync: ThreadSync::default(),
        }
    }
}

/// Operations a transport backend exposes to the transfer agent.
pub trait BackendEngine: Send + Sync {
    fn supported_mems(&self) -> Vec<MemType>;

    fn supports_remote(&self) -> bool {
        true
    }

    fn supports_local(&self) -> bool {
        true
    }

    fn supports_notif(&self) -> bool {
        true
    }

    fn supports_prog_th(&self) -> bool {
        true
    }

    // Connection management

    /// Opaque blob a peer passes to [`BackendEngine::load_remote_conn_info`].
    fn conn_info(&self) -> Result<Vec<u8>>;

    fn load_remote_conn_info(&self, remote_agent: &str, conn_info: &[u8]) -> Result<()>;

    fn connect(&self, remote_agent: &str) -> Result<()>;

    fn disconnect(&self, remote_agent: &str) -> Result<()>;

    fn check_conn(&self, remote_agent: &str) -> Result<()>;

    fn end_conn(&self, remote_agent: &str) -> Result<()>;

    // Memory management

    fn register_mem(&self, mem: &BlobDesc, mem_type: MemType) -> Result<BackendMetadata>;

    fn deregister_mem(&self, metadata: BackendMetadata) -> Result<()>;

    /// Blob a peer passes to [`BackendEngine::load_remote_md`] as `meta_info`.
    fn public_data(&self, metadata: &BackendMetadata) -> Result<Vec<u8>>;

    fn load_local_md(&self, metadata: &BackendMetadata) -> Result<BackendMetadata>;

    fn load_remote_md(
        &self,
        input: &BlobDesc,
        mem_type: MemType,
        remote_agent: &str,
    ) -> Result<BackendMetadata>;

    fn unload_md(&self, metadata: BackendMetadata) -> Result<()>;

    // Data movement

    fn prep_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_>],
        remote: &[MetaDesc<'_>],
        remote_agent: &str,
        opt_args: Option<&XferOptArgs>,
    ) -> Result<BackendReqHandle>;

    fn estimate_xfer_cost(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_>],
        remote: &[MetaDesc<'_>],
        remote_agent: &str,
        handle: &BackendReqHandle,
    ) -> Result<CostEstimate>;

    fn post_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_>],
        remote: &[MetaDesc<'_>],
        remote_agent: &str,
        handle: &mut BackendReqHandle,
        opt_args: Option<&XferOptArgs>,
    ) -> Result<XferStatus>;

    fn check_xfer(&self, handle: &mut BackendReqHandle) -> Result<XferStatus>;

    fn release_req_handle(&self, handle: BackendReqHandle) -> Result<()>;

    /// Drive every worker once. Returns the number of events processed.
    fn progress(&self) -> usize;

    // Notifications

    /// Move all received notifications into `dest`, which must be empty.
    fn get_notifs(&self, dest: &mut Vec<Notification>) -> Result<()>;

    fn gen_notif(&self, remote_agent: &str, msg: &str) -> Result<()>;
}

pub(crate) fn foreign_handle() -> BackendError {
    BackendError::InvalidParam("handle was not created by this backend".to_string())
}

pub(crate) fn foreign_metadata(what: &str) -> BackendError {
    BackendError::InvalidParam(format!("{what} metadata was not created by this backend"))
}

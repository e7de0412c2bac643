// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registered memory and imported remote keys.

use std::sync::Arc;

use crate::backend::MemType;
use crate::error::{BackendError, Result};
use crate::registry::RemoteConnection;
use crate::transport::Endpoint;

/// A local registration together with its packed remote key.
pub struct LocalMetadata<M> {
    memory: M,
    packed_rkey: Vec<u8>,
    mem_type: MemType,
}

impl<M> LocalMetadata<M> {
    pub fn new(memory: M, packed_rkey: Vec<u8>, mem_type: MemType) -> Self {
        Self {
            memory,
            packed_rkey,
            mem_type,
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// The blob peers import to access this region.
    pub fn packed_rkey(&self) -> &[u8] {
        &self.packed_rkey
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn into_memory(self) -> M {
        self.memory
    }
}

/// A peer's remote key imported on every endpoint of its connection.
///
/// Keys are destroyed when this value drops.
pub struct RemoteMetadata<E: Endpoint> {
    conn: Arc<RemoteConnection<E>>,
    rkeys: Vec<E::RemoteKey>,
}

impl<E: Endpoint> std::fmt::Debug for RemoteMetadata<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMetadata")
            .field("agent", &self.conn.agent())
            .field("rkeys", &self.rkeys.len())
            .finish()
    }
}

impl<E: Endpoint> RemoteMetadata<E> {
    /// Import `blob` once per worker endpoint. On failure the keys imported
    /// so far are destroyed.
    pub fn import(conn: Arc<RemoteConnection<E>>, blob: &[u8]) -> Result<Self> {
        let mut rkeys = Vec::with_capacity(conn.endpoints().len());
        for (worker, ep) in conn.endpoints().iter().enumerate() {
            match ep.import_remote_key(blob) {
                Ok(rkey) => rkeys.push(rkey),
                Err(e) => {
                    tracing::debug!(
                        agent = conn.agent(),
                        worker,
                        rolled_back = rkeys.len(),
                        "remote key import failed"
                    );
                    return Err(BackendError::Backend(format!(
                        "failed to import remote key from {} on worker {worker}: {e}",
                        conn.agent()
                    )));
                }
            }
        }
        Ok(Self { conn, rkeys })
    }

    pub fn conn(&self) -> &Arc<RemoteConnection<E>> {
        &self.conn
    }

    pub fn rkey(&self, worker_id: usize) -> Result<&E::RemoteKey> {
        self.rkeys.get(worker_id).ok_or_else(|| {
            BackendError::InvalidParam(format!("no remote key for worker {worker_id}"))
        })
    }

    pub fn len(&self) -> usize {
        self.rkeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rkeys.is_empty()
    }
}

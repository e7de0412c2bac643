// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection Registry
//!
//! Maps remote agent names to their connections. A connection holds one
//! endpoint per local worker, indexed by worker id, and is only ever
//! registered complete.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{BackendError, Result};
use crate::request::WorkerContext;
use crate::transport::{Endpoint, Worker};

/// Endpoints to one remote agent, one per local worker.
pub struct RemoteConnection<E> {
    agent: String,
    endpoints: Vec<E>,
}

impl<E: Endpoint> RemoteConnection<E> {
    /// Connect every worker to the remote worker `address`.
    ///
    /// Either all workers connect or none does: endpoints created before a
    /// failure are dropped with the partial connection.
    pub fn establish<W>(agent: &str, address: &[u8], workers: &[Arc<WorkerContext<W>>]) -> Result<Self>
    where
        W: Worker<Endpoint = E>,
    {
        let mut endpoints = Vec::with_capacity(workers.len());
        for worker in workers {
            let ep = worker.ops().connect(address).map_err(|e| {
                BackendError::Backend(format!(
                    "worker {} failed to connect to {agent}: {e}",
                    worker.id()
                ))
            })?;
            endpoints.push(ep);
        }
        Ok(Self {
            agent: agent.to_string(),
            endpoints,
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn endpoints(&self) -> &[E] {
        &self.endpoints
    }

    pub fn endpoint(&self, worker_id: usize) -> Result<&E> {
        self.endpoints.get(worker_id).ok_or_else(|| {
            BackendError::InvalidParam(format!(
                "{} has no endpoint for worker {worker_id}",
                self.agent
            ))
        })
    }
}

impl<E> std::fmt::Debug for RemoteConnection<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("agent", &self.agent)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

/// Registry of live connections keyed by remote agent name.
pub struct ConnectionRegistry<E> {
    conns: DashMap<String, Arc<RemoteConnection<E>>>,
}

impl<E> Default for ConnectionRegistry<E> {
    fn default() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }
}

impl<E: Endpoint> ConnectionRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A second connection to the same agent is rejected.
    pub fn insert(&self, conn: RemoteConnection<E>) -> Result<Arc<RemoteConnection<E>>> {
        match self.conns.entry(conn.agent.clone()) {
            Entry::Occupied(_) => Err(BackendError::InvalidParam(format!(
                "connection to {} already exists",
                conn.agent
            ))),
            Entry::Vacant(slot) => {
                tracing::debug!(agent = %conn.agent, endpoints = conn.endpoints.len(), "registered connection");
                Ok(slot.insert(Arc::new(conn)).clone())
            }
        }
    }

    pub fn get(&self, agent: &str) -> Result<Arc<RemoteConnection<E>>> {
        self.conns
            .get(agent)
            .map(|c| c.value().clone())
            .ok_or_else(|| BackendError::NotFound(format!("no connection to {agent}")))
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.conns.contains_key(agent)
    }

    /// Forget a connection. Metadata still referencing it keeps it alive.
    pub fn remove(&self, agent: &str) -> Result<Arc<RemoteConnection<E>>> {
        self.conns
            .remove(agent)
            .map(|(_, conn)| conn)
            .ok_or_else(|| BackendError::NotFound(format!("no connection to {agent}")))
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn agents(&self) -> Vec<String> {
        self.conns.iter().map(|c| c.key().clone()).collect()
    }
}

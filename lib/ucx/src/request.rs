// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracking of the native requests that make up one logical transfer.
//!
//! Requests live in a per-worker [`RequestPool`]: an arena of slots recycled
//! through a free list. A [`RequestHandle`] owns a singly linked list of slot
//! ids threaded through the arena. Slot ids carry a generation, so an id that
//! outlived its slot is detected instead of aliasing the slot's next tenant.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::XferStatus;
use crate::transport::{Posted, RequestOps, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<R> {
    request: Option<R>,
    completed: bool,
    /// Payload of an active message; must outlive the send.
    am_buffer: Option<Bytes>,
    next: Option<SlotId>,
    generation: u32,
}

impl<R> Slot<R> {
    fn empty() -> Self {
        Self {
            request: None,
            completed: false,
            am_buffer: None,
            next: None,
            generation: 0,
        }
    }
}

#[derive(Debug)]
struct PoolInner<R> {
    slots: Vec<Slot<R>>,
    free: Vec<u32>,
}

impl<R> PoolInner<R> {
    fn alloc(&mut self, request: R, am_buffer: Option<Bytes>, next: Option<SlotId>) -> SlotId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::empty());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.request = Some(request);
        slot.completed = false;
        slot.am_buffer = am_buffer;
        slot.next = next;
        SlotId {
            index,
            generation: slot.generation,
        }
    }

    fn get_mut(&mut self, id: SlotId) -> Option<&mut Slot<R>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.request.is_some())
    }

    /// Reset a slot and put it on the free list. Returns its request.
    fn free(&mut self, id: SlotId) -> Option<R> {
        let slot = self.get_mut(id)?;
        let request = slot.request.take();
        slot.completed = false;
        slot.am_buffer = None;
        slot.next = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        request
    }
}

/// Recycling arena of request slots, shared by every handle on one worker.
#[derive(Debug)]
pub struct RequestPool<R> {
    inner: Mutex<PoolInner<R>>,
}

impl<R> Default for RequestPool<R> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }
}

impl<R> RequestPool<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots currently linked into some handle.
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

/// A worker together with the pool its requests are tracked in.
#[derive(Debug)]
pub struct WorkerContext<O: RequestOps> {
    id: usize,
    ops: O,
    pool: RequestPool<O::Request>,
}

impl<O: RequestOps> WorkerContext<O> {
    pub fn new(id: usize, ops: O) -> Self {
        Self {
            id,
            ops,
            pool: RequestPool::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn pool(&self) -> &RequestPool<O::Request> {
        &self.pool
    }

    /// Return a request the caller does not want to track.
    pub fn release_untracked(&self, posted: Posted<O::Request>) {
        if let Posted::Pending(request) = posted {
            self.ops.release(request);
        }
    }
}

/// Notification to send once every request of a handle has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    pub remote_agent: String,
    pub msg: String,
}

/// The requests of one logical transfer, all on one worker.
pub struct RequestHandle<O: RequestOps> {
    ctx: Arc<WorkerContext<O>>,
    head: Option<SlotId>,
    len: usize,
    post_in_progress: bool,
    notification: Option<PendingNotification>,
}

impl<O: RequestOps> fmt::Debug for RequestHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("worker", &self.ctx.id())
            .field("head", &self.head)
            .field("len", &self.len)
            .field("post_in_progress", &self.post_in_progress)
            .field("notification", &self.notification)
            .finish()
    }
}

impl<O: RequestOps> RequestHandle<O> {
    pub fn new(ctx: Arc<WorkerContext<O>>) -> Self {
        Self {
            ctx,
            head: None,
            len: 0,
            post_in_progress: false,
            notification: None,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.ctx.id()
    }

    pub fn worker(&self) -> &Arc<WorkerContext<O>> {
        &self.ctx
    }

    /// Number of tracked requests.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn set_post_in_progress(&mut self, value: bool) {
        self.post_in_progress = value;
    }

    pub fn post_in_progress(&self) -> bool {
        self.post_in_progress
    }

    pub fn notification_mut(&mut self) -> &mut Option<PendingNotification> {
        &mut self.notification
    }

    /// Link a freshly posted, not yet complete request.
    pub fn append(&mut self, request: O::Request, am_buffer: Option<Bytes>) {
        let mut pool = self.ctx.pool.inner.lock();
        self.head = Some(pool.alloc(request, am_buffer, self.head));
        self.len += 1;
    }

    /// Track the outcome of a post; completed posts need nothing.
    pub fn track(&mut self, posted: Posted<O::Request>, am_buffer: Option<Bytes>) {
        if let Posted::Pending(request) = posted {
            self.append(request, am_buffer);
        }
    }

    /// Poll every incomplete request once.
    ///
    /// The first hard error is returned immediately and leaves the list as is.
    /// Otherwise completed requests are released back to the worker and the
    /// pool, and the handle reports whether anything is still in flight.
    pub fn status(&mut self) -> Result<XferStatus, TransportError> {
        if self.head.is_none() {
            return Ok(XferStatus::Complete);
        }

        let ops = &self.ctx.ops;
        let mut pool = self.ctx.pool.inner.lock();
        let mut out = XferStatus::Complete;

        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(slot) = pool.get_mut(id) else {
                tracing::error!(?id, "request handle references a recycled slot");
                break;
            };
            if !slot.completed
                && let Some(request) = slot.request.as_ref()
            {
                match ops.test(request)? {
                    XferStatus::Complete => slot.completed = true,
                    XferStatus::InProgress => out = XferStatus::InProgress,
                }
            }
            cursor = slot.next;
        }

        let mut cursor = self.head.take();
        let mut kept = None;
        let mut len = 0;
        while let Some(id) = cursor {
            let Some(slot) = pool.get_mut(id) else {
                break;
            };
            cursor = slot.next;
            if slot.completed {
                if let Some(request) = pool.free(id) {
                    ops.release(request);
                }
            } else {
                slot.next = kept;
                kept = Some(id);
                len += 1;
            }
        }
        self.head = kept;
        self.len = len;

        Ok(out)
    }

    /// Cancel everything still in flight and return every request to the worker.
    pub fn release(&mut self) {
        let Some(head) = self.head.take() else {
            return;
        };

        let ops = &self.ctx.ops;
        let mut pool = self.ctx.pool.inner.lock();
        let mut cancelled = 0usize;
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let Some(slot) = pool.get_mut(id) else {
                break;
            };
            cursor = slot.next;
            if !slot.completed
                && let Some(request) = slot.request.as_ref()
            {
                ops.cancel(request);
                cancelled += 1;
            }
            if let Some(request) = pool.free(id) {
                ops.release(request);
            }
        }
        self.len = 0;

        if cancelled > 0 {
            tracing::debug!(
                worker = self.ctx.id,
                cancelled,
                "released handle with incomplete requests"
            );
        }
    }
}

impl<O: RequestOps> Drop for RequestHandle<O> {
    fn drop(&mut self) {
        self.release();
    }
}

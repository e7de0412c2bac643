// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Delivery of peer notifications to the application.
//!
//! Notifications can arrive on two kinds of threads:
//! - the progress thread, which buffers them in a thread-local queue and
//!   periodically moves the whole batch into the shared queue under one lock
//! - any caller thread driving progress inline, which appends directly to the
//!   caller queue
//!
//! [`NotificationChannel::drain_into`] merges both queues into the caller's list.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{BackendError, Result};
use crate::protocol::{self, AmOpcode, NotificationMessage};
use crate::transport::{AmRecvAttrs, TransportError};

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub agent: String,
    pub msg: String,
}

impl Notification {
    pub fn new(agent: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            msg: msg.into(),
        }
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Batch owned by the progress thread of the channel with the given id.
    static PROGRESS_QUEUE: RefCell<Option<(u64, Vec<Notification>)>> = const { RefCell::new(None) };
}

#[derive(Debug)]
pub struct NotificationChannel {
    id: u64,
    caller: Mutex<Vec<Notification>>,
    shared: Mutex<Vec<Notification>>,
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationChannel {
    pub fn new() -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            caller: Mutex::new(Vec::new()),
            shared: Mutex::new(Vec::new()),
        }
    }

    /// Mark the calling thread as this channel's progress thread.
    pub fn attach_progress_thread(&self) {
        PROGRESS_QUEUE.with(|q| *q.borrow_mut() = Some((self.id, Vec::new())));
    }

    /// Flush and forget the calling thread's queue.
    pub fn detach_progress_thread(&self) {
        self.flush_progress_queue();
        PROGRESS_QUEUE.with(|q| {
            let mut q = q.borrow_mut();
            if q.as_ref().is_some_and(|(id, _)| *id == self.id) {
                *q = None;
            }
        });
    }

    pub fn is_progress_thread(&self) -> bool {
        PROGRESS_QUEUE.with(|q| q.borrow().as_ref().is_some_and(|(id, _)| *id == self.id))
    }

    /// Queue a received notification.
    pub fn deliver(&self, notification: Notification) {
        let notification = PROGRESS_QUEUE.with(|q| match q.borrow_mut().as_mut() {
            Some((id, batch)) if *id == self.id => {
                batch.push(notification);
                None
            }
            _ => Some(notification),
        });
        if let Some(notification) = notification {
            self.caller.lock().push(notification);
        }
    }

    /// Move the progress thread's batch into the shared queue.
    pub fn flush_progress_queue(&self) {
        let batch = PROGRESS_QUEUE.with(|q| match q.borrow_mut().as_mut() {
            Some((id, batch)) if *id == self.id && !batch.is_empty() => Some(std::mem::take(batch)),
            _ => None,
        });
        if let Some(mut batch) = batch {
            self.shared.lock().append(&mut batch);
        }
    }

    /// Move every visible notification into `dest`, which must be empty.
    pub fn drain_into(&self, dest: &mut Vec<Notification>) -> Result<()> {
        if !dest.is_empty() {
            return Err(BackendError::InvalidParam(
                "notification list must be empty".to_string(),
            ));
        }
        dest.append(&mut self.caller.lock());
        dest.append(&mut self.shared.lock());
        Ok(())
    }

    /// Active-message receive path for [`AmOpcode::Notification`].
    pub fn handle_message(
        &self,
        header: &[u8],
        payload: &[u8],
        attrs: AmRecvAttrs,
    ) -> std::result::Result<(), TransportError> {
        protocol::validate(AmOpcode::Notification, header, attrs)?;
        let NotificationMessage { name, msg } = NotificationMessage::decode(payload)?;
        tracing::trace!(agent = %name, len = msg.len(), "notification received");
        self.deliver(Notification::new(name, msg));
        Ok(())
    }
}

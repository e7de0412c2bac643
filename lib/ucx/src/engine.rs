// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The UCX backend engine.
//!
//! [`UcxEngine`] ties the pieces together:
//! - a pool of transport workers, each with its own request pool
//! - the [`ConnectionRegistry`] of remote agents
//! - the [`NotificationChannel`] fed by the notification active message
//! - the device context of the one accelerator this engine serves
//! - an optional [`ProgressThread`]
//!
//! Active-message handlers are installed on worker 0 only; its address is the
//! connection info handed to peers, so every peer endpoint lands there.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::backend::{
    BackendEngine, BackendInitParams, BackendMetadata, BackendReqHandle, BlobDesc, MemType,
    MetaDesc, XferOp, XferOptArgs, foreign_handle, foreign_metadata,
};
use crate::config::BackendConfig;
use crate::device::{DeviceContext, DeviceRuntime, PrimaryContext, PrimaryContextGuard};
use crate::error::{BackendError, Result, XferStatus};
use crate::metadata::{LocalMetadata, RemoteMetadata};
use crate::notify::{Notification, NotificationChannel};
use crate::progress::{ProgressSource, ProgressThread};
use crate::protocol::{self, AmHeader, AmOpcode, NotificationMessage};
use crate::registry::{ConnectionRegistry, RemoteConnection};
use crate::request::{PendingNotification, RequestHandle, WorkerContext};
use crate::sync::SyncLock;
use crate::transport::{
    AmRecvAttrs, AmSendFlags, ArmStatus, CostEstimate, CostMethod, Endpoint, EndpointOf,
    MemoryOf, Posted, RequestOf, RequestOps, Transport, TransportError, TransportParams, Worker,
    WorkerOf,
};

type XferHandle<T> = RequestHandle<WorkerOf<T>>;
type LocalMd<T> = LocalMetadata<MemoryOf<T>>;
type RemoteMd<T> = RemoteMetadata<EndpointOf<T>>;
type Registry<T> = ConnectionRegistry<EndpointOf<T>>;

fn native(err: TransportError) -> BackendError {
    BackendError::Backend(err.to_string())
}

fn local_md<T: Transport>(md: &BackendMetadata) -> Result<&LocalMd<T>> {
    md.downcast_ref::<LocalMd<T>>()
        .ok_or_else(|| foreign_metadata("local"))
}

fn remote_md<T: Transport>(md: &BackendMetadata) -> Result<&RemoteMd<T>> {
    md.downcast_ref::<RemoteMd<T>>()
        .ok_or_else(|| foreign_metadata("remote"))
}

/// State shared with the progress thread.
struct Shared<T: Transport> {
    workers: Vec<Arc<WorkerContext<WorkerOf<T>>>>,
    notifications: Arc<NotificationChannel>,
    device: DeviceContext,
}

impl<T: Transport> Shared<T> {
    fn worker(&self, id: usize) -> std::result::Result<&WorkerOf<T>, TransportError> {
        self.workers
            .get(id)
            .map(|w| w.ops())
            .ok_or_else(|| TransportError::InvalidParam(format!("no worker {id}")))
    }
}

impl<T: Transport> ProgressSource for Shared<T> {
    fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn event_fd(&self, worker: usize) -> std::result::Result<std::os::unix::io::RawFd, TransportError> {
        self.worker(worker)?.event_fd()
    }

    fn progress(&self, worker: usize) -> usize {
        self.worker(worker).map(|w| w.progress()).unwrap_or(0)
    }

    fn arm(&self, worker: usize) -> std::result::Result<ArmStatus, TransportError> {
        self.worker(worker)?.arm()
    }

    fn on_thread_start(&self) {
        if let Err(e) = self.device.apply() {
            tracing::warn!("failed to apply device context on progress thread: {e}");
        }
        self.notifications.attach_progress_thread();
    }

    fn on_primary_progress(&self) {
        self.notifications.flush_progress_queue();
    }

    fn on_thread_exit(&self) {
        self.notifications.detach_progress_thread();
    }
}

/// Transport backend engine over a [`Transport`].
pub struct UcxEngine<T: Transport> {
    progress: Option<ProgressThread>,
    local_agent: String,
    config: BackendConfig,
    transport: T,
    shared: Arc<Shared<T>>,
    address: Vec<u8>,
    registry: Arc<Registry<T>>,
    primary: PrimaryContext,
    sync: SyncLock,
    next_worker: AtomicUsize,
}

impl<T: Transport> std::fmt::Debug for UcxEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UcxEngine")
            .field("local_agent", &self.local_agent)
            .field("num_workers", &self.shared.workers.len())
            .field("progress_thread", &self.progress.is_some())
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> UcxEngine<T> {
    /// Build an engine from agent supplied init parameters.
    ///
    /// `open` creates the transport context from the resolved parameters.
    pub fn new<F>(init: &BackendInitParams, device: Arc<dyn DeviceRuntime>, open: F) -> Result<Self>
    where
        F: FnOnce(&TransportParams) -> std::result::Result<T, TransportError>,
    {
        Self::with_config(
            init.local_agent.clone(),
            BackendConfig::from_init(init),
            device,
            open,
        )
    }

    pub fn with_config<F>(
        local_agent: impl Into<String>,
        config: BackendConfig,
        device: Arc<dyn DeviceRuntime>,
        open: F,
    ) -> Result<Self>
    where
        F: FnOnce(&TransportParams) -> std::result::Result<T, TransportError>,
    {
        let local_agent = local_agent.into();
        let transport = open(&config.transport_params())
            .map_err(|e| BackendError::Backend(format!("failed to open transport: {e}")))?;

        if config.progress_thread && !transport.supports_multithreading() {
            return Err(BackendError::Backend(
                TransportError::MultiThreadingUnsupported.to_string(),
            ));
        }

        let num_workers = config.worker_count();
        let workers = (0..num_workers)
            .map(|id| {
                transport
                    .create_worker()
                    .map(|w| Arc::new(WorkerContext::new(id, w)))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BackendError::Backend(format!("failed to create worker: {e}")))?;
        let address = workers[0].ops().address().map_err(native)?;

        let registry = Arc::new(Registry::<T>::new());
        let notifications = Arc::new(NotificationChannel::new());
        install_handlers::<T>(workers[0].ops(), &registry, &notifications);

        let shared = Arc::new(Shared::<T> {
            workers,
            notifications,
            device: DeviceContext::new(device.clone(), config.cuda_address_workaround),
        });

        let progress = if config.progress_thread {
            let thread = ProgressThread::new(shared.clone(), config.poll_timeout_ms())?;
            thread.start()?;
            Some(thread)
        } else {
            None
        };

        tracing::debug!(
            agent = %local_agent,
            num_workers,
            progress_thread = progress.is_some(),
            thread_sync = ?config.thread_sync,
            "ucx engine initialized"
        );

        Ok(Self {
            progress,
            local_agent,
            sync: SyncLock::new(config.thread_sync),
            config,
            transport,
            shared,
            address,
            registry,
            primary: PrimaryContext::new(device),
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn local_agent(&self) -> &str {
        &self.local_agent
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn has_progress_thread(&self) -> bool {
        self.progress.is_some()
    }

    /// Device id this engine is bound to, once device memory was registered.
    pub fn device(&self) -> Option<u64> {
        self.shared.device.device()
    }

    /// Worker for the next request.
    fn pick_worker(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.shared.workers.len()
    }

    fn insert_connection(&self, remote_agent: &str, conn_info: &[u8]) -> Result<()> {
        if self.registry.contains(remote_agent) {
            return Err(BackendError::InvalidParam(format!(
                "connection info for {remote_agent} already loaded"
            )));
        }
        let conn = RemoteConnection::establish(remote_agent, conn_info, &self.shared.workers)?;
        self.registry.insert(conn)?;
        Ok(())
    }

    fn send_notification(
        &self,
        remote_agent: &str,
        msg: &str,
        worker: usize,
    ) -> Result<(Posted<RequestOf<T>>, Bytes)> {
        let conn = self.registry.get(remote_agent)?;
        let payload = NotificationMessage::new(self.local_agent.as_str(), msg)
            .encode()
            .map_err(native)?;
        let header = AmHeader::new(AmOpcode::Notification).encode();
        let posted = conn
            .endpoint(worker)?
            .send_am(
                AmOpcode::Notification.id(),
                &header,
                payload.clone(),
                AmSendFlags::eager(),
            )
            .map_err(native)?;
        Ok((posted, payload))
    }

    /// Send a notification whose completion is folded into `handle`.
    fn send_tracked_notification(
        &self,
        handle: &mut XferHandle<T>,
        remote_agent: &str,
        msg: &str,
    ) -> Result<()> {
        match self.send_notification(remote_agent, msg, handle.worker_id()) {
            Ok((posted, payload)) => {
                handle.track(posted, Some(payload));
                Ok(())
            }
            Err(e) => {
                handle.release();
                Err(e)
            }
        }
    }

    fn post_descriptors(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_>],
        remote: &[MetaDesc<'_>],
        handle: &mut XferHandle<T>,
    ) -> Result<()> {
        if local.len() != remote.len() {
            return Err(BackendError::InvalidParam(format!(
                "local ({}) and remote ({}) descriptor counts differ",
                local.len(),
                remote.len()
            )));
        }

        let wid = handle.worker_id();
        for (i, (l, r)) in local.iter().zip(remote).enumerate() {
            if l.len != r.len {
                return Err(BackendError::InvalidParam(format!(
                    "descriptor {i}: local length {} != remote length {}",
                    l.len, r.len
                )));
            }
            let lmd = local_md::<T>(l.metadata)?;
            let rmd = remote_md::<T>(r.metadata)?;
            let ep = rmd.conn().endpoint(wid)?;
            let rkey = rmd.rkey(wid)?;
            let raddr = r.addr as u64;

            let posted = match op {
                XferOp::Read => ep.read(raddr, rkey, l.addr, lmd.memory(), l.len),
                XferOp::Write => ep.write(l.addr, lmd.memory(), raddr, rkey, l.len),
            }
            .map_err(|e| BackendError::Backend(format!("descriptor {i}: {op:?} failed: {e}")))?;
            handle.track(posted, None);
        }

        // keeps the handle pending until the remote side has the data
        if let Some(first) = remote.first() {
            let rmd = remote_md::<T>(first.metadata)?;
            let posted = rmd
                .conn()
                .endpoint(wid)?
                .flush()
                .map_err(|e| BackendError::Backend(format!("endpoint flush failed: {e}")))?;
            handle.track(posted, None);
        }
        Ok(())
    }
}

fn install_handlers<T: Transport>(
    worker: &WorkerOf<T>,
    registry: &Arc<Registry<T>>,
    notifications: &Arc<NotificationChannel>,
) {
    let conns = Arc::downgrade(registry);
    worker.set_am_handler(
        AmOpcode::ConnectionCheck.id(),
        Arc::new(
            move |header: &[u8], payload: &[u8], attrs: AmRecvAttrs| {
                protocol::validate(AmOpcode::ConnectionCheck, header, attrs)?;
                let agent = protocol::decode_agent_name(payload)?;
                if !conns.upgrade().is_some_and(|r| r.contains(&agent)) {
                    return Err(TransportError::InvalidParam(format!(
                        "connection check from unknown agent {agent}"
                    )));
                }
                tracing::trace!(%agent, "connection check");
                Ok(())
            },
        ),
    );

    worker.set_am_handler(
        AmOpcode::Disconnect.id(),
        Arc::new(|header: &[u8], payload: &[u8], attrs: AmRecvAttrs| {
            protocol::validate(AmOpcode::Disconnect, header, attrs)?;
            let agent = protocol::decode_agent_name(payload)?;
            // the connection stays registered until the local owner ends it
            tracing::debug!(%agent, "peer disconnected");
            Ok(())
        }),
    );

    let channel = notifications.clone();
    worker.set_am_handler(
        AmOpcode::Notification.id(),
        Arc::new(move |header: &[u8], payload: &[u8], attrs: AmRecvAttrs| {
            channel.handle_message(header, payload, attrs)
        }),
    );
}

impl<T: Transport> BackendEngine for UcxEngine<T> {
    fn supported_mems(&self) -> Vec<MemType> {
        vec![MemType::Dram, MemType::Vram]
    }

    fn conn_info(&self) -> Result<Vec<u8>> {
        Ok(self.address.clone())
    }

    fn load_remote_conn_info(&self, remote_agent: &str, conn_info: &[u8]) -> Result<()> {
        let _guard = self.sync.lock();
        self.insert_connection(remote_agent, conn_info)?;
        tracing::debug!(agent = remote_agent, "loaded remote connection info");
        Ok(())
    }

    fn connect(&self, remote_agent: &str) -> Result<()> {
        let _guard = self.sync.lock();

        if remote_agent == self.local_agent {
            if self.registry.contains(remote_agent) {
                return Ok(());
            }
            return self.insert_connection(remote_agent, &self.address);
        }

        let conn = self.registry.get(remote_agent)?;
        let header = AmHeader::new(AmOpcode::ConnectionCheck).encode();
        let payload = Bytes::copy_from_slice(self.local_agent.as_bytes());

        let mut error = None;
        let mut pending = Vec::new();
        for (wid, ep) in conn.endpoints().iter().enumerate() {
            match ep.send_am(
                AmOpcode::ConnectionCheck.id(),
                &header,
                payload.clone(),
                AmSendFlags::eager(),
            ) {
                Ok(Posted::Complete) => {}
                Ok(Posted::Pending(req)) => pending.push((wid, req)),
                Err(e) => {
                    error = Some(BackendError::Backend(format!(
                        "connection check to {remote_agent} failed on worker {wid}: {e}"
                    )));
                    break;
                }
            }
        }

        // wait for local send completion only
        for (wid, req) in pending {
            let worker = self.shared.workers[wid].ops();
            loop {
                match worker.test(&req) {
                    Ok(XferStatus::Complete) => break,
                    Ok(XferStatus::InProgress) => {
                        worker.progress();
                    }
                    Err(e) => {
                        error.get_or_insert_with(|| {
                            BackendError::Backend(format!(
                                "connection check to {remote_agent} failed on worker {wid}: {e}"
                            ))
                        });
                        break;
                    }
                }
            }
            worker.release(req);
        }

        match error {
            Some(e) => Err(e),
            None => {
                tracing::debug!(agent = remote_agent, "connected");
                Ok(())
            }
        }
    }

    fn disconnect(&self, remote_agent: &str) -> Result<()> {
        let _guard = self.sync.lock();

        if remote_agent != self.local_agent {
            let conn = self.registry.get(remote_agent)?;
            let header = AmHeader::new(AmOpcode::Disconnect).encode();
            let payload = Bytes::copy_from_slice(self.local_agent.as_bytes());
            for (wid, ep) in conn.endpoints().iter().enumerate() {
                if !ep.tx_healthy() {
                    continue;
                }
                match ep.send_am(
                    AmOpcode::Disconnect.id(),
                    &header,
                    payload.clone(),
                    AmSendFlags::eager(),
                ) {
                    Ok(posted) => self.shared.workers[wid].release_untracked(posted),
                    Err(e) => {
                        tracing::debug!(agent = remote_agent, worker = wid, "disconnect notice not sent: {e}")
                    }
                }
            }
        }

        if self.registry.remove(remote_agent).is_ok() {
            tracing::debug!(agent = remote_agent, "disconnected");
        }
        Ok(())
    }

    fn check_conn(&self, remote_agent: &str) -> Result<()> {
        let _guard = self.sync.lock_shared();
        if self.registry.contains(remote_agent) {
            Ok(())
        } else {
            Err(BackendError::NotFound(format!("no connection to {remote_agent}")))
        }
    }

    fn end_conn(&self, remote_agent: &str) -> Result<()> {
        let _guard = self.sync.lock();
        self.registry.remove(remote_agent).map(|_| ())
    }

    fn register_mem(&self, mem: &BlobDesc, mem_type: MemType) -> Result<BackendMetadata> {
        let _guard = self.sync.lock();

        if mem_type == MemType::Vram {
            let restart = self.shared.device.update(mem.addr, mem.dev_id)?;
            if restart {
                if let Some(progress) = &self.progress
                    && let Err(e) = progress.restart()
                {
                    // the context stays committed, so no later registration retries this
                    tracing::warn!(
                        device = mem.dev_id,
                        "progress thread did not restart after device context change: {e}"
                    );
                    return Err(e);
                }
                self.shared.device.apply()?;
            }
        }

        let memory = self
            .transport
            .register_memory(mem.addr, mem.len, mem_type)
            .map_err(native)?;
        let rkey = self.transport.pack_remote_key(&memory).map_err(native)?;
        tracing::trace!(addr = mem.addr, len = mem.len, ?mem_type, "registered memory");
        Ok(BackendMetadata::new(LocalMd::<T>::new(memory, rkey, mem_type)))
    }

    fn deregister_mem(&self, metadata: BackendMetadata) -> Result<()> {
        let _guard = self.sync.lock();
        let local = metadata
            .downcast::<LocalMd<T>>()
            .map_err(|_| foreign_metadata("local"))?;
        self.transport.deregister_memory(local.into_memory());
        Ok(())
    }

    fn public_data(&self, metadata: &BackendMetadata) -> Result<Vec<u8>> {
        Ok(local_md::<T>(metadata)?.packed_rkey().to_vec())
    }

    fn load_local_md(&self, metadata: &BackendMetadata) -> Result<BackendMetadata> {
        let _guard = self.sync.lock_shared();
        let local = local_md::<T>(metadata)?;
        let conn = self.registry.get(&self.local_agent)?;
        let remote = RemoteMd::<T>::import(conn, local.packed_rkey())?;
        Ok(BackendMetadata::new(remote))
    }

    fn load_remote_md(
        &self,
        input: &BlobDesc,
        mem_type: MemType,
        remote_agent: &str,
    ) -> Result<BackendMetadata> {
        let _guard = self.sync.lock_shared();
        // any device will do, the transport resolves the right one when sending
        let _ctx = PrimaryContextGuard::enter(mem_type, &self.primary);
        let conn = self.registry.get(remote_agent)?;
        let remote = RemoteMd::<T>::import(conn, &input.meta_info)?;
        Ok(BackendMetadata::new(remote))
    }

    fn unload_md(&self, metadata: BackendMetadata) -> Result<()> {
        let _guard = self.sync.lock_shared();
        let remote = metadata
            .downcast::<RemoteMd<T>>()
            .map_err(|_| foreign_metadata("remote"))?;
        drop(remote);
        Ok(())
    }

    fn prep_xfer(
        &self,
        _op: XferOp,
        _local: &[MetaDesc<'_>],
        _remote: &[MetaDesc<'_>],
        _remote_agent: &str,
        _opt_args: Option<&XferOptArgs>,
    ) -> Result<BackendReqHandle> {
        let worker = self.shared.workers[self.pick_worker()].clone();
        Ok(BackendReqHandle::new(XferHandle::<T>::new(worker)))
    }

    fn estimate_xfer_cost(
        &self,
        _op: XferOp,
        local: &[MetaDesc<'_>],
        remote: &[MetaDesc<'_>],
        _remote_agent: &str,
        handle: &BackendReqHandle,
    ) -> Result<CostEstimate> {
        let wid = handle
            .downcast_ref::<XferHandle<T>>()
            .ok_or_else(foreign_handle)?
            .worker_id();

        if local.len() != remote.len() {
            return Err(BackendError::Mismatch(format!(
                "local ({}) and remote ({}) descriptor lists differ in size",
                local.len(),
                remote.len()
            )));
        }

        let mut total = CostEstimate {
            duration: Duration::ZERO,
            err_margin: Duration::ZERO,
            method: CostMethod::AnalyticalBackend,
        };
        for (i, (l, r)) in local.iter().zip(remote).enumerate() {
            if l.len != r.len {
                return Err(BackendError::InvalidParam(format!(
                    "descriptor {i}: local length {} != remote length {}",
                    l.len, r.len
                )));
            }
            local_md::<T>(l.metadata)?;
            let rmd = remote_md::<T>(r.metadata)?;
            let estimate = rmd
                .conn()
                .endpoint(wid)?
                .estimate_cost(l.len)
                .map_err(native)?;
            total.duration += estimate.duration;
            total.err_margin += estimate.err_margin;
            total.method = estimate.method;
        }
        Ok(total)
    }

    fn post_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_>],
        remote: &[MetaDesc<'_>],
        remote_agent: &str,
        handle: &mut BackendReqHandle,
        opt_args: Option<&XferOptArgs>,
    ) -> Result<XferStatus> {
        let _guard = self.sync.lock_shared();
        if let Err(e) = self.shared.device.apply() {
            tracing::debug!("failed to apply device context: {e}");
        }
        let handle = handle
            .downcast_mut::<XferHandle<T>>()
            .ok_or_else(foreign_handle)?;

        handle.set_post_in_progress(true);
        let posted = self.post_descriptors(op, local, remote, handle);
        handle.set_post_in_progress(false);
        if let Err(e) = posted {
            handle.release();
            return Err(e);
        }

        let mut status = handle.status().map_err(native)?;
        if let Some(msg) = opt_args.and_then(|args| args.notification.as_deref()) {
            match status {
                XferStatus::Complete => {
                    self.send_tracked_notification(handle, remote_agent, msg)?;
                    status = handle.status().map_err(native)?;
                }
                XferStatus::InProgress => {
                    *handle.notification_mut() = Some(PendingNotification {
                        remote_agent: remote_agent.to_string(),
                        msg: msg.to_string(),
                    });
                }
            }
        }
        Ok(status)
    }

    fn check_xfer(&self, handle: &mut BackendReqHandle) -> Result<XferStatus> {
        let _guard = self.sync.lock_shared();
        let handle = handle
            .downcast_mut::<XferHandle<T>>()
            .ok_or_else(foreign_handle)?;

        if handle.post_in_progress() {
            return Ok(XferStatus::InProgress);
        }

        let mut status = handle.status().map_err(native)?;
        if status.is_complete()
            && let Some(notif) = handle.notification_mut().take()
        {
            self.send_tracked_notification(handle, &notif.remote_agent, &notif.msg)?;
            status = handle.status().map_err(native)?;
        }
        Ok(status)
    }

    fn release_req_handle(&self, handle: BackendReqHandle) -> Result<()> {
        let mut handle = handle
            .downcast::<XferHandle<T>>()
            .map_err(|_| foreign_handle())?;
        handle.release();
        Ok(())
    }

    fn progress(&self) -> usize {
        self.shared
            .workers
            .iter()
            .map(|w| w.ops().progress())
            .sum()
    }

    fn get_notifs(&self, dest: &mut Vec<Notification>) -> Result<()> {
        if !dest.is_empty() {
            return Err(BackendError::InvalidParam(
                "notification list must be empty".to_string(),
            ));
        }
        if self.progress.is_none() {
            while self.progress() > 0 {}
        }
        self.shared.notifications.drain_into(dest)
    }

    fn gen_notif(&self, remote_agent: &str, msg: &str) -> Result<()> {
        let _guard = self.sync.lock_shared();
        let wid = self.pick_worker();
        let (posted, _payload) = self.send_notification(remote_agent, msg, wid)?;
        self.shared.workers[wid].release_untracked(posted);
        Ok(())
    }
}

impl<T: Transport> Drop for UcxEngine<T> {
    fn drop(&mut self) {
        if let Some(progress) = &self.progress {
            progress.stop();
        }
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! UCX transport backend for point-to-point data movement.
//!
//! The backend moves bytes between registered host and device memory regions
//! of different agents and carries small notifications between them. It is
//! driven through the [`BackendEngine`] trait; [`UcxEngine`] implements it on
//! top of any [`transport::Transport`].

pub mod backend;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod notify;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod sync;
pub mod transport;
pub mod wake;

pub use backend::{
    BackendEngine, BackendInitParams, BackendMetadata, BackendReqHandle, BlobDesc, MemType,
    MetaDesc, XferOp, XferOptArgs,
};
pub use config::BackendConfig;
pub use engine::UcxEngine;
pub use error::{BackendError, Result, StatusCode, XferStatus};
pub use notify::Notification;
pub use sync::ThreadSync;

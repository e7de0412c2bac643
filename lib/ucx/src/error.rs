// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Status and error types shared by every layer of the backend.

use thiserror::Error;

use crate::device::DeviceError;
use crate::transport::TransportError;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by the backend engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The peer, connection or metadata the call refers to does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call itself was malformed.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The native transport reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The request conflicts with the device/context this engine is bound to.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Local and remote descriptor lists disagree.
    #[error("mismatch: {0}")]
    Mismatch(String),
}

impl BackendError {
    /// Flat status code for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            BackendError::NotFound(_) => StatusCode::NotFound,
            BackendError::InvalidParam(_) => StatusCode::InvalidParam,
            BackendError::Backend(_) => StatusCode::Backend,
            BackendError::NotSupported(_) => StatusCode::NotSupported,
            BackendError::Mismatch(_) => StatusCode::Mismatch,
        }
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidParam(msg) => BackendError::InvalidParam(msg),
            other => BackendError::Backend(other.to_string()),
        }
    }
}

impl From<DeviceError> for BackendError {
    fn from(err: DeviceError) -> Self {
        BackendError::NotSupported(err.to_string())
    }
}

/// Progress state of an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XferStatus {
    /// Every operation tracked by the request has completed.
    Complete,

    /// At least one operation is still outstanding.
    InProgress,
}

impl XferStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, XferStatus::Complete)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, XferStatus::InProgress)
    }
}

/// The flat status taxonomy exposed to callers that do not match on [`BackendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    InProgress,
    NotFound,
    InvalidParam,
    Backend,
    NotSupported,
    Mismatch,
}

impl StatusCode {
    /// Collapse a transfer result into its status code.
    pub fn from_result(result: &Result<XferStatus>) -> Self {
        match result {
            Ok(XferStatus::Complete) => StatusCode::Success,
            Ok(XferStatus::InProgress) => StatusCode::InProgress,
            Err(e) => e.code(),
        }
    }

    /// `InProgress` is a pending state, not an error.
    pub fn is_error(&self) -> bool {
        !matches!(self, StatusCode::Success | StatusCode::InProgress)
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the transfer engine.

use thiserror::Error;

use crate::descriptor::SegmentKind;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, XferError>;

/// Errors surfaced by the agent and by backend plugins.
///
/// Validation errors are reported synchronously by the call that detects
/// them. Failures discovered while a transfer executes are reported through
/// the terminal error status of the request instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum XferError {
    #[error("descriptor error: {0}")]
    Descriptor(String),

    #[error("not registered: {0}")]
    NotRegistered(String),

    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    #[error("no backend supports {src} -> {dst} transfers")]
    NoSuitableBackend { src: SegmentKind, dst: SegmentKind },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("request is busy: {0}")]
    RequestBusy(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("backend {backend} transport error (code {code}): {message}")]
    BackendTransport {
        backend: String,
        code: i32,
        message: String,
    },
}

impl XferError {
    pub(crate) fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    pub(crate) fn not_registered(msg: impl Into<String>) -> Self {
        Self::NotRegistered(msg.into())
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) fn invalid_handle(msg: impl Into<String>) -> Self {
        Self::InvalidHandle(msg.into())
    }
}

/// Diagnostic carried by a transfer that failed inside a backend.
///
/// `code` is the backend's own diagnostic code (an errno for the POSIX
/// backend).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: i32,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Convert into the engine error, tagging it with the backend that raised it.
    pub fn into_xfer_error(self, backend: &str) -> XferError {
        XferError::BackendTransport {
            backend: backend.to_string(),
            code: self.code,
            message: self.message,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

impl From<anyhow::Error> for XferError {
    fn from(err: anyhow::Error) -> Self {
        XferError::InvalidConfig(format!("{err:#}"))
    }
}

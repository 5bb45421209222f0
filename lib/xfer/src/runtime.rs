// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tokio runtime used by an agent's backends and notification handler.

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::error::{Result, XferError};

/// Either the runtime the agent was created in, or one the agent owns.
#[derive(Debug, Clone)]
pub(crate) enum TokioRuntime {
    Handle(tokio::runtime::Handle),
    Shared(Arc<OwnedRuntime>),
}

impl TokioRuntime {
    /// Reuse the ambient runtime if there is one, otherwise build one sized
    /// by `config`.
    pub(crate) fn from_config(config: &AgentConfig) -> Result<Self> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Ok(TokioRuntime::Handle(handle)),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .worker_threads(config.num_workers)
                    .max_blocking_threads(config.max_blocking_threads)
                    .thread_name("xfer-worker")
                    .build()
                    .map_err(|e| {
                        XferError::invalid_config(format!("failed to build tokio runtime: {e}"))
                    })?;
                let handle = runtime.handle().clone();
                Ok(TokioRuntime::Shared(Arc::new(OwnedRuntime {
                    runtime: Some(runtime),
                    handle,
                })))
            }
        }
    }

    pub(crate) fn handle(&self) -> &tokio::runtime::Handle {
        match self {
            TokioRuntime::Handle(handle) => handle,
            TokioRuntime::Shared(owned) => &owned.handle,
        }
    }

    pub(crate) fn is_owned(&self) -> bool {
        matches!(self, TokioRuntime::Shared(_))
    }
}

/// A runtime that shuts down without blocking when dropped, so an agent can
/// be dropped from inside async code.
#[derive(Debug)]
pub(crate) struct OwnedRuntime {
    runtime: Option<tokio::runtime::Runtime>,
    handle: tokio::runtime::Handle,
}

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

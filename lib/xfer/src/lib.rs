// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamo transfer engine.
//!
//! Moves bytes between memory and storage segments through pluggable
//! backends:
//! - [`DescriptorList`]: typed byte ranges, canonicalized by [`DescriptorList::trim`]
//! - [`Backend`] / [`BackendFactory`]: the plugin contract, with the built-in
//!   `MEMCPY` and `POSIX` backends
//! - [`Agent`]: backend creation, registration, and the transfer request
//!   lifecycle (`create -> post -> poll -> release`)

pub mod agent;
pub mod backends;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod logging;
pub mod notifications;
pub mod registration;
pub mod request;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

mod arena;
mod registry;
mod runtime;

pub use agent::Agent;
pub use arena::{BackendHandle, XferReqHandle};
pub use backends::{
    Backend, BackendCapabilities, BackendFactory, BackendInitContext, BackendParams,
    BackendStatus, BackendXferHandle, TransferSpec,
};
pub use config::{AgentConfig, AgentConfigBuilder, BackendEnvConfig};
pub use descriptor::{Descriptor, DescriptorList, SegmentKind, XferSegment};
pub use error::{Result, TransportError, XferError};
pub use notifications::TransferCompleteNotification;
pub use registration::RegionInfo;
pub use request::{XferOp, XferOptions, XferStatus};

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host memcpy backend for DRAM to DRAM transfers.

use std::sync::Arc;

use tracing::trace;

use super::{
    Backend, BackendCapabilities, BackendFactory, BackendInitContext, BackendParams,
    BackendStatus, BackendXferHandle, CompletionCell, InflightLimiter, RegionSet, TransferSpec,
};
use crate::descriptor::{DescriptorList, SegmentKind};
use crate::error::{Result, XferError};
use crate::request::XferOp;

pub const MEMCPY: &str = "MEMCPY";

const MAX_INFLIGHT: &str = "max_inflight";
const DEFAULT_MAX_INFLIGHT: usize = 64;

/// Plugin for [`MemcpyBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemcpyFactory;

impl BackendFactory for MemcpyFactory {
    fn name(&self) -> &str {
        MEMCPY
    }

    fn supported_segments(&self) -> Vec<SegmentKind> {
        vec![SegmentKind::Dram]
    }

    fn default_params(&self) -> BackendParams {
        BackendParams::new().with(MAX_INFLIGHT, DEFAULT_MAX_INFLIGHT.to_string())
    }

    fn create(&self, params: &BackendParams, ctx: &BackendInitContext) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(MemcpyBackend::new(params, ctx)?))
    }
}

/// Copies between host buffers on the runtime's blocking pool.
#[derive(Debug)]
pub struct MemcpyBackend {
    params: BackendParams,
    capabilities: BackendCapabilities,
    regions: RegionSet,
    limiter: InflightLimiter,
    runtime: tokio::runtime::Handle,
}

#[derive(Debug)]
struct MemcpyXfer {
    spec: Arc<TransferSpec>,
    cell: Arc<CompletionCell>,
}

impl MemcpyBackend {
    pub fn new(params: &BackendParams, ctx: &BackendInitContext) -> Result<Self> {
        params.ensure_known(MEMCPY, &[MAX_INFLIGHT])?;
        let params = MemcpyFactory.default_params().merged(params);

        let max_inflight: usize = params.parse_or(MAX_INFLIGHT, DEFAULT_MAX_INFLIGHT)?;
        if max_inflight == 0 {
            return Err(XferError::invalid_config(format!(
                "{MEMCPY} option '{MAX_INFLIGHT}' must be at least 1"
            )));
        }

        Ok(Self {
            params,
            capabilities: BackendCapabilities::new().with_pair(SegmentKind::Dram, SegmentKind::Dram),
            regions: RegionSet::new(),
            limiter: InflightLimiter::new(max_inflight),
            runtime: ctx.runtime.clone(),
        })
    }

    fn state<'a>(&self, handle: &'a BackendXferHandle) -> Result<&'a MemcpyXfer> {
        handle.downcast_ref::<MemcpyXfer>().ok_or_else(|| {
            XferError::invalid_handle(format!("{MEMCPY} was given a foreign transfer handle"))
        })
    }
}

impl Backend for MemcpyBackend {
    fn name(&self) -> &str {
        MEMCPY
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn params(&self) -> &BackendParams {
        &self.params
    }

    fn register_memory(&self, list: &DescriptorList) -> Result<()> {
        if list.kind() != SegmentKind::Dram {
            return Ok(());
        }
        self.regions.insert_all(list);
        Ok(())
    }

    fn deregister_memory(&self, list: &DescriptorList) -> Result<()> {
        self.regions.remove_all(MEMCPY, list)
    }

    fn create_transfer(&self, spec: TransferSpec) -> Result<BackendXferHandle> {
        if spec.remote.is_some() {
            return Err(XferError::invalid_config(format!(
                "{MEMCPY} cannot reach remote agents"
            )));
        }
        Ok(BackendXferHandle::new(MemcpyXfer {
            spec: Arc::new(spec),
            cell: Arc::new(CompletionCell::new()),
        }))
    }

    fn post_transfer(&self, handle: &BackendXferHandle) -> Result<()> {
        let xfer = self.state(handle)?;
        let permit = self.limiter.try_acquire(MEMCPY)?;
        if !xfer.cell.begin() {
            return Err(XferError::RequestBusy(format!(
                "{MEMCPY} transfer is still running"
            )));
        }

        let spec = xfer.spec.clone();
        let cell = xfer.cell.clone();
        self.runtime.spawn_blocking(move || {
            for segment in &spec.segments {
                let (from, to) = match spec.op {
                    XferOp::Write => (segment.src, segment.dst),
                    XferOp::Read => (segment.dst, segment.src),
                };
                trace!(from = from.addr, to = to.addr, len = from.len, "memcpy segment");

                // SAFETY: both ranges were registered as host memory and the
                // caller keeps them alive until the transfer completes.
                unsafe {
                    std::ptr::copy(
                        from.addr as usize as *const u8,
                        to.addr as usize as *mut u8,
                        from.len as usize,
                    );
                }
            }
            drop(permit);
            cell.complete();
        });

        Ok(())
    }

    fn poll_status(&self, handle: &BackendXferHandle) -> BackendStatus {
        match self.state(handle) {
            Ok(xfer) => xfer.cell.status(),
            Err(e) => BackendStatus::Error(crate::error::TransportError::new(-1, e.to_string())),
        }
    }

    fn release_transfer(&self, handle: BackendXferHandle) -> Result<()> {
        let xfer = self.state(&handle)?;
        if xfer.cell.is_running() {
            return Err(XferError::RequestBusy(format!(
                "{MEMCPY} transfer is still running"
            )));
        }
        Ok(())
    }
}

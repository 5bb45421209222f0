// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! POSIX positional I/O backend.
//!
//! Moves bytes between host memory and files or block devices with
//! `pread`/`pwrite`. For the storage side of a transfer the descriptor
//! `region_id` is an open file descriptor owned by the caller and `addr` is a
//! byte offset into it.

use std::collections::BTreeSet;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use tracing::{trace, warn};

use super::{
    Backend, BackendCapabilities, BackendFactory, BackendInitContext, BackendParams,
    BackendStatus, BackendXferHandle, CompletionCell, InflightLimiter, RegionSet, TransferSpec,
};
use crate::descriptor::{Descriptor, DescriptorList, SegmentKind};
use crate::error::{Result, TransportError, XferError};
use crate::request::XferOp;

pub const POSIX: &str = "POSIX";

const MAX_INFLIGHT: &str = "max_inflight";
const SYNC_WRITES: &str = "sync_writes";
const DEFAULT_MAX_INFLIGHT: usize = 32;

/// Plugin for [`PosixBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixFactory;

impl BackendFactory for PosixFactory {
    fn name(&self) -> &str {
        POSIX
    }

    fn supported_segments(&self) -> Vec<SegmentKind> {
        vec![SegmentKind::Dram, SegmentKind::File, SegmentKind::Block]
    }

    fn default_params(&self) -> BackendParams {
        BackendParams::new()
            .with(MAX_INFLIGHT, DEFAULT_MAX_INFLIGHT.to_string())
            .with(SYNC_WRITES, "false")
    }

    fn create(&self, params: &BackendParams, ctx: &BackendInitContext) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(PosixBackend::new(params, ctx)?))
    }
}

#[derive(Debug)]
pub struct PosixBackend {
    params: BackendParams,
    capabilities: BackendCapabilities,
    regions: RegionSet,
    limiter: InflightLimiter,
    sync_writes: bool,
    runtime: tokio::runtime::Handle,
}

#[derive(Debug)]
struct PosixXfer {
    spec: Arc<TransferSpec>,
    cell: Arc<CompletionCell>,
}

impl PosixBackend {
    pub fn new(params: &BackendParams, ctx: &BackendInitContext) -> Result<Self> {
        params.ensure_known(POSIX, &[MAX_INFLIGHT, SYNC_WRITES])?;
        let params = PosixFactory.default_params().merged(params);

        let max_inflight: usize = params.parse_or(MAX_INFLIGHT, DEFAULT_MAX_INFLIGHT)?;
        if max_inflight == 0 {
            return Err(XferError::invalid_config(format!(
                "{POSIX} option '{MAX_INFLIGHT}' must be at least 1"
            )));
        }
        let sync_writes = params.bool_or(SYNC_WRITES, false)?;

        Ok(Self {
            params,
            capabilities: BackendCapabilities::new()
                .with_bidirectional(SegmentKind::Dram, SegmentKind::File)
                .with_bidirectional(SegmentKind::Dram, SegmentKind::Block),
            regions: RegionSet::new(),
            limiter: InflightLimiter::new(max_inflight),
            sync_writes,
            runtime: ctx.runtime.clone(),
        })
    }

    fn state<'a>(&self, handle: &'a BackendXferHandle) -> Result<&'a PosixXfer> {
        handle.downcast_ref::<PosixXfer>().ok_or_else(|| {
            XferError::invalid_handle(format!("{POSIX} was given a foreign transfer handle"))
        })
    }
}

impl Backend for PosixBackend {
    fn name(&self) -> &str {
        POSIX
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn params(&self) -> &BackendParams {
        &self.params
    }

    fn register_memory(&self, list: &DescriptorList) -> Result<()> {
        if !self.capabilities.is_interested(list.kind()) {
            return Ok(());
        }
        if list.kind().is_storage() {
            if let Some(desc) = list.iter().find(|d| d.region_id < 0) {
                return Err(XferError::descriptor(format!(
                    "{} region {} is not a valid file descriptor",
                    list.kind(),
                    desc.region_id
                )));
            }
        }
        self.regions.insert_all(list);
        Ok(())
    }

    fn deregister_memory(&self, list: &DescriptorList) -> Result<()> {
        self.regions.remove_all(POSIX, list)
    }

    fn create_transfer(&self, spec: TransferSpec) -> Result<BackendXferHandle> {
        if spec.remote.is_some() {
            return Err(XferError::invalid_config(format!(
                "{POSIX} cannot reach remote agents"
            )));
        }
        if !self.supports(spec.src_kind, spec.dst_kind) {
            return Err(XferError::NoSuitableBackend {
                src: spec.src_kind,
                dst: spec.dst_kind,
            });
        }
        Ok(BackendXferHandle::new(PosixXfer {
            spec: Arc::new(spec),
            cell: Arc::new(CompletionCell::new()),
        }))
    }

    fn post_transfer(&self, handle: &BackendXferHandle) -> Result<()> {
        let xfer = self.state(handle)?;
        let permit = self.limiter.try_acquire(POSIX)?;
        if !xfer.cell.begin() {
            return Err(XferError::RequestBusy(format!(
                "{POSIX} transfer is still running"
            )));
        }

        let spec = xfer.spec.clone();
        let cell = xfer.cell.clone();
        let sync_writes = self.sync_writes;
        self.runtime.spawn_blocking(move || {
            let result = execute(&spec, sync_writes);
            drop(permit);
            match result {
                Ok(()) => cell.complete(),
                Err(e) => {
                    warn!(error = %e, "{POSIX} transfer failed");
                    cell.fail(e);
                }
            }
        });

        Ok(())
    }

    fn poll_status(&self, handle: &BackendXferHandle) -> BackendStatus {
        match self.state(handle) {
            Ok(xfer) => xfer.cell.status(),
            Err(e) => BackendStatus::Error(TransportError::new(-1, e.to_string())),
        }
    }

    fn release_transfer(&self, handle: BackendXferHandle) -> Result<()> {
        let xfer = self.state(&handle)?;
        if xfer.cell.is_running() {
            return Err(XferError::RequestBusy(format!(
                "{POSIX} transfer is still running"
            )));
        }
        Ok(())
    }
}

fn execute(spec: &TransferSpec, sync_writes: bool) -> std::result::Result<(), TransportError> {
    let (from_kind, to_kind) = match spec.op {
        XferOp::Write => (spec.src_kind, spec.dst_kind),
        XferOp::Read => (spec.dst_kind, spec.src_kind),
    };

    let mut written: BTreeSet<RawFd> = BTreeSet::new();
    for segment in &spec.segments {
        let (from, to) = match spec.op {
            XferOp::Write => (segment.src, segment.dst),
            XferOp::Read => (segment.dst, segment.src),
        };

        if to_kind.is_storage() && !from_kind.is_storage() {
            write_at(&from, &to)?;
            written.insert(to.region_id);
        } else if from_kind.is_storage() && !to_kind.is_storage() {
            read_at(&from, &to)?;
        } else {
            return Err(TransportError::new(
                Errno::EINVAL as i32,
                format!("cannot move {from_kind} to {to_kind}"),
            ));
        }
    }

    if sync_writes {
        for fd in written {
            nix::unistd::fdatasync(fd).map_err(|e| errno_error(e, "fdatasync", fd))?;
        }
    }
    Ok(())
}

fn write_at(mem: &Descriptor, file: &Descriptor) -> std::result::Result<(), TransportError> {
    trace!(fd = file.region_id, offset = file.addr, len = mem.len, "pwrite");

    // SAFETY: the memory range was registered by the caller and stays valid
    // until the transfer completes.
    let buf = unsafe { std::slice::from_raw_parts(mem.addr as usize as *const u8, mem.len as usize) };
    // SAFETY: the descriptor stays open while it is registered.
    let fd = unsafe { BorrowedFd::borrow_raw(file.region_id) };

    let mut done = 0usize;
    while done < buf.len() {
        let offset = offset_of(file, done)?;
        match nix::sys::uio::pwrite(fd, &buf[done..], offset) {
            Ok(0) => {
                return Err(TransportError::new(
                    Errno::EIO as i32,
                    format!("pwrite to fd {} made no progress", file.region_id),
                ));
            }
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(errno_error(e, "pwrite", file.region_id)),
        }
    }
    Ok(())
}

fn read_at(file: &Descriptor, mem: &Descriptor) -> std::result::Result<(), TransportError> {
    trace!(fd = file.region_id, offset = file.addr, len = mem.len, "pread");

    // SAFETY: the memory range was registered by the caller, is not shared
    // with any other in-flight read, and stays valid until completion.
    let buf =
        unsafe { std::slice::from_raw_parts_mut(mem.addr as usize as *mut u8, mem.len as usize) };
    // SAFETY: the descriptor stays open while it is registered.
    let fd = unsafe { BorrowedFd::borrow_raw(file.region_id) };

    let mut done = 0usize;
    while done < buf.len() {
        let offset = offset_of(file, done)?;
        match nix::sys::uio::pread(fd, &mut buf[done..], offset) {
            Ok(0) => {
                return Err(TransportError::new(
                    Errno::EIO as i32,
                    format!(
                        "unexpected end of file on fd {} at offset {}",
                        file.region_id, offset
                    ),
                ));
            }
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(errno_error(e, "pread", file.region_id)),
        }
    }
    Ok(())
}

fn offset_of(file: &Descriptor, done: usize) -> std::result::Result<nix::libc::off_t, TransportError> {
    file.addr
        .checked_add(done as u64)
        .and_then(|o| nix::libc::off_t::try_from(o).ok())
        .ok_or_else(|| {
            TransportError::new(
                Errno::EOVERFLOW as i32,
                format!("offset {} overflows off_t", file.addr),
            )
        })
}

fn errno_error(errno: Errno, op: &str, fd: RawFd) -> TransportError {
    TransportError::new(errno as i32, format!("{op} on fd {fd} failed: {}", errno.desc()))
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer requests and their lifecycle.
//!
//! ```text
//! Created --post--> Posting --backend accepted--> InProgress --poll--> Done | Error
//!    ^                  |                                              |
//!    |                  +--backend rejected--> Error                   |
//!    +------------------------ repost <--------------------------------+
//! ```
//!
//! `Posting` is internal and reported as in progress. Release moves a `Done`
//! or `Error` request to `Released`, after which the handle is dead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use crate::arena::{BackendHandle, XferReqHandle};
use crate::backends::{Backend, BackendStatus, BackendXferHandle};
use crate::descriptor::SegmentKind;
use crate::error::{Result, TransportError, XferError};

/// Transfer direction, from the initiator's point of view.
///
/// `Write` moves bytes from the local (src) list to the target (dst) list,
/// `Read` moves bytes from the target list into the local list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum XferOp {
    Read,
    Write,
}

/// Caller-visible status of a transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XferStatus {
    /// Created, never posted.
    Created,

    /// Posted and not yet finished.
    InProgress,

    Done,

    /// The backend reported a transport failure, or the post was rejected.
    Error(TransportError),
}

impl XferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, XferStatus::Done | XferStatus::Error(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, XferStatus::Done)
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XferOptions {
    /// Backend types allowed to serve the request, most preferred first.
    /// Empty means any backend.
    pub backends: Vec<String>,
}

impl XferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backends.push(backend.into().to_uppercase());
        self
    }
}

const CREATED: u8 = 0;
const POSTING: u8 = 1;
const IN_PROGRESS: u8 = 2;
const DONE: u8 = 3;
const ERROR: u8 = 4;
const RELEASED: u8 = 5;

/// The state word packs the run number above the state byte. Every post
/// starts a new run, so an outcome polled for an earlier run can never
/// settle a later one.
fn pack(run: u64, state: u8) -> u64 {
    (run << 8) | state as u64
}

fn state_of(word: u64) -> u8 {
    (word & 0xff) as u8
}

fn run_of(word: u64) -> u64 {
    word >> 8
}

/// A transfer request owned by an agent.
///
/// Requests hold their backend directly so status queries never touch the
/// agent's control-plane lock.
#[derive(Debug)]
pub(crate) struct XferRequest {
    handle: XferReqHandle,
    op: XferOp,
    src_kind: SegmentKind,
    dst_kind: SegmentKind,
    remote: Option<String>,
    total_bytes: u64,
    backend: BackendHandle,
    engine: Arc<dyn Backend>,
    xfer: BackendXferHandle,
    state: AtomicU64,
    // written only while the state moves to ERROR, under this lock
    error: Mutex<Option<TransportError>>,
    created_at: Instant,
}

pub(crate) struct XferRequestParts {
    pub op: XferOp,
    pub src_kind: SegmentKind,
    pub dst_kind: SegmentKind,
    pub remote: Option<String>,
    pub total_bytes: u64,
    pub backend: BackendHandle,
    pub engine: Arc<dyn Backend>,
    pub xfer: BackendXferHandle,
}

/// State a request held before it was marked released, so a failed backend
/// release can put it back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReleaseToken(u64);

impl XferRequest {
    pub(crate) fn new(handle: XferReqHandle, parts: XferRequestParts) -> Self {
        Self {
            handle,
            op: parts.op,
            src_kind: parts.src_kind,
            dst_kind: parts.dst_kind,
            remote: parts.remote,
            total_bytes: parts.total_bytes,
            backend: parts.backend,
            engine: parts.engine,
            xfer: parts.xfer,
            state: AtomicU64::new(pack(0, CREATED)),
            error: Mutex::new(None),
            created_at: Instant::now(),
        }
    }

    pub(crate) fn handle(&self) -> XferReqHandle {
        self.handle
    }

    pub(crate) fn backend(&self) -> BackendHandle {
        self.backend
    }

    pub(crate) fn backend_name(&self) -> &str {
        self.engine.name()
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True while the backend may still be moving data.
    pub(crate) fn is_running(&self) -> bool {
        matches!(
            state_of(self.state.load(Ordering::Acquire)),
            POSTING | IN_PROGRESS
        )
    }

    /// Non-blocking status query. Safe to call from many threads at once.
    pub(crate) fn status(&self) -> Result<XferStatus> {
        loop {
            let word = self.state.load(Ordering::Acquire);
            let polled = match state_of(word) {
                CREATED => return Ok(XferStatus::Created),
                POSTING => return Ok(XferStatus::InProgress),
                IN_PROGRESS => self.engine.poll_status(&self.xfer),
                DONE => return Ok(XferStatus::Done),
                ERROR => return Ok(XferStatus::Error(self.last_error())),
                _ => return Err(self.released()),
            };
            match polled {
                BackendStatus::InProgress => return Ok(XferStatus::InProgress),
                BackendStatus::Done => {
                    if self.settle(word, DONE, None) {
                        return Ok(XferStatus::Done);
                    }
                }
                BackendStatus::Error(e) => {
                    if self.settle(word, ERROR, Some(e.clone())) {
                        return Ok(XferStatus::Error(e));
                    }
                }
            }
            // the state moved while polling; read it again
        }
    }

    /// Hand the request to its backend. Reposting a finished request runs it
    /// again.
    pub(crate) fn post(&self) -> Result<()> {
        let run = loop {
            let word = self.state.load(Ordering::Acquire);
            match state_of(word) {
                CREATED | DONE | ERROR => {
                    let next = run_of(word) + 1;
                    if self
                        .state
                        .compare_exchange(word, pack(next, POSTING), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break next;
                    }
                }
                IN_PROGRESS => {
                    if !self.status()?.is_terminal() {
                        return Err(self.busy());
                    }
                }
                POSTING => return Err(self.busy()),
                _ => return Err(self.released()),
            }
        };

        // only the poster moves the request out of POSTING
        match self.engine.post_transfer(&self.xfer) {
            Ok(()) => {
                self.state.store(pack(run, IN_PROGRESS), Ordering::Release);
                debug!(
                    request = %self.handle,
                    backend = self.engine.name(),
                    op = %self.op,
                    src = %self.src_kind,
                    dst = %self.dst_kind,
                    remote = self.remote.as_deref().unwrap_or("local"),
                    bytes = self.total_bytes,
                    run,
                    "transfer posted"
                );
                Ok(())
            }
            Err(e) => {
                let mut error = self.error.lock();
                *error = Some(transport_error_of(&e));
                self.state.store(pack(run, ERROR), Ordering::Release);
                drop(error);
                debug!(request = %self.handle, error = %e, run, "transfer post failed");
                Err(e)
            }
        }
    }

    /// Move a finished request to `Released`. Requests that never ran or
    /// are still running are refused with `RequestBusy`.
    pub(crate) fn mark_released(&self) -> Result<ReleaseToken> {
        loop {
            let word = self.state.load(Ordering::Acquire);
            match state_of(word) {
                DONE | ERROR => {
                    if let Some(token) = self.try_release(word) {
                        return Ok(token);
                    }
                }
                IN_PROGRESS => {
                    if !self.status()?.is_terminal() {
                        return Err(self.busy());
                    }
                }
                CREATED => {
                    return Err(XferError::RequestBusy(format!(
                        "request {} was never posted",
                        self.handle
                    )));
                }
                POSTING => return Err(self.busy()),
                _ => return Err(self.released()),
            }
        }
    }

    /// Teardown variant of [`Self::mark_released`] that also takes requests
    /// which were never posted.
    pub(crate) fn mark_discarded(&self) -> Option<ReleaseToken> {
        let word = self.state.load(Ordering::Acquire);
        match state_of(word) {
            CREATED => self.try_release(word),
            _ => self.mark_released().ok(),
        }
    }

    /// Put back the state captured by `token`. Only valid while the request
    /// is still `Released` and owned by its agent.
    pub(crate) fn restore(&self, token: ReleaseToken) {
        let _ = self.state.compare_exchange(
            pack(run_of(token.0), RELEASED),
            token.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Return the backend's per-transfer state. Call after [`Self::mark_released`].
    pub(crate) fn release_backend(&self) -> Result<()> {
        self.engine.release_transfer(self.xfer.clone())
    }

    fn try_release(&self, word: u64) -> Option<ReleaseToken> {
        self.state
            .compare_exchange(word, pack(run_of(word), RELEASED), Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReleaseToken(word))
    }

    /// Record the outcome polled while the state word was `observed`.
    /// Returns false when another run or another poller got there first.
    fn settle(&self, observed: u64, terminal: u8, error: Option<TransportError>) -> bool {
        let mut slot = self.error.lock();
        if self
            .state
            .compare_exchange(
                observed,
                pack(run_of(observed), terminal),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        if let Some(e) = error {
            *slot = Some(e);
        }
        drop(slot);
        debug!(
            request = %self.handle,
            backend = self.engine.name(),
            done = terminal == DONE,
            run = run_of(observed),
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "transfer finished"
        );
        true
    }

    fn last_error(&self) -> TransportError {
        self.error
            .lock()
            .clone()
            .unwrap_or_else(|| TransportError::new(-1, "transfer failed"))
    }

    fn busy(&self) -> XferError {
        XferError::RequestBusy(format!("request {} is still in progress", self.handle))
    }

    fn released(&self) -> XferError {
        XferError::invalid_handle(format!("request {} was released", self.handle))
    }
}

/// The diagnostic a failed post leaves on the request.
fn transport_error_of(err: &XferError) -> TransportError {
    match err {
        XferError::BackendTransport { code, message, .. } => {
            TransportError::new(*code, message.clone())
        }
        other => TransportError::new(-1, other.to_string()),
    }
}

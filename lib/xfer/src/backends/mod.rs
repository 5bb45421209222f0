// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Backend plugin contract.
//!
//! A [`Backend`] executes transfers for the segment-kind pairs it declares in
//! its [`BackendCapabilities`]. The agent only ever consults that matrix when
//! routing registrations and choosing a backend for a request; nothing in the
//! agent is keyed on a particular backend type.
//!
//! Backends are constructed by a [`BackendFactory`] (a plugin), which the
//! agent keeps in a table keyed by upper-case type name.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::parse_bool;
use crate::descriptor::{DescriptorList, SegmentKind, XferSegment};
use crate::error::{Result, TransportError, XferError};
use crate::request::XferOp;

pub mod memcpy;
pub mod posix;

pub use memcpy::MemcpyFactory;
pub use posix::PosixFactory;

/// Segment-kind pairs a backend can move data between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    pairs: Vec<(SegmentKind, SegmentKind)>,
    remote: bool,
}

impl BackendCapabilities {
    pub fn new() -> Self {
        Self {
            pairs: Vec::new(),
            remote: false,
        }
    }

    /// Add a directed pair.
    pub fn with_pair(mut self, src: SegmentKind, dst: SegmentKind) -> Self {
        if !self.pairs.contains(&(src, dst)) {
            self.pairs.push((src, dst));
        }
        self
    }

    /// Add both directions between two kinds.
    pub fn with_bidirectional(self, a: SegmentKind, b: SegmentKind) -> Self {
        self.with_pair(a, b).with_pair(b, a)
    }

    /// Mark the backend as able to reach other agents.
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    pub fn supports(&self, src: SegmentKind, dst: SegmentKind) -> bool {
        self.pairs.contains(&(src, dst))
    }

    /// True when `kind` appears on either side of any supported pair.
    pub fn is_interested(&self, kind: SegmentKind) -> bool {
        self.pairs.iter().any(|&(s, d)| s == kind || d == kind)
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn pairs(&self) -> &[(SegmentKind, SegmentKind)] {
        &self.pairs
    }

    /// Every kind that appears in the matrix, sorted.
    pub fn kinds(&self) -> Vec<SegmentKind> {
        let mut kinds: Vec<SegmentKind> = self.pairs.iter().flat_map(|&(s, d)| [s, d]).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

/// Named string options passed through to a backend at construction.
///
/// The agent does not interpret these; each backend checks its own keys and
/// fails with [`XferError::InvalidConfig`] on anything it does not recognize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendParams(BTreeMap<String, String>);

impl BackendParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `overrides` on top of `self`.
    pub fn merged(mut self, overrides: &BackendParams) -> Self {
        for (k, v) in overrides.iter() {
            self.set(k, v);
        }
        self
    }

    /// Reject any key outside `known`.
    pub fn ensure_known(&self, backend: &str, known: &[&str]) -> Result<()> {
        match self.0.keys().find(|k| !known.contains(&k.as_str())) {
            Some(key) => Err(XferError::invalid_config(format!(
                "{backend} does not recognize option '{key}' (known options: {known:?})"
            ))),
            None => Ok(()),
        }
    }

    /// Parse `key`, falling back to `default` when it is absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|e| {
                XferError::invalid_config(format!("invalid value '{raw}' for option '{key}': {e}"))
            }),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).map_err(|e| {
                XferError::invalid_config(format!("invalid value for option '{key}': {e}"))
            }),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for BackendParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Everything a backend needs to know about the agent that owns it.
#[derive(Debug, Clone)]
pub struct BackendInitContext {
    pub agent_name: String,
    pub runtime: tokio::runtime::Handle,
}

/// A fully validated unit of work handed to [`Backend::create_transfer`].
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub op: XferOp,
    pub src_kind: SegmentKind,
    pub dst_kind: SegmentKind,

    /// Equal-length `(src, dst)` pieces in caller order.
    pub segments: Vec<XferSegment>,

    /// Target agent for remote transfers, `None` when local.
    pub remote: Option<String>,
}

impl TransferSpec {
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(XferSegment::len).sum()
    }
}

/// Backend-owned state for one transfer, opaque to the agent.
#[derive(Clone)]
pub struct BackendXferHandle(Arc<dyn Any + Send + Sync>);

impl BackendXferHandle {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    /// Recover the backend's own state type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for BackendXferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackendXferHandle({:p})", Arc::as_ptr(&self.0))
    }
}

/// Latest status a backend has observed for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    InProgress,
    Done,
    Error(TransportError),
}

/// The capability interface every transfer backend implements.
///
/// All methods take `&self`; implementations keep their own interior state so
/// polls can run concurrently with posts of other requests.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Upper-case plugin type name, e.g. `POSIX`.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &BackendCapabilities;

    /// Effective options the backend was created with.
    fn params(&self) -> &BackendParams;

    fn supports(&self, src: SegmentKind, dst: SegmentKind) -> bool {
        self.capabilities().supports(src, dst)
    }

    /// Make the regions in `list` usable for transfers. Registering a region
    /// the backend already knows is a successful no-op.
    fn register_memory(&self, list: &DescriptorList) -> Result<()>;

    /// Forget the regions in `list`. Fails with [`XferError::NotRegistered`]
    /// if any of them is unknown.
    fn deregister_memory(&self, list: &DescriptorList) -> Result<()>;

    fn create_transfer(&self, spec: TransferSpec) -> Result<BackendXferHandle>;

    /// Start (or restart) the transfer. Must not block on the data movement.
    fn post_transfer(&self, handle: &BackendXferHandle) -> Result<()>;

    /// Non-blocking status query.
    fn poll_status(&self, handle: &BackendXferHandle) -> BackendStatus;

    fn release_transfer(&self, handle: BackendXferHandle) -> Result<()>;
}

/// A backend plugin.
pub trait BackendFactory: Send + Sync {
    /// Upper-case plugin type name.
    fn name(&self) -> &str;

    /// Segment kinds the plugin can work with.
    fn supported_segments(&self) -> Vec<SegmentKind>;

    /// Options and their default values.
    fn default_params(&self) -> BackendParams;

    fn create(&self, params: &BackendParams, ctx: &BackendInitContext) -> Result<Arc<dyn Backend>>;
}

const CELL_IDLE: u8 = 0;
const CELL_RUNNING: u8 = 1;
const CELL_DONE: u8 = 2;
const CELL_FAILED: u8 = 3;

/// Completion state shared between a backend's worker and its pollers.
#[derive(Debug, Default)]
pub struct CompletionCell {
    state: AtomicU8,
    error: Mutex<Option<TransportError>>,
}

impl CompletionCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to running. Returns `false` if the transfer is already running.
    pub fn begin(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == CELL_RUNNING {
                return false;
            }
            match self.state.compare_exchange(
                current,
                CELL_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.error.lock().take();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return to idle after a post that never reached the worker.
    pub fn abort(&self) {
        self.state.store(CELL_IDLE, Ordering::Release);
    }

    pub fn complete(&self) {
        self.state.store(CELL_DONE, Ordering::Release);
    }

    pub fn fail(&self, error: TransportError) {
        *self.error.lock() = Some(error);
        self.state.store(CELL_FAILED, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == CELL_RUNNING
    }

    pub fn status(&self) -> BackendStatus {
        match self.state.load(Ordering::Acquire) {
            CELL_DONE => BackendStatus::Done,
            CELL_FAILED => BackendStatus::Error(
                self.error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| TransportError::new(-1, "transfer failed")),
            ),
            _ => BackendStatus::InProgress,
        }
    }
}

/// Bounded count of transfers a backend has in flight.
#[derive(Debug)]
pub struct InflightLimiter {
    max: usize,
    current: Arc<AtomicUsize>,
}

impl InflightLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            current: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Reserve a slot, or fail with [`XferError::ResourceExhausted`].
    pub fn try_acquire(&self, backend: &str) -> Result<InflightPermit> {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .map_err(|_| {
                XferError::ResourceExhausted(format!(
                    "{backend} already has {} transfers in flight",
                    self.max
                ))
            })?;
        Ok(InflightPermit {
            current: self.current.clone(),
        })
    }
}

/// Slot reserved by [`InflightLimiter::try_acquire`], returned on drop.
#[derive(Debug)]
pub struct InflightPermit {
    current: Arc<AtomicUsize>,
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Regions a backend has accepted, keyed by `(kind, region_id)`.
///
/// Shared by the built-in backends to get idempotent registration and strict
/// deregistration.
#[derive(Debug, Default)]
pub struct RegionSet {
    regions: Mutex<BTreeSet<(SegmentKind, i32)>>,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_all(&self, list: &DescriptorList) {
        let mut regions = self.regions.lock();
        for desc in list {
            regions.insert((list.kind(), desc.region_id));
        }
    }

    /// Remove every region of `list`, or none if any is unknown.
    pub fn remove_all(&self, backend: &str, list: &DescriptorList) -> Result<()> {
        let mut regions = self.regions.lock();
        if let Some(desc) = list
            .iter()
            .find(|d| !regions.contains(&(list.kind(), d.region_id)))
        {
            return Err(XferError::not_registered(format!(
                "{} region {} is not registered with {backend}",
                list.kind(),
                desc.region_id
            )));
        }
        for desc in list {
            regions.remove(&(list.kind(), desc.region_id));
        }
        Ok(())
    }

    pub fn contains(&self, kind: SegmentKind, region_id: i32) -> bool {
        self.regions.lock().contains(&(kind, region_id))
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }
}

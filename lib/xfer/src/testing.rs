// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scriptable backend for exercising selection and request lifecycles
//! without real hardware.
//!
//! A [`ScriptedBackend`] declares whatever capability matrix it is given,
//! records every call it receives, and completes transfers either right away
//! or when the test says so.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backends::{
    Backend, BackendCapabilities, BackendFactory, BackendInitContext, BackendParams,
    BackendStatus, BackendXferHandle, CompletionCell, InflightLimiter, InflightPermit, RegionSet,
    TransferSpec,
};
use crate::descriptor::{DescriptorList, SegmentKind};
use crate::error::{Result, TransportError, XferError};

/// When posted transfers finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Done as soon as they are posted.
    Immediate,

    /// Done when the test calls [`ScriptedBackend::complete_all`] or
    /// [`ScriptedBackend::fail_all`].
    Manual,
}

/// A call observed by a [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Register(DescriptorList),
    Deregister(DescriptorList),
    Create(SegmentKind, SegmentKind),
    Post,
    Release,
}

#[derive(Debug)]
struct ScriptedXfer {
    spec: TransferSpec,
    cell: CompletionCell,
    permit: Mutex<Option<InflightPermit>>,
}

#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    params: BackendParams,
    capabilities: BackendCapabilities,
    completion: Completion,
    limiter: InflightLimiter,
    regions: RegionSet,
    pending: Mutex<Vec<BackendXferHandle>>,
    calls: Mutex<Vec<BackendCall>>,
    fail_register: Mutex<Option<XferError>>,
    fail_post: Mutex<Option<XferError>>,
    fail_release: Mutex<Option<XferError>>,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>, capabilities: BackendCapabilities) -> Self {
        Self {
            name: name.into().to_uppercase(),
            params: BackendParams::new(),
            capabilities,
            completion: Completion::Immediate,
            limiter: InflightLimiter::new(usize::MAX),
            regions: RegionSet::new(),
            pending: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_register: Mutex::new(None),
            fail_post: Mutex::new(None),
            fail_release: Mutex::new(None),
        }
    }

    /// A GDS-like backend: VRAM and DRAM to and from FILE.
    pub fn file_backend(name: impl Into<String>) -> Self {
        Self::new(
            name,
            BackendCapabilities::new()
                .with_bidirectional(SegmentKind::Vram, SegmentKind::File)
                .with_bidirectional(SegmentKind::Dram, SegmentKind::File),
        )
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    pub fn with_max_inflight(mut self, max: usize) -> Self {
        self.limiter = InflightLimiter::new(max);
        self
    }

    pub fn with_params(mut self, params: BackendParams) -> Self {
        self.params = params;
        self
    }

    /// Make the next `register_memory` call fail with `err`.
    pub fn fail_next_register(&self, err: XferError) {
        *self.fail_register.lock() = Some(err);
    }

    /// Make the next `post_transfer` call fail with `err`.
    pub fn fail_next_post(&self, err: XferError) {
        *self.fail_post.lock() = Some(err);
    }

    /// Make the next `release_transfer` call fail with `err`.
    pub fn fail_next_release(&self, err: XferError) {
        *self.fail_release.lock() = Some(err);
    }

    /// Finish every outstanding transfer successfully.
    pub fn complete_all(&self) {
        self.finish_all(None);
    }

    /// Finish every outstanding transfer with `err`.
    pub fn fail_all(&self, err: TransportError) {
        self.finish_all(Some(err));
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Registration calls only.
    pub fn registrations(&self) -> Vec<DescriptorList> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                BackendCall::Register(list) => Some(list.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn holds_region(&self, kind: SegmentKind, region_id: i32) -> bool {
        self.regions.contains(kind, region_id)
    }

    fn finish_all(&self, err: Option<TransportError>) {
        let drained: Vec<BackendXferHandle> = self.pending.lock().drain(..).collect();
        for handle in drained {
            if let Some(xfer) = handle.downcast_ref::<ScriptedXfer>() {
                xfer.permit.lock().take();
                match &err {
                    Some(e) => xfer.cell.fail(e.clone()),
                    None => xfer.cell.complete(),
                }
            }
        }
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }

    fn state<'a>(&self, handle: &'a BackendXferHandle) -> Result<&'a ScriptedXfer> {
        handle.downcast_ref::<ScriptedXfer>().ok_or_else(|| {
            XferError::invalid_handle(format!("{} was given a foreign transfer handle", self.name))
        })
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn params(&self) -> &BackendParams {
        &self.params
    }

    fn register_memory(&self, list: &DescriptorList) -> Result<()> {
        self.record(BackendCall::Register(list.clone()));
        if let Some(err) = self.fail_register.lock().take() {
            return Err(err);
        }
        self.regions.insert_all(list);
        Ok(())
    }

    fn deregister_memory(&self, list: &DescriptorList) -> Result<()> {
        self.record(BackendCall::Deregister(list.clone()));
        self.regions.remove_all(&self.name, list)
    }

    fn create_transfer(&self, spec: TransferSpec) -> Result<BackendXferHandle> {
        self.record(BackendCall::Create(spec.src_kind, spec.dst_kind));
        Ok(BackendXferHandle::new(ScriptedXfer {
            spec,
            cell: CompletionCell::new(),
            permit: Mutex::new(None),
        }))
    }

    fn post_transfer(&self, handle: &BackendXferHandle) -> Result<()> {
        self.record(BackendCall::Post);
        let xfer = self.state(handle)?;
        if let Some(err) = self.fail_post.lock().take() {
            return Err(err);
        }
        let permit = self.limiter.try_acquire(&self.name)?;
        if !xfer.cell.begin() {
            return Err(XferError::RequestBusy(format!(
                "{} transfer is still running",
                self.name
            )));
        }

        tracing::trace!(
            backend = %self.name,
            segments = xfer.spec.segments.len(),
            bytes = xfer.spec.total_bytes(),
            "scripted post"
        );

        match self.completion {
            Completion::Immediate => {
                drop(permit);
                xfer.cell.complete();
            }
            Completion::Manual => {
                *xfer.permit.lock() = Some(permit);
                self.pending.lock().push(handle.clone());
            }
        }
        Ok(())
    }

    fn poll_status(&self, handle: &BackendXferHandle) -> BackendStatus {
        match self.state(handle) {
            Ok(xfer) => xfer.cell.status(),
            Err(e) => BackendStatus::Error(TransportError::new(-1, e.to_string())),
        }
    }

    fn release_transfer(&self, handle: BackendXferHandle) -> Result<()> {
        self.record(BackendCall::Release);
        if let Some(err) = self.fail_release.lock().take() {
            return Err(err);
        }
        if self.state(&handle)?.cell.is_running() {
            return Err(XferError::RequestBusy(format!(
                "{} transfer is still running",
                self.name
            )));
        }
        Ok(())
    }
}

/// Plugin producing [`ScriptedBackend`]s, keeping every instance it made so
/// tests can drive them.
pub struct ScriptedFactory {
    name: String,
    capabilities: BackendCapabilities,
    completion: Completion,
    max_inflight: usize,
    created: Mutex<Vec<Arc<ScriptedBackend>>>,
}

impl ScriptedFactory {
    pub fn new(name: impl Into<String>, capabilities: BackendCapabilities) -> Self {
        Self {
            name: name.into().to_uppercase(),
            capabilities,
            completion: Completion::Immediate,
            max_inflight: usize::MAX,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    pub fn with_max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    /// The most recently created backend.
    pub fn last(&self) -> Option<Arc<ScriptedBackend>> {
        self.created.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

impl BackendFactory for ScriptedFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_segments(&self) -> Vec<SegmentKind> {
        self.capabilities.kinds()
    }

    fn default_params(&self) -> BackendParams {
        BackendParams::new()
    }

    fn create(&self, params: &BackendParams, _ctx: &BackendInitContext) -> Result<Arc<dyn Backend>> {
        if let Some(fail) = params.get("fail_create") {
            return Err(XferError::invalid_config(format!(
                "{} refused to start: {fail}",
                self.name
            )));
        }
        let backend = Arc::new(
            ScriptedBackend::new(self.name.clone(), self.capabilities.clone())
                .with_completion(self.completion)
                .with_max_inflight(self.max_inflight)
                .with_params(params.clone()),
        );
        self.created.lock().push(backend.clone());
        Ok(backend)
    }
}

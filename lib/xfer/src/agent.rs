// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The transfer agent.
//!
//! An [`Agent`] owns its backends, the registration table and every transfer
//! request it created. Control-plane calls (backend creation, registration,
//! request creation and release) are serialized by one lock. Status queries
//! only take a short read lock on the request arena to find the request and
//! then talk to its backend directly, so polling never waits on registration
//! activity.
//!
//! Lock order: `control` before `requests`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::arena::{BackendHandle, HandleArena, XferReqHandle, next_agent_id};
use crate::backends::{BackendFactory, BackendInitContext, BackendParams, TransferSpec};
use crate::config::AgentConfig;
use crate::descriptor::{DescriptorList, SegmentKind, pair_segments};
use crate::error::{Result, XferError};
use crate::notifications::{
    RegisterPollingNotification, RequestChecker, TransferCompleteNotification,
    process_polling_notifications,
};
use crate::registration::{RegionInfo, RegistrationTable};
use crate::registry::BackendRegistry;
use crate::request::{XferOp, XferOptions, XferRequest, XferRequestParts, XferStatus};
use crate::runtime::TokioRuntime;

const NOTIFICATION_QUEUE_DEPTH: usize = 1024;

type RemoteDescs = BTreeMap<SegmentKind, DescriptorList>;

struct ControlPlane {
    registry: BackendRegistry,
    registrations: RegistrationTable,
    remotes: HashMap<String, RemoteDescs>,
}

struct AgentInner {
    id: u64,
    name: String,
    config: AgentConfig,
    control: Mutex<ControlPlane>,
    requests: RwLock<HandleArena<Arc<XferRequest>>>,
    notify_tx: mpsc::Sender<RegisterPollingNotification<RequestChecker>>,
    runtime: TokioRuntime,
}

/// Entry point of the transfer engine.
///
/// Cloning an agent is cheap; all clones share the same state. Several agents
/// may live in one process, and handles issued by one are rejected by the
/// others.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Agent {
    /// Create an agent and the backends listed in `config.backends`.
    ///
    /// When called outside a tokio runtime the agent builds its own, sized by
    /// the config.
    pub fn new(name: &str, config: AgentConfig) -> Result<Self> {
        validator::Validate::validate(&config)
            .map_err(|e| XferError::invalid_config(e.to_string()))?;

        let id = next_agent_id();
        let runtime = TokioRuntime::from_config(&config)?;

        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
        let warn_after = Duration::from_secs(config.slow_transfer_warn_secs);
        runtime
            .handle()
            .spawn(process_polling_notifications(notify_rx, warn_after));

        let agent = Self {
            inner: Arc::new(AgentInner {
                id,
                name: name.to_string(),
                config: config.clone(),
                control: Mutex::new(ControlPlane {
                    registry: BackendRegistry::new(id),
                    registrations: RegistrationTable::new(),
                    remotes: HashMap::new(),
                }),
                requests: RwLock::new(HandleArena::new(id)),
                notify_tx,
                runtime,
            }),
        };

        for (backend, options) in &config.backends {
            let params: BackendParams = options.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            agent.create_backend(backend, &params)?;
        }

        debug!(
            agent = %agent.inner.name,
            id,
            owned_runtime = agent.inner.runtime.is_owned(),
            backends = ?agent.backends(),
            "transfer agent created"
        );
        Ok(agent)
    }

    /// Create an agent requiring every backend in `backends` to be created
    /// with its configured (or default) options.
    pub fn with_backends(name: &str, config: AgentConfig, backends: &[&str]) -> Result<Self> {
        let agent = Self::new(name, config)?;
        let mut failed_backends = Vec::new();

        for backend in backends {
            let backend_upper = backend.to_uppercase();
            match agent.add_backend(&backend_upper) {
                Ok(_) => debug!("Initialized transfer backend: {}", backend_upper),
                Err(e) => {
                    error!("Failed to initialize {} backend: {}", backend_upper, e);
                    failed_backends.push((backend_upper, e.to_string()));
                }
            }
        }

        if !failed_backends.is_empty() {
            let error_details: Vec<String> = failed_backends
                .iter()
                .map(|(name, reason)| format!("{}: {}", name, reason))
                .collect();
            return Err(XferError::invalid_config(format!(
                "Failed to initialize required backends: [{}]",
                error_details.join(", ")
            )));
        }

        Ok(agent)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    // ---- plugins and backends ----

    /// Make a custom backend type available to [`Agent::create_backend`].
    pub fn register_plugin(&self, factory: Arc<dyn BackendFactory>) -> Result<()> {
        self.inner.control.lock().registry.register_plugin(factory)
    }

    pub fn available_plugins(&self) -> Vec<String> {
        self.inner.control.lock().registry.available_plugins()
    }

    /// Segment kinds a plugin works with and its default options.
    pub fn plugin_params(&self, backend: &str) -> Result<(Vec<SegmentKind>, BackendParams)> {
        let control = self.inner.control.lock();
        let plugin = control.registry.plugin(backend)?;
        Ok((plugin.supported_segments(), plugin.default_params()))
    }

    /// Instantiate a backend of type `backend` with `params`.
    ///
    /// Only one backend per type exists; creating a type twice fails with
    /// [`XferError::InvalidConfig`]. Regions registered before the backend
    /// existed are not registered with it.
    pub fn create_backend(&self, backend: &str, params: &BackendParams) -> Result<BackendHandle> {
        let ctx = BackendInitContext {
            agent_name: self.inner.name.clone(),
            runtime: self.inner.runtime.handle().clone(),
        };
        let mut control = self.inner.control.lock();
        let handle = control.registry.create(backend, params, &ctx)?;
        debug!(agent = %self.inner.name, backend = %backend.to_uppercase(), %handle, "backend created");
        Ok(handle)
    }

    /// Create a backend with its configured options unless one of that type
    /// already exists.
    pub fn add_backend(&self, backend: &str) -> Result<BackendHandle> {
        if let Some(handle) = self.backend_handle(backend) {
            return Ok(handle);
        }
        let params = self
            .inner
            .config
            .backend_params(backend)
            .unwrap_or_default();
        self.create_backend(backend, &params)
    }

    /// Effective options of a created backend.
    pub fn backend_params(&self, handle: BackendHandle) -> Result<BackendParams> {
        let control = self.inner.control.lock();
        Ok(control.registry.get(&handle)?.backend.params().clone())
    }

    pub fn backend_handle(&self, backend: &str) -> Option<BackendHandle> {
        self.inner.control.lock().registry.handle_of(backend)
    }

    pub fn has_backend(&self, backend: &str) -> bool {
        self.backend_handle(backend).is_some()
    }

    /// Require a specific backend, returning an error if it was not created.
    pub fn require_backend(&self, backend: &str) -> Result<BackendHandle> {
        let backend_upper = backend.to_uppercase();
        self.backend_handle(&backend_upper).ok_or_else(|| {
            XferError::invalid_config(format!(
                "Operation requires {} backend, but it was not initialized. Available backends: {:?}",
                backend_upper,
                self.backends()
            ))
        })
    }

    /// Type names of the created backends.
    pub fn backends(&self) -> Vec<String> {
        self.inner.control.lock().registry.types()
    }

    // ---- registration ----

    /// Register the regions of `list` with every backend interested in its
    /// segment kind.
    ///
    /// The list is trimmed first. Registering a list equal (after trimming) to
    /// one already registered fails with [`XferError::AlreadyRegistered`]. If
    /// any backend rejects the list, the backends that accepted it are rolled
    /// back and nothing is recorded.
    ///
    /// # Safety contract
    ///
    /// Host backends (`MEMCPY`, `POSIX`) read and write `DRAM` descriptors as
    /// raw addresses. The caller must keep every registered `DRAM` range
    /// allocated and valid for reads and writes until it is deregistered, and
    /// must not access a range that a posted request writes into until that
    /// request reaches `Done` or `Error`. Breaking this is undefined behavior
    /// even though the call itself is safe.
    pub fn register_mem(&self, list: &DescriptorList) -> Result<()> {
        if list.is_empty() {
            return Err(XferError::descriptor(format!(
                "cannot register an empty {} list",
                list.kind()
            )));
        }
        let trimmed = list.trim()?;
        let kind = trimmed.kind();

        let mut control = self.inner.control.lock();
        if control.registrations.position(&trimmed).is_some() {
            return Err(XferError::AlreadyRegistered(format!(
                "{kind} list with {} descriptors",
                trimmed.len()
            )));
        }

        let interested = control.registry.interested_in(kind);
        if interested.is_empty() {
            return Err(XferError::NoSuitableBackend {
                src: kind,
                dst: kind,
            });
        }

        let fresh: Vec<DescriptorList> = interested
            .iter()
            .map(|(handle, _)| control.registrations.newly_owned(&trimmed, *handle))
            .collect();

        for (i, (handle, backend)) in interested.iter().enumerate() {
            if let Err(e) = backend.register_memory(&trimmed) {
                warn!(
                    backend = backend.name(),
                    %handle,
                    error = %e,
                    "registration failed, rolling back"
                );
                for ((done_handle, done), owned) in interested[..i].iter().zip(&fresh) {
                    if owned.is_empty() {
                        continue;
                    }
                    if let Err(rollback) = done.deregister_memory(owned) {
                        warn!(
                            backend = done.name(),
                            handle = %done_handle,
                            error = %rollback,
                            "rollback of registration failed"
                        );
                    }
                }
                return Err(e);
            }
        }

        let handles: Vec<BackendHandle> = interested.iter().map(|(h, _)| *h).collect();
        debug!(
            agent = %self.inner.name,
            %kind,
            descriptors = trimmed.len(),
            bytes = trimmed.total_bytes(),
            backends = handles.len(),
            "registered memory"
        );
        control.registrations.insert(trimmed, handles);
        Ok(())
    }

    /// Deregister a list previously passed to [`Agent::register_mem`].
    ///
    /// The list must equal (after trimming) a registered one. Backends are
    /// only told to forget regions no other registered list still uses.
    pub fn deregister_mem(&self, list: &DescriptorList) -> Result<()> {
        let trimmed = list.trim()?;

        let mut control = self.inner.control.lock();
        let index = control.registrations.position(&trimmed).ok_or_else(|| {
            XferError::not_registered(format!(
                "{} list with {} descriptors was never registered",
                trimmed.kind(),
                trimmed.len()
            ))
        })?;

        let (_, orphaned) = control.registrations.remove(index);
        let mut first_error = None;
        for (handle, descs) in orphaned {
            let result = control
                .registry
                .get(&handle)
                .and_then(|entry| entry.backend.deregister_memory(&descs));
            if let Err(e) = result {
                warn!(%handle, error = %e, "backend failed to deregister memory");
                first_error.get_or_insert(e);
            }
        }

        debug!(
            agent = %self.inner.name,
            kind = %trimmed.kind(),
            descriptors = trimmed.len(),
            "deregistered memory"
        );
        first_error.map_or(Ok(()), Err)
    }

    pub fn registered_regions(&self) -> Vec<RegionInfo> {
        self.inner.control.lock().registrations.regions()
    }

    pub fn region_info(&self, kind: SegmentKind, region_id: i32) -> Option<RegionInfo> {
        self.inner.control.lock().registrations.region(kind, region_id)
    }

    /// Number of registered lists.
    pub fn registered_list_count(&self) -> usize {
        self.inner.control.lock().registrations.len()
    }

    // ---- remote peers ----

    /// Record the descriptors a peer agent exposes as transfer targets.
    /// Loading a peer again replaces what was known about it.
    pub fn load_remote_descs(&self, peer: &str, lists: &[DescriptorList]) -> Result<()> {
        if peer == self.inner.name {
            return Err(XferError::invalid_config(format!(
                "agent {peer} cannot load its own descriptors as remote"
            )));
        }

        let mut by_kind: BTreeMap<SegmentKind, DescriptorList> = BTreeMap::new();
        for list in lists {
            list.validate()?;
            let merged = by_kind
                .entry(list.kind())
                .or_insert_with(|| DescriptorList::new(list.kind()));
            for desc in list {
                merged.add_desc(*desc);
            }
        }
        let mut loaded = RemoteDescs::new();
        for (kind, list) in by_kind {
            loaded.insert(kind, list.trim()?);
        }

        debug!(agent = %self.inner.name, peer, kinds = loaded.len(), "loaded remote descriptors");
        self.inner
            .control
            .lock()
            .remotes
            .insert(peer.to_string(), loaded);
        Ok(())
    }

    /// Forget a peer loaded with [`Agent::load_remote_descs`].
    pub fn invalidate_remote(&self, peer: &str) -> Result<()> {
        match self.inner.control.lock().remotes.remove(peer) {
            Some(_) => {
                debug!(agent = %self.inner.name, peer, "invalidated remote peer");
                Ok(())
            }
            None => Err(XferError::not_registered(format!("no remote peer named {peer}"))),
        }
    }

    pub fn remote_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.control.lock().remotes.keys().cloned().collect();
        peers.sort();
        peers
    }

    // ---- transfer requests ----

    /// Create a transfer request moving bytes between `src` (local) and `dst`
    /// (local, or on `remote_identity` when that is not this agent's name).
    ///
    /// Everything is validated here: empty or malformed lists, byte count
    /// mismatch, backend availability and registration coverage. A failed
    /// call leaves no request behind.
    pub fn create_xfer_req(
        &self,
        op: XferOp,
        src: &DescriptorList,
        dst: &DescriptorList,
        remote_identity: &str,
        options: Option<&XferOptions>,
    ) -> Result<XferReqHandle> {
        if src.is_empty() || dst.is_empty() {
            return Err(XferError::descriptor(format!(
                "transfer lists must not be empty (src has {}, dst has {} descriptors)",
                src.len(),
                dst.len()
            )));
        }
        src.validate()?;
        dst.validate()?;

        let receiving = match op {
            XferOp::Write => dst,
            XferOp::Read => src,
        };
        if receiving.has_overlaps() {
            return Err(XferError::descriptor(format!(
                "{op} destination {} list has overlapping descriptors",
                receiving.kind()
            )));
        }
        let segments = pair_segments(src, dst)?;

        let remote = (remote_identity != self.inner.name).then(|| remote_identity.to_string());
        let preferred = options.map(|o| o.backends.as_slice()).unwrap_or(&[]);

        let control = self.inner.control.lock();
        if let Some(peer) = &remote {
            check_remote_covered(peer, control.remotes.get(peer), dst)?;
        }

        let candidates =
            control
                .registry
                .rank(src.kind(), dst.kind(), remote.is_some(), preferred)?;

        let mut first_error = None;
        let mut chosen = None;
        for candidate in candidates {
            let covered = control
                .registrations
                .check_covered(candidate, src)
                .and_then(|_| {
                    if remote.is_some() {
                        Ok(())
                    } else {
                        control.registrations.check_covered(candidate, dst)
                    }
                });
            match covered {
                Ok(()) => {
                    chosen = Some(candidate);
                    break;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        let backend = match (chosen, first_error) {
            (Some(backend), _) => backend,
            (None, Some(e)) => return Err(e),
            (None, None) => {
                return Err(XferError::NoSuitableBackend {
                    src: src.kind(),
                    dst: dst.kind(),
                });
            }
        };

        let engine = control.registry.get(&backend)?.backend.clone();
        let spec = TransferSpec {
            op,
            src_kind: src.kind(),
            dst_kind: dst.kind(),
            segments,
            remote: remote.clone(),
        };
        let total_bytes = spec.total_bytes();
        let xfer = engine.create_transfer(spec)?;

        debug!(
            agent = %self.inner.name,
            backend = engine.name(),
            %op,
            src = %src.kind(),
            dst = %dst.kind(),
            bytes = total_bytes,
            "transfer request created"
        );

        let parts = XferRequestParts {
            op,
            src_kind: src.kind(),
            dst_kind: dst.kind(),
            remote,
            total_bytes,
            backend,
            engine,
            xfer,
        };
        let raw = self
            .inner
            .requests
            .write()
            .insert_with(|raw| Arc::new(XferRequest::new(XferReqHandle(raw), parts)));
        Ok(XferReqHandle(raw))
    }

    /// Start the transfer. A finished request may be posted again.
    pub fn post_xfer_req(&self, handle: XferReqHandle) -> Result<()> {
        self.request(handle)?.post()
    }

    /// Non-blocking status query.
    pub fn get_xfer_status(&self, handle: XferReqHandle) -> Result<XferStatus> {
        self.request(handle)?.status()
    }

    /// Release a `Done` or `Error` request. The handle is dead afterwards.
    ///
    /// If the backend refuses to release its transfer state, the request
    /// keeps its previous state and the handle stays valid.
    pub fn release_xfer_req(&self, handle: XferReqHandle) -> Result<()> {
        let mut requests = self.inner.requests.write();
        let request = requests.get(&handle.0)?.clone();
        let token = request.mark_released()?;
        if let Err(e) = request.release_backend() {
            request.restore(token);
            warn!(
                request = %handle,
                backend = request.backend_name(),
                error = %e,
                "backend refused to release transfer"
            );
            return Err(e);
        }
        requests.remove(&handle.0)?;
        drop(requests);
        debug!(request = %handle, age_ms = request.age().as_millis() as u64, "transfer request released");
        Ok(())
    }

    /// The backend serving a request.
    pub fn xfer_backend(&self, handle: XferReqHandle) -> Result<BackendHandle> {
        Ok(self.request(handle)?.backend())
    }

    /// Resolve once the request reaches `Done` (ok) or `Error` (the transport
    /// error). The request must have been posted.
    pub fn notify_on_completion(&self, handle: XferReqHandle) -> Result<TransferCompleteNotification> {
        let request = self.request(handle)?;
        match request.status()? {
            XferStatus::Created => {
                return Err(XferError::invalid_handle(format!(
                    "request {handle} was never posted"
                )));
            }
            XferStatus::Done => return Ok(TransferCompleteNotification::ready(Ok(()))),
            XferStatus::Error(e) => {
                let err = e.into_xfer_error(request.backend_name());
                return Ok(TransferCompleteNotification::ready(Err(err)));
            }
            XferStatus::InProgress => {}
        }

        let (done, status) = oneshot::channel();
        let notification = RegisterPollingNotification {
            uuid: Uuid::new_v4(),
            checker: RequestChecker::new(request),
            done,
        };
        self.inner.notify_tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => XferError::ResourceExhausted(
                "completion notification queue is full".to_string(),
            ),
            mpsc::error::TrySendError::Closed(_) => {
                XferError::invalid_handle("completion notification handler has stopped")
            }
        })?;
        Ok(TransferCompleteNotification { status })
    }

    /// Number of requests that have not been released.
    pub fn active_requests(&self) -> usize {
        self.inner.requests.read().len()
    }

    fn request(&self, handle: XferReqHandle) -> Result<Arc<XferRequest>> {
        Ok(self.inner.requests.read().get(&handle.0)?.clone())
    }
}

/// Every descriptor of `list` must lie inside what `peer` exposed.
fn check_remote_covered(peer: &str, loaded: Option<&RemoteDescs>, list: &DescriptorList) -> Result<()> {
    let loaded = loaded.ok_or_else(|| {
        XferError::not_registered(format!("no descriptors loaded for remote peer {peer}"))
    })?;
    let exposed = loaded.get(&list.kind());
    for desc in list {
        let covered = exposed.is_some_and(|l| l.iter().any(|r| r.contains(desc)));
        if !covered {
            return Err(XferError::not_registered(format!(
                "{} region {} range [{:#x}, {:#x}) is not exposed by remote peer {peer}",
                list.kind(),
                desc.region_id,
                desc.addr,
                desc.end()
            )));
        }
    }
    Ok(())
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        let requests = self.requests.get_mut();
        let running = requests.iter().filter(|(_, r)| r.is_running()).count();
        if running > 0 {
            warn!(
                agent = %self.name,
                running,
                "agent dropped with transfers still in progress"
            );
        }
        for (_, request) in requests.iter() {
            if request.mark_discarded().is_some() {
                if let Err(e) = request.release_backend() {
                    debug!(request = %request.handle(), error = %e, "failed to release transfer");
                }
            }
        }

        let control = self.control.get_mut();
        for (handle, descs) in control.registrations.drain() {
            let result = control
                .registry
                .get(&handle)
                .and_then(|entry| entry.backend.deregister_memory(&descs));
            if let Err(e) = result {
                warn!(agent = %self.name, %handle, error = %e, "failed to deregister memory on teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendCapabilities;
    use crate::testing::{Completion, ScriptedFactory};
    use assert_matches::assert_matches;

    fn file_factory(name: &str) -> Arc<ScriptedFactory> {
        Arc::new(
            ScriptedFactory::new(
                name,
                BackendCapabilities::new()
                    .with_bidirectional(SegmentKind::Vram, SegmentKind::File)
                    .with_bidirectional(SegmentKind::Dram, SegmentKind::File),
            )
            .with_completion(Completion::Manual),
        )
    }

    fn agent_with(factory: Arc<ScriptedFactory>) -> Agent {
        let agent = Agent::new("unit", AgentConfig::default()).unwrap();
        let name = factory.name().to_string();
        agent.register_plugin(factory).unwrap();
        agent.create_backend(&name, &BackendParams::new()).unwrap();
        agent
    }

    fn list(kind: SegmentKind, tuples: &[(u64, u64, i32)]) -> DescriptorList {
        DescriptorList::from_tuples(kind, tuples.iter().copied())
    }

    #[test]
    fn test_with_backends_reports_every_failure() {
        let err = Agent::with_backends("unit", AgentConfig::default(), &["posix", "ucx", "gds"])
            .unwrap_err();
        assert_matches!(&err, XferError::InvalidConfig(msg) if msg.contains("UCX") && msg.contains("GDS"));

        let agent = Agent::with_backends("unit", AgentConfig::default(), &["posix", "POSIX"]).unwrap();
        assert_eq!(agent.backends(), vec!["POSIX"]);
        assert!(agent.require_backend("posix").is_ok());
        assert_matches!(agent.require_backend("memcpy"), Err(XferError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_creates_backends() {
        let config = AgentConfig::builder().backend("memcpy").build().unwrap();
        let agent = Agent::new("unit", config).unwrap();
        assert!(agent.has_backend("MEMCPY"));

        let handle = agent.backend_handle("memcpy").unwrap();
        let params = agent.backend_params(handle).unwrap();
        assert_eq!(params.get("max_inflight"), Some("64"));
    }

    #[test]
    fn test_plugin_params() {
        let agent = Agent::new("unit", AgentConfig::default()).unwrap();
        let (segments, params) = agent.plugin_params("posix").unwrap();
        assert!(segments.contains(&SegmentKind::File));
        assert!(params.get("sync_writes").is_some());
        assert_matches!(agent.plugin_params("nope"), Err(XferError::InvalidConfig(_)));
    }

    #[test]
    fn test_registration_rolls_back_on_failure() {
        let first = file_factory("FIRST");
        let second = file_factory("SECOND");
        let agent = agent_with(first.clone());
        agent.register_plugin(second.clone()).unwrap();
        agent.create_backend("SECOND", &BackendParams::new()).unwrap();

        let files = list(SegmentKind::File, &[(0, 4096, 7)]);
        second
            .last()
            .unwrap()
            .fail_next_register(XferError::ResourceExhausted("pinned memory".into()));

        assert_matches!(agent.register_mem(&files), Err(XferError::ResourceExhausted(_)));
        assert!(!first.last().unwrap().holds_region(SegmentKind::File, 7));
        assert_eq!(agent.registered_list_count(), 0);

        agent.register_mem(&files).unwrap();
        assert!(first.last().unwrap().holds_region(SegmentKind::File, 7));
        assert!(second.last().unwrap().holds_region(SegmentKind::File, 7));
        assert_matches!(agent.register_mem(&files), Err(XferError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_shared_region_outlives_first_list() {
        let factory = file_factory("GDS");
        let agent = agent_with(factory.clone());
        let backend = factory.last().unwrap();

        let a = list(SegmentKind::File, &[(0, 100, 7)]);
        let b = list(SegmentKind::File, &[(100, 100, 7)]);
        agent.register_mem(&a).unwrap();
        agent.register_mem(&b).unwrap();
        assert_eq!(*agent.region_info(SegmentKind::File, 7).unwrap().refs(), 2);

        agent.deregister_mem(&a).unwrap();
        assert!(backend.holds_region(SegmentKind::File, 7));
        agent.deregister_mem(&b).unwrap();
        assert!(!backend.holds_region(SegmentKind::File, 7));
        assert!(agent.registered_regions().is_empty());
    }

    #[test]
    fn test_mismatched_and_overlapping_lists() {
        let agent = agent_with(file_factory("GDS"));
        agent.register_mem(&list(SegmentKind::Dram, &[(0x1000, 0x1000, 0)])).unwrap();
        agent.register_mem(&list(SegmentKind::File, &[(0, 0x1000, 3)])).unwrap();

        let short = list(SegmentKind::Dram, &[(0x1000, 0x800, 0)]);
        let file = list(SegmentKind::File, &[(0, 0x1000, 3)]);
        assert_matches!(
            agent.create_xfer_req(XferOp::Write, &short, &file, "unit", None),
            Err(XferError::Descriptor(_))
        );

        let src = list(SegmentKind::Dram, &[(0x1000, 0x800, 0), (0x1800, 0x800, 0)]);
        let overlapping = list(SegmentKind::File, &[(0, 0x800, 3), (0x400, 0x800, 3)]);
        assert_matches!(
            agent.create_xfer_req(XferOp::Write, &src, &overlapping, "unit", None),
            Err(XferError::Descriptor(_))
        );
        // reading from overlapping ranges is fine
        agent
            .create_xfer_req(XferOp::Read, &src, &overlapping, "unit", None)
            .unwrap();
        assert_eq!(agent.active_requests(), 1);
    }

    #[test]
    fn test_remote_requires_loaded_peer() {
        let factory = Arc::new(ScriptedFactory::new(
            "NET",
            BackendCapabilities::new()
                .with_bidirectional(SegmentKind::Dram, SegmentKind::Dram)
                .with_remote(true),
        ));
        let agent = agent_with(factory);
        let local = list(SegmentKind::Dram, &[(0x1000, 0x100, 0)]);
        let remote = list(SegmentKind::Dram, &[(0x9000, 0x100, 0)]);
        agent.register_mem(&local).unwrap();

        assert_matches!(
            agent.create_xfer_req(XferOp::Write, &local, &remote, "peer", None),
            Err(XferError::NotRegistered(_))
        );
        assert_matches!(
            agent.load_remote_descs("unit", std::slice::from_ref(&remote)),
            Err(XferError::InvalidConfig(_))
        );

        agent
            .load_remote_descs("peer", &[list(SegmentKind::Dram, &[(0x8000, 0x2000, 0)])])
            .unwrap();
        assert_eq!(agent.remote_peers(), vec!["peer"]);
        let handle = agent
            .create_xfer_req(XferOp::Write, &local, &remote, "peer", None)
            .unwrap();
        agent.post_xfer_req(handle).unwrap();
        assert_eq!(agent.get_xfer_status(handle).unwrap(), XferStatus::Done);

        agent.invalidate_remote("peer").unwrap();
        assert_matches!(agent.invalidate_remote("peer"), Err(XferError::NotRegistered(_)));
        assert_matches!(
            agent.create_xfer_req(XferOp::Write, &local, &remote, "peer", None),
            Err(XferError::NotRegistered(_))
        );
    }

    #[test]
    fn test_drop_deregisters_everything() {
        let factory = file_factory("GDS");
        let agent = agent_with(factory.clone());
        agent.register_mem(&list(SegmentKind::File, &[(0, 100, 7)])).unwrap();
        agent.register_mem(&list(SegmentKind::Vram, &[(0, 100, 1)])).unwrap();

        // never posted, so only teardown may free it
        agent
            .create_xfer_req(
                XferOp::Write,
                &list(SegmentKind::Vram, &[(0, 100, 1)]),
                &list(SegmentKind::File, &[(0, 100, 7)]),
                "unit",
                None,
            )
            .unwrap();

        let backend = factory.last().unwrap();
        let clone = agent.clone();
        drop(agent);
        assert!(backend.holds_region(SegmentKind::File, 7));
        drop(clone);
        assert!(backend.calls().contains(&crate::testing::BackendCall::Release));
        assert!(!backend.holds_region(SegmentKind::File, 7));
        assert!(!backend.holds_region(SegmentKind::Vram, 1));
    }
}

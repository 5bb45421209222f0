// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Plugin table and instantiated backends.
//!
//! Selection only looks at declared capabilities. Among the backends that
//! support a `(src, dst)` pair, the most specific one (fewest supported
//! pairs) wins, and among equally specific ones the most recently created.
//! A caller-supplied preference list replaces that ranking.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::arena::{BackendHandle, HandleArena};
use crate::backends::{
    Backend, BackendFactory, BackendInitContext, BackendParams, MemcpyFactory, PosixFactory,
};
use crate::descriptor::SegmentKind;
use crate::error::{Result, XferError};

#[derive(Debug)]
pub(crate) struct BackendEntry {
    pub type_name: String,
    pub backend: Arc<dyn Backend>,
    seq: u64,
}

pub(crate) struct BackendRegistry {
    plugins: BTreeMap<String, Arc<dyn BackendFactory>>,
    backends: HandleArena<BackendEntry>,
    by_type: BTreeMap<String, BackendHandle>,
    next_seq: u64,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("backends", &self.by_type.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// A registry with the built-in plugins loaded.
    pub(crate) fn new(agent_id: u64) -> Self {
        let mut registry = Self {
            plugins: BTreeMap::new(),
            backends: HandleArena::new(agent_id),
            by_type: BTreeMap::new(),
            next_seq: 0,
        };
        registry.plugins.insert(
            MemcpyFactory.name().to_string(),
            Arc::new(MemcpyFactory) as Arc<dyn BackendFactory>,
        );
        registry.plugins.insert(
            PosixFactory.name().to_string(),
            Arc::new(PosixFactory) as Arc<dyn BackendFactory>,
        );
        registry
    }

    pub(crate) fn register_plugin(&mut self, factory: Arc<dyn BackendFactory>) -> Result<()> {
        let name = factory.name().to_uppercase();
        if self.plugins.contains_key(&name) {
            return Err(XferError::AlreadyRegistered(format!("plugin {name}")));
        }
        debug!(plugin = %name, "registered backend plugin");
        self.plugins.insert(name, factory);
        Ok(())
    }

    pub(crate) fn available_plugins(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub(crate) fn plugin(&self, name: &str) -> Result<&Arc<dyn BackendFactory>> {
        let upper = name.to_uppercase();
        self.plugins.get(&upper).ok_or_else(|| {
            XferError::invalid_config(format!(
                "No {} plugin found. Available plugins: {:?}",
                upper,
                self.plugins.keys().collect::<Vec<_>>()
            ))
        })
    }

    pub(crate) fn create(
        &mut self,
        type_name: &str,
        params: &BackendParams,
        ctx: &BackendInitContext,
    ) -> Result<BackendHandle> {
        let upper = type_name.to_uppercase();
        if self.by_type.contains_key(&upper) {
            return Err(XferError::invalid_config(format!(
                "{upper} backend was already created"
            )));
        }

        let backend = self.plugin(&upper)?.create(params, ctx)?;
        let seq = self.next_seq;
        self.next_seq += 1;

        let handle = BackendHandle(self.backends.insert(BackendEntry {
            type_name: upper.clone(),
            backend,
            seq,
        }));
        self.by_type.insert(upper, handle);
        Ok(handle)
    }

    pub(crate) fn handle_of(&self, type_name: &str) -> Option<BackendHandle> {
        self.by_type.get(&type_name.to_uppercase()).copied()
    }

    pub(crate) fn get(&self, handle: &BackendHandle) -> Result<&BackendEntry> {
        self.backends.get(&handle.0)
    }

    pub(crate) fn types(&self) -> Vec<String> {
        self.by_type.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.backends.len()
    }

    /// Backends in creation order.
    pub(crate) fn entries(&self) -> Vec<(BackendHandle, &BackendEntry)> {
        let mut entries: Vec<(BackendHandle, &BackendEntry)> = self
            .backends
            .iter()
            .map(|(raw, entry)| (BackendHandle(raw), entry))
            .collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries
    }

    /// Backends whose capability matrix mentions `kind` on either side.
    pub(crate) fn interested_in(&self, kind: SegmentKind) -> Vec<(BackendHandle, Arc<dyn Backend>)> {
        self.entries()
            .into_iter()
            .filter(|(_, e)| e.backend.capabilities().is_interested(kind))
            .map(|(h, e)| (h, e.backend.clone()))
            .collect()
    }

    /// Candidates for a transfer, best first.
    pub(crate) fn rank(
        &self,
        src: SegmentKind,
        dst: SegmentKind,
        remote: bool,
        preferred: &[String],
    ) -> Result<Vec<BackendHandle>> {
        let candidates: Vec<(BackendHandle, &BackendEntry)> = self
            .entries()
            .into_iter()
            .filter(|(_, e)| {
                let caps = e.backend.capabilities();
                caps.supports(src, dst) && (!remote || caps.is_remote())
            })
            .collect();

        let ranked: Vec<BackendHandle> = if preferred.is_empty() {
            let mut ordered = candidates;
            ordered.sort_by(|(_, a), (_, b)| {
                let a_pairs = a.backend.capabilities().pairs().len();
                let b_pairs = b.backend.capabilities().pairs().len();
                a_pairs.cmp(&b_pairs).then(b.seq.cmp(&a.seq))
            });
            ordered.into_iter().map(|(h, _)| h).collect()
        } else {
            preferred
                .iter()
                .filter_map(|name| {
                    candidates
                        .iter()
                        .find(|(_, e)| e.type_name.eq_ignore_ascii_case(name))
                        .map(|(h, _)| *h)
                })
                .collect()
        };

        if ranked.is_empty() {
            return Err(XferError::NoSuitableBackend { src, dst });
        }
        Ok(ranked)
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registration table.
//!
//! Tracks every registered (trimmed) descriptor list, the backends it was
//! registered with, and a per-region record reference counted by the number
//! of lists naming that region. Backends are only told to forget a region
//! once no registered list still uses it with them.
//!
//! The table is pure bookkeeping; the agent drives the backend calls.

use std::collections::{BTreeMap, HashMap};

use derive_getters::Getters;

use crate::arena::BackendHandle;
use crate::descriptor::{Descriptor, DescriptorList, SegmentKind, merge_ranges};
use crate::error::{Result, XferError};

#[derive(Debug, Clone)]
pub(crate) struct RegisteredList {
    pub list: DescriptorList,
    pub backends: Vec<BackendHandle>,
}

#[derive(Debug, Clone, Default)]
struct OwnerRanges {
    lists: usize,
    ranges: Vec<Descriptor>,
}

#[derive(Debug, Clone, Default)]
struct RegionRecord {
    refs: usize,
    owners: BTreeMap<BackendHandle, OwnerRanges>,
}

/// Snapshot of one registered region.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct RegionInfo {
    kind: SegmentKind,
    region_id: i32,

    /// Number of registered lists that name this region.
    refs: usize,

    /// Backends the region is registered with.
    backends: Vec<BackendHandle>,
}

#[derive(Debug, Default)]
pub(crate) struct RegistrationTable {
    lists: Vec<RegisteredList>,
    regions: HashMap<(SegmentKind, i32), RegionRecord>,
}

impl RegistrationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.lists.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Index of a registered list equal to `trimmed`.
    pub(crate) fn position(&self, trimmed: &DescriptorList) -> Option<usize> {
        self.lists.iter().position(|r| &r.list == trimmed)
    }

    /// The part of `trimmed` naming regions `backend` does not hold yet.
    pub(crate) fn newly_owned(&self, trimmed: &DescriptorList, backend: BackendHandle) -> DescriptorList {
        let descs = trimmed
            .iter()
            .filter(|d| {
                self.regions
                    .get(&(trimmed.kind(), d.region_id))
                    .map_or(true, |r| !r.owners.contains_key(&backend))
            })
            .copied()
            .collect();
        DescriptorList::from_descs(trimmed.kind(), descs)
    }

    pub(crate) fn insert(&mut self, trimmed: DescriptorList, backends: Vec<BackendHandle>) {
        let kind = trimmed.kind();
        let mut touched: Vec<i32> = trimmed.iter().map(|d| d.region_id).collect();
        touched.dedup();

        for &region_id in &touched {
            let record = self.regions.entry((kind, region_id)).or_default();
            record.refs += 1;
            for backend in &backends {
                record.owners.entry(*backend).or_default().lists += 1;
            }
        }

        self.lists.push(RegisteredList {
            list: trimmed,
            backends,
        });
        self.refresh_ranges(kind, &touched);
    }

    /// Drop the list at `index`. Returns it together with, per backend, the
    /// descriptors of regions that backend no longer holds through any list.
    pub(crate) fn remove(&mut self, index: usize) -> (RegisteredList, Vec<(BackendHandle, DescriptorList)>) {
        let removed = self.lists.remove(index);
        let kind = removed.list.kind();
        let mut touched: Vec<i32> = removed.list.iter().map(|d| d.region_id).collect();
        touched.dedup();

        let mut orphaned: BTreeMap<BackendHandle, Vec<Descriptor>> = BTreeMap::new();
        for &region_id in &touched {
            let Some(record) = self.regions.get_mut(&(kind, region_id)) else {
                continue;
            };
            record.refs = record.refs.saturating_sub(1);

            for backend in &removed.backends {
                let Some(owner) = record.owners.get_mut(backend) else {
                    continue;
                };
                owner.lists = owner.lists.saturating_sub(1);
                if owner.lists == 0 {
                    record.owners.remove(backend);
                    orphaned.entry(*backend).or_default().extend(
                        removed.list.iter().filter(|d| d.region_id == region_id).copied(),
                    );
                }
            }

            if record.refs == 0 {
                self.regions.remove(&(kind, region_id));
            }
        }
        self.refresh_ranges(kind, &touched);

        let orphaned = orphaned
            .into_iter()
            .map(|(backend, descs)| (backend, DescriptorList::from_descs(kind, descs)))
            .collect();
        (removed, orphaned)
    }

    /// Every registered list, most recent first, for teardown.
    pub(crate) fn drain(&mut self) -> Vec<(BackendHandle, DescriptorList)> {
        let mut out = Vec::new();
        while !self.lists.is_empty() {
            let (_, orphaned) = self.remove(self.lists.len() - 1);
            out.extend(orphaned);
        }
        out
    }

    /// Fail with [`XferError::NotRegistered`] unless every descriptor lies in
    /// ranges registered with `backend`.
    pub(crate) fn check_covered(&self, backend: BackendHandle, list: &DescriptorList) -> Result<()> {
        for desc in list {
            let covered = self
                .regions
                .get(&(list.kind(), desc.region_id))
                .and_then(|r| r.owners.get(&backend))
                .is_some_and(|o| o.ranges.iter().any(|range| range.contains(desc)));
            if !covered {
                return Err(XferError::not_registered(format!(
                    "{} region {} range [{:#x}, {:#x}) is not registered with {}",
                    list.kind(),
                    desc.region_id,
                    desc.addr,
                    desc.end(),
                    backend
                )));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn covers(&self, backend: BackendHandle, list: &DescriptorList) -> bool {
        self.check_covered(backend, list).is_ok()
    }

    pub(crate) fn region(&self, kind: SegmentKind, region_id: i32) -> Option<RegionInfo> {
        self.regions
            .get(&(kind, region_id))
            .map(|r| region_info(kind, region_id, r))
    }

    /// All regions, ordered by kind then id.
    pub(crate) fn regions(&self) -> Vec<RegionInfo> {
        let mut out: Vec<RegionInfo> = self
            .regions
            .iter()
            .map(|(&(kind, region_id), r)| region_info(kind, region_id, r))
            .collect();
        out.sort_by_key(|r| (r.kind, r.region_id));
        out
    }

    fn refresh_ranges(&mut self, kind: SegmentKind, touched: &[i32]) {
        for &region_id in touched {
            let Some(record) = self.regions.get_mut(&(kind, region_id)) else {
                continue;
            };
            for (backend, owner) in record.owners.iter_mut() {
                let descs = self
                    .lists
                    .iter()
                    .filter(|r| r.list.kind() == kind && r.backends.contains(backend))
                    .flat_map(|r| r.list.iter().filter(move |d| d.region_id == region_id).copied())
                    .collect();
                owner.ranges = merge_ranges(descs);
            }
        }
    }
}

fn region_info(kind: SegmentKind, region_id: i32, record: &RegionRecord) -> RegionInfo {
    RegionInfo {
        kind,
        region_id,
        refs: record.refs,
        backends: record.owners.keys().copied().collect(),
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Descriptors and descriptor lists.
//!
//! A [`Descriptor`] names a contiguous byte range inside a region: a memory
//! buffer (address + length) or a file (offset + length, with the file
//! descriptor as the region id). A [`DescriptorList`] groups descriptors that
//! live in the same [`SegmentKind`]. The same shape is used for registration
//! and for transfers.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::{Result, XferError};

/// Address space a descriptor points into.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum SegmentKind {
    /// Host memory
    Dram,

    /// Device memory
    Vram,

    /// Regular file, addressed by offset
    File,

    /// Block device, addressed by offset
    Block,

    /// Remote object storage
    Object,
}

impl SegmentKind {
    /// Whether descriptors of this kind carry byte offsets into a file-like
    /// object rather than virtual addresses.
    pub fn is_storage(&self) -> bool {
        matches!(self, SegmentKind::File | SegmentKind::Block | SegmentKind::Object)
    }
}

/// A contiguous byte range inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    /// Virtual/device address for memory, byte offset for storage.
    pub addr: u64,

    /// Length in bytes.
    pub len: u64,

    /// Device id for memory, file descriptor for storage.
    pub region_id: i32,
}

impl Descriptor {
    pub fn new(addr: u64, len: u64, region_id: i32) -> Self {
        Self {
            addr,
            len,
            region_id,
        }
    }

    /// One past the last byte of the range.
    #[inline]
    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.len)
    }

    /// True when `other` lies entirely inside this range of the same region.
    pub fn contains(&self, other: &Descriptor) -> bool {
        self.region_id == other.region_id && other.addr >= self.addr && other.end() <= self.end()
    }

    /// True when both ranges share at least one byte of the same region.
    pub fn overlaps(&self, other: &Descriptor) -> bool {
        self.region_id == other.region_id && self.addr < other.end() && other.addr < self.end()
    }

    fn validate(&self) -> Result<()> {
        if self.len == 0 {
            return Err(XferError::descriptor(format!(
                "zero-length descriptor at addr {:#x} in region {}",
                self.addr, self.region_id
            )));
        }
        if self.addr.checked_add(self.len).is_none() {
            return Err(XferError::descriptor(format!(
                "descriptor at addr {:#x} with len {} overflows the address space",
                self.addr, self.len
            )));
        }
        Ok(())
    }
}

/// An ordered sequence of descriptors sharing one segment kind.
///
/// Insertion does no validation; lists are validated when they are handed to
/// registration or transfer APIs, and [`DescriptorList::trim`] produces the
/// canonical form.
///
/// # Safety contract
///
/// For `DRAM` lists the address is a host pointer that backends dereference.
/// A `DRAM` range handed to [`crate::Agent::register_mem`] must stay allocated
/// until it is deregistered, and must not be aliased by other writers while a
/// request that uses it is in flight. See [`crate::Agent::register_mem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorList {
    kind: SegmentKind,
    descs: Vec<Descriptor>,
}

impl DescriptorList {
    pub fn new(kind: SegmentKind) -> Self {
        Self {
            kind,
            descs: Vec::new(),
        }
    }

    pub fn with_capacity(kind: SegmentKind, capacity: usize) -> Self {
        Self {
            kind,
            descs: Vec::with_capacity(capacity),
        }
    }

    /// Build a list from `(addr, len, region_id)` tuples.
    pub fn from_tuples<I>(kind: SegmentKind, tuples: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64, i32)>,
    {
        let descs = tuples
            .into_iter()
            .map(|(addr, len, region_id)| Descriptor::new(addr, len, region_id))
            .collect();
        Self { kind, descs }
    }

    pub(crate) fn from_descs(kind: SegmentKind, descs: Vec<Descriptor>) -> Self {
        Self { kind, descs }
    }

    #[inline]
    pub fn add_desc(&mut self, desc: Descriptor) {
        self.descs.push(desc);
    }

    #[inline]
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Descriptor> {
        self.descs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Descriptor> {
        self.descs.iter()
    }

    pub fn as_slice(&self) -> &[Descriptor] {
        &self.descs
    }

    pub fn clear(&mut self) {
        self.descs.clear();
    }

    /// Sum of all descriptor lengths, saturating at `u64::MAX`.
    pub fn total_bytes(&self) -> u64 {
        self.descs
            .iter()
            .fold(0u64, |acc, d| acc.saturating_add(d.len))
    }

    /// Check that every descriptor is non-empty and does not wrap around the
    /// address space.
    pub fn validate(&self) -> Result<()> {
        self.descs.iter().try_for_each(Descriptor::validate)
    }

    /// True when the list is ordered by `(region_id, addr)`.
    pub fn is_sorted(&self) -> bool {
        self.descs
            .windows(2)
            .all(|w| (w[0].region_id, w[0].addr) <= (w[1].region_id, w[1].addr))
    }

    /// True when two descriptors of the same region share any byte.
    pub fn has_overlaps(&self) -> bool {
        let mut sorted = self.descs.clone();
        sorted.sort_unstable_by_key(|d| (d.region_id, d.addr));
        sorted.windows(2).any(|w| w[0].overlaps(&w[1]))
    }

    /// Canonicalize the list.
    ///
    /// The result is sorted by `(region_id, addr)`; descriptors of the same
    /// region that overlap or touch are merged, which also removes
    /// duplicates. Trimming an empty list yields an empty list. Fails with
    /// [`XferError::Descriptor`] if a descriptor is empty or overflows.
    pub fn trim(&self) -> Result<DescriptorList> {
        self.validate()?;

        Ok(DescriptorList {
            kind: self.kind,
            descs: merge_ranges(self.descs.clone()),
        })
    }
}

/// Sort by `(region_id, addr)` and coalesce touching or overlapping ranges.
/// Inputs must already be validated.
pub(crate) fn merge_ranges(mut descs: Vec<Descriptor>) -> Vec<Descriptor> {
    descs.sort_unstable_by_key(|d| (d.region_id, d.addr, d.len));

    let mut merged: Vec<Descriptor> = Vec::with_capacity(descs.len());
    for desc in descs {
        match merged.last_mut() {
            Some(last) if last.region_id == desc.region_id && desc.addr <= last.end() => {
                let end = last.end().max(desc.end());
                last.len = end - last.addr;
            }
            _ => merged.push(desc),
        }
    }
    merged
}

impl<'a> IntoIterator for &'a DescriptorList {
    type Item = &'a Descriptor;
    type IntoIter = std::slice::Iter<'a, Descriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descs.iter()
    }
}

/// One equal-length piece of a transfer: a source range paired with a
/// destination range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferSegment {
    pub src: Descriptor,
    pub dst: Descriptor,
}

impl XferSegment {
    #[inline]
    pub fn len(&self) -> u64 {
        self.src.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.src.len == 0
    }
}

/// Pair two lists as byte streams.
///
/// Both lists are walked in caller order and split wherever either side
/// crosses a descriptor boundary, so each resulting segment has the same
/// length on both sides. The lists must describe the same number of bytes.
pub(crate) fn pair_segments(src: &DescriptorList, dst: &DescriptorList) -> Result<Vec<XferSegment>> {
    let src_total = src.total_bytes();
    let dst_total = dst.total_bytes();
    if src_total != dst_total {
        return Err(XferError::descriptor(format!(
            "source describes {src_total} bytes but destination describes {dst_total} bytes"
        )));
    }

    let mut segments = Vec::with_capacity(src.len().max(dst.len()));
    let (mut i, mut j) = (0usize, 0usize);
    let (mut src_off, mut dst_off) = (0u64, 0u64);

    while i < src.descs.len() && j < dst.descs.len() {
        let s = src.descs[i];
        let d = dst.descs[j];
        let take = (s.len - src_off).min(d.len - dst_off);

        segments.push(XferSegment {
            src: Descriptor::new(s.addr + src_off, take, s.region_id),
            dst: Descriptor::new(d.addr + dst_off, take, d.region_id),
        });

        src_off += take;
        dst_off += take;
        if src_off == s.len {
            i += 1;
            src_off = 0;
        }
        if dst_off == d.len {
            j += 1;
            dst_off = 0;
        }
    }

    Ok(segments)
}

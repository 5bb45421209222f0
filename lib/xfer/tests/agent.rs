// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use rstest::rstest;

use dynamo_xfer::testing::{BackendCall, Completion, ScriptedFactory};
use dynamo_xfer::{
    Agent, AgentConfig, BackendCapabilities, BackendParams, DescriptorList, SegmentKind,
    TransportError, XferError, XferOp, XferOptions, XferReqHandle, XferStatus,
};

const MIB: u64 = 1024 * 1024;
const AGENT: &str = "initiator";

fn list(kind: SegmentKind, tuples: &[(u64, u64, i32)]) -> DescriptorList {
    DescriptorList::from_tuples(kind, tuples.iter().copied())
}

fn vram_file_caps() -> BackendCapabilities {
    BackendCapabilities::new()
        .with_bidirectional(SegmentKind::Vram, SegmentKind::File)
        .with_bidirectional(SegmentKind::Dram, SegmentKind::File)
}

fn agent() -> Agent {
    Agent::new(AGENT, AgentConfig::default()).unwrap()
}

fn add_scripted(agent: &Agent, factory: ScriptedFactory) -> Arc<ScriptedFactory> {
    let factory = Arc::new(factory);
    agent.register_plugin(factory.clone()).unwrap();
    agent
        .create_backend(dynamo_xfer::BackendFactory::name(factory.as_ref()), &BackendParams::new())
        .unwrap();
    factory
}

fn poll_until_terminal(agent: &Agent, handle: XferReqHandle) -> XferStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = agent.get_xfer_status(handle).unwrap();
        if status.is_terminal() || Instant::now() > deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_vram_to_file_write_selects_file_backend() {
    let agent = agent();
    agent.add_backend("POSIX").unwrap();
    let gds = add_scripted(&agent, ScriptedFactory::new("GDS", vram_file_caps()));

    let vram = list(SegmentKind::Vram, &[(0x7f00_0000_0000, 10 * MIB, 1)]);
    let file = list(SegmentKind::File, &[(0, 10 * MIB, 7)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    let handle = agent
        .create_xfer_req(XferOp::Write, &vram, &file, AGENT, None)
        .unwrap();
    assert_eq!(agent.xfer_backend(handle).unwrap(), agent.backend_handle("GDS").unwrap());
    assert_eq!(agent.get_xfer_status(handle).unwrap(), XferStatus::Created);

    agent.post_xfer_req(handle).unwrap();
    assert_eq!(poll_until_terminal(&agent, handle), XferStatus::Done);
    agent.release_xfer_req(handle).unwrap();
    assert_eq!(agent.active_requests(), 0);

    let calls = gds.last().unwrap().calls();
    assert!(calls.contains(&BackendCall::Create(SegmentKind::Vram, SegmentKind::File)));
    assert_eq!(calls.last(), Some(&BackendCall::Release));
}

#[test]
fn test_tie_break_is_stable() {
    let agent = agent();
    let narrow = BackendCapabilities::new().with_pair(SegmentKind::Vram, SegmentKind::File);
    add_scripted(&agent, ScriptedFactory::new("ALPHA", narrow.clone()));
    add_scripted(&agent, ScriptedFactory::new("BETA", narrow));
    add_scripted(&agent, ScriptedFactory::new("GENERAL", vram_file_caps()));

    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 0)]);
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    // equally specific: the most recently created one wins, every time
    let beta = agent.backend_handle("BETA").unwrap();
    for _ in 0..16 {
        let handle = agent
            .create_xfer_req(XferOp::Write, &vram, &file, AGENT, None)
            .unwrap();
        assert_eq!(agent.xfer_backend(handle).unwrap(), beta);
        agent.post_xfer_req(handle).unwrap();
        assert_eq!(poll_until_terminal(&agent, handle), XferStatus::Done);
        agent.release_xfer_req(handle).unwrap();
    }

    let options = XferOptions::new().with_backend("general");
    let handle = agent
        .create_xfer_req(XferOp::Write, &vram, &file, AGENT, Some(&options))
        .unwrap();
    assert_eq!(
        agent.xfer_backend(handle).unwrap(),
        agent.backend_handle("GENERAL").unwrap()
    );
}

#[rstest]
#[case::empty_src(true, false)]
#[case::empty_dst(false, true)]
#[case::both_empty(true, true)]
fn test_empty_lists_are_rejected(#[case] empty_src: bool, #[case] empty_dst: bool) {
    let agent = agent();
    add_scripted(&agent, ScriptedFactory::new("GDS", vram_file_caps()));
    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 0)]);
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    let src = if empty_src { DescriptorList::new(SegmentKind::Vram) } else { vram };
    let dst = if empty_dst { DescriptorList::new(SegmentKind::File) } else { file };
    assert_matches!(
        agent.create_xfer_req(XferOp::Write, &src, &dst, AGENT, None),
        Err(XferError::Descriptor(_))
    );
    assert_eq!(agent.active_requests(), 0);
}

#[test]
fn test_deregister_unknown_leaves_table_unchanged() {
    let agent = agent();
    let gds = add_scripted(&agent, ScriptedFactory::new("GDS", vram_file_caps()));
    let file = list(SegmentKind::File, &[(0, 4096, 7)]);
    agent.register_mem(&file).unwrap();
    let before = agent.registered_regions();

    assert_matches!(
        agent.deregister_mem(&list(SegmentKind::File, &[(0, 4096, 8)])),
        Err(XferError::NotRegistered(_))
    );
    // a sub-range of a registered list is not that list
    assert_matches!(
        agent.deregister_mem(&list(SegmentKind::File, &[(0, 1024, 7)])),
        Err(XferError::NotRegistered(_))
    );
    assert_matches!(
        agent.deregister_mem(&DescriptorList::new(SegmentKind::File)),
        Err(XferError::NotRegistered(_))
    );

    assert_eq!(agent.registered_regions(), before);
    assert_eq!(*agent.region_info(SegmentKind::File, 7).unwrap().refs(), 1);
    assert!(gds.last().unwrap().holds_region(SegmentKind::File, 7));

    // an unsorted, duplicated spelling of the same list still matches
    let respelled = list(SegmentKind::File, &[(2048, 2048, 7), (0, 2048, 7), (0, 1024, 7)]);
    agent.deregister_mem(&respelled).unwrap();
    assert!(agent.registered_regions().is_empty());
}

#[test]
fn test_release_rules() {
    let agent = agent();
    let gds = add_scripted(
        &agent,
        ScriptedFactory::new("GDS", vram_file_caps()).with_completion(Completion::Manual),
    );
    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 0)]);
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    let handle = agent
        .create_xfer_req(XferOp::Read, &vram, &file, AGENT, None)
        .unwrap();
    agent.post_xfer_req(handle).unwrap();
    assert_eq!(agent.get_xfer_status(handle).unwrap(), XferStatus::InProgress);
    assert_matches!(agent.release_xfer_req(handle), Err(XferError::RequestBusy(_)));
    assert_matches!(agent.post_xfer_req(handle), Err(XferError::RequestBusy(_)));

    gds.last().unwrap().fail_all(TransportError::new(5, "device reset"));
    assert_eq!(
        agent.get_xfer_status(handle).unwrap(),
        XferStatus::Error(TransportError::new(5, "device reset"))
    );
    agent.release_xfer_req(handle).unwrap();

    assert_matches!(agent.get_xfer_status(handle), Err(XferError::InvalidHandle(_)));
    assert_matches!(agent.post_xfer_req(handle), Err(XferError::InvalidHandle(_)));
    assert_matches!(agent.release_xfer_req(handle), Err(XferError::InvalidHandle(_)));
    assert_matches!(agent.xfer_backend(handle), Err(XferError::InvalidHandle(_)));

    // the released slot is reused without reviving the old handle
    let next = agent
        .create_xfer_req(XferOp::Read, &vram, &file, AGENT, None)
        .unwrap();
    assert_ne!(next, handle);
    assert_matches!(agent.get_xfer_status(handle), Err(XferError::InvalidHandle(_)));
    assert_eq!(agent.get_xfer_status(next).unwrap(), XferStatus::Created);
}

#[test]
fn test_never_posted_request_is_not_released() {
    let agent = agent();
    let gds = add_scripted(&agent, ScriptedFactory::new("GDS", vram_file_caps()));
    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 0)]);
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    let handle = agent
        .create_xfer_req(XferOp::Write, &vram, &file, AGENT, None)
        .unwrap();
    assert_matches!(agent.release_xfer_req(handle), Err(XferError::RequestBusy(_)));
    assert_eq!(agent.get_xfer_status(handle).unwrap(), XferStatus::Created);
    assert_eq!(agent.active_requests(), 1);
    assert!(!gds.last().unwrap().calls().contains(&BackendCall::Release));

    agent.post_xfer_req(handle).unwrap();
    assert_eq!(poll_until_terminal(&agent, handle), XferStatus::Done);
    agent.release_xfer_req(handle).unwrap();
    assert_eq!(agent.active_requests(), 0);
}

#[test]
fn test_failed_backend_release_keeps_handle() {
    let agent = agent();
    let gds = add_scripted(&agent, ScriptedFactory::new("GDS", vram_file_caps()));
    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 0)]);
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    let handle = agent
        .create_xfer_req(XferOp::Write, &vram, &file, AGENT, None)
        .unwrap();
    agent.post_xfer_req(handle).unwrap();
    assert_eq!(poll_until_terminal(&agent, handle), XferStatus::Done);

    gds.last()
        .unwrap()
        .fail_next_release(XferError::ResourceExhausted("release queue full".to_string()));
    assert_matches!(agent.release_xfer_req(handle), Err(XferError::ResourceExhausted(_)));

    // still live and usable
    assert_eq!(agent.get_xfer_status(handle).unwrap(), XferStatus::Done);
    assert_eq!(agent.active_requests(), 1);
    agent.post_xfer_req(handle).unwrap();
    assert_eq!(poll_until_terminal(&agent, handle), XferStatus::Done);

    agent.release_xfer_req(handle).unwrap();
    assert_matches!(agent.get_xfer_status(handle), Err(XferError::InvalidHandle(_)));
}

#[test]
fn test_repost_after_done() {
    let agent = agent();
    let gds = add_scripted(
        &agent,
        ScriptedFactory::new("GDS", vram_file_caps()).with_completion(Completion::Manual),
    );
    let dram = list(SegmentKind::Dram, &[(0x1000, 4096, 0)]);
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&dram).unwrap();
    agent.register_mem(&file).unwrap();

    let handle = agent
        .create_xfer_req(XferOp::Write, &dram, &file, AGENT, None)
        .unwrap();
    for _ in 0..3 {
        agent.post_xfer_req(handle).unwrap();
        gds.last().unwrap().complete_all();
        assert_eq!(agent.get_xfer_status(handle).unwrap(), XferStatus::Done);
    }
    let posts = gds
        .last()
        .unwrap()
        .calls()
        .into_iter()
        .filter(|c| *c == BackendCall::Post)
        .count();
    assert_eq!(posts, 3);
}

#[test]
fn test_routing_skips_uninterested_backends() {
    let agent = agent();
    agent.add_backend("MEMCPY").unwrap();
    let vram_only = add_scripted(
        &agent,
        ScriptedFactory::new(
            "VRAM_ONLY",
            BackendCapabilities::new().with_pair(SegmentKind::Vram, SegmentKind::Vram),
        ),
    );

    let buffer = vec![0u8; 256];
    let dram = list(SegmentKind::Dram, &[(buffer.as_ptr() as u64, 256, 0)]);
    agent.register_mem(&dram).unwrap();
    agent.deregister_mem(&dram).unwrap();

    assert!(vram_only.last().unwrap().calls().is_empty());
}

#[test]
fn test_no_suitable_backend() {
    let agent = agent();
    add_scripted(&agent, ScriptedFactory::new("GDS", vram_file_caps()));

    // nothing handles OBJECT segments at all
    assert_matches!(
        agent.register_mem(&list(SegmentKind::Object, &[(0, 64, 1)])),
        Err(XferError::NoSuitableBackend { .. })
    );

    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 0)]);
    let other_vram = list(SegmentKind::Vram, &[(0x9000, 4096, 1)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&other_vram).unwrap();

    assert_eq!(
        agent.create_xfer_req(XferOp::Write, &vram, &other_vram, AGENT, None),
        Err(XferError::NoSuitableBackend {
            src: SegmentKind::Vram,
            dst: SegmentKind::Vram
        })
    );

    // preferring a backend that cannot serve the pair leaves no candidate
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&file).unwrap();
    let options = XferOptions::new().with_backend("POSIX");
    assert_matches!(
        agent.create_xfer_req(XferOp::Write, &vram, &file, AGENT, Some(&options)),
        Err(XferError::NoSuitableBackend { .. })
    );
    assert_eq!(agent.active_requests(), 0);
}

#[test]
fn test_unregistered_region_produces_no_request() {
    let agent = agent();
    let gds = add_scripted(&agent, ScriptedFactory::new("GDS", vram_file_caps()));
    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 1)]);
    agent.register_mem(&vram).unwrap();

    let file = list(SegmentKind::File, &[(0, 4096, 7)]);
    assert_matches!(
        agent.create_xfer_req(XferOp::Write, &vram, &file, AGENT, None),
        Err(XferError::NotRegistered(_))
    );

    // registered region, but the range runs past what was registered
    agent.register_mem(&file).unwrap();
    let too_long = list(SegmentKind::Vram, &[(0x1000, 8192, 1)]);
    let file_long = list(SegmentKind::File, &[(0, 8192, 7)]);
    assert_matches!(
        agent.create_xfer_req(XferOp::Write, &too_long, &file_long, AGENT, None),
        Err(XferError::NotRegistered(_))
    );

    assert_eq!(agent.active_requests(), 0);
    let creates = gds
        .last()
        .unwrap()
        .calls()
        .into_iter()
        .filter(|c| matches!(c, BackendCall::Create(..)))
        .count();
    assert_eq!(creates, 0);
}

#[test]
fn test_in_flight_limit() {
    let agent = agent();
    let gds = add_scripted(
        &agent,
        ScriptedFactory::new("GDS", vram_file_caps())
            .with_completion(Completion::Manual)
            .with_max_inflight(1),
    );
    let vram = list(SegmentKind::Vram, &[(0x1000, 8192, 0)]);
    let file = list(SegmentKind::File, &[(0, 8192, 3)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    let first = agent
        .create_xfer_req(
            XferOp::Write,
            &list(SegmentKind::Vram, &[(0x1000, 4096, 0)]),
            &list(SegmentKind::File, &[(0, 4096, 3)]),
            AGENT,
            None,
        )
        .unwrap();
    let second = agent
        .create_xfer_req(
            XferOp::Write,
            &list(SegmentKind::Vram, &[(0x2000, 4096, 0)]),
            &list(SegmentKind::File, &[(4096, 4096, 3)]),
            AGENT,
            None,
        )
        .unwrap();

    agent.post_xfer_req(first).unwrap();
    assert_matches!(agent.post_xfer_req(second), Err(XferError::ResourceExhausted(_)));
    assert_matches!(agent.get_xfer_status(second).unwrap(), XferStatus::Error(_));

    gds.last().unwrap().complete_all();
    assert_eq!(agent.get_xfer_status(first).unwrap(), XferStatus::Done);

    // capacity is back, the failed request can be posted again
    agent.post_xfer_req(second).unwrap();
    gds.last().unwrap().complete_all();
    assert_eq!(agent.get_xfer_status(second).unwrap(), XferStatus::Done);
}

#[test]
fn test_handles_do_not_cross_agents() {
    let first = agent();
    let second = Agent::new("other", AgentConfig::default()).unwrap();
    for agent in [&first, &second] {
        add_scripted(agent, ScriptedFactory::new("GDS", vram_file_caps()));
        agent.register_mem(&list(SegmentKind::Vram, &[(0x1000, 4096, 0)])).unwrap();
        agent.register_mem(&list(SegmentKind::File, &[(0, 4096, 3)])).unwrap();
    }

    let handle = first
        .create_xfer_req(
            XferOp::Write,
            &list(SegmentKind::Vram, &[(0x1000, 4096, 0)]),
            &list(SegmentKind::File, &[(0, 4096, 3)]),
            AGENT,
            None,
        )
        .unwrap();
    assert_matches!(second.get_xfer_status(handle), Err(XferError::InvalidHandle(_)));
    assert_matches!(second.release_xfer_req(handle), Err(XferError::InvalidHandle(_)));

    let backend = first.backend_handle("GDS").unwrap();
    assert_matches!(second.backend_params(backend), Err(XferError::InvalidHandle(_)));
    assert!(first.backend_params(backend).is_ok());
}

#[test]
fn test_backend_creation_errors() {
    let agent = agent();
    assert_matches!(
        agent.create_backend("UCX", &BackendParams::new()),
        Err(XferError::InvalidConfig(_))
    );
    assert_matches!(
        agent.create_backend("POSIX", &BackendParams::new().with("queue_depth", "8")),
        Err(XferError::InvalidConfig(_))
    );
    assert_matches!(
        agent.create_backend("POSIX", &BackendParams::new().with("max_inflight", "lots")),
        Err(XferError::InvalidConfig(_))
    );
    assert!(!agent.has_backend("POSIX"));

    let factory = Arc::new(ScriptedFactory::new("GDS", vram_file_caps()));
    agent.register_plugin(factory.clone()).unwrap();
    assert_matches!(
        agent.register_plugin(factory.clone()),
        Err(XferError::AlreadyRegistered(_))
    );
    assert_matches!(
        agent.create_backend("GDS", &BackendParams::new().with("fail_create", "no device")),
        Err(XferError::InvalidConfig(_))
    );
    assert_eq!(factory.created(), 0);
    assert_eq!(agent.available_plugins(), vec!["GDS", "MEMCPY", "POSIX"]);
}

#[tokio::test]
async fn test_completion_notifications() {
    let agent = agent();
    let gds = add_scripted(
        &agent,
        ScriptedFactory::new("GDS", vram_file_caps()).with_completion(Completion::Manual),
    );
    let vram = list(SegmentKind::Vram, &[(0x1000, 4096, 0)]);
    let file = list(SegmentKind::File, &[(0, 4096, 3)]);
    agent.register_mem(&vram).unwrap();
    agent.register_mem(&file).unwrap();

    let handle = agent
        .create_xfer_req(XferOp::Write, &vram, &file, AGENT, None)
        .unwrap();
    assert_matches!(agent.notify_on_completion(handle), Err(XferError::InvalidHandle(_)));

    agent.post_xfer_req(handle).unwrap();
    let notification = agent.notify_on_completion(handle).unwrap();
    gds.last().unwrap().complete_all();
    notification.await.unwrap();

    // already finished: resolves right away
    agent.notify_on_completion(handle).unwrap().await.unwrap();

    agent.post_xfer_req(handle).unwrap();
    let notification = agent.notify_on_completion(handle).unwrap();
    gds.last().unwrap().fail_all(TransportError::new(28, "no space left"));
    assert_eq!(
        notification.await,
        Err(XferError::BackendTransport {
            backend: "GDS".to_string(),
            code: 28,
            message: "no space left".to_string(),
        })
    );
}

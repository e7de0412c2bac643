// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use assert_matches::assert_matches;
use rstest::rstest;

use common::{Buffer, config, connect_pair, engine, eventually, share, wait_complete};
use dynamo_ucx::transport::loopback::LoopbackFabric;
use dynamo_ucx::{BackendEngine, BackendError, Notification, XferOp, XferOptArgs, XferStatus};

fn collect(engine: &common::Engine, want: usize) -> Vec<Notification> {
    let mut all = Vec::new();
    eventually("notifications", || {
        let mut batch = Vec::new();
        engine.get_notifs(&mut batch).unwrap();
        all.extend(batch);
        (all.len() >= want).then_some(())
    });
    all
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_notification_reaches_peer_once(#[case] progress_thread: bool) {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(2, progress_thread));
    let b = engine(&fabric, "B", config(2, progress_thread));
    connect_pair(&a, &b);

    a.gen_notif("B", "hello").unwrap();
    assert_eq!(collect(&b, 1), vec![Notification::new("A", "hello")]);

    let mut again = Vec::new();
    b.get_notifs(&mut again).unwrap();
    assert!(again.is_empty());

    // nothing came back the other way
    let mut none = Vec::new();
    a.get_notifs(&mut none).unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_destination_must_be_empty() {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(1, false));
    let b = engine(&fabric, "B", config(1, false));
    connect_pair(&a, &b);

    a.gen_notif("B", "kept").unwrap();
    let mut dest = vec![Notification::new("x", "stale")];
    assert_matches!(b.get_notifs(&mut dest), Err(BackendError::InvalidParam(_)));
    assert_eq!(dest, vec![Notification::new("x", "stale")]);

    // the failed call lost nothing
    let mut dest = Vec::new();
    b.get_notifs(&mut dest).unwrap();
    assert_eq!(dest, vec![Notification::new("A", "kept")]);
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_notifications_keep_send_order(#[case] progress_thread: bool) {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(1, false));
    let b = engine(&fabric, "B", config(2, progress_thread));
    connect_pair(&a, &b);

    let sent: Vec<String> = (0..100).map(|i| format!("msg-{i}")).collect();
    for msg in &sent {
        a.gen_notif("B", msg).unwrap();
    }

    let received: Vec<String> = collect(&b, sent.len()).into_iter().map(|n| n.msg).collect();
    assert_eq!(received, sent);
}

#[test]
fn test_notifications_from_several_peers() {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(1, false));
    let b = engine(&fabric, "B", config(1, false));
    let c = engine(&fabric, "C", config(1, false));
    connect_pair(&a, &b);
    connect_pair(&c, &b);

    a.gen_notif("B", "from a").unwrap();
    c.gen_notif("B", "from c").unwrap();

    let mut got = collect(&b, 2);
    got.sort_by(|x, y| x.agent.cmp(&y.agent));
    assert_eq!(
        got,
        vec![
            Notification::new("A", "from a"),
            Notification::new("C", "from c"),
        ]
    );
}

#[test]
fn test_large_notification_needs_sender_progress() {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(1, false));
    let b = engine(&fabric, "B", config(1, false));
    connect_pair(&a, &b);

    let msg = "x".repeat(16 * 1024);
    a.gen_notif("B", &msg).unwrap();

    let mut dest = Vec::new();
    b.get_notifs(&mut dest).unwrap();
    assert!(dest.is_empty());

    a.progress();
    b.get_notifs(&mut dest).unwrap();
    assert_eq!(dest, vec![Notification::new("A", msg)]);
}

#[test]
fn test_notification_to_unknown_agent() {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(1, false));
    assert_matches!(a.gen_notif("nobody", "hi"), Err(BackendError::NotFound(_)));
}

#[test]
fn test_transfer_notification_follows_completion() {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(1, false));
    let b = engine(&fabric, "B", config(1, false));
    connect_pair(&a, &b);

    let src = Buffer::pattern(8192, 7);
    let dst = Buffer::zeroed(8192);
    let src_md = src.register(&a);
    let dst_md = dst.register(&b);
    let remote_md = share(&b, &dst, &dst_md, &a);
    let local = src.slices(&[8192], &src_md);
    let remote = dst.slices(&[8192], &remote_md);

    let args = XferOptArgs::with_notification("done");
    let mut handle = a
        .prep_xfer(XferOp::Write, &local, &remote, "B", Some(&args))
        .unwrap();
    let status = a
        .post_xfer(XferOp::Write, &local, &remote, "B", &mut handle, Some(&args))
        .unwrap();
    assert_eq!(status, XferStatus::InProgress);

    // held back while the data is in flight
    let mut dest = Vec::new();
    b.get_notifs(&mut dest).unwrap();
    assert!(dest.is_empty());

    wait_complete(&a, &mut handle);
    assert_eq!(dst.bytes(), src.bytes());
    assert_eq!(collect(&b, 1), vec![Notification::new("A", "done")]);

    // sent exactly once
    assert_eq!(a.check_xfer(&mut handle).unwrap(), XferStatus::Complete);
    let mut dest = Vec::new();
    b.get_notifs(&mut dest).unwrap();
    assert!(dest.is_empty());
}

#[test]
fn test_small_transfer_notifies_immediately() {
    let fabric = LoopbackFabric::new();
    let a = engine(&fabric, "A", config(1, false));
    let b = engine(&fabric, "B", config(1, false));
    connect_pair(&a, &b);

    let src = Buffer::pattern(16, 7);
    let dst = Buffer::zeroed(16);
    let src_md = src.register(&a);
    let dst_md = dst.register(&b);
    let remote_md = share(&b, &dst, &dst_md, &a);
    let local = src.slices(&[16], &src_md);
    let remote = dst.slices(&[16], &remote_md);

    let args = XferOptArgs::with_notification("tiny");
    let mut handle = a
        .prep_xfer(XferOp::Write, &local, &remote, "B", Some(&args))
        .unwrap();
    let status = a
        .post_xfer(XferOp::Write, &local, &remote, "B", &mut handle, Some(&args))
        .unwrap();
    assert_eq!(status, XferStatus::Complete);

    let mut dest = Vec::new();
    b.get_notifs(&mut dest).unwrap();
    assert_eq!(dest, vec![Notification::new("A", "tiny")]);
}

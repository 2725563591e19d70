//! End-to-end kernel lifecycle against the in-process fake gateway.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{WAIT, manager_for, setup, spawn_gateway};
use kgate_core::constants::KERNEL_USERNAME_ENV;
use kgate_core::messages::{ReplyStatus, StreamName};
use kgate_core::{ExecutionState, KernelId, OutputEnvelope};
use kgate_gateway::{GatewayError, KernelStatus, OutputReceiver};

async fn next_of_type(rx: &mut OutputReceiver, msg_type: &str) -> OutputEnvelope {
    tokio::time::timeout(WAIT, async {
        loop {
            let envelope = rx.recv().await.expect("listener closed");
            if envelope.msg_type == msg_type {
                return envelope;
            }
        }
    })
    .await
    .expect("timed out waiting for output")
}

#[tokio::test]
async fn start_and_execute_returns_result() {
    let (gw, manager) = setup().await;

    let kernel = manager.start_kernel(Some("python3"), "alice").await.unwrap();
    assert_eq!(kernel.status, KernelStatus::Running);
    assert_eq!(kernel.name, "python3");
    assert!(kernel.session_id.is_some());

    let outcome = manager
        .execute_sync(&kernel.id, "1+1", None)
        .await
        .unwrap();
    assert_eq!(outcome.status(), Some(ReplyStatus::Ok));
    assert_eq!(outcome.result_text(), Some("2"));
    assert_eq!(outcome.execution_count(), Some(1));
    assert!(outcome.outputs.iter().all(|o| o.is_child_of(outcome.msg_id.as_str())));

    let env = gw.kernel_env(kernel.id.as_str()).unwrap();
    assert_eq!(env.get(KERNEL_USERNAME_ENV).map(String::as_str), Some("alice"));
    manager.shutdown_all().await;
}

#[tokio::test]
async fn unbounded_timeout_waits_for_idle() {
    let (_gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();

    let outcome = manager
        .execute_sync(&kernel.id, "1+1", Some(Duration::MAX))
        .await
        .unwrap();
    assert_eq!(outcome.status(), Some(ReplyStatus::Ok));
    assert_eq!(outcome.result_text(), Some("2"));
    manager.shutdown_all().await;
}

#[tokio::test]
async fn default_spec_is_used_without_a_name() {
    let (_gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();
    assert_eq!(kernel.name, "python3");
    manager.shutdown_all().await;
}

#[tokio::test]
async fn stream_output_and_errors_are_collected() {
    let (_gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();

    let printed = manager
        .execute_sync(&kernel.id, "print('hello')", None)
        .await
        .unwrap();
    assert_eq!(printed.stream_text(StreamName::Stdout), "hello\n");
    assert!(printed.result_text().is_none());

    let failed = manager
        .execute_sync(&kernel.id, "raise ValueError('boom')", None)
        .await
        .unwrap();
    assert_eq!(failed.status(), Some(ReplyStatus::Error));
    assert_eq!(failed.error().unwrap().content["ename"], "ValueError");
    manager.shutdown_all().await;
}

#[tokio::test]
async fn restart_keeps_id_and_reconnects_with_new_session() {
    let (gw, manager) = setup().await;
    let before = manager.start_kernel(None, "alice").await.unwrap();

    let after = manager.restart_kernel(&before.id).await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.status, KernelStatus::Running);
    assert_ne!(after.session_id, before.session_id);
    assert_eq!(gw.restarts(before.id.as_str()), 1);
    assert_eq!(manager.len(), 1);

    let outcome = manager
        .execute_sync(&before.id, "1+1", None)
        .await
        .unwrap();
    assert_eq!(outcome.result_text(), Some("2"));
    manager.shutdown_all().await;
}

#[tokio::test]
async fn every_listener_sees_the_same_output() {
    let (_gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();
    let mut first = manager.open_output_channel(&kernel.id, "first").unwrap();
    let mut second = manager.open_output_channel(&kernel.id, "second").unwrap();

    let msg_id = manager
        .execute_code(&kernel.id, "print('shared')")
        .await
        .unwrap();

    for rx in [&mut first, &mut second] {
        let stream = next_of_type(rx, "stream").await;
        assert_eq!(stream.content["text"], "shared\n");
        assert_eq!(stream.parent_id.as_deref(), Some(msg_id.as_str()));
    }
    manager.shutdown_all().await;
}

#[tokio::test]
async fn unregistered_listener_stops_receiving() {
    let (_gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();
    let mut rx = manager.open_output_channel(&kernel.id, "viewer").unwrap();

    assert!(manager.unregister_output_channel(&kernel.id, "viewer").unwrap());
    assert!(!manager.unregister_output_channel(&kernel.id, "viewer").unwrap());
    let _ = manager.execute_sync(&kernel.id, "1+1", None).await.unwrap();
    assert!(rx.recv().await.is_none());
    manager.shutdown_all().await;
}

#[tokio::test]
async fn stopping_unknown_kernel_makes_no_gateway_call() {
    let (gw, manager) = setup().await;
    let err = manager
        .stop_kernel(&KernelId::from("nope"))
        .await
        .unwrap_err();
    assert_matches!(err, GatewayError::KernelNotFound { .. });
    assert_eq!(err.http_status(), 404);
    assert!(gw.calls().is_empty());
}

#[tokio::test]
async fn stop_deletes_remote_kernel_and_forgets_it() {
    let (gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();
    let mut rx = manager.open_output_channel(&kernel.id, "viewer").unwrap();

    manager.stop_kernel(&kernel.id).await.unwrap();

    assert_eq!(gw.kernel_count(), 0);
    assert_eq!(gw.calls_matching("DELETE"), 1);
    assert!(manager.is_empty());
    assert!(rx.recv().await.is_none());
    assert_matches!(
        manager.execute_code(&kernel.id, "1+1").await,
        Err(GatewayError::KernelNotFound { .. })
    );
}

#[tokio::test]
async fn interrupt_goes_over_the_control_channel() {
    let (gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();

    manager.interrupt_kernel(&kernel.id).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while gw.interrupts.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(gw.calls_matching("POST /api/kernels/fake-1/interrupt"), 0);
    manager.shutdown_all().await;
}

#[tokio::test]
async fn reply_timeout_is_reported() {
    let (_gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();

    let err = manager
        .execute_sync(&kernel.id, "sleep", Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(err.http_status(), 408);

    // The kernel is still usable.
    let outcome = manager
        .execute_sync(&kernel.id, "1+1", None)
        .await
        .unwrap();
    assert_eq!(outcome.result_text(), Some("2"));
    manager.shutdown_all().await;
}

#[tokio::test]
async fn input_request_is_answered_through_the_manager() {
    let (_gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();
    let mut rx = manager.open_output_channel(&kernel.id, "viewer").unwrap();

    let msg_id = manager.execute_code(&kernel.id, "input()").await.unwrap();
    let prompt = next_of_type(&mut rx, "input_request").await;
    assert_eq!(prompt.parent_id.as_deref(), Some(msg_id.as_str()));

    let _ = manager.input_reply(&kernel.id, "typed").await.unwrap();
    let echoed = next_of_type(&mut rx, "stream").await;
    assert_eq!(echoed.content["text"], "typed\n");
    let reply = next_of_type(&mut rx, "execute_reply").await;
    assert_eq!(reply.content["status"], "ok");
    manager.shutdown_all().await;
}

#[tokio::test]
async fn lost_connection_marks_kernel_dead() {
    let (gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();
    let mut rx = manager.open_output_channel(&kernel.id, "viewer").unwrap();
    let handle = manager.kernel(&kernel.id).unwrap();

    gw.kill_connections();
    tokio::time::timeout(WAIT, async {
        while handle.status() != KernelStatus::Dead {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(rx.recv().await.is_none());
    let err = manager.execute_code(&kernel.id, "1+1").await.unwrap_err();
    assert_matches!(err, GatewayError::KernelDead { .. });
    assert_eq!(err.http_status(), 410);
    assert_matches!(
        manager.open_output_channel(&kernel.id, "late"),
        Err(GatewayError::KernelDead { .. })
    );

    // A dead kernel can still be stopped and cleaned up.
    manager.stop_kernel(&kernel.id).await.unwrap();
    assert_eq!(gw.kernel_count(), 0);
}

#[tokio::test]
async fn status_refresh_marks_vanished_kernel_dead() {
    let (gw, manager) = setup().await;
    let kernel = manager.start_kernel(None, "alice").await.unwrap();
    let _ = manager.execute_sync(&kernel.id, "1+1", None).await.unwrap();

    let status = manager.get_kernel_status(&kernel.id).await.unwrap();
    assert_eq!(status.status, KernelStatus::Running);
    assert_eq!(status.execution_state, ExecutionState::Idle);

    gw.forget(kernel.id.as_str());
    let status = manager.get_kernel_status(&kernel.id).await.unwrap();
    assert_eq!(status.status, KernelStatus::Dead);
    manager.shutdown_all().await;
}

#[tokio::test]
async fn failed_connect_deletes_the_created_kernel() {
    let (gw, manager) = setup().await;
    gw.refuse_ws.store(true, Ordering::SeqCst);

    let err = manager.start_kernel(None, "alice").await.unwrap_err();
    assert_matches!(err, GatewayError::Transport(_));
    assert_eq!(gw.calls_matching("POST /api/kernels"), 1);
    assert_eq!(gw.calls_matching("DELETE"), 1);
    assert_eq!(gw.kernel_count(), 0);
    assert!(manager.is_empty());
}

#[tokio::test]
async fn listing_filters_by_owner() {
    let (gw, manager) = setup().await;
    let a = manager.start_kernel(None, "alice").await.unwrap();
    let _b = manager.start_kernel(None, "bob").await.unwrap();

    assert_eq!(manager.list_kernels(None).len(), 2);
    let mine = manager.list_kernels(Some("alice"));
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, a.id);
    assert_eq!(manager.list_remote_kernels().await.unwrap().len(), 2);

    manager.shutdown_all().await;
    assert!(manager.is_empty());
    assert_eq!(gw.kernel_count(), 0);
}

#[tokio::test]
async fn kernel_specs_are_listed() {
    let (_gw, manager) = setup().await;
    let specs = manager.list_kernel_specs().await.unwrap();
    assert_eq!(specs.default, "python3");
    assert_eq!(specs.kernelspecs["python3"].spec.language, "python");
}

#[tokio::test]
async fn auth_token_reaches_the_websocket_handshake() {
    let (gw, url) = spawn_gateway().await;
    let manager = manager_for(&url, Some("s3cret"));
    let _kernel = manager.start_kernel(None, "alice").await.unwrap();

    assert_eq!(gw.last_ws_auth.lock().as_deref(), Some("token s3cret"));
    manager.shutdown_all().await;
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchbay_wire::{CallId, ErrorKind, LengthPrefixedFramed, Packet, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::calls::{CallHooks, CallShared, CallTarget};
use crate::queue::MessageQueue;

const TICK: Duration = Duration::from_secs(5);

/// `RUST_LOG=patchbay_session=trace cargo test` shows driver traffic.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn target(method: &str) -> CallTarget {
    CallTarget {
        ty: Some("T".into()),
        method: method.into(),
    }
}

/// Two connected endpoints with their drivers spawned.
fn pair(a_name: &str, b_name: &str) -> (ClientHandle, ClientHandle) {
    init_logging();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (handle_a, driver_a) = establish_stream(a, ConnectionConfig::named(a_name));
    let (handle_b, driver_b) = establish_stream(b, ConnectionConfig::named(b_name));
    tokio::spawn(driver_a.run());
    tokio::spawn(driver_b.run());
    (handle_a, handle_b)
}

fn echo_table() -> Arc<MethodTable> {
    Arc::new(MethodTable::new().method("say", |args: Vec<Value>| async move {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    }))
}

// ========================================================================
// Message queue
// ========================================================================

#[test]
fn queue_buffers_until_first_listener_then_flushes_in_order() {
    let queue = MessageQueue::new();
    queue.deliver(vec![Value::Int(1)]);
    queue.deliver(vec![Value::Int(2)]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queue.attach(Box::new(move |args| {
        sink.lock().unwrap().push(args[0].clone());
    }));
    queue.deliver(vec![Value::Int(3)]);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![Value::Int(1), Value::Int(2), Value::Int(3)]
    );
}

#[test]
fn queue_second_listener_sees_only_live_messages() {
    let queue = MessageQueue::new();
    queue.deliver(vec![Value::Int(1)]);

    queue.attach(Box::new(|_| {}));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queue.attach(Box::new(move |args| {
        sink.lock().unwrap().push(args[0].clone());
    }));
    queue.deliver(vec![Value::Int(2)]);

    assert_eq!(*seen.lock().unwrap(), vec![Value::Int(2)]);
}

// ========================================================================
// Pending call state
// ========================================================================

#[tokio::test]
async fn call_settles_at_most_once() {
    let shared = CallShared::new(target("m"), CallHooks::inert());
    assert!(shared.resolve(Value::Int(1)));
    assert!(!shared.reject(patchbay_wire::ErrorRecord::connection_closed("local")));
    assert!(!shared.resolve(Value::Int(2)));

    let call = PendingCall::from_shared(shared);
    assert_eq!(call.wait().await, Ok(Value::Int(1)));
}

#[tokio::test]
async fn every_awaiter_observes_the_same_outcome() {
    let shared = CallShared::new(target("m"), CallHooks::inert());
    let call = PendingCall::from_shared(shared.clone());

    let first = {
        let call = call.clone();
        tokio::spawn(async move { call.wait().await })
    };
    let second = {
        let call = call.clone();
        tokio::spawn(async move { call.wait().await })
    };

    tokio::task::yield_now().await;
    shared.resolve(Value::Str("done".into()));

    assert_eq!(first.await.unwrap(), Ok(Value::Str("done".into())));
    assert_eq!(second.await.unwrap(), Ok(Value::Str("done".into())));
}

// ========================================================================
// Local-path calls
// ========================================================================

#[tokio::test]
async fn local_call_resolves_without_touching_the_wire() {
    let (a, _b) = pair("alpha", "beta");
    a.register_types(vec![("Echo".into(), echo_table() as Arc<dyn TypeHandler>)])
        .await
        .unwrap();

    let result = a
        .call("Echo", "say", vec![Value::Str("hi".into())])
        .wait()
        .await;
    assert_eq!(result, Ok(Value::Str("hi".into())));
}

#[tokio::test]
async fn local_call_unknown_method_is_method_not_found() {
    let (a, _b) = pair("alpha", "beta");
    a.register_types(vec![("Echo".into(), echo_table() as Arc<dyn TypeHandler>)])
        .await
        .unwrap();

    let err = a.call("Echo", "nope", vec![]).wait().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::MethodNotFound);
}

#[tokio::test]
async fn local_call_streams_messages_and_observes_cancel() {
    let (a, _b) = pair("alpha", "beta");

    let table = MethodTable::new().method("run", |_args| async move {
        let cx = CallContext::current().expect("ambient context");
        cx.send_message(vec![Value::Int(1)]);
        cx.send_message(vec![Value::Int(2)]);
        cx.cancellation_token().cancelled().await;
        Ok(Value::Str("stopped".into()))
    });
    a.register_type("Job", Arc::new(table)).await.unwrap();

    let call = a.call("Job", "run", vec![]);
    call.cancel();
    let result = timeout(TICK, call.wait()).await.unwrap();
    assert_eq!(result, Ok(Value::Str("stopped".into())));

    // Messages sent before any listener replay to the first one.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    call.on_message(move |args| sink.lock().unwrap().push(args[0].clone()));
    assert_eq!(*seen.lock().unwrap(), vec![Value::Int(1), Value::Int(2)]);
}

#[tokio::test]
async fn local_caller_resolves_to_own_name() {
    let (a, _b) = pair("alpha", "beta");

    let table = MethodTable::new().method("who", |_args| async move {
        let cx = CallContext::current().expect("ambient context");
        Ok(Value::Str(cx.caller().await))
    });
    a.register_type("Ident", Arc::new(table)).await.unwrap();

    let result = a.call("Ident", "who", vec![]).wait().await;
    assert_eq!(result, Ok(Value::Str("alpha".into())));
}

#[tokio::test]
async fn local_handler_panic_becomes_wrapped_error() {
    let (a, _b) = pair("alpha", "beta");

    let table = MethodTable::new().method("boom", |_args| async move { panic!("kaboom") });
    a.register_type("Bomb", Arc::new(table)).await.unwrap();

    let err = a.call("Bomb", "boom", vec![]).wait().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Wrapped);
}

// ========================================================================
// Calls across a transport
// ========================================================================

#[tokio::test]
async fn remote_call_round_trips() {
    let (a, b) = pair("alpha", "beta");
    b.register_type("Echo", echo_table()).await.unwrap();

    let result = timeout(
        TICK,
        a.call("Echo", "say", vec![Value::Str("over the wire".into())])
            .wait(),
    )
    .await
    .unwrap();
    assert_eq!(result, Ok(Value::Str("over the wire".into())));
}

#[tokio::test]
async fn remote_unknown_type_is_remote_not_found() {
    let (a, _b) = pair("alpha", "beta");

    let err = timeout(TICK, a.call("Ghost", "say", vec![]).wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RemoteNotFound);
    assert_eq!(err.origin, "beta");
}

#[tokio::test]
async fn remote_streaming_messages_arrive_before_the_result() {
    let (a, b) = pair("alpha", "beta");

    let table = MethodTable::new().method("ticks", |_args| async move {
        let cx = CallContext::current().expect("ambient context");
        for n in 1..=3 {
            cx.send_message(vec![Value::Int(n)]);
        }
        Ok(Value::Str("done".into()))
    });
    b.register_type("Clock", Arc::new(table)).await.unwrap();

    let call = a.call("Clock", "ticks", vec![]);
    let result = timeout(TICK, call.wait()).await.unwrap();
    assert_eq!(result, Ok(Value::Str("done".into())));

    // Listener attached after the terminal packet still gets every message,
    // in send order.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    call.on_message(move |args| sink.lock().unwrap().push(args[0].clone()));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Value::Int(1), Value::Int(2), Value::Int(3)]
    );
}

#[tokio::test]
async fn remote_messages_flow_caller_to_callee() {
    let (a, b) = pair("alpha", "beta");

    let table = MethodTable::new().method("collect", |_args| async move {
        let cx = CallContext::current().expect("ambient context");
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(done_tx)));
        cx.on_message(move |args| {
            if args[0] == Value::Str("finish".into()) {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        });
        let _ = done_rx.await;
        Ok(Value::Str("collected".into()))
    });
    b.register_type("Sink", Arc::new(table)).await.unwrap();

    let call = a.call("Sink", "collect", vec![]);
    call.send_message(vec![Value::Str("finish".into())]);

    let result = timeout(TICK, call.wait()).await.unwrap();
    assert_eq!(result, Ok(Value::Str("collected".into())));
}

#[tokio::test]
async fn remote_cancel_is_advisory_not_terminal() {
    let (a, b) = pair("alpha", "beta");

    let table = MethodTable::new().method("run", |_args| async move {
        let cx = CallContext::current().expect("ambient context");
        cx.cancellation_token().cancelled().await;
        Ok(Value::Str("wound down".into()))
    });
    b.register_type("Job", Arc::new(table)).await.unwrap();

    let call = a.call("Job", "run", vec![]);
    assert!(!call.is_terminal());
    call.cancel();
    call.cancel(); // idempotent

    let result = timeout(TICK, call.wait()).await.unwrap();
    assert_eq!(result, Ok(Value::Str("wound down".into())));
}

#[tokio::test]
async fn with_cancellation_forwards_the_token() {
    let (a, b) = pair("alpha", "beta");

    let table = MethodTable::new().method("run", |_args| async move {
        let cx = CallContext::current().expect("ambient context");
        cx.cancellation_token().cancelled().await;
        Ok(Value::Null)
    });
    b.register_type("Job", Arc::new(table)).await.unwrap();

    let token = CancellationToken::new();
    let call = a.call("Job", "run", vec![]).with_cancellation(&token);
    token.cancel();

    let result = timeout(TICK, call.wait()).await.unwrap();
    assert_eq!(result, Ok(Value::Null));
}

#[tokio::test]
async fn remote_caller_name_falls_back_to_unknown_without_a_router() {
    let (a, b) = pair("alpha", "beta");

    let table = MethodTable::new().method("who", |_args| async move {
        let cx = CallContext::current().expect("ambient context");
        Ok(Value::Str(cx.caller().await))
    });
    b.register_type("Ident", Arc::new(table)).await.unwrap();

    let result = timeout(TICK, a.call("Ident", "who", vec![]).wait())
        .await
        .unwrap();
    assert_eq!(result, Ok(Value::Str(UNKNOWN_CALLER.into())));
}

#[tokio::test]
async fn close_rejects_outstanding_calls_with_connection_closed() {
    let (a, b) = pair("alpha", "beta");

    let table = MethodTable::new().method("hang", |_args| async move {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    });
    b.register_type("Tar", Arc::new(table)).await.unwrap();

    let call = a.call("Tar", "hang", vec![]);
    tokio::task::yield_now().await;
    a.close();

    let err = timeout(TICK, call.wait()).await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectionClosed);
}

#[tokio::test]
async fn oversized_call_is_rejected_locally_and_spares_the_connection() {
    init_logging();
    let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
    let (a, driver_a) = establish_stream(
        stream_a,
        ConnectionConfig {
            name: Some("alpha".into()),
            max_frame_len: 256,
        },
    );
    let (b, driver_b) = establish_stream(stream_b, ConnectionConfig::named("beta"));
    tokio::spawn(driver_a.run());
    tokio::spawn(driver_b.run());
    b.register_type("Echo", echo_table()).await.unwrap();

    let big = Value::Str("x".repeat(4096));
    let err = timeout(TICK, a.call("Echo", "say", vec![big]).wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Wrapped);
    assert_eq!(err.origin, "alpha");

    // The connection survived the refused call.
    let small = timeout(TICK, a.call("Echo", "say", vec![Value::Int(7)]).wait())
        .await
        .unwrap();
    assert_eq!(small, Ok(Value::Int(7)));
}

// ========================================================================
// Raw-peer harness
// ========================================================================

#[tokio::test]
async fn overcap_inbound_frame_spares_the_connection() {
    init_logging();
    let (stream, raw) = tokio::io::duplex(64 * 1024);
    let (handle, driver) = establish_stream(
        stream,
        ConnectionConfig {
            name: Some("leaf".into()),
            max_frame_len: 256,
        },
    );
    tokio::spawn(driver.run());
    // The raw side keeps the default cap, so it can emit frames the leaf
    // refuses to buffer.
    let mut raw = LengthPrefixedFramed::new(raw);

    handle
        .registry()
        .register(vec![("Echo".into(), echo_table() as Arc<dyn TypeHandler>)])
        .unwrap();

    raw.send(&Packet::Call {
        id: CallId(1),
        ty: Some("Echo".into()),
        method: "say".into(),
        args: vec![Value::Str("x".repeat(4096))],
    })
    .await
    .unwrap();

    // The oversized frame is skipped in full; the next call must go through.
    raw.send(&Packet::Call {
        id: CallId(2),
        ty: Some("Echo".into()),
        method: "say".into(),
        args: vec![Value::Int(7)],
    })
    .await
    .unwrap();

    let reply = timeout(TICK, raw.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(
        reply,
        Packet::Success {
            id: CallId(2),
            result: Value::Int(7),
        }
    );
}

#[tokio::test]
async fn stray_terminal_packets_are_ignored() {
    init_logging();
    let (stream, raw) = tokio::io::duplex(64 * 1024);
    let (handle, driver) = establish_stream(stream, ConnectionConfig::named("leaf"));
    tokio::spawn(driver.run());
    let mut raw = LengthPrefixedFramed::new(raw);

    handle
        .registry()
        .register(vec![("Echo".into(), echo_table() as Arc<dyn TypeHandler>)])
        .unwrap();

    // A terminal for an id we never issued must be dropped on the floor.
    raw.send(&Packet::Success {
        id: CallId(999),
        result: Value::Null,
    })
    .await
    .unwrap();

    raw.send(&Packet::Call {
        id: CallId(1),
        ty: Some("Echo".into()),
        method: "say".into(),
        args: vec![Value::Int(42)],
    })
    .await
    .unwrap();

    let reply = timeout(TICK, raw.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(
        reply,
        Packet::Success {
            id: CallId(1),
            result: Value::Int(42),
        }
    );
}

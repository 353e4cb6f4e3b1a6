//! Outgoing request correlation: terminal outcomes, id based reply
//! routing, streaming replies, cancellation, and connection loss.

mod common;

use serde::{Deserialize, Serialize};

use common::FakeHost;
use waypoint_rt_client::{Client, ClientConfig, RpcError, SceneConnectionState};

fn client_over(host: &FakeHost) -> Client {
    Client::new(ClientConfig::new("rpc-tests"), host.connection.clone())
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct ClockReading {
    ticks: u64,
    time: String,
}

#[tokio::test]
async fn completed_request_resolves_with_the_reply_payload() {
    let host = FakeHost::new();
    let client = client_over(&host);
    let scene = client.scene("main");

    let (connected, _) = tokio::join!(
        scene.connect(),
        host.accept_scene_connect(101, &[("clock.time", 200)])
    );
    connected.unwrap();

    let reading = ClockReading {
        ticks: 1000,
        time: "2024-01-01T00:00:00Z".to_owned(),
    };

    let pending = scene.rpc("clock.time", b"{}").unwrap();
    let request = host.expect_request().await;
    assert_eq!(request.route_handle, 200);
    host.reply_complete(
        request.route_handle,
        request.request_id,
        &serde_json::to_vec(&reading).unwrap(),
    );

    let bytes = pending.await_single().await.unwrap();
    assert_eq!(serde_json::from_slice::<ClockReading>(&bytes).unwrap(), reading);
    // the terminal reply removed the pending entry.
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test]
async fn typed_request_roundtrips_through_the_scene_serializer() {
    let host = FakeHost::new();
    let client = client_over(&host);
    let scene = client.scene("main");

    let (connected, _) = tokio::join!(
        scene.connect(),
        host.accept_scene_connect(101, &[("clock.time", 200)])
    );
    connected.unwrap();

    let serve = async {
        let request = host.expect_request().await;
        host.reply_complete(
            request.route_handle,
            request.request_id,
            &serde_json::to_vec(&ClockReading {
                ticks: 42,
                time: "2024-06-01T12:00:00Z".to_owned(),
            })
            .unwrap(),
        );
    };

    let (reading, _) = tokio::join!(scene.rpc_as::<(), ClockReading>("clock.time", &()), serve);
    assert_eq!(reading.unwrap().ticks, 42);
}

#[tokio::test]
async fn replies_are_correlated_by_request_id_not_arrival_order() {
    let host = FakeHost::new();
    let client = client_over(&host);
    let scene = client.scene("main");

    let (connected, _) = tokio::join!(
        scene.connect(),
        host.accept_scene_connect(101, &[("lookup", 200)])
    );
    connected.unwrap();

    let pending_a = scene.rpc("lookup", b"a").unwrap();
    let pending_b = scene.rpc("lookup", b"b").unwrap();

    let request_a = host.expect_request().await;
    let request_b = host.expect_request().await;
    assert_eq!(request_a.bytes, b"a");
    assert_eq!(request_b.bytes, b"b");

    // terminal replies fed in reverse order.
    host.reply_complete(request_b.route_handle, request_b.request_id, b"value-b");
    host.reply_complete(request_a.route_handle, request_a.request_id, b"value-a");

    assert_eq!(pending_b.await_single().await.unwrap(), b"value-b");
    assert_eq!(pending_a.await_single().await.unwrap(), b"value-a");
}

#[tokio::test]
async fn intermediate_values_stream_until_the_terminal_reply() {
    let host = FakeHost::new();
    let client = client_over(&host);
    let scene = client.scene("main");

    let (connected, _) = tokio::join!(
        scene.connect(),
        host.accept_scene_connect(101, &[("feed", 200)])
    );
    connected.unwrap();

    let mut pending = scene.rpc("feed", &[]).unwrap();
    let request = host.expect_request().await;
    host.reply_next(request.route_handle, request.request_id, b"first");
    host.reply_next(request.route_handle, request.request_id, b"second");
    host.reply_complete(request.route_handle, request.request_id, &[]);

    assert_eq!(pending.next_value().await.unwrap(), Some(b"first".to_vec()));
    assert_eq!(pending.next_value().await.unwrap(), Some(b"second".to_vec()));
    assert_eq!(pending.next_value().await.unwrap(), None);
}

#[tokio::test]
async fn error_reply_surfaces_the_remote_fault_verbatim() {
    let host = FakeHost::new();
    let client = client_over(&host);
    let scene = client.scene("main");

    let (connected, _) = tokio::join!(
        scene.connect(),
        host.accept_scene_connect(101, &[("lookup", 200)])
    );
    connected.unwrap();

    let pending = scene.rpc("lookup", &[]).unwrap();
    let request = host.expect_request().await;
    host.reply_error(request.route_handle, request.request_id, "no such entry");

    assert_eq!(
        pending.await_single().await.unwrap_err(),
        RpcError::RemoteFault("no such entry".to_owned())
    );
}

#[tokio::test]
async fn cancelling_a_request_notifies_the_host_best_effort() {
    let host = FakeHost::new();
    let client = client_over(&host);
    let scene = client.scene("main");

    let (connected, _) = tokio::join!(
        scene.connect(),
        host.accept_scene_connect(101, &[("lookup", 200)])
    );
    connected.unwrap();

    let pending = scene.rpc("lookup", &[]).unwrap();
    let request = host.expect_request().await;

    pending.cancel();
    assert_eq!(host.expect_cancel().await, request.request_id);
    assert_eq!(
        pending.await_single().await.unwrap_err(),
        RpcError::Cancelled
    );
    assert_eq!(client.pending_request_count(), 0);
}

#[tokio::test]
async fn connection_loss_fails_all_outstanding_requests() {
    let host = FakeHost::new();
    let client = client_over(&host);
    let scene = client.scene("main");

    let (seen_tx, seen_rx) = flume::unbounded::<()>();
    let _route = scene
        .add_route("watched", move |_packet| {
            let tx = seen_tx.clone();
            async move {
                let _ = tx.send(());
            }
        })
        .unwrap();

    let (connected, result) = tokio::join!(
        scene.connect(),
        host.accept_scene_connect(101, &[("lookup", 200)])
    );
    connected.unwrap();
    let watched_handle = common::local_handle(&result, "watched");

    let pending_a = scene.rpc("lookup", b"a").unwrap();
    let pending_b = scene.rpc("lookup", b"b").unwrap();
    let pending_c = scene.rpc("lookup", b"c").unwrap();
    assert_eq!(client.pending_request_count(), 3);

    host.connection.close_remote();

    for pending in [pending_a, pending_b, pending_c] {
        assert_eq!(
            pending.await_single().await.unwrap_err(),
            RpcError::ConnectionLost
        );
    }
    assert_eq!(client.pending_request_count(), 0);

    // the scene observed the closure and a stray packet for its old
    // route handle reaches no handler.
    assert_eq!(scene.state(), SceneConnectionState::Disconnected);
    host.push_message(watched_handle, b"stray");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(seen_rx.try_recv().is_err());
}

//! Cluster integration tests: a client driving real compute nodes over TCP.

use bytes::Bytes;
use dcl_core::driver::{DeviceInfo, ReferenceDriver};
use dcl_core::fabric::{BuildReport, EventState, EventStatus, Fabric};
use dcl_core::protocol::codec::{read_frame, write_frame};
use dcl_core::protocol::{Message, Request, Response};
use dcl_core::transport::{Connection, ConnectionTable, HandlerPool, Peer, Router};
use dcl_core::types::status;
use dcl_core::types::{
    Config, FabricConfig, IdMinter, NodeAddress, NodePrefix, ObjectId, PeerId, ReconnectPolicy,
    TransportConfig,
};
use dcl_core::{ClusterClient, ComputeNode, Error, ObjectKind};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const KERNEL_SOURCE: &str = "__kernel void scale(__global float* data, float factor) {}";

struct TestNode {
    node: Arc<ComputeNode>,
    driver: Arc<ReferenceDriver>,
    devices: Vec<ObjectId>,
    address: NodeAddress,
    task: tokio::task::JoinHandle<()>,
}

/// Helper: start a node with `device_count` reference devices on a free port.
async fn start_node(node_id: u16, device_count: usize) -> TestNode {
    let mut config = Config::default();
    config.node.node_id = node_id;
    config.node.listen_addr = "127.0.0.1:0".to_string();

    let minter = IdMinter::new(NodePrefix(node_id));
    let infos: Vec<DeviceInfo> = (0..device_count)
        .map(|i| DeviceInfo {
            id: minter.mint().unwrap(),
            name: format!("node{}-device{}", node_id, i),
        })
        .collect();
    let devices = infos.iter().map(|d| d.id).collect();
    let driver = Arc::new(ReferenceDriver::new(infos));

    let node = Arc::new(ComputeNode::with_driver(&config, driver.clone()).await.unwrap());
    let port = node.local_addr().unwrap().port();
    let serving = node.clone();
    let task = tokio::spawn(async move {
        let _ = serving.serve().await;
    });

    TestNode {
        node,
        driver,
        devices,
        address: NodeAddress::new("127.0.0.1", port),
        task,
    }
}

fn client_config() -> Config {
    let mut config = Config::default();
    config.node.node_id = 100;
    config.transport.request_timeout = Some(Duration::from_secs(5));
    config
}

async fn connect(nodes: &[&TestNode]) -> ClusterClient {
    let addresses: Vec<NodeAddress> = nodes.iter().map(|n| n.address.clone()).collect();
    ClusterClient::connect_to(&addresses, &client_config()).await.unwrap()
}

#[tokio::test]
async fn test_devices_discovered_across_nodes() {
    let a = start_node(1, 1).await;
    let b = start_node(2, 2).await;
    let client = connect(&[&a, &b]).await;

    let mut expected = a.devices.clone();
    expected.extend(&b.devices);
    assert_eq!(client.devices(), expected.as_slice());
    assert_eq!(client.device_name(b.devices[1]).as_deref(), Some("node2-device1"));
    assert_ne!(client.node_of(a.devices[0]).unwrap(), client.node_of(b.devices[0]).unwrap());

    let raw = client
        .get_info(ObjectKind::Device, a.devices[0], status::info::DEVICE_NAME)
        .await
        .unwrap();
    assert_eq!(&raw[..], b"node1-device0");
}

#[tokio::test]
async fn test_context_create_and_delete() {
    let a = start_node(1, 1).await;
    let client = connect(&[&a]).await;

    let context = client.create_context(&a.devices, None).await.unwrap();
    assert_eq!(context.prefix(), NodePrefix(100));
    assert!(a.node.registry().contains(context));

    client.release_context(context).await.unwrap();
    assert!(!a.node.registry().contains(context));
    assert!(client.registry().lookup(context).is_none());
}

#[tokio::test]
async fn test_context_spanning_nodes_lives_on_each_host() {
    let a = start_node(1, 1).await;
    let b = start_node(2, 1).await;
    let client = connect(&[&a, &b]).await;

    let devices = [a.devices[0], b.devices[0]];
    let context = client.create_context(&devices, None).await.unwrap();
    assert!(a.node.registry().contains(context));
    assert!(b.node.registry().contains(context));

    let buffer = client.create_buffer(context, 0, 1024).await.unwrap();
    assert!(a.node.registry().contains(buffer));
    assert!(b.node.registry().contains(buffer));
}

#[tokio::test]
async fn test_build_fan_in_reports_once_in_device_order() {
    let a = start_node(1, 1).await;
    let b = start_node(2, 2).await;
    b.driver.fail_builds_on(b.devices[1], status::INVALID_BUILD_OPTIONS);
    let client = connect(&[&a, &b]).await;

    let devices = [a.devices[0], b.devices[0], b.devices[1]];
    let context = client.create_context(&devices, None).await.unwrap();
    let program = client
        .create_program_with_source(context, KERNEL_SOURCE)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = calls.clone();
    let listener = move |report: &BuildReport| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(report.clone());
    };
    client
        .build_program(program, None, "", Arc::new(listener))
        .await
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        report.results,
        vec![
            (devices[0], 0),
            (devices[1], 0),
            (devices[2], status::INVALID_BUILD_OPTIONS),
        ]
    );
    assert_eq!(report.first_failure(), Some(status::INVALID_BUILD_OPTIONS));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!client.fabric().builds.is_pending(program));
}

#[tokio::test]
async fn test_build_then_kernel_args() {
    let a = start_node(1, 1).await;
    let client = connect(&[&a]).await;

    let context = client.create_context(&a.devices, None).await.unwrap();
    let program = client
        .create_program_with_source(context, KERNEL_SOURCE)
        .await
        .unwrap();
    let report = client
        .build_program_blocking(program, None, "-D SCALE=2 -cl-fast-relaxed-math")
        .await
        .unwrap();
    assert!(report.is_success());

    let kernel = client.create_kernel(program, "scale").await.unwrap();
    let buffer = client.create_buffer(context, 0, 64).await.unwrap();
    client.set_kernel_arg_memory(kernel, 0, buffer).await.unwrap();
    client
        .set_kernel_arg_value(kernel, 1, Bytes::copy_from_slice(&2.0f32.to_be_bytes()))
        .await
        .unwrap();

    let err = client
        .set_kernel_arg_value(kernel, 7, Bytes::from_static(&[0, 0, 0, 0]))
        .await
        .unwrap_err();
    assert_eq!(err.to_status_code(), status::INVALID_ARG_INDEX);

    let err = client.create_kernel(program, "missing").await.unwrap_err();
    assert_eq!(err.to_status_code(), status::INVALID_KERNEL_NAME);
}

#[tokio::test]
async fn test_released_kernel_is_invalid() {
    let a = start_node(1, 1).await;
    let client = connect(&[&a]).await;

    let context = client.create_context(&a.devices, None).await.unwrap();
    let program = client
        .create_program_with_source(context, KERNEL_SOURCE)
        .await
        .unwrap();
    client.build_program_blocking(program, None, "").await.unwrap();
    let kernel = client.create_kernel(program, "scale").await.unwrap();
    client.release_kernel(kernel).await.unwrap();

    let err = client
        .set_kernel_arg_value(kernel, 0, Bytes::from_static(&[1, 2, 3, 4]))
        .await
        .unwrap_err();
    assert_eq!(err.to_status_code(), status::INVALID_KERNEL);
    assert!(!a.node.registry().contains(kernel));
}

#[tokio::test]
async fn test_queue_rejects_device_outside_context() {
    let a = start_node(1, 2).await;
    let client = connect(&[&a]).await;

    let context = client.create_context(&a.devices[..1], None).await.unwrap();
    let err = client
        .create_command_queue(context, a.devices[1], 0)
        .await
        .unwrap_err();
    assert_eq!(err.to_status_code(), status::INVALID_DEVICE);
}

#[tokio::test]
async fn test_marker_completes_after_flush() {
    let a = start_node(1, 1).await;
    let client = connect(&[&a]).await;

    let context = client.create_context(&a.devices, None).await.unwrap();
    let queue = client
        .create_command_queue(context, a.devices[0], 0)
        .await
        .unwrap();
    let event = client.enqueue_marker(queue).await.unwrap();
    assert_eq!(client.event_status(event).unwrap().state, EventState::Queued);

    client.flush(queue).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.wait_for_events(&[event]))
        .await
        .unwrap()
        .unwrap();

    let status_now = client.event_status(event).unwrap();
    assert_eq!(status_now.state, EventState::Complete);
    assert_eq!(status_now.exit_code, 0);

    let raw = client
        .get_info(ObjectKind::Event, event, status::info::EVENT_COMMAND_EXECUTION_STATUS)
        .await
        .unwrap();
    assert_eq!(&raw[..], &0i32.to_be_bytes());
}

#[tokio::test]
async fn test_user_event_wakes_waiter_once() {
    let a = start_node(1, 1).await;
    let client = Arc::new(connect(&[&a]).await);

    let context = client.create_context(&a.devices, None).await.unwrap();
    let event = client.create_user_event(context).unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_for_events(&[event]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    client.set_user_event_status(event, 0).await.unwrap();
    waiter.await.unwrap().unwrap();
    assert_eq!(client.event_status(event).unwrap().state, EventState::Complete);

    let err = client.set_user_event_status(event, 0).await.unwrap_err();
    assert!(matches!(err, Error::StateTransition(_)));
    let err = client.set_user_event_status(event, 3).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_cross_node_wait_gates_marker() {
    let a = start_node(1, 1).await;
    let b = start_node(2, 1).await;
    let client = connect(&[&a, &b]).await;

    let devices = [a.devices[0], b.devices[0]];
    let context = client.create_context(&devices, None).await.unwrap();
    let queue_a = client.create_command_queue(context, devices[0], 0).await.unwrap();
    let queue_b = client.create_command_queue(context, devices[1], 0).await.unwrap();

    // An event produced on B gates a marker on A.
    let gate = client.create_user_event(context).unwrap();
    client.enqueue_wait_for_events(queue_b, &[gate]).await.unwrap();
    let on_b = client.enqueue_marker(queue_b).await.unwrap();
    client.enqueue_wait_for_events(queue_a, &[on_b]).await.unwrap();
    let on_a = client.enqueue_marker(queue_a).await.unwrap();
    client.flush(queue_b).await.unwrap();
    client.flush(queue_a).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_ne!(client.event_status(on_a).unwrap().state, EventState::Complete);
    assert!(a.node.fabric().events.contains(on_b));
    assert!(b.node.fabric().events.contains(gate));

    client.set_user_event_status(gate, 0).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.wait_for_events(&[on_a]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.event_status(on_b).unwrap().state, EventState::Complete);
}

#[tokio::test]
async fn test_failed_dependency_fails_wait() {
    let a = start_node(1, 1).await;
    let client = connect(&[&a]).await;

    let context = client.create_context(&a.devices, None).await.unwrap();
    let queue = client
        .create_command_queue(context, a.devices[0], 0)
        .await
        .unwrap();
    let gate = client.create_user_event(context).unwrap();
    client.enqueue_wait_for_events(queue, &[gate]).await.unwrap();
    let marker = client.enqueue_marker(queue).await.unwrap();
    client.flush(queue).await.unwrap();

    client.set_user_event_status(gate, status::OUT_OF_RESOURCES).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), client.wait_for_events(&[marker]))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_status_code(), status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
    assert_eq!(client.event_status(marker).unwrap().state, EventState::Error);
}

#[tokio::test]
async fn test_wait_list_from_other_context_rejected() {
    let a = start_node(1, 1).await;
    let client = connect(&[&a]).await;

    let first = client.create_context(&a.devices, None).await.unwrap();
    let second = client.create_context(&a.devices, None).await.unwrap();
    let queue = client.create_command_queue(first, a.devices[0], 0).await.unwrap();
    let foreign = client.create_user_event(second).unwrap();

    let err = client
        .enqueue_wait_for_events(queue, &[foreign])
        .await
        .unwrap_err();
    assert_eq!(err.to_status_code(), status::INVALID_CONTEXT);
}

#[tokio::test]
async fn test_context_error_reaches_listener() {
    let a = start_node(1, 1).await;
    let client = connect(&[&a]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = move |context: ObjectId, info: &str, private_info: &[u8]| {
        let _ = tx.send((context, info.to_string(), private_info.to_vec()));
    };
    let context = client
        .create_context(&a.devices, Some(Arc::new(listener)))
        .await
        .unwrap();

    assert!(a.driver.inject_context_error(context, "device lost", b"\x01\x02"));
    let (got, info, private_info) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, context);
    assert_eq!(info, "device lost");
    assert_eq!(private_info, vec![1, 2]);
}

#[tokio::test]
async fn test_node_shutdown_loses_pending_events() {
    let a = start_node(1, 1).await;
    let mut config = client_config();
    config.transport.reconnect = ReconnectPolicy::Never;
    let client = ClusterClient::connect_to(&[a.address.clone()], &config)
        .await
        .unwrap();

    let context = client.create_context(&a.devices, None).await.unwrap();
    let queue = client
        .create_command_queue(context, a.devices[0], 0)
        .await
        .unwrap();
    let event = client.enqueue_marker(queue).await.unwrap();

    a.node.shutdown();
    a.task.await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), client.wait_for_events(&[event]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_connection_lost());

    let err = client.create_context(&a.devices, None).await.unwrap_err();
    assert_eq!(err.to_status_code(), status::CONNECTION_LOST);
}

#[tokio::test]
async fn test_pending_request_fails_on_connection_drop() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Swallow one request, then hang up without answering.
        let frame = dcl_core::protocol::codec::read_frame(&mut stream, 1024)
            .await
            .unwrap();
        assert!(frame.is_some());
    });

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let conn = Connection::spawn(
        stream,
        Some(addr),
        Arc::new(Router::new()),
        HandlerPool::new(1),
        &TransportConfig::default(),
    );
    let err = conn
        .send_request(dcl_core::protocol::Request::GetDeviceIds)
        .await
        .unwrap_err();
    assert!(err.is_connection_lost());
    assert_eq!(conn.pending_requests(), 0);
    server.await.unwrap();
}

/// Helper: a node stand-in that answers `Hello` on every connection, hangs up
/// on the first other request of its first `drops` connections and answers
/// `GetDeviceIds` on the rest. Returns its address and an accept counter.
async fn flaky_node(drops: usize) -> (NodeAddress, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let index = count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Ok(Some((kind, payload))) = read_frame(&mut stream, 1024 * 1024).await {
                    let Ok(Message::Request { correlation, body }) = Message::decode(kind, payload) else {
                        return;
                    };
                    let body = match body {
                        Request::Hello { .. } => Response::Info(Bytes::copy_from_slice(&7u16.to_be_bytes())),
                        _ if index < drops => return,
                        _ => Response::DeviceIds(vec![]),
                    };
                    let (kind, payload) = Message::Response { correlation, body }.encode();
                    if write_frame(&mut stream, kind, &payload).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (NodeAddress::new("127.0.0.1", port), accepted)
}

async fn connect_peer(address: NodeAddress) -> Arc<Peer> {
    let transport = TransportConfig {
        reconnect: ReconnectPolicy::Once {
            backoff: Duration::from_millis(10),
        },
        request_timeout: Some(Duration::from_secs(5)),
        ..TransportConfig::default()
    };
    Peer::connect(
        address,
        NodePrefix(100),
        Arc::new(Router::new()),
        HandlerPool::new(1),
        Arc::new(ConnectionTable::new()),
        transport,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_request_resent_after_one_reconnect() {
    let (address, accepted) = flaky_node(1).await;
    let peer = connect_peer(address).await;
    let first = peer.connection().await.unwrap();

    let (carrier, response) = peer.exchange(Request::GetDeviceIds).await.unwrap();
    assert_eq!(response, Response::DeviceIds(vec![]));
    assert_ne!(carrier.peer(), first.peer());
    assert!(first.is_closed());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    // The new connection stays in use.
    peer.request(Request::GetDeviceIds).await.unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_loss_during_resend_is_connection_lost() {
    let (address, accepted) = flaky_node(usize::MAX).await;
    let peer = connect_peer(address).await;

    let err = peer.request(Request::GetDeviceIds).await.unwrap_err();
    assert_eq!(err.to_status_code(), status::CONNECTION_LOST);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_duplicate_node_id_rejected() {
    let a = start_node(100, 1).await;
    let err = ClusterClient::connect_to(&[a.address.clone()], &client_config())
        .await
        .unwrap_err();
    assert_eq!(err.to_status_code(), status::INVALID_NODE);
}

#[tokio::test]
async fn test_stale_update_does_not_regress_event() {
    let fabric = Fabric::new(Arc::new(ConnectionTable::new()), &FabricConfig::default());
    let minter = IdMinter::new(NodePrefix(9));
    let event = minter.mint().unwrap();
    let context = minter.mint().unwrap();
    fabric.events.track_remote(event, context, PeerId::new()).unwrap();

    assert!(
        fabric
            .events
            .apply_remote(event, EventStatus::new(EventState::Complete, 0))
            .await
    );
    assert!(
        !fabric
            .events
            .apply_remote(event, EventStatus::new(EventState::Running, 0))
            .await
    );
    assert_eq!(fabric.events.status(event).unwrap().state, EventState::Complete);
    let status_now = fabric.events.wait(event).await.unwrap();
    assert_eq!(status_now.state, EventState::Complete);
}

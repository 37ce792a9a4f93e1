//! End-to-end request/response call across a real TCP loopback connection:
//! a `Server` with one registered service, and a `Client`-resolved
//! `Channel` calling it.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use poppy::config::{ChannelOptions, ServerOptions};
use poppy::controller::RpcController;
use poppy::server::{Server, ServiceEntry};
use poppy::ErrorCode;
use poppy::service::MethodTable;

fn free_addr() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn echo_service() -> ServiceEntry {
    let table = MethodTable::<()>::new("poppy.test.Echo").method("Echo", |_state, req| async move { Ok(req.payload) });
    ServiceEntry::from_table((), table)
}

async fn wait_healthy(channel: &Arc<poppy::channel::Channel>) {
    for _ in 0..200 {
        if channel.status() == poppy::channel::ChannelStatus::Healthy {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel never became healthy");
}

#[tokio::test]
async fn echo_round_trip() {
    let addr = free_addr();
    let server = Server::new(ServerOptions::new(), |_info| Ok(()));
    server.register(echo_service());
    let server_task = tokio::spawn(server.clone().serve(addr));
    // give the listener a moment to bind before dialing it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let client = poppy::client::Client::new("test-credential");
    let channel = client.channel("echo-service", vec![addr], ChannelOptions::new());
    wait_healthy(&channel).await;

    let controller = Arc::new(RpcController::for_call("poppy.test.Echo.Echo"));
    let reply = channel
        .call_raw("poppy.test.Echo.Echo", Bytes::from_static(b"hello poppy"), controller)
        .await
        .unwrap();
    assert_eq!(&reply[..], b"hello poppy");

    server.quick_stop().await;
    server_task.abort();
}

#[tokio::test]
async fn unknown_method_fails_with_found_method() {
    let addr = free_addr();
    let server = Server::new(ServerOptions::new(), |_info| Ok(()));
    server.register(echo_service());
    let server_task = tokio::spawn(server.clone().serve(addr));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let client = poppy::client::Client::new("test-credential");
    let channel = client.channel("echo-service-2", vec![addr], ChannelOptions::new());
    wait_healthy(&channel).await;

    let controller = Arc::new(RpcController::for_call("poppy.test.Echo.DoesNotExist"));
    let err = channel
        .call_raw("poppy.test.Echo.DoesNotExist", Bytes::new(), controller)
        .await
        .unwrap_err();
    assert_eq!(err, ErrorCode::FoundMethod);

    server.quick_stop().await;
    server_task.abort();
}

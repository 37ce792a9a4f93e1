//! End-to-end exercise of the multiplexed streaming layer over a real TCP
//! loopback connection. Streams are client/server, not peer-to-peer (spec
//! §4.5): the caller drives its half over the wire with [`PeerStream`],
//! while the server's own application code drives the other half
//! in-process with [`ServerStream`], looked up by id from the
//! [`StreamManager`] the server registered.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use poppy::channel::ChannelStatus;
use poppy::config::{ChannelOptions, ServerOptions};
use poppy::server::Server;
use poppy::stream::{PeerStream, StreamManager, StreamOptions};

fn free_addr() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn wait_healthy(channel: &Arc<poppy::channel::Channel>) {
    for _ in 0..200 {
        if channel.status() == ChannelStatus::Healthy {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel never became healthy");
}

fn stream_options() -> StreamOptions {
    StreamOptions {
        timeout: Duration::from_millis(200),
        retry_count: 2,
    }
}

async fn start_server() -> (Arc<Server>, Arc<StreamManager>, SocketAddr) {
    let addr = free_addr();
    let server = Server::new(ServerOptions::new(), |_info| Ok(()));
    let manager = StreamManager::new();
    poppy::stream::register(&server, manager.clone());
    tokio::spawn(server.clone().serve(addr));
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, manager, addr)
}

#[tokio::test]
async fn client_writes_server_reads() {
    let (server, server_manager, addr) = start_server().await;
    let client = poppy::client::Client::new("test-credential");
    let channel = client.channel("streaming-upload", vec![addr], ChannelOptions::new());
    wait_healthy(&channel).await;

    // CreateOutputStream: the server creates the opposing *input* stream
    // it will read from, while we write to it over the wire.
    let writer = PeerStream::open_output(channel.clone(), StreamManager::new(), stream_options())
        .await
        .unwrap();
    let stream_id = writer.id();

    let write_task = tokio::spawn(async move {
        writer.write(Bytes::from_static(b"first packet")).await.unwrap();
        writer.write(Bytes::from_static(b"second packet")).await.unwrap();
        writer.close().await.unwrap();
        writer
    });

    let reader = server_manager.get(stream_id).expect("server allocated an opposing stream");
    assert_eq!(reader.id(), stream_id);
    assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"first packet"));
    assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"second packet"));
    assert_eq!(reader.read().await.unwrap(), None);

    write_task.await.unwrap();
    server.quick_stop().await;
}

#[tokio::test]
async fn server_writes_client_reads() {
    let (server, server_manager, addr) = start_server().await;
    let client = poppy::client::Client::new("test-credential");
    let channel = client.channel("streaming-download", vec![addr], ChannelOptions::new());
    wait_healthy(&channel).await;

    // CreateInputStream: the server creates the opposing *output* stream
    // it will write to, while we read it over the wire.
    let reader = PeerStream::open_input(channel.clone(), StreamManager::new(), stream_options())
        .await
        .unwrap();
    let stream_id = reader.id();

    let writer = server_manager.get(stream_id).expect("server allocated an opposing stream");
    writer.write(Bytes::from_static(b"hello from the server")).await.unwrap();
    writer.close();

    assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"hello from the server"));
    assert_eq!(reader.read().await.unwrap(), None);

    reader.close().await.unwrap();
    server.quick_stop().await;
}

#[tokio::test]
async fn abort_surfaces_as_stream_aborted() {
    let (server, server_manager, addr) = start_server().await;
    let client = poppy::client::Client::new("test-credential");
    let channel = client.channel("streaming-abort", vec![addr], ChannelOptions::new());
    wait_healthy(&channel).await;

    let writer = PeerStream::open_output(channel.clone(), StreamManager::new(), stream_options())
        .await
        .unwrap();
    let stream_id = writer.id();
    writer.abort().await.unwrap();

    let reader = server_manager.get(stream_id).expect("server allocated an opposing stream");
    let err = reader.read().await.unwrap_err();
    assert_eq!(err, poppy::ErrorCode::StreamAborted);

    server.quick_stop().await;
}

//! Tests for the acceptor and the live-client registry, over a real
//! loopback listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use courier::config::Config;
use courier::proxy::pool::WorkerPool;
use courier::server::handler::RequestHandler;
use courier::server::listener::Listener;

fn test_handler() -> Arc<RequestHandler<WorkerPool>> {
    let mut config = Config::default();
    config.server.connect_password = "secret".to_string();
    // Generous deadline so slow test machines don't disconnect early.
    config.server.connect_password_timeout_ms = 60_000;
    let pool = WorkerPool::new(&[], Duration::from_secs(1)).unwrap();
    RequestHandler::new(Arc::new(config), Arc::new(pool))
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_registry_tracks_connect_and_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = test_handler();

    assert_eq!(handler.client_count(), 0);
    assert_eq!(handler.inspect(), "0 clients:\n");

    let serve = tokio::spawn(handler.clone().run(Listener::Tcp(listener)));

    let mut client = TcpStream::connect(addr).await.unwrap();
    {
        let handler = handler.clone();
        wait_until("client registration", move || handler.client_count() == 1).await;
    }

    // A freshly accepted client is waiting for its connect password.
    let inspect = handler.inspect();
    assert!(inspect.starts_with("1 clients:\n"), "inspect: {inspect}");
    assert!(inspect.contains("BeginReadPassword"), "inspect: {inspect}");

    // Wrong password: the connection closes with no response bytes and the
    // client leaves the table.
    client.write_all(b"wrongp").await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty());

    {
        let handler = handler.clone();
        wait_until("client removal", move || handler.client_count() == 0).await;
    }
    assert_eq!(handler.inspect(), "0 clients:\n");

    serve.abort();
}

#[tokio::test]
async fn test_registry_tracks_many_clients() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = test_handler();

    let serve = tokio::spawn(handler.clone().run(Listener::Tcp(listener)));

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    {
        let handler = handler.clone();
        wait_until("all clients registered", move || handler.client_count() == 3).await;
    }

    let inspect = handler.inspect();
    assert!(inspect.starts_with("3 clients:\n"), "inspect: {inspect}");
    assert_eq!(inspect.matches("BeginReadPassword").count(), 3);

    // Hang-ups are observed as EOF and drain the table.
    drop(clients);
    {
        let handler = handler.clone();
        wait_until("table drained", move || handler.client_count() == 0).await;
    }

    serve.abort();
}

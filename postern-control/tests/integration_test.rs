//! Requests and responses through a real control socket.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use postern_common::Signal;
use postern_control::{
    CommandHandler, ControlClient, ControlError, ControlServer, Request, Response,
    ResponsePayload, Result, Selection, SpoolCommand, StoreName,
};
use postern_spool::admin::SpoolReport;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::{sync::broadcast, task::JoinHandle};

/// Answers every command with an empty report, and refuses the inbox.
struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    async fn handle_request(&self, request: Request) -> Result<Response> {
        if request.store == StoreName::Inbox {
            return Err(ControlError::Server(String::from("No inbox store is configured")));
        }

        Ok(Response::new(match request.command {
            SpoolCommand::List(_) => ResponsePayload::Items(Vec::new()),
            _ => ResponsePayload::Report(SpoolReport::default()),
        }))
    }
}

struct Running {
    client: ControlClient,
    shutdown: broadcast::Sender<Signal>,
    task: JoinHandle<Result<()>>,
    dir: TempDir,
}

async fn start() -> Running {
    let dir = TempDir::new().unwrap();
    let server = ControlServer::new(dir.path().join("control.sock"), Arc::new(EchoHandler));
    let listener = server.bind().await.unwrap();

    let (shutdown, receiver) = broadcast::channel(1);
    let task = tokio::spawn(async move { server.serve(listener, receiver).await });

    Running {
        client: ControlClient::new(dir.path().join("control.sock")),
        shutdown,
        task,
        dir,
    }
}

#[tokio::test]
async fn request_round_trip() {
    let running = start().await;

    let listed = running
        .client
        .send_request(&Request::new(
            StoreName::Spool,
            SpoolCommand::List(Selection::default()),
        ))
        .await
        .unwrap();
    assert_eq!(listed, ResponsePayload::Items(Vec::new()));

    let resent = running
        .client
        .send_request(&Request::new(
            StoreName::Outgoing,
            SpoolCommand::Resend(Selection::default()),
        ))
        .await
        .unwrap();
    assert_eq!(resent, ResponsePayload::Report(SpoolReport::default()));

    running.shutdown.send(Signal::Shutdown).unwrap();
    running.task.await.unwrap().unwrap();
    assert!(!running.dir.path().join("control.sock").exists());
}

#[tokio::test]
async fn refusals_reach_the_client() {
    let running = start().await;

    let err = running
        .client
        .send_request(&Request::new(
            StoreName::Inbox,
            SpoolCommand::List(Selection::default()),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Server(message) if message.contains("inbox")));

    let mut stale = Request::new(StoreName::Spool, SpoolCommand::List(Selection::default()));
    stale.version = 99;
    let err = running.client.send_request(&stale).await.unwrap_err();
    assert!(matches!(err, ControlError::Server(message) if message.contains("version")));

    running.shutdown.send(Signal::Shutdown).unwrap();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn second_server_on_a_live_socket_is_refused() {
    let running = start().await;

    let second = ControlServer::new(running.client.socket_path(), Arc::new(EchoHandler));
    let err = second.bind().await.unwrap_err();
    assert!(matches!(err, ControlError::Io(io) if io.kind() == std::io::ErrorKind::AddrInUse));

    running.shutdown.send(Signal::Shutdown).unwrap();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stale_socket_is_replaced() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("control.sock");

    // A listener that went away without cleaning up
    drop(tokio::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let server = ControlServer::new(&path, Arc::new(EchoHandler));
    let _listener = server.bind().await.unwrap();

    let client = ControlClient::new(&path).with_timeout(Duration::from_secs(1));
    assert_eq!(client.socket_path(), path.as_path());
}

#[tokio::test]
async fn missing_server() {
    let dir = TempDir::new().unwrap();
    let client = ControlClient::new(dir.path().join("absent.sock"));

    let err = client
        .send_request(&Request::new(
            StoreName::Spool,
            SpoolCommand::List(Selection::default()),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Io(_)));
}

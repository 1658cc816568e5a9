//! Common test infrastructure for dapx-proxy integration tests
//!
//! [`FakeAdapter`] is a scripted DAP server on a real TCP port. It answers
//! every request with success, sends `initialized` after `initialize`, and
//! records what it received per connection so tests can assert ordering.

#![allow(dead_code)]

use dapx_proxy::{encode_message, Event, FrameDecoder, ProtocolMessage, Request, Response};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One request seen by the fake adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub connection: usize,
    pub command: String,
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeAdapterOptions {
    /// After `launch` on the first connection, ask for a child session
    /// with this pending target id
    pub start_debugging_target: Option<String>,
    /// Commands that never get a response
    pub silent_commands: Vec<String>,
}

pub struct FakeAdapter {
    pub port: u16,
    log: Arc<Mutex<Vec<Recorded>>>,
    accept_task: JoinHandle<()>,
}

impl FakeAdapter {
    pub async fn start() -> Self {
        Self::with_options(FakeAdapterOptions::default()).await
    }

    pub async fn with_options(options: FakeAdapterOptions) -> Self {
        dapx_logging::init_test();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(listener, options, log.clone()));
        Self {
            port,
            log,
            accept_task,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    /// Commands received on one connection, in order
    pub fn commands_on(&self, connection: usize) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.connection == connection)
            .map(|r| r.command)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.requests()
            .iter()
            .map(|r| r.connection + 1)
            .max()
            .unwrap_or(0)
    }

    /// Position of the first `command` on `connection` in the global log
    pub fn position(&self, connection: usize, command: &str) -> Option<usize> {
        self.requests()
            .iter()
            .position(|r| r.connection == connection && r.command == command)
    }

    /// Poll until `command` shows up on `connection`.
    pub async fn wait_for_command(&self, connection: usize, command: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.position(connection, command).is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for FakeAdapter {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    options: FakeAdapterOptions,
    log: Arc<Mutex<Vec<Recorded>>>,
) {
    let mut connection = 0;
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, connection, options.clone(), log.clone()));
        connection += 1;
    }
}

async fn serve(
    mut stream: TcpStream,
    connection: usize,
    options: FakeAdapterOptions,
    log: Arc<Mutex<Vec<Recorded>>>,
) {
    let mut decoder = FrameDecoder::new();
    let mut seq = 1;
    let mut buf = [0u8; 8192];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.push(&buf[..n]);

        while let Some(message) = decoder.next_message() {
            // Responses to our reverse requests are ignored
            let Ok(ProtocolMessage::Request(request)) = message else {
                continue;
            };
            log.lock().unwrap().push(Recorded {
                connection,
                command: request.command.clone(),
                arguments: request.arguments.clone(),
            });
            if options.silent_commands.contains(&request.command) {
                continue;
            }

            let mut outgoing = vec![ProtocolMessage::Response(respond(seq, &request))];
            seq += 1;
            match request.command.as_str() {
                "initialize" => {
                    outgoing.push(ProtocolMessage::Event(Event::new(seq, "initialized")));
                    seq += 1;
                }
                "launch" if connection == 0 => {
                    outgoing.push(ProtocolMessage::Event(
                        Event::new(seq, "output")
                            .with_body(json!({"category": "stdout", "output": "hello\n"})),
                    ));
                    seq += 1;
                    if let Some(target) = &options.start_debugging_target {
                        outgoing.push(ProtocolMessage::Request(
                            Request::new(seq, "startDebugging").with_arguments(json!({
                                "request": "attach",
                                "configuration": {"type": "pwa-node", "__pendingTargetId": target}
                            })),
                        ));
                        seq += 1;
                    }
                }
                _ => {}
            }

            for message in outgoing {
                let bytes = encode_message(&message).unwrap();
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            if request.command == "disconnect" {
                return;
            }
        }
    }
}

fn respond(seq: i64, request: &Request) -> Response {
    let response = Response::success(seq, request.seq, request.command.clone());
    match request.command.as_str() {
        "initialize" => response.with_body(json!({
            "supportsConfigurationDoneRequest": true,
            "supportsConditionalBreakpoints": true
        })),
        "threads" => response.with_body(json!({"threads": [{"id": 1, "name": "main"}]})),
        "setBreakpoints" => {
            let count = request
                .arguments
                .as_ref()
                .and_then(|a| a.get("breakpoints"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let verified: Vec<Value> = (0..count).map(|_| json!({"verified": true})).collect();
            response.with_body(json!({"breakpoints": verified}))
        }
        _ => response,
    }
}

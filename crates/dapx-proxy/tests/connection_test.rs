//! Connection manager against a fake adapter on a real socket
//!
//! Run with: cargo test --package dapx-proxy --test connection_test

mod common;

use common::FakeAdapter;
use dapx_config::ConnectionConfig;
use dapx_proxy::{ConnectionManager, ConnectionState, SourceBreakpoint};
use std::time::Duration;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        initial_connect_delay_ms: 10,
        connect_retry_interval_ms: 20,
        ..ConnectionConfig::default()
    }
}

#[tokio::test]
async fn test_handshake_and_disconnect() {
    let adapter = FakeAdapter::start().await;
    let manager = ConnectionManager::tcp(fast_config(), None);

    let client = manager
        .connect_with_retry("localhost", adapter.port)
        .await
        .unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    let capabilities = manager
        .initialize_session(&client, "s1", "python")
        .await
        .unwrap();
    assert_eq!(capabilities.supports_configuration_done_request, Some(true));
    assert_eq!(manager.state(), ConnectionState::Initialized);

    let response = manager
        .set_breakpoints(
            &client,
            "/home/u/app.py",
            vec![
                SourceBreakpoint::at_line(3),
                SourceBreakpoint::at_line(7).with_condition("x > 1"),
            ],
        )
        .await
        .unwrap();
    let verified = response.body.unwrap()["breakpoints"].as_array().unwrap().len();
    assert_eq!(verified, 2);

    manager.send_configuration_done(&client).await.unwrap();
    manager.disconnect(&client, true).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(client.is_closed());
    assert_eq!(
        adapter.commands_on(0),
        vec!["initialize", "setBreakpoints", "configurationDone", "disconnect"]
    );

    let initialize = &adapter.requests()[0];
    let args = initialize.arguments.as_ref().unwrap();
    assert_eq!(args["clientID"], "dapx-s1");
    assert_eq!(args["adapterID"], "python");
    assert_eq!(args["pathFormat"], "path");
}

#[tokio::test]
async fn test_connect_retries_until_listener_appears() {
    // Reserve a port, release it, and bring the adapter up after a delay
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let manager = ConnectionManager::tcp(fast_config(), None);

    let late_listener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap()
    });

    let client = manager.connect_with_retry("127.0.0.1", port).await;
    let _listener = late_listener.await.unwrap();
    assert!(client.is_ok());
}

#[tokio::test]
async fn test_connect_exhausted_names_attempts() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ConnectionConfig {
        max_connect_attempts: 3,
        ..fast_config()
    };
    let manager = ConnectionManager::tcp(config, None);

    let err = manager
        .connect_with_retry("127.0.0.1", port)
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("after 3 attempts"), "{}", err);
    assert!(err.contains(&port.to_string()), "{}", err);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

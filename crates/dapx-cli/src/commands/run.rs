//! `dapx run`: drive one proxy worker over stdin/stdout
//!
//! Each stdin line is a control command; each stdout line is a
//! [`ProxyMessage`]. The process exits once the worker is terminated.
//! `init` runs in its own task so a `terminate` or a signal can cut a
//! slow adapter start short.

use anyhow::{Context, Result};
use dapx_config::constants::DEFAULT_EVENT_CHANNEL_CAPACITY;
use dapx_config::ProxyConfig;
use dapx_logging::{debug, info, warn};
use dapx_proxy::{
    parse_command, ChannelMessageSender, ProxyCommand, ProxyMessage, ProxyState, ProxyWorker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

/// Time left for queued messages to reach stdout after termination
const EXIT_FLUSH_DELAY: Duration = Duration::from_millis(500);

pub async fn run(config: ProxyConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let input = BufReader::new(tokio::io::stdin());
    run_with_io(config, input, tokio::io::stdout(), shutdown).await
}

/// Runner loop over arbitrary line input and message output.
pub async fn run_with_io<R, W>(
    config: ProxyConfig,
    input: R,
    output: W,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, messages) = ChannelMessageSender::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
    let worker = ProxyWorker::new(config, Arc::new(sender));
    let mut state = worker.watch_state();
    let writer = tokio::spawn(write_messages(messages, output));

    let mut lines = input.lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => handle_line(&worker, &line).await,
                Ok(None) => {
                    info!("Control input closed, shutting down");
                    input_open = false;
                    worker.shutdown().await;
                }
                Err(e) => {
                    warn!("Failed to read control input: {}", e);
                    input_open = false;
                    worker.shutdown().await;
                }
            },
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == ProxyState::Terminated {
                    break;
                }
            }
            _ = shutdown.changed() => {
                worker.shutdown().await;
                break;
            }
        }
    }

    debug!("Worker terminated, flushing output");
    drop(worker);
    match tokio::time::timeout(EXIT_FLUSH_DELAY, writer).await {
        Ok(joined) => joined.context("Output writer panicked")??,
        Err(_) => debug!("Output still open after flush delay"),
    }
    Ok(())
}

async fn handle_line(worker: &ProxyWorker, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match parse_command(line) {
        Ok(command @ ProxyCommand::Init(_)) => {
            let worker = worker.clone();
            tokio::spawn(async move { worker.handle_command(command).await });
        }
        Ok(command) => worker.handle_command(command).await,
        Err(e) => {
            warn!("Rejected control message: {}", e);
            worker.report_error(e.to_string()).await;
        }
    }
}

async fn write_messages<W>(mut messages: mpsc::Receiver<ProxyMessage>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_vec(&message).context("Failed to encode message")?;
        line.push(b'\n');
        output.write_all(&line).await.context("Failed to write message")?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::{duplex, AsyncReadExt};

    fn read_messages(raw: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(raw)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_dry_run_exits_after_reporting() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("app.py");
        std::fs::write(&script, "print('hi')\n").unwrap();

        let init = serde_json::json!({
            "cmd": "init",
            "sessionId": "s1",
            "executablePath": "/usr/bin/python3",
            "adapterHost": "127.0.0.1",
            "adapterPort": 5678,
            "logDir": dir.path().join("logs"),
            "scriptPath": script,
            "dryRunSpawn": true,
        });
        let input = format!("{}\n", init);

        let (output, mut reader) = duplex(64 * 1024);
        let (_tx, shutdown) = watch::channel(false);
        // Keep the input side open: termination must come from the worker.
        let (mut input_writer, input_reader) = duplex(64 * 1024);
        input_writer.write_all(input.as_bytes()).await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            run_with_io(ProxyConfig::default(), BufReader::new(input_reader), output, shutdown),
        )
        .await
        .expect("runner did not exit")
        .unwrap();

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();
        let messages = read_messages(&raw);
        assert_eq!(messages[0]["type"], "status");
        assert_eq!(messages[0]["status"], "dry_run_complete");
        assert!(messages[0]["command"]
            .as_str()
            .unwrap()
            .contains("debugpy.adapter"));
    }

    #[tokio::test]
    async fn test_bad_lines_report_errors_and_eof_exits() {
        let input = b"{\"cmd\":\"bogus\",\"sessionId\":\"s1\"}\nnot json\n\n".to_vec();
        let (output, mut reader) = duplex(64 * 1024);
        let (_tx, shutdown) = watch::channel(false);

        tokio::time::timeout(
            Duration::from_secs(5),
            run_with_io(ProxyConfig::default(), &input[..], output, shutdown),
        )
        .await
        .expect("runner did not exit")
        .unwrap();

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();
        let messages = read_messages(&raw);
        let errors: Vec<&Value> = messages.iter().filter(|m| m["type"] == "error").collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|m| m["sessionId"] == "unknown"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_during_slow_init() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("app.js");
        std::fs::write(&script, "console.log('hi')\n").unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        // Nothing listens on the port, so init keeps retrying the connection
        let mut config = ProxyConfig::default();
        config.connection.initial_connect_delay_ms = 10;
        config.connection.connect_retry_interval_ms = 50;
        config.connection.max_connect_attempts = 1000;

        let init = serde_json::json!({
            "cmd": "init",
            "sessionId": "s1",
            "executablePath": "/usr/bin/node",
            "adapterHost": "127.0.0.1",
            "adapterPort": port,
            "logDir": dir.path().join("logs"),
            "scriptPath": script,
            "adapterCommand": {"command": "sleep", "args": ["30"]},
        });
        let (output, reader) = duplex(64 * 1024);
        let (_tx, shutdown) = watch::channel(false);
        let (mut input_writer, input_reader) = duplex(64 * 1024);
        input_writer
            .write_all(format!("{}\n", init).as_bytes())
            .await
            .unwrap();

        let runner = tokio::spawn(run_with_io(
            config,
            BufReader::new(input_reader),
            output,
            shutdown,
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        input_writer
            .write_all(b"{\"cmd\":\"terminate\",\"sessionId\":\"s1\"}\n")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("runner stuck behind init")
            .unwrap()
            .unwrap();

        let mut lines = BufReader::new(reader).lines();
        let terminated = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(line) = lines.next_line().await.unwrap() {
                let message: Value = serde_json::from_str(&line).unwrap();
                if message["status"] == "terminated" {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(terminated);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_runner() {
        let (output, _reader) = duplex(64 * 1024);
        let (tx, shutdown) = watch::channel(false);
        let (_input_writer, input_reader) = duplex(1024);

        let runner = tokio::spawn(run_with_io(
            ProxyConfig::default(),
            BufReader::new(input_reader),
            output,
            shutdown,
        ));
        tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("runner did not exit")
            .unwrap()
            .unwrap();
    }
}

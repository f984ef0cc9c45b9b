use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;

/// How long a run request waits for an immediate launch failure before
/// reporting success. A sandbox that outlives the window is considered
/// launched; its eventual exit status only reaches the log.
const LAUNCH_GRACE: Duration = Duration::from_millis(200);

/// One line-oriented request on the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Ping,
    Run(String),
    Focus { pid: i32, change_id: u64 },
}

impl Request {
    fn parse(line: &str) -> Result<Request> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb {
            "ping" => Ok(Request::Ping),
            "run" => {
                if rest.is_empty() {
                    bail!("run requires a command line");
                }
                Ok(Request::Run(rest.to_string()))
            }
            "focus" => {
                let (pid, change_id) = rest
                    .split_once(' ')
                    .ok_or_else(|| anyhow!("focus requires <pid> <change-id>"))?;
                Ok(Request::Focus {
                    pid: pid.trim().parse().context("bad pid")?,
                    change_id: change_id.trim().parse().context("bad change id")?,
                })
            }
            other => bail!("unknown request {other:?}"),
        }
    }
}

/// Serve the control socket forever. Each connection gets its own task; the
/// dispatcher serializes whatever the requests touch.
pub async fn serve(dispatcher: Arc<Dispatcher>, path: &Path) -> Result<()> {
    // a stale socket from a crashed daemon blocks the bind
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind control socket {path:?}"))?;
    info!("control socket listening at {}", path.display());

    loop {
        let (stream, _addr) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(dispatcher, stream).await {
                warn!("control connection failed: {err:#}");
            }
        });
    }
}

async fn handle_connection(dispatcher: Arc<Dispatcher>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match Request::parse(&line) {
            Ok(request) => respond(&dispatcher, request).await,
            Err(err) => format!("err {err:#}"),
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

async fn respond(dispatcher: &Arc<Dispatcher>, request: Request) -> String {
    match request {
        Request::Ping => "pong".to_string(),

        Request::Focus { pid, change_id } => {
            // the handler may hold the lock across a rebalance sleep
            let dispatcher = dispatcher.clone();
            match tokio::task::spawn_blocking(move || dispatcher.on_focus_change(pid, change_id))
                .await
            {
                Ok(()) => "ok".to_string(),
                Err(err) => format!("err focus handler failed: {err}"),
            }
        }

        Request::Run(cmd) => {
            let dispatcher = dispatcher.clone();
            let launched = cmd.clone();
            let handle = tokio::task::spawn_blocking(move || dispatcher.run(&cmd));
            match tokio::time::timeout(LAUNCH_GRACE, handle).await {
                // launch failed within the grace window
                Ok(Ok(Err(err))) => format!("err {err:#}"),
                Ok(Err(err)) => format!("err launch task failed: {err}"),
                // very short-lived command, already exited cleanly
                Ok(Ok(Ok(()))) => "ok".to_string(),
                // still running; the task keeps owning the sandbox
                Err(_elapsed) => {
                    info!("launched {launched:?}");
                    "ok".to_string()
                }
            }
        }
    }
}

/// Send one request line and return the single reply line.
async fn roundtrip(path: &Path, line: &str) -> Result<String> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("failed to connect to control socket {path:?}"))?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow!("daemon closed the connection without replying"))
}

/// Check that a daemon is listening on `path`.
pub async fn ping(path: &Path) -> Result<()> {
    match roundtrip(path, "ping").await?.as_str() {
        "pong" => Ok(()),
        other => Err(anyhow!("unexpected ping reply {other:?}")),
    }
}

/// Ask the daemon to launch `cmd` under management.
pub async fn request_run(path: &Path, cmd: &str) -> Result<()> {
    let reply = roundtrip(path, &format!("run {cmd}")).await?;
    match reply.as_str() {
        "ok" => Ok(()),
        other => Err(anyhow!(
            "daemon rejected the launch: {}",
            other.strip_prefix("err ").unwrap_or(other)
        )),
    }
}

/// Forward one focus-change event to the daemon.
pub async fn send_focus(path: &Path, pid: i32, change_id: u64) -> Result<()> {
    let reply = roundtrip(path, &format!("focus {pid} {change_id}")).await?;
    match reply.as_str() {
        "ok" => Ok(()),
        other => Err(anyhow!("daemon rejected the focus event: {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ping() {
        assert_eq!(Request::parse("ping").unwrap(), Request::Ping);
        assert_eq!(Request::parse("  ping  ").unwrap(), Request::Ping);
    }

    #[test]
    fn parses_run_with_full_command_line() {
        assert_eq!(
            Request::parse("run xterm -e htop").unwrap(),
            Request::Run("xterm -e htop".to_string())
        );
        assert!(Request::parse("run").is_err());
        assert!(Request::parse("run   ").is_err());
    }

    #[test]
    fn parses_focus_events() {
        assert_eq!(
            Request::parse("focus 1234 77").unwrap(),
            Request::Focus {
                pid: 1234,
                change_id: 77
            }
        );
        assert!(Request::parse("focus 1234").is_err());
        assert!(Request::parse("focus twelve 77").is_err());
    }

    #[test]
    fn rejects_unknown_verbs() {
        assert!(Request::parse("stop").is_err());
        assert!(Request::parse("").is_err());
    }
}

//! Subprocess and socket plumbing for `blehostd`: spawns the daemon, dials
//! its UNIX socket, and runs a single inbound-pump task that parses each
//! newline-delimited JSON line into a [`Frame`] and forwards it to the
//! owning [`crate::ble::transport::BleTransport`].

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::ble::protocol::Frame;
use crate::config::BleXportCfg;
use crate::error::Error;

const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A running `blehostd` subprocess plus its socket connection.
pub struct BleDaemonLink {
    child: Child,
    write_tx: mpsc::Sender<String>,
}

impl BleDaemonLink {
    /// Spawns the daemon subprocess, dials its socket (retrying until
    /// `cfg.conn_timeout` elapses), and starts the reader/writer tasks.
    /// Returns the link and the channel of parsed inbound frames.
    pub async fn spawn(cfg: &BleXportCfg) -> Result<(Self, mpsc::Receiver<Frame>), Error> {
        let child = Command::new(&cfg.blehostd_path)
            .arg("-ll")
            .arg(cfg.sock_path.as_os_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stream = Self::dial_with_retry(&cfg.sock_path, cfg.conn_timeout).await?;
        let (read_half, mut write_half) = stream.into_split();

        let (frame_tx, frame_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Frame::parse(&line) {
                            Ok(frame) => {
                                if frame_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping unparseable daemon frame"),
                        }
                    }
                    Ok(None) => {
                        debug!("daemon socket closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "daemon socket read error");
                        break;
                    }
                }
            }
        });

        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                let mut buf = line.into_bytes();
                buf.push(b'\n');
                if let Err(e) = write_half.write_all(&buf).await {
                    error!(error = %e, "daemon socket write error");
                    break;
                }
            }
        });

        Ok((Self { child, write_tx }, frame_rx))
    }

    async fn dial_with_retry(sock_path: &std::path::Path, timeout: Duration) -> Result<UnixStream, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match UnixStream::connect(sock_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Io(e));
                    }
                    sleep(DIAL_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Queues a raw JSON line for transmission to the daemon.
    pub async fn send(&self, line: String) -> Result<(), Error> {
        self.write_tx.send(line).await.map_err(|_| Error::Xport)
    }

    /// Terminates the subprocess. Idempotent; safe to call after the
    /// process has already exited.
    pub async fn kill(&mut self) -> Result<(), Error> {
        match self.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self.child.kill().await.map_err(Error::Io),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

//! SSH port forwarding to a sandbox that is only reachable through a login node.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const STDERR_TAIL_LINES: usize = 20;

/// A running `ssh -N -L` forward from a local port to the sandbox.
///
/// The ssh process is killed when the tunnel is dropped.
#[derive(Debug)]
pub struct SshTunnel {
    child: Child,
    local_port: u16,
}

impl SshTunnel {
    /// Start the forward and wait until the local end accepts connections.
    ///
    /// Blocks the calling thread while polling; async callers should run it
    /// on a blocking thread.
    #[instrument(skip_all, fields(server = %server, remote = %format!("{remote_host}:{remote_port}")))]
    pub fn open(
        server: &str,
        key_path: &Path,
        remote_host: &str,
        remote_port: u16,
        ready_timeout: Duration,
    ) -> Result<Self> {
        let local_port = free_local_port()?;
        let mut cmd = forward_command(server, key_path, local_port, remote_host, remote_port);
        debug!(local_port, "spawning ssh tunnel");
        let mut child = cmd
            .spawn()
            .map_err(|err| Error::Transport(format!("spawn ssh tunnel: {err}")))?;
        let mut stderr = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || drain_stderr(pipe)));

        let local = SocketAddr::from(([127, 0, 0, 1], local_port));
        let deadline = Instant::now() + ready_timeout;
        loop {
            let exited = child
                .wait_timeout(POLL_INTERVAL)
                .map_err(|err| Error::Transport(format!("wait for ssh tunnel: {err}")))?;
            if let Some(status) = exited {
                let stderr = stderr
                    .take()
                    .and_then(|handle| handle.join().ok())
                    .unwrap_or_default();
                return Err(Error::Transport(format!(
                    "ssh tunnel exited with {status}: {}",
                    stderr.trim()
                )));
            }
            if TcpStream::connect_timeout(&local, CONNECT_TIMEOUT).is_ok() {
                info!(local_port, "ssh tunnel ready");
                return Ok(Self { child, local_port });
            }
            if Instant::now() >= deadline {
                warn!(timeout_secs = ready_timeout.as_secs(), "ssh tunnel not ready, killing");
                child.kill().ok();
                child.wait().ok();
                return Err(Error::Transport(format!(
                    "ssh tunnel to {server} not ready after {ready_timeout:?}"
                )));
            }
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            debug!(err = %err, "ssh tunnel already stopped");
        }
        self.child.wait().ok();
    }
}

/// Log ssh's stderr until the pipe closes, keeping the last lines for error reports.
fn drain_stderr(pipe: impl Read) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in BufReader::new(pipe).lines() {
        let Ok(line) = line else { break };
        debug!(line = %line, "ssh");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|err| Error::Transport(format!("reserve local port: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| Error::Transport(format!("reserve local port: {err}")))?
        .port();
    Ok(port)
}

fn forward_command(
    server: &str,
    key_path: &Path,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-N")
        .args(["-o", "BatchMode=yes"])
        .args(["-o", "ExitOnForwardFailure=yes"])
        .args(["-o", "StrictHostKeyChecking=accept-new"])
        .arg("-i")
        .arg(key_path)
        .args(["-p", "22"])
        .arg("-L")
        .arg(format!("{local_port}:{remote_host}:{remote_port}"))
        .arg(server)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_command_maps_local_port_to_sandbox() {
        let cmd = forward_command("user@login", Path::new("/keys/id"), 4100, "10.0.0.5", 6000);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(cmd.get_program(), "ssh");
        assert!(args.contains(&"4100:10.0.0.5:6000".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("user@login"));
        let key_idx = args.iter().position(|a| a == "-i").expect("-i");
        assert_eq!(args[key_idx + 1], "/keys/id");
    }

    #[test]
    fn stderr_drain_keeps_the_tail() {
        let output: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let tail = drain_stderr(output.as_bytes());
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.first(), Some(&"line 10"));
        assert_eq!(lines.last(), Some(&"line 29"));
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_local_port().expect("port"), 0);
    }
}

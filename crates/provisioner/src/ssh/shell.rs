//! Remote shell abstraction and its libssh2 implementation.

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{Channel, Session};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SshError;
use crate::model::SshAccess;

/// How long a pump thread sleeps when nothing moved.
const IDLE_SLEEP: Duration = Duration::from_millis(20);

/// libssh2 `LIBSSH2_ERROR_EAGAIN`.
const EAGAIN: i32 = -37;

/// Output of a finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit status.
    pub exit_code: i32,
}

impl ShellOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for substring checks.
    #[must_use]
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// A long-running process attached to a pseudo-terminal.
#[derive(Debug)]
pub struct PtyProcess {
    /// Output chunks; closes when the process exits.
    pub output: mpsc::UnboundedReceiver<String>,
    /// Raw bytes written to the terminal (keystrokes, interrupt).
    pub input: mpsc::UnboundedSender<Vec<u8>>,
}

/// A live remote port forward.
///
/// Clones share one stop flag. Once cancelled the implementation stops
/// accepting connections and releases the remote listener.
#[derive(Debug, Clone)]
pub struct PortForward {
    port: u16,
    stop: Arc<AtomicBool>,
}

impl PortForward {
    /// A running forward bound to `port` on the remote side.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Port bound on the remote loopback.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Ask the forward to shut down. Idempotent.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// One remote shell session. Implementations serialize all operations on it.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command to completion, optionally feeding `stdin`.
    async fn exec(&self, command: &str, stdin: Option<&str>) -> Result<ShellOutput, SshError>;

    /// Copy a local file to `remote` with the given mode.
    async fn upload(&self, local: &Path, remote: &str, mode: i32) -> Result<(), SshError>;

    /// Forward `remote_port` on the host's loopback to `local` until cancelled.
    async fn forward_remote_port(&self, remote_port: u16, local: SocketAddr)
        -> Result<PortForward, SshError>;

    /// Start a command under a PTY and keep it running.
    async fn spawn_pty(&self, command: &str, stdin: Option<&str>) -> Result<PtyProcess, SshError>;
}

/// [`RemoteShell`] over a single libssh2 session.
#[derive(Clone)]
pub struct Ssh2Shell {
    session: Arc<Mutex<Session>>,
    label: String,
}

impl Ssh2Shell {
    /// Connect and authenticate.
    ///
    /// Tries the private key first, then the password, then the SSH agent.
    ///
    /// # Errors
    /// Returns an error if the connection or authentication fails.
    pub async fn connect(access: &SshAccess) -> Result<Self, SshError> {
        let access = access.clone();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&access)).await?
    }

    fn connect_blocking(access: &SshAccess) -> Result<Self, SshError> {
        let addr = format!("{}:{}", access.address, access.port);
        info!(addr = %addr, user = %access.username, "Opening SSH session");

        let tcp = TcpStream::connect((access.address.as_str(), access.port))
            .map_err(|source| SshError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        let auth = if let Some(key) = &access.private_key {
            session.userauth_pubkey_file(&access.username, None, key, None)
        } else if let Some(password) = &access.password {
            session.userauth_password(&access.username, password)
        } else {
            session.userauth_agent(&access.username)
        };
        if auth.is_err() || !session.authenticated() {
            return Err(SshError::AuthenticationFailed(access.username.clone()));
        }
        session.set_keepalive(true, 30);

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            label: addr,
        })
    }

    fn lock(session: &Mutex<Session>) -> Result<MutexGuard<'_, Session>, SshError> {
        session
            .lock()
            .map_err(|_| SshError::Io(std::io::Error::other("SSH session lock poisoned")))
    }

    /// Runs `command` to completion. Both streams are drained in turn with the
    /// session in non-blocking mode, and the lock is released between polls.
    fn exec_blocking(
        session: &Mutex<Session>,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<ShellOutput, SshError> {
        let mut channel = {
            let guard = Self::lock(session)?;
            let mut channel = guard.channel_session()?;
            channel.exec(command)?;
            if let Some(input) = stdin {
                channel.write_all(input.as_bytes())?;
            }
            channel.send_eof()?;
            channel
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let (moved, eof) = Self::nonblocking(session, || -> std::io::Result<(bool, bool)> {
                let out = read_available(&mut channel, &mut stdout, &mut buf)?;
                let err = read_available(&mut channel.stderr(), &mut stderr, &mut buf)?;
                Ok((out || err, channel.eof()))
            })??;
            if eof && !moved {
                break;
            }
            if !moved {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        let _guard = Self::lock(session)?;
        channel.wait_close()?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: channel.exit_status()?,
        })
    }

    fn upload_blocking(
        session: &Mutex<Session>,
        local: &Path,
        remote: &str,
        mode: i32,
    ) -> Result<(), SshError> {
        let data = std::fs::read(local)?;
        let session = Self::lock(session)?;
        let mut channel = session.scp_send(Path::new(remote), mode, data.len() as u64, None)?;
        channel.write_all(&data)?;
        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(())
    }

    /// Run `f` with the session in non-blocking mode so a pump thread never
    /// holds the lock while waiting on the network.
    fn nonblocking<T>(
        session: &Mutex<Session>,
        f: impl FnOnce() -> T,
    ) -> Result<T, SshError> {
        let guard = Self::lock(session)?;
        guard.set_blocking(false);
        let out = f();
        guard.set_blocking(true);
        Ok(out)
    }

    /// Shuttle bytes between a forwarded channel and a local TCP connection.
    fn pump_forward(
        session: &Mutex<Session>,
        mut channel: Channel,
        mut local: TcpStream,
        forward: &PortForward,
    ) {
        if local.set_nonblocking(true).is_err() {
            return;
        }
        let mut buf = [0u8; 8192];

        while !forward.is_cancelled() {
            let mut moved = false;

            let from_remote = Self::nonblocking(session, || channel.read(&mut buf));
            match from_remote {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if local.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    moved = true;
                }
                Ok(Err(e)) if e.kind() == IoErrorKind::WouldBlock => {}
                _ => break,
            }

            match local.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    let sent = Self::nonblocking(session, || {
                        let mut offset = 0;
                        while offset < data.len() {
                            match channel.write(&data[offset..]) {
                                Ok(w) => offset += w,
                                Err(e) if e.kind() == IoErrorKind::WouldBlock => {}
                                Err(e) => return Err(e),
                            }
                        }
                        Ok(())
                    });
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                    moved = true;
                }
                Err(e) if e.kind() == IoErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            if !moved {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        let _ = Self::nonblocking(session, || channel.close());
        debug!("Forwarded connection closed");
    }

    fn pump_pty(
        session: &Mutex<Session>,
        mut channel: Channel,
        output: &mpsc::UnboundedSender<String>,
        input: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let mut buf = [0u8; 4096];

        loop {
            let mut moved = false;

            match Self::nonblocking(session, || channel.read(&mut buf)) {
                Ok(Ok(0)) => {
                    let eof = Self::nonblocking(session, || channel.eof()).unwrap_or(true);
                    if eof {
                        break;
                    }
                }
                Ok(Ok(n)) => {
                    if output
                        .send(String::from_utf8_lossy(&buf[..n]).into_owned())
                        .is_err()
                    {
                        break;
                    }
                    moved = true;
                }
                Ok(Err(e)) if e.kind() == IoErrorKind::WouldBlock => {}
                _ => break,
            }

            while let Ok(bytes) = input.try_recv() {
                let written = Self::nonblocking(session, || {
                    let mut offset = 0;
                    while offset < bytes.len() {
                        match channel.write(&bytes[offset..]) {
                            Ok(w) => offset += w,
                            Err(e) if e.kind() == IoErrorKind::WouldBlock => {}
                            Err(e) => return Err(e),
                        }
                    }
                    channel.flush()
                });
                if !matches!(written, Ok(Ok(()))) {
                    warn!("Failed to write to PTY");
                }
                moved = true;
            }

            if !moved {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        let _ = Self::nonblocking(session, || channel.close());
    }
}

#[async_trait]
impl RemoteShell for Ssh2Shell {
    async fn exec(&self, command: &str, stdin: Option<&str>) -> Result<ShellOutput, SshError> {
        debug!(host = %self.label, command = %command, "SSH exec");
        let session = Arc::clone(&self.session);
        let command = command.to_string();
        let stdin = stdin.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            Self::exec_blocking(&session, &command, stdin.as_deref())
        })
        .await?
    }

    async fn upload(&self, local: &Path, remote: &str, mode: i32) -> Result<(), SshError> {
        info!(host = %self.label, local = %local.display(), remote = %remote, "Uploading file");
        let session = Arc::clone(&self.session);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        tokio::task::spawn_blocking(move || Self::upload_blocking(&session, &local, &remote, mode))
            .await?
    }

    async fn forward_remote_port(
        &self,
        remote_port: u16,
        local: SocketAddr,
    ) -> Result<PortForward, SshError> {
        let session = Arc::clone(&self.session);
        let label = self.label.clone();

        let (mut listener, bound) = tokio::task::spawn_blocking({
            let session = Arc::clone(&session);
            move || -> Result<_, SshError> {
                let guard = Self::lock(&session)?;
                guard
                    .channel_forward_listen(remote_port, Some("127.0.0.1"), None)
                    .map_err(|e| SshError::PortForward(e.to_string()))
            }
        })
        .await??;

        info!(host = %label, remote_port = bound, local = %local, "Remote port forward established");
        let forward = PortForward::new(bound);

        let handle = forward.clone();
        std::thread::spawn(move || {
            while !handle.is_cancelled() {
                match Self::nonblocking(&session, || listener.accept()) {
                    Ok(Ok(channel)) => match TcpStream::connect(local) {
                        Ok(stream) => {
                            let session = Arc::clone(&session);
                            let handle = handle.clone();
                            std::thread::spawn(move || {
                                Self::pump_forward(&session, channel, stream, &handle);
                            });
                        }
                        Err(e) => warn!(local = %local, error = %e, "Forward target unreachable"),
                    },
                    Ok(Err(e)) if matches!(e.code(), ssh2::ErrorCode::Session(EAGAIN)) => {
                        std::thread::sleep(IDLE_SLEEP);
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Port forward listener stopped");
                        break;
                    }
                    Err(_) => break,
                }
            }
            // Dropping the listener sends the cancel request to sshd.
            if let Ok(guard) = Self::lock(&session) {
                drop(listener);
                drop(guard);
            }
            info!(host = %label, remote_port = bound, "Remote port forward closed");
        });

        Ok(forward)
    }

    async fn spawn_pty(&self, command: &str, stdin: Option<&str>) -> Result<PtyProcess, SshError> {
        debug!(host = %self.label, command = %command, "Spawning PTY process");
        let session = Arc::clone(&self.session);
        let command = command.to_string();
        let stdin = stdin.map(str::to_string);

        let channel = tokio::task::spawn_blocking({
            let session = Arc::clone(&session);
            move || -> Result<Channel, SshError> {
                let guard = Self::lock(&session)?;
                let mut channel = guard.channel_session()?;
                channel.request_pty("xterm", None, None)?;
                channel.exec(&command)?;
                if let Some(input) = stdin {
                    channel.write_all(input.as_bytes())?;
                    channel.flush()?;
                }
                Ok(channel)
            }
        })
        .await??;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || Self::pump_pty(&session, channel, &out_tx, &mut in_rx));

        Ok(PtyProcess {
            output: out_rx,
            input: in_tx,
        })
    }
}

/// Append whatever `reader` has ready to `sink`. Returns whether anything was read.
fn read_available(
    reader: &mut impl Read,
    sink: &mut Vec<u8>,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    let mut moved = false;
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(moved),
            Ok(n) => {
                sink.extend_from_slice(&buf[..n]);
                moved = true;
            }
            Err(e) if e.kind() == IoErrorKind::WouldBlock => return Ok(moved),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out scripted chunks, then `WouldBlock`, then end of stream.
    struct Scripted(VecDeque<std::io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_read_available_stops_at_would_block() {
        let mut reader = Scripted(VecDeque::from(vec![
            Ok(b"partial ".to_vec()),
            Ok(b"line".to_vec()),
            Err(IoErrorKind::WouldBlock.into()),
            Ok(b"later".to_vec()),
        ]));
        let mut sink = Vec::new();
        let mut buf = [0u8; 16];

        assert!(read_available(&mut reader, &mut sink, &mut buf).unwrap());
        assert_eq!(sink, b"partial line");
        assert!(read_available(&mut reader, &mut sink, &mut buf).unwrap());
        assert_eq!(sink, b"partial linelater");
        assert!(!read_available(&mut reader, &mut sink, &mut buf).unwrap());
    }

    #[test]
    fn test_read_available_propagates_errors() {
        let mut reader = Scripted(VecDeque::from(vec![Err(IoErrorKind::ConnectionReset.into())]));
        let mut sink = Vec::new();
        let mut buf = [0u8; 16];
        assert!(read_available(&mut reader, &mut sink, &mut buf).is_err());
    }

    #[test]
    fn test_port_forward_cancel_is_shared() {
        let forward = PortForward::new(9000);
        let clone = forward.clone();
        assert!(!clone.is_cancelled());
        forward.cancel();
        forward.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.port(), 9000);
    }
}

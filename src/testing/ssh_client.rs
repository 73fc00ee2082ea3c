//! SSH test client for automated testing.
//!
//! Connects to a running server, drives the shell/pty request sequence,
//! sends lines and captures stdout and stderr separately.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelId, ChannelMsg, Disconnect};

/// SSH test client for sending commands and capturing output.
pub struct SshTestClient {
    handle: Handle<ClientHandler>,
    channel: russh::Channel<client::Msg>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl SshTestClient {
    /// Connect with public-key auth, then request a shell and a pty.
    pub async fn connect(addr: SocketAddr, username: &str, key: PrivateKey) -> Result<Self> {
        let handle = authenticate(addr, username, key).await?;
        Self::open_session(handle).await
    }

    /// Connect as an anonymous user over the "none" method.
    pub async fn connect_guest(addr: SocketAddr, username: &str) -> Result<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, ClientHandler)
            .await
            .context("failed to connect")?;
        let auth_result = handle
            .authenticate_none(username)
            .await
            .context("none authentication failed")?;
        if !auth_result.success() {
            anyhow::bail!("authentication rejected");
        }
        Self::open_session(handle).await
    }

    /// Complete connection after successful auth: shell first, then pty.
    async fn open_session(handle: Handle<ClientHandler>) -> Result<Self> {
        let mut channel = handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        channel
            .request_shell(true)
            .await
            .context("failed to request shell")?;
        if !wait_reply(&mut channel, &mut stdout, &mut stderr).await? {
            anyhow::bail!("shell request rejected");
        }

        channel
            .request_pty(true, "xterm-256color", 80, 24, 0, 0, &[])
            .await
            .context("failed to request pty")?;
        if !wait_reply(&mut channel, &mut stdout, &mut stderr).await? {
            anyhow::bail!("pty request rejected");
        }

        Ok(Self {
            handle,
            channel,
            stdout,
            stderr,
        })
    }

    /// Send input to the shell (adds a newline if not present).
    pub async fn send(&mut self, input: &str) -> Result<()> {
        let data = if input.ends_with('\n') {
            input.as_bytes().to_vec()
        } else {
            format!("{input}\n").into_bytes()
        };

        self.channel
            .data(&data[..])
            .await
            .context("failed to send data")?;

        Ok(())
    }

    /// Issue another shell request on the open session and report the
    /// server's reply.
    pub async fn request_shell_again(&mut self) -> Result<bool> {
        self.channel
            .request_shell(true)
            .await
            .context("failed to request shell")?;
        wait_reply(&mut self.channel, &mut self.stdout, &mut self.stderr).await
    }

    /// Collect output until the timeout expires.
    pub async fn wait_and_collect(&mut self, duration: Duration) -> Result<Vec<u8>> {
        self.wait_internal(duration, None, Stream::Stdout).await
    }

    /// Wait until the pattern appears in stdout (ANSI stripped), or fail on
    /// timeout. Returns everything collected so far.
    pub async fn wait_for_pattern(&mut self, pattern: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.wait_internal(timeout, Some(pattern), Stream::Stdout)
            .await
    }

    /// Wait until the pattern appears on the stderr substream.
    pub async fn wait_for_stderr_pattern(
        &mut self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.wait_internal(timeout, Some(pattern), Stream::Stderr)
            .await
    }

    async fn wait_internal(
        &mut self,
        duration: Duration,
        pattern: Option<&str>,
        stream: Stream,
    ) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            if let Some(pattern) = pattern {
                let haystack = match stream {
                    Stream::Stdout => strip_ansi(&self.stdout),
                    Stream::Stderr => strip_ansi(&self.stderr),
                };
                if haystack.contains(pattern) {
                    return Ok(match stream {
                        Stream::Stdout => self.stdout.clone(),
                        Stream::Stderr => self.stderr.clone(),
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                if pattern.is_some() {
                    anyhow::bail!("timeout waiting for pattern");
                }
                return Ok(match stream {
                    Stream::Stdout => self.stdout.clone(),
                    Stream::Stderr => self.stderr.clone(),
                });
            }

            tokio::select! {
                msg = self.channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            self.stdout.extend_from_slice(&data);
                        }
                        Some(ChannelMsg::ExtendedData { ext: 1, data }) => {
                            self.stderr.extend_from_slice(&data);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
                _ = tokio::time::sleep(remaining) => {
                    if pattern.is_some() {
                        anyhow::bail!("timeout waiting for pattern");
                    }
                    break;
                }
            }
        }

        Ok(match stream {
            Stream::Stdout => self.stdout.clone(),
            Stream::Stderr => self.stderr.clone(),
        })
    }

    /// Close the connection.
    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "goodbye", "en")
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Authenticate with a private key, returning the raw connection handle.
pub async fn authenticate(
    addr: SocketAddr,
    username: &str,
    key: PrivateKey,
) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, ClientHandler)
        .await
        .context("failed to connect")?;

    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let auth_result = handle
        .authenticate_publickey(username, key_with_alg)
        .await
        .context("key authentication failed")?;

    if !auth_result.success() {
        anyhow::bail!("authentication rejected");
    }

    Ok(handle)
}

/// Attempt public-key auth and report whether the server accepted it.
pub async fn auth_attempt(addr: SocketAddr, username: &str, key: PrivateKey) -> Result<bool> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, ClientHandler)
        .await
        .context("failed to connect")?;

    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let auth_result = handle
        .authenticate_publickey(username, key_with_alg)
        .await
        .context("key authentication failed")?;

    Ok(auth_result.success())
}

/// Drain channel messages until a request reply arrives, buffering any
/// output that shows up in between.
pub async fn wait_reply(
    channel: &mut russh::Channel<client::Msg>,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
) -> Result<bool> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(true),
            Some(ChannelMsg::Failure) => return Ok(false),
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { ext: 1, data }) => stderr.extend_from_slice(&data),
            Some(_) => {}
            None => anyhow::bail!("channel closed while waiting for reply"),
        }
    }
}

/// Strip ANSI escape sequences from bytes, return as string.
pub fn strip_ansi(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut result = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Client handler that trusts any host key (local testing only).
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        _data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

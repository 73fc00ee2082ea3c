//! Per-connection task and session handler.
//!
//! A `ConnTask` owns one accepted TCP connection from accept to close and
//! drives the SSH handshake through the transport library. The
//! `SessionHandler` dispatches channel and request events for that
//! connection: session channels are accepted and retained, a `shell`
//! request installs the command shell, a following `pty-req` attaches a
//! terminal, and everything else is declined.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, Pty};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthManager, Permissions};
use crate::banner;
use crate::error::Error;
use crate::pool::Task;
use crate::shell::{CommandContext, Shell};
use crate::terminal::Terminal;

/// Owns one TCP connection and runs it to completion on the worker pool.
pub struct ConnTask {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    ssh_config: Arc<server::Config>,
    auth: Arc<AuthManager>,
}

impl ConnTask {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        ssh_config: Arc<server::Config>,
        auth: Arc<AuthManager>,
    ) -> Self {
        Self {
            stream: Some(stream),
            peer,
            ssh_config,
            auth,
        }
    }
}

#[async_trait]
impl Task for ConnTask {
    async fn run(&mut self, cancel: CancellationToken) -> Result<(), Error> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };

        debug!(peer = %self.peer, "performing ssh handshake");
        let handler = SessionHandler::new(self.auth.clone(), cancel.clone(), self.peer);
        // the session takes ownership of the stream; the socket closes
        // exactly once, when the session ends
        let session = server::run_stream(self.ssh_config.clone(), stream, handler).await?;
        let handle = session.handle();
        info!(peer = %self.peer, "connection established");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %self.peer, "connection cancelled");
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "server shutting down".to_string(),
                        "en".to_string(),
                    )
                    .await;
            }
            result = session => match result {
                Ok(()) => {}
                Err(Error::Ssh(russh::Error::Disconnect)) => {
                    debug!(peer = %self.peer, "client disconnected");
                }
                Err(err) => return Err(err),
            },
        }
        Ok(())
    }

    fn on_finish(&mut self) {
        debug!(peer = %self.peer, "connection closed");
    }

    fn on_error(&mut self, err: Error) {
        error!(peer = %self.peer, %err, "connection failed");
    }
}

/// Per-connection SSH event handler.
pub struct SessionHandler {
    auth: Arc<AuthManager>,
    cancel: CancellationToken,
    peer: SocketAddr,
    user: Option<String>,
    permissions: Option<Permissions>,
    /// Session channels retained until a terminal takes them over.
    channels: HashMap<ChannelId, Channel<Msg>>,
    /// Installed by the `shell` request, read by `pty-req`.
    shell: Option<Arc<Shell>>,
    banner_sent: bool,
    channel_seq: u32,
}

impl SessionHandler {
    pub fn new(auth: Arc<AuthManager>, cancel: CancellationToken, peer: SocketAddr) -> Self {
        Self {
            auth,
            cancel,
            peer,
            user: None,
            permissions: None,
            channels: HashMap::new(),
            shell: None,
            banner_sent: false,
            channel_seq: 0,
        }
    }

    /// Permissions granted to this connection, once authenticated.
    pub fn permissions(&self) -> Option<&Permissions> {
        self.permissions.as_ref()
    }

    fn accept(&mut self, user: &str, method: &str, permissions: Permissions) -> Auth {
        info!(peer = %self.peer, user, method, "authenticated");
        self.user = Some(user.to_string());
        self.permissions = Some(permissions);
        Auth::Accept
    }

    fn reject(&self, user: &str, method: &str, err: Error) -> Auth {
        warn!(peer = %self.peer, user, method, %err, "authentication failed");
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn authenticated_user(&self) -> String {
        self.user
            .clone()
            .unwrap_or_else(|| auth::GUEST_USER.to_string())
    }
}

impl Handler for SessionHandler {
    type Error = Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if user == auth::GUEST_USER || auth::is_advertised(&key.algorithm()) {
            return Ok(Auth::Accept);
        }
        Ok(self.reject(user, "publickey", Error::KeyNotSupported))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self.auth.publickey(user, key) {
            Ok(permissions) => Ok(self.accept(user, "publickey", permissions)),
            Err(err) => Ok(self.reject(user, "publickey", err)),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.auth.password(user, password) {
            Ok(permissions) => Ok(self.accept(user, "password", permissions)),
            Err(err) => Ok(self.reject(user, "password", err)),
        }
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        match self.auth.no_auth(user) {
            Ok(permissions) => Ok(self.accept(user, "none", permissions)),
            Err(err) => Ok(self.reject(user, "none", err)),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = self.channel_seq;
        self.channel_seq += 1;
        info!(peer = %self.peer, channel = id, "session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // the shell must be visible before the success reply goes out
        self.shell = Some(Arc::new(Shell::new()));

        if !self.banner_sent {
            self.banner_sent = true;
            let greeting = banner::render(&self.authenticated_user()).replace('\n', "\r\n");
            let _ = session.data(channel, CryptoVec::from(greeting.as_bytes()));
        }

        session.channel_success(channel)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(shell) = self.shell.clone() else {
            // no shell installed yet; the client must retry after `shell`
            warn!(peer = %self.peer, "pty request before shell request");
            session.channel_failure(channel)?;
            return Ok(());
        };
        let Some(retained) = self.channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        debug!(peer = %self.peer, term, col_width, row_height, "attaching terminal");
        let ctx = CommandContext {
            user: self.authenticated_user(),
        };
        let mut terminal = Terminal::new(retained, shell, ctx);
        terminal.set_window(col_width, row_height);
        tokio::spawn(terminal.run(self.cancel.child_token()));

        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, "declining exec request");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, name, "declining subsystem request");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)?;
        Ok(())
    }
}

//! Socket server: listener, accept loop, connection dispatch, lifecycle.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use russh::keys::decode_secret_key;
use russh::server::Config as SshConfig;
use russh::{MethodKind, MethodSet, SshId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::AuthManager;
use crate::config::ServerConfig;
use crate::conn::ConnTask;
use crate::error::Error;
use crate::keystore::KeyStore;
use crate::pool::WorkerPool;

pub struct Server {
    config: ServerConfig,
    auth: Arc<AuthManager>,
    pool: Arc<Mutex<Option<Arc<WorkerPool>>>>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl Server {
    /// Build a server over a key store. The store is mandatory.
    pub fn new(config: ServerConfig, store: Option<Arc<KeyStore>>) -> Result<Self, Error> {
        let store = store.ok_or(Error::MissingKeyStore)?;
        debug!("server created");
        Ok(Self {
            config,
            auth: Arc::new(AuthManager::new(store)),
            pool: Arc::new(Mutex::new(None)),
            local_addr: Arc::new(Mutex::new(None)),
        })
    }

    /// Address the listener is bound to, once `serve` has run. Useful when
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().ok()?
    }

    /// Reconcile the host key with the store and assemble the transport
    /// configuration.
    fn load_ssh_config(&self) -> Result<SshConfig, Error> {
        let pem = self
            .auth
            .ensure_host_key(self.config.host_key.as_deref())
            .map_err(Error::ssh_config)?;
        let host_key = decode_secret_key(&pem, None).map_err(Error::ssh_config)?;

        Ok(SshConfig {
            server_id: SshId::Standard(self.config.server_version.clone()),
            methods: MethodSet::from(
                &[
                    MethodKind::PublicKey,
                    MethodKind::Password,
                    MethodKind::None,
                ][..],
            ),
            keys: vec![host_key],
            max_auth_attempts: self.config.max_auth_tries,
            keepalive_interval: Some(self.config.keepalive_interval()),
            nodelay: true,
            ..Default::default()
        })
    }

    fn init_worker_pool(&self, cancel: &CancellationToken) -> Result<Arc<WorkerPool>, Error> {
        let mut guard = self.pool.lock().map_err(|_| Error::LockPoisoned)?;
        if guard.is_some() {
            return Err(Error::WorkerPoolAlreadyInitialized);
        }
        debug!(workers = self.config.workers, "initializing worker pool");
        let pool = Arc::new(WorkerPool::new(self.config.workers, cancel.clone()));
        *guard = Some(pool.clone());
        info!("worker pool initialized");
        Ok(pool)
    }

    /// Start accepting connections. Non-blocking: startup errors are
    /// returned synchronously, runtime errors are logged. Cancelling the
    /// token closes the listener and releases the worker pool so `serve`
    /// may be called again.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), Error> {
        let ssh_config = Arc::new(self.load_ssh_config()?);
        let pool = self.init_worker_pool(&cancel)?;

        let address = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&address).await?;
        let bound = listener.local_addr()?;
        if let Ok(mut guard) = self.local_addr.lock() {
            *guard = Some(bound);
        }
        info!(%bound, "listening");

        let (conn_tx, mut conn_rx) = mpsc::channel::<(TcpStream, SocketAddr)>(1);

        // accept loop: single consumer, connections dispatched in order
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => {
                        debug!("listener closed");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if conn_tx.send((stream, peer)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            error!(%err, "accept failed");
                            break;
                        }
                    }
                }
            }
        });

        // dispatch loop: wrap accepted connections and hand them to the pool
        let dispatch_cancel = cancel.clone();
        let auth = self.auth.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    conn = conn_rx.recv() => {
                        let Some((stream, peer)) = conn else { break };
                        debug!(%peer, "new connection");
                        let task = ConnTask::new(stream, peer, ssh_config.clone(), auth.clone());
                        if pool.add(Box::new(task)).await.is_err() {
                            debug!(%peer, "worker pool gone, dropping connection");
                            break;
                        }
                        debug!(%peer, "connection added to worker pool");
                    }
                }
            }
        });

        // watcher: release the pool on cancellation so serve can run again
        let watcher_pool = self.pool.clone();
        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            watcher_cancel.cancelled().await;
            info!("server stopping");
            if let Ok(mut guard) = watcher_pool.lock() {
                *guard = None;
            }
        });

        info!("server started");
        Ok(())
    }
}

//! End-to-end tests over a real listener.
//!
//! Each test starts a server on an ephemeral port with an in-memory key
//! store and drives it with the russh-based test client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{decode_secret_key, PrivateKey};
use tokio_util::sync::CancellationToken;

use patchssh::config::ServerConfig;
use patchssh::keystore::KeyStore;
use patchssh::server::Server;
use patchssh::testing::{self, SshTestClient};

const WAIT: Duration = Duration::from_secs(5);

fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
}

async fn start_server(
    store: Arc<KeyStore>,
    host_key: Option<String>,
) -> Result<(SocketAddr, CancellationToken)> {
    let config = ServerConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        host_key,
        ..ServerConfig::default()
    };
    let server = Server::new(config, Some(store))?;
    let cancel = CancellationToken::new();
    server.serve(cancel.clone()).await?;
    let addr = server.local_addr().context("server did not bind")?;
    Ok((addr, cancel))
}

#[tokio::test]
async fn guest_echo() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let (addr, cancel) = start_server(store, None).await?;

    let mut client = SshTestClient::connect_guest(addr, "guest").await?;
    let banner = client.wait_for_pattern("Hello guest!", WAIT).await?;
    let banner_text = String::from_utf8_lossy(&banner);
    assert!(banner_text.contains("Welcome to patchssh!"));

    client.send("echo hello").await?;
    let output = client.wait_for_pattern("echo: hello", WAIT).await?;
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("echo: hello\r\n"), "output was: {text:?}");

    client.close().await?;
    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn guest_public_key_is_accepted_without_a_record() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let (addr, cancel) = start_server(store, None).await?;

    // any key works for the guest user, stored or not
    let accepted = testing::ssh_client::auth_attempt(addr, "guest", generate_key()).await?;
    assert!(accepted);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn unknown_user_is_rejected() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let (addr, cancel) = start_server(store, None).await?;

    let accepted = testing::ssh_client::auth_attempt(addr, "alice", generate_key()).await?;
    assert!(!accepted);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn provisioned_user_sees_red_framed_errors() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let key = generate_key();
    store.add_known_host("alice", key.public_key())?;
    let (addr, cancel) = start_server(store, None).await?;

    let mut client = SshTestClient::connect(addr, "alice", key).await?;
    client.wait_for_pattern("Hello alice!", WAIT).await?;

    client.send("unknownthing").await?;
    let stderr = client
        .wait_for_stderr_pattern("command not found", WAIT)
        .await?;
    let raw = String::from_utf8_lossy(&stderr);
    assert!(
        raw.contains("\x1b[31mError executing command:\r\n\tcommand not found\x1b[0m"),
        "stderr was: {raw:?}"
    );

    // the prompt returns on the main channel
    client.send("echo back").await?;
    client.wait_for_pattern("echo: back", WAIT).await?;

    client.close().await?;
    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn wrong_key_for_provisioned_user_is_rejected() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    store.add_known_host("alice", generate_key().public_key())?;
    let (addr, cancel) = start_server(store, None).await?;

    let accepted = testing::ssh_client::auth_attempt(addr, "alice", generate_key()).await?;
    assert!(!accepted);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn host_key_is_seeded_on_first_start() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let (_addr, cancel) = start_server(store.clone(), None).await?;

    let pem = store.get_host_key()?;
    let key = decode_secret_key(&pem, None)?;
    assert_eq!(key.algorithm(), Algorithm::Ed25519);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn configured_host_key_overrides_the_stored_one() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let old = generate_key().to_openssh(LineEnding::LF)?.to_string();
    store.set_host_key(&old)?;

    let new = generate_key().to_openssh(LineEnding::LF)?.to_string();
    let (_addr, cancel) = start_server(store.clone(), Some(new.clone())).await?;

    let stored = store.get_host_key()?;
    assert_eq!(stored, new);
    assert_ne!(stored, old);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn stored_host_key_survives_a_restart_without_configuration() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let old = generate_key().to_openssh(LineEnding::LF)?.to_string();
    store.set_host_key(&old)?;

    let (_addr, cancel) = start_server(store.clone(), None).await?;
    assert_eq!(store.get_host_key()?, old);
    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn pty_before_shell_is_rejected_and_retry_succeeds() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let key = generate_key();
    store.add_known_host("alice", key.public_key())?;
    let (addr, cancel) = start_server(store, None).await?;

    let handle = testing::ssh_client::authenticate(addr, "alice", key).await?;
    let mut channel = handle.channel_open_session().await?;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    // no shell installed yet: the pty request is declined
    channel
        .request_pty(true, "xterm-256color", 80, 24, 0, 0, &[])
        .await?;
    let granted = testing::ssh_client::wait_reply(&mut channel, &mut stdout, &mut stderr).await?;
    assert!(!granted);

    // after a shell request the same pty request goes through
    channel.request_shell(true).await?;
    assert!(testing::ssh_client::wait_reply(&mut channel, &mut stdout, &mut stderr).await?);
    channel
        .request_pty(true, "xterm-256color", 80, 24, 0, 0, &[])
        .await?;
    assert!(testing::ssh_client::wait_reply(&mut channel, &mut stdout, &mut stderr).await?);

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn second_shell_request_replaces_the_first() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let (addr, cancel) = start_server(store, None).await?;

    let mut client = SshTestClient::connect_guest(addr, "guest").await?;
    client.wait_for_pattern("Hello guest!", WAIT).await?;

    assert!(client.request_shell_again().await?);

    // the session keeps working on the replacement shell
    client.send("echo still here").await?;
    client.wait_for_pattern("echo: still here", WAIT).await?;

    client.close().await?;
    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn empty_line_redraws_the_prompt() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let (addr, cancel) = start_server(store, None).await?;

    let mut client = SshTestClient::connect_guest(addr, "guest").await?;
    client.wait_for_pattern("> ", WAIT).await?;

    client.send("").await?;
    let output = client.wait_and_collect(Duration::from_millis(300)).await?;
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("\r\n> "), "output was: {text:?}");

    client.close().await?;
    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn exit_terminates_the_session() -> Result<()> {
    let store = Arc::new(KeyStore::in_memory()?);
    let (addr, cancel) = start_server(store, None).await?;

    let mut client = SshTestClient::connect_guest(addr, "guest").await?;
    client.wait_for_pattern("> ", WAIT).await?;

    client.send("exit").await?;
    // the server closes the channel; collection ends when it does
    client.wait_and_collect(Duration::from_secs(2)).await?;

    client.close().await?;
    cancel.cancel();
    Ok(())
}

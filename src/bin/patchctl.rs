//! patchctl - operator CLI for the patchssh key store
//!
//! Usage:
//!   patchctl add <identifier> <pubkey-file>
//!   patchctl add <identifier> --key "ssh-ed25519 AAAA..."
//!   patchctl check <identifier> <pubkey-file>
//!   patchctl check <identifier> --key "ssh-ed25519 AAAA..."
//!   patchctl host-key

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::PublicKey;

use patchssh::config::Config;
use patchssh::keystore::KeyStore;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let config_path = env::var("PATCHSSH_CONFIG").unwrap_or_else(|_| "patchssh.toml".to_string());
    let mut config = Config::load(&config_path)?;
    config.apply_env()?;

    // same working directory as the daemon, so relative paths line up
    fs::create_dir_all(&config.workdir)
        .with_context(|| format!("failed to create workdir {}", config.workdir))?;
    env::set_current_dir(&config.workdir)
        .with_context(|| format!("failed to change into workdir {}", config.workdir))?;

    let store = KeyStore::open(&config.db.path)
        .with_context(|| format!("failed to open key store at {}", config.db.path))?;

    match args[1].as_str() {
        "add" => cmd_add(&store, &args[2..])?,
        "check" => cmd_check(&store, &args[2..])?,
        "host-key" => cmd_host_key(&store)?,
        "help" | "--help" | "-h" => print_usage(),
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage() {
    eprintln!(
        r#"patchctl - manage patchssh known client keys

Usage:
  patchctl add <identifier> <pubkey-file>
  patchctl add <identifier> --key "ssh-ed25519 AAAA..."
  patchctl check <identifier> <pubkey-file>
  patchctl check <identifier> --key "ssh-ed25519 AAAA..."
  patchctl host-key

Environment:
  PATCHSSH_CONFIG    Config file path (default patchssh.toml)
  PATCHSSH_DB_PATH   Override key store path

Examples:
  patchctl add alice ~/.ssh/id_ed25519.pub
  patchctl add bob --key "ssh-ed25519 AAAAC3... bob@laptop"
"#
    );
}

fn read_key(args: &[String]) -> Result<PublicKey> {
    let raw = if args[0] == "--key" {
        args.get(1)
            .context("--key requires a key string")?
            .clone()
    } else {
        let path = Path::new(&args[0]);
        fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .trim()
            .to_string()
    };
    PublicKey::from_openssh(&raw).context("invalid public key format")
}

fn cmd_add(store: &KeyStore, args: &[String]) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: patchctl add <identifier> <pubkey-file | --key 'key'>");
    }

    let identifier = &args[0];
    let key = read_key(&args[1..])?;

    store.add_known_host(identifier, &key)?;
    println!("Added key for {identifier}");
    Ok(())
}

fn cmd_check(store: &KeyStore, args: &[String]) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: patchctl check <identifier> <pubkey-file | --key 'key'>");
    }

    let identifier = &args[0];
    let key = read_key(&args[1..])?;

    if store.check_known_host(identifier, &key)? {
        println!("Key matches the stored record for {identifier}");
    } else {
        println!("Key does NOT match the stored record for {identifier}");
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_host_key(store: &KeyStore) -> Result<()> {
    let pem = store.get_host_key()?;
    println!("{pem}");
    Ok(())
}

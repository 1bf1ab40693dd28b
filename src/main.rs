// Command line front end for the TFTP probe.
//
// Two roles, each a subcommand:
//
//   serve   listen for write requests (default port 69) and store what arrives, logging an
//           integrity report for every transfer
//   send    upload one file to a server, optionally through a fault variant
//
// Only the write path of TFTP is spoken, with the `size` option (RFC 2347 style) carrying the
// exact payload length:
//
//   WRQ   0x02 | filename | 0 | "octet" | 0 | "size" | 0 | <decimal length> | 0
//   OACK  0x06 | "size" | 0 | <decimal length> | 0
//   DATA  0x03 | block (2 bytes) | 0-512 bytes
//   ACK   0x04 | block (2 bytes)
//
// A DATA packet shorter than 512 bytes ends the transfer; a payload whose length is a multiple of
// 512 is followed by an empty DATA packet.
//
// Fault variants, for exercising a receiver:
//
//   out-of-order          the 3rd and 4th block of every group of four swap places
//   duplicate             every 5th block is sent twice
//   wrong-block-numbers   every 7th block carries its number + 10
//   truncated             stop after 60% of the payload, never send the terminal block
//   timeout               go quiet for 10 seconds before block 5
//   packet-loss           skip each block with probability 0.3
//
// Logging goes through env_logger; set RUST_LOG to change verbosity (default: info).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tftp_probe::config::{Config, TFTP_PORT};
use tftp_probe::event::{self, TransferEvent};
use tftp_probe::{spawn_transfer, AbortHandle, Server, SessionError, Transfer, Variant};

#[derive(Debug, Parser)]
#[command(name = "tftp-probe", version, about = "TFTP upload engine with fault injection")]
struct Cli {
    /// TOML file with [server] and [client] tables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Receive uploads and report their integrity
    Serve {
        /// Bind address (host:port)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Directory received files are written into
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Give up on a transfer after this long without data
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Replace files that already exist
        #[arg(long)]
        overwrite: bool,
    },

    /// Upload a file
    Send {
        /// Server address, `ip` (port 69) or `ip:port`
        peer: String,

        /// File to upload
        file: PathBuf,

        /// Name to request on the server (defaults to the file's name)
        #[arg(long)]
        name: Option<String>,

        #[arg(long, value_enum, default_value_t = Variant::Normal)]
        variant: Variant,

        /// Seed for the packet-loss variant
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn parse_peer(peer: &str) -> Result<SocketAddr> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = peer.parse().with_context(|| format!("Invalid peer address {peer:?}"))?;
    Ok(SocketAddr::new(ip, TFTP_PORT))
}

/// Aborts `abort` on Ctrl-C.
fn abort_on_ctrl_c(abort: AbortHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, aborting");
            abort.abort();
        }
    });
}

async fn serve(mut config: Config, bind: Option<SocketAddr>, output_dir: Option<PathBuf>, timeout_ms: Option<u64>, overwrite: bool) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(dir) = output_dir {
        config.server.output_dir = dir;
    }
    if let Some(ms) = timeout_ms {
        config.server.receive_timeout_ms = ms;
    }
    config.server.overwrite |= overwrite;

    let bind = config.server.bind;
    let server = Server::bind(config.server).with_context(|| format!("Failed to bind {bind}"))?;
    let abort = AbortHandle::new();
    abort_on_ctrl_c(abort.clone());
    server.serve(&abort).await?;
    Ok(())
}

async fn send(mut config: Config, peer: &str, file: PathBuf, name: Option<String>, variant: Variant, seed: Option<u64>) -> Result<()> {
    if seed.is_some() {
        config.client.loss_seed = seed;
    }
    let peer = parse_peer(peer)?;
    let transfer = Transfer::from_file(peer, &file, name)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let (tx, mut rx) = event::channel();
    let handle = spawn_transfer(config.client, transfer, variant, Some(tx));
    abort_on_ctrl_c(handle.abort_handle());

    while let Some(event) = rx.recv().await {
        println!("{event}");
        if matches!(event, TransferEvent::Completed(_) | TransferEvent::Aborted { .. } | TransferEvent::Failed(_)) {
            break;
        }
    }

    match handle.join().await {
        Ok(_) => Ok(()),
        Err(SessionError::Aborted { bytes_sent }) => {
            anyhow::bail!("Transfer aborted after {bytes_sent} bytes")
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind, output_dir, timeout_ms, overwrite } => {
            serve(config, bind, output_dir, timeout_ms, overwrite).await
        }
        Command::Send { peer, file, name, variant, seed } => {
            send(config, &peer, file, name, variant, seed).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        assert_eq!(parse_peer("10.0.0.2").unwrap(), "10.0.0.2:69".parse().unwrap());
        assert_eq!(parse_peer("10.0.0.2:6969").unwrap(), "10.0.0.2:6969".parse().unwrap());
        assert_eq!(parse_peer("::1").unwrap(), "[::1]:69".parse().unwrap());
        assert!(parse_peer("not-an-address").is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from(["tftp-probe", "send", "127.0.0.1", "f.bin", "--variant", "wrong-block-numbers"]).unwrap();
        match cli.command {
            Command::Send { variant, .. } => assert_eq!(variant, Variant::WrongBlockNumbers),
            other => panic!("Expected send, got {:?}", other),
        }
    }
}

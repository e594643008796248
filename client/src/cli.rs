use std::time::Duration;

use clap::{Parser, Subcommand};

use shared::TCP_PORT;

/// Terminal chat client
#[derive(Debug, Parser)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Debug, Subcommand)]
pub enum Mode {
    /// Chat with one other process on this machine over shared memory
    Local {
        /// Client slot to occupy
        #[arg(value_parser = clap::value_parser!(u8).range(1..=2))]
        id: u8,
        /// Name shown to the other side
        name: String,
        /// Use a private set of shared memory names instead of the
        /// well-known ones
        #[arg(long)]
        shm_prefix: Option<String>,
    },
    /// Chat through a relay server
    Network {
        /// Server host name or address
        host: String,
        /// Name shown to the other side
        name: String,
        #[arg(short, long, default_value_t = TCP_PORT)]
        port: u16,
        /// Give up connecting after this many seconds
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

impl Mode {
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self {
            Mode::Network { timeout_secs, .. } if *timeout_secs > 0 => {
                Some(Duration::from_secs(*timeout_secs))
            }
            _ => None,
        }
    }
}

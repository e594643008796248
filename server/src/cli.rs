use clap::Parser;

use shared::{MAX_CLIENTS, TCP_PORT};

/// Chat relay server
#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    /// Port to listen on
    #[arg(short, long, default_value_t = TCP_PORT)]
    pub port: u16,
    /// Maximum number of simultaneously connected clients
    #[arg(short, long, default_value_t = MAX_CLIENTS)]
    pub max_clients: usize,
}

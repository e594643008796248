use std::{
    io,
    process::exit,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{bail, Context};
use clap::Parser;
use log::info;

pub mod cli;
pub mod handler;
pub mod registry;
pub mod relay;

use cli::Args;
use relay::RelayServer;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let server = match RelayServer::bind((args.bind.as_str(), args.port), args.max_clients) {
        Ok(server) => server,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            bail!(
                "port {} is already in use; only one server should run, \
                 everyone else connects as a client",
                args.port
            );
        }
        Err(e) => return Err(e).context(format!("binding {}:{}", args.bind, args.port)),
    };

    let shutdown = server.shutdown_handle();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::Relaxed) {
            eprintln!("Killing");
            exit(1);
        }
        eprintln!("CTRL-C received, shutting down (press again to kill)");
        shutdown.store(true, Ordering::Release);
    })?;

    info!(
        "Server started on {}, accepting up to {} clients",
        server.local_addr()?,
        args.max_clients
    );

    server.run();
    Ok(())
}

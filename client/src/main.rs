use std::{
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context};
use clap::Parser;
use crossbeam_channel::{bounded, select, Receiver};
use log::warn;

pub mod cli;
pub mod console;

use cli::{Args, Mode};
use shared::{
    mailbox, ChannelSink, ChatSink, ChatTransport, MailboxNames, PeerId, ShmPeer, TcpPeer,
    TransportError,
};

const QUIT: &str = "/quit";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let (sink, events) = ChannelSink::new();
    let display = console::spawn_display(events);
    let sink: Arc<dyn ChatSink> = Arc::new(sink);

    let timeout = args.mode.connect_timeout();
    let result = match args.mode {
        Mode::Local {
            id,
            name,
            shm_prefix,
        } => run_local(id, &name, shm_prefix.as_deref(), sink),
        Mode::Network {
            host, name, port, ..
        } => run_network(&host, port, &name, timeout, sink),
    };

    // All sinks are gone now, so the display drains and stops.
    let _ = display.join();
    result
}

fn run_local(
    id: u8,
    name: &str,
    shm_prefix: Option<&str>,
    sink: Arc<dyn ChatSink>,
) -> anyhow::Result<()> {
    let peer_id =
        PeerId::try_from(id).map_err(|id| anyhow!("client id must be 1 or 2, got {id}"))?;
    let names = shm_prefix.map_or_else(MailboxNames::default, MailboxNames::with_prefix);

    if let Err(e) = mailbox::remove_stale(&names) {
        warn!("Startup cleanup failed: {e}");
    }

    let mut peer = ShmPeer::open(&names, peer_id, name, sink)
        .with_context(|| format!("joining local chat as client {peer_id}"))?;
    let stop = install_interrupt(Some(peer.shutdown_signal()))?;

    chat_loop(&peer, &stop);
    peer.close();
    drop(peer);

    if let Err(e) = mailbox::remove_if_idle(&names) {
        warn!("Exit cleanup failed: {e}");
    }
    Ok(())
}

fn run_network(
    host: &str,
    port: u16,
    name: &str,
    timeout: Option<std::time::Duration>,
    sink: Arc<dyn ChatSink>,
) -> anyhow::Result<()> {
    let mut peer = TcpPeer::connect(host, port, name, sink, timeout)
        .context("connection failed, make sure the server is running")?;
    let stop = install_interrupt(None)?;

    chat_loop(&peer, &stop);
    peer.disconnect();
    Ok(())
}

fn chat_loop(peer: &impl ChatTransport, stop: &Receiver<()>) {
    let input = console::spawn_input();
    loop {
        select! {
            recv(input) -> line => {
                let Ok(line) = line else { break };
                if line.trim() == QUIT {
                    break;
                }
                match peer.send(&line) {
                    Ok(()) => {}
                    Err(TransportError::Cancelled) => break,
                    Err(e) => warn!("Send failed: {e}"),
                }
            }
            recv(stop) -> _ => break,
        }
    }
}

/// First Ctrl-C leaves the chat cleanly, the second one kills the process.
fn install_interrupt(cancel: Option<Arc<AtomicBool>>) -> anyhow::Result<Receiver<()>> {
    let (stop, stopped) = bounded(1);
    let pressed = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if pressed.swap(true, Ordering::Relaxed) {
            eprintln!("Killing");
            exit(1);
        }
        eprintln!("CTRL-C received, leaving (press again to kill)");
        if let Some(cancel) = &cancel {
            cancel.store(true, Ordering::Release);
        }
        let _ = stop.try_send(());
    })?;
    Ok(stopped)
}

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};

use crate::{
    frame::{truncated, ChatFrame, SenderName},
    mailbox::{Mailbox, MailboxBackend, MailboxNames, PeerId, PosixBackend},
    sink::ChatSink,
    ChatTransport, TransportError, LOCAL_SENDER,
};

/// One end of a shared-memory chat session.
pub struct ShmPeer<B: MailboxBackend + 'static = PosixBackend> {
    mailbox: Arc<Mailbox<B>>,
    peer: PeerId,
    name: SenderName,
    sink: Arc<dyn ChatSink>,
    shutdown: Arc<AtomicBool>,
    receive_thread: Option<JoinHandle<()>>,
    claimed: bool,
}

impl ShmPeer<PosixBackend> {
    /// Opens (or creates) the host-wide mailbox and joins it as `peer`.
    pub fn open(
        names: &MailboxNames,
        peer: PeerId,
        name: &str,
        sink: Arc<dyn ChatSink>,
    ) -> Result<Self, TransportError> {
        let mailbox = Arc::new(Mailbox::open_and_claim(names, peer)?);
        Self::start(mailbox, peer, name, sink)
    }
}

impl<B: MailboxBackend + 'static> ShmPeer<B> {
    pub fn connect(
        mailbox: Arc<Mailbox<B>>,
        peer: PeerId,
        name: &str,
        sink: Arc<dyn ChatSink>,
    ) -> Result<Self, TransportError> {
        mailbox.claim(peer)?;
        Self::start(mailbox, peer, name, sink)
    }

    /// Runs the session on a mailbox where `peer` is already claimed.
    fn start(
        mailbox: Arc<Mailbox<B>>,
        peer: PeerId,
        name: &str,
        sink: Arc<dyn ChatSink>,
    ) -> Result<Self, TransportError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let receive_thread = {
            let mailbox = mailbox.clone();
            let shutdown = shutdown.clone();
            let sink = sink.clone();
            thread::Builder::new()
                .name(format!("shm-recv-{peer}"))
                .spawn(move || receive_loop(&mailbox, peer, &*sink, &shutdown))
        };
        let receive_thread = match receive_thread {
            Ok(handle) => handle,
            Err(e) => {
                mailbox.release(peer);
                return Err(TransportError::segment("spawn receive thread", e));
            }
        };

        info!("Joined local chat as client {peer}");
        sink.set_status(&format!("Connected as client {peer}"), true);

        Ok(Self {
            mailbox,
            peer,
            name: truncated(name),
            sink,
            shutdown,
            receive_thread: Some(receive_thread),
            claimed: true,
        })
    }

    /// Flag that aborts a `send` parked on a full slot, and stops the
    /// receive loop.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Writes `text` to the outbound slot, blocking while the previous
    /// message is still unread, then echoes it locally.
    pub fn send(&self, text: &str) -> Result<(), TransportError> {
        if text.is_empty() {
            return Ok(());
        }
        let frame = ChatFrame::new(&self.name, text);
        self.mailbox
            .write_slot(self.peer.outbound(), &frame, &self.shutdown)?;
        self.sink.deliver(LOCAL_SENDER, frame.text());
        Ok(())
    }

    /// Stops and joins the receive loop, then gives up the peer's flag.
    /// The shared names are left in place.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(t) = self.receive_thread.take() {
            if t.join().is_err() {
                warn!("Receive thread for client {} panicked", self.peer);
            }
        }
        if std::mem::take(&mut self.claimed) {
            self.mailbox.release(self.peer);
            info!("Left local chat as client {}", self.peer);
        }
    }
}

fn receive_loop<B: MailboxBackend>(
    mailbox: &Mailbox<B>,
    peer: PeerId,
    sink: &dyn ChatSink,
    shutdown: &AtomicBool,
) {
    loop {
        match mailbox.read_slot(peer.inbound(), shutdown) {
            Ok(frame) => sink.deliver(frame.sender(), frame.text()),
            Err(TransportError::Cancelled) => break,
            Err(e) => {
                warn!("Receive failed for client {peer}: {e}");
                sink.set_status("Disconnected", false);
                break;
            }
        }
    }
    debug!("Receive loop for client {peer} stopped");
}

impl<B: MailboxBackend + 'static> ChatTransport for ShmPeer<B> {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        ShmPeer::send(self, text)
    }

    fn close(&mut self) {
        ShmPeer::close(self)
    }
}

impl<B: MailboxBackend + 'static> Drop for ShmPeer<B> {
    fn drop(&mut self) {
        self.close()
    }
}

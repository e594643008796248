use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    frame::{truncated, ChatFrame, LineAssembler, SenderName},
    sink::ChatSink,
    ChatTransport, ConnectFailure, TransportError, LOCAL_SENDER, MAX_LINE_LEN, READ_CHUNK,
};

/// Client side of the TCP relay.
pub struct TcpPeer {
    name: SenderName,
    stream: Mutex<TcpStream>,
    sink: Arc<dyn ChatSink>,
    running: Arc<AtomicBool>,
    receive_thread: Option<JoinHandle<()>>,
}

impl TcpPeer {
    /// Connects to `host:port`. With a `timeout`, each resolved address
    /// gets that long to accept the connection.
    pub fn connect(
        host: &str,
        port: u16,
        name: &str,
        sink: Arc<dyn ChatSink>,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let addr = format!("{host}:{port}");
        let stream = open_stream(host, port, timeout).map_err(|e| {
            warn!("Connecting to {addr} failed: {e}");
            e
        })?;

        let reader = stream
            .try_clone()
            .map_err(|e| TransportError::connection(addr.clone(), e))?;
        let running = Arc::new(AtomicBool::new(true));
        let receive_thread = {
            let running = running.clone();
            let sink = sink.clone();
            thread::Builder::new()
                .name("tcp-recv".into())
                .spawn(move || receive_loop(reader, &*sink, &running))
                .map_err(|e| TransportError::connection(addr.clone(), e))?
        };

        info!("Connected to {addr}");
        sink.set_status(&format!("Connected to {addr}"), true);

        Ok(Self {
            name: truncated(name),
            stream: Mutex::new(stream),
            sink,
            running,
            receive_thread: Some(receive_thread),
        })
    }

    /// Sends `"<name>: <text>\n"` and echoes the text locally.
    pub fn send(&self, text: &str) -> Result<(), TransportError> {
        if text.is_empty() {
            return Ok(());
        }
        let frame = ChatFrame::new(&self.name, text);
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = stream.write_all(frame.to_line().as_bytes()) {
            warn!("Send failed: {e}");
            self.sink.set_status("Disconnected", false);
            return Err(TransportError::Disconnected);
        }
        drop(stream);
        self.sink.deliver(LOCAL_SENDER, frame.text());
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shuts the socket down in both directions and joins the receive loop.
    pub fn disconnect(&mut self) {
        self.running.store(false, Ordering::Release);
        {
            let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(t) = self.receive_thread.take() {
            if t.join().is_err() {
                warn!("TCP receive thread panicked");
            }
            info!("Disconnected");
        }
    }
}

fn open_stream(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream, TransportError> {
    let addr = format!("{host}:{port}");
    let resolve_failed = |source| TransportError::Connection {
        addr: addr.clone(),
        kind: ConnectFailure::Resolve,
        source,
    };

    let candidates: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(resolve_failed)?
        .collect();
    if candidates.is_empty() {
        return Err(resolve_failed(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses found",
        )));
    }

    let mut last_err = None;
    for candidate in candidates {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&candidate, timeout),
            None => TcpStream::connect(candidate),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {candidate} failed: {e}");
                last_err = Some(e);
            }
        }
    }
    let err = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected));
    Err(TransportError::connection(addr, err))
}

fn receive_loop(mut stream: TcpStream, sink: &dyn ChatSink, running: &AtomicBool) {
    let mut lines = LineAssembler::new(MAX_LINE_LEN);
    let mut buffer = [0u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Read failed: {e}");
                break;
            }
        };
        for line in lines.feed(&buffer[..n]) {
            deliver_line(&line, sink);
        }
    }

    // Only a remote close is news to the UI; a local disconnect cleared
    // the flag already.
    if running.swap(false, Ordering::AcqRel) {
        info!("Server closed the connection");
        sink.set_status("Disconnected", false);
    }
}

fn deliver_line(line: &[u8], sink: &dyn ChatSink) {
    let line = String::from_utf8_lossy(line);
    if line.is_empty() {
        return;
    }
    match ChatFrame::parse_line(&line) {
        Ok(frame) if frame.text().is_empty() => {}
        Ok(frame) => sink.deliver(frame.sender(), frame.text()),
        Err(e) => debug!("Dropping {e}"),
    }
}

impl ChatTransport for TcpPeer {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        TcpPeer::send(self, text)
    }

    fn close(&mut self) {
        self.disconnect()
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.disconnect()
    }
}

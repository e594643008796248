use std::{
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, Scope},
    time::Duration,
};

use log::{error, info, warn};

use crate::{handler::serve_connection, registry::BroadcastRegistry};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// Upper bound on one relayed write. A client that stalls past it is
/// dropped from the registry.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts clients and relays each line to every other client.
pub struct RelayServer {
    listener: TcpListener,
    registry: BroadcastRegistry<TcpStream>,
    shutdown: Arc<AtomicBool>,
}

impl RelayServer {
    pub fn bind(addr: impl ToSocketAddrs, max_clients: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            registry: BroadcastRegistry::new(max_clients),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &BroadcastRegistry<TcpStream> {
        &self.registry
    }

    /// Setting this flag makes `run` stop accepting, disconnect everyone
    /// and return once all handlers are done.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn run(&self) {
        thread::scope(|s| {
            while !self.shutdown.load(Ordering::Acquire) {
                match self.listener.accept() {
                    Ok((stream, addr)) => self.admit(s, stream, addr),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL)
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                }
            }

            info!("Shutting down, closing {} clients", self.registry.len());
            self.registry.disconnect_all();
        });
        info!("All clients disconnected");
    }

    fn admit<'scope, 'env>(
        &'env self,
        s: &'scope Scope<'scope, 'env>,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        let writer = match prepare(&stream) {
            Ok(writer) => writer,
            Err(e) => {
                error!("Setting up connection from {addr} failed: {e}");
                return;
            }
        };

        // Registered before the handler exists, so nothing is relayed to a
        // socket without a slot.
        let registration = match self.registry.register(writer) {
            Ok(registration) => registration,
            Err(e) => {
                warn!("Refusing {addr}: {e}");
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        };
        info!(
            "Client {} connected from {addr} (slot {}, {}/{} online)",
            registration.id,
            registration.slot,
            self.registry.len(),
            self.registry.capacity()
        );

        let spawned = thread::Builder::new()
            .name(format!("client-{}", registration.id))
            .spawn_scoped(s, move || {
                serve_connection(&stream, registration.id, &self.registry);
                let _ = stream.shutdown(Shutdown::Both);
            });
        if let Err(e) = spawned {
            error!("Spawning handler for {addr} failed: {e}");
            self.registry.unregister(registration.id);
        }
    }
}

fn prepare(stream: &TcpStream) -> io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    let writer = stream.try_clone()?;
    writer.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Write},
        time::Instant,
    };

    use shared::{sink::next_message, ChannelSink, TcpPeer};

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn start(max_clients: usize) -> (Arc<RelayServer>, thread::JoinHandle<()>) {
        let server = Arc::new(RelayServer::bind("127.0.0.1:0", max_clients).unwrap());
        let runner = {
            let server = server.clone();
            thread::spawn(move || server.run())
        };
        (server, runner)
    }

    fn stop(server: &RelayServer, runner: thread::JoinHandle<()>) {
        server.shutdown_handle().store(true, Ordering::Release);
        runner.join().unwrap();
    }

    #[test]
    fn peers_exchange_messages_through_relay() {
        let (server, runner) = start(10);
        let port = server.local_addr().unwrap().port();

        let (alice_sink, alice_events) = ChannelSink::new();
        let (bob_sink, bob_events) = ChannelSink::new();
        let alice = TcpPeer::connect("127.0.0.1", port, "Alice", Arc::new(alice_sink), Some(WAIT))
            .unwrap();
        let bob =
            TcpPeer::connect("127.0.0.1", port, "Bob", Arc::new(bob_sink), Some(WAIT)).unwrap();
        wait_for(|| server.registry().len() == 2);

        alice.send("hello").unwrap();
        assert_eq!(
            next_message(&bob_events, WAIT).unwrap(),
            ("Alice".to_owned(), "hello".to_owned())
        );
        // Alice only sees her own echo, never the relayed copy.
        assert_eq!(next_message(&alice_events, WAIT).unwrap().0, "Me");
        assert!(next_message(&alice_events, Duration::from_millis(200)).is_err());

        bob.send("hi").unwrap();
        assert_eq!(
            next_message(&alice_events, WAIT).unwrap(),
            ("Bob".to_owned(), "hi".to_owned())
        );

        drop(alice);
        drop(bob);
        stop(&server, runner);
    }

    #[test]
    fn disconnect_frees_slot() {
        let (server, runner) = start(10);
        let addr = server.local_addr().unwrap();

        let first = TcpStream::connect(addr).unwrap();
        let second = TcpStream::connect(addr).unwrap();
        wait_for(|| server.registry().len() == 2);

        drop(first);
        wait_for(|| server.registry().len() == 1);

        let mut third = TcpStream::connect(addr).unwrap();
        wait_for(|| server.registry().len() == 2);
        third.write_all(b"Carol: hey\n").unwrap();

        let mut line = String::new();
        BufReader::new(&second).read_line(&mut line).unwrap();
        assert_eq!(line, "Carol: hey\n");

        stop(&server, runner);
    }

    #[test]
    fn connections_over_capacity_are_closed() {
        let (server, runner) = start(2);
        let addr = server.local_addr().unwrap();

        let a = TcpStream::connect(addr).unwrap();
        let mut b = TcpStream::connect(addr).unwrap();
        wait_for(|| server.registry().len() == 2);

        let extra = TcpStream::connect(addr).unwrap();
        let mut line = String::new();
        let n = BufReader::new(&extra).read_line(&mut line).unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.registry().len(), 2);

        b.write_all(b"Bob: still works\n").unwrap();
        let mut line = String::new();
        BufReader::new(&a).read_line(&mut line).unwrap();
        assert_eq!(line, "Bob: still works\n");

        stop(&server, runner);
    }

    #[test]
    fn shutdown_disconnects_clients_and_joins_handlers() {
        let (server, runner) = start(4);
        let addr = server.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        wait_for(|| server.registry().len() == 1);

        stop(&server, runner);

        assert!(server.registry().is_empty());
        let mut line = String::new();
        assert_eq!(BufReader::new(&client).read_line(&mut line).unwrap_or(0), 0);
    }
}

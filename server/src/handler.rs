use std::io::{self, Read, Write};

use log::{debug, info, trace};

use shared::{LineAssembler, MAX_LINE_LEN, READ_CHUNK};

use crate::registry::{BroadcastRegistry, ConnId, Disconnect};

/// Relays every line read from `conn` to all other registered clients until
/// the client goes away, then gives up its registry slot.
///
/// End of stream and read errors both count as a normal disconnect.
pub fn serve_connection<R: Read, W: Write + Disconnect>(
    mut conn: R,
    id: ConnId,
    registry: &BroadcastRegistry<W>,
) {
    let mut lines = LineAssembler::new(MAX_LINE_LEN);
    let mut buffer = [0u8; READ_CHUNK];

    loop {
        let n = match conn.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Client {id} read failed: {e}");
                break;
            }
        };
        for line in lines.feed(&buffer[..n]) {
            if line.is_empty() {
                continue;
            }
            trace!("Client {id}: {}", String::from_utf8_lossy(&line));
            registry.broadcast(&line, Some(id));
        }
    }

    registry.unregister(id);
    info!("Client {id} disconnected");
}

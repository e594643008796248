use std::{io, time::Duration};

pub mod error;
pub mod frame;
pub mod mailbox;
pub mod shm;
pub mod shm_peer;
pub mod sink;
pub mod sync;
pub mod tcp_peer;

pub use error::{ConnectFailure, TransportError};
pub use frame::{ChatFrame, LineAssembler};
pub use mailbox::{Direction, Mailbox, MailboxNames, PeerId};
pub use shm_peer::ShmPeer;
pub use sink::{ChannelSink, ChatSink, SinkEvent};
pub use tcp_peer::TcpPeer;

pub const MAGIC_VALUE: u32 = 0x63686174;
pub const SHM_NAME: &str = "/chat_shm";
pub const SEM_C1_TO_C2_DATA: &str = "/sem_c1_to_c2_data";
pub const SEM_C1_TO_C2_SPACE: &str = "/sem_c1_to_c2_space";
pub const SEM_C2_TO_C1_DATA: &str = "/sem_c2_to_c1_data";
pub const SEM_C2_TO_C1_SPACE: &str = "/sem_c2_to_c1_space";

pub const TCP_PORT: u16 = 8080;
pub const MAX_CLIENTS: usize = 10;

pub const MAX_SENDER_LEN: usize = 31;
pub const MAX_TEXT_LEN: usize = 255;

/// Longest line accepted off a socket. Anything longer is dropped up to
/// the next newline.
pub const MAX_LINE_LEN: usize = 2048;
pub const READ_CHUNK: usize = 2048;

/// How long a parked semaphore wait may take to notice a shutdown request.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sender name used when echoing our own messages back to the UI.
pub const LOCAL_SENDER: &str = "Me";

/// Outbound half of the UI contract, implemented by every peer kind.
pub trait ChatTransport {
    fn send(&self, text: &str) -> Result<(), TransportError>;
    fn close(&mut self);
}

pub trait CheckOk<R> {
    fn r(self, op: &str) -> Result<R, TransportError>;
}

impl<T> CheckOk<T> for io::Result<T> {
    fn r(self, op: &str) -> Result<T, TransportError> {
        self.map_err(|e| TransportError::segment(op, e))
    }
}

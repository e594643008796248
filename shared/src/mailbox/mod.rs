//! The two-slot mailbox shared by exactly two chat peers.
//!
//! Each direction is a one-frame channel guarded by a `data`/`space`
//! semaphore pair: the writer takes `space`, fills the slot and posts
//! `data`; the reader takes `data`, copies the slot out and posts `space`.
//! Once the mailbox is published, the occupant flags change by
//! compare-and-set only.

use std::{
    cell::UnsafeCell,
    fmt, io,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use log::warn;

use crate::{
    frame::ChatFrame,
    shm::ShmSafe,
    sync::CountingSemaphore,
    CheckOk, TransportError, POLL_INTERVAL,
};

mod local;
mod posix;

pub use local::LocalBackend;
pub use posix::{remove_if_idle, remove_stale, unlink_all, MailboxNames, PosixBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerId {
    One,
    Two,
}

impl PeerId {
    pub fn outbound(self) -> Direction {
        match self {
            PeerId::One => Direction::OneToTwo,
            PeerId::Two => Direction::TwoToOne,
        }
    }

    pub fn inbound(self) -> Direction {
        self.other().outbound()
    }

    pub fn other(self) -> PeerId {
        match self {
            PeerId::One => PeerId::Two,
            PeerId::Two => PeerId::One,
        }
    }
}

impl TryFrom<u8> for PeerId {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(PeerId::One),
            2 => Ok(PeerId::Two),
            other => Err(other),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::One => f.write_str("1"),
            PeerId::Two => f.write_str("2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    OneToTwo,
    TwoToOne,
}

/// What lives in the shared segment. Flags hold the owning process id,
/// 0 meaning free.
#[repr(C)]
pub struct MailboxLayout {
    client1_active: AtomicU32,
    client2_active: AtomicU32,
    c1_to_c2: UnsafeCell<ChatFrame>,
    c2_to_c1: UnsafeCell<ChatFrame>,
}

impl MailboxLayout {
    pub fn new() -> Self {
        Self {
            client1_active: AtomicU32::new(0),
            client2_active: AtomicU32::new(0),
            c1_to_c2: UnsafeCell::new(ChatFrame::default()),
            c2_to_c1: UnsafeCell::new(ChatFrame::default()),
        }
    }

    fn active(&self, peer: PeerId) -> &AtomicU32 {
        match peer {
            PeerId::One => &self.client1_active,
            PeerId::Two => &self.client2_active,
        }
    }

    fn slot(&self, direction: Direction) -> *mut ChatFrame {
        match direction {
            Direction::OneToTwo => self.c1_to_c2.get(),
            Direction::TwoToOne => self.c2_to_c1.get(),
        }
    }

    /// Process id currently holding `peer`, if any.
    pub fn owner(&self, peer: PeerId) -> Option<u32> {
        match self.active(peer).load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

impl Default for MailboxLayout {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl ShmSafe for MailboxLayout {}
// Slots are only touched between a successful semaphore acquire and the
// matching post.
unsafe impl Sync for MailboxLayout {}

#[derive(Debug)]
pub struct SlotSemaphores<S> {
    pub data: S,
    pub space: S,
}

#[derive(Debug)]
pub struct SemaphoreQuad<S> {
    pub c1_to_c2: SlotSemaphores<S>,
    pub c2_to_c1: SlotSemaphores<S>,
}

impl<S> SemaphoreQuad<S> {
    pub fn channel(&self, direction: Direction) -> &SlotSemaphores<S> {
        match direction {
            Direction::OneToTwo => &self.c1_to_c2,
            Direction::TwoToOne => &self.c2_to_c1,
        }
    }
}

/// Storage and synchronization behind a [`Mailbox`].
pub trait MailboxBackend: Send + Sync {
    type Semaphore: CountingSemaphore;

    fn layout(&self) -> &MailboxLayout;
    fn semaphores(&self) -> &SemaphoreQuad<Self::Semaphore>;
}

pub struct Mailbox<B = PosixBackend> {
    backend: B,
    owner: u32,
}

impl Mailbox<PosixBackend> {
    /// Opens the cross-process mailbox named by `names`, creating it on
    /// first use.
    pub fn open_or_create(names: &MailboxNames) -> Result<Self, TransportError> {
        Ok(Self::new(PosixBackend::open(names)?))
    }

    /// Opens the mailbox and claims `peer`. A mailbox created here becomes
    /// visible to other processes with the claim already in place.
    pub fn open_and_claim(names: &MailboxNames, peer: PeerId) -> Result<Self, TransportError> {
        let (backend, claimed) = PosixBackend::open_as(names, Some(peer))?;
        let mailbox = Self::new(backend);
        if !claimed {
            mailbox.claim(peer)?;
        }
        Ok(mailbox)
    }
}

impl Mailbox<LocalBackend> {
    pub fn in_process() -> Self {
        Self::new(LocalBackend::new())
    }
}

impl<B: MailboxBackend> Mailbox<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            owner: std::process::id(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Marks `peer` as taken by this process.
    pub fn claim(&self, peer: PeerId) -> Result<(), TransportError> {
        let flag = self.backend.layout().active(peer);
        match flag.compare_exchange(0, self.owner, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(current) if current != self.owner && !process_alive(current) => {
                // A crashed session never released its flag.
                flag.compare_exchange(current, self.owner, Ordering::AcqRel, Ordering::Acquire)
                    .map_err(|_| TransportError::SlotConflict(peer))?;
                warn!("client {peer} reclaimed from dead process {current}");
                Ok(())
            }
            Err(_) => Err(TransportError::SlotConflict(peer)),
        }
    }

    /// Clears `peer` if this process holds it. Returns whether it did.
    pub fn release(&self, peer: PeerId) -> bool {
        self.backend
            .layout()
            .active(peer)
            .compare_exchange(self.owner, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_active(&self, peer: PeerId) -> bool {
        self.backend.layout().owner(peer).is_some()
    }

    /// Places `frame` in the slot for `direction`, waiting while the
    /// previous frame there is still unread.
    pub fn write_slot(
        &self,
        direction: Direction,
        frame: &ChatFrame,
        cancel: &AtomicBool,
    ) -> Result<(), TransportError> {
        let channel = self.backend.semaphores().channel(direction);
        acquire(&channel.space, cancel, "wait for slot space")?;

        unsafe { self.backend.layout().slot(direction).write(*frame) };

        channel.data.post().r("post slot data")
    }

    /// Takes the next frame from the slot for `direction`, waiting until
    /// one is written.
    pub fn read_slot(
        &self,
        direction: Direction,
        cancel: &AtomicBool,
    ) -> Result<ChatFrame, TransportError> {
        let channel = self.backend.semaphores().channel(direction);
        acquire(&channel.data, cancel, "wait for slot data")?;

        let frame = unsafe { self.backend.layout().slot(direction).read() };

        channel.space.post().r("post slot space")?;
        Ok(frame)
    }

    /// Number of unread frames sitting in the slot for `direction`.
    pub fn pending(&self, direction: Direction) -> Result<u32, TransportError> {
        self.backend
            .semaphores()
            .channel(direction)
            .data
            .value()
            .r("read slot data count")
    }
}

fn acquire<S: CountingSemaphore>(
    sem: &S,
    cancel: &AtomicBool,
    op: &str,
) -> Result<(), TransportError> {
    loop {
        if cancel.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }
        if sem.wait_timeout(POLL_INTERVAL).r(op)? {
            return Ok(());
        }
    }
}

pub(crate) fn process_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    /// Above any kernel pid limit, so never a running process.
    pub(super) const DEAD_PID: u32 = 0x3fff_fff0;

    #[test]
    fn concurrent_claims_admit_exactly_one() {
        for _ in 0..50 {
            let mailbox = Arc::new(Mailbox::in_process());
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let mailbox = mailbox.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        mailbox.claim(PeerId::One)
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(TransportError::SlotConflict(PeerId::One)))));
        }
    }

    #[test]
    fn claim_leaves_other_peer_untouched() {
        let mailbox = Mailbox::in_process();
        mailbox.claim(PeerId::Two).unwrap();
        assert!(mailbox.claim(PeerId::Two).is_err());
        assert!(!mailbox.is_active(PeerId::One));
        mailbox.claim(PeerId::One).unwrap();
        assert!(mailbox.is_active(PeerId::Two));
    }

    #[test]
    fn claim_takes_over_flag_of_dead_process() {
        let mailbox = Mailbox::in_process();
        let flag = mailbox.backend().layout().active(PeerId::One);
        flag.store(DEAD_PID, Ordering::Release);
        assert!(mailbox.is_active(PeerId::One));

        mailbox.claim(PeerId::One).unwrap();

        assert_eq!(
            mailbox.backend().layout().owner(PeerId::One),
            Some(std::process::id())
        );
        assert!(mailbox.release(PeerId::One));
    }

    #[test]
    fn claim_leaves_flag_of_live_process() {
        let mailbox = Mailbox::in_process();
        // pid 1 always runs.
        mailbox
            .backend()
            .layout()
            .active(PeerId::Two)
            .store(1, Ordering::Release);

        assert!(matches!(
            mailbox.claim(PeerId::Two),
            Err(TransportError::SlotConflict(PeerId::Two))
        ));
        assert_eq!(mailbox.backend().layout().owner(PeerId::Two), Some(1));
        assert!(!mailbox.release(PeerId::Two));
    }

    #[test]
    fn release_is_idempotent() {
        let mailbox = Mailbox::in_process();
        mailbox.claim(PeerId::One).unwrap();
        assert!(mailbox.release(PeerId::One));
        assert!(!mailbox.release(PeerId::One));
        mailbox.claim(PeerId::One).unwrap();
    }

    #[test]
    fn frame_round_trips_through_slot() {
        let mailbox = Mailbox::in_process();
        let cancel = AtomicBool::new(false);
        let sent = ChatFrame::new("Alice", "hello");

        mailbox
            .write_slot(Direction::OneToTwo, &sent, &cancel)
            .unwrap();
        let received = mailbox.read_slot(Direction::OneToTwo, &cancel).unwrap();

        assert_eq!(received, sent);
        assert_eq!(received.sender(), "Alice");
        assert_eq!(received.text(), "hello");
    }

    #[test]
    fn oversized_fields_arrive_truncated() {
        let mailbox = Mailbox::in_process();
        let cancel = AtomicBool::new(false);
        let frame = ChatFrame::new(&"n".repeat(64), &"m".repeat(1000));

        mailbox
            .write_slot(Direction::TwoToOne, &frame, &cancel)
            .unwrap();
        let received = mailbox.read_slot(Direction::TwoToOne, &cancel).unwrap();

        assert_eq!(received.sender(), "n".repeat(31));
        assert_eq!(received.text(), "m".repeat(255));
    }

    #[test]
    fn second_write_waits_for_read() {
        let mailbox = Arc::new(Mailbox::in_process());
        let cancel = AtomicBool::new(false);
        mailbox
            .write_slot(Direction::OneToTwo, &ChatFrame::new("a", "first"), &cancel)
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let mailbox = mailbox.clone();
            let done = done.clone();
            thread::spawn(move || {
                let cancel = AtomicBool::new(false);
                mailbox
                    .write_slot(Direction::OneToTwo, &ChatFrame::new("a", "second"), &cancel)
                    .unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(250));
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(mailbox.pending(Direction::OneToTwo).unwrap(), 1);

        let first = mailbox.read_slot(Direction::OneToTwo, &cancel).unwrap();
        assert_eq!(first.text(), "first");

        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        let second = mailbox.read_slot(Direction::OneToTwo, &cancel).unwrap();
        assert_eq!(second.text(), "second");
    }

    #[test]
    fn directions_are_independent() {
        let mailbox = Mailbox::in_process();
        let cancel = AtomicBool::new(false);
        mailbox
            .write_slot(Direction::OneToTwo, &ChatFrame::new("a", "to two"), &cancel)
            .unwrap();
        mailbox
            .write_slot(Direction::TwoToOne, &ChatFrame::new("b", "to one"), &cancel)
            .unwrap();

        assert_eq!(
            mailbox.read_slot(Direction::TwoToOne, &cancel).unwrap().text(),
            "to one"
        );
        assert_eq!(
            mailbox.read_slot(Direction::OneToTwo, &cancel).unwrap().text(),
            "to two"
        );
    }

    #[test]
    fn cancel_wakes_parked_reader() {
        let mailbox = Arc::new(Mailbox::in_process());
        let cancel = Arc::new(AtomicBool::new(false));

        let reader = {
            let mailbox = mailbox.clone();
            let cancel = cancel.clone();
            thread::spawn(move || mailbox.read_slot(Direction::TwoToOne, &cancel))
        };

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        cancel.store(true, Ordering::Release);
        let result = reader.join().unwrap();

        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert!(start.elapsed() < POLL_INTERVAL * 5);
    }

    #[test]
    fn peer_directions_mirror() {
        assert_eq!(PeerId::One.outbound(), Direction::OneToTwo);
        assert_eq!(PeerId::One.inbound(), Direction::TwoToOne);
        assert_eq!(PeerId::Two.outbound(), PeerId::One.inbound());
        assert_eq!(PeerId::try_from(2u8), Ok(PeerId::Two));
        assert_eq!(PeerId::try_from(3u8), Err(3));
    }
}

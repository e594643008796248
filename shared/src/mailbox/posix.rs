use std::sync::atomic::Ordering;

use log::{debug, info, warn};

use crate::{
    shm::{self, SharedMemory},
    sync::NamedSemaphore,
    TransportError, SEM_C1_TO_C2_DATA, SEM_C1_TO_C2_SPACE, SEM_C2_TO_C1_DATA,
    SEM_C2_TO_C1_SPACE, SHM_NAME,
};

use super::{process_alive, MailboxBackend, MailboxLayout, PeerId, SemaphoreQuad, SlotSemaphores};

/// The well-known names two peers agree on: one segment, four semaphores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxNames {
    pub segment: String,
    pub c1_to_c2_data: String,
    pub c1_to_c2_space: String,
    pub c2_to_c1_data: String,
    pub c2_to_c1_space: String,
}

impl Default for MailboxNames {
    fn default() -> Self {
        Self {
            segment: SHM_NAME.into(),
            c1_to_c2_data: SEM_C1_TO_C2_DATA.into(),
            c1_to_c2_space: SEM_C1_TO_C2_SPACE.into(),
            c2_to_c1_data: SEM_C2_TO_C1_DATA.into(),
            c2_to_c1_space: SEM_C2_TO_C1_SPACE.into(),
        }
    }
}

impl MailboxNames {
    /// A separate set of names, so several mailboxes can coexist on a host.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            segment: format!("/{prefix}_shm"),
            c1_to_c2_data: format!("/{prefix}_c1_to_c2_data"),
            c1_to_c2_space: format!("/{prefix}_c1_to_c2_space"),
            c2_to_c1_data: format!("/{prefix}_c2_to_c1_data"),
            c2_to_c1_space: format!("/{prefix}_c2_to_c1_space"),
        }
    }

    pub fn semaphores(&self) -> [&str; 4] {
        [
            &self.c1_to_c2_data,
            &self.c1_to_c2_space,
            &self.c2_to_c1_data,
            &self.c2_to_c1_space,
        ]
    }
}

/// POSIX shared memory segment plus four named semaphores.
pub struct PosixBackend {
    segment: SharedMemory<MailboxLayout>,
    semaphores: SemaphoreQuad<NamedSemaphore>,
}

impl PosixBackend {
    pub fn open(names: &MailboxNames) -> Result<Self, TransportError> {
        Self::open_as(names, None).map(|(backend, _)| backend)
    }

    /// Like [`open`](Self::open), but a segment created by this call is
    /// published with `peer` already held by this process. Returns whether
    /// that happened.
    pub(super) fn open_as(
        names: &MailboxNames,
        peer: Option<PeerId>,
    ) -> Result<(Self, bool), TransportError> {
        let (segment, created) = SharedMemory::open_or_create(&names.segment, |mem| {
            // Counts left over from an earlier session would replay old
            // frames into the fresh slots.
            for name in names.semaphores() {
                NamedSemaphore::unlink(name)?;
            }
            let layout = mem.write(MailboxLayout::new());
            if let Some(peer) = peer {
                layout
                    .active(peer)
                    .store(std::process::id(), Ordering::Relaxed);
            }
            Ok(())
        })
        .map_err(|e| TransportError::segment(format!("open {}", names.segment), e))?;

        let open = |name: &str, initial| {
            NamedSemaphore::open_or_create(name, initial)
                .map_err(|e| TransportError::segment(format!("open {name}"), e))
        };
        let semaphores = SemaphoreQuad {
            c1_to_c2: SlotSemaphores {
                data: open(names.c1_to_c2_data.as_str(), 0)?,
                space: open(names.c1_to_c2_space.as_str(), 1)?,
            },
            c2_to_c1: SlotSemaphores {
                data: open(names.c2_to_c1_data.as_str(), 0)?,
                space: open(names.c2_to_c1_space.as_str(), 1)?,
            },
        };

        if created {
            info!("Created mailbox {}", names.segment);
        } else {
            debug!("Attached to mailbox {}", names.segment);
        }

        Ok((
            Self {
                segment,
                semaphores,
            },
            created && peer.is_some(),
        ))
    }
}

impl MailboxBackend for PosixBackend {
    type Semaphore = NamedSemaphore;

    fn layout(&self) -> &MailboxLayout {
        self.segment.get()
    }

    fn semaphores(&self) -> &SemaphoreQuad<NamedSemaphore> {
        &self.semaphores
    }
}

/// Removes the segment and semaphore names unconditionally.
pub fn unlink_all(names: &MailboxNames) -> Result<(), TransportError> {
    shm::unlink(&names.segment)
        .map_err(|e| TransportError::segment(format!("unlink {}", names.segment), e))?;
    for name in names.semaphores() {
        NamedSemaphore::unlink(name)
            .map_err(|e| TransportError::segment(format!("unlink {name}"), e))?;
    }
    Ok(())
}

/// Startup cleanup: removes names left behind by a crashed session.
/// Leaves everything alone and returns `false` while a live process still
/// holds one of the flags.
pub fn remove_stale(names: &MailboxNames) -> Result<bool, TransportError> {
    match SharedMemory::<MailboxLayout>::open_existing(&names.segment) {
        Ok(Some(segment)) => {
            let layout = segment.get();
            let live = [PeerId::One, PeerId::Two]
                .into_iter()
                .filter_map(|peer| layout.owner(peer))
                .find(|&pid| process_alive(pid));
            if let Some(pid) = live {
                debug!("Mailbox {} in use by process {pid}", names.segment);
                return Ok(false);
            }
            info!("Removing stale mailbox {}", names.segment);
        }
        Ok(None) => {}
        Err(e) => warn!("Mailbox {} is unusable ({e}), removing it", names.segment),
    }
    unlink_all(names)?;
    Ok(true)
}

/// Exit cleanup: removes the names once neither peer is active.
pub fn remove_if_idle(names: &MailboxNames) -> Result<bool, TransportError> {
    let segment = SharedMemory::<MailboxLayout>::open_existing(&names.segment)
        .map_err(|e| TransportError::segment(format!("open {}", names.segment), e))?;
    let Some(segment) = segment else {
        return Ok(false);
    };

    let layout = segment.get();
    if layout.owner(PeerId::One).is_some() || layout.owner(PeerId::Two).is_some() {
        return Ok(false);
    }
    drop(segment);

    unlink_all(names)?;
    info!("Removed mailbox {}", names.segment);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Arc};

    use super::*;
    use crate::{
        frame::ChatFrame,
        mailbox::{tests::DEAD_PID, Mailbox},
        Direction,
    };

    struct Names(MailboxNames);

    impl Names {
        fn unique() -> Self {
            let prefix = format!("chat_test_{}_{}", std::process::id(), rand::random::<u32>());
            Self(MailboxNames::with_prefix(&prefix))
        }
    }

    impl Drop for Names {
        fn drop(&mut self) {
            let _ = unlink_all(&self.0);
        }
    }

    #[test]
    fn two_handles_share_slots_and_flags() {
        let names = Names::unique();
        let first = Mailbox::open_or_create(&names.0).unwrap();
        let second = Mailbox::open_or_create(&names.0).unwrap();
        let cancel = AtomicBool::new(false);

        first.claim(PeerId::One).unwrap();
        assert!(matches!(
            second.claim(PeerId::One),
            Err(TransportError::SlotConflict(PeerId::One))
        ));
        second.claim(PeerId::Two).unwrap();

        first
            .write_slot(Direction::OneToTwo, &ChatFrame::new("Alice", "hello"), &cancel)
            .unwrap();
        let frame = second.read_slot(Direction::OneToTwo, &cancel).unwrap();
        assert_eq!(frame, ChatFrame::new("Alice", "hello"));

        assert!(first.release(PeerId::One));
        assert!(second.release(PeerId::Two));
    }

    #[test]
    fn reattaching_keeps_live_flags() {
        let names = Names::unique();
        let first = Mailbox::open_or_create(&names.0).unwrap();
        first.claim(PeerId::One).unwrap();

        let second = Mailbox::open_or_create(&names.0).unwrap();
        assert!(second.is_active(PeerId::One));
        assert!(!second.is_active(PeerId::Two));
    }

    #[test]
    fn stale_removal_spares_live_mailbox() {
        let names = Names::unique();
        let mailbox = Arc::new(Mailbox::open_or_create(&names.0).unwrap());
        mailbox.claim(PeerId::Two).unwrap();

        assert!(!remove_stale(&names.0).unwrap());
        assert!(!remove_if_idle(&names.0).unwrap());

        mailbox.release(PeerId::Two);
        assert!(remove_if_idle(&names.0).unwrap());
        assert!(SharedMemory::<MailboxLayout>::open_existing(&names.0.segment)
            .unwrap()
            .is_none());
    }

    #[test]
    fn stale_removal_clears_abandoned_mailbox() {
        let names = Names::unique();
        drop(Mailbox::open_or_create(&names.0).unwrap());

        assert!(remove_stale(&names.0).unwrap());
        assert!(SharedMemory::<MailboxLayout>::open_existing(&names.0.segment)
            .unwrap()
            .is_none());
    }

    #[test]
    fn stale_removal_clears_mailbox_of_dead_owner() {
        let names = Names::unique();
        let mailbox = Mailbox::open_or_create(&names.0).unwrap();
        mailbox
            .backend()
            .layout()
            .active(PeerId::One)
            .store(DEAD_PID, Ordering::Release);
        drop(mailbox);

        assert!(remove_stale(&names.0).unwrap());
        assert!(SharedMemory::<MailboxLayout>::open_existing(&names.0.segment)
            .unwrap()
            .is_none());
    }

    #[test]
    fn created_mailbox_is_published_with_claim() {
        let names = Names::unique();
        let creator = Mailbox::open_and_claim(&names.0, PeerId::Two).unwrap();

        // A second client starting up at the same time never sees it idle.
        assert!(!remove_stale(&names.0).unwrap());
        let other = Mailbox::open_or_create(&names.0).unwrap();
        assert!(other.is_active(PeerId::Two));

        let joiner = Mailbox::open_and_claim(&names.0, PeerId::One).unwrap();
        assert!(joiner.is_active(PeerId::One));
        assert!(matches!(
            Mailbox::open_and_claim(&names.0, PeerId::One),
            Err(TransportError::SlotConflict(PeerId::One))
        ));

        assert!(creator.release(PeerId::Two));
        assert!(joiner.release(PeerId::One));
        assert!(remove_if_idle(&names.0).unwrap());
    }
}

use crate::sync::LocalSemaphore;

use super::{MailboxBackend, MailboxLayout, SemaphoreQuad, SlotSemaphores};

/// Heap-backed mailbox for two peers living in the same process.
#[derive(Default)]
pub struct LocalBackend {
    layout: MailboxLayout,
    semaphores: SemaphoreQuad<LocalSemaphore>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for SemaphoreQuad<LocalSemaphore> {
    fn default() -> Self {
        let channel = || SlotSemaphores {
            data: LocalSemaphore::new(0),
            space: LocalSemaphore::new(1),
        };
        Self {
            c1_to_c2: channel(),
            c2_to_c1: channel(),
        }
    }
}

impl MailboxBackend for LocalBackend {
    type Semaphore = LocalSemaphore;

    fn layout(&self) -> &MailboxLayout {
        &self.layout
    }

    fn semaphores(&self) -> &SemaphoreQuad<LocalSemaphore> {
        &self.semaphores
    }
}

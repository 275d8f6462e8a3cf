//! Coalescing of concurrent force requests

use parking_lot::{Condvar, Mutex, MutexGuard};
use tandem_journal::Result;

#[derive(Default)]
struct ForceState {
    requested: u64,
    completed: u64,
    in_progress: bool,
}

/// Lets one caller sync on behalf of every caller that asked before the sync
/// started. A caller returns only once a sync that began after its request
/// has succeeded.
#[derive(Default)]
pub struct ForceBatcher {
    state: Mutex<ForceState>,
    done: Condvar,
}

impl ForceBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(&self, sync: impl Fn() -> Result<()>) -> Result<()> {
        let mut state = self.state.lock();
        state.requested += 1;
        let ticket = state.requested;

        loop {
            if state.completed >= ticket {
                return Ok(());
            }
            if !state.in_progress {
                return self.lead(&mut state, &sync);
            }
            self.done.wait(&mut state);
        }
    }

    fn lead(
        &self,
        state: &mut MutexGuard<'_, ForceState>,
        sync: &impl Fn() -> Result<()>,
    ) -> Result<()> {
        state.in_progress = true;
        let target = state.requested;

        let result = MutexGuard::unlocked(state, sync);

        state.in_progress = false;
        if result.is_ok() {
            state.completed = state.completed.max(target);
        }
        self.done.notify_all();
        result
    }
}

//! CPU pinning for worker threads
//!
//! Pinning is optional and best-effort: `None` means "leave the thread
//! to the scheduler" and failures are logged, never fatal. Workers that
//! accept a core id call this as the first action on their own thread.

use tracing::{error, info};

/// Pin the calling thread to the logical core `core_id`.
///
/// Returns true on success or when `core_id` is `None` (a no-op).
pub fn pin_current_thread(core_id: Option<usize>, thread_name: &str) -> bool {
    let Some(core_id) = core_id else {
        return true;
    };

    let Some(cores) = core_affinity::get_core_ids() else {
        error!(
            thread = thread_name,
            core_id, "cpu affinity unavailable on this platform"
        );
        return false;
    };

    let Some(core) = cores.into_iter().find(|c| c.id == core_id) else {
        error!(thread = thread_name, core_id, "cpu core id out of range");
        return false;
    };

    if core_affinity::set_for_current(core) {
        info!(thread = thread_name, core_id, "thread pinned to cpu core");
        true
    } else {
        error!(thread = thread_name, core_id, "failed to pin thread to cpu core");
        false
    }
}

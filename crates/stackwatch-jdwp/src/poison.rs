use std::panic::Location;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// The connection state stays usable after a panic in an unrelated caller;
/// a desynchronized stream is detected by the next exchange instead.
#[track_caller]
pub(crate) fn lock_recovering<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    let caller = Location::caller();
    mutex.lock().unwrap_or_else(|err: PoisonError<MutexGuard<'a, T>>| {
        tracing::error!(
            target: "stackwatch.jdwp",
            what,
            caller = %caller,
            "recovered poisoned lock"
        );
        err.into_inner()
    })
}

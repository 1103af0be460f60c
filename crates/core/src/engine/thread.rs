//! Dedicated background threads for engines.

use std::thread::JoinHandle;

/// Niceness applied to engine threads.
#[cfg(target_os = "linux")]
const BACKGROUND_NICENESS: libc::c_int = 5;

/// Lower the calling thread's scheduling priority below normal.
pub(crate) fn lower_current_thread_priority() {
    #[cfg(target_os = "linux")]
    {
        // On Linux `who == 0` with PRIO_PROCESS addresses the calling thread only.
        let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, BACKGROUND_NICENESS) };
        if result != 0 {
            tracing::debug!(
                error = %std::io::Error::last_os_error(),
                "Could not lower engine thread priority"
            );
        }
    }
}

/// Spawn a named thread that lowers its own priority before running `body`.
pub(crate) fn spawn_background<F>(name: String, body: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(move || {
        lower_current_thread_priority();
        body();
    })
}

/// Whether `handle` belongs to the calling thread.
pub(crate) fn is_current(handle: &JoinHandle<()>) -> bool {
    handle.thread().id() == std::thread::current().id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawned_thread_is_named() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_background("etl-test".to_string(), move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        })
        .unwrap();

        assert!(!is_current(&handle));
        handle.join().unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("etl-test"));
    }
}

/// The surface the core consumes from its host.
///
/// Richer hosts (filesystems, sockets, GPIO) implement this trait and
/// hand the extra capabilities to their own library roots; the core only
/// needs console output, an optional low-level alarm, and a heap-size
/// hint for `meminfo`.

use crate::time::Duration;

pub trait SystemInterface {
    fn print(&self, s: &str);

    /// Arm a host alarm. Hosts without one return -1 and the scheduler
    /// falls back to polling its timer list.
    fn start_timer(&self, _duration: Duration, _repeat: bool) -> i8 {
        -1
    }

    fn stop_timer(&self, _id: i8) {}

    /// Free heap estimate in bytes, or -1 when unknown.
    fn heap_free_size(&self) -> i32 {
        -1
    }
}

/// Console-backed host used by the CLI and tests.
pub struct ConsoleSystemInterface;

impl SystemInterface for ConsoleSystemInterface {
    fn print(&self, s: &str) {
        use std::io::Write;
        let mut out = std::io::stdout();
        let _ = out.write_all(s.as_bytes());
        let _ = out.flush();
    }
}

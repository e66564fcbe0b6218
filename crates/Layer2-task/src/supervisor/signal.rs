//! Process signals
//!
//! Unix delivers real signals, to the whole process group when asked. Other
//! platforms have no suspension; termination falls back to `Child::start_kill`.

use webpilot_foundation::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination (SIGTERM)
    Terminate,
    /// Forced termination (SIGKILL)
    Kill,
    /// SIGSTOP
    Suspend,
    /// SIGCONT
    Continue,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Suspend => "SIGSTOP",
            Signal::Continue => "SIGCONT",
        }
    }
}

/// Whether processes can be suspended and continued on this platform
pub fn supports_suspend() -> bool {
    cfg!(unix)
}

/// Send `signal` to `pid`, or to its process group when `group` is set
#[cfg(unix)]
pub fn send(pid: u32, signal: Signal, group: bool) -> Result<()> {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
        Signal::Suspend => libc::SIGSTOP,
        Signal::Continue => libc::SIGCONT,
    };
    let pid = i32::try_from(pid).map_err(|_| Error::InvalidInput(format!("pid {} out of range", pid)))?;
    let target = if group { -pid } else { pid };

    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(target, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
pub fn send(pid: u32, signal: Signal, _group: bool) -> Result<()> {
    Err(Error::InvalidState(format!(
        "{} is not supported on this platform (pid {})",
        signal.name(),
        pid
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_signal_missing_process() {
        // pid far above any pid_max
        assert!(send(4_000_000, Signal::Continue, false).is_err());
    }

    #[test]
    fn test_names() {
        assert_eq!(Signal::Suspend.name(), "SIGSTOP");
        assert!(supports_suspend());
    }
}

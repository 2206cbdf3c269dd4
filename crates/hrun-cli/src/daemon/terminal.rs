//! The client's local terminal: geometry and raw mode.

use std::io::{self, IsTerminal};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{debug, warn};

use crate::daemon::pty::TermSize;

/// Tracks whether raw mode is active, for the panic hook.
static RAW_MODE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Whether stdin is attached to a terminal.
pub fn stdin_is_terminal() -> bool {
    io::stdin().is_terminal()
}

/// Current geometry of the controlling terminal.
pub fn current_size() -> io::Result<TermSize> {
    let (cols, rows) = crossterm::terminal::size()?;
    Ok(TermSize { cols, rows })
}

/// Geometry to announce, falling back to 80x24 when there is no terminal.
pub fn size_or_default() -> TermSize {
    match current_size() {
        Ok(size) if size.cols > 0 && size.rows > 0 => size,
        Ok(size) => {
            debug!("Terminal reported {}, using default size", size);
            TermSize::default()
        }
        Err(e) => {
            debug!("No terminal size available ({}), using default size", e);
            TermSize::default()
        }
    }
}

/// Holds the local terminal in raw mode and restores it when dropped.
///
/// Restoration runs on every exit path: normal return, error propagation,
/// and panics (through a hook installed on first use).
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Enter raw mode. The prior terminal mode is restored on drop.
    pub fn enter() -> io::Result<Self> {
        install_panic_hook();

        enable_raw_mode()?;
        RAW_MODE_ACTIVE.store(true, Ordering::SeqCst);

        Ok(Self { active: true })
    }

    /// Restore the terminal now instead of at drop.
    pub fn restore(&mut self) -> io::Result<()> {
        if self.active {
            self.active = false;
            RAW_MODE_ACTIVE.store(false, Ordering::SeqCst);
            disable_raw_mode()?;
        }
        Ok(())
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Install a panic hook that restores terminal state before the panic
/// message is printed.
fn install_panic_hook() {
    static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        if RAW_MODE_ACTIVE.swap(false, Ordering::SeqCst) {
            let _ = disable_raw_mode();
        }
        original_hook(panic_info);
    }));
}

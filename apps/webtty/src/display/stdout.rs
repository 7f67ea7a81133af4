use super::DisplaySurface;
use crossterm::{execute, terminal};
use std::io::{self, Write};
use tracing::{debug, warn};

/// Pass-through surface for a real terminal: output bytes go straight to
/// stdout and the local terminal does the rendering.
pub struct TerminalSurface {
    out: io::Stdout,
    raw_mode: bool,
    attached: bool,
    disposed: bool,
}

impl TerminalSurface {
    /// `raw_mode` should be false when stdin is not a tty.
    pub fn new(raw_mode: bool) -> Self {
        Self {
            out: io::stdout(),
            raw_mode,
            attached: false,
            disposed: false,
        }
    }
}

impl DisplaySurface for TerminalSurface {
    fn attach(&mut self, container: &str) {
        if self.attached || self.disposed {
            return;
        }
        if self.raw_mode {
            if let Err(err) = terminal::enable_raw_mode() {
                warn!(target = "webtty::display", error = %err, "failed to enter raw mode");
                self.raw_mode = false;
            }
        }
        self.attached = true;
        debug!(target = "webtty::display", container, "surface attached");
    }

    fn write(&mut self, bytes: &[u8]) {
        if !self.attached || self.disposed {
            return;
        }
        if let Err(err) = self.out.write_all(bytes).and_then(|_| self.out.flush()) {
            warn!(target = "webtty::display", error = %err, "stdout write failed");
        }
    }

    fn resize(&mut self, _columns: u16, _rows: u16) {
        // The local terminal already has the new geometry.
    }

    fn set_title(&mut self, title: &str) {
        if self.attached && !self.disposed {
            let _ = execute!(self.out, terminal::SetTitle(title));
        }
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.attached && self.raw_mode {
            let _ = terminal::disable_raw_mode();
        }
        let _ = self.out.flush();
    }
}

impl Drop for TerminalSurface {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub mod stdout;

pub use stdout::TerminalSurface;

/// Condition shown on the surface instead of being raised to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceNotice {
    ConnectionClosed { reason: Option<String> },
    TransferInterrupted { file: String },
}

impl SurfaceNotice {
    pub fn message(&self) -> String {
        match self {
            SurfaceNotice::ConnectionClosed { reason: Some(reason) } => {
                format!("connection closed: {reason}")
            }
            SurfaceNotice::ConnectionClosed { reason: None } => "connection closed".to_string(),
            SurfaceNotice::TransferInterrupted { file } => {
                format!("upload of {file} interrupted")
            }
        }
    }
}

/// Renders the remote byte stream. The session attaches it at most once and
/// disposes it exactly once.
pub trait DisplaySurface: Send {
    fn attach(&mut self, container: &str);

    fn write(&mut self, bytes: &[u8]);

    fn resize(&mut self, columns: u16, rows: u16);

    fn dispose(&mut self);

    fn set_title(&mut self, _title: &str) {}

    fn notice(&mut self, notice: &SurfaceNotice) {
        let line = format!("\r\n[{}]\r\n", notice.message());
        self.write(line.as_bytes());
    }
}

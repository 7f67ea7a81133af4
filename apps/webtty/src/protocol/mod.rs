//! Frames exchanged with the remote pty.
//!
//! Command bytes follow the ttyd websocket protocol so a stock server can
//! drive the input/output/resize path; argument injection and file chunks
//! use the command bytes after the ones ttyd defines.

pub mod wire;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use wire::{
    WireError, decode_client_frame, decode_host_frame, encode_client_frame, encode_host_frame,
};

/// Ordered command arguments delivered to the remote process.
pub type ArgumentBatch = Vec<String>;

/// First text message on a new channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "AuthToken")]
    pub auth_token: String,
    pub columns: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub transfer_id: u64,
    pub file_index: u32,
    pub name: String,
    pub offset: u64,
    pub total_len: u64,
    pub data: Bytes,
}

impl FileChunk {
    pub fn is_last(&self) -> bool {
        self.offset + self.data.len() as u64 >= self.total_len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Input(Bytes),
    Resize { columns: u16, rows: u16 },
    Pause,
    Resume,
    /// Arguments for the initial invocation, sent before the surface attaches.
    InjectArguments(ArgumentBatch),
    /// Arguments arriving after the session is initialized.
    UpdateArguments(ArgumentBatch),
    FileChunk(FileChunk),
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Input(_) => "input",
            ClientFrame::Resize { .. } => "resize",
            ClientFrame::Pause => "pause",
            ClientFrame::Resume => "resume",
            ClientFrame::InjectArguments(_) => "inject_arguments",
            ClientFrame::UpdateArguments(_) => "update_arguments",
            ClientFrame::FileChunk(_) => "file_chunk",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostFrame {
    Output(Bytes),
    SetWindowTitle(String),
    SetPreferences(Map<String, Value>),
    /// The remote wants files; the UI should open its picker.
    RequestUpload,
}

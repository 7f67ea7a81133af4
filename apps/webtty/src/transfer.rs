use bytes::Bytes;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::channel::{ChannelAdapter, ChannelError};
use crate::protocol::{ClientFrame, FileChunk};

pub const DEFAULT_CHUNK_SIZE: usize = 14 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub data: Bytes,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Files picked in one selection, in selection order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileBatch {
    files: Vec<SelectedFile>,
}

impl FileBatch {
    pub fn new(files: Vec<SelectedFile>) -> Self {
        Self { files }
    }

    pub async fn from_paths<P: AsRef<Path>>(paths: &[P]) -> std::io::Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let data = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            files.push(SelectedFile::new(name, data));
        }
        Ok(Self { files })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> &[SelectedFile] {
        &self.files
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.data.len() as u64).sum()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("channel is not open")]
    ChannelUnavailable,
    #[error("transfer of {file} interrupted after {sent} of {total} bytes")]
    Interrupted { file: String, sent: u64, total: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub transfer_id: u64,
    pub files: usize,
    pub bytes: u64,
    pub chunks: u64,
}

/// Streams picked files over the session channel as `FileChunk` frames.
#[derive(Debug)]
pub struct FileTransferCoordinator {
    chunk_size: usize,
    next_transfer_id: u64,
}

impl FileTransferCoordinator {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            next_transfer_id: 1,
        }
    }

    /// `Ok(None)` for an empty batch. A channel that closes mid-way fails the
    /// whole batch; nothing is retried.
    pub async fn send(
        &mut self,
        channel: &mut ChannelAdapter,
        batch: &FileBatch,
    ) -> Result<Option<TransferSummary>, TransferError> {
        if batch.is_empty() {
            return Ok(None);
        }
        if !channel.is_open() {
            return Err(TransferError::ChannelUnavailable);
        }

        let transfer_id = self.next_transfer_id;
        self.next_transfer_id += 1;
        info!(
            target = "webtty::transfer",
            transfer_id,
            files = batch.len(),
            bytes = batch.total_bytes(),
            "starting upload"
        );

        let mut chunks = 0u64;
        for (index, file) in batch.files().iter().enumerate() {
            let total = file.data.len() as u64;
            let mut offset = 0usize;
            // Zero-length files still produce one (empty) chunk so the remote
            // learns about them.
            loop {
                let end = (offset + self.chunk_size).min(file.data.len());
                let frame = ClientFrame::FileChunk(FileChunk {
                    transfer_id,
                    file_index: index as u32,
                    name: file.name.clone(),
                    offset: offset as u64,
                    total_len: total,
                    data: file.data.slice(offset..end),
                });
                channel.send(&frame).map_err(|err| match err {
                    ChannelError::NotOpen | ChannelError::Closed => TransferError::Interrupted {
                        file: file.name.clone(),
                        sent: offset as u64,
                        total,
                    },
                })?;
                chunks += 1;
                offset = end;
                if offset >= file.data.len() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            debug!(
                target = "webtty::transfer",
                transfer_id,
                file = %file.name,
                bytes = total,
                "file sent"
            );
        }

        Ok(Some(TransferSummary {
            transfer_id,
            files: batch.len(),
            bytes: batch.total_bytes(),
            chunks,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Token;
    use crate::channel::DEFAULT_MAX_PENDING_BYTES;
    use crate::mock::MockRemote;
    use crate::transport::OpenRequest;

    async fn open_channel(remote: &MockRemote) -> ChannelAdapter {
        let mut channel = ChannelAdapter::new(DEFAULT_MAX_PENDING_BYTES);
        channel
            .open(
                &remote.connector(),
                &Token::new("t"),
                OpenRequest {
                    columns: 80,
                    rows: 24,
                },
            )
            .await
            .unwrap();
        channel
    }

    fn chunks(remote: &MockRemote) -> Vec<FileChunk> {
        remote
            .sent_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::FileChunk(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let remote = MockRemote::new();
        let mut channel = open_channel(&remote).await;
        let mut coordinator = FileTransferCoordinator::new(4);
        let result = coordinator
            .send(&mut channel, &FileBatch::default())
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(remote.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn files_are_chunked_in_order() {
        let remote = MockRemote::new();
        let mut channel = open_channel(&remote).await;
        let mut coordinator = FileTransferCoordinator::new(4);
        let batch = FileBatch::new(vec![
            SelectedFile::new("a.txt", &b"0123456789"[..]),
            SelectedFile::new("empty", Bytes::new()),
        ]);

        let summary = coordinator
            .send(&mut channel, &batch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, 10);
        assert_eq!(summary.chunks, 4);

        let sent = chunks(&remote);
        let first: Vec<u8> = sent
            .iter()
            .filter(|chunk| chunk.file_index == 0)
            .flat_map(|chunk| chunk.data.to_vec())
            .collect();
        assert_eq!(first, b"0123456789".to_vec());
        let offsets: Vec<u64> = sent.iter().map(|chunk| chunk.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 0]);
        assert!(sent[2].is_last());
        assert_eq!(sent[3].name, "empty");
        assert!(sent[3].is_last());
    }

    #[tokio::test]
    async fn close_mid_transfer_is_reported() {
        let remote = MockRemote::new();
        let mut channel = open_channel(&remote).await;
        remote.fail_sends_after(2);
        let mut coordinator = FileTransferCoordinator::new(4);
        let batch = FileBatch::new(vec![SelectedFile::new("big.bin", vec![7u8; 20])]);

        let err = coordinator.send(&mut channel, &batch).await.unwrap_err();
        assert_eq!(
            err,
            TransferError::Interrupted {
                file: "big.bin".into(),
                sent: 8,
                total: 20,
            }
        );
        assert_eq!(chunks(&remote).len(), 2);
    }

    #[tokio::test]
    async fn transfer_ids_increase() {
        let remote = MockRemote::new();
        let mut channel = open_channel(&remote).await;
        let mut coordinator = FileTransferCoordinator::new(1024);
        let batch = FileBatch::new(vec![SelectedFile::new("x", &b"x"[..])]);
        let first = coordinator.send(&mut channel, &batch).await.unwrap().unwrap();
        let second = coordinator.send(&mut channel, &batch).await.unwrap().unwrap();
        assert_eq!(second.transfer_id, first.transfer_id + 1);
    }
}

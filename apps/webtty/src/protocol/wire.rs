use super::{ArgumentBatch, ClientFrame, FileChunk, HostFrame};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const CLIENT_INPUT: u8 = b'0';
const CLIENT_RESIZE: u8 = b'1';
const CLIENT_PAUSE: u8 = b'2';
const CLIENT_RESUME: u8 = b'3';
const CLIENT_INJECT_ARGS: u8 = b'4';
const CLIENT_UPDATE_ARGS: u8 = b'5';
const CLIENT_FILE_CHUNK: u8 = b'6';

const HOST_OUTPUT: u8 = b'0';
const HOST_SET_TITLE: u8 = b'1';
const HOST_SET_PREFERENCES: u8 = b'2';
const HOST_REQUEST_UPLOAD: u8 = b'3';

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
    #[error("invalid json payload: {0}")]
    Json(String),
}

#[derive(Serialize, Deserialize)]
struct ResizePayload {
    columns: u16,
    rows: u16,
}

pub fn encode_client_frame(frame: &ClientFrame) -> Vec<u8> {
    match frame {
        ClientFrame::Input(data) => with_kind(CLIENT_INPUT, data),
        ClientFrame::Resize { columns, rows } => {
            let payload = ResizePayload {
                columns: *columns,
                rows: *rows,
            };
            with_kind(CLIENT_RESIZE, &json_bytes(&payload))
        }
        ClientFrame::Pause => vec![CLIENT_PAUSE],
        ClientFrame::Resume => vec![CLIENT_RESUME],
        ClientFrame::InjectArguments(args) => with_kind(CLIENT_INJECT_ARGS, &json_bytes(args)),
        ClientFrame::UpdateArguments(args) => with_kind(CLIENT_UPDATE_ARGS, &json_bytes(args)),
        ClientFrame::FileChunk(chunk) => {
            let mut buf = Vec::with_capacity(chunk.data.len() + chunk.name.len() + 24);
            buf.push(CLIENT_FILE_CHUNK);
            write_var_u64(&mut buf, chunk.transfer_id);
            write_var_u64(&mut buf, chunk.file_index as u64);
            write_var_u64(&mut buf, chunk.offset);
            write_var_u64(&mut buf, chunk.total_len);
            write_string(&mut buf, &chunk.name);
            buf.extend_from_slice(&chunk.data);
            buf
        }
    }
}

pub fn decode_client_frame(bytes: &[u8]) -> Result<ClientFrame, WireError> {
    let (&kind, rest) = bytes.split_first().ok_or(WireError::Empty)?;
    match kind {
        CLIENT_INPUT => Ok(ClientFrame::Input(Bytes::copy_from_slice(rest))),
        CLIENT_RESIZE => {
            let payload: ResizePayload = from_json(rest)?;
            Ok(ClientFrame::Resize {
                columns: payload.columns,
                rows: payload.rows,
            })
        }
        CLIENT_PAUSE => Ok(ClientFrame::Pause),
        CLIENT_RESUME => Ok(ClientFrame::Resume),
        CLIENT_INJECT_ARGS => Ok(ClientFrame::InjectArguments(from_json::<ArgumentBatch>(
            rest,
        )?)),
        CLIENT_UPDATE_ARGS => Ok(ClientFrame::UpdateArguments(from_json::<ArgumentBatch>(
            rest,
        )?)),
        CLIENT_FILE_CHUNK => {
            let mut cursor = Cursor::new(rest);
            let transfer_id = cursor.read_var_u64()?;
            let file_index = cursor.read_var_u32()?;
            let offset = cursor.read_var_u64()?;
            let total_len = cursor.read_var_u64()?;
            let name = cursor.read_string()?;
            let data = Bytes::copy_from_slice(cursor.remaining());
            let end = offset.checked_add(data.len() as u64);
            if end.is_none_or(|end| end > total_len) {
                return Err(WireError::InvalidData("chunk extends past file length"));
            }
            Ok(ClientFrame::FileChunk(FileChunk {
                transfer_id,
                file_index,
                name,
                offset,
                total_len,
                data,
            }))
        }
        other => Err(WireError::UnknownFrameType(other)),
    }
}

pub fn encode_host_frame(frame: &HostFrame) -> Vec<u8> {
    match frame {
        HostFrame::Output(data) => with_kind(HOST_OUTPUT, data),
        HostFrame::SetWindowTitle(title) => with_kind(HOST_SET_TITLE, title.as_bytes()),
        HostFrame::SetPreferences(prefs) => with_kind(HOST_SET_PREFERENCES, &json_bytes(prefs)),
        HostFrame::RequestUpload => vec![HOST_REQUEST_UPLOAD],
    }
}

pub fn decode_host_frame(bytes: &[u8]) -> Result<HostFrame, WireError> {
    let (&kind, rest) = bytes.split_first().ok_or(WireError::Empty)?;
    match kind {
        HOST_OUTPUT => Ok(HostFrame::Output(Bytes::copy_from_slice(rest))),
        HOST_SET_TITLE => Ok(HostFrame::SetWindowTitle(
            String::from_utf8_lossy(rest).into_owned(),
        )),
        HOST_SET_PREFERENCES => {
            let prefs: Map<String, Value> = from_json(rest)?;
            Ok(HostFrame::SetPreferences(prefs))
        }
        HOST_REQUEST_UPLOAD => Ok(HostFrame::RequestUpload),
        other => Err(WireError::UnknownFrameType(other)),
    }
}

fn with_kind(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

fn json_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    // Serializing plain structs, string lists and JSON maps cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

fn from_json<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, WireError> {
    serde_json::from_slice(bytes).map_err(|err| WireError::Json(err.to_string()))
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_var_u64(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let byte = *self.bytes.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_var_u32(&mut self) -> Result<u32, WireError> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| WireError::InvalidData("u32 overflow"))
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_var_u64()? as usize;
        let end = self.pos.checked_add(len).ok_or(WireError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(WireError::UnexpectedEof)?;
        self.pos = end;
        String::from_utf8(slice.to_vec()).map_err(|_| WireError::InvalidData("utf-8 string"))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos.min(self.bytes.len())..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_and_arguments_use_distinct_kinds() {
        let input = encode_client_frame(&ClientFrame::Input(Bytes::from_static(b"[\"ls\"]")));
        let inject = encode_client_frame(&ClientFrame::InjectArguments(vec!["ls".into()]));
        assert_eq!(input[0], b'0');
        assert_eq!(inject[0], b'4');
        assert_eq!(&input[1..], &inject[1..]);
        assert!(matches!(
            decode_client_frame(&input).unwrap(),
            ClientFrame::Input(_)
        ));
        assert_eq!(
            decode_client_frame(&inject).unwrap(),
            ClientFrame::InjectArguments(vec!["ls".into()])
        );
    }

    #[test]
    fn resize_matches_ttyd_json() {
        let bytes = encode_client_frame(&ClientFrame::Resize {
            columns: 120,
            rows: 40,
        });
        assert_eq!(bytes, b"1{\"columns\":120,\"rows\":40}".to_vec());
    }

    #[test]
    fn argument_order_survives_encoding() {
        let args = vec!["-c".to_string(), "echo a&b".to_string(), "ü".to_string()];
        let bytes = encode_client_frame(&ClientFrame::UpdateArguments(args.clone()));
        assert_eq!(
            decode_client_frame(&bytes).unwrap(),
            ClientFrame::UpdateArguments(args)
        );
    }

    #[test]
    fn file_chunk_header_and_payload() {
        let chunk = FileChunk {
            transfer_id: 300,
            file_index: 2,
            name: "notes.txt".into(),
            offset: 16_384,
            total_len: 16_390,
            data: Bytes::from_static(b"abcdef"),
        };
        let bytes = encode_client_frame(&ClientFrame::FileChunk(chunk.clone()));
        assert_eq!(bytes[0], b'6');
        let decoded = decode_client_frame(&bytes).unwrap();
        assert_eq!(decoded, ClientFrame::FileChunk(chunk.clone()));
        assert!(chunk.is_last());
    }

    #[test]
    fn truncated_file_chunk_is_rejected() {
        let bytes = encode_client_frame(&ClientFrame::FileChunk(FileChunk {
            transfer_id: 1,
            file_index: 0,
            name: "a-long-file-name.bin".into(),
            offset: 0,
            total_len: 4,
            data: Bytes::from_static(b"data"),
        }));
        let err = decode_client_frame(&bytes[..8]).unwrap_err();
        assert_eq!(err, WireError::UnexpectedEof);
    }

    #[test]
    fn host_frames_decode() {
        assert_eq!(
            decode_host_frame(b"0hello").unwrap(),
            HostFrame::Output(Bytes::from_static(b"hello"))
        );
        assert_eq!(
            decode_host_frame(b"1bash - host").unwrap(),
            HostFrame::SetWindowTitle("bash - host".into())
        );
        match decode_host_frame(b"2{\"fontSize\":14}").unwrap() {
            HostFrame::SetPreferences(prefs) => assert_eq!(prefs["fontSize"], 14),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(decode_host_frame(b"3").unwrap(), HostFrame::RequestUpload);
        assert_eq!(decode_host_frame(b"").unwrap_err(), WireError::Empty);
        assert_eq!(
            decode_host_frame(b"9").unwrap_err(),
            WireError::UnknownFrameType(b'9')
        );
    }
}

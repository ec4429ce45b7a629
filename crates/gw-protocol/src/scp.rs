//! SCP control records
//!
//! The SCP sub-protocol runs over an exec channel (`scp -t` / `scp -f`). Each
//! transfer step is a single control line, answered by a one-byte ack:
//!
//! ```text
//! C0644 <size> <name>\n   file follows (size bytes, then a \0)
//! D0755 0 <name>\n        enter directory
//! E\n                     leave directory
//! T<mtime> 0 <atime> 0\n  timestamps for the next record
//! \0                      ok
//! \x01<message>\n         warning
//! \x02<message>\n         fatal error
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Maximum length of a single control line
pub const MAX_RECORD_LEN: usize = 8 * 1024;

const ACK_OK: u8 = 0;
const ACK_WARNING: u8 = 1;
const ACK_FATAL: u8 = 2;

/// A control record describing the next transfer step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpRecord {
    /// A regular file of `size` bytes follows
    File { mode: u32, size: u64, name: String },
    /// Descend into a directory
    Directory { mode: u32, name: String },
    /// Ascend out of the current directory
    EndDirectory,
    /// Modification and access times for the following record
    Times { mtime: u64, atime: u64 },
}

/// Acknowledgement byte (plus message) sent after each step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpAck {
    Ok,
    Warning(String),
    Fatal(String),
}

impl ScpAck {
    /// Whether the ack allows the transfer to continue
    pub fn is_ok(&self) -> bool {
        matches!(self, ScpAck::Ok)
    }

    /// The error message carried by a warning or fatal ack
    pub fn message(&self) -> Option<&str> {
        match self {
            ScpAck::Ok => None,
            ScpAck::Warning(msg) | ScpAck::Fatal(msg) => Some(msg),
        }
    }

    /// Decode an ack from the front of `src`
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        match first {
            ACK_OK => {
                src.advance(1);
                Ok(Some(ScpAck::Ok))
            }
            ACK_WARNING | ACK_FATAL => {
                let Some(line) = take_line(src)? else {
                    return Ok(None);
                };
                let message = String::from_utf8_lossy(&line[1..]).trim().to_string();
                Ok(Some(if first == ACK_WARNING {
                    ScpAck::Warning(message)
                } else {
                    ScpAck::Fatal(message)
                }))
            }
            other => Err(ProtocolError::MalformedRecord(format!(
                "unexpected ack byte 0x{:02x}",
                other
            ))),
        }
    }

    /// Encode this ack
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            ScpAck::Ok => dst.put_u8(ACK_OK),
            ScpAck::Warning(msg) => {
                dst.put_u8(ACK_WARNING);
                dst.extend_from_slice(msg.as_bytes());
                dst.put_u8(b'\n');
            }
            ScpAck::Fatal(msg) => {
                dst.put_u8(ACK_FATAL);
                dst.extend_from_slice(msg.as_bytes());
                dst.put_u8(b'\n');
            }
        }
    }
}

/// What a source-side peer can send: a record or an error ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpMessage {
    Record(ScpRecord),
    Warning(String),
    Fatal(String),
}

/// Codec for SCP control lines
#[derive(Debug, Default)]
pub struct ScpCodec;

impl ScpCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ScpCodec {
    type Item = ScpMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        // Error acks share the framing of control lines
        if first == ACK_WARNING || first == ACK_FATAL {
            let Some(line) = take_line(src)? else {
                return Ok(None);
            };
            let message = String::from_utf8_lossy(&line[1..]).trim().to_string();
            return Ok(Some(if first == ACK_WARNING {
                ScpMessage::Warning(message)
            } else {
                ScpMessage::Fatal(message)
            }));
        }

        let Some(line) = take_line(src)? else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&line).into_owned();
        parse_record(&line).map(|record| Some(ScpMessage::Record(record)))
    }
}

impl Encoder<ScpRecord> for ScpCodec {
    type Error = ProtocolError;

    fn encode(&mut self, record: ScpRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = match record {
            ScpRecord::File { mode, size, name } => {
                check_name(&name)?;
                format!("C{:04o} {} {}\n", mode & 0o7777, size, name)
            }
            ScpRecord::Directory { mode, name } => {
                check_name(&name)?;
                format!("D{:04o} 0 {}\n", mode & 0o7777, name)
            }
            ScpRecord::EndDirectory => "E\n".to_string(),
            ScpRecord::Times { mtime, atime } => format!("T{} 0 {} 0\n", mtime, atime),
        };

        if line.len() > MAX_RECORD_LEN {
            return Err(ProtocolError::RecordTooLong {
                size: line.len(),
                max: MAX_RECORD_LEN,
            });
        }

        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() || name.contains('\n') || name.contains('/') {
        return Err(ProtocolError::MalformedRecord(format!(
            "invalid file name {:?}",
            name
        )));
    }
    Ok(())
}

/// Split one `\n`-terminated line off the front of `src`, without the newline
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
    match src.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            Ok(Some(line))
        }
        None if src.len() > MAX_RECORD_LEN => Err(ProtocolError::RecordTooLong {
            size: src.len(),
            max: MAX_RECORD_LEN,
        }),
        None => Ok(None),
    }
}

fn parse_record(line: &str) -> Result<ScpRecord, ProtocolError> {
    let malformed = || ProtocolError::MalformedRecord(line.to_string());

    let mut chars = line.chars();
    let kind = chars.next().ok_or_else(malformed)?;
    let body = chars.as_str();

    match kind {
        'C' | 'D' => {
            let mut parts = body.splitn(3, ' ');
            let mode = parts
                .next()
                .and_then(|m| u32::from_str_radix(m, 8).ok())
                .ok_or_else(malformed)?;
            let size = parts
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(malformed)?;
            let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(malformed)?;
            if name.contains('/') || name == ".." {
                return Err(malformed());
            }
            let name = name.to_string();
            Ok(if kind == 'C' {
                ScpRecord::File { mode, size, name }
            } else {
                ScpRecord::Directory { mode, name }
            })
        }
        'E' => Ok(ScpRecord::EndDirectory),
        'T' => {
            let fields: Vec<u64> = body
                .split(' ')
                .map(|f| f.parse::<u64>())
                .collect::<Result<_, _>>()
                .map_err(|_| malformed())?;
            match fields.as_slice() {
                [mtime, _, atime, _] => Ok(ScpRecord::Times {
                    mtime: *mtime,
                    atime: *atime,
                }),
                _ => Err(malformed()),
            }
        }
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(record: ScpRecord) -> String {
        let mut buf = BytesMut::new();
        ScpCodec::new().encode(record, &mut buf).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_encode_records() {
        assert_eq!(
            encode(ScpRecord::File {
                mode: 0o100644,
                size: 12,
                name: "hello.txt".into()
            }),
            "C0644 12 hello.txt\n"
        );
        assert_eq!(
            encode(ScpRecord::Directory {
                mode: 0o755,
                name: "etc".into()
            }),
            "D0755 0 etc\n"
        );
        assert_eq!(encode(ScpRecord::EndDirectory), "E\n");
    }

    #[test]
    fn test_encode_rejects_path_names() {
        let mut buf = BytesMut::new();
        let result = ScpCodec::new().encode(
            ScpRecord::File {
                mode: 0o644,
                size: 0,
                name: "a/b".into(),
            },
            &mut buf,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_sequence() {
        let mut codec = ScpCodec::new();
        let mut buf = BytesMut::from(&b"T1700000000 0 1700000001 0\nD0755 0 conf\nC0600 5 key"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ScpMessage::Record(ScpRecord::Times {
                mtime: 1_700_000_000,
                atime: 1_700_000_001
            }))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ScpMessage::Record(ScpRecord::Directory {
                mode: 0o755,
                name: "conf".into()
            }))
        );
        // Incomplete line waits for more data
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\nhello");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ScpMessage::Record(ScpRecord::File {
                mode: 0o600,
                size: 5,
                name: "key".into()
            }))
        );
        // File contents are left in the buffer for the caller
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_decode_error_message() {
        let mut codec = ScpCodec::new();
        let mut buf = BytesMut::from(&b"\x01scp: /root/x: Permission denied\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ScpMessage::Warning("scp: /root/x: Permission denied".into()))
        );
    }

    #[test]
    fn test_decode_rejects_traversal() {
        let mut codec = ScpCodec::new();
        let mut buf = BytesMut::from(&b"C0644 1 ../evil\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"D0755 0 ..\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_ack_roundtrip() {
        let mut buf = BytesMut::new();
        ScpAck::Ok.encode(&mut buf);
        ScpAck::Fatal("scp: no such file".into()).encode(&mut buf);

        assert_eq!(ScpAck::decode(&mut buf).unwrap(), Some(ScpAck::Ok));
        let fatal = ScpAck::decode(&mut buf).unwrap().unwrap();
        assert!(!fatal.is_ok());
        assert_eq!(fatal.message(), Some("scp: no such file"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ack_needs_full_line() {
        let mut buf = BytesMut::from(&b"\x02partial"[..]);
        assert_eq!(ScpAck::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_record_too_long() {
        let mut codec = ScpCodec::new();
        let mut buf = BytesMut::from(&vec![b'C'; MAX_RECORD_LEN + 1][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::RecordTooLong { .. })
        ));
    }
}

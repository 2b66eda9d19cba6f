//! Build values: the serialized outcomes of build-system tasks.
//!
//! Values cross the engine boundary as opaque bytes and are persisted in
//! the build database, so the codec is a stable, fixed binary layout: a
//! single tag byte followed by the variant's payload.

use thiserror::Error;

use crate::util::fs::{FileInfo, FileKind, FileTimestamp};

/// A malformed value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueDecodeError {
    #[error("empty build value")]
    Empty,
    #[error("unknown build value tag {0}")]
    UnknownTag(u8),
    #[error("truncated build value")]
    Truncated,
    #[error("trailing bytes after build value")]
    TrailingBytes,
}

/// The outcome of evaluating a build-system key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildValue {
    /// A sentinel for results that must never be treated as usable.
    Invalid,
    /// A virtual input node; carries no state.
    VirtualInput,
    /// An input file that exists, with its observed identity.
    ExistingInput(FileInfo),
    /// An input that does not exist and has no producer.
    MissingInput,
    /// An input whose producer failed.
    FailedInput,
    /// A command that ran successfully: the identity of each declared
    /// output plus the signature of the invocation that produced them.
    SuccessfulCommand {
        outputs: Vec<FileInfo>,
        signature: u64,
    },
    /// A command that ran and failed.
    FailedCommand,
    /// A command that was not run because an input was unavailable or the
    /// build was cancelled.
    SkippedCommand,
    /// A target; carries no state and never validates.
    Target,
}

const TAG_INVALID: u8 = 0;
const TAG_VIRTUAL_INPUT: u8 = 1;
const TAG_EXISTING_INPUT: u8 = 2;
const TAG_MISSING_INPUT: u8 = 3;
const TAG_FAILED_INPUT: u8 = 4;
const TAG_SUCCESSFUL_COMMAND: u8 = 5;
const TAG_FAILED_COMMAND: u8 = 6;
const TAG_SKIPPED_COMMAND: u8 = 7;
const TAG_TARGET: u8 = 8;

impl BuildValue {
    pub fn is_invalid(&self) -> bool {
        matches!(self, BuildValue::Invalid)
    }

    pub fn is_virtual_input(&self) -> bool {
        matches!(self, BuildValue::VirtualInput)
    }

    pub fn is_existing_input(&self) -> bool {
        matches!(self, BuildValue::ExistingInput(_))
    }

    pub fn is_missing_input(&self) -> bool {
        matches!(self, BuildValue::MissingInput)
    }

    pub fn is_failed_input(&self) -> bool {
        matches!(self, BuildValue::FailedInput)
    }

    pub fn is_successful_command(&self) -> bool {
        matches!(self, BuildValue::SuccessfulCommand { .. })
    }

    pub fn is_failed_command(&self) -> bool {
        matches!(self, BuildValue::FailedCommand)
    }

    pub fn is_skipped_command(&self) -> bool {
        matches!(self, BuildValue::SkippedCommand)
    }

    /// The file info of an existing input.
    pub fn output_info(&self) -> Option<&FileInfo> {
        match self {
            BuildValue::ExistingInput(info) => Some(info),
            _ => None,
        }
    }

    /// Serialize to the fixed binary layout.
    pub fn to_data(&self) -> Vec<u8> {
        match self {
            BuildValue::Invalid => vec![TAG_INVALID],
            BuildValue::VirtualInput => vec![TAG_VIRTUAL_INPUT],
            BuildValue::ExistingInput(info) => {
                let mut out = vec![TAG_EXISTING_INPUT];
                encode_file_info(&mut out, info);
                out
            }
            BuildValue::MissingInput => vec![TAG_MISSING_INPUT],
            BuildValue::FailedInput => vec![TAG_FAILED_INPUT],
            BuildValue::SuccessfulCommand { outputs, signature } => {
                let mut out = vec![TAG_SUCCESSFUL_COMMAND];
                out.extend_from_slice(&(outputs.len() as u32).to_le_bytes());
                for info in outputs {
                    encode_file_info(&mut out, info);
                }
                out.extend_from_slice(&signature.to_le_bytes());
                out
            }
            BuildValue::FailedCommand => vec![TAG_FAILED_COMMAND],
            BuildValue::SkippedCommand => vec![TAG_SKIPPED_COMMAND],
            BuildValue::Target => vec![TAG_TARGET],
        }
    }

    /// Decode value bytes.
    pub fn from_data(data: &[u8]) -> Result<Self, ValueDecodeError> {
        let (&tag, rest) = data.split_first().ok_or(ValueDecodeError::Empty)?;
        let mut reader = Reader { data: rest };
        let value = match tag {
            TAG_INVALID => BuildValue::Invalid,
            TAG_VIRTUAL_INPUT => BuildValue::VirtualInput,
            TAG_EXISTING_INPUT => BuildValue::ExistingInput(decode_file_info(&mut reader)?),
            TAG_MISSING_INPUT => BuildValue::MissingInput,
            TAG_FAILED_INPUT => BuildValue::FailedInput,
            TAG_SUCCESSFUL_COMMAND => {
                let count = reader.read_u32()? as usize;
                let mut outputs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    outputs.push(decode_file_info(&mut reader)?);
                }
                let signature = reader.read_u64()?;
                BuildValue::SuccessfulCommand { outputs, signature }
            }
            TAG_FAILED_COMMAND => BuildValue::FailedCommand,
            TAG_SKIPPED_COMMAND => BuildValue::SkippedCommand,
            TAG_TARGET => BuildValue::Target,
            other => return Err(ValueDecodeError::UnknownTag(other)),
        };
        if !reader.data.is_empty() {
            return Err(ValueDecodeError::TrailingBytes);
        }
        Ok(value)
    }
}

struct Reader<'a> {
    data: &'a [u8],
}

impl Reader<'_> {
    fn read_bytes(&mut self, n: usize) -> Result<&[u8], ValueDecodeError> {
        if self.data.len() < n {
            return Err(ValueDecodeError::Truncated);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, ValueDecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, ValueDecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ValueDecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }
}

const KIND_FILE: u8 = 0;
const KIND_DIRECTORY: u8 = 1;
const KIND_MISSING: u8 = 2;

fn encode_file_info(out: &mut Vec<u8>, info: &FileInfo) {
    out.extend_from_slice(&info.device.to_le_bytes());
    out.extend_from_slice(&info.inode.to_le_bytes());
    out.extend_from_slice(&info.size.to_le_bytes());
    out.extend_from_slice(&info.mod_time.seconds.to_le_bytes());
    out.extend_from_slice(&info.mod_time.nanoseconds.to_le_bytes());
    out.push(match info.kind {
        FileKind::File => KIND_FILE,
        FileKind::Directory => KIND_DIRECTORY,
        FileKind::Missing => KIND_MISSING,
    });
}

fn decode_file_info(reader: &mut Reader<'_>) -> Result<FileInfo, ValueDecodeError> {
    let device = reader.read_u64()?;
    let inode = reader.read_u64()?;
    let size = reader.read_u64()?;
    let seconds = reader.read_u64()?;
    let nanoseconds = reader.read_u32()?;
    let kind = match reader.read_u8()? {
        KIND_FILE => FileKind::File,
        KIND_DIRECTORY => FileKind::Directory,
        KIND_MISSING => FileKind::Missing,
        other => return Err(ValueDecodeError::UnknownTag(other)),
    };
    Ok(FileInfo {
        device,
        inode,
        size,
        mod_time: FileTimestamp {
            seconds,
            nanoseconds,
        },
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> FileInfo {
        FileInfo {
            device: 0x10,
            inode: 0x20,
            size: 1234,
            mod_time: FileTimestamp {
                seconds: 1_700_000_000,
                nanoseconds: 987_654_321,
            },
            kind: FileKind::File,
        }
    }

    #[test]
    fn test_round_trip() {
        let values = [
            BuildValue::Invalid,
            BuildValue::VirtualInput,
            BuildValue::ExistingInput(sample_info()),
            BuildValue::MissingInput,
            BuildValue::FailedInput,
            BuildValue::SuccessfulCommand {
                outputs: vec![sample_info(), FileInfo::missing()],
                signature: 0xdead_beef_cafe_f00d,
            },
            BuildValue::SuccessfulCommand {
                outputs: vec![],
                signature: 0,
            },
            BuildValue::FailedCommand,
            BuildValue::SkippedCommand,
            BuildValue::Target,
        ];
        for value in values {
            assert_eq!(BuildValue::from_data(&value.to_data()).unwrap(), value);
        }
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            BuildValue::from_data(&[99]),
            Err(ValueDecodeError::UnknownTag(99))
        );
        assert_eq!(BuildValue::from_data(&[]), Err(ValueDecodeError::Empty));
    }

    #[test]
    fn test_truncated_payload() {
        let mut data = BuildValue::ExistingInput(sample_info()).to_data();
        data.truncate(10);
        assert_eq!(
            BuildValue::from_data(&data),
            Err(ValueDecodeError::Truncated)
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut data = BuildValue::Target.to_data();
        data.push(0);
        assert_eq!(
            BuildValue::from_data(&data),
            Err(ValueDecodeError::TrailingBytes)
        );
    }
}

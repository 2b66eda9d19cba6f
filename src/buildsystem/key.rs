//! Typed keys for the build-system layer.
//!
//! Engine keys are opaque bytes; the build system tags them with a
//! one-byte kind discriminator followed by the UTF-8 name (or, for custom
//! tasks, a name plus an opaque payload). The first byte alone determines
//! the kind.

use std::fmt;

use thiserror::Error;

/// A malformed key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("empty build key")]
    Empty,
    #[error("unknown build key discriminator {0:?}")]
    UnknownKind(u8),
    #[error("build key payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("truncated custom task key")]
    Truncated,
}

/// A typed key in the build-system layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildKey {
    /// Execution of the named command.
    Command(String),
    /// A task produced on demand by a tool; the payload is tool-specific.
    CustomTask { name: String, data: Vec<u8> },
    /// Production or validation of the named node.
    Node(String),
    /// A named collection of node requests.
    Target(String),
}

const KIND_COMMAND: u8 = b'C';
const KIND_CUSTOM_TASK: u8 = b'X';
const KIND_NODE: u8 = b'N';
const KIND_TARGET: u8 = b'T';

impl BuildKey {
    pub fn command(name: impl Into<String>) -> Self {
        BuildKey::Command(name.into())
    }

    pub fn custom_task(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        BuildKey::CustomTask {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn node(name: impl Into<String>) -> Self {
        BuildKey::Node(name.into())
    }

    pub fn target(name: impl Into<String>) -> Self {
        BuildKey::Target(name.into())
    }

    /// Serialize to the engine's opaque key bytes.
    pub fn to_data(&self) -> Vec<u8> {
        match self {
            BuildKey::Command(name) => tagged(KIND_COMMAND, name.as_bytes()),
            BuildKey::Node(name) => tagged(KIND_NODE, name.as_bytes()),
            BuildKey::Target(name) => tagged(KIND_TARGET, name.as_bytes()),
            BuildKey::CustomTask { name, data } => {
                let name_bytes = name.as_bytes();
                let mut out = Vec::with_capacity(5 + name_bytes.len() + data.len());
                out.push(KIND_CUSTOM_TASK);
                out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(name_bytes);
                out.extend_from_slice(data);
                out
            }
        }
    }

    /// Decode key bytes. Unknown discriminators are a hard error.
    pub fn from_data(data: &[u8]) -> Result<Self, KeyDecodeError> {
        let (&kind, rest) = data.split_first().ok_or(KeyDecodeError::Empty)?;
        match kind {
            KIND_COMMAND => Ok(BuildKey::Command(utf8(rest)?)),
            KIND_NODE => Ok(BuildKey::Node(utf8(rest)?)),
            KIND_TARGET => Ok(BuildKey::Target(utf8(rest)?)),
            KIND_CUSTOM_TASK => {
                if rest.len() < 4 {
                    return Err(KeyDecodeError::Truncated);
                }
                let (len_bytes, tail) = rest.split_at(4);
                let name_len = u32::from_le_bytes([
                    len_bytes[0],
                    len_bytes[1],
                    len_bytes[2],
                    len_bytes[3],
                ]) as usize;
                if tail.len() < name_len {
                    return Err(KeyDecodeError::Truncated);
                }
                let (name, payload) = tail.split_at(name_len);
                Ok(BuildKey::CustomTask {
                    name: utf8(name)?,
                    data: payload.to_vec(),
                })
            }
            other => Err(KeyDecodeError::UnknownKind(other)),
        }
    }

    /// A short label for the key's kind, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            BuildKey::Command(_) => "command",
            BuildKey::CustomTask { .. } => "custom task",
            BuildKey::Node(_) => "node",
            BuildKey::Target(_) => "target",
        }
    }

    /// The name component of the key.
    pub fn name(&self) -> &str {
        match self {
            BuildKey::Command(name)
            | BuildKey::Node(name)
            | BuildKey::Target(name)
            | BuildKey::CustomTask { name, .. } => name,
        }
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind_name(), self.name())
    }
}

fn tagged(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(kind);
    out.extend_from_slice(payload);
    out
}

fn utf8(bytes: &[u8]) -> Result<String, KeyDecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| KeyDecodeError::InvalidUtf8)
}

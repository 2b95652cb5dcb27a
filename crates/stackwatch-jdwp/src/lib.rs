//! Java Debug Wire Protocol (JDWP) client for stackwatch.
//!
//! `stackwatch` consumes this crate to read the locals of a suspended JVM
//! frame. The client is deliberately small: it performs the handshake, learns
//! the target's identifier sizes and implements the read-only inspection
//! commands needed to enumerate visible variables, fetch their values in one
//! batched `StackFrame.GetValues` exchange and expand arrays, strings and
//! object types for display.
//!
//! Execution control (breakpoints, stepping, resuming) is owned by the
//! caller; composite event packets that arrive while a reply is pending are
//! queued on the client rather than interpreted.

mod codec;
mod mock;
mod poison;
mod signature;
mod tcp;

#[cfg(any(test, feature = "test-support"))]
pub mod wire_mock;

use std::io;

use thiserror::Error;

pub use codec::{encode_command, encode_reply, read_packet, JdwpReader, JdwpWriter, Packet};
pub use mock::{MockArray, MockCall, MockJdwpClient};
pub use signature::{is_primitive_tag, signature_to_tag, signature_to_type_name};
pub use tcp::{JdwpClientConfig, TcpJdwpClient};

pub type ThreadId = u64;
pub type FrameId = u64;
pub type ObjectId = u64;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;

/// Length of the fixed JDWP packet header (`length`, `id`, `flags`, and either
/// `command_set`/`command` or `error_code`).
pub const JDWP_HEADER_LEN: usize = 11;

/// Upper bound on a single packet accepted from the target.
pub const MAX_JDWP_PACKET_BYTES: usize = 16 * 1024 * 1024;

/// JDWP `Error.INVALID_OBJECT`: the object has been garbage collected.
pub const ERROR_INVALID_OBJECT: u16 = 20;

/// JDWP `Error.ABSENT_INFORMATION`: the class was compiled without debug info.
pub const ERROR_ABSENT_INFORMATION: u16 = 101;

pub const TAG_ARRAY: u8 = b'[';
pub const TAG_OBJECT: u8 = b'L';
pub const TAG_STRING: u8 = b's';

pub fn validate_jdwp_packet_length(length: usize) -> Result<(), String> {
    if length < JDWP_HEADER_LEN {
        return Err(format!("invalid packet length {length}"));
    }
    if length > MAX_JDWP_PACKET_BYTES {
        return Err(format!(
            "JDWP packet length {length} exceeds maximum allowed ({MAX_JDWP_PACKET_BYTES} bytes); refusing to allocate"
        ));
    }
    Ok(())
}

/// Identifier sizes reported by `VirtualMachine.IDSizes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl JdwpIdSizes {
    /// Every identifier must fit the `u64` ids this crate uses.
    pub fn is_valid(&self) -> bool {
        [
            self.field_id,
            self.method_id,
            self.object_id,
            self.reference_type_id,
            self.frame_id,
        ]
        .iter()
        .all(|size| (1..=8).contains(size))
    }
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        // Most modern JVMs use 8-byte ids, but the JDWP protocol allows targets
        // to choose. The real sizes are queried on connect.
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

/// One activation record of a suspended thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub thread: ThreadId,
    pub frame_id: FrameId,
    pub location: Location,
}

/// A raw `Method.VariableTable` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    pub fn is_visible_at(&self, index: u64) -> bool {
        index >= self.code_index && index < self.code_index.saturating_add(u64::from(self.length))
    }
}

/// A local variable in scope at a frame's current location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub name: String,
    pub signature: String,
    /// Slot of the variable in the JVM frame, as reported by the variable table.
    pub jvm_slot: u32,
    pub is_argument: bool,
}

/// One entry of a `StackFrame.GetValues` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRequest {
    pub slot: u32,
    pub tag: u8,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum JdwpValue {
    Void,
    Boolean(bool),
    Byte(i8),
    /// UTF-16 code unit.
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Any reference value; `id == 0` is Java `null`.
    Object { tag: u8, id: ObjectId },
}

impl JdwpValue {
    pub fn null() -> Self {
        Self::Object {
            tag: TAG_OBJECT,
            id: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Object { id: 0, .. })
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Void => b'V',
            Self::Boolean(_) => b'Z',
            Self::Byte(_) => b'B',
            Self::Char(_) => b'C',
            Self::Short(_) => b'S',
            Self::Int(_) => b'I',
            Self::Long(_) => b'J',
            Self::Float(_) => b'F',
            Self::Double(_) => b'D',
            Self::Object { tag, .. } => *tag,
        }
    }
}

/// Asynchronous VM event received while the client was waiting for a reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JdwpEvent {
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath,
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("JDWP client is not connected")]
    NotConnected,
    #[error("JDWP handshake failed")]
    HandshakeFailed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("timed out waiting for JDWP reply")]
    Timeout,
    #[error("JDWP connection closed")]
    ConnectionClosed,
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP command failed with error code {error_code}")]
    CommandFailed { error_code: u16 },
    #[error("JDWP string was not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid object id {0}")]
    InvalidObjectId(ObjectId),
}

impl JdwpError {
    /// Whether the error means the connection itself is unusable, as opposed
    /// to the target rejecting or garbling one command.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::HandshakeFailed
                | Self::Io(_)
                | Self::Timeout
                | Self::ConnectionClosed
        )
    }
}

/// Read-only inspection surface of a suspended JVM.
///
/// Every method performs its own request/reply exchange; implementations must
/// serialize exchanges so that two callers sharing one connection never
/// interleave packets.
pub trait JdwpClient: Send + Sync {
    /// Identifier sizes negotiated with the target.
    fn id_sizes(&self) -> Result<JdwpIdSizes, JdwpError>;

    /// `ThreadReference.Frames`; `length == -1` requests all remaining frames.
    fn frames(&self, thread: ThreadId, start: i32, length: i32)
        -> Result<Vec<FrameInfo>, JdwpError>;

    /// Locals in scope at the frame's current code index, ordered by JVM slot.
    fn visible_variables(&self, frame: &FrameInfo) -> Result<Vec<LocalVariable>, JdwpError>;

    /// Source line of the frame's current location, if the method has a line table.
    fn frame_line(&self, frame: &FrameInfo) -> Result<Option<u32>, JdwpError>;

    /// `StackFrame.GetValues`: one request for every slot, one reply.
    ///
    /// The reply is returned as decoded; callers validate the value count.
    fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[SlotRequest],
    ) -> Result<Vec<JdwpValue>, JdwpError>;

    fn array_length(&self, array_id: ObjectId) -> Result<usize, JdwpError>;

    fn array_get_values(
        &self,
        array_id: ObjectId,
        first_index: usize,
        length: usize,
    ) -> Result<Vec<JdwpValue>, JdwpError>;

    fn string_value(&self, string_id: ObjectId) -> Result<String, JdwpError>;

    /// Runtime type of an object in Java source form (`java.util.ArrayList`, `int[]`).
    fn reference_type_name(&self, object_id: ObjectId) -> Result<String, JdwpError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_sizes_reject_zero_and_oversized_ids() {
        assert!(JdwpIdSizes::default().is_valid());
        assert!(!JdwpIdSizes {
            object_id: 0,
            ..JdwpIdSizes::default()
        }
        .is_valid());
        assert!(!JdwpIdSizes {
            frame_id: 16,
            ..JdwpIdSizes::default()
        }
        .is_valid());
    }

    #[test]
    fn variable_visibility_is_half_open() {
        let var = VariableInfo {
            code_index: 4,
            name: "i".to_string(),
            signature: "I".to_string(),
            length: 6,
            slot: 1,
        };
        assert!(!var.is_visible_at(3));
        assert!(var.is_visible_at(4));
        assert!(var.is_visible_at(9));
        assert!(!var.is_visible_at(10));
    }

    #[test]
    fn packet_length_limits() {
        assert!(validate_jdwp_packet_length(JDWP_HEADER_LEN).is_ok());
        assert_eq!(
            validate_jdwp_packet_length(JDWP_HEADER_LEN - 1),
            Err(format!("invalid packet length {}", JDWP_HEADER_LEN - 1))
        );
        assert!(validate_jdwp_packet_length(MAX_JDWP_PACKET_BYTES + 1).is_err());
    }

    #[test]
    fn connection_failures_are_classified() {
        assert!(JdwpError::Timeout.is_connection_failure());
        assert!(JdwpError::ConnectionClosed.is_connection_failure());
        assert!(!JdwpError::CommandFailed { error_code: 20 }.is_connection_failure());
        assert!(!JdwpError::Protocol("bad".into()).is_connection_failure());
    }
}

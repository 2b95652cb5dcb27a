//! A scripted JDWP server for tests.
//!
//! It speaks the real wire protocol over a loopback socket but only implements
//! the inspection commands `stackwatch` issues. The VM state is fixed at spawn
//! time; `StackFrame.GetValues` replies with the frame's configured values
//! regardless of how many slots were requested, which lets tests provoke
//! count mismatches.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::codec::{encode_command, encode_reply, read_packet, JdwpReader, JdwpWriter, Packet, HANDSHAKE};
use crate::poison::lock_recovering;
use crate::{
    is_primitive_tag, FrameId, JdwpError, JdwpIdSizes, JdwpValue, MethodId, ObjectId,
    ReferenceTypeId, SlotRequest, ThreadId, ERROR_ABSENT_INFORMATION, ERROR_INVALID_OBJECT,
};

const ERROR_INVALID_FRAMEID: u16 = 30;
const ERROR_NOT_IMPLEMENTED: u16 = 99;
const MOCK_CLASS_ID: ReferenceTypeId = 0x3000;
/// Object type ids are derived from object ids so `ReferenceType.Signature`
/// can find the object again.
const TYPE_ID_BASE: ReferenceTypeId = 1 << 40;

#[derive(Clone, Debug)]
pub struct MockVmVariable {
    pub name: String,
    pub signature: String,
    pub slot: u32,
    pub code_index: u64,
    pub length: u32,
}

impl MockVmVariable {
    pub fn new(name: &str, signature: &str, slot: u32, code_index: u64, length: u32) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            slot,
            code_index,
            length,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockVmFrame {
    pub frame_id: FrameId,
    pub code_index: u64,
    /// `None` makes `Method.LineTable` fail with `ABSENT_INFORMATION`.
    pub line_table: Option<Vec<(u64, u32)>>,
    pub arg_count: u32,
    pub variables: Vec<MockVmVariable>,
    /// Reply body of `StackFrame.GetValues`, sent verbatim.
    pub values: Vec<JdwpValue>,
}

#[derive(Clone, Debug)]
pub struct MockVmArray {
    pub signature: String,
    pub element_tag: u8,
    pub values: Vec<JdwpValue>,
}

impl MockVmArray {
    pub fn ints(values: impl IntoIterator<Item = i32>) -> Self {
        Self {
            signature: "[I".to_string(),
            element_tag: b'I',
            values: values.into_iter().map(JdwpValue::Int).collect(),
        }
    }

    pub fn objects(values: Vec<JdwpValue>) -> Self {
        Self {
            signature: "[Ljava/lang/Object;".to_string(),
            element_tag: b'L',
            values,
        }
    }

    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = signature.to_string();
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockVm {
    pub id_sizes: JdwpIdSizes,
    pub frames: HashMap<ThreadId, Vec<MockVmFrame>>,
    pub arrays: HashMap<ObjectId, MockVmArray>,
    pub strings: HashMap<ObjectId, String>,
    /// Plain objects keyed by id, mapped to their class signature.
    pub objects: HashMap<ObjectId, String>,
    reply_delays: Vec<(u8, u8, Duration)>,
    breakpoints_before_reply: Vec<(u8, u8, ThreadId)>,
}

impl MockVm {
    pub fn with_frame(mut self, thread: ThreadId, frame: MockVmFrame) -> Self {
        self.frames.entry(thread).or_default().push(frame);
        self
    }

    pub fn with_array(mut self, id: ObjectId, array: MockVmArray) -> Self {
        self.arrays.insert(id, array);
        self
    }

    pub fn with_string(mut self, id: ObjectId, value: &str) -> Self {
        self.strings.insert(id, value.to_string());
        self
    }

    pub fn with_object(mut self, id: ObjectId, signature: &str) -> Self {
        self.objects.insert(id, signature.to_string());
        self
    }

    /// Sleep before answering `(command_set, command)`.
    pub fn with_reply_delay(mut self, command_set: u8, command: u8, delay: Duration) -> Self {
        self.reply_delays.push((command_set, command, delay));
        self
    }

    /// Emit a breakpoint event for `thread` just before replying to `(command_set, command)`.
    pub fn with_breakpoint_before_reply(mut self, command_set: u8, command: u8, thread: ThreadId) -> Self {
        self.breakpoints_before_reply.push((command_set, command, thread));
        self
    }

    fn frame_by_id(&self, frame_id: FrameId) -> Option<&MockVmFrame> {
        self.frames
            .values()
            .flatten()
            .find(|frame| frame.frame_id == frame_id)
    }

    fn frame_by_method(&self, method_id: MethodId) -> Option<&MockVmFrame> {
        // Each frame runs its own method; the method id is the frame id.
        self.frame_by_id(method_id)
    }

    fn signature_of(&self, object_id: ObjectId) -> Option<(u8, String)> {
        if let Some(array) = self.arrays.get(&object_id) {
            return Some((3, array.signature.clone()));
        }
        if self.strings.contains_key(&object_id) {
            return Some((1, "Ljava/lang/String;".to_string()));
        }
        self.objects.get(&object_id).map(|sig| (1, sig.clone()))
    }
}

struct State {
    vm: MockVm,
    get_values_requests: Mutex<Vec<Vec<SlotRequest>>>,
    next_event_packet_id: AtomicU32,
    shutdown: AtomicBool,
}

pub struct MockJdwpServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockJdwpServer {
    pub fn spawn(vm: MockVm) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State {
            vm,
            get_values_requests: Mutex::new(Vec::new()),
            next_event_packet_id: AtomicU32::new(0x4000_0000),
            shutdown: AtomicBool::new(false),
        });

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_state.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                let state = accept_state.clone();
                thread::spawn(move || {
                    if let Err(err) = serve(stream, &state) {
                        tracing::debug!(target: "stackwatch.jdwp", error = %err, "mock JDWP connection ended");
                    }
                });
            }
        });

        Ok(Self { addr, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Slots of every `StackFrame.GetValues` request received so far.
    pub fn get_values_requests(&self) -> Vec<Vec<SlotRequest>> {
        lock_recovering(&self.state.get_values_requests, "mock get_values requests").clone()
    }
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the flag.
        if let Ok(stream) = TcpStream::connect(self.addr) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn serve(mut stream: TcpStream, state: &State) -> Result<(), JdwpError> {
    let mut hs = [0u8; HANDSHAKE.len()];
    stream.read_exact(&mut hs)?;
    if hs != HANDSHAKE {
        return Err(JdwpError::HandshakeFailed);
    }
    stream.write_all(HANDSHAKE)?;
    stream.flush()?;

    loop {
        let packet = match read_packet(&mut stream) {
            Ok(packet) => packet,
            Err(JdwpError::Io(err))
                if matches!(
                    err.kind(),
                    io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if state.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let Packet::Command {
            id,
            command_set,
            command,
            data,
        } = packet
        else {
            return Err(JdwpError::Protocol("unexpected reply packet from client".into()));
        };

        let reply = match handle_command(state, command_set, command, &data) {
            Ok(payload) => encode_reply(id, 0, &payload),
            Err(error_code) => encode_reply(id, error_code, &[]),
        };

        for (set, cmd, delay) in &state.vm.reply_delays {
            if (*set, *cmd) == (command_set, command) {
                thread::sleep(*delay);
            }
        }
        for (set, cmd, thread_id) in &state.vm.breakpoints_before_reply {
            if (*set, *cmd) == (command_set, command) {
                stream.write_all(&breakpoint_event(state, *thread_id))?;
            }
        }
        stream.write_all(&reply)?;
        stream.flush()?;
    }
}

fn breakpoint_event(state: &State, thread_id: ThreadId) -> Vec<u8> {
    let sizes = &state.vm.id_sizes;
    let mut w = JdwpWriter::new();
    w.write_u8(2); // SuspendPolicy.ALL
    w.write_u32(1);
    w.write_u8(2); // EventKind.BREAKPOINT
    w.write_i32(1);
    w.write_object_id(thread_id, sizes);
    let frame = state
        .vm
        .frames
        .get(&thread_id)
        .and_then(|frames| frames.first())
        .cloned()
        .unwrap_or_default();
    w.write_location(&location_of(&frame), sizes);
    let id = state.next_event_packet_id.fetch_add(1, Ordering::Relaxed);
    encode_command(id, 64, 100, &w.into_vec())
}

fn location_of(frame: &MockVmFrame) -> crate::Location {
    crate::Location {
        type_tag: 1,
        class_id: MOCK_CLASS_ID,
        method_id: frame.frame_id,
        index: frame.code_index,
    }
}

fn handle_command(state: &State, command_set: u8, command: u8, data: &[u8]) -> Result<Vec<u8>, u16> {
    let vm = &state.vm;
    let sizes = &vm.id_sizes;
    let mut r = JdwpReader::new(data);
    let mut w = JdwpWriter::new();
    // Malformed requests are answered like the VM does for unknown ids.
    let bad = |_: JdwpError| ERROR_NOT_IMPLEMENTED;

    match (command_set, command) {
        // VirtualMachine.IDSizes
        (1, 7) => {
            for size in [
                sizes.field_id,
                sizes.method_id,
                sizes.object_id,
                sizes.reference_type_id,
                sizes.frame_id,
            ] {
                w.write_u32(size as u32);
            }
        }
        // ReferenceType.Signature
        (2, 1) => {
            let type_id = r.read_id(sizes.reference_type_id).map_err(bad)?;
            let (_, signature) = type_id
                .checked_sub(TYPE_ID_BASE)
                .and_then(|object_id| vm.signature_of(object_id))
                .ok_or(ERROR_INVALID_OBJECT)?;
            w.write_string(&signature);
        }
        // Method.LineTable
        (6, 1) => {
            let _type_id = r.read_id(sizes.reference_type_id).map_err(bad)?;
            let method_id = r.read_id(sizes.method_id).map_err(bad)?;
            let frame = vm.frame_by_method(method_id).ok_or(ERROR_INVALID_OBJECT)?;
            let table = frame.line_table.as_ref().ok_or(ERROR_ABSENT_INFORMATION)?;
            w.write_u64(0);
            w.write_u64(table.iter().map(|(index, _)| *index).max().unwrap_or(0));
            w.write_u32(table.len() as u32);
            for (index, line) in table {
                w.write_u64(*index);
                w.write_i32(*line as i32);
            }
        }
        // Method.VariableTable
        (6, 2) => {
            let _type_id = r.read_id(sizes.reference_type_id).map_err(bad)?;
            let method_id = r.read_id(sizes.method_id).map_err(bad)?;
            let frame = vm.frame_by_method(method_id).ok_or(ERROR_INVALID_OBJECT)?;
            w.write_u32(frame.arg_count);
            w.write_u32(frame.variables.len() as u32);
            for var in &frame.variables {
                w.write_u64(var.code_index);
                w.write_string(&var.name);
                w.write_string(&var.signature);
                w.write_u32(var.length);
                w.write_u32(var.slot);
            }
        }
        // ObjectReference.ReferenceType
        (9, 1) => {
            let object_id = r.read_object_id(sizes).map_err(bad)?;
            let (ref_type_tag, _) = vm.signature_of(object_id).ok_or(ERROR_INVALID_OBJECT)?;
            w.write_u8(ref_type_tag);
            w.write_id(TYPE_ID_BASE + object_id, sizes.reference_type_id);
        }
        // StringReference.Value
        (10, 1) => {
            let object_id = r.read_object_id(sizes).map_err(bad)?;
            let value = vm.strings.get(&object_id).ok_or(ERROR_INVALID_OBJECT)?;
            w.write_string(value);
        }
        // ThreadReference.Frames
        (11, 6) => {
            let thread = r.read_object_id(sizes).map_err(bad)?;
            let start = r.read_i32().map_err(bad)?.max(0) as usize;
            let length = r.read_i32().map_err(bad)?;
            let frames = vm.frames.get(&thread).map(Vec::as_slice).unwrap_or_default();
            let end = if length < 0 {
                frames.len()
            } else {
                (start + length as usize).min(frames.len())
            };
            let selected = frames.get(start..end).unwrap_or_default();
            w.write_u32(selected.len() as u32);
            for frame in selected {
                w.write_id(frame.frame_id, sizes.frame_id);
                w.write_location(&location_of(frame), sizes);
            }
        }
        // ArrayReference.Length
        (13, 1) => {
            let object_id = r.read_object_id(sizes).map_err(bad)?;
            let array = vm.arrays.get(&object_id).ok_or(ERROR_INVALID_OBJECT)?;
            w.write_i32(array.values.len() as i32);
        }
        // ArrayReference.GetValues
        (13, 2) => {
            let object_id = r.read_object_id(sizes).map_err(bad)?;
            let first = r.read_i32().map_err(bad)?.max(0) as usize;
            let length = r.read_i32().map_err(bad)?.max(0) as usize;
            let array = vm.arrays.get(&object_id).ok_or(ERROR_INVALID_OBJECT)?;
            let values = array
                .values
                .get(first..first + length)
                .ok_or(ERROR_INVALID_OBJECT)?;
            w.write_u8(array.element_tag);
            w.write_u32(values.len() as u32);
            for value in values {
                if is_primitive_tag(array.element_tag) {
                    w.write_value(value, sizes);
                } else {
                    w.write_tagged_value(value, sizes);
                }
            }
        }
        // StackFrame.GetValues
        (16, 1) => {
            let _thread = r.read_object_id(sizes).map_err(bad)?;
            let frame_id = r.read_id(sizes.frame_id).map_err(bad)?;
            let count = r.read_u32().map_err(bad)? as usize;
            let mut slots = Vec::with_capacity(count);
            for _ in 0..count {
                slots.push(SlotRequest {
                    slot: r.read_u32().map_err(bad)?,
                    tag: r.read_u8().map_err(bad)?,
                });
            }
            lock_recovering(&state.get_values_requests, "mock get_values requests").push(slots);

            let frame = vm.frame_by_id(frame_id).ok_or(ERROR_INVALID_FRAMEID)?;
            w.write_u32(frame.values.len() as u32);
            for value in &frame.values {
                w.write_tagged_value(value, sizes);
            }
        }
        _ => return Err(ERROR_NOT_IMPLEMENTED),
    }

    Ok(w.into_vec())
}

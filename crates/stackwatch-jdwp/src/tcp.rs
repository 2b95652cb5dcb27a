use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use crate::codec::{encode_command, read_packet, JdwpReader, JdwpWriter, Packet, HANDSHAKE};
use crate::poison::lock_recovering;
use crate::{
    signature_to_type_name, FrameId, FrameInfo, JdwpClient, JdwpError, JdwpEvent, JdwpIdSizes,
    JdwpValue, LocalVariable, MethodId, ObjectId, ReferenceTypeId, SlotRequest, ThreadId,
    VariableInfo, ERROR_ABSENT_INFORMATION, ERROR_INVALID_OBJECT, JDWP_HEADER_LEN,
    MAX_JDWP_PACKET_BYTES,
};

const EVENT_KIND_SINGLE_STEP: u8 = 1;
const EVENT_KIND_BREAKPOINT: u8 = 2;
const EVENT_KIND_VM_START: u8 = 90;
const EVENT_KIND_VM_DEATH: u8 = 99;

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub connect_timeout: Duration,
    /// Deadline for a single reply. Expiry surfaces as [`JdwpError::Timeout`]
    /// and leaves the connection unusable.
    pub reply_timeout: Duration,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// Blocking JDWP client over TCP.
///
/// Every command holds the channel lock from the moment its packet is written
/// until the matching reply has been read, so exchanges issued from different
/// threads never interleave on the wire.
pub struct TcpJdwpClient {
    channel: Mutex<Channel>,
    id_sizes: JdwpIdSizes,
    cache: Mutex<Cache>,
    pending_events: Mutex<VecDeque<JdwpEvent>>,
}

struct Channel {
    stream: Option<TcpStream>,
    next_packet_id: u32,
}

impl Channel {
    fn next_id(&mut self) -> u32 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        id
    }

    /// Send one command and wait for its reply.
    ///
    /// Any error from the exchange itself leaves the stream in an unknown
    /// position, so the stream is dropped and later calls fail fast with
    /// [`JdwpError::NotConnected`].
    fn exchange(
        &mut self,
        command_set: u8,
        command: u8,
        data: &[u8],
        commands: &mut Vec<(u8, u8, Vec<u8>)>,
    ) -> Result<(u16, Vec<u8>), JdwpError> {
        let id = self.next_id();
        let stream = self.stream.as_mut().ok_or(JdwpError::NotConnected)?;
        match exchange_on(stream, id, command_set, command, data, commands) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                tracing::warn!(
                    target: "stackwatch.jdwp",
                    command_set,
                    command,
                    error = %err,
                    "JDWP exchange failed; closing connection"
                );
                self.stream = None;
                Err(err)
            }
        }
    }
}

fn exchange_on(
    stream: &mut TcpStream,
    id: u32,
    command_set: u8,
    command: u8,
    data: &[u8],
    commands: &mut Vec<(u8, u8, Vec<u8>)>,
) -> Result<(u16, Vec<u8>), JdwpError> {
    if JDWP_HEADER_LEN.saturating_add(data.len()) > MAX_JDWP_PACKET_BYTES {
        return Err(JdwpError::Protocol(format!(
            "packet too large ({} bytes, max {MAX_JDWP_PACKET_BYTES})",
            JDWP_HEADER_LEN.saturating_add(data.len())
        )));
    }

    let packet = encode_command(id, command_set, command, data);
    stream.write_all(&packet).map_err(map_io_error)?;
    stream.flush().map_err(map_io_error)?;

    loop {
        match read_packet(stream).map_err(|err| match err {
            JdwpError::Io(io) => map_io_error(io),
            other => other,
        })? {
            Packet::Reply {
                id: reply_id,
                error_code,
                data,
            } => {
                if reply_id != id {
                    return Err(JdwpError::Protocol(format!(
                        "unexpected reply id {reply_id}, expected {id}"
                    )));
                }
                return Ok((error_code, data));
            }
            Packet::Command {
                command_set,
                command,
                data,
                ..
            } => {
                // The VM delivers events as command packets; they can arrive
                // between our request and its reply.
                commands.push((command_set, command, data));
            }
        }
    }
}

fn map_io_error(err: io::Error) -> JdwpError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => JdwpError::Timeout,
        io::ErrorKind::UnexpectedEof => JdwpError::ConnectionClosed,
        _ => JdwpError::Io(err),
    }
}

#[derive(Debug, Default)]
struct Cache {
    signatures: HashMap<ReferenceTypeId, String>,
    line_tables: HashMap<(ReferenceTypeId, MethodId), Option<Vec<(u64, u32)>>>,
    variable_tables: HashMap<(ReferenceTypeId, MethodId), Option<VariableTable>>,
}

#[derive(Debug, Clone)]
struct VariableTable {
    arg_count: u32,
    variables: Vec<VariableInfo>,
}

impl TcpJdwpClient {
    pub fn connect(host: &str, port: u16) -> Result<Self, JdwpError> {
        Self::connect_with_config(host, port, JdwpClientConfig::default())
    }

    pub fn connect_with_config(
        host: &str,
        port: u16,
        config: JdwpClientConfig,
    ) -> Result<Self, JdwpError> {
        let mut unique = BTreeSet::new();
        for addr in (host, port).to_socket_addrs()? {
            unique.insert(addr);
        }

        // `SocketAddr` orders IPv4 before IPv6, so `localhost` prefers `127.0.0.1`.
        // Still try every candidate in case the debuggee only listens on one family.
        let addrs: Vec<SocketAddr> = unique.into_iter().collect();
        let mut last_err = None;
        for addr in addrs {
            match Self::connect_addr(addr, &config) {
                Ok(client) => return Ok(client),
                Err(err) => {
                    tracing::debug!(target: "stackwatch.jdwp", %addr, error = %err, "JDWP connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid JDWP address").into()
        }))
    }

    fn connect_addr(addr: SocketAddr, config: &JdwpClientConfig) -> Result<Self, JdwpError> {
        let mut stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
        let _ = stream.set_nodelay(true);
        stream.set_read_timeout(Some(config.reply_timeout))?;
        stream.set_write_timeout(Some(config.reply_timeout))?;

        stream.write_all(HANDSHAKE).map_err(map_io_error)?;
        stream.flush().map_err(map_io_error)?;
        let mut reply = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut reply).map_err(map_io_error)?;
        if reply != HANDSHAKE {
            return Err(JdwpError::HandshakeFailed);
        }

        let mut channel = Channel {
            stream: Some(stream),
            next_packet_id: 1,
        };
        let mut commands = Vec::new();
        // VirtualMachine.IDSizes
        let (error_code, payload) = channel.exchange(1, 7, &[], &mut commands)?;
        if error_code != 0 {
            return Err(JdwpError::CommandFailed { error_code });
        }
        let mut r = JdwpReader::new(&payload);
        let id_sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        tracing::debug!(target: "stackwatch.jdwp", %addr, ?id_sizes, "JDWP connected");

        let client = Self {
            channel: Mutex::new(channel),
            id_sizes,
            cache: Mutex::new(Cache::default()),
            pending_events: Mutex::new(VecDeque::new()),
        };
        client.queue_commands(commands);
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        lock_recovering(&self.channel, "jdwp channel")
            .stream
            .is_some()
    }

    /// Drop the socket. Subsequent commands fail with [`JdwpError::NotConnected`].
    pub fn close(&self) {
        lock_recovering(&self.channel, "jdwp channel").stream = None;
    }

    /// Events received while commands were waiting for their replies.
    pub fn take_pending_events(&self) -> Vec<JdwpEvent> {
        lock_recovering(&self.pending_events, "jdwp pending events")
            .drain(..)
            .collect()
    }

    fn send_command(&self, command_set: u8, command: u8, data: &[u8]) -> Result<Vec<u8>, JdwpError> {
        let mut commands = Vec::new();
        let result = {
            let mut channel = lock_recovering(&self.channel, "jdwp channel");
            channel.exchange(command_set, command, data, &mut commands)
        };
        self.queue_commands(commands);

        let (error_code, payload) = result?;
        if error_code != 0 {
            tracing::debug!(target: "stackwatch.jdwp", command_set, command, error_code, "JDWP command failed");
            return Err(JdwpError::CommandFailed { error_code });
        }
        Ok(payload)
    }

    fn send_object_command(
        &self,
        command_set: u8,
        command: u8,
        object_id: ObjectId,
        data: &[u8],
    ) -> Result<Vec<u8>, JdwpError> {
        match self.send_command(command_set, command, data) {
            Err(JdwpError::CommandFailed { error_code }) if error_code == ERROR_INVALID_OBJECT => {
                Err(JdwpError::InvalidObjectId(object_id))
            }
            other => other,
        }
    }

    fn queue_commands(&self, commands: Vec<(u8, u8, Vec<u8>)>) {
        if commands.is_empty() {
            return;
        }
        let mut events = Vec::new();
        for (command_set, command, data) in commands {
            if command_set == 64 && command == 100 {
                if let Err(err) = parse_composite_event(&data, &self.id_sizes, &mut events) {
                    tracing::warn!(target: "stackwatch.jdwp", error = %err, "dropping malformed composite event");
                }
            } else {
                tracing::debug!(target: "stackwatch.jdwp", command_set, command, "ignoring VM command packet");
            }
        }
        lock_recovering(&self.pending_events, "jdwp pending events").extend(events);
    }


    fn reference_type_signature(&self, type_id: ReferenceTypeId) -> Result<String, JdwpError> {
        if let Some(sig) = lock_recovering(&self.cache, "jdwp cache").signatures.get(&type_id) {
            return Ok(sig.clone());
        }

        let mut w = JdwpWriter::new();
        w.write_id(type_id, self.id_sizes.reference_type_id);
        // ReferenceType.Signature
        let payload = self.send_command(2, 1, &w.into_vec())?;
        let sig = JdwpReader::new(&payload).read_string()?;
        lock_recovering(&self.cache, "jdwp cache")
            .signatures
            .insert(type_id, sig.clone());
        Ok(sig)
    }

    fn variable_table(
        &self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Option<VariableTable>, JdwpError> {
        if let Some(table) = lock_recovering(&self.cache, "jdwp cache")
            .variable_tables
            .get(&(type_id, method_id))
        {
            return Ok(table.clone());
        }

        let mut w = JdwpWriter::new();
        w.write_id(type_id, self.id_sizes.reference_type_id);
        w.write_id(method_id, self.id_sizes.method_id);
        // Method.VariableTable
        let table = match self.send_command(6, 2, &w.into_vec()) {
            Ok(payload) => {
                let mut r = JdwpReader::new(&payload);
                let arg_count = r.read_u32()?;
                let count = r.read_count(24)?;
                let mut variables = Vec::with_capacity(count);
                for _ in 0..count {
                    variables.push(VariableInfo {
                        code_index: r.read_u64()?,
                        name: r.read_string()?,
                        signature: r.read_string()?,
                        length: r.read_u32()?,
                        slot: r.read_u32()?,
                    });
                }
                Some(VariableTable {
                    arg_count,
                    variables,
                })
            }
            Err(JdwpError::CommandFailed { error_code }) if error_code == ERROR_ABSENT_INFORMATION => {
                None
            }
            Err(err) => return Err(err),
        };

        lock_recovering(&self.cache, "jdwp cache")
            .variable_tables
            .insert((type_id, method_id), table.clone());
        Ok(table)
    }

    fn line_table(
        &self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Option<Vec<(u64, u32)>>, JdwpError> {
        if let Some(table) = lock_recovering(&self.cache, "jdwp cache")
            .line_tables
            .get(&(type_id, method_id))
        {
            return Ok(table.clone());
        }

        let mut w = JdwpWriter::new();
        w.write_id(type_id, self.id_sizes.reference_type_id);
        w.write_id(method_id, self.id_sizes.method_id);
        // Method.LineTable
        let table = match self.send_command(6, 1, &w.into_vec()) {
            Ok(payload) => {
                let mut r = JdwpReader::new(&payload);
                let _start = r.read_u64()?;
                let _end = r.read_u64()?;
                let count = r.read_count(12)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let code_index = r.read_u64()?;
                    let line = r.read_i32()?;
                    entries.push((code_index, line.max(0) as u32));
                }
                Some(entries)
            }
            Err(JdwpError::CommandFailed { error_code }) if error_code == ERROR_ABSENT_INFORMATION => {
                None
            }
            Err(err) => return Err(err),
        };

        lock_recovering(&self.cache, "jdwp cache")
            .line_tables
            .insert((type_id, method_id), table.clone());
        Ok(table)
    }
}

impl JdwpClient for TcpJdwpClient {
    fn id_sizes(&self) -> Result<JdwpIdSizes, JdwpError> {
        if !self.is_connected() {
            return Err(JdwpError::NotConnected);
        }
        Ok(self.id_sizes)
    }

    fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>, JdwpError> {
        let sizes = &self.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, sizes);
        w.write_i32(start);
        w.write_i32(length);
        // ThreadReference.Frames
        let payload = self.send_command(11, 6, &w.into_vec())?;
        let mut r = JdwpReader::new(&payload);
        let frame_len = sizes.frame_id + 1 + sizes.reference_type_id + sizes.method_id + 8;
        let count = r.read_count(frame_len)?;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id: FrameId = r.read_id(sizes.frame_id)?;
            let location = r.read_location(sizes)?;
            frames.push(FrameInfo {
                thread,
                frame_id,
                location,
            });
        }
        Ok(frames)
    }

    fn visible_variables(&self, frame: &FrameInfo) -> Result<Vec<LocalVariable>, JdwpError> {
        let loc = frame.location;
        let Some(table) = self.variable_table(loc.class_id, loc.method_id)? else {
            tracing::debug!(target: "stackwatch.jdwp", frame_id = frame.frame_id, "method has no variable table");
            return Ok(Vec::new());
        };

        // A name can be declared more than once in disjoint or nested scopes;
        // the innermost (latest starting) declaration hides the others.
        let mut by_name: HashMap<&str, &VariableInfo> = HashMap::new();
        for var in table.variables.iter().filter(|v| v.is_visible_at(loc.index)) {
            match by_name.get(var.name.as_str()) {
                Some(existing) if existing.code_index >= var.code_index => {}
                _ => {
                    by_name.insert(var.name.as_str(), var);
                }
            }
        }

        let mut visible: Vec<&VariableInfo> = by_name.into_values().collect();
        visible.sort_by_key(|v| (v.slot, v.code_index));
        Ok(visible
            .into_iter()
            .map(|v| LocalVariable {
                name: v.name.clone(),
                signature: v.signature.clone(),
                jvm_slot: v.slot,
                is_argument: v.slot < table.arg_count,
            })
            .collect())
    }

    fn frame_line(&self, frame: &FrameInfo) -> Result<Option<u32>, JdwpError> {
        let loc = frame.location;
        let table = self.line_table(loc.class_id, loc.method_id)?;
        Ok(table.and_then(|table| line_for_index(&table, loc.index)))
    }

    fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[SlotRequest],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let sizes = &self.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(slots.len() as u32);
        for request in slots {
            w.write_u32(request.slot);
            w.write_u8(request.tag);
        }

        tracing::debug!(target: "stackwatch.jdwp", thread, frame_id, slots = slots.len(), "StackFrame.GetValues");
        // StackFrame.GetValues
        let payload = self.send_command(16, 1, &w.into_vec())?;
        let mut r = JdwpReader::new(&payload);
        // Each value carries at least its tag byte, `void` included.
        let count = r.read_count(1)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(r.read_tagged_value(sizes)?);
        }
        Ok(values)
    }

    fn array_length(&self, array_id: ObjectId) -> Result<usize, JdwpError> {
        let mut w = JdwpWriter::new();
        w.write_object_id(array_id, &self.id_sizes);
        // ArrayReference.Length
        let payload = self.send_object_command(13, 1, array_id, &w.into_vec())?;
        let length = JdwpReader::new(&payload).read_i32()?;
        usize::try_from(length)
            .map_err(|_| JdwpError::Protocol(format!("negative array length {length}")))
    }

    fn array_get_values(
        &self,
        array_id: ObjectId,
        first_index: usize,
        length: usize,
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let to_i32 = |v: usize| {
            i32::try_from(v).map_err(|_| JdwpError::Protocol(format!("array index {v} out of range")))
        };
        let mut w = JdwpWriter::new();
        w.write_object_id(array_id, &self.id_sizes);
        w.write_i32(to_i32(first_index)?);
        w.write_i32(to_i32(length)?);
        // ArrayReference.GetValues
        let payload = self.send_object_command(13, 2, array_id, &w.into_vec())?;
        JdwpReader::new(&payload).read_array_region(&self.id_sizes)
    }

    fn string_value(&self, string_id: ObjectId) -> Result<String, JdwpError> {
        let mut w = JdwpWriter::new();
        w.write_object_id(string_id, &self.id_sizes);
        // StringReference.Value
        let payload = self.send_object_command(10, 1, string_id, &w.into_vec())?;
        JdwpReader::new(&payload).read_string()
    }

    fn reference_type_name(&self, object_id: ObjectId) -> Result<String, JdwpError> {
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &self.id_sizes);
        // ObjectReference.ReferenceType
        let payload = self.send_object_command(9, 1, object_id, &w.into_vec())?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        let type_id = r.read_id(self.id_sizes.reference_type_id)?;
        let signature = self.reference_type_signature(type_id)?;
        Ok(signature_to_type_name(&signature))
    }
}

/// Decode the events of a `Event.Composite` command packet into `out`.
///
/// Decoding stops at the first event kind whose layout is unknown.
fn parse_composite_event(
    data: &[u8],
    sizes: &JdwpIdSizes,
    out: &mut Vec<JdwpEvent>,
) -> Result<(), JdwpError> {
    let mut r = JdwpReader::new(data);
    let _suspend_policy = r.read_u8()?;
    let count = r.read_count(5)?;
    for _ in 0..count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        match kind {
            EVENT_KIND_SINGLE_STEP | EVENT_KIND_BREAKPOINT => {
                let thread = r.read_object_id(sizes)?;
                let location = r.read_location(sizes)?;
                out.push(if kind == EVENT_KIND_BREAKPOINT {
                    JdwpEvent::Breakpoint {
                        request_id,
                        thread,
                        location,
                    }
                } else {
                    JdwpEvent::SingleStep {
                        request_id,
                        thread,
                        location,
                    }
                });
            }
            EVENT_KIND_VM_START => {
                let thread = r.read_object_id(sizes)?;
                out.push(JdwpEvent::VmStart { request_id, thread });
            }
            EVENT_KIND_VM_DEATH => out.push(JdwpEvent::VmDeath),
            // The layout of other kinds is not decoded; the rest of the
            // composite cannot be located.
            _ => break,
        }
    }
    Ok(())
}

fn line_for_index(table: &[(u64, u32)], index: u64) -> Option<u32> {
    // Choose the last entry whose code index is <= index.
    table
        .iter()
        .filter(|(code_index, _)| *code_index <= index)
        .max_by_key(|(code_index, _)| *code_index)
        .map(|(_, line)| *line)
        .or_else(|| table.first().map(|(_, line)| *line))
}

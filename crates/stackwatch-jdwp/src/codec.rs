use std::io::Read;

use crate::{
    is_primitive_tag, validate_jdwp_packet_length, JdwpError, JdwpIdSizes, JdwpValue, Location,
    ObjectId, JDWP_HEADER_LEN,
};

pub(crate) const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub(crate) const FLAG_REPLY: u8 = 0x80;

type Result<T> = std::result::Result<T, JdwpError>;

/// Big-endian payload builder.
#[derive(Debug, Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        // JDWP strings are prefixed with their length in bytes.
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_id(&mut self, id: u64, size: usize) {
        let be = id.to_be_bytes();
        let start = be.len().saturating_sub(size);
        self.buf.extend_from_slice(&be[start..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_id(loc.class_id, sizes.reference_type_id);
        self.write_id(loc.method_id, sizes.method_id);
        self.write_u64(loc.index);
    }

    /// Untagged value body (the tag is written separately, if at all).
    pub fn write_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        match *v {
            JdwpValue::Void => {}
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_i64(v),
            JdwpValue::Float(v) => self.write_u32(v.to_bits()),
            JdwpValue::Double(v) => self.write_u64(v.to_bits()),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
        }
    }

    pub fn write_tagged_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(v.tag());
        self.write_value(v, sizes);
    }
}

/// Big-endian cursor over a reply payload.
pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| JdwpError::Protocol("unexpected end of packet".to_string()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// A `u32` element count, rejected when `count` elements of at least
    /// `min_element_len` bytes cannot fit in the rest of the payload.
    pub fn read_count(&mut self, min_element_len: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_element_len.max(1)) > self.remaining() {
            return Err(JdwpError::Protocol(format!(
                "count {count} exceeds remaining payload ({} bytes)",
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| {
            JdwpError::Protocol(format!("unable to allocate string buffer ({len} bytes)"))
        })?;
        out.extend_from_slice(bytes);
        Ok(String::from_utf8(out)?)
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("invalid id size: {size}")));
        }
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(self.take(size)?);
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_id(sizes.reference_type_id)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let v = match tag {
            b'V' => JdwpValue::Void,
            b'Z' => JdwpValue::Boolean(self.read_bool()?),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_i64()?),
            b'F' => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            // Every other tag (`L`, `[`, `s`, `t`, `g`, `l`, `c`) is an object id.
            _ => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
        };
        Ok(v)
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }

    /// An `arrayregion`: one element tag, a count, then the values. Primitive
    /// elements are untagged; object elements carry their own tag.
    pub fn read_array_region(&mut self, sizes: &JdwpIdSizes) -> Result<Vec<JdwpValue>> {
        let tag = self.read_u8()?;
        let element_len = match tag {
            b'V' => {
                return Err(JdwpError::Protocol(
                    "array region with void elements".to_string(),
                ))
            }
            b'Z' | b'B' => 1,
            b'C' | b'S' => 2,
            b'I' | b'F' => 4,
            b'J' | b'D' => 8,
            _ => 1 + sizes.object_id,
        };
        let count = self.read_count(element_len)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let value = if is_primitive_tag(tag) {
                self.read_value(tag, sizes)?
            } else {
                self.read_tagged_value(sizes)?
            };
            values.push(value);
        }
        Ok(values)
    }
}

#[derive(Debug)]
pub enum Packet {
    Reply {
        id: u32,
        error_code: u16,
        data: Vec<u8>,
    },
    Command {
        id: u32,
        command_set: u8,
        command: u8,
        data: Vec<u8>,
    },
}

pub fn read_packet(reader: &mut impl Read) -> Result<Packet> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let length = u32::from_be_bytes(len_buf) as usize;
    validate_jdwp_packet_length(length).map_err(JdwpError::Protocol)?;

    // Remainder of the fixed header:
    //   u32 id, u8 flags, u16 error_code | (u8 command_set, u8 command)
    let mut header = [0u8; JDWP_HEADER_LEN - 4];
    reader.read_exact(&mut header)?;
    let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let flags = header[4];

    let payload_len = length - JDWP_HEADER_LEN;
    let mut data = Vec::new();
    data.try_reserve_exact(payload_len).map_err(|_| {
        JdwpError::Protocol(format!(
            "unable to allocate packet buffer ({payload_len} bytes)"
        ))
    })?;
    data.resize(payload_len, 0);
    reader.read_exact(&mut data)?;

    if flags & FLAG_REPLY != 0 {
        Ok(Packet::Reply {
            id,
            error_code: u16::from_be_bytes([header[5], header[6]]),
            data,
        })
    } else {
        Ok(Packet::Command {
            id,
            command_set: header[5],
            command: header[6],
            data,
        })
    }
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = (JDWP_HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(0);
    out.push(command_set);
    out.push(command);
    out.extend_from_slice(payload);
    out
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let length = (JDWP_HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(FLAG_REPLY);
    out.extend_from_slice(&error_code.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_JDWP_PACKET_BYTES;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_reply_packet() {
        let packet = encode_reply(42, 0, b"ok");
        let mut cursor = std::io::Cursor::new(packet);
        match read_packet(&mut cursor).unwrap() {
            Packet::Reply {
                id,
                error_code,
                data,
            } => {
                assert_eq!(id, 42);
                assert_eq!(error_code, 0);
                assert_eq!(data, b"ok");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn read_packet_rejects_oversized_length_prefix_without_reading_rest() {
        let length = (MAX_JDWP_PACKET_BYTES + 1) as u32;
        let mut cursor = std::io::Cursor::new(length.to_be_bytes());

        match read_packet(&mut cursor).unwrap_err() {
            JdwpError::Protocol(msg) => assert!(msg.contains("exceeds maximum allowed")),
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }

    #[test]
    fn object_array_region_reads_tagged_elements() {
        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_u8(b'[');
        w.write_u32(2);
        w.write_tagged_value(&JdwpValue::Object { tag: b'[', id: 9 }, &sizes);
        w.write_tagged_value(&JdwpValue::null(), &sizes);
        let payload = w.into_vec();

        let values = JdwpReader::new(&payload).read_array_region(&sizes).unwrap();
        assert_eq!(
            values,
            vec![JdwpValue::Object { tag: b'[', id: 9 }, JdwpValue::null()]
        );
    }

    #[test]
    fn primitive_array_region_reads_untagged_elements() {
        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_u8(b'I');
        w.write_u32(3);
        for v in [1, 2, 3] {
            w.write_i32(v);
        }
        let payload = w.into_vec();

        let values = JdwpReader::new(&payload).read_array_region(&sizes).unwrap();
        assert_eq!(
            values,
            vec![JdwpValue::Int(1), JdwpValue::Int(2), JdwpValue::Int(3)]
        );
    }

    #[test]
    fn short_ids_are_sign_agnostic() {
        let mut w = JdwpWriter::new();
        w.write_id(0xABCD, 2);
        let payload = w.into_vec();
        assert_eq!(payload, vec![0xAB, 0xCD]);
        assert_eq!(JdwpReader::new(&payload).read_id(2).unwrap(), 0xABCD);
    }

    #[test]
    fn array_region_counts_are_bounded_by_payload() {
        let sizes = JdwpIdSizes::default();

        let mut w = JdwpWriter::new();
        w.write_u8(b'V');
        w.write_u32(u32::MAX);
        let payload = w.into_vec();
        let err = JdwpReader::new(&payload).read_array_region(&sizes).unwrap_err();
        assert!(matches!(err, JdwpError::Protocol(_)), "{err:?}");

        let mut w = JdwpWriter::new();
        w.write_u8(b'I');
        w.write_u32(1_000);
        w.write_i32(1);
        let payload = w.into_vec();
        let err = JdwpReader::new(&payload).read_array_region(&sizes).unwrap_err();
        assert!(
            matches!(&err, JdwpError::Protocol(msg) if msg.starts_with("count 1000 exceeds")),
            "{err:?}"
        );
    }

    #[test]
    fn counts_allow_exactly_fitting_payloads() {
        let mut w = JdwpWriter::new();
        w.write_u32(2);
        w.write_u8(b'V');
        w.write_u8(b'V');
        let payload = w.into_vec();
        let mut r = JdwpReader::new(&payload);
        assert_eq!(r.read_count(1).unwrap(), 2);

        let err = JdwpReader::new(&[0xFF, 0xFF, 0xFF, 0xFF, b'V'])
            .read_count(1)
            .unwrap_err();
        assert!(matches!(err, JdwpError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let err = JdwpReader::new(&[0, 0]).read_u32().unwrap_err();
        assert!(matches!(err, JdwpError::Protocol(msg) if msg == "unexpected end of packet"));
    }
}

use stackwatch_jdwp::{JdwpClient, JdwpError, JdwpValue, ObjectId, TAG_ARRAY, TAG_STRING};
use thiserror::Error;

use crate::config::DecodeConfig;

/// Elements requested per `ArrayReference.GetValues`. Even as tagged
/// 8-byte object ids a page stays far below the JDWP packet limit.
pub const ARRAY_PAGE_LEN: usize = 64 * 1024;

/// A value as read from a frame slot or array element.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RawValue {
    Null,
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(ObjectId),
    Array(ObjectId),
    /// Any other reference; `tag` is the JDWP tag (`L`, `t`, `c`, ...).
    Object { tag: u8, id: ObjectId },
}

impl From<JdwpValue> for RawValue {
    fn from(value: JdwpValue) -> Self {
        match value {
            JdwpValue::Void => Self::Void,
            JdwpValue::Boolean(v) => Self::Boolean(v),
            JdwpValue::Byte(v) => Self::Byte(v),
            JdwpValue::Char(v) => Self::Char(v),
            JdwpValue::Short(v) => Self::Short(v),
            JdwpValue::Int(v) => Self::Int(v),
            JdwpValue::Long(v) => Self::Long(v),
            JdwpValue::Float(v) => Self::Float(v),
            JdwpValue::Double(v) => Self::Double(v),
            JdwpValue::Object { id: 0, .. } => Self::Null,
            JdwpValue::Object { tag: TAG_STRING, id } => Self::String(id),
            JdwpValue::Object { tag: TAG_ARRAY, id } => Self::Array(id),
            JdwpValue::Object { tag, id } => Self::Object { tag, id },
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The value could not be rendered; decoding degrades to a fallback.
    #[error("{0}")]
    Unsupported(String),
    /// The connection is gone; the extraction cycle must abort.
    #[error(transparent)]
    Connection(JdwpError),
}

impl From<JdwpError> for DecodeError {
    fn from(err: JdwpError) -> Self {
        if err.is_connection_failure() {
            Self::Connection(err)
        } else {
            Self::Unsupported(err.to_string())
        }
    }
}

/// Renders raw values for display, expanding arrays element by element.
pub struct ValueFormatter<'a> {
    client: &'a dyn JdwpClient,
    config: &'a DecodeConfig,
}

impl<'a> ValueFormatter<'a> {
    pub fn new(client: &'a dyn JdwpClient, config: &'a DecodeConfig) -> Self {
        Self { client, config }
    }

    /// Display string for `value`.
    ///
    /// Values the VM cannot describe degrade to a placeholder; only connection
    /// failures are returned as errors.
    pub fn format(&self, value: &RawValue) -> Result<String, JdwpError> {
        self.format_at(value, &mut Vec::new())
    }

    /// `path` holds the arrays being expanded around `value`, outermost first.
    fn format_at(&self, value: &RawValue, path: &mut Vec<ObjectId>) -> Result<String, JdwpError> {
        match value {
            RawValue::Null => Ok(self.config.null_marker.clone()),
            RawValue::Array(id) if path.len() < self.config.max_depth && !path.contains(id) => {
                path.push(*id);
                let expanded = self.format_array(*id, path);
                path.pop();
                match expanded {
                    Ok(rendered) => Ok(rendered),
                    Err(DecodeError::Connection(err)) => Err(err),
                    Err(DecodeError::Unsupported(reason)) => {
                        tracing::warn!(
                            target: "stackwatch",
                            array_id = id,
                            %reason,
                            "array expansion failed; using default rendering"
                        );
                        self.format_default_or_placeholder(value)
                    }
                }
            }
            _ => self.format_default_or_placeholder(value),
        }
    }

    fn format_default_or_placeholder(&self, value: &RawValue) -> Result<String, JdwpError> {
        match self.format_default(value) {
            Ok(rendered) => Ok(rendered),
            Err(DecodeError::Connection(err)) => Err(err),
            Err(DecodeError::Unsupported(reason)) => {
                tracing::warn!(target: "stackwatch", ?value, %reason, "value unavailable");
                Ok(format!("<unavailable: {reason}>"))
            }
        }
    }

    /// Elements are read in pages of at most [`ARRAY_PAGE_LEN`] so no single
    /// reply outgrows the packet limit.
    fn format_array(&self, id: ObjectId, path: &mut Vec<ObjectId>) -> Result<String, DecodeError> {
        let length = self.client.array_length(id)?;

        let mut out = String::from("[");
        let mut first = 0;
        while first < length {
            let page_len = ARRAY_PAGE_LEN.min(length - first);
            let elements = self.client.array_get_values(id, first, page_len)?;
            if elements.len() != page_len {
                return Err(DecodeError::Unsupported(format!(
                    "array {id} returned {} of {page_len} elements at index {first}",
                    elements.len()
                )));
            }

            for (offset, element) in elements.into_iter().enumerate() {
                if first + offset > 0 {
                    out.push_str(", ");
                }
                let rendered = self
                    .format_at(&RawValue::from(element), path)
                    .map_err(DecodeError::Connection)?;
                out.push_str(&rendered);
            }
            first += page_len;
        }
        out.push(']');
        Ok(out)
    }

    /// Rendering used by the JVM debugger's `toString` of a value mirror.
    fn format_default(&self, value: &RawValue) -> Result<String, DecodeError> {
        Ok(match *value {
            RawValue::Null => self.config.null_marker.clone(),
            RawValue::Void => "<void value>".to_string(),
            RawValue::Boolean(v) => v.to_string(),
            RawValue::Byte(v) => v.to_string(),
            RawValue::Char(v) => java_char(v),
            RawValue::Short(v) => v.to_string(),
            RawValue::Int(v) => v.to_string(),
            RawValue::Long(v) => v.to_string(),
            RawValue::Float(v) => java_decimal(f64::from(v), v.to_string(), format!("{v:E}")),
            RawValue::Double(v) => java_decimal(v, v.to_string(), format!("{v:E}")),
            RawValue::String(id) => format!("\"{}\"", self.client.string_value(id)?),
            RawValue::Array(id) => {
                let type_name = self.client.reference_type_name(id)?;
                let length = self.client.array_length(id)?;
                // `int[][]` with length 3 prints as `int[3][]`.
                let sized = match type_name.find("[]") {
                    Some(at) => {
                        let mut sized = type_name.clone();
                        sized.replace_range(at..at + 2, &format!("[{length}]"));
                        sized
                    }
                    None => type_name,
                };
                format!("instance of {sized} (id={id})")
            }
            RawValue::Object { id, .. } => {
                let type_name = self.client.reference_type_name(id)?;
                format!("instance of {type_name}(id={id})")
            }
        })
    }
}

fn java_char(unit: u16) -> String {
    match char::from_u32(u32::from(unit)) {
        Some(c) => c.to_string(),
        // Lone surrogate.
        None => format!("\\u{unit:04x}"),
    }
}

/// Java's `Double.toString` layout: a mandatory fractional digit and
/// scientific notation outside `[1e-3, 1e7)`.
fn java_decimal(value: f64, plain: String, scientific: String) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }

    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-3..1e7).contains(&magnitude) {
        if let Some((mantissa, exponent)) = scientific.split_once('E') {
            if !mantissa.contains('.') {
                return format!("{mantissa}.0E{exponent}");
            }
        }
        return scientific;
    }
    if plain.contains('.') {
        plain
    } else {
        format!("{plain}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stackwatch_jdwp::{MockArray, MockCall, MockJdwpClient};

    fn render(client: &MockJdwpClient, value: RawValue) -> String {
        let config = DecodeConfig::default();
        ValueFormatter::new(client, &config).format(&value).unwrap()
    }

    fn int_array(values: &[i32]) -> MockArray {
        MockArray::new("int[]", values.iter().copied().map(JdwpValue::Int).collect())
    }

    #[test]
    fn wire_values_map_to_raw_values() {
        assert_eq!(RawValue::from(JdwpValue::null()), RawValue::Null);
        assert_eq!(
            RawValue::from(JdwpValue::Object { tag: b'[', id: 0 }),
            RawValue::Null
        );
        assert_eq!(
            RawValue::from(JdwpValue::Object { tag: b's', id: 4 }),
            RawValue::String(4)
        );
        assert_eq!(
            RawValue::from(JdwpValue::Object { tag: b'[', id: 5 }),
            RawValue::Array(5)
        );
        assert_eq!(
            RawValue::from(JdwpValue::Object { tag: b't', id: 6 }),
            RawValue::Object { tag: b't', id: 6 }
        );
    }

    #[test]
    fn primitives_render_like_java() {
        let client = MockJdwpClient::new();
        assert_eq!(render(&client, RawValue::Int(3)), "3");
        assert_eq!(render(&client, RawValue::Boolean(true)), "true");
        assert_eq!(render(&client, RawValue::Char(u16::from(b'x'))), "x");
        assert_eq!(render(&client, RawValue::Double(2.5)), "2.5");
        assert_eq!(render(&client, RawValue::Double(3.0)), "3.0");
        assert_eq!(render(&client, RawValue::Float(0.1)), "0.1");
        assert_eq!(render(&client, RawValue::Double(1e7)), "1.0E7");
        assert_eq!(render(&client, RawValue::Double(f64::NEG_INFINITY)), "-Infinity");
        assert_eq!(render(&client, RawValue::Long(-4)), "-4");
        assert_eq!(render(&client, RawValue::Void), "<void value>");
    }

    #[test]
    fn null_uses_configured_marker() {
        let client = MockJdwpClient::new();
        assert_eq!(render(&client, RawValue::Null), "null");

        let config = DecodeConfig {
            null_marker: "<none>".to_string(),
            ..DecodeConfig::default()
        };
        let rendered = ValueFormatter::new(&client, &config)
            .format(&RawValue::Null)
            .unwrap();
        assert_eq!(rendered, "<none>");
    }

    #[test]
    fn arrays_render_bracketed() {
        let client = MockJdwpClient::new();
        client.insert_array(1, int_array(&[]));
        client.insert_array(2, int_array(&[7]));
        client.insert_array(3, int_array(&[1, 2, 3]));

        assert_eq!(render(&client, RawValue::Array(1)), "[]");
        assert_eq!(render(&client, RawValue::Array(2)), "[7]");
        assert_eq!(render(&client, RawValue::Array(3)), "[1, 2, 3]");
    }

    #[test]
    fn nested_arrays_nest_brackets() {
        let client = MockJdwpClient::new();
        client.insert_array(10, int_array(&[1, 2]));
        client.insert_array(11, int_array(&[]));
        client.insert_array(
            12,
            MockArray::new(
                "int[][]",
                vec![
                    JdwpValue::Object { tag: b'[', id: 10 },
                    JdwpValue::Object { tag: b'[', id: 11 },
                    JdwpValue::null(),
                ],
            ),
        );

        assert_eq!(render(&client, RawValue::Array(12)), "[[1, 2], [], null]");
    }

    #[test]
    fn references_use_default_rendering() {
        let client = MockJdwpClient::new();
        client.insert_string(4, "hi");
        client.insert_object(42, "java.util.ArrayList");
        client.insert_array(
            5,
            MockArray::new("java.lang.String[]", vec![JdwpValue::Object { tag: b's', id: 4 }]),
        );

        assert_eq!(render(&client, RawValue::String(4)), "\"hi\"");
        assert_eq!(
            render(&client, RawValue::Object { tag: b'L', id: 42 }),
            "instance of java.util.ArrayList(id=42)"
        );
        assert_eq!(render(&client, RawValue::Array(5)), "[\"hi\"]");
    }

    #[test]
    fn depth_limit_falls_back_to_default_rendering() {
        let client = MockJdwpClient::new();
        for (id, next) in [(1, 2), (2, 3), (3, 4)] {
            client.insert_array(
                id,
                MockArray::new("java.lang.Object[]", vec![JdwpValue::Object { tag: b'[', id: next }]),
            );
        }
        client.insert_array(4, int_array(&[7]));
        let config = DecodeConfig {
            max_depth: 2,
            ..DecodeConfig::default()
        };

        let rendered = ValueFormatter::new(&client, &config)
            .format(&RawValue::Array(1))
            .unwrap();
        assert_eq!(rendered, "[[instance of java.lang.Object[1] (id=3)]]");
    }

    #[test]
    fn self_references_are_not_expanded_again() {
        let client = MockJdwpClient::new();
        let me = JdwpValue::Object { tag: b'[', id: 9 };
        client.insert_array(9, MockArray::new("java.lang.Object[]", vec![me; 6]));

        let rendered = render(&client, RawValue::Array(9));
        let element = "instance of java.lang.Object[6] (id=9)";
        assert_eq!(rendered, format!("[{}]", vec![element; 6].join(", ")));
        // Length and one page for the array, then type and length per element.
        assert_eq!(client.calls().len(), 2 + 6 * 2);
    }

    #[test]
    fn shared_arrays_outside_the_path_still_expand() {
        let client = MockJdwpClient::new();
        let shared = JdwpValue::Object { tag: b'[', id: 2 };
        client.insert_array(2, int_array(&[1]));
        client.insert_array(1, MockArray::new("int[][]", vec![shared, shared]));

        assert_eq!(render(&client, RawValue::Array(1)), "[[1], [1]]");
    }

    #[test]
    fn large_arrays_are_read_in_pages() {
        let client = MockJdwpClient::new();
        let len = ARRAY_PAGE_LEN * 2 + 3;
        let values: Vec<i32> = (0..len as i32).collect();
        client.insert_array(5, int_array(&values));

        let rendered = render(&client, RawValue::Array(5));
        assert!(rendered.starts_with("[0, 1, 2, "));
        assert!(rendered.ends_with(&format!(", {}]", len - 1)));
        let pages = client
            .calls()
            .into_iter()
            .filter(|call| *call == MockCall::ArrayGetValues)
            .count();
        assert_eq!(pages, 3);
    }

    #[test]
    fn failed_array_expansion_degrades() {
        let client = MockJdwpClient::new();
        client.insert_array(3, int_array(&[1, 2, 3]));
        client.push_failure(
            MockCall::ArrayGetValues,
            JdwpError::CommandFailed { error_code: 34 },
        );
        assert_eq!(
            render(&client, RawValue::Array(3)),
            "instance of int[3] (id=3)"
        );

        // Collected before either path could describe it.
        assert_eq!(
            render(&client, RawValue::Array(77)),
            "<unavailable: invalid object id 77>"
        );
    }

    #[test]
    fn connection_failures_are_not_absorbed() {
        let client = MockJdwpClient::new();
        client.insert_array(3, int_array(&[1]));
        client.push_failure(MockCall::ArrayGetValues, JdwpError::Timeout);

        let config = DecodeConfig::default();
        let err = ValueFormatter::new(&client, &config)
            .format(&RawValue::Array(3))
            .unwrap_err();
        assert!(matches!(err, JdwpError::Timeout), "{err:?}");
    }

    #[test]
    fn decimal_layout() {
        assert_eq!(java_decimal(-0.0, (-0.0f64).to_string(), String::new()), "-0.0");
        assert_eq!(java_decimal(1.5e-4, String::new(), format!("{:E}", 1.5e-4)), "1.5E-4");
        assert_eq!(java_decimal(f64::NAN, String::new(), String::new()), "NaN");
    }
}

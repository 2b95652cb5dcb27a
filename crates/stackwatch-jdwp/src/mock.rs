use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::poison::lock_recovering;
use crate::{
    FrameId, FrameInfo, JdwpClient, JdwpError, JdwpIdSizes, JdwpValue, LocalVariable, ObjectId,
    SlotRequest, ThreadId,
};

/// Inspection commands of [`JdwpClient`], used to script failures and to
/// inspect the call log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockCall {
    IdSizes,
    Frames,
    VisibleVariables,
    FrameLine,
    StackFrameGetValues,
    ArrayLength,
    ArrayGetValues,
    StringValue,
    ReferenceTypeName,
}

#[derive(Clone, Debug)]
pub struct MockArray {
    /// Java source form, e.g. `int[]`.
    pub type_name: String,
    pub values: Vec<JdwpValue>,
}

impl MockArray {
    pub fn new(type_name: impl Into<String>, values: Vec<JdwpValue>) -> Self {
        Self {
            type_name: type_name.into(),
            values,
        }
    }
}

#[derive(Default)]
struct MockState {
    id_sizes: JdwpIdSizes,
    frames: HashMap<ThreadId, Vec<FrameInfo>>,
    variables: HashMap<FrameId, Vec<LocalVariable>>,
    lines: HashMap<FrameId, u32>,
    values: HashMap<FrameId, Vec<JdwpValue>>,
    arrays: HashMap<ObjectId, MockArray>,
    strings: HashMap<ObjectId, String>,
    object_types: HashMap<ObjectId, String>,
    failures: HashMap<MockCall, VecDeque<JdwpError>>,
    disconnected: bool,
    calls: Vec<MockCall>,
    get_values_calls: Vec<(ThreadId, FrameId, Vec<SlotRequest>)>,
}

/// Deterministic, in-memory JDWP test double.
///
/// Configuration methods take `&self` so a client already shared with an
/// extractor can still be scripted.
#[derive(Default)]
pub struct MockJdwpClient {
    state: Mutex<MockState>,
}

impl MockJdwpClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        lock_recovering(&self.state, "mock JDWP client")
    }

    pub fn set_id_sizes(&self, sizes: JdwpIdSizes) {
        self.state().id_sizes = sizes;
    }

    pub fn set_frames(&self, thread: ThreadId, frames: Vec<FrameInfo>) {
        self.state().frames.insert(thread, frames);
    }

    pub fn set_variables(&self, frame_id: FrameId, variables: Vec<LocalVariable>) {
        self.state().variables.insert(frame_id, variables);
    }

    pub fn set_line(&self, frame_id: FrameId, line: u32) {
        self.state().lines.insert(frame_id, line);
    }

    /// Reply of `StackFrame.GetValues` for the frame, returned as-is.
    pub fn set_values(&self, frame_id: FrameId, values: Vec<JdwpValue>) {
        self.state().values.insert(frame_id, values);
    }

    pub fn insert_array(&self, array_id: ObjectId, array: MockArray) {
        self.state().arrays.insert(array_id, array);
    }

    pub fn insert_string(&self, string_id: ObjectId, value: impl Into<String>) {
        self.state().strings.insert(string_id, value.into());
    }

    pub fn insert_object(&self, object_id: ObjectId, type_name: impl Into<String>) {
        self.state().object_types.insert(object_id, type_name.into());
    }

    /// Forget an object so later lookups fail with `InvalidObjectId`.
    pub fn collect_object(&self, object_id: ObjectId) {
        let mut state = self.state();
        state.arrays.remove(&object_id);
        state.strings.remove(&object_id);
        state.object_types.remove(&object_id);
    }

    /// Fail the next `call` with `err`; queued failures are consumed in order.
    pub fn push_failure(&self, call: MockCall, err: JdwpError) {
        self.state().failures.entry(call).or_default().push_back(err);
    }

    /// Make every later call fail with `NotConnected`.
    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn get_values_calls(&self) -> Vec<(ThreadId, FrameId, Vec<SlotRequest>)> {
        self.state().get_values_calls.clone()
    }

    fn begin(&self, call: MockCall) -> Result<std::sync::MutexGuard<'_, MockState>, JdwpError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.disconnected {
            return Err(JdwpError::NotConnected);
        }
        if let Some(err) = state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

impl JdwpClient for MockJdwpClient {
    fn id_sizes(&self) -> Result<JdwpIdSizes, JdwpError> {
        Ok(self.begin(MockCall::IdSizes)?.id_sizes)
    }

    fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>, JdwpError> {
        let state = self.begin(MockCall::Frames)?;
        let frames = state.frames.get(&thread).map(Vec::as_slice).unwrap_or_default();
        let start = usize::try_from(start).unwrap_or(0).min(frames.len());
        let end = match usize::try_from(length) {
            Ok(length) => start.saturating_add(length).min(frames.len()),
            Err(_) => frames.len(),
        };
        Ok(frames[start..end].to_vec())
    }

    fn visible_variables(&self, frame: &FrameInfo) -> Result<Vec<LocalVariable>, JdwpError> {
        let state = self.begin(MockCall::VisibleVariables)?;
        Ok(state
            .variables
            .get(&frame.frame_id)
            .cloned()
            .unwrap_or_default())
    }

    fn frame_line(&self, frame: &FrameInfo) -> Result<Option<u32>, JdwpError> {
        let state = self.begin(MockCall::FrameLine)?;
        Ok(state.lines.get(&frame.frame_id).copied())
    }

    fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[SlotRequest],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let mut state = self.begin(MockCall::StackFrameGetValues)?;
        state
            .get_values_calls
            .push((thread, frame_id, slots.to_vec()));
        state
            .values
            .get(&frame_id)
            .cloned()
            .ok_or(JdwpError::CommandFailed { error_code: 30 })
    }

    fn array_length(&self, array_id: ObjectId) -> Result<usize, JdwpError> {
        let state = self.begin(MockCall::ArrayLength)?;
        state
            .arrays
            .get(&array_id)
            .map(|array| array.values.len())
            .ok_or(JdwpError::InvalidObjectId(array_id))
    }

    fn array_get_values(
        &self,
        array_id: ObjectId,
        first_index: usize,
        length: usize,
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let state = self.begin(MockCall::ArrayGetValues)?;
        let array = state
            .arrays
            .get(&array_id)
            .ok_or(JdwpError::InvalidObjectId(array_id))?;
        array
            .values
            .get(first_index..first_index.saturating_add(length))
            .map(<[JdwpValue]>::to_vec)
            .ok_or(JdwpError::CommandFailed { error_code: 503 })
    }

    fn string_value(&self, string_id: ObjectId) -> Result<String, JdwpError> {
        let state = self.begin(MockCall::StringValue)?;
        state
            .strings
            .get(&string_id)
            .cloned()
            .ok_or(JdwpError::InvalidObjectId(string_id))
    }

    fn reference_type_name(&self, object_id: ObjectId) -> Result<String, JdwpError> {
        let state = self.begin(MockCall::ReferenceTypeName)?;
        if let Some(array) = state.arrays.get(&object_id) {
            return Ok(array.type_name.clone());
        }
        if state.strings.contains_key(&object_id) {
            return Ok("java.lang.String".to_string());
        }
        state
            .object_types
            .get(&object_id)
            .cloned()
            .ok_or(JdwpError::InvalidObjectId(object_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Location;

    fn frame(frame_id: FrameId) -> FrameInfo {
        FrameInfo {
            thread: 1,
            frame_id,
            location: Location {
                type_tag: 1,
                class_id: 2,
                method_id: 3,
                index: 0,
            },
        }
    }

    #[test]
    fn frames_honor_start_and_length() {
        let client = MockJdwpClient::new();
        client.set_frames(1, vec![frame(10), frame(11), frame(12)]);

        let ids = |frames: Vec<FrameInfo>| frames.iter().map(|f| f.frame_id).collect::<Vec<_>>();
        assert_eq!(ids(client.frames(1, 0, 1).unwrap()), vec![10]);
        assert_eq!(ids(client.frames(1, 1, -1).unwrap()), vec![11, 12]);
        assert!(client.frames(2, 0, -1).unwrap().is_empty());
    }

    #[test]
    fn scripted_failures_are_consumed_once() {
        let client = MockJdwpClient::new();
        client.push_failure(MockCall::IdSizes, JdwpError::Timeout);

        assert!(matches!(client.id_sizes(), Err(JdwpError::Timeout)));
        assert_eq!(client.id_sizes().unwrap(), JdwpIdSizes::default());
        assert_eq!(client.calls(), vec![MockCall::IdSizes, MockCall::IdSizes]);
    }

    #[test]
    fn collected_objects_are_invalid() {
        let client = MockJdwpClient::new();
        client.insert_array(7, MockArray::new("int[]", vec![JdwpValue::Int(1)]));
        assert_eq!(client.array_length(7).unwrap(), 1);

        client.collect_object(7);
        assert!(matches!(
            client.array_length(7),
            Err(JdwpError::InvalidObjectId(7))
        ));
    }

    #[test]
    fn disconnect_fails_every_call() {
        let client = MockJdwpClient::new();
        client.disconnect();
        assert!(matches!(client.string_value(1), Err(JdwpError::NotConnected)));
        assert!(matches!(client.id_sizes(), Err(JdwpError::NotConnected)));
    }
}

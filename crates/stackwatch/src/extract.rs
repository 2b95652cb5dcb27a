use std::sync::Arc;

use stackwatch_jdwp::{FrameInfo, JdwpClient, JdwpError, ThreadId};
use thiserror::Error;

use crate::config::DecodeConfig;
use crate::decode::ValueFormatter;
use crate::fetch::fetch_values;
use crate::history::HistoryCache;
use crate::slots::{build_slot_requests, enumerate_variables};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("variable extraction unavailable: {0}")]
    Initialization(String),
    #[error("variable extraction is disabled for this session")]
    Disabled,
    #[error("thread {0} has no frames")]
    NoFrames(ThreadId),
    #[error("StackFrame.GetValues returned {actual} values for {expected} slots")]
    ProtocolMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Connection(#[from] JdwpError),
}

/// A frame of a thread the VM has suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuspendedFrame {
    pub info: FrameInfo,
}

impl SuspendedFrame {
    pub fn new(info: FrameInfo) -> Self {
        Self { info }
    }

    /// Innermost frame of a suspended thread.
    pub fn top_of(client: &dyn JdwpClient, thread: ThreadId) -> Result<Self, ExtractError> {
        let frames = client.frames(thread, 0, 1)?;
        frames
            .into_iter()
            .next()
            .map(Self::new)
            .ok_or(ExtractError::NoFrames(thread))
    }
}

impl From<FrameInfo> for SuspendedFrame {
    fn from(info: FrameInfo) -> Self {
        Self::new(info)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedVariable {
    pub name: String,
    pub value: String,
    pub signature: String,
    pub is_argument: bool,
}

enum Availability {
    Ready,
    Disabled,
}

/// Reads the locals of suspended frames and records them in a [`HistoryCache`].
pub struct VariableExtractor {
    client: Arc<dyn JdwpClient>,
    cache: Arc<HistoryCache>,
    config: DecodeConfig,
    availability: Availability,
}

impl VariableExtractor {
    /// Probe the client and build an extractor.
    ///
    /// Fails if the target's identifier sizes are unknown or unusable.
    pub fn try_new(
        client: Arc<dyn JdwpClient>,
        cache: Arc<HistoryCache>,
        config: DecodeConfig,
    ) -> Result<Self, ExtractError> {
        let sizes = client
            .id_sizes()
            .map_err(|err| ExtractError::Initialization(format!("JDWP id sizes unavailable: {err}")))?;
        if !sizes.is_valid() {
            return Err(ExtractError::Initialization(format!(
                "unsupported JDWP id sizes {sizes:?}"
            )));
        }
        Ok(Self {
            client,
            cache,
            config,
            availability: Availability::Ready,
        })
    }

    /// Like [`VariableExtractor::try_new`], but never fails: an extractor that
    /// cannot initialize is disabled for the session and logs the reason once.
    pub fn new(client: Arc<dyn JdwpClient>, cache: Arc<HistoryCache>, config: DecodeConfig) -> Self {
        match Self::try_new(client.clone(), cache.clone(), config.clone()) {
            Ok(extractor) => extractor,
            Err(err) => {
                tracing::error!(target: "stackwatch", error = %err, "variable extraction disabled");
                Self {
                    client,
                    cache,
                    config,
                    availability: Availability::Disabled,
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.availability, Availability::Ready)
    }

    pub fn cache(&self) -> &Arc<HistoryCache> {
        &self.cache
    }

    /// Extract every visible local of `frame` and commit the values to the
    /// cache.
    ///
    /// On error nothing is committed.
    pub fn extract(&self, frame: &SuspendedFrame) -> Result<Vec<ExtractedVariable>, ExtractError> {
        if !self.is_enabled() {
            return Err(ExtractError::Disabled);
        }

        let client = self.client.as_ref();
        let info = &frame.info;
        let variables = enumerate_variables(client, info)?;
        let requests = build_slot_requests(&variables);
        let raw = fetch_values(client, info.thread, info.frame_id, &requests)?;

        let formatter = ValueFormatter::new(client, &self.config);
        let mut extracted = Vec::with_capacity(variables.len());
        for (variable, value) in variables.into_iter().zip(raw) {
            extracted.push(ExtractedVariable {
                value: formatter.format(&value)?,
                name: variable.name,
                signature: variable.signature,
                is_argument: variable.is_argument,
            });
        }

        let line = client.frame_line(info)?;
        let appended = self.cache.put_all(
            line,
            extracted
                .iter()
                .map(|variable| (variable.name.as_str(), variable.value.as_str())),
        );
        tracing::debug!(
            target: "stackwatch",
            thread = info.thread,
            frame_id = info.frame_id,
            ?line,
            variables = extracted.len(),
            changed = appended,
            "extracted frame variables"
        );
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stackwatch_jdwp::{
        JdwpIdSizes, JdwpValue, LocalVariable, Location, MockArray, MockCall, MockJdwpClient,
    };

    const THREAD: ThreadId = 1;

    fn frame() -> FrameInfo {
        FrameInfo {
            thread: THREAD,
            frame_id: 2,
            location: Location {
                type_tag: 1,
                class_id: 3,
                method_id: 4,
                index: 10,
            },
        }
    }

    fn local(name: &str, signature: &str) -> LocalVariable {
        LocalVariable {
            name: name.to_string(),
            signature: signature.to_string(),
            jvm_slot: 0,
            is_argument: false,
        }
    }

    fn client() -> Arc<MockJdwpClient> {
        let client = MockJdwpClient::new();
        client.set_frames(THREAD, vec![frame()]);
        client.set_variables(2, vec![local("a", "I"), local("b", "[I")]);
        client.set_values(
            2,
            vec![JdwpValue::Int(3), JdwpValue::Object { tag: b'[', id: 9 }],
        );
        client.insert_array(
            9,
            MockArray::new("int[]", vec![JdwpValue::Int(4), JdwpValue::Int(5)]),
        );
        client.set_line(2, 12);
        Arc::new(client)
    }

    fn pairs(vars: &[ExtractedVariable]) -> Vec<(&str, &str)> {
        vars.iter()
            .map(|v| (v.name.as_str(), v.value.as_str()))
            .collect()
    }

    #[test]
    fn extracts_and_commits_frame() {
        let client = client();
        let cache = Arc::new(HistoryCache::new());
        let extractor =
            VariableExtractor::new(client.clone(), cache.clone(), DecodeConfig::default());
        assert!(extractor.is_enabled());

        let frame = SuspendedFrame::top_of(client.as_ref(), THREAD).unwrap();
        let vars = extractor.extract(&frame).unwrap();
        assert_eq!(pairs(&vars), vec![("a", "3"), ("b", "[4, 5]")]);
        assert_eq!(cache.get_most_recent_update("a").unwrap().value, "3");
        assert_eq!(cache.get_most_recent_update("b").unwrap().line, Some(12));

        // One batched request per cycle.
        assert_eq!(client.get_values_calls().len(), 1);
    }

    #[test]
    fn unchanged_values_are_not_recorded_twice() {
        let client = client();
        let cache = Arc::new(HistoryCache::new());
        let extractor =
            VariableExtractor::new(client.clone(), cache.clone(), DecodeConfig::default());
        let frame = SuspendedFrame::new(frame());

        extractor.extract(&frame).unwrap();
        client.set_line(2, 13);
        client.set_values(
            2,
            vec![JdwpValue::Int(4), JdwpValue::Object { tag: b'[', id: 9 }],
        );
        extractor.extract(&frame).unwrap();

        assert_eq!(cache.get_history("a").unwrap().len(), 2);
        assert_eq!(cache.get_history("b").unwrap().len(), 1);
    }

    #[test]
    fn invalid_id_sizes_disable_extraction() {
        let client = client();
        client.set_id_sizes(JdwpIdSizes {
            object_id: 0,
            ..JdwpIdSizes::default()
        });
        let extractor =
            VariableExtractor::new(client.clone(), Arc::new(HistoryCache::new()), DecodeConfig::default());

        assert!(!extractor.is_enabled());
        let before = client.calls().len();
        let err = extractor.extract(&SuspendedFrame::new(frame())).unwrap_err();
        assert!(matches!(err, ExtractError::Disabled), "{err:?}");
        assert_eq!(client.calls().len(), before);
    }

    #[test]
    fn failed_probe_is_an_initialization_error() {
        let client = client();
        client.push_failure(MockCall::IdSizes, JdwpError::NotConnected);
        let err = VariableExtractor::try_new(
            client,
            Arc::new(HistoryCache::new()),
            DecodeConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExtractError::Initialization(_)), "{err:?}");
    }

    #[test]
    fn connection_failure_while_decoding_commits_nothing() {
        let client = client();
        client.push_failure(MockCall::ArrayLength, JdwpError::ConnectionClosed);
        let cache = Arc::new(HistoryCache::new());
        let extractor =
            VariableExtractor::new(client.clone(), cache.clone(), DecodeConfig::default());

        let err = extractor.extract(&SuspendedFrame::new(frame())).unwrap_err();
        assert!(
            matches!(err, ExtractError::Connection(JdwpError::ConnectionClosed)),
            "{err:?}"
        );
        assert!(cache.get_all_variables().is_empty());
    }

    #[test]
    fn frame_without_line_table_records_unknown_line() {
        let client = MockJdwpClient::new();
        client.set_variables(2, vec![local("n", "J")]);
        client.set_values(2, vec![JdwpValue::Long(7)]);
        let cache = Arc::new(HistoryCache::new());
        let extractor =
            VariableExtractor::new(Arc::new(client), cache.clone(), DecodeConfig::default());

        extractor.extract(&SuspendedFrame::new(frame())).unwrap();
        assert_eq!(cache.get_most_recent_update("n").unwrap().line, None);
    }

    #[test]
    fn thread_without_frames() {
        let client = MockJdwpClient::new();
        let err = SuspendedFrame::top_of(&client, 77).unwrap_err();
        assert!(matches!(err, ExtractError::NoFrames(77)), "{err:?}");
    }
}

//! Local-variable extraction and change tracking for suspended JVM frames.
//!
//! Each time the debuggee suspends, [`VariableExtractor::extract`] enumerates
//! the locals visible in a frame, fetches all of their values with a single
//! batched `StackFrame.GetValues` exchange, renders them for display and
//! commits the results to a session-wide [`HistoryCache`]. The cache keeps,
//! per variable name, the sequence of distinct values the variable has held.
//!
//! Deciding when to suspend, and what to do with the history, is up to the
//! caller.

mod config;
mod decode;
mod extract;
mod fetch;
mod history;
mod logging;
mod slots;

pub use config::{ConfigError, DecodeConfig, JdwpConfig, LoggingConfig, StackWatchConfig};
pub use decode::{DecodeError, RawValue, ValueFormatter, ARRAY_PAGE_LEN};
pub use extract::{ExtractError, ExtractedVariable, SuspendedFrame, VariableExtractor};
pub use fetch::fetch_values;
pub use history::{HistoryCache, ValueRecord, VariableHistory};
pub use logging::init_tracing;
pub use slots::{build_slot_requests, enumerate_variables, Variable};

pub use stackwatch_jdwp as jdwp;

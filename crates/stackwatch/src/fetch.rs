use stackwatch_jdwp::{FrameId, JdwpClient, SlotRequest, ThreadId};

use crate::decode::RawValue;
use crate::extract::ExtractError;

/// Read every requested slot of one frame with a single
/// `StackFrame.GetValues` exchange.
///
/// The reply must carry exactly one value per request, in request order.
/// Frames with no visible variables skip the round trip.
pub fn fetch_values(
    client: &dyn JdwpClient,
    thread: ThreadId,
    frame_id: FrameId,
    requests: &[SlotRequest],
) -> Result<Vec<RawValue>, ExtractError> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    tracing::debug!(
        target: "stackwatch",
        thread,
        frame_id,
        slots = requests.len(),
        "fetching frame values"
    );
    let values = client.stack_frame_get_values(thread, frame_id, requests)?;
    if values.len() != requests.len() {
        return Err(ExtractError::ProtocolMismatch {
            expected: requests.len(),
            actual: values.len(),
        });
    }
    Ok(values.into_iter().map(RawValue::from).collect())
}

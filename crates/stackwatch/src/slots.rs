use stackwatch_jdwp::{signature_to_tag, FrameInfo, JdwpClient, JdwpError, SlotRequest};

/// A local visible at the frame's current location.
///
/// Recomputed on every suspension; `slot` is the variable's position in the
/// enumeration, which is also its index in the batched request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub slot: u32,
    /// JNI type descriptor, e.g. `I` or `[Ljava/lang/String;`.
    pub signature: String,
    pub is_argument: bool,
}

/// Visible variables of `frame`, in the order the client reports them.
pub fn enumerate_variables(
    client: &dyn JdwpClient,
    frame: &FrameInfo,
) -> Result<Vec<Variable>, JdwpError> {
    let locals = client.visible_variables(frame)?;
    Ok(locals
        .into_iter()
        .enumerate()
        .map(|(index, local)| Variable {
            name: local.name,
            slot: index as u32,
            signature: local.signature,
            is_argument: local.is_argument,
        })
        .collect())
}

/// One request per variable, same order: `request[i].slot == i` and the tag is
/// the first byte of the signature.
pub fn build_slot_requests(variables: &[Variable]) -> Vec<SlotRequest> {
    variables
        .iter()
        .enumerate()
        .map(|(index, variable)| SlotRequest {
            slot: index as u32,
            tag: signature_to_tag(&variable.signature),
        })
        .collect()
}

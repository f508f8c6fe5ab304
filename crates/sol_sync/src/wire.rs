//! Wire encoding for [`GameCommand`].
//!
//! Commands travel as JSON objects:
//!
//! ```text
//! {"tick":12,"playerId":"alice","commandType":"move_units","payload":{"unitIds":[3],"target":{"x":42949672960,"y":0}}}
//! ```
//!
//! Fixed-point coordinates are sent as raw bits so a decode reproduces the
//! sender's value exactly. Unknown command types and missing fields fail to
//! decode; transports drop such messages.

use crate::command::GameCommand;
use crate::error::WireError;

/// Encode a command for transmission.
pub fn encode(command: &GameCommand) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(command)?)
}

/// Decode a received message.
pub fn decode(bytes: &[u8]) -> Result<GameCommand, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

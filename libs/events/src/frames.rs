//! Subscription filter and feed frames.

use bgwatch_id::BlockName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventError, VendorBlockStatus};

/// Which event categories a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub blocks: bool,
    pub block_deleted: bool,
    pub midplanes: bool,
    pub node_boards: bool,
    pub switches: bool,
    pub cables: bool,
}

impl EventFilter {
    /// A filter that matches nothing.
    pub const fn none() -> Self {
        Self {
            blocks: false,
            block_deleted: false,
            midplanes: false,
            node_boards: false,
            switches: false,
            cables: false,
        }
    }

    /// Block state changes only.
    pub const fn blocks_only() -> Self {
        Self {
            blocks: true,
            ..Self::none()
        }
    }
}

/// A block changed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStateChanged {
    /// Block the event refers to.
    pub block: BlockName,

    /// New vendor status.
    pub status: VendorBlockStatus,

    /// When the control service observed the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl BlockStateChanged {
    pub fn new(block: BlockName, status: VendorBlockStatus) -> Self {
        Self {
            block,
            status,
            occurred_at: None,
        }
    }
}

/// Frames sent by this system to the control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { filter: EventFilter },
    RequestUpdates,
}

/// Frames sent by the control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed { filter: EventFilter },
    BlockStateChanged(BlockStateChanged),
}

impl ClientFrame {
    /// Encodes the frame as a single line, without the trailing newline.
    pub fn encode(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, EventError> {
        decode_line(line)
    }
}

impl ServerFrame {
    /// Encodes the frame as a single line, without the trailing newline.
    pub fn encode(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes one line. A block event whose block name fails validation is
    /// reported as [`EventError::InvalidBlockName`], not as a bad frame.
    pub fn decode(line: &str) -> Result<Self, EventError> {
        let value = parse_line(line)?;

        if value.get("type").and_then(|t| t.as_str()) == Some("block_state_changed") {
            if let Some(block) = value.get("block").and_then(|b| b.as_str()) {
                if BlockName::parse(block).is_err() {
                    return Err(EventError::InvalidBlockName(block.to_string()));
                }
            }
        }

        from_value(value)
    }
}

fn decode_line<T: serde::de::DeserializeOwned>(line: &str) -> Result<T, EventError> {
    from_value(parse_line(line)?)
}

fn parse_line(line: &str) -> Result<serde_json::Value, EventError> {
    serde_json::from_str(line.trim()).map_err(|e| EventError::InvalidFrame(e.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, EventError> {
    let frame_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| EventError::InvalidFrame("missing frame type".to_string()))?
        .to_string();

    serde_json::from_value(value).map_err(|e| {
        if e.to_string().contains("unknown variant") {
            EventError::UnknownFrameType(frame_type)
        } else {
            EventError::InvalidFrame(e.to_string())
        }
    })
}

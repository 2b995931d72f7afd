// ABOUTME: Turn request types handed to the agent engine.
// ABOUTME: Decodes inline data-URI attachments into typed payloads before admission.

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// A request for one agent turn, fully resolved by the coordinator.
///
/// The engine never sees registry or store types; everything it needs to run
/// the turn is carried here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Stable identifier grouping all turns sharing conversational context.
    pub session_key: String,
    /// Opaque handle into the external transcript log.
    pub session_id: String,
    /// User message body.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Outbound route for the reply, recorded on successful delivery only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver: Option<DeliverTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Advisory to the transport layer; the coordinator enforces no turn timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Where a turn's reply should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverTarget {
    pub provider: String,
    pub to: String,
}

/// A decoded attachment payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Caller-declared kind (e.g. "image", "file").
    pub kind: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Decoded bytes.
    pub bytes: Vec<u8>,
}

impl Attachment {
    /// Build an attachment from wire fields.
    ///
    /// `content` is either a `data:<mime>;base64,<payload>` URI or plain text.
    /// A data URI's embedded mime type wins over the declared one when both
    /// are present; a malformed base64 section is a validation error.
    pub fn from_wire(
        kind: &str,
        mime_type: &str,
        file_name: Option<&str>,
        content: &str,
    ) -> Result<Self> {
        let (mime, bytes) = if let Some(rest) = content.strip_prefix("data:") {
            let (header, payload) = rest
                .split_once(',')
                .context("data URI missing ',' separator")?;
            let (uri_mime, encoding) = match header.split_once(';') {
                Some((m, enc)) => (m, Some(enc)),
                None => (header, None),
            };
            let mime = if uri_mime.is_empty() {
                mime_type.to_string()
            } else {
                uri_mime.to_string()
            };
            match encoding {
                Some("base64") => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(payload.trim())
                        .context("invalid base64 in data URI attachment")?;
                    (mime, bytes)
                }
                Some(other) => bail!("unsupported data URI encoding: {}", other),
                None => (mime, payload.as_bytes().to_vec()),
            }
        } else {
            (mime_type.to_string(), content.as_bytes().to_vec())
        };

        if bytes.is_empty() {
            bail!("attachment content is empty");
        }

        Ok(Attachment {
            kind: kind.to_string(),
            mime_type: mime,
            file_name: file_name.map(str::to_string),
            bytes,
        })
    }
}

//! Text codec for messages and responses, and the 4-byte big-endian frame prefix.
//!
//! ```text
//! <method><fs><version>[<hs><k>: <v>[<fs><k>: <v>...]]<cs><payload>[<cs><status>]
//! ```

use std::collections::BTreeMap;

use crate::protocol::{
    Message, Method, Response, Status, HEADER_DELIMITER, PROTOCOL_VERSION, SR_COMPONENT,
    SR_FIELDS, SR_HEADERS,
};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Frame body could not be parsed as a message. Services turn this into a
/// BadMessage response; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("message is not valid UTF-8")]
    NotUtf8,
    #[error("expected {expected} components, found {found}")]
    ComponentCount { expected: usize, found: usize },
    #[error("more than one header block")]
    HeaderBlock,
    #[error("method/version segment is malformed: {0:?}")]
    MethodVersion(String),
    #[error("header entry lacks key/value delimiter: {0:?}")]
    Header(String),
    #[error("protocol version mismatch: {0:?}")]
    VersionMismatch(String),
    #[error("invalid status: {0:?}")]
    Status(String),
}

/// Error building or reading a frame prefix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Encode a request message.
pub fn encode_message(msg: &Message) -> String {
    encode_parts(&msg.method, &msg.version, &msg.headers, &msg.payload)
}

/// Encode a response: the message encoding followed by `<cs>status`.
pub fn encode_response(resp: &Response) -> String {
    let mut out = encode_parts(
        &Method::Response,
        &resp.version,
        &resp.headers,
        &resp.payload,
    );
    out.push_str(SR_COMPONENT);
    out.push_str(&resp.status.code().to_string());
    out
}

fn encode_parts(
    method: &Method,
    version: &str,
    headers: &BTreeMap<String, String>,
    payload: &str,
) -> String {
    let mut out = String::with_capacity(payload.len() + 64);
    out.push_str(method.as_str());
    out.push_str(SR_FIELDS);
    out.push_str(version);
    if !headers.is_empty() {
        out.push_str(SR_HEADERS);
        let entries: Vec<String> = headers
            .iter()
            .map(|(k, v)| format!("{k}{HEADER_DELIMITER}{v}"))
            .collect();
        out.push_str(&entries.join(SR_FIELDS));
    }
    out.push_str(SR_COMPONENT);
    out.push_str(payload);
    out
}

/// Decode a request message (exactly two components).
pub fn decode_message(bytes: &[u8]) -> Result<Message, FormatError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FormatError::NotUtf8)?;
    let components: Vec<&str> = text.split(SR_COMPONENT).collect();
    if components.len() != 2 {
        return Err(FormatError::ComponentCount {
            expected: 2,
            found: components.len(),
        });
    }
    decode_parts(components[0], components[1])
}

/// Decode a response (exactly three components: meta, payload, status).
pub fn decode_response(bytes: &[u8]) -> Result<Response, FormatError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FormatError::NotUtf8)?;
    let components: Vec<&str> = text.split(SR_COMPONENT).collect();
    if components.len() != 3 {
        return Err(FormatError::ComponentCount {
            expected: 3,
            found: components.len(),
        });
    }
    let msg = decode_parts(components[0], components[1])?;
    let code = components[2]
        .trim()
        .parse::<u16>()
        .map_err(|_| FormatError::Status(components[2].to_string()))?;
    Ok(Response {
        version: msg.version,
        headers: msg.headers,
        payload: msg.payload,
        status: Status::from_code(code),
    })
}

fn decode_parts(meta: &str, payload: &str) -> Result<Message, FormatError> {
    let mut meta_parts = meta.split(SR_HEADERS);
    let method_version = meta_parts.next().unwrap_or_default();
    let header_block = meta_parts.next();
    if meta_parts.next().is_some() {
        return Err(FormatError::HeaderBlock);
    }

    let (method, version) = match method_version.split(SR_FIELDS).collect::<Vec<_>>()[..] {
        [m, v] if !m.is_empty() && !v.is_empty() => (m, v),
        _ => return Err(FormatError::MethodVersion(method_version.to_string())),
    };
    if version != PROTOCOL_VERSION {
        return Err(FormatError::VersionMismatch(version.to_string()));
    }

    let mut headers = BTreeMap::new();
    if let Some(block) = header_block {
        for entry in block.split(SR_FIELDS) {
            let (k, v) = entry
                .split_once(HEADER_DELIMITER)
                .ok_or_else(|| FormatError::Header(entry.to_string()))?;
            headers.insert(k.to_string(), v.to_string());
        }
    }

    Ok(Message {
        method: Method::from_name(method),
        version: version.to_string(),
        headers,
        payload: payload.to_string(),
    })
}

/// Prefix `body` with its length: 4 bytes big-endian + body.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge(body.len()));
    }
    let len = body.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Body length announced by a frame prefix.
pub fn frame_length(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

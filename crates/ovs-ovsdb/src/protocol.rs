//! JSON-RPC 1.0 message types and stream framing as used by RFC7047

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request or notification (`id` is null for notifications)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl Request {
    /// Create a request with a numeric id
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            method: method.into(),
            params,
            id: Value::from(id),
        }
    }

    /// Create with a specific id
    pub fn with_id(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id,
        }
    }

    /// Create a notification, which expects no reply
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            id: Value::Null,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_null()
    }
}

/// Reply to a request; exactly one of `result` and `error` is non-null
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
    pub id: Value,
}

impl Response {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            result,
            error: Value::Null,
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Value::String(error.into()),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_null()
    }
}

/// An inbound message, classified by shape
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Anything with a `method` member is a request or notification,
    /// everything else must be a response
    pub fn parse(value: Value) -> Result<Self, serde_json::Error> {
        if value.get("method").is_some() {
            serde_json::from_value(value).map(Message::Request)
        } else {
            serde_json::from_value(value).map(Message::Response)
        }
    }
}

/// Largest message the framer buffers before giving up on the peer
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Splits a byte stream into consecutive JSON values.
///
/// RFC7047 does not require a delimiter between messages, so values are
/// cut at the point where one complete JSON text ends. Bytes are scanned
/// once for bracket depth; a value is parsed only when its closing bracket
/// has arrived.
#[derive(Debug)]
pub struct MessageFramer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already scanned
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    limit: usize,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            limit,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete value, or `None` if more bytes are needed
    pub fn next_message(&mut self) -> Result<Option<Value>, serde_json::Error> {
        if self.scanned == 0 {
            let Some(start) = self.buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
                self.buffer.clear();
                return Ok(None);
            };
            self.buffer.drain(..start);
            if !matches!(self.buffer[0], b'{' | b'[') {
                return self.parse_scalar();
            }
        }
        match self.scan() {
            Some(end) => {
                let value = serde_json::from_slice(&self.buffer[..end]);
                self.buffer.drain(..end);
                self.reset_scan();
                value.map(Some)
            }
            None if self.buffer.len() > self.limit => Err(serde::de::Error::custom(format!(
                "message exceeds {} bytes",
                self.limit
            ))),
            None => Ok(None),
        }
    }

    /// Advance the scan; returns the end offset of a complete value
    fn scan(&mut self) -> Option<usize> {
        while self.scanned < self.buffer.len() {
            let b = self.buffer[self.scanned];
            self.scanned += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.scanned);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }

    /// Top-level scalars are not valid JSON-RPC but are still framed
    fn parse_scalar(&mut self) -> Result<Option<Value>, serde_json::Error> {
        let mut stream = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buffer.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode a message as one line
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = Request::new("transact", json!(["Open_vSwitch"]), 3);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"transact\""));
        assert!(json.contains("\"id\":3"));
        assert!(!json.contains("jsonrpc"));
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::success(json!(1), json!({"ok": true}));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["error"], Value::Null);
        assert!(!resp.is_error());
        assert!(Response::error(json!(1), "bad").is_error());
    }

    #[test]
    fn test_classify() {
        let update = json!({"id": null, "method": "update", "params": [null, {}]});
        match Message::parse(update).unwrap() {
            Message::Request(r) => assert!(r.is_notification()),
            other => panic!("unexpected {:?}", other),
        }
        let reply = json!({"id": 4, "result": [], "error": null});
        assert!(matches!(Message::parse(reply).unwrap(), Message::Response(_)));
    }

    #[test]
    fn test_framer_splits_concatenated_and_partial() {
        let mut framer = MessageFramer::new();
        framer.push(br#"{"id":1,"result":[]}{"id":2,"#);
        assert_eq!(framer.next_message().unwrap(), Some(json!({"id": 1, "result": []})));
        assert_eq!(framer.next_message().unwrap(), None);
        framer.push(b"\"result\":null}\n  ");
        assert_eq!(framer.next_message().unwrap(), Some(json!({"id": 2, "result": null})));
        assert_eq!(framer.next_message().unwrap(), None);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_framer_brackets_inside_strings() {
        let mut framer = MessageFramer::new();
        framer.push(br#"{"id":1,"result":["}]{\"", "[["]}"#);
        assert_eq!(
            framer.next_message().unwrap(),
            Some(json!({"id": 1, "result": ["}]{\"", "[["]}))
        );
    }

    #[test]
    fn test_framer_large_value_in_chunks() {
        let payload = "x".repeat(200_000);
        let bytes = serde_json::to_vec(&json!({"id": 7, "result": [payload]})).unwrap();
        let mut framer = MessageFramer::new();
        for chunk in bytes.chunks(4096) {
            assert_eq!(framer.next_message().unwrap(), None);
            framer.push(chunk);
        }
        let value = framer.next_message().unwrap().unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_framer_size_limit() {
        let mut framer = MessageFramer::with_limit(16);
        framer.push(br#"{"id":1,"result":"0123456789"#);
        assert!(framer.next_message().is_err());
    }

    #[test]
    fn test_framer_rejects_garbage() {
        let mut framer = MessageFramer::new();
        framer.push(b"}{");
        assert!(framer.next_message().is_err());
    }
}

//! NDJSON wire protocol.
//!
//! Every request is one JSON object on one line with a `cmd` field;
//! every response is one JSON object on one line with at least `ok`
//! and, on failure, `error`. A request carrying `"reply": false` gets no
//! response line.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Request-level failures reported back to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("request must be a JSON object")]
    NotAnObject,

    #[error("line too long")]
    LineTooLong,

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("unknown cmd: {0}")]
    UnknownCommand(String),
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Command name as sent, trimmed.
    pub cmd: String,
    /// False when the client asked for no response line.
    pub reply: bool,
    fields: Map<String, Value>,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let cmd = fields
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let reply = fields.get("reply").and_then(Value::as_bool).unwrap_or(true);
        Ok(Self { cmd, reply, fields })
    }

    /// First string field among `names`, as sent.
    fn raw(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .find_map(|n| self.fields.get(*n).and_then(Value::as_str))
    }

    /// First non-blank string field among `names`, trimmed.
    fn trimmed(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|n| self.fields.get(*n).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    fn flag(&self, name: &str) -> bool {
        self.fields.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    fn stream_id(&self) -> Result<String, ProtocolError> {
        self.trimmed(&["id", "stream_id"])
            .map(str::to_string)
            .ok_or(ProtocolError::Missing("stream_id"))
    }
}

/// A validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    GetState,
    SetVoice {
        voice: String,
    },
    Speak {
        text: String,
    },
    /// Queue an existing WAV file for playback.
    Play {
        path: PathBuf,
        override_current: bool,
        delete_after: bool,
    },
    BeginStream {
        id: Option<String>,
    },
    StreamPush {
        id: String,
        text: String,
    },
    StreamFinish {
        id: String,
    },
    StreamAbort {
        id: String,
    },
    StreamStatus {
        id: String,
    },
    StopAll,
    StopAndClear,
}

impl TryFrom<&Request> for Command {
    type Error = ProtocolError;

    fn try_from(req: &Request) -> Result<Self, Self::Error> {
        let command = match req.cmd.as_str() {
            "ping" => Command::Ping,
            "get_state" => Command::GetState,
            "set_voice" | "set_voice_prompt" => Command::SetVoice {
                voice: req
                    .trimmed(&["voice", "wav", "wav_path"])
                    .ok_or(ProtocolError::Missing("voice"))?
                    .to_string(),
            },
            "speak" => Command::Speak {
                text: req
                    .trimmed(&["text"])
                    .ok_or(ProtocolError::Missing("text"))?
                    .to_string(),
            },
            "play" => Command::Play {
                path: req
                    .trimmed(&["path"])
                    .map(PathBuf::from)
                    .ok_or(ProtocolError::Missing("path"))?,
                override_current: req.flag("override"),
                delete_after: req.flag("delete_after"),
            },
            "begin_stream" | "stream_begin" => Command::BeginStream {
                id: req.trimmed(&["id", "stream_id"]).map(str::to_string),
            },
            "stream_push" => Command::StreamPush {
                id: req.stream_id()?,
                text: req.raw(&["text"]).unwrap_or_default().to_string(),
            },
            "stream_finish" => Command::StreamFinish {
                id: req.stream_id()?,
            },
            "stream_abort" => Command::StreamAbort {
                id: req.stream_id()?,
            },
            "stream_status" => Command::StreamStatus {
                id: req.stream_id()?,
            },
            "stop_all" => Command::StopAll,
            "stop_and_clear" => Command::StopAndClear,
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

/// One response line.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn ok(cmd: &str) -> Self {
        Self {
            ok: true,
            cmd: Some(cmd.to_string()),
            error: None,
            extra: Map::new(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            ok: false,
            cmd: None,
            error: Some(message.to_string()),
            extra: Map::new(),
        }
    }

    /// Add a field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Merge the fields of a serializable object.
    pub fn merge(mut self, value: impl Serialize) -> Self {
        if let Ok(Value::Object(map)) = serde_json::to_value(value) {
            self.extra.extend(map);
        }
        self
    }

    /// Serialize without the trailing newline.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"ok":false,"error":"encode failed: {e}"}}"#))
    }
}

impl From<ProtocolError> for Response {
    fn from(e: ProtocolError) -> Self {
        Response::error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(line: &str) -> Result<Command, ProtocolError> {
        Command::try_from(&Request::parse(line)?)
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Request::parse("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(Request::parse("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_eq!(
            command(r#"{"cmd":"dance"}"#),
            Err(ProtocolError::UnknownCommand("dance".into()))
        );
        assert_eq!(
            command(r#"{}"#).unwrap_err().to_string(),
            "unknown cmd: "
        );
    }

    #[test]
    fn reply_defaults_to_true() {
        assert!(Request::parse(r#"{"cmd":"ping"}"#).unwrap().reply);
        assert!(!Request::parse(r#"{"cmd":"ping","reply":false}"#).unwrap().reply);
    }

    #[test]
    fn stream_id_aliases() {
        assert_eq!(
            command(r#"{"cmd":"stream_finish","id":" a "}"#).unwrap(),
            Command::StreamFinish { id: "a".into() }
        );
        assert_eq!(
            command(r#"{"cmd":"stream_finish","stream_id":"b"}"#).unwrap(),
            Command::StreamFinish { id: "b".into() }
        );
        assert_eq!(
            command(r#"{"cmd":"stream_status"}"#).unwrap_err().to_string(),
            "missing stream_id"
        );
    }

    #[test]
    fn begin_stream_spellings() {
        assert_eq!(
            command(r#"{"cmd":"begin_stream"}"#).unwrap(),
            Command::BeginStream { id: None }
        );
        assert_eq!(
            command(r#"{"cmd":"stream_begin","stream_id":"mine"}"#).unwrap(),
            Command::BeginStream {
                id: Some("mine".into())
            }
        );
    }

    #[test]
    fn speak_requires_text() {
        assert_eq!(command(r#"{"cmd":"speak"}"#), Err(ProtocolError::Missing("text")));
        assert_eq!(
            command(r#"{"cmd":"speak","text":"   "}"#).unwrap_err().to_string(),
            "missing text"
        );
    }

    #[test]
    fn push_keeps_text_verbatim() {
        assert_eq!(
            command(r#"{"cmd":"stream_push","id":"s","text":"Hello "}"#).unwrap(),
            Command::StreamPush {
                id: "s".into(),
                text: "Hello ".into()
            }
        );
        assert_eq!(
            command(r#"{"cmd":"stream_push","id":"s"}"#).unwrap(),
            Command::StreamPush {
                id: "s".into(),
                text: String::new()
            }
        );
    }

    #[test]
    fn voice_aliases() {
        for line in [
            r#"{"cmd":"set_voice","voice":"7"}"#,
            r#"{"cmd":"set_voice","wav":"7"}"#,
            r#"{"cmd":"set_voice_prompt","wav_path":"7"}"#,
        ] {
            assert_eq!(command(line).unwrap(), Command::SetVoice { voice: "7".into() });
        }
        assert_eq!(
            command(r#"{"cmd":"set_voice"}"#).unwrap_err().to_string(),
            "missing voice"
        );
    }

    #[test]
    fn play_flags() {
        assert_eq!(
            command(r#"{"cmd":"play","path":"/a.wav","override":true}"#).unwrap(),
            Command::Play {
                path: "/a.wav".into(),
                override_current: true,
                delete_after: false,
            }
        );
    }

    #[test]
    fn response_shape() {
        let line = Response::ok("speak").with("accepted", 3).to_line();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v, json!({"ok": true, "cmd": "speak", "accepted": 3}));

        let line = Response::error("busy").to_line();
        assert_eq!(line, r#"{"ok":false,"error":"busy"}"#);
    }

    #[test]
    fn merge_flattens_objects() {
        #[derive(Serialize)]
        struct S {
            done: bool,
        }
        let v: Value =
            serde_json::from_str(&Response::ok("stream_status").merge(S { done: true }).to_line())
                .unwrap();
        assert_eq!(v["done"], true);
    }
}

//! Transport-agnostic request and message shapes
//!
//! The engine core never sees a socket. Any adapter (HTTP handler,
//! WebSocket session, CLI) speaks these types: a batch request/response
//! pair, and tagged message enums for interactive sessions. Close codes for
//! session teardown live here too so every adapter agrees on them.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::JobEvent;
use crate::job::SourceFile;
use crate::types::{PhaseResult, Stage, StreamKind};

/// Request-shape errors; all of them are the client's fault
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request contains no files")]
    EmptyFiles,

    #[error("file '{0}' is not valid base64")]
    InvalidEncoding(String),

    #[error("writes are only accepted on the stdin stream, got '{0}'")]
    InvalidStream(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        400
    }
}

/// A batch execution request
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    /// Language name or alias
    pub language: String,

    /// Version spec: exact, numeric prefix, or "*"
    pub version: String,

    /// Files to stage; the first is the entry point
    pub files: Vec<FileEntry>,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Data written to the program's stdin
    #[serde(default)]
    pub stdin: String,

    /// Run phase wall clock budget in milliseconds
    #[serde(default)]
    pub run_timeout: Option<u64>,

    /// Compile phase wall clock budget in milliseconds
    #[serde(default)]
    pub compile_timeout: Option<u64>,

    /// Run phase memory limit in bytes, -1 for unlimited
    #[serde(default)]
    pub run_memory_limit: Option<i64>,

    /// Compile phase memory limit in bytes, -1 for unlimited
    #[serde(default)]
    pub compile_memory_limit: Option<i64>,
}

impl ExecuteRequest {
    /// Decode the request files into stageable form
    pub fn source_files(&self) -> Result<Vec<SourceFile>, ApiError> {
        if self.files.is_empty() {
            return Err(ApiError::EmptyFiles);
        }
        self.files
            .iter()
            .enumerate()
            .map(|(index, file)| file.decode(index))
            .collect()
    }
}

/// One file in a request
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    /// Slot-relative path; defaults to a generated name
    #[serde(default)]
    pub name: Option<String>,

    pub content: String,

    #[serde(default)]
    pub encoding: FileEncoding,

    /// Stage with the executable bit set
    #[serde(default)]
    pub executable: bool,
}

impl FileEntry {
    fn decode(&self, index: usize) -> Result<SourceFile, ApiError> {
        let content = match self.encoding {
            FileEncoding::Utf8 => self.content.clone().into_bytes(),
            FileEncoding::Base64 => BASE64.decode(&self.content).map_err(|_| {
                ApiError::InvalidEncoding(self.display_name(index))
            })?,
        };
        Ok(SourceFile {
            path: self
                .name
                .clone()
                .unwrap_or_else(|| format!("file{index}.code")),
            content,
            executable: self.executable,
        })
    }

    fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("file{index}.code"))
    }
}

/// How a file's `content` field is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Messages a client sends during an interactive session
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start the job; same fields as a batch request
    Init(Box<ExecuteRequest>),

    /// Write to the running program's stdin
    Data { stream: String, data: String },

    /// Deliver a signal to the current phase
    Signal { signal: String },
}

/// Messages the server publishes during an interactive session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The resolved runtime, sent right after init
    Runtime { language: String, version: String },

    /// A phase is starting
    Stage { stage: Stage },

    /// Program output
    Data { stream: StreamKind, data: String },

    /// A phase finished
    Exit {
        stage: Stage,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },

    /// Something went wrong; the session closes after this
    Error { message: String },
}

impl ServerMessage {
    /// Translate a bus event into the wire shape.
    ///
    /// `Completed` has no wire form; the adapter closes the session with
    /// [`close_code::COMPLETE`] instead.
    pub fn from_event(event: JobEvent) -> Option<Self> {
        match event {
            JobEvent::Stage { stage } => Some(ServerMessage::Stage { stage }),
            JobEvent::Data { stream, data } => Some(ServerMessage::Data {
                stream,
                data: String::from_utf8_lossy(&data).into_owned(),
            }),
            JobEvent::Exit {
                stage,
                exit_code,
                signal,
            } => Some(ServerMessage::Exit {
                stage,
                exit_code,
                signal,
            }),
            JobEvent::Completed => None,
        }
    }
}

/// Check a client data message targets stdin and hand back the payload
pub fn stdin_payload(stream: &str, data: &str) -> Result<Vec<u8>, ApiError> {
    if stream != "stdin" {
        return Err(ApiError::InvalidStream(stream.to_owned()));
    }
    Ok(data.as_bytes().to_vec())
}

/// Batch response body: the job result plus the resolved runtime identity
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub language: String,
    pub version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<PhaseResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<PhaseResult>,
}

impl From<crate::types::JobResult> for ExecuteResponse {
    fn from(result: crate::types::JobResult) -> Self {
        Self {
            language: result.language,
            version: result.version,
            compile: result.compile,
            run: result.run,
        }
    }
}

/// Session close codes shared by every interactive adapter
pub mod close_code {
    use std::time::Duration;

    /// A second init arrived on an initialized session
    pub const ALREADY_INITIALIZED: u16 = 4000;

    /// No init arrived within [`INIT_DEADLINE`]
    pub const INIT_TIMEOUT: u16 = 4001;

    /// The server sent an error message
    pub const ERROR: u16 = 4002;

    /// A data or signal message arrived before init
    pub const NOT_INITIALIZED: u16 = 4003;

    /// A data message targeted a stream other than stdin
    pub const INVALID_STREAM: u16 = 4004;

    /// A signal message named a signal outside the allow-list
    pub const INVALID_SIGNAL: u16 = 4005;

    /// The job ran to completion
    pub const COMPLETE: u16 = 4999;

    /// How long a fresh session may sit without an init message. The timer
    /// is canceled once the job begins priming, so an init that lands at
    /// the deadline either wins fully or loses fully.
    pub const INIT_DEADLINE: Duration = Duration::from_secs(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_minimal_json() {
        let request: ExecuteRequest = serde_json::from_str(
            r#"{"language":"python","version":"3.10","files":[{"content":"print(1+1)"}]}"#,
        )
        .unwrap();
        assert_eq!(request.language, "python");
        assert!(request.args.is_empty());
        assert!(request.stdin.is_empty());
        assert!(request.run_timeout.is_none());

        let files = request.source_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "file0.code");
        assert_eq!(files[0].content, b"print(1+1)");
    }

    #[test]
    fn request_with_no_files_is_rejected() {
        let request: ExecuteRequest =
            serde_json::from_str(r#"{"language":"python","version":"*","files":[]}"#).unwrap();
        assert!(matches!(
            request.source_files().unwrap_err(),
            ApiError::EmptyFiles
        ));
    }

    #[test]
    fn file_entry_base64_decoding() {
        let entry = FileEntry {
            name: Some("main.py".to_owned()),
            content: BASE64.encode("print(42)"),
            encoding: FileEncoding::Base64,
            executable: false,
        };
        let file = entry.decode(0).unwrap();
        assert_eq!(file.content, b"print(42)");
    }

    #[test]
    fn file_entry_invalid_base64() {
        let entry = FileEntry {
            name: Some("main.py".to_owned()),
            content: "not base64 !!!".to_owned(),
            encoding: FileEncoding::Base64,
            executable: false,
        };
        let err = entry.decode(0).unwrap_err();
        assert!(matches!(err, ApiError::InvalidEncoding(name) if name == "main.py"));
    }

    #[test]
    fn client_message_variants_parse() {
        let init: ClientMessage = serde_json::from_str(
            r#"{"type":"init","language":"python","version":"*","files":[{"content":"x"}]}"#,
        )
        .unwrap();
        assert!(matches!(init, ClientMessage::Init(_)));

        let data: ClientMessage =
            serde_json::from_str(r#"{"type":"data","stream":"stdin","data":"hello\n"}"#).unwrap();
        assert!(matches!(data, ClientMessage::Data { .. }));

        let signal: ClientMessage =
            serde_json::from_str(r#"{"type":"signal","signal":"SIGTERM"}"#).unwrap();
        assert!(matches!(signal, ClientMessage::Signal { .. }));
    }

    #[test]
    fn server_message_serialization() {
        let msg = ServerMessage::Exit {
            stage: Stage::Run,
            exit_code: Some(0),
            signal: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"exit","stage":"run","exit_code":0}"#);

        let msg = ServerMessage::Data {
            stream: StreamKind::Stdout,
            data: "hi\n".to_owned(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"data","stream":"stdout","data":"hi\n"}"#);
    }

    #[test]
    fn from_event_maps_all_variants() {
        assert!(matches!(
            ServerMessage::from_event(JobEvent::Stage { stage: Stage::Run }),
            Some(ServerMessage::Stage { .. })
        ));
        assert!(matches!(
            ServerMessage::from_event(JobEvent::Data {
                stream: StreamKind::Stderr,
                data: b"oops".to_vec(),
            }),
            Some(ServerMessage::Data { .. })
        ));
        assert!(ServerMessage::from_event(JobEvent::Completed).is_none());
    }

    #[test]
    fn stdin_payload_rejects_other_streams() {
        assert_eq!(stdin_payload("stdin", "x").unwrap(), b"x");
        assert!(matches!(
            stdin_payload("stdout", "x").unwrap_err(),
            ApiError::InvalidStream(_)
        ));
    }
}

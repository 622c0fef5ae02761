//! Wire format shared by every WebSocket connection.
//!
//! Each frame is a JSON envelope `{"event": "<kebab-name>", "data": {...}}`
//! with camelCase payload keys.
use serde::{Deserialize, Serialize};

/* ------------ 執行輸出 ------------ */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Command,
    Info,
    Success,
    Warning,
    Error,
    Output,
}

/// One unit of execution feedback, delivered in order to the whole room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub text: String,
}

impl OutputEvent {
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }
    pub fn command(text: impl Into<String>) -> Self { Self::new(OutputKind::Command, text) }
    pub fn info(text: impl Into<String>)    -> Self { Self::new(OutputKind::Info, text) }
    pub fn success(text: impl Into<String>) -> Self { Self::new(OutputKind::Success, text) }
    pub fn warning(text: impl Into<String>) -> Self { Self::new(OutputKind::Warning, text) }
    pub fn error(text: impl Into<String>)   -> Self { Self::new(OutputKind::Error, text) }
    pub fn output(text: impl Into<String>)  -> Self { Self::new(OutputKind::Output, text) }
}

/* ------------ 檔案節點 ------------ */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, alias = "content")]
    pub value: String,
}

/// Nested children sent by editors are ignored; descendants arrive as their
/// own `new-file`/`new-folder` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderPayload {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFile {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
}

/* ------------ client → server ------------ */
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    FileChange {
        file_id: String,
        #[serde(default)]
        value: Option<String>,
    },
    NewFile {
        file: FilePayload,
        #[serde(default)]
        parent_id: Option<String>,
    },
    NewFolder {
        folder: FolderPayload,
        #[serde(default)]
        parent_id: Option<String>,
    },
    DeleteFile {
        file_id: String,
    },
    RenameFile {
        file_id: String,
        new_name: String,
    },
    RunCode {
        #[serde(default)]
        active_file_id: Option<String>,
        files: Vec<RunFile>,
    },
}

/* ------------ server → client ------------ */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    RoomUsers(Vec<UserInfo>),
    FileChange {
        file_id: String,
        value: Option<String>,
    },
    NewFile {
        file: FilePayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    NewFolder {
        folder: FolderPayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    DeleteFile {
        file_id: String,
    },
    RenameFile {
        file_id: String,
        new_name: String,
    },
    TerminalOutput(OutputEvent),
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error { message: message.into() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_run_code_envelope() {
        let raw = json!({
            "event": "run-code",
            "data": {
                "roomId": "abc",
                "activeFileId": "1",
                "files": [
                    {"name": "main.py", "content": "print('hi')", "isActive": true},
                    {"name": "util.py", "content": ""}
                ]
            }
        });
        let ev: ClientEvent = serde_json::from_value(raw).unwrap();
        let ClientEvent::RunCode { active_file_id, files } = ev else {
            panic!("wrong variant");
        };
        assert_eq!(active_file_id.as_deref(), Some("1"));
        assert_eq!(files.len(), 2);
        assert!(files[0].is_active);
        assert!(!files[1].is_active);
    }

    #[test]
    fn new_file_accepts_editor_shape() {
        let raw = json!({
            "event": "new-file",
            "data": {
                "roomId": "abc",
                "file": {"id": "42", "name": "a.js", "language": "javascript", "value": "1", "type": "file"}
            }
        });
        let ev: ClientEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            ev,
            ClientEvent::NewFile {
                file: FilePayload {
                    id: "42".into(),
                    name: "a.js".into(),
                    language: Some("javascript".into()),
                    value: "1".into(),
                },
                parent_id: None,
            }
        );
    }

    #[test]
    fn terminal_output_serializes_with_type_key() {
        let ev = ServerEvent::TerminalOutput(OutputEvent::output("Hello"));
        let v: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
        assert_eq!(v, json!({"event": "terminal-output", "data": {"type": "output", "text": "Hello"}}));
    }

    #[test]
    fn rename_serializes_camel_case() {
        let ev = ServerEvent::RenameFile { file_id: "7".into(), new_name: "b.py".into() };
        let v: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
        assert_eq!(v["data"], json!({"fileId": "7", "newName": "b.py"}));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let raw = r#"{"event":"save-file","data":{"fileId":"1"}}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
    }
}

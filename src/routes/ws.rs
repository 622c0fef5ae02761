use std::sync::Arc;
use axum::{
    Router, routing::get, response::IntoResponse,
    extract::{ws::{WebSocketUpgrade, WebSocket, Message}, Query, Extension},
};
use futures_util::{SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast::error::RecvError, mpsc};

use crate::{
    error::{bad, AppResult, ExecError},
    exec::{ExecutionOrchestrator, ExecutionRequest, OutputSink},
    protocol::{ClientEvent, FilePayload, FolderPayload, OutputEvent, ServerEvent},
    state::{guess_language, Envelope, FileEvent, FileNode, Leave, Member, RoomRegistry, Snapshot, Tx},
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    room_id:  Option<String>,
    username: Option<String>,
    user_id:  Option<String>,
}

pub fn router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
    Extension(rooms): Extension<RoomRegistry>,
    Extension(runner): Extension<Arc<ExecutionOrchestrator>>,
) -> AppResult<impl IntoResponse> {
    let room = non_empty(q.room_id).ok_or_else(|| bad("roomId is required"))?;
    let conn_id = uuid::Uuid::new_v4().to_string();
    let member = Member {
        username: non_empty(q.username).unwrap_or_else(|| "Anonymous".into()),
        user_id:  non_empty(q.user_id).unwrap_or_else(|| conn_id.clone()),
        conn_id,
    };
    Ok(ws.on_upgrade(move |s| user_ws(s, room, member, rooms, runner)))
}

/* ---------------- 分派結果 ---------------- */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Only the connection that sent the event.
    Sender(ServerEvent),
    /// Every member except the sender.
    Others(ServerEvent),
}

#[derive(Debug, Default)]
pub struct Dispatch {
    pub outbound: Vec<Outbound>,
    pub job:      Option<ExecutionRequest>,
}

impl Dispatch {
    fn send(to: Outbound) -> Self { Self { outbound: vec![to], job: None } }
}

/// Handles one decoded client event for `room` and says what to send where.
pub async fn dispatch(rooms: &RoomRegistry, room: &str, ev: ClientEvent) -> Dispatch {
    let (file_ev, echo) = match ev {
        ClientEvent::RunCode { active_file_id, files } => {
            return match ExecutionRequest::new(room, files, active_file_id.as_deref()) {
                Ok(req) => Dispatch { outbound: vec![], job: Some(req) },
                Err(e)  => Dispatch::send(Outbound::Sender(ServerEvent::TerminalOutput(OutputEvent::error(e.to_string())))),
            };
        }
        ClientEvent::FileChange { file_id, value } => {
            let echo = ServerEvent::FileChange { file_id: file_id.clone(), value: value.clone() };
            match value {
                Some(content) => (Some(FileEvent::ContentChange { id: file_id, content }), echo),
                None          => (None, echo),
            }
        }
        ClientEvent::NewFile { file, parent_id } => {
            let node = FileNode::File {
                id:       file.id.clone(),
                name:     file.name.clone(),
                language: file.language.clone().unwrap_or_else(|| guess_language(&file.name).into()),
                content:  file.value.clone(),
            };
            let echo = ServerEvent::NewFile { file, parent_id: parent_id.clone() };
            (Some(FileEvent::Create { node, parent: parent_id }), echo)
        }
        ClientEvent::NewFolder { folder, parent_id } => {
            let node = FileNode::Folder { id: folder.id.clone(), name: folder.name.clone(), children: vec![] };
            let echo = ServerEvent::NewFolder { folder, parent_id: parent_id.clone() };
            (Some(FileEvent::Create { node, parent: parent_id }), echo)
        }
        ClientEvent::DeleteFile { file_id } => (
            Some(FileEvent::Delete { id: file_id.clone() }),
            ServerEvent::DeleteFile { file_id },
        ),
        ClientEvent::RenameFile { file_id, new_name } => (
            Some(FileEvent::Rename { id: file_id.clone(), new_name: new_name.clone() }),
            ServerEvent::RenameFile { file_id, new_name },
        ),
    };

    if let Some(fe) = file_ev {
        if let Err(e) = rooms.apply(room, fe).await {
            tracing::debug!(room = %room, error = %e, "rejected file event");
            return Dispatch::send(Outbound::Sender(ServerEvent::error(e.to_string())));
        }
    }
    Dispatch::send(Outbound::Others(echo))
}

/// Catch-up frames for a new joiner, parents before children.
pub fn replay(snapshot: &Snapshot) -> Vec<ServerEvent> {
    snapshot
        .nodes
        .iter()
        .map(|(node, parent)| match node {
            FileNode::File { id, name, language, content } => ServerEvent::NewFile {
                file: FilePayload {
                    id:       id.clone(),
                    name:     name.clone(),
                    language: Some(language.clone()),
                    value:    content.clone(),
                },
                parent_id: parent.clone(),
            },
            FileNode::Folder { id, name, .. } => ServerEvent::NewFolder {
                folder:    FolderPayload { id: id.clone(), name: name.clone() },
                parent_id: parent.clone(),
            },
        })
        .collect()
}

/// Execution output is shared room state: every member gets it.
pub struct RoomSink {
    tx: Tx,
}

impl OutputSink for RoomSink {
    fn emit(&self, event: OutputEvent) {
        // no receivers once everyone left; the job still finishes and cleans up
        let _ = self.tx.send(Envelope::to_all(ServerEvent::TerminalOutput(event).to_json()));
    }
}

/* ---------------- per user ---------------- */
async fn user_ws(
    sock: WebSocket,
    room: String, me: Member,
    rooms: RoomRegistry, runner: Arc<ExecutionOrchestrator>,
) {
    let (mut sink, mut stream) = sock.split();
    let conn_id = me.conn_id.clone();
    let (username, user_id) = (me.username.clone(), me.user_id.clone());

    /* 進房 (member list goes out from inside join) */
    let joined = rooms.join(&room, me).await;
    tracing::info!(
        room = %room, user = %username, user_id = %user_id, conn = %conn_id,
        members = joined.members.len(), files = joined.snapshot.nodes.len(), "joined"
    );
    let tx = joined.tx.clone();
    let mut rx = joined.rx;
    let (direct, mut direct_rx) = mpsc::unbounded_channel::<String>();
    for ev in replay(&joined.snapshot) {
        direct.send(ev.to_json()).ok();
    }

    let writer_conn = conn_id.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                biased;
                Some(text) = direct_rx.recv() => text,
                msg = rx.recv() => match msg {
                    Ok(env) if env.delivers_to(&writer_conn) => env.payload,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(conn = %writer_conn, skipped = n, "socket lagging behind room");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let raw = tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(raw))) => raw,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };
        let out = match serde_json::from_str::<ClientEvent>(&raw) {
            Ok(ev) => dispatch(&rooms, &room, ev).await,
            Err(e) => Dispatch::send(Outbound::Sender(ServerEvent::error(format!("malformed message: {e}")))),
        };
        for o in out.outbound {
            match o {
                Outbound::Sender(ev) => { direct.send(ev.to_json()).ok(); }
                Outbound::Others(ev) => { tx.send(Envelope::to_others(&conn_id, ev.to_json())).ok(); }
            }
        }
        if let Some(req) = out.job {
            start_job(&rooms, &runner, req, tx.clone(), &direct);
        }
    }
    writer.abort();

    /* 離房 */
    let remaining = match rooms.leave(&room, &conn_id).await {
        Leave::Remaining(left) => left.len(),
        Leave::RoomDeleted | Leave::NotMember => 0,
    };
    tracing::info!(room = %room, conn = %conn_id, remaining, "left");
}

fn start_job(
    rooms: &RoomRegistry,
    runner: &Arc<ExecutionOrchestrator>,
    req: ExecutionRequest,
    tx: Tx,
    direct: &mpsc::UnboundedSender<String>,
) {
    let Some(lease) = rooms.try_lease(&req.room_id) else {
        let busy = ServerEvent::TerminalOutput(ExecError::JobAlreadyRunning.to_event());
        direct.send(busy.to_json()).ok();
        return;
    };
    let runner = runner.clone();
    tokio::spawn(async move {
        let _lease = lease;
        runner.run(&req, &RoomSink { tx }).await;
    });
}

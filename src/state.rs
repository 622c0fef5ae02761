use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::{error::RoomError, protocol::{ServerEvent, UserInfo}};

/// Per-room fan-out buffer. Slow sockets that fall further behind lose frames.
const ROOM_CHANNEL_CAP: usize = 256;

/* ------------ 廣播封包 ------------ */
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Connection that must not receive this frame (editor deltas use local echo).
    pub skip: Option<String>,
    pub payload: String,
}

impl Envelope {
    pub fn to_all(payload: String) -> Self { Self { skip: None, payload } }
    pub fn to_others(from: &str, payload: String) -> Self {
        Self { skip: Some(from.to_owned()), payload }
    }
    pub fn delivers_to(&self, conn_id: &str) -> bool {
        self.skip.as_deref() != Some(conn_id)
    }
}

pub type Tx = broadcast::Sender<Envelope>;
pub type Rx = broadcast::Receiver<Envelope>;

/* ------------ 成員 / 檔案 ------------ */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub conn_id:  String,
    pub username: String,
    pub user_id:  String,
}

impl Member {
    pub fn info(&self) -> UserInfo {
        UserInfo { id: self.conn_id.clone(), username: self.username.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileNode {
    File   { id: String, name: String, language: String, content: String },
    Folder { id: String, name: String, children: Vec<String> },
}

impl FileNode {
    pub fn id(&self) -> &str {
        match self { FileNode::File { id, .. } | FileNode::Folder { id, .. } => id }
    }
}

/// Editor language tag for a file name.
pub fn guess_language(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("py")                     => "python",
        Some("js")                     => "javascript",
        Some("c") | Some("h")          => "c",
        Some("cpp") | Some("cc") | Some("cxx") | Some("hpp") => "cpp",
        Some("html")                   => "html",
        Some("css")                    => "css",
        Some("json")                   => "json",
        Some("md")                     => "markdown",
        _                              => "plaintext",
    }
}

/// An edit to the shared file tree, already decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    ContentChange { id: String, content: String },
    Create        { node: FileNode, parent: Option<String> },
    Delete        { id: String },
    Rename        { id: String, new_name: String },
}

/// Materialized tree handed to a late joiner: parents always precede children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub nodes:   Vec<(FileNode, Option<String>)>,
    pub members: Vec<Member>,
}

#[cfg(test)]
impl Snapshot {
    pub fn ids(&self) -> HashSet<String> {
        self.nodes.iter().map(|(n, _)| n.id().to_owned()).collect()
    }
}

/* ------------ 房間 ------------ */
pub struct Room {
    tx:      Tx,
    members: Vec<Member>,
    files:   HashMap<String, FileNode>,
    roots:   Vec<String>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(ROOM_CHANNEL_CAP);
        Self { tx, members: Vec::new(), files: HashMap::new(), roots: Vec::new() }
    }

    fn parent_of(&self, id: &str) -> Option<String> {
        self.files.values().find_map(|n| match n {
            FileNode::Folder { id: fid, children, .. } if children.iter().any(|c| c == id) => {
                Some(fid.clone())
            }
            _ => None,
        })
    }

    fn snapshot(&self) -> Snapshot {
        let mut nodes = Vec::with_capacity(self.files.len());
        let mut stack: Vec<(String, Option<String>)> =
            self.roots.iter().rev().map(|id| (id.clone(), None)).collect();
        while let Some((id, parent)) = stack.pop() {
            let Some(node) = self.files.get(&id) else { continue };
            if let FileNode::Folder { children, .. } = node {
                stack.extend(children.iter().rev().map(|c| (c.clone(), Some(id.clone()))));
            }
            nodes.push((node.clone(), parent));
        }
        Snapshot { nodes, members: self.members.clone() }
    }

    /// Sends the member list to everyone. Callers hold the room lock, so
    /// concurrent joins and leaves announce in the order they happened.
    fn announce_members(&self) {
        let users = self.members.iter().map(Member::info).collect::<Vec<UserInfo>>();
        let _ = self.tx.send(Envelope::to_all(ServerEvent::RoomUsers(users).to_json()));
    }

    /// `Ok(true)` when the tree changed, `Ok(false)` for a tolerated no-op.
    fn apply(&mut self, ev: FileEvent) -> Result<bool, RoomError> {
        match ev {
            FileEvent::ContentChange { id, content } => match self.files.get_mut(&id) {
                Some(FileNode::File { content: c, .. }) => { *c = content; Ok(true) }
                _ => Ok(false),
            },
            FileEvent::Create { node, parent } => {
                let id = node.id().to_owned();
                if self.files.contains_key(&id) {
                    return Err(RoomError::DuplicateId(id));
                }
                match parent {
                    Some(pid) => match self.files.get_mut(&pid) {
                        Some(FileNode::Folder { children, .. }) => children.push(id.clone()),
                        Some(FileNode::File { .. }) => return Err(RoomError::NotAFolder(pid)),
                        None => return Err(RoomError::NotFound(pid)),
                    },
                    None => self.roots.push(id.clone()),
                }
                self.files.insert(id, node);
                Ok(true)
            }
            FileEvent::Delete { id } => {
                if !self.files.contains_key(&id) {
                    return Ok(false);
                }
                match self.parent_of(&id) {
                    Some(pid) => {
                        if let Some(FileNode::Folder { children, .. }) = self.files.get_mut(&pid) {
                            children.retain(|c| c != &id);
                        }
                    }
                    None => self.roots.retain(|r| r != &id),
                }
                let mut doomed = vec![id];
                while let Some(next) = doomed.pop() {
                    if let Some(FileNode::Folder { children, .. }) = self.files.remove(&next) {
                        doomed.extend(children);
                    }
                }
                Ok(true)
            }
            FileEvent::Rename { id, new_name } => match self.files.get_mut(&id) {
                Some(FileNode::File { name, language, .. }) => {
                    *language = guess_language(&new_name).to_owned();
                    *name = new_name;
                    Ok(true)
                }
                Some(FileNode::Folder { name, .. }) => { *name = new_name; Ok(true) }
                None => Ok(false),
            },
        }
    }
}

/* ------------ 房間登記處 ------------ */
pub struct Joined {
    pub tx:       Tx,
    pub rx:       Rx,
    pub snapshot: Snapshot,
    /// Members after this join, the joiner last.
    pub members:  Vec<Member>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Leave {
    Remaining(Vec<Member>),
    RoomDeleted,
    NotMember,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id:         String,
    pub user_count: usize,
}

/// Owns every live room. Rooms are created on first join and dropped, file
/// tree included, when their last member leaves.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Arc<Mutex<Room>>>>>,
    jobs:  Arc<StdMutex<HashSet<String>>>,
}

impl RoomRegistry {
    pub async fn join(&self, room_id: &str, member: Member) -> Joined {
        let mut map = self.rooms.write().await;
        let room = map
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new())))
            .clone();
        let mut room = room.lock().await;
        drop(map);

        // snapshot first: the joiner sees the state from before its own arrival
        let snapshot = room.snapshot();
        room.members.retain(|m| m.conn_id != member.conn_id);
        room.members.push(member);
        let rx = room.tx.subscribe();
        room.announce_members();
        Joined { tx: room.tx.clone(), rx, snapshot, members: room.members.clone() }
    }

    pub async fn leave(&self, room_id: &str, conn_id: &str) -> Leave {
        let mut map = self.rooms.write().await;
        let Some(room) = map.get(room_id).cloned() else { return Leave::NotMember };
        let mut room = room.lock().await;

        let before = room.members.len();
        room.members.retain(|m| m.conn_id != conn_id);
        if room.members.len() == before {
            return Leave::NotMember;
        }
        if room.members.is_empty() {
            map.remove(room_id);
            tracing::info!(room = %room_id, "room is empty, discarding its files");
            return Leave::RoomDeleted;
        }
        room.announce_members();
        Leave::Remaining(room.members.clone())
    }

    pub async fn apply(&self, room_id: &str, ev: FileEvent) -> Result<bool, RoomError> {
        let room = self
            .rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomError::Protocol(format!("room {room_id} does not exist")))?;
        let mut room = room.lock().await;
        room.apply(ev)
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<Snapshot> {
        let room = self.rooms.read().await.get(room_id).cloned()?;
        let room = room.lock().await;
        Some(room.snapshot())
    }

    pub async fn list(&self) -> Vec<RoomSummary> {
        let rooms: Vec<(String, Arc<Mutex<Room>>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        let mut out = Vec::with_capacity(rooms.len());
        for (id, room) in rooms {
            out.push(RoomSummary { id, user_count: room.lock().await.members.len() });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// At most one execution job per room; `None` while another is in flight.
    pub fn try_lease(&self, room_id: &str) -> Option<JobLease> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        if !jobs.insert(room_id.to_owned()) {
            return None;
        }
        Some(JobLease { room: room_id.to_owned(), jobs: self.jobs.clone() })
    }
}

/// Held by a running job; releases the room's slot when dropped.
pub struct JobLease {
    room: String,
    jobs: Arc<StdMutex<HashSet<String>>>,
}

impl Drop for JobLease {
    fn drop(&mut self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.remove(&self.room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> Member {
        Member { conn_id: id.into(), username: format!("user-{id}"), user_id: id.into() }
    }

    fn file(id: &str, name: &str) -> FileNode {
        FileNode::File {
            id: id.into(),
            name: name.into(),
            language: guess_language(name).into(),
            content: String::new(),
        }
    }

    fn folder(id: &str) -> FileNode {
        FileNode::Folder { id: id.into(), name: format!("dir-{id}"), children: vec![] }
    }

    fn create(node: FileNode, parent: Option<&str>) -> FileEvent {
        FileEvent::Create { node, parent: parent.map(str::to_owned) }
    }

    #[tokio::test]
    async fn join_creates_room_and_leave_deletes_it() {
        let reg = RoomRegistry::default();
        let j = reg.join("r1", member("a")).await;
        assert!(j.snapshot.nodes.is_empty());
        reg.join("r1", member("b")).await;

        assert_eq!(reg.list().await, vec![RoomSummary { id: "r1".into(), user_count: 2 }]);
        assert_eq!(reg.leave("r1", "a").await, Leave::Remaining(vec![member("b")]));
        assert_eq!(reg.leave("r1", "b").await, Leave::RoomDeleted);
        assert!(reg.list().await.is_empty());
        assert_eq!(reg.leave("r1", "b").await, Leave::NotMember);
    }

    fn announced(env: &Envelope) -> Vec<String> {
        let v: serde_json::Value = serde_json::from_str(&env.payload).unwrap();
        assert_eq!(v["event"], "room-users");
        v["data"].as_array().unwrap().iter().map(|u| u["id"].as_str().unwrap().to_owned()).collect()
    }

    #[tokio::test]
    async fn concurrent_joins_end_with_the_full_member_list() {
        let reg = RoomRegistry::default();
        let mut watcher = reg.join("r", member("w")).await.rx;
        let (a, b) = tokio::join!(reg.join("r", member("a")), reg.join("r", member("b")));
        assert_eq!(a.members.len() + b.members.len(), 5);

        let mut last = Vec::new();
        while let Ok(env) = watcher.try_recv() {
            last = announced(&env);
        }
        last.sort();
        assert_eq!(last, vec!["a", "b", "w"]);
    }

    #[tokio::test]
    async fn joiner_and_leaver_announcements_follow_membership() {
        let reg = RoomRegistry::default();
        let mut rx = reg.join("r", member("a")).await.rx;
        assert_eq!(announced(&rx.try_recv().unwrap()), vec!["a"]);

        reg.join("r", member("b")).await;
        assert_eq!(announced(&rx.try_recv().unwrap()), vec!["a", "b"]);

        reg.leave("r", "b").await;
        assert_eq!(announced(&rx.try_recv().unwrap()), vec!["a"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn files_are_discarded_with_the_room() {
        let reg = RoomRegistry::default();
        reg.join("r", member("a")).await;
        reg.apply("r", create(file("1", "main.py"), None)).await.unwrap();
        reg.leave("r", "a").await;

        let j = reg.join("r", member("b")).await;
        assert!(j.snapshot.nodes.is_empty());
    }

    #[tokio::test]
    async fn late_joiner_sees_latest_content_in_tree_order() {
        let reg = RoomRegistry::default();
        reg.join("r", member("a")).await;
        reg.apply("r", create(folder("d"), None)).await.unwrap();
        reg.apply("r", create(file("1", "a.py"), Some("d"))).await.unwrap();
        reg.apply("r", create(file("2", "b.py"), None)).await.unwrap();
        reg.apply("r", FileEvent::ContentChange { id: "1".into(), content: "x = 1".into() })
            .await
            .unwrap();

        let j = reg.join("r", member("b")).await;
        let order: Vec<_> = j.snapshot.nodes.iter().map(|(n, p)| (n.id(), p.as_deref())).collect();
        assert_eq!(order, vec![("d", None), ("1", Some("d")), ("2", None)]);
        match &j.snapshot.nodes[1].0 {
            FileNode::File { content, language, .. } => {
                assert_eq!(content, "x = 1");
                assert_eq!(language, "python");
            }
            other => panic!("expected file, got {other:?}"),
        }
        // the joiner itself is not part of its own catch-up state
        assert_eq!(j.snapshot.members, vec![member("a")]);
    }

    #[tokio::test]
    async fn create_under_missing_parent_fails() {
        let reg = RoomRegistry::default();
        reg.join("r", member("a")).await;
        let err = reg.apply("r", create(file("1", "a.c"), Some("nope"))).await.unwrap_err();
        assert_eq!(err, RoomError::NotFound("nope".into()));

        reg.apply("r", create(file("2", "b.c"), None)).await.unwrap();
        let err = reg.apply("r", create(file("3", "c.c"), Some("2"))).await.unwrap_err();
        assert_eq!(err, RoomError::NotAFolder("2".into()));
        let err = reg.apply("r", create(file("2", "dup.c"), None)).await.unwrap_err();
        assert_eq!(err, RoomError::DuplicateId("2".into()));
    }

    #[tokio::test]
    async fn unknown_ids_are_no_ops() {
        let reg = RoomRegistry::default();
        reg.join("r", member("a")).await;
        assert_eq!(reg.apply("r", FileEvent::Delete { id: "x".into() }).await, Ok(false));
        assert_eq!(
            reg.apply("r", FileEvent::Rename { id: "x".into(), new_name: "y".into() }).await,
            Ok(false)
        );
        assert_eq!(
            reg.apply("r", FileEvent::ContentChange { id: "x".into(), content: "z".into() }).await,
            Ok(false)
        );
    }

    #[tokio::test]
    async fn deleting_folder_removes_descendants() {
        let reg = RoomRegistry::default();
        reg.join("r", member("a")).await;
        reg.apply("r", create(folder("top"), None)).await.unwrap();
        reg.apply("r", create(folder("mid"), Some("top"))).await.unwrap();
        reg.apply("r", create(file("leaf", "x.py"), Some("mid"))).await.unwrap();
        reg.apply("r", create(file("keep", "y.py"), None)).await.unwrap();

        assert_eq!(reg.apply("r", FileEvent::Delete { id: "top".into() }).await, Ok(true));
        let snap = reg.snapshot("r").await.unwrap();
        assert_eq!(snap.ids(), HashSet::from(["keep".to_string()]));

        let renamed = reg
            .apply("r", FileEvent::Rename { id: "leaf".into(), new_name: "z.py".into() })
            .await;
        assert_eq!(renamed, Ok(false));
    }

    #[tokio::test]
    async fn replaying_a_sequence_yields_the_same_ids() {
        let events = vec![
            create(folder("f"), None),
            create(file("1", "a.py"), Some("f")),
            create(file("2", "b.py"), None),
            FileEvent::Rename { id: "2".into(), new_name: "c.js".into() },
            FileEvent::Delete { id: "1".into() },
            FileEvent::Delete { id: "1".into() },
            create(file("3", "d.c"), Some("f")),
        ];

        let reg = RoomRegistry::default();
        reg.join("live", member("a")).await;
        for ev in events.clone() {
            let _ = reg.apply("live", ev).await;
        }
        reg.join("replay", member("b")).await;
        for ev in events {
            let _ = reg.apply("replay", ev).await;
        }

        let live = reg.snapshot("live").await.unwrap().ids();
        let replay = reg.snapshot("replay").await.unwrap().ids();
        assert_eq!(live, replay);
        assert_eq!(live, HashSet::from(["f".into(), "2".into(), "3".into()]));
    }

    #[tokio::test]
    async fn rename_updates_language() {
        let reg = RoomRegistry::default();
        reg.join("r", member("a")).await;
        reg.apply("r", create(file("1", "a.py"), None)).await.unwrap();
        reg.apply("r", FileEvent::Rename { id: "1".into(), new_name: "a.cpp".into() })
            .await
            .unwrap();
        let snap = reg.snapshot("r").await.unwrap();
        assert!(matches!(
            &snap.nodes[0].0,
            FileNode::File { name, language, .. } if name == "a.cpp" && language == "cpp"
        ));
    }

    #[tokio::test]
    async fn apply_on_unknown_room_is_protocol_error() {
        let reg = RoomRegistry::default();
        let err = reg.apply("ghost", FileEvent::Delete { id: "1".into() }).await.unwrap_err();
        assert!(matches!(err, RoomError::Protocol(_)));
    }

    #[test]
    fn one_lease_per_room() {
        let reg = RoomRegistry::default();
        let lease = reg.try_lease("r").expect("first lease");
        assert!(reg.try_lease("r").is_none());
        assert!(reg.try_lease("other").is_some());
        drop(lease);
        assert!(reg.try_lease("r").is_some());
    }

    #[test]
    fn envelope_skips_only_the_origin() {
        let env = Envelope::to_others("a", "{}".into());
        assert!(!env.delivers_to("a"));
        assert!(env.delivers_to("b"));
        assert!(Envelope::to_all("{}".into()).delivers_to("a"));
    }
}

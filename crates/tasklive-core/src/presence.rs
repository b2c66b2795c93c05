use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tasklive_shared::{IdentifyArgs, PeerIdentity, PushFrame};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PALETTE: [&str; 8] = [
    "#6366f1", "#ec4899", "#f59e0b", "#10b981", "#3b82f6", "#8b5cf6", "#ef4444", "#14b8a6",
];

/// Name and color this client announces on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayIdentity {
    pub name: String,
    pub color: String,
}

impl DisplayIdentity {
    /// Builds an identity from explicit hints, falling back to the login
    /// name plus a short random suffix and a palette color.
    pub fn derive(name: Option<&str>, color: Option<&str>) -> Self {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(default_name);
        let color = color
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| color_for(&name).to_string());
        Self { name, color }
    }

    /// Loads the persisted identity at `path`, or derives one and writes it
    /// there. Explicit hints override what was stored.
    #[tracing::instrument(skip(path), fields(path = %path.display()))]
    pub fn load_or_create(
        path: &Path,
        name: Option<&str>,
        color: Option<&str>,
    ) -> anyhow::Result<Self> {
        let stored = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            match toml::from_str::<DisplayIdentity>(&raw) {
                Ok(identity) => Some(identity),
                Err(err) => {
                    warn!(error = %err, "ignoring unreadable identity file");
                    None
                }
            }
        } else {
            None
        };

        let identity = match stored {
            Some(stored) => DisplayIdentity::derive(
                name.or(Some(stored.name.as_str())),
                color.or(Some(stored.color.as_str())),
            ),
            None => DisplayIdentity::derive(name, color),
        };

        identity.save(path)?;
        debug!(name = %identity.name, color = %identity.color, "display identity ready");
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let serialized = toml::to_string(self).context("failed to serialize identity")?;
        let mut temp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        temp.write_all(serialized.as_bytes())
            .and_then(|()| temp.flush())
            .with_context(|| format!("failed to write identity for {}", path.display()))?;
        temp.persist(path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;
        Ok(())
    }

    pub fn identify_args(&self) -> IdentifyArgs {
        IdentifyArgs {
            username: self.name.clone(),
            color: self.color.clone(),
        }
    }
}

/// Stable palette pick for a name.
pub fn color_for(name: &str) -> &'static str {
    // FNV-1a
    let hash = name.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |acc, byte| {
        (acc ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    });
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

fn default_name() -> String {
    let login = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "guest".to_string());
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(4).collect();
    format!("{login}-{suffix}")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    pub me: Option<PeerIdentity>,
    pub peers: Vec<PeerIdentity>,
}

/// Roster of peers currently on the push channel. Independent of task data.
#[derive(Debug)]
pub struct PresenceTracker {
    identity: DisplayIdentity,
    me: Option<PeerIdentity>,
    peers: Vec<PeerIdentity>,
}

impl PresenceTracker {
    pub fn new(identity: DisplayIdentity) -> Self {
        Self {
            identity,
            me: None,
            peers: Vec::new(),
        }
    }

    pub fn identity(&self) -> &DisplayIdentity {
        &self.identity
    }

    pub fn me(&self) -> Option<&PeerIdentity> {
        self.me.as_ref()
    }

    pub fn peers(&self) -> &[PeerIdentity] {
        &self.peers
    }

    pub fn view(&self) -> PresenceView {
        PresenceView {
            me: self.me.clone(),
            peers: self.peers.clone(),
        }
    }

    /// Applies a presence frame. Returns `false` for frames that are not
    /// about presence.
    pub fn apply(&mut self, frame: &PushFrame) -> bool {
        match frame {
            PushFrame::UserIdentify(peer) => self.identified(peer.clone()),
            PushFrame::UsersList(peers) => self.replace_roster(peers.clone()),
            PushFrame::UserConnected(peer) => self.join(peer.clone()),
            PushFrame::UserDisconnected(arg) => self.leave(&arg.socket_id),
            PushFrame::TaskCreated(_) | PushFrame::TaskUpdated(_) | PushFrame::TaskDeleted(_) => {
                return false;
            }
        }
        true
    }

    /// The service's echo of this connection's announced identity.
    pub fn identified(&mut self, peer: PeerIdentity) {
        info!(socket_id = %peer.socket_id, username = %peer.username, "identity acknowledged");
        self.me = Some(peer.clone());
        self.join(peer);
    }

    pub fn replace_roster(&mut self, peers: Vec<PeerIdentity>) {
        self.peers.clear();
        for peer in peers {
            self.join(peer);
        }
    }

    pub fn join(&mut self, peer: PeerIdentity) {
        match self.peers.iter_mut().find(|p| p.socket_id == peer.socket_id) {
            Some(existing) => *existing = peer,
            None => self.peers.push(peer),
        }
    }

    pub fn leave(&mut self, socket_id: &str) {
        self.peers.retain(|p| p.socket_id != socket_id);
        if self.me.as_ref().is_some_and(|me| me.socket_id == socket_id) {
            self.me = None;
        }
    }

    /// Channel lost: nobody is known to be online, including us.
    pub fn clear(&mut self) {
        self.peers.clear();
        self.me = None;
    }
}

#[cfg(test)]
mod tests {
    use tasklive_shared::SocketIdArg;
    use tempfile::tempdir;

    use super::*;

    fn peer(socket_id: &str, username: &str) -> PeerIdentity {
        PeerIdentity {
            socket_id: socket_id.to_string(),
            username: username.to_string(),
            color: color_for(username).to_string(),
        }
    }

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(DisplayIdentity::derive(Some("ana"), None))
    }

    #[test]
    fn roster_tracks_joins_and_leaves() {
        let mut presence = tracker();
        presence.apply(&PushFrame::UsersList(vec![peer("s1", "ana"), peer("s2", "bo")]));
        presence.apply(&PushFrame::UserConnected(peer("s3", "cy")));
        presence.apply(&PushFrame::UserConnected(peer("s3", "cy")));
        presence.apply(&PushFrame::UserDisconnected(SocketIdArg {
            socket_id: "s2".to_string(),
        }));

        let names: Vec<&str> = presence.peers().iter().map(|p| p.username.as_str()).collect();
        assert_eq!(names, vec!["ana", "cy"]);
    }

    #[test]
    fn identify_echo_sets_me_and_disconnect_clears_everything() {
        let mut presence = tracker();
        assert!(presence.apply(&PushFrame::UserIdentify(peer("s1", "ana"))));
        assert_eq!(presence.me().map(|me| me.socket_id.as_str()), Some("s1"));
        assert_eq!(presence.peers().len(), 1);

        presence.clear();
        assert!(presence.me().is_none());
        assert!(presence.peers().is_empty());
    }

    #[test]
    fn derive_prefers_hints_and_picks_stable_colors() {
        let identity = DisplayIdentity::derive(Some("  ana "), None);
        assert_eq!(identity.name, "ana");
        assert_eq!(identity.color, color_for("ana"));
        assert_eq!(color_for("ana"), color_for("ana"));

        let generated = DisplayIdentity::derive(None, Some("#000000"));
        assert!(!generated.name.is_empty());
        assert_eq!(generated.color, "#000000");
    }

    #[test]
    fn failed_saves_name_the_path() {
        let temp = tempdir().expect("tempdir");
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "").expect("write blocker");
        let identity = DisplayIdentity::derive(Some("ana"), None);

        let err = identity
            .save(&blocker.join("identity.toml"))
            .expect_err("parent is a file");
        assert!(format!("{err:#}").contains("not-a-dir"));

        let occupied = temp.path().join("occupied");
        fs::create_dir(&occupied).expect("create dir");
        let err = identity.save(&occupied).expect_err("target is a directory");
        assert!(format!("{err:#}").contains("occupied"));
    }

    #[test]
    fn identity_is_persisted_and_reloaded() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("identity.toml");

        let first = DisplayIdentity::load_or_create(&path, None, None).expect("create identity");
        assert!(path.exists());

        let second = DisplayIdentity::load_or_create(&path, None, None).expect("reload identity");
        assert_eq!(first, second);

        let renamed =
            DisplayIdentity::load_or_create(&path, Some("bo"), None).expect("override name");
        assert_eq!(renamed.name, "bo");
        assert_eq!(renamed.color, first.color);
    }
}

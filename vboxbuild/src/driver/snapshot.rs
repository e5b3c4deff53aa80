//! Snapshot tree of a single VM.
//!
//! Built fresh from `snapshot <vm> list --machinereadable` on every call;
//! nothing is cached across driver calls.

use vboxbuild_shared::errors::{BuildError, BuildResult};

/// One snapshot node. `parent` holds the parent's UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    pub uuid: String,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotTree {
    nodes: Vec<Snapshot>,
    current: Option<String>,
}

impl SnapshotTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse machine-readable snapshot listing.
    ///
    /// Node keys carry their tree position as a suffix: `SnapshotName` is the
    /// root, `SnapshotName-1` its first child, `SnapshotName-1-2` the second
    /// child of that child. `CurrentSnapshotUUID` marks the current node.
    pub fn parse(output: &str) -> BuildResult<Self> {
        let mut names: Vec<(String, String)> = Vec::new();
        let mut uuids: Vec<(String, String)> = Vec::new();
        let mut current = None;

        for line in output.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().trim_matches('"');
            let value = value.trim().trim_matches('"').to_string();

            if key == "CurrentSnapshotUUID" {
                current = Some(value);
            } else if let Some(position) = key.strip_prefix("SnapshotName") {
                names.push((position.to_string(), value));
            } else if let Some(position) = key.strip_prefix("SnapshotUUID") {
                uuids.push((position.to_string(), value));
            }
        }

        let uuid_at = |position: &str| {
            uuids
                .iter()
                .find(|(p, _)| p == position)
                .map(|(_, uuid)| uuid.clone())
        };

        let mut tree = SnapshotTree::new();
        for (position, name) in &names {
            let uuid = uuid_at(position).ok_or_else(|| {
                BuildError::Parse(format!("snapshot {:?} has no UUID", name))
            })?;
            let parent = match position.rsplit_once('-') {
                Some((parent_position, _)) => Some(uuid_at(parent_position).ok_or_else(|| {
                    BuildError::Parse(format!("snapshot {:?} has no parent entry", name))
                })?),
                None => None,
            };
            tree.nodes.push(Snapshot {
                name: name.clone(),
                uuid,
                parent,
            });
        }

        if let Some(uuid) = &current
            && tree.find_by_uuid(uuid).is_none()
        {
            return Err(BuildError::Parse(format!(
                "current snapshot {} is not in the tree",
                uuid
            )));
        }
        tree.current = current;
        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.nodes.iter()
    }

    pub fn root(&self) -> Option<&Snapshot> {
        self.nodes.iter().find(|s| s.parent.is_none())
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_deref().and_then(|uuid| self.find_by_uuid(uuid))
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<&Snapshot> {
        self.nodes.iter().find(|s| s.uuid == uuid)
    }

    /// Every snapshot with the given name. Names are not unique in VirtualBox.
    pub fn find_by_name(&self, name: &str) -> Vec<&Snapshot> {
        self.nodes.iter().filter(|s| s.name == name).collect()
    }

    pub fn children(&self, uuid: &str) -> Vec<&Snapshot> {
        self.nodes
            .iter()
            .filter(|s| s.parent.as_deref() == Some(uuid))
            .collect()
    }

    pub fn parent(&self, snapshot: &Snapshot) -> Option<&Snapshot> {
        snapshot
            .parent
            .as_deref()
            .and_then(|uuid| self.find_by_uuid(uuid))
    }

    /// Add a snapshot below the current one and make it current.
    pub fn push(&mut self, name: impl Into<String>, uuid: impl Into<String>) -> &Snapshot {
        let uuid = uuid.into();
        self.nodes.push(Snapshot {
            name: name.into(),
            uuid: uuid.clone(),
            parent: self.current.clone(),
        });
        self.current = Some(uuid);
        let last = self.nodes.len() - 1;
        &self.nodes[last]
    }

    pub fn set_current(&mut self, uuid: &str) -> BuildResult<()> {
        if self.find_by_uuid(uuid).is_none() {
            return Err(BuildError::Internal(format!("unknown snapshot {}", uuid)));
        }
        self.current = Some(uuid.to_string());
        Ok(())
    }

    /// Remove a snapshot; its children are re-parented to its parent,
    /// matching how the hypervisor merges a deleted snapshot.
    pub fn remove(&mut self, uuid: &str) -> BuildResult<Snapshot> {
        let index = self
            .nodes
            .iter()
            .position(|s| s.uuid == uuid)
            .ok_or_else(|| BuildError::Internal(format!("unknown snapshot {}", uuid)))?;
        let removed = self.nodes.remove(index);

        for node in &mut self.nodes {
            if node.parent.as_deref() == Some(uuid) {
                node.parent = removed.parent.clone();
            }
        }
        if self.current.as_deref() == Some(uuid) {
            self.current = removed.parent.clone();
        }
        Ok(removed)
    }
}

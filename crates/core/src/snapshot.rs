//! Validated cluster snapshots derived from a mirrored scope tree.

use itertools::Itertools;
use thiserror::Error;
use tracing::warn;

use crate::record::{decode, DecodeError, MemberRecord, MemberState, Role};
use crate::tree::TreeNode;

/// Name of the scope child holding one node per cluster member.
pub const MEMBERS_NODE: &str = "members";

/// Structural errors found while building a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("tree at '{path}' is in an invalid state: no 'members' node")]
    MissingMembers { path: String },

    #[error("member '{member}' has an invalid record: {source}")]
    InvalidMember {
        member: String,
        #[source]
        source: DecodeError,
    },

    #[error("more than one primary: '{first}' and '{second}'")]
    MultiplePrimaries { first: String, second: String },
}

/// Renderable form of one member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    /// `postgresql_<host>_<port>`, stable for a given connection address.
    pub id: String,
    /// Connection address as `host:port`.
    pub host: String,
    pub health_check_port: String,
    pub is_running: bool,
    pub is_primary: bool,
}

impl Backend {
    /// Derive a backend from a decoded member record.
    pub fn from_record(record: &MemberRecord) -> Self {
        let host = record.connection_address.to_string();
        Self {
            id: format!("postgresql_{}", host.replace(':', "_")),
            host,
            health_check_port: record.health_check_address.port.to_string(),
            is_running: record.state == MemberState::Running,
            is_primary: record.role == Role::Primary,
        }
    }
}

/// Primary plus the running replicas, in render order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub primary: Option<Backend>,
    /// Running, non-primary backends sorted by id, unique by id.
    pub replicas: Vec<Backend>,
}

impl ClusterSnapshot {
    /// Build a snapshot from already-derived backends.
    ///
    /// Fails if more than one backend claims the primary role.
    pub fn from_backends(
        backends: impl IntoIterator<Item = Backend>,
    ) -> Result<Self, SnapshotError> {
        let mut primary: Option<Backend> = None;
        let mut replicas = Vec::new();

        for backend in backends {
            if backend.is_primary {
                if let Some(first) = &primary {
                    return Err(SnapshotError::MultiplePrimaries {
                        first: first.id.clone(),
                        second: backend.id,
                    });
                }
                primary = Some(backend);
            } else if backend.is_running {
                replicas.push(backend);
            }
        }

        let before = replicas.len();
        let replicas = replicas
            .into_iter()
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .dedup_by(|a, b| a.id == b.id)
            .collect_vec();
        if replicas.len() != before {
            warn!(
                duplicates = before.saturating_sub(replicas.len()),
                "Several members share a connection address; rendering each address once"
            );
        }

        Ok(Self { primary, replicas })
    }

    /// Number of backends that will be rendered.
    pub fn backend_count(&self) -> usize {
        self.replicas.len().saturating_add(usize::from(self.primary.is_some()))
    }
}

/// Build a snapshot from the mirrored scope tree.
///
/// Requires a direct `members` child. Any member whose record fails to
/// decode aborts the whole build.
pub fn build_snapshot(root: &TreeNode) -> Result<ClusterSnapshot, SnapshotError> {
    let members = root
        .child(MEMBERS_NODE)
        .ok_or_else(|| SnapshotError::MissingMembers {
            path: root.path.clone(),
        })?;

    let backends = members
        .children
        .values()
        .map(|member| {
            decode(&member.value)
                .map(|record| Backend::from_record(&record))
                .map_err(|source| SnapshotError::InvalidMember {
                    member: member.name.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    ClusterSnapshot::from_backends(backends)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn member_json(ip: &str, state: &str, role: &str) -> String {
        format!(
            r#"{{"conn_url":"postgres://{ip}:5433","api_url":"http://{ip}:8009","state":"{state}","role":"{role}"}}"#
        )
    }

    fn scope(members: &[(&str, String)]) -> TreeNode {
        let mut root = TreeNode::new("/service/demo");
        let mut members_node = TreeNode::new(root.child_path(MEMBERS_NODE));
        for (name, value) in members {
            let mut node = TreeNode::new(members_node.child_path(name));
            node.value = value.clone().into_bytes();
            members_node.insert_child(node);
        }
        root.insert_child(members_node);
        root
    }

    #[test]
    fn test_primary_and_replica() {
        let root = scope(&[
            ("node1", member_json("10.0.0.1", "running", "master")),
            ("node2", member_json("10.0.0.2", "running", "replica")),
        ]);
        let snapshot = build_snapshot(&root).unwrap();

        let primary = snapshot.primary.unwrap();
        assert_eq!(primary.id, "postgresql_10.0.0.1_5433");
        assert_eq!(primary.host, "10.0.0.1:5433");
        assert_eq!(primary.health_check_port, "8009");
        assert!(primary.is_primary && primary.is_running);

        assert_eq!(snapshot.replicas.len(), 1);
        assert_eq!(snapshot.replicas[0].id, "postgresql_10.0.0.2_5433");
        assert_eq!(snapshot.replicas[0].host, "10.0.0.2:5433");
    }

    #[test]
    fn test_stopped_replica_is_excluded() {
        let root = scope(&[
            ("node1", member_json("10.0.0.1", "running", "master")),
            ("node2", member_json("10.0.0.2", "stopped", "replica")),
        ]);
        let snapshot = build_snapshot(&root).unwrap();
        assert!(snapshot.primary.is_some());
        assert!(snapshot.replicas.is_empty());
    }

    #[test]
    fn test_stopped_primary_is_still_primary() {
        let root = scope(&[("node1", member_json("10.0.0.1", "stopped", "master"))]);
        let primary = build_snapshot(&root).unwrap().primary.unwrap();
        assert!(!primary.is_running);
    }

    #[test]
    fn test_replicas_sorted_by_id_regardless_of_member_names() {
        let root = scope(&[
            ("a", member_json("10.0.0.9", "running", "replica")),
            ("b", member_json("10.0.0.3", "running", "replica")),
            ("c", member_json("10.0.0.5", "running", "replica")),
        ]);
        let ids: Vec<String> = build_snapshot(&root)
            .unwrap()
            .replicas
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "postgresql_10.0.0.3_5433",
                "postgresql_10.0.0.5_5433",
                "postgresql_10.0.0.9_5433",
            ]
        );
    }

    #[test]
    fn test_duplicate_addresses_render_once() {
        let root = scope(&[
            ("a", member_json("10.0.0.3", "running", "replica")),
            ("b", member_json("10.0.0.3", "running", "replica")),
        ]);
        assert_eq!(build_snapshot(&root).unwrap().replicas.len(), 1);
    }

    #[test]
    fn test_no_primary_known() {
        let root = scope(&[("node2", member_json("10.0.0.2", "running", "replica"))]);
        let snapshot = build_snapshot(&root).unwrap();
        assert!(snapshot.primary.is_none());
        assert_eq!(snapshot.backend_count(), 1);
    }

    #[test]
    fn test_two_primaries_fail_validation() {
        let root = scope(&[
            ("node1", member_json("10.0.0.1", "running", "master")),
            ("node2", member_json("10.0.0.2", "running", "master")),
        ]);
        assert_eq!(
            build_snapshot(&root),
            Err(SnapshotError::MultiplePrimaries {
                first: "postgresql_10.0.0.1_5433".to_string(),
                second: "postgresql_10.0.0.2_5433".to_string(),
            })
        );
    }

    #[test]
    fn test_corrupt_record_aborts_build() {
        let root = scope(&[
            ("node1", member_json("10.0.0.1", "running", "master")),
            (
                "node2",
                r#"{"conn_url":"::bad::","api_url":"http://10.0.0.2:8009","state":"running","role":"replica"}"#
                    .to_string(),
            ),
        ]);
        let err = build_snapshot(&root).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::InvalidMember { ref member, .. } if member == "node2"
        ));
    }

    #[test]
    fn test_missing_members_node() {
        let root = TreeNode::new("/service/demo");
        assert_eq!(
            build_snapshot(&root),
            Err(SnapshotError::MissingMembers {
                path: "/service/demo".to_string()
            })
        );
    }

    #[test]
    fn test_empty_members_gives_empty_snapshot() {
        let snapshot = build_snapshot(&scope(&[])).unwrap();
        assert_eq!(snapshot, ClusterSnapshot::default());
    }
}

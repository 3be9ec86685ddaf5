//! Permission resolution
//!
//! Derives what a user may approve from their directory groups, the configured
//! admin and platform teams, and the groups that appear in each cluster's
//! JitGroupCache. Teams match only when both id and name agree.

use std::collections::BTreeSet;

use kube_jit_common::crd::GroupEntry;
use serde::{Deserialize, Deserializer, Serialize};

/// A directory group or team
///
/// Ids are always strings; numeric ids (GitHub team ids) are converted on
/// deserialization so they compare equal to cluster-side annotations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Team {
    /// Opaque group id
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    /// Display name
    pub name: String,
}

impl Team {
    /// Construct a team from id and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    fn matches(&self, other: &Team) -> bool {
        self.id == other.id && self.name == other.name
    }

    fn matches_entry(&self, entry: &GroupEntry) -> bool {
        self.id == entry.group_id && self.name == entry.group_name
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Unsigned(u64),
    Signed(i64),
}

impl From<StringOrNumber> for String {
    fn from(v: StringOrNumber) -> Self {
        match v {
            StringOrNumber::String(s) => s,
            StringOrNumber::Unsigned(n) => n.to_string(),
            StringOrNumber::Signed(n) => n.to_string(),
        }
    }
}

fn id_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    StringOrNumber::deserialize(d).map(String::from)
}

/// Who may decide on namespace approval rows
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", from = "ApproverWire")]
pub enum Approver {
    /// May decide on every row of every request
    AdminOrPlatform,
    /// May decide on rows whose group id is in the set
    ByGroups {
        /// Group ids held by the actor
        groups: BTreeSet<String>,
    },
}

impl Approver {
    /// Approver scoped to the given group ids
    pub fn by_groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ByGroups {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// True for admins and platform approvers
    pub fn is_admin_or_platform(&self) -> bool {
        matches!(self, Self::AdminOrPlatform)
    }

    /// Whether this approver may act on rows attached to `group_id`
    pub fn holds(&self, group_id: &str) -> bool {
        match self {
            Self::AdminOrPlatform => true,
            Self::ByGroups { groups } => groups.contains(group_id),
        }
    }
}

/// Wire shapes accepted for an approver: the tagged form, a bare list of
/// group ids, or a list of teams.
#[derive(Deserialize)]
#[serde(untagged)]
enum ApproverWire {
    Tagged(TaggedApprover),
    Ids(Vec<StringOrNumber>),
    Teams(Vec<Team>),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum TaggedApprover {
    AdminOrPlatform,
    ByGroups { groups: Vec<StringOrNumber> },
}

impl From<ApproverWire> for Approver {
    fn from(wire: ApproverWire) -> Self {
        match wire {
            ApproverWire::Tagged(TaggedApprover::AdminOrPlatform) => Approver::AdminOrPlatform,
            ApproverWire::Tagged(TaggedApprover::ByGroups { groups }) | ApproverWire::Ids(groups) => {
                Approver::by_groups(groups.into_iter().map(String::from))
            }
            ApproverWire::Teams(teams) => Approver::by_groups(teams.into_iter().map(|t| t.id)),
        }
    }
}

/// Resolved permissions for one user
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    /// Member of an admin team
    pub is_admin: bool,
    /// Member of a platform approver team
    pub is_platform_approver: bool,
    /// Admin teams the user belongs to
    pub admin_groups: Vec<Team>,
    /// Platform approver teams the user belongs to
    pub platform_approver_groups: Vec<Team>,
    /// User groups that own at least one adopted namespace on some cluster
    pub approver_groups: Vec<Team>,
}

impl Permissions {
    /// Collapse into the approver variant used for row authorization
    pub fn approver(&self) -> Approver {
        if self.is_admin || self.is_platform_approver {
            Approver::AdminOrPlatform
        } else {
            Approver::by_groups(self.approver_groups.iter().map(|t| t.id.clone()))
        }
    }
}

/// Resolve permissions for a user.
///
/// `group_caches` holds the JitGroupCache entries of every reachable cluster.
pub fn resolve<'a, I>(
    user_groups: &[Team],
    admin_teams: &[Team],
    platform_teams: &[Team],
    group_caches: I,
) -> Permissions
where
    I: IntoIterator<Item = &'a [GroupEntry]>,
{
    let member_of = |teams: &[Team]| -> Vec<Team> {
        user_groups
            .iter()
            .filter(|g| teams.iter().any(|t| t.matches(g)))
            .cloned()
            .collect()
    };

    let admin_groups = member_of(admin_teams);
    let platform_approver_groups = member_of(platform_teams);

    let mut approver: BTreeSet<Team> = BTreeSet::new();
    for entries in group_caches {
        for group in user_groups {
            if entries.iter().any(|e| group.matches_entry(e)) {
                approver.insert(group.clone());
            }
        }
    }

    Permissions {
        is_admin: !admin_groups.is_empty(),
        is_platform_approver: !platform_approver_groups.is_empty(),
        admin_groups,
        platform_approver_groups,
        approver_groups: approver.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ns: &str, id: &str, name: &str) -> GroupEntry {
        GroupEntry {
            group_id: id.into(),
            namespace: ns.into(),
            group_name: name.into(),
        }
    }

    #[test]
    fn admin_requires_id_and_name_match() {
        let admins = vec![Team::new("1", "sre")];

        let spoofed_name = resolve(&[Team::new("2", "sre")], &admins, &[], []);
        assert!(!spoofed_name.is_admin);

        let spoofed_id = resolve(&[Team::new("1", "not-sre")], &admins, &[], []);
        assert!(!spoofed_id.is_admin);

        let real = resolve(&[Team::new("1", "sre")], &admins, &[], []);
        assert!(real.is_admin);
        assert_eq!(real.admin_groups, admins);
        assert_eq!(real.approver(), Approver::AdminOrPlatform);
    }

    #[test]
    fn approver_groups_come_from_any_cluster_cache() {
        let c1 = vec![entry("app-a", "ga", "group-a")];
        let c2 = vec![entry("app-b", "gb", "group-b")];
        let user = vec![
            Team::new("ga", "group-a"),
            Team::new("gb", "group-b"),
            Team::new("gc", "group-c"),
        ];

        let perms = resolve(&user, &[], &[], [c1.as_slice(), c2.as_slice()]);
        assert!(!perms.is_admin && !perms.is_platform_approver);
        assert_eq!(
            perms.approver_groups,
            vec![Team::new("ga", "group-a"), Team::new("gb", "group-b")]
        );
        assert_eq!(perms.approver(), Approver::by_groups(["ga", "gb"]));
    }

    #[test]
    fn platform_approvers_decide_everything() {
        let perms = resolve(
            &[Team::new("7", "platform")],
            &[],
            &[Team::new("7", "platform")],
            [],
        );
        assert!(perms.is_platform_approver);
        assert!(perms.approver().holds("anything"));
    }

    #[test]
    fn numeric_github_ids_compare_as_strings() {
        let team: Team = serde_json::from_str(r#"{"id": 4242, "name": "core"}"#).unwrap();
        assert_eq!(team.id, "4242");

        let cache = vec![entry("app-a", "4242", "core")];
        let perms = resolve(&[team], &[], &[], [cache.as_slice()]);
        assert_eq!(perms.approver_groups.len(), 1);
    }

    #[test]
    fn approver_accepts_every_wire_shape() {
        let tagged: Approver =
            serde_json::from_str(r#"{"kind":"byGroups","groups":["a","b"]}"#).unwrap();
        let ids: Approver = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        let numeric: Approver = serde_json::from_str(r#"[1, 2]"#).unwrap();
        let teams: Approver =
            serde_json::from_str(r#"[{"id":"a","name":"A"},{"id":"b","name":"B"}]"#).unwrap();
        let admin: Approver = serde_json::from_str(r#"{"kind":"adminOrPlatform"}"#).unwrap();

        assert_eq!(tagged, Approver::by_groups(["a", "b"]));
        assert_eq!(ids, tagged);
        assert_eq!(teams, tagged);
        assert_eq!(numeric, Approver::by_groups(["1", "2"]));
        assert_eq!(admin, Approver::AdminOrPlatform);

        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["kind"], "byGroups");
    }
}

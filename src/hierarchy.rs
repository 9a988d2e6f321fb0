use crate::diagnostics::Diagnostics;
use crate::gateway::Gateway;
use crate::models::{MetricRecord, Profile, Team};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const DEFAULT_MAX_DEPTH: u32 = 12;

/// One person in the org tree with their own metrics for the period.
/// Subordinates are the members of the team this person manages, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberNode {
    pub profile: Profile,
    pub metrics: MetricRecord,
    pub level: u32,
    pub subordinates: Vec<MemberNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamNode {
    pub id: String,
    pub name: String,
    pub manager: Option<MemberNode>,
    pub members: Vec<MemberNode>,
}

/// Builds the manager/report forest by joining teams, memberships, and
/// profiles client-side. Every lookup failure degrades to an empty list
/// plus a diagnostic; construction itself never fails. A visited set of
/// profile ids is carried through each tree so cyclic manager linkages
/// are cut instead of recursed forever.
pub struct HierarchyBuilder<'a> {
    gateway: &'a dyn Gateway,
    diagnostics: &'a Diagnostics,
    period: String,
    max_depth: u32,
}

impl<'a> HierarchyBuilder<'a> {
    pub fn new(gateway: &'a dyn Gateway, diagnostics: &'a Diagnostics, period: &str) -> Self {
        Self {
            gateway,
            diagnostics,
            period: period.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// One tree per top-level team: a team whose manager is not themselves
    /// a member of some other team. Returns an empty forest when nothing
    /// qualifies; callers fall back to `build_flat`.
    pub fn build_forest(&self) -> Vec<TeamNode> {
        let teams = self.teams_or_empty();
        if teams.is_empty() {
            return Vec::new();
        }

        // each manager is resolved exactly once per build, so a dangling
        // reference produces a single diagnostic
        let mut managers: HashMap<String, Option<Profile>> = HashMap::new();
        for team in &teams {
            managers
                .entry(team.manager_email.clone())
                .or_insert_with(|| self.resolve_manager(&team.manager_email));
        }

        let mut enrolled: HashSet<String> = HashSet::new();
        for team in &teams {
            let manager_id = managers[&team.manager_email]
                .as_ref()
                .map(|profile| profile.id.as_str());
            for membership in self.members_or_empty(&team.id) {
                if manager_id != Some(membership.user_id.as_str()) {
                    enrolled.insert(membership.user_id);
                }
            }
        }

        teams
            .iter()
            .filter(|team| match &managers[&team.manager_email] {
                Some(profile) => !enrolled.contains(&profile.id),
                None => true,
            })
            .map(|team| self.build_team_with(team, managers[&team.manager_email].clone()))
            .collect()
    }

    /// Flat rendering of every team: direct members only, no recursion.
    pub fn build_flat(&self) -> Vec<TeamNode> {
        self.teams_or_empty()
            .iter()
            .map(|team| {
                let mut visited = HashSet::new();
                let manager =
                    self.manager_node(self.resolve_manager(&team.manager_email), &mut visited);
                let manager_id = manager.as_ref().map(|node| node.profile.id.clone());
                let members = self
                    .members_or_empty(&team.id)
                    .into_iter()
                    .filter(|membership| manager_id.as_deref() != Some(membership.user_id.as_str()))
                    .filter_map(|membership| {
                        self.leaf_node(&membership.user_id, 0, &mut visited)
                    })
                    .collect();
                TeamNode {
                    id: team.id.clone(),
                    name: team.name.clone(),
                    manager,
                    members,
                }
            })
            .collect()
    }

    pub fn build_team(&self, team: &Team) -> TeamNode {
        self.build_team_with(team, self.resolve_manager(&team.manager_email))
    }

    fn build_team_with(&self, team: &Team, manager_profile: Option<Profile>) -> TeamNode {
        let mut visited = HashSet::new();
        let manager = self.manager_node(manager_profile, &mut visited);
        let manager_id = manager.as_ref().map(|node| node.profile.id.clone());
        let members = self.attach_members(team, manager_id.as_deref(), 0, &mut visited);
        TeamNode {
            id: team.id.clone(),
            name: team.name.clone(),
            manager,
            members,
        }
    }

    fn attach_members(
        &self,
        team: &Team,
        manager_id: Option<&str>,
        level: u32,
        visited: &mut HashSet<String>,
    ) -> Vec<MemberNode> {
        let mut nodes = Vec::new();
        for membership in self.members_or_empty(&team.id) {
            if manager_id == Some(membership.user_id.as_str()) {
                continue;
            }
            let Some(profile) = self.profile_or_skip(&membership.user_id) else {
                continue;
            };
            if !visited.insert(profile.id.clone()) {
                self.diagnostics.record(
                    "hierarchy",
                    "cycle",
                    format!("profile {} already attached; cutting branch", profile.id),
                );
                continue;
            }

            let subordinates = self.subordinates_of(&profile, level + 1, visited);
            nodes.push(MemberNode {
                metrics: self.metrics_or_zero(&profile.id),
                profile,
                level,
                subordinates,
            });
        }
        nodes
    }

    fn subordinates_of(
        &self,
        profile: &Profile,
        level: u32,
        visited: &mut HashSet<String>,
    ) -> Vec<MemberNode> {
        if level > self.max_depth {
            self.diagnostics.record(
                "hierarchy",
                "max-depth",
                format!("stopped below {} at depth {}", profile.email, level),
            );
            return Vec::new();
        }
        let managed = match self.gateway.list_teams_managed_by(&profile.email) {
            Ok(managed) => managed,
            Err(error) => {
                self.diagnostics.record(
                    "hierarchy",
                    "team-lookup-failed",
                    format!("{}: {}", profile.email, error),
                );
                Vec::new()
            }
        };
        // a member can manage more than one team; every managed team hangs
        // off the same node
        let mut nodes = Vec::new();
        for team in &managed {
            nodes.extend(self.attach_members(team, Some(profile.id.as_str()), level, visited));
        }
        nodes
    }

    fn manager_node(
        &self,
        profile: Option<Profile>,
        visited: &mut HashSet<String>,
    ) -> Option<MemberNode> {
        let profile = profile?;
        visited.insert(profile.id.clone());
        Some(MemberNode {
            metrics: self.metrics_or_zero(&profile.id),
            profile,
            level: 0,
            subordinates: Vec::new(),
        })
    }

    fn resolve_manager(&self, manager_email: &str) -> Option<Profile> {
        match self.gateway.get_profile_by_email(manager_email) {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => {
                self.diagnostics.record(
                    "hierarchy",
                    "missing-manager",
                    format!("no profile for manager {}", manager_email),
                );
                None
            }
            Err(error) => {
                self.diagnostics.record(
                    "hierarchy",
                    "profile-lookup-failed",
                    format!("{}: {}", manager_email, error),
                );
                None
            }
        }
    }

    fn leaf_node(
        &self,
        user_id: &str,
        level: u32,
        visited: &mut HashSet<String>,
    ) -> Option<MemberNode> {
        let profile = self.profile_or_skip(user_id)?;
        if !visited.insert(profile.id.clone()) {
            return None;
        }
        Some(MemberNode {
            metrics: self.metrics_or_zero(&profile.id),
            profile,
            level,
            subordinates: Vec::new(),
        })
    }

    fn profile_or_skip(&self, user_id: &str) -> Option<Profile> {
        match self.gateway.get_profile(user_id) {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => {
                self.diagnostics.record(
                    "hierarchy",
                    "missing-profile",
                    format!("membership references unknown profile {}", user_id),
                );
                None
            }
            Err(error) => {
                self.diagnostics.record(
                    "hierarchy",
                    "profile-lookup-failed",
                    format!("{}: {}", user_id, error),
                );
                None
            }
        }
    }

    fn teams_or_empty(&self) -> Vec<Team> {
        match self.gateway.list_teams() {
            Ok(teams) => teams,
            Err(error) => {
                self.diagnostics
                    .record("hierarchy", "team-list-failed", error.to_string());
                Vec::new()
            }
        }
    }

    fn members_or_empty(&self, team_id: &str) -> Vec<crate::models::TeamMembership> {
        match self.gateway.list_team_members(team_id) {
            Ok(members) => members,
            Err(error) => {
                self.diagnostics.record(
                    "hierarchy",
                    "member-list-failed",
                    format!("{}: {}", team_id, error),
                );
                Vec::new()
            }
        }
    }

    fn metrics_or_zero(&self, user_id: &str) -> MetricRecord {
        match self.gateway.metric_record(user_id, &self.period) {
            Ok(Some(record)) => record.metrics,
            Ok(None) => MetricRecord::zeroed(),
            Err(error) => {
                self.diagnostics.record(
                    "hierarchy",
                    "metrics-fetch-failed",
                    format!("{}: {}", user_id, error),
                );
                MetricRecord::zeroed()
            }
        }
    }
}

/// Post-order sum of a member and everything beneath them. Element-wise
/// addition is associative and commutative, so traversal order does not
/// matter and repeated calls return identical results.
pub fn aggregate_member(member: &MemberNode) -> MetricRecord {
    member
        .subordinates
        .iter()
        .fold(member.metrics, |total, child| {
            total.saturating_add(&aggregate_member(child))
        })
}

/// Team roll-up: the manager's own record plus every member subtree.
pub fn aggregate_team(team: &TeamNode) -> MetricRecord {
    let base = team
        .manager
        .as_ref()
        .map(aggregate_member)
        .unwrap_or_default();
    team.members
        .iter()
        .fold(base, |total, member| {
            total.saturating_add(&aggregate_member(member))
        })
}

pub fn aggregate_forest(forest: &[TeamNode]) -> MetricRecord {
    forest.iter().fold(MetricRecord::zeroed(), |total, team| {
        total.saturating_add(&aggregate_team(team))
    })
}

use crate::errors::AppResult;
use crate::models::{
    MetricAdjustment, Profile, RecordMetricsPayload, Team, TeamMembership, UserMetrics,
};

/// Read/write contract over the backing store that the hierarchy builder
/// and aggregation pipeline depend on. Injected rather than ambient so the
/// computation layer can run against an in-memory fake. All reads are
/// simple equality filters; joins happen in the callers.
pub trait Gateway: Send + Sync {
    fn list_profiles(&self) -> AppResult<Vec<Profile>>;
    fn get_profile(&self, id: &str) -> AppResult<Option<Profile>>;
    fn get_profile_by_email(&self, email: &str) -> AppResult<Option<Profile>>;

    fn list_teams(&self) -> AppResult<Vec<Team>>;
    fn list_teams_managed_by(&self, manager_email: &str) -> AppResult<Vec<Team>>;
    fn list_team_members(&self, team_id: &str) -> AppResult<Vec<TeamMembership>>;

    fn metric_record(&self, user_id: &str, period: &str) -> AppResult<Option<UserMetrics>>;
    fn upsert_metrics(&self, payload: &RecordMetricsPayload) -> AppResult<UserMetrics>;
    fn adjust_metric(&self, adjustment: &MetricAdjustment) -> AppResult<UserMetrics>;
}

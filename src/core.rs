use crate::collaboration;
use crate::db::Database;
use crate::diagnostics::{DiagnosticEvent, Diagnostics, Notification};
use crate::errors::{AppError, AppResult};
use crate::gateway::Gateway;
use crate::hierarchy::{aggregate_forest, aggregate_team, HierarchyBuilder, TeamNode};
use crate::intake;
use crate::metrics::{ratio_summary, Ratio};
use crate::models::{
    AppSettings, BooleanResponse, Bulletin, CreatePromoCodePayload, FormDefinition, Lead,
    LeadFormSubmission, LeadStatus, ListLeadsFilters, ListMeetingsFilters, Meeting, MeetingStatus,
    MetricAdjustment, MetricRecord, PostBulletinPayload, Profile, PromoCode, PromoRedemption,
    RecordMetricsPayload, Role, SaveFormDefinitionPayload, SaveProfilePayload, SaveTeamPayload,
    ScheduleMeetingPayload, Team, TeamMembership, UserMetrics,
};
use crate::policy::AccessPolicy;
use crate::promo;
use crate::projection::{project, Projection, ProjectionInputs};
use crate::session::SessionManager;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const DB_FILE_NAME: &str = "agency-desk.db";
const MAINTENANCE_INTERVAL_SECS: u64 = 3600;

/// One team with its roll-up and derived ratios, ready to render.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSummary {
    pub team: TeamNode,
    pub totals: MetricRecord,
    pub ratios: Vec<Ratio>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamOverview {
    pub period: String,
    pub teams: Vec<TeamSummary>,
    pub flat_fallback: bool,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgOverview {
    pub period: String,
    pub totals: MetricRecord,
    pub ratios: Vec<Ratio>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub expired_promo_codes: usize,
    pub purged_bulletins: usize,
}

/// Orchestrator the presentation layer talks to. Owns the store, the
/// session, and the diagnostics ring; every operation validates through
/// the access policy before touching data.
#[derive(Clone)]
pub struct CrmCore {
    db: Arc<Database>,
    sessions: SessionManager,
    diagnostics: Diagnostics,
    policy: AccessPolicy,
}

impl CrmCore {
    pub fn new(data_dir: &Path) -> AppResult<Self> {
        let db = Database::new(&data_dir.join(DB_FILE_NAME))?;
        Ok(Self::with_database(Arc::new(db)))
    }

    pub fn with_database(db: Arc<Database>) -> Self {
        Self {
            db,
            sessions: SessionManager::new(),
            diagnostics: Diagnostics::default(),
            policy: AccessPolicy,
        }
    }

    pub fn database(&self) -> &Database {
        self.db.as_ref()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    // ---- session ----

    pub async fn sign_in(&self, email: &str) -> AppResult<Profile> {
        let profile = self
            .db
            .get_profile_by_email(email)?
            .ok_or_else(|| AppError::NotFound(format!("No profile for {}", email)))?;
        self.sessions.sign_in(profile.clone()).await;
        tracing::info!(user = %profile.id, "signed in");
        Ok(profile)
    }

    pub async fn sign_out(&self) {
        self.sessions.sign_out().await;
    }

    pub async fn signed_in_profile(&self) -> Option<Profile> {
        self.sessions.current().await
    }

    // ---- profiles & teams ----

    pub async fn save_profile(&self, payload: SaveProfilePayload) -> AppResult<Profile> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .require_role(&actor, Role::Admin, "Saving a profile")?;
        if !intake::is_valid_email(&payload.email) {
            return Err(AppError::Validation(format!(
                "'{}' is not a valid email address",
                payload.email
            )));
        }
        self.db.save_profile(payload)
    }

    pub async fn assign_roles(&self, user_id: &str, roles: &[Role]) -> AppResult<Profile> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .require_role(&actor, Role::Admin, "Assigning roles")?;
        if roles.is_empty() {
            return Err(AppError::Validation(
                "A profile needs at least one role".to_string(),
            ));
        }
        self.db.set_roles(user_id, roles)
    }

    pub async fn list_profiles(&self) -> AppResult<Vec<Profile>> {
        self.sessions.require_signed_in().await?;
        self.db.list_profiles()
    }

    pub async fn save_team(&self, payload: SaveTeamPayload) -> AppResult<Team> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy.require_role(&actor, Role::Admin, "Saving a team")?;
        self.db.save_team(payload)
    }

    pub async fn list_teams(&self) -> AppResult<Vec<Team>> {
        self.sessions.require_signed_in().await?;
        self.db.list_teams()
    }

    pub async fn set_team_members(
        &self,
        team_id: &str,
        members: &[TeamMembership],
    ) -> AppResult<BooleanResponse> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .require_role(&actor, Role::Admin, "Editing team membership")?;
        if self.db.get_team(team_id)?.is_none() {
            return Err(AppError::NotFound(format!("team {}", team_id)));
        }
        self.db.set_team_members(team_id, members)?;
        Ok(BooleanResponse { ok: true })
    }

    // ---- metrics ----

    pub async fn record_metrics(&self, payload: RecordMetricsPayload) -> AppResult<UserMetrics> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy.validate_record_metrics(&actor, &payload)?;
        self.db.upsert_metrics(&payload)
    }

    pub async fn adjust_metric(&self, adjustment: MetricAdjustment) -> AppResult<UserMetrics> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy.validate_metric_adjustment(&actor, &adjustment)?;
        self.db.adjust_metric(&adjustment)
    }

    pub async fn metric_record(&self, user_id: &str, period: &str) -> AppResult<MetricRecord> {
        self.sessions.require_signed_in().await?;
        self.policy.validate_period(period)?;
        Ok(self
            .db
            .metric_record(user_id, period)?
            .map(|record| record.metrics)
            .unwrap_or_default())
    }

    pub async fn ratios_for(&self, user_id: &str, period: &str) -> AppResult<Vec<Ratio>> {
        let record = self.metric_record(user_id, period).await?;
        Ok(ratio_summary(&record))
    }

    // ---- team performance ----

    pub async fn team_overview(&self, period: &str) -> AppResult<TeamOverview> {
        self.sessions.require_signed_in().await?;
        self.policy.validate_period(period)?;
        let settings = self.db.get_settings()?;

        let builder = HierarchyBuilder::new(self.db.as_ref(), &self.diagnostics, period)
            .with_max_depth(settings.hierarchy_max_depth);

        let mut notifications = Vec::new();
        let mut flat_fallback = false;
        let mut forest = builder.build_forest();
        if forest.is_empty() {
            let has_teams = match self.db.list_teams() {
                Ok(teams) => !teams.is_empty(),
                Err(error) => {
                    self.diagnostics
                        .record("overview", "team-list-failed", error.to_string());
                    notifications.push(Notification::error(
                        "Team data is unavailable right now; showing nothing.",
                    ));
                    false
                }
            };
            if has_teams {
                forest = builder.build_flat();
                flat_fallback = true;
                notifications.push(Notification::warning(
                    "Could not build the team hierarchy; showing a flat team list.",
                ));
            }
        }

        let teams = forest
            .into_iter()
            .map(|team| {
                let totals = aggregate_team(&team);
                let ratios = ratio_summary(&totals);
                TeamSummary {
                    team,
                    totals,
                    ratios,
                }
            })
            .collect();

        Ok(TeamOverview {
            period: period.to_string(),
            teams,
            flat_fallback,
            notifications,
        })
    }

    pub async fn org_overview(&self, period: &str) -> AppResult<OrgOverview> {
        let overview = self.team_overview(period).await?;
        let forest: Vec<TeamNode> = overview
            .teams
            .into_iter()
            .map(|summary| summary.team)
            .collect();
        let totals = aggregate_forest(&forest);
        Ok(OrgOverview {
            period: overview.period,
            ratios: ratio_summary(&totals),
            totals,
        })
    }

    // ---- projection ----

    pub async fn project_success(&self, mut inputs: ProjectionInputs) -> AppResult<Projection> {
        self.sessions.require_signed_in().await?;
        if inputs.avg_sale_ap_cents == 0 {
            inputs.avg_sale_ap_cents = self.db.get_settings()?.default_avg_sale_ap_cents;
        }
        project(&inputs)
    }

    // ---- intake ----

    pub async fn save_form_definition(
        &self,
        payload: SaveFormDefinitionPayload,
    ) -> AppResult<FormDefinition> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .require_role(&actor, Role::Admin, "Editing intake forms")?;
        if !payload
            .fields
            .iter()
            .any(|field| field.key == "clientName" && field.required)
        {
            return Err(AppError::Validation(
                "Intake forms need a required clientName field".to_string(),
            ));
        }
        self.db.save_form_definition(payload)
    }

    pub async fn list_form_definitions(&self) -> AppResult<Vec<FormDefinition>> {
        self.sessions.require_signed_in().await?;
        self.db.list_form_definitions()
    }

    pub async fn submit_lead_form(&self, submission: LeadFormSubmission) -> AppResult<Lead> {
        let actor = self.sessions.require_signed_in().await?;
        let definition = self
            .db
            .get_form_definition(&submission.form_id)?
            .ok_or_else(|| AppError::NotFound(format!("form {}", submission.form_id)))?;
        let lead = intake::build_lead(&definition, &actor.id, &submission.values)?;
        self.db.insert_lead(&lead)?;
        tracing::info!(lead = %lead.id, form = %definition.id, "lead captured");
        Ok(lead)
    }

    pub async fn list_leads(&self, mut filters: ListLeadsFilters) -> AppResult<Vec<Lead>> {
        let actor = self.sessions.require_signed_in().await?;
        // plain agents only ever see their own pipeline
        if !actor.has_role(Role::Manager) && !actor.has_role(Role::Admin) {
            filters.agent_id = Some(actor.id.clone());
        }
        self.db.list_leads(&filters)
    }

    pub async fn set_lead_status(&self, lead_id: &str, status: LeadStatus) -> AppResult<Lead> {
        let actor = self.sessions.require_signed_in().await?;
        let lead = self
            .db
            .get_lead(lead_id)?
            .ok_or_else(|| AppError::NotFound(format!("lead {}", lead_id)))?;
        if lead.agent_id != actor.id
            && !actor.has_role(Role::Manager)
            && !actor.has_role(Role::Admin)
        {
            return Err(AppError::Denied(
                "Agents can only update their own leads".to_string(),
            ));
        }
        self.db.set_lead_status(lead_id, status)?;
        self.db
            .get_lead(lead_id)?
            .ok_or_else(|| AppError::NotFound(format!("lead {}", lead_id)))
    }

    // ---- promo codes ----

    pub async fn create_promo_code(&self, payload: CreatePromoCodePayload) -> AppResult<PromoCode> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .validate_promo_admin(&actor, "Creating promo codes")?;
        self.policy.validate_promo_payload(&payload)?;

        let code = match &payload.code {
            Some(raw) => {
                let normalized = promo::normalize_code(raw);
                promo::validate_code_format(&normalized)?;
                normalized
            }
            None => promo::generate_code(),
        };

        let now = Utc::now();
        let record = PromoCode {
            id: Uuid::new_v4().to_string(),
            code,
            description: payload.description,
            created_by: actor.id,
            max_uses: payload.max_uses,
            uses: 0,
            expires_at: payload.expires_at,
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_promo_code(&record)?;
        Ok(record)
    }

    pub async fn list_promo_codes(&self, include_inactive: bool) -> AppResult<Vec<PromoCode>> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .validate_promo_admin(&actor, "Listing promo codes")?;
        self.db.list_promo_codes(include_inactive)
    }

    pub async fn set_promo_code_active(
        &self,
        id: &str,
        active: bool,
    ) -> AppResult<BooleanResponse> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .validate_promo_admin(&actor, "Toggling promo codes")?;
        let changed = self.db.set_promo_code_active(id, active)?;
        if !changed {
            return Err(AppError::NotFound(format!("promo code {}", id)));
        }
        Ok(BooleanResponse { ok: true })
    }

    pub async fn redeem_promo_code(&self, raw_code: &str) -> AppResult<PromoRedemption> {
        let actor = self.sessions.require_signed_in().await?;
        let normalized = promo::normalize_code(raw_code);
        let code = self
            .db
            .get_promo_code(&normalized)?
            .ok_or_else(|| AppError::NotFound(format!("promo code {}", normalized)))?;
        promo::check_redeemable(&code, Utc::now())?;
        self.db.record_redemption(&code.id, &actor.id)
    }

    // ---- collaboration ----

    pub async fn post_bulletin(&self, payload: PostBulletinPayload) -> AppResult<Bulletin> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy.validate_bulletin(&actor, &payload)?;
        self.db.post_bulletin(&actor.id, &payload)
    }

    pub async fn list_bulletins(&self, include_expired: bool) -> AppResult<Vec<Bulletin>> {
        self.sessions.require_signed_in().await?;
        self.db.list_bulletins(include_expired)
    }

    pub async fn pin_bulletin(&self, id: &str, pinned: bool) -> AppResult<BooleanResponse> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .require_role(&actor, Role::Manager, "Pinning bulletins")?;
        let changed = self.db.set_bulletin_pinned(id, pinned)?;
        if !changed {
            return Err(AppError::NotFound(format!("bulletin {}", id)));
        }
        Ok(BooleanResponse { ok: true })
    }

    pub async fn schedule_meeting(&self, payload: ScheduleMeetingPayload) -> AppResult<Meeting> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy.validate_meeting(&actor, &payload)?;
        if self.db.get_profile(&payload.report_id)?.is_none() {
            return Err(AppError::NotFound(format!("profile {}", payload.report_id)));
        }

        let existing = self.db.list_meetings(&ListMeetingsFilters {
            manager_id: Some(actor.id.clone()),
            status: Some(MeetingStatus::Scheduled),
            ..ListMeetingsFilters::default()
        })?;
        if let Some(conflict) = collaboration::find_conflict(&existing, &payload) {
            return Err(AppError::Validation(format!(
                "Overlaps an existing one-on-one with {} at {}",
                conflict.report_id,
                conflict.scheduled_at.to_rfc3339()
            )));
        }
        self.db.insert_meeting(&actor.id, &payload)
    }

    pub async fn list_meetings(&self, filters: ListMeetingsFilters) -> AppResult<Vec<Meeting>> {
        self.sessions.require_signed_in().await?;
        self.db.list_meetings(&filters)
    }

    pub async fn set_meeting_status(
        &self,
        id: &str,
        status: MeetingStatus,
    ) -> AppResult<Meeting> {
        let actor = self.sessions.require_signed_in().await?;
        let meeting = self
            .db
            .get_meeting(id)?
            .ok_or_else(|| AppError::NotFound(format!("meeting {}", id)))?;
        if meeting.manager_id != actor.id
            && meeting.report_id != actor.id
            && !actor.has_role(Role::Admin)
        {
            return Err(AppError::Denied(
                "Only the participants can update a one-on-one".to_string(),
            ));
        }
        collaboration::check_transition(meeting.status, status)?;
        self.db.set_meeting_status(id, status)?;
        self.db
            .get_meeting(id)?
            .ok_or_else(|| AppError::NotFound(format!("meeting {}", id)))
    }

    // ---- settings & diagnostics ----

    pub async fn get_settings(&self) -> AppResult<AppSettings> {
        self.sessions.require_signed_in().await?;
        self.db.get_settings()
    }

    pub async fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .require_role(&actor, Role::Admin, "Updating settings")?;
        self.db.update_settings(update)
    }

    pub async fn recent_diagnostics(&self, limit: usize) -> AppResult<Vec<DiagnosticEvent>> {
        let actor = self.sessions.require_signed_in().await?;
        self.policy
            .require_role(&actor, Role::Manager, "Reading diagnostics")?;
        Ok(self.diagnostics.recent(limit))
    }

    // ---- maintenance ----

    pub fn run_maintenance(&self) -> AppResult<MaintenanceReport> {
        let settings = self.db.get_settings()?;
        let now = Utc::now();
        let expired_promo_codes = self.db.deactivate_expired_promo_codes(now)?;
        let cutoff = now - Duration::days(i64::from(settings.bulletin_retention_days));
        let purged_bulletins = self.db.purge_stale_bulletins(cutoff)?;
        self.diagnostics
            .prune(settings.diagnostics_retention as usize);

        if expired_promo_codes > 0 || purged_bulletins > 0 {
            tracing::info!(
                expired_promo_codes,
                purged_bulletins,
                "maintenance pass finished"
            );
        }
        Ok(MaintenanceReport {
            expired_promo_codes,
            purged_bulletins,
        })
    }

    pub fn start_maintenance(&self) {
        let core = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(error) = core.run_maintenance() {
                    tracing::warn!(error = %error, "maintenance pass failed");
                }
            }
        });
    }
}

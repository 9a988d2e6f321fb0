use crate::errors::{AppError, AppResult};
use crate::models::{
    CreatePromoCodePayload, MetricAdjustment, PostBulletinPayload, Profile, RecordMetricsPayload,
    Role, ScheduleMeetingPayload,
};
use once_cell::sync::Lazy;

const MAX_METRIC_DELTA: i64 = 100_000;
const MIN_MEETING_MINUTES: u32 = 15;
const MAX_MEETING_MINUTES: u32 = 180;
const MAX_BULLETIN_TITLE_CHARS: usize = 120;
const MAX_BULLETIN_BODY_CHARS: usize = 4_000;

static PERIOD_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^\d{4}-(0[1-9]|1[0-2])$").expect("valid period regex"));

/// Role and bounds checks for every mutating operation. Admin satisfies any
/// role requirement; managers can act on their reports' records; agents only
/// on their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessPolicy;

impl AccessPolicy {
    pub fn require_role(&self, actor: &Profile, role: Role, operation: &str) -> AppResult<()> {
        if actor.has_role(role) || actor.has_role(Role::Admin) {
            return Ok(());
        }
        Err(AppError::Denied(format!(
            "{} requires the {} role",
            operation,
            role.as_str()
        )))
    }

    pub fn validate_period(&self, period: &str) -> AppResult<()> {
        if PERIOD_RE.is_match(period) {
            return Ok(());
        }
        Err(AppError::Validation(format!(
            "Period '{}' must look like YYYY-MM",
            period
        )))
    }

    pub fn validate_metric_adjustment(
        &self,
        actor: &Profile,
        adjustment: &MetricAdjustment,
    ) -> AppResult<()> {
        self.validate_period(&adjustment.period)?;
        self.require_metric_access(actor, &adjustment.user_id)?;
        if adjustment.delta == 0 {
            return Err(AppError::Validation(
                "Metric adjustment delta cannot be zero".to_string(),
            ));
        }
        if adjustment.delta.abs() > MAX_METRIC_DELTA {
            return Err(AppError::Validation(format!(
                "Metric adjustment {} is out of allowed range (+/-{})",
                adjustment.delta, MAX_METRIC_DELTA
            )));
        }
        Ok(())
    }

    pub fn validate_record_metrics(
        &self,
        actor: &Profile,
        payload: &RecordMetricsPayload,
    ) -> AppResult<()> {
        self.validate_period(&payload.period)?;
        self.require_metric_access(actor, &payload.user_id)
    }

    fn require_metric_access(&self, actor: &Profile, target_user_id: &str) -> AppResult<()> {
        if actor.id == target_user_id
            || actor.has_role(Role::Manager)
            || actor.has_role(Role::Admin)
        {
            return Ok(());
        }
        Err(AppError::Denied(format!(
            "Agents can only edit their own metrics (target {})",
            target_user_id
        )))
    }

    pub fn validate_bulletin(&self, actor: &Profile, payload: &PostBulletinPayload) -> AppResult<()> {
        self.require_role(actor, Role::Manager, "Posting a bulletin")?;
        let title = payload.title.trim();
        if title.is_empty() || title.chars().count() > MAX_BULLETIN_TITLE_CHARS {
            return Err(AppError::Validation(format!(
                "Bulletin title must be 1..={} characters",
                MAX_BULLETIN_TITLE_CHARS
            )));
        }
        let body = payload.body.trim();
        if body.is_empty() || body.chars().count() > MAX_BULLETIN_BODY_CHARS {
            return Err(AppError::Validation(format!(
                "Bulletin body must be 1..={} characters",
                MAX_BULLETIN_BODY_CHARS
            )));
        }
        Ok(())
    }

    pub fn validate_meeting(&self, actor: &Profile, payload: &ScheduleMeetingPayload) -> AppResult<()> {
        self.require_role(actor, Role::Manager, "Scheduling a one-on-one")?;
        if payload.report_id == actor.id {
            return Err(AppError::Validation(
                "A one-on-one needs a report other than the manager".to_string(),
            ));
        }
        if !(MIN_MEETING_MINUTES..=MAX_MEETING_MINUTES).contains(&payload.duration_minutes) {
            return Err(AppError::Validation(format!(
                "Meeting duration {} is out of allowed range ({}..={}) minutes",
                payload.duration_minutes, MIN_MEETING_MINUTES, MAX_MEETING_MINUTES
            )));
        }
        Ok(())
    }

    pub fn validate_promo_admin(&self, actor: &Profile, operation: &str) -> AppResult<()> {
        self.require_role(actor, Role::Admin, operation)
    }

    pub fn validate_promo_payload(&self, payload: &CreatePromoCodePayload) -> AppResult<()> {
        if let Some(max_uses) = payload.max_uses {
            if max_uses == 0 {
                return Err(AppError::Validation(
                    "maxUses must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

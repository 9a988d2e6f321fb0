mod collaboration;
mod core;
mod db;
mod diagnostics;
mod errors;
mod gateway;
mod hierarchy;
mod intake;
mod metrics;
mod models;
mod policy;
mod projection;
mod promo;
mod session;

pub use crate::core::{CrmCore, MaintenanceReport, OrgOverview, TeamOverview, TeamSummary};
pub use crate::db::Database;
pub use crate::diagnostics::{DiagnosticEvent, Diagnostics, Notification, NotificationLevel};
pub use crate::errors::{AppError, AppResult};
pub use crate::gateway::Gateway;
pub use crate::hierarchy::{
    aggregate_forest, aggregate_member, aggregate_team, HierarchyBuilder, MemberNode, TeamNode,
};
pub use crate::intake::{build_lead, schema_for, validate_submission};
pub use crate::metrics::{format_cents, format_percent, ratio_summary, Ratio};
pub use crate::models::*;
pub use crate::policy::AccessPolicy;
pub use crate::projection::{project, Projection, ProjectionInputs};
pub use crate::promo::{check_redeemable, generate_code, normalize_code, validate_code_format};
pub use crate::session::SessionManager;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub fn init_tracing(app_data_dir: &Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "agency-desk.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

pub fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}

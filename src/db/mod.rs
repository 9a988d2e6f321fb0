use crate::errors::{AppError, AppResult};
use crate::gateway::Gateway;
use crate::models::{
    parse_lead_status, parse_meeting_status, parse_role, AppSettings, Bulletin, FormDefinition,
    FormField, Lead, LeadStatus, ListLeadsFilters, ListMeetingsFilters, Meeting, MeetingStatus,
    MetricAdjustment, MetricRecord, PostBulletinPayload, Profile, PromoCode, PromoRedemption,
    RecordMetricsPayload, Role, SaveFormDefinitionPayload, SaveProfilePayload, SaveTeamPayload,
    ScheduleMeetingPayload, Team, TeamMembership, UserMetrics,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_KEY: &str = "app";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ---- profiles ----

    pub fn save_profile(&self, payload: SaveProfilePayload) -> AppResult<Profile> {
        let conn = self.lock()?;
        let now = Utc::now();
        let roles_json = serde_json::to_string(&payload.roles)?;

        let existing_id: Option<String> = match &payload.id {
            Some(id) => conn
                .query_row("SELECT id FROM profiles WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id FROM profiles WHERE email = ?1",
                    [&payload.email],
                    |row| row.get(0),
                )
                .optional()?,
        };

        let id = match existing_id {
            Some(id) => {
                conn.execute(
                    "UPDATE profiles SET email=?1, display_name=?2, roles_json=?3, manager_email=?4, updated_at=?5
                     WHERE id = ?6",
                    params![
                        payload.email,
                        payload.display_name,
                        roles_json,
                        payload.manager_email,
                        now.to_rfc3339(),
                        id,
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO profiles (id, email, display_name, roles_json, manager_email, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        id,
                        payload.email,
                        payload.display_name,
                        roles_json,
                        payload.manager_email,
                        now.to_rfc3339(),
                    ],
                )?;
                id
            }
        };
        drop(conn);

        self.profile_by_id(&id)?
            .ok_or_else(|| AppError::Internal(format!("profile {} vanished after save", id)))
    }

    pub fn set_roles(&self, user_id: &str, roles: &[Role]) -> AppResult<Profile> {
        let conn = self.lock()?;
        let roles_json = serde_json::to_string(roles)?;
        let changed = conn.execute(
            "UPDATE profiles SET roles_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![roles_json, Utc::now().to_rfc3339(), user_id],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(AppError::NotFound(format!("profile {}", user_id)));
        }
        self.profile_by_id(user_id)?
            .ok_or_else(|| AppError::NotFound(format!("profile {}", user_id)))
    }

    fn profile_by_id(&self, id: &str) -> AppResult<Option<Profile>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, display_name, roles_json, manager_email, created_at, updated_at
             FROM profiles WHERE id = ?1",
            [id],
            parse_profile_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    // ---- teams ----

    pub fn save_team(&self, payload: SaveTeamPayload) -> AppResult<Team> {
        let conn = self.lock()?;
        let now = Utc::now();
        let id = match payload.id {
            Some(id) => {
                let changed = conn.execute(
                    "UPDATE teams SET name=?1, manager_email=?2, updated_at=?3 WHERE id=?4",
                    params![payload.name, payload.manager_email, now.to_rfc3339(), id],
                )?;
                if changed == 0 {
                    return Err(AppError::NotFound(format!("team {}", id)));
                }
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO teams (id, name, manager_email, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![id, payload.name, payload.manager_email, now.to_rfc3339()],
                )?;
                id
            }
        };

        conn.query_row(
            "SELECT id, name, manager_email, created_at, updated_at FROM teams WHERE id = ?1",
            [&id],
            parse_team_row,
        )
        .map_err(AppError::from)
    }

    pub fn get_team(&self, id: &str) -> AppResult<Option<Team>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, manager_email, created_at, updated_at FROM teams WHERE id = ?1",
            [id],
            parse_team_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn set_team_members(&self, team_id: &str, members: &[TeamMembership]) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM team_members WHERE team_id = ?1", [team_id])?;
        for member in members {
            tx.execute(
                "INSERT OR REPLACE INTO team_members (team_id, user_id, role) VALUES (?1, ?2, ?3)",
                params![team_id, member.user_id, member.role.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- leads & intake forms ----

    pub fn insert_lead(&self, lead: &Lead) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO leads (id, agent_id, form_id, client_name, email, phone, status, fields_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                lead.id,
                lead.agent_id,
                lead.form_id,
                lead.client_name,
                lead.email,
                lead.phone,
                lead.status.as_str(),
                serde_json::to_string(&lead.fields)?,
                lead.created_at.to_rfc3339(),
                lead.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_lead(&self, id: &str) -> AppResult<Option<Lead>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, agent_id, form_id, client_name, email, phone, status, fields_json, created_at, updated_at
             FROM leads WHERE id = ?1",
            [id],
            parse_lead_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_leads(&self, filters: &ListLeadsFilters) -> AppResult<Vec<Lead>> {
        let conn = self.lock()?;
        let mut query = String::from(
            "SELECT id, agent_id, form_id, client_name, email, phone, status, fields_json, created_at, updated_at
             FROM leads WHERE 1 = 1",
        );

        let mut params_vec: Vec<String> = Vec::new();
        if let Some(agent_id) = &filters.agent_id {
            query.push_str(" AND agent_id = ?");
            params_vec.push(agent_id.clone());
        }
        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(status.as_str().to_string());
        }
        if let Some(search) = &filters.search {
            query.push_str(" AND client_name LIKE ?");
            params_vec.push(format!("%{}%", search));
        }

        query.push_str(" ORDER BY created_at DESC");
        let limit = filters.limit.unwrap_or(100);
        let offset = filters.offset.unwrap_or(0);
        query.push_str(" LIMIT ? OFFSET ?");

        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);
        dyn_params.push(&offset);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_lead_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn set_lead_status(&self, id: &str, status: LeadStatus) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE leads SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn save_form_definition(
        &self,
        payload: SaveFormDefinitionPayload,
    ) -> AppResult<FormDefinition> {
        let conn = self.lock()?;
        let now = Utc::now();
        let fields_json = serde_json::to_string(&payload.fields)?;
        let id = match payload.id {
            Some(id) => {
                let changed = conn.execute(
                    "UPDATE form_definitions SET name=?1, fields_json=?2, updated_at=?3 WHERE id=?4",
                    params![payload.name, fields_json, now.to_rfc3339(), id],
                )?;
                if changed == 0 {
                    return Err(AppError::NotFound(format!("form {}", id)));
                }
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO form_definitions (id, name, fields_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![id, payload.name, fields_json, now.to_rfc3339()],
                )?;
                id
            }
        };

        conn.query_row(
            "SELECT id, name, fields_json, created_at, updated_at FROM form_definitions WHERE id = ?1",
            [&id],
            parse_form_row,
        )
        .map_err(AppError::from)
    }

    pub fn get_form_definition(&self, id: &str) -> AppResult<Option<FormDefinition>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, fields_json, created_at, updated_at FROM form_definitions WHERE id = ?1",
            [id],
            parse_form_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_form_definitions(&self) -> AppResult<Vec<FormDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, fields_json, created_at, updated_at FROM form_definitions ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], parse_form_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    // ---- promo codes ----

    pub fn insert_promo_code(&self, code: &PromoCode) -> AppResult<()> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO promo_codes (id, code, description, created_by, max_uses, uses, expires_at, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                code.id,
                code.code,
                code.description,
                code.created_by,
                code.max_uses,
                code.uses,
                code.expires_at.map(|at| at.to_rfc3339()),
                code.active as i32,
                code.created_at.to_rfc3339(),
                code.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(AppError::Validation(format!(
                "Promo code '{}' already exists",
                code.code
            )));
        }
        Ok(())
    }

    pub fn get_promo_code(&self, code: &str) -> AppResult<Option<PromoCode>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, code, description, created_by, max_uses, uses, expires_at, active, created_at, updated_at
             FROM promo_codes WHERE code = ?1",
            [code],
            parse_promo_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_promo_codes(&self, include_inactive: bool) -> AppResult<Vec<PromoCode>> {
        let conn = self.lock()?;
        let sql = if include_inactive {
            "SELECT id, code, description, created_by, max_uses, uses, expires_at, active, created_at, updated_at
             FROM promo_codes ORDER BY created_at DESC"
        } else {
            "SELECT id, code, description, created_by, max_uses, uses, expires_at, active, created_at, updated_at
             FROM promo_codes WHERE active = 1 ORDER BY created_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], parse_promo_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn set_promo_code_active(&self, id: &str, active: bool) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE promo_codes SET active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active as i32, Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn record_redemption(&self, code_id: &str, user_id: &str) -> AppResult<PromoRedemption> {
        let mut conn = self.lock()?;
        let now = Utc::now();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO promo_redemptions (code_id, user_id, redeemed_at) VALUES (?1, ?2, ?3)",
            params![code_id, user_id, now.to_rfc3339()],
        )?;
        if inserted == 0 {
            return Err(AppError::Validation(format!(
                "Promo code already redeemed by {}",
                user_id
            )));
        }
        // the uses cap is checked here, inside the transaction; callers may
        // also pre-check for friendlier errors but cannot race past it
        let updated = tx.execute(
            "UPDATE promo_codes SET uses = uses + 1, updated_at = ?1
             WHERE id = ?2 AND (max_uses IS NULL OR uses < max_uses)",
            params![now.to_rfc3339(), code_id],
        )?;
        if updated == 0 {
            return Err(AppError::Validation(
                "Promo code has no redemptions left".to_string(),
            ));
        }
        tx.commit()?;
        Ok(PromoRedemption {
            code_id: code_id.to_string(),
            user_id: user_id.to_string(),
            redeemed_at: now,
        })
    }

    pub fn deactivate_expired_promo_codes(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE promo_codes SET active = 0, updated_at = ?1
             WHERE active = 1 AND expires_at IS NOT NULL AND expires_at < ?1",
            [now.to_rfc3339()],
        )?;
        Ok(changed)
    }

    // ---- bulletins ----

    pub fn post_bulletin(&self, author_id: &str, payload: &PostBulletinPayload) -> AppResult<Bulletin> {
        let conn = self.lock()?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO bulletins (id, author_id, title, body, pinned, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
            params![
                id,
                author_id,
                payload.title,
                payload.body,
                payload.expires_at.map(|at| at.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        Ok(Bulletin {
            id,
            author_id: author_id.to_string(),
            title: payload.title.clone(),
            body: payload.body.clone(),
            pinned: false,
            expires_at: payload.expires_at,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_bulletins(&self, include_expired: bool) -> AppResult<Vec<Bulletin>> {
        let conn = self.lock()?;
        let sql = if include_expired {
            "SELECT id, author_id, title, body, pinned, expires_at, created_at, updated_at
             FROM bulletins ORDER BY pinned DESC, created_at DESC"
        } else {
            "SELECT id, author_id, title, body, pinned, expires_at, created_at, updated_at
             FROM bulletins WHERE expires_at IS NULL OR expires_at >= ?1
             ORDER BY pinned DESC, created_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = if include_expired {
            stmt.query_map([], parse_bulletin_row)?
        } else {
            stmt.query_map([Utc::now().to_rfc3339()], parse_bulletin_row)?
        };
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn set_bulletin_pinned(&self, id: &str, pinned: bool) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE bulletins SET pinned = ?1, updated_at = ?2 WHERE id = ?3",
            params![pinned as i32, Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn purge_stale_bulletins(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM bulletins WHERE pinned = 0 AND expires_at IS NOT NULL AND expires_at < ?1",
            [cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    // ---- meetings ----

    pub fn insert_meeting(&self, manager_id: &str, payload: &ScheduleMeetingPayload) -> AppResult<Meeting> {
        let conn = self.lock()?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO meetings (id, manager_id, report_id, scheduled_at, duration_minutes, agenda, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'scheduled', ?7, ?7)",
            params![
                id,
                manager_id,
                payload.report_id,
                payload.scheduled_at.to_rfc3339(),
                payload.duration_minutes,
                payload.agenda,
                now.to_rfc3339(),
            ],
        )?;
        Ok(Meeting {
            id,
            manager_id: manager_id.to_string(),
            report_id: payload.report_id.clone(),
            scheduled_at: payload.scheduled_at,
            duration_minutes: payload.duration_minutes,
            agenda: payload.agenda.clone(),
            status: MeetingStatus::Scheduled,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_meetings(&self, filters: &ListMeetingsFilters) -> AppResult<Vec<Meeting>> {
        let conn = self.lock()?;
        let mut query = String::from(
            "SELECT id, manager_id, report_id, scheduled_at, duration_minutes, agenda, status, created_at, updated_at
             FROM meetings WHERE 1 = 1",
        );
        let mut params_vec: Vec<String> = Vec::new();
        if let Some(manager_id) = &filters.manager_id {
            query.push_str(" AND manager_id = ?");
            params_vec.push(manager_id.clone());
        }
        if let Some(report_id) = &filters.report_id {
            query.push_str(" AND report_id = ?");
            params_vec.push(report_id.clone());
        }
        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(status.as_str().to_string());
        }
        query.push_str(" ORDER BY scheduled_at ASC");
        let limit = filters.limit.unwrap_or(100);
        query.push_str(" LIMIT ?");

        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_meeting_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_meeting(&self, id: &str) -> AppResult<Option<Meeting>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, manager_id, report_id, scheduled_at, duration_minutes, agenda, status, created_at, updated_at
             FROM meetings WHERE id = ?1",
            [id],
            parse_meeting_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn set_meeting_status(&self, id: &str, status: MeetingStatus) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE meetings SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    // ---- settings ----

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_none() {
            let defaults = serde_json::to_string(&AppSettings::default())?;
            conn.execute(
                "INSERT INTO settings (key, value_json) VALUES (?1, ?2)",
                params![SETTINGS_KEY, defaults],
            )?;
        }
        Ok(())
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(&current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged.clone())
            .map_err(|error| AppError::Validation(format!("Invalid settings update: {}", error)))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value_json) VALUES (?1, ?2)",
            params![SETTINGS_KEY, serde_json::to_string(&settings)?],
        )?;
        Ok(settings)
    }
}

impl Gateway for Database {
    fn list_profiles(&self) -> AppResult<Vec<Profile>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, email, display_name, roles_json, manager_email, created_at, updated_at
             FROM profiles ORDER BY display_name ASC",
        )?;
        let rows = stmt.query_map([], parse_profile_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn get_profile(&self, id: &str) -> AppResult<Option<Profile>> {
        self.profile_by_id(id)
    }

    fn get_profile_by_email(&self, email: &str) -> AppResult<Option<Profile>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, display_name, roles_json, manager_email, created_at, updated_at
             FROM profiles WHERE email = ?1",
            [email],
            parse_profile_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_teams(&self) -> AppResult<Vec<Team>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, manager_email, created_at, updated_at FROM teams ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], parse_team_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn list_teams_managed_by(&self, manager_email: &str) -> AppResult<Vec<Team>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, manager_email, created_at, updated_at FROM teams WHERE manager_email = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([manager_email], parse_team_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn list_team_members(&self, team_id: &str) -> AppResult<Vec<TeamMembership>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT team_id, user_id, role FROM team_members WHERE team_id = ?1 ORDER BY user_id ASC",
        )?;
        let rows = stmt.query_map([team_id], parse_membership_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    fn metric_record(&self, user_id: &str, period: &str) -> AppResult<Option<UserMetrics>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT user_id, period, leads, calls, contacts, scheduled, sits, sales, ap_cents, updated_at
             FROM metric_records WHERE user_id = ?1 AND period = ?2",
            [user_id, period],
            parse_metrics_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn upsert_metrics(&self, payload: &RecordMetricsPayload) -> AppResult<UserMetrics> {
        let conn = self.lock()?;
        let now = Utc::now();
        let metrics = payload.metrics;
        conn.execute(
            "INSERT INTO metric_records (user_id, period, leads, calls, contacts, scheduled, sits, sales, ap_cents, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, period) DO UPDATE SET
               leads=excluded.leads, calls=excluded.calls, contacts=excluded.contacts,
               scheduled=excluded.scheduled, sits=excluded.sits, sales=excluded.sales,
               ap_cents=excluded.ap_cents, updated_at=excluded.updated_at",
            params![
                payload.user_id,
                payload.period,
                metrics.leads,
                metrics.calls,
                metrics.contacts,
                metrics.scheduled,
                metrics.sits,
                metrics.sales,
                metrics.ap_cents,
                now.to_rfc3339(),
            ],
        )?;
        Ok(UserMetrics {
            user_id: payload.user_id.clone(),
            period: payload.period.clone(),
            metrics,
            updated_at: now,
        })
    }

    fn adjust_metric(&self, adjustment: &MetricAdjustment) -> AppResult<UserMetrics> {
        let conn = self.lock()?;
        let mut metrics = conn
            .query_row(
                "SELECT user_id, period, leads, calls, contacts, scheduled, sits, sales, ap_cents, updated_at
                 FROM metric_records WHERE user_id = ?1 AND period = ?2",
                [adjustment.user_id.as_str(), adjustment.period.as_str()],
                parse_metrics_row,
            )
            .optional()?
            .map(|record| record.metrics)
            .unwrap_or_else(MetricRecord::zeroed);
        metrics.apply_adjustment(adjustment.field, adjustment.delta);

        let now = Utc::now();
        conn.execute(
            "INSERT INTO metric_records (user_id, period, leads, calls, contacts, scheduled, sits, sales, ap_cents, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, period) DO UPDATE SET
               leads=excluded.leads, calls=excluded.calls, contacts=excluded.contacts,
               scheduled=excluded.scheduled, sits=excluded.sits, sales=excluded.sales,
               ap_cents=excluded.ap_cents, updated_at=excluded.updated_at",
            params![
                adjustment.user_id,
                adjustment.period,
                metrics.leads,
                metrics.calls,
                metrics.contacts,
                metrics.scheduled,
                metrics.sits,
                metrics.sales,
                metrics.ap_cents,
                now.to_rfc3339(),
            ],
        )?;
        Ok(UserMetrics {
            user_id: adjustment.user_id.clone(),
            period: adjustment.period.clone(),
            metrics,
            updated_at: now,
        })
    }
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let roles_raw: String = row.get(3)?;
    let roles = serde_json::from_str::<Vec<String>>(&roles_raw)
        .unwrap_or_default()
        .iter()
        .filter_map(|raw| parse_role(raw))
        .collect::<Vec<_>>();
    Ok(Profile {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        roles,
        manager_email: row.get(4)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
        updated_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

fn parse_team_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Team> {
    Ok(Team {
        id: row.get(0)?,
        name: row.get(1)?,
        manager_email: row.get(2)?,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
        updated_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_membership_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TeamMembership> {
    let role_raw: String = row.get(2)?;
    Ok(TeamMembership {
        team_id: row.get(0)?,
        user_id: row.get(1)?,
        role: parse_role(&role_raw).unwrap_or(Role::Agent),
    })
}

fn parse_metrics_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserMetrics> {
    Ok(UserMetrics {
        user_id: row.get(0)?,
        period: row.get(1)?,
        metrics: MetricRecord {
            leads: row.get(2)?,
            calls: row.get(3)?,
            contacts: row.get(4)?,
            scheduled: row.get(5)?,
            sits: row.get(6)?,
            sales: row.get(7)?,
            ap_cents: row.get(8)?,
        },
        updated_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_lead_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    let status_raw: String = row.get(6)?;
    let fields_raw: String = row.get(7)?;
    Ok(Lead {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        form_id: row.get(2)?,
        client_name: row.get(3)?,
        email: row.get(4)?,
        phone: row.get(5)?,
        status: parse_lead_status(&status_raw).unwrap_or(LeadStatus::New),
        fields: serde_json::from_str::<serde_json::Value>(&fields_raw)
            .unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_time(&row.get::<_, String>(8)?)?,
        updated_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_form_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FormDefinition> {
    let fields_raw: String = row.get(2)?;
    Ok(FormDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        fields: serde_json::from_str::<Vec<FormField>>(&fields_raw).unwrap_or_default(),
        created_at: parse_time(&row.get::<_, String>(3)?)?,
        updated_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_promo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromoCode> {
    Ok(PromoCode {
        id: row.get(0)?,
        code: row.get(1)?,
        description: row.get(2)?,
        created_by: row.get(3)?,
        max_uses: row.get(4)?,
        uses: row.get(5)?,
        expires_at: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        active: row.get::<_, i32>(7)? != 0,
        created_at: parse_time(&row.get::<_, String>(8)?)?,
        updated_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_bulletin_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bulletin> {
    Ok(Bulletin {
        id: row.get(0)?,
        author_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        pinned: row.get::<_, i32>(4)? != 0,
        expires_at: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        created_at: parse_time(&row.get::<_, String>(6)?)?,
        updated_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

fn parse_meeting_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Meeting> {
    let status_raw: String = row.get(6)?;
    Ok(Meeting {
        id: row.get(0)?,
        manager_id: row.get(1)?,
        report_id: row.get(2)?,
        scheduled_at: parse_time(&row.get::<_, String>(3)?)?,
        duration_minutes: row.get(4)?,
        agenda: row.get(5)?,
        status: parse_meeting_status(&status_raw).unwrap_or(MeetingStatus::Scheduled),
        created_at: parse_time(&row.get::<_, String>(7)?)?,
        updated_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    error.to_string(),
                )),
            )
        })
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(
                    target_map.entry(key).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (target_slot, update_value) => {
            *target_slot = update_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::gateway::Gateway;
    use crate::models::{
        MetricAdjustment, MetricField, MetricRecord, PromoCode, RecordMetricsPayload, Role,
        SaveProfilePayload, SaveTeamPayload, TeamMembership,
    };
    use chrono::Utc;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn profile_round_trips_by_email() {
        let (_dir, db) = open();
        let saved = db
            .save_profile(SaveProfilePayload {
                id: None,
                email: "agent@agency.test".to_string(),
                display_name: "Agent".to_string(),
                roles: vec![Role::Agent, Role::Manager],
                manager_email: Some("boss@agency.test".to_string()),
            })
            .expect("save profile");

        let loaded = db
            .get_profile_by_email("agent@agency.test")
            .expect("get profile")
            .expect("profile exists");
        assert_eq!(loaded.id, saved.id);
        assert!(loaded.has_role(Role::Manager));
        assert_eq!(loaded.manager_email.as_deref(), Some("boss@agency.test"));

        // saving again with the same email updates instead of duplicating
        db.save_profile(SaveProfilePayload {
            id: None,
            email: "agent@agency.test".to_string(),
            display_name: "Agent Renamed".to_string(),
            roles: vec![Role::Agent],
            manager_email: None,
        })
        .expect("resave profile");
        assert_eq!(db.list_profiles().expect("list").len(), 1);
    }

    #[test]
    fn team_membership_replacement_is_atomic() {
        let (_dir, db) = open();
        let team = db
            .save_team(SaveTeamPayload {
                id: None,
                name: "Alpha".to_string(),
                manager_email: "m@agency.test".to_string(),
            })
            .expect("save team");

        let membership = |user: &str| TeamMembership {
            team_id: team.id.clone(),
            user_id: user.to_string(),
            role: Role::Agent,
        };
        db.set_team_members(&team.id, &[membership("a"), membership("b")])
            .expect("set members");
        db.set_team_members(&team.id, &[membership("c")])
            .expect("replace members");

        let members = db.list_team_members(&team.id).expect("list members");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, "c");
    }

    #[test]
    fn managed_teams_lists_every_team_for_a_manager() {
        let (_dir, db) = open();
        for name in ["Alpha", "Bravo"] {
            db.save_team(SaveTeamPayload {
                id: None,
                name: name.to_string(),
                manager_email: "m@agency.test".to_string(),
            })
            .expect("save team");
        }

        let managed = db
            .list_teams_managed_by("m@agency.test")
            .expect("managed teams");
        assert_eq!(managed.len(), 2);
        assert!(db
            .list_teams_managed_by("other@agency.test")
            .expect("no teams")
            .is_empty());
    }

    #[test]
    fn redemption_cap_holds_inside_the_transaction() {
        let (_dir, db) = open();
        let now = Utc::now();
        let code = PromoCode {
            id: "promo-1".to_string(),
            code: "ABCD-2345".to_string(),
            description: None,
            created_by: "admin".to_string(),
            max_uses: Some(1),
            uses: 0,
            expires_at: None,
            active: true,
            created_at: now,
            updated_at: now,
        };
        db.insert_promo_code(&code).expect("insert code");

        db.record_redemption(&code.id, "u1").expect("first redemption");
        let err = db
            .record_redemption(&code.id, "u2")
            .expect_err("cap enforced even without a pre-check");
        assert!(err.to_string().contains("redemptions"));

        let loaded = db
            .get_promo_code("ABCD-2345")
            .expect("fetch")
            .expect("code exists");
        assert_eq!(loaded.uses, 1);
    }

    #[test]
    fn metric_adjustments_floor_at_zero_and_persist() {
        let (_dir, db) = open();
        db.upsert_metrics(&RecordMetricsPayload {
            user_id: "u1".to_string(),
            period: "2026-08".to_string(),
            metrics: MetricRecord {
                leads: 5,
                ..MetricRecord::default()
            },
        })
        .expect("upsert");

        db.adjust_metric(&MetricAdjustment {
            user_id: "u1".to_string(),
            period: "2026-08".to_string(),
            field: MetricField::Leads,
            delta: -9,
        })
        .expect("adjust");

        let record = db
            .metric_record("u1", "2026-08")
            .expect("fetch")
            .expect("row exists");
        assert_eq!(record.metrics.leads, 0);

        // adjusting an absent row starts from zero
        let created = db
            .adjust_metric(&MetricAdjustment {
                user_id: "u2".to_string(),
                period: "2026-08".to_string(),
                field: MetricField::Ap,
                delta: 12_500,
            })
            .expect("adjust new");
        assert_eq!(created.metrics.ap_cents, 12_500);
    }

    #[test]
    fn settings_merge_preserves_untouched_fields() {
        let (_dir, db) = open();
        let defaults = db.get_settings().expect("defaults");
        let updated = db
            .update_settings(serde_json::json!({ "hierarchyMaxDepth": 4 }))
            .expect("update");
        assert_eq!(updated.hierarchy_max_depth, 4);
        assert_eq!(updated.bulletin_retention_days, defaults.bulletin_retention_days);

        let err = db
            .update_settings(serde_json::json!({ "hierarchyMaxDepth": "deep" }))
            .expect_err("type mismatch rejected");
        assert!(err.to_string().contains("Invalid settings update"));
    }
}

use crate::errors::{AppError, AppResult};
use crate::models::{Profile, Role};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Holds the signed-in profile. Authentication itself happens in the
/// backend; this only tracks who the client is acting as.
#[derive(Clone, Default)]
pub struct SessionManager {
    current: Arc<Mutex<Option<Profile>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sign_in(&self, profile: Profile) {
        let mut current = self.current.lock().await;
        *current = Some(profile);
    }

    pub async fn sign_out(&self) {
        let mut current = self.current.lock().await;
        *current = None;
    }

    pub async fn current(&self) -> Option<Profile> {
        let current = self.current.lock().await;
        current.clone()
    }

    pub async fn require_signed_in(&self) -> AppResult<Profile> {
        let current = self.current.lock().await;
        current
            .clone()
            .ok_or_else(|| AppError::Denied("No signed-in profile".to_string()))
    }

    pub async fn require_role(&self, role: Role) -> AppResult<Profile> {
        let profile = self.require_signed_in().await?;
        if profile.has_role(role) || profile.has_role(Role::Admin) {
            return Ok(profile);
        }
        Err(AppError::Denied(format!(
            "Signed-in profile lacks the {} role",
            role.as_str()
        )))
    }
}

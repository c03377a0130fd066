use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActorProfile {
    pub id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

impl ActorProfile {
    /// "First Last" when either part is set, otherwise the username.
    pub fn display_name(&self) -> Option<String> {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if !full.is_empty() {
            return Some(full);
        }

        self.username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

/// The actor as embedded in a synthesized notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSnapshot {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl ActorSnapshot {
    pub fn from_profile(profile: &ActorProfile, placeholder: &str) -> Self {
        Self {
            id: profile.id,
            name: profile
                .display_name()
                .unwrap_or_else(|| placeholder.to_string()),
            avatar_url: profile.avatar_url.clone(),
        }
    }

    pub fn placeholder(id: Uuid, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            avatar_url: None,
        }
    }
}

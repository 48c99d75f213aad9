use tracing::{info, warn};
use uuid::Uuid;

use parley_types::models::Profile;

use crate::backend::RelationalStore;

/// Profiles of everyone except the signed-in user.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    profiles: Vec<Profile>,
}

impl Directory {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    /// Fetch once, unsorted. A failed fetch leaves the directory empty.
    pub async fn load<S>(store: &S, self_id: Uuid) -> Self
    where
        S: RelationalStore + ?Sized,
    {
        match store.list_profiles_except(self_id).await {
            Ok(profiles) => {
                info!("Loaded {} profiles", profiles.len());
                Self::new(profiles)
            }
            Err(e) => {
                warn!("Error fetching profiles: {}", e);
                Self::default()
            }
        }
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    /// Case-insensitive substring match on `username`. Profiles without a
    /// username never match, even for an empty term.
    pub fn search(&self, term: &str) -> Vec<&Profile> {
        let term = term.to_lowercase();
        self.profiles
            .iter()
            .filter(|p| {
                p.username
                    .as_deref()
                    .is_some_and(|name| name.to_lowercase().contains(&term))
            })
            .collect()
    }

    pub fn find_by_username(&self, username: &str) -> Option<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.username.as_deref().is_some_and(|u| u.eq_ignore_ascii_case(username)))
    }

    pub fn get(&self, id: Uuid) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

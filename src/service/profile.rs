//! Core config profiles
//!
//! A profile is a complete stored config for one core, owned by a user and
//! optionally pinned to nodes. Each profile records which core it targets;
//! its `config_json` is validated against that core's model only.

use std::sync::Arc;

use tracing::info;

use crate::common::{Error, Result};
use crate::core::{CoreConfig, SingBoxConfig, XrayConfig};
use crate::model::{CoreConfigProfile, CoreType};
use crate::store::Store;

use super::settings::SettingsService;

/// Check that `text` is a config of `core`.
pub fn validate_config_json(core: CoreType, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::config("config JSON cannot be empty"));
    }
    let parsed = match core {
        CoreType::Xray => XrayConfig::parse(text).map(drop),
        CoreType::SingBox => SingBoxConfig::parse(text).map(drop),
    };
    parsed.map_err(|e| Error::config(format!("invalid {} config JSON: {}", core, e)))
}

#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn Store>,
    settings: SettingsService,
}

impl ProfileService {
    pub fn new(store: Arc<dyn Store>, settings: SettingsService) -> Self {
        ProfileService { store, settings }
    }

    pub async fn get(&self, id: i64) -> Result<CoreConfigProfile> {
        self.store
            .profile(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("profile {}", id)))
    }

    /// A user's profiles, the default first, then oldest first.
    pub async fn list(&self, user_id: i64) -> Result<Vec<CoreConfigProfile>> {
        let mut profiles: Vec<_> = self
            .store
            .profiles()
            .await?
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect();
        profiles.sort_by_key(|p| (!p.is_default, p.created_at, p.id));
        Ok(profiles)
    }

    pub async fn get_default(&self, user_id: i64) -> Result<Option<CoreConfigProfile>> {
        Ok(self
            .store
            .profiles()
            .await?
            .into_iter()
            .find(|p| p.user_id == user_id && p.is_default))
    }

    /// Unset the default flag on every profile of `user_id` except `keep`.
    async fn clear_defaults(&self, user_id: i64, keep: i64) -> Result<()> {
        for mut profile in self.store.profiles().await? {
            if profile.user_id == user_id && profile.is_default && profile.id != keep {
                profile.is_default = false;
                self.store.save_profile(profile).await?;
            }
        }
        Ok(())
    }

    pub async fn add(&self, mut profile: CoreConfigProfile) -> Result<CoreConfigProfile> {
        validate_config_json(profile.core, &profile.config_json)?;
        if profile.is_default {
            self.clear_defaults(profile.user_id, -1).await?;
        }
        profile.id = 0;
        let profile = self.store.save_profile(profile).await?;
        info!(
            "{} core config profile {} created for user {}",
            profile.core, profile.id, profile.user_id
        );
        Ok(profile)
    }

    /// Update a profile. An empty `config_json` keeps the stored one; node
    /// assignments are managed by [`assign_to_nodes`](Self::assign_to_nodes).
    pub async fn update(&self, profile: CoreConfigProfile) -> Result<CoreConfigProfile> {
        let existing = self.get(profile.id).await?;
        let config_json = if profile.config_json.is_empty() {
            existing.config_json
        } else {
            validate_config_json(profile.core, &profile.config_json)?;
            profile.config_json
        };
        if profile.is_default {
            self.clear_defaults(profile.user_id, profile.id).await?;
        }
        self.store
            .save_profile(CoreConfigProfile {
                config_json,
                created_at: existing.created_at,
                node_ids: existing.node_ids,
                ..profile
            })
            .await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let used = self
            .store
            .outbounds()
            .await?
            .iter()
            .filter(|o| o.core_config_profile_id == Some(id))
            .count();
        if used > 0 {
            return Err(Error::conflict(format!(
                "cannot delete profile: it is used by {} outbound(s)",
                used
            )));
        }
        if self.get(id).await?.is_default {
            return Err(Error::conflict("cannot delete the default profile"));
        }
        self.store.delete_profile(id).await?;
        info!("Core config profile {} deleted", id);
        Ok(())
    }

    pub async fn set_as_default(&self, id: i64, user_id: i64) -> Result<()> {
        let mut profile = self.get(id).await?;
        if profile.user_id != user_id {
            return Err(Error::not_found(format!("profile {} of user {}", id, user_id)));
        }
        self.clear_defaults(user_id, id).await?;
        profile.is_default = true;
        self.store.save_profile(profile).await?;
        info!("Core config profile {} set as default for user {}", id, user_id);
        Ok(())
    }

    pub async fn create_default_from_template(
        &self,
        user_id: i64,
        core: CoreType,
    ) -> Result<CoreConfigProfile> {
        let template = self.settings.template(core).await?;
        self.add(CoreConfigProfile {
            id: 0,
            user_id,
            name: "Default".to_string(),
            description: format!(
                "Default {} core configuration profile created from template",
                core
            ),
            core,
            config_json: template,
            is_default: true,
            created_at: 0,
            updated_at: 0,
            node_ids: Vec::new(),
        })
        .await
    }

    /// Replace a profile's config with its core's current template.
    pub async fn reset_to_default(&self, id: i64) -> Result<CoreConfigProfile> {
        let mut profile = self.get(id).await?;
        profile.config_json = self.settings.template(profile.core).await?;
        self.update(profile).await
    }

    pub async fn ensure_default(&self, user_id: i64, core: CoreType) -> Result<CoreConfigProfile> {
        match self.get_default(user_id).await? {
            Some(profile) => Ok(profile),
            None => self.create_default_from_template(user_id, core).await,
        }
    }

    /// Pin a profile to nodes. A node belongs to at most one profile; an
    /// empty list clears the profile's assignments.
    pub async fn assign_to_nodes(&self, profile_id: i64, node_ids: &[i64]) -> Result<()> {
        let mut profile = self.get(profile_id).await?;
        if !node_ids.is_empty() {
            let taken: Vec<i64> = self
                .store
                .profiles()
                .await?
                .iter()
                .filter(|p| p.id != profile_id)
                .flat_map(|p| p.node_ids.iter().copied())
                .filter(|id| node_ids.contains(id))
                .collect();
            if !taken.is_empty() {
                let names: Vec<String> = self
                    .store
                    .nodes()
                    .await?
                    .into_iter()
                    .filter(|n| taken.contains(&n.id))
                    .map(|n| n.name)
                    .collect();
                return Err(Error::conflict(format!(
                    "nodes already assigned to other profile: [{}]",
                    names.join(", ")
                )));
            }
        }
        profile.node_ids = node_ids.to_vec();
        self.store.save_profile(profile).await?;
        Ok(())
    }

    pub async fn nodes_for_profile(&self, profile_id: i64) -> Result<Vec<i64>> {
        Ok(self.get(profile_id).await?.node_ids)
    }

    pub async fn profiles_for_node(&self, node_id: i64) -> Result<Vec<CoreConfigProfile>> {
        Ok(self
            .store
            .profiles()
            .await?
            .into_iter()
            .filter(|p| p.node_ids.contains(&node_id))
            .collect())
    }
}

// OpenDirectory, the pluggable directory management backend of the Musikverein Leopoldsdorf.
// Copyright (C) 2023  Richard Stöckl
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA.

//! Per-branch authorization: a read/write/delete matrix keyed by branch dn,
//! merged with OR over the matching branches of the user and its groups.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rocket::serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::{DirectoryError, DirectoryResult};
use crate::hooks::{self, chained, HookEvent};
use crate::ldap::model::{RequestContext, SearchOpts};
use crate::ldap::{dn, LdapClient};
use crate::plugin::{Plugin, PluginCore};

/// The verbs a branch entry may grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Delete,
}

/// One read/write/delete triple.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub delete: bool,
}

impl Permissions {
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            delete: true,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            read: self.read || other.read,
            write: self.write || other.write,
            delete: self.delete || other.delete,
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Write => self.write,
            Permission::Delete => self.delete,
        }
    }
}

/// The permission matrix as configured.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthzDocument {
    #[serde(default)]
    pub default: Permissions,
    #[serde(default)]
    pub users: HashMap<String, HashMap<String, Permissions>>,
    #[serde(default)]
    pub groups: HashMap<String, HashMap<String, Permissions>>,
}

struct CachedMembership {
    groups: Vec<String>,
    expires: Instant,
}

/// The plugin gating every verb on the effective branch permissions.
///
/// Group membership is fetched from the directory and cached per uid with a
/// ttl. Internal contexts bypass every check.
pub struct AuthzPerBranch {
    document: Option<AuthzDocument>,
    cache_ttl: Duration,
    group_base: Option<String>,
    membership: Mutex<HashMap<String, CachedMembership>>,
}

impl AuthzPerBranch {
    /// Build the engine from the configuration.
    /// The matrix is given inline as JSON or as the path of a JSON file.
    pub fn from_config(config: &Config) -> DirectoryResult<Self> {
        let source = config.authz.per_branch_config.trim();
        let document = if source.is_empty() {
            None
        } else {
            let raw = if source.starts_with('{') {
                source.to_string()
            } else {
                fs::read_to_string(source).map_err(|error| {
                    DirectoryError::ConfigInvalid(format!(
                        "cannot read authz config '{}': {}",
                        source, error
                    ))
                })?
            };
            Some(serde_json::from_str(&raw).map_err(|error| {
                DirectoryError::ConfigInvalid(format!("cannot parse authz config: {}", error))
            })?)
        };
        Ok(Self {
            document,
            cache_ttl: Duration::from_secs(config.authz.cache_ttl),
            group_base: config.authz.group_base.clone(),
            membership: Mutex::new(HashMap::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.document.is_some()
    }

    /// The effective permissions of the user on the branch, groups given.
    ///
    /// Starts from the default triple and merges every matching branch entry
    /// of the user and of its groups with OR.
    pub fn permissions_for(
        &self,
        uid: Option<&str>,
        branch_dn: &str,
        groups: &[String],
    ) -> Permissions {
        let Some(document) = &self.document else {
            return Permissions::all();
        };
        let mut permissions = document.default;
        if let Some(uid) = uid {
            if let Some(branches) = document.users.get(uid) {
                for (branch, granted) in branches {
                    if dn::is_under(branch_dn, branch) {
                        permissions = permissions.merge(*granted);
                    }
                }
            }
        }
        for group in groups {
            if let Some(branches) = document.groups.get(group) {
                for (branch, granted) in branches {
                    if dn::is_under(branch_dn, branch) {
                        permissions = permissions.merge(*granted);
                    }
                }
            }
        }
        permissions
    }

    /// All configured branches where the user holds the permission.
    pub fn authorized_branches(
        &self,
        uid: Option<&str>,
        permission: Permission,
        groups: &[String],
    ) -> Vec<String> {
        let Some(document) = &self.document else {
            return Vec::new();
        };
        let mut candidates: Vec<&String> = Vec::new();
        if let Some(uid) = uid {
            if let Some(branches) = document.users.get(uid) {
                candidates.extend(branches.keys());
            }
        }
        for group in groups {
            if let Some(branches) = document.groups.get(group) {
                candidates.extend(branches.keys());
            }
        }
        let mut authorized: Vec<String> = candidates
            .into_iter()
            .filter(|branch| {
                self.permissions_for(uid, branch, groups)
                    .allows(permission)
            })
            .cloned()
            .collect();
        authorized.sort();
        authorized.dedup();
        authorized
    }

    /// The group names of the user, cached for the configured ttl.
    async fn groups_of(&self, uid: &str, ldap: &LdapClient) -> DirectoryResult<Vec<String>> {
        let needs_groups = self
            .document
            .as_ref()
            .map(|document| !document.groups.is_empty())
            .unwrap_or(false);
        if !needs_groups {
            return Ok(Vec::new());
        }
        {
            let membership = self.membership.lock().expect("membership cache");
            if let Some(cached) = membership.get(uid) {
                if cached.expires > Instant::now() {
                    return Ok(cached.groups.clone());
                }
            }
        }
        let user_dn = ldap.normalize_dn(uid);
        let filter = format!(
            "(|(member={})(uniqueMember={})(memberUid={}))",
            dn::filter_escape(&user_dn),
            dn::filter_escape(&user_dn),
            dn::filter_escape(uid)
        );
        let base = self.group_base.clone();
        let entries = ldap
            .search(
                SearchOpts::sub(filter).with_attributes(vec!["cn".to_string()]),
                base.as_deref(),
                &RequestContext::system(),
            )
            .await?;
        let groups: Vec<String> = entries
            .iter()
            .filter_map(|entry| entry.first("cn"))
            .map(|cn| cn.to_string())
            .collect();
        debug!("user '{}' belongs to {} groups", uid, groups.len());
        self.membership.lock().expect("membership cache").insert(
            uid.to_string(),
            CachedMembership {
                groups: groups.clone(),
                expires: Instant::now() + self.cache_ttl,
            },
        );
        Ok(groups)
    }

    /// The effective permissions of a request context on a branch.
    pub async fn effective_permissions(
        &self,
        ctx: &RequestContext,
        branch_dn: &str,
        ldap: &LdapClient,
    ) -> DirectoryResult<Permissions> {
        let groups = match &ctx.user {
            Some(uid) => self.groups_of(uid, ldap).await?,
            None => Vec::new(),
        };
        Ok(self.permissions_for(ctx.user.as_deref(), branch_dn, &groups))
    }

    async fn require(
        &self,
        ctx: &RequestContext,
        branch_dn: &str,
        permission: Permission,
        ldap: &LdapClient,
    ) -> DirectoryResult<()> {
        if ctx.internal {
            return Ok(());
        }
        let permissions = self.effective_permissions(ctx, branch_dn, ldap).await?;
        if permissions.allows(permission) {
            Ok(())
        } else {
            info!(
                "denied {:?} on '{}' for {}",
                permission, branch_dn, ctx
            );
            Err(DirectoryError::PermissionDenied {
                base: branch_dn.to_string(),
            })
        }
    }
}

#[rocket::async_trait]
impl Plugin for AuthzPerBranch {
    fn name(&self) -> &'static str {
        "authz-per-branch"
    }

    fn roles(&self) -> Vec<&'static str> {
        vec!["authorization"]
    }

    async fn init(self: Arc<Self>, core: &PluginCore) -> DirectoryResult<()> {
        if !self.enabled() {
            debug!("per-branch authorization is disabled");
            return Ok(());
        }

        let authz = self.clone();
        let ldap = core.ldap.clone();
        core.hooks.register_chained(
            hooks::LDAP_SEARCH_REQUEST,
            chained(move |event| {
                let authz = authz.clone();
                let ldap = ldap.clone();
                async move {
                    if let HookEvent::SearchRequest { base, opts, ctx } = event {
                        if !ctx.internal {
                            authz.require(&ctx, &base, Permission::Read, &ldap).await?;
                        }
                        Ok(HookEvent::SearchRequest { base, opts, ctx })
                    } else {
                        Ok(event)
                    }
                }
            }),
        );

        for hook in [
            hooks::LDAP_ADD_REQUEST,
            hooks::LDAP_MODIFY_REQUEST,
            hooks::LDAP_RENAME_REQUEST,
        ] {
            let authz = self.clone();
            let ldap = core.ldap.clone();
            core.hooks.register_chained(
                hook,
                chained(move |event| {
                    let authz = authz.clone();
                    let ldap = ldap.clone();
                    async move {
                        let (dn, ctx) = match &event {
                            HookEvent::AddRequest { dn, ctx, .. } => (dn.clone(), ctx.clone()),
                            HookEvent::ModifyRequest { dn, ctx, .. } => (dn.clone(), ctx.clone()),
                            HookEvent::RenameRequest { dn, ctx, .. } => (dn.clone(), ctx.clone()),
                            _ => return Ok(event),
                        };
                        authz.require(&ctx, &dn, Permission::Write, &ldap).await?;
                        Ok(event)
                    }
                }),
            );
        }

        let authz = self.clone();
        let ldap = core.ldap.clone();
        core.hooks.register_chained(
            hooks::LDAP_DELETE_REQUEST,
            chained(move |event| {
                let authz = authz.clone();
                let ldap = ldap.clone();
                async move {
                    if let HookEvent::DeleteRequest { dns, ctx } = &event {
                        for dn in dns {
                            authz.require(ctx, dn, Permission::Delete, &ldap).await?;
                        }
                    }
                    Ok(event)
                }
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(document: serde_json::Value) -> AuthzPerBranch {
        let mut config = Config::default();
        config.authz.per_branch_config = document.to_string();
        AuthzPerBranch::from_config(&config).expect("authz engine")
    }

    fn matrix() -> AuthzPerBranch {
        engine(serde_json::json!({
            "default": {"read": false, "write": false, "delete": false},
            "users": {
                "alice": {
                    "ou=a,dc=ex": {"read": true, "write": true},
                    "ou=b,dc=ex": {"read": true},
                },
            },
            "groups": {
                "admins": {
                    "dc=ex": {"read": true, "write": true, "delete": true},
                },
            },
        }))
    }

    #[test]
    fn default_applies_when_nothing_matches() {
        let authz = matrix();
        let permissions = authz.permissions_for(Some("alice"), "ou=other,dc=ex", &[]);
        assert_eq!(permissions, Permissions::default());
    }

    #[test]
    fn user_branches_merge_with_or() {
        let authz = matrix();
        let permissions = authz.permissions_for(Some("alice"), "uid=u,ou=a,dc=ex", &[]);
        assert!(permissions.read);
        assert!(permissions.write);
        assert!(!permissions.delete);
    }

    #[test]
    fn group_branches_extend_user_permissions() {
        let authz = matrix();
        let permissions =
            authz.permissions_for(Some("bob"), "ou=b,dc=ex", &["admins".to_string()]);
        assert!(permissions.delete);
    }

    #[test]
    fn branch_matching_respects_component_boundaries() {
        let authz = matrix();
        let permissions = authz.permissions_for(Some("alice"), "ou=aa,dc=ex", &[]);
        assert!(!permissions.read);
    }

    #[test]
    fn authorized_branches_filter_by_permission() {
        let authz = matrix();
        let readable = authz.authorized_branches(Some("alice"), Permission::Read, &[]);
        assert_eq!(readable, vec!["ou=a,dc=ex", "ou=b,dc=ex"]);
        let writable = authz.authorized_branches(Some("alice"), Permission::Write, &[]);
        assert_eq!(writable, vec!["ou=a,dc=ex"]);
    }

    #[test]
    fn a_disabled_engine_allows_everything() {
        let authz = engine_from_empty();
        let permissions = authz.permissions_for(None, "ou=a,dc=ex", &[]);
        assert_eq!(permissions, Permissions::all());
    }

    fn engine_from_empty() -> AuthzPerBranch {
        AuthzPerBranch::from_config(&Config::default()).expect("authz engine")
    }

    #[test]
    fn malformed_documents_are_fatal() {
        let mut config = Config::default();
        config.authz.per_branch_config = "{not json".to_string();
        assert!(matches!(
            AuthzPerBranch::from_config(&config),
            Err(DirectoryError::ConfigInvalid(_))
        ));
    }
}

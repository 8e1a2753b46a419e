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

//! Soft deletion: deletes on watched branches become moves into the trash.

use std::sync::Arc;

use chrono::Utc;

use crate::config::{dn_list, TrashConfig};
use crate::errors::{DirectoryError, DirectoryResult};
use crate::hooks::{self, chained, HookEvent};
use crate::ldap::model::{ChangeSet, Entry, RequestContext};
use crate::ldap::{dn, LdapClient};
use crate::plugin::{Plugin, PluginCore};

/// The plugin intercepting deletes on the watched branches.
///
/// Intercepted entries are moved below the trash base and stamped with their
/// origin. Dns below the trash base itself are never intercepted, so purging
/// the trash performs a hard delete.
pub struct Trash {
    base: String,
    watched: Vec<String>,
    add_metadata: bool,
    auto_create: bool,
}

impl Trash {
    pub fn new(config: &TrashConfig) -> Self {
        Self {
            base: config.base.clone(),
            watched: dn_list(&config.watched_bases),
            add_metadata: config.add_metadata,
            auto_create: config.auto_create,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.base.is_empty() && !self.watched.is_empty()
    }

    /// Whether a delete of the dn should be intercepted.
    fn intercepts(&self, dn: &str) -> bool {
        if dn::is_under(dn, &self.base) {
            return false;
        }
        self.watched
            .iter()
            .any(|watched| dn::is_under(dn, watched))
    }

    /// The dn an intercepted entry is moved to.
    fn trash_dn(&self, dn: &str) -> String {
        format!("{},{}", dn::rdn(dn), self.base)
    }

    /// The metadata stamped onto soft-deleted entries.
    fn metadata(original_dn: &str) -> String {
        format!(
            "Deleted on {}, originally at {}",
            Utc::now().to_rfc3339(),
            original_dn
        )
    }

    async fn create_base(&self, ldap: &LdapClient) -> DirectoryResult<()> {
        let system = RequestContext::system();
        if ldap.find(&self.base, &system).await?.is_some() {
            return Ok(());
        }
        info!("creating missing trash base '{}'", self.base);
        let mut entry = Entry::new(self.base.clone());
        entry.set(
            "objectClass",
            vec!["top".to_string(), "organizationalUnit".to_string()],
        );
        entry.set(
            "ou",
            vec![dn::rdn_value(dn::rdn(&self.base)).to_string()],
        );
        entry.set(
            "description",
            vec!["Soft-deleted entries".to_string()],
        );
        ldap.add(&self.base, entry, &system).await
    }

    /// Replace the delete batch with the dns which still need a hard delete.
    async fn intercept(
        &self,
        ldap: &LdapClient,
        dns: Vec<String>,
    ) -> DirectoryResult<Vec<String>> {
        let system = RequestContext::system();
        let mut remaining = Vec::with_capacity(dns.len());
        for dn in dns {
            if !self.intercepts(&dn) {
                remaining.push(dn);
                continue;
            }
            if ldap.find(&dn, &system).await?.is_none() {
                // let the hard delete surface the not-found
                remaining.push(dn);
                continue;
            }
            let trash_dn = self.trash_dn(&dn);
            if ldap.find(&trash_dn, &system).await?.is_some() {
                debug!("replacing existing trash entry '{}'", trash_dn);
                ldap.delete(vec![trash_dn.clone()], &system)
                    .await
                    .map_err(|error| DirectoryError::TrashMoveFailed {
                        dn: dn.clone(),
                        message: error.to_string(),
                    })?;
            }
            ldap.move_entry(&dn, &trash_dn)
                .await
                .map_err(|error| DirectoryError::TrashMoveFailed {
                    dn: dn.clone(),
                    message: error.to_string(),
                })?;
            if self.add_metadata {
                let changes = ChangeSet::replacing("description", vec![Self::metadata(&dn)]);
                if let Err(error) = ldap.modify(&trash_dn, changes, &system).await {
                    warn!("cannot stamp trash entry '{}': {}", trash_dn, error);
                }
            }
            info!("soft-deleted '{}' to '{}'", dn, trash_dn);
        }
        Ok(remaining)
    }
}

#[rocket::async_trait]
impl Plugin for Trash {
    fn name(&self) -> &'static str {
        "trash"
    }

    fn roles(&self) -> Vec<&'static str> {
        vec!["soft-delete"]
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["org-consistency"]
    }

    async fn init(self: Arc<Self>, core: &PluginCore) -> DirectoryResult<()> {
        if !self.enabled() {
            debug!("trash is disabled");
            return Ok(());
        }
        if self.auto_create {
            self.create_base(&core.ldap).await?;
        }
        let ldap = core.ldap.clone();
        let trash = self.clone();
        core.hooks.register_chained(
            hooks::LDAP_DELETE_REQUEST,
            chained(move |event| {
                let ldap = ldap.clone();
                let trash = trash.clone();
                async move {
                    let (dns, ctx) = match event {
                        HookEvent::DeleteRequest { dns, ctx } => (dns, ctx),
                        other => return Ok(other),
                    };
                    let dns = trash.intercept(&ldap, dns).await?;
                    Ok(HookEvent::DeleteRequest { dns, ctx })
                }
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trash() -> Trash {
        Trash::new(&TrashConfig {
            base: "ou=trash,dc=ex".to_string(),
            watched_bases: "ou=members,dc=ex; ou=groups,dc=ex".to_string(),
            add_metadata: true,
            auto_create: false,
        })
    }

    #[test]
    fn watched_dns_are_intercepted() {
        let trash = trash();
        assert!(trash.intercepts("uid=t,ou=members,dc=ex"));
        assert!(trash.intercepts("cn=g,ou=groups,dc=ex"));
        assert!(!trash.intercepts("uid=t,ou=other,dc=ex"));
    }

    #[test]
    fn the_trash_branch_itself_is_never_intercepted() {
        let trash = Trash::new(&TrashConfig {
            base: "ou=trash,dc=ex".to_string(),
            // the trash base lies inside the watched base
            watched_bases: "dc=ex".to_string(),
            add_metadata: true,
            auto_create: false,
        });
        assert!(trash.intercepts("uid=t,dc=ex"));
        assert!(!trash.intercepts("uid=t,ou=trash,dc=ex"));
    }

    #[test]
    fn trash_dns_keep_the_rdn() {
        let trash = trash();
        assert_eq!(
            trash.trash_dn("uid=t,ou=members,dc=ex"),
            "uid=t,ou=trash,dc=ex"
        );
    }

    #[test]
    fn metadata_contains_timestamp_and_origin() {
        let metadata = Trash::metadata("uid=t,dc=ex");
        assert!(metadata.starts_with("Deleted on "));
        assert!(metadata.ends_with(", originally at uid=t,dc=ex"));
        let timestamp = metadata
            .trim_start_matches("Deleted on ")
            .split(',')
            .next()
            .expect("timestamp part");
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn an_unconfigured_trash_is_disabled() {
        let trash = Trash::new(&TrashConfig::default());
        assert!(!trash.enabled());
    }
}

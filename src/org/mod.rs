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

//! Referential integrity between entries and their organizations.
//!
//! Every entry may carry a link to its organization together with a cached,
//! human readable path. This module keeps both consistent across creation,
//! modification, deletion and renames of whole organization subtrees.

/// Module which handles the rest endpoints of the organization tree.
pub mod controller;

use std::sync::Arc;

use okapi::openapi3::OpenApi;
use rocket_okapi::openapi_get_routes_spec;
use rocket_okapi::settings::OpenApiSettings;

use crate::errors::{DirectoryError, DirectoryResult};
use crate::hooks::{self, chained, fanout, HookEvent};
use crate::ldap::model::{ChangeSet, Entry, RequestContext, SearchOpts, Values};
use crate::ldap::{dn, LdapClient};
use crate::plugin::{Plugin, PluginCore};

/// The attribute binding an entry to its organization.
pub const ORGANIZATION_LINK: &str = "organizationLink";
/// The attribute caching the human readable hierarchy of the linked organization.
pub const ORGANIZATION_PATH: &str = "organizationPath";
/// The attribute on organization entries caching their own hierarchy.
pub const PATH: &str = "path";

/// The filter matching organization entries.
pub const ORGANIZATION_FILTER: &str =
    "(|(objectClass=organizationalUnit)(objectClass=organization))";

pub fn get_routes_and_docs(settings: &OpenApiSettings) -> (Vec<rocket::Route>, OpenApi) {
    openapi_get_routes_spec![
        settings: controller::top_organizations,
        controller::organization,
        controller::organization_subnodes,
        controller::delete_organization,
    ]
}

/// Whether the entry is an organization.
pub fn is_organization(entry: &Entry) -> bool {
    entry.object_classes().iter().any(|class| {
        class.eq_ignore_ascii_case("organizationalUnit")
            || class.eq_ignore_ascii_case("organization")
    })
}

/// The human readable path of an organization entry.
/// Prefers the cached attribute, falls back to the dn derived value.
pub fn path_of(entry: &Entry, base: &str) -> String {
    entry
        .first(PATH)
        .map(|path| path.to_string())
        .unwrap_or_else(|| dn::path_below(&entry.dn, base))
}

/// The observable states of an organization deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrgDeleteState {
    Checked,
    Empty,
    NonEmpty,
    Deleted,
    Rejected,
}

/// The organization delete state machine.
///
/// `Checked → Empty → Deleted` when nothing links to the organization,
/// `Checked → NonEmpty → Rejected` otherwise, without touching the directory.
pub struct OrgDeletion {
    dn: String,
    state: OrgDeleteState,
}

impl OrgDeletion {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            state: OrgDeleteState::Checked,
        }
    }

    pub fn state(&self) -> OrgDeleteState {
        self.state
    }

    /// Decide between `Empty` and `NonEmpty` by querying for linked entries.
    pub async fn check(&mut self, ldap: &LdapClient) -> DirectoryResult<OrgDeleteState> {
        let filter = format!(
            "({}={})",
            ORGANIZATION_LINK,
            dn::filter_escape(&self.dn)
        );
        let linked = ldap
            .search(
                SearchOpts::sub(filter).with_attributes(vec![ORGANIZATION_LINK.to_string()]),
                None,
                &RequestContext::system(),
            )
            .await?;
        self.state = if linked.is_empty() {
            OrgDeleteState::Empty
        } else {
            OrgDeleteState::NonEmpty
        };
        Ok(self.state)
    }

    /// Surface `ORG_NOT_EMPTY` without mutating the directory.
    pub fn reject(&mut self) -> DirectoryError {
        self.state = OrgDeleteState::Rejected;
        DirectoryError::OrgNotEmpty {
            dn: self.dn.clone(),
        }
    }

    /// Run the machine to completion: check, then delete or reject.
    pub async fn execute(
        &mut self,
        ldap: &LdapClient,
        ctx: &RequestContext,
    ) -> DirectoryResult<()> {
        match self.check(ldap).await? {
            OrgDeleteState::NonEmpty => Err(self.reject()),
            _ => {
                ldap.delete(vec![self.dn.clone()], ctx).await?;
                self.state = OrgDeleteState::Deleted;
                Ok(())
            }
        }
    }
}

/// Move an organization below another organization, changing its dn.
/// Returns the new dn. Downstream link rewrites run through the move hook.
pub async fn move_organization(
    ldap: &LdapClient,
    id_or_dn: &str,
    target_org_dn: &str,
    _ctx: &RequestContext,
) -> DirectoryResult<String> {
    let dn = ldap.normalize_dn(id_or_dn);
    let target_dn = ldap.normalize_dn(target_org_dn);
    let system = RequestContext::system();
    let target = ldap
        .find(&target_dn, &system)
        .await?
        .ok_or_else(|| DirectoryError::PointerDangling {
            attribute: ORGANIZATION_LINK.to_string(),
            target: target_dn.clone(),
        })?;
    if !target.dn.eq_ignore_ascii_case(ldap.base()) && !is_organization(&target) {
        return Err(DirectoryError::PointerOutOfBranch {
            attribute: ORGANIZATION_LINK.to_string(),
            target: target.dn,
        });
    }
    if dn::is_under(&target.dn, &dn) {
        return Err(DirectoryError::Constraint {
            message: format!("cannot move '{}' below itself", dn),
        });
    }
    let new_dn = format!("{},{}", dn::rdn(&dn), target.dn);
    ldap.move_entry(&dn, &new_dn).await?;
    Ok(new_dn)
}

/// The plugin enforcing the organization invariants around every verb.
pub struct OrgConsistency;

impl OrgConsistency {
    pub fn new() -> Self {
        Self
    }
}

#[rocket::async_trait]
impl Plugin for OrgConsistency {
    fn name(&self) -> &'static str {
        "org-consistency"
    }

    fn roles(&self) -> Vec<&'static str> {
        vec!["consistency"]
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["authz-per-branch"]
    }

    async fn init(self: Arc<Self>, core: &PluginCore) -> DirectoryResult<()> {
        let registry = core.hooks.clone();

        let ldap = core.ldap.clone();
        registry.register_chained(
            hooks::LDAP_ADD_REQUEST,
            chained(move |event| {
                let ldap = ldap.clone();
                async move { verify_add(&ldap, event).await }
            }),
        );

        let ldap = core.ldap.clone();
        registry.register_chained(
            hooks::LDAP_MODIFY_REQUEST,
            chained(move |event| {
                let ldap = ldap.clone();
                async move { verify_modify(&ldap, event).await }
            }),
        );

        let ldap = core.ldap.clone();
        registry.register_chained(
            hooks::LDAP_DELETE_REQUEST,
            chained(move |event| {
                let ldap = ldap.clone();
                async move { verify_delete(&ldap, event).await }
            }),
        );

        for hook in [hooks::LDAP_RENAME_DONE, hooks::LDAP_MOVE_DONE] {
            let ldap = core.ldap.clone();
            core.hooks.register_fanout(
                hook,
                fanout(move |event| {
                    let ldap = ldap.clone();
                    async move {
                        if let HookEvent::RenameDone { dn, new_dn }
                        | HookEvent::MoveDone { dn, new_dn } = event
                        {
                            cascade(&ldap, &dn, &new_dn).await?;
                        }
                        Ok(())
                    }
                }),
            );
        }
        Ok(())
    }
}

/// Resolve the organization link of a new entry and align its path.
async fn verify_add(ldap: &LdapClient, event: HookEvent) -> DirectoryResult<HookEvent> {
    let (dn, mut entry, ctx) = match event {
        HookEvent::AddRequest { dn, entry, ctx } => (dn, entry, ctx),
        other => return Ok(other),
    };
    if let Some(link) = entry.first(ORGANIZATION_LINK).map(str::to_string) {
        let target = resolve_organization(ldap, &link).await?;
        let path = path_of(&target, ldap.base());
        if entry.first(ORGANIZATION_PATH) != Some(path.as_str()) {
            debug!("aligning {} of '{}' to '{}'", ORGANIZATION_PATH, dn, path);
        }
        entry.set(ORGANIZATION_LINK, vec![target.dn]);
        entry.set(ORGANIZATION_PATH, vec![path]);
    }
    Ok(HookEvent::AddRequest { dn, entry, ctx })
}

/// Guard link and path against removal and align the path on link changes.
async fn verify_modify(ldap: &LdapClient, event: HookEvent) -> DirectoryResult<HookEvent> {
    let (dn, mut changes, operation, ctx) = match event {
        HookEvent::ModifyRequest {
            dn,
            changes,
            operation,
            ctx,
        } => (dn, changes, operation, ctx),
        other => return Ok(other),
    };
    let deletes_link = changes.delete.0.contains_key(ORGANIZATION_LINK);
    let deletes_path = changes.delete.0.contains_key(ORGANIZATION_PATH);
    if deletes_link || deletes_path {
        let entry = ldap.find(&dn, &RequestContext::system()).await?;
        let organization = entry.map(|entry| is_organization(&entry)).unwrap_or(false);
        if !organization {
            return Err(if deletes_link {
                DirectoryError::OrgLinkImmutable { dn }
            } else {
                DirectoryError::OrgPathImmutable { dn }
            });
        }
    }
    let new_link = changes
        .add
        .get(ORGANIZATION_LINK)
        .or_else(|| changes.replace.get(ORGANIZATION_LINK))
        .and_then(|values| values.0.first())
        .map(|link| link.to_string());
    if let Some(link) = new_link {
        let target = resolve_organization(ldap, &link).await?;
        let path = path_of(&target, ldap.base());
        changes
            .replace
            .insert(ORGANIZATION_PATH.to_string(), Values(vec![path]));
    }
    Ok(HookEvent::ModifyRequest {
        dn,
        changes,
        operation,
        ctx,
    })
}

/// Reject deletion of organizations which still have linked entries.
async fn verify_delete(ldap: &LdapClient, event: HookEvent) -> DirectoryResult<HookEvent> {
    let (dns, ctx) = match event {
        HookEvent::DeleteRequest { dns, ctx } => (dns, ctx),
        other => return Ok(other),
    };
    let system = RequestContext::system();
    for dn in &dns {
        let Some(entry) = ldap.find(dn, &system).await? else {
            continue;
        };
        if !is_organization(&entry) {
            continue;
        }
        let mut deletion = OrgDeletion::new(dn.clone());
        if deletion.check(ldap).await? == OrgDeleteState::NonEmpty {
            return Err(deletion.reject());
        }
    }
    Ok(HookEvent::DeleteRequest { dns, ctx })
}

async fn resolve_organization(ldap: &LdapClient, link: &str) -> DirectoryResult<Entry> {
    let target = ldap
        .find(link, &RequestContext::system())
        .await?
        .ok_or_else(|| DirectoryError::PointerDangling {
            attribute: ORGANIZATION_LINK.to_string(),
            target: link.to_string(),
        })?;
    if !is_organization(&target) {
        return Err(DirectoryError::PointerOutOfBranch {
            attribute: ORGANIZATION_LINK.to_string(),
            target: target.dn,
        });
    }
    Ok(target)
}

/// Rewrite paths and links after an organization changed its dn.
///
/// Organizations higher in the renamed subtree are processed before their
/// descendants. The rewrite is a function of current state, replaying it is
/// safe.
async fn cascade(ldap: &LdapClient, old_dn: &str, new_dn: &str) -> DirectoryResult<()> {
    let system = RequestContext::system();
    let Some(moved) = ldap.find(new_dn, &system).await? else {
        return Ok(());
    };
    if !is_organization(&moved) {
        return Ok(());
    }
    info!("rewriting organization links from '{}' to '{}'", old_dn, new_dn);
    let base = ldap.base().to_string();

    // the moved subtree first: cached paths of the organizations themselves
    let mut organizations = vec![moved];
    organizations.extend(
        ldap.search(SearchOpts::sub(ORGANIZATION_FILTER), Some(new_dn), &system)
            .await?
            .into_iter()
            .filter(|entry| !entry.dn.eq_ignore_ascii_case(new_dn)),
    );
    organizations.sort_by_key(|entry| dn::depth(&entry.dn));
    for organization in organizations {
        let path = dn::path_below(&organization.dn, &base);
        if organization.first(PATH) != Some(path.as_str()) && organization.has(PATH) {
            ldap.modify(
                &organization.dn,
                ChangeSet::replacing(PATH, vec![path]),
                &system,
            )
            .await?;
        }
    }

    // then every entry linking to the old dn or one of its descendants
    let escaped = dn::filter_escape(old_dn);
    let filter = format!(
        "(|({}={})({}=*,{}))",
        ORGANIZATION_LINK, escaped, ORGANIZATION_LINK, escaped
    );
    let mut linked = ldap.search(SearchOpts::sub(filter), Some(&base), &system).await?;
    linked.sort_by_key(|entry| entry.first(ORGANIZATION_LINK).map(dn::depth).unwrap_or(0));
    for entry in linked {
        let Some(link) = entry.first(ORGANIZATION_LINK) else {
            continue;
        };
        let Some(new_link) = dn::replace_suffix(link, old_dn, new_dn) else {
            continue;
        };
        let new_path = dn::path_below(&new_link, &base);
        let mut changes = ChangeSet::replacing(ORGANIZATION_LINK, vec![new_link]);
        changes
            .replace
            .insert(ORGANIZATION_PATH.to_string(), Values(vec![new_path]));
        ldap.modify(&entry.dn, changes, &system).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn organization(dn: &str) -> Entry {
        let mut entry = Entry::new(dn);
        entry.set(
            "objectClass",
            vec!["top".to_string(), "organizationalUnit".to_string()],
        );
        entry
    }

    #[test]
    fn organizations_are_detected_by_object_class() {
        assert!(is_organization(&organization("ou=a,dc=ex")));
        let mut person = Entry::new("uid=u,dc=ex");
        person.set("objectClass", vec!["inetOrgPerson".to_string()]);
        assert!(!is_organization(&person));
    }

    #[test]
    fn path_prefers_the_cached_attribute() {
        let mut entry = organization("ou=B,ou=A,dc=ex");
        assert_eq!(path_of(&entry, "dc=ex"), "/A/B");
        entry.set(PATH, vec!["/Alpha/Beta".to_string()]);
        assert_eq!(path_of(&entry, "dc=ex"), "/Alpha/Beta");
    }

    #[test]
    fn the_delete_machine_starts_checked() {
        let deletion = OrgDeletion::new("ou=a,dc=ex");
        assert_eq!(deletion.state(), OrgDeleteState::Checked);
    }

    #[test]
    fn rejection_transitions_to_rejected() {
        let mut deletion = OrgDeletion::new("ou=a,dc=ex");
        let error = deletion.reject();
        assert_eq!(deletion.state(), OrgDeleteState::Rejected);
        assert!(matches!(error, DirectoryError::OrgNotEmpty { dn } if dn == "ou=a,dc=ex"));
    }
}

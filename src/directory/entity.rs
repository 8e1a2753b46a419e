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

//! Generic crud over one branch of the directory, driven by a single schema.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::errors::{DirectoryError, DirectoryResult};
use crate::hooks::HookEvent;
use crate::ldap::model::{ChangeSet, Entry, RequestContext, SearchOpts};
use crate::ldap::{dn, LdapClient};
use crate::org;
use crate::schema::model::{Schema, ROLE_ORGANIZATION_LINK, ROLE_ORGANIZATION_PATH};
use crate::schema::validate;
use crate::schema::SchemaStore;

/// The outcome of moving a flat entity into another organization.
pub struct MoveOutcome {
    pub department_path: String,
    pub department_link: String,
}

/// Crud operations over one entity kind.
///
/// Every operation announces itself on a per-entity chained hook named after
/// the schema's hook prefix, e.g. `userAddRequest`, before it reaches the
/// generic directory verbs with their `ldap*` hooks.
pub struct FlatEntity {
    schema: Arc<Schema>,
    ldap: Arc<LdapClient>,
}

impl FlatEntity {
    pub fn new(schema: Arc<Schema>, ldap: Arc<LdapClient>) -> Self {
        Self { schema, ldap }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn base(&self) -> &str {
        &self.schema.entity.base
    }

    fn main_attribute(&self) -> &str {
        &self.schema.entity.main_attribute
    }

    fn hook(&self, suffix: &str) -> String {
        format!("{}{}", self.schema.hook_prefix(), suffix)
    }

    /// Expand an identifier into the dn of this branch. Full dns pass through.
    pub fn dn_for(&self, id_or_dn: &str) -> String {
        dn::normalize(id_or_dn, self.main_attribute(), self.base())
    }

    fn class_filter(&self) -> String {
        let classes: Vec<&String> = self
            .schema
            .entity
            .object_class
            .iter()
            .filter(|class| !class.eq_ignore_ascii_case("top"))
            .collect();
        match classes.as_slice() {
            [] => "(objectClass=*)".to_string(),
            [class] => format!("(objectClass={})", class),
            many => format!(
                "(&{})",
                many.iter()
                    .map(|class| format!("(objectClass={})", class))
                    .collect::<String>()
            ),
        }
    }

    fn list_filter(&self, matches: Option<(&str, &str)>) -> DirectoryResult<String> {
        match matches {
            Some((attribute, value)) => {
                check_attribute_name(attribute)?;
                Ok(format!(
                    "(&{}({}=*{}*))",
                    self.class_filter(),
                    attribute,
                    dn::filter_escape(value)
                ))
            }
            None => Ok(format!(
                "(&{}({}=*))",
                self.class_filter(),
                self.main_attribute()
            )),
        }
    }

    /// List all entries of this kind, keyed by their identifier.
    ///
    /// An optional `(attribute, value)` pair narrows the result to entries
    /// whose attribute contains the value.
    pub async fn list(
        &self,
        matches: Option<(&str, &str)>,
        attributes: Option<Vec<String>>,
        ctx: &RequestContext,
    ) -> DirectoryResult<BTreeMap<String, Entry>> {
        let mut opts = SearchOpts::sub(self.list_filter(matches)?);
        if let Some(attributes) = attributes {
            opts = opts.with_attributes(attributes);
        }
        let entries = self.ldap.search(opts, Some(self.base()), ctx).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                entry
                    .first(self.main_attribute())
                    .map(|id| (id.to_string(), entry.clone()))
            })
            .collect())
    }

    /// Like [FlatEntity::list] but pulls the entries through a lazily paged
    /// search, for branches too large for a single result.
    pub async fn list_paged(
        &self,
        matches: Option<(&str, &str)>,
        attributes: Option<Vec<String>>,
        page_size: i32,
        ctx: &RequestContext,
    ) -> DirectoryResult<BTreeMap<String, Entry>> {
        let mut opts = SearchOpts::sub(self.list_filter(matches)?).with_page_size(page_size);
        if let Some(attributes) = attributes {
            opts = opts.with_attributes(attributes);
        }
        let mut paged = self.ldap.search_paged(opts, Some(self.base()), ctx).await?;
        let mut entries = BTreeMap::new();
        while let Some(entry) = paged.next_entry().await? {
            if let Some(id) = entry.first(self.main_attribute()) {
                entries.insert(id.to_string(), entry.clone());
            }
        }
        Ok(entries)
    }

    /// Fetch one entry by identifier or dn.
    pub async fn get(&self, id_or_dn: &str, ctx: &RequestContext) -> DirectoryResult<Entry> {
        let dn = self.dn_for(id_or_dn);
        self.ldap
            .find(&dn, ctx)
            .await?
            .ok_or(DirectoryError::NotFound { dn })
    }

    /// Validate a prospective entry without writing it: merge the schema
    /// defaults, then run the attribute and pointer checks.
    pub async fn validate(&self, mut entry: Entry) -> DirectoryResult<Entry> {
        for (attribute, values) in &self.schema.entity.default_attributes {
            if !entry.has(attribute) {
                entry.set(attribute.clone(), values.0.clone());
            }
        }
        if entry.object_classes().is_empty() {
            entry.set("objectClass", self.schema.entity.object_class.clone());
        }
        validate::validate_create(&self.schema, &mut entry)?;
        validate::validate_pointers(&self.schema, &validate::entry_pairs(&entry), &self.ldap)
            .await?;
        Ok(entry)
    }

    /// Create an entry after validating it against the schema.
    /// Returns the stored entry including its dn.
    pub async fn add(&self, entry: Entry, ctx: &RequestContext) -> DirectoryResult<Entry> {
        let mut entry = self.validate(entry).await?;
        let id = entry
            .first(self.main_attribute())
            .ok_or_else(|| DirectoryError::RequiredMissing {
                attribute: self.main_attribute().to_string(),
            })?
            .to_string();
        let dn = self.dn_for(&id);
        entry.dn = dn.clone();
        let (dn, entry, ctx) = self
            .ldap
            .hooks()
            .launch_hooks_chained(
                &self.hook("AddRequest"),
                HookEvent::AddRequest {
                    dn,
                    entry,
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_add_request()?;
        self.ldap.add(&dn, entry.clone(), &ctx).await?;
        Ok(entry)
    }

    /// Modify an entry after validating the change set against the schema.
    pub async fn modify(
        &self,
        id_or_dn: &str,
        changes: ChangeSet,
        ctx: &RequestContext,
    ) -> DirectoryResult<bool> {
        validate::validate_modify(&self.schema, &changes)?;
        validate::validate_pointers(&self.schema, &validate::change_pairs(&changes), &self.ldap)
            .await?;
        let dn = self.dn_for(id_or_dn);
        let (dn, changes, _operation, ctx) = self
            .ldap
            .hooks()
            .launch_hooks_chained(
                &self.hook("ModifyRequest"),
                HookEvent::ModifyRequest {
                    dn,
                    changes,
                    operation: 0,
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_modify_request()?;
        self.ldap.modify(&dn, changes, &ctx).await
    }

    /// Give an entry a new identifier, an rdn change within the same parent.
    /// Returns the new dn.
    pub async fn rename(
        &self,
        id_or_dn: &str,
        new_id: &str,
        ctx: &RequestContext,
    ) -> DirectoryResult<String> {
        let dn = self.dn_for(id_or_dn);
        let new_rdn = format!("{}={}", self.main_attribute(), ldap3::dn_escape(new_id));
        let (dn, new_rdn, ctx) = self
            .ldap
            .hooks()
            .launch_hooks_chained(
                &self.hook("RenameRequest"),
                HookEvent::RenameRequest {
                    dn,
                    new_rdn,
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_rename_request()?;
        self.ldap.rename(&dn, &new_rdn, &ctx).await
    }

    /// Link an entry to another organization.
    ///
    /// Rewrites the organization link and path attributes, the dn of the
    /// entry stays untouched. Moving an organization itself changes its dn
    /// instead, see [crate::org::move_organization].
    pub async fn move_to_org(
        &self,
        id_or_dn: &str,
        target_org_dn: &str,
        ctx: &RequestContext,
    ) -> DirectoryResult<MoveOutcome> {
        let link_attribute = self
            .schema
            .attribute_with_role(ROLE_ORGANIZATION_LINK)
            .unwrap_or(org::ORGANIZATION_LINK);
        let path_attribute = self
            .schema
            .attribute_with_role(ROLE_ORGANIZATION_PATH)
            .unwrap_or(org::ORGANIZATION_PATH);
        let target_dn = self.ldap.normalize_dn(target_org_dn);
        let target = self
            .ldap
            .find(&target_dn, &RequestContext::system())
            .await?
            .ok_or_else(|| DirectoryError::PointerDangling {
                attribute: link_attribute.to_string(),
                target: target_dn.clone(),
            })?;
        if !org::is_organization(&target) {
            return Err(DirectoryError::PointerOutOfBranch {
                attribute: link_attribute.to_string(),
                target: target.dn,
            });
        }
        let path = org::path_of(&target, self.ldap.base());
        let mut changes = ChangeSet::replacing(link_attribute, vec![target.dn.clone()]);
        changes.replace.insert(
            path_attribute.to_string(),
            crate::ldap::model::Values(vec![path.clone()]),
        );
        self.modify(id_or_dn, changes, ctx).await?;
        Ok(MoveOutcome {
            department_path: path,
            department_link: target.dn,
        })
    }

    /// Delete an entry. Watched branches soft-delete through the trash hook.
    pub async fn delete(&self, id_or_dn: &str, ctx: &RequestContext) -> DirectoryResult<()> {
        let dn = self.dn_for(id_or_dn);
        let (dns, ctx) = self
            .ldap
            .hooks()
            .launch_hooks_chained(
                &self.hook("DeleteRequest"),
                HookEvent::DeleteRequest {
                    dns: vec![dn],
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_delete_request()?;
        self.ldap.delete(dns, &ctx).await
    }

    /// Free-form search below the entity base.
    pub async fn search(
        &self,
        filter: &str,
        attributes: Option<Vec<String>>,
        ctx: &RequestContext,
    ) -> DirectoryResult<Vec<Entry>> {
        let mut opts = SearchOpts::sub(filter);
        if let Some(attributes) = attributes {
            opts = opts.with_attributes(attributes);
        }
        self.ldap.search(opts, Some(self.base()), ctx).await
    }
}

fn check_attribute_name(attribute: &str) -> DirectoryResult<()> {
    let acceptable = !attribute.is_empty()
        && attribute
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '-');
    if acceptable {
        Ok(())
    } else {
        Err(DirectoryError::TestFailed {
            attribute: "attribute".to_string(),
            value: attribute.to_string(),
        })
    }
}

/// All flat entities of the server, keyed by their plural name.
#[derive(Default)]
pub struct FlatEntitySet {
    by_plural: HashMap<String, Arc<FlatEntity>>,
}

impl FlatEntitySet {
    pub fn new(schemas: &SchemaStore, ldap: Arc<LdapClient>) -> Self {
        let mut by_plural = HashMap::new();
        for schema in schemas.iter() {
            by_plural.insert(
                schema.entity.plural_name.clone(),
                Arc::new(FlatEntity::new(schema.clone(), ldap.clone())),
            );
        }
        Self { by_plural }
    }

    pub fn get(&self, plural_name: &str) -> Option<Arc<FlatEntity>> {
        self.by_plural.get(plural_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hooks::HookRegistry;

    fn entity() -> FlatEntity {
        let schema: Schema = serde_json::from_value(serde_json::json!({
            "entity": {
                "name": "title",
                "mainAttribute": "cn",
                "objectClass": ["top", "organizationalRole"],
                "singularName": "title",
                "pluralName": "titles",
                "base": "ou=titles,dc=ex",
            },
        }))
        .expect("schema");
        let mut config = Config::default();
        config.ldap.base = "dc=ex".to_string();
        let ldap = Arc::new(LdapClient::new(&config, Arc::new(HookRegistry::default())));
        FlatEntity::new(Arc::new(schema), ldap)
    }

    #[test]
    fn identifiers_expand_below_the_entity_base() {
        let entity = entity();
        assert_eq!(entity.dn_for("Dr"), "cn=Dr,ou=titles,dc=ex");
        assert_eq!(entity.dn_for("cn=Dr,ou=titles,dc=ex"), "cn=Dr,ou=titles,dc=ex");
    }

    #[test]
    fn the_class_filter_skips_top() {
        let entity = entity();
        assert_eq!(entity.class_filter(), "(objectClass=organizationalRole)");
    }

    #[test]
    fn match_attributes_are_sanitized() {
        assert!(check_attribute_name("mailPrimaryAddress").is_ok());
        assert!(check_attribute_name("cn)(uid=*").is_err());
        assert!(check_attribute_name("").is_err());
    }
}

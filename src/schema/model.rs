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

use std::collections::BTreeMap;

use rocket::serde::{Deserialize, Serialize};

use crate::ldap::model::Values;

/// The semantic role of the attribute binding an entry to its organization.
pub const ROLE_ORGANIZATION_LINK: &str = "organizationLink";
/// The semantic role of the attribute caching the human readable hierarchy.
pub const ROLE_ORGANIZATION_PATH: &str = "organizationPath";

/// A schema document describing one flat entity kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    pub entity: EntitySection,
    /// When true, attributes outside of the schema are rejected.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySection {
    pub name: String,
    /// The attribute which forms the rdn and identifies entries of this kind.
    pub main_attribute: String,
    pub object_class: Vec<String>,
    pub singular_name: String,
    pub plural_name: String,
    /// The branch all entries of this kind live in, `{key}` placeholders are
    /// substituted from the configuration.
    pub base: String,
    /// Attributes merged into every create request unless supplied.
    #[serde(default)]
    pub default_attributes: BTreeMap<String, Values>,
    /// The prefix of the per-entity hook names, the entity name when absent.
    #[serde(default)]
    pub hook_prefix: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Number,
    Integer,
    Array,
    Pointer,
}

impl Default for AttributeType {
    fn default() -> Self {
        AttributeType::String
    }
}

/// The description of a single attribute.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttributeSpec {
    #[serde(rename = "type", default)]
    pub kind: AttributeType,
    #[serde(default)]
    pub required: bool,
    /// A fixed attribute is set exactly once at creation and immutable afterwards.
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub default: Option<Values>,
    /// A semantic tag such as `identifier` or `organizationLink`.
    #[serde(default)]
    pub role: Option<String>,
    /// A regex every scalar value must match.
    #[serde(default)]
    pub test: Option<String>,
    /// For pointers: the branches the referenced dn must lie under.
    #[serde(default)]
    pub branch: Vec<String>,
    /// The element description when the type is `array`.
    #[serde(default)]
    pub items: Option<Box<AttributeSpec>>,
    /// A grouping tag for form generators, carries no semantics.
    #[serde(default)]
    pub group: Option<String>,
}

impl Schema {
    /// The prefix of the per-entity hook names.
    pub fn hook_prefix(&self) -> &str {
        self.entity
            .hook_prefix
            .as_deref()
            .unwrap_or(&self.entity.name)
    }

    /// Look up the attribute carrying the given role.
    pub fn attribute_with_role(&self, role: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(_, spec)| spec.role.as_deref() == Some(role))
            .map(|(name, _)| name.as_str())
    }

    /// Whether entries of this kind are organizations.
    pub fn is_organization_kind(&self) -> bool {
        self.entity.object_class.iter().any(|class| {
            class.eq_ignore_ascii_case("organizationalUnit")
                || class.eq_ignore_ascii_case("organization")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_documents_deserialize_from_camel_case_json() {
        let schema: Schema = serde_json::from_value(serde_json::json!({
            "entity": {
                "name": "user",
                "mainAttribute": "uid",
                "objectClass": ["top", "inetOrgPerson"],
                "singularName": "user",
                "pluralName": "users",
                "base": "ou=members,{ldap_base}",
                "defaultAttributes": {"sn": "unknown"},
            },
            "strict": true,
            "attributes": {
                "uid": {"type": "string", "required": true, "role": "identifier"},
                "mailboxType": {"type": "pointer", "branch": ["ou=mbt,{ldap_base}"]},
                "objectClass": {"type": "array", "fixed": true,
                                "default": ["top", "inetOrgPerson"]},
            },
        }))
        .expect("schema");
        assert_eq!(schema.entity.main_attribute, "uid");
        assert_eq!(schema.entity.plural_name, "users");
        assert!(schema.strict);
        assert_eq!(
            schema.attributes.get("mailboxType").expect("pointer").kind,
            AttributeType::Pointer
        );
        assert!(schema.attributes.get("objectClass").expect("fixed").fixed);
        assert_eq!(schema.hook_prefix(), "user");
    }

    #[test]
    fn roles_resolve_to_attribute_names() {
        let schema: Schema = serde_json::from_value(serde_json::json!({
            "entity": {
                "name": "user",
                "mainAttribute": "uid",
                "objectClass": ["top"],
                "singularName": "user",
                "pluralName": "users",
                "base": "ou=members,dc=ex",
            },
            "attributes": {
                "departmentNumber": {"type": "pointer", "role": "organizationLink"},
            },
        }))
        .expect("schema");
        assert_eq!(
            schema.attribute_with_role(ROLE_ORGANIZATION_LINK),
            Some("departmentNumber")
        );
        assert_eq!(schema.attribute_with_role(ROLE_ORGANIZATION_PATH), None);
    }

    #[test]
    fn organization_kinds_are_detected_by_object_class() {
        let schema: Schema = serde_json::from_value(serde_json::json!({
            "entity": {
                "name": "organization",
                "mainAttribute": "ou",
                "objectClass": ["top", "organizationalUnit"],
                "singularName": "organization",
                "pluralName": "organizations",
                "base": "dc=ex",
            },
        }))
        .expect("schema");
        assert!(schema.is_organization_kind());
    }
}

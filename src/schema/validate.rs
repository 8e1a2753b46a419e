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

use std::collections::HashSet;

use regex::Regex;

use crate::errors::{DirectoryError, DirectoryResult};
use crate::ldap::dn;
use crate::ldap::model::{ChangeSet, Entry, RequestContext};
use crate::ldap::LdapClient;
use crate::schema::model::{AttributeSpec, AttributeType, Schema};

/// Validate an entry about to be created.
///
/// Missing attributes with a schema default are filled in, among them the
/// fixed ones. A supplied fixed attribute must equal its default, set
/// equality for arrays.
pub fn validate_create(schema: &Schema, entry: &mut Entry) -> DirectoryResult<()> {
    for (attribute, spec) in &schema.attributes {
        if !entry.has(attribute) {
            if let Some(default) = &spec.default {
                entry.set(attribute.clone(), default.0.clone());
            }
            continue;
        }
        if spec.fixed {
            if let Some(default) = &spec.default {
                if !set_equal(entry.values(attribute), default.as_slice()) {
                    return Err(DirectoryError::FixedMismatch {
                        attribute: attribute.clone(),
                    });
                }
            }
        }
    }
    for (attribute, spec) in &schema.attributes {
        if spec.required && !entry.has(attribute) {
            return Err(DirectoryError::RequiredMissing {
                attribute: attribute.clone(),
            });
        }
    }
    if schema.strict {
        for attribute in entry.attributes.keys() {
            reject_unknown(schema, attribute)?;
        }
    }
    for (attribute, values) in &entry.attributes {
        if let Some(spec) = schema.attributes.get(attribute) {
            check_values(attribute, spec, values)?;
        }
    }
    Ok(())
}

/// Validate a modification.
///
/// Any bucket containing a fixed attribute is rejected, values of the add and
/// replace buckets are checked against the attribute specs.
pub fn validate_modify(schema: &Schema, changes: &ChangeSet) -> DirectoryResult<()> {
    for attribute in changes.attributes() {
        if let Some(spec) = schema.attributes.get(attribute) {
            if spec.fixed {
                return Err(DirectoryError::FixedImmutable {
                    attribute: attribute.clone(),
                });
            }
        } else if schema.strict {
            reject_unknown(schema, attribute)?;
        }
    }
    for bucket in [&changes.add, &changes.replace] {
        for (attribute, values) in bucket {
            if let Some(spec) = schema.attributes.get(attribute) {
                check_values(attribute, spec, values.as_slice())?;
            }
        }
    }
    Ok(())
}

/// Resolve every pointer value among the pairs and check its branch constraint.
///
/// A missing target is `POINTER_DANGLING`, a target whose resolved dn lies
/// outside of every declared branch is `POINTER_OUT_OF_BRANCH`. Lookups use
/// the internal context, they are not subject to authorization.
pub async fn validate_pointers(
    schema: &Schema,
    pairs: &[(String, Vec<String>)],
    ldap: &LdapClient,
) -> DirectoryResult<()> {
    let system = RequestContext::system();
    for (attribute, values) in pairs {
        let Some(spec) = schema.attributes.get(attribute) else {
            continue;
        };
        let branches = match pointer_branches(spec) {
            Some(branches) => branches,
            None => continue,
        };
        for value in values {
            let target = ldap.find(value, &system).await?.ok_or_else(|| {
                DirectoryError::PointerDangling {
                    attribute: attribute.clone(),
                    target: value.clone(),
                }
            })?;
            if !branches.is_empty()
                && !branches.iter().any(|branch| dn::is_under(&target.dn, branch))
            {
                return Err(DirectoryError::PointerOutOfBranch {
                    attribute: attribute.clone(),
                    target: target.dn,
                });
            }
        }
    }
    Ok(())
}

/// The attribute pairs of an entry, the shape [validate_pointers] expects.
pub fn entry_pairs(entry: &Entry) -> Vec<(String, Vec<String>)> {
    entry
        .attributes
        .iter()
        .map(|(attribute, values)| (attribute.clone(), values.clone()))
        .collect()
}

/// The add and replace pairs of a change set, the shape [validate_pointers] expects.
pub fn change_pairs(changes: &ChangeSet) -> Vec<(String, Vec<String>)> {
    changes
        .add
        .iter()
        .chain(changes.replace.iter())
        .map(|(attribute, values)| (attribute.clone(), values.0.clone()))
        .collect()
}

fn pointer_branches(spec: &AttributeSpec) -> Option<&[String]> {
    if spec.kind == AttributeType::Pointer {
        return Some(&spec.branch);
    }
    if spec.kind == AttributeType::Array {
        if let Some(items) = &spec.items {
            if items.kind == AttributeType::Pointer {
                return Some(&items.branch);
            }
        }
    }
    None
}

fn reject_unknown(schema: &Schema, attribute: &str) -> DirectoryResult<()> {
    let known = schema.attributes.contains_key(attribute)
        || attribute == schema.entity.main_attribute
        || attribute.eq_ignore_ascii_case("objectClass");
    if known {
        Ok(())
    } else {
        Err(DirectoryError::UnknownAttribute {
            attribute: attribute.to_string(),
        })
    }
}

fn check_values(attribute: &str, spec: &AttributeSpec, values: &[String]) -> DirectoryResult<()> {
    match spec.kind {
        AttributeType::Array => {
            if let Some(items) = &spec.items {
                check_scalars(attribute, items, values)?;
            }
            Ok(())
        }
        _ => check_scalars(attribute, spec, values),
    }
}

fn check_scalars(attribute: &str, spec: &AttributeSpec, values: &[String]) -> DirectoryResult<()> {
    for value in values {
        let acceptable = match spec.kind {
            AttributeType::Number => value.parse::<f64>().is_ok(),
            AttributeType::Integer => value.parse::<i64>().is_ok(),
            _ => true,
        };
        if !acceptable {
            return Err(DirectoryError::TestFailed {
                attribute: attribute.to_string(),
                value: value.clone(),
            });
        }
        if let Some(pattern) = &spec.test {
            // patterns were validated at load time
            let regex = Regex::new(pattern).map_err(|error| {
                DirectoryError::Internal(format!("invalid test pattern: {}", error))
            })?;
            if !regex.is_match(value) {
                return Err(DirectoryError::TestFailed {
                    attribute: attribute.to_string(),
                    value: value.clone(),
                });
            }
        }
    }
    Ok(())
}

fn set_equal(left: &[String], right: &[String]) -> bool {
    let left: HashSet<&str> = left.iter().map(|value| value.as_str()).collect();
    let right: HashSet<&str> = right.iter().map(|value| value.as_str()).collect();
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        serde_json::from_value(serde_json::json!({
            "entity": {
                "name": "user",
                "mainAttribute": "uid",
                "objectClass": ["top", "inetOrgPerson"],
                "singularName": "user",
                "pluralName": "users",
                "base": "ou=members,dc=ex",
            },
            "strict": true,
            "attributes": {
                "uid": {"type": "string", "required": true, "test": "^[a-z][a-z0-9-]*$"},
                "sn": {"type": "string"},
                "uidNumber": {"type": "integer"},
                "mail": {"type": "array", "items": {"type": "string", "test": "@"}},
                "objectClass": {"type": "array", "fixed": true,
                                "default": ["top", "inetOrgPerson"]},
            },
        }))
        .expect("schema")
    }

    fn entry(json: serde_json::Value) -> Entry {
        serde_json::from_value(json).expect("entry")
    }

    #[test]
    fn create_fills_fixed_defaults() {
        let mut entry = entry(serde_json::json!({"uid": "karli"}));
        validate_create(&schema(), &mut entry).expect("valid entry");
        assert_eq!(entry.values("objectClass"), ["top", "inetOrgPerson"]);
    }

    #[test]
    fn create_accepts_the_default_in_any_order() {
        let mut entry = entry(serde_json::json!({
            "uid": "karli",
            "objectClass": ["inetOrgPerson", "top"],
        }));
        validate_create(&schema(), &mut entry).expect("valid entry");
    }

    #[test]
    fn create_rejects_a_diverging_fixed_value() {
        let mut entry = entry(serde_json::json!({
            "uid": "karli",
            "objectClass": ["top", "posixAccount"],
        }));
        let result = validate_create(&schema(), &mut entry);
        assert!(matches!(result, Err(DirectoryError::FixedMismatch { .. })));
    }

    #[test]
    fn create_rejects_missing_required_attributes() {
        let mut entry = entry(serde_json::json!({"sn": "Steinscheisser"}));
        let result = validate_create(&schema(), &mut entry);
        assert!(matches!(
            result,
            Err(DirectoryError::RequiredMissing { attribute }) if attribute == "uid"
        ));
    }

    #[test]
    fn create_rejects_unknown_attributes_when_strict() {
        let mut entry = entry(serde_json::json!({"uid": "karli", "shoeSize": "46"}));
        let result = validate_create(&schema(), &mut entry);
        assert!(matches!(
            result,
            Err(DirectoryError::UnknownAttribute { attribute }) if attribute == "shoeSize"
        ));
    }

    #[test]
    fn create_applies_test_patterns() {
        let mut entry = entry(serde_json::json!({"uid": "Karli"}));
        let result = validate_create(&schema(), &mut entry);
        assert!(matches!(result, Err(DirectoryError::TestFailed { .. })));
    }

    #[test]
    fn create_checks_array_items() {
        let mut entry = entry(serde_json::json!({
            "uid": "karli",
            "mail": ["karli@mvl.at", "no-at-sign"],
        }));
        let result = validate_create(&schema(), &mut entry);
        assert!(matches!(
            result,
            Err(DirectoryError::TestFailed { value, .. }) if value == "no-at-sign"
        ));
    }

    #[test]
    fn create_checks_integer_values() {
        let mut entry = entry(serde_json::json!({"uid": "karli", "uidNumber": "abc"}));
        let result = validate_create(&schema(), &mut entry);
        assert!(matches!(result, Err(DirectoryError::TestFailed { .. })));
    }

    #[test]
    fn modify_rejects_fixed_attributes_in_every_bucket() {
        let schema = schema();
        for changes in [
            serde_json::json!({"add": {"objectClass": "posixAccount"}}),
            serde_json::json!({"replace": {"objectClass": ["top"]}}),
            serde_json::json!({"delete": ["objectClass"]}),
        ] {
            let changes: ChangeSet = serde_json::from_value(changes).expect("changes");
            let result = validate_modify(&schema, &changes);
            assert!(matches!(result, Err(DirectoryError::FixedImmutable { .. })));
        }
    }

    #[test]
    fn modify_checks_replacement_values() {
        let changes: ChangeSet =
            serde_json::from_value(serde_json::json!({"replace": {"uid": "Nope"}}))
                .expect("changes");
        let result = validate_modify(&schema(), &changes);
        assert!(matches!(result, Err(DirectoryError::TestFailed { .. })));
    }

    #[test]
    fn modify_accepts_valid_changes() {
        let changes: ChangeSet = serde_json::from_value(serde_json::json!({
            "replace": {"sn": "Steinscheisser"},
            "delete": ["mail"],
        }))
        .expect("changes");
        validate_modify(&schema(), &changes).expect("valid changes");
    }

    #[test]
    fn change_pairs_cover_add_and_replace() {
        let changes: ChangeSet = serde_json::from_value(serde_json::json!({
            "add": {"mail": "karli@mvl.at"},
            "replace": {"sn": "Steinscheisser"},
            "delete": ["uidNumber"],
        }))
        .expect("changes");
        let pairs = change_pairs(&changes);
        assert_eq!(pairs.len(), 2);
    }
}

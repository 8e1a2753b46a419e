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

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use ldap3::{Mod, Scope, SearchEntry};
use rocket_okapi::okapi::schemars::gen::SchemaGenerator;
use rocket_okapi::okapi::schemars::schema::{InstanceType, Schema, SchemaObject};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The attribute which is emitted as an array even when it holds a single value.
const ALWAYS_MULTI_VALUED: &str = "objectClass";

/// A directory entry: a dn together with its attribute values.
///
/// Single valued attributes are accepted and emitted as JSON scalars,
/// `objectClass` is always emitted as an array.
/// Numbers and booleans on the wire are coerced to their text representation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Construct an entry out of a search entry, merging binary values as lossy UTF-8 text.
    pub fn from_search_entry(entry: SearchEntry) -> Self {
        let mut attributes: BTreeMap<String, Vec<String>> = entry.attrs.into_iter().collect();
        for (attribute, values) in entry.bin_attrs {
            let textual = values
                .iter()
                .map(|value| String::from_utf8_lossy(value).to_string());
            attributes.entry(attribute).or_default().extend(textual);
        }
        Self {
            dn: entry.dn,
            attributes,
        }
    }

    /// All values of the attribute, empty when it is absent.
    pub fn values(&self, attribute: &str) -> &[String] {
        self.attributes
            .get(attribute)
            .map(|values| values.as_slice())
            .unwrap_or_default()
    }

    /// The first value of the attribute.
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute).first().map(|value| value.as_str())
    }

    pub fn has(&self, attribute: &str) -> bool {
        !self.values(attribute).is_empty()
    }

    pub fn set(&mut self, attribute: impl Into<String>, values: Vec<String>) {
        self.attributes.insert(attribute.into(), values);
    }

    pub fn object_classes(&self) -> &[String] {
        self.values(ALWAYS_MULTI_VALUED)
    }

    /// Convert the attributes into the representation the wire expects.
    pub fn to_add_attributes(&self) -> Vec<(String, HashSet<String>)> {
        self.attributes
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(attribute, values)| (attribute.clone(), values.iter().cloned().collect()))
            .collect()
    }
}

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.attributes.len() + 1))?;
        map.serialize_entry("dn", &self.dn)?;
        for (attribute, values) in &self.attributes {
            if values.len() == 1 && !attribute.eq_ignore_ascii_case(ALWAYS_MULTI_VALUED) {
                map.serialize_entry(attribute, &values[0])?;
            } else {
                map.serialize_entry(attribute, values)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Entry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = serde_json::Map::deserialize(deserializer)?;
        let mut entry = Entry::default();
        for (key, value) in map {
            if key == "dn" {
                match value {
                    Value::String(dn) => entry.dn = dn,
                    other => {
                        return Err(de::Error::custom(format!(
                            "dn must be a string, got {}",
                            other
                        )))
                    }
                }
                continue;
            }
            let values = coerce_values(&value).ok_or_else(|| {
                de::Error::custom(format!(
                    "attribute '{}' must be a scalar or an array of scalars",
                    key
                ))
            })?;
            entry.attributes.insert(key, values);
        }
        Ok(entry)
    }
}

impl JsonSchema for Entry {
    fn schema_name() -> String {
        "Entry".to_string()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        SchemaObject {
            instance_type: Some(InstanceType::Object.into()),
            ..Default::default()
        }
        .into()
    }
}

/// Coerce a JSON value into attribute values, `None` for nested structures.
fn coerce_values(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Null => Some(vec![]),
        Value::Array(items) => items.iter().map(coerce_scalar).collect(),
        scalar => coerce_scalar(scalar).map(|value| vec![value]),
    }
}

fn coerce_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        // the LDAP boolean syntax
        Value::Bool(true) => Some("TRUE".to_string()),
        Value::Bool(false) => Some("FALSE".to_string()),
        _ => None,
    }
}

/// A list of attribute values which deserializes from a scalar as well as from an array.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values(pub Vec<String>);

impl Values {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl Serialize for Values {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.len() == 1 {
            serializer.serialize_str(&self.0[0])
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Values {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        coerce_values(&value)
            .map(Values)
            .ok_or_else(|| de::Error::custom("expected a scalar or an array of scalars"))
    }
}

impl JsonSchema for Values {
    fn schema_name() -> String {
        "Values".to_string()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        Schema::Bool(true)
    }
}

/// The `delete` bucket of a modification.
///
/// Accepts either a map from attribute to the values to remove, where an empty
/// list removes the whole attribute, or a bare array of attribute names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeleteSet(pub BTreeMap<String, Values>);

impl DeleteSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for DeleteSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Array(names) => {
                let mut set = BTreeMap::new();
                for name in names {
                    match name {
                        Value::String(name) => {
                            set.insert(name, Values::default());
                        }
                        other => {
                            return Err(de::Error::custom(format!(
                                "expected an attribute name, got {}",
                                other
                            )))
                        }
                    }
                }
                Ok(DeleteSet(set))
            }
            Value::Object(map) => {
                let mut set = BTreeMap::new();
                for (attribute, values) in map {
                    let values = coerce_values(&values).ok_or_else(|| {
                        de::Error::custom(format!(
                            "attribute '{}' must map to a scalar or an array of scalars",
                            attribute
                        ))
                    })?;
                    set.insert(attribute, Values(values));
                }
                Ok(DeleteSet(set))
            }
            other => Err(de::Error::custom(format!(
                "expected a map or an array, got {}",
                other
            ))),
        }
    }
}

impl JsonSchema for DeleteSet {
    fn schema_name() -> String {
        "DeleteSet".to_string()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        Schema::Bool(true)
    }
}

/// The three buckets of a modify operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChangeSet {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, Values>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replace: BTreeMap<String, Values>,
    #[serde(default, skip_serializing_if = "DeleteSet::is_empty")]
    pub delete: DeleteSet,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.replace.is_empty() && self.delete.is_empty()
    }

    /// A replace-only change set, convenience for internal fixups.
    pub fn replacing(attribute: impl Into<String>, values: Vec<String>) -> Self {
        let mut changes = ChangeSet::default();
        changes.replace.insert(attribute.into(), Values(values));
        changes
    }

    /// All attribute names touched by any bucket.
    pub fn attributes(&self) -> impl Iterator<Item = &String> {
        self.add
            .keys()
            .chain(self.replace.keys())
            .chain(self.delete.0.keys())
    }

    /// Convert the buckets into wire modifications, delete buckets with no
    /// values remove the whole attribute.
    pub fn to_mods(&self) -> Vec<Mod<String>> {
        let mut mods = Vec::new();
        for (attribute, values) in &self.add {
            mods.push(Mod::Add(
                attribute.clone(),
                values.0.iter().cloned().collect(),
            ));
        }
        for (attribute, values) in &self.replace {
            mods.push(Mod::Replace(
                attribute.clone(),
                values.0.iter().cloned().collect(),
            ));
        }
        for (attribute, values) in &self.delete.0 {
            mods.push(Mod::Delete(
                attribute.clone(),
                values.0.iter().cloned().collect(),
            ));
        }
        mods
    }
}

/// The scope of a search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    One,
    Sub,
}

impl SearchScope {
    pub fn to_ldap(self) -> Scope {
        match self {
            SearchScope::Base => Scope::Base,
            SearchScope::One => Scope::OneLevel,
            SearchScope::Sub => Scope::Subtree,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SearchScope::Base => "base",
            SearchScope::One => "one",
            SearchScope::Sub => "sub",
        }
    }
}

/// The options of a search operation.
#[derive(Clone, Debug)]
pub struct SearchOpts {
    pub scope: SearchScope,
    pub filter: String,
    pub attributes: Option<Vec<String>>,
    /// The page size when the search should stream its result pages lazily.
    pub paged: Option<i32>,
}

impl SearchOpts {
    pub fn new(scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            scope,
            filter: filter.into(),
            attributes: None,
            paged: None,
        }
    }

    /// A base scope lookup of a single entry.
    pub fn base() -> Self {
        Self::new(SearchScope::Base, "(objectClass=*)")
    }

    pub fn sub(filter: impl Into<String>) -> Self {
        Self::new(SearchScope::Sub, filter)
    }

    pub fn one(filter: impl Into<String>) -> Self {
        Self::new(SearchScope::One, filter)
    }

    pub fn with_attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.paged = Some(page_size);
        self
    }
}

/// The context an operation runs in, carried through every hook.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// The uid of the authenticated user, `None` for anonymous requests.
    pub user: Option<String>,
    /// A correlation id for log statements.
    pub request_id: String,
    /// Whether the operation originates from the engine itself.
    /// Internal operations are exempt from authorization.
    pub internal: bool,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self {
            user: None,
            request_id: Uuid::new_v4().to_string(),
            internal: false,
        }
    }

    pub fn for_user(uid: impl Into<String>) -> Self {
        Self {
            user: Some(uid.into()),
            ..Self::anonymous()
        }
    }

    /// The context of engine initiated operations such as consistency fixups.
    pub fn system() -> Self {
        Self {
            internal: true,
            ..Self::anonymous()
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}@{}",
            self.user.as_deref().unwrap_or("<anonymous>"),
            self.request_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_deserializes_scalars_and_arrays() {
        let entry: Entry = serde_json::from_value(serde_json::json!({
            "dn": "uid=karli,ou=members,dc=mvl,dc=at",
            "uid": "karli",
            "mail": ["karli@mvl.at", "karl@mvl.at"],
            "uidNumber": 4711,
        }))
        .expect("entry");
        assert_eq!(entry.dn, "uid=karli,ou=members,dc=mvl,dc=at");
        assert_eq!(entry.first("uid"), Some("karli"));
        assert_eq!(entry.values("mail").len(), 2);
        assert_eq!(entry.first("uidNumber"), Some("4711"));
    }

    #[test]
    fn entry_rejects_nested_objects() {
        let result: Result<Entry, _> = serde_json::from_value(serde_json::json!({
            "uid": {"nested": true},
        }));
        assert!(result.is_err());
    }

    #[test]
    fn entry_serializes_single_values_as_scalars() {
        let mut entry = Entry::new("cn=Dr,ou=titles,dc=ex");
        entry.set("cn", vec!["Dr".to_string()]);
        entry.set(
            "objectClass",
            vec!["top".to_string(), "organizationalRole".to_string()],
        );
        let json = serde_json::to_value(&entry).expect("serialized entry");
        assert_eq!(json["cn"], "Dr");
        assert_eq!(json["objectClass"], serde_json::json!(["top", "organizationalRole"]));
    }

    #[test]
    fn object_class_stays_an_array_even_when_single() {
        let mut entry = Entry::new("cn=Dr,ou=titles,dc=ex");
        entry.set("objectClass", vec!["top".to_string()]);
        let json = serde_json::to_value(&entry).expect("serialized entry");
        assert_eq!(json["objectClass"], serde_json::json!(["top"]));
    }

    #[test]
    fn delete_set_accepts_names_and_maps() {
        let from_names: DeleteSet = serde_json::from_value(serde_json::json!(["mail", "cn"]))
            .expect("delete set from names");
        assert!(from_names.0.get("mail").expect("mail").0.is_empty());

        let from_map: DeleteSet = serde_json::from_value(serde_json::json!({
            "mail": "karli@mvl.at",
            "telephoneNumber": [],
        }))
        .expect("delete set from map");
        assert_eq!(from_map.0.get("mail").expect("mail").0.len(), 1);
        assert!(from_map.0.get("telephoneNumber").expect("phone").0.is_empty());
    }

    #[test]
    fn change_set_converts_to_wire_mods() {
        let changes: ChangeSet = serde_json::from_value(serde_json::json!({
            "add": {"mail": "karli@mvl.at"},
            "replace": {"cn": ["Karl"]},
            "delete": ["telephoneNumber"],
        }))
        .expect("change set");
        let mods = changes.to_mods();
        assert_eq!(mods.len(), 3);
        assert!(matches!(&mods[0], Mod::Add(attribute, values)
            if attribute == "mail" && values.len() == 1));
        assert!(matches!(&mods[1], Mod::Replace(attribute, _) if attribute == "cn"));
        assert!(matches!(&mods[2], Mod::Delete(attribute, values)
            if attribute == "telephoneNumber" && values.is_empty()));
    }

    #[test]
    fn empty_change_set_reports_empty() {
        let changes: ChangeSet = serde_json::from_value(serde_json::json!({})).expect("change set");
        assert!(changes.is_empty());
    }
}

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

/// Module which holds the schema document model.
pub mod model;
/// Module which validates entries and modifications against their schema.
pub mod validate;

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use regex::Regex;

use crate::config::{comma_list, Config};
use crate::errors::{DirectoryError, DirectoryResult};
use crate::schema::model::{AttributeSpec, Schema};

/// The immutable collection of all loaded entity schemas, keyed by plural name.
#[derive(Default)]
pub struct SchemaStore {
    by_plural: HashMap<String, Arc<Schema>>,
}

impl SchemaStore {
    /// Load all schema documents named by the configuration.
    ///
    /// Placeholders such as `{ldap_base}` are substituted, malformed
    /// documents and malformed `test` patterns are fatal.
    pub fn load(config: &Config) -> DirectoryResult<Self> {
        let vars = config.placeholder_values();
        let mut store = SchemaStore::default();
        for path in comma_list(&config.ldap.flat_schema) {
            let raw = fs::read_to_string(&path).map_err(|error| {
                DirectoryError::ConfigInvalid(format!("cannot read schema '{}': {}", path, error))
            })?;
            let schema: Schema = serde_json::from_str(&raw).map_err(|error| {
                DirectoryError::ConfigInvalid(format!("cannot parse schema '{}': {}", path, error))
            })?;
            store.insert(schema, &vars)?;
            info!("loaded schema document '{}'", path);
        }
        Ok(store)
    }

    /// Build a store out of already parsed documents, used by tests and plugins.
    pub fn from_documents(
        documents: Vec<Schema>,
        vars: &HashMap<String, String>,
    ) -> DirectoryResult<Self> {
        let mut store = SchemaStore::default();
        for schema in documents {
            store.insert(schema, vars)?;
        }
        Ok(store)
    }

    fn insert(&mut self, mut schema: Schema, vars: &HashMap<String, String>) -> DirectoryResult<()> {
        resolve_placeholders(&mut schema, vars);
        validate_tests(&schema)?;
        let plural = schema.entity.plural_name.clone();
        if self
            .by_plural
            .insert(plural.clone(), Arc::new(schema))
            .is_some()
        {
            return Err(DirectoryError::ConfigInvalid(format!(
                "duplicate schema for plural name '{}'",
                plural
            )));
        }
        Ok(())
    }

    pub fn get(&self, plural_name: &str) -> Option<Arc<Schema>> {
        self.by_plural.get(plural_name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Schema>> {
        self.by_plural.values()
    }

    /// The plural names of all loaded schemas, sorted.
    pub fn plural_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_plural.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Substitute `{key}` placeholders in the branch describing fields of the schema.
pub fn resolve_placeholders(schema: &mut Schema, vars: &HashMap<String, String>) {
    schema.entity.base = substitute(&schema.entity.base, vars);
    for spec in schema.attributes.values_mut() {
        resolve_spec(spec, vars);
    }
}

fn resolve_spec(spec: &mut AttributeSpec, vars: &HashMap<String, String>) {
    for branch in &mut spec.branch {
        *branch = substitute(branch, vars);
    }
    if let Some(items) = &mut spec.items {
        resolve_spec(items, vars);
    }
}

fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut output = input.to_string();
    for (key, value) in vars {
        output = output.replace(&format!("{{{}}}", key), value);
    }
    output
}

fn validate_tests(schema: &Schema) -> DirectoryResult<()> {
    for (attribute, spec) in &schema.attributes {
        for pattern in spec
            .test
            .iter()
            .chain(spec.items.iter().filter_map(|items| items.test.as_ref()))
        {
            Regex::new(pattern).map_err(|error| {
                DirectoryError::ConfigInvalid(format!(
                    "invalid test pattern for attribute '{}': {}",
                    attribute, error
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(base: &str) -> Schema {
        serde_json::from_value(serde_json::json!({
            "entity": {
                "name": "title",
                "mainAttribute": "cn",
                "objectClass": ["top", "organizationalRole"],
                "singularName": "title",
                "pluralName": "titles",
                "base": base,
            },
            "attributes": {
                "cn": {"type": "string", "required": true},
            },
        }))
        .expect("schema document")
    }

    fn vars() -> HashMap<String, String> {
        HashMap::from([("ldap_base".to_string(), "dc=mvl,dc=at".to_string())])
    }

    #[test]
    fn placeholders_are_substituted_in_the_base() {
        let store = SchemaStore::from_documents(vec![document("ou=titles,{ldap_base}")], &vars())
            .expect("store");
        let schema = store.get("titles").expect("titles schema");
        assert_eq!(schema.entity.base, "ou=titles,dc=mvl,dc=at");
    }

    #[test]
    fn placeholders_are_substituted_in_branches() {
        let mut schema = document("ou=titles,{ldap_base}");
        schema
            .attributes
            .insert(
                "mailboxType".to_string(),
                serde_json::from_value(serde_json::json!({
                    "type": "pointer",
                    "branch": ["ou=mbt,{ldap_base}"],
                }))
                .expect("pointer spec"),
            );
        let store = SchemaStore::from_documents(vec![schema], &vars()).expect("store");
        let schema = store.get("titles").expect("titles schema");
        assert_eq!(
            schema.attributes.get("mailboxType").expect("pointer").branch,
            vec!["ou=mbt,dc=mvl,dc=at"]
        );
    }

    #[test]
    fn malformed_test_patterns_are_fatal() {
        let mut schema = document("ou=titles,dc=ex");
        schema.attributes.get_mut("cn").expect("cn").test = Some("(unclosed".to_string());
        let result = SchemaStore::from_documents(vec![schema], &vars());
        assert!(matches!(result, Err(DirectoryError::ConfigInvalid(_))));
    }

    #[test]
    fn duplicate_plural_names_are_fatal() {
        let result = SchemaStore::from_documents(
            vec![document("ou=a,dc=ex"), document("ou=b,dc=ex")],
            &vars(),
        );
        assert!(matches!(result, Err(DirectoryError::ConfigInvalid(_))));
    }
}

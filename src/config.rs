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

use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Profile,
};
use rocket::serde::{Deserialize, Serialize};

/// The application configuration.
///
/// Every key can be overridden with an environment variable carrying the `DM_`
/// prefix, e.g. `DM_LDAP_URL` or `DM_TRASH_BASE`.
/// List valued keys such as `DM_LDAP_FLAT_SCHEMA` are comma separated strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The prefix under which the whole API is mounted.
    pub api_prefix: String,
    /// The url where the hosted OpenApi specification will be available.
    pub openapi_url: String,
    /// Static bearer tokens in the form `token=uid`, comma separated.
    /// An empty string disables authentication and treats every request as anonymous.
    pub auth_tokens: String,
    /// Urls which receive JSON events for every completed directory write, comma separated.
    pub webhook_urls: String,
    #[serde(flatten)]
    pub ldap: LdapConfig,
    #[serde(flatten)]
    pub trash: TrashConfig,
    #[serde(flatten)]
    pub authz: AuthzSettings,
}

/// Configuration of the LDAP access layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// The url of the directory server, `ldap://` or `ldaps://`.
    #[serde(rename = "ldap_url")]
    pub url: String,
    /// The dn to bind with, anonymous bind when absent.
    #[serde(rename = "ldap_bind_dn")]
    pub bind_dn: Option<String>,
    /// The password for the bind dn.
    #[serde(rename = "ldap_bind_password")]
    pub bind_password: Option<String>,
    /// The base dn of the directory.
    #[serde(rename = "ldap_base")]
    pub base: String,
    /// The maximum amount of pooled connections.
    #[serde(rename = "ldap_pool_size")]
    pub pool_size: usize,
    /// Seconds an idle pooled connection may live before it is unbound.
    #[serde(rename = "ldap_connection_ttl")]
    pub connection_ttl: u64,
    /// The maximum amount of concurrent operations on the wire.
    #[serde(rename = "ldap_query_concurrency")]
    pub query_concurrency: usize,
    /// The maximum amount of cached search results.
    #[serde(rename = "ldap_cache_max")]
    pub cache_max: usize,
    /// Seconds a cached search result stays valid.
    #[serde(rename = "ldap_cache_ttl")]
    pub cache_ttl: u64,
    /// The time limit in seconds for a single operation on the wire.
    #[serde(rename = "ldap_time_limit")]
    pub time_limit: u64,
    /// The connect timeout in seconds, `0` means unbounded.
    #[serde(rename = "ldap_connect_timeout")]
    pub connect_timeout: u64,
    /// The attribute used to expand bare identifiers into dns.
    #[serde(rename = "ldap_user_main_attribute")]
    pub user_main_attribute: String,
    /// Object classes filled in when an add request carries none, comma separated.
    #[serde(rename = "ldap_default_object_class")]
    pub default_object_class: String,
    /// Paths of the flat entity schema documents, comma separated.
    #[serde(rename = "ldap_flat_schema")]
    pub flat_schema: String,
}

/// Configuration of the soft-delete subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashConfig {
    /// The branch which receives soft-deleted entries.
    /// An empty string disables the trash entirely.
    #[serde(rename = "trash_base")]
    pub base: String,
    /// Branches whose deletes are intercepted, semicolon separated since dns
    /// contain commas.
    #[serde(rename = "trash_watched_bases")]
    pub watched_bases: String,
    /// Whether to stamp soft-deleted entries with a description of their origin.
    #[serde(rename = "trash_add_metadata")]
    pub add_metadata: bool,
    /// Whether to create the trash branch on startup when it does not exist.
    #[serde(rename = "trash_auto_create")]
    pub auto_create: bool,
}

/// Configuration of the per-branch authorization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthzSettings {
    /// Inline JSON or the path of a JSON file holding the permission matrix.
    /// An empty string disables authorization.
    #[serde(rename = "authz_per_branch_config")]
    pub per_branch_config: String,
    /// Seconds a cached group membership stays valid.
    #[serde(rename = "authz_cache_ttl")]
    pub cache_ttl: u64,
    /// The base dn to search groups in, the directory base when absent.
    #[serde(rename = "authz_group_base")]
    pub group_base: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_prefix: "/api/v1".to_string(),
            openapi_url: "http://localhost:8000/api/v1/".to_string(),
            auth_tokens: "".to_string(),
            webhook_urls: "".to_string(),
            ldap: Default::default(),
            trash: Default::default(),
            authz: Default::default(),
        }
    }
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            url: "ldap://localhost:389".to_string(),
            bind_dn: None,
            bind_password: None,
            base: "".to_string(),
            pool_size: 5,
            connection_ttl: 60,
            query_concurrency: 10,
            cache_max: 1000,
            cache_ttl: 300,
            time_limit: 10,
            connect_timeout: 0,
            user_main_attribute: "uid".to_string(),
            default_object_class: "".to_string(),
            flat_schema: "".to_string(),
        }
    }
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self {
            base: "".to_string(),
            watched_bases: "".to_string(),
            add_metadata: true,
            auto_create: true,
        }
    }
}

impl Default for AuthzSettings {
    fn default() -> Self {
        Self {
            per_branch_config: "".to_string(),
            cache_ttl: 300,
            group_base: None,
        }
    }
}

impl Config {
    /// The values available for `{key}` placeholder substitution in schema documents.
    pub fn placeholder_values(&self) -> HashMap<String, String> {
        HashMap::from([
            ("ldap_base".to_string(), self.ldap.base.clone()),
            ("trash_base".to_string(), self.trash.base.clone()),
            ("api_prefix".to_string(), self.api_prefix.clone()),
        ])
    }
}

/// Split a comma separated configuration value into its trimmed, non-empty parts.
pub fn comma_list(value: &str) -> Vec<String> {
    split_list(value, ',')
}

/// Split a semicolon separated list of dns, dns contain commas themselves.
pub fn dn_list(value: &str) -> Vec<String> {
    split_list(value, ';')
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

pub fn read_config() -> Figment {
    Figment::from(rocket::Config::default())
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file("opendirectory.toml").nested())
        .merge(Env::prefixed("DM_").global())
        .select(Profile::from_env_or("DM_PROFILE", "default"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_list_trims_and_drops_empty_parts() {
        assert_eq!(
            comma_list("schemas/users.json, schemas/groups.json ,"),
            vec!["schemas/users.json", "schemas/groups.json"]
        );
        assert_eq!(comma_list(""), Vec::<String>::new());
    }

    #[test]
    fn dn_lists_split_at_semicolons_only() {
        assert_eq!(
            dn_list("ou=members,dc=ex; ou=groups,dc=ex"),
            vec!["ou=members,dc=ex", "ou=groups,dc=ex"]
        );
    }

    #[test]
    fn defaults_match_the_documented_ones() {
        let config = Config::default();
        assert_eq!(config.ldap.pool_size, 5);
        assert_eq!(config.ldap.connection_ttl, 60);
        assert_eq!(config.ldap.query_concurrency, 10);
        assert_eq!(config.ldap.cache_max, 1000);
        assert_eq!(config.ldap.cache_ttl, 300);
        assert_eq!(config.ldap.time_limit, 10);
        assert_eq!(config.api_prefix, "/api/v1");
    }

    #[test]
    fn flat_spec_key_names_are_used() {
        let json = serde_json::to_value(Config::default()).expect("serialized config");
        assert!(json.get("ldap_url").is_some());
        assert!(json.get("trash_base").is_some());
        assert!(json.get("authz_per_branch_config").is_some());
    }
}

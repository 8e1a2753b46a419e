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

use std::sync::Arc;

use chrono::Local;
use okapi::openapi3::OpenApi;
use okapi::schemars::JsonSchema;
use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::settings::OpenApiSettings;
use rocket_okapi::{openapi, openapi_get_routes_spec};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::directory_user_agent;
use crate::openapi::{ApiResult, SchemaExample};
use crate::schema::SchemaStore;

/// A structure to provide basic information about the server.
/// This is intended to determine if the server is up or not.
#[derive(Serialize, Deserialize, JsonSchema, Clone)]
pub struct ServerInfo {
    /// The RFC3339 compliant date time when this instance was started at.
    start: String,
    /// The version of this server software.
    version: String,
}

impl ServerInfo {
    /// Create a new instance of the server information.
    /// The start will be set to the time when this function is called.
    pub fn new() -> Self {
        Self {
            version: directory_user_agent(),
            start: Local::now().to_rfc3339(),
        }
    }
}

impl SchemaExample for ServerInfo {
    fn example() -> Self {
        Self::new()
    }
}

/// The feature discovery document of this instance.
#[derive(Serialize, Deserialize, JsonSchema, Clone)]
#[serde(rename_all = "camelCase")]
#[schemars(example = "Self::example")]
pub struct ServerConfig {
    /// The prefix the API is mounted under.
    api_prefix: String,
    /// The base dn of the directory.
    ldap_base: String,
    features: Features,
}

/// The entity kinds this instance serves.
#[derive(Serialize, Deserialize, JsonSchema, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    /// The plural names of all loaded flat entity schemas.
    flat_resources: Vec<String>,
    /// Whether a `groups` schema is loaded.
    groups: bool,
    /// Whether an `organizations` schema is loaded.
    organizations: bool,
}

impl SchemaExample for ServerConfig {
    fn example() -> Self {
        Self {
            api_prefix: "/api/v1".to_string(),
            ldap_base: "dc=mvl,dc=at".to_string(),
            features: Features {
                flat_resources: vec!["users".to_string(), "groups".to_string()],
                groups: true,
                organizations: false,
            },
        }
    }
}

/// Return the current information of the server using its internal state.
///
/// # Arguments
///
/// * `info_state`: the state of the server
///
/// returns: Result<Json<ServerInfo>, Error>
#[openapi(tag = "Misc")]
#[get("/")]
pub fn info(info_state: &State<ServerInfo>) -> ApiResult<ServerInfo> {
    Ok(Json((*info_state).clone()))
}

/// Return the mounted prefix, the directory base and the served entity kinds.
///
/// # Arguments
///
/// * `config`: the application configuration
/// * `schemas`: the loaded schema documents
///
/// returns: Result<Json<ServerConfig>, Error>
#[openapi(tag = "Misc")]
#[get("/config")]
pub fn server_config(
    config: &State<Config>,
    schemas: &State<Arc<SchemaStore>>,
) -> ApiResult<ServerConfig> {
    let flat_resources = schemas.plural_names();
    Ok(Json(ServerConfig {
        api_prefix: config.api_prefix.clone(),
        ldap_base: config.ldap.base.clone(),
        features: Features {
            groups: flat_resources.iter().any(|name| name == "groups"),
            organizations: flat_resources.iter().any(|name| name == "organizations"),
            flat_resources,
        },
    }))
}

/// Generate the OpenApi documentation and routes for the info endpoints.
///
/// # Arguments
///
/// * `settings`: the OpenApi settings to use to generate the documentation
///
/// returns: (Vec<Route, Global>, OpenApi)
pub fn get_routes_and_docs(settings: &OpenApiSettings) -> (Vec<rocket::Route>, OpenApi) {
    openapi_get_routes_spec![settings: info, server_config]
}

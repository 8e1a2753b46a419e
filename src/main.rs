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

#[macro_use]
extern crate rocket;
#[macro_use]
extern crate log;

use std::sync::Arc;

use figment::Figment;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket};
use rocket_okapi::{mount_endpoints_and_merged_docs, swagger_ui::*};

use crate::auth::TokenMap;
use crate::authz::AuthzPerBranch;
use crate::config::Config;
use crate::directory::entity::FlatEntitySet;
use crate::errors::DirectoryResult;
use crate::hooks::HookRegistry;
use crate::info::ServerInfo;
use crate::ldap::LdapClient;
use crate::org::OrgConsistency;
use crate::plugin::webhook::WebhookNotifier;
use crate::plugin::{PluginCore, PluginHost};
use crate::schema::SchemaStore;
use crate::trash::Trash;

mod auth;
mod authz;
mod config;
mod directory;
mod errors;
mod hooks;
mod info;
mod ldap;
mod openapi;
mod org;
mod plugin;
mod schema;
mod trash;

/// The user agent of this application consisting of the name and the version.
pub fn directory_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

#[rocket::main]
async fn main() {
    env_logger::init();
    let figment = config::read_config();
    let config: Config = match figment.extract() {
        Ok(config) => config,
        Err(error) => {
            error!("invalid configuration: {}", error);
            return;
        }
    };
    let core = match bootstrap(&config).await {
        Ok(core) => core,
        Err(error) => {
            error!("failed to start: {}", error);
            return;
        }
    };
    let server = create_server(figment, &config, core);
    match server.launch().await {
        Ok(_) => info!("shutdown opendirectory!"),
        Err(err) => error!("failed to start: {}", err.to_string()),
    }
}

/// Construct the shared engine state and load all plugins in dependency order.
async fn bootstrap(config: &Config) -> DirectoryResult<PluginCore> {
    let hooks = Arc::new(HookRegistry::default());
    let ldap = Arc::new(LdapClient::new(config, hooks.clone()));
    let schemas = Arc::new(SchemaStore::load(config)?);
    let entities = Arc::new(FlatEntitySet::new(&schemas, ldap.clone()));
    let core = PluginCore {
        hooks,
        ldap,
        schemas,
        entities,
    };
    let mut host = PluginHost::new();
    host.register(Arc::new(AuthzPerBranch::from_config(config)?));
    host.register(Arc::new(OrgConsistency::new()));
    host.register(Arc::new(Trash::new(&config.trash)));
    host.register(Arc::new(WebhookNotifier::from_config(config)));
    host.load(&core).await?;
    Ok(core)
}

fn create_server(figment: Figment, config: &Config, core: PluginCore) -> Rocket<Build> {
    let openapi_settings = openapi::openapi_settings();
    let custom_route_spec = (vec![], openapi::custom_openapi_spec(config));
    let mut rocket = rocket::custom(figment)
        .mount(
            "/swagger-ui/",
            make_swagger_ui(&SwaggerUIConfig {
                url: format!("{}/openapi.json", config.api_prefix),
                ..Default::default()
            }),
        )
        .attach(AdHoc::config::<Config>())
        .manage(core.ldap.clone())
        .manage(core.schemas.clone())
        .manage(core.entities.clone())
        .manage(TokenMap::from_config(config))
        .manage(ServerInfo::new());
    mount_endpoints_and_merged_docs! {
        rocket, config.api_prefix.clone(), openapi_settings,
        "/" => custom_route_spec,
        "/" => info::get_routes_and_docs(&openapi_settings),
        "/ldap" => directory::get_routes_and_docs(&openapi_settings),
        "/ldap/organizations" => org::get_routes_and_docs(&openapi_settings)
    };
    rocket
}

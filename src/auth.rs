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

//! Request authentication against the static bearer token list.
//!
//! Authentication itself is delegated: the server only resolves a presented
//! bearer token to a uid for the authorization engine. Without a configured
//! token list every request runs anonymously with the default permissions.

use std::collections::HashMap;

use okapi::openapi3::{Object, SecurityRequirement, SecurityScheme, SecuritySchemeData};
use rocket::http::Status;
use rocket::outcome::Outcome::{Error, Success};
use rocket::request::{FromRequest, Outcome};
use rocket::Request;
use rocket_okapi::gen::OpenApiGenerator;
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};

use crate::config::{comma_list, Config};
use crate::ldap::model::RequestContext;

const AUTHORIZATION_HEADER: &str = "Authorization";
const BEARER_PREFIX: &str = "Bearer ";

/// The static mapping from bearer token to uid.
pub struct TokenMap {
    tokens: HashMap<String, String>,
}

impl TokenMap {
    /// Parse the `token=uid` pairs of the configuration.
    pub fn from_config(config: &Config) -> Self {
        let tokens = comma_list(&config.auth_tokens)
            .iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(token, uid)| (token.trim().to_string(), uid.trim().to_string()))
            })
            .collect();
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn resolve(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(|uid| uid.as_str())
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestContext {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let tokens = match request.rocket().state::<TokenMap>() {
            Some(tokens) if !tokens.is_empty() => tokens,
            _ => return Success(RequestContext::anonymous()),
        };
        let header = request.headers().get_one(AUTHORIZATION_HEADER);
        let Some(header) = header else {
            debug!("request without credentials");
            return Error((Status::Unauthorized, ()));
        };
        if !header.starts_with(BEARER_PREFIX) {
            debug!("header does not start with bearer");
            return Error((Status::Unauthorized, ()));
        }
        match tokens.resolve(header.trim_start_matches(BEARER_PREFIX).trim()) {
            Some(uid) => {
                let ctx = RequestContext::for_user(uid);
                debug!("authenticated request {}", ctx);
                Success(ctx)
            }
            None => {
                info!("request with an unknown bearer token");
                Error((Status::Unauthorized, ()))
            }
        }
    }
}

impl<'r> OpenApiFromRequest<'r> for RequestContext {
    fn from_request_input(
        _gen: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> rocket_okapi::Result<RequestHeaderInput> {
        let mut security_req = SecurityRequirement::new();
        // Each security requirement needs to be met before access is allowed.
        security_req.insert("bearer token".to_owned(), Vec::new());
        Ok(RequestHeaderInput::Security(
            "bearer token".to_string(),
            SecurityScheme {
                description: Some(
                    "Required when the server carries a static bearer token list".to_string(),
                ),
                data: SecuritySchemeData::Http {
                    scheme: "bearer".to_string(),
                    bearer_format: Some("opaque".to_string()),
                },
                extensions: Object::default(),
            },
            security_req,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_pairs_parse_from_the_configuration() {
        let mut config = Config::default();
        config.auth_tokens = "s3cret=alice, other=bob".to_string();
        let tokens = TokenMap::from_config(&config);
        assert_eq!(tokens.resolve("s3cret"), Some("alice"));
        assert_eq!(tokens.resolve("other"), Some("bob"));
        assert_eq!(tokens.resolve("unknown"), None);
    }

    #[test]
    fn an_empty_configuration_disables_authentication() {
        let tokens = TokenMap::from_config(&Config::default());
        assert!(tokens.is_empty());
    }
}

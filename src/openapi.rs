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
use std::error::Error;
use std::io;
use std::result::Result as StdResult;

use okapi::openapi3::OpenApi;
use rocket::{
    http::{ContentType, Status},
    request::Request,
    response::{self, Responder, Response},
    serde::json::Json,
};
use rocket_okapi::settings::OpenApiSettings;
use rocket_okapi::{
    gen::OpenApiGenerator,
    okapi::{openapi3::Responses, schemars},
    response::OpenApiResponderInner,
    OpenApiError,
};

use crate::config::Config;

/// A wrapper for the standard [StdResult] which contains a json body and an [ApiError].
pub type ApiResult<T> = StdResult<Json<T>, ApiError>;

/// Trait which purpose is to provide an example for the OpenApi specification.
pub trait SchemaExample {
    /// Provides an example instance for the type.
    ///
    /// returns: Self
    fn example() -> Self;
}

/// Create a map with a bunch of default HTTP status code descriptions.
///
/// returns: HashMap<&'static str, &'static str>
fn http_code_descriptions() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        (
            "400",
            "[Bad Request](https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/400).
                The request given is wrongly formatted or data asked could not be fulfilled.",
        ),
        (
            "401",
            "[Not Authorized](https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/401).
                This response is given when a request requires authentication but none was issued.",
        ),
        (
            "403",
            "[Forbidden](https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/403).
                This response is given when the authenticated user has no permission on the branch.",
        ),
        (
            "404",
            "[Not Found](https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/404).
                This response is given when you request a page that does not exists.",
        ),
        (
            "409",
            "[Conflict](https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/409).
                This response is given when the request collides with existing directory state.",
        ),
        (
            "422",
            "[Unprocessable Entity](https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/422).
                This response is given when you request body is not correctly formatted.",
        ),
        (
            "500",
            "[Internal Server Error](https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/500).
                This response is given when something wend wrong on the server.",
        ),
    ])
}

/// Error messages returned to user
#[derive(Debug, serde::Serialize, schemars::JsonSchema)]
pub struct ApiError {
    /// The title of the error message
    pub err: String,
    /// The description of the error
    pub msg: Option<String>,
    /// HTTP Status Code returned
    #[serde(skip)]
    pub http_status_code: u16,
}

impl OpenApiResponderInner for ApiError {
    fn responses(_generator: &mut OpenApiGenerator) -> Result<Responses, OpenApiError> {
        use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse};
        let resp = http_code_descriptions()
            .iter()
            .map(|(code, desc)| {
                (
                    code.to_string(),
                    RefOr::Object(OpenApiResponse {
                        description: desc.to_string(),
                        ..Default::default()
                    }),
                )
            })
            .collect();
        Ok(Responses {
            responses: resp,
            ..Default::default()
        })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "Error `{}`: {}",
            self.err,
            self.msg.as_deref().unwrap_or("<no message>")
        )
    }
}

impl Error for ApiError {}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        // Convert object to json
        let body = serde_json::to_string(&self).expect("Error body");
        Response::build()
            .sized_body(body.len(), io::Cursor::new(body))
            .header(ContentType::JSON)
            .status(Status::new(self.http_status_code))
            .ok()
    }
}

impl From<rocket::serde::json::Error<'_>> for ApiError {
    fn from(err: rocket::serde::json::Error) -> Self {
        use rocket::serde::json::Error::*;
        match err {
            Io(io_error) => ApiError {
                err: "IO Error".to_owned(),
                msg: Some(io_error.to_string()),
                http_status_code: 422,
            },
            Parse(_raw_data, parse_error) => ApiError {
                err: "Parse Error".to_owned(),
                msg: Some(parse_error.to_string()),
                http_status_code: 422,
            },
        }
    }
}

/// Provide the OpenApi settings to be used in this application.
///
/// returns: OpenApiSettings
pub fn openapi_settings() -> OpenApiSettings {
    Default::default()
}

/// Create an [OpenApi] structure to use in this application.
/// This structure will contain the header such as the license, author and server list.
///
/// # Arguments
///
/// * `config`: the application configuration to take the server list from
///
/// returns: OpenApi
pub fn custom_openapi_spec(config: &Config) -> OpenApi {
    use okapi::openapi3::*;
    OpenApi {
        openapi: OpenApi::default_version(),
        info: Info {
            title: "OpenDirectory".to_owned(),
            description: Some(
                "The pluggable directory management API of the Musikverein Leopoldsdorf!"
                    .to_owned(),
            ),
            terms_of_service: Some(
                "https://github.com/mvl-at/opendirectory/blob/master/license.adoc".to_owned(),
            ),
            contact: Some(Contact {
                name: Some("Richard Stöckl".to_owned()),
                url: Some("https://github.com/mvl-at/opendirectory".to_owned()),
                email: Some("richard.stoeckl@aon.at".to_owned()),
                ..Default::default()
            }),
            license: Some(License {
                name: "GNU Free Documentation License 1.3".to_owned(),
                url: Some("https://www.gnu.org/licenses/fdl-1.3-standalone.html".to_owned()),
                ..Default::default()
            }),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            ..Default::default()
        },
        servers: vec![
            Server {
                url: config.openapi_url.clone(),
                description: Some("Self Hosted Instance".to_owned()),
                ..Default::default()
            },
            Server {
                url: format!("http://localhost:8000{}/", config.api_prefix),
                description: Some("Localhost".to_owned()),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

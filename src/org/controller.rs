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

use rocket::form::FromForm;
use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::directory::model::OperationStatus;
use crate::errors::DirectoryError;
use crate::ldap::model::{Entry, RequestContext, SearchOpts};
use crate::ldap::LdapClient;
use crate::openapi::{ApiError, ApiResult};
use crate::org::{OrgDeletion, ORGANIZATION_FILTER};

/// The optional narrowing of a subnode listing.
#[derive(Debug, Default, FromForm)]
pub struct SubnodeFilters {
    /// Restrict the children to one object class.
    #[field(name = "objectClass")]
    pub object_class: Option<String>,
}

fn class_filter(object_class: Option<&str>) -> Result<String, ApiError> {
    match object_class {
        None => Ok("(objectClass=*)".to_string()),
        Some(class) => {
            let acceptable = !class.is_empty()
                && class
                    .chars()
                    .all(|character| character.is_ascii_alphanumeric() || character == '-');
            if !acceptable {
                return Err(ApiError::from(DirectoryError::TestFailed {
                    attribute: "objectClass".to_string(),
                    value: class.to_string(),
                }));
            }
            Ok(format!("(objectClass={})", class))
        }
    }
}

/// List the organizations directly below the directory base.
#[openapi(tag = "Organizations")]
#[get("/top")]
pub async fn top_organizations(
    ldap: &State<Arc<LdapClient>>,
    ctx: RequestContext,
) -> ApiResult<Vec<Entry>> {
    let entries = ldap
        .search(SearchOpts::one(ORGANIZATION_FILTER), None, &ctx)
        .await?;
    Ok(Json(entries))
}

/// Fetch one organization by url-encoded dn.
#[openapi(tag = "Organizations")]
#[get("/<dn>")]
pub async fn organization(
    dn: String,
    ldap: &State<Arc<LdapClient>>,
    ctx: RequestContext,
) -> ApiResult<Entry> {
    let normalized = ldap.normalize_dn(&dn);
    let entry = ldap
        .find(&normalized, &ctx)
        .await?
        .ok_or(DirectoryError::NotFound { dn: normalized })?;
    Ok(Json(entry))
}

/// List the children of an organization, optionally restricted by object class.
#[openapi(skip)]
#[get("/<dn>/subnodes?<filters..>")]
pub async fn organization_subnodes(
    dn: String,
    filters: SubnodeFilters,
    ldap: &State<Arc<LdapClient>>,
    ctx: RequestContext,
) -> ApiResult<Vec<Entry>> {
    let filter = class_filter(filters.object_class.as_deref())?;
    let normalized = ldap.normalize_dn(&dn);
    let entries = ldap
        .search(SearchOpts::one(filter), Some(&normalized), &ctx)
        .await?;
    Ok(Json(entries))
}

/// Delete an organization.
///
/// Runs the delete state machine: the organization is checked for linked
/// entries first and the deletion is rejected while any exist.
#[openapi(tag = "Organizations")]
#[delete("/<dn>")]
pub async fn delete_organization(
    dn: String,
    ldap: &State<Arc<LdapClient>>,
    ctx: RequestContext,
) -> ApiResult<OperationStatus> {
    let normalized = ldap.normalize_dn(&dn);
    let mut deletion = OrgDeletion::new(normalized);
    deletion.execute(ldap.inner(), &ctx).await?;
    Ok(Json(OperationStatus { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_filters_are_sanitized() {
        assert_eq!(
            class_filter(Some("organizationalUnit")).expect("filter"),
            "(objectClass=organizationalUnit)"
        );
        assert_eq!(class_filter(None).expect("filter"), "(objectClass=*)");
        assert!(class_filter(Some("x)(uid=*")).is_err());
    }
}

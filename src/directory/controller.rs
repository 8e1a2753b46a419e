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
use std::sync::Arc;

use rocket::http::Status;
use rocket::response::status::Created;
use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::config::comma_list;
use crate::directory::entity::{FlatEntity, FlatEntitySet};
use crate::directory::model::{
    ListFilters, MoveRequest, MoveResponse, OperationStatus, RenameRequest, RenameResponse,
};
use crate::ldap::model::{ChangeSet, Entry, RequestContext};
use crate::ldap::LdapClient;
use crate::openapi::{ApiError, ApiResult};
use crate::org;

/// Resolve the plural name to its flat entity or answer 404.
pub fn entity_of(
    entities: &FlatEntitySet,
    plural_name: &str,
) -> Result<Arc<FlatEntity>, ApiError> {
    entities.get(plural_name).ok_or_else(|| ApiError {
        err: "Not Found".to_string(),
        msg: Some(format!("no entity kind named '{}'", plural_name)),
        http_status_code: Status::NotFound.code,
    })
}

/// List all entries of the entity kind, keyed by their identifier.
///
/// # Arguments
///
/// * `plural`: the plural name of the entity kind
/// * `filters`: the optional `match`, `attribute` and `attributes` query parameters
#[openapi(skip)]
#[get("/<plural>?<filters..>")]
pub async fn list(
    plural: String,
    filters: ListFilters,
    entities: &State<Arc<FlatEntitySet>>,
    ctx: RequestContext,
) -> ApiResult<BTreeMap<String, Entry>> {
    let entity = entity_of(entities, &plural)?;
    let matches = filters.matches.as_deref().map(|value| {
        (
            filters
                .attribute
                .as_deref()
                .unwrap_or(entity.schema().entity.main_attribute.as_str()),
            value,
        )
    });
    let attributes = filters.attributes.as_deref().map(comma_list);
    let listing = match filters.paged {
        Some(page_size) => {
            entity
                .list_paged(matches, attributes, page_size, &ctx)
                .await?
        }
        None => entity.list(matches, attributes, &ctx).await?,
    };
    Ok(Json(listing))
}

/// Fetch one entry by identifier or url-encoded dn.
#[openapi(tag = "Directory")]
#[get("/<plural>/<id>")]
pub async fn get(
    plural: String,
    id: String,
    entities: &State<Arc<FlatEntitySet>>,
    ctx: RequestContext,
) -> ApiResult<Entry> {
    let entity = entity_of(entities, &plural)?;
    Ok(Json(entity.get(&id, &ctx).await?))
}

/// Create an entry out of the posted attribute map.
#[openapi(skip)]
#[post("/<plural>", data = "<entry>")]
pub async fn create(
    plural: String,
    entry: Json<Entry>,
    entities: &State<Arc<FlatEntitySet>>,
    ctx: RequestContext,
) -> Result<Created<Json<Entry>>, ApiError> {
    let entity = entity_of(entities, &plural)?;
    let stored = entity.add(entry.into_inner(), &ctx).await?;
    let location = format!("/ldap/{}/{}", plural, stored.dn);
    Ok(Created::new(location).body(Json(stored)))
}

/// Apply the add, replace and delete buckets to an entry.
#[openapi(tag = "Directory")]
#[put("/<plural>/<id>", data = "<changes>")]
pub async fn modify(
    plural: String,
    id: String,
    changes: Json<ChangeSet>,
    entities: &State<Arc<FlatEntitySet>>,
    ctx: RequestContext,
) -> ApiResult<OperationStatus> {
    let entity = entity_of(entities, &plural)?;
    let success = entity.modify(&id, changes.into_inner(), &ctx).await?;
    Ok(Json(OperationStatus { success }))
}

/// Delete an entry, soft-deleting on watched branches.
#[openapi(tag = "Directory")]
#[delete("/<plural>/<id>")]
pub async fn delete(
    plural: String,
    id: String,
    entities: &State<Arc<FlatEntitySet>>,
    ctx: RequestContext,
) -> ApiResult<OperationStatus> {
    let entity = entity_of(entities, &plural)?;
    entity.delete(&id, &ctx).await?;
    Ok(Json(OperationStatus { success: true }))
}

/// Give an entry a new identifier.
///
/// The rdn changes, the parent stays. Renaming an organization triggers the
/// link and path rewrite of every entry below or linking to it.
#[openapi(tag = "Directory")]
#[post("/<plural>/<id>/rename", data = "<request>")]
pub async fn rename(
    plural: String,
    id: String,
    request: Json<RenameRequest>,
    entities: &State<Arc<FlatEntitySet>>,
    ctx: RequestContext,
) -> ApiResult<RenameResponse> {
    let entity = entity_of(entities, &plural)?;
    let new_dn = entity.rename(&id, &request.new_id, &ctx).await?;
    Ok(Json(RenameResponse {
        success: true,
        new_dn,
    }))
}

/// Move an entry into another organization.
///
/// Flat entities keep their dn, only the organization link and path are
/// rewritten. Organizations change their dn instead, downstream links are
/// rewritten by the consistency plugin.
#[openapi(tag = "Directory")]
#[post("/<plural>/<id>/move", data = "<request>")]
pub async fn move_entry(
    plural: String,
    id: String,
    request: Json<MoveRequest>,
    entities: &State<Arc<FlatEntitySet>>,
    ldap: &State<Arc<LdapClient>>,
    ctx: RequestContext,
) -> ApiResult<MoveResponse> {
    let entity = entity_of(entities, &plural)?;
    let target = &request.target_org_dn;
    if entity.schema().is_organization_kind() {
        let dn = entity.dn_for(&id);
        let new_dn = org::move_organization(ldap.inner(), &dn, target, &ctx).await?;
        return Ok(Json(MoveResponse::for_organization(new_dn)));
    }
    let outcome = entity.move_to_org(&id, target, &ctx).await?;
    Ok(Json(MoveResponse::for_entity(
        outcome.department_path,
        outcome.department_link,
    )))
}

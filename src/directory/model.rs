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

use rocket::form::FromForm;
use rocket::serde::{Deserialize, Serialize};
use rocket_okapi::JsonSchema;

use crate::openapi::SchemaExample;

/// The optional narrowing of a list request.
#[derive(Debug, Default, FromForm)]
pub struct ListFilters {
    /// The value the matched attribute must contain.
    #[field(name = "match")]
    pub matches: Option<String>,
    /// The attribute to match against, the main attribute when absent.
    pub attribute: Option<String>,
    /// The attributes to fetch, comma separated, all when absent.
    pub attributes: Option<String>,
    /// Pull the result through a paged search with this page size.
    pub paged: Option<i32>,
}

/// The body of a move request.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[schemars(example = "Self::example")]
pub struct MoveRequest {
    /// The dn of the organization the entry should be linked to.
    pub target_org_dn: String,
}

impl SchemaExample for MoveRequest {
    fn example() -> Self {
        Self {
            target_org_dn: "ou=brass,ou=orchestra,dc=mvl,dc=at".to_string(),
        }
    }
}

/// The outcome of a move request.
///
/// Flat entities keep their dn and report the rewritten link and path,
/// organizations change their dn and report it.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[schemars(example = "Self::example")]
pub struct MoveResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_dn: Option<String>,
}

impl MoveResponse {
    pub fn for_entity(department_path: String, department_link: String) -> Self {
        Self {
            success: true,
            department_path: Some(department_path),
            department_link: Some(department_link),
            new_dn: None,
        }
    }

    pub fn for_organization(new_dn: String) -> Self {
        Self {
            success: true,
            department_path: None,
            department_link: None,
            new_dn: Some(new_dn),
        }
    }
}

impl SchemaExample for MoveResponse {
    fn example() -> Self {
        Self::for_entity(
            "/orchestra/brass".to_string(),
            "ou=brass,ou=orchestra,dc=mvl,dc=at".to_string(),
        )
    }
}

/// The body of a rename request.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[schemars(example = "Self::example")]
pub struct RenameRequest {
    /// The new identifier of the entry.
    pub new_id: String,
}

impl SchemaExample for RenameRequest {
    fn example() -> Self {
        Self {
            new_id: "karli2".to_string(),
        }
    }
}

/// The outcome of a rename request.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[schemars(example = "Self::example")]
pub struct RenameResponse {
    pub success: bool,
    pub new_dn: String,
}

impl SchemaExample for RenameResponse {
    fn example() -> Self {
        Self {
            success: true,
            new_dn: "uid=karli2,ou=members,dc=mvl,dc=at".to_string(),
        }
    }
}

/// A plain success marker for modify and delete responses.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[schemars(example = "Self::example")]
pub struct OperationStatus {
    pub success: bool,
}

impl SchemaExample for OperationStatus {
    fn example() -> Self {
        Self { success: true }
    }
}

/// The modes of a bulk import run.
#[derive(Debug, Default, FromForm)]
pub struct BulkImportOptions {
    /// Validate only, write nothing.
    #[field(name = "dryRun", default = false)]
    pub dry_run: bool,
    /// Collect failures instead of stopping at the first one.
    #[field(name = "continueOnError", default = false)]
    pub continue_on_error: bool,
    /// Update entries which already exist instead of skipping them.
    #[field(name = "updateExisting", default = false)]
    pub update_existing: bool,
}

/// One failed line of a bulk import.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BulkImportError {
    /// The csv line the failure belongs to, the header is line 1.
    pub line: usize,
    /// The identifier of the entry when the line carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: String,
}

/// The accounting of a bulk import run.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[schemars(example = "Self::example")]
pub struct BulkImportSummary {
    pub success: bool,
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<BulkImportError>,
}

impl SchemaExample for BulkImportSummary {
    fn example() -> Self {
        Self {
            success: true,
            total: 3,
            created: 2,
            updated: 1,
            skipped: 0,
            failed: 0,
            errors: vec![],
        }
    }
}

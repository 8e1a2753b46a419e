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

//! Bulk creation and update of entries out of csv documents.
//!
//! The template of an entity kind lists its main attribute first, then the
//! required attributes and finally the optional ones. Fixed attributes are
//! filled from their schema defaults and carry no column. Multi valued cells
//! separate their values with `;`.

use std::sync::Arc;

use rocket::http::ContentType;
use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;

use crate::directory::controller::entity_of;
use crate::directory::entity::{FlatEntity, FlatEntitySet};
use crate::directory::model::{BulkImportError, BulkImportOptions, BulkImportSummary};
use crate::errors::{DirectoryError, DirectoryResult};
use crate::ldap::model::{ChangeSet, Entry, RequestContext, Values};
use crate::openapi::ApiError;
use crate::schema::model::AttributeType;

/// The csv header of an entity kind.
fn template_columns(entity: &FlatEntity) -> Vec<String> {
    let schema = entity.schema();
    let main = schema.entity.main_attribute.clone();
    let mut required = Vec::new();
    let mut optional = Vec::new();
    for (attribute, spec) in &schema.attributes {
        if *attribute == main || spec.fixed {
            continue;
        }
        if spec.required {
            required.push(attribute.clone());
        } else {
            optional.push(attribute.clone());
        }
    }
    let mut columns = vec![main];
    columns.extend(required);
    columns.extend(optional);
    columns
}

/// Parse one csv record into an entry.
fn record_entry(
    entity: &FlatEntity,
    headers: &[String],
    record: &csv::StringRecord,
) -> Entry {
    let schema = entity.schema();
    let mut entry = Entry::default();
    for (header, cell) in headers.iter().zip(record.iter()) {
        let cell = cell.trim();
        if cell.is_empty() {
            continue;
        }
        let multi_valued = schema
            .attributes
            .get(header)
            .map(|spec| spec.kind == AttributeType::Array)
            .unwrap_or(false);
        let values = if multi_valued {
            cell.split(';')
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        } else {
            vec![cell.to_string()]
        };
        entry.set(header.clone(), values);
    }
    entry
}

/// Import one parsed entry, returns what happened to it.
async fn import_entry(
    entity: &FlatEntity,
    entry: Entry,
    options: &BulkImportOptions,
    ctx: &RequestContext,
) -> DirectoryResult<ImportOutcome> {
    let schema = entity.schema();
    let main = schema.entity.main_attribute.clone();
    let entry = entity.validate(entry).await?;
    let id = entry
        .first(&main)
        .ok_or_else(|| DirectoryError::RequiredMissing {
            attribute: main.clone(),
        })?
        .to_string();
    let existing = match entity.get(&id, ctx).await {
        Ok(existing) => Some(existing),
        Err(DirectoryError::NotFound { .. }) => None,
        Err(error) => return Err(error),
    };
    match existing {
        None => {
            if !options.dry_run {
                entity.add(entry, ctx).await?;
            }
            Ok(ImportOutcome::Created)
        }
        Some(_) if !options.update_existing => Ok(ImportOutcome::Skipped),
        Some(_) => {
            let mut changes = ChangeSet::default();
            for (attribute, values) in &entry.attributes {
                if *attribute == main {
                    continue;
                }
                let fixed = schema
                    .attributes
                    .get(attribute)
                    .map(|spec| spec.fixed)
                    .unwrap_or(false);
                if fixed || attribute.eq_ignore_ascii_case("objectClass") {
                    continue;
                }
                changes
                    .replace
                    .insert(attribute.clone(), Values(values.clone()));
            }
            if !options.dry_run && !changes.is_empty() {
                entity.modify(&id, changes, ctx).await?;
            }
            Ok(ImportOutcome::Updated)
        }
    }
}

enum ImportOutcome {
    Created,
    Updated,
    Skipped,
}

/// Run a whole import over the csv document.
async fn run_import(
    entity: &FlatEntity,
    csv: &str,
    options: &BulkImportOptions,
    ctx: &RequestContext,
) -> BulkImportSummary {
    let mut summary = BulkImportSummary::default();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(csv.as_bytes());
    let headers: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(|header| header.to_string()).collect(),
        Err(error) => {
            summary.failed = 1;
            summary.errors.push(BulkImportError {
                line: 1,
                id: None,
                error: error.to_string(),
            });
            return summary;
        }
    };
    for (index, record) in reader.records().enumerate() {
        // the header is line 1
        let line = index + 2;
        summary.total += 1;
        let outcome = match record {
            Ok(record) => {
                let entry = record_entry(entity, &headers, &record);
                let id = entry
                    .first(&entity.schema().entity.main_attribute)
                    .map(|id| id.to_string());
                import_entry(entity, entry, options, ctx)
                    .await
                    .map_err(|error| (id, error.to_string()))
            }
            Err(error) => Err((None, error.to_string())),
        };
        match outcome {
            Ok(ImportOutcome::Created) => summary.created += 1,
            Ok(ImportOutcome::Updated) => summary.updated += 1,
            Ok(ImportOutcome::Skipped) => summary.skipped += 1,
            Err((id, error)) => {
                summary.failed += 1;
                summary.errors.push(BulkImportError { line, id, error });
                if !options.continue_on_error {
                    break;
                }
            }
        }
    }
    summary.success = summary.failed == 0;
    summary
}

/// Download the csv template of an entity kind.
#[openapi(skip)]
#[get("/bulk-import/<name>/template.csv")]
pub async fn template(
    name: String,
    entities: &State<Arc<FlatEntitySet>>,
    _ctx: RequestContext,
) -> Result<(ContentType, String), ApiError> {
    let entity = entity_of(entities, &name)?;
    let header = template_columns(&entity).join(",");
    Ok((ContentType::CSV, format!("{}\n", header)))
}

/// Import entries out of the posted csv document.
///
/// # Arguments
///
/// * `name`: the plural name of the entity kind
/// * `options`: the `dryRun`, `continueOnError` and `updateExisting` query parameters
#[openapi(skip)]
#[post("/bulk-import/<name>?<options..>", data = "<csv>")]
pub async fn import(
    name: String,
    options: BulkImportOptions,
    csv: String,
    entities: &State<Arc<FlatEntitySet>>,
    ctx: RequestContext,
) -> Result<Json<BulkImportSummary>, ApiError> {
    let entity = entity_of(entities, &name)?;
    Ok(Json(run_import(&entity, &csv, &options, &ctx).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hooks::HookRegistry;
    use crate::ldap::LdapClient;
    use crate::schema::model::Schema;

    fn entity() -> FlatEntity {
        let schema: Schema = serde_json::from_value(serde_json::json!({
            "entity": {
                "name": "user",
                "mainAttribute": "uid",
                "objectClass": ["top", "inetOrgPerson"],
                "singularName": "user",
                "pluralName": "users",
                "base": "ou=members,dc=ex",
            },
            "attributes": {
                "uid": {"type": "string", "required": true},
                "sn": {"type": "string", "required": true},
                "mail": {"type": "array", "items": {"type": "string"}},
                "objectClass": {"type": "array", "fixed": true,
                                "default": ["top", "inetOrgPerson"]},
            },
        }))
        .expect("schema");
        let mut config = Config::default();
        config.ldap.base = "dc=ex".to_string();
        let ldap = Arc::new(LdapClient::new(&config, Arc::new(HookRegistry::default())));
        FlatEntity::new(Arc::new(schema), ldap)
    }

    #[test]
    fn the_template_lists_main_then_required_then_optional() {
        let columns = template_columns(&entity());
        assert_eq!(columns, vec!["uid", "sn", "mail"]);
    }

    #[test]
    fn records_split_multi_valued_cells() {
        let entity = entity();
        let headers = vec!["uid".to_string(), "sn".to_string(), "mail".to_string()];
        let record = csv::StringRecord::from(vec![
            "karli",
            "Steinscheisser",
            "karli@mvl.at; karl@mvl.at",
        ]);
        let entry = record_entry(&entity, &headers, &record);
        assert_eq!(entry.first("uid"), Some("karli"));
        assert_eq!(entry.values("mail").len(), 2);
    }

    #[test]
    fn empty_cells_are_skipped() {
        let entity = entity();
        let headers = vec!["uid".to_string(), "sn".to_string(), "mail".to_string()];
        let record = csv::StringRecord::from(vec!["karli", "Steinscheisser", ""]);
        let entry = record_entry(&entity, &headers, &record);
        assert!(!entry.has("mail"));
    }
}

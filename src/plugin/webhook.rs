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

//! A fan-out consumer of the done hooks which propagates completed writes to
//! external collaborators via plain JSON webhooks.

use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, ClientBuilder};

use crate::config::{comma_list, Config};
use crate::directory_user_agent;
use crate::errors::{DirectoryError, DirectoryResult};
use crate::hooks::{self, fanout, HookEvent};
use crate::plugin::{Plugin, PluginCore};

/// The plugin posting `{event, dn, timestamp}` documents to the configured urls.
///
/// Failures are logged by the hook registry and never fail the originating
/// operation.
pub struct WebhookNotifier {
    urls: Vec<String>,
    client: Client,
}

impl WebhookNotifier {
    pub fn from_config(config: &Config) -> Self {
        let client = ClientBuilder::new()
            .user_agent(directory_user_agent())
            .build()
            .expect("webhook http client");
        Self {
            urls: comma_list(&config.webhook_urls),
            client,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.urls.is_empty()
    }

    /// The JSON document describing a completed write.
    fn payload(event: &HookEvent) -> Option<serde_json::Value> {
        let (name, dn) = match event {
            HookEvent::AddDone { dn, .. } => ("entryAdded", dn),
            HookEvent::ModifyDone { dn, .. } => ("entryModified", dn),
            HookEvent::RenameDone { new_dn, .. } => ("entryRenamed", new_dn),
            HookEvent::MoveDone { new_dn, .. } => ("entryMoved", new_dn),
            HookEvent::DeleteDone { dn } => ("entryDeleted", dn),
            _ => return None,
        };
        Some(serde_json::json!({
            "event": name,
            "dn": dn,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    async fn notify(&self, event: &HookEvent) -> DirectoryResult<()> {
        let Some(payload) = Self::payload(event) else {
            return Ok(());
        };
        for url in &self.urls {
            self.client
                .post(url)
                .json(&payload)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|error| {
                    DirectoryError::Internal(format!("webhook '{}' failed: {}", url, error))
                })?;
            debug!("notified '{}' about {}", url, payload["event"]);
        }
        Ok(())
    }
}

#[rocket::async_trait]
impl Plugin for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook-notifier"
    }

    fn roles(&self) -> Vec<&'static str> {
        vec!["propagation"]
    }

    async fn init(self: Arc<Self>, core: &PluginCore) -> DirectoryResult<()> {
        if !self.enabled() {
            debug!("webhook notifier is disabled");
            return Ok(());
        }
        for hook in [
            hooks::LDAP_ADD_DONE,
            hooks::LDAP_MODIFY_DONE,
            hooks::LDAP_RENAME_DONE,
            hooks::LDAP_MOVE_DONE,
            hooks::LDAP_DELETE_DONE,
        ] {
            let notifier = self.clone();
            core.hooks.register_fanout(
                hook,
                fanout(move |event| {
                    let notifier = notifier.clone();
                    async move { notifier.notify(&event).await }
                }),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_events_produce_payloads() {
        let payload = WebhookNotifier::payload(&HookEvent::DeleteDone {
            dn: "uid=t,dc=ex".to_string(),
        })
        .expect("payload");
        assert_eq!(payload["event"], "entryDeleted");
        assert_eq!(payload["dn"], "uid=t,dc=ex");
        assert!(payload["timestamp"].is_string());
    }

    #[test]
    fn request_events_produce_no_payload() {
        let event = HookEvent::DeleteRequest {
            dns: vec![],
            ctx: crate::ldap::model::RequestContext::system(),
        };
        assert!(WebhookNotifier::payload(&event).is_none());
    }
}

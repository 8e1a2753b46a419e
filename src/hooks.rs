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

//! The extension points wrapped around every directory verb.
//!
//! Hooks come in two shapes: chained hooks run their handlers in registration
//! order, each handler receives the event produced by its predecessor and may
//! substitute it, and the final event drives the operation. Fan-out hooks run
//! their handlers concurrently, return values are ignored and failures are
//! only logged.
//!
//! Registration happens during plugin load, afterwards the registry is treated
//! as read-only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use futures::future::join_all;

use crate::errors::{DirectoryError, DirectoryResult};
use crate::ldap::model::{ChangeSet, Entry, RequestContext, SearchOpts};

pub const LDAP_SEARCH_OPTS: &str = "ldapSearchOpts";
pub const LDAP_SEARCH_REQUEST: &str = "ldapSearchRequest";
pub const LDAP_SEARCH_RESULT: &str = "ldapSearchResult";
pub const LDAP_ADD_REQUEST: &str = "ldapAddRequest";
pub const LDAP_ADD_DONE: &str = "ldapAddDone";
pub const LDAP_MODIFY_REQUEST: &str = "ldapModifyRequest";
pub const LDAP_MODIFY_DONE: &str = "ldapModifyDone";
pub const LDAP_RENAME_REQUEST: &str = "ldapRenameRequest";
pub const LDAP_RENAME_DONE: &str = "ldapRenameDone";
pub const LDAP_MOVE_DONE: &str = "ldapMoveDone";
pub const LDAP_DELETE_REQUEST: &str = "ldapDeleteRequest";
pub const LDAP_DELETE_DONE: &str = "ldapDeleteDone";

/// The payload passed through a hook, tagged per operation.
#[derive(Clone, Debug)]
pub enum HookEvent {
    SearchOpts {
        opts: SearchOpts,
    },
    SearchRequest {
        base: String,
        opts: SearchOpts,
        ctx: RequestContext,
    },
    SearchResult {
        entries: Vec<Entry>,
    },
    AddRequest {
        dn: String,
        entry: Entry,
        ctx: RequestContext,
    },
    AddDone {
        dn: String,
        entry: Entry,
    },
    ModifyRequest {
        dn: String,
        changes: ChangeSet,
        operation: u64,
        ctx: RequestContext,
    },
    ModifyDone {
        dn: String,
        changes: ChangeSet,
        operation: u64,
    },
    RenameRequest {
        dn: String,
        new_rdn: String,
        ctx: RequestContext,
    },
    RenameDone {
        dn: String,
        new_dn: String,
    },
    MoveDone {
        dn: String,
        new_dn: String,
    },
    DeleteRequest {
        dns: Vec<String>,
        ctx: RequestContext,
    },
    DeleteDone {
        dn: String,
    },
}

impl HookEvent {
    fn shape(&self) -> &'static str {
        use HookEvent::*;
        match self {
            SearchOpts { .. } => "SearchOpts",
            SearchRequest { .. } => "SearchRequest",
            SearchResult { .. } => "SearchResult",
            AddRequest { .. } => "AddRequest",
            AddDone { .. } => "AddDone",
            ModifyRequest { .. } => "ModifyRequest",
            ModifyDone { .. } => "ModifyDone",
            RenameRequest { .. } => "RenameRequest",
            RenameDone { .. } => "RenameDone",
            MoveDone { .. } => "MoveDone",
            DeleteRequest { .. } => "DeleteRequest",
            DeleteDone { .. } => "DeleteDone",
        }
    }

    fn unexpected(self, expected: &str) -> DirectoryError {
        DirectoryError::Internal(format!(
            "expected a {} hook event, a handler produced {}",
            expected,
            self.shape()
        ))
    }

    pub fn into_search_request(self) -> DirectoryResult<(String, SearchOpts, RequestContext)> {
        match self {
            HookEvent::SearchRequest { base, opts, ctx } => Ok((base, opts, ctx)),
            other => Err(other.unexpected("SearchRequest")),
        }
    }

    pub fn into_search_opts(self) -> DirectoryResult<SearchOpts> {
        match self {
            HookEvent::SearchOpts { opts } => Ok(opts),
            other => Err(other.unexpected("SearchOpts")),
        }
    }

    pub fn into_search_result(self) -> DirectoryResult<Vec<Entry>> {
        match self {
            HookEvent::SearchResult { entries } => Ok(entries),
            other => Err(other.unexpected("SearchResult")),
        }
    }

    pub fn into_add_request(self) -> DirectoryResult<(String, Entry, RequestContext)> {
        match self {
            HookEvent::AddRequest { dn, entry, ctx } => Ok((dn, entry, ctx)),
            other => Err(other.unexpected("AddRequest")),
        }
    }

    pub fn into_modify_request(
        self,
    ) -> DirectoryResult<(String, ChangeSet, u64, RequestContext)> {
        match self {
            HookEvent::ModifyRequest {
                dn,
                changes,
                operation,
                ctx,
            } => Ok((dn, changes, operation, ctx)),
            other => Err(other.unexpected("ModifyRequest")),
        }
    }

    pub fn into_rename_request(self) -> DirectoryResult<(String, String, RequestContext)> {
        match self {
            HookEvent::RenameRequest { dn, new_rdn, ctx } => Ok((dn, new_rdn, ctx)),
            other => Err(other.unexpected("RenameRequest")),
        }
    }

    pub fn into_delete_request(self) -> DirectoryResult<(Vec<String>, RequestContext)> {
        match self {
            HookEvent::DeleteRequest { dns, ctx } => Ok((dns, ctx)),
            other => Err(other.unexpected("DeleteRequest")),
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A handler of a chained hook, transforming the event or aborting the operation.
pub type ChainedHandler =
    Arc<dyn Fn(HookEvent) -> BoxFuture<DirectoryResult<HookEvent>> + Send + Sync>;

/// A handler of a fan-out hook, side effects only.
pub type FanoutHandler =
    Arc<dyn Fn(HookEvent) -> BoxFuture<DirectoryResult<()>> + Send + Sync>;

/// Wrap an async closure into a [ChainedHandler].
pub fn chained<F, Fut>(handler: F) -> ChainedHandler
where
    F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DirectoryResult<HookEvent>> + Send + 'static,
{
    Arc::new(move |event| -> BoxFuture<DirectoryResult<HookEvent>> {
        Box::pin(handler(event))
    })
}

/// Wrap an async closure into a [FanoutHandler].
pub fn fanout<F, Fut>(handler: F) -> FanoutHandler
where
    F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DirectoryResult<()>> + Send + 'static,
{
    Arc::new(move |event| -> BoxFuture<DirectoryResult<()>> { Box::pin(handler(event)) })
}

/// The registry of all named extension points.
#[derive(Default)]
pub struct HookRegistry {
    chained: RwLock<HashMap<String, Vec<ChainedHandler>>>,
    fanout: RwLock<HashMap<String, Vec<FanoutHandler>>>,
}

impl HookRegistry {
    pub fn register_chained(&self, hook: &str, handler: ChainedHandler) {
        self.chained
            .write()
            .expect("hook registry")
            .entry(hook.to_string())
            .or_default()
            .push(handler);
    }

    pub fn register_fanout(&self, hook: &str, handler: FanoutHandler) {
        self.fanout
            .write()
            .expect("hook registry")
            .entry(hook.to_string())
            .or_default()
            .push(handler);
    }

    /// Run all handlers of the chained hook in registration order.
    ///
    /// Each handler receives the event produced by its predecessor, the final
    /// event is returned. The first failing handler aborts the chain, errors
    /// outside of the engine taxonomy are wrapped as `HOOK_REJECTED`.
    pub async fn launch_hooks_chained(
        &self,
        hook: &str,
        event: HookEvent,
    ) -> DirectoryResult<HookEvent> {
        let handlers = self
            .chained
            .read()
            .expect("hook registry")
            .get(hook)
            .cloned()
            .unwrap_or_default();
        let mut current = event;
        for handler in handlers {
            current = handler(current).await.map_err(|error| match error {
                DirectoryError::Internal(message) => DirectoryError::HookRejected {
                    hook: hook.to_string(),
                    message,
                },
                taxonomy => taxonomy,
            })?;
        }
        Ok(current)
    }

    /// Run all handlers of the fan-out hook concurrently.
    /// Failures are logged, never surfaced.
    pub async fn launch_hooks(&self, hook: &str, event: HookEvent) {
        let handlers = self
            .fanout
            .read()
            .expect("hook registry")
            .get(hook)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            return;
        }
        let launches = handlers.iter().map(|handler| handler(event.clone()));
        for result in join_all(launches).await {
            if let Err(error) = result {
                warn!("post hook '{}' failed: {}", hook, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opts_event(filter: &str) -> HookEvent {
        HookEvent::SearchOpts {
            opts: SearchOpts::sub(filter),
        }
    }

    #[rocket::async_test]
    async fn chained_handlers_run_in_registration_order() {
        let registry = HookRegistry::default();
        registry.register_chained(
            "test",
            chained(|event| async move {
                let mut opts = event.into_search_opts()?;
                opts.filter.push('a');
                Ok(HookEvent::SearchOpts { opts })
            }),
        );
        registry.register_chained(
            "test",
            chained(|event| async move {
                let mut opts = event.into_search_opts()?;
                opts.filter.push('b');
                Ok(HookEvent::SearchOpts { opts })
            }),
        );
        let result = registry
            .launch_hooks_chained("test", opts_event("x"))
            .await
            .expect("chained result");
        assert_eq!(result.into_search_opts().expect("opts").filter, "xab");
    }

    #[rocket::async_test]
    async fn chained_handler_failure_aborts_the_chain() {
        let registry = HookRegistry::default();
        registry.register_chained(
            "test",
            chained(|_| async move {
                Err(DirectoryError::Internal("nope".to_string()))
            }),
        );
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_clone = reached.clone();
        registry.register_chained(
            "test",
            chained(move |event| {
                let reached = reached_clone.clone();
                async move {
                    reached.fetch_add(1, Ordering::SeqCst);
                    Ok(event)
                }
            }),
        );
        let result = registry.launch_hooks_chained("test", opts_event("x")).await;
        assert!(matches!(
            result,
            Err(DirectoryError::HookRejected { .. })
        ));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[rocket::async_test]
    async fn taxonomy_errors_pass_through_unwrapped() {
        let registry = HookRegistry::default();
        registry.register_chained(
            "test",
            chained(|_| async move {
                Err(DirectoryError::PermissionDenied {
                    base: "ou=b,dc=ex".to_string(),
                })
            }),
        );
        let result = registry.launch_hooks_chained("test", opts_event("x")).await;
        assert!(matches!(
            result,
            Err(DirectoryError::PermissionDenied { .. })
        ));
    }

    #[rocket::async_test]
    async fn fanout_failures_are_swallowed() {
        let registry = HookRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        registry.register_fanout(
            "done",
            fanout(|_| async move { Err(DirectoryError::Internal("ignored".to_string())) }),
        );
        registry.register_fanout(
            "done",
            fanout(move |_| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        registry.launch_hooks("done", opts_event("x")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[rocket::async_test]
    async fn launching_an_unregistered_hook_is_a_no_op() {
        let registry = HookRegistry::default();
        let result = registry
            .launch_hooks_chained("unknown", opts_event("x"))
            .await
            .expect("unchanged event");
        assert_eq!(result.into_search_opts().expect("opts").filter, "x");
    }
}

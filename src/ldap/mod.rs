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

//! The single mediation point for every operation against the directory server.
//!
//! Every verb runs its chained request hooks first, then performs the wire
//! operation through a pooled connection under the process wide concurrency
//! limiter, invalidates the affected cache keys and finally launches its
//! fan-out done hooks. Done hooks are fire-and-forget, their failures are
//! logged by the registry and never surfaced to the caller.

pub mod cache;
pub mod dn;
pub mod model;
pub mod pool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{SearchEntry, SearchStream};
use rocket::tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{comma_list, Config};
use crate::errors::{DirectoryError, DirectoryResult};
use crate::hooks::{self, HookEvent, HookRegistry};
use crate::ldap::cache::SearchCache;
use crate::ldap::model::{ChangeSet, Entry, RequestContext, SearchOpts, SearchScope};
use crate::ldap::pool::{ConnectionPool, PooledConnection};

pub struct LdapClient {
    base: String,
    user_main_attribute: String,
    default_object_class: Vec<String>,
    time_limit: Duration,
    pool: ConnectionPool,
    cache: SearchCache,
    limiter: Arc<Semaphore>,
    hooks: Arc<HookRegistry>,
    operation_counter: AtomicU64,
}

impl LdapClient {
    pub fn new(config: &Config, hooks: Arc<HookRegistry>) -> Self {
        let ldap = &config.ldap;
        Self {
            base: ldap.base.clone(),
            user_main_attribute: ldap.user_main_attribute.clone(),
            default_object_class: comma_list(&ldap.default_object_class),
            time_limit: Duration::from_secs(ldap.time_limit),
            pool: ConnectionPool::new(ldap),
            cache: SearchCache::new(ldap.cache_max, Duration::from_secs(ldap.cache_ttl)),
            limiter: Arc::new(Semaphore::new(ldap.query_concurrency.max(1))),
            hooks,
            operation_counter: AtomicU64::new(0),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Expand a bare identifier or partial dn into a full dn, see [dn::normalize].
    pub fn normalize_dn(&self, id_or_dn: &str) -> String {
        dn::normalize(id_or_dn, &self.user_main_attribute, &self.base)
    }

    async fn permit(&self) -> DirectoryResult<OwnedSemaphorePermit> {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DirectoryError::Internal("query limiter closed".to_string()))
    }

    /// Run the search hooks and resolve the effective base and options.
    async fn prepare_search(
        &self,
        opts: SearchOpts,
        base: Option<&str>,
        ctx: &RequestContext,
    ) -> DirectoryResult<(String, SearchOpts)> {
        let base = base
            .map(|base| self.normalize_dn(base))
            .unwrap_or_else(|| self.base.clone());
        let opts = self
            .hooks
            .launch_hooks_chained(hooks::LDAP_SEARCH_OPTS, HookEvent::SearchOpts { opts })
            .await?
            .into_search_opts()?;
        let (base, opts, _ctx) = self
            .hooks
            .launch_hooks_chained(
                hooks::LDAP_SEARCH_REQUEST,
                HookEvent::SearchRequest {
                    base,
                    opts,
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_search_request()?;
        Ok((base, opts))
    }

    /// Search the directory.
    ///
    /// Results of non-paged base scope lookups are cached, every other shape
    /// goes to the wire. For paged searches use [LdapClient::search_paged].
    pub async fn search(
        &self,
        opts: SearchOpts,
        base: Option<&str>,
        ctx: &RequestContext,
    ) -> DirectoryResult<Vec<Entry>> {
        let (base, opts) = self.prepare_search(opts, base, ctx).await?;
        let cacheable = opts.scope == SearchScope::Base && opts.paged.is_none();
        let key = SearchCache::key(&base, opts.scope, &opts.filter, opts.attributes.as_deref());
        if cacheable {
            if let Some(hit) = self.cache.get(&key) {
                debug!("cache hit for '{}'", key);
                return Ok(hit);
            }
        }
        let entries = self.wire_search(&base, &opts).await?;
        let entries = self
            .hooks
            .launch_hooks_chained(hooks::LDAP_SEARCH_RESULT, HookEvent::SearchResult { entries })
            .await?
            .into_search_result()?;
        if cacheable {
            self.cache.put(key, entries.clone());
        }
        Ok(entries)
    }

    /// A base scope lookup of a single entry, `None` when it does not exist.
    pub async fn find(
        &self,
        id_or_dn: &str,
        ctx: &RequestContext,
    ) -> DirectoryResult<Option<Entry>> {
        match self.search(SearchOpts::base(), Some(id_or_dn), ctx).await {
            Ok(mut entries) => Ok(if entries.is_empty() {
                None
            } else {
                Some(entries.swap_remove(0))
            }),
            Err(DirectoryError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn wire_search(&self, base: &str, opts: &SearchOpts) -> DirectoryResult<Vec<Entry>> {
        let _permit = self.permit().await?;
        let mut conn = self.pool.acquire().await?;
        let attributes = opts
            .attributes
            .clone()
            .unwrap_or_else(|| vec!["*".to_string()]);
        let (entries, _result) = conn
            .ldap()
            .with_timeout(self.time_limit)
            .search(base, opts.scope.to_ldap(), &opts.filter, attributes)
            .await?
            .success()?;
        Ok(entries
            .into_iter()
            .map(|entry| Entry::from_search_entry(SearchEntry::construct(entry)))
            .collect())
    }

    /// Search the directory with a lazily streamed, paged result.
    ///
    /// The returned stream owns its pooled connection and concurrency permit
    /// until it is exhausted, finished early or dropped. Paged results are
    /// never cached.
    pub async fn search_paged(
        &self,
        opts: SearchOpts,
        base: Option<&str>,
        ctx: &RequestContext,
    ) -> DirectoryResult<PagedSearch> {
        let (base, opts) = self.prepare_search(opts, base, ctx).await?;
        let page_size = opts.paged.unwrap_or(500);
        let permit = self.permit().await?;
        let mut conn = self.pool.acquire().await?;
        let attributes = opts
            .attributes
            .clone()
            .unwrap_or_else(|| vec!["*".to_string()]);
        let adapters: Vec<Box<dyn Adapter<String, Vec<String>>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(page_size)),
        ];
        let stream = conn
            .ldap()
            .with_timeout(self.time_limit)
            .streaming_search_with(adapters, &base, opts.scope.to_ldap(), &opts.filter, attributes)
            .await?;
        Ok(PagedSearch {
            stream,
            _conn: conn,
            _permit: permit,
        })
    }

    /// Add an entry to the directory.
    ///
    /// Missing object classes are filled in from the configured default.
    pub async fn add(&self, dn: &str, entry: Entry, ctx: &RequestContext) -> DirectoryResult<()> {
        let dn = self.normalize_dn(dn);
        let (dn, mut entry, _ctx) = self
            .hooks
            .launch_hooks_chained(
                hooks::LDAP_ADD_REQUEST,
                HookEvent::AddRequest {
                    dn,
                    entry,
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_add_request()?;
        if entry.object_classes().is_empty() && !self.default_object_class.is_empty() {
            entry.set("objectClass", self.default_object_class.clone());
        }
        let outcome = self.wire_add(&dn, &entry).await;
        // conservative: drop cached results for the dn even when the write failed
        self.cache.invalidate(&dn);
        outcome?;
        info!("added '{}'", dn);
        self.hooks
            .launch_hooks(hooks::LDAP_ADD_DONE, HookEvent::AddDone { dn, entry })
            .await;
        Ok(())
    }

    async fn wire_add(&self, dn: &str, entry: &Entry) -> DirectoryResult<()> {
        let _permit = self.permit().await?;
        let mut conn = self.pool.acquire().await?;
        conn.ldap()
            .with_timeout(self.time_limit)
            .add(dn, entry.to_add_attributes())
            .await?
            .success()?;
        Ok(())
    }

    /// Modify an entry.
    ///
    /// Returns `false` when the hook chain leaves no changes to perform, in
    /// which case the done hooks still observe the empty change set.
    pub async fn modify(
        &self,
        dn: &str,
        changes: ChangeSet,
        ctx: &RequestContext,
    ) -> DirectoryResult<bool> {
        let dn = self.normalize_dn(dn);
        let operation = self.operation_counter.fetch_add(1, Ordering::SeqCst);
        let (dn, changes, operation, _ctx) = self
            .hooks
            .launch_hooks_chained(
                hooks::LDAP_MODIFY_REQUEST,
                HookEvent::ModifyRequest {
                    dn,
                    changes,
                    operation,
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_modify_request()?;
        if changes.is_empty() {
            warn!("modify of '{}' has no remaining changes (op {})", dn, operation);
            self.hooks
                .launch_hooks(
                    hooks::LDAP_MODIFY_DONE,
                    HookEvent::ModifyDone {
                        dn,
                        changes: ChangeSet::default(),
                        operation,
                    },
                )
                .await;
            return Ok(false);
        }
        let outcome = self.wire_modify(&dn, &changes).await;
        self.cache.invalidate(&dn);
        outcome?;
        info!("modified '{}' (op {})", dn, operation);
        self.hooks
            .launch_hooks(
                hooks::LDAP_MODIFY_DONE,
                HookEvent::ModifyDone {
                    dn,
                    changes,
                    operation,
                },
            )
            .await;
        Ok(true)
    }

    async fn wire_modify(&self, dn: &str, changes: &ChangeSet) -> DirectoryResult<()> {
        let _permit = self.permit().await?;
        let mut conn = self.pool.acquire().await?;
        conn.ldap()
            .with_timeout(self.time_limit)
            .modify(dn, changes.to_mods())
            .await?
            .success()?;
        Ok(())
    }

    /// Change the rdn of an entry within the same parent.
    /// Returns the new dn.
    pub async fn rename(
        &self,
        dn: &str,
        new_rdn: &str,
        ctx: &RequestContext,
    ) -> DirectoryResult<String> {
        let dn = self.normalize_dn(dn);
        let (dn, new_rdn, _ctx) = self
            .hooks
            .launch_hooks_chained(
                hooks::LDAP_RENAME_REQUEST,
                HookEvent::RenameRequest {
                    dn,
                    new_rdn: new_rdn.to_string(),
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_rename_request()?;
        let outcome = self.wire_rename(&dn, &new_rdn, None).await;
        self.cache.invalidate(&dn);
        outcome?;
        let new_dn = match dn::parent(&dn) {
            Some(parent) => format!("{},{}", new_rdn, parent),
            None => new_rdn.clone(),
        };
        self.cache.invalidate(&new_dn);
        info!("renamed '{}' to '{}'", dn, new_dn);
        self.hooks
            .launch_hooks(hooks::LDAP_RENAME_DONE, HookEvent::RenameDone { dn, new_dn: new_dn.clone() })
            .await;
        Ok(new_dn)
    }

    /// Move an entry below a new parent, possibly combined with an rdn change.
    /// The base layer runs no chained request hook for moves.
    pub async fn move_entry(&self, dn: &str, new_dn: &str) -> DirectoryResult<()> {
        let dn = self.normalize_dn(dn);
        let new_dn = self.normalize_dn(new_dn);
        let new_rdn = dn::rdn(&new_dn).to_string();
        let new_parent = dn::parent(&new_dn).map(|parent| parent.to_string());
        let outcome = self
            .wire_rename(&dn, &new_rdn, new_parent.as_deref())
            .await;
        self.cache.invalidate(&dn);
        outcome?;
        self.cache.invalidate(&new_dn);
        info!("moved '{}' to '{}'", dn, new_dn);
        self.hooks
            .launch_hooks(hooks::LDAP_MOVE_DONE, HookEvent::MoveDone { dn, new_dn })
            .await;
        Ok(())
    }

    async fn wire_rename(
        &self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
    ) -> DirectoryResult<()> {
        let _permit = self.permit().await?;
        let mut conn = self.pool.acquire().await?;
        conn.ldap()
            .with_timeout(self.time_limit)
            .modifydn(dn, new_rdn, true, new_superior)
            .await?
            .success()?;
        Ok(())
    }

    /// Delete one or more entries.
    ///
    /// The chained delete hook observes the whole batch and may shrink it,
    /// e.g. when the trash intercepts a dn. The first failing entry stops the
    /// batch, already deleted entries remain deleted.
    pub async fn delete(&self, dns: Vec<String>, ctx: &RequestContext) -> DirectoryResult<()> {
        let dns = dns
            .into_iter()
            .map(|dn| self.normalize_dn(&dn))
            .collect::<Vec<_>>();
        let (dns, _ctx) = self
            .hooks
            .launch_hooks_chained(
                hooks::LDAP_DELETE_REQUEST,
                HookEvent::DeleteRequest {
                    dns,
                    ctx: ctx.clone(),
                },
            )
            .await?
            .into_delete_request()?;
        for dn in dns {
            let outcome = self.wire_delete(&dn).await;
            self.cache.invalidate(&dn);
            outcome?;
            info!("deleted '{}'", dn);
            self.hooks
                .launch_hooks(hooks::LDAP_DELETE_DONE, HookEvent::DeleteDone { dn })
                .await;
        }
        Ok(())
    }

    async fn wire_delete(&self, dn: &str) -> DirectoryResult<()> {
        let _permit = self.permit().await?;
        let mut conn = self.pool.acquire().await?;
        conn.ldap()
            .with_timeout(self.time_limit)
            .delete(dn)
            .await?
            .success()?;
        Ok(())
    }
}

/// A lazily streamed, paged search result.
///
/// Owns its pooled connection and concurrency permit, both are released once
/// the stream is exhausted, finished or dropped.
pub struct PagedSearch {
    stream: SearchStream<'static, String, Vec<String>>,
    _conn: PooledConnection,
    _permit: OwnedSemaphorePermit,
}

impl PagedSearch {
    /// The next entry of the stream, `None` once it is exhausted.
    pub async fn next_entry(&mut self) -> DirectoryResult<Option<Entry>> {
        match self.stream.next().await? {
            Some(entry) => Ok(Some(Entry::from_search_entry(SearchEntry::construct(entry)))),
            None => Ok(None),
        }
    }

    /// Terminate the stream early and release its resources.
    pub async fn finish(mut self) -> DirectoryResult<()> {
        self.stream.finish().await.success()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> LdapClient {
        let mut config = Config::default();
        config.ldap.base = "dc=mvl,dc=at".to_string();
        config.ldap.user_main_attribute = "uid".to_string();
        LdapClient::new(&config, Arc::new(HookRegistry::default()))
    }

    #[test]
    fn bare_identifiers_are_expanded() {
        let client = client();
        assert_eq!(client.normalize_dn("karli"), "uid=karli,dc=mvl,dc=at");
        assert_eq!(client.normalize_dn("ou=members"), "ou=members,dc=mvl,dc=at");
        assert_eq!(
            client.normalize_dn("uid=karli,ou=members,dc=mvl,dc=at"),
            "uid=karli,ou=members,dc=mvl,dc=at"
        );
    }

    #[rocket::async_test]
    async fn an_empty_modify_short_circuits_without_wire_io() {
        let client = client();
        let performed = client
            .modify("karli", ChangeSet::default(), &RequestContext::system())
            .await
            .expect("empty modify");
        assert!(!performed);
        // no connection was ever created for the short circuit
        assert_eq!(client.pool.active(), 0);
    }

    #[rocket::async_test]
    async fn operation_numbers_increase_monotonically() {
        let client = client();
        let _ = client
            .modify("a", ChangeSet::default(), &RequestContext::system())
            .await;
        let _ = client
            .modify("b", ChangeSet::default(), &RequestContext::system())
            .await;
        assert_eq!(client.operation_counter.load(Ordering::SeqCst), 2);
    }
}

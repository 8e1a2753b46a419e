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

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings};
use rocket::tokio::time;

use crate::config::LdapConfig;
use crate::errors::{DirectoryError, DirectoryResult};

/// How long to wait for a free slot before looking again.
const REPOLL_INTERVAL: Duration = Duration::from_millis(50);

/// A bounded pool of bound directory connections.
///
/// Connections are created on demand up to the cap, reused while free and
/// swept once they have been idle for longer than the ttl. When the pool is
/// exhausted, acquisition re-polls every 50 ms. The pool is a cheap handle,
/// clones share the same slots.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    url: String,
    bind_dn: Option<String>,
    bind_password: Option<String>,
    size: usize,
    ttl: Duration,
    connect_timeout: Option<Duration>,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    creating: usize,
    next_id: u64,
}

struct Slot {
    id: u64,
    ldap: Ldap,
    busy: bool,
    last_used: Instant,
}

/// A connection checked out of the pool, returned on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    id: u64,
    ldap: Ldap,
}

impl PooledConnection {
    pub fn ldap(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

enum Acquisition {
    Ready(u64, Ldap),
    Create,
    Wait,
}

impl ConnectionPool {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                url: config.url.clone(),
                bind_dn: config.bind_dn.clone(),
                bind_password: config.bind_password.clone(),
                size: config.pool_size.max(1),
                ttl: Duration::from_secs(config.connection_ttl),
                connect_timeout: match config.connect_timeout {
                    0 => None,
                    seconds => Some(Duration::from_secs(seconds)),
                },
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Check a connection out of the pool, creating and binding one when
    /// below the cap, waiting otherwise.
    pub async fn acquire(&self) -> DirectoryResult<PooledConnection> {
        loop {
            let acquisition = {
                let mut state = self.inner.state.lock().expect("pool state");
                let ttl = self.inner.ttl;
                state
                    .slots
                    .retain(|slot| slot.busy || slot.last_used.elapsed() <= ttl);
                if let Some(slot) = state.slots.iter_mut().find(|slot| !slot.busy) {
                    slot.busy = true;
                    slot.last_used = Instant::now();
                    Acquisition::Ready(slot.id, slot.ldap.clone())
                } else if state.slots.len() + state.creating < self.inner.size {
                    state.creating += 1;
                    Acquisition::Create
                } else {
                    Acquisition::Wait
                }
            };
            match acquisition {
                Acquisition::Ready(id, ldap) => {
                    return Ok(PooledConnection {
                        pool: self.clone(),
                        id,
                        ldap,
                    })
                }
                Acquisition::Create => {
                    let created = self.connect().await;
                    let mut state = self.inner.state.lock().expect("pool state");
                    state.creating -= 1;
                    let ldap = created?;
                    let id = state.next_id;
                    state.next_id += 1;
                    state.slots.push(Slot {
                        id,
                        ldap: ldap.clone(),
                        busy: true,
                        last_used: Instant::now(),
                    });
                    return Ok(PooledConnection {
                        pool: self.clone(),
                        id,
                        ldap,
                    });
                }
                Acquisition::Wait => time::sleep(REPOLL_INTERVAL).await,
            }
        }
    }

    async fn connect(&self) -> DirectoryResult<Ldap> {
        debug!("open session to ldap server: {}", self.inner.url);
        let mut settings = LdapConnSettings::new();
        if let Some(timeout) = self.inner.connect_timeout {
            settings = settings.set_conn_timeout(timeout);
        }
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.inner.url)
            .await
            .map_err(|error| DirectoryError::Io(error.to_string()))?;
        ldap3::drive!(conn);
        match &self.inner.bind_dn {
            None => warn!("using ldap without user"),
            Some(user) => {
                debug!("bind ldap user with dn '{}'", user);
                ldap.simple_bind(user, self.inner.bind_password.as_deref().unwrap_or(""))
                    .await
                    .and_then(|result| result.success())
                    .map_err(|error| DirectoryError::BindFailed(error.to_string()))?;
            }
        }
        Ok(ldap)
    }

    fn release(&self, id: u64) {
        let mut state = self.inner.state.lock().expect("pool state");
        if let Some(slot) = state.slots.iter_mut().find(|slot| slot.id == id) {
            slot.busy = false;
            slot.last_used = Instant::now();
        }
    }

    /// The amount of currently pooled connections, busy or idle.
    pub fn active(&self) -> usize {
        self.inner.state.lock().expect("pool state").slots.len()
    }
}

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

//! The host which loads all compiled-in plugins.
//!
//! A plugin binds hook handlers to the registry during its initialization.
//! Load order honors the declared dependencies via a topological sort, the
//! registration order of independent plugins is kept stable.

/// Module which propagates completed writes to external collaborators.
pub mod webhook;

use std::collections::HashSet;
use std::sync::Arc;

use crate::directory::entity::FlatEntitySet;
use crate::errors::{DirectoryError, DirectoryResult};
use crate::hooks::HookRegistry;
use crate::ldap::LdapClient;
use crate::schema::SchemaStore;

/// Everything a plugin may bind against.
#[derive(Clone)]
pub struct PluginCore {
    pub hooks: Arc<HookRegistry>,
    pub ldap: Arc<LdapClient>,
    pub schemas: Arc<SchemaStore>,
    pub entities: Arc<FlatEntitySet>,
}

/// The capability set every plugin implements.
#[rocket::async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// The unique name other plugins may depend on.
    fn name(&self) -> &'static str;

    /// Free-form capability tags, e.g. `consistency` or `propagation`.
    fn roles(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Names of plugins which must load before this one.
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Bind hooks and perform startup work.
    async fn init(self: Arc<Self>, core: &PluginCore) -> DirectoryResult<()>;
}

/// The host owning all plugins for the process lifetime.
#[derive(Default)]
pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// The plugins in dependency order.
    ///
    /// Unknown dependencies and cycles are configuration errors.
    pub fn load_order(&self) -> DirectoryResult<Vec<Arc<dyn Plugin>>> {
        let known: HashSet<&str> = self.plugins.iter().map(|plugin| plugin.name()).collect();
        for plugin in &self.plugins {
            for dependency in plugin.dependencies() {
                if !known.contains(dependency) {
                    return Err(DirectoryError::ConfigInvalid(format!(
                        "plugin '{}' depends on the unknown plugin '{}'",
                        plugin.name(),
                        dependency
                    )));
                }
            }
        }
        let mut ordered: Vec<Arc<dyn Plugin>> = Vec::with_capacity(self.plugins.len());
        let mut placed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<Arc<dyn Plugin>> = self.plugins.clone();
        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .enumerate()
                .filter(|(_, plugin)| {
                    plugin
                        .dependencies()
                        .iter()
                        .all(|dependency| placed.contains(dependency))
                })
                .map(|(index, _)| index)
                .collect();
            if ready.is_empty() {
                let names: Vec<&str> = remaining.iter().map(|plugin| plugin.name()).collect();
                return Err(DirectoryError::ConfigInvalid(format!(
                    "cyclic plugin dependencies among: {}",
                    names.join(", ")
                )));
            }
            // remove back to front so the indices stay valid, then restore
            // the registration order of the batch
            let mut batch: Vec<Arc<dyn Plugin>> = ready
                .into_iter()
                .rev()
                .map(|index| remaining.remove(index))
                .collect();
            batch.reverse();
            for plugin in batch {
                placed.insert(plugin.name());
                ordered.push(plugin);
            }
        }
        Ok(ordered)
    }

    /// Initialize all plugins in dependency order.
    pub async fn load(&self, core: &PluginCore) -> DirectoryResult<()> {
        for plugin in self.load_order()? {
            info!(
                "loading plugin '{}' (roles: {})",
                plugin.name(),
                plugin.roles().join(", ")
            );
            plugin.clone().init(core).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        dependencies: Vec<&'static str>,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[rocket::async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> Vec<&'static str> {
            self.dependencies.clone()
        }

        async fn init(self: Arc<Self>, _core: &PluginCore) -> DirectoryResult<()> {
            self.order.lock().expect("order").push(self.name);
            Ok(())
        }
    }

    fn host(
        order: &Arc<Mutex<Vec<&'static str>>>,
        plugins: Vec<(&'static str, Vec<&'static str>)>,
    ) -> PluginHost {
        let mut host = PluginHost::new();
        for (name, dependencies) in plugins {
            host.register(Arc::new(Recorder {
                name,
                dependencies,
                order: order.clone(),
            }));
        }
        host
    }

    #[test]
    fn dependencies_load_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let host = host(
            &order,
            vec![("trash", vec!["org"]), ("org", vec!["authz"]), ("authz", vec![])],
        );
        let names: Vec<&str> = host
            .load_order()
            .expect("load order")
            .iter()
            .map(|plugin| plugin.name())
            .collect();
        assert_eq!(names, vec!["authz", "org", "trash"]);
    }

    #[test]
    fn independent_plugins_keep_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let host = host(&order, vec![("a", vec![]), ("b", vec![]), ("c", vec![])]);
        let names: Vec<&str> = host
            .load_order()
            .expect("load order")
            .iter()
            .map(|plugin| plugin.name())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_dependencies_are_fatal() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let host = host(&order, vec![("a", vec!["ghost"])]);
        assert!(matches!(
            host.load_order(),
            Err(DirectoryError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn cycles_are_fatal() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let host = host(&order, vec![("a", vec!["b"]), ("b", vec!["a"])]);
        assert!(matches!(
            host.load_order(),
            Err(DirectoryError::ConfigInvalid(_))
        ));
    }
}

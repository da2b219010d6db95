//! Component M — Plugin Loader / Feature Publisher.
//!
//! Per-process singleton owning loaded plugin packages. The loader is
//! language-agnostic: a [`PluginRuntime`] implementation decides how a path
//! actually becomes a [`PluginPackage`] (loading a dynamic library, spawning
//! an out-of-process worker, or — as in the in-workspace test fixture —
//! constructing a value directly). Feature objects the loader publishes are
//! allocated through the real [`ObjectManager`], not a private counter, so
//! generation bookkeeping stays consistent process-wide (SPEC_FULL.md §9).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{IpcError, Result, S_FALSE, S_OK};
use crate::object_id::{Guid, ObjectId};
use crate::object_manager::ObjectManager;
use crate::registry::RemoteObjectRegistry;

/// Features a plugin package can expose, matching the fixed name→IID table
/// of §4.M. The enumerator spellings are the names packages are expected to
/// answer to from `enum_feature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    CaptureFactory,
    ErrorLens,
    Task,
    InputFactory,
    ComponentFactory,
}

impl Feature {
    pub fn name(self) -> &'static str {
        match self {
            Feature::CaptureFactory => "CAPTURE_FACTORY",
            Feature::ErrorLens => "ERROR_LENS",
            Feature::Task => "TASK",
            Feature::InputFactory => "INPUT_FACTORY",
            Feature::ComponentFactory => "COMPONENT_FACTORY",
        }
    }

    /// The interface `Guid` this feature publishes under. These constants
    /// have no upstream literal value to ground against — the original
    /// codebase only ever expresses them as `DasIidOf<T>()` template calls —
    /// so they are invented here and must stay stable once a peer depends on
    /// them (see DESIGN.md).
    pub fn interface_iid(self) -> Guid {
        match self {
            Feature::CaptureFactory => Guid::new(0x0001_0001, 0, 1, *b"DasCapF\0"),
            Feature::ErrorLens => Guid::new(0x0001_0002, 0, 1, *b"DasErrL\0"),
            Feature::Task => Guid::new(0x0001_0003, 0, 1, *b"DasTask\0"),
            Feature::InputFactory => Guid::new(0x0001_0004, 0, 1, *b"DasInpF\0"),
            Feature::ComponentFactory => Guid::new(0x0001_0005, 0, 1, *b"DasCmpF\0"),
        }
    }
}

/// One feature a loaded package offers, as created by
/// [`PluginPackage::create_feature_interface`].
pub struct FeatureInterface {
    pub feature: Feature,
    pub object: Arc<dyn Any + Send + Sync>,
}

/// Collaborator contract a plugin package must implement, regardless of
/// which language or process actually hosts it (§4.M, §9).
pub trait PluginPackage: Send + Sync {
    /// Return the feature at `index`, or `None` once the package has no more
    /// to enumerate.
    fn enum_feature(&self, index: usize) -> Option<Feature>;

    /// Materialize the feature at `index`. Distinct from `enum_feature` so a
    /// package can enumerate cheaply and only pay construction cost for
    /// features the loader actually registers.
    fn create_feature_interface(&self, index: usize) -> Result<FeatureInterface>;

    /// Whether the package consents to being unloaded right now (e.g. no
    /// outstanding feature object is still in use).
    fn can_unload_now(&self) -> bool;

    /// Narrow a previously created feature object to `iid`, or `None` if it
    /// doesn't support that interface.
    fn query_interface(&self, object: &Arc<dyn Any + Send + Sync>, iid: Guid) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Pluggable language back-end: turns a path into a loaded package. The
/// loader itself never assumes a particular plugin ABI.
pub trait PluginRuntime: Send + Sync {
    fn load_plugin(&self, path: &str) -> Result<Arc<dyn PluginPackage>>;
}

struct RegisteredFeature {
    feature: Feature,
    object_id: ObjectId,
}

struct LoadedPlugin {
    package: Arc<dyn PluginPackage>,
    registered: Vec<RegisteredFeature>,
}

/// Weakly-canonicalize a path for de-duplication: collapse `.`/`..`
/// segments and redundant separators without touching the filesystem (the
/// path may not exist yet in a test harness).
fn weakly_canonical(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let joined = out.join("/");
    if path.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Per-process plugin loader (§4.M). Must be [`initialize`](Self::initialize)d
/// before `load_plugin` is called.
pub struct PluginLoader {
    object_manager: Arc<ObjectManager>,
    registry: Arc<RemoteObjectRegistry>,
    runtime: Arc<dyn PluginRuntime>,
    local_session_id: u16,
    plugins: Mutex<HashMap<String, LoadedPlugin>>,
}

impl PluginLoader {
    pub fn new(
        local_session_id: u16,
        object_manager: Arc<ObjectManager>,
        registry: Arc<RemoteObjectRegistry>,
        runtime: Arc<dyn PluginRuntime>,
    ) -> Self {
        Self {
            object_manager,
            registry,
            runtime,
            local_session_id,
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Load the package at `path`. Returns `S_FALSE` (via `Ok`) without
    /// creating a second package if `path` (after weak canonicalization) is
    /// already loaded.
    pub fn load_plugin(&self, path: &str) -> Result<i32> {
        let key = weakly_canonical(path);
        if self.plugins.lock().contains_key(&key) {
            return Ok(S_FALSE);
        }
        let package = self.runtime.load_plugin(path)?;
        self.plugins.lock().insert(
            key,
            LoadedPlugin {
                package,
                registered: Vec::new(),
            },
        );
        Ok(S_OK)
    }

    pub fn is_loaded(&self, path: &str) -> bool {
        self.plugins.lock().contains_key(&weakly_canonical(path))
    }

    /// Enumerate and register every feature the package at `path` offers.
    /// A single feature's creation failing does not abort the rest — each
    /// failure is recorded via `tracing::warn!` and registration continues.
    pub fn register_plugin_objects(&self, path: &str) -> Result<usize> {
        let key = weakly_canonical(path);
        let package = {
            let plugins = self.plugins.lock();
            let loaded = plugins.get(&key).ok_or(IpcError::ObjectNotFound)?;
            Arc::clone(&loaded.package)
        };

        let mut registered_count = 0;
        let mut index = 0;
        while let Some(feature) = package.enum_feature(index) {
            match package.create_feature_interface(index) {
                Ok(feature_interface) => {
                    let object_id = self.object_manager.register_local(feature_interface.object);
                    let iid = feature.interface_iid();
                    if let Err(e) = self.registry.register(object_id, iid, None, self.local_session_id, feature.name(), 1) {
                        tracing::warn!(feature = feature.name(), error = %e, "failed to register plugin feature in registry");
                        self.object_manager.unregister(object_id);
                    } else {
                        self.plugins
                            .lock()
                            .get_mut(&key)
                            .expect("plugin still loaded")
                            .registered
                            .push(RegisteredFeature { feature, object_id });
                        registered_count += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "plugin feature creation failed, continuing with remaining features");
                }
            }
            index += 1;
        }
        Ok(registered_count)
    }

    /// Reverse `register_plugin_objects`: unregister every feature object
    /// this package published.
    pub fn unregister_plugin_objects(&self, path: &str) -> Result<()> {
        let key = weakly_canonical(path);
        let mut plugins = self.plugins.lock();
        let loaded = plugins.get_mut(&key).ok_or(IpcError::ObjectNotFound)?;
        for registered in loaded.registered.drain(..) {
            let _ = self.registry.unregister(registered.object_id);
            self.object_manager.unregister(registered.object_id);
        }
        Ok(())
    }

    /// Unregister any remaining features and drop the package, refusing if
    /// it reports it is still busy.
    pub fn unload_plugin(&self, path: &str) -> Result<()> {
        let key = weakly_canonical(path);
        let busy = {
            let plugins = self.plugins.lock();
            let loaded = plugins.get(&key).ok_or(IpcError::ObjectNotFound)?;
            !loaded.package.can_unload_now()
        };
        if busy {
            return Err(IpcError::InvalidState);
        }
        self.unregister_plugin_objects(path)?;
        self.plugins.lock().remove(&key);
        Ok(())
    }

    /// Resolve a published feature by name, narrowed to `iid` via the
    /// package's own query primitive.
    pub fn get_object_by_feature(&self, path: &str, name: &str, iid: Guid) -> Result<Arc<dyn Any + Send + Sync>> {
        let key = weakly_canonical(path);
        let plugins = self.plugins.lock();
        let loaded = plugins.get(&key).ok_or(IpcError::ObjectNotFound)?;
        let registered = loaded
            .registered
            .iter()
            .find(|r| r.feature.name() == name)
            .ok_or(IpcError::NoInterface)?;

        match self.object_manager.lookup(registered.object_id) {
            crate::object_manager::LookupResult::Local(object) => {
                loaded.package.query_interface(&object, iid).ok_or(IpcError::NoInterface)
            }
            crate::object_manager::LookupResult::Stale => Err(IpcError::StaleObjectHandle),
            _ => Err(IpcError::ObjectNotFound),
        }
    }

    pub fn loaded_paths(&self) -> Vec<String> {
        self.plugins.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTask(i32);

    struct SingleFeaturePackage {
        feature: Feature,
    }

    impl PluginPackage for SingleFeaturePackage {
        fn enum_feature(&self, index: usize) -> Option<Feature> {
            (index == 0).then_some(self.feature)
        }

        fn create_feature_interface(&self, index: usize) -> Result<FeatureInterface> {
            if index != 0 {
                return Err(IpcError::OutOfRange);
            }
            Ok(FeatureInterface {
                feature: self.feature,
                object: Arc::new(EchoTask(0)),
            })
        }

        fn can_unload_now(&self) -> bool {
            true
        }

        fn query_interface(&self, object: &Arc<dyn Any + Send + Sync>, iid: Guid) -> Option<Arc<dyn Any + Send + Sync>> {
            if iid == self.feature.interface_iid() {
                Some(Arc::clone(object))
            } else {
                None
            }
        }
    }

    struct FixedRuntime;

    impl PluginRuntime for FixedRuntime {
        fn load_plugin(&self, _path: &str) -> Result<Arc<dyn PluginPackage>> {
            Ok(Arc::new(SingleFeaturePackage { feature: Feature::Task }))
        }
    }

    fn loader() -> PluginLoader {
        PluginLoader::new(
            1,
            Arc::new(ObjectManager::new(1)),
            Arc::new(RemoteObjectRegistry::new()),
            Arc::new(FixedRuntime),
        )
    }

    #[test]
    fn load_register_fetch_unload_round_trip() {
        let loader = loader();
        assert_eq!(loader.load_plugin("/plugins/task.so").unwrap(), S_OK);
        assert!(loader.is_loaded("/plugins/task.so"));

        let registered = loader.register_plugin_objects("/plugins/task.so").unwrap();
        assert_eq!(registered, 1);

        let object = loader
            .get_object_by_feature("/plugins/task.so", "TASK", Feature::Task.interface_iid())
            .unwrap();
        assert!(object.downcast_ref::<EchoTask>().is_some());

        loader.unload_plugin("/plugins/task.so").unwrap();
        assert!(!loader.is_loaded("/plugins/task.so"));
    }

    #[test]
    fn loading_the_same_weakly_canonical_path_twice_is_s_false() {
        let loader = loader();
        assert_eq!(loader.load_plugin("/plugins/./task.so").unwrap(), S_OK);
        assert_eq!(loader.load_plugin("/plugins/sub/../task.so").unwrap(), S_FALSE);
    }

    #[test]
    fn get_object_by_feature_before_registration_fails() {
        let loader = loader();
        loader.load_plugin("/plugins/task.so").unwrap();
        assert_eq!(
            loader.get_object_by_feature("/plugins/task.so", "TASK", Feature::Task.interface_iid()),
            Err(IpcError::NoInterface)
        );
    }

    #[test]
    fn unknown_path_operations_are_object_not_found() {
        let loader = loader();
        assert_eq!(loader.register_plugin_objects("/nowhere"), Err(IpcError::ObjectNotFound));
        assert_eq!(loader.unload_plugin("/nowhere"), Err(IpcError::ObjectNotFound));
    }

    #[test]
    fn one_failing_feature_does_not_abort_the_others() {
        struct TwoFeaturePackage;
        impl PluginPackage for TwoFeaturePackage {
            fn enum_feature(&self, index: usize) -> Option<Feature> {
                match index {
                    0 => Some(Feature::Task),
                    1 => Some(Feature::ErrorLens),
                    _ => None,
                }
            }
            fn create_feature_interface(&self, index: usize) -> Result<FeatureInterface> {
                if index == 0 {
                    return Err(IpcError::InternalFatalError("boom".into()));
                }
                Ok(FeatureInterface {
                    feature: Feature::ErrorLens,
                    object: Arc::new(EchoTask(1)),
                })
            }
            fn can_unload_now(&self) -> bool {
                true
            }
            fn query_interface(&self, object: &Arc<dyn Any + Send + Sync>, _iid: Guid) -> Option<Arc<dyn Any + Send + Sync>> {
                Some(Arc::clone(object))
            }
        }
        struct TwoFeatureRuntime;
        impl PluginRuntime for TwoFeatureRuntime {
            fn load_plugin(&self, _path: &str) -> Result<Arc<dyn PluginPackage>> {
                Ok(Arc::new(TwoFeaturePackage))
            }
        }

        let loader = PluginLoader::new(
            1,
            Arc::new(ObjectManager::new(1)),
            Arc::new(RemoteObjectRegistry::new()),
            Arc::new(TwoFeatureRuntime),
        );
        loader.load_plugin("/p").unwrap();
        let registered = loader.register_plugin_objects("/p").unwrap();
        assert_eq!(registered, 1);
    }

    #[test]
    fn unload_refused_while_package_reports_busy() {
        struct BusyPackage;
        impl PluginPackage for BusyPackage {
            fn enum_feature(&self, _index: usize) -> Option<Feature> {
                None
            }
            fn create_feature_interface(&self, _index: usize) -> Result<FeatureInterface> {
                Err(IpcError::OutOfRange)
            }
            fn can_unload_now(&self) -> bool {
                false
            }
            fn query_interface(&self, _object: &Arc<dyn Any + Send + Sync>, _iid: Guid) -> Option<Arc<dyn Any + Send + Sync>> {
                None
            }
        }
        struct BusyRuntime;
        impl PluginRuntime for BusyRuntime {
            fn load_plugin(&self, _path: &str) -> Result<Arc<dyn PluginPackage>> {
                Ok(Arc::new(BusyPackage))
            }
        }

        let loader = PluginLoader::new(
            1,
            Arc::new(ObjectManager::new(1)),
            Arc::new(RemoteObjectRegistry::new()),
            Arc::new(BusyRuntime),
        );
        loader.load_plugin("/p").unwrap();
        assert_eq!(loader.unload_plugin("/p"), Err(IpcError::InvalidState));
    }
}

//! Component R — Test Fixture Plugin (ambient).
//!
//! A minimal in-workspace stand-in for an external plugin package: one
//! `TASK -> IDasTask` feature (crate::plugin::Feature::Task) whose object
//! has a single method that echoes back an `i32`. This lets the Plugin
//! Loader and proxy/stub round trip be exercised end to end without
//! spawning a real out-of-process plugin.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use das_ipc::error::{IpcError, Result};
use das_ipc::object_id::Guid;
use das_ipc::plugin::{Feature, FeatureInterface, PluginPackage, PluginRuntime};
use das_ipc::proxy::StubDispatch;

/// Method id `IDasTask::echo` answers to.
pub const ECHO_METHOD_ID: u32 = 1;

/// The object behind the `TASK` feature: echoes whatever `i32` it is given.
pub struct EchoTask;

impl EchoTask {
    fn echo(&self, n: i32) -> i32 {
        n
    }
}

/// [`StubDispatch`] for [`EchoTask`], registered against `Feature::Task`'s
/// interface id.
pub struct EchoTaskDispatch;

impl StubDispatch for EchoTaskDispatch {
    fn dispatch(&self, object: Arc<dyn Any + Send + Sync>, method_id: u32, body: &[u8]) -> Result<Vec<u8>> {
        let task = object.downcast_ref::<EchoTask>().ok_or(IpcError::NoInterface)?;
        if method_id != ECHO_METHOD_ID {
            return Err(IpcError::NoInterface);
        }
        let mut r = das_ipc::serializer::Reader::new(body);
        let n = r.read_i32()?;
        let mut w = das_ipc::serializer::Writer::new();
        w.write_i32(task.echo(n));
        Ok(w.into_bytes())
    }
}

/// The package itself: enumerates exactly one feature, `Feature::Task`.
/// `unloaded` flips once [`PluginPackage::can_unload_now`] should refuse,
/// purely so tests can exercise the busy path without a second package.
pub struct TaskPackage {
    busy: AtomicBool,
}

impl Default for TaskPackage {
    fn default() -> Self {
        Self { busy: AtomicBool::new(false) }
    }
}

impl TaskPackage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the package busy (refuses `can_unload_now`) or idle again.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

impl PluginPackage for TaskPackage {
    fn enum_feature(&self, index: usize) -> Option<Feature> {
        (index == 0).then_some(Feature::Task)
    }

    fn create_feature_interface(&self, index: usize) -> Result<FeatureInterface> {
        if index != 0 {
            return Err(IpcError::OutOfRange);
        }
        Ok(FeatureInterface {
            feature: Feature::Task,
            object: Arc::new(EchoTask),
        })
    }

    fn can_unload_now(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn query_interface(&self, object: &Arc<dyn Any + Send + Sync>, iid: Guid) -> Option<Arc<dyn Any + Send + Sync>> {
        if iid == Feature::Task.interface_iid() {
            Some(Arc::clone(object))
        } else {
            None
        }
    }
}

/// [`PluginRuntime`] that hands back the same in-process [`TaskPackage`]
/// regardless of the path asked for — there is no dynamic library or child
/// process to actually load.
pub struct DirectRuntime;

impl PluginRuntime for DirectRuntime {
    fn load_plugin(&self, _path: &str) -> Result<Arc<dyn PluginPackage>> {
        Ok(Arc::new(TaskPackage::new()))
    }
}

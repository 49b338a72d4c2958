//! Module Backends
//!
//! A backend turns an artifact path into an open module that can report its
//! embedded descriptor and create plugin instances. Shared libraries are
//! opened with `libloading`; statically linked plugins are served from an
//! in-process table keyed by artifact file name.

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::RwLock;

use crate::error::{PluginError, PluginResult};
use crate::plugin::traits::Plugin;

/// Exported symbol returning the NUL-terminated JSON descriptor
pub const METADATA_SYMBOL: &[u8] = b"plughost_plugin_metadata";

/// Exported symbol returning a boxed plugin object
pub const CREATE_SYMBOL: &[u8] = b"plughost_plugin_create";

/// Signature of [`CREATE_SYMBOL`].
///
/// The trait object is boxed twice so only a thin pointer crosses the C ABI.
/// The vtable behind it is still Rust-specific: plugins must be built with
/// the same compiler and `plughost` version as the host.
pub type CreateFn = extern "C" fn() -> *mut Box<dyn Plugin>;

/// Constructor for an in-process plugin
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// An opened artifact
pub trait PluginModule: Send + Sync {
    fn path(&self) -> &Path;

    /// The embedded descriptor, as JSON text
    fn metadata_json(&self) -> PluginResult<String>;

    /// Create a fresh plugin object
    fn instantiate(&self) -> PluginResult<Box<dyn Plugin>>;

    /// Rough resident cost of the module
    fn approx_memory_bytes(&self) -> u64;
}

/// Opens artifacts of some kind
pub trait ModuleBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend should handle `path`
    fn supports(&self, path: &Path) -> bool;

    fn open(&self, path: &Path) -> PluginResult<Arc<dyn PluginModule>>;
}

/// Backend for host-OS shared libraries
#[derive(Debug, Default)]
pub struct DynamicLibraryBackend;

impl DynamicLibraryBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleBackend for DynamicLibraryBackend {
    fn name(&self) -> &'static str {
        "dylib"
    }

    fn supports(&self, _path: &Path) -> bool {
        true
    }

    fn open(&self, path: &Path) -> PluginResult<Arc<dyn PluginModule>> {
        let size = std::fs::metadata(path)
            .map_err(|e| PluginError::from(e).with_path(path))?
            .len();
        // SAFETY: loading a library runs its initializers; artifacts are
        // trusted once they pass discovery and the optional signature check.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            PluginError::load_failed(format!("Failed to open library: {}", e)).with_path(path)
        })?;
        Ok(Arc::new(DynamicModule {
            path: path.to_path_buf(),
            size,
            library,
        }))
    }
}

struct DynamicModule {
    path: PathBuf,
    size: u64,
    library: Library,
}

impl DynamicModule {
    fn missing_symbol(&self, symbol: &[u8], err: libloading::Error) -> PluginError {
        PluginError::symbol_not_found(format!(
            "Symbol '{}' not found: {}",
            String::from_utf8_lossy(symbol),
            err
        ))
        .with_path(&self.path)
    }
}

impl PluginModule for DynamicModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn metadata_json(&self) -> PluginResult<String> {
        // SAFETY: the symbol signature is fixed by `declare_plugin!`.
        let metadata_fn: libloading::Symbol<extern "C" fn() -> *const c_char> =
            unsafe { self.library.get(METADATA_SYMBOL) }
                .map_err(|e| self.missing_symbol(METADATA_SYMBOL, e))?;

        let raw = metadata_fn();
        if raw.is_null() {
            return Err(PluginError::metadata_invalid("Plugin returned no descriptor").with_path(&self.path));
        }
        // SAFETY: non-null pointer to a NUL-terminated string owned by the library,
        // which stays loaded for the lifetime of `self`.
        let text = unsafe { CStr::from_ptr(raw) };
        text.to_str().map(str::to_string).map_err(|e| {
            PluginError::metadata_invalid(format!("Descriptor is not UTF-8: {}", e)).with_path(&self.path)
        })
    }

    fn instantiate(&self) -> PluginResult<Box<dyn Plugin>> {
        // SAFETY: the symbol signature is fixed by `declare_plugin!`.
        let create_fn: libloading::Symbol<CreateFn> =
            unsafe { self.library.get(CREATE_SYMBOL) }
                .map_err(|e| self.missing_symbol(CREATE_SYMBOL, e))?;

        let raw = create_fn();
        if raw.is_null() {
            return Err(PluginError::load_failed("Plugin factory returned null").with_path(&self.path));
        }
        // SAFETY: produced by `Box::into_raw` in the exporting crate.
        let outer = unsafe { Box::from_raw(raw) };
        Ok(*outer)
    }

    fn approx_memory_bytes(&self) -> u64 {
        self.size
    }
}

/// Export a plugin type from a `cdylib` crate.
///
/// The type must implement `Default` and [`Plugin`](crate::plugin::Plugin).
///
/// ```ignore
/// plughost::declare_plugin!(MyPlugin);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty) => {
        #[no_mangle]
        pub extern "C" fn plughost_plugin_metadata() -> *const ::std::ffi::c_char {
            static DESCRIPTOR: ::std::sync::OnceLock<Option<::std::ffi::CString>> =
                ::std::sync::OnceLock::new();
            DESCRIPTOR
                .get_or_init(|| {
                    let plugin = <$plugin_type>::default();
                    let json = $crate::plugin::Plugin::metadata(&plugin).to_json().ok()?;
                    ::std::ffi::CString::new(json).ok()
                })
                .as_ref()
                .map(|descriptor| descriptor.as_ptr())
                .unwrap_or(::std::ptr::null())
        }

        #[no_mangle]
        pub extern "C" fn plughost_plugin_create() -> *mut ::std::boxed::Box<dyn $crate::plugin::Plugin> {
            let plugin: ::std::boxed::Box<dyn $crate::plugin::Plugin> =
                ::std::boxed::Box::new(<$plugin_type>::default());
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(plugin))
        }
    };
}

/// Backend for plugins linked into the host process.
///
/// Artifacts are still files on disk so that identity checks and reload
/// detection work the same way as for shared libraries.
#[derive(Default)]
pub struct StaticBackend {
    entries: RwLock<HashMap<String, StaticEntry>>,
}

#[derive(Clone)]
struct StaticEntry {
    descriptor: String,
    factory: PluginFactory,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `factory` for artifacts named `file_name`; the descriptor is
    /// taken from a probe instance.
    pub fn register<F>(&self, file_name: &str, factory: F) -> PluginResult<()>
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let descriptor = factory().metadata().to_json()?;
        self.register_with_descriptor(file_name, descriptor, factory);
        Ok(())
    }

    /// Serve `factory` with an explicit descriptor text
    pub fn register_with_descriptor<F>(&self, file_name: &str, descriptor: String, factory: F)
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.entries.write().insert(
            file_name.to_string(),
            StaticEntry {
                descriptor,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn unregister(&self, file_name: &str) -> bool {
        self.entries.write().remove(file_name).is_some()
    }

    fn key(path: &Path) -> Option<String> {
        path.file_name().map(|n| n.to_string_lossy().into_owned())
    }
}

impl ModuleBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    fn supports(&self, path: &Path) -> bool {
        Self::key(path).map_or(false, |key| self.entries.read().contains_key(&key))
    }

    fn open(&self, path: &Path) -> PluginResult<Arc<dyn PluginModule>> {
        let entry = Self::key(path)
            .and_then(|key| self.entries.read().get(&key).cloned())
            .ok_or_else(|| {
                PluginError::unsupported_format("No static plugin registered for artifact").with_path(path)
            })?;
        let size = std::fs::metadata(path)
            .map_err(|e| PluginError::from(e).with_path(path))?
            .len();
        Ok(Arc::new(StaticModule {
            path: path.to_path_buf(),
            size,
            entry,
        }))
    }
}

struct StaticModule {
    path: PathBuf,
    size: u64,
    entry: StaticEntry,
}

impl PluginModule for StaticModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn metadata_json(&self) -> PluginResult<String> {
        Ok(self.entry.descriptor.clone())
    }

    fn instantiate(&self) -> PluginResult<Box<dyn Plugin>> {
        Ok((self.entry.factory)())
    }

    fn approx_memory_bytes(&self) -> u64 {
        self.size
    }
}

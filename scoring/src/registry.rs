//! Load-once registry of compiled functions.
//!
//! Functions are registered during startup and then only read. Entries are
//! `Arc<ScalarFunction>` so concurrent invocations share them without locks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::function::{self, ScalarFunction};

#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<ScalarFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a compiled function. Names are unique.
    pub fn register(&mut self, function: Arc<ScalarFunction>) -> ConfigResult<()> {
        if self.functions.contains_key(&function.name) {
            return Err(ConfigError::DuplicateFunction(function.name.clone()));
        }
        info!(
            function = %function.name,
            fingerprint = %function.fingerprint,
            "registered function"
        );
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    /// Load a function file and register it, returning the shared entry.
    pub fn load(&mut self, path: &Path) -> ConfigResult<Arc<ScalarFunction>> {
        let function = function::load(path)?;
        self.register(Arc::clone(&function))?;
        Ok(function)
    }

    /// Load every `.json`, `.yaml`, `.yml` and `.toml` file in `dir`.
    pub fn load_dir(&mut self, dir: &Path) -> ConfigResult<usize> {
        let io_err = |source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && function::Format::from_path(&path).is_ok() {
                paths.push(path);
            }
        }
        paths.sort();
        for path in &paths {
            self.load(path)?;
        }
        Ok(paths.len())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScalarFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

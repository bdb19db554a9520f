//! Source line resolution for crash reports.
//!
//! A crash report carries raw instruction addresses; turning them into
//! function names and source lines requires the symbol files of the modules
//! that were loaded in the crashed process. The [`Resolver`] keeps a table of
//! loaded [`Module`]s and routes each stack frame to the module covering its
//! instruction:
//!
//! ```no_run
//! use std::path::Path;
//! use symres::{CodeModule, Resolver, StackFrame};
//!
//! # fn main() -> Result<(), symres::LoadError> {
//! let mut resolver = Resolver::new();
//! resolver.load_module("app.pdb", Path::new("/symbols/app.pdb/IDENT/app.sym"))?;
//!
//! let mut frame = StackFrame::with_module(
//!     0x40001234,
//!     CodeModule { code_file: "app.pdb".into(), base_address: 0x40000000 },
//! );
//! let frame_info = resolver.fill_source_line_info(&mut frame);
//! # Ok(())
//! # }
//! ```
//!
//! Loading parses the text symbol file. With a [`ModuleCache`] configured,
//! the parsed module is additionally stored in its binary form and re-read
//! from there on later runs, which skips parsing entirely.

#![warn(missing_docs)]

mod cache;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

pub use symres_symfile::{
    records, CodeModule, DeserializeError, FrameInfo, FrameInfoKind, Function, Line, Module,
    ParseSymError, PublicSymbol, StackFrame, FORMAT_VERSION,
};

pub use crate::cache::{CacheStream, DiskModuleCache, ModuleCache};

/// An error returned when loading a module fails.
///
/// No partial module is registered on failure; a later
/// [`load_module`](Resolver::load_module) for the same name may succeed.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LoadError {
    /// Symbols for this module name are already loaded.
    #[error("symbols for module {0} are already loaded")]
    DuplicateModule(String),

    /// The symbol file could not be read.
    #[error("failed to read symbol file")]
    FileOpen(#[source] io::Error),

    /// The symbol file is malformed.
    #[error(transparent)]
    Parse(#[from] ParseSymError),
}

/// Resolves stack frames against a set of loaded symbol modules.
///
/// Modules are keyed by the name they were loaded under, which must match
/// the `code_file` of the frames to resolve. The module table is only
/// mutated by [`load_module`](Resolver::load_module); lookups are read-only.
#[derive(Default)]
pub struct Resolver {
    modules: BTreeMap<String, Module>,
    cache: Option<Box<dyn ModuleCache>>,
}

impl Resolver {
    /// Creates a resolver without a module cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver that stores and re-reads parsed modules through
    /// the given cache.
    pub fn with_cache(cache: Box<dyn ModuleCache>) -> Self {
        Resolver {
            modules: BTreeMap::new(),
            cache: Some(cache),
        }
    }

    /// Loads the symbol file at `sym_path` and registers it under `name`.
    ///
    /// If a cache is configured and holds usable data for `sym_path`, the
    /// module is read from there instead of parsing the text file. Stale or
    /// corrupt cache entries fall back to parsing and are overwritten.
    pub fn load_module(&mut self, name: &str, sym_path: &Path) -> Result<(), LoadError> {
        if self.modules.contains_key(name) {
            tracing::debug!(module = name, "symbols already loaded");
            return Err(LoadError::DuplicateModule(name.to_string()));
        }

        tracing::debug!(
            module = name,
            file = %sym_path.display(),
            "loading symbols"
        );

        if let Some(cache) = &self.cache {
            if let Some(mut stream) = cache.get_module_data(sym_path) {
                match Module::deserialize(name, &mut stream) {
                    Ok(module) => {
                        self.modules.insert(name.to_string(), module);
                        return Ok(());
                    }
                    Err(error) => {
                        // Version bumps and torn writes both end up here;
                        // the text file remains authoritative.
                        tracing::warn!(
                            module = name,
                            %error,
                            "stale or corrupt cached module data, re-parsing"
                        );
                    }
                }
            }
        }

        let data = fs::read(sym_path).map_err(LoadError::FileOpen)?;
        let module = Module::parse(name, &data)?;

        if let Some(cache) = &self.cache {
            if let Some(mut stream) = cache.begin_set_module_data(sym_path) {
                let written = module.serialize(&mut stream).and_then(|()| stream.commit());
                if let Err(error) = written {
                    tracing::warn!(
                        module = name,
                        %error,
                        "failed to store module data in the cache"
                    );
                }
            }
        }

        self.modules.insert(name.to_string(), module);
        Ok(())
    }

    /// Returns `true` if a module is loaded under the given name.
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Fills the frame with source line information for its instruction.
    ///
    /// Returns the frame's unwind information if the covering module has
    /// any; see [`Module::lookup_address`]. Returns `None` without touching
    /// the frame when the frame has no module or its module is not loaded.
    pub fn fill_source_line_info(&self, frame: &mut StackFrame) -> Option<FrameInfo> {
        let module = match frame
            .module
            .as_ref()
            .and_then(|module| self.modules.get(&module.code_file))
        {
            Some(module) => module,
            None => return None,
        };

        module.lookup_address(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_without_module() {
        let resolver = Resolver::new();

        let mut frame = StackFrame {
            instruction: 0x1000,
            ..Default::default()
        };
        assert!(resolver.fill_source_line_info(&mut frame).is_none());
        assert_eq!(frame.function_name, None);
    }

    #[test]
    fn test_fill_with_unloaded_module() {
        let resolver = Resolver::new();

        let mut frame = StackFrame::with_module(
            0x1100,
            CodeModule {
                code_file: "missing.pdb".into(),
                base_address: 0x1000,
            },
        );
        assert!(resolver.fill_source_line_info(&mut frame).is_none());
        assert_eq!(frame.function_name, None);
    }
}

//! Caching of parsed modules in their binary form.
//!
//! Parsing a large text symbol file takes orders of magnitude longer than
//! reading back the serialized module, so the resolver can be handed a
//! [`ModuleCache`] that keyes serialized modules by the path of their symbol
//! file. [`DiskModuleCache`] is the bundled implementation storing entries in
//! a directory tree next to the symbol store.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

/// A writable stream for a cache entry in progress.
///
/// Bytes written to the stream become visible to readers only once
/// [`commit`](CacheStream::commit) succeeds; dropping the stream without
/// committing discards them.
pub trait CacheStream: Write {
    /// Atomically publishes the written bytes.
    fn commit(self: Box<Self>) -> io::Result<()>;
}

/// A byte store for serialized modules, keyed by symbol file path.
///
/// Implementations are free to ignore entries they cannot store; the
/// resolver treats every cache miss or refusal as "parse the text file
/// instead".
pub trait ModuleCache {
    /// Opens the bytes previously stored for this symbol file, if any.
    fn get_module_data(&self, sym_path: &Path) -> Option<Box<dyn Read>>;

    /// Starts writing a new entry for this symbol file.
    ///
    /// Returns `None` if the cache cannot store an entry for this path.
    fn begin_set_module_data(&self, sym_path: &Path) -> Option<Box<dyn CacheStream>>;
}

/// A [`ModuleCache`] storing entries as files below a cache directory.
///
/// Symbol files are expected in the symbol store layout
/// `.../debug_file/IDENTIFIER/debug_file.sym`; the last three path
/// components are kept and a `.sym` suffix is replaced with `.symcache`, so
/// `/symbols/app.pdb/5A98…F1/app.sym` maps to
/// `<cache_dir>/app.pdb/5A98…F1/app.symcache`. Paths with fewer than three
/// components are not cached.
///
/// Entries are written to a temporary file and renamed into place, so
/// readers never observe partially written data.
#[derive(Clone, Debug)]
pub struct DiskModuleCache {
    cache_directory: PathBuf,
}

impl DiskModuleCache {
    /// Creates a cache storing entries below the given directory.
    pub fn new(cache_directory: impl Into<PathBuf>) -> Self {
        DiskModuleCache {
            cache_directory: cache_directory.into(),
        }
    }

    fn cache_entry_path(&self, sym_path: &Path) -> Option<PathBuf> {
        let components: Vec<_> = sym_path
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .collect();

        if components.len() < 3 {
            return None;
        }

        let mut path = self.cache_directory.clone();
        for part in &components[components.len() - 3..] {
            path.push(part);
        }

        if path.extension() == Some("sym".as_ref()) {
            path.set_extension("symcache");
        }

        Some(path)
    }
}

impl ModuleCache for DiskModuleCache {
    fn get_module_data(&self, sym_path: &Path) -> Option<Box<dyn Read>> {
        let path = self.cache_entry_path(sym_path)?;
        let file = File::open(&path).ok()?;

        tracing::debug!(
            sym_path = %sym_path.display(),
            cache_path = %path.display(),
            "loading cached copy of symbol file"
        );

        Some(Box::new(BufReader::new(file)))
    }

    fn begin_set_module_data(&self, sym_path: &Path) -> Option<Box<dyn CacheStream>> {
        let path = self.cache_entry_path(sym_path)?;
        let parent = path.parent()?;

        fs::create_dir_all(parent).ok()?;
        let file = NamedTempFile::new_in(parent).ok()?;

        Some(Box::new(DiskCacheStream {
            file: BufWriter::new(file),
            destination: path,
        }))
    }
}

struct DiskCacheStream {
    file: BufWriter<NamedTempFile>,
    destination: PathBuf,
}

impl Write for DiskCacheStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl CacheStream for DiskCacheStream {
    fn commit(self: Box<Self>) -> io::Result<()> {
        let file = self.file.into_inner()?;
        file.persist(&self.destination).map_err(|error| error.error)?;
        Ok(())
    }
}

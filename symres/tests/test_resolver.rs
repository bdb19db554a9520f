//! End-to-end tests for the resolver with symbol files on disk.

use std::fs;
use std::path::PathBuf;

use similar_asserts::assert_eq;

use symres::{CodeModule, DiskModuleCache, FrameInfo, LoadError, Resolver, StackFrame};

const SYM: &str = "\
MODULE windows x86 5A9832E5287241C1838ED98914E9B7FF1 test_app.pdb
FILE 1 c:\\src\\test_app.cc
FUNC 1000 24 4 main
1000 10 42 1
1010 14 43 1
PUBLIC 1400 8 _start
STACK WIN 4 1000 24 1 0 4 0 8 0 1 $T0 .raSearch =
";

/// Lays out a symbol store with the usual
/// `symbols/<debug_file>/<identifier>/<debug_file>.sym` nesting.
fn write_sym_file(root: &std::path::Path) -> PathBuf {
    let dir = root
        .join("symbols")
        .join("test_app.pdb")
        .join("5A9832E5287241C1838ED98914E9B7FF1");
    fs::create_dir_all(&dir).unwrap();

    let path = dir.join("test_app.sym");
    fs::write(&path, SYM).unwrap();
    path
}

fn frame_at(instruction: u64) -> StackFrame {
    StackFrame::with_module(
        instruction,
        CodeModule {
            code_file: "test_app.pdb".into(),
            base_address: 0x40000,
        },
    )
}

fn check_resolves(resolver: &Resolver) {
    let mut frame = frame_at(0x41012);
    let info = resolver.fill_source_line_info(&mut frame).unwrap();

    assert_eq!(frame.function_name.as_deref(), Some("main"));
    assert_eq!(frame.function_base, Some(0x41000));
    assert_eq!(frame.source_file_name.as_deref(), Some("c:\\src\\test_app.cc"));
    assert_eq!(frame.source_line, Some(43));
    assert_eq!(frame.source_line_base, Some(0x41010));
    assert_eq!(info.program_string, "$T0 .raSearch =");
}

#[test]
fn test_load_and_resolve() {
    let temp = tempfile::tempdir().unwrap();
    let sym_path = write_sym_file(temp.path());

    let mut resolver = Resolver::new();
    resolver.load_module("test_app.pdb", &sym_path).unwrap();

    assert!(resolver.has_module("test_app.pdb"));
    assert!(!resolver.has_module("other.pdb"));
    check_resolves(&resolver);
}

#[test]
fn test_duplicate_module() {
    let temp = tempfile::tempdir().unwrap();
    let sym_path = write_sym_file(temp.path());

    let mut resolver = Resolver::new();
    resolver.load_module("test_app.pdb", &sym_path).unwrap();

    match resolver.load_module("test_app.pdb", &sym_path) {
        Err(LoadError::DuplicateModule(name)) => assert_eq!(name, "test_app.pdb"),
        other => panic!("expected duplicate module error, got {:?}", other),
    }

    // The loaded module stays usable.
    check_resolves(&resolver);
}

#[test]
fn test_missing_sym_file() {
    let temp = tempfile::tempdir().unwrap();

    let mut resolver = Resolver::new();
    let result = resolver.load_module("test_app.pdb", &temp.path().join("nope.sym"));

    assert!(matches!(result, Err(LoadError::FileOpen(_))));
    assert!(!resolver.has_module("test_app.pdb"));
}

#[test]
fn test_malformed_sym_file() {
    let temp = tempfile::tempdir().unwrap();
    let sym_path = temp.path().join("a").join("b").join("bad.sym");
    fs::create_dir_all(sym_path.parent().unwrap()).unwrap();
    fs::write(&sym_path, "1000 10 42 1\n").unwrap();

    let mut resolver = Resolver::new();
    let result = resolver.load_module("bad.pdb", &sym_path);

    assert!(matches!(result, Err(LoadError::Parse(_))));
    assert!(!resolver.has_module("bad.pdb"));
}

#[test]
fn test_cache_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let sym_path = write_sym_file(temp.path());
    let cache_dir = temp.path().join("cache");

    {
        let mut resolver =
            Resolver::with_cache(Box::new(DiskModuleCache::new(&cache_dir)));
        resolver.load_module("test_app.pdb", &sym_path).unwrap();
        check_resolves(&resolver);
    }

    let cache_file = cache_dir
        .join("test_app.pdb")
        .join("5A9832E5287241C1838ED98914E9B7FF1")
        .join("test_app.symcache");
    assert!(cache_file.exists());

    // Remove the text file; the second resolver can only succeed through
    // the cache.
    fs::remove_file(&sym_path).unwrap();

    let mut resolver = Resolver::with_cache(Box::new(DiskModuleCache::new(&cache_dir)));
    resolver.load_module("test_app.pdb", &sym_path).unwrap();
    check_resolves(&resolver);
}

#[test]
fn test_corrupt_cache_falls_back_to_parsing() {
    let temp = tempfile::tempdir().unwrap();
    let sym_path = write_sym_file(temp.path());
    let cache_dir = temp.path().join("cache");

    let cache_file = cache_dir
        .join("test_app.pdb")
        .join("5A9832E5287241C1838ED98914E9B7FF1")
        .join("test_app.symcache");
    fs::create_dir_all(cache_file.parent().unwrap()).unwrap();
    fs::write(&cache_file, b"not a module").unwrap();

    let mut resolver = Resolver::with_cache(Box::new(DiskModuleCache::new(&cache_dir)));
    resolver.load_module("test_app.pdb", &sym_path).unwrap();
    check_resolves(&resolver);

    // The bad entry was overwritten with usable data.
    fs::remove_file(&sym_path).unwrap();
    let mut resolver = Resolver::with_cache(Box::new(DiskModuleCache::new(&cache_dir)));
    resolver.load_module("test_app.pdb", &sym_path).unwrap();
    check_resolves(&resolver);
}

#[test]
fn test_stale_cache_version_falls_back_to_parsing() {
    let temp = tempfile::tempdir().unwrap();
    let sym_path = write_sym_file(temp.path());
    let cache_dir = temp.path().join("cache");

    let cache_file = cache_dir
        .join("test_app.pdb")
        .join("5A9832E5287241C1838ED98914E9B7FF1")
        .join("test_app.symcache");
    fs::create_dir_all(cache_file.parent().unwrap()).unwrap();
    // A version-1 header from the host-endian era of the format.
    fs::write(&cache_file, 1u32.to_le_bytes()).unwrap();

    let mut resolver = Resolver::with_cache(Box::new(DiskModuleCache::new(&cache_dir)));
    resolver.load_module("test_app.pdb", &sym_path).unwrap();
    check_resolves(&resolver);
}

#[test]
fn test_refusing_cache_still_loads() {
    // A cache that cannot store an entry for a path must not prevent the
    // module from loading.
    struct RefusingCache;

    impl symres::ModuleCache for RefusingCache {
        fn get_module_data(&self, _sym_path: &std::path::Path) -> Option<Box<dyn std::io::Read>> {
            None
        }

        fn begin_set_module_data(
            &self,
            _sym_path: &std::path::Path,
        ) -> Option<Box<dyn symres::CacheStream>> {
            None
        }
    }

    let temp = tempfile::tempdir().unwrap();
    let sym_path = write_sym_file(temp.path());

    let mut resolver = Resolver::with_cache(Box::new(RefusingCache));
    resolver.load_module("test_app.pdb", &sym_path).unwrap();
    check_resolves(&resolver);
}

#[test]
fn test_synthesized_frame_info_for_public_symbol() {
    let temp = tempfile::tempdir().unwrap();
    let sym_path = write_sym_file(temp.path());

    let mut resolver = Resolver::new();
    resolver.load_module("test_app.pdb", &sym_path).unwrap();

    let mut frame = frame_at(0x41480);
    let info = resolver.fill_source_line_info(&mut frame).unwrap();

    assert_eq!(frame.function_name.as_deref(), Some("_start"));
    assert_eq!(frame.function_base, Some(0x41400));
    assert_eq!(info.valid, FrameInfo::VALID_PARAMETER_SIZE);
    assert_eq!(info.parameter_size, 8);
}

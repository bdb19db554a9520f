use std::collections::BTreeMap;
use std::str;

use thiserror::Error;

use symres_maps::{AddressMap, ContainedRangeMap, RangeMap};

use crate::frame::{FrameInfo, FrameInfoKind, StackFrame};
use crate::records::{
    FileRecord, FuncRecord, LineRecord, PublicRecord, RecordType, StackWinRecord,
};

/// An error encountered while parsing a symbol file.
///
/// Structural errors are fatal: no partial module is produced. Records that
/// parse correctly but fail the range checks of the address maps are dropped
/// silently instead.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed to parse {record} record on line {line}: {message}")]
pub struct ParseSymError {
    record: RecordType,
    line: usize,
    message: &'static str,
}

impl ParseSymError {
    fn new(record: RecordType, line: usize, message: &'static str) -> Self {
        ParseSymError {
            record,
            line,
            message,
        }
    }

    /// The type of the record that failed to parse.
    pub fn record(&self) -> RecordType {
        self.record
    }

    /// The one-based line number of the offending record.
    pub fn line(&self) -> usize {
        self.line
    }
}

/// A source line record indexed within a [`Function`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Line {
    /// The start address of the covered code relative to the module base.
    pub address: u64,
    /// The size of the covered code in bytes.
    pub size: u64,
    /// Identifier of the source file in the module's file table.
    pub file_id: u32,
    /// The line number within the source file.
    pub line: u32,
}

/// A function and the source lines of its code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// The function name.
    pub name: String,
    /// The start address of the function relative to the module base.
    pub address: u64,
    /// The size of the function's code in bytes.
    pub size: u64,
    /// The size of arguments passed to the function on the stack.
    pub parameter_size: u32,
    /// The function's source lines, keyed by address range.
    pub lines: RangeMap<u64, Line>,
}

/// A public symbol marking a named address without a size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicSymbol {
    /// The symbol name.
    pub name: String,
    /// The address of the symbol relative to the module base.
    pub address: u64,
    /// The size of arguments passed on the stack, if the symbol is a
    /// function entry point.
    pub parameter_size: u32,
}

/// One loaded symbol module, corresponding to one executable or shared
/// library.
///
/// A module is built once by [`parse`](Module::parse) or
/// [`deserialize`](Module::deserialize) and is immutable afterwards;
/// [`lookup_address`](Module::lookup_address) only reads, so a loaded module
/// may be shared freely between threads.
#[derive(Debug)]
pub struct Module {
    pub(crate) name: String,
    pub(crate) files: BTreeMap<u32, String>,
    pub(crate) functions: RangeMap<u64, Function>,
    pub(crate) public_symbols: AddressMap<u64, PublicSymbol>,
    /// One map per [`FrameInfoKind`]. Records of different kinds may cover
    /// overlapping ranges, so they cannot share a map.
    pub(crate) frame_infos: [ContainedRangeMap<u64, FrameInfo>; FrameInfoKind::COUNT],
}

impl Module {
    pub(crate) fn empty(name: String) -> Self {
        Module {
            name,
            files: BTreeMap::new(),
            functions: RangeMap::new(),
            public_symbols: AddressMap::new(),
            frame_infos: Default::default(),
        }
    }

    /// The name this module was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parses a text symbol file into a module.
    ///
    /// Malformed records and source line records outside of a function fail
    /// the parse. Records whose address ranges are rejected by the module's
    /// maps (zero-sized functions, overlapping unwind records) are dropped
    /// and counted, and the parse continues.
    pub fn parse(name: impl Into<String>, data: &[u8]) -> Result<Self, ParseSymError> {
        let mut module = Module::empty(name.into());

        // Line records belong to the most recent FUNC record. The function
        // is kept out of the map until it is complete, so that one rejected
        // by the map takes its lines with it.
        let mut current_function: Option<Function> = None;

        let mut dropped_functions = 0usize;
        let mut dropped_lines = 0usize;
        let mut dropped_frame_infos = 0usize;

        for (index, raw) in data.split(|&b| b == b'\n').enumerate() {
            let number = index + 1;
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

            if raw.is_empty() {
                continue;
            }

            if raw.starts_with(b"MODULE ") {
                // The header carries os/arch/id information used when laying
                // out symbol files on disk. It holds nothing needed for
                // lookups.
            } else if raw.starts_with(b"FILE ") {
                let input = record_str(RecordType::File, number, raw)?;
                let record = FileRecord::parse(input)
                    .map_err(|message| ParseSymError::new(RecordType::File, number, message))?;

                module
                    .files
                    .entry(record.id)
                    .or_insert_with(|| record.path.to_string());
            } else if raw.starts_with(b"FUNC ") {
                if let Some(function) = current_function.take() {
                    if !module.store_function(function) {
                        dropped_functions += 1;
                    }
                }

                let input = record_str(RecordType::Func, number, raw)?;
                let record = FuncRecord::parse(input)
                    .map_err(|message| ParseSymError::new(RecordType::Func, number, message))?;

                current_function = Some(Function {
                    name: record.name.to_string(),
                    address: record.address,
                    size: record.size,
                    parameter_size: record.parameter_size,
                    lines: RangeMap::new(),
                });
            } else if raw.starts_with(b"PUBLIC ") {
                // Public symbols do not carry line records; the current
                // function ends here.
                if let Some(function) = current_function.take() {
                    if !module.store_function(function) {
                        dropped_functions += 1;
                    }
                }

                let input = record_str(RecordType::Public, number, raw)?;
                let record = PublicRecord::parse(input)
                    .map_err(|message| ParseSymError::new(RecordType::Public, number, message))?;

                // A few symbols in system library PDBs report address zero.
                // Accept the input but keep them out of the map, where they
                // would conflict with one another.
                if record.address == 0 {
                    continue;
                }

                let symbol = PublicSymbol {
                    name: record.name.to_string(),
                    address: record.address,
                    parameter_size: record.parameter_size,
                };

                if !module.public_symbols.insert(record.address, symbol) {
                    return Err(ParseSymError::new(
                        RecordType::Public,
                        number,
                        "duplicate public symbol address",
                    ));
                }
            } else if raw.starts_with(b"STACK ") {
                let input = record_str(RecordType::StackWin, number, raw)?;
                let record = StackWinRecord::parse(input)
                    .map_err(|message| ParseSymError::new(RecordType::StackWin, number, message))?;

                // MSVC infrequently emits stack info that violates the
                // containment rules once prologues are taken into account;
                // such records are dropped rather than failing the module.
                let stored = match record.rva.checked_add(record.code_size) {
                    Some(end) => module.frame_infos[record.kind.index()]
                        .insert(record.rva..end, record.frame_info()),
                    None => false,
                };

                if !stored {
                    dropped_frame_infos += 1;
                }
            } else {
                let function = match current_function.as_mut() {
                    Some(function) => function,
                    None => {
                        return Err(ParseSymError::new(
                            RecordType::Line,
                            number,
                            "source line record without a preceding FUNC record",
                        ))
                    }
                };

                let input = record_str(RecordType::Line, number, raw)?;
                let record = LineRecord::parse(input)
                    .map_err(|message| ParseSymError::new(RecordType::Line, number, message))?;

                let line = Line {
                    address: record.address,
                    size: record.size,
                    file_id: record.file_id,
                    line: record.line,
                };

                let stored = match record.address.checked_add(record.size) {
                    Some(end) => function.lines.insert(record.address..end, line),
                    None => false,
                };

                if !stored {
                    dropped_lines += 1;
                }
            }
        }

        if let Some(function) = current_function.take() {
            if !module.store_function(function) {
                dropped_functions += 1;
            }
        }

        if dropped_functions + dropped_lines + dropped_frame_infos > 0 {
            tracing::debug!(
                module = %module.name,
                dropped_functions,
                dropped_lines,
                dropped_frame_infos,
                "dropped records that failed address range checks"
            );
        }

        Ok(module)
    }

    /// Stores a completed function in the function map. Returns `false` if
    /// the map rejected it.
    fn store_function(&mut self, function: Function) -> bool {
        // Functions at address zero are as bogus as zero-sized ones.
        if function.address == 0 {
            return false;
        }

        let end = match function.address.checked_add(function.size) {
            Some(end) => end,
            None => return false,
        };

        self.functions.insert(function.address..end, function)
    }

    /// Looks up the frame's instruction address and fills the frame with
    /// function name, base address and source line information.
    ///
    /// Returns the unwind information covering the address, if any. When no
    /// `STACK WIN` record covers the address but a function or public symbol
    /// matched, the returned info carries only that record's parameter size.
    /// `None` is not an error; it means the module holds no information for
    /// this address.
    pub fn lookup_address(&self, frame: &mut StackFrame) -> Option<FrameInfo> {
        let base_address = frame.module.as_ref()?.base_address;
        let address = frame.instruction.wrapping_sub(base_address);

        // Frame data records are the newer kind and carry their own unwind
        // program; fall back to FPO records when none covers the address.
        let retrieved_info = self.frame_infos[FrameInfoKind::FrameData.index()]
            .get(address)
            .or_else(|| self.frame_infos[FrameInfoKind::Fpo.index()].get(address))
            .cloned();

        // Look at the nearest function at or below the address rather than
        // requiring a range hit right away: even when the address lies
        // outside of it, the function's end decides below whether a public
        // symbol at a lower address may claim the address.
        let nearest = self.functions.get_nearest(address);
        let hit = nearest.filter(|(range, _)| range.contains(&address));

        let parameter_size;
        if let Some((range, function)) = hit {
            parameter_size = function.parameter_size;
            frame.function_name = Some(function.name.clone());
            frame.function_base = Some(base_address + range.start);

            if let Some((line_range, line)) = function.lines.get(address) {
                if let Some(path) = self.files.get(&line.file_id) {
                    frame.source_file_name = Some(path.clone());
                }
                frame.source_line = Some(line.line);
                frame.source_line_base = Some(base_address + line_range.start);
            }
        } else {
            let public = self.public_symbols.get(address).filter(|(public_address, _)| {
                // A public symbol at or below the end of the nearest function
                // belongs to that function's neighborhood, not to the
                // queried address.
                nearest.map_or(true, |(range, _)| *public_address > range.end)
            });

            match public {
                Some((public_address, symbol)) => {
                    parameter_size = symbol.parameter_size;
                    frame.function_name = Some(symbol.name.clone());
                    frame.function_base = Some(base_address + public_address);
                }
                None => return retrieved_info,
            }
        }

        // Even without a STACK record, FUNC and PUBLIC records tell how much
        // stack space their parameters consume.
        Some(retrieved_info.unwrap_or_else(|| FrameInfo::with_parameter_size(parameter_size)))
    }
}

/// Module equality is content equality: the registration name identifies a
/// module but does not describe it.
impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.files == other.files
            && self.functions == other.functions
            && self.public_symbols == other.public_symbols
            && self.frame_infos == other.frame_infos
    }
}

impl Eq for Module {}

fn record_str(record: RecordType, line: usize, raw: &[u8]) -> Result<&str, ParseSymError> {
    str::from_utf8(raw).map_err(|_| ParseSymError::new(record, line, "invalid utf-8"))
}

//! The binary serialization of a parsed [`Module`].
//!
//! Re-parsing large text symbol files on every process start is slow; a
//! parsed module can instead be written out in a compact binary form and
//! mapped back in later. The format mirrors the module's in-memory indexes
//! so that deserializing reproduces a structurally equal module.
//!
//! All integers are fixed-width little-endian, making the data portable
//! between hosts. Strings are written as a padded length followed by the
//! payload, NUL-padded to a multiple of four bytes; the true length is
//! recovered by scanning for the first NUL. A name containing an interior
//! NUL byte is therefore truncated at that byte on the way back in.

use std::collections::btree_map;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use symres_maps::{ContainedRange, ContainedRangeMap, RangeMap};

use crate::frame::FrameInfo;
use crate::module::{Function, Line, Module, PublicSymbol};

/// The version of the binary module format.
///
/// Version 1 was written in host byte order; version 2 fixes little-endian.
pub const FORMAT_VERSION: u32 = 2;

/// An error returned when reading binary module data fails.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DeserializeError {
    /// The data was written by a different format version.
    ///
    /// Callers are expected to fall back to re-parsing the text symbol file
    /// and overwrite the stale data.
    #[error("unsupported module data format version {0}")]
    UnsupportedVersion(u32),

    /// The data is structurally invalid.
    #[error("corrupt module data: {0}")]
    Corrupt(&'static str),

    /// A string in the data is not valid UTF-8.
    #[error("bad utf-8 sequence in module data")]
    BadEncoding(#[source] std::string::FromUtf8Error),

    /// Reading from the underlying stream failed.
    #[error("failed to read module data")]
    Io(#[from] io::Error),
}

impl Module {
    /// Writes the module in its binary form.
    pub fn serialize<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(FORMAT_VERSION)?;

        writer.write_u32::<LittleEndian>(self.files.len() as u32)?;
        for (&id, path) in &self.files {
            writer.write_u32::<LittleEndian>(id)?;
            write_string(&mut writer, path)?;
        }

        writer.write_u32::<LittleEndian>(self.functions.len() as u32)?;
        for (range, function) in &self.functions {
            writer.write_u64::<LittleEndian>(range.end)?;
            writer.write_u64::<LittleEndian>(range.start)?;
            write_value(&mut writer, |w| write_function(w, function))?;
        }

        writer.write_u32::<LittleEndian>(self.public_symbols.len() as u32)?;
        for (&address, symbol) in self.public_symbols.iter() {
            writer.write_u64::<LittleEndian>(address)?;
            write_value(&mut writer, |w| write_public_symbol(w, symbol))?;
        }

        for map in &self.frame_infos {
            write_frame_info_map(&mut writer, map)?;
        }

        Ok(())
    }

    /// Reads a module back from its binary form.
    ///
    /// The data must have been produced by [`serialize`](Module::serialize)
    /// with the same [`FORMAT_VERSION`]; data written by another version
    /// fails with [`DeserializeError::UnsupportedVersion`] without consuming
    /// more than the version header.
    pub fn deserialize<R: Read>(
        name: impl Into<String>,
        mut reader: R,
    ) -> Result<Self, DeserializeError> {
        let version = reader.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(version));
        }

        let mut module = Module::empty(name.into());

        let file_count = reader.read_u32::<LittleEndian>()?;
        for _ in 0..file_count {
            let id = reader.read_u32::<LittleEndian>()?;
            let path = read_string(&mut reader)?;
            module.files.insert(id, path);
        }

        let function_count = reader.read_u32::<LittleEndian>()?;
        for _ in 0..function_count {
            let end = reader.read_u64::<LittleEndian>()?;
            let start = reader.read_u64::<LittleEndian>()?;
            read_value_marker(&mut reader)?;
            let function = read_function(&mut reader)?;

            if !module.functions.insert(start..end, function) {
                return Err(DeserializeError::Corrupt("overlapping function ranges"));
            }
        }

        let symbol_count = reader.read_u32::<LittleEndian>()?;
        for _ in 0..symbol_count {
            let address = reader.read_u64::<LittleEndian>()?;
            read_value_marker(&mut reader)?;
            let symbol = read_public_symbol(&mut reader)?;

            if !module.public_symbols.insert(address, symbol) {
                return Err(DeserializeError::Corrupt("duplicate public symbol address"));
            }
        }

        for map in &mut module.frame_infos {
            read_frame_info_map(&mut reader, map)?;
        }

        Ok(module)
    }
}

/// Writes a map value behind its presence marker.
///
/// Values stored in maps may conceptually be absent; this encoder never
/// writes absent values, but the marker stays part of the format.
fn write_value<W: Write>(
    writer: &mut W,
    write: impl FnOnce(&mut W) -> io::Result<()>,
) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(1)?;
    write(writer)
}

fn read_value_marker<R: Read>(reader: &mut R) -> Result<(), DeserializeError> {
    match reader.read_u32::<LittleEndian>()? {
        1 => Ok(()),
        _ => Err(DeserializeError::Corrupt("missing map value")),
    }
}

fn write_string<W: Write>(writer: &mut W, string: &str) -> io::Result<()> {
    if string.is_empty() {
        return writer.write_u32::<LittleEndian>(0);
    }

    // Pad to a multiple of four bytes with at least one NUL, so that the
    // reader can recover the unpadded length.
    let len = string.len() as u32;
    let padding = 4 - len % 4;

    writer.write_u32::<LittleEndian>(len + padding)?;
    writer.write_all(string.as_bytes())?;
    writer.write_all(&[0u8; 4][..padding as usize])
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, DeserializeError> {
    let padded_len = reader.read_u32::<LittleEndian>()?;
    if padded_len == 0 {
        return Ok(String::new());
    }

    if padded_len % 4 != 0 {
        return Err(DeserializeError::Corrupt("unaligned string length"));
    }

    let mut data = vec![0u8; padded_len as usize];
    reader.read_exact(&mut data)?;

    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    data.truncate(len);

    String::from_utf8(data).map_err(DeserializeError::BadEncoding)
}

fn write_function<W: Write>(writer: &mut W, function: &Function) -> io::Result<()> {
    write_string(writer, &function.name)?;
    writer.write_u64::<LittleEndian>(function.address)?;
    writer.write_u64::<LittleEndian>(function.size)?;
    writer.write_u32::<LittleEndian>(function.parameter_size)?;

    writer.write_u32::<LittleEndian>(function.lines.len() as u32)?;
    for (range, line) in &function.lines {
        writer.write_u64::<LittleEndian>(range.end)?;
        writer.write_u64::<LittleEndian>(range.start)?;
        write_value(writer, |w| write_line(w, line))?;
    }

    Ok(())
}

fn read_function<R: Read>(reader: &mut R) -> Result<Function, DeserializeError> {
    let name = read_string(reader)?;
    let address = reader.read_u64::<LittleEndian>()?;
    let size = reader.read_u64::<LittleEndian>()?;
    let parameter_size = reader.read_u32::<LittleEndian>()?;

    let mut lines = RangeMap::new();
    let line_count = reader.read_u32::<LittleEndian>()?;
    for _ in 0..line_count {
        let end = reader.read_u64::<LittleEndian>()?;
        let start = reader.read_u64::<LittleEndian>()?;
        read_value_marker(reader)?;
        let line = read_line(reader)?;

        if !lines.insert(start..end, line) {
            return Err(DeserializeError::Corrupt("overlapping line ranges"));
        }
    }

    Ok(Function {
        name,
        address,
        size,
        parameter_size,
        lines,
    })
}

fn write_line<W: Write>(writer: &mut W, line: &Line) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(line.address)?;
    writer.write_u64::<LittleEndian>(line.size)?;
    writer.write_u32::<LittleEndian>(line.file_id)?;
    writer.write_u32::<LittleEndian>(line.line)
}

fn read_line<R: Read>(reader: &mut R) -> Result<Line, DeserializeError> {
    Ok(Line {
        address: reader.read_u64::<LittleEndian>()?,
        size: reader.read_u64::<LittleEndian>()?,
        file_id: reader.read_u32::<LittleEndian>()?,
        line: reader.read_u32::<LittleEndian>()?,
    })
}

fn write_public_symbol<W: Write>(writer: &mut W, symbol: &PublicSymbol) -> io::Result<()> {
    write_string(writer, &symbol.name)?;
    writer.write_u64::<LittleEndian>(symbol.address)?;
    writer.write_u32::<LittleEndian>(symbol.parameter_size)
}

fn read_public_symbol<R: Read>(reader: &mut R) -> Result<PublicSymbol, DeserializeError> {
    Ok(PublicSymbol {
        name: read_string(reader)?,
        address: reader.read_u64::<LittleEndian>()?,
        parameter_size: reader.read_u32::<LittleEndian>()?,
    })
}

fn write_frame_info<W: Write>(writer: &mut W, info: &FrameInfo) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(info.valid)?;
    writer.write_u32::<LittleEndian>(info.prolog_size)?;
    writer.write_u32::<LittleEndian>(info.epilog_size)?;
    writer.write_u32::<LittleEndian>(info.parameter_size)?;
    writer.write_u32::<LittleEndian>(info.saved_register_size)?;
    writer.write_u32::<LittleEndian>(info.local_size)?;
    writer.write_u32::<LittleEndian>(info.max_stack_size)?;
    writer.write_u32::<LittleEndian>(info.allocates_base_pointer as u32)?;
    write_string(writer, &info.program_string)
}

fn read_frame_info<R: Read>(reader: &mut R) -> Result<FrameInfo, DeserializeError> {
    Ok(FrameInfo {
        valid: reader.read_u32::<LittleEndian>()?,
        prolog_size: reader.read_u32::<LittleEndian>()?,
        epilog_size: reader.read_u32::<LittleEndian>()?,
        parameter_size: reader.read_u32::<LittleEndian>()?,
        saved_register_size: reader.read_u32::<LittleEndian>()?,
        local_size: reader.read_u32::<LittleEndian>()?,
        max_stack_size: reader.read_u32::<LittleEndian>()?,
        allocates_base_pointer: reader.read_u32::<LittleEndian>()? != 0,
        program_string: read_string(reader)?,
    })
}

fn write_frame_info_map<W: Write>(
    writer: &mut W,
    map: &ContainedRangeMap<u64, FrameInfo>,
) -> io::Result<()> {
    // The root is a sentinel covering the whole address space: zero base,
    // no entry of its own.
    writer.write_u64::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(0)?;

    let has_children = !map.is_empty();
    writer.write_u32::<LittleEndian>(has_children as u32)?;
    if has_children {
        write_frame_info_children(writer, map.children())?;
    }

    Ok(())
}

fn write_frame_info_children<W: Write>(
    writer: &mut W,
    children: btree_map::Iter<'_, u64, ContainedRange<u64, FrameInfo>>,
) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(children.len() as u32)?;

    for (&end, node) in children {
        writer.write_u64::<LittleEndian>(end)?;
        writer.write_u64::<LittleEndian>(node.start())?;
        write_value(writer, |w| write_frame_info(w, node.entry()))?;

        let has_children = node.child_count() > 0;
        writer.write_u32::<LittleEndian>(has_children as u32)?;
        if has_children {
            write_frame_info_children(writer, node.children())?;
        }
    }

    Ok(())
}

fn read_frame_info_map<R: Read>(
    reader: &mut R,
    map: &mut ContainedRangeMap<u64, FrameInfo>,
) -> Result<(), DeserializeError> {
    let _base = reader.read_u64::<LittleEndian>()?;
    if reader.read_u32::<LittleEndian>()? != 0 {
        return Err(DeserializeError::Corrupt("unexpected entry on root range"));
    }

    match reader.read_u32::<LittleEndian>()? {
        0 => Ok(()),
        1 => read_frame_info_children(reader, map),
        _ => Err(DeserializeError::Corrupt("invalid children marker")),
    }
}

fn read_frame_info_children<R: Read>(
    reader: &mut R,
    map: &mut ContainedRangeMap<u64, FrameInfo>,
) -> Result<(), DeserializeError> {
    let count = reader.read_u32::<LittleEndian>()?;

    for _ in 0..count {
        let end = reader.read_u64::<LittleEndian>()?;
        let start = reader.read_u64::<LittleEndian>()?;
        read_value_marker(reader)?;
        let info = read_frame_info(reader)?;

        // Nodes are stored outermost-first, so reinserting each one from the
        // top rebuilds the same tree.
        if !map.insert(start..end, info) {
            return Err(DeserializeError::Corrupt(
                "frame info ranges violate containment",
            ));
        }

        match reader.read_u32::<LittleEndian>()? {
            0 => {}
            1 => read_frame_info_children(reader, map)?,
            _ => return Err(DeserializeError::Corrupt("invalid children marker")),
        }
    }

    Ok(())
}

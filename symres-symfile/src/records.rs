//! Parsers for the individual record types of a symbol file.
//!
//! Each record occupies one line. Fields are separated by whitespace; where a
//! record ends in a name, path or program string, that final field is the
//! unsplit remainder of the line and may contain spaces.
//!
//! The parsers in this module work on single lines with the terminator
//! already stripped. [`Module::parse`](crate::Module::parse) drives them over
//! a whole file and attaches line numbers to their errors.

use std::fmt;

use crate::frame::{FrameInfo, FrameInfoKind};

type ParseResult<T> = Result<T, &'static str>;

/// The type of a symbol file record, for error reporting.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    /// A `FILE` record.
    File,
    /// A `FUNC` record.
    Func,
    /// A source line record, which carries no prefix.
    Line,
    /// The `MODULE` header record.
    Module,
    /// A `PUBLIC` record.
    Public,
    /// A `STACK WIN` record.
    StackWin,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::File => write!(f, "FILE"),
            RecordType::Func => write!(f, "FUNC"),
            RecordType::Line => write!(f, "source line"),
            RecordType::Module => write!(f, "MODULE"),
            RecordType::Public => write!(f, "PUBLIC"),
            RecordType::StackWin => write!(f, "STACK WIN"),
        }
    }
}

fn next(input: &str) -> ParseResult<(&str, &str)> {
    if input.is_empty() {
        return Err("unexpected end of record");
    }

    Ok(match input.find(char::is_whitespace) {
        Some(split) => (&input[..split], input[split..].trim_start()),
        None => (input, ""),
    })
}

fn next_and<T, F>(input: &str, parser: F) -> ParseResult<(T, &str)>
where
    F: FnOnce(&str) -> ParseResult<T>,
{
    next(input).and_then(|(part, rest)| Ok((parser(part)?, rest)))
}

fn parse_hex64(input: &str) -> ParseResult<u64> {
    u64::from_str_radix(input, 16).or(Err("expected hex number"))
}

fn parse_hex32(input: &str) -> ParseResult<u32> {
    u32::from_str_radix(input, 16).or(Err("expected hex number"))
}

fn parse_u32(input: &str) -> ParseResult<u32> {
    input.parse().or(Err("expected number"))
}

fn done(input: &str) -> ParseResult<()> {
    match input {
        "" => Ok(()),
        _ => Err("unexpected trailing data"),
    }
}

fn remainder<'a>(input: &'a str, missing: &'static str) -> ParseResult<&'a str> {
    if input.is_empty() {
        Err(missing)
    } else {
        Ok(input)
    }
}

/// A `FILE` record, declaring the path of a source code file.
///
/// The id is referenced by the source line records of functions. Ids are not
/// necessarily consecutive; symbol writers may reuse identifiers from the
/// original debug file.
///
/// Example: `FILE 2 /home/jimb/mc/in/browser/app/nsBrowserApp.cpp`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileRecord<'d> {
    /// Identifier of the file within its module.
    pub id: u32,
    /// The path to the source file. May contain spaces.
    pub path: &'d str,
}

impl<'d> FileRecord<'d> {
    /// Parses a file record from a single line.
    pub fn parse(input: &'d str) -> ParseResult<Self> {
        let rest = input.strip_prefix("FILE ").ok_or("expected FILE record")?;

        let (id, rest) = next_and(rest.trim_start(), parse_u32)?;
        let path = remainder(rest, "missing file path")?;

        Ok(FileRecord { id, path })
    }
}

/// A `FUNC` record, declaring a function's address range, the size of its
/// stack parameters, and its name.
///
/// Source line records following a `FUNC` record belong to that function.
///
/// Example: `FUNC c184 30 0 nsQueryInterfaceWithError::operator()(nsID const&, void**) const`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FuncRecord<'d> {
    /// The start address of the function relative to the module base.
    pub address: u64,
    /// The size of the function's code in bytes.
    pub size: u64,
    /// The size of arguments passed to the function on the stack.
    pub parameter_size: u32,
    /// The function name. May contain spaces.
    pub name: &'d str,
}

impl<'d> FuncRecord<'d> {
    /// Parses a function record from a single line.
    pub fn parse(input: &'d str) -> ParseResult<Self> {
        let rest = input.strip_prefix("FUNC ").ok_or("expected FUNC record")?;

        let (address, rest) = next_and(rest.trim_start(), parse_hex64)?;
        let (size, rest) = next_and(rest, parse_hex64)?;
        let (parameter_size, rest) = next_and(rest, parse_hex32)?;
        let name = remainder(rest, "missing function name")?;

        Ok(FuncRecord {
            address,
            size,
            parameter_size,
            name,
        })
    }
}

/// A `PUBLIC` record, declaring a named symbol without a size.
///
/// Public symbols are used when no function record covers an address.
///
/// Example: `PUBLIC 5180 0 __clang_call_terminate`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublicRecord<'d> {
    /// The address of the symbol relative to the module base.
    pub address: u64,
    /// The size of arguments passed to the function on the stack, if the
    /// symbol is a function entry point.
    pub parameter_size: u32,
    /// The symbol name. May contain spaces.
    pub name: &'d str,
}

impl<'d> PublicRecord<'d> {
    /// Parses a public symbol record from a single line.
    pub fn parse(input: &'d str) -> ParseResult<Self> {
        let rest = input
            .strip_prefix("PUBLIC ")
            .ok_or("expected PUBLIC record")?;

        let (address, rest) = next_and(rest.trim_start(), parse_hex64)?;
        let (parameter_size, rest) = next_and(rest, parse_hex32)?;
        let name = remainder(rest, "missing symbol name")?;

        Ok(PublicRecord {
            address,
            parameter_size,
            name,
        })
    }
}

/// A source line record, attributing a range of code to a line in a source
/// file.
///
/// Line records carry no prefix; any line that does not start with a known
/// record identifier is parsed as a line record belonging to the most recent
/// `FUNC` record.
///
/// Example: `c184 7 59 4`
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LineRecord {
    /// The start address of the covered code relative to the module base.
    pub address: u64,
    /// The size of the covered code in bytes.
    pub size: u64,
    /// The line number. Always greater than zero.
    pub line: u32,
    /// Identifier of the [`FileRecord`] naming the source file.
    pub file_id: u32,
}

impl LineRecord {
    /// Parses a line record from a single line.
    pub fn parse(input: &str) -> ParseResult<Self> {
        let (address, rest) = next_and(input, parse_hex64)?;
        let (size, rest) = next_and(rest, parse_hex64)?;
        let (line, rest) = next_and(rest, |part| {
            let line = part.parse::<i64>().or(Err("expected number"))?;
            if line <= 0 || line > i64::from(u32::MAX) {
                return Err("line number out of range");
            }
            Ok(line as u32)
        })?;
        let (file_id, rest) = next_and(rest, parse_u32)?;
        done(rest)?;

        Ok(LineRecord {
            address,
            size,
            line,
            file_id,
        })
    }
}

/// A `STACK WIN` record, carrying MSVC-style unwind information for a range
/// of code.
///
/// All numeric fields are hexadecimal. If `has_program_string` is nonzero,
/// the final field is a postfix program for recovering the caller's
/// registers; otherwise it is a flag telling whether the function uses the
/// base pointer register as a general-purpose register.
///
/// Example: `STACK WIN 4 2170 14 1 0 0 0 0 0 1 $eip 4 + ^ = $esp $ebp 8 + = $ebp $ebp ^ =`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackWinRecord<'d> {
    /// The kind of frame data this record holds.
    pub kind: FrameInfoKind,
    /// The start of the covered range relative to the module base.
    pub rva: u64,
    /// The size of the covered code in bytes.
    pub code_size: u64,
    /// The size of the function prologue in bytes.
    pub prolog_size: u32,
    /// The size of the function epilogue in bytes.
    pub epilog_size: u32,
    /// The size of arguments passed to the function on the stack.
    pub parameter_size: u32,
    /// The size of callee-saved registers pushed by the function.
    pub saved_register_size: u32,
    /// The size of the function's local variables.
    pub local_size: u32,
    /// The maximum number of bytes the frame pushes on the stack.
    pub max_stack_size: u32,
    /// Whether the function uses the base pointer register as a
    /// general-purpose register.
    pub allocates_base_pointer: bool,
    /// The unwind program. May contain spaces.
    pub program_string: Option<&'d str>,
}

impl<'d> StackWinRecord<'d> {
    /// Parses a Windows stack record from a single line.
    ///
    /// Only the `WIN` dialect is understood; `STACK` records for other
    /// dialects are rejected.
    pub fn parse(input: &'d str) -> ParseResult<Self> {
        let rest = input.strip_prefix("STACK ").ok_or("expected STACK record")?;

        let (dialect, rest) = next(rest.trim_start())?;
        if dialect != "WIN" {
            return Err("unsupported stack info dialect");
        }

        let (kind, rest) = next_and(rest, |part| {
            FrameInfoKind::from_u32(parse_hex32(part)?).ok_or("invalid stack info type")
        })?;

        let (rva, rest) = next_and(rest, parse_hex64)?;
        let (code_size, rest) = next_and(rest, parse_hex64)?;
        let (prolog_size, rest) = next_and(rest, parse_hex32)?;
        let (epilog_size, rest) = next_and(rest, parse_hex32)?;
        let (parameter_size, rest) = next_and(rest, parse_hex32)?;
        let (saved_register_size, rest) = next_and(rest, parse_hex32)?;
        let (local_size, rest) = next_and(rest, parse_hex32)?;
        let (max_stack_size, rest) = next_and(rest, parse_hex32)?;
        let (has_program_string, rest) = next_and(rest, parse_hex32)?;

        let (allocates_base_pointer, program_string) = if has_program_string != 0 {
            (false, Some(remainder(rest, "missing program string")?))
        } else {
            let (flag, rest) = next_and(rest, parse_hex32)?;
            done(rest)?;
            (flag != 0, None)
        };

        Ok(StackWinRecord {
            kind,
            rva,
            code_size,
            prolog_size,
            epilog_size,
            parameter_size,
            saved_register_size,
            local_size,
            max_stack_size,
            allocates_base_pointer,
            program_string,
        })
    }

    /// Builds the frame info carried by this record. All fields are marked
    /// valid.
    pub fn frame_info(&self) -> FrameInfo {
        FrameInfo {
            valid: FrameInfo::VALID_ALL,
            prolog_size: self.prolog_size,
            epilog_size: self.epilog_size,
            parameter_size: self.parameter_size,
            saved_register_size: self.saved_register_size,
            local_size: self.local_size,
            max_stack_size: self.max_stack_size,
            allocates_base_pointer: self.allocates_base_pointer,
            program_string: self.program_string.unwrap_or_default().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parse_file_record() {
        let record = FileRecord::parse("FILE 37 /usr/include/libkern/i386/_OSByteOrder.h").unwrap();
        assert_eq!(
            record,
            FileRecord {
                id: 37,
                path: "/usr/include/libkern/i386/_OSByteOrder.h",
            }
        );
    }

    #[test]
    fn parse_file_record_space() {
        let record = FileRecord::parse("FILE 38 /usr/local/src/filename with spaces.c").unwrap();
        assert_eq!(
            record,
            FileRecord {
                id: 38,
                path: "/usr/local/src/filename with spaces.c",
            }
        );
    }

    #[test]
    fn parse_file_record_negative_id() {
        assert!(FileRecord::parse("FILE -1 foo.c").is_err());
    }

    #[test]
    fn parse_file_record_missing_path() {
        assert!(FileRecord::parse("FILE 1").is_err());
        assert!(FileRecord::parse("FILE 1 ").is_err());
    }

    #[test]
    fn parse_func_record() {
        let record = FuncRecord::parse("FUNC 1730 1a 0 <name omitted>").unwrap();
        assert_eq!(
            record,
            FuncRecord {
                address: 0x1730,
                size: 0x1a,
                parameter_size: 0,
                name: "<name omitted>",
            }
        );
    }

    #[test]
    fn parse_func_record_no_name() {
        assert!(FuncRecord::parse("FUNC 1730 1a 0").is_err());
    }

    #[test]
    fn parse_func_record_bad_address() {
        assert!(FuncRecord::parse("FUNC xyz 1a 0 foo").is_err());
    }

    #[test]
    fn parse_public_record() {
        let record = PublicRecord::parse("PUBLIC 5180 0 __clang_call_terminate").unwrap();
        assert_eq!(
            record,
            PublicRecord {
                address: 0x5180,
                parameter_size: 0,
                name: "__clang_call_terminate",
            }
        );
    }

    #[test]
    fn parse_public_record_no_name() {
        assert!(PublicRecord::parse("PUBLIC 5180 0").is_err());
    }

    #[test]
    fn parse_line_record() {
        let record = LineRecord::parse("1730 6 93 20").unwrap();
        assert_eq!(
            record,
            LineRecord {
                address: 0x1730,
                size: 6,
                line: 93,
                file_id: 20,
            }
        );
    }

    #[test]
    fn parse_line_record_rejects_zero_line() {
        assert!(LineRecord::parse("1730 6 0 20").is_err());
    }

    #[test]
    fn parse_line_record_rejects_negative_line() {
        assert!(LineRecord::parse("e0fd10 5 -376 2225").is_err());
    }

    #[test]
    fn parse_line_record_rejects_trailing_data() {
        assert!(LineRecord::parse("1730 6 93 20 junk").is_err());
    }

    #[test]
    fn parse_stack_win_record_frame_data() {
        let record = StackWinRecord::parse(
            "STACK WIN 4 371a c 0 0 0 0 0 0 1 $T0 .raSearch = $eip $T0 ^ = $esp $T0 4 + =",
        )
        .unwrap();

        assert_eq!(
            record,
            StackWinRecord {
                kind: FrameInfoKind::FrameData,
                rva: 0x371a,
                code_size: 0xc,
                prolog_size: 0,
                epilog_size: 0,
                parameter_size: 0,
                saved_register_size: 0,
                local_size: 0,
                max_stack_size: 0,
                allocates_base_pointer: false,
                program_string: Some("$T0 .raSearch = $eip $T0 ^ = $esp $T0 4 + ="),
            }
        );
    }

    #[test]
    fn parse_stack_win_record_fpo() {
        let record = StackWinRecord::parse("STACK WIN 0 4aa8 e 0 0 4 0 0 0 0 1").unwrap();

        assert_eq!(record.kind, FrameInfoKind::Fpo);
        assert_eq!(record.rva, 0x4aa8);
        assert_eq!(record.code_size, 0xe);
        assert_eq!(record.parameter_size, 4);
        assert!(record.allocates_base_pointer);
        assert_eq!(record.program_string, None);
    }

    #[test]
    fn parse_stack_win_record_reserved_kind() {
        // Types 1 and 2 are reserved but accepted.
        let record = StackWinRecord::parse("STACK WIN 1 1000 10 0 0 0 0 0 0 0 0").unwrap();
        assert_eq!(record.kind, FrameInfoKind::Trap);
    }

    #[test]
    fn parse_stack_win_record_rejects_unknown_kind() {
        assert!(StackWinRecord::parse("STACK WIN 5 1000 10 0 0 0 0 0 0 0 0").is_err());
    }

    #[test]
    fn parse_stack_win_record_rejects_other_dialects() {
        let result = StackWinRecord::parse("STACK CFI INIT 1880 2d .cfa: $rsp 8 +");
        assert_eq!(result, Err("unsupported stack info dialect"));
    }

    #[test]
    fn parse_stack_win_record_truthy_program_flag() {
        // Any nonzero value announces a program string, not just 1.
        let record = StackWinRecord::parse("STACK WIN 4 1000 10 0 0 0 0 0 0 2 $ebp ^ =").unwrap();
        assert_eq!(record.program_string, Some("$ebp ^ ="));
    }

    #[test]
    fn parse_stack_win_record_missing_fields() {
        assert!(StackWinRecord::parse("STACK WIN 4 1000 10 0 0 0 0").is_err());
    }

    #[test]
    fn frame_info_from_record() {
        let record = StackWinRecord::parse("STACK WIN 4 1000 10 2 1 8 4 10 20 1 $ebp ^ =").unwrap();
        let info = record.frame_info();

        assert_eq!(info.valid, FrameInfo::VALID_ALL);
        assert_eq!(info.prolog_size, 2);
        assert_eq!(info.epilog_size, 1);
        assert_eq!(info.parameter_size, 8);
        assert_eq!(info.saved_register_size, 4);
        assert_eq!(info.local_size, 0x10);
        assert_eq!(info.max_stack_size, 0x20);
        assert!(!info.allocates_base_pointer);
        assert_eq!(info.program_string, "$ebp ^ =");
    }
}

/// The code module a stack frame's instruction belongs to.
///
/// Only the two fields consulted during lookup are modeled here: the file
/// name keys the resolver's module table, and the base address rebases
/// instruction addresses into module-relative addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeModule {
    /// The path or name of the module's code file, as reported by the crash
    /// dump.
    pub code_file: String,
    /// The address at which the module was loaded in the crashed process.
    pub base_address: u64,
}

/// A single frame of a crashed thread's stack.
///
/// The stack walker produces frames with `instruction` and `module` filled
/// in; lookup populates the remaining fields where symbol data is available.
/// Fields stay `None` when the module carries no matching record.
#[derive(Clone, Debug, Default)]
pub struct StackFrame {
    /// The address of the instruction this frame is executing.
    ///
    /// For the topmost frame this is the faulting instruction; for calling
    /// frames it is derived from the return address.
    pub instruction: u64,

    /// The module containing the instruction, if the stack walker could
    /// determine one.
    pub module: Option<CodeModule>,

    /// The name of the function containing the instruction.
    pub function_name: Option<String>,

    /// The load address of the function named in `function_name`.
    pub function_base: Option<u64>,

    /// The source file containing the instruction.
    pub source_file_name: Option<String>,

    /// The line number within `source_file_name`.
    pub source_line: Option<u32>,

    /// The load address of the first instruction attributed to
    /// `source_line`.
    pub source_line_base: Option<u64>,
}

impl StackFrame {
    /// Creates a frame for an instruction within the given module.
    pub fn with_module(instruction: u64, module: CodeModule) -> Self {
        StackFrame {
            instruction,
            module: Some(module),
            ..Default::default()
        }
    }
}

/// The kind of data a `STACK WIN` record holds.
///
/// This mirrors MS DIA's `StackFrameTypeEnum`. All kinds share one record
/// layout in the symbol file; they are kept in separate maps because records
/// of different kinds may cover overlapping address ranges. Only
/// [`FrameData`](FrameInfoKind::FrameData) and [`Fpo`](FrameInfoKind::Fpo)
/// are consulted during lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameInfoKind {
    /// Frame pointer omitted; FPO info available.
    Fpo = 0,
    /// Trap frame.
    Trap = 1,
    /// Task switch frame.
    Tss = 2,
    /// Standard frame with a frame pointer.
    Standard = 3,
    /// Frame pointer omitted; frame data info with an unwind program
    /// available.
    FrameData = 4,
}

impl FrameInfoKind {
    /// The number of distinct kinds, and thus of frame info maps in a
    /// module.
    pub const COUNT: usize = 5;

    /// Returns the kind for its numeric value in a `STACK WIN` record.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(FrameInfoKind::Fpo),
            1 => Some(FrameInfoKind::Trap),
            2 => Some(FrameInfoKind::Tss),
            3 => Some(FrameInfoKind::Standard),
            4 => Some(FrameInfoKind::FrameData),
            _ => None,
        }
    }

    /// The index of this kind's map within a module.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Stack frame unwinding information for a range of code.
///
/// Carries the data of one `STACK WIN` record. The `valid` mask declares
/// which fields hold meaningful values; lookup synthesizes infos carrying
/// only a parameter size when a function or public symbol matched but no
/// `STACK WIN` record covers the address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Bitmask of `VALID_*` constants declaring which fields are set.
    pub valid: u32,
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
    /// Whether the function uses the base pointer register for general
    /// purposes. Only meaningful for FPO records.
    pub allocates_base_pointer: bool,
    /// A postfix program recovering the caller's registers. Only present in
    /// frame data records; empty otherwise.
    pub program_string: String,
}

impl FrameInfo {
    /// No field is valid.
    pub const VALID_NONE: u32 = 0;
    /// `parameter_size` is valid.
    pub const VALID_PARAMETER_SIZE: u32 = 1 << 0;
    /// `prolog_size` is valid.
    pub const VALID_PROLOG_SIZE: u32 = 1 << 1;
    /// `epilog_size` is valid.
    pub const VALID_EPILOG_SIZE: u32 = 1 << 2;
    /// `saved_register_size` is valid.
    pub const VALID_SAVED_REGISTER_SIZE: u32 = 1 << 3;
    /// `local_size` is valid.
    pub const VALID_LOCAL_SIZE: u32 = 1 << 4;
    /// `max_stack_size` is valid.
    pub const VALID_MAX_STACK_SIZE: u32 = 1 << 5;
    /// `allocates_base_pointer` is valid.
    pub const VALID_ALLOCATES_BASE_POINTER: u32 = 1 << 6;
    /// `program_string` is valid.
    pub const VALID_PROGRAM_STRING: u32 = 1 << 7;
    /// All fields are valid, as in infos built from a `STACK WIN` record.
    pub const VALID_ALL: u32 = Self::VALID_PARAMETER_SIZE
        | Self::VALID_PROLOG_SIZE
        | Self::VALID_EPILOG_SIZE
        | Self::VALID_SAVED_REGISTER_SIZE
        | Self::VALID_LOCAL_SIZE
        | Self::VALID_MAX_STACK_SIZE
        | Self::VALID_ALLOCATES_BASE_POINTER
        | Self::VALID_PROGRAM_STRING;

    /// Creates an info carrying only a parameter size, taken from a FUNC or
    /// PUBLIC record.
    pub fn with_parameter_size(parameter_size: u32) -> Self {
        FrameInfo {
            valid: Self::VALID_PARAMETER_SIZE,
            parameter_size,
            ..Default::default()
        }
    }
}

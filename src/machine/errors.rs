use cellvm_derive::Error;

/// Errors raised while loading, verifying or running an image.
///
/// Every variant has a stable numeric code (see [`AmxError::code`]); scripts
/// see the same numbers through `HALT` and hosts can map them back with
/// [`AmxError::from_code`]. Success is `Ok(..)`, so there is no "none" variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum AmxError {
    /// Forced exit, requested by the script or a native.
    #[error("forced exit")]
    Exit,
    /// Assertion failed.
    #[error("assertion failed")]
    Assert,
    /// Stack and heap would collide.
    #[error("stack/heap collision")]
    StackErr,
    /// Array index out of bounds.
    #[error("index out of bounds")]
    Bounds,
    /// Memory access outside the data segment or into the stack/heap gap.
    #[error("invalid memory access")]
    MemAccess,
    /// Unknown or malformed instruction.
    #[error("invalid instruction")]
    InvInstr,
    /// Stack pointer moved above its starting point.
    #[error("stack underflow")]
    StackLow,
    /// Heap pointer moved below its starting point.
    #[error("heap underflow")]
    HeapLow,
    /// No native dispatcher installed, or it could not resolve the call.
    #[error("no native dispatcher")]
    Callback,
    /// A native function failed.
    #[error("native function failed")]
    Native,
    /// Division by zero.
    #[error("divide by zero")]
    Divide,
    /// Execution suspended; resume with a continue request.
    #[error("sleep")]
    Sleep,
    /// Operation not valid in the current context state.
    #[error("invalid state for this operation")]
    InvState,
    /// Out of memory.
    #[error("out of memory")]
    Memory,
    /// Image is malformed.
    #[error("invalid file format")]
    Format,
    /// Image requires a newer or older machine.
    #[error("file is for an unsupported version")]
    Version,
    /// Function, native or variable not found.
    #[error("not found")]
    NotFound,
    /// Index out of range for a table or entry point.
    #[error("invalid index")]
    Index,
    /// Debugger could not run.
    #[error("debugger cannot run")]
    Debug,
    /// Context not initialized.
    #[error("context not initialized")]
    Init,
    /// User data tag missing, or no free slot.
    #[error("unable to get or set user data")]
    UserData,
    /// Compiling executor could not be prepared.
    #[error("cannot initialize the compiling executor")]
    InitJit,
    /// Invalid parameter.
    #[error("parameter error")]
    Params,
    /// Result outside the function domain.
    #[error("domain error")]
    Domain,
    /// General error, unknown cause.
    #[error("general error")]
    General,
    /// Overlays are unsupported here or an overlay failed to load.
    #[error("overlay error")]
    Overlay,
    /// Script-defined exit code with no named meaning.
    #[error("exit code {0}")]
    Other(i32),
}

macro_rules! error_codes {
    ($( $variant:ident = $code:literal ),* $(,)?) => {
        impl AmxError {
            /// Stable numeric code for this error.
            pub fn code(self) -> i32 {
                match self {
                    $( AmxError::$variant => $code, )*
                    AmxError::Other(code) => code,
                }
            }

            /// Maps a numeric code back to an error. `0` is success and has no
            /// error; unknown codes become [`AmxError::Other`].
            pub fn from_code(code: i32) -> Option<AmxError> {
                match code {
                    0 => None,
                    $( $code => Some(AmxError::$variant), )*
                    other => Some(AmxError::Other(other)),
                }
            }
        }
    };
}

error_codes! {
    Exit = 1,
    Assert = 2,
    StackErr = 3,
    Bounds = 4,
    MemAccess = 5,
    InvInstr = 6,
    StackLow = 7,
    HeapLow = 8,
    Callback = 9,
    Native = 10,
    Divide = 11,
    Sleep = 12,
    InvState = 13,
    Memory = 16,
    Format = 17,
    Version = 18,
    NotFound = 19,
    Index = 20,
    Debug = 21,
    Init = 22,
    UserData = 23,
    InitJit = 24,
    Params = 25,
    Domain = 26,
    General = 27,
    Overlay = 28,
}

/// Errors produced by the assembler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    /// Unrecognized instruction mnemonic.
    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),
    /// Wrong number of operands for an instruction.
    #[error("operand count mismatch for {instruction}: expected {expected}, got {actual}")]
    ArityMismatch {
        instruction: String,
        expected: usize,
        actual: usize,
    },
    /// Operand is not a number, label or known name.
    #[error("invalid operand: {0}")]
    InvalidOperand(String),
    /// Label defined more than once.
    #[error("duplicate label: {0}")]
    DuplicateLabel(String),
    /// Reference to an undefined label.
    #[error("undefined label: {0}")]
    UndefinedLabel(String),
    /// Unknown `.directive`.
    #[error("unknown directive: {0}")]
    UnknownDirective(String),
    /// Public, native or variable name longer than the format allows.
    #[error("name too long: {0}")]
    NameTooLong(String),
    /// Name declared twice in the same table.
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    /// Instruction outside any code section.
    #[error("instruction outside a code section")]
    OutsideSection,
    /// Error with source location.
    #[error("line {line}: {message}")]
    Located {
        line: usize,
        offset: usize,
        message: String,
    },
    /// Tokenizer error with source location.
    #[error("line {line}: {message}")]
    Parse {
        line: usize,
        offset: usize,
        message: &'static str,
    },
    /// File I/O error.
    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },
}

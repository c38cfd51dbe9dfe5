//! Error types.
//!
//! Each subsystem raises its own small error enum; [`Error`] is the
//! umbrella type callers see at the crate boundary, matching the flat
//! variant table in the original specification while keeping call sites
//! that only ever touch one subsystem free of irrelevant variants.

use core::fmt;
use std::io;

/// Errors raised by [`crate::editor`] implementations.
#[derive(Debug)]
pub enum EditorError {
    /// The input was not a recognizable executable image for this format.
    Malformed(String),
    /// A queried or updated section does not exist.
    SectionNotFound(String),
    /// `inject_section` collided with an existing section name.
    SectionAlreadyExists(String),
    /// `calculate_va` offset was at or past the end of the section.
    InvalidOffset { section: String, offset: u64, size: u64 },
    /// The path passed to `save_changes` was empty or otherwise unusable.
    MalformedPath,
    Io(io::Error),
    Scroll(scroll::Error),
}

impl fmt::Display for EditorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditorError::Malformed(msg) => write!(f, "malformed executable image: {msg}"),
            EditorError::SectionNotFound(name) => write!(f, "section not found: {name}"),
            EditorError::SectionAlreadyExists(name) => {
                write!(f, "section already exists: {name}")
            }
            EditorError::InvalidOffset { section, offset, size } => write!(
                f,
                "offset {offset} is out of bounds for section {section} (size {size})"
            ),
            EditorError::MalformedPath => write!(f, "no writable destination path supplied"),
            EditorError::Io(e) => write!(f, "i/o error: {e}"),
            EditorError::Scroll(e) => write!(f, "binary parsing error: {e}"),
        }
    }
}

impl std::error::Error for EditorError {}

impl From<io::Error> for EditorError {
    fn from(e: io::Error) -> Self {
        EditorError::Io(e)
    }
}

impl From<scroll::Error> for EditorError {
    fn from(e: scroll::Error) -> Self {
        EditorError::Scroll(e)
    }
}

/// Errors raised by [`crate::cipher`].
#[derive(Debug)]
pub enum CipherError {
    /// Buffer length was not a multiple of the block size.
    NotAligned { len: usize, block_size: usize },
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherError::NotAligned { len, block_size } => write!(
                f,
                "buffer of length {len} is not a multiple of the block size {block_size}"
            ),
        }
    }
}

impl std::error::Error for CipherError {}

/// Errors raised by [`crate::emitter`].
#[derive(Debug)]
pub enum EmitterError {
    /// Wrong operand kind passed to an emitter marker method.
    InvalidOperand,
    /// `mark_as_free` was called on an operand previously marked untouchable.
    OperandIsUntouchable,
    /// The underlying assembler rejected the instruction stream.
    Encoding(String),
}

impl fmt::Display for EmitterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitterError::InvalidOperand => write!(f, "invalid operand kind for this operation"),
            EmitterError::OperandIsUntouchable => {
                write!(f, "operand is marked untouchable and cannot be freed")
            }
            EmitterError::Encoding(msg) => write!(f, "instruction encoding failed: {msg}"),
        }
    }
}

impl std::error::Error for EmitterError {}

/// Errors raised by [`crate::virus`].
#[derive(Debug)]
pub enum VirusError {
    FileAccessDenied(String),
    MalformedPath,
    FileWritingFailed(String),
    FileCopyFailed(String),
    NoTargetAttached,
    TargetNotExecuted,
    TargetAlreadyInExecution,
    Io(io::Error),
}

impl fmt::Display for VirusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirusError::FileAccessDenied(p) => write!(f, "access denied: {p}"),
            VirusError::MalformedPath => write!(f, "malformed path"),
            VirusError::FileWritingFailed(p) => write!(f, "failed writing file: {p}"),
            VirusError::FileCopyFailed(p) => write!(f, "failed copying file: {p}"),
            VirusError::NoTargetAttached => write!(f, "no target is currently attached"),
            VirusError::TargetNotExecuted => write!(f, "target has not been executed yet"),
            VirusError::TargetAlreadyInExecution => {
                write!(f, "target is already in execution")
            }
            VirusError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for VirusError {}

impl From<io::Error> for VirusError {
    fn from(e: io::Error) -> Self {
        VirusError::Io(e)
    }
}

/// Umbrella error type returned at the crate boundary.
#[derive(Debug)]
pub enum Error {
    Editor(EditorError),
    Cipher(CipherError),
    Emitter(EmitterError),
    Virus(VirusError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Editor(e) => write!(f, "{e}"),
            Error::Cipher(e) => write!(f, "{e}"),
            Error::Emitter(e) => write!(f, "{e}"),
            Error::Virus(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<EditorError> for Error {
    fn from(e: EditorError) -> Self {
        Error::Editor(e)
    }
}

impl From<CipherError> for Error {
    fn from(e: CipherError) -> Self {
        Error::Cipher(e)
    }
}

impl From<EmitterError> for Error {
    fn from(e: EmitterError) -> Self {
        Error::Emitter(e)
    }
}

impl From<VirusError> for Error {
    fn from(e: VirusError) -> Self {
        Error::Virus(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

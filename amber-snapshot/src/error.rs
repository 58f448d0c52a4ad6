// amber-snapshot - Snapshot image encoder/decoder for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Encoder and decoder error types.

/// The encoder refused to produce an image.
#[derive(Debug, Clone)]
pub enum EncodeError {
    /// An allocation's payload exceeds the 12-bit size field.
    AllocationTooLarge { size: usize },
    /// The whole image exceeds the 16-bit size field.
    ImageTooLarge { size: usize },
    /// A section outgrew its 14-bit logical address window.
    SectionOverflow { section: &'static str },
    /// An ephemeral host handle is reachable from the root set; ephemerals
    /// exist only during initialization and cannot be carried to a device.
    EphemeralInSnapshot,
    /// A value references something outside the captured graph.
    DanglingReference(String),
    /// Anything else the format cannot express.
    Unencodable(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::AllocationTooLarge { size } => {
                write!(f, "Allocation of {} bytes exceeds the 4095-byte limit", size)
            }
            EncodeError::ImageTooLarge { size } => {
                write!(f, "Image of {} bytes exceeds the 64 kB limit", size)
            }
            EncodeError::SectionOverflow { section } => {
                write!(f, "Section '{}' overflows its address window", section)
            }
            EncodeError::EphemeralInSnapshot => {
                write!(f, "An ephemeral host value is reachable from the snapshot roots")
            }
            EncodeError::DanglingReference(what) => {
                write!(f, "Dangling reference: {}", what)
            }
            EncodeError::Unencodable(what) => write!(f, "Cannot encode: {}", what),
        }
    }
}

impl std::error::Error for EncodeError {}

/// The decoder rejected an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidBytecode {
    /// The declared size does not match the file length.
    SizeMismatch { declared: u16, actual: usize },
    /// The declared header size is not this format's.
    HeaderSizeMismatch { declared: u8, expected: u8 },
    /// The stored CRC does not validate over bytes [6, end).
    CrcMismatch { expected: u16, actual: u16 },
    /// Bytecode or engine version is not the supported one.
    VersionMismatch {
        field: &'static str,
        declared: u32,
        supported: u32,
    },
    /// The image requires feature flags this implementation lacks.
    FeatureMismatch { declared: u32, supported: u32 },
    /// The image ends in the middle of a field.
    Truncated { at: usize },
    /// Structurally invalid content.
    Malformed(String),
}

impl std::fmt::Display for InvalidBytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidBytecode::SizeMismatch { declared, actual } => {
                write!(f, "Size mismatch: header says {} bytes, file is {}", declared, actual)
            }
            InvalidBytecode::HeaderSizeMismatch { declared, expected } => {
                write!(f, "Header size mismatch: {} declared, {} expected", declared, expected)
            }
            InvalidBytecode::CrcMismatch { expected, actual } => {
                write!(f, "CRC mismatch: stored {:#06x}, computed {:#06x}", expected, actual)
            }
            InvalidBytecode::VersionMismatch {
                field,
                declared,
                supported,
            } => {
                write!(f, "{} mismatch: image has {}, this build supports {}", field, declared, supported)
            }
            InvalidBytecode::FeatureMismatch {
                declared,
                supported,
            } => {
                write!(
                    f,
                    "Required feature flags {:#010x} exceed supported {:#010x}",
                    declared, supported
                )
            }
            InvalidBytecode::Truncated { at } => {
                write!(f, "Image truncated at offset {}", at)
            }
            InvalidBytecode::Malformed(what) => write!(f, "Malformed image: {}", what),
        }
    }
}

impl std::error::Error for InvalidBytecode {}

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ClassReadError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid magic 0x{0:08x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool tag {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid constant pool index {0}")]
    InvalidIndex(u16),
    #[error("invalid attribute {0}")]
    InvalidAttribute(String),
    #[error("invalid opcode 0x{opcode:02x} at {offset}")]
    InvalidOpcode {
        /// The opcode that caused the error.
        opcode: u8,
        /// Offset into the byte sequence where the error occurred.
        offset: usize,
    },
    #[error("modified utf8 error: {0}")]
    Utf8Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassWriteError {
    #[error("missing constant pool")]
    MissingConstantPool,
    #[error("constant pool overflow")]
    ConstantPoolOverflow,
    #[error("unresolved label {0}")]
    UnresolvedLabel(usize),
    #[error("branch to label {label} out of 16-bit range ({distance})")]
    BranchOutOfRange { label: usize, distance: i64 },
    #[error("stack map frame before any instruction offset")]
    MisplacedFrame,
    #[error("method body exceeds 65535 bytes")]
    OversizedBody,
}

/// One failed class within a batch transformation.
#[derive(Debug)]
pub struct BatchFailure {
    pub class: String,
    pub operation: String,
    pub cause: String,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> {}: {}", self.class, self.operation, self.cause)
    }
}

/// The single error kind of the rewriter. Variants follow the failure
/// surfaces: configuration problems are raised while a plan is built, shape
/// problems while a class tree is rewritten, codec problems wrap the class
/// name around the underlying read/write error, and host problems come from
/// the class-loading domain or the ambient resource store.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentationError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("{class}: {reason}")]
    Shape { class: String, reason: String },
    #[error("could not decode {class}")]
    Decode {
        class: String,
        #[source]
        source: ClassReadError,
    },
    #[error("could not encode {class}")]
    Encode {
        class: String,
        #[source]
        source: ClassWriteError,
    },
    #[error("host: {0}")]
    Host(String),
    #[error("{} classes failed:\n{}", .0.len(), join_failures(.0))]
    Batch(Vec<BatchFailure>),
}

fn join_failures(failures: &[BatchFailure]) -> String {
    failures
        .iter()
        .map(BatchFailure::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl InstrumentationError {
    pub fn shape(class: &str, reason: impl Into<String>) -> Self {
        InstrumentationError::Shape {
            class: class.replace('/', "."),
            reason: reason.into(),
        }
    }
}

//! Weaves the Handler Pattern into compiled JVM class files.
//!
//! A *handler interface* declares which methods of a *handlee* class are
//! intercepted. Rewriting the handlee's compiled form makes every instance
//! castable to the interface and routes every intercepted call through a
//! mutable, volatile handler slot — installing a different handler redirects
//! all calls, no reflection involved. See [`instrument`] for the full worked
//! example of what the rewrite produces.
//!
//! Typical flow:
//!
//! ```no_run
//! use classweave::agent::Agent;
//! use classweave::loader::DirResources;
//!
//! # fn main() -> Result<(), classweave::error::InstrumentationError> {
//! let resources = DirResources::new(["classes".into()]);
//! let agent = Agent::new("my.CallHandler=my.Service", Box::new(resources))?;
//! // on each class-load event reported by the host runtime:
//! # let bytes: &[u8] = &[];
//! let rewritten = agent.transform("my/Service", bytes)?;
//! # Ok(())
//! # }
//! ```
//!
//! The pieces compose individually as well: [`class_reader`] and
//! [`class_writer`] are the class-file codec, [`spec`] derives the rewrite
//! contract from a handler interface, [`instrument`] mutates handlee trees,
//! [`deps`] and [`loader`] define the results into a class-loading domain in
//! dependency order.
//!
//! Encoded classes carry explicit stack map frames; nothing in this crate
//! ever computes frames, because doing so forces class loading for common
//! supertypes and fails for classes that are themselves still being
//! rewritten.

pub mod agent;
pub mod builder;
pub mod class_reader;
pub mod class_writer;
pub mod deps;
pub mod error;
pub mod insn;
pub mod instrument;
pub mod loader;
pub mod macros;
pub mod names;
pub mod nodes;
pub mod opcodes;
pub mod spec;

pub use agent::Agent;
pub use class_reader::ClassReader;
pub use class_writer::ClassWriter;
pub use error::{ClassReadError, ClassWriteError, InstrumentationError};
pub use instrument::{HandlerInstrumentation, Instrumentor};
pub use loader::Loader;
pub use nodes::ClassNode;
pub use spec::{HandlerSpec, NullGuard};

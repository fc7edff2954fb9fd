//! Class-load-time frontend: parses a configuration string into handler
//! setups and rewrites matching classes as they are loaded.
//!
//! Configuration grammar (no whitespace tolerated):
//!
//! ```text
//! args  := setup (';' setup)*
//! setup := handler (':' spawner)? ('=' handlee (',' handlee)*)?
//! ```
//!
//! where every name is a dotted binary name and the spawner carries a
//! trailing `.method` segment, e.g.
//!
//! ```text
//! my.Handler
//! my.Handler=my.Handlee
//! my.Handler:my.Spawners.spawn=my.Handlee1,my.Handlee2$Inner
//! my.HandlerWithAnnotation;my.Handler2=my.Handlee
//! ```
//!
//! A setup without `=` contributes no explicit handlees — the handlees
//! declared by the interface's `Instruments` annotation still apply.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::class_reader::ClassReader;
use crate::class_writer::ClassWriter;
use crate::error::InstrumentationError;
use crate::instrument::HandlerInstrumentation;
use crate::loader::ResourceStore;
use crate::names;
use crate::spec::{HandlerSpec, NullGuard};

const SETUP_SEPARATOR: char = ';';
const SPAWNER_SEPARATOR: char = ':';
const HANDLEE_ASSOCIATOR: char = '=';
const HANDLEE_SEPARATOR: char = ',';

/// One parsed `handler (':' spawner)? ('=' handlee…)?` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSetup {
    pub handler: String,
    pub spawner: Option<String>,
    pub handlees: Vec<String>,
}

impl HandlerSetup {
    pub fn parse_args(args: &str) -> Result<Vec<HandlerSetup>, InstrumentationError> {
        if args.is_empty() {
            return Err(InstrumentationError::Configuration(
                "missing handler class specification".to_string(),
            ));
        }
        args.split(SETUP_SEPARATOR).map(Self::parse).collect()
    }

    fn parse(setup: &str) -> Result<HandlerSetup, InstrumentationError> {
        let (head, handlee_list) = match setup.split_once(HANDLEE_ASSOCIATOR) {
            Some((head, rest)) => (head, Some(rest)),
            None => (setup, None),
        };
        let (handler, spawner) = match head.split_once(SPAWNER_SEPARATOR) {
            Some((handler, spawner)) => (handler, Some(spawner.to_string())),
            None => (head, None),
        };
        let handlees: Vec<String> = handlee_list
            .map(|list| {
                list.split(HANDLEE_SEPARATOR)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        for name in std::iter::once(handler)
            .chain(spawner.as_deref())
            .chain(handlees.iter().map(String::as_str))
        {
            if name.is_empty() {
                return Err(InstrumentationError::Configuration(format!(
                    "empty name in setup \"{setup}\""
                )));
            }
            if name.contains(char::is_whitespace) {
                return Err(InstrumentationError::Configuration(format!(
                    "whitespace in name \"{name}\""
                )));
            }
        }
        Ok(HandlerSetup {
            handler: handler.to_string(),
            spawner,
            handlees,
        })
    }
}

type Plan = HashMap<String, Arc<HandlerInstrumentation>>;

/// The transform hook the host runtime calls on every class-load event.
/// The plan is built lazily on the first call — exactly one thread builds
/// it, everyone else waits and then reads lock-free.
pub struct Agent {
    setups: Vec<HandlerSetup>,
    resources: Box<dyn ResourceStore>,
    plan: OnceCell<Plan>,
}

impl Agent {
    /// Parse the configuration string now; handler interfaces are resolved
    /// on the first transform call, when the resource store can see them.
    pub fn new(
        args: &str,
        resources: Box<dyn ResourceStore>,
    ) -> Result<Self, InstrumentationError> {
        Ok(Self {
            setups: HandlerSetup::parse_args(args)?,
            resources,
            plan: OnceCell::new(),
        })
    }

    /// Rewrite `bytes` if the loading class is in the plan; otherwise return
    /// them unchanged. `binary_name` may be dotted or slashed — hosts report
    /// the internal spelling.
    pub fn transform(
        &self,
        binary_name: &str,
        bytes: &[u8],
    ) -> Result<Vec<u8>, InstrumentationError> {
        let plan = self.plan.get_or_try_init(|| self.build_plan())?;
        let name = names::to_binary(binary_name);
        let Some(instrumentation) = plan.get(&name) else {
            trace!(class = %name, "pass-through");
            return Ok(bytes.to_vec());
        };
        debug!(class = %name, "transforming");
        let tree = ClassReader::new(bytes)
            .to_class_node()
            .map_err(|source| InstrumentationError::Decode {
                class: name.clone(),
                source,
            })?;
        let rewritten = instrumentation.instrument(tree)?;
        ClassWriter::to_bytes(&rewritten).map_err(|source| InstrumentationError::Encode {
            class: name,
            source,
        })
    }

    fn build_plan(&self) -> Result<Plan, InstrumentationError> {
        let mut plan = Plan::new();
        for setup in &self.setups {
            let bytes = self.resources.class_bytes(&setup.handler).ok_or_else(|| {
                InstrumentationError::Configuration(format!(
                    "unresolvable handler interface {}",
                    setup.handler
                ))
            })?;
            let handler =
                ClassReader::new(&bytes)
                    .to_codeless_node()
                    .map_err(|source| InstrumentationError::Decode {
                        class: setup.handler.clone(),
                        source,
                    })?;
            let spec = HandlerSpec::analyze(
                &handler,
                NullGuard::default(),
                setup.spawner.as_deref(),
                None,
            )?;
            let annotated = spec.instruments.clone();
            let instrumentation = Arc::new(HandlerInstrumentation::new(spec));
            for handlee in setup.handlees.iter().chain(annotated.iter()) {
                plan.insert(handlee.clone(), Arc::clone(&instrumentation));
            }
            debug!(
                handler = %setup.handler,
                handlees = setup.handlees.len() + annotated.len(),
                "registered"
            );
        }
        Ok(plan)
    }
}

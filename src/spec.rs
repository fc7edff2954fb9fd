//! Derives the rewrite contract of a handler interface.
//!
//! The interface is a declarative configuration: every declared method whose
//! first argument is the interface itself is an intercepted signature; a
//! method shaped `() → H` named after the interface is an accessor for the
//! handler slot, `(H) → void` a mutator. Class-level annotations declare the
//! default handlee set (`Instruments`) and the default spawner (`SpawnsWith`).

use tracing::debug;

use crate::class_reader::{decode_annotations, Annotation, ElementValue};
use crate::error::InstrumentationError;
use crate::names;
use crate::nodes::{AttributeInfo, ClassNode};
use crate::opcodes;

/// How a dispatch method is protected from reading a null handler slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NullGuard {
    /// Assign `this` before the super-initializer runs. Fast, but the
    /// produced bytecode violates initialization verification on 1.7+ VMs.
    AssignBeforeSuper,
    /// Assign right after the super-initializer. Verifier-clean, but the
    /// slot is still null while the super-initializer runs.
    AssignAfterSuper,
    /// Null-test the slot on every dispatch. One load, one compare and one
    /// branch per call, robust under inheritance.
    #[default]
    CheckBeforeCall,
}

/// A static method supplying the handler used when none is installed.
/// Shape is fixed: `static H method(H)`, must not return null, must not
/// declare checked throwables; returning the argument means "no override".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerRef {
    /// Internal name of the declaring class.
    pub owner: String,
    pub method: String,
    pub descriptor: String,
}

impl SpawnerRef {
    /// Parse a `pkg.Class.method` reference (the last `.`-separated segment
    /// is the method name). Fails at configuration time, never at rewrite
    /// time.
    pub fn parse(reference: &str, handler_descriptor: &str) -> Result<Self, InstrumentationError> {
        let internal = names::to_internal(reference);
        let split = internal.rfind('/').ok_or_else(|| {
            InstrumentationError::Configuration(format!(
                "spawner reference {reference} has no method suffix"
            ))
        })?;
        let (owner, method) = (&internal[..split], &internal[split + 1..]);
        if owner.is_empty() || method.is_empty() {
            return Err(InstrumentationError::Configuration(format!(
                "spawner reference {reference} is incomplete"
            )));
        }
        Ok(SpawnerRef {
            owner: owner.to_string(),
            method: method.to_string(),
            descriptor: format!("({handler_descriptor}){handler_descriptor}"),
        })
    }
}

/// The derived contract of a handler interface, reused across every handlee
/// instrumented under it.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    /// Internal name of the handler interface.
    pub handler_internal: String,
    /// `L…;` descriptor of the handler interface.
    pub handler_descriptor: String,
    pub simple_name: String,
    /// Intercepted signatures in canonical `name(argsAfterFirst)ret` form,
    /// in declaration order.
    pub intercepted: Vec<String>,
    pub accessors: Vec<String>,
    pub mutators: Vec<String>,
    pub guard: NullGuard,
    pub spawner: Option<SpawnerRef>,
    pub native_prefix: Option<String>,
    /// Handlee binary names declared by the interface's `Instruments`
    /// annotation.
    pub instruments: Vec<String>,
}

impl HandlerSpec {
    /// Analyze a handler interface tree. `spawner` overrides the
    /// `SpawnsWith` annotation when given; the native prefix is discarded
    /// for interfaces compiled before the agent-capable baseline.
    pub fn analyze(
        handler: &ClassNode,
        guard: NullGuard,
        spawner: Option<&str>,
        native_prefix: Option<&str>,
    ) -> Result<HandlerSpec, InstrumentationError> {
        if opcodes::is_none_of(opcodes::ACC_INTERFACE, handler.access_flags) {
            return Err(InstrumentationError::shape(
                &handler.name,
                "handler type must be an interface",
            ));
        }

        let handler_descriptor = names::object_descriptor(&handler.name);
        let simple = names::simple_name(&handler.name).to_string();
        let camel = names::downcase_first(&simple);
        let accessor_descriptor = format!("(){handler_descriptor}");
        let mutator_descriptor = format!("({handler_descriptor})V");

        let mut intercepted = Vec::new();
        let mut accessors = Vec::new();
        let mut mutators = Vec::new();
        for method in &handler.methods {
            let named_after_handler = method.name == format!("get{simple}")
                || method.name == simple
                || method.name == camel;
            let named_mutator = method.name == format!("set{simple}")
                || method.name == simple
                || method.name == camel;
            if method.descriptor == accessor_descriptor && named_after_handler {
                accessors.push(method.name.clone());
            } else if method.descriptor == mutator_descriptor && named_mutator {
                mutators.push(method.name.clone());
            } else if let Some(key) =
                intercepted_key(&method.name, &method.descriptor, &handler_descriptor)
            {
                intercepted.push(key);
            }
        }

        let annotations = class_annotations(handler);
        let spawner = match spawner {
            Some(reference) => Some(SpawnerRef::parse(reference, &handler_descriptor)?),
            None => annotated_spawner(&annotations)
                .map(|reference| SpawnerRef::parse(&reference, &handler_descriptor))
                .transpose()?,
        };
        let instruments = annotated_targets(&annotations);

        // The prefix mechanism needs the 1.6 agent API; older interfaces
        // silently lose it.
        let native_prefix = if handler.major_version >= opcodes::V1_6 {
            native_prefix.map(|prefix| prefix.to_string())
        } else {
            None
        };

        debug!(
            handler = %handler.name,
            intercepted = intercepted.len(),
            accessors = accessors.len(),
            mutators = mutators.len(),
            "analyzed handler interface"
        );

        Ok(HandlerSpec {
            handler_internal: handler.name.clone(),
            handler_descriptor,
            simple_name: simple,
            intercepted,
            accessors,
            mutators,
            guard,
            spawner,
            native_prefix,
            instruments,
        })
    }

    pub fn uses_spawner(&self) -> bool {
        self.spawner.is_some()
    }
}

/// Canonical signature of an intercepted method, or `None` when the first
/// argument is not the handler type.
fn intercepted_key(name: &str, descriptor: &str, handler_descriptor: &str) -> Option<String> {
    let parsed = names::MethodDescriptor::parse(descriptor)?;
    if parsed.args.first().map(String::as_str) != Some(handler_descriptor) {
        return None;
    }
    names::signature_without_first_arg(name, descriptor)
}

fn class_annotations(node: &ClassNode) -> Vec<Annotation> {
    let mut annotations = Vec::new();
    for attr in &node.attributes {
        if let AttributeInfo::Unknown { name, info } = attr {
            if name == "RuntimeInvisibleAnnotations" || name == "RuntimeVisibleAnnotations" {
                if let Ok(mut decoded) = decode_annotations(info, &node.constant_pool) {
                    annotations.append(&mut decoded);
                }
            }
        }
    }
    annotations
}

/// Annotation types are matched by simple name so the marker annotations can
/// live in any package.
fn annotation_named<'a>(annotations: &'a [Annotation], simple: &str) -> Option<&'a Annotation> {
    annotations.iter().find(|annotation| {
        let descriptor = annotation.type_descriptor.as_str();
        descriptor == format!("L{simple};")
            || descriptor.ends_with(&format!("/{simple};"))
            || descriptor.ends_with(&format!("${simple};"))
    })
}

fn element_value<'a>(annotation: &'a Annotation, name: &str) -> Option<&'a ElementValue> {
    annotation
        .values
        .iter()
        .find(|(element, _)| element == name)
        .map(|(_, value)| value)
}

fn annotated_spawner(annotations: &[Annotation]) -> Option<String> {
    let annotation = annotation_named(annotations, "SpawnsWith")?;
    match element_value(annotation, "value")? {
        ElementValue::Const { text: Some(text), .. } => Some(text.clone()),
        _ => None,
    }
}

fn annotated_targets(annotations: &[Annotation]) -> Vec<String> {
    let Some(annotation) = annotation_named(annotations, "Instruments") else {
        return Vec::new();
    };
    let Some(ElementValue::Array(values)) = element_value(annotation, "value") else {
        return Vec::new();
    };
    values
        .iter()
        .filter_map(|value| match value {
            ElementValue::Class(descriptor) => Some(names::to_binary(
                names::descriptor_to_internal(descriptor),
            )),
            _ => None,
        })
        .collect()
}

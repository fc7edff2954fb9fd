//! Rewrites a handlee class so it applies the Handler Pattern.
//!
//! For every intercepted signature the handlee ends up with two methods: the
//! original body, re-signatured to take the handler as its first argument,
//! and a dispatch method under the original name and descriptor whose body
//! routes the call through the handler slot. Installing a different handler
//! redirects every intercepted call; a cast to the handler interface is all
//! user code needs.
//!
//! Given
//!
//! ```text
//! public final class Caster {
//!     public int charToInt(char c) { return (int) c; }
//! }
//! ```
//!
//! and the handler interface
//!
//! ```text
//! public interface CharToIntHandler {
//!     int charToInt(CharToIntHandler handler, char c);
//!     void setCharToIntHandler(CharToIntHandler handler);
//! }
//! ```
//!
//! the rewritten `Caster` is equivalent to
//!
//! ```text
//! public final class Caster implements CharToIntHandler {
//!     public transient volatile CharToIntHandler charToIntHandler;
//!
//!     public int charToInt(CharToIntHandler handler, char c) { return (int) c; }
//!
//!     public int charToInt(char c) {
//!         CharToIntHandler h = this.charToIntHandler;
//!         if (h == null) h = this;               // or a spawner call
//!         return h.charToInt(this, c);
//!     }
//!
//!     public void setCharToIntHandler(CharToIntHandler handler) {
//!         this.charToIntHandler = handler == null ? this : handler;
//!     }
//! }
//! ```
//!
//! The rewrite is not idempotent — a class must not be instrumented twice —
//! and on any error the tree is dropped rather than returned half-mutated.

use std::collections::HashMap;

use tracing::debug;

use crate::class_reader::ClassReader;
use crate::class_writer::ClassWriter;
use crate::insn_list;
use crate::deps::DependencyTree;
use crate::error::{BatchFailure, InstrumentationError};
use crate::insn::{BodyNode, FrameNode, FrameValue, Insn, LocalVariableNode};
use crate::loader::ResourceStore;
use crate::names;
use crate::names::MethodDescriptor;
use crate::nodes::{ClassNode, FieldNode, MethodBody, MethodNode};
use crate::opcodes::{self, is_some_of};
use crate::spec::{HandlerSpec, NullGuard};

/// A reusable rewrite derived from one handler interface. One instance
/// instruments any number of handlees; each call works on its own tree.
pub struct HandlerInstrumentation {
    spec: HandlerSpec,
}

impl HandlerInstrumentation {
    pub fn new(spec: HandlerSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    /// Rewrite `handlee` under this instrumentation's handler interface.
    /// Takes the tree by value: on failure it is dropped, a partially
    /// rewritten tree never escapes.
    pub fn instrument(&self, mut handlee: ClassNode) -> Result<ClassNode, InstrumentationError> {
        let spec = &self.spec;
        if handlee
            .interfaces
            .iter()
            .any(|name| name == &spec.handler_internal)
        {
            return Err(InstrumentationError::shape(
                &handlee.name,
                format!(
                    "already instrumented for {}",
                    names::to_binary(&spec.handler_internal)
                ),
            ));
        }
        handlee.interfaces.push(spec.handler_internal.clone());

        let field_name = self.install_handler_slot(&mut handlee);
        let class_name = handlee.name.clone();
        debug!(class = %class_name, handler = %spec.handler_internal, field = %field_name, "instrumenting");

        let mut remaining: Vec<Option<String>> =
            spec.intercepted.iter().cloned().map(Some).collect();
        let mut appended: Vec<MethodNode> = Vec::new();

        for index in 0..handlee.methods.len() {
            let (name, descriptor) = {
                let method = &handlee.methods[index];
                (method.name.clone(), method.descriptor.clone())
            };
            if name == "<init>" {
                self.patch_constructor(&class_name, &field_name, &mut handlee.methods[index])?;
                continue;
            }
            let key = format!("{name}{descriptor}");
            let Some(position) = remaining
                .iter()
                .position(|entry| entry.as_deref() == Some(key.as_str()))
            else {
                continue;
            };
            remaining[position] = None;

            let method = &mut handlee.methods[index];
            let invalid = opcodes::ACC_ABSTRACT
                | opcodes::ACC_STATIC
                | if spec.native_prefix.is_none() {
                    opcodes::ACC_NATIVE
                } else {
                    0
                };
            if is_some_of(invalid, method.access_flags) {
                return Err(InstrumentationError::shape(
                    &class_name,
                    format!(
                        "{}{} must not be abstract, static or native",
                        method.name, method.descriptor
                    ),
                ));
            }

            let mut dispatch = self.make_dispatch(&class_name, &field_name, method)?;
            // Annotations, parameter annotations and default values attach to
            // the publicly visible entry point.
            let moved_attributes = std::mem::take(&mut method.attributes);
            if is_some_of(opcodes::ACC_NATIVE, method.access_flags) {
                let mut bridge = self.bridge_native(&class_name, method)?;
                bridge.attributes = moved_attributes;
                if let Some(prefix) = &spec.native_prefix {
                    method.name = format!("{prefix}{}", method.name);
                }
                appended.push(dispatch);
                appended.push(bridge);
            } else {
                dispatch.attributes = moved_attributes;
                self.reshape_original(method, &field_name);
                appended.push(dispatch);
            }
        }
        handlee.methods.extend(appended);

        let unmatched: Vec<String> = remaining.into_iter().flatten().collect();
        if !unmatched.is_empty() {
            return Err(InstrumentationError::shape(
                &class_name,
                format!("unhandled methods: {}", unmatched.join(", ")),
            ));
        }
        Ok(handlee)
    }

    /// Synthesize the handler field and any missing accessor/mutator
    /// methods; returns the chosen field name.
    fn install_handler_slot(&self, handlee: &mut ClassNode) -> String {
        let spec = &self.spec;
        let base = if spec.mutators.len() == 1 {
            spec.mutators[0].clone()
        } else if spec.accessors.len() == 1 {
            spec.accessors[0].clone()
        } else {
            format!("${}$", spec.handler_internal.replace(['/', '.'], "_"))
        };
        // The length gate applies to `set` only; a bare `get` strips to the
        // empty string.
        let stripped = if (base.len() > 3 && base.starts_with("set")) || base.starts_with("get") {
            &base[3..]
        } else if base.len() > 2 && base.starts_with("is") {
            &base[2..]
        } else {
            &base
        };
        let taken: Vec<&str> = handlee.fields.iter().map(|field| field.name.as_str()).collect();
        let field_name = names::unused_name(stripped, &taken);

        // Public so a handler can also be installed reflectively; volatile so
        // the dispatch method's single read is atomic against concurrent
        // installs.
        let access = opcodes::ACC_PUBLIC
            | opcodes::ACC_TRANSIENT
            | opcodes::ACC_VOLATILE
            | opcodes::ACC_SYNTHETIC;
        handlee.fields.push(FieldNode::new(
            access,
            &field_name,
            &spec.handler_descriptor,
        ));

        for accessor in &spec.accessors {
            if handlee.method_named(accessor).is_none() {
                let getter = make_getter(
                    &handlee.name,
                    &field_name,
                    &spec.handler_descriptor,
                    accessor,
                );
                handlee.methods.push(getter);
            }
        }
        for mutator in &spec.mutators {
            if handlee.method_named(mutator).is_none() {
                let setter = make_setter(
                    &handlee.name,
                    &field_name,
                    &spec.handler_descriptor,
                    mutator,
                );
                handlee.methods.push(setter);
            }
        }
        field_name
    }

    /// Create the dispatch method replacing the original entry point:
    ///
    /// ```text
    /// public RET name(args…) {
    ///     H h = this.FIELD;
    ///     if (h == null) h = this;        // CheckBeforeCall only,
    ///                                     // spawner(this) when configured
    ///     return h.name(this, args…);
    /// }
    /// ```
    fn make_dispatch(
        &self,
        class_name: &str,
        field: &str,
        original: &MethodNode,
    ) -> Result<MethodNode, InstrumentationError> {
        let spec = &self.spec;
        let parsed = parse_descriptor(class_name, original)?;
        let guarded = spec.guard == NullGuard::CheckBeforeCall;
        let arg_slots = parsed.arg_slots();
        let tmp_slot = 1 + arg_slots;

        let mut body = MethodBody::new(0, 0);
        let start = body.new_label();
        body.push(start);
        body.push(Insn::aload(0));
        body.push(Insn::get_field(class_name, field, &spec.handler_descriptor));
        let mut guard_join = None;
        if guarded {
            body.push(Insn::astore(tmp_slot));
            body.push(Insn::aload(tmp_slot));
            let join = body.new_label();
            body.push(Insn::jump(opcodes::IFNONNULL, join));
            body.push(Insn::aload(0));
            if let Some(spawner) = &spec.spawner {
                body.push(Insn::invoke(
                    opcodes::INVOKESTATIC,
                    &spawner.owner,
                    &spawner.method,
                    &spawner.descriptor,
                    false,
                ));
            }
            body.push(Insn::astore(tmp_slot));
            body.push(join);
            let mut locals = Vec::with_capacity(parsed.args.len() + 2);
            locals.push(FrameValue::Object(class_name.to_string()));
            for arg in &parsed.args {
                locals.push(names::frame_value(arg));
            }
            locals.push(FrameValue::Object(spec.handler_internal.clone()));
            body.push(FrameNode::Full {
                locals,
                stack: Vec::new(),
            });
            body.push(Insn::aload(tmp_slot));
            guard_join = Some(join);
        }
        body.push(Insn::aload(0));
        let mut slot = 1;
        for arg in &parsed.args {
            body.push(Insn::load(names::load_opcode(arg), slot));
            slot += names::slot_size(arg);
        }
        let expanded = names::prepend_arg(&spec.handler_descriptor, &original.descriptor);
        body.push(Insn::invoke(
            opcodes::INVOKEINTERFACE,
            &spec.handler_internal,
            &original.name,
            &expanded,
            true,
        ));
        body.push(Insn::Simple(names::return_opcode(&parsed.ret)));
        let end = body.new_label();
        body.push(end);

        body.local_vars.push(LocalVariableNode {
            name: "this".to_string(),
            descriptor: names::object_descriptor(class_name),
            start,
            end,
            index: 0,
        });
        let mut slot = 1;
        for (position, arg) in parsed.args.iter().enumerate() {
            body.local_vars.push(LocalVariableNode {
                name: format!("arg{position}"),
                descriptor: arg.clone(),
                start,
                end,
                index: slot,
            });
            slot += names::slot_size(arg);
        }
        if let Some(join) = guard_join {
            body.local_vars.push(LocalVariableNode {
                name: field.to_string(),
                descriptor: spec.handler_descriptor.clone(),
                start: join,
                end,
                index: tmp_slot,
            });
        }
        body.max_stack = 2 + arg_slots;
        body.max_locals = if guarded { 2 + arg_slots } else { 1 + arg_slots };

        let mut dispatch = MethodNode::new(
            promote_access(original.access_flags) & !opcodes::ACC_NATIVE,
            &original.name,
            &original.descriptor,
        );
        dispatch.signature = original.signature.clone();
        dispatch.exceptions = original.exceptions.clone();
        dispatch.body = Some(body);
        Ok(dispatch)
    }

    /// Re-role the original method in place: the handler becomes its first
    /// argument, access is promoted to public, and every reference to a
    /// non-receiver slot moves up by one.
    fn reshape_original(&self, method: &mut MethodNode, field: &str) {
        let spec = &self.spec;
        method.access_flags = promote_access(method.access_flags);
        method.descriptor = names::prepend_arg(&spec.handler_descriptor, &method.descriptor);
        let Some(body) = method.body.as_mut() else {
            return;
        };
        for node in &mut body.nodes {
            match node {
                BodyNode::Insn(Insn::Var { var_index, .. }) if *var_index >= 1 => *var_index += 1,
                BodyNode::Insn(Insn::Iinc { var_index, .. }) if *var_index >= 1 => *var_index += 1,
                // Relative frame kinds stay valid; only full frames spell the
                // locals out. The new parameter sits after the receiver.
                BodyNode::Frame(FrameNode::Full { locals, .. }) if !locals.is_empty() => {
                    locals.insert(1, FrameValue::Object(spec.handler_internal.clone()));
                }
                _ => {}
            }
        }
        let mut receiver_range = None;
        for entry in &mut body.local_vars {
            if entry.index >= 1 {
                entry.index += 1;
            } else {
                receiver_range = Some((entry.start, entry.end));
            }
        }
        for entry in &mut body.local_type_vars {
            if entry.index >= 1 {
                entry.index += 1;
            }
        }
        if let Some((start, end)) = receiver_range {
            let position = body.local_vars.len().min(1);
            body.local_vars.insert(
                position,
                LocalVariableNode {
                    name: field.to_string(),
                    descriptor: spec.handler_descriptor.clone(),
                    start,
                    end,
                    index: 1,
                },
            );
        }
        body.max_locals += 1;
    }

    /// Non-native bridge in front of a renamed native method. The native
    /// keeps its descriptor (the VM resolves the prefixed name to the same
    /// implementation); the bridge carries the handler-expanded descriptor
    /// and drops the handler argument on the way through:
    ///
    /// ```text
    /// public final RET name(H handler, args…) {
    ///     return this.<prefix>name(args…);
    /// }
    /// ```
    fn bridge_native(
        &self,
        class_name: &str,
        original: &MethodNode,
    ) -> Result<MethodNode, InstrumentationError> {
        let spec = &self.spec;
        let parsed = parse_descriptor(class_name, original)?;
        let prefixed = match &spec.native_prefix {
            Some(prefix) => format!("{prefix}{}", original.name),
            None => original.name.clone(),
        };
        let arg_slots = parsed.arg_slots();

        let mut body = MethodBody::new(1 + arg_slots, 2 + arg_slots);
        let start = body.new_label();
        body.push(start);
        body.push(Insn::aload(0));
        let mut slot = 2;
        for arg in &parsed.args {
            body.push(Insn::load(names::load_opcode(arg), slot));
            slot += names::slot_size(arg);
        }
        body.push(Insn::invoke(
            opcodes::INVOKESPECIAL,
            class_name,
            &prefixed,
            &original.descriptor,
            false,
        ));
        body.push(Insn::Simple(names::return_opcode(&parsed.ret)));
        let end = body.new_label();
        body.push(end);

        body.local_vars.push(LocalVariableNode {
            name: "this".to_string(),
            descriptor: names::object_descriptor(class_name),
            start,
            end,
            index: 0,
        });
        body.local_vars.push(LocalVariableNode {
            name: "handler".to_string(),
            descriptor: spec.handler_descriptor.clone(),
            start,
            end,
            index: 1,
        });
        let mut slot = 2;
        for (position, arg) in parsed.args.iter().enumerate() {
            body.local_vars.push(LocalVariableNode {
                name: format!("arg{position}"),
                descriptor: arg.clone(),
                start,
                end,
                index: slot,
            });
            slot += names::slot_size(arg);
        }

        let access = (promote_access(original.access_flags) | opcodes::ACC_FINAL)
            & !(opcodes::ACC_NATIVE | opcodes::ACC_ABSTRACT);
        let mut bridge = MethodNode::new(
            access,
            &original.name,
            &names::prepend_arg(&spec.handler_descriptor, &original.descriptor),
        );
        bridge.signature = original.signature.clone();
        bridge.exceptions = original.exceptions.clone();
        bridge.body = Some(body);
        Ok(bridge)
    }

    /// Inject the initial handler assignment into a constructor, sequenced
    /// per the null-guard policy. Constructors that delegate to another
    /// constructor of the same class are left untouched.
    fn patch_constructor(
        &self,
        class_name: &str,
        field: &str,
        method: &mut MethodNode,
    ) -> Result<(), InstrumentationError> {
        let spec = &self.spec;
        if spec.guard == NullGuard::CheckBeforeCall {
            return Ok(());
        }
        let Some(body) = method.body.as_mut() else {
            return Ok(());
        };
        let call_index = body.nodes.iter().position(|node| {
            matches!(
                node,
                BodyNode::Insn(Insn::Method {
                    opcode: opcodes::INVOKESPECIAL,
                    name,
                    ..
                }) if name == "<init>"
            )
        });
        let Some(call_index) = call_index else {
            return Err(InstrumentationError::shape(
                class_name,
                "constructor without initializer invocation",
            ));
        };
        let delegates = matches!(
            &body.nodes[call_index],
            BodyNode::Insn(Insn::Method { owner, .. }) if owner == class_name
        );
        if delegates {
            return Ok(());
        }

        let plain = assignment(class_name, field, &spec.handler_descriptor, None);
        let spawned = spec
            .spawner
            .as_ref()
            .map(|spawner| assignment(class_name, field, &spec.handler_descriptor, Some(spawner)));
        match spec.guard {
            NullGuard::AssignBeforeSuper => {
                let front = if matches!(body.nodes.first(), Some(BodyNode::Label(_))) {
                    1
                } else {
                    0
                };
                let inserted = plain.len();
                body.nodes.splice(front..front, plain);
                if let Some(spawned) = spawned {
                    let after_call = call_index + inserted + 1;
                    body.nodes.splice(after_call..after_call, spawned);
                }
            }
            NullGuard::AssignAfterSuper => {
                let after_call = call_index + 1;
                body.nodes
                    .splice(after_call..after_call, spawned.unwrap_or(plain));
            }
            NullGuard::CheckBeforeCall => {}
        }
        body.max_stack += if spec.uses_spawner() { 2 } else { 1 };
        Ok(())
    }
}

/// `this.FIELD = this;` or `this.FIELD = spawner(this);` as body nodes.
fn assignment(
    class_name: &str,
    field: &str,
    descriptor: &str,
    spawner: Option<&crate::spec::SpawnerRef>,
) -> Vec<BodyNode> {
    let mut nodes = vec![
        BodyNode::Insn(Insn::aload(0)),
        BodyNode::Insn(Insn::aload(0)),
    ];
    if let Some(spawner) = spawner {
        nodes.push(BodyNode::Insn(Insn::invoke(
            opcodes::INVOKESTATIC,
            &spawner.owner,
            &spawner.method,
            &spawner.descriptor,
            false,
        )));
    }
    nodes.push(BodyNode::Insn(Insn::put_field(class_name, field, descriptor)));
    nodes
}

fn parse_descriptor(
    class_name: &str,
    method: &MethodNode,
) -> Result<MethodDescriptor, InstrumentationError> {
    MethodDescriptor::parse(&method.descriptor).ok_or_else(|| {
        InstrumentationError::shape(
            class_name,
            format!("malformed descriptor {} on {}", method.descriptor, method.name),
        )
    })
}

fn promote_access(access: u16) -> u16 {
    (access | opcodes::ACC_PUBLIC) & !(opcodes::ACC_PROTECTED | opcodes::ACC_PRIVATE)
}

/// `public FIELD_TYPE name() { return this.FIELD; }`
fn make_getter(owner: &str, field: &str, descriptor: &str, name: &str) -> MethodNode {
    let start = crate::insn::LabelNode { id: 0 };
    let end = crate::insn::LabelNode { id: 1 };
    let list = insn_list! {
        [label start]
        [var ALOAD 0]
        [field GETFIELD owner, field, descriptor]
        [ARETURN]
        [label end]
    };
    let mut body = MethodBody::from_nodes(1, 1, list.into_nodes());
    body.local_vars.push(LocalVariableNode {
        name: "this".to_string(),
        descriptor: names::object_descriptor(owner),
        start,
        end,
        index: 0,
    });
    let mut method = MethodNode::new(opcodes::ACC_PUBLIC, name, &format!("(){descriptor}"));
    method.body = Some(body);
    method
}

/// `public void name(FIELD_TYPE h) { if (h == null) h = this; this.FIELD = h; }`
///
/// The null branch is what makes "set to null" mean "reset to pass-through".
fn make_setter(owner: &str, field: &str, descriptor: &str, name: &str) -> MethodNode {
    let start = crate::insn::LabelNode { id: 0 };
    let join = crate::insn::LabelNode { id: 1 };
    let end = crate::insn::LabelNode { id: 2 };
    let list = insn_list! {
        [label start]
        [var ALOAD 1]
        [jump IFNONNULL join]
        [var ALOAD 0]
        [var ASTORE 1]
        [label join]
        [frame FrameNode::Same]
        [var ALOAD 0]
        [var ALOAD 1]
        [field PUTFIELD owner, field, descriptor]
        [RETURN]
        [label end]
    };
    let mut body = MethodBody::from_nodes(2, 2, list.into_nodes());
    body.local_vars.push(LocalVariableNode {
        name: "this".to_string(),
        descriptor: names::object_descriptor(owner),
        start,
        end,
        index: 0,
    });
    body.local_vars.push(LocalVariableNode {
        name: field.to_string(),
        descriptor: descriptor.to_string(),
        start,
        end,
        index: 1,
    });
    let mut method = MethodNode::new(opcodes::ACC_PUBLIC, name, &format!("({descriptor})V"));
    method.body = Some(body);
    method
}

/// Batch driver: rewrites many classes under one instrumentation, recording
/// successes in the dependency tree and the declared-bytes map and
/// accumulating failures into a single report.
pub struct Instrumentor<'a> {
    instrumentation: &'a HandlerInstrumentation,
    dependencies: &'a mut DependencyTree,
    declared: &'a mut HashMap<String, Vec<u8>>,
}

impl<'a> Instrumentor<'a> {
    pub fn new(
        instrumentation: &'a HandlerInstrumentation,
        dependencies: &'a mut DependencyTree,
        declared: &'a mut HashMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            instrumentation,
            dependencies,
            declared,
        }
    }

    /// Resolve each binary name through the resource store and rewrite it.
    pub fn transform_named(
        &mut self,
        resources: &dyn ResourceStore,
        binary_names: &[String],
    ) -> Result<(), InstrumentationError> {
        if binary_names.is_empty() {
            return Ok(());
        }
        let mut failures = Vec::new();
        let mut trees = Vec::new();
        for name in binary_names {
            let Some(bytes) = resources.class_bytes(name) else {
                failures.push(BatchFailure {
                    class: name.clone(),
                    operation: "resolve".to_string(),
                    cause: "no bytes in resource store".to_string(),
                });
                continue;
            };
            match ClassReader::new(&bytes).to_class_node() {
                Ok(tree) => trees.push(tree),
                Err(error) => failures.push(BatchFailure {
                    class: name.clone(),
                    operation: "decode".to_string(),
                    cause: error.to_string(),
                }),
            }
        }
        self.transform_into(trees, &mut failures);
        finish(failures)
    }

    /// Rewrite already decoded trees.
    pub fn transform_trees(&mut self, trees: Vec<ClassNode>) -> Result<(), InstrumentationError> {
        let mut failures = Vec::new();
        self.transform_into(trees, &mut failures);
        finish(failures)
    }

    fn transform_into(&mut self, trees: Vec<ClassNode>, failures: &mut Vec<BatchFailure>) {
        for tree in trees {
            let class = names::to_binary(&tree.name);
            let instrumented = match self.instrumentation.instrument(tree) {
                Ok(tree) => tree,
                Err(error) => {
                    failures.push(BatchFailure {
                        class,
                        operation: "instrument".to_string(),
                        cause: error.to_string(),
                    });
                    continue;
                }
            };
            match ClassWriter::to_bytes(&instrumented) {
                Ok(bytes) => {
                    self.dependencies.add(&instrumented);
                    self.declared.insert(class, bytes);
                }
                Err(error) => failures.push(BatchFailure {
                    class,
                    operation: "encode".to_string(),
                    cause: error.to_string(),
                }),
            }
        }
    }
}

fn finish(failures: Vec<BatchFailure>) -> Result<(), InstrumentationError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(InstrumentationError::Batch(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ClassBuilder, MethodBuilder};
    use crate::opcodes::{
        ACC_ABSTRACT, ACC_INTERFACE, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC, ACC_SYNTHETIC,
        ACC_TRANSIENT, ACC_VOLATILE,
    };
    use crate::spec::HandlerSpec;

    fn handler_spec(guard: NullGuard, spawner: Option<&str>) -> HandlerSpec {
        let node = ClassBuilder::new("pkg/Callable", "java/lang/Object")
            .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .method(
                MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "call", "(Lpkg/Callable;)I")
                    .build(),
            )
            .method(
                MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "setCallable", "(Lpkg/Callable;)V")
                    .build(),
            )
            .build();
        HandlerSpec::analyze(&node, guard, spawner, None).unwrap()
    }

    fn handlee() -> ClassNode {
        let constructor = MethodBuilder::new(ACC_PUBLIC, "<init>", "()V")
            .body(
                1,
                1,
                insn_list! {
                    [var ALOAD 0]
                    [method INVOKESPECIAL "java/lang/Object", "<init>", "()V"]
                    [RETURN]
                },
            )
            .build();
        let call = MethodBuilder::new(ACC_PRIVATE, "call", "()I")
            .body(
                1,
                1,
                insn_list! {
                    [ICONST_1]
                    [IRETURN]
                },
            )
            .build();
        ClassBuilder::new("pkg/Callee", "java/lang/Object")
            .method(constructor)
            .method(call)
            .build()
    }

    #[test]
    fn installs_interface_field_and_dispatch() {
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::CheckBeforeCall, None));
        let result = instrumentation.instrument(handlee()).unwrap();

        assert_eq!(result.interfaces, vec!["pkg/Callable".to_string()]);

        let field = result.field("Callable").expect("handler slot");
        assert_eq!(field.descriptor, "Lpkg/Callable;");
        assert_eq!(
            field.access_flags,
            ACC_PUBLIC | ACC_TRANSIENT | ACC_VOLATILE | ACC_SYNTHETIC
        );
        assert_eq!(
            result
                .fields
                .iter()
                .filter(|field| field.descriptor == "Lpkg/Callable;")
                .count(),
            1
        );

        // Re-signatured original, promoted to public.
        let renamed = result.method("call", "(Lpkg/Callable;)I").expect("body method");
        assert_eq!(renamed.access_flags & (ACC_PUBLIC | ACC_PRIVATE), ACC_PUBLIC);
        assert_eq!(renamed.body.as_ref().unwrap().max_locals, 2);

        // Dispatch under the original descriptor.
        let dispatch = result.method("call", "()I").expect("dispatch");
        let body = dispatch.body.as_ref().unwrap();
        let insns: Vec<&Insn> = body.insns().collect();
        assert!(matches!(
            insns[1],
            Insn::Field {
                opcode: opcodes::GETFIELD,
                name,
                ..
            } if name == "Callable"
        ));
        assert!(insns.iter().any(|insn| matches!(
            insn,
            Insn::Method {
                opcode: opcodes::INVOKEINTERFACE,
                descriptor,
                ..
            } if descriptor == "(Lpkg/Callable;)I"
        )));
        // The null-check join carries an explicit full frame.
        assert!(body.nodes.iter().any(|node| matches!(
            node,
            BodyNode::Frame(FrameNode::Full { locals, .. })
                if locals.first() == Some(&FrameValue::Object("pkg/Callee".to_string()))
                    && locals.last() == Some(&FrameValue::Object("pkg/Callable".to_string()))
        )));

        // Synthesized mutator.
        assert!(result.method("setCallable", "(Lpkg/Callable;)V").is_some());
    }

    #[test]
    fn check_before_call_leaves_constructors_alone() {
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::CheckBeforeCall, None));
        let result = instrumentation.instrument(handlee()).unwrap();
        let constructor = result.method("<init>", "()V").unwrap();
        let body = constructor.body.as_ref().unwrap();
        assert_eq!(body.insns().count(), 3);
        assert_eq!(body.max_stack, 1);
    }

    #[test]
    fn assign_after_super_injects_field_write() {
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::AssignAfterSuper, None));
        let result = instrumentation.instrument(handlee()).unwrap();
        let constructor = result.method("<init>", "()V").unwrap();
        let body = constructor.body.as_ref().unwrap();
        let insns: Vec<&Insn> = body.insns().collect();
        // aload0, invokespecial, aload0, aload0, putfield, return
        assert_eq!(insns.len(), 6);
        assert!(matches!(
            insns[4],
            Insn::Field {
                opcode: opcodes::PUTFIELD,
                name,
                ..
            } if name == "Callable"
        ));
        assert_eq!(body.max_stack, 2);
    }

    #[test]
    fn assign_before_super_with_spawner_writes_twice() {
        let instrumentation = HandlerInstrumentation::new(handler_spec(
            NullGuard::AssignBeforeSuper,
            Some("pkg.Spawners.spawn"),
        ));
        let result = instrumentation.instrument(handlee()).unwrap();
        let constructor = result.method("<init>", "()V").unwrap();
        let body = constructor.body.as_ref().unwrap();
        let insns: Vec<&Insn> = body.insns().collect();
        // aload0 aload0 putfield | aload0 invokespecial | aload0 aload0
        // invokestatic putfield | return
        assert_eq!(insns.len(), 10);
        assert!(matches!(insns[2], Insn::Field { opcode: opcodes::PUTFIELD, .. }));
        assert!(matches!(
            insns[7],
            Insn::Method {
                opcode: opcodes::INVOKESTATIC,
                name,
                ..
            } if name == "spawn"
        ));
        assert!(matches!(insns[8], Insn::Field { opcode: opcodes::PUTFIELD, .. }));
        assert_eq!(body.max_stack, 3);
    }

    #[test]
    fn delegating_constructor_is_untouched() {
        let delegating = MethodBuilder::new(ACC_PUBLIC, "<init>", "(I)V")
            .body(
                1,
                2,
                insn_list! {
                    [var ALOAD 0]
                    [method INVOKESPECIAL "pkg/Callee", "<init>", "()V"]
                    [RETURN]
                },
            )
            .build();
        let class = ClassBuilder::new("pkg/Callee", "java/lang/Object")
            .method(delegating)
            .method(
                MethodBuilder::new(ACC_PUBLIC, "<init>", "()V")
                    .body(
                        1,
                        1,
                        insn_list! {
                            [var ALOAD 0]
                            [method INVOKESPECIAL "java/lang/Object", "<init>", "()V"]
                            [RETURN]
                        },
                    )
                    .build(),
            )
            .method(
                MethodBuilder::new(ACC_PUBLIC, "call", "()I")
                    .body(1, 1, insn_list! { [ICONST_1] [IRETURN] })
                    .build(),
            )
            .build();
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::AssignAfterSuper, None));
        let result = instrumentation.instrument(class).unwrap();
        let delegating = result.method("<init>", "(I)V").unwrap();
        assert_eq!(delegating.body.as_ref().unwrap().insns().count(), 3);
        let root = result.method("<init>", "()V").unwrap();
        assert_eq!(root.body.as_ref().unwrap().insns().count(), 6);
    }

    #[test]
    fn slot_shift_covers_longs_and_iinc() {
        let spec_node = ClassBuilder::new("pkg/Wide", "java/lang/Object")
            .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .method(
                MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "sum", "(Lpkg/Wide;JI)J").build(),
            )
            .build();
        let spec =
            HandlerSpec::analyze(&spec_node, NullGuard::CheckBeforeCall, None, None).unwrap();
        let class = ClassBuilder::new("pkg/WideUser", "java/lang/Object")
            .method(
                MethodBuilder::new(ACC_PUBLIC, "sum", "(JI)J")
                    .body(
                        4,
                        4,
                        insn_list! {
                            [var LLOAD 1]
                            [iinc 3, 1]
                            [var ILOAD 3]
                            [I2L]
                            [LADD]
                            [LRETURN]
                        },
                    )
                    .build(),
            )
            .build();
        let result = HandlerInstrumentation::new(spec).instrument(class).unwrap();
        let renamed = result.method("sum", "(Lpkg/Wide;JI)J").unwrap();
        let body = renamed.body.as_ref().unwrap();
        let insns: Vec<&Insn> = body.insns().collect();
        assert_eq!(
            *insns[0],
            Insn::Var {
                opcode: opcodes::LLOAD,
                var_index: 2
            }
        );
        assert_eq!(
            *insns[1],
            Insn::Iinc {
                var_index: 4,
                increment: 1
            }
        );
        assert_eq!(body.max_locals, 5);

        // Dispatch loads the wide argument with the right slot arithmetic.
        let dispatch = result.method("sum", "(JI)J").unwrap();
        let body = dispatch.body.as_ref().unwrap();
        assert_eq!(body.max_stack, 5);
        assert_eq!(body.max_locals, 5);
        let loads: Vec<&Insn> = body
            .insns()
            .filter(|insn| matches!(insn, Insn::Var { .. }))
            .collect();
        // tmp slot sits past both argument slots.
        assert!(loads.contains(&&Insn::astore(4)));
    }

    #[test]
    fn unmatched_signature_is_reported_by_name() {
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::CheckBeforeCall, None));
        let class = ClassBuilder::new("pkg/Empty", "java/lang/Object").build();
        let error = instrumentation.instrument(class).unwrap_err();
        match error {
            InstrumentationError::Shape { class, reason } => {
                assert_eq!(class, "pkg.Empty");
                assert!(reason.contains("unhandled methods"));
                assert!(reason.contains("call()I"));
            }
            other => panic!("expected shape error, got {other}"),
        }
    }

    #[test]
    fn instrumenting_twice_fails() {
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::CheckBeforeCall, None));
        let once = instrumentation.instrument(handlee()).unwrap();
        let error = instrumentation.instrument(once).unwrap_err();
        assert!(matches!(error, InstrumentationError::Shape { .. }));
    }

    #[test]
    fn static_and_abstract_targets_are_rejected() {
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::CheckBeforeCall, None));
        let class = ClassBuilder::new("pkg/Callee", "java/lang/Object")
            .method(
                MethodBuilder::new(ACC_PUBLIC | ACC_STATIC, "call", "()I")
                    .body(1, 0, insn_list! { [ICONST_1] [IRETURN] })
                    .build(),
            )
            .build();
        let error = instrumentation.instrument(class).unwrap_err();
        match error {
            InstrumentationError::Shape { reason, .. } => {
                assert!(reason.contains("must not be abstract, static or native"));
            }
            other => panic!("expected shape error, got {other}"),
        }
    }

    #[test]
    fn field_name_collision_appends_underscores() {
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::CheckBeforeCall, None));
        let class = ClassBuilder::new("pkg/Callee", "java/lang/Object")
            .field(FieldNode::new(ACC_PRIVATE, "Callable", "I"))
            .method(
                MethodBuilder::new(ACC_PUBLIC, "call", "()I")
                    .body(1, 1, insn_list! { [ICONST_1] [IRETURN] })
                    .build(),
            )
            .build();
        let result = instrumentation.instrument(class).unwrap();
        let slot = result.field("Callable_").expect("renamed slot");
        assert_eq!(slot.descriptor, "Lpkg/Callable;");
    }

    #[test]
    fn bare_get_accessor_strips_to_an_empty_field_name() {
        // An interface named `Get` yields the camel accessor name `get`,
        // which strips without a length gate.
        let node = ClassBuilder::new("pkg/Get", "java/lang/Object")
            .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .method(MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "get", "()Lpkg/Get;").build())
            .method(
                MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "call", "(Lpkg/Get;)I").build(),
            )
            .build();
        let spec = HandlerSpec::analyze(&node, NullGuard::CheckBeforeCall, None, None).unwrap();
        assert_eq!(spec.accessors, vec!["get"]);

        let class = ClassBuilder::new("pkg/Callee", "java/lang/Object")
            .method(
                MethodBuilder::new(ACC_PUBLIC, "call", "()I")
                    .body(1, 1, insn_list! { [ICONST_1] [IRETURN] })
                    .build(),
            )
            .build();
        let result = HandlerInstrumentation::new(spec).instrument(class).unwrap();
        let slot = result.field("").expect("empty-named slot");
        assert_eq!(slot.descriptor, "Lpkg/Get;");
    }

    #[test]
    fn annotations_move_to_the_dispatch_method() {
        use crate::nodes::AttributeInfo;
        let annotated = MethodBuilder::new(ACC_PUBLIC, "call", "()I")
            .attribute(AttributeInfo::Unknown {
                name: "RuntimeVisibleAnnotations".to_string(),
                info: vec![0, 0],
            })
            .body(1, 1, insn_list! { [ICONST_1] [IRETURN] })
            .build();
        let class = ClassBuilder::new("pkg/Callee", "java/lang/Object")
            .method(annotated)
            .build();
        let instrumentation =
            HandlerInstrumentation::new(handler_spec(NullGuard::CheckBeforeCall, None));
        let result = instrumentation.instrument(class).unwrap();
        let dispatch = result.method("call", "()I").unwrap();
        assert_eq!(dispatch.attributes.len(), 1);
        assert_eq!(dispatch.attributes[0].name(), "RuntimeVisibleAnnotations");
        let renamed = result.method("call", "(Lpkg/Callable;)I").unwrap();
        assert!(renamed.attributes.is_empty());
    }

    #[test]
    fn native_methods_are_bridged_when_a_prefix_is_configured() {
        let spec_node = ClassBuilder::new("pkg/Callable", "java/lang/Object")
            .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .method(
                MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "call", "(Lpkg/Callable;)I")
                    .build(),
            )
            .build();
        let spec = HandlerSpec::analyze(
            &spec_node,
            NullGuard::CheckBeforeCall,
            None,
            Some("$weave$"),
        )
        .unwrap();
        let class = ClassBuilder::new("pkg/Callee", "java/lang/Object")
            .method(MethodBuilder::new(ACC_PUBLIC | opcodes::ACC_NATIVE, "call", "()I").build())
            .build();
        let result = HandlerInstrumentation::new(spec).instrument(class).unwrap();

        let renamed = result.method("$weave$call", "()I").expect("renamed native");
        assert!(is_some_of(opcodes::ACC_NATIVE, renamed.access_flags));
        assert!(renamed.body.is_none());

        let bridge = result.method("call", "(Lpkg/Callable;)I").expect("bridge");
        assert!(is_some_of(opcodes::ACC_FINAL, bridge.access_flags));
        assert!(!is_some_of(opcodes::ACC_NATIVE, bridge.access_flags));
        let calls: Vec<&Insn> = bridge
            .body
            .as_ref()
            .unwrap()
            .insns()
            .filter(|insn| matches!(insn, Insn::Method { .. }))
            .collect();
        assert!(matches!(
            calls[0],
            Insn::Method {
                opcode: opcodes::INVOKESPECIAL,
                owner,
                name,
                ..
            } if owner == "pkg/Callee" && name == "$weave$call"
        ));

        let dispatch = result.method("call", "()I").expect("dispatch");
        assert!(!is_some_of(opcodes::ACC_NATIVE, dispatch.access_flags));
    }
}

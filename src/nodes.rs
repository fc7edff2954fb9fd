//! The mutable object model of a compiled class.
//!
//! A [`ClassNode`] is created by decoding (see
//! [`ClassReader`](crate::class_reader::ClassReader)), mutated by the
//! instrumentation engine, and encoded exactly once (see
//! [`ClassWriter`](crate::class_writer::ClassWriter)). Identity is symbolic
//! throughout — internal names and descriptors, not pool indices. The decoded
//! constant pool travels with the tree so that index-carrying instructions
//! (`ldc`, `invokedynamic`) stay valid; encoding appends to it and never
//! renumbers.
//!
//! # See Also
//! * [JVM Specification: ClassFile Structure](https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.1)

use crate::error::ClassReadError;
use crate::insn::{BodyNode, Insn, LabelNode, LocalVariableNode, TryCatchNode};

/// An entry of the constant pool. Index 0 and the slot after every `Long` /
/// `Double` are [`CpInfo::Unusable`].
#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InnerClassNode {
    pub inner: String,
    pub outer: Option<String>,
    pub inner_name: Option<String>,
    pub access_flags: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapMethod {
    pub bootstrap_method_ref: u16,
    pub bootstrap_arguments: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodParameterNode {
    pub name: Option<String>,
    pub access_flags: u16,
}

/// A class-, field- or method-level attribute. Attributes the rewriter has
/// no structural interest in — annotations above all — are carried byte-exact
/// as [`AttributeInfo::Unknown`] so they can be moved between methods without
/// reinterpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeInfo {
    ConstantValue { value_index: u16 },
    SourceFile { name: String },
    Signature { signature: String },
    Deprecated,
    Synthetic,
    InnerClasses { classes: Vec<InnerClassNode> },
    EnclosingMethod {
        class_name: String,
        method: Option<(String, String)>,
    },
    BootstrapMethods { methods: Vec<BootstrapMethod> },
    MethodParameters { parameters: Vec<MethodParameterNode> },
    Unknown { name: String, info: Vec<u8> },
}

impl AttributeInfo {
    /// Attribute name as it appears in the class file.
    pub fn name(&self) -> &str {
        match self {
            AttributeInfo::ConstantValue { .. } => "ConstantValue",
            AttributeInfo::SourceFile { .. } => "SourceFile",
            AttributeInfo::Signature { .. } => "Signature",
            AttributeInfo::Deprecated => "Deprecated",
            AttributeInfo::Synthetic => "Synthetic",
            AttributeInfo::InnerClasses { .. } => "InnerClasses",
            AttributeInfo::EnclosingMethod { .. } => "EnclosingMethod",
            AttributeInfo::BootstrapMethods { .. } => "BootstrapMethods",
            AttributeInfo::MethodParameters { .. } => "MethodParameters",
            AttributeInfo::Unknown { name, .. } => name,
        }
    }
}

/// The `Code` content of a method: a node list plus label-based side tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub nodes: Vec<BodyNode>,
    pub try_catch: Vec<TryCatchNode>,
    pub local_vars: Vec<LocalVariableNode>,
    pub local_type_vars: Vec<LocalVariableNode>,
    /// Code-level attributes with no decoded form.
    pub attributes: Vec<AttributeInfo>,
    next_label: usize,
}

impl MethodBody {
    pub fn new(max_stack: u16, max_locals: u16) -> Self {
        MethodBody {
            max_stack,
            max_locals,
            ..Default::default()
        }
    }

    pub(crate) fn with_labels(next_label: usize) -> Self {
        MethodBody {
            next_label,
            ..Default::default()
        }
    }

    /// Build a body from an externally assembled node list. The label
    /// allocator is seeded past the highest label id in use.
    pub fn from_nodes(max_stack: u16, max_locals: u16, nodes: Vec<BodyNode>) -> Self {
        let mut next_label = 0;
        let mut note = |label: &LabelNode| next_label = next_label.max(label.id + 1);
        for node in &nodes {
            match node {
                BodyNode::Label(label) => note(label),
                BodyNode::Line { start, .. } => note(start),
                BodyNode::Frame(_) => {}
                BodyNode::Insn(Insn::Jump { target, .. }) => note(target),
                BodyNode::Insn(Insn::TableSwitch {
                    default, targets, ..
                }) => {
                    note(default);
                    targets.iter().for_each(&mut note);
                }
                BodyNode::Insn(Insn::LookupSwitch { default, pairs }) => {
                    note(default);
                    pairs.iter().for_each(|(_, label)| note(label));
                }
                BodyNode::Insn(_) => {}
            }
        }
        MethodBody {
            max_stack,
            max_locals,
            nodes,
            next_label,
            ..Default::default()
        }
    }

    /// A label not yet used anywhere in this body.
    pub fn new_label(&mut self) -> LabelNode {
        let label = LabelNode { id: self.next_label };
        self.next_label += 1;
        label
    }

    pub fn push<T: Into<BodyNode>>(&mut self, node: T) {
        self.nodes.push(node.into());
    }

    /// Instructions only, skipping labels, lines and frames.
    pub fn insns(&self) -> impl Iterator<Item = &Insn> {
        self.nodes.iter().filter_map(|node| match node {
            BodyNode::Insn(insn) => Some(insn),
            _ => None,
        })
    }
}

/// Represents a field (member variable) within a class.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldNode {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub attributes: Vec<AttributeInfo>,
}

impl FieldNode {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        FieldNode {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            attributes: Vec::new(),
        }
    }
}

/// Represents a method within a class. The generic signature and the checked
/// exception list are lifted out of the attribute vector because the
/// instrumentation engine copies them onto synthesized methods; everything
/// else (annotations, parameter annotations, `AnnotationDefault`, …) stays in
/// `attributes`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodNode {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub signature: Option<String>,
    pub exceptions: Vec<String>,
    /// `None` for `native` and `abstract` methods.
    pub body: Option<MethodBody>,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodNode {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        MethodNode {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            signature: None,
            exceptions: Vec::new(),
            body: None,
            attributes: Vec::new(),
        }
    }
}

/// Represents a parsed class file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassNode {
    /// The minor version of the class file format.
    pub minor_version: u16,
    /// The major version of the class file format (e.g. 52 for Java 8).
    pub major_version: u16,
    pub access_flags: u16,
    /// The internal name of the class (e.g. `java/lang/String`).
    pub name: String,
    /// The internal name of the superclass; `None` only for `java.lang.Object`.
    pub super_name: Option<String>,
    /// Internal names of the direct superinterfaces, in declaration order,
    /// unique by value.
    pub interfaces: Vec<String>,
    pub fields: Vec<FieldNode>,
    pub methods: Vec<MethodNode>,
    pub attributes: Vec<AttributeInfo>,
    /// The decoded constant pool. Appended to while encoding, never
    /// renumbered.
    pub constant_pool: Vec<CpInfo>,
}

impl ClassNode {
    pub fn cp_utf8(&self, index: u16) -> Result<&str, ClassReadError> {
        match self.constant_pool.get(index as usize) {
            Some(CpInfo::Utf8(value)) => Ok(value.as_str()),
            _ => Err(ClassReadError::InvalidIndex(index)),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldNode> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn method_named(&self, name: &str) -> Option<&MethodNode> {
        self.methods.iter().find(|method| method.name == name)
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodNode> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    /// Outer class of a nested class: the `EnclosingMethod` attribute when
    /// present, otherwise inferred from a `$` in the internal name.
    pub fn outer_class(&self) -> Option<String> {
        for attr in &self.attributes {
            if let AttributeInfo::EnclosingMethod { class_name, .. } = attr {
                return Some(class_name.clone());
            }
        }
        self.name
            .rfind('$')
            .map(|index| self.name[..index].to_string())
            .filter(|outer| !outer.is_empty())
    }
}

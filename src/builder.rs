//! Fluent construction of class trees from scratch.
//!
//! Useful for synthesizing fixtures and small helper classes without going
//! through bytes first. Builders work purely on the symbolic tree; the
//! constant pool is materialized later by the writer.

use crate::insn::{InsnList, TryCatchNode};
use crate::nodes::{
    AttributeInfo, ClassNode, CpInfo, FieldNode, MethodBody, MethodNode,
};
use crate::opcodes;

pub struct ClassBuilder {
    class: ClassNode,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        Self {
            class: ClassNode {
                minor_version: 0,
                major_version: opcodes::V1_8,
                access_flags: opcodes::ACC_PUBLIC | opcodes::ACC_SUPER,
                name: name.to_string(),
                super_name: Some(super_name.to_string()),
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                attributes: Vec::new(),
                constant_pool: vec![CpInfo::Unusable],
            },
        }
    }

    pub fn version(mut self, major: u16, minor: u16) -> Self {
        self.class.major_version = major;
        self.class.minor_version = minor;
        self
    }

    pub fn access_flags(mut self, flags: u16) -> Self {
        self.class.access_flags = flags;
        self
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.class.interfaces.push(name.to_string());
        self
    }

    pub fn source_file(mut self, name: &str) -> Self {
        self.class.attributes.push(AttributeInfo::SourceFile {
            name: name.to_string(),
        });
        self
    }

    pub fn attribute(mut self, attr: AttributeInfo) -> Self {
        self.class.attributes.push(attr);
        self
    }

    pub fn field(mut self, field: FieldNode) -> Self {
        self.class.fields.push(field);
        self
    }

    pub fn method(mut self, method: MethodNode) -> Self {
        self.class.methods.push(method);
        self
    }

    pub fn build(self) -> ClassNode {
        self.class
    }
}

pub struct MethodBuilder {
    method: MethodNode,
}

impl MethodBuilder {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            method: MethodNode::new(access_flags, name, descriptor),
        }
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.method.signature = Some(signature.to_string());
        self
    }

    pub fn exception(mut self, class_name: &str) -> Self {
        self.method.exceptions.push(class_name.to_string());
        self
    }

    pub fn attribute(mut self, attr: AttributeInfo) -> Self {
        self.method.attributes.push(attr);
        self
    }

    pub fn body(mut self, max_stack: u16, max_locals: u16, insns: InsnList) -> Self {
        self.method.body = Some(MethodBody::from_nodes(
            max_stack,
            max_locals,
            insns.into_nodes(),
        ));
        self
    }

    pub fn try_catch(mut self, entry: TryCatchNode) -> Self {
        if let Some(body) = &mut self.method.body {
            body.try_catch.push(entry);
        }
        self
    }

    pub fn build(self) -> MethodNode {
        self.method
    }
}

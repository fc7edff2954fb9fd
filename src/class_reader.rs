//! Decoding side of the class-file codec: bytes to [`ClassNode`].
//!
//! Method bodies are decoded into a single node list. Every referenced
//! bytecode offset — branch target, exception bound, stack map frame
//! position, line marker, local-variable range end — becomes a
//! [`LabelNode`], assigned in offset order so the same bytes always decode
//! to the same tree. Short-form `load_<n>`/`store_<n>` opcodes are widened
//! to indexed variable instructions; member and type operands are resolved
//! to symbolic names against the constant pool.

use std::collections::BTreeMap;

use crate::error::ClassReadError;
use crate::insn::{
    BodyNode, ConstValue, FrameNode, FrameValue, Insn, LabelNode, LocalVariableNode, TryCatchNode,
};
use crate::nodes::{
    AttributeInfo, BootstrapMethod, ClassNode, CpInfo, FieldNode, InnerClassNode, MethodBody,
    MethodNode, MethodParameterNode,
};
use crate::opcodes;

pub struct ClassReader {
    bytes: Vec<u8>,
}

impl ClassReader {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Decode the full class, method bodies included.
    pub fn to_class_node(&self) -> Result<ClassNode, ClassReadError> {
        read_class(&self.bytes, false)
    }

    /// Decode the class skeleton only; method bodies are dropped. Sufficient
    /// for analyzing a handler interface and cheaper than a full decode.
    pub fn to_codeless_node(&self) -> Result<ClassNode, ClassReadError> {
        read_class(&self.bytes, true)
    }
}

fn read_class(bytes: &[u8], skip_code: bool) -> Result<ClassNode, ClassReadError> {
    let mut reader = ByteReader::new(bytes);
    let magic = reader.read_u4()?;
    if magic != 0xCAFEBABE {
        return Err(ClassReadError::InvalidMagic(magic));
    }
    let minor_version = reader.read_u2()?;
    let major_version = reader.read_u2()?;
    let cp = read_constant_pool(&mut reader)?;

    let access_flags = reader.read_u2()?;
    let this_class = reader.read_u2()?;
    let super_class = reader.read_u2()?;
    let name = cp_class_name(&cp, this_class)?.to_string();
    let super_name = if super_class == 0 {
        None
    } else {
        Some(cp_class_name(&cp, super_class)?.to_string())
    };

    let interface_count = reader.read_u2()? as usize;
    let mut interfaces = Vec::with_capacity(interface_count);
    for _ in 0..interface_count {
        let index = reader.read_u2()?;
        interfaces.push(cp_class_name(&cp, index)?.to_string());
    }

    let field_count = reader.read_u2()? as usize;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        fields.push(read_field(&mut reader, &cp)?);
    }

    let method_count = reader.read_u2()? as usize;
    let mut methods = Vec::with_capacity(method_count);
    for _ in 0..method_count {
        methods.push(read_method(&mut reader, &cp, skip_code)?);
    }

    let raw_attrs = read_raw_attributes(&mut reader, &cp)?;
    let mut attributes = Vec::with_capacity(raw_attrs.len());
    for (attr_name, info) in raw_attrs {
        attributes.push(parse_class_attribute(&attr_name, info, &cp)?);
    }

    Ok(ClassNode {
        minor_version,
        major_version,
        access_flags,
        name,
        super_name,
        interfaces,
        fields,
        methods,
        attributes,
        constant_pool: cp,
    })
}

fn read_field(reader: &mut ByteReader<'_>, cp: &[CpInfo]) -> Result<FieldNode, ClassReadError> {
    let access_flags = reader.read_u2()?;
    let name = cp_utf8(cp, reader.read_u2()?)?.to_string();
    let descriptor = cp_utf8(cp, reader.read_u2()?)?.to_string();
    let raw_attrs = read_raw_attributes(reader, cp)?;
    let mut attributes = Vec::with_capacity(raw_attrs.len());
    for (attr_name, info) in raw_attrs {
        attributes.push(parse_member_attribute(&attr_name, info, cp)?);
    }
    Ok(FieldNode {
        access_flags,
        name,
        descriptor,
        attributes,
    })
}

fn read_method(
    reader: &mut ByteReader<'_>,
    cp: &[CpInfo],
    skip_code: bool,
) -> Result<MethodNode, ClassReadError> {
    let access_flags = reader.read_u2()?;
    let name = cp_utf8(cp, reader.read_u2()?)?.to_string();
    let descriptor = cp_utf8(cp, reader.read_u2()?)?.to_string();

    let mut signature = None;
    let mut exceptions = Vec::new();
    let mut body = None;
    let mut attributes = Vec::new();

    for (attr_name, info) in read_raw_attributes(reader, cp)? {
        match attr_name.as_str() {
            "Code" => {
                if !skip_code {
                    body = Some(read_body(&info, cp)?);
                }
            }
            "Exceptions" => {
                let mut attr_reader = ByteReader::new(&info);
                let count = attr_reader.read_u2()? as usize;
                for _ in 0..count {
                    let index = attr_reader.read_u2()?;
                    exceptions.push(cp_class_name(cp, index)?.to_string());
                }
            }
            "Signature" => {
                let mut attr_reader = ByteReader::new(&info);
                signature = Some(cp_utf8(cp, attr_reader.read_u2()?)?.to_string());
            }
            _ => attributes.push(parse_member_attribute(&attr_name, info, cp)?),
        }
    }

    Ok(MethodNode {
        access_flags,
        name,
        descriptor,
        signature,
        exceptions,
        body,
        attributes,
    })
}

fn read_raw_attributes(
    reader: &mut ByteReader<'_>,
    cp: &[CpInfo],
) -> Result<Vec<(String, Vec<u8>)>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        let name = cp_utf8(cp, name_index)?.to_string();
        let info = reader.read_bytes(length)?;
        attributes.push((name, info));
    }
    Ok(attributes)
}

fn parse_class_attribute(
    name: &str,
    info: Vec<u8>,
    cp: &[CpInfo],
) -> Result<AttributeInfo, ClassReadError> {
    let mut reader = ByteReader::new(&info);
    let attribute = match name {
        "SourceFile" => AttributeInfo::SourceFile {
            name: cp_utf8(cp, reader.read_u2()?)?.to_string(),
        },
        "InnerClasses" => {
            let count = reader.read_u2()? as usize;
            let mut classes = Vec::with_capacity(count);
            for _ in 0..count {
                let inner_index = reader.read_u2()?;
                let outer_index = reader.read_u2()?;
                let inner_name_index = reader.read_u2()?;
                let access_flags = reader.read_u2()?;
                classes.push(InnerClassNode {
                    inner: cp_class_name(cp, inner_index)?.to_string(),
                    outer: if outer_index == 0 {
                        None
                    } else {
                        Some(cp_class_name(cp, outer_index)?.to_string())
                    },
                    inner_name: if inner_name_index == 0 {
                        None
                    } else {
                        Some(cp_utf8(cp, inner_name_index)?.to_string())
                    },
                    access_flags,
                });
            }
            AttributeInfo::InnerClasses { classes }
        }
        "EnclosingMethod" => {
            let class_index = reader.read_u2()?;
            let method_index = reader.read_u2()?;
            AttributeInfo::EnclosingMethod {
                class_name: cp_class_name(cp, class_index)?.to_string(),
                method: if method_index == 0 {
                    None
                } else {
                    let (method_name, method_desc) = cp_name_and_type(cp, method_index)?;
                    Some((method_name.to_string(), method_desc.to_string()))
                },
            }
        }
        "BootstrapMethods" => {
            let count = reader.read_u2()? as usize;
            let mut methods = Vec::with_capacity(count);
            for _ in 0..count {
                let bootstrap_method_ref = reader.read_u2()?;
                let arg_count = reader.read_u2()? as usize;
                let mut bootstrap_arguments = Vec::with_capacity(arg_count);
                for _ in 0..arg_count {
                    bootstrap_arguments.push(reader.read_u2()?);
                }
                methods.push(BootstrapMethod {
                    bootstrap_method_ref,
                    bootstrap_arguments,
                });
            }
            AttributeInfo::BootstrapMethods { methods }
        }
        _ => return parse_member_attribute(name, info, cp),
    };

    if reader.remaining() != 0 {
        return Err(ClassReadError::InvalidAttribute(name.to_string()));
    }
    Ok(attribute)
}

fn parse_member_attribute(
    name: &str,
    info: Vec<u8>,
    cp: &[CpInfo],
) -> Result<AttributeInfo, ClassReadError> {
    let mut reader = ByteReader::new(&info);
    let attribute = match name {
        "ConstantValue" => AttributeInfo::ConstantValue {
            value_index: reader.read_u2()?,
        },
        "Signature" => AttributeInfo::Signature {
            signature: cp_utf8(cp, reader.read_u2()?)?.to_string(),
        },
        "Deprecated" => AttributeInfo::Deprecated,
        "Synthetic" => AttributeInfo::Synthetic,
        "MethodParameters" => {
            let count = reader.read_u1()? as usize;
            let mut parameters = Vec::with_capacity(count);
            for _ in 0..count {
                let name_index = reader.read_u2()?;
                let access_flags = reader.read_u2()?;
                parameters.push(MethodParameterNode {
                    name: if name_index == 0 {
                        None
                    } else {
                        Some(cp_utf8(cp, name_index)?.to_string())
                    },
                    access_flags,
                });
            }
            AttributeInfo::MethodParameters { parameters }
        }
        _ => {
            return Ok(AttributeInfo::Unknown {
                name: name.to_string(),
                info,
            });
        }
    };

    if reader.remaining() != 0 {
        return Err(ClassReadError::InvalidAttribute(name.to_string()));
    }
    Ok(attribute)
}

fn read_constant_pool(reader: &mut ByteReader<'_>) -> Result<Vec<CpInfo>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut pool = Vec::with_capacity(count);
    pool.push(CpInfo::Unusable);

    let mut index = 1;
    while index < count {
        let tag = reader.read_u1()?;
        let entry = match tag {
            1 => {
                let len = reader.read_u2()? as usize;
                let bytes = reader.read_bytes(len)?;
                CpInfo::Utf8(decode_modified_utf8(&bytes)?)
            }
            3 => CpInfo::Integer(reader.read_u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(reader.read_u4()?)),
            5 => CpInfo::Long(reader.read_u8()? as i64),
            6 => CpInfo::Double(f64::from_bits(reader.read_u8()?)),
            7 => CpInfo::Class {
                name_index: reader.read_u2()?,
            },
            8 => CpInfo::String {
                string_index: reader.read_u2()?,
            },
            9 => CpInfo::Fieldref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            10 => CpInfo::Methodref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            11 => CpInfo::InterfaceMethodref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            12 => CpInfo::NameAndType {
                name_index: reader.read_u2()?,
                descriptor_index: reader.read_u2()?,
            },
            15 => CpInfo::MethodHandle {
                reference_kind: reader.read_u1()?,
                reference_index: reader.read_u2()?,
            },
            16 => CpInfo::MethodType {
                descriptor_index: reader.read_u2()?,
            },
            17 => CpInfo::Dynamic {
                bootstrap_method_attr_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            18 => CpInfo::InvokeDynamic {
                bootstrap_method_attr_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            19 => CpInfo::Module {
                name_index: reader.read_u2()?,
            },
            20 => CpInfo::Package {
                name_index: reader.read_u2()?,
            },
            _ => return Err(ClassReadError::InvalidConstantPoolTag(tag)),
        };

        pool.push(entry);

        if tag == 5 || tag == 6 {
            pool.push(CpInfo::Unusable);
            index += 2;
        } else {
            index += 1;
        }
    }

    Ok(pool)
}

// ---------------------------------------------------------------------------
// Code attribute

/// While instructions are being decoded, labels carry the absolute bytecode
/// offset they point at. A final pass renumbers them in offset order.
fn offset_label(offset: i64) -> LabelNode {
    LabelNode { id: offset as usize }
}

fn read_body(info: &[u8], cp: &[CpInfo]) -> Result<MethodBody, ClassReadError> {
    let mut reader = ByteReader::new(info);
    let max_stack = reader.read_u2()?;
    let max_locals = reader.read_u2()?;
    let code_length = reader.read_u4()? as usize;
    let code = reader.read_bytes(code_length)?;

    let instructions = read_instructions(&code, cp)?;

    let exception_count = reader.read_u2()? as usize;
    let mut try_catch = Vec::with_capacity(exception_count);
    for _ in 0..exception_count {
        let start_pc = reader.read_u2()?;
        let end_pc = reader.read_u2()?;
        let handler_pc = reader.read_u2()?;
        let catch_index = reader.read_u2()?;
        try_catch.push(TryCatchNode {
            start: offset_label(start_pc as i64),
            end: offset_label(end_pc as i64),
            handler: offset_label(handler_pc as i64),
            catch_type: if catch_index == 0 {
                None
            } else {
                Some(cp_class_name(cp, catch_index)?.to_string())
            },
        });
    }

    let mut frames: BTreeMap<usize, FrameNode> = BTreeMap::new();
    let mut lines: BTreeMap<usize, Vec<u16>> = BTreeMap::new();
    let mut local_vars = Vec::new();
    let mut local_type_vars = Vec::new();
    let mut attributes = Vec::new();

    for (attr_name, attr_info) in read_raw_attributes(&mut reader, cp)? {
        match attr_name.as_str() {
            "StackMapTable" => read_stack_map(&attr_info, cp, &mut frames)?,
            "LineNumberTable" => {
                let mut attr_reader = ByteReader::new(&attr_info);
                let count = attr_reader.read_u2()? as usize;
                for _ in 0..count {
                    let start_pc = attr_reader.read_u2()? as usize;
                    let line = attr_reader.read_u2()?;
                    lines.entry(start_pc).or_default().push(line);
                }
            }
            "LocalVariableTable" => {
                read_local_variables(&attr_info, cp, &mut local_vars)?;
            }
            "LocalVariableTypeTable" => {
                read_local_variables(&attr_info, cp, &mut local_type_vars)?;
            }
            _ => attributes.push(parse_member_attribute(&attr_name, attr_info, cp)?),
        }
    }

    // Every offset anything points at gets a label, in offset order.
    let mut referenced: Vec<usize> = Vec::new();
    for (_, insn) in &instructions {
        collect_insn_targets(insn, &mut referenced);
    }
    for entry in &try_catch {
        referenced.extend([entry.start.id, entry.end.id, entry.handler.id]);
    }
    for entry in local_vars.iter().chain(local_type_vars.iter()) {
        referenced.extend([entry.start.id, entry.end.id]);
    }
    for (offset, frame) in &frames {
        referenced.push(*offset);
        collect_frame_targets(frame, &mut referenced);
    }
    referenced.extend(lines.keys().copied());
    referenced.sort_unstable();
    referenced.dedup();

    let remap: BTreeMap<usize, usize> = referenced
        .iter()
        .enumerate()
        .map(|(id, offset)| (*offset, id))
        .collect();
    let relabel = |label: LabelNode| -> Result<LabelNode, ClassReadError> {
        remap
            .get(&label.id)
            .map(|id| LabelNode { id: *id })
            .ok_or_else(|| ClassReadError::InvalidAttribute("label offset".to_string()))
    };

    let mut body = MethodBody::with_labels(remap.len());
    body.max_stack = max_stack;
    body.max_locals = max_locals;

    for (offset, insn) in instructions {
        if remap.contains_key(&offset) {
            body.push(relabel(offset_label(offset as i64))?);
        }
        if let Some(frame) = frames.remove(&offset) {
            body.push(BodyNode::Frame(relabel_frame(frame, &relabel)?));
        }
        if let Some(line_list) = lines.remove(&offset) {
            let start = relabel(offset_label(offset as i64))?;
            for line in line_list {
                body.push(BodyNode::Line { line, start });
            }
        }
        body.push(relabel_insn(insn, &relabel)?);
    }
    // The end-of-code offset may be referenced by exception and variable
    // ranges.
    if remap.contains_key(&code.len()) {
        body.push(relabel(offset_label(code.len() as i64))?);
    }
    if !frames.is_empty() {
        return Err(ClassReadError::InvalidAttribute(
            "StackMapTable".to_string(),
        ));
    }

    for entry in &mut try_catch {
        entry.start = relabel(entry.start)?;
        entry.end = relabel(entry.end)?;
        entry.handler = relabel(entry.handler)?;
    }
    for entry in local_vars.iter_mut().chain(local_type_vars.iter_mut()) {
        entry.start = relabel(entry.start)?;
        entry.end = relabel(entry.end)?;
    }

    body.try_catch = try_catch;
    body.local_vars = local_vars;
    body.local_type_vars = local_type_vars;
    body.attributes = attributes;
    Ok(body)
}

fn read_local_variables(
    info: &[u8],
    cp: &[CpInfo],
    out: &mut Vec<LocalVariableNode>,
) -> Result<(), ClassReadError> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u2()? as usize;
    for _ in 0..count {
        let start_pc = reader.read_u2()? as usize;
        let length = reader.read_u2()? as usize;
        let name = cp_utf8(cp, reader.read_u2()?)?.to_string();
        let descriptor = cp_utf8(cp, reader.read_u2()?)?.to_string();
        let index = reader.read_u2()?;
        out.push(LocalVariableNode {
            name,
            descriptor,
            start: offset_label(start_pc as i64),
            end: offset_label((start_pc + length) as i64),
            index,
        });
    }
    Ok(())
}

fn read_stack_map(
    info: &[u8],
    cp: &[CpInfo],
    frames: &mut BTreeMap<usize, FrameNode>,
) -> Result<(), ClassReadError> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u2()? as usize;
    let mut offset: i64 = -1;
    for _ in 0..count {
        let frame_type = reader.read_u1()?;
        let (delta, frame) = match frame_type {
            0..=63 => (frame_type as u16, FrameNode::Same),
            64..=127 => (
                (frame_type - 64) as u16,
                FrameNode::SameLocals1 {
                    stack: read_verification_type(&mut reader, cp)?,
                },
            ),
            247 => {
                let delta = reader.read_u2()?;
                (
                    delta,
                    FrameNode::SameLocals1 {
                        stack: read_verification_type(&mut reader, cp)?,
                    },
                )
            }
            248..=250 => (
                reader.read_u2()?,
                FrameNode::Chop {
                    count: 251 - frame_type,
                },
            ),
            251 => (reader.read_u2()?, FrameNode::Same),
            252..=254 => {
                let delta = reader.read_u2()?;
                let local_count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(local_count);
                for _ in 0..local_count {
                    locals.push(read_verification_type(&mut reader, cp)?);
                }
                (delta, FrameNode::Append { locals })
            }
            255 => {
                let delta = reader.read_u2()?;
                let local_count = reader.read_u2()? as usize;
                let mut locals = Vec::with_capacity(local_count);
                for _ in 0..local_count {
                    locals.push(read_verification_type(&mut reader, cp)?);
                }
                let stack_count = reader.read_u2()? as usize;
                let mut stack = Vec::with_capacity(stack_count);
                for _ in 0..stack_count {
                    stack.push(read_verification_type(&mut reader, cp)?);
                }
                (delta, FrameNode::Full { locals, stack })
            }
            _ => {
                return Err(ClassReadError::InvalidAttribute(
                    "StackMapTable".to_string(),
                ));
            }
        };
        offset += delta as i64 + 1;
        frames.insert(offset as usize, frame);
    }
    Ok(())
}

fn read_verification_type(
    reader: &mut ByteReader<'_>,
    cp: &[CpInfo],
) -> Result<FrameValue, ClassReadError> {
    let tag = reader.read_u1()?;
    let value = match tag {
        0 => FrameValue::Top,
        1 => FrameValue::Integer,
        2 => FrameValue::Float,
        3 => FrameValue::Double,
        4 => FrameValue::Long,
        5 => FrameValue::Null,
        6 => FrameValue::UninitializedThis,
        7 => FrameValue::Object(cp_class_name(cp, reader.read_u2()?)?.to_string()),
        8 => FrameValue::Uninitialized(offset_label(reader.read_u2()? as i64)),
        _ => {
            return Err(ClassReadError::InvalidAttribute(
                "StackMapTable".to_string(),
            ));
        }
    };
    Ok(value)
}

fn collect_insn_targets(insn: &Insn, out: &mut Vec<usize>) {
    match insn {
        Insn::Jump { target, .. } => out.push(target.id),
        Insn::TableSwitch {
            default, targets, ..
        } => {
            out.push(default.id);
            out.extend(targets.iter().map(|label| label.id));
        }
        Insn::LookupSwitch { default, pairs } => {
            out.push(default.id);
            out.extend(pairs.iter().map(|(_, label)| label.id));
        }
        _ => {}
    }
}

fn collect_frame_targets(frame: &FrameNode, out: &mut Vec<usize>) {
    let values: Box<dyn Iterator<Item = &FrameValue>> = match frame {
        FrameNode::SameLocals1 { stack } => Box::new(std::iter::once(stack)),
        FrameNode::Append { locals } => Box::new(locals.iter()),
        FrameNode::Full { locals, stack } => Box::new(locals.iter().chain(stack.iter())),
        _ => Box::new(std::iter::empty()),
    };
    for value in values {
        if let FrameValue::Uninitialized(label) = value {
            out.push(label.id);
        }
    }
}

fn relabel_insn(
    insn: Insn,
    relabel: &impl Fn(LabelNode) -> Result<LabelNode, ClassReadError>,
) -> Result<BodyNode, ClassReadError> {
    let insn = match insn {
        Insn::Jump { opcode, target } => Insn::Jump {
            opcode,
            target: relabel(target)?,
        },
        Insn::TableSwitch {
            default,
            low,
            high,
            targets,
        } => Insn::TableSwitch {
            default: relabel(default)?,
            low,
            high,
            targets: targets
                .into_iter()
                .map(&relabel)
                .collect::<Result<_, _>>()?,
        },
        Insn::LookupSwitch { default, pairs } => Insn::LookupSwitch {
            default: relabel(default)?,
            pairs: pairs
                .into_iter()
                .map(|(key, label)| Ok((key, relabel(label)?)))
                .collect::<Result<_, ClassReadError>>()?,
        },
        other => other,
    };
    Ok(BodyNode::Insn(insn))
}

fn relabel_frame(
    frame: FrameNode,
    relabel: &impl Fn(LabelNode) -> Result<LabelNode, ClassReadError>,
) -> Result<FrameNode, ClassReadError> {
    let map_value = |value: FrameValue| -> Result<FrameValue, ClassReadError> {
        Ok(match value {
            FrameValue::Uninitialized(label) => FrameValue::Uninitialized(relabel(label)?),
            other => other,
        })
    };
    Ok(match frame {
        FrameNode::SameLocals1 { stack } => FrameNode::SameLocals1 {
            stack: map_value(stack)?,
        },
        FrameNode::Append { locals } => FrameNode::Append {
            locals: locals.into_iter().map(map_value).collect::<Result<_, _>>()?,
        },
        FrameNode::Full { locals, stack } => FrameNode::Full {
            locals: locals.into_iter().map(map_value).collect::<Result<_, _>>()?,
            stack: stack.into_iter().map(map_value).collect::<Result<_, _>>()?,
        },
        other => other,
    })
}

fn read_instructions(code: &[u8], cp: &[CpInfo]) -> Result<Vec<(usize, Insn)>, ClassReadError> {
    let mut reader = CodeReader::new(code);
    let mut insns = Vec::new();

    while reader.remaining() > 0 {
        let opcode_offset = reader.pos();
        let opcode = reader.read_u1()?;
        let at = opcode_offset as i64;
        let insn = match opcode {
            0x00..=0x0F => Insn::Simple(opcode),
            0x10 => Insn::Int {
                opcode,
                operand: reader.read_i1()? as i32,
            },
            0x11 => Insn::Int {
                opcode,
                operand: reader.read_i2()? as i32,
            },
            0x12 => Insn::Ldc {
                opcode,
                value: ConstValue::Index(reader.read_u1()? as u16),
            },
            0x13 | 0x14 => Insn::Ldc {
                opcode,
                value: ConstValue::Index(reader.read_u2()?),
            },
            0x15..=0x19 => Insn::Var {
                opcode,
                var_index: reader.read_u1()? as u16,
            },
            // load_<n> short forms widen to indexed instructions.
            0x1A..=0x2D => Insn::Var {
                opcode: opcodes::ILOAD + (opcode - 0x1A) / 4,
                var_index: ((opcode - 0x1A) % 4) as u16,
            },
            0x2E..=0x35 => Insn::Simple(opcode),
            0x36..=0x3A => Insn::Var {
                opcode,
                var_index: reader.read_u1()? as u16,
            },
            // store_<n> short forms widen to indexed instructions.
            0x3B..=0x4E => Insn::Var {
                opcode: opcodes::ISTORE + (opcode - 0x3B) / 4,
                var_index: ((opcode - 0x3B) % 4) as u16,
            },
            0x4F..=0x83 => Insn::Simple(opcode),
            0x84 => Insn::Iinc {
                var_index: reader.read_u1()? as u16,
                increment: reader.read_i1()? as i16,
            },
            0x85..=0x98 => Insn::Simple(opcode),
            0x99..=0xA8 => Insn::Jump {
                opcode,
                target: offset_label(at + reader.read_i2()? as i64),
            },
            0xA9 => Insn::Var {
                opcode,
                var_index: reader.read_u1()? as u16,
            },
            0xAA => read_table_switch(&mut reader, opcode_offset)?,
            0xAB => read_lookup_switch(&mut reader, opcode_offset)?,
            0xAC..=0xB1 => Insn::Simple(opcode),
            0xB2..=0xB5 => {
                let (owner, name, descriptor) = cp_field_ref(cp, reader.read_u2()?)?;
                Insn::Field {
                    opcode,
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                }
            }
            0xB6..=0xB8 => {
                let (owner, name, descriptor, is_interface) =
                    cp_method_ref(cp, reader.read_u2()?)?;
                Insn::Method {
                    opcode,
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    is_interface,
                }
            }
            0xB9 => {
                let index = reader.read_u2()?;
                let _count = reader.read_u1()?;
                let _ = reader.read_u1()?;
                let (owner, name, descriptor, _) = cp_method_ref(cp, index)?;
                Insn::Method {
                    opcode,
                    owner: owner.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                    is_interface: true,
                }
            }
            0xBA => {
                let index = reader.read_u2()?;
                let _ = reader.read_u2()?;
                Insn::InvokeDynamic { index }
            }
            0xBB | 0xBD | 0xC0 | 0xC1 => Insn::Type {
                opcode,
                type_name: cp_class_name(cp, reader.read_u2()?)?.to_string(),
            },
            0xBC => Insn::Int {
                opcode,
                operand: reader.read_u1()? as i32,
            },
            0xBE | 0xBF => Insn::Simple(opcode),
            0xC2 | 0xC3 => Insn::Simple(opcode),
            0xC4 => read_wide(&mut reader)?,
            0xC5 => Insn::MultiANewArray {
                type_name: cp_class_name(cp, reader.read_u2()?)?.to_string(),
                dimensions: reader.read_u1()?,
            },
            0xC6 | 0xC7 => Insn::Jump {
                opcode,
                target: offset_label(at + reader.read_i2()? as i64),
            },
            0xC8 | 0xC9 => Insn::Jump {
                opcode,
                target: offset_label(at + reader.read_i4()? as i64),
            },
            _ => {
                return Err(ClassReadError::InvalidOpcode {
                    opcode,
                    offset: opcode_offset,
                });
            }
        };

        insns.push((opcode_offset, insn));
    }

    Ok(insns)
}

fn read_table_switch(
    reader: &mut CodeReader<'_>,
    opcode_offset: usize,
) -> Result<Insn, ClassReadError> {
    reader.align4(opcode_offset)?;
    let at = opcode_offset as i64;
    let default_offset = reader.read_i4()?;
    let low = reader.read_i4()?;
    let high = reader.read_i4()?;
    let count = if high < low {
        0
    } else {
        (high - low + 1) as usize
    };
    let mut targets = Vec::with_capacity(count);
    for _ in 0..count {
        targets.push(offset_label(at + reader.read_i4()? as i64));
    }
    Ok(Insn::TableSwitch {
        default: offset_label(at + default_offset as i64),
        low,
        high,
        targets,
    })
}

fn read_lookup_switch(
    reader: &mut CodeReader<'_>,
    opcode_offset: usize,
) -> Result<Insn, ClassReadError> {
    reader.align4(opcode_offset)?;
    let at = opcode_offset as i64;
    let default_offset = reader.read_i4()?;
    let npairs = reader.read_i4()? as usize;
    let mut pairs = Vec::with_capacity(npairs);
    for _ in 0..npairs {
        let key = reader.read_i4()?;
        let offset = reader.read_i4()?;
        pairs.push((key, offset_label(at + offset as i64)));
    }
    Ok(Insn::LookupSwitch {
        default: offset_label(at + default_offset as i64),
        pairs,
    })
}

fn read_wide(reader: &mut CodeReader<'_>) -> Result<Insn, ClassReadError> {
    let opcode = reader.read_u1()?;
    match opcode {
        0x15..=0x19 | 0x36..=0x3A | 0xA9 => Ok(Insn::Var {
            opcode,
            var_index: reader.read_u2()?,
        }),
        0x84 => Ok(Insn::Iinc {
            var_index: reader.read_u2()?,
            increment: reader.read_i2()?,
        }),
        _ => Err(ClassReadError::InvalidOpcode {
            opcode,
            offset: reader.pos().saturating_sub(1),
        }),
    }
}

// ---------------------------------------------------------------------------
// Annotations

/// A decoded runtime annotation, with constant-pool references resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub type_descriptor: String,
    pub values: Vec<(String, ElementValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    /// Primitive or string constant; `tag` is the descriptor character,
    /// strings carry the resolved text.
    Const { tag: u8, text: Option<String> },
    EnumConst { type_name: String, const_name: String },
    /// A class literal, as a type descriptor.
    Class(String),
    Annotation(Annotation),
    Array(Vec<ElementValue>),
}

/// Decode a `RuntimeVisibleAnnotations` / `RuntimeInvisibleAnnotations`
/// attribute body.
pub fn decode_annotations(
    info: &[u8],
    cp: &[CpInfo],
) -> Result<Vec<Annotation>, ClassReadError> {
    let mut reader = ByteReader::new(info);
    let count = reader.read_u2()? as usize;
    let mut annotations = Vec::with_capacity(count);
    for _ in 0..count {
        annotations.push(read_annotation(&mut reader, cp)?);
    }
    Ok(annotations)
}

fn read_annotation(
    reader: &mut ByteReader<'_>,
    cp: &[CpInfo],
) -> Result<Annotation, ClassReadError> {
    let type_descriptor = cp_utf8(cp, reader.read_u2()?)?.to_string();
    let pair_count = reader.read_u2()? as usize;
    let mut values = Vec::with_capacity(pair_count);
    for _ in 0..pair_count {
        let element_name = cp_utf8(cp, reader.read_u2()?)?.to_string();
        values.push((element_name, read_element_value(reader, cp)?));
    }
    Ok(Annotation {
        type_descriptor,
        values,
    })
}

fn read_element_value(
    reader: &mut ByteReader<'_>,
    cp: &[CpInfo],
) -> Result<ElementValue, ClassReadError> {
    let tag = reader.read_u1()?;
    let value = match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => {
            let _ = reader.read_u2()?;
            ElementValue::Const { tag, text: None }
        }
        b's' => ElementValue::Const {
            tag,
            text: Some(cp_utf8(cp, reader.read_u2()?)?.to_string()),
        },
        b'e' => ElementValue::EnumConst {
            type_name: cp_utf8(cp, reader.read_u2()?)?.to_string(),
            const_name: cp_utf8(cp, reader.read_u2()?)?.to_string(),
        },
        b'c' => ElementValue::Class(cp_utf8(cp, reader.read_u2()?)?.to_string()),
        b'@' => ElementValue::Annotation(read_annotation(reader, cp)?),
        b'[' => {
            let count = reader.read_u2()? as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(read_element_value(reader, cp)?);
            }
            ElementValue::Array(values)
        }
        _ => {
            return Err(ClassReadError::InvalidAttribute(
                "annotation element value".to_string(),
            ));
        }
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// Constant pool lookups

pub(crate) fn cp_utf8(cp: &[CpInfo], index: u16) -> Result<&str, ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::Utf8(value)) => Ok(value.as_str()),
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

pub(crate) fn cp_class_name(cp: &[CpInfo], index: u16) -> Result<&str, ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::Class { name_index }) => cp_utf8(cp, *name_index),
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

fn cp_name_and_type(cp: &[CpInfo], index: u16) -> Result<(&str, &str), ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::NameAndType {
            name_index,
            descriptor_index,
        }) => Ok((cp_utf8(cp, *name_index)?, cp_utf8(cp, *descriptor_index)?)),
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

fn cp_field_ref(cp: &[CpInfo], index: u16) -> Result<(&str, &str, &str), ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::Fieldref {
            class_index,
            name_and_type_index,
        }) => {
            let owner = cp_class_name(cp, *class_index)?;
            let (name, desc) = cp_name_and_type(cp, *name_and_type_index)?;
            Ok((owner, name, desc))
        }
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

fn cp_method_ref(cp: &[CpInfo], index: u16) -> Result<(&str, &str, &str, bool), ClassReadError> {
    match cp.get(index as usize) {
        Some(CpInfo::Methodref {
            class_index,
            name_and_type_index,
        }) => {
            let owner = cp_class_name(cp, *class_index)?;
            let (name, desc) = cp_name_and_type(cp, *name_and_type_index)?;
            Ok((owner, name, desc, false))
        }
        Some(CpInfo::InterfaceMethodref {
            class_index,
            name_and_type_index,
        }) => {
            let owner = cp_class_name(cp, *class_index)?;
            let (name, desc) = cp_name_and_type(cp, *name_and_type_index)?;
            Ok((owner, name, desc, true))
        }
        _ => Err(ClassReadError::InvalidIndex(index)),
    }
}

fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassReadError> {
    let mut code_units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if byte & 0x80 == 0 {
            code_units.push(byte as u16);
            i += 1;
        } else if byte & 0xE0 == 0xC0 {
            if i + 1 >= bytes.len() {
                return Err(ClassReadError::Utf8Error("truncated 2-byte".to_string()));
            }
            let byte2 = bytes[i + 1];
            if byte2 & 0xC0 != 0x80 {
                return Err(ClassReadError::Utf8Error("invalid 2-byte".to_string()));
            }
            let value = (((byte & 0x1F) as u16) << 6) | ((byte2 & 0x3F) as u16);
            code_units.push(value);
            i += 2;
        } else if byte & 0xF0 == 0xE0 {
            if i + 2 >= bytes.len() {
                return Err(ClassReadError::Utf8Error("truncated 3-byte".to_string()));
            }
            let byte2 = bytes[i + 1];
            let byte3 = bytes[i + 2];
            if byte2 & 0xC0 != 0x80 || byte3 & 0xC0 != 0x80 {
                return Err(ClassReadError::Utf8Error("invalid 3-byte".to_string()));
            }
            let value = (((byte & 0x0F) as u16) << 12)
                | (((byte2 & 0x3F) as u16) << 6)
                | ((byte3 & 0x3F) as u16);
            code_units.push(value);
            i += 3;
        } else {
            return Err(ClassReadError::Utf8Error(
                "invalid leading byte".to_string(),
            ));
        }
    }

    String::from_utf16(&code_units)
        .map_err(|_| ClassReadError::Utf8Error("invalid utf16".to_string()))
}

struct CodeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CodeReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn align4(&mut self, opcode_offset: usize) -> Result<(), ClassReadError> {
        let mut padding = (4 - ((opcode_offset + 1) % 4)) % 4;
        while padding > 0 {
            self.read_u1()?;
            padding -= 1;
        }
        Ok(())
    }

    fn read_u1(&mut self) -> Result<u8, ClassReadError> {
        if self.pos >= self.data.len() {
            return Err(ClassReadError::UnexpectedEof);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_i1(&mut self) -> Result<i8, ClassReadError> {
        Ok(self.read_u1()? as i8)
    }

    fn read_u2(&mut self) -> Result<u16, ClassReadError> {
        Ok(u16::from_be_bytes([self.read_u1()?, self.read_u1()?]))
    }

    fn read_i2(&mut self) -> Result<i16, ClassReadError> {
        Ok(self.read_u2()? as i16)
    }

    fn read_i4(&mut self) -> Result<i32, ClassReadError> {
        let high = self.read_u2()? as u32;
        let low = self.read_u2()? as u32;
        Ok(((high << 16) | low) as i32)
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u1(&mut self) -> Result<u8, ClassReadError> {
        if self.pos >= self.data.len() {
            return Err(ClassReadError::UnexpectedEof);
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u2(&mut self) -> Result<u16, ClassReadError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ClassReadError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u8(&mut self) -> Result<u64, ClassReadError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ClassReadError> {
        if self.pos + len > self.data.len() {
            return Err(ClassReadError::UnexpectedEof);
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }
}

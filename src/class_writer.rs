//! Encoding side of the class-file codec: [`ClassNode`] to bytes.
//!
//! Bodies are assembled from their node lists in two passes: the first
//! resolves every label to a bytecode offset (choosing compact variable
//! forms and `wide` prefixes deterministically), the second emits bytes and
//! branch offsets. Stack map frames are re-encoded from the in-list frame
//! markers with recomputed offset deltas. The writer performs **no** frame
//! or max computation: a tree whose frames or maxima are wrong encodes
//! wrong. This is deliberate — computing frames requires loading referenced
//! classes to find common supertypes, which deadlocks on classes that are
//! themselves still being rewritten.

use std::collections::HashMap;

use crate::error::ClassWriteError;
use crate::insn::{
    BodyNode, ConstValue, FrameNode, FrameValue, Insn, LabelNode, LocalVariableNode,
};
use crate::nodes::{AttributeInfo, ClassNode, CpInfo, FieldNode, MethodBody, MethodNode};
use crate::opcodes;

pub struct ClassWriter;

impl ClassWriter {
    pub fn to_bytes(class: &ClassNode) -> Result<Vec<u8>, ClassWriteError> {
        if class.constant_pool.is_empty() {
            return Err(ClassWriteError::MissingConstantPool);
        }
        let mut pool = PoolWriter::new(class.constant_pool.clone());

        let this_class = pool.class(&class.name)?;
        let super_class = match class.super_name.as_deref() {
            Some(name) => pool.class(name)?,
            None => 0,
        };
        let mut interface_indices = Vec::with_capacity(class.interfaces.len());
        for name in &class.interfaces {
            interface_indices.push(pool.class(name)?);
        }

        // Member and attribute bytes are buffered first so the pool picks up
        // every interned entry before it is written.
        let mut field_buf = Vec::new();
        for field in &class.fields {
            write_field(&mut field_buf, field, &mut pool)?;
        }
        let mut method_buf = Vec::new();
        for method in &class.methods {
            write_method(&mut method_buf, method, &mut pool)?;
        }
        let mut attr_buf = Vec::new();
        write_u2(&mut attr_buf, class.attributes.len() as u16);
        for attr in &class.attributes {
            write_attribute(&mut attr_buf, attr, &mut pool)?;
        }

        let mut out = Vec::new();
        write_u4(&mut out, 0xCAFEBABE);
        write_u2(&mut out, class.minor_version);
        write_u2(&mut out, class.major_version);
        pool.write_to(&mut out)?;
        write_u2(&mut out, class.access_flags);
        write_u2(&mut out, this_class);
        write_u2(&mut out, super_class);
        write_u2(&mut out, interface_indices.len() as u16);
        for index in interface_indices {
            write_u2(&mut out, index);
        }
        write_u2(&mut out, class.fields.len() as u16);
        out.extend_from_slice(&field_buf);
        write_u2(&mut out, class.methods.len() as u16);
        out.extend_from_slice(&method_buf);
        out.extend_from_slice(&attr_buf);
        Ok(out)
    }
}

fn write_field(
    out: &mut Vec<u8>,
    field: &FieldNode,
    pool: &mut PoolWriter,
) -> Result<(), ClassWriteError> {
    write_u2(out, field.access_flags);
    let name_index = pool.utf8(&field.name)?;
    let descriptor_index = pool.utf8(&field.descriptor)?;
    write_u2(out, name_index);
    write_u2(out, descriptor_index);
    write_u2(out, field.attributes.len() as u16);
    for attr in &field.attributes {
        write_attribute(out, attr, pool)?;
    }
    Ok(())
}

fn write_method(
    out: &mut Vec<u8>,
    method: &MethodNode,
    pool: &mut PoolWriter,
) -> Result<(), ClassWriteError> {
    write_u2(out, method.access_flags);
    let name_index = pool.utf8(&method.name)?;
    let descriptor_index = pool.utf8(&method.descriptor)?;
    write_u2(out, name_index);
    write_u2(out, descriptor_index);

    let mut count = method.attributes.len();
    if method.body.is_some() {
        count += 1;
    }
    if !method.exceptions.is_empty() {
        count += 1;
    }
    if method.signature.is_some() {
        count += 1;
    }
    write_u2(out, count as u16);

    if let Some(body) = &method.body {
        let info = assemble_body(body, pool)?;
        let name_index = pool.utf8("Code")?;
        write_attribute_with_info(out, name_index, &info);
    }
    if !method.exceptions.is_empty() {
        let mut info = Vec::new();
        write_u2(&mut info, method.exceptions.len() as u16);
        for exception in &method.exceptions {
            let index = pool.class(exception)?;
            write_u2(&mut info, index);
        }
        let name_index = pool.utf8("Exceptions")?;
        write_attribute_with_info(out, name_index, &info);
    }
    if let Some(signature) = &method.signature {
        let mut info = Vec::new();
        let sig_index = pool.utf8(signature)?;
        write_u2(&mut info, sig_index);
        let name_index = pool.utf8("Signature")?;
        write_attribute_with_info(out, name_index, &info);
    }
    for attr in &method.attributes {
        write_attribute(out, attr, pool)?;
    }
    Ok(())
}

fn write_attribute(
    out: &mut Vec<u8>,
    attr: &AttributeInfo,
    pool: &mut PoolWriter,
) -> Result<(), ClassWriteError> {
    let name_index = pool.utf8(attr.name())?;
    let mut info = Vec::new();
    match attr {
        AttributeInfo::ConstantValue { value_index } => {
            write_u2(&mut info, *value_index);
        }
        AttributeInfo::SourceFile { name } => {
            let index = pool.utf8(name)?;
            write_u2(&mut info, index);
        }
        AttributeInfo::Signature { signature } => {
            let index = pool.utf8(signature)?;
            write_u2(&mut info, index);
        }
        AttributeInfo::Deprecated | AttributeInfo::Synthetic => {}
        AttributeInfo::InnerClasses { classes } => {
            write_u2(&mut info, classes.len() as u16);
            for class in classes {
                let inner = pool.class(&class.inner)?;
                write_u2(&mut info, inner);
                let outer = match &class.outer {
                    Some(name) => pool.class(name)?,
                    None => 0,
                };
                write_u2(&mut info, outer);
                let inner_name = match &class.inner_name {
                    Some(name) => pool.utf8(name)?,
                    None => 0,
                };
                write_u2(&mut info, inner_name);
                write_u2(&mut info, class.access_flags);
            }
        }
        AttributeInfo::EnclosingMethod { class_name, method } => {
            let class_index = pool.class(class_name)?;
            write_u2(&mut info, class_index);
            let method_index = match method {
                Some((name, descriptor)) => pool.name_and_type(name, descriptor)?,
                None => 0,
            };
            write_u2(&mut info, method_index);
        }
        AttributeInfo::BootstrapMethods { methods } => {
            write_u2(&mut info, methods.len() as u16);
            for method in methods {
                write_u2(&mut info, method.bootstrap_method_ref);
                write_u2(&mut info, method.bootstrap_arguments.len() as u16);
                for arg in &method.bootstrap_arguments {
                    write_u2(&mut info, *arg);
                }
            }
        }
        AttributeInfo::MethodParameters { parameters } => {
            write_u1(&mut info, parameters.len() as u8);
            for parameter in parameters {
                let name_index = match &parameter.name {
                    Some(name) => pool.utf8(name)?,
                    None => 0,
                };
                write_u2(&mut info, name_index);
                write_u2(&mut info, parameter.access_flags);
            }
        }
        AttributeInfo::Unknown { info: raw, .. } => {
            info.extend_from_slice(raw);
        }
    }
    write_attribute_with_info(out, name_index, &info);
    Ok(())
}

fn write_attribute_with_info(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    write_u2(out, name_index);
    write_u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

// ---------------------------------------------------------------------------
// Body assembly

fn assemble_body(body: &MethodBody, pool: &mut PoolWriter) -> Result<Vec<u8>, ClassWriteError> {
    // Pass 1: pin every label to an offset.
    let mut labels: HashMap<usize, u32> = HashMap::new();
    let mut offset: u32 = 0;
    for node in &body.nodes {
        match node {
            BodyNode::Label(label) => {
                labels.insert(label.id, offset);
            }
            BodyNode::Line { .. } | BodyNode::Frame(_) => {}
            BodyNode::Insn(insn) => offset += insn_length(insn, offset, pool)?,
        }
    }
    let code_length = offset;
    if code_length > 0xFFFF {
        return Err(ClassWriteError::OversizedBody);
    }
    let resolve = |label: LabelNode| -> Result<u32, ClassWriteError> {
        labels
            .get(&label.id)
            .copied()
            .ok_or(ClassWriteError::UnresolvedLabel(label.id))
    };

    // Pass 2: emit code, collecting frame and line positions on the way.
    let mut code = Vec::with_capacity(code_length as usize);
    let mut frames: Vec<(u32, &FrameNode)> = Vec::new();
    let mut lines: Vec<(u32, u16)> = Vec::new();
    for node in &body.nodes {
        match node {
            BodyNode::Label(_) => {}
            BodyNode::Frame(frame) => frames.push((code.len() as u32, frame)),
            BodyNode::Line { line, start } => lines.push((resolve(*start)?, *line)),
            BodyNode::Insn(insn) => emit_insn(&mut code, insn, pool, &resolve)?,
        }
    }

    let mut info = Vec::new();
    write_u2(&mut info, body.max_stack);
    write_u2(&mut info, body.max_locals);
    write_u4(&mut info, code.len() as u32);
    info.extend_from_slice(&code);

    write_u2(&mut info, body.try_catch.len() as u16);
    for entry in &body.try_catch {
        write_u2(&mut info, resolve(entry.start)? as u16);
        write_u2(&mut info, resolve(entry.end)? as u16);
        write_u2(&mut info, resolve(entry.handler)? as u16);
        let catch_index = match &entry.catch_type {
            Some(name) => pool.class(name)?,
            None => 0,
        };
        write_u2(&mut info, catch_index);
    }

    let mut attr_count = body.attributes.len();
    let mut stack_map = Vec::new();
    if !frames.is_empty() {
        write_stack_map(&mut stack_map, &frames, pool, &resolve)?;
        attr_count += 1;
    }
    if !lines.is_empty() {
        attr_count += 1;
    }
    if !body.local_vars.is_empty() {
        attr_count += 1;
    }
    if !body.local_type_vars.is_empty() {
        attr_count += 1;
    }
    write_u2(&mut info, attr_count as u16);

    if !frames.is_empty() {
        let name_index = pool.utf8("StackMapTable")?;
        write_attribute_with_info(&mut info, name_index, &stack_map);
    }
    if !lines.is_empty() {
        let mut table = Vec::new();
        write_u2(&mut table, lines.len() as u16);
        for (start_pc, line) in &lines {
            write_u2(&mut table, *start_pc as u16);
            write_u2(&mut table, *line);
        }
        let name_index = pool.utf8("LineNumberTable")?;
        write_attribute_with_info(&mut info, name_index, &table);
    }
    if !body.local_vars.is_empty() {
        let table = write_local_variables(&body.local_vars, pool, &resolve)?;
        let name_index = pool.utf8("LocalVariableTable")?;
        write_attribute_with_info(&mut info, name_index, &table);
    }
    if !body.local_type_vars.is_empty() {
        let table = write_local_variables(&body.local_type_vars, pool, &resolve)?;
        let name_index = pool.utf8("LocalVariableTypeTable")?;
        write_attribute_with_info(&mut info, name_index, &table);
    }
    for attr in &body.attributes {
        write_attribute(&mut info, attr, pool)?;
    }
    Ok(info)
}

fn write_local_variables(
    entries: &[LocalVariableNode],
    pool: &mut PoolWriter,
    resolve: &impl Fn(LabelNode) -> Result<u32, ClassWriteError>,
) -> Result<Vec<u8>, ClassWriteError> {
    let mut table = Vec::new();
    write_u2(&mut table, entries.len() as u16);
    for entry in entries {
        let start = resolve(entry.start)?;
        let end = resolve(entry.end)?;
        write_u2(&mut table, start as u16);
        write_u2(&mut table, end.saturating_sub(start) as u16);
        let name_index = pool.utf8(&entry.name)?;
        let descriptor_index = pool.utf8(&entry.descriptor)?;
        write_u2(&mut table, name_index);
        write_u2(&mut table, descriptor_index);
        write_u2(&mut table, entry.index);
    }
    Ok(table)
}

/// Encoded length of an instruction placed at `offset`.
fn insn_length(insn: &Insn, offset: u32, pool: &mut PoolWriter) -> Result<u32, ClassWriteError> {
    let length = match insn {
        Insn::Simple(_) => 1,
        Insn::Int { opcode, .. } => {
            if *opcode == opcodes::SIPUSH {
                3
            } else {
                2
            }
        }
        Insn::Var { opcode, var_index } => var_length(*opcode, *var_index),
        Insn::Type { .. } => 3,
        Insn::Field { .. } => 3,
        Insn::Method { opcode, .. } => {
            if *opcode == opcodes::INVOKEINTERFACE {
                5
            } else {
                3
            }
        }
        Insn::InvokeDynamic { .. } => 5,
        Insn::Jump { opcode, .. } => {
            if *opcode == opcodes::GOTO_W || *opcode == opcodes::JSR_W {
                5
            } else {
                3
            }
        }
        Insn::Ldc { opcode, value } => match ldc_encoding(*opcode, value, pool)? {
            (opcodes::LDC, _) => 2,
            _ => 3,
        },
        Insn::Iinc {
            var_index,
            increment,
        } => {
            if *var_index > 0xFF || i8::try_from(*increment).is_err() {
                6
            } else {
                3
            }
        }
        Insn::TableSwitch { targets, .. } => {
            1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
        }
        Insn::LookupSwitch { pairs, .. } => {
            1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
        }
        Insn::MultiANewArray { .. } => 4,
    };
    Ok(length)
}

fn var_length(opcode: u8, var_index: u16) -> u32 {
    if var_index > 0xFF {
        return 4;
    }
    if var_index <= 3 && opcode != opcodes::RET {
        1
    } else {
        2
    }
}

fn switch_padding(opcode_offset: u32) -> u32 {
    (4 - ((opcode_offset + 1) % 4)) % 4
}

/// Pick the final opcode and pool index of an `ldc`. Interning is idempotent,
/// so calling this in both passes yields identical results.
fn ldc_encoding(
    opcode: u8,
    value: &ConstValue,
    pool: &mut PoolWriter,
) -> Result<(u8, u16), ClassWriteError> {
    let index = match value {
        ConstValue::Index(index) => *index,
        ConstValue::String(text) => pool.string(text)?,
    };
    if opcode == opcodes::LDC2_W {
        return Ok((opcodes::LDC2_W, index));
    }
    if index <= 0xFF {
        Ok((opcodes::LDC, index))
    } else {
        Ok((opcodes::LDC_W, index))
    }
}

fn emit_insn(
    code: &mut Vec<u8>,
    insn: &Insn,
    pool: &mut PoolWriter,
    resolve: &impl Fn(LabelNode) -> Result<u32, ClassWriteError>,
) -> Result<(), ClassWriteError> {
    let at = code.len() as u32;
    match insn {
        Insn::Simple(opcode) => code.push(*opcode),
        Insn::Int { opcode, operand } => {
            code.push(*opcode);
            if *opcode == opcodes::SIPUSH {
                write_i2(code, *operand as i16);
            } else {
                write_u1(code, *operand as u8);
            }
        }
        Insn::Var { opcode, var_index } => match var_length(*opcode, *var_index) {
            1 => code.push(compact_var_opcode(*opcode, *var_index)),
            2 => {
                code.push(*opcode);
                write_u1(code, *var_index as u8);
            }
            _ => {
                code.push(opcodes::WIDE);
                code.push(*opcode);
                write_u2(code, *var_index);
            }
        },
        Insn::Type { opcode, type_name } => {
            code.push(*opcode);
            let index = pool.class(type_name)?;
            write_u2(code, index);
        }
        Insn::Field {
            opcode,
            owner,
            name,
            descriptor,
        } => {
            code.push(*opcode);
            let index = pool.field_ref(owner, name, descriptor)?;
            write_u2(code, index);
        }
        Insn::Method {
            opcode,
            owner,
            name,
            descriptor,
            is_interface,
        } => {
            code.push(*opcode);
            let index = pool.method_ref(owner, name, descriptor, *is_interface)?;
            write_u2(code, index);
            if *opcode == opcodes::INVOKEINTERFACE {
                write_u1(code, invoke_interface_count(descriptor));
                write_u1(code, 0);
            }
        }
        Insn::InvokeDynamic { index } => {
            code.push(opcodes::INVOKEDYNAMIC);
            write_u2(code, *index);
            write_u2(code, 0);
        }
        Insn::Jump { opcode, target } => {
            code.push(*opcode);
            let distance = resolve(*target)? as i64 - at as i64;
            if *opcode == opcodes::GOTO_W || *opcode == opcodes::JSR_W {
                write_i4(code, distance as i32);
            } else {
                let narrow = i16::try_from(distance).map_err(|_| {
                    ClassWriteError::BranchOutOfRange {
                        label: target.id,
                        distance,
                    }
                })?;
                write_i2(code, narrow);
            }
        }
        Insn::Ldc { opcode, value } => {
            let (final_opcode, index) = ldc_encoding(*opcode, value, pool)?;
            code.push(final_opcode);
            if final_opcode == opcodes::LDC {
                write_u1(code, index as u8);
            } else {
                write_u2(code, index);
            }
        }
        Insn::Iinc {
            var_index,
            increment,
        } => {
            if *var_index > 0xFF || i8::try_from(*increment).is_err() {
                code.push(opcodes::WIDE);
                code.push(opcodes::IINC);
                write_u2(code, *var_index);
                write_i2(code, *increment);
            } else {
                code.push(opcodes::IINC);
                write_u1(code, *var_index as u8);
                write_u1(code, *increment as u8);
            }
        }
        Insn::TableSwitch {
            default,
            low,
            high,
            targets,
        } => {
            code.push(opcodes::TABLESWITCH);
            for _ in 0..switch_padding(at) {
                code.push(0);
            }
            write_i4(code, (resolve(*default)? as i64 - at as i64) as i32);
            write_i4(code, *low);
            write_i4(code, *high);
            for target in targets {
                write_i4(code, (resolve(*target)? as i64 - at as i64) as i32);
            }
        }
        Insn::LookupSwitch { default, pairs } => {
            code.push(opcodes::LOOKUPSWITCH);
            for _ in 0..switch_padding(at) {
                code.push(0);
            }
            write_i4(code, (resolve(*default)? as i64 - at as i64) as i32);
            write_i4(code, pairs.len() as i32);
            for (key, target) in pairs {
                write_i4(code, *key);
                write_i4(code, (resolve(*target)? as i64 - at as i64) as i32);
            }
        }
        Insn::MultiANewArray {
            type_name,
            dimensions,
        } => {
            code.push(opcodes::MULTIANEWARRAY);
            let index = pool.class(type_name)?;
            write_u2(code, index);
            write_u1(code, *dimensions);
        }
    }
    Ok(())
}

fn compact_var_opcode(opcode: u8, var_index: u16) -> u8 {
    let base = if (opcodes::ILOAD..=opcodes::ALOAD).contains(&opcode) {
        0x1A + (opcode - opcodes::ILOAD) * 4
    } else {
        0x3B + (opcode - opcodes::ISTORE) * 4
    };
    base + var_index as u8
}

/// `invokeinterface` count operand: receiver plus argument slots.
fn invoke_interface_count(descriptor: &str) -> u8 {
    let parsed = crate::names::MethodDescriptor::parse(descriptor);
    match parsed {
        Some(parsed) => 1 + parsed.arg_slots() as u8,
        None => 1,
    }
}

fn write_stack_map(
    out: &mut Vec<u8>,
    frames: &[(u32, &FrameNode)],
    pool: &mut PoolWriter,
    resolve: &impl Fn(LabelNode) -> Result<u32, ClassWriteError>,
) -> Result<(), ClassWriteError> {
    write_u2(out, frames.len() as u16);
    let mut previous: i64 = -1;
    for (offset, frame) in frames {
        let delta = *offset as i64 - previous - 1;
        if delta < 0 {
            return Err(ClassWriteError::MisplacedFrame);
        }
        previous = *offset as i64;
        let delta = delta as u16;
        match frame {
            FrameNode::Same => {
                if delta <= 63 {
                    write_u1(out, delta as u8);
                } else {
                    write_u1(out, 251);
                    write_u2(out, delta);
                }
            }
            FrameNode::SameLocals1 { stack } => {
                if delta <= 63 {
                    write_u1(out, 64 + delta as u8);
                } else {
                    write_u1(out, 247);
                    write_u2(out, delta);
                }
                write_frame_value(out, stack, pool, resolve)?;
            }
            FrameNode::Chop { count } => {
                write_u1(out, 251 - count);
                write_u2(out, delta);
            }
            FrameNode::Append { locals } => {
                write_u1(out, 251 + locals.len() as u8);
                write_u2(out, delta);
                for local in locals {
                    write_frame_value(out, local, pool, resolve)?;
                }
            }
            FrameNode::Full { locals, stack } => {
                write_u1(out, 255);
                write_u2(out, delta);
                write_u2(out, locals.len() as u16);
                for local in locals {
                    write_frame_value(out, local, pool, resolve)?;
                }
                write_u2(out, stack.len() as u16);
                for value in stack {
                    write_frame_value(out, value, pool, resolve)?;
                }
            }
        }
    }
    Ok(())
}

fn write_frame_value(
    out: &mut Vec<u8>,
    value: &FrameValue,
    pool: &mut PoolWriter,
    resolve: &impl Fn(LabelNode) -> Result<u32, ClassWriteError>,
) -> Result<(), ClassWriteError> {
    match value {
        FrameValue::Top => write_u1(out, 0),
        FrameValue::Integer => write_u1(out, 1),
        FrameValue::Float => write_u1(out, 2),
        FrameValue::Double => write_u1(out, 3),
        FrameValue::Long => write_u1(out, 4),
        FrameValue::Null => write_u1(out, 5),
        FrameValue::UninitializedThis => write_u1(out, 6),
        FrameValue::Object(name) => {
            write_u1(out, 7);
            let index = pool.class(name)?;
            write_u2(out, index);
        }
        FrameValue::Uninitialized(label) => {
            write_u1(out, 8);
            write_u2(out, resolve(*label)? as u16);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Constant-pool interning

/// Write-side view of the constant pool: the decoded entries plus dedup maps
/// so symbolic references intern to existing indices where possible. New
/// entries are appended only.
struct PoolWriter {
    cp: Vec<CpInfo>,
    utf8: HashMap<String, u16>,
    class: HashMap<String, u16>,
    string: HashMap<String, u16>,
    name_and_type: HashMap<(String, String), u16>,
    field_ref: HashMap<(String, String, String), u16>,
    method_ref: HashMap<(String, String, String, bool), u16>,
}

impl PoolWriter {
    fn new(cp: Vec<CpInfo>) -> Self {
        let mut writer = PoolWriter {
            cp,
            utf8: HashMap::new(),
            class: HashMap::new(),
            string: HashMap::new(),
            name_and_type: HashMap::new(),
            field_ref: HashMap::new(),
            method_ref: HashMap::new(),
        };
        writer.index_existing();
        writer
    }

    fn index_existing(&mut self) {
        let lookup_utf8 = |cp: &[CpInfo], index: u16| -> Option<String> {
            match cp.get(index as usize) {
                Some(CpInfo::Utf8(value)) => Some(value.clone()),
                _ => None,
            }
        };
        let lookup_class = |cp: &[CpInfo], index: u16| -> Option<String> {
            match cp.get(index as usize) {
                Some(CpInfo::Class { name_index }) => lookup_utf8(cp, *name_index),
                _ => None,
            }
        };
        let lookup_nat = |cp: &[CpInfo], index: u16| -> Option<(String, String)> {
            match cp.get(index as usize) {
                Some(CpInfo::NameAndType {
                    name_index,
                    descriptor_index,
                }) => Some((lookup_utf8(cp, *name_index)?, lookup_utf8(cp, *descriptor_index)?)),
                _ => None,
            }
        };

        for index in 1..self.cp.len() {
            let index_u16 = index as u16;
            match &self.cp[index] {
                CpInfo::Utf8(value) => {
                    self.utf8.entry(value.clone()).or_insert(index_u16);
                }
                CpInfo::Class { name_index } => {
                    if let Some(name) = lookup_utf8(&self.cp, *name_index) {
                        self.class.entry(name).or_insert(index_u16);
                    }
                }
                CpInfo::String { string_index } => {
                    if let Some(value) = lookup_utf8(&self.cp, *string_index) {
                        self.string.entry(value).or_insert(index_u16);
                    }
                }
                CpInfo::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    if let (Some(name), Some(descriptor)) = (
                        lookup_utf8(&self.cp, *name_index),
                        lookup_utf8(&self.cp, *descriptor_index),
                    ) {
                        self.name_and_type
                            .entry((name, descriptor))
                            .or_insert(index_u16);
                    }
                }
                CpInfo::Fieldref {
                    class_index,
                    name_and_type_index,
                } => {
                    if let (Some(owner), Some((name, descriptor))) = (
                        lookup_class(&self.cp, *class_index),
                        lookup_nat(&self.cp, *name_and_type_index),
                    ) {
                        self.field_ref
                            .entry((owner, name, descriptor))
                            .or_insert(index_u16);
                    }
                }
                CpInfo::Methodref {
                    class_index,
                    name_and_type_index,
                } => {
                    if let (Some(owner), Some((name, descriptor))) = (
                        lookup_class(&self.cp, *class_index),
                        lookup_nat(&self.cp, *name_and_type_index),
                    ) {
                        self.method_ref
                            .entry((owner, name, descriptor, false))
                            .or_insert(index_u16);
                    }
                }
                CpInfo::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    if let (Some(owner), Some((name, descriptor))) = (
                        lookup_class(&self.cp, *class_index),
                        lookup_nat(&self.cp, *name_and_type_index),
                    ) {
                        self.method_ref
                            .entry((owner, name, descriptor, true))
                            .or_insert(index_u16);
                    }
                }
                _ => {}
            }
        }
    }

    fn push(&mut self, entry: CpInfo) -> Result<u16, ClassWriteError> {
        if self.cp.len() >= 0xFFFF {
            return Err(ClassWriteError::ConstantPoolOverflow);
        }
        self.cp.push(entry);
        Ok((self.cp.len() - 1) as u16)
    }

    fn utf8(&mut self, value: &str) -> Result<u16, ClassWriteError> {
        if let Some(index) = self.utf8.get(value) {
            return Ok(*index);
        }
        let index = self.push(CpInfo::Utf8(value.to_string()))?;
        self.utf8.insert(value.to_string(), index);
        Ok(index)
    }

    fn class(&mut self, name: &str) -> Result<u16, ClassWriteError> {
        if let Some(index) = self.class.get(name) {
            return Ok(*index);
        }
        let name_index = self.utf8(name)?;
        let index = self.push(CpInfo::Class { name_index })?;
        self.class.insert(name.to_string(), index);
        Ok(index)
    }

    fn string(&mut self, value: &str) -> Result<u16, ClassWriteError> {
        if let Some(index) = self.string.get(value) {
            return Ok(*index);
        }
        let string_index = self.utf8(value)?;
        let index = self.push(CpInfo::String { string_index })?;
        self.string.insert(value.to_string(), index);
        Ok(index)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassWriteError> {
        let key = (name.to_string(), descriptor.to_string());
        if let Some(index) = self.name_and_type.get(&key) {
            return Ok(*index);
        }
        let name_index = self.utf8(name)?;
        let descriptor_index = self.utf8(descriptor)?;
        let index = self.push(CpInfo::NameAndType {
            name_index,
            descriptor_index,
        })?;
        self.name_and_type.insert(key, index);
        Ok(index)
    }

    fn field_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassWriteError> {
        let key = (owner.to_string(), name.to_string(), descriptor.to_string());
        if let Some(index) = self.field_ref.get(&key) {
            return Ok(*index);
        }
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        let index = self.push(CpInfo::Fieldref {
            class_index,
            name_and_type_index,
        })?;
        self.field_ref.insert(key, index);
        Ok(index)
    }

    fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<u16, ClassWriteError> {
        let key = (
            owner.to_string(),
            name.to_string(),
            descriptor.to_string(),
            is_interface,
        );
        if let Some(index) = self.method_ref.get(&key) {
            return Ok(*index);
        }
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        let entry = if is_interface {
            CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            }
        } else {
            CpInfo::Methodref {
                class_index,
                name_and_type_index,
            }
        };
        let index = self.push(entry)?;
        self.method_ref.insert(key, index);
        Ok(index)
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<(), ClassWriteError> {
        write_u2(out, self.cp.len() as u16);
        for entry in self.cp.iter().skip(1) {
            match entry {
                CpInfo::Unusable => {}
                CpInfo::Utf8(value) => {
                    let encoded = encode_modified_utf8(value);
                    write_u1(out, 1);
                    write_u2(out, encoded.len() as u16);
                    out.extend_from_slice(&encoded);
                }
                CpInfo::Integer(value) => {
                    write_u1(out, 3);
                    write_u4(out, *value as u32);
                }
                CpInfo::Float(value) => {
                    write_u1(out, 4);
                    write_u4(out, value.to_bits());
                }
                CpInfo::Long(value) => {
                    write_u1(out, 5);
                    write_u8(out, *value as u64);
                }
                CpInfo::Double(value) => {
                    write_u1(out, 6);
                    write_u8(out, value.to_bits());
                }
                CpInfo::Class { name_index } => {
                    write_u1(out, 7);
                    write_u2(out, *name_index);
                }
                CpInfo::String { string_index } => {
                    write_u1(out, 8);
                    write_u2(out, *string_index);
                }
                CpInfo::Fieldref {
                    class_index,
                    name_and_type_index,
                } => {
                    write_u1(out, 9);
                    write_u2(out, *class_index);
                    write_u2(out, *name_and_type_index);
                }
                CpInfo::Methodref {
                    class_index,
                    name_and_type_index,
                } => {
                    write_u1(out, 10);
                    write_u2(out, *class_index);
                    write_u2(out, *name_and_type_index);
                }
                CpInfo::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    write_u1(out, 11);
                    write_u2(out, *class_index);
                    write_u2(out, *name_and_type_index);
                }
                CpInfo::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    write_u1(out, 12);
                    write_u2(out, *name_index);
                    write_u2(out, *descriptor_index);
                }
                CpInfo::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    write_u1(out, 15);
                    write_u1(out, *reference_kind);
                    write_u2(out, *reference_index);
                }
                CpInfo::MethodType { descriptor_index } => {
                    write_u1(out, 16);
                    write_u2(out, *descriptor_index);
                }
                CpInfo::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    write_u1(out, 17);
                    write_u2(out, *bootstrap_method_attr_index);
                    write_u2(out, *name_and_type_index);
                }
                CpInfo::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    write_u1(out, 18);
                    write_u2(out, *bootstrap_method_attr_index);
                    write_u2(out, *name_and_type_index);
                }
                CpInfo::Module { name_index } => {
                    write_u1(out, 19);
                    write_u2(out, *name_index);
                }
                CpInfo::Package { name_index } => {
                    write_u1(out, 20);
                    write_u2(out, *name_index);
                }
            }
        }
        Ok(())
    }
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn write_u1(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

fn write_u2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u4(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u8(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i2(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i4(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

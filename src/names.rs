//! Conversions between the three spellings of a class name — dotted binary
//! name (`pkg.Outer$Inner`), internal name (`pkg/Outer$Inner`) and type
//! descriptor (`Lpkg/Outer$Inner;`) — plus method-descriptor parsing.
//!
//! Dotted names face outward (loader, agent configuration); internal names
//! are used everywhere inside the engine.

use crate::insn::FrameValue;
use crate::opcodes;

/// Names under this prefix belong to the VM itself: never instrumented,
/// never defined by a user-level domain, always resolved ambiently.
pub const SYSTEM_PREFIX: &str = "java.";

pub fn to_internal(binary_name: &str) -> String {
    binary_name.replace('.', "/")
}

pub fn to_binary(internal_name: &str) -> String {
    internal_name.replace('/', ".")
}

/// Resource path of a class, e.g. `pkg.Outer$Inner` → `pkg/Outer$Inner.class`.
pub fn to_path(binary_name: &str) -> String {
    format!("{}.class", to_internal(binary_name))
}

pub fn object_descriptor(internal_name: &str) -> String {
    format!("L{internal_name};")
}

/// Internal name of an `L…;` descriptor. Non-object descriptors are returned
/// unchanged (array descriptors are their own internal name).
pub fn descriptor_to_internal(descriptor: &str) -> &str {
    descriptor
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .unwrap_or(descriptor)
}

/// Unqualified name: the segment after the last `/`, `.` or `$`.
pub fn simple_name(name: &str) -> &str {
    let start = name
        .rfind(['/', '.', '$'])
        .map(|index| index + 1)
        .unwrap_or(0);
    &name[start..]
}

pub fn downcase_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Outer-class portion of a `$`-nested binary name, if any.
pub fn outer_name(binary_name: &str) -> Option<&str> {
    binary_name
        .rfind('$')
        .map(|index| &binary_name[..index])
        .filter(|outer| !outer.is_empty())
}

/// Argument and return descriptors of a parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub args: Vec<String>,
    pub ret: String,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Option<MethodDescriptor> {
        let inner = descriptor.strip_prefix('(')?;
        let close = inner.find(')')?;
        let (arg_part, ret) = (&inner[..close], &inner[close + 1..]);
        if ret.is_empty() {
            return None;
        }
        let mut args = Vec::new();
        let bytes = arg_part.as_bytes();
        let mut pos = 0;
        while pos < bytes.len() {
            let start = pos;
            while bytes[pos] == b'[' {
                pos += 1;
                if pos >= bytes.len() {
                    return None;
                }
            }
            match bytes[pos] {
                b'L' => {
                    let end = arg_part[pos..].find(';')?;
                    pos += end + 1;
                }
                b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => pos += 1,
                _ => return None,
            }
            args.push(arg_part[start..pos].to_string());
        }
        Some(MethodDescriptor {
            args,
            ret: ret.to_string(),
        })
    }

    /// Total argument width in local-variable slots.
    pub fn arg_slots(&self) -> u16 {
        self.args.iter().map(|arg| slot_size(arg)).sum()
    }
}

/// Local-variable slots taken by a value of the given descriptor.
pub fn slot_size(descriptor: &str) -> u16 {
    match descriptor {
        "J" | "D" => 2,
        _ => 1,
    }
}

/// Variable-load opcode for a value of the given descriptor.
pub fn load_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes()[0] {
        b'J' => opcodes::LLOAD,
        b'F' => opcodes::FLOAD,
        b'D' => opcodes::DLOAD,
        b'L' | b'[' => opcodes::ALOAD,
        _ => opcodes::ILOAD,
    }
}

/// Return opcode for the given return descriptor (`V` returns void).
pub fn return_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes()[0] {
        b'V' => opcodes::RETURN,
        b'J' => opcodes::LRETURN,
        b'F' => opcodes::FRETURN,
        b'D' => opcodes::DRETURN,
        b'L' | b'[' => opcodes::ARETURN,
        _ => opcodes::IRETURN,
    }
}

/// Stack-map verification value of a parameter with the given descriptor.
pub fn frame_value(descriptor: &str) -> FrameValue {
    match descriptor.as_bytes()[0] {
        b'J' => FrameValue::Long,
        b'F' => FrameValue::Float,
        b'D' => FrameValue::Double,
        b'[' => FrameValue::Object(descriptor.to_string()),
        b'L' => FrameValue::Object(descriptor_to_internal(descriptor).to_string()),
        _ => FrameValue::Integer,
    }
}

/// Canonical key of an intercepted method: the declared name plus the
/// descriptor with its first argument (the handler itself) removed,
/// e.g. `charToInt(C)I`.
pub fn signature_without_first_arg(name: &str, descriptor: &str) -> Option<String> {
    let parsed = MethodDescriptor::parse(descriptor)?;
    if parsed.args.is_empty() {
        return None;
    }
    let rest: String = parsed.args[1..].concat();
    Some(format!("{}({}){}", name, rest, parsed.ret))
}

/// Prepend a type to a method descriptor's argument list.
pub fn prepend_arg(prefix_descriptor: &str, method_descriptor: &str) -> String {
    format!("({}{}", prefix_descriptor, &method_descriptor[1..])
}

/// Append `_` to `desired` until it collides with none of `taken`.
pub fn unused_name(desired: &str, taken: &[&str]) -> String {
    let mut result = desired.to_string();
    while taken.contains(&result.as_str()) {
        result.push('_');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_spellings() {
        assert_eq!(to_internal("pkg.Outer$Inner"), "pkg/Outer$Inner");
        assert_eq!(to_binary("pkg/Outer$Inner"), "pkg.Outer$Inner");
        assert_eq!(to_path("pkg.A"), "pkg/A.class");
        assert_eq!(object_descriptor("pkg/A"), "Lpkg/A;");
        assert_eq!(descriptor_to_internal("Lpkg/A;"), "pkg/A");
        assert_eq!(descriptor_to_internal("[Lpkg/A;"), "[Lpkg/A;");
    }

    #[test]
    fn simple_names() {
        assert_eq!(simple_name("pkg/Outer$Inner"), "Inner");
        assert_eq!(simple_name("pkg.Handler"), "Handler");
        assert_eq!(simple_name("Handler"), "Handler");
        assert_eq!(downcase_first("Handler"), "handler");
        assert_eq!(outer_name("pkg.Outer$Inner"), Some("pkg.Outer"));
        assert_eq!(outer_name("pkg.Plain"), None);
    }

    #[test]
    fn descriptor_parsing() {
        let parsed = MethodDescriptor::parse("(Lpkg/H;CJ[I)I").unwrap();
        assert_eq!(parsed.args, vec!["Lpkg/H;", "C", "J", "[I"]);
        assert_eq!(parsed.ret, "I");
        assert_eq!(parsed.arg_slots(), 5);
        assert!(MethodDescriptor::parse("()").is_none());
        assert!(MethodDescriptor::parse("(Q)V").is_none());
    }

    #[test]
    fn signature_key_drops_the_handler_argument() {
        assert_eq!(
            signature_without_first_arg("charToInt", "(Lpkg/H;C)I").as_deref(),
            Some("charToInt(C)I")
        );
        assert_eq!(
            signature_without_first_arg("call", "(Lpkg/H;)I").as_deref(),
            Some("call()I")
        );
        assert!(signature_without_first_arg("call", "()I").is_none());
    }

    #[test]
    fn typed_opcodes() {
        assert_eq!(load_opcode("J"), opcodes::LLOAD);
        assert_eq!(load_opcode("Lx/Y;"), opcodes::ALOAD);
        assert_eq!(load_opcode("[B"), opcodes::ALOAD);
        assert_eq!(return_opcode("V"), opcodes::RETURN);
        assert_eq!(return_opcode("D"), opcodes::DRETURN);
        assert_eq!(return_opcode("S"), opcodes::IRETURN);
    }

    #[test]
    fn collision_free_names() {
        assert_eq!(unused_name("handler", &["other"]), "handler");
        assert_eq!(unused_name("handler", &["handler", "handler_"]), "handler__");
    }
}

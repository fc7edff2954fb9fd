/// Constructs an [`InsnList`](crate::insn::InsnList) using a declarative,
/// Smali-like syntax.
///
/// Instructions are bracketed groups. The general format is
/// `[prefix OPCODE operands]`; opcodes name constants from
/// [`opcodes`](crate::opcodes).
///
/// Supported forms:
///
/// * **Simple:** `[RETURN]`, `[NOP]`
/// * **Int:** `[int BIPUSH 10]`
/// * **Var:** `[var ALOAD 0]`
/// * **Type:** `[type NEW "pkg/Name"]`
/// * **Field:** `[field GETFIELD "owner", "name", "descriptor"]`
/// * **Method:** `[method INVOKEVIRTUAL "owner", "name", "descriptor"]`
/// * **Interface call:** `[interface "owner", "name", "descriptor"]`
/// * **Ldc:** `[ldc "string constant"]`
/// * **Iinc:** `[iinc 1, 5]`
/// * **Label:** `[label end]` where `end` is a `LabelNode` expression
/// * **Jump:** `[jump IFNONNULL end]`
/// * **Frame:** `[frame f]` where `f` is a `FrameNode` expression
///
/// # Example
///
/// ```rust
/// use classweave::insn_list;
/// use classweave::insn::{BodyNode, Insn, LabelNode};
/// use classweave::opcodes;
///
/// let next = LabelNode { id: 0 };
/// let list = insn_list! {
///     [var ALOAD 1]
///     [jump IFNONNULL next]
///     [var ALOAD 0]
///     [var ASTORE 1]
///     [label next]
///     [RETURN]
/// };
/// let nodes = list.into_nodes();
/// assert_eq!(nodes.len(), 6);
/// assert!(matches!(
///     nodes[1],
///     BodyNode::Insn(Insn::Jump { opcode: opcodes::IFNONNULL, .. })
/// ));
/// assert!(matches!(nodes[4], BodyNode::Label(LabelNode { id: 0 })));
/// ```
#[macro_export]
macro_rules! insn_list {
    // Entry point: parse all bracketed groups flatly (O(1) recursion depth).
    ( $( [ $($instruction:tt)+ ] )* ) => {
        {
            let mut list = $crate::insn::InsnList::new();
            $(
                insn_list!(@dispatch list, $($instruction)+);
            )*
            list
        }
    };

    (@dispatch $list:ident, label $label:expr) => {
        $list.add($crate::insn::BodyNode::Label($label));
    };

    (@dispatch $list:ident, frame $frame:expr) => {
        $list.add($crate::insn::BodyNode::Frame($frame));
    };

    (@dispatch $list:ident, int $opcode:ident $operand:expr) => {
        $list.add($crate::insn::Insn::Int {
            opcode: $crate::opcodes::$opcode,
            operand: $operand as i32,
        });
    };

    (@dispatch $list:ident, var $opcode:ident $index:expr) => {
        $list.add($crate::insn::Insn::Var {
            opcode: $crate::opcodes::$opcode,
            var_index: $index as u16,
        });
    };

    (@dispatch $list:ident, type $opcode:ident $name:expr) => {
        $list.add($crate::insn::Insn::Type {
            opcode: $crate::opcodes::$opcode,
            type_name: $name.to_string(),
        });
    };

    (@dispatch $list:ident, field $opcode:ident $owner:expr, $name:expr, $desc:expr) => {
        $list.add($crate::insn::Insn::Field {
            opcode: $crate::opcodes::$opcode,
            owner: $owner.to_string(),
            name: $name.to_string(),
            descriptor: $desc.to_string(),
        });
    };

    (@dispatch $list:ident, method $opcode:ident $owner:expr, $name:expr, $desc:expr) => {
        $list.add($crate::insn::Insn::Method {
            opcode: $crate::opcodes::$opcode,
            owner: $owner.to_string(),
            name: $name.to_string(),
            descriptor: $desc.to_string(),
            is_interface: false,
        });
    };

    (@dispatch $list:ident, interface $owner:expr, $name:expr, $desc:expr) => {
        $list.add($crate::insn::Insn::Method {
            opcode: $crate::opcodes::INVOKEINTERFACE,
            owner: $owner.to_string(),
            name: $name.to_string(),
            descriptor: $desc.to_string(),
            is_interface: true,
        });
    };

    (@dispatch $list:ident, ldc $value:expr) => {
        $list.add($crate::insn::Insn::Ldc {
            opcode: $crate::opcodes::LDC,
            value: $crate::insn::ConstValue::String($value.to_string()),
        });
    };

    (@dispatch $list:ident, jump $opcode:ident $target:expr) => {
        $list.add($crate::insn::Insn::Jump {
            opcode: $crate::opcodes::$opcode,
            target: $target,
        });
    };

    (@dispatch $list:ident, iinc $var:expr, $incr:expr) => {
        $list.add($crate::insn::Insn::Iinc {
            var_index: $var as u16,
            increment: $incr as i16,
        });
    };

    // Simple (no operands) comes last so prefixed forms match first.
    (@dispatch $list:ident, $opcode:ident) => {
        $list.add($crate::insn::Insn::Simple($crate::opcodes::$opcode));
    };
}

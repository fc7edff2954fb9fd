//! End-to-end round trips: build fixture classes, push them through bytes,
//! rewrite them, and decode the result again.

use pretty_assertions::assert_eq;

use classweave::agent::Agent;
use classweave::builder::{ClassBuilder, MethodBuilder};
use classweave::class_reader::ClassReader;
use classweave::class_writer::ClassWriter;
use classweave::insn::{BodyNode, FrameNode, FrameValue, Insn, LabelNode};
use classweave::insn_list;
use classweave::instrument::HandlerInstrumentation;
use classweave::loader::{Loader, MapHost, MapResources};
use classweave::names;
use classweave::nodes::{AttributeInfo, ClassNode, CpInfo};
use classweave::opcodes::{
    self, ACC_ABSTRACT, ACC_INTERFACE, ACC_PRIVATE, ACC_PUBLIC, ACC_SYNTHETIC, ACC_TRANSIENT,
    ACC_VOLATILE,
};
use classweave::spec::{HandlerSpec, NullGuard};

fn char_handler() -> ClassNode {
    ClassBuilder::new("pkg/CharToIntHandler", "java/lang/Object")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .method(
            MethodBuilder::new(
                ACC_PUBLIC | ACC_ABSTRACT,
                "charToInt",
                "(Lpkg/CharToIntHandler;C)I",
            )
            .build(),
        )
        .method(
            MethodBuilder::new(
                ACC_PUBLIC | ACC_ABSTRACT,
                "setCharToIntHandler",
                "(Lpkg/CharToIntHandler;)V",
            )
            .build(),
        )
        .method(
            MethodBuilder::new(
                ACC_PUBLIC | ACC_ABSTRACT,
                "getCharToIntHandler",
                "()Lpkg/CharToIntHandler;",
            )
            .build(),
        )
        .build()
}

fn caster() -> ClassNode {
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
    let char_to_int = MethodBuilder::new(ACC_PUBLIC, "charToInt", "(C)I")
        .body(
            1,
            2,
            insn_list! {
                [var ILOAD 1]
                [IRETURN]
            },
        )
        .build();
    ClassBuilder::new("pkg/Caster", "java/lang/Object")
        .method(constructor)
        .method(char_to_int)
        .build()
}

fn analyze(handler: &ClassNode) -> HandlerSpec {
    HandlerSpec::analyze(handler, NullGuard::CheckBeforeCall, None, None).unwrap()
}

#[test]
fn weaves_the_call_counting_shape_through_bytes() {
    // Through the codec both ways, exactly as the agent would see it.
    let handler_bytes = ClassWriter::to_bytes(&char_handler()).unwrap();
    let handler = ClassReader::new(&handler_bytes).to_codeless_node().unwrap();
    let caster_bytes = ClassWriter::to_bytes(&caster()).unwrap();
    let caster = ClassReader::new(&caster_bytes).to_class_node().unwrap();

    let instrumentation = HandlerInstrumentation::new(analyze(&handler));
    let woven = instrumentation.instrument(caster).unwrap();
    let woven_bytes = ClassWriter::to_bytes(&woven).unwrap();
    let woven = ClassReader::new(&woven_bytes).to_class_node().unwrap();

    // Castability: the interface is listed exactly once.
    assert_eq!(
        woven
            .interfaces
            .iter()
            .filter(|name| *name == "pkg/CharToIntHandler")
            .count(),
        1
    );

    // Exactly one handler slot, with the mandated flags.
    let slots: Vec<_> = woven
        .fields
        .iter()
        .filter(|field| field.descriptor == "Lpkg/CharToIntHandler;")
        .collect();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].name, "CharToIntHandler");
    assert_eq!(
        slots[0].access_flags,
        ACC_PUBLIC | ACC_TRANSIENT | ACC_VOLATILE | ACC_SYNTHETIC
    );

    // The re-signatured body still loads the (shifted) char argument.
    let body_method = woven
        .method("charToInt", "(Lpkg/CharToIntHandler;C)I")
        .expect("re-signatured original");
    let body = body_method.body.as_ref().unwrap();
    assert!(body.insns().any(|insn| matches!(
        insn,
        Insn::Var {
            opcode: opcodes::ILOAD,
            var_index: 2
        }
    )));
    assert!(body.max_locals >= 3);

    // The dispatch loads the slot, null-checks it, and forwards (this, c).
    let dispatch = woven.method("charToInt", "(C)I").expect("dispatch");
    let body = dispatch.body.as_ref().unwrap();
    let insns: Vec<&Insn> = body.insns().collect();
    assert!(matches!(
        insns[0],
        Insn::Var {
            opcode: opcodes::ALOAD,
            var_index: 0
        }
    ));
    assert!(matches!(
        insns[1],
        Insn::Field {
            opcode: opcodes::GETFIELD,
            name,
            ..
        } if name == "CharToIntHandler"
    ));
    assert!(insns
        .iter()
        .any(|insn| matches!(insn, Insn::Jump { opcode: opcodes::IFNONNULL, .. })));
    assert!(insns.iter().any(|insn| matches!(
        insn,
        Insn::Method {
            opcode: opcodes::INVOKEINTERFACE,
            owner,
            name,
            descriptor,
            is_interface: true,
        } if owner == "pkg/CharToIntHandler"
            && name == "charToInt"
            && descriptor == "(Lpkg/CharToIntHandler;C)I"
    )));
    assert!(matches!(insns.last(), Some(Insn::Simple(op)) if *op == opcodes::IRETURN));

    // Every slot reference stays inside max_locals, and the join frame lists
    // the receiver first and the handler last.
    for insn in body.insns() {
        if let Insn::Var { var_index, .. } = insn {
            assert!(*var_index < body.max_locals);
        }
    }
    let frame = body
        .nodes
        .iter()
        .find_map(|node| match node {
            BodyNode::Frame(FrameNode::Full { locals, .. }) => Some(locals),
            _ => None,
        })
        .expect("join frame");
    assert_eq!(frame[0], FrameValue::Object("pkg/Caster".to_string()));
    assert_eq!(frame[1], FrameValue::Integer);
    assert_eq!(
        frame[2],
        FrameValue::Object("pkg/CharToIntHandler".to_string())
    );

    // Accessor and mutator were synthesized.
    assert!(woven
        .method("getCharToIntHandler", "()Lpkg/CharToIntHandler;")
        .is_some());
    let setter = woven
        .method("setCharToIntHandler", "(Lpkg/CharToIntHandler;)V")
        .expect("mutator");
    let setter_body = setter.body.as_ref().unwrap();
    assert!(setter_body
        .insns()
        .any(|insn| matches!(insn, Insn::Jump { opcode: opcodes::IFNONNULL, .. })));
}

#[test]
fn dispatch_keeps_the_declared_throws_clause() {
    let handler = ClassBuilder::new("pkg/Failing", "java/lang/Object")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .method(MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "run", "(Lpkg/Failing;)V").build())
        .build();
    let handlee = ClassBuilder::new("pkg/Risky", "java/lang/Object")
        .method(
            MethodBuilder::new(ACC_PUBLIC, "run", "()V")
                .exception("java/io/IOException")
                .signature("()V")
                .body(1, 1, insn_list! { [RETURN] })
                .build(),
        )
        .build();
    let woven = HandlerInstrumentation::new(analyze(&handler))
        .instrument(handlee)
        .unwrap();
    let bytes = ClassWriter::to_bytes(&woven).unwrap();
    let woven = ClassReader::new(&bytes).to_class_node().unwrap();

    let dispatch = woven.method("run", "()V").unwrap();
    assert_eq!(dispatch.exceptions, vec!["java/io/IOException".to_string()]);
    assert_eq!(dispatch.signature.as_deref(), Some("()V"));
    let renamed = woven.method("run", "(Lpkg/Failing;)V").unwrap();
    assert_eq!(renamed.exceptions, vec!["java/io/IOException".to_string()]);
}

#[test]
fn super_constructor_scenario_keeps_the_constructor_untouched() {
    // Parent's constructor calls an intercepted method; under CheckBeforeCall
    // the child's constructor must not be patched at all — the dispatch
    // wrapper short-circuits to `this` while the slot is still null.
    let handler = ClassBuilder::new("pkg/Callable", "java/lang/Object")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .method(MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "call", "(Lpkg/Callable;)I").build())
        .method(
            MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "setCallable", "(Lpkg/Callable;)V")
                .build(),
        )
        .build();
    let child = ClassBuilder::new("pkg/Child", "pkg/Parent")
        .method(
            MethodBuilder::new(ACC_PUBLIC, "<init>", "()V")
                .body(
                    1,
                    1,
                    insn_list! {
                        [var ALOAD 0]
                        [method INVOKESPECIAL "pkg/Parent", "<init>", "()V"]
                        [RETURN]
                    },
                )
                .build(),
        )
        .method(
            MethodBuilder::new(ACC_PUBLIC, "call", "()I")
                .body(1, 1, insn_list! { [int BIPUSH -8] [IRETURN] })
                .build(),
        )
        .build();

    let woven = HandlerInstrumentation::new(analyze(&handler))
        .instrument(child)
        .unwrap();

    let constructor = woven.method("<init>", "()V").unwrap();
    let body = constructor.body.as_ref().unwrap();
    assert_eq!(body.insns().count(), 3);
    assert_eq!(body.max_stack, 1);

    // No spawner configured: the null branch falls back to `this` alone.
    let dispatch = woven.method("call", "()I").unwrap();
    let insns: Vec<&Insn> = dispatch.body.as_ref().unwrap().insns().collect();
    assert!(!insns
        .iter()
        .any(|insn| matches!(insn, Insn::Method { opcode: opcodes::INVOKESTATIC, .. })));
}

/// Append a Utf8 entry to a tree's pool, returning its index.
fn push_utf8(node: &mut ClassNode, value: &str) -> u16 {
    node.constant_pool.push(CpInfo::Utf8(value.to_string()));
    (node.constant_pool.len() - 1) as u16
}

fn u2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Hand-build a `RuntimeInvisibleAnnotations` attribute carrying
/// `@Instruments({pkg.Spawned})` and `@SpawnsWith("pkg.Spawners.spawn")`.
fn annotate_handler(mut node: ClassNode) -> ClassNode {
    let instruments_type = push_utf8(&mut node, "Lpkg/Instruments;");
    let spawns_type = push_utf8(&mut node, "Lpkg/SpawnsWith;");
    let value_name = push_utf8(&mut node, "value");
    let target_descriptor = push_utf8(&mut node, "Lpkg/Spawned;");
    let spawner_text = push_utf8(&mut node, "pkg.Spawners.spawn");

    let mut info = Vec::new();
    u2(&mut info, 2); // two annotations
    u2(&mut info, instruments_type);
    u2(&mut info, 1); // one element-value pair
    u2(&mut info, value_name);
    info.push(b'[');
    u2(&mut info, 1);
    info.push(b'c');
    u2(&mut info, target_descriptor);
    u2(&mut info, spawns_type);
    u2(&mut info, 1);
    u2(&mut info, value_name);
    info.push(b's');
    u2(&mut info, spawner_text);

    node.attributes.push(AttributeInfo::Unknown {
        name: "RuntimeInvisibleAnnotations".to_string(),
        info,
    });
    node
}

fn spawned_handlee() -> ClassNode {
    ClassBuilder::new("pkg/Spawned", "java/lang/Object")
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
            MethodBuilder::new(ACC_PRIVATE, "call", "()I")
                .body(1, 1, insn_list! { [ICONST_1] [IRETURN] })
                .build(),
        )
        .build()
}

#[test]
fn annotations_declare_handlees_and_spawner() {
    let handler = annotate_handler(
        ClassBuilder::new("pkg/Callable", "java/lang/Object")
            .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .method(
                MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "call", "(Lpkg/Callable;)I")
                    .build(),
            )
            .build(),
    );
    let handler_bytes = ClassWriter::to_bytes(&handler).unwrap();

    // The annotation survives the codec and the analyzer picks both values
    // up from the decoded skeleton.
    let decoded = ClassReader::new(&handler_bytes).to_codeless_node().unwrap();
    let spec = HandlerSpec::analyze(&decoded, NullGuard::CheckBeforeCall, None, None).unwrap();
    assert_eq!(spec.instruments, vec!["pkg.Spawned".to_string()]);
    let spawner = spec.spawner.as_ref().expect("annotated spawner");
    assert_eq!(spawner.owner, "pkg/Spawners");
    assert_eq!(spawner.method, "spawn");
    assert_eq!(spawner.descriptor, "(Lpkg/Callable;)Lpkg/Callable;");

    // The agent needs no explicit handlee list: the annotation supplies it,
    // and the dispatch body spawns the default handler.
    let mut resources = MapResources::new();
    resources.insert("pkg.Callable", handler_bytes);
    let agent = Agent::new("pkg.Callable", Box::new(resources)).unwrap();

    let original = ClassWriter::to_bytes(&spawned_handlee()).unwrap();
    let rewritten = agent.transform("pkg/Spawned", &original).unwrap();
    let tree = ClassReader::new(&rewritten).to_class_node().unwrap();
    let dispatch = tree.method("call", "()I").expect("dispatch");
    assert!(dispatch.body.as_ref().unwrap().insns().any(|insn| matches!(
        insn,
        Insn::Method {
            opcode: opcodes::INVOKESTATIC,
            owner,
            name,
            ..
        } if owner == "pkg/Spawners" && name == "spawn"
    )));
}

#[test]
fn loader_defines_the_handler_interface_before_its_handlee() {
    let handler = ClassBuilder::new("pkg/Callable", "java/lang/Object")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .method(MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "call", "(Lpkg/Callable;)I").build())
        .build();
    let handler_bytes = ClassWriter::to_bytes(&handler).unwrap();
    let mut resources = MapResources::new();
    resources.insert("pkg.Callable", handler_bytes.clone());
    resources.insert(
        "pkg.Spawned",
        ClassWriter::to_bytes(&spawned_handlee()).unwrap(),
    );

    let mut loader = Loader::new(Box::new(resources));
    loader
        .instrument_for(
            "pkg.Callable",
            NullGuard::CheckBeforeCall,
            None,
            &["pkg.Spawned".to_string()],
        )
        .unwrap();
    assert!(loader.is_declared("pkg.Spawned"));
    // Retaining the interface itself puts the handlee→interface edge between
    // two declared classes, so the interface is defined first.
    loader.declare("pkg.Callable", handler_bytes).unwrap();

    let mut host = MapHost::new();
    loader.load_into(&mut host, &[]).unwrap();
    assert_eq!(host.define_order(), ["pkg.Callable", "pkg.Spawned"]);

    // The defined handlee is the rewritten form, not the ambient bytes.
    let defined = ClassReader::new(host.bytes("pkg.Spawned").unwrap())
        .to_class_node()
        .unwrap();
    assert_eq!(defined.interfaces, vec!["pkg/Callable".to_string()]);
}

#[test]
fn codec_round_trip_is_byte_stable() {
    let low = LabelNode { id: 0 };
    let high = LabelNode { id: 1 };
    let done = LabelNode { id: 2 };
    let mut list = insn_list! {
        [var ILOAD 1]
    };
    list.add(Insn::TableSwitch {
        default: done,
        low: 0,
        high: 1,
        targets: vec![low, high],
    });
    let tail = insn_list! {
        [label low]
        [frame FrameNode::Same]
        [ICONST_0]
        [IRETURN]
        [label high]
        [frame FrameNode::Same]
        [ICONST_1]
        [IRETURN]
        [label done]
        [frame FrameNode::Same]
        [int BIPUSH 7]
        [IRETURN]
    };
    for node in tail.into_nodes() {
        list.add(node);
    }
    let class = ClassBuilder::new("pkg/Switchy", "java/lang/Object")
        .method(
            MethodBuilder::new(ACC_PUBLIC, "pick", "(I)I")
                .body(1, 2, list)
                .build(),
        )
        .build();

    let first = ClassWriter::to_bytes(&class).unwrap();
    let decoded = ClassReader::new(&first).to_class_node().unwrap();
    let second = ClassWriter::to_bytes(&decoded).unwrap();
    assert_eq!(first, second);

    let again = ClassReader::new(&second).to_class_node().unwrap();
    assert_eq!(decoded, again);
}

#[test]
fn rewritten_classes_survive_a_second_decode() {
    let woven = HandlerInstrumentation::new(analyze(&char_handler()))
        .instrument(caster())
        .unwrap();
    let bytes = ClassWriter::to_bytes(&woven).unwrap();
    let decoded = ClassReader::new(&bytes).to_class_node().unwrap();
    let bytes_again = ClassWriter::to_bytes(&decoded).unwrap();
    let decoded_again = ClassReader::new(&bytes_again).to_class_node().unwrap();
    assert_eq!(
        decoded.methods.len(),
        decoded_again.methods.len(),
    );
    assert_eq!(bytes, bytes_again);
}

#[test]
fn binary_names_face_outward_internal_names_stay_inside() {
    let woven = HandlerInstrumentation::new(analyze(&char_handler()))
        .instrument(caster())
        .unwrap();
    assert_eq!(names::to_binary(&woven.name), "pkg.Caster");
    assert!(woven.interfaces.iter().all(|name| !name.contains('.')));
}

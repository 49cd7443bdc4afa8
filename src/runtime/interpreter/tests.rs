use super::*;
use crate::{
    Completion, MapProvider, VmConfig,
    class::{
        ClassFile,
        builder::{Assembler, ClassFileBuilder},
    },
    consts::{FieldAccessFlag as F, MethodAccessFlag as M, RefKind},
};

fn machine(config: VmConfig, classes: Vec<ClassFile>) -> Machine {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    let provider = classes
        .into_iter()
        .fold(MapProvider::new(), |provider, class| provider.with(class));
    Machine::new(config, provider).unwrap()
}

fn returned(completion: Completion) -> Option<NativeVariable> {
    match completion {
        Completion::Returned(value) => value,
        Completion::Threw(_) => panic!("expected a normal return, got {completion:?}"),
    }
}

fn threw(vm: &Machine, completion: Completion) -> String {
    match completion {
        Completion::Threw(throwable) => vm.describe_throwable(throwable),
        Completion::Returned(_) => panic!("expected a throwable, got {completion:?}"),
    }
}

fn sum_class() -> ClassFile {
    let mut builder = ClassFileBuilder::new("t/Sum");
    // sum(n) = 1 + 2 + ... + n
    let mut asm = Assembler::new(3);
    let top = asm.new_label();
    let done = asm.new_label();
    asm.op(inst::ICONST_0)
        .op(inst::ISTORE_1)
        .op(inst::ICONST_1)
        .op(inst::ISTORE_2)
        .bind(top)
        .op(inst::ILOAD_2)
        .op(inst::ILOAD_0)
        .branch(inst::IF_ICMPGT, done)
        .op(inst::ILOAD_1)
        .op(inst::ILOAD_2)
        .op(inst::IADD)
        .op(inst::ISTORE_1)
        .iinc(2, 1)
        .branch(inst::GOTO, top)
        .bind(done)
        .op(inst::ILOAD_1)
        .op(inst::IRETURN);
    builder.method(M::PUBLIC | M::STATIC, "sum", "(I)I", asm.finish().unwrap());
    builder.build()
}

#[test]
fn test_loop_with_branches() {
    let mut vm = machine(VmConfig::default(), vec![sum_class()]);
    let result = vm
        .invoke_static("t/Sum", "sum", "(I)I", vec![NativeVariable::Int(100)])
        .unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(5050)));
    let result = vm
        .invoke_static("t/Sum", "sum", "(I)I", vec![NativeVariable::Int(0)])
        .unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(0)));
}

// fills data[i] = i * i, then acc += data[i] + 1 for every i
fn calc_class() -> ClassFile {
    let mut builder = ClassFileBuilder::new("t/Calc");
    builder
        .field(F::STATIC, "data", "[I")
        .field(F::STATIC, "acc", "J");
    let data = builder.field_ref("t/Calc", "data", "[I");
    let acc = builder.field_ref("t/Calc", "acc", "J");

    let mut asm = Assembler::new(2);
    let fill = asm.new_label();
    let summing = asm.new_label();
    let sum = asm.new_label();
    let end = asm.new_label();
    asm.op(inst::ILOAD_0)
        .newarray(crate::consts::T_INT)
        .op_u16(inst::PUTSTATIC, data)
        .op(inst::ICONST_0)
        .op(inst::ISTORE_1)
        .bind(fill)
        .op(inst::ILOAD_1)
        .op(inst::ILOAD_0)
        .branch(inst::IF_ICMPGE, summing)
        .op_u16(inst::GETSTATIC, data)
        .op(inst::ILOAD_1)
        .op(inst::ILOAD_1)
        .op(inst::ILOAD_1)
        .op(inst::IMUL)
        .op(inst::IASTORE)
        .iinc(1, 1)
        .branch(inst::GOTO, fill)
        .bind(summing)
        .op(inst::ICONST_0)
        .op(inst::ISTORE_1)
        .bind(sum)
        .op(inst::ILOAD_1)
        .op(inst::ILOAD_0)
        .branch(inst::IF_ICMPGE, end)
        .op_u16(inst::GETSTATIC, acc)
        .op_u16(inst::GETSTATIC, data)
        .op(inst::ILOAD_1)
        .op(inst::IALOAD)
        .op(inst::I2L)
        .op(inst::LADD)
        .op(inst::LCONST_1)
        .op(inst::LADD)
        .op_u16(inst::PUTSTATIC, acc)
        .iinc(1, 1)
        .branch(inst::GOTO, sum)
        .bind(end)
        .op_u16(inst::GETSTATIC, acc)
        .op(inst::LRETURN);
    builder.method(M::PUBLIC | M::STATIC, "compute", "(I)J", asm.finish().unwrap());
    builder.build()
}

#[test]
fn test_quickening_and_fusion_agree_with_plain_dispatch() {
    let configs = [
        VmConfig {
            quickening: false,
            trace_fusion: false,
            ..VmConfig::default()
        },
        VmConfig {
            trace_fusion: false,
            ..VmConfig::default()
        },
        VmConfig {
            warmup_budget: 0,
            ..VmConfig::default()
        },
    ];
    for config in configs {
        let fusion = config.trace_fusion;
        let mut vm = machine(config, vec![calc_class()]);
        let result = vm
            .invoke_static("t/Calc", "compute", "(I)J", vec![NativeVariable::Int(50)])
            .unwrap();
        // sum of i * i for i < 50 is 40425
        assert_eq!(returned(result), Some(NativeVariable::Long(40_475)));

        let class = vm.loaders[LoaderId::BOOTSTRAP.0].cached("t/Calc").unwrap();
        let method = class.find_method("compute", "(I)J").unwrap();
        let compiled = method
            .code()
            .traces
            .iter()
            .any(|slot| matches!(slot.get(), Some(TraceSlot::Compiled(_))));
        assert_eq!(compiled, fusion);
    }
}

// floating point loops whose bodies mix dup, swap, pop2, wide stores and long field writes
fn floating_class() -> ClassFile {
    let mut builder = ClassFileBuilder::new("t/Fp");
    builder.field(F::PUBLIC, "d", "D").field(F::PUBLIC, "l", "J");
    let object_init = builder.method_ref("java/lang/Object", "<init>", "()V");
    let own_init = builder.method_ref("t/Fp", "<init>", "()V");
    let own = builder.class("t/Fp");
    let d = builder.field_ref("t/Fp", "d", "D");
    let l = builder.field_ref("t/Fp", "l", "J");

    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0)
        .op_u16(inst::INVOKESPECIAL, object_init)
        .op(inst::RETURN);
    builder.method(M::PUBLIC, "<init>", "()V", asm.finish().unwrap());

    // locals: a, i, acc
    let mut asm = Assembler::new(3);
    let top = asm.new_label();
    asm.op(inst::FCONST_0)
        .op(inst::FSTORE_2)
        .op(inst::ICONST_0)
        .op(inst::ISTORE_1)
        .bind(top)
        .op(inst::FLOAD_0)
        .op(inst::FLOAD_0)
        .op(inst::FMUL)
        .op(inst::FLOAD_0)
        .op(inst::SWAP)
        .op(inst::FSUB)
        .op(inst::FLOAD_2)
        .op(inst::FADD)
        .op(inst::FSTORE_2)
        .op(inst::FLOAD_0)
        .op(inst::DUP)
        .op(inst::FDIV)
        .op(inst::POP)
        .op(inst::FLOAD_2)
        .op(inst::FCONST_2)
        .op(inst::FMUL)
        .op(inst::FLOAD_0)
        .op(inst::FREM)
        .op(inst::FSTORE_2)
        .iinc(1, 1)
        .op(inst::ILOAD_1)
        .op(inst::ICONST_3)
        .branch(inst::IF_ICMPLT, top)
        .op(inst::FLOAD_2)
        .op(inst::FRETURN);
    builder.method(M::PUBLIC | M::STATIC, "floats", "(F)F", asm.finish().unwrap());

    // locals: b (2), i, acc (2), tmp (2)
    let mut asm = Assembler::new(7);
    let top = asm.new_label();
    asm.op(inst::DCONST_0)
        .op(inst::DSTORE_3)
        .op(inst::ICONST_0)
        .op(inst::ISTORE_2)
        .bind(top)
        .op(inst::DLOAD_0)
        .op(inst::DLOAD_0)
        .op(inst::DMUL)
        .op(inst::DLOAD_0)
        .op(inst::DSUB)
        .op(inst::DLOAD_3)
        .op(inst::DADD)
        .op(inst::DSTORE_3)
        .op(inst::DLOAD_0)
        .op(inst::DCONST_1)
        .op(inst::DDIV)
        .op(inst::POP2)
        .op(inst::DLOAD_3)
        .op(inst::DLOAD_0)
        .op(inst::DREM)
        .op_u8(inst::DSTORE, 5)
        .op_u8(inst::DLOAD, 5)
        .op(inst::DLOAD_3)
        .op(inst::DADD)
        .op(inst::ILOAD_2)
        .op(inst::I2D)
        .op(inst::DDIV)
        .op(inst::DSTORE_3)
        .iinc(2, 1)
        .op(inst::ILOAD_2)
        .op(inst::ICONST_3)
        .branch(inst::IF_ICMPLT, top)
        .op(inst::DLOAD_3)
        .op(inst::DRETURN);
    builder.method(M::PUBLIC | M::STATIC, "doubles", "(D)D", asm.finish().unwrap());

    // locals: b (2), holder, i
    let mut asm = Assembler::new(4);
    let top = asm.new_label();
    asm.op_u16(inst::NEW, own)
        .op(inst::DUP)
        .op_u16(inst::INVOKESPECIAL, own_init)
        .op(inst::ASTORE_2)
        .op(inst::ICONST_0)
        .op(inst::ISTORE_3)
        .bind(top)
        .op(inst::ALOAD_2)
        .op(inst::DLOAD_0)
        .op(inst::ALOAD_2)
        .op_u16(inst::GETFIELD, d)
        .op(inst::DADD)
        .op_u16(inst::PUTFIELD, d)
        .op(inst::ALOAD_2)
        .op(inst::ALOAD_2)
        .op_u16(inst::GETFIELD, l)
        .op(inst::ILOAD_3)
        .op(inst::I2L)
        .op(inst::LADD)
        .op(inst::LCONST_1)
        .op(inst::LXOR)
        .op_u16(inst::PUTFIELD, l)
        .iinc(3, 1)
        .op(inst::ILOAD_3)
        .op(inst::ICONST_3)
        .branch(inst::IF_ICMPLT, top)
        .op(inst::ALOAD_2)
        .op_u16(inst::GETFIELD, d)
        .op(inst::ALOAD_2)
        .op_u16(inst::GETFIELD, l)
        .op(inst::L2D)
        .op(inst::DADD)
        .op(inst::DRETURN);
    builder.method(M::PUBLIC | M::STATIC, "fields", "(D)D", asm.finish().unwrap());
    builder.build()
}

#[test]
fn test_fused_floating_point_is_bit_identical() {
    let inputs = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.0, 1.5];
    let run = |config: VmConfig| {
        let fusion = config.trace_fusion;
        let mut vm = machine(config, vec![floating_class()]);
        let mut bits = vec![];
        for input in inputs {
            let calls = [
                ("floats", "(F)F", NativeVariable::Float(input as f32)),
                ("doubles", "(D)D", NativeVariable::Double(input)),
                ("fields", "(D)D", NativeVariable::Double(input)),
            ];
            for (name, descriptor, arg) in calls {
                let result = vm.invoke_static("t/Fp", name, descriptor, vec![arg]).unwrap();
                bits.push(match returned(result) {
                    Some(NativeVariable::Float(f)) => f.to_bits() as u64,
                    Some(NativeVariable::Double(d)) => d.to_bits(),
                    other => panic!("{name} returned {other:?}"),
                });
            }
        }
        let class = vm.loaders[LoaderId::BOOTSTRAP.0].cached("t/Fp").unwrap();
        for (name, descriptor) in [("floats", "(F)F"), ("doubles", "(D)D"), ("fields", "(D)D")] {
            let method = class.find_method(name, descriptor).unwrap();
            let compiled = method
                .code()
                .traces
                .iter()
                .any(|slot| matches!(slot.get(), Some(TraceSlot::Compiled(_))));
            assert_eq!(compiled, fusion, "{name}");
        }
        bits
    };

    let plain = run(VmConfig {
        quickening: false,
        trace_fusion: false,
        ..VmConfig::default()
    });
    let fused = run(VmConfig {
        warmup_budget: 0,
        ..VmConfig::default()
    });
    assert_eq!(plain, fused);
    // 1.5 through the field loop: d ends at 4.5 and l goes 1, 3, 4
    assert_eq!(*plain.last().unwrap(), 8.5f64.to_bits());
}

#[test]
fn test_trace_fault_raises_at_its_instruction() {
    let mut builder = ClassFileBuilder::new("t/Div");
    let arithmetic = builder.class("java/lang/ArithmeticException");
    // loops dividing by a counter that reaches zero, catches the fault and reports the counter
    let mut asm = Assembler::new(2);
    let top = asm.new_label();
    let start = asm.new_label();
    let end = asm.new_label();
    let handler = asm.new_label();
    asm.bipush(5)
        .op(inst::ISTORE_0)
        .bind(start)
        .bind(top)
        .bipush(100)
        .op(inst::ILOAD_0)
        .op(inst::IDIV)
        .op(inst::ISTORE_1)
        .iinc(0, -1)
        .branch(inst::GOTO, top)
        .bind(end)
        .bind(handler)
        .op(inst::POP)
        .op(inst::ILOAD_0)
        .op(inst::IRETURN)
        .try_catch(start, end, handler, arithmetic);
    builder.method(M::PUBLIC | M::STATIC, "run", "()I", asm.finish().unwrap());

    let config = VmConfig {
        warmup_budget: 0,
        ..VmConfig::default()
    };
    let mut vm = machine(config, vec![builder.build()]);
    let result = vm.invoke_static("t/Div", "run", "()I", vec![]).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(0)));
}

fn exceptions_class() -> ClassFile {
    let mut builder = ClassFileBuilder::new("t/Ex");
    let arithmetic = builder.class("java/lang/ArithmeticException");
    let exception = builder.class("java/lang/Exception");
    let runtime_exception = builder.class("java/lang/RuntimeException");
    let runtime_init = builder.method_ref(
        "java/lang/RuntimeException",
        "<init>",
        "(Ljava/lang/String;)V",
    );
    let boom = builder.string("boom");
    let thrower = builder.method_ref("t/Ex", "thrower", "()V");
    let get_message = builder.method_ref("java/lang/Throwable", "getMessage", "()Ljava/lang/String;");

    let mut asm = Assembler::new(2);
    let start = asm.new_label();
    let end = asm.new_label();
    let handler = asm.new_label();
    asm.bind(start)
        .op(inst::ILOAD_0)
        .op(inst::ILOAD_1)
        .op(inst::IDIV)
        .bind(end)
        .op(inst::IRETURN)
        .bind(handler)
        .op(inst::POP)
        .op(inst::ICONST_M1)
        .op(inst::IRETURN)
        .try_catch(start, end, handler, arithmetic);
    builder.method(M::PUBLIC | M::STATIC, "safeDiv", "(II)I", asm.finish().unwrap());

    let mut asm = Assembler::new(2);
    asm.op(inst::ILOAD_0).op(inst::ILOAD_1).op(inst::IDIV).op(inst::IRETURN);
    builder.method(M::PUBLIC | M::STATIC, "div", "(II)I", asm.finish().unwrap());

    let mut asm = Assembler::new(0);
    asm.op_u16(inst::NEW, runtime_exception)
        .op(inst::DUP)
        .ldc(boom)
        .op_u16(inst::INVOKESPECIAL, runtime_init)
        .op(inst::ATHROW);
    builder.method(M::PUBLIC | M::STATIC, "thrower", "()V", asm.finish().unwrap());

    // catches what thrower raises two frames down and returns its message
    let mut asm = Assembler::new(0);
    let start = asm.new_label();
    let end = asm.new_label();
    let handler = asm.new_label();
    asm.bind(start)
        .op_u16(inst::INVOKESTATIC, thrower)
        .bind(end)
        .op(inst::ACONST_NULL)
        .op(inst::ARETURN)
        .bind(handler)
        .op_u16(inst::INVOKEVIRTUAL, get_message)
        .op(inst::ARETURN)
        .try_catch(start, end, handler, exception);
    builder.method(
        M::PUBLIC | M::STATIC,
        "catcher",
        "()Ljava/lang/String;",
        asm.finish().unwrap(),
    );
    builder.build()
}

#[test]
fn test_handler_catches_arithmetic_fault() {
    let mut vm = machine(VmConfig::default(), vec![exceptions_class()]);
    let args = |a, b| vec![NativeVariable::Int(a), NativeVariable::Int(b)];
    let result = vm.invoke_static("t/Ex", "safeDiv", "(II)I", args(7, 2)).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(3)));
    let result = vm.invoke_static("t/Ex", "safeDiv", "(II)I", args(7, 0)).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(-1)));
    let result = vm
        .invoke_static("t/Ex", "div", "(II)I", args(i32::MIN, -1))
        .unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(i32::MIN)));
}

#[test]
fn test_uncaught_exception_reaches_host() {
    let mut vm = machine(VmConfig::default(), vec![exceptions_class()]);
    let result = vm
        .invoke_static(
            "t/Ex",
            "div",
            "(II)I",
            vec![NativeVariable::Int(1), NativeVariable::Int(0)],
        )
        .unwrap();
    assert_eq!(threw(&vm, result), "java.lang.ArithmeticException: / by zero");
    let thread = ThreadId(0);
    assert!(vm.uncaught_exception(thread).unwrap().is_some());
    assert_eq!(vm.thread_status(thread), Some(ThreadStatus::Terminated));
}

#[test]
fn test_exception_unwinds_through_frames() {
    let mut vm = machine(VmConfig::default(), vec![exceptions_class()]);
    let result = vm
        .invoke_static("t/Ex", "catcher", "()Ljava/lang/String;", vec![])
        .unwrap();
    let Some(NativeVariable::Reference(message)) = returned(result) else {
        panic!("expected a string");
    };
    assert_eq!(vm.string_value(message).as_deref(), Some("boom"));
}

#[test]
fn test_deep_recursion_overflows() {
    let mut builder = ClassFileBuilder::new("t/Deep");
    let recurse = builder.method_ref("t/Deep", "recurse", "()V");
    let mut asm = Assembler::new(0);
    asm.op_u16(inst::INVOKESTATIC, recurse).op(inst::RETURN);
    builder.method(M::PUBLIC | M::STATIC, "recurse", "()V", asm.finish().unwrap());
    let config = VmConfig {
        max_stack_depth: 64,
        ..VmConfig::default()
    };
    let mut vm = machine(config, vec![builder.build()]);
    let result = vm.invoke_static("t/Deep", "recurse", "()V", vec![]).unwrap();
    assert_eq!(threw(&vm, result), "java.lang.StackOverflowError");
}

fn init_classes() -> Vec<ClassFile> {
    let mut log = ClassFileBuilder::new("t/Log");
    log.field(F::PUBLIC | F::STATIC, "runs", "I");

    let mut init = ClassFileBuilder::new("t/Init");
    let runs = init.field_ref("t/Log", "runs", "I");
    let mut asm = Assembler::new(0);
    asm.op_u16(inst::GETSTATIC, runs)
        .op(inst::ICONST_1)
        .op(inst::IADD)
        .op_u16(inst::PUTSTATIC, runs)
        .op(inst::RETURN);
    init.method(M::STATIC, "<clinit>", "()V", asm.finish().unwrap());
    let mut asm = Assembler::new(0);
    asm.op(inst::ICONST_5).op(inst::IRETURN);
    init.method(M::PUBLIC | M::STATIC, "get", "()I", asm.finish().unwrap());

    let mut bad = ClassFileBuilder::new("t/Bad");
    let mut asm = Assembler::new(0);
    asm.op(inst::ICONST_1)
        .op(inst::ICONST_0)
        .op(inst::IDIV)
        .op(inst::POP)
        .op(inst::RETURN);
    bad.method(M::STATIC, "<clinit>", "()V", asm.finish().unwrap());
    let mut asm = Assembler::new(0);
    asm.op(inst::ICONST_1).op(inst::IRETURN);
    bad.method(M::PUBLIC | M::STATIC, "get", "()I", asm.finish().unwrap());

    let mut main = ClassFileBuilder::new("t/Main");
    let get = main.method_ref("t/Init", "get", "()I");
    let runs = main.field_ref("t/Log", "runs", "I");
    let mut asm = Assembler::new(0);
    asm.op_u16(inst::INVOKESTATIC, get)
        .op(inst::POP)
        .op_u16(inst::INVOKESTATIC, get)
        .op(inst::POP)
        .op_u16(inst::GETSTATIC, runs)
        .op(inst::IRETURN);
    main.method(M::PUBLIC | M::STATIC, "main", "()I", asm.finish().unwrap());

    vec![log.build(), init.build(), bad.build(), main.build()]
}

#[test]
fn test_static_initializer_runs_once() {
    let mut vm = machine(VmConfig::default(), init_classes());
    let result = vm.invoke_static("t/Main", "main", "()I", vec![]).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(1)));
    let result = vm.invoke_static("t/Init", "get", "()I", vec![]).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(5)));
    let result = vm.invoke_static("t/Main", "main", "()I", vec![]).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(1)));
    assert_eq!(
        vm.class_state(LoaderId::BOOTSTRAP, "t/Init"),
        Some(crate::ClassState::Initialized)
    );
}

#[test]
fn test_failed_initializer_is_permanent() {
    let mut vm = machine(VmConfig::default(), init_classes());
    let first = vm.invoke_static("t/Bad", "get", "()I", vec![]).unwrap();
    assert_eq!(threw(&vm, first), "java.lang.ExceptionInInitializerError");
    let second = vm.invoke_static("t/Bad", "get", "()I", vec![]).unwrap();
    assert_eq!(
        threw(&vm, second),
        "java.lang.NoClassDefFoundError: Could not initialize class t.Bad"
    );
    assert_ne!(
        vm.class_state(LoaderId::BOOTSTRAP, "t/Bad"),
        Some(crate::ClassState::Initialized)
    );
}

// two threads bump a counter 50 times each, yielding between read and write
// mid() reaches t/Holder one frame deeper than second() does
fn overflowing_init_classes() -> Vec<ClassFile> {
    let mut holder = ClassFileBuilder::new("t/Holder");
    holder.field(F::PUBLIC | F::STATIC, "x", "I");
    let x = holder.field_ref("t/Holder", "x", "I");
    let mut asm = Assembler::new(0);
    asm.bipush(7).op_u16(inst::PUTSTATIC, x).op(inst::RETURN);
    holder.method(M::STATIC, "<clinit>", "()V", asm.finish().unwrap());

    let mut reader = ClassFileBuilder::new("t/Reader");
    let x = reader.field_ref("t/Holder", "x", "I");
    let mid = reader.method_ref("t/Reader", "mid", "()I");

    let mut asm = Assembler::new(0);
    let start = asm.new_label();
    let end = asm.new_label();
    let handler = asm.new_label();
    asm.bind(start)
        .op_u16(inst::GETSTATIC, x)
        .bind(end)
        .op(inst::IRETURN)
        .bind(handler)
        .op(inst::POP)
        .op(inst::ICONST_M1)
        .op(inst::IRETURN)
        .try_catch(start, end, handler, 0);
    reader.method(M::PUBLIC | M::STATIC, "mid", "()I", asm.finish().unwrap());

    let mut asm = Assembler::new(0);
    asm.op_u16(inst::INVOKESTATIC, mid).op(inst::IRETURN);
    reader.method(M::PUBLIC | M::STATIC, "first", "()I", asm.finish().unwrap());

    let mut asm = Assembler::new(0);
    asm.op_u16(inst::GETSTATIC, x).op(inst::IRETURN);
    reader.method(M::PUBLIC | M::STATIC, "second", "()I", asm.finish().unwrap());
    vec![holder.build(), reader.build()]
}

#[test]
fn test_initializer_overflow_leaves_class_retryable() {
    let config = VmConfig {
        max_stack_depth: 4,
        ..VmConfig::default()
    };
    let mut vm = machine(config, overflowing_init_classes());
    let result = vm.invoke_static("t/Reader", "first", "()I", vec![]).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(-1)));
    assert_ne!(
        vm.class_state(LoaderId::BOOTSTRAP, "t/Holder"),
        Some(crate::runtime::ClassState::Initialized)
    );

    // a fresh thread with a shallower stack runs the initializer
    let result = vm.invoke_static("t/Reader", "second", "()I", vec![]).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(7)));
    assert_eq!(
        vm.class_state(LoaderId::BOOTSTRAP, "t/Holder"),
        Some(crate::runtime::ClassState::Initialized)
    );
}

fn counter_classes() -> Vec<ClassFile> {
    let mut counter = ClassFileBuilder::new("t/Counter");
    counter.field(F::STATIC, "count", "I");
    let count = counter.field_ref("t/Counter", "count", "I");
    let thread = counter.class("java/lang/Thread");
    let worker = counter.class("t/Worker");
    let thread_init = counter.method_ref("java/lang/Thread", "<init>", "(Ljava/lang/Runnable;)V");
    let worker_init = counter.method_ref("t/Worker", "<init>", "()V");
    let start = counter.method_ref("java/lang/Thread", "start", "()V");
    let join = counter.method_ref("java/lang/Thread", "join", "()V");
    let yield_ = counter.method_ref("java/lang/Thread", "yield", "()V");

    let mut asm = Assembler::new(1);
    asm.op_u16(inst::GETSTATIC, count)
        .op(inst::ISTORE_0)
        .op_u16(inst::INVOKESTATIC, yield_)
        .op(inst::ILOAD_0)
        .op(inst::ICONST_1)
        .op(inst::IADD)
        .op_u16(inst::PUTSTATIC, count)
        .op(inst::RETURN);
    counter.method(
        M::PUBLIC | M::STATIC | M::SYNCHRONIZED,
        "inc",
        "()V",
        asm.finish().unwrap(),
    );

    let mut asm = Assembler::new(2);
    for store in [inst::ASTORE_0, inst::ASTORE_1] {
        asm.op_u16(inst::NEW, thread)
            .op(inst::DUP)
            .op_u16(inst::NEW, worker)
            .op(inst::DUP)
            .op_u16(inst::INVOKESPECIAL, worker_init)
            .op_u16(inst::INVOKESPECIAL, thread_init)
            .op(store);
    }
    asm.op(inst::ALOAD_0)
        .op_u16(inst::INVOKEVIRTUAL, start)
        .op(inst::ALOAD_1)
        .op_u16(inst::INVOKEVIRTUAL, start)
        .op(inst::ALOAD_0)
        .op_u16(inst::INVOKEVIRTUAL, join)
        .op(inst::ALOAD_1)
        .op_u16(inst::INVOKEVIRTUAL, join)
        .op_u16(inst::GETSTATIC, count)
        .op(inst::IRETURN);
    counter.method(M::PUBLIC | M::STATIC, "main", "()I", asm.finish().unwrap());

    let mut worker = ClassFileBuilder::new("t/Worker");
    worker.interface("java/lang/Runnable");
    let object_init = worker.method_ref("java/lang/Object", "<init>", "()V");
    let inc = worker.method_ref("t/Counter", "inc", "()V");
    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0)
        .op_u16(inst::INVOKESPECIAL, object_init)
        .op(inst::RETURN);
    worker.method(M::PUBLIC, "<init>", "()V", asm.finish().unwrap());
    let mut asm = Assembler::new(2);
    let top = asm.new_label();
    let done = asm.new_label();
    asm.op(inst::ICONST_0)
        .op(inst::ISTORE_1)
        .bind(top)
        .op(inst::ILOAD_1)
        .bipush(50)
        .branch(inst::IF_ICMPGE, done)
        .op_u16(inst::INVOKESTATIC, inc)
        .iinc(1, 1)
        .branch(inst::GOTO, top)
        .bind(done)
        .op(inst::RETURN);
    worker.method(M::PUBLIC, "run", "()V", asm.finish().unwrap());

    vec![counter.build(), worker.build()]
}

#[test]
fn test_synchronized_static_method_excludes_other_threads() {
    let config = VmConfig {
        initial_quantum: 50,
        min_quantum: 50,
        max_quantum: 50,
        ..VmConfig::default()
    };
    let mut vm = machine(config, counter_classes());
    let result = vm.invoke_static("t/Counter", "main", "()I", vec![]).unwrap();
    assert_eq!(returned(result), Some(NativeVariable::Int(100)));
    // main plus two workers, all done
    assert_eq!(vm.threads.len(), 3);
    assert!(
        vm.threads
            .iter()
            .all(|t| t.status == ThreadStatus::Terminated)
    );
}

// caller() returns 2 when the interrupt reaches it, locked() returns 3 if it catches it itself
fn interrupted_entry_class() -> ClassFile {
    let mut builder = ClassFileBuilder::new("t/Entry");
    let interrupted = builder.class("java/lang/InterruptedException");
    let locked = builder.method_ref("t/Entry", "locked", "()I");

    let mut asm = Assembler::new(0);
    let start = asm.new_label();
    let end = asm.new_label();
    let handler = asm.new_label();
    asm.bind(start)
        .op(inst::ICONST_1)
        .bind(end)
        .op(inst::IRETURN)
        .bind(handler)
        .op(inst::POP)
        .op(inst::ICONST_3)
        .op(inst::IRETURN)
        .try_catch(start, end, handler, 0);
    builder.method(
        M::PUBLIC | M::STATIC | M::SYNCHRONIZED,
        "locked",
        "()I",
        asm.finish().unwrap(),
    );

    let mut asm = Assembler::new(0);
    let start = asm.new_label();
    let end = asm.new_label();
    let handler = asm.new_label();
    asm.bind(start)
        .op_u16(inst::INVOKESTATIC, locked)
        .bind(end)
        .op(inst::IRETURN)
        .bind(handler)
        .op(inst::POP)
        .op(inst::ICONST_2)
        .op(inst::IRETURN)
        .try_catch(start, end, handler, interrupted);
    builder.method(M::PUBLIC | M::STATIC, "caller", "()I", asm.finish().unwrap());

    let mut asm = Assembler::new(0);
    asm.op(inst::RETURN);
    builder.method(M::PUBLIC | M::STATIC, "noop", "()V", asm.finish().unwrap());
    builder.build()
}

#[test]
fn test_interrupt_before_synchronized_entry_raises_in_caller() {
    let mut vm = machine(VmConfig::default(), vec![interrupted_entry_class()]);
    vm.invoke_static("t/Entry", "noop", "()V", vec![]).unwrap();
    let class = vm.loaders[LoaderId::BOOTSTRAP.0].cached("t/Entry").unwrap();
    let mirror = vm.class_mirror(&class);
    let holder = vm.spawn_thread("holder");
    assert_eq!(vm.monitor_enter(holder, mirror, 1), Enter::Acquired);

    let caller = vm.spawn_thread("caller");
    let result = Arc::new(parking_lot::Mutex::new(None));
    let slot = Arc::clone(&result);
    vm.run_method(
        caller,
        LoaderId::BOOTSTRAP,
        "t/Entry",
        "caller",
        "()I",
        vec![],
        move |completion| *slot.lock() = Some(completion),
    )
    .unwrap();
    for _ in 0..100 {
        if vm.thread_status(caller) == Some(ThreadStatus::Blocked) {
            break;
        }
        vm.step().unwrap();
    }
    assert_eq!(vm.thread_status(caller), Some(ThreadStatus::Blocked));

    vm.interrupt(caller);
    for _ in 0..100 {
        if result.lock().is_some() {
            break;
        }
        vm.step().unwrap();
    }
    let completion = result.lock().take().unwrap();
    assert_eq!(returned(completion), Some(NativeVariable::Int(2)));
    assert_eq!(vm.monitors.owner(mirror), Some(holder));
}

fn indy_class() -> ClassFile {
    let mut builder = ClassFileBuilder::new("t/Indy");
    let call_site = builder.class("java/lang/invoke/ConstantCallSite");
    let call_site_init = builder.method_ref(
        "java/lang/invoke/ConstantCallSite",
        "<init>",
        "(Ljava/lang/invoke/MethodHandle;)V",
    );
    let target_ref = builder.method_ref("t/Indy", "twice", "(I)I");
    let target = builder.method_handle(RefKind::InvokeStatic, target_ref);
    let bsm_descriptor = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;\
                          Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;";
    let bsm_ref = builder.method_ref("t/Indy", "bootstrap", bsm_descriptor);
    let bsm_handle = builder.method_handle(RefKind::InvokeStatic, bsm_ref);
    let bsm = builder.bootstrap_method(bsm_handle, vec![]);
    let site = builder.invoke_dynamic(bsm, "apply", "(I)I");
    let links = builder.field_ref("t/Indy", "links", "I");
    builder.field(F::STATIC, "links", "I");

    let mut asm = Assembler::new(3);
    asm.op_u16(inst::GETSTATIC, links)
        .op(inst::ICONST_1)
        .op(inst::IADD)
        .op_u16(inst::PUTSTATIC, links)
        .op_u16(inst::NEW, call_site)
        .op(inst::DUP)
        .ldc(target)
        .op_u16(inst::INVOKESPECIAL, call_site_init)
        .op(inst::ARETURN);
    builder.method(M::PUBLIC | M::STATIC, "bootstrap", bsm_descriptor, asm.finish().unwrap());

    let mut asm = Assembler::new(1);
    asm.op(inst::ILOAD_0).op(inst::ICONST_2).op(inst::IMUL).op(inst::IRETURN);
    builder.method(M::PUBLIC | M::STATIC, "twice", "(I)I", asm.finish().unwrap());

    // one call site run three times
    let mut asm = Assembler::new(2);
    let top = asm.new_label();
    let done = asm.new_label();
    asm.op(inst::ICONST_0)
        .op(inst::ISTORE_0)
        .op(inst::ICONST_0)
        .op(inst::ISTORE_1)
        .bind(top)
        .op(inst::ILOAD_1)
        .op(inst::ICONST_3)
        .branch(inst::IF_ICMPGE, done)
        .op(inst::ILOAD_0)
        .bipush(7)
        .invokedynamic(site)
        .op(inst::IADD)
        .op(inst::ISTORE_0)
        .iinc(1, 1)
        .branch(inst::GOTO, top)
        .bind(done)
        .op(inst::ILOAD_0)
        .op_u16(inst::GETSTATIC, links)
        .bipush(100)
        .op(inst::IMUL)
        .op(inst::IADD)
        .op(inst::IRETURN);
    builder.method(M::PUBLIC | M::STATIC, "main", "()I", asm.finish().unwrap());
    builder.build()
}

#[test]
fn test_invokedynamic_links_once() {
    let mut vm = machine(VmConfig::default(), vec![indy_class()]);
    let result = vm.invoke_static("t/Indy", "main", "()I", vec![]).unwrap();
    // 3 * 14 from the target, 100 per bootstrap run
    assert_eq!(returned(result), Some(NativeVariable::Int(142)));
}

#[test]
fn test_failing_bootstrap_method() {
    let mut builder = ClassFileBuilder::new("t/BadIndy");
    let bsm_descriptor = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;\
                          Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;";
    let bsm_ref = builder.method_ref("t/BadIndy", "bootstrap", bsm_descriptor);
    let bsm_handle = builder.method_handle(RefKind::InvokeStatic, bsm_ref);
    let bsm = builder.bootstrap_method(bsm_handle, vec![]);
    let site = builder.invoke_dynamic(bsm, "apply", "()V");

    let mut asm = Assembler::new(3);
    asm.op(inst::ACONST_NULL).op(inst::ARETURN);
    builder.method(M::PUBLIC | M::STATIC, "bootstrap", bsm_descriptor, asm.finish().unwrap());
    let mut asm = Assembler::new(0);
    asm.invokedynamic(site).op(inst::RETURN);
    builder.method(M::PUBLIC | M::STATIC, "main", "()V", asm.finish().unwrap());

    let mut vm = machine(VmConfig::default(), vec![builder.build()]);
    let result = vm.invoke_static("t/BadIndy", "main", "()V", vec![]).unwrap();
    assert_eq!(
        threw(&vm, result),
        "java.lang.BootstrapMethodError: bootstrap method returned null"
    );
}

#[test]
fn test_mirror_and_method_type_names() {
    let mut builder = ClassFileBuilder::new("t/Names");
    let class = builder.class("t/Names");
    let method_type = builder.method_type("(I)J");
    let get_name = builder.method_ref("java/lang/Class", "getName", "()Ljava/lang/String;");
    let to_descriptor = builder.method_ref(
        "java/lang/invoke/MethodType",
        "toMethodDescriptorString",
        "()Ljava/lang/String;",
    );
    let mut asm = Assembler::new(0);
    asm.ldc(class)
        .op_u16(inst::INVOKEVIRTUAL, get_name)
        .op(inst::ARETURN);
    builder.method(
        M::PUBLIC | M::STATIC,
        "className",
        "()Ljava/lang/String;",
        asm.finish().unwrap(),
    );
    let mut asm = Assembler::new(0);
    asm.ldc(method_type)
        .op_u16(inst::INVOKEVIRTUAL, to_descriptor)
        .op(inst::ARETURN);
    builder.method(
        M::PUBLIC | M::STATIC,
        "typeName",
        "()Ljava/lang/String;",
        asm.finish().unwrap(),
    );

    let mut vm = machine(VmConfig::default(), vec![builder.build()]);
    for (method, expected) in [("className", "t.Names"), ("typeName", "(I)J")] {
        let result = vm
            .invoke_static("t/Names", method, "()Ljava/lang/String;", vec![])
            .unwrap();
        let Some(NativeVariable::Reference(string)) = returned(result) else {
            panic!("{method} returned no string");
        };
        assert_eq!(vm.string_value(string).as_deref(), Some(expected));
    }
}

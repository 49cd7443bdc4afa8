use std::sync::Arc;

use crate::{
    class::{
        ClassFile, CodeAttribute,
        builder::{Assembler, ClassFileBuilder},
    },
    consts::{ClassAccessFlag as C, FieldAccessFlag as F, MethodAccessFlag as M},
    error::VmError,
    runtime::{Class, LoaderId, Machine, MapProvider, instructions as inst},
};

pub(crate) const OBJECT: &str = "java/lang/Object";
pub(crate) const STRING: &str = "java/lang/String";
pub(crate) const THROWABLE: &str = "java/lang/Throwable";
pub(crate) const ERROR: &str = "java/lang/Error";

pub(crate) const NULL_POINTER_EXCEPTION: &str = "java/lang/NullPointerException";
pub(crate) const ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION: &str =
    "java/lang/ArrayIndexOutOfBoundsException";
pub(crate) const ARITHMETIC_EXCEPTION: &str = "java/lang/ArithmeticException";
pub(crate) const CLASS_CAST_EXCEPTION: &str = "java/lang/ClassCastException";
pub(crate) const NEGATIVE_ARRAY_SIZE_EXCEPTION: &str = "java/lang/NegativeArraySizeException";
pub(crate) const ARRAY_STORE_EXCEPTION: &str = "java/lang/ArrayStoreException";
pub(crate) const ILLEGAL_MONITOR_STATE_EXCEPTION: &str = "java/lang/IllegalMonitorStateException";
pub(crate) const INTERRUPTED_EXCEPTION: &str = "java/lang/InterruptedException";
pub(crate) const CLASS_NOT_FOUND_EXCEPTION: &str = "java/lang/ClassNotFoundException";
pub(crate) const CLONE_NOT_SUPPORTED_EXCEPTION: &str = "java/lang/CloneNotSupportedException";
pub(crate) const ILLEGAL_ARGUMENT_EXCEPTION: &str = "java/lang/IllegalArgumentException";
pub(crate) const ILLEGAL_THREAD_STATE_EXCEPTION: &str = "java/lang/IllegalThreadStateException";
pub(crate) const STACK_OVERFLOW_ERROR: &str = "java/lang/StackOverflowError";
pub(crate) const INTERNAL_ERROR: &str = "java/lang/InternalError";
pub(crate) const LINKAGE_ERROR: &str = "java/lang/LinkageError";
pub(crate) const NO_CLASS_DEF_FOUND_ERROR: &str = "java/lang/NoClassDefFoundError";
pub(crate) const CLASS_FORMAT_ERROR: &str = "java/lang/ClassFormatError";
pub(crate) const CLASS_CIRCULARITY_ERROR: &str = "java/lang/ClassCircularityError";
pub(crate) const UNSATISFIED_LINK_ERROR: &str = "java/lang/UnsatisfiedLinkError";
pub(crate) const EXCEPTION_IN_INITIALIZER_ERROR: &str = "java/lang/ExceptionInInitializerError";
pub(crate) const BOOTSTRAP_METHOD_ERROR: &str = "java/lang/BootstrapMethodError";
pub(crate) const INCOMPATIBLE_CLASS_CHANGE_ERROR: &str = "java/lang/IncompatibleClassChangeError";
pub(crate) const NO_SUCH_FIELD_ERROR: &str = "java/lang/NoSuchFieldError";
pub(crate) const NO_SUCH_METHOD_ERROR: &str = "java/lang/NoSuchMethodError";
pub(crate) const ABSTRACT_METHOD_ERROR: &str = "java/lang/AbstractMethodError";
pub(crate) const INSTANTIATION_ERROR: &str = "java/lang/InstantiationError";
pub(crate) const ILLEGAL_ACCESS_ERROR: &str = "java/lang/IllegalAccessError";

// (class, superclass), supertypes first
const THROWABLES: &[(&str, &str)] = &[
    ("java/lang/Exception", THROWABLE),
    (ERROR, THROWABLE),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/ReflectiveOperationException", "java/lang/Exception"),
    (INTERRUPTED_EXCEPTION, "java/lang/Exception"),
    (CLONE_NOT_SUPPORTED_EXCEPTION, "java/lang/Exception"),
    (CLASS_NOT_FOUND_EXCEPTION, "java/lang/ReflectiveOperationException"),
    (NULL_POINTER_EXCEPTION, "java/lang/RuntimeException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    (ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, "java/lang/IndexOutOfBoundsException"),
    (ARITHMETIC_EXCEPTION, "java/lang/RuntimeException"),
    (CLASS_CAST_EXCEPTION, "java/lang/RuntimeException"),
    (NEGATIVE_ARRAY_SIZE_EXCEPTION, "java/lang/RuntimeException"),
    (ARRAY_STORE_EXCEPTION, "java/lang/RuntimeException"),
    (ILLEGAL_MONITOR_STATE_EXCEPTION, "java/lang/RuntimeException"),
    (ILLEGAL_ARGUMENT_EXCEPTION, "java/lang/RuntimeException"),
    (ILLEGAL_THREAD_STATE_EXCEPTION, ILLEGAL_ARGUMENT_EXCEPTION),
    ("java/lang/VirtualMachineError", ERROR),
    (STACK_OVERFLOW_ERROR, "java/lang/VirtualMachineError"),
    (INTERNAL_ERROR, "java/lang/VirtualMachineError"),
    (LINKAGE_ERROR, ERROR),
    (NO_CLASS_DEF_FOUND_ERROR, LINKAGE_ERROR),
    (CLASS_FORMAT_ERROR, LINKAGE_ERROR),
    (CLASS_CIRCULARITY_ERROR, LINKAGE_ERROR),
    (UNSATISFIED_LINK_ERROR, LINKAGE_ERROR),
    (EXCEPTION_IN_INITIALIZER_ERROR, LINKAGE_ERROR),
    (BOOTSTRAP_METHOD_ERROR, LINKAGE_ERROR),
    (INCOMPATIBLE_CLASS_CHANGE_ERROR, LINKAGE_ERROR),
    (NO_SUCH_FIELD_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR),
    (NO_SUCH_METHOD_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR),
    (ABSTRACT_METHOD_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR),
    (INSTANTIATION_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR),
    (ILLEGAL_ACCESS_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR),
];

/// Classes the engine itself allocates or raises.
#[derive(Debug)]
pub(crate) struct FamousClasses {
    pub(crate) object: Arc<Class>,
    pub(crate) class: Arc<Class>,
    pub(crate) string: Arc<Class>,
    pub(crate) throwable: Arc<Class>,
    pub(crate) thread: Arc<Class>,
    pub(crate) method_handle: Arc<Class>,
    pub(crate) method_type: Arc<Class>,
    pub(crate) call_site: Arc<Class>,
}

impl Machine {
    pub(crate) fn famous(&self) -> &FamousClasses {
        self.famous
            .get()
            .unwrap_or_else(|| panic!("core classes used before boot"))
    }

    /// Loads and links every core class up front, so that raising an engine throwable never
    /// has to wait on a provider.
    pub(crate) fn init_famous_classes(&mut self) -> Result<(), VmError> {
        let mut names: Vec<&str> = vec![
            OBJECT,
            "java/lang/Class",
            STRING,
            THROWABLE,
            "java/lang/Thread",
            "java/lang/invoke/MethodHandle",
            "java/lang/invoke/MethodType",
            "java/lang/invoke/CallSite",
        ];
        names.extend(THROWABLES.iter().map(|(name, _)| *name));
        names.extend([
            "java/lang/Cloneable",
            "java/io/Serializable",
            "java/lang/Runnable",
            "java/lang/invoke/ConstantCallSite",
        ]);

        let mut loaded = Vec::with_capacity(names.len());
        for name in names {
            let class = self
                .load_and_link(None, LoaderId::BOOTSTRAP, name)
                .map_err(|_| VmError::MissingCoreClass(name.to_string()))?;
            loaded.push(class);
        }
        let famous = FamousClasses {
            object: Arc::clone(&loaded[0]),
            class: Arc::clone(&loaded[1]),
            string: Arc::clone(&loaded[2]),
            throwable: Arc::clone(&loaded[3]),
            thread: Arc::clone(&loaded[4]),
            method_handle: Arc::clone(&loaded[5]),
            method_type: Arc::clone(&loaded[6]),
            call_site: Arc::clone(&loaded[7]),
        };
        let _ = self.famous.set(famous);
        tracing::debug!(classes = loaded.len(), "core classes ready");
        Ok(())
    }
}

fn assemble(asm: Assembler) -> CodeAttribute {
    asm.finish()
        .unwrap_or_else(|e| panic!("core library bytecode: {e}"))
}

fn interface(name: &str) -> ClassFile {
    let mut builder = ClassFileBuilder::new(name);
    builder.access(C::PUBLIC | C::INTERFACE | C::ABSTRACT);
    builder.build()
}

fn runnable() -> ClassFile {
    let mut builder = ClassFileBuilder::new("java/lang/Runnable");
    builder
        .access(C::PUBLIC | C::INTERFACE | C::ABSTRACT)
        .abstract_method(M::PUBLIC, "run", "()V");
    builder.build()
}

/// `<init>()V` that only calls the superclass constructor.
fn default_constructor(builder: &mut ClassFileBuilder, super_name: &str) {
    let init = builder.method_ref(super_name, "<init>", "()V");
    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0).op_u16(inst::INVOKESPECIAL, init).op(inst::RETURN);
    builder.method(M::PUBLIC, "<init>", "()V", assemble(asm));
}

fn object() -> ClassFile {
    let mut builder = ClassFileBuilder::new(OBJECT);
    builder.no_super_class();
    let mut asm = Assembler::new(1);
    asm.op(inst::RETURN);
    builder.method(M::PUBLIC, "<init>", "()V", assemble(asm));
    builder
        .native_method(M::PUBLIC, "hashCode", "()I")
        .native_method(M::PUBLIC | M::FINAL, "getClass", "()Ljava/lang/Class;")
        .native_method(M::PROTECTED, "clone", "()Ljava/lang/Object;")
        .native_method(M::PUBLIC | M::FINAL, "notify", "()V")
        .native_method(M::PUBLIC | M::FINAL, "notifyAll", "()V")
        .native_method(M::PUBLIC | M::FINAL, "wait", "(J)V");
    let wait = builder.method_ref(OBJECT, "wait", "(J)V");
    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0)
        .op(inst::LCONST_0)
        .op_u16(inst::INVOKEVIRTUAL, wait)
        .op(inst::RETURN);
    builder.method(M::PUBLIC | M::FINAL, "wait", "()V", assemble(asm));
    builder.build()
}

fn string() -> ClassFile {
    let mut builder = ClassFileBuilder::new(STRING);
    builder
        .access(C::PUBLIC | C::FINAL | C::SUPER)
        .interface("java/io/Serializable")
        .native_method(M::PUBLIC, "intern", "()Ljava/lang/String;");
    default_constructor(&mut builder, OBJECT);
    builder.build()
}

fn thread() -> ClassFile {
    const NAME: &str = "java/lang/Thread";
    let mut builder = ClassFileBuilder::new(NAME);
    builder
        .interface("java/lang/Runnable")
        .field(F::PRIVATE, "name", "Ljava/lang/String;")
        .field(F::PRIVATE, "target", "Ljava/lang/Runnable;")
        .field(F::PRIVATE, "priority", "I");
    let object_init = builder.method_ref(OBJECT, "<init>", "()V");
    let target = builder.field_ref(NAME, "target", "Ljava/lang/Runnable;");
    let runnable_run = builder.interface_method_ref("java/lang/Runnable", "run", "()V");
    let start0 = builder.method_ref(NAME, "start0", "()V");
    let is_alive = builder.method_ref(NAME, "isAlive", "()Z");
    let wait = builder.method_ref(OBJECT, "wait", "(J)V");
    let is_interrupted = builder.method_ref(NAME, "isInterrupted", "(Z)Z");
    let interrupt0 = builder.method_ref(NAME, "interrupt0", "()V");
    let current_thread = builder.method_ref(NAME, "currentThread", "()Ljava/lang/Thread;");
    let set_priority0 = builder.method_ref(NAME, "setPriority0", "(I)V");
    let priority = builder.field_ref(NAME, "priority", "I");

    default_constructor(&mut builder, OBJECT);

    let mut asm = Assembler::new(2);
    asm.op(inst::ALOAD_0)
        .op_u16(inst::INVOKESPECIAL, object_init)
        .op(inst::ALOAD_0)
        .op(inst::ALOAD_1)
        .op_u16(inst::PUTFIELD, target)
        .op(inst::RETURN);
    builder.method(M::PUBLIC, "<init>", "(Ljava/lang/Runnable;)V", assemble(asm));

    let mut asm = Assembler::new(1);
    let done = asm.new_label();
    asm.op(inst::ALOAD_0)
        .op_u16(inst::GETFIELD, target)
        .branch(inst::IFNULL, done)
        .op(inst::ALOAD_0)
        .op_u16(inst::GETFIELD, target)
        .invokeinterface(runnable_run, 1)
        .bind(done)
        .op(inst::RETURN);
    builder.method(M::PUBLIC, "run", "()V", assemble(asm));

    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0).op_u16(inst::INVOKEVIRTUAL, start0).op(inst::RETURN);
    builder.method(M::PUBLIC | M::SYNCHRONIZED, "start", "()V", assemble(asm));

    // join: wait on the thread object until it terminates
    let mut asm = Assembler::new(1);
    let top = asm.new_label();
    let done = asm.new_label();
    asm.bind(top)
        .op(inst::ALOAD_0)
        .op_u16(inst::INVOKEVIRTUAL, is_alive)
        .branch(inst::IFEQ, done)
        .op(inst::ALOAD_0)
        .op(inst::LCONST_0)
        .op_u16(inst::INVOKEVIRTUAL, wait)
        .branch(inst::GOTO, top)
        .bind(done)
        .op(inst::RETURN);
    builder.method(M::PUBLIC | M::FINAL | M::SYNCHRONIZED, "join", "()V", assemble(asm));

    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0)
        .op(inst::ICONST_0)
        .op_u16(inst::INVOKEVIRTUAL, is_interrupted)
        .op(inst::IRETURN);
    builder.method(M::PUBLIC, "isInterrupted", "()Z", assemble(asm));

    let mut asm = Assembler::new(0);
    asm.op_u16(inst::INVOKESTATIC, current_thread)
        .op(inst::ICONST_1)
        .op_u16(inst::INVOKEVIRTUAL, is_interrupted)
        .op(inst::IRETURN);
    builder.method(M::PUBLIC | M::STATIC, "interrupted", "()Z", assemble(asm));

    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0).op_u16(inst::INVOKEVIRTUAL, interrupt0).op(inst::RETURN);
    builder.method(M::PUBLIC, "interrupt", "()V", assemble(asm));

    // kept in a field too, so that a priority set before start survives
    let mut asm = Assembler::new(2);
    asm.op(inst::ALOAD_0)
        .op(inst::ILOAD_1)
        .op_u16(inst::PUTFIELD, priority)
        .op(inst::ALOAD_0)
        .op(inst::ILOAD_1)
        .op_u16(inst::INVOKEVIRTUAL, set_priority0)
        .op(inst::RETURN);
    builder.method(M::PUBLIC | M::FINAL, "setPriority", "(I)V", assemble(asm));

    builder
        .native_method(M::PUBLIC | M::STATIC, "currentThread", "()Ljava/lang/Thread;")
        .native_method(M::PUBLIC | M::STATIC, "yield", "()V")
        .native_method(M::PUBLIC | M::STATIC, "sleep", "(J)V")
        .native_method(M::PRIVATE, "start0", "()V")
        .native_method(M::PUBLIC | M::FINAL, "isAlive", "()Z")
        .native_method(M::PRIVATE, "isInterrupted", "(Z)Z")
        .native_method(M::PRIVATE, "interrupt0", "()V")
        .native_method(M::PUBLIC | M::STATIC, "holdsLock", "(Ljava/lang/Object;)Z")
        .native_method(M::PRIVATE, "setPriority0", "(I)V");
    builder.build()
}

fn throwable() -> ClassFile {
    let mut builder = ClassFileBuilder::new(THROWABLE);
    builder
        .interface("java/io/Serializable")
        .field(F::PRIVATE, "detailMessage", "Ljava/lang/String;")
        .field(F::PRIVATE, "cause", "Ljava/lang/Throwable;");
    let object_init = builder.method_ref(OBJECT, "<init>", "()V");
    let message = builder.field_ref(THROWABLE, "detailMessage", "Ljava/lang/String;");
    let cause = builder.field_ref(THROWABLE, "cause", "Ljava/lang/Throwable;");

    default_constructor(&mut builder, OBJECT);

    let mut asm = Assembler::new(2);
    asm.op(inst::ALOAD_0)
        .op_u16(inst::INVOKESPECIAL, object_init)
        .op(inst::ALOAD_0)
        .op(inst::ALOAD_1)
        .op_u16(inst::PUTFIELD, message)
        .op(inst::RETURN);
    builder.method(M::PUBLIC, "<init>", "(Ljava/lang/String;)V", assemble(asm));

    let mut asm = Assembler::new(3);
    asm.op(inst::ALOAD_0)
        .op_u16(inst::INVOKESPECIAL, object_init)
        .op(inst::ALOAD_0)
        .op(inst::ALOAD_1)
        .op_u16(inst::PUTFIELD, message)
        .op(inst::ALOAD_0)
        .op(inst::ALOAD_2)
        .op_u16(inst::PUTFIELD, cause)
        .op(inst::RETURN);
    builder.method(
        M::PUBLIC,
        "<init>",
        "(Ljava/lang/String;Ljava/lang/Throwable;)V",
        assemble(asm),
    );

    for (name, descriptor, field) in [
        ("getMessage", "()Ljava/lang/String;", message),
        ("getCause", "()Ljava/lang/Throwable;", cause),
    ] {
        let mut asm = Assembler::new(1);
        asm.op(inst::ALOAD_0).op_u16(inst::GETFIELD, field).op(inst::ARETURN);
        builder.method(M::PUBLIC, name, descriptor, assemble(asm));
    }
    builder.build()
}

fn throwable_subclass(name: &str, super_name: &str) -> ClassFile {
    let mut builder = ClassFileBuilder::new(name);
    builder.super_class(super_name);
    default_constructor(&mut builder, super_name);
    let init = builder.method_ref(super_name, "<init>", "(Ljava/lang/String;)V");
    let mut asm = Assembler::new(2);
    asm.op(inst::ALOAD_0)
        .op(inst::ALOAD_1)
        .op_u16(inst::INVOKESPECIAL, init)
        .op(inst::RETURN);
    builder.method(M::PUBLIC, "<init>", "(Ljava/lang/String;)V", assemble(asm));
    builder.build()
}

fn unsafe_class(name: &str) -> ClassFile {
    let mut builder = ClassFileBuilder::new(name);
    builder
        .access(C::PUBLIC | C::FINAL | C::SUPER)
        .field(F::PRIVATE | F::STATIC | F::FINAL, "theUnsafe", &format!("L{name};"));
    default_constructor(&mut builder, OBJECT);
    let this = builder.class(name);
    let init = builder.method_ref(name, "<init>", "()V");
    let the_unsafe = builder.field_ref(name, "theUnsafe", &format!("L{name};"));

    let mut asm = Assembler::new(0);
    asm.op_u16(inst::NEW, this)
        .op(inst::DUP)
        .op_u16(inst::INVOKESPECIAL, init)
        .op_u16(inst::PUTSTATIC, the_unsafe)
        .op(inst::RETURN);
    builder.method(M::STATIC, "<clinit>", "()V", assemble(asm));

    let mut asm = Assembler::new(0);
    asm.op_u16(inst::GETSTATIC, the_unsafe).op(inst::ARETURN);
    builder.method(
        M::PUBLIC | M::STATIC,
        "getUnsafe",
        &format!("()L{name};"),
        assemble(asm),
    );
    builder
        .native_method(M::PUBLIC, "park", "(ZJ)V")
        .native_method(M::PUBLIC, "unpark", "(Ljava/lang/Object;)V");
    builder.build()
}

fn method_handle() -> ClassFile {
    let mut builder = ClassFileBuilder::new("java/lang/invoke/MethodHandle");
    builder.access(C::PUBLIC | C::ABSTRACT | C::SUPER);
    for name in ["invokeExact", "invoke", "invokeBasic"] {
        builder.native_method(
            M::PUBLIC | M::FINAL | M::VARARGS,
            name,
            "([Ljava/lang/Object;)Ljava/lang/Object;",
        );
    }
    builder
        .native_method(
            M::PUBLIC,
            "withAppendix",
            "(Ljava/lang/Object;)Ljava/lang/invoke/MethodHandle;",
        )
        .native_method(M::PUBLIC, "type", "()Ljava/lang/invoke/MethodType;");
    builder.build()
}

fn call_site() -> ClassFile {
    const NAME: &str = "java/lang/invoke/CallSite";
    let mut builder = ClassFileBuilder::new(NAME);
    builder
        .access(C::PUBLIC | C::ABSTRACT | C::SUPER)
        .field(F::PROTECTED, "target", "Ljava/lang/invoke/MethodHandle;");
    default_constructor(&mut builder, OBJECT);
    let target = builder.field_ref(NAME, "target", "Ljava/lang/invoke/MethodHandle;");
    let mut asm = Assembler::new(1);
    asm.op(inst::ALOAD_0).op_u16(inst::GETFIELD, target).op(inst::ARETURN);
    builder.method(M::PUBLIC, "getTarget", "()Ljava/lang/invoke/MethodHandle;", assemble(asm));
    builder.build()
}

fn constant_call_site() -> ClassFile {
    const NAME: &str = "java/lang/invoke/ConstantCallSite";
    let mut builder = ClassFileBuilder::new(NAME);
    builder.super_class("java/lang/invoke/CallSite");
    let init = builder.method_ref("java/lang/invoke/CallSite", "<init>", "()V");
    let target = builder.field_ref(NAME, "target", "Ljava/lang/invoke/MethodHandle;");
    let mut asm = Assembler::new(2);
    asm.op(inst::ALOAD_0)
        .op_u16(inst::INVOKESPECIAL, init)
        .op(inst::ALOAD_0)
        .op(inst::ALOAD_1)
        .op_u16(inst::PUTFIELD, target)
        .op(inst::RETURN);
    builder.method(
        M::PUBLIC,
        "<init>",
        "(Ljava/lang/invoke/MethodHandle;)V",
        assemble(asm),
    );
    builder.build()
}

fn class_class() -> ClassFile {
    let mut builder = ClassFileBuilder::new("java/lang/Class");
    builder
        .access(C::PUBLIC | C::FINAL | C::SUPER)
        .native_method(M::PUBLIC, "getName", "()Ljava/lang/String;");
    builder.build()
}

fn method_type() -> ClassFile {
    let mut builder = ClassFileBuilder::new("java/lang/invoke/MethodType");
    builder
        .access(C::PUBLIC | C::FINAL | C::SUPER)
        .native_method(M::PUBLIC, "toMethodDescriptorString", "()Ljava/lang/String;");
    builder.build()
}

fn final_class(name: &str) -> ClassFile {
    let mut builder = ClassFileBuilder::new(name);
    builder.access(C::PUBLIC | C::FINAL | C::SUPER);
    builder.build()
}

/// Skeletal `java.lang` classes the engine depends on. They back the bootstrap loader for
/// every name the host's provider does not supply.
pub fn core_library() -> MapProvider {
    let mut provider = MapProvider::new();
    provider
        .insert(object())
        .insert(string())
        .insert(thread())
        .insert(throwable())
        .insert(class_class())
        .insert(runnable())
        .insert(interface("java/lang/Cloneable"))
        .insert(interface("java/io/Serializable"))
        .insert(unsafe_class("sun/misc/Unsafe"))
        .insert(unsafe_class("jdk/internal/misc/Unsafe"))
        .insert(method_handle())
        .insert(method_type())
        .insert(final_class("java/lang/invoke/MethodHandles$Lookup"))
        .insert(call_site())
        .insert(constant_call_site());

    let mut system = ClassFileBuilder::new("java/lang/System");
    system
        .access(C::PUBLIC | C::FINAL | C::SUPER)
        .native_method(
            M::PUBLIC | M::STATIC,
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        )
        .native_method(M::PUBLIC | M::STATIC, "currentTimeMillis", "()J")
        .native_method(M::PUBLIC | M::STATIC, "nanoTime", "()J")
        .native_method(
            M::PUBLIC | M::STATIC,
            "identityHashCode",
            "(Ljava/lang/Object;)I",
        );
    provider.insert(system.build());

    let mut shutdown = ClassFileBuilder::new("java/lang/Shutdown");
    shutdown.native_method(M::STATIC, "halt0", "(I)V");
    provider.insert(shutdown.build());

    for (name, super_name) in THROWABLES {
        provider.insert(throwable_subclass(name, super_name));
    }
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_library_is_closed() {
        let provider = core_library();
        for (name, super_name) in THROWABLES {
            assert!(provider.contains(name), "{name} missing");
            assert!(provider.contains(super_name), "{super_name} missing");
        }
        for name in [OBJECT, STRING, THROWABLE, "java/lang/Thread", "java/lang/Shutdown"] {
            assert!(provider.contains(name), "{name} missing");
        }
    }

    #[test]
    fn test_throwables_link() {
        let vm = Machine::new(crate::VmConfig::default(), MapProvider::new()).unwrap();
        let npe = vm.loaders[0].cached(NULL_POINTER_EXCEPTION).unwrap();
        assert!(crate::runtime::inheritance::is_subclass_of_name(
            &npe,
            "java/lang/RuntimeException"
        ));
        assert!(npe.instance_field("detailMessage").is_some());
        assert!(Arc::ptr_eq(
            &vm.famous().throwable,
            &vm.loaders[0].cached(THROWABLE).unwrap()
        ));
    }
}

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicI32, AtomicU8, Ordering},
    },
};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

pub use constant_pool::*;
pub use object::*;

use crate::{
    class::{BootstrapMethod, ExceptionTableEntry, LineNumberEntry},
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag},
    descriptor::{FieldDescriptor, FieldType, MethodDescriptor},
    runtime::{
        LoaderId, NativeFunction, ThreadId,
        famous_classes::CLASS_FORMAT_ERROR,
        interpreter::{QuickOp, TraceSlot},
    },
};

mod constant_pool;
mod object;

/// Lifecycle of a class descriptor. Only ever moves forward.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClassState {
    Unloaded = 0,
    Loaded = 1,
    Resolved = 2,
    Initialized = 3,
}

impl ClassState {
    fn from_u8(v: u8) -> ClassState {
        match v {
            0 => ClassState::Unloaded,
            1 => ClassState::Loaded,
            2 => ClassState::Resolved,
            _ => ClassState::Initialized,
        }
    }
}

#[derive(Debug)]
pub(crate) enum InitStatus {
    NotStarted,
    InProgress {
        thread: ThreadId,
        waiters: Vec<ThreadId>,
    },
    Done,
    // the throwable that escaped the initializer
    Failed(ObjRef),
}

#[derive(Debug)]
pub struct Class {
    pub(crate) constant_pool: Vec<ConstantPoolInfo>,
    pub(crate) access_flags: ClassAccessFlag,
    pub(crate) class_name: Arc<str>,
    pub(crate) loader: LoaderId,
    pub(crate) super_class_name: Option<Arc<str>>,
    pub(crate) interface_names: Vec<Arc<str>>,
    // declared fields only, statics carry their slot
    pub(crate) fields: Vec<FieldInfo>,
    pub(crate) methods: Vec<Arc<Method>>,
    pub(crate) static_fields: RwLock<Vec<Variable>>,
    // only for arrays
    pub(crate) array_element: Option<ArrayElement>,
    pub(crate) bootstrap_methods: Vec<BootstrapMethod>,
    pub(crate) source_file: Option<Arc<str>>,
    pub(crate) linkage: OnceCell<Linkage>,
    state: AtomicU8,
    pub(crate) init: Mutex<InitStatus>,
    pub(crate) mirror: OnceCell<ObjRef>,
}

#[derive(Debug, Clone)]
pub enum ArrayElement {
    Primitive(FieldType),
    Reference(Arc<Class>),
}

/// Everything that depends on the supertypes being resolved.
#[derive(Debug)]
pub struct Linkage {
    pub(crate) super_class: Option<Arc<Class>>,
    pub(crate) interfaces: Vec<Arc<Class>>,
    // inherited fields first
    pub(crate) instance_fields: Vec<InstanceField>,
    pub(crate) instance_slots: usize,
    // contains all methods inherited from super classes, and default methods from super interfaces
    pub(crate) vtable: Vec<VtableEntry>,
    pub(crate) vtable_index: HashMap<(Arc<str>, Arc<str>), usize>,
}

#[derive(Debug, Clone)]
pub struct InstanceField {
    pub(crate) declaring_class: Arc<str>,
    pub(crate) name: Arc<str>,
    pub(crate) descriptor: FieldDescriptor,
    pub(crate) slot: usize,
}

#[derive(Debug, Clone)]
pub struct VtableEntry {
    pub(crate) name: Arc<str>,
    pub(crate) descriptor: Arc<str>,
    pub(crate) method: Arc<Method>,
}

impl Class {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        class_name: Arc<str>,
        access_flags: ClassAccessFlag,
        loader: LoaderId,
        constant_pool: Vec<ConstantPoolInfo>,
        super_class_name: Option<Arc<str>>,
        interface_names: Vec<Arc<str>>,
        fields: Vec<FieldInfo>,
        methods: impl FnOnce(&Weak<Class>) -> Vec<Arc<Method>>,
        bootstrap_methods: Vec<BootstrapMethod>,
        source_file: Option<Arc<str>>,
        array_element: Option<ArrayElement>,
    ) -> Arc<Class> {
        let static_slots = fields
            .iter()
            .filter_map(|f| f.static_slot.map(|s| s + f.descriptor.0.slot_size()))
            .max()
            .unwrap_or(0);
        Arc::new_cyclic(|me| Class {
            constant_pool,
            access_flags,
            class_name,
            loader,
            super_class_name,
            interface_names,
            fields,
            methods: methods(me),
            static_fields: RwLock::new(vec![Variable::ZERO; static_slots]),
            array_element,
            bootstrap_methods,
            source_file,
            linkage: OnceCell::new(),
            state: AtomicU8::new(ClassState::Loaded as u8),
            init: Mutex::new(InitStatus::NotStarted),
            mirror: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.class_name
    }

    pub fn state(&self) -> ClassState {
        ClassState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the class forward to `state`. Requests to move backwards are ignored, so the
    /// observed state is monotonic.
    pub(crate) fn advance_state(&self, state: ClassState) {
        let previous = self.state.fetch_max(state as u8, Ordering::AcqRel);
        if previous < state as u8 {
            tracing::debug!(class = %self.class_name, ?state, "class state advanced");
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state() == ClassState::Initialized
    }

    pub(crate) fn get_constant(&self, index: u16) -> &ConstantPoolInfo {
        &self.constant_pool[index as usize - 1]
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access_flags.contains(ClassAccessFlag::INTERFACE)
    }

    pub(crate) fn is_array(&self) -> bool {
        self.class_name.starts_with('[')
    }

    pub(crate) fn package_name(&self) -> &str {
        let Some((package, _)) = self.class_name.rsplit_once('/') else {
            return "";
        };
        package
    }

    pub(crate) fn linkage(&self) -> &Linkage {
        self.linkage
            .get()
            .unwrap_or_else(|| panic!("class {} used before linking", self.class_name))
    }

    pub(crate) fn super_class(&self) -> Option<&Arc<Class>> {
        self.linkage.get().and_then(|l| l.super_class.as_ref())
    }

    pub(crate) fn interfaces(&self) -> &[Arc<Class>] {
        self.linkage
            .get()
            .map(|l| l.interfaces.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn instance_slots(&self) -> usize {
        self.linkage.get().map(|l| l.instance_slots).unwrap_or(0)
    }

    pub(crate) fn find_declared_method(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        self.methods
            .iter()
            .find(|m| m.name.as_ref() == name && m.raw_descriptor.as_ref() == descriptor)
    }

    /// Searches this class and then its superclasses.
    pub(crate) fn find_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        if let Some(method) = self.find_declared_method(name, descriptor) {
            return Some(Arc::clone(method));
        }
        self.super_class()?.find_method(name, descriptor)
    }

    pub(crate) fn clinit(&self) -> Option<&Arc<Method>> {
        self.methods
            .iter()
            .find(|m| m.name.as_ref() == "<clinit>" && m.is_static())
    }

    pub(crate) fn virtual_method(&self, vtable_index: usize) -> Option<&Arc<Method>> {
        self.linkage
            .get()?
            .vtable
            .get(vtable_index)
            .map(|entry| &entry.method)
    }

    pub(crate) fn find_virtual(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        let linkage = self.linkage.get()?;
        let index = linkage
            .vtable_index
            .get(&(Arc::from(name), Arc::from(descriptor)))?;
        Some(&linkage.vtable[*index].method)
    }

    /// Instance field lookup by name, the most derived declaration wins.
    pub(crate) fn instance_field(&self, name: &str) -> Option<&InstanceField> {
        self.linkage
            .get()?
            .instance_fields
            .iter()
            .rev()
            .find(|f| f.name.as_ref() == name)
    }

    pub(crate) fn get_static_field(&self, index: usize) -> Variable {
        self.static_fields.read()[index]
    }

    pub(crate) fn set_static_field(&self, index: usize, value: Variable) {
        self.static_fields.write()[index] = value;
    }
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub(crate) access_flags: FieldAccessFlag,
    pub(crate) name: Arc<str>,
    pub(crate) descriptor: FieldDescriptor,
    pub(crate) static_slot: Option<usize>,
}

impl FieldInfo {
    pub(crate) fn is_static(&self) -> bool {
        self.access_flags.contains(FieldAccessFlag::STATIC)
    }
}

#[derive(Debug)]
pub struct Method {
    pub(crate) class: Weak<Class>,
    pub(crate) class_name: Arc<str>,
    // position in the declaring class's method list
    pub(crate) index: usize,
    pub(crate) access_flags: MethodAccessFlag,
    pub(crate) name: Arc<str>,
    pub(crate) raw_descriptor: Arc<str>,
    pub(crate) descriptor: MethodDescriptor,
    // including the receiver
    pub(crate) arg_slots: usize,
    pub(crate) code: Option<Code>,
    pub(crate) native: OnceCell<NativeFunction>,
    pub(crate) warmup: AtomicI32,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.raw_descriptor
    }

    pub(crate) fn class(&self) -> Arc<Class> {
        self.class
            .upgrade()
            .unwrap_or_else(|| panic!("class {} dropped while its methods run", self.class_name))
    }

    pub(crate) fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::STATIC)
    }

    pub(crate) fn is_native(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::NATIVE)
    }

    pub(crate) fn is_abstract(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::ABSTRACT)
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::SYNCHRONIZED)
    }

    pub(crate) fn is_private(&self) -> bool {
        self.access_flags.contains(MethodAccessFlag::PRIVATE)
    }

    /// Interpreted methods always carry code; this is only called after that check.
    pub(crate) fn code(&self) -> &Code {
        self.code
            .as_ref()
            .unwrap_or_else(|| panic!("{}.{} has no code", self.class_name, self.name))
    }

    /// Consumes one unit of warm-up budget and reports whether the method is hot.
    pub(crate) fn tick_warmup(&self) -> bool {
        self.warmup.fetch_sub(1, Ordering::Relaxed) <= 1
    }

    pub(crate) fn reset_warmup(&self, budget: i32) {
        self.warmup.store(budget, Ordering::Relaxed);
    }

    pub(crate) fn line_number(&self, pc: usize) -> Option<u16> {
        let code = self.code.as_ref()?;
        code.line_numbers
            .iter()
            .filter(|l| l.start_pc as usize <= pc)
            .max_by_key(|l| l.start_pc)
            .map(|l| l.line_number)
    }
}

#[derive(Debug)]
pub struct Code {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) bytecode: Arc<[u8]>,
    pub(crate) exception_table: Vec<ExceptionTableEntry>,
    pub(crate) line_numbers: Vec<LineNumberEntry>,
    // per pc: the resolved form of a constant-pool-referencing instruction
    pub(crate) quick: Box<[OnceCell<QuickOp>]>,
    // per pc: fused trace starting there, or a marker that fusion failed
    pub(crate) traces: Box<[OnceCell<TraceSlot>]>,
}

impl Code {
    pub(crate) fn new(
        max_stack: u16,
        max_locals: u16,
        bytecode: Vec<u8>,
        exception_table: Vec<ExceptionTableEntry>,
        line_numbers: Vec<LineNumberEntry>,
    ) -> Code {
        let len = bytecode.len();
        Code {
            max_stack,
            max_locals,
            bytecode: Arc::from(bytecode),
            exception_table,
            line_numbers,
            quick: (0..len).map(|_| OnceCell::new()).collect(),
            traces: (0..len).map(|_| OnceCell::new()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Exception {
    /// Raised by the engine itself; materialized as a heap throwable when it starts unwinding.
    VmException {
        exception_type: Arc<str>,
        message: Option<String>,
        cause: Option<ObjRef>,
    },
    UserException(ObjRef),
}

impl Exception {
    pub fn new_vm(exception_type: &str) -> Self {
        Exception::VmException {
            exception_type: Arc::from(exception_type),
            message: None,
            cause: None,
        }
    }

    pub fn new_vm_msg(exception_type: &str, message: impl Into<String>) -> Self {
        Exception::VmException {
            exception_type: Arc::from(exception_type),
            message: Some(message.into()),
            cause: None,
        }
    }

    pub fn new(exception: ObjRef) -> Self {
        Exception::UserException(exception)
    }

    pub(crate) fn with_cause(self, cause: ObjRef) -> Self {
        match self {
            Exception::VmException {
                exception_type,
                message,
                ..
            } => Exception::VmException {
                exception_type,
                message,
                cause: Some(cause),
            },
            user => user,
        }
    }
}

impl From<nom::Err<nom::error::Error<&str>>> for Exception {
    fn from(err: nom::Err<nom::error::Error<&str>>) -> Self {
        Exception::new_vm_msg(CLASS_FORMAT_ERROR, format!("{err:?}"))
    }
}

pub type NativeResult<T> = ::std::result::Result<T, Exception>;

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_class() -> Arc<Class> {
        Class::new(
            Arc::from("a/A"),
            ClassAccessFlag::PUBLIC,
            LoaderId(0),
            vec![],
            None,
            vec![],
            vec![],
            |_| vec![],
            vec![],
            None,
            None,
        )
    }

    #[test]
    fn test_state_is_monotonic() {
        let class = empty_class();
        assert_eq!(class.state(), ClassState::Loaded);
        class.advance_state(ClassState::Initialized);
        class.advance_state(ClassState::Resolved);
        assert_eq!(class.state(), ClassState::Initialized);
    }

    #[test]
    fn test_package_name() {
        let class = empty_class();
        assert_eq!(class.package_name(), "a");
        assert!(!class.is_array());
    }
}

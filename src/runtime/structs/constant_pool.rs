use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::consts::RefKind;
use crate::descriptor::{FieldDescriptor, MethodDescriptor};
use crate::runtime::{Class, Method, ObjRef, Variable};

/// Runtime constant-pool entry. Every symbolic entry owns a slot that is written at most once;
/// a second resolver that loses the race adopts the value already stored.
#[derive(Debug)]
pub enum ConstantPoolInfo {
    Utf8(Arc<str>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(CpClassInfo),
    String(CpStringInfo),
    NameAndType(CpNameAndTypeInfo<Arc<str>>),
    Fieldref(FieldRef),
    Methodref(MethodRef),
    InterfaceMethodref(MethodRef),
    MethodHandle(CpMethodHandle),
    MethodType(CpMethodType),
    InvokeDynamic(CpInvokeDynamic),
    Empty,
}

impl ConstantPoolInfo {
    pub fn is_resolved(&self) -> bool {
        match self {
            ConstantPoolInfo::Utf8(_)
            | ConstantPoolInfo::Integer(_)
            | ConstantPoolInfo::Float(_)
            | ConstantPoolInfo::Long(_)
            | ConstantPoolInfo::Double(_)
            | ConstantPoolInfo::NameAndType(_)
            | ConstantPoolInfo::Empty => true,
            ConstantPoolInfo::Class(info) => info.class.get().is_some(),
            ConstantPoolInfo::String(info) => info.string.get().is_some(),
            ConstantPoolInfo::Fieldref(field_ref) => field_ref.resolve.get().is_some(),
            ConstantPoolInfo::Methodref(method_ref)
            | ConstantPoolInfo::InterfaceMethodref(method_ref) => method_ref.resolve.get().is_some(),
            ConstantPoolInfo::MethodHandle(handle) => handle.handle.get().is_some(),
            ConstantPoolInfo::MethodType(method_type) => method_type.method_type.get().is_some(),
            ConstantPoolInfo::InvokeDynamic(indy) => indy.bootstrap.get().is_some(),
        }
    }
}

#[derive(Debug)]
pub struct CpClassInfo {
    pub(crate) name: Arc<str>,
    pub(crate) class: OnceCell<Arc<Class>>,
}

impl CpClassInfo {
    pub(crate) fn new(name: Arc<str>) -> Self {
        CpClassInfo {
            name,
            class: OnceCell::new(),
        }
    }

    pub(crate) fn get_or_load_class<E>(
        &self,
        resolver: impl FnOnce() -> Result<Arc<Class>, E>,
    ) -> Result<Arc<Class>, E> {
        Ok(Arc::clone(self.class.get_or_try_init(resolver)?))
    }
}

#[derive(Debug)]
pub struct CpStringInfo {
    pub(crate) value: Arc<str>,
    pub(crate) string: OnceCell<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct CpNameAndTypeInfo<T> {
    pub(crate) name: Arc<str>,
    pub(crate) descriptor: T,
}

#[derive(Debug)]
pub struct FieldRef {
    pub(crate) class_index: u16,
    pub(crate) name_and_type: CpNameAndTypeInfo<FieldDescriptor>,
    pub(crate) resolve: OnceCell<FieldResolve>,
}

#[derive(Debug, Clone)]
pub struct FieldResolve {
    // declaring class
    pub(crate) class: Arc<Class>,
    // instance slot or static slot
    pub(crate) index: usize,
    pub(crate) is_static: bool,
    pub(crate) is_long: bool,
}

#[derive(Debug)]
pub struct MethodRef {
    pub(crate) class_index: u16,
    pub(crate) name_and_type: CpNameAndTypeInfo<MethodDescriptor>,
    pub(crate) raw_descriptor: Arc<str>,
    pub(crate) resolve: OnceCell<Arc<MethodResolve>>,
}

#[derive(Debug)]
pub struct MethodResolve {
    /// First match in the class, then its superclasses, then its interfaces.
    pub(crate) method: Arc<Method>,
    /// Non-abstract interface methods matching the signature, kept apart from class members.
    pub(crate) default_candidates: Vec<Arc<Method>>,
    /// `MethodHandle.invoke*`: the call-site descriptor decides the argument shape.
    pub(crate) polymorphic: bool,
}

#[derive(Debug)]
pub struct CpMethodHandle {
    pub(crate) kind: RefKind,
    pub(crate) reference_index: u16,
    pub(crate) handle: OnceCell<ObjRef>,
}

#[derive(Debug)]
pub struct CpMethodType {
    pub(crate) raw_descriptor: Arc<str>,
    pub(crate) descriptor: MethodDescriptor,
    pub(crate) method_type: OnceCell<ObjRef>,
}

#[derive(Debug)]
pub struct CpInvokeDynamic {
    pub(crate) bootstrap_index: u16,
    pub(crate) name_and_type: CpNameAndTypeInfo<MethodDescriptor>,
    pub(crate) raw_descriptor: Arc<str>,
    pub(crate) bootstrap: OnceCell<Arc<BootstrapSpec>>,
    // keyed by (method index, pc): one slot may back several call sites
    pub(crate) call_sites: Mutex<HashMap<(usize, usize), Arc<CallSiteLink>>>,
}

impl CpInvokeDynamic {
    pub(crate) fn linked(&self, method_index: usize, pc: usize) -> Option<Arc<CallSiteLink>> {
        self.call_sites.lock().get(&(method_index, pc)).cloned()
    }

    /// Records a linkage result; the first result stored for a site wins.
    pub(crate) fn link(
        &self,
        method_index: usize,
        pc: usize,
        link: CallSiteLink,
    ) -> Arc<CallSiteLink> {
        Arc::clone(
            self.call_sites
                .lock()
                .entry((method_index, pc))
                .or_insert_with(|| Arc::new(link)),
        )
    }
}

#[derive(Debug)]
pub struct BootstrapSpec {
    pub(crate) handle: ObjRef,
    pub(crate) method: Arc<Method>,
    pub(crate) static_args: Vec<Variable>,
}

#[derive(Debug)]
pub struct CallSiteLink {
    pub(crate) target: ObjRef,
    pub(crate) method: Arc<Method>,
    pub(crate) kind: RefKind,
    // passed after the call-site arguments
    pub(crate) appendix: Option<ObjRef>,
}

//! Inline caching for instructions that reference the constant pool. The bytecode itself is
//! never rewritten: every pc owns a write-once cell holding the resolved form, and both the
//! first visit and later ones execute that same form.

use std::sync::Arc;

use crate::{
    consts::ClassAccessFlag,
    runtime::{
        CallSiteLink, Class, ConstantPoolInfo, Exception, Flow, Machine, Method, ThreadId,
        famous_classes::{INCOMPATIBLE_CLASS_CHANGE_ERROR, INSTANTIATION_ERROR},
        instructions as inst,
        resolution::Loadable,
    },
};

#[derive(Debug, Clone)]
pub(crate) enum QuickOp {
    GetStatic {
        class: Arc<Class>,
        slot: usize,
        is_long: bool,
    },
    PutStatic {
        class: Arc<Class>,
        slot: usize,
        is_long: bool,
    },
    GetField {
        slot: usize,
        is_long: bool,
    },
    PutField {
        slot: usize,
        is_long: bool,
    },
    InvokeVirtual {
        method: Arc<Method>,
        // slot in the declaring class's vtable, shared by every subclass
        vtable_index: Option<usize>,
    },
    InvokeSpecial {
        method: Arc<Method>,
    },
    InvokeStatic {
        method: Arc<Method>,
    },
    InvokeInterface {
        method: Arc<Method>,
    },
    /// `MethodHandle.invoke*`: `arg_slots` counts the handle and the call-site arguments.
    InvokeHandle {
        arg_slots: usize,
    },
    InvokeDynamic {
        link: Arc<CallSiteLink>,
        arg_slots: usize,
    },
    New {
        class: Arc<Class>,
    },
    ANewArray {
        array_class: Arc<Class>,
    },
    CheckCast {
        class: Arc<Class>,
    },
    InstanceOf {
        class: Arc<Class>,
    },
    MultiANewArray {
        class: Arc<Class>,
        dimensions: u8,
    },
    Ldc(Loadable),
}

impl QuickOp {
    /// Forms that still need a class initialization check are only cached once the class
    /// is initialized, so the cached path never has to run one.
    fn is_cacheable(&self) -> bool {
        match self {
            QuickOp::GetStatic { class, .. }
            | QuickOp::PutStatic { class, .. }
            | QuickOp::New { class } => class.is_initialized(),
            QuickOp::InvokeStatic { method } => method.class().is_initialized(),
            _ => true,
        }
    }
}

fn incompatible(message: String) -> Exception {
    Exception::new_vm_msg(INCOMPATIBLE_CLASS_CHANGE_ERROR, message)
}

pub(crate) fn array_class_name(element: &Class) -> String {
    if element.is_array() {
        format!("[{}", element.class_name)
    } else {
        format!("[L{};", element.class_name)
    }
}

impl Machine {
    /// Resolved form of the instruction at `pc`, from the cache when it is there.
    pub(crate) fn quicken(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        method: &Method,
        pc: usize,
    ) -> Flow<QuickOp> {
        let code = method.code();
        if let Some(quick) = code.quick[pc].get() {
            return Ok(quick.clone());
        }
        let op = code.bytecode[pc];
        let quick = self.resolve_quick(thread, class, method, op, pc)?;
        if self.config.quickening && quick.is_cacheable() && code.quick[pc].set(quick.clone()).is_ok()
        {
            tracing::trace!(
                class = %class.class_name,
                method = %method.name,
                pc,
                op = inst::name(inst::fast_variant(op).unwrap_or(op)),
                "instruction quickened"
            );
        }
        Ok(quick)
    }

    fn resolve_quick(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        method: &Method,
        op: u8,
        pc: usize,
    ) -> Flow<QuickOp> {
        let bytecode = &method.code().bytecode;
        let index = u16::from_be_bytes([bytecode[pc + 1], bytecode[pc + 2]]);
        Ok(match op {
            inst::GETSTATIC | inst::PUTSTATIC => {
                let field = self.resolve_field_ref(thread, class, index, true)?;
                if op == inst::GETSTATIC {
                    QuickOp::GetStatic {
                        class: field.class,
                        slot: field.index,
                        is_long: field.is_long,
                    }
                } else {
                    QuickOp::PutStatic {
                        class: field.class,
                        slot: field.index,
                        is_long: field.is_long,
                    }
                }
            }
            inst::GETFIELD => {
                let field = self.resolve_field_ref(thread, class, index, false)?;
                QuickOp::GetField {
                    slot: field.index,
                    is_long: field.is_long,
                }
            }
            inst::PUTFIELD => {
                let field = self.resolve_field_ref(thread, class, index, false)?;
                QuickOp::PutField {
                    slot: field.index,
                    is_long: field.is_long,
                }
            }
            inst::INVOKEVIRTUAL => {
                let resolved = self.resolve_method_ref(thread, class, index)?;
                if resolved.polymorphic {
                    return Ok(QuickOp::InvokeHandle {
                        arg_slots: call_site_slots(class, index) + 1,
                    });
                }
                let method = Arc::clone(&resolved.method);
                if method.is_static() {
                    return Err(incompatible(format!(
                        "Expecting non-static method {}.{}{}",
                        method.class_name, method.name, method.raw_descriptor
                    ))
                    .into());
                }
                let vtable_index = method.class().linkage.get().and_then(|linkage| {
                    linkage
                        .vtable_index
                        .get(&(Arc::clone(&method.name), Arc::clone(&method.raw_descriptor)))
                        .copied()
                });
                QuickOp::InvokeVirtual {
                    method,
                    vtable_index,
                }
            }
            inst::INVOKESPECIAL => {
                let resolved = self.resolve_method_ref(thread, class, index)?;
                let method = &resolved.method;
                if method.is_static() {
                    return Err(incompatible(format!(
                        "Expecting non-static method {}.{}{}",
                        method.class_name, method.name, method.raw_descriptor
                    ))
                    .into());
                }
                QuickOp::InvokeSpecial {
                    method: select_special(class, method, &resolved.default_candidates),
                }
            }
            inst::INVOKESTATIC => {
                let resolved = self.resolve_method_ref(thread, class, index)?;
                if !resolved.method.is_static() {
                    return Err(incompatible(format!(
                        "Expected static method {}.{}{}",
                        resolved.method.class_name,
                        resolved.method.name,
                        resolved.method.raw_descriptor
                    ))
                    .into());
                }
                QuickOp::InvokeStatic {
                    method: Arc::clone(&resolved.method),
                }
            }
            inst::INVOKEINTERFACE => {
                let resolved = self.resolve_method_ref(thread, class, index)?;
                QuickOp::InvokeInterface {
                    method: Arc::clone(&resolved.method),
                }
            }
            inst::INVOKEDYNAMIC => {
                let link = self.link_call_site(thread, class, method, index, pc)?;
                let arg_slots = match class.get_constant(index) {
                    ConstantPoolInfo::InvokeDynamic(indy) => {
                        indy.name_and_type.descriptor.param_slots()
                    }
                    _ => 0,
                };
                QuickOp::InvokeDynamic { link, arg_slots }
            }
            inst::NEW => {
                let target = self.resolve_class_ref(thread, class, index)?;
                if target.is_array()
                    || target
                        .access_flags
                        .intersects(ClassAccessFlag::INTERFACE | ClassAccessFlag::ABSTRACT)
                {
                    return Err(Exception::new_vm_msg(
                        INSTANTIATION_ERROR,
                        target.class_name.replace('/', "."),
                    )
                    .into());
                }
                QuickOp::New { class: target }
            }
            inst::ANEWARRAY => {
                let element = self.resolve_class_ref(thread, class, index)?;
                let array_class =
                    self.load_and_link(Some(thread), element.loader, &array_class_name(&element))?;
                QuickOp::ANewArray { array_class }
            }
            inst::CHECKCAST => QuickOp::CheckCast {
                class: self.resolve_class_ref(thread, class, index)?,
            },
            inst::INSTANCEOF => QuickOp::InstanceOf {
                class: self.resolve_class_ref(thread, class, index)?,
            },
            inst::MULTIANEWARRAY => QuickOp::MultiANewArray {
                class: self.resolve_class_ref(thread, class, index)?,
                dimensions: bytecode[pc + 3],
            },
            inst::LDC => QuickOp::Ldc(self.resolve_loadable(thread, class, bytecode[pc + 1] as u16)?),
            inst::LDC_W => QuickOp::Ldc(self.resolve_loadable(thread, class, index)?),
            other => panic!("{} has no quickened form", inst::name(other)),
        })
    }
}

fn call_site_slots(class: &Class, index: u16) -> usize {
    match class.get_constant(index) {
        ConstantPoolInfo::Methodref(method_ref) | ConstantPoolInfo::InterfaceMethodref(method_ref) => {
            method_ref.name_and_type.descriptor.param_slots()
        }
        _ => 0,
    }
}

/// `invokespecial` of a superclass member starts the lookup at the caller's superclass, so that
/// an override between the two is honoured.
fn select_special(
    current: &Arc<Class>,
    method: &Arc<Method>,
    default_candidates: &[Arc<Method>],
) -> Arc<Method> {
    let owner = method.class();
    if method.name.as_ref() == "<init>"
        || method.is_private()
        || owner.is_interface()
        || Arc::ptr_eq(&owner, current)
        || !current.access_flags.contains(ClassAccessFlag::SUPER)
    {
        return Arc::clone(method);
    }
    current
        .super_class()
        .and_then(|super_class| super_class.find_method(&method.name, &method.raw_descriptor))
        .or_else(|| default_candidates.first().cloned())
        .unwrap_or_else(|| Arc::clone(method))
}

//! Constant-pool resolution. Every symbolic entry resolves at most once: the first successful
//! result is stored in the entry's slot and later lookups read it back. A resolution that has
//! to wait for a class load leaves the slot empty, so retrying after resume is harmless.

use std::sync::Arc;

use crate::{
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag},
    runtime::{
        BootstrapSpec, Class, ConstantPoolInfo, Exception, FieldResolve, Flow, Machine, Method,
        MethodResolve, ObjRef, ThreadId, Variable,
        famous_classes::{
            CLASS_FORMAT_ERROR, ILLEGAL_ACCESS_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR,
            INTERNAL_ERROR, NO_SUCH_FIELD_ERROR, NO_SUCH_METHOD_ERROR,
        },
    },
};

const POLYMORPHIC_METHODS: [&str; 3] = ["invoke", "invokeExact", "invokeBasic"];

/// Value pushed by `ldc` and passed as a bootstrap static argument.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum Loadable {
    One(Variable),
    Two(Variable, Variable),
}

impl Loadable {
    pub(crate) fn push_to(self, stack: &mut Vec<Variable>) {
        match self {
            Loadable::One(v) => stack.push(v),
            Loadable::Two(upper, lower) => {
                stack.push(upper);
                stack.push(lower);
            }
        }
    }
}

fn bad_constant(class: &Class, index: u16, expected: &str) -> Exception {
    Exception::new_vm_msg(
        CLASS_FORMAT_ERROR,
        format!(
            "constant {index} of {} is not a {expected} entry",
            class.class_name
        ),
    )
}

/// Superinterfaces of `class` and of all its superclasses, nearest first, without duplicates.
pub(crate) fn all_interfaces(class: &Arc<Class>) -> Vec<Arc<Class>> {
    let mut result: Vec<Arc<Class>> = vec![];
    let mut current = Some(class);
    while let Some(class) = current {
        let mut pending: Vec<Arc<Class>> = class.interfaces().to_vec();
        while let Some(interface) = pending.pop() {
            if result.iter().any(|i| i.class_name == interface.class_name) {
                continue;
            }
            pending.extend(interface.interfaces().iter().cloned());
            result.push(interface);
        }
        current = class.super_class();
    }
    result
}

fn is_accessible(current: &Class, target: &Class) -> bool {
    if target.access_flags.contains(ClassAccessFlag::PUBLIC) {
        return true;
    }
    current.package_name() == target.package_name() && current.loader == target.loader
}

impl Machine {
    pub(crate) fn resolve_class_ref(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        index: u16,
    ) -> Flow<Arc<Class>> {
        let ConstantPoolInfo::Class(info) = class.get_constant(index) else {
            return Err(bad_constant(class, index, "Class").into());
        };
        if let Some(resolved) = info.class.get() {
            return Ok(Arc::clone(resolved));
        }
        if info.name == class.class_name {
            return info.get_or_load_class(|| Ok(Arc::clone(class)));
        }
        let target = self.load_and_link(Some(thread), class.loader, &info.name)?;
        let checked = match &target.array_element {
            Some(_) => innermost_element(&target),
            None => Some(Arc::clone(&target)),
        };
        if let Some(checked) = checked {
            if !is_accessible(class, &checked) {
                return Err(Exception::new_vm_msg(
                    ILLEGAL_ACCESS_ERROR,
                    format!(
                        "class {} cannot access its superclass or member {}",
                        class.class_name, checked.class_name
                    ),
                )
                .into());
            }
        }
        tracing::debug!(class = %class.class_name, index, target = %target.class_name, "class ref resolved");
        info.get_or_load_class(|| Ok(target))
    }

    pub(crate) fn resolve_field_ref(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        index: u16,
        is_static: bool,
    ) -> Flow<FieldResolve> {
        let ConstantPoolInfo::Fieldref(field_ref) = class.get_constant(index) else {
            return Err(bad_constant(class, index, "Fieldref").into());
        };
        if let Some(resolved) = field_ref.resolve.get() {
            return check_static(resolved, is_static, &field_ref.name_and_type.name).map(|_| resolved.clone());
        }
        let owner = self.resolve_class_ref(thread, class, field_ref.class_index)?;
        let name = &field_ref.name_and_type.name;
        let descriptor = &field_ref.name_and_type.descriptor;
        let Some(resolved) = find_field(&owner, name, descriptor) else {
            return Err(Exception::new_vm_msg(NO_SUCH_FIELD_ERROR, name.to_string()).into());
        };
        check_static(&resolved, is_static, name)?;
        tracing::debug!(class = %class.class_name, field = %name, declaring = %resolved.class.class_name, "field ref resolved");
        Ok(field_ref.resolve.get_or_init(|| resolved).clone())
    }

    pub(crate) fn resolve_method_ref(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        index: u16,
    ) -> Flow<Arc<MethodResolve>> {
        let (method_ref, interface_ref) = match class.get_constant(index) {
            ConstantPoolInfo::Methodref(method_ref) => (method_ref, false),
            ConstantPoolInfo::InterfaceMethodref(method_ref) => (method_ref, true),
            _ => return Err(bad_constant(class, index, "Methodref").into()),
        };
        if let Some(resolved) = method_ref.resolve.get() {
            return Ok(Arc::clone(resolved));
        }
        let owner = self.resolve_class_ref(thread, class, method_ref.class_index)?;
        if owner.is_interface() != interface_ref && !owner.is_array() {
            let message = if interface_ref {
                format!("Found class {}, but interface was expected", owner.class_name)
            } else {
                format!("Found interface {}, but class was expected", owner.class_name)
            };
            return Err(Exception::new_vm_msg(INCOMPATIBLE_CLASS_CHANGE_ERROR, message).into());
        }
        let name = &method_ref.name_and_type.name;
        let descriptor = &method_ref.raw_descriptor;
        let resolved = lookup_method(&owner, name, descriptor).ok_or_else(|| {
            Exception::new_vm_msg(
                NO_SUCH_METHOD_ERROR,
                format!("{}.{name}{descriptor}", owner.class_name.replace('/', ".")),
            )
        })?;
        tracing::debug!(
            class = %class.class_name,
            method = %name,
            declaring = %resolved.method.class_name,
            polymorphic = resolved.polymorphic,
            "method ref resolved"
        );
        Ok(Arc::clone(
            method_ref.resolve.get_or_init(|| Arc::new(resolved)),
        ))
    }

    pub(crate) fn resolve_string(&mut self, class: &Arc<Class>, index: u16) -> Flow<ObjRef> {
        let ConstantPoolInfo::String(info) = class.get_constant(index) else {
            return Err(bad_constant(class, index, "String").into());
        };
        if let Some(string) = info.string.get() {
            return Ok(*string);
        }
        let string = self.intern(&info.value);
        Ok(*info.string.get_or_init(|| string))
    }

    pub(crate) fn resolve_method_type(&mut self, class: &Arc<Class>, index: u16) -> Flow<ObjRef> {
        let ConstantPoolInfo::MethodType(info) = class.get_constant(index) else {
            return Err(bad_constant(class, index, "MethodType").into());
        };
        if let Some(method_type) = info.method_type.get() {
            return Ok(*method_type);
        }
        let method_type = self.new_method_type(Arc::clone(&info.raw_descriptor));
        Ok(*info.method_type.get_or_init(|| method_type))
    }

    pub(crate) fn resolve_method_handle(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        index: u16,
    ) -> Flow<ObjRef> {
        let ConstantPoolInfo::MethodHandle(info) = class.get_constant(index) else {
            return Err(bad_constant(class, index, "MethodHandle").into());
        };
        if let Some(handle) = info.handle.get() {
            return Ok(*handle);
        }
        if info.kind.is_field() {
            return Err(Exception::new_vm_msg(
                INTERNAL_ERROR,
                format!("field method handles are not supported ({:?})", info.kind),
            )
            .into());
        }
        let resolved = self.resolve_method_ref(thread, class, info.reference_index)?;
        let handle = self.new_method_handle(info.kind, Arc::clone(&resolved.method), None);
        Ok(*info.handle.get_or_init(|| handle))
    }

    /// Bootstrap method handle and static arguments of an `invokedynamic` entry.
    pub(crate) fn resolve_bootstrap(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        index: u16,
    ) -> Flow<Arc<BootstrapSpec>> {
        let ConstantPoolInfo::InvokeDynamic(indy) = class.get_constant(index) else {
            return Err(bad_constant(class, index, "InvokeDynamic").into());
        };
        if let Some(bootstrap) = indy.bootstrap.get() {
            return Ok(Arc::clone(bootstrap));
        }
        let Some(entry) = class.bootstrap_methods.get(indy.bootstrap_index as usize) else {
            return Err(Exception::new_vm_msg(
                CLASS_FORMAT_ERROR,
                format!(
                    "bootstrap method {} missing in {}",
                    indy.bootstrap_index, class.class_name
                ),
            )
            .into());
        };
        let handle = self.resolve_method_handle(thread, class, entry.method_ref)?;
        let method = match self.heap.method_handle(handle) {
            Some((_, method, _)) => Arc::clone(method),
            None => return Err(bad_constant(class, entry.method_ref, "MethodHandle").into()),
        };
        let mut static_args = vec![];
        for &argument in &entry.arguments {
            self.resolve_loadable(thread, class, argument)?
                .push_to(&mut static_args);
        }
        Ok(Arc::clone(indy.bootstrap.get_or_init(|| {
            Arc::new(BootstrapSpec {
                handle,
                method,
                static_args,
            })
        })))
    }

    /// Anything `ldc` may push.
    pub(crate) fn resolve_loadable(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        index: u16,
    ) -> Flow<Loadable> {
        Ok(match class.get_constant(index) {
            ConstantPoolInfo::Integer(i) => Loadable::One(Variable::from_int(*i)),
            ConstantPoolInfo::Float(f) => Loadable::One(Variable::from_float(*f)),
            ConstantPoolInfo::Long(l) => {
                let (upper, lower) = Variable::put_long(*l);
                Loadable::Two(upper, lower)
            }
            ConstantPoolInfo::Double(d) => {
                let (upper, lower) = Variable::put_double(*d);
                Loadable::Two(upper, lower)
            }
            ConstantPoolInfo::String(_) => {
                Loadable::One(Variable::from_ref(self.resolve_string(class, index)?))
            }
            ConstantPoolInfo::Class(_) => {
                let target = self.resolve_class_ref(thread, class, index)?;
                Loadable::One(Variable::from_ref(self.class_mirror(&target)))
            }
            ConstantPoolInfo::MethodType(_) => {
                Loadable::One(Variable::from_ref(self.resolve_method_type(class, index)?))
            }
            ConstantPoolInfo::MethodHandle(_) => Loadable::One(Variable::from_ref(
                self.resolve_method_handle(thread, class, index)?,
            )),
            _ => return Err(bad_constant(class, index, "loadable").into()),
        })
    }
}

fn innermost_element(class: &Arc<Class>) -> Option<Arc<Class>> {
    let mut current = Arc::clone(class);
    loop {
        match &current.array_element {
            Some(crate::runtime::ArrayElement::Reference(element)) => {
                let element = Arc::clone(element);
                current = element;
            }
            Some(crate::runtime::ArrayElement::Primitive(_)) => return None,
            None => return Some(current),
        }
    }
}

fn check_static(resolved: &FieldResolve, is_static: bool, name: &str) -> Flow<()> {
    if resolved.is_static == is_static {
        return Ok(());
    }
    let message = if is_static {
        format!("Expected static field {}.{name}", resolved.class.class_name)
    } else {
        format!("Expected non-static field {}.{name}", resolved.class.class_name)
    };
    Err(Exception::new_vm_msg(INCOMPATIBLE_CLASS_CHANGE_ERROR, message).into())
}

/// Declared fields first, then superinterfaces, then the superclass.
fn find_field(
    class: &Arc<Class>,
    name: &str,
    descriptor: &crate::descriptor::FieldDescriptor,
) -> Option<FieldResolve> {
    if let Some(field) = class
        .fields
        .iter()
        .find(|f| f.name.as_ref() == name && &f.descriptor == descriptor)
    {
        let is_long = field.descriptor.0.is_long();
        if field.access_flags.contains(FieldAccessFlag::STATIC) {
            return Some(FieldResolve {
                class: Arc::clone(class),
                index: field.static_slot?,
                is_static: true,
                is_long,
            });
        }
        let slot = class
            .linkage()
            .instance_fields
            .iter()
            .find(|f| f.declaring_class == class.class_name && f.name.as_ref() == name)?
            .slot;
        return Some(FieldResolve {
            class: Arc::clone(class),
            index: slot,
            is_static: false,
            is_long,
        });
    }
    for interface in class.interfaces() {
        if let Some(found) = find_field(interface, name, descriptor) {
            return Some(found);
        }
    }
    find_field(class.super_class()?, name, descriptor)
}

fn lookup_method(owner: &Arc<Class>, name: &str, descriptor: &str) -> Option<MethodResolve> {
    if owner.class_name.as_ref() == "java/lang/invoke/MethodHandle"
        && POLYMORPHIC_METHODS.contains(&name)
    {
        let method = owner.methods.iter().find(|m| m.name.as_ref() == name)?;
        return Some(MethodResolve {
            method: Arc::clone(method),
            default_candidates: vec![],
            polymorphic: true,
        });
    }

    let interfaces = all_interfaces(owner);
    let default_candidates: Vec<Arc<Method>> = interfaces
        .iter()
        .filter_map(|i| i.find_declared_method(name, descriptor))
        .filter(|m| !m.is_abstract() && !m.is_static() && !m.is_private())
        .cloned()
        .collect();

    let method = owner.find_method(name, descriptor).or_else(|| {
        // prefer a default body over an abstract declaration
        let declared: Vec<&Arc<Method>> = interfaces
            .iter()
            .filter_map(|i| i.find_declared_method(name, descriptor))
            .filter(|m| !m.access_flags.contains(MethodAccessFlag::PRIVATE))
            .collect();
        declared
            .iter()
            .find(|m| !m.is_abstract())
            .or_else(|| declared.first())
            .map(|m| Arc::clone(m))
    })?;
    Some(MethodResolve {
        method,
        default_candidates,
        polymorphic: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        VmConfig,
        class::builder::{Assembler, ClassFileBuilder},
        consts::RefKind,
        runtime::{LoaderId, MapProvider, Next, instructions as inst},
    };

    fn machine(provider: MapProvider) -> (Machine, ThreadId) {
        let mut vm = Machine::new(VmConfig::default(), provider).unwrap();
        let thread = vm.spawn_thread("main");
        vm.wake(thread);
        (vm, thread)
    }

    fn thrown_type(flow: Flow<impl std::fmt::Debug>) -> String {
        match flow {
            Err(Next::Throw(Exception::VmException { exception_type, .. })) => {
                exception_type.to_string()
            }
            other => panic!("expected a throwable, got {other:?}"),
        }
    }

    #[test]
    fn test_field_lookup_order() {
        let mut i = ClassFileBuilder::new("t/I");
        i.access(ClassAccessFlag::PUBLIC | ClassAccessFlag::INTERFACE | ClassAccessFlag::ABSTRACT)
            .field(FieldAccessFlag::PUBLIC | FieldAccessFlag::STATIC, "K", "I");
        let mut base = ClassFileBuilder::new("t/Base");
        base.field(FieldAccessFlag::PUBLIC, "x", "J");
        let mut user = ClassFileBuilder::new("t/User");
        user.super_class("t/Base").interface("t/I");
        let x = user.field_ref("t/User", "x", "J");
        let k = user.field_ref("t/User", "K", "I");
        let missing = user.field_ref("t/User", "nope", "I");
        let (mut vm, thread) = machine(
            MapProvider::new()
                .with(i.build())
                .with(base.build())
                .with(user.build()),
        );
        let user = vm
            .load_and_link(Some(thread), LoaderId::BOOTSTRAP, "t/User")
            .unwrap();

        let field = vm.resolve_field_ref(thread, &user, x, false).unwrap();
        assert_eq!(field.class.name(), "t/Base");
        assert!(field.is_long);
        assert_eq!(field.index, 0);
        let field = vm.resolve_field_ref(thread, &user, k, true).unwrap();
        assert_eq!(field.class.name(), "t/I");

        assert_eq!(
            thrown_type(vm.resolve_field_ref(thread, &user, x, true)),
            INCOMPATIBLE_CLASS_CHANGE_ERROR
        );
        assert_eq!(
            thrown_type(vm.resolve_field_ref(thread, &user, missing, false)),
            NO_SUCH_FIELD_ERROR
        );
        // a failed lookup stores nothing and fails the same way next time
        assert!(!user.get_constant(missing).is_resolved());
        assert_eq!(
            thrown_type(vm.resolve_field_ref(thread, &user, missing, false)),
            NO_SUCH_FIELD_ERROR
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut a = ClassFileBuilder::new("t/A");
        let mut asm = Assembler::new(0);
        asm.op(inst::RETURN);
        a.method(MethodAccessFlag::PUBLIC | MethodAccessFlag::STATIC, "f", "()V", asm.finish().unwrap());
        let f = a.method_ref("t/A", "f", "()V");
        let s = a.string("hi");
        let (mut vm, thread) = machine(MapProvider::new().with(a.build()));
        let a = vm
            .load_and_link(Some(thread), LoaderId::BOOTSTRAP, "t/A")
            .unwrap();

        let first = vm.resolve_method_ref(thread, &a, f).unwrap();
        let second = vm.resolve_method_ref(thread, &a, f).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(a.get_constant(f).is_resolved());

        let s1 = vm.resolve_string(&a, s).unwrap();
        let s2 = vm.resolve_string(&a, s).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1, vm.intern("hi"));
    }

    #[test]
    fn test_interface_ref_to_class() {
        let mut a = ClassFileBuilder::new("t/A");
        let bad = a.interface_method_ref("t/A", "f", "()V");
        let (mut vm, thread) = machine(MapProvider::new().with(a.build()));
        let a = vm
            .load_and_link(Some(thread), LoaderId::BOOTSTRAP, "t/A")
            .unwrap();
        assert_eq!(
            thrown_type(vm.resolve_method_ref(thread, &a, bad)),
            INCOMPATIBLE_CLASS_CHANGE_ERROR
        );
    }

    #[test]
    fn test_default_candidates_recorded_apart() {
        let mut i = ClassFileBuilder::new("t/I");
        i.access(ClassAccessFlag::PUBLIC | ClassAccessFlag::INTERFACE | ClassAccessFlag::ABSTRACT);
        let mut asm = Assembler::new(1);
        asm.op(inst::RETURN);
        i.method(MethodAccessFlag::PUBLIC, "run", "()V", asm.finish().unwrap());
        let mut a = ClassFileBuilder::new("t/A");
        a.interface("t/I");
        let mut asm = Assembler::new(1);
        asm.op(inst::RETURN);
        a.method(MethodAccessFlag::PUBLIC, "run", "()V", asm.finish().unwrap());
        let run = a.method_ref("t/A", "run", "()V");
        let (mut vm, thread) = machine(MapProvider::new().with(i.build()).with(a.build()));
        let a = vm
            .load_and_link(Some(thread), LoaderId::BOOTSTRAP, "t/A")
            .unwrap();
        let resolved = vm.resolve_method_ref(thread, &a, run).unwrap();
        assert_eq!(resolved.method.class_name.as_ref(), "t/A");
        assert_eq!(resolved.default_candidates.len(), 1);
        assert_eq!(resolved.default_candidates[0].class_name.as_ref(), "t/I");
    }

    #[test]
    fn test_private_class_from_other_package() {
        let mut hidden = ClassFileBuilder::new("p/Hidden");
        hidden.access(ClassAccessFlag::SUPER);
        let mut user = ClassFileBuilder::new("q/User");
        let index = user.class("p/Hidden");
        let (mut vm, thread) = machine(MapProvider::new().with(hidden.build()).with(user.build()));
        let user = vm
            .load_and_link(Some(thread), LoaderId::BOOTSTRAP, "q/User")
            .unwrap();
        assert_eq!(
            thrown_type(vm.resolve_class_ref(thread, &user, index)),
            ILLEGAL_ACCESS_ERROR
        );
    }

    #[test]
    fn test_method_handle_constant() {
        let mut a = ClassFileBuilder::new("t/A");
        let mut asm = Assembler::new(0);
        asm.op(inst::RETURN);
        a.method(MethodAccessFlag::PUBLIC | MethodAccessFlag::STATIC, "f", "()V", asm.finish().unwrap());
        let f = a.method_ref("t/A", "f", "()V");
        let handle = a.method_handle(RefKind::InvokeStatic, f);
        let field = a.field_ref("t/A", "x", "I");
        let field_handle = a.method_handle(RefKind::GetStatic, field);
        let (mut vm, thread) = machine(MapProvider::new().with(a.build()));
        let a = vm
            .load_and_link(Some(thread), LoaderId::BOOTSTRAP, "t/A")
            .unwrap();
        let Loadable::One(value) = vm.resolve_loadable(thread, &a, handle).unwrap() else {
            panic!("handles take one slot");
        };
        let (kind, method, appendix) = vm.heap.method_handle(value.reference()).unwrap();
        assert_eq!(kind, RefKind::InvokeStatic);
        assert_eq!(method.name(), "f");
        assert!(appendix.is_none());
        assert_eq!(
            thrown_type(vm.resolve_method_handle(thread, &a, field_handle)),
            INTERNAL_ERROR
        );
    }
}

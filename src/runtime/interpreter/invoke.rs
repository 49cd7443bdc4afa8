use std::sync::Arc;

use crate::{
    consts::RefKind,
    runtime::{
        CallSiteLink, Class, ConstantPoolInfo, Exception, Flow, Frame, Machine, Method, NULL,
        NativeVariable, Next, ObjRef, ThreadId, Variable,
        famous_classes::{
            ABSTRACT_METHOD_ERROR, BOOTSTRAP_METHOD_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR,
            INTERNAL_ERROR, UNSATISFIED_LINK_ERROR,
        },
        inheritance::is_assignable_to,
        interpreter::{
            ContinuationFrame, FrameLock, InterpretedFrame, InterpreterEnv, NativeFrame, QuickOp,
        },
        native::null_pointer,
    },
};

fn bootstrap_error(message: impl Into<String>) -> Exception {
    Exception::new_vm_msg(BOOTSTRAP_METHOD_ERROR, message)
}

impl Machine {
    /// Frame for a call to `method` with its argument slots, receiver first.
    pub(crate) fn build_frame(
        &mut self,
        method: Arc<Method>,
        args: Vec<Variable>,
    ) -> Result<Frame, Exception> {
        if method.is_abstract() {
            return Err(Exception::new_vm_msg(
                ABSTRACT_METHOD_ERROR,
                format!(
                    "{}.{}{}",
                    method.class_name.replace('/', "."),
                    method.name,
                    method.raw_descriptor
                ),
            ));
        }
        let lock = if method.is_synchronized() {
            let object = if method.is_static() {
                self.class_mirror(&method.class())
            } else {
                args[0].reference()
            };
            FrameLock::Pending(object)
        } else {
            FrameLock::None
        };
        if !method.is_native() {
            return Ok(Frame::Interpreted(InterpretedFrame::new(method, &args, lock)));
        }

        let function = *method.native.get_or_try_init(|| {
            self.natives
                .lookup(&method.class_name, &method.name, &method.raw_descriptor)
                .ok_or_else(|| {
                    Exception::new_vm_msg(
                        UNSATISFIED_LINK_ERROR,
                        format!(
                            "{}.{}{}",
                            method.class_name.replace('/', "."),
                            method.name,
                            method.raw_descriptor
                        ),
                    )
                })
        })?;
        let mut native_args = Vec::with_capacity(method.descriptor.parameters.len() + 1);
        let mut at = 0;
        if !method.is_static() {
            native_args.push(NativeVariable::Reference(args[0].reference()));
            at = 1;
        }
        for param in &method.descriptor.parameters {
            native_args.push(NativeVariable::from_slots(param, &args, &mut at));
        }
        Ok(Frame::Native(NativeFrame {
            method,
            function,
            args: native_args,
            resumed: false,
            lock,
        }))
    }

    /// Runs the bootstrap method of the `invokedynamic` at `pc` unless that site is linked
    /// already. The instruction runs again once the bootstrap frame has returned.
    pub(crate) fn link_call_site(
        &mut self,
        thread: ThreadId,
        class: &Arc<Class>,
        method: &Method,
        index: u16,
        pc: usize,
    ) -> Flow<Arc<CallSiteLink>> {
        let ConstantPoolInfo::InvokeDynamic(indy) = class.get_constant(index) else {
            return Err(bootstrap_error(format!(
                "constant {index} of {} is not an invokedynamic entry",
                class.class_name
            ))
            .into());
        };
        if let Some(link) = indy.linked(method.index, pc) {
            return Ok(link);
        }
        let bootstrap = self.resolve_bootstrap(thread, class, index)?;
        let bootstrap_method = Arc::clone(&bootstrap.method);
        if !bootstrap_method.is_static() {
            return Err(bootstrap_error(format!(
                "bootstrap method {}.{} is not static",
                bootstrap_method.class_name, bootstrap_method.name
            ))
            .into());
        }
        self.ensure_initialized(thread, &bootstrap_method.class())?;

        let name = self.intern(&indy.name_and_type.name);
        let method_type = self.new_method_type(Arc::clone(&indy.raw_descriptor));
        // no lookup object is modelled, the first argument is always null
        let mut args = vec![
            Variable::from_ref(NULL),
            Variable::from_ref(name),
            Variable::from_ref(method_type),
        ];
        args.extend_from_slice(&bootstrap.static_args);
        if args.len() != bootstrap_method.arg_slots {
            return Err(bootstrap_error(format!(
                "bootstrap method {}.{}{} takes {} slots, call site supplies {}",
                bootstrap_method.class_name,
                bootstrap_method.name,
                bootstrap_method.raw_descriptor,
                bootstrap_method.arg_slots,
                args.len()
            ))
            .into());
        }
        tracing::debug!(
            class = %class.class_name,
            method = %method.name,
            pc,
            bootstrap = %bootstrap_method.name,
            "linking call site"
        );
        let frame = self.build_frame(bootstrap_method, args)?;
        Err(Next::Push(vec![
            Frame::Continuation(ContinuationFrame::IndyLink {
                class: Arc::clone(class),
                cp_index: index,
                method_index: method.index,
                pc,
            }),
            frame,
        ]))
    }

    /// Stores what a bootstrap method returned: a call site or a bare method handle.
    pub(crate) fn finish_call_site(
        &mut self,
        class: &Arc<Class>,
        cp_index: u16,
        method_index: usize,
        pc: usize,
        result: ObjRef,
    ) -> Result<(), Exception> {
        if result == NULL {
            return Err(bootstrap_error("bootstrap method returned null"));
        }
        let handle = if self.heap.method_handle(result).is_some() {
            result
        } else {
            let call_site = Arc::clone(&self.famous().call_site);
            let actual = Arc::clone(self.heap.class_of(result));
            let slot = call_site
                .instance_field("target")
                .map(|field| field.slot)
                .filter(|_| is_assignable_to(&actual, &call_site))
                .ok_or_else(|| {
                    bootstrap_error(format!(
                        "bootstrap method returned a {}, not a call site",
                        actual.class_name
                    ))
                })?;
            self.heap.get_field(result, slot).reference()
        };
        let Some((kind, method, appendix)) = self.heap.method_handle(handle) else {
            return Err(bootstrap_error("call site has no target"));
        };
        let link = CallSiteLink {
            target: handle,
            method: Arc::clone(method),
            kind,
            appendix,
        };
        let ConstantPoolInfo::InvokeDynamic(indy) = class.get_constant(cp_index) else {
            unreachable!("call site linked against a non-invokedynamic constant");
        };
        let link = indy.link(method_index, pc, link);
        tracing::debug!(
            class = %class.class_name,
            pc,
            target = %link.method.name,
            "call site linked"
        );
        Ok(())
    }
}

impl InterpreterEnv<'_, '_> {
    /// Frame for the invoke instruction at pc. Arguments leave the operand stack only once
    /// nothing can suspend any more.
    pub(super) fn invoke(&mut self) -> Flow<Frame> {
        match self.quicken()? {
            QuickOp::InvokeStatic { method } => {
                self.machine.ensure_initialized(self.thread, &method.class())?;
                let args = self.frame.pop_n(method.arg_slots);
                Ok(self.machine.build_frame(method, args)?)
            }
            QuickOp::InvokeSpecial { method } => {
                if self.frame.peek_receiver(method.arg_slots) == NULL {
                    return Err(null_pointer().into());
                }
                let args = self.frame.pop_n(method.arg_slots);
                Ok(self.machine.build_frame(method, args)?)
            }
            QuickOp::InvokeVirtual {
                method,
                vtable_index,
            } => {
                let receiver = self.frame.peek_receiver(method.arg_slots);
                if receiver == NULL {
                    return Err(null_pointer().into());
                }
                let target = if method.is_private() {
                    method
                } else {
                    let class = self.machine.heap.class_of(receiver);
                    vtable_index
                        .and_then(|i| class.virtual_method(i))
                        .filter(|m| {
                            m.name == method.name && m.raw_descriptor == method.raw_descriptor
                        })
                        .or_else(|| class.find_virtual(&method.name, &method.raw_descriptor))
                        .cloned()
                        .unwrap_or(method)
                };
                let args = self.frame.pop_n(target.arg_slots);
                Ok(self.machine.build_frame(target, args)?)
            }
            QuickOp::InvokeInterface { method } => {
                let receiver = self.frame.peek_receiver(method.arg_slots);
                if receiver == NULL {
                    return Err(null_pointer().into());
                }
                let class = self.machine.heap.class_of(receiver);
                let interface = method.class();
                if !is_assignable_to(class, &interface) {
                    return Err(Exception::new_vm_msg(
                        INCOMPATIBLE_CLASS_CHANGE_ERROR,
                        format!(
                            "class {} does not implement the requested interface {}",
                            class.class_name.replace('/', "."),
                            interface.class_name.replace('/', ".")
                        ),
                    )
                    .into());
                }
                let target = if method.is_private() {
                    method
                } else {
                    class
                        .find_virtual(&method.name, &method.raw_descriptor)
                        .cloned()
                        .unwrap_or(method)
                };
                let args = self.frame.pop_n(target.arg_slots);
                Ok(self.machine.build_frame(target, args)?)
            }
            QuickOp::InvokeHandle { arg_slots } => {
                let handle = self.frame.peek_receiver(arg_slots);
                if handle == NULL {
                    return Err(null_pointer().into());
                }
                let Some((kind, method, appendix)) = self.machine.heap.method_handle(handle) else {
                    return Err(Exception::new_vm_msg(
                        INTERNAL_ERROR,
                        "invoke on an object that is not a method handle",
                    )
                    .into());
                };
                let method = Arc::clone(method);
                self.prepare_target(kind, &method)?;
                let mut args = self.frame.pop_n(arg_slots);
                args.remove(0);
                self.call_target(kind, method, appendix, args)
            }
            QuickOp::InvokeDynamic { link, arg_slots } => {
                let method = Arc::clone(&link.method);
                self.prepare_target(link.kind, &method)?;
                let args = self.frame.pop_n(arg_slots);
                self.call_target(link.kind, method, link.appendix, args)
            }
            other => unreachable!("{other:?} is not an invocation"),
        }
    }

    fn prepare_target(&mut self, kind: RefKind, method: &Method) -> Flow<()> {
        match kind {
            RefKind::InvokeStatic | RefKind::NewInvokeSpecial => {
                self.machine.ensure_initialized(self.thread, &method.class())
            }
            _ => Ok(()),
        }
    }

    /// Calls a method handle target with the call-site arguments and the bound appendix.
    fn call_target(
        &mut self,
        kind: RefKind,
        method: Arc<Method>,
        appendix: Option<ObjRef>,
        mut args: Vec<Variable>,
    ) -> Flow<Frame> {
        if let Some(appendix) = appendix {
            args.push(Variable::from_ref(appendix));
        }
        let receiver_slot = usize::from(kind == RefKind::NewInvokeSpecial);
        if args.len() + receiver_slot != method.arg_slots {
            return Err(Exception::new_vm_msg(
                INTERNAL_ERROR,
                format!(
                    "call site passes {} slots to {}.{}{}",
                    args.len(),
                    method.class_name,
                    method.name,
                    method.raw_descriptor
                ),
            )
            .into());
        }
        let target = match kind {
            RefKind::InvokeStatic | RefKind::InvokeSpecial => method,
            RefKind::InvokeVirtual | RefKind::InvokeInterface => {
                let receiver = args.first().map(|v| v.reference()).unwrap_or(NULL);
                if receiver == NULL {
                    return Err(null_pointer().into());
                }
                self.machine
                    .heap
                    .class_of(receiver)
                    .find_virtual(&method.name, &method.raw_descriptor)
                    .cloned()
                    .unwrap_or(method)
            }
            RefKind::NewInvokeSpecial => {
                let object = self.machine.heap.allocate_object(method.class());
                // the caller sees the new object as the call's result
                self.frame.push_ref(object);
                args.insert(0, Variable::from_ref(object));
                method
            }
            field => {
                return Err(Exception::new_vm_msg(
                    INTERNAL_ERROR,
                    format!("{field:?} handles cannot be invoked"),
                )
                .into());
            }
        };
        Ok(self.machine.build_frame(target, args)?)
    }
}

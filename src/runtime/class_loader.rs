use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Formatter},
    sync::{Arc, atomic::AtomicI32},
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::{
    class::ClassFile,
    consts::{ClassAccessFlag, MethodAccessFlag, RefKind},
    descriptor::{
        FieldDescriptor, FieldType, class_name_to_field_type, parse_field_descriptor,
        parse_method_descriptor,
    },
    runtime::{
        ArrayElement, AsyncOutcome, BlockedOn, Class, ClassState, Code, ConstantPoolInfo,
        CpClassInfo, CpInvokeDynamic, CpMethodHandle, CpMethodType, CpNameAndTypeInfo,
        CpStringInfo, Exception, FieldInfo, FieldRef, Flow, Frame, InitStatus, InstanceField,
        InterpretedFrame, Linkage, Machine, Method, MethodRef, Next, ObjRef, PendingOp, ThreadId,
        ThreadStatus, VtableEntry,
        famous_classes::{
            CLASS_CIRCULARITY_ERROR, CLASS_FORMAT_ERROR, INCOMPATIBLE_CLASS_CHANGE_ERROR,
            LINKAGE_ERROR, NO_CLASS_DEF_FOUND_ERROR,
        },
        interpreter::{ContinuationFrame, FrameLock},
    },
};

pub(crate) mod bootstrap;

pub use bootstrap::{AsyncToken, ClassLookup, ClassProvider, MapProvider};

const PRIMITIVE_NAMES: [&str; 9] = [
    "boolean", "byte", "char", "short", "int", "long", "float", "double", "void",
];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(pub(crate) usize);

impl LoaderId {
    pub const BOOTSTRAP: LoaderId = LoaderId(0);
}

pub(crate) struct ClassLoader {
    pub(crate) id: LoaderId,
    pub(crate) parent: Option<LoaderId>,
    provider: Box<dyn ClassProvider>,
    // defined or initiated here
    classes: DashMap<Arc<str>, Arc<Class>>,
    order: Vec<Arc<Class>>,
    // lookups waiting on the provider, with the threads that asked
    in_flight: HashMap<Arc<str>, Vec<ThreadId>>,
    not_found: HashSet<Arc<str>>,
    failed: HashMap<Arc<str>, Exception>,
}

impl ClassLoader {
    pub(crate) fn new(
        id: LoaderId,
        parent: Option<LoaderId>,
        provider: Box<dyn ClassProvider>,
    ) -> ClassLoader {
        ClassLoader {
            id,
            parent,
            provider,
            classes: DashMap::new(),
            order: vec![],
            in_flight: HashMap::new(),
            not_found: HashSet::new(),
            failed: HashMap::new(),
        }
    }

    pub(crate) fn cached(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.get(name).map(|c| Arc::clone(c.value()))
    }

    fn record(&mut self, class: &Arc<Class>) {
        if self
            .classes
            .insert(Arc::clone(&class.class_name), Arc::clone(class))
            .is_none()
        {
            self.order.push(Arc::clone(class));
        }
    }

    pub(crate) fn classes(&self) -> &[Arc<Class>] {
        &self.order
    }
}

impl Debug for ClassLoader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassLoader")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("classes", &self.classes.len())
            .field("in_flight", &self.in_flight.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn format_error(what: impl Into<String>) -> Exception {
    Exception::new_vm_msg(CLASS_FORMAT_ERROR, what)
}

fn no_class_def(name: &str) -> Exception {
    Exception::new_vm_msg(NO_CLASS_DEF_FOUND_ERROR, name.replace('/', "."))
}

impl Machine {
    /// Loaded but not necessarily linked.
    pub(crate) fn load_class(
        &mut self,
        thread: Option<ThreadId>,
        loader: LoaderId,
        name: &str,
    ) -> Flow<Arc<Class>> {
        match self.find_class(thread, loader, name)? {
            Some(class) => Ok(class),
            None => Err(no_class_def(name).into()),
        }
    }

    pub(crate) fn load_and_link(
        &mut self,
        thread: Option<ThreadId>,
        loader: LoaderId,
        name: &str,
    ) -> Flow<Arc<Class>> {
        let class = self.load_class(thread, loader, name)?;
        self.link_class(thread, &class)?;
        Ok(class)
    }

    fn find_class(
        &mut self,
        thread: Option<ThreadId>,
        loader: LoaderId,
        name: &str,
    ) -> Flow<Option<Arc<Class>>> {
        if name.starts_with('[') {
            return self.load_array_class(thread, loader, name).map(Some);
        }
        let this = &self.loaders[loader.0];
        if let Some(class) = this.cached(name) {
            return Ok(Some(class));
        }
        if let Some(exception) = this.failed.get(name) {
            return Err(exception.clone().into());
        }
        if this.not_found.contains(name) {
            return Ok(None);
        }
        if loader == LoaderId::BOOTSTRAP && PRIMITIVE_NAMES.contains(&name) {
            return Ok(Some(self.define_primitive_class(name)));
        }
        if let Some(parent) = this.parent {
            if let Some(class) = self.find_class(thread, parent, name)? {
                // initiating loader
                self.loaders[loader.0].record(&class);
                return Ok(Some(class));
            }
        }

        if let Some(waiters) = self.loaders[loader.0].in_flight.get_mut(name) {
            let Some(thread) = thread else {
                return Err(no_class_def(name).into());
            };
            if !waiters.contains(&thread) {
                waiters.push(thread);
            }
            self.block(
                thread,
                ThreadStatus::AsyncWaiting,
                BlockedOn::ClassLookup,
                None,
            );
            return Err(Next::Suspend);
        }

        let token = self.next_async_token();
        let lookup = self.loaders[loader.0].provider.find_class(name, token);
        match lookup {
            ClassLookup::Found(class_file) => {
                Ok(Some(self.define_class(loader, name, class_file)?))
            }
            ClassLookup::NotFound => {
                self.loaders[loader.0].not_found.insert(Arc::from(name));
                Ok(None)
            }
            ClassLookup::Pending => {
                let Some(thread) = thread else {
                    return Err(Exception::new_vm_msg(
                        NO_CLASS_DEF_FOUND_ERROR,
                        format!("{name} cannot be loaded asynchronously here"),
                    )
                    .into());
                };
                let name: Arc<str> = Arc::from(name);
                tracing::debug!(class = %name, %token, thread = %thread, "class lookup pending");
                self.pending_async.insert(
                    token,
                    PendingOp::ClassLookup {
                        loader,
                        name: Arc::clone(&name),
                    },
                );
                self.loaders[loader.0].in_flight.insert(name, vec![thread]);
                self.block(
                    thread,
                    ThreadStatus::AsyncWaiting,
                    BlockedOn::ClassLookup,
                    None,
                );
                Err(Next::Suspend)
            }
        }
    }

    /// Answer to a pending provider lookup. Every thread that asked re-runs its instruction.
    pub(crate) fn complete_class_lookup(
        &mut self,
        loader: LoaderId,
        name: Arc<str>,
        outcome: AsyncOutcome,
    ) {
        let waiters = self.loaders[loader.0]
            .in_flight
            .remove(&name)
            .unwrap_or_default();
        match outcome {
            AsyncOutcome::ClassFound(class_file) => {
                if let Err(exception) = self.define_class(loader, &name, class_file) {
                    tracing::warn!(class = %name, ?exception, "asynchronously loaded class rejected");
                    self.loaders[loader.0].failed.insert(name, exception);
                }
            }
            AsyncOutcome::ClassNotFound => {
                self.loaders[loader.0].not_found.insert(name);
            }
            other => {
                tracing::warn!(class = %name, ?other, "unexpected answer to class lookup");
                self.loaders[loader.0].not_found.insert(name);
            }
        }
        for thread in waiters {
            if self.thread(thread).status == ThreadStatus::AsyncWaiting {
                self.wake(thread);
            }
        }
    }

    pub(crate) fn define_class(
        &mut self,
        loader: LoaderId,
        expected_name: &str,
        class_file: ClassFile,
    ) -> Result<Arc<Class>, Exception> {
        let class = build_class(loader, &class_file, self.config.warmup_budget)?;
        if class.class_name.as_ref() != expected_name {
            return Err(Exception::new_vm_msg(
                NO_CLASS_DEF_FOUND_ERROR,
                format!("{expected_name} (wrong name: {})", class.class_name),
            ));
        }
        let this = &mut self.loaders[loader.0];
        if this.classes.contains_key(expected_name) {
            return Err(Exception::new_vm_msg(
                LINKAGE_ERROR,
                format!("duplicate class definition for {expected_name}"),
            ));
        }
        this.record(&class);
        tracing::debug!(class = %class.class_name, loader = loader.0, "class loaded");
        Ok(class)
    }

    fn define_primitive_class(&mut self, name: &str) -> Arc<Class> {
        let class = Class::new(
            Arc::from(name),
            ClassAccessFlag::PUBLIC | ClassAccessFlag::FINAL | ClassAccessFlag::ABSTRACT,
            LoaderId::BOOTSTRAP,
            vec![],
            None,
            vec![],
            vec![],
            |_| vec![],
            vec![],
            None,
            None,
        );
        let _ = class.linkage.set(Linkage {
            super_class: None,
            interfaces: vec![],
            instance_fields: vec![],
            instance_slots: 0,
            vtable: vec![],
            vtable_index: HashMap::new(),
        });
        *class.init.lock() = InitStatus::Done;
        class.advance_state(ClassState::Initialized);
        self.loaders[0].record(&class);
        class
    }

    /// Array classes are created on demand, element first. Primitive arrays belong to the
    /// bootstrap loader, reference arrays to the element's defining loader.
    fn load_array_class(
        &mut self,
        thread: Option<ThreadId>,
        loader: LoaderId,
        name: &str,
    ) -> Flow<Arc<Class>> {
        if let Some(class) = self.loaders[loader.0].cached(name) {
            return Ok(class);
        }
        let Some(FieldType::Array(element_type)) = class_name_to_field_type(name) else {
            return Err(no_class_def(name).into());
        };
        let element = match element_type.as_ref() {
            FieldType::Object(element_name) => {
                ArrayElement::Reference(self.load_and_link(thread, loader, element_name)?)
            }
            FieldType::Array(_) => ArrayElement::Reference(self.load_and_link(
                thread,
                loader,
                &element_type.class_name(),
            )?),
            primitive => ArrayElement::Primitive(primitive.clone()),
        };
        let defining = match &element {
            ArrayElement::Primitive(_) => LoaderId::BOOTSTRAP,
            ArrayElement::Reference(class) => class.loader,
        };
        if let Some(class) = self.loaders[defining.0].cached(name) {
            self.loaders[loader.0].record(&class);
            return Ok(class);
        }

        let object = self.load_and_link(thread, LoaderId::BOOTSTRAP, "java/lang/Object")?;
        let cloneable = self.load_and_link(thread, LoaderId::BOOTSTRAP, "java/lang/Cloneable")?;
        let serializable =
            self.load_and_link(thread, LoaderId::BOOTSTRAP, "java/io/Serializable")?;
        let class = Class::new(
            Arc::from(name),
            ClassAccessFlag::PUBLIC | ClassAccessFlag::FINAL | ClassAccessFlag::ABSTRACT,
            defining,
            vec![],
            Some(Arc::clone(&object.class_name)),
            vec![
                Arc::clone(&cloneable.class_name),
                Arc::clone(&serializable.class_name),
            ],
            vec![],
            |_| vec![],
            vec![],
            None,
            Some(element),
        );
        let object_linkage = object.linkage();
        let _ = class.linkage.set(Linkage {
            super_class: Some(Arc::clone(&object)),
            interfaces: vec![cloneable, serializable],
            instance_fields: vec![],
            instance_slots: 0,
            vtable: object_linkage.vtable.clone(),
            vtable_index: object_linkage.vtable_index.clone(),
        });
        *class.init.lock() = InitStatus::Done;
        class.advance_state(ClassState::Initialized);
        self.loaders[defining.0].record(&class);
        if defining != loader {
            self.loaders[loader.0].record(&class);
        }
        tracing::debug!(class = name, loader = defining.0, "array class created");
        Ok(class)
    }

    /// Resolves supertypes and lays out fields and the vtable.
    pub(crate) fn link_class(&mut self, thread: Option<ThreadId>, class: &Arc<Class>) -> Flow<()> {
        if class.linkage.get().is_some() {
            return Ok(());
        }
        let key = (class.loader, Arc::clone(&class.class_name));
        if !self.linking.insert(key.clone()) {
            return Err(Exception::new_vm_msg(
                CLASS_CIRCULARITY_ERROR,
                class.class_name.replace('/', "."),
            )
            .into());
        }
        let supertypes = self.link_supertypes(thread, class);
        self.linking.remove(&key);
        let (super_class, interfaces) = supertypes?;

        if class.linkage.get().is_none() {
            let linkage = build_linkage(class, super_class, interfaces);
            let _ = class.linkage.set(linkage);
            class.advance_state(ClassState::Resolved);
            tracing::debug!(class = %class.class_name, "class linked");
        }

        // nothing to run: initialized as soon as the superclass is
        let super_ready = class.super_class().is_none_or(|s| s.is_initialized());
        if class.clinit().is_none() && (super_ready || class.is_interface()) {
            let mut init = class.init.lock();
            if matches!(*init, InitStatus::NotStarted) {
                *init = InitStatus::Done;
                class.advance_state(ClassState::Initialized);
            }
        }
        Ok(())
    }

    fn link_supertypes(
        &mut self,
        thread: Option<ThreadId>,
        class: &Arc<Class>,
    ) -> Flow<(Option<Arc<Class>>, Vec<Arc<Class>>)> {
        let super_class = match &class.super_class_name {
            Some(name) => {
                let super_class = self.load_and_link(thread, class.loader, name)?;
                if super_class.is_interface() {
                    return Err(Exception::new_vm_msg(
                        INCOMPATIBLE_CLASS_CHANGE_ERROR,
                        format!(
                            "class {} has interface {} as super class",
                            class.class_name, super_class.class_name
                        ),
                    )
                    .into());
                }
                Some(super_class)
            }
            None => None,
        };
        let mut interfaces = Vec::with_capacity(class.interface_names.len());
        for name in &class.interface_names {
            let interface = self.load_and_link(thread, class.loader, name)?;
            if !interface.is_interface() {
                return Err(Exception::new_vm_msg(
                    INCOMPATIBLE_CLASS_CHANGE_ERROR,
                    format!(
                        "class {} can not implement {}, because it is not an interface",
                        class.class_name, interface.class_name
                    ),
                )
                .into());
            }
            interfaces.push(interface);
        }
        Ok((super_class, interfaces))
    }

    /// Runs the static initializer once. Another thread's initialization in progress blocks
    /// the caller; a failed one is reported again without running anything.
    pub(crate) fn ensure_initialized(&mut self, thread: ThreadId, class: &Arc<Class>) -> Flow<()> {
        if class.is_initialized() {
            return Ok(());
        }
        {
            let mut init = class.init.lock();
            match &mut *init {
                InitStatus::Done => return Ok(()),
                InitStatus::Failed(cause) => {
                    return Err(Exception::new_vm_msg(
                        NO_CLASS_DEF_FOUND_ERROR,
                        format!(
                            "Could not initialize class {}",
                            class.class_name.replace('/', ".")
                        ),
                    )
                    .with_cause(*cause)
                    .into());
                }
                InitStatus::InProgress { thread: owner, .. } if *owner == thread => return Ok(()),
                InitStatus::InProgress { waiters, .. } => {
                    waiters.push(thread);
                    drop(init);
                    self.block(
                        thread,
                        ThreadStatus::UninterruptiblyBlocked,
                        BlockedOn::ClassInit(Arc::clone(&class.class_name)),
                        None,
                    );
                    return Err(Next::Suspend);
                }
                InitStatus::NotStarted => {}
            }
        }

        if !class.is_interface() {
            if let Some(super_class) = class.super_class().cloned() {
                self.ensure_initialized(thread, &super_class)?;
            }
        }

        let mut init = class.init.lock();
        if !matches!(*init, InitStatus::NotStarted) {
            drop(init);
            return self.ensure_initialized(thread, class);
        }
        match class.clinit() {
            None => {
                *init = InitStatus::Done;
                drop(init);
                class.advance_state(ClassState::Initialized);
                Ok(())
            }
            Some(clinit) => {
                *init = InitStatus::InProgress {
                    thread,
                    waiters: vec![],
                };
                drop(init);
                tracing::debug!(class = %class.class_name, thread = %thread, "running static initializer");
                let frame = InterpretedFrame::new(Arc::clone(clinit), &[], FrameLock::None);
                Err(Next::Push(vec![
                    Frame::Continuation(ContinuationFrame::ClassInit {
                        class: Arc::clone(class),
                    }),
                    Frame::Interpreted(frame),
                ]))
            }
        }
    }

    /// Records the outcome of a static initializer and releases the threads waiting on it.
    pub(crate) fn finish_initialization(&mut self, class: &Arc<Class>, failure: Option<ObjRef>) {
        let previous = {
            let mut init = class.init.lock();
            std::mem::replace(
                &mut *init,
                match failure {
                    Some(throwable) => InitStatus::Failed(throwable),
                    None => InitStatus::Done,
                },
            )
        };
        match failure {
            None => {
                class.advance_state(ClassState::Initialized);
                tracing::debug!(class = %class.class_name, "class initialized");
            }
            Some(_) => {
                tracing::warn!(class = %class.class_name, "static initializer failed");
            }
        }
        if let InitStatus::InProgress { waiters, .. } = previous {
            for waiter in waiters {
                if self.thread(waiter).status == ThreadStatus::UninterruptiblyBlocked {
                    self.wake(waiter);
                }
            }
        }
    }

    /// Puts a class whose initializer never started running back to `NotStarted`, so the
    /// next access (from this or a waiting thread) tries again.
    pub(crate) fn abandon_initialization(&mut self, class: &Arc<Class>) {
        let previous = std::mem::replace(&mut *class.init.lock(), InitStatus::NotStarted);
        tracing::debug!(class = %class.class_name, "static initializer not entered");
        if let InitStatus::InProgress { waiters, .. } = previous {
            for waiter in waiters {
                if self.thread(waiter).status == ThreadStatus::UninterruptiblyBlocked {
                    self.wake(waiter);
                }
            }
        }
    }

    pub(crate) fn next_async_token(&mut self) -> AsyncToken {
        self.next_async_token += 1;
        AsyncToken(self.next_async_token)
    }
}

fn build_linkage(
    class: &Arc<Class>,
    super_class: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
) -> Linkage {
    let mut instance_fields = super_class
        .as_ref()
        .map(|s| s.linkage().instance_fields.clone())
        .unwrap_or_default();
    let mut slot = super_class
        .as_ref()
        .map(|s| s.linkage().instance_slots)
        .unwrap_or(0);
    for field in class.fields.iter().filter(|f| !f.is_static()) {
        instance_fields.push(InstanceField {
            declaring_class: Arc::clone(&class.class_name),
            name: Arc::clone(&field.name),
            descriptor: field.descriptor.clone(),
            slot,
        });
        slot += field.descriptor.0.slot_size();
    }

    let vtable = build_vtable(class, super_class.as_ref(), &interfaces);
    let vtable_index = vtable
        .iter()
        .enumerate()
        .map(|(i, entry)| ((Arc::clone(&entry.name), Arc::clone(&entry.descriptor)), i))
        .collect();
    Linkage {
        super_class,
        interfaces,
        instance_fields,
        instance_slots: slot,
        vtable,
        vtable_index,
    }
}

fn build_vtable(
    class: &Arc<Class>,
    super_class: Option<&Arc<Class>>,
    interfaces: &[Arc<Class>],
) -> Vec<VtableEntry> {
    // super class's vtable goes first
    let mut vtable: Vec<VtableEntry> = super_class
        .map(|s| s.linkage().vtable.clone())
        .unwrap_or_default();
    // interface will only have Object's vtable
    if class.is_interface() {
        return vtable;
    }

    let virtual_methods: Vec<&Arc<Method>> = class
        .methods
        .iter()
        .filter(|m| !m.is_static() && !m.is_private())
        .filter(|m| m.name.as_ref() != "<init>" && m.name.as_ref() != "<clinit>")
        .collect();

    let mut overridden = HashSet::new();
    for entry in &mut vtable {
        let super_method = &entry.method;
        // package private methods are only overridden from the same package
        if !super_method
            .access_flags
            .intersects(MethodAccessFlag::PUBLIC | MethodAccessFlag::PROTECTED)
            && super_method.class().package_name() != class.package_name()
        {
            continue;
        }
        if let Some(method) = virtual_methods
            .iter()
            .find(|m| m.name == entry.name && m.raw_descriptor == entry.descriptor)
        {
            entry.method = Arc::clone(method);
            overridden.insert(method.index);
        }
    }

    // put new methods in the end
    for method in &virtual_methods {
        if overridden.contains(&method.index) {
            continue;
        }
        vtable.push(VtableEntry {
            name: Arc::clone(&method.name),
            descriptor: Arc::clone(&method.raw_descriptor),
            method: Arc::clone(method),
        });
    }

    // interface methods not implemented by the class hierarchy; defaults replace abstract ones
    let mut pending: Vec<Arc<Class>> = interfaces.to_vec();
    let mut seen = HashSet::new();
    while let Some(interface) = pending.pop() {
        if !seen.insert(Arc::clone(&interface.class_name)) {
            continue;
        }
        for method in &interface.methods {
            if method.is_static() || method.is_private() || method.name.as_ref() == "<clinit>" {
                continue;
            }
            let existing = vtable
                .iter_mut()
                .find(|e| e.name == method.name && e.descriptor == method.raw_descriptor);
            match existing {
                Some(entry) => {
                    if entry.method.is_abstract()
                        && !method.is_abstract()
                        && entry.method.class().is_interface()
                    {
                        entry.method = Arc::clone(method);
                    }
                }
                None => vtable.push(VtableEntry {
                    name: Arc::clone(&method.name),
                    descriptor: Arc::clone(&method.raw_descriptor),
                    method: Arc::clone(method),
                }),
            }
        }
        pending.extend(interface.interfaces().iter().cloned());
    }
    vtable
}

fn utf8(class_file: &ClassFile, index: u16) -> Result<Arc<str>, Exception> {
    class_file
        .utf8(index)
        .cloned()
        .ok_or_else(|| format_error(format!("constant {index} is not a Utf8 entry")))
}

fn name_and_type(class_file: &ClassFile, index: u16) -> Result<(Arc<str>, Arc<str>), Exception> {
    use crate::class::ConstantPoolEntry;
    match class_file.constant(index) {
        Some(ConstantPoolEntry::NameAndType {
            name_index,
            descriptor_index,
        }) => Ok((
            utf8(class_file, *name_index)?,
            utf8(class_file, *descriptor_index)?,
        )),
        _ => Err(format_error(format!(
            "constant {index} is not a NameAndType entry"
        ))),
    }
}

fn method_ref(
    class_file: &ClassFile,
    class_index: u16,
    name_and_type_index: u16,
) -> Result<MethodRef, Exception> {
    let (name, raw_descriptor) = name_and_type(class_file, name_and_type_index)?;
    let (_, descriptor) = parse_method_descriptor(&raw_descriptor)?;
    Ok(MethodRef {
        class_index,
        name_and_type: CpNameAndTypeInfo { name, descriptor },
        raw_descriptor,
        resolve: OnceCell::new(),
    })
}

fn build_constant_pool(class_file: &ClassFile) -> Result<Vec<ConstantPoolInfo>, Exception> {
    use crate::class::ConstantPoolEntry as Raw;
    type Cpi = ConstantPoolInfo;

    let mut constant_pool = Vec::with_capacity(class_file.constant_pool.len());
    for entry in &class_file.constant_pool {
        let info = match entry {
            Raw::Utf8(v) => Cpi::Utf8(Arc::clone(v)),
            Raw::Integer(v) => Cpi::Integer(*v),
            Raw::Float(v) => Cpi::Float(*v),
            Raw::Long(v) => Cpi::Long(*v),
            Raw::Double(v) => Cpi::Double(*v),
            Raw::Class { name_index } => Cpi::Class(CpClassInfo::new(utf8(class_file, *name_index)?)),
            Raw::String { string_index } => Cpi::String(CpStringInfo {
                value: utf8(class_file, *string_index)?,
                string: OnceCell::new(),
            }),
            Raw::Fieldref {
                class_index,
                name_and_type_index,
            } => {
                let (name, descriptor) = name_and_type(class_file, *name_and_type_index)?;
                let (_, descriptor) = parse_field_descriptor(&descriptor)?;
                Cpi::Fieldref(FieldRef {
                    class_index: *class_index,
                    name_and_type: CpNameAndTypeInfo { name, descriptor },
                    resolve: OnceCell::new(),
                })
            }
            Raw::Methodref {
                class_index,
                name_and_type_index,
            } => Cpi::Methodref(method_ref(class_file, *class_index, *name_and_type_index)?),
            Raw::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => Cpi::InterfaceMethodref(method_ref(
                class_file,
                *class_index,
                *name_and_type_index,
            )?),
            Raw::NameAndType {
                name_index,
                descriptor_index,
            } => Cpi::NameAndType(CpNameAndTypeInfo {
                name: utf8(class_file, *name_index)?,
                descriptor: utf8(class_file, *descriptor_index)?,
            }),
            Raw::MethodHandle {
                reference_kind,
                reference_index,
            } => Cpi::MethodHandle(CpMethodHandle {
                kind: RefKind::from_u8(*reference_kind).ok_or_else(|| {
                    format_error(format!("bad method handle kind {reference_kind}"))
                })?,
                reference_index: *reference_index,
                handle: OnceCell::new(),
            }),
            Raw::MethodType { descriptor_index } => {
                let raw_descriptor = utf8(class_file, *descriptor_index)?;
                let (_, descriptor) = parse_method_descriptor(&raw_descriptor)?;
                Cpi::MethodType(CpMethodType {
                    raw_descriptor,
                    descriptor,
                    method_type: OnceCell::new(),
                })
            }
            Raw::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                let (name, raw_descriptor) = name_and_type(class_file, *name_and_type_index)?;
                let (_, descriptor) = parse_method_descriptor(&raw_descriptor)?;
                Cpi::InvokeDynamic(CpInvokeDynamic {
                    bootstrap_index: *bootstrap_method_attr_index,
                    name_and_type: CpNameAndTypeInfo { name, descriptor },
                    raw_descriptor,
                    bootstrap: OnceCell::new(),
                    call_sites: Default::default(),
                })
            }
            Raw::Empty => Cpi::Empty,
        };
        constant_pool.push(info);
    }
    Ok(constant_pool)
}

/// Turns a parsed class into its runtime descriptor, in the `Loaded` state.
pub(crate) fn build_class(
    loader: LoaderId,
    class_file: &ClassFile,
    warmup_budget: i32,
) -> Result<Arc<Class>, Exception> {
    let name = class_file
        .name()
        .cloned()
        .ok_or_else(|| format_error("this_class is not a class entry"))?;
    let super_class_name = match class_file.super_class {
        0 => None,
        index => Some(
            class_file
                .class_name_at(index)
                .cloned()
                .ok_or_else(|| format_error(format!("bad super class index {index}")))?,
        ),
    };
    if super_class_name.is_none() && name.as_ref() != "java/lang/Object" {
        return Err(format_error(format!("{name} has no super class")));
    }
    let interface_names = class_file
        .interfaces
        .iter()
        .map(|&index| {
            class_file
                .class_name_at(index)
                .cloned()
                .ok_or_else(|| format_error(format!("bad interface index {index}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let constant_pool = build_constant_pool(class_file)?;

    let mut static_slot = 0;
    let mut fields = Vec::with_capacity(class_file.fields.len());
    for field in &class_file.fields {
        let (_, descriptor): (_, FieldDescriptor) = parse_field_descriptor(&field.descriptor)?;
        let info = FieldInfo {
            access_flags: field.access_flags,
            name: Arc::clone(&field.name),
            static_slot: None,
            descriptor,
        };
        let info = if info.is_static() {
            let slot = static_slot;
            static_slot += info.descriptor.0.slot_size();
            FieldInfo {
                static_slot: Some(slot),
                ..info
            }
        } else {
            info
        };
        fields.push(info);
    }

    let mut parts = Vec::with_capacity(class_file.methods.len());
    for method in &class_file.methods {
        let (_, descriptor) = parse_method_descriptor(&method.descriptor)?;
        let is_static = method.access_flags.contains(MethodAccessFlag::STATIC);
        let needs_code = !method
            .access_flags
            .intersects(MethodAccessFlag::NATIVE | MethodAccessFlag::ABSTRACT);
        if needs_code && method.code.is_none() {
            return Err(format_error(format!(
                "{name}.{}{} has no code",
                method.name, method.descriptor
            )));
        }
        let arg_slots = descriptor.param_slots() + usize::from(!is_static);
        parts.push((method, descriptor, arg_slots));
    }

    let class_name = Arc::clone(&name);
    Ok(Class::new(
        name,
        class_file.access_flags,
        loader,
        constant_pool,
        super_class_name,
        interface_names,
        fields,
        |me| {
            parts
                .into_iter()
                .enumerate()
                .map(|(index, (method, descriptor, arg_slots))| {
                    Arc::new(Method {
                        class: me.clone(),
                        class_name: Arc::clone(&class_name),
                        index,
                        access_flags: method.access_flags,
                        name: Arc::clone(&method.name),
                        raw_descriptor: Arc::clone(&method.descriptor),
                        descriptor,
                        arg_slots,
                        code: method.code.as_ref().map(|code| {
                            Code::new(
                                code.max_stack,
                                code.max_locals,
                                code.code.clone(),
                                code.exception_table.clone(),
                                code.line_numbers.clone(),
                            )
                        }),
                        native: OnceCell::new(),
                        warmup: AtomicI32::new(warmup_budget),
                    })
                })
                .collect()
        },
        class_file.bootstrap_methods.clone(),
        class_file.source_file.clone(),
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        VmConfig,
        class::builder::{Assembler, ClassFileBuilder},
        consts::FieldAccessFlag,
        runtime::{AsyncHandle, instructions as inst},
    };
    use parking_lot::Mutex;

    fn machine(provider: MapProvider) -> Machine {
        Machine::new(VmConfig::default(), provider).unwrap()
    }

    fn void_method(builder: &mut ClassFileBuilder, flags: MethodAccessFlag, name: &str) {
        let mut asm = Assembler::new(1);
        asm.op(inst::RETURN);
        builder.method(flags, name, "()V", asm.finish().unwrap());
    }

    #[test]
    fn test_load_is_idempotent() {
        let mut vm = machine(MapProvider::new().with(ClassFileBuilder::new("t/A").build()));
        let a = vm.load_class(None, LoaderId::BOOTSTRAP, "t/A").unwrap();
        let b = vm.load_class(None, LoaderId::BOOTSTRAP, "t/A").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state(), ClassState::Loaded);
        assert!(matches!(
            vm.load_class(None, LoaderId::BOOTSTRAP, "t/Missing"),
            Err(Next::Throw(_))
        ));
    }

    #[test]
    fn test_linking_loads_super_class_first() {
        let mut b = ClassFileBuilder::new("t/B");
        b.field(FieldAccessFlag::PUBLIC, "x", "J");
        let mut a = ClassFileBuilder::new("t/A");
        a.super_class("t/B").field(FieldAccessFlag::PUBLIC, "y", "I");
        let mut vm = machine(MapProvider::new().with(a.build()).with(b.build()));

        let a = vm.load_class(None, LoaderId::BOOTSTRAP, "t/A").unwrap();
        assert!(vm.loaders[0].cached("t/B").is_none());
        vm.link_class(None, &a).unwrap();
        let b = vm.loaders[0].cached("t/B").expect("super class loaded");
        assert!(b.state() >= ClassState::Resolved);
        assert!(a.state() >= ClassState::Resolved);
        assert_eq!(a.instance_slots(), 3);
        assert_eq!(a.instance_field("y").unwrap().slot, 2);
        // no static initializer anywhere in the chain
        assert_eq!(a.state(), ClassState::Initialized);
    }

    #[test]
    fn test_interface_as_super_class() {
        let mut i = ClassFileBuilder::new("t/I");
        i.access(ClassAccessFlag::PUBLIC | ClassAccessFlag::INTERFACE | ClassAccessFlag::ABSTRACT);
        let mut a = ClassFileBuilder::new("t/A");
        a.super_class("t/I");
        let mut vm = machine(MapProvider::new().with(a.build()).with(i.build()));
        let a = vm.load_class(None, LoaderId::BOOTSTRAP, "t/A").unwrap();
        let Err(Next::Throw(Exception::VmException { exception_type, .. })) =
            vm.link_class(None, &a)
        else {
            panic!("expected a link error");
        };
        assert_eq!(exception_type.as_ref(), INCOMPATIBLE_CLASS_CHANGE_ERROR);
        assert_eq!(a.state(), ClassState::Loaded);
    }

    #[test]
    fn test_circular_super_classes() {
        let mut a = ClassFileBuilder::new("t/A");
        a.super_class("t/B");
        let mut b = ClassFileBuilder::new("t/B");
        b.super_class("t/A");
        let mut vm = machine(MapProvider::new().with(a.build()).with(b.build()));
        let a = vm.load_class(None, LoaderId::BOOTSTRAP, "t/A").unwrap();
        let Err(Next::Throw(Exception::VmException { exception_type, .. })) =
            vm.link_class(None, &a)
        else {
            panic!("expected a circularity error");
        };
        assert_eq!(exception_type.as_ref(), CLASS_CIRCULARITY_ERROR);
        assert!(vm.linking.is_empty());
    }

    #[test]
    fn test_vtable_overrides_keep_slot() {
        let mut base = ClassFileBuilder::new("t/Base");
        void_method(&mut base, MethodAccessFlag::PUBLIC, "run");
        void_method(&mut base, MethodAccessFlag::PUBLIC, "stop");
        let mut derived = ClassFileBuilder::new("t/Derived");
        derived.super_class("t/Base");
        void_method(&mut derived, MethodAccessFlag::PUBLIC, "stop");
        void_method(&mut derived, MethodAccessFlag::PUBLIC, "extra");
        let mut vm = machine(MapProvider::new().with(base.build()).with(derived.build()));

        let base = vm
            .load_and_link(None, LoaderId::BOOTSTRAP, "t/Base")
            .unwrap();
        let derived = vm
            .load_and_link(None, LoaderId::BOOTSTRAP, "t/Derived")
            .unwrap();
        let stop = base.linkage().vtable_index[&(Arc::from("stop"), Arc::from("()V"))];
        assert_eq!(
            derived.virtual_method(stop).unwrap().class_name.as_ref(),
            "t/Derived"
        );
        assert_eq!(
            derived.find_virtual("run", "()V").unwrap().class_name.as_ref(),
            "t/Base"
        );
        assert_eq!(
            derived.linkage().vtable.len(),
            base.linkage().vtable.len() + 1
        );
    }

    #[test]
    fn test_default_method_fills_vtable() {
        let mut i = ClassFileBuilder::new("t/I");
        i.access(ClassAccessFlag::PUBLIC | ClassAccessFlag::INTERFACE | ClassAccessFlag::ABSTRACT);
        void_method(&mut i, MethodAccessFlag::PUBLIC, "greet");
        let mut a = ClassFileBuilder::new("t/A");
        a.interface("t/I");
        let mut vm = machine(MapProvider::new().with(a.build()).with(i.build()));
        let a = vm.load_and_link(None, LoaderId::BOOTSTRAP, "t/A").unwrap();
        assert_eq!(
            a.find_virtual("greet", "()V").unwrap().class_name.as_ref(),
            "t/I"
        );
    }

    #[test]
    fn test_array_classes() {
        let mut vm = machine(MapProvider::new().with(ClassFileBuilder::new("t/A").build()));
        let ints = vm.load_class(None, LoaderId::BOOTSTRAP, "[I").unwrap();
        assert_eq!(ints.state(), ClassState::Initialized);
        assert_eq!(ints.super_class().unwrap().name(), "java/lang/Object");
        let nested = vm.load_class(None, LoaderId::BOOTSTRAP, "[[Lt/A;").unwrap();
        let Some(ArrayElement::Reference(element)) = &nested.array_element else {
            panic!("reference array expected");
        };
        assert_eq!(element.name(), "[Lt/A;");
        let again = vm.load_class(None, LoaderId::BOOTSTRAP, "[[Lt/A;").unwrap();
        assert!(Arc::ptr_eq(&nested, &again));
    }

    #[test]
    fn test_child_loader_delegates_to_parent() {
        let mut vm = machine(MapProvider::new().with(ClassFileBuilder::new("t/Shared").build()));
        let child = vm.new_loader(
            LoaderId::BOOTSTRAP,
            MapProvider::new()
                .with(ClassFileBuilder::new("t/Shared").build())
                .with(ClassFileBuilder::new("t/Own").build()),
        );
        let shared = vm.load_class(None, child, "t/Shared").unwrap();
        assert_eq!(shared.loader, LoaderId::BOOTSTRAP);
        let own = vm.load_class(None, child, "t/Own").unwrap();
        assert_eq!(own.loader, child);
        assert!(vm.load_class(None, LoaderId::BOOTSTRAP, "t/Own").is_err());
        let names: Vec<_> = vm.loaded_classes(child).iter().map(|c| c.name().to_string()).collect();
        assert!(names.contains(&"t/Shared".to_string()));
        assert!(names.contains(&"t/Own".to_string()));
    }

    /// Answers every lookup later and counts the requests.
    struct DeferredProvider {
        requests: Arc<Mutex<Vec<(String, AsyncToken)>>>,
    }

    impl ClassProvider for DeferredProvider {
        fn find_class(&mut self, name: &str, token: AsyncToken) -> ClassLookup {
            if name.starts_with("t/") {
                self.requests.lock().push((name.to_string(), token));
                ClassLookup::Pending
            } else {
                ClassLookup::NotFound
            }
        }
    }

    #[test]
    fn test_async_lookup_is_shared() {
        let requests = Arc::new(Mutex::new(vec![]));
        let mut vm = Machine::new(
            VmConfig::default(),
            DeferredProvider {
                requests: Arc::clone(&requests),
            },
        )
        .unwrap();
        let t1 = vm.spawn_thread("t1");
        let t2 = vm.spawn_thread("t2");
        vm.wake(t1);
        vm.wake(t2);

        assert!(matches!(
            vm.load_class(Some(t1), LoaderId::BOOTSTRAP, "t/A"),
            Err(Next::Suspend)
        ));
        assert!(matches!(
            vm.load_class(Some(t2), LoaderId::BOOTSTRAP, "t/A"),
            Err(Next::Suspend)
        ));
        assert_eq!(requests.lock().len(), 1);
        assert_eq!(vm.thread_status(t1), Some(ThreadStatus::AsyncWaiting));
        assert_eq!(vm.thread_status(t2), Some(ThreadStatus::AsyncWaiting));

        let token = requests.lock()[0].1;
        let handle: AsyncHandle = vm.async_handle();
        handle.complete(
            token,
            AsyncOutcome::ClassFound(ClassFileBuilder::new("t/A").build()),
        );
        vm.drain_async().unwrap();
        assert_eq!(vm.thread_status(t1), Some(ThreadStatus::Runnable));
        assert_eq!(vm.thread_status(t2), Some(ThreadStatus::Runnable));

        let a1 = vm.load_class(Some(t1), LoaderId::BOOTSTRAP, "t/A").unwrap();
        let a2 = vm.load_class(Some(t2), LoaderId::BOOTSTRAP, "t/A").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(requests.lock().len(), 1);
    }
}

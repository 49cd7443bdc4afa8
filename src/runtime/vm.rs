//! The machine: loaders, threads, monitors and the heap of one engine instance, and the host
//! surface over them.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
    time::Instant,
};

use once_cell::unsync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::{
    VmConfig, VmError,
    class::ClassFile,
    consts::{MAX_PRIORITY, MIN_PRIORITY, NORM_PRIORITY, RefKind},
    descriptor::parse_method_descriptor,
    runtime::{
        Class, ClassProvider, ClassState, Completion, Exception, Frame, LoaderId, Method,
        NativeFunction, NativeVariable, ObjRef, Thread, ThreadId, ThreadStatus, Variable,
        class_loader::{AsyncToken, ClassLoader, bootstrap::Fallback},
        famous_classes::{FamousClasses, NO_SUCH_METHOD_ERROR, core_library},
        heap::Heap,
        interpreter::ContinuationFrame,
        monitor::MonitorTable,
        native::NativeRegistry,
        scheduler::Scheduler,
    },
};

/// Answer to an asynchronous operation, delivered through [`AsyncHandle::complete`].
#[derive(Debug)]
pub enum AsyncOutcome {
    /// A pending [`crate::ClassLookup`] found its class.
    ClassFound(ClassFile),
    ClassNotFound,
    /// Result of a native body that called [`crate::NativeEnv::begin_async`].
    Value(Option<NativeVariable>),
    /// The native body raises `exception` (a binary class name) when it resumes.
    Failed {
        exception: String,
        message: Option<String>,
    },
}

#[derive(Debug)]
pub(crate) enum PendingOp {
    ClassLookup { loader: LoaderId, name: Arc<str> },
    Native { thread: ThreadId },
}

/// Completes asynchronous operations from any host thread. Answers are applied by the
/// machine at the start of its next step.
#[derive(Clone, Default)]
pub struct AsyncHandle {
    inner: Arc<(Mutex<VecDeque<(AsyncToken, AsyncOutcome)>>, Condvar)>,
}

impl AsyncHandle {
    pub fn complete(&self, token: AsyncToken, outcome: AsyncOutcome) {
        let (queue, ready) = &*self.inner;
        queue.lock().push_back((token, outcome));
        ready.notify_all();
    }

    fn take_all(&self) -> Vec<(AsyncToken, AsyncOutcome)> {
        self.inner.0.lock().drain(..).collect()
    }

    /// Blocks until an answer arrives or `deadline` passes.
    fn wait(&self, deadline: Option<Instant>) {
        let (queue, ready) = &*self.inner;
        let mut queue = queue.lock();
        if !queue.is_empty() {
            return;
        }
        match deadline {
            Some(deadline) => {
                ready.wait_until(&mut queue, deadline);
            }
            None => ready.wait(&mut queue),
        }
    }
}

impl Debug for AsyncHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("queued", &self.inner.0.lock().len())
            .finish()
    }
}

/// What [`Machine::step`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// A thread ran a quantum.
    Running,
    /// Nothing is runnable before the earliest timer at the given instant.
    Sleeping(Instant),
    /// Nothing is runnable until the host completes an asynchronous operation.
    AwaitingHost,
    /// Every thread has terminated.
    Finished,
}

/// One frame of [`Machine::stack_trace`], innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceElement {
    pub class_name: String,
    pub method_name: String,
    pub descriptor: String,
    /// `None` for native frames.
    pub pc: Option<usize>,
    pub source_file: Option<String>,
    pub line: Option<u16>,
}

impl Display for StackTraceElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name.replace('/', "."), self.method_name)?;
        match (self.pc, &self.source_file, self.line) {
            (None, ..) => write!(f, "(Native Method)"),
            (Some(_), Some(source), Some(line)) => write!(f, "({source}:{line})"),
            (Some(pc), Some(source), None) => write!(f, "({source}, pc {pc})"),
            (Some(pc), None, _) => write!(f, "(pc {pc})"),
        }
    }
}

pub struct Machine {
    pub(crate) config: VmConfig,
    // indexed by LoaderId
    pub(crate) loaders: Vec<ClassLoader>,
    pub(crate) heap: Heap,
    // indexed by ThreadId
    pub(crate) threads: Vec<Thread>,
    pub(crate) thread_objects: HashMap<ObjRef, ThreadId>,
    pub(crate) scheduler: Scheduler,
    pub(crate) monitors: MonitorTable,
    pub(crate) natives: NativeRegistry,
    pub(crate) famous: OnceCell<FamousClasses>,
    pub(crate) pending_async: HashMap<AsyncToken, PendingOp>,
    pub(crate) next_async_token: u64,
    // classes whose supertypes are being linked, for circularity detection
    pub(crate) linking: HashSet<(LoaderId, Arc<str>)>,
    pub(crate) halted: Option<i32>,
    async_handle: AsyncHandle,
}

impl Machine {
    /// Boots a machine whose bootstrap loader asks `provider` first and falls back to the
    /// built-in core library.
    pub fn new(config: VmConfig, provider: impl ClassProvider + 'static) -> Result<Machine, VmError> {
        let bootstrap = ClassLoader::new(
            LoaderId::BOOTSTRAP,
            None,
            Box::new(Fallback {
                primary: Box::new(provider),
                secondary: core_library(),
            }),
        );
        let mut machine = Machine {
            scheduler: Scheduler::new(&config),
            monitors: MonitorTable::new(config.rng_seed),
            config,
            loaders: vec![bootstrap],
            heap: Heap::new(),
            threads: vec![],
            thread_objects: HashMap::new(),
            natives: NativeRegistry::new(),
            famous: OnceCell::new(),
            pending_async: HashMap::new(),
            next_async_token: 0,
            linking: HashSet::new(),
            halted: None,
            async_handle: AsyncHandle::default(),
        };
        machine.init_famous_classes()?;
        tracing::info!(
            quickening = machine.config.quickening,
            trace_fusion = machine.config.trace_fusion,
            "machine booted"
        );
        Ok(machine)
    }

    /// Child loader delegating to `parent` first.
    pub fn new_loader(
        &mut self,
        parent: LoaderId,
        provider: impl ClassProvider + 'static,
    ) -> LoaderId {
        let id = LoaderId(self.loaders.len());
        self.loaders
            .push(ClassLoader::new(id, Some(parent), Box::new(provider)));
        tracing::debug!(loader = id.0, parent = parent.0, "class loader created");
        id
    }

    /// Classes defined or initiated by `loader`, in load order.
    pub fn loaded_classes(&self, loader: LoaderId) -> Vec<Arc<Class>> {
        self.loaders
            .get(loader.0)
            .map(|l| l.classes().to_vec())
            .unwrap_or_default()
    }

    pub fn class_state(&self, loader: LoaderId, name: &str) -> Option<ClassState> {
        self.loaders.get(loader.0)?.cached(name).map(|c| c.state())
    }

    /// Binds `function` to a native method. Methods already called keep their binding.
    pub fn register_native(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
        function: NativeFunction,
    ) {
        self.natives.register(class, name, descriptor, function);
    }

    /// A thread with a fresh `java/lang/Thread` object, in state `New` until it is given an
    /// entry point with [`Machine::run_method`].
    pub fn spawn_thread(&mut self, name: &str) -> ThreadId {
        let id = ThreadId(self.threads.len());
        let thread_class = Arc::clone(&self.famous().thread);
        let object = self.heap.allocate_object(Arc::clone(&thread_class));
        let name_string = self.new_string(name);
        if let Some(field) = thread_class.instance_field("name") {
            self.heap
                .put_field(object, field.slot, Variable::from_ref(name_string));
        }
        if let Some(field) = thread_class.instance_field("priority") {
            self.heap
                .put_field(object, field.slot, Variable::from_int(NORM_PRIORITY));
        }
        self.threads.push(Thread::new(id, Arc::from(name), object));
        self.thread_objects.insert(object, id);
        tracing::debug!(thread = %id, name, "thread spawned");
        id
    }

    /// Schedules a call of `class.name descriptor` on a `New` thread. `args` carry the
    /// receiver first for instance methods. `callback` sees the outcome once the call
    /// returns or throws, after which the thread terminates.
    #[allow(clippy::too_many_arguments)]
    pub fn run_method(
        &mut self,
        thread: ThreadId,
        loader: LoaderId,
        class: &str,
        name: &str,
        descriptor: &str,
        args: Vec<NativeVariable>,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<(), VmError> {
        let status = self
            .thread_status(thread)
            .ok_or(VmError::ThreadNotFound(thread))?;
        if status != ThreadStatus::New {
            return Err(VmError::ThreadBusy(thread));
        }
        if loader.0 >= self.loaders.len() {
            return Err(VmError::ClassNotFound(class.to_string()));
        }
        let (_, parsed) = parse_method_descriptor(descriptor)
            .map_err(|_| VmError::ArgumentMismatch(descriptor.to_string()))?;
        let receiver = args.len() == parsed.parameters.len() + 1;
        let typed = if receiver { &args[1..] } else { &args[..] };
        let receiver_ok = !receiver || matches!(args[0], NativeVariable::Reference(_));
        if !receiver_ok
            || typed.len() != parsed.parameters.len()
            || !typed.iter().zip(&parsed.parameters).all(|(a, p)| a.matches(p))
        {
            return Err(VmError::ArgumentMismatch(descriptor.to_string()));
        }

        tracing::debug!(thread = %thread, class, name, descriptor, "entry point scheduled");
        self.thread_mut(thread).stack = vec![
            Frame::Continuation(ContinuationFrame::Completion {
                return_type: parsed.return_type,
                callback: Some(Box::new(callback)),
            }),
            Frame::Continuation(ContinuationFrame::Entry {
                loader,
                class_name: Arc::from(class),
                name: Arc::from(name),
                descriptor: Arc::from(descriptor),
                args,
            }),
        ];
        self.wake(thread);
        Ok(())
    }

    /// Runs a static method on a new thread in the bootstrap loader and drives the machine
    /// until it completes. Other threads keep their turns meanwhile.
    pub fn invoke_static(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        args: Vec<NativeVariable>,
    ) -> Result<Completion, VmError> {
        let thread = self.spawn_thread("main");
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        self.run_method(
            thread,
            LoaderId::BOOTSTRAP,
            class,
            name,
            descriptor,
            args,
            move |completion| *slot.lock() = Some(completion),
        )?;
        loop {
            if let Some(completion) = result.lock().take() {
                return Ok(completion);
            }
            match self.step()? {
                RunState::Running => {}
                RunState::Sleeping(deadline) => self.async_handle.wait(Some(deadline)),
                RunState::AwaitingHost => self.async_handle.wait(None),
                RunState::Finished => {
                    // the completion fires before its thread terminates
                    return result.lock().take().ok_or(VmError::ThreadNotFound(thread));
                }
            }
        }
    }

    /// One scheduling round: applies host answers, fires due timers and runs one quantum of
    /// the next runnable thread.
    pub fn step(&mut self) -> Result<RunState, VmError> {
        if let Some(status) = self.halted {
            return Err(VmError::Halted(status));
        }
        self.drain_async()?;
        self.fire_timers(Instant::now());
        let Some(id) = self.next_runnable() else {
            return self.idle_state();
        };
        let budget = self.quantum_for(id);
        let started = Instant::now();
        let steps = self.run_quantum(id, budget);
        self.scheduler.record(steps, started.elapsed());
        if let Some(status) = self.halted {
            return Err(VmError::Halted(status));
        }
        if self.thread(id).status == ThreadStatus::Runnable {
            self.scheduler.enqueue(id);
        }
        Ok(RunState::Running)
    }

    /// Runs until every thread has terminated, sleeping through idle periods. Waiting on the
    /// host needs answers through an [`AsyncHandle`] from another thread.
    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            match self.step()? {
                RunState::Running => {}
                RunState::Sleeping(deadline) => self.async_handle.wait(Some(deadline)),
                RunState::AwaitingHost => self.async_handle.wait(None),
                RunState::Finished => return Ok(()),
            }
        }
    }

    fn idle_state(&self) -> Result<RunState, VmError> {
        let live: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|t| t.status.is_alive())
            .map(|t| t.id)
            .collect();
        if live.is_empty() {
            return Ok(RunState::Finished);
        }
        if let Some(deadline) = self.next_deadline() {
            return Ok(RunState::Sleeping(deadline));
        }
        if !self.pending_async.is_empty() {
            return Ok(RunState::AwaitingHost);
        }
        tracing::error!(threads = ?live, "no thread can make progress");
        Err(VmError::Deadlock(live))
    }

    /// Terminates every thread without unwinding. Later steps report [`VmError::Halted`].
    pub fn halt(&mut self, status: i32) {
        if self.halted.is_some() {
            return;
        }
        tracing::info!(status, "machine halted");
        self.halted = Some(status);
        for i in 0..self.threads.len() {
            let id = ThreadId(i);
            if self.thread(id).status != ThreadStatus::Terminated {
                self.thread_mut(id).stack.clear();
                self.set_status(id, ThreadStatus::Terminated);
            }
        }
        self.pending_async.clear();
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.halted
    }

    pub fn async_handle(&self) -> AsyncHandle {
        self.async_handle.clone()
    }

    /// Operations still waiting on the host.
    pub fn pending_operations(&self) -> Vec<AsyncToken> {
        let mut tokens: Vec<_> = self.pending_async.keys().copied().collect();
        tokens.sort();
        tokens
    }

    /// Applies an answer directly, without going through an [`AsyncHandle`].
    pub fn complete_async(&mut self, token: AsyncToken, outcome: AsyncOutcome) -> Result<(), VmError> {
        let op = self
            .pending_async
            .remove(&token)
            .ok_or(VmError::UnknownAsyncToken(token.id()))?;
        tracing::debug!(%token, ?op, "asynchronous operation completed");
        match op {
            PendingOp::ClassLookup { loader, name } => {
                self.complete_class_lookup(loader, name, outcome)
            }
            PendingOp::Native { thread } => {
                if self.thread(thread).status == ThreadStatus::AsyncWaiting {
                    self.thread_mut(thread).async_result = Some(outcome);
                    self.wake(thread);
                }
            }
        }
        Ok(())
    }

    /// Applies every answer queued on the [`AsyncHandle`]. An unknown token is reported after
    /// the remaining answers are applied.
    pub fn drain_async(&mut self) -> Result<(), VmError> {
        let mut result = Ok(());
        for (token, outcome) in self.async_handle.take_all() {
            if let Err(err) = self.complete_async(token, outcome) {
                tracing::warn!(%token, "answer for an operation that is not pending");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    pub fn thread_status(&self, id: ThreadId) -> Option<ThreadStatus> {
        self.threads.get(id.0).map(|t| t.status)
    }

    /// The throwable that terminated `id`, if any.
    pub fn uncaught_exception(&self, id: ThreadId) -> Result<Option<ObjRef>, VmError> {
        self.threads
            .get(id.0)
            .map(|t| t.uncaught)
            .ok_or(VmError::ThreadNotFound(id))
    }

    /// Call stack of a thread that is not running, innermost frame first.
    pub fn stack_trace(&self, id: ThreadId) -> Result<Vec<StackTraceElement>, VmError> {
        let thread = self.threads.get(id.0).ok_or(VmError::ThreadNotFound(id))?;
        let element = |method: &Method, pc: Option<usize>| StackTraceElement {
            class_name: method.class_name.to_string(),
            method_name: method.name.to_string(),
            descriptor: method.raw_descriptor.to_string(),
            pc,
            source_file: method.class().source_file.as_deref().map(str::to_string),
            line: pc.and_then(|pc| method.line_number(pc)),
        };
        Ok(thread
            .stack
            .iter()
            .rev()
            .filter_map(|frame| match frame {
                Frame::Interpreted(frame) => Some(element(&frame.method, Some(frame.pc))),
                Frame::Native(frame) => Some(element(&frame.method, None)),
                Frame::Continuation(_) => None,
            })
            .collect())
    }

    /// Allocates a fresh, non-interned string.
    pub fn new_string(&mut self, value: &str) -> ObjRef {
        let string_class = Arc::clone(&self.famous().string);
        self.heap.allocate_string(string_class, Arc::from(value))
    }

    /// The canonical string object for `value`.
    pub fn intern(&mut self, value: &str) -> ObjRef {
        let string_class = Arc::clone(&self.famous().string);
        self.heap.intern_string(&string_class, value)
    }

    pub fn string_value(&self, string: ObjRef) -> Option<String> {
        if string == 0 {
            return None;
        }
        self.heap.string_value(string).map(|s| s.to_string())
    }

    /// Releases an object the host knows to be unreachable. Objects the engine still reaches
    /// on its own are kept and `false` is returned: a monitor in use, the object of a live
    /// thread, a class mirror or an interned string.
    pub fn free_object(&mut self, object: ObjRef) -> bool {
        if !self.heap.contains(object)
            || self.monitors.in_use(object)
            || self.heap.is_pinned(object)
        {
            return false;
        }
        if let Some(&thread) = self.thread_objects.get(&object) {
            if self.thread(thread).status != ThreadStatus::Terminated {
                return false;
            }
            self.thread_objects.remove(&object);
        }
        self.monitors.forget(object);
        self.heap.deallocate(object);
        true
    }

    pub(crate) fn new_method_type(&mut self, descriptor: Arc<str>) -> ObjRef {
        let method_type_class = Arc::clone(&self.famous().method_type);
        self.heap.allocate_method_type(method_type_class, descriptor)
    }

    pub(crate) fn new_method_handle(
        &mut self,
        kind: RefKind,
        method: Arc<Method>,
        appendix: Option<ObjRef>,
    ) -> ObjRef {
        let method_handle_class = Arc::clone(&self.famous().method_handle);
        self.heap
            .allocate_method_handle(method_handle_class, kind, method, appendix)
    }

    /// The `java/lang/Class` instance of `class`, created on first use.
    pub(crate) fn class_mirror(&mut self, class: &Arc<Class>) -> ObjRef {
        if let Some(mirror) = class.mirror.get() {
            return *mirror;
        }
        let class_class = Arc::clone(&self.famous().class);
        let mirror = self.heap.allocate_mirror(class_class, Arc::clone(class));
        *class.mirror.get_or_init(|| mirror)
    }

    /// Starts an engine thread running `run()V` on a `java/lang/Thread` instance.
    pub(crate) fn start_thread(&mut self, object: ObjRef) -> Result<(), Exception> {
        let id = ThreadId(self.threads.len());
        let class = Arc::clone(self.heap.class_of(object));
        let run = class
            .find_virtual("run", "()V")
            .cloned()
            .ok_or_else(|| Exception::new_vm_msg(NO_SUCH_METHOD_ERROR, "run()V"))?;
        let frame = self.build_frame(run, vec![Variable::from_ref(object)])?;

        let thread_class = Arc::clone(&self.famous().thread);
        let name = thread_class
            .instance_field("name")
            .map(|field| self.heap.get_field(object, field.slot).reference())
            .filter(|&string| string != 0)
            .and_then(|string| self.heap.string_value(string).cloned())
            .unwrap_or_else(|| Arc::from(format!("Thread-{}", id.0)));
        let priority = thread_class
            .instance_field("priority")
            .map(|field| self.heap.get_field(object, field.slot).int())
            .filter(|p| (MIN_PRIORITY..=MAX_PRIORITY).contains(p))
            .unwrap_or(NORM_PRIORITY);

        let mut thread = Thread::new(id, name, object);
        thread.priority = priority;
        thread.stack.push(frame);
        tracing::debug!(thread = %id, name = %thread.name, priority, "thread started");
        self.threads.push(thread);
        self.thread_objects.insert(object, id);
        self.wake(id);
        Ok(())
    }
}

impl Debug for Machine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("loaders", &self.loaders.len())
            .field("threads", &self.threads.len())
            .field("heap", &self.heap.len())
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MapProvider, NativeEnv, NativeResult, NativeReturn,
        class::builder::{Assembler, ClassFileBuilder},
        consts::MethodAccessFlag as M,
        runtime::{Enter, NULL, instructions as inst},
    };

    fn machine(provider: MapProvider) -> Machine {
        Machine::new(VmConfig::default(), provider).unwrap()
    }

    fn static_method(name: &str, descriptor: &str, asm: Assembler) -> ClassFile {
        let mut builder = ClassFileBuilder::new("t/Main");
        builder.source_file("Main.java").method(
            M::PUBLIC | M::STATIC,
            name,
            descriptor,
            asm.finish().unwrap(),
        );
        builder.build()
    }

    #[test]
    fn test_run_method_checks_arguments() {
        let mut asm = Assembler::new(1);
        asm.op(inst::ILOAD_0).op(inst::IRETURN);
        let mut vm = machine(MapProvider::new().with(static_method("id", "(I)I", asm)));
        let thread = vm.spawn_thread("main");
        let err = vm
            .run_method(
                thread,
                LoaderId::BOOTSTRAP,
                "t/Main",
                "id",
                "(I)I",
                vec![NativeVariable::Long(1)],
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, VmError::ArgumentMismatch(_)));
        assert!(matches!(
            vm.run_method(thread, LoaderId::BOOTSTRAP, "t/Main", "id", "(I", vec![], |_| {}),
            Err(VmError::ArgumentMismatch(_))
        ));
        assert!(matches!(
            vm.run_method(ThreadId(42), LoaderId::BOOTSTRAP, "t/Main", "id", "(I)I", vec![], |_| {}),
            Err(VmError::ThreadNotFound(_))
        ));

        vm.run_method(
            thread,
            LoaderId::BOOTSTRAP,
            "t/Main",
            "id",
            "(I)I",
            vec![NativeVariable::Int(7)],
            |_| {},
        )
        .unwrap();
        assert!(matches!(
            vm.run_method(
                thread,
                LoaderId::BOOTSTRAP,
                "t/Main",
                "id",
                "(I)I",
                vec![NativeVariable::Int(7)],
                |_| {}
            ),
            Err(VmError::ThreadBusy(_))
        ));
        vm.run().unwrap();
        assert_eq!(vm.thread_status(thread), Some(ThreadStatus::Terminated));
    }

    #[test]
    fn test_invoke_static_returns_value() {
        let mut asm = Assembler::new(2);
        asm.op(inst::ILOAD_0).op(inst::ILOAD_1).op(inst::IMUL).op(inst::IRETURN);
        let mut vm = machine(MapProvider::new().with(static_method("mul", "(II)I", asm)));
        let completion = vm
            .invoke_static(
                "t/Main",
                "mul",
                "(II)I",
                vec![NativeVariable::Int(6), NativeVariable::Int(7)],
            )
            .unwrap();
        assert_eq!(completion, Completion::Returned(Some(NativeVariable::Int(42))));
        assert_eq!(vm.class_state(LoaderId::BOOTSTRAP, "t/Main"), Some(ClassState::Initialized));
    }

    #[test]
    fn test_missing_class_reaches_callback() {
        let mut vm = machine(MapProvider::new());
        let completion = vm.invoke_static("t/Nope", "f", "()V", vec![]).unwrap();
        let Completion::Threw(throwable) = completion else {
            panic!("expected a throwable, got {completion:?}");
        };
        assert_eq!(
            vm.describe_throwable(throwable),
            "java.lang.NoClassDefFoundError: t.Nope"
        );
    }

    #[test]
    fn test_wait_forever_is_deadlock() {
        let mut builder = ClassFileBuilder::new("t/Main");
        let object = builder.class("java/lang/Object");
        let init = builder.method_ref("java/lang/Object", "<init>", "()V");
        let wait = builder.method_ref("java/lang/Object", "wait", "()V");
        let mut asm = Assembler::new(1);
        asm.op_u16(inst::NEW, object)
            .op(inst::DUP)
            .op_u16(inst::INVOKESPECIAL, init)
            .op(inst::ASTORE_0)
            .op(inst::ALOAD_0)
            .op(inst::MONITORENTER)
            .op(inst::ALOAD_0)
            .op_u16(inst::INVOKEVIRTUAL, wait)
            .op(inst::RETURN);
        builder.method(M::PUBLIC | M::STATIC, "main", "()V", asm.finish().unwrap());
        let mut vm = machine(MapProvider::new().with(builder.build()));

        let thread = vm.spawn_thread("main");
        vm.run_method(thread, LoaderId::BOOTSTRAP, "t/Main", "main", "()V", vec![], |_| {})
            .unwrap();
        let err = vm.run().unwrap_err();
        assert!(matches!(err, VmError::Deadlock(ref threads) if threads == &vec![thread]));
        assert_eq!(vm.thread_status(thread), Some(ThreadStatus::Waiting));
    }

    #[test]
    fn test_stack_trace_of_sleeping_thread() {
        let mut builder = ClassFileBuilder::new("t/Main");
        builder.source_file("Main.java");
        let millis = builder.long(60_000);
        let sleep = builder.method_ref("java/lang/Thread", "sleep", "(J)V");
        let mut asm = Assembler::new(0);
        asm.line(3)
            .op_u16(inst::LDC2_W, millis)
            .line(4)
            .op_u16(inst::INVOKESTATIC, sleep)
            .op(inst::RETURN);
        builder.method(M::PUBLIC | M::STATIC, "main", "()V", asm.finish().unwrap());
        let mut vm = machine(MapProvider::new().with(builder.build()));

        let thread = vm.spawn_thread("main");
        vm.run_method(thread, LoaderId::BOOTSTRAP, "t/Main", "main", "()V", vec![], |_| {})
            .unwrap();
        for _ in 0..100 {
            if vm.thread_status(thread) == Some(ThreadStatus::TimedWaiting) {
                break;
            }
            vm.step().unwrap();
        }
        assert_eq!(vm.thread_status(thread), Some(ThreadStatus::TimedWaiting));
        assert!(matches!(vm.step().unwrap(), RunState::Sleeping(_)));

        let trace = vm.stack_trace(thread).unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].to_string(), "java.lang.Thread.sleep(Native Method)");
        assert_eq!(trace[1].pc, Some(3));
        assert_eq!(trace[1].to_string(), "t.Main.main(Main.java:4)");
    }

    #[test]
    fn test_halt_terminates_everything() {
        let mut vm = machine(MapProvider::new());
        let a = vm.spawn_thread("a");
        let b = vm.spawn_thread("b");
        vm.wake(a);
        vm.halt(3);
        vm.halt(4);
        assert_eq!(vm.exit_status(), Some(3));
        assert_eq!(vm.thread_status(a), Some(ThreadStatus::Terminated));
        assert_eq!(vm.thread_status(b), Some(ThreadStatus::Terminated));
        assert!(matches!(vm.run(), Err(VmError::Halted(3))));
    }

    fn native_fetch(mut env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
        if !env.resumed {
            env.begin_async();
            return Ok(NativeReturn::Suspend);
        }
        Ok(NativeReturn::Value(env.take_async_result()?))
    }

    #[test]
    fn test_native_waits_on_host() {
        let mut builder = ClassFileBuilder::new("t/Io");
        builder.native_method(M::PUBLIC | M::STATIC, "fetch", "()I");
        let mut vm = machine(MapProvider::new().with(builder.build()));
        vm.register_native("t/Io", "fetch", "()I", native_fetch);

        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let thread = vm.spawn_thread("io");
        vm.run_method(thread, LoaderId::BOOTSTRAP, "t/Io", "fetch", "()I", vec![], move |c| {
            *slot.lock() = Some(c)
        })
        .unwrap();
        while vm.pending_operations().is_empty() {
            vm.step().unwrap();
        }
        assert_eq!(vm.thread_status(thread), Some(ThreadStatus::AsyncWaiting));
        assert_eq!(vm.step().unwrap(), RunState::AwaitingHost);

        let token = vm.pending_operations()[0];
        let handle = vm.async_handle();
        std::thread::spawn(move || {
            handle.complete(token, AsyncOutcome::Value(Some(NativeVariable::Int(9))))
        })
        .join()
        .unwrap();
        vm.run().unwrap();
        assert_eq!(
            result.lock().take(),
            Some(Completion::Returned(Some(NativeVariable::Int(9))))
        );
        assert!(matches!(
            vm.complete_async(token, AsyncOutcome::ClassNotFound),
            Err(VmError::UnknownAsyncToken(_))
        ));
    }

    #[test]
    fn test_free_object_keeps_reachable_objects() {
        let mut vm = machine(MapProvider::new());
        let thread = vm.spawn_thread("main");
        vm.wake(thread);
        let lock = vm.new_string("lock");
        assert_eq!(vm.monitor_enter(thread, lock, 1), Enter::Acquired);
        assert!(!vm.free_object(lock));

        vm.monitor_exit(thread, lock).unwrap();
        assert!(vm.free_object(lock));
        assert!(!vm.free_object(lock));
        // the slot is reused and the new object starts unlocked
        let fresh = vm.new_string("fresh");
        assert_eq!(fresh, lock);
        assert_eq!(vm.monitors.owner(fresh), None);
        assert_eq!(vm.monitors.count(fresh), 0);

        let interned = vm.intern("canonical");
        assert!(!vm.free_object(interned));
        assert_eq!(vm.intern("canonical"), interned);
        assert!(!vm.free_object(NULL));
    }
}

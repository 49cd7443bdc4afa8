use std::sync::Arc;

use crate::runtime::{
    Completion, Exception, Flow, Frame, LoaderId, Machine, Next, ObjRef, ThreadId, Variable,
    famous_classes::{
        BOOTSTRAP_METHOD_ERROR, ERROR, EXCEPTION_IN_INITIALIZER_ERROR, INTERNAL_ERROR, THROWABLE,
    },
    inheritance::{is_assignable_to, is_subclass_of_name},
    interpreter::{ContinuationFrame, FrameLock, InterpretedFrame},
};

impl Machine {
    /// Heap throwable for `exception`. Engine-raised throwables skip their constructors:
    /// message and cause are stored straight into the fields.
    pub(crate) fn materialize(&mut self, exception: Exception) -> ObjRef {
        let (exception_type, message, cause) = match exception {
            Exception::UserException(throwable) => return throwable,
            Exception::VmException {
                exception_type,
                message,
                cause,
            } => (exception_type, message, cause),
        };
        let class = self
            .load_and_link(None, LoaderId::BOOTSTRAP, &exception_type)
            .ok()
            .filter(|class| is_subclass_of_name(class, THROWABLE));
        let (class, message) = match class {
            Some(class) => (class, message),
            None => {
                tracing::warn!(%exception_type, "not a loadable throwable, raising InternalError");
                let message = match message {
                    Some(message) => format!("{exception_type}: {message}"),
                    None => exception_type.to_string(),
                };
                let famous = self.famous();
                let internal = self.loaders[LoaderId::BOOTSTRAP.0]
                    .cached(INTERNAL_ERROR)
                    .unwrap_or_else(|| Arc::clone(&famous.throwable));
                (internal, Some(message))
            }
        };
        let throwable = self.heap.allocate_object(class);
        let throwable_class = Arc::clone(&self.famous().throwable);
        if let Some(message) = message {
            let string = self.new_string(&message);
            if let Some(field) = throwable_class.instance_field("detailMessage") {
                self.heap
                    .put_field(throwable, field.slot, Variable::from_ref(string));
            }
        }
        if let Some(cause) = cause {
            if let Some(field) = throwable_class.instance_field("cause") {
                self.heap
                    .put_field(throwable, field.slot, Variable::from_ref(cause));
            }
        }
        throwable
    }

    /// `Class: message` for logs and host reports.
    pub(crate) fn describe_throwable(&self, throwable: ObjRef) -> String {
        let class = self.heap.class_of(throwable);
        let name = class.class_name.replace('/', ".");
        let message = self
            .famous()
            .throwable
            .instance_field("detailMessage")
            .map(|field| self.heap.get_field(throwable, field.slot).reference())
            .filter(|&string| string != 0)
            .and_then(|string| self.heap.string_value(string));
        match message {
            Some(message) => format!("{name}: {message}"),
            None => name,
        }
    }

    /// Pops frames until a handler takes `exception`. Continuations on the way record the
    /// failure; an empty stack leaves the throwable as the thread's uncaught exception.
    pub(crate) fn unwind(&mut self, id: ThreadId, stack: &mut Vec<Frame>, exception: Exception) {
        let mut throwable = self.materialize(exception);
        loop {
            if let Some(Frame::Interpreted(frame)) = stack.last_mut() {
                match self.find_handler(id, frame, throwable) {
                    Ok(Some(handler)) => {
                        tracing::trace!(
                            thread = %id,
                            method = %frame.method.name,
                            handler,
                            "exception caught"
                        );
                        frame.stack.clear();
                        frame.push_ref(throwable);
                        frame.pc = handler;
                        return;
                    }
                    Ok(None) => {}
                    Err(_) => {
                        // a catch type is still being loaded; unwinding resumes with the thread
                        self.thread_mut(id).pending_exception = Some(Exception::new(throwable));
                        return;
                    }
                }
            }

            let Some(mut frame) = stack.pop() else {
                tracing::warn!(
                    thread = %id,
                    name = %self.thread(id).name,
                    exception = %self.describe_throwable(throwable),
                    "uncaught exception"
                );
                self.thread_mut(id).uncaught = Some(throwable);
                return;
            };
            if let Some(FrameLock::Held(object)) = frame.lock_mut().copied() {
                if self.monitor_exit(id, object).is_err() {
                    tracing::warn!(thread = %id, object, "synchronized frame lost its monitor");
                }
            }
            let Frame::Continuation(continuation) = frame else {
                continue;
            };
            match continuation {
                ContinuationFrame::ClassInit { class } => {
                    throwable = self.wrap_unless_error(throwable, EXCEPTION_IN_INITIALIZER_ERROR);
                    self.finish_initialization(&class, Some(throwable));
                }
                ContinuationFrame::IndyLink { class, pc, .. } => {
                    tracing::debug!(class = %class.class_name, pc, "bootstrap method failed");
                    throwable = self.wrap_unless_error(throwable, BOOTSTRAP_METHOD_ERROR);
                }
                ContinuationFrame::Completion { callback, .. } => {
                    tracing::warn!(
                        thread = %id,
                        exception = %self.describe_throwable(throwable),
                        "entry point threw"
                    );
                    self.thread_mut(id).uncaught = Some(throwable);
                    if let Some(callback) = callback {
                        callback(Completion::Threw(throwable));
                    }
                    return;
                }
                ContinuationFrame::Entry { .. } => {}
            }
        }
    }

    fn wrap_unless_error(&mut self, throwable: ObjRef, wrapper: &str) -> ObjRef {
        if is_subclass_of_name(self.heap.class_of(throwable), ERROR) {
            return throwable;
        }
        self.materialize(Exception::new_vm(wrapper).with_cause(throwable))
    }

    /// Handler pc for `throwable` at the frame's current pc, in exception table order.
    fn find_handler(
        &mut self,
        id: ThreadId,
        frame: &InterpretedFrame,
        throwable: ObjRef,
    ) -> Flow<Option<usize>> {
        let thrown = Arc::clone(self.heap.class_of(throwable));
        let method = Arc::clone(&frame.method);
        for entry in &method.code().exception_table {
            if frame.pc < entry.start_pc as usize || frame.pc >= entry.end_pc as usize {
                continue;
            }
            if entry.catch_type == 0 {
                return Ok(Some(entry.handler_pc as usize));
            }
            match self.resolve_class_ref(id, &frame.class, entry.catch_type) {
                Ok(catch) if is_assignable_to(&thrown, &catch) => {
                    return Ok(Some(entry.handler_pc as usize));
                }
                Ok(_) => {}
                Err(Next::Throw(exception)) => {
                    tracing::debug!(
                        method = %method.name,
                        catch_type = entry.catch_type,
                        ?exception,
                        "catch type does not resolve, skipping handler"
                    );
                }
                Err(next) => return Err(next),
            }
        }
        Ok(None)
    }
}

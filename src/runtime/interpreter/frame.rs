use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use crate::{
    descriptor::ReturnType,
    runtime::{
        Class, Exception, LoaderId, Method, NativeFunction, NativeVariable, ObjRef, Variable,
    },
};

/// Host-visible outcome of a `run_method` entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Returned(Option<NativeVariable>),
    Threw(ObjRef),
}

pub(crate) type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

#[derive(Debug)]
pub(crate) enum Frame {
    Interpreted(InterpretedFrame),
    Native(NativeFrame),
    Continuation(ContinuationFrame),
}

#[derive(Debug)]
pub(crate) struct InterpretedFrame {
    pub(crate) class: Arc<Class>,
    pub(crate) method: Arc<Method>,
    // not advanced until the instruction at pc completes
    pub(crate) pc: usize,
    pub(crate) locals: Vec<Variable>,
    pub(crate) stack: Vec<Variable>,
    pub(crate) lock: FrameLock,
}

#[derive(Debug)]
pub(crate) struct NativeFrame {
    pub(crate) method: Arc<Method>,
    pub(crate) function: NativeFunction,
    pub(crate) args: Vec<NativeVariable>,
    // set once the body asked to be suspended; it is called again when the thread resumes
    pub(crate) resumed: bool,
    pub(crate) lock: FrameLock,
}

/// Monitor taken on behalf of a `synchronized` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameLock {
    None,
    // acquired before the first instruction runs
    Pending(ObjRef),
    Held(ObjRef),
}

pub(crate) enum ContinuationFrame {
    /// Sits under a `<clinit>` frame and records its outcome.
    ClassInit { class: Arc<Class> },
    /// Sits under a bootstrap method frame and links the call site with its result.
    IndyLink {
        class: Arc<Class>,
        cp_index: u16,
        method_index: usize,
        pc: usize,
    },
    /// Bottom of a host entry point.
    Completion {
        return_type: ReturnType,
        callback: Option<CompletionCallback>,
    },
    /// Resolves and calls the entry method once it reaches the top of the stack.
    Entry {
        loader: LoaderId,
        class_name: Arc<str>,
        name: Arc<str>,
        descriptor: Arc<str>,
        args: Vec<NativeVariable>,
    },
}

impl Debug for ContinuationFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ContinuationFrame::ClassInit { class } => {
                f.debug_struct("ClassInit").field("class", &class.class_name).finish()
            }
            ContinuationFrame::IndyLink {
                class, cp_index, pc, ..
            } => f
                .debug_struct("IndyLink")
                .field("class", &class.class_name)
                .field("cp_index", cp_index)
                .field("pc", pc)
                .finish(),
            ContinuationFrame::Completion { return_type, .. } => f
                .debug_struct("Completion")
                .field("return_type", return_type)
                .finish_non_exhaustive(),
            ContinuationFrame::Entry {
                class_name,
                name,
                descriptor,
                ..
            } => write!(f, "Entry({class_name}.{name}{descriptor})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ReturnValue {
    Void,
    Single(Variable),
    Double(Variable, Variable),
}

impl ReturnValue {
    pub(crate) fn push_to(self, stack: &mut Vec<Variable>) {
        match self {
            ReturnValue::Void => {}
            ReturnValue::Single(v) => stack.push(v),
            ReturnValue::Double(upper, lower) => {
                stack.push(upper);
                stack.push(lower);
            }
        }
    }

    pub(crate) fn reference(self) -> ObjRef {
        match self {
            ReturnValue::Single(v) => v.reference(),
            _ => 0,
        }
    }

    pub(crate) fn from_native(value: Option<NativeVariable>) -> ReturnValue {
        let mut slots = Vec::with_capacity(2);
        if let Some(value) = value {
            value.push_to(&mut slots);
        }
        match slots[..] {
            [] => ReturnValue::Void,
            [v] => ReturnValue::Single(v),
            [upper, lower, ..] => ReturnValue::Double(upper, lower),
        }
    }

    pub(crate) fn to_native(self, return_type: &ReturnType) -> Option<NativeVariable> {
        let mut slots = Vec::with_capacity(2);
        self.push_to(&mut slots);
        match return_type {
            Some(field_type) if slots.len() == field_type.slot_size() => {
                Some(NativeVariable::from_return(field_type, &slots))
            }
            _ => None,
        }
    }
}

/// Why the current frame stopped running instructions.
#[derive(Debug)]
pub(crate) enum Next {
    Return(ReturnValue),
    Invoke(Frame),
    // pushed in order, the last one ends on top; the current instruction runs again afterwards
    Push(Vec<Frame>),
    Throw(Exception),
    // thread status already changed; the same instruction runs again on resume
    Suspend,
    // quantum used up, the thread stays runnable
    Yield,
}

pub(crate) type Flow<T> = Result<T, Next>;

impl From<Exception> for Next {
    fn from(exception: Exception) -> Self {
        Next::Throw(exception)
    }
}

impl InterpretedFrame {
    pub(crate) fn new(method: Arc<Method>, args: &[Variable], lock: FrameLock) -> InterpretedFrame {
        let code = method.code();
        let mut locals = vec![Variable::ZERO; (code.max_locals as usize).max(args.len())];
        locals[..args.len()].copy_from_slice(args);
        InterpretedFrame {
            class: method.class(),
            stack: Vec::with_capacity(code.max_stack as usize),
            method,
            pc: 0,
            locals,
            lock,
        }
    }

    pub(crate) fn pop(&mut self) -> Variable {
        self.stack.pop().unwrap_or_else(|| {
            panic!(
                "operand stack underflow in {}.{} at {}",
                self.method.class_name, self.method.name, self.pc
            )
        })
    }

    pub(crate) fn push(&mut self, v: Variable) {
        self.stack.push(v);
    }

    pub(crate) fn pop_int(&mut self) -> i32 {
        self.pop().int()
    }

    pub(crate) fn pop_float(&mut self) -> f32 {
        self.pop().float()
    }

    pub(crate) fn pop_ref(&mut self) -> ObjRef {
        self.pop().reference()
    }

    pub(crate) fn pop_long(&mut self) -> i64 {
        let lower = self.pop();
        let upper = self.pop();
        Variable::get_long(upper, lower)
    }

    pub(crate) fn pop_double(&mut self) -> f64 {
        let lower = self.pop();
        let upper = self.pop();
        Variable::get_double(upper, lower)
    }

    pub(crate) fn push_int(&mut self, i: i32) {
        self.push(Variable::from_int(i));
    }

    pub(crate) fn push_float(&mut self, f: f32) {
        self.push(Variable::from_float(f));
    }

    pub(crate) fn push_ref(&mut self, r: ObjRef) {
        self.push(Variable::from_ref(r));
    }

    pub(crate) fn push_long(&mut self, l: i64) {
        let (upper, lower) = Variable::put_long(l);
        self.push(upper);
        self.push(lower);
    }

    pub(crate) fn push_double(&mut self, d: f64) {
        let (upper, lower) = Variable::put_double(d);
        self.push(upper);
        self.push(lower);
    }

    /// Pops `n` slots, preserving their order.
    pub(crate) fn pop_n(&mut self, n: usize) -> Vec<Variable> {
        let at = self.stack.len().checked_sub(n).unwrap_or_else(|| {
            panic!(
                "operand stack underflow in {}.{} at {}",
                self.method.class_name, self.method.name, self.pc
            )
        });
        self.stack.split_off(at)
    }

    /// Receiver of a call taking `arg_slots` slots (receiver included), without popping.
    pub(crate) fn peek_receiver(&self, arg_slots: usize) -> ObjRef {
        self.stack[self.stack.len() - arg_slots].reference()
    }
}

impl Frame {
    pub(crate) fn lock_mut(&mut self) -> Option<&mut FrameLock> {
        match self {
            Frame::Interpreted(frame) => Some(&mut frame.lock),
            Frame::Native(frame) => Some(&mut frame.lock),
            Frame::Continuation(_) => None,
        }
    }
}

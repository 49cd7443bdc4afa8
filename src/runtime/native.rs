mod class;
mod method_handle;
mod object;
mod shutdown;
mod string;
mod system;
mod thread;
mod unsafe_park;

use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use dashmap::DashMap;

use crate::{
    descriptor::FieldType,
    runtime::{
        AsyncOutcome, AsyncToken, BlockedOn, Exception, Machine, NativeResult, ObjRef, PendingOp,
        ThreadId, ThreadStatus, Variable,
    },
};

/// Body of a native method. Bodies that return [`NativeReturn::Suspend`] are called again
/// with `resumed` set once their thread is runnable.
pub type NativeFunction = fn(NativeEnv<'_>) -> NativeResult<NativeReturn>;

pub struct NativeEnv<'a> {
    pub(crate) machine: &'a mut Machine,
    pub thread: ThreadId,
    pub args: Vec<NativeVariable>,
    pub resumed: bool,
}

impl NativeEnv<'_> {
    /// Allocates a fresh, non-interned string.
    pub fn new_string(&mut self, value: &str) -> ObjRef {
        self.machine.new_string(value)
    }

    pub fn string_value(&self, string: ObjRef) -> Option<String> {
        if string == 0 {
            return None;
        }
        self.machine.heap.string_value(string).map(|s| s.to_string())
    }

    /// Parks the thread until the host answers with [`crate::AsyncHandle::complete`]. The body
    /// should return [`NativeReturn::Suspend`] right after and read the answer with
    /// [`NativeEnv::take_async_result`] when it is called again.
    pub fn begin_async(&mut self) -> AsyncToken {
        let token = self.machine.next_async_token();
        self.machine.pending_async.insert(
            token,
            PendingOp::Native {
                thread: self.thread,
            },
        );
        self.machine.block(
            self.thread,
            ThreadStatus::AsyncWaiting,
            BlockedOn::AsyncOp(token),
            None,
        );
        tracing::debug!(thread = %self.thread, %token, "native waiting on host");
        token
    }

    /// The host's answer to the last [`NativeEnv::begin_async`]. Failures become throwables.
    pub fn take_async_result(&mut self) -> NativeResult<Option<NativeVariable>> {
        match self.machine.thread_mut(self.thread).async_result.take() {
            Some(AsyncOutcome::Value(value)) => Ok(value),
            Some(AsyncOutcome::Failed { exception, message }) => Err(match message {
                Some(message) => Exception::new_vm_msg(&exception, message),
                None => Exception::new_vm(&exception),
            }),
            Some(other) => Err(Exception::new_vm_msg(
                crate::runtime::famous_classes::INTERNAL_ERROR,
                format!("unexpected asynchronous answer {other:?}"),
            )),
            None => Ok(None),
        }
    }
}

impl Debug for NativeEnv<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEnv")
            .field("thread", &self.thread)
            .field("args", &self.args)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NativeReturn {
    Value(Option<NativeVariable>),
    /// The body changed its thread's status (blocked, sleeping, waiting on the host) or
    /// wants to give up its quantum; the native frame stays on the stack.
    Suspend,
}

impl NativeReturn {
    pub const VOID: NativeReturn = NativeReturn::Value(None);
}

impl From<NativeVariable> for NativeReturn {
    fn from(value: NativeVariable) -> Self {
        NativeReturn::Value(Some(value))
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum NativeVariable {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(ObjRef),
}

macro_rules! native_getters {
    ($($getter:ident => $variant:ident: $t:ty),* $(,)?) => {
        $(
            pub fn $getter(&self) -> $t {
                match self {
                    NativeVariable::$variant(v) => *v,
                    other => panic!(concat!(stringify!($getter), ": invalid type {:?}"), other),
                }
            }
        )*
    };
}

impl NativeVariable {
    native_getters! {
        get_boolean => Boolean: bool,
        get_byte => Byte: i8,
        get_char => Char: u16,
        get_short => Short: i16,
        get_int => Int: i32,
        get_long => Long: i64,
        get_float => Float: f32,
        get_double => Double: f64,
        get_ref => Reference: ObjRef,
    }

    /// Whether this value may be passed where `field_type` is declared.
    pub fn matches(&self, field_type: &FieldType) -> bool {
        matches!(
            (self, field_type),
            (NativeVariable::Boolean(_), FieldType::Boolean)
                | (NativeVariable::Byte(_), FieldType::Byte)
                | (NativeVariable::Char(_), FieldType::Char)
                | (NativeVariable::Short(_), FieldType::Short)
                | (NativeVariable::Int(_), FieldType::Int)
                | (NativeVariable::Long(_), FieldType::Long)
                | (NativeVariable::Float(_), FieldType::Float)
                | (NativeVariable::Double(_), FieldType::Double)
                | (
                    NativeVariable::Reference(_),
                    FieldType::Object(_) | FieldType::Array(_)
                )
        )
    }

    /// Reads one value of `field_type` from `slots`, advancing `at`.
    pub(crate) fn from_slots(field_type: &FieldType, slots: &[Variable], at: &mut usize) -> Self {
        let v = slots[*at];
        *at += field_type.slot_size();
        match field_type {
            FieldType::Boolean => NativeVariable::Boolean(v.int() != 0),
            FieldType::Byte => NativeVariable::Byte(v.int() as i8),
            FieldType::Char => NativeVariable::Char(v.int() as u16),
            FieldType::Short => NativeVariable::Short(v.int() as i16),
            FieldType::Int => NativeVariable::Int(v.int()),
            FieldType::Float => NativeVariable::Float(v.float()),
            FieldType::Long => NativeVariable::Long(Variable::get_long(v, slots[*at - 1])),
            FieldType::Double => NativeVariable::Double(Variable::get_double(v, slots[*at - 1])),
            FieldType::Object(_) | FieldType::Array(_) => NativeVariable::Reference(v.reference()),
        }
    }

    pub(crate) fn push_to(self, slots: &mut Vec<Variable>) {
        match self {
            NativeVariable::Boolean(b) => slots.push(Variable::from_int(b as i32)),
            NativeVariable::Byte(b) => slots.push(Variable::from_int(b as i32)),
            NativeVariable::Char(c) => slots.push(Variable::from_int(c as i32)),
            NativeVariable::Short(s) => slots.push(Variable::from_int(s as i32)),
            NativeVariable::Int(i) => slots.push(Variable::from_int(i)),
            NativeVariable::Float(f) => slots.push(Variable::from_float(f)),
            NativeVariable::Reference(r) => slots.push(Variable::from_ref(r)),
            NativeVariable::Long(l) => {
                let (upper, lower) = Variable::put_long(l);
                slots.push(upper);
                slots.push(lower);
            }
            NativeVariable::Double(d) => {
                let (upper, lower) = Variable::put_double(d);
                slots.push(upper);
                slots.push(lower);
            }
        }
    }

    /// Narrows an int-like return value to what the declared return type holds.
    pub(crate) fn from_return(field_type: &FieldType, slots: &[Variable]) -> Self {
        Self::from_slots(field_type, slots, &mut 0)
    }
}

// key: class name, method name, method descriptor
type Key = (Arc<str>, Arc<str>, Arc<str>);

/// Native bodies known to one machine.
#[derive(Default)]
pub(crate) struct NativeRegistry {
    functions: DashMap<Key, NativeFunction>,
}

impl NativeRegistry {
    pub(crate) fn new() -> NativeRegistry {
        let registry = NativeRegistry::default();
        object::register_natives(&registry);
        thread::register_natives(&registry);
        system::register_natives(&registry);
        shutdown::register_natives(&registry);
        string::register_natives(&registry);
        unsafe_park::register_natives(&registry);
        method_handle::register_natives(&registry);
        class::register_natives(&registry);
        registry
    }

    pub(crate) fn register(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
        function: NativeFunction,
    ) {
        self.functions
            .insert((Arc::from(class), Arc::from(name), Arc::from(descriptor)), function);
    }

    pub(crate) fn lookup(&self, class: &str, name: &str, descriptor: &str) -> Option<NativeFunction> {
        self.functions
            .get(&(Arc::from(class), Arc::from(name), Arc::from(descriptor)))
            .map(|f| *f)
    }
}

impl Debug for NativeRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("functions", &self.functions.len())
            .finish()
    }
}

pub(crate) fn null_pointer() -> Exception {
    Exception::new_vm(crate::runtime::famous_classes::NULL_POINTER_EXCEPTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_conversion() {
        let mut slots = vec![];
        NativeVariable::Int(-1).push_to(&mut slots);
        NativeVariable::Long(1 << 40).push_to(&mut slots);
        NativeVariable::Boolean(true).push_to(&mut slots);
        assert_eq!(slots.len(), 4);

        let mut at = 0;
        assert_eq!(
            NativeVariable::from_slots(&FieldType::Int, &slots, &mut at),
            NativeVariable::Int(-1)
        );
        assert_eq!(
            NativeVariable::from_slots(&FieldType::Long, &slots, &mut at),
            NativeVariable::Long(1 << 40)
        );
        assert_eq!(
            NativeVariable::from_slots(&FieldType::Boolean, &slots, &mut at),
            NativeVariable::Boolean(true)
        );
        assert_eq!(at, 4);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = NativeRegistry::new();
        assert!(registry.lookup("java/lang/Object", "hashCode", "()I").is_some());
        assert!(registry.lookup("java/lang/Object", "hashCode", "()J").is_none());
        assert!(registry.lookup("java/lang/Class", "getName", "()Ljava/lang/String;").is_some());
        registry.register("a/A", "f", "()V", |_| Ok(NativeReturn::VOID));
        assert!(registry.lookup("a/A", "f", "()V").is_some());
    }

    #[test]
    fn test_matches_descriptor_type() {
        assert!(NativeVariable::Reference(0).matches(&FieldType::Array(Box::new(FieldType::Int))));
        assert!(!NativeVariable::Int(0).matches(&FieldType::Long));
    }
}

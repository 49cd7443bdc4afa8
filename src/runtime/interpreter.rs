mod exception;
mod frame;
pub mod instructions;
mod invoke;
mod quickening;
mod trace;

use std::{cmp::Ordering, sync::Arc};

use crate::{
    consts::{T_BOOLEAN, T_BYTE, T_CHAR, T_DOUBLE, T_FLOAT, T_INT, T_LONG, T_SHORT},
    descriptor::FieldType,
    runtime::{
        ArrayElement, Class, Code, Exception, LoaderId, Machine, NULL, NativeReturn,
        NativeVariable, ObjRef, ThreadId, ThreadStatus, Variable,
        famous_classes::{
            ARITHMETIC_EXCEPTION, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, ARRAY_STORE_EXCEPTION,
            CLASS_CAST_EXCEPTION, ILLEGAL_ARGUMENT_EXCEPTION, INTERNAL_ERROR,
            NEGATIVE_ARRAY_SIZE_EXCEPTION, NO_SUCH_METHOD_ERROR, STACK_OVERFLOW_ERROR,
        },
        heap::{ArrayData, ArrayType, Heap},
        inheritance::is_assignable_to,
        monitor::Enter,
        native::{NativeEnv, null_pointer},
    },
};

pub use frame::Completion;
pub(crate) use frame::{
    CompletionCallback, ContinuationFrame, Flow, Frame, FrameLock, InterpretedFrame, NativeFrame,
    Next, ReturnValue,
};
pub(crate) use quickening::{QuickOp, array_class_name};
pub(crate) use trace::TraceSlot;

use instructions as inst;

fn divide_by_zero() -> Exception {
    Exception::new_vm_msg(ARITHMETIC_EXCEPTION, "/ by zero")
}

fn out_of_bounds(index: i32, len: usize) -> Exception {
    Exception::new_vm_msg(
        ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION,
        format!("Index {index} out of bounds for length {len}"),
    )
}

fn not_an_array() -> Exception {
    Exception::new_vm_msg(INTERNAL_ERROR, "array instruction applied to a non-array")
}

fn negative_size(count: i32) -> Exception {
    Exception::new_vm_msg(NEGATIVE_ARRAY_SIZE_EXCEPTION, count.to_string())
}

pub(crate) fn load_element<T: ArrayType>(
    heap: &Heap,
    array: ObjRef,
    index: i32,
) -> Result<T, Exception> {
    if array == NULL {
        return Err(null_pointer());
    }
    let elements = heap.array(array).and_then(T::slice).ok_or_else(not_an_array)?;
    usize::try_from(index)
        .ok()
        .and_then(|i| elements.get(i))
        .copied()
        .ok_or_else(|| out_of_bounds(index, elements.len()))
}

pub(crate) fn store_element<T: ArrayType>(
    heap: &mut Heap,
    array: ObjRef,
    index: i32,
    value: T,
) -> Result<(), Exception> {
    if array == NULL {
        return Err(null_pointer());
    }
    let elements = heap
        .array_mut(array)
        .and_then(T::slice_mut)
        .ok_or_else(not_an_array)?;
    let len = elements.len();
    match usize::try_from(index).ok().and_then(|i| elements.get_mut(i)) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(out_of_bounds(index, len)),
    }
}

fn read_u16(code: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([code[at], code[at + 1]])
}

fn read_i16(code: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([code[at], code[at + 1]])
}

// fcmpl/dcmpl push -1 for NaN, fcmpg/dcmpg push 1
fn compare<T: PartialOrd>(a: T, b: T, nan: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None => nan,
    }
}

// condition encoded by the offset of an if* opcode from the first of its group
fn branch_taken(condition: u8, ordering: Ordering) -> bool {
    match condition {
        0 => ordering == Ordering::Equal,
        1 => ordering != Ordering::Equal,
        2 => ordering == Ordering::Less,
        3 => ordering != Ordering::Less,
        4 => ordering == Ordering::Greater,
        _ => ordering != Ordering::Greater,
    }
}

fn primitive_array_type(atype: u8) -> Option<(FieldType, &'static str)> {
    Some(match atype {
        T_BOOLEAN => (FieldType::Boolean, "[Z"),
        T_CHAR => (FieldType::Char, "[C"),
        T_FLOAT => (FieldType::Float, "[F"),
        T_DOUBLE => (FieldType::Double, "[D"),
        T_BYTE => (FieldType::Byte, "[B"),
        T_SHORT => (FieldType::Short, "[S"),
        T_INT => (FieldType::Int, "[I"),
        T_LONG => (FieldType::Long, "[J"),
        _ => return None,
    })
}

struct InterpreterEnv<'m, 'f> {
    machine: &'m mut Machine,
    thread: ThreadId,
    frame: &'f mut InterpretedFrame,
}

impl<'m, 'f> InterpreterEnv<'m, 'f> {
    fn new(machine: &'m mut Machine, thread: ThreadId, frame: &'f mut InterpretedFrame) -> Self {
        Self {
            machine,
            thread,
            frame,
        }
    }

    /// Runs the frame until it returns, calls out, throws, suspends or spends `budget`.
    fn execute(&mut self, budget: &mut usize) -> Next {
        let method = Arc::clone(&self.frame.method);
        let code = method.code();
        let fusion = self.machine.config.trace_fusion;
        loop {
            if *budget == 0 {
                return Next::Yield;
            }
            if fusion {
                if let Some(TraceSlot::Compiled(trace)) = code.traces[self.frame.pc].get() {
                    *budget = budget.saturating_sub(trace.len());
                    if let Err(exception) = trace.run(self.frame, &mut self.machine.heap) {
                        return Next::Throw(exception);
                    }
                    continue;
                }
            }
            *budget -= 1;
            if let Err(next) = self.step(code) {
                return next;
            }
        }
    }

    fn step(&mut self, code: &Code) -> Flow<()> {
        let bytecode = &code.bytecode[..];
        let pc = self.frame.pc;
        let op = bytecode[pc];
        let mut next_pc = pc + inst::instruction_length(bytecode, pc);
        tracing::trace!(thread = %self.thread, pc, op = inst::name(op), "dispatch");

        match op {
            inst::NOP => {}

            // const
            inst::ACONST_NULL => self.frame.push_ref(NULL),
            inst::ICONST_M1..=inst::ICONST_5 => {
                self.frame.push_int(op as i32 - inst::ICONST_0 as i32)
            }
            inst::LCONST_0 | inst::LCONST_1 => self.frame.push_long((op - inst::LCONST_0) as i64),
            inst::FCONST_0..=inst::FCONST_2 => self.frame.push_float((op - inst::FCONST_0) as f32),
            inst::DCONST_0 | inst::DCONST_1 => {
                self.frame.push_double((op - inst::DCONST_0) as f64)
            }
            inst::BIPUSH => self.frame.push_int(bytecode[pc + 1] as i8 as i32),
            inst::SIPUSH => self.frame.push_int(read_i16(bytecode, pc + 1) as i32),
            inst::LDC | inst::LDC_W => {
                let QuickOp::Ldc(value) = self.quicken()? else {
                    unreachable!("ldc resolved to another form")
                };
                value.push_to(&mut self.frame.stack);
            }
            inst::LDC2_W => {
                let value = self.machine.resolve_loadable(
                    self.thread,
                    &self.frame.class,
                    read_u16(bytecode, pc + 1),
                )?;
                value.push_to(&mut self.frame.stack);
            }

            // load
            inst::ILOAD | inst::FLOAD | inst::ALOAD => self.load(bytecode[pc + 1] as usize),
            inst::LLOAD | inst::DLOAD => self.load_long(bytecode[pc + 1] as usize),
            inst::ILOAD_0..=inst::ILOAD_3 => self.load((op - inst::ILOAD_0) as usize),
            inst::LLOAD_0..=inst::LLOAD_3 => self.load_long((op - inst::LLOAD_0) as usize),
            inst::FLOAD_0..=inst::FLOAD_3 => self.load((op - inst::FLOAD_0) as usize),
            inst::DLOAD_0..=inst::DLOAD_3 => self.load_long((op - inst::DLOAD_0) as usize),
            inst::ALOAD_0..=inst::ALOAD_3 => self.load((op - inst::ALOAD_0) as usize),
            inst::IALOAD => {
                let value = self.array_load::<i32>()?;
                self.frame.push_int(value);
            }
            inst::LALOAD => {
                let value = self.array_load::<i64>()?;
                self.frame.push_long(value);
            }
            inst::FALOAD => {
                let value = self.array_load::<f32>()?;
                self.frame.push_float(value);
            }
            inst::DALOAD => {
                let value = self.array_load::<f64>()?;
                self.frame.push_double(value);
            }
            inst::AALOAD => {
                let value = self.array_load::<u32>()?;
                self.frame.push_ref(value);
            }
            inst::BALOAD => {
                let value = self.array_load::<i8>()?;
                self.frame.push_int(value as i32);
            }
            inst::CALOAD => {
                let value = self.array_load::<u16>()?;
                self.frame.push_int(value as i32);
            }
            inst::SALOAD => {
                let value = self.array_load::<i16>()?;
                self.frame.push_int(value as i32);
            }

            // store
            inst::ISTORE | inst::FSTORE | inst::ASTORE => self.store(bytecode[pc + 1] as usize),
            inst::LSTORE | inst::DSTORE => self.store_long(bytecode[pc + 1] as usize),
            inst::ISTORE_0..=inst::ISTORE_3 => self.store((op - inst::ISTORE_0) as usize),
            inst::LSTORE_0..=inst::LSTORE_3 => self.store_long((op - inst::LSTORE_0) as usize),
            inst::FSTORE_0..=inst::FSTORE_3 => self.store((op - inst::FSTORE_0) as usize),
            inst::DSTORE_0..=inst::DSTORE_3 => self.store_long((op - inst::DSTORE_0) as usize),
            inst::ASTORE_0..=inst::ASTORE_3 => self.store((op - inst::ASTORE_0) as usize),
            inst::IASTORE => {
                let value = self.frame.pop_int();
                self.array_store(value)?;
            }
            inst::LASTORE => {
                let value = self.frame.pop_long();
                self.array_store(value)?;
            }
            inst::FASTORE => {
                let value = self.frame.pop_float();
                self.array_store(value)?;
            }
            inst::DASTORE => {
                let value = self.frame.pop_double();
                self.array_store(value)?;
            }
            inst::AASTORE => self.aastore()?,
            inst::BASTORE => {
                let value = self.frame.pop_int();
                let array = self.frame.stack[self.frame.stack.len() - 2].reference();
                let is_boolean = array != NULL
                    && self.machine.heap.array(array).is_some()
                    && self.machine.heap.class_of(array).class_name.as_ref() == "[Z";
                self.array_store(if is_boolean { value & 1 } else { value } as i8)?;
            }
            inst::CASTORE => {
                let value = self.frame.pop_int() as u16;
                self.array_store(value)?;
            }
            inst::SASTORE => {
                let value = self.frame.pop_int() as i16;
                self.array_store(value)?;
            }

            // stack
            inst::POP => {
                self.frame.pop();
            }
            inst::POP2 => {
                self.frame.pop();
                self.frame.pop();
            }
            inst::DUP => {
                let v1 = self.frame.pop();
                self.push_all(&[v1, v1]);
            }
            inst::DUP_X1 => {
                let v1 = self.frame.pop();
                let v2 = self.frame.pop();
                self.push_all(&[v1, v2, v1]);
            }
            inst::DUP_X2 => {
                let v1 = self.frame.pop();
                let v2 = self.frame.pop();
                let v3 = self.frame.pop();
                self.push_all(&[v1, v3, v2, v1]);
            }
            inst::DUP2 => {
                let v1 = self.frame.pop();
                let v2 = self.frame.pop();
                self.push_all(&[v2, v1, v2, v1]);
            }
            inst::DUP2_X1 => {
                let v1 = self.frame.pop();
                let v2 = self.frame.pop();
                let v3 = self.frame.pop();
                self.push_all(&[v2, v1, v3, v2, v1]);
            }
            inst::DUP2_X2 => {
                let v1 = self.frame.pop();
                let v2 = self.frame.pop();
                let v3 = self.frame.pop();
                let v4 = self.frame.pop();
                self.push_all(&[v2, v1, v4, v3, v2, v1]);
            }
            inst::SWAP => {
                let v1 = self.frame.pop();
                let v2 = self.frame.pop();
                self.push_all(&[v1, v2]);
            }

            // math
            inst::IADD => self.int_op(i32::wrapping_add),
            inst::ISUB => self.int_op(i32::wrapping_sub),
            inst::IMUL => self.int_op(i32::wrapping_mul),
            inst::IDIV | inst::IREM => {
                let b = self.frame.pop_int();
                let a = self.frame.pop_int();
                if b == 0 {
                    return Err(divide_by_zero().into());
                }
                self.frame.push_int(if op == inst::IDIV {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                });
            }
            inst::INEG => {
                let a = self.frame.pop_int();
                self.frame.push_int(a.wrapping_neg());
            }
            inst::ISHL => self.int_op(|a, b| a.wrapping_shl(b as u32)),
            inst::ISHR => self.int_op(|a, b| a.wrapping_shr(b as u32)),
            inst::IUSHR => self.int_op(|a, b| (a as u32).wrapping_shr(b as u32) as i32),
            inst::IAND => self.int_op(|a, b| a & b),
            inst::IOR => self.int_op(|a, b| a | b),
            inst::IXOR => self.int_op(|a, b| a ^ b),
            inst::LADD => self.long_op(i64::wrapping_add),
            inst::LSUB => self.long_op(i64::wrapping_sub),
            inst::LMUL => self.long_op(i64::wrapping_mul),
            inst::LDIV | inst::LREM => {
                let b = self.frame.pop_long();
                let a = self.frame.pop_long();
                if b == 0 {
                    return Err(divide_by_zero().into());
                }
                self.frame.push_long(if op == inst::LDIV {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                });
            }
            inst::LNEG => {
                let a = self.frame.pop_long();
                self.frame.push_long(a.wrapping_neg());
            }
            inst::LSHL | inst::LSHR | inst::LUSHR => {
                let shift = self.frame.pop_int() as u32;
                let a = self.frame.pop_long();
                self.frame.push_long(match op {
                    inst::LSHL => a.wrapping_shl(shift),
                    inst::LSHR => a.wrapping_shr(shift),
                    _ => (a as u64).wrapping_shr(shift) as i64,
                });
            }
            inst::LAND => self.long_op(|a, b| a & b),
            inst::LOR => self.long_op(|a, b| a | b),
            inst::LXOR => self.long_op(|a, b| a ^ b),
            inst::FADD => self.float_op(|a, b| a + b),
            inst::FSUB => self.float_op(|a, b| a - b),
            inst::FMUL => self.float_op(|a, b| a * b),
            inst::FDIV => self.float_op(|a, b| a / b),
            inst::FREM => self.float_op(|a, b| a % b),
            inst::FNEG => {
                let a = self.frame.pop_float();
                self.frame.push_float(-a);
            }
            inst::DADD => self.double_op(|a, b| a + b),
            inst::DSUB => self.double_op(|a, b| a - b),
            inst::DMUL => self.double_op(|a, b| a * b),
            inst::DDIV => self.double_op(|a, b| a / b),
            inst::DREM => self.double_op(|a, b| a % b),
            inst::DNEG => {
                let a = self.frame.pop_double();
                self.frame.push_double(-a);
            }
            inst::IINC => self.iinc(bytecode[pc + 1] as usize, bytecode[pc + 2] as i8 as i32),

            // conversions
            inst::I2L => {
                let a = self.frame.pop_int();
                self.frame.push_long(a as i64);
            }
            inst::I2F => {
                let a = self.frame.pop_int();
                self.frame.push_float(a as f32);
            }
            inst::I2D => {
                let a = self.frame.pop_int();
                self.frame.push_double(a as f64);
            }
            inst::L2I => {
                let a = self.frame.pop_long();
                self.frame.push_int(a as i32);
            }
            inst::L2F => {
                let a = self.frame.pop_long();
                self.frame.push_float(a as f32);
            }
            inst::L2D => {
                let a = self.frame.pop_long();
                self.frame.push_double(a as f64);
            }
            inst::F2I => {
                let a = self.frame.pop_float();
                self.frame.push_int(a as i32);
            }
            inst::F2L => {
                let a = self.frame.pop_float();
                self.frame.push_long(a as i64);
            }
            inst::F2D => {
                let a = self.frame.pop_float();
                self.frame.push_double(a as f64);
            }
            inst::D2I => {
                let a = self.frame.pop_double();
                self.frame.push_int(a as i32);
            }
            inst::D2L => {
                let a = self.frame.pop_double();
                self.frame.push_long(a as i64);
            }
            inst::D2F => {
                let a = self.frame.pop_double();
                self.frame.push_float(a as f32);
            }
            inst::I2B => {
                let a = self.frame.pop_int();
                self.frame.push_int(a as i8 as i32);
            }
            inst::I2C => {
                let a = self.frame.pop_int();
                self.frame.push_int(a as u16 as i32);
            }
            inst::I2S => {
                let a = self.frame.pop_int();
                self.frame.push_int(a as i16 as i32);
            }

            // comparisons
            inst::LCMP => {
                let b = self.frame.pop_long();
                let a = self.frame.pop_long();
                self.frame.push_int(compare(a, b, 0));
            }
            inst::FCMPL | inst::FCMPG => {
                let b = self.frame.pop_float();
                let a = self.frame.pop_float();
                self.frame
                    .push_int(compare(a, b, if op == inst::FCMPG { 1 } else { -1 }));
            }
            inst::DCMPL | inst::DCMPG => {
                let b = self.frame.pop_double();
                let a = self.frame.pop_double();
                self.frame
                    .push_int(compare(a, b, if op == inst::DCMPG { 1 } else { -1 }));
            }
            inst::IFEQ..=inst::IFLE => {
                let a = self.frame.pop_int();
                if branch_taken(op - inst::IFEQ, a.cmp(&0)) {
                    next_pc = self.branch(code, read_i16(bytecode, pc + 1) as i32);
                }
            }
            inst::IF_ICMPEQ..=inst::IF_ICMPLE => {
                let b = self.frame.pop_int();
                let a = self.frame.pop_int();
                if branch_taken(op - inst::IF_ICMPEQ, a.cmp(&b)) {
                    next_pc = self.branch(code, read_i16(bytecode, pc + 1) as i32);
                }
            }
            inst::IF_ACMPEQ | inst::IF_ACMPNE => {
                let b = self.frame.pop_ref();
                let a = self.frame.pop_ref();
                if (a == b) == (op == inst::IF_ACMPEQ) {
                    next_pc = self.branch(code, read_i16(bytecode, pc + 1) as i32);
                }
            }
            inst::IFNULL | inst::IFNONNULL => {
                let a = self.frame.pop_ref();
                if (a == NULL) == (op == inst::IFNULL) {
                    next_pc = self.branch(code, read_i16(bytecode, pc + 1) as i32);
                }
            }

            // control
            inst::GOTO => next_pc = self.branch(code, read_i16(bytecode, pc + 1) as i32),
            inst::GOTO_W => next_pc = self.branch(code, inst::read_i32(bytecode, pc + 1)),
            inst::JSR | inst::JSR_W => {
                self.frame.push_int(next_pc as i32);
                let offset = if op == inst::JSR {
                    read_i16(bytecode, pc + 1) as i32
                } else {
                    inst::read_i32(bytecode, pc + 1)
                };
                next_pc = self.branch(code, offset);
            }
            inst::RET => next_pc = self.frame.locals[bytecode[pc + 1] as usize].int() as usize,
            inst::TABLESWITCH => {
                let base = (pc + 4) & !3;
                let index = self.frame.pop_int();
                let low = inst::read_i32(bytecode, base + 4);
                let high = inst::read_i32(bytecode, base + 8);
                let offset = if index < low || index > high {
                    inst::read_i32(bytecode, base)
                } else {
                    inst::read_i32(bytecode, base + 12 + 4 * (index - low) as usize)
                };
                next_pc = self.branch(code, offset);
            }
            inst::LOOKUPSWITCH => {
                let base = (pc + 4) & !3;
                let key = self.frame.pop_int();
                let pairs = inst::read_i32(bytecode, base + 4) as usize;
                let offset = (0..pairs)
                    .map(|i| base + 8 + 8 * i)
                    .find(|&at| inst::read_i32(bytecode, at) == key)
                    .map(|at| inst::read_i32(bytecode, at + 4))
                    .unwrap_or_else(|| inst::read_i32(bytecode, base));
                next_pc = self.branch(code, offset);
            }
            inst::IRETURN | inst::FRETURN | inst::ARETURN => {
                return Err(Next::Return(ReturnValue::Single(self.frame.pop())));
            }
            inst::LRETURN | inst::DRETURN => {
                let lower = self.frame.pop();
                let upper = self.frame.pop();
                return Err(Next::Return(ReturnValue::Double(upper, lower)));
            }
            inst::RETURN => return Err(Next::Return(ReturnValue::Void)),

            // fields
            inst::GETSTATIC => {
                let QuickOp::GetStatic {
                    class,
                    slot,
                    is_long,
                } = self.quicken()?
                else {
                    unreachable!("getstatic resolved to another form")
                };
                self.machine.ensure_initialized(self.thread, &class)?;
                self.frame.push(class.get_static_field(slot));
                if is_long {
                    self.frame.push(class.get_static_field(slot + 1));
                }
            }
            inst::PUTSTATIC => {
                let QuickOp::PutStatic {
                    class,
                    slot,
                    is_long,
                } = self.quicken()?
                else {
                    unreachable!("putstatic resolved to another form")
                };
                self.machine.ensure_initialized(self.thread, &class)?;
                if is_long {
                    let lower = self.frame.pop();
                    let upper = self.frame.pop();
                    class.set_static_field(slot, upper);
                    class.set_static_field(slot + 1, lower);
                } else {
                    let value = self.frame.pop();
                    class.set_static_field(slot, value);
                }
            }
            inst::GETFIELD => {
                let QuickOp::GetField { slot, is_long } = self.quicken()? else {
                    unreachable!("getfield resolved to another form")
                };
                let object = self.frame.pop_ref();
                if object == NULL {
                    return Err(null_pointer().into());
                }
                let heap = &self.machine.heap;
                self.frame.push(heap.get_field(object, slot));
                if is_long {
                    self.frame.push(heap.get_field(object, slot + 1));
                }
            }
            inst::PUTFIELD => {
                let QuickOp::PutField { slot, is_long } = self.quicken()? else {
                    unreachable!("putfield resolved to another form")
                };
                let lower = self.frame.pop();
                let upper = if is_long { Some(self.frame.pop()) } else { None };
                let object = self.frame.pop_ref();
                if object == NULL {
                    return Err(null_pointer().into());
                }
                match upper {
                    Some(upper) => {
                        self.machine.heap.put_field(object, slot, upper);
                        self.machine.heap.put_field(object, slot + 1, lower);
                    }
                    None => self.machine.heap.put_field(object, slot, lower),
                }
            }

            // invocation
            inst::INVOKEVIRTUAL
            | inst::INVOKESPECIAL
            | inst::INVOKESTATIC
            | inst::INVOKEINTERFACE
            | inst::INVOKEDYNAMIC => {
                let frame = self.invoke()?;
                return Err(Next::Invoke(frame));
            }

            // objects
            inst::NEW => {
                let QuickOp::New { class } = self.quicken()? else {
                    unreachable!("new resolved to another form")
                };
                self.machine.ensure_initialized(self.thread, &class)?;
                let object = self.machine.heap.allocate_object(class);
                self.frame.push_ref(object);
            }
            inst::NEWARRAY => {
                let Some((element, name)) = primitive_array_type(bytecode[pc + 1]) else {
                    return Err(Exception::new_vm_msg(
                        INTERNAL_ERROR,
                        format!("bad newarray type {}", bytecode[pc + 1]),
                    )
                    .into());
                };
                let class =
                    self.machine
                        .load_and_link(Some(self.thread), self.frame.class.loader, name)?;
                let count = self.frame.pop_int();
                if count < 0 {
                    return Err(negative_size(count).into());
                }
                let array = self
                    .machine
                    .heap
                    .allocate_array(class, ArrayData::new(&element, count as usize));
                self.frame.push_ref(array);
            }
            inst::ANEWARRAY => {
                let QuickOp::ANewArray { array_class } = self.quicken()? else {
                    unreachable!("anewarray resolved to another form")
                };
                let count = self.frame.pop_int();
                if count < 0 {
                    return Err(negative_size(count).into());
                }
                let array = self
                    .machine
                    .heap
                    .allocate_array(array_class, ArrayData::Reference(vec![NULL; count as usize]));
                self.frame.push_ref(array);
            }
            inst::MULTIANEWARRAY => {
                let QuickOp::MultiANewArray { class, dimensions } = self.quicken()? else {
                    unreachable!("multianewarray resolved to another form")
                };
                let counts: Vec<i32> = self
                    .frame
                    .pop_n(dimensions as usize)
                    .into_iter()
                    .map(Variable::int)
                    .collect();
                if let Some(&count) = counts.iter().find(|&&c| c < 0) {
                    return Err(negative_size(count).into());
                }
                let array = self.new_multi_array(&class, &counts);
                self.frame.push_ref(array);
            }
            inst::ARRAYLENGTH => {
                let array = self.frame.pop_ref();
                if array == NULL {
                    return Err(null_pointer().into());
                }
                let len = self
                    .machine
                    .heap
                    .array(array)
                    .map(ArrayData::len)
                    .ok_or_else(not_an_array)?;
                self.frame.push_int(len as i32);
            }
            inst::ATHROW => {
                let throwable = self.frame.pop_ref();
                if throwable == NULL {
                    return Err(null_pointer().into());
                }
                return Err(Exception::new(throwable).into());
            }
            inst::CHECKCAST => {
                let QuickOp::CheckCast { class } = self.quicken()? else {
                    unreachable!("checkcast resolved to another form")
                };
                let object = self.frame.pop_ref();
                if object != NULL {
                    let actual = self.machine.heap.class_of(object);
                    if !is_assignable_to(actual, &class) {
                        return Err(Exception::new_vm_msg(
                            CLASS_CAST_EXCEPTION,
                            format!(
                                "class {} cannot be cast to class {}",
                                actual.class_name.replace('/', "."),
                                class.class_name.replace('/', ".")
                            ),
                        )
                        .into());
                    }
                }
                self.frame.push_ref(object);
            }
            inst::INSTANCEOF => {
                let QuickOp::InstanceOf { class } = self.quicken()? else {
                    unreachable!("instanceof resolved to another form")
                };
                let object = self.frame.pop_ref();
                let result = object != NULL
                    && is_assignable_to(self.machine.heap.class_of(object), &class);
                self.frame.push_int(result as i32);
            }
            inst::MONITORENTER => {
                let object = self.frame.pop_ref();
                if object == NULL {
                    return Err(null_pointer().into());
                }
                if self.machine.monitor_enter(self.thread, object, 1) == Enter::Blocked {
                    // runs again once the monitor is handed over
                    self.frame.push_ref(object);
                    return Err(Next::Suspend);
                }
            }
            inst::MONITOREXIT => {
                let object = self.frame.pop_ref();
                if object == NULL {
                    return Err(null_pointer().into());
                }
                self.machine.monitor_exit(self.thread, object)?;
            }
            inst::WIDE => {
                let index = read_u16(bytecode, pc + 2) as usize;
                match bytecode[pc + 1] {
                    inst::ILOAD | inst::FLOAD | inst::ALOAD => self.load(index),
                    inst::LLOAD | inst::DLOAD => self.load_long(index),
                    inst::ISTORE | inst::FSTORE | inst::ASTORE => self.store(index),
                    inst::LSTORE | inst::DSTORE => self.store_long(index),
                    inst::IINC => self.iinc(index, read_i16(bytecode, pc + 4) as i32),
                    inst::RET => next_pc = self.frame.locals[index].int() as usize,
                    other => {
                        return Err(Exception::new_vm_msg(
                            INTERNAL_ERROR,
                            format!("{} cannot be widened", inst::name(other)),
                        )
                        .into());
                    }
                }
            }
            other => {
                return Err(Exception::new_vm_msg(
                    INTERNAL_ERROR,
                    format!("illegal opcode {other:#04x} at {pc}"),
                )
                .into());
            }
        }
        self.frame.pc = next_pc;
        Ok(())
    }

    fn quicken(&mut self) -> Flow<QuickOp> {
        self.machine.quicken(
            self.thread,
            &self.frame.class,
            &self.frame.method,
            self.frame.pc,
        )
    }

    fn load(&mut self, n: usize) {
        let value = self.frame.locals[n];
        self.frame.push(value);
    }

    fn load_long(&mut self, n: usize) {
        let (upper, lower) = (self.frame.locals[n], self.frame.locals[n + 1]);
        self.frame.push(upper);
        self.frame.push(lower);
    }

    fn store(&mut self, n: usize) {
        self.frame.locals[n] = self.frame.pop();
    }

    fn store_long(&mut self, n: usize) {
        let lower = self.frame.pop();
        let upper = self.frame.pop();
        self.frame.locals[n] = upper;
        self.frame.locals[n + 1] = lower;
    }

    fn iinc(&mut self, n: usize, delta: i32) {
        let value = self.frame.locals[n].int().wrapping_add(delta);
        self.frame.locals[n] = Variable::from_int(value);
    }

    fn push_all(&mut self, values: &[Variable]) {
        self.frame.stack.extend_from_slice(values);
    }

    fn int_op(&mut self, f: impl FnOnce(i32, i32) -> i32) {
        let b = self.frame.pop_int();
        let a = self.frame.pop_int();
        self.frame.push_int(f(a, b));
    }

    fn long_op(&mut self, f: impl FnOnce(i64, i64) -> i64) {
        let b = self.frame.pop_long();
        let a = self.frame.pop_long();
        self.frame.push_long(f(a, b));
    }

    fn float_op(&mut self, f: impl FnOnce(f32, f32) -> f32) {
        let b = self.frame.pop_float();
        let a = self.frame.pop_float();
        self.frame.push_float(f(a, b));
    }

    fn double_op(&mut self, f: impl FnOnce(f64, f64) -> f64) {
        let b = self.frame.pop_double();
        let a = self.frame.pop_double();
        self.frame.push_double(f(a, b));
    }

    fn array_load<T: ArrayType>(&mut self) -> Result<T, Exception> {
        let index = self.frame.pop_int();
        let array = self.frame.pop_ref();
        load_element(&self.machine.heap, array, index)
    }

    fn array_store<T: ArrayType>(&mut self, value: T) -> Result<(), Exception> {
        let index = self.frame.pop_int();
        let array = self.frame.pop_ref();
        store_element(&mut self.machine.heap, array, index, value)
    }

    fn aastore(&mut self) -> Result<(), Exception> {
        let value = self.frame.pop_ref();
        let index = self.frame.pop_int();
        let array = self.frame.pop_ref();
        // null and bounds checks come before the store check
        load_element::<u32>(&self.machine.heap, array, index)?;
        if value != NULL {
            let heap = &self.machine.heap;
            if let Some(ArrayElement::Reference(element)) = &heap.class_of(array).array_element {
                let actual = heap.class_of(value);
                if !is_assignable_to(actual, element) {
                    return Err(Exception::new_vm_msg(
                        ARRAY_STORE_EXCEPTION,
                        actual.class_name.replace('/', "."),
                    ));
                }
            }
        }
        store_element(&mut self.machine.heap, array, index, value)
    }

    fn new_multi_array(&mut self, class: &Arc<Class>, counts: &[i32]) -> ObjRef {
        let count = counts[0] as usize;
        let data = match &class.array_element {
            Some(ArrayElement::Reference(inner)) if counts.len() > 1 => {
                let inner = Arc::clone(inner);
                ArrayData::Reference(
                    (0..count)
                        .map(|_| self.new_multi_array(&inner, &counts[1..]))
                        .collect(),
                )
            }
            Some(ArrayElement::Primitive(element)) => ArrayData::new(element, count),
            _ => ArrayData::Reference(vec![NULL; count]),
        };
        self.machine.heap.allocate_array(Arc::clone(class), data)
    }

    /// Target pc of a taken branch. Backward branches count toward the method's warmup.
    fn branch(&mut self, code: &Code, offset: i32) -> usize {
        let pc = self.frame.pc;
        let target = (pc as isize + offset as isize) as usize;
        if target <= pc {
            self.back_edge(code, target);
        }
        target
    }

    fn back_edge(&mut self, code: &Code, target: usize) {
        let config = &self.machine.config;
        if !config.trace_fusion || !self.frame.method.tick_warmup() {
            return;
        }
        let slot = &code.traces[target];
        if slot.get().is_none() {
            let compiled = trace::compile(code, target, config.min_trace_len);
            match &compiled {
                TraceSlot::Compiled(trace) => tracing::trace!(
                    method = %self.frame.method.name,
                    start = target,
                    len = trace.len(),
                    "trace compiled"
                ),
                TraceSlot::Failed => tracing::trace!(
                    method = %self.frame.method.name,
                    start = target,
                    "trace discarded"
                ),
            }
            let _ = slot.set(compiled);
        }
        self.frame.method.reset_warmup(config.warmup_budget);
    }
}

impl Machine {
    /// Runs thread `id` for at most `budget` steps and returns how many were used.
    pub(crate) fn run_quantum(&mut self, id: ThreadId, budget: usize) -> usize {
        let mut stack = std::mem::take(&mut self.thread_mut(id).stack);
        let mut remaining = budget;
        if let Some(exception) = self.thread_mut(id).pending_exception.take() {
            // a synchronized method still waiting for its monitor was never entered
            if matches!(
                stack.last_mut().and_then(Frame::lock_mut),
                Some(FrameLock::Pending(_))
            ) {
                stack.pop();
            }
            self.unwind(id, &mut stack, exception);
        }
        while remaining > 0
            && self.halted.is_none()
            && self.thread(id).status == ThreadStatus::Runnable
        {
            let Some(top) = stack.last_mut() else {
                break;
            };
            if let Some(lock) = top.lock_mut() {
                if let FrameLock::Pending(object) = *lock {
                    match self.monitor_enter(id, object, 1) {
                        Enter::Acquired => *lock = FrameLock::Held(object),
                        Enter::Blocked => break,
                    }
                }
            }
            let next = self.run_top(id, &mut stack, &mut remaining);
            if !self.complete(id, &mut stack, next) {
                break;
            }
        }
        if self.halted.is_some() {
            return budget - remaining;
        }
        if stack.is_empty() {
            self.terminate(id);
        } else {
            self.thread_mut(id).stack = stack;
        }
        budget - remaining
    }

    fn run_top(&mut self, id: ThreadId, stack: &mut Vec<Frame>, remaining: &mut usize) -> Next {
        match stack.last_mut() {
            Some(Frame::Interpreted(frame)) => {
                InterpreterEnv::new(self, id, frame).execute(remaining)
            }
            Some(Frame::Native(frame)) => {
                *remaining -= 1;
                self.call_native(id, frame)
            }
            Some(Frame::Continuation(ContinuationFrame::Entry { .. })) => {
                *remaining -= 1;
                self.enter(id, stack)
            }
            Some(Frame::Continuation(continuation)) => {
                tracing::error!(thread = %id, ?continuation, "continuation reached without a value");
                panic!("thread {id}: continuation {continuation:?} on top of the stack");
            }
            None => unreachable!("run_top on an empty stack"),
        }
    }

    fn call_native(&mut self, id: ThreadId, frame: &mut NativeFrame) -> Next {
        let env = NativeEnv {
            machine: self,
            thread: id,
            args: frame.args.clone(),
            resumed: frame.resumed,
        };
        match (frame.function)(env) {
            Ok(NativeReturn::Value(value)) => Next::Return(ReturnValue::from_native(value)),
            Ok(NativeReturn::Suspend) => {
                frame.resumed = true;
                if self.thread(id).status == ThreadStatus::Runnable {
                    Next::Yield
                } else {
                    Next::Suspend
                }
            }
            Err(exception) => Next::Throw(exception),
        }
    }

    /// Resolves the entry method of a host call. The entry record stays in place until the
    /// method frame can replace it.
    fn enter(&mut self, id: ThreadId, stack: &mut Vec<Frame>) -> Next {
        let Some(Frame::Continuation(ContinuationFrame::Entry {
            loader,
            class_name,
            name,
            descriptor,
            args,
        })) = stack.last()
        else {
            unreachable!("enter without an entry record on top")
        };
        let loader = *loader;
        let (class_name, name, descriptor) = (
            Arc::clone(class_name),
            Arc::clone(name),
            Arc::clone(descriptor),
        );
        let args = args.clone();
        match self.resolve_entry(id, loader, &class_name, &name, &descriptor, args) {
            Ok(frame) => {
                stack.pop();
                Next::Invoke(frame)
            }
            Err(next) => next,
        }
    }

    fn resolve_entry(
        &mut self,
        id: ThreadId,
        loader: LoaderId,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: Vec<NativeVariable>,
    ) -> Flow<Frame> {
        let class = self.load_and_link(Some(id), loader, class_name)?;
        let method = class.find_method(name, descriptor).ok_or_else(|| {
            Exception::new_vm_msg(
                NO_SUCH_METHOD_ERROR,
                format!("{class_name}.{name}{descriptor}"),
            )
        })?;
        if method.is_static() {
            self.ensure_initialized(id, &class)?;
        }
        let mut slots = Vec::with_capacity(method.arg_slots);
        for arg in args {
            arg.push_to(&mut slots);
        }
        if slots.len() != method.arg_slots {
            return Err(
                Exception::new_vm_msg(ILLEGAL_ARGUMENT_EXCEPTION, "wrong number of arguments")
                    .into(),
            );
        }
        Ok(self.build_frame(method, slots)?)
    }
    /// Applies what the top frame asked for. `false` ends the quantum.
    fn complete(&mut self, id: ThreadId, stack: &mut Vec<Frame>, next: Next) -> bool {
        match next {
            Next::Return(value) => {
                self.return_from(id, stack, value);
                true
            }
            Next::Invoke(frame) => {
                self.push_frames(id, stack, vec![frame]);
                true
            }
            Next::Push(frames) => {
                self.push_frames(id, stack, frames);
                true
            }
            Next::Throw(exception) => {
                self.unwind(id, stack, exception);
                true
            }
            Next::Suspend | Next::Yield => false,
        }
    }

    fn push_frames(&mut self, id: ThreadId, stack: &mut Vec<Frame>, frames: Vec<Frame>) {
        if stack.len() + frames.len() > self.config.max_stack_depth {
            for frame in &frames {
                if let Frame::Continuation(ContinuationFrame::ClassInit { class }) = frame {
                    self.abandon_initialization(class);
                }
            }
            self.unwind(id, stack, Exception::new_vm(STACK_OVERFLOW_ERROR));
        } else {
            stack.extend(frames);
        }
    }

    fn return_from(&mut self, id: ThreadId, stack: &mut Vec<Frame>, value: ReturnValue) {
        let Some(mut frame) = stack.pop() else {
            return;
        };
        if let Some(FrameLock::Held(object)) = frame.lock_mut().copied() {
            if let Err(exception) = self.monitor_exit(id, object) {
                self.unwind(id, stack, exception);
                return;
            }
        }
        match stack.last_mut() {
            None => {}
            Some(Frame::Interpreted(caller)) => {
                value.push_to(&mut caller.stack);
                let op = caller.method.code().bytecode[caller.pc];
                caller.pc += inst::invoke_length(op);
            }
            Some(Frame::Native(caller)) => {
                panic!(
                    "native {}.{} cannot receive a return value",
                    caller.method.class_name, caller.method.name
                );
            }
            Some(Frame::Continuation(_)) => {
                let Some(Frame::Continuation(continuation)) = stack.pop() else {
                    unreachable!()
                };
                self.resume(id, stack, continuation, value);
            }
        }
    }

    fn resume(
        &mut self,
        id: ThreadId,
        stack: &mut Vec<Frame>,
        continuation: ContinuationFrame,
        value: ReturnValue,
    ) {
        match continuation {
            ContinuationFrame::ClassInit { class } => self.finish_initialization(&class, None),
            ContinuationFrame::IndyLink {
                class,
                cp_index,
                method_index,
                pc,
            } => {
                if let Err(exception) =
                    self.finish_call_site(&class, cp_index, method_index, pc, value.reference())
                {
                    self.unwind(id, stack, exception);
                }
            }
            ContinuationFrame::Completion {
                return_type,
                callback,
            } => {
                tracing::debug!(thread = %id, "entry point returned");
                if let Some(callback) = callback {
                    callback(Completion::Returned(value.to_native(&return_type)));
                }
            }
            ContinuationFrame::Entry { .. } => {
                unreachable!("an entry record never sits under a running frame")
            }
        }
    }

    pub(crate) fn terminate(&mut self, id: ThreadId) {
        let object = self.thread(id).object;
        self.thread_mut(id).stack.clear();
        self.set_status(id, ThreadStatus::Terminated);
        tracing::debug!(thread = %id, name = %self.thread(id).name, "thread terminated");
        // joiners wait on the thread object
        self.notify_waiters(object, true);
    }
}

#[cfg(test)]
mod tests;

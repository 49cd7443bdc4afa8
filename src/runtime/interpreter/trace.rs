//! Trace fusion. A straight run of simple instructions starting at a loop header is compiled
//! once into micro-ops that read locals, constants and temporaries directly, so the values
//! flowing between those instructions never touch the operand stack. A trace always leaves
//! the frame exactly as the instructions it replaces would have.

use std::sync::Arc;

use crate::runtime::{
    Class, Code, Exception, Variable,
    heap::{ArrayData, Heap},
    interpreter::{
        InterpretedFrame, QuickOp, divide_by_zero, instructions as inst, load_element,
        not_an_array, store_element,
    },
    native::null_pointer,
    resolution::Loadable,
};

#[derive(Debug)]
pub(crate) enum TraceSlot {
    Compiled(Arc<Trace>),
    // the run starting here was too short or began with an unsupported instruction
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Operand {
    Local(u16),
    Const(Variable),
    Temp(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum IntOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LongOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Conversion {
    ToByte,
    ToChar,
    ToShort,
    ToFloat,
}

#[derive(Debug)]
enum MicroOp {
    // moves the top of the real operand stack into a temporary
    Pop { dst: usize },
    Copy { dst: usize, src: Operand },
    Store { local: u16, src: Operand },
    Iinc { local: u16, delta: i32 },
    Int { op: IntOp, pc: usize, dst: usize, a: Operand, b: Operand },
    IntNeg { dst: usize, src: Operand },
    // writes dst and dst + 1
    Long { op: LongOp, dst: usize, a: [Operand; 2], b: [Operand; 2] },
    Float { op: FloatOp, dst: usize, a: Operand, b: Operand },
    Double { op: FloatOp, dst: usize, a: [Operand; 2], b: [Operand; 2] },
    Convert { op: Conversion, dst: usize, src: Operand },
    Widen { to_double: bool, dst: usize, src: Operand },
    LongToInt { dst: usize, src: [Operand; 2] },
    GetField { pc: usize, dst: usize, object: Operand, slot: usize },
    PutField { pc: usize, object: Operand, slot: usize, value: Operand },
    GetStatic { class: Arc<Class>, dst: usize, slot: usize },
    PutStatic { class: Arc<Class>, slot: usize, value: Operand },
    ArrayLength { pc: usize, dst: usize, array: Operand },
    IntArrayLoad { pc: usize, dst: usize, array: Operand, index: Operand },
    IntArrayStore { pc: usize, array: Operand, index: Operand, value: Operand },
}

#[derive(Debug)]
pub(crate) struct Trace {
    start_pc: usize,
    end_pc: usize,
    // instructions replaced
    len: usize,
    temps: usize,
    ops: Vec<MicroOp>,
    // pushed onto the operand stack at the end, bottom first
    result: Vec<Operand>,
}

impl IntOp {
    fn apply(self, a: i32, b: i32) -> Result<i32, Exception> {
        Ok(match self {
            IntOp::Add => a.wrapping_add(b),
            IntOp::Sub => a.wrapping_sub(b),
            IntOp::Mul => a.wrapping_mul(b),
            IntOp::Div | IntOp::Rem if b == 0 => return Err(divide_by_zero()),
            IntOp::Div => a.wrapping_div(b),
            IntOp::Rem => a.wrapping_rem(b),
            IntOp::And => a & b,
            IntOp::Or => a | b,
            IntOp::Xor => a ^ b,
            IntOp::Shl => a.wrapping_shl(b as u32),
            IntOp::Shr => a.wrapping_shr(b as u32),
            IntOp::Ushr => (a as u32).wrapping_shr(b as u32) as i32,
        })
    }
}

impl LongOp {
    fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            LongOp::Add => a.wrapping_add(b),
            LongOp::Sub => a.wrapping_sub(b),
            LongOp::Mul => a.wrapping_mul(b),
            LongOp::And => a & b,
            LongOp::Or => a | b,
            LongOp::Xor => a ^ b,
        }
    }
}

macro_rules! float_apply {
    ($name:ident, $t:ty) => {
        fn $name(self, a: $t, b: $t) -> $t {
            match self {
                FloatOp::Add => a + b,
                FloatOp::Sub => a - b,
                FloatOp::Mul => a * b,
                FloatOp::Div => a / b,
                FloatOp::Rem => a % b,
            }
        }
    };
}

impl FloatOp {
    float_apply!(apply_f32, f32);
    float_apply!(apply_f64, f64);
}

struct Compiler<'c> {
    code: &'c Code,
    ops: Vec<MicroOp>,
    // values above the real operand stack, top last
    stack: Vec<Operand>,
    temps: usize,
}

impl Compiler<'_> {
    fn temp(&mut self) -> usize {
        self.temps += 1;
        self.temps - 1
    }

    fn wide_temp(&mut self) -> usize {
        self.temps += 2;
        self.temps - 2
    }

    fn take(&mut self) -> Operand {
        match self.stack.pop() {
            Some(operand) => operand,
            None => {
                let dst = self.temp();
                self.ops.push(MicroOp::Pop { dst });
                Operand::Temp(dst)
            }
        }
    }

    fn take_wide(&mut self) -> [Operand; 2] {
        let lower = self.take();
        let upper = self.take();
        [upper, lower]
    }

    fn push_wide(&mut self, dst: usize) {
        self.stack.push(Operand::Temp(dst));
        self.stack.push(Operand::Temp(dst + 1));
    }

    /// Pending reads of `local` must see its value from before the upcoming write.
    fn detach(&mut self, local: u16) {
        if !self.stack.contains(&Operand::Local(local)) {
            return;
        }
        let dst = self.temp();
        self.ops.push(MicroOp::Copy {
            dst,
            src: Operand::Local(local),
        });
        for operand in &mut self.stack {
            if *operand == Operand::Local(local) {
                *operand = Operand::Temp(dst);
            }
        }
    }

    fn settle(&mut self, operand: Operand, written: &[u16]) -> Operand {
        match operand {
            Operand::Local(n) if written.contains(&n) => {
                let dst = self.temp();
                self.ops.push(MicroOp::Copy { dst, src: operand });
                Operand::Temp(dst)
            }
            other => other,
        }
    }

    fn store(&mut self, local: u16) {
        let src = self.take();
        self.detach(local);
        self.ops.push(MicroOp::Store { local, src });
    }

    fn store_wide(&mut self, local: u16) {
        let [upper, lower] = self.take_wide();
        let written = [local, local + 1];
        let upper = self.settle(upper, &written);
        let lower = self.settle(lower, &written);
        self.detach(local);
        self.detach(local + 1);
        self.ops.push(MicroOp::Store { local, src: upper });
        self.ops.push(MicroOp::Store {
            local: local + 1,
            src: lower,
        });
    }

    fn int(&mut self, op: IntOp, pc: usize) {
        let b = self.take();
        let a = self.take();
        let dst = self.temp();
        self.ops.push(MicroOp::Int { op, pc, dst, a, b });
        self.stack.push(Operand::Temp(dst));
    }

    fn long(&mut self, op: LongOp) {
        let b = self.take_wide();
        let a = self.take_wide();
        let dst = self.wide_temp();
        self.ops.push(MicroOp::Long { op, dst, a, b });
        self.push_wide(dst);
    }

    fn float(&mut self, op: FloatOp) {
        let b = self.take();
        let a = self.take();
        let dst = self.temp();
        self.ops.push(MicroOp::Float { op, dst, a, b });
        self.stack.push(Operand::Temp(dst));
    }

    fn double(&mut self, op: FloatOp) {
        let b = self.take_wide();
        let a = self.take_wide();
        let dst = self.wide_temp();
        self.ops.push(MicroOp::Double { op, dst, a, b });
        self.push_wide(dst);
    }

    fn convert(&mut self, op: Conversion) {
        let src = self.take();
        let dst = self.temp();
        self.ops.push(MicroOp::Convert { op, dst, src });
        self.stack.push(Operand::Temp(dst));
    }

    fn widen(&mut self, to_double: bool) {
        let src = self.take();
        let dst = self.wide_temp();
        self.ops.push(MicroOp::Widen { to_double, dst, src });
        self.push_wide(dst);
    }

    /// Compiles the instruction at `pc`. `false` ends the trace before it.
    fn instruction(&mut self, pc: usize) -> bool {
        let code = self.code;
        let bytecode = &code.bytecode;
        let op = bytecode[pc];
        let quick = || code.quick[pc].get();
        match op {
            inst::NOP => {}
            inst::ACONST_NULL => self.stack.push(Operand::Const(Variable::ZERO)),
            inst::ICONST_M1..=inst::ICONST_5 => self.stack.push(Operand::Const(
                Variable::from_int(op as i32 - inst::ICONST_0 as i32),
            )),
            inst::FCONST_0..=inst::FCONST_2 => self.stack.push(Operand::Const(
                Variable::from_float((op - inst::FCONST_0) as f32),
            )),
            inst::LCONST_0 | inst::LCONST_1 | inst::DCONST_0 | inst::DCONST_1 => {
                let (upper, lower) = match op {
                    inst::LCONST_0 | inst::LCONST_1 => {
                        Variable::put_long((op - inst::LCONST_0) as i64)
                    }
                    _ => Variable::put_double((op - inst::DCONST_0) as f64),
                };
                self.stack.push(Operand::Const(upper));
                self.stack.push(Operand::Const(lower));
            }
            inst::BIPUSH => self.stack.push(Operand::Const(Variable::from_int(
                bytecode[pc + 1] as i8 as i32,
            ))),
            inst::SIPUSH => self.stack.push(Operand::Const(Variable::from_int(
                i16::from_be_bytes([bytecode[pc + 1], bytecode[pc + 2]]) as i32,
            ))),
            inst::LDC | inst::LDC_W => match quick() {
                Some(QuickOp::Ldc(Loadable::One(value))) => {
                    self.stack.push(Operand::Const(*value))
                }
                _ => return false,
            },

            // load
            inst::ILOAD | inst::FLOAD | inst::ALOAD => {
                self.stack.push(Operand::Local(bytecode[pc + 1] as u16))
            }
            inst::LLOAD | inst::DLOAD => {
                let n = bytecode[pc + 1] as u16;
                self.stack.push(Operand::Local(n));
                self.stack.push(Operand::Local(n + 1));
            }
            inst::ILOAD_0..=inst::ILOAD_3 => {
                self.stack.push(Operand::Local((op - inst::ILOAD_0) as u16))
            }
            inst::FLOAD_0..=inst::FLOAD_3 => {
                self.stack.push(Operand::Local((op - inst::FLOAD_0) as u16))
            }
            inst::ALOAD_0..=inst::ALOAD_3 => {
                self.stack.push(Operand::Local((op - inst::ALOAD_0) as u16))
            }
            inst::LLOAD_0..=inst::LLOAD_3 | inst::DLOAD_0..=inst::DLOAD_3 => {
                let n = if op >= inst::DLOAD_0 {
                    op - inst::DLOAD_0
                } else {
                    op - inst::LLOAD_0
                } as u16;
                self.stack.push(Operand::Local(n));
                self.stack.push(Operand::Local(n + 1));
            }

            // store
            inst::ISTORE | inst::FSTORE | inst::ASTORE => self.store(bytecode[pc + 1] as u16),
            inst::LSTORE | inst::DSTORE => self.store_wide(bytecode[pc + 1] as u16),
            inst::ISTORE_0..=inst::ISTORE_3 => self.store((op - inst::ISTORE_0) as u16),
            inst::FSTORE_0..=inst::FSTORE_3 => self.store((op - inst::FSTORE_0) as u16),
            inst::ASTORE_0..=inst::ASTORE_3 => self.store((op - inst::ASTORE_0) as u16),
            inst::LSTORE_0..=inst::LSTORE_3 => self.store_wide((op - inst::LSTORE_0) as u16),
            inst::DSTORE_0..=inst::DSTORE_3 => self.store_wide((op - inst::DSTORE_0) as u16),
            inst::IINC => {
                let local = bytecode[pc + 1] as u16;
                self.detach(local);
                self.ops.push(MicroOp::Iinc {
                    local,
                    delta: bytecode[pc + 2] as i8 as i32,
                });
            }

            // stack
            inst::POP => {
                self.take();
            }
            inst::POP2 => {
                self.take_wide();
            }
            inst::DUP => {
                let v = self.take();
                self.stack.extend([v, v]);
            }
            inst::SWAP => {
                let v1 = self.take();
                let v2 = self.take();
                self.stack.extend([v1, v2]);
            }

            // math
            inst::IADD => self.int(IntOp::Add, pc),
            inst::ISUB => self.int(IntOp::Sub, pc),
            inst::IMUL => self.int(IntOp::Mul, pc),
            inst::IDIV => self.int(IntOp::Div, pc),
            inst::IREM => self.int(IntOp::Rem, pc),
            inst::IAND => self.int(IntOp::And, pc),
            inst::IOR => self.int(IntOp::Or, pc),
            inst::IXOR => self.int(IntOp::Xor, pc),
            inst::ISHL => self.int(IntOp::Shl, pc),
            inst::ISHR => self.int(IntOp::Shr, pc),
            inst::IUSHR => self.int(IntOp::Ushr, pc),
            inst::INEG => {
                let src = self.take();
                let dst = self.temp();
                self.ops.push(MicroOp::IntNeg { dst, src });
                self.stack.push(Operand::Temp(dst));
            }
            inst::LADD => self.long(LongOp::Add),
            inst::LSUB => self.long(LongOp::Sub),
            inst::LMUL => self.long(LongOp::Mul),
            inst::LAND => self.long(LongOp::And),
            inst::LOR => self.long(LongOp::Or),
            inst::LXOR => self.long(LongOp::Xor),
            inst::FADD => self.float(FloatOp::Add),
            inst::FSUB => self.float(FloatOp::Sub),
            inst::FMUL => self.float(FloatOp::Mul),
            inst::FDIV => self.float(FloatOp::Div),
            inst::FREM => self.float(FloatOp::Rem),
            inst::DADD => self.double(FloatOp::Add),
            inst::DSUB => self.double(FloatOp::Sub),
            inst::DMUL => self.double(FloatOp::Mul),
            inst::DDIV => self.double(FloatOp::Div),
            inst::DREM => self.double(FloatOp::Rem),

            // conversions
            inst::I2B => self.convert(Conversion::ToByte),
            inst::I2C => self.convert(Conversion::ToChar),
            inst::I2S => self.convert(Conversion::ToShort),
            inst::I2F => self.convert(Conversion::ToFloat),
            inst::I2L => self.widen(false),
            inst::I2D => self.widen(true),
            inst::L2I => {
                let src = self.take_wide();
                let dst = self.temp();
                self.ops.push(MicroOp::LongToInt { dst, src });
                self.stack.push(Operand::Temp(dst));
            }

            // fields, only once the instruction has been quickened
            inst::GETFIELD => {
                let Some(&QuickOp::GetField { slot, is_long }) = quick() else {
                    return false;
                };
                let object = self.take();
                for half in 0..=usize::from(is_long) {
                    let dst = self.temp();
                    self.ops.push(MicroOp::GetField {
                        pc,
                        dst,
                        object,
                        slot: slot + half,
                    });
                    self.stack.push(Operand::Temp(dst));
                }
            }
            inst::PUTFIELD => {
                let Some(&QuickOp::PutField { slot, is_long }) = quick() else {
                    return false;
                };
                let values = if is_long {
                    self.take_wide().to_vec()
                } else {
                    vec![self.take()]
                };
                let object = self.take();
                for (half, value) in values.into_iter().enumerate() {
                    self.ops.push(MicroOp::PutField {
                        pc,
                        object,
                        slot: slot + half,
                        value,
                    });
                }
            }
            inst::GETSTATIC => {
                let Some(QuickOp::GetStatic {
                    class,
                    slot,
                    is_long,
                }) = quick()
                else {
                    return false;
                };
                let (class, slot, is_long) = (Arc::clone(class), *slot, *is_long);
                for half in 0..=usize::from(is_long) {
                    let dst = self.temp();
                    self.ops.push(MicroOp::GetStatic {
                        class: Arc::clone(&class),
                        dst,
                        slot: slot + half,
                    });
                    self.stack.push(Operand::Temp(dst));
                }
            }
            inst::PUTSTATIC => {
                let Some(QuickOp::PutStatic {
                    class,
                    slot,
                    is_long,
                }) = quick()
                else {
                    return false;
                };
                let (class, slot, is_long) = (Arc::clone(class), *slot, *is_long);
                let values = if is_long {
                    self.take_wide().to_vec()
                } else {
                    vec![self.take()]
                };
                for (half, value) in values.into_iter().enumerate() {
                    self.ops.push(MicroOp::PutStatic {
                        class: Arc::clone(&class),
                        slot: slot + half,
                        value,
                    });
                }
            }

            // arrays
            inst::ARRAYLENGTH => {
                let array = self.take();
                let dst = self.temp();
                self.ops.push(MicroOp::ArrayLength { pc, dst, array });
                self.stack.push(Operand::Temp(dst));
            }
            inst::IALOAD => {
                let index = self.take();
                let array = self.take();
                let dst = self.temp();
                self.ops.push(MicroOp::IntArrayLoad {
                    pc,
                    dst,
                    array,
                    index,
                });
                self.stack.push(Operand::Temp(dst));
            }
            inst::IASTORE => {
                let value = self.take();
                let index = self.take();
                let array = self.take();
                self.ops.push(MicroOp::IntArrayStore {
                    pc,
                    array,
                    index,
                    value,
                });
            }
            _ => return false,
        }
        true
    }
}

/// Compiles the straight-line run starting at `start`.
pub(crate) fn compile(code: &Code, start: usize, min_len: usize) -> TraceSlot {
    let mut compiler = Compiler {
        code,
        ops: vec![],
        stack: vec![],
        temps: 0,
    };
    let mut pc = start;
    let mut len = 0;
    while pc < code.bytecode.len() && compiler.instruction(pc) {
        pc += inst::instruction_length(&code.bytecode, pc);
        len += 1;
    }
    // a single instruction gains nothing from fusion
    if len < min_len.max(2) {
        return TraceSlot::Failed;
    }
    TraceSlot::Compiled(Arc::new(Trace {
        start_pc: start,
        end_pc: pc,
        len,
        temps: compiler.temps,
        ops: compiler.ops,
        result: compiler.stack,
    }))
}

fn read(frame: &InterpretedFrame, temps: &[Variable], operand: Operand) -> Variable {
    match operand {
        Operand::Local(n) => frame.locals[n as usize],
        Operand::Const(value) => value,
        Operand::Temp(t) => temps[t],
    }
}

fn read_wide(frame: &InterpretedFrame, temps: &[Variable], operands: [Operand; 2]) -> (Variable, Variable) {
    (read(frame, temps, operands[0]), read(frame, temps, operands[1]))
}

impl Trace {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Runs the trace on `frame`. A fault leaves pc at the faulting instruction with every
    /// earlier effect applied, as the interpreter would have.
    pub(crate) fn run(&self, frame: &mut InterpretedFrame, heap: &mut Heap) -> Result<(), Exception> {
        debug_assert_eq!(frame.pc, self.start_pc);
        let mut temps = vec![Variable::ZERO; self.temps];
        for op in &self.ops {
            let fault = match self.apply(op, frame, heap, &mut temps) {
                Ok(()) => continue,
                Err(fault) => fault,
            };
            frame.pc = match op {
                MicroOp::Int { pc, .. }
                | MicroOp::GetField { pc, .. }
                | MicroOp::PutField { pc, .. }
                | MicroOp::ArrayLength { pc, .. }
                | MicroOp::IntArrayLoad { pc, .. }
                | MicroOp::IntArrayStore { pc, .. } => *pc,
                other => unreachable!("{other:?} cannot fault"),
            };
            return Err(fault);
        }
        for &operand in &self.result {
            let value = read(frame, &temps, operand);
            frame.push(value);
        }
        frame.pc = self.end_pc;
        Ok(())
    }

    fn apply(
        &self,
        op: &MicroOp,
        frame: &mut InterpretedFrame,
        heap: &mut Heap,
        temps: &mut [Variable],
    ) -> Result<(), Exception> {
        match op {
            MicroOp::Pop { dst } => temps[*dst] = frame.pop(),
            MicroOp::Copy { dst, src } => temps[*dst] = read(frame, temps, *src),
            MicroOp::Store { local, src } => frame.locals[*local as usize] = read(frame, temps, *src),
            MicroOp::Iinc { local, delta } => {
                let slot = &mut frame.locals[*local as usize];
                *slot = Variable::from_int(slot.int().wrapping_add(*delta));
            }
            MicroOp::Int { op, dst, a, b, .. } => {
                let a = read(frame, temps, *a).int();
                let b = read(frame, temps, *b).int();
                temps[*dst] = Variable::from_int(op.apply(a, b)?);
            }
            MicroOp::IntNeg { dst, src } => {
                temps[*dst] = Variable::from_int(read(frame, temps, *src).int().wrapping_neg())
            }
            MicroOp::Long { op, dst, a, b } => {
                let (au, al) = read_wide(frame, temps, *a);
                let (bu, bl) = read_wide(frame, temps, *b);
                let result = op.apply(Variable::get_long(au, al), Variable::get_long(bu, bl));
                (temps[*dst], temps[*dst + 1]) = Variable::put_long(result);
            }
            MicroOp::Float { op, dst, a, b } => {
                let a = read(frame, temps, *a).float();
                let b = read(frame, temps, *b).float();
                temps[*dst] = Variable::from_float(op.apply_f32(a, b));
            }
            MicroOp::Double { op, dst, a, b } => {
                let (au, al) = read_wide(frame, temps, *a);
                let (bu, bl) = read_wide(frame, temps, *b);
                let result = op.apply_f64(Variable::get_double(au, al), Variable::get_double(bu, bl));
                (temps[*dst], temps[*dst + 1]) = Variable::put_double(result);
            }
            MicroOp::Convert { op, dst, src } => {
                let value = read(frame, temps, *src).int();
                temps[*dst] = match op {
                    Conversion::ToByte => Variable::from_int(value as i8 as i32),
                    Conversion::ToChar => Variable::from_int(value as u16 as i32),
                    Conversion::ToShort => Variable::from_int(value as i16 as i32),
                    Conversion::ToFloat => Variable::from_float(value as f32),
                };
            }
            MicroOp::Widen { to_double, dst, src } => {
                let value = read(frame, temps, *src).int();
                (temps[*dst], temps[*dst + 1]) = if *to_double {
                    Variable::put_double(value as f64)
                } else {
                    Variable::put_long(value as i64)
                };
            }
            MicroOp::LongToInt { dst, src } => {
                let (upper, lower) = read_wide(frame, temps, *src);
                temps[*dst] = Variable::from_int(Variable::get_long(upper, lower) as i32);
            }
            MicroOp::GetField {
                dst, object, slot, ..
            } => {
                let object = read(frame, temps, *object).reference();
                if object == 0 {
                    return Err(null_pointer());
                }
                temps[*dst] = heap.get_field(object, *slot);
            }
            MicroOp::PutField {
                object, slot, value, ..
            } => {
                let object = read(frame, temps, *object).reference();
                if object == 0 {
                    return Err(null_pointer());
                }
                heap.put_field(object, *slot, read(frame, temps, *value));
            }
            MicroOp::GetStatic { class, dst, slot } => temps[*dst] = class.get_static_field(*slot),
            MicroOp::PutStatic { class, slot, value } => {
                class.set_static_field(*slot, read(frame, temps, *value))
            }
            MicroOp::ArrayLength { dst, array, .. } => {
                let array = read(frame, temps, *array).reference();
                if array == 0 {
                    return Err(null_pointer());
                }
                let len = heap.array(array).map(ArrayData::len).ok_or_else(not_an_array)?;
                temps[*dst] = Variable::from_int(len as i32);
            }
            MicroOp::IntArrayLoad {
                dst, array, index, ..
            } => {
                let array = read(frame, temps, *array).reference();
                let index = read(frame, temps, *index).int();
                temps[*dst] = Variable::from_int(load_element::<i32>(heap, array, index)?);
            }
            MicroOp::IntArrayStore {
                array,
                index,
                value,
                ..
            } => {
                let array = read(frame, temps, *array).reference();
                let index = read(frame, temps, *index).int();
                let value = read(frame, temps, *value).int();
                store_element(heap, array, index, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::builder::Assembler;

    fn code(asm: Assembler) -> Code {
        let attribute = asm.finish().unwrap();
        Code::new(
            attribute.max_stack,
            attribute.max_locals,
            attribute.code,
            attribute.exception_table,
            attribute.line_numbers,
        )
    }

    fn compiled(slot: TraceSlot) -> Arc<Trace> {
        match slot {
            TraceSlot::Compiled(trace) => trace,
            TraceSlot::Failed => panic!("expected a compiled trace"),
        }
    }

    #[test]
    fn test_trace_stops_at_branch() {
        let mut asm = Assembler::new(3);
        let top = asm.new_label();
        asm.bind(top)
            .op(inst::ILOAD_1)
            .op(inst::ILOAD_2)
            .op(inst::IADD)
            .op(inst::ISTORE_1)
            .iinc(2, 1)
            .branch(inst::GOTO, top);
        let trace = compiled(compile(&code(asm), 0, 2));
        assert_eq!(trace.len(), 5);
        assert_eq!(trace.end_pc, 7);
        assert!(trace.result.is_empty());
        // nothing is popped from the real stack
        assert!(!trace.ops.iter().any(|op| matches!(op, MicroOp::Pop { .. })));
    }

    #[test]
    fn test_short_runs_are_discarded() {
        let mut asm = Assembler::new(1);
        let top = asm.new_label();
        asm.bind(top).op(inst::ILOAD_0).branch(inst::IFEQ, top).op(inst::RETURN);
        assert!(matches!(compile(&code(asm), 0, 2), TraceSlot::Failed));

        let store_one = || {
            let mut asm = Assembler::new(1);
            asm.op(inst::ICONST_1).op(inst::ISTORE_0).op(inst::RETURN);
            code(asm)
        };
        assert!(matches!(compile(&store_one(), 0, 3), TraceSlot::Failed));
        assert!(matches!(compile(&store_one(), 0, 2), TraceSlot::Compiled(_)));
    }

    #[test]
    fn test_pending_local_reads_are_detached() {
        // iload_0; iinc 0 1; istore_1: local 1 gets the value from before the increment
        let mut asm = Assembler::new(2);
        asm.op(inst::ILOAD_0).iinc(0, 1).op(inst::ISTORE_1).op(inst::RETURN);
        let trace = compiled(compile(&code(asm), 0, 2));
        assert!(matches!(
            trace.ops[0],
            MicroOp::Copy {
                src: Operand::Local(0),
                ..
            }
        ));
        assert!(matches!(
            trace.ops[2],
            MicroOp::Store {
                local: 1,
                src: Operand::Temp(_)
            }
        ));
    }

    #[test]
    fn test_unconsumed_values_are_pushed_back() {
        let mut asm = Assembler::new(1);
        asm.op(inst::ILOAD_0).op(inst::ICONST_2).op(inst::IMUL).op(inst::ICONST_1).op(inst::RETURN);
        let trace = compiled(compile(&code(asm), 0, 2));
        assert_eq!(trace.result.len(), 2);
        assert_eq!(trace.result[1], Operand::Const(Variable::from_int(1)));
    }
}

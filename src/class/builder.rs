use std::sync::Arc;

use thiserror::Error;

use crate::{
    class::{
        BootstrapMethod, ClassFile, CodeAttribute, ConstantPoolEntry, ExceptionTableEntry,
        FieldInfo, LineNumberEntry, MethodInfo,
    },
    consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag, RefKind},
    runtime::instructions as inst,
};

/// Assembles a [`ClassFile`] in memory, interning constant-pool entries as they are requested.
#[derive(Debug, Clone)]
pub struct ClassFileBuilder {
    access_flags: ClassAccessFlag,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    constant_pool: Vec<ConstantPoolEntry>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
    bootstrap_methods: Vec<BootstrapMethod>,
    source_file: Option<Arc<str>>,
}

impl ClassFileBuilder {
    pub fn new(name: &str) -> Self {
        let mut builder = ClassFileBuilder {
            access_flags: ClassAccessFlag::PUBLIC | ClassAccessFlag::SUPER,
            this_class: 0,
            super_class: 0,
            interfaces: vec![],
            constant_pool: vec![],
            fields: vec![],
            methods: vec![],
            bootstrap_methods: vec![],
            source_file: None,
        };
        builder.this_class = builder.class(name);
        builder.super_class = builder.class("java/lang/Object");
        builder
    }

    pub fn access(&mut self, access_flags: ClassAccessFlag) -> &mut Self {
        self.access_flags = access_flags;
        self
    }

    pub fn super_class(&mut self, name: &str) -> &mut Self {
        self.super_class = self.class(name);
        self
    }

    pub fn no_super_class(&mut self) -> &mut Self {
        self.super_class = 0;
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        let index = self.class(name);
        self.interfaces.push(index);
        self
    }

    pub fn source_file(&mut self, name: &str) -> &mut Self {
        self.source_file = Some(Arc::from(name));
        self
    }

    pub fn field(&mut self, access_flags: FieldAccessFlag, name: &str, descriptor: &str) -> &mut Self {
        self.fields.push(FieldInfo {
            access_flags,
            name: Arc::from(name),
            descriptor: Arc::from(descriptor),
        });
        self
    }

    pub fn method(
        &mut self,
        access_flags: MethodAccessFlag,
        name: &str,
        descriptor: &str,
        code: CodeAttribute,
    ) -> &mut Self {
        self.methods.push(MethodInfo {
            access_flags,
            name: Arc::from(name),
            descriptor: Arc::from(descriptor),
            code: Some(code),
        });
        self
    }

    pub fn native_method(
        &mut self,
        access_flags: MethodAccessFlag,
        name: &str,
        descriptor: &str,
    ) -> &mut Self {
        self.methods.push(MethodInfo {
            access_flags: access_flags | MethodAccessFlag::NATIVE,
            name: Arc::from(name),
            descriptor: Arc::from(descriptor),
            code: None,
        });
        self
    }

    pub fn abstract_method(
        &mut self,
        access_flags: MethodAccessFlag,
        name: &str,
        descriptor: &str,
    ) -> &mut Self {
        self.methods.push(MethodInfo {
            access_flags: access_flags | MethodAccessFlag::ABSTRACT,
            name: Arc::from(name),
            descriptor: Arc::from(descriptor),
            code: None,
        });
        self
    }

    fn add(&mut self, entry: ConstantPoolEntry) -> u16 {
        let dedup = !matches!(
            entry,
            ConstantPoolEntry::Float(_) | ConstantPoolEntry::Double(_)
        );
        if dedup {
            if let Some(i) = self.constant_pool.iter().position(|e| *e == entry) {
                return (i + 1) as u16;
            }
        }
        let wide = matches!(
            entry,
            ConstantPoolEntry::Long(_) | ConstantPoolEntry::Double(_)
        );
        self.constant_pool.push(entry);
        let index = self.constant_pool.len() as u16;
        if wide {
            self.constant_pool.push(ConstantPoolEntry::Empty);
        }
        index
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        self.add(ConstantPoolEntry::Utf8(Arc::from(s)))
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.add(ConstantPoolEntry::Class { name_index })
    }

    pub fn string(&mut self, s: &str) -> u16 {
        let string_index = self.utf8(s);
        self.add(ConstantPoolEntry::String { string_index })
    }

    pub fn integer(&mut self, i: i32) -> u16 {
        self.add(ConstantPoolEntry::Integer(i))
    }

    pub fn float(&mut self, f: f32) -> u16 {
        self.add(ConstantPoolEntry::Float(f))
    }

    pub fn long(&mut self, l: i64) -> u16 {
        self.add(ConstantPoolEntry::Long(l))
    }

    pub fn double(&mut self, d: f64) -> u16 {
        self.add(ConstantPoolEntry::Double(d))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.add(ConstantPoolEntry::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.add(ConstantPoolEntry::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.add(ConstantPoolEntry::Methodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.add(ConstantPoolEntry::InterfaceMethodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn method_handle(&mut self, kind: RefKind, reference_index: u16) -> u16 {
        self.add(ConstantPoolEntry::MethodHandle {
            reference_kind: kind as u8,
            reference_index,
        })
    }

    pub fn method_type(&mut self, descriptor: &str) -> u16 {
        let descriptor_index = self.utf8(descriptor);
        self.add(ConstantPoolEntry::MethodType { descriptor_index })
    }

    /// Registers a bootstrap method and returns its index in the bootstrap table.
    pub fn bootstrap_method(&mut self, method_handle: u16, arguments: Vec<u16>) -> u16 {
        self.bootstrap_methods.push(BootstrapMethod {
            method_ref: method_handle,
            arguments,
        });
        (self.bootstrap_methods.len() - 1) as u16
    }

    pub fn invoke_dynamic(&mut self, bootstrap_index: u16, name: &str, descriptor: &str) -> u16 {
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.add(ConstantPoolEntry::InvokeDynamic {
            bootstrap_method_attr_index: bootstrap_index,
            name_and_type_index,
        })
    }

    pub fn build(&self) -> ClassFile {
        ClassFile {
            access_flags: self.access_flags,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: self.interfaces.clone(),
            constant_pool: self.constant_pool.clone(),
            fields: self.fields.clone(),
            methods: self.methods.clone(),
            bootstrap_methods: self.bootstrap_methods.clone(),
            source_file: self.source_file.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("label {0} is never bound")]
    UnboundLabel(usize),
    #[error("branch at pc {0} does not fit in 16 bits")]
    BranchOutOfRange(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Patch {
    // where the offset is written
    at: usize,
    // pc of the instruction the offset is relative to
    base: usize,
    label: Label,
    wide: bool,
}

#[derive(Debug)]
struct PendingHandler {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: u16,
}

/// Emits bytecode with symbolic branch targets, patched in [`Assembler::finish`].
#[derive(Debug)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    patches: Vec<Patch>,
    handlers: Vec<PendingHandler>,
    line_numbers: Vec<LineNumberEntry>,
    max_stack: u16,
    max_locals: u16,
}

impl Assembler {
    pub fn new(max_locals: u16) -> Self {
        Assembler {
            code: vec![],
            labels: vec![],
            patches: vec![],
            handlers: vec![],
            line_numbers: vec![],
            max_stack: 16,
            max_locals,
        }
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn max_stack(&mut self, max_stack: u16) -> &mut Self {
        self.max_stack = max_stack;
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn op(&mut self, op: u8) -> &mut Self {
        self.code.push(op);
        self
    }

    pub fn op_u8(&mut self, op: u8, operand: u8) -> &mut Self {
        self.code.push(op);
        self.code.push(operand);
        self
    }

    pub fn op_u16(&mut self, op: u8, operand: u16) -> &mut Self {
        self.code.push(op);
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    pub fn bipush(&mut self, value: i8) -> &mut Self {
        self.op_u8(inst::BIPUSH, value as u8)
    }

    pub fn sipush(&mut self, value: i16) -> &mut Self {
        self.op_u16(inst::SIPUSH, value as u16)
    }

    /// Picks the narrowest integer push for `value`.
    pub fn iconst(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op((inst::ICONST_0 as i32 + value) as u8),
            -128..=127 => self.bipush(value as i8),
            -32768..=32767 => self.sipush(value as i16),
            _ => panic!("iconst {value} needs a constant-pool entry"),
        }
    }

    pub fn ldc(&mut self, index: u16) -> &mut Self {
        if index < 256 {
            self.op_u8(inst::LDC, index as u8)
        } else {
            self.op_u16(inst::LDC_W, index)
        }
    }

    pub fn load(&mut self, op: u8, local: u16) -> &mut Self {
        if local < 256 {
            self.op_u8(op, local as u8)
        } else {
            self.op(inst::WIDE).op_u16(op, local)
        }
    }

    pub fn iinc(&mut self, local: u16, delta: i16) -> &mut Self {
        if local < 256 && (-128..=127).contains(&delta) {
            self.code
                .extend_from_slice(&[inst::IINC, local as u8, delta as i8 as u8]);
        } else {
            self.code.extend_from_slice(&[inst::WIDE, inst::IINC]);
            self.code.extend_from_slice(&local.to_be_bytes());
            self.code.extend_from_slice(&delta.to_be_bytes());
        }
        self
    }

    pub fn branch(&mut self, op: u8, target: Label) -> &mut Self {
        let base = self.code.len();
        self.code.push(op);
        let wide = op == inst::GOTO_W || op == inst::JSR_W;
        self.patches.push(Patch {
            at: self.code.len(),
            base,
            label: target,
            wide,
        });
        let width = if wide { 4 } else { 2 };
        self.code.extend(std::iter::repeat_n(0, width));
        self
    }

    pub fn newarray(&mut self, atype: u8) -> &mut Self {
        self.op_u8(inst::NEWARRAY, atype)
    }

    pub fn multianewarray(&mut self, class_index: u16, dimensions: u8) -> &mut Self {
        self.op_u16(inst::MULTIANEWARRAY, class_index);
        self.code.push(dimensions);
        self
    }

    pub fn invokeinterface(&mut self, method_index: u16, count: u8) -> &mut Self {
        self.op_u16(inst::INVOKEINTERFACE, method_index);
        self.code.extend_from_slice(&[count, 0]);
        self
    }

    pub fn invokedynamic(&mut self, index: u16) -> &mut Self {
        self.op_u16(inst::INVOKEDYNAMIC, index);
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    fn align(&mut self) {
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
    }

    fn switch_offset(&mut self, base: usize, label: Label) {
        self.patches.push(Patch {
            at: self.code.len(),
            base,
            label,
            wide: true,
        });
        self.code.extend_from_slice(&[0; 4]);
    }

    pub fn tableswitch(&mut self, default: Label, low: i32, targets: &[Label]) -> &mut Self {
        let base = self.code.len();
        self.code.push(inst::TABLESWITCH);
        self.align();
        self.switch_offset(base, default);
        let high = low + targets.len() as i32 - 1;
        self.code.extend_from_slice(&low.to_be_bytes());
        self.code.extend_from_slice(&high.to_be_bytes());
        for target in targets {
            self.switch_offset(base, *target);
        }
        self
    }

    pub fn lookupswitch(&mut self, default: Label, pairs: &[(i32, Label)]) -> &mut Self {
        let base = self.code.len();
        self.code.push(inst::LOOKUPSWITCH);
        self.align();
        self.switch_offset(base, default);
        self.code
            .extend_from_slice(&(pairs.len() as i32).to_be_bytes());
        let mut pairs = pairs.to_vec();
        pairs.sort_by_key(|(key, _)| *key);
        for (key, target) in pairs {
            self.code.extend_from_slice(&key.to_be_bytes());
            self.switch_offset(base, target);
        }
        self
    }

    /// `catch_type` is a constant-pool class index, 0 for a catch-all.
    pub fn try_catch(&mut self, start: Label, end: Label, handler: Label, catch_type: u16) -> &mut Self {
        self.handlers.push(PendingHandler {
            start,
            end,
            handler,
            catch_type,
        });
        self
    }

    pub fn line(&mut self, line_number: u16) -> &mut Self {
        self.line_numbers.push(LineNumberEntry {
            start_pc: self.code.len() as u16,
            line_number,
        });
        self
    }

    fn label_pc(&self, label: Label) -> Result<usize, AssembleError> {
        self.labels[label.0].ok_or(AssembleError::UnboundLabel(label.0))
    }

    pub fn finish(mut self) -> Result<CodeAttribute, AssembleError> {
        for patch in &self.patches {
            let target = self.labels[patch.label.0].ok_or(AssembleError::UnboundLabel(patch.label.0))?;
            let offset = target as i64 - patch.base as i64;
            if patch.wide {
                self.code[patch.at..patch.at + 4].copy_from_slice(&(offset as i32).to_be_bytes());
            } else {
                let offset =
                    i16::try_from(offset).map_err(|_| AssembleError::BranchOutOfRange(patch.base))?;
                self.code[patch.at..patch.at + 2].copy_from_slice(&offset.to_be_bytes());
            }
        }
        let mut exception_table = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            exception_table.push(ExceptionTableEntry {
                start_pc: self.label_pc(handler.start)? as u16,
                end_pc: self.label_pc(handler.end)? as u16,
                handler_pc: self.label_pc(handler.handler)? as u16,
                catch_type: handler.catch_type,
            });
        }
        Ok(CodeAttribute {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code: self.code,
            exception_table,
            line_numbers: self.line_numbers,
        })
    }
}

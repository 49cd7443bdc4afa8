use std::sync::Arc;

use crate::consts::{ClassAccessFlag, FieldAccessFlag, MethodAccessFlag};

/// An already-parsed class. Constant-pool indices are 1-based, as in the class-file format,
/// so `constant_pool[0]` describes index 1. Long and double entries are followed by an
/// [`ConstantPoolEntry::Empty`] placeholder.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub access_flags: ClassAccessFlag,
    pub this_class: u16,
    // 0 only for java/lang/Object
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub constant_pool: Vec<ConstantPoolEntry>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub bootstrap_methods: Vec<BootstrapMethod>,
    pub source_file: Option<Arc<str>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstantPoolEntry {
    Utf8(Arc<str>),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Empty,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: FieldAccessFlag,
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: MethodAccessFlag,
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
    pub code: Option<CodeAttribute>,
}

#[derive(Debug, Clone, Default)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub line_numbers: Vec<LineNumberEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    // 0 catches everything
    pub catch_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMethod {
    pub method_ref: u16,
    pub arguments: Vec<u16>,
}

impl ClassFile {
    pub fn constant(&self, index: u16) -> Option<&ConstantPoolEntry> {
        if index == 0 {
            return None;
        }
        self.constant_pool.get(index as usize - 1)
    }

    pub fn utf8(&self, index: u16) -> Option<&Arc<str>> {
        match self.constant(index)? {
            ConstantPoolEntry::Utf8(s) => Some(s),
            _ => None,
        }
    }

    pub fn class_name_at(&self, index: u16) -> Option<&Arc<str>> {
        match self.constant(index)? {
            ConstantPoolEntry::Class { name_index } => self.utf8(*name_index),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&Arc<str>> {
        self.class_name_at(self.this_class)
    }

    pub fn super_class_name(&self) -> Option<&Arc<str>> {
        self.class_name_at(self.super_class)
    }
}

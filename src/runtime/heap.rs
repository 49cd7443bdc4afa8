use std::sync::Arc;

use crate::{
    consts::RefKind,
    descriptor::FieldType,
    runtime::{Class, Method, NULL, ObjRef, Variable},
};

pub(crate) mod string_table;

pub(crate) use string_table::StringTable;

/// Object arena. Handles are slot index + 1, so that 0 stays free for null.
#[derive(Debug, Default)]
pub struct Heap {
    heap: Vec<Option<HeapObject>>,
    next_id: u32,
    pub(crate) string_table: StringTable,
}

#[derive(Debug, Clone)]
pub(crate) struct HeapObject {
    pub(crate) class: Arc<Class>,
    // instance fields for plain objects, empty otherwise
    pub(crate) fields: Vec<Variable>,
    pub(crate) kind: ObjectKind,
}

#[derive(Debug, Clone)]
pub(crate) enum ObjectKind {
    Plain,
    Array(ArrayData),
    Str(Arc<str>),
    /// A `java/lang/Class` instance standing for the class it carries.
    Mirror(Arc<Class>),
    MethodType {
        descriptor: Arc<str>,
    },
    MethodHandle {
        kind: RefKind,
        method: Arc<Method>,
        // bound trailing argument, see `MethodHandle.withAppendix`
        appendix: Option<ObjRef>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ArrayData {
    // boolean arrays share the byte representation
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Reference(Vec<ObjRef>),
}

impl ArrayData {
    pub(crate) fn new(element: &FieldType, len: usize) -> ArrayData {
        match element {
            FieldType::Byte | FieldType::Boolean => ArrayData::Byte(vec![0; len]),
            FieldType::Char => ArrayData::Char(vec![0; len]),
            FieldType::Short => ArrayData::Short(vec![0; len]),
            FieldType::Int => ArrayData::Int(vec![0; len]),
            FieldType::Long => ArrayData::Long(vec![0; len]),
            FieldType::Float => ArrayData::Float(vec![0.0; len]),
            FieldType::Double => ArrayData::Double(vec![0.0; len]),
            FieldType::Object(_) | FieldType::Array(_) => ArrayData::Reference(vec![NULL; len]),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            ArrayData::Byte(v) => v.len(),
            ArrayData::Char(v) => v.len(),
            ArrayData::Short(v) => v.len(),
            ArrayData::Int(v) => v.len(),
            ArrayData::Long(v) => v.len(),
            ArrayData::Float(v) => v.len(),
            ArrayData::Double(v) => v.len(),
            ArrayData::Reference(v) => v.len(),
        }
    }

    /// Copies `length` elements from `src[src_pos..]` to `self[dest_pos..]`. Both arrays must
    /// hold the same element kind and the ranges must already be bounds-checked.
    pub(crate) fn copy_from(
        &mut self,
        dest_pos: usize,
        src: &ArrayData,
        src_pos: usize,
        length: usize,
    ) -> bool {
        macro_rules! copy {
            ($dest:expr, $src:expr; $($variant:ident),*) => {
                match ($dest, $src) {
                    $((ArrayData::$variant(dest), ArrayData::$variant(src)) => {
                        dest[dest_pos..dest_pos + length]
                            .copy_from_slice(&src[src_pos..src_pos + length]);
                        true
                    })*
                    _ => false,
                }
            };
        }
        copy!(self, src; Byte, Char, Short, Int, Long, Float, Double, Reference)
    }

    /// Copies within one array; the ranges may overlap.
    pub(crate) fn copy_within(&mut self, src_pos: usize, dest_pos: usize, length: usize) {
        macro_rules! copy {
            ($data:expr; $($variant:ident),*) => {
                match $data {
                    $(ArrayData::$variant(v) => v.copy_within(src_pos..src_pos + length, dest_pos),)*
                }
            };
        }
        copy!(self; Byte, Char, Short, Int, Long, Float, Double, Reference)
    }
}

/// Element types that can be read and written through typed array instructions.
pub(crate) trait ArrayType: Copy + Default {
    fn slice(data: &ArrayData) -> Option<&[Self]>;
    fn slice_mut(data: &mut ArrayData) -> Option<&mut [Self]>;
}

macro_rules! array_type {
    ($($t:ty => $variant:ident),*) => {
        $(
            impl ArrayType for $t {
                fn slice(data: &ArrayData) -> Option<&[Self]> {
                    match data {
                        ArrayData::$variant(v) => Some(v),
                        _ => None,
                    }
                }

                fn slice_mut(data: &mut ArrayData) -> Option<&mut [Self]> {
                    match data {
                        ArrayData::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

array_type!(i8 => Byte, u16 => Char, i16 => Short, i32 => Int, i64 => Long, f32 => Float, f64 => Double, u32 => Reference);

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    pub(crate) fn allocate_object(&mut self, class: Arc<Class>) -> ObjRef {
        let fields = vec![Variable::ZERO; class.instance_slots()];
        self.allocate(HeapObject {
            class,
            fields,
            kind: ObjectKind::Plain,
        })
    }

    pub(crate) fn allocate_array(&mut self, class: Arc<Class>, data: ArrayData) -> ObjRef {
        self.allocate(HeapObject {
            class,
            fields: vec![],
            kind: ObjectKind::Array(data),
        })
    }

    pub(crate) fn allocate_string(&mut self, string_class: Arc<Class>, value: Arc<str>) -> ObjRef {
        self.allocate(HeapObject {
            class: string_class,
            fields: vec![],
            kind: ObjectKind::Str(value),
        })
    }

    /// Returns the canonical string object for `value`, allocating it on first use.
    pub(crate) fn intern_string(&mut self, string_class: &Arc<Class>, value: &str) -> ObjRef {
        if let Some(id) = self.string_table.get(value) {
            return id;
        }
        let value: Arc<str> = Arc::from(value);
        let id = self.allocate_string(Arc::clone(string_class), Arc::clone(&value));
        self.string_table.insert(value, id);
        id
    }

    /// Interns an existing string object, returning the canonical instance.
    pub(crate) fn intern_existing(&mut self, id: ObjRef) -> Option<ObjRef> {
        let value = Arc::clone(self.string_value(id)?);
        if let Some(canonical) = self.string_table.get(&value) {
            return Some(canonical);
        }
        self.string_table.insert(value, id);
        Some(id)
    }

    pub(crate) fn allocate_mirror(&mut self, class_class: Arc<Class>, class: Arc<Class>) -> ObjRef {
        self.allocate(HeapObject {
            class: class_class,
            fields: vec![],
            kind: ObjectKind::Mirror(class),
        })
    }

    pub(crate) fn allocate_method_type(
        &mut self,
        method_type_class: Arc<Class>,
        descriptor: Arc<str>,
    ) -> ObjRef {
        self.allocate(HeapObject {
            class: method_type_class,
            fields: vec![],
            kind: ObjectKind::MethodType { descriptor },
        })
    }

    pub(crate) fn allocate_method_handle(
        &mut self,
        method_handle_class: Arc<Class>,
        kind: RefKind,
        method: Arc<Method>,
        appendix: Option<ObjRef>,
    ) -> ObjRef {
        self.allocate(HeapObject {
            class: method_handle_class,
            fields: vec![],
            kind: ObjectKind::MethodHandle {
                kind,
                method,
                appendix,
            },
        })
    }

    fn allocate(&mut self, object: HeapObject) -> ObjRef {
        assert!(self.next_id < u32::MAX - 1, "heap exhausted");
        let id = self.next_id;
        if self.heap.len() <= id as usize {
            self.heap.resize_with(id as usize + 1, || None);
        }
        self.heap[id as usize] = Some(object);
        while (self.next_id as usize) < self.heap.len() && self.heap[self.next_id as usize].is_some()
        {
            self.next_id += 1;
        }
        id + 1
    }

    pub fn deallocate(&mut self, id: ObjRef) {
        if let Some(slot) = self.heap.get_mut((id.wrapping_sub(1)) as usize) {
            slot.take();
            self.next_id = self.next_id.min(id - 1);
        }
    }

    pub fn contains(&self, id: ObjRef) -> bool {
        matches!(self.heap.get((id.wrapping_sub(1)) as usize), Some(Some(_)))
    }

    /// Objects the engine reaches without the host: class mirrors and canonical strings.
    pub(crate) fn is_pinned(&self, id: ObjRef) -> bool {
        match &self.get(id).kind {
            ObjectKind::Mirror(_) => true,
            ObjectKind::Str(value) => self.string_table.get(value) == Some(id),
            _ => false,
        }
    }

    /// Live objects.
    pub fn len(&self) -> usize {
        self.heap.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get(&self, id: ObjRef) -> &HeapObject {
        self.heap
            .get((id.wrapping_sub(1)) as usize)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("dangling object handle {id}"))
    }

    pub(crate) fn get_mut(&mut self, id: ObjRef) -> &mut HeapObject {
        self.heap
            .get_mut((id.wrapping_sub(1)) as usize)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("dangling object handle {id}"))
    }

    pub(crate) fn class_of(&self, id: ObjRef) -> &Arc<Class> {
        &self.get(id).class
    }

    /// Shallow copy. Monitors are not part of the object, so the copy starts unlocked.
    pub(crate) fn clone_object(&mut self, id: ObjRef) -> ObjRef {
        let copy = self.get(id).clone();
        self.allocate(copy)
    }

    pub(crate) fn string_value(&self, id: ObjRef) -> Option<&Arc<str>> {
        match &self.get(id).kind {
            ObjectKind::Str(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn mirror_class(&self, id: ObjRef) -> Option<&Arc<Class>> {
        match &self.get(id).kind {
            ObjectKind::Mirror(class) => Some(class),
            _ => None,
        }
    }

    pub(crate) fn method_type_descriptor(&self, id: ObjRef) -> Option<&Arc<str>> {
        match &self.get(id).kind {
            ObjectKind::MethodType { descriptor } => Some(descriptor),
            _ => None,
        }
    }

    pub(crate) fn array(&self, id: ObjRef) -> Option<&ArrayData> {
        match &self.get(id).kind {
            ObjectKind::Array(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn array_mut(&mut self, id: ObjRef) -> Option<&mut ArrayData> {
        match &mut self.get_mut(id).kind {
            ObjectKind::Array(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn method_handle(&self, id: ObjRef) -> Option<(RefKind, &Arc<Method>, Option<ObjRef>)> {
        match &self.get(id).kind {
            ObjectKind::MethodHandle {
                kind,
                method,
                appendix,
            } => Some((*kind, method, *appendix)),
            _ => None,
        }
    }

    pub(crate) fn get_field(&self, id: ObjRef, index: usize) -> Variable {
        self.get(id).fields[index]
    }

    pub(crate) fn put_field(&mut self, id: ObjRef, index: usize, value: Variable) {
        self.get_mut(id).fields[index] = value;
    }
}

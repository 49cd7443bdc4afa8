use std::{
    sync::{Arc, LazyLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use crate::runtime::{
    ArrayElement, Exception, NativeEnv, NativeResult, NativeReturn, NativeVariable,
    famous_classes::{ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION, ARRAY_STORE_EXCEPTION},
    heap::ArrayData,
    inheritance::is_assignable_to,
    native::{NativeRegistry, null_pointer, object::native_object_hash_code},
};

const SYSTEM: &str = "java/lang/System";

fn array_store(message: impl Into<String>) -> Exception {
    Exception::new_vm_msg(ARRAY_STORE_EXCEPTION, message)
}

//     public static native void arraycopy(Object src,  int  srcPos,
//                                         Object dest, int destPos,
//                                         int length);
fn native_system_arraycopy(env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let src = env.args[0].get_ref();
    let src_pos = env.args[1].get_int();
    let dest = env.args[2].get_ref();
    let dest_pos = env.args[3].get_int();
    let length = env.args[4].get_int();

    if src == 0 || dest == 0 {
        return Err(null_pointer());
    }
    let heap = &mut env.machine.heap;
    let src_class = Arc::clone(heap.class_of(src));
    let dest_class = Arc::clone(heap.class_of(dest));
    let (Some(src_element), Some(dest_element)) =
        (&src_class.array_element, &dest_class.array_element)
    else {
        return Err(array_store("arraycopy: argument is not an array"));
    };
    let element_check = match (src_element, dest_element) {
        (ArrayElement::Primitive(s), ArrayElement::Primitive(d)) if s == d => None,
        (ArrayElement::Reference(_), ArrayElement::Reference(d)) => Some(Arc::clone(d)),
        _ => {
            return Err(array_store(format!(
                "arraycopy: type mismatch: can not copy {} into {}",
                src_class.class_name, dest_class.class_name
            )));
        }
    };

    let src_len = heap.array(src).map(ArrayData::len).unwrap_or(0) as i64;
    let dest_len = heap.array(dest).map(ArrayData::len).unwrap_or(0) as i64;
    if src_pos < 0
        || dest_pos < 0
        || length < 0
        || src_pos as i64 + length as i64 > src_len
        || dest_pos as i64 + length as i64 > dest_len
    {
        return Err(Exception::new_vm_msg(
            ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION,
            format!(
                "arraycopy: last source index {} out of bounds for length {src_len}",
                src_pos as i64 + length as i64
            ),
        ));
    }
    let (src_pos, dest_pos, mut length) = (src_pos as usize, dest_pos as usize, length as usize);

    // elements are copied up to the first one the destination cannot hold
    let mut failure = None;
    if let Some(dest_element) = element_check {
        if let Some(ArrayData::Reference(elements)) = heap.array(src) {
            for (i, &element) in elements[src_pos..src_pos + length].iter().enumerate() {
                if element != 0 && !is_assignable_to(heap.class_of(element), &dest_element) {
                    failure = Some(array_store(format!(
                        "arraycopy: element type {} cannot be stored in {}",
                        heap.class_of(element).class_name,
                        dest_class.class_name
                    )));
                    length = i;
                    break;
                }
            }
        }
    }

    if src == dest {
        if let Some(data) = heap.array_mut(dest) {
            data.copy_within(src_pos, dest_pos, length);
        }
    } else {
        let copied = heap.array(src).cloned();
        if let (Some(source), Some(target)) = (copied, heap.array_mut(dest)) {
            target.copy_from(dest_pos, &source, src_pos, length);
        }
    }
    match failure {
        Some(exception) => Err(exception),
        None => Ok(NativeReturn::VOID),
    }
}

// public static native long currentTimeMillis();
fn native_system_current_time_millis(_env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(NativeVariable::Long(millis).into())
}

// public static native long nanoTime();
fn native_system_nano_time(_env: NativeEnv<'_>) -> NativeResult<NativeReturn> {
    static INSTANT_BASE: LazyLock<Instant> = LazyLock::new(Instant::now);
    let nanos = INSTANT_BASE.elapsed().as_nanos() as i64;
    Ok(NativeVariable::Long(nanos).into())
}

pub(super) fn register_natives(registry: &NativeRegistry) {
    registry.register(
        SYSTEM,
        "arraycopy",
        "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        native_system_arraycopy,
    );
    registry.register(
        SYSTEM,
        "currentTimeMillis",
        "()J",
        native_system_current_time_millis,
    );
    registry.register(SYSTEM, "nanoTime", "()J", native_system_nano_time);
    registry.register(
        SYSTEM,
        "identityHashCode",
        "(Ljava/lang/Object;)I",
        native_object_hash_code,
    );
}

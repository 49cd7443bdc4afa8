use std::sync::Arc;

use crate::runtime::{ArrayElement, Class};

/// Whether a value of class `source` may be stored where `target` is expected. Drives
/// `checkcast`, `instanceof`, `aastore` and `System.arraycopy`.
pub(crate) fn is_assignable_to(source: &Arc<Class>, target: &Arc<Class>) -> bool {
    if Arc::ptr_eq(source, target) || source.class_name == target.class_name {
        return true;
    }
    match (&source.array_element, &target.array_element) {
        // source is array
        (Some(source_element), Some(target_element)) => match (source_element, target_element) {
            (ArrayElement::Primitive(s), ArrayElement::Primitive(t)) => s == t,
            (ArrayElement::Reference(s), ArrayElement::Reference(t)) => is_assignable_to(s, t),
            _ => false,
        },
        (Some(_), None) => {
            // target is not array
            if target.is_interface() {
                target.class_name.as_ref() == "java/lang/Cloneable"
                    || target.class_name.as_ref() == "java/io/Serializable"
            } else {
                // target is class, must be Object
                target.class_name.as_ref() == "java/lang/Object"
            }
        }
        (None, Some(_)) => false,
        // source is class
        (None, None) => {
            if target.is_interface() {
                is_class_implements(source, target)
            } else {
                is_same_or_sub_class_of(source, target)
            }
        }
    }
}

/// Searches declared interfaces, their super-interfaces and those of every superclass.
pub(crate) fn is_class_implements(class: &Arc<Class>, interface: &Arc<Class>) -> bool {
    for class_intf in class.interfaces() {
        if class_intf.class_name == interface.class_name || is_class_implements(class_intf, interface)
        {
            return true;
        }
    }
    if let Some(super_class) = class.super_class() {
        return is_class_implements(super_class, interface);
    }
    false
}

pub(crate) fn is_same_or_sub_class_of(source: &Arc<Class>, target: &Arc<Class>) -> bool {
    if source.class_name == target.class_name {
        return true;
    }
    if let Some(super_class) = source.super_class() {
        return is_same_or_sub_class_of(super_class, target);
    }
    false
}

/// Catch-type matching by name along the superclass chain.
pub(crate) fn is_subclass_of_name(class: &Arc<Class>, name: &str) -> bool {
    let mut current = Some(class);
    while let Some(class) = current {
        if class.class_name.as_ref() == name {
            return true;
        }
        current = class.super_class();
    }
    false
}

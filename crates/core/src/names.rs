//! Qualified and canonical names.
//!
//! A qualified name is `name.namespace` (or `name` for cluster-scoped objects).
//! A canonical name is `TYPE` or `TYPE/NAME[.NAMESPACE]` with `TYPE` normalized
//! to the plural resource name.

use smallvec::SmallVec;

use crate::ResourceInfo;

pub const DEFAULT_NAMESPACE: &str = "default";

pub fn qualified_name(name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", name, namespace)
    }
}

/// Normalize a user supplied qualified name for a kind.
///
/// Namespaced kinds get `.default` appended when the namespace part is missing.
pub fn default_qname(qname: &str, namespaced: bool) -> String {
    if namespaced && !qname.contains('.') {
        qualified_name(qname, DEFAULT_NAMESPACE)
    } else {
        qname.to_string()
    }
}

/// Split `TYPE[/NAME]`; `None` when there is more than one `/`.
pub fn split_type_name(input: &str) -> Option<(&str, Option<&str>)> {
    let parts: SmallVec<[&str; 3]> = input.split('/').collect();
    match parts.as_slice() {
        [kind] => Some((*kind, None)),
        [kind, name] => Some((*kind, Some(*name))),
        _ => None,
    }
}

/// Canonical form of the `NAME[.NAMESPACE]` half for an already resolved type.
pub fn canonical_object(info: &ResourceInfo, name: Option<&str>) -> Option<String> {
    let Some(name) = name else {
        return Some(info.plural.clone());
    };
    if !info.namespaced {
        return Some(format!("{}/{}", info.plural, name));
    }
    let parts: SmallVec<[&str; 3]> = name.split('.').collect();
    match parts.as_slice() {
        [name] => Some(format!("{}/{}.{}", info.plural, name, DEFAULT_NAMESPACE)),
        [name, namespace] => Some(format!("{}/{}.{}", info.plural, name, namespace)),
        _ => None,
    }
}

//! The type oracle this crate queries.
//!
//! The type checker and its unification/inference machinery live outside
//! this crate. `TypePool` is a minimal, concrete, in-memory stand-in: an
//! arena of [`TypeKind`] values plus the registries (instance-variable
//! layouts, hierarchy subtype lists, union member lists) the code generator
//! needs to answer the classification and structural queries in
//! [`TypeOracle`]. It performs no unification and no diagnostics — callers
//! build `TypeRef`s directly via [`TypePool::intern`] and friends.

use rustc_hash::FxHashMap;

/// Stable identity of a type, handed out by a [`TypePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeRef(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Nil,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Char,
    Pointer(TypeRef),
    /// A C-ABI struct: ordered, named, typed fields.
    CStruct { name: String, fields: Vec<(String, TypeRef)> },
    /// A C-ABI union: overlapping fields sharing one storage slot.
    CUnion { name: String, fields: Vec<(String, TypeRef)> },
    /// A reference (class) type with an ordered instance-variable layout.
    Class { name: String, instance_vars: Vec<(String, TypeRef)> },
    /// A closed sum type; `members` are the concrete alternatives.
    Union { members: Vec<TypeRef> },
    /// An open-subtype base; `subtypes` are the known concrete descendants.
    Hierarchy { base_name: String, subtypes: Vec<TypeRef> },
    /// `T | Nil` convenience wrapper distinct from a general union.
    NilableOf(TypeRef),
    Void,
    NoReturn,
}

/// The classification and structural queries the code generator needs from
/// the type system, independent of how that system is implemented.
pub trait TypeOracle {
    fn kind(&self, t: TypeRef) -> &TypeKind;

    fn is_union(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::Union { .. })
    }
    fn is_nilable(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::NilableOf(_))
    }
    fn is_hierarchy(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::Hierarchy { .. })
    }
    fn is_c_struct(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::CStruct { .. })
    }
    fn is_c_union(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::CUnion { .. })
    }
    fn is_nil_type(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::Nil)
    }
    fn is_no_return(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::NoReturn)
    }
    fn is_class(&self, t: TypeRef) -> bool {
        matches!(self.kind(t), TypeKind::Class { .. })
    }

    /// Whether values of `t` are passed by value (copied) rather than by
    /// reference at call boundaries — true for C structs/unions only.
    fn passed_by_val(&self, t: TypeRef) -> bool {
        self.is_c_struct(t) || self.is_c_union(t)
    }

    /// Whether an owning def's receiver of type `t` arrives already as a
    /// pointer (classes, hierarchies) versus by value.
    fn passed_as_self(&self, t: TypeRef) -> bool {
        self.is_class(t) || self.is_hierarchy(t) || self.is_union(t) || self.is_nilable(t)
    }

    /// Concrete alternatives of a union, or `[t]` for a non-union type.
    fn types(&self, t: TypeRef) -> Vec<TypeRef> {
        match self.kind(t) {
            TypeKind::Union { members } => members.clone(),
            _ => vec![t],
        }
    }

    /// Fully expanded concrete alternatives: unions flatten recursively,
    /// nilables expand to `[Nil, inner]`, everything else is `[t]`.
    fn concrete_types(&self, t: TypeRef) -> Vec<TypeRef> {
        match self.kind(t) {
            TypeKind::Union { members } => members.iter().flat_map(|&m| self.concrete_types(m)).collect(),
            TypeKind::NilableOf(inner) => {
                let mut v = vec![self.nil_type()];
                v.extend(self.concrete_types(*inner));
                v
            }
            _ => vec![t],
        }
    }

    fn subtypes(&self, t: TypeRef) -> Vec<TypeRef> {
        match self.kind(t) {
            TypeKind::Hierarchy { subtypes, .. } => subtypes.clone(),
            _ => Vec::new(),
        }
    }

    fn nilable_type(&self, t: TypeRef) -> Option<TypeRef> {
        match self.kind(t) {
            TypeKind::NilableOf(inner) => Some(*inner),
            _ => None,
        }
    }

    fn base_type(&self, t: TypeRef) -> Option<TypeRef> {
        match self.kind(t) {
            TypeKind::Hierarchy { .. } => Some(t),
            _ => None,
        }
    }

    /// Stable runtime tag used in the tagged-union `type_id` slot and in
    /// hierarchy boxing.
    fn type_id(&self, t: TypeRef) -> u32 {
        t.0
    }

    fn nil_type(&self) -> TypeRef;

    fn index_of_instance_var(&self, owner: TypeRef, name: &str) -> Option<usize> {
        match self.kind(owner) {
            TypeKind::Class { instance_vars, .. } => {
                instance_vars.iter().position(|(n, _)| n == name)
            }
            _ => None,
        }
    }

    fn lookup_instance_var(&self, owner: TypeRef, name: &str) -> Option<TypeRef> {
        match self.kind(owner) {
            TypeKind::Class { instance_vars, .. } => instance_vars
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, ty)| *ty),
            _ => None,
        }
    }

    fn implements(&self, t: TypeRef, other: TypeRef) -> bool {
        if t == other {
            return true;
        }
        self.subtypes(other).contains(&t)
    }
}

/// The concrete, in-memory [`TypeOracle`] this crate ships and tests against.
pub struct TypePool {
    kinds: Vec<TypeKind>,
    interned: FxHashMap<TypeKind, TypeRef>,
    nil_ref: TypeRef,
}

impl TypePool {
    pub fn new() -> Self {
        let mut kinds = Vec::new();
        kinds.push(TypeKind::Nil);
        let nil_ref = TypeRef(0);
        let mut interned = FxHashMap::default();
        interned.insert(TypeKind::Nil, nil_ref);
        Self { kinds, interned, nil_ref }
    }

    /// Intern a type, returning the existing ref if an identical kind was
    /// already registered.
    pub fn intern(&mut self, kind: TypeKind) -> TypeRef {
        if let Some(existing) = self.interned.get(&kind) {
            return *existing;
        }
        let id = TypeRef(self.kinds.len() as u32);
        self.interned.insert(kind.clone(), id);
        self.kinds.push(kind);
        id
    }

    /// Build a union over the given members, deduplicating and flattening
    /// one level of nested unions.
    pub fn union_of(&mut self, members: Vec<TypeRef>) -> TypeRef {
        let mut flat = Vec::new();
        for m in members {
            match self.kind(m).clone() {
                TypeKind::Union { members: inner } => flat.extend(inner),
                _ => flat.push(m),
            }
        }
        flat.sort_unstable_by_key(|t| t.0);
        flat.dedup();
        self.intern(TypeKind::Union { members: flat })
    }
}

impl Default for TypePool {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeOracle for TypePool {
    fn kind(&self, t: TypeRef) -> &TypeKind {
        &self.kinds[t.0 as usize]
    }

    fn nil_type(&self) -> TypeRef {
        self.nil_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes() {
        let mut pool = TypePool::new();
        let a = pool.intern(TypeKind::Int32);
        let b = pool.intern(TypeKind::Int32);
        assert_eq!(a, b);
    }

    #[test]
    fn union_flattens_and_dedupes() {
        let mut pool = TypePool::new();
        let i32_ty = pool.intern(TypeKind::Int32);
        let bool_ty = pool.intern(TypeKind::Bool);
        let inner = pool.union_of(vec![i32_ty, bool_ty]);
        let outer = pool.union_of(vec![inner, i32_ty]);
        assert_eq!(pool.concrete_types(outer).len(), 2);
    }

    #[test]
    fn nilable_queries() {
        let mut pool = TypePool::new();
        let i32_ty = pool.intern(TypeKind::Int32);
        let nilable = pool.intern(TypeKind::NilableOf(i32_ty));
        assert!(pool.is_nilable(nilable));
        assert_eq!(pool.nilable_type(nilable), Some(i32_ty));
        assert_eq!(pool.concrete_types(nilable), vec![pool.nil_type(), i32_ty]);
    }

    #[test]
    fn instance_var_lookup() {
        let mut pool = TypePool::new();
        let i32_ty = pool.intern(TypeKind::Int32);
        let class_ty = pool.intern(TypeKind::Class {
            name: "Point".into(),
            instance_vars: vec![("x".into(), i32_ty), ("y".into(), i32_ty)],
        });
        assert_eq!(pool.index_of_instance_var(class_ty, "y"), Some(1));
        assert_eq!(pool.lookup_instance_var(class_ty, "z"), None);
    }
}

//! Name -> function tables of a compilation context.
//!
//! Fragments are functions built in this context; externs are native
//! functions registered by the embedder. Call lowering looks names up here,
//! fragments first.

use std::fmt;
use std::ptr::NonNull;

use hashbrown::HashMap;

use crate::core::code_alloc::CodeBlock;
use crate::core::error::BuildError;
use crate::lir::{ArgType, CallInfo, GuardRecord, LirBuffer, TypeSig};

/// Entry point of generated or registered native code.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CodePtr(NonNull<u8>);

impl CodePtr {
    pub fn new(ptr: *const u8) -> Option<Self> {
        NonNull::new(ptr as *mut u8).map(CodePtr)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Reinterpret the entry point as a function pointer type.
    ///
    /// # Safety
    /// `F` must be an `extern "C"` function pointer whose signature matches
    /// the compiled code, and the owning context must outlive every call.
    pub unsafe fn as_fn<F: Copy>(self) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const u8>(),
            "CodePtr::as_fn needs a function pointer type"
        );
        let ptr = self.0.as_ptr() as *const u8;
        std::mem::transmute_copy(&ptr)
    }
}

impl fmt::Debug for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodePtr({:p})", self.0.as_ptr())
    }
}

/// A named function of this context.
#[derive(Debug)]
pub struct Fragment<'a> {
    pub name: &'a str,
    /// Instructions the code was generated from, once finalized.
    pub buffer: Option<&'a LirBuffer<'a>>,
    pub code: Option<CodeBlock>,
    /// Callable entry point; absent while building and for functions
    /// without a single return type.
    pub entry: Option<CodePtr>,
    pub return_type: Option<ArgType>,
    pub sig: Option<TypeSig>,
    /// Descriptor used when other functions call this one.
    pub call_info: Option<&'a CallInfo<'a>>,
    pub exits: Vec<&'a GuardRecord<'a>>,
}

impl<'a> Fragment<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            buffer: None,
            code: None,
            entry: None,
            return_type: None,
            sig: None,
            call_info: None,
            exits: Vec::new(),
        }
    }

    /// Whether code exists and can be called.
    pub fn is_callable(&self) -> bool {
        self.entry.is_some() && self.call_info.is_some()
    }
}

/// Fragments and registered externs of one context.
#[derive(Debug, Default)]
pub struct FragmentRegistry<'a> {
    fragments: HashMap<&'a str, Fragment<'a>>,
    externs: HashMap<&'a str, &'a CallInfo<'a>>,
}

impl<'a> FragmentRegistry<'a> {
    pub fn new() -> Self {
        Self {
            fragments: HashMap::new(),
            externs: HashMap::new(),
        }
    }

    /// Start a fresh fragment under `name`, replacing any earlier one.
    pub fn declare(&mut self, name: &'a str) {
        if self.fragments.insert(name, Fragment::new(name)).is_some() {
            log::debug!("fragment {} redefined", name);
        }
    }

    pub fn fragment(&self, name: &str) -> Option<&Fragment<'a>> {
        self.fragments.get(name)
    }

    pub fn fragment_mut(&mut self, name: &str) -> Option<&mut Fragment<'a>> {
        self.fragments.get_mut(name)
    }

    /// Register a native function. The first registration of a name wins.
    pub fn register_extern(&mut self, info: &'a CallInfo<'a>) -> bool {
        if let Some(existing) = self.externs.get(info.name) {
            log::warn!(
                "extern {} already registered as {}, keeping the first",
                info.name,
                existing.sig
            );
            return false;
        }
        self.externs.insert(info.name, info);
        true
    }

    pub fn extern_fn(&self, name: &str) -> Option<&'a CallInfo<'a>> {
        self.externs.get(name).copied()
    }

    /// Call descriptor for `name`: fragments shadow externs.
    pub fn resolve(&self, name: &str) -> Result<&'a CallInfo<'a>, BuildError> {
        if let Some(fragment) = self.fragments.get(name) {
            return fragment.call_info.ok_or_else(|| BuildError::NotCallable {
                name: name.to_string(),
            });
        }
        self.extern_fn(name).ok_or_else(|| BuildError::UnknownFunction {
            name: name.to_string(),
        })
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{AbiKind, AccessSet};

    fn info<'a>(name: &'a str, address: usize, sig: TypeSig) -> CallInfo<'a> {
        CallInfo {
            name,
            address,
            sig,
            abi: AbiKind::Cdecl,
            access: AccessSet::STORE,
        }
    }

    #[test]
    fn test_resolve_order() {
        let sig = TypeSig::new(ArgType::I, &[ArgType::I]).unwrap();
        let ext = info("f", 0x1000, sig);
        let mut registry = FragmentRegistry::new();

        assert_eq!(
            registry.resolve("f").unwrap_err(),
            BuildError::UnknownFunction { name: "f".into() }
        );

        assert!(registry.register_extern(&ext));
        assert_eq!(registry.resolve("f").unwrap().address, 0x1000);

        // A fragment without code shadows the extern.
        registry.declare("f");
        assert_eq!(
            registry.resolve("f").unwrap_err(),
            BuildError::NotCallable { name: "f".into() }
        );
    }

    #[test]
    fn test_first_extern_registration_wins() {
        let a = info("g", 0x10, TypeSig::new(ArgType::Q, &[]).unwrap());
        let b = info("g", 0x20, TypeSig::new(ArgType::D, &[]).unwrap());
        let mut registry = FragmentRegistry::new();
        assert!(registry.register_extern(&a));
        assert!(!registry.register_extern(&b));
        assert_eq!(registry.extern_fn("g").unwrap().address, 0x10);
    }

    #[test]
    fn test_redeclare_resets_fragment() {
        let mut registry = FragmentRegistry::new();
        registry.declare("h");
        registry.fragment_mut("h").unwrap().return_type = Some(ArgType::I);
        registry.declare("h");
        assert_eq!(registry.fragment_count(), 1);
        assert!(registry.fragment("h").unwrap().return_type.is_none());
        assert!(!registry.fragment("h").unwrap().is_callable());
    }

    #[test]
    fn test_code_ptr_rejects_null() {
        assert!(CodePtr::new(std::ptr::null()).is_none());
        let byte = 0u8;
        let ptr = CodePtr::new(&byte).unwrap();
        assert_eq!(ptr.addr(), &byte as *const u8 as usize);
    }
}

// This module implements the symbol registry that sessions consult while linking. A Registry
// maps external names to host-provided addresses (functions and data the embedding program
// exposes). It is an explicit value shared by reference between sessions rather than hidden
// process state, and all operations go through one mutex so a link running on one thread
// never observes a half-applied registration from another. The overwrite policy is fixed at
// creation: either a later registration replaces the earlier binding or it is rejected with
// DuplicateSymbol. Linking takes a single locked snapshot of every name it needs so one load
// sees one consistent view of the table.

//! Host symbol registry.

use hashbrown::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::error::RegistryError;

/// What a symbol refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Function,
    Data,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Function => f.write_str("function"),
            SymbolKind::Data => f.write_str("data"),
        }
    }
}

/// A named host address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub address: usize,
    pub size: Option<usize>,
}

/// Options fixed when a registry is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Replace existing bindings instead of failing with `DuplicateSymbol`.
    pub allow_overwrite: bool,
}

/// Thread-safe table of host symbols.
///
/// Sessions borrow a registry for their whole lifetime, so it always
/// outlives the code linked against it.
pub struct Registry {
    options: RegistryOptions,
    table: Mutex<HashMap<String, Symbol>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(allow_overwrite: bool) -> Self {
        Self::with_options(RegistryOptions { allow_overwrite })
    }

    pub fn with_options(options: RegistryOptions) -> Self {
        Self {
            options,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> RegistryOptions {
        self.options
    }

    // A poisoned lock still guards a consistent map: every operation is a
    // single insert/remove/get.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Symbol>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `name` to a host address.
    pub fn register(
        &self,
        name: &str,
        kind: SymbolKind,
        address: usize,
        size: Option<usize>,
    ) -> Result<(), RegistryError> {
        validate_name(name)?;

        let symbol = Symbol {
            name: name.to_string(),
            kind,
            address,
            size,
        };

        let mut table = self.lock();
        if !self.options.allow_overwrite && table.contains_key(name) {
            return Err(RegistryError::DuplicateSymbol {
                name: name.to_string(),
            });
        }
        if let Some(previous) = table.insert(name.to_string(), symbol) {
            log::debug!(
                "registry: {} rebound from {:#x} to {:#x}",
                name,
                previous.address,
                address
            );
        } else {
            log::trace!("registry: {} bound to {:#x} ({})", name, address, kind);
        }
        Ok(())
    }

    /// Register a host function by address.
    pub fn register_function(&self, name: &str, address: usize) -> Result<(), RegistryError> {
        self.register(name, SymbolKind::Function, address, None)
    }

    /// Register a host data object.
    ///
    /// The `'static` bound keeps the referent alive for as long as any
    /// compiled code could reach it.
    pub fn register_data<T: ?Sized>(&self, name: &str, data: &'static T) -> Result<(), RegistryError> {
        let address = data as *const T as *const u8 as usize;
        self.register(
            name,
            SymbolKind::Data,
            address,
            Some(std::mem::size_of_val(data)),
        )
    }

    /// Look up a single symbol.
    pub fn lookup(&self, name: &str) -> Result<Symbol, RegistryError> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    /// Remove a binding.
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        match self.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(RegistryError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted names of all bound symbols.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve many names under one lock acquisition.
    ///
    /// Returns the symbols found and, in input order, the names that were
    /// missing.
    pub(crate) fn snapshot<'n, I>(&self, names: I) -> (HashMap<String, Symbol>, Vec<String>)
    where
        I: IntoIterator<Item = &'n str>,
    {
        let table = self.lock();
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for name in names {
            match table.get(name) {
                Some(symbol) => {
                    found.insert(name.to_string(), symbol.clone());
                }
                None => {
                    if !missing.iter().any(|m| m == name) {
                        missing.push(name.to_string());
                    }
                }
            }
        }
        (found, missing)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_options(RegistryOptions::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("options", &self.options)
            .field("symbols", &self.len())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new(false);
        registry
            .register("add", SymbolKind::Function, 0x1000, None)
            .unwrap();

        let symbol = registry.lookup("add").unwrap();
        assert_eq!(symbol.kind, SymbolKind::Function);
        assert_eq!(symbol.address, 0x1000);
        assert_eq!(symbol.size, None);
    }

    #[test]
    fn test_duplicate_rejected_keeps_binding() {
        let registry = Registry::new(false);
        registry.register_function("f", 0x10).unwrap();

        let err = registry.register_function("f", 0x20).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSymbol { name: "f".into() });
        assert_eq!(registry.lookup("f").unwrap().address, 0x10);
    }

    #[test]
    fn test_overwrite_replaces_binding() {
        let registry = Registry::new(true);
        registry.register_function("f", 0x10).unwrap();
        registry
            .register("f", SymbolKind::Data, 0x20, Some(4))
            .unwrap();

        let symbol = registry.lookup("f").unwrap();
        assert_eq!(symbol.address, 0x20);
        assert_eq!(symbol.kind, SymbolKind::Data);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = Registry::default();
        registry.register_function("g", 0x30).unwrap();
        registry.unregister("g").unwrap();

        assert!(!registry.contains("g"));
        assert_eq!(
            registry.unregister("g").unwrap_err(),
            RegistryError::NotFound { name: "g".into() }
        );
        assert!(matches!(
            registry.lookup("g"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_names_do_not_interfere() {
        let registry = Registry::default();
        registry.register_function("a", 1).unwrap();
        registry.register_function("b", 2).unwrap();
        registry.unregister("a").unwrap();

        assert_eq!(registry.lookup("b").unwrap().address, 2);
        assert_eq!(registry.names(), vec!["b".to_string()]);
    }

    #[test]
    fn test_invalid_names() {
        let registry = Registry::default();
        for name in ["", "1abc", "has space", "semi;colon"] {
            assert!(matches!(
                registry.register_function(name, 1),
                Err(RegistryError::InvalidName { .. })
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_data_records_size() {
        static TABLE: [u32; 4] = [1, 2, 3, 4];
        let registry = Registry::default();
        registry.register_data("table", &TABLE).unwrap();

        let symbol = registry.lookup("table").unwrap();
        assert_eq!(symbol.kind, SymbolKind::Data);
        assert_eq!(symbol.size, Some(16));
        assert_eq!(symbol.address, TABLE.as_ptr() as usize);
    }

    #[test]
    fn test_snapshot_reports_missing_in_order() {
        let registry = Registry::default();
        registry.register_function("present", 7).unwrap();

        let (found, missing) = registry.snapshot(["zeta", "present", "alpha", "zeta"]);
        assert_eq!(found["present"].address, 7);
        assert_eq!(missing, vec!["zeta".to_string(), "alpha".to_string()]);
    }
}

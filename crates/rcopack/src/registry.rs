//! # Registry
//!
//! Name tables shared by the encoder and decoder of one codec:
//!
//! - class identifier -> `ClassDef` (custom class hooks)
//! - safety function identifier <-> `Function` (whitelisted by identity)
//!
//! Built once at setup and then shared immutably; nothing here mutates while
//! values are in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::Error;
use crate::types::Result;
use crate::value::Function;
use crate::value::Instance;
use crate::value::Object;
use crate::value::Value;

/// Substitutes the field list written for an instance.
pub type ToFields = Arc<dyn Fn(&Instance) -> Vec<(String, Value)> + Send + Sync>;

/// Builds the final value from a decoded field bag.
pub type FromFields = Arc<dyn Fn(Object) -> Result<Value> + Send + Sync>;

/// How a registered class crosses the wire.
///
/// Without hooks an instance writes its own fields and decodes field by
/// field into a fresh `Instance`.
#[derive(Clone, Default)]
pub struct ClassDef {
    to_fields: Option<ToFields>,
    from_fields: Option<FromFields>,
}

impl ClassDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_to_fields<F>(mut self, f: F) -> Self
    where
        F: Fn(&Instance) -> Vec<(String, Value)> + Send + Sync + 'static,
    {
        self.to_fields = Some(Arc::new(f));
        self
    }

    pub fn with_from_fields<F>(mut self, f: F) -> Self
    where
        F: Fn(Object) -> Result<Value> + Send + Sync + 'static,
    {
        self.from_fields = Some(Arc::new(f));
        self
    }

    pub(crate) fn fields_of(&self, inst: &Instance) -> Vec<(String, Value)> {
        match &self.to_fields {
            Some(hook) => hook(inst),
            None => inst.fields(),
        }
    }

    pub(crate) fn from_fields(&self) -> Option<&FromFields> {
        self.from_fields.as_ref()
    }
}

#[derive(Default)]
pub struct Registry {
    classes: HashMap<String, ClassDef>,
    functions: HashMap<String, Function>,
    function_names: HashMap<usize, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&mut self, name: impl Into<String>, def: ClassDef) -> Result<()> {
        let name = name.into();
        if self.classes.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        self.classes.insert(name, def);
        Ok(())
    }

    /// Whitelists `func` for transmission by name.
    ///
    /// A function may only be registered under one name.
    pub fn register_function(&mut self, name: impl Into<String>, func: Function) -> Result<()> {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        if let Some(existing) = self.function_names.get(&func.id()) {
            return Err(Error::DuplicateName(existing.clone()));
        }
        self.function_names.insert(func.id(), name.clone());
        self.functions.insert(name, func);
        Ok(())
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn function_name(&self, func: &Function) -> Option<&str> {
        self.function_names.get(&func.id()).map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.classes.keys().collect();
        let mut functions: Vec<_> = self.functions.keys().collect();
        classes.sort();
        functions.sort();
        f.debug_struct("Registry")
            .field("classes", &classes)
            .field("functions", &functions)
            .finish()
    }
}

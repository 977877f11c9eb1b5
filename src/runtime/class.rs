use std::collections::HashMap;
use std::rc::Rc;

use crate::lang::value::Value;
use crate::runtime::native::NativeFn;

/// A type object: the method table consulted by INVOKE, GET and SET plus
/// the operator metamethods. Lookup walks the parent chain, so a class only
/// stores the members it defines itself.
///
/// Field accessors take precedence over the `__get`/`__set` metamethod
/// family, letting a host expose properties that shadow generic indexing.
pub struct Class {
    pub name: String,
    pub parent: Option<Rc<Class>>,
    pub methods: HashMap<String, Value>,
    pub field_getters: HashMap<String, Rc<NativeFn>>,
    pub field_setters: HashMap<String, Rc<NativeFn>>,
}

impl Class {
    pub fn new(name: impl Into<String>) -> Self {
        Class {
            name: name.into(),
            parent: None,
            methods: HashMap::new(),
            field_getters: HashMap::new(),
            field_setters: HashMap::new(),
        }
    }

    pub fn with_parent(name: impl Into<String>, parent: Rc<Class>) -> Self {
        Class {
            parent: Some(parent),
            ..Class::new(name)
        }
    }

    pub fn add_method(&mut self, name: impl Into<String>, method: Value) {
        self.methods.insert(name.into(), method);
    }

    pub fn add_native(&mut self, native: NativeFn) {
        self.methods
            .insert(native.name.clone(), Value::Native(Rc::new(native)));
    }

    pub fn add_getter(&mut self, field: impl Into<String>, getter: NativeFn) {
        self.field_getters.insert(field.into(), Rc::new(getter));
    }

    pub fn add_setter(&mut self, field: impl Into<String>, setter: NativeFn) {
        self.field_setters.insert(field.into(), Rc::new(setter));
    }

    /// Method lookup along the parent chain, nearest class first.
    pub fn find_method(&self, name: &str) -> Option<Value> {
        if let Some(m) = self.methods.get(name) {
            return Some(m.clone());
        }
        self.parent.as_ref().and_then(|p| p.find_method(name))
    }

    pub fn find_getter(&self, field: &str) -> Option<Rc<NativeFn>> {
        if let Some(g) = self.field_getters.get(field) {
            return Some(g.clone());
        }
        self.parent.as_ref().and_then(|p| p.find_getter(field))
    }

    pub fn find_setter(&self, field: &str) -> Option<Rc<NativeFn>> {
        if let Some(s) = self.field_setters.get(field) {
            return Some(s.clone());
        }
        self.parent.as_ref().and_then(|p| p.find_setter(field))
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field(
                "parent",
                &self.parent.as_ref().map(|p| p.name.as_str()),
            )
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(name: &str) -> NativeFn {
        NativeFn::new(name, 1, |_, _| Ok(Value::Null))
    }

    #[test]
    fn test_method_found_on_parent() {
        let mut base = Class::new("base");
        base.add_native(native("speak"));
        let derived = Class::with_parent("derived", Rc::new(base));
        assert!(derived.find_method("speak").is_some());
        assert!(derived.find_method("missing").is_none());
    }

    #[test]
    fn test_child_method_shadows_parent() {
        let mut base = Class::new("base");
        base.add_native(native("speak"));
        let mut derived = Class::with_parent("derived", Rc::new(base));
        derived.add_native(NativeFn::new("speak", 1, |_, _| Ok(Value::Num(1.0))));
        let found = derived.find_method("speak");
        match found {
            Some(Value::Native(n)) => assert_eq!(n.param_count, 1),
            other => panic!("expected native, got {:?}", other),
        }
        // the derived entry, not the base one
        let class_method = derived.methods.get("speak");
        assert!(class_method.is_some());
    }

    #[test]
    fn test_getter_lookup_walks_chain() {
        let mut base = Class::new("base");
        base.add_getter("size", native("size"));
        let derived = Class::with_parent("derived", Rc::new(base));
        assert!(derived.find_getter("size").is_some());
        assert!(derived.find_setter("size").is_none());
    }
}

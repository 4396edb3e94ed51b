//! Named bindings of one process.
//!
//! The registry is an ordinary value: a process builds one at startup and
//! passes it (or the bindings it hands out) to whoever needs a transport.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::binding::Binding;
use crate::error::{Result, TransportError};

#[derive(Default)]
pub struct BindingRegistry {
    bindings: RwLock<BTreeMap<String, Arc<Binding>>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding under its own name. Names are unique.
    pub fn register(&self, binding: Arc<Binding>) -> Result<()> {
        let mut bindings = self.bindings.write().expect("unable to lock binding registry");
        if bindings.contains_key(binding.name()) {
            return Err(TransportError::Config(format!(
                "binding '{}' is already registered",
                binding.name()
            )));
        }
        bindings.insert(binding.name().to_string(), binding);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Binding>> {
        self.bindings.read().expect("unable to lock binding registry").get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.read().expect("unable to lock binding registry").keys().cloned().collect()
    }

    pub fn start_all(&self) -> Result<()> {
        for binding in self.bindings.read().expect("unable to lock binding registry").values() {
            binding.start()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for binding in self.bindings.read().expect("unable to lock binding registry").values() {
            binding.wait_for_complete_stop();
        }
    }
}

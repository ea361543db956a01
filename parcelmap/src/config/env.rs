//! Environment variables available to `${VAR}` substitution in config files.

use std::collections::HashMap;

use subst::VariableMap;

/// The process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnv;

impl<'a> VariableMap<'a> for OsEnv {
    type Value = String;

    fn get(&'a self, key: &str) -> Option<Self::Value> {
        std::env::var(key).ok()
    }
}

/// A fixed set of variables, for tests.
#[derive(Debug, Default, Clone)]
pub struct FauxEnv(pub HashMap<&'static str, String>);

impl<'a> VariableMap<'a> for FauxEnv {
    type Value = String;

    fn get(&'a self, key: &str) -> Option<Self::Value> {
        self.0.get(key).cloned()
    }
}

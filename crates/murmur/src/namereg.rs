//! Unique object names.

use std::collections::HashMap;

use thiserror::Error;

/// Longest accepted name, in bytes.
pub const NAME_MAX: usize = 128;

/// How many `.N` suffixes are tried before giving up.
const SUFFIX_MAX: u32 = 99;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("invalid name {0:?}")]
    Invalid(String),

    #[error("name {0:?} is already registered")]
    Taken(String),
}

/// Non-empty, at most [`NAME_MAX`] bytes, no whitespace or control characters.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX
        && !name.chars().any(|c| c.is_control() || c.is_whitespace())
}

/// Maps registered names to object indices.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<String, u32>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` for `index`, returning the name actually assigned.
    ///
    /// On collision, fails if `fail_on_collision`; otherwise tries `name.1`,
    /// `name.2`, ... and takes the first free one.
    pub fn register(
        &mut self,
        name: &str,
        index: u32,
        fail_on_collision: bool,
    ) -> Result<String, NameError> {
        if !is_valid_name(name) {
            return Err(NameError::Invalid(name.to_string()));
        }

        if !self.names.contains_key(name) {
            self.names.insert(name.to_string(), index);
            return Ok(name.to_string());
        }

        if fail_on_collision {
            return Err(NameError::Taken(name.to_string()));
        }

        for n in 1..=SUFFIX_MAX {
            let candidate = format!("{}.{}", name, n);
            if !is_valid_name(&candidate) {
                break;
            }
            if !self.names.contains_key(&candidate) {
                self.names.insert(candidate.clone(), index);
                return Ok(candidate);
            }
        }

        Err(NameError::Taken(name.to_string()))
    }

    pub fn unregister(&mut self, name: &str) -> Option<u32> {
        self.names.remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut reg = NameRegistry::new();
        assert_eq!(reg.register("mic", 0, true).unwrap(), "mic");
        assert_eq!(reg.lookup("mic"), Some(0));
        assert_eq!(reg.unregister("mic"), Some(0));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_collision_suffixes() {
        let mut reg = NameRegistry::new();
        reg.register("mic", 0, false).unwrap();
        assert_eq!(reg.register("mic", 1, false).unwrap(), "mic.1");
        assert_eq!(reg.register("mic", 2, false).unwrap(), "mic.2");

        reg.unregister("mic.1");
        assert_eq!(reg.register("mic", 3, false).unwrap(), "mic.1");
        assert_eq!(reg.lookup("mic.1"), Some(3));
    }

    #[test]
    fn test_collision_fails_when_asked() {
        let mut reg = NameRegistry::new();
        reg.register("mic", 0, true).unwrap();
        assert_eq!(
            reg.register("mic", 1, true),
            Err(NameError::Taken("mic".to_string()))
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_invalid_names() {
        let mut reg = NameRegistry::new();
        let long = "x".repeat(NAME_MAX + 1);
        for bad in ["", "two words", "tab\there", "bell\u{7}", long.as_str()] {
            assert!(matches!(
                reg.register(bad, 0, false),
                Err(NameError::Invalid(_))
            ));
        }
        assert!(reg.register("alsa_input.usb-0d8c.analog-stereo", 0, true).is_ok());
    }

    #[test]
    fn test_suffixes_run_out() {
        let mut reg = NameRegistry::new();
        reg.register("s", 0, false).unwrap();
        for i in 1..=SUFFIX_MAX {
            reg.register("s", i, false).unwrap();
        }
        assert!(matches!(reg.register("s", 500, false), Err(NameError::Taken(_))));
    }
}

use std::fmt;
use std::str::FromStr;

use atomkit_core::{AtomicError, Result};

use crate::atom::AtomicReference;

/// A boolean flag backed by an [`AtomicReference<bool>`].
#[derive(Default)]
pub struct AtomicBoolean {
    atom: AtomicReference<bool>,
}

impl AtomicBoolean {
    pub fn new(value: bool) -> Self {
        Self {
            atom: AtomicReference::new(value),
        }
    }

    pub fn value(&self) -> bool {
        self.atom.peek(|v| *v)
    }

    pub fn is_true(&self) -> bool {
        self.value()
    }

    pub fn is_false(&self) -> bool {
        !self.value()
    }

    /// Returns the new value.
    pub fn make_true(&self) -> bool {
        *self.atom.swap(|_| true)
    }

    /// Returns the new value.
    pub fn make_false(&self) -> bool {
        *self.atom.swap(|_| false)
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        *self.atom.swap(|current| !current)
    }
}

impl From<bool> for AtomicBoolean {
    fn from(value: bool) -> Self {
        Self::new(value)
    }
}

/// Accepts exactly `"true"` or `"false"`.
impl FromStr for AtomicBoolean {
    type Err = AtomicError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "true" => Ok(Self::new(true)),
            "false" => Ok(Self::new(false)),
            other => Err(AtomicError::InvalidValue(format!(
                "expected `true` or `false`, got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Debug for AtomicBoolean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicBoolean").field(&self.value()).finish()
    }
}

//! Process-wide hook for vetting values before they become visible to other
//! threads through an atomic reference.
//!
//! `Send + Sync` bounds already make every stored value safe to share, so the
//! default is to check nothing. Embedders that need stricter rules (for
//! example, refusing values that carry handles to thread-local resources)
//! install a hook once at startup; it cannot be replaced afterwards.

use std::any::Any;

use once_cell::sync::OnceCell;

use crate::error::{AtomicError, Result};

/// What the hook gets to look at.
pub struct ValueInfo<'a> {
    pub type_name: &'static str,
    pub value: &'a dyn Any,
}

pub type ShareHook = Box<dyn Fn(&ValueInfo<'_>) -> std::result::Result<(), String> + Send + Sync>;

static HOOK: OnceCell<ShareHook> = OnceCell::new();

/// Install the process-wide hook. Fails if one is already installed.
///
/// Only the checked entry points consult it: `AtomicReference::try_new` and
/// `AtomicReference::try_swap`. Plain `new` and `swap` never do, and neither
/// do the boolean, latch or pool, whose values are fixed types the hook has
/// no reason to vet. Installing a hook is therefore not a guarantee about
/// every value stored in every atomic reference.
pub fn install_share_hook(hook: ShareHook) -> Result<()> {
    HOOK.set(hook).map_err(|_| AtomicError::HookAlreadyInstalled)
}

pub fn share_hook_installed() -> bool {
    HOOK.get().is_some()
}

/// Run the installed hook against `value`. No-op when nothing is installed.
pub fn check_shareable<T: Any>(value: &T) -> Result<()> {
    let Some(hook) = HOOK.get() else {
        return Ok(());
    };
    let info = ValueInfo {
        type_name: std::any::type_name::<T>(),
        value,
    };
    hook(&info).map_err(AtomicError::ValueRejected)
}

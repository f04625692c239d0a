//! The [`Admission`] trait, hooks, and wire types
//!
//! A consuming program implements [`Admission`] to describe itself: a
//! configuration record and a list of [`Hook`]s, each binding a URL path to
//! an admission handler. The runtime wires everything else.
//!
//! Handlers work on [`kube::core::admission`] types over
//! [`DynamicObject`], so a single hook can serve any resource kind its
//! webhook configuration routes to it.

use std::fmt;
use std::sync::Arc;

use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;

use crate::config::Config;
use crate::error::Error;

/// Function signature for handling admission requests.
///
/// The runtime echoes the request `uid` into whatever response the handler
/// returns, so handlers only need to produce the decision itself (see
/// [`crate::response`] for constructors).
pub type AdmitFn =
    Arc<dyn Fn(&AdmissionRequest<DynamicObject>) -> AdmissionResponse + Send + Sync>;

/// The type of an admission webhook
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookType {
    /// Mutating admission webhook
    Mutating,
    /// Validating admission webhook
    Validating,
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookType::Mutating => write!(f, "mutating"),
            HookType::Validating => write!(f, "validating"),
        }
    }
}

/// A single admission webhook endpoint
#[derive(Clone)]
pub struct Hook {
    /// URL path for this webhook, e.g. `/mutate-pods`
    pub path: String,

    /// Webhook type: mutating or validating
    pub hook_type: HookType,

    /// Handler for admission requests arriving at `path`
    pub admit: AdmitFn,
}

impl Hook {
    /// Create a hook from a path, type, and handler function
    pub fn new(
        path: impl Into<String>,
        hook_type: HookType,
        admit: impl Fn(&AdmissionRequest<DynamicObject>) -> AdmissionResponse
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            hook_type,
            admit: Arc::new(admit),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("path", &self.path)
            .field("hook_type", &self.hook_type)
            .finish_non_exhaustive()
    }
}

/// The main interface consuming programs implement
pub trait Admission {
    /// Server-level configuration. Only `name` is required; everything else
    /// falls back to environment variables and defaults.
    fn configure(&self) -> Config;

    /// All webhook endpoint definitions. At least one is required.
    fn webhooks(&self) -> Vec<Hook>;
}

/// Validate the hook set at startup
pub(crate) fn validate_hooks(hooks: &[Hook]) -> Result<(), Error> {
    if hooks.is_empty() {
        return Err(Error::config("at least one webhook hook is required"));
    }
    let mut seen = std::collections::HashSet::new();
    for hook in hooks {
        if hook.path.is_empty() || !hook.path.starts_with('/') {
            return Err(Error::config(format!(
                "hook path must start with '/': {:?}",
                hook.path
            )));
        }
        if !seen.insert(hook.path.as_str()) {
            return Err(Error::config(format!(
                "duplicate hook path: {}",
                hook.path
            )));
        }
    }
    Ok(())
}

//! Transduction target binding

use crate::effector::Effector;

/// A transduction target: the host object effectors mutate.
///
/// The engine consumes only the target's name (checked against the model)
/// and its effector registry; everything else about the target is the
/// host's business. Targets with no effectors of their own ride on the
/// built-in prefix alone.
pub trait Target {
    /// Name recorded in, and checked against, compiled models.
    fn name(&self) -> &str;

    /// Host effectors, appended to the registry after the built-in prefix
    /// in the order returned here.
    fn effectors(&mut self) -> Vec<Box<dyn Effector<Self>>>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// A target with no host effectors; transductions against it can still
/// select, paste, and emit through the built-ins.
#[derive(Debug, Default, Clone)]
pub struct BaseTarget;

impl Target for BaseTarget {
    fn name(&self) -> &str {
        "BaseTarget"
    }
}

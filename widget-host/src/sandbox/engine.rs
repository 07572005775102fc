//! Seams between the sandbox and whatever executes widget code.
//!
//! The sandbox only ever sees a [`GuestModule`]; the Python engine is one
//! implementation, tests use scripted ones.

use serde_json::Value;

pub use python_sandbox::ExportShape;

use super::view::ViewNode;
use super::SandboxError;
use crate::guard::{ListenerId, Runtime, TimerId};
use crate::protocol::Thrown;

/// A loaded widget module
pub trait GuestModule {
    /// Call the export against the current model state
    fn render(&mut self, rt: &mut dyn Runtime) -> Result<ViewNode, Thrown>;

    /// A timer this module scheduled through `rt` is due
    fn on_timer(&mut self, timer: TimerId, rt: &mut dyn Runtime) -> Result<(), Thrown>;

    /// An event this module listens for was dispatched
    fn on_event(&mut self, listener: ListenerId, payload: &Value, rt: &mut dyn Runtime) -> Result<(), Thrown>;

    /// The instance is gone; drop every callback
    fn release(&mut self) {}
}

/// Why [`ModuleLoader::load`] produced no module
#[derive(Debug, Clone, PartialEq)]
pub enum LoadFailure {
    /// The module body raised
    Thrown(Thrown),
    /// The engine itself could not start; retrying the same code will not help
    Unavailable(String),
}

impl From<Thrown> for LoadFailure {
    fn from(thrown: Thrown) -> Self {
        LoadFailure::Thrown(thrown)
    }
}

/// Turns source into a [`LoadedModule`] by running the module body
pub trait ModuleLoader {
    fn load(
        &self,
        source: &str,
        filename: &str,
        export_name: &str,
        rt: &mut dyn Runtime,
    ) -> Result<LoadedModule, LoadFailure>;
}

/// A module whose body ran, not yet checked against the export contract
pub struct LoadedModule {
    pub shape: ExportShape,
    pub module: Box<dyn GuestModule>,
}

impl LoadedModule {
    pub fn new(shape: ExportShape, module: Box<dyn GuestModule>) -> Self {
        Self { shape, module }
    }

    /// The export must exist and be callable
    pub fn validate(self, export_name: &str) -> Result<ValidModule, SandboxError> {
        match self.shape {
            ExportShape::Callable => Ok(ValidModule { module: self.module }),
            ExportShape::Missing => Err(SandboxError::ExportContract(format!(
                "Widget module must define a callable `{}(model, h, runtime)`; no `{}` was found",
                export_name, export_name
            ))),
            ExportShape::NotCallable(type_name) => Err(SandboxError::ExportContract(format!(
                "Widget module must define a callable `{}(model, h, runtime)`; `{}` is a {}",
                export_name, export_name, type_name
            ))),
        }
    }
}

/// A module that passed the export contract check
pub struct ValidModule {
    module: Box<dyn GuestModule>,
}

impl ValidModule {
    pub fn module_mut(&mut self) -> &mut dyn GuestModule {
        self.module.as_mut()
    }

    pub fn into_inner(self) -> Box<dyn GuestModule> {
        self.module
    }
}

impl std::fmt::Debug for ValidModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidModule").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;

    impl GuestModule for Inert {
        fn render(&mut self, _rt: &mut dyn Runtime) -> Result<ViewNode, Thrown> {
            Ok(ViewNode::Empty)
        }
        fn on_timer(&mut self, _timer: TimerId, _rt: &mut dyn Runtime) -> Result<(), Thrown> {
            Ok(())
        }
        fn on_event(&mut self, _l: ListenerId, _p: &Value, _rt: &mut dyn Runtime) -> Result<(), Thrown> {
            Ok(())
        }
    }

    #[test]
    fn test_export_contract() {
        assert!(LoadedModule::new(ExportShape::Callable, Box::new(Inert))
            .validate("render")
            .is_ok());

        let err = LoadedModule::new(ExportShape::Missing, Box::new(Inert))
            .validate("render")
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExportContract(_)));

        let err = LoadedModule::new(ExportShape::NotCallable("int".to_string()), Box::new(Inert))
            .validate("render")
            .unwrap_err();
        assert!(err.to_string().contains("is a int"));
    }
}

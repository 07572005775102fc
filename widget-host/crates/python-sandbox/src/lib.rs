//! Python Sandbox - widget module execution via RustPython
//!
//! This crate provides the guest side of the widget host:
//! - Uses RustPython for embedded Python execution
//! - Restricts dangerous builtins, imports and introspection
//! - Injects `h`, `model`, `runtime` and `console` into the guest module
//! - Reports every side effect as a queued [`GuestRequest`] instead of
//!   performing it, so the host decides what actually happens

pub mod guard;
pub mod protocol;
pub mod sandbox;

pub use protocol::{CallOutcome, ConsoleLevel, ExportShape, GuestRequest, LoadError, ScriptError};

use rustpython_compiler::Mode;
use rustpython_vm::builtins::{PyDict, PyDictRef};
use rustpython_vm::scope::Scope;
use rustpython_vm::{Interpreter, VirtualMachine};
use sandbox::{create_sandboxed_interpreter, json_to_pyobject, pyobject_to_json, SANDBOX_SETUP_CODE};
use serde_json::{json, Value};

/// A loaded widget module living in its own interpreter.
///
/// One `PyWidget` per load attempt; dropping it drops the interpreter and
/// every callback the guest registered.
pub struct PyWidget {
    interpreter: Interpreter,
    scope: Scope,
}

/// Result of executing a module body
pub struct LoadOutcome {
    pub widget: PyWidget,
    pub shape: ExportShape,
    pub requests: Vec<GuestRequest>,
}

impl std::fmt::Debug for PyWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyWidget").finish_non_exhaustive()
    }
}

impl PyWidget {
    /// Create a fresh interpreter and run the sandbox setup code in it
    fn boot() -> Result<Self, ScriptError> {
        let interpreter = create_sandboxed_interpreter();

        let scope = interpreter.enter(|vm| -> Result<Scope, ScriptError> {
            let scope = vm.new_scope_with_builtins();

            let setup_code = vm
                .compile(SANDBOX_SETUP_CODE, Mode::Exec, "<sandbox_setup>".to_string())
                .map_err(|e| ScriptError {
                    message: format!("Sandbox setup compilation failed: {:?}", e),
                    stack: "No stack trace".to_string(),
                })?;

            vm.run_code_obj(setup_code, scope.clone())
                .map_err(|e| ScriptError {
                    message: format!("Sandbox setup failed: {:?}", e),
                    stack: "No stack trace".to_string(),
                })?;

            let guest = guest_namespace(&scope, vm).map_err(|message| ScriptError {
                message,
                stack: "No stack trace".to_string(),
            })?;
            guard::install(vm, guest).map_err(|e| ScriptError {
                message: format!("Sandbox guard installation failed: {:?}", e),
                stack: "No stack trace".to_string(),
            })?;

            Ok(scope)
        })?;

        Ok(Self { interpreter, scope })
    }

    /// Execute `source` as the widget module and inspect its export.
    ///
    /// Returns `Err` when the sandbox cannot start or the module body raises;
    /// the error carries the Python exception text and traceback.
    pub fn load(source: &str, filename: &str, export_name: &str) -> Result<LoadOutcome, LoadError> {
        let widget = Self::boot().map_err(LoadError::Setup)?;

        if let Some(module) = guard::disallowed_import(source) {
            return Err(LoadError::Module {
                error: ScriptError {
                    message: format!("ImportError: Import '{}' is not allowed in the sandbox", module),
                    stack: format!("  File \"{}\"", filename),
                },
                requests: Vec::new(),
            });
        }

        let outcome = widget.exec_module(source, filename, export_name);

        let (result, requests) = outcome.into_parts();
        match result {
            Ok(descriptor) => {
                let shape = ExportShape::from_descriptor(descriptor.as_str().unwrap_or("missing"));
                Ok(LoadOutcome {
                    widget,
                    shape,
                    requests,
                })
            }
            Err(error) => Err(LoadError::Module { error, requests }),
        }
    }

    /// Run `source` in the guest namespace, then report the export shape.
    ///
    /// The body runs from Rust so no Python-level `exec` ever exists for the
    /// guest to reach.
    fn exec_module(&self, source: &str, filename: &str, export_name: &str) -> CallOutcome {
        let ran = self.interpreter.enter(|vm| -> Result<bool, CallOutcome> {
            let guest = guest_namespace(&self.scope, vm).map_err(CallOutcome::host_error)?;
            let code = vm
                .compile(source, Mode::Exec, filename.to_string())
                .map_err(|e| CallOutcome {
                    ok: false,
                    value: Value::Null,
                    error: Some(ScriptError {
                        message: format!("SyntaxError: {}", e),
                        stack: format!("  File \"{}\"", filename),
                    }),
                    requests: Vec::new(),
                })?;

            match vm.run_code_obj(code, Scope::with_builtins(None, guest, vm)) {
                Ok(_) => Ok(true),
                Err(exc) => {
                    self.scope
                        .globals
                        .set_item("__exc__", exc.into(), vm)
                        .map_err(|e| CallOutcome::host_error(format!("Failed to bind module error: {:?}", e)))?;
                    Ok(false)
                }
            }
        });

        match ran {
            Ok(true) => self.call("_loaded(__export_name__)", &[("__export_name__", json!(export_name))]),
            Ok(false) => self.call("_failed(__exc__)", &[]),
            Err(outcome) => outcome,
        }
    }

    /// Call the export as `render(model=, h=, runtime=)` against `state`
    pub fn render(&self, state: &Value) -> CallOutcome {
        self.call("_render(__state__)", &[("__state__", state.clone())])
    }

    /// Invoke a callback the guest registered earlier.
    ///
    /// `keep` leaves the callback registered (intervals, listeners); otherwise
    /// it is consumed. Unknown ids succeed with no requests.
    pub fn fire(&self, callback_id: u64, payload: Option<&Value>, state: &Value, keep: bool) -> CallOutcome {
        self.call(
            "_fire(__callback_id__, __payload__, __state__, __keep__)",
            &[
                ("__callback_id__", json!(callback_id)),
                ("__payload__", payload.cloned().unwrap_or(Value::Null)),
                ("__state__", state.clone()),
                ("__keep__", json!(keep)),
            ],
        )
    }

    /// Drop callbacks the host will never fire
    pub fn forget(&self, callback_ids: &[u64]) {
        if callback_ids.is_empty() {
            return;
        }
        let _ = self.call("_forget(__ids__)", &[("__ids__", json!(callback_ids))]);
    }

    /// Bind host values as globals, then evaluate one glue expression
    fn call(&self, expr: &str, args: &[(&str, Value)]) -> CallOutcome {
        self.interpreter.enter(|vm| {
            for (name, value) in args {
                let py_value = match json_to_pyobject(value, vm) {
                    Ok(v) => v,
                    Err(e) => return CallOutcome::host_error(format!("Failed to convert '{}': {:?}", name, e)),
                };
                if let Err(e) = self.scope.globals.set_item(*name, py_value, vm) {
                    return CallOutcome::host_error(format!("Failed to bind '{}': {:?}", name, e));
                }
            }

            let code = match vm.compile(expr, Mode::Eval, "<host_call>".to_string()) {
                Ok(code) => code,
                Err(e) => return CallOutcome::host_error(format!("Host call compilation failed: {:?}", e)),
            };

            match vm.run_code_obj(code, self.scope.clone()) {
                Ok(result) => match pyobject_to_json(&result, vm) {
                    Ok(value) if value.is_null() => CallOutcome {
                        ok: true,
                        value: Value::Null,
                        error: None,
                        requests: Vec::new(),
                    },
                    Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                        CallOutcome::host_error(format!("Malformed call outcome: {}", e))
                    }),
                    Err(e) => CallOutcome::host_error(format!("Failed to read call outcome: {:?}", e)),
                },
                Err(exc) => CallOutcome::host_error(format!("{:?}", exc)),
            }
        })
    }
}

fn guest_namespace(scope: &Scope, vm: &VirtualMachine) -> Result<PyDictRef, String> {
    scope
        .globals
        .get_item("_module_ns", vm)
        .map_err(|e| format!("Guest namespace missing: {:?}", e))?
        .downcast::<PyDict>()
        .map_err(|_| "Guest namespace is not a dict".to_string())
}

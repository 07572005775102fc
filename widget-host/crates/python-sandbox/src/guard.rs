//! Native guards between guest code and the interpreter.
//!
//! Guest code runs in the `_module_ns` namespace. Anything written in Python
//! can be reached from the guest through function globals, so the import
//! whitelist and attribute checks live here instead: they decide by looking
//! at the calling frame, which the guest cannot forge.

use rustpython_ast::Visitor;
use rustpython_compiler::parser::ast;
use rustpython_compiler::Parse;
use rustpython_vm::builtins::{PyDictRef, PyModule, PyStr};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, VirtualMachine};

/// Top-level modules guest code may import
pub const ALLOWED_MODULES: &[&str] = &[
    "math",
    "json",
    "random",
    "re",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "operator",
    "string",
    "textwrap",
    "copy",
    "types",
    "typing",
    "abc",
    "numbers",
    "decimal",
    "fractions",
    "statistics",
    "colorsys",
    "bisect",
    "heapq",
    "html",
    "dataclasses",
    "enum",
];

/// Attributes guest code may not look up by name
pub const HIDDEN_ATTRIBUTES: &[&str] = &[
    "__globals__",
    "__builtins__",
    "__subclasses__",
    "__closure__",
    "__code__",
    "__loader__",
    "__spec__",
    "__self__",
    "__func__",
    "f_globals",
    "f_builtins",
    "f_locals",
    "f_back",
    "tb_frame",
    "gi_frame",
    "cr_frame",
    "ag_frame",
];

pub fn is_allowed(module: &str) -> bool {
    let root = module.split('.').next().unwrap_or(module);
    ALLOWED_MODULES.contains(&root)
}

/// First module a plain `import` statement in `source` pulls in that the
/// whitelist does not cover.
///
/// `import x` of a module already in `sys.modules` never reaches
/// `__import__`, so these are checked before the body runs. Source that does
/// not parse returns `None` and fails at compile time instead.
pub fn disallowed_import(source: &str) -> Option<String> {
    let suite = ast::Suite::parse(source, "<widget>").ok()?;
    let mut finder = ImportFinder::default();
    for stmt in suite {
        finder.visit_stmt(stmt);
    }
    finder.rejected
}

#[derive(Default)]
struct ImportFinder {
    rejected: Option<String>,
}

impl ImportFinder {
    fn note(&mut self, module: &str) {
        if self.rejected.is_none() && !is_allowed(module) {
            self.rejected = Some(module.to_string());
        }
    }
}

impl Visitor for ImportFinder {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in &node.names {
            self.note(alias.name.as_str());
        }
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        match &node.module {
            Some(module) => self.note(module.as_str()),
            None => self.note("."),
        }
    }
}

fn called_from_guest(vm: &VirtualMachine, guest: &PyDictRef) -> bool {
    vm.current_frame()
        .map(|frame| frame.globals.is(guest))
        .unwrap_or(false)
}

fn arg(args: &FuncArgs, index: usize, name: &str) -> Option<PyObjectRef> {
    args.args.get(index).cloned().or_else(|| args.kwargs.get(name).cloned())
}

fn import_error(vm: &VirtualMachine, name: &str) -> rustpython_vm::builtins::PyBaseExceptionRef {
    vm.new_import_error(
        format!("Import '{}' is not allowed in the sandbox", name),
        vm.ctx.new_str(name),
    )
}

/// Replace `__import__`, `getattr` and `operator.attrgetter` with versions
/// that apply the guest rules when called from `guest`.
///
/// Must run after the setup code, which imports freely.
pub fn install(vm: &VirtualMachine, guest: PyDictRef) -> PyResult<()> {
    let original_import = vm.builtins.get_attr("__import__", vm)?;
    let import_guest = guest.clone();
    let import = vm.new_function("__import__", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        if !called_from_guest(vm, &import_guest) {
            return original_import.call(args, vm);
        }

        let name = match arg(&args, 0, "name") {
            Some(name) => name.str(vm)?.as_str().to_string(),
            None => return Err(vm.new_type_error("__import__() missing required argument 'name'".to_string())),
        };
        let relative = match arg(&args, 4, "level") {
            Some(level) => !vm.is_none(&level) && level.try_to_value::<i64>(vm)? > 0,
            None => false,
        };
        if relative || !is_allowed(&name) {
            return Err(import_error(vm, &name));
        }

        let fromlist = arg(&args, 3, "fromlist");
        let module = original_import.call(args, vm)?;

        // `from random import _os` hands out a module the whitelist never saw
        if let Some(fromlist) = fromlist.filter(|list| !vm.is_none(list)) {
            for item in vm.extract_elements_with(&fromlist, Ok)? {
                let attr = item.str(vm)?;
                if attr.as_str() == "*" {
                    continue;
                }
                let Some(value) = vm.get_attribute_opt(module.clone(), &attr)? else {
                    continue;
                };
                if value.payload::<PyModule>().is_some() {
                    let sub_name = value.get_attr("__name__", vm)?.str(vm)?.as_str().to_string();
                    if !is_allowed(&sub_name) {
                        return Err(import_error(vm, &sub_name));
                    }
                }
            }
        }
        Ok(module)
    });
    vm.builtins.set_attr("__import__", import, vm)?;

    let original_getattr = vm.builtins.get_attr("getattr", vm)?;
    let getattr_guest = guest.clone();
    let getattr = vm.new_function("getattr", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        if called_from_guest(vm, &getattr_guest) {
            if let Some(name) = args.args.get(1).and_then(|n| n.payload::<PyStr>()) {
                if HIDDEN_ATTRIBUTES.contains(&name.as_str()) {
                    return Err(vm.new_attribute_error(format!("'{}' is not available in the sandbox", name.as_str())));
                }
            }
        }
        original_getattr.call(args, vm)
    });
    vm.builtins.set_attr("getattr", getattr, vm)?;

    let operator = vm.import("operator", 0)?;
    let original_attrgetter = operator.get_attr("attrgetter", vm)?;
    let attrgetter = vm.new_function("attrgetter", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        if called_from_guest(vm, &guest) {
            for name in &args.args {
                if let Some(path) = name.payload::<PyStr>() {
                    if let Some(hidden) = path.as_str().split('.').find(|part| HIDDEN_ATTRIBUTES.contains(part)) {
                        return Err(vm.new_attribute_error(format!("'{}' is not available in the sandbox", hidden)));
                    }
                }
            }
        }
        original_attrgetter.call(args, vm)
    });
    operator.set_attr("attrgetter", attrgetter, vm)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_imports_are_checked() {
        assert_eq!(disallowed_import("import math, json\n"), None);
        assert_eq!(disallowed_import("import os\n"), Some("os".to_string()));
        assert_eq!(
            disallowed_import("def render(model, h, runtime):\n    import sys\n    return None\n"),
            Some("sys".to_string())
        );
        assert_eq!(disallowed_import("from os.path import join\n"), Some("os.path".to_string()));
        assert_eq!(disallowed_import("from . import sibling\n"), Some(".".to_string()));
    }

    #[test]
    fn test_imports_in_strings_are_ignored() {
        assert_eq!(disallowed_import("NOTE = '''\nimport os\n'''\n"), None);
    }

    #[test]
    fn test_whitelist_uses_top_level_name() {
        assert!(is_allowed("json.decoder"));
        assert!(!is_allowed("jsonx"));
        assert!(!is_allowed("importlib"));
    }
}

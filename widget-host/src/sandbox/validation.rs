//! Source policy applied before any widget code is loaded.
//!
//! The host injects its rendering primitives; widget code that imports them
//! itself would end up with a second, unguarded copy. Widget code also has no
//! business walking interpreter internals (function globals, frames, class
//! hierarchies), which is how a guest climbs out of the restricted builtins.
//! Both checks walk the parsed module, so text inside string literals and
//! comments never trips them. Source that does not parse passes here and
//! fails at load instead.

use rustpython_ast::Visitor;
use rustpython_parser::{ast, Parse};
use tracing::warn;

use super::SandboxError;

/// Attributes that lead from an ordinary object back to interpreter state
const BLOCKED_ATTRIBUTES: &[&str] = &[
    "__globals__",
    "__builtins__",
    "__subclasses__",
    "__class__",
    "__bases__",
    "__base__",
    "__mro__",
    "__closure__",
    "__code__",
    "__dict__",
    "__getattribute__",
    "__self__",
    "__func__",
    "__loader__",
    "__spec__",
    "__traceback__",
    "__import__",
    "__reduce__",
    "__reduce_ex__",
    "gi_frame",
    "gi_code",
    "cr_frame",
    "ag_frame",
    "tb_frame",
    "f_globals",
    "f_locals",
    "f_builtins",
    "f_back",
    "f_code",
    "co_code",
];

/// Modules that allowed stdlib modules re-export as attributes (`random._os`)
const BLOCKED_MODULE_ATTRIBUTES: &[&str] = &[
    "sys",
    "_sys",
    "os",
    "_os",
    "posix",
    "nt",
    "builtins",
    "importlib",
    "_imp",
    "_frozen_importlib",
    "_io",
    "io",
    "subprocess",
    "inspect",
];

const BLOCKED_NAMES: &[&str] = &["__builtins__", "__import__", "__loader__", "__spec__"];

#[derive(Debug, Clone)]
pub struct ImportPolicy {
    forbidden: Vec<String>,
}

impl ImportPolicy {
    pub fn new<S: AsRef<str>>(forbidden: &[S]) -> Self {
        Self {
            forbidden: forbidden.iter().map(|m| m.as_ref().to_string()).collect(),
        }
    }

    pub fn forbidden(&self) -> &[String] {
        &self.forbidden
    }

    /// Every top-level module `code` imports, in source order
    pub fn imported_modules(code: &str) -> Vec<String> {
        match scan(code) {
            Some(scan) => scan.imports.into_iter().map(|(_, name)| name).collect(),
            None => Vec::new(),
        }
    }

    /// Reject code importing a forbidden module or reaching for interpreter internals
    pub fn check(&self, code: &str) -> Result<(), SandboxError> {
        let Some(scan) = scan(code) else {
            return Ok(());
        };

        let hit = scan
            .imports
            .iter()
            .map(|(_, module)| module)
            .find(|module| self.forbidden.iter().any(|f| f == *module));
        if let Some(module) = hit {
            warn!(module = %module, "Rejected widget code importing host module");
            return Err(SandboxError::ImportRejected(format!(
                "Widget code must not import '{}'. Use the `h`, `model` and `runtime` arguments passed to render() instead.",
                module
            )));
        }

        if let Some((_, name)) = scan.violations.first() {
            warn!(name = %name, "Rejected widget code touching interpreter internals");
            return Err(SandboxError::ForbiddenAccess(format!(
                "Widget code must not use '{}'. Only the `h`, `model` and `runtime` arguments passed to render() are available.",
                name
            )));
        }

        Ok(())
    }
}

#[derive(Default)]
struct SourceScan {
    imports: Vec<(usize, String)>,
    violations: Vec<(usize, String)>,
}

fn scan(code: &str) -> Option<SourceScan> {
    let suite = ast::Suite::parse(code, "<widget>").ok()?;
    let mut scan = SourceScan::default();
    for stmt in suite {
        scan.visit_stmt(stmt);
    }
    scan.imports.sort_by_key(|(pos, _)| *pos);
    scan.violations.sort_by_key(|(pos, _)| *pos);
    Some(scan)
}

impl Visitor for SourceScan {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in &node.names {
            self.imports
                .push((usize::from(alias.range.start()), root_module(alias.name.as_str())));
        }
        self.generic_visit_stmt_import(node);
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        // relative imports have no module of their own to check
        if let Some(module) = &node.module {
            self.imports
                .push((usize::from(node.range.start()), root_module(module.as_str())));
        }
        for alias in &node.names {
            let name = alias.name.as_str();
            if BLOCKED_ATTRIBUTES.contains(&name) || BLOCKED_MODULE_ATTRIBUTES.contains(&name) {
                self.violations
                    .push((usize::from(alias.range.start()), name.to_string()));
            }
        }
        self.generic_visit_stmt_import_from(node);
    }

    fn visit_expr_call(&mut self, node: ast::ExprCall) {
        let dynamic = match node.func.as_ref() {
            ast::Expr::Name(name) => name.id.as_str() == "__import__",
            ast::Expr::Attribute(attr) => attr.attr.as_str() == "import_module",
            _ => false,
        };
        if dynamic {
            if let Some(ast::Expr::Constant(ast::ExprConstant {
                value: ast::Constant::Str(module),
                range,
                ..
            })) = node.args.first()
            {
                self.imports.push((usize::from(range.start()), root_module(module)));
            }
        }
        self.generic_visit_expr_call(node);
    }

    fn visit_expr_attribute(&mut self, node: ast::ExprAttribute) {
        let attr = node.attr.as_str();
        // chained lookups share a start, so order by where the name ends
        if BLOCKED_ATTRIBUTES.contains(&attr) || BLOCKED_MODULE_ATTRIBUTES.contains(&attr) {
            self.violations
                .push((usize::from(node.range.end()), attr.to_string()));
        }
        self.generic_visit_expr_attribute(node);
    }

    fn visit_expr_name(&mut self, node: ast::ExprName) {
        if BLOCKED_NAMES.contains(&node.id.as_str()) {
            self.violations
                .push((usize::from(node.range.start()), node.id.as_str().to_string()));
        }
        self.generic_visit_expr_name(node);
    }

    // `getattr(h, "__globals__")` spells the attribute as a string
    fn visit_expr_constant(&mut self, node: ast::ExprConstant) {
        if let ast::Constant::Str(text) = &node.value {
            if BLOCKED_ATTRIBUTES.contains(&text.as_str()) {
                self.violations
                    .push((usize::from(node.range.start()), text.clone()));
            }
        }
        self.generic_visit_expr_constant(node);
    }
}

fn root_module(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_string()
}

//! Source clean-up before a widget module is loaded.
//!
//! Generated code arrives with markdown fences, CRLF line endings, tabs,
//! stray `await`s and sometimes no indentation at all. Rewrites only run on
//! source the interpreter would reject, and a rewrite chain is kept only
//! once the result parses. Positions come from the lexer or the AST, so
//! string literals and comments are never edited.

use regex::Regex;
use rustpython_ast::Visitor;
use rustpython_parser::lexer::lex;
use rustpython_parser::{ast, Mode, Parse, Tok};
use tracing::debug;

lazy_static::lazy_static! {
    static ref FENCED: Regex = Regex::new(r"(?s)```[\w+-]*[ \t]*\r?\n(.*?)```").expect("static regex");
    static ref BLOCK_STARTER: Regex = Regex::new(
        r"^\s*(for\s+.+:|while\s+.+:|if\s+.+:|elif\s+.+:|else\s*:|def\s+.+:|class\s+.+:|try\s*:|except.*:|finally\s*:|with\s+.+:)\s*(#.*)?$"
    ).expect("static regex");
    static ref DEDENT_BEFORE: Regex =
        Regex::new(r"^\s*(elif\s+.+:|else\s*:|except.*:|finally\s*:)\s*(#.*)?$").expect("static regex");
    static ref BLOCK_ENDER: Regex =
        Regex::new(r"^\s*(return\b|break\b|continue\b|raise\b|pass\b)").expect("static regex");
}

/// Outcome of [`SourceTransform::apply`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedSource {
    pub code: String,
    /// Names of the steps that changed something
    pub applied: Vec<&'static str>,
    /// Parser message when the final code still does not parse
    pub syntax_error: Option<String>,
}

type Rewrite = fn(&str) -> Option<String>;

/// Syntax repairs tried in order on a working copy
const SYNTAX_REPAIRS: [(&str, Rewrite); 3] = [
    ("normalize_line_endings", normalize_line_endings),
    ("expand_indent_tabs", expand_indent_tabs),
    ("fix_indentation", reindent_flat_code),
];

#[derive(Debug, Clone, Default)]
pub struct SourceTransform;

impl SourceTransform {
    pub fn new() -> Self {
        Self
    }

    pub fn apply(&self, source: &str) -> TransformedSource {
        let mut applied = Vec::new();

        let mut code = match strip_markdown_fence(source) {
            Some(inner) => {
                applied.push("strip_fence");
                inner
            }
            None => source.to_string(),
        };

        let mut syntax_error = check_syntax(&code).err();
        if syntax_error.is_some() {
            if let Some((repaired, steps)) = repair_syntax(&code) {
                code = repaired;
                applied.extend(steps);
                syntax_error = None;
            }
        }

        // `await` outside a coroutine parses but fails to compile
        if syntax_error.is_none() {
            if let Some(stripped) = strip_stray_awaits(&code) {
                if check_syntax(&stripped).is_ok() {
                    applied.push("strip_await");
                    code = stripped;
                }
            }
        }

        if !applied.is_empty() {
            debug!(steps = ?applied, "Transformed widget source");
        }

        TransformedSource {
            code,
            applied,
            syntax_error,
        }
    }
}

/// Contents of the first fenced block, when the source is wrapped in one
fn strip_markdown_fence(source: &str) -> Option<String> {
    if !source.trim_start().starts_with("```") {
        return None;
    }
    FENCED
        .captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn check_syntax(code: &str) -> Result<(), String> {
    ast::Suite::parse(code, "<widget>")
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Run the repairs cumulatively and return the first result that parses
fn repair_syntax(code: &str) -> Option<(String, Vec<&'static str>)> {
    let mut working = code.to_string();
    let mut steps = Vec::new();

    for (name, rewrite) in SYNTAX_REPAIRS {
        let Some(next) = rewrite(&working) else {
            continue;
        };
        if next == working {
            continue;
        }
        working = next;
        steps.push(name);

        match check_syntax(&working) {
            Ok(()) => return Some((working, steps)),
            Err(e) => debug!(step = name, "Source still fails to parse: {}", e),
        }
    }
    None
}

fn normalize_line_endings(code: &str) -> Option<String> {
    if !code.contains('\r') {
        return None;
    }
    Some(code.replace("\r\n", "\n").replace('\r', "\n"))
}

/// Byte ranges of string tokens, up to the first lexical error
fn string_spans(code: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    for token in lex(code, Mode::Module) {
        match token {
            Ok((Tok::String { .. }, range)) => {
                spans.push((usize::from(range.start()), usize::from(range.end())))
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    spans
}

/// Turn tabs in leading indentation into four spaces. Lines that start
/// inside a multi-line string are left alone.
fn expand_indent_tabs(code: &str) -> Option<String> {
    if !code.contains('\t') {
        return None;
    }
    let spans = string_spans(code);
    let mut out = String::with_capacity(code.len());
    let mut offset = 0;

    for line in code.split_inclusive('\n') {
        let in_string = spans.iter().any(|&(start, end)| start < offset && offset < end);
        let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
        if in_string || !line[..indent].contains('\t') {
            out.push_str(line);
        } else {
            out.push_str(&line[..indent].replace('\t', "    "));
            out.push_str(&line[indent..]);
        }
        offset += line.len();
    }
    Some(out)
}

/// Only code with no indentation at all is re-indented
fn reindent_flat_code(code: &str) -> Option<String> {
    let lines: Vec<String> = code.lines().map(|l| l.to_string()).collect();
    if lines.iter().any(|l| l.starts_with([' ', '\t'])) {
        return None;
    }
    let mut fixed = fix_indentation(&lines).join("\n");
    if code.ends_with('\n') {
        fixed.push('\n');
    }
    Some(fixed)
}

/// Start offsets of `await` expressions outside any coroutine
#[derive(Default)]
struct StrayAwaits {
    /// One entry per enclosing function, true for `async def`
    scopes: Vec<bool>,
    found: Vec<usize>,
}

impl Visitor for StrayAwaits {
    fn visit_stmt_function_def(&mut self, node: ast::StmtFunctionDef) {
        self.scopes.push(false);
        self.generic_visit_stmt_function_def(node);
        self.scopes.pop();
    }

    fn visit_stmt_async_function_def(&mut self, node: ast::StmtAsyncFunctionDef) {
        self.scopes.push(true);
        self.generic_visit_stmt_async_function_def(node);
        self.scopes.pop();
    }

    fn visit_expr_lambda(&mut self, node: ast::ExprLambda) {
        self.scopes.push(false);
        self.generic_visit_expr_lambda(node);
        self.scopes.pop();
    }

    fn visit_expr_await(&mut self, node: ast::ExprAwait) {
        if self.scopes.last() != Some(&true) {
            self.found.push(usize::from(node.range.start()));
        }
        self.generic_visit_expr_await(node);
    }
}

/// Remove `await` keywords the compiler would reject. `None` when there are none.
fn strip_stray_awaits(code: &str) -> Option<String> {
    let suite = ast::Suite::parse(code, "<widget>").ok()?;
    let mut finder = StrayAwaits::default();
    for stmt in suite {
        finder.visit_stmt(stmt);
    }
    if finder.found.is_empty() {
        return None;
    }

    let mut out = code.to_string();
    finder.found.sort_unstable();
    for start in finder.found.into_iter().rev() {
        let Some(rest) = out.get(start..) else {
            continue;
        };
        let Some(after) = rest.strip_prefix("await") else {
            continue;
        };
        let gap = after.len() - after.trim_start_matches([' ', '\t']).len();
        out.replace_range(start..start + "await".len() + gap, "");
    }
    Some(out)
}

/// Re-indent code that lost all of its indentation.
///
/// Tracks block depth from block-starting lines (`def`, `if`, `for`, ...)
/// and drops a level after `return`, `break`, `continue`, `raise` or `pass`.
fn fix_indentation(lines: &[String]) -> Vec<String> {
    let mut result = Vec::with_capacity(lines.len());
    let mut stack: Vec<usize> = vec![0];

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            result.push(String::new());
            continue;
        }

        if DEDENT_BEFORE.is_match(trimmed) && stack.len() > 1 {
            stack.pop();
        }
        let level = stack.last().copied().unwrap_or(0);

        result.push(format!("{}{}", "    ".repeat(level), trimmed));

        if BLOCK_STARTER.is_match(trimmed) {
            stack.push(level + 1);
        } else if BLOCK_ENDER.is_match(trimmed) && stack.len() > 1 {
            let next_continues = lines
                .get(i + 1)
                .map(|next| DEDENT_BEFORE.is_match(next.trim()))
                .unwrap_or(false);
            if !next_continues {
                stack.pop();
            }
        }
    }

    result
}

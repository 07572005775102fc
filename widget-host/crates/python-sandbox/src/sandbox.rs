//! Sandboxed RustPython VM configuration
//!
//! This module creates a restricted Python environment that:
//! - Removes dangerous builtins (open, eval, exec, compile, etc.)
//! - Leaves import and attribute checks to [`crate::guard`], installed once
//!   this setup has run
//! - Injects the `h`, `model`, `runtime` and `console` primitives
//! - Queues every side effect the guest asks for instead of performing it

use rustpython_vm::builtins::{PyDict, PyFloat, PyInt, PyList, PyStr};
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyResult, Settings, VirtualMachine};
use serde_json::Value;

/// `__name__` of the namespace guest code runs in
pub const GUEST_MODULE_NAME: &str = "widget";

/// Create a sandboxed Python interpreter
pub fn create_sandboxed_interpreter() -> Interpreter {
    let mut settings = Settings::default();
    settings.isolated = true;
    settings.user_site_directory = false;
    settings.import_site = false;

    Interpreter::with_init(settings, |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
    })
}

/// Convert a Python object to JSON Value
pub fn pyobject_to_json(obj: &PyObjectRef, vm: &VirtualMachine) -> PyResult<Value> {
    if obj.is(&vm.ctx.none) {
        return Ok(Value::Null);
    }

    // bool is a subclass of int, so it has to be checked first
    if obj.class().is(vm.ctx.types.bool_type) {
        if let Ok(b) = obj.clone().try_to_value::<bool>(vm) {
            return Ok(Value::Bool(b));
        }
    }

    if let Some(i) = obj.downcast_ref::<PyInt>() {
        if let Ok(n) = i.try_to_primitive::<i64>(vm) {
            return Ok(Value::Number(n.into()));
        }
    }

    if let Some(f) = obj.downcast_ref::<PyFloat>() {
        if let Some(n) = serde_json::Number::from_f64(f.to_f64()) {
            return Ok(Value::Number(n));
        }
        return Ok(Value::Null);
    }

    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Ok(Value::String(s.as_str().to_string()));
    }

    if let Some(list) = obj.downcast_ref::<PyList>() {
        let items: Result<Vec<Value>, _> = list
            .borrow_vec()
            .iter()
            .map(|item| pyobject_to_json(item, vm))
            .collect();
        return Ok(Value::Array(items?));
    }

    if let Some(dict) = obj.downcast_ref::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (k, v) in dict {
            let key_str: String = k.str(vm)?.to_string();
            map.insert(key_str, pyobject_to_json(&v, vm)?);
        }
        return Ok(Value::Object(map));
    }

    // Tuples, sets and custom objects degrade to their string form
    let s: String = obj.str(vm)?.to_string();
    Ok(Value::String(s))
}

/// Convert a JSON Value to Python object
pub fn json_to_pyobject(value: &Value, vm: &VirtualMachine) -> PyResult {
    match value {
        Value::Null => Ok(vm.ctx.none()),
        Value::Bool(b) => Ok(vm.ctx.new_bool(*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vm.ctx.new_int(i).into())
            } else if let Some(f) = n.as_f64() {
                Ok(vm.ctx.new_float(f).into())
            } else {
                Ok(vm.ctx.none())
            }
        }
        Value::String(s) => Ok(vm.ctx.new_str(s.clone()).into()),
        Value::Array(arr) => {
            let items: Result<Vec<_>, _> = arr.iter().map(|v| json_to_pyobject(v, vm)).collect();
            Ok(vm.ctx.new_list(items?).into())
        }
        Value::Object(obj) => {
            let dict = vm.ctx.new_dict();
            for (k, v) in obj {
                let py_value = json_to_pyobject(v, vm)?;
                dict.set_item(k.as_str(), py_value, vm)?;
            }
            Ok(dict.into())
        }
    }
}

/// Setup code run once per interpreter before the guest module is loaded.
///
/// Defines the injected primitives and the `_loaded` / `_failed` / `_render` /
/// `_fire` / `_forget` entry points the host evaluates. The module body
/// itself is compiled and run from Rust against `_module_ns`. Everything the guest does to
/// the outside world lands in `_queue` and is drained into the call outcome.
pub const SANDBOX_SETUP_CODE: &str = r#"
import builtins

_callable = builtins.callable
_USER_MODULE = "widget"
_module_ns = {"__name__": _USER_MODULE, "__builtins__": builtins}
_export = [None]
_queue = []
_callbacks = {}
_next_id = [0]


def _take():
    items = list(_queue)
    del _queue[:]
    return items


def _text(args, sep=" "):
    return sep.join([str(a) for a in args])


class _Console:
    def log(self, *args):
        _queue.append({"kind": "log", "level": "info", "message": _text(args)})

    def info(self, *args):
        self.log(*args)

    def debug(self, *args):
        self.log(*args)

    def warn(self, *args):
        _queue.append({"kind": "log", "level": "warn", "message": _text(args)})

    def warning(self, *args):
        self.warn(*args)

    def error(self, *args):
        _queue.append({"kind": "log", "level": "error", "message": _text(args)})


console = _Console()


def _print(*args, sep=" ", end="\n", file=None, flush=False):
    _queue.append({"kind": "log", "level": "info", "message": _text(args, sep)})


def _register(callback):
    if not _callable(callback):
        raise TypeError("callback must be callable")
    _next_id[0] += 1
    _callbacks[_next_id[0]] = callback
    return _next_id[0]


class _Runtime:
    def __init__(self):
        self.console = console

    def set_timeout(self, callback, ms=0):
        cb_id = _register(callback)
        _queue.append({"kind": "set_timeout", "id": cb_id, "delay_ms": max(0, int(ms))})
        return cb_id

    def set_interval(self, callback, ms):
        cb_id = _register(callback)
        _queue.append({"kind": "set_interval", "id": cb_id, "delay_ms": max(1, int(ms))})
        return cb_id

    def request_frame(self, callback):
        cb_id = _register(callback)
        _queue.append({"kind": "request_frame", "id": cb_id})
        return cb_id

    def clear_timeout(self, cb_id):
        if _callbacks.pop(cb_id, None) is not None:
            _queue.append({"kind": "clear_timer", "id": cb_id})

    def clear_interval(self, cb_id):
        self.clear_timeout(cb_id)

    def cancel_frame(self, cb_id):
        self.clear_timeout(cb_id)

    def add_listener(self, event, callback):
        cb_id = _register(callback)
        _queue.append({"kind": "add_listener", "id": cb_id, "event": str(event)})
        return cb_id

    def remove_listener(self, cb_id):
        if _callbacks.pop(cb_id, None) is not None:
            _queue.append({"kind": "remove_listener", "id": cb_id})

    def log(self, *args):
        console.log(*args)


runtime = _Runtime()


class _Model:
    def __init__(self):
        self._state = {}

    def get(self, field, default=None):
        return self._state.get(field, default)

    def set(self, field, value):
        self._state[field] = value
        _queue.append({"kind": "model_set", "field": str(field), "value": value})

    def save_changes(self):
        _queue.append({"kind": "save_changes"})

    def on(self, event, callback):
        return runtime.add_listener(event, callback)

    def off(self, cb_id):
        runtime.remove_listener(cb_id)


model = _Model()


def _flatten(children, out):
    for child in children:
        if child is None or child is True or child is False:
            continue
        if isinstance(child, (list, tuple)):
            _flatten(child, out)
        elif isinstance(child, dict):
            out.append(child)
        else:
            out.append(str(child))
    return out


def h(tag, props=None, *children):
    clean = {}
    if props:
        for key in props:
            value = props[key]
            if not _callable(value):
                clean[str(key)] = value
    return {"tag": str(tag), "props": clean, "children": _flatten(children, [])}


_module_ns.update({"h": h, "model": model, "runtime": runtime, "console": console})


def _describe(exc):
    name = type(exc).__name__
    text = str(exc)
    message = name + ": " + text if text else name
    frames = []
    tb = getattr(exc, "__traceback__", None)
    while tb is not None:
        code = getattr(getattr(tb, "tb_frame", None), "f_code", None)
        frames.append('  File "%s", line %s, in %s' % (
            getattr(code, "co_filename", "?"),
            getattr(tb, "tb_lineno", "?"),
            getattr(code, "co_name", "?"),
        ))
        tb = getattr(tb, "tb_next", None)
    if frames:
        stack = "Traceback (most recent call last):\n" + "\n".join(frames)
    else:
        stack = "No stack trace"
    return {"message": message, "stack": stack}


def _wrap(thunk):
    try:
        value = thunk()
        return {"ok": True, "value": value, "requests": _take()}
    except BaseException as exc:
        return {"ok": False, "error": _describe(exc), "requests": _take()}


def _export_shape(name):
    if name not in _module_ns:
        return "missing"
    value = _module_ns[name]
    if _callable(value):
        return "callable"
    return "not_callable:" + type(value).__name__


def _loaded(export_name):
    shape = _export_shape(export_name)
    if shape == "callable":
        _export[0] = _module_ns[export_name]
    return {"ok": True, "value": shape, "requests": _take()}


def _failed(exc):
    return {"ok": False, "error": _describe(exc), "requests": _take()}


def _render(state):
    model._state = dict(state)
    return _wrap(lambda: _export[0](model=model, h=h, runtime=runtime))


def _fire(cb_id, payload, state, keep):
    model._state = dict(state)
    if keep:
        callback = _callbacks.get(cb_id)
    else:
        callback = _callbacks.pop(cb_id, None)
    if callback is None:
        return {"ok": True, "value": None, "requests": _take()}
    if payload is None:
        return _wrap(lambda: callback())
    return _wrap(lambda: callback(payload))


def _forget(ids):
    for cb_id in ids:
        _callbacks.pop(cb_id, None)
    return None


builtins.print = _print

_blocked = ['open', 'eval', 'exec', 'compile', 'input', 'breakpoint',
            'globals', 'locals', 'vars', 'memoryview', 'exit', 'quit']
for _name in _blocked:
    if hasattr(builtins, _name):
        delattr(builtins, _name)

del _blocked, _name
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip_through_vm() {
        let interpreter = create_sandboxed_interpreter();
        let value = serde_json::json!({
            "flag": true,
            "count": 3,
            "ratio": 0.5,
            "items": ["a", null],
        });

        let back = interpreter.enter(|vm| {
            let obj = json_to_pyobject(&value, vm).unwrap();
            pyobject_to_json(&obj, vm).unwrap()
        });

        assert_eq!(back, value);
    }

    #[test]
    fn test_setup_code_defines_guest_namespace() {
        assert!(SANDBOX_SETUP_CODE.contains(&format!("_USER_MODULE = \"{}\"", GUEST_MODULE_NAME)));
    }
}

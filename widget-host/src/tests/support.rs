//! Scripted widget engine for host tests.
//!
//! A script is widget source made of `# key value` comment lines, so it
//! passes the import policy and the syntax check untouched:
//!
//! ```text
//! # text hello            render a div with this text and the `ticks` field
//! # load_error ValueError: x   the module body raises
//! # unavailable reason    the engine cannot start
//! # export missing        no export / `# export int` for a non-callable one
//! # render_error msg      every render raises
//! # render_error_after 2 msg   renders after the second raise
//! # interval 10           register an interval on the first live render
//! # timeout 10            register a timeout on the first live render
//! # timer_error msg       timer callbacks raise
//! # listen change:count   register a listener on the first live render
//! # log message           log while the module body runs
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::guard::{ListenerId, Runtime, TimerId};
use crate::protocol::{LogLevel, Thrown};
use crate::sandbox::{ExportShape, GuestModule, LoadFailure, LoadedModule, ModuleLoader, ViewNode};

#[derive(Debug, Default)]
pub struct Stats {
    pub loads: usize,
    pub releases: usize,
    pub events: Vec<Value>,
    pub timers_fired: usize,
}

#[derive(Debug, Clone, Default)]
struct Script {
    text: String,
    load_error: Option<String>,
    unavailable: Option<String>,
    export: Option<String>,
    render_error: Option<String>,
    render_error_after: Option<(u32, String)>,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    timer_error: Option<String>,
    listen: Option<String>,
    log: Option<String>,
}

impl Script {
    fn parse(source: &str) -> Self {
        let mut script = Script::default();
        for line in source.lines() {
            let Some(rest) = line.trim().strip_prefix('#') else {
                continue;
            };
            let rest = rest.trim();
            let (key, value) = rest.split_once(' ').unwrap_or((rest, ""));
            let value = value.trim().to_string();
            match key {
                "text" => script.text = value,
                "load_error" => script.load_error = Some(value),
                "unavailable" => script.unavailable = Some(value),
                "export" => script.export = Some(value),
                "render_error" => script.render_error = Some(value),
                "render_error_after" => {
                    let (count, message) = value.split_once(' ').unwrap_or((value.as_str(), "boom"));
                    script.render_error_after = Some((count.parse().unwrap_or(1), message.to_string()));
                }
                "interval" => script.interval_ms = value.parse().ok(),
                "timeout" => script.timeout_ms = value.parse().ok(),
                "timer_error" => script.timer_error = Some(value),
                "listen" => script.listen = Some(value),
                "log" => script.log = Some(value),
                _ => {}
            }
        }
        script
    }
}

/// Loader whose modules follow their script. Clones share [`Stats`].
#[derive(Clone, Default)]
pub struct ScriptedLoader {
    stats: Rc<RefCell<Stats>>,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> usize {
        self.stats.borrow().loads
    }

    pub fn releases(&self) -> usize {
        self.stats.borrow().releases
    }

    pub fn events(&self) -> Vec<Value> {
        self.stats.borrow().events.clone()
    }

    pub fn timers_fired(&self) -> usize {
        self.stats.borrow().timers_fired
    }
}

impl ModuleLoader for ScriptedLoader {
    fn load(
        &self,
        source: &str,
        _filename: &str,
        _export_name: &str,
        rt: &mut dyn Runtime,
    ) -> Result<LoadedModule, LoadFailure> {
        let script = Script::parse(source);
        if let Some(reason) = &script.unavailable {
            return Err(LoadFailure::Unavailable(reason.clone()));
        }
        self.stats.borrow_mut().loads += 1;

        if let Some(message) = &script.log {
            rt.log(LogLevel::Info, message);
        }
        if let Some(message) = &script.load_error {
            return Err(LoadFailure::Thrown(Thrown::with_stack(
                message.clone(),
                "  File \"<widget>\", line 1, in <module>",
            )));
        }

        let shape = match script.export.as_deref() {
            None => ExportShape::Callable,
            Some("missing") => ExportShape::Missing,
            Some(other) => ExportShape::NotCallable(other.to_string()),
        };
        let module = ScriptedModule {
            script,
            stats: Rc::clone(&self.stats),
            renders: 0,
            interval: None,
            timeout: None,
            listener: None,
        };
        Ok(LoadedModule::new(shape, Box::new(module)))
    }
}

struct ScriptedModule {
    script: Script,
    stats: Rc<RefCell<Stats>>,
    renders: u32,
    interval: Option<TimerId>,
    timeout: Option<TimerId>,
    listener: Option<ListenerId>,
}

impl GuestModule for ScriptedModule {
    fn render(&mut self, rt: &mut dyn Runtime) -> Result<ViewNode, Thrown> {
        self.renders += 1;
        if let Some(message) = &self.script.render_error {
            return Err(Thrown::with_stack(message.clone(), "  File \"<widget>\", in render"));
        }
        if let Some((after, message)) = &self.script.render_error_after {
            if self.renders > *after {
                return Err(Thrown::with_stack(message.clone(), "  File \"<widget>\", in render"));
            }
        }

        if self.interval.is_none() {
            if let Some(ms) = self.script.interval_ms {
                self.interval = rt.set_interval(Duration::from_millis(ms));
            }
        }
        if self.timeout.is_none() {
            if let Some(ms) = self.script.timeout_ms {
                self.timeout = rt.set_timeout(Duration::from_millis(ms));
            }
        }
        if self.listener.is_none() {
            if let Some(event) = &self.script.listen {
                self.listener = rt.add_listener(event);
            }
        }

        let ticks = rt.model_get("ticks").as_u64().unwrap_or(0);
        Ok(ViewNode::element(
            "div",
            vec![ViewNode::text(format!("{} {}", self.script.text, ticks))],
        ))
    }

    fn on_timer(&mut self, _timer: TimerId, rt: &mut dyn Runtime) -> Result<(), Thrown> {
        self.stats.borrow_mut().timers_fired += 1;
        if let Some(message) = &self.script.timer_error {
            return Err(Thrown::with_stack(message.clone(), "  File \"<widget>\", in tick"));
        }
        let ticks = rt.model_get("ticks").as_u64().unwrap_or(0) + 1;
        rt.log(LogLevel::Info, &format!("tick {}", ticks));
        rt.model_set("ticks", Value::from(ticks))?;
        rt.save_changes()
    }

    fn on_event(&mut self, _listener: ListenerId, payload: &Value, _rt: &mut dyn Runtime) -> Result<(), Thrown> {
        self.stats.borrow_mut().events.push(payload.clone());
        Ok(())
    }

    fn release(&mut self) {
        self.stats.borrow_mut().releases += 1;
    }
}

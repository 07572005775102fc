use serde::Serialize;
use serde_json::{Map, Value};

/// View tree returned by a widget's render function
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ViewNode {
    Empty,
    Text {
        text: String,
    },
    Element {
        tag: String,
        props: Map<String, Value>,
        children: Vec<ViewNode>,
    },
    Fragment {
        children: Vec<ViewNode>,
    },
}

impl ViewNode {
    pub fn text(text: impl Into<String>) -> Self {
        ViewNode::Text { text: text.into() }
    }

    pub fn element(tag: impl Into<String>, children: Vec<ViewNode>) -> Self {
        ViewNode::Element {
            tag: tag.into(),
            props: Map::new(),
            children,
        }
    }

    /// Interpret whatever the guest returned.
    ///
    /// Objects with a `tag` are elements; lists are fragments; scalars are
    /// text; anything else is shown as its JSON text.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => ViewNode::Empty,
            Value::String(s) => ViewNode::text(s.clone()),
            Value::Bool(_) | Value::Number(_) => ViewNode::text(value.to_string()),
            Value::Array(items) => ViewNode::Fragment {
                children: items.iter().map(ViewNode::from_value).collect(),
            },
            Value::Object(obj) => match obj.get("tag").and_then(Value::as_str) {
                Some(tag) => ViewNode::Element {
                    tag: tag.to_string(),
                    props: obj
                        .get("props")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                    children: match obj.get("children") {
                        Some(Value::Array(items)) => items.iter().map(ViewNode::from_value).collect(),
                        Some(Value::Null) | None => Vec::new(),
                        Some(other) => vec![ViewNode::from_value(other)],
                    },
                },
                None => ViewNode::text(value.to_string()),
            },
        }
    }

    /// Concatenated text content, depth first
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            ViewNode::Empty => {}
            ViewNode::Text { text } => out.push_str(text),
            ViewNode::Element { children, .. } | ViewNode::Fragment { children } => {
                for child in children {
                    child.collect_text(out);
                }
            }
        }
    }
}

/// Where a render lands. The probe container is thrown away after one use.
#[derive(Debug, Clone, Default)]
pub struct Container {
    content: Option<ViewNode>,
    renders: u64,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, node: ViewNode) {
        self.content = Some(node);
        self.renders += 1;
    }

    pub fn clear(&mut self) {
        self.content = None;
    }

    pub fn content(&self) -> Option<&ViewNode> {
        self.content.as_ref()
    }

    pub fn render_count(&self) -> u64 {
        self.renders
    }
}

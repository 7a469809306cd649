//! `{{path}}` command templates.
//!
//! Placeholders use the same dotted-path semantics as the filter language;
//! unresolved paths expand to the empty string. There is no escaping — the
//! expanded command goes to the shell verbatim.

use metarelay_core::{resolve_event_path, Event};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                return Err(format!(
                    "invalid template '{source}': unterminated '{{{{' placeholder"
                ));
            };
            let path = after_open[..close].trim();
            if path.is_empty() {
                return Err(format!("invalid template '{source}': empty placeholder"));
            }
            segments.push(Segment::Placeholder(path.to_string()));
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn expand(&self, event: &Event) -> String {
        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Placeholder(path) => {
                    output.push_str(&resolve_event_path(event, path));
                }
            }
        }
        output
    }
}

/// One-shot expansion for a command string already validated at load time.
/// A template that fails to parse here (which load-time validation rules
/// out) is passed through unexpanded.
pub fn expand_command(command: &str, event: &Event) -> String {
    match Template::parse(command) {
        Ok(template) => template.expand(event),
        Err(_) => command.to_string(),
    }
}

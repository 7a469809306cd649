//! Routes events to handler configurations.

use std::collections::HashSet;

use metarelay_core::models::KNOWN_EVENT_TYPES;
use metarelay_core::{ConfigError, Event, HandlerConfig};

use crate::filter::Filter;
use crate::template::Template;

struct CompiledHandler {
    config: HandlerConfig,
    filters: Vec<Filter>,
}

/// Immutable registry of validated handlers, in declaration order.
pub struct HandlerRegistry {
    handlers: Vec<CompiledHandler>,
}

impl HandlerRegistry {
    /// Compiles and validates every handler. All problems — duplicate
    /// names, unknown event types, bad filters or templates, zero
    /// timeouts — are load errors; matching never fails afterwards.
    pub fn load(configs: Vec<HandlerConfig>) -> Result<Self, ConfigError> {
        let mut seen_names = HashSet::new();
        let mut handlers = Vec::with_capacity(configs.len());

        for config in configs {
            if config.name.trim().is_empty() {
                return Err(ConfigError::Invalid("handler name cannot be empty".into()));
            }
            if !seen_names.insert(config.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate handler name '{}'",
                    config.name
                )));
            }
            if !KNOWN_EVENT_TYPES.contains(&config.event_type.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "handler '{}' has unknown event type '{}'",
                    config.name, config.event_type
                )));
            }
            if config.timeout_seconds == 0 {
                return Err(ConfigError::Invalid(format!(
                    "handler '{}' timeout must be greater than 0",
                    config.name
                )));
            }
            Template::parse(&config.command).map_err(|error| {
                ConfigError::Invalid(format!("handler '{}': {error}", config.name))
            })?;
            let filters = config
                .filters
                .iter()
                .map(|expr| {
                    Filter::parse(expr).map_err(|error| {
                        ConfigError::Invalid(format!("handler '{}': {error}", config.name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            handlers.push(CompiledHandler { config, filters });
        }

        Ok(Self { handlers })
    }

    /// Enabled handlers whose `(event_type, action)` matches the event —
    /// an empty configured action is a wildcard — and whose filters all
    /// pass. Declaration order is dispatch order.
    pub fn match_event(&self, event: &Event) -> Vec<&HandlerConfig> {
        self.handlers
            .iter()
            .filter(|handler| handler.config.enabled)
            .filter(|handler| handler.config.event_type == event.event_type)
            .filter(|handler| {
                handler.config.action.is_empty() || handler.config.action == event.action
            })
            .filter(|handler| handler.filters.iter().all(|filter| filter.matches(event)))
            .map(|handler| &handler.config)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

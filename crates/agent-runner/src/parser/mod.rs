//! Output parsers for different agent types

use crate::event::{AgentEvent, OutputStream};
use crate::process::AgentType;

pub mod claude;

/// Trait for parsing agent output
pub trait OutputParser: Send + Sync {
    /// Parse one line of output into an event
    fn parse(&mut self, line: &str, stream: OutputStream) -> AgentEvent;
}

/// Create a parser for the given agent type
pub fn create_parser(agent_type: AgentType) -> Box<dyn OutputParser> {
    match agent_type {
        AgentType::ClaudeCode => Box::new(claude::ClaudeStreamParser::new()),
        _ => Box::new(DefaultParser),
    }
}

/// A default parser that just returns raw output
pub struct DefaultParser;

impl OutputParser for DefaultParser {
    fn parse(&mut self, line: &str, stream: OutputStream) -> AgentEvent {
        AgentEvent::RawOutput {
            stream,
            content: line.to_string(),
        }
    }
}

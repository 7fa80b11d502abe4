//! Template variables for prompts and task documents
//!
//! Variables are written `{{NAME}}` and matched case-insensitively. Unknown
//! names are left in place.

use chrono::{DateTime, Local};

/// Prompt used when the caller does not supply one
pub const DEFAULT_PROMPT: &str = "You are working through the task document at {{DOCUMENT_PATH}}.

Find the first unchecked task (`- [ ]`) in that document and complete it. When the work
is done, mark exactly that task as checked (`- [x]`) in the document and save it. If the
task reveals follow-up work, add it as new unchecked tasks below it. Do not check off
tasks you did not complete.

Working directory: {{CWD}}
Loop: {{LOOP_NUMBER}}";

/// Values available to a template
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub agent_name: String,
    pub agent_path: String,
    pub agent_session_id: Option<String>,
    pub document_name: String,
    pub document_path: String,
    pub autorun_folder: String,
    /// One-based loop number
    pub loop_number: u32,
    pub git_branch: Option<String>,
    pub cwd: String,
}

impl TemplateContext {
    fn lookup(&self, name: &str, now: &DateTime<Local>) -> Option<String> {
        let value = match name {
            "AGENT_NAME" => self.agent_name.clone(),
            "AGENT_PATH" => self.agent_path.clone(),
            "AGENT_SESSION_ID" => self.agent_session_id.clone().unwrap_or_default(),
            "DOCUMENT_NAME" => self.document_name.clone(),
            "DOCUMENT_PATH" => self.document_path.clone(),
            "AUTORUN_FOLDER" => self.autorun_folder.clone(),
            "LOOP_NUMBER" => self.loop_number.to_string(),
            "DATE" => now.format("%Y-%m-%d").to_string(),
            "TIME" => now.format("%H:%M:%S").to_string(),
            "DATETIME" => now.format("%Y-%m-%d %H:%M:%S").to_string(),
            "TIMESTAMP" => now.timestamp_millis().to_string(),
            "GIT_BRANCH" => self.git_branch.clone().unwrap_or_default(),
            "CWD" => self.cwd.clone(),
            _ => return None,
        };
        Some(value)
    }
}

/// Replace every known `{{NAME}}` in `template`
pub fn substitute(template: &str, context: &TemplateContext) -> String {
    substitute_at(template, context, &Local::now())
}

fn substitute_at(template: &str, context: &TemplateContext, now: &DateTime<Local>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            output.push_str(&rest[open..]);
            return output;
        };

        let name = after_open[..close].trim().to_ascii_uppercase();
        match context.lookup(&name, now) {
            Some(value) => output.push_str(&value),
            None => output.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }

    output.push_str(rest);
    output
}

/// Build the prompt for one task, falling back to [`DEFAULT_PROMPT`]
pub fn build_prompt(template: &str, context: &TemplateContext) -> String {
    if template.trim().is_empty() {
        substitute(DEFAULT_PROMPT, context)
    } else {
        substitute(template, context)
    }
}

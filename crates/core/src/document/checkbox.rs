//! Markdown checkbox parsing
//!
//! A task line is a list item (`-`, `*`, `+` or `1.` / `1)`) whose content
//! starts with a checkbox: `[ ]` is open, `[x]`, `[X]`, `[✓]` and `[✔]` are
//! done. Everything that is not the checkbox mark is left untouched when
//! rewriting a document.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Task counts of a document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub checked: u32,
    pub unchecked: u32,
}

impl TaskCounts {
    pub fn total(&self) -> u32 {
        self.checked + self.unchecked
    }

    pub fn is_done(&self) -> bool {
        self.unchecked == 0
    }
}

/// A parsed task line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLine<'a> {
    pub checked: bool,
    /// Task text after the checkbox, trimmed
    pub text: &'a str,
    /// Byte range of the mark between the brackets
    mark: Range<usize>,
}

const CHECKED_MARKS: [char; 4] = ['x', 'X', '✓', '✔'];

/// Parse one line (without its line terminator)
pub fn parse_task_line(line: &str) -> Option<TaskLine<'_>> {
    let indent = line.len() - line.trim_start().len();
    let rest = &line[indent..];

    let marker_len = list_marker_len(rest)?;
    let after_marker = &rest[marker_len..];
    let spaces = after_marker.len() - after_marker.trim_start_matches([' ', '\t']).len();
    if spaces == 0 {
        return None;
    }

    let box_start = indent + marker_len + spaces;
    let boxed = line[box_start..].strip_prefix('[')?;
    let mark = boxed.chars().next()?;
    let checked = if mark == ' ' {
        false
    } else if CHECKED_MARKS.contains(&mark) {
        true
    } else {
        return None;
    };
    let after_mark = &boxed[mark.len_utf8()..];
    let text = after_mark.strip_prefix(']')?;

    let mark_start = box_start + 1;
    Some(TaskLine {
        checked,
        text: text.trim(),
        mark: mark_start..mark_start + mark.len_utf8(),
    })
}

/// Length of a bullet or ordered-list marker at the start of `s`
fn list_marker_len(s: &str) -> Option<usize> {
    if s.starts_with(['-', '*', '+']) {
        return Some(1);
    }
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || digits > 9 {
        return None;
    }
    match s.as_bytes().get(digits) {
        Some(b'.') | Some(b')') => Some(digits + 1),
        _ => None,
    }
}

fn task_lines(content: &str) -> impl Iterator<Item = TaskLine<'_>> {
    content.lines().filter_map(parse_task_line)
}

pub fn count_tasks(content: &str) -> TaskCounts {
    task_lines(content).fold(TaskCounts::default(), |mut counts, task| {
        if task.checked {
            counts.checked += 1;
        } else {
            counts.unchecked += 1;
        }
        counts
    })
}

pub fn count_unchecked(content: &str) -> u32 {
    count_tasks(content).unchecked
}

/// Text of the first open task
pub fn first_unchecked_task(content: &str) -> Option<String> {
    task_lines(content)
        .find(|task| !task.checked)
        .map(|task| task.text.to_string())
}

pub fn unchecked_tasks(content: &str) -> Vec<String> {
    task_lines(content)
        .filter(|task| !task.checked)
        .map(|task| task.text.to_string())
        .collect()
}

/// Uncheck every task, keeping all other bytes (line endings included)
pub fn uncheck_all(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        match parse_task_line(body) {
            Some(task) if task.checked => {
                out.push_str(&line[..task.mark.start]);
                out.push(' ');
                out.push_str(&line[task.mark.end..]);
            }
            _ => out.push_str(line),
        }
    }
    out
}

//! Structured issues attached to responses and abort signals.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known issue codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueCode {
    Default,
    Unexpected,
    Overloaded,
    PreconditionFailed,
    TemporarilyUnavailable,
    ShardProgramSizeExceeded,
    ResolveFailed,
}

/// A message with an optional code and nested sub-issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub code: IssueCode,
    pub message: String,
    pub sub_issues: Vec<Issue>,
}

impl Issue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: IssueCode::Default,
            message: message.into(),
            sub_issues: Vec::new(),
        }
    }

    pub fn with_code(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sub_issues: Vec::new(),
        }
    }

    pub fn add_sub_issue(&mut self, issue: Issue) {
        self.sub_issues.push(issue);
    }

    fn write_one_line(&self, out: &mut String) {
        out.push_str(&self.message);
        if !self.sub_issues.is_empty() {
            out.push_str(" { ");
            for (i, sub) in self.sub_issues.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                sub.write_one_line(out);
            }
            out.push_str(" }");
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_one_line(&mut out);
        f.write_str(&out)
    }
}

/// Ordered list of issues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issues(pub Vec<Issue>);

impl Issues {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn single(issue: Issue) -> Self {
        Self(vec![issue])
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self::single(Issue::new(message))
    }

    pub fn push(&mut self, issue: Issue) {
        self.0.push(issue);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Issue> {
        self.0.iter()
    }

    /// Renders every issue (with nesting) on a single line for logs.
    pub fn to_one_line_string(&self) -> String {
        let mut out = String::new();
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                out.push_str("; ");
            }
            issue.write_one_line(&mut out);
        }
        out
    }
}

impl IntoIterator for Issues {
    type Item = Issue;
    type IntoIter = std::vec::IntoIter<Issue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Issue> for Issues {
    fn from(issue: Issue) -> Self {
        Issues::single(issue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_rendering_includes_sub_issues() {
        let mut top = Issue::with_code(IssueCode::Unexpected, "Internal error");
        top.add_sub_issue(Issue::new("node 3 lost"));
        top.add_sub_issue(Issue::new("retry exhausted"));
        let issues = Issues(vec![top, Issue::new("second")]);
        assert_eq!(
            issues.to_one_line_string(),
            "Internal error { node 3 lost, retry exhausted }; second"
        );
    }
}

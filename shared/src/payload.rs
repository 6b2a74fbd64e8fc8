//! Keypress command payloads
//!
//! Every step of a sequence is sent as a `CiscoIPPhoneExecute` document:
//! ```text
//! <CiscoIPPhoneExecute>
//!   <ExecuteItem Priority="0" URL="Key:Settings"/>
//! </CiscoIPPhoneExecute>
//! ```

use std::sync::Arc;

/// Build the execute document for one keypress URL
pub fn execute_item(url: &str) -> String {
    format!(
        "<CiscoIPPhoneExecute>\n  <ExecuteItem Priority=\"0\" URL=\"{}\"/>\n</CiscoIPPhoneExecute>\n",
        escape_attr(url)
    )
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            c => out.push(c),
        }
    }
    out
}

/// Ordered, immutable list of payloads shared by every phone in a run.
///
/// Cloning is cheap; all clones point at the same payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSequence {
    payloads: Arc<[String]>,
}

impl CommandSequence {
    /// Build a sequence from keypress URLs, one payload per step
    pub fn from_steps<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let payloads: Vec<String> = steps
            .into_iter()
            .map(|step| execute_item(step.as_ref()))
            .collect();
        Self {
            payloads: payloads.into(),
        }
    }

    /// Wrap already-encoded payloads
    pub fn from_payloads(payloads: Vec<String>) -> Self {
        Self {
            payloads: payloads.into(),
        }
    }

    pub fn payloads(&self) -> &[String] {
        &self.payloads
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

use serde::{Deserialize, Serialize};

/// Operator request asking the hub to run `command` on one agent.
///
/// `command` is forwarded untouched as the payload of the agent-bound
/// `command` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorCommand {
    pub client_id: String,
    pub command: serde_json::Value,
}

/// Shell output as reported by an agent.
///
/// Agents in the field disagree on field names and some send several
/// spellings at once. Deserialization picks one of each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireShellOutputReport")]
pub struct ShellOutputReport {
    pub output: Option<String>,
    pub success: Option<bool>,
    pub exit_code: Option<i32>,
}

/// Every spelling of a shell output report seen on the wire.
///
/// `stdout` beats `output` beats `result`, and `exit_code` beats
/// `exitCode`; an empty string gives way to a later non-empty one.
#[derive(Debug, Deserialize)]
struct WireShellOutputReport {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default, rename = "exitCode")]
    exit_code_camel: Option<i32>,
}

impl From<WireShellOutputReport> for ShellOutputReport {
    fn from(wire: WireShellOutputReport) -> Self {
        let spellings = [wire.stdout, wire.output, wire.result];
        let output = spellings
            .iter()
            .flatten()
            .find(|s| !s.is_empty())
            .or_else(|| spellings.iter().flatten().next())
            .cloned();
        Self {
            output,
            success: wire.success,
            exit_code: wire.exit_code.or(wire.exit_code_camel),
        }
    }
}

impl ShellOutputReport {
    /// Returns `true` if the report carries anything worth forwarding.
    pub fn has_content(&self) -> bool {
        self.output.is_some() || self.exit_code.is_some()
    }
}

/// Shell output forwarded to operator consoles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub client_id: String,
    /// Raw output, ANSI sequences included.
    pub output: String,
    /// Output with ANSI colour and cursor sequences removed.
    pub clean_output: String,
    pub success: bool,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn from_report(client_id: impl Into<String>, report: ShellOutputReport) -> Self {
        let output = report.output.unwrap_or_default();
        let exit_code = report.exit_code.unwrap_or(0);
        Self {
            client_id: client_id.into(),
            clean_output: strip_ansi(&output),
            output,
            success: report.success.unwrap_or(exit_code == 0),
            exit_code,
        }
    }
}

/// Pushed to operators whenever an agent comes online or goes offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStatusChange {
    pub client_id: String,
    pub online: bool,
}

/// One entry of a [`ClientList`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    /// RFC 3339 timestamp.
    pub connected_at: String,
}

/// Reply to `list_clients`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientList {
    pub clients: Vec<ClientSummary>,
}

/// Removes ANSI colour and cursor sequences (`ESC [ <digits/;> m|G|K|H`).
///
/// Any other escape sequence is left untouched.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('\x1b') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match ansi_sequence_len(tail) {
            Some(len) => rest = &tail[len..],
            None => {
                out.push('\x1b');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Length of the recognised sequence at the start of `s`, which begins with ESC.
fn ansi_sequence_len(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.get(1) != Some(&b'[') {
        return None;
    }
    let params = bytes[2..]
        .iter()
        .take_while(|b| b.is_ascii_digit() || **b == b';')
        .count();
    match bytes.get(2 + params) {
        Some(b'm' | b'G' | b'K' | b'H') => Some(3 + params),
        _ => None,
    }
}

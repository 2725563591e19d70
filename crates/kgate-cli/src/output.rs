//! Terminal rendering of kernel output envelopes.

use kgate_core::OutputEnvelope;
use serde_json::Value;

/// Terminal stream a piece of output belongs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Stdout,
    Stderr,
}

/// Text to print for `envelope`, or `None` for bookkeeping messages.
pub fn render(envelope: &OutputEnvelope) -> Option<(Target, String)> {
    let content = &envelope.content;
    match envelope.msg_type.as_str() {
        "stream" => {
            let text = content["text"].as_str()?.to_owned();
            let target = if content["name"] == "stderr" {
                Target::Stderr
            } else {
                Target::Stdout
            };
            Some((target, text))
        }
        "execute_result" | "display_data" => {
            let text = content.pointer("/data/text~1plain")?.as_str()?;
            Some((Target::Stdout, format!("{text}\n")))
        }
        "error" => Some((Target::Stderr, error_text(content))),
        _ => None,
    }
}

fn error_text(content: &Value) -> String {
    let traceback: Vec<&str> = content["traceback"]
        .as_array()
        .map(|lines| lines.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if traceback.is_empty() {
        format!(
            "{}: {}\n",
            content["ename"].as_str().unwrap_or("Error"),
            content["evalue"].as_str().unwrap_or_default()
        )
    } else {
        format!("{}\n", traceback.join("\n"))
    }
}

/// Print `envelope` if it carries visible output.
pub fn print(envelope: &OutputEnvelope) {
    match render(envelope) {
        Some((Target::Stdout, text)) => print!("{text}"),
        Some((Target::Stderr, text)) => eprint!("{text}"),
        None => {}
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tools::{FunctionCall, ToolCall};

/// One streamed fragment of a tool call. Empty fields mean "not present in this chunk".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCallDelta {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.name.is_empty() && self.arguments.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    parts: Vec<ToolCallDelta>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, delta: ToolCallDelta) {
        update_partial_tool_call(&mut self.parts, delta);
    }

    pub fn extend<I>(&mut self, deltas: I)
    where
        I: IntoIterator<Item = ToolCallDelta>,
    {
        for delta in deltas {
            self.update(delta);
        }
    }

    pub fn finalize(self) -> Vec<ToolCall> {
        finalize_tool_calls(self.parts)
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Merge one fragment into the calls seen so far.
///
/// A known id selects its entry. An unseen id is adopted by the most recent
/// entry while that entry has no id yet, otherwise it opens a new call. A
/// fragment without an id goes to the most recent entry unless it names a
/// different tool than that entry already has. Ids and names are fixed once
/// set; argument text is only ever appended.
pub fn update_partial_tool_call(parts: &mut Vec<ToolCallDelta>, delta: ToolCallDelta) {
    if delta.is_empty() {
        return;
    }

    let index = if !delta.id.is_empty() {
        if let Some(position) = parts.iter().position(|part| part.id == delta.id) {
            Some(position)
        } else {
            match parts.last() {
                Some(last) if last.id.is_empty() && names_compatible(last, &delta) => {
                    Some(parts.len() - 1)
                }
                _ => None,
            }
        }
    } else {
        match parts.last() {
            Some(last) if names_compatible(last, &delta) => Some(parts.len() - 1),
            _ => None,
        }
    };

    match index {
        Some(index) => {
            let part = &mut parts[index];
            if part.id.is_empty() {
                part.id = delta.id;
            }
            if part.name.is_empty() {
                part.name = delta.name;
            }
            part.arguments.push_str(&delta.arguments);
        }
        None => parts.push(delta),
    }
}

fn names_compatible(part: &ToolCallDelta, delta: &ToolCallDelta) -> bool {
    delta.name.is_empty() || part.name.is_empty() || part.name == delta.name
}

pub fn finalize_tool_calls(parts: Vec<ToolCallDelta>) -> Vec<ToolCall> {
    parts
        .into_iter()
        .filter(|part| !part.name.trim().is_empty())
        .map(|part| ToolCall {
            id: if part.id.is_empty() {
                format!("call_{}", Uuid::new_v4())
            } else {
                part.id
            },
            tool_type: "function".to_string(),
            function: FunctionCall {
                name: part.name,
                arguments: part.arguments,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(id: &str, name: &str, arguments: &str) -> ToolCallDelta {
        ToolCallDelta::new(id, name, arguments)
    }

    #[test]
    fn accumulator_merges_partial_arguments() {
        let mut accumulator = ToolCallAccumulator::new();

        accumulator.update(delta("call_1", "bash", "{\"command\": \""));
        accumulator.update(delta("call_1", "", "echo hello"));
        accumulator.update(delta("call_1", "", "\"}"));

        let calls = accumulator.finalize();

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "bash");
        assert_eq!(calls[0].function.arguments, "{\"command\": \"echo hello\"}");
    }

    #[test]
    fn late_id_is_adopted_by_open_entry() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.update(delta("", "foo", "{\"a\":"));
        accumulator.update(delta("c1", "", "1}"));

        let calls = accumulator.finalize();

        assert_eq!(calls, vec![ToolCall::new("c1", "foo", "{\"a\":1}")]);
    }

    #[test]
    fn new_id_after_identified_entry_opens_second_call() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.extend(vec![
            delta("call_1", "kubectl", "{\"command\":\"get pods\"}"),
            delta("call_2", "bash", "{\"command\":"),
            delta("", "", "\"ls\"}"),
        ]);

        let calls = accumulator.finalize();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, "{\"command\":\"get pods\"}");
        assert_eq!(calls[1].id, "call_2");
        assert_eq!(calls[1].function.arguments, "{\"command\":\"ls\"}");
    }

    #[test]
    fn name_is_fixed_once_known() {
        let mut parts = Vec::new();
        update_partial_tool_call(&mut parts, delta("call_1", "kubectl", "{}"));
        update_partial_tool_call(&mut parts, delta("call_1", "bash", ""));

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "kubectl");
    }

    #[test]
    fn idless_fragment_with_new_name_opens_entry() {
        let mut parts = Vec::new();
        update_partial_tool_call(&mut parts, delta("", "kubectl", "{}"));
        update_partial_tool_call(&mut parts, delta("", "bash", "{}"));

        let calls = finalize_tool_calls(parts);
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call.id.starts_with("call_")));
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn finalize_skips_calls_without_tool_name() {
        let mut parts = Vec::new();
        update_partial_tool_call(&mut parts, delta("call_1", "", "{}"));

        let calls = finalize_tool_calls(parts);
        assert!(calls.is_empty());
    }

    #[test]
    fn argument_only_chunk_extends_last_partial() {
        let mut parts = Vec::new();
        update_partial_tool_call(&mut parts, delta("call_1", "bash", "{\"a\":"));
        update_partial_tool_call(&mut parts, delta("", "", "1}"));
        update_partial_tool_call(&mut parts, delta("", "", ""));

        let calls = finalize_tool_calls(parts);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
    }
}

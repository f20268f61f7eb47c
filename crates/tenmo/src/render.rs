//! Graph rendering.

use std::fmt::Write;

use crate::event::OpType;
use crate::model::Universe;

/// Turns a loaded [`Universe`] into a document for viewers.
pub trait Renderer {
    fn render(&self, universe: &Universe) -> Vec<u8>;
}

/// Graphviz `digraph` output.
#[derive(Debug, Clone, Copy)]
pub struct DotRenderer {
    /// Node label width.
    pub label_width: usize,
    /// Cluster label width.
    pub cluster_label_width: usize,
}

impl Default for DotRenderer {
    fn default() -> Self {
        Self {
            label_width: 25,
            cluster_label_width: 50,
        }
    }
}

const UNKNOWN_LABEL: &str = "#unknown#";
const KEPT_PREFIX: usize = 5;

/// Shorten `label` to `width` characters as `prefix...suffix`.
pub fn trim_label(label: Option<&str>, width: usize) -> String {
    let Some(label) = label else {
        return UNKNOWN_LABEL.to_string();
    };
    let chars: Vec<char> = label.chars().collect();
    if chars.len() <= width || width < KEPT_PREFIX + 4 {
        return label.to_string();
    }
    let suffix = width - KEPT_PREFIX - 3;
    let mut out: String = chars[..KEPT_PREFIX].iter().collect();
    out.push_str("...");
    out.extend(&chars[chars.len() - suffix..]);
    out
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Renderer for DotRenderer {
    fn render(&self, u: &Universe) -> Vec<u8> {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_dot(u, &mut out);
        out.into_bytes()
    }
}

impl DotRenderer {
    fn label(&self, label: Option<&str>) -> String {
        escape(&trim_label(label, self.label_width))
    }

    fn cluster_label(&self, label: Option<&str>) -> String {
        escape(&trim_label(label, self.cluster_label_width))
    }

    fn write_dot(&self, u: &Universe, out: &mut String) -> std::fmt::Result {
        writeln!(out, "digraph u {{")?;
        writeln!(out, "node [style=filled];")?;

        for (id, execution) in &u.executions {
            let id = escape(id);
            writeln!(
                out,
                "\"{id}\" [id=\"{id}\" label=\"{}\" shape=rectangle fillcolor=\"#FFD9B2\"]",
                self.label(execution.description.as_deref())
            )?;
        }

        for entity in u.entities.values() {
            let id = escape(&entity.entity_id);
            writeln!(out, "subgraph \"cluster_{id}\" {{")?;
            writeln!(out, "id=\"{id}\";")?;
            writeln!(out, "style=dotted;")?;
            writeln!(out, "fontsize=7;")?;
            writeln!(
                out,
                "label=\"{}\";",
                self.cluster_label(entity.description.as_deref())
            )?;
            for incarnation_id in &entity.incarnations {
                writeln!(out, "\"{}\";", escape(incarnation_id))?;
            }
            writeln!(out, "}}")?;
        }

        for incarnation in u.incarnations.values() {
            let id = escape(&incarnation.incarnation_id);
            writeln!(
                out,
                "\"{id}\" [id=\"{id}\" fillcolor=\"#B2FFB2\" label=\"{}\" style=\"dotted, filled\" shape=diamond];",
                self.label(incarnation.description.as_deref())
            )?;
            if let Some(parent) = &incarnation.parent_id {
                writeln!(
                    out,
                    "\"{}\" -> \"{id}\" [penwidth=0.3 arrowsize=.5 weight=22];",
                    escape(parent)
                )?;
            }
        }

        for execution in u.executions.values() {
            let id = escape(&execution.execution_id);
            if let Some(parent) = &execution.parent_id {
                writeln!(out, "\"{}\" -> \"{id}\" [weight=25];", escape(parent))?;
            }
            if let Some(creator) = &execution.creator_id {
                writeln!(
                    out,
                    "\"{}\" -> \"{id}\" [style=dotted weight=20];",
                    escape(creator)
                )?;
            }
        }

        for operation in u.operations.values() {
            let incarnation = escape(&operation.incarnation_id);
            let execution = escape(&operation.execution_id);
            match operation.op_type {
                OpType::Read => writeln!(
                    out,
                    "\"{incarnation}\" -> \"{execution}\" [style=dashed weight=10];"
                )?,
                OpType::Write => writeln!(
                    out,
                    "\"{execution}\" -> \"{incarnation}\" [style=dashed weight=15];"
                )?,
            }
        }

        for interaction in u.interactions.values() {
            let id = escape(&interaction.interaction_id);
            writeln!(out, "subgraph \"cluster_interaction_{id}\" {{")?;
            writeln!(out, "id=\"{id}\";")?;
            writeln!(out, "style=dotted;")?;
            writeln!(out, "fontsize=7;")?;
            writeln!(
                out,
                "label=\"{}\";",
                self.cluster_label(interaction.description.as_deref())
            )?;
            for message_id in &interaction.messages {
                writeln!(
                    out,
                    "\"{}\" [label=\"\" shape=circle fixedsize=true width=0.2 height=0.2 fillcolor=\"#B2B2FF\"];",
                    escape(message_id)
                )?;
            }
            writeln!(out, "}}")?;
        }

        for message in u.messages.values() {
            writeln!(
                out,
                "\"{}\" -> \"{}\" -> \"{}\" [weight=5 style=dotted penwidth=0.5 arrowsize=.5];",
                escape(&message.sender),
                escape(&message.message_id),
                escape(&message.target)
            )?;
        }

        for assert in &u.asserts {
            writeln!(
                out,
                "\"{}\" -> \"{}\" [weight=5 label=\"{}\" style=dashed penwidth=0.5 arrowsize=.5 labelfontsize=10 color=red];",
                escape(&assert.source),
                escape(&assert.target),
                self.label(Some(&assert.comment))
            )?;
        }

        writeln!(out, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Assert, Entity, Execution, Incarnation, Operation};
    use chrono::Utc;

    #[test]
    fn trim_keeps_prefix_and_suffix() {
        let trimmed = trim_label(Some("/nix/store/abcdefghijklmnopqrstuvwxyz-hello-2.12"), 25);
        assert_eq!(trimmed.chars().count(), 25);
        assert!(trimmed.starts_with("/nix/..."));
        assert!(trimmed.ends_with("hello-2.12"));

        assert_eq!(trim_label(Some("short"), 25), "short");
        assert_eq!(trim_label(None, 25), "#unknown#");
    }

    #[test]
    fn renders_nodes_and_edges() {
        let mut u = Universe::default();
        u.executions.insert(
            "1".into(),
            Execution {
                execution_id: "1".into(),
                begin_timestamp: Utc::now(),
                end_timestamp: None,
                parent_id: Some("0".into()),
                creator_id: None,
                process_id: None,
                description: Some("build \"hello\"".into()),
            },
        );
        u.entities.insert(
            "e1".into(),
            Entity {
                entity_id: "e1".into(),
                description: None,
                incarnations: vec!["i1".into()],
            },
        );
        u.incarnations.insert(
            "i1".into(),
            Incarnation {
                incarnation_id: "i1".into(),
                entity_id: Some("e1".into()),
                parent_id: None,
                creator_id: Some("1".into()),
                description: None,
            },
        );
        u.operations.insert(
            "op".into(),
            Operation {
                operation_id: "op".into(),
                ts: Utc::now(),
                execution_id: "1".into(),
                op_type: OpType::Write,
                entity_id: Some("e1".into()),
                incarnation_id: "i1".into(),
                entity_description: None,
                incarnation_description: None,
            },
        );
        u.asserts.insert(Assert {
            source: "1".into(),
            target: "i1".into(),
            comment: "expected".into(),
        });

        let dot = String::from_utf8(DotRenderer::default().render(&u)).unwrap();

        assert!(dot.starts_with("digraph u {\n"));
        assert!(dot.trim_end().ends_with('}'));
        assert!(dot.contains(r#"label="build \"hello\"""#));
        assert!(dot.contains(r#""0" -> "1" [weight=25];"#));
        assert!(dot.contains(r#""1" -> "i1" [style=dashed weight=15];"#));
        assert!(dot.contains("subgraph \"cluster_e1\""));
        assert!(dot.contains("label=\"#unknown#\";"));
        assert!(dot.contains("color=red"));
    }
}

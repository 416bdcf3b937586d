//! Graphviz rendering of an activity dump.

use std::fmt::Write;

use crate::tree::{ActivityDumpDocument, NodeGeneration, ProcessNodeDocument};

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

struct Renderer {
    out: String,
    next_id: usize,
}

impl Renderer {
    fn node(&mut self, label: &str, shape: &str, color: &str) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        let _ = writeln!(
            self.out,
            "  n{id} [label=\"{}\", shape={shape}, fillcolor=\"{color}\"];",
            escape(label)
        );
        id
    }

    fn edge(&mut self, from: usize, to: usize) {
        let _ = writeln!(self.out, "  n{from} -> n{to};");
    }

    fn process(&mut self, process: &ProcessNodeDocument) -> usize {
        let color = match process.generation {
            NodeGeneration::Runtime => "#8fbbff",
            NodeGeneration::Snapshot => "#edf3ff",
        };
        let image = if process.filename.is_empty() {
            &process.comm
        } else {
            &process.filename
        };
        let id = self.node(&format!("{image} ({})", process.pid), "record", color);

        let leaves = [
            (&process.files, "note", "#77bf77"),
            (&process.dns, "diamond", "#ff9800"),
            (&process.binds, "cds", "#ff6e6e"),
        ];
        for (values, shape, color) in leaves {
            for value in values {
                let leaf = self.node(value, shape, color);
                self.edge(id, leaf);
            }
        }
        for child in &process.children {
            let child = self.process(child);
            self.edge(id, child);
        }
        id
    }
}

pub fn render(document: &ActivityDumpDocument) -> String {
    let title = document
        .selector()
        .map(|selector| selector.to_string())
        .unwrap_or_default();
    let mut renderer = Renderer {
        out: String::new(),
        next_id: 0,
    };
    let _ = writeln!(renderer.out, "digraph \"{}\" {{", escape(&title));
    renderer
        .out
        .push_str("  node [style=filled, fontname=\"Helvetica\"];\n");
    for process in &document.processes {
        renderer.process(process);
    }
    renderer.out.push_str("}\n");
    renderer.out
}

use std::io::{self, Write};

use crate::group::graph::{Graph, PlanCmd};

/// Writes the graph to the path named by `FRAY_DUMP_PLAN`, if set.
pub(crate) fn dump_if_env(graph: &Graph) -> io::Result<()> {
    if let Some(path) = std::env::var_os("FRAY_DUMP_PLAN") {
        let mut file = std::fs::File::create(path)?;
        write_dot(graph, &mut file, Some(module_path!()))?;
    }
    Ok(())
}

/// Renders the dependency graph, and the injected waits of the compiled
/// plan when one is available, as Graphviz.
pub(crate) fn write_dot(
    graph: &Graph,
    w: &mut dyn Write,
    title: Option<&str>,
) -> io::Result<()> {
    writeln!(w, "digraph systems {{")?;
    writeln!(w, "  graph [rankdir=LR,ranksep=0.6,splines=true];")?;
    if let Some(title) = title {
        writeln!(w, "  label=\"{title}\";")?;
    }

    for (i, ctx) in graph.systems.iter().enumerate() {
        let shape = if ctx.strong { "box" } else { "ellipse" };
        writeln!(
            w,
            "  s{i} [shape={shape}, label=\"{}\"];",
            ctx.runner.descriptor.label()
        )?;
    }

    // declared ordering edges; dashed when the deferred fence is ignored
    for (i, ctx) in graph.systems.iter().enumerate() {
        let descriptor = &ctx.runner.descriptor;
        for dep in descriptor.after() {
            if let Some(&t) = graph.index.get(&dep.system) {
                let style = if dep.ignore_deferred { " [style=dashed]" } else { "" };
                writeln!(w, "  s{t} -> s{i}{style};")?;
            }
        }
        for dep in descriptor.before() {
            if let Some(&t) = graph.index.get(&dep.system) {
                let style = if dep.ignore_deferred { " [style=dashed]" } else { "" };
                writeln!(w, "  s{i} -> s{t}{style};")?;
            }
        }
    }

    if !graph.dirty {
        // injected waits of the compiled plan
        let mut emitted: Vec<Option<usize>> = Vec::with_capacity(graph.plan.len());
        let mut pending: Vec<usize> = Vec::new();
        for command in &graph.plan {
            match *command {
                PlanCmd::Wait { delta } => {
                    let target = emitted.len() - delta;
                    if let Some(system) = emitted[target] {
                        pending.push(system);
                    }
                    emitted.push(None);
                }
                PlanCmd::Run { system } => {
                    for waited in pending.drain(..) {
                        writeln!(
                            w,
                            "  s{waited} -> s{system} [color=red, constraint=false];"
                        )?;
                    }
                    emitted.push(Some(system));
                }
            }
        }
    }

    writeln!(w, "}}")?;
    Ok(())
}

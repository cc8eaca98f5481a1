use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::ArcStr;
use crate::engine::{Dependency, EngineHandle, Workbench};
use crate::resource::ResourceKey;
use crate::task::TaskId;

/// A single task execution observed during a session.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task: TaskId,
    /// Name of the engine that owns the task.
    pub engine: ArcStr,
    pub start: Instant,
    pub duration: Duration,
}

/// What a session did: which tasks ran, and how many were found up to date.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    /// Executions in the order they finished.
    pub executed: Vec<TaskExecution>,
    /// Number of tasks whose recorded output was reused.
    pub reused: usize,
}

impl Diagnostics {
    pub fn was_executed(&self, task: &TaskId) -> bool {
        self.executed.iter().any(|exec| &exec.task == task)
    }

    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }
}

enum Vertex {
    Task(TaskId),
    Resource(ResourceKey),
}

impl Diagnostics {
    /// Renders the recorded dependency graph below `root` as a Mermaid
    /// diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Reused
    /// * **Grey**: Resource
    pub fn render_mermaid(&self, workbench: &Workbench, engine: EngineHandle, root: &TaskId) -> String {
        let graph = collect_graph(workbench, engine, root);

        let times: HashMap<&TaskId, Duration> = self
            .executed
            .iter()
            .map(|exec| (&exec.task, exec.duration))
            .collect();

        let min_time = times.values().map(Duration::as_secs_f64).fold(f64::MAX, f64::min);
        let mut max_time = times.values().map(Duration::as_secs_f64).fold(f64::MIN, f64::max);
        let min_time = if min_time > max_time { 0.0 } else { min_time };

        if max_time - min_time < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let mut f = String::new();
        writeln!(f, "graph LR").ok();

        for index in graph.node_indices() {
            let (name, label_extra, color_code) = match &graph[index] {
                Vertex::Task(task) => {
                    let (extra, color) = match times.get(task) {
                        Some(duration) => {
                            let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);
                            (format!("{duration:.2?}"), heat(t))
                        }
                        None => ("Reused".to_string(), "#ADD8E6".to_string()),
                    };
                    (task.to_string(), extra, color)
                }
                Vertex::Resource(key) => {
                    (key.to_string(), "Resource".to_string(), "#D3D3D3".to_string())
                }
            };

            let name = name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label_extra).ok();
            writeln!(f, "    style {} fill:{}", index.index(), color_code).ok();
        }

        for edge in graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index()).ok();
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}

/// Walks the recorded traces from `root`, in dependency order.
fn collect_graph(workbench: &Workbench, engine: EngineHandle, root: &TaskId) -> Graph<Vertex, ()> {
    let mut graph = Graph::new();
    let mut tasks: HashMap<TaskId, NodeIndex> = HashMap::new();
    let mut resources: HashMap<ResourceKey, NodeIndex> = HashMap::new();

    let start = graph.add_node(Vertex::Task(root.clone()));
    tasks.insert(root.clone(), start);

    let mut pending = vec![(root.clone(), start)];

    while let Some((task, index)) = pending.pop() {
        let Some(record) = workbench.trace(engine, &task) else {
            continue;
        };

        for dep in &record.dependencies {
            let target = match dep {
                Dependency::Task { task, .. } => match tasks.get(task) {
                    Some(&target) => target,
                    None => {
                        let target = graph.add_node(Vertex::Task(task.clone()));
                        tasks.insert(task.clone(), target);
                        pending.push((task.clone(), target));
                        target
                    }
                },
                Dependency::Resource { key, .. } => *resources
                    .entry(key.clone())
                    .or_insert_with(|| graph.add_node(Vertex::Resource(key.clone()))),
            };

            graph.update_edge(index, target, ());
        }
    }

    graph
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

const ROW_HEIGHT: u32 = 30;
const LABEL_WIDTH: u32 = 300;
const CHART_WIDTH: u32 = 800;
const PADDING: u32 = 10;
const HEADER_HEIGHT: u32 = 30;

fn format_micros(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{micros:.0}µs")
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}

impl Diagnostics {
    /// Renders a waterfall chart of the executions as an SVG file.
    pub fn render_waterfall_to_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, self.render_waterfall())
    }

    /// Renders a waterfall chart of the executions as an SVG string.
    pub fn render_waterfall(&self) -> String {
        let mut ran: Vec<&TaskExecution> = self.executed.iter().collect();
        ran.sort_by_key(|exec| exec.start);

        let (Some(first), Some(end)) = (
            ran.first(),
            ran.iter().map(|exec| exec.start + exec.duration).max(),
        ) else {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#
                .to_string();
        };

        let global_start = first.start;
        let total_micros = end.duration_since(global_start).as_micros().max(1) as f64;

        let mut svg = String::with_capacity(ran.len() * 500);
        let width = LABEL_WIDTH + CHART_WIDTH + PADDING * 3 + 80;
        let height = HEADER_HEIGHT + ran.len() as u32 * ROW_HEIGHT + PADDING;

        write!(
            svg,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .bar {{ fill: #3b82f6; }} .time {{ fill: #666; font-size: 11px; }} .grid-line {{ stroke: #e5e7eb; }}</style><rect width="100%" height="100%" fill="white" />"#
        )
        .ok();

        for step in 0..=5 {
            let pct = step as f64 / 5.0;
            let x = (LABEL_WIDTH + PADDING) as f64 + CHART_WIDTH as f64 * pct;
            write!(
                svg,
                r#"<line x1="{x:.1}" y1="{HEADER_HEIGHT}" x2="{x:.1}" y2="100%" class="grid-line" /><text x="{x:.1}" y="{}" text-anchor="middle" class="time">{}</text>"#,
                HEADER_HEIGHT - 5,
                format_micros(total_micros * pct),
            )
            .ok();
        }

        for (i, exec) in ran.iter().enumerate() {
            let name = format!("{} ({})", exec.task, exec.engine);
            let name = XmlSafe(&name);

            let y = HEADER_HEIGHT + i as u32 * ROW_HEIGHT;
            let offset = exec.start.duration_since(global_start).as_micros() as f64;
            let micros = exec.duration.as_micros() as f64;

            let bar_x = (LABEL_WIDTH + PADDING) as f64 + offset / total_micros * CHART_WIDTH as f64;
            let bar_w = (micros / total_micros * CHART_WIDTH as f64).max(1.0);

            write!(
                svg,
                r#"<text x="{PADDING}" y="{}" dominant-baseline="middle">{name}</text><rect x="{bar_x:.1}" y="{}" width="{bar_w:.1}" height="{}" class="bar"><title>{name}: {:.2?}</title></rect><text x="{:.1}" y="{}" class="time" dominant-baseline="middle">{}</text>"#,
                y + ROW_HEIGHT / 2,
                y + 5,
                ROW_HEIGHT - 10,
                exec.duration,
                bar_x + bar_w + 5.0,
                y + ROW_HEIGHT / 2,
                format_micros(micros),
            )
            .ok();
        }

        svg.push_str("</svg>");
        svg
    }
}

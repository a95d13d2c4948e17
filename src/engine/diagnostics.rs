use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter, Write};
use std::time::{Duration, Instant};

use crate::task::TaskId;

/// When a task ran and for how long.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    pub failed: bool,
}

/// Timings of every task dispatched during a run.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub execution_times: BTreeMap<TaskId, TaskExecution>,
}

impl Diagnostics {
    /// Wall time from the first dispatch to the last completion.
    pub fn wall_time(&self) -> Duration {
        let start = self.execution_times.values().map(|t| t.start).min();
        let end = self
            .execution_times
            .values()
            .map(|t| t.start + t.duration)
            .max();

        match (start, end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    pub fn render_waterfall_to_file(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> std::io::Result<()> {
        std::fs::write(path, self.render_waterfall())
    }

    /// Renders a waterfall chart of the run as SVG, one row per task in
    /// dispatch order. Failed tasks are drawn red.
    pub fn render_waterfall(&self) -> String {
        let mut rows: Vec<_> = self.execution_times.iter().collect();
        rows.sort_by_key(|(_, t)| t.start);

        let Some((_, first)) = rows.first() else {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#
                .to_string();
        };

        let origin = first.start;
        let span = self.wall_time().as_micros().max(1) as f64;
        let layout = Layout::default();

        let mut svg = String::with_capacity(rows.len() * 400);
        // writing into a String cannot fail
        let _ = layout.header(&mut svg, rows.len(), span);
        for (i, (id, exec)) in rows.iter().enumerate() {
            let _ = layout.row(&mut svg, i, id, exec, origin, span);
        }
        svg.push_str("</svg>");

        svg
    }
}

struct Layout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            row_height: 28,
            label_width: 280,
            chart_width: 800,
            padding: 10,
            header_height: 30,
        }
    }
}

impl Layout {
    fn header(&self, svg: &mut String, rows: usize, span: f64) -> fmt::Result {
        let width = self.label_width + self.chart_width + self.padding * 3 + 80;
        let height = self.header_height + rows as u32 * self.row_height + self.padding;

        write!(
            svg,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .bar {{ fill: #3b82f6; }} .fail {{ fill: #ef4444; }} .grid {{ stroke: #e5e7eb; }} .axis {{ fill: #9ca3af; font-size: 10px; }}</style><rect width="100%" height="100%" fill="white" />"#
        )?;

        for step in 0..=5 {
            let fraction = f64::from(step) / 5.0;
            let x = self.chart_x(fraction);
            write!(
                svg,
                r#"<line x1="{x:.1}" y1="{top}" x2="{x:.1}" y2="100%" class="grid" /><text x="{x:.1}" y="{label}" text-anchor="middle" class="axis">{time}</text>"#,
                top = self.header_height,
                label = self.header_height - 5,
                time = micros(span * fraction),
            )?;
        }

        Ok(())
    }

    fn row(
        &self,
        svg: &mut String,
        i: usize,
        id: &TaskId,
        exec: &TaskExecution,
        origin: Instant,
        span: f64,
    ) -> fmt::Result {
        let y = self.header_height + i as u32 * self.row_height;
        let middle = y + self.row_height / 2;
        let name = XmlSafe(id.to_string());

        let offset = exec.start.duration_since(origin).as_micros() as f64;
        let length = exec.duration.as_micros() as f64;
        let x = self.chart_x(offset / span);
        let w = (length / span * f64::from(self.chart_width)).max(1.0);
        let class = if exec.failed { "fail" } else { "bar" };

        write!(
            svg,
            r#"<text x="{pad}" y="{middle}" dominant-baseline="middle">{name}</text><rect x="{x:.1}" y="{top}" width="{w:.1}" height="{h}" class="{class}"><title>{name}: {duration:.2?}</title></rect><text x="{after:.1}" y="{middle}" class="axis" dominant-baseline="middle">{time}</text>"#,
            pad = self.padding,
            top = y + 5,
            h = self.row_height - 10,
            duration = exec.duration,
            after = x + w + 5.0,
            time = micros(length),
        )
    }

    fn chart_x(&self, fraction: f64) -> f64 {
        f64::from(self.label_width + self.padding) + fraction * f64::from(self.chart_width)
    }
}

fn micros(value: f64) -> String {
    if value < 1_000.0 {
        format!("{value:.0}µs")
    } else if value < 1_000_000.0 {
        format!("{:.2}ms", value / 1_000.0)
    } else {
        format!("{:.2}s", value / 1_000_000.0)
    }
}

struct XmlSafe(String);

impl Display for XmlSafe {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
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

//! SVG time-series chart rendering
//!
//! Renders one chart per request from table reads, one line series per
//! property, into an in-memory SVG document.

use plotters::prelude::*;
use plotters::style::RGBColor;

use crate::error::{MadError, Result};
use crate::store::DataPoint;

/// Chart canvas size in pixels
const CHART_SIZE: (u32, u32) = (900, 300);

/// Series stroke colors, cycled in declaration order
const SERIES_COLORS: [RGBColor; 5] = [
    RGBColor(0, 114, 189),
    RGBColor(217, 83, 25),
    RGBColor(119, 172, 48),
    RGBColor(126, 47, 142),
    RGBColor(77, 190, 238),
];

/// Render the given named series into an SVG document.
///
/// The x axis is the sample index labeled with wall-clock times from the
/// longest series; the y axis spans `[0, max]` so a flat series does not
/// fill the whole chart.
pub fn render_chart(title: &str, series: &[(String, Vec<DataPoint>)]) -> Result<String> {
    let render_err = |e: String| MadError::ChartRender { reason: e };

    let longest = series.iter().map(|(_, data)| data.len()).max().unwrap_or(0);
    let x_max = longest.saturating_sub(1).max(1);

    let mut y_max: f64 = 1.0;
    for (_, data) in series {
        for point in data {
            y_max = y_max.max(point.value);
        }
    }

    let time_labels: Vec<String> = series
        .iter()
        .max_by_key(|(_, data)| data.len())
        .map(|(_, data)| {
            data.iter().map(|p| p.datetime().format("%H:%M:%S").to_string()).collect()
        })
        .unwrap_or_default();

    let mut svg = String::new();
    {
        let backend = SVGBackend::with_string(&mut svg, CHART_SIZE);
        let root = backend.into_drawing_area();
        root.fill(&WHITE).map_err(|e| render_err(e.to_string()))?;

        let mut chart = ChartBuilder::on(&root)
            .caption(title, ("sans-serif", 22))
            .margin(12)
            .x_label_area_size(30)
            .y_label_area_size(60)
            .build_cartesian_2d(0..x_max, 0.0..y_max)
            .map_err(|e| render_err(e.to_string()))?;

        chart
            .configure_mesh()
            .x_labels(8)
            .x_label_formatter(&|idx| time_labels.get(*idx).cloned().unwrap_or_default())
            .draw()
            .map_err(|e| render_err(e.to_string()))?;

        for (i, (name, data)) in series.iter().enumerate() {
            let color = SERIES_COLORS[i % SERIES_COLORS.len()];
            chart
                .draw_series(LineSeries::new(
                    data.iter().enumerate().map(|(x, p)| (x, p.value)),
                    &color,
                ))
                .map_err(|e| render_err(e.to_string()))?
                .label(name.clone())
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 20, y)], color)
                });
        }

        if series.len() > 1 {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()
                .map_err(|e| render_err(e.to_string()))?;
        }

        root.present().map_err(|e| render_err(e.to_string()))?;
    }
    Ok(svg)
}

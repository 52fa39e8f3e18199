use std::{fmt::Debug, path::Path};

use anyhow::{anyhow, bail, ensure, Context, Result};
use base64::Engine;
use image::{codecs::png::PngEncoder, ColorType, ImageEncoder, RgbImage};
use plotters::prelude::*;
use textplots::{Chart, Plot, Shape};

use crate::metrics::LossCurves;

const MARGIN: u32 = 40;
const MARKER_RADIUS: i32 = 3;

/// Series colors, assigned to curves in iteration order.
pub const PALETTE: [[u8; 3]; 6] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
    [148, 103, 189],
    [140, 86, 75],
];

pub fn series_color(index: usize) -> [u8; 3] {
    PALETTE[index % PALETTE.len()]
}

/// `#rrggbb` form of a palette entry, for legends.
pub fn color_hex(color: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2])
}

/// Draw every loss curve on shared axes: epoch (1-based) horizontally, loss vertically.
pub fn render_loss_chart(curves: &LossCurves, width: u32, height: u32) -> Result<RgbImage> {
    ensure!(
        width > 2 * MARGIN && height > 2 * MARGIN,
        "chart size {}x{} leaves no room inside the {}px margins",
        width,
        height,
        MARGIN
    );
    let Some((lo, hi)) = curves.loss_range() else {
        bail!("no loss values to plot");
    };
    let (lo, hi) = if (hi - lo).abs() < f32::EPSILON {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    };
    let (first, last) = epoch_bounds(curves.max_epochs());

    let mut buffer = vec![0u8; width as usize * height as usize * 3];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_error)?;

        let mut chart = ChartBuilder::on(&root)
            .margin(MARGIN)
            .build_cartesian_2d(first..last, lo..hi)
            .map_err(draw_error)?;
        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(first, hi), (first, lo), (last, lo)],
                BLACK.stroke_width(1),
            )))
            .map_err(draw_error)?;

        for (index, (_, history)) in curves.iter().enumerate() {
            let [r, g, b] = series_color(index);
            let color = RGBColor(r, g, b);
            let points: Vec<(f32, f32)> = history
                .iter()
                .map(|metrics| (metrics.epoch as f32, metrics.loss))
                .collect();

            chart
                .draw_series(LineSeries::new(points.clone(), color.stroke_width(2)))
                .map_err(draw_error)?;
            chart
                .draw_series(
                    points
                        .into_iter()
                        .map(|point| Circle::new(point, MARKER_RADIUS, color.filled())),
                )
                .map_err(draw_error)?;
        }

        root.present().map_err(draw_error)?;
    }

    RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| anyhow!("chart buffer does not match {width}x{height}"))
}

/// The same overlaid curves as braille text, for printing to a terminal.
///
/// `width` and `height` are in braille dots (two per column, four per row).
pub fn render_terminal_chart(curves: &LossCurves, width: u32, height: u32) -> Result<String> {
    ensure!(
        width >= 32 && height >= 3,
        "terminal chart needs at least 32x3 dots, got {}x{}",
        width,
        height
    );
    ensure!(curves.loss_range().is_some(), "no loss values to plot");

    let series: Vec<Vec<(f32, f32)>> = curves
        .iter()
        .map(|(_, history)| {
            history
                .iter()
                .map(|metrics| (metrics.epoch as f32, metrics.loss))
                .collect()
        })
        .collect();
    let shapes: Vec<Shape> = series.iter().map(|points| Shape::Lines(points)).collect();
    let (first, last) = epoch_bounds(curves.max_epochs());

    let mut chart = Chart::new(width, height, first, last);
    let mut plot = &mut chart;
    for shape in &shapes {
        plot = plot.lineplot(shape);
    }
    plot.axis();
    plot.figures();

    Ok(plot.to_string())
}

/// Encode an RGB image as a PNG data URL.
pub fn encode_rgb_png_data_url(image: &RgbImage) -> Result<String> {
    let buffer = encode_png(image)?;
    let base64 = base64::engine::general_purpose::STANDARD.encode(&buffer);
    Ok(format!("data:image/png;base64,{base64}"))
}

pub fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    let buffer = encode_png(image)?;
    std::fs::write(path, buffer).with_context(|| format!("failed to write {}", path.display()))
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
        .context("failed to encode RGB PNG data")?;
    Ok(buffer)
}

/// Horizontal range for `epochs` points; a single epoch sits in the middle.
fn epoch_bounds(epochs: usize) -> (f32, f32) {
    if epochs <= 1 {
        (0.0, 2.0)
    } else {
        (1.0, epochs as f32)
    }
}

fn draw_error<E: Debug>(err: E) -> anyhow::Error {
    anyhow!("failed to draw loss chart: {err:?}")
}

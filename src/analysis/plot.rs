use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::coord::types::RangedCoordf64;
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::analysis::error::{Result, SignalError};
use crate::analysis::pipeline::EpochPsd;
use crate::analysis::response::ResponseCurve;
use crate::analysis::spectral::to_decibels;

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: RGBColor(10, 10, 10),
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW, WHITE],
        }
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    if (hi - lo).abs() < f64::EPSILON {
        (lo - 1.0, hi + 1.0)
    } else {
        (lo, hi)
    }
}

const GRID_LINES: usize = 5;
const KEY_SIZE: i32 = 12;
const KEY_STEP: i32 = 16;

// Grid lines instead of configure_mesh: tick labels need a font backend
// and the bitmap build carries none.
fn draw_grid<DB: DrawingBackend>(
    chart: &mut ChartContext<'_, DB, Cartesian2d<RangedCoordf64, RangedCoordf64>>,
    x: (f64, f64),
    y: (f64, f64),
) -> Result<()>
where
    DB::ErrorType: 'static,
{
    let grid = WHITE.mix(0.1);
    for k in 0..=GRID_LINES {
        let frac = k as f64 / GRID_LINES as f64;
        let xv = x.0 + frac * (x.1 - x.0);
        let yv = y.0 + frac * (y.1 - y.0);
        chart.draw_series(LineSeries::new([(xv, y.0), (xv, y.1)], grid))?;
        chart.draw_series(LineSeries::new([(x.0, yv), (x.1, yv)], grid))?;
    }
    Ok(())
}

/// Colour key in the top-right corner, one swatch per series in draw order.
fn draw_key<DB: DrawingBackend>(root: &DrawingArea<DB, Shift>, style: &PlotStyle, colors: &[RGBColor]) -> Result<()>
where
    DB::ErrorType: 'static,
{
    let right = style.width as i32 - 18;
    for (idx, color) in colors.iter().enumerate() {
        let top = 14 + KEY_STEP * idx as i32;
        root.draw(&Rectangle::new(
            [(right - KEY_SIZE, top), (right, top + KEY_SIZE)],
            color.filled(),
        ))?;
    }
    Ok(())
}

/// One dB curve per stimulation epoch, coloured by epoch order.
pub fn render_psd_png(epochs: &[EpochPsd], style: &PlotStyle) -> Result<Vec<u8>> {
    if epochs.iter().all(|e| e.psd.is_empty()) {
        return Err(SignalError::Plot("no epoch PSD to draw".into()));
    }
    let (f_min, f_max) = bounds(epochs.iter().flat_map(|e| e.frequency.iter().copied()));
    let (y_min, y_max) = bounds(epochs.iter().flat_map(|e| e.psd.iter().map(|p| to_decibels(*p))));

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height)).into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(f_min..f_max, y_min..y_max)?;
        draw_grid(&mut chart, (f_min, f_max), (y_min, y_max))?;
        for (idx, epoch) in epochs.iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let series = epoch
                .frequency
                .iter()
                .zip(&epoch.psd)
                .map(|(f, p)| (*f, to_decibels(*p)));
            chart.draw_series(LineSeries::new(series, &color))?;
        }
        let colors: Vec<RGBColor> = (0..epochs.len()).map(|idx| style.palette[idx % style.palette.len()]).collect();
        draw_key(&root, style, &colors)?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// Median band power per amplitude as dots, fitted polynomial as a line.
pub fn render_response_png(curve: &ResponseCurve, style: &PlotStyle) -> Result<Vec<u8>> {
    if curve.grid.is_empty() {
        return Err(SignalError::Plot("response curve has no points".into()));
    }
    let (x_min, x_max) = bounds(curve.grid.iter().chain(&curve.amplitudes).copied());
    let (y_min, y_max) = bounds(curve.fitted.iter().chain(&curve.powers).copied());
    let pad = 0.05 * (y_max - y_min);

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height)).into_drawing_area();
        root.fill(&style.background)?;
        let y_range = (y_min - pad, y_max + pad);
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(x_min..x_max, y_range.0..y_range.1)?;
        draw_grid(&mut chart, (x_min, x_max), y_range)?;
        let line = style.palette[0];
        let dots = style.palette[1 % style.palette.len()];
        chart.draw_series(LineSeries::new(
            curve.grid.iter().copied().zip(curve.fitted.iter().copied()),
            &line,
        ))?;
        chart.draw_series(
            curve
                .amplitudes
                .iter()
                .zip(&curve.powers)
                .map(|(a, p)| Circle::new((*a, *p), 4, dots.filled())),
        )?;
        draw_key(&root, style, &[line, dots])?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

pub fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| SignalError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::*;

use crate::error::ColorimeterError;
use crate::series::{Channel, Series, NUM_CHANNELS};

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub channel_colors: [RGBColor; NUM_CHANNELS],
    pub temperature_color: RGBColor,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 600,
            background: WHITE,
            channel_colors: [BLUE, GREEN, RED],
            temperature_color: RGBColor(70, 130, 180),
        }
    }
}

pub fn channel_means(series: &Series) -> [f64; NUM_CHANNELS] {
    [
        series.channel_mean(Channel::Blue),
        series.channel_mean(Channel::Green),
        series.channel_mean(Channel::Red),
    ]
}

fn bounds(values: impl Iterator<Item = f64>, pad: f64) -> (f64, f64) {
    let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
    for value in values {
        lo = lo.min(value);
        hi = hi.max(value);
    }
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    if (hi - lo).abs() < f64::EPSILON {
        (lo - pad, hi + pad)
    } else {
        (lo, hi)
    }
}

/// Renders the dual-axis transmission plot: per-channel signal on the left
/// axis, channel-0 temperature on the right, over the shared time base.
/// Returns an encoded PNG.
pub fn render_transmission_png(
    series: &Series,
    title: &str,
    annotation: &str,
    style: &PlotStyle,
) -> Result<Vec<u8>, ColorimeterError> {
    if series.is_empty() {
        return Err(ColorimeterError::Plot("series has no cycles".into()));
    }

    let (x_lo, x_hi) = bounds(
        Channel::ALL
            .iter()
            .flat_map(|&channel| series.elapsed(channel).to_vec()),
        0.5,
    );
    let (y_lo, y_hi) = bounds(
        Channel::ALL
            .iter()
            .flat_map(|&channel| series.signal(channel).to_vec()),
        0.5,
    );
    let (t_lo, t_hi) = bounds(series.temperature().iter().copied(), 1.0);

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;

        let caption = format!("Transmission plot: {title}, {annotation}");
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(caption, ("sans-serif", 20).into_font())
            .set_label_area_size(LabelAreaPosition::Left, 50)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .right_y_label_area_size(50)
            .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)?
            .set_secondary_coord(x_lo..x_hi, t_lo..t_hi);

        chart
            .configure_mesh()
            .x_desc("t (s)")
            .y_desc("absolute signal")
            .light_line_style(BLACK.mix(0.08))
            .draw()?;
        chart
            .configure_secondary_axes()
            .y_desc("temperature (C)")
            .draw()?;

        for channel in Channel::ALL {
            let color = style.channel_colors[channel.index()];
            let xs = series.elapsed(channel);
            let ys = series.signal(channel);
            let points: Vec<(f64, f64)> = xs.iter().zip(ys.iter()).map(|(&x, &y)| (x, y)).collect();
            chart
                .draw_series(LineSeries::new(points, &color))?
                .label(channel.wavelength_label())
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }

        let temp_color = style.temperature_color;
        let xs = series.elapsed(Channel::Blue);
        let temps = series.temperature();
        let temp_points: Vec<(f64, f64)> =
            xs.iter().zip(temps.iter()).map(|(&x, &t)| (x, t)).collect();
        chart
            .draw_secondary_series(LineSeries::new(temp_points, &temp_color))?
            .label("temperature")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], temp_color));

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::LowerRight)
            .border_style(BLACK.mix(0.3))
            .background_style(style.background.mix(0.8))
            .draw()?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ColorimeterError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| ColorimeterError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

//! Built-in operations of the reference library
//!
//! A small, representative slice of the real operation set: creation,
//! arithmetic, statistics, pixel and band access, multi-output operations,
//! in-place drawing and a file format. Argument names, priorities and flags
//! follow the real library so that positional order comes out the same.

use std::path::Path;

use vipsbridge_sdk::BandFormat;

use crate::class::{BuildContext, OperationDefinition};
use crate::image::{clip, widen, ImageData};

pub(crate) fn builtin_operations() -> Vec<OperationDefinition> {
    vec![
        black(),
        arithmetic("add", |a, b| a + b),
        arithmetic("subtract", |a, b| a - b),
        linear(),
        invert(),
        avg(),
        extremum("min", |a, b| a < b),
        extremum("max", |a, b| a > b),
        getpoint(),
        extract_band(),
        copy(),
        profile(),
        draw_rect(),
        draw_line(),
        csvload(),
        csvsave(),
    ]
}

fn same_size(a: &ImageData, b: &ImageData) -> Result<(), String> {
    if a.width != b.width || a.height != b.height {
        return Err("images must match in size".to_string());
    }
    if a.bands != b.bands && a.bands != 1 && b.bands != 1 {
        return Err("images must have the same number of bands, or one band".to_string());
    }
    Ok(())
}

fn black() -> OperationDefinition {
    OperationDefinition::new("black")
        .description("make a black image")
        .required_output("out", "VipsImage", 1)
        .required_input("width", "gint", 4)
        .required_input("height", "gint", 5)
        .optional_input("bands", "gint", 6)
        .build(|ctx| {
            let width = ctx.int("width")?;
            let height = ctx.int("height")?;
            let bands = ctx.int_or("bands", 1)?;
            if width <= 0 || height <= 0 || bands <= 0 {
                return Err(format!("bad size {}x{}x{}", width, height, bands));
            }
            ctx.set_image("out", ImageData::new(width, height, bands, BandFormat::UChar));
            Ok(())
        })
}

fn arithmetic(name: &'static str, f: fn(f64, f64) -> f64) -> OperationDefinition {
    OperationDefinition::new(name)
        .description(format!("{} two images", name))
        .required_input("left", "VipsImage", 1)
        .required_input("right", "VipsImage", 2)
        .required_output("out", "VipsImage", 3)
        .build(move |ctx| {
            let progress = ctx.progress("left");
            let left = ctx.image("left")?;
            let right = ctx.image("right")?;
            same_size(left, right)?;

            let bands = left.bands.max(right.bands);
            let format = widen(left.format, right.format);
            let mut out = ImageData::new(left.width, left.height, bands, format);
            for y in 0..out.height {
                BuildContext::tick(&progress, y, out.height)?;
                for x in 0..out.width {
                    for b in 0..bands {
                        let l = left.get(x, y, b.min(left.bands - 1));
                        let r = right.get(x, y, b.min(right.bands - 1));
                        out.set(x, y, b, f(l, r));
                    }
                }
            }
            ctx.set_image("out", out);
            Ok(())
        })
}

fn linear() -> OperationDefinition {
    OperationDefinition::new("linear")
        .description("calculate (a * in + b)")
        .required_input("in", "VipsImage", 1)
        .required_output("out", "VipsImage", 2)
        .required_input("a", "VipsArrayDouble", 110)
        .required_input("b", "VipsArrayDouble", 111)
        .optional_input("uchar", "gboolean", 112)
        .build(|ctx| {
            let a = ctx.doubles("a")?;
            let b = ctx.doubles("b")?;
            let uchar = ctx.bool_or("uchar", false)?;
            let input = ctx.image("in")?;
            if a.is_empty() || b.is_empty() {
                return Err("vectors must not be empty".to_string());
            }

            let n = a.len().max(b.len()) as i32;
            if n != 1 && input.bands != 1 && n != input.bands {
                return Err(format!(
                    "vector must have 1 or {} elements",
                    input.bands
                ));
            }
            let bands = input.bands.max(n);
            let format = if uchar { BandFormat::UChar } else { BandFormat::Float };
            let mut out = ImageData::new(input.width, input.height, bands, format);
            for y in 0..input.height {
                for x in 0..input.width {
                    for band in 0..bands {
                        let v = input.get(x, y, band.min(input.bands - 1));
                        let ai = a[(band as usize).min(a.len() - 1)];
                        let bi = b[(band as usize).min(b.len() - 1)];
                        out.set(x, y, band, ai * v + bi);
                    }
                }
            }
            ctx.set_image("out", out);
            Ok(())
        })
}

fn invert() -> OperationDefinition {
    OperationDefinition::new("invert")
        .description("invert an image")
        .required_input("in", "VipsImage", 1)
        .required_output("out", "VipsImage", 2)
        .deprecated_input("deprecated_flag", "gboolean", false, 10)
        .build(|ctx| {
            let input = ctx.image("in")?;
            let mut out = input.clone();
            let max = match input.format {
                BandFormat::UChar => 255.0,
                BandFormat::UShort => 65535.0,
                _ => 0.0,
            };
            for p in out.pixels.iter_mut() {
                *p = if max > 0.0 { max - *p } else { -*p };
            }
            ctx.set_image("out", out);
            Ok(())
        })
}

fn avg() -> OperationDefinition {
    OperationDefinition::new("avg")
        .description("find image average")
        .required_input("in", "VipsImage", 1)
        .required_output("out", "gdouble", 2)
        .build(|ctx| {
            let progress = ctx.progress("in");
            let input = ctx.image("in")?;
            let mut sum = 0.0;
            for y in 0..input.height {
                BuildContext::tick(&progress, y, input.height)?;
                for x in 0..input.width {
                    for b in 0..input.bands {
                        sum += input.get(x, y, b);
                    }
                }
            }
            let mean = sum / input.len().max(1) as f64;
            ctx.set_double("out", mean);
            Ok(())
        })
}

fn extremum(name: &'static str, better: fn(f64, f64) -> bool) -> OperationDefinition {
    OperationDefinition::new(name)
        .description(format!("find image {}imum", name))
        .required_input("in", "VipsImage", 1)
        .required_output("out", "gdouble", 2)
        .optional_output("x", "gint", 3)
        .optional_output("y", "gint", 4)
        .optional_input("size", "gint", 5)
        .optional_output("out_array", "VipsArrayDouble", 6)
        .optional_output("x_array", "VipsArrayInt", 7)
        .build(move |ctx| {
            let input = ctx.image("in")?;
            let mut best = (input.get(0, 0, 0), 0, 0);
            for y in 0..input.height {
                for x in 0..input.width {
                    for b in 0..input.bands {
                        let v = input.get(x, y, b);
                        if better(v, best.0) {
                            best = (v, x, y);
                        }
                    }
                }
            }
            ctx.set_double("out", best.0);
            ctx.set_int("x", best.1);
            ctx.set_int("y", best.2);
            ctx.set_doubles("out_array", vec![best.0]);
            ctx.set_ints("x_array", vec![best.1]);
            Ok(())
        })
}

fn getpoint() -> OperationDefinition {
    OperationDefinition::new("getpoint")
        .description("read a point from an image")
        .required_input("in", "VipsImage", 1)
        .required_output("out_array", "VipsArrayDouble", 2)
        .required_input("x", "gint", 5)
        .required_input("y", "gint", 6)
        .build(|ctx| {
            let x = ctx.int("x")?;
            let y = ctx.int("y")?;
            let input = ctx.image("in")?;
            if !input.contains(x, y) {
                return Err(format!("point {},{} is outside the image", x, y));
            }
            let pixel = input.pixel(x, y);
            ctx.set_doubles("out_array", pixel);
            Ok(())
        })
}

fn extract_band() -> OperationDefinition {
    OperationDefinition::new("extract_band")
        .description("extract band from an image")
        .required_input("in", "VipsImage", 1)
        .required_output("out", "VipsImage", 2)
        .required_input("band", "gint", 3)
        .optional_input("n", "gint", 4)
        .build(|ctx| {
            let band = ctx.int("band")?;
            let n = ctx.int_or("n", 1)?;
            let input = ctx.image("in")?;
            if band < 0 || n < 1 || band + n > input.bands {
                return Err(format!(
                    "bad extract area, band {} n {} of {}",
                    band, n, input.bands
                ));
            }
            let mut out = ImageData::new(input.width, input.height, n, input.format);
            for y in 0..input.height {
                for x in 0..input.width {
                    for b in 0..n {
                        out.set(x, y, b, input.get(x, y, band + b));
                    }
                }
            }
            ctx.set_image("out", out);
            Ok(())
        })
}

fn copy() -> OperationDefinition {
    OperationDefinition::new("copy")
        .description("copy an image")
        .required_input("in", "VipsImage", 1)
        .required_output("out", "VipsImage", 2)
        .optional_input("width", "gint", 4)
        .optional_input("height", "gint", 5)
        .optional_input("bands", "gint", 6)
        .optional_input("format", "VipsBandFormat", 7)
        .build(|ctx| {
            let input = ctx.image("in")?;
            let mut out = input.clone();
            if ctx.has("format") {
                let code = ctx.int("format")?;
                let format = BandFormat::from_code(code)
                    .ok_or_else(|| format!("bad format {}", code))?;
                out = out.cast(format);
            }
            let width = ctx.int_or("width", out.width)?;
            let height = ctx.int_or("height", out.height)?;
            let bands = ctx.int_or("bands", out.bands)?;
            if (width * height * bands) as usize != out.len() {
                return Err("must not change pel size".to_string());
            }
            out.width = width;
            out.height = height;
            out.bands = bands;
            ctx.set_image("out", out);
            Ok(())
        })
}

fn profile() -> OperationDefinition {
    OperationDefinition::new("profile")
        .description("find image profiles")
        .required_input("in", "VipsImage", 1)
        .required_output("columns", "VipsImage", 2)
        .required_output("rows", "VipsImage", 3)
        .build(|ctx| {
            let input = ctx.image("in")?;
            let mut columns = ImageData::filled(input.width, 1, input.bands, BandFormat::Int, input.height as f64);
            let mut rows = ImageData::filled(1, input.height, input.bands, BandFormat::Int, input.width as f64);
            for b in 0..input.bands {
                for x in 0..input.width {
                    if let Some(y) = (0..input.height).find(|&y| input.get(x, y, b) != 0.0) {
                        columns.set(x, 0, b, y as f64);
                    }
                }
                for y in 0..input.height {
                    if let Some(x) = (0..input.width).find(|&x| input.get(x, y, b) != 0.0) {
                        rows.set(0, y, b, x as f64);
                    }
                }
            }
            ctx.set_image("columns", columns);
            ctx.set_image("rows", rows);
            Ok(())
        })
}

fn ink_for(ink: &[f64], bands: i32, format: BandFormat) -> Result<Vec<f64>, String> {
    match ink.len() {
        1 => Ok(vec![clip(format, ink[0]); bands as usize]),
        n if n == bands as usize => Ok(ink.iter().map(|v| clip(format, *v)).collect()),
        n => Err(format!("ink has {} elements, image has {} bands", n, bands)),
    }
}

fn draw_rect() -> OperationDefinition {
    OperationDefinition::new("draw_rect")
        .description("paint a rectangle on an image")
        .modify("image", 1)
        .required_input("ink", "VipsArrayDouble", 2)
        .required_input("left", "gint", 6)
        .required_input("top", "gint", 7)
        .required_input("width", "gint", 8)
        .required_input("height", "gint", 9)
        .optional_input("fill", "gboolean", 10)
        .build(|ctx| {
            let ink = ctx.doubles("ink")?;
            let (left, top) = (ctx.int("left")?, ctx.int("top")?);
            let (width, height) = (ctx.int("width")?, ctx.int("height")?);
            let fill = ctx.bool_or("fill", false)?;
            let image = ctx.image_mut("image")?;
            let ink = ink_for(&ink, image.bands, image.format)?;

            for y in top..top + height {
                for x in left..left + width {
                    let edge = y == top || y == top + height - 1 || x == left || x == left + width - 1;
                    if (fill || edge) && image.contains(x, y) {
                        for (b, v) in ink.iter().enumerate() {
                            image.set(x, y, b as i32, *v);
                        }
                    }
                }
            }
            Ok(())
        })
}

fn draw_line() -> OperationDefinition {
    OperationDefinition::new("draw_line")
        .description("draw a line on an image")
        .modify("image", 1)
        .required_input("ink", "VipsArrayDouble", 2)
        .required_input("x1", "gint", 3)
        .required_input("y1", "gint", 4)
        .required_input("x2", "gint", 5)
        .required_input("y2", "gint", 6)
        .build(|ctx| {
            let ink = ctx.doubles("ink")?;
            let (x1, y1) = (ctx.int("x1")?, ctx.int("y1")?);
            let (x2, y2) = (ctx.int("x2")?, ctx.int("y2")?);
            let image = ctx.image_mut("image")?;
            let ink = ink_for(&ink, image.bands, image.format)?;

            let steps = (x2 - x1).abs().max((y2 - y1).abs()).max(1);
            for i in 0..=steps {
                let x = x1 + ((x2 - x1) as f64 * i as f64 / steps as f64).round() as i32;
                let y = y1 + ((y2 - y1) as f64 * i as f64 / steps as f64).round() as i32;
                if image.contains(x, y) {
                    for (b, v) in ink.iter().enumerate() {
                        image.set(x, y, b as i32, *v);
                    }
                }
            }
            Ok(())
        })
}

fn csvload() -> OperationDefinition {
    OperationDefinition::new("csvload")
        .description("load csv")
        .required_input("filename", "gchararray", 1)
        .required_output("out", "VipsImage", 2)
        .optional_output("flags", "VipsForeignFlags", 6)
        .optional_input("skip", "gint", 20)
        .optional_input("separator", "gchararray", 23)
        .nocache()
        .build(|ctx| {
            let filename = ctx.string("filename")?;
            let skip = ctx.int_or("skip", 0)?.max(0) as usize;
            let separator = ctx.string_or("separator", "\t")?;
            let (image, warnings) = ImageData::read_csv(Path::new(&filename), &separator, skip)?;
            for w in warnings {
                ctx.warn(w);
            }
            ctx.set_image("out", image);
            ctx.set_flags("flags", 0);
            Ok(())
        })
}

fn csvsave() -> OperationDefinition {
    OperationDefinition::new("csvsave")
        .description("save image to csv")
        .required_input("in", "VipsImage", 1)
        .required_input("filename", "gchararray", 2)
        .optional_input("separator", "gchararray", 13)
        .optional_input("keep", "VipsForeignKeep", 14)
        .nocache()
        .build(|ctx| {
            let filename = ctx.string("filename")?;
            let separator = ctx.string_or("separator", "\t")?;
            let _keep = ctx.flags_or("keep", 31)?;
            let bands = ctx.image("in")?.bands;
            if bands != 1 {
                ctx.warn(format!("saving band 0 of {}", bands));
            }
            ctx.image("in")?.write_csv(Path::new(&filename), &separator)
        })
}

//! Pixel storage for the reference library
//!
//! Images are held fully decoded as `f64` samples in band-interleaved,
//! row-major order. The declared [`BandFormat`] only matters at the memory
//! boundary (packing and unpacking) and when an operation clips its output.

use std::fmt::Write as _;
use std::path::Path;

use vipsbridge_sdk::BandFormat;

/// A decoded image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
    /// Samples per pixel
    pub bands: i32,
    /// Declared sample format
    pub format: BandFormat,
    /// `width * height * bands` samples
    pub pixels: Vec<f64>,
}

impl ImageData {
    /// All-zero image
    pub fn new(width: i32, height: i32, bands: i32, format: BandFormat) -> Self {
        let len = (width.max(0) * height.max(0) * bands.max(0)) as usize;
        Self {
            width,
            height,
            bands,
            format,
            pixels: vec![0.0; len],
        }
    }

    /// Image with every sample set to `value`
    pub fn filled(width: i32, height: i32, bands: i32, format: BandFormat, value: f64) -> Self {
        let mut image = Self::new(width, height, bands, format);
        image.pixels.iter_mut().for_each(|p| *p = value);
        image
    }

    #[inline]
    fn index(&self, x: i32, y: i32, band: i32) -> usize {
        ((y * self.width + x) * self.bands + band) as usize
    }

    /// Whether `(x, y)` lies inside the image
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    /// Read one sample
    pub fn get(&self, x: i32, y: i32, band: i32) -> f64 {
        self.pixels[self.index(x, y, band)]
    }

    /// Write one sample, clipped to the image format
    pub fn set(&mut self, x: i32, y: i32, band: i32, value: f64) {
        let i = self.index(x, y, band);
        self.pixels[i] = clip(self.format, value);
    }

    /// All samples of one pixel
    pub fn pixel(&self, x: i32, y: i32) -> Vec<f64> {
        (0..self.bands).map(|b| self.get(x, y, b)).collect()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Whether the image has no samples
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Re-clip every sample to `format`
    pub fn cast(mut self, format: BandFormat) -> Self {
        self.format = format;
        for p in self.pixels.iter_mut() {
            *p = clip(format, *p);
        }
        self
    }

    /// Unpack raw memory in `format`
    pub fn from_bytes(
        data: &[u8],
        width: i32,
        height: i32,
        bands: i32,
        format: BandFormat,
    ) -> Result<Self, String> {
        if width <= 0 || height <= 0 || bands <= 0 {
            return Err(format!("bad image dimensions {}x{}x{}", width, height, bands));
        }
        if matches!(format, BandFormat::Complex | BandFormat::DpComplex) {
            return Err("complex formats are not supported".to_string());
        }
        let size = format.sizeof();
        let expected = (width * height * bands) as usize * size;
        if data.len() != expected {
            return Err(format!(
                "memory area too small --- should be {} bytes, you passed {}",
                expected,
                data.len()
            ));
        }

        let pixels = data
            .chunks_exact(size)
            .map(|c| match format {
                BandFormat::UChar => c[0] as f64,
                BandFormat::Char => c[0] as i8 as f64,
                BandFormat::UShort => u16::from_ne_bytes([c[0], c[1]]) as f64,
                BandFormat::Short => i16::from_ne_bytes([c[0], c[1]]) as f64,
                BandFormat::UInt => u32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64,
                BandFormat::Int => i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64,
                BandFormat::Float => f32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64,
                _ => f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]),
            })
            .collect();

        Ok(Self {
            width,
            height,
            bands,
            format,
            pixels,
        })
    }

    /// Pack samples into raw memory in the image's format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.format.sizeof());
        for &p in &self.pixels {
            match self.format {
                BandFormat::UChar => out.push(p as u8),
                BandFormat::Char => out.push(p as i8 as u8),
                BandFormat::UShort => out.extend_from_slice(&(p as u16).to_ne_bytes()),
                BandFormat::Short => out.extend_from_slice(&(p as i16).to_ne_bytes()),
                BandFormat::UInt => out.extend_from_slice(&(p as u32).to_ne_bytes()),
                BandFormat::Int => out.extend_from_slice(&(p as i32).to_ne_bytes()),
                BandFormat::Float => out.extend_from_slice(&(p as f32).to_ne_bytes()),
                _ => out.extend_from_slice(&p.to_ne_bytes()),
            }
        }
        out
    }

    /// Parse a CSV matrix, one row per line
    pub fn read_csv(path: &Path, separator: &str, skip: usize) -> Result<(Self, Vec<String>), String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("unable to open \"{}\": {}", path.display(), e))?;

        let mut warnings = Vec::new();
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for (lineno, line) in text.lines().enumerate().skip(skip) {
            if line.trim().is_empty() {
                continue;
            }
            let row = line
                .split(separator)
                .map(|cell| {
                    cell.trim().parse::<f64>().map_err(|_| {
                        format!("error parsing number, line {}, \"{}\"", lineno + 1, cell.trim())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(format!("\"{}\" contains no data", path.display()));
        }

        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        for (i, row) in rows.iter_mut().enumerate() {
            if row.len() < width {
                warnings.push(format!(
                    "line {} has {} columns, padding to {}",
                    i + 1 + skip,
                    row.len(),
                    width
                ));
                row.resize(width, 0.0);
            }
        }

        let height = rows.len() as i32;
        let image = Self {
            width: width as i32,
            height,
            bands: 1,
            format: BandFormat::Double,
            pixels: rows.into_iter().flatten().collect(),
        };
        Ok((image, warnings))
    }

    /// Write band 0 as a CSV matrix
    pub fn write_csv(&self, path: &Path, separator: &str) -> Result<(), String> {
        let mut text = String::new();
        for y in 0..self.height {
            for x in 0..self.width {
                if x > 0 {
                    text.push_str(separator);
                }
                let _ = write!(text, "{}", self.get(x, y, 0));
            }
            text.push('\n');
        }
        std::fs::write(path, text).map_err(|e| format!("unable to write \"{}\": {}", path.display(), e))
    }
}

/// Clip a sample to the representable range of `format`
pub fn clip(format: BandFormat, value: f64) -> f64 {
    let (lo, hi) = match format {
        BandFormat::UChar => (0.0, u8::MAX as f64),
        BandFormat::Char => (i8::MIN as f64, i8::MAX as f64),
        BandFormat::UShort => (0.0, u16::MAX as f64),
        BandFormat::Short => (i16::MIN as f64, i16::MAX as f64),
        BandFormat::UInt => (0.0, u32::MAX as f64),
        BandFormat::Int => (i32::MIN as f64, i32::MAX as f64),
        _ => return value,
    };
    value.round().clamp(lo, hi)
}

/// Format of `left op right` for arithmetic, following the usual widening
/// rules: two integer formats widen one step, anything with a float becomes
/// float or double.
pub fn widen(left: BandFormat, right: BandFormat) -> BandFormat {
    use BandFormat::*;
    if left == Double || right == Double {
        return Double;
    }
    if left == Float || right == Float {
        return Float;
    }
    let signed = matches!(left, Char | Short | Int) || matches!(right, Char | Short | Int);
    let size = left.sizeof().max(right.sizeof());
    match (size, signed) {
        (1, false) => UShort,
        (1, true) => Short,
        (2, false) => UInt,
        (2, true) => Int,
        (_, false) => UInt,
        (_, true) => Int,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip_ushort() {
        let src: Vec<u8> = [1u16, 500, 65535, 7]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let image = ImageData::from_bytes(&src, 2, 2, 1, BandFormat::UShort).unwrap();
        assert_eq!(image.get(1, 0, 0), 500.0);
        assert_eq!(image.to_bytes(), src);
    }

    #[test]
    fn test_from_bytes_rejects_short_buffer() {
        let err = ImageData::from_bytes(&[0u8; 3], 2, 2, 1, BandFormat::UChar).unwrap_err();
        assert!(err.contains("too small"));
    }

    #[test]
    fn test_clip_and_widen() {
        assert_eq!(clip(BandFormat::UChar, 300.0), 255.0);
        assert_eq!(clip(BandFormat::Char, -200.0), -128.0);
        assert_eq!(clip(BandFormat::Float, 1e9), 1e9);
        assert_eq!(widen(BandFormat::UChar, BandFormat::UChar), BandFormat::UShort);
        assert_eq!(widen(BandFormat::UChar, BandFormat::Char), BandFormat::Short);
        assert_eq!(widen(BandFormat::Int, BandFormat::Float), BandFormat::Float);
    }

    #[test]
    fn test_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        let mut image = ImageData::new(3, 2, 1, BandFormat::Double);
        image.set(2, 1, 0, 4.5);
        image.write_csv(&path, "\t").unwrap();

        let (back, warnings) = ImageData::read_csv(&path, "\t", 0).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(back, image);
    }

    #[test]
    fn test_csv_pads_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.csv");
        std::fs::write(&path, "1,2,3\n4\n").unwrap();
        let (image, warnings) = ImageData::read_csv(&path, ",", 0).unwrap();
        assert_eq!((image.width, image.height), (3, 2));
        assert_eq!(warnings.len(), 1);
        assert_eq!(image.get(2, 1, 0), 0.0);
    }
}

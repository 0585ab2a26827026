//! Format-specific encoders and the fallback chain between them.
//!
//! Each output format has an ordered list of encoders. The first one that
//! succeeds wins and its [`Technique`] tag is recorded; a failing encoder is
//! logged and the next one is tried.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, RgbImage};
use img_parts::jpeg::Jpeg;
use img_parts::webp::WebP;
use img_parts::{ImageEXIF, ImageICC};
use psdforge_core::{AppError, OutputFormat};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::OnceLock;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bound on a single external encoder run
pub const EXTERNAL_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// AVIF encoder speed for the optimizer (slowest accepted by ravif)
pub const AVIF_SPEED_OPTIMIZED: u8 = 1;
/// AVIF encoder speed for basic conversions
pub const AVIF_SPEED_BASIC: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    MozjpegCompression,
    BuiltinOptimizedJpeg,
    CwebpOptimization,
    BuiltinWebp,
    AvifOptimized,
    AvifBasic,
    FallbackBasic,
}

impl Technique {
    pub fn as_str(self) -> &'static str {
        match self {
            Technique::MozjpegCompression => "mozjpeg_compression",
            Technique::BuiltinOptimizedJpeg => "builtin_optimized_jpeg",
            Technique::CwebpOptimization => "cwebp_optimization",
            Technique::BuiltinWebp => "builtin_webp",
            Technique::AvifOptimized => "avif_optimized",
            Technique::AvifBasic => "avif_basic",
            Technique::FallbackBasic => "fallback_basic",
        }
    }
}

/// JPEG chroma subsampling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaSubsampling {
    /// 4:4:4
    None,
    /// 4:2:2
    Medium,
    /// 4:2:0
    High,
}

impl ChromaSubsampling {
    /// Subsampling tier for basic conversions: more aggressive at lower quality.
    pub fn for_quality(quality: u8) -> Self {
        if quality >= 90 {
            ChromaSubsampling::None
        } else if quality >= 75 {
            ChromaSubsampling::Medium
        } else {
            ChromaSubsampling::High
        }
    }

    fn chroma_pixel_size(self) -> (u8, u8) {
        match self {
            ChromaSubsampling::None => (1, 1),
            ChromaSubsampling::Medium => (2, 1),
            ChromaSubsampling::High => (2, 2),
        }
    }
}

/// Availability of external encoders on this host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalTools {
    /// `cjpeg` from mozjpeg
    pub mozjpeg: bool,
    /// `cwebp` from libwebp
    pub cwebp: bool,
}

impl ExternalTools {
    /// Probe once per process and cache the answer.
    pub fn detected() -> ExternalTools {
        static TOOLS: OnceLock<ExternalTools> = OnceLock::new();
        *TOOLS.get_or_init(|| {
            let tools = ExternalTools {
                mozjpeg: probe_cjpeg(),
                cwebp: probe_cwebp(),
            };
            tracing::info!(
                mozjpeg = tools.mozjpeg,
                cwebp = tools.cwebp,
                "External encoder availability"
            );
            tools
        })
    }

    /// In-process encoders only
    pub fn none() -> ExternalTools {
        ExternalTools::default()
    }
}

fn probe_cjpeg() -> bool {
    let mut cmd = Command::new("cjpeg");
    cmd.arg("-version");
    match run_with_timeout(cmd, VERSION_PROBE_TIMEOUT) {
        Ok(run) => run.stdout.to_lowercase().contains("mozjpeg") || run.stderr.to_lowercase().contains("mozjpeg"),
        Err(_) => false,
    }
}

fn probe_cwebp() -> bool {
    let mut cmd = Command::new("cwebp");
    cmd.arg("-version");
    matches!(run_with_timeout(cmd, VERSION_PROBE_TIMEOUT), Ok(run) if run.status.success())
}

#[derive(Debug)]
struct ToolRun {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Run `cmd` and kill it once `timeout` elapses. Both pipes are drained
/// while the child runs so a chatty tool cannot fill them and stall.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ToolRun> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn external encoder")?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("External encoder timed out after {:?}", timeout));
        }
        std::thread::sleep(Duration::from_millis(25));
    };

    Ok(ToolRun {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Encoded bytes plus the technique that produced them
#[derive(Debug, Clone)]
pub struct Encoded {
    pub data: Vec<u8>,
    pub technique: Technique,
}

/// Optimizer encode path: best available encoder first, falling back down the chain.
pub fn encode_optimized(
    img: &RgbImage,
    format: OutputFormat,
    quality: u8,
    tools: ExternalTools,
) -> Result<Encoded, AppError> {
    let mut attempts: Vec<Attempt<'_>> = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            if tools.mozjpeg {
                attempts.push((
                    Technique::MozjpegCompression,
                    Box::new(move || encode_with_cjpeg(img, quality)),
                ));
            }
            attempts.push((
                Technique::BuiltinOptimizedJpeg,
                Box::new(move || encode_jpeg(img, quality, ChromaSubsampling::High)),
            ));
        }
        OutputFormat::WebP => {
            if tools.cwebp {
                attempts.push((
                    Technique::CwebpOptimization,
                    Box::new(move || encode_with_cwebp(img, quality)),
                ));
            }
            attempts.push((Technique::BuiltinWebp, Box::new(move || encode_webp(img, quality))));
        }
        OutputFormat::Avif => {
            attempts.push((
                Technique::AvifOptimized,
                Box::new(move || encode_avif(img, quality, AVIF_SPEED_OPTIMIZED)),
            ));
        }
    }
    attempts.push((
        Technique::FallbackBasic,
        Box::new(move || encode_fallback(img, format, quality)),
    ));

    run_chain(format, attempts)
}

/// Basic encode path: the in-process encoder for the format, then the fallback.
pub fn encode_basic(img: &RgbImage, format: OutputFormat, quality: u8) -> Result<Encoded, AppError> {
    let primary: Attempt<'_> = match format {
        OutputFormat::Jpeg => (
            Technique::BuiltinOptimizedJpeg,
            Box::new(move || encode_jpeg(img, quality, ChromaSubsampling::for_quality(quality))),
        ),
        OutputFormat::WebP => (Technique::BuiltinWebp, Box::new(move || encode_webp(img, quality))),
        OutputFormat::Avif => (
            Technique::AvifBasic,
            Box::new(move || encode_avif(img, quality, AVIF_SPEED_BASIC)),
        ),
    };
    let fallback: Attempt<'_> = (
        Technique::FallbackBasic,
        Box::new(move || encode_fallback(img, format, quality)),
    );

    run_chain(format, vec![primary, fallback])
}

type Attempt<'a> = (Technique, Box<dyn Fn() -> Result<Vec<u8>> + 'a>);

fn run_chain(format: OutputFormat, attempts: Vec<Attempt<'_>>) -> Result<Encoded, AppError> {
    let mut last_error = None;
    for (technique, encode) in attempts {
        match encode() {
            Ok(data) if !data.is_empty() => return Ok(Encoded { data, technique }),
            Ok(_) => {
                tracing::warn!(technique = technique.as_str(), "Encoder produced no output");
                last_error = Some(format!("{} produced no output", technique.as_str()));
            }
            Err(e) => {
                tracing::warn!(technique = technique.as_str(), error = %e, "Encoder failed, trying next");
                last_error = Some(format!("{}: {}", technique.as_str(), e));
            }
        }
    }

    Err(AppError::EncodeFailure(format!(
        "All {} encoders failed (last error: {})",
        format,
        last_error.unwrap_or_else(|| "none attempted".to_string())
    )))
}

/// In-process mozjpeg: progressive, optimized Huffman coding, chosen subsampling.
pub fn encode_jpeg(img: &RgbImage, quality: u8, subsampling: ChromaSubsampling) -> Result<Vec<u8>> {
    let (width, height) = img.dimensions();

    // libjpeg errors unwind through mozjpeg; keep them inside this call
    let result = catch_unwind(AssertUnwindSafe(|| -> std::io::Result<Vec<u8>> {
        let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
        comp.set_size(width as usize, height as usize);
        comp.set_quality(quality as f32);
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);
        comp.set_chroma_sampling_pixel_sizes((1, 1), subsampling.chroma_pixel_size());

        let mut comp = comp.start_compress(Vec::new())?;
        comp.write_scanlines(img.as_raw())?;
        comp.finish()
    }));

    match result {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(anyhow!("mozjpeg failed: {}", e)),
        Err(_) => Err(anyhow!("mozjpeg panicked")),
    }
}

/// In-process libwebp at the slowest method.
pub fn encode_webp(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let (width, height) = img.dimensions();
    let encoder = webp::Encoder::from_rgb(img.as_raw(), width, height);

    match webp::WebPConfig::new() {
        Ok(mut config) => {
            config.quality = quality as f32;
            config.method = 6;
            config.lossless = 0;
            let memory = encoder
                .encode_advanced(&config)
                .map_err(|e| anyhow!("libwebp failed: {:?}", e))?;
            Ok(memory.to_vec())
        }
        Err(_) => Ok(encoder.encode(quality as f32).to_vec()),
    }
}

pub fn encode_avif(img: &RgbImage, quality: u8, speed: u8) -> Result<Vec<u8>> {
    let (width, height) = img.dimensions();
    let pixels: Vec<rgb::RGB8> = img
        .as_raw()
        .chunks_exact(3)
        .map(|chunk| rgb::RGB8::new(chunk[0], chunk[1], chunk[2]))
        .collect();
    let buffer = ravif::Img::new(pixels.as_slice(), width as usize, height as usize);

    let encoded = ravif::Encoder::new()
        .with_quality(quality as f32)
        .with_speed(speed)
        .encode_rgb(buffer)
        .map_err(|e| anyhow!("ravif failed: {}", e))?;

    Ok(encoded.avif_file)
}

/// Plain `image` crate encoders. No AVIF support is compiled in.
pub fn encode_fallback(img: &RgbImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(img.clone());
    match format {
        OutputFormat::Jpeg => {
            dynamic.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))?
        }
        OutputFormat::WebP => dynamic.write_with_encoder(WebPEncoder::new_lossless(&mut buffer))?,
        OutputFormat::Avif => return Err(anyhow!("No fallback AVIF encoder available")),
    }
    Ok(buffer)
}

fn encode_with_cjpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input.ppm");
    let output = dir.path().join("output.jpeg");
    write_ppm(img, &input)?;

    let mut cmd = Command::new("cjpeg");
    cmd.arg("-quality")
        .arg(quality.to_string())
        .arg("-optimize")
        .arg("-progressive")
        .arg("-outfile")
        .arg(&output)
        .arg(&input);
    read_tool_output(cmd, &output, "cjpeg")
}

fn encode_with_cwebp(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input.png");
    let output = dir.path().join("output.webp");
    img.save_with_format(&input, image::ImageFormat::Png)?;

    let mut cmd = Command::new("cwebp");
    cmd.arg("-q")
        .arg(quality.to_string())
        .args(["-m", "6", "-pass", "10", "-mt"])
        .arg(&input)
        .arg("-o")
        .arg(&output);
    read_tool_output(cmd, &output, "cwebp")
}

fn read_tool_output(cmd: Command, output: &Path, tool: &str) -> Result<Vec<u8>> {
    let run = run_with_timeout(cmd, EXTERNAL_TOOL_TIMEOUT)?;
    if !run.status.success() {
        return Err(anyhow!("{} exited with {}: {}", tool, run.status, run.stderr.trim()));
    }
    std::fs::read(output).with_context(|| format!("{} produced no output file", tool))
}

fn write_ppm(img: &RgbImage, path: &Path) -> Result<()> {
    let (width, height) = img.dimensions();
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    write!(file, "P6\n{} {}\n255\n", width, height)?;
    file.write_all(img.as_raw())?;
    file.flush()?;
    Ok(())
}

/// Drop EXIF and ICC segments from an encoded JPEG or WebP. Other data is returned as is.
pub fn strip_metadata(data: Vec<u8>, format: OutputFormat) -> Vec<u8> {
    match format {
        OutputFormat::Jpeg => match Jpeg::from_bytes(data.clone().into()) {
            Ok(mut jpeg) => {
                jpeg.set_exif(None);
                jpeg.set_icc_profile(None);
                jpeg.encoder().bytes().to_vec()
            }
            Err(_) => data,
        },
        OutputFormat::WebP => match WebP::from_bytes(data.clone().into()) {
            Ok(mut webp) => {
                webp.set_exif(None);
                webp.set_icc_profile(None);
                webp.encoder().bytes().to_vec()
            }
            Err(_) => data,
        },
        OutputFormat::Avif => data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::rgb_image;

    fn sample() -> RgbImage {
        rgb_image(64, 48, |x, y| [(x * 4) as u8, (y * 5) as u8, 128])
    }

    #[test]
    fn test_subsampling_tiers() {
        assert_eq!(ChromaSubsampling::for_quality(95), ChromaSubsampling::None);
        assert_eq!(ChromaSubsampling::for_quality(90), ChromaSubsampling::None);
        assert_eq!(ChromaSubsampling::for_quality(80), ChromaSubsampling::Medium);
        assert_eq!(ChromaSubsampling::for_quality(74), ChromaSubsampling::High);
    }

    #[test]
    fn test_technique_tags() {
        assert_eq!(Technique::MozjpegCompression.as_str(), "mozjpeg_compression");
        assert_eq!(Technique::CwebpOptimization.as_str(), "cwebp_optimization");
        assert_eq!(Technique::FallbackBasic.as_str(), "fallback_basic");
    }

    #[test]
    fn test_optimized_jpeg_without_external_tools() {
        let encoded = encode_optimized(&sample(), OutputFormat::Jpeg, 75, ExternalTools::none()).unwrap();
        assert_eq!(encoded.technique, Technique::BuiltinOptimizedJpeg);
        assert_eq!(&encoded.data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_optimized_webp() {
        let encoded = encode_optimized(&sample(), OutputFormat::WebP, 70, ExternalTools::none()).unwrap();
        assert_eq!(encoded.technique, Technique::BuiltinWebp);
        assert_eq!(&encoded.data[..4], b"RIFF");
    }

    #[test]
    fn test_basic_avif() {
        let encoded = encode_basic(&sample(), OutputFormat::Avif, 60).unwrap();
        assert_eq!(encoded.technique, Technique::AvifBasic);
        assert!(!encoded.data.is_empty());
    }

    #[test]
    fn test_fallback_encoders() {
        let jpeg = encode_fallback(&sample(), OutputFormat::Jpeg, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(encode_fallback(&sample(), OutputFormat::Avif, 80).is_err());
    }

    #[test]
    fn test_strip_metadata_keeps_decodable_jpeg() {
        let jpeg = encode_jpeg(&sample(), 80, ChromaSubsampling::High).unwrap();
        let stripped = strip_metadata(jpeg, OutputFormat::Jpeg);
        let decoded = image::load_from_memory(&stripped).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_output_larger_than_pipe_buffer() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "head -c 262144 /dev/zero | tr '\\0' x; echo done >&2"]);
        let started = Instant::now();
        let run = run_with_timeout(cmd, Duration::from_secs(10)).unwrap();
        assert!(run.status.success());
        assert_eq!(run.stdout.len(), 262_144);
        assert_eq!(run.stderr.trim(), "done");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_timeout_kills_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let err = run_with_timeout(cmd, Duration::from_millis(200)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_strip_metadata_passes_through_unknown_data() {
        let data = b"not an image".to_vec();
        assert_eq!(strip_metadata(data.clone(), OutputFormat::Jpeg), data);
    }
}

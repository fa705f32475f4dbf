//! YUV4MPEG2 (Y4M) planar stream reader and writer.
//!
//! Stream layout: one ASCII header line
//! `YUV4MPEG2 W<w> H<h> F<num>:<den> I<p|t|b|m> [A<n>:<d>] [C<tag>] [X<ext>]`,
//! then for every frame a `FRAME` line followed by exactly `w*h*3/2` bytes of
//! 4:2:0 planar data (Y plane, then U, then V). Reader and writer never seek, so
//! pipes and stdio work as well as files.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::UpscaleError;

pub const Y4M_MAGIC: &str = "YUV4MPEG2";
const FRAME_MARKER: &str = "FRAME";
const MAX_HEADER_LINE: usize = 4096;
/// Largest accepted side; keeps `frame_size` far from overflow.
pub const MAX_DIMENSION: usize = 16384;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Y4mHeader {
    pub width: usize,
    pub height: usize,
    pub fps_num: u32,
    pub fps_den: u32,
    pub interlace: char,
    pub chroma: String,
}

impl Y4mHeader {
    pub fn new(width: usize, height: usize, fps_num: u32, fps_den: u32) -> Self {
        Self {
            width,
            height,
            fps_num,
            fps_den,
            interlace: 'p',
            chroma: "420".to_string(),
        }
    }

    pub fn with_fps(width: usize, height: usize, fps: f64) -> Self {
        let (num, den) = fps_to_rational(fps);
        Self::new(width, height, num, den)
    }

    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            self.fps_num as f64 / self.fps_den as f64
        }
    }

    pub fn frame_size(&self) -> usize {
        planar_frame_size(self.width, self.height)
    }

    /// Same rate and chroma, new dimensions.
    pub fn scaled(&self, scale: usize) -> Self {
        Self {
            width: self.width * scale,
            height: self.height * scale,
            ..self.clone()
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{Y4M_MAGIC} W{} H{} F{}:{} I{} C{}\n",
            self.width, self.height, self.fps_num, self.fps_den, self.interlace, self.chroma
        )
    }

    pub fn parse(line: &str) -> std::result::Result<Self, UpscaleError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());

        match tokens.next() {
            Some(Y4M_MAGIC) => {}
            other => {
                return Err(UpscaleError::format(format!(
                    "expected '{Y4M_MAGIC}' magic, found {:?}",
                    other.unwrap_or("")
                )))
            }
        }

        let mut width = None;
        let mut height = None;
        let mut rate = None;
        let mut interlace = 'p';
        let mut chroma = "420".to_string();

        for token in tokens {
            let mut chars = token.chars();
            let Some(tag) = chars.next() else {
                continue;
            };
            let value = chars.as_str();
            match tag {
                'W' => width = Some(parse_dimension(value, "width")?),
                'H' => height = Some(parse_dimension(value, "height")?),
                'F' => rate = Some(parse_ratio(value)?),
                'I' => interlace = value.chars().next().unwrap_or('p'),
                'C' => chroma = value.to_string(),
                // A (aspect) and X (extensions) carry nothing the pipeline uses.
                _ => {}
            }
        }

        if !chroma.starts_with("420") {
            return Err(UpscaleError::format(format!(
                "unsupported chroma subsampling 'C{chroma}', only 4:2:0 is supported"
            )));
        }

        let width = width.ok_or_else(|| UpscaleError::format("header is missing W"))?;
        let height = height.ok_or_else(|| UpscaleError::format("header is missing H"))?;
        let (fps_num, fps_den) = rate.ok_or_else(|| UpscaleError::format("header is missing F"))?;
        if width % 2 != 0 || height % 2 != 0 {
            return Err(UpscaleError::format(format!(
                "4:2:0 stream needs even dimensions, got {width}x{height}"
            )));
        }

        Ok(Self {
            width,
            height,
            fps_num,
            fps_den,
            interlace,
            chroma,
        })
    }
}

pub fn planar_frame_size(width: usize, height: usize) -> usize {
    width * height * 3 / 2
}

/// Integral rates become `n:1`; anything else is approximated on a 1001 base
/// (29.97 -> 30000:1001).
pub fn fps_to_rational(fps: f64) -> (u32, u32) {
    if fps.fract() == 0.0 {
        (fps as u32, 1)
    } else {
        ((fps * 1001.0).round() as u32, 1001)
    }
}

fn parse_dimension(value: &str, what: &str) -> std::result::Result<usize, UpscaleError> {
    match value.parse::<usize>() {
        Ok(v) if (1..=MAX_DIMENSION).contains(&v) => Ok(v),
        Ok(v) => Err(UpscaleError::format(format!(
            "{what} {v} is outside 1..={MAX_DIMENSION}"
        ))),
        Err(_) => Err(UpscaleError::format(format!("invalid {what} '{value}'"))),
    }
}

fn parse_ratio(value: &str) -> std::result::Result<(u32, u32), UpscaleError> {
    let parsed = match value.split_once(':') {
        Some((num, den)) => num.parse::<u32>().ok().zip(den.parse::<u32>().ok()),
        None => value.parse::<u32>().ok().map(|num| (num, 1)),
    };
    match parsed {
        Some((num, den)) if den > 0 => Ok((num, den)),
        _ => Err(UpscaleError::format(format!("invalid frame rate '{value}'"))),
    }
}

pub struct Y4mReader<R: Read> {
    inner: BufReader<R>,
    header: Option<Y4mHeader>,
    frames_read: u64,
}

impl<R: Read> Y4mReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            header: None,
            frames_read: 0,
        }
    }

    pub fn header(&self) -> Option<&Y4mHeader> {
        self.header.as_ref()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn read_header(&mut self) -> Result<Y4mHeader> {
        let line = match read_line_bounded(&mut self.inner)? {
            LineRead::Complete(line) => line,
            LineRead::Partial(_) | LineRead::Eof => {
                return Err(UpscaleError::format("stream ended before the Y4M header").into())
            }
        };
        let header = Y4mHeader::parse(&line)?;
        debug!(
            width = header.width,
            height = header.height,
            fps = header.fps(),
            "Parsed Y4M header"
        );
        self.header = Some(header.clone());
        Ok(header)
    }

    /// Next frame's planar bytes, or `None` once the stream ends. A frame cut
    /// short by the producer is treated as end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let frame_size = self
            .header
            .as_ref()
            .map(Y4mHeader::frame_size)
            .context("read_header must be called before read_frame")?;

        let marker = match read_line_bounded(&mut self.inner)? {
            LineRead::Complete(line) => line,
            LineRead::Eof => return Ok(None),
            LineRead::Partial(partial) => {
                warn!(bytes = partial.len(), "Y4M stream ended inside a FRAME marker");
                return Ok(None);
            }
        };
        if !marker.starts_with(FRAME_MARKER) {
            return Err(UpscaleError::format(format!(
                "expected FRAME marker before frame {}, found {:?}",
                self.frames_read + 1,
                marker.chars().take(32).collect::<String>()
            ))
            .into());
        }

        let mut buf = vec![0u8; frame_size];
        let filled = read_full(&mut self.inner, &mut buf)?;
        if filled < frame_size {
            warn!(
                "partial frame at EOF ({filled}/{frame_size} bytes), discarding"
            );
            return Ok(None);
        }

        self.frames_read += 1;
        Ok(Some(buf))
    }
}

impl<R: Read> Iterator for Y4mReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}

pub struct Y4mWriter<W: Write> {
    inner: W,
    header: Y4mHeader,
    header_written: bool,
    frames_written: u64,
}

impl<W: Write> Y4mWriter<W> {
    pub fn new(inner: W, header: Y4mHeader) -> Result<Self> {
        if header.width % 2 != 0 || header.height % 2 != 0 {
            return Err(UpscaleError::format(format!(
                "4:2:0 output needs even dimensions, got {}x{}",
                header.width, header.height
            ))
            .into());
        }
        Ok(Self {
            inner,
            header,
            header_written: false,
            frames_written: 0,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Writes the stream header once; later calls do nothing.
    pub fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.inner
            .write_all(self.header.to_line().as_bytes())
            .context("failed to write Y4M header")?;
        self.header_written = true;
        Ok(())
    }

    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if !self.header_written {
            anyhow::bail!("write_header must be called before write_frame");
        }
        let expected = self.header.frame_size();
        if data.len() != expected {
            return Err(UpscaleError::format(format!(
                "frame size mismatch: expected {expected} bytes, got {}",
                data.len()
            ))
            .into());
        }
        self.inner
            .write_all(b"FRAME\n")
            .and_then(|_| self.inner.write_all(data))
            .with_context(|| format!("failed to write frame {}", self.frames_written + 1))?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush().context("failed to flush Y4M output")
    }

    pub fn into_inner(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.inner)
    }
}

enum LineRead {
    Complete(String),
    Partial(Vec<u8>),
    Eof,
}

fn read_line_bounded<R: BufRead>(reader: &mut R) -> Result<LineRead> {
    let mut line = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_HEADER_LINE as u64)
        .read_until(b'\n', &mut line)
        .context("failed to read Y4M line")?;

    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if line.last() != Some(&b'\n') {
        if line.len() >= MAX_HEADER_LINE {
            return Err(UpscaleError::format("Y4M header line exceeds 4096 bytes").into());
        }
        return Ok(LineRead::Partial(line));
    }
    line.pop();
    Ok(LineRead::Complete(String::from_utf8_lossy(&line).into_owned()))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("failed to read Y4M frame data"),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::error::find_upscale_error;

    fn encode(header: &Y4mHeader, frames: &[Vec<u8>]) -> Vec<u8> {
        let mut writer = Y4mWriter::new(Vec::new(), header.clone()).expect("writer");
        writer.write_header().expect("header");
        for frame in frames {
            writer.write_frame(frame).expect("frame");
        }
        writer.into_inner().expect("inner")
    }

    #[test]
    fn writes_then_reads_frames_with_same_geometry() {
        let header = Y4mHeader::with_fps(8, 6, 25.0);
        let frames: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; header.frame_size()]).collect();
        let bytes = encode(&header, &frames);

        let mut reader = Y4mReader::new(Cursor::new(bytes));
        let parsed = reader.read_header().expect("header");
        assert_eq!(parsed.width, 8);
        assert_eq!(parsed.height, 6);
        assert_eq!(parsed.fps(), 25.0);

        let read: Vec<Vec<u8>> = reader.by_ref().map(|f| f.expect("frame")).collect();
        assert_eq!(read, frames);
        assert_eq!(reader.frames_read(), 3);
    }

    #[test]
    fn header_line_format() {
        let header = Y4mHeader::with_fps(1920, 1080, 30.0);
        assert_eq!(header.to_line(), "YUV4MPEG2 W1920 H1080 F30:1 Ip C420\n");
    }

    #[test]
    fn fractional_rates_use_1001_base() {
        assert_eq!(fps_to_rational(29.97), (30000, 1001));
        assert_eq!(fps_to_rational(23.976), (24000, 1001));
        assert_eq!(fps_to_rational(24.0), (24, 1));
    }

    #[test]
    fn parses_header_with_optional_fields() {
        let header =
            Y4mHeader::parse("YUV4MPEG2 W640 H360 F30000:1001 It A1:1 C420jpeg XYSCSS=420JPEG")
                .expect("parse");
        assert_eq!(header.width, 640);
        assert_eq!(header.height, 360);
        assert_eq!((header.fps_num, header.fps_den), (30000, 1001));
        assert_eq!(header.interlace, 't');
        assert_eq!(header.chroma, "420jpeg");
    }

    #[test]
    fn bad_magic_is_format_error() {
        let mut reader = Y4mReader::new(Cursor::new(b"RIFF W2 H2 F1:1\n".to_vec()));
        let err = reader.read_header().unwrap_err();
        assert!(matches!(
            find_upscale_error(&err),
            Some(UpscaleError::Format(_))
        ));
    }

    fn assert_format_error(line: &str) {
        match Y4mHeader::parse(line) {
            Err(UpscaleError::Format(_)) => {}
            other => panic!("expected a format error for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn non_ascii_token_is_format_error() {
        assert_format_error("YUV4MPEG2 W4 H4 F25:1 \u{e9}x C\u{e9}");
        let header =
            Y4mHeader::parse("YUV4MPEG2 W4 H4 F25:1 \u{e9}x").expect("unknown tag skipped");
        assert_eq!((header.width, header.height), (4, 4));
        assert_format_error("YUV4MPEG2 W\u{e9} H4 F25:1");
    }

    #[test]
    fn oversized_dimensions_are_rejected_before_allocating() {
        assert_format_error("YUV4MPEG2 W9999999999 H9999999999 F25:1");
        assert_format_error("YUV4MPEG2 W16386 H2 F25:1");
        assert!(Y4mHeader::parse("YUV4MPEG2 W16384 H16384 F25:1").is_ok());

        let mut reader = Y4mReader::new(Cursor::new(
            b"YUV4MPEG2 W99999999999999 H99999999999999 F1:1\nFRAME\n".to_vec(),
        ));
        let err = reader.read_header().unwrap_err();
        assert!(matches!(find_upscale_error(&err), Some(UpscaleError::Format(_))));
        assert!(reader.read_frame().is_err());
    }

    #[test]
    fn odd_input_dimensions_are_rejected() {
        assert_format_error("YUV4MPEG2 W5 H4 F25:1");
        assert_format_error("YUV4MPEG2 W4 H3 F25:1");
    }

    #[test]
    fn non_420_chroma_is_rejected() {
        let err = Y4mHeader::parse("YUV4MPEG2 W4 H4 F25:1 C444").unwrap_err();
        assert!(err.to_string().contains("4:2:0"));
    }

    #[test]
    fn truncated_frame_ends_stream() {
        let header = Y4mHeader::with_fps(4, 4, 24.0);
        let mut bytes = encode(&header, &[vec![7u8; header.frame_size()]]);
        bytes.extend_from_slice(b"FRAME\n");
        bytes.extend_from_slice(&[1, 2, 3]);

        let mut reader = Y4mReader::new(Cursor::new(bytes));
        reader.read_header().expect("header");
        assert!(reader.read_frame().expect("first").is_some());
        assert!(reader.read_frame().expect("second").is_none());
    }

    #[test]
    fn frame_marker_parameters_are_ignored() {
        let mut bytes = b"YUV4MPEG2 W2 H2 F1:1 Ip C420\nFRAME Ixyz\n".to_vec();
        bytes.extend_from_slice(&[9u8; 6]);
        let mut reader = Y4mReader::new(Cursor::new(bytes));
        reader.read_header().expect("header");
        assert_eq!(reader.read_frame().expect("frame"), Some(vec![9u8; 6]));
    }

    #[test]
    fn garbage_marker_is_format_error() {
        let mut bytes = b"YUV4MPEG2 W2 H2 F1:1\nFRAMX\n".to_vec();
        bytes.extend_from_slice(&[0u8; 6]);
        let mut reader = Y4mReader::new(Cursor::new(bytes));
        reader.read_header().expect("header");
        assert!(reader.read_frame().is_err());
    }

    #[test]
    fn write_header_is_idempotent() {
        let header = Y4mHeader::with_fps(2, 2, 10.0);
        let mut writer = Y4mWriter::new(Vec::new(), header.clone()).expect("writer");
        writer.write_header().expect("first");
        writer.write_header().expect("second");
        let bytes = writer.into_inner().expect("inner");
        assert_eq!(bytes, header.to_line().into_bytes());
    }

    #[test]
    fn write_frame_requires_header_and_exact_size() {
        let header = Y4mHeader::with_fps(2, 2, 10.0);
        let mut writer = Y4mWriter::new(Vec::new(), header).expect("writer");
        assert!(writer.write_frame(&[0u8; 6]).is_err());
        writer.write_header().expect("header");
        assert!(writer.write_frame(&[0u8; 5]).is_err());
        writer.write_frame(&[0u8; 6]).expect("exact size");
        assert_eq!(writer.frames_written(), 1);
    }

    #[test]
    fn odd_output_dimensions_are_rejected() {
        assert!(Y4mWriter::new(Vec::new(), Y4mHeader::with_fps(3, 2, 10.0)).is_err());
    }
}

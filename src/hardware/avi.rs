//! Uncompressed grayscale AVI writer.
//!
//! Per-cycle recordings are stored as RIFF AVI files with a single 8-bit
//! palettized DIB video stream (`00db` chunks) and an `idx1` index, which
//! every common player and analysis toolkit reads without codecs.
//!
//! Frame count dependent header fields are written as placeholders and patched
//! by [`AviWriter::finish`]. A file that was never finished is not playable,
//! which is acceptable because unfinished recordings are always discarded.
//!
//! RIFF sizes and index offsets are 32-bit. A frame that would push the file
//! past that limit is refused, which fails the recording instead of writing
//! a file whose header no longer describes it.

use super::Frame;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const PALETTE_ENTRIES: u32 = 256;
/// Largest RIFF size field (file length minus 8).
const RIFF_LIMIT: u64 = u32::MAX as u64;

/// Streaming writer for one recording.
pub struct AviWriter {
    out: BufWriter<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    stride: usize,
    /// (offset relative to the `movi` fourcc, chunk payload size)
    index: Vec<(u32, u32)>,
    position: u64,
    riff_size_pos: u64,
    total_frames_pos: u64,
    stream_length_pos: u64,
    movi_size_pos: u64,
    movi_fourcc_pos: u64,
    size_limit: u64,
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn patch_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

impl AviWriter {
    /// Create the file and write the stream headers.
    pub fn create<P: AsRef<Path>>(path: P, width: u32, height: u32, fps: f64) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("Invalid AVI geometry {}x{}", width, height);
        }
        if !(fps.is_finite() && fps > 0.0) {
            bail!("Invalid AVI frame rate {}", fps);
        }
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create recording {:?}", path))?;

        let stride = (width as usize).div_ceil(4) * 4;
        let frame_bytes = (stride * height as usize) as u32;
        let micros_per_frame = (1_000_000.0 / fps).round() as u32;
        let rate_milli = (fps * 1000.0).round() as u32;

        let mut h: Vec<u8> = Vec::with_capacity(2048);
        h.extend_from_slice(b"RIFF");
        let riff_size_pos = h.len();
        push_u32(&mut h, 0);
        h.extend_from_slice(b"AVI ");

        h.extend_from_slice(b"LIST");
        let hdrl_size_pos = h.len();
        push_u32(&mut h, 0);
        h.extend_from_slice(b"hdrl");

        // Main header
        h.extend_from_slice(b"avih");
        push_u32(&mut h, 56);
        push_u32(&mut h, micros_per_frame);
        push_u32(&mut h, (frame_bytes as f64 * fps).min(f64::from(u32::MAX)) as u32);
        push_u32(&mut h, 0); // padding granularity
        push_u32(&mut h, AVIF_HASINDEX);
        let total_frames_pos = h.len();
        push_u32(&mut h, 0);
        push_u32(&mut h, 0); // initial frames
        push_u32(&mut h, 1); // streams
        push_u32(&mut h, frame_bytes + 8);
        push_u32(&mut h, width);
        push_u32(&mut h, height);
        for _ in 0..4 {
            push_u32(&mut h, 0);
        }

        h.extend_from_slice(b"LIST");
        let strl_size_pos = h.len();
        push_u32(&mut h, 0);
        h.extend_from_slice(b"strl");

        // Stream header
        h.extend_from_slice(b"strh");
        push_u32(&mut h, 56);
        h.extend_from_slice(b"vids");
        h.extend_from_slice(b"DIB ");
        push_u32(&mut h, 0); // flags
        push_u16(&mut h, 0); // priority
        push_u16(&mut h, 0); // language
        push_u32(&mut h, 0); // initial frames
        push_u32(&mut h, 1000); // scale
        push_u32(&mut h, rate_milli);
        push_u32(&mut h, 0); // start
        let stream_length_pos = h.len();
        push_u32(&mut h, 0);
        push_u32(&mut h, frame_bytes);
        push_u32(&mut h, u32::MAX); // default quality
        push_u32(&mut h, 0); // sample size
        push_u16(&mut h, 0);
        push_u16(&mut h, 0);
        push_u16(&mut h, width.min(u32::from(u16::MAX)) as u16);
        push_u16(&mut h, height.min(u32::from(u16::MAX)) as u16);

        // Stream format: BITMAPINFOHEADER + gray palette
        h.extend_from_slice(b"strf");
        push_u32(&mut h, 40 + 4 * PALETTE_ENTRIES);
        push_u32(&mut h, 40);
        push_u32(&mut h, width);
        push_u32(&mut h, height); // positive height: rows stored bottom-up
        push_u16(&mut h, 1);
        push_u16(&mut h, 8);
        push_u32(&mut h, 0); // BI_RGB
        push_u32(&mut h, frame_bytes);
        push_u32(&mut h, 0);
        push_u32(&mut h, 0);
        push_u32(&mut h, PALETTE_ENTRIES);
        push_u32(&mut h, 0);
        for level in 0..PALETTE_ENTRIES {
            let v = level as u8;
            h.extend_from_slice(&[v, v, v, 0]);
        }

        let strl_size = (h.len() - strl_size_pos - 4) as u32;
        patch_u32(&mut h, strl_size_pos, strl_size);
        let hdrl_size = (h.len() - hdrl_size_pos - 4) as u32;
        patch_u32(&mut h, hdrl_size_pos, hdrl_size);

        h.extend_from_slice(b"LIST");
        let movi_size_pos = h.len();
        push_u32(&mut h, 0);
        let movi_fourcc_pos = h.len();
        h.extend_from_slice(b"movi");

        let mut out = BufWriter::new(file);
        out.write_all(&h)
            .with_context(|| format!("Failed to write AVI header to {:?}", path))?;

        Ok(Self {
            out,
            path,
            width,
            height,
            stride,
            index: Vec::new(),
            position: h.len() as u64,
            riff_size_pos: riff_size_pos as u64,
            total_frames_pos: total_frames_pos as u64,
            stream_length_pos: stream_length_pos as u64,
            movi_size_pos: movi_size_pos as u64,
            movi_fourcc_pos: movi_fourcc_pos as u64,
            size_limit: RIFF_LIMIT,
        })
    }

    /// Append one frame. Geometry must match the header.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            bail!(
                "Frame {} is {}x{}, recording expects {}x{}",
                frame.index,
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }
        if frame.data.len() != frame.expected_len() {
            bail!(
                "Frame {} holds {} bytes, expected {}",
                frame.index,
                frame.data.len(),
                frame.expected_len()
            );
        }

        let pixels = frame.to_mono8();
        let width = self.width as usize;
        let size = self.stride * self.height as usize;
        let mut chunk = Vec::with_capacity(size + 8);
        chunk.extend_from_slice(b"00db");
        push_u32(&mut chunk, size as u32);
        for row in pixels.chunks_exact(width).rev() {
            chunk.extend_from_slice(row);
            chunk.resize(chunk.len() + self.stride - width, 0);
        }

        // The RIFF size must still cover this chunk plus the index entry for it
        let index_len = 8 + 16 * (self.index.len() as u64 + 1);
        let riff_size = self.position + chunk.len() as u64 + index_len - 8;
        if riff_size > self.size_limit {
            bail!(
                "Recording {:?} would exceed the {} byte AVI limit after {} frames",
                self.path,
                self.size_limit,
                self.index.len()
            );
        }
        let offset = u32::try_from(self.position - self.movi_fourcc_pos)
            .context("AVI chunk offset exceeds 32 bits")?;
        self.out
            .write_all(&chunk)
            .with_context(|| format!("Failed to write frame to {:?}", self.path))?;
        self.index.push((offset, size as u32));
        self.position += chunk.len() as u64;
        Ok(())
    }

    /// Frames written so far.
    pub fn frame_count(&self) -> u32 {
        self.index.len() as u32
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the index, patch the header and close the file.
    ///
    /// Returns the number of frames in the file.
    pub fn finish(mut self) -> Result<u32> {
        let movi_size = u32::try_from(self.position - self.movi_size_pos - 4)
            .context("AVI movi list exceeds 32 bits")?;

        let mut idx = Vec::with_capacity(8 + 16 * self.index.len());
        idx.extend_from_slice(b"idx1");
        push_u32(&mut idx, 16 * self.index.len() as u32);
        for (offset, size) in &self.index {
            idx.extend_from_slice(b"00db");
            push_u32(&mut idx, AVIIF_KEYFRAME);
            push_u32(&mut idx, *offset);
            push_u32(&mut idx, *size);
        }
        self.out.write_all(&idx)?;
        self.position += idx.len() as u64;

        let frames = self.frame_count();
        let riff_size =
            u32::try_from(self.position - 8).context("AVI file exceeds the RIFF size limit")?;
        let mut file = self
            .out
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("Failed to flush recording {:?}", self.path))?;

        for (pos, value) in [
            (self.riff_size_pos, riff_size),
            (self.total_frames_pos, frames),
            (self.stream_length_pos, frames),
            (self.movi_size_pos, movi_size),
        ] {
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&value.to_le_bytes())?;
        }
        file.sync_all()
            .with_context(|| format!("Failed to sync recording {:?}", self.path))?;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    fn find(bytes: &[u8], needle: &[u8]) -> usize {
        bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap()
    }

    #[test]
    fn writes_playable_structure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut writer = AviWriter::create(&path, 5, 3, 100.0).unwrap();
        for i in 0..3u64 {
            let data: Vec<u8> = (0..15).map(|p| p as u8 + i as u8).collect();
            let frame = Frame::from_u8(i, Duration::from_millis(i * 10), 5, 3, data);
            writer.write_frame(&frame).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);

        let avih = find(&bytes, b"avih");
        assert_eq!(read_u32(&bytes, avih + 8), 10_000); // us per frame
        assert_eq!(read_u32(&bytes, avih + 24), 3); // total frames

        let strh = find(&bytes, b"strh");
        assert_eq!(read_u32(&bytes, strh + 40), 3); // stream length

        let idx1 = find(&bytes, b"idx1");
        assert_eq!(read_u32(&bytes, idx1 + 4), 48);

        // First frame is stored bottom-up with a 4-byte aligned stride of 8
        let chunk = find(&bytes, b"00db");
        assert_eq!(read_u32(&bytes, chunk + 4), 24);
        let payload = &bytes[chunk + 8..chunk + 8 + 24];
        assert_eq!(&payload[0..5], &[10, 11, 12, 13, 14]);
        assert_eq!(&payload[5..8], &[0, 0, 0]);
        assert_eq!(&payload[16..21], &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn rejects_mismatched_geometry() {
        let dir = tempdir().unwrap();
        let mut writer = AviWriter::create(dir.path().join("bad.avi"), 4, 4, 30.0).unwrap();
        let frame = Frame::from_u8(0, Duration::ZERO, 2, 2, vec![0; 4]);
        assert!(writer.write_frame(&frame).is_err());
        assert_eq!(writer.frame_count(), 0);
    }

    #[test]
    fn rejects_oversized_frame_data() {
        let dir = tempdir().unwrap();
        let mut writer = AviWriter::create(dir.path().join("long.avi"), 4, 4, 30.0).unwrap();
        let frame = Frame::from_u8(0, Duration::ZERO, 4, 4, vec![0; 20]);
        let err = writer.write_frame(&frame).unwrap_err();
        assert!(err.to_string().contains("20 bytes"));
        assert_eq!(writer.frame_count(), 0);
    }

    #[test]
    fn refuses_frames_past_the_riff_limit() {
        let dir = tempdir().unwrap();
        let mut writer = AviWriter::create(dir.path().join("full.avi"), 4, 4, 30.0).unwrap();
        // Header plus two 24-byte chunks and their index entries, not three
        writer.size_limit = writer.position + 2 * (24 + 16) + 8;
        let frame = |i| Frame::from_u8(i, Duration::ZERO, 4, 4, vec![7; 16]);

        writer.write_frame(&frame(0)).unwrap();
        writer.write_frame(&frame(1)).unwrap();
        let err = writer.write_frame(&frame(2)).unwrap_err();
        assert!(err.to_string().contains("AVI limit"));
        assert_eq!(writer.frame_count(), 2);
        assert_eq!(writer.finish().unwrap(), 2);
    }
}

//! Page boundary detection in a concatenated image stream.
//!
//! Ghostscript writes every page to stdout back to back with no separator,
//! so boundaries are found by walking each image's own structure:
//!
//! * **PNG**: 8-byte signature, then length-prefixed chunks up to and
//!   including `IEND`. Chunk payloads are copied without inspection.
//! * **JPEG**: `SOI`, length-prefixed marker segments, and entropy-coded
//!   scan data (where `0xFF00` stuffing and `RSTn` markers are data) up to
//!   and including `EOI`.
//!
//! Bytes are forwarded to the sink as they are read through a fixed-size
//! buffer, so memory use does not depend on page size.

use crate::cancel::Interrupt;
use crate::config::Framing;
use crate::error::ThumbnailError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub(crate) const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
pub(crate) const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

const PNG_MAX_CHUNK: u32 = 0x7FFF_FFFF;

const JPEG_EOI: u8 = 0xD9;
const JPEG_SOS: u8 = 0xDA;
const JPEG_TEM: u8 = 0x01;

fn truncated(page: usize) -> ThumbnailError {
    ThumbnailError::render_failed(Some(page), "engine output ended mid-page")
}

/// Buffered, interruptible view of the engine's output.
pub(crate) struct EngineReader<'r, R: ?Sized> {
    inner: BufReader<&'r mut R>,
}

impl<'r, R> EngineReader<'r, R>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    pub(crate) fn new(inner: &'r mut R, capacity: usize) -> Self {
        Self {
            inner: BufReader::with_capacity(capacity, inner),
        }
    }

    async fn fill(&mut self, interrupt: &Interrupt, page: usize) -> Result<&[u8], ThumbnailError> {
        tokio::select! {
            biased;
            e = interrupt.fired() => Err(e),
            r = self.inner.fill_buf() => r.map_err(|e| {
                ThumbnailError::render_failed(Some(page), format!("reading engine output: {e}"))
            }),
        }
    }

    fn consume(&mut self, n: usize) {
        self.inner.consume(n);
    }

    /// True once the output is exhausted. Only meaningful between pages.
    pub(crate) async fn at_end(&mut self, interrupt: &Interrupt, next_page: usize) -> Result<bool, ThumbnailError> {
        Ok(self.fill(interrupt, next_page).await?.is_empty())
    }

    async fn read_exact(&mut self, interrupt: &Interrupt, page: usize, out: &mut [u8]) -> Result<(), ThumbnailError> {
        let mut filled = 0;
        while filled < out.len() {
            let chunk = self.fill(interrupt, page).await?;
            if chunk.is_empty() {
                return Err(truncated(page));
            }
            let n = chunk.len().min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&chunk[..n]);
            self.consume(n);
            filled += n;
        }
        Ok(())
    }

    async fn read_u8(&mut self, interrupt: &Interrupt, page: usize) -> Result<u8, ThumbnailError> {
        let mut b = [0u8; 1];
        self.read_exact(interrupt, page, &mut b).await?;
        Ok(b[0])
    }
}

/// Counts and forwards one page's bytes to its sink.
pub(crate) struct PageWriter<'s, S> {
    sink: &'s mut S,
    page: usize,
    written: u64,
}

impl<'s, S: AsyncWrite + Unpin + Send> PageWriter<'s, S> {
    pub(crate) fn new(sink: &'s mut S, page: usize) -> Self {
        Self {
            sink,
            page,
            written: 0,
        }
    }

    pub(crate) fn page(&self) -> usize {
        self.page
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    async fn write(&mut self, interrupt: &Interrupt, bytes: &[u8]) -> Result<(), ThumbnailError> {
        let page = self.page;
        tokio::select! {
            biased;
            e = interrupt.fired() => return Err(e),
            r = self.sink.write_all(bytes) => r.map_err(|source| ThumbnailError::Sink { page, source })?,
        }
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Copy exactly `n` bytes from the engine to the sink.
async fn copy_n<R, S>(
    reader: &mut EngineReader<'_, R>,
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
    mut n: u64,
) -> Result<(), ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    S: AsyncWrite + Unpin + Send,
{
    let page = writer.page();
    while n > 0 {
        let chunk = reader.fill(interrupt, page).await?;
        if chunk.is_empty() {
            return Err(truncated(page));
        }
        let take = (chunk.len() as u64).min(n) as usize;
        writer.write(interrupt, &chunk[..take]).await?;
        reader.consume(take);
        n -= take as u64;
    }
    Ok(())
}

/// Read and check the start-of-image signature of the next page.
///
/// Nothing is written here: the sink for the page is only opened once the
/// signature proves a page is actually there.
pub(crate) async fn read_signature<R>(
    framing: Framing,
    reader: &mut EngineReader<'_, R>,
    interrupt: &Interrupt,
    page: usize,
) -> Result<Vec<u8>, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let expected: &[u8] = match framing {
        Framing::Png => &PNG_SIGNATURE,
        Framing::Jpeg => &JPEG_SOI,
    };
    let mut found = vec![0u8; expected.len()];
    reader.read_exact(interrupt, page, &mut found).await?;
    if found != expected {
        return Err(ThumbnailError::render_failed(
            Some(page),
            format!(
                "engine output is not a {:?} stream (starts with {})",
                framing,
                hex(&found)
            ),
        ));
    }
    Ok(found)
}

/// Stream the rest of the page after its signature. Returns the image
/// dimensions when the format header carried them.
pub(crate) async fn copy_body<R, S>(
    framing: Framing,
    reader: &mut EngineReader<'_, R>,
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
) -> Result<Option<(u32, u32)>, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    S: AsyncWrite + Unpin + Send,
{
    match framing {
        Framing::Png => copy_png_body(reader, writer, interrupt).await,
        Framing::Jpeg => copy_jpeg_body(reader, writer, interrupt).await,
    }
}

/// Forward the already-validated signature to the sink.
pub(crate) async fn write_signature<S: AsyncWrite + Unpin + Send>(
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
    signature: &[u8],
) -> Result<(), ThumbnailError> {
    writer.write(interrupt, signature).await
}

async fn copy_png_body<R, S>(
    reader: &mut EngineReader<'_, R>,
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
) -> Result<Option<(u32, u32)>, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    S: AsyncWrite + Unpin + Send,
{
    let page = writer.page();
    let mut dims = None;
    let mut first = true;

    loop {
        let mut header = [0u8; 8];
        reader.read_exact(interrupt, page, &mut header).await?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let kind = [header[4], header[5], header[6], header[7]];

        if len > PNG_MAX_CHUNK {
            return Err(ThumbnailError::render_failed(
                Some(page),
                format!("PNG chunk length {len} exceeds the format limit"),
            ));
        }
        if first && &kind != b"IHDR" {
            return Err(ThumbnailError::render_failed(
                Some(page),
                format!("PNG stream starts with {} instead of IHDR", String::from_utf8_lossy(&kind)),
            ));
        }
        first = false;

        writer.write(interrupt, &header).await?;

        // Payload plus the trailing 4-byte CRC.
        if &kind == b"IHDR" && len >= 8 {
            let mut wh = [0u8; 8];
            reader.read_exact(interrupt, page, &mut wh).await?;
            writer.write(interrupt, &wh).await?;
            let width = u32::from_be_bytes([wh[0], wh[1], wh[2], wh[3]]);
            let height = u32::from_be_bytes([wh[4], wh[5], wh[6], wh[7]]);
            dims = Some((width, height));
            copy_n(reader, writer, interrupt, u64::from(len) - 8 + 4).await?;
        } else {
            copy_n(reader, writer, interrupt, u64::from(len) + 4).await?;
        }

        if &kind == b"IEND" {
            return Ok(dims);
        }
    }
}

fn is_sof(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF)
}

async fn copy_jpeg_body<R, S>(
    reader: &mut EngineReader<'_, R>,
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
) -> Result<Option<(u32, u32)>, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    S: AsyncWrite + Unpin + Send,
{
    let page = writer.page();
    let mut dims = None;
    let mut marker = next_marker(reader, writer, interrupt).await?;

    loop {
        match marker {
            JPEG_EOI => return Ok(dims),
            JPEG_TEM | 0xD0..=0xD7 => {}
            0xD8 => {
                return Err(ThumbnailError::render_failed(
                    Some(page),
                    "unexpected SOI inside JPEG image",
                ))
            }
            JPEG_SOS => {
                copy_segment(reader, writer, interrupt, false).await?;
                marker = scan_entropy(reader, writer, interrupt).await?;
                continue;
            }
            m => {
                if let Some(d) = copy_segment(reader, writer, interrupt, is_sof(m)).await? {
                    dims = Some(d);
                }
            }
        }
        marker = next_marker(reader, writer, interrupt).await?;
    }
}

/// Read `0xFF`, any fill bytes, and the marker code. All bytes are forwarded.
async fn next_marker<R, S>(
    reader: &mut EngineReader<'_, R>,
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
) -> Result<u8, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    S: AsyncWrite + Unpin + Send,
{
    let page = writer.page();
    let lead = reader.read_u8(interrupt, page).await?;
    if lead != 0xFF {
        return Err(ThumbnailError::render_failed(
            Some(page),
            format!("expected JPEG marker, found 0x{lead:02X}"),
        ));
    }
    writer.write(interrupt, &[lead]).await?;
    loop {
        let code = reader.read_u8(interrupt, page).await?;
        writer.write(interrupt, &[code]).await?;
        match code {
            0xFF => continue,
            0x00 => {
                return Err(ThumbnailError::render_failed(
                    Some(page),
                    "stuffed 0xFF00 outside JPEG scan data",
                ))
            }
            code => return Ok(code),
        }
    }
}

/// Copy a length-prefixed marker segment. For start-of-frame segments the
/// frame height and width are returned as `(width, height)`.
async fn copy_segment<R, S>(
    reader: &mut EngineReader<'_, R>,
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
    sof: bool,
) -> Result<Option<(u32, u32)>, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    S: AsyncWrite + Unpin + Send,
{
    let page = writer.page();
    let mut len_bytes = [0u8; 2];
    reader.read_exact(interrupt, page, &mut len_bytes).await?;
    writer.write(interrupt, &len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes);
    if len < 2 {
        return Err(ThumbnailError::render_failed(
            Some(page),
            format!("JPEG segment length {len} is too short"),
        ));
    }
    let body = u64::from(len - 2);

    if sof && body >= 5 {
        // precision(1) height(2) width(2)
        let mut frame = [0u8; 5];
        reader.read_exact(interrupt, page, &mut frame).await?;
        writer.write(interrupt, &frame).await?;
        let height = u32::from(u16::from_be_bytes([frame[1], frame[2]]));
        let width = u32::from(u16::from_be_bytes([frame[3], frame[4]]));
        copy_n(reader, writer, interrupt, body - 5).await?;
        return Ok(Some((width, height)));
    }

    copy_n(reader, writer, interrupt, body).await?;
    Ok(None)
}

/// Copy entropy-coded scan data up to the next real marker and return its
/// code (already forwarded).
async fn scan_entropy<R, S>(
    reader: &mut EngineReader<'_, R>,
    writer: &mut PageWriter<'_, S>,
    interrupt: &Interrupt,
) -> Result<u8, ThumbnailError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    S: AsyncWrite + Unpin + Send,
{
    let page = writer.page();
    loop {
        let chunk = reader.fill(interrupt, page).await?;
        if chunk.is_empty() {
            return Err(truncated(page));
        }
        match chunk.iter().position(|&b| b == 0xFF) {
            None => {
                let n = chunk.len();
                writer.write(interrupt, chunk).await?;
                reader.consume(n);
            }
            Some(i) => {
                writer.write(interrupt, &chunk[..=i]).await?;
                reader.consume(i + 1);
                loop {
                    let code = reader.read_u8(interrupt, page).await?;
                    writer.write(interrupt, &[code]).await?;
                    match code {
                        0xFF => continue,
                        0x00 | 0xD0..=0xD7 => break,
                        code => return Ok(code),
                    }
                }
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;

    fn interrupt() -> Interrupt {
        Interrupt::new(&CancelToken::new(), None)
    }

    /// Minimal structurally valid PNG: IHDR, IDAT, IEND (CRCs are not checked).
    fn png(width: u32, height: u32, idat: &[u8]) -> Vec<u8> {
        let mut out = PNG_SIGNATURE.to_vec();
        let mut chunk = |kind: &[u8; 4], data: &[u8]| {
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(kind);
            out.extend_from_slice(data);
            out.extend_from_slice(&[0, 0, 0, 0]);
        };
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&width.to_be_bytes());
        ihdr.extend_from_slice(&height.to_be_bytes());
        ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);
        chunk(b"IHDR", &ihdr);
        chunk(b"IDAT", idat);
        chunk(b"IEND", &[]);
        out
    }

    /// Minimal JPEG-shaped stream with stuffing and a restart marker in the scan.
    fn jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut out = JPEG_SOI.to_vec();
        out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x4A, 0x46]); // APP0
        out.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]); // SOF0
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        out.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 1, 1, 0, 0, 0x3F, 0]); // SOS
        out.extend_from_slice(&[0x12, 0xFF, 0x00, 0x34, 0xFF, 0xD0, 0x56, 0xFF, 0xFF, 0xD9]);
        out
    }

    async fn frame_one(framing: Framing, data: &[u8], capacity: usize) -> Result<(Vec<u8>, Option<(u32, u32)>), ThumbnailError> {
        let mut src: &[u8] = data;
        let mut reader = EngineReader::new(&mut src, capacity);
        let irq = interrupt();
        let mut sink: Vec<u8> = Vec::new();
        let sig = read_signature(framing, &mut reader, &irq, 1).await?;
        let mut writer = PageWriter::new(&mut sink, 1);
        write_signature(&mut writer, &irq, &sig).await?;
        let dims = copy_body(framing, &mut reader, &mut writer, &irq).await?;
        assert!(reader.at_end(&irq, 2).await?);
        Ok((sink, dims))
    }

    #[tokio::test]
    async fn png_page_is_copied_verbatim() {
        let page = png(20, 10, &[1, 2, 3, 4, 5]);
        for capacity in [8, 13, 4096] {
            let (out, dims) = frame_one(Framing::Png, &page, capacity).await.unwrap();
            assert_eq!(out, page, "capacity {capacity}");
            assert_eq!(dims, Some((20, 10)));
        }
    }

    #[tokio::test]
    async fn jpeg_scan_handles_stuffing_and_restart_markers() {
        let page = jpeg(64, 48);
        for capacity in [8, 9, 4096] {
            let (out, dims) = frame_one(Framing::Jpeg, &page, capacity).await.unwrap();
            assert_eq!(out, page, "capacity {capacity}");
            assert_eq!(dims, Some((64, 48)));
        }
    }

    #[tokio::test]
    async fn truncated_png_is_render_failed() {
        let page = png(4, 4, &[9; 32]);
        let cut = &page[..page.len() - 6];
        let err = frame_one(Framing::Png, cut, 4096).await.unwrap_err();
        match err {
            ThumbnailError::RenderFailed { page, detail, .. } => {
                assert_eq!(page, Some(1));
                assert!(detail.contains("mid-page"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_signature_is_rejected_before_any_write() {
        let err = frame_one(Framing::Png, b"GPL Ghostscript 10", 4096).await.unwrap_err();
        assert!(matches!(err, ThumbnailError::RenderFailed { .. }), "{err:?}");
        assert!(err.to_string().contains("47 50 4C"), "{err}");
    }

    #[tokio::test]
    async fn png_without_leading_ihdr_is_rejected() {
        let mut data = PNG_SIGNATURE.to_vec();
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(b"IEND");
        data.extend_from_slice(&[0, 0, 0, 0]);
        let err = frame_one(Framing::Png, &data, 4096).await.unwrap_err();
        assert!(err.to_string().contains("instead of IHDR"), "{err}");
    }

    #[tokio::test]
    async fn jpeg_garbage_between_segments_is_rejected() {
        let mut data = JPEG_SOI.to_vec();
        data.extend_from_slice(&[0x00, 0x11]);
        let err = frame_one(Framing::Jpeg, &data, 4096).await.unwrap_err();
        assert!(err.to_string().contains("expected JPEG marker"), "{err}");
    }

    #[tokio::test]
    async fn cancelled_reader_stops_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let irq = Interrupt::new(&token, None);
        let data = png(1, 1, &[0]);
        let mut src: &[u8] = &data;
        let mut reader = EngineReader::new(&mut src, 64);
        let err = reader.at_end(&irq, 1).await.unwrap_err();
        assert!(matches!(err, ThumbnailError::Cancelled));
    }
}

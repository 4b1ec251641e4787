use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::ReadError;

pub const SML_ESCAPE: [u8; 4] = [0x1B, 0x1B, 0x1B, 0x1B];
pub const SML_VERSION_1: [u8; 4] = [0x01, 0x01, 0x01, 0x01];
pub const SML_END_MARKER: u8 = 0x1A;

// Nothing a meter sends comes close, drop the buffer when it does
const MAX_BUFFERED: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// IEC 62056-21 / DSMR text telegram, `/` up to the line starting with `!`
    Telegram,
    /// SML transport frame, escape + version up to escape + 0x1A + pad + CRC
    Sml,
}

enum Scan {
    Complete(usize, usize),
    Incomplete(usize),
    NoStart,
}

/// Position of the SML end sequence (first byte of its escape) in `data`,
/// scanning from `from` and skipping escaped escape sequences.
pub fn find_sml_end(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 4 <= data.len() {
        if data[i..i + 4] == SML_ESCAPE {
            if i + 5 > data.len() {
                return None;
            }
            if data[i + 4] == SML_END_MARKER {
                return Some(i);
            }
            if data[i + 4] == SML_ESCAPE[0] {
                if i + 8 > data.len() {
                    return None;
                }
                if data[i + 4..i + 8] == SML_ESCAPE {
                    i += 8;
                    continue;
                }
            }
        }
        i += 1;
    }
    None
}

fn find_sml_start(data: &[u8]) -> Option<usize> {
    data.windows(8).position(|w| w[..4] == SML_ESCAPE && w[4..] == SML_VERSION_1)
}

/// Collects bytes from a stream and cuts out complete frames
pub struct FrameAssembler {
    kind: FrameKind,
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new(kind: FrameKind) -> Self {
        FrameAssembler { kind, buf: Vec::with_capacity(1024) }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFERED {
            warn!("No frame in {} buffered bytes, discarding", self.buf.len());
            self.buf.clear();
        }
    }

    /// Take the first complete frame, dropping any garbage before it
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let scan = match self.kind {
            FrameKind::Telegram => self.scan_telegram(),
            FrameKind::Sml => self.scan_sml(),
        };

        match scan {
            Scan::Complete(start, end) => {
                if start > 0 {
                    debug!("Skipping {} bytes before frame start", start);
                }
                let frame = self.buf[start..end].to_vec();
                self.buf.drain(..end);
                Some(frame)
            }
            Scan::Incomplete(start) => {
                self.buf.drain(..start);
                None
            }
            Scan::NoStart => {
                // keep a possible partial start sequence
                let keep = match self.kind {
                    FrameKind::Telegram => 0,
                    FrameKind::Sml => 7,
                };
                let cut = self.buf.len().saturating_sub(keep);
                self.buf.drain(..cut);
                None
            }
        }
    }

    fn scan_telegram(&self) -> Scan {
        let start = match self.buf.iter().position(|b| *b == b'/') {
            Some(s) => s,
            None => return Scan::NoStart,
        };

        let mut line_start = start;
        while let Some(nl) = self.buf[line_start..].iter().position(|b| *b == b'\n') {
            let line_end = line_start + nl;
            if self.buf[line_start] == b'!' {
                return Scan::Complete(start, line_end + 1);
            }
            line_start = line_end + 1;
            if line_start >= self.buf.len() {
                break;
            }
        }
        Scan::Incomplete(start)
    }

    fn scan_sml(&self) -> Scan {
        let start = match find_sml_start(&self.buf) {
            Some(s) => s,
            None => return Scan::NoStart,
        };
        match find_sml_end(&self.buf, start + 8) {
            // escape, 0x1A, padding count and two CRC bytes
            Some(end) if end + 8 <= self.buf.len() => Scan::Complete(start, end + 8),
            _ => Scan::Incomplete(start),
        }
    }
}

/// Read from `reader` until the assembler yields a frame
pub async fn read_frame_from<R: AsyncRead + Unpin>(reader: &mut R, assembler: &mut FrameAssembler) -> Result<Vec<u8>, ReadError> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(frame) = assembler.next_frame() {
            return Ok(frame);
        }
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ReadError::Reset(e.to_string()))?;
        if n == 0 {
            return Err(ReadError::Closed);
        }
        assembler.push(&chunk[..n]);
    }
}

//! Chunked encrypted container engine.
//!
//! On-disk layout:
//! ```text
//! header(64) ‖ random pre-pad(skipped) ‖ chunk 0 ‖ … ‖ chunk n-1 ‖ random pad(unit - skipped)
//! ```
//! Each chunk encrypts `chunk_size` plaintext bytes laid out as
//! `sizeField:u32 LE ‖ payload ‖ random fill`, where bit 31 of the size
//! field marks the final chunk. The chunk index, as a little-endian u64, is
//! bound into the ciphertext as associated data, so chunks cannot be
//! swapped or replayed across positions. The pre-pad length is derived from
//! the header and the DEK, so the chunk region starts at an offset an
//! attacker without the key cannot predict.
//!
//! The engine keeps two plaintext buffers: a single-slot cache for
//! read-modify-write access to already stored chunks, and the append buffer
//! holding the tail chunk. The append buffer is flushed without the
//! end-of-stream mark when writes move past it and is finalized with the
//! mark on close.

use std::io::SeekFrom;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use cloakfs_core::{Error, Result, Storage};
use cloakfs_crypto::CipherContext;

use crate::header::{Header, HEADER_LEN, MAX_UNIT};

const SIZE_FIELD_LEN: usize = 4;
const EOS_BIT: u32 = 1 << 31;
const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
const MIN_CHUNK_SIZE: u32 = 64;

/// Tunables for [`EncryptedContainer::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    /// Plaintext bytes per chunk, including the 4-byte size field.
    pub chunk_size: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// One decrypted chunk held in memory. `data` is the full plaintext layout
/// (size field plus payload slots); `len` is the real payload length.
struct ChunkBuf {
    id: u64,
    data: Vec<u8>,
    len: usize,
    eos: bool,
    dirty: bool,
}

impl ChunkBuf {
    fn fresh(id: u64, chunk_size: usize) -> Self {
        Self {
            id,
            data: vec![0u8; chunk_size],
            len: 0,
            eos: false,
            dirty: false,
        }
    }
}

fn store_chunk<S: Storage>(
    storage: &mut S,
    ctx: &mut CipherContext,
    enc_buf: &mut [u8],
    base: u64,
    unit: usize,
    chunk: &mut ChunkBuf,
) -> Result<()> {
    let mut field = chunk.len as u32;
    if chunk.eos {
        field |= EOS_BIT;
    }
    chunk.data[..SIZE_FIELD_LEN].copy_from_slice(&field.to_le_bytes());
    // Unused payload space carries fresh randomness on every store.
    rand::thread_rng().fill_bytes(&mut chunk.data[SIZE_FIELD_LEN + chunk.len..]);

    let n = ctx.encrypt(
        false,
        None,
        &chunk.data,
        Some(&chunk.id.to_le_bytes()),
        enc_buf,
    )?;
    if n != unit {
        return Err(Error::corrupt("encrypted chunk has an unexpected size"));
    }
    storage.write_at(base + chunk.id * unit as u64, &enc_buf[..n])?;
    chunk.dirty = false;
    Ok(())
}

fn fetch_chunk<S: Storage>(
    storage: &mut S,
    ctx: &mut CipherContext,
    enc_buf: &mut [u8],
    base: u64,
    unit: usize,
    chunk_size: usize,
    id: u64,
) -> Result<ChunkBuf> {
    let n = storage.read_at(base + id * unit as u64, enc_buf)?;
    if n != unit {
        return Err(Error::UnexpectedEof);
    }

    let mut data = vec![0u8; chunk_size];
    let n = ctx.decrypt(false, enc_buf, Some(&id.to_le_bytes()), &mut data)?;
    if n != chunk_size {
        return Err(Error::corrupt("decrypted chunk has an unexpected size"));
    }

    let field = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let eos = field & EOS_BIT != 0;
    let len = (field & !EOS_BIT) as usize;
    if len > chunk_size - SIZE_FIELD_LEN {
        return Err(Error::corrupt("chunk length field out of range"));
    }

    Ok(ChunkBuf {
        id,
        data,
        len,
        eos,
        dirty: false,
    })
}

/// Random-access encrypted byte stream over a [`Storage`] backend.
///
/// Containers on seekable storage support reads, writes, and exact size
/// reporting. Containers opened on forward-only streams are read-only and
/// report an approximate size until the final chunk has been read.
pub struct EncryptedContainer<S> {
    storage: S,
    ctx: CipherContext,
    unit: usize,
    chunk_size: usize,
    ppu: usize,
    skipped: usize,
    pos: u64,
    payload_len: u64,
    cache: Option<ChunkBuf>,
    append: Option<ChunkBuf>,
    enc_buf: Vec<u8>,
    pad_dirty: bool,
}

impl<S: Storage> EncryptedContainer<S> {
    /// Initialize a fresh container on `storage`, consuming `ctx` as its
    /// encryption context.
    pub fn create(mut storage: S, mut ctx: CipherContext, opts: &CreateOptions) -> Result<Self> {
        if opts.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::invalid_argument(format!(
                "chunk size must be at least {MIN_CHUNK_SIZE} bytes"
            )));
        }
        let chunk_size = opts.chunk_size as usize;
        let unit = ctx.encrypted_size(chunk_size);
        if unit > MAX_UNIT as usize {
            return Err(Error::invalid_argument("chunk size too large"));
        }

        let raw = Header::new(unit as u32).encode();
        storage.write_at(0, &raw)?;

        let skipped = ctx.padding_split(unit, &raw)?;
        if skipped > 0 {
            let mut pad = vec![0u8; skipped];
            rand::thread_rng().fill_bytes(&mut pad);
            storage.write_at(HEADER_LEN as u64, &pad)?;
        }
        tracing::debug!(unit, skipped, "created encrypted container");

        Ok(Self {
            storage,
            ctx,
            unit,
            chunk_size,
            ppu: chunk_size - SIZE_FIELD_LEN,
            skipped,
            pos: 0,
            payload_len: 0,
            cache: None,
            append: Some(ChunkBuf::fresh(0, chunk_size)),
            enc_buf: vec![0u8; unit],
            pad_dirty: true,
        })
    }

    /// Open an existing container. On seekable storage the tail chunk is
    /// decrypted immediately, giving an exact size and enabling appends.
    pub fn open(mut storage: S, mut ctx: CipherContext) -> Result<Self> {
        let mut raw = [0u8; HEADER_LEN];
        let n = storage.read_at(0, &mut raw)?;
        if n != HEADER_LEN {
            return Err(Error::UnexpectedEof);
        }
        let header = Header::decode(&raw)?;

        let unit = header.unit as usize;
        let chunk_size = ctx.decrypted_size(unit);
        if chunk_size <= SIZE_FIELD_LEN {
            return Err(Error::corrupt("chunk size too small for its cipher"));
        }
        let ppu = chunk_size - SIZE_FIELD_LEN;
        let skipped = ctx.padding_split(unit, &raw)?;
        let base = (HEADER_LEN + skipped) as u64;
        let mut enc_buf = vec![0u8; unit];

        let (append, payload_len) = if storage.is_seekable() {
            let total = storage.len()?;
            if total < (HEADER_LEN + unit) as u64
                || (total - HEADER_LEN as u64) % unit as u64 != 0
            {
                return Err(Error::corrupt("container size is not chunk-aligned"));
            }
            let chunks = (total - HEADER_LEN as u64) / unit as u64 - 1;

            if chunks == 0 {
                (Some(ChunkBuf::fresh(0, chunk_size)), 0)
            } else {
                let tail = fetch_chunk(
                    &mut storage,
                    &mut ctx,
                    &mut enc_buf,
                    base,
                    unit,
                    chunk_size,
                    chunks - 1,
                )?;
                if !tail.eos {
                    tracing::debug!(chunk = chunks - 1, "tail chunk lacks the end-of-stream mark");
                }
                let payload_len = (chunks - 1) * ppu as u64 + tail.len as u64;
                (Some(tail), payload_len)
            }
        } else {
            // Forward-only: consume the pre-pad so the cursor sits on chunk
            // 0, then fall back to a full-chunk size approximation.
            let mut scratch = [0u8; 512];
            let mut left = skipped;
            while left > 0 {
                let take = left.min(scratch.len());
                let n = storage.read(&mut scratch[..take])?;
                if n == 0 {
                    return Err(Error::UnexpectedEof);
                }
                left -= n;
            }
            let total = storage.len()?;
            let chunks = if total >= (HEADER_LEN + unit) as u64 {
                (total - HEADER_LEN as u64) / unit as u64 - 1
            } else {
                0
            };
            (None, chunks * ppu as u64)
        };

        tracing::debug!(unit, skipped, payload_len, "opened encrypted container");

        Ok(Self {
            storage,
            ctx,
            unit,
            chunk_size,
            ppu,
            skipped,
            pos: 0,
            payload_len,
            cache: None,
            append,
            enc_buf,
            pad_dirty: false,
        })
    }

    /// Payload size in bytes. Exact on seekable storage; on streams this is
    /// an upper bound until the tail chunk has been read.
    pub fn len(&self) -> u64 {
        self.payload_len
    }

    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn cipher_name(&self) -> &'static str {
        self.ctx.cipher_name()
    }

    fn data_base(&self) -> u64 {
        (HEADER_LEN + self.skipped) as u64
    }

    fn flush_cache(&mut self) -> Result<()> {
        let base = self.data_base();
        let unit = self.unit;
        if let Some(c) = self.cache.as_mut() {
            if c.dirty {
                store_chunk(&mut self.storage, &mut self.ctx, &mut self.enc_buf, base, unit, c)?;
            }
        }
        Ok(())
    }

    fn ensure_cached(&mut self, id: u64) -> Result<()> {
        if self.cache.as_ref().is_some_and(|c| c.id == id) {
            return Ok(());
        }
        self.flush_cache()?;
        let base = self.data_base();
        let chunk = fetch_chunk(
            &mut self.storage,
            &mut self.ctx,
            &mut self.enc_buf,
            base,
            self.unit,
            self.chunk_size,
            id,
        )?;
        self.cache = Some(chunk);
        Ok(())
    }

    /// Flush the full append buffer without the end-of-stream mark and move
    /// it to the next chunk.
    fn roll_append(&mut self) -> Result<()> {
        let base = self.data_base();
        let unit = self.unit;
        if let Some(a) = self.append.as_mut() {
            a.eos = false;
            store_chunk(&mut self.storage, &mut self.ctx, &mut self.enc_buf, base, unit, a)?;
            let next = a.id + 1;
            self.append = Some(ChunkBuf::fresh(next, self.chunk_size));
            self.pad_dirty = true;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns 0 at end
    /// of payload; a short count means the end was reached mid-buffer.
    pub fn read_at(&mut self, mut offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.payload_len || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.payload_len - offset) as usize;
        let ppu = self.ppu as u64;

        let mut total = 0usize;
        while total < want {
            let id = offset / ppu;
            let within = (offset % ppu) as usize;

            let use_append = self.append.as_ref().is_some_and(|a| a.id == id);
            if !use_append {
                self.ensure_cached(id)?;
            }
            let chunk = if use_append {
                self.append.as_ref()
            } else {
                self.cache.as_ref()
            };
            let Some(chunk) = chunk else {
                return Err(Error::corrupt("chunk buffer missing"));
            };

            // An approximate payload size can overshoot the tail chunk.
            if within >= chunk.len {
                break;
            }
            let n = (want - total).min(chunk.len - within);
            buf[total..total + n]
                .copy_from_slice(&chunk.data[SIZE_FIELD_LEN + within..SIZE_FIELD_LEN + within + n]);
            let at_end = within + n == chunk.len && chunk.eos;
            total += n;
            offset += n as u64;
            if at_end {
                break;
            }
        }
        Ok(total)
    }

    /// Write `buf` starting at `offset`. A gap past the current payload end
    /// is zero-filled first.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.append.is_none() {
            return Err(Error::not_supported(
                "container was opened read-only on a stream",
            ));
        }

        if offset > self.payload_len {
            let zeros = [0u8; 4096];
            while self.payload_len < offset {
                let n = ((offset - self.payload_len) as usize).min(zeros.len());
                let at = self.payload_len;
                self.write_inner(at, &zeros[..n])?;
            }
        }

        self.write_inner(offset, buf)?;
        Ok(buf.len())
    }

    fn write_inner(&mut self, mut offset: u64, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let id = offset / self.ppu as u64;
            let within = (offset % self.ppu as u64) as usize;
            let take = buf.len().min(self.ppu - within);

            let (append_id, append_len) = match &self.append {
                Some(a) => (a.id, a.len),
                None => return Err(Error::corrupt("append buffer missing")),
            };
            if id == append_id + 1 && append_len == self.ppu {
                self.roll_append()?;
            }

            let append_id = match &self.append {
                Some(a) => a.id,
                None => return Err(Error::corrupt("append buffer missing")),
            };
            if id < append_id {
                self.ensure_cached(id)?;
                let Some(c) = self.cache.as_mut() else {
                    return Err(Error::corrupt("chunk buffer missing"));
                };
                c.data[SIZE_FIELD_LEN + within..SIZE_FIELD_LEN + within + take]
                    .copy_from_slice(&buf[..take]);
                c.len = c.len.max(within + take);
                c.dirty = true;
            } else if id == append_id {
                let Some(a) = self.append.as_mut() else {
                    return Err(Error::corrupt("append buffer missing"));
                };
                a.data[SIZE_FIELD_LEN + within..SIZE_FIELD_LEN + within + take]
                    .copy_from_slice(&buf[..take]);
                a.len = a.len.max(within + take);
                a.dirty = true;
            } else {
                return Err(Error::corrupt("write past the append chunk"));
            }

            self.payload_len = self.payload_len.max(offset + take as u64);
            offset += take as u64;
            buf = &buf[take..];
        }
        Ok(())
    }

    /// Sequential read at the current position.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Sequential write at the current position.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.write_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Reposition the sequential cursor. Positions before the start clamp
    /// to 0; positions past the end are allowed (writes there zero-fill).
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        if !self.storage.is_seekable() {
            return Err(Error::not_supported("seek on a non-seekable container"));
        }
        let target = match from {
            SeekFrom::Start(o) => o as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.payload_len as i128 + d as i128,
        };
        self.pos = target.max(0) as u64;
        Ok(self.pos)
    }

    /// Flush the dirty cache chunk through to storage. The append buffer
    /// and trailing pad are only persisted by [`EncryptedContainer::close`].
    pub fn flush(&mut self) -> Result<()> {
        self.flush_cache()?;
        self.storage.flush()
    }

    /// Finalize the container: flush buffered chunks, mark the tail chunk
    /// as end-of-stream, rewrite the trailing pad, and hand the storage
    /// back.
    pub fn close(mut self) -> Result<S> {
        self.flush_cache()?;

        let base = self.data_base();
        let unit = self.unit;
        if let Some(a) = self.append.as_mut() {
            if a.dirty {
                a.eos = true;
                store_chunk(&mut self.storage, &mut self.ctx, &mut self.enc_buf, base, unit, a)?;
                self.pad_dirty = true;
            }
        }

        if self.pad_dirty {
            let chunks = self
                .append
                .as_ref()
                .map_or(0, |a| a.id + u64::from(a.len > 0));
            let mut pad = vec![0u8; self.unit - self.skipped];
            rand::thread_rng().fill_bytes(&mut pad);
            self.storage.write_at(base + chunks * unit as u64, &pad)?;
        }

        self.storage.flush()?;
        Ok(self.storage)
    }
}

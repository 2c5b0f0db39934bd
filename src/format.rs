//! Sparse program-image store and the INHX8M/INHX32 hex file codec.
//!
//! The image is word-addressed; the on-disk format is byte-addressed, so
//! every load halves counts/addresses and packs little-endian byte pairs,
//! and every save does the reverse.
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// INHX32 files open by setting the upper address bits to zero.
const INHX32_HEADER: &str = ":020000040000FA";

/// Emitted data records are capped at this many words, purely so the
/// output stays diff-friendly.
const RECORD_WORDS: usize = 8;

/// What to do about record checksums on load. The historical tools never
/// verified them; `Verify` rejects a corrupt file instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    #[default]
    Ignore,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    base: u32,
    words: Vec<u16>,
}

impl Block {
    fn end(&self) -> u32 {
        self.base + self.words.len() as u32
    }
}

/// A sparse, ordered collection of non-overlapping word blocks.
///
/// Blocks stay sorted ascending by base address; lookups locate the last
/// block whose base is at or below the target and bounds-check the offset.
#[derive(Debug, Clone)]
pub struct HexImage {
    blocks: Vec<Block>,
    /// Returned for unpopulated addresses by `get`.
    fill: u16,
    /// The loaded file carried (or the content requires) INHX32 linear
    /// address records.
    requires_linear: bool,
    /// The loaded file carried segment address records.
    saw_segment: bool,
}

impl Default for HexImage {
    fn default() -> Self {
        HexImage {
            blocks: Vec::new(),
            fill: 0xFFFF,
            requires_linear: false,
            saw_segment: false,
        }
    }
}

impl HexImage {
    pub fn new() -> HexImage {
        HexImage::default()
    }

    /// Set the value reads of unpopulated addresses return.
    pub fn set_fill(&mut self, blank: u16) {
        self.fill = blank;
    }

    fn locate(&self, addr: u32) -> Option<(usize, usize)> {
        let idx = self.blocks.partition_point(|b| b.base <= addr);
        if idx == 0 {
            return None;
        }
        let block = &self.blocks[idx - 1];
        let offset = (addr - block.base) as usize;
        (offset < block.words.len()).then_some((idx - 1, offset))
    }

    pub fn lookup(&self, addr: u32) -> Option<u16> {
        self.locate(addr)
            .map(|(b, off)| self.blocks[b].words[off])
    }

    /// Point read; holes read as the image's fill value.
    pub fn get(&self, addr: u32) -> u16 {
        self.lookup(addr).unwrap_or(self.fill)
    }

    pub fn get_or(&self, addr: u32, blank: u16) -> u16 {
        self.lookup(addr).unwrap_or(blank)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.locate(addr).is_some()
    }

    /// Point write: overwrite in place, extend the block ending at `addr`,
    /// or start a new block, keeping the sort order.
    pub fn set(&mut self, addr: u32, word: u16) {
        let idx = self.blocks.partition_point(|b| b.base <= addr);
        if idx > 0 {
            let block = &mut self.blocks[idx - 1];
            let offset = (addr - block.base) as usize;
            if offset < block.words.len() {
                block.words[offset] = word;
                return;
            }
            if offset == block.words.len() {
                block.words.push(word);
                return;
            }
        }
        self.blocks.insert(
            idx,
            Block {
                base: addr,
                words: vec![word],
            },
        );
    }

    /// Total populated word count.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.words.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.words.is_empty())
    }

    /// Populated words with addresses strictly below `addr`.
    pub fn count_below(&self, addr: u32) -> usize {
        self.count_in_range(0, addr)
    }

    /// Populated words in the half-open range `[lo, hi)`, counting partial
    /// overlap of blocks that straddle either bound.
    pub fn count_in_range(&self, lo: u32, hi: u32) -> usize {
        self.blocks
            .iter()
            .map(|b| {
                let start = b.base.max(lo);
                let end = b.end().min(hi);
                end.saturating_sub(start) as usize
            })
            .sum()
    }

    /// Highest populated address at or below `hi`; 0 when nothing is.
    pub fn max_addr_below(&self, hi: u32) -> u32 {
        let mut max = 0;
        for b in &self.blocks {
            if b.base <= hi && !b.words.is_empty() {
                max = max.max(b.end() - 1);
            }
        }
        max.min(hi)
    }

    /// Iterate the populated (address, word) pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.blocks.iter().flat_map(|b| {
            b.words
                .iter()
                .enumerate()
                .map(move |(i, &w)| (b.base + i as u32, w))
        })
    }

    /// Split every block longer than `max_words` into adjacent blocks.
    /// Word count and per-address values are unchanged.
    pub fn truncate_blocks(&mut self, max_words: usize) {
        if max_words == 0 {
            return;
        }
        let mut i = 0;
        while i < self.blocks.len() {
            if self.blocks[i].words.len() > max_words {
                let rest = self.blocks[i].words.split_off(max_words);
                let base = self.blocks[i].base + max_words as u32;
                self.blocks.insert(i + 1, Block { base, words: rest });
            }
            i += 1;
        }
    }

    pub fn load<P: AsRef<Path>>(path: P, checksums: ChecksumPolicy) -> Result<HexImage> {
        let text = fs::read_to_string(path.as_ref())
            .with_context(|| format!("cannot read {}", path.as_ref().display()))?;
        Self::parse(&text, checksums)
            .with_context(|| format!("loading {}", path.as_ref().display()))
    }

    /// Parse hex text. Unusable lines are logged and skipped; the load
    /// only fails when no data record survives (or, under
    /// `ChecksumPolicy::Verify`, on the first bad checksum).
    pub fn parse(text: &str, checksums: ChecksumPolicy) -> Result<HexImage> {
        let mut image = HexImage::new();
        let mut linear: u16 = 0;
        let mut data_records = 0usize;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let Some(body) = line.strip_prefix(':') else {
                log::error!("line {}: does not start with ':'", lineno);
                continue;
            };
            let bytes = match hex::decode(body) {
                Ok(bytes) => bytes,
                Err(_) => {
                    log::error!("line {}: not a hex record", lineno);
                    continue;
                }
            };
            if bytes.len() < 4 {
                log::error!("line {}: record too short", lineno);
                continue;
            }
            let count = bytes[0] as usize;
            let addr = u16::from_be_bytes([bytes[1], bytes[2]]);
            let rtype = bytes[3];
            let data = &bytes[4..];

            if checksums == ChecksumPolicy::Verify {
                anyhow::ensure!(data.len() > count, "line {}: record truncated", lineno);
                let sum = bytes[..4 + count + 1]
                    .iter()
                    .fold(0u8, |acc, &b| acc.wrapping_add(b));
                anyhow::ensure!(sum == 0, "line {}: bad record checksum", lineno);
            }

            match rtype {
                0x00 => {
                    if data.len() < count {
                        log::error!("line {}: data record truncated", lineno);
                        continue;
                    }
                    let word_count = count / 2;
                    let base = (u32::from(linear) << 16) + u32::from(addr / 2);
                    let words = data[..word_count * 2]
                        .chunks_exact(2)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                        .collect();
                    image.blocks.push(Block { base, words });
                    data_records += 1;
                }
                0x01 => {}
                0x02 => image.saw_segment = true,
                0x04 => {
                    if addr != 0 {
                        log::error!(
                            "line {}: linear address record with nonzero address field",
                            lineno
                        );
                        continue;
                    }
                    if data.len() < 2 {
                        log::error!("line {}: linear address record truncated", lineno);
                        continue;
                    }
                    linear = u16::from_be_bytes([data[0], data[1]]);
                    image.requires_linear = true;
                }
                other => log::debug!("line {}: ignoring record type 0x{:02x}", lineno, other),
            }
        }

        anyhow::ensure!(data_records > 0, "no data records in hex file");
        image.blocks.sort_by_key(|b| b.base);
        Ok(image)
    }

    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut file = fs::File::create(path.as_ref())
            .with_context(|| format!("cannot create {}", path.as_ref().display()))?;
        self.write_to(&mut file)
            .with_context(|| format!("writing {}", path.as_ref().display()))
    }

    /// Serialize as INHX8M, promoting to INHX32 when the file already
    /// required it or any block sits above the 16-bit address range.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> Result<()> {
        self.truncate_blocks(RECORD_WORDS);
        self.blocks.sort_by_key(|b| b.base);

        if !self.requires_linear {
            self.requires_linear = self.blocks.iter().any(|b| b.base & 0xFFFF_0000 != 0);
        }
        if self.requires_linear {
            writeln!(w, "{}", INHX32_HEADER)?;
        }

        let mut linear: u16 = 0;
        for block in &self.blocks {
            let hi = (block.base >> 16) as u16;
            if hi != 0 && hi != linear {
                let sum = 0x02u8
                    .wrapping_add(0x04)
                    .wrapping_add((hi >> 8) as u8)
                    .wrapping_add(hi as u8);
                writeln!(w, ":02000004{:04X}{:02X}", hi, (!sum).wrapping_add(1))?;
                linear = hi;
            }

            let byte_count = (block.words.len() * 2) as u8;
            let byte_addr = (block.base << 1) as u16;
            write!(w, ":{:02X}{:04X}00", byte_count, byte_addr)?;
            let mut sum = byte_count
                .wrapping_add((byte_addr >> 8) as u8)
                .wrapping_add(byte_addr as u8);
            for &word in &block.words {
                write!(w, "{:02X}{:02X}", word & 0xFF, word >> 8)?;
                sum = sum.wrapping_add(word as u8).wrapping_add((word >> 8) as u8);
            }
            writeln!(w, "{:02X}", (!sum).wrapping_add(1))?;
        }
        writeln!(w, ":00000001FF")?;
        Ok(())
    }

    /// Serialize to a string (test and preview helper).
    pub fn render(&mut self) -> Result<String> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Word-for-word equality of two images over `[lo, hi)`, with holes in
/// either reading as `blank`.
pub fn compare(a: &HexImage, b: &HexImage, blank: u16, lo: u32, hi: u32) -> bool {
    (lo..hi).all(|addr| a.get_or(addr, blank) == b.get_or(addr, blank))
}

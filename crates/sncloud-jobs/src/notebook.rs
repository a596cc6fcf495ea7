//! Supernote `.note` container metadata parsing.
//!
//! A notebook file starts with a 4-byte file type (`note`) followed by a
//! `SN_FILE_VER_*` signature. The last four bytes hold the little-endian
//! address of the footer block. Every block is a little-endian `u32` length
//! followed by that many bytes; metadata blocks contain `<KEY:VALUE>` pairs.
//!
//! The footer maps `PAGE{n}` keys to page blocks. A page block names its
//! layer blocks (`MAINLAYER`, `LAYER1`..`LAYER3`, `BGLAYER`), and each layer
//! block points at its bitmap through `LAYERBITMAP`. Only metadata is
//! decoded here; bitmaps are fingerprinted, never rendered.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;

use sncloud_core::{Error, Result};

/// File type tag at offset 0.
pub const FILE_TYPE_NOTE: &str = "note";

/// Prefix of the version signature following the file type.
pub const SIGNATURE_PREFIX: &str = "SN_FILE_VER_";

/// Signature written by [`NoteFileBuilder`].
pub const DEFAULT_SIGNATURE: &str = "SN_FILE_VER_20230015";

const SIGNATURE_LEN: usize = 20;
const HEADER_LEN: usize = FILE_TYPE_NOTE.len() + SIGNATURE_LEN;
const ADDRESS_LEN: usize = 4;

/// Page-block keys naming layer blocks, in drawing order.
pub const LAYER_KEYS: [&str; 5] = ["MAINLAYER", "LAYER1", "LAYER2", "LAYER3", "BGLAYER"];

/// Keys whose values are file offsets. They move whenever anything earlier
/// in the file changes size, so they are left out of page fingerprints.
const ADDRESS_KEYS: [&str; 9] = [
    "MAINLAYER",
    "LAYER1",
    "LAYER2",
    "LAYER3",
    "BGLAYER",
    "LAYERBITMAP",
    "TOTALPATH",
    "RECOGNTEXT",
    "RECOGNFILE",
];

fn metadata_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^:<>]+):([^<>]*)>").expect("valid metadata regex"))
}

fn page_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^PAGE(\d+)$").expect("valid page key regex"))
}

/// One layer of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMetadata {
    /// Page-block key the layer was found under (`MAINLAYER`, `BGLAYER`, ...).
    pub key: String,
    pub params: BTreeMap<String, String>,
    /// Hex MD5 of the layer's bitmap block, when it has one.
    pub bitmap_md5: Option<String>,
}

/// Structural metadata of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMetadata {
    /// 1-based page number from the footer.
    pub number: u32,
    pub params: BTreeMap<String, String>,
    pub layers: Vec<LayerMetadata>,
}

impl PageMetadata {
    /// Deterministic textual form of the page, used as the hash input for
    /// change detection.
    ///
    /// File offsets are excluded and bitmaps contribute their digest, so the
    /// string only changes when this page's own content changes.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        write_params(&mut out, "page", &self.params);
        for layer in &self.layers {
            out.push('|');
            write_params(&mut out, &layer.key, &layer.params);
            if let Some(md5) = &layer.bitmap_md5 {
                let _ = write!(out, ";bitmap={}", md5);
            }
        }
        out
    }

    pub fn style(&self) -> Option<&str> {
        self.params.get("PAGESTYLE").map(String::as_str)
    }
}

fn write_params(out: &mut String, label: &str, params: &BTreeMap<String, String>) {
    out.push_str(label);
    for (key, value) in params {
        if ADDRESS_KEYS.contains(&key.as_str()) {
            continue;
        }
        let _ = write!(out, ";{}={}", key, value);
    }
}

/// Parsed notebook metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookMetadata {
    pub signature: String,
    pub footer: BTreeMap<String, String>,
    pub pages: Vec<PageMetadata>,
}

impl NotebookMetadata {
    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }
}

/// Extracts notebook structure from raw file bytes.
pub trait NotebookParser: Send + Sync {
    fn parse(&self, data: &[u8]) -> Result<NotebookMetadata>;
}

/// Parser for the Supernote `.note` container.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupernoteParser;

impl SupernoteParser {
    pub fn new() -> Self {
        Self
    }
}

impl NotebookParser for SupernoteParser {
    fn parse(&self, data: &[u8]) -> Result<NotebookMetadata> {
        if data.len() < HEADER_LEN + ADDRESS_LEN {
            return Err(Error::Parse(format!(
                "file too short for a notebook: {} bytes",
                data.len()
            )));
        }
        if &data[..FILE_TYPE_NOTE.len()] != FILE_TYPE_NOTE.as_bytes() {
            return Err(Error::Parse("not a note file".to_string()));
        }
        let signature = std::str::from_utf8(&data[FILE_TYPE_NOTE.len()..HEADER_LEN])
            .map_err(|_| Error::Parse("signature is not ASCII".to_string()))?;
        if !signature.starts_with(SIGNATURE_PREFIX) {
            return Err(Error::Parse(format!("unknown signature {:?}", signature)));
        }

        let footer_address = read_u32(data, data.len() - ADDRESS_LEN)?;
        let footer = read_metadata(data, footer_address)?;

        let mut page_refs: Vec<(u32, u32)> = Vec::new();
        for (key, value) in &footer {
            let Some(caps) = page_key_regex().captures(key) else {
                continue;
            };
            let number: u32 = caps[1]
                .parse()
                .map_err(|_| Error::Parse(format!("bad page key {}", key)))?;
            page_refs.push((number, parse_address(key, value)?));
        }
        page_refs.sort_unstable_by_key(|(number, _)| *number);

        let pages = page_refs
            .into_iter()
            .map(|(number, address)| read_page(data, number, address))
            .collect::<Result<Vec<_>>>()?;

        Ok(NotebookMetadata {
            signature: signature.to_string(),
            footer,
            pages,
        })
    }
}

fn read_page(data: &[u8], number: u32, address: u32) -> Result<PageMetadata> {
    let params = read_metadata(data, address)?;
    let mut layers = Vec::new();
    for key in LAYER_KEYS {
        let Some(value) = params.get(key) else {
            continue;
        };
        let layer_address = parse_address(key, value)?;
        if layer_address == 0 {
            continue;
        }
        let layer_params = read_metadata(data, layer_address)?;
        let bitmap_md5 = match layer_params.get("LAYERBITMAP") {
            Some(v) => match parse_address("LAYERBITMAP", v)? {
                0 => None,
                bitmap => Some(format!("{:x}", md5::compute(read_block(data, bitmap)?))),
            },
            None => None,
        };
        layers.push(LayerMetadata {
            key: key.to_string(),
            params: layer_params,
            bitmap_md5,
        });
    }
    Ok(PageMetadata {
        number,
        params,
        layers,
    })
}

fn parse_address(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("{} is not an address: {:?}", key, value)))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + ADDRESS_LEN)
        .ok_or_else(|| Error::Parse(format!("address {} out of bounds", offset)))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_block(data: &[u8], address: u32) -> Result<&[u8]> {
    let start = address as usize;
    if start < HEADER_LEN {
        return Err(Error::Parse(format!("block address {} inside header", address)));
    }
    let len = read_u32(data, start)? as usize;
    let body = start + ADDRESS_LEN;
    data.get(body..body + len).ok_or_else(|| {
        Error::Parse(format!(
            "block at {} with length {} exceeds file size {}",
            address,
            len,
            data.len()
        ))
    })
}

fn read_metadata(data: &[u8], address: u32) -> Result<BTreeMap<String, String>> {
    let block = read_block(data, address)?;
    let text = std::str::from_utf8(block)
        .map_err(|_| Error::Parse(format!("metadata block at {} is not UTF-8", address)))?;
    Ok(metadata_regex()
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect())
}

/// Writes synthetic `.note` files in the container layout [`SupernoteParser`]
/// reads. Used by tests and fixtures.
#[derive(Debug, Clone, Default)]
pub struct NoteFileBuilder {
    pages: Vec<PageDraft>,
}

#[derive(Debug, Clone)]
struct PageDraft {
    style: String,
    layers: Vec<(String, Vec<u8>)>,
}

impl NoteFileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a page whose main layer holds `bitmap`.
    pub fn page(self, bitmap: impl Into<Vec<u8>>) -> Self {
        self.page_with_layers("style_white", vec![("MAINLAYER", bitmap.into())])
    }

    /// Add a page with explicit style and layers. Layer keys outside
    /// [`LAYER_KEYS`] are ignored by the parser.
    pub fn page_with_layers(mut self, style: &str, layers: Vec<(&str, Vec<u8>)>) -> Self {
        self.pages.push(PageDraft {
            style: style.to_string(),
            layers: layers
                .into_iter()
                .map(|(key, bitmap)| (key.to_string(), bitmap))
                .collect(),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(FILE_TYPE_NOTE.as_bytes());
        out.extend_from_slice(DEFAULT_SIGNATURE.as_bytes());

        let mut page_addresses = Vec::with_capacity(self.pages.len());
        for page in &self.pages {
            let mut layer_addresses = BTreeMap::new();
            for (key, bitmap) in &page.layers {
                let bitmap_address = write_block(&mut out, bitmap);
                let meta = format!(
                    "<LAYERTYPE:NOTE><LAYERPROTOCOL:RATTA_RLE><LAYERNAME:{}><LAYERBITMAP:{}>",
                    key, bitmap_address
                );
                layer_addresses.insert(key.as_str(), write_block(&mut out, meta.as_bytes()));
            }

            let mut meta = format!("<PAGESTYLE:{}>", page.style);
            for key in LAYER_KEYS {
                let address = layer_addresses.get(key).copied().unwrap_or(0);
                let _ = write!(meta, "<{}:{}>", key, address);
            }
            page_addresses.push(write_block(&mut out, meta.as_bytes()));
        }

        let mut footer = String::from("<FILE_FEATURE:24>");
        for (i, address) in page_addresses.iter().enumerate() {
            let _ = write!(footer, "<PAGE{}:{}>", i + 1, address);
        }
        let footer_address = write_block(&mut out, footer.as_bytes());
        out.extend_from_slice(&footer_address.to_le_bytes());
        out
    }
}

fn write_block(out: &mut Vec<u8>, body: &[u8]) -> u32 {
    let address = out.len() as u32;
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    address
}

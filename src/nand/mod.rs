//! Descriptions of how a raw NAND dump is laid out: which bytes of a page carry data and which
//! carry ECC, and which page ranges of the chip share one layout.

use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(unix)]
pub mod mapping;

/// What the bytes of one codeword entry are used for
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum PageCodewordType {
    #[default]
    Undefined,
    Data,
    Ecc,
    ServiceArea,
}

/// Parse the type letter of a codeword descriptor: `d` (data), `e` (ECC) or `s` (service area)
impl FromStr for PageCodewordType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.chars().next() {
            Some('d' | 'D') => Self::Data,
            Some('e' | 'E') => Self::Ecc,
            Some('s' | 'S') => Self::ServiceArea,
            Some(_) => bail!("unexpected page structure type '{s}'"),
            None => bail!("page structure type is empty"),
        })
    }
}

/// One contiguous byte range of a page.
///
/// The byte offset of an entry is the sum of the lengths of the entries before it, so the order of
/// entries inside a [PageStructure] is significant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageCodeword {
    /// Correlates data entries with the ECC entry protecting them
    pub tag: u32,

    /// Length in bytes
    pub len: u32,

    pub r#type: PageCodewordType,
}

impl PageCodeword {
    pub fn new(tag: u32, len: u32, r#type: PageCodewordType) -> Self {
        Self { tag, len, r#type }
    }

    pub fn data(tag: u32, len: u32) -> Self {
        Self::new(tag, len, PageCodewordType::Data)
    }

    pub fn ecc(tag: u32, len: u32) -> Self {
        Self::new(tag, len, PageCodewordType::Ecc)
    }

    pub fn service_area(tag: u32, len: u32) -> Self {
        Self::new(tag, len, PageCodewordType::ServiceArea)
    }
}

/// Parse strings like "TAG:LENGTH:TYPE"
impl FromStr for PageCodeword {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [tag, len, r#type]: [&str; 3] = s
            .split(':')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected tag:length:type, got '{s}'"))?;

        Ok(Self {
            tag: parse_number(tag)?,
            len: parse_number(len)?,
            r#type: r#type.parse()?,
        })
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
pub fn parse_number(s: &str) -> anyhow::Result<u32> {
    let s = s.trim();
    let value = match s.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("0x") => u32::from_str_radix(&s[2..], 16)?,
        _ => s.parse()?,
    };
    Ok(value)
}

/// The ordered codeword layout of one page
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PageStructure(Vec<PageCodeword>);

impl PageStructure {
    pub fn new(codewords: Vec<PageCodeword>) -> Self {
        Self(codewords)
    }

    pub fn codewords(&self) -> &[PageCodeword] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of bytes described
    pub fn byte_len(&self) -> u64 {
        self.0.iter().map(|cw| u64::from(cw.len)).sum()
    }
}

impl From<Vec<PageCodeword>> for PageStructure {
    fn from(codewords: Vec<PageCodeword>) -> Self {
        Self(codewords)
    }
}

impl FromIterator<PageCodeword> for PageStructure {
    fn from_iter<I: IntoIterator<Item = PageCodeword>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parse comma-separated codeword descriptors, e.g. "1:512:d,1:10:s,1:53:e,2:512:d,2:53:e"
impl FromStr for PageStructure {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        s.split(',').map(str::parse::<PageCodeword>).collect()
    }
}

/// A range of pages over which one [PageStructure] applies
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NandSection {
    pub structure: PageStructure,
    pub start_page: u32,

    /// Number of pages; 0 means "until the end of the image"
    pub page_count: u32,
}

impl NandSection {
    pub fn new(structure: PageStructure, start_page: u32, page_count: u32) -> Self {
        Self {
            structure,
            start_page,
            page_count,
        }
    }

    /// The first page past this section, or None if it runs to the end of the image
    pub fn end_page(&self) -> Option<u64> {
        match self.page_count {
            0 => None,
            count => Some(u64::from(self.start_page) + u64::from(count)),
        }
    }
}

/// The sections of a chip, ascending by start page and non-overlapping.
///
/// Pages between sections are not covered by any layout.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct NandStructure(Vec<NandSection>);

impl NandStructure {
    pub fn new(sections: Vec<NandSection>) -> anyhow::Result<Self> {
        for (index, pair) in sections.windows(2).enumerate() {
            let (prev, next) = (&pair[0], &pair[1]);
            let Some(prev_end) = prev.end_page() else {
                bail!("section {index} has implicit length but is not the last section");
            };
            ensure!(
                u64::from(next.start_page) >= prev_end,
                "section {} starts at page {} which overlaps section {index} (pages {}..{prev_end})",
                index + 1,
                next.start_page,
                prev.start_page,
            );
        }

        Ok(Self(sections))
    }

    pub fn sections(&self) -> &[NandSection] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Chains page structure descriptor groups into a [NandStructure].
///
/// Each group takes the page count set before its structure is replaced by the next one; start
/// pages accumulate from the previous group's count, offset by any `seek` given in between.
#[derive(Debug, Default)]
pub struct NandStructureBuilder {
    sections: Vec<NandSection>,
    pending: Option<PageStructure>,
    seek: u32,
    count: u32,
}

impl NandStructureBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the start page the pending group takes when it is closed
    pub fn seek(mut self, pages: u32) -> Self {
        self.seek = pages;
        self
    }

    /// Set the page count the pending group takes when it is closed; 0 (the default) runs to the
    /// end of the image.
    pub fn count(mut self, pages: u32) -> Self {
        self.count = pages;
        self
    }

    /// Begin a new group with the given layout, closing the current one.
    pub fn structure(mut self, structure: PageStructure) -> anyhow::Result<Self> {
        self.close_pending()?;
        self.pending = Some(structure);
        Ok(self)
    }

    fn close_pending(&mut self) -> anyhow::Result<()> {
        let Some(structure) = self.pending.take() else {
            return Ok(());
        };

        ensure!(
            self.sections.last().map_or(true, |s| s.page_count != 0),
            "Cannot chain multiple page structures with implicit length"
        );

        self.sections
            .push(NandSection::new(structure, self.seek, self.count));
        self.seek = self
            .seek
            .checked_add(self.count)
            .ok_or(anyhow::anyhow!("page numbers overflow"))?;
        self.count = 0;
        Ok(())
    }

    pub fn build(mut self) -> anyhow::Result<NandStructure> {
        self.close_pending()?;
        NandStructure::new(self.sections)
    }
}

#[test]
fn test_parse_codeword() -> anyhow::Result<()> {
    assert_eq!("1:512:d".parse::<PageCodeword>()?, PageCodeword::data(1, 512));
    assert_eq!("2:53:E".parse::<PageCodeword>()?, PageCodeword::ecc(2, 53));
    assert_eq!(
        "0x3:0x10:s".parse::<PageCodeword>()?,
        PageCodeword::service_area(3, 16)
    );
    assert_eq!("4:8:data".parse::<PageCodeword>()?, PageCodeword::data(4, 8));

    assert!("1:512".parse::<PageCodeword>().is_err());
    assert!("1:512:d:x".parse::<PageCodeword>().is_err());
    assert!("1:512:".parse::<PageCodeword>().is_err());
    assert!("1:512:x".parse::<PageCodeword>().is_err());
    assert!("one:512:d".parse::<PageCodeword>().is_err());
    Ok(())
}

#[test]
fn test_parse_structure() -> anyhow::Result<()> {
    let ps: PageStructure = "1:512:d,1:10:s,1:53:e,2:512:d,2:53:e".parse()?;
    assert_eq!(
        ps.codewords(),
        [
            PageCodeword::data(1, 512),
            PageCodeword::service_area(1, 10),
            PageCodeword::ecc(1, 53),
            PageCodeword::data(2, 512),
            PageCodeword::ecc(2, 53),
        ]
    );
    assert_eq!(ps.byte_len(), 1140);

    assert!("1:512:d,,1:53:e".parse::<PageStructure>().is_err());
    Ok(())
}

#[test]
fn test_structure_ordering() {
    let ps = PageStructure::new(vec![PageCodeword::data(0, 4), PageCodeword::ecc(0, 4)]);

    assert!(NandStructure::new(vec![
        NandSection::new(ps.clone(), 0, 4),
        NandSection::new(ps.clone(), 10, 4),
        NandSection::new(ps.clone(), 14, 0),
    ])
    .is_ok());

    // Overlap
    assert!(NandStructure::new(vec![
        NandSection::new(ps.clone(), 0, 4),
        NandSection::new(ps.clone(), 3, 4),
    ])
    .is_err());

    // Descending
    assert!(NandStructure::new(vec![
        NandSection::new(ps.clone(), 10, 4),
        NandSection::new(ps.clone(), 0, 4),
    ])
    .is_err());

    // Open-ended section that isn't last
    assert!(NandStructure::new(vec![
        NandSection::new(ps.clone(), 0, 0),
        NandSection::new(ps, 10, 4),
    ])
    .is_err());
}

#[test]
fn test_builder_chaining() -> anyhow::Result<()> {
    let first: PageStructure = "0:512:d,0:64:e".parse()?;
    let second: PageStructure = "0:1024:d,0:100:e".parse()?;

    let nand = NandStructureBuilder::new()
        .seek(2)
        .structure(first.clone())?
        .count(8)
        .structure(second.clone())?
        .build()?;

    assert_eq!(
        nand.sections(),
        [NandSection::new(first, 2, 8), NandSection::new(second, 10, 0)]
    );
    Ok(())
}

#[test]
fn test_builder_rejects_implicit_length_chain() -> anyhow::Result<()> {
    let ps: PageStructure = "0:512:d,0:64:e".parse()?;

    let result = NandStructureBuilder::new()
        .structure(ps.clone())?
        .structure(ps.clone())?
        .structure(ps);
    assert!(result.is_err());

    assert!(NandStructureBuilder::new().build()?.is_empty());
    Ok(())
}

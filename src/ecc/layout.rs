//! Per-section state derived once before a run: tag bounds and where each tag's codeword lives
//! inside a page.

use std::ops::Range;

use super::EccError;
use crate::nand::{NandSection, PageCodewordType, PageStructure};

/// The byte ranges (relative to the page start) of one tag's data run and ECC run
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct CodewordSpan {
    pub data: Range<usize>,
    pub ecc: Range<usize>,
}

#[derive(Debug)]
pub(crate) struct SectionLayout {
    pub start_page: u32,
    pub page_count: u32,
    pub tag_min: u32,
    pub tag_max: u32,

    /// One span per tag in `tag_min..=tag_max`
    pub spans: Vec<CodewordSpan>,
}

impl SectionLayout {
    /// Derive the layout of section number `index`, rejecting structures that can't be processed
    pub fn resolve(index: usize, section: &NandSection) -> Result<Self, EccError> {
        let codewords = section.structure.codewords();

        let tag_min = codewords.iter().map(|cw| cw.tag).min();
        let tag_max = codewords.iter().map(|cw| cw.tag).max();
        let (Some(tag_min), Some(tag_max)) = (tag_min, tag_max) else {
            return Err(EccError::EmptyStructure { section: index });
        };
        if tag_max == u32::MAX {
            return Err(EccError::TagOverflow { section: index });
        }

        let spans = (tag_min..=tag_max)
            .map(|tag| locate_tag(index, &section.structure, tag))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            start_page: section.start_page,
            page_count: section.page_count,
            tag_min,
            tag_max,
            spans,
        })
    }

    /// The first page past this section, or None if it runs to the end of the image
    pub fn end_page(&self) -> Option<u64> {
        match self.page_count {
            0 => None,
            count => Some(u64::from(self.start_page) + u64::from(count)),
        }
    }
}

/// Scan the structure in declared order for the entries carrying `tag`.
///
/// Data and service-area entries must form one contiguous run; exactly one ECC entry is allowed.
fn locate_tag(section: usize, structure: &PageStructure, tag: u32) -> Result<CodewordSpan, EccError> {
    let mut data: Option<Range<usize>> = None;
    let mut ecc: Option<Range<usize>> = None;

    let mut offset = 0usize;
    for cw in structure.codewords() {
        let range = offset..offset + cw.len as usize;
        offset = range.end;

        if cw.tag != tag {
            continue;
        }

        match cw.r#type {
            PageCodewordType::Ecc => {
                if ecc.is_some() {
                    return Err(EccError::MultipleEcc { section, tag });
                }
                ecc = Some(range);
            }
            PageCodewordType::Data | PageCodewordType::ServiceArea => match &mut data {
                None => data = Some(range),
                Some(run) if run.end == range.start => run.end = range.end,
                Some(_) => return Err(EccError::Holes { section, tag }),
            },
            PageCodewordType::Undefined => (),
        }
    }

    let data = data
        .filter(|run| !run.is_empty())
        .ok_or(EccError::MissingCodeword { section, tag })?;
    let ecc = ecc
        .filter(|run| !run.is_empty())
        .ok_or(EccError::MissingEcc { section, tag })?;

    Ok(CodewordSpan { data, ecc })
}

#[cfg(test)]
fn resolve_str(descriptors: &str) -> Result<SectionLayout, EccError> {
    let section = NandSection::new(descriptors.parse().unwrap(), 0, 0);
    SectionLayout::resolve(0, &section)
}

#[test]
fn test_single_codeword() {
    let layout = resolve_str("0:512:d,0:64:e").unwrap();
    assert_eq!((layout.tag_min, layout.tag_max), (0, 0));
    assert_eq!(
        layout.spans,
        [CodewordSpan {
            data: 0..512,
            ecc: 512..576
        }]
    );
}

#[test]
fn test_service_area_joins_data_run() {
    let layout = resolve_str("1:512:d,1:10:s,1:53:e,2:512:d,2:53:e").unwrap();
    assert_eq!((layout.tag_min, layout.tag_max), (1, 2));
    assert_eq!(
        layout.spans,
        [
            CodewordSpan {
                data: 0..522,
                ecc: 522..575
            },
            CodewordSpan {
                data: 575..1087,
                ecc: 1087..1140
            },
        ]
    );
}

#[test]
fn test_interleaved_tags() {
    // ECC placed before the data, and tags out of order
    let layout = resolve_str("5:8:e,4:16:d,5:16:d,4:8:e").unwrap();
    assert_eq!((layout.tag_min, layout.tag_max), (4, 5));
    assert_eq!(
        layout.spans,
        [
            CodewordSpan {
                data: 8..24,
                ecc: 40..48
            },
            CodewordSpan {
                data: 24..40,
                ecc: 0..8
            },
        ]
    );
}

#[test]
fn test_structure_errors() {
    assert!(matches!(
        resolve_str("0:512:d,0:32:e,0:32:e"),
        Err(EccError::MultipleEcc { tag: 0, .. })
    ));
    assert!(matches!(
        resolve_str("0:256:d,1:256:d,0:256:d,0:32:e,1:32:e"),
        Err(EccError::Holes { tag: 0, .. })
    ));
    assert!(matches!(
        resolve_str("0:512:d,0:64:e,2:512:d,2:64:e"),
        Err(EccError::MissingCodeword { tag: 1, .. })
    ));
    assert!(matches!(
        resolve_str("0:512:d,1:64:e"),
        Err(EccError::MissingEcc { tag: 0, .. })
    ));
    assert!(matches!(
        resolve_str("4294967295:512:d,4294967295:64:e"),
        Err(EccError::TagOverflow { .. })
    ));
    assert!(matches!(
        SectionLayout::resolve(3, &NandSection::new(Default::default(), 0, 0)),
        Err(EccError::EmptyStructure { section: 3 })
    ));
}

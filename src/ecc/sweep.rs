//! The address sweep: assigns every covered page of the image to exactly one section.

use super::layout::SectionLayout;

/// Cursor over an ascending list of sections, yielding `(section index, page)` for every page
/// that some section covers.
///
/// Pages in a gap between two sections are skipped. The sweep ends when the last section is done
/// or the image runs out of pages.
#[derive(Debug)]
pub(crate) struct Sweep<'a> {
    sections: &'a [SectionLayout],
    cursor: usize,
    page: u64,
    page_limit: u64,
}

impl<'a> Sweep<'a> {
    pub fn new(sections: &'a [SectionLayout], page_limit: u64) -> Self {
        let page = sections.first().map_or(0, |s| u64::from(s.start_page));
        Self {
            sections,
            cursor: 0,
            page,
            page_limit,
        }
    }
}

impl Sweep<'_> {
    /// How many pages a sweep over `sections` yields in total
    pub fn total_pages(sections: &[SectionLayout], page_limit: u64) -> u64 {
        sections
            .iter()
            .map(|s| {
                let start = u64::from(s.start_page).min(page_limit);
                let end = s.end_page().unwrap_or(page_limit).min(page_limit);
                end - start
            })
            .sum()
    }
}

impl Iterator for Sweep<'_> {
    type Item = (usize, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let mut section = self.sections.get(self.cursor)?;

        while section.end_page().is_some_and(|end| self.page >= end) {
            // Move on to the next section, jumping over any gap
            self.cursor += 1;
            section = self.sections.get(self.cursor)?;
            self.page = self.page.max(u64::from(section.start_page));
        }

        if self.page >= self.page_limit {
            return None;
        }

        let item = (self.cursor, self.page);
        self.page += 1;
        Some(item)
    }
}

#[cfg(test)]
fn sections(ranges: &[(u32, u32)]) -> Vec<SectionLayout> {
    use crate::nand::NandSection;

    ranges
        .iter()
        .enumerate()
        .map(|(i, &(start, count))| {
            let section = NandSection::new("0:4:d,0:4:e".parse().unwrap(), start, count);
            SectionLayout::resolve(i, &section).unwrap()
        })
        .collect()
}

#[test]
fn test_single_section() {
    let layouts = sections(&[(0, 10)]);
    let pages: Vec<_> = Sweep::new(&layouts, 100).collect();
    assert_eq!(pages, (0..10).map(|p| (0, p)).collect::<Vec<_>>());
}

#[test]
fn test_gap_is_skipped() {
    let layouts = sections(&[(0, 4), (10, 4)]);
    let pages: Vec<_> = Sweep::new(&layouts, 100).collect();
    assert_eq!(
        pages,
        [
            (0, 0),
            (0, 1),
            (0, 2),
            (0, 3),
            (1, 10),
            (1, 11),
            (1, 12),
            (1, 13)
        ]
    );
}

#[test]
fn test_adjacent_and_open_ended() {
    let layouts = sections(&[(2, 2), (4, 1), (5, 0)]);
    let pages: Vec<_> = Sweep::new(&layouts, 8).collect();
    assert_eq!(
        pages,
        [(0, 2), (0, 3), (1, 4), (2, 5), (2, 6), (2, 7)]
    );
}

#[test]
fn test_image_end_stops_sweep() {
    // Section runs past the end of the image
    let layouts = sections(&[(0, 10)]);
    assert_eq!(Sweep::new(&layouts, 3).count(), 3);

    // Next section starts beyond the end of the image
    let layouts = sections(&[(0, 2), (50, 2)]);
    assert_eq!(Sweep::new(&layouts, 10).count(), 2);

    // First section starts beyond the end of the image
    let layouts = sections(&[(20, 0)]);
    assert_eq!(Sweep::new(&layouts, 10).count(), 0);
}

#[test]
fn test_no_sections() {
    assert_eq!(Sweep::new(&[], 10).count(), 0);
}

#[test]
fn test_total_pages_matches_sweep() {
    let cases: [(&[(u32, u32)], u64); 6] = [
        (&[(0, 10)], 100),
        (&[(0, 10)], 3),
        (&[(0, 4), (10, 4)], 100),
        (&[(0, 4), (10, 4)], 12),
        (&[(2, 2), (4, 1), (5, 0)], 8),
        (&[(0, 2), (50, 2)], 10),
    ];

    for (ranges, limit) in cases {
        let layouts = sections(ranges);
        assert_eq!(
            Sweep::total_pages(&layouts, limit),
            Sweep::new(&layouts, limit).count() as u64,
            "{ranges:?} limit {limit}"
        );
    }
    assert_eq!(Sweep::total_pages(&[], 10), 0);
}

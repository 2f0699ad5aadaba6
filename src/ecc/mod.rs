//! The ECC correction engine.
//!
//! A dump is walked page by page according to a [NandStructure]. For every page, each tag of the
//! governing [PageStructure](crate::nand::PageStructure) yields one codeword (a contiguous data
//! run plus its ECC run), which is handed to a [CodewordHandler]:
//!
//! ```text
//!                          +--> worker 0 --+
//! sweep (calling thread) --+--> worker 1 --+--> CodewordHandler (concurrently)
//!    one unit per page     +--> worker N --+
//! ```
//!
//! The sweep over sections is sequential, because section boundaries are resolved in order; the
//! per-page work is spread over a fixed pool of threads fed through a bounded [WorkQueue].
//!
//! Input and output may be the same memory ("in place" mode). Every page is owned by exactly one
//! worker at a time and pages never overlap, so a worker's writes are never observed mid-page by
//! another worker.

mod bch;
mod layout;
mod queue;
mod sweep;
mod worker;

pub use bch::{
    ecc_bch, BchCorrector, BchDecode, BchOutcome, BchParams, EccConfig, EccReport, EccSummary,
};
pub use queue::{Work, WorkQueue};

use crate::nand::NandStructure;

use layout::SectionLayout;
use sweep::Sweep;
use thiserror::Error;
use tracing::{debug, info};
use worker::{Image, PageWork, WorkerPool};

/// How many queued pages each worker may have in flight before the sweep blocks
const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Error, Debug)]
pub enum EccError {
    #[error("page size cannot be 0")]
    ZeroPageSize,
    #[error("output is {output} bytes but input is {input} bytes")]
    LengthMismatch { input: usize, output: usize },
    #[error("image has {pages} pages, more than can be addressed")]
    ImageTooLarge { pages: u64 },
    #[error("section {section}: page structure is empty")]
    EmptyStructure { section: usize },
    #[error("section {section}: max page structure tag too large")]
    TagOverflow { section: usize },
    #[error("section {section}: multiple ECC definitions for codeword with tag {tag}")]
    MultipleEcc { section: usize, tag: u32 },
    #[error("section {section}: ECC correction not supported for codeword with holes (tag {tag})")]
    Holes { section: usize, tag: u32 },
    #[error("section {section}: failed to find codeword with tag {tag}")]
    MissingCodeword { section: usize, tag: u32 },
    #[error("section {section}: failed to find ECC with tag {tag}")]
    MissingEcc { section: usize, tag: u32 },
    #[error("page 0x{page:x}: {what} with tag {tag} goes out of image bounds")]
    OutOfBounds {
        page: u32,
        tag: u32,
        what: &'static str,
    },
}

/// One codeword of one page, as seen by a [CodewordHandler].
///
/// `data` and `ecc` are private copies of the page bytes, so a handler may correct them in place.
#[derive(Debug)]
pub struct Codeword<'a> {
    /// Index of the page within the image
    pub page: u32,

    /// Index of the codeword within the page, counting tags from the lowest
    pub index: u32,

    /// Byte offset of the data run within the page
    pub data_offset: usize,

    /// Byte offset of the ECC run within the page
    pub ecc_offset: usize,

    pub data: &'a mut [u8],
    pub ecc: &'a mut [u8],

    /// Whether [Disposition::WriteBack] has anywhere to write to
    pub writable: bool,
}

/// What to do with a codeword's buffers once the handler is done with them
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Disposition {
    /// Leave the output untouched
    Keep,

    /// Copy `data` and `ecc` to the output at the codeword's location
    WriteBack,
}

/// Receives every codeword of a run.
///
/// Handlers are invoked concurrently from several worker threads with no ordering between pages;
/// any aggregation has to go through atomics or other synchronization.
pub trait CodewordHandler: Sync {
    fn handle(&self, codeword: &mut Codeword<'_>) -> Disposition;
}

impl<F> CodewordHandler for F
where
    F: Fn(&mut Codeword<'_>) -> Disposition + Sync,
{
    fn handle(&self, codeword: &mut Codeword<'_>) -> Disposition {
        self(codeword)
    }
}

/// Process every page of `input` covered by `nand`, returning the number of pages processed.
///
/// If `output` is given it must be as long as `input`; codewords the handler asks to write back
/// land there. Pages not covered by any section are never touched.
///
/// `threads == 0` is treated as 1.
pub fn process_pages<H: CodewordHandler + ?Sized>(
    input: &[u8],
    output: Option<&mut [u8]>,
    page_size: usize,
    nand: &NandStructure,
    handler: &H,
    threads: u32,
) -> Result<u32, EccError> {
    let image = match output {
        Some(output) => {
            if output.len() != input.len() {
                return Err(EccError::LengthMismatch {
                    input: input.len(),
                    output: output.len(),
                });
            }
            Image::copy(input, output)
        }
        None => Image::read_only(input),
    };

    run(image, page_size, nand, handler, threads)
}

/// Like [process_pages], but the image is both input and output.
pub fn process_pages_in_place<H: CodewordHandler + ?Sized>(
    image: &mut [u8],
    page_size: usize,
    nand: &NandStructure,
    handler: &H,
    threads: u32,
) -> Result<u32, EccError> {
    run(Image::in_place(image), page_size, nand, handler, threads)
}

fn run<H: CodewordHandler + ?Sized>(
    image: Image<'_>,
    page_size: usize,
    nand: &NandStructure,
    handler: &H,
    threads: u32,
) -> Result<u32, EccError> {
    if page_size == 0 {
        return Err(EccError::ZeroPageSize);
    }

    let pages_in_image = image.len().div_ceil(page_size) as u64;
    if pages_in_image > u64::from(u32::MAX) + 1 {
        return Err(EccError::ImageTooLarge {
            pages: pages_in_image,
        });
    }

    // Sections starting past the end of the image are never reached, so they aren't checked
    let layouts = nand
        .sections()
        .iter()
        .take_while(|section| u64::from(section.start_page) < pages_in_image)
        .enumerate()
        .map(|(index, section)| SectionLayout::resolve(index, section))
        .collect::<Result<Vec<_>, _>>()?;

    let threads = threads.max(1);
    let pool = WorkerPool::new(
        image,
        page_size,
        handler,
        threads as usize * QUEUE_DEPTH_PER_WORKER,
    );

    debug!("Starting {threads} threads");
    let processed = pool.run(threads, |pool| {
        let rpt = howudoin::new()
            .label("Processing pages")
            .set_len(Sweep::total_pages(&layouts, pages_in_image));

        let mut current = None;
        for (index, page) in Sweep::new(&layouts, pages_in_image) {
            let layout = &layouts[index];
            if current != Some(index) {
                current = Some(index);
                let end_page = layout.end_page().unwrap_or(0);
                info!(
                    "[{index}] Processing pagestructure from page 0x{:08x} ({:10}) until page 0x{end_page:08x} ({end_page:10})",
                    layout.start_page, layout.start_page
                );
            }

            let offset = page as usize * page_size;
            if !pool.post(PageWork { layout, offset }) {
                break;
            }
            rpt.inc();
        }

        rpt.close();
    })?;

    debug!("all threads finished");
    Ok(processed)
}

#[cfg(test)]
use crate::nand::NandSection;

#[cfg(test)]
fn nand_structure(descriptors: &str, sections: &[(u32, u32)]) -> NandStructure {
    let structure: crate::nand::PageStructure = descriptors.parse().unwrap();
    NandStructure::new(
        sections
            .iter()
            .map(|&(start, count)| NandSection::new(structure.clone(), start, count))
            .collect(),
    )
    .unwrap()
}

/// Remembers every codeword it sees, without asking for any writes
#[cfg(test)]
#[derive(Default)]
struct Census(std::sync::Mutex<Vec<(u32, u32, usize, usize, usize, usize)>>);

#[cfg(test)]
impl CodewordHandler for Census {
    fn handle(&self, cw: &mut Codeword<'_>) -> Disposition {
        self.0.lock().unwrap().push((
            cw.page,
            cw.index,
            cw.data_offset,
            cw.data.len(),
            cw.ecc_offset,
            cw.ecc.len(),
        ));
        Disposition::Keep
    }
}

#[cfg(test)]
impl Census {
    fn sorted(self) -> Vec<(u32, u32, usize, usize, usize, usize)> {
        let mut seen = self.0.into_inner().unwrap();
        seen.sort();
        seen
    }
}

#[test]
fn test_single_section() -> anyhow::Result<()> {
    let nand = nand_structure("0:512:d,0:64:e", &[(0, 10)]);
    let input = vec![0x5Au8; 5760];

    let census = Census::default();
    assert_eq!(process_pages(&input, None, 576, &nand, &census, 4)?, 10);

    let expected: Vec<_> = (0..10).map(|page| (page, 0, 0, 512, 512, 64)).collect();
    assert_eq!(census.sorted(), expected);
    Ok(())
}

#[test]
fn test_zero_threads_means_one() -> anyhow::Result<()> {
    let nand = nand_structure("0:12:d,0:4:e", &[(0, 0)]);
    let input = vec![0u8; 16 * 7];

    let census = Census::default();
    assert_eq!(process_pages(&input, None, 16, &nand, &census, 0)?, 7);
    assert_eq!(census.sorted().len(), 7);
    Ok(())
}

#[test]
fn test_codewords_carry_page_bytes() -> anyhow::Result<()> {
    let nand = nand_structure("1:4:d,1:2:s,1:2:e,2:6:d,2:2:e", &[(0, 0)]);
    let input: Vec<u8> = (0..=255).collect();

    let seen = std::sync::Mutex::new(Vec::new());
    let processed = process_pages(
        &input,
        None,
        16,
        &nand,
        &|cw: &mut Codeword<'_>| {
            assert!(!cw.writable);
            let page_start = cw.page as usize * 16;
            assert_eq!(cw.data, &input[page_start + cw.data_offset..][..cw.data.len()]);
            assert_eq!(cw.ecc, &input[page_start + cw.ecc_offset..][..cw.ecc.len()]);
            seen.lock().unwrap().push((cw.page, cw.index, cw.data.to_vec(), cw.ecc.to_vec()));
            Disposition::WriteBack
        },
        2,
    )?;
    assert_eq!(processed, 16);

    let mut seen = seen.into_inner().unwrap();
    seen.sort();
    assert_eq!(seen.len(), 32);
    assert_eq!(seen[2], (1, 0, vec![16, 17, 18, 19, 20, 21], vec![22, 23]));
    assert_eq!(seen[3], (1, 1, vec![24, 25, 26, 27, 28, 29], vec![30, 31]));
    Ok(())
}

#[test]
fn test_gap_is_never_touched() -> anyhow::Result<()> {
    const PAGE: usize = 16;
    let nand = nand_structure("0:12:d,0:4:e", &[(0, 4), (10, 4)]);
    let input: Vec<u8> = (0..PAGE * 20).map(|i| (i * 7) as u8).collect();
    let mut output = vec![0xEEu8; input.len()];

    let census = Census::default();
    let processed = process_pages(
        &input,
        Some(&mut output[..]),
        PAGE,
        &nand,
        &|cw: &mut Codeword<'_>| {
            assert!(cw.writable);
            census.handle(cw);
            cw.data.iter_mut().for_each(|b| *b = !*b);
            Disposition::WriteBack
        },
        3,
    )?;
    assert_eq!(processed, 8);

    let pages: Vec<u32> = census.sorted().into_iter().map(|c| c.0).collect();
    assert_eq!(pages, [0, 1, 2, 3, 10, 11, 12, 13]);

    for (page, (out, inp)) in output
        .chunks_exact(PAGE)
        .zip(input.chunks_exact(PAGE))
        .enumerate()
    {
        if (0..4).contains(&page) || (10..14).contains(&page) {
            let inverted: Vec<u8> = inp[..12].iter().map(|b| !b).collect();
            assert_eq!(out[..12], inverted, "page {page}");
            assert_eq!(out[12..], inp[12..], "page {page}");
        } else {
            assert!(out.iter().all(|&b| b == 0xEE), "page {page}");
        }
    }
    Ok(())
}

#[test]
fn test_thread_count_does_not_change_totals() -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU64, Ordering};

    let nand = nand_structure("0:20:d,1:20:d,0:4:e,1:4:e,2:10:d,2:6:s,2:4:e", &[(0, 0)]);
    let input: Vec<u8> = (0..68 * 300).map(|i| (i * 31 + i / 68) as u8).collect();

    let totals = |threads| -> anyhow::Result<(u32, u64, u64, u64)> {
        let codewords = AtomicU64::new(0);
        let data_sum = AtomicU64::new(0);
        let ecc_xor = AtomicU64::new(0);

        let processed = process_pages(
            &input,
            None,
            68,
            &nand,
            &|cw: &mut Codeword<'_>| {
                codewords.fetch_add(1, Ordering::Relaxed);
                let sum: u64 = cw.data.iter().map(|&b| u64::from(b)).sum();
                data_sum.fetch_add(sum * u64::from(cw.index + 1), Ordering::Relaxed);
                for &b in cw.ecc.iter() {
                    ecc_xor.fetch_xor(u64::from(b) << (cw.page % 56), Ordering::Relaxed);
                }
                Disposition::Keep
            },
            threads,
        )?;

        Ok((
            processed,
            codewords.into_inner(),
            data_sum.into_inner(),
            ecc_xor.into_inner(),
        ))
    };

    let single = totals(1)?;
    assert_eq!((single.0, single.1), (300, 900));
    for threads in [2, 3, 8, 17] {
        assert_eq!(totals(threads)?, single, "{threads} threads");
    }
    Ok(())
}

#[cfg(test)]
fn structure_error(descriptors: &str) -> EccError {
    let nand = nand_structure(descriptors, &[(0, 0)]);
    let input = vec![0u8; 576 * 4];
    let census = Census::default();

    let error = process_pages(&input, None, 576, &nand, &census, 2).unwrap_err();
    assert!(census.sorted().is_empty(), "{descriptors}");
    error
}

#[test]
fn test_structure_errors_process_nothing() {
    assert!(matches!(
        structure_error("0:512:d,0:32:e,0:32:e"),
        EccError::MultipleEcc { tag: 0, .. }
    ));
    assert!(matches!(
        structure_error("0:256:d,1:256:d,0:32:e,0:32:d"),
        EccError::Holes { tag: 0, .. }
    ));
    assert!(matches!(
        structure_error("0:512:d,0:32:e,2:16:d,2:16:e"),
        EccError::MissingCodeword { tag: 1, .. }
    ));
}

#[test]
fn test_setup_errors() {
    let nand = nand_structure("0:512:d,0:64:e", &[(0, 0)]);
    let input = vec![0u8; 576 * 2];
    let census = Census::default();

    let mut short = vec![0u8; 576];
    assert!(matches!(
        process_pages(&input, Some(&mut short[..]), 576, &nand, &census, 1),
        Err(EccError::LengthMismatch {
            input: 1152,
            output: 576
        })
    ));
    assert!(matches!(
        process_pages(&input, None, 0, &nand, &census, 1),
        Err(EccError::ZeroPageSize)
    ));
    assert!(census.sorted().is_empty());
}

#[test]
fn test_out_of_bounds_aborts_run() {
    let nand = nand_structure("0:512:d,0:64:e", &[(0, 0)]);

    // A trailing partial page
    let input = vec![0u8; 576 * 6 + 100];
    let result = process_pages(&input, None, 576, &nand, &Census::default(), 2);
    assert!(matches!(
        result,
        Err(EccError::OutOfBounds {
            page: 6,
            tag: 0,
            what: "codeword"
        })
    ));

    // ECC run past the end
    let input = vec![0u8; 576 * 6 + 520];
    let result = process_pages(&input, None, 576, &nand, &Census::default(), 2);
    assert!(matches!(
        result,
        Err(EccError::OutOfBounds {
            page: 6,
            what: "ecc",
            ..
        })
    ));
}

#[test]
fn test_unreachable_section_is_not_checked() -> anyhow::Result<()> {
    let good: crate::nand::PageStructure = "0:12:d,0:4:e".parse()?;
    let broken: crate::nand::PageStructure = "0:12:d,0:2:e,0:2:e".parse()?;
    let nand = NandStructure::new(vec![
        NandSection::new(good, 0, 4),
        NandSection::new(broken, 100, 0),
    ])?;

    let census = Census::default();
    assert_eq!(process_pages(&[0u8; 16 * 8], None, 16, &nand, &census, 2)?, 4);
    assert_eq!(census.sorted().len(), 4);

    // Still rejected once the image reaches it
    assert!(matches!(
        process_pages(&[0u8; 16 * 101], None, 16, &nand, &Census::default(), 2),
        Err(EccError::MultipleEcc { section: 1, .. })
    ));
    Ok(())
}

#[test]
fn test_panicking_handler_ends_run() {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let nand = nand_structure("0:12:d,0:4:e", &[(0, 0)]);
    let input = vec![0u8; 16 * 100];

    for threads in [1, 3] {
        let result = catch_unwind(AssertUnwindSafe(|| {
            process_pages(
                &input,
                None,
                16,
                &nand,
                &|cw: &mut Codeword<'_>| {
                    if cw.page >= 2 {
                        panic!("cannot handle page {}", cw.page);
                    }
                    Disposition::Keep
                },
                threads,
            )
        }));
        assert!(result.is_err(), "{threads} threads");
    }
}

#[test]
fn test_no_sections() -> anyhow::Result<()> {
    let census = Census::default();
    let processed = process_pages(&[0u8; 64], None, 16, &NandStructure::default(), &census, 2)?;
    assert_eq!(processed, 0);
    assert!(census.sorted().is_empty());
    Ok(())
}

#[test]
fn test_in_place_correction() -> anyhow::Result<()> {
    use bch::FirstByteDecoder;

    // tag 0: data 0..3, ecc 3..5; tag 1: data 5..6, ecc 6..8
    let nand = nand_structure("0:3:d,0:2:e,1:1:d,1:2:e", &[(0, 0)]);

    let mut image = Vec::new();
    for page in 0..6 {
        let v0 = [0x10, 0x11, 0xEF][page % 3];
        let v1 = [0x20, 0x21][page % 2];
        image.extend_from_slice(&[v0, 0xAA, 0xBB, 0x10, 2, v1, 0x20, 0]);
    }
    let original = image.clone();

    let corrector = BchCorrector::new(FirstByteDecoder, BchParams::new(0x11d));
    let processed = process_pages_in_place(&mut image, 8, &nand, &corrector, 3)?;
    assert_eq!(processed, 6);

    for (page, (now, was)) in image.chunks_exact(8).zip(original.chunks_exact(8)).enumerate() {
        let expected_v0 = match page % 3 {
            2 => 0xEF,
            _ => 0x10,
        };
        assert_eq!(now[0], expected_v0, "page {page}");
        assert_eq!(now[1..], was[1..], "page {page}");
    }

    assert_eq!(
        corrector.report().summary(processed),
        EccSummary {
            processed_pages: 6,
            good: 5,
            corrected: 2,
            uncorrectable: 5,
            bitflips: 2,
        }
    );
    Ok(())
}

//! BCH correction of codewords: the adapter around a BCH decode primitive, its configuration, and
//! a [CodewordHandler] that tallies how a run went.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{bail, ensure};
use tracing::{debug, warn};

use super::{Codeword, CodewordHandler, Disposition};
use crate::nand::parse_number;
use crate::util::InvertExt;

/// A BCH decoder, such as a binding to the Linux kernel's `lib/bch.c`.
///
/// `decode` checks `data` against `ecc` using the code generated by `polynomial`, with the
/// number of correctable bits following from the ECC length. Corrections are made in place in
/// both buffers. It returns 0 if the codeword was clean, the number of corrected bits if that is
/// positive, or a negative value if the codeword is uncorrectable (the buffers then hold
/// whatever the decoder left there).
pub trait BchDecode: Sync {
    fn decode(&self, polynomial: u32, bit_reversal: bool, data: &mut [u8], ecc: &mut [u8]) -> i32;
}

impl<D: BchDecode + ?Sized> BchDecode for &D {
    fn decode(&self, polynomial: u32, bit_reversal: bool, data: &mut [u8], ecc: &mut [u8]) -> i32 {
        (**self).decode(polynomial, bit_reversal, data, ecc)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BchParams {
    /// Primitive polynomial of the Galois field
    pub polynomial: u32,

    /// Process bits of each byte LSB first
    pub bit_reversal: bool,

    /// The chip stores bits inverted
    pub polarity_invert: bool,
}

impl BchParams {
    pub fn new(polynomial: u32) -> Self {
        Self {
            polynomial,
            bit_reversal: false,
            polarity_invert: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BchOutcome {
    Clean,
    Corrected(u32),
    Uncorrectable,
}

impl From<i32> for BchOutcome {
    fn from(result: i32) -> Self {
        match result {
            0 => Self::Clean,
            n if n > 0 => Self::Corrected(n.unsigned_abs()),
            _ => Self::Uncorrectable,
        }
    }
}

/// Decode one codeword in place.
///
/// With `polarity_invert`, both buffers are complemented around the decode, so corrected bytes
/// come back in the chip's own polarity. Nothing is retried.
pub fn ecc_bch<D: BchDecode + ?Sized>(
    decoder: &D,
    params: &BchParams,
    data: &mut [u8],
    ecc: &mut [u8],
) -> BchOutcome {
    if params.polarity_invert {
        data.invert();
        ecc.invert();
    }

    let result = decoder.decode(params.polynomial, params.bit_reversal, data, ecc);

    if params.polarity_invert {
        data.invert();
        ecc.invert();
    }

    result.into()
}

/// The ECC settings of a run
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EccConfig {
    Bch(BchParams),
}

/// Parse strings like "ALGORITHM,POLYNOMIAL[,FLAGS...]", e.g. "bch,17475,i,r".
///
/// Flags are `i` (polarity invert) and `r` (bit reversal); several may share one entry ("ir").
impl FromStr for EccConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split(',');
        let algorithm = parts.next().unwrap_or_default();
        ensure!(
            algorithm.eq_ignore_ascii_case("bch"),
            "Unknown ECC algorithm '{algorithm}'"
        );

        let Some(polynomial) = parts.next() else {
            bail!("missing poly argument for BCH");
        };
        let polynomial = parse_number(polynomial)?;
        ensure!(polynomial != 0, "BCH polynom cannot be 0!");

        let mut params = BchParams::new(polynomial);
        for flags in parts {
            ensure!(!flags.is_empty(), "empty BCH arg");
            for flag in flags.chars() {
                match flag.to_ascii_lowercase() {
                    'i' => params.polarity_invert = true,
                    'r' => params.bit_reversal = true,
                    _ => bail!("unexpected BCH arg '{flags}'"),
                }
            }
        }

        Ok(Self::Bch(params))
    }
}

/// Running totals of a correction run, safe to update from every worker
#[derive(Debug, Default)]
pub struct EccReport {
    good: AtomicU32,
    corrected: AtomicU32,
    uncorrectable: AtomicU32,
    bitflips: AtomicU64,
}

impl EccReport {
    pub fn record(&self, outcome: BchOutcome) {
        match outcome {
            BchOutcome::Clean => {
                self.good.fetch_add(1, Ordering::Relaxed);
            }
            BchOutcome::Corrected(bits) => {
                self.corrected.fetch_add(1, Ordering::Relaxed);
                self.bitflips.fetch_add(u64::from(bits), Ordering::Relaxed);
            }
            BchOutcome::Uncorrectable => {
                self.uncorrectable.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Snapshot the totals, along with the page count returned by the run
    pub fn summary(&self, processed_pages: u32) -> EccSummary {
        EccSummary {
            processed_pages,
            good: self.good.load(Ordering::Relaxed),
            corrected: self.corrected.load(Ordering::Relaxed),
            uncorrectable: self.uncorrectable.load(Ordering::Relaxed),
            bitflips: self.bitflips.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EccSummary {
    pub processed_pages: u32,
    pub good: u32,
    pub corrected: u32,
    pub uncorrectable: u32,
    pub bitflips: u64,
}

impl EccSummary {
    pub fn codewords(&self) -> u64 {
        u64::from(self.good) + u64::from(self.corrected) + u64::from(self.uncorrectable)
    }

    fn percent(&self, count: u32) -> f64 {
        match self.codewords() {
            0 => 0.0,
            total => count as f64 * 100.0 / total as f64,
        }
    }
}

/// The end-of-run ECC report
impl fmt::Display for EccSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            processed_pages,
            good,
            corrected,
            uncorrectable,
            bitflips,
        } = *self;

        writeln!(f, "ECC Report:")?;
        writeln!(
            f,
            "Processed     pages    : 0x{processed_pages:08x} | {processed_pages:10}"
        )?;
        writeln!(
            f,
            "Good          codewords: 0x{good:08x} | {good:10} [{:5.2}%]",
            self.percent(good)
        )?;
        writeln!(
            f,
            "Corrected     codewords: 0x{corrected:08x} | {corrected:10} [{:5.2}%] corrected bitflips 0x{bitflips:08x} ({bitflips})",
            self.percent(corrected)
        )?;
        write!(
            f,
            "Uncorrectable codewords: 0x{uncorrectable:08x} | {uncorrectable:10} [{:5.2}%]",
            self.percent(uncorrectable)
        )
    }
}

/// Corrects every codeword with BCH and counts the outcomes.
///
/// Corrected (and clean) codewords are written back; uncorrectable ones leave the output as it
/// was.
#[derive(Debug)]
pub struct BchCorrector<D> {
    decoder: D,
    params: BchParams,
    report: EccReport,
}

impl<D: BchDecode> BchCorrector<D> {
    pub fn new(decoder: D, params: BchParams) -> Self {
        Self {
            decoder,
            params,
            report: Default::default(),
        }
    }

    pub fn report(&self) -> &EccReport {
        &self.report
    }
}

impl<D: BchDecode> CodewordHandler for BchCorrector<D> {
    fn handle(&self, codeword: &mut Codeword<'_>) -> Disposition {
        let outcome = ecc_bch(&self.decoder, &self.params, codeword.data, codeword.ecc);
        self.report.record(outcome);

        match outcome {
            BchOutcome::Clean => Disposition::WriteBack,
            BchOutcome::Corrected(bits) => {
                debug!(
                    "Corrected {bits} bits in Page 0x{:x} CW {}",
                    codeword.page, codeword.index
                );
                Disposition::WriteBack
            }
            BchOutcome::Uncorrectable => {
                warn!(
                    "Uncorrectable errors in Page 0x{:x} CW {}",
                    codeword.page, codeword.index
                );
                Disposition::Keep
            }
        }
    }
}

/// A stand-in decoder: `ecc[0]` must equal the first data byte, and a mismatch in up to
/// `ecc[1]` bits is "corrected" by copying `ecc[0]` over it. A mismatch in more bits is
/// uncorrectable.
#[cfg(test)]
pub(crate) struct FirstByteDecoder;

#[cfg(test)]
impl BchDecode for FirstByteDecoder {
    fn decode(&self, _polynomial: u32, _bit_reversal: bool, data: &mut [u8], ecc: &mut [u8]) -> i32 {
        let flipped = (data[0] ^ ecc[0]).count_ones();
        if flipped > u32::from(ecc[1]) {
            data[0] = !data[0];
            return -1;
        }
        data[0] = ecc[0];
        flipped as i32
    }
}

#[test]
fn test_parse_config() -> anyhow::Result<()> {
    assert_eq!(
        "bch,19729,i,r".parse::<EccConfig>()?,
        EccConfig::Bch(BchParams {
            polynomial: 19729,
            bit_reversal: true,
            polarity_invert: true,
        })
    );
    assert_eq!(
        "BCH,0x4443".parse::<EccConfig>()?,
        EccConfig::Bch(BchParams::new(0x4443))
    );
    assert_eq!(
        "bch,17475,ir".parse::<EccConfig>()?,
        "bch,17475,R,I".parse::<EccConfig>()?
    );
    assert_eq!(
        "bch,17475,r".parse::<EccConfig>()?,
        EccConfig::Bch(BchParams {
            polynomial: 17475,
            bit_reversal: true,
            polarity_invert: false,
        })
    );

    assert!("rs,19729".parse::<EccConfig>().is_err());
    assert!("bch".parse::<EccConfig>().is_err());
    assert!("bch,0".parse::<EccConfig>().is_err());
    assert!("bch,abc".parse::<EccConfig>().is_err());
    assert!("bch,19729,x".parse::<EccConfig>().is_err());
    assert!("bch,19729,".parse::<EccConfig>().is_err());
    Ok(())
}

#[test]
fn test_outcome_from_raw() {
    assert_eq!(BchOutcome::from(0), BchOutcome::Clean);
    assert_eq!(BchOutcome::from(3), BchOutcome::Corrected(3));
    assert_eq!(BchOutcome::from(-74), BchOutcome::Uncorrectable);
}

#[test]
fn test_polarity_invert_wraps_decode() {
    // Records what the decoder was shown
    struct Spy(std::sync::Mutex<Vec<u8>>);
    impl BchDecode for Spy {
        fn decode(&self, polynomial: u32, bit_reversal: bool, data: &mut [u8], ecc: &mut [u8]) -> i32 {
            assert_eq!((polynomial, bit_reversal), (0x201b, true));
            let mut seen = self.0.lock().unwrap();
            seen.extend_from_slice(data);
            seen.extend_from_slice(ecc);
            0
        }
    }

    let spy = Spy(Default::default());
    let params = BchParams {
        polynomial: 0x201b,
        bit_reversal: true,
        polarity_invert: true,
    };
    let mut data = [0x00, 0x0F, 0xAA];
    let mut ecc = [0xFF, 0x55];

    assert_eq!(ecc_bch(&spy, &params, &mut data, &mut ecc), BchOutcome::Clean);
    assert_eq!(*spy.0.lock().unwrap(), [0xFF, 0xF0, 0x55, 0x00, 0xAA]);

    // Polarity restored afterwards
    assert_eq!(data, [0x00, 0x0F, 0xAA]);
    assert_eq!(ecc, [0xFF, 0x55]);
}

#[test]
fn test_polarity_invert_keeps_corrections() {
    let mut params = BchParams::new(1);

    // Stored inverted: logical data 0x3C with ECC 0x3C, one bit flipped in the data
    let mut data = [!0x3Du8, 0x00];
    let mut ecc = [!0x3Cu8, !0x02u8];
    params.polarity_invert = true;
    assert_eq!(
        ecc_bch(&FirstByteDecoder, &params, &mut data, &mut ecc),
        BchOutcome::Corrected(1)
    );
    assert_eq!(data[0], !0x3C);
    assert_eq!(ecc, [!0x3C, !0x02]);
}

#[test]
fn test_corrector_tallies() {
    let corrector = BchCorrector::new(FirstByteDecoder, BchParams::new(1));
    let cases: [([u8; 2], [u8; 2], Disposition); 4] = [
        ([0x10, 0], [0x10, 2], Disposition::WriteBack),
        ([0x11, 0], [0x10, 2], Disposition::WriteBack),
        ([0x13, 0], [0x10, 2], Disposition::WriteBack),
        ([0xEF, 0], [0x10, 2], Disposition::Keep),
    ];

    for (index, (mut data, mut ecc, disposition)) in cases.into_iter().enumerate() {
        let mut codeword = Codeword {
            page: 7,
            index: index as u32,
            data_offset: 0,
            ecc_offset: 2,
            data: &mut data,
            ecc: &mut ecc,
            writable: true,
        };
        assert_eq!(corrector.handle(&mut codeword), disposition);
    }

    let summary = corrector.report().summary(1);
    assert_eq!(
        summary,
        EccSummary {
            processed_pages: 1,
            good: 1,
            corrected: 2,
            uncorrectable: 1,
            bitflips: 3,
        }
    );
    assert_eq!(summary.codewords(), 4);
}

#[test]
fn test_summary_report() {
    let summary = EccSummary {
        processed_pages: 16,
        good: 2,
        corrected: 1,
        uncorrectable: 1,
        bitflips: 5,
    };
    let text = summary.to_string();
    assert!(text.starts_with("ECC Report:\n"));
    assert!(text.contains("Processed     pages    : 0x00000010 |         16"));
    assert!(text.contains("Good          codewords: 0x00000002 |          2 [50.00%]"));
    assert!(text.contains("[25.00%] corrected bitflips 0x00000005 (5)"));
    assert!(text.ends_with("Uncorrectable codewords: 0x00000001 |          1 [25.00%]"));

    // No codewords at all must not divide by zero
    assert!(EccSummary::default().to_string().contains("[ 0.00%]"));
}

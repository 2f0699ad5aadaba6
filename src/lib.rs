//! Recovery of raw NAND flash captures: page structure descriptions, memory-mapped dumps, and the
//! ECC correction engine that walks a dump codeword by codeword.

pub mod ecc;
pub mod nand;
pub mod util;

//! Useful traits and other utilities that don't really belong anywhere else.

use std::mem::size_of;

pub trait InvertExt {
    /// Complement every bit in place.
    ///
    /// Some chips store bits with the opposite physical convention; complementing twice restores
    /// the original contents exactly.
    fn invert(&mut self);
}

impl InvertExt for [u8] {
    fn invert(&mut self) {
        const WORD: usize = size_of::<usize>();

        let mut words = self.chunks_exact_mut(WORD);
        for word in &mut words {
            let value = !usize::from_ne_bytes(word.try_into().unwrap());
            word.copy_from_slice(&value.to_ne_bytes());
        }

        for byte in words.into_remainder() {
            *byte = !*byte;
        }
    }
}

#[cfg(test)]
fn invert_bytewise(buf: &mut [u8]) {
    for byte in buf {
        *byte ^= 0xFF;
    }
}

#[test]
fn test_invert_matches_bytewise() {
    let pattern: Vec<u8> = (0..64u32).map(|i| (i * 37 + 11) as u8).collect();

    // Every length 0..=17 at every alignment within a word
    for start in 0..size_of::<usize>() {
        for len in 0..=17 {
            let mut fast = pattern.clone();
            let mut slow = pattern.clone();
            fast[start..start + len].invert();
            invert_bytewise(&mut slow[start..start + len]);
            assert_eq!(fast, slow, "start {start}, len {len}");
        }
    }
}

#[test]
fn test_invert_twice_restores() {
    let original: Vec<u8> = (0..40u32).map(|i| (i * 91) as u8).collect();

    for start in 0..8 {
        for len in 0..=17 {
            let mut buf = original.clone();
            buf[start..start + len].invert();
            if len > 0 {
                assert_ne!(buf, original);
            }
            buf[start..start + len].invert();
            assert_eq!(buf, original, "start {start}, len {len}");
        }
    }
}

#[test]
fn test_invert_known_values() {
    let mut buf = [0x00, 0xFF, 0xA5, 0x0F, 0x12, 0x34, 0x56, 0x78, 0x9A];
    buf.invert();
    assert_eq!(buf, [0xFF, 0x00, 0x5A, 0xF0, 0xED, 0xCB, 0xA9, 0x87, 0x65]);
}

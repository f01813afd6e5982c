//! CRC32C in the on-disk convention: Castagnoli polynomial, byte-wise
//! reflected, caller-supplied seed, no final XOR.

use crc::{Algorithm, Crc};

/// CRC-32C without the customary output inversion.  The superblock stores
/// the raw register value, so `xorout` is zero here and the seed is passed
/// explicitly by the caller.
const CRC32C_DISK: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x1EDC6F41,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0x1CF96D7C,
    residue: 0,
};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC32C_DISK);

/// Continue a CRC32C over `data` from the register value `seed`.
///
/// The on-disk convention seeds with `0xFFFF_FFFF` and never applies a
/// final XOR, so the result of one call can be fed back in as the seed of
/// the next.
pub fn crc32c(seed: u32, data: &[u8]) -> u32 {
    // digest_with_initial() applies the algorithm's input reflection to the
    // value it is given; pre-reverse so `seed` lands in the register verbatim.
    let mut digest = CRC32C.digest_with_initial(seed.reverse_bits());
    digest.update(data);
    digest.finalize()
}

/// Length of the superblock checksum window for a given block size: the
/// remainder of the block after the 1024-byte boot area, or a whole block
/// when the block size does not reach past it.
pub fn sb_checksum_len(block_size: u32) -> u32 {
    if block_size > 1024 {
        block_size - 1024
    } else {
        block_size
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_crc32c_check_vector() {
        // Standard CRC-32C of "123456789" is 0xE3069283 after the final
        // inversion; the raw register convention used on disk omits it.
        assert_eq!(crc32c(!0, b"123456789"), 0xE3069283 ^ 0xFFFF_FFFF);
    }

    #[test]
    fn test_crc32c_empty() {
        assert_eq!(crc32c(!0, b""), !0);
        assert_eq!(crc32c(0x1234_5678, b""), 0x1234_5678);
    }

    #[test]
    fn test_crc32c_seed_chaining() {
        let whole = crc32c(!0, b"hello world");
        let chained = crc32c(crc32c(!0, b"hello "), b"world");
        assert_eq!(whole, chained);
    }

    #[test]
    fn test_sb_checksum_len() {
        assert_eq!(sb_checksum_len(4096), 3072);
        assert_eq!(sb_checksum_len(2048), 1024);
        assert_eq!(sb_checksum_len(512), 512);
    }
}

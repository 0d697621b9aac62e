//! Morton encoding (Z-order curve) for tile addressing

/// Spread bits of a 16-bit integer into every second bit of a 32-bit integer
fn spread_bits(x: u32) -> u32 {
    let mut x = x & 0xffff; // 16 bits max
    x = (x | (x << 8)) & 0x00ff00ff;
    x = (x | (x << 4)) & 0x0f0f0f0f;
    x = (x | (x << 2)) & 0x33333333;
    x = (x | (x << 1)) & 0x55555555;
    x
}

/// Compact every second bit of a 32-bit integer into a 16-bit integer
fn compact_bits(x: u32) -> u32 {
    let mut x = x & 0x55555555;
    x = (x | (x >> 1)) & 0x33333333;
    x = (x | (x >> 2)) & 0x0f0f0f0f;
    x = (x | (x >> 4)) & 0x00ff00ff;
    x = (x | (x >> 8)) & 0x0000ffff;
    x
}

/// Encode 2D coordinates into Morton code (Z-order curve).
/// `x` occupies the even bits, `y` the odd bits; each coordinate can be up to 16 bits.
pub fn encode_morton_2d(x: u32, y: u32) -> u32 {
    spread_bits(x) | (spread_bits(y) << 1)
}

/// Decode Morton code back to 2D coordinates
pub fn decode_morton_2d(code: u32) -> (u32, u32) {
    (compact_bits(code), compact_bits(code >> 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for x in [0, 1, 7, 100, 1023, 65535] {
            for y in [0, 1, 7, 100, 1023, 65535] {
                let code = encode_morton_2d(x, y);
                assert_eq!(decode_morton_2d(code), (x, y), "Failed for ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_ordering() {
        // Morton codes should interleave bits, x first
        assert_eq!(encode_morton_2d(0, 0), 0);
        assert_eq!(encode_morton_2d(1, 0), 1);
        assert_eq!(encode_morton_2d(0, 1), 2);
        assert_eq!(encode_morton_2d(1, 1), 3);
        assert_eq!(encode_morton_2d(2, 0), 4);
        assert_eq!(encode_morton_2d(3, 3), 15);
    }
}

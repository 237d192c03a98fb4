// Low-level bit operations.

use std::sync::LazyLock;

// Native endianness is probed once; all converters below are a byte
// reverse on little-endian hosts and the identity on big-endian hosts.
static NATIVE_BIG_ENDIAN: LazyLock<bool> =
    LazyLock::new(|| u32::from_ne_bytes([0x00, 0x00, 0x00, 0x01]) == 1);

/// Finds the last (most significant) bit set.
/// fls(0) = 0, fls(1) = 1, fls(0x8000_0000) = 32, i.e. bits are numbered
/// from one upwards.
pub fn fls(x: u64) -> u32 {
    if x == 0 {
        return 0;
    }
    64 - x.leading_zeros()
}

/// Largest power of two dividing `x & y`, or zero when the two bit sets
/// share no bits. Used to find the best link width / speed supported by
/// both ends of a link.
pub fn max_pow2_divisor(x: u64, y: u64) -> u64 {
    let common = x & y;
    if common == 0 {
        return 0;
    }
    1 << (fls(common) - 1)
}

/// Converts a u16 from host byte order to network byte order.
pub fn htons(x: u16) -> u16 {
    if *NATIVE_BIG_ENDIAN {
        x
    } else {
        x.swap_bytes()
    }
}

/// Converts a u16 from network byte order to host byte order.
pub fn ntohs(x: u16) -> u16 {
    htons(x)
}

/// Converts a u32 from host byte order to network byte order.
pub fn htonl(x: u32) -> u32 {
    if *NATIVE_BIG_ENDIAN {
        x
    } else {
        x.swap_bytes()
    }
}

/// Converts a u32 from network byte order to host byte order.
pub fn ntohl(x: u32) -> u32 {
    htonl(x)
}

/// Converts a u64 from host byte order to network byte order.
pub fn htonll(x: u64) -> u64 {
    if *NATIVE_BIG_ENDIAN {
        x
    } else {
        x.swap_bytes()
    }
}

/// Converts a u64 from network byte order to host byte order.
pub fn ntohll(x: u64) -> u64 {
    htonll(x)
}

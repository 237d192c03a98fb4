#[cfg(test)]
mod bitops_tests {
    use fabricmon::bitops;

    #[test]
    fn ntoh_hton_round_trip() {
        let _ = env_logger::try_init();

        for _ in 0..1000 {
            let v64: u64 = rand::random();
            let v32: u32 = rand::random();
            let v16: u16 = rand::random();

            assert_eq!(bitops::ntohs(bitops::htons(v16)), v16);
            assert_eq!(bitops::ntohl(bitops::htonl(v32)), v32);
            assert_eq!(bitops::ntohll(bitops::htonll(v64)), v64);

            if cfg!(target_endian = "big") {
                assert_eq!(bitops::htons(v16), v16);
                assert_eq!(bitops::htonl(v32), v32);
                assert_eq!(bitops::htonll(v64), v64);
            } else {
                assert_eq!(bitops::htons(v16), v16.swap_bytes());
                assert_eq!(bitops::htonl(v32), v32.swap_bytes());
                assert_eq!(bitops::htonll(v64), v64.swap_bytes());
            }
        }
    }

    #[test]
    fn fls_bit_numbering() {
        assert_eq!(bitops::fls(0), 0);
        assert_eq!(bitops::fls(1), 1);
        assert_eq!(bitops::fls(0x8000_0000), 32);
        assert_eq!(bitops::fls(u64::MAX), 64);
    }

    #[test]
    fn max_pow2_divisor_laws() {
        let _ = env_logger::try_init();

        // Concrete values
        assert_eq!(bitops::max_pow2_divisor(0b111, 0b011), 2);
        assert_eq!(bitops::max_pow2_divisor(0b1000, 0b0111), 0);
        assert_eq!(bitops::max_pow2_divisor(0b1101, 0b0011), 1);

        for _ in 0..1000 {
            let x = rand::random::<u64>();
            let y = rand::random::<u64>();
            let d = bitops::max_pow2_divisor(x, y);

            // Symmetry
            assert_eq!(d, bitops::max_pow2_divisor(y, x));

            // Zero exactly when the bit sets are disjoint
            assert_eq!(d == 0, x & y == 0);

            // A power of two that divides the common bits
            if d != 0 {
                assert!(d.is_power_of_two());
                assert_eq!((x & y) % d, 0);
            }
        }
    }
}

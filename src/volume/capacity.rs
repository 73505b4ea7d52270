//! Capacity display helpers

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Round a capacity down to the largest readable unit.
///
/// GiB is used when the size holds at least ten of them, otherwise MiB under
/// the same rule, otherwise the exact byte count. Small fluctuations in what a
/// filesystem reports therefore do not change the published size.
pub fn round_down_capacity_pretty(capacity_bytes: u64) -> u64 {
    for unit in [GIB, MIB] {
        if capacity_bytes / unit >= 10 {
            return (capacity_bytes / unit) * unit;
        }
    }
    capacity_bytes
}

/// Format bytes as a canonical binary-SI quantity ("100Ki", "10Gi", "12345")
pub fn binary_quantity(bytes: u64) -> Quantity {
    const SUFFIXES: [&str; 7] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

    let mut value = bytes;
    let mut exponent = 0;
    while value != 0 && value % 1024 == 0 && exponent < SUFFIXES.len() - 1 {
        value /= 1024;
        exponent += 1;
    }
    Quantity(format!("{}{}", value, SUFFIXES[exponent]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIB: u64 = 1024 * GIB;

    #[test]
    fn test_round_down_capacity_pretty() {
        let cases = [
            (100 * KIB, 100 * KIB),
            (10 * GIB + 5, 10 * GIB),
            (10000 * MIB - 1, 9999 * MIB),
            (13 * GIB - 1, 12 * GIB),
            (63 * MIB - 10, 62 * MIB),
            (12345, 12345),
            (9 * GIB + 999 * MIB, 9 * GIB + 999 * MIB),
            (3 * TIB + 2 * GIB + 1 * MIB, 3 * TIB + 2 * GIB),
        ];
        for (input, expected) in cases {
            assert_eq!(
                round_down_capacity_pretty(input),
                expected,
                "rounding {}",
                input
            );
        }
    }

    #[test]
    fn test_binary_quantity() {
        assert_eq!(binary_quantity(100 * KIB).0, "100Ki");
        assert_eq!(binary_quantity(10 * GIB).0, "10Gi");
        assert_eq!(binary_quantity(9999 * MIB).0, "9999Mi");
        assert_eq!(binary_quantity(12345).0, "12345");
        assert_eq!(binary_quantity(0).0, "0");
        assert_eq!(binary_quantity(3 * TIB + 2 * GIB).0, "3074Gi");
    }
}

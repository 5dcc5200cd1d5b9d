use snafu::{ensure, Snafu};

/// Requests are aligned to this sector size so lvm never has to round an
/// odd byte count itself.
pub const MINIMUM_SECTOR_SIZE: i64 = 4096;

/// Historical default volume size when a request carries neither a
/// required size nor a limit.
pub const DEFAULT_SIZE: i64 = 1 << 30;

/// Errors mirroring the CSI `CapacityRange` contract.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    #[snafu(display("required capacity must not be negative"))]
    NegativeRequired,
    #[snafu(display("capacity limit must not be negative"))]
    NegativeLimit,
    #[snafu(display("required capacity exceeds the limit"))]
    RequestExceedsLimit,
    #[snafu(display("requested capacity rounds to zero within the limit"))]
    RoundingToZero,
}

/// Round `size` up to the nearest multiple of `multiple`.
pub fn round_up(size: i64, multiple: i64) -> i64 {
    ((size + multiple - 1) / multiple) * multiple
}

/// Convert a CSI capacity range into the exact byte count to request.
///
/// A `required` of zero means "any size up to the limit": the default of
/// 1 GiB is used, capped by the limit and rounded down to the sector size
/// so the result never exceeds the limit. An explicit `required` is
/// rounded up to the sector size and must still fit below the limit.
pub fn convert_request_capacity(required: i64, limit: i64) -> Result<i64, CapacityError> {
    ensure!(required >= 0, NegativeRequiredSnafu);
    ensure!(limit >= 0, NegativeLimitSnafu);
    ensure!(limit == 0 || required <= limit, RequestExceedsLimitSnafu);

    if required == 0 {
        if limit == 0 {
            return Ok(DEFAULT_SIZE);
        }
        let capacity = DEFAULT_SIZE.min(limit);
        let capacity = capacity - capacity % MINIMUM_SECTOR_SIZE;
        ensure!(capacity > 0, RoundingToZeroSnafu);
        return Ok(capacity);
    }

    let out = round_up(required, MINIMUM_SECTOR_SIZE);
    ensure!(limit == 0 || out <= limit, RoundingToZeroSnafu);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_capacity_ranges() {
        let cases: &[(i64, i64, Result<i64, CapacityError>)] = &[
            (-1, 10, Err(CapacityError::NegativeRequired)),
            (10, -1, Err(CapacityError::NegativeLimit)),
            (20, 10, Err(CapacityError::RequestExceedsLimit)),
            // the rounded request no longer fits below the limit
            ((1 << 30) + 1, (1 << 30) + 1, Err(CapacityError::RoundingToZero)),
            (0, MINIMUM_SECTOR_SIZE - 1, Err(CapacityError::RoundingToZero)),
            (0, MINIMUM_SECTOR_SIZE + 1, Ok(MINIMUM_SECTOR_SIZE)),
            (1, MINIMUM_SECTOR_SIZE * 2, Ok(MINIMUM_SECTOR_SIZE)),
            (0, 2 << 30, Ok(1 << 30)),
            (1, 0, Ok(MINIMUM_SECTOR_SIZE)),
            (1 << 30, 1 << 30, Ok(1 << 30)),
            (0, 0, Ok(1 << 30)),
        ];
        for (required, limit, expected) in cases {
            assert_eq!(
                convert_request_capacity(*required, *limit),
                *expected,
                "request:{required} limit:{limit}"
            );
        }
    }

    #[test]
    fn conversion_is_idempotent() {
        for (required, limit) in [(0, 0), (1, 0), (0, 2 << 30), (123, 456 << 20)] {
            let converted = convert_request_capacity(required, limit).unwrap();
            assert_eq!(
                convert_request_capacity(converted, converted).unwrap(),
                converted
            );
        }
    }

    #[test]
    fn rounds_up_to_multiples() {
        assert_eq!(round_up(12, 4), 12);
        assert_eq!(round_up(11, 4), 12);
        assert_eq!(round_up(13, 4), 16);
        assert_eq!(round_up(0, 4), 0);
    }
}

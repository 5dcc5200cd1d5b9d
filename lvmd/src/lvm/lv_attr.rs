//! Parsing of the ten character `lv_attr` string reported by `lvs -o
//! lv_attr`, see lvs(8). The attribute record is a complete decoding of
//! every position, which allows logic to be attached to the state of an
//! LV, e.g. determining whether it is a thin pool or whether I/O is
//! currently permitted at all.

use crate::lvm::error::{Error, UnhealthySnafu};
use snafu::ensure;
use std::{fmt, str::FromStr};

macro_rules! attr_code {
    ($(#[$meta:meta])* $name:ident, $field:literal, { $($variant:ident = $code:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant,)+
        }
        impl $name {
            /// The lvs(8) code for this value.
            pub fn as_char(&self) -> char {
                match self {
                    $(Self::$variant => $code,)+
                }
            }
            pub(crate) fn parse(code: char) -> Result<Self, Error> {
                match code {
                    $($code => Ok(Self::$variant),)+
                    _ => Err(Error::UnknownAttrCode { field: $field, code }),
                }
            }
        }
    };
}

attr_code! {
    /// Position 1, the volume type.
    VolumeType, "volume type", {
        Mirrored = 'm',
        MirroredNoInitialSync = 'M',
        Origin = 'o',
        OriginWithMergingSnapshot = 'O',
        Raid = 'r',
        RaidNoInitialSync = 'R',
        Snapshot = 's',
        MergingSnapshot = 'S',
        PvMove = 'p',
        Virtual = 'v',
        MirrorOrRaidImage = 'i',
        MirrorOrRaidImageOutOfSync = 'I',
        MirrorLogDevice = 'l',
        UnderConversion = 'c',
        ThinVolume = 'V',
        ThinPool = 't',
        ThinPoolData = 'T',
        ThinPoolMetadata = 'e',
        None = '-',
    }
}

attr_code! {
    /// Position 2, the volume permissions.
    Permissions, "permissions", {
        Writeable = 'w',
        ReadOnly = 'r',
        ReadOnlyActivation = 'R',
        None = '-',
    }
}

attr_code! {
    /// Position 3, the allocation policy, capitalised while locked.
    AllocationPolicy, "allocation policy", {
        Anywhere = 'a',
        AnywhereLocked = 'A',
        Contiguous = 'c',
        ContiguousLocked = 'C',
        Inherited = 'i',
        InheritedLocked = 'I',
        Cling = 'l',
        ClingLocked = 'L',
        Normal = 'n',
        NormalLocked = 'N',
        None = '-',
    }
}

attr_code! {
    /// Position 4, whether the volume has a fixed minor number.
    Minor, "fixed minor", {
        True = 'm',
        False = '-',
    }
}

attr_code! {
    /// Position 5, the device mapper state of the volume.
    State, "state", {
        Active = 'a',
        Suspended = 's',
        InvalidSnapshot = 'I',
        SuspendedSnapshot = 'S',
        SnapshotMergeFailed = 'm',
        SuspendedSnapshotMergeFailed = 'M',
        MappedDevicePresentWithoutTables = 'd',
        MappedDevicePresentWithInactiveTables = 'i',
        ThinPoolCheckNeeded = 'c',
        SuspendedThinPoolCheckNeeded = 'C',
        Historical = 'h',
        Unknown = 'X',
        None = '-',
    }
}

attr_code! {
    /// Position 6, whether the device is open.
    Open, "open", {
        True = 'o',
        False = '-',
        Unknown = 'X',
    }
}

attr_code! {
    /// Position 7, the device mapper target in use.
    OpenTarget, "target type", {
        Cache = 'C',
        Mirror = 'm',
        Raid = 'r',
        Snapshot = 's',
        Thin = 't',
        Unknown = 'u',
        Virtual = 'v',
        None = '-',
    }
}

attr_code! {
    /// Position 8, whether newly allocated data blocks are zeroed.
    Zero, "zero", {
        True = 'z',
        False = '-',
    }
}

attr_code! {
    /// Position 9, the volume health indicator.
    VolumeHealth, "volume health", {
        PartialActivation = 'p',
        Unknown = 'X',
        Missing = '-',
        RefreshNeeded = 'r',
        MismatchesExist = 'm',
        WriteMostly = 'w',
        Reshaping = 's',
        ReshapeRemoved = 'R',
        ThinFailed = 'F',
        OutOfDataSpace = 'D',
        MetadataReadOnly = 'M',
        WriteCacheError = 'E',
    }
}

attr_code! {
    /// Position 10, whether activation of the volume is skipped.
    SkipActivation, "skip activation", {
        Skip = 'k',
        None = '-',
    }
}

/// The fully decoded `lv_attr` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LvAttr {
    pub volume_type: VolumeType,
    pub permissions: Permissions,
    pub allocation_policy: AllocationPolicy,
    pub minor: Minor,
    pub state: State,
    pub open: Open,
    pub open_target: OpenTarget,
    pub zero: Zero,
    pub volume_health: VolumeHealth,
    pub skip_activation: SkipActivation,
}

impl FromStr for LvAttr {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let codes: Vec<char> = raw.chars().collect();
        ensure!(
            codes.len() == 10,
            crate::lvm::error::InvalidLvAttrSnafu { raw }
        );
        Ok(Self {
            volume_type: VolumeType::parse(codes[0])?,
            permissions: Permissions::parse(codes[1])?,
            allocation_policy: AllocationPolicy::parse(codes[2])?,
            minor: Minor::parse(codes[3])?,
            state: State::parse(codes[4])?,
            open: Open::parse(codes[5])?,
            open_target: OpenTarget::parse(codes[6])?,
            zero: Zero::parse(codes[7])?,
            volume_health: VolumeHealth::parse(codes[8])?,
            skip_activation: SkipActivation::parse(codes[9])?,
        })
    }
}

impl fmt::Display for LvAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}{}{}{}{}{}",
            self.volume_type.as_char(),
            self.permissions.as_char(),
            self.allocation_policy.as_char(),
            self.minor.as_char(),
            self.state.as_char(),
            self.open.as_char(),
            self.open_target.as_char(),
            self.zero.as_char(),
            self.volume_health.as_char(),
            self.skip_activation.as_char(),
        )
    }
}

impl LvAttr {
    /// Check the health of the logical volume based on its attributes,
    /// mainly the health indicator interpreted against the volume type.
    ///
    /// The rules are evaluated in order and the first match wins, so a
    /// thin pool which is both out of data space and suspended reports
    /// the data space condition.
    pub fn verify_health(&self) -> Result<(), Error> {
        match self.volume_health {
            VolumeHealth::PartialActivation => {
                return UnhealthySnafu {
                    reason: "partial activation, one or more physical volumes are missing",
                }
                .fail();
            }
            VolumeHealth::Unknown => {
                return UnhealthySnafu {
                    reason: "unknown volume health, verification on the host is required",
                }
                .fail();
            }
            VolumeHealth::WriteCacheError => {
                return UnhealthySnafu {
                    reason: "dm-writecache reports an error",
                }
                .fail();
            }
            _ => {}
        }

        if self.volume_type == VolumeType::ThinPool {
            match self.volume_health {
                VolumeHealth::ThinFailed => {
                    return UnhealthySnafu {
                        reason: "thin pool has failed and no further I/O is permitted",
                    }
                    .fail();
                }
                VolumeHealth::OutOfDataSpace => {
                    return UnhealthySnafu {
                        reason: "thin pool is out of data space",
                    }
                    .fail();
                }
                VolumeHealth::MetadataReadOnly => {
                    return UnhealthySnafu {
                        reason: "thin pool metadata is read only",
                    }
                    .fail();
                }
                _ => {}
            }
        }

        if self.volume_type == VolumeType::ThinVolume
            && self.volume_health == VolumeHealth::ThinFailed
        {
            return UnhealthySnafu {
                reason: "the underlying thin pool entered a failed state and no further I/O is permitted",
            }
            .fail();
        }

        if matches!(
            self.volume_type,
            VolumeType::Raid | VolumeType::RaidNoInitialSync
        ) {
            match self.volume_health {
                VolumeHealth::RefreshNeeded => {
                    return UnhealthySnafu {
                        reason: "RAID volume requires a refresh",
                    }
                    .fail();
                }
                VolumeHealth::MismatchesExist => {
                    return UnhealthySnafu {
                        reason: "RAID volume has portions of the array which are not coherent",
                    }
                    .fail();
                }
                VolumeHealth::Reshaping => {
                    return UnhealthySnafu {
                        reason: "RAID volume is currently reshaping",
                    }
                    .fail();
                }
                VolumeHealth::ReshapeRemoved => {
                    return UnhealthySnafu {
                        reason: "RAID volume signifies freed raid images after reshaping",
                    }
                    .fail();
                }
                VolumeHealth::WriteMostly => {
                    return UnhealthySnafu {
                        reason: "RAID volume is marked write-mostly",
                    }
                    .fail();
                }
                _ => {}
            }
        }

        match self.state {
            State::Suspended | State::SuspendedSnapshot => {
                return UnhealthySnafu {
                    reason: "volume is suspended, no I/O is permitted",
                }
                .fail();
            }
            State::InvalidSnapshot => {
                return UnhealthySnafu {
                    reason: "volume is an invalid snapshot, no I/O is permitted",
                }
                .fail();
            }
            State::SnapshotMergeFailed | State::SuspendedSnapshotMergeFailed => {
                return UnhealthySnafu {
                    reason: "snapshot merge failed, no I/O is permitted",
                }
                .fail();
            }
            State::MappedDevicePresentWithInactiveTables => {
                return UnhealthySnafu {
                    reason: "mapped device present with inactive tables, no I/O is permitted",
                }
                .fail();
            }
            State::MappedDevicePresentWithoutTables => {
                return UnhealthySnafu {
                    reason: "mapped device present without tables, no I/O is permitted",
                }
                .fail();
            }
            State::ThinPoolCheckNeeded | State::SuspendedThinPoolCheckNeeded => {
                return UnhealthySnafu {
                    reason: "a thin pool check is needed",
                }
                .fail();
            }
            State::Unknown => {
                return UnhealthySnafu {
                    reason: "unknown volume state, verification on the host is required",
                }
                .fail();
            }
            State::Historical => {
                return UnhealthySnafu {
                    reason: "historical volume state, the volume no longer exists",
                }
                .fail();
            }
            _ => {}
        }

        if self.open == Open::Unknown {
            return UnhealthySnafu {
                reason: "underlying device state is unknown, verification on the host is required",
            }
            .fail();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raid_without_initial_sync() {
        let attr: LvAttr = "Rwi-a-r---".parse().unwrap();
        assert_eq!(
            attr,
            LvAttr {
                volume_type: VolumeType::RaidNoInitialSync,
                permissions: Permissions::Writeable,
                allocation_policy: AllocationPolicy::Inherited,
                minor: Minor::False,
                state: State::Active,
                open: Open::False,
                open_target: OpenTarget::Raid,
                zero: Zero::False,
                volume_health: VolumeHealth::Missing,
                skip_activation: SkipActivation::None,
            }
        );
    }

    #[test]
    fn parses_thin_pool_with_zeroing() {
        let attr: LvAttr = "twi-a-tz--".parse().unwrap();
        assert_eq!(attr.volume_type, VolumeType::ThinPool);
        assert_eq!(attr.permissions, Permissions::Writeable);
        assert_eq!(attr.allocation_policy, AllocationPolicy::Inherited);
        assert_eq!(attr.minor, Minor::False);
        assert_eq!(attr.state, State::Active);
        assert_eq!(attr.open, Open::False);
        assert_eq!(attr.open_target, OpenTarget::Thin);
        assert_eq!(attr.zero, Zero::True);
        assert_eq!(attr.volume_health, VolumeHealth::Missing);
    }

    #[test]
    fn round_trips_well_formed_input() {
        for raw in [
            "Rwi-a-r---",
            "twi-a-tz--",
            "Vwi-a-tz-k",
            "swi-a-s---",
            "-wi-ao----",
            "mwi-s-m-p-",
            "twi-a-tzD-",
        ] {
            let attr: LvAttr = raw.parse().unwrap();
            assert_eq!(attr.to_string(), raw);
        }
    }

    #[test]
    fn rejects_invalid_length() {
        assert!(matches!(
            "twi-a-tz-".parse::<LvAttr>(),
            Err(Error::InvalidLvAttr { .. })
        ));
        assert!(matches!(
            "twi-a-tz---".parse::<LvAttr>(),
            Err(Error::InvalidLvAttr { .. })
        ));
    }

    #[test]
    fn rejects_unknown_codes() {
        assert!(matches!(
            "qwi-a-tz--".parse::<LvAttr>(),
            Err(Error::UnknownAttrCode {
                field: "volume type",
                code: 'q'
            })
        ));
    }

    #[test]
    fn healthy_volume_passes() {
        let attr: LvAttr = "-wi-ao----".parse().unwrap();
        assert!(attr.verify_health().is_ok());
    }

    #[test]
    fn out_of_data_space_beats_suspended() {
        // both position 5 (suspended) and position 9 (out of data space)
        // are bad, the pool condition must win
        let attr: LvAttr = "twi-s-tzD-".parse().unwrap();
        let reason = attr.verify_health().unwrap_err().to_string();
        assert!(reason.contains("out of data space"), "{reason}");
    }

    #[test]
    fn suspended_state_is_reported() {
        let attr: LvAttr = "-wi-s-----".parse().unwrap();
        let reason = attr.verify_health().unwrap_err().to_string();
        assert!(reason.contains("suspended"), "{reason}");
    }

    #[test]
    fn thin_failed_on_thin_volume() {
        let attr: LvAttr = "Vwi-a-t-F-".parse().unwrap();
        let reason = attr.verify_health().unwrap_err().to_string();
        assert!(reason.contains("thin pool entered a failed state"), "{reason}");
    }

    #[test]
    fn raid_refresh_needed() {
        let attr: LvAttr = "rwi-a-r-r-".parse().unwrap();
        let reason = attr.verify_health().unwrap_err().to_string();
        assert!(reason.contains("requires a refresh"), "{reason}");
    }

    #[test]
    fn open_unknown_is_last_resort() {
        let attr: LvAttr = "-wi-aX----".parse().unwrap();
        let reason = attr.verify_health().unwrap_err().to_string();
        assert!(reason.contains("underlying device state"), "{reason}");
    }
}

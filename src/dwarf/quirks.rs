//! Known bugs of CFI producers.
//!
//! ARM's RealView compilers emit CFA offsets that do not follow DWARF: in
//! version 1 CIEs `DW_CFA_def_cfa` and `DW_CFA_def_cfa_offset` take factored
//! offsets, and the CFA is computed by subtracting the offset instead of
//! adding it. Later versions fixed this, as announced by a `+` after the
//! `armcc` augmentation.

use super::parse::Cie;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quirks {
    /// CFA offsets are multiplied by the data alignment factor.
    pub cfa_offsets_factored: bool,
    /// CFA = register - offset.
    pub cfa_offsets_reversed: bool,
}

const REALVIEW_PRODUCERS: [&str; 6] = [
    "ARM C Compiler, ADS",
    "Thumb C Compiler, ADS",
    "ARM C++ Compiler, ADS",
    "Thumb C++ Compiler, ADS",
    "ARM/Thumb C/C++ Compiler, RVCT",
    "ARM C/C++ Compiler, RVCT",
];

pub fn producer_is_realview(producer: &str) -> bool {
    REALVIEW_PRODUCERS
        .iter()
        .any(|prefix| producer.starts_with(prefix))
}

/// The quirks to apply to the CFI of `cie`, given the producer of the
/// compilation unit the FDE belongs to.
pub fn producer_quirks(producer: Option<&str>, cie: &Cie<'_>) -> Quirks {
    if !producer.is_some_and(producer_is_realview) {
        return Quirks::default();
    }

    match cie.version {
        1 => Quirks {
            cfa_offsets_factored: true,
            cfa_offsets_reversed: true,
        },
        3 => {
            let fixed = cie
                .augmentation
                .strip_prefix("armcc")
                .is_some_and(|rest| rest.contains('+'));
            Quirks {
                cfa_offsets_factored: false,
                cfa_offsets_reversed: !fixed,
            }
        }
        _ => Quirks::default(),
    }
}
